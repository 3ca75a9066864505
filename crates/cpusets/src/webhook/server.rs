use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use json_patch::Patch;
use k8s_openapi::api::core::v1::Pod;
use kube::core::admission::AdmissionRequest;
use kube::core::admission::AdmissionResponse;
use kube::core::admission::AdmissionReview;
use kube::core::DynamicObject;
use poem::handler;
use poem::http::StatusCode;
use poem::listener::Listener;
use poem::listener::RustlsCertificate;
use poem::listener::RustlsConfig;
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::post;
use poem::web::Data;
use poem::web::Json;
use poem::Body;
use poem::Endpoint;
use poem::EndpointExt;
use poem::Request;
use poem::Route;
use poem::Server;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use super::mutate::PodMutator;
use super::WebhookError;

/// TLS material of the webhook endpoint.
#[derive(Debug, Clone)]
pub struct TlsFiles {
    pub cert: std::path::PathBuf,
    pub key: std::path::PathBuf,
}

/// HTTPS server answering pod admission reviews on `/mutating`.
pub struct WebhookServer {
    mutator: Arc<PodMutator>,
    listen_addr: String,
    tls: TlsFiles,
}

impl WebhookServer {
    pub fn new(mutator: PodMutator, listen_addr: impl Into<String>, tls: TlsFiles) -> Self {
        Self {
            mutator: Arc::new(mutator),
            listen_addr: listen_addr.into(),
            tls,
        }
    }

    /// Serves until `token` is cancelled.
    ///
    /// # Errors
    ///
    /// - [`WebhookError::TlsLoadFailed`] if the certificate or key cannot be read
    /// - [`WebhookError::ServerFailed`] if the listener fails
    pub async fn run(self, token: CancellationToken) -> Result<(), Report<WebhookError>> {
        let cert = tokio::fs::read(&self.tls.cert)
            .await
            .change_context(WebhookError::TlsLoadFailed {
                path: self.tls.cert.display().to_string(),
            })?;
        let key = tokio::fs::read(&self.tls.key)
            .await
            .change_context(WebhookError::TlsLoadFailed {
                path: self.tls.key.display().to_string(),
            })?;
        let rustls = RustlsConfig::new().fallback(RustlsCertificate::new().cert(cert).key(key));

        info!("Starting admission webhook on {}", self.listen_addr);
        let listener = TcpListener::bind(self.listen_addr.clone()).rustls(rustls);
        Server::new(listener)
            .run_with_graceful_shutdown(
                routes(self.mutator),
                async move { token.cancelled().await },
                Some(Duration::from_secs(5)),
            )
            .await
            .change_context(WebhookError::ServerFailed {
                listen_addr: self.listen_addr.clone(),
            })?;
        info!("Admission webhook stopped");
        Ok(())
    }
}

pub(crate) fn routes(mutator: Arc<PodMutator>) -> impl Endpoint {
    Route::new()
        .at("/mutating", post(mutate_pod))
        .data(mutator)
        .with(Tracing)
}

#[handler]
async fn mutate_pod(
    req: &Request,
    body: Body,
    mutator: Data<&Arc<PodMutator>>,
) -> poem::Result<Json<AdmissionReview<DynamicObject>>> {
    if req.content_type() != Some("application/json") {
        warn!(content_type = ?req.content_type(), "Rejecting admission review");
        return Err(poem::Error::from_string(
            "expected content type application/json",
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
        ));
    }

    let body = body.into_bytes().await?;
    let review: AdmissionReview<Pod> = serde_json::from_slice(&body)
        .map_err(|e| poem::Error::from_string(e.to_string(), StatusCode::BAD_REQUEST))?;
    let request: AdmissionRequest<Pod> = review
        .try_into()
        .map_err(|e: kube::core::admission::ConvertAdmissionReviewError| {
            poem::Error::from_string(e.to_string(), StatusCode::BAD_REQUEST)
        })?;

    Ok(Json(admit(&mutator, &request).into_review()))
}

/// Decides on one admission request.
pub(crate) fn admit(mutator: &PodMutator, request: &AdmissionRequest<Pod>) -> AdmissionResponse {
    let response = AdmissionResponse::from(request);
    let Some(pod) = &request.object else {
        return response;
    };
    let name = pod
        .metadata
        .name
        .as_deref()
        .or(pod.metadata.generate_name.as_deref())
        .unwrap_or_default();

    match mutator.mutate(pod) {
        Ok(patches) if patches.is_empty() => response,
        Ok(patches) => {
            info!(pod = name, patches = patches.len(), "Mutating pod");
            match response.with_patch(Patch(patches)) {
                Ok(response) => response,
                Err(e) => AdmissionResponse::from(request).deny(e.to_string()),
            }
        }
        Err(e) => {
            warn!(pod = name, "Denying pod: {e}");
            response.deny(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use poem::test::TestClient;
    use serde_json::json;
    use serde_json::Value;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::pool_config::PoolConfigLoader;
    use crate::webhook::mutate::CfsQuotas;

    fn mutator() -> Arc<PodMutator> {
        Arc::new(PodMutator::new(
            "cmss.cn",
            "/opt/bin/process-starter",
            CfsQuotas::All,
            PoolConfigLoader::new("/nonexistent", "*.yaml"),
        ))
    }

    fn review(pod: Value) -> Value {
        json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": {"group": "", "version": "v1", "kind": "Pod"},
                "resource": {"group": "", "version": "v1", "resource": "pods"},
                "name": "web",
                "namespace": "default",
                "operation": "CREATE",
                "userInfo": {"username": "admin"},
                "object": pod,
                "dryRun": false
            }
        })
    }

    fn shared_pod(annotations: Value) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "web", "namespace": "default", "annotations": annotations},
            "spec": {"containers": [{
                "name": "app",
                "image": "busybox",
                "resources": {"limits": {"cmss.cn/shared_caas": "200"}}
            }]}
        })
    }

    async fn send_review(body: Value) -> Value {
        let client = TestClient::new(routes(mutator()));
        let response = client
            .post("/mutating")
            .content_type("application/json")
            .body(body.to_string())
            .send()
            .await;
        response.assert_status_is_ok();
        let body = response.0.into_body().into_string().await.unwrap();
        serde_json::from_str(&body).unwrap()
    }

    #[test(tokio::test)]
    async fn allowed_review_carries_patch() {
        let response = send_review(review(shared_pod(json!({})))).await;

        assert_eq!(
            response["response"]["uid"],
            json!("705ab4f5-6393-11e8-b7cc-42010a800002")
        );
        assert_eq!(response["response"]["allowed"], json!(true));
        assert_eq!(response["response"]["patchType"], json!("JSONPatch"));
        assert!(!response["response"]["patch"].is_null());
    }

    #[test(tokio::test)]
    async fn invalid_annotation_is_denied() {
        let pod = shared_pod(json!({"cmss.cn/cpus": "[{\"container\": \"app\"}]"}));
        let response = send_review(review(pod)).await;

        assert_eq!(response["response"]["allowed"], json!(false));
        assert_eq!(
            response["response"]["status"]["message"],
            json!("'processes' is mandatory in annotation")
        );
    }

    #[test(tokio::test)]
    async fn wrong_content_type_is_rejected() {
        let client = TestClient::new(routes(mutator()));
        let response = client
            .post("/mutating")
            .content_type("text/plain")
            .body("{}")
            .send()
            .await;
        response.assert_status(StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[test(tokio::test)]
    async fn undecodable_body_is_rejected() {
        let client = TestClient::new(routes(mutator()));
        let response = client
            .post("/mutating")
            .content_type("application/json")
            .body("not json")
            .send()
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
    }
}
