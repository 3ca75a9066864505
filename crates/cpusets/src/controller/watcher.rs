use std::collections::HashSet;
use std::error::Error as StdError;
use std::io;
use std::sync::Arc;

use error_stack::Report;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::core::ErrorResponse;
use kube::runtime::watcher;
use kube::runtime::watcher::Config;
use kube::runtime::watcher::Event;
use kube::Api;
use kube::Client;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::work_queue::WorkQueue;
use super::PodKey;
use crate::k8s::pod;
use crate::k8s::KubernetesError;

/// Feeds the work queue with pods scheduled to this node.
///
/// Every pod UID is queued once, on its first sighting. Deleted pods are
/// forgotten so that a re-created pod with the same UID would be queued again.
pub(crate) struct PodWatcher {
    client: Client,
    node_name: String,
}

impl PodWatcher {
    pub(crate) fn new(client: Client, node_name: impl Into<String>) -> Self {
        Self {
            client,
            node_name: node_name.into(),
        }
    }

    /// Watches pods until `token` is cancelled.
    ///
    /// Expired or gone watches are re-established transparently. Any other
    /// watch error cancels `token`, shutting the whole agent down.
    ///
    /// # Errors
    ///
    /// - [`KubernetesError::WatchFailed`] on a non-recoverable watch error
    #[tracing::instrument(skip(self, queue, token), fields(node_name = %self.node_name))]
    pub(crate) async fn run(
        &self,
        queue: Arc<WorkQueue<PodKey>>,
        token: CancellationToken,
    ) -> Result<(), Report<KubernetesError>> {
        info!("Starting pod watcher");
        let api: Api<Pod> = Api::all(self.client.clone());
        let config = Config::default().fields(&format!("spec.nodeName={}", self.node_name));
        let mut stream = watcher(api, config).boxed();
        let mut intake = PodIntake::default();

        let result = loop {
            let event = select! {
                _ = token.cancelled() => {
                    info!("Pod watcher shutdown requested");
                    break Ok(());
                }
                event = stream.next() => event,
            };

            match event {
                Some(Ok(event)) => {
                    for key in intake.handle_event(event) {
                        debug!(
                            pod = %key.name,
                            namespace = %key.namespace,
                            pending = queue.len(),
                            "Queueing pod"
                        );
                        if !queue.add(key).await {
                            debug!("Work queue rejected pod, already pending or shutting down");
                        }
                    }
                }
                Some(Err(e)) if is_transient(&e) => {
                    warn!("Pod watch interrupted, re-establishing: {e}");
                }
                Some(Err(e)) => {
                    error!("Pod watch failed, shutting down: {e}");
                    token.cancel();
                    break Err(Report::new(KubernetesError::WatchFailed {
                        message: e.to_string(),
                    }));
                }
                None => {
                    warn!("Pod watch stream ended");
                    token.cancel();
                    break Err(Report::new(KubernetesError::WatchFailed {
                        message: "watch stream ended".to_string(),
                    }));
                }
            }
        };

        queue.shut_down();
        result
    }
}

/// Tracks which pods have already been queued.
#[derive(Default)]
struct PodIntake {
    seen: HashSet<String>,
}

impl PodIntake {
    /// Work items produced by one watch event.
    fn handle_event(&mut self, event: Event<Pod>) -> Vec<PodKey> {
        match event {
            Event::Applied(pod) => self.observe(&pod).into_iter().collect(),
            Event::Deleted(pod) => {
                self.seen.remove(pod::uid(&pod));
                Vec::new()
            }
            Event::Restarted(pods) => {
                let listed: HashSet<&str> = pods.iter().map(pod::uid).collect();
                self.seen.retain(|uid| listed.contains(uid.as_str()));
                pods.iter().filter_map(|pod| self.observe(pod)).collect()
            }
        }
    }

    fn observe(&mut self, pod: &Pod) -> Option<PodKey> {
        let key = PodKey::from_pod(pod);
        if key.uid.is_empty() || !self.seen.insert(key.uid.clone()) {
            return None;
        }
        Some(key)
    }
}

/// Whether the watcher recovers from `err` on its own by re-listing.
///
/// Expired resource versions and dropped API server connections are
/// transient; everything else stops the agent.
fn is_transient(err: &watcher::Error) -> bool {
    match err {
        watcher::Error::WatchError(response) => is_expired(response),
        watcher::Error::InitialListFailed(e)
        | watcher::Error::WatchStartFailed(e)
        | watcher::Error::WatchFailed(e) => is_transient_client_error(e),
        _ => false,
    }
}

fn is_transient_client_error(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(response) => is_expired(response),
        // the event stream broke off mid-watch
        kube::Error::ReadEvents(_) => true,
        kube::Error::HyperError(e) => {
            e.is_closed() || e.is_incomplete_message() || e.is_canceled() || has_connection_loss(e)
        }
        kube::Error::Service(e) => has_connection_loss(e.as_ref()),
        _ => false,
    }
}

/// Looks for an I/O error caused by a lost connection in the source chain.
fn has_connection_loss(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ) {
                return true;
            }
        }
        current = err.source();
    }
    false
}

fn is_expired(response: &ErrorResponse) -> bool {
    response.code == 410 || response.reason == "Expired" || response.reason == "Gone"
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::k8s::pod::fixtures::container;
    use crate::k8s::pod::fixtures::pod;

    fn names(keys: &[PodKey]) -> Vec<&str> {
        keys.iter().map(|key| key.name.as_str()).collect()
    }

    #[test]
    fn first_sighting_is_queued_once() {
        let mut intake = PodIntake::default();
        let web = pod("web", "node-1", vec![container("app", &[])]);

        assert_eq!(names(&intake.handle_event(Event::Applied(web.clone()))), vec!["web"]);
        assert!(intake.handle_event(Event::Applied(web)).is_empty());
    }

    #[test]
    fn deleted_pod_is_forgotten() {
        let mut intake = PodIntake::default();
        let web = pod("web", "node-1", vec![container("app", &[])]);

        intake.handle_event(Event::Applied(web.clone()));
        assert!(intake.handle_event(Event::Deleted(web.clone())).is_empty());
        assert_eq!(names(&intake.handle_event(Event::Applied(web))), vec!["web"]);
    }

    #[test]
    fn restart_queues_unseen_pods_only() {
        let mut intake = PodIntake::default();
        let web = pod("web", "node-1", vec![container("app", &[])]);
        let db = pod("db", "node-1", vec![container("postgres", &[])]);
        let gone = pod("gone", "node-1", vec![container("app", &[])]);

        intake.handle_event(Event::Applied(web.clone()));
        intake.handle_event(Event::Applied(gone.clone()));

        let queued = intake.handle_event(Event::Restarted(vec![web, db]));
        assert_eq!(names(&queued), vec!["db"]);
        // dropped from the relist, so it is new again
        assert_eq!(names(&intake.handle_event(Event::Applied(gone))), vec!["gone"]);
    }

    #[test]
    fn expired_watches_are_transient() {
        let response = |code, reason: &str| ErrorResponse {
            status: "Failure".to_string(),
            message: "too old resource version".to_string(),
            reason: reason.to_string(),
            code,
        };

        assert!(is_transient(&watcher::Error::WatchError(response(410, "Expired"))));
        assert!(is_transient(&watcher::Error::WatchError(response(500, "Gone"))));
        assert!(is_transient(&watcher::Error::WatchFailed(kube::Error::Api(
            response(410, "")
        ))));
        assert!(!is_transient(&watcher::Error::WatchError(response(
            403,
            "Forbidden"
        ))));
        assert!(!is_transient(&watcher::Error::NoResourceVersion));
    }

    #[test]
    fn stream_eof_is_transient() {
        let eof = io::Error::from(io::ErrorKind::UnexpectedEof);
        assert!(is_transient(&watcher::Error::WatchFailed(
            kube::Error::ReadEvents(eof)
        )));
    }

    #[test]
    fn any_broken_event_stream_is_transient() {
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert!(is_transient(&watcher::Error::WatchFailed(
            kube::Error::ReadEvents(reset)
        )));
        let other = io::Error::new(io::ErrorKind::Other, "chunk decoding failed");
        assert!(is_transient(&watcher::Error::WatchFailed(
            kube::Error::ReadEvents(other)
        )));
    }

    #[test]
    fn connection_reset_from_service_is_transient() {
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert!(is_transient(&watcher::Error::WatchStartFailed(
            kube::Error::Service(Box::new(reset))
        )));
        let eof = io::Error::from(io::ErrorKind::UnexpectedEof);
        assert!(is_transient(&watcher::Error::InitialListFailed(
            kube::Error::Service(Box::new(eof))
        )));
    }

    #[test]
    fn other_service_errors_are_fatal() {
        let refused = io::Error::from(io::ErrorKind::PermissionDenied);
        assert!(!is_transient(&watcher::Error::WatchFailed(
            kube::Error::Service(Box::new(refused))
        )));
        assert!(!is_transient(&watcher::Error::WatchFailed(
            kube::Error::Service("certificate rejected".into())
        )));
    }
}
