//! The admission webhook agent: prepares pods for CPU pinning.

mod mutate;
mod server;

pub(crate) use mutate::CfsQuotas;
pub(crate) use mutate::PodMutator;
pub(crate) use server::TlsFiles;
pub(crate) use server::WebhookServer;

/// Default location of the process starter binary on the host.
pub const DEFAULT_PROCESS_STARTER_PATH: &str = "/opt/bin/process-starter";

#[derive(Debug, derive_more::Display)]
pub enum WebhookError {
    #[display("Failed to load TLS material from {path}")]
    TlsLoadFailed { path: String },
    #[display("Webhook server on {listen_addr} failed")]
    ServerFailed { listen_addr: String },
}

impl core::error::Error for WebhookError {}
