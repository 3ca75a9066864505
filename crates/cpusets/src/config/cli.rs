use clap::{Parser, Subcommand};
use utils::logging::LogFormat;
use utils::version;

use crate::config::agents::{ControllerArgs, DevicePluginArgs, WebhookArgs};

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "LOG_FORMAT",
        default_value = "text",
        help = "Log output format, text or json"
    )]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Pin containers of pods on this node to their pool cores
    Controller(Box<ControllerArgs>),
    /// Advertise pool cores to the kubelet as extended resources
    #[command(name = "device-plugin")]
    DevicePlugin(DevicePluginArgs),
    /// Serve the pod mutating admission webhook
    Webhook(WebhookArgs),
}
