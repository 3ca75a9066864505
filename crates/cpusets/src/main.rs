mod allocation;
mod annotation;
mod app;
mod cgroup;
mod checkpoint;
mod config;
mod controller;
mod cpuset;
mod device_plugin;
mod k8s;
mod pool;
mod pool_config;
mod topology;
mod webhook;

use anyhow::Result;
use clap::Parser;
use utils::version;

use crate::app::ApplicationBuilder;
use crate::config::Cli;
use crate::config::Commands;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();
    utils::logging::init(cli.log_format);
    let builder = ApplicationBuilder::new();

    let app = match cli.command {
        Commands::Controller(args) => {
            tracing::info!("Starting cpuset controller {}", &**version::VERSION);
            builder.build_controller(*args).await?
        }
        Commands::DevicePlugin(args) => {
            tracing::info!("Starting cpu device plugin {}", &**version::VERSION);
            builder.build_device_plugin(args).await?
        }
        Commands::Webhook(args) => {
            tracing::info!("Starting cpu admission webhook {}", &**version::VERSION);
            builder.build_webhook(args)
        }
    };

    app.run().await
}
