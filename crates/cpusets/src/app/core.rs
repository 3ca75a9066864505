use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::app::services::AgentServices;
use crate::app::tasks::Tasks;

/// Application core structure with explicit dependencies
pub(crate) struct Application {
    services: AgentServices,
    cancellation_token: CancellationToken,
}

impl Application {
    /// `cancellation_token` must be the token the services were built with.
    pub(crate) fn new(services: AgentServices, cancellation_token: CancellationToken) -> Self {
        Self {
            services,
            cancellation_token,
        }
    }

    /// Run application, start all tasks and wait for completion
    pub(crate) async fn run(self) -> Result<()> {
        let agent = self.services.name();
        tracing::info!("Starting {agent} tasks...");

        let mut tasks = Tasks::new(self.cancellation_token);
        tasks.spawn_all_tasks(self.services);

        if let Err(e) = tasks.wait_for_completion().await {
            tracing::error!("Error during {agent} execution: {e:?}");
            return Err(e);
        }

        tracing::info!("{agent} run completed");
        Ok(())
    }
}
