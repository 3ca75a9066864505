use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::app::services::AgentServices;
use crate::app::services::ControllerServices;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Task manager, responsible for starting and managing all background tasks
pub(crate) struct Tasks {
    tasks: Vec<JoinHandle<Result<()>>>,
    cancellation_token: CancellationToken,
}

impl Tasks {
    pub(crate) fn new(cancellation_token: CancellationToken) -> Self {
        Self {
            tasks: Vec::new(),
            cancellation_token,
        }
    }

    /// Start all background tasks of the agent
    pub(crate) fn spawn_all_tasks(&mut self, services: AgentServices) {
        match services {
            AgentServices::Controller(services) => self.spawn_controller_tasks(services),
            AgentServices::DevicePlugin(manager) => {
                let token = self.cancellation_token.clone();
                self.spawn("device plugin manager", async move {
                    manager
                        .run(token)
                        .await
                        .map_err(|e| anyhow::anyhow!("Device plugin manager failed: {e:?}"))
                });
            }
            AgentServices::Webhook(server) => {
                let token = self.cancellation_token.clone();
                self.spawn("admission webhook", async move {
                    server
                        .run(token)
                        .await
                        .map_err(|e| anyhow::anyhow!("Admission webhook failed: {e:?}"))
                });
            }
        }
    }

    fn spawn_controller_tasks(&mut self, services: ControllerServices) {
        let ControllerServices {
            watcher,
            queue,
            controller,
            reconciler,
            workers,
        } = services;

        let token = self.cancellation_token.clone();
        let watcher_queue = queue.clone();
        self.spawn("pod watcher", async move {
            watcher
                .run(watcher_queue, token)
                .await
                .map_err(|e| anyhow::anyhow!("Pod watcher failed: {e:?}"))
        });

        let handles = controller.spawn_workers(queue, workers);
        self.spawn("pod workers", async move {
            for result in futures::future::join_all(handles).await {
                if let Err(e) = result {
                    tracing::error!("Pod worker failed: {e}");
                }
            }
            Ok(())
        });

        let token = self.cancellation_token.clone();
        self.spawn("cpuset reconciliation", async move {
            reconciler.run(token).await;
            Ok(())
        });
    }

    fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.tasks.push(tokio::spawn(async move {
            tracing::info!("Starting {name} task");
            let result = task.await;
            match &result {
                Ok(()) => tracing::info!("{name} task completed"),
                Err(e) => tracing::error!("{name} task failed: {e}"),
            }
            result
        }));
    }

    /// wait for tasks to complete or receive shutdown signal
    ///
    /// Returns the first task error, if any task failed.
    pub(crate) async fn wait_for_completion(&mut self) -> Result<()> {
        if self.tasks.is_empty() {
            return Ok(());
        }

        let signal_handler = {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;

            tokio::spawn(async move {
                tokio::select! {
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM, initiating graceful shutdown");
                    }
                    _ = sigint.recv() => {
                        tracing::info!("Received SIGINT, initiating graceful shutdown");
                    }
                }
            })
        };

        let first_error = tokio::select! {
            _ = signal_handler => {
                tracing::info!("Shutdown signal received, cancelling all tasks");
                None
            }
            (result, index, _) = futures::future::select_all(&mut self.tasks) => {
                self.tasks.swap_remove(index);
                match result {
                    Ok(Ok(())) => {
                        tracing::warn!("Task completed unexpectedly, cancelling all tasks");
                        None
                    }
                    Ok(Err(e)) => Some(e),
                    Err(e) => Some(e.into()),
                }
            }
        };

        self.cancellation_token.cancel();
        let shutdown_error = self.wait_for_tasks_with_timeout(SHUTDOWN_TIMEOUT).await;

        match first_error.or(shutdown_error) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn wait_for_tasks_with_timeout(&mut self, timeout: Duration) -> Option<anyhow::Error> {
        let mut first_error = None;
        let wait = async {
            for task in self.tasks.drain(..) {
                let error = match task.await {
                    Ok(Ok(())) => continue,
                    Ok(Err(e)) => e,
                    Err(e) => {
                        tracing::error!("Task failed during shutdown: {e}");
                        e.into()
                    }
                };
                first_error.get_or_insert(error);
            }
        };
        if tokio::time::timeout(timeout, wait).await.is_err() {
            tracing::warn!("Task shutdown timed out after {:?}", timeout);
        }
        first_error
    }
}
