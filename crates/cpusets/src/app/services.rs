use std::sync::Arc;

use crate::controller::CpusetController;
use crate::controller::PodKey;
use crate::controller::PodWatcher;
use crate::controller::Reconciler;
use crate::controller::WorkQueue;
use crate::device_plugin::DevicePluginManager;
use crate::webhook::WebhookServer;

/// Collaborators of the cpuset controller agent.
pub(crate) struct ControllerServices {
    pub watcher: Arc<PodWatcher>,
    pub queue: Arc<WorkQueue<PodKey>>,
    pub controller: Arc<CpusetController>,
    pub reconciler: Arc<Reconciler>,
    pub workers: usize,
}

/// The agent this process runs.
pub(crate) enum AgentServices {
    Controller(ControllerServices),
    DevicePlugin(Arc<DevicePluginManager>),
    Webhook(WebhookServer),
}

impl AgentServices {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Controller(_) => "controller",
            Self::DevicePlugin(_) => "device-plugin",
            Self::Webhook(_) => "webhook",
        }
    }
}
