//! The device plugin agent: advertises pool cores to the kubelet.

mod manager;
mod plugin;

pub(crate) use manager::DevicePluginManager;

/// Generated kubelet device plugin API.
pub(crate) mod api {
    tonic::include_proto!("v1beta1");
}

/// Directory holding the kubelet and plugin sockets.
pub const DEVICE_PLUGIN_DIR: &str = "/var/lib/kubelet/device-plugins";
pub const KUBELET_SOCKET: &str = "kubelet.sock";
pub const API_VERSION: &str = "v1beta1";

/// Synthetic devices advertised per shared pool core.
pub const SHARED_DEVICES_PER_CORE: u32 = 1000;

pub const EXCLUSIVE_CPUS_ENV: &str = "EXCLUSIVE_CPUS";
pub const SHARED_CPUS_ENV: &str = "SHARED_CPUS";

#[derive(Debug, derive_more::Display)]
pub enum DevicePluginError {
    #[display("Failed to bind plugin socket {path}")]
    BindFailed { path: String },
    #[display("Failed to connect to kubelet socket {path}")]
    ConnectFailed { path: String },
    #[display("Kubelet rejected registration of {resource_name}")]
    RegistrationFailed { resource_name: String },
    #[display("Failed to remove stale socket {path}")]
    CleanupFailed { path: String },
    #[display("Failed to watch {path}")]
    WatchFailed { path: String },
}

impl core::error::Error for DevicePluginError {}

/// Socket file name of the plugin serving `pool_name`.
pub fn socket_name(pool_name: &str) -> String {
    format!("cpudp_{pool_name}.sock")
}
