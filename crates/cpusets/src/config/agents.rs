use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::checkpoint::DEFAULT_CHECKPOINT_PATH;
use crate::controller::RetryPolicy;
use crate::device_plugin::DEVICE_PLUGIN_DIR;
use crate::pool_config::PoolConfigLoader;
use crate::webhook::CfsQuotas;
use crate::webhook::DEFAULT_PROCESS_STARTER_PATH;

/// Where pool configuration files live and how resources are named.
#[derive(Args, Clone, Debug)]
pub struct PoolArgs {
    #[arg(
        long,
        env = "POOL_CONFIG_DIR",
        value_hint = clap::ValueHint::DirPath,
        default_value = "/etc/cpusets-pool",
        help = "Directory holding the pool configuration files"
    )]
    pub pool_config_dir: PathBuf,

    #[arg(
        long,
        env = "FILE_MATCH",
        default_value = "*.yaml",
        help = "Glob selecting pool configuration files inside the directory"
    )]
    pub file_match: String,

    #[arg(
        long,
        env = "RESOURCE_BASE_NAME",
        default_value = "cmss.cn",
        help = "Prefix of the advertised extended resources and annotations"
    )]
    pub resource_base_name: String,
}

impl PoolArgs {
    pub fn loader(&self) -> PoolConfigLoader {
        PoolConfigLoader::new(&self.pool_config_dir, &self.file_match)
    }
}

/// Identity of the node an agent runs on.
#[derive(Args, Clone, Debug)]
pub struct NodeArgs {
    #[arg(
        long,
        env = "NODE_NAME",
        help = "Name of the node this agent runs on"
    )]
    pub node_name: String,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,
}

#[derive(Args, Clone, Debug)]
pub struct ControllerArgs {
    #[command(flatten)]
    pub pool: PoolArgs,

    #[command(flatten)]
    pub node: NodeArgs,

    #[arg(
        long,
        env = "CPUSET_ROOT",
        value_hint = clap::ValueHint::DirPath,
        help = "Root of the cpuset cgroup hierarchy, e.g. /sys/fs/cgroup/cpuset/kubepods"
    )]
    pub cpuset_root: PathBuf,

    #[arg(
        long,
        env = "CHECKPOINT_PATH",
        value_hint = clap::ValueHint::FilePath,
        default_value = DEFAULT_CHECKPOINT_PATH,
        help = "Kubelet device manager checkpoint file"
    )]
    pub checkpoint_path: PathBuf,

    #[arg(
        long,
        env = "CONTROLLER_WORKERS",
        default_value = "100",
        help = "Number of pod workers"
    )]
    pub workers: usize,

    #[arg(
        long,
        env = "WORK_QUEUE_CAPACITY",
        default_value = "1024",
        help = "Maximum number of pods waiting in the work queue"
    )]
    pub queue_capacity: usize,

    #[arg(
        long,
        env = "RECONCILE_INTERVAL_SECS",
        default_value = "5",
        help = "Seconds between two reconciliation passes"
    )]
    pub reconcile_interval_secs: u64,

    #[arg(
        long,
        env = "MAX_RETRIES",
        default_value = "150",
        help = "Attempts made while waiting for readiness and while applying"
    )]
    pub max_retries: usize,

    #[arg(
        long,
        env = "RETRY_INTERVAL_MS",
        default_value = "200",
        help = "Milliseconds between two attempts"
    )]
    pub retry_interval_ms: u64,
}

impl ControllerArgs {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            interval: Duration::from_millis(self.retry_interval_ms),
        }
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }
}

#[derive(Args, Clone, Debug)]
pub struct DevicePluginArgs {
    #[command(flatten)]
    pub pool: PoolArgs,

    #[command(flatten)]
    pub node: NodeArgs,

    #[arg(
        long,
        env = "DEVICE_PLUGIN_DIR",
        value_hint = clap::ValueHint::DirPath,
        default_value = DEVICE_PLUGIN_DIR,
        help = "Directory holding the kubelet and plugin sockets"
    )]
    pub plugin_dir: PathBuf,
}

#[derive(Args, Clone, Debug)]
pub struct WebhookArgs {
    #[command(flatten)]
    pub pool: PoolArgs,

    #[arg(
        long,
        env = "TLS_CERT_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "PEM encoded certificate served by the webhook"
    )]
    pub tls_cert_file: PathBuf,

    #[arg(
        long,
        env = "TLS_PRIVATE_KEY_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "PEM encoded private key of the certificate"
    )]
    pub tls_private_key_file: PathBuf,

    #[arg(
        long,
        env = "WEBHOOK_LISTEN_ADDR",
        default_value = "0.0.0.0:443",
        help = "HTTPS listen address"
    )]
    pub listen_addr: String,

    #[arg(
        long,
        env = "PROCESS_STARTER_PATH",
        value_hint = clap::ValueHint::FilePath,
        default_value = DEFAULT_PROCESS_STARTER_PATH,
        help = "Host path of the process starter binary"
    )]
    pub process_starter_path: String,

    #[arg(
        long,
        env = "CFS_QUOTAS",
        value_enum,
        default_value_t = CfsQuotas::All,
        help = "Containers that get CFS quotas provisioned"
    )]
    pub cfs_quotas: CfsQuotas,
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use similar_asserts::assert_eq;

    use crate::config::Cli;
    use crate::config::Commands;

    use super::*;

    /// Tuning variables read by the controller; tests touching them hold [`ENV_LOCK`].
    const TUNING_ENV: [(&str, &str); 5] = [
        ("CONTROLLER_WORKERS", "8"),
        ("WORK_QUEUE_CAPACITY", "64"),
        ("RECONCILE_INTERVAL_SECS", "30"),
        ("MAX_RETRIES", "10"),
        ("RETRY_INTERVAL_MS", "500"),
    ];

    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn controller_args(args: &[&str]) -> ControllerArgs {
        let cli = Cli::try_parse_from(
            [
                "cpusets",
                "controller",
                "--node-name",
                "worker-1",
                "--cpuset-root",
                "/sys/fs/cgroup/cpuset/kubepods",
            ]
            .iter()
            .chain(args),
        )
        .unwrap();
        let Commands::Controller(args) = cli.command else {
            panic!("expected controller subcommand");
        };
        *args
    }

    #[test]
    fn controller_tuning_from_env() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        for (name, value) in TUNING_ENV {
            std::env::set_var(name, value);
        }
        let from_env = controller_args(&[]);
        let flag_wins = controller_args(&["--workers", "2"]);
        for (name, _) in TUNING_ENV {
            std::env::remove_var(name);
        }

        assert_eq!(from_env.workers, 8);
        assert_eq!(from_env.queue_capacity, 64);
        assert_eq!(from_env.reconcile_interval(), Duration::from_secs(30));
        assert_eq!(from_env.retry_policy().max_retries, 10);
        assert_eq!(from_env.retry_policy().interval, Duration::from_millis(500));
        assert_eq!(flag_wins.workers, 2);
    }

    #[test]
    fn controller_defaults() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let cli = Cli::try_parse_from([
            "cpusets",
            "controller",
            "--node-name",
            "worker-1",
            "--cpuset-root",
            "/sys/fs/cgroup/cpuset/kubepods",
            "--pool-config-dir",
            "/etc/cpusets-pool",
        ])
        .unwrap();
        let Commands::Controller(args) = cli.command else {
            panic!("expected controller subcommand");
        };

        assert_eq!(args.node.node_name, "worker-1");
        assert_eq!(args.pool.pool_config_dir, PathBuf::from("/etc/cpusets-pool"));
        assert_eq!(
            args.cpuset_root,
            PathBuf::from("/sys/fs/cgroup/cpuset/kubepods")
        );
        assert_eq!(args.workers, 100);
        assert_eq!(args.queue_capacity, 1024);
        assert_eq!(args.reconcile_interval(), Duration::from_secs(5));
        assert_eq!(args.retry_policy().max_retries, 150);
        assert_eq!(args.retry_policy().interval, Duration::from_millis(200));
    }

    #[test]
    fn log_format_is_global() {
        let cli = Cli::try_parse_from([
            "cpusets",
            "device-plugin",
            "--node-name",
            "worker-1",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.log_format, utils::logging::LogFormat::Json);
    }

    #[test]
    fn controller_requires_cpuset_root() {
        let result = Cli::try_parse_from(["cpusets", "controller", "--node-name", "worker-1"]);
        if std::env::var_os("CPUSET_ROOT").is_none() {
            assert!(result.is_err());
        }
    }

    #[test]
    fn device_plugin_dir_override() {
        let cli = Cli::try_parse_from([
            "cpusets",
            "device-plugin",
            "--node-name",
            "worker-1",
            "--plugin-dir",
            "/tmp/plugins",
        ])
        .unwrap();
        let Commands::DevicePlugin(args) = cli.command else {
            panic!("expected device-plugin subcommand");
        };
        assert_eq!(args.plugin_dir, PathBuf::from("/tmp/plugins"));
    }

    #[test]
    fn webhook_cfs_quota_mode() {
        let cli = Cli::try_parse_from([
            "cpusets",
            "webhook",
            "--tls-cert-file",
            "/etc/webhook/tls.crt",
            "--tls-private-key-file",
            "/etc/webhook/tls.key",
            "--listen-addr",
            "0.0.0.0:8443",
            "--cfs-quotas",
            "shared",
        ])
        .unwrap();
        let Commands::Webhook(args) = cli.command else {
            panic!("expected webhook subcommand");
        };
        assert_eq!(args.cfs_quotas, CfsQuotas::Shared);
        assert_eq!(args.listen_addr, "0.0.0.0:8443");
    }

    #[test]
    fn webhook_rejects_unknown_cfs_quota_mode() {
        let result = Cli::try_parse_from([
            "cpusets",
            "webhook",
            "--tls-cert-file",
            "/etc/webhook/tls.crt",
            "--tls-private-key-file",
            "/etc/webhook/tls.key",
            "--cfs-quotas",
            "none",
        ]);
        assert!(result.is_err());
    }
}
