use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::domain::DriverKind;
use crate::service::ServiceTimeouts;

#[derive(Parser, Clone, Debug)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "NETDEV_DRIVER",
        value_enum,
        default_value_t = DriverKind::HostDevice,
        help = "Driver variant to run on this node"
    )]
    pub driver: DriverKind,

    #[arg(
        long,
        env = "NETDEV_DRIVER_NAME",
        help = "Driver name matched against allocation results (defaults per driver variant)"
    )]
    pub driver_name: Option<String>,

    #[arg(
        long,
        env = "NODE_NAME",
        help = "Node name used in published resource slices (defaults to the host name)"
    )]
    pub node_name: Option<String>,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        env = "API_LISTEN_ADDR",
        default_value = "0.0.0.0:9177",
        help = "HTTP API server listen address"
    )]
    pub api_listen_addr: String,

    #[arg(
        long,
        help = "Publish the device inventory as a ResourceSlice",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub enable_publish: bool,

    #[arg(
        long,
        default_value = "30",
        help = "Seconds between inventory publications"
    )]
    pub publish_interval_secs: u64,

    #[arg(
        long,
        default_value = "30000",
        help = "Default deadline of sandbox hooks when the caller sends none"
    )]
    pub hook_timeout_ms: u64,

    #[arg(
        long,
        default_value = "10000",
        help = "Default deadline of prepare/unprepare when the caller sends none"
    )]
    pub claim_timeout_ms: u64,

    #[arg(
        long,
        env = "NETDEV_LOG_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "Also write logs to this file, rotated daily"
    )]
    pub log_file: Option<PathBuf>,

    #[arg(
        long,
        env = "NETDEV_DRIVER_CONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "YAML driver configuration, e.g. /etc/netdev-driver/config.yaml"
    )]
    pub config: Option<PathBuf>,
}

impl DaemonArgs {
    pub fn driver_name(&self) -> String {
        self.driver_name
            .clone()
            .unwrap_or_else(|| self.driver.default_driver_name().to_string())
    }

    /// `--node-name`, then `$HOSTNAME`, then the kernel host name
    pub fn node_name(&self) -> Option<String> {
        self.node_name
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .or_else(|| {
                std::fs::read_to_string("/proc/sys/kernel/hostname")
                    .ok()
                    .map(|s| s.trim().to_string())
            })
            .filter(|s| !s.is_empty())
    }

    pub fn timeouts(&self) -> ServiceTimeouts {
        ServiceTimeouts {
            claim: Duration::from_millis(self.claim_timeout_ms),
            hook: Duration::from_millis(self.hook_timeout_ms),
        }
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_secs(self.publish_interval_secs.max(1))
    }
}
