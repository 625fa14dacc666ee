//! Capability interface implemented by every device driver variant

use api_types::AllocatedDevice;
use api_types::Device;
use async_trait::async_trait;
use error_stack::Report;

use super::types::DriverError;
use crate::netns::NamespaceHandle;

/// Driver variant, chosen once at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, derive_more::Display)]
pub enum DriverKind {
    /// Moves whole host links into workload namespaces
    #[display("hostdevice")]
    #[value(name = "hostdevice")]
    HostDevice,
    /// Creates macvlan/ipvlan slaves of host links
    #[display("subinterface")]
    #[value(name = "subinterface")]
    SubInterface,
    /// Simulated resource backed by a marker file
    #[display("node-agent")]
    #[value(name = "node-agent")]
    NodeAgent,
}

impl DriverKind {
    pub fn default_driver_name(&self) -> &'static str {
        match self {
            Self::HostDevice => "hostdevice.k8s.io",
            Self::SubInterface => "subinterface.k8s.io",
            Self::NodeAgent => "node-agent.k8s.io",
        }
    }
}

/// What a driver does with devices. The coordinator and dispatcher own all
/// ordering and bookkeeping; a driver only performs side effects.
#[async_trait]
pub trait NetworkDriver: Send + Sync {
    /// Driver name published with the inventory, e.g. `hostdevice.k8s.io`
    fn name(&self) -> &str;

    /// Devices this node can currently offer
    async fn list_devices(&self) -> Result<Vec<Device>, Report<DriverError>>;

    /// Driver specific preparation, run exactly once per workload. Returns
    /// the opaque token stored in the prepared state.
    async fn prepare(
        &self,
        uid: &str,
        devices: &[AllocatedDevice],
    ) -> Result<String, Report<DriverError>>;

    /// Reverses [`prepare`](Self::prepare)
    async fn unprepare(
        &self,
        uid: &str,
        devices: &[AllocatedDevice],
    ) -> Result<(), Report<DriverError>>;

    /// Interface name `device` gets inside the sandbox namespace. Known
    /// before [`configure_device`](Self::configure_device) runs.
    fn pod_ifname(
        &self,
        _uid: &str,
        device: &AllocatedDevice,
        _index: usize,
    ) -> Result<String, Report<DriverError>> {
        Ok(device.name.clone())
    }

    /// Makes `device` available inside `netns`; `index` is its position in
    /// the prepared state. Returns the interface name inside the namespace.
    async fn configure_device(
        &self,
        uid: &str,
        device: &AllocatedDevice,
        index: usize,
        netns: &NamespaceHandle,
    ) -> Result<String, Report<DriverError>>;

    /// Reverses [`configure_device`](Self::configure_device). Succeeds when
    /// the interface or the whole namespace is already gone.
    async fn cleanup_device(
        &self,
        uid: &str,
        device: &AllocatedDevice,
        pod_ifname: &str,
        netns: &NamespaceHandle,
    ) -> Result<(), Report<DriverError>>;

    /// Reports a failure from a background task
    fn handle_error(&self, message: &str, error: &(dyn std::fmt::Debug + Send + Sync)) {
        tracing::error!(driver = self.name(), "background error: {message}: {error:?}");
    }
}
