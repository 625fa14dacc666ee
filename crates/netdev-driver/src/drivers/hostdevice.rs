//! Host device driver: hands whole host links to workloads

use std::sync::Arc;

use api_types::AllocatedDevice;
use api_types::Device;
use async_trait::async_trait;
use error_stack::Report;
use tracing::info;
use tracing::warn;

use crate::domain::driver::DriverKind;
use crate::domain::driver::NetworkDriver;
use crate::domain::registry::DeviceRegistry;
use crate::domain::types::attributes;
use crate::domain::types::DriverError;
use crate::domain::types::ErrorKind;
use crate::netns::LinkMode;
use crate::netns::LinkOps;
use crate::netns::MoveOutcome;
use crate::netns::NamespaceHandle;
use crate::netns::NamespaceMover;

use super::network_error;

pub struct HostDeviceDriver {
    name: String,
    registry: DeviceRegistry,
    mover: Arc<NamespaceMover>,
}

impl HostDeviceDriver {
    pub fn new(name: impl Into<String>, registry: DeviceRegistry, mover: Arc<NamespaceMover>) -> Self {
        Self {
            name: name.into(),
            registry,
            mover,
        }
    }

    /// Default name and excluded prefixes on top of `ops`
    pub fn with_defaults(ops: Arc<dyn LinkOps>) -> Self {
        Self::new(
            DriverKind::HostDevice.default_driver_name(),
            DeviceRegistry::with_default_prefixes(ops.clone()),
            Arc::new(NamespaceMover::new(ops)),
        )
    }
}

/// Host link backing an allocated device
fn host_name(device: &AllocatedDevice) -> &str {
    device
        .attribute(attributes::INTERFACE_NAME)
        .unwrap_or(&device.name)
}

#[async_trait]
impl NetworkDriver for HostDeviceDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_devices(&self) -> Result<Vec<Device>, Report<DriverError>> {
        self.registry.list_devices().await
    }

    async fn prepare(&self, uid: &str, devices: &[AllocatedDevice]) -> Result<String, Report<DriverError>> {
        let names: Vec<&str> = devices.iter().map(host_name).collect();
        info!(uid, devices = ?names, "Preparing host devices");
        Ok(names.join(","))
    }

    async fn unprepare(&self, uid: &str, _devices: &[AllocatedDevice]) -> Result<(), Report<DriverError>> {
        info!(uid, "Unpreparing host devices");
        Ok(())
    }

    fn pod_ifname(
        &self,
        _uid: &str,
        device: &AllocatedDevice,
        _index: usize,
    ) -> Result<String, Report<DriverError>> {
        // the link keeps its host name inside the sandbox
        Ok(host_name(device).to_string())
    }

    async fn configure_device(
        &self,
        uid: &str,
        device: &AllocatedDevice,
        index: usize,
        netns: &NamespaceHandle,
    ) -> Result<String, Report<DriverError>> {
        let host = host_name(device);
        let pod_ifname = self.pod_ifname(uid, device, index)?;
        info!(uid, device = host, netns = %netns, pod_name = %pod_ifname, "Moving host device into sandbox");

        self.mover
            .move_in(host, netns, &pod_ifname, LinkMode::Direct)
            .await
            .map_err(|report| network_error(report, uid, host, "move in"))?;
        Ok(pod_ifname)
    }

    async fn cleanup_device(
        &self,
        uid: &str,
        device: &AllocatedDevice,
        pod_ifname: &str,
        netns: &NamespaceHandle,
    ) -> Result<(), Report<DriverError>> {
        let host = host_name(device);
        let outcome = self
            .mover
            .move_out(netns, pod_ifname, host)
            .await
            .map_err(|report| network_error(report, uid, host, "move out"))?;
        if outcome == MoveOutcome::NamespaceGone {
            warn!(uid, device = host, kind = %ErrorKind::UnrecoverableSafe, "Host device was destroyed together with the sandbox namespace");
        }
        Ok(())
    }
}
