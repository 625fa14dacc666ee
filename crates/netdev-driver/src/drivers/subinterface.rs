//! Sub-interface driver: one host link backs many workloads through
//! macvlan or ipvlan slaves.
//!
//! Each eligible parent is advertised as a fixed number of slots per kind
//! (`eth1-macvlan-0`, `eth1-ipvlan-0`, ...). A slot is an ordinary device for
//! the allocation side, so it is bound to at most one workload, while the
//! parent itself never leaves the host.

use std::sync::Arc;

use api_types::AllocatedDevice;
use api_types::Device;
use async_trait::async_trait;
use error_stack::Report;
use tracing::info;

use crate::domain::driver::DriverKind;
use crate::domain::driver::NetworkDriver;
use crate::domain::registry::DeviceRegistry;
use crate::domain::types::attributes;
use crate::domain::types::DriverError;
use crate::netns::LinkMode;
use crate::netns::LinkOps;
use crate::netns::NamespaceHandle;
use crate::netns::NamespaceMover;
use crate::netns::SubInterfaceKind;

use super::network_error;

pub const DEFAULT_SLOTS_PER_PARENT: u32 = 4;

pub struct SubInterfaceDriver {
    name: String,
    registry: DeviceRegistry,
    mover: Arc<NamespaceMover>,
    slots_per_parent: u32,
}

impl SubInterfaceDriver {
    pub fn new(
        name: impl Into<String>,
        registry: DeviceRegistry,
        mover: Arc<NamespaceMover>,
        slots_per_parent: u32,
    ) -> Self {
        Self {
            name: name.into(),
            registry,
            mover,
            slots_per_parent,
        }
    }

    pub fn with_defaults(ops: Arc<dyn LinkOps>) -> Self {
        Self::new(
            DriverKind::SubInterface.default_driver_name(),
            DeviceRegistry::with_default_prefixes(ops.clone()),
            Arc::new(NamespaceMover::new(ops)),
            DEFAULT_SLOTS_PER_PARENT,
        )
    }
}

/// Parent link and slave kind of a slot
fn slot_target(uid: &str, device: &AllocatedDevice) -> Result<(String, SubInterfaceKind), Report<DriverError>> {
    let parent = device.attribute(attributes::PARENT);
    let kind = device.attribute(attributes::MODE).and_then(SubInterfaceKind::parse);
    match (parent, kind) {
        (Some(parent), Some(kind)) => Ok((parent.to_string(), kind)),
        _ => Err(Report::new(DriverError::DeviceNotFound {
            uid: uid.to_string(),
            device: device.name.clone(),
        })
        .attach_printable("device lacks parent or mode attribute")),
    }
}

#[async_trait]
impl NetworkDriver for SubInterfaceDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_devices(&self) -> Result<Vec<Device>, Report<DriverError>> {
        let parents = self.registry.eligible_links().await?;
        let mut devices = Vec::new();
        for parent in &parents {
            for kind in [SubInterfaceKind::Macvlan, SubInterfaceKind::Ipvlan] {
                for slot in 0..self.slots_per_parent {
                    devices.push(
                        Device::new(format!("{}-{kind}-{slot}", parent.name))
                            .with_attribute(attributes::PARENT, parent.name.as_str())
                            .with_attribute(attributes::MODE, kind.to_string()),
                    );
                }
            }
        }
        Ok(devices)
    }

    async fn prepare(&self, uid: &str, devices: &[AllocatedDevice]) -> Result<String, Report<DriverError>> {
        let mut slots = Vec::with_capacity(devices.len());
        for device in devices {
            slot_target(uid, device)?;
            slots.push(device.name.as_str());
        }
        info!(uid, slots = ?slots, "Preparing sub-interface slots");
        Ok(slots.join(","))
    }

    async fn unprepare(&self, uid: &str, _devices: &[AllocatedDevice]) -> Result<(), Report<DriverError>> {
        info!(uid, "Unpreparing sub-interface slots");
        Ok(())
    }

    fn pod_ifname(
        &self,
        uid: &str,
        device: &AllocatedDevice,
        index: usize,
    ) -> Result<String, Report<DriverError>> {
        let (_, kind) = slot_target(uid, device)?;
        Ok(format!("{kind}{index}"))
    }

    async fn configure_device(
        &self,
        uid: &str,
        device: &AllocatedDevice,
        index: usize,
        netns: &NamespaceHandle,
    ) -> Result<String, Report<DriverError>> {
        let (parent, kind) = slot_target(uid, device)?;
        let pod_ifname = self.pod_ifname(uid, device, index)?;
        info!(uid, parent = %parent, netns = %netns, pod_name = %pod_ifname, "Creating slave link in sandbox");

        self.mover
            .move_in(&parent, netns, &pod_ifname, LinkMode::SubInterface(kind))
            .await
            .map_err(|report| network_error(report, uid, &device.name, "create slave"))?;
        Ok(pod_ifname)
    }

    async fn cleanup_device(
        &self,
        uid: &str,
        device: &AllocatedDevice,
        pod_ifname: &str,
        netns: &NamespaceHandle,
    ) -> Result<(), Report<DriverError>> {
        let (parent, _) = slot_target(uid, device)?;
        self.mover
            .move_out(netns, pod_ifname, &parent)
            .await
            .map_err(|report| network_error(report, uid, &device.name, "delete slave"))?;
        Ok(())
    }
}
