//! Enumerates host links and keeps the ones that can be handed to workloads

use std::sync::Arc;

use api_types::Device;
use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;

use super::types::attributes;
use super::types::DriverError;
use crate::netns::LinkInfo;
use crate::netns::LinkOps;
use crate::netns::NamespaceHandle;

/// Name prefixes of virtual and overlay links that are never assignable
pub const DEFAULT_EXCLUDED_PREFIXES: &[&str] = &[
    "veth", "docker", "cni", "flannel", "cali", "vxlan", "tunl", "virbr", "br-", "lo",
];

/// Read-only view of assignable host links.
///
/// Never retries: enumeration errors go straight back to the caller.
pub struct DeviceRegistry {
    ops: Arc<dyn LinkOps>,
    excluded_prefixes: Vec<String>,
}

impl DeviceRegistry {
    pub fn new(ops: Arc<dyn LinkOps>, excluded_prefixes: Vec<String>) -> Self {
        Self {
            ops,
            excluded_prefixes,
        }
    }

    pub fn with_default_prefixes(ops: Arc<dyn LinkOps>) -> Self {
        Self::new(
            ops,
            DEFAULT_EXCLUDED_PREFIXES.iter().map(|p| p.to_string()).collect(),
        )
    }

    /// Lists assignable host links as advertised devices
    pub async fn list_devices(&self) -> Result<Vec<Device>, Report<DriverError>> {
        Ok(self
            .eligible_links()
            .await?
            .iter()
            .map(to_device)
            .collect())
    }

    /// Lists assignable host links
    pub async fn eligible_links(&self) -> Result<Vec<LinkInfo>, Report<DriverError>> {
        let links = self
            .ops
            .list_links(&NamespaceHandle::Host)
            .await
            .change_context_lazy(|| DriverError::Enumeration {
                message: "listing host links".to_string(),
            })?;

        let mut eligible: Vec<LinkInfo> = links
            .into_iter()
            .filter(|link| {
                let keep = is_eligible(link, &self.excluded_prefixes);
                if !keep {
                    debug!(device = %link.name, up = link.up, "Skipping ineligible link");
                }
                keep
            })
            .collect();
        eligible.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(eligible)
    }
}

/// Down, loopback, slave and virtual-prefixed links are never assignable
pub fn is_eligible<S: AsRef<str>>(link: &LinkInfo, excluded_prefixes: &[S]) -> bool {
    link.up
        && !link.loopback
        && link.kind.is_none()
        && !excluded_prefixes
            .iter()
            .any(|prefix| link.name.starts_with(prefix.as_ref()))
}

fn to_device(link: &LinkInfo) -> Device {
    let device = Device::new(link.name.clone())
        .with_attribute(attributes::INTERFACE_NAME, link.name.as_str());
    match &link.mac {
        Some(mac) => device.with_attribute(attributes::MAC_ADDRESS, mac.as_str()),
        None => device,
    }
}
