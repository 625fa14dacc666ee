//! Node agent driver: advertises a simulated node resource backed by a marker
//! file. Preparing writes the owning workload UID into the file; there is
//! nothing to move into sandboxes.

use std::path::PathBuf;

use api_types::AllocatedDevice;
use api_types::Device;
use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;
use tracing::info;

use crate::domain::driver::DriverKind;
use crate::domain::driver::NetworkDriver;
use crate::domain::types::attributes;
use crate::domain::types::DriverError;
use crate::netns::NamespaceHandle;

pub const DEFAULT_RESOURCE_FILE: &str = "/tmp/special-node-resource";
pub const RESOURCE_DEVICE: &str = "special-resource-0";

pub struct NodeAgentDriver {
    name: String,
    resource_file: PathBuf,
}

impl NodeAgentDriver {
    pub fn new(name: impl Into<String>, resource_file: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            resource_file: resource_file.into(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DriverKind::NodeAgent.default_driver_name(), DEFAULT_RESOURCE_FILE)
    }

    async fn write_owner(&self, contents: &str) -> Result<(), Report<DriverError>> {
        tokio::fs::write(&self.resource_file, contents)
            .await
            .change_context_lazy(|| DriverError::State {
                message: format!("writing {}", self.resource_file.display()),
            })
    }
}

#[async_trait]
impl NetworkDriver for NodeAgentDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_devices(&self) -> Result<Vec<Device>, Report<DriverError>> {
        let present = tokio::fs::try_exists(&self.resource_file)
            .await
            .change_context_lazy(|| DriverError::Enumeration {
                message: format!("checking {}", self.resource_file.display()),
            })?;
        if !present {
            debug!(path = %self.resource_file.display(), "Resource file not found, nothing to advertise");
            return Ok(Vec::new());
        }
        Ok(vec![Device::new(RESOURCE_DEVICE).with_attribute(attributes::FEATURE, "enabled")])
    }

    async fn prepare(&self, uid: &str, _devices: &[AllocatedDevice]) -> Result<String, Report<DriverError>> {
        info!(uid, path = %self.resource_file.display(), "Preparing node resource");
        self.write_owner(uid).await?;
        Ok(uid.to_string())
    }

    async fn unprepare(&self, uid: &str, _devices: &[AllocatedDevice]) -> Result<(), Report<DriverError>> {
        info!(uid, "Unpreparing node resource");
        self.write_owner("").await
    }

    async fn configure_device(
        &self,
        uid: &str,
        device: &AllocatedDevice,
        _index: usize,
        _netns: &NamespaceHandle,
    ) -> Result<String, Report<DriverError>> {
        debug!(uid, device = %device.name, "Node resource needs no sandbox configuration");
        Ok(device.name.clone())
    }

    async fn cleanup_device(
        &self,
        uid: &str,
        device: &AllocatedDevice,
        _pod_ifname: &str,
        _netns: &NamespaceHandle,
    ) -> Result<(), Report<DriverError>> {
        debug!(uid, device = %device.name, "Node resource needs no sandbox cleanup");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::domain::types::allocated_device;

    #[test(tokio::test)]
    async fn no_marker_file_no_devices() {
        let dir = tempfile::tempdir().expect("tempdir");
        let driver = NodeAgentDriver::new("node-agent.k8s.io", dir.path().join("missing"));
        assert!(driver.list_devices().await.expect("list").is_empty());
    }

    #[test(tokio::test)]
    async fn prepare_writes_uid_and_unprepare_clears_it() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("special-node-resource");
        std::fs::write(&path, "").expect("marker");
        let driver = NodeAgentDriver::new("node-agent.k8s.io", &path);

        let devices = driver.list_devices().await.expect("list");
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, RESOURCE_DEVICE);
        assert_eq!(devices[0].attribute("feature"), Some("enabled"));

        let allocated = [allocated_device(&devices[0], "node-a", "special")];
        let token = driver.prepare("uid-1", &allocated).await.expect("prepare");
        assert_eq!(token, "uid-1");
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "uid-1");

        let ns = NamespaceHandle::from_path("/var/run/netns/pod-a");
        let ifname = driver
            .configure_device("uid-1", &allocated[0], 0, &ns)
            .await
            .expect("configure");
        driver
            .cleanup_device("uid-1", &allocated[0], &ifname, &ns)
            .await
            .expect("cleanup");

        driver.unprepare("uid-1", &allocated).await.expect("unprepare");
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "");
    }
}
