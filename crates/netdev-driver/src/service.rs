//! Boundary facade used by the HTTP API and the publisher.
//!
//! Turns caller supplied timeouts into deadlines and keeps the one ordering
//! rule that spans both event sources: devices leave a running sandbox before
//! the workload is unprepared.

use std::sync::Arc;
use std::time::Duration;

use api_types::Device;
use api_types::PodSandbox;
use api_types::PreparedClaim;
use api_types::ResourceClaim;
use api_types::SandboxStatus;
use error_stack::Report;
use tokio::time::Instant;

use crate::domain::AllocationCoordinator;
use crate::domain::DriverError;
use crate::domain::NetworkDriver;
use crate::domain::SandboxHookDispatcher;
use crate::lifecycle::ServiceLifecycle;

/// Default deadlines applied when a caller sends none
#[derive(Debug, Clone, Copy)]
pub struct ServiceTimeouts {
    pub claim: Duration,
    pub hook: Duration,
}

impl Default for ServiceTimeouts {
    fn default() -> Self {
        Self {
            claim: Duration::from_secs(10),
            hook: Duration::from_secs(30),
        }
    }
}

pub struct NodeService {
    driver: Arc<dyn NetworkDriver>,
    coordinator: Arc<AllocationCoordinator>,
    dispatcher: Arc<SandboxHookDispatcher>,
    lifecycle: Arc<ServiceLifecycle>,
    timeouts: ServiceTimeouts,
}

impl NodeService {
    pub fn new(
        driver: Arc<dyn NetworkDriver>,
        lifecycle: Arc<ServiceLifecycle>,
        timeouts: ServiceTimeouts,
    ) -> Self {
        let coordinator = Arc::new(AllocationCoordinator::new(Arc::clone(&driver)));
        let dispatcher = Arc::new(SandboxHookDispatcher::new(
            Arc::clone(&coordinator),
            Arc::clone(&driver),
        ));
        Self {
            driver,
            coordinator,
            dispatcher,
            lifecycle,
            timeouts,
        }
    }

    pub fn driver(&self) -> &Arc<dyn NetworkDriver> {
        &self.driver
    }

    pub fn lifecycle(&self) -> &ServiceLifecycle {
        &self.lifecycle
    }

    fn deadline(timeout_ms: Option<u64>, default: Duration) -> Instant {
        Instant::now() + timeout_ms.map(Duration::from_millis).unwrap_or(default)
    }

    pub async fn list_devices(&self) -> Result<Vec<Device>, Report<DriverError>> {
        self.driver.list_devices().await
    }

    pub async fn prepare(
        &self,
        claim: &ResourceClaim,
        timeout_ms: Option<u64>,
    ) -> Result<PreparedClaim, Report<DriverError>> {
        let deadline = Self::deadline(timeout_ms, self.timeouts.claim);
        let state = self.coordinator.prepare(claim, deadline).await?;
        Ok(state.to_claim())
    }

    pub async fn unprepare(&self, uid: &str, timeout_ms: Option<u64>) -> Result<(), Report<DriverError>> {
        let deadline = Self::deadline(timeout_ms, self.timeouts.claim);
        self.dispatcher.release_for_unprepare(uid, deadline).await?;
        self.coordinator.unprepare(uid, deadline).await
    }

    pub fn get_claim(&self, uid: &str) -> Option<PreparedClaim> {
        self.coordinator.get(uid).map(|state| state.to_claim())
    }

    pub async fn run_sandbox(
        &self,
        sandbox: &PodSandbox,
        timeout_ms: Option<u64>,
    ) -> Result<SandboxStatus, Report<DriverError>> {
        let deadline = Self::deadline(timeout_ms, self.timeouts.hook);
        self.dispatcher.run_sandbox(sandbox, deadline).await
    }

    pub async fn stop_sandbox(
        &self,
        uid: &str,
        timeout_ms: Option<u64>,
    ) -> Result<SandboxStatus, Report<DriverError>> {
        let deadline = Self::deadline(timeout_ms, self.timeouts.hook);
        self.dispatcher.stop_sandbox(uid, deadline).await
    }

    pub async fn remove_sandbox(&self, uid: &str, timeout_ms: Option<u64>) -> Result<(), Report<DriverError>> {
        let deadline = Self::deadline(timeout_ms, self.timeouts.hook);
        self.dispatcher.remove_sandbox(uid, deadline).await
    }

    pub fn sandbox_status(&self, uid: &str) -> Option<SandboxStatus> {
        self.dispatcher.status(uid)
    }

    pub fn prepared_count(&self) -> usize {
        self.coordinator.prepared_count()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use api_types::AllocationResult;
    use api_types::DeviceRequestResult;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::drivers::HostDeviceDriver;
    use crate::netns::mock::FakeNetwork;
    use crate::netns::NamespaceHandle;

    pub(crate) fn service_with(net: &Arc<FakeNetwork>) -> NodeService {
        let driver: Arc<dyn NetworkDriver> = Arc::new(HostDeviceDriver::with_defaults(net.clone()));
        NodeService::new(driver, Arc::new(ServiceLifecycle::new()), ServiceTimeouts::default())
    }

    pub(crate) fn hostdevice_claim(uid: &str, device: &str) -> ResourceClaim {
        ResourceClaim {
            name: "nic".to_string(),
            namespace: "default".to_string(),
            workload_uid: uid.to_string(),
            allocation: Some(AllocationResult {
                devices: vec![DeviceRequestResult {
                    request: "nic".to_string(),
                    driver: "hostdevice.k8s.io".to_string(),
                    pool: "node-a".to_string(),
                    device: device.to_string(),
                }],
            }),
        }
    }

    pub(crate) fn sandbox(uid: &str, netns: &str) -> PodSandbox {
        PodSandbox {
            uid: uid.to_string(),
            namespace: "default".to_string(),
            name: format!("pod-{uid}"),
            netns: Some(netns.to_string()),
        }
    }

    #[test(tokio::test)]
    async fn unprepare_moves_devices_out_of_running_sandbox() {
        let net = Arc::new(FakeNetwork::new());
        net.add_host_link("eth1", true);
        let ns = net.add_namespace("/var/run/netns/pod-a");
        let before = net.host_inventory();
        let service = service_with(&net);

        service.prepare(&hostdevice_claim("uid-1", "eth1"), None).await.expect("prepare");
        service
            .run_sandbox(&sandbox("uid-1", "/var/run/netns/pod-a"), None)
            .await
            .expect("run");
        assert_eq!(net.link_names(&ns), vec!["eth1"]);

        service.unprepare("uid-1", None).await.expect("unprepare");
        assert_eq!(net.host_inventory(), before);
        assert!(service.get_claim("uid-1").is_none());
        assert_eq!(net.link_names(&NamespaceHandle::Host), vec!["eth1"]);
    }

    #[test(tokio::test)]
    async fn unprepare_without_state_touches_nothing() {
        let net = Arc::new(FakeNetwork::new());
        net.add_host_link("eth1", true);
        let service = service_with(&net);

        service.unprepare("ghost", None).await.expect("noop");
        assert_eq!(net.mutation_count(), 0);
    }

    #[test(tokio::test)]
    async fn prepared_claim_is_listed_until_unprepared() {
        let net = Arc::new(FakeNetwork::new());
        net.add_host_link("eth1", true);
        let service = service_with(&net);

        let prepared = service.prepare(&hostdevice_claim("uid-1", "eth1"), None).await.expect("prepare");
        assert_eq!(service.get_claim("uid-1"), Some(prepared.clone()));
        assert_eq!(prepared.token, "eth1");
        assert_eq!(service.prepared_count(), 1);

        service.unprepare("uid-1", Some(1000)).await.expect("unprepare");
        assert_eq!(service.get_claim("uid-1"), None);
    }
}
