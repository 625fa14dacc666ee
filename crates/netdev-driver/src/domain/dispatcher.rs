//! Sandbox hook dispatcher
//!
//! Drives one state machine per workload:
//!
//! ```text
//! Unconfigured -> Configuring -> Configured -> Cleaning -> Cleaned
//!       ^              |                          |
//!       +--------------+ (failure, rolled back)   +-- (partial failure, retried)
//! ```
//!
//! Hooks for one workload are serialized through a [`KeyedAsyncLock`]; the
//! record table is never borrowed across an await point.

use std::sync::Arc;

use api_types::AllocatedDevice;
use api_types::PodSandbox;
use api_types::SandboxStatus;
use dashmap::DashMap;
use error_stack::Report;
use tokio::time::Instant;
use tracing::error;
use tracing::info;
use tracing::warn;
use utils::keyed_lock::KeyedAsyncLock;

use super::coordinator::AllocationCoordinator;
use super::driver::NetworkDriver;
use super::types::DriverError;
use super::types::WorkloadUid;
use crate::netns::NamespaceHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum SandboxState {
    #[display("unconfigured")]
    Unconfigured,
    #[display("configuring")]
    Configuring,
    #[display("configured")]
    Configured,
    #[display("cleaning")]
    Cleaning,
    #[display("cleaned")]
    Cleaned,
}

/// A device that currently lives inside a sandbox namespace
#[derive(Debug, Clone)]
struct ConfiguredInterface {
    device: AllocatedDevice,
    pod_ifname: String,
}

#[derive(Debug, Clone)]
struct SandboxRecord {
    state: SandboxState,
    netns: Option<NamespaceHandle>,
    interfaces: Vec<ConfiguredInterface>,
}

impl SandboxRecord {
    fn new(state: SandboxState) -> Self {
        Self {
            state,
            netns: None,
            interfaces: Vec::new(),
        }
    }

    fn status(&self, uid: &str) -> SandboxStatus {
        SandboxStatus {
            uid: uid.to_string(),
            state: self.state.to_string(),
            interfaces: self.interfaces.iter().map(|i| i.pod_ifname.clone()).collect(),
        }
    }
}

pub struct SandboxHookDispatcher {
    coordinator: Arc<AllocationCoordinator>,
    driver: Arc<dyn NetworkDriver>,
    records: DashMap<WorkloadUid, SandboxRecord>,
    locks: KeyedAsyncLock<WorkloadUid>,
}

impl SandboxHookDispatcher {
    pub fn new(coordinator: Arc<AllocationCoordinator>, driver: Arc<dyn NetworkDriver>) -> Self {
        Self {
            coordinator,
            driver,
            records: DashMap::new(),
            locks: KeyedAsyncLock::new(),
        }
    }

    pub fn state(&self, uid: &str) -> Option<SandboxState> {
        self.records.get(uid).map(|r| r.state)
    }

    pub fn status(&self, uid: &str) -> Option<SandboxStatus> {
        self.records.get(uid).map(|r| r.status(uid))
    }

    fn set_state(&self, uid: &str, state: SandboxState) {
        self.records
            .entry(uid.to_string())
            .and_modify(|r| r.state = state)
            .or_insert_with(|| SandboxRecord::new(state));
    }

    fn snapshot(&self, uid: &str) -> Option<SandboxRecord> {
        self.records.get(uid).map(|r| r.clone())
    }

    /// Sandbox created: moves every prepared device into the sandbox
    /// namespace.
    ///
    /// Waits up to `deadline` for the allocation side to prepare the
    /// workload. Any failure rolls back the devices already moved.
    pub async fn run_sandbox(
        &self,
        sandbox: &PodSandbox,
        deadline: Instant,
    ) -> Result<SandboxStatus, Report<DriverError>> {
        let uid = sandbox.uid.as_str();
        let netns = sandbox
            .netns
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(NamespaceHandle::from_path)
            .ok_or_else(|| Report::new(DriverError::MissingNamespace { uid: uid.to_string() }))?;

        let _guard = self
            .locks
            .lock_until(&uid.to_string(), deadline)
            .await
            .ok_or_else(|| Report::new(DriverError::timeout(uid, "run sandbox")))?;

        if let Some(record) = self.snapshot(uid) {
            match record.state {
                SandboxState::Configured => return Ok(record.status(uid)),
                SandboxState::Cleaning | SandboxState::Cleaned => {
                    info!(uid, state = %record.state, "Ignoring sandbox creation after cleanup");
                    return Ok(record.status(uid));
                }
                SandboxState::Unconfigured | SandboxState::Configuring => {}
            }
            // an unfinished attempt left devices in another namespace
            let stale = record
                .netns
                .as_ref()
                .filter(|n| **n != netns && !record.interfaces.is_empty())
                .cloned();
            if let Some(stale) = stale {
                self.rollback(uid, &stale).await;
                if self.holds_devices(uid) {
                    return Err(Report::new(DriverError::State {
                        message: format!("devices of an earlier attempt are still in {stale}"),
                    }));
                }
            }
        }

        {
            let mut record = self
                .records
                .entry(uid.to_string())
                .or_insert_with(|| SandboxRecord::new(SandboxState::Configuring));
            record.state = SandboxState::Configuring;
            record.netns = Some(netns.clone());
        }

        let prepared = match self.coordinator.wait_prepared(uid, deadline).await {
            Ok(prepared) => prepared,
            Err(report) => {
                self.set_state(uid, SandboxState::Unconfigured);
                return Err(report);
            }
        };

        let mut configured: Vec<ConfiguredInterface> = Vec::with_capacity(prepared.devices.len());
        for (index, device) in prepared.devices.iter().enumerate() {
            let outcome = match self.driver.pod_ifname(uid, device, index) {
                Ok(pod_ifname) => {
                    // tracked before the move so that an abandoned attempt is still cleaned up
                    self.track_interface(
                        uid,
                        ConfiguredInterface {
                            device: device.clone(),
                            pod_ifname,
                        },
                    );
                    tokio::time::timeout_at(
                        deadline,
                        self.driver.configure_device(uid, device, index, &netns),
                    )
                    .await
                }
                Err(report) => Ok(Err(report)),
            };
            let report = match outcome {
                Ok(Ok(pod_ifname)) => {
                    configured.push(ConfiguredInterface {
                        device: device.clone(),
                        pod_ifname,
                    });
                    continue;
                }
                Ok(Err(report)) => report,
                Err(_) => Report::new(DriverError::timeout(uid, "configure device"))
                    .attach_printable(format!("device: {}", device.key())),
            };

            warn!(uid, device = %device.name, "Configuring sandbox failed, rolling back");
            self.rollback(uid, &netns).await;
            return Err(report);
        }

        let status = {
            let mut record = self
                .records
                .entry(uid.to_string())
                .or_insert_with(|| SandboxRecord::new(SandboxState::Configured));
            record.state = SandboxState::Configured;
            record.netns = Some(netns.clone());
            record.interfaces = configured;
            record.status(uid)
        };
        info!(uid, netns = %netns, interfaces = ?status.interfaces, "Sandbox configured");
        Ok(status)
    }

    fn track_interface(&self, uid: &str, interface: ConfiguredInterface) {
        if let Some(mut record) = self.records.get_mut(uid) {
            let key = interface.device.key();
            record.interfaces.retain(|i| i.device.key() != key);
            record.interfaces.push(interface);
        }
    }

    /// Whether the workload's record still tracks devices that may sit in a
    /// sandbox namespace
    fn holds_devices(&self, uid: &str) -> bool {
        self.records.get(uid).is_some_and(|r| {
            matches!(r.state, SandboxState::Configured | SandboxState::Cleaning)
                || !r.interfaces.is_empty()
        })
    }

    /// Moves every tracked device out of `netns` and returns the record to
    /// Unconfigured. Devices whose cleanup fails stay tracked.
    async fn rollback(&self, uid: &str, netns: &NamespaceHandle) {
        let interfaces = self.snapshot(uid).map(|r| r.interfaces).unwrap_or_default();
        let mut remaining = Vec::new();
        for interface in interfaces.into_iter().rev() {
            if let Err(report) = self
                .driver
                .cleanup_device(uid, &interface.device, &interface.pod_ifname, netns)
                .await
            {
                error!(uid, device = %interface.device.name, "Rollback failed: {report:?}");
                remaining.push(interface);
            }
        }
        remaining.reverse();
        if let Some(mut record) = self.records.get_mut(uid) {
            record.state = SandboxState::Unconfigured;
            record.interfaces = remaining;
        }
    }

    /// Sandbox stopped: moves every configured device back out.
    ///
    /// Delivered more than once or before the sandbox was ever configured,
    /// it does nothing.
    pub async fn stop_sandbox(
        &self,
        uid: &str,
        deadline: Instant,
    ) -> Result<SandboxStatus, Report<DriverError>> {
        let _guard = self
            .locks
            .lock_until(&uid.to_string(), deadline)
            .await
            .ok_or_else(|| Report::new(DriverError::timeout(uid, "stop sandbox")))?;

        self.clean(uid, deadline).await
    }

    /// Moves devices out of a sandbox before its workload is unprepared,
    /// including those of an unfinished configuration. Workloads without a
    /// sandbox are left alone.
    pub async fn release_for_unprepare(
        &self,
        uid: &str,
        deadline: Instant,
    ) -> Result<(), Report<DriverError>> {
        let _guard = self
            .locks
            .lock_until(&uid.to_string(), deadline)
            .await
            .ok_or_else(|| Report::new(DriverError::timeout(uid, "release sandbox devices")))?;

        if !self.holds_devices(uid) {
            return Ok(());
        }
        info!(uid, "Releasing sandbox devices before unprepare");
        self.clean(uid, deadline).await.map(|_| ())
    }

    /// Sandbox removed: cleans up if still needed and forgets the workload
    pub async fn remove_sandbox(
        &self,
        uid: &str,
        deadline: Instant,
    ) -> Result<(), Report<DriverError>> {
        let _guard = self
            .locks
            .lock_until(&uid.to_string(), deadline)
            .await
            .ok_or_else(|| Report::new(DriverError::timeout(uid, "remove sandbox")))?;

        if self.holds_devices(uid) {
            self.clean(uid, deadline).await?;
        }
        self.records.remove(uid);
        Ok(())
    }

    /// Configured/Cleaning -> Cleaned, also for unfinished configurations
    /// that still track devices. Caller holds the workload's lock.
    async fn clean(&self, uid: &str, deadline: Instant) -> Result<SandboxStatus, Report<DriverError>> {
        let Some(record) = self.snapshot(uid) else {
            // stop before create: a late creation hook must not configure
            info!(uid, "Sandbox stopped before it was configured");
            self.set_state(uid, SandboxState::Cleaned);
            return Ok(SandboxRecord::new(SandboxState::Cleaned).status(uid));
        };

        match record.state {
            SandboxState::Cleaned => {
                info!(uid, "Sandbox already cleaned, ignoring stop");
                return Ok(record.status(uid));
            }
            SandboxState::Unconfigured | SandboxState::Configuring
                if record.interfaces.is_empty() =>
            {
                self.set_state(uid, SandboxState::Cleaned);
                return Ok(SandboxRecord::new(SandboxState::Cleaned).status(uid));
            }
            SandboxState::Unconfigured | SandboxState::Configuring => {
                info!(uid, devices = record.interfaces.len(), "Cleaning devices of an unfinished configuration");
            }
            SandboxState::Configured | SandboxState::Cleaning => {}
        }

        self.set_state(uid, SandboxState::Cleaning);
        let Some(netns) = record.netns.clone() else {
            return Err(Report::new(DriverError::State {
                message: format!("sandbox {uid} tracks devices but has no namespace"),
            }));
        };

        let mut remaining = Vec::new();
        let mut failure: Option<Report<DriverError>> = None;
        for interface in record.interfaces.iter().rev() {
            let outcome = tokio::time::timeout_at(
                deadline,
                self.driver
                    .cleanup_device(uid, &interface.device, &interface.pod_ifname, &netns),
            )
            .await;
            let report = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(report)) => report,
                Err(_) => Report::new(DriverError::timeout(uid, "cleanup device")),
            };
            warn!(uid, device = %interface.device.name, "Cleanup failed: {report:?}");
            remaining.push(interface.clone());
            failure = Some(match failure {
                Some(mut first) => {
                    first.extend_one(report);
                    first
                }
                None => report,
            });
        }
        remaining.reverse();

        let status = {
            let mut record = self
                .records
                .entry(uid.to_string())
                .or_insert_with(|| SandboxRecord::new(SandboxState::Cleaning));
            record.interfaces = remaining;
            if failure.is_none() {
                record.state = SandboxState::Cleaned;
            }
            record.status(uid)
        };

        match failure {
            Some(report) => Err(report),
            None => {
                info!(uid, netns = %netns, "Sandbox cleaned");
                Ok(status)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use api_types::AllocationResult;
    use api_types::DeviceRequestResult;
    use api_types::ResourceClaim;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::drivers::hostdevice::HostDeviceDriver;
    use crate::netns::mock::FakeNetwork;

    struct Harness {
        net: Arc<FakeNetwork>,
        coordinator: Arc<AllocationCoordinator>,
        dispatcher: Arc<SandboxHookDispatcher>,
        netns: NamespaceHandle,
    }

    fn harness(links: &[&str]) -> Harness {
        let net = Arc::new(FakeNetwork::new());
        for link in links {
            net.add_host_link(link, true);
        }
        let netns = net.add_namespace("/var/run/netns/pod-a");
        let driver: Arc<dyn NetworkDriver> =
            Arc::new(HostDeviceDriver::with_defaults(net.clone()));
        let coordinator = Arc::new(AllocationCoordinator::new(driver.clone()));
        let dispatcher = Arc::new(SandboxHookDispatcher::new(coordinator.clone(), driver));
        Harness {
            net,
            coordinator,
            dispatcher,
            netns,
        }
    }

    fn claim(uid: &str, devices: &[&str]) -> ResourceClaim {
        ResourceClaim {
            name: "nic".to_string(),
            namespace: "default".to_string(),
            workload_uid: uid.to_string(),
            allocation: Some(AllocationResult {
                devices: devices
                    .iter()
                    .map(|d| DeviceRequestResult {
                        request: "nic".to_string(),
                        driver: "hostdevice.k8s.io".to_string(),
                        pool: "node-a".to_string(),
                        device: d.to_string(),
                    })
                    .collect(),
            }),
        }
    }

    fn sandbox(uid: &str) -> PodSandbox {
        PodSandbox {
            uid: uid.to_string(),
            namespace: "default".to_string(),
            name: "pod-a".to_string(),
            netns: Some("/var/run/netns/pod-a".to_string()),
        }
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[test(tokio::test)]
    async fn run_then_stop_round_trip() {
        let h = harness(&["eth1", "eth2"]);
        let before = h.net.host_inventory();
        h.coordinator.prepare(&claim("uid-1", &["eth1", "eth2"]), deadline()).await.expect("prepare");

        let status = h.dispatcher.run_sandbox(&sandbox("uid-1"), deadline()).await.expect("run");
        assert_eq!(status.state, "configured");
        assert_eq!(status.interfaces, vec!["eth1".to_string(), "eth2".to_string()]);
        assert_eq!(h.net.link_names(&h.netns), vec!["eth1", "eth2"]);
        assert!(h.net.link_names(&NamespaceHandle::Host).is_empty());

        let status = h.dispatcher.stop_sandbox("uid-1", deadline()).await.expect("stop");
        assert_eq!(status.state, "cleaned");
        assert_eq!(h.net.host_inventory(), before);

        // repeated delivery is a no-op
        h.dispatcher.stop_sandbox("uid-1", deadline()).await.expect("stop again");
        let moves = h.net.move_count();
        h.dispatcher.run_sandbox(&sandbox("uid-1"), deadline()).await.expect("late run");
        assert_eq!(h.net.move_count(), moves);
        assert_eq!(h.dispatcher.state("uid-1"), Some(SandboxState::Cleaned));
    }

    #[test(tokio::test)]
    async fn run_is_idempotent_while_configured() {
        let h = harness(&["eth1"]);
        h.coordinator.prepare(&claim("uid-1", &["eth1"]), deadline()).await.expect("prepare");

        h.dispatcher.run_sandbox(&sandbox("uid-1"), deadline()).await.expect("run");
        h.dispatcher.run_sandbox(&sandbox("uid-1"), deadline()).await.expect("rerun");
        assert_eq!(h.net.move_count(), 1);
    }

    #[test(tokio::test)]
    async fn run_waits_for_late_prepare() {
        let h = harness(&["eth1"]);
        let run = {
            let dispatcher = Arc::clone(&h.dispatcher);
            tokio::spawn(async move { dispatcher.run_sandbox(&sandbox("uid-1"), deadline()).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(h.dispatcher.state("uid-1"), Some(SandboxState::Configuring));

        h.coordinator.prepare(&claim("uid-1", &["eth1"]), deadline()).await.expect("prepare");
        let status = run.await.unwrap().expect("run after prepare");
        assert_eq!(status.state, "configured");
        assert_eq!(h.net.link_names(&h.netns), vec!["eth1"]);
    }

    #[test(tokio::test)]
    async fn run_without_prepare_times_out_unconfigured() {
        let h = harness(&["eth1"]);
        let short = Instant::now() + Duration::from_millis(30);
        let err = h.dispatcher.run_sandbox(&sandbox("uid-1"), short).await.expect_err("timeout");
        assert!(matches!(err.current_context(), DriverError::Timeout { .. }));
        assert_eq!(h.dispatcher.state("uid-1"), Some(SandboxState::Unconfigured));
        assert_eq!(h.net.mutation_count(), 0);
    }

    #[test(tokio::test)]
    async fn failed_second_move_rolls_back_first() {
        let h = harness(&["eth1", "eth2"]);
        let before = h.net.host_inventory();
        h.net.fail_move_of("eth2");
        h.coordinator.prepare(&claim("uid-1", &["eth1", "eth2"]), deadline()).await.expect("prepare");

        let err = h.dispatcher.run_sandbox(&sandbox("uid-1"), deadline()).await.expect_err("eth2 fails");
        assert!(matches!(err.current_context(), DriverError::Network { .. }));
        assert_eq!(h.net.host_inventory(), before);
        assert!(h.net.link_names(&h.netns).is_empty());
        assert_eq!(h.dispatcher.state("uid-1"), Some(SandboxState::Unconfigured));
    }

    #[test(tokio::test)]
    async fn stop_before_run_marks_cleaned() {
        let h = harness(&["eth1"]);
        h.coordinator.prepare(&claim("uid-1", &["eth1"]), deadline()).await.expect("prepare");

        let status = h.dispatcher.stop_sandbox("uid-1", deadline()).await.expect("stop");
        assert_eq!(status.state, "cleaned");
        h.dispatcher.run_sandbox(&sandbox("uid-1"), deadline()).await.expect("late run");
        assert_eq!(h.net.move_count(), 0);
    }

    #[test(tokio::test)]
    async fn stop_after_namespace_vanished_succeeds() {
        let h = harness(&["eth1"]);
        h.coordinator.prepare(&claim("uid-1", &["eth1"]), deadline()).await.expect("prepare");
        h.dispatcher.run_sandbox(&sandbox("uid-1"), deadline()).await.expect("run");

        h.net.remove_namespace(&h.netns);
        let status = h.dispatcher.stop_sandbox("uid-1", deadline()).await.expect("stop");
        assert_eq!(status.state, "cleaned");
    }

    #[test(tokio::test)]
    async fn sandbox_without_namespace_is_rejected() {
        let h = harness(&["eth1"]);
        let mut sb = sandbox("uid-1");
        sb.netns = None;
        let err = h.dispatcher.run_sandbox(&sb, deadline()).await.expect_err("no netns");
        assert!(matches!(err.current_context(), DriverError::MissingNamespace { .. }));
        assert_eq!(h.dispatcher.state("uid-1"), None);
    }

    #[test(tokio::test)]
    async fn release_for_unprepare_moves_devices_out() {
        let h = harness(&["eth1"]);
        let before = h.net.host_inventory();
        h.coordinator.prepare(&claim("uid-1", &["eth1"]), deadline()).await.expect("prepare");
        h.dispatcher.run_sandbox(&sandbox("uid-1"), deadline()).await.expect("run");

        h.dispatcher.release_for_unprepare("uid-1", deadline()).await.expect("release");
        assert_eq!(h.net.host_inventory(), before);
        assert_eq!(h.dispatcher.state("uid-1"), Some(SandboxState::Cleaned));

        h.dispatcher.remove_sandbox("uid-1", deadline()).await.expect("remove");
        assert_eq!(h.dispatcher.state("uid-1"), None);
    }

    #[test(tokio::test)]
    async fn configure_timeout_is_reported_and_retry_resumes() {
        let h = harness(&["eth1"]);
        h.coordinator.prepare(&claim("uid-1", &["eth1"]), deadline()).await.expect("prepare");
        h.net.set_latency(Some(Duration::from_millis(200)));

        let short = Instant::now() + Duration::from_millis(50);
        let err = h.dispatcher.run_sandbox(&sandbox("uid-1"), short).await.expect_err("slow move");
        assert!(matches!(err.current_context(), DriverError::Timeout { .. }));
        assert_eq!(h.dispatcher.state("uid-1"), Some(SandboxState::Unconfigured));

        h.net.set_latency(None);
        let status = h.dispatcher.run_sandbox(&sandbox("uid-1"), deadline()).await.expect("retry");
        assert_eq!(status.state, "configured");
        assert_eq!(h.net.link_names(&h.netns), vec!["eth1"]);
    }

    #[test(tokio::test)]
    async fn different_workloads_configure_in_parallel() {
        let h = harness(&["eth1", "eth2"]);
        let ns_b = h.net.add_namespace("/var/run/netns/pod-b");
        h.coordinator.prepare(&claim("uid-a", &["eth1"]), deadline()).await.expect("a");
        h.coordinator.prepare(&claim("uid-b", &["eth2"]), deadline()).await.expect("b");
        h.net.set_latency(Some(Duration::from_millis(100)));

        let sb_a = sandbox("uid-a");
        let mut sb_b = sandbox("uid-b");
        sb_b.netns = Some("/var/run/netns/pod-b".to_string());
        let started = std::time::Instant::now();
        let (a, b) = tokio::join!(
            h.dispatcher.run_sandbox(&sb_a, deadline()),
            h.dispatcher.run_sandbox(&sb_b, deadline()),
        );
        a.expect("a");
        b.expect("b");
        assert!(started.elapsed() < Duration::from_millis(190));
        assert_eq!(h.net.link_names(&ns_b), vec!["eth2"]);
    }

    /// Runs the creation hook for eth1 and eth2 and drops it after both moves
    /// took effect but before the second one returned.
    async fn abandon_run_between_moves(h: &Harness) {
        h.coordinator
            .prepare(&claim("uid-1", &["eth1", "eth2"]), deadline())
            .await
            .expect("prepare");
        h.net.set_settle_delay(Some(Duration::from_millis(100)));
        let sb = sandbox("uid-1");
        let abandoned =
            tokio::time::timeout(Duration::from_millis(150), h.dispatcher.run_sandbox(&sb, deadline()))
                .await;
        assert!(abandoned.is_err());
        h.net.set_settle_delay(None);
        assert_eq!(h.net.link_names(&h.netns), vec!["eth1", "eth2"]);
        assert_eq!(h.dispatcher.state("uid-1"), Some(SandboxState::Configuring));
    }

    #[test(tokio::test)]
    async fn stop_after_abandoned_run_returns_moved_devices() {
        let h = harness(&["eth1", "eth2"]);
        let before = h.net.host_inventory();
        abandon_run_between_moves(&h).await;

        let status = h.dispatcher.stop_sandbox("uid-1", deadline()).await.expect("stop");
        assert_eq!(status.state, "cleaned");
        assert!(status.interfaces.is_empty());
        assert_eq!(h.net.host_inventory(), before);
        assert!(h.net.link_names(&h.netns).is_empty());
    }

    #[test(tokio::test)]
    async fn unprepare_after_abandoned_run_returns_moved_devices() {
        let h = harness(&["eth1", "eth2"]);
        let before = h.net.host_inventory();
        abandon_run_between_moves(&h).await;

        h.dispatcher.release_for_unprepare("uid-1", deadline()).await.expect("release");
        h.coordinator.unprepare("uid-1", deadline()).await.expect("unprepare");
        assert_eq!(h.net.host_inventory(), before);
        assert!(h.net.link_names(&h.netns).is_empty());
        assert_eq!(h.coordinator.owner_of("node-a/eth1"), None);
    }

    #[test(tokio::test)]
    async fn remove_after_abandoned_run_returns_moved_devices() {
        let h = harness(&["eth1", "eth2"]);
        let before = h.net.host_inventory();
        abandon_run_between_moves(&h).await;

        h.dispatcher.remove_sandbox("uid-1", deadline()).await.expect("remove");
        assert_eq!(h.net.host_inventory(), before);
        assert_eq!(h.dispatcher.state("uid-1"), None);
    }

    #[test(tokio::test)]
    async fn timed_out_move_that_took_effect_is_rolled_back() {
        let h = harness(&["eth1", "eth2"]);
        let before = h.net.host_inventory();
        h.coordinator
            .prepare(&claim("uid-1", &["eth1", "eth2"]), deadline())
            .await
            .expect("prepare");
        h.net.set_settle_delay(Some(Duration::from_millis(100)));

        let short = Instant::now() + Duration::from_millis(150);
        let err = h.dispatcher.run_sandbox(&sandbox("uid-1"), short).await.expect_err("slow reply");
        assert!(matches!(err.current_context(), DriverError::Timeout { .. }));
        assert_eq!(h.net.host_inventory(), before);
        assert!(h.net.link_names(&h.netns).is_empty());
        assert_eq!(h.dispatcher.state("uid-1"), Some(SandboxState::Unconfigured));
        assert!(h.dispatcher.status("uid-1").expect("record").interfaces.is_empty());

        h.net.set_settle_delay(None);
        let status = h.dispatcher.run_sandbox(&sandbox("uid-1"), deadline()).await.expect("retry");
        assert_eq!(status.interfaces, vec!["eth1".to_string(), "eth2".to_string()]);
    }
}
