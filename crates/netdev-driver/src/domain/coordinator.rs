//! Allocation coordinator
//!
//! Owns the workload UID -> [`PreparedState`] table. Every mutation of an
//! entry happens while holding that UID's key in a [`KeyedAsyncLock`], so
//! retries of the same workload are serialized while different workloads run
//! in parallel. A second index maps claimed device keys to their owner and is
//! only updated through `DashMap` entries, which makes the
//! "one device, one workload" check atomic per device.

use std::sync::Arc;

use api_types::AllocatedDevice;
use api_types::ResourceClaim;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use error_stack::Report;
use error_stack::ResultExt;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;
use utils::keyed_lock::KeyedAsyncLock;

use super::driver::NetworkDriver;
use super::types::allocated_device;
use super::types::DriverError;
use super::types::PreparedState;
use super::types::WorkloadUid;

pub struct AllocationCoordinator {
    driver: Arc<dyn NetworkDriver>,
    prepared: DashMap<WorkloadUid, Arc<PreparedState>>,
    /// device key -> owning workload
    claimed: DashMap<String, WorkloadUid>,
    locks: KeyedAsyncLock<WorkloadUid>,
    /// wakeups for tasks waiting on a workload that is not prepared yet
    waiters: DashMap<WorkloadUid, Arc<Notify>>,
}

/// Gives claimed devices back unless disarmed, also when `prepare` is dropped
/// mid-flight
struct ClaimGuard<'a> {
    claimed: &'a DashMap<String, WorkloadUid>,
    uid: &'a str,
    keys: Vec<String>,
}

impl<'a> ClaimGuard<'a> {
    fn new(claimed: &'a DashMap<String, WorkloadUid>, uid: &'a str, devices: &[AllocatedDevice]) -> Self {
        Self {
            claimed,
            uid,
            keys: devices.iter().map(AllocatedDevice::key).collect(),
        }
    }

    fn disarm(mut self) {
        self.keys.clear();
    }
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        for key in &self.keys {
            self.claimed.remove_if(key, |_, owner| owner == self.uid);
        }
    }
}

impl AllocationCoordinator {
    pub fn new(driver: Arc<dyn NetworkDriver>) -> Self {
        Self {
            driver,
            prepared: DashMap::new(),
            claimed: DashMap::new(),
            locks: KeyedAsyncLock::new(),
            waiters: DashMap::new(),
        }
    }

    /// Prepares the devices bound to `claim`.
    ///
    /// A retry for a workload that is already prepared returns the stored
    /// state and runs nothing.
    pub async fn prepare(
        &self,
        claim: &ResourceClaim,
        deadline: Instant,
    ) -> Result<Arc<PreparedState>, Report<DriverError>> {
        let uid = claim.workload_uid.clone();
        let _guard = self
            .locks
            .lock_until(&uid, deadline)
            .await
            .ok_or_else(|| Report::new(DriverError::timeout(&uid, "prepare")))?;

        if let Some(existing) = self.get(&uid) {
            debug!(uid = %uid, "Workload already prepared");
            return Ok(existing);
        }

        let devices = self.resolve_devices(claim).await?;
        self.claim_devices(&uid, &devices)?;
        let claims = ClaimGuard::new(&self.claimed, &uid, &devices);

        let token = match tokio::time::timeout_at(deadline, self.driver.prepare(&uid, &devices)).await
        {
            Ok(Ok(token)) => token,
            Ok(Err(report)) => {
                return Err(report.attach_printable(format!("claim {}/{}", claim.namespace, claim.name)));
            }
            Err(_) => return Err(Report::new(DriverError::timeout(&uid, "prepare"))),
        };

        let state = Arc::new(PreparedState {
            uid: uid.clone(),
            token,
            devices,
        });
        self.prepared.insert(uid.clone(), Arc::clone(&state));
        claims.disarm();
        if let Some((_, notify)) = self.waiters.remove(&uid) {
            notify.notify_waiters();
        }

        info!(
            uid = %uid,
            claim = %format!("{}/{}", claim.namespace, claim.name),
            devices = ?state.device_keys(),
            "Prepared workload"
        );
        Ok(state)
    }

    /// Releases everything prepared for `uid`. Unknown workloads are already
    /// clean. On driver failure the state is kept so the call can be retried.
    pub async fn unprepare(&self, uid: &str, deadline: Instant) -> Result<(), Report<DriverError>> {
        let uid = uid.to_string();
        let _guard = self
            .locks
            .lock_until(&uid, deadline)
            .await
            .ok_or_else(|| Report::new(DriverError::timeout(&uid, "unprepare")))?;

        let Some(state) = self.get(&uid) else {
            self.release_owned(&uid);
            debug!(uid = %uid, "Nothing prepared for workload");
            return Ok(());
        };

        match tokio::time::timeout_at(deadline, self.driver.unprepare(&uid, &state.devices)).await {
            Ok(Ok(())) => {}
            Ok(Err(report)) => return Err(report),
            Err(_) => return Err(Report::new(DriverError::timeout(&uid, "unprepare"))),
        }

        self.prepared.remove(&uid);
        self.release_owned(&uid);
        info!(uid = %uid, "Unprepared workload");
        Ok(())
    }

    pub fn get(&self, uid: &str) -> Option<Arc<PreparedState>> {
        self.prepared.get(uid).map(|entry| Arc::clone(entry.value()))
    }

    pub fn prepared_count(&self) -> usize {
        self.prepared.len()
    }

    /// Owner of a claimed device key, if any
    pub fn owner_of(&self, device_key: &str) -> Option<WorkloadUid> {
        self.claimed.get(device_key).map(|e| e.value().clone())
    }

    /// Waits until `uid` is prepared or `deadline` passes
    pub async fn wait_prepared(
        &self,
        uid: &str,
        deadline: Instant,
    ) -> Result<Arc<PreparedState>, Report<DriverError>> {
        let notify = Arc::clone(self.waiters.entry(uid.to_string()).or_default().value());
        let result = loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            // register before checking so an insert in between is not missed
            notified.as_mut().enable();

            if let Some(state) = self.get(uid) {
                break Ok(state);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break Err(Report::new(DriverError::timeout(uid, "waiting for prepared devices")));
            }
        };
        drop(notify);
        // the last waiter of a workload that never got prepared cleans up
        self.waiters.remove_if(uid, |_, notify| Arc::strong_count(notify) == 1);
        result
    }

    async fn resolve_devices(
        &self,
        claim: &ResourceClaim,
    ) -> Result<Vec<AllocatedDevice>, Report<DriverError>> {
        let uid = &claim.workload_uid;
        let results: Vec<_> = claim
            .allocated_results()
            .iter()
            .filter(|r| r.driver == self.driver.name())
            .collect();
        if results.is_empty() {
            return Err(Report::new(DriverError::NoAllocation { uid: uid.clone() }))
                .attach_printable_lazy(|| format!("claim {}/{}", claim.namespace, claim.name));
        }

        let inventory = self.driver.list_devices().await?;
        results
            .into_iter()
            .map(|result| {
                inventory
                    .iter()
                    .find(|d| d.name == result.device)
                    .map(|d| allocated_device(d, &result.pool, &result.request))
                    .ok_or_else(|| {
                        Report::new(DriverError::DeviceNotFound {
                            uid: uid.clone(),
                            device: result.device.clone(),
                        })
                    })
            })
            .collect()
    }

    /// Records `uid` as owner of every device or of none
    fn claim_devices(&self, uid: &str, devices: &[AllocatedDevice]) -> Result<(), Report<DriverError>> {
        let mut taken = Vec::with_capacity(devices.len());
        for device in devices {
            let key = device.key();
            match self.claimed.entry(key.clone()) {
                Entry::Vacant(vacant) => {
                    vacant.insert(uid.to_string());
                    taken.push(key);
                }
                Entry::Occupied(occupied) if occupied.get() == uid => {}
                Entry::Occupied(occupied) => {
                    let owner = occupied.get().clone();
                    drop(occupied);
                    for key in taken {
                        self.claimed.remove(&key);
                    }
                    warn!(uid, device = %key, owner = %owner, "Device already claimed");
                    return Err(Report::new(DriverError::DeviceClaimed { device: key, owner }));
                }
            }
        }
        Ok(())
    }

    /// Drops every device claim held by `uid`
    fn release_owned(&self, uid: &str) {
        self.claimed.retain(|_, owner| owner != uid);
    }
}
