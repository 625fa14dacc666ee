//! Core data structures and the error taxonomy shared by the coordinator,
//! the hook dispatcher and the drivers.

use api_types::AllocatedDevice;
use api_types::PreparedClaim;
use thiserror::Error;

use crate::netns::NetError;

/// Stable identity keying all prepared state and hook correlation
pub type WorkloadUid = String;

/// Prepared devices for one workload.
///
/// Created once per UID and shared read-only; a retried prepare returns the
/// very same value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedState {
    pub uid: WorkloadUid,
    /// Opaque value returned by the driver's prepare step
    pub token: String,
    pub devices: Vec<AllocatedDevice>,
}

impl PreparedState {
    pub fn to_claim(&self) -> PreparedClaim {
        PreparedClaim {
            workload_uid: self.uid.clone(),
            token: self.token.clone(),
            devices: self.devices.clone(),
        }
    }

    pub fn device_keys(&self) -> Vec<String> {
        self.devices.iter().map(AllocatedDevice::key).collect()
    }
}

/// How the caller at a boundary should treat a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum ErrorKind {
    /// Retrying later with backoff may succeed
    #[display("transient")]
    Transient,
    /// Retrying the same request fails the same way
    #[display("permanent")]
    Permanent,
    /// Nothing left to do; reported for logging only
    #[display("unrecoverable-safe")]
    UnrecoverableSafe,
}

/// Errors surfaced by coordinator, dispatcher and drivers
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("claim for workload {uid} has no allocated devices")]
    NoAllocation { uid: WorkloadUid },

    #[error("device {device} requested by workload {uid} is not advertised by this node")]
    DeviceNotFound { uid: WorkloadUid, device: String },

    #[error("device {device} is already claimed by workload {owner}")]
    DeviceClaimed { device: String, owner: WorkloadUid },

    #[error("{operation} for workload {uid} timed out")]
    Timeout {
        uid: WorkloadUid,
        operation: &'static str,
    },

    #[error("sandbox of workload {uid} carries no network namespace")]
    MissingNamespace { uid: WorkloadUid },

    #[error("{operation} of device {device} for workload {uid} failed: {source}")]
    Network {
        uid: WorkloadUid,
        device: String,
        operation: &'static str,
        source: NetError,
    },

    #[error("device enumeration failed: {message}")]
    Enumeration { message: String },

    #[error("driver state error: {message}")]
    State { message: String },
}

impl DriverError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoAllocation { .. }
            | Self::DeviceNotFound { .. }
            | Self::MissingNamespace { .. } => ErrorKind::Permanent,
            Self::DeviceClaimed { .. }
            | Self::Timeout { .. }
            | Self::Enumeration { .. }
            | Self::State { .. } => ErrorKind::Transient,
            Self::Network { source, .. } => match source {
                // the sandbox may not have published its namespace yet
                NetError::NamespaceNotFound { .. } | NetError::Netlink { .. } => {
                    ErrorKind::Transient
                }
                NetError::LinkNotFound { .. }
                | NetError::SubInterfaceConflict { .. }
                | NetError::ParentBusy { .. }
                | NetError::NameInUse { .. } => ErrorKind::Permanent,
            },
        }
    }

    pub fn timeout(uid: &str, operation: &'static str) -> Self {
        Self::Timeout {
            uid: uid.to_string(),
            operation,
        }
    }

    pub fn network(uid: &str, device: &str, operation: &'static str, source: &NetError) -> Self {
        Self::Network {
            uid: uid.to_string(),
            device: device.to_string(),
            operation,
            source: source.clone(),
        }
    }
}

/// Attribute keys advertised on devices
pub mod attributes {
    pub const INTERFACE_NAME: &str = "interface-name";
    pub const MAC_ADDRESS: &str = "mac-address";
    pub const PARENT: &str = "parent";
    pub const MODE: &str = "mode";
    pub const FEATURE: &str = "feature";
}

/// Builds the attribute map of an [`AllocatedDevice`] from an advertised one
pub fn allocated_device(
    device: &api_types::Device,
    pool_name: &str,
    request: &str,
) -> AllocatedDevice {
    AllocatedDevice {
        name: device.name.clone(),
        attributes: device.attributes.clone(),
        pool_name: pool_name.to_string(),
        request: request.to_string(),
    }
}
