//! Shared API type definitions
//!
//! This crate contains the boundary types exchanged between the network device
//! driver daemon and its callers: advertised devices, resource claims as seen
//! by the allocation control plane, sandbox hook payloads and the response
//! envelopes of the HTTP API.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

/// A single typed device attribute, serialized the way resource.k8s.io does
/// (`{"string": "eth1"}`, `{"bool": true}`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceAttribute {
    String(String),
    Int(i64),
    Bool(bool),
    Version(String),
}

impl DeviceAttribute {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) | Self::Version(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for DeviceAttribute {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for DeviceAttribute {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

/// A device advertised by a node driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Device name, unique within the driver's pool
    pub name: String,
    /// Descriptive facts about the device, e.g. `mac-address`
    #[serde(default)]
    pub attributes: BTreeMap<String, DeviceAttribute>,
    /// Capacity values as quantity strings, e.g. `memory: 4Gi`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub capacity: BTreeMap<String, String>,
}

impl Device {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<DeviceAttribute>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    /// Returns a string attribute by key
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(DeviceAttribute::as_str)
    }
}

/// One concrete device bound to a request of a claim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRequestResult {
    /// Name of the request inside the claim
    pub request: String,
    /// Driver that owns the device
    pub driver: String,
    /// Pool the device was drawn from
    pub pool: String,
    /// Device name inside the pool
    pub device: String,
}

/// Allocation result written by the allocation control plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AllocationResult {
    #[serde(default)]
    pub devices: Vec<DeviceRequestResult>,
}

/// A request for devices on behalf of one workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceClaim {
    /// Claim name
    pub name: String,
    /// Claim namespace
    pub namespace: String,
    /// UID of the workload the claim is bound to
    pub workload_uid: String,
    /// Allocation result, absent until the claim is bound
    #[serde(default)]
    pub allocation: Option<AllocationResult>,
}

impl ResourceClaim {
    /// Returns the bound device results, empty when the claim is not allocated
    pub fn allocated_results(&self) -> &[DeviceRequestResult] {
        self.allocation
            .as_ref()
            .map(|a| a.devices.as_slice())
            .unwrap_or_default()
    }
}

/// A device bound to one workload, carrying the pool and request it came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocatedDevice {
    pub name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, DeviceAttribute>,
    pub pool_name: String,
    pub request: String,
}

impl AllocatedDevice {
    /// Key identifying the device across pools
    pub fn key(&self) -> String {
        format!("{}/{}", self.pool_name, self.name)
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(DeviceAttribute::as_str)
    }
}

/// Prepared devices for a workload as returned to the allocation control plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreparedClaim {
    pub workload_uid: String,
    /// Opaque driver token
    pub token: String,
    pub devices: Vec<AllocatedDevice>,
}

/// Sandbox identity delivered by the runtime hooks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSandbox {
    /// Workload UID
    pub uid: String,
    pub namespace: String,
    pub name: String,
    /// Path of the sandbox network namespace, e.g. `/var/run/netns/cni-1234`
    #[serde(default)]
    pub netns: Option<String>,
}

/// Body of the sandbox hook endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxHookRequest {
    pub sandbox: PodSandbox,
    /// Caller deadline in milliseconds; the daemon default applies when absent
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Body of the unprepare endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnprepareRequest {
    pub workload_uid: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Generic response envelope of the HTTP API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// Whether the request was successful
    pub success: bool,
    /// Payload (present when successful)
    pub data: Option<T>,
    /// Response message
    pub message: String,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: message.into(),
        }
    }
}

/// Sandbox hook state reported back to the runtime shim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxStatus {
    pub uid: String,
    pub state: String,
    /// Interface names inside the sandbox namespace
    #[serde(default)]
    pub interfaces: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_attribute_uses_resource_api_shape() {
        let device = Device::new("eth1").with_attribute("mac-address", "aa:bb:cc:dd:ee:ff");
        let json = serde_json::to_value(&device).expect("serialize device");
        assert_eq!(
            json["attributes"]["mac-address"]["string"],
            "aa:bb:cc:dd:ee:ff"
        );
        assert!(json.get("capacity").is_none());
    }

    #[test]
    fn unallocated_claim_has_no_results() {
        let claim: ResourceClaim = serde_json::from_str(
            r#"{"name":"c","namespace":"default","workloadUid":"uid-1"}"#,
        )
        .expect("parse claim");
        assert!(claim.allocated_results().is_empty());
    }

    #[test]
    fn allocated_device_key_includes_pool() {
        let device = AllocatedDevice {
            name: "eth1".to_string(),
            attributes: BTreeMap::new(),
            pool_name: "node-a".to_string(),
            request: "nic".to_string(),
        };
        assert_eq!(device.key(), "node-a/eth1");
    }
}
