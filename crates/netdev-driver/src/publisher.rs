//! Periodic publication of the node's device inventory.
//!
//! Failures never stop the loop; they are handed to the driver's
//! [`handle_error`](crate::domain::NetworkDriver::handle_error).

use std::sync::Arc;
use std::time::Duration;

use api_types::Device;
use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use kube::api::Api;
use kube::api::ApiResource;
use kube::api::DynamicObject;
use kube::api::Patch;
use kube::api::PatchParams;
use kube::Client;
use serde_json::json;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

use crate::domain::NetworkDriver;
use crate::kube_client::KubernetesError;

#[async_trait]
pub trait InventoryPublisher: Send + Sync {
    async fn publish(&self, devices: &[Device]) -> Result<(), Report<KubernetesError>>;
}

/// Server-side applies one `resource.k8s.io/v1` ResourceSlice per node and
/// driver
pub struct KubeSlicePublisher {
    api: Api<DynamicObject>,
    driver_name: String,
    node_name: String,
    pool_name: String,
    /// last published devices and the pool generation they went out with
    published: Mutex<Option<(Vec<Device>, i64)>>,
}

fn resource_slice_api_resource() -> ApiResource {
    ApiResource {
        group: "resource.k8s.io".to_string(),
        version: "v1".to_string(),
        api_version: "resource.k8s.io/v1".to_string(),
        kind: "ResourceSlice".to_string(),
        plural: "resourceslices".to_string(),
    }
}

impl KubeSlicePublisher {
    pub fn new(client: Client, driver_name: &str, node_name: &str, pool_name: &str) -> Self {
        Self {
            api: Api::all_with(client, &resource_slice_api_resource()),
            driver_name: driver_name.to_string(),
            node_name: node_name.to_string(),
            pool_name: pool_name.to_string(),
            published: Mutex::new(None),
        }
    }

    pub fn slice_name(&self) -> String {
        slice_name(&self.node_name, &self.driver_name)
    }
}

fn slice_name(node_name: &str, driver_name: &str) -> String {
    format!("{node_name}-{driver_name}")
        .to_lowercase()
        .replace(|c: char| !(c.is_ascii_alphanumeric() || c == '-'), "-")
}

/// ResourceSlice manifest for `devices`
pub fn slice_manifest(
    name: &str,
    driver_name: &str,
    node_name: &str,
    pool_name: &str,
    generation: i64,
    devices: &[Device],
) -> Value {
    let devices: Vec<Value> = devices
        .iter()
        .map(|d| {
            let capacity: serde_json::Map<String, Value> = d
                .capacity
                .iter()
                .map(|(k, v)| (k.clone(), json!({ "value": v })))
                .collect();
            let mut device = json!({ "name": d.name, "attributes": d.attributes });
            if !capacity.is_empty() {
                device["capacity"] = Value::Object(capacity);
            }
            device
        })
        .collect();

    json!({
        "apiVersion": "resource.k8s.io/v1",
        "kind": "ResourceSlice",
        "metadata": { "name": name },
        "spec": {
            "driver": driver_name,
            "nodeName": node_name,
            "pool": {
                "name": pool_name,
                "generation": generation,
                "resourceSliceCount": 1,
            },
            "devices": devices,
        },
    })
}

#[async_trait]
impl InventoryPublisher for KubeSlicePublisher {
    async fn publish(&self, devices: &[Device]) -> Result<(), Report<KubernetesError>> {
        let mut published = self.published.lock().await;
        let generation = match published.as_ref() {
            Some((last, generation)) if last.as_slice() == devices => *generation,
            Some((_, generation)) => generation + 1,
            None => 0,
        };

        let name = self.slice_name();
        let manifest = slice_manifest(
            &name,
            &self.driver_name,
            &self.node_name,
            &self.pool_name,
            generation,
            devices,
        );
        self.api
            .patch(
                &name,
                &PatchParams::apply(&self.driver_name).force(),
                &Patch::Apply(&manifest),
            )
            .await
            .change_context(KubernetesError::PublishFailed {
                message: format!("applying ResourceSlice {name}"),
            })?;

        if published.as_ref().map(|(_, g)| *g) != Some(generation) {
            info!(slice = %name, generation, devices = devices.len(), "Published device inventory");
        }
        *published = Some((devices.to_vec(), generation));
        Ok(())
    }
}

/// Publishes the driver's inventory every `interval` until cancelled
pub async fn run_publish_loop(
    driver: Arc<dyn NetworkDriver>,
    publisher: Arc<dyn InventoryPublisher>,
    interval: Duration,
    cancellation_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancellation_token.cancelled() => {
                info!("Inventory publisher stopped");
                return;
            }
            _ = ticker.tick() => {}
        }

        let devices = match driver.list_devices().await {
            Ok(devices) => devices,
            Err(report) => {
                driver.handle_error("listing devices for publication", &report);
                continue;
            }
        };
        debug!(devices = devices.len(), "Publishing device inventory");
        if let Err(report) = publisher.publish(&devices).await {
            driver.handle_error("publishing device inventory", &report);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use api_types::AllocatedDevice;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::domain::DriverError;
    use crate::netns::NamespaceHandle;

    #[derive(Default)]
    struct FlakyDriver {
        calls: AtomicUsize,
        errors: AtomicUsize,
    }

    #[async_trait]
    impl NetworkDriver for FlakyDriver {
        fn name(&self) -> &str {
            "flaky.k8s.io"
        }

        async fn list_devices(&self) -> Result<Vec<Device>, Report<DriverError>> {
            // every other scan fails
            if self.calls.fetch_add(1, Ordering::SeqCst) % 2 == 1 {
                return Err(Report::new(DriverError::Enumeration {
                    message: "scan race".to_string(),
                }));
            }
            Ok(vec![Device::new("eth1")])
        }

        async fn prepare(&self, _: &str, _: &[AllocatedDevice]) -> Result<String, Report<DriverError>> {
            Ok(String::new())
        }

        async fn unprepare(&self, _: &str, _: &[AllocatedDevice]) -> Result<(), Report<DriverError>> {
            Ok(())
        }

        async fn configure_device(
            &self,
            _: &str,
            device: &AllocatedDevice,
            _: usize,
            _: &NamespaceHandle,
        ) -> Result<String, Report<DriverError>> {
            Ok(device.name.clone())
        }

        async fn cleanup_device(
            &self,
            _: &str,
            _: &AllocatedDevice,
            _: &str,
            _: &NamespaceHandle,
        ) -> Result<(), Report<DriverError>> {
            Ok(())
        }

        fn handle_error(&self, _message: &str, _error: &(dyn std::fmt::Debug + Send + Sync)) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct RecordingPublisher {
        published: AtomicUsize,
    }

    #[async_trait]
    impl InventoryPublisher for RecordingPublisher {
        async fn publish(&self, _devices: &[Device]) -> Result<(), Report<KubernetesError>> {
            self.published.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test(tokio::test)]
    async fn loop_survives_errors_and_stops_on_cancel() {
        let driver = Arc::new(FlakyDriver::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let token = CancellationToken::new();

        let handle = tokio::spawn(run_publish_loop(
            driver.clone(),
            publisher.clone(),
            Duration::from_millis(5),
            token.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(60)).await;
        token.cancel();
        handle.await.unwrap();

        assert!(driver.errors.load(Ordering::SeqCst) >= 1);
        assert!(publisher.published.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn manifest_uses_resource_api_shape() {
        let mut device = Device::new("eth1").with_attribute("interface-name", "eth1");
        device.capacity.insert("bandwidth".to_string(), "10G".to_string());

        let name = slice_name("Node-A", "hostdevice.k8s.io");
        assert_eq!(name, "node-a-hostdevice-k8s-io");

        let manifest = slice_manifest(&name, "hostdevice.k8s.io", "node-a", "node-a", 3, &[device]);
        assert_eq!(manifest["spec"]["pool"]["generation"], 3);
        assert_eq!(manifest["spec"]["nodeName"], "node-a");
        assert_eq!(
            manifest["spec"]["devices"][0]["attributes"]["interface-name"]["string"],
            "eth1"
        );
        assert_eq!(manifest["spec"]["devices"][0]["capacity"]["bandwidth"]["value"], "10G");
    }
}
