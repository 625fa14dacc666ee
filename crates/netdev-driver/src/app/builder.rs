use std::sync::Arc;

use anyhow::Result;

use crate::app::Application;
use crate::app::ApplicationServices;
use crate::config::DaemonArgs;
use crate::config::DriverConfig;
use crate::domain::DeviceRegistry;
use crate::domain::DriverKind;
use crate::domain::NetworkDriver;
use crate::drivers::HostDeviceDriver;
use crate::drivers::NodeAgentDriver;
use crate::drivers::SubInterfaceDriver;
use crate::kube_client::init_kube_client;
use crate::lifecycle::ServiceLifecycle;
use crate::netns::LinkOps;
use crate::netns::NamespaceMover;
use crate::publisher::InventoryPublisher;
use crate::publisher::KubeSlicePublisher;
use crate::service::NodeService;

pub struct ApplicationBuilder {
    daemon_args: DaemonArgs,
}

impl ApplicationBuilder {
    pub fn new(daemon_args: DaemonArgs) -> Self {
        Self { daemon_args }
    }

    pub async fn build(self) -> Result<Application> {
        tracing::info!("Building application components...");

        let config = self.load_config()?;
        let driver = self.create_driver(&config)?;
        tracing::info!(
            kind = %self.daemon_args.driver,
            driver = %driver.name(),
            "Driver selected"
        );

        let lifecycle = Arc::new(ServiceLifecycle::new());
        let node_service = Arc::new(NodeService::new(
            driver,
            lifecycle.clone(),
            self.daemon_args.timeouts(),
        ));
        let publisher = self.create_publisher(&config).await?;

        Ok(Application::new(
            ApplicationServices {
                node_service,
                lifecycle,
                publisher,
            },
            self.daemon_args,
        ))
    }

    fn load_config(&self) -> Result<DriverConfig> {
        match &self.daemon_args.config {
            Some(path) => {
                let config = DriverConfig::load(path)
                    .map_err(|e| anyhow::anyhow!("Failed to load driver config: {e:?}"))?;
                tracing::info!("Loaded driver config from {}", path.display());
                Ok(config)
            }
            None => Ok(DriverConfig::default()),
        }
    }

    fn create_driver(&self, config: &DriverConfig) -> Result<Arc<dyn NetworkDriver>> {
        let name = self.daemon_args.driver_name();
        let driver: Arc<dyn NetworkDriver> = match self.daemon_args.driver {
            DriverKind::NodeAgent => {
                Arc::new(NodeAgentDriver::new(name, config.resource_file.clone()))
            }
            DriverKind::HostDevice => {
                let (registry, mover) = link_stack(config)?;
                Arc::new(HostDeviceDriver::new(name, registry, mover))
            }
            DriverKind::SubInterface => {
                let (registry, mover) = link_stack(config)?;
                Arc::new(SubInterfaceDriver::new(
                    name,
                    registry,
                    mover,
                    config.slots_per_parent.max(1),
                ))
            }
        };
        Ok(driver)
    }

    async fn create_publisher(
        &self,
        config: &DriverConfig,
    ) -> Result<Option<Arc<dyn InventoryPublisher>>> {
        if !self.daemon_args.enable_publish {
            tracing::info!("Inventory publication disabled");
            return Ok(None);
        }

        let node_name = self
            .daemon_args
            .node_name()
            .ok_or_else(|| anyhow::anyhow!("--node-name is required to publish the inventory"))?;
        let pool_name = config.pool_name.clone().unwrap_or_else(|| node_name.clone());

        let client = init_kube_client(self.daemon_args.kubeconfig.clone())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to initialize Kubernetes client: {e:?}"))?;

        Ok(Some(Arc::new(KubeSlicePublisher::new(
            client,
            &self.daemon_args.driver_name(),
            &node_name,
            &pool_name,
        ))))
    }
}

fn link_stack(config: &DriverConfig) -> Result<(DeviceRegistry, Arc<NamespaceMover>)> {
    let ops = link_ops(config)?;
    let registry = DeviceRegistry::new(ops.clone(), config.excluded_prefixes.clone());
    Ok((registry, Arc::new(NamespaceMover::new(ops))))
}

#[cfg(target_os = "linux")]
fn link_ops(config: &DriverConfig) -> Result<Arc<dyn LinkOps>> {
    Ok(Arc::new(crate::netns::rtnl::RtNetlinkOps::new(
        config.macvlan_mode,
        config.ipvlan_mode,
    )))
}

#[cfg(not(target_os = "linux"))]
fn link_ops(_config: &DriverConfig) -> Result<Arc<dyn LinkOps>> {
    anyhow::bail!("network namespace drivers are only supported on Linux")
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::config::Cli;
    use crate::config::Commands;

    fn args(extra: &[&str]) -> DaemonArgs {
        let mut argv = vec!["netdev-driver", "daemon"];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Daemon(args) => *args,
        }
    }

    #[test(tokio::test)]
    async fn node_agent_without_publication() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.yaml");
        let marker = dir.path().join("marker");
        std::fs::write(&config_path, format!("resourceFile: {}\n", marker.display())).unwrap();

        let app = ApplicationBuilder::new(args(&[
            "--driver",
            "node-agent",
            "--enable-publish",
            "false",
            "--config",
            config_path.to_str().unwrap(),
        ]))
        .build()
        .await
        .unwrap();

        assert!(app.services().publisher.is_none());
        assert_eq!(app.services().node_service.driver().name(), "node-agent.k8s.io");
        assert!(!app.services().lifecycle.is_ready());
    }

    #[test(tokio::test)]
    async fn broken_config_fails_the_build() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.yaml");
        std::fs::write(&config_path, "slotsPerParent: [1, 2]\n").unwrap();

        let result = ApplicationBuilder::new(args(&[
            "--driver",
            "node-agent",
            "--enable-publish",
            "false",
            "--config",
            config_path.to_str().unwrap(),
        ]))
        .build()
        .await;
        assert!(result.is_err());
    }
}
