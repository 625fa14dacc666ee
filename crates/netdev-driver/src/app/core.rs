use anyhow::Result;

use crate::app::services::ApplicationServices;
use crate::app::tasks::Tasks;
use crate::config::DaemonArgs;

pub struct Application {
    services: ApplicationServices,
    daemon_args: DaemonArgs,
}

impl Application {
    pub fn new(services: ApplicationServices, daemon_args: DaemonArgs) -> Self {
        Self {
            services,
            daemon_args,
        }
    }

    pub fn services(&self) -> &ApplicationServices {
        &self.services
    }

    pub fn daemon_args(&self) -> &DaemonArgs {
        &self.daemon_args
    }

    /// Starts all tasks, reports ready and waits for a shutdown signal
    pub async fn run(&self) -> Result<()> {
        tracing::info!("Starting all application tasks...");

        let mut tasks = Tasks::new(self.services.lifecycle.clone());

        if let Err(e) = tasks.spawn_all_tasks(self) {
            tracing::error!("Failed to spawn application tasks: {}", e);
            return Err(e);
        }

        if self.services.lifecycle.mark_ready() {
            tracing::info!(
                driver = %self.services.node_service.driver().name(),
                "Driver ready"
            );
        }

        if let Err(e) = tasks.wait_for_completion().await {
            tracing::error!("Error during task execution: {}", e);
            return Err(e);
        }

        tracing::info!("Application run completed");
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Shutting down application...");
        self.services.lifecycle.begin_shutdown();

        // prepared state lives in memory only
        let prepared = self.services.node_service.prepared_count();
        if prepared > 0 {
            tracing::warn!(prepared, "Shutting down with prepared workloads");
        }

        tracing::info!("Application shutdown completed");
        Ok(())
    }
}
