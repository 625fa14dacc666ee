use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::ApiServer;
use crate::app::core::Application;
use crate::lifecycle::ServiceLifecycle;
use crate::publisher::run_publish_loop;

/// Starts and supervises the background tasks
pub struct Tasks {
    pub tasks: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
    lifecycle: Arc<ServiceLifecycle>,
}

impl Tasks {
    pub fn new(lifecycle: Arc<ServiceLifecycle>) -> Self {
        Self {
            tasks: Vec::new(),
            cancellation_token: CancellationToken::new(),
            lifecycle,
        }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    pub fn spawn_all_tasks(&mut self, app: &Application) -> Result<()> {
        let api_server_task = self.spawn_api_server_task(app);
        self.tasks.push(api_server_task);

        if let Some(publisher_task) = self.spawn_publisher_task(app) {
            self.tasks.push(publisher_task);
        }

        Ok(())
    }

    /// Waits for SIGTERM/SIGINT or for any task to exit
    pub async fn wait_for_completion(&mut self) -> Result<()> {
        let signal_handler = {
            #[cfg(unix)]
            {
                use tokio::signal::unix::signal;
                use tokio::signal::unix::SignalKind;
                let mut sigterm = signal(SignalKind::terminate())?;
                let mut sigint = signal(SignalKind::interrupt())?;

                tokio::spawn(async move {
                    tokio::select! {
                        _ = sigterm.recv() => {
                            tracing::info!("Received SIGTERM, initiating graceful shutdown");
                        }
                        _ = sigint.recv() => {
                            tracing::info!("Received SIGINT, initiating graceful shutdown");
                        }
                    }
                })
            }
            #[cfg(not(unix))]
            {
                tokio::spawn(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!("Failed to listen for Ctrl+C: {e}");
                        return;
                    }
                    tracing::info!("Received Ctrl+C, initiating graceful shutdown");
                })
            }
        };

        self.wait_for_signal_or_exit(signal_handler).await
    }

    async fn wait_for_signal_or_exit(&mut self, signal: JoinHandle<()>) -> Result<()> {
        if self.tasks.is_empty() {
            let _ = signal.await;
            self.shutdown_tasks().await;
            return Ok(());
        }

        tokio::select! {
            _ = signal => {
                tracing::info!("Shutdown signal received, cancelling all tasks");
                self.shutdown_tasks().await;
            }
            result = futures::future::select_all(&mut self.tasks) => {
                let (result, index, remaining) = result;
                drop(remaining);
                // already joined
                self.tasks.remove(index);
                self.shutdown_tasks().await;
                if let Err(e) = result {
                    tracing::error!("Task completed with error: {e}");
                    return Err(e.into());
                }
                tracing::warn!("Task completed unexpectedly");
            }
        }

        Ok(())
    }

    async fn shutdown_tasks(&mut self) {
        self.lifecycle.begin_shutdown();
        self.cancellation_token.cancel();
        self.wait_for_tasks_with_timeout(Duration::from_secs(30)).await;
    }

    async fn wait_for_tasks_with_timeout(&mut self, timeout: Duration) {
        tokio::time::timeout(timeout, async {
            for task in &mut self.tasks {
                if let Err(e) = task.await {
                    tracing::error!("Task failed during shutdown: {e}");
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Task shutdown timed out after {:?}", timeout);
        });
    }

    fn spawn_api_server_task(&self, app: &Application) -> JoinHandle<()> {
        let listen_addr = app.daemon_args().api_listen_addr.clone();
        let node_service = app.services().node_service.clone();
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            let api_server = ApiServer::new(node_service, listen_addr);
            if let Err(e) = api_server.run(token).await {
                tracing::error!("API server failed: {e:?}");
            } else {
                tracing::info!("API server completed");
            }
        })
    }

    fn spawn_publisher_task(&self, app: &Application) -> Option<JoinHandle<()>> {
        let publisher = app.services().publisher.clone()?;
        let driver = app.services().node_service.driver().clone();
        let interval = app.daemon_args().publish_interval();
        let token = self.cancellation_token.clone();

        Some(tokio::spawn(async move {
            tracing::info!("Starting inventory publisher task, interval {:?}", interval);
            run_publish_loop(driver, publisher, interval, token).await;
            tracing::info!("Inventory publisher task completed");
        }))
    }
}
