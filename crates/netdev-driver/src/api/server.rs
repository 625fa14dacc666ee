use std::sync::Arc;

use error_stack::Report;
use poem::get;
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::post;
use poem::Endpoint;
use poem::EndpointExt;
use poem::Route;
use poem::Server;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use super::handlers;
use super::ApiError;
use crate::service::NodeService;

/// HTTP server exposing the claim, sandbox hook and health endpoints
pub struct ApiServer {
    service: Arc<NodeService>,
    listen_addr: String,
}

pub fn routes(service: Arc<NodeService>) -> impl Endpoint {
    Route::new()
        .at("/healthz", get(handlers::healthz))
        .at("/api/v1/devices", get(handlers::list_devices))
        .at("/api/v1/claims/:uid", get(handlers::get_claim))
        .at("/api/v1/claims/prepare", post(handlers::prepare_claim))
        .at("/api/v1/claims/unprepare", post(handlers::unprepare_claim))
        .at("/api/v1/sandboxes/run", post(handlers::run_sandbox))
        .at("/api/v1/sandboxes/stop", post(handlers::stop_sandbox))
        .at("/api/v1/sandboxes/remove", post(handlers::remove_sandbox))
        .data(service)
        .with(Tracing)
}

impl ApiServer {
    pub fn new(service: Arc<NodeService>, listen_addr: String) -> Self {
        Self {
            service,
            listen_addr,
        }
    }

    /// Serves until `cancellation_token` fires
    ///
    /// # Errors
    ///
    /// - [`ApiError::ServerError`] if the server fails to bind or crashes
    pub async fn run(self, cancellation_token: CancellationToken) -> Result<(), Report<ApiError>> {
        info!("Starting HTTP API server on {}", self.listen_addr);

        let app = routes(self.service);
        let listener = TcpListener::bind(&self.listen_addr);
        let server = Server::new(listener);

        tokio::select! {
            result = server.run(app) => {
                match result {
                    Ok(()) => {
                        info!("API server stopped normally");
                        Ok(())
                    }
                    Err(e) => {
                        error!("API server failed: {e}");
                        Err(Report::new(ApiError::ServerError {
                            message: format!("Server failed: {e}"),
                        }))
                    }
                }
            }
            _ = cancellation_token.cancelled() => {
                info!("API server shutdown requested");
                Ok(())
            }
        }
    }
}
