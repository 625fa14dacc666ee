//! HTTP boundary of the driver
//!
//! # API Endpoints
//!
//! - `GET /healthz` - 200 once the service is ready, 503 otherwise
//! - `GET /api/v1/devices` - devices this node currently advertises
//! - `GET /api/v1/claims/:uid` - prepared devices of a workload
//! - `POST /api/v1/claims/prepare` - prepare a [`ResourceClaim`](api_types::ResourceClaim)
//! - `POST /api/v1/claims/unprepare` - unprepare a workload
//! - `POST /api/v1/sandboxes/run` - sandbox created hook
//! - `POST /api/v1/sandboxes/stop` - sandbox stopped hook
//! - `POST /api/v1/sandboxes/remove` - sandbox removed hook
//!
//! Every response is an [`ApiResponse`](api_types::ApiResponse) envelope. All
//! endpoints are idempotent, so callers retry freely after a timeout.

use core::error::Error;

use poem::http::StatusCode;

use crate::domain::DriverError;
use crate::domain::ErrorKind;

pub mod handlers;
pub mod server;

pub use server::ApiServer;

/// API errors
#[derive(Debug, derive_more::Display)]
pub enum ApiError {
    #[display("Server error: {message}")]
    ServerError { message: String },
}

impl Error for ApiError {}

/// HTTP status for a failed driver operation
pub fn status_for(error: &DriverError) -> StatusCode {
    match error {
        DriverError::Timeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
        other => match other.kind() {
            ErrorKind::Permanent => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::UnrecoverableSafe => StatusCode::INTERNAL_SERVER_ERROR,
        },
    }
}
