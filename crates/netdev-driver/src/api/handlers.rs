use std::sync::Arc;

use api_types::ApiResponse;
use api_types::Device;
use api_types::PreparedClaim;
use api_types::ResourceClaim;
use api_types::SandboxHookRequest;
use api_types::SandboxStatus;
use api_types::UnprepareRequest;
use error_stack::Report;
use poem::handler;
use poem::http::StatusCode;
use poem::web::Data;
use poem::web::Json;
use poem::web::Path;
use poem::IntoResponse;
use poem::Response;
use serde::Deserialize;
use serde::Serialize;
use tracing::info;
use tracing::warn;

use super::status_for;
use crate::domain::DriverError;
use crate::service::NodeService;

/// Body of `POST /api/v1/claims/prepare`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareRequest {
    pub claim: ResourceClaim,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Body of `POST /api/v1/sandboxes/stop` and `/remove`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxUidRequest {
    pub uid: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn failure<T: Serialize + Send>(operation: &str, report: &Report<DriverError>) -> Response {
    let error = report.current_context();
    let status = status_for(error);
    warn!(operation, kind = %error.kind(), "{operation} failed: {report:?}");
    (status, Json(ApiResponse::<T>::failed(error.to_string()))).into_response()
}

fn success<T: Serialize + Send>(data: T, message: impl Into<String>) -> Response {
    Json(ApiResponse::ok(data, message)).into_response()
}

#[handler]
pub async fn healthz(Data(service): Data<&Arc<NodeService>>) -> Response {
    let state = service.lifecycle().state();
    if service.lifecycle().is_ready() {
        (StatusCode::OK, state.to_string()).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, state.to_string()).into_response()
    }
}

#[handler]
pub async fn list_devices(Data(service): Data<&Arc<NodeService>>) -> Response {
    match service.list_devices().await {
        Ok(devices) => {
            let count = devices.len();
            success(devices, format!("{count} device(s) available"))
        }
        Err(report) => failure::<Vec<Device>>("list devices", &report),
    }
}

#[handler]
pub async fn get_claim(
    Path(uid): Path<String>,
    Data(service): Data<&Arc<NodeService>>,
) -> Response {
    match service.get_claim(&uid) {
        Some(claim) => success(claim, format!("workload {uid} is prepared")),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::<PreparedClaim>::failed(format!(
                "nothing prepared for workload {uid}"
            ))),
        )
            .into_response(),
    }
}

#[handler]
pub async fn prepare_claim(
    Data(service): Data<&Arc<NodeService>>,
    Json(request): Json<PrepareRequest>,
) -> Response {
    let uid = request.claim.workload_uid.clone();
    info!(uid = %uid, claim = %request.claim.name, "Prepare requested");
    match service.prepare(&request.claim, request.timeout_ms).await {
        Ok(prepared) => success(prepared, format!("workload {uid} prepared")),
        Err(report) => failure::<PreparedClaim>("prepare", &report),
    }
}

#[handler]
pub async fn unprepare_claim(
    Data(service): Data<&Arc<NodeService>>,
    Json(request): Json<UnprepareRequest>,
) -> Response {
    let uid = request.workload_uid;
    info!(uid = %uid, "Unprepare requested");
    match service.unprepare(&uid, request.timeout_ms).await {
        Ok(()) => success(uid.clone(), format!("workload {uid} unprepared")),
        Err(report) => failure::<String>("unprepare", &report),
    }
}

#[handler]
pub async fn run_sandbox(
    Data(service): Data<&Arc<NodeService>>,
    Json(request): Json<SandboxHookRequest>,
) -> Response {
    let sandbox = &request.sandbox;
    info!(uid = %sandbox.uid, pod = %format!("{}/{}", sandbox.namespace, sandbox.name), "RunPodSandbox hook");
    match service.run_sandbox(sandbox, request.timeout_ms).await {
        Ok(status) => success(status, format!("sandbox {} configured", sandbox.uid)),
        Err(report) => failure::<SandboxStatus>("run sandbox", &report),
    }
}

#[handler]
pub async fn stop_sandbox(
    Data(service): Data<&Arc<NodeService>>,
    Json(request): Json<SandboxUidRequest>,
) -> Response {
    info!(uid = %request.uid, "StopPodSandbox hook");
    match service.stop_sandbox(&request.uid, request.timeout_ms).await {
        Ok(status) => success(status, format!("sandbox {} cleaned", request.uid)),
        Err(report) => failure::<SandboxStatus>("stop sandbox", &report),
    }
}

#[handler]
pub async fn remove_sandbox(
    Data(service): Data<&Arc<NodeService>>,
    Json(request): Json<SandboxUidRequest>,
) -> Response {
    info!(uid = %request.uid, "RemovePodSandbox hook");
    match service.remove_sandbox(&request.uid, request.timeout_ms).await {
        Ok(()) => success(request.uid.clone(), format!("sandbox {} removed", request.uid)),
        Err(report) => failure::<String>("remove sandbox", &report),
    }
}
