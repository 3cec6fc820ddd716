//! Request parsing, dispatch, and response shaping for every endpoint in
//! §6.1. Each handler is a thin wrapper: decode path/body, call the engine
//! or store, encode the result. No retry, validation, or business rule
//! lives here — that's the engine's and the stages' job.

use std::collections::HashMap;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::domain::ports::{NetworkId, VmId};
use crate::error::Error;
use crate::restore::{PlanRequest, RestoreEngine};
use crate::store::JobStoreApi;

pub struct AppState {
    pub restore_engine: Arc<RestoreEngine>,
    pub store: Arc<dyn JobStoreApi>,
    pub cloud: Arc<dyn crate::domain::ports::CloudApi>,
    pub session_provider: Arc<dyn crate::domain::ports::SessionProviderApi>,
    pub restore_enabled: bool,
}

type Body = Full<Bytes>;

pub async fn dispatch(req: Request<Incoming>, state: Arc<AppState>) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let result = route(method, &segments, req, &state).await;
    match result {
        Ok(response) => response,
        Err(e) => error_response(&e),
    }
}

async fn route(
    method: Method,
    segments: &[&str],
    req: Request<Incoming>,
    state: &AppState,
) -> Result<Response<Body>, Error> {
    match (method.clone(), segments) {
        (Method::POST, ["restore", "plan"]) => {
            require_restore_enabled(state)?;
            let body: PlanRequest = read_json(req).await?;
            let job = state.restore_engine.plan(body).await?;
            Ok(json_response(StatusCode::OK, &job))
        }
        (Method::POST, ["restore", "execute"]) => {
            require_restore_enabled(state)?;
            let body: ExecuteRequest = read_json(req).await?;
            let job_id = parse_uuid(&body.job_id)?;
            state.restore_engine.execute(job_id, body.confirm_destructive);
            Ok(json_response(StatusCode::ACCEPTED, &serde_json::json!({ "job_id": job_id })))
        }
        (Method::POST, ["restore", "cancel", job_id]) => {
            require_restore_enabled(state)?;
            let job_id = parse_uuid(job_id)?;
            state.restore_engine.cancel(job_id).await?;
            Ok(json_response(StatusCode::OK, &serde_json::json!({ "job_id": job_id, "status": "cancellation_requested" })))
        }
        (Method::POST, ["restore", "jobs", job_id, "retry"]) => {
            require_restore_enabled(state)?;
            let job_id = parse_uuid(job_id)?;
            let body: RetryRequest = read_json(req).await?;
            let job = state.restore_engine.retry(job_id, body.ip_strategy_override).await?;
            Ok(json_response(StatusCode::OK, &job))
        }
        (Method::POST, ["restore", "jobs", job_id, "cleanup"]) => {
            require_restore_enabled(state)?;
            let job_id = parse_uuid(job_id)?;
            let body: CleanupRequest = read_json(req).await?;
            let result = state.restore_engine.cleanup(job_id, body.delete_volume).await?;
            Ok(json_response(StatusCode::OK, &result))
        }
        (Method::POST, ["restore", "jobs", job_id, "cleanup-storage"]) => {
            require_restore_enabled(state)?;
            let job_id = parse_uuid(job_id)?;
            let body: CleanupStorageRequest = read_json(req).await?;
            let result = state
                .restore_engine
                .cleanup_storage(job_id, body.delete_old_volume, body.delete_source_snapshot)
                .await?;
            Ok(json_response(StatusCode::OK, &result))
        }
        (Method::GET, ["restore", "jobs"]) => {
            require_restore_enabled(state)?;
            let vm_id = query_param(req.uri().query(), "vm_id").map(|v| v.into());
            let jobs = state.store.list_restore_jobs(vm_id.as_ref()).await?;
            Ok(json_response(StatusCode::OK, &jobs))
        }
        (Method::GET, ["restore", "jobs", job_id]) => {
            require_restore_enabled(state)?;
            let job_id = parse_uuid(job_id)?;
            let job = state
                .store
                .get_restore_job(job_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("restore job {job_id}")))?;
            let steps = state.store.list_restore_steps(job_id).await?;
            Ok(json_response(StatusCode::OK, &serde_json::json!({ "job": job, "steps": steps })))
        }
        (Method::GET, ["restore", "vm", vm_id, "restore-points"]) => {
            require_restore_enabled(state)?;
            let vm_id: VmId = (*vm_id).into();
            let points = restore_points(state, &vm_id).await?;
            Ok(json_response(StatusCode::OK, &points))
        }
        (Method::GET, ["restore", "networks", network_id, "available-ips"]) => {
            require_restore_enabled(state)?;
            let network_id: NetworkId = (*network_id).into();
            let used = used_ip_addresses(state, &network_id).await?;
            Ok(json_response(StatusCode::OK, &serde_json::json!({ "network_id": network_id.to_string(), "used_ip_addresses": used })))
        }
        (Method::POST, ["snapshot", "run-now"]) => {
            let body: RunNowRequest = read_json_best_effort(req).await;
            let trigger_id = state.store.insert_on_demand_trigger(&body.requested_by.unwrap_or_else(|| "api".to_string())).await?;
            Ok(json_response(StatusCode::ACCEPTED, &serde_json::json!({ "trigger_id": trigger_id })))
        }
        (Method::GET, ["snapshot", "run-now", "status"]) => {
            let trigger = state.store.latest_trigger().await?;
            Ok(json_response(StatusCode::OK, &trigger))
        }
        _ => Ok(json_response(StatusCode::NOT_FOUND, &serde_json::json!({ "error": "not found" }))),
    }
}

async fn restore_points(state: &AppState, vm_id: &VmId) -> Result<Vec<crate::domain::ports::SnapshotInfo>, Error> {
    use crate::domain::ports::{ComputeApi, StorageApi};
    let session = state.session_provider.get_admin_session().await?;
    let server = state
        .cloud
        .get_server(&session, vm_id)
        .await?
        .ok_or_else(|| Error::VMNotFound(vm_id.to_string()))?;
    let Some(volume_id) = server.boot_volume_id else {
        return Ok(Vec::new());
    };
    state.cloud.list_snapshots(&session, Some(&volume_id), &HashMap::new()).await
}

/// Ports currently holding an IP on `network_id`. The cloud client doesn't
/// model subnet CIDR ranges, so this reports what's taken rather than
/// computing a true free-address pool — an honest approximation of the
/// "advisory available IPs" list §4.6.1 describes.
async fn used_ip_addresses(state: &AppState, network_id: &NetworkId) -> Result<Vec<String>, Error> {
    use crate::domain::ports::NetworkApi;
    let session = state.session_provider.get_admin_session().await?;
    let ports = state.cloud.list_ports(&session, None).await?;
    Ok(ports
        .into_iter()
        .filter(|p| &p.network_id == network_id)
        .flat_map(|p| p.ip_addresses)
        .collect())
}

fn require_restore_enabled(state: &AppState) -> Result<(), Error> {
    if state.restore_enabled {
        Ok(())
    } else {
        Err(Error::ForbiddenError("the restore surface is disabled".to_string()))
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, Error> {
    Uuid::parse_str(s).map_err(|_| Error::Internal(format!("malformed job id: {s}")))
}

fn query_param<'a>(query: Option<&'a str>, key: &str) -> Option<&'a str> {
    query?.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then_some(v)
    })
}

async fn read_json<T: for<'de> Deserialize<'de>>(req: Request<Incoming>) -> Result<T, Error> {
    let bytes = req.into_body().collect().await.map_err(|e| Error::Internal(e.to_string()))?.to_bytes();
    serde_json::from_slice(&bytes).map_err(|e| Error::Internal(format!("malformed request body: {e}")))
}

/// Used only by `/snapshot/run-now`, whose body is entirely optional.
async fn read_json_best_effort<T: for<'de> Deserialize<'de> + Default>(req: Request<Incoming>) -> T {
    let Ok(collected) = req.into_body().collect().await else { return T::default() };
    let bytes = collected.to_bytes();
    if bytes.is_empty() {
        T::default()
    } else {
        serde_json::from_slice(&bytes).unwrap_or_default()
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    let payload = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(payload)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

fn error_response(e: &Error) -> Response<Body> {
    let status = status_for(e);
    if status.is_server_error() {
        warn!(error = %e, "request failed");
    }
    json_response(status, &serde_json::json!({ "error": e.to_string(), "kind": e.kind() }))
}

fn status_for(e: &Error) -> StatusCode {
    match e {
        Error::AuthError(_) => StatusCode::UNAUTHORIZED,
        Error::ForbiddenError(_) => StatusCode::FORBIDDEN,
        Error::NotFound(_) | Error::SnapshotNotFound { .. } | Error::VMNotFound(_) => StatusCode::NOT_FOUND,
        Error::ConflictError(_) | Error::ConcurrentRestore { .. } => StatusCode::CONFLICT,
        Error::ConfirmationRequired { .. } => StatusCode::BAD_REQUEST,
        Error::UnsupportedBootMode { .. } | Error::QuotaInsufficient(_) | Error::SnapshotMismatch { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        Error::SizeRejected(_) => StatusCode::PAYLOAD_TOO_LARGE,
        Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        Error::Transient(_) | Error::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::Store(_) | Error::Config(_) | Error::Io(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    job_id: String,
    confirm_destructive: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RetryRequest {
    ip_strategy_override: Option<crate::store::models::IpStrategy>,
}

#[derive(Debug, Deserialize)]
struct CleanupRequest {
    delete_volume: bool,
}

#[derive(Debug, Deserialize)]
struct CleanupStorageRequest {
    delete_old_volume: bool,
    delete_source_snapshot: bool,
}

#[derive(Debug, Default, Deserialize)]
struct RunNowRequest {
    requested_by: Option<String>,
}
