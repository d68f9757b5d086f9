//! HTTP surface polled by dashboards, editors and render nodes.
//!
//! Handlers only translate: each one decodes a request, makes exactly one
//! store call and encodes the outcome. Store errors pass through unchanged as
//! `{ok: false, error, code}` with a matching status code.

mod error;

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

pub use error::{ApiError, ErrorBody};

use crate::props::{PropDraft, PropRegistry, StoredProp};
use crate::scheduler::{
    Assigner, Assignment, Heartbeat, HeartbeatAck, JobSpec, JobStore, JobView, Node,
    NodeRegistry, StatusReport, Task,
};

#[derive(Clone)]
pub struct GatewayState {
    pub nodes: Arc<NodeRegistry>,
    pub store: Arc<JobStore>,
    pub assigner: Arc<Assigner>,
    pub props: Arc<PropRegistry>,
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

#[derive(Serialize, Deserialize)]
pub struct NodesResponse {
    pub ok: bool,
    pub nodes: Vec<Node>,
}

#[derive(Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub ok: bool,
    pub result: HeartbeatAck,
}

#[derive(Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

#[derive(Deserialize)]
pub struct PendingQuery {
    pub limit: Option<usize>,
}

#[derive(Serialize, Deserialize)]
pub struct PendingResponse {
    pub ok: bool,
    pub pending_count: usize,
    /// Each task as a self-describing JSON record string.
    pub tasks: Vec<String>,
}

#[derive(Serialize, Deserialize)]
pub struct SubmitResponse {
    pub ok: bool,
    pub job_id: Uuid,
    pub task_count: usize,
}

#[derive(Serialize, Deserialize)]
pub struct JobResponse {
    pub ok: bool,
    pub job: JobView,
}

#[derive(Serialize, Deserialize)]
pub struct JobsResponse {
    pub ok: bool,
    pub jobs: Vec<JobView>,
}

#[derive(Serialize, Deserialize)]
pub struct CountResponse {
    pub ok: bool,
    pub count: usize,
}

#[derive(Deserialize)]
pub struct AcquireRequest {
    pub node_id: String,
    /// Defaults to the capabilities from the node's last heartbeat.
    #[serde(default)]
    pub capabilities: Option<BTreeSet<String>>,
}

#[derive(Serialize, Deserialize)]
pub struct AcquireResponse {
    pub ok: bool,
    pub task: Option<Task>,
}

#[derive(Serialize, Deserialize)]
pub struct TaskResponse {
    pub ok: bool,
    pub task: Task,
}

#[derive(Serialize, Deserialize)]
pub struct AssignmentsResponse {
    pub ok: bool,
    pub assignments: Vec<Assignment>,
}

#[derive(Serialize, Deserialize)]
pub struct PropsResponse {
    pub ok: bool,
    pub props: Vec<StoredProp>,
}

#[derive(Serialize, Deserialize)]
pub struct PropResponse {
    pub ok: bool,
    pub prop: StoredProp,
}

/// Full prop record plus the revision the editor last read.
#[derive(Deserialize)]
pub struct RegisterPropRequest {
    #[serde(flatten)]
    pub prop: PropDraft,
    #[serde(default)]
    pub revision: Option<u64>,
}

#[derive(Serialize, Deserialize)]
pub struct RegisterPropResponse {
    pub ok: bool,
    pub name: String,
    pub revision: u64,
}

pub fn router(state: GatewayState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/farm/nodes", get(list_nodes_handler))
        .route("/farm/nodes/{node_id}", delete(decommission_handler))
        .route("/farm/nodes/{node_id}/offline", post(mark_offline_handler))
        .route("/farm/node/heartbeat", post(heartbeat_handler))
        .route("/farm/list_pending", get(list_pending_handler))
        .route("/farm/submit", post(submit_handler))
        .route("/farm/jobs", get(list_jobs_handler))
        .route("/farm/jobs/{job_id}", delete(purge_job_handler))
        .route("/farm/jobs/{job_id}/cancel", post(cancel_job_handler))
        .route("/farm/status/{job_id}", get(job_status_handler))
        .route("/farm/acquire", post(acquire_handler))
        .route("/farm/tasks/{task_id}/status", post(report_status_handler))
        .route("/farm/tasks/{task_id}/requeue", post(requeue_handler))
        .route("/farm/assignments", get(assignments_handler))
        .route("/props/list", get(list_props_handler))
        .route("/props/register", post(register_prop_handler))
        .route("/props/get/{name}", get(get_prop_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the gateway until `shutdown` fires.
pub async fn run_gateway(
    addr: SocketAddr,
    state: GatewayState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Gateway listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|e| ApiError::BadRequest(format!("invalid id {raw:?}: {e}")))
}

async fn list_nodes_handler(State(state): State<GatewayState>) -> Json<NodesResponse> {
    Json(NodesResponse {
        ok: true,
        nodes: state.nodes.list(),
    })
}

async fn heartbeat_handler(
    State(state): State<GatewayState>,
    payload: Result<Json<Heartbeat>, JsonRejection>,
) -> ApiResult<HeartbeatResponse> {
    let Json(hb) = payload?;
    if hb.node_id.trim().is_empty() {
        return Err(ApiError::BadRequest("node_id must not be empty".into()));
    }
    Ok(Json(HeartbeatResponse {
        ok: true,
        result: state.nodes.heartbeat(hb),
    }))
}

async fn mark_offline_handler(
    State(state): State<GatewayState>,
    Path(node_id): Path<String>,
) -> ApiResult<OkResponse> {
    state.nodes.mark_offline(&node_id)?;
    Ok(Json(OkResponse { ok: true }))
}

async fn decommission_handler(
    State(state): State<GatewayState>,
    Path(node_id): Path<String>,
) -> ApiResult<OkResponse> {
    state.nodes.decommission(&node_id)?;
    Ok(Json(OkResponse { ok: true }))
}

async fn list_pending_handler(
    State(state): State<GatewayState>,
    Query(query): Query<PendingQuery>,
) -> Json<PendingResponse> {
    let tasks: Vec<String> = state
        .assigner
        .list_pending(query.limit)
        .iter()
        .filter_map(|task| match task.to_record() {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(task_id = %task.task_id, error = %e, "Skipping unserializable task");
                None
            }
        })
        .collect();

    Json(PendingResponse {
        ok: true,
        pending_count: tasks.len(),
        tasks,
    })
}

async fn submit_handler(
    State(state): State<GatewayState>,
    payload: Result<Json<JobSpec>, JsonRejection>,
) -> ApiResult<SubmitResponse> {
    let Json(spec) = payload?;
    let submitted = state.store.submit(spec)?;
    Ok(Json(SubmitResponse {
        ok: true,
        job_id: submitted.job_id,
        task_count: submitted.task_count,
    }))
}

async fn list_jobs_handler(State(state): State<GatewayState>) -> Json<JobsResponse> {
    Json(JobsResponse {
        ok: true,
        jobs: state.store.list_jobs(),
    })
}

async fn job_status_handler(
    State(state): State<GatewayState>,
    Path(job_id): Path<String>,
) -> ApiResult<JobResponse> {
    let job = state.store.get_job(&parse_id(&job_id)?)?;
    Ok(Json(JobResponse { ok: true, job }))
}

async fn cancel_job_handler(
    State(state): State<GatewayState>,
    Path(job_id): Path<String>,
) -> ApiResult<CountResponse> {
    let count = state.store.cancel(&parse_id(&job_id)?)?;
    Ok(Json(CountResponse { ok: true, count }))
}

async fn purge_job_handler(
    State(state): State<GatewayState>,
    Path(job_id): Path<String>,
) -> ApiResult<CountResponse> {
    let count = state.store.purge(&parse_id(&job_id)?)?;
    Ok(Json(CountResponse { ok: true, count }))
}

async fn acquire_handler(
    State(state): State<GatewayState>,
    payload: Result<Json<AcquireRequest>, JsonRejection>,
) -> ApiResult<AcquireResponse> {
    let Json(req) = payload?;
    let capabilities = match req.capabilities {
        Some(caps) => caps,
        None => state
            .nodes
            .get(&req.node_id)
            .map(|node| node.capabilities)
            .unwrap_or_default(),
    };
    Ok(Json(AcquireResponse {
        ok: true,
        task: state.assigner.acquire(&req.node_id, &capabilities),
    }))
}

async fn report_status_handler(
    State(state): State<GatewayState>,
    Path(task_id): Path<String>,
    payload: Result<Json<StatusReport>, JsonRejection>,
) -> ApiResult<TaskResponse> {
    let task_id = parse_id(&task_id)?;
    let Json(report) = payload?;
    let task = state.store.report_status(&task_id, report)?;
    Ok(Json(TaskResponse { ok: true, task }))
}

async fn requeue_handler(
    State(state): State<GatewayState>,
    Path(task_id): Path<String>,
) -> ApiResult<TaskResponse> {
    let task = state.store.requeue(&parse_id(&task_id)?)?;
    Ok(Json(TaskResponse { ok: true, task }))
}

async fn assignments_handler(State(state): State<GatewayState>) -> Json<AssignmentsResponse> {
    Json(AssignmentsResponse {
        ok: true,
        assignments: state.assigner.assignments(),
    })
}

async fn list_props_handler(State(state): State<GatewayState>) -> Json<PropsResponse> {
    Json(PropsResponse {
        ok: true,
        props: state.props.list(),
    })
}

async fn get_prop_handler(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
) -> ApiResult<PropResponse> {
    let prop = state.props.get(&name)?;
    Ok(Json(PropResponse { ok: true, prop }))
}

async fn register_prop_handler(
    State(state): State<GatewayState>,
    payload: Result<Json<RegisterPropRequest>, JsonRejection>,
) -> ApiResult<RegisterPropResponse> {
    let Json(req) = payload?;
    let stored = state.props.register(req.prop, req.revision)?;
    Ok(Json(RegisterPropResponse {
        ok: true,
        name: stored.record.name,
        revision: stored.revision,
    }))
}
