use super::{ApiError, ApiResult};
use crate::config::AppState;
use crate::middleware::TenantHeader;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use flowrun_core::{
    metrics::MetricsSnapshot,
    queue::QueueStats,
    tenant::{Tenant, TenantId, TenantQuota, TenantStatus},
    types::{EdgeSpec, Flow, FlowId, FlowRun, LogEntry, NodeId, NodeSpec, Outcome, RunId, RunStatus},
    workflow::{RunFilter, RunStats},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

fn parse_run_id(run_id: &str) -> Result<RunId, ApiError> {
    run_id
        .parse()
        .map_err(|_| ApiError::bad_request(format!("invalid run id: {}", run_id)))
}

/// Provision a tenant
pub async fn create_tenant(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTenantRequest>,
) -> ApiResult<(StatusCode, Json<Tenant>)> {
    let tenant = Tenant::new(TenantId::new(req.id), req.name).with_quota(req.quota);
    state.controller.create_tenant(tenant.clone()).await?;

    tracing::info!("Provisioned tenant: {}", tenant.id);
    Ok((StatusCode::CREATED, Json(tenant)))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateTenantRequest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub quota: TenantQuota,
}

pub async fn list_tenants(State(state): State<Arc<AppState>>) -> Json<ListTenantsResponse> {
    Json(ListTenantsResponse {
        tenants: state.controller.tenants().list_tenants(),
    })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListTenantsResponse {
    pub tenants: Vec<Tenant>,
}

pub async fn suspend_tenant(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
) -> ApiResult<Json<Tenant>> {
    let tenant = state
        .controller
        .set_tenant_status(&TenantId::new(tenant_id), TenantStatus::Suspended)
        .await?;
    Ok(Json(tenant))
}

pub async fn activate_tenant(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
) -> ApiResult<Json<Tenant>> {
    let tenant = state
        .controller
        .set_tenant_status(&TenantId::new(tenant_id), TenantStatus::Active)
        .await?;
    Ok(Json(tenant))
}

/// Store a new version of a flow
pub async fn save_flow(
    State(state): State<Arc<AppState>>,
    TenantHeader(tenant_id): TenantHeader,
    Json(req): Json<SaveFlowRequest>,
) -> ApiResult<Json<Flow>> {
    let flow = Flow {
        id: FlowId::new(req.id),
        tenant_id,
        version: 0,
        name: req.name,
        nodes: req.nodes,
        edges: req.edges,
        created_at: chrono::Utc::now(),
    };

    let saved = state.controller.save_flow(flow).await?;
    Ok(Json(saved))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SaveFlowRequest {
    pub id: String,
    pub name: String,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
}

/// Get the latest version of a flow
pub async fn get_flow(
    State(state): State<Arc<AppState>>,
    TenantHeader(tenant_id): TenantHeader,
    Path(flow_id): Path<String>,
) -> ApiResult<Json<Flow>> {
    let flow = state
        .controller
        .get_flow(&tenant_id, &FlowId::new(flow_id))
        .await?;
    Ok(Json(flow))
}

/// Start a run of the latest flow version
pub async fn start_run(
    State(state): State<Arc<AppState>>,
    TenantHeader(tenant_id): TenantHeader,
    Path(flow_id): Path<String>,
) -> ApiResult<(StatusCode, Json<FlowRun>)> {
    let run = state
        .controller
        .start_run(&tenant_id, &FlowId::new(flow_id))
        .await?;
    Ok((StatusCode::ACCEPTED, Json(run)))
}

/// List the tenant's runs, optionally filtered by status
pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    TenantHeader(tenant_id): TenantHeader,
    Query(query): Query<ListRunsQuery>,
) -> ApiResult<Json<ListRunsResponse>> {
    let filter = match query.status.as_deref() {
        None => RunFilter::All,
        Some("active") => RunFilter::Active,
        Some(status) => RunFilter::Status(
            status
                .parse::<RunStatus>()
                .map_err(ApiError::bad_request)?,
        ),
    };

    let runs = state.controller.list_runs(&tenant_id, filter).await?;
    Ok(Json(ListRunsResponse { runs }))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListRunsQuery {
    pub status: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListRunsResponse {
    pub runs: Vec<FlowRun>,
}

pub async fn run_stats(
    State(state): State<Arc<AppState>>,
    TenantHeader(tenant_id): TenantHeader,
) -> ApiResult<Json<RunStats>> {
    Ok(Json(state.controller.run_stats(&tenant_id).await?))
}

/// Get a specific run
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    TenantHeader(tenant_id): TenantHeader,
    Path(run_id): Path<String>,
) -> ApiResult<Json<FlowRun>> {
    let run_id = parse_run_id(&run_id)?;
    let run = state.controller.get_run_state(&tenant_id, run_id).await?;
    Ok(Json(run))
}

pub async fn delete_run(
    State(state): State<Arc<AppState>>,
    TenantHeader(tenant_id): TenantHeader,
    Path(run_id): Path<String>,
) -> ApiResult<StatusCode> {
    let run_id = parse_run_id(&run_id)?;
    state.controller.delete_run(&tenant_id, run_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn pause_run(
    State(state): State<Arc<AppState>>,
    TenantHeader(tenant_id): TenantHeader,
    Path(run_id): Path<String>,
) -> ApiResult<Json<FlowRun>> {
    let run_id = parse_run_id(&run_id)?;
    Ok(Json(state.controller.pause_run(&tenant_id, run_id).await?))
}

pub async fn resume_run(
    State(state): State<Arc<AppState>>,
    TenantHeader(tenant_id): TenantHeader,
    Path(run_id): Path<String>,
) -> ApiResult<Json<FlowRun>> {
    let run_id = parse_run_id(&run_id)?;
    Ok(Json(state.controller.resume_run(&tenant_id, run_id).await?))
}

pub async fn stop_run(
    State(state): State<Arc<AppState>>,
    TenantHeader(tenant_id): TenantHeader,
    Path(run_id): Path<String>,
) -> ApiResult<Json<FlowRun>> {
    let run_id = parse_run_id(&run_id)?;
    Ok(Json(state.controller.stop_run(&tenant_id, run_id).await?))
}

/// Report the outcome of a node that is waiting for one
pub async fn complete_node(
    State(state): State<Arc<AppState>>,
    TenantHeader(tenant_id): TenantHeader,
    Path((run_id, node_id)): Path<(String, String)>,
    Json(outcome): Json<Outcome>,
) -> ApiResult<Json<FlowRun>> {
    let run_id = parse_run_id(&run_id)?;
    let run = state
        .controller
        .complete_node(&tenant_id, run_id, &NodeId::new(node_id), outcome)
        .await?;
    Ok(Json(run))
}

/// Start a new run from the same flow version
pub async fn restart_run(
    State(state): State<Arc<AppState>>,
    TenantHeader(tenant_id): TenantHeader,
    Path(run_id): Path<String>,
) -> ApiResult<(StatusCode, Json<FlowRun>)> {
    let run_id = parse_run_id(&run_id)?;
    let run = state.controller.restart_run(&tenant_id, run_id).await?;
    Ok((StatusCode::ACCEPTED, Json(run)))
}

/// Node logs persisted for a run
pub async fn run_logs(
    State(state): State<Arc<AppState>>,
    TenantHeader(tenant_id): TenantHeader,
    Path(run_id): Path<String>,
) -> ApiResult<Json<RunLogsResponse>> {
    let run_id = parse_run_id(&run_id)?;
    let logs = state.controller.run_logs(&tenant_id, run_id).await?;
    Ok(Json(RunLogsResponse { logs }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunLogsResponse {
    pub logs: Vec<LogEntry>,
}

pub async fn queue_stats(State(state): State<Arc<AppState>>) -> Json<QueueStats> {
    Json(state.controller.queue_stats())
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> Json<MetricsSnapshot> {
    Json(state.controller.metrics_snapshot())
}
