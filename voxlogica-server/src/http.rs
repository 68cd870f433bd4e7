//! REST routes: capability discovery, program symbols, jobs, value
//! resolution, and store inspection.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;
use voxlogica_core::ast::Program;
use voxlogica_core::codec;
use voxlogica_core::descriptor::{DescriptorBuilder, PageRequest};
use voxlogica_core::jobs::{JobKind, JobManager, JobRecord, JobRequest, RunOptions};
use voxlogica_core::reducer;
use voxlogica_core::resolver::{ResolveRequest, ResolveResponse, ValueResolver};
use voxlogica_core::store::{RecordFilter, RecordStatus};
use voxlogica_core::workplan::NodeId;

#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<JobManager>,
    pub resolver: Arc<ValueResolver>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/capabilities", get(capabilities))
        .route("/api/v1/program/symbols", post(program_symbols))
        .route("/api/v1/jobs", post(submit_job).get(list_jobs))
        .route("/api/v1/jobs/:job_id", get(get_job))
        .route("/api/v1/jobs/:job_id/kill", post(kill_job))
        .route("/api/v1/resolve", post(resolve))
        .route("/api/v1/store", get(list_store))
        .route("/api/v1/store/:node_id", get(inspect_node))
        .with_state(state)
}

// ─── Error mapping ────────────────────────────────────────────

struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "NotFound",
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "Internal",
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "code": self.code, "message": self.message });
        (self.status, Json(body)).into_response()
    }
}

impl From<voxlogica_core::resolver::ResolveError> for ApiError {
    fn from(e: voxlogica_core::resolver::ResolveError) -> Self {
        use voxlogica_core::resolver::ResolveError;
        match &e {
            ResolveError::Reduce(reduce) => ApiError {
                status: StatusCode::UNPROCESSABLE_ENTITY,
                code: reduce.code(),
                message: reduce.to_string(),
            },
            ResolveError::BadRequest(message) => {
                ApiError::bad_request("BadRequest", message.clone())
            }
            ResolveError::Store(_) => ApiError::internal(e.to_string()),
        }
    }
}

// ─── Capabilities ─────────────────────────────────────────────

#[derive(Serialize)]
struct CapabilitiesResponse {
    runtime_version: String,
    codec_format_version: u8,
    operators: Vec<String>,
    namespaces: Vec<String>,
    workers: usize,
    default_page_size: usize,
    max_page_size: usize,
}

async fn capabilities(State(state): State<AppState>) -> Json<CapabilitiesResponse> {
    let engine = state.jobs.engine();
    let config = engine.config();
    Json(CapabilitiesResponse {
        runtime_version: config.runtime_version.clone(),
        codec_format_version: codec::FORMAT_VERSION,
        operators: engine.registry().names(),
        namespaces: engine.registry().namespace_names(),
        workers: config.workers,
        default_page_size: config.descriptor.default_page_size,
        max_page_size: config.descriptor.max_page_size,
    })
}

// ─── Program symbols ──────────────────────────────────────────

#[derive(Deserialize)]
struct SymbolsRequest {
    program: Program,
}

#[derive(Serialize)]
struct SymbolsResponse {
    symbols: std::collections::BTreeMap<String, String>,
    goals: Vec<serde_json::Value>,
    nodes: usize,
}

async fn program_symbols(
    State(state): State<AppState>,
    Json(request): Json<SymbolsRequest>,
) -> Result<Json<SymbolsResponse>, ApiError> {
    let registry = state.jobs.engine().registry();
    let reduced = reducer::reduce_program(&request.program, registry).map_err(|e| ApiError {
        status: StatusCode::UNPROCESSABLE_ENTITY,
        code: e.code(),
        message: e.to_string(),
    })?;
    Ok(Json(SymbolsResponse {
        symbols: reduced
            .symbols
            .iter()
            .map(|(name, id)| (name.clone(), id.to_hex()))
            .collect(),
        goals: reduced
            .workplan
            .goals()
            .iter()
            .map(|goal| serde_json::json!({
                "kind": goal.kind,
                "label": goal.label,
                "target": goal.target.to_hex(),
            }))
            .collect(),
        nodes: reduced.workplan.len(),
    }))
}

// ─── Jobs ─────────────────────────────────────────────────────

#[derive(Deserialize)]
struct SubmitJobRequest {
    program: Program,
    #[serde(default)]
    options: RunOptions,
}

#[derive(Serialize)]
struct SubmitJobResponse {
    job_id: Uuid,
}

async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<SubmitJobRequest>,
) -> Json<SubmitJobResponse> {
    let job_id = state.jobs.submit(JobRequest::Run {
        program: request.program,
        options: request.options,
    });
    Json(SubmitJobResponse { job_id })
}

#[derive(Deserialize)]
struct ListJobsQuery {
    kind: Option<String>,
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Vec<JobRecord>>, ApiError> {
    let kind = match query.kind.as_deref() {
        None => None,
        Some("run") => Some(JobKind::Run),
        Some("value") => Some(JobKind::Value),
        Some(other) => {
            return Err(ApiError::bad_request(
                "BadRequest",
                format!("unknown job kind `{other}`"),
            ))
        }
    };
    Ok(Json(state.jobs.list(kind)))
}

async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobRecord>, ApiError> {
    state
        .jobs
        .get(job_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no job {job_id}")))
}

async fn kill_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobRecord>, ApiError> {
    state
        .jobs
        .kill(job_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no job {job_id}")))
}

// ─── Resolve ──────────────────────────────────────────────────

#[derive(Deserialize)]
struct ResolveBody {
    program: Option<Program>,
    variable: Option<String>,
    node_id: Option<String>,
    #[serde(default)]
    path: String,
    #[serde(default)]
    enqueue: bool,
    #[serde(default)]
    offset: usize,
    size: Option<usize>,
}

async fn resolve(
    State(state): State<AppState>,
    Json(body): Json<ResolveBody>,
) -> Result<Json<ResolveResponse>, ApiError> {
    let node_id = body
        .node_id
        .as_deref()
        .map(NodeId::from_hex)
        .transpose()
        .map_err(|e| ApiError::bad_request("BadRequest", format!("bad node id: {e}")))?;
    let response = state
        .resolver
        .resolve(ResolveRequest {
            program: body.program,
            variable: body.variable,
            node_id,
            path: body.path,
            page: PageRequest {
                offset: body.offset,
                size: body.size,
            },
            enqueue: body.enqueue,
        })
        .await?;
    Ok(Json(response))
}

// ─── Store inspection ─────────────────────────────────────────

#[derive(Deserialize)]
struct ListStoreQuery {
    status: Option<String>,
    prefix: Option<String>,
    limit: Option<usize>,
    runtime_version: Option<String>,
}

/// Inspection may pin a runtime version, but only the current one is
/// served; anything else is a synchronous policy rejection.
fn check_runtime_version(
    requested: Option<&str>,
    current: &str,
) -> Result<(), ApiError> {
    match requested {
        None => Ok(()),
        Some(v) if v == current => Ok(()),
        Some(other) => {
            let e = voxlogica_core::error::PolicyError::UnknownRuntimeVersion(other.to_string());
            Err(ApiError {
                status: StatusCode::BAD_REQUEST,
                code: e.code(),
                message: e.to_string(),
            })
        }
    }
}

#[derive(Serialize)]
struct StoreEntry {
    node_id: String,
    status: RecordStatus,
    payload_bytes: u64,
    created_at: String,
    updated_at: String,
    error: Option<String>,
}

async fn list_store(
    State(state): State<AppState>,
    Query(query): Query<ListStoreQuery>,
) -> Result<Json<Vec<StoreEntry>>, ApiError> {
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => Some(RecordStatus::parse(raw).ok_or_else(|| {
            ApiError::bad_request("BadRequest", format!("unknown status `{raw}`"))
        })?),
    };
    let engine = state.jobs.engine();
    check_runtime_version(
        query.runtime_version.as_deref(),
        &engine.config().runtime_version,
    )?;
    let records = engine
        .store()
        .iter(
            &RecordFilter {
                status,
                node_prefix: query.prefix,
            },
            query.limit.unwrap_or(100).min(1000),
        )
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(
        records
            .into_iter()
            .map(|record| StoreEntry {
                node_id: record.node_id.to_hex(),
                status: record.status,
                payload_bytes: record.payload_bytes,
                created_at: record.created_at.to_rfc3339(),
                updated_at: record.updated_at.to_rfc3339(),
                error: record.error,
            })
            .collect(),
    ))
}

#[derive(Deserialize)]
struct InspectQuery {
    #[serde(default)]
    path: String,
    #[serde(default)]
    offset: usize,
    size: Option<usize>,
    runtime_version: Option<String>,
}

async fn inspect_node(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    Query(query): Query<InspectQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let node_id = NodeId::from_hex(&node_id)
        .map_err(|e| ApiError::bad_request("BadRequest", format!("bad node id: {e}")))?;
    let engine = state.jobs.engine();
    check_runtime_version(
        query.runtime_version.as_deref(),
        &engine.config().runtime_version,
    )?;
    let record = engine
        .store()
        .get(node_id, &engine.config().runtime_version)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?
        .ok_or_else(|| ApiError::not_found(format!("no record for {node_id}")))?;

    let builder = DescriptorBuilder::new(&engine.config().descriptor, engine.registry());
    let descriptor = builder.from_record(
        &record,
        &query.path,
        PageRequest {
            offset: query.offset,
            size: query.size,
        },
    );
    Ok(Json(serde_json::json!({
        "node_id": record.node_id.to_hex(),
        "status": record.status,
        "payload_bytes": record.payload_bytes,
        "descriptor": descriptor,
    })))
}
