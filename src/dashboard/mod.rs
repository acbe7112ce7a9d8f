use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::board::job::{FLOW_UUID_KEY, STORE_KEY};
use crate::board::{Board, Job};
use crate::conductor::Conductor;
use crate::error::BoardError;
use crate::persistence::{FlowDetail, FlowStep, FlowStore};

#[derive(Clone)]
pub struct DashboardState {
    pub board: Arc<dyn Board>,
    pub flows: Arc<dyn FlowStore>,
    pub conductor: Arc<Conductor>,
    /// Detail key a posted job's `queue` is stored under
    pub queue_key: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsParams {
    #[serde(default)]
    pub only_unclaimed: bool,
    #[serde(default)]
    pub ensure_fresh: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobResponse {
    pub path: String,
    pub sequence: u64,
    pub uuid: Uuid,
    pub name: String,
    pub queue: String,
    pub state: String,
    pub owner: Option<String>,
    pub flow_uuid: Option<Uuid>,
    pub created_on: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PostJobRequest {
    pub name: String,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub flow_uuid: Option<Uuid>,
    #[serde(default)]
    pub store: Option<Map<String, Value>>,
    #[serde(default)]
    pub details: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PostJobResponse {
    pub success: bool,
    pub path: Option<String>,
    pub uuid: Option<Uuid>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SaveFlowRequest {
    pub name: String,
    pub steps: Vec<FlowStep>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SaveFlowResponse {
    pub success: bool,
    pub flow_uuid: Option<Uuid>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConductorStatusResponse {
    pub name: String,
    pub board: String,
    pub dispatching: bool,
    pub in_flight: usize,
    pub max_workers: usize,
    pub wait_timeout_ms: u64,
    pub known_jobs: usize,
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/jobs", get(list_jobs_handler).post(post_job_handler))
        .route("/api/flows", post(save_flow_handler))
        .route("/api/conductor", get(conductor_status_handler))
        .route("/api/conductor/stop", post(stop_conductor_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState) {
    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, router(state)).await {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn describe(board: &dyn Board, job: Job) -> Result<JobResponse, BoardError> {
    let state = board.state(&job).await?;
    let owner = board.owner(&job).await?;
    Ok(JobResponse {
        path: job.path().to_string(),
        sequence: job.sequence(),
        uuid: job.uuid(),
        name: job.name().to_string(),
        queue: board.core().queue_of(&job),
        state: state.to_string(),
        owner,
        flow_uuid: job.flow_uuid(),
        created_on: job.created_on(),
    })
}

async fn list_jobs_handler(
    State(state): State<DashboardState>,
    Query(params): Query<ListJobsParams>,
) -> impl IntoResponse {
    let jobs = match state
        .board
        .iterjobs(params.only_unclaimed, params.ensure_fresh)
        .collect()
        .await
    {
        Ok(jobs) => jobs,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to list jobs");
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };

    let mut listed = Vec::with_capacity(jobs.len());
    for job in jobs {
        match describe(state.board.as_ref(), job).await {
            Ok(response) => listed.push(response),
            // Consumed between listing and describing.
            Err(BoardError::JobNotFound(_)) => {}
            Err(e) => {
                return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
            }
        }
    }
    Json(listed).into_response()
}

async fn post_job_handler(
    State(state): State<DashboardState>,
    Json(payload): Json<PostJobRequest>,
) -> impl IntoResponse {
    let mut details = payload.details;
    if let Some(queue) = payload.queue {
        details.insert(state.queue_key.clone(), Value::String(queue));
    }
    if let Some(flow_uuid) = payload.flow_uuid {
        details.insert(FLOW_UUID_KEY.to_string(), Value::String(flow_uuid.to_string()));
    }
    if let Some(store) = payload.store {
        details.insert(STORE_KEY.to_string(), Value::Object(store));
    }

    match state.board.post(&payload.name, None, details).await {
        Ok(job) => (
            StatusCode::OK,
            Json(PostJobResponse {
                success: true,
                path: Some(job.path().to_string()),
                uuid: Some(job.uuid()),
                error: None,
            }),
        ),
        Err(e) => {
            let status = match e {
                BoardError::PostingFailure { .. } => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (
                status,
                Json(PostJobResponse {
                    success: false,
                    path: None,
                    uuid: None,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

async fn save_flow_handler(
    State(state): State<DashboardState>,
    Json(payload): Json<SaveFlowRequest>,
) -> impl IntoResponse {
    let mut flow = FlowDetail::new(&payload.name);
    flow.steps = payload.steps;
    let flow_uuid = flow.uuid;

    match state.flows.save(flow).await {
        Ok(()) => (
            StatusCode::OK,
            Json(SaveFlowResponse {
                success: true,
                flow_uuid: Some(flow_uuid),
                error: None,
            }),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(SaveFlowResponse {
                success: false,
                flow_uuid: None,
                error: Some(e.to_string()),
            }),
        ),
    }
}

async fn conductor_status_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let conductor = &state.conductor;
    Json(ConductorStatusResponse {
        name: conductor.name().to_string(),
        board: state.board.name().to_string(),
        dispatching: conductor.dispatching(),
        in_flight: conductor.in_flight(),
        max_workers: conductor.max_workers(),
        wait_timeout_ms: conductor.wait_timeout().as_millis() as u64,
        known_jobs: state.board.job_count().await,
    })
}

async fn stop_conductor_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    tracing::info!(conductor = %state.conductor.name(), "Stop requested through dashboard");
    state.conductor.stop();
    StatusCode::ACCEPTED
}
