use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::client::DashboardClient;
use crate::error::MonitorError;
use crate::notify::Notification;
use crate::sampling::{ChartData, SeriesMode};
use crate::session::{CredentialForm, FieldError, SessionState};

#[derive(Clone)]
pub struct DashboardState {
    pub client: Arc<DashboardClient>,
}

/// JSON error body with a status code chosen by error kind.
pub struct ApiError(MonitorError);

impl From<MonitorError> for ApiError {
    fn from(e: MonitorError) -> Self {
        Self(e)
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fields: Vec<FieldError>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            MonitorError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            MonitorError::NotAuthenticated => StatusCode::UNAUTHORIZED,
            MonitorError::Busy(_)
            | MonitorError::AlreadyAuthenticated
            | MonitorError::JobAlreadyTracked => StatusCode::CONFLICT,
            MonitorError::InvalidInterval(_) => StatusCode::BAD_REQUEST,
            MonitorError::NoJobTracked => StatusCode::NOT_FOUND,
            MonitorError::Remote(_) => StatusCode::BAD_GATEWAY,
        };
        let fields = match &self.0 {
            MonitorError::Validation(fields) => fields.clone(),
            _ => Vec::new(),
        };
        let body = ErrorResponse {
            error: self.0.to_string(),
            fields,
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Serialize)]
struct SessionResponse {
    state: SessionState,
    form_disabled: bool,
    defaults: CredentialForm,
    notifications: Vec<Notification>,
}

#[derive(Serialize)]
struct StateResponse {
    state: SessionState,
}

#[derive(Deserialize)]
struct LoginRequest {
    form: CredentialForm,
    #[serde(default)]
    save: bool,
}

#[derive(Deserialize)]
struct StartLoopRequest {
    interval: Value,
}

#[derive(Serialize)]
struct PullResponse {
    time: String,
    rows: usize,
}

#[derive(Serialize)]
struct MessageResponse {
    message: String,
}

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(default)]
    mode: SeriesMode,
    /// Replace each series with running totals for a stacked area chart
    #[serde(default)]
    stacked: bool,
}

#[derive(Serialize)]
struct HistoryResponse {
    total_ingested: u64,
    #[serde(flatten)]
    chart: ChartData,
}

#[derive(Serialize)]
struct SubmitJobResponse {
    job_id: String,
}

#[derive(Serialize)]
struct OcelResponse {
    path: String,
}

/// All dashboard routes.
pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/session", get(session_handler))
        .route("/api/session/probe", post(probe_handler))
        .route("/api/session/login", post(login_handler))
        .route("/api/session/logout", post(logout_handler))
        .route("/api/loop", get(loop_status_handler))
        .route("/api/loop/start", post(start_loop_handler))
        .route("/api/loop/stop", post(stop_loop_handler))
        .route("/api/squeue/run", post(run_squeue_handler))
        .route("/api/squeue/pull", post(pull_handler))
        .route("/api/history", get(history_handler))
        .route(
            "/api/job",
            get(job_view_handler)
                .post(submit_job_handler)
                .delete(reset_job_handler),
        )
        .route("/api/ocel", post(ocel_handler))
        .route("/api/notifications/:id", delete(dismiss_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, shutdown: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn session_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let client = &state.client;
    let session = client.session.state();
    Json(SessionResponse {
        state: session,
        form_disabled: session.form_disabled(),
        defaults: client.session.form_defaults(),
        notifications: client.notifier.active(),
    })
}

async fn probe_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let session = state.client.probe().await;
    Json(StateResponse { state: session })
}

async fn login_handler(
    State(state): State<DashboardState>,
    Json(payload): Json<LoginRequest>,
) -> ApiResult<StateResponse> {
    state.client.login(&payload.form, payload.save).await?;
    Ok(Json(StateResponse {
        state: state.client.session.state(),
    }))
}

async fn logout_handler(State(state): State<DashboardState>) -> ApiResult<StateResponse> {
    state.client.logout().await?;
    Ok(Json(StateResponse {
        state: state.client.session.state(),
    }))
}

async fn loop_status_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    state.client.loop_status().await.map(Json).map_err(ApiError)
}

/// The interval arrives as typed by the operator: a JSON number or a string.
fn interval_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

async fn start_loop_handler(
    State(state): State<DashboardState>,
    Json(payload): Json<StartLoopRequest>,
) -> impl IntoResponse {
    state
        .client
        .start_loop(&interval_text(&payload.interval))
        .await
        .map(Json)
        .map_err(ApiError)
}

async fn stop_loop_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    state.client.stop_loop().await.map(Json).map_err(ApiError)
}

async fn run_squeue_handler(State(state): State<DashboardState>) -> ApiResult<MessageResponse> {
    let message = state.client.run_squeue().await?;
    Ok(Json(MessageResponse { message }))
}

async fn pull_handler(State(state): State<DashboardState>) -> ApiResult<PullResponse> {
    let snapshot = state.client.pull_snapshot().await?;
    Ok(Json(PullResponse {
        time: snapshot.time.to_rfc3339(),
        rows: snapshot.rows.len(),
    }))
}

async fn history_handler(
    State(state): State<DashboardState>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<HistoryResponse> {
    let mut chart = state.client.chart(query.mode)?;
    if query.stacked {
        chart.series = chart.stacked();
    }
    Ok(Json(HistoryResponse {
        total_ingested: state.client.aggregator.total_ingested(),
        chart,
    }))
}

async fn job_view_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    state.client.job_view().map(Json).map_err(ApiError)
}

async fn submit_job_handler(State(state): State<DashboardState>) -> ApiResult<SubmitJobResponse> {
    let job_id = state.client.submit_job().await?;
    Ok(Json(SubmitJobResponse { job_id }))
}

async fn reset_job_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    state
        .client
        .reset_job()
        .map(|()| StatusCode::NO_CONTENT)
        .map_err(ApiError)
}

async fn ocel_handler(State(state): State<DashboardState>) -> ApiResult<OcelResponse> {
    let path = state.client.extract_ocel().await?;
    Ok(Json(OcelResponse { path }))
}

async fn dismiss_handler(
    State(state): State<DashboardState>,
    Path(id): Path<Uuid>,
) -> StatusCode {
    if state.client.notifier.dismiss(id) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}
