use crate::application::agent::{Agent, ChannelReporter, Reporter, RunOutcome};
use crate::application::memory::Memory;
use crate::application::tooling::ToolStore;
use crate::config::AppConfig;
use crate::domain::types::ToolManifest;
use crate::infrastructure::model::PlanGenerator;
use crate::infrastructure::sandbox::{Sandbox, SandboxLimits};
use axum::extract::{Query, State};
use axum::http::{Method, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use utoipa::{OpenApi, ToSchema};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind HTTP listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("HTTP server error: {0}")]
    Serve(#[from] std::io::Error),
}

pub struct ServerState {
    config: AppConfig,
    provider: Arc<dyn PlanGenerator>,
}

impl ServerState {
    pub fn new(config: AppConfig, provider: Arc<dyn PlanGenerator>) -> Self {
        Self { config, provider }
    }

    fn agent(&self, allow_network: bool) -> Agent {
        let store = ToolStore::new(&self.config.sandbox_dir);
        let sandbox = Sandbox::new(
            self.config.sandbox_dir.clone(),
            SandboxLimits {
                timeout_ms: self.config.timeout_ms,
                memory_mb: self.config.memory_mb,
                cpu: self.config.cpu.clone(),
                allow_network,
            },
        );
        Agent::new(Arc::clone(&self.provider), store, sandbox, allow_network)
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(status_handler, tools_handler, run_handler),
    components(schemas(
        StatusResponse,
        RunBody,
        RunResponse,
        ErrorResponse,
        ToolManifest,
        crate::domain::types::ToolPort,
        crate::domain::types::Language,
        crate::application::agent::RunOutcome,
        crate::application::agent::RunResult
    )),
    tags(
        (name = "status", description = "Catalog and history counters"),
        (name = "tools", description = "Registered tool manifests"),
        (name = "run", description = "Goal execution")
    )
)]
struct ApiDoc;

pub async fn serve(
    config: AppConfig,
    provider: Arc<dyn PlanGenerator>,
    addr: SocketAddr,
) -> Result<(), ServerError> {
    info!(%addr, "Binding HTTP server");

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    let state = Arc::new(ServerState::new(config, provider));
    let app = Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/tools", get(tools_handler))
        .route("/api/run-stream", get(run_stream_handler))
        .route("/api/run", post(run_handler))
        .route(
            "/api-doc/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        )
        .layer(cors)
        .with_state(state);

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    info!(%addr, "HTTP server ready to accept connections");

    axum::serve(listener, app.into_make_service())
        .await
        .map_err(ServerError::Serve)
}

#[derive(Debug, Serialize, ToSchema)]
struct StatusResponse {
    conversations: usize,
    tools: usize,
    runs: usize,
}

#[derive(Debug, Serialize, ToSchema)]
struct ErrorResponse {
    error: String,
}

#[utoipa::path(
    get,
    path = "/api/status",
    tag = "status",
    responses((status = 200, description = "Current state counters", body = StatusResponse))
)]
async fn status_handler(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<StatusResponse>, (StatusCode, Json<ErrorResponse>)> {
    let memory = load_memory(&state.config).map_err(internal_error)?;
    Ok(Json(StatusResponse {
        conversations: memory.history.len(),
        tools: memory.tools.len(),
        runs: memory.runs.len(),
    }))
}

#[utoipa::path(
    get,
    path = "/api/tools",
    tag = "tools",
    responses((status = 200, description = "Registered tool manifests", body = [ToolManifest]))
)]
async fn tools_handler(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<Vec<ToolManifest>>, (StatusCode, Json<ErrorResponse>)> {
    let memory = load_memory(&state.config).map_err(internal_error)?;
    Ok(Json(memory.tools.into_values().collect()))
}

#[derive(Debug, Deserialize)]
struct RunStreamParams {
    goal: String,
    network: Option<String>,
}

/// SSE progress stream for one goal. Each subscriber owns its channel; a
/// dropped connection stops observing without interrupting the run.
async fn run_stream_handler(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<RunStreamParams>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let allow_network = params
        .network
        .as_deref()
        .map(|value| matches!(value, "1" | "true"))
        .unwrap_or(state.config.allow_network);

    let (tx, rx) = mpsc::unbounded_channel();
    let reporter = Arc::new(ChannelReporter::new(tx));
    tokio::spawn(async move {
        if let Err(message) = run_goal(&state, &params.goal, allow_network, reporter.clone()).await
        {
            reporter.error(&message);
        }
    });

    let stream = UnboundedReceiverStream::new(rx)
        .map(|event| Ok(Event::default().event(event.event).data(event.data.to_string())));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Debug, Deserialize, ToSchema)]
struct RunBody {
    goal: String,
    #[serde(default)]
    network: Option<bool>,
}

#[derive(Debug, Serialize, ToSchema)]
struct RunResponse {
    #[serde(rename = "final")]
    outcome: RunOutcome,
    #[schema(value_type = Vec<Object>)]
    logs: Vec<Value>,
}

#[utoipa::path(
    post,
    path = "/api/run",
    tag = "run",
    request_body = RunBody,
    responses(
        (status = 200, description = "Goal executed", body = RunResponse),
        (status = 400, description = "Empty goal", body = ErrorResponse),
        (status = 500, description = "State could not be loaded", body = ErrorResponse)
    )
)]
async fn run_handler(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<RunBody>,
) -> Result<Json<RunResponse>, (StatusCode, Json<ErrorResponse>)> {
    if body.goal.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "goal cannot be empty".to_string(),
            }),
        ));
    }
    let allow_network = body.network.unwrap_or(state.config.allow_network);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let reporter = Arc::new(ChannelReporter::new(tx));
    let outcome = run_goal(&state, &body.goal, allow_network, reporter)
        .await
        .map_err(internal_error)?;

    let mut logs = Vec::new();
    while let Ok(event) = rx.try_recv() {
        logs.push(serde_json::json!({ "event": event.event, "data": event.data }));
    }
    Ok(Json(RunResponse { outcome, logs }))
}

async fn run_goal(
    state: &ServerState,
    goal: &str,
    allow_network: bool,
    reporter: Arc<ChannelReporter>,
) -> Result<RunOutcome, String> {
    // Each goal works on its own memory snapshot; persistence is
    // last-writer-wins across concurrent goals.
    let mut memory = load_memory(&state.config).map_err(|err| err.to_string())?;
    let agent = state.agent(allow_network);
    info!(goal, allow_network, "HTTP goal run started");
    Ok(agent.run(goal, &mut memory, reporter).await)
}

fn load_memory(config: &AppConfig) -> Result<Memory, crate::application::memory::MemoryError> {
    let store = ToolStore::new(&config.sandbox_dir);
    Memory::load(&config.data_dir, &store)
}

fn internal_error(message: impl std::fmt::Display) -> (StatusCode, Json<ErrorResponse>) {
    error!(%message, "Request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
}
