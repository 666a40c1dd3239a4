use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router as AxumRouter};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::RuntimeConfig;
use crate::engine::{ChatRequest, ChatResponse, OrchestrationEngine};
use crate::registry::{AgentInvocation, ToolArguments, ToolDefinition};
use crate::telemetry::TelemetrySink;

#[derive(Clone)]
pub struct ServerState {
    pub cfg: RuntimeConfig,
    pub engine: Arc<OrchestrationEngine>,
    pub telemetry: TelemetrySink,
}

#[derive(Debug, Serialize)]
pub struct ServerHealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub profile: String,
    pub agents: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ToolListResponse {
    pub tools: Vec<ToolDefinition>,
}

#[derive(Debug, Deserialize)]
pub struct ToolCallRequest {
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Serialize)]
pub struct ToolCallResponse {
    pub result: String,
}

pub type ApiError = (StatusCode, Json<Value>);
pub type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

pub fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

pub async fn handle_health(State(state): State<Arc<ServerState>>) -> Json<ServerHealthResponse> {
    Json(ServerHealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        profile: state.cfg.profile.clone(),
        agents: state.engine.registry().known_ids(),
    })
}

pub async fn handle_chat(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<ChatRequest>,
) -> ApiResult<ChatResponse> {
    if request.message.trim().is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "message cannot be empty for /api/chat",
        ));
    }

    // The engine itself never fails a chat turn; every stage degrades
    // into the response body.
    Ok(Json(state.engine.chat(request).await))
}

pub async fn handle_tools_list(State(state): State<Arc<ServerState>>) -> Json<ToolListResponse> {
    Json(ToolListResponse {
        tools: state.engine.registry().tool_definitions(),
    })
}

pub async fn handle_tools_call(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<ToolCallRequest>,
) -> ApiResult<ToolCallResponse> {
    let Some((descriptor, handler)) = state.engine.registry().resolve_tool(&request.tool_name)
    else {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("unknown tool '{}'", request.tool_name),
        ));
    };

    let arguments = serde_json::from_value::<ToolArguments>(request.arguments)
        .map_err(|err| api_error(StatusCode::BAD_REQUEST, format!("invalid arguments: {err}")))?;
    if arguments.query.trim().is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "arguments.query cannot be empty",
        ));
    }

    let invocation = AgentInvocation {
        query: arguments.query,
        file_path: arguments.file_path,
        history: String::new(),
        extra: serde_json::Map::new(),
    };

    let reply = handler.invoke(&invocation).await.map_err(|err| {
        state.telemetry.emit(
            "dispatch.agent.failed",
            json!({
                "agent": descriptor.id,
                "tool": descriptor.tool_name,
                "note": format!("{err:#}")
            }),
        );
        api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
    })?;

    Ok(Json(ToolCallResponse { result: reply.text }))
}

pub fn build_server_router(state: Arc<ServerState>) -> AxumRouter {
    AxumRouter::new()
        .route("/healthz", get(handle_health))
        .route("/api/chat", post(handle_chat))
        .route("/api/tools", get(handle_tools_list))
        .route("/api/tools/call", post(handle_tools_call))
        .with_state(state)
}

pub async fn run_server(
    cfg: RuntimeConfig,
    engine: Arc<OrchestrationEngine>,
    host: String,
    port: u16,
    telemetry: &TelemetrySink,
) -> Result<()> {
    let addr = format!("{host}:{port}")
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid server bind address '{}:{}'", host, port))?;

    let state = Arc::new(ServerState {
        cfg: cfg.clone(),
        engine,
        telemetry: telemetry.clone(),
    });

    telemetry.emit(
        "server.started",
        json!({
            "host": host,
            "port": port,
            "profile": cfg.profile,
            "classifier": format!("{:?}", cfg.classifier),
            "agents": state.engine.registry().known_ids()
        }),
    );

    println!(
        "Hub listening on http://{} (health: /healthz, chat: /api/chat, tools: /api/tools)",
        addr
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind server listener")?;
    axum::serve(listener, build_server_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server runtime failed")
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { println!("\nReceived Ctrl+C, shutting down gracefully..."); }
        _ = terminate => { println!("\nReceived SIGTERM, shutting down gracefully..."); }
    }
}
