//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::approval::{self, ApprovalStore, ApprovalTicket, DecisionEvent};
use crate::config::Config;
use crate::execution::{ActionRecord, Execution, ExecutionStatus};
use crate::llm::{LlmClient, OpenRouterClient};
use crate::orchestrator::{Orchestrator, OrchestratorError};
use crate::store::{self, ExecutionStore};
use crate::tools::{BuiltinTools, ToolRegistry};

use super::types::*;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub orchestrator: Orchestrator,
}

/// Wire stores, tools and the orchestrator from configuration.
pub async fn build_state(config: Config) -> anyhow::Result<Arc<AppState>> {
    let executions: Arc<dyn ExecutionStore> = Arc::from(
        store::create_execution_store(config.execution_store, config.data_dir.clone())
            .await
            .map_err(anyhow::Error::msg)?,
    );
    let approvals: Arc<dyn ApprovalStore> = Arc::from(
        approval::create_approval_store(config.execution_store, config.data_dir.clone())
            .await
            .map_err(anyhow::Error::msg)?,
    );
    tracing::info!(
        "Execution store ready ({}, persistent: {})",
        config.data_dir.display(),
        executions.is_persistent()
    );

    let llm = config
        .api_key
        .clone()
        .map(|key| Arc::new(OpenRouterClient::new(key)) as Arc<dyn LlmClient>);
    let tools = ToolRegistry::with_builtins(BuiltinTools {
        llm,
        model: config.default_model.clone(),
        tokens_per_cost_unit: config.tokens_per_cost_unit,
        issue_tracker: config.issue_tracker.clone(),
        locator_registry: config.locator_registry_path.clone(),
        approvals: approvals.clone(),
    })?;

    let orchestrator = Orchestrator::new(
        executions,
        tools,
        approvals,
        config.orchestrator_settings(),
    );
    orchestrator.recover().await?;

    Ok(Arc::new(AppState {
        config,
        orchestrator,
    }))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/executions", post(start_execution).get(list_executions))
        .route("/api/executions/:id", get(get_execution))
        .route("/api/executions/:id/actions", get(get_actions))
        .route("/api/executions/:id/cancel", post(cancel_execution))
        .route("/api/approvals", get(list_pending_approvals))
        .route("/api/approvals/:ticket_id", get(get_ticket))
        .route("/api/approvals/:ticket_id/decision", post(decide))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let state = build_state(config).await?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Wait for SIGINT/SIGTERM. Executions need no draining: everything they
/// need to resume is already in the store.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

fn error_response(err: OrchestratorError) -> (StatusCode, String) {
    let status = match &err {
        OrchestratorError::Configuration(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::InvalidGoal(_) => StatusCode::UNPROCESSABLE_ENTITY,
        OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::Conflict(_) => StatusCode::CONFLICT,
        OrchestratorError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        OrchestratorError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
    };
    if status.is_server_error() {
        tracing::error!("{}", err);
    }
    (status, err.to_string())
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        persistent: state.orchestrator.is_persistent(),
        default_config: state.config.default_execution,
        tools: state.orchestrator.tools(),
    })
}

/// Start a new execution.
async fn start_execution(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartExecutionRequest>,
) -> Result<Json<StartExecutionResponse>, (StatusCode, String)> {
    let config = req
        .config
        .map(|overrides| overrides.apply(state.config.default_execution));
    let id = state
        .orchestrator
        .start(&req.agent_type, req.goal, config, &req.requester)
        .await
        .map_err(error_response)?;
    Ok(Json(StartExecutionResponse {
        id,
        status: ExecutionStatus::Running,
    }))
}

/// List executions, newest first.
async fn list_executions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Execution>>, (StatusCode, String)> {
    state
        .orchestrator
        .list(query.limit.min(500), query.offset)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn get_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Execution>, (StatusCode, String)> {
    state
        .orchestrator
        .get_status(id)
        .await
        .map(Json)
        .map_err(error_response)
}

/// Audit log of an execution.
async fn get_actions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<ActionRecord>>, (StatusCode, String)> {
    state
        .orchestrator
        .get_actions(id)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn cancel_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<CancelResponse>, (StatusCode, String)> {
    let cancelled = state
        .orchestrator
        .cancel(id)
        .await
        .map_err(error_response)?;
    Ok(Json(CancelResponse { cancelled }))
}

async fn list_pending_approvals(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ApprovalTicket>>, (StatusCode, String)> {
    state
        .orchestrator
        .pending_tickets()
        .await
        .map(Json)
        .map_err(error_response)
}

async fn get_ticket(
    State(state): State<Arc<AppState>>,
    Path(ticket_id): Path<String>,
) -> Result<Json<ApprovalTicket>, (StatusCode, String)> {
    state
        .orchestrator
        .get_ticket(&ticket_id)
        .await
        .map(Json)
        .map_err(error_response)
}

/// Manual decision path.
async fn decide(
    State(state): State<Arc<AppState>>,
    Path(ticket_id): Path<String>,
    Json(req): Json<DecisionRequest>,
) -> Result<Json<ApprovalTicket>, (StatusCode, String)> {
    let decision = DecisionEvent {
        ticket_id,
        approved: req.approved,
        reviewer: req.reviewer,
        notes: req.notes,
    };
    state
        .orchestrator
        .decide(decision)
        .await
        .map(Json)
        .map_err(error_response)
}
