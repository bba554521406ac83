use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{
    orchestrator::RunOrchestrator,
    state::RunState,
    store::Stores,
    supervisor::ProcessSupervisor,
};

#[derive(Clone)]
pub struct AppState {
    stores: Stores,
    supervisor: Arc<dyn ProcessSupervisor>,
    runs: Arc<RwLock<HashMap<String, RunOrchestrator>>>, // live orchestrators by run name
}

impl AppState {
    pub fn new(stores: Stores, supervisor: Arc<dyn ProcessSupervisor>) -> Self {
        Self {
            stores,
            supervisor,
            runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// The live orchestrator for `name`, created from the stored configuration on first use.
    pub async fn orchestrator(&self, name: &str) -> Result<Option<RunOrchestrator>> {
        if let Some(o) = self.runs.read().await.get(name) {
            return Ok(Some(o.clone()));
        }
        let mut runs = self.runs.write().await;
        if let Some(o) = runs.get(name) {
            return Ok(Some(o.clone()));
        }
        let Some(o) = RunOrchestrator::load(name, self.stores.clone(), self.supervisor.clone())?
        else {
            return Ok(None);
        };
        runs.insert(name.to_string(), o.clone());
        Ok(Some(o))
    }

    /// Stop every live run.
    pub async fn stop_all(&self) {
        let runs: Vec<RunOrchestrator> = self.runs.read().await.values().cloned().collect();
        for run in runs {
            run.stop().await;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ControlResponse {
    pub name: String,
    pub state: RunState,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/runs", get(get_runs))
        .route("/runs/{name}", get(get_run))
        .route("/runs/{name}/results", get(get_results))
        .route("/runs/{name}/{action}", post(post_control))
        .route("/tools", get(get_tools))
        .route("/tools/{name}", get(get_tool))
        .with_state(state);

    Router::new()
        .nest("/api", api)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

pub async fn spawn_server(bind: &str, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("serving run API on http://{}", bind);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

fn internal(e: anyhow::Error) -> Response {
    error!("request failed: {e:#}");
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")).into_response()
}

async fn get_runs(State(app): State<AppState>) -> Response {
    match app.stores.configs.read_all_run_configurations() {
        Ok(all) => (StatusCode::OK, Json(all)).into_response(),
        Err(e) => internal(e),
    }
}

async fn get_run(State(app): State<AppState>, Path(name): Path<String>) -> Response {
    match app.stores.configs.read_run_configuration(&name) {
        Ok(Some(config)) => (StatusCode::OK, Json(config)).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, format!("no run named {name}")).into_response(),
        Err(e) => internal(e),
    }
}

async fn get_results(State(app): State<AppState>, Path(name): Path<String>) -> Response {
    match app.stores.results.read_run_results(&name) {
        Ok(history) => (StatusCode::OK, Json(history)).into_response(),
        Err(e) => internal(e),
    }
}

async fn get_tools(State(app): State<AppState>) -> Response {
    match app.stores.tools.read_all_tool_configurations() {
        Ok(all) => (StatusCode::OK, Json(all)).into_response(),
        Err(e) => internal(e),
    }
}

async fn get_tool(State(app): State<AppState>, Path(name): Path<String>) -> Response {
    match app.stores.tools.read_tool_configuration(&name) {
        Ok(Some(tool)) => (StatusCode::OK, Json(tool)).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, format!("no tool named {name}")).into_response(),
        Err(e) => internal(e),
    }
}

async fn post_control(
    State(app): State<AppState>,
    Path((name, action)): Path<(String, String)>,
) -> Response {
    if !matches!(action.as_str(), "play" | "pause" | "stop") {
        return (StatusCode::NOT_FOUND, format!("unknown action: {action}")).into_response();
    }
    let run = match app.orchestrator(&name).await {
        Ok(Some(run)) => run,
        Ok(None) => {
            return (StatusCode::NOT_FOUND, format!("no run named {name}")).into_response()
        }
        Err(e) => return internal(e),
    };
    match action.as_str() {
        "play" => run.play().await,
        "pause" => run.pause().await,
        _ => run.stop().await,
    }
    let out = ControlResponse {
        name,
        state: run.state(),
    };
    (StatusCode::ACCEPTED, Json(out)).into_response()
}
