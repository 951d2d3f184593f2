//! `infraflowd deployer`: serves `RunTask` for workers on another host

use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use infraflow_controlplane::RUN_TASK_PATH;
use infraflow_core::{TaskInfo, TaskResult};
use infraflow_deployer::TaskRunner;
use std::sync::Arc;

pub fn router(runner: Arc<dyn TaskRunner>) -> Router {
    Router::new()
        .route(
            "/health",
            get(|| async { Json(serde_json::json!({ "status": "ok" })) }),
        )
        .route(RUN_TASK_PATH, post(run_task))
        .with_state(runner)
}

async fn run_task(
    State(runner): State<Arc<dyn TaskRunner>>,
    Json(info): Json<TaskInfo>,
) -> Json<TaskResult> {
    tracing::info!(
        "RunTask {} ({} {} attempt {})",
        info.task_id,
        info.operation,
        info.entity.id,
        info.attempt
    );
    let result = runner.run_task(info).await;
    Json(result)
}
