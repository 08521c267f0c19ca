//! HTTP surface (C11), grounded in the axum + graceful-shutdown pattern of
//! `testimages/simple_web_server/src/main.rs` and in the endpoint shapes of
//! `original_source/core/model_deployer/multi_cluster/request_api.py`.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use deploy_core::model::{DeploymentSpec, DeploymentSpecRequest, ModelRef};
use deploy_core::DeployOptions;
use fleet_control::FleetController;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

pub struct AppState {
    pub controller: Arc<FleetController>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/enqueue", post(enqueue))
        .route("/status/:id", get(status))
        .route("/stats", get(stats))
        .route("/deploy", post(deploy))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Serialize)]
struct EnqueueResponse {
    status: &'static str,
    request_id: Uuid,
}

async fn enqueue(State(state): State<Arc<AppState>>, Json(payload): Json<Value>) -> Json<EnqueueResponse> {
    let request_id = state.controller.queue.enqueue(payload).await;
    Json(EnqueueResponse {
        status: "queued",
        request_id,
    })
}

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    request_id: String,
}

/// Reports `processing` unconditionally. Request lifecycle past enqueue is
/// not tracked anywhere in the fleet controller's data model, so this
/// cannot distinguish "queued", "dispatched" or "delivered" without adding
/// a tracking table the rest of the system has no other use for.
async fn status(AxumPath(id): AxumPath<String>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "processing",
        request_id: id,
    })
}

#[derive(Serialize)]
struct StatsResponse {
    queue_length: usize,
    active_replicas: usize,
    endpoints: Vec<String>,
    lb_strategy: &'static str,
    min_replicas: usize,
    max_replicas: usize,
}

async fn stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    let queue_length = state.controller.queue.length().await;
    let active = state.controller.manager.active_endpoints().await;
    let endpoints = active.iter().map(|r| r.endpoint.clone()).collect();
    let lb_strategy = match state.controller.config.lb_strategy {
        deploy_core::config::LbStrategy::RoundRobin => "round_robin",
        deploy_core::config::LbStrategy::Random => "random",
        deploy_core::config::LbStrategy::LeastConnections => "least_connections",
    };
    Json(StatsResponse {
        queue_length,
        active_replicas: active.len(),
        endpoints,
        lb_strategy,
        min_replicas: state.controller.config.autoscaler.min_replicas,
        max_replicas: state.controller.config.autoscaler.max_replicas,
    })
}

#[derive(Serialize)]
struct DeployResponse {
    success: bool,
    details: Option<String>,
    error: Option<String>,
}

/// Always returns HTTP 200, success or failure, with the outcome carried in
/// the body — mirrors the legacy behavior of `request_api.py`'s `/deploy`
/// route, which never surfaces a non-2xx status to callers.
async fn deploy(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DeploymentSpecRequest>,
) -> (StatusCode, Json<DeployResponse>) {
    let spec = match build_spec(&state, &request) {
        Ok(spec) => spec,
        Err(message) => {
            return (
                StatusCode::OK,
                Json(DeployResponse {
                    success: false,
                    details: None,
                    error: Some(message),
                }),
            )
        }
    };

    match state
        .controller
        .manager
        .deploy_to(&request.cluster_id, spec, DeployOptions::default())
        .await
    {
        Ok(replica) => (
            StatusCode::OK,
            Json(DeployResponse {
                success: true,
                details: Some(format!(
                    "container {} registered as {} at {}",
                    replica.container_id, replica.instance_id, replica.endpoint
                )),
                error: None,
            }),
        ),
        Err(e) => (
            StatusCode::OK,
            Json(DeployResponse {
                success: false,
                details: None,
                error: Some(format!("{} failed at {}: {e}", request.cluster_id, e.stage())),
            }),
        ),
    }
}

fn build_spec(state: &AppState, request: &DeploymentSpecRequest) -> Result<DeploymentSpec, String> {
    let cluster = state
        .controller
        .manager
        .find_cluster(&request.cluster_id)
        .ok_or_else(|| format!("unknown cluster_id: {}", request.cluster_id))?;

    let model_ref = if request.is_hosted_ref {
        ModelRef::Hosted {
            repo_id: request.model_ref.clone(),
            token: request.hosted_token.clone(),
        }
    } else {
        ModelRef::Local(PathBuf::from(&request.model_ref))
    };

    Ok(DeploymentSpec {
        model_ref,
        inference_entrypoint: request.inference_entrypoint.clone(),
        image_tag: request.image_tag.clone(),
        credentials: cluster.credentials(),
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}
