use crate::http_server::RouterRestState;
use axum::extract::{Path, State};
use axum::http;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use common::dynamic_config::{DefaultsScope, DynamicConfig};
use serde::Serialize;
use serde_json::json;

#[derive(Clone, Copy)]
pub struct MetricsHandler;

impl MetricsHandler {
    pub fn render(&self) -> String {
        if let Some(prometheus_handle) = common::metrics::try_handle() {
            prometheus_handle.render()
        } else {
            "Please initialize the prometheus context first.".to_string()
        }
    }
}

pub fn route_metrics<S>(metrics_handler: MetricsHandler) -> Router<S> {
    Router::new()
        .route("/metrics", get(metrics_get))
        .with_state(metrics_handler)
}

/// What `/api/v1/routes` reports per route.
#[derive(Debug, Clone, Serialize)]
pub struct RouteSummary {
    pub name: String,
    pub protocol: String,
    pub destinations: String,
    pub routing_strategy: String,
    pub client_ssl_mode: String,
    pub server_ssl_mode: String,
    pub connection_sharing: bool,
    pub max_connections: u32,
}

pub async fn list_routes(State(state): State<RouterRestState>) -> Json<Vec<RouteSummary>> {
    Json(state.routes.as_ref().clone())
}

#[derive(Debug, Serialize)]
struct PoolStatus {
    max_pooled_connections: u32,
    idle_server_connections: u32,
    stashed_server_connections: usize,
    reused_server_connections: u64,
    idle_timeout_ms: u128,
}

pub async fn connection_pool_status(
    Path(name): Path<String>,
    State(state): State<RouterRestState>,
) -> impl IntoResponse {
    match state.pools.get(&name) {
        Some(pool) => Json(PoolStatus {
            max_pooled_connections: pool.max_pooled_connections(),
            idle_server_connections: pool.current_pooled_connections(),
            stashed_server_connections: pool.current_stashed_connections(),
            reused_server_connections: pool.reused_connections(),
            idle_timeout_ms: pool.idle_timeout().as_millis(),
        })
        .into_response(),
        None => (
            http::StatusCode::NOT_FOUND,
            Json(json!({"error": format!("no connection pool named '{name}'")})),
        )
            .into_response(),
    }
}

pub async fn dynamic_config_dump() -> Json<serde_json::Value> {
    let dynamic_config = DynamicConfig::shared();
    Json(json!({
        "configured": dynamic_config.dump_configured(),
        "defaults_for_cluster": dynamic_config.dump_defaults(DefaultsScope::Cluster),
        "defaults_for_clusterset": dynamic_config.dump_defaults(DefaultsScope::ClusterSet),
    }))
}

#[axum_macros::debug_handler]
async fn metrics_get(state: State<MetricsHandler>) -> String {
    state.render()
}
