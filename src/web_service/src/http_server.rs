use crate::http_handler::*;

use anyhow::anyhow;
use axum::routing::get;
use axum::Router;
use proxy::pool::ConnectionPoolComponent;
use std::future::Future;
use std::sync::Arc;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};

pub struct RouterRest;

#[derive(Clone)]
pub struct RouterRestState {
    pub pools: Arc<ConnectionPoolComponent>,
    pub routes: Arc<Vec<RouteSummary>>,
}

impl RouterRest {
    pub async fn start_server<F>(
        addr: String,
        port: u16,
        enable_metric: bool,
        state: RouterRestState,
        shutdown: F,
    ) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut app = Router::new()
            .route("/", get(|| async { "Hi I'm the router REST service" }))
            .route(
                "/api/v1/connection_pool/:name/status",
                get(connection_pool_status),
            )
            .route("/api/v1/routes", get(list_routes))
            .route("/api/v1/router/dynamic_config", get(dynamic_config_dump))
            .with_state(state);

        if enable_metric {
            app = app.merge(route_metrics(MetricsHandler {}));
        }

        app = app.layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::new()));
        let listener = tokio::net::TcpListener::bind(format!("{addr}:{port}")).await?;

        match axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::warn!("Failed to start RouterRest {e:?}");
                Err(anyhow!(e.to_string()))
            }
        }
    }
}
