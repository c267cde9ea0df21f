use clap::Parser;
use common::config::options::option_as_uint;
use common::config::{Config, ConfigError};
use common::dynamic_config::{DynamicConfig, SectionId};
use common::ShutdownMessage;
use proxy::server::Router;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::sync::watch::Receiver;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;
use web_service::http_handler::RouteSummary;
use web_service::http_server::{RouterRest, RouterRestState};

#[derive(Parser, Debug, Clone)]
#[clap(
    name = "trestle",
    version = "0.1.0",
    about = "classic-protocol MySQL router with connection sharing."
)]
struct RouterArgs {
    #[clap(short, long, value_name = "CONFIG_FILE")]
    config: PathBuf,
    /// extra config files, merged last-wins.
    #[clap(long, value_name = "EXTRA_CONFIG")]
    extra_config: Vec<PathBuf>,
    #[clap(long, value_name = "HTTP_PORT", default_value_t = 9000)]
    http_port: u16,
    #[clap(long, default_value_t = false)]
    enable_metrics: bool,
    #[clap(long, default_value_t = false)]
    enable_rest: bool,
    #[clap(long, value_name = "LOG_LEVEL")]
    log_level: Option<String>,
}

async fn shutdown_await(mut shutdown_rx: Box<Receiver<ShutdownMessage>>) {
    let changed_rs = &shutdown_rx.changed().await;
    if changed_rs.is_ok() {
        let canceled = shutdown_rx.borrow_and_update().clone();
        if let ShutdownMessage::Cancel(msg) = canceled {
            info!("Router process receive shutdown msg {msg}");
        }
    }
}

async fn shutdown_signal() -> ShutdownMessage {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        ctrl_c_v = ctrl_c => {
            let msg = format!("Router receive ctrl_c signal  {ctrl_c_v:?}");
            ShutdownMessage::Cancel(msg)
        },
        v = terminate => {
            let msg =  format!("Router receive terminate signal  {v:?}");
            ShutdownMessage::Cancel(msg)
        },
    }
}

/// `[io]` section: worker threads (0 = one per CPU) and the backend name;
/// the latter is recorded but the runtime picks the actual poller.
fn io_options(config: &Config) -> Result<(usize, Option<String>), ConfigError> {
    let Some(section) = config.get("io", None) else {
        return Ok((0, None));
    };
    for option in section.section().option_names() {
        if !matches!(option, "threads" | "backend") {
            return Err(ConfigError::InvalidArgument(format!(
                "unknown option {option} in [io]"
            )));
        }
    }
    let threads = match section.get("threads")? {
        Some(value) if !value.is_empty() => option_as_uint::<usize>(&value, "threads", 0, 1024)?,
        _ => 0,
    };
    let backend = section.get("backend")?.filter(|v| !v.is_empty());
    Ok((threads, backend))
}

fn route_summaries(router: &Router) -> Vec<RouteSummary> {
    router
        .routes()
        .iter()
        .map(|route| {
            let config = &route.config;
            RouteSummary {
                name: config.name.clone(),
                protocol: config.protocol.to_string(),
                destinations: config.destinations.to_string(),
                routing_strategy: config.routing_strategy.to_string(),
                client_ssl_mode: config.client_ssl_mode.to_string(),
                server_ssl_mode: config.server_ssl_mode.to_string(),
                connection_sharing: config.connection_sharing,
                max_connections: config.max_connections,
            }
        })
        .collect()
}

fn start_metrics_and_rest(
    args: &RouterArgs,
    runtime: &tokio::runtime::Runtime,
    state: RouterRestState,
    shutdown_rx: &Receiver<ShutdownMessage>,
) {
    if !(args.enable_metrics || args.enable_rest) {
        return;
    }
    if args.enable_metrics {
        common::metrics::init_metrics_context();
    }
    let http_port = args.http_port;
    let enable_metrics = args.enable_metrics;
    let shutdown_rx_clone = Box::new(shutdown_rx.clone());
    runtime.spawn(async move {
        let serve_rs = RouterRest::start_server(
            "0.0.0.0".to_string(),
            http_port,
            enable_metrics,
            state,
            shutdown_await(shutdown_rx_clone),
        )
        .await;
        if let Err(e) = serve_rs {
            warn!("REST service failed: {e}");
        }
    });
}

fn main() -> anyhow::Result<()> {
    let args = RouterArgs::parse();
    let log_level_string = args.log_level.clone().unwrap_or("INFO".to_string());
    let level = Level::from_str(log_level_string.as_str())?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("INFO,hyper=INFO,tower=INFO,h2=INFO"))
        .add_directive(level.into())
        .add_directive("hyper=INFO".parse()?)
        .add_directive("tower=INFO".parse()?);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_line_number(true)
        .init();

    let mut config = Config::new();
    config.read_file(&args.config)?;
    for extra in &args.extra_config {
        config.read_file(extra)?;
    }

    let (io_threads, io_backend) = io_options(&config)?;
    {
        let io_section = SectionId::new("io", None);
        let dynamic_config = DynamicConfig::shared();
        dynamic_config.set_option_configured(&io_section, "threads", io_threads as i64);
        if let Some(backend) = &io_backend {
            dynamic_config.set_option_configured(&io_section, "backend", backend.as_str());
        }
    }

    let mut runtime_builder = tokio::runtime::Builder::new_multi_thread();
    runtime_builder.enable_all().thread_name("ROUTER_IO");
    if io_threads != 0 {
        runtime_builder.worker_threads(io_threads);
    }
    let runtime = runtime_builder.build()?;

    let router = Arc::new(Router::from_config(&config)?);
    info!("router configured with {} route(s)", router.routes().len());

    let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownMessage::Init);
    let rest_state = RouterRestState {
        pools: router.pools(),
        routes: Arc::new(route_summaries(&router)),
    };
    start_metrics_and_rest(&args, &runtime, rest_state, &shutdown_rx);

    runtime.block_on(async {
        let serve_router = Arc::clone(&router);
        let serve_shutdown_rx = shutdown_rx.clone();
        let serve = tokio::spawn(async move {
            serve_router.serve(serve_shutdown_rx).await;
        });

        let shutdown_msg = shutdown_signal().await;
        shutdown_tx.send(shutdown_msg).ok();
        let _ = serve.await;
    });
    info!("router stopped");
    Ok(())
}
