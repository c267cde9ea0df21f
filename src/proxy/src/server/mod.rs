//! Route acceptors and the router top-level: bind, gate, spawn a
//! per-connection driver, shut down cleanly.

use crate::channel::{BoxedStream, Channel};
use crate::config::RouteConfig;
#[cfg(feature = "tls")]
use crate::config::{ClientSslMode, ServerSslMode};
use crate::connection::{command_phase, run_stack, ConnectionContext};
use crate::destinations::Destinations;
use crate::greeting::client_greetor::ClientGreetor;
use crate::pool::{ConnectionPool, ConnectionPoolComponent, DEFAULT_MAX_IDLE_SERVER_CONNECTIONS};
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::writers::write_pre_handshake_err_packet;

use common::config::options::option_as_uint;
use common::config::{Config, ConfigError};
use common::dynamic_config::{DynamicConfig, SectionId};
use common::metrics::metric_def::{ROUTER_CURR_CONN, ROUTER_MAX_CONN};
use common::metrics::{common_labels, gauge, gauge_dec, gauge_inc};
use common::ShutdownMessage;
use nanoid::nanoid;
use rsa::RsaPrivateKey;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[cfg(feature = "tls")]
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// One configured route with its runtime collaborators.
pub struct Route {
    pub config: Arc<RouteConfig>,
    pub pool: Arc<ConnectionPool>,
    pub destinations: Arc<Destinations>,
    #[cfg(feature = "tls")]
    tls_acceptor: Option<TlsAcceptor>,
    #[cfg(feature = "tls")]
    tls_connector: Option<TlsConnector>,
    router_private_key: Option<Arc<RsaPrivateKey>>,
    active_connections: AtomicU32,
}

impl Route {
    pub fn new(config: RouteConfig, pool: Arc<ConnectionPool>) -> io::Result<Arc<Route>> {
        let destinations = Arc::new(Destinations::new(
            &config.destinations,
            config.routing_strategy,
        ));

        #[cfg(feature = "tls")]
        let tls_acceptor = if matches!(
            config.client_ssl_mode,
            ClientSslMode::Preferred | ClientSslMode::Required
        ) {
            Some(crate::tls::build_acceptor(
                &config.client_ssl.cert,
                &config.client_ssl.key,
            )?)
        } else {
            None
        };

        #[cfg(feature = "tls")]
        let tls_connector = if config.server_ssl_mode != ServerSslMode::Disabled {
            Some(crate::tls::build_connector(
                config.server_ssl_verify,
                (!config.server_ssl.ca.is_empty()).then_some(config.server_ssl.ca.as_str()),
                (!config.server_ssl.capath.is_empty())
                    .then_some(config.server_ssl.capath.as_str()),
            )?)
        } else {
            None
        };

        let router_private_key = if !config.client_ssl.key.is_empty() {
            #[cfg(feature = "tls")]
            {
                let (_certs, key) = crate::tls::load_identity(
                    &config.client_ssl.cert,
                    &config.client_ssl.key,
                )?;
                Some(Arc::new(crate::auth::private_key_from_der(
                    key.secret_der(),
                )?))
            }
            #[cfg(not(feature = "tls"))]
            {
                None
            }
        } else {
            None
        };

        Ok(Arc::new(Route {
            config: Arc::new(config),
            pool,
            destinations,
            #[cfg(feature = "tls")]
            tls_acceptor,
            #[cfg(feature = "tls")]
            tls_connector,
            router_private_key,
            active_connections: AtomicU32::new(0),
        }))
    }

    pub async fn serve(
        self: Arc<Self>,
        mut shutdown_rx: watch::Receiver<ShutdownMessage>,
    ) -> io::Result<()> {
        gauge(
            ROUTER_MAX_CONN,
            self.config.max_connections as f64,
            Some(common_labels()),
        );

        let tcp_listener = match (&self.config.bind_address, self.config.bind_port) {
            (Some(address), port) if port != 0 => {
                Some(TcpListener::bind((address.as_str(), port)).await?)
            }
            (None, port) if port != 0 => Some(TcpListener::bind(("0.0.0.0", port)).await?),
            _ => None,
        };
        #[cfg(unix)]
        let unix_listener = match &self.config.socket {
            Some(path) => {
                let _ = std::fs::remove_file(path);
                Some(tokio::net::UnixListener::bind(path)?)
            }
            None => None,
        };
        #[cfg(not(unix))]
        let unix_listener: Option<()> = None;

        if let Some(listener) = &tcp_listener {
            info!(
                "route [{}] listening on {}",
                self.config.name,
                listener.local_addr()?
            );
        }

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("route [{}] shutting down", self.config.name);
                    return Ok(());
                }
                accepted = async {
                    match &tcp_listener {
                        Some(listener) => listener.accept().await.map(|(stream, addr)| {
                            let _ = stream.set_nodelay(true);
                            (Box::new(stream) as BoxedStream, addr.to_string(), false)
                        }),
                        None => std::future::pending().await,
                    }
                } => {
                    match accepted {
                        Ok((stream, addr, secure)) => self.clone().spawn_connection(stream, addr, secure),
                        Err(e) => warn!("route [{}] accept error: {e}", self.config.name),
                    }
                }
                accepted = accept_unix(&unix_listener) => {
                    match accepted {
                        Ok((stream, addr, secure)) => self.clone().spawn_connection(stream, addr, secure),
                        Err(e) => warn!("route [{}] accept error: {e}", self.config.name),
                    }
                }
            }
        }
    }

    fn spawn_connection(self: Arc<Self>, stream: BoxedStream, addr: String, secure: bool) {
        tokio::spawn(async move {
            if let Err(e) = self.handle_connection(stream, &addr, secure).await {
                debug!("connection from {addr} ended: {e}");
            }
        });
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: BoxedStream,
        addr: &str,
        secure_transport: bool,
    ) -> io::Result<()> {
        let active = self.active_connections.fetch_add(1, Ordering::SeqCst) + 1;
        if self.config.max_connections != 0 && active > self.config.max_connections {
            self.active_connections.fetch_sub(1, Ordering::SeqCst);
            let mut writer = PacketWriter::new(stream);
            write_pre_handshake_err_packet(
                ErrorKind::ER_CON_COUNT_ERROR as u16,
                b"Too many connections",
                &mut writer,
            )
            .await?;
            return Ok(());
        }
        gauge_inc(ROUTER_CURR_CONN, 1.0, Some(common_labels()));

        let result = self.drive_connection(stream, addr, secure_transport).await;

        self.active_connections.fetch_sub(1, Ordering::SeqCst);
        gauge_dec(ROUTER_CURR_CONN, 1.0, Some(common_labels()));
        result
    }

    async fn drive_connection(
        &self,
        stream: BoxedStream,
        addr: &str,
        secure_transport: bool,
    ) -> io::Result<()> {
        let conn_id = nanoid!();
        debug!("client {addr} connected as {conn_id}");

        let mut cx = ConnectionContext::new(
            conn_id,
            Arc::clone(&self.config),
            Arc::clone(&self.pool),
            Arc::clone(&self.destinations),
            Channel::new(stream),
            secure_transport,
        );
        #[cfg(feature = "tls")]
        {
            cx.tls_acceptor = self.tls_acceptor.clone();
            cx.tls_connector = self.tls_connector.clone();
        }
        cx.router_private_key = self.router_private_key.clone();

        // the whole handshake must fit into client_connect_timeout.
        tokio::time::timeout(
            self.config.client_connect_timeout,
            run_stack(&mut cx, vec![Box::new(ClientGreetor::new())]),
        )
        .await
        .map_err(|_| {
            io::Error::new(io::ErrorKind::TimedOut, "client handshake timed out")
        })??;

        if cx.passthrough_relay {
            return relay_raw(cx).await;
        }

        if cx.route.connection_sharing && cx.authenticated() {
            crate::change_user::enable_session_trackers(&mut cx).await?;
        }

        command_phase(&mut cx).await
    }
}

#[cfg(unix)]
async fn accept_unix(
    listener: &Option<tokio::net::UnixListener>,
) -> io::Result<(BoxedStream, String, bool)> {
    match listener {
        Some(listener) => listener
            .accept()
            .await
            .map(|(stream, _)| (Box::new(stream) as BoxedStream, "unix".to_string(), true)),
        None => std::future::pending().await,
    }
}

#[cfg(not(unix))]
async fn accept_unix(_listener: &Option<()>) -> io::Result<(BoxedStream, String, bool)> {
    std::future::pending().await
}

/// PASSTHROUGH after the greeting: both legs are opaque (TLS records
/// included); shuttle bytes until either side closes.
async fn relay_raw(mut cx: ConnectionContext) -> io::Result<()> {
    let server = cx.server.take().ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotConnected, "no server leg for passthrough")
    })?;
    let mut client_stream = cx.client.into_stream()?;
    let mut server_stream = server.channel.into_stream()?;
    let relayed = tokio::io::copy_bidirectional(&mut client_stream, &mut server_stream).await;
    match relayed {
        Ok((c2s, s2c)) => debug!("passthrough relay done: {c2s}B out, {s2c}B in"),
        Err(e) => debug!("passthrough relay ended: {e}"),
    }
    Ok(())
}

/// The process-wide router: all configured routes plus the shared pools.
pub struct Router {
    routes: Vec<Arc<Route>>,
    pools: Arc<ConnectionPoolComponent>,
}

impl Router {
    pub fn from_config(config: &Config) -> Result<Router, ConfigError> {
        let dynamic_config = DynamicConfig::shared();

        let (max_idle, idle_timeout) = pool_options(config)?;
        let pool_section = SectionId::new("connection_pool", None);
        dynamic_config.set_option_configured(
            &pool_section,
            "max_idle_server_connections",
            max_idle as i64,
        );
        dynamic_config.set_option_configured(
            &pool_section,
            "idle_timeout",
            idle_timeout.as_secs() as i64,
        );

        let pools = Arc::new(ConnectionPoolComponent::new());
        let mut routes = Vec::new();
        for section in config.sections() {
            if section.name() != "routing" {
                continue;
            }
            let route_config = RouteConfig::from_section(&section)?;
            route_config.expose(dynamic_config);
            if route_config.protocol == crate::config::Protocol::X {
                // recognised and validated, but only classic is served.
                warn!(
                    "route [{}] uses protocol=x and is not served",
                    route_config.name
                );
                continue;
            }

            let pool = Arc::new(ConnectionPool::new(max_idle, idle_timeout));
            pools.insert(&route_config.name, Arc::clone(&pool));
            let route = Route::new(route_config, pool).map_err(|e| {
                ConfigError::RuntimeError(format!("initialising route failed: {e}"))
            })?;
            routes.push(route);
        }
        if routes.is_empty() {
            return Err(ConfigError::Undefined(
                "no [routing] section found in the configuration".to_string(),
            ));
        }
        Ok(Router { routes, pools })
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    pub fn pools(&self) -> Arc<ConnectionPoolComponent> {
        Arc::clone(&self.pools)
    }

    pub async fn serve(&self, shutdown_rx: watch::Receiver<ShutdownMessage>) {
        let mut tasks = Vec::new();
        for route in &self.routes {
            let route = Arc::clone(route);
            let shutdown_rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = route.serve(shutdown_rx).await {
                    warn!("route failed: {e}");
                }
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
        // deinit: close every idle connection.
        self.pools.clear().await;
    }
}

/// `[connection_pool]` options.
fn pool_options(config: &Config) -> Result<(u32, Duration), ConfigError> {
    let Some(section) = config.get("connection_pool", None) else {
        return Ok((
            DEFAULT_MAX_IDLE_SERVER_CONNECTIONS,
            Duration::from_secs(5),
        ));
    };
    for option in section.section().option_names() {
        if !matches!(option, "max_idle_server_connections" | "idle_timeout") {
            return Err(ConfigError::InvalidArgument(format!(
                "unknown option {option} in [connection_pool]"
            )));
        }
    }
    let max_idle = match section.get("max_idle_server_connections")? {
        Some(value) if !value.is_empty() => {
            option_as_uint::<u32>(&value, "max_idle_server_connections", 0, u32::MAX)?
        }
        _ => DEFAULT_MAX_IDLE_SERVER_CONNECTIONS,
    };
    let idle_timeout = match section.get("idle_timeout")? {
        Some(value) if !value.is_empty() => {
            Duration::from_secs(option_as_uint::<u64>(&value, "idle_timeout", 1, 86400)?)
        }
        _ => Duration::from_secs(5),
    };
    Ok((max_idle, idle_timeout))
}
