//! On-demand acquisition of a server connection with the required TLS
//! posture: pool hit, stash take-back, or a fresh connect driving the
//! server-side greetor.

use crate::backend::ServerConnection;
use crate::change_user::ChangeUserSender;
use crate::config::ServerSslMode;
use crate::connection::{run_stack, ConnectionContext};
use crate::destinations::Endpoint;
use crate::greeting::server_greetor::ServerGreetor;
use crate::pool::{async_close_connection, PooledMeta};
use crate::processor::{Processor, ProcessorResult};

use async_trait::async_trait;
use std::io;
use std::time::Instant;
use tracing::{debug, trace};

/// TLS toward the server is required by server_ssl_mode, or inherited from
/// the client leg with AS_CLIENT.
pub fn requires_tls(cx: &ConnectionContext) -> bool {
    match cx.route.server_ssl_mode {
        ServerSslMode::Required | ServerSslMode::Preferred => true,
        ServerSslMode::Disabled => false,
        ServerSslMode::AsClient => cx.client.is_tls(),
    }
}

enum Stage {
    Init,
    TryNext,
    AwaitHandshake,
    Done,
}

/// "Get me a server connection that matches the required TLS posture."
pub struct LazyConnector {
    stage: Stage,
    candidates: Vec<Endpoint>,
    index: usize,
    deadline: Option<Instant>,
    needs_tls: bool,
    last_error: Option<io::Error>,
}

impl LazyConnector {
    pub fn new() -> Self {
        Self {
            stage: Stage::Init,
            candidates: Vec::new(),
            index: 0,
            deadline: None,
            needs_tls: false,
            last_error: None,
        }
    }

    fn reuse_predicate<'a>(
        needs_tls: bool,
        username: Option<&'a [u8]>,
    ) -> impl Fn(&PooledMeta) -> bool + 'a {
        move |meta: &PooledMeta| {
            meta.authenticated
                && meta.tls == needs_tls
                && meta.username.as_deref() == username
        }
    }
}

impl Default for LazyConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Processor for LazyConnector {
    fn name(&self) -> &'static str {
        "lazy-connector"
    }

    async fn process(&mut self, cx: &mut ConnectionContext) -> io::Result<ProcessorResult> {
        match self.stage {
            Stage::Init => {
                self.needs_tls = requires_tls(cx);
                self.candidates = cx.destinations.candidates();
                if self.candidates.is_empty() {
                    return Err(io::Error::new(
                        io::ErrorKind::NotConnected,
                        "no destinations available",
                    ));
                }
                self.deadline = Some(Instant::now() + cx.route.connect_retry_timeout);
                self.stage = Stage::TryNext;
                Ok(ProcessorResult::Again)
            }
            Stage::TryNext => {
                if self.index >= self.candidates.len()
                    || self.deadline.is_some_and(|d| Instant::now() > d)
                {
                    return Err(self.last_error.take().unwrap_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::NotConnected,
                            "all destinations exhausted",
                        )
                    }));
                }
                let endpoint = self.candidates[self.index].clone();

                // pool first: an idle, authenticated connection for this
                // user with the right TLS posture.
                let username = cx.client_state.username.clone();
                if let Some(conn) = cx
                    .pool
                    .pop_if(
                        &endpoint.to_string(),
                        Self::reuse_predicate(self.needs_tls, username.as_deref()),
                    )
                    .await
                {
                    trace!("reusing pooled {} to {endpoint}", conn.id);
                    cx.server = Some(conn);
                    // re-auth over the open connection to verify the
                    // client's credentials.
                    cx.push_processor(Box::new(ChangeUserSender::for_initial_auth()));
                    self.stage = Stage::AwaitHandshake;
                    return Ok(ProcessorResult::Again);
                }

                match ServerConnection::connect(&endpoint, cx.route.connect_timeout).await {
                    Ok(conn) => {
                        debug!("connected to {endpoint} as {}", conn.id);
                        cx.server = Some(conn);
                        cx.push_processor(Box::new(ServerGreetor::new()));
                        self.stage = Stage::AwaitHandshake;
                        Ok(ProcessorResult::Again)
                    }
                    Err(e) => {
                        debug!("connecting to {endpoint} failed: {e}");
                        cx.destinations.report_failure(&endpoint);
                        self.last_error = Some(e);
                        self.index += 1;
                        Ok(ProcessorResult::Again)
                    }
                }
            }
            Stage::AwaitHandshake => {
                if let Some(failure) = cx.take_failure() {
                    // transport-level failure: try the next endpoint. an
                    // auth error from the server is final and was captured.
                    if let Some(server) = cx.server.take() {
                        async_close_connection(server);
                    }
                    if cx.auth_error.is_some() {
                        self.stage = Stage::Done;
                        return Ok(ProcessorResult::Done);
                    }
                    let endpoint = &self.candidates[self.index];
                    cx.destinations.report_failure(endpoint);
                    self.last_error = Some(failure);
                    self.index += 1;
                    self.stage = Stage::TryNext;
                    return Ok(ProcessorResult::Again);
                }
                self.stage = Stage::Done;
                Ok(ProcessorResult::Done)
            }
            Stage::Done => Ok(ProcessorResult::Done),
        }
    }
}

/// Command-phase re-attach: the session's own stashed connection, a
/// stealable one, or the full connector path.
pub async fn ensure_server_connection(cx: &mut ConnectionContext) -> io::Result<()> {
    if cx.server.is_some() {
        return Ok(());
    }

    if let Some(endpoint) = cx.stashed_endpoint.take() {
        if let Some(conn) = cx.pool.unstash_mine(&endpoint, &cx.conn_id) {
            trace!("{} took back its stashed {}", cx.conn_id, conn.id);
            cx.server = Some(conn);
            return Ok(());
        }
        // someone stole it; fall through.
    }

    let username = cx.client_state.username.clone();
    let needs_tls = requires_tls(cx);
    for endpoint in cx.destinations.candidates() {
        if let Some(conn) = cx.pool.unstash_if(
            &endpoint.to_string(),
            |conn| {
                conn.authenticated
                    && conn.is_tls() == needs_tls
                    && conn.state.username.as_deref() == username.as_deref()
            },
            false,
        ) {
            trace!("{} stole stashed {}", cx.conn_id, conn.id);
            cx.server = Some(conn);
            return Ok(());
        }
    }

    run_stack(cx, vec![Box::new(LazyConnector::new())]).await?;
    if !cx.authenticated() {
        return Err(io::Error::new(
            io::ErrorKind::NotConnected,
            "could not attach a server connection",
        ));
    }
    Ok(())
}
