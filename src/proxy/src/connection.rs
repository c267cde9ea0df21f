//! Per-client-connection context, the processor-stack driver, and the
//! command phase that shuttles frames once both legs are authenticated.

use crate::backend::ServerConnection;
use crate::change_user::ChangeUserForwarder;
use crate::channel::Channel;
use crate::config::RouteConfig;
use crate::connector::ensure_server_connection;
use crate::destinations::Destinations;
use crate::pool::{async_close_connection, ConnectionPool};
use crate::processor::{Processor, ProcessorResult};
use crate::protocol::mysql::basic::{eof_server_status, ok_packet};
use crate::protocol::mysql::constants::CommandCode;
use crate::protocol::mysql::packet::Packet;
use crate::state::{PreparedStatement, ProtocolState};

use byteorder::{ByteOrder, LittleEndian};
use mysql_common::constants::{CapabilityFlags, StatusFlags};
use num_traits::FromPrimitive;
use rsa::RsaPrivateKey;
use std::io::{self, Write};
use std::sync::Arc;
use tracing::{debug, trace};

#[cfg(feature = "tls")]
use tokio_rustls::{TlsAcceptor, TlsConnector};

pub struct ConnectionContext {
    pub conn_id: String,
    pub route: Arc<RouteConfig>,
    pub pool: Arc<ConnectionPool>,
    pub destinations: Arc<Destinations>,

    pub client: Channel,
    pub client_state: ProtocolState,
    pub server: Option<ServerConnection>,

    /// true when the client came in over a transport that is secure without
    /// TLS (a UNIX socket).
    pub client_is_secure_transport: bool,

    #[cfg(feature = "tls")]
    pub tls_acceptor: Option<TlsAcceptor>,
    #[cfg(feature = "tls")]
    pub tls_connector: Option<TlsConnector>,
    /// the key behind client_ssl_key, used to answer public-key requests.
    pub router_private_key: Option<Arc<RsaPrivateKey>>,

    /// one-message mailboxes filled by the driver's RecvFrom* handling.
    pub client_msg: Option<(u8, Packet)>,
    pub server_msg: Option<(u8, Packet)>,
    /// seq-id of the last message consumed from the client leg.
    pub client_last_seq: u8,
    /// seq-id of the last message consumed from the server leg.
    pub server_last_seq: u8,

    /// a server::Error captured for the parent processor to surface.
    pub auth_error: Option<Packet>,
    /// set when the auth flow already forwarded the final Ok to the client.
    pub server_ok_forwarded: bool,
    /// the client leg continues as a raw TLS-record relay (PASSTHROUGH).
    pub passthrough_relay: bool,
    /// where this session's server connection is stashed between commands.
    pub stashed_endpoint: Option<String>,

    last_failure: Option<io::Error>,
    pending_push: Option<Box<dyn Processor>>,
}

impl ConnectionContext {
    pub fn new(
        conn_id: String,
        route: Arc<RouteConfig>,
        pool: Arc<ConnectionPool>,
        destinations: Arc<Destinations>,
        client: Channel,
        client_is_secure_transport: bool,
    ) -> Self {
        Self {
            conn_id,
            route,
            pool,
            destinations,
            client,
            client_state: ProtocolState::default(),
            server: None,
            client_is_secure_transport,
            #[cfg(feature = "tls")]
            tls_acceptor: None,
            #[cfg(feature = "tls")]
            tls_connector: None,
            router_private_key: None,
            client_msg: None,
            server_msg: None,
            client_last_seq: 0,
            server_last_seq: 0,
            auth_error: None,
            server_ok_forwarded: false,
            passthrough_relay: false,
            stashed_endpoint: None,
            last_failure: None,
            pending_push: None,
        }
    }

    /// The client's transport counts as secure for auth purposes when it is
    /// TLS or a UNIX socket.
    pub fn client_transport_is_secure(&self) -> bool {
        self.client.is_tls() || self.client_is_secure_transport
    }

    pub fn push_processor(&mut self, processor: Box<dyn Processor>) {
        self.pending_push = Some(processor);
    }

    pub fn take_failure(&mut self) -> Option<io::Error> {
        self.last_failure.take()
    }

    pub fn server_mut(&mut self) -> io::Result<&mut ServerConnection> {
        self.server.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "no server connection attached")
        })
    }

    pub fn authenticated(&self) -> bool {
        self.server
            .as_ref()
            .map(|s| s.authenticated)
            .unwrap_or(false)
    }

    pub fn take_client_msg(&mut self) -> io::Result<(u8, Packet)> {
        let msg = self.client_msg.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "no client message pending")
        })?;
        self.client_last_seq = msg.0;
        Ok(msg)
    }

    pub fn take_server_msg(&mut self) -> io::Result<(u8, Packet)> {
        let msg = self.server_msg.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "no server message pending")
        })?;
        self.server_last_seq = msg.0;
        Ok(msg)
    }

    /// Receives directly from the client leg, updating the seq shadow.
    pub async fn recv_client(&mut self) -> io::Result<(u8, Packet)> {
        let msg = self.client.recv_msg().await?;
        self.client_last_seq = msg.0;
        Ok(msg)
    }

    /// Receives directly from the server leg, updating the seq shadow.
    pub async fn recv_server(&mut self) -> io::Result<(u8, Packet)> {
        let msg = self.server_mut()?.channel.recv_msg().await?;
        self.server_last_seq = msg.0;
        Ok(msg)
    }
}

/// Drives the LIFO until it drains. A processor error pops it; the error is
/// surfaced to the parent via `take_failure`, or returned if the stack is
/// empty.
pub async fn run_stack(
    cx: &mut ConnectionContext,
    mut stack: Vec<Box<dyn Processor>>,
) -> io::Result<()> {
    while let Some(top) = stack.last_mut() {
        let name = top.name();
        match top.process(cx).await {
            Ok(result) => {
                let pushed = cx.pending_push.take();
                match result {
                    ProcessorResult::Done => {
                        trace!("processor {name} done");
                        stack.pop();
                    }
                    ProcessorResult::Again => {}
                    ProcessorResult::SendToClient => {
                        cx.client.writer().flush_all().await?;
                    }
                    ProcessorResult::SendToServer => {
                        cx.server_mut()?.channel.writer().flush_all().await?;
                    }
                    ProcessorResult::RecvFromClient => {
                        let msg = cx.client.recv_msg().await?;
                        cx.client_msg = Some(msg);
                    }
                    ProcessorResult::RecvFromServer => {
                        let msg = cx.server_mut()?.channel.recv_msg().await?;
                        cx.server_msg = Some(msg);
                    }
                    ProcessorResult::RecvFromBoth => {
                        let server = cx.server.as_mut().ok_or_else(|| {
                            io::Error::new(
                                io::ErrorKind::NotConnected,
                                "no server connection attached",
                            )
                        })?;
                        tokio::select! {
                            msg = cx.client.recv_msg() => cx.client_msg = Some(msg?),
                            msg = server.channel.recv_msg() => cx.server_msg = Some(msg?),
                        }
                    }
                }
                if let Some(processor) = pushed {
                    trace!("processor {name} pushed {}", processor.name());
                    stack.push(processor);
                }
            }
            Err(e) => {
                debug!("processor {name} failed: {e}");
                stack.pop();
                if stack.is_empty() {
                    return Err(e);
                }
                cx.last_failure = Some(e);
            }
        }
    }
    Ok(())
}

/// Forwards one message (re-framed with `seq`) to the given writer.
async fn forward_packet<W>(
    writer: &mut crate::protocol::mysql::packet::packet_writer::PacketWriter<W>,
    seq: u8,
    pkt: &Packet,
    flush: bool,
) -> io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    writer.set_seq(seq);
    writer.write_all(pkt)?;
    writer.end_packet().await?;
    if flush {
        writer.flush_all().await?;
    }
    Ok(())
}

/// The command phase: the processor stack is empty and the router shuttles
/// frames, watching only the command byte and the response boundaries.
pub async fn command_phase(cx: &mut ConnectionContext) -> io::Result<()> {
    loop {
        maybe_stash_server(cx);

        let msg = cx.client.reader().next_async().await;
        let (seq, pkt) = match msg {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                debug!("client {} disconnected", cx.conn_id);
                release_server(cx);
                return Ok(());
            }
            Err(e) => {
                trace!("client {} gone: {e}", cx.conn_id);
                release_server(cx);
                return Ok(());
            }
        };
        if pkt.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "empty command packet",
            ));
        }
        let com_code = CommandCode::from_u8(pkt[0]);

        if com_code == Some(CommandCode::ComQuit) {
            debug!("client {} quit", cx.conn_id);
            release_server(cx);
            return Ok(());
        }

        ensure_server_connection(cx).await?;

        let timer = common::metrics::MetricsTimer::new(common::metrics::metric_def::ROUTER_COM_LATENCY);
        match com_code {
            Some(CommandCode::ComChangeUser) => {
                ChangeUserForwarder::new(seq, pkt).run(cx).await?;
            }
            Some(CommandCode::ComStmtPrepare) => {
                forward_to_server(cx, seq, &pkt).await?;
                relay_prepare_response(cx).await?;
            }
            Some(CommandCode::ComStmtClose) => {
                // fire-and-forget; drop the handle we tracked.
                if pkt.len() >= 5 {
                    let stmt_id = LittleEndian::read_u32(&pkt[1..5]);
                    cx.client_state.prepared_statements.remove(&stmt_id);
                }
                forward_to_server(cx, seq, &pkt).await?;
            }
            Some(CommandCode::ComStmtSendLongData) => {
                forward_to_server(cx, seq, &pkt).await?;
            }
            Some(CommandCode::ComResetConnection) => {
                forward_to_server(cx, seq, &pkt).await?;
                cx.client_state.prepared_statements.clear();
                relay_response(cx).await?;
            }
            Some(CommandCode::ComFieldList) | Some(CommandCode::ComStmtFetch) => {
                forward_to_server(cx, seq, &pkt).await?;
                let shared_caps = cx
                    .server
                    .as_ref()
                    .map(|s| s.state.shared_capabilities())
                    .unwrap_or_default();
                relay_until_result_end(cx, shared_caps).await?;
            }
            _ => {
                forward_to_server(cx, seq, &pkt).await?;
                relay_response(cx).await?;
            }
        }
        drop(timer);
    }
}

async fn forward_to_server(cx: &mut ConnectionContext, seq: u8, pkt: &Packet) -> io::Result<()> {
    let server = cx.server_mut()?;
    forward_packet(server.channel.writer(), seq, pkt, true).await
}

/// Mirrors the latest status flags into both legs' state shadows.
fn note_status_flags(cx: &mut ConnectionContext, status_flags: StatusFlags) {
    cx.client_state.status_flags = status_flags;
    if let Some(server) = cx.server.as_mut() {
        server.state.status_flags = status_flags;
    }
}

/// Forwards the response stream of one command to the client, tracking
/// Ok/Eof status flags and session-state changes.
async fn relay_response(cx: &mut ConnectionContext) -> io::Result<()> {
    let shared_caps = cx
        .server
        .as_ref()
        .map(|s| s.state.shared_capabilities())
        .unwrap_or_default();
    loop {
        let (seq, pkt) = cx.server_mut()?.channel.recv_msg().await?;
        forward_packet(cx.client.writer(), seq, &pkt, false).await?;

        let status_flags = if pkt.is_ok_packet() {
            cx.client.writer().flush_all().await?;
            let status = match ok_packet(&pkt, shared_caps) {
                Ok((_, ok)) => {
                    if !ok.session_state_info.is_empty() {
                        trace!("session state change: {} bytes", ok.session_state_info.len());
                    }
                    ok.status_flags
                }
                Err(_) => StatusFlags::empty(),
            };
            note_status_flags(cx, status);
            status
        } else if pkt.is_err_packet() {
            cx.client.writer().flush_all().await?;
            return Ok(());
        } else if pkt.is_local_in_file_packet() {
            cx.client.writer().flush_all().await?;
            return relay_local_infile(cx).await;
        } else {
            relay_resultset(cx, shared_caps).await?
        };

        if !status_flags.contains(StatusFlags::SERVER_MORE_RESULTS_EXISTS) {
            return Ok(());
        }
    }
}

/// LOCAL INFILE: the client streams file chunks terminated by an empty
/// frame; the server then answers with Ok/Error.
async fn relay_local_infile(cx: &mut ConnectionContext) -> io::Result<()> {
    loop {
        let (seq, pkt) = cx.client.recv_msg().await?;
        let done = pkt.is_empty();
        forward_to_server(cx, seq, &pkt).await?;
        if done {
            break;
        }
    }
    let (seq, pkt) = cx.server_mut()?.channel.recv_msg().await?;
    forward_packet(cx.client.writer(), seq, &pkt, true).await?;
    if pkt.is_ok_packet() {
        if let Ok((_, ok)) = ok_packet(
            &pkt,
            cx.server
                .as_ref()
                .map(|s| s.state.shared_capabilities())
                .unwrap_or_default(),
        ) {
            note_status_flags(cx, ok.status_flags);
        }
    }
    Ok(())
}

/// Forwards a result set until its terminating Eof/Ok, returning the final
/// status flags. With the legacy Eof framing, the column-definition Eof
/// comes first; a cursor parks the rows on the server and ends the
/// response there.
async fn relay_resultset(
    cx: &mut ConnectionContext,
    shared_caps: CapabilityFlags,
) -> io::Result<StatusFlags> {
    let deprecate_eof = shared_caps.contains(CapabilityFlags::CLIENT_DEPRECATE_EOF);
    if !deprecate_eof {
        loop {
            let (seq, pkt) = cx.server_mut()?.channel.recv_msg().await?;
            forward_packet(cx.client.writer(), seq, &pkt, false).await?;
            if pkt.is_err_packet() {
                cx.client.writer().flush_all().await?;
                return Ok(StatusFlags::empty());
            }
            if pkt.is_eof_packet() {
                let status = eof_server_status(&pkt)
                    .map(|(_, s)| s)
                    .unwrap_or_default();
                if status.contains(StatusFlags::SERVER_STATUS_CURSOR_EXISTS) {
                    cx.client.writer().flush_all().await?;
                    note_status_flags(cx, status);
                    return Ok(status);
                }
                break;
            }
        }
    }
    relay_until_result_end(cx, shared_caps).await
}

/// Forwards rows until the closing Eof (legacy) or the 0xfe-headed Ok
/// (CLIENT_DEPRECATE_EOF).
async fn relay_until_result_end(
    cx: &mut ConnectionContext,
    shared_caps: CapabilityFlags,
) -> io::Result<StatusFlags> {
    let deprecate_eof = shared_caps.contains(CapabilityFlags::CLIENT_DEPRECATE_EOF);
    loop {
        let (seq, pkt) = cx.server_mut()?.channel.recv_msg().await?;
        forward_packet(cx.client.writer(), seq, &pkt, false).await?;

        if pkt.is_err_packet() {
            cx.client.writer().flush_all().await?;
            return Ok(StatusFlags::empty());
        }
        if !deprecate_eof {
            if pkt.is_eof_packet() {
                cx.client.writer().flush_all().await?;
                let status = eof_server_status(&pkt)
                    .map(|(_, s)| s)
                    .unwrap_or_default();
                note_status_flags(cx, status);
                return Ok(status);
            }
        } else if pkt.is_result_set_eof_packet() {
            cx.client.writer().flush_all().await?;
            let status = match ok_packet(&pkt, shared_caps) {
                Ok((_, ok)) => ok.status_flags,
                Err(_) => StatusFlags::empty(),
            };
            note_status_flags(cx, status);
            return Ok(status);
        }
    }
}

/// COM_STMT_PREPARE response: prepare-ok, then parameter and column
/// definitions (with Eof separators unless deprecated).
async fn relay_prepare_response(cx: &mut ConnectionContext) -> io::Result<()> {
    let shared_caps = cx
        .server
        .as_ref()
        .map(|s| s.state.shared_capabilities())
        .unwrap_or_default();
    let deprecate_eof = shared_caps.contains(CapabilityFlags::CLIENT_DEPRECATE_EOF);

    let (seq, pkt) = cx.server_mut()?.channel.recv_msg().await?;
    forward_packet(cx.client.writer(), seq, &pkt, false).await?;
    if pkt.is_err_packet() {
        cx.client.writer().flush_all().await?;
        return Ok(());
    }
    if pkt.len() < 12 {
        cx.client.writer().flush_all().await?;
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "short COM_STMT_PREPARE response",
        ));
    }
    let stmt_id = LittleEndian::read_u32(&pkt[1..5]);
    let num_columns = LittleEndian::read_u16(&pkt[5..7]);
    let num_params = LittleEndian::read_u16(&pkt[7..9]);
    cx.client_state.prepared_statements.insert(
        stmt_id,
        PreparedStatement {
            num_params,
            num_columns,
        },
    );

    for count in [num_params, num_columns] {
        if count == 0 {
            continue;
        }
        for _ in 0..count {
            let (seq, pkt) = cx.server_mut()?.channel.recv_msg().await?;
            forward_packet(cx.client.writer(), seq, &pkt, false).await?;
        }
        if !deprecate_eof {
            let (seq, pkt) = cx.server_mut()?.channel.recv_msg().await?;
            forward_packet(cx.client.writer(), seq, &pkt, false).await?;
        }
    }
    cx.client.writer().flush_all().await
}

/// Between commands, a sharable connection is stashed so other sessions may
/// pick it up after the sharing delay.
fn maybe_stash_server(cx: &mut ConnectionContext) {
    if !cx.route.connection_sharing {
        return;
    }
    let Some(server) = cx.server.as_ref() else {
        return;
    };
    if !server.authenticated {
        return;
    }
    // without the captured password a re-attach would need the client's
    // help mid-command; such a session keeps its connection.
    if cx.client_state.password_plain().is_none() {
        return;
    }
    // a session in a transaction (or with rows parked on a cursor) owns its
    // connection outright.
    if cx
        .client_state
        .status_flags
        .intersects(StatusFlags::SERVER_STATUS_IN_TRANS | StatusFlags::SERVER_STATUS_CURSOR_EXISTS)
    {
        return;
    }
    if !cx.client_state.prepared_statements.is_empty() {
        return;
    }
    let server = cx.server.take().expect("checked above");
    trace!("stashing {} for {}", server.id, cx.conn_id);
    cx.stashed_endpoint = Some(server.endpoint.clone());
    cx.pool
        .stash(server, &cx.conn_id, cx.route.connection_sharing_delay);
}

/// Client is gone: stashed connections return to the pool, an attached one
/// is pooled (sharing) or closed.
fn release_server(cx: &mut ConnectionContext) {
    cx.pool.discard_all_stashed(&cx.conn_id);
    if let Some(server) = cx.server.take() {
        if cx.route.connection_sharing && server.authenticated {
            cx.pool.add(server);
        } else {
            async_close_connection(server);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{Processor, ProcessorResult};
    use async_trait::async_trait;
    use common::config::Config;

    fn test_route() -> Arc<RouteConfig> {
        let mut config = Config::new();
        config
            .read_str(
                "[routing:test]\nbind_port = 6446\ndestinations = 127.0.0.1:3306\nclient_ssl_mode = DISABLED\nserver_ssl_mode = DISABLED\n",
            )
            .unwrap();
        let section = config.sections().next().unwrap();
        Arc::new(RouteConfig::from_section(&section).unwrap())
    }

    fn test_cx() -> (ConnectionContext, tokio::io::DuplexStream) {
        let route = test_route();
        let (client, peer) = tokio::io::duplex(4096);
        let pool = Arc::new(ConnectionPool::new(4, std::time::Duration::from_secs(60)));
        let destinations = Arc::new(Destinations::new(
            &route.destinations,
            route.routing_strategy,
        ));
        (
            ConnectionContext::new(
                "cx-test".to_string(),
                route,
                pool,
                destinations,
                Channel::new(Box::new(client)),
                false,
            ),
            peer,
        )
    }

    struct Countdown {
        remaining: u32,
    }

    #[async_trait]
    impl Processor for Countdown {
        fn name(&self) -> &'static str {
            "countdown"
        }

        async fn process(&mut self, _cx: &mut ConnectionContext) -> io::Result<ProcessorResult> {
            if self.remaining == 0 {
                return Ok(ProcessorResult::Done);
            }
            self.remaining -= 1;
            Ok(ProcessorResult::Again)
        }
    }

    struct Parent {
        pushed: bool,
        child_failure: Option<String>,
    }

    struct FailingChild;

    #[async_trait]
    impl Processor for FailingChild {
        fn name(&self) -> &'static str {
            "failing-child"
        }

        async fn process(&mut self, _cx: &mut ConnectionContext) -> io::Result<ProcessorResult> {
            Err(io::Error::new(io::ErrorKind::Other, "child broke"))
        }
    }

    #[async_trait]
    impl Processor for Parent {
        fn name(&self) -> &'static str {
            "parent"
        }

        async fn process(&mut self, cx: &mut ConnectionContext) -> io::Result<ProcessorResult> {
            if !self.pushed {
                self.pushed = true;
                cx.push_processor(Box::new(FailingChild));
                return Ok(ProcessorResult::Again);
            }
            self.child_failure = cx.take_failure().map(|e| e.to_string());
            Ok(ProcessorResult::Done)
        }
    }

    #[tokio::test]
    async fn stack_pops_on_done() {
        let (mut cx, _peer) = test_cx();
        run_stack(&mut cx, vec![Box::new(Countdown { remaining: 3 })])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn child_failure_reaches_parent() {
        let (mut cx, _peer) = test_cx();
        run_stack(
            &mut cx,
            vec![Box::new(Parent {
                pushed: false,
                child_failure: None,
            })],
        )
        .await
        .unwrap();
        // the parent consumed the failure, so the stack result is Ok.
        assert!(cx.take_failure().is_none());
    }

    #[tokio::test]
    async fn top_level_failure_is_returned() {
        let (mut cx, _peer) = test_cx();
        let err = run_stack(&mut cx, vec![Box::new(FailingChild)])
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "child broke");
    }

    mod round_trip {
        use super::*;
        use crate::auth::mysql_native_password_scramble;
        use crate::destinations::{DestinationsConfig, Endpoint};
        use crate::greeting::client_greetor::ClientGreetor;
        use crate::protocol::mysql::basic::{
            client_handshake_response, server_greeting, HandshakeResponse, ServerGreeting,
        };
        use crate::protocol::mysql::packet::packet_reader::PacketReader;
        use crate::protocol::mysql::packet::packet_writer::PacketWriter;
        use crate::protocol::mysql::packet::writers::{
            write_auth_switch_request, write_ok_packet, write_server_greeting,
        };
        use crate::protocol::mysql::basic::OkPacket;
        use mysql_common::constants::CapabilityFlags;
        use std::io::Write as _;

        const SERVER_NONCE_1: &[u8; 20] = b"01234567890123456789";
        const SERVER_NONCE_2: &[u8; 20] = b"98765432109876543210";

        async fn fake_server(listener: tokio::net::TcpListener) {
            let (stream, _) = listener.accept().await.unwrap();
            let (r, w) = stream.into_split();
            let mut reader = PacketReader::new(r);
            let mut writer = PacketWriter::new(w);

            let caps = CapabilityFlags::CLIENT_PROTOCOL_41
                | CapabilityFlags::CLIENT_SECURE_CONNECTION
                | CapabilityFlags::CLIENT_PLUGIN_AUTH
                | CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
                | CapabilityFlags::CLIENT_CONNECT_ATTRS
                | CapabilityFlags::CLIENT_TRANSACTIONS;
            let greeting = ServerGreeting {
                protocol_version: 10,
                version: b"8.4.0".to_vec(),
                connection_id: 7,
                capabilities: caps,
                collation: 33,
                status_flags: StatusFlags::SERVER_STATUS_AUTOCOMMIT,
                auth_method_data: SERVER_NONCE_1.to_vec(),
                auth_method_name: b"mysql_native_password".to_vec(),
            };
            writer.reset_seq();
            write_server_greeting(&mut writer, &greeting).await.unwrap();

            // the router's curated greeting: our caps masked, and a forced
            // method switch because the password is unknown to it.
            let (seq, pkt) = reader.next_async().await.unwrap().unwrap();
            assert_eq!(seq, 1);
            let (_, response) = client_handshake_response(&pkt, true).unwrap();
            assert_eq!(response.username.as_deref(), Some(&b"app"[..]));
            assert_eq!(response.auth_plugin, b"switch_me_if_you_can");
            assert!(!response.client_flag.contains(CapabilityFlags::CLIENT_SSL));
            assert!(!response
                .client_flag
                .contains(CapabilityFlags::CLIENT_COMPRESS));

            writer.set_seq(2);
            write_auth_switch_request(&mut writer, b"mysql_native_password", SERVER_NONCE_2)
                .await
                .unwrap();

            let (seq, scramble) = reader.next_async().await.unwrap().unwrap();
            assert_eq!(seq, 3);
            assert_eq!(
                &*scramble,
                mysql_native_password_scramble(SERVER_NONCE_2, b"pass").as_slice()
            );

            writer.set_seq(4);
            write_ok_packet(
                &mut writer,
                caps,
                OkPacket {
                    status_flags: StatusFlags::SERVER_STATUS_AUTOCOMMIT,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

            // one command round-trip.
            let (seq, cmd) = reader.next_async().await.unwrap().unwrap();
            assert_eq!(seq, 0);
            assert_eq!(cmd[0], CommandCode::ComPing as u8);
            writer.set_seq(1);
            write_ok_packet(
                &mut writer,
                caps,
                OkPacket {
                    status_flags: StatusFlags::SERVER_STATUS_AUTOCOMMIT,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

            // quit (or close) ends the session.
            let _ = reader.next_async().await;
        }

        #[tokio::test]
        async fn plain_round_trip_both_legs_plaintext() {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let server = tokio::spawn(fake_server(listener));

            let route = test_route();
            let destinations = Arc::new(Destinations::new(
                &DestinationsConfig::Static(vec![Endpoint::Tcp {
                    host: "127.0.0.1".into(),
                    port,
                }]),
                route.routing_strategy,
            ));
            let (client_side, peer) = tokio::io::duplex(16384);
            let mut cx = ConnectionContext::new(
                "cx-e2e".to_string(),
                route,
                Arc::new(ConnectionPool::new(4, std::time::Duration::from_secs(60))),
                destinations,
                Channel::new(Box::new(client_side)),
                false,
            );

            let driver = tokio::spawn(async move {
                run_stack(&mut cx, vec![Box::new(ClientGreetor::new())]).await?;
                command_phase(&mut cx).await
            });

            let (peer_r, peer_w) = tokio::io::split(peer);
            let mut reader = PacketReader::new(peer_r);
            let mut writer = PacketWriter::new(peer_w);

            // router greeting.
            let (seq, pkt) = reader.next_async().await.unwrap().unwrap();
            assert_eq!(seq, 0);
            let (_, greeting) = server_greeting(&pkt).unwrap();
            assert!(greeting.version.ends_with(b"-router"));

            // client greeting with caching-sha2 auth data for the router's
            // nonce.
            let caps = CapabilityFlags::CLIENT_PROTOCOL_41
                | CapabilityFlags::CLIENT_SECURE_CONNECTION
                | CapabilityFlags::CLIENT_PLUGIN_AUTH
                | CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
                | CapabilityFlags::CLIENT_TRANSACTIONS;
            let response = HandshakeResponse {
                client_flag: caps,
                max_packet_len: 1 << 24,
                collation: 33,
                username: Some(b"app".to_vec()),
                auth_response: vec![0xab; 32],
                auth_plugin: b"caching_sha2_password".to_vec(),
                database: None,
                connect_attributes: None,
            };
            writer.set_seq(1);
            writer.write_all(&response.encode(caps)).unwrap();
            writer.end_packet().await.unwrap();
            writer.flush_all().await.unwrap();

            // the server's method switch arrives with the *server's* nonce.
            let (seq, switch) = reader.next_async().await.unwrap().unwrap();
            assert_eq!(seq, 2);
            assert_eq!(switch[0], 0xfe);
            let (_, (method, nonce)) =
                crate::protocol::mysql::basic::auth_switch_request(&switch).unwrap();
            assert_eq!(method, b"mysql_native_password");
            assert_eq!(nonce, SERVER_NONCE_2.to_vec());

            writer.set_seq(3);
            writer
                .write_all(&mysql_native_password_scramble(&nonce, b"pass"))
                .unwrap();
            writer.end_packet().await.unwrap();
            writer.flush_all().await.unwrap();

            // the backend's Ok is forwarded, status flags intact.
            let (seq, ok) = reader.next_async().await.unwrap().unwrap();
            assert_eq!(seq, 4);
            assert!(ok.is_ok_packet());
            let (_, ok) = ok_packet(&ok, caps).unwrap();
            assert!(ok
                .status_flags
                .contains(StatusFlags::SERVER_STATUS_AUTOCOMMIT));

            // ping through the router.
            writer.set_seq(0);
            writer.write_all(&[CommandCode::ComPing as u8]).unwrap();
            writer.end_packet().await.unwrap();
            writer.flush_all().await.unwrap();
            let (seq, pong) = reader.next_async().await.unwrap().unwrap();
            assert_eq!(seq, 1);
            assert!(pong.is_ok_packet());

            // quit.
            writer.set_seq(0);
            writer.write_all(&[CommandCode::ComQuit as u8]).unwrap();
            writer.end_packet().await.unwrap();
            writer.flush_all().await.unwrap();

            driver.await.unwrap().unwrap();
            server.await.unwrap();
        }
    }
}
