//! Server-side greeting state machine: receive the backend's greeting,
//! optionally drive a TLS connect, send the router's curated client
//! greeting, then run the nested auth forwarder.

use crate::auth::forwarder::AuthForwarder;
use crate::auth::{caching_sha2_password_scramble, mysql_native_password_scramble};
use crate::config::ServerSslMode;
use crate::connection::ConnectionContext;
use crate::connector::requires_tls;
use crate::processor::{Processor, ProcessorResult};
use crate::protocol::mysql::basic::{
    server_greeting, ConnectAttributes, HandshakeResponse,
};
use crate::protocol::mysql::constants::{AuthPluginName, PROTOCOL_VERSION};
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::packet::writers::err_payload;
use crate::protocol::mysql::packet::Packet;

use async_trait::async_trait;
use mysql_common::constants::CapabilityFlags;
use std::io::{self, Write};
use tracing::{debug, trace};

/// Records a router-generated error for the client-side greetor to forward,
/// then fails the processor.
pub(crate) fn fail_connect(
    cx: &mut ConnectionContext,
    kind: ErrorKind,
    msg: &str,
) -> io::Error {
    cx.auth_error = Some(Packet::from_vec(err_payload(kind, msg)));
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

enum Stage {
    Init,
    Greeting,
    TlsConnect,
    SendGreeting,
    PushAuth,
    AwaitAuthResult,
}

pub struct ServerGreetor {
    stage: Stage,
    next_seq: u8,
}

impl ServerGreetor {
    pub fn new() -> Self {
        Self {
            stage: Stage::Init,
            next_seq: 1,
        }
    }

    /// Capabilities for the server leg: the client-leg shared set masked by
    /// what this server offers, plus the bits the router itself needs. May
    /// differ from the client leg in `ssl` and `connect_with_schema`.
    fn server_leg_caps(cx: &ConnectionContext, server_caps: CapabilityFlags) -> CapabilityFlags {
        let mut caps = cx.client_state.shared_capabilities();
        caps |= CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_SECURE_CONNECTION
            | CapabilityFlags::CLIENT_PLUGIN_AUTH
            | CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
            | CapabilityFlags::CLIENT_CONNECT_ATTRS
            | CapabilityFlags::CLIENT_SESSION_TRACK;
        caps &= server_caps;
        caps &= !CapabilityFlags::CLIENT_SSL;
        if cx.client_state.schema.is_none() {
            caps &= !CapabilityFlags::CLIENT_CONNECT_WITH_DB;
        }
        caps
    }

    /// The initial auth data of the curated greeting: a scramble when the
    /// plaintext password is known, otherwise a forced method-switch so the
    /// server reveals its nonce to the client-facing flow.
    fn initial_auth_response(cx: &mut ConnectionContext) -> (Vec<u8>, Vec<u8>) {
        let nonce = cx
            .server
            .as_ref()
            .map(|s| s.state.auth_method_data.clone())
            .unwrap_or_default();
        let server_is_tls = cx.server.as_ref().map(|s| s.is_tls()).unwrap_or(false);
        let method = cx.client_state.auth_method_name.clone();

        if let Some(password) = cx.client_state.password_plain().map(|p| p.to_vec()) {
            let data = if method == AuthPluginName::AuthNativePassword.as_ref().as_bytes() {
                mysql_native_password_scramble(&nonce, &password)
            } else if method == AuthPluginName::AuthClearPassword.as_ref().as_bytes() {
                let mut data = password.clone();
                data.push(0);
                data
            } else if method == AuthPluginName::AuthSha256Password.as_ref().as_bytes()
                && server_is_tls
            {
                let mut data = password.clone();
                data.push(0);
                data
            } else if method == AuthPluginName::AuthSha256Password.as_ref().as_bytes() {
                // over plaintext the password travels RSA-encrypted after
                // the public-key exchange.
                Vec::new()
            } else {
                caching_sha2_password_scramble(&nonce, &password)
            };
            return (method, data);
        }

        if cx.route.greeting_from_router() {
            // the client's scramble answers the router's nonce, not this
            // server's; force an auth-method-switch to re-run the exchange.
            (
                AuthPluginName::SwitchMeIfYouCan.as_ref().as_bytes().to_vec(),
                Vec::new(),
            )
        } else {
            (
                method,
                cx.client_state
                    .password_scrambled()
                    .map(|s| s.to_vec())
                    .unwrap_or_default(),
            )
        }
    }

}

/// Attributes toward the server: the client's list extended with the
/// client TLS info. A blob that does not decode is forwarded verbatim.
pub(crate) fn build_attributes(cx: &ConnectionContext) -> Option<ConnectAttributes> {
    let mut attrs = match &cx.client_state.attributes {
        Some(attrs) => {
            if attrs.verify().is_err() {
                trace!("forwarding undecodable connection attributes verbatim");
                return Some(attrs.clone());
            }
            attrs.clone()
        }
        None => ConnectAttributes::default(),
    };
    if let Some(tls_info) = cx.client.tls_info() {
        attrs.append("_client_ssl_cipher", &tls_info.cipher);
        attrs.append("_client_ssl_version", &tls_info.version);
    }
    Some(attrs)
}

impl Default for ServerGreetor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Processor for ServerGreetor {
    fn name(&self) -> &'static str {
        "server-greetor"
    }

    async fn process(&mut self, cx: &mut ConnectionContext) -> io::Result<ProcessorResult> {
        match self.stage {
            Stage::Init => {
                self.stage = Stage::Greeting;
                Ok(ProcessorResult::RecvFromServer)
            }
            Stage::Greeting => {
                let (seq, pkt) = cx.take_server_msg()?;
                if pkt.is_err_packet() {
                    // pre-handshake errors come in the legacy 3.21 layout
                    // (no sqlstate); re-encode with 08004 for the client.
                    let code = if pkt.len() >= 3 {
                        u16::from_le_bytes([pkt[1], pkt[2]])
                    } else {
                        ErrorKind::ER_HANDSHAKE_ERROR as u16
                    };
                    let msg = if pkt.len() > 3 { &pkt[3..] } else { &[][..] };
                    let mut payload = vec![0xff];
                    payload.extend_from_slice(&code.to_le_bytes());
                    payload.push(b'#');
                    payload.extend_from_slice(b"08004");
                    payload.extend_from_slice(msg);
                    cx.auth_error = Some(Packet::from_vec(payload));
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        "server refused the connection before the handshake",
                    ));
                }
                let (_, greeting) = server_greeting(&pkt).map_err(|e| {
                    io::Error::new(io::ErrorKind::InvalidData, format!("{e:?}"))
                })?;
                if greeting.protocol_version != PROTOCOL_VERSION {
                    return Err(fail_connect(
                        cx,
                        ErrorKind::ER_HANDSHAKE_ERROR,
                        &format!(
                            "unsupported protocol version {}",
                            greeting.protocol_version
                        ),
                    ));
                }
                self.next_seq = seq.wrapping_add(1);

                let server_supports_tls =
                    greeting.capabilities.contains(CapabilityFlags::CLIENT_SSL);
                {
                    let server = cx.server_mut()?;
                    server.state.server_capabilities = greeting.capabilities;
                    server.state.auth_method_name = greeting.auth_method_name.clone();
                    server.state.auth_method_data = greeting.auth_method_data.clone();
                    server.state.status_flags = greeting.status_flags;
                    server.state.server_greeting_received = true;
                }

                if cx.route.server_ssl_mode == ServerSslMode::Required && !server_supports_tls {
                    return Err(fail_connect(
                        cx,
                        ErrorKind::CR_SSL_CONNECTION_ERROR,
                        "SSL connection error: SSL is required by the router, but the server does not support it",
                    ));
                }
                // AS_CLIENT inherits the client's choice; a TLS client must
                // not silently fall back to a plaintext server leg.
                if cx.route.server_ssl_mode == ServerSslMode::AsClient
                    && cx.client.is_tls()
                    && !server_supports_tls
                {
                    return Err(fail_connect(
                        cx,
                        ErrorKind::CR_SSL_CONNECTION_ERROR,
                        "SSL connection error: the client is using SSL, but the server does not support it",
                    ));
                }

                if requires_tls(cx) && server_supports_tls {
                    // short SSLRequest, then the TLS handshake.
                    let caps = Self::server_leg_caps(cx, greeting.capabilities)
                        | CapabilityFlags::CLIENT_SSL;
                    let mut payload = Vec::new();
                    payload.extend_from_slice(&caps.bits().to_le_bytes());
                    payload.extend_from_slice(&(1u32 << 24).to_le_bytes());
                    payload.push(cx.client_state.collation as u8);
                    payload.extend_from_slice(&[0u8; 23]);

                    let server = cx.server_mut()?;
                    server.channel.writer().set_seq(seq.wrapping_add(1));
                    server.channel.writer().write_all(&payload)?;
                    server.channel.writer().end_packet().await?;
                    server.channel.writer().flush_all().await?;
                    self.stage = Stage::TlsConnect;
                    return Ok(ProcessorResult::Again);
                }

                self.stage = Stage::SendGreeting;
                Ok(ProcessorResult::Again)
            }
            Stage::TlsConnect => {
                #[cfg(feature = "tls")]
                {
                    let connector = cx.tls_connector.clone().ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::InvalidInput,
                            "server TLS required but no connector configured",
                        )
                    })?;
                    let endpoint = cx
                        .server
                        .as_ref()
                        .map(|s| s.endpoint.clone())
                        .unwrap_or_default();
                    let host = endpoint
                        .rsplit_once(':')
                        .map(|(host, _)| host.to_string())
                        .unwrap_or(endpoint);
                    let server_name = crate::tls::server_name_for(&host)?;
                    let connect_result = {
                        let server = cx.server_mut()?;
                        server.channel.tls_connect(&connector, server_name).await
                    };
                    if let Err(e) = connect_result {
                        return Err(fail_connect(
                            cx,
                            ErrorKind::CR_SSL_CONNECTION_ERROR,
                            &format!("SSL connection error: {e}"),
                        ));
                    }
                    debug!("server TLS established");
                    self.next_seq = self.next_seq.wrapping_add(1);
                    self.stage = Stage::SendGreeting;
                    Ok(ProcessorResult::Again)
                }
                #[cfg(not(feature = "tls"))]
                {
                    Err(io::Error::new(
                        io::ErrorKind::Unsupported,
                        "TLS support is not compiled in",
                    ))
                }
            }
            Stage::SendGreeting => {
                let server_caps = cx
                    .server
                    .as_ref()
                    .map(|s| s.state.server_capabilities)
                    .unwrap_or_default();
                let server_is_tls = cx.server.as_ref().map(|s| s.is_tls()).unwrap_or(false);
                let mut caps = Self::server_leg_caps(cx, server_caps);
                if server_is_tls {
                    caps |= CapabilityFlags::CLIENT_SSL;
                }

                let (auth_method, auth_response) = Self::initial_auth_response(cx);
                let response = HandshakeResponse {
                    client_flag: caps,
                    max_packet_len: cx.client_state.max_packet_len.max(1 << 24),
                    collation: cx.client_state.collation,
                    username: cx.client_state.username.clone(),
                    auth_response,
                    auth_plugin: auth_method,
                    database: cx.client_state.schema.clone(),
                    connect_attributes: build_attributes(cx),
                };
                let payload = response.encode(caps);
                {
                    let server = cx.server_mut()?;
                    server.state.client_capabilities = caps;
                    server.state.username = response.username.clone();
                    server.state.schema = response.database.clone();
                    server.state.collation = response.collation;
                    server.state.attributes = response.connect_attributes.clone();
                    server.channel.writer().set_seq(self.next_seq);
                    server.channel.writer().write_all(&payload)?;
                    server.channel.writer().end_packet().await?;
                }
                self.stage = Stage::PushAuth;
                Ok(ProcessorResult::SendToServer)
            }
            Stage::PushAuth => {
                cx.push_processor(Box::new(AuthForwarder::new()));
                self.stage = Stage::AwaitAuthResult;
                Ok(ProcessorResult::Again)
            }
            Stage::AwaitAuthResult => {
                if let Some(failure) = cx.take_failure() {
                    return Err(failure);
                }
                Ok(ProcessorResult::Done)
            }
        }
    }
}

/// PASSTHROUGH: open the backend, forward its greeting unchanged, then hand
/// the connection over to the raw relay. Both legs count as TLS without the
/// router driving any TLS logic.
pub struct PassthroughConnector {
    started: bool,
}

impl PassthroughConnector {
    pub fn new() -> Self {
        Self { started: false }
    }
}

impl Default for PassthroughConnector {
    fn default() -> Self {
        Self::new()
    }
}


#[async_trait]
impl Processor for PassthroughConnector {
    fn name(&self) -> &'static str {
        "passthrough-connector"
    }

    async fn process(&mut self, cx: &mut ConnectionContext) -> io::Result<ProcessorResult> {
        if self.started {
            return Ok(ProcessorResult::Done);
        }
        self.started = true;

        let candidates = cx.destinations.candidates();
        let deadline = std::time::Instant::now() + cx.route.connect_retry_timeout;
        let mut last_error: Option<io::Error> = None;
        for endpoint in candidates {
            if std::time::Instant::now() > deadline {
                break;
            }
            match crate::backend::ServerConnection::connect(&endpoint, cx.route.connect_timeout)
                .await
            {
                Ok(conn) => {
                    cx.server = Some(conn);
                    let (seq, greeting) = cx.recv_server().await?;
                    let writer = cx.client.writer();
                    writer.set_seq(seq);
                    writer.write_all(&greeting)?;
                    writer.end_packet().await?;
                    writer.flush_all().await?;

                    cx.client.mark_passthrough_tls();
                    if let Ok(server) = cx.server_mut() {
                        server.channel.mark_passthrough_tls();
                    }
                    cx.passthrough_relay = true;
                    return Ok(ProcessorResult::Done);
                }
                Err(e) => {
                    cx.destinations.report_failure(&endpoint);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "no destinations available")
        }))
    }
}
