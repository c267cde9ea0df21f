//! Client-side greeting state machine: router-issued server greeting,
//! client greeting (optionally after a TLS accept), plaintext-password
//! capture, and hand-off to the connector.

use crate::auth::gen_nonce;
use crate::config::ClientSslMode;
use crate::connection::ConnectionContext;
use crate::connector::LazyConnector;
use crate::greeting::server_greetor::PassthroughConnector;
use crate::processor::{Processor, ProcessorResult};
use crate::protocol::mysql::basic::{client_handshake_response, HandshakeResponse, ServerGreeting};
use crate::protocol::mysql::constants::{
    router_capabilities, AuthPluginName, CACHING_SHA2_FULL_AUTH_REQUESTED, PROTOCOL_VERSION,
    ROUTER_VERSION,
};
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::packet::writers::{
    write_auth_more_data, write_err_packet, write_ok_packet, write_server_greeting,
};
use crate::protocol::mysql::basic::OkPacket;

use async_trait::async_trait;
use mysql_common::constants::{CapabilityFlags, StatusFlags};
use std::io;
use tracing::{debug, warn};

enum Stage {
    Init,
    ServerGreetingSent,
    ClientGreeting,
    TlsAccept,
    ClientGreetingAfterTls,
    RequestPlaintextPassword,
    PlaintextPassword,
    Accepted,
    Authenticated,
}

pub struct ClientGreetor {
    stage: Stage,
}

impl ClientGreetor {
    pub fn new() -> Self {
        Self { stage: Stage::Init }
    }

    /// The advertised capability set: the curated subset, plus `ssl` unless
    /// client_ssl_mode is DISABLED.
    fn advertised_caps(cx: &ConnectionContext) -> CapabilityFlags {
        let mut caps = router_capabilities();
        if cx.route.client_ssl_mode != ClientSslMode::Disabled {
            caps |= CapabilityFlags::CLIENT_SSL;
        }
        caps
    }

    async fn send_error(
        cx: &mut ConnectionContext,
        kind: ErrorKind,
        msg: &str,
    ) -> io::Result<()> {
        let seq = cx.client_last_seq.wrapping_add(1);
        cx.client.writer().set_seq(seq);
        write_err_packet(kind, msg.as_bytes(), cx.client.writer()).await
    }

    /// Shared checks once the full client greeting is on hand.
    async fn handle_client_greeting(
        &mut self,
        cx: &mut ConnectionContext,
        response: HandshakeResponse,
    ) -> io::Result<ProcessorResult> {
        let shared = cx.client_state.shared_capabilities();

        // compression is never advertised; a client that insists gets a
        // proper refusal instead of a protocol mismatch later.
        if response
            .client_flag
            .intersects(
                CapabilityFlags::CLIENT_COMPRESS
                    | CapabilityFlags::CLIENT_ZSTD_COMPRESSION_ALGORITHM,
            )
            && !shared.intersects(
                CapabilityFlags::CLIENT_COMPRESS
                    | CapabilityFlags::CLIENT_ZSTD_COMPRESSION_ALGORITHM,
            )
        {
            Self::send_error(
                cx,
                ErrorKind::ER_WRONG_COMPRESSION_ALGORITHM_CLIENT,
                "Compression algorithms are not supported",
            )
            .await?;
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "client requires compression",
            ));
        }

        if !response.auth_plugin.is_empty()
            && !AuthPluginName::is_supported(&response.auth_plugin)
        {
            let plugin = String::from_utf8_lossy(&response.auth_plugin).to_string();
            Self::send_error(
                cx,
                ErrorKind::CR_AUTH_PLUGIN_CANNOT_LOAD,
                &format!("Authentication plugin '{plugin}' cannot be loaded"),
            )
            .await?;
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("unsupported auth method {plugin}"),
            ));
        }

        cx.client_state.username = response.username.clone();
        cx.client_state.schema = response.database.clone();
        cx.client_state.collation = response.collation;
        cx.client_state.max_packet_len = response.max_packet_len;
        cx.client_state.attributes = response.connect_attributes.clone();
        if !response.auth_plugin.is_empty() {
            cx.client_state.auth_method_name = response.auth_plugin.clone();
        }

        // empty auth-method-data (or the single NUL) is an empty password
        // and skips the plaintext-capture exchange.
        if response.auth_response.is_empty() || response.auth_response == [0x00] {
            cx.client_state.set_password_plain(Vec::new());
            self.stage = Stage::Accepted;
            return Ok(ProcessorResult::Again);
        }

        let is_caching_sha2 = cx.client_state.auth_method_name
            == AuthPluginName::AuthCachingSha2Password.as_ref().as_bytes();
        if is_caching_sha2 && cx.client_transport_is_secure() {
            // request-full-auth; the client answers with the plaintext
            // password since its transport is secure.
            cx.client_state
                .set_password_scrambled(response.auth_response.clone());
            let seq = cx.client_last_seq.wrapping_add(1);
            cx.client.writer().set_seq(seq);
            write_auth_more_data(cx.client.writer(), &[CACHING_SHA2_FULL_AUTH_REQUESTED])
                .await?;
            self.stage = Stage::RequestPlaintextPassword;
            return Ok(ProcessorResult::SendToClient);
        }

        cx.client_state
            .set_password_scrambled(response.auth_response.clone());
        self.stage = Stage::Accepted;
        Ok(ProcessorResult::Again)
    }
}

impl Default for ClientGreetor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Processor for ClientGreetor {
    fn name(&self) -> &'static str {
        "client-greetor"
    }

    async fn process(&mut self, cx: &mut ConnectionContext) -> io::Result<ProcessorResult> {
        match self.stage {
            Stage::Init => {
                if !cx.route.greeting_from_router() {
                    // PASSTHROUGH: the backend speaks first and the router
                    // only relays.
                    cx.push_processor(Box::new(PassthroughConnector::new()));
                    self.stage = Stage::Authenticated;
                    return Ok(ProcessorResult::Again);
                }

                let caps = Self::advertised_caps(cx);
                let nonce = gen_nonce();
                cx.client_state.server_capabilities = caps;
                cx.client_state.auth_method_name = AuthPluginName::AuthCachingSha2Password
                    .as_ref()
                    .as_bytes()
                    .to_vec();
                cx.client_state.auth_method_data = nonce.to_vec();

                let greeting = ServerGreeting {
                    protocol_version: PROTOCOL_VERSION,
                    version: ROUTER_VERSION.as_bytes().to_vec(),
                    connection_id: rand::random::<u32>() | 1,
                    capabilities: caps,
                    collation: crate::protocol::mysql::charset::DEFAULT_COLLATION_ID,
                    status_flags: StatusFlags::SERVER_STATUS_AUTOCOMMIT,
                    auth_method_data: nonce.to_vec(),
                    auth_method_name: cx.client_state.auth_method_name.clone(),
                };
                cx.client.writer().reset_seq();
                write_server_greeting(cx.client.writer(), &greeting).await?;
                self.stage = Stage::ServerGreetingSent;
                Ok(ProcessorResult::SendToClient)
            }
            Stage::ServerGreetingSent => {
                self.stage = Stage::ClientGreeting;
                Ok(ProcessorResult::RecvFromClient)
            }
            Stage::ClientGreeting => {
                let (seq, pkt) = cx.take_client_msg()?;
                // the client greeting answers the seq-0 greeting.
                if seq != 1 {
                    Self::send_error(
                        cx,
                        ErrorKind::ER_NET_PACKETS_OUT_OF_ORDER,
                        "Got packets out of order",
                    )
                    .await?;
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("client greeting must have seq-id 1, got {seq}"),
                    ));
                }
                let (_, response) = client_handshake_response(&pkt, false).map_err(|e| {
                    io::Error::new(io::ErrorKind::InvalidData, format!("{e:?}"))
                })?;
                cx.client_state.client_capabilities = response.client_flag;

                if response.is_ssl_request() {
                    if cx.route.client_ssl_mode == ClientSslMode::Disabled {
                        Self::send_error(
                            cx,
                            ErrorKind::CR_SSL_CONNECTION_ERROR,
                            "SSL connection error: SSL is not supported by the router",
                        )
                        .await?;
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "client requested TLS on a DISABLED route",
                        ));
                    }
                    self.stage = Stage::TlsAccept;
                    return Ok(ProcessorResult::Again);
                }

                if cx.route.client_ssl_mode == ClientSslMode::Required {
                    Self::send_error(
                        cx,
                        ErrorKind::CR_SSL_CONNECTION_ERROR,
                        "SSL connection error: SSL is required from client",
                    )
                    .await?;
                    return Err(io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        "client_ssl_mode=REQUIRED but client did not request TLS",
                    ));
                }

                self.handle_client_greeting(cx, response).await
            }
            Stage::TlsAccept => {
                #[cfg(feature = "tls")]
                {
                    let acceptor = cx.tls_acceptor.clone().ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::InvalidInput,
                            "TLS requested but no acceptor configured",
                        )
                    })?;
                    cx.client.tls_accept(&acceptor).await?;
                    debug!("client TLS established: {:?}", cx.client.tls_info());
                    self.stage = Stage::ClientGreetingAfterTls;
                    Ok(ProcessorResult::RecvFromClient)
                }
                #[cfg(not(feature = "tls"))]
                {
                    Err(io::Error::new(
                        io::ErrorKind::Unsupported,
                        "TLS support is not compiled in",
                    ))
                }
            }
            Stage::ClientGreetingAfterTls => {
                let (_seq, pkt) = cx.take_client_msg()?;
                let (_, response) = client_handshake_response(&pkt, true).map_err(|e| {
                    io::Error::new(io::ErrorKind::InvalidData, format!("{e:?}"))
                })?;
                cx.client_state.client_capabilities = response.client_flag;
                self.handle_client_greeting(cx, response).await
            }
            Stage::RequestPlaintextPassword => {
                self.stage = Stage::PlaintextPassword;
                Ok(ProcessorResult::RecvFromClient)
            }
            Stage::PlaintextPassword => {
                let (_seq, pkt) = cx.take_client_msg()?;
                let mut password = pkt.to_vec();
                if password.last() == Some(&0) {
                    password.pop();
                }
                cx.client_state.set_password_plain(password);
                self.stage = Stage::Accepted;
                Ok(ProcessorResult::Again)
            }
            Stage::Accepted => {
                cx.push_processor(Box::new(LazyConnector::new()));
                self.stage = Stage::Authenticated;
                Ok(ProcessorResult::Again)
            }
            Stage::Authenticated => {
                if let Some(failure) = cx.take_failure() {
                    if let Some(err_pkt) = cx.auth_error.take() {
                        // surface the backend's own error to the client.
                        let seq = cx.client_last_seq.wrapping_add(1);
                        let writer = cx.client.writer();
                        writer.set_seq(seq);
                        std::io::Write::write_all(writer, &err_pkt)?;
                        writer.end_packet().await?;
                        writer.flush_all().await?;
                    } else {
                        warn!("connector failed without a server error: {failure}");
                        Self::send_error(
                            cx,
                            ErrorKind::CR_SERVER_LOST,
                            &format!("Error connecting to the backend: {failure}"),
                        )
                        .await?;
                    }
                    return Err(failure);
                }

                if cx.passthrough_relay {
                    return Ok(ProcessorResult::Done);
                }

                if !cx.authenticated() {
                    if let Some(err_pkt) = cx.auth_error.take() {
                        let seq = cx.client_last_seq.wrapping_add(1);
                        let writer = cx.client.writer();
                        writer.set_seq(seq);
                        std::io::Write::write_all(writer, &err_pkt)?;
                        writer.end_packet().await?;
                        writer.flush_all().await?;
                    }
                    return Err(io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        "backend authentication failed",
                    ));
                }

                if !cx.server_ok_forwarded {
                    let status_flags = cx
                        .server
                        .as_ref()
                        .map(|s| s.state.status_flags)
                        .unwrap_or(StatusFlags::SERVER_STATUS_AUTOCOMMIT);
                    let seq = cx.client_last_seq.wrapping_add(1);
                    cx.client.writer().set_seq(seq);
                    write_ok_packet(
                        cx.client.writer(),
                        cx.client_state.shared_capabilities(),
                        OkPacket {
                            status_flags,
                            ..Default::default()
                        },
                    )
                    .await?;
                }
                Ok(ProcessorResult::Done)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::connection::run_stack;
    use crate::destinations::Destinations;
    use crate::pool::ConnectionPool;
    use crate::protocol::mysql::basic::server_greeting;
    use crate::protocol::mysql::packet::packet_reader::PacketReader;
    use crate::protocol::mysql::packet::packet_writer::PacketWriter;
    use common::config::Config;
    use std::io::Write;
    use std::sync::Arc;

    fn route(text: &str) -> Arc<crate::config::RouteConfig> {
        let mut config = Config::new();
        config.read_str(text).unwrap();
        let section = config.sections().next().unwrap();
        Arc::new(crate::config::RouteConfig::from_section(&section).unwrap())
    }

    fn plaintext_cx() -> (ConnectionContext, tokio::io::DuplexStream) {
        let route = route(
            "[routing:test]\nbind_port = 6446\ndestinations = 127.0.0.1:3306\nclient_ssl_mode = DISABLED\nserver_ssl_mode = DISABLED\n",
        );
        let (client, peer) = tokio::io::duplex(16384);
        let destinations = Arc::new(Destinations::new(
            &route.destinations,
            route.routing_strategy,
        ));
        (
            ConnectionContext::new(
                "cx-test".to_string(),
                route,
                Arc::new(ConnectionPool::new(4, std::time::Duration::from_secs(60))),
                destinations,
                Channel::new(Box::new(client)),
                false,
            ),
            peer,
        )
    }

    #[tokio::test]
    async fn synthesised_greeting_shape() {
        let (mut cx, peer) = plaintext_cx();
        let (peer_r, _peer_w) = tokio::io::split(peer);
        let mut greetor = ClientGreetor::new();
        let result = greetor.process(&mut cx).await.unwrap();
        assert_eq!(result, ProcessorResult::SendToClient);
        cx.client.writer().flush_all().await.unwrap();

        let mut reader = PacketReader::new(peer_r);
        let (seq, pkt) = reader.next_async().await.unwrap().unwrap();
        assert_eq!(seq, 0);
        let (_, greeting) = server_greeting(&pkt).unwrap();
        assert_eq!(greeting.protocol_version, 10);
        assert!(greeting.version.ends_with(b"-router"));
        assert_eq!(greeting.auth_method_name, b"caching_sha2_password");
        assert_eq!(greeting.auth_method_data.len(), 20);
        assert!(greeting
            .auth_method_data
            .iter()
            .all(|&b| (1..=127).contains(&b)));
        // no ssl bit on a DISABLED route, and never compression.
        assert!(!greeting.capabilities.contains(CapabilityFlags::CLIENT_SSL));
        assert!(!greeting
            .capabilities
            .contains(CapabilityFlags::CLIENT_COMPRESS));
    }

    #[tokio::test]
    async fn client_greeting_with_wrong_seq_is_rejected() {
        let (mut cx, peer) = plaintext_cx();
        let (peer_r, peer_w) = tokio::io::split(peer);

        let client = tokio::spawn(async move {
            let mut reader = PacketReader::new(peer_r);
            let mut writer = PacketWriter::new(peer_w);
            let _greeting = reader.next_async().await.unwrap().unwrap();

            let caps = CapabilityFlags::CLIENT_PROTOCOL_41
                | CapabilityFlags::CLIENT_SECURE_CONNECTION
                | CapabilityFlags::CLIENT_PLUGIN_AUTH;
            let response = HandshakeResponse {
                client_flag: caps,
                max_packet_len: 1 << 24,
                collation: 33,
                username: Some(b"app".to_vec()),
                auth_response: vec![0xaa; 32],
                auth_plugin: b"caching_sha2_password".to_vec(),
                database: None,
                connect_attributes: None,
            };
            writer.set_seq(5); // wrong: must be 1
            writer.write_all(&response.encode(caps)).unwrap();
            writer.end_packet().await.unwrap();
            writer.flush_all().await.unwrap();

            // expect an error packet back.
            let (_, err) = reader.next_async().await.unwrap().unwrap();
            assert!(err.is_err_packet());
            let code = u16::from_le_bytes([err[1], err[2]]);
            assert_eq!(code, ErrorKind::ER_NET_PACKETS_OUT_OF_ORDER as u16);
        });

        let err = run_stack(&mut cx, vec![Box::new(ClientGreetor::new())])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("seq-id 1"));
        client.await.unwrap();
    }

    #[tokio::test]
    async fn compression_is_refused() {
        let (mut cx, peer) = plaintext_cx();
        let (peer_r, peer_w) = tokio::io::split(peer);

        let client = tokio::spawn(async move {
            let mut reader = PacketReader::new(peer_r);
            let mut writer = PacketWriter::new(peer_w);
            let _greeting = reader.next_async().await.unwrap().unwrap();

            let caps = CapabilityFlags::CLIENT_PROTOCOL_41
                | CapabilityFlags::CLIENT_SECURE_CONNECTION
                | CapabilityFlags::CLIENT_PLUGIN_AUTH
                | CapabilityFlags::CLIENT_COMPRESS;
            let response = HandshakeResponse {
                client_flag: caps,
                max_packet_len: 1 << 24,
                collation: 33,
                username: Some(b"app".to_vec()),
                auth_response: vec![0xaa; 32],
                auth_plugin: b"caching_sha2_password".to_vec(),
                database: None,
                connect_attributes: None,
            };
            writer.set_seq(1);
            writer.write_all(&response.encode(caps)).unwrap();
            writer.end_packet().await.unwrap();
            writer.flush_all().await.unwrap();

            let (_, err) = reader.next_async().await.unwrap().unwrap();
            assert!(err.is_err_packet());
            let code = u16::from_le_bytes([err[1], err[2]]);
            assert_eq!(
                code,
                ErrorKind::ER_WRONG_COMPRESSION_ALGORITHM_CLIENT as u16
            );
        });

        let err = run_stack(&mut cx, vec![Box::new(ClientGreetor::new())])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("compression"));
        client.await.unwrap();
    }

    #[tokio::test]
    async fn plaintext_password_is_captured_over_secure_transport() {
        // a UNIX-socket-like client: secure without TLS. the backend is a
        // closed port, so the flow ends at the connector, after capture.
        let route = route(
            "[routing:test]\nbind_port = 6446\ndestinations = 127.0.0.1:1\nclient_ssl_mode = DISABLED\nserver_ssl_mode = DISABLED\n",
        );
        let (client, peer) = tokio::io::duplex(16384);
        let destinations = Arc::new(Destinations::new(
            &route.destinations,
            route.routing_strategy,
        ));
        let mut cx = ConnectionContext::new(
            "cx-test".to_string(),
            route,
            Arc::new(ConnectionPool::new(4, std::time::Duration::from_secs(60))),
            destinations,
            Channel::new(Box::new(client)),
            true,
        );

        let (peer_r, peer_w) = tokio::io::split(peer);
        let client_task = tokio::spawn(async move {
            let mut reader = PacketReader::new(peer_r);
            let mut writer = PacketWriter::new(peer_w);
            let _greeting = reader.next_async().await.unwrap().unwrap();

            let caps = CapabilityFlags::CLIENT_PROTOCOL_41
                | CapabilityFlags::CLIENT_SECURE_CONNECTION
                | CapabilityFlags::CLIENT_PLUGIN_AUTH
                | CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA;
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

            // request-full-auth arrives as AuthMoreData 0x04.
            let (seq, more) = reader.next_async().await.unwrap().unwrap();
            assert_eq!(seq, 2);
            assert_eq!(&*more, &[0x01, 0x04]);

            writer.set_seq(3);
            writer.write_all(b"topsecret\0").unwrap();
            writer.end_packet().await.unwrap();
            writer.flush_all().await.unwrap();

            // the backend is unreachable; an error comes back.
            let (_, err) = reader.next_async().await.unwrap().unwrap();
            assert!(err.is_err_packet());
        });

        let _err = run_stack(&mut cx, vec![Box::new(ClientGreetor::new())])
            .await
            .unwrap_err();
        assert_eq!(cx.client_state.password_plain(), Some(&b"topsecret"[..]));
        client_task.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_auth_plugin_is_refused() {
        let (mut cx, peer) = plaintext_cx();
        let (peer_r, peer_w) = tokio::io::split(peer);

        let client = tokio::spawn(async move {
            let mut reader = PacketReader::new(peer_r);
            let mut writer = PacketWriter::new(peer_w);
            let _greeting = reader.next_async().await.unwrap().unwrap();

            let caps = CapabilityFlags::CLIENT_PROTOCOL_41
                | CapabilityFlags::CLIENT_SECURE_CONNECTION
                | CapabilityFlags::CLIENT_PLUGIN_AUTH;
            let response = HandshakeResponse {
                client_flag: caps,
                max_packet_len: 1 << 24,
                collation: 33,
                username: Some(b"app".to_vec()),
                auth_response: vec![0xaa; 8],
                auth_plugin: b"mysql_old_password".to_vec(),
                database: None,
                connect_attributes: None,
            };
            writer.set_seq(1);
            writer.write_all(&response.encode(caps)).unwrap();
            writer.end_packet().await.unwrap();
            writer.flush_all().await.unwrap();

            let (_, err) = reader.next_async().await.unwrap().unwrap();
            assert!(err.is_err_packet());
            let code = u16::from_le_bytes([err[1], err[2]]);
            assert_eq!(code, ErrorKind::CR_AUTH_PLUGIN_CANNOT_LOAD as u16);
        });

        let err = run_stack(&mut cx, vec![Box::new(ClientGreetor::new())])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unsupported auth method"));
        client.await.unwrap();
    }
}
