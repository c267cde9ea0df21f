//! Re-authentication on an open server connection.
//!
//! The forwarder handles a client-issued COM_CHANGE_USER in the command
//! phase; the sender issues a router-synthesised ChangeUser, which also
//! backs pool reuse during the initial handshake. The router synthesises
//! its own message because the client's attribute blob has to be merged
//! with the router attributes and re-encoded.

use crate::auth::forwarder::AuthForwarder;
use crate::auth::{caching_sha2_password_scramble, mysql_native_password_scramble};
use crate::connection::ConnectionContext;
use crate::greeting::server_greetor::build_attributes;
use crate::pool::async_close_connection;
use crate::processor::{Processor, ProcessorResult};
use crate::protocol::mysql::basic::{change_user_request, ChangeUserRequest};
use crate::protocol::mysql::constants::{
    AuthPluginName, CommandCode, CACHING_SHA2_FAST_AUTH_OK,
};
use crate::protocol::mysql::packet::Packet;

use async_trait::async_trait;
use std::io::{self, Write};
use tracing::{debug, trace, warn};

/// Enables the session trackers connection sharing depends on. Failure is
/// logged, not fatal: the connection simply stays unshared.
pub async fn enable_session_trackers(cx: &mut ConnectionContext) -> io::Result<()> {
    const TRACKER_QUERY: &str = "SET @@SESSION.session_track_system_variables = '*', \
         @@SESSION.session_track_schema = ON, \
         @@SESSION.session_track_transaction_info = 'CHARACTERISTICS', \
         @@SESSION.session_track_state_change = ON";

    let server = cx.server_mut()?;
    let writer = server.channel.writer();
    writer.reset_seq();
    writer.write_all(&[CommandCode::ComQuery as u8])?;
    writer.write_all(TRACKER_QUERY.as_bytes())?;
    writer.end_packet().await?;
    writer.flush_all().await?;

    let (_seq, pkt) = server.channel.recv_msg().await?;
    if pkt.is_err_packet() {
        warn!("enabling session trackers failed; connection stays unshared");
    }
    Ok(())
}

/// Builds the router-synthesised ChangeUser payload from the client-side
/// protocol state. A known password is scrambled against the server's
/// current nonce (a ChangeUser does not issue a new one unless the method
/// switches); otherwise the unknown-plugin name forces a method switch.
fn synthesize_change_user(cx: &mut ConnectionContext) -> Vec<u8> {
    let server_nonce = cx
        .server
        .as_ref()
        .map(|s| s.state.auth_method_data.clone())
        .unwrap_or_default();
    let method = cx.client_state.auth_method_name.clone();

    let (plugin, auth_data) = match cx.client_state.password_plain() {
        Some(password) => {
            let data = if method == AuthPluginName::AuthNativePassword.as_ref().as_bytes() {
                mysql_native_password_scramble(&server_nonce, password)
            } else if method == AuthPluginName::AuthClearPassword.as_ref().as_bytes() {
                let mut data = password.to_vec();
                data.push(0);
                data
            } else {
                caching_sha2_password_scramble(&server_nonce, password)
            };
            (method.clone(), data)
        }
        None => (
            AuthPluginName::SwitchMeIfYouCan.as_ref().as_bytes().to_vec(),
            Vec::new(),
        ),
    };

    let request = ChangeUserRequest {
        username: cx.client_state.username.clone().unwrap_or_default(),
        auth_response: auth_data,
        schema: cx.client_state.schema.clone(),
        collation: cx.client_state.collation,
        auth_plugin: plugin,
        connect_attributes: build_attributes(cx),
    };
    let caps = cx
        .server
        .as_ref()
        .map(|s| s.state.shared_capabilities())
        .unwrap_or_default();
    request.encode(caps)
}

/// What re-auth resets on success.
fn reset_session_after_change_user(cx: &mut ConnectionContext) {
    cx.client_state.prepared_statements.clear();
    if let Some(server) = cx.server.as_mut() {
        server.state.username = cx.client_state.username.clone();
        server.state.schema = cx.client_state.schema.clone();
        server.state.prepared_statements.clear();
    }
}

/// Router-driven ChangeUser over an open (pooled) server connection; the
/// nested auth forwarder completes the exchange.
pub struct ChangeUserSender {
    sent: bool,
    finished: bool,
}

impl ChangeUserSender {
    /// Re-auth a pool hit with the current client's credentials.
    pub fn for_initial_auth() -> Self {
        Self {
            sent: false,
            finished: false,
        }
    }
}

#[async_trait]
impl Processor for ChangeUserSender {
    fn name(&self) -> &'static str {
        "change-user-sender"
    }

    async fn process(&mut self, cx: &mut ConnectionContext) -> io::Result<ProcessorResult> {
        if self.finished {
            if let Some(failure) = cx.take_failure() {
                // the pooled connection is no good after a failed re-auth.
                if let Some(server) = cx.server.take() {
                    async_close_connection(server);
                }
                return Err(failure);
            }
            reset_session_after_change_user(cx);
            return Ok(ProcessorResult::Done);
        }
        if self.sent {
            self.finished = true;
            cx.push_processor(Box::new(AuthForwarder::new()));
            return Ok(ProcessorResult::Again);
        }
        self.sent = true;

        let payload = synthesize_change_user(cx);
        debug!("re-authenticating pooled connection via ChangeUser");
        let server = cx.server_mut()?;
        server.authenticated = false;
        let writer = server.channel.writer();
        writer.reset_seq();
        writer.write_all(&payload)?;
        writer.end_packet().await?;
        cx.server_last_seq = 0;
        Ok(ProcessorResult::SendToServer)
    }
}

/// Client-driven COM_CHANGE_USER in the command phase.
pub struct ChangeUserForwarder {
    seq: u8,
    pkt: Packet,
}

impl ChangeUserForwarder {
    pub fn new(seq: u8, pkt: Packet) -> Self {
        Self { seq, pkt }
    }

    pub async fn run(self, cx: &mut ConnectionContext) -> io::Result<()> {
        let shared = cx.client_state.shared_capabilities();
        let (_, parsed) = change_user_request(&self.pkt, shared).map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("bad COM_CHANGE_USER: {e:?}"))
        })?;

        // the client's new identity. its auth data answers the router's old
        // nonce, so the password is unknown again and the synthesised
        // message forces a method switch.
        cx.client_state.username = Some(parsed.username.clone());
        cx.client_state.schema = parsed.schema.clone();
        if parsed.collation != 0 {
            cx.client_state.collation = parsed.collation;
        }
        if !parsed.auth_plugin.is_empty() {
            cx.client_state.auth_method_name = parsed.auth_plugin.clone();
        }
        cx.client_state.reset_for_change_user();
        cx.client_state.attributes = parsed.connect_attributes.clone();

        let payload = synthesize_change_user(cx);
        {
            let server = cx.server_mut()?;
            server.authenticated = false;
            let writer = server.channel.writer();
            writer.reset_seq();
            writer.write_all(&payload)?;
            writer.end_packet().await?;
            writer.flush_all().await?;
        }
        cx.server_last_seq = 0;
        cx.client_last_seq = self.seq;

        loop {
            let (seq, pkt) = cx.recv_server().await?;

            if pkt.is_ok_packet() {
                if let Ok(server) = cx.server_mut() {
                    server.authenticated = true;
                }
                reset_session_after_change_user(cx);
                if cx.route.connection_sharing {
                    enable_session_trackers(cx).await?;
                }
                let writer = cx.client.writer();
                writer.set_seq(seq);
                writer.write_all(&pkt)?;
                writer.end_packet().await?;
                writer.flush_all().await?;
                debug!(
                    "change-user to {:?} succeeded",
                    cx.client_state
                        .username
                        .as_ref()
                        .map(|u| String::from_utf8_lossy(u))
                );
                return Ok(());
            }

            if pkt.is_err_packet() {
                // the server will close anyway; never back to the pool.
                let writer = cx.client.writer();
                writer.set_seq(seq);
                writer.write_all(&pkt)?;
                writer.end_packet().await?;
                writer.flush_all().await?;
                if let Some(server) = cx.server.take() {
                    async_close_connection(server);
                }
                return Ok(());
            }

            // method switch or auth continuation: shuttle to the client.
            if pkt.is_auth_switch_request() {
                if let Ok((_, (method, nonce))) =
                    crate::protocol::mysql::basic::auth_switch_request(&pkt)
                {
                    cx.client_state.auth_method_name = method.clone();
                    cx.client_state.auth_method_data = nonce.clone();
                    if let Ok(server) = cx.server_mut() {
                        server.state.auth_method_name = method;
                        server.state.auth_method_data = nonce;
                    }
                }
            }
            {
                let writer = cx.client.writer();
                writer.set_seq(seq);
                writer.write_all(&pkt)?;
                writer.end_packet().await?;
                writer.flush_all().await?;
            }
            if pkt.is_auth_more_data() && pkt[1..] == [CACHING_SHA2_FAST_AUTH_OK] {
                // no client reply to the fast-auth-ok marker.
                continue;
            }

            let (reply_seq, reply) = cx.recv_client().await?;
            // a secure client leg may hand us the new plaintext password.
            if cx.client_transport_is_secure() && !pkt.is_auth_switch_request() && reply.len() > 1
            {
                let mut password = reply.to_vec();
                if password.last() == Some(&0) {
                    password.pop();
                }
                trace!("captured re-auth password ({} bytes)", password.len());
                cx.client_state.set_password_plain(password);
            }
            let server = cx.server_mut()?;
            let writer = server.channel.writer();
            writer.set_seq(reply_seq);
            writer.write_all(&reply)?;
            writer.end_packet().await?;
            writer.flush_all().await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ServerConnection;
    use crate::channel::Channel;
    use crate::destinations::Destinations;
    use crate::pool::ConnectionPool;
    use crate::protocol::mysql::packet::packet_reader::PacketReader;
    use common::config::Config;
    use std::sync::Arc;

    fn cx_with_server() -> (
        ConnectionContext,
        tokio::io::DuplexStream,
        tokio::io::DuplexStream,
    ) {
        let mut config = Config::new();
        config
            .read_str(
                "[routing:test]\nbind_port = 6446\ndestinations = 127.0.0.1:3306\nclient_ssl_mode = DISABLED\nserver_ssl_mode = DISABLED\n",
            )
            .unwrap();
        let section = config.sections().next().unwrap();
        let route = Arc::new(crate::config::RouteConfig::from_section(&section).unwrap());
        let destinations = Arc::new(Destinations::new(
            &route.destinations,
            route.routing_strategy,
        ));
        let (client, client_peer) = tokio::io::duplex(16384);
        let mut cx = ConnectionContext::new(
            "cx-test".to_string(),
            route,
            Arc::new(ConnectionPool::new(4, std::time::Duration::from_secs(60))),
            destinations,
            Channel::new(Box::new(client)),
            false,
        );

        let (server, server_peer) = tokio::io::duplex(16384);
        let mut conn =
            ServerConnection::new("db:3306".to_string(), Channel::new(Box::new(server)));
        conn.state.auth_method_data = b"01234567890123456789".to_vec();
        conn.authenticated = true;
        cx.server = Some(conn);
        (cx, server_peer, client_peer)
    }

    #[tokio::test]
    async fn synthesised_change_user_scrambles_with_original_nonce() {
        let (mut cx, _server_peer, _client_peer) = cx_with_server();
        cx.client_state.username = Some(b"bob".to_vec());
        cx.client_state.auth_method_name =
            AuthPluginName::AuthNativePassword.as_ref().as_bytes().to_vec();
        cx.client_state.set_password_plain(b"pass".to_vec());

        let payload = synthesize_change_user(&mut cx);
        assert_eq!(payload[0], CommandCode::ComChangeUser as u8);
        // username follows the command byte, NUL-terminated.
        assert_eq!(&payload[1..5], b"bob\0");
        // the scramble answers the server's *original* greeting nonce.
        let expected = mysql_native_password_scramble(b"01234567890123456789", b"pass");
        assert!(payload
            .windows(expected.len())
            .any(|window| window == expected.as_slice()));
    }

    #[tokio::test]
    async fn unknown_password_forces_method_switch() {
        let (mut cx, _server_peer, _client_peer) = cx_with_server();
        cx.client_state.username = Some(b"bob".to_vec());
        cx.client_state.auth_method_name = AuthPluginName::AuthCachingSha2Password
            .as_ref()
            .as_bytes()
            .to_vec();
        cx.client_state.clear_password();

        let payload = synthesize_change_user(&mut cx);
        let needle = AuthPluginName::SwitchMeIfYouCan.as_ref().as_bytes();
        assert!(payload.windows(needle.len()).any(|w| w == needle));
    }

    #[tokio::test]
    async fn sender_marks_connection_unauthenticated_until_ok() {
        let (mut cx, server_peer, _client_peer) = cx_with_server();
        cx.client_state.username = Some(b"alice".to_vec());
        cx.client_state.set_password_plain(b"secret".to_vec());
        cx.client_state.auth_method_name = AuthPluginName::AuthCachingSha2Password
            .as_ref()
            .as_bytes()
            .to_vec();

        let mut sender = ChangeUserSender::for_initial_auth();
        let result = sender.process(&mut cx).await.unwrap();
        assert_eq!(result, ProcessorResult::SendToServer);
        assert!(!cx.server.as_ref().unwrap().authenticated);
        cx.server_mut()
            .unwrap()
            .channel
            .writer()
            .flush_all()
            .await
            .unwrap();

        // the synthesised ChangeUser left on seq 0.
        let (peer_r, _peer_w) = tokio::io::split(server_peer);
        let mut reader = PacketReader::new(peer_r);
        let (seq, pkt) = reader.next_async().await.unwrap().unwrap();
        assert_eq!(seq, 0);
        assert_eq!(pkt[0], CommandCode::ComChangeUser as u8);
    }
}
