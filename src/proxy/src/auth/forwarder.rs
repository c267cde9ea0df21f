//! Top-level authentication forwarder.
//!
//! After the curated client greeting is on the wire, this processor owns
//! the server leg until Ok/Error: it dispatches auth-method switches to the
//! per-method senders (router speaks alone, password known) or forwarders
//! (router shuttles between client and server), and handles the in-band
//! AuthMoreData exchanges, including the public-key paths.

use crate::auth::{
    caching_sha2, cleartext, native, public_key_from_pem, public_key_to_pem, rsa_decrypt,
    rsa_encrypt, sha256, xor_password_with_nonce,
};
use crate::config::ClientSslMode;
use crate::connection::ConnectionContext;
use crate::processor::{Processor, ProcessorResult};
use crate::protocol::mysql::basic::{auth_switch_request, ok_packet};
use crate::protocol::mysql::constants::{
    AuthPluginName, CACHING_SHA2_FAST_AUTH_OK, CACHING_SHA2_FULL_AUTH_REQUESTED,
    CACHING_SHA2_PUBLIC_KEY_REQUEST, SHA256_PUBLIC_KEY_REQUEST,
};
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::packet::writers::{
    write_auth_data, write_auth_switch_request, write_err_packet,
};

use async_trait::async_trait;
use rsa::RsaPublicKey;
use std::io::{self, Write};
use tracing::{debug, trace, warn};

enum Stage {
    Init,
    Response,
}

pub struct AuthForwarder {
    stage: Stage,
    /// the client takes part in the exchange (forwarder mode).
    client_participates: bool,
    /// a public-key request toward the server is outstanding; the next
    /// AuthMoreData is a PEM key to encrypt the password with.
    awaiting_server_public_key: bool,
}

impl AuthForwarder {
    pub fn new() -> Self {
        Self {
            stage: Stage::Init,
            client_participates: false,
            awaiting_server_public_key: false,
        }
    }

    async fn forward_to_client(
        cx: &mut ConnectionContext,
        pkt: &[u8],
        flush: bool,
    ) -> io::Result<()> {
        let seq = cx.client_last_seq.wrapping_add(1);
        let writer = cx.client.writer();
        writer.set_seq(seq);
        writer.write_all(pkt)?;
        writer.end_packet().await?;
        if flush {
            writer.flush_all().await?;
        }
        Ok(())
    }

    async fn send_to_server(cx: &mut ConnectionContext, data: &[u8]) -> io::Result<()> {
        let seq = cx.server_last_seq.wrapping_add(1);
        let server = cx.server_mut()?;
        server.channel.writer().set_seq(seq);
        write_auth_data(server.channel.writer(), data).await
    }

    /// A method switch with a known plaintext password is answered by the
    /// router alone.
    fn dispatch_sender(
        &mut self,
        cx: &mut ConnectionContext,
        method: &[u8],
    ) -> io::Result<()> {
        let server_is_tls = cx.server.as_ref().map(|s| s.is_tls()).unwrap_or(false);
        if method == AuthPluginName::AuthNativePassword.as_ref().as_bytes() {
            cx.push_processor(Box::new(native::NativeSender::new()));
        } else if method == AuthPluginName::AuthCachingSha2Password.as_ref().as_bytes() {
            cx.push_processor(Box::new(caching_sha2::CachingSha2Sender::new()));
        } else if method == AuthPluginName::AuthClearPassword.as_ref().as_bytes() {
            cx.push_processor(Box::new(cleartext::CleartextSender::new()));
        } else if method == AuthPluginName::AuthSha256Password.as_ref().as_bytes() {
            if !server_is_tls {
                // the password travels RSA-encrypted; ask for the key.
                self.awaiting_server_public_key = true;
            }
            cx.push_processor(Box::new(sha256::Sha256Sender::new(server_is_tls)));
        } else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "server switched to unsupported auth method {}",
                    String::from_utf8_lossy(method)
                ),
            ));
        }
        Ok(())
    }

    /// A method switch without the password: the client answers. The switch
    /// is relayed and the reply shuttled back by a per-method forwarder.
    fn dispatch_forwarder(
        &mut self,
        cx: &mut ConnectionContext,
        method: &[u8],
        nonce: &[u8],
    ) -> io::Result<()> {
        self.client_participates = true;
        let forwarder = if method == AuthPluginName::AuthNativePassword.as_ref().as_bytes() {
            native::forwarder(nonce)
        } else if method == AuthPluginName::AuthCachingSha2Password.as_ref().as_bytes() {
            caching_sha2::forwarder(nonce)
        } else if method == AuthPluginName::AuthClearPassword.as_ref().as_bytes() {
            cleartext::forwarder(nonce)
        } else if method == AuthPluginName::AuthSha256Password.as_ref().as_bytes() {
            sha256::forwarder(nonce)
        } else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "server switched to unsupported auth method {}",
                    String::from_utf8_lossy(method)
                ),
            ));
        };
        // the client-side state now follows the server's method.
        cx.client_state.auth_method_name = method.to_vec();
        cx.client_state.auth_method_data = nonce.to_vec();
        cx.push_processor(forwarder);
        Ok(())
    }

    /// caching-sha2 / sha256 full-auth continuation once the plaintext
    /// password is known: straight over TLS, RSA-encrypted otherwise.
    async fn continue_full_auth(&mut self, cx: &mut ConnectionContext) -> io::Result<()> {
        let server_is_tls = cx.server.as_ref().map(|s| s.is_tls()).unwrap_or(false);
        let password = cx
            .client_state
            .password_plain()
            .map(|p| p.to_vec())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "plaintext password not captured")
            })?;
        if server_is_tls {
            let mut data = password;
            data.push(0);
            Self::send_to_server(cx, &data).await
        } else {
            self.awaiting_server_public_key = true;
            Self::send_to_server(cx, &[CACHING_SHA2_PUBLIC_KEY_REQUEST]).await
        }
    }

    /// The client (on a plaintext leg) asked for a public key. With a TLS
    /// context the router answers with its own key and recovers the
    /// password from the encrypted reply; without one the request is
    /// forwarded verbatim.
    async fn client_public_key_exchange(
        &mut self,
        cx: &mut ConnectionContext,
        request: &[u8],
    ) -> io::Result<()> {
        if matches!(
            cx.route.client_ssl_mode,
            ClientSslMode::Disabled | ClientSslMode::Passthrough
        ) {
            trace!("forwarding public-key request verbatim");
            Self::send_to_server(cx, request).await?;
            return Ok(());
        }

        let Some(private_key) = cx.router_private_key.clone() else {
            write_err_packet(
                ErrorKind::ER_ACCESS_DENIED_ERROR,
                b"Access denied: no key to answer the public-key request",
                cx.client.writer(),
            )
            .await?;
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "public-key request without a TLS context",
            ));
        };

        let public_pem = public_key_to_pem(&RsaPublicKey::from(private_key.as_ref()))?;
        let mut more_data = vec![0x01];
        more_data.extend_from_slice(&public_pem);
        Self::forward_to_client(cx, &more_data, true).await?;

        let (_seq, encrypted) = cx.recv_client().await?;
        let decrypted = rsa_decrypt(&private_key, &encrypted)?;
        // reverse the xor with the nonce of the client leg, strip the NUL.
        let nonce = cx.client_state.auth_method_data.clone();
        let mut password = decrypted;
        if !nonce.is_empty() {
            for (i, b) in password.iter_mut().enumerate() {
                *b ^= nonce[i % nonce.len()];
            }
        }
        if password.last() == Some(&0) {
            password.pop();
        }
        cx.client_state.set_password_plain(password);

        self.continue_full_auth(cx).await
    }
}

impl Default for AuthForwarder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Processor for AuthForwarder {
    fn name(&self) -> &'static str {
        "auth-forwarder"
    }

    async fn process(&mut self, cx: &mut ConnectionContext) -> io::Result<ProcessorResult> {
        match self.stage {
            Stage::Init => {
                if let Some(failure) = cx.take_failure() {
                    return Err(failure);
                }
                self.stage = Stage::Response;
                Ok(ProcessorResult::RecvFromServer)
            }
            Stage::Response => {
                let (_seq, pkt) = cx.take_server_msg()?;
                self.stage = Stage::Init;

                if pkt.is_ok_packet() {
                    let shared = cx
                        .server
                        .as_ref()
                        .map(|s| s.state.shared_capabilities())
                        .unwrap_or_default();
                    if let Ok((_, ok)) = ok_packet(&pkt, shared) {
                        if let Ok(server) = cx.server_mut() {
                            server.state.status_flags = ok.status_flags;
                        }
                    }
                    if let Ok(server) = cx.server_mut() {
                        server.authenticated = true;
                    }
                    debug!("server authentication succeeded");
                    if self.client_participates {
                        Self::forward_to_client(cx, &pkt, true).await?;
                        cx.server_ok_forwarded = true;
                    }
                    return Ok(ProcessorResult::Done);
                }

                if pkt.is_err_packet() {
                    warn!("server authentication failed");
                    cx.auth_error = Some(pkt);
                    if let Ok(server) = cx.server_mut() {
                        server.authenticated = false;
                    }
                    return Err(io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        "server rejected authentication",
                    ));
                }

                if pkt.is_auth_switch_request() {
                    let (_, (method, nonce)) = auth_switch_request(&pkt).map_err(|e| {
                        io::Error::new(io::ErrorKind::InvalidData, format!("{e:?}"))
                    })?;
                    trace!(
                        "auth method switch to {}",
                        String::from_utf8_lossy(&method)
                    );
                    {
                        let server = cx.server_mut()?;
                        server.state.auth_method_name = method.clone();
                        server.state.auth_method_data = nonce.clone();
                    }

                    if cx.client_state.password_plain().is_some() {
                        self.dispatch_sender(cx, &method)?;
                        return Ok(ProcessorResult::Again);
                    }

                    // the server wants native, the client speaks
                    // caching-sha2: keep caching-sha2 toward the client to
                    // obtain the plaintext, translate to native.
                    if method == AuthPluginName::AuthNativePassword.as_ref().as_bytes()
                        && cx.client_state.auth_method_name
                            == AuthPluginName::AuthCachingSha2Password.as_ref().as_bytes()
                        && cx.route.connection_sharing
                        && (cx.client_transport_is_secure()
                            || cx.router_private_key.is_some())
                    {
                        cx.push_processor(Box::new(native::NativeViaCachingSha2::new()));
                        return Ok(ProcessorResult::Again);
                    }

                    self.dispatch_forwarder(cx, &method, &nonce)?;
                    return Ok(ProcessorResult::Again);
                }

                if pkt.is_auth_more_data() {
                    let data = &pkt[1..];

                    if self.awaiting_server_public_key {
                        // PEM public key for the pending full-auth.
                        self.awaiting_server_public_key = false;
                        let key = public_key_from_pem(data)?;
                        let nonce = cx
                            .server
                            .as_ref()
                            .map(|s| s.state.auth_method_data.clone())
                            .unwrap_or_default();
                        let password = cx
                            .client_state
                            .password_plain()
                            .map(|p| p.to_vec())
                            .ok_or_else(|| {
                                io::Error::new(
                                    io::ErrorKind::InvalidInput,
                                    "plaintext password not captured",
                                )
                            })?;
                        let masked = xor_password_with_nonce(&password, &nonce);
                        let encrypted = rsa_encrypt(&key, &masked)?;
                        Self::send_to_server(cx, &encrypted).await?;
                        return Ok(ProcessorResult::Again);
                    }

                    if data == [CACHING_SHA2_FAST_AUTH_OK] {
                        // fast-auth succeeded; only a client that ran the
                        // exchange itself expects to see this byte.
                        if self.client_participates {
                            Self::forward_to_client(cx, &pkt, true).await?;
                        } else {
                            trace!("absorbing caching-sha2 fast-auth-ok");
                        }
                        return Ok(ProcessorResult::Again);
                    }

                    if data == [CACHING_SHA2_FULL_AUTH_REQUESTED] {
                        if cx.client_state.password_plain().is_some() {
                            self.continue_full_auth(cx).await?;
                            return Ok(ProcessorResult::Again);
                        }
                        // the client must answer: plaintext password over a
                        // secure leg, or a public-key request.
                        Self::forward_to_client(cx, &pkt, true).await?;
                        self.client_participates = true;
                        let (_seq, reply) = cx.recv_client().await?;
                        if reply.as_ref() == [CACHING_SHA2_PUBLIC_KEY_REQUEST]
                            || reply.as_ref() == [SHA256_PUBLIC_KEY_REQUEST]
                        {
                            self.client_public_key_exchange(cx, &reply).await?;
                            return Ok(ProcessorResult::Again);
                        }
                        if cx.client_transport_is_secure() {
                            let mut password = reply.to_vec();
                            if password.last() == Some(&0) {
                                password.pop();
                            }
                            cx.client_state.set_password_plain(password);
                        }
                        Self::send_to_server(cx, &reply).await?;
                        return Ok(ProcessorResult::Again);
                    }

                    // anything else (e.g. a public key on a fully forwarded
                    // exchange) goes to the client, whose reply goes back.
                    if self.client_participates {
                        Self::forward_to_client(cx, &pkt, true).await?;
                        let (_seq, reply) = cx.recv_client().await?;
                        Self::send_to_server(cx, &reply).await?;
                        return Ok(ProcessorResult::Again);
                    }
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "unexpected auth data from the server",
                    ));
                }

                Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unexpected message during authentication: 0x{:02x}", pkt[0]),
                ))
            }
        }
    }
}

/// Shuttles one method-switch round between client and server: the switch
/// request out, the client's auth data back.
pub struct MethodSwitchForwarder {
    method: &'static str,
    switch_sent: bool,
    nonce: Vec<u8>,
}

impl MethodSwitchForwarder {
    pub(crate) fn new(method: &'static str, nonce: &[u8]) -> Self {
        Self {
            method,
            switch_sent: false,
            nonce: nonce.to_vec(),
        }
    }
}

#[async_trait]
impl Processor for MethodSwitchForwarder {
    fn name(&self) -> &'static str {
        self.method
    }

    async fn process(&mut self, cx: &mut ConnectionContext) -> io::Result<ProcessorResult> {
        if !self.switch_sent {
            self.switch_sent = true;
            let method = cx
                .server
                .as_ref()
                .map(|s| s.state.auth_method_name.clone())
                .unwrap_or_default();
            let seq = cx.client_last_seq.wrapping_add(1);
            cx.client.writer().set_seq(seq);
            write_auth_switch_request(cx.client.writer(), &method, &self.nonce).await?;
            return Ok(ProcessorResult::RecvFromClient);
        }

        let (_seq, reply) = cx.take_client_msg()?;
        // a secure leg may reveal the plaintext password; keep it for
        // connection sharing.
        if cx.client_transport_is_secure()
            && cx.client_state.auth_method_name
                == AuthPluginName::AuthClearPassword.as_ref().as_bytes()
        {
            let mut password = reply.to_vec();
            if password.last() == Some(&0) {
                password.pop();
            }
            cx.client_state.set_password_plain(password);
        }
        AuthForwarder::send_to_server(cx, &reply).await?;
        Ok(ProcessorResult::Done)
    }
}
