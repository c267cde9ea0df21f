//! mysql_native_password: SHA1 scramble, identical over TLS and plaintext.

use crate::auth::forwarder::MethodSwitchForwarder;
use crate::auth::{
    mysql_native_password_scramble, public_key_to_pem, rsa_decrypt, send_auth_data_to_server,
};
use crate::connection::ConnectionContext;
use crate::processor::{Processor, ProcessorResult};
use crate::protocol::mysql::constants::CACHING_SHA2_FULL_AUTH_REQUESTED;
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::packet::writers::{write_auth_more_data, write_err_packet};

use async_trait::async_trait;
use rsa::RsaPublicKey;
use std::io::{self, Write};
use tracing::trace;

/// Router answers the switch alone with the captured plaintext password.
pub struct NativeSender {
    sent: bool,
}

impl NativeSender {
    pub fn new() -> Self {
        Self { sent: false }
    }
}

impl Default for NativeSender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Processor for NativeSender {
    fn name(&self) -> &'static str {
        "native-sender"
    }

    async fn process(&mut self, cx: &mut ConnectionContext) -> io::Result<ProcessorResult> {
        if self.sent {
            return Ok(ProcessorResult::Done);
        }
        self.sent = true;
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
                io::Error::new(io::ErrorKind::InvalidInput, "plaintext password not captured")
            })?;
        let scramble = mysql_native_password_scramble(&nonce, &password);
        send_auth_data_to_server(cx, &scramble).await?;
        Ok(ProcessorResult::SendToServer)
    }
}

pub fn forwarder(nonce: &[u8]) -> Box<MethodSwitchForwarder> {
    Box::new(MethodSwitchForwarder::new("native-forwarder", nonce))
}

enum TranslateStage {
    RequestFullAuth,
    ClientReply,
    Done,
}

/// The server switched to mysql_native_password but the client speaks
/// caching_sha2_password: the router keeps the caching-sha2 dialect toward
/// the client to obtain the plaintext, then answers the server natively.
/// The only case where the client's nominal method differs from the wire
/// toward the server.
pub struct NativeViaCachingSha2 {
    stage: TranslateStage,
}

impl NativeViaCachingSha2 {
    pub fn new() -> Self {
        Self {
            stage: TranslateStage::RequestFullAuth,
        }
    }
}

impl Default for NativeViaCachingSha2 {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Processor for NativeViaCachingSha2 {
    fn name(&self) -> &'static str {
        "native-via-caching-sha2"
    }

    async fn process(&mut self, cx: &mut ConnectionContext) -> io::Result<ProcessorResult> {
        match self.stage {
            TranslateStage::RequestFullAuth => {
                self.stage = TranslateStage::ClientReply;
                // request-full-auth in the dialect the client already
                // speaks.
                let seq = cx.client_last_seq.wrapping_add(1);
                cx.client.writer().set_seq(seq);
                write_auth_more_data(cx.client.writer(), &[CACHING_SHA2_FULL_AUTH_REQUESTED])
                    .await?;
                return Ok(ProcessorResult::RecvFromClient);
            }
            TranslateStage::Done => return Ok(ProcessorResult::Done),
            TranslateStage::ClientReply => {}
        }
        self.stage = TranslateStage::Done;

        let (_seq, reply) = cx.take_client_msg()?;
        let password = if cx.client_transport_is_secure() {
            let mut password = reply.to_vec();
            if password.last() == Some(&0) {
                password.pop();
            }
            password
        } else if reply.len() == 1 {
            // public-key request; answer with the router's key and decrypt
            // the reply.
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
            let pem = public_key_to_pem(&RsaPublicKey::from(private_key.as_ref()))?;
            let mut more_data = vec![0x01];
            more_data.extend_from_slice(&pem);
            let seq = cx.client_last_seq.wrapping_add(1);
            let writer = cx.client.writer();
            writer.set_seq(seq);
            writer.write_all(&more_data)?;
            writer.end_packet().await?;
            writer.flush_all().await?;

            let (_seq, encrypted) = cx.recv_client().await?;
            let mut password = rsa_decrypt(&private_key, &encrypted)?;
            let nonce = cx.client_state.auth_method_data.clone();
            if !nonce.is_empty() {
                for (i, b) in password.iter_mut().enumerate() {
                    *b ^= nonce[i % nonce.len()];
                }
            }
            if password.last() == Some(&0) {
                password.pop();
            }
            password
        } else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "expected a plaintext password or a public-key request",
            ));
        };

        trace!("translating caching-sha2 reply to a native scramble");
        cx.client_state.set_password_plain(password.clone());
        let nonce = cx
            .server
            .as_ref()
            .map(|s| s.state.auth_method_data.clone())
            .unwrap_or_default();
        let scramble = mysql_native_password_scramble(&nonce, &password);
        send_auth_data_to_server(cx, &scramble).await?;
        Ok(ProcessorResult::SendToServer)
    }
}
