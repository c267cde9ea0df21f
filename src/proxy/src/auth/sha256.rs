//! sha256_password: plaintext password over TLS, or an RSA-encrypted
//! password after a public-key request over plaintext. The empty password
//! is the single NUL byte.

use crate::auth::forwarder::MethodSwitchForwarder;
use crate::auth::send_auth_data_to_server;
use crate::connection::ConnectionContext;
use crate::processor::{Processor, ProcessorResult};
use crate::protocol::mysql::constants::SHA256_PUBLIC_KEY_REQUEST;

use async_trait::async_trait;
use std::io;

/// Router answers the switch alone. Over a plaintext leg it requests the
/// server's public key; the top-level forwarder encrypts once the key
/// arrives.
pub struct Sha256Sender {
    server_is_tls: bool,
    sent: bool,
}

impl Sha256Sender {
    pub fn new(server_is_tls: bool) -> Self {
        Self {
            server_is_tls,
            sent: false,
        }
    }
}

#[async_trait]
impl Processor for Sha256Sender {
    fn name(&self) -> &'static str {
        "sha256-sender"
    }

    async fn process(&mut self, cx: &mut ConnectionContext) -> io::Result<ProcessorResult> {
        if self.sent {
            return Ok(ProcessorResult::Done);
        }
        self.sent = true;
        if self.server_is_tls {
            let password = cx
                .client_state
                .password_plain()
                .map(|p| p.to_vec())
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "plaintext password not captured")
                })?;
            let mut data = password;
            data.push(0);
            send_auth_data_to_server(cx, &data).await?;
        } else {
            send_auth_data_to_server(cx, &[SHA256_PUBLIC_KEY_REQUEST]).await?;
        }
        Ok(ProcessorResult::SendToServer)
    }
}

pub fn forwarder(nonce: &[u8]) -> Box<MethodSwitchForwarder> {
    Box::new(MethodSwitchForwarder::new("sha256-forwarder", nonce))
}
