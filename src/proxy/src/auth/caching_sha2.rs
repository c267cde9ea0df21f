//! caching_sha2_password: SHA256 fast-auth scramble first; the full-auth
//! continuation (0x04) and the public-key exchange are driven by the
//! top-level auth forwarder.

use crate::auth::forwarder::MethodSwitchForwarder;
use crate::auth::{caching_sha2_password_scramble, send_auth_data_to_server};
use crate::connection::ConnectionContext;
use crate::processor::{Processor, ProcessorResult};

use async_trait::async_trait;
use std::io;

/// Router answers the switch alone: fast-auth scramble against the
/// server's nonce.
pub struct CachingSha2Sender {
    sent: bool,
}

impl CachingSha2Sender {
    pub fn new() -> Self {
        Self { sent: false }
    }
}

impl Default for CachingSha2Sender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Processor for CachingSha2Sender {
    fn name(&self) -> &'static str {
        "caching-sha2-sender"
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
        let scramble = caching_sha2_password_scramble(&nonce, &password);
        send_auth_data_to_server(cx, &scramble).await?;
        Ok(ProcessorResult::SendToServer)
    }
}

pub fn forwarder(nonce: &[u8]) -> Box<MethodSwitchForwarder> {
    Box::new(MethodSwitchForwarder::new("caching-sha2-forwarder", nonce))
}
