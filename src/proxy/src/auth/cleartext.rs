//! mysql_clear_password: the password as NUL-terminated bytes. Only safe
//! over TLS; the router forwards it wherever the exchange demands.

use crate::auth::forwarder::MethodSwitchForwarder;
use crate::auth::send_auth_data_to_server;
use crate::connection::ConnectionContext;
use crate::processor::{Processor, ProcessorResult};

use async_trait::async_trait;
use std::io;

pub struct CleartextSender {
    sent: bool,
}

impl CleartextSender {
    pub fn new() -> Self {
        Self { sent: false }
    }
}

impl Default for CleartextSender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Processor for CleartextSender {
    fn name(&self) -> &'static str {
        "cleartext-sender"
    }

    async fn process(&mut self, cx: &mut ConnectionContext) -> io::Result<ProcessorResult> {
        if self.sent {
            return Ok(ProcessorResult::Done);
        }
        self.sent = true;
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
        Ok(ProcessorResult::SendToServer)
    }
}

pub fn forwarder(nonce: &[u8]) -> Box<MethodSwitchForwarder> {
    Box::new(MethodSwitchForwarder::new("cleartext-forwarder", nonce))
}
