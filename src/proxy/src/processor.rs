//! Per-connection processor stack.
//!
//! Each connection owns a LIFO of processors. `process()` advances the top
//! processor by one stage; the returned result tells the driver which I/O
//! to perform before re-entering. A processor delegates a sub-state-machine
//! by pushing a child, which completes before control returns.

use crate::connection::ConnectionContext;

use async_trait::async_trait;
use std::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorResult {
    /// flush the client-side send buffer, then re-enter.
    SendToClient,
    /// flush the server-side send buffer, then re-enter.
    SendToServer,
    /// receive one message from the client into the mailbox, then re-enter.
    RecvFromClient,
    /// receive one message from the server into the mailbox, then re-enter.
    RecvFromServer,
    /// receive from whichever side speaks first.
    RecvFromBoth,
    /// re-enter without I/O (e.g. after pushing a child).
    Again,
    /// pop this processor.
    Done,
}

#[async_trait]
pub trait Processor: Send {
    fn name(&self) -> &'static str;

    async fn process(&mut self, cx: &mut ConnectionContext) -> io::Result<ProcessorResult>;
}
