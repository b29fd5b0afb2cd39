//! Transport abstraction owned by a [`Client`](crate::client::Client).
//!
//! The hub talks to every peer through [`Connection`] and never learns which
//! transport sits underneath. [`TcpConnection`] speaks newline-delimited JSON
//! over a socket; [`MemoryConnection`] is driven in-process by a
//! [`MemoryPeer`] and is what the tests use.
//!
//! Contract:
//!
//! - `send` may run concurrently with `receive`. Concurrent `send` calls are
//!   not required to work; a client only ever has one writer task.
//! - `receive` reports end of stream (`None`) or a transport error exactly
//!   once. Every later call returns `None`. Decode errors are not terminal.
//! - `close` is idempotent, may be called from any task, and makes a pending
//!   `receive` or `send` return promptly.

mod memory;
mod tcp;

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    error::{ReceiveError, TransportError},
    message::Message,
};

pub use memory::{MemoryConnection, MemoryPeer};
pub use tcp::TcpConnection;

#[async_trait]
pub trait Connection: Send + Sync {
    async fn send(&self, message: &Message) -> Result<(), TransportError>;

    async fn receive(&self) -> Option<Result<Message, ReceiveError>>;

    async fn close(&self) -> Result<(), TransportError>;

    /// Short label for log lines, e.g. the peer address.
    fn peer(&self) -> String;
}

#[async_trait]
impl<C> Connection for Arc<C>
where
    C: Connection + ?Sized,
{
    async fn send(&self, message: &Message) -> Result<(), TransportError> {
        (**self).send(message).await
    }

    async fn receive(&self) -> Option<Result<Message, ReceiveError>> {
        (**self).receive().await
    }

    async fn close(&self) -> Result<(), TransportError> {
        (**self).close().await
    }

    fn peer(&self) -> String {
        (**self).peer()
    }
}
