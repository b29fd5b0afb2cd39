//! Error types shared by the hub.
//!
//! Failures are scoped to the client they happen on. A [`TransportError`]
//! ends that client's session, a [`DecodeError`] only skips one frame, and a
//! [`DeliveryError`] is reported per broadcast recipient. Routing misses
//! (unknown room or client) are not errors at all.

use std::io;

use thiserror::Error;

/// Read or write failure on a connection. Fatal to the owning client.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("connection is closed")]
    Closed,
}

/// An inbound frame that could not be turned into a message.
#[derive(Debug, Error)]
#[error("malformed message: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

/// Non-terminal or terminal failure reported by `Connection::receive`.
#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ReceiveError {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReceiveError::Transport(_))
    }
}

/// Why one member of a broadcast did not get the message.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("outbound queue is full")]
    QueueFull,
    #[error("client is no longer running")]
    Inactive,
}

/// Misuse of the client lifecycle.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("client was already started")]
    AlreadyStarted,
    #[error("client is stopped")]
    Stopped,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("room '{0}' already exists")]
    DuplicateRoom(String),
    #[error(transparent)]
    State(#[from] StateError),
}
