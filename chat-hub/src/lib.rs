//! Real-time chat hub: connections, rooms and broadcast.
//!
//! Clients authenticate first, then keep one bidirectional connection open
//! and exchange JSON messages that are routed through named rooms. Each
//! module has one job:
//!
//! - [`message`] defines the wire message and the line-delimited JSON framing.
//! - [`connection`] abstracts the transport behind the `Connection` trait,
//!   with a TCP implementation and an in-memory one for tests.
//! - [`client`] owns one session: its receive loop, outbound writer and
//!   exactly-once teardown.
//! - [`room`] is a named member set with snapshot broadcast.
//! - [`registry`] is the process-wide directory of rooms and clients.
//! - [`session`] is the authentication boundary the hub relies on.
//! - [`server`] accepts TCP peers, logs them in and hands them to the hub.
//! - [`cli`] parses the command line into hub configuration.
//! - [`error`] holds the error types shared by all of the above.
//!
//! Integration tests drive the hub through `MemoryConnection` and over real
//! TCP via [`server::Server`].

pub mod cli;
pub mod client;
pub mod connection;
pub mod error;
pub mod message;
pub mod registry;
pub mod room;
pub mod server;
pub mod session;
