use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use tokio::{
    select,
    sync::{Mutex, mpsc},
};
use tokio_util::sync::CancellationToken;

use super::Connection;
use crate::{
    error::{ReceiveError, TransportError},
    message::Message,
};

enum Inbound {
    Message(Message),
    Frame(String),
    Failure(String),
    End,
}

/// State the connection and its peer both see.
#[derive(Default)]
struct Shared {
    close_calls: AtomicUsize,
    releases: AtomicUsize,
    failing_sends: AtomicBool,
}

/// In-process connection fed by a [`MemoryPeer`] instead of a socket.
pub struct MemoryConnection {
    label: String,
    inbound: Mutex<mpsc::UnboundedReceiver<Inbound>>,
    outbound: mpsc::UnboundedSender<Message>,
    stalled: bool,
    closed: CancellationToken,
    released: AtomicBool,
    finished: AtomicBool,
    shared: Arc<Shared>,
}

/// The remote end of a [`MemoryConnection`].
pub struct MemoryPeer {
    inbound: mpsc::UnboundedSender<Inbound>,
    outbound: mpsc::UnboundedReceiver<Message>,
    closed: CancellationToken,
    shared: Arc<Shared>,
}

impl MemoryConnection {
    pub fn pair(label: impl Into<String>) -> (Self, MemoryPeer) {
        Self::build(label.into(), false)
    }

    /// A connection whose `send` never completes until it is closed, like a
    /// peer that stopped reading.
    pub fn stalled(label: impl Into<String>) -> (Self, MemoryPeer) {
        Self::build(label.into(), true)
    }

    fn build(label: String, stalled: bool) -> (Self, MemoryPeer) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        let shared = Arc::new(Shared::default());

        let connection = Self {
            label,
            inbound: Mutex::new(inbound_rx),
            outbound: outbound_tx,
            stalled,
            closed: closed.clone(),
            released: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            shared: Arc::clone(&shared),
        };
        let peer = MemoryPeer {
            inbound: inbound_tx,
            outbound: outbound_rx,
            closed,
            shared,
        };
        (connection, peer)
    }

    fn finish(&self) {
        self.finished.store(true, Ordering::Release);
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn send(&self, message: &Message) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        if self.shared.failing_sends.load(Ordering::Acquire) {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe).into());
        }
        if self.stalled {
            self.closed.cancelled().await;
            return Err(TransportError::Closed);
        }
        self.outbound
            .send(message.clone())
            .map_err(|_| TransportError::Closed)
    }

    async fn receive(&self) -> Option<Result<Message, ReceiveError>> {
        if self.finished.load(Ordering::Acquire) {
            return None;
        }

        let mut inbound = self.inbound.lock().await;
        let next = select! {
            biased;
            _ = self.closed.cancelled() => None,
            next = inbound.recv() => next,
        };

        match next {
            Some(Inbound::Message(message)) => Some(Ok(message)),
            Some(Inbound::Frame(frame)) => Some(Message::decode(&frame).map_err(ReceiveError::from)),
            Some(Inbound::Failure(reason)) => {
                self.finish();
                Some(Err(TransportError::Io(io::Error::other(reason)).into()))
            }
            Some(Inbound::End) | None => {
                self.finish();
                None
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shared.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shared.releases.fetch_add(1, Ordering::SeqCst);
        self.closed.cancel();
        Ok(())
    }

    fn peer(&self) -> String {
        format!("memory:{}", self.label)
    }
}

impl MemoryPeer {
    /// Queues a message for the connection's reader. Returns `false` once the
    /// connection has been dropped.
    pub fn push(&self, message: Message) -> bool {
        self.inbound.send(Inbound::Message(message)).is_ok()
    }

    /// Queues a raw frame that goes through the JSON decoder.
    pub fn push_frame(&self, frame: impl Into<String>) -> bool {
        self.inbound.send(Inbound::Frame(frame.into())).is_ok()
    }

    /// Makes the next receive fail with a transport error.
    pub fn push_failure(&self, reason: impl Into<String>) -> bool {
        self.inbound.send(Inbound::Failure(reason.into())).is_ok()
    }

    /// Ends the inbound stream as if the remote side hung up.
    pub fn hang_up(&self) -> bool {
        self.inbound.send(Inbound::End).is_ok()
    }

    /// Makes every later `send` fail with an I/O error, as if the remote
    /// side reset the connection mid-write.
    pub fn fail_sends(&self) {
        self.shared.failing_sends.store(true, Ordering::Release);
    }

    /// Next message the hub sent on this connection, or `None` once the
    /// connection is gone and everything sent has been read.
    pub async fn next_sent(&mut self) -> Option<Message> {
        self.outbound.recv().await
    }

    pub fn try_next_sent(&mut self) -> Option<Message> {
        self.outbound.try_recv().ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Number of `close` calls, including no-op repeats.
    pub fn close_calls(&self) -> usize {
        self.shared.close_calls.load(Ordering::SeqCst)
    }

    /// Number of times the connection was actually released. Never above 1.
    pub fn releases(&self) -> usize {
        self.shared.releases.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn pushed_items_come_out_in_order() {
        let (connection, peer) = MemoryConnection::pair("a");
        peer.push(Message::join("rust"));
        peer.push_frame("{oops");
        peer.push(Message::logout());

        assert_eq!(connection.receive().await.unwrap().unwrap(), Message::join("rust"));
        assert!(matches!(
            connection.receive().await,
            Some(Err(ReceiveError::Decode(_)))
        ));
        assert_eq!(connection.receive().await.unwrap().unwrap(), Message::logout());
    }

    #[tokio::test]
    async fn transport_failure_is_terminal() {
        let (connection, peer) = MemoryConnection::pair("a");
        peer.push_failure("reset by peer");
        peer.push(Message::logout());

        let failure = connection.receive().await.unwrap().unwrap_err();
        assert!(failure.is_terminal());
        assert!(connection.receive().await.is_none());
    }

    #[tokio::test]
    async fn stalled_send_returns_once_closed() {
        let (connection, peer) = MemoryConnection::stalled("slow");
        let connection = Arc::new(connection);

        let sender = {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move { connection.send(&Message::logout()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!sender.is_finished());

        connection.close().await.unwrap();
        connection.close().await.unwrap();

        let result = timeout(Duration::from_secs(1), sender).await.unwrap().unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
        assert_eq!(peer.close_calls(), 2);
        assert_eq!(peer.releases(), 1);
    }

    #[tokio::test]
    async fn failing_sends_report_an_io_error() {
        let (connection, peer) = MemoryConnection::pair("a");
        peer.fail_sends();

        let result = connection.send(&Message::logout()).await;
        assert!(matches!(result, Err(TransportError::Io(_))));
    }

    #[tokio::test]
    async fn sent_messages_reach_the_peer() {
        let (connection, mut peer) = MemoryConnection::pair("a");
        connection.send(&Message::text("main", "hi")).await.unwrap();
        assert_eq!(peer.next_sent().await, Some(Message::text("main", "hi")));
        assert_eq!(peer.try_next_sent(), None);
    }
}
