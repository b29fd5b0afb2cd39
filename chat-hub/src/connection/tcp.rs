use std::{
    io,
    net::SocketAddr,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use serde::Serialize;
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;

use super::Connection;
use crate::{
    error::{ReceiveError, TransportError},
    message::{Message, read_frame, write_message},
};

/// Live connection: one JSON message per line over TCP.
pub struct TcpConnection {
    peer: SocketAddr,
    reader: Mutex<BufReader<OwnedReadHalf>>,
    writer: Mutex<OwnedWriteHalf>,
    closed: CancellationToken,
    released: AtomicBool,
    finished: AtomicBool,
}

impl TcpConnection {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(Self::from_parts(peer, BufReader::new(reader), writer))
    }

    /// Builds a connection from halves that were already used, e.g. for the
    /// login handshake. Bytes buffered in `reader` are not lost.
    pub fn from_parts(
        peer: SocketAddr,
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    ) -> Self {
        Self {
            peer,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: CancellationToken::new(),
            released: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Writes any serializable frame, e.g. the login reply, on the same
    /// line protocol the hub uses.
    pub async fn send_frame<T>(&self, frame: &T) -> Result<(), TransportError>
    where
        T: Serialize + Sync,
    {
        // Both the lock and the write race against close so a stalled peer
        // cannot keep `close` waiting on the writer.
        let mut writer = select! {
            biased;
            _ = self.closed.cancelled() => return Err(TransportError::Closed),
            writer = self.writer.lock() => writer,
        };
        select! {
            biased;
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            result = write_message(&mut *writer, frame) => result.map_err(TransportError::from),
        }
    }

    fn finish(&self) {
        self.finished.store(true, Ordering::Release);
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn send(&self, message: &Message) -> Result<(), TransportError> {
        self.send_frame(message).await
    }

    async fn receive(&self) -> Option<Result<Message, ReceiveError>> {
        if self.finished.load(Ordering::Acquire) {
            return None;
        }

        let mut reader = select! {
            biased;
            _ = self.closed.cancelled() => {
                self.finish();
                return None;
            }
            reader = self.reader.lock() => reader,
        };
        let frame = select! {
            biased;
            _ = self.closed.cancelled() => {
                self.finish();
                return None;
            }
            frame = read_frame(&mut *reader) => frame,
        };

        match frame {
            Ok(Some(frame)) => Some(Message::decode(&frame).map_err(ReceiveError::from)),
            Ok(None) => {
                self.finish();
                None
            }
            Err(err) => {
                self.finish();
                Some(Err(TransportError::Io(err).into()))
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.closed.cancel();

        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }

    fn peer(&self) -> String {
        self.peer.to_string()
    }
}
