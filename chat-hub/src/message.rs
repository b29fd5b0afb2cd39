use std::io;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::DecodeError;

const LINE_ENDINGS: &[u8] = b"\r\n";

/// Room that receives TEXT messages which do not name a room.
pub const DEFAULT_ROOM: &str = "main";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    #[serde(alias = "TEXT_MSG")]
    Text,
    JoinRoom,
    LeaveRoom,
    #[serde(alias = "LOGOUT_USER")]
    Logout,
}

/// One unit of chat traffic. `kind` decides which of the other fields matter:
/// TEXT uses `room` and `content`, JOIN_ROOM/LEAVE_ROOM use `room`, LOGOUT
/// uses neither.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(alias = "msgType")]
    pub kind: MessageKind,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: String,
    #[serde(default, alias = "channel", skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl Message {
    pub fn text(room: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Text,
            sender_id: String::new(),
            sender_name: String::new(),
            room: Some(room.into()),
            content: Some(content.into()),
        }
    }

    pub fn join(room: impl Into<String>) -> Self {
        Self::control(MessageKind::JoinRoom, Some(room.into()))
    }

    pub fn leave(room: impl Into<String>) -> Self {
        Self::control(MessageKind::LeaveRoom, Some(room.into()))
    }

    pub fn logout() -> Self {
        Self::control(MessageKind::Logout, None)
    }

    fn control(kind: MessageKind, room: Option<String>) -> Self {
        Self {
            kind,
            sender_id: String::new(),
            sender_name: String::new(),
            room,
            content: None,
        }
    }

    /// Returns a copy carrying the given sender identity.
    pub fn with_sender(&self, sender_id: &str, sender_name: &str) -> Self {
        Self {
            sender_id: sender_id.to_string(),
            sender_name: sender_name.to_string(),
            ..self.clone()
        }
    }

    /// Room a TEXT message is routed to; empty or missing means [`DEFAULT_ROOM`].
    pub fn target_room(&self) -> &str {
        match self.room.as_deref() {
            Some(room) if !room.trim().is_empty() => room,
            _ => DEFAULT_ROOM,
        }
    }

    /// Named room of a JOIN_ROOM/LEAVE_ROOM message, if it carries one.
    pub fn named_room(&self) -> Option<&str> {
        self.room
            .as_deref()
            .map(str::trim)
            .filter(|room| !room.is_empty())
    }

    pub fn decode(frame: impl AsRef<[u8]>) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(frame.as_ref())?)
    }
}

/// Longest frame accepted from a peer, line terminator excluded.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Reads the next non-empty line as raw bytes, without the line terminator.
/// The bytes are not checked for UTF-8; that is left to the decoder.
///
/// `Ok(None)` means the peer closed the stream. A line longer than
/// [`MAX_FRAME_LEN`] is an `InvalidData` error.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    // Simple line-oriented framing keeps interoperability with netcat-style tools.
    let mut line = Vec::new();
    loop {
        line.clear();
        let bytes = (&mut *reader)
            .take(MAX_FRAME_LEN as u64 + 1)
            .read_until(b'\n', &mut line)
            .await?;
        if bytes == 0 {
            return Ok(None);
        }
        if line.len() > MAX_FRAME_LEN && line.last() != Some(&b'\n') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame exceeds {MAX_FRAME_LEN} bytes"),
            ));
        }

        let trimmed = trim_line_ending(&line);
        if trimmed.is_empty() {
            continue;
        }

        return Ok(Some(trimmed.to_vec()));
    }
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let end = line
        .iter()
        .rposition(|byte| !LINE_ENDINGS.contains(byte))
        .map_or(0, |last| last + 1);
    &line[..end]
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    // Encode to JSON once, append a newline delimiter, and flush so peers get timely updates.
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
