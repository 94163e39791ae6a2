use std::io;

use chrono::{DateTime, Local};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Format used for the timestamp prefix of every relayed line.
pub const TIMESTAMP_FORMAT: &str = "%H:%M:%S";

/// A single unit sent by a client after its handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Text { text: String },
    Disconnect,
}

impl Message {
    pub fn text(text: impl Into<String>) -> Self {
        Message::Text { text: text.into() }
    }

    pub fn disconnect() -> Self {
        Message::Disconnect
    }

    pub fn is_disconnect(&self) -> bool {
        matches!(self, Message::Disconnect)
    }

    /// Payload of a text message; `None` for a disconnect.
    pub fn text_payload(&self) -> Option<&str> {
        match self {
            Message::Text { text } => Some(text),
            Message::Disconnect => None,
        }
    }
}

/// Something the relay tells every participant about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Announcement {
    Chat { name: String, text: String },
    Joined { name: String },
    Left { name: String },
}

impl Announcement {
    pub fn render(&self, at: DateTime<Local>) -> String {
        let stamp = at.format(TIMESTAMP_FORMAT);
        match self {
            Announcement::Chat { name, text } => format!("{stamp} {name}: {text}"),
            Announcement::Joined { name } => format!("{stamp} {name} connected."),
            Announcement::Left { name } => format!("{stamp} {name} disconnected."),
        }
    }
}

pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    // One JSON value per line; blank lines are keep-alives from netcat-style tools.
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        let parsed = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
