//! Wire protocol definitions
//!
//! Three framings share one connection:
//! - Handshake: the raw display name (at most 31 bytes), echoed back verbatim.
//! - Client → Server: one chat line per `\n`, at most 255 bytes per read.
//! - Server → Client: a fixed 288-byte record, a 32-byte name field followed
//!   by a 256-byte text field, both zero padded. The field capacities are the
//!   framing; there is no length prefix. The record is made of byte arrays
//!   only, so its layout does not depend on the platform.

use std::borrow::Cow;
use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum display-name length in bytes
pub const NAME_CAPACITY: usize = 31;
/// Maximum chat-text length in bytes
pub const TEXT_CAPACITY: usize = 255;
/// Size of the name field on the wire (capacity + terminating zero)
pub const NAME_FIELD_LEN: usize = NAME_CAPACITY + 1;
/// Size of the text field on the wire (capacity + terminating zero)
pub const TEXT_FIELD_LEN: usize = TEXT_CAPACITY + 1;
/// Size of one server → client record
pub const WIRE_MESSAGE_LEN: usize = NAME_FIELD_LEN + TEXT_FIELD_LEN;

/// Fixed-layout chat record relayed from the server to every other client
#[derive(Clone, PartialEq, Eq)]
pub struct WireMessage {
    name: [u8; NAME_FIELD_LEN],
    text: [u8; TEXT_FIELD_LEN],
}

impl WireMessage {
    /// Build a record, truncating each field to its capacity
    pub fn new(name: &[u8], text: &[u8]) -> Self {
        let mut msg = Self {
            name: [0; NAME_FIELD_LEN],
            text: [0; TEXT_FIELD_LEN],
        };
        let n = name.len().min(NAME_CAPACITY);
        msg.name[..n].copy_from_slice(&name[..n]);
        let n = text.len().min(TEXT_CAPACITY);
        msg.text[..n].copy_from_slice(&text[..n]);
        msg
    }

    /// Sender's display name (bytes before the first zero)
    pub fn name(&self) -> &[u8] {
        until_zero(&self.name)
    }

    /// Chat text (bytes before the first zero)
    pub fn text(&self) -> &[u8] {
        until_zero(&self.text)
    }

    pub fn name_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.name())
    }

    pub fn text_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.text())
    }

    /// Serialize into the 288-byte wire record
    pub fn encode(&self) -> [u8; WIRE_MESSAGE_LEN] {
        let mut buf = [0u8; WIRE_MESSAGE_LEN];
        buf[..NAME_FIELD_LEN].copy_from_slice(&self.name);
        buf[NAME_FIELD_LEN..].copy_from_slice(&self.text);
        buf
    }

    /// Parse a 288-byte wire record
    ///
    /// The last byte of each field is forced to zero so accessors never read
    /// past the capacity.
    pub fn decode(buf: &[u8; WIRE_MESSAGE_LEN]) -> Self {
        let mut msg = Self {
            name: [0; NAME_FIELD_LEN],
            text: [0; TEXT_FIELD_LEN],
        };
        msg.name[..NAME_CAPACITY].copy_from_slice(&buf[..NAME_CAPACITY]);
        msg.text[..TEXT_CAPACITY]
            .copy_from_slice(&buf[NAME_FIELD_LEN..NAME_FIELD_LEN + TEXT_CAPACITY]);
        msg
    }

    /// Read exactly one record
    pub async fn read_from<R>(reader: &mut R) -> io::Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; WIRE_MESSAGE_LEN];
        reader.read_exact(&mut buf).await?;
        Ok(Self::decode(&buf))
    }

    /// Write the full record
    pub async fn write_to<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.encode()).await
    }
}

impl std::fmt::Display for WireMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} : {}", self.name_lossy(), self.text_lossy())
    }
}

impl std::fmt::Debug for WireMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireMessage")
            .field("name", &self.name_lossy())
            .field("text", &self.text_lossy())
            .finish()
    }
}

fn until_zero(field: &[u8]) -> &[u8] {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    &field[..end]
}

/// Truncate a string to at most `max` bytes without splitting a character
pub fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Encode one outgoing chat line: text up to the first newline, truncated to
/// `TEXT_CAPACITY`, terminated by `\n`
pub fn encode_line(text: &str) -> Vec<u8> {
    let line = text.split('\n').next().unwrap_or_default();
    let line = truncate_utf8(line, TEXT_CAPACITY);
    let mut out = Vec::with_capacity(line.len() + 1);
    out.extend_from_slice(line.as_bytes());
    out.push(b'\n');
    out
}

/// Read one chat line (at most `TEXT_CAPACITY` bytes) into `buf`
///
/// Returns the number of bytes consumed from the stream; zero means EOF.
/// The terminator and a trailing `\r` are stripped from `buf`. A longer line
/// comes back as successive chunks.
pub async fn read_text_frame<R>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let n = (&mut *reader)
        .take(TEXT_CAPACITY as u64)
        .read_until(b'\n', buf)
        .await?;
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    Ok(n)
}
