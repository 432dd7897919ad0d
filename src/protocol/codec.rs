//! NDJSON codec for the agent channel.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a maximum line length so a
//! misbehaving peer cannot make either side allocate without bound. File
//! payloads travel inline in base64 chunks sized by [`max_chunk_bytes`], so
//! the limit is far larger than a typical control-channel limit.
//!
//! Use [`FrameCodec`] with [`tokio_util::codec::FramedRead`] (inbound) and
//! [`tokio_util::codec::FramedWrite`] (outbound).

use bytes::BytesMut;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Default maximum line length: 16 MiB.
pub const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1_048_576;

/// Default file transfer chunk: 4 MiB of raw bytes.
pub const DEFAULT_TRANSFER_CHUNK_BYTES: usize = 4 * 1_048_576;

/// Room left in a line for the envelope and path around a base64 payload.
const ENVELOPE_RESERVE_BYTES: usize = 8 * 1024;

/// Largest raw payload whose base64 form still fits in one line of
/// `max_line_bytes`.
#[must_use]
pub fn max_chunk_bytes(max_line_bytes: usize) -> usize {
    (max_line_bytes.saturating_sub(ENVELOPE_RESERVE_BYTES) / 4 * 3).max(1)
}

/// Line-framing codec for agent messages.
///
/// Inbound lines longer than the configured limit return
/// [`AppError::Protocol`]`("line too long: …")`; I/O errors map to
/// [`AppError::Io`]. The limit is not enforced when encoding.
#[derive(Debug)]
pub struct FrameCodec {
    lines: LinesCodec,
    max_line_bytes: usize,
}

impl FrameCodec {
    /// Create a codec with the [`DEFAULT_MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_line_bytes(DEFAULT_MAX_LINE_BYTES)
    }

    /// Create a codec with a custom line limit.
    #[must_use]
    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_line_bytes),
            max_line_bytes,
        }
    }

    fn map_error(&self, err: LinesCodecError) -> AppError {
        match err {
            LinesCodecError::MaxLineLengthExceeded => AppError::Protocol(format!(
                "line too long: exceeded {} bytes",
                self.max_line_bytes
            )),
            LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.lines.decode(src).map_err(|err| self.map_error(err))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.lines.decode_eof(src).map_err(|err| self.map_error(err))
    }
}

impl Encoder<String> for FrameCodec {
    type Error = AppError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        self.lines
            .encode(item, dst)
            .map_err(|err| self.map_error(err))
    }
}

/// Serialize a message to a single JSON line (without the newline).
///
/// # Errors
///
/// Returns [`AppError::Protocol`] if the value cannot be serialized.
pub fn to_line<T: Serialize>(message: &T) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}

/// Parse a single JSON line into a message.
///
/// # Errors
///
/// Returns [`AppError::Protocol`]`("invalid message: …")` for malformed JSON
/// or a shape that does not match `T`.
pub fn from_line<T: DeserializeOwned>(line: &str) -> Result<T> {
    Ok(serde_json::from_str(line.trim())?)
}

