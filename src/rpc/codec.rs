//! `Content-Length` framing for JSON-RPC streams.
//!
//! Each frame is an HTTP-style header block terminated by `\r\n\r\n`,
//! followed by exactly `Content-Length` bytes of UTF-8 JSON:
//!
//! ```text
//! Content-Length: 42\r\n
//! \r\n
//! {"jsonrpc":"2.0","id":"1","method":"ping"}
//! ```
//!
//! Headers other than `Content-Length` (e.g. `Content-Type`) are accepted
//! and ignored. Header names are matched case-insensitively.
//!
//! # Usage
//!
//! [`FrameCodec`] plugs into [`tokio_util::codec::FramedRead`]; the free
//! functions [`encode_frame`] and [`try_decode`] are the same logic without
//! the codec wrapper.
//!
//! ```rust,ignore
//! use tokio_util::codec::FramedRead;
//! use agent_link::rpc::codec::FrameCodec;
//!
//! let reader = FramedRead::new(child_stdout, FrameCodec::new());
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

use crate::rpc::message::Message;
use crate::{AppError, Result};

/// Largest body accepted by the decoder: 16 MiB.
///
/// A larger declared `Content-Length` fails the decode instead of reserving
/// buffer space for it.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Largest header block accepted before the `\r\n\r\n` terminator: 8 KiB.
pub const MAX_HEADER_BYTES: usize = 8 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Encode `payload` as a complete `Content-Length` frame.
///
/// # Errors
///
/// Returns [`AppError::Io`] if serialisation fails (not expected for
/// [`Value`]).
pub fn encode_frame(payload: &Value) -> Result<Bytes> {
    let body = serde_json::to_vec(payload)
        .map_err(|e| AppError::Io(format!("failed to serialise outbound message: {e}")))?;
    let header = format!("Content-Length: {}\r\n\r\n", body.len());

    let mut buf = BytesMut::with_capacity(header.len() + body.len());
    buf.put_slice(header.as_bytes());
    buf.put_slice(&body);
    Ok(buf.freeze())
}

/// Attempt to decode one complete message from the front of `buf`.
///
/// - `Ok(None)`: the header terminator or part of the body has not arrived
///   yet; `buf` is left untouched so more bytes can be appended.
/// - `Ok(Some(msg))`: one frame was consumed; any following bytes remain in
///   `buf`. Call again until `Ok(None)` to drain batched frames.
///
/// # Errors
///
/// Returns [`AppError::InvalidResponse`] for a missing or unparsable
/// `Content-Length`, an oversized frame, a body that is not UTF-8 JSON, or a
/// body that is not a well-formed JSON-RPC 2.0 message.
pub fn try_decode(buf: &mut BytesMut) -> Result<Option<Message>> {
    let Some(header_end) = find_terminator(buf) else {
        if buf.len() > MAX_HEADER_BYTES {
            return Err(AppError::InvalidResponse(format!(
                "header block exceeded {MAX_HEADER_BYTES} bytes without terminator"
            )));
        }
        return Ok(None);
    };

    let content_length = parse_content_length(&buf[..header_end])?;
    if content_length > MAX_FRAME_BYTES {
        return Err(AppError::InvalidResponse(format!(
            "frame too large: {content_length} bytes exceeds {MAX_FRAME_BYTES}"
        )));
    }

    let body_start = header_end + HEADER_TERMINATOR.len();
    let frame_end = body_start + content_length;
    if buf.len() < frame_end {
        buf.reserve(frame_end - buf.len());
        return Ok(None);
    }

    let frame = buf.split_to(frame_end);
    let body = std::str::from_utf8(&frame[body_start..])
        .map_err(|e| AppError::InvalidResponse(format!("body is not valid utf-8: {e}")))?;
    let value: Value = serde_json::from_str(body)?;

    Message::from_value(value).map(Some)
}

/// Codec producing [`Message`]s from a `Content-Length` framed byte stream.
///
/// # Decoder
///
/// Delegates to [`try_decode`]. At EOF, leftover bytes of an unfinished
/// frame yield [`AppError::ConnectionClosed`].
///
/// # Encoder
///
/// Encodes a [`Value`] via [`encode_frame`].
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new `FrameCodec`.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        try_decode(src)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match try_decode(src)? {
            Some(msg) => Ok(Some(msg)),
            None if src.is_empty() => Ok(None),
            None => Err(AppError::ConnectionClosed(format!(
                "stream ended inside a frame with {} bytes pending",
                src.len()
            ))),
        }
    }
}

impl Encoder<Value> for FrameCodec {
    type Error = AppError;

    fn encode(&mut self, item: Value, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&encode_frame(&item)?);
        Ok(())
    }
}

// ── Private helpers ───────────────────────────────────────────────────────────

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
}

/// Extract the `Content-Length` value from a raw header block.
fn parse_content_length(header: &[u8]) -> Result<usize> {
    let header = std::str::from_utf8(header)
        .map_err(|_| AppError::InvalidResponse("header block is not valid utf-8".into()))?;

    for line in header.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            return value.trim().parse::<usize>().map_err(|e| {
                AppError::InvalidResponse(format!(
                    "invalid Content-Length '{}': {e}",
                    value.trim()
                ))
            });
        }
    }

    Err(AppError::InvalidResponse(
        "missing Content-Length header".into(),
    ))
}
