//! Protocol codec for framing and decoding memory-read responses
//!
//! Two framing strategies are available. `SingleRead` treats whatever a
//! single receive returned as the whole response. `Line` accumulates until a
//! newline arrives or the full hex payload for the request is buffered.

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::MAX_RESPONSE_SIZE;

/// Codec errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("Empty response")]
    EmptyResponse,

    #[error("Odd number of hex digits: {0}")]
    OddLength(usize),

    #[error("Invalid hex digit {byte:#04x} at position {position}")]
    InvalidHexDigit { position: usize, byte: u8 },

    #[error("Response length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Remote error reply E{0:02x}")]
    Remote(u8),

    #[error("Response too large: {0} bytes (max: {1})")]
    ResponseTooLarge(usize, usize),
}

/// How a response is delimited on the stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FramingMode {
    /// Newline-terminated, or complete once the expected hex length arrived
    #[default]
    Line,
    /// One receive of up to `SINGLE_READ_BUFFER_SIZE` bytes is the response
    SingleRead,
}

/// Extracts responses from the read buffer
#[derive(Debug, Default)]
pub struct Decoder {
    framing: FramingMode,
    /// A length-framed response was taken; its line terminator may still follow
    pending_terminator: bool,
}

impl Decoder {
    pub fn new(framing: FramingMode) -> Self {
        Self {
            framing,
            pending_terminator: false,
        }
    }

    pub fn framing(&self) -> FramingMode {
        self.framing
    }

    /// Attempt to decode a response of `expected_len` bytes from the buffer.
    /// Returns Ok(None) if more data is needed
    pub fn decode(
        &mut self,
        buf: &mut BytesMut,
        expected_len: usize,
    ) -> Result<Option<Vec<u8>>, CodecError> {
        match self.framing {
            FramingMode::SingleRead => {
                if buf.is_empty() {
                    return Ok(None);
                }
                let frame = buf.split();
                parse_response(&frame, expected_len).map(Some)
            }
            FramingMode::Line => {
                self.skip_terminator(buf);
                if self.pending_terminator {
                    return Ok(None);
                }

                if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                    let frame = buf.split_to(pos + 1);
                    return parse_response(&frame, expected_len).map(Some);
                }

                let leading = buf.iter().take_while(|b| b.is_ascii_whitespace()).count();
                let hex_len = expected_len * 2;
                if hex_len > 0 && buf.len() - leading >= hex_len {
                    buf.advance(leading);
                    let frame = buf.split_to(hex_len);
                    self.pending_terminator = true;
                    self.skip_terminator(buf);
                    return parse_response(&frame, expected_len).map(Some);
                }

                // Room for the full payload plus a CRLF terminator
                let limit = MAX_RESPONSE_SIZE.max(hex_len.saturating_add(2));
                if buf.len() > limit {
                    return Err(CodecError::ResponseTooLarge(buf.len(), limit));
                }

                Ok(None)
            }
        }
    }

    /// Bytes left in the buffer once a response was decoded, ignoring a
    /// pending line terminator. Anything counted here was not asked for
    pub fn stray_len(&mut self, buf: &mut BytesMut) -> usize {
        if self.framing == FramingMode::Line {
            self.skip_terminator(buf);
        }
        buf.len()
    }

    /// Drop the `\r\n` that ends a length-framed response, however it is
    /// split across reads
    fn skip_terminator(&mut self, buf: &mut BytesMut) {
        while self.pending_terminator {
            match buf.first().copied() {
                Some(b'\r') => buf.advance(1),
                Some(b'\n') => {
                    buf.advance(1);
                    self.pending_terminator = false;
                }
                Some(_) => self.pending_terminator = false,
                None => break,
            }
        }
    }

    /// Decode whatever is left once the peer closed the stream.
    /// Returns Ok(None) if nothing but whitespace remained
    pub fn decode_eof(
        &mut self,
        buf: &mut BytesMut,
        expected_len: usize,
    ) -> Result<Option<Vec<u8>>, CodecError> {
        if trim_whitespace(&buf[..]).is_empty() {
            buf.clear();
            return Ok(None);
        }
        let frame = buf.split();
        parse_response(&frame, expected_len).map(Some)
    }
}

/// Parse one framed response into raw bytes
pub fn parse_response(frame: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
    let text = trim_whitespace(frame);
    if text.is_empty() {
        return Err(CodecError::EmptyResponse);
    }

    if let Some(code) = error_reply(text) {
        return Err(CodecError::Remote(code));
    }

    let bytes = decode_hex(text)?;
    if bytes.len() != expected_len {
        return Err(CodecError::LengthMismatch {
            expected: expected_len,
            actual: bytes.len(),
        });
    }
    Ok(bytes)
}

/// Decode hex text (either case) into bytes
pub fn decode_hex(text: &[u8]) -> Result<Vec<u8>, CodecError> {
    if text.len() % 2 != 0 {
        return Err(CodecError::OddLength(text.len()));
    }

    text.chunks_exact(2)
        .enumerate()
        .map(|(i, pair)| {
            let hi = nibble(pair[0]).ok_or(CodecError::InvalidHexDigit {
                position: i * 2,
                byte: pair[0],
            })?;
            let lo = nibble(pair[1]).ok_or(CodecError::InvalidHexDigit {
                position: i * 2 + 1,
                byte: pair[1],
            })?;
            Ok((hi << 4) | lo)
        })
        .collect()
}

/// Encode bytes as lowercase hex text
pub fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// `E<nn>` error replies
fn error_reply(text: &[u8]) -> Option<u8> {
    match text {
        [b'E', hi, lo] => Some((nibble(*hi)? << 4) | nibble(*lo)?),
        _ => None,
    }
}

fn trim_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |p| p + 1);
    &bytes[start..end]
}
