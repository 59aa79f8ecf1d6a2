//! `Content-Length` codec for debug adapter streams.
//!
//! Wire format of a single message:
//!
//! ```text
//! Content-Length: 42\r\n
//! \r\n
//! {"seq":1,"type":"request","command":"next"}
//! ```
//!
//! Header lines may end in `\r\n` or a bare `\n`; the header block ends at
//! the first empty line. Each field is `name ':' SPACE* value`.
//!
//! The decoder never fails on malformed input. A header block without a
//! usable `Content-Length` moves the codec into [`FrameState::Stalled`] and
//! every later byte is discarded, so a corrupted stream simply stops
//! producing messages. A declared length above [`MAX_BODY_BYTES`] stalls
//! the same way; buffer growth never follows the declared length.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::{AppError, Result};

/// Name of the header field carrying the body length.
pub const CONTENT_LENGTH: &str = "Content-Length";

/// Largest header block accepted before the stream is considered corrupt.
pub const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Largest body accepted in either direction.
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Parse position within the inbound byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Looking for a header block terminated by an empty line.
    AwaitingHeader,
    /// Header consumed; waiting for this many body bytes.
    AwaitingBody(usize),
    /// An unparseable header was seen; input is discarded from now on.
    Stalled,
}

/// Header fields of one message, in wire order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameHeader {
    fields: Vec<(String, String)>,
}

impl FrameHeader {
    /// Parse a header block (without the terminating empty line).
    ///
    /// Lines without a colon are ignored.
    #[must_use]
    pub fn parse(block: &str) -> Self {
        let fields = block
            .split('\n')
            .map(|line| line.strip_suffix('\r').unwrap_or(line))
            .filter_map(|line| {
                let (name, value) = line.split_once(':')?;
                Some((
                    name.trim().to_owned(),
                    value.trim_start_matches(' ').to_owned(),
                ))
            })
            .collect();
        Self { fields }
    }

    /// Value of the first field named `name` (case-insensitive).
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(field, _)| field.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Declared body length, if present and a valid decimal number.
    #[must_use]
    pub fn content_length(&self) -> Option<usize> {
        self.get(CONTENT_LENGTH)?.trim_end().parse().ok()
    }
}

/// Incremental decoder / encoder for `Content-Length` framed messages.
///
/// Used with [`tokio_util::codec::FramedRead`] on the debuggee socket and
/// [`tokio_util::codec::FramedWrite`] for outbound requests. Decoded items
/// are message bodies; messages with an empty body are consumed without
/// producing an item.
#[derive(Debug)]
pub struct DapCodec {
    state: FrameState,
}

impl DapCodec {
    /// Create a codec positioned at the start of a header block.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: FrameState::AwaitingHeader,
        }
    }

    /// Current parse position.
    #[must_use]
    pub fn state(&self) -> FrameState {
        self.state
    }

    fn stall(&mut self, src: &mut BytesMut, reason: &str) {
        warn!(reason, "dap codec: unparseable header, discarding stream");
        self.state = FrameState::Stalled;
        src.clear();
    }
}

impl Default for DapCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Locate the end of the header block.
///
/// Returns `(header_len, consumed)`: the header text spans
/// `src[..header_len]` and the block including its terminating empty line
/// spans `src[..consumed]`.
fn find_header_end(src: &[u8]) -> Option<(usize, usize)> {
    let mut line_start = 0;
    while let Some(offset) = src[line_start..].iter().position(|&b| b == b'\n') {
        let newline = line_start + offset;
        let line = &src[line_start..newline];
        if line.is_empty() || line == b"\r" {
            return Some((line_start, newline + 1));
        }
        line_start = newline + 1;
    }
    None
}

impl Decoder for DapCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>> {
        loop {
            match self.state {
                FrameState::Stalled => {
                    src.clear();
                    return Ok(None);
                }
                FrameState::AwaitingBody(len) => {
                    if src.len() < len {
                        return Ok(None);
                    }
                    let body = src.split_to(len);
                    self.state = FrameState::AwaitingHeader;
                    if !body.is_empty() {
                        return Ok(Some(String::from_utf8_lossy(&body).into_owned()));
                    }
                }
                FrameState::AwaitingHeader => {
                    let Some((header_len, consumed)) = find_header_end(src) else {
                        if src.len() > MAX_HEADER_BYTES {
                            self.stall(src, "header block exceeds size limit");
                        }
                        return Ok(None);
                    };

                    // Stray empty lines between messages carry no header.
                    if header_len == 0 {
                        src.advance(consumed);
                        continue;
                    }

                    let header = FrameHeader::parse(&String::from_utf8_lossy(&src[..header_len]));
                    let Some(len) = header.content_length() else {
                        self.stall(src, "missing or invalid Content-Length");
                        return Ok(None);
                    };
                    if len > MAX_BODY_BYTES {
                        self.stall(src, "declared Content-Length exceeds body limit");
                        return Ok(None);
                    }

                    src.advance(consumed);
                    self.state = FrameState::AwaitingBody(len);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>> {
        // A truncated trailing message is dropped rather than reported.
        let item = self.decode(src)?;
        if item.is_none() {
            src.clear();
        }
        Ok(item)
    }
}

impl Encoder<String> for DapCodec {
    type Error = AppError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        <Self as Encoder<&str>>::encode(self, item.as_str(), dst)
    }
}

impl<'a> Encoder<&'a str> for DapCodec {
    type Error = AppError;

    /// Write `Content-Length: <n>\r\n\r\n<item>` into `dst`.
    ///
    /// Payloads above [`MAX_BODY_BYTES`] are rejected with `AppError::Framing`.
    fn encode(&mut self, item: &'a str, dst: &mut BytesMut) -> Result<()> {
        if item.len() > MAX_BODY_BYTES {
            return Err(AppError::Framing(format!(
                "payload of {} bytes exceeds the {MAX_BODY_BYTES} byte limit",
                item.len()
            )));
        }
        let header = format!("{CONTENT_LENGTH}: {}\r\n\r\n", item.len());
        dst.reserve(header.len() + item.len());
        dst.extend_from_slice(header.as_bytes());
        dst.extend_from_slice(item.as_bytes());
        Ok(())
    }
}
