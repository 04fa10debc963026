//! Marker-delimited framing over a byte stream
//!
//! Wire format: `FRAME_MARKER + escape(json(packet)) + FRAME_MARKER`.
//!
//! Escaping doubles every literal [`ESCAPE_TOKEN`] first and then prefixes every
//! literal [`FRAME_MARKER`] with an escape token. Both tokens start with `[` and
//! contain no other `[`, so an escaped payload can never contain a bare marker and
//! a left-to-right scan recovers frame boundaries unambiguously.

use bytes::{Buf, BytesMut};

use crate::core::packet::Packet;
use crate::error::{NetworkError, Result};

/// Start/end delimiter of a frame
pub const FRAME_MARKER: &str = "[FLAG]";

/// Escape prefix for literal markers and escape tokens inside a payload
pub const ESCAPE_TOKEN: &str = "[ESC]";

/// Maximum size of a single frame (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const MARKER: &[u8] = FRAME_MARKER.as_bytes();
const ESCAPE: &[u8] = ESCAPE_TOKEN.as_bytes();

/// Escape a payload so it can sit between two markers
#[must_use]
pub fn escape(payload: &str) -> String {
    let doubled = format!("{ESCAPE_TOKEN}{ESCAPE_TOKEN}");
    let prefixed = format!("{ESCAPE_TOKEN}{FRAME_MARKER}");
    payload
        .replace(ESCAPE_TOKEN, &doubled)
        .replace(FRAME_MARKER, &prefixed)
}

/// Reverse [`escape`]
///
/// Fails on a dangling escape token or on a bare marker.
pub fn unescape(escaped: &str) -> Result<String> {
    let mut out = String::with_capacity(escaped.len());
    let mut rest = escaped;

    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix(ESCAPE_TOKEN) {
            if let Some(tail) = after.strip_prefix(ESCAPE_TOKEN) {
                out.push_str(ESCAPE_TOKEN);
                rest = tail;
            } else if let Some(tail) = after.strip_prefix(FRAME_MARKER) {
                out.push_str(FRAME_MARKER);
                rest = tail;
            } else {
                return Err(NetworkError::framing("Dangling escape token"));
            }
        } else if rest.starts_with(FRAME_MARKER) {
            return Err(NetworkError::framing("Unescaped marker inside frame"));
        } else {
            let mut chars = rest.chars();
            if let Some(c) = chars.next() {
                out.push(c);
            }
            rest = chars.as_str();
        }
    }

    Ok(out)
}

/// Frame a packet for transmission
pub fn frame(packet: &Packet) -> Result<String> {
    let wire = packet.to_wire_string()?;
    let escaped = escape(&wire);
    if escaped.len() + 2 * MARKER.len() > MAX_FRAME_SIZE {
        return Err(NetworkError::framing(format!(
            "Frame too large: {} bytes (max: {} bytes)",
            escaped.len() + 2 * MARKER.len(),
            MAX_FRAME_SIZE
        )));
    }

    let mut out = String::with_capacity(escaped.len() + 2 * MARKER.len());
    out.push_str(FRAME_MARKER);
    out.push_str(&escaped);
    out.push_str(FRAME_MARKER);
    Ok(out)
}

/// Parse one complete frame (markers included) back into a packet
pub fn unframe(framed: &str) -> Result<Packet> {
    let inner = framed
        .strip_prefix(FRAME_MARKER)
        .and_then(|s| s.strip_suffix(FRAME_MARKER))
        .ok_or_else(|| NetworkError::framing("Frame is not wrapped in markers"))?;

    if inner.is_empty() {
        return Err(NetworkError::framing("Empty frame"));
    }

    let wire = unescape(inner)?;
    Packet::from_wire_str(&wire)
}

/// `true` when `rest` is too short to tell whether it starts with `token`
fn is_partial(rest: &[u8], token: &[u8]) -> bool {
    rest.len() < token.len() && token.starts_with(rest)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Incremental frame extractor for one connection
///
/// Bytes are appended as they arrive; [`FrameDecoder::decode`] yields complete
/// frames and keeps any trailing partial frame for the next read.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    /// Scan offset inside the current frame; avoids rescanning on every read
    scan_pos: usize,
    max_frame_size: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a decoder with the default frame size limit
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Create a decoder with a custom frame size limit
    #[must_use]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            scan_pos: 0,
            max_frame_size,
        }
    }

    /// Mutable access to the accumulation buffer (for `read_buf`)
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Append received bytes
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet consumed
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Extract the next complete frame
    ///
    /// Returns `Ok(None)` when more bytes are needed. A malformed frame is reported as
    /// an error so the caller can log it and keep decoding. Its closing marker stays
    /// buffered: after a truncated frame that marker is the start of the next one.
    pub fn decode(&mut self) -> Result<Option<Packet>> {
        loop {
            if self.scan_pos == 0 && !self.align_to_marker() {
                return Ok(None);
            }

            let Some(end) = self.find_closing_marker() else {
                if self.buf.len() > self.max_frame_size {
                    let dropped = self.buf.len();
                    self.buf.clear();
                    self.scan_pos = 0;
                    return Err(NetworkError::framing(format!(
                        "Partial frame exceeded {} bytes, dropped {} bytes",
                        self.max_frame_size, dropped
                    )));
                }
                return Ok(None);
            };
            self.scan_pos = 0;

            // Adjacent markers: the first one closed a frame whose start we never saw
            if end == 2 * MARKER.len() {
                self.buf.advance(MARKER.len());
                continue;
            }

            let parsed = std::str::from_utf8(&self.buf[..end])
                .map_err(|e| NetworkError::framing(format!("Invalid UTF-8 in frame: {}", e)))
                .and_then(unframe);

            return match parsed {
                Ok(packet) => {
                    self.buf.advance(end);
                    Ok(Some(packet))
                }
                Err(e) => {
                    self.buf.advance(end - MARKER.len());
                    Err(e)
                }
            };
        }
    }

    /// Drop garbage before the start marker; `false` if no start marker is buffered yet
    fn align_to_marker(&mut self) -> bool {
        match find(&self.buf, MARKER) {
            Some(0) => {}
            Some(start) => {
                tracing::warn!("Discarding {} bytes preceding frame marker", start);
                self.buf.advance(start);
            }
            None => {
                // Keep a possible marker prefix at the tail
                let keep = (1..MARKER.len())
                    .rev()
                    .find(|&n| n <= self.buf.len() && MARKER.starts_with(&self.buf[self.buf.len() - n..]))
                    .unwrap_or(0);
                let discard = self.buf.len() - keep;
                if discard > 0 {
                    tracing::warn!("Discarding {} bytes with no frame marker", discard);
                    self.buf.advance(discard);
                }
                return false;
            }
        }
        self.scan_pos = MARKER.len();
        true
    }

    /// Walk the escaped body; returns the end offset (exclusive) of the frame
    fn find_closing_marker(&mut self) -> Option<usize> {
        let mut pos = self.scan_pos;

        while pos < self.buf.len() {
            let rest = &self.buf[pos..];

            if rest.starts_with(ESCAPE) {
                let after = &rest[ESCAPE.len()..];
                if after.starts_with(ESCAPE) {
                    pos += 2 * ESCAPE.len();
                } else if after.starts_with(MARKER) {
                    pos += ESCAPE.len() + MARKER.len();
                } else if is_partial(after, ESCAPE) || is_partial(after, MARKER) {
                    break;
                } else {
                    // Not a real escape sequence; unframe will reject the frame
                    pos += ESCAPE.len();
                }
            } else if rest.starts_with(MARKER) {
                return Some(pos + MARKER.len());
            } else if is_partial(rest, ESCAPE) || is_partial(rest, MARKER) {
                break;
            } else {
                pos += 1;
            }
        }

        self.scan_pos = pos;
        None
    }
}
