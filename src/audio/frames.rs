//! # Frame Stream Parsing
//!
//! Recovers audio frames from the dictation client's upload. The upload looks
//! like multipart, but it is not: there is no length, no closing delimiter that
//! can be relied on, and per-frame headers are whatever the device felt like
//! sending. The only things we trust are the boundary token and the blank line
//! that separates a frame's headers from its payload.
//!
//! ## Wire Layout (one frame):
//! ```text
//! --<token>\r\n
//! Content-Type: ...\r\n
//! \r\n
//! <payload bytes>\r\n
//! --<token>...
//! ```
//!
//! ## Parsing Rules:
//! - Everything between two boundaries is a *candidate*; empty candidates are skipped
//! - A candidate without a blank line is malformed and silently dropped
//! - The payload loses its 2 trailing bytes (the CRLF before the next boundary)
//! - Bytes after the last boundary are discarded when the stream ends
//!
//! The parser is push-based ([`FrameParser::push`]) so it never needs the full
//! body: memory is bounded by the current unmatched tail. [`FrameStream`] wraps
//! it as a lazy `Stream` over the request body and caps the bytes it will read,
//! which also caps that tail.

use bytes::{Buf, Bytes, BytesMut};
use futures_util::Stream;
use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Separator between a frame's headers and its payload.
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Bytes stripped from the end of every payload.
const PAYLOAD_TRAILER_LEN: usize = 2;

/// Frames at the head of every upload that carry protocol preamble, not audio.
pub const PREAMBLE_FRAMES: usize = 3;

/// Above this many audio frames, the device's button clicks are trimmed.
pub const BUTTON_PRESS_THRESHOLD: usize = 15;

/// Audio frames dropped from the start when trimming button clicks.
pub const LEADING_CLICK_FRAMES: usize = 12;

/// Audio frames dropped from the end when trimming button clicks.
pub const TRAILING_CLICK_FRAMES: usize = 3;

/// One boundary-delimited audio chunk. The parser assumes nothing about its contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame(Bytes);

impl RawFrame {
    #[cfg(test)]
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// The delimiter separating frames, derived once per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Boundary(Vec<u8>);

impl Boundary {
    /// Extract the boundary from a `content-type` header value.
    ///
    /// ## Lenient Parsing:
    /// The device's header is not always valid MIME, so this mirrors what the
    /// legacy middleware did rather than implementing RFC 2046: take the text
    /// after the first `;`, then the text after the first `=` (up to any later
    /// `=`), and trim whitespace. Quotes are not removed. The on-wire delimiter
    /// is `--` followed by that token.
    ///
    /// Returns `None` when either split finds nothing to take or the token is empty.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let params = content_type.split(';').nth(1)?;
        let token = params.split('=').nth(1)?.trim();
        if token.is_empty() {
            return None;
        }

        let mut delimiter = Vec::with_capacity(token.len() + 2);
        delimiter.extend_from_slice(b"--");
        delimiter.extend_from_slice(token.as_bytes());
        Some(Self(delimiter))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Where the parser is within the current candidate frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    /// Looking for the blank line that ends the headers (or the next boundary,
    /// which means the candidate has no headers section and is malformed).
    CapturingHeader,
    /// Headers ended at `payload_start`; looking for the boundary that ends the payload.
    CapturingPayload { payload_start: usize },
}

/// Push-based state machine that turns body chunks into frames.
///
/// ## Usage:
/// ```ignore
/// let mut parser = FrameParser::new(boundary);
/// for chunk in body {
///     frames.extend(parser.push(&chunk));
/// }
/// let dropped = parser.finish();
/// ```
#[derive(Debug)]
pub struct FrameParser {
    boundary: Boundary,
    /// Bytes of the current candidate, from just after the last boundary
    buffer: BytesMut,
    state: ParseState,
    /// Offset in `buffer` before which no match can start (avoids rescanning)
    scan_from: usize,
    /// Offset of the first byte not yet searched for the header terminator
    header_scan_from: usize,
    malformed: usize,
}

impl FrameParser {
    pub fn new(boundary: Boundary) -> Self {
        Self {
            boundary,
            buffer: BytesMut::with_capacity(4096),
            state: ParseState::CapturingHeader,
            scan_from: 0,
            header_scan_from: 0,
            malformed: 0,
        }
    }

    /// Feed one block of the body and return every frame it completes.
    ///
    /// All boundary matches in the buffer are handled before returning, so a
    /// block holding many frames yields all of them. A boundary split across
    /// two blocks is found once its second half arrives.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<RawFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            match self.state {
                ParseState::CapturingHeader => {
                    let boundary_at = find(&self.buffer, self.boundary.as_bytes(), self.scan_from);
                    let search_end = boundary_at.unwrap_or(self.buffer.len());
                    let header_end = find(
                        &self.buffer[..search_end],
                        HEADER_TERMINATOR,
                        self.header_scan_from,
                    );

                    match (header_end, boundary_at) {
                        (Some(end), _) => {
                            self.state = ParseState::CapturingPayload {
                                payload_start: end + HEADER_TERMINATOR.len(),
                            };
                        }
                        (None, Some(at)) => {
                            if at > 0 {
                                self.malformed += 1;
                                tracing::debug!(
                                    candidate_len = at,
                                    "Dropping frame without header terminator"
                                );
                            }
                            self.consume_through_boundary(at);
                        }
                        (None, None) => {
                            self.header_scan_from =
                                rescan_offset(self.buffer.len(), HEADER_TERMINATOR.len());
                            self.scan_from =
                                rescan_offset(self.buffer.len(), self.boundary.as_bytes().len());
                            break;
                        }
                    }
                }
                ParseState::CapturingPayload { payload_start } => {
                    let from = self.scan_from.max(payload_start);
                    match find(&self.buffer, self.boundary.as_bytes(), from) {
                        Some(at) => {
                            let payload = &self.buffer[payload_start..at];
                            let keep = payload.len().saturating_sub(PAYLOAD_TRAILER_LEN);
                            let frame = Bytes::copy_from_slice(&payload[..keep]);
                            frames.push(RawFrame(frame));
                            self.consume_through_boundary(at);
                        }
                        None => {
                            self.scan_from =
                                rescan_offset(self.buffer.len(), self.boundary.as_bytes().len());
                            break;
                        }
                    }
                }
            }
        }

        frames
    }

    /// Signal end of stream. Returns the number of bytes discarded, i.e. the
    /// unterminated remainder after the last boundary.
    pub fn finish(self) -> usize {
        self.buffer.len()
    }

    /// Number of candidates dropped so far for lacking a header terminator.
    pub fn malformed_count(&self) -> usize {
        self.malformed
    }

    fn consume_through_boundary(&mut self, boundary_at: usize) {
        self.buffer.advance(boundary_at + self.boundary.as_bytes().len());
        self.state = ParseState::CapturingHeader;
        self.scan_from = 0;
        self.header_scan_from = 0;
    }
}

/// First index of `needle` in `haystack` at or after `from`.
fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from >= haystack.len() {
        return None;
    }

    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|offset| from + offset)
}

/// Earliest offset at which a match could still start once more bytes arrive.
fn rescan_offset(buffered: usize, needle_len: usize) -> usize {
    buffered.saturating_sub(needle_len.saturating_sub(1))
}

/// Failure reading the upload body.
#[derive(Debug)]
pub enum FrameStreamError {
    /// The body stream itself failed
    Read(String),
    /// More than `limit` body bytes arrived
    TooLarge { limit: usize },
}

impl fmt::Display for FrameStreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameStreamError::Read(msg) => write!(f, "failed to read upload body: {}", msg),
            FrameStreamError::TooLarge { limit } => {
                write!(f, "upload body exceeds {} bytes", limit)
            }
        }
    }
}

impl std::error::Error for FrameStreamError {}

/// Lazy, finite, non-restartable stream of frames over a body stream.
///
/// Each poll reads at most as much of the body as needed to produce the next
/// frame. When the body ends, the unterminated tail is logged and dropped and
/// the stream is exhausted for good. Reading more than `max_bytes` ends the
/// stream with [`FrameStreamError::TooLarge`].
pub struct FrameStream<S> {
    body: Option<S>,
    parser: Option<FrameParser>,
    ready: VecDeque<RawFrame>,
    bytes_read: usize,
    max_bytes: usize,
}

impl<S> FrameStream<S> {
    pub fn new(body: S, boundary: Boundary, max_bytes: usize) -> Self {
        Self {
            body: Some(body),
            parser: Some(FrameParser::new(boundary)),
            ready: VecDeque::new(),
            bytes_read: 0,
            max_bytes,
        }
    }

    fn abort(&mut self) {
        self.body = None;
        self.parser = None;
        self.ready.clear();
    }
}

impl<S, B, E> Stream for FrameStream<S>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: fmt::Display,
{
    type Item = Result<RawFrame, FrameStreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if let Some(frame) = this.ready.pop_front() {
                return Poll::Ready(Some(Ok(frame)));
            }

            let Some(body) = this.body.as_mut() else {
                return Poll::Ready(None);
            };

            match Pin::new(body).poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(chunk))) => {
                    let chunk = chunk.as_ref();
                    this.bytes_read += chunk.len();
                    if this.bytes_read > this.max_bytes {
                        this.abort();
                        return Poll::Ready(Some(Err(FrameStreamError::TooLarge {
                            limit: this.max_bytes,
                        })));
                    }
                    if let Some(parser) = this.parser.as_mut() {
                        this.ready.extend(parser.push(chunk));
                    }
                }
                Poll::Ready(Some(Err(err))) => {
                    this.abort();
                    return Poll::Ready(Some(Err(FrameStreamError::Read(err.to_string()))));
                }
                Poll::Ready(None) => {
                    this.body = None;
                    if let Some(parser) = this.parser.take() {
                        let malformed = parser.malformed_count();
                        let discarded = parser.finish();
                        tracing::debug!(
                            bytes_read = this.bytes_read,
                            discarded_tail = discarded,
                            malformed,
                            "Upload body finished"
                        );
                    }
                }
            }
        }
    }
}

/// Apply the device's fixed framing convention to the extracted frames.
///
/// 1. The first [`PREAMBLE_FRAMES`] frames are protocol preamble and are dropped.
/// 2. If more than [`BUTTON_PRESS_THRESHOLD`] frames remain, the first
///    [`LEADING_CLICK_FRAMES`] and last [`TRAILING_CLICK_FRAMES`] are dropped
///    (the clicks of the device's dictation button).
///
/// The thresholds are device constants, not tuned values.
pub fn trim_device_artifacts(frames: Vec<RawFrame>) -> Vec<RawFrame> {
    let audio: Vec<RawFrame> = frames.into_iter().skip(PREAMBLE_FRAMES).collect();

    if audio.len() > BUTTON_PRESS_THRESHOLD {
        let end = audio.len() - TRAILING_CLICK_FRAMES;
        audio
            .into_iter()
            .take(end)
            .skip(LEADING_CLICK_FRAMES)
            .collect()
    } else {
        audio
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{stream, StreamExt};

    const TOKEN: &str = "--Nuance_NMSP_test";

    fn boundary() -> Boundary {
        Boundary::from_content_type(&format!("multipart/form-data; boundary={}", TOKEN)).unwrap()
    }

    fn frame_part(payload: &[u8]) -> Vec<u8> {
        let mut part = Vec::new();
        part.extend_from_slice(b"--");
        part.extend_from_slice(TOKEN.as_bytes());
        part.extend_from_slice(b"\r\nContent-Type: application/octet-stream\r\n\r\n");
        part.extend_from_slice(payload);
        part.extend_from_slice(b"\r\n");
        part
    }

    fn body(payloads: &[&[u8]]) -> Vec<u8> {
        let mut body = Vec::new();
        for payload in payloads {
            body.extend(frame_part(payload));
        }
        body.extend_from_slice(b"--");
        body.extend_from_slice(TOKEN.as_bytes());
        body.extend_from_slice(b"--\r\n");
        body
    }

    fn parse_in_blocks(data: &[u8], block: usize) -> Vec<RawFrame> {
        let mut parser = FrameParser::new(boundary());
        let mut frames = Vec::new();
        for chunk in data.chunks(block) {
            frames.extend(parser.push(chunk));
        }
        frames
    }

    fn numbered_frames(count: usize) -> Vec<RawFrame> {
        (0..count).map(|i| RawFrame::new(vec![i as u8])).collect()
    }

    #[test]
    fn test_boundary_from_content_type() {
        let b = Boundary::from_content_type("multipart/form-data; boundary=abc123").unwrap();
        assert_eq!(b.as_bytes(), b"--abc123");

        // Whitespace around the token is trimmed, quotes are kept
        let b = Boundary::from_content_type("multipart/form-data;boundary= \"q\" ").unwrap();
        assert_eq!(b.as_bytes(), b"--\"q\"");

        // Only the text between the first and second '=' is used
        let b = Boundary::from_content_type("multipart/form-data; boundary=a=b").unwrap();
        assert_eq!(b.as_bytes(), b"--a");

        assert!(Boundary::from_content_type("multipart/form-data").is_none());
        assert!(Boundary::from_content_type("multipart/form-data; charset").is_none());
        assert!(Boundary::from_content_type("multipart/form-data; boundary=").is_none());
    }

    #[test]
    fn test_yields_every_frame_in_order() {
        let data = body(&[b"one", b"two", b"three", b"four"]);
        let frames = parse_in_blocks(&data, 4096);
        let payloads: Vec<&[u8]> = frames.iter().map(|f| f.as_bytes()).collect();
        assert_eq!(payloads, vec![&b"one"[..], b"two", b"three", b"four"]);
    }

    #[test]
    fn test_boundary_straddling_reads() {
        let data = body(&[b"alpha", b"beta", b"gamma"]);
        // Every block size forces boundaries and terminators to split somewhere
        for block in 1..=data.len() {
            let frames = parse_in_blocks(&data, block);
            assert_eq!(frames.len(), 3, "block size {}", block);
            assert_eq!(frames[1].as_bytes(), b"beta", "block size {}", block);
        }
    }

    #[test]
    fn test_no_boundary_yields_nothing() {
        let frames = parse_in_blocks(b"just some bytes\r\n\r\nwith a blank line", 8);
        assert!(frames.is_empty());
    }

    #[test]
    fn test_malformed_frame_is_dropped() {
        let mut data = frame_part(b"first");
        data.extend_from_slice(b"--");
        data.extend_from_slice(TOKEN.as_bytes());
        data.extend_from_slice(b"\r\nContent-Type: broken\r\nno blank line here\r\n");
        data.extend(body(&[b"second"]));

        let mut parser = FrameParser::new(boundary());
        let frames = parser.push(&data);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].as_bytes(), b"first");
        assert_eq!(frames[1].as_bytes(), b"second");
        assert_eq!(parser.malformed_count(), 1);
    }

    #[test]
    fn test_unterminated_tail_is_discarded() {
        let mut data = body(&[b"kept"]);
        data.extend(frame_part(b"never closed"));

        let mut parser = FrameParser::new(boundary());
        let frames = parser.push(&data);
        assert_eq!(frames.len(), 1);
        assert!(parser.finish() > 0);
    }

    #[test]
    fn test_payload_may_contain_blank_lines() {
        let frames = parse_in_blocks(&body(&[b"a\r\n\r\nb"]), 3);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_bytes(), b"a\r\n\r\nb");
    }

    #[test]
    fn test_short_payload_keeps_empty_frame() {
        // Headers followed directly by the boundary: nothing left after stripping
        let mut data = Vec::new();
        data.extend_from_slice(b"--");
        data.extend_from_slice(TOKEN.as_bytes());
        data.extend_from_slice(b"\r\nX: y\r\n\r\n\r\n");
        data.extend(body(&[b"next"]));

        let frames = parse_in_blocks(&data, 5);
        assert_eq!(frames.len(), 2);
        assert!(frames[0].as_bytes().is_empty());
        assert_eq!(frames[1].as_bytes(), b"next");
    }

    #[tokio::test]
    async fn test_frame_stream_over_chunks() {
        let data = body(&[b"x1", b"x2", b"x3"]);
        let chunks: Vec<Result<Bytes, std::io::Error>> = data
            .chunks(7)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();

        let frames: Vec<_> = FrameStream::new(stream::iter(chunks), boundary(), usize::MAX)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2].as_bytes(), b"x3");
    }

    #[tokio::test]
    async fn test_frame_stream_surfaces_read_errors() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from(frame_part(b"ok"))),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ];

        let mut frames = FrameStream::new(stream::iter(chunks), boundary(), usize::MAX);
        let first = frames.next().await.unwrap();
        assert!(matches!(first, Err(FrameStreamError::Read(_))));
        assert!(frames.next().await.is_none());
    }

    #[tokio::test]
    async fn test_frame_stream_stops_at_byte_limit() {
        // 64 KiB with no boundary at all: nothing would ever be emitted
        let chunks: Vec<Result<Bytes, std::io::Error>> =
            (0..16).map(|_| Ok(Bytes::from(vec![b'a'; 4096]))).collect();

        let mut frames = FrameStream::new(stream::iter(chunks), boundary(), 10_000);
        let first = frames.next().await.unwrap();
        assert!(matches!(first, Err(FrameStreamError::TooLarge { limit: 10_000 })));
        assert!(frames.next().await.is_none());
    }

    #[tokio::test]
    async fn test_frame_stream_within_byte_limit() {
        let data = body(&[b"x1", b"x2"]);
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![Ok(Bytes::from(data.clone()))];

        let frames: Vec<_> = FrameStream::new(stream::iter(chunks), boundary(), data.len())
            .collect::<Vec<_>>()
            .await;
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.is_ok()));
    }

    #[test]
    fn test_trim_twenty_frames_leaves_two() {
        let trimmed = trim_device_artifacts(numbered_frames(20));
        // 3 preamble dropped, 17 remain, 12 leading and 3 trailing dropped
        assert_eq!(trimmed.len(), 2);
        assert_eq!(trimmed[0].as_bytes(), &[15]);
        assert_eq!(trimmed[1].as_bytes(), &[16]);
    }

    #[test]
    fn test_trim_at_threshold_only_drops_preamble() {
        let trimmed = trim_device_artifacts(numbered_frames(18));
        assert_eq!(trimmed.len(), 15);
        assert_eq!(trimmed[0].as_bytes(), &[3]);

        assert_eq!(trim_device_artifacts(numbered_frames(5)).len(), 2);
        assert!(trim_device_artifacts(numbered_frames(2)).is_empty());
    }
}
