use bytes::{Bytes, BytesMut};
use thiserror::Error;

use crate::endpoint::Endpoint;

/// Terminating request chunk: zero-length chunk plus the final blank line.
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

const MAX_RESPONSE_HEADERS: usize = 64;

/// Encodes the request head for a streaming upload.
///
/// The body is announced as `Transfer-Encoding: chunked` so it can be
/// produced incrementally with no length known up front.
pub fn encode_request_head(endpoint: &Endpoint, token: &str) -> Vec<u8> {
    let mut head = Vec::with_capacity(128 + endpoint.target.len() + token.len());
    head.extend_from_slice(b"POST ");
    head.extend_from_slice(endpoint.target.as_bytes());
    head.extend_from_slice(b" HTTP/1.1\r\nHost: ");
    head.extend_from_slice(endpoint.host.as_bytes());
    head.extend_from_slice(b"\r\nConnection: keep-alive\r\nTransfer-Encoding: chunked\r\n");
    head.extend_from_slice(b"Authorization: Bearer ");
    head.extend_from_slice(token.as_bytes());
    head.extend_from_slice(b"\r\n\r\n");
    head
}

/// Frames one payload as an HTTP chunk: hex size line, payload, CRLF.
///
/// A zero-length chunk is the body terminator on the wire, so empty
/// payloads encode to nothing.
pub fn encode_chunk(payload: &[u8]) -> Vec<u8> {
    if payload.is_empty() {
        return Vec::new();
    }
    let mut frame = Vec::with_capacity(payload.len() + 16);
    frame.extend_from_slice(format!("{:x}\r\n", payload.len()).as_bytes());
    frame.extend_from_slice(payload);
    frame.extend_from_slice(b"\r\n");
    frame
}

/// One parsed unit of the response stream, in wire order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ResponseEvent {
    /// Status line of the response head.
    Status { code: u16 },
    /// One slice of body payload. Chunked framing is already removed;
    /// a single wire chunk may span several events when it arrives split
    /// across reads.
    Chunk(Bytes),
    /// The body is complete. Never emitted for close-delimited bodies,
    /// where completion is the connection closing.
    End,
}

/// Errors for response bytes that cannot be parsed.
#[derive(Debug, Error)]
pub enum HttpParseError {
    #[error("malformed response head: {0}")]
    Head(#[from] httparse::Error),

    #[error("invalid content-length: {0}")]
    ContentLength(String),

    #[error("invalid chunk size line: {0}")]
    ChunkSize(String),

    #[error("chunk payload not followed by CRLF")]
    ChunkPadding,
}

#[derive(Clone, Copy, Debug)]
enum ParseState {
    Head,
    ChunkSize,
    ChunkData { remaining: usize },
    ChunkPadding,
    Trailers,
    Counted { remaining: u64 },
    UntilClose,
    Done,
}

enum BodyFraming {
    Chunked,
    Counted(u64),
    UntilClose,
}

/// Incremental HTTP/1.1 response parser.
///
/// Feed it raw connection bytes as they arrive; each call appends the
/// events those bytes completed. Unconsumed bytes are buffered across
/// calls, so feeding one byte at a time yields the same event stream as
/// feeding the whole response at once.
#[derive(Debug)]
pub struct ResponseParser {
    buf: BytesMut,
    state: ParseState,
}

impl ResponseParser {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            state: ParseState::Head,
        }
    }

    /// Consumes `data`, appending the response events it completed to
    /// `events`. Events decoded before a parse error are still appended,
    /// so delivery does not depend on how the bytes were segmented.
    pub fn feed(
        &mut self,
        data: &[u8],
        events: &mut Vec<ResponseEvent>,
    ) -> Result<(), HttpParseError> {
        self.buf.extend_from_slice(data);
        while self.step(events)? {}
        Ok(())
    }

    // One parse step. Returns false when no further progress is possible
    // without more input.
    fn step(&mut self, events: &mut Vec<ResponseEvent>) -> Result<bool, HttpParseError> {
        match self.state {
            ParseState::Head => self.parse_head(events),
            ParseState::ChunkSize => self.parse_chunk_size(),
            ParseState::ChunkData { remaining } => {
                if self.buf.is_empty() {
                    return Ok(false);
                }
                let take = remaining.min(self.buf.len());
                events.push(ResponseEvent::Chunk(self.buf.split_to(take).freeze()));
                self.state = if take == remaining {
                    ParseState::ChunkPadding
                } else {
                    ParseState::ChunkData {
                        remaining: remaining - take,
                    }
                };
                Ok(true)
            }
            ParseState::ChunkPadding => {
                if self.buf.len() < 2 {
                    return Ok(false);
                }
                let pad = self.buf.split_to(2);
                if &pad[..] != b"\r\n" {
                    return Err(HttpParseError::ChunkPadding);
                }
                self.state = ParseState::ChunkSize;
                Ok(true)
            }
            ParseState::Trailers => {
                let Some(line_end) = find_crlf(&self.buf) else {
                    return Ok(false);
                };
                let _ = self.buf.split_to(line_end + 2);
                if line_end == 0 {
                    events.push(ResponseEvent::End);
                    self.state = ParseState::Done;
                }
                Ok(true)
            }
            ParseState::Counted { remaining } => {
                if self.buf.is_empty() {
                    return Ok(false);
                }
                let take = remaining.min(self.buf.len() as u64) as usize;
                events.push(ResponseEvent::Chunk(self.buf.split_to(take).freeze()));
                let remaining = remaining - take as u64;
                if remaining == 0 {
                    events.push(ResponseEvent::End);
                    self.state = ParseState::Done;
                } else {
                    self.state = ParseState::Counted { remaining };
                }
                Ok(true)
            }
            ParseState::UntilClose => {
                if self.buf.is_empty() {
                    return Ok(false);
                }
                let len = self.buf.len();
                events.push(ResponseEvent::Chunk(self.buf.split_to(len).freeze()));
                Ok(true)
            }
            ParseState::Done => {
                // Anything after the body end is not ours to interpret.
                self.buf.clear();
                Ok(false)
            }
        }
    }

    fn parse_head(&mut self, events: &mut Vec<ResponseEvent>) -> Result<bool, HttpParseError> {
        let (head_len, code, framing) = {
            let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
            let mut response = httparse::Response::new(&mut headers);
            match response.parse(&self.buf)? {
                httparse::Status::Partial => return Ok(false),
                httparse::Status::Complete(head_len) => {
                    let code = response
                        .code
                        .ok_or(HttpParseError::Head(httparse::Error::Status))?;
                    (head_len, code, body_framing(code, response.headers)?)
                }
            }
        };

        let _ = self.buf.split_to(head_len);
        events.push(ResponseEvent::Status { code });
        self.state = match framing {
            BodyFraming::Chunked => ParseState::ChunkSize,
            BodyFraming::Counted(0) => {
                events.push(ResponseEvent::End);
                ParseState::Done
            }
            BodyFraming::Counted(remaining) => ParseState::Counted { remaining },
            BodyFraming::UntilClose => ParseState::UntilClose,
        };
        Ok(true)
    }

    fn parse_chunk_size(&mut self) -> Result<bool, HttpParseError> {
        let Some(line_end) = find_crlf(&self.buf) else {
            return Ok(false);
        };
        let line = self.buf.split_to(line_end + 2);
        let text = std::str::from_utf8(&line[..line_end])
            .map_err(|_| HttpParseError::ChunkSize(String::from_utf8_lossy(&line[..line_end]).into_owned()))?;
        // Chunk extensions after ';' are allowed but carry nothing we need.
        let size_hex = text.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_hex, 16)
            .map_err(|_| HttpParseError::ChunkSize(size_hex.to_string()))?;
        self.state = if size == 0 {
            ParseState::Trailers
        } else {
            ParseState::ChunkData { remaining: size }
        };
        Ok(true)
    }
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

// Transfer-Encoding wins over Content-Length when both are present; with
// neither, the body runs until the peer closes. 204 and 304 never carry
// a body regardless of framing headers.
fn body_framing(code: u16, headers: &[httparse::Header<'_>]) -> Result<BodyFraming, HttpParseError> {
    if code == 204 || code == 304 {
        return Ok(BodyFraming::Counted(0));
    }

    let mut content_length = None;
    let mut chunked = false;

    for header in headers {
        if header.name.eq_ignore_ascii_case("transfer-encoding") {
            let value = String::from_utf8_lossy(header.value);
            if value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("chunked"))
            {
                chunked = true;
            }
        } else if header.name.eq_ignore_ascii_case("content-length") {
            let value = String::from_utf8_lossy(header.value);
            let trimmed = value.trim();
            let parsed = trimmed
                .parse::<u64>()
                .map_err(|_| HttpParseError::ContentLength(trimmed.to_string()))?;
            content_length = Some(parsed);
        }
    }

    if chunked {
        Ok(BodyFraming::Chunked)
    } else if let Some(length) = content_length {
        Ok(BodyFraming::Counted(length))
    } else {
        Ok(BodyFraming::UntilClose)
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|pair| pair == b"\r\n")
}
