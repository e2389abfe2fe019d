//! Incremental HTTP/1.1 response parsing for long-lived streams.
//!
//! Bytes are pushed in as they arrive; the parser reports the status line
//! once, decoded body bytes as they become available, and completion when a
//! chunked body ends or a fixed-length body is fully read.

use httparse::Status;
use thiserror::Error;

const MAX_HEADER_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum HttpParseError {
    #[error("malformed response headers: {0}")]
    Headers(#[from] httparse::Error),
    #[error("response headers exceed {MAX_HEADER_BYTES} bytes")]
    HeadersTooLarge,
    #[error("invalid chunk size")]
    ChunkSize,
    #[error("invalid Content-Length header")]
    ContentLength,
    #[error("missing CRLF after chunk data")]
    ChunkTerminator,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParserEvent {
    Status(u16),
    Body(Vec<u8>),
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Body {
    /// Waiting for a chunk-size line.
    ChunkSize,
    ChunkData(u64),
    ChunkCrlf,
    Trailer,
    Length(u64),
    UntilClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Headers,
    Body(Body),
    Done,
}

#[derive(Debug)]
pub struct ResponseParser {
    state: State,
    buf: Vec<u8>,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseParser {
    pub fn new() -> Self {
        Self {
            state: State::Headers,
            buf: Vec::new(),
        }
    }

    /// Prepares for the next response on the same connection.
    pub fn reset(&mut self) {
        self.state = State::Headers;
        self.buf.clear();
    }

    pub fn is_complete(&self) -> bool {
        self.state == State::Done
    }

    pub fn feed(&mut self, data: &[u8], out: &mut Vec<ParserEvent>) -> Result<(), HttpParseError> {
        if self.state == State::Done {
            return Ok(());
        }
        self.buf.extend_from_slice(data);
        loop {
            let progressed = match self.state {
                State::Headers => self.parse_headers(out)?,
                State::Body(body) => self.parse_body(body, out)?,
                State::Done => false,
            };
            if !progressed {
                return Ok(());
            }
        }
    }

    fn parse_headers(&mut self, out: &mut Vec<ParserEvent>) -> Result<bool, HttpParseError> {
        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut response = httparse::Response::new(&mut headers);
        let consumed = match response.parse(&self.buf)? {
            Status::Complete(len) => len,
            Status::Partial => {
                if self.buf.len() > MAX_HEADER_BYTES {
                    return Err(HttpParseError::HeadersTooLarge);
                }
                return Ok(false);
            }
        };
        let status = response.code.unwrap_or(0);
        let mut body = Body::UntilClose;
        for header in response.headers.iter() {
            if header.name.eq_ignore_ascii_case("Transfer-Encoding") {
                let value = String::from_utf8_lossy(header.value);
                if value.to_ascii_lowercase().contains("chunked") {
                    body = Body::ChunkSize;
                }
            } else if header.name.eq_ignore_ascii_case("Content-Length") && body != Body::ChunkSize
            {
                let len = std::str::from_utf8(header.value)
                    .ok()
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .ok_or(HttpParseError::ContentLength)?;
                body = Body::Length(len);
            }
        }
        self.buf.drain(..consumed);
        out.push(ParserEvent::Status(status));
        self.state = match body {
            Body::Length(0) => {
                out.push(ParserEvent::Complete);
                State::Done
            }
            body => State::Body(body),
        };
        Ok(true)
    }

    fn parse_body(&mut self, body: Body, out: &mut Vec<ParserEvent>) -> Result<bool, HttpParseError> {
        match body {
            Body::ChunkSize => match httparse::parse_chunk_size(&self.buf)
                .map_err(|_| HttpParseError::ChunkSize)?
            {
                Status::Complete((consumed, 0)) => {
                    self.buf.drain(..consumed);
                    self.state = State::Body(Body::Trailer);
                    Ok(true)
                }
                Status::Complete((consumed, size)) => {
                    self.buf.drain(..consumed);
                    self.state = State::Body(Body::ChunkData(size));
                    Ok(true)
                }
                Status::Partial => Ok(false),
            },
            Body::ChunkData(remaining) => {
                if self.buf.is_empty() {
                    return Ok(false);
                }
                let take = self.take_body(remaining, out);
                self.state = State::Body(if take == remaining {
                    Body::ChunkCrlf
                } else {
                    Body::ChunkData(remaining - take)
                });
                Ok(true)
            }
            Body::ChunkCrlf => {
                if self.buf.len() < 2 {
                    return Ok(false);
                }
                if &self.buf[..2] != b"\r\n" {
                    return Err(HttpParseError::ChunkTerminator);
                }
                self.buf.drain(..2);
                self.state = State::Body(Body::ChunkSize);
                Ok(true)
            }
            Body::Trailer => {
                let end = if self.buf.starts_with(b"\r\n") {
                    Some(2)
                } else {
                    self.buf
                        .windows(4)
                        .position(|w| w == b"\r\n\r\n")
                        .map(|pos| pos + 4)
                };
                match end {
                    Some(end) => {
                        self.buf.drain(..end);
                        self.finish(out);
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
            Body::Length(remaining) => {
                if self.buf.is_empty() {
                    return Ok(false);
                }
                let take = self.take_body(remaining, out);
                if take == remaining {
                    self.finish(out);
                } else {
                    self.state = State::Body(Body::Length(remaining - take));
                }
                Ok(true)
            }
            Body::UntilClose => {
                if self.buf.is_empty() {
                    return Ok(false);
                }
                out.push(ParserEvent::Body(std::mem::take(&mut self.buf)));
                Ok(true)
            }
        }
    }

    fn take_body(&mut self, remaining: u64, out: &mut Vec<ParserEvent>) -> u64 {
        let take = remaining.min(self.buf.len() as u64);
        let data: Vec<u8> = self.buf.drain(..take as usize).collect();
        out.push(ParserEvent::Body(data));
        take
    }

    fn finish(&mut self, out: &mut Vec<ParserEvent>) {
        self.state = State::Done;
        out.push(ParserEvent::Complete);
    }
}

/// Splits a byte stream into delimiter-terminated frames.
#[derive(Debug)]
pub struct FrameSplitter {
    delimiter: &'static [u8],
    buf: Vec<u8>,
}

impl FrameSplitter {
    pub fn new(delimiter: &'static [u8]) -> Self {
        Self {
            delimiter,
            buf: Vec::new(),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete frame, without its delimiter.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        let pos = self
            .buf
            .windows(self.delimiter.len())
            .position(|w| w == self.delimiter)?;
        let mut frame: Vec<u8> = self.buf.drain(..pos + self.delimiter.len()).collect();
        frame.truncate(pos);
        Some(frame)
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_body(events: &[ParserEvent]) -> Vec<u8> {
        events
            .iter()
            .filter_map(|e| match e {
                ParserEvent::Body(data) => Some(data.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[test]
    fn chunked_body_split_across_reads() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let mut parser = ResponseParser::new();
        let mut events = Vec::new();
        for piece in raw.chunks(7) {
            parser.feed(piece, &mut events).unwrap();
        }
        assert_eq!(events.first(), Some(&ParserEvent::Status(200)));
        assert_eq!(collect_body(&events), b"hello world");
        assert_eq!(events.last(), Some(&ParserEvent::Complete));
        assert!(parser.is_complete());
    }

    #[test]
    fn content_length_response_then_reset() {
        let mut parser = ResponseParser::new();
        let mut events = Vec::new();
        parser
            .feed(b"HTTP/1.1 404 Not Found\r\nContent-Length: 3\r\n\r\nnop", &mut events)
            .unwrap();
        assert_eq!(
            events,
            vec![
                ParserEvent::Status(404),
                ParserEvent::Body(b"nop".to_vec()),
                ParserEvent::Complete
            ]
        );
        parser.reset();
        events.clear();
        parser
            .feed(b"HTTP/1.1 200 OK\r\n\r\nstream", &mut events)
            .unwrap();
        assert_eq!(collect_body(&events), b"stream");
        assert!(!parser.is_complete());
    }

    #[test]
    fn bad_chunk_size_is_rejected() {
        let mut parser = ResponseParser::new();
        let mut events = Vec::new();
        let err = parser
            .feed(
                b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n",
                &mut events,
            )
            .unwrap_err();
        assert!(matches!(err, HttpParseError::ChunkSize));
    }

    #[test]
    fn splitter_yields_complete_frames() {
        let mut splitter = FrameSplitter::new(b"\n\n\n\n");
        splitter.push(b"{\"rev\":1}\n\n\n\n{\"re");
        assert_eq!(splitter.next_frame(), Some(b"{\"rev\":1}".to_vec()));
        assert_eq!(splitter.next_frame(), None);
        splitter.push(b"v\":2}\n\n\n\n");
        assert_eq!(splitter.next_frame(), Some(b"{\"rev\":2}".to_vec()));
        assert_eq!(splitter.pending(), 0);
    }
}
