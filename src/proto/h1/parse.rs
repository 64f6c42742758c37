//! Request parser adapter (C3).
//!
//! Grounded in the teacher's `proto/h1/role.rs`: feed the *whole*
//! accumulated buffer to `httparse` on every call, record header byte
//! ranges, then `split_to`/`freeze` once a complete head is found so every
//! field handed onward is a zero-copy `Bytes` slice of the original read.
//!
//! `httparse` only understands the request line and header block; framing
//! of the body (fixed length vs chunked) is this adapter's job, matching
//! the spec's "wraps a streaming HTTP/1.1 parser" framing (§4.3) and the
//! Non-goal that only the *decoding* of chunked/gzip bodies — not their
//! framing — is out of scope (§9 Design Notes).

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Kind};

const MAX_HEADERS: usize = 128;

/// One parsed request head, handed to the connection engine on
/// `headers_complete`.
#[derive(Debug)]
pub(crate) struct MessageHead {
    pub(crate) method: Bytes,
    pub(crate) url: Bytes,
    pub(crate) headers: Vec<(Bytes, Bytes)>,
    pub(crate) keep_alive: bool,
}

/// Events emitted by [`RequestParser::feed`], in wire order, mirroring the
/// donor parser's callback sequence (`on_message_begin`, `on_url`,
/// `on_header`, `on_headers_complete`, `on_body`, `on_message_complete`).
#[derive(Debug)]
pub(crate) enum ParseEvent {
    MessageBegin,
    HeadersComplete(MessageHead),
    Body(Bytes),
    MessageComplete,
}

#[derive(Debug)]
enum BodyFraming {
    /// No body expected at all (GET/HEAD/OPTIONS, or explicit zero length).
    None,
    /// `Content-Length: N`; counts down as bytes are consumed.
    Fixed(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked(ChunkState),
    /// Neither header present and not a no-body method: read until EOF
    /// (connection close). Treated the same as `Fixed` with an unbounded
    /// remaining count for bookkeeping purposes.
    UntilClose,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ChunkState {
    /// Waiting for a `<hex-size>\r\n` line.
    Size,
    /// Reading `remaining` bytes of chunk data, then a trailing `\r\n`.
    Data { remaining: u64 },
    /// The zero-size chunk was seen; waiting for the final `\r\n`.
    Trailer,
    Done,
}

#[derive(Debug, PartialEq)]
enum State {
    AwaitingHeaders,
    Body(BodyFraming),
    /// A non-keep-alive message has completed; any further bytes on this
    /// connection are junk and are silently dropped (§4.3 "tolerates
    /// trailing junk bytes after a connection-close response").
    Closed,
}

pub(crate) struct RequestParser {
    buf: BytesMut,
    state: State,
}

impl RequestParser {
    pub(crate) fn new() -> Self {
        RequestParser {
            buf: BytesMut::new(),
            state: State::AwaitingHeaders,
        }
    }

    /// Feeds newly-received bytes and returns every event they produce, in
    /// order. May contain events for more than one pipelined request if
    /// `data` happens to complete one message and start another.
    pub(crate) fn feed(&mut self, data: &[u8]) -> crate::error::Result<Vec<ParseEvent>> {
        self.buf.extend_from_slice(data);
        let mut events = Vec::new();

        loop {
            match &mut self.state {
                State::Closed => {
                    self.buf.clear();
                    break;
                }
                State::AwaitingHeaders => {
                    if !self.try_parse_head(&mut events)? {
                        break;
                    }
                }
                State::Body(_) => {
                    if !self.advance_body(&mut events) {
                        break;
                    }
                }
            }
        }

        Ok(events)
    }

    /// Attempts to parse one request head out of `self.buf`. Returns
    /// `true` if a head was parsed (and the loop in `feed` should
    /// continue), `false` if more bytes are needed.
    fn try_parse_head(&mut self, events: &mut Vec<ParseEvent>) -> crate::error::Result<bool> {
        if self.buf.is_empty() {
            return Ok(false);
        }

        let base = self.buf.as_ptr() as usize;
        let range_of = |s: &[u8]| -> (usize, usize) {
            let start = s.as_ptr() as usize - base;
            (start, start + s.len())
        };

        let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut raw_headers);
        let status = req.parse(&self.buf).map_err(|_| Error::new_parse())?;

        let consumed = match status {
            httparse::Status::Complete(n) => n,
            httparse::Status::Partial => return Ok(false),
        };

        // Capture byte *ranges* into `self.buf` while `req`'s borrow is
        // still alive; the owned values are materialized afterwards by
        // slicing the frozen frame, so nothing here allocates per-field.
        let method_range = range_of(req.method.ok_or_else(Error::new_parse)?.as_bytes());
        let version_11 = req.version.ok_or_else(Error::new_parse)? == 1;
        let path_range = range_of(req.path.ok_or_else(Error::new_parse)?.as_bytes());
        let header_ranges: Vec<(usize, usize, usize, usize)> = req
            .headers
            .iter()
            .map(|h| {
                let (ns, ne) = range_of(h.name.as_bytes());
                let (vs, ve) = range_of(h.value);
                (ns, ne, vs, ve)
            })
            .collect();

        let mut content_length: Option<u64> = None;
        let mut chunked = false;
        let mut connection_close = false;
        for h in req.headers.iter() {
            let name = h.name.as_bytes();
            let value = h.value;
            if name.eq_ignore_ascii_case(b"content-length") {
                let s = std::str::from_utf8(value).map_err(|_| Error::new_parse())?;
                content_length = Some(s.trim().parse::<u64>().map_err(|_| Error::new_parse())?);
            } else if name.eq_ignore_ascii_case(b"transfer-encoding") {
                if value
                    .rsplit(|b| *b == b',')
                    .next()
                    .map(|last| trim_ascii_whitespace(last).eq_ignore_ascii_case(b"chunked"))
                    .unwrap_or(false)
                {
                    chunked = true;
                }
            } else if name.eq_ignore_ascii_case(b"connection") && value.eq_ignore_ascii_case(b"close") {
                connection_close = true;
            }
        }

        // Freeze the consumed prefix once; every field is then a cheap
        // `Bytes::slice` off this single frame (zero-copy).
        let frame = self.buf.split_to(consumed).freeze();
        let headers: Vec<(Bytes, Bytes)> = header_ranges
            .into_iter()
            .map(|(ns, ne, vs, ve)| (frame.slice(ns..ne), frame.slice(vs..ve)))
            .collect();
        let method = frame.slice(method_range.0..method_range.1);
        let url = frame.slice(path_range.0..path_range.1);

        let no_body = crate::gateway::is_no_body_method(&method);
        let keep_alive = version_11 && !connection_close;

        events.push(ParseEvent::MessageBegin);
        events.push(ParseEvent::HeadersComplete(MessageHead {
            method,
            url,
            headers,
            keep_alive,
        }));

        let framing = if no_body {
            BodyFraming::None
        } else if chunked {
            BodyFraming::Chunked(ChunkState::Size)
        } else if let Some(len) = content_length {
            if len == 0 {
                BodyFraming::None
            } else {
                BodyFraming::Fixed(len)
            }
        } else if keep_alive {
            BodyFraming::None
        } else {
            BodyFraming::UntilClose
        };

        if matches!(framing, BodyFraming::None) {
            events.push(ParseEvent::MessageComplete);
            self.state = if keep_alive {
                State::AwaitingHeaders
            } else {
                State::Closed
            };
        } else {
            self.state = State::Body(framing);
        }

        Ok(true)
    }

    /// Drains as much body as is currently available, returns `true` if
    /// progress was made (so `feed`'s loop should re-check for a pipelined
    /// next request), `false` if more bytes are needed.
    fn advance_body(&mut self, events: &mut Vec<ParseEvent>) -> bool {
        let State::Body(framing) = &mut self.state else {
            return false;
        };

        match framing {
            BodyFraming::Fixed(remaining) => {
                if self.buf.is_empty() {
                    return false;
                }
                let take = std::cmp::min(*remaining, self.buf.len() as u64) as usize;
                let chunk = self.buf.split_to(take).freeze();
                *remaining -= take as u64;
                let done = *remaining == 0;
                events.push(ParseEvent::Body(chunk));
                if done {
                    events.push(ParseEvent::MessageComplete);
                    self.state = State::AwaitingHeaders;
                }
                true
            }
            BodyFraming::UntilClose => {
                if self.buf.is_empty() {
                    return false;
                }
                let chunk = self.buf.split_to(self.buf.len()).freeze();
                events.push(ParseEvent::Body(chunk));
                true
            }
            BodyFraming::None => false,
            BodyFraming::Chunked(chunk_state) => self.advance_chunked(chunk_state, events),
        }
    }

    fn advance_chunked(&mut self, chunk_state: &mut ChunkState, events: &mut Vec<ParseEvent>) -> bool {
        match *chunk_state {
            ChunkState::Size => {
                let Some(pos) = find_crlf(&self.buf) else {
                    return false;
                };
                let line = &self.buf[..pos];
                let size_str = std::str::from_utf8(line.split(|b| *b == b';').next().unwrap_or(line))
                    .unwrap_or("")
                    .trim();
                let size = u64::from_str_radix(size_str, 16).unwrap_or(0);
                self.buf.advance_to(pos + 2);
                *chunk_state = if size == 0 {
                    ChunkState::Trailer
                } else {
                    ChunkState::Data { remaining: size }
                };
                true
            }
            ChunkState::Data { remaining } => {
                if self.buf.is_empty() {
                    return false;
                }
                let take = std::cmp::min(remaining, self.buf.len() as u64) as usize;
                let chunk = self.buf.split_to(take).freeze();
                let left = remaining - take as u64;
                events.push(ParseEvent::Body(chunk));
                if left == 0 {
                    // consume the trailing CRLF after this chunk's data, if present
                    if self.buf.len() >= 2 && &self.buf[..2] == b"\r\n" {
                        self.buf.advance_to(2);
                        *chunk_state = ChunkState::Size;
                    } else if self.buf.len() < 2 {
                        *chunk_state = ChunkState::Size;
                        return true;
                    } else {
                        *chunk_state = ChunkState::Size;
                    }
                } else {
                    *chunk_state = ChunkState::Data { remaining: left };
                }
                true
            }
            ChunkState::Trailer => {
                let Some(pos) = find_crlf(&self.buf) else {
                    return false;
                };
                // Discard trailer header lines until the blank line.
                if pos == 0 {
                    self.buf.advance_to(2);
                    *chunk_state = ChunkState::Done;
                    events.push(ParseEvent::MessageComplete);
                    self.state = State::AwaitingHeaders;
                } else {
                    self.buf.advance_to(pos + 2);
                }
                true
            }
            ChunkState::Done => false,
        }
    }
}

fn trim_ascii_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |p| p + 1);
    &bytes[start..end]
}

fn find_crlf(buf: &BytesMut) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

trait AdvanceTo {
    fn advance_to(&mut self, n: usize);
}

impl AdvanceTo for BytesMut {
    fn advance_to(&mut self, n: usize) {
        let _ = self.split_to(n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_complete(events: &[ParseEvent]) -> &MessageHead {
        events
            .iter()
            .find_map(|e| match e {
                ParseEvent::HeadersComplete(h) => Some(h),
                _ => None,
            })
            .expect("expected HeadersComplete event")
    }

    #[test]
    fn simple_get_has_no_body_events() {
        let mut parser = RequestParser::new();
        let events = parser
            .feed(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        let head = headers_complete(&events);
        assert_eq!(&head.method[..], b"GET");
        assert!(matches!(events.last(), Some(ParseEvent::MessageComplete)));
    }

    #[test]
    fn post_with_content_length_yields_body_then_complete() {
        let mut parser = RequestParser::new();
        let events = parser
            .feed(b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello")
            .unwrap();
        let bodies: Vec<&[u8]> = events
            .iter()
            .filter_map(|e| match e {
                ParseEvent::Body(b) => Some(&b[..]),
                _ => None,
            })
            .collect();
        assert_eq!(bodies, vec![b"hello".as_slice()]);
        assert!(matches!(events.last(), Some(ParseEvent::MessageComplete)));
    }

    #[test]
    fn pipelined_pair_in_one_feed_produces_two_messages() {
        let mut parser = RequestParser::new();
        let events = parser
            .feed(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n")
            .unwrap();
        let begins = events
            .iter()
            .filter(|e| matches!(e, ParseEvent::MessageBegin))
            .count();
        assert_eq!(begins, 2);
    }

    #[test]
    fn connection_close_stops_further_parsing() {
        let mut parser = RequestParser::new();
        let events = parser
            .feed(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\nGARBAGE")
            .unwrap();
        let begins = events
            .iter()
            .filter(|e| matches!(e, ParseEvent::MessageBegin))
            .count();
        assert_eq!(begins, 1);
    }

    #[test]
    fn chunked_body_decodes_to_raw_bytes() {
        let mut parser = RequestParser::new();
        let events = parser
            .feed(b"POST /x HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n0\r\n\r\n")
            .unwrap();
        let body: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                ParseEvent::Body(b) => Some(b.to_vec()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(body, b"Wiki");
        assert!(matches!(events.last(), Some(ParseEvent::MessageComplete)));
    }
}
