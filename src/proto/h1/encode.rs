//! Response header encoding (C1).
//!
//! Grounded in the teacher's `proto/h1/role.rs` status-line writer: build
//! the whole head in one contiguous buffer and never validate header
//! bytes — the application owns correctness of what it hands us (§4.1).
//! Integers are written with `itoa` rather than `format!`.

use bytes::{BufMut, Bytes, BytesMut};

use crate::gateway::HeaderPair;

/// Encodes a status line + header block into a single contiguous buffer:
/// `HTTP/{version} {status}\r\n` then one `name: value\r\n` per header,
/// terminated by a blank line. No reason phrase is emitted — §8 Scenario 1
/// specifies the literal wire bytes with none, and RFC 7230 §3.1.2 treats
/// the reason phrase as purely advisory. Copies each byte exactly once.
pub(crate) fn encode_head(version: &str, status: u16, headers: &[HeaderPair]) -> Bytes {
    let mut estimated = 16 + version.len();
    for (name, value) in headers {
        estimated += name.len() + value.len() + 4;
    }
    let mut dst = BytesMut::with_capacity(estimated);

    dst.put_slice(b"HTTP/");
    dst.put_slice(version.as_bytes());
    dst.put_u8(b' ');

    let mut status_buf = itoa::Buffer::new();
    dst.put_slice(status_buf.format(status).as_bytes());
    dst.put_slice(b"\r\n");

    for (name, value) in headers {
        dst.put_slice(name);
        dst.put_slice(b": ");
        dst.put_slice(value);
        dst.put_slice(b"\r\n");
    }
    dst.put_slice(b"\r\n");

    dst.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_get_response_head() {
        let headers = vec![(
            Bytes::from_static(b"content-length"),
            Bytes::from_static(b"2"),
        )];
        let head = encode_head("1.1", 200, &headers);
        assert_eq!(&head[..], &b"HTTP/1.1 200\r\ncontent-length: 2\r\n\r\n"[..]);
    }

    #[test]
    fn no_status_ever_has_a_reason_phrase() {
        let head = encode_head("1.1", 299, &[]);
        assert_eq!(&head[..], &b"HTTP/1.1 299\r\n\r\n"[..]);
    }

    #[test]
    fn header_bytes_are_copied_verbatim_case_preserved() {
        let headers = vec![(
            Bytes::from_static(b"X-Custom-Header"),
            Bytes::from_static(b"Value"),
        )];
        let head = encode_head("1.1", 204, &headers);
        assert!(head.windows(16).any(|w| w == b"X-Custom-Header"));
    }
}
