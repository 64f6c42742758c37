//! Request environment builder (C4).
//!
//! Grounded in `H1Connection.on_headers_complete` in the donor
//! implementation: split the raw URL into path and query at the first
//! `?`, percent-decode the path only if it contains a `%` (P4), and
//! uppercase the method per §4.4.

use bytes::Bytes;

use crate::gateway::{AppState, Environment};
use crate::proto::h1::parse::MessageHead;

pub(crate) struct ConnectionAddrs<'a> {
    pub(crate) client: &'a (String, u16),
    pub(crate) server: &'a (String, u16),
}

pub(crate) fn build_environment(
    head: &MessageHead,
    scheme: &'static str,
    root_path: &std::sync::Arc<str>,
    addrs: ConnectionAddrs<'_>,
    state: AppState,
) -> Environment {
    let (raw_path, query_string) = split_path_query(&head.url);
    let path = decode_path(&raw_path);

    Environment {
        r#type: "http",
        asgi_version: "2.5",
        spec_version: "2.0",
        http_version: "1.1",
        method: uppercase(&head.method),
        scheme,
        path,
        raw_path,
        query_string,
        root_path: root_path.clone(),
        headers: head.headers.clone(),
        client: addrs.client.clone(),
        server: addrs.server.clone(),
        state,
    }
}

fn split_path_query(url: &Bytes) -> (Bytes, Bytes) {
    match url.iter().position(|&b| b == b'?') {
        Some(idx) => (url.slice(..idx), url.slice(idx + 1..)),
        None => (url.clone(), Bytes::new()),
    }
}

/// Percent-decodes `raw` only if it contains a `%`, matching the donor's
/// `if "%" in path: path = urllib.parse.unquote(path)` shortcut — a path
/// with no escapes is returned untouched (and thus may stay a clone of the
/// same underlying buffer without reallocating).
fn decode_path(raw: &Bytes) -> String {
    if !raw.contains(&b'%') {
        return String::from_utf8_lossy(raw).into_owned();
    }

    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'%' && i + 2 < raw.len() {
            if let (Some(h), Some(l)) = (hex_val(raw[i + 1]), hex_val(raw[i + 2])) {
                out.push((h << 4) | l);
                i += 3;
                continue;
            }
        }
        out.push(raw[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn uppercase(method: &Bytes) -> Bytes {
    if method.iter().all(|b| !b.is_ascii_lowercase()) {
        return method.clone();
    }
    Bytes::from(method.to_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::new_app_state;
    use std::sync::Arc;

    fn head(method: &'static [u8], url: &'static [u8]) -> MessageHead {
        MessageHead {
            method: Bytes::from_static(method),
            url: Bytes::from_static(url),
            headers: vec![(Bytes::from_static(b"Host"), Bytes::from_static(b"x"))],
            keep_alive: true,
        }
    }

    #[test]
    fn percent_decodes_only_when_escaped() {
        let h = head(b"GET", b"/a%2Fb");
        let env = build_environment(
            &h,
            "http",
            &Arc::from("/"),
            ConnectionAddrs {
                client: &("127.0.0.1".into(), 1234),
                server: &("127.0.0.1".into(), 80),
            },
            new_app_state(),
        );
        assert_eq!(env.path, "/a/b");
        assert_eq!(&env.raw_path[..], b"/a%2Fb");
    }

    #[test]
    fn splits_query_string() {
        let h = head(b"GET", b"/search?q=rust");
        let env = build_environment(
            &h,
            "http",
            &Arc::from("/"),
            ConnectionAddrs {
                client: &("127.0.0.1".into(), 1234),
                server: &("127.0.0.1".into(), 80),
            },
            new_app_state(),
        );
        assert_eq!(env.path, "/search");
        assert_eq!(&env.query_string[..], b"q=rust");
    }

    #[test]
    fn preserves_header_case_and_order() {
        let h = head(b"GET", b"/");
        let env = build_environment(
            &h,
            "http",
            &Arc::from("/"),
            ConnectionAddrs {
                client: &("127.0.0.1".into(), 1234),
                server: &("127.0.0.1".into(), 80),
            },
            new_app_state(),
        );
        assert_eq!(env.headers, h.headers);
    }
}
