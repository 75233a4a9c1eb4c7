//! Legacy HTTP camouflage
//!
//! The client fabricates one plausible request header, then switches to raw
//! Sudoku bytes on the same socket. The server strips exactly one
//! well-formed header block if the connection opens like an HTTP request.
//! Header templates double as the tunnel modes' browser-shaped headers and
//! the server-side path whitelist.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::Rng;

use crate::config::MaskStrategy;
use crate::error::{Error, Result};

pub(crate) const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_2_1) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_2 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (Linux; Android 14; Pixel 7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Mobile Safari/537.36",
];

pub(crate) const ACCEPTS: &[&str] = &[
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
    "application/json, text/plain, */*",
    "application/octet-stream",
    "*/*",
];

pub(crate) const ACCEPT_LANGUAGES: &[&str] = &[
    "en-US,en;q=0.9",
    "en-GB,en;q=0.9",
    "zh-CN,zh;q=0.9,en-US;q=0.8,en;q=0.7",
    "ja-JP,ja;q=0.9,en-US;q=0.8,en;q=0.7",
    "de-DE,de;q=0.9,en-US;q=0.8,en;q=0.7",
];

pub(crate) const ACCEPT_ENCODINGS: &[&str] = &["gzip, deflate, br", "gzip, deflate", "br, gzip, deflate"];

/// Request paths the server accepts; everything else gets a 404.
pub(crate) const PATHS: &[&str] = &[
    "/api/v1/upload",
    "/data/sync",
    "/uploads/raw",
    "/api/report",
    "/feed/update",
    "/v2/events",
    "/v1/telemetry",
    "/session",
    "/stream",
    "/ws",
];

pub(crate) const CONTENT_TYPES: &[&str] = &[
    "application/octet-stream",
    "application/x-protobuf",
    "application/json",
];

/// Strip a trailing `:port` so the value fits Origin/SNI style fields.
pub(crate) fn trim_port(host: &str) -> &str {
    // IPv6 literals keep their brackets.
    if let Some(stripped) = host.strip_prefix('[') {
        if let Some(end) = stripped.find(']') {
            return &host[..end + 2];
        }
        return host;
    }
    match host.rsplit_once(':') {
        Some((h, port)) if !h.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => h,
        _ => host,
    }
}

fn push_common_headers(buf: &mut Vec<u8>, host: &str, rng: &mut impl Rng) {
    let ua = USER_AGENTS[rng.gen_range(0..USER_AGENTS.len())];
    let accept = ACCEPTS[rng.gen_range(0..ACCEPTS.len())];
    let lang = ACCEPT_LANGUAGES[rng.gen_range(0..ACCEPT_LANGUAGES.len())];
    let enc = ACCEPT_ENCODINGS[rng.gen_range(0..ACCEPT_ENCODINGS.len())];

    buf.extend_from_slice(format!("Host: {host}\r\n").as_bytes());
    buf.extend_from_slice(format!("User-Agent: {ua}\r\n").as_bytes());
    buf.extend_from_slice(format!("Accept: {accept}\r\n").as_bytes());
    buf.extend_from_slice(format!("Accept-Language: {lang}\r\n").as_bytes());
    buf.extend_from_slice(format!("Accept-Encoding: {enc}\r\n").as_bytes());
    buf.extend_from_slice(b"Connection: keep-alive\r\n");
    buf.extend_from_slice(b"Cache-Control: no-cache\r\nPragma: no-cache\r\n");
}

fn build_post_header(host: &str, rng: &mut impl Rng) -> Vec<u8> {
    let path = PATHS[rng.gen_range(0..PATHS.len())];
    let ctype = CONTENT_TYPES[rng.gen_range(0..CONTENT_TYPES.len())];
    // An inflated Content-Length keeps middleboxes expecting a long upload.
    let content_length: u64 = rng.gen_range(4 * 1024..=10 * 1024 * 1024);

    let mut buf = Vec::with_capacity(512);
    buf.extend_from_slice(format!("POST {path} HTTP/1.1\r\n").as_bytes());
    push_common_headers(&mut buf, host, rng);
    buf.extend_from_slice(format!("Content-Type: {ctype}\r\n").as_bytes());
    buf.extend_from_slice(format!("Content-Length: {content_length}").as_bytes());
    if rng.gen_range(0..2) == 0 {
        buf.extend_from_slice(b"\r\nX-Requested-With: XMLHttpRequest");
    }
    if rng.gen_range(0..3) == 0 {
        buf.extend_from_slice(format!("\r\nReferer: https://{}/", trim_port(host)).as_bytes());
    }
    buf.extend_from_slice(b"\r\n\r\n");
    buf
}

fn build_websocket_header(host: &str, rng: &mut impl Rng) -> Vec<u8> {
    let path = PATHS[rng.gen_range(0..PATHS.len())];
    let mut key_bytes = [0u8; 16];
    rng.fill(&mut key_bytes);
    let ws_key = BASE64.encode(key_bytes);

    let mut buf = Vec::with_capacity(512);
    buf.extend_from_slice(format!("GET {path} HTTP/1.1\r\n").as_bytes());
    push_common_headers(&mut buf, host, rng);
    buf.extend_from_slice(b"Upgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Version: 13\r\n");
    buf.extend_from_slice(format!("Sec-WebSocket-Key: {ws_key}\r\n").as_bytes());
    buf.extend_from_slice(format!("Origin: https://{}\r\n", trim_port(host)).as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf
}

/// Build one camouflage header according to the strategy.
pub fn build_mask_header(host: &str, strategy: MaskStrategy) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    match strategy {
        MaskStrategy::Post => build_post_header(host, &mut rng),
        MaskStrategy::WebSocket => build_websocket_header(host, &mut rng),
        MaskStrategy::Random => {
            if rng.gen_range(0..10) < 2 {
                build_websocket_header(host, &mut rng)
            } else {
                build_post_header(host, &mut rng)
            }
        }
    }
}

/// Whether the first bytes of a connection look like an HTTP request line.
pub fn looks_like_http_request_start(peek: &[u8]) -> bool {
    if peek.len() < 4 {
        return false;
    }
    matches!(
        &peek[..4],
        b"GET " | b"POST" | b"HEAD" | b"PUT " | b"OPTI" | b"PATC" | b"DELE"
    )
}

/// Outcome of scanning a buffered prefix for one header block.
#[derive(Debug, PartialEq, Eq)]
pub enum HeaderScan {
    /// Header block ends at this offset (exclusive).
    Complete(usize),
    /// The terminator has not arrived yet.
    NeedMore,
}

/// Largest header block the server will buffer before giving up.
pub const MAX_HEADER_BYTES: usize = 32 * 1024;

/// Scan for the end of one request header block. The request line must
/// carry a known method; lines may end with `\r\n` or bare `\n`.
pub fn scan_header_block(buf: &[u8]) -> Result<HeaderScan> {
    let mut pos = 0;
    let mut first_line = true;
    loop {
        let Some(nl) = buf[pos..].iter().position(|&b| b == b'\n') else {
            if buf.len() > MAX_HEADER_BYTES {
                return Err(Error::Protocol("http header too large".into()));
            }
            return Ok(HeaderScan::NeedMore);
        };
        let line_end = pos + nl + 1;
        let line = &buf[pos..line_end];

        if first_line {
            let valid = [
                &b"POST "[..],
                &b"GET "[..],
                &b"HEAD "[..],
                &b"PUT "[..],
                &b"DELETE "[..],
                &b"OPTIONS "[..],
                &b"PATCH "[..],
            ]
            .iter()
            .any(|m| line.starts_with(m));
            if !valid {
                return Err(Error::Protocol(format!(
                    "invalid method or garbage: {}",
                    String::from_utf8_lossy(&line[..line.len().min(32)]).trim()
                )));
            }
            first_line = false;
        } else if line == b"\r\n" || line == b"\n" {
            return Ok(HeaderScan::Complete(line_end));
        }
        pos = line_end;
        if pos > MAX_HEADER_BYTES {
            return Err(Error::Protocol("http header too large".into()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::httpmask::http1::{parse_request_header, HeaderParse};

    #[test]
    fn test_request_start_sniff() {
        assert!(looks_like_http_request_start(b"GET /a HTTP/1.1"));
        assert!(looks_like_http_request_start(b"POST /b"));
        assert!(looks_like_http_request_start(b"OPTIONS *"));
        assert!(!looks_like_http_request_start(b"\x16\x03\x01\x02"));
        assert!(!looks_like_http_request_start(b"GE"));
    }

    #[test]
    fn test_mask_headers_parse_as_http() {
        for strategy in [MaskStrategy::Random, MaskStrategy::Post, MaskStrategy::WebSocket] {
            for _ in 0..16 {
                let header = build_mask_header("cdn.example.com:443", strategy);
                assert!(looks_like_http_request_start(&header[..4]));
                match scan_header_block(&header).unwrap() {
                    HeaderScan::Complete(end) => assert_eq!(end, header.len()),
                    HeaderScan::NeedMore => panic!("generated header must be complete"),
                }
                match parse_request_header(&header).unwrap() {
                    HeaderParse::Complete { header: req, consumed } => {
                        assert_eq!(consumed, header.len());
                        assert!(PATHS.contains(&req.path()));
                        assert!(req.header("user-agent").is_some());
                    }
                    HeaderParse::NeedMore => panic!("must parse"),
                }
            }
        }
    }

    #[test]
    fn test_scan_rejects_garbage() {
        assert!(scan_header_block(b"NOISE BYTES\r\n\r\n").is_err());
    }

    #[test]
    fn test_scan_needs_terminator() {
        let partial = b"GET / HTTP/1.1\r\nHost: a\r\n";
        assert_eq!(scan_header_block(partial).unwrap(), HeaderScan::NeedMore);

        let full = b"GET / HTTP/1.1\r\nHost: a\r\n\r\ntrailing";
        assert_eq!(
            scan_header_block(full).unwrap(),
            HeaderScan::Complete(full.len() - "trailing".len())
        );
    }

    #[test]
    fn test_bare_newline_terminator() {
        let full = b"GET / HTTP/1.1\nHost: a\n\nrest";
        assert_eq!(
            scan_header_block(full).unwrap(),
            HeaderScan::Complete(full.len() - "rest".len())
        );
    }

    #[test]
    fn test_trim_port() {
        assert_eq!(trim_port("example.com:443"), "example.com");
        assert_eq!(trim_port("example.com"), "example.com");
        assert_eq!(trim_port("[2001:db8::1]:443"), "[2001:db8::1]");
    }
}
