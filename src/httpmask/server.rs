//! Server side of the HTTP tunnel
//!
//! One listener port serves raw Sudoku connections, camouflaged ones and
//! HTTP tunnel requests. `wrap_conn` sniffs each accepted stream: tunnel
//! requests (marked by the mode header) are handled here; everything else
//! passes through with every consumed byte replayed. Split/poll sessions
//! live in a token map owned by this value, with idle reaping and explicit
//! close.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::common::{PreBufferedStream, Stream};
use crate::config::{MaskMode, ProtocolConfig};
use crate::error::{Error, Result};

use super::http1::{
    self, body_kind, encode_chunk, encode_final_chunk, parse_request_header, BodyKind, BodyStream,
    HeaderParse, RequestHeader,
};
use super::masker::{self, MAX_HEADER_BYTES};

/// Per-request upload cap.
const MAX_UPLOAD_BYTES: usize = 1 << 20;

/// Capacity of the in-memory duplex pipe behind each session token.
const SESSION_PIPE_CAPACITY: usize = 64 * 1024;

const SESSION_WRITE_TIMEOUT: Duration = Duration::from_secs(30);
const SNIFF_TIMEOUT: Duration = Duration::from_secs(5);

/// What `wrap_conn` decided about an accepted connection.
pub enum WrapOutcome {
    /// Not a tunnel request; run the normal handshake over this stream,
    /// which replays anything the sniffer consumed.
    Passthrough(Stream),
    /// A tunnel session started; run the handshake over `stream` with the
    /// derived config (camouflage disabled inside the tunnel).
    StartTunnel {
        stream: Stream,
        config: ProtocolConfig,
    },
    /// The HTTP request was fully handled here; nothing left to do.
    Done,
}

struct TunnelSession {
    read_half: tokio::sync::Mutex<ReadHalf<DuplexStream>>,
    write_half: tokio::sync::Mutex<WriteHalf<DuplexStream>>,
    last_active: Mutex<Instant>,
    closed: Notify,
    closed_flag: AtomicBool,
}

impl TunnelSession {
    fn touch(&self) {
        *self.last_active.lock().expect("session clock poisoned") = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_active
            .lock()
            .expect("session clock poisoned")
            .elapsed()
    }

    fn mark_closed(&self) {
        self.closed_flag.store(true, Ordering::SeqCst);
        self.closed.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.closed_flag.load(Ordering::SeqCst)
    }
}

/// Token-keyed tunnel session registry for one listener instance.
pub struct TunnelServer {
    mode: MaskMode,
    pull_read_timeout: Duration,
    session_ttl: Duration,
    sessions: Arc<Mutex<HashMap<String, Arc<TunnelSession>>>>,
    closed: Arc<AtomicBool>,
}

impl TunnelServer {
    /// Build from the protocol configuration with default timeouts.
    pub fn new(cfg: &ProtocolConfig) -> Self {
        Self::with_options(cfg.mask_mode(), Duration::from_secs(10), Duration::from_secs(120))
    }

    pub fn with_options(mode: MaskMode, pull_read_timeout: Duration, session_ttl: Duration) -> Self {
        Self {
            mode,
            pull_read_timeout,
            session_ttl,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Tear down every session. Safe to call more than once.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let sessions: Vec<Arc<TunnelSession>> = {
            let mut map = self.sessions.lock().expect("session map poisoned");
            map.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.mark_closed();
        }
    }

    /// Inspect an accepted connection and route it.
    pub async fn wrap_conn(&self, raw: Stream, cfg: &ProtocolConfig) -> Result<WrapOutcome> {
        let sniffed = match tokio::time::timeout(SNIFF_TIMEOUT, sniff_request(raw)).await {
            Ok(result) => result?,
            Err(_) => return Err(Error::Timeout),
        };

        let (mut raw, buffer, request) = match sniffed {
            Sniffed::NotHttp { stream, buffer } => {
                return Ok(WrapOutcome::Passthrough(Box::new(PreBufferedStream::new(
                    stream, buffer,
                ))));
            }
            Sniffed::Http {
                stream,
                buffer,
                request,
                body_offset,
            } => {
                let marked = request
                    .header("x-sudoku-tunnel")
                    .map(str::trim)
                    .is_some_and(|v| !v.is_empty());
                if !marked {
                    // Plain camouflage or unrelated HTTP: replay everything.
                    return Ok(WrapOutcome::Passthrough(Box::new(PreBufferedStream::new(
                        stream, buffer,
                    ))));
                }
                (stream, buffer[body_offset..].to_vec(), request)
            }
        };

        if self.mode == MaskMode::Legacy {
            respond(&mut raw, 404, "not found").await;
            return Ok(WrapOutcome::Done);
        }

        let requested = request
            .header("x-sudoku-tunnel")
            .and_then(MaskMode::parse)
            .filter(|m| matches!(m, MaskMode::Stream | MaskMode::Poll));
        let Some(requested) = requested else {
            respond(&mut raw, 404, "not found").await;
            return Ok(WrapOutcome::Done);
        };
        if requested != self.mode && self.mode != MaskMode::Auto {
            respond(&mut raw, 404, "not found").await;
            return Ok(WrapOutcome::Done);
        }

        if !masker::PATHS.contains(&request.path()) {
            respond(&mut raw, 404, "not found").await;
            return Ok(WrapOutcome::Done);
        }

        match requested {
            MaskMode::Stream => self.handle_stream(raw, request, buffer, cfg).await,
            MaskMode::Poll => self.handle_poll(raw, request, buffer, cfg).await,
            _ => unreachable!("filtered above"),
        }
    }

    async fn handle_stream(
        &self,
        mut raw: Stream,
        request: RequestHeader,
        leftover: Vec<u8>,
        cfg: &ProtocolConfig,
    ) -> Result<WrapOutcome> {
        let token = request.query_param("token").map(str::to_string);
        let close_flag = request.query_param("close") == Some("1");

        match request.method.as_str() {
            "GET" => {
                if token.is_none() && request.path() == "/session" {
                    return self.authorize_session(raw, cfg).await;
                }
                if let Some(token) = token {
                    if request.path() == "/stream" {
                        self.serve_pull(raw, &token, false).await;
                        return Ok(WrapOutcome::Done);
                    }
                }
                respond(&mut raw, 400, "bad request").await;
                Ok(WrapOutcome::Done)
            }
            "POST" => {
                if let Some(token) = token {
                    if request.path() == "/api/v1/upload" {
                        if close_flag {
                            self.close_session(&token);
                            respond(&mut raw, 200, "").await;
                            return Ok(WrapOutcome::Done);
                        }
                        self.serve_push(raw, &token, request, leftover, false).await;
                        return Ok(WrapOutcome::Done);
                    }
                    respond(&mut raw, 400, "bad request").await;
                    return Ok(WrapOutcome::Done);
                }

                // Stream-one: one full-duplex POST carries the session.
                raw.write_all(chunked_response_header()).await?;
                raw.flush().await?;
                let kind = body_kind(&request.headers)?;
                let stream = BodyStream::new(raw, leftover, kind);
                debug!("stream-one tunnel established");
                Ok(WrapOutcome::StartTunnel {
                    stream: Box::new(stream),
                    config: cfg.derived_without_mask(),
                })
            }
            _ => {
                respond(&mut raw, 400, "bad request").await;
                Ok(WrapOutcome::Done)
            }
        }
    }

    async fn handle_poll(
        &self,
        mut raw: Stream,
        request: RequestHeader,
        leftover: Vec<u8>,
        cfg: &ProtocolConfig,
    ) -> Result<WrapOutcome> {
        let token = request.query_param("token").map(str::to_string);
        let close_flag = request.query_param("close") == Some("1");

        match request.method.as_str() {
            "GET" => match token {
                None => self.authorize_session(raw, cfg).await,
                Some(token) => {
                    self.serve_pull(raw, &token, true).await;
                    Ok(WrapOutcome::Done)
                }
            },
            "POST" => {
                let Some(token) = token else {
                    respond(&mut raw, 400, "missing token").await;
                    return Ok(WrapOutcome::Done);
                };
                if close_flag {
                    self.close_session(&token);
                    respond(&mut raw, 200, "").await;
                    return Ok(WrapOutcome::Done);
                }
                self.serve_push(raw, &token, request, leftover, true).await;
                Ok(WrapOutcome::Done)
            }
            _ => {
                respond(&mut raw, 400, "bad request").await;
                Ok(WrapOutcome::Done)
            }
        }
    }

    async fn authorize_session(
        &self,
        mut raw: Stream,
        cfg: &ProtocolConfig,
    ) -> Result<WrapOutcome> {
        let token = new_session_token();
        let (tunnel_side, session_side) = tokio::io::duplex(SESSION_PIPE_CAPACITY);
        let (read_half, write_half) = tokio::io::split(session_side);

        let session = Arc::new(TunnelSession {
            read_half: tokio::sync::Mutex::new(read_half),
            write_half: tokio::sync::Mutex::new(write_half),
            last_active: Mutex::new(Instant::now()),
            closed: Notify::new(),
            closed_flag: AtomicBool::new(false),
        });
        self.sessions
            .lock()
            .expect("session map poisoned")
            .insert(token.clone(), Arc::clone(&session));
        self.spawn_reaper(token.clone());

        debug!(%token, "tunnel session authorized");
        let body = format!("token={token}");
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nCache-Control: no-store\r\nPragma: no-cache\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        let _ = raw.write_all(head.as_bytes()).await;
        let _ = raw.shutdown().await;

        Ok(WrapOutcome::StartTunnel {
            stream: Box::new(tunnel_side),
            config: cfg.derived_without_mask(),
        })
    }

    fn spawn_reaper(&self, token: String) {
        let sessions = Arc::clone(&self.sessions);
        let server_closed = Arc::clone(&self.closed);
        let ttl = self.session_ttl;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(ttl).await;
                if server_closed.load(Ordering::SeqCst) {
                    return;
                }
                let session = {
                    let map = sessions.lock().expect("session map poisoned");
                    match map.get(&token) {
                        Some(s) => Arc::clone(s),
                        None => return,
                    }
                };
                if session.idle_for() >= ttl {
                    sessions
                        .lock()
                        .expect("session map poisoned")
                        .remove(&token);
                    session.mark_closed();
                    debug!(%token, "tunnel session reaped after idle ttl");
                    return;
                }
            }
        });
    }

    fn get_session(&self, token: &str) -> Option<Arc<TunnelSession>> {
        let map = self.sessions.lock().expect("session map poisoned");
        let session = map.get(token)?;
        session.touch();
        Some(Arc::clone(session))
    }

    fn close_session(&self, token: &str) {
        let removed = self
            .sessions
            .lock()
            .expect("session map poisoned")
            .remove(token);
        if let Some(session) = removed {
            session.mark_closed();
            debug!(%token, "tunnel session closed");
        }
    }

    /// Uplink push: decode the request body into the session pipe.
    async fn serve_push(
        &self,
        mut raw: Stream,
        token: &str,
        request: RequestHeader,
        leftover: Vec<u8>,
        poll_mode: bool,
    ) {
        let Some(session) = self.get_session(token) else {
            respond(&mut raw, 403, "forbidden").await;
            return;
        };

        let kind = match body_kind(&request.headers) {
            Ok(kind) => kind,
            Err(_) => {
                respond(&mut raw, 400, "bad request").await;
                return;
            }
        };
        if matches!(kind, BodyKind::Length(n) if n as usize > MAX_UPLOAD_BYTES) {
            respond(&mut raw, 413, "too large").await;
            return;
        }
        let body = match http1::read_full_body(&mut raw, leftover, kind, MAX_UPLOAD_BYTES).await {
            Ok(body) => body,
            Err(_) => {
                respond(&mut raw, 400, "bad request").await;
                return;
            }
        };

        let payload = if poll_mode {
            match decode_poll_lines(&body) {
                Ok(payload) => payload,
                Err(_) => {
                    respond(&mut raw, 400, "bad request").await;
                    return;
                }
            }
        } else {
            body
        };

        if !payload.is_empty() {
            let mut writer = session.write_half.lock().await;
            let write = tokio::time::timeout(SESSION_WRITE_TIMEOUT, writer.write_all(&payload));
            match write.await {
                Ok(Ok(())) => {}
                _ => {
                    drop(writer);
                    self.close_session(token);
                    respond(&mut raw, 410, "gone").await;
                    return;
                }
            }
        }
        respond(&mut raw, 200, "").await;
    }

    /// Downlink pull: stream pipe reads out as one chunked response until
    /// the per-read idle timeout or session end. A timed-out pull ends only
    /// this request; the client re-issues it.
    async fn serve_pull(&self, mut raw: Stream, token: &str, poll_mode: bool) {
        let Some(session) = self.get_session(token) else {
            respond(&mut raw, 403, "forbidden").await;
            return;
        };

        if raw.write_all(chunked_response_header()).await.is_err() {
            return;
        }

        let mut reader = session.read_half.lock().await;
        let mut buf = vec![0u8; 32 * 1024];
        let mut wire = Vec::with_capacity(64 * 1024);
        loop {
            if session.is_closed() {
                break;
            }
            let read = tokio::select! {
                r = tokio::time::timeout(self.pull_read_timeout, reader.read(&mut buf)) => r,
                _ = session.closed.notified() => break,
            };
            match read {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    session.touch();
                    wire.clear();
                    if poll_mode {
                        let mut line = BASE64.encode(&buf[..n]).into_bytes();
                        line.push(b'\n');
                        encode_chunk(&line, &mut wire);
                    } else {
                        encode_chunk(&buf[..n], &mut wire);
                    }
                    if raw.write_all(&wire).await.is_err() || raw.flush().await.is_err() {
                        break;
                    }
                }
                Ok(Err(_)) => {
                    drop(reader);
                    self.close_session(token);
                    let mut tail = Vec::new();
                    encode_final_chunk(&mut tail);
                    let _ = raw.write_all(&tail).await;
                    return;
                }
                Err(_) => {
                    // Idle: end this long-poll; poll mode sends a keepalive
                    // blank line first.
                    if poll_mode {
                        wire.clear();
                        encode_chunk(b"\n", &mut wire);
                        let _ = raw.write_all(&wire).await;
                    }
                    break;
                }
            }
        }

        let mut tail = Vec::new();
        encode_final_chunk(&mut tail);
        let _ = raw.write_all(&tail).await;
        let _ = raw.flush().await;
    }
}

enum Sniffed {
    NotHttp {
        stream: Stream,
        buffer: Vec<u8>,
    },
    Http {
        stream: Stream,
        buffer: Vec<u8>,
        request: RequestHeader,
        body_offset: usize,
    },
}

async fn sniff_request(mut stream: Stream) -> Result<Sniffed> {
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    while buffer.len() < 4 {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(Sniffed::NotHttp { stream, buffer });
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
    if !masker::looks_like_http_request_start(&buffer[..4]) {
        return Ok(Sniffed::NotHttp { stream, buffer });
    }

    loop {
        match parse_request_header(&buffer) {
            Ok(HeaderParse::Complete { header, consumed }) => {
                return Ok(Sniffed::Http {
                    stream,
                    buffer,
                    request: header,
                    body_offset: consumed,
                });
            }
            Ok(HeaderParse::NeedMore) => {}
            // Not valid HTTP after all; replay to the raw handler.
            Err(_) => return Ok(Sniffed::NotHttp { stream, buffer }),
        }
        if buffer.len() > MAX_HEADER_BYTES {
            return Ok(Sniffed::NotHttp { stream, buffer });
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(Sniffed::NotHttp { stream, buffer });
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
}

fn new_session_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Split newline-delimited base64 lines into the raw payload.
pub(crate) fn decode_poll_lines(body: &[u8]) -> Result<Vec<u8>> {
    let mut payload = Vec::with_capacity(body.len());
    for line in body.split(|&b| b == b'\n') {
        let line = match line.strip_suffix(b"\r") {
            Some(stripped) => stripped,
            None => line,
        };
        let trimmed: Vec<u8> = line
            .iter()
            .copied()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        if trimmed.is_empty() {
            continue;
        }
        let decoded = BASE64
            .decode(&trimmed)
            .map_err(|_| Error::Tunnel("malformed base64 push line".into()))?;
        payload.extend_from_slice(&decoded);
    }
    Ok(payload)
}

fn chunked_response_header() -> &'static [u8] {
    b"HTTP/1.1 200 OK\r\n\
      Content-Type: application/octet-stream\r\n\
      Transfer-Encoding: chunked\r\n\
      Cache-Control: no-store\r\n\
      Pragma: no-cache\r\n\
      Connection: keep-alive\r\n\
      X-Accel-Buffering: no\r\n\
      \r\n"
}

async fn respond(raw: &mut Stream, status: u16, body: &str) {
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        410 => "Gone",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        _ => "Unknown",
    };
    let body = if body.is_empty() { reason } else { body };
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    if let Err(e) = raw.write_all(head.as_bytes()).await {
        warn!("failed to write http response: {e}");
    }
    let _ = raw.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cfg(mode: &str) -> ProtocolConfig {
        let mut cfg = ProtocolConfig {
            key: "tunnel server key".into(),
            http_mask_mode: mode.into(),
            ..ProtocolConfig::default()
        };
        cfg.build_tables(false).unwrap();
        cfg
    }

    #[test]
    fn test_decode_poll_lines_roundtrip() {
        let chunks: [&[u8]; 3] = [b"first", &[0u8, 1, 254, 255], b""];
        let mut body = Vec::new();
        for chunk in chunks {
            body.extend_from_slice(BASE64.encode(chunk).as_bytes());
            body.push(b'\n');
        }
        body.extend_from_slice(b"\r\n\n"); // keepalives
        let decoded = decode_poll_lines(&body).unwrap();
        assert_eq!(decoded, b"first\x00\x01\xfe\xff");
    }

    #[test]
    fn test_decode_poll_lines_rejects_garbage() {
        assert!(decode_poll_lines(b"!!! not base64 !!!\n").is_err());
    }

    #[tokio::test]
    async fn test_non_http_passthrough_replays_bytes() {
        let server = TunnelServer::new(&test_cfg("stream"));
        let (mut client, conn) = tokio::io::duplex(4096);
        client.write_all(b"\x01\x02\x03\x04raw bytes").await.unwrap();

        let cfg = test_cfg("stream");
        match server.wrap_conn(Box::new(conn), &cfg).await.unwrap() {
            WrapOutcome::Passthrough(mut stream) => {
                let mut got = vec![0u8; 13];
                stream.read_exact(&mut got).await.unwrap();
                assert_eq!(&got, b"\x01\x02\x03\x04raw bytes");
            }
            _ => panic!("expected passthrough"),
        }
    }

    #[tokio::test]
    async fn test_camouflage_http_without_tunnel_header_passes_through() {
        let server = TunnelServer::new(&test_cfg("stream"));
        let (mut client, conn) = tokio::io::duplex(8192);
        let header = b"POST /api/v1/upload HTTP/1.1\r\nHost: x\r\nContent-Length: 9999\r\n\r\n";
        client.write_all(header).await.unwrap();
        client.write_all(b"obfs...").await.unwrap();

        let cfg = test_cfg("stream");
        match server.wrap_conn(Box::new(conn), &cfg).await.unwrap() {
            WrapOutcome::Passthrough(mut stream) => {
                // The entire header must be replayed for the legacy strip.
                let mut got = vec![0u8; header.len()];
                stream.read_exact(&mut got).await.unwrap();
                assert_eq!(&got[..], &header[..]);
            }
            _ => panic!("expected passthrough"),
        }
    }

    #[tokio::test]
    async fn test_legacy_mode_rejects_tunnel_requests() {
        let server = TunnelServer::new(&test_cfg("legacy"));
        let (mut client, conn) = tokio::io::duplex(8192);
        client
            .write_all(
                b"GET /session HTTP/1.1\r\nHost: x\r\nX-Sudoku-Tunnel: stream\r\n\r\n",
            )
            .await
            .unwrap();

        let cfg = test_cfg("legacy");
        match server.wrap_conn(Box::new(conn), &cfg).await.unwrap() {
            WrapOutcome::Done => {}
            _ => panic!("expected done"),
        }
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 404"));
    }

    #[tokio::test]
    async fn test_authorize_issues_token_and_starts_tunnel() {
        let server = TunnelServer::new(&test_cfg("stream"));
        let (mut client, conn) = tokio::io::duplex(8192);
        client
            .write_all(b"GET /session HTTP/1.1\r\nHost: x\r\nX-Sudoku-Tunnel: stream\r\n\r\n")
            .await
            .unwrap();

        let cfg = test_cfg("stream");
        let outcome = server.wrap_conn(Box::new(conn), &cfg).await.unwrap();
        let WrapOutcome::StartTunnel { config, .. } = outcome else {
            panic!("expected tunnel start");
        };
        assert!(config.disable_http_mask);

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 200"));
        assert!(text.contains("token="));
    }

    #[tokio::test]
    async fn test_push_to_unknown_token_is_forbidden() {
        let server = TunnelServer::new(&test_cfg("poll"));
        let (mut client, conn) = tokio::io::duplex(8192);
        client
            .write_all(
                b"POST /api/v1/upload?token=nope HTTP/1.1\r\nHost: x\r\nX-Sudoku-Tunnel: poll\r\nContent-Length: 0\r\n\r\n",
            )
            .await
            .unwrap();

        let cfg = test_cfg("poll");
        match server.wrap_conn(Box::new(conn), &cfg).await.unwrap() {
            WrapOutcome::Done => {}
            _ => panic!("expected done"),
        }
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 403"));
    }
}
