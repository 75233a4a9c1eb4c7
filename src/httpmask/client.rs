//! Client side of the HTTP tunnel
//!
//! Establishes a duplex byte stream over plain HTTP requests:
//! - stream-split: authorize for a token, batched POST uplink, re-issued
//!   chunked GET downlink (CDN-friendly)
//! - stream-one: one long-lived POST, request body up / chunked response
//!   body down
//! - poll: split-session with base64 line framing for binary-hostile
//!   intermediaries
//! - auto: stream on a short leash, then poll
//!
//! Every request dials a fresh connection through the caller's dialer and
//! carries browser-shaped headers plus the tunnel marker header.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::{mpsc, watch};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::common::{Dialer, Stream};
use crate::config::{MaskMode, ProtocolConfig};
use crate::error::{Error, Result};

use super::http1::{body_kind, read_full_body, read_response_head, BodyStream, ChunkedDecoder};
use super::masker;

const AUTO_STREAM_TIMEOUT: Duration = Duration::from_secs(3);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const PULL_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CLOSE_REQUEST_TIMEOUT: Duration = Duration::from_millis(300);
const IDLE_PULL_BACKOFF: Duration = Duration::from_millis(25);
const FLUSH_INTERVAL: Duration = Duration::from_millis(5);

const STREAM_MAX_BATCH: usize = 256 * 1024;
const POLL_MAX_BATCH: usize = 64 * 1024;
const POLL_MAX_LINE_RAW: usize = 16 * 1024;

const CHANNEL_DEPTH: usize = 256;

/// Resolved dial coordinates for every tunnel request.
#[derive(Debug, Clone)]
pub(crate) struct DialTarget {
    /// Where TCP actually connects.
    dial_addr: String,
    /// Host header value.
    header_host: String,
    /// SNI name when TLS is on.
    server_name: String,
    tls: bool,
}

/// Resolve the dial target from the configured server address, TLS flag
/// and optional host override ("example.com" or "example.com:443").
pub(crate) fn resolve_target(cfg: &ProtocolConfig) -> Result<DialTarget> {
    let (host, port) = split_host_port(&cfg.server_address)?;
    let (header_name, port) = match cfg.http_mask_host.trim() {
        "" => (host.clone(), port),
        over => match split_host_port(over) {
            Ok((h, p)) => (h, p),
            Err(_) => (over.to_string(), port),
        },
    };

    let default_port = if cfg.http_mask_tls { "443" } else { "80" };
    let header_host = if port == default_port {
        bracket_ipv6(&header_name)
    } else {
        format!("{}:{}", bracket_ipv6(&header_name), port)
    };

    Ok(DialTarget {
        dial_addr: format!("{}:{}", bracket_ipv6(&host), port),
        header_host,
        server_name: header_name,
        tls: cfg.http_mask_tls,
    })
}

fn split_host_port(addr: &str) -> Result<(String, String)> {
    let addr = addr.trim();
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| Error::InvalidAddress(format!("bad address {addr:?}")))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| Error::InvalidAddress(format!("missing port in {addr:?}")))?;
        return Ok((host.to_string(), port.to_string()));
    }
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !port.is_empty() && !host.contains(':') => {
            Ok((host.to_string(), port.to_string()))
        }
        _ => Err(Error::InvalidAddress(format!("missing port in {addr:?}"))),
    }
}

fn bracket_ipv6(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

/// Open one raw (optionally TLS-wrapped) connection to the target.
async fn connect(dialer: &Arc<dyn Dialer>, target: &DialTarget) -> Result<Stream> {
    let raw = dialer.dial(&target.dial_addr).await?;
    if !target.tls {
        return Ok(raw);
    }

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let name = ServerName::try_from(target.server_name.clone())
        .map_err(|_| Error::InvalidAddress(format!("bad SNI name {:?}", target.server_name)))?;
    let tls = connector
        .connect(name, raw)
        .await
        .map_err(|e| Error::Tunnel(format!("tls handshake failed: {e}")))?;
    Ok(Box::new(tls))
}

enum RequestBody<'a> {
    None,
    Full(&'a [u8]),
    /// Announce a chunked request body; the caller streams it afterwards.
    ChunkedFollows,
}

fn build_request_head(
    method: &str,
    target_path: &str,
    target: &DialTarget,
    mode: MaskMode,
    content_type: Option<&str>,
    body: &RequestBody<'_>,
) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let ua = masker::USER_AGENTS[rng.gen_range(0..masker::USER_AGENTS.len())];
    let accept = masker::ACCEPTS[rng.gen_range(0..masker::ACCEPTS.len())];
    let lang = masker::ACCEPT_LANGUAGES[rng.gen_range(0..masker::ACCEPT_LANGUAGES.len())];
    let enc = masker::ACCEPT_ENCODINGS[rng.gen_range(0..masker::ACCEPT_ENCODINGS.len())];

    let mut head = Vec::with_capacity(512);
    head.extend_from_slice(format!("{method} {target_path} HTTP/1.1\r\n").as_bytes());
    head.extend_from_slice(format!("Host: {}\r\n", target.header_host).as_bytes());
    head.extend_from_slice(format!("User-Agent: {ua}\r\n").as_bytes());
    head.extend_from_slice(format!("Accept: {accept}\r\n").as_bytes());
    head.extend_from_slice(format!("Accept-Language: {lang}\r\n").as_bytes());
    head.extend_from_slice(format!("Accept-Encoding: {enc}\r\n").as_bytes());
    head.extend_from_slice(b"Cache-Control: no-cache\r\nPragma: no-cache\r\nConnection: keep-alive\r\n");
    head.extend_from_slice(format!("X-Sudoku-Tunnel: {}\r\n", mode.as_str()).as_bytes());
    head.extend_from_slice(b"X-Sudoku-Version: 1\r\n");
    if let Some(ctype) = content_type {
        head.extend_from_slice(format!("Content-Type: {ctype}\r\n").as_bytes());
    }
    match body {
        RequestBody::None => {}
        RequestBody::Full(data) => {
            head.extend_from_slice(format!("Content-Length: {}\r\n", data.len()).as_bytes());
        }
        RequestBody::ChunkedFollows => {
            head.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
        }
    }
    head.extend_from_slice(b"\r\n");
    if let RequestBody::Full(data) = body {
        head.extend_from_slice(data);
    }
    head
}

/// One complete request/response exchange on a fresh connection.
async fn http_roundtrip(
    dialer: &Arc<dyn Dialer>,
    target: &DialTarget,
    request: Vec<u8>,
) -> Result<(super::http1::ResponseHeader, Stream, Vec<u8>)> {
    let mut conn = connect(dialer, target).await?;
    conn.write_all(&request).await?;
    conn.flush().await?;
    let (head, leftover) = read_response_head(&mut conn).await?;
    Ok((head, conn, leftover))
}

fn parse_tunnel_token(body: &[u8]) -> Result<String> {
    let text = String::from_utf8_lossy(body);
    let idx = text
        .find("token=")
        .ok_or_else(|| Error::Tunnel("missing token".into()))?;
    let token: String = text[idx + "token=".len()..]
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if token.is_empty() {
        return Err(Error::Tunnel("empty token".into()));
    }
    Ok(token)
}

async fn authorize(
    dialer: &Arc<dyn Dialer>,
    target: &DialTarget,
    mode: MaskMode,
) -> Result<String> {
    let request = build_request_head("GET", "/session", target, mode, None, &RequestBody::None);
    let (head, mut conn, leftover) = http_roundtrip(dialer, target, request).await?;
    if head.status != 200 {
        return Err(Error::Tunnel(format!(
            "authorize bad status: {}",
            head.status
        )));
    }
    let kind = body_kind(&head.headers)?;
    let body = read_full_body(&mut conn, leftover, kind, 4 * 1024).await?;
    parse_tunnel_token(&body)
}

/// Establish the tunnel stream for the configured mode.
pub async fn dial_tunnel(cfg: &ProtocolConfig, dialer: Arc<dyn Dialer>) -> Result<Stream> {
    let target = resolve_target(cfg)?;
    match cfg.mask_mode() {
        MaskMode::Legacy => Err(Error::Tunnel("legacy mode does not use http tunnel".into())),
        MaskMode::Stream => dial_stream(&dialer, &target).await,
        MaskMode::Poll => dial_poll(&dialer, &target).await,
        MaskMode::Auto => {
            // Stream can hang on CDNs that buffer request bodies; keep it on
            // a short leash so poll still fits the caller's deadline.
            let attempt = tokio::time::timeout(AUTO_STREAM_TIMEOUT, dial_stream(&dialer, &target));
            let stream_err = match attempt.await {
                Ok(Ok(conn)) => return Ok(conn),
                Ok(Err(e)) => e.to_string(),
                Err(_) => "timed out".to_string(),
            };
            match dial_poll(&dialer, &target).await {
                Ok(conn) => Ok(conn),
                Err(poll_err) => Err(Error::Tunnel(format!(
                    "auto tunnel failed: stream: {stream_err}; poll: {poll_err}"
                ))),
            }
        }
    }
}

async fn dial_stream(dialer: &Arc<dyn Dialer>, target: &DialTarget) -> Result<Stream> {
    // Split session is CDN-friendly; stream-one covers plain deployments.
    let split_err = match dial_stream_split(dialer, target).await {
        Ok(conn) => return Ok(conn),
        Err(e) => e.to_string(),
    };
    match dial_stream_one(dialer, target).await {
        Ok(conn) => Ok(conn),
        Err(one_err) => Err(Error::Tunnel(format!(
            "dial stream failed: split: {split_err}; stream-one: {one_err}"
        ))),
    }
}

async fn dial_stream_split(dialer: &Arc<dyn Dialer>, target: &DialTarget) -> Result<Stream> {
    let token = authorize(dialer, target, MaskMode::Stream).await?;
    debug!(%token, "stream-split tunnel authorized");
    Ok(TunnelConn::spawn(
        Arc::clone(dialer),
        target.clone(),
        token,
        MaskMode::Stream,
    ))
}

async fn dial_stream_one(dialer: &Arc<dyn Dialer>, target: &DialTarget) -> Result<Stream> {
    let mut rng = rand::thread_rng();
    let path = masker::PATHS[rng.gen_range(0..masker::PATHS.len())];
    let ctype = masker::CONTENT_TYPES[rng.gen_range(0..masker::CONTENT_TYPES.len())];
    drop(rng);

    let head = build_request_head(
        "POST",
        path,
        target,
        MaskMode::Stream,
        Some(ctype),
        &RequestBody::ChunkedFollows,
    );
    let mut conn = connect(dialer, target).await?;
    conn.write_all(&head).await?;
    conn.flush().await?;

    let (resp, leftover) =
        match tokio::time::timeout(REQUEST_TIMEOUT, read_response_head(&mut conn)).await {
            Ok(result) => result?,
            Err(_) => return Err(Error::Tunnel("stream-one response timed out".into())),
        };
    if resp.status != 200 {
        return Err(Error::Tunnel(format!(
            "stream bad status: {}",
            resp.status
        )));
    }
    let kind = body_kind(&resp.headers)?;
    debug!("stream-one tunnel established");
    Ok(Box::new(BodyStream::new(conn, leftover, kind)))
}

async fn dial_poll(dialer: &Arc<dyn Dialer>, target: &DialTarget) -> Result<Stream> {
    let token = authorize(dialer, target, MaskMode::Poll).await?;
    debug!(%token, "poll tunnel authorized");
    Ok(TunnelConn::spawn(
        Arc::clone(dialer),
        target.clone(),
        token,
        MaskMode::Poll,
    ))
}

struct TunnelShared {
    closed_tx: watch::Sender<bool>,
}

impl TunnelShared {
    fn new() -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self { closed_tx }
    }

    fn close(&self) {
        let _ = self.closed_tx.send(true);
    }

    fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }
}

/// Resolve when the session is marked closed. Race-free: watch receivers
/// never miss a value sent before registration.
async fn closed_signal(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Split-session stream: reads come from the pull task, writes feed the
/// push batcher. Used for both stream-split and poll modes.
struct TunnelConn {
    rx: mpsc::Receiver<Vec<u8>>,
    read_buf: Vec<u8>,
    read_pos: usize,

    tx: mpsc::Sender<Vec<u8>>,
    write_waker: Arc<Mutex<Option<Waker>>>,

    shared: Arc<TunnelShared>,
}

impl TunnelConn {
    fn spawn(dialer: Arc<dyn Dialer>, target: DialTarget, token: String, mode: MaskMode) -> Stream {
        let (up_tx, up_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (down_tx, down_rx) = mpsc::channel(CHANNEL_DEPTH);
        let shared = Arc::new(TunnelShared::new());
        let write_waker: Arc<Mutex<Option<Waker>>> = Arc::new(Mutex::new(None));

        tokio::spawn(push_loop(
            Arc::clone(&dialer),
            target.clone(),
            token.clone(),
            mode,
            up_rx,
            Arc::clone(&write_waker),
            Arc::clone(&shared),
        ));
        tokio::spawn(pull_loop(
            dialer,
            target,
            token,
            mode,
            down_tx,
            Arc::clone(&shared),
        ));

        Box::new(TunnelConn {
            rx: down_rx,
            read_buf: Vec::new(),
            read_pos: 0,
            tx: up_tx,
            write_waker,
            shared,
        })
    }
}

impl AsyncRead for TunnelConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.read_pos < this.read_buf.len() {
            let available = &this.read_buf[this.read_pos..];
            let n = available.len().min(buf.remaining());
            buf.put_slice(&available[..n]);
            this.read_pos += n;
            if this.read_pos == this.read_buf.len() {
                this.read_buf.clear();
                this.read_pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(data)) => {
                let n = data.len().min(buf.remaining());
                buf.put_slice(&data[..n]);
                if n < data.len() {
                    this.read_buf = data;
                    this.read_pos = n;
                }
                Poll::Ready(Ok(()))
            }
            // Pull task ended: session is over.
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for TunnelConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let this = self.get_mut();
        if this.shared.is_closed() {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "tunnel closed",
            )));
        }
        match this.tx.try_send(buf.to_vec()) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(mpsc::error::TrySendError::Full(_)) => {
                *this.write_waker.lock().expect("waker slot poisoned") = Some(cx.waker().clone());
                // Re-check: the push task may have drained between try_send
                // and waker registration.
                match this.tx.try_send(buf.to_vec()) {
                    Ok(()) => Poll::Ready(Ok(buf.len())),
                    Err(mpsc::error::TrySendError::Full(_)) => Poll::Pending,
                    Err(mpsc::error::TrySendError::Closed(_)) => Poll::Ready(Err(
                        std::io::Error::new(std::io::ErrorKind::BrokenPipe, "tunnel closed"),
                    )),
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "tunnel closed",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        // The push task flushes on its own interval.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.get_mut().shared.close();
        Poll::Ready(Ok(()))
    }
}

impl Drop for TunnelConn {
    fn drop(&mut self) {
        self.shared.close();
    }
}

fn wake_writer(slot: &Arc<Mutex<Option<Waker>>>) {
    if let Some(waker) = slot.lock().expect("waker slot poisoned").take() {
        waker.wake();
    }
}

/// Encode a poll-mode batch as newline-delimited base64 lines.
fn encode_poll_lines(batch: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(batch.len() * 4 / 3 + 16);
    for chunk in batch.chunks(POLL_MAX_LINE_RAW) {
        body.extend_from_slice(BASE64.encode(chunk).as_bytes());
        body.push(b'\n');
    }
    body
}

async fn push_batch(
    dialer: &Arc<dyn Dialer>,
    target: &DialTarget,
    token: &str,
    mode: MaskMode,
    batch: &[u8],
) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }
    let path = format!("/api/v1/upload?token={token}");
    let (body, ctype) = match mode {
        MaskMode::Poll => (encode_poll_lines(batch), "text/plain"),
        _ => (batch.to_vec(), "application/octet-stream"),
    };
    let request = build_request_head(
        "POST",
        &path,
        target,
        mode,
        Some(ctype),
        &RequestBody::Full(&body),
    );

    let exchange = http_roundtrip(dialer, target, request);
    let (head, _conn, _leftover) = match tokio::time::timeout(REQUEST_TIMEOUT, exchange).await {
        Ok(result) => result?,
        Err(_) => return Err(Error::Timeout),
    };
    if head.status != 200 {
        return Err(Error::Tunnel(format!("push bad status: {}", head.status)));
    }
    Ok(())
}

async fn push_loop(
    dialer: Arc<dyn Dialer>,
    target: DialTarget,
    token: String,
    mode: MaskMode,
    mut rx: mpsc::Receiver<Vec<u8>>,
    write_waker: Arc<Mutex<Option<Waker>>>,
    shared: Arc<TunnelShared>,
) {
    let max_batch = match mode {
        MaskMode::Poll => POLL_MAX_BATCH,
        _ => STREAM_MAX_BATCH,
    };
    let mut batch: Vec<u8> = Vec::with_capacity(max_batch);
    let mut closed_rx = shared.subscribe();
    let mut tick = tokio::time::interval(FLUSH_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            item = rx.recv() => {
                match item {
                    Some(data) => {
                        wake_writer(&write_waker);
                        batch.extend_from_slice(&data);
                        if batch.len() >= max_batch {
                            if push_batch(&dialer, &target, &token, mode, &batch).await.is_err() {
                                break;
                            }
                            batch.clear();
                        }
                    }
                    None => {
                        let _ = push_batch(&dialer, &target, &token, mode, &batch).await;
                        break;
                    }
                }
            }
            _ = tick.tick() => {
                if !batch.is_empty() {
                    if push_batch(&dialer, &target, &token, mode, &batch).await.is_err() {
                        break;
                    }
                    batch.clear();
                }
            }
            _ = closed_signal(&mut closed_rx) => {
                // Drain anything the writer already queued, then flush.
                while let Ok(data) = rx.try_recv() {
                    batch.extend_from_slice(&data);
                }
                let _ = push_batch(&dialer, &target, &token, mode, &batch).await;
                break;
            }
        }
    }

    shared.close();
    wake_writer(&write_waker);
    send_close_request(&dialer, &target, &token, mode).await;
}

/// Best-effort session teardown so the server does not wait out the TTL.
async fn send_close_request(
    dialer: &Arc<dyn Dialer>,
    target: &DialTarget,
    token: &str,
    mode: MaskMode,
) {
    let path = format!("/api/v1/upload?token={token}&close=1");
    let request = build_request_head("POST", &path, target, mode, None, &RequestBody::Full(&[]));
    let exchange = http_roundtrip(dialer, target, request);
    if tokio::time::timeout(CLOSE_REQUEST_TIMEOUT, exchange)
        .await
        .is_err()
    {
        debug!("close request timed out");
    }
}

async fn pull_loop(
    dialer: Arc<dyn Dialer>,
    target: DialTarget,
    token: String,
    mode: MaskMode,
    tx: mpsc::Sender<Vec<u8>>,
    shared: Arc<TunnelShared>,
) {
    let mut closed_rx = shared.subscribe();
    loop {
        if shared.is_closed() {
            break;
        }
        match pull_once(&dialer, &target, &token, mode, &tx, &shared).await {
            Ok(got_any) => {
                if !got_any {
                    // Avoid a tight loop when the server replies instantly
                    // with an empty long-poll.
                    tokio::select! {
                        _ = tokio::time::sleep(IDLE_PULL_BACKOFF) => {}
                        _ = closed_signal(&mut closed_rx) => break,
                    }
                }
            }
            Err(e) => {
                if !shared.is_closed() {
                    warn!("tunnel pull failed: {e}");
                }
                break;
            }
        }
    }
    shared.close();
    // tx drops here; the conn's reader sees EOF.
}

/// One pull request: read the chunked response and forward payload.
/// Returns whether any payload arrived.
async fn pull_once(
    dialer: &Arc<dyn Dialer>,
    target: &DialTarget,
    token: &str,
    mode: MaskMode,
    tx: &mpsc::Sender<Vec<u8>>,
    shared: &Arc<TunnelShared>,
) -> Result<bool> {
    let path = format!("/stream?token={token}");
    let request = build_request_head("GET", &path, target, mode, None, &RequestBody::None);
    let exchange = http_roundtrip(dialer, target, request);
    let (head, mut conn, leftover) = match tokio::time::timeout(REQUEST_TIMEOUT, exchange).await {
        Ok(result) => result?,
        Err(_) => return Err(Error::Timeout),
    };
    if head.status != 200 {
        return Err(Error::Tunnel(format!("pull bad status: {}", head.status)));
    }

    let mut decoder = ChunkedDecoder::new();
    let mut line_buf: Vec<u8> = Vec::new();
    let mut got_any = false;

    let mut pending = leftover;
    let mut chunk = [0u8; 32 * 1024];
    loop {
        if shared.is_closed() {
            return Ok(got_any);
        }
        if !pending.is_empty() {
            let mut decoded = Vec::new();
            let used = decoder.feed(&pending, &mut decoded)?;
            pending.drain(..used);
            if !decoded.is_empty() {
                match mode {
                    MaskMode::Poll => {
                        line_buf.extend_from_slice(&decoded);
                        while let Some(nl) = line_buf.iter().position(|&b| b == b'\n') {
                            let line: Vec<u8> = line_buf.drain(..=nl).collect();
                            let line = &line[..line.len() - 1];
                            let line = line.strip_suffix(b"\r").unwrap_or(line);
                            if line.is_empty() {
                                continue; // keepalive
                            }
                            let payload = BASE64.decode(line).map_err(|_| {
                                Error::Tunnel("malformed base64 pull line".into())
                            })?;
                            if payload.is_empty() {
                                continue;
                            }
                            got_any = true;
                            if tx.send(payload).await.is_err() {
                                return Ok(got_any);
                            }
                        }
                    }
                    _ => {
                        got_any = true;
                        if tx.send(decoded).await.is_err() {
                            return Ok(got_any);
                        }
                    }
                }
            }
            if decoder.is_done() {
                return Ok(got_any);
            }
            continue;
        }

        // A per-read idle deadline ends only this request; decoded data has
        // already been forwarded, so reissuing loses nothing.
        let n = match tokio::time::timeout(PULL_REQUEST_TIMEOUT, conn.read(&mut chunk)).await {
            Ok(result) => result?,
            Err(_) => return Ok(got_any),
        };
        if n == 0 {
            // Long-poll ended without a terminator; reissue.
            return Ok(got_any);
        }
        pending.extend_from_slice(&chunk[..n]);
    }
}
