//! Handshake & table-probe engine
//!
//! Client: optional camouflage header, then the obfuscated+AEAD stack over
//! one randomly picked candidate table carrying a 16-byte handshake block
//! (big-endian unix seconds, key tag) and the downlink-mode byte. Server:
//! strips one camouflage header if present, selects the client's table by
//! blind trial decoding over a buffered prefix, replays those bytes into
//! the real decoder, validates freshness and mode, then classifies the
//! session as TCP relay or UDP-over-TCP.

mod probe;

pub use probe::{probe_all, probe_candidate, ProbeOutcome};

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::common::{Address, Dialer, PreBufferedStream, Stream};
use crate::config::ProtocolConfig;
use crate::crypto::{derive_aead_key, handshake_tag, AeadCipher, AeadMethod, FramedStream};
use crate::error::{Error, Result};
use crate::httpmask::masker::{self, HeaderScan};
use crate::obfs::ObfsStream;
use crate::table::Table;
use crate::uot::{self, UotSocket, UOT_MAGIC, UOT_VERSION};

/// Size of the timestamp+tag handshake block.
pub const HANDSHAKE_LEN: usize = 16;

pub const DOWNLINK_MODE_PURE: u8 = 0x01;
pub const DOWNLINK_MODE_PACKED: u8 = 0x02;

/// Raw bytes the server will buffer while probing before giving up.
const MAX_PROBE_BUFFER: usize = 64 * 1024;

/// Allowed client/server clock drift in seconds.
const TIMESTAMP_SKEW_SECS: i64 = 60;

pub(crate) fn validate_timestamp(ts: i64, now: i64) -> bool {
    (now - ts).abs() <= TIMESTAMP_SKEW_SECS
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Mode byte announced by the client and expected by the server.
pub fn downlink_mode(cfg: &ProtocolConfig) -> u8 {
    if cfg.enable_pure_downlink {
        DOWNLINK_MODE_PURE
    } else {
        DOWNLINK_MODE_PACKED
    }
}

/// What a completed server handshake produced.
pub enum SessionKind {
    /// TCP relay toward the decoded target.
    Tcp { target: Address },
    /// UDP-over-TCP datagram session.
    Uot,
}

/// Runtime result of a completed server handshake.
pub struct ServerSession {
    pub stream: Stream,
    pub kind: SessionKind,
}

/// Stack the obfuscated codec and, unless the method is `none`, the AEAD
/// frame layer on top of a raw stream.
fn build_session_stream(
    inner: Stream,
    table: &Arc<Table>,
    cfg: &ProtocolConfig,
    secret: &str,
    client_side: bool,
) -> Result<Stream> {
    let obfs = if client_side {
        ObfsStream::client(
            inner,
            table,
            cfg.padding_min,
            cfg.padding_max,
            cfg.enable_pure_downlink,
        )
    } else {
        ObfsStream::server(
            inner,
            table,
            cfg.padding_min,
            cfg.padding_max,
            cfg.enable_pure_downlink,
        )
    };
    match cfg.parsed_aead()? {
        AeadMethod::None => Ok(Box::new(obfs)),
        method => {
            let key = derive_aead_key(secret, method)?;
            let cipher = AeadCipher::new(method, &key)?;
            Ok(Box::new(FramedStream::new(Box::new(obfs), cipher)))
        }
    }
}

fn build_handshake_block(secret: &str, table_index: Option<u8>) -> [u8; HANDSHAKE_LEN] {
    let mut block = [0u8; HANDSHAKE_LEN];
    block[..8].copy_from_slice(&(now_unix() as u64).to_be_bytes());
    block[8..].copy_from_slice(&handshake_tag(secret));
    if let Some(idx) = table_index {
        // Informational only; the server selects by probing.
        block[15] = idx;
    }
    block
}

/// Drive the client side of the handshake over an established raw stream.
/// The relay target (or UoT preface) is written by the caller afterwards.
pub async fn client_handshake(mut raw: Stream, cfg: &ProtocolConfig) -> Result<Stream> {
    cfg.validate()?;
    let secret = cfg.effective_key(true)?;

    if !cfg.disable_http_mask {
        let host = if cfg.server_address.is_empty() {
            "localhost"
        } else {
            cfg.server_address.as_str()
        };
        let header = masker::build_mask_header(host, cfg.mask_strategy());
        raw.write_all(&header).await?;
    }

    let table_index = rand::thread_rng().gen_range(0..cfg.tables.len());
    let table = &cfg.tables[table_index];
    debug!(table = table_index, "client handshake starting");

    let mut stream = build_session_stream(raw, table, cfg, &secret, true)?;

    let hint = (cfg.tables.len() > 1).then_some(table_index as u8);
    let block = build_handshake_block(&secret, hint);
    stream.write_all(&block).await?;
    stream.write_all(&[downlink_mode(cfg)]).await?;
    stream.flush().await?;

    Ok(stream)
}

/// Drive the server side of the handshake. The whole exchange runs under
/// the configured deadline; dropping the future on timeout closes the
/// socket, so no stale deadline can leak onto the relay phase.
pub async fn server_handshake(raw: Stream, cfg: &ProtocolConfig) -> Result<ServerSession> {
    cfg.validate()?;
    match tokio::time::timeout(cfg.handshake_timeout(), server_handshake_inner(raw, cfg)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout),
    }
}

async fn server_handshake_inner(mut raw: Stream, cfg: &ProtocolConfig) -> Result<ServerSession> {
    let secret = cfg.effective_key(false)?;
    let mut buffer: Vec<u8> = Vec::with_capacity(4096);
    let mut chunk = [0u8; 8 * 1024];

    // Strip exactly one camouflage header if the connection opens like HTTP.
    if !cfg.disable_http_mask {
        while buffer.len() < 4 {
            let n = raw.read(&mut chunk).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            buffer.extend_from_slice(&chunk[..n]);
        }
        if masker::looks_like_http_request_start(&buffer[..4]) {
            loop {
                match masker::scan_header_block(&buffer)? {
                    HeaderScan::Complete(end) => {
                        buffer.drain(..end);
                        break;
                    }
                    HeaderScan::NeedMore => {
                        let n = raw.read(&mut chunk).await?;
                        if n == 0 {
                            return Err(Error::Protocol(
                                "connection closed inside camouflage header".into(),
                            ));
                        }
                        buffer.extend_from_slice(&chunk[..n]);
                    }
                }
            }
        }
    }

    // Blind table selection over the buffered prefix. Candidates are only
    // ever evaluated against the buffer, never the live socket.
    let method = cfg.parsed_aead()?;
    let mut ciphers = Vec::with_capacity(cfg.tables.len());
    for _ in 0..cfg.tables.len() {
        ciphers.push(match method {
            AeadMethod::None => None,
            m => Some(AeadCipher::new(m, &derive_aead_key(&secret, m)?)?),
        });
    }
    let tag = handshake_tag(&secret);
    let expected_mode = downlink_mode(cfg);
    let mut alive = vec![true; cfg.tables.len()];

    let (table_index, embedded_hint) = loop {
        if !buffer.is_empty() {
            if let Some(selected) = probe_all(
                &buffer,
                &cfg.tables,
                &ciphers,
                &mut alive,
                &tag,
                expected_mode,
                now_unix(),
            )? {
                break selected;
            }
        }
        if buffer.len() >= MAX_PROBE_BUFFER {
            return Err(Error::TableProbeFailed);
        }
        let n = raw.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        buffer.extend_from_slice(&chunk[..n]);
    };

    if cfg.tables.len() > 1 && usize::from(embedded_hint) != table_index {
        // The embedded index is written by clients but never trusted here.
        debug!(
            embedded = embedded_hint,
            selected = table_index,
            "client table-index hint disagrees with probe result; ignoring hint"
        );
    }

    // Replay every probed byte into the real session decoder.
    let replay = PreBufferedStream::new(raw, buffer);
    let mut stream =
        build_session_stream(Box::new(replay), &cfg.tables[table_index], cfg, &secret, false)?;

    let mut block = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut block).await?;
    let mut ts_bytes = [0u8; 8];
    ts_bytes.copy_from_slice(&block[..8]);
    let ts = u64::from_be_bytes(ts_bytes) as i64;
    if !validate_timestamp(ts, now_unix()) {
        return Err(Error::TimestampSkew);
    }
    if block[8..15] != tag[..7] {
        return Err(Error::Protocol("handshake key tag mismatch".into()));
    }

    let mode = stream.read_u8().await?;
    if mode != expected_mode {
        return Err(Error::DownlinkModeMismatch {
            client: mode,
            server: expected_mode,
        });
    }

    let first = stream.read_u8().await?;
    if first == UOT_MAGIC {
        let version = stream.read_u8().await?;
        if version != UOT_VERSION {
            return Err(Error::Protocol(format!(
                "unsupported uot version: {version}"
            )));
        }
        info!("uot session established");
        return Ok(ServerSession {
            stream,
            kind: SessionKind::Uot,
        });
    }

    let mut prefixed = PreBufferedStream::new(stream, vec![first]);
    let target = Address::read_from(&mut prefixed).await?;
    info!(%target, "tcp relay session established");
    Ok(ServerSession {
        stream: Box::new(prefixed),
        kind: SessionKind::Tcp { target },
    })
}

/// Open the transport the configuration asks for: the HTTP tunnel for
/// stream/poll/auto modes, a raw connection otherwise.
async fn open_transport(
    cfg: &ProtocolConfig,
    dialer: &Arc<dyn Dialer>,
) -> Result<(Stream, bool)> {
    if !cfg.disable_http_mask && cfg.mask_mode().uses_tunnel() {
        let conn = crate::httpmask::dial_tunnel(cfg, Arc::clone(dialer)).await?;
        return Ok((conn, true));
    }
    Ok((dialer.dial(&cfg.server_address).await?, false))
}

/// Full client dial: transport, handshake, and the TCP relay target.
pub async fn dial(cfg: &ProtocolConfig, dialer: &Arc<dyn Dialer>) -> Result<Stream> {
    cfg.validate_client()?;
    let (raw, via_tunnel) = open_transport(cfg, dialer).await?;

    // Inside an HTTP tunnel the camouflage header must not appear again.
    let handshake_cfg = if via_tunnel {
        cfg.derived_without_mask()
    } else {
        cfg.clone()
    };
    let mut stream =
        match tokio::time::timeout(cfg.handshake_timeout(), client_handshake(raw, &handshake_cfg))
            .await
        {
            Ok(result) => result?,
            Err(_) => return Err(Error::Timeout),
        };

    let target = Address::parse(&cfg.target_address)?;
    stream.write_all(&target.encode()?).await?;
    stream.flush().await?;
    Ok(stream)
}

/// Full client dial for a datagram session.
pub async fn dial_uot(cfg: &ProtocolConfig, dialer: &Arc<dyn Dialer>) -> Result<UotSocket> {
    cfg.validate()?;
    if cfg.server_address.is_empty() {
        return Err(Error::Config("server address cannot be empty".into()));
    }
    let (raw, via_tunnel) = open_transport(cfg, dialer).await?;
    let handshake_cfg = if via_tunnel {
        cfg.derived_without_mask()
    } else {
        cfg.clone()
    };
    let mut stream =
        match tokio::time::timeout(cfg.handshake_timeout(), client_handshake(raw, &handshake_cfg))
            .await
        {
            Ok(result) => result?,
            Err(_) => return Err(Error::Timeout),
        };
    uot::write_preface(&mut stream).await?;
    Ok(UotSocket::new(stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(key: &str) -> ProtocolConfig {
        let mut cfg = ProtocolConfig {
            key: key.into(),
            server_address: "server.test:443".into(),
            ..ProtocolConfig::default()
        };
        cfg.build_tables(false).unwrap();
        cfg
    }

    #[test]
    fn test_timestamp_tolerance_boundary() {
        let now = 1_700_000_000i64;
        assert!(validate_timestamp(now - 60, now));
        assert!(validate_timestamp(now + 60, now));
        assert!(!validate_timestamp(now - 61, now));
        assert!(!validate_timestamp(now + 61, now));
    }

    #[test]
    fn test_downlink_mode_byte() {
        let mut cfg = test_config("mode key");
        assert_eq!(downlink_mode(&cfg), DOWNLINK_MODE_PURE);
        cfg.enable_pure_downlink = false;
        assert_eq!(downlink_mode(&cfg), DOWNLINK_MODE_PACKED);
    }

    async fn run_pair(
        client_cfg: ProtocolConfig,
        server_cfg: ProtocolConfig,
    ) -> (Result<Stream>, Result<ServerSession>) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let client = async {
            let mut stream = client_handshake(Box::new(a) as Stream, &client_cfg).await?;
            let target = Address::parse("93.184.216.34:80")?;
            stream.write_all(&target.encode()?).await?;
            stream.flush().await?;
            Ok(stream)
        };
        let server = server_handshake(Box::new(b) as Stream, &server_cfg);
        tokio::join!(client, server)
    }

    #[tokio::test]
    async fn test_handshake_roundtrip_with_mask() {
        let cfg = test_config("handshake key");
        let (client, server) = run_pair(cfg.clone(), cfg).await;
        client.unwrap();
        let session = server.unwrap();
        match session.kind {
            SessionKind::Tcp { target } => assert_eq!(target.to_string(), "93.184.216.34:80"),
            SessionKind::Uot => panic!("expected tcp session"),
        }
    }

    #[tokio::test]
    async fn test_handshake_without_mask() {
        let mut cfg = test_config("bare handshake key");
        cfg.disable_http_mask = true;
        let (client, server) = run_pair(cfg.clone(), cfg).await;
        client.unwrap();
        server.unwrap();
    }

    #[tokio::test]
    async fn test_downlink_mode_mismatch_is_fatal() {
        let client_cfg = test_config("mismatch key");
        let mut server_cfg = client_cfg.clone();
        server_cfg.enable_pure_downlink = false;

        let (_client, server) = run_pair(client_cfg, server_cfg).await;
        // The server must reject: either the probe never accepts the wrong
        // mode byte or the explicit check fires.
        assert!(server.is_err());
    }

    #[tokio::test]
    async fn test_wrong_key_never_completes() {
        let client_cfg = test_config("right key");
        let server_cfg = test_config("wrong key");
        let (_client, server) = run_pair(client_cfg, server_cfg).await;
        assert!(server.is_err());
    }

    #[tokio::test]
    async fn test_uot_classification() {
        let mut cfg = test_config("uot key");
        cfg.disable_http_mask = true;

        let (a, b) = tokio::io::duplex(256 * 1024);
        let client_cfg = cfg.clone();
        let client = async {
            let mut stream = client_handshake(Box::new(a) as Stream, &client_cfg).await?;
            uot::write_preface(&mut stream).await?;
            Ok::<_, Error>(stream)
        };
        let server = server_handshake(Box::new(b) as Stream, &cfg);
        let (client, server) = tokio::join!(client, server);
        client.unwrap();
        assert!(matches!(server.unwrap().kind, SessionKind::Uot));
    }
}
