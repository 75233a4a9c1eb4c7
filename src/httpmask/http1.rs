//! Minimal HTTP/1.1 plumbing
//!
//! The tunnel shares its listener port with the raw protocol, so requests
//! are parsed straight off the accepted stream instead of going through a
//! full HTTP server. Covers exactly what the tunnel needs: header blocks,
//! content-length and chunked bodies, and response heads.

use tokio::io::{AsyncReadExt, AsyncWrite};

use crate::common::Stream;
use crate::error::{Error, Result};

use super::masker::MAX_HEADER_BYTES;

/// A parsed request head. Header keys are lower-cased; first value wins.
#[derive(Debug, Clone)]
pub struct RequestHeader {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
}

/// A parsed response head.
#[derive(Debug, Clone)]
pub struct ResponseHeader {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

/// Outcome of parsing a buffered prefix.
pub enum HeaderParse<T> {
    Complete { header: T, consumed: usize },
    NeedMore,
}

impl RequestHeader {
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Path component of the request target.
    pub fn path(&self) -> &str {
        match self.target.split_once('?') {
            Some((path, _)) => path,
            None => &self.target,
        }
    }

    /// First value of a query parameter, percent-decoding not required for
    /// the token alphabet in use.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        let (_, query) = self.target.split_once('?')?;
        for pair in query.split('&') {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            if k == key {
                return Some(v);
            }
        }
        None
    }
}

impl ResponseHeader {
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

fn split_lines(buf: &[u8]) -> Option<(Vec<&[u8]>, usize)> {
    let mut lines = Vec::new();
    let mut pos = 0;
    loop {
        let nl = buf[pos..].iter().position(|&b| b == b'\n')?;
        let raw = &buf[pos..pos + nl];
        let line = raw.strip_suffix(b"\r").unwrap_or(raw);
        pos += nl + 1;
        if line.is_empty() {
            return Some((lines, pos));
        }
        lines.push(line);
        if pos > MAX_HEADER_BYTES {
            return None;
        }
    }
}

fn parse_header_lines(lines: &[&[u8]]) -> Vec<(String, String)> {
    let mut headers = Vec::with_capacity(lines.len());
    for line in lines {
        let Ok(text) = std::str::from_utf8(line) else {
            continue;
        };
        let Some((k, v)) = text.split_once(':') else {
            continue;
        };
        let key = k.trim().to_lowercase();
        let value = v.trim().to_string();
        if key.is_empty() || headers.iter().any(|(existing, _)| *existing == key) {
            continue;
        }
        headers.push((key, value));
    }
    headers
}

/// Parse one request head from a buffered prefix.
pub fn parse_request_header(buf: &[u8]) -> Result<HeaderParse<RequestHeader>> {
    if buf.len() > MAX_HEADER_BYTES && !buf[..MAX_HEADER_BYTES].contains(&b'\n') {
        return Err(Error::Protocol("http header too large".into()));
    }
    let Some((lines, consumed)) = split_lines(buf) else {
        if buf.len() > MAX_HEADER_BYTES {
            return Err(Error::Protocol("http header too large".into()));
        }
        return Ok(HeaderParse::NeedMore);
    };
    let Some(request_line) = lines.first() else {
        return Err(Error::Protocol("empty request header".into()));
    };
    let request_line = std::str::from_utf8(request_line)
        .map_err(|_| Error::Protocol("request line is not valid UTF-8".into()))?;
    let mut parts = request_line.splitn(3, ' ');
    let (Some(method), Some(target), Some(_proto)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::Protocol("invalid request line".into()));
    };
    Ok(HeaderParse::Complete {
        header: RequestHeader {
            method: method.to_uppercase(),
            target: target.to_string(),
            headers: parse_header_lines(&lines[1..]),
        },
        consumed,
    })
}

/// Parse one response head from a buffered prefix.
pub fn parse_response_header(buf: &[u8]) -> Result<HeaderParse<ResponseHeader>> {
    let Some((lines, consumed)) = split_lines(buf) else {
        if buf.len() > MAX_HEADER_BYTES {
            return Err(Error::Protocol("http response header too large".into()));
        }
        return Ok(HeaderParse::NeedMore);
    };
    let Some(status_line) = lines.first() else {
        return Err(Error::Protocol("empty response header".into()));
    };
    let status_line = std::str::from_utf8(status_line)
        .map_err(|_| Error::Protocol("status line is not valid UTF-8".into()))?;
    let mut parts = status_line.splitn(3, ' ');
    let (Some(proto), Some(code)) = (parts.next(), parts.next()) else {
        return Err(Error::Protocol("invalid status line".into()));
    };
    if !proto.starts_with("HTTP/1.") {
        return Err(Error::Protocol(format!("unexpected protocol: {proto}")));
    }
    let status: u16 = code
        .parse()
        .map_err(|_| Error::Protocol(format!("bad status code: {code}")))?;
    Ok(HeaderParse::Complete {
        header: ResponseHeader {
            status,
            headers: parse_header_lines(&lines[1..]),
        },
        consumed,
    })
}

/// Read a full response head from a stream; returns any body bytes that
/// arrived in the same reads.
pub async fn read_response_head(stream: &mut Stream) -> Result<(ResponseHeader, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    loop {
        match parse_response_header(&buf)? {
            HeaderParse::Complete { header, consumed } => {
                let leftover = buf.split_off(consumed);
                return Ok((header, leftover));
            }
            HeaderParse::NeedMore => {}
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// How a message body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Chunked,
    Length(u64),
    /// No framing; body runs until the peer closes.
    Unbounded,
}

/// Determine the body framing from parsed headers.
pub fn body_kind(headers: &[(String, String)]) -> Result<BodyKind> {
    if let Some((_, te)) = headers.iter().find(|(k, _)| k == "transfer-encoding") {
        if te.to_lowercase().contains("chunked") {
            return Ok(BodyKind::Chunked);
        }
    }
    if let Some((_, cl)) = headers.iter().find(|(k, _)| k == "content-length") {
        let n: u64 = cl
            .trim()
            .parse()
            .map_err(|_| Error::Protocol("invalid content-length".into()))?;
        return Ok(BodyKind::Length(n));
    }
    Ok(BodyKind::Unbounded)
}

/// Read an entire bounded body (up to `cap` bytes) given bytes already
/// buffered past the header.
pub async fn read_full_body(
    stream: &mut Stream,
    leftover: Vec<u8>,
    kind: BodyKind,
    cap: usize,
) -> Result<Vec<u8>> {
    match kind {
        BodyKind::Length(n) => {
            let n = n as usize;
            if n > cap {
                return Err(Error::Tunnel(format!("body too large: {n}")));
            }
            let mut body = leftover;
            if body.len() > n {
                body.truncate(n);
            }
            while body.len() < n {
                let mut chunk = vec![0u8; (n - body.len()).min(16 * 1024)];
                let got = stream.read(&mut chunk).await?;
                if got == 0 {
                    return Err(Error::ConnectionClosed);
                }
                body.extend_from_slice(&chunk[..got]);
            }
            Ok(body)
        }
        BodyKind::Chunked => {
            let mut decoder = ChunkedDecoder::new();
            let mut body = Vec::new();
            let consumed = decoder.feed(&leftover, &mut body)?;
            let mut pending = leftover[consumed..].to_vec();
            let mut chunk = [0u8; 16 * 1024];
            while !decoder.is_done() {
                if body.len() > cap {
                    return Err(Error::Tunnel("body too large".into()));
                }
                if pending.is_empty() {
                    let got = stream.read(&mut chunk).await?;
                    if got == 0 {
                        return Err(Error::ConnectionClosed);
                    }
                    pending.extend_from_slice(&chunk[..got]);
                }
                let used = decoder.feed(&pending, &mut body)?;
                pending.drain(..used);
            }
            if body.len() > cap {
                return Err(Error::Tunnel("body too large".into()));
            }
            Ok(body)
        }
        BodyKind::Unbounded => {
            let mut body = leftover;
            let mut chunk = [0u8; 16 * 1024];
            loop {
                if body.len() > cap {
                    return Err(Error::Tunnel("body too large".into()));
                }
                let got = stream.read(&mut chunk).await?;
                if got == 0 {
                    return Ok(body);
                }
                body.extend_from_slice(&chunk[..got]);
            }
        }
    }
}

/// Append one chunked-transfer frame.
pub fn encode_chunk(data: &[u8], out: &mut Vec<u8>) {
    if data.is_empty() {
        return;
    }
    out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

/// Append the terminating zero chunk.
pub fn encode_final_chunk(out: &mut Vec<u8>) {
    out.extend_from_slice(b"0\r\n\r\n");
}

enum ChunkState {
    SizeLine,
    Data { remaining: usize },
    DataCrlf { skip: usize },
    Trailer,
    Done,
}

/// Incremental chunked-transfer decoder.
pub struct ChunkedDecoder {
    state: ChunkState,
    line: Vec<u8>,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: ChunkState::SizeLine,
            line: Vec::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, ChunkState::Done)
    }

    /// Consume as much of `input` as possible, appending decoded bytes to
    /// `out`. Returns the number of input bytes consumed.
    pub fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<usize> {
        let mut pos = 0;
        while pos < input.len() {
            match &mut self.state {
                ChunkState::SizeLine | ChunkState::Trailer => {
                    let is_trailer = matches!(self.state, ChunkState::Trailer);
                    let Some(nl) = input[pos..].iter().position(|&b| b == b'\n') else {
                        self.line.extend_from_slice(&input[pos..]);
                        if self.line.len() > 1024 {
                            return Err(Error::Protocol("chunk size line too long".into()));
                        }
                        return Ok(input.len());
                    };
                    self.line.extend_from_slice(&input[pos..pos + nl]);
                    pos += nl + 1;
                    let line = std::mem::take(&mut self.line);
                    let line = line.strip_suffix(b"\r").unwrap_or(&line).to_vec();
                    if is_trailer {
                        if line.is_empty() {
                            self.state = ChunkState::Done;
                            return Ok(pos);
                        }
                        // Trailer field: skip.
                        continue;
                    }
                    let text = std::str::from_utf8(&line)
                        .map_err(|_| Error::Protocol("bad chunk size".into()))?;
                    let size_part = text.split(';').next().unwrap_or("").trim();
                    let size = usize::from_str_radix(size_part, 16)
                        .map_err(|_| Error::Protocol(format!("bad chunk size: {text:?}")))?;
                    if size == 0 {
                        self.state = ChunkState::Trailer;
                    } else {
                        self.state = ChunkState::Data { remaining: size };
                    }
                }
                ChunkState::Data { remaining } => {
                    let take = (*remaining).min(input.len() - pos);
                    out.extend_from_slice(&input[pos..pos + take]);
                    pos += take;
                    *remaining -= take;
                    if *remaining == 0 {
                        self.state = ChunkState::DataCrlf { skip: 2 };
                    }
                }
                ChunkState::DataCrlf { skip } => {
                    // Tolerate a bare \n terminator.
                    let b = input[pos];
                    pos += 1;
                    if b == b'\n' {
                        self.state = ChunkState::SizeLine;
                    } else if b == b'\r' && *skip == 2 {
                        *skip = 1;
                    } else {
                        return Err(Error::Protocol("malformed chunk terminator".into()));
                    }
                }
                ChunkState::Done => return Ok(pos),
            }
        }
        Ok(pos)
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-side framing for a [`BodyStream`].
enum BodyReader {
    Chunked(ChunkedDecoder),
    Limited { remaining: u64 },
    Unbounded,
}

/// Full-duplex stream over one HTTP message exchange: reads are the peer's
/// body (chunked, length-bounded or until-close), writes are emitted as
/// chunked-transfer frames. Carries the stream-one tunnel on both ends.
pub struct BodyStream {
    inner: Stream,
    leftover: Vec<u8>,
    leftover_pos: usize,

    reader: BodyReader,
    decoded: Vec<u8>,
    decoded_pos: usize,

    out_buf: Vec<u8>,
    out_pos: usize,
    finished: bool,
}

impl BodyStream {
    pub fn new(inner: Stream, leftover: Vec<u8>, read_kind: BodyKind) -> Self {
        let reader = match read_kind {
            BodyKind::Chunked => BodyReader::Chunked(ChunkedDecoder::new()),
            BodyKind::Length(n) => BodyReader::Limited { remaining: n },
            BodyKind::Unbounded => BodyReader::Unbounded,
        };
        Self {
            inner,
            leftover,
            leftover_pos: 0,
            reader,
            decoded: Vec::new(),
            decoded_pos: 0,
            out_buf: Vec::new(),
            out_pos: 0,
            finished: false,
        }
    }

    fn serve_decoded(&mut self, buf: &mut tokio::io::ReadBuf<'_>) -> usize {
        let available = &self.decoded[self.decoded_pos..];
        let n = available.len().min(buf.remaining());
        buf.put_slice(&available[..n]);
        self.decoded_pos += n;
        if self.decoded_pos == self.decoded.len() {
            self.decoded.clear();
            self.decoded_pos = 0;
        }
        n
    }

    /// Run raw input bytes through the body framing.
    fn ingest(&mut self, data: &[u8]) -> Result<()> {
        match &mut self.reader {
            BodyReader::Chunked(decoder) => {
                let used = decoder.feed(data, &mut self.decoded)?;
                // Bytes past the body terminator do not belong to us.
                let _ = used;
                Ok(())
            }
            BodyReader::Limited { remaining } => {
                let take = (*remaining).min(data.len() as u64) as usize;
                self.decoded.extend_from_slice(&data[..take]);
                *remaining -= take as u64;
                Ok(())
            }
            BodyReader::Unbounded => {
                self.decoded.extend_from_slice(data);
                Ok(())
            }
        }
    }

    fn read_side_done(&self) -> bool {
        match &self.reader {
            BodyReader::Chunked(decoder) => decoder.is_done(),
            BodyReader::Limited { remaining } => *remaining == 0,
            BodyReader::Unbounded => false,
        }
    }

    fn poll_drain(&mut self, cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
        use std::pin::Pin;
        use std::task::Poll;
        while self.out_pos < self.out_buf.len() {
            match Pin::new(&mut self.inner).poll_write(cx, &self.out_buf[self.out_pos..]) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "inner stream refused chunk bytes",
                    )))
                }
                Poll::Ready(Ok(n)) => self.out_pos += n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        self.out_buf.clear();
        self.out_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl tokio::io::AsyncRead for BodyStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        use std::pin::Pin;
        use std::task::Poll;
        let this = self.get_mut();
        loop {
            if this.decoded_pos < this.decoded.len() {
                this.serve_decoded(buf);
                return Poll::Ready(Ok(()));
            }
            if this.read_side_done() {
                return Poll::Ready(Ok(()));
            }
            if this.leftover_pos < this.leftover.len() {
                let chunk = this.leftover[this.leftover_pos..].to_vec();
                this.leftover_pos = this.leftover.len();
                if let Err(e) = this.ingest(&chunk) {
                    return Poll::Ready(Err(e.into_io()));
                }
                continue;
            }

            let mut raw = [0u8; 16 * 1024];
            let mut rb = tokio::io::ReadBuf::new(&mut raw);
            match Pin::new(&mut this.inner).poll_read(cx, &mut rb) {
                Poll::Ready(Ok(())) => {
                    let filled = rb.filled();
                    if filled.is_empty() {
                        return Poll::Ready(Ok(()));
                    }
                    let chunk = filled.to_vec();
                    if let Err(e) = this.ingest(&chunk) {
                        return Poll::Ready(Err(e.into_io()));
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl tokio::io::AsyncWrite for BodyStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        use std::task::Poll;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "body stream already finished",
            )));
        }
        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }
        let take = buf.len().min(32 * 1024);
        encode_chunk(&buf[..take], &mut this.out_buf);
        match this.poll_drain(cx) {
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) | Poll::Pending => {}
        }
        Poll::Ready(Ok(take))
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        use std::pin::Pin;
        use std::task::Poll;
        let this = self.get_mut();
        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_flush(cx),
            other => other,
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        use std::pin::Pin;
        use std::task::Poll;
        let this = self.get_mut();
        if !this.finished {
            this.finished = true;
            encode_final_chunk(&mut this.out_buf);
        }
        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_shutdown(cx),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_header_parse() {
        let raw = b"POST /api/v1/upload?token=abc&close=1 HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello";
        match parse_request_header(raw).unwrap() {
            HeaderParse::Complete { header, consumed } => {
                assert_eq!(header.method, "POST");
                assert_eq!(header.path(), "/api/v1/upload");
                assert_eq!(header.query_param("token"), Some("abc"));
                assert_eq!(header.query_param("close"), Some("1"));
                assert_eq!(header.header("content-length"), Some("5"));
                assert_eq!(&raw[consumed..], b"hello");
            }
            HeaderParse::NeedMore => panic!("must parse"),
        }
    }

    #[test]
    fn test_response_header_parse() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nrest";
        match parse_response_header(raw).unwrap() {
            HeaderParse::Complete { header, consumed } => {
                assert_eq!(header.status, 200);
                assert_eq!(body_kind(&header.headers).unwrap(), BodyKind::Chunked);
                assert_eq!(&raw[consumed..], b"rest");
            }
            HeaderParse::NeedMore => panic!("must parse"),
        }
    }

    #[test]
    fn test_chunked_roundtrip() {
        let mut wire = Vec::new();
        encode_chunk(b"hello ", &mut wire);
        encode_chunk(b"chunked ", &mut wire);
        encode_chunk(b"world", &mut wire);
        encode_final_chunk(&mut wire);

        let mut decoder = ChunkedDecoder::new();
        let mut out = Vec::new();
        let used = decoder.feed(&wire, &mut out).unwrap();
        assert_eq!(used, wire.len());
        assert!(decoder.is_done());
        assert_eq!(out, b"hello chunked world");
    }

    #[test]
    fn test_chunked_decoder_byte_at_a_time() {
        let mut wire = Vec::new();
        encode_chunk(&[0u8, 1, 2, 255, 254], &mut wire);
        encode_chunk(b"x", &mut wire);
        encode_final_chunk(&mut wire);

        let mut decoder = ChunkedDecoder::new();
        let mut out = Vec::new();
        for &b in &wire {
            decoder.feed(&[b], &mut out).unwrap();
        }
        assert!(decoder.is_done());
        assert_eq!(out, &[0u8, 1, 2, 255, 254, b'x']);
    }

    #[test]
    fn test_chunk_size_garbage_rejected() {
        let mut decoder = ChunkedDecoder::new();
        let mut out = Vec::new();
        assert!(decoder.feed(b"zz\r\n", &mut out).is_err());
    }

    #[tokio::test]
    async fn test_body_stream_duplex_pair() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // Both ends write chunked frames and read the peer's chunked body,
        // exactly like the stream-one tunnel.
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut left = BodyStream::new(Box::new(a), Vec::new(), BodyKind::Chunked);
        let mut right = BodyStream::new(Box::new(b), Vec::new(), BodyKind::Chunked);

        let task = tokio::spawn(async move {
            left.write_all(b"uplink payload").await.unwrap();
            left.flush().await.unwrap();
            let mut got = vec![0u8; 16];
            left.read_exact(&mut got).await.unwrap();
            assert_eq!(&got, b"downlink payload");
        });

        let mut got = vec![0u8; 14];
        right.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"uplink payload");
        right.write_all(b"downlink payload").await.unwrap();
        right.flush().await.unwrap();
        task.await.unwrap();
    }
}
