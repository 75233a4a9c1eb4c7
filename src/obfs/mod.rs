//! Obfuscated stream codec
//!
//! Pure encoder/decoder state machines (hint and packed modes) plus the
//! `ObfsStream` adapter that runs them over a duplex `Stream`. Uplink
//! traffic always travels in hint mode; the downlink direction is chosen by
//! the pure-downlink flag, so the read and write halves of one stream may
//! speak different encodings.

mod hint;
mod packed;

pub use hint::{HintDecoder, HintEncoder};
pub use packed::{PackedDecoder, PackedEncoder};

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::common::Stream;
use crate::table::Table;

const IO_BUFFER_SIZE: usize = 32 * 1024;
const MAX_ENCODE_CHUNK: usize = 8 * 1024;

/// Decoder for the receiving direction of one stream.
pub enum ReadCodec {
    Hint(HintDecoder),
    Packed(PackedDecoder),
}

impl ReadCodec {
    fn feed(&mut self, data: &[u8], out: &mut Vec<u8>) -> crate::error::Result<()> {
        match self {
            ReadCodec::Hint(d) => d.feed(data, out),
            ReadCodec::Packed(d) => d.feed(data, out),
        }
    }

    fn on_eof(&mut self) {
        if let ReadCodec::Packed(d) = self {
            d.reset();
        }
    }
}

/// Encoder for the sending direction of one stream.
pub enum WriteCodec {
    Hint(HintEncoder),
    Packed(PackedEncoder),
}

impl WriteCodec {
    fn encode(&mut self, data: &[u8], out: &mut Vec<u8>) {
        match self {
            WriteCodec::Hint(e) => e.encode(data, out),
            WriteCodec::Packed(e) => e.encode(data, out),
        }
    }
}

/// A duplex stream speaking obfuscated bytes on the wire.
pub struct ObfsStream {
    inner: Stream,
    read_codec: ReadCodec,
    write_codec: WriteCodec,

    raw_buf: Vec<u8>,
    pending: Vec<u8>,
    pending_pos: usize,

    out_buf: Vec<u8>,
    out_pos: usize,
}

impl ObfsStream {
    /// Client-side stream: hint-encoded uplink; downlink decoder follows
    /// the negotiated pure/packed choice.
    pub fn client(
        inner: Stream,
        table: &Arc<Table>,
        padding_min: u8,
        padding_max: u8,
        pure_downlink: bool,
    ) -> Self {
        let write_codec = WriteCodec::Hint(HintEncoder::new(
            Arc::clone(table),
            StdRng::from_entropy(),
            padding_min,
            padding_max,
        ));
        let read_codec = if pure_downlink {
            ReadCodec::Hint(HintDecoder::new(Arc::clone(table)))
        } else {
            ReadCodec::Packed(PackedDecoder::new(Arc::clone(table)))
        };
        Self::new(inner, read_codec, write_codec)
    }

    /// Server-side stream: hint-decoded uplink; downlink encoder follows
    /// the negotiated pure/packed choice.
    pub fn server(
        inner: Stream,
        table: &Arc<Table>,
        padding_min: u8,
        padding_max: u8,
        pure_downlink: bool,
    ) -> Self {
        let read_codec = ReadCodec::Hint(HintDecoder::new(Arc::clone(table)));
        let write_codec = if pure_downlink {
            WriteCodec::Hint(HintEncoder::new(
                Arc::clone(table),
                StdRng::from_entropy(),
                padding_min,
                padding_max,
            ))
        } else {
            WriteCodec::Packed(PackedEncoder::new(
                Arc::clone(table),
                StdRng::from_entropy(),
                padding_min,
                padding_max,
            ))
        };
        Self::new(inner, read_codec, write_codec)
    }

    pub fn new(inner: Stream, read_codec: ReadCodec, write_codec: WriteCodec) -> Self {
        Self {
            inner,
            read_codec,
            write_codec,
            raw_buf: vec![0u8; IO_BUFFER_SIZE],
            pending: Vec::new(),
            pending_pos: 0,
            out_buf: Vec::new(),
            out_pos: 0,
        }
    }

    fn copy_pending(&mut self, buf: &mut ReadBuf<'_>) -> usize {
        let available = &self.pending[self.pending_pos..];
        let n = available.len().min(buf.remaining());
        buf.put_slice(&available[..n]);
        self.pending_pos += n;
        if self.pending_pos == self.pending.len() {
            self.pending.clear();
            self.pending_pos = 0;
        }
        n
    }

    /// Push buffered wire bytes down to the inner stream.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        while self.out_pos < self.out_buf.len() {
            match Pin::new(&mut self.inner).poll_write(cx, &self.out_buf[self.out_pos..]) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "inner stream refused obfuscated bytes",
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

impl AsyncRead for ObfsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.pending_pos < this.pending.len() {
                this.copy_pending(buf);
                return Poll::Ready(Ok(()));
            }

            let mut raw = ReadBuf::new(&mut this.raw_buf);
            match Pin::new(&mut this.inner).poll_read(cx, &mut raw) {
                Poll::Ready(Ok(())) => {
                    let filled = raw.filled();
                    if filled.is_empty() {
                        this.read_codec.on_eof();
                        return Poll::Ready(Ok(()));
                    }
                    let chunk = filled.to_vec();
                    if let Err(e) = this.read_codec.feed(&chunk, &mut this.pending) {
                        return Poll::Ready(Err(e.into_io()));
                    }
                    // Loop: either pending now has data or we read again.
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for ObfsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let this = self.get_mut();

        // Previous writes must fully reach the wire before new plaintext is
        // accepted, otherwise Pending here would lose encoded bytes.
        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }

        let take = buf.len().min(MAX_ENCODE_CHUNK);
        this.write_codec.encode(&buf[..take], &mut this.out_buf);

        // Opportunistic drain; leftover bytes flush on the next operation.
        match this.poll_drain(cx) {
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) | Poll::Pending => {}
        }
        Poll::Ready(Ok(take))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_flush(cx),
            other => other,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_shutdown(cx),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn pump(pure_downlink: bool) {
        let table = table::cached("obfs stream secret", "entropy", None).unwrap();
        let (a, b) = tokio::io::duplex(IO_BUFFER_SIZE);

        let mut client = ObfsStream::client(Box::new(a), &table, 10, 30, pure_downlink);
        let mut server = ObfsStream::server(Box::new(b), &table, 10, 30, pure_downlink);

        let uplink: Vec<u8> = (0..4096).map(|i| (i % 251) as u8).collect();
        let downlink: Vec<u8> = (0..4096).map(|i| (i % 83) as u8).collect();

        let up = uplink.clone();
        let down = downlink.clone();
        let client_task = tokio::spawn(async move {
            client.write_all(&up).await.unwrap();
            client.flush().await.unwrap();
            let mut got = vec![0u8; down.len()];
            client.read_exact(&mut got).await.unwrap();
            assert_eq!(got, down);
        });

        let mut got = vec![0u8; uplink.len()];
        server.read_exact(&mut got).await.unwrap();
        assert_eq!(got, uplink);
        server.write_all(&downlink).await.unwrap();
        server.flush().await.unwrap();

        client_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_duplex_pure_downlink() {
        pump(true).await;
    }

    #[tokio::test]
    async fn test_duplex_packed_downlink() {
        pump(false).await;
    }
}
