//! AEAD frame layer
//!
//! Wire format per frame: 2-byte big-endian total length, then nonce,
//! then ciphertext+tag. Plaintext chunks are capped so a frame body always
//! fits the 16-bit length. The same parsing logic is exposed as a pure
//! function over a byte slice for the server-side table probe.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::common::Stream;
use crate::error::{Error, Result};

use super::aead::AeadCipher;
use super::{random_nonce, NONCE_SIZE, TAG_SIZE};

/// Largest plaintext chunk a single frame can carry.
pub const MAX_FRAME_PAYLOAD: usize = 65535 - NONCE_SIZE - TAG_SIZE;

/// Outcome of parsing one frame from a buffered prefix.
pub enum FrameParse {
    /// A full frame was opened; `consumed` covers header + body.
    Complete { plaintext: Vec<u8>, consumed: usize },
    /// The buffer ends mid-frame.
    NeedMore,
}

/// Parse and open a single frame from the front of `buf`.
pub fn open_frame(cipher: &AeadCipher, buf: &[u8]) -> Result<FrameParse> {
    if buf.len() < 2 {
        return Ok(FrameParse::NeedMore);
    }
    let frame_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if frame_len < NONCE_SIZE + TAG_SIZE {
        return Err(Error::Protocol(format!("frame too short: {frame_len}")));
    }
    if buf.len() < 2 + frame_len {
        return Ok(FrameParse::NeedMore);
    }
    let nonce = &buf[2..2 + NONCE_SIZE];
    let ciphertext = &buf[2 + NONCE_SIZE..2 + frame_len];
    let plaintext = cipher.open(nonce, ciphertext)?;
    Ok(FrameParse::Complete {
        plaintext,
        consumed: 2 + frame_len,
    })
}

/// Seal one plaintext chunk into a complete wire frame.
pub fn seal_frame(cipher: &AeadCipher, plaintext: &[u8], out: &mut Vec<u8>) -> Result<()> {
    debug_assert!(plaintext.len() <= MAX_FRAME_PAYLOAD);
    let nonce = random_nonce();
    let sealed = cipher.seal(&nonce, plaintext)?;
    let frame_len = (NONCE_SIZE + sealed.len()) as u16;
    out.extend_from_slice(&frame_len.to_be_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(())
}

enum ReadState {
    Length { buf: [u8; 2], pos: usize },
    Body { buf: Vec<u8>, pos: usize },
}

/// AEAD-framed stream over an obfuscated byte stream.
pub struct FramedStream {
    inner: Stream,
    cipher: AeadCipher,

    read_state: ReadState,
    pending: Vec<u8>,
    pending_pos: usize,

    out_buf: Vec<u8>,
    out_pos: usize,
}

impl FramedStream {
    pub fn new(inner: Stream, cipher: AeadCipher) -> Self {
        Self {
            inner,
            cipher,
            read_state: ReadState::Length {
                buf: [0; 2],
                pos: 0,
            },
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

    /// Incrementally fill `dst[*pos..]`. Ready(true) when full, Ready(false)
    /// on EOF before any byte of the current unit was consumed.
    fn poll_fill(
        inner: &mut Stream,
        cx: &mut Context<'_>,
        dst: &mut [u8],
        pos: &mut usize,
    ) -> Poll<std::io::Result<bool>> {
        while *pos < dst.len() {
            let mut rb = ReadBuf::new(&mut dst[*pos..]);
            match Pin::new(&mut *inner).poll_read(cx, &mut rb) {
                Poll::Ready(Ok(())) => {
                    let n = rb.filled().len();
                    if n == 0 {
                        if *pos == 0 {
                            return Poll::Ready(Ok(false));
                        }
                        return Poll::Ready(Err(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "connection closed mid-frame",
                        )));
                    }
                    *pos += n;
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(true))
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        while self.out_pos < self.out_buf.len() {
            match Pin::new(&mut self.inner).poll_write(cx, &self.out_buf[self.out_pos..]) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "inner stream refused frame bytes",
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

impl AsyncRead for FramedStream {
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

            match &mut this.read_state {
                ReadState::Length { buf: header, pos } => {
                    match Self::poll_fill(&mut this.inner, cx, header, pos) {
                        Poll::Ready(Ok(true)) => {
                            let frame_len = u16::from_be_bytes(*header) as usize;
                            if frame_len < NONCE_SIZE + TAG_SIZE {
                                return Poll::Ready(Err(std::io::Error::new(
                                    std::io::ErrorKind::InvalidData,
                                    format!("frame too short: {frame_len}"),
                                )));
                            }
                            this.read_state = ReadState::Body {
                                buf: vec![0u8; frame_len],
                                pos: 0,
                            };
                        }
                        // Clean EOF between frames.
                        Poll::Ready(Ok(false)) => return Poll::Ready(Ok(())),
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
                ReadState::Body { buf: body, pos } => {
                    match Self::poll_fill(&mut this.inner, cx, body, pos) {
                        Poll::Ready(Ok(true)) => {
                            let nonce = body[..NONCE_SIZE].to_vec();
                            let ciphertext = body[NONCE_SIZE..].to_vec();
                            this.read_state = ReadState::Length {
                                buf: [0; 2],
                                pos: 0,
                            };
                            match this.cipher.open(&nonce, &ciphertext) {
                                Ok(plaintext) => {
                                    this.pending = plaintext;
                                    this.pending_pos = 0;
                                }
                                Err(e) => return Poll::Ready(Err(e.into_io())),
                            }
                        }
                        Poll::Ready(Ok(false)) => {
                            return Poll::Ready(Err(std::io::Error::new(
                                std::io::ErrorKind::UnexpectedEof,
                                "connection closed mid-frame",
                            )))
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
            }
        }
    }
}

impl AsyncWrite for FramedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let this = self.get_mut();

        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }

        let take = buf.len().min(MAX_FRAME_PAYLOAD);
        if let Err(e) = seal_frame(&this.cipher, &buf[..take], &mut this.out_buf) {
            return Poll::Ready(Err(e.into_io()));
        }

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
    use crate::crypto::aead::AeadMethod;
    use crate::crypto::{derive_aead_key, random_bytes};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn cipher() -> AeadCipher {
        let key = derive_aead_key("frame secret", AeadMethod::ChaCha20Poly1305).unwrap();
        AeadCipher::new(AeadMethod::ChaCha20Poly1305, &key).unwrap()
    }

    #[test]
    fn test_open_frame_needs_full_body() {
        let c = cipher();
        let mut wire = Vec::new();
        seal_frame(&c, b"partial delivery", &mut wire).unwrap();

        for cut in 0..wire.len() {
            match open_frame(&c, &wire[..cut]).unwrap() {
                FrameParse::NeedMore => {}
                FrameParse::Complete { .. } => panic!("incomplete prefix must not open"),
            }
        }
        match open_frame(&c, &wire).unwrap() {
            FrameParse::Complete {
                plaintext,
                consumed,
            } => {
                assert_eq!(plaintext, b"partial delivery");
                assert_eq!(consumed, wire.len());
            }
            FrameParse::NeedMore => panic!("full frame must open"),
        }
    }

    #[test]
    fn test_tampered_frame_fails_to_open() {
        let c = cipher();
        let mut wire = Vec::new();
        seal_frame(&c, b"integrity", &mut wire).unwrap();
        // Flip one ciphertext bit (past header + nonce).
        wire[2 + NONCE_SIZE] ^= 0x01;
        assert!(open_frame(&c, &wire).is_err());
    }

    #[tokio::test]
    async fn test_framed_stream_roundtrip_large() {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let mut writer = FramedStream::new(Box::new(a), cipher());
        let mut reader = FramedStream::new(Box::new(b), cipher());

        // Spans multiple frames (> MAX_FRAME_PAYLOAD).
        let payload = random_bytes(200_000);
        let expected = payload.clone();
        let task = tokio::spawn(async move {
            writer.write_all(&payload).await.unwrap();
            writer.flush().await.unwrap();
        });

        let mut got = vec![0u8; expected.len()];
        reader.read_exact(&mut got).await.unwrap();
        task.await.unwrap();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn test_clean_eof_between_frames() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut writer = FramedStream::new(Box::new(a), cipher());
        let mut reader = FramedStream::new(Box::new(b), cipher());

        writer.write_all(b"last frame").await.unwrap();
        writer.flush().await.unwrap();
        drop(writer);

        let mut got = Vec::new();
        reader.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"last frame");
    }
}
