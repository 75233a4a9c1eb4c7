//! UDP-over-TCP framing
//!
//! A session-level 2-byte preface (magic + version) sent right after the
//! handshake marks the session as datagram relay. Each datagram then
//! travels as: 2-byte address length, 2-byte payload length, SOCKS5-style
//! address, payload.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::common::{Address, Stream};
use crate::error::{Error, Result};

pub const UOT_MAGIC: u8 = 0xEE;
pub const UOT_VERSION: u8 = 0x01;

/// Per-datagram payload cap; bounded by the 16-bit length field.
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// Write the session preface that distinguishes UoT from TCP relay.
pub async fn write_preface(stream: &mut Stream) -> Result<()> {
    stream.write_all(&[UOT_MAGIC, UOT_VERSION]).await?;
    stream.flush().await?;
    Ok(())
}

/// Read and check the session preface.
pub async fn read_preface(stream: &mut Stream) -> Result<()> {
    let mut preface = [0u8; 2];
    stream.read_exact(&mut preface).await?;
    if preface[0] != UOT_MAGIC {
        return Err(Error::Protocol(format!(
            "bad uot magic: {:#04x}",
            preface[0]
        )));
    }
    if preface[1] != UOT_VERSION {
        return Err(Error::Protocol(format!(
            "unsupported uot version: {}",
            preface[1]
        )));
    }
    Ok(())
}

/// Datagram socket multiplexed over one tunnel stream.
pub struct UotSocket {
    stream: Stream,
}

impl UotSocket {
    pub fn new(stream: Stream) -> Self {
        Self { stream }
    }

    /// Send one datagram to `addr`.
    pub async fn send_to(&mut self, payload: &[u8], addr: &Address) -> Result<()> {
        if payload.len() > MAX_DATAGRAM_SIZE {
            return Err(Error::Protocol(format!(
                "datagram too large: {}",
                payload.len()
            )));
        }
        let addr_bytes = addr.encode()?;
        let mut frame = Vec::with_capacity(4 + addr_bytes.len() + payload.len());
        frame.extend_from_slice(&(addr_bytes.len() as u16).to_be_bytes());
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        frame.extend_from_slice(&addr_bytes);
        frame.extend_from_slice(payload);
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Receive one datagram and its peer address.
    pub async fn recv_from(&mut self) -> Result<(Vec<u8>, Address)> {
        let addr_len = self.stream.read_u16().await? as usize;
        let payload_len = self.stream.read_u16().await? as usize;
        if payload_len > MAX_DATAGRAM_SIZE {
            return Err(Error::Protocol(format!(
                "datagram too large: {payload_len}"
            )));
        }

        let mut addr_bytes = vec![0u8; addr_len];
        self.stream.read_exact(&mut addr_bytes).await?;
        let (addr, used) = Address::decode(&addr_bytes)?;
        if used != addr_len {
            return Err(Error::Protocol("trailing bytes after address".into()));
        }

        let mut payload = vec![0u8; payload_len];
        self.stream.read_exact(&mut payload).await?;
        Ok((payload, addr))
    }

    /// Close the underlying tunnel stream.
    pub async fn close(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_datagram_roundtrip() {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let mut tx = UotSocket::new(Box::new(a));
        let mut rx = UotSocket::new(Box::new(b));

        let addr = Address::parse("9.9.9.9:53").unwrap();
        let payloads: Vec<Vec<u8>> = vec![
            Vec::new(),
            b"dns query".to_vec(),
            vec![0xAB; MAX_DATAGRAM_SIZE],
        ];
        for payload in &payloads {
            tx.send_to(payload, &addr).await.unwrap();
        }
        for payload in &payloads {
            let (got, from) = rx.recv_from().await.unwrap();
            assert_eq!(&got, payload);
            assert_eq!(from, addr);
        }
    }

    #[tokio::test]
    async fn test_domain_addressed_datagram() {
        let (a, b) = tokio::io::duplex(4096);
        let mut tx = UotSocket::new(Box::new(a));
        let mut rx = UotSocket::new(Box::new(b));

        let addr = Address::domain("resolver.example", 853);
        tx.send_to(b"payload", &addr).await.unwrap();
        let (got, from) = rx.recv_from().await.unwrap();
        assert_eq!(got, b"payload");
        assert_eq!(from, addr);
    }

    #[tokio::test]
    async fn test_preface_roundtrip() {
        let (a, b) = tokio::io::duplex(64);
        let mut tx: Stream = Box::new(a);
        let mut rx: Stream = Box::new(b);
        write_preface(&mut tx).await.unwrap();
        read_preface(&mut rx).await.unwrap();

        // An unknown version must be rejected.
        tx.write_all(&[UOT_MAGIC, 0x02]).await.unwrap();
        assert!(read_preface(&mut rx).await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_datagram_rejected() {
        let (a, _b) = tokio::io::duplex(4096);
        let mut tx = UotSocket::new(Box::new(a));
        let addr = Address::parse("1.1.1.1:53").unwrap();
        let oversized = vec![0u8; MAX_DATAGRAM_SIZE + 1];
        assert!(tx.send_to(&oversized, &addr).await.is_err());
    }
}
