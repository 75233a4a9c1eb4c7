//! Address type for network connections
//!
//! Carries the SOCKS5-style wire codec used by the handshake and the
//! UDP-over-TCP framer: type byte 0x01/0x03/0x04 for IPv4/domain/IPv6,
//! address bytes, then a 2-byte big-endian port.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

const ADDR_TYPE_IPV4: u8 = 0x01;
const ADDR_TYPE_DOMAIN: u8 = 0x03;
const ADDR_TYPE_IPV6: u8 = 0x04;

/// Network address representation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IP socket address (IP + port)
    Socket(SocketAddr),
    /// Domain name with port
    Domain(String, u16),
}

impl Address {
    /// Create from domain and port
    pub fn domain(domain: impl Into<String>, port: u16) -> Self {
        Address::Domain(domain.into(), port)
    }

    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Socket(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    /// Get the host part as string
    pub fn host(&self) -> String {
        match self {
            Address::Socket(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    /// Parse a `"host:port"` string. IPs become socket addresses, anything
    /// else a domain address.
    pub fn parse(s: &str) -> Result<Self> {
        if let Ok(sa) = s.parse::<SocketAddr>() {
            return Ok(Address::Socket(sa));
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidAddress(format!("missing port in {s:?}")))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::InvalidAddress(format!("bad port in {s:?}")))?;
        if host.is_empty() {
            return Err(Error::InvalidAddress(format!("empty host in {s:?}")));
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(Address::Socket(SocketAddr::new(ip, port)));
        }
        Ok(Address::Domain(host.to_string(), port))
    }

    /// Serialize in SOCKS5 wire form.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(32);
        match self {
            Address::Socket(SocketAddr::V4(v4)) => {
                buf.push(ADDR_TYPE_IPV4);
                buf.extend_from_slice(&v4.ip().octets());
            }
            Address::Socket(SocketAddr::V6(v6)) => {
                buf.push(ADDR_TYPE_IPV6);
                buf.extend_from_slice(&v6.ip().octets());
            }
            Address::Domain(domain, _) => {
                let domain_bytes = domain.as_bytes();
                if domain_bytes.is_empty() || domain_bytes.len() > 255 {
                    return Err(Error::InvalidAddress(format!(
                        "domain length {} out of range",
                        domain_bytes.len()
                    )));
                }
                buf.push(ADDR_TYPE_DOMAIN);
                buf.push(domain_bytes.len() as u8);
                buf.extend_from_slice(domain_bytes);
            }
        }
        buf.extend_from_slice(&self.port().to_be_bytes());
        Ok(buf)
    }

    /// Read one SOCKS5 wire-form address from an async reader.
    pub async fn read_from<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> Result<Self> {
        let addr_type = r.read_u8().await?;
        let addr = match addr_type {
            ADDR_TYPE_IPV4 => {
                let mut octets = [0u8; 4];
                r.read_exact(&mut octets).await?;
                let port = r.read_u16().await?;
                Address::Socket(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
            }
            ADDR_TYPE_IPV6 => {
                let mut octets = [0u8; 16];
                r.read_exact(&mut octets).await?;
                let port = r.read_u16().await?;
                Address::Socket(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
            }
            ADDR_TYPE_DOMAIN => {
                let len = r.read_u8().await? as usize;
                if len == 0 {
                    return Err(Error::InvalidAddress("empty domain".into()));
                }
                let mut name = vec![0u8; len];
                r.read_exact(&mut name).await?;
                let domain = String::from_utf8(name)
                    .map_err(|_| Error::InvalidAddress("domain is not valid UTF-8".into()))?;
                let port = r.read_u16().await?;
                Address::Domain(domain, port)
            }
            other => {
                return Err(Error::InvalidAddress(format!(
                    "unknown address type {other:#04x}"
                )))
            }
        };
        Ok(addr)
    }

    /// Decode one wire-form address from a byte slice, returning the address
    /// and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let need = |n: usize| -> Result<()> {
            if buf.len() < n {
                Err(Error::InvalidAddress("truncated address".into()))
            } else {
                Ok(())
            }
        };
        need(1)?;
        match buf[0] {
            ADDR_TYPE_IPV4 => {
                need(1 + 4 + 2)?;
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&buf[1..5]);
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                Ok((
                    Address::Socket(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port)),
                    7,
                ))
            }
            ADDR_TYPE_IPV6 => {
                need(1 + 16 + 2)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[1..17]);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                Ok((
                    Address::Socket(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)),
                    19,
                ))
            }
            ADDR_TYPE_DOMAIN => {
                need(2)?;
                let len = buf[1] as usize;
                if len == 0 {
                    return Err(Error::InvalidAddress("empty domain".into()));
                }
                need(2 + len + 2)?;
                let domain = String::from_utf8(buf[2..2 + len].to_vec())
                    .map_err(|_| Error::InvalidAddress("domain is not valid UTF-8".into()))?;
                let port = u16::from_be_bytes([buf[2 + len], buf[3 + len]]);
                Ok((Address::Domain(domain, port), 2 + len + 2))
            }
            other => Err(Error::InvalidAddress(format!(
                "unknown address type {other:#04x}"
            ))),
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Socket(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }
}

impl From<(&str, u16)> for Address {
    fn from((domain, port): (&str, u16)) -> Self {
        Address::Domain(domain.to_string(), port)
    }
}
