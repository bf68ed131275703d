//! SOCKS5-form target address: parsed once per connection, right after the
//! cipher stream handshake, off the client-to-server direction.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::cipher::CipherReadHalf;

#[derive(Error, Debug)]
pub enum AddrError {
    #[error("unknown SOCKS5 address type: 0x{0:02x}")]
    UnknownType(u8),
    #[error("FQDN length was zero")]
    EmptyFqdn,
    #[error("FQDN was not valid UTF-8")]
    InvalidFqdn,
    #[error("premature EOF while reading target address")]
    Eof,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A proxy target: either a resolved socket address or a domain awaiting resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl Address {
    pub fn port(&self) -> u16 {
        match self {
            Address::Ip(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    pub fn host(&self) -> String {
        match self {
            Address::Ip(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

/// Decoupling from `tokio::io::AsyncRead`: the target address is read off
/// the decrypted client→server direction, which `CipherReadHalf` exposes as
/// an inherent async method rather than the `AsyncRead` trait. Implemented
/// for both plain `AsyncRead` transports (tests, non-ciphered callers) and
/// `CipherReadHalf`.
#[async_trait]
pub trait ByteReader: Send {
    async fn read_exact_bytes(&mut self, buf: &mut [u8]) -> Result<(), AddrError>;
}

#[async_trait]
impl<R> ByteReader for R
where
    R: AsyncRead + Unpin + Send,
{
    async fn read_exact_bytes(&mut self, buf: &mut [u8]) -> Result<(), AddrError> {
        self.read_exact(buf).await.map_err(eof_aware)?;
        Ok(())
    }
}

#[async_trait]
impl<S> ByteReader for CipherReadHalf<S>
where
    S: AsyncRead + Unpin + Send,
{
    async fn read_exact_bytes(&mut self, buf: &mut [u8]) -> Result<(), AddrError> {
        let mut read = 0;
        while read < buf.len() {
            let n = self
                .read(&mut buf[read..])
                .await
                .map_err(|e| AddrError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
            if n == 0 {
                return Err(AddrError::Eof);
            }
            read += n;
        }
        Ok(())
    }
}

/// Read the SOCKS5-form target address off the decrypted client→server
/// direction: `[atyp:1][addr][port:2 BE]`.
///
/// `atyp`: `1` = IPv4 (4 bytes), `3` = FQDN (1-byte length prefix + bytes),
/// `4` = IPv6 (16 bytes). Any other value, a zero-length FQDN, or premature
/// EOF is a fatal [`AddrError`] for the connection.
pub async fn read_target_addr<R>(stream: &mut R) -> Result<Address, AddrError>
where
    R: ByteReader,
{
    let atyp = read_u8(stream).await?;
    let addr = match atyp {
        1 => {
            let mut octets = [0u8; 4];
            stream.read_exact_bytes(&mut octets).await?;
            let port = read_port(stream).await?;
            Address::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        3 => {
            let len = read_u8(stream).await? as usize;
            if len == 0 {
                return Err(AddrError::EmptyFqdn);
            }
            let mut buf = vec![0u8; len];
            stream.read_exact_bytes(&mut buf).await?;
            let domain = String::from_utf8(buf).map_err(|_| AddrError::InvalidFqdn)?;
            let port = read_port(stream).await?;
            Address::Domain(domain, port)
        }
        4 => {
            let mut octets = [0u8; 16];
            stream.read_exact_bytes(&mut octets).await?;
            let port = read_port(stream).await?;
            Address::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        other => return Err(AddrError::UnknownType(other)),
    };
    Ok(addr)
}

async fn read_u8<R: ByteReader + ?Sized>(stream: &mut R) -> Result<u8, AddrError> {
    let mut b = [0u8; 1];
    stream.read_exact_bytes(&mut b).await?;
    Ok(b[0])
}

async fn read_port<R: ByteReader + ?Sized>(stream: &mut R) -> Result<u16, AddrError> {
    let mut b = [0u8; 2];
    stream.read_exact_bytes(&mut b).await?;
    Ok(u16::from_be_bytes(b))
}

fn eof_aware(e: std::io::Error) -> AddrError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        AddrError::Eof
    } else {
        AddrError::Io(e)
    }
}
