//! Pluggable destination dialer.
//!
//! The listener resolves and connects to the destination named by the SOCKS5
//! target address through this abstraction so tests (and future transports)
//! can swap in a different dial strategy without touching the listener.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

/// Default connect timeout applied when a config doesn't override it.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Strategy for reaching a proxy's declared destination.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, host: &str, port: u16) -> std::io::Result<TcpStream>;
}

/// Direct TCP dial with the platform's default timeouts, resolving domains
/// via the system resolver.
pub struct DirectDialer {
    connect_timeout: Duration,
}

impl DirectDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for DirectDialer {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(&self, host: &str, port: u16) -> std::io::Result<TcpStream> {
        let addr: SocketAddr = if let Ok(ip) = host.parse() {
            SocketAddr::new(ip, port)
        } else {
            tokio::net::lookup_host((host, port))
                .await?
                .next()
                .ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("DNS resolution failed for {host}:{port}"),
                    )
                })?
        };

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect timeout after {:?} to {addr}", self.connect_timeout),
                )
            })??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}
