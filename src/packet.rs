//! Immutable per-packet descriptor passed through the hook pipeline.

use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Direction of a packet relative to the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// client → remote
    Out,
    /// remote → client
    In,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Unknown,
}

/// Snapshot created once per read. Every field is filled exactly once at
/// construction; nothing here is mutated afterward.
#[derive(Debug, Clone)]
pub struct PacketContext {
    pub conn_id: String,
    pub direction: Direction,
    pub protocol: Protocol,
    pub src_ip: Option<IpAddr>,
    pub src_port: Option<u16>,
    pub dst_ip: Option<IpAddr>,
    pub dst_port: Option<u16>,
    pub start_at: u64,
    pub payload: Vec<u8>,
}

impl PacketContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conn_id: impl Into<String>,
        direction: Direction,
        protocol: Protocol,
        src_ip: Option<IpAddr>,
        src_port: Option<u16>,
        dst_ip: Option<IpAddr>,
        dst_port: Option<u16>,
        payload: &[u8],
    ) -> Self {
        Self {
            conn_id: conn_id.into(),
            direction,
            protocol,
            src_ip,
            src_port,
            dst_ip,
            dst_port,
            start_at: now_secs(),
            payload: payload.to_vec(),
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
