//! Compiled IP/port blocklist evaluated inside the traffic hook.

use ipnet::IpNet;
use thiserror::Error;

use crate::packet::PacketContext;

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("invalid CIDR '{0}': {1}")]
    InvalidCidr(String, ipnet::AddrParseError),
    #[error("invalid port spec '{0}'")]
    InvalidPort(String),
    #[error("port '{0}' out of range (1..=65535)")]
    PortOutOfRange(String),
    #[error("inverted port range '{0}' (min must be <= max)")]
    InvertedRange(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PortRange {
    min: u16,
    max: u16,
}

impl PortRange {
    fn contains(&self, port: u16) -> bool {
        port >= self.min && port <= self.max
    }
}

/// Compiled from a proxy's `block_ips` (CIDRs) and `block_ports` (single
/// ports or "min-max" ranges). [`SimpleFilter::matches`] returns true when
/// the destination of a packet must be blocked.
#[derive(Debug, Clone, Default)]
pub struct SimpleFilter {
    blocked_cidrs: Vec<IpNet>,
    blocked_ports: Vec<PortRange>,
}

impl SimpleFilter {
    /// Compile a filter from CIDR strings and port specs. Fails on any
    /// invalid CIDR, non-numeric port, out-of-range port, or inverted range.
    pub fn compile(block_ips: &[String], block_ports: &[String]) -> Result<Self, FilterError> {
        let mut blocked_cidrs = Vec::with_capacity(block_ips.len());
        for cidr in block_ips {
            let net: IpNet = cidr
                .parse()
                .map_err(|e| FilterError::InvalidCidr(cidr.clone(), e))?;
            blocked_cidrs.push(net);
        }

        let mut blocked_ports = Vec::with_capacity(block_ports.len());
        for spec in block_ports {
            blocked_ports.push(parse_port_spec(spec)?);
        }

        Ok(Self {
            blocked_cidrs,
            blocked_ports,
        })
    }

    /// True when the destination IP is inside any blocked CIDR OR the
    /// destination port is inside any blocked range.
    pub fn matches(&self, ctx: &PacketContext) -> bool {
        if let Some(ip) = ctx.dst_ip {
            if self.blocked_cidrs.iter().any(|net| net.contains(&ip)) {
                return true;
            }
        }
        if let Some(port) = ctx.dst_port {
            if self.blocked_ports.iter().any(|r| r.contains(port)) {
                return true;
            }
        }
        false
    }

    /// True when this filter was compiled from empty lists and can never match.
    pub fn is_empty(&self) -> bool {
        self.blocked_cidrs.is_empty() && self.blocked_ports.is_empty()
    }
}

fn parse_port_spec(spec: &str) -> Result<PortRange, FilterError> {
    let parse_one = |s: &str| -> Result<u16, FilterError> {
        let v: u32 = s.parse().map_err(|_| FilterError::InvalidPort(spec.to_string()))?;
        if v == 0 || v > 65535 {
            return Err(FilterError::PortOutOfRange(spec.to_string()));
        }
        Ok(v as u16)
    };

    if let Some((min_s, max_s)) = spec.split_once('-') {
        let min = parse_one(min_s)?;
        let max = parse_one(max_s)?;
        if min > max {
            return Err(FilterError::InvertedRange(spec.to_string()));
        }
        Ok(PortRange { min, max })
    } else {
        let port = parse_one(spec)?;
        Ok(PortRange { min: port, max: port })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Direction, PacketContext, Protocol};

    fn ctx(dst_ip: &str, dst_port: u16) -> PacketContext {
        PacketContext::new(
            "c1",
            Direction::Out,
            Protocol::Tcp,
            None,
            None,
            Some(dst_ip.parse().unwrap()),
            Some(dst_port),
            b"x",
        )
    }

    #[test]
    fn empty_filter_matches_nothing() {
        let f = SimpleFilter::compile(&[], &[]).unwrap();
        assert!(!f.matches(&ctx("10.1.2.3", 80)));
        assert!(!f.matches(&ctx("1.2.3.4", 1)));
    }

    #[test]
    fn blocks_by_cidr() {
        let f = SimpleFilter::compile(&["10.0.0.0/8".to_string()], &[]).unwrap();
        assert!(f.matches(&ctx("10.1.2.3", 80)));
        assert!(!f.matches(&ctx("11.1.2.3", 80)));
    }

    #[test]
    fn cidr_zero_blocks_everything_v4() {
        let f = SimpleFilter::compile(&["0.0.0.0/0".to_string()], &[]).unwrap();
        assert!(f.matches(&ctx("1.2.3.4", 1)));
        assert!(f.matches(&ctx("255.255.255.255", 65535)));
    }

    #[test]
    fn blocks_by_single_port() {
        let f = SimpleFilter::compile(&[], &["80".to_string()]).unwrap();
        assert!(f.matches(&ctx("1.2.3.4", 80)));
        assert!(!f.matches(&ctx("1.2.3.4", 81)));
    }

    #[test]
    fn blocks_by_port_range() {
        let f = SimpleFilter::compile(&[], &["8000-8100".to_string()]).unwrap();
        assert!(f.matches(&ctx("1.2.3.4", 8050)));
        assert!(!f.matches(&ctx("1.2.3.4", 7999)));
        assert!(!f.matches(&ctx("1.2.3.4", 8101)));
    }

    #[test]
    fn port_zero_rejected() {
        assert!(SimpleFilter::compile(&[], &["0".to_string()]).is_err());
    }

    #[test]
    fn port_boundaries_accepted() {
        assert!(SimpleFilter::compile(&[], &["1".to_string()]).is_ok());
        assert!(SimpleFilter::compile(&[], &["65535".to_string()]).is_ok());
    }

    #[test]
    fn port_too_large_rejected() {
        assert!(SimpleFilter::compile(&[], &["65536".to_string()]).is_err());
    }

    #[test]
    fn inverted_range_rejected() {
        assert!(SimpleFilter::compile(&[], &["100-50".to_string()]).is_err());
    }

    #[test]
    fn non_numeric_port_rejected() {
        assert!(SimpleFilter::compile(&[], &["abc".to_string()]).is_err());
    }

    #[test]
    fn invalid_cidr_rejected() {
        assert!(SimpleFilter::compile(&["not-a-cidr".to_string()], &[]).is_err());
    }
}
