//! Destination addresses and SOCKS5-style address framing.
//!
//! Every connection the router handles carries an [`Address`]: the
//! destination host (domain or IP literal), an optional resolved IP, and a
//! port. The same ATYP/ADDR/PORT byte framing (RFC 1928 §5) is used both by
//! the SOCKS5 inbound and by the encrypted outbound's destination header,
//! so the encode/decode pair lives here.

use std::fmt;
use std::net::IpAddr;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("unsupported address type {0:#04x}")]
    UnsupportedAtyp(u8),
    #[error("truncated address")]
    Truncated,
    #[error("domain exceeds 255 bytes")]
    DomainTooLong,
    #[error("domain is not valid UTF-8")]
    InvalidDomain,
}

/// What kind of host an [`Address`] holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrKind {
    Domain,
    Ipv4,
    Ipv6,
}

/// Normalized destination of a connection.
///
/// `ip` is filled when the host is already an IP literal; for domain hosts
/// it stays `None` until something upstream resolves it. Constructors keep
/// the invariant that `kind == Domain` exactly when `host` is not an IP
/// literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    kind: AddrKind,
    host: String,
    ip: Option<IpAddr>,
    port: u16,
}

impl Address {
    /// Build an address from a host string, classifying it as a domain or
    /// an IP literal.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        match host.parse::<IpAddr>() {
            Ok(ip) => Self {
                kind: if ip.is_ipv4() {
                    AddrKind::Ipv4
                } else {
                    AddrKind::Ipv6
                },
                host,
                ip: Some(ip),
                port,
            },
            Err(_) => Self {
                kind: AddrKind::Domain,
                host,
                ip: None,
                port,
            },
        }
    }

    /// Build an address from an already-parsed IP.
    pub fn from_ip(ip: IpAddr, port: u16) -> Self {
        Self {
            kind: if ip.is_ipv4() {
                AddrKind::Ipv4
            } else {
                AddrKind::Ipv6
            },
            host: ip.to_string(),
            ip: Some(ip),
            port,
        }
    }

    pub fn kind(&self) -> AddrKind {
        self.kind
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// The resolved IP, if one is known. `None` means "not resolved yet".
    pub fn ip(&self) -> Option<IpAddr> {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            AddrKind::Ipv6 => write!(f, "[{}]:{}", self.host, self.port),
            _ => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

/// Append the SOCKS5-style address bytes for `addr` to `buf`.
///
/// Layout: `ATYP` + (`LEN` for domains) + raw address bytes + big-endian
/// port. Domain addresses use the host string even when an IP happens to be
/// resolved; IP addresses use the 4/16 raw octets.
pub fn encode_socks_addr(addr: &Address, buf: &mut Vec<u8>) -> Result<(), ProtoError> {
    match (addr.kind(), addr.ip()) {
        (AddrKind::Domain, _) => {
            let host = addr.host().as_bytes();
            if host.len() > u8::MAX as usize {
                return Err(ProtoError::DomainTooLong);
            }
            buf.push(ATYP_DOMAIN);
            buf.push(host.len() as u8);
            buf.extend_from_slice(host);
        }
        (_, Some(IpAddr::V4(v4))) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&v4.octets());
        }
        (_, Some(IpAddr::V6(v6))) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&v6.octets());
        }
        // kind != Domain guarantees ip is Some; unreachable by construction.
        (_, None) => return Err(ProtoError::Truncated),
    }
    buf.extend_from_slice(&addr.port().to_be_bytes());
    Ok(())
}

/// Decode SOCKS5-style address bytes from the front of `data`.
///
/// Returns the address and the number of bytes consumed.
pub fn decode_socks_addr(data: &[u8]) -> Result<(Address, usize), ProtoError> {
    let atyp = *data.first().ok_or(ProtoError::Truncated)?;
    match atyp {
        ATYP_IPV4 => {
            let rest = data.get(1..7).ok_or(ProtoError::Truncated)?;
            let octets: [u8; 4] = rest[..4].try_into().expect("sliced to 4 bytes");
            let port = u16::from_be_bytes([rest[4], rest[5]]);
            Ok((Address::from_ip(IpAddr::from(octets), port), 7))
        }
        ATYP_DOMAIN => {
            let len = *data.get(1).ok_or(ProtoError::Truncated)? as usize;
            let end = 2 + len + 2;
            let rest = data.get(2..end).ok_or(ProtoError::Truncated)?;
            let host =
                std::str::from_utf8(&rest[..len]).map_err(|_| ProtoError::InvalidDomain)?;
            let port = u16::from_be_bytes([rest[len], rest[len + 1]]);
            Ok((Address::new(host, port), end))
        }
        ATYP_IPV6 => {
            let rest = data.get(1..19).ok_or(ProtoError::Truncated)?;
            let octets: [u8; 16] = rest[..16].try_into().expect("sliced to 16 bytes");
            let port = u16::from_be_bytes([rest[16], rest[17]]);
            Ok((Address::from_ip(IpAddr::from(octets), port), 19))
        }
        other => Err(ProtoError::UnsupportedAtyp(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn domain_host_is_domain_kind() {
        let addr = Address::new("www.example.com", 443);
        assert_eq!(addr.kind(), AddrKind::Domain);
        assert_eq!(addr.ip(), None);
        assert_eq!(addr.to_string(), "www.example.com:443");
    }

    #[test]
    fn ip_literal_is_classified_and_resolved() {
        let addr = Address::new("10.0.0.1", 80);
        assert_eq!(addr.kind(), AddrKind::Ipv4);
        assert_eq!(addr.ip(), Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));

        let addr = Address::new("::1", 80);
        assert_eq!(addr.kind(), AddrKind::Ipv6);
        assert_eq!(addr.to_string(), "[::1]:80");
    }

    #[test]
    fn encode_decode_ipv4_round_trip() {
        let addr = Address::from_ip(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 19999);
        let mut buf = Vec::new();
        encode_socks_addr(&addr, &mut buf).unwrap();
        assert_eq!(buf[0], ATYP_IPV4);
        assert_eq!(buf.len(), 7);

        let (decoded, used) = decode_socks_addr(&buf).unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(decoded, addr);
    }

    #[test]
    fn encode_decode_domain_round_trip() {
        let addr = Address::new("blocked.test", 443);
        let mut buf = Vec::new();
        encode_socks_addr(&addr, &mut buf).unwrap();
        assert_eq!(buf[0], ATYP_DOMAIN);
        assert_eq!(buf[1] as usize, "blocked.test".len());

        let (decoded, used) = decode_socks_addr(&buf).unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(decoded.host(), "blocked.test");
        assert_eq!(decoded.port(), 443);
        assert_eq!(decoded.kind(), AddrKind::Domain);
    }

    #[test]
    fn encode_decode_ipv6_round_trip() {
        let ip = IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1));
        let addr = Address::from_ip(ip, 8080);
        let mut buf = Vec::new();
        encode_socks_addr(&addr, &mut buf).unwrap();
        assert_eq!(buf[0], ATYP_IPV6);
        assert_eq!(buf.len(), 19);

        let (decoded, used) = decode_socks_addr(&buf).unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(decoded.ip(), Some(ip));
        assert_eq!(decoded.port(), 8080);
    }

    #[test]
    fn decode_trailing_bytes_ignored() {
        let addr = Address::new("example.com", 80);
        let mut buf = Vec::new();
        encode_socks_addr(&addr, &mut buf).unwrap();
        let framed = buf.len();
        buf.extend_from_slice(b"payload");

        let (decoded, used) = decode_socks_addr(&buf).unwrap();
        assert_eq!(used, framed);
        assert_eq!(decoded.host(), "example.com");
    }

    #[test]
    fn decode_truncated_fails() {
        let addr = Address::new("example.com", 80);
        let mut buf = Vec::new();
        encode_socks_addr(&addr, &mut buf).unwrap();
        for cut in 0..buf.len() {
            assert!(decode_socks_addr(&buf[..cut]).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn decode_unknown_atyp_fails() {
        assert!(matches!(
            decode_socks_addr(&[0x02, 0, 0]),
            Err(ProtoError::UnsupportedAtyp(0x02))
        ));
    }

    #[test]
    fn encode_overlong_domain_fails() {
        let addr = Address::new("a".repeat(300), 80);
        let mut buf = Vec::new();
        assert!(matches!(
            encode_socks_addr(&addr, &mut buf),
            Err(ProtoError::DomainTooLong)
        ));
    }
}
