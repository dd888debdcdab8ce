//! Client address resolution for rate-limit keys.
//!
//! # Security Warning: IP Spoofing Risk
//!
//! `X-Forwarded-For` and `X-Real-IP` are client-controlled unless a reverse
//! proxy overwrites them. Without `TRUSTED_PROXIES`, these headers are taken
//! at face value and an attacker reaching the service directly can rotate
//! spoofed addresses to dodge per-address limits.
//!
//! With `TRUSTED_PROXIES` configured, forwarding headers are honored only
//! when the socket peer falls inside one of the trusted CIDR ranges; any
//! other peer is keyed by its own socket address.
//!
//! ```nginx
//! # nginx: overwrite, do not append
//! proxy_set_header X-Real-IP $remote_addr;
//! proxy_set_header X-Forwarded-For $remote_addr;
//! ```
//!
//! # Resolution order
//!
//! 1. socket peer, if trusted proxies are configured and the peer is not one
//! 2. first hop of `X-Forwarded-For`
//! 3. `X-Real-IP`
//! 4. socket peer
//! 5. [`UNKNOWN_IP`]

use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;
use tracing::{debug, warn};

/// Shared key for requests with no resolvable address.
pub const UNKNOWN_IP: &str = "unknown";

// =============================================================================
// Trusted Proxy CIDR Matching
// =============================================================================

/// Parsed CIDR network range.
#[derive(Debug, Clone)]
pub struct CidrRange {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrRange {
    /// Parse `"10.0.0.0/8"`, `"::1/128"` or a bare address (host route).
    pub fn parse(cidr: &str) -> Option<Self> {
        let (addr, prefix) = match cidr.trim().split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (cidr.trim(), None),
        };

        let network: IpAddr = addr.parse().ok()?;
        let max_prefix = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let prefix_len = match prefix {
            Some(p) => p.parse::<u8>().ok().filter(|len| *len <= max_prefix)?,
            None => max_prefix,
        };

        Some(Self {
            network,
            prefix_len,
        })
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (&self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = u32::MAX
                    .checked_shl(32 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                (u32::from(*net) & mask) == (u32::from(*addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = u128::MAX
                    .checked_shl(128 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                (u128::from(*net) & mask) == (u128::from(*addr) & mask)
            }
            _ => false,
        }
    }
}

/// Reverse proxies allowed to set forwarding headers.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxyConfig {
    ranges: Vec<CidrRange>,
}

impl TrustedProxyConfig {
    /// Build from CIDR strings. Invalid entries are logged and skipped.
    pub fn new(cidrs: &[String]) -> Self {
        let ranges: Vec<CidrRange> = cidrs
            .iter()
            .filter_map(|cidr| {
                let parsed = CidrRange::parse(cidr);
                if parsed.is_none() {
                    warn!(cidr = %cidr, "Invalid CIDR range in TRUSTED_PROXIES, skipping");
                }
                parsed
            })
            .collect();

        if !ranges.is_empty() {
            debug!(count = ranges.len(), "Trusted proxy validation enabled");
        }

        Self { ranges }
    }

    pub fn is_enabled(&self) -> bool {
        !self.ranges.is_empty()
    }

    /// Whether `ip` may set forwarding headers. Everything is trusted when
    /// no ranges are configured.
    pub fn is_trusted(&self, ip: &IpAddr) -> bool {
        self.ranges.is_empty() || self.ranges.iter().any(|range| range.contains(ip))
    }
}

// =============================================================================
// Extraction
// =============================================================================

fn forwarded_ip(headers: &HeaderMap) -> Option<&str> {
    // Format: "client, proxy1, proxy2" - the first hop is the client
    let from_xff = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());

    from_xff.or_else(|| {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
    })
}

/// Resolve the client address for keying.
///
/// Returns a borrowed [`UNKNOWN_IP`] when nothing is known.
pub fn client_ip(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trusted_proxies: &TrustedProxyConfig,
) -> Cow<'static, str> {
    if let Some(peer) = peer
        && !trusted_proxies.is_trusted(&peer.ip())
    {
        if forwarded_ip(headers).is_some() {
            debug!(peer = %peer.ip(), "Ignoring forwarding headers from untrusted peer");
        }
        return Cow::Owned(peer.ip().to_string());
    }

    if let Some(ip) = forwarded_ip(headers) {
        return Cow::Owned(ip.to_string());
    }

    match peer {
        Some(peer) => Cow::Owned(peer.ip().to_string()),
        None => Cow::Borrowed(UNKNOWN_IP),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    fn peer(addr: &str) -> Option<SocketAddr> {
        Some(addr.parse().unwrap())
    }

    #[test]
    fn test_xff_first_hop() {
        let h = headers(&[("x-forwarded-for", "  192.168.1.1  , 10.0.0.1")]);
        let ip = client_ip(&h, None, &TrustedProxyConfig::default());
        assert_eq!(ip, "192.168.1.1");
    }

    #[test]
    fn test_xff_priority_over_real_ip() {
        let h = headers(&[("x-forwarded-for", "10.0.0.1"), ("x-real-ip", "192.168.1.1")]);
        assert_eq!(
            client_ip(&h, None, &TrustedProxyConfig::default()),
            "10.0.0.1"
        );
    }

    #[test]
    fn test_real_ip_with_ipv6() {
        let h = headers(&[("x-real-ip", "::1")]);
        assert_eq!(client_ip(&h, None, &TrustedProxyConfig::default()), "::1");
    }

    #[test]
    fn test_empty_xff_falls_through() {
        let h = headers(&[("x-forwarded-for", "   "), ("x-real-ip", "192.168.1.9")]);
        assert_eq!(
            client_ip(&h, None, &TrustedProxyConfig::default()),
            "192.168.1.9"
        );
    }

    #[test]
    fn test_peer_address_fallback() {
        let ip = client_ip(
            &HeaderMap::new(),
            peer("198.51.100.4:5555"),
            &TrustedProxyConfig::default(),
        );
        assert_eq!(ip, "198.51.100.4");
    }

    #[test]
    fn test_unknown_is_borrowed() {
        let ip = client_ip(&HeaderMap::new(), None, &TrustedProxyConfig::default());
        assert_eq!(ip, UNKNOWN_IP);
        assert!(matches!(ip, Cow::Borrowed(_)));
    }

    #[test]
    fn test_untrusted_peer_cannot_spoof() {
        let proxies = TrustedProxyConfig::new(&["10.0.0.0/8".to_string()]);
        let h = headers(&[("x-forwarded-for", "1.2.3.4")]);

        assert_eq!(client_ip(&h, peer("203.0.113.9:4000"), &proxies), "203.0.113.9");
        assert_eq!(client_ip(&h, peer("10.1.2.3:4000"), &proxies), "1.2.3.4");
    }

    #[test]
    fn test_long_proxy_chain() {
        let chain = (0..100)
            .map(|i| format!("10.0.0.{}", i % 256))
            .collect::<Vec<_>>()
            .join(", ");
        let mut h = HeaderMap::new();
        h.insert("x-forwarded-for", HeaderValue::from_str(&chain).unwrap());

        assert_eq!(
            client_ip(&h, None, &TrustedProxyConfig::default()),
            "10.0.0.0"
        );
    }

    // ==========================================================================
    // CIDR Range Tests
    // ==========================================================================

    #[test]
    fn test_cidr_parse() {
        assert_eq!(CidrRange::parse("10.0.0.0/8").unwrap().prefix_len, 8);
        assert_eq!(CidrRange::parse("::1/128").unwrap().prefix_len, 128);
        assert_eq!(CidrRange::parse("192.168.1.1").unwrap().prefix_len, 32);
        assert!(CidrRange::parse("not-an-ip").is_none());
        assert!(CidrRange::parse("10.0.0.0/33").is_none());
    }

    #[test]
    fn test_cidr_contains() {
        let cidr = CidrRange::parse("192.168.1.0/24").unwrap();
        assert!(cidr.contains(&"192.168.1.254".parse().unwrap()));
        assert!(!cidr.contains(&"192.168.2.1".parse().unwrap()));
        assert!(!cidr.contains(&"::1".parse().unwrap()));

        let all = CidrRange::parse("0.0.0.0/0").unwrap();
        assert!(all.contains(&"8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_trusted_proxy_config() {
        let empty = TrustedProxyConfig::new(&[]);
        assert!(!empty.is_enabled());
        assert!(empty.is_trusted(&"1.2.3.4".parse().unwrap()));

        let config = TrustedProxyConfig::new(&[
            "10.0.0.0/8".to_string(),
            "172.16.0.0/12".to_string(),
            "bogus".to_string(),
        ]);
        assert!(config.is_enabled());
        assert!(config.is_trusted(&"172.31.255.255".parse().unwrap()));
        assert!(!config.is_trusted(&"8.8.8.8".parse().unwrap()));
    }
}
