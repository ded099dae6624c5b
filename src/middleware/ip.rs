//! Client IP extraction for rate-limit keys and audit logs.
//!
//! # Resolution Order
//!
//! 1. `X-Forwarded-For` (first entry), then `X-Real-IP`, if the request
//!    arrived through a trusted proxy
//! 2. The TCP peer address from axum's `ConnectInfo`, when the server was
//!    started with `into_make_service_with_connect_info`
//! 3. [`UNKNOWN_IP`]
//!
//! # IP Spoofing
//!
//! Forwarding headers are client-controlled. When `TRUSTED_PROXIES` is set and
//! the peer address is known, headers are only honoured if the peer falls in
//! one of the configured ranges; otherwise the peer address is used and the
//! attempt is logged. With no ranges configured every source is trusted, so
//! deployments exposed directly to the internet must configure it or strip
//! the headers at the edge:
//!
//! ```nginx
//! proxy_set_header X-Real-IP $remote_addr;
//! proxy_set_header X-Forwarded-For $remote_addr;
//! ```

use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::Request;
use tracing::{debug, warn};

/// Fallback when no client IP can be determined.
///
/// All such requests share one rate-limit key.
pub const UNKNOWN_IP: &str = "unknown";

// =============================================================================
// Trusted Proxy CIDR Matching
// =============================================================================

/// Parsed CIDR network range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidrRange {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrRange {
    /// Parse `"10.0.0.0/8"`, `"::1/128"`, or a bare address (implicit /32 or
    /// /128). Returns `None` if the format is invalid.
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
            Some(p) => p.parse::<u8>().ok()?,
            None => max_prefix,
        };
        if prefix_len > max_prefix {
            return None;
        }

        Some(Self {
            network,
            prefix_len,
        })
    }

    /// Check if an IP address is contained within this range.
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

/// Proxies allowed to set forwarding headers.
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

    /// `true` if `ip` is in a configured range, or if none are configured.
    pub fn is_trusted(&self, ip: &IpAddr) -> bool {
        self.ranges.is_empty() || self.ranges.iter().any(|range| range.contains(ip))
    }
}

// =============================================================================
// Extraction
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExtractedIp<'a> {
    FromXff(&'a str),
    FromRealIp(&'a str),
    NotFound,
}

#[inline]
fn extract_ip_from_headers<B>(req: &Request<B>) -> ExtractedIp<'_> {
    // Format: "client, proxy1, proxy2" - we want the first (client) IP
    if let Some(forwarded) = req.headers().get("x-forwarded-for")
        && let Ok(value) = forwarded.to_str()
        && let Some(first_ip) = value.split(',').next().map(str::trim)
        && !first_ip.is_empty()
    {
        return ExtractedIp::FromXff(first_ip);
    }

    if let Some(real_ip) = req.headers().get("x-real-ip")
        && let Ok(value) = real_ip.to_str()
        && !value.trim().is_empty()
    {
        return ExtractedIp::FromRealIp(value.trim());
    }

    ExtractedIp::NotFound
}

fn peer_addr<B>(req: &Request<B>) -> Option<IpAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

/// Resolve the client IP for `req`.
///
/// Returns `Cow::Borrowed` only for the [`UNKNOWN_IP`] fallback.
pub fn client_ip<B>(req: &Request<B>, trusted_proxies: &TrustedProxyConfig) -> Cow<'static, str> {
    let peer = peer_addr(req);

    let headers_trusted = match peer {
        Some(peer) => trusted_proxies.is_trusted(&peer),
        None => true,
    };

    if headers_trusted {
        match extract_ip_from_headers(req) {
            ExtractedIp::FromXff(ip) | ExtractedIp::FromRealIp(ip) => {
                return Cow::Owned(ip.to_string());
            }
            ExtractedIp::NotFound => {}
        }
    } else if extract_ip_from_headers(req) != ExtractedIp::NotFound {
        warn!(
            peer = ?peer,
            "Forwarding header from untrusted peer ignored"
        );
    }

    match peer {
        Some(ip) => Cow::Owned(ip.to_string()),
        None => Cow::Borrowed(UNKNOWN_IP),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request(headers: &[(&str, &str)], peer: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder();
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let mut req = builder.body(Body::empty()).unwrap();
        if let Some(peer) = peer {
            req.extensions_mut()
                .insert(ConnectInfo(peer.parse::<SocketAddr>().unwrap()));
        }
        req
    }

    fn open() -> TrustedProxyConfig {
        TrustedProxyConfig::default()
    }

    #[test]
    fn test_xff_first_entry() {
        let req = request(&[("x-forwarded-for", "  192.168.1.1 , 10.0.0.1")], None);
        assert_eq!(client_ip(&req, &open()), "192.168.1.1");
    }

    #[test]
    fn test_xff_priority_over_real_ip() {
        let req = request(
            &[("x-forwarded-for", "10.0.0.1"), ("x-real-ip", "192.168.1.1")],
            None,
        );
        assert_eq!(client_ip(&req, &open()), "10.0.0.1");

        let req = request(&[("x-real-ip", "::1")], None);
        assert_eq!(client_ip(&req, &open()), "::1");
    }

    #[test]
    fn test_empty_xff_falls_through() {
        let req = request(&[("x-forwarded-for", "   "), ("x-real-ip", "1.2.3.4")], None);
        assert_eq!(client_ip(&req, &open()), "1.2.3.4");
    }

    #[test]
    fn test_unknown_is_borrowed() {
        let req = request(&[], None);
        let ip = client_ip(&req, &open());
        assert_eq!(ip, UNKNOWN_IP);
        assert!(matches!(ip, Cow::Borrowed(_)));
    }

    #[test]
    fn test_peer_address_fallback() {
        let req = request(&[], Some("203.0.113.9:5123"));
        assert_eq!(client_ip(&req, &open()), "203.0.113.9");
    }

    #[test]
    fn test_untrusted_peer_headers_ignored() {
        let trusted = TrustedProxyConfig::new(&["10.0.0.0/8".to_string()]);

        let spoofed = request(&[("x-forwarded-for", "1.1.1.1")], Some("198.51.100.7:443"));
        assert_eq!(client_ip(&spoofed, &trusted), "198.51.100.7");

        let proxied = request(&[("x-forwarded-for", "1.1.1.1")], Some("10.1.2.3:443"));
        assert_eq!(client_ip(&proxied, &trusted), "1.1.1.1");
    }

    #[test]
    fn test_cidr_parse() {
        assert_eq!(CidrRange::parse("10.0.0.0/8").unwrap().prefix_len, 8);
        assert_eq!(CidrRange::parse("::1/128").unwrap().prefix_len, 128);
        assert_eq!(CidrRange::parse("192.168.1.1").unwrap().prefix_len, 32);
        assert!(CidrRange::parse("not-an-ip").is_none());
        assert!(CidrRange::parse("10.0.0.0/33").is_none());
        assert!(CidrRange::parse("10.0.0.0/x").is_none());
    }

    #[test]
    fn test_cidr_contains() {
        let cidr = CidrRange::parse("192.168.1.0/24").unwrap();
        assert!(cidr.contains(&"192.168.1.254".parse().unwrap()));
        assert!(!cidr.contains(&"192.168.2.1".parse().unwrap()));
        assert!(!cidr.contains(&"::1".parse().unwrap()));

        let everything = CidrRange::parse("0.0.0.0/0").unwrap();
        assert!(everything.contains(&"8.8.8.8".parse().unwrap()));

        let v6 = CidrRange::parse("2001:db8::/32").unwrap();
        assert!(v6.contains(&"2001:db8::1".parse().unwrap()));
        assert!(!v6.contains(&"2001:db9::1".parse().unwrap()));
    }

    #[test]
    fn test_trusted_proxy_config() {
        let empty = TrustedProxyConfig::new(&[]);
        assert!(!empty.is_enabled());
        assert!(empty.is_trusted(&"1.2.3.4".parse().unwrap()));

        let config = TrustedProxyConfig::new(&[
            "10.0.0.0/8".to_string(),
            "bogus".to_string(),
            "172.16.0.0/12".to_string(),
        ]);
        assert!(config.is_enabled());
        assert!(config.is_trusted(&"172.31.255.255".parse().unwrap()));
        assert!(!config.is_trusted(&"8.8.8.8".parse().unwrap()));
    }
}
