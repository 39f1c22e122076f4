use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tern_common::{Error, Result};
use url::{Host, Url};

/// Validate that a user-supplied tool-server URL points at a public
/// http(s) endpoint. This is a mandatory guard that must run before any
/// network I/O towards the URL.
///
/// The check is lexical: it rejects the hostname `localhost` and any IP
/// literal in a loopback, private, link-local or otherwise non-routable
/// range. It deliberately performs no DNS resolution.
pub fn validate_public_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw)
        .map_err(|e| Error::Invalid(format!("invalid server URL '{raw}': {e}")))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(Error::Invalid(format!(
                "server URL must be http or https, got '{other}'"
            )));
        }
    }

    match url.host() {
        None => {
            return Err(Error::Invalid(format!("server URL '{raw}' has no host")));
        }
        Some(Host::Domain(domain)) => {
            if domain.eq_ignore_ascii_case("localhost") {
                return Err(Error::Invalid(
                    "server URL must not point at localhost".to_string(),
                ));
            }
        }
        Some(Host::Ipv4(ip)) => {
            if is_blocked_ipv4(ip) {
                return Err(Error::Invalid(format!(
                    "server URL resolves to a private or loopback address ({ip})"
                )));
            }
        }
        Some(Host::Ipv6(ip)) => {
            if is_blocked_ipv6(ip) {
                return Err(Error::Invalid(format!(
                    "server URL resolves to a private or loopback address ({ip})"
                )));
            }
        }
    }

    Ok(url)
}

fn is_blocked_ipv4(ip: Ipv4Addr) -> bool {
    // RFC1918 private ranges, loopback, link-local (incl. cloud metadata),
    // shared address space (RFC 6598), and the unroutable edges.
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_unspecified()
        || ip.is_documentation()
        || (ip.octets()[0] == 100 && (ip.octets()[1] & 0xC0) == 64)
}

fn is_blocked_ipv6(ip: Ipv6Addr) -> bool {
    ip.is_loopback()
        || ip.is_unspecified()
        // unique-local fc00::/7
        || (ip.segments()[0] & 0xFE00) == 0xFC00
        // link-local fe80::/10
        || (ip.segments()[0] & 0xFFC0) == 0xFE80
        || ip
            .to_ipv4_mapped()
            .map(|v4| is_blocked_ipv4(v4))
            .unwrap_or(false)
}

/// Shared helper for blocklist checks on already-parsed addresses.
pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_ipv4(v4),
        IpAddr::V6(v6) => is_blocked_ipv6(v6),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_public_hosts() {
        assert!(validate_public_url("https://tools.example.com/mcp").is_ok());
        assert!(validate_public_url("http://8.8.8.8/rpc").is_ok());
        assert!(validate_public_url("https://example.com:8443/path?x=1").is_ok());
    }

    #[test]
    fn rejects_localhost_and_loopback() {
        assert!(validate_public_url("http://localhost/x").is_err());
        assert!(validate_public_url("http://LOCALHOST:9000/").is_err());
        assert!(validate_public_url("http://127.0.0.1/x").is_err());
        assert!(validate_public_url("http://127.8.4.2/").is_err());
        assert!(validate_public_url("http://[::1]/").is_err());
    }

    #[test]
    fn rejects_private_ranges() {
        assert!(validate_public_url("http://10.0.0.8/").is_err());
        assert!(validate_public_url("http://172.16.4.1/").is_err());
        assert!(validate_public_url("http://192.168.1.5/").is_err());
        assert!(validate_public_url("http://169.254.169.254/meta").is_err());
        assert!(validate_public_url("http://100.64.0.1/").is_err());
        assert!(validate_public_url("http://[fc00::1]/").is_err());
        assert!(validate_public_url("http://[fe80::1]/").is_err());
        assert!(validate_public_url("http://[::ffff:192.168.0.1]/").is_err());
    }

    #[test]
    fn rejects_non_http_schemes() {
        assert!(validate_public_url("ftp://example.com/").is_err());
        assert!(validate_public_url("file:///etc/passwd").is_err());
        assert!(validate_public_url("not a url").is_err());
    }
}
