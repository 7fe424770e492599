// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! CIDR allow-lists and client-IP extraction.

use std::net::IpAddr;

use ipnet::IpNet;
use sdrmux_app::ConfigError;

/// A list of networks parsed once at config load. Entries may be CIDR
/// notation or bare addresses, which are widened to `/32` or `/128`.
#[derive(Debug, Clone, Default)]
pub struct CidrSet {
    nets: Vec<IpNet>,
}

impl CidrSet {
    pub fn parse(entries: &[String]) -> Result<Self, ConfigError> {
        let mut nets = Vec::with_capacity(entries.len());
        for entry in entries {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let net = if let Ok(net) = entry.parse::<IpNet>() {
                net
            } else if let Ok(ip) = entry.parse::<IpAddr>() {
                IpNet::from(ip)
            } else {
                return Err(ConfigError::Invalid(format!("bad CIDR entry '{}'", entry)));
            };
            nets.push(net);
        }
        Ok(Self { nets })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.nets.iter().any(|n| n.contains(&ip))
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nets.len()
    }
}

/// Exemption policy for per-IP caps and janitor eviction.
#[derive(Debug, Clone, Default)]
pub struct BypassSet {
    cidrs: CidrSet,
    password: Option<String>,
}

impl BypassSet {
    pub fn new(cidrs: CidrSet, password: Option<String>) -> Self {
        // An empty password would make every request bypassed.
        let password = password.filter(|p| !p.is_empty());
        Self { cidrs, password }
    }

    pub fn ip_bypassed(&self, ip: IpAddr) -> bool {
        self.cidrs.contains(ip)
    }

    pub fn password_valid(&self, candidate: Option<&str>) -> bool {
        match (&self.password, candidate) {
            (Some(configured), Some(given)) => configured == given,
            _ => false,
        }
    }

    /// True when the IP is allow-listed or a correct password is shown.
    pub fn bypassed(&self, ip: IpAddr, password: Option<&str>) -> bool {
        self.password_valid(password) || self.ip_bypassed(ip)
    }
}

/// Pick the client IP for policy decisions.
///
/// The forwarded-for value is honoured only when the peer itself is a
/// trusted proxy; otherwise a client could spoof its way past per-IP
/// limits.
pub fn extract_client_ip(
    peer: IpAddr,
    forwarded_for: Option<&str>,
    trusted_proxies: &CidrSet,
) -> IpAddr {
    if !trusted_proxies.contains(peer) {
        return peer;
    }
    let Some(header) = forwarded_for else {
        return peer;
    };
    header
        .split(',')
        .next()
        .and_then(|first| first.trim().parse::<IpAddr>().ok())
        .unwrap_or(peer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn set(entries: &[&str]) -> CidrSet {
        CidrSet::parse(&entries.iter().map(|s| s.to_string()).collect::<Vec<_>>()).unwrap()
    }

    #[test]
    fn test_cidr_membership() {
        let cidrs = set(&["10.0.0.0/24", "192.168.1.7"]);
        assert!(cidrs.contains(ip("10.0.0.5")));
        assert!(!cidrs.contains(ip("10.0.1.5")));
        // Bare address widened to /32.
        assert!(cidrs.contains(ip("192.168.1.7")));
        assert!(!cidrs.contains(ip("192.168.1.8")));
    }

    #[test]
    fn test_ipv6_entry_widened() {
        let cidrs = set(&["2001:db8::1"]);
        assert!(cidrs.contains(ip("2001:db8::1")));
        assert!(!cidrs.contains(ip("2001:db8::2")));
    }

    #[test]
    fn test_bad_entry_rejected() {
        assert!(CidrSet::parse(&["not-a-cidr".to_string()]).is_err());
    }

    #[test]
    fn test_blank_entries_skipped() {
        let cidrs = set(&["", "  "]);
        assert!(cidrs.is_empty());
    }

    #[test]
    fn test_bypass_password() {
        let bypass = BypassSet::new(CidrSet::default(), Some("hunter2".into()));
        assert!(bypass.password_valid(Some("hunter2")));
        assert!(!bypass.password_valid(Some("wrong")));
        assert!(!bypass.password_valid(None));
        assert!(bypass.bypassed(ip("203.0.113.9"), Some("hunter2")));
        assert!(!bypass.bypassed(ip("203.0.113.9"), None));
    }

    #[test]
    fn test_empty_password_never_matches() {
        let bypass = BypassSet::new(CidrSet::default(), Some(String::new()));
        assert!(!bypass.password_valid(Some("")));
    }

    #[test]
    fn test_bypass_cidr() {
        let bypass = BypassSet::new(set(&["10.0.0.0/24"]), None);
        assert!(bypass.bypassed(ip("10.0.0.5"), None));
        assert!(!bypass.bypassed(ip("10.0.1.5"), None));
    }

    #[test]
    fn test_client_ip_from_untrusted_peer_is_peer() {
        let trusted = set(&["127.0.0.1"]);
        let got = extract_client_ip(ip("203.0.113.9"), Some("198.51.100.1"), &trusted);
        assert_eq!(got, ip("203.0.113.9"));
    }

    #[test]
    fn test_client_ip_from_trusted_proxy_uses_header() {
        let trusted = set(&["127.0.0.1"]);
        let got = extract_client_ip(
            ip("127.0.0.1"),
            Some("198.51.100.1, 10.0.0.2"),
            &trusted,
        );
        assert_eq!(got, ip("198.51.100.1"));
    }

    #[test]
    fn test_client_ip_garbage_header_falls_back_to_peer() {
        let trusted = set(&["127.0.0.1"]);
        let got = extract_client_ip(ip("127.0.0.1"), Some("banana"), &trusted);
        assert_eq!(got, ip("127.0.0.1"));
    }
}
