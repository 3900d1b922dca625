use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use url::{Host, Url};

#[derive(Debug, Clone, PartialEq, Eq)]
enum HostPattern {
    Exact(String),
    // "*.example.com": example.com itself or any subdomain
    Domain(String),
}

impl HostPattern {
    fn parse(entry: &str) -> Option<Self> {
        let entry = normalize_host(entry.trim());
        if entry.is_empty() {
            return None;
        }
        match entry.strip_prefix("*.") {
            Some(domain) if !domain.is_empty() => Some(HostPattern::Domain(domain.to_string())),
            Some(_) => None,
            None => Some(HostPattern::Exact(entry)),
        }
    }

    fn matches(&self, host: &str) -> bool {
        match self {
            HostPattern::Exact(exact) => host == exact,
            HostPattern::Domain(domain) => {
                host == domain
                    || (host.len() > domain.len()
                        && host.ends_with(domain.as_str())
                        && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
            }
        }
    }
}

/// Remote hosts the proxy is allowed to fetch from.
///
/// An empty whitelist allows every host. Built once at startup and shared
/// read-only by all request handlers.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    patterns: Vec<HostPattern>,
    allow_private_addresses: bool,
}

impl Whitelist {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: entries
                .into_iter()
                .filter_map(|entry| HostPattern::parse(entry.as_ref()))
                .collect(),
            allow_private_addresses: false,
        }
    }

    /// Parses a comma separated list such as `"a.com,*.b.org"`.
    pub fn parse(list: &str) -> Self {
        Self::new(list.split(','))
    }

    pub fn allow_private_addresses(mut self, allow: bool) -> Self {
        self.allow_private_addresses = allow;
        self
    }

    pub fn is_open(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Returns true if `host` may be fetched from.
    pub fn authorize(&self, host: &str) -> bool {
        if self.patterns.is_empty() {
            return true;
        }
        let host = normalize_host(host);
        self.patterns.iter().any(|pattern| pattern.matches(&host))
    }

    /// True if `host` is listed verbatim, not just through a wildcard.
    pub fn lists_exactly(&self, host: &str) -> bool {
        let host = normalize_host(host);
        self.patterns
            .iter()
            .any(|pattern| matches!(pattern, HostPattern::Exact(exact) if *exact == host))
    }

    /// Whether addresses in restricted ranges may be reached for `host`.
    pub fn may_reach_restricted(&self, host: &str) -> bool {
        self.allow_private_addresses || self.lists_exactly(host)
    }

    /// Full check for a parsed target: host authorization plus the
    /// restricted address guard for IP literal hosts.
    pub fn permits(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        if !self.authorize(host) {
            return false;
        }
        match url.host() {
            Some(Host::Ipv4(ip)) => {
                !is_restricted(IpAddr::V4(ip)) || self.may_reach_restricted(host)
            }
            Some(Host::Ipv6(ip)) => {
                !is_restricted(IpAddr::V6(ip)) || self.may_reach_restricted(host)
            }
            _ => true,
        }
    }
}

fn normalize_host(host: &str) -> String {
    host.trim_end_matches('.')
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase()
}

/// Addresses a public proxy must not be steered into: loopback, private,
/// link-local, shared, unspecified, broadcast, multicast and unique-local.
pub fn is_restricted(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_restricted_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_restricted_v4(v4),
            None => is_restricted_v6(v6),
        },
    }
}

fn is_restricted_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_multicast()
        || a == 0
        || (a == 100 && (64..128).contains(&b))
}

fn is_restricted_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        || (first & 0xfe00) == 0xfc00
        || (first & 0xffc0) == 0xfe80
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_whitelist_allows_everything() {
        let whitelist = Whitelist::parse("");
        assert!(whitelist.is_open());
        assert!(whitelist.authorize("images.example.com"));
        assert!(whitelist.authorize("anything.invalid"));
    }

    #[test]
    fn exact_match_is_case_insensitive() {
        let whitelist = Whitelist::parse("images.example.com");
        assert!(whitelist.authorize("images.example.com"));
        assert!(whitelist.authorize("IMAGES.Example.COM"));
        assert!(whitelist.authorize("images.example.com."));
        assert!(!whitelist.authorize("evil.example.com"));
        assert!(!whitelist.authorize("example.com"));
        assert!(!whitelist.authorize("images.example.com.evil.net"));
    }

    #[test]
    fn wildcard_matches_domain_and_subdomains() {
        let whitelist = Whitelist::parse("*.example.com");
        assert!(whitelist.authorize("example.com"));
        assert!(whitelist.authorize("a.example.com"));
        assert!(whitelist.authorize("a.b.example.com"));
        assert!(!whitelist.authorize("notexample.com"));
        assert!(!whitelist.authorize("example.com.evil.net"));
    }

    #[test]
    fn blank_entries_are_ignored() {
        let whitelist = Whitelist::parse(" a.com, ,b.com,,*.");
        assert_eq!(whitelist.len(), 2);
        assert!(whitelist.authorize("b.com"));
        assert!(!whitelist.authorize("c.com"));
    }

    #[test]
    fn private_ip_literals_are_refused() {
        let whitelist = Whitelist::default();
        for target in [
            "http://127.0.0.1/a.png",
            "http://10.1.2.3/a.png",
            "http://169.254.169.254/latest/meta-data",
            "http://192.168.0.1/",
            "http://100.64.0.1/",
            "http://0.0.0.0/",
            "http://[::1]/a.png",
            "http://[fd00::1]/a.png",
            "http://[fe80::1]/a.png",
            "http://[::ffff:127.0.0.1]/a.png",
        ] {
            let url = Url::parse(target).unwrap();
            assert!(!whitelist.permits(&url), "{} should be refused", target);
        }

        let public = Url::parse("http://93.184.216.34/a.png").unwrap();
        assert!(whitelist.permits(&public));
    }

    #[test]
    fn private_ip_allowed_when_listed_or_configured() {
        let url = Url::parse("http://127.0.0.1:8081/a.png").unwrap();
        assert!(Whitelist::parse("127.0.0.1").permits(&url));
        assert!(Whitelist::default().allow_private_addresses(true).permits(&url));
    }

    #[test]
    fn permits_applies_host_patterns() {
        let whitelist = Whitelist::parse("images.example.com");
        let allowed = Url::parse("https://images.example.com/a.png").unwrap();
        let denied = Url::parse("https://evil.example.com/a.png").unwrap();
        assert!(whitelist.permits(&allowed));
        assert!(!whitelist.permits(&denied));
    }
}
