//! Tenant resolution from the Host header

use std::net::IpAddr;

/// Remove the port from a Host header value ("example.com:8080" -> "example.com")
pub fn normalize_host(host: &str) -> &str {
    let host = host.trim();
    if let Some(rest) = host.strip_prefix('[') {
        // IPv6 literal
        return rest.split(']').next().unwrap_or(rest);
    }
    host.split(':').next().unwrap_or(host)
}

/// Maps a public hostname to the tenant it addresses, if any
#[derive(Debug, Clone, Default)]
pub struct HostResolver {
    domain: Option<String>,
}

impl HostResolver {
    /// `domain` is the base domain tenants live under (e.g. "burrow.example.com").
    /// Without it, everything left of the last two labels is the tenant id.
    pub fn new(domain: Option<String>) -> Self {
        let domain = domain
            .map(|d| d.trim().trim_matches('.').to_ascii_lowercase())
            .filter(|d| !d.is_empty());
        Self { domain }
    }

    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    pub fn tenant_id(&self, host: &str) -> Option<String> {
        let host = normalize_host(host).trim_end_matches('.').to_ascii_lowercase();
        if host.is_empty() || host.parse::<IpAddr>().is_ok() {
            return None;
        }

        let subdomain = match &self.domain {
            Some(domain) => host
                .strip_suffix(domain.as_str())
                .and_then(|prefix| prefix.strip_suffix('.'))
                .map(str::to_owned),
            None => {
                let labels: Vec<&str> = host.split('.').collect();
                if labels.len() < 3 {
                    None
                } else {
                    Some(labels[..labels.len() - 2].join("."))
                }
            }
        };

        subdomain.filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("example.com:8080"), "example.com");
        assert_eq!(normalize_host("example.com"), "example.com");
        assert_eq!(normalize_host("[::1]:3000"), "::1");
    }

    #[test]
    fn test_tenant_with_configured_domain() {
        let resolver = HostResolver::new(Some("burrow.example.com".to_string()));

        assert_eq!(
            resolver.tenant_id("quiet-otter-12.burrow.example.com:3000"),
            Some("quiet-otter-12".to_string())
        );
        assert_eq!(
            resolver.tenant_id("FOO.Burrow.Example.com"),
            Some("foo".to_string())
        );
        assert_eq!(resolver.tenant_id("burrow.example.com"), None);
        assert_eq!(resolver.tenant_id("xburrow.example.com"), None);
        assert_eq!(resolver.tenant_id("foo.other.com"), None);
    }

    #[test]
    fn test_tenant_without_domain() {
        let resolver = HostResolver::new(None);

        assert_eq!(
            resolver.tenant_id("foo.example.com"),
            Some("foo".to_string())
        );
        assert_eq!(
            resolver.tenant_id("a.b.example.com"),
            Some("a.b".to_string())
        );
        assert_eq!(resolver.tenant_id("example.com"), None);
        assert_eq!(resolver.tenant_id("localhost:3000"), None);
        assert_eq!(resolver.tenant_id("127.0.0.1:3000"), None);
        assert_eq!(resolver.tenant_id("[::1]:3000"), None);
    }
}
