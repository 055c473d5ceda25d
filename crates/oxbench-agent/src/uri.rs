use url::{Host, Url};

/// Validates job supplied URLs before the agent fetches them.
///
/// Only `http` and `https` are accepted. With a non-empty allow-list the
/// host must equal an allowed domain or be a subdomain of one; matching is
/// done on whole labels, so `evil-example.com` never matches `example.com`.
///
/// # Examples
///
/// ```
/// use oxbench_agent::uri::UriValidator;
///
/// let validator = UriValidator::new(["example.com"]);
/// assert!(validator.is_valid("https://sub.example.com/a"));
/// assert!(!validator.is_valid("https://evil-example.com/a"));
/// assert!(!validator.is_valid("file:///etc/passwd"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct UriValidator {
    allowed_domains: Vec<String>,
}

impl UriValidator {
    pub fn new<I, S>(allowed_domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allowed_domains = allowed_domains
            .into_iter()
            .filter_map(|d| normalize_domain(d.as_ref()))
            .collect();
        Self { allowed_domains }
    }

    /// Normalised allow-list entries.
    pub fn allowed_domains(&self) -> &[String] {
        &self.allowed_domains
    }

    pub fn is_valid(&self, uri: &str) -> bool {
        Url::parse(uri.trim()).is_ok_and(|url| self.is_valid_url(&url))
    }

    pub fn is_valid_url(&self, url: &Url) -> bool {
        if !matches!(url.scheme(), "http" | "https") {
            return false;
        }
        let Some(host) = url.host() else {
            return false;
        };
        if self.allowed_domains.is_empty() {
            return true;
        }

        let host = match host {
            Host::Domain(domain) => domain.trim_end_matches('.').to_ascii_lowercase(),
            Host::Ipv4(ip) => ip.to_string(),
            Host::Ipv6(ip) => ip.to_string(),
        };
        self.allowed_domains.iter().any(|allowed| domain_contains(allowed, &host))
    }
}

/// `host` is `domain` itself or one of its subdomains.
fn domain_contains(domain: &str, host: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

fn normalize_domain(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_start_matches("*.").trim_matches('.');
    if trimmed.is_empty() {
        return None;
    }
    match Host::parse(trimmed) {
        Ok(Host::Domain(domain)) => Some(domain.to_ascii_lowercase()),
        Ok(Host::Ipv4(ip)) => Some(ip.to_string()),
        Ok(Host::Ipv6(ip)) => Some(ip.to_string()),
        Err(e) => {
            tracing::warn!(domain = raw, error = %e, "Ignoring invalid allow-list domain");
            None
        }
    }
}
