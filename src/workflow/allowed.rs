//! Site allow-list checks.
//!
//! A workflow only touches pages whose URL matches its allowed-site list.
//! The check runs before a run starts (current tab) and before every goTo
//! navigation (target URL). An empty list denies everything.

use crate::workflow::schema::AllowedSite;

/// Outcome of an allow-list check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowCheck {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl AllowCheck {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Check `url` against the allow-list.
///
/// Entries are either a bare host ("a.test", matching the host and its
/// subdomains) or a host with a path prefix ("a.test/admin").
pub fn is_url_allowed(url: Option<&str>, allowed: &[AllowedSite]) -> AllowCheck {
    let Some(url) = url.filter(|u| !u.trim().is_empty()) else {
        return AllowCheck::deny("No page URL available to check against the allowed sites.");
    };

    if allowed.is_empty() {
        return AllowCheck::deny("No allowed sites configured for this workflow.");
    }

    let Some((host, path)) = split_host_path(url) else {
        return AllowCheck::deny(format!("URL {url} is not a valid http(s) address."));
    };

    for site in allowed {
        let entry = site.host.trim().trim_end_matches('/');
        if entry.is_empty() {
            continue;
        }
        match entry.split_once('/') {
            Some((entry_host, entry_path)) => {
                let prefix = format!("/{entry_path}");
                if host_matches(&host, entry_host) && path.starts_with(&prefix) {
                    return AllowCheck::allow();
                }
            }
            None => {
                if host_matches(&host, entry) {
                    return AllowCheck::allow();
                }
            }
        }
    }

    AllowCheck::deny(format!("{host} is not in the allowed sites list."))
}

/// Exact host match, or a subdomain of the entry.
fn host_matches(host: &str, entry: &str) -> bool {
    let entry = entry.to_ascii_lowercase();
    host == entry || host.ends_with(&format!(".{entry}"))
}

/// Pull (lowercased host, path) out of an http(s) URL without a URL crate.
fn split_host_path(url: &str) -> Option<(String, String)> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    if rest.is_empty() {
        return None;
    }
    let (authority, path) = match rest.find(['/', '?', '#']) {
        Some(idx) if rest.as_bytes()[idx] == b'/' => {
            let (a, p) = rest.split_at(idx);
            let p = p.split(['?', '#']).next().unwrap_or("/");
            (a, p.to_string())
        }
        Some(idx) => (&rest[..idx], "/".to_string()),
        None => (rest, "/".to_string()),
    };
    // Drop userinfo and port.
    let host = authority
        .rsplit('@')
        .next()
        .unwrap_or(authority)
        .split(':')
        .next()
        .unwrap_or("");
    if host.is_empty() {
        return None;
    }
    Some((host.to_ascii_lowercase(), path))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sites(entries: &[&str]) -> Vec<AllowedSite> {
        entries
            .iter()
            .map(|h| AllowedSite {
                host: h.to_string(),
                favicon: String::new(),
            })
            .collect()
    }

    #[test]
    fn test_empty_list_denies() {
        let check = is_url_allowed(Some("https://a.test/"), &[]);
        assert!(!check.allowed);
    }

    #[test]
    fn test_host_and_subdomain_match() {
        let allowed = sites(&["a.test"]);
        assert!(is_url_allowed(Some("https://a.test/page"), &allowed).allowed);
        assert!(is_url_allowed(Some("https://shop.a.test/"), &allowed).allowed);
        assert!(!is_url_allowed(Some("https://nota.test/"), &allowed).allowed);
        assert!(!is_url_allowed(Some("https://evila.test/"), &allowed).allowed);
    }

    #[test]
    fn test_path_prefix_entry() {
        let allowed = sites(&["a.test/admin"]);
        assert!(is_url_allowed(Some("https://a.test/admin/users"), &allowed).allowed);
        assert!(!is_url_allowed(Some("https://a.test/shop"), &allowed).allowed);
    }

    #[test]
    fn test_non_http_denied() {
        let allowed = sites(&["a.test"]);
        assert!(!is_url_allowed(Some("chrome://settings"), &allowed).allowed);
        assert!(!is_url_allowed(Some("about:blank"), &allowed).allowed);
        assert!(!is_url_allowed(None, &allowed).allowed);
    }

    #[test]
    fn test_port_and_case_ignored() {
        let allowed = sites(&["A.Test"]);
        assert!(is_url_allowed(Some("https://a.test:8443/x"), &allowed).allowed);
    }
}
