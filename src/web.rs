// 🌐 Web - Site and origin extraction for publishers and destinations

use crate::entities::EventSurfaceType;
use url::{Host, Url};

/// Scheme plus registrable domain, e.g. `https://shop.example.co.uk/a` -> `https://example.co.uk`.
///
/// The registrable domain comes from the public suffix list. IP addresses and
/// single-label hosts are returned whole; a host that is itself a public
/// suffix has no site.
pub fn top_private_domain_and_scheme(uri: &str) -> Option<String> {
    let url = Url::parse(uri).ok()?;
    let host = url.host()?;

    let site = match host {
        Host::Domain(domain) => {
            let domain = domain.trim_end_matches('.');
            if domain.is_empty() {
                return None;
            }
            if domain.contains('.') {
                psl::domain_str(domain)?.to_string()
            } else {
                domain.to_string()
            }
        }
        Host::Ipv4(ip) => ip.to_string(),
        Host::Ipv6(ip) => format!("[{}]", ip),
    };

    Some(format!("{}://{}", url.scheme(), site))
}

/// Scheme plus full host, dropping port, path and query.
pub fn base_uri(uri: &str) -> Option<String> {
    let url = Url::parse(uri).ok()?;
    let host = url.host_str()?;
    if host.is_empty() {
        return None;
    }
    Some(format!("{}://{}", url.scheme(), host))
}

/// Site used for matching and rate limiting: apps keep their base uri, web
/// surfaces collapse to their registrable domain.
pub fn site_for(uri: &str, surface: EventSurfaceType) -> Option<String> {
    match surface {
        EventSurfaceType::App => base_uri(uri),
        EventSurfaceType::Web => top_private_domain_and_scheme(uri),
    }
}

/// True when `candidate` has the same scheme as `base` and its host is the
/// base host or one of its subdomains. Paths on `candidate` are ignored.
pub fn is_same_site_or_subdomain(candidate: &str, base: &str) -> bool {
    let (Ok(candidate), Ok(base)) = (Url::parse(candidate), Url::parse(base)) else {
        return false;
    };
    if candidate.scheme() != base.scheme() {
        return false;
    }
    match (candidate.host_str(), base.host_str()) {
        (Some(c), Some(b)) => c == b || c.ends_with(&format!(".{}", b)),
        _ => false,
    }
}
