//! Reference resolution against the target URL.
//!
//! Every raw value pulled out of the fetched document goes through
//! [`resolve`] before anything is rewritten. A `None` means "leave the
//! reference exactly as found" -- resolution failures are never fatal.

use url::Url;

/// Schemes that must never be rewritten. Fragment-only references are
/// handled separately since `#` is not a scheme.
const EXCLUDED_SCHEMES: &[&str] = &["javascript:", "mailto:", "data:", "blob:", "about:"];

/// True when a raw reference should be skipped before any resolution is
/// attempted: empty values, fragment-only references, and non-fetchable
/// schemes.
pub fn is_excluded(raw: &str) -> bool {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return true;
    }
    let lower = trimmed.to_ascii_lowercase();
    EXCLUDED_SCHEMES.iter().any(|scheme| lower.starts_with(scheme))
}

/// Resolves a possibly-relative reference against the target URL.
///
/// Supports absolute, scheme-relative (`//host/...`), and path-relative
/// forms via [`Url::join`]. Anything excluded, malformed, or resolving to a
/// non-http(s) scheme yields `None`.
pub fn resolve(raw: &str, base: &Url) -> Option<Url> {
    if is_excluded(raw) {
        return None;
    }
    let resolved = base.join(raw.trim()).ok()?;
    match resolved.scheme() {
        "http" | "https" => Some(resolved),
        _ => None,
    }
}

/// Scheme + host + port comparison. Path, query, and fragment are ignored.
pub fn same_origin(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme()
        && a.host_str() == b.host_str()
        && a.port_or_known_default() == b.port_or_known_default()
}

/// Recognizes a value that already points back at the proxy endpoint so the
/// rewrite pass never double-encodes it.
pub fn is_proxied(raw: &str, endpoint: &str) -> bool {
    raw.strip_prefix(endpoint)
        .map_or(false, |rest| rest.starts_with("?url="))
}
