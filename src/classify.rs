//! Media-type classification for fetched responses.

/// Fallback echoed to the caller when the upstream content-type would be
/// unsafe to place in a response header.
pub const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// The body goes through the HTML rewrite pass.
    Html,
    /// The body passes through untouched, re-emitted with the carried
    /// (sanitized) content-type.
    Binary(String),
}

/// Branches on the declared media type. Only the segment before the first
/// `;` is inspected; a body is HTML iff that segment contains `text/html`.
///
/// For the binary branch the echoed value is restricted to printable ASCII;
/// anything else is replaced wholesale with [`FALLBACK_CONTENT_TYPE`].
pub fn classify(content_type: &str) -> Classification {
    let primary = content_type.split(';').next().unwrap_or("").trim();
    if primary.to_ascii_lowercase().contains("text/html") {
        return Classification::Html;
    }
    let sanitized = if !content_type.is_empty() && is_printable_ascii(content_type) {
        content_type.to_string()
    } else {
        FALLBACK_CONTENT_TYPE.to_string()
    };
    Classification::Binary(sanitized)
}

fn is_printable_ascii(value: &str) -> bool {
    value.bytes().all(|b| (0x20..0x7f).contains(&b))
}
