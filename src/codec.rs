//! Proxy URL codec: absolute URL <-> `<endpoint>?url=<pct-encoded>`.

use url::{form_urlencoded, Url};

/// Why the inbound `url` query parameter could not be turned into a target.
///
/// The two variants map to distinct client-error messages so a caller can
/// tell "no target supplied" apart from "target malformed".
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum TargetError {
    #[error("missing `url` query parameter")]
    Missing,
    #[error("`url` query parameter is not an absolute http(s) URL")]
    Invalid,
}

/// Encodes an absolute URL as a proxy-relative URL. The URL is carried as a
/// single percent-encoded query pair; no other transformation is applied, so
/// [`decode_target`] on the resulting query string is lossless.
pub fn encode(absolute: &Url, endpoint: &str) -> String {
    let query = form_urlencoded::Serializer::new(String::new())
        .append_pair("url", absolute.as_str())
        .finish();
    format!("{endpoint}?{query}")
}

/// Decodes the `url` parameter out of a raw query string.
pub fn decode_target(query: &str) -> Result<Url, TargetError> {
    let value = form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "url")
        .map(|(_, value)| value.into_owned())
        .ok_or(TargetError::Missing)?;
    if value.is_empty() {
        return Err(TargetError::Missing);
    }
    let url = Url::parse(&value).map_err(|_| TargetError::Invalid)?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        _ => Err(TargetError::Invalid),
    }
}
