//! Response assembly: every byte stream leaving the proxy goes through one
//! of these builders.

use bytes::Bytes;
use http::{header, HeaderValue, Response, StatusCode};
use hyper::Body;
use serde_json::Value;

pub const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";

/// Upstream error bodies are truncated to this many bytes before being
/// echoed in a diagnostic response.
const ERROR_BODY_SNIPPET: usize = 2048;

/// Rewritten HTML. The rewrite pass only produces UTF-8 markup, so the
/// charset is forced; length is recomputed from the rewritten bytes.
pub fn html_response(status: StatusCode, body: Vec<u8>) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, HTML_CONTENT_TYPE)
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(header::CONTENT_LENGTH, body.len())
        .body(Body::from(body))
        .unwrap()
}

/// Untouched binary passthrough. `content_encoding` is forwarded when the
/// upstream body is still compressed so the browser can decode it.
pub fn binary_response(
    status: StatusCode,
    content_type: &str,
    content_encoding: Option<&HeaderValue>,
    body: Bytes,
) -> Response<Body> {
    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(header::CONTENT_LENGTH, body.len());
    if let Some(encoding) = content_encoding {
        builder = builder.header(header::CONTENT_ENCODING, encoding.clone());
    }
    builder.body(Body::from(body)).unwrap()
}

/// Mirrors a terminal upstream error status with a short diagnostic body.
pub fn upstream_error_response(status: StatusCode, upstream_body: &Bytes) -> Response<Body> {
    let snippet_len = upstream_body.len().min(ERROR_BODY_SNIPPET);
    let snippet = String::from_utf8_lossy(&upstream_body[..snippet_len]);
    text_response(
        status,
        &format!("upstream returned HTTP {status}: {snippet}"),
    )
}

pub fn text_response(status: StatusCode, body: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn json_response(status: StatusCode, value: Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(value.to_string()))
        .unwrap()
}
