//! The upstream fetch collaborator: a retrying HTTPS client that produces
//! `(status, headers, body)` for the core pipeline.

use std::{
    io::{self, Cursor, Read},
    time::Duration,
};

use brotli::Decompressor;
use bytes::Bytes;
use flate2::read::{GzDecoder, ZlibDecoder};
use futures_util::StreamExt;
use http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode, Uri};
use hyper::{client::HttpConnector, Body, Client};
use hyper_rustls::HttpsConnectorBuilder;
use tracing::{debug, warn};
use url::Url;
use zstd::stream::read::Decoder as ZstdDecoder;

type HttpsClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Body>;
type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Sent when the caller did not supply a User-Agent of its own.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0";

const MAX_REDIRECTS: usize = 5;

/// Exponential backoff with caps, applied to transport errors and
/// retryable statuses (429 and 5xx).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Backoff before the next attempt; `attempt` is 1-based.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = 1u32 << attempt.saturating_sub(1).min(8);
        self.base_delay.saturating_mul(exp).min(self.max_delay)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    /// The fetch could not complete at all (network error, timeout, body
    /// over the size ceiling) after retries were exhausted.
    #[error("upstream fetch failed: {0}")]
    Transport(String),
    /// The upstream answered with a terminal non-success status; the status
    /// and body are mirrored to the caller.
    #[error("upstream returned HTTP {0}")]
    Status(StatusCode, Bytes),
}

pub struct FetchedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub struct Fetcher {
    client: HttpsClient,
    retry: RetryPolicy,
    max_body_bytes: usize,
}

impl Fetcher {
    pub fn new(retry: RetryPolicy, max_body_bytes: usize) -> Self {
        let https = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();
        Self {
            client: Client::builder().build(https),
            retry,
            max_body_bytes,
        }
    }

    /// GET with retries. Success statuses come back as `Ok`; terminal
    /// non-success statuses become [`FetchError::Status`] for mirroring.
    pub async fn fetch(
        &self,
        target: &Url,
        user_agent: Option<&str>,
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 1u32;
        loop {
            match self.fetch_once(Method::GET, target, user_agent).await {
                Ok(resp) => {
                    if resp.status.is_success() {
                        return Ok(resp);
                    }
                    if retryable_status(resp.status) && attempt < self.retry.max_attempts {
                        let delay = self.retry.backoff(attempt);
                        debug!(%target, status = %resp.status, ?delay, "retrying upstream fetch");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Status(resp.status, resp.body));
                }
                Err(err) => {
                    if attempt < self.retry.max_attempts {
                        let delay = self.retry.backoff(attempt);
                        warn!(%target, %err, ?delay, "upstream fetch error; retrying");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Transport(err.to_string()));
                }
            }
        }
    }

    /// Single HEAD request, no retries. Any status comes back as `Ok` so the
    /// caller can report it; only transport failures are errors.
    pub async fn probe_head(&self, target: &Url) -> Result<FetchedResponse, FetchError> {
        self.fetch_once(Method::HEAD, target, None)
            .await
            .map_err(|err| FetchError::Transport(err.to_string()))
    }

    async fn fetch_once(
        &self,
        method: Method,
        target: &Url,
        user_agent: Option<&str>,
    ) -> Result<FetchedResponse, BoxError> {
        let mut current = target.clone();
        let mut hops = 0usize;
        loop {
            let uri: Uri = current.as_str().parse()?;
            let mut request = Request::builder()
                .method(method.clone())
                .uri(uri)
                .body(Body::empty())?;

            let headers = request.headers_mut();
            headers.insert(
                header::USER_AGENT,
                user_agent
                    .and_then(|ua| HeaderValue::from_str(ua).ok())
                    .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_USER_AGENT)),
            );
            headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
            if let Ok(value) = HeaderValue::from_str(target.as_str()) {
                headers.insert(header::REFERER, value);
            }

            let response = self.client.request(request).await?;

            if response.status().is_redirection() && hops < MAX_REDIRECTS {
                let next = response
                    .headers()
                    .get(header::LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|location| current.join(location).ok());
                if let Some(next) = next {
                    debug!(from = %current, to = %next, "following upstream redirect");
                    current = next;
                    hops += 1;
                    continue;
                }
            }

            let status = response.status();
            let headers = response.headers().clone();
            let body = self.read_body(response.into_body()).await?;
            return Ok(FetchedResponse {
                status,
                headers,
                body,
            });
        }
    }

    async fn read_body(&self, mut body: Body) -> Result<Bytes, BoxError> {
        let mut bytes = Vec::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            if bytes.len() + chunk.len() > self.max_body_bytes {
                return Err(format!(
                    "upstream body exceeds the {} byte ceiling",
                    self.max_body_bytes
                )
                .into());
            }
            bytes.extend_from_slice(&chunk);
        }
        Ok(Bytes::from(bytes))
    }
}

fn retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Decodes an upstream body according to its `Content-Encoding` so the HTML
/// rewriter sees plain markup. An unsupported encoding is an error; the
/// caller then skips the rewrite and passes the body through untouched.
pub fn decode_body(bytes: &[u8], encoding: Option<&str>) -> io::Result<Vec<u8>> {
    let encoding = match encoding.map(|enc| enc.trim().to_ascii_lowercase()) {
        None => return Ok(bytes.to_vec()),
        Some(enc) => enc,
    };
    match encoding.as_str() {
        "" | "identity" => Ok(bytes.to_vec()),
        "gzip" => read_to_end(GzDecoder::new(Cursor::new(bytes))),
        "deflate" => read_to_end(ZlibDecoder::new(Cursor::new(bytes))),
        "br" => read_to_end(Decompressor::new(Cursor::new(bytes), 4096)),
        "zstd" => read_to_end(ZstdDecoder::new(Cursor::new(bytes))?),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported content-encoding: {other}"),
        )),
    }
}

fn read_to_end(mut reader: impl Read) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    reader.read_to_end(&mut out)?;
    Ok(out)
}
