//! A transparent forwarding proxy: fetches an arbitrary target URL on the
//! caller's behalf and, for HTML, rewrites every embedded reference so that
//! subsequent requests also flow back through the proxy.

use std::{io, net::SocketAddr, sync::Arc};

use chrono::Utc;
use http::{header, Request, Response, StatusCode};
use hyper::{
    server::conn::AddrStream,
    service::{make_service_fn, service_fn},
    Body,
};
use serde_json::json;
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{error, warn};
use url::form_urlencoded;

pub mod classify;
pub mod codec;
pub mod emit;
pub mod fetch;
pub mod inject;
pub mod links;
pub mod resolve;
pub mod rewrite;

pub use codec::TargetError;
pub use fetch::{FetchError, Fetcher, RetryPolicy};
pub use rewrite::{RewriteContext, RewritePolicy};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Path the rewrite pass points every proxied reference at.
pub const PROXY_ENDPOINT: &str = "/proxy";

#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub bind_addr: SocketAddr,
    pub policy: RewritePolicy,
    /// Ceiling on fetched body size; documents over it fail the fetch.
    pub max_body_bytes: usize,
    pub retry: RetryPolicy,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            policy: RewritePolicy::ProxyAll,
            max_body_bytes: 16 * 1024 * 1024,
            retry: RetryPolicy::default(),
        }
    }
}

pub struct ProxyHandle {
    pub addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ProxyHandle {
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("hyper error: {0}")]
    Hyper(#[from] hyper::Error),
}

struct AppState {
    fetcher: Fetcher,
    policy: RewritePolicy,
}

/// Binds the listener and serves requests until the handle is shut down.
pub async fn spawn_proxy(config: ProxyConfig) -> Result<ProxyHandle, ProxyError> {
    let listener = std::net::TcpListener::bind(config.bind_addr)?;
    listener.set_nonblocking(true)?;
    let local_addr = listener.local_addr()?;

    let state = Arc::new(AppState {
        fetcher: Fetcher::new(config.retry, config.max_body_bytes),
        policy: config.policy,
    });

    let make_svc = make_service_fn(move |_conn: &AddrStream| {
        let state = state.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, hyper::Error>(handle_request(state, req).await) }
            }))
        }
    });

    let server = hyper::Server::from_tcp(listener)?.serve(make_svc);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let graceful = server.with_graceful_shutdown(async move {
        let _ = shutdown_rx.await;
    });
    let task = tokio::spawn(async move {
        if let Err(err) = graceful.await {
            error!(%err, "proxy server error");
        }
    });

    Ok(ProxyHandle {
        addr: local_addr,
        shutdown: Some(shutdown_tx),
        task,
    })
}

async fn handle_request(state: Arc<AppState>, req: Request<Body>) -> Response<Body> {
    match req.uri().path() {
        "/health" => emit::json_response(
            StatusCode::OK,
            json!({
                "status": "healthy",
                "version": VERSION,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        ),
        PROXY_ENDPOINT => handle_proxy(state, req).await,
        "/scrape" => handle_scrape(state, req).await,
        "/check" => handle_check(state, req).await,
        "/duplicate" => handle_duplicate(req),
        _ => emit::text_response(StatusCode::NOT_FOUND, "Not found"),
    }
}

/// The core path: fetch the target, branch on its media type, rewrite HTML,
/// pass everything else through untouched.
async fn handle_proxy(state: Arc<AppState>, req: Request<Body>) -> Response<Body> {
    let target = match codec::decode_target(req.uri().query().unwrap_or("")) {
        Ok(target) => target,
        Err(err) => return emit::text_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };

    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok());

    let fetched = match state.fetcher.fetch(&target, user_agent).await {
        Ok(fetched) => fetched,
        Err(FetchError::Status(status, body)) => {
            warn!(%target, %status, "upstream answered with an error status");
            return emit::upstream_error_response(status, &body);
        }
        Err(err @ FetchError::Transport(_)) => {
            error!(%target, %err, "upstream fetch failed");
            return emit::text_response(StatusCode::BAD_GATEWAY, &err.to_string());
        }
    };

    let content_type = fetched
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();
    let content_encoding = fetched.headers.get(header::CONTENT_ENCODING).cloned();

    match classify::classify(&content_type) {
        classify::Classification::Html => {
            let encoding = content_encoding
                .as_ref()
                .and_then(|value| value.to_str().ok());
            let decoded = match fetch::decode_body(&fetched.body, encoding) {
                Ok(decoded) => decoded,
                Err(err) => {
                    warn!(%target, %err, "cannot decode upstream body; skipping rewrite");
                    return emit::binary_response(
                        fetched.status,
                        &content_type,
                        content_encoding.as_ref(),
                        fetched.body,
                    );
                }
            };

            let ctx = RewriteContext::new(target.clone(), state.policy, PROXY_ENDPOINT);
            match rewrite::rewrite_html(&decoded, &ctx) {
                Ok(body) => emit::html_response(fetched.status, body),
                Err(err) => {
                    error!(%target, %err, "html rewrite failed");
                    emit::text_response(StatusCode::INTERNAL_SERVER_ERROR, "HTML rewrite failed")
                }
            }
        }
        classify::Classification::Binary(sanitized) => emit::binary_response(
            fetched.status,
            &sanitized,
            content_encoding.as_ref(),
            fetched.body,
        ),
    }
}

/// Raw passthrough fetch: same fetcher, no rewriting. Useful for inspecting
/// what the upstream actually served.
async fn handle_scrape(state: Arc<AppState>, req: Request<Body>) -> Response<Body> {
    let target = match codec::decode_target(req.uri().query().unwrap_or("")) {
        Ok(target) => target,
        Err(err) => return emit::text_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };

    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok());

    match state.fetcher.fetch(&target, user_agent).await {
        Ok(fetched) => {
            let content_encoding = fetched.headers.get(header::CONTENT_ENCODING).cloned();
            emit::binary_response(
                fetched.status,
                emit::HTML_CONTENT_TYPE,
                content_encoding.as_ref(),
                fetched.body,
            )
        }
        Err(FetchError::Status(status, body)) => emit::upstream_error_response(status, &body),
        Err(err @ FetchError::Transport(_)) => {
            error!(%target, %err, "scrape fetch failed");
            emit::text_response(StatusCode::BAD_GATEWAY, &err.to_string())
        }
    }
}

async fn handle_check(state: Arc<AppState>, req: Request<Body>) -> Response<Body> {
    let query = req.uri().query().unwrap_or("");
    let urls = match query_param(query, "url") {
        Some(param) if !param.is_empty() => links::split_url_list(&param),
        _ => {
            return emit::text_response(
                StatusCode::BAD_REQUEST,
                "missing `url` query parameter (comma-separated links)",
            )
        }
    };

    let report = links::probe_urls(&state.fetcher, &urls).await;
    if query_param(query, "format").as_deref() == Some("json") {
        emit::json_response(StatusCode::OK, report.to_json())
    } else {
        emit::text_response(StatusCode::OK, &report.render_text())
    }
}

fn handle_duplicate(req: Request<Body>) -> Response<Body> {
    let urls = match query_param(req.uri().query().unwrap_or(""), "url") {
        Some(param) if !param.is_empty() => links::split_url_list(&param),
        _ => {
            return emit::text_response(
                StatusCode::BAD_REQUEST,
                "missing `url` query parameter (comma-separated links)",
            )
        }
    };

    let report = links::dedup_report(urls);
    emit::text_response(StatusCode::OK, &report.render_text())
}

fn query_param(query: &str, name: &str) -> Option<String> {
    form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}
