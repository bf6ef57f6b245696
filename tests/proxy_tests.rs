use std::{
    io::Write,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use flate2::{write::GzEncoder, Compression};
use hyper::{
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server, StatusCode,
};
use mirror_proxy::{spawn_proxy, ProxyConfig, RetryPolicy, RewritePolicy};
use tokio::{sync::oneshot, task::JoinHandle};
use url::form_urlencoded;

struct TestProxy {
    addr: SocketAddr,
    handle: Option<mirror_proxy::ProxyHandle>,
    client: reqwest::Client,
}

impl TestProxy {
    async fn spawn() -> Self {
        Self::spawn_with_policy(RewritePolicy::ProxyAll).await
    }

    async fn spawn_with_policy(policy: RewritePolicy) -> Self {
        let config = ProxyConfig {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            policy,
            retry: RetryPolicy {
                max_attempts: 1,
                ..RetryPolicy::default()
            },
            ..Default::default()
        };

        let handle = spawn_proxy(config).await.expect("failed to start proxy");

        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(5))
            .build()
            .expect("client");

        Self {
            addr: handle.addr,
            handle: Some(handle),
            client,
        }
    }

    fn url(&self, path_and_query: &str) -> String {
        format!("http://{}{}", self.addr, path_and_query)
    }

    /// Builds a `/proxy?url=...` request URL for an absolute target.
    fn proxy_url(&self, target: &str) -> String {
        self.url(&format!("/proxy?url={}", encode_param(target)))
    }

    async fn get(&self, path_and_query: &str) -> reqwest::Response {
        self.client
            .get(self.url(path_and_query))
            .send()
            .await
            .expect("request")
    }

    async fn shutdown(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.shutdown().await;
        }
    }
}

fn encode_param(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

struct TestHttpBackend {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TestHttpBackend {
    async fn serve(
        handler: Arc<dyn Fn(Request<Body>) -> Response<Body> + Send + Sync + 'static>,
    ) -> Self {
        let listener = std::net::TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
            .expect("bind backend");
        listener.set_nonblocking(true).expect("set nonblocking");
        let addr = listener.local_addr().expect("local addr");

        let make_svc = make_service_fn(move |_conn| {
            let handler = handler.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |req: Request<Body>| {
                    let handler = handler.clone();
                    async move { Ok::<_, hyper::Error>((handler)(req)) }
                }))
            }
        });

        let server = Server::from_tcp(listener)
            .expect("server from tcp")
            .serve(make_svc);
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let server = server.with_graceful_shutdown(async {
                let _ = rx.await;
            });
            if let Err(err) = server.await {
                eprintln!("backend server error: {err}");
            }
        });

        Self {
            addr,
            shutdown: Some(tx),
            task,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
    }
}

fn html_backend_response(body: &'static str) -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/html; charset=utf-8")
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn health_check() {
    let proxy = TestProxy::spawn().await;

    let response = proxy.get("/health").await;
    assert_eq!(response.status(), StatusCode::OK);
    let json: serde_json::Value = response.json().await.expect("json");
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));

    proxy.shutdown().await;
}

#[tokio::test]
async fn missing_target_is_bad_request() {
    let proxy = TestProxy::spawn().await;

    let response = proxy.get("/proxy").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(response.text().await.expect("body").contains("missing"));

    proxy.shutdown().await;
}

#[tokio::test]
async fn malformed_target_is_bad_request_with_distinct_message() {
    let proxy = TestProxy::spawn().await;

    let response = proxy.get("/proxy?url=not%20a%20url").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(
        response
            .text()
            .await
            .expect("body")
            .contains("not an absolute"),
        "malformed target should be reported as invalid, not missing"
    );

    proxy.shutdown().await;
}

#[tokio::test]
async fn html_references_are_rewritten_and_script_injected() {
    static PAGE: &str = concat!(
        "<html><head>",
        r#"<meta http-equiv="Content-Security-Policy" content="default-src 'none'">"#,
        r#"<link rel="stylesheet" href="/site.css" integrity="sha384-abc">"#,
        "</head><body>",
        r#"<script src="/app.js"></script>"#,
        r#"<img srcset="/img1.png 1x, /img2.png 2x">"#,
        r#"<div style="background:url('/bg.png')"></div>"#,
        r##"<a href="#top">top</a>"##,
        "</body></html>",
    );
    let backend = TestHttpBackend::serve(Arc::new(|_req| html_backend_response(PAGE))).await;
    let proxy = TestProxy::spawn().await;

    let response = proxy
        .client
        .get(proxy.proxy_url(&backend.url("/page")))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/html; charset=utf-8")
    );
    assert_eq!(
        response
            .headers()
            .get("cache-control")
            .and_then(|v| v.to_str().ok()),
        Some("no-cache")
    );
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok()),
        Some("*")
    );

    let body = response.text().await.expect("body");
    let encoded_app_js = encode_param(&backend.url("/app.js"));
    assert!(
        body.contains(&format!("src=\"/proxy?url={encoded_app_js}\"")),
        "script src should be proxied: {body}"
    );
    let encoded_img1 = encode_param(&backend.url("/img1.png"));
    let encoded_img2 = encode_param(&backend.url("/img2.png"));
    assert!(body.contains(&format!(
        "srcset=\"/proxy?url={encoded_img1} 1x, /proxy?url={encoded_img2} 2x\""
    )));
    let encoded_bg = encode_param(&backend.url("/bg.png"));
    assert!(body.contains(&format!("url('/proxy?url={encoded_bg}')")));
    assert!(body.contains("data-mirror-injected"));
    assert!(body.contains(r##"href="#top""##), "fragments stay untouched");
    assert!(!body.contains("integrity"));
    assert!(!body.contains("Content-Security-Policy"));

    proxy.shutdown().await;
    backend.shutdown().await;
}

#[tokio::test]
async fn restrictive_upstream_response_headers_are_stripped() {
    static PAGE: &str = "<html><head></head><body>framed</body></html>";
    let backend = TestHttpBackend::serve(Arc::new(|_req| {
        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/html")
            .header("content-security-policy", "default-src 'none'")
            .header("x-frame-options", "DENY")
            .body(Body::from(PAGE))
            .unwrap()
    }))
    .await;
    let proxy = TestProxy::spawn().await;

    let response = proxy
        .client
        .get(proxy.proxy_url(&backend.url("/framed")))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("content-security-policy").is_none());
    assert!(response.headers().get("x-frame-options").is_none());

    proxy.shutdown().await;
    backend.shutdown().await;
}

#[tokio::test]
async fn gzip_encoded_html_is_decoded_before_rewriting() {
    static PAGE: &str =
        r#"<html><head><title>gz</title></head><body><img src="/pic.png"></body></html>"#;
    let backend = TestHttpBackend::serve(Arc::new(|_req| {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(PAGE.as_bytes()).unwrap();
        let compressed = encoder.finish().unwrap();
        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/html")
            .header("content-encoding", "gzip")
            .body(Body::from(compressed))
            .unwrap()
    }))
    .await;
    let proxy = TestProxy::spawn().await;

    let response = proxy
        .client
        .get(proxy.proxy_url(&backend.url("/")))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.text().await.expect("body");
    let encoded_pic = encode_param(&backend.url("/pic.png"));
    assert!(body.contains(&format!("src=\"/proxy?url={encoded_pic}\"")));
    assert!(body.contains("data-mirror-injected"));

    proxy.shutdown().await;
    backend.shutdown().await;
}

#[tokio::test]
async fn binary_bodies_pass_through_byte_for_byte() {
    static PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x01, 0x02];
    let backend = TestHttpBackend::serve(Arc::new(|_req| {
        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "image/png")
            .body(Body::from(PNG))
            .unwrap()
    }))
    .await;
    let proxy = TestProxy::spawn().await;

    let response = proxy
        .client
        .get(proxy.proxy_url(&backend.url("/pic.png")))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("image/png")
    );
    let body = response.bytes().await.expect("body");
    assert_eq!(body.as_ref(), PNG);

    proxy.shutdown().await;
    backend.shutdown().await;
}

#[tokio::test]
async fn upstream_error_status_is_mirrored() {
    let backend = TestHttpBackend::serve(Arc::new(|_req| {
        Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from("missing page"))
            .unwrap()
    }))
    .await;
    let proxy = TestProxy::spawn().await;

    let response = proxy
        .client
        .get(proxy.proxy_url(&backend.url("/gone")))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(response.text().await.expect("body").contains("missing page"));

    proxy.shutdown().await;
    backend.shutdown().await;
}

#[tokio::test]
async fn transport_failure_maps_to_bad_gateway() {
    // Grab a port that nothing is listening on.
    let listener =
        std::net::TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).unwrap();
    let dead_addr = listener.local_addr().unwrap();
    drop(listener);

    let proxy = TestProxy::spawn().await;
    let response = proxy
        .client
        .get(proxy.proxy_url(&format!("http://{dead_addr}/")))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert!(response
        .text()
        .await
        .expect("body")
        .contains("upstream fetch failed"));

    proxy.shutdown().await;
}

#[tokio::test]
async fn same_origin_policy_leaves_cross_origin_unproxied() {
    static PAGE: &str = concat!(
        "<html><head></head><body>",
        r#"<img src="/local.png">"#,
        r#"<img src="https://cdn.example.net/far.png">"#,
        "</body></html>",
    );
    let backend = TestHttpBackend::serve(Arc::new(|_req| html_backend_response(PAGE))).await;
    let proxy = TestProxy::spawn_with_policy(RewritePolicy::SameOriginOnly).await;

    let response = proxy
        .client
        .get(proxy.proxy_url(&backend.url("/page")))
        .send()
        .await
        .expect("request");
    let body = response.text().await.expect("body");

    let encoded_local = encode_param(&backend.url("/local.png"));
    assert!(body.contains(&format!("src=\"/proxy?url={encoded_local}\"")));
    assert!(
        body.contains(r#"src="https://cdn.example.net/far.png""#),
        "cross-origin reference must stay unproxied: {body}"
    );

    proxy.shutdown().await;
    backend.shutdown().await;
}

#[tokio::test]
async fn scrape_returns_raw_body() {
    static PAGE: &str = r#"<html><head></head><body><img src="/x.png"></body></html>"#;
    let backend = TestHttpBackend::serve(Arc::new(|_req| html_backend_response(PAGE))).await;
    let proxy = TestProxy::spawn().await;

    let response = proxy
        .get(&format!(
            "/scrape?url={}",
            encode_param(&backend.url("/page"))
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/html; charset=utf-8")
    );
    let body = response.text().await.expect("body");
    assert_eq!(body, PAGE, "scrape must not rewrite anything");

    proxy.shutdown().await;
    backend.shutdown().await;
}

#[tokio::test]
async fn duplicate_route_reports_unique_and_removed() {
    let proxy = TestProxy::spawn().await;

    let list = "https://a.example/v.mp4,https://b.example/v.mp4,https://a.example/v.mp4";
    let response = proxy
        .get(&format!("/duplicate?url={}", encode_param(list)))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.text().await.expect("body");
    assert!(body.starts_with("TOTAL: 3"));
    assert!(body.contains("DUPLICATES: 1"));
    assert!(body.contains("UNIQUE: 2"));

    proxy.shutdown().await;
}

#[tokio::test]
async fn check_route_separates_working_from_broken() {
    let backend = TestHttpBackend::serve(Arc::new(|req: Request<Body>| {
        if req.uri().path() == "/ok.mp4" {
            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "video/mp4")
                .body(Body::empty())
                .unwrap()
        } else {
            Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Body::empty())
                .unwrap()
        }
    }))
    .await;
    let proxy = TestProxy::spawn().await;

    let list = format!("{},{}", backend.url("/ok.mp4"), backend.url("/gone.mp4"));
    let response = proxy
        .get(&format!(
            "/check?url={}&format=json",
            encode_param(&list)
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json: serde_json::Value = response.json().await.expect("json");
    assert_eq!(json["total"], 2);
    assert_eq!(json["working"]["count"], 1);
    assert_eq!(json["working"]["urls"][0], backend.url("/ok.mp4"));
    assert_eq!(json["broken"]["count"], 1);
    assert_eq!(json["broken"]["urls"][0]["status"], "404");

    proxy.shutdown().await;
    backend.shutdown().await;
}

#[tokio::test]
async fn unknown_route_is_not_found() {
    let proxy = TestProxy::spawn().await;

    let response = proxy.get("/nope").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    proxy.shutdown().await;
}
