//! Integration tests for the HTTP host and the pooled target executor

use std::sync::Arc;
use std::time::Duration;

use cidgate::cid::{CidResolver, MemoryStore};
use cidgate::config::{GatewayConfig, Gateways};
use cidgate::executor::{HttpTargetExecutor, PoolConfig};
use cidgate::render::HtmlRenderer;
use cidgate::server::GatewayServer;
use cidgate::service::GatewayService;
use cidgate::transform::{CidTemplateStore, TransformRegistry};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Send a raw HTTP/1.1 request and return the full response text
async fn http_request(port: u16, method: &str, path: &str, extra_headers: &str) -> String {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await.unwrap();
    let request = format!(
        "{} {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n{}Connection: close\r\n\r\n",
        method, path, port, extra_headers
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

async fn http_get(port: u16, path: &str) -> String {
    http_request(port, "GET", path, "").await
}

struct Running {
    port: u16,
    store: Arc<MemoryStore>,
    shutdown_tx: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

impl Running {
    async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = tokio::time::timeout(Duration::from_secs(2), self.handle).await;
    }
}

/// Start a gateway whose internal targets point back at itself
async fn start(gateways: Gateways) -> Running {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let store = Arc::new(MemoryStore::new());
    let resolver = CidResolver::new(Arc::clone(&store) as _, "/nonexistent");
    let executor = HttpTargetExecutor::new(
        tokio::runtime::Handle::current(),
        &format!("http://127.0.0.1:{}", port),
        PoolConfig::default(),
    );
    let service = GatewayService::new(
        gateways,
        Arc::new(TransformRegistry::new(resolver.clone())),
        Arc::new(CidTemplateStore::new(resolver.clone())),
        Arc::new(executor),
        Arc::new(HtmlRenderer::new()),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let addr = listener.local_addr().unwrap();
    let server = GatewayServer::new(addr, Arc::new(service), shutdown_rx).with_content(resolver);
    let handle = tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    Running {
        port,
        store,
        shutdown_tx,
        handle,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_non_gateway_path_returns_json_404() {
    let running = start(Gateways::new()).await;

    let response = http_get(running.port, "/elsewhere/page").await;
    assert!(response.starts_with("HTTP/1.1 404"), "Response: {}", response);
    assert!(response.to_ascii_lowercase().contains("x-gateway-error: not_found"));
    assert!(response.contains("\"code\":\"NOT_FOUND\""));

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_request_id_is_propagated() {
    let running = start(Gateways::new()).await;

    let response = http_request(running.port, "GET", "/gateway", "X-Request-Id: abc-123\r\n").await;
    assert!(response.starts_with("HTTP/1.1 200"), "Response: {}", response);
    assert!(response.to_ascii_lowercase().contains("x-request-id: abc-123"));
    assert!(response.contains("<title>Gateway</title>"));

    let response = http_get(running.port, "/gateway").await;
    assert!(response.to_ascii_lowercase().contains("x-request-id: "));

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_serves_stored_content() {
    let running = start(Gateways::new()).await;
    let cid = running.store.put("stored bytes");

    let response = http_get(running.port, &format!("/{}", cid)).await;
    assert!(response.starts_with("HTTP/1.1 200"), "Response: {}", response);
    assert!(response.ends_with("stored bytes"));

    let response = http_get(running.port, "/cids").await;
    assert!(response.starts_with("HTTP/1.1 400"), "Response: {}", response);

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cids_archive_listing_end_to_end() {
    let mut gateways = Gateways::new();
    gateways.insert("cids", GatewayConfig::default());
    let running = start(gateways).await;

    let a = running.store.put("alpha contents");
    let b = running.store.put("<a href=\"/gateway/cids/x\">beta</a>");
    let archive = running.store.put(format!("a.txt {}\nb.html {}\n", a, b));

    let response = http_get(running.port, &format!("/cids?archive={}", archive)).await;
    assert!(response.ends_with("a.txt\nb.html"), "Response: {}", response);

    let response = http_get(running.port, &format!("/gateway/test/cids/{}/as/cids", archive)).await;
    assert!(response.starts_with("HTTP/1.1 200"), "Response: {}", response);
    assert_eq!(response.matches("<li>").count(), 2);
    assert!(response.contains(&format!("href=\"/gateway/test/cids/{}/as/cids/a.txt\"", archive)));

    let response = http_get(running.port, &format!("/gateway/test/cids/{}/as/cids/a.txt", archive)).await;
    assert!(response.starts_with("HTTP/1.1 200"), "Response: {}", response);
    assert!(response.ends_with("alpha contents"));

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unreachable_target_renders_request_failed() {
    let mut gateways = Gateways::new();
    gateways.insert("down", GatewayConfig::default().with_target("http://127.0.0.1:1"));
    let running = start(gateways).await;

    let response = http_get(running.port, "/gateway/down/anything").await;
    assert!(response.starts_with("HTTP/1.1 502"), "Response: {}", response);
    assert!(response.contains("<title>Request Failed</title>"));

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_archive_entry_is_passed_through() {
    let mut gateways = Gateways::new();
    gateways.insert("cids", GatewayConfig::default());
    let running = start(gateways).await;
    let archive = running.store.put("a.txt deadbeef\n");

    let response = http_get(running.port, &format!("/gateway/test/cids/{}/as/cids/zzz.txt", archive)).await;
    assert!(response.starts_with("HTTP/1.1 404"), "Response: {}", response);
    assert!(response.contains("not found in archive"));

    running.stop().await;
}
