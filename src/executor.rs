//! Target execution over a pooled HTTP client
//!
//! The gateway pipeline is synchronous, so [`HttpTargetExecutor`] drives the
//! async hyper client with `Handle::block_on`. It must be called from a
//! blocking thread (`spawn_blocking`), never from inside an async task.

use crate::details::{Headers, RawResponse, RequestDetails, Target, TargetMode};
use crate::diagnostics::Fault;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{HeaderMap, Request};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::debug;

/// Headers that describe the inbound connection and are not forwarded.
/// `accept-encoding` is dropped so targets answer with bodies the pipeline can rewrite.
const SKIPPED_HEADERS: [&str; 5] = [
    "host",
    "content-length",
    "connection",
    "transfer-encoding",
    "accept-encoding",
];

/// Flatten a hyper header map; repeated headers are joined with `, `
pub fn collect_headers(map: &HeaderMap) -> Headers {
    let mut headers = Headers::new();
    for (name, value) in map {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        headers
            .entry(name.as_str().to_string())
            .and_modify(|existing: &mut String| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    headers
}

/// Dispatches a request to a resolved target
pub trait TargetExecutor: Send + Sync {
    /// Failures to reach the target are returned as a [`Fault`]
    fn execute(&self, target: &Target, request: &RequestDetails) -> Result<RawResponse, Fault>;
}

/// Statistics for target execution
#[derive(Debug, Default)]
pub struct ExecutorStats {
    pub total_requests: AtomicU64,
    pub failed_requests: AtomicU64,
}

impl ExecutorStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }
}

/// Configuration for the HTTP executor's connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Executes targets over HTTP; internal targets go to `internal_base_url`
pub struct HttpTargetExecutor {
    client: Client<HttpConnector, Full<Bytes>>,
    runtime: Handle,
    internal_base_url: String,
    stats: Arc<ExecutorStats>,
}

impl HttpTargetExecutor {
    pub fn new(runtime: Handle, internal_base_url: &str, config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            internal_base_url,
            "Target executor initialized"
        );

        Self {
            client,
            runtime,
            internal_base_url: internal_base_url.trim_end_matches('/').to_string(),
            stats: Arc::new(ExecutorStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ExecutorStats> {
        Arc::clone(&self.stats)
    }

    /// Absolute URI for a target and request
    pub fn absolute_uri(&self, target: &Target, request: &RequestDetails) -> String {
        let uri = target.request_uri(request);
        match target.mode {
            TargetMode::Internal => format!("{}{}", self.internal_base_url, uri),
            TargetMode::External => uri,
        }
    }

    async fn send(&self, uri: String, request: &RequestDetails) -> Result<RawResponse, Fault> {
        let method = if request.method.is_empty() {
            "GET"
        } else {
            request.method.as_str()
        };

        let mut builder = Request::builder().method(method).uri(&uri);
        for (name, value) in &request.headers {
            if SKIPPED_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }

        let outbound = builder
            .body(Full::new(Bytes::from(request.body_bytes())))
            .map_err(|e| Fault::from_error(&e))?;

        let response = self
            .client
            .request(outbound)
            .await
            .map_err(|e| Fault::from_error(&e))?;

        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| Fault::from_error(&e))?
            .to_bytes();

        Ok(RawResponse::new(status, headers, body.to_vec()))
    }
}

impl TargetExecutor for HttpTargetExecutor {
    fn execute(&self, target: &Target, request: &RequestDetails) -> Result<RawResponse, Fault> {
        let uri = self.absolute_uri(target, request);
        self.stats.record_request();
        debug!(target = %uri, method = %request.method, "Executing target");

        let result = self.runtime.block_on(self.send(uri, request));
        if result.is_err() {
            self.stats.record_failure();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_uri() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let executor = HttpTargetExecutor::new(
            runtime.handle().clone(),
            "http://127.0.0.1:8080/",
            PoolConfig::default(),
        );
        let request = RequestDetails {
            path: "a.txt".to_string(),
            query_string: "archive=abc".to_string(),
            ..Default::default()
        };

        assert_eq!(
            executor.absolute_uri(&Target::internal("/cids"), &request),
            "http://127.0.0.1:8080/cids/a.txt?archive=abc"
        );
        assert_eq!(
            executor.absolute_uri(&Target::external("http://api.test/v1"), &request),
            "http://api.test/v1/a.txt?archive=abc"
        );
    }

    #[test]
    fn test_connection_failure_is_a_fault() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        // Port 1 is reserved and refuses connections
        let executor = HttpTargetExecutor::new(
            runtime.handle().clone(),
            "http://127.0.0.1:1",
            PoolConfig::default(),
        );

        let fault = executor
            .execute(&Target::internal("/x"), &RequestDetails::default())
            .unwrap_err();
        assert!(!fault.message.is_empty());
        assert_eq!(executor.stats().get_total_requests(), 1);
        assert_eq!(executor.stats().get_failed_requests(), 1);
    }

    #[test]
    fn test_round_trip_against_local_server() {
        use std::io::{Read, Write};

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4096];
            let n = stream.read(&mut buf).unwrap();
            let head = String::from_utf8_lossy(&buf[..n]).to_string();
            let body = "a.txt\nb.txt";
            write!(
                stream,
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            )
            .unwrap();
            head
        });

        let runtime = tokio::runtime::Runtime::new().unwrap();
        let executor = HttpTargetExecutor::new(
            runtime.handle().clone(),
            &format!("http://127.0.0.1:{}", port),
            PoolConfig::default(),
        );
        let mut request = RequestDetails {
            method: "GET".to_string(),
            ..Default::default()
        };
        request.add_query_param("archive", "bafyABC");
        request.headers.insert("Accept-Encoding".to_string(), "gzip, br".to_string());
        request.headers.insert("X-Trace".to_string(), "t-1".to_string());

        let response = executor.execute(&Target::internal("/cids"), &request).unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.text, "a.txt\nb.txt");
        assert_eq!(response.content_type(), Some("text/plain"));

        let head = server.join().unwrap();
        assert!(head.starts_with("GET /cids?archive=bafyABC HTTP/1.1"));
        let head = head.to_ascii_lowercase();
        assert!(head.contains("x-trace: t-1"));
        assert!(!head.contains("accept-encoding"));
    }
}
