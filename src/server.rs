//! HTTP host for the gateway
//!
//! Requests under `/gateway` are handed to [`GatewayService`] on a blocking
//! worker. With a content resolver attached the server also answers
//! `/cids?archive=...` and `/<cid>`, which is where internal targets land by
//! default.

use crate::archive::{self, ArchiveLookup};
use crate::cid::CidResolver;
use crate::details::{InboundRequest, RenderedPage};
use crate::error::{json_error_response, GatewayError, GatewayErrorCode};
use crate::executor::collect_headers;
use crate::service::{gateway_subpath, GatewayService};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

/// Path of the CIDS archive endpoint
const CIDS_ENDPOINT: &str = "/cids";

struct Shared {
    service: Arc<GatewayService>,
    content: Option<CidResolver>,
}

/// The gateway's HTTP listener
pub struct GatewayServer {
    bind_addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayServer {
    pub fn new(bind_addr: SocketAddr, service: Arc<GatewayService>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            shared: Arc::new(Shared {
                service,
                content: None,
            }),
            shutdown_rx,
        }
    }

    /// Serve CID content and CIDS archives next to the gateway
    pub fn with_content(mut self, resolver: CidResolver) -> Self {
        self.shared = Arc::new(Shared {
            service: Arc::clone(&self.shared.service),
            content: Some(resolver),
        });
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Gateway server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let shared = Arc::clone(&self.shared);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, shared).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, shared: Arc<Shared>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let shared = Arc::clone(&shared);
        async move { handle_request(req, shared).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(req: Request<Incoming>, shared: Arc<Shared>) -> Result<Response<Full<Bytes>>, Infallible> {
    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let path = req.uri().path().to_string();
    let mut response = if gateway_subpath(&path).is_some() {
        handle_gateway(req, Arc::clone(&shared.service), &request_id).await
    } else {
        match shared.content.as_ref().filter(|_| req.method() == Method::GET) {
            Some(resolver) if path == CIDS_ENDPOINT => {
                handle_archive(resolver, req.uri().query().unwrap_or(""))
            }
            Some(resolver) => handle_content(resolver, &path),
            None => json_error_response(
                GatewayErrorCode::NotFound,
                format!("Not a gateway path: {}", path),
            ),
        }
    };

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }
    Ok(response)
}

async fn handle_gateway(req: Request<Incoming>, service: Arc<GatewayService>, request_id: &str) -> Response<Full<Bytes>> {
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return json_error_response(
                GatewayErrorCode::BadRequest,
                format!("Failed to read request body: {}", e),
            );
        }
    };

    let inbound = InboundRequest {
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        query_string: parts.uri.query().unwrap_or("").to_string(),
        headers: collect_headers(&parts.headers),
        body: body.to_vec(),
    };

    let id = request_id.to_string();
    let result = tokio::task::spawn_blocking(move || service.handle_with_id(&id, inbound))
        .await
        .unwrap_or_else(|e| Err(GatewayError::Worker(e.to_string())));

    match result {
        Ok(page) => page_response(page),
        Err(e) => {
            error!(request_id, error = %e, "Gateway request failed");
            json_error_response(GatewayErrorCode::from(&e), e.to_string())
        }
    }
}

fn page_response(page: RenderedPage) -> Response<Full<Bytes>> {
    let status = match StatusCode::from_u16(page.status) {
        Ok(status) => status,
        Err(_) => {
            return json_error_response(
                GatewayErrorCode::InternalError,
                format!("Invalid response status {}", page.status),
            );
        }
    };

    let mut builder = Response::builder().status(status);
    for (name, value) in &page.headers {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => builder = builder.header(name, value),
            _ => debug!(header = %name, "Dropping invalid target response header"),
        }
    }

    builder
        .header(CONTENT_TYPE, page.content_type.as_str())
        .body(Full::new(Bytes::from(page.body)))
        .unwrap_or_else(|e| {
            json_error_response(
                GatewayErrorCode::InternalError,
                format!("Invalid response from gateway: {}", e),
            )
        })
}

fn query_param(query: &str, key: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('=').or(Some((pair, ""))))
        .find(|(name, _)| urlencoding::decode(name).map(|n| n == key).unwrap_or(false))
        .and_then(|(_, value)| {
            urlencoding::decode(&value.replace('+', " "))
                .ok()
                .map(|value| value.into_owned())
        })
}

fn content_response(content_type: &str, body: Vec<u8>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, content_type)
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|e| {
            json_error_response(
                GatewayErrorCode::InternalError,
                format!("Invalid content response: {}", e),
            )
        })
}

fn handle_archive(resolver: &CidResolver, query: &str) -> Response<Full<Bytes>> {
    let Some(archive_id) = query_param(query, "archive") else {
        return json_error_response(GatewayErrorCode::BadRequest, "Missing 'archive' query parameter");
    };
    let path = query_param(query, "path");

    match archive::lookup(resolver, &archive_id, path.as_deref()) {
        ArchiveLookup::Listing(listing) => content_response("text/plain; charset=utf-8", listing.into_bytes()),
        ArchiveLookup::Content(bytes) => content_response("application/octet-stream", bytes),
        ArchiveLookup::ArchiveNotFound => json_error_response(
            GatewayErrorCode::NotFound,
            format!("Archive not found: {}", archive_id),
        ),
        ArchiveLookup::EntryNotFound => json_error_response(
            GatewayErrorCode::NotFound,
            format!(
                "Entry '{}' not found in archive {}",
                path.unwrap_or_default(),
                archive_id
            ),
        ),
    }
}

fn handle_content(resolver: &CidResolver, path: &str) -> Response<Full<Bytes>> {
    let cid = path.trim_start_matches('/');
    match resolver.resolve_bytes(cid) {
        Some(bytes) => content_response("application/octet-stream", bytes),
        None => json_error_response(GatewayErrorCode::NotFound, format!("Not found: {}", path)),
    }
}
