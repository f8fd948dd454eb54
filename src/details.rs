//! Request/response records that flow through the gateway pipeline
//!
//! Each pipeline stage hands the next an explicit record instead of an open
//! map: [`RequestDetails`] before dispatch, [`ResponseDetails`] after it, and
//! a [`DebugContext`] that only ever feeds diagnostic pages.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Instant;

/// Header map used throughout the pipeline (name -> value)
pub type Headers = BTreeMap<String, String>;

/// Gateway names whose test path encodes `<archiveId>/<innerPath>`
pub const ARCHIVE_GATEWAYS: [&str; 2] = ["hrx", "cids"];

/// Case-insensitive header lookup
pub fn header_value<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Returns true when a content type names JSON (`application/json`, `+json` suffixes)
pub fn is_json_content_type(content_type: &str) -> bool {
    let mime = content_type.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    mime == "application/json" || mime.ends_with("+json")
}

/// Returns true when a content type names an HTML document
pub fn is_html_content_type(content_type: &str) -> bool {
    content_type.to_ascii_lowercase().contains("text/html")
}

/// A body that is either text or raw bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Bytes(Vec<u8>),
}

impl Payload {
    /// Coerce to text, replacing invalid UTF-8 sequences
    pub fn into_text(self) -> String {
        match self {
            Payload::Text(text) => text,
            Payload::Bytes(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Payload::Text(text) => text.into_bytes(),
            Payload::Bytes(bytes) => bytes,
        }
    }
}

/// The inbound request as handed over by the host HTTP layer
#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
    pub method: String,
    pub path: String,
    pub query_string: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl InboundRequest {
    pub fn get(path: &str) -> Self {
        Self {
            method: "GET".to_string(),
            path: path.to_string(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_query(mut self, query: &str) -> Self {
        self.query_string = query.to_string();
        self
    }

    pub fn with_body(mut self, method: &str, body: impl Into<Vec<u8>>) -> Self {
        self.method = method.to_string();
        self.body = body.into();
        self
    }

    /// Parsed JSON body, if the request declares JSON and the body parses
    pub fn json_body(&self) -> Option<Value> {
        let content_type = header_value(&self.headers, "content-type")?;
        if !is_json_content_type(content_type) || self.body.is_empty() {
            return None;
        }
        serde_json::from_slice(&self.body).ok()
    }

    /// Body as text, `None` when empty
    pub fn raw_body(&self) -> Option<String> {
        if self.body.is_empty() {
            return None;
        }
        Some(String::from_utf8_lossy(&self.body).into_owned())
    }

    /// Headers with the `Cookie` header removed
    pub fn headers_without_cookie(&self) -> Headers {
        self.headers
            .iter()
            .filter(|(name, _)| !name.eq_ignore_ascii_case("cookie"))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }
}

/// Request record handed to request transforms and to the target executor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestDetails {
    pub path: String,
    pub query_string: String,
    pub method: String,
    pub headers: Headers,
    pub json_body: Option<Value>,
    pub raw_body: Option<String>,
}

impl RequestDetails {
    /// Build from the inbound request; `path` is the rest path below the gateway
    pub fn from_inbound(inbound: &InboundRequest, path: &str) -> Self {
        Self {
            path: path.to_string(),
            query_string: inbound.query_string.clone(),
            method: inbound.method.clone(),
            headers: inbound.headers_without_cookie(),
            json_body: inbound.json_body(),
            raw_body: inbound.raw_body(),
        }
    }

    /// Body bytes to send to a target: raw text if present, else serialized JSON
    pub fn body_bytes(&self) -> Vec<u8> {
        if let Some(raw) = &self.raw_body {
            return raw.as_bytes().to_vec();
        }
        match &self.json_body {
            Some(json) => serde_json::to_vec(json).unwrap_or_default(),
            None => Vec::new(),
        }
    }

    /// Whether the query string already carries `key`
    pub fn has_query_param(&self, key: &str) -> bool {
        self.query_string
            .split('&')
            .filter(|pair| !pair.is_empty())
            .filter_map(|pair| pair.split('=').next())
            .any(|name| {
                urlencoding::decode(name)
                    .map(|decoded| decoded == key)
                    .unwrap_or(false)
            })
    }

    /// Append `key=value` unless the key is already present
    pub fn add_query_param(&mut self, key: &str, value: &str) {
        if self.has_query_param(key) {
            return;
        }
        let pair = format!("{}={}", urlencoding::encode(key), urlencoding::encode(value));
        if self.query_string.is_empty() {
            self.query_string = pair;
        } else {
            self.query_string.push('&');
            self.query_string.push_str(&pair);
        }
    }
}

/// Response record built from the target's raw response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseDetails {
    pub status_code: u16,
    pub headers: Headers,
    #[serde(skip)]
    pub content: Vec<u8>,
    pub text: String,
    pub json_body: Option<Value>,
    pub request_path: String,
    pub source: String,
}

impl ResponseDetails {
    pub fn from_raw(raw: RawResponse, request_path: &str, source: &str) -> Self {
        let json_body = raw
            .content_type()
            .filter(|ct| is_json_content_type(ct))
            .and_then(|_| serde_json::from_slice(&raw.content).ok());
        Self {
            status_code: raw.status_code,
            headers: raw.headers,
            content: raw.content,
            text: raw.text,
            json_body,
            request_path: request_path.to_string(),
            source: source.to_string(),
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        header_value(&self.headers, "content-type")
    }
}

/// What the target executor returns
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawResponse {
    pub status_code: u16,
    pub headers: Headers,
    pub content: Vec<u8>,
    pub text: String,
}

impl RawResponse {
    pub fn new(status_code: u16, headers: Headers, content: impl Into<Vec<u8>>) -> Self {
        let content = content.into();
        let text = String::from_utf8_lossy(&content).into_owned();
        Self {
            status_code,
            headers,
            content,
            text,
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        header_value(&self.headers, "content-type")
    }
}

/// How a target is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetMode {
    /// A path on the host's own server (internal redirect)
    Internal,
    /// An absolute URL
    External,
}

/// Where the pipeline dispatches a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Target {
    pub mode: TargetMode,
    pub url: String,
}

impl Target {
    pub fn internal(path: &str) -> Self {
        Self {
            mode: TargetMode::Internal,
            url: format!("/{}", path.trim_start_matches('/')),
        }
    }

    pub fn external(url: &str) -> Self {
        Self {
            mode: TargetMode::External,
            url: url.to_string(),
        }
    }

    /// Target URL joined with the request path, without the query string
    pub fn path_for(&self, request: &RequestDetails) -> String {
        let rest = request.path.trim_start_matches('/');
        if rest.is_empty() {
            self.url.clone()
        } else {
            format!("{}/{}", self.url.trim_end_matches('/'), rest)
        }
    }

    /// Full URI for a request: target URL, request path and query string
    pub fn request_uri(&self, request: &RequestDetails) -> String {
        let mut uri = self.path_for(request);
        if !request.query_string.is_empty() {
            uri.push(if uri.contains('?') { '&' } else { '?' });
            uri.push_str(&request.query_string);
        }
        uri
    }
}

/// Archive reference derived from a test path of an archive-backed gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveInfo {
    pub archive_id: String,
    pub inner_path: String,
}

impl ArchiveInfo {
    /// Split `test_path` on its first `/` for the `hrx` and `cids` gateways
    pub fn derive(gateway: &str, test_path: &str) -> Option<Self> {
        if !ARCHIVE_GATEWAYS.contains(&gateway) {
            return None;
        }
        let (archive_id, inner_path) = test_path.split_once('/').unwrap_or((test_path, ""));
        Some(Self {
            archive_id: archive_id.to_string(),
            inner_path: inner_path.to_string(),
        })
    }
}

/// Free-form diagnostic state attached to error pages
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct DebugContext(Map<String, Value>);

impl DebugContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, value: impl Serialize) {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.0.insert(key.to_string(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_pretty(&self) -> String {
        serde_json::to_string_pretty(&self.0).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Response headers that only describe the target connection or are set by the host
const HOST_RESPONSE_HEADERS: [&str; 5] = [
    "content-type",
    "content-length",
    "connection",
    "transfer-encoding",
    "keep-alive",
];

/// Target response headers worth passing on to the client
pub fn forwardable_response_headers(headers: &Headers) -> Headers {
    headers
        .iter()
        .filter(|(name, _)| !HOST_RESPONSE_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// A finished page handed back to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPage {
    pub status: u16,
    pub content_type: String,
    /// Extra headers from the target, e.g. `location` or `set-cookie`
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl RenderedPage {
    pub fn html(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/html; charset=utf-8".to_string(),
            headers: Headers::new(),
            body: body.into().into_bytes(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Output a transform produced itself, still subject to link rewriting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreRendered {
    pub output: Payload,
    pub content_type: String,
}

/// What the Finalize stage turns into the final page
#[derive(Debug, Clone, PartialEq)]
pub enum FinalizedResponse {
    Raw(ResponseDetails),
    PreRendered(PreRendered),
}

/// Result of a request transform
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    /// Continue with (possibly replaced) request details; a response skips target execution
    Forwarded {
        request: RequestDetails,
        response: Option<ResponseDetails>,
    },
    /// Terminal page, returned as-is
    Rendered(RenderedPage),
}

/// Result of a response transform
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    /// Terminal page, returned as-is
    Rendered(RenderedPage),
    /// Transform output that still goes through Finalize
    PreRendered(PreRendered),
    /// Keep the target response
    PassThrough,
}

/// Per-request state threaded through the middleware chain
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub request: InboundRequest,
    pub attributes: BTreeMap<String, String>,
    pub received_at: Instant,
}

impl RequestContext {
    pub fn new(request_id: impl Into<String>, request: InboundRequest) -> Self {
        Self {
            request_id: request_id.into(),
            request,
            attributes: BTreeMap::new(),
            received_at: Instant::now(),
        }
    }
}
