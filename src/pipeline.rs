//! Gateway dispatch and test mode
//!
//! Both modes run the same stages: validate the gateway, build the request
//! record, apply the request transform, resolve and execute the target,
//! build the response record, apply the response transform and finalize.
//! Test mode substitutes a caller-supplied path for the configured target
//! and rewrites `/gateway/<name>` links in HTML so they stay in test mode.
//!
//! Every failure ends in a rendered page; nothing here returns an error.

use crate::config::{GatewayConfig, Gateways};
use crate::details::{
    forwardable_response_headers, header_value, is_html_content_type, ArchiveInfo, DebugContext,
    FinalizedResponse, Headers, InboundRequest, Payload, PreRendered, RawResponse, RenderedPage,
    RequestDetails, RequestOutcome, ResponseDetails, ResponseOutcome, Target,
};
use crate::diagnostics::{
    extract_exception_summary, extract_stack_trace, format_fault_detail, safe_preview,
    summarize_fault, Fault,
};
use crate::executor::TargetExecutor;
use crate::render::{CidsListing, ErrorDiagnostics, ErrorPage, PageRenderer};
use crate::transform::{
    RequestTransformInput, ResponseTransformInput, TemplateResolver, TemplateStore,
    TransformContext, TransformLoader,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Gateway name whose archive listings are rendered by the pipeline
pub const CIDS_GATEWAY: &str = "cids";

/// Source label of responses produced in test mode
pub const TEST_SOURCE: &str = "test_server";
/// Source label of responses produced by ordinary dispatch
pub const GATEWAY_SOURCE: &str = "gateway";

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Rewrite `/gateway/<gateway>` to `/gateway/test/<test_path>/as/<gateway>`.
///
/// Text is rewritten in place. Bytes are decoded lossily and returned as text
/// only when something matched; otherwise they come back untouched.
pub fn rewrite_gateway_links(body: Payload, gateway: &str, test_path: &str) -> Payload {
    let from = format!("/gateway/{}", gateway);
    let to = format!("/gateway/test/{}/as/{}", test_path.trim_matches('/'), gateway);
    match body {
        Payload::Text(text) => Payload::Text(text.replace(&from, &to)),
        Payload::Bytes(bytes) => {
            let text = String::from_utf8_lossy(&bytes);
            if text.contains(&from) {
                Payload::Text(text.replace(&from, &to))
            } else {
                Payload::Bytes(bytes)
            }
        }
    }
}

/// Archive id of a `cids/<id>[/...]` test path
fn cids_reference(test_path: &str) -> Option<&str> {
    let mut parts = test_path.trim_start_matches('/').split('/');
    match (parts.next(), parts.next()) {
        (Some(CIDS_GATEWAY), Some(id)) if !id.is_empty() => Some(id),
        _ => None,
    }
}

/// State of one request as it moves through the stages
struct Dispatch<'a> {
    server: &'a str,
    rest: &'a str,
    /// `Some` in test mode
    test_path: Option<&'a str>,
    config: &'a GatewayConfig,
    context: TransformContext,
    archive: Option<ArchiveInfo>,
    debug: DebugContext,
}

impl Dispatch<'_> {
    fn source(&self) -> &'static str {
        if self.test_path.is_some() {
            TEST_SOURCE
        } else {
            GATEWAY_SOURCE
        }
    }
}

/// Runs gateway requests against injected collaborators
pub struct GatewayPipeline {
    gateways: Arc<Gateways>,
    transforms: Arc<dyn TransformLoader>,
    templates: Arc<dyn TemplateStore>,
    executor: Arc<dyn TargetExecutor>,
    renderer: Arc<dyn PageRenderer>,
}

impl GatewayPipeline {
    pub fn new(
        gateways: Arc<Gateways>,
        transforms: Arc<dyn TransformLoader>,
        templates: Arc<dyn TemplateStore>,
        executor: Arc<dyn TargetExecutor>,
        renderer: Arc<dyn PageRenderer>,
    ) -> Self {
        Self {
            gateways,
            transforms,
            templates,
            executor,
            renderer,
        }
    }

    /// `/gateway/test/<test_path>/as/<server>/<rest>`
    pub fn handle_test(
        &self,
        inbound: &InboundRequest,
        test_path: &str,
        server: &str,
        rest: &str,
    ) -> RenderedPage {
        self.run(inbound, server, rest, Some(test_path))
    }

    /// `/gateway/<server>/<rest>`
    pub fn handle_gateway(&self, inbound: &InboundRequest, server: &str, rest: &str) -> RenderedPage {
        self.run(inbound, server, rest, None)
    }

    fn run(
        &self,
        inbound: &InboundRequest,
        server: &str,
        rest: &str,
        test_path: Option<&str>,
    ) -> RenderedPage {
        // ValidateGateway
        let Some(config) = self.gateways.get(server) else {
            warn!(gateway = %server, "Unknown gateway");
            return self
                .renderer
                .render_error(&ErrorPage::gateway_not_found(server, &self.gateways));
        };

        // CidsListing
        if let Some(test_path) = test_path {
            if server == CIDS_GATEWAY && rest.is_empty() && inbound.method.eq_ignore_ascii_case("GET") {
                if let Some(archive_id) = test_path.split('/').nth(1).filter(|id| !id.is_empty()) {
                    return self.cids_listing(inbound, server, test_path, archive_id);
                }
            }
        }

        // BuildRequest
        let request = RequestDetails::from_inbound(inbound, rest);
        let archive = ArchiveInfo::derive(server, test_path.unwrap_or(rest));
        let mut debug = DebugContext::new();
        debug.insert("gateway", server);
        debug.insert("rest_path", rest);
        if let Some(test_path) = test_path {
            debug.insert("test_path", test_path);
        }

        let mut dispatch = Dispatch {
            server,
            rest,
            test_path,
            config,
            context: TransformContext {
                gateway: server.to_string(),
                templates: TemplateResolver::new(config.templates.clone(), Arc::clone(&self.templates)),
            },
            archive,
            debug,
        };

        // ApplyRequestTransform
        let (mut request, response) = match self.apply_request_transform(&mut dispatch, request) {
            Ok(forwarded) => forwarded,
            Err(page) => return page,
        };

        let response = match response {
            Some(response) => response,
            None => {
                // ResolveTarget
                let (target, cids_archive) = self.resolve_target(&dispatch, &mut request);

                // ExecuteTarget
                let raw = match self.execute_target(&dispatch, &target, &request) {
                    Ok(raw) => raw,
                    Err(page) => return page,
                };

                // BuildResponse
                if cids_archive && dispatch.rest.is_empty() {
                    if let Some(archive_id) = dispatch.test_path.and_then(cids_reference) {
                        let listing = CidsListing::from_body(archive_id, server, &raw.text);
                        return self.renderer.render_cids_listing(&listing);
                    }
                }
                ResponseDetails::from_raw(raw, &target.path_for(&request), dispatch.source())
            }
        };

        // ApplyResponseTransform
        let finalized = match self.apply_response_transform(&dispatch, response) {
            Ok(finalized) => finalized,
            Err(page) => return page,
        };

        // Finalize
        self.finalize(&dispatch, finalized)
    }

    fn cids_listing(
        &self,
        inbound: &InboundRequest,
        server: &str,
        test_path: &str,
        archive_id: &str,
    ) -> RenderedPage {
        let mut request = RequestDetails {
            method: "GET".to_string(),
            headers: inbound.headers_without_cookie(),
            ..Default::default()
        };
        request.add_query_param("archive", archive_id);
        let target = Target::internal("/cids");

        debug!(gateway = %server, archive = %archive_id, "Listing CIDS archive");

        match self.executor.execute(&target, &request) {
            Ok(raw) if raw.status_code >= 500 => {
                self.target_error_page(&target, &request, Some(test_path), "", &raw)
            }
            Ok(raw) => {
                let listing = CidsListing::from_body(archive_id, server, &raw.text);
                self.renderer.render_cids_listing(&listing)
            }
            Err(fault) => {
                let mut debug = DebugContext::new();
                debug.insert("gateway", server);
                debug.insert("test_path", test_path);
                self.request_failed_page(&target, &request, &fault, &debug)
            }
        }
    }

    fn apply_request_transform(
        &self,
        dispatch: &mut Dispatch<'_>,
        request: RequestDetails,
    ) -> Result<(RequestDetails, Option<ResponseDetails>), RenderedPage> {
        let Some(cid) = dispatch.config.request_transform.as_deref() else {
            return Ok((request, None));
        };

        let input = RequestTransformInput {
            request,
            context: &dispatch.context,
            rest_path: dispatch.rest,
            gateway: dispatch.server,
            gateways: &self.gateways,
            debug: &mut dispatch.debug,
            archive: dispatch.archive.as_ref(),
        };

        match self.transforms.apply_request(cid, input) {
            Ok(RequestOutcome::Forwarded { request, response }) => Ok((request, response)),
            Ok(RequestOutcome::Rendered(page)) => Err(page),
            Err(fault) => {
                warn!(gateway = %dispatch.server, cid, error = %fault, "Request transform failed");
                dispatch.debug.insert("request_transform_cid", cid);
                Err(self.transform_error_page("Request Transform Error", &fault, &dispatch.debug))
            }
        }
    }

    /// The target and whether it is a CIDS archive lookup
    fn resolve_target(&self, dispatch: &Dispatch<'_>, request: &mut RequestDetails) -> (Target, bool) {
        let Some(test_path) = dispatch.test_path else {
            let target = match &dispatch.config.target {
                Some(url) => Target::external(url),
                None => Target::internal(dispatch.server),
            };
            return (target, false);
        };

        match cids_reference(test_path) {
            Some(archive_id) => {
                request.add_query_param("archive", archive_id);
                if !dispatch.rest.is_empty() {
                    request.add_query_param("path", dispatch.rest);
                }
                request.path.clear();
                (Target::internal("/cids"), true)
            }
            None => (Target::internal(test_path), false),
        }
    }

    fn execute_target(
        &self,
        dispatch: &Dispatch<'_>,
        target: &Target,
        request: &RequestDetails,
    ) -> Result<RawResponse, RenderedPage> {
        match self.executor.execute(target, request) {
            Ok(raw) if raw.status_code >= 500 => Err(self.target_error_page(
                target,
                request,
                dispatch.test_path,
                dispatch.rest,
                &raw,
            )),
            Ok(raw) => Ok(raw),
            Err(fault) => Err(self.request_failed_page(target, request, &fault, &dispatch.debug)),
        }
    }

    fn apply_response_transform(
        &self,
        dispatch: &Dispatch<'_>,
        response: ResponseDetails,
    ) -> Result<FinalizedResponse, RenderedPage> {
        let Some(cid) = dispatch.config.response_transform.as_deref() else {
            return Ok(FinalizedResponse::Raw(response));
        };

        let input = ResponseTransformInput {
            response: &response,
            context: &dispatch.context,
            gateway: dispatch.server,
            test_path: dispatch.test_path,
            gateways: &self.gateways,
            archive: dispatch.archive.as_ref(),
        };

        match self.transforms.apply_response(cid, input) {
            Ok(ResponseOutcome::Rendered(page)) => Err(page),
            Ok(ResponseOutcome::PreRendered(output)) => Ok(FinalizedResponse::PreRendered(output)),
            Ok(ResponseOutcome::PassThrough) => Ok(FinalizedResponse::Raw(response)),
            Err(fault) => {
                warn!(gateway = %dispatch.server, cid, error = %fault, "Response transform failed");
                let mut debug = dispatch.debug.clone();
                debug.insert("response_transform_cid", cid);
                debug.insert("response_status", response.status_code);
                Err(self.transform_error_page("Response Transform Error", &fault, &debug))
            }
        }
    }

    fn finalize(&self, dispatch: &Dispatch<'_>, finalized: FinalizedResponse) -> RenderedPage {
        let (status, headers, PreRendered { output, content_type }) = match finalized {
            FinalizedResponse::PreRendered(pre) => (200, Headers::new(), pre),
            FinalizedResponse::Raw(response) => {
                let content_type = response
                    .content_type()
                    .unwrap_or(DEFAULT_CONTENT_TYPE)
                    .to_string();
                (
                    response.status_code,
                    forwardable_response_headers(&response.headers),
                    PreRendered {
                        output: Payload::Bytes(response.content),
                        content_type,
                    },
                )
            }
        };

        // Encoded bodies are passed on untouched
        let encoded = header_value(&headers, "content-encoding").is_some();
        let output = match dispatch.test_path {
            Some(test_path) if is_html_content_type(&content_type) && !encoded => {
                rewrite_gateway_links(output, dispatch.server, test_path)
            }
            _ => output,
        };

        RenderedPage {
            status,
            content_type,
            headers,
            body: output.into_bytes(),
        }
    }

    fn transform_error_page(&self, title: &str, fault: &Fault, debug: &DebugContext) -> RenderedPage {
        let page = ErrorPage::new(500, title, summarize_fault(fault), &self.gateways).with_diagnostics(
            ErrorDiagnostics {
                exception_summary: Some(summarize_fault(fault)),
                detail: Some(format_fault_detail(fault, Some(debug))),
                debug: Some(debug.clone()),
                ..Default::default()
            },
        );
        self.renderer.render_error(&page)
    }

    fn request_failed_page(
        &self,
        target: &Target,
        request: &RequestDetails,
        fault: &Fault,
        debug: &DebugContext,
    ) -> RenderedPage {
        let uri = target.request_uri(request);
        error!(target = %uri, error = %fault, "Target request failed");
        let page = ErrorPage::new(
            502,
            "Request Failed",
            format!("Request to {} failed: {}", uri, summarize_fault(fault)),
            &self.gateways,
        )
        .with_diagnostics(ErrorDiagnostics {
            exception_summary: Some(summarize_fault(fault)),
            detail: Some(format_fault_detail(fault, Some(debug))),
            debug: Some(debug.clone()),
            ..Default::default()
        });
        self.renderer.render_error(&page)
    }

    fn target_error_page(
        &self,
        target: &Target,
        request: &RequestDetails,
        test_path: Option<&str>,
        original_rest: &str,
        raw: &RawResponse,
    ) -> RenderedPage {
        let uri = target.request_uri(request);
        error!(target = %uri, status = raw.status_code, "Target returned a server error");

        let mut preview = serde_json::to_value(safe_preview(request)).unwrap_or_else(|_| json!({}));
        if let Some(fields) = preview.as_object_mut() {
            fields.insert("originalRestPath".to_string(), json!(original_rest));
        }
        let payload = json!({
            "target": target,
            "testPath": test_path,
            "request": preview,
        });

        let page = ErrorPage::new(
            502,
            "Gateway Error",
            format!("Target {} returned status {}", uri, raw.status_code),
            &self.gateways,
        )
        .with_diagnostics(ErrorDiagnostics {
            exception_summary: extract_exception_summary(&raw.text),
            stack_trace_html: extract_stack_trace(&raw.text),
            payload_json: serde_json::to_string_pretty(&payload).ok(),
            ..Default::default()
        });
        self.renderer.render_error(&page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_text_and_bytes_alike() {
        let html = "<a href=\"/gateway/foo/page\">x</a>";
        let expected = "<a href=\"/gateway/test/bar/as/foo/page\">x</a>";

        let text = rewrite_gateway_links(Payload::Text(html.to_string()), "foo", "bar");
        let bytes = rewrite_gateway_links(Payload::Bytes(html.as_bytes().to_vec()), "foo", "bar");
        assert_eq!(text.into_text(), expected);
        assert_eq!(bytes.into_text(), expected);
    }

    #[test]
    fn test_rewrite_leaves_non_matching_content() {
        let bytes = vec![0xff, 0xfe, b'x'];
        assert_eq!(
            rewrite_gateway_links(Payload::Bytes(bytes.clone()), "foo", "bar"),
            Payload::Bytes(bytes)
        );
        assert_eq!(
            rewrite_gateway_links(Payload::Text("/gateway/other".to_string()), "foo", "bar"),
            Payload::Text("/gateway/other".to_string())
        );
    }

    #[test]
    fn test_cids_reference() {
        assert_eq!(cids_reference("cids/bafyABC"), Some("bafyABC"));
        assert_eq!(cids_reference("/cids/bafyABC/dir"), Some("bafyABC"));
        assert_eq!(cids_reference("cids"), None);
        assert_eq!(cids_reference("cids/"), None);
        assert_eq!(cids_reference("hrx/abc"), None);
    }
}
