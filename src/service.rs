//! Entry point for everything under `/gateway`
//!
//! Strips the namespace prefix, runs the middleware chain around router
//! dispatch, and hands the matched endpoint to the pipeline or meta handler.

use crate::config::Gateways;
use crate::details::{InboundRequest, RenderedPage, RequestContext};
use crate::error::GatewayError;
use crate::executor::TargetExecutor;
use crate::meta::MetaHandler;
use crate::middleware::{Middleware, MiddlewareChain};
use crate::pipeline::GatewayPipeline;
use crate::render::PageRenderer;
use crate::routing::{build_standard_router, Params, Router, StandardHandlers};
use crate::transform::{TemplateStore, TransformLoader};
use std::sync::Arc;
use uuid::Uuid;

/// Namespace served by the gateway
pub const GATEWAY_PREFIX: &str = "/gateway";

/// Path below `/gateway`, or `None` if the path is outside the namespace
pub fn gateway_subpath(path: &str) -> Option<&str> {
    let rest = path.strip_prefix(GATEWAY_PREFIX)?;
    if rest.is_empty() || rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}

/// Endpoints of the standard route table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Instruction,
    RequestForm,
    ResponseForm,
    MetaTest,
    Meta,
    TestWithRest,
    Test,
    GatewayWithRest,
    Gateway,
}

impl Endpoint {
    pub fn standard_handlers() -> StandardHandlers<Endpoint> {
        StandardHandlers {
            instruction: Endpoint::Instruction,
            request_form: Endpoint::RequestForm,
            response_form: Endpoint::ResponseForm,
            meta_test: Endpoint::MetaTest,
            meta: Endpoint::Meta,
            test_with_rest: Endpoint::TestWithRest,
            test: Endpoint::Test,
            gateway_with_rest: Endpoint::GatewayWithRest,
            gateway: Endpoint::Gateway,
        }
    }
}

fn param<'a>(params: &'a Params, name: &str) -> &'a str {
    params.get(name).map(String::as_str).unwrap_or_default()
}

/// The gateway subsystem as seen by the host
pub struct GatewayService {
    router: Router<Endpoint>,
    middleware: MiddlewareChain,
    pipeline: GatewayPipeline,
    meta: MetaHandler,
    renderer: Arc<dyn PageRenderer>,
    gateways: Arc<Gateways>,
}

impl GatewayService {
    pub fn new(
        gateways: Gateways,
        transforms: Arc<dyn TransformLoader>,
        templates: Arc<dyn TemplateStore>,
        executor: Arc<dyn TargetExecutor>,
        renderer: Arc<dyn PageRenderer>,
    ) -> Self {
        let gateways = Arc::new(gateways);
        let pipeline = GatewayPipeline::new(
            Arc::clone(&gateways),
            Arc::clone(&transforms),
            Arc::clone(&templates),
            executor,
            Arc::clone(&renderer),
        );
        let meta = MetaHandler::new(Arc::clone(&gateways), transforms, templates, Arc::clone(&renderer));

        Self {
            router: build_standard_router(Endpoint::standard_handlers()),
            middleware: MiddlewareChain::new(),
            pipeline,
            meta,
            renderer,
            gateways,
        }
    }

    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.add(middleware);
        self
    }

    /// Handle a request under a fresh request id
    pub fn handle(&self, request: InboundRequest) -> Result<RenderedPage, GatewayError> {
        self.handle_with_id(&Uuid::new_v4().to_string(), request)
    }

    /// Handle a request. Only routing faults are returned as errors.
    pub fn handle_with_id(&self, request_id: &str, request: InboundRequest) -> Result<RenderedPage, GatewayError> {
        let context = self
            .middleware
            .execute_before_request(RequestContext::new(request_id, request));

        let path = gateway_subpath(&context.request.path).unwrap_or(&context.request.path);
        let (endpoint, params) = match self.router.resolve(path, &Params::new()) {
            Ok((endpoint, params)) => (*endpoint, params),
            Err(e) => {
                self.middleware.execute_on_error(&e, &context);
                return Err(e);
            }
        };

        let page = self.dispatch(endpoint, &params, &context);
        Ok(self.middleware.execute_after_request(page, &context))
    }

    fn dispatch(&self, endpoint: Endpoint, params: &Params, context: &RequestContext) -> RenderedPage {
        let request = &context.request;
        let server = param(params, "server");
        let test_path = param(params, "testPath");
        let rest = param(params, "rest");

        match endpoint {
            Endpoint::Instruction => self.renderer.render_instruction(&self.gateways.sorted_names()),
            Endpoint::RequestForm => self.renderer.render_request_form(&self.gateways.sorted_names()),
            Endpoint::ResponseForm => self.renderer.render_response_form(&self.gateways.sorted_names()),
            Endpoint::MetaTest => self.meta.handle(server, Some(test_path)),
            Endpoint::Meta => self.meta.handle(server, None),
            Endpoint::TestWithRest | Endpoint::Test => {
                self.pipeline.handle_test(request, test_path, server, rest)
            }
            Endpoint::GatewayWithRest | Endpoint::Gateway => {
                self.pipeline.handle_gateway(request, server, rest)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_subpath() {
        assert_eq!(gateway_subpath("/gateway"), Some(""));
        assert_eq!(gateway_subpath("/gateway/"), Some("/"));
        assert_eq!(gateway_subpath("/gateway/demo/x"), Some("/demo/x"));
        assert_eq!(gateway_subpath("/gatewayz"), None);
        assert_eq!(gateway_subpath("/other"), None);
    }

    #[test]
    fn test_standard_handlers_route_to_endpoints() {
        let router = build_standard_router(Endpoint::standard_handlers());
        let (endpoint, params) = router.resolve("test/cids/abc/as/cids", &Params::new()).unwrap();
        assert_eq!(*endpoint, Endpoint::TestWithRest);
        assert_eq!(param(&params, "testPath"), "cids/abc");
        assert_eq!(param(&params, "server"), "cids");
        assert_eq!(param(&params, "rest"), "");

        let (endpoint, params) = router.resolve("demo", &Params::new()).unwrap();
        assert_eq!(*endpoint, Endpoint::GatewayWithRest);
        assert_eq!(param(&params, "rest"), "");

        let (endpoint, _) = router.resolve("response", &Params::new()).unwrap();
        assert_eq!(*endpoint, Endpoint::ResponseForm);
    }
}
