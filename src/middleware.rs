//! Ordered before/after/error hooks around gateway dispatch
//!
//! `before_request` hooks run in insertion order, each seeing the previous
//! one's context. `after_request` hooks run in reverse, so the last-added
//! middleware is the innermost wrapper and sees the raw result first.

use crate::details::{RenderedPage, RequestContext};
use crate::error::GatewayError;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Hooks around gateway dispatch; every hook is optional
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str {
        "middleware"
    }

    fn before_request(&self, context: RequestContext) -> RequestContext {
        context
    }

    fn after_request(&self, result: RenderedPage, _context: &RequestContext) -> RenderedPage {
        result
    }

    /// Observe a dispatch error. A returned error is logged and otherwise ignored.
    fn on_error(&self, _error: &GatewayError, _context: &RequestContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Ordered list of middleware
#[derive(Default, Clone)]
pub struct MiddlewareChain {
    middleware: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, middleware: Arc<dyn Middleware>) {
        self.middleware.push(middleware);
    }

    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }

    /// Fold left-to-right over `before_request`
    pub fn execute_before_request(&self, context: RequestContext) -> RequestContext {
        self.middleware
            .iter()
            .fold(context, |context, mw| mw.before_request(context))
    }

    /// Fold right-to-left over `after_request`
    pub fn execute_after_request(&self, result: RenderedPage, context: &RequestContext) -> RenderedPage {
        self.middleware
            .iter()
            .rev()
            .fold(result, |result, mw| mw.after_request(result, context))
    }

    /// Notify every middleware in insertion order
    pub fn execute_on_error(&self, error: &GatewayError, context: &RequestContext) {
        for mw in &self.middleware {
            if let Err(e) = mw.on_error(error, context) {
                warn!(middleware = mw.name(), error = %e, "Middleware error hook failed");
            }
        }
    }
}

/// Access log for gateway requests
#[derive(Debug, Default)]
pub struct LoggingMiddleware;

impl LoggingMiddleware {
    pub fn new() -> Self {
        Self
    }
}

impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "access-log"
    }

    fn before_request(&self, context: RequestContext) -> RequestContext {
        info!(
            request_id = %context.request_id,
            method = %context.request.method,
            path = %context.request.path,
            "Gateway request"
        );
        context
    }

    fn after_request(&self, result: RenderedPage, context: &RequestContext) -> RenderedPage {
        let latency_ms = context.received_at.elapsed().as_millis() as u64;
        if result.status >= 500 {
            warn!(
                request_id = %context.request_id,
                path = %context.request.path,
                status = result.status,
                latency_ms,
                "Gateway error response"
            );
        } else {
            info!(
                request_id = %context.request_id,
                path = %context.request.path,
                status = result.status,
                latency_ms,
                "Gateway response"
            );
        }
        result
    }

    fn on_error(&self, error: &GatewayError, context: &RequestContext) -> anyhow::Result<()> {
        error!(
            request_id = %context.request_id,
            path = %context.request.path,
            error = %error,
            "Gateway dispatch failed"
        );
        Ok(())
    }
}
