//! Path router for the `/gateway` namespace
//!
//! Patterns are `/`-separated tokens: a literal segment, `{name}` (one
//! segment) or `{name:path}` (any number of segments, possibly zero). Routes
//! are tried strictly in insertion order and the first match wins, so the
//! order of the standard table decides which names are reachable.

use crate::error::GatewayError;
use std::collections::HashMap;

/// Captured path variables, also used for handler arguments
pub type Params = HashMap<String, String>;

/// One token of a compiled route pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathToken {
    Literal(String),
    Var(String),
    GreedyVar(String),
}

/// A compiled route pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    tokens: Vec<PathToken>,
}

impl Pattern {
    /// Compile a pattern string; `""` has no tokens and matches only the empty path
    pub fn compile(pattern: &str) -> Self {
        let tokens = if pattern.is_empty() {
            Vec::new()
        } else {
            pattern.split('/').map(parse_token).collect()
        };
        Self { tokens }
    }

    pub fn tokens(&self) -> &[PathToken] {
        &self.tokens
    }

    fn is_greedy(&self) -> bool {
        self.tokens.iter().any(|t| matches!(t, PathToken::GreedyVar(_)))
    }

    /// Match a path (without leading/trailing `/`) and return its captures
    pub fn matches(&self, path: &str) -> Option<Params> {
        let segments: Vec<&str> = if path.is_empty() {
            Vec::new()
        } else {
            path.split('/').collect()
        };

        if self.is_greedy() {
            match_greedy(&self.tokens, &segments)
        } else {
            match_exact(&self.tokens, &segments)
        }
    }
}

fn parse_token(segment: &str) -> PathToken {
    let inner = segment
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
        .filter(|inner| !inner.is_empty());

    match inner {
        Some(inner) => match inner.split_once(':') {
            Some((name, "path")) => PathToken::GreedyVar(name.to_string()),
            Some(_) => PathToken::Literal(segment.to_string()),
            None => PathToken::Var(inner.to_string()),
        },
        None => PathToken::Literal(segment.to_string()),
    }
}

fn match_exact(tokens: &[PathToken], segments: &[&str]) -> Option<Params> {
    if tokens.len() != segments.len() {
        return None;
    }

    let mut captures = Params::new();
    for (token, segment) in tokens.iter().zip(segments) {
        match token {
            PathToken::Literal(literal) if literal == segment => {}
            PathToken::Literal(_) => return None,
            PathToken::Var(name) | PathToken::GreedyVar(name) => {
                captures.insert(name.clone(), segment.to_string());
            }
        }
    }
    Some(captures)
}

/// Token walk with a cursor. A greedy variable captures everything up to the
/// first segment equal to the next literal token after it, or the whole
/// remainder when no literal follows.
fn match_greedy(tokens: &[PathToken], segments: &[&str]) -> Option<Params> {
    let mut captures = Params::new();
    let mut cursor = 0;

    for (index, token) in tokens.iter().enumerate() {
        match token {
            PathToken::Literal(literal) => {
                if segments.get(cursor) != Some(&literal.as_str()) {
                    return None;
                }
                cursor += 1;
            }
            PathToken::Var(name) => {
                let segment = segments.get(cursor)?;
                captures.insert(name.clone(), segment.to_string());
                cursor += 1;
            }
            PathToken::GreedyVar(name) => {
                let anchor = tokens[index + 1..].iter().find_map(|t| match t {
                    PathToken::Literal(literal) => Some(literal.as_str()),
                    _ => None,
                });

                let Some(anchor) = anchor else {
                    captures.insert(name.clone(), segments[cursor.min(segments.len())..].join("/"));
                    return Some(captures);
                };

                let offset = segments.get(cursor..)?.iter().position(|s| *s == anchor)?;
                captures.insert(name.clone(), segments[cursor..cursor + offset].join("/"));
                cursor += offset;
            }
        }
    }

    if cursor == segments.len() {
        Some(captures)
    } else {
        None
    }
}

/// A pattern bound to a handler
#[derive(Debug, Clone)]
pub struct Route<H> {
    pattern: Pattern,
    handler: H,
}

impl<H> Route<H> {
    pub fn new(pattern: &str, handler: H) -> Self {
        Self {
            pattern: Pattern::compile(pattern),
            handler,
        }
    }
}

/// Ordered route table; first match wins
#[derive(Debug, Clone)]
pub struct Router<H> {
    routes: Vec<Route<H>>,
}

impl<H> Default for Router<H> {
    fn default() -> Self {
        Self { routes: Vec::new() }
    }
}

impl<H> Router<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_route(&mut self, pattern: &str, handler: H) {
        self.routes.push(Route::new(pattern, handler));
    }

    /// Find the first matching route; captures override `extra` on key collision
    pub fn resolve(&self, path: &str, extra: &Params) -> Result<(&H, Params), GatewayError> {
        let path = path.trim_matches('/');
        for route in &self.routes {
            if let Some(captures) = route.pattern.matches(path) {
                let mut args = extra.clone();
                args.extend(captures);
                return Ok((&route.handler, args));
            }
        }
        Err(GatewayError::NoRouteMatched(path.to_string()))
    }

    /// Resolve and invoke the matching handler
    pub fn route<R>(&self, path: &str, extra: &Params) -> Result<R, GatewayError>
    where
        H: Fn(Params) -> R,
    {
        let (handler, args) = self.resolve(path, extra)?;
        Ok(handler(args))
    }
}

/// Handlers for the canonical gateway route table
#[derive(Debug, Clone)]
pub struct StandardHandlers<H> {
    pub instruction: H,
    pub request_form: H,
    pub response_form: H,
    pub meta_test: H,
    pub meta: H,
    pub test_with_rest: H,
    pub test: H,
    pub gateway_with_rest: H,
    pub gateway: H,
}

/// Build the canonical table. Order matters: gateways named `meta`,
/// `request`, `response` or `test` are shadowed at top level.
pub fn build_standard_router<H>(handlers: StandardHandlers<H>) -> Router<H> {
    let mut router = Router::new();
    router.add_route("", handlers.instruction);
    router.add_route("request", handlers.request_form);
    router.add_route("response", handlers.response_form);
    router.add_route("meta/test/{testPath:path}/as/{server}", handlers.meta_test);
    router.add_route("meta/{server}", handlers.meta);
    router.add_route("test/{testPath:path}/as/{server}/{rest:path}", handlers.test_with_rest);
    router.add_route("test/{testPath:path}/as/{server}", handlers.test);
    router.add_route("{server}/{rest:path}", handlers.gateway_with_rest);
    router.add_route("{server}", handlers.gateway);
    router
}
