//! Transform and template collaborators
//!
//! Transforms are located by CID and invoked through [`TransformLoader`]; how
//! their code is sandboxed or executed is up to the implementation. The crate
//! ships an in-process [`TransformRegistry`] that binds CIDs to Rust closures
//! and a [`CidTemplateStore`] that reads templates through the CID resolver.

use crate::cid::CidResolver;
use crate::config::Gateways;
use crate::details::{ArchiveInfo, DebugContext, RequestDetails, RequestOutcome, ResponseDetails, ResponseOutcome};
use crate::diagnostics::Fault;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Function name a request transform source must define
pub const REQUEST_TRANSFORM_FN: &str = "transform_request";
/// Function name a response transform source must define
pub const RESPONSE_TRANSFORM_FN: &str = "transform_response";

static TEMPLATE_VARIABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{-?\s*([A-Za-z_][A-Za-z0-9_]*)").expect("valid template variable regex")
});

/// Result of loading and validating a transform
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransformValidation {
    pub source: Option<String>,
    pub error: Option<String>,
    pub warnings: Vec<String>,
}

/// Result of loading and validating a template
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateValidation {
    pub source: Option<String>,
    pub error: Option<String>,
    pub variables: Vec<String>,
}

/// Template storage
pub trait TemplateStore: Send + Sync {
    fn load(&self, cid: &str) -> Option<String>;

    fn load_and_validate(&self, cid: &str) -> TemplateValidation;
}

/// Resolves template names through one gateway's template map
#[derive(Clone)]
pub struct TemplateResolver {
    templates: BTreeMap<String, String>,
    store: Arc<dyn TemplateStore>,
}

impl TemplateResolver {
    pub fn new(templates: BTreeMap<String, String>, store: Arc<dyn TemplateStore>) -> Self {
        Self { templates, store }
    }

    /// Template content for `name`
    pub fn resolve_template(&self, name: &str) -> Result<String, Fault> {
        let cid = self.templates.get(name).ok_or_else(|| {
            Fault::new("TemplateNotFound", format!("No template mapping for '{}'", name))
        })?;
        self.store.load(cid).ok_or_else(|| {
            Fault::new(
                "TemplateNotFound",
                format!("Template '{}' ({}) could not be loaded", name, cid),
            )
        })
    }
}

/// Context handed to every transform
#[derive(Clone)]
pub struct TransformContext {
    pub gateway: String,
    pub templates: TemplateResolver,
}

impl TransformContext {
    pub fn resolve_template(&self, name: &str) -> Result<String, Fault> {
        self.templates.resolve_template(name)
    }
}

/// Arguments of a request transform
pub struct RequestTransformInput<'a> {
    pub request: RequestDetails,
    pub context: &'a TransformContext,
    pub rest_path: &'a str,
    pub gateway: &'a str,
    pub gateways: &'a Gateways,
    pub debug: &'a mut DebugContext,
    pub archive: Option<&'a ArchiveInfo>,
}

/// Arguments of a response transform
pub struct ResponseTransformInput<'a> {
    pub response: &'a ResponseDetails,
    pub context: &'a TransformContext,
    pub gateway: &'a str,
    /// Set in test mode only
    pub test_path: Option<&'a str>,
    pub gateways: &'a Gateways,
    pub archive: Option<&'a ArchiveInfo>,
}

/// Locates, validates and invokes content-addressed transforms
pub trait TransformLoader: Send + Sync {
    fn load_and_validate(&self, cid: &str, expected_fn: &str) -> TransformValidation;

    fn apply_request(&self, cid: &str, input: RequestTransformInput<'_>) -> Result<RequestOutcome, Fault>;

    fn apply_response(&self, cid: &str, input: ResponseTransformInput<'_>) -> Result<ResponseOutcome, Fault>;
}

type RequestTransformFn = dyn Fn(RequestTransformInput<'_>) -> Result<RequestOutcome, Fault> + Send + Sync;
type ResponseTransformFn = dyn Fn(ResponseTransformInput<'_>) -> Result<ResponseOutcome, Fault> + Send + Sync;

/// In-process transforms keyed by CID; sources are read through the resolver
pub struct TransformRegistry {
    resolver: CidResolver,
    request: RwLock<HashMap<String, Arc<RequestTransformFn>>>,
    response: RwLock<HashMap<String, Arc<ResponseTransformFn>>>,
}

impl TransformRegistry {
    pub fn new(resolver: CidResolver) -> Self {
        Self {
            resolver,
            request: RwLock::new(HashMap::new()),
            response: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_request<F>(&self, cid: &str, transform: F)
    where
        F: Fn(RequestTransformInput<'_>) -> Result<RequestOutcome, Fault> + Send + Sync + 'static,
    {
        self.request.write().insert(normalize(cid), Arc::new(transform));
    }

    pub fn register_response<F>(&self, cid: &str, transform: F)
    where
        F: Fn(ResponseTransformInput<'_>) -> Result<ResponseOutcome, Fault> + Send + Sync + 'static,
    {
        self.response.write().insert(normalize(cid), Arc::new(transform));
    }

    fn is_registered(&self, cid: &str, expected_fn: &str) -> bool {
        let cid = normalize(cid);
        match expected_fn {
            REQUEST_TRANSFORM_FN => self.request.read().contains_key(&cid),
            RESPONSE_TRANSFORM_FN => self.response.read().contains_key(&cid),
            _ => false,
        }
    }
}

fn normalize(cid: &str) -> String {
    crate::cid::normalize_cid(cid)
}

impl TransformLoader for TransformRegistry {
    fn load_and_validate(&self, cid: &str, expected_fn: &str) -> TransformValidation {
        let Some(source) = self.resolver.resolve_text(cid) else {
            return TransformValidation {
                error: Some(format!("Transform source not found for CID {}", normalize(cid))),
                ..Default::default()
            };
        };

        let mut validation = TransformValidation {
            source: Some(source.clone()),
            ..Default::default()
        };

        if source.trim().is_empty() {
            validation.warnings.push("Transform source is empty".to_string());
        } else if !source.contains(expected_fn) {
            validation.error = Some(format!("Transform source does not define '{}'", expected_fn));
            return validation;
        }

        if !self.is_registered(cid, expected_fn) {
            validation.error = Some(format!(
                "No '{}' implementation is registered for CID {}",
                expected_fn,
                normalize(cid)
            ));
        }
        validation
    }

    fn apply_request(&self, cid: &str, input: RequestTransformInput<'_>) -> Result<RequestOutcome, Fault> {
        let transform = self.request.read().get(&normalize(cid)).cloned().ok_or_else(|| {
            Fault::new(
                "TransformNotFound",
                format!("No request transform registered for CID {}", normalize(cid)),
            )
        })?;
        transform(input)
    }

    fn apply_response(&self, cid: &str, input: ResponseTransformInput<'_>) -> Result<ResponseOutcome, Fault> {
        let transform = self.response.read().get(&normalize(cid)).cloned().ok_or_else(|| {
            Fault::new(
                "TransformNotFound",
                format!("No response transform registered for CID {}", normalize(cid)),
            )
        })?;
        transform(input)
    }
}

/// Templates read through the CID resolver
#[derive(Clone)]
pub struct CidTemplateStore {
    resolver: CidResolver,
}

impl CidTemplateStore {
    pub fn new(resolver: CidResolver) -> Self {
        Self { resolver }
    }
}

impl TemplateStore for CidTemplateStore {
    fn load(&self, cid: &str) -> Option<String> {
        self.resolver.resolve_text(cid)
    }

    fn load_and_validate(&self, cid: &str) -> TemplateValidation {
        let Some(source) = self.load(cid) else {
            return TemplateValidation {
                error: Some(format!("Template not found for CID {}", normalize(cid))),
                ..Default::default()
            };
        };

        let error = check_delimiters(&source).err();
        let variables = if error.is_none() {
            template_variables(&source)
        } else {
            Vec::new()
        };
        TemplateValidation {
            source: Some(source),
            error,
            variables,
        }
    }
}

fn check_delimiters(source: &str) -> Result<(), String> {
    for (open, close) in [("{{", "}}"), ("{%", "%}")] {
        let opened = source.matches(open).count();
        let closed = source.matches(close).count();
        if opened != closed {
            return Err(format!(
                "Unbalanced template delimiters: {} '{}' vs {} '{}'",
                opened, open, closed, close
            ));
        }
    }
    Ok(())
}

/// Variable names used in `{{ name }}` expressions, sorted and unique
pub fn template_variables(source: &str) -> Vec<String> {
    TEMPLATE_VARIABLE
        .captures_iter(source)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cid::MemoryStore;

    fn resolver_with(store: &Arc<MemoryStore>) -> CidResolver {
        CidResolver::new(Arc::clone(store) as Arc<dyn crate::cid::ContentStore>, "/nonexistent")
    }

    #[test]
    fn test_template_variables() {
        let vars = template_variables("<h1>{{ title }}</h1>{{body|safe}}{{ title }}{{- user.name }}");
        assert_eq!(vars, vec!["body", "title", "user"]);
    }

    #[test]
    fn test_template_store_validation() {
        let store = Arc::new(MemoryStore::new());
        let good = store.put("Hello {{ name }}");
        let bad = store.put("Hello {{ name }");
        let templates = CidTemplateStore::new(resolver_with(&store));

        let ok = templates.load_and_validate(&good);
        assert!(ok.error.is_none());
        assert_eq!(ok.variables, vec!["name"]);

        let broken = templates.load_and_validate(&bad);
        assert!(broken.error.unwrap().contains("Unbalanced"));

        let missing = templates.load_and_validate("nope");
        assert!(missing.source.is_none());
        assert!(missing.error.unwrap().contains("not found"));
    }

    #[test]
    fn test_template_resolver() {
        let store = Arc::new(MemoryStore::new());
        let cid = store.put("<p>{{ x }}</p>");
        let mut map = BTreeMap::new();
        map.insert("page".to_string(), cid);
        let resolver = TemplateResolver::new(map, Arc::new(CidTemplateStore::new(resolver_with(&store))));

        assert_eq!(resolver.resolve_template("page").unwrap(), "<p>{{ x }}</p>");
        let fault = resolver.resolve_template("other").unwrap_err();
        assert_eq!(fault.kind, "TemplateNotFound");
    }

    #[test]
    fn test_registry_validation() {
        let store = Arc::new(MemoryStore::new());
        let registered = store.put("def transform_request(request, context): ...");
        let unregistered = store.put("def transform_request(request, context): pass");
        let wrong_fn = store.put("def something_else(): pass");
        let empty = store.put("");

        let registry = TransformRegistry::new(resolver_with(&store));
        registry.register_request(&registered, |input| {
            Ok(RequestOutcome::Forwarded {
                request: input.request,
                response: None,
            })
        });
        registry.register_request(&empty, |input| {
            Ok(RequestOutcome::Forwarded {
                request: input.request,
                response: None,
            })
        });

        let ok = registry.load_and_validate(&registered, REQUEST_TRANSFORM_FN);
        assert!(ok.error.is_none());
        assert!(ok.warnings.is_empty());

        let missing_impl = registry.load_and_validate(&unregistered, REQUEST_TRANSFORM_FN);
        assert!(missing_impl.error.unwrap().contains("No 'transform_request' implementation"));

        let wrong = registry.load_and_validate(&wrong_fn, REQUEST_TRANSFORM_FN);
        assert!(wrong.error.unwrap().contains("does not define"));

        let warned = registry.load_and_validate(&empty, REQUEST_TRANSFORM_FN);
        assert!(warned.error.is_none());
        assert_eq!(warned.warnings, vec!["Transform source is empty"]);

        let not_found = registry.load_and_validate("missing", RESPONSE_TRANSFORM_FN);
        assert!(not_found.source.is_none());
        assert!(not_found.error.is_some());
    }
}
