//! Gateway introspection pages
//!
//! The meta page reports, for one gateway, whether each transform slot and
//! every referenced template loads and validates.

use crate::cid::{normalize_cid, render_cid_link};
use crate::config::{GatewayConfig, Gateways};
use crate::details::RenderedPage;
use crate::render::{ErrorPage, PageRenderer};
use crate::transform::{TemplateStore, TransformLoader, REQUEST_TRANSFORM_FN, RESPONSE_TRANSFORM_FN};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

static TEMPLATE_REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"resolve_template\(\s*["']([^"']+)["']\s*\)"#).expect("valid template reference regex")
});

/// Validation result shown next to a transform or template
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationStatus {
    Valid,
    ValidWithWarnings,
    Error,
    /// Referenced template with no CID in the gateway's template map
    MissingMapping,
    /// Transform slot left empty in the configuration
    NotConfigured,
}

impl ValidationStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ValidationStatus::Valid => "valid",
            ValidationStatus::ValidWithWarnings => "valid with warnings",
            ValidationStatus::Error => "error",
            ValidationStatus::MissingMapping => "Missing Mapping",
            ValidationStatus::NotConfigured => "not configured",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ValidationStatus::Error | ValidationStatus::MissingMapping)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformSlot {
    Request,
    Response,
}

impl TransformSlot {
    pub fn label(&self) -> &'static str {
        match self {
            TransformSlot::Request => "Request transform",
            TransformSlot::Response => "Response transform",
        }
    }

    /// Function the slot's source must define
    pub fn expected_fn(&self) -> &'static str {
        match self {
            TransformSlot::Request => REQUEST_TRANSFORM_FN,
            TransformSlot::Response => RESPONSE_TRANSFORM_FN,
        }
    }

    fn cid<'a>(&self, config: &'a GatewayConfig) -> Option<&'a str> {
        match self {
            TransformSlot::Request => config.request_transform.as_deref(),
            TransformSlot::Response => config.response_transform.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformInfo {
    pub slot: TransformSlot,
    pub cid: Option<String>,
    pub cid_link: Option<String>,
    pub source: Option<String>,
    pub status: ValidationStatus,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateInfo {
    pub name: String,
    pub cid: Option<String>,
    pub cid_link: Option<String>,
    pub source: Option<String>,
    pub status: ValidationStatus,
    pub errors: Vec<String>,
    pub variables: Vec<String>,
}

/// Everything the meta page shows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaPage {
    pub gateway: String,
    /// Configured gateway names, sorted
    pub gateways: Vec<String>,
    pub test_mode: bool,
    pub test_path: Option<String>,
    pub transforms: Vec<TransformInfo>,
    pub templates: Vec<TemplateInfo>,
    /// Normalized CID -> rendered link
    pub cid_links: BTreeMap<String, String>,
    pub test_paths: Vec<String>,
}

/// Template names passed to `resolve_template("...")` in transform source
pub fn referenced_templates(source: &str) -> BTreeSet<String> {
    TEMPLATE_REFERENCE
        .captures_iter(source)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Serves `/gateway/meta/...`
pub struct MetaHandler {
    gateways: Arc<Gateways>,
    transforms: Arc<dyn TransformLoader>,
    templates: Arc<dyn TemplateStore>,
    renderer: Arc<dyn PageRenderer>,
}

impl MetaHandler {
    pub fn new(
        gateways: Arc<Gateways>,
        transforms: Arc<dyn TransformLoader>,
        templates: Arc<dyn TemplateStore>,
        renderer: Arc<dyn PageRenderer>,
    ) -> Self {
        Self {
            gateways,
            transforms,
            templates,
            renderer,
        }
    }

    /// Render the meta page; `test_path` selects meta test mode
    pub fn handle(&self, server: &str, test_path: Option<&str>) -> RenderedPage {
        match self.build_page(server, test_path) {
            Some(page) => self.renderer.render_meta(&page),
            None => self
                .renderer
                .render_error(&ErrorPage::gateway_not_found(server, &self.gateways)),
        }
    }

    /// Collect the meta page for a gateway, `None` if it is not configured
    pub fn build_page(&self, server: &str, test_path: Option<&str>) -> Option<MetaPage> {
        let config = self.gateways.get(server)?;
        let mut cid_links = BTreeMap::new();

        let transforms: Vec<TransformInfo> = [TransformSlot::Request, TransformSlot::Response]
            .into_iter()
            .map(|slot| self.transform_info(slot, config, &mut cid_links))
            .collect();

        let mut names: BTreeSet<String> = config.templates.keys().cloned().collect();
        for source in transforms.iter().filter_map(|t| t.source.as_deref()) {
            names.extend(referenced_templates(source));
        }

        let templates = names
            .into_iter()
            .map(|name| self.template_info(name, config, &mut cid_links))
            .collect();

        let mut test_paths = config.test_paths.clone();
        if let Some(path) = test_path {
            if !test_paths.iter().any(|p| p == path) {
                test_paths.insert(0, path.to_string());
            }
        }

        debug!(gateway = %server, test_mode = test_path.is_some(), "Built meta page");

        Some(MetaPage {
            gateway: server.to_string(),
            gateways: self.gateways.sorted_names(),
            test_mode: test_path.is_some(),
            test_path: test_path.map(String::from),
            transforms,
            templates,
            cid_links,
            test_paths,
        })
    }

    fn transform_info(
        &self,
        slot: TransformSlot,
        config: &GatewayConfig,
        cid_links: &mut BTreeMap<String, String>,
    ) -> TransformInfo {
        let Some(cid) = slot.cid(config) else {
            return TransformInfo {
                slot,
                cid: None,
                cid_link: None,
                source: None,
                status: ValidationStatus::NotConfigured,
                errors: Vec::new(),
                warnings: Vec::new(),
            };
        };

        let link = link_for(cid, cid_links);
        let validation = self.transforms.load_and_validate(cid, slot.expected_fn());
        let status = match (&validation.error, validation.warnings.is_empty()) {
            (Some(_), _) => ValidationStatus::Error,
            (None, false) => ValidationStatus::ValidWithWarnings,
            (None, true) => ValidationStatus::Valid,
        };

        TransformInfo {
            slot,
            cid: Some(normalize_cid(cid)),
            cid_link: Some(link),
            source: validation.source,
            status,
            errors: validation.error.into_iter().collect(),
            warnings: validation.warnings,
        }
    }

    fn template_info(
        &self,
        name: String,
        config: &GatewayConfig,
        cid_links: &mut BTreeMap<String, String>,
    ) -> TemplateInfo {
        let Some(cid) = config.templates.get(&name) else {
            let error = format!("Template '{}' is referenced but has no CID mapping", name);
            return TemplateInfo {
                name,
                cid: None,
                cid_link: None,
                source: None,
                status: ValidationStatus::MissingMapping,
                errors: vec![error],
                variables: Vec::new(),
            };
        };

        let link = link_for(cid, cid_links);
        let validation = self.templates.load_and_validate(cid);
        let status = if validation.error.is_some() {
            ValidationStatus::Error
        } else {
            ValidationStatus::Valid
        };

        TemplateInfo {
            name,
            cid: Some(normalize_cid(cid)),
            cid_link: Some(link),
            source: validation.source,
            status,
            errors: validation.error.into_iter().collect(),
            variables: validation.variables,
        }
    }
}

fn link_for(cid: &str, cid_links: &mut BTreeMap<String, String>) -> String {
    cid_links
        .entry(normalize_cid(cid))
        .or_insert_with(|| render_cid_link(cid))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_referenced_templates() {
        let source = r#"
page = context.resolve_template("page")
other = context.resolve_template( 'sidebar' )
again = resolve_template("page")
dynamic = resolve_template(name)
"#;
        let names: Vec<String> = referenced_templates(source).into_iter().collect();
        assert_eq!(names, vec!["page", "sidebar"]);
    }

    #[test]
    fn test_status_labels() {
        assert_eq!(ValidationStatus::ValidWithWarnings.label(), "valid with warnings");
        assert_eq!(ValidationStatus::MissingMapping.label(), "Missing Mapping");
        assert!(ValidationStatus::MissingMapping.is_error());
        assert!(!ValidationStatus::NotConfigured.is_error());
    }

    #[test]
    fn test_slot_expected_functions() {
        assert_eq!(TransformSlot::Request.expected_fn(), "transform_request");
        assert_eq!(TransformSlot::Response.expected_fn(), "transform_response");
    }
}
