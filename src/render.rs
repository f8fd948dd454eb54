//! HTML pages served under `/gateway`
//!
//! Every failure path renders through [`PageRenderer::render_error`]; the
//! remaining pages are the instruction page, the transform forms, CIDS
//! directory listings and the meta page.

use crate::config::Gateways;
use crate::details::{DebugContext, RenderedPage};
use crate::diagnostics::escape_html;
use crate::meta::{MetaPage, TemplateInfo, TransformInfo};
use crate::transform::{REQUEST_TRANSFORM_FN, RESPONSE_TRANSFORM_FN};

/// An error page and everything known about the failure
#[derive(Debug, Clone, Default)]
pub struct ErrorPage {
    pub status: u16,
    pub title: String,
    pub message: String,
    /// Configured gateway names, sorted
    pub gateways: Vec<String>,
    pub diagnostics: ErrorDiagnostics,
}

impl ErrorPage {
    pub fn new(status: u16, title: &str, message: impl Into<String>, gateways: &Gateways) -> Self {
        Self {
            status,
            title: title.to_string(),
            message: message.into(),
            gateways: gateways.sorted_names(),
            diagnostics: ErrorDiagnostics::default(),
        }
    }

    /// Page for an unknown gateway; the message lists the configured gateways sorted
    pub fn gateway_not_found(name: &str, gateways: &Gateways) -> Self {
        let names = gateways.sorted_names();
        let message = if names.is_empty() {
            format!("Gateway '{}' is not configured. No gateways are configured.", name)
        } else {
            format!(
                "Gateway '{}' is not configured. Available gateways: {}",
                name,
                names.join(", ")
            )
        };
        Self::new(404, "Gateway Not Found", message, gateways)
    }

    pub fn with_diagnostics(mut self, diagnostics: ErrorDiagnostics) -> Self {
        self.diagnostics = diagnostics;
        self
    }
}

/// Optional diagnostics attached to an error page
#[derive(Debug, Clone, Default)]
pub struct ErrorDiagnostics {
    pub exception_summary: Option<String>,
    /// Pre-rendered HTML fragment, included verbatim
    pub stack_trace_html: Option<String>,
    /// Plain-text detail (summary, trace, debug context)
    pub detail: Option<String>,
    pub debug: Option<DebugContext>,
    /// JSON payload that reproduces the failing request
    pub payload_json: Option<String>,
}

/// A CIDS archive directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidsListing {
    pub archive_id: String,
    pub server: String,
    pub entries: Vec<String>,
}

impl CidsListing {
    /// Non-blank lines of an archive index body
    pub fn from_body(archive_id: &str, server: &str, body: &str) -> Self {
        Self {
            archive_id: archive_id.to_string(),
            server: server.to_string(),
            entries: body
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(String::from)
                .collect(),
        }
    }

    pub fn entry_href(&self, entry: &str) -> String {
        format!(
            "/gateway/test/cids/{}/as/{}/{}",
            self.archive_id,
            self.server,
            entry.trim_start_matches('/')
        )
    }
}

/// Renders gateway pages
pub trait PageRenderer: Send + Sync {
    fn render_error(&self, page: &ErrorPage) -> RenderedPage;

    fn render_cids_listing(&self, listing: &CidsListing) -> RenderedPage;

    fn render_meta(&self, page: &MetaPage) -> RenderedPage;

    fn render_instruction(&self, gateways: &[String]) -> RenderedPage;

    fn render_request_form(&self, gateways: &[String]) -> RenderedPage;

    fn render_response_form(&self, gateways: &[String]) -> RenderedPage;
}

/// Built-in HTML renderer
#[derive(Debug, Default, Clone)]
pub struct HtmlRenderer;

impl HtmlRenderer {
    pub fn new() -> Self {
        Self
    }
}

fn layout(title: &str, gateways: &[String], body: &str) -> String {
    let nav: Vec<String> = gateways
        .iter()
        .map(|name| {
            format!(
                "<a href=\"/gateway/meta/{}\">{}</a>",
                escape_html(name),
                escape_html(name)
            )
        })
        .collect();

    format!(
        r##"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>{title}</title>
    <style>{css}</style>
</head>
<body>
    <nav class="gateways"><a href="/gateway">Gateway</a> {nav}</nav>
    <main>
        <h1>{title}</h1>
{body}
    </main>
</body>
</html>
"##,
        title = escape_html(title),
        css = PAGE_CSS,
        nav = nav.join(" "),
        body = body,
    )
}

fn pre(text: &str) -> String {
    format!("<pre>{}</pre>", escape_html(text))
}

impl PageRenderer for HtmlRenderer {
    fn render_error(&self, page: &ErrorPage) -> RenderedPage {
        let diag = &page.diagnostics;
        let mut body = format!("<p class=\"error\">{}</p>\n", escape_html(&page.message));

        if let Some(summary) = &diag.exception_summary {
            body.push_str(&format!(
                "<p><strong>Exception:</strong> {}</p>\n",
                escape_html(summary)
            ));
        }
        if let Some(stack) = &diag.stack_trace_html {
            body.push_str(stack);
            body.push('\n');
        }
        if let Some(detail) = &diag.detail {
            body.push_str("<h2>Details</h2>\n");
            body.push_str(&pre(detail));
            body.push('\n');
        }
        if let Some(debug) = diag.debug.as_ref().filter(|d| !d.is_empty()) {
            body.push_str("<h2>Debug Context</h2>\n");
            body.push_str(&pre(&debug.to_pretty()));
            body.push('\n');
        }
        if let Some(payload) = &diag.payload_json {
            body.push_str("<h2>Request</h2>\n");
            body.push_str(&pre(payload));
            body.push('\n');
        }

        RenderedPage::html(page.status, layout(&page.title, &page.gateways, &body))
    }

    fn render_cids_listing(&self, listing: &CidsListing) -> RenderedPage {
        let items: Vec<String> = listing
            .entries
            .iter()
            .map(|entry| {
                format!(
                    "<li><a href=\"{}\">{}</a></li>",
                    escape_html(&listing.entry_href(entry)),
                    escape_html(entry)
                )
            })
            .collect();

        let body = format!(
            "<p>Archive <code>{}</code></p>\n<ul class=\"listing\">\n{}\n</ul>",
            escape_html(&listing.archive_id),
            items.join("\n")
        );
        let title = format!("Index of {}", listing.archive_id);
        RenderedPage::html(200, layout(&title, &[], &body))
    }

    fn render_meta(&self, page: &MetaPage) -> RenderedPage {
        let mut body = String::new();
        if page.test_mode {
            body.push_str(&format!(
                "<p class=\"test-mode\">Test mode: requests are served from <code>{}</code></p>\n",
                escape_html(page.test_path.as_deref().unwrap_or(""))
            ));
        }

        body.push_str("<h2>Transforms</h2>\n");
        for info in &page.transforms {
            body.push_str(&transform_section(info));
        }

        body.push_str("<h2>Templates</h2>\n");
        if page.templates.is_empty() {
            body.push_str("<p>No templates referenced.</p>\n");
        }
        for info in &page.templates {
            body.push_str(&template_section(info));
        }

        if !page.test_paths.is_empty() {
            body.push_str("<h2>Test paths</h2>\n<p class=\"test-paths\">\n");
            for path in &page.test_paths {
                let href = format!("/gateway/test/{}/as/{}", path.trim_matches('/'), page.gateway);
                body.push_str(&format!(
                    "<a href=\"{}\">{}</a><br>\n",
                    escape_html(&href),
                    escape_html(path)
                ));
            }
            body.push_str("</p>\n");
        }

        let title = format!("Gateway {}", page.gateway);
        RenderedPage::html(200, layout(&title, &page.gateways, &body))
    }

    fn render_instruction(&self, gateways: &[String]) -> RenderedPage {
        let mut body = String::from(INSTRUCTION_HTML);
        if gateways.is_empty() {
            body.push_str("<p>No gateways are configured.</p>\n");
        } else {
            body.push_str("<h2>Configured gateways</h2>\n<p>\n");
            for name in gateways {
                body.push_str(&format!(
                    "<a href=\"/gateway/{0}\">{0}</a> (<a href=\"/gateway/meta/{0}\">meta</a>)<br>\n",
                    escape_html(name)
                ));
            }
            body.push_str("</p>\n");
        }
        RenderedPage::html(200, layout("Gateway", gateways, &body))
    }

    fn render_request_form(&self, gateways: &[String]) -> RenderedPage {
        let body = format!(
            "<p>A request transform defines <code>{}</code>. It receives the request details, \
             the transform context, the rest path, the gateway name, all gateways, the debug \
             context and the archive info, and returns either a page or new request details \
             with an optional response.</p>\n",
            REQUEST_TRANSFORM_FN
        );
        RenderedPage::html(200, layout("Request transforms", gateways, &body))
    }

    fn render_response_form(&self, gateways: &[String]) -> RenderedPage {
        let body = format!(
            "<p>A response transform defines <code>{}</code>. It receives the response details, \
             the transform context, the gateway name, the test path, all gateways and the \
             archive info, and returns a page, pre-rendered output, or nothing to pass the \
             target response through.</p>\n",
            RESPONSE_TRANSFORM_FN
        );
        RenderedPage::html(200, layout("Response transforms", gateways, &body))
    }
}

fn issues(errors: &[String], warnings: &[String]) -> String {
    let mut html = String::new();
    for error in errors {
        html.push_str(&format!("<p class=\"error\">{}</p>\n", escape_html(error)));
    }
    for warning in warnings {
        html.push_str(&format!("<p class=\"warning\">{}</p>\n", escape_html(warning)));
    }
    html
}

fn transform_section(info: &TransformInfo) -> String {
    let mut html = format!(
        "<section class=\"transform\">\n<h3>{} <span class=\"status\">{}</span></h3>\n",
        escape_html(info.slot.label()),
        escape_html(info.status.label())
    );
    if let Some(link) = &info.cid_link {
        html.push_str(&format!("<p>CID: {}</p>\n", link));
    }
    html.push_str(&issues(&info.errors, &info.warnings));
    if let Some(source) = &info.source {
        html.push_str(&pre(source));
        html.push('\n');
    }
    html.push_str("</section>\n");
    html
}

fn template_section(info: &TemplateInfo) -> String {
    let mut html = format!(
        "<section class=\"template\">\n<h3>{} <span class=\"status\">{}</span></h3>\n",
        escape_html(&info.name),
        escape_html(info.status.label())
    );
    if let Some(link) = &info.cid_link {
        html.push_str(&format!("<p>CID: {}</p>\n", link));
    }
    html.push_str(&issues(&info.errors, &[]));
    if !info.variables.is_empty() {
        let vars: Vec<String> = info
            .variables
            .iter()
            .map(|v| format!("<code>{}</code>", escape_html(v)))
            .collect();
        html.push_str(&format!("<p>Variables: {}</p>\n", vars.join(", ")));
    }
    if let Some(source) = &info.source {
        html.push_str(&pre(source));
        html.push('\n');
    }
    html.push_str("</section>\n");
    html
}

const INSTRUCTION_HTML: &str = r##"<p>Requests to <code>/gateway/&lt;name&gt;/&lt;path&gt;</code> are forwarded to the
named gateway's target, passing through its request and response transforms.</p>
<p><code>/gateway/test/&lt;test-path&gt;/as/&lt;name&gt;/&lt;path&gt;</code> runs the same
transforms against an arbitrary server path instead of the configured target.</p>
<p><code>/gateway/meta/&lt;name&gt;</code> shows whether a gateway's transforms and templates
are valid. See <a href="/gateway/request">request</a> and
<a href="/gateway/response">response</a> transforms.</p>
"##;

const PAGE_CSS: &str = r#"
body { font-family: -apple-system, BlinkMacSystemFont, sans-serif; margin: 0; color: #1f2328; }
nav.gateways { background: #24292f; padding: 0.6rem 1rem; }
nav.gateways a { color: #f6f8fa; margin-right: 0.8rem; text-decoration: none; }
main { max-width: 960px; margin: 1.5rem auto; padding: 0 1rem; }
pre { background: #f6f8fa; padding: 0.8rem; overflow-x: auto; }
.error { color: #cf222e; }
.warning { color: #9a6700; }
.status { font-size: 0.8em; color: #57606a; }
ol.traceback { font-family: monospace; font-size: 0.9em; }
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_page_includes_diagnostics() {
        let mut debug = DebugContext::new();
        debug.insert("gateway", "demo");
        let page = ErrorPage {
            status: 502,
            title: "Gateway Error".to_string(),
            message: "Target returned 500 <oops>".to_string(),
            gateways: vec!["cids".to_string(), "demo".to_string()],
            diagnostics: ErrorDiagnostics {
                exception_summary: Some("ValueError: boom".to_string()),
                stack_trace_html: Some("<ol class=\"traceback\"><li>x</li></ol>".to_string()),
                debug: Some(debug),
                payload_json: Some("{\"target\": \"/x\"}".to_string()),
                ..Default::default()
            },
        };

        let rendered = HtmlRenderer::new().render_error(&page);
        let html = rendered.text();
        assert_eq!(rendered.status, 502);
        assert!(html.contains("<title>Gateway Error</title>"));
        assert!(html.contains("Target returned 500 &lt;oops&gt;"));
        assert!(html.contains("ValueError: boom"));
        assert!(html.contains("<ol class=\"traceback\"><li>x</li></ol>"));
        assert!(html.contains("&quot;gateway&quot;: &quot;demo&quot;"));
        assert!(html.contains("href=\"/gateway/meta/cids\""));
    }

    #[test]
    fn test_gateway_not_found_message() {
        use crate::config::GatewayConfig;
        let gateways: Gateways = [("demo", GatewayConfig::default()), ("cids", GatewayConfig::default())]
            .into_iter()
            .collect();
        let page = ErrorPage::gateway_not_found("ghost", &gateways);
        assert_eq!(page.status, 404);
        assert!(page.message.ends_with("Available gateways: cids, demo"));
        assert_eq!(page.gateways, vec!["cids", "demo"]);

        let empty = ErrorPage::gateway_not_found("ghost", &Gateways::new());
        assert!(empty.message.contains("No gateways are configured"));
    }

    #[test]
    fn test_cids_listing() {
        let listing = CidsListing::from_body("bafyABC", "cids", "a.txt\n\n  \nb.txt\n");
        assert_eq!(listing.entries, vec!["a.txt", "b.txt"]);

        let html = HtmlRenderer::new().render_cids_listing(&listing).text();
        assert_eq!(html.matches("<li>").count(), 2);
        assert!(html.contains("href=\"/gateway/test/cids/bafyABC/as/cids/a.txt\""));
        assert!(html.contains("href=\"/gateway/test/cids/bafyABC/as/cids/b.txt\""));
    }

    #[test]
    fn test_instruction_lists_gateways() {
        let html = HtmlRenderer::new()
            .render_instruction(&["demo".to_string()])
            .text();
        assert!(html.contains("href=\"/gateway/demo\""));
        assert!(html.contains("href=\"/gateway/meta/demo\""));
    }

    #[test]
    fn test_forms_name_transform_functions() {
        let renderer = HtmlRenderer::new();
        assert!(renderer.render_request_form(&[]).text().contains("transform_request"));
        assert!(renderer.render_response_form(&[]).text().contains("transform_response"));
    }
}
