//! Failure summaries, error-page scraping and safe request previews

use crate::details::{DebugContext, RequestDetails};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

static EXCEPTION_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<strong>\s*Exception:\s*</strong>\s*([^<]*)").expect("valid exception regex")
});

static TRACEBACK_LIST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<ol\b[^>]*\bclass\s*=\s*["'][^"']*\btraceback\b[^"']*["'][^>]*>.*?</ol>"#)
        .expect("valid traceback regex")
});

/// A transform or target failure, carried as a value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    /// Failure class, e.g. `ValueError` or `ConnectionRefused`
    pub kind: String,
    pub message: String,
    /// Full trace text, innermost frame last
    pub trace: String,
}

impl Fault {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            trace: String::new(),
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = trace.into();
        self
    }

    /// Capture a Rust error: the kind is the error's type name, the trace its source chain
    pub fn from_error<E: std::error::Error>(error: &E) -> Self {
        let type_name = std::any::type_name::<E>();
        let kind = type_name
            .split('<')
            .next()
            .and_then(|path| path.rsplit("::").next())
            .unwrap_or(type_name);

        let mut trace = vec![format!("{}: {}", kind, error)];
        let mut source = error.source();
        while let Some(cause) = source {
            trace.push(format!("caused by: {}", cause));
            source = cause.source();
        }
        Self::new(kind, error.to_string()).with_trace(trace.join("\n"))
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&summarize_fault(self))
    }
}

impl std::error::Error for Fault {}

/// `"Kind: message"`, or just `"Kind"` when the message is empty
pub fn summarize_fault(fault: &Fault) -> String {
    if fault.message.is_empty() {
        fault.kind.clone()
    } else {
        format!("{}: {}", fault.kind, fault.message)
    }
}

/// Last non-blank line of a trace, if it looks like `Kind: message`
pub fn summary_from_traceback(text: Option<&str>) -> Option<String> {
    let text = text?;
    let last = text.lines().rev().map(str::trim).find(|line| !line.is_empty())?;
    if last.contains(':') {
        Some(last.to_string())
    } else {
        None
    }
}

/// Text following the bold `Exception:` label of a rendered internal-error page
pub fn extract_exception_summary(html: &str) -> Option<String> {
    let captures = EXCEPTION_LABEL.captures(html)?;
    let summary = unescape_html(captures.get(1)?.as_str().trim());
    if summary.is_empty() {
        None
    } else {
        Some(summary)
    }
}

/// The `<ol class="traceback">` list of an error page, wrapped with its summary
pub fn extract_stack_trace(html: &str) -> Option<String> {
    let list = TRACEBACK_LIST.find(html)?.as_str();
    let mut fragment = String::from("<div class=\"target-stack\">\n");
    if let Some(summary) = extract_exception_summary(html) {
        fragment.push_str(&format!(
            "<p><strong>Exception:</strong> {}</p>\n",
            escape_html(&summary)
        ));
    }
    fragment.push_str("<h3>Stack trace</h3>\n");
    fragment.push_str(list);
    fragment.push_str("\n</div>");
    Some(fragment)
}

/// Copy of the request with `Authorization` and `Cookie` headers removed
pub fn safe_preview(request: &RequestDetails) -> RequestDetails {
    let mut preview = request.clone();
    preview.headers.retain(|name, _| {
        let lower = name.to_ascii_lowercase();
        lower != "authorization" && lower != "cookie"
    });
    preview
}

/// Summary line, full trace and (when present) the debug context
pub fn format_fault_detail(fault: &Fault, debug: Option<&DebugContext>) -> String {
    let mut detail = summarize_fault(fault);
    detail.push_str("\n\nTraceback:\n");
    if fault.trace.is_empty() {
        detail.push_str(&summarize_fault(fault));
    } else {
        detail.push_str(&fault.trace);
    }
    if let Some(debug) = debug.filter(|d| !d.is_empty()) {
        detail.push_str("\n\nDebug Context:\n");
        detail.push_str(&debug.to_pretty());
    }
    detail
}

pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

fn unescape_html(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&amp;", "&")
}
