//! Engine-side view of one intercepted HTTP transaction.
//!
//! A [`Flow`] is built and owned by the interception engine (see
//! [`crate::handlers::FlowHandler`]). The rest of the crate reads it, and the
//! only mutations come from the hooks and from verdicts that the engine
//! applies inside its own task.

use crate::codec::{FlowModifications, RequestModifications, ResponseModifications};
use hudsucker::hyper::StatusCode;
use tracing::warn;
use url::Url;

/// Current wall-clock time as fractional seconds since the epoch.
pub fn now_timestamp() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Ordered header list. Lookups are case-insensitive, duplicates are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Replace every value of `name` with a single `value`.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.0.push((name.to_string(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Full replacement: drop everything, then set each given pair.
    pub fn replace_all<'a>(&mut self, pairs: impl IntoIterator<Item = (&'a String, &'a String)>) {
        self.clear();
        for (k, v) in pairs {
            self.set(k, v.clone());
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Set a textual body and keep the framing headers consistent with it.
fn set_text_body(headers: &mut Headers, content: &mut Vec<u8>, text: &str) {
    *content = text.as_bytes().to_vec();
    headers.remove("content-encoding");
    if !headers.contains("transfer-encoding") {
        headers.set("content-length", content.len().to_string());
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlowRequest {
    pub method: String,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    /// Path including the query string
    pub path: String,
    pub http_version: String,
    pub headers: Headers,
    pub content: Vec<u8>,
    pub timestamp_start: f64,
    pub timestamp_end: Option<f64>,
}

impl FlowRequest {
    /// Build a request from an absolute URL.
    pub fn from_url(method: &str, url: &str) -> Option<Self> {
        let parsed = Url::parse(url).ok()?;
        let mut request = Self {
            method: method.to_string(),
            scheme: String::new(),
            host: String::new(),
            port: 0,
            path: String::new(),
            http_version: "HTTP/1.1".to_string(),
            headers: Headers::new(),
            content: Vec::new(),
            timestamp_start: now_timestamp(),
            timestamp_end: None,
        };
        request.apply_url(&parsed);
        Some(request)
    }

    /// Fully-qualified URL, port omitted when it is the scheme default.
    pub fn pretty_url(&self) -> String {
        format!("{}://{}{}", self.scheme, self.authority(), self.path)
    }

    /// `host[:port]`, port omitted when it is the scheme default.
    pub fn authority(&self) -> String {
        let default_port = match self.scheme.as_str() {
            "http" | "ws" => Some(80),
            "https" | "wss" => Some(443),
            _ => None,
        };
        if default_port == Some(self.port) {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Point the request at a new URL. Returns false (and leaves the
    /// request untouched) when `url` is not an absolute URL with a host.
    pub fn set_url(&mut self, url: &str) -> bool {
        match Url::parse(url) {
            Ok(parsed) if parsed.host_str().is_some() => {
                self.apply_url(&parsed);
                true
            }
            Ok(_) => {
                warn!("Ignoring URL without host: {}", url);
                false
            }
            Err(e) => {
                warn!("Ignoring invalid URL {}: {}", url, e);
                false
            }
        }
    }

    fn apply_url(&mut self, url: &Url) {
        self.scheme = url.scheme().to_string();
        self.host = url.host_str().unwrap_or_default().to_string();
        self.port = url.port_or_known_default().unwrap_or(0);
        self.path = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };
        if self.headers.contains("host") {
            let authority = self.authority();
            self.headers.set("Host", authority);
        }
    }

    pub fn set_text(&mut self, text: &str) {
        set_text_body(&mut self.headers, &mut self.content, text);
    }

    pub fn apply(&mut self, edits: &RequestModifications) {
        if let Some(method) = &edits.method {
            self.method = method.clone();
        }
        if let Some(url) = &edits.url {
            self.set_url(url);
        }
        if let Some(headers) = &edits.headers {
            self.headers.replace_all(headers);
        }
        if let Some(body) = &edits.body {
            self.set_text(body);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlowResponse {
    pub status_code: u16,
    pub reason: String,
    pub http_version: String,
    pub headers: Headers,
    pub content: Vec<u8>,
    pub timestamp_start: f64,
    pub timestamp_end: Option<f64>,
}

impl FlowResponse {
    /// A response produced locally rather than received from upstream.
    pub fn synthetic(status_code: u16, headers: Headers, content: Vec<u8>, http_version: &str) -> Self {
        let now = now_timestamp();
        Self {
            status_code,
            reason: canonical_reason(status_code),
            http_version: http_version.to_string(),
            headers,
            content,
            timestamp_start: now,
            timestamp_end: Some(now),
        }
    }

    pub fn set_text(&mut self, text: &str) {
        set_text_body(&mut self.headers, &mut self.content, text);
    }

    pub fn apply(&mut self, edits: &ResponseModifications) {
        if let Some(status_code) = edits.status_code {
            self.status_code = status_code;
            self.reason = canonical_reason(status_code);
        }
        if let Some(headers) = &edits.headers {
            self.headers.replace_all(headers);
        }
        if let Some(body) = &edits.body {
            self.set_text(body);
        }
    }
}

pub fn canonical_reason(status_code: u16) -> String {
    StatusCode::from_u16(status_code)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or_default()
        .to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Flow {
    /// Unique and stable for the flow's lifetime
    pub id: String,
    pub request: FlowRequest,
    /// Present once the engine has received the upstream response
    pub response: Option<FlowResponse>,
    pub error: Option<String>,
    /// True while the flow sits in the interception registry
    pub intercepted: bool,
}

impl Flow {
    pub fn new(id: impl Into<String>, request: FlowRequest) -> Self {
        Self {
            id: id.into(),
            request,
            response: None,
            error: None,
            intercepted: false,
        }
    }

    pub fn pretty_url(&self) -> String {
        self.request.pretty_url()
    }

    /// Apply client edits and clear the intercepted flag. Response edits are
    /// ignored when the flow has no response yet.
    pub fn resume(&mut self, edits: Option<&FlowModifications>) {
        if let Some(edits) = edits {
            if let Some(request) = &edits.request {
                self.request.apply(request);
            }
            if let (Some(response), Some(resp_edits)) = (self.response.as_mut(), &edits.response) {
                response.apply(resp_edits);
            }
        }
        self.intercepted = false;
    }
}
