//! Wire format between the bridge and its clients.
//!
//! Outbound: flow event envelopes and command replies. Inbound: commands,
//! decoded into [`Command`] with the defaulting rules the clients rely on.

use crate::error::DecodeError;
use crate::flow::{now_timestamp, Flow, FlowRequest, FlowResponse, Headers};
use crate::rules::{deserialize_rules, Rule};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Bodies this large or larger are never put on the wire.
pub const MAX_INLINE_BODY: usize = 1_000_000;

/// Lifecycle point an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventPhase {
    Request,
    Response,
    Error,
}

#[derive(Serialize)]
struct FlowEvent<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    phase: EventPhase,
    id: &'a str,
    intercepted: bool,
    request: RequestView<'a>,
    response: Option<ResponseView<'a>>,
    timestamp: f64,
    error: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestView<'a> {
    method: &'a str,
    url: String,
    host: &'a str,
    port: u16,
    path: &'a str,
    http_version: &'a str,
    headers: Map<String, Value>,
    content_length: usize,
    timestamp_start: f64,
    timestamp_end: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<&'a str>,
    /// Existing clients read the raw-byte fallback from this key; the value is hex.
    #[serde(rename = "bodyBase64", skip_serializing_if = "Option::is_none")]
    body_hex: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResponseView<'a> {
    status_code: u16,
    reason: &'a str,
    http_version: &'a str,
    headers: Map<String, Value>,
    content_length: usize,
    timestamp_start: f64,
    timestamp_end: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<&'a str>,
}

/// One entry per header name, keyed by the first spelling seen; repeated
/// headers are joined with ", ".
fn header_map(headers: &Headers) -> Map<String, Value> {
    let mut map = Map::new();
    for (name, value) in headers.iter() {
        let existing = map
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, v)| v);
        if let Some(Value::String(joined)) = existing {
            joined.push_str(", ");
            joined.push_str(value);
            continue;
        }
        map.insert(name.to_string(), Value::String(value.to_string()));
    }
    map
}

/// Text body when it is small enough and decodes; `Err(())` when it is
/// small enough but not text; `Ok(None)` when it is empty or too large.
fn inline_text(content: &[u8]) -> Result<Option<&str>, ()> {
    if content.is_empty() || content.len() >= MAX_INLINE_BODY {
        return Ok(None);
    }
    std::str::from_utf8(content).map(Some).map_err(|_| ())
}

impl<'a> RequestView<'a> {
    fn new(req: &'a FlowRequest) -> Self {
        let (body, body_hex) = match inline_text(&req.content) {
            Ok(text) => (text, None),
            Err(()) => (None, Some(hex::encode(&req.content))),
        };
        Self {
            method: &req.method,
            url: req.pretty_url(),
            host: &req.host,
            port: req.port,
            path: &req.path,
            http_version: &req.http_version,
            headers: header_map(&req.headers),
            content_length: req.content.len(),
            timestamp_start: req.timestamp_start,
            timestamp_end: req.timestamp_end,
            body,
            body_hex,
        }
    }
}

impl<'a> ResponseView<'a> {
    fn new(res: &'a FlowResponse) -> Self {
        Self {
            status_code: res.status_code,
            reason: &res.reason,
            http_version: &res.http_version,
            headers: header_map(&res.headers),
            content_length: res.content.len(),
            timestamp_start: res.timestamp_start,
            timestamp_end: res.timestamp_end,
            body: inline_text(&res.content).unwrap_or(None),
        }
    }
}

/// Serialize a flow into the `{type: "flow", ...}` event envelope.
pub fn encode_flow_event(flow: &Flow, phase: EventPhase) -> serde_json::Result<String> {
    let event = FlowEvent {
        kind: "flow",
        phase,
        id: &flow.id,
        intercepted: flow.intercepted,
        request: RequestView::new(&flow.request),
        response: flow.response.as_ref().map(ResponseView::new),
        timestamp: now_timestamp(),
        error: flow.error.as_deref(),
    };
    serde_json::to_string(&event)
}

/// Replies sent to a single peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Reply {
    Pong,
}

impl Reply {
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Request edits carried by `resume`. Only present fields are applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RequestModifications {
    pub method: Option<String>,
    pub url: Option<String>,
    /// Full replacement of the header list
    pub headers: Option<BTreeMap<String, String>>,
    pub body: Option<String>,
}

/// Response edits carried by `resume`. Ignored when the flow has no response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ResponseModifications {
    #[serde(rename = "statusCode", alias = "status_code")]
    pub status_code: Option<u16>,
    pub headers: Option<BTreeMap<String, String>>,
    pub body: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FlowModifications {
    pub request: Option<RequestModifications>,
    pub response: Option<ResponseModifications>,
}

/// Inbound client commands.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum Command {
    Resume {
        #[serde(rename = "flowId", default)]
        flow_id: String,
        #[serde(default)]
        modified: Option<FlowModifications>,
    },
    Kill {
        #[serde(rename = "flowId", default)]
        flow_id: String,
    },
    UpdateRules {
        #[serde(default, deserialize_with = "deserialize_rules")]
        rules: Vec<Rule>,
    },
    Ping {},
}

const KNOWN_COMMANDS: &[&str] = &["resume", "kill", "updateRules", "ping"];

/// Decode one inbound text message.
///
/// Anything that is not a JSON object with a known `command` is reported as
/// [`DecodeError::Unknown`] (a missing or non-string `command` counts as
/// unknown); JSON that does not parse, or a known command with fields of the
/// wrong type, is [`DecodeError::Malformed`].
pub fn decode_command(raw: &str) -> Result<Command, DecodeError> {
    let value: Value = serde_json::from_str(raw)?;
    let name = match value.get("command") {
        Some(Value::String(name)) => name.clone(),
        Some(other) => return Err(DecodeError::Unknown(other.to_string())),
        None => return Err(DecodeError::Unknown("<none>".to_string())),
    };
    if !KNOWN_COMMANDS.contains(&name.as_str()) {
        return Err(DecodeError::Unknown(name));
    }
    Ok(serde_json::from_value(value)?)
}
