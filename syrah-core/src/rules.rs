//! Rule model and the store holding the active rule generation.
//!
//! Rules arrive from clients as a whole batch and replace the previous set
//! wholesale. Nothing is persisted.

use crate::matcher::UrlGlob;
use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// What a rule does once it matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RuleType {
    Breakpoint,
    MapLocal,
    MapRemote,
    Block,
    /// Any type this build does not know about. Never selected by a typed lookup.
    #[default]
    #[serde(other)]
    Unknown,
}

/// Lifecycle point a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Request,
    Response,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Request => "request",
            Phase::Response => "response",
        }
    }
}

fn enabled_by_default() -> bool {
    true
}

/// One user-defined rule as exchanged with clients.
///
/// Payload fields that do not belong to `rule_type` are carried along but
/// never looked at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub rule_type: RuleType,
    #[serde(default)]
    pub url_pattern: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub phase: Phase,
    /// Map-local: file served as the response body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    /// Map-remote: replacement request URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl Rule {
    pub fn new(id: &str, rule_type: RuleType, phase: Phase, url_pattern: &str) -> Self {
        Self {
            id: id.to_string(),
            rule_type,
            url_pattern: url_pattern.to_string(),
            enabled: true,
            phase,
            file_path: None,
            target_url: None,
            status_code: None,
            headers: None,
            body: None,
        }
    }

    /// Placeholder for a rule object that could not be decoded. It keeps its
    /// slot in the ordering but can never match.
    pub fn inert() -> Self {
        Self {
            enabled: false,
            ..Self::new("", RuleType::Unknown, Phase::Request, "")
        }
    }

    /// Decode one client-supplied rule object without ever rejecting it.
    pub fn from_value(value: Value) -> Self {
        match serde_json::from_value::<Rule>(value) {
            Ok(rule) => rule,
            Err(e) => {
                warn!("Undecodable rule replaced by a disabled placeholder: {}", e);
                Self::inert()
            }
        }
    }
}

/// `deserialize_with` helper for rule arrays: every element is decoded on
/// its own so one bad object cannot sink the batch.
pub fn deserialize_rules<'de, D>(deserializer: D) -> Result<Vec<Rule>, D::Error>
where
    D: Deserializer<'de>,
{
    let values = Vec::<Value>::deserialize(deserializer)?;
    Ok(values.into_iter().map(Rule::from_value).collect())
}

/// A rule together with its compiled URL pattern.
#[derive(Debug, Clone)]
pub struct ActiveRule {
    pub rule: Rule,
    pub glob: UrlGlob,
}

/// Immutable, ordered generation of rules. First match wins.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<ActiveRule>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Self {
        let rules = rules
            .into_iter()
            .map(|rule| ActiveRule {
                glob: UrlGlob::new(&rule.url_pattern),
                rule,
            })
            .collect();
        Self { rules }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActiveRule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Owner of the current [`RuleSet`].
///
/// Readers take an `Arc` snapshot so a flow is always matched against one
/// complete generation, even if `replace` runs concurrently.
#[derive(Debug, Default)]
pub struct RuleStore {
    current: RwLock<Arc<RuleSet>>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.current.read().clone()
    }

    /// Swap in a new generation, preserving the given order.
    pub fn replace(&self, rules: Vec<Rule>) {
        let next = Arc::new(RuleSet::new(rules));
        let count = next.len();
        *self.current.write() = next;
        info!("Updated rules: {} rules", count);
    }
}
