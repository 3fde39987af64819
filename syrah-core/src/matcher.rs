//! URL glob matching and first-match rule lookup.

use crate::flow::Flow;
use crate::rules::{Phase, Rule, RuleSet, RuleType};
use glob::{MatchOptions, Pattern};
use tracing::debug;

/// Shell-style glob over whole URLs.
///
/// `*` runs across `/`, `?` is one character, `[...]` / `[!...]` are
/// character classes. Matching is case-sensitive and anchored at both ends.
#[derive(Debug, Clone)]
pub struct UrlGlob {
    pattern: Pattern,
}

const URL_MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

impl UrlGlob {
    pub fn new(raw: &str) -> Self {
        // glob treats `**` as a path-component wildcard and rejects it inside
        // a component; for URLs any run of stars means the same as one.
        let normalized = escape_unclosed_classes(&collapse_stars(raw));
        let pattern = Pattern::new(&normalized).unwrap_or_else(|e| {
            debug!("Pattern {:?} is not a valid glob ({}), matching literally", raw, e);
            Pattern::new(&Pattern::escape(raw)).unwrap_or_default()
        });
        Self { pattern }
    }

    pub fn matches(&self, url: &str) -> bool {
        self.pattern.matches_with(url, URL_MATCH)
    }
}

fn collapse_stars(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut prev_star = false;
    for c in raw.chars() {
        if c == '*' && prev_star {
            continue;
        }
        prev_star = c == '*';
        out.push(c);
    }
    out
}

/// Rewrite every `[` that never closes as the class `[[]`, so only that
/// bracket turns literal and the remaining wildcards keep working. A class
/// may start with `!` and may contain `]` as its first member.
fn escape_unclosed_classes(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::with_capacity(pattern.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i] != '[' {
            out.push(chars[i]);
            i += 1;
            continue;
        }
        let mut j = i + 1;
        if chars.get(j) == Some(&'!') {
            j += 1;
        }
        if chars.get(j) == Some(&']') {
            j += 1;
        }
        while j < chars.len() && chars[j] != ']' {
            j += 1;
        }
        if j >= chars.len() {
            out.push_str("[[]");
            i += 1;
        } else {
            out.extend(&chars[i..=j]);
            i = j + 1;
        }
    }
    out
}

impl RuleSet {
    /// First enabled rule, in declaration order, whose phase (and type, when
    /// `rule_type` is given) qualifies and whose pattern matches the flow URL.
    pub fn find_match(&self, flow: &Flow, phase: Phase, rule_type: Option<RuleType>) -> Option<&Rule> {
        self.find_match_url(&flow.pretty_url(), phase, rule_type)
    }

    pub fn find_match_url(&self, url: &str, phase: Phase, rule_type: Option<RuleType>) -> Option<&Rule> {
        self.iter()
            .filter(|active| active.rule.enabled)
            .filter(|active| active.rule.phase == phase)
            .filter(|active| rule_type.map_or(true, |t| active.rule.rule_type == t))
            .find(|active| active.glob.matches(url))
            .map(|active| &active.rule)
    }
}
