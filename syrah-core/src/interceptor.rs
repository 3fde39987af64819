//! Lifecycle hooks called by the interception engine.
//!
//! Each hook runs the per-phase rule policy against one rule generation,
//! applies the immediate side effects to the flow, publishes the event and
//! tells the engine what to do next. Holding is the engine's job: it awaits
//! the returned [`PendingFlow`] inside its own task and applies the verdict
//! there.

use crate::broadcaster::EventBroadcaster;
use crate::codec::EventPhase;
use crate::error::MapLocalError;
use crate::flow::{Flow, FlowResponse, Headers};
use crate::registry::{InterceptionRegistry, PendingFlow};
use crate::rules::{Phase, Rule, RuleStore, RuleType};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const MAP_LOCAL_DEFAULT_STATUS: u16 = 200;
const MAP_LOCAL_DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// What the engine must do with the flow after a hook returns.
#[derive(Debug)]
pub enum HookOutcome {
    /// Keep processing normally
    Continue,
    /// Pause until a client resumes or kills the flow
    Hold(PendingFlow),
    /// Terminate the flow now
    Kill,
}

#[derive(Debug, Clone)]
pub struct Interceptor {
    rules: Arc<RuleStore>,
    registry: InterceptionRegistry,
    events: EventBroadcaster,
    map_local_timeout: Duration,
}

impl Interceptor {
    pub fn new(
        rules: Arc<RuleStore>,
        registry: InterceptionRegistry,
        events: EventBroadcaster,
        map_local_timeout: Duration,
    ) -> Self {
        Self {
            rules,
            registry,
            events,
            map_local_timeout,
        }
    }

    /// Request phase: breakpoint, then map-remote, then block.
    pub async fn on_request(&self, flow: &mut Flow) -> HookOutcome {
        let rules = self.rules.snapshot();

        if rules
            .find_match(flow, Phase::Request, Some(RuleType::Breakpoint))
            .is_some()
        {
            if let Some(pending) = self.hold(flow, Phase::Request) {
                info!("Breakpoint hit (request): {}", flow.pretty_url());
                self.events.publish(flow, EventPhase::Request);
                return HookOutcome::Hold(pending);
            }
        }

        if let Some(target) = rules
            .find_match(flow, Phase::Request, Some(RuleType::MapRemote))
            .and_then(|rule| rule.target_url.as_deref())
            .filter(|target| !target.is_empty())
        {
            let original = flow.pretty_url();
            if flow.request.set_url(target) {
                info!("Map remote: {} -> {}", original, target);
            }
        }

        if rules
            .find_match(flow, Phase::Request, Some(RuleType::Block))
            .is_some()
        {
            info!("Blocked request: {}", flow.pretty_url());
            return HookOutcome::Kill;
        }

        self.events.publish(flow, EventPhase::Request);
        HookOutcome::Continue
    }

    /// Response phase: map-local, then breakpoint. Always publishes.
    pub async fn on_response(&self, flow: &mut Flow) -> HookOutcome {
        let rules = self.rules.snapshot();

        if let Some(rule) = rules
            .find_match(flow, Phase::Response, Some(RuleType::MapLocal))
            .filter(|rule| rule.file_path.as_deref().is_some_and(|p| !p.is_empty()))
        {
            match self.map_local(flow, rule).await {
                Ok(path) => info!("Map local: {} -> {}", flow.pretty_url(), path),
                Err(e) => error!("Map local error: {}", e),
            }
        }

        let mut outcome = HookOutcome::Continue;
        if rules
            .find_match(flow, Phase::Response, Some(RuleType::Breakpoint))
            .is_some()
        {
            if let Some(pending) = self.hold(flow, Phase::Response) {
                info!("Breakpoint hit (response): {}", flow.pretty_url());
                outcome = HookOutcome::Hold(pending);
            }
        }

        self.events.publish(flow, EventPhase::Response);
        outcome
    }

    pub fn on_error(&self, flow: &Flow) {
        warn!(
            "Flow {} failed: {}",
            flow.id,
            flow.error.as_deref().unwrap_or("unknown error")
        );
        self.events.publish(flow, EventPhase::Error);
    }

    fn hold(&self, flow: &mut Flow, phase: Phase) -> Option<PendingFlow> {
        match self.registry.hold(&flow.id, phase) {
            Ok(pending) => {
                flow.intercepted = true;
                Some(pending)
            }
            Err(e) => {
                warn!("Cannot hold flow at {} phase: {}", phase.as_str(), e);
                None
            }
        }
    }

    /// Replace the response with the rule's file. The original response is
    /// left alone when the file cannot be read in time.
    async fn map_local<'r>(&self, flow: &mut Flow, rule: &'r Rule) -> Result<&'r str, MapLocalError> {
        let path = rule.file_path.as_deref().unwrap_or_default();
        let content = match tokio::time::timeout(self.map_local_timeout, tokio::fs::read(path)).await {
            Ok(Ok(content)) => content,
            Ok(Err(source)) => {
                return Err(MapLocalError::Read {
                    path: path.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(MapLocalError::Timeout {
                    path: path.to_string(),
                    timeout_ms: self.map_local_timeout.as_millis() as u64,
                })
            }
        };

        let headers = match &rule.headers {
            Some(headers) => headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            None => Headers::from_iter([("Content-Type", MAP_LOCAL_DEFAULT_CONTENT_TYPE)]),
        };
        flow.response = Some(FlowResponse::synthetic(
            rule.status_code.unwrap_or(MAP_LOCAL_DEFAULT_STATUS),
            headers,
            content,
            &flow.request.http_version,
        ));
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::PeerRegistry;
    use crate::codec::{FlowModifications, RequestModifications};
    use crate::dispatcher::CommandDispatcher;
    use crate::flow::FlowRequest;
    use crate::registry::Verdict;
    use serde_json::Value;
    use std::io::Write;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    struct Harness {
        interceptor: Interceptor,
        dispatcher: CommandDispatcher,
        rules: Arc<RuleStore>,
        registry: InterceptionRegistry,
        events: mpsc::Receiver<String>,
        _peer: mpsc::Receiver<axum::extract::ws::Message>,
    }

    fn harness() -> Harness {
        let rules = Arc::new(RuleStore::new());
        let registry = InterceptionRegistry::new();
        let peers = PeerRegistry::new();
        let (peer_tx, peer_rx) = mpsc::channel(16);
        peers.insert(Uuid::new_v4(), peer_tx);
        let (tx, rx) = mpsc::channel(16);
        Harness {
            interceptor: Interceptor::new(
                rules.clone(),
                registry.clone(),
                EventBroadcaster::new(peers, tx),
                Duration::from_secs(2),
            ),
            dispatcher: CommandDispatcher::new(rules.clone(), registry.clone()),
            rules,
            registry,
            events: rx,
            _peer: peer_rx,
        }
    }

    impl Harness {
        fn next_event(&mut self) -> Option<Value> {
            self.events
                .try_recv()
                .ok()
                .map(|raw| serde_json::from_str(&raw).unwrap())
        }
    }

    fn flow(url: &str) -> Flow {
        Flow::new(Uuid::new_v4().to_string(), FlowRequest::from_url("GET", url).unwrap())
    }

    fn rule(id: &str, rule_type: RuleType, phase: Phase, pattern: &str) -> Rule {
        Rule::new(id, rule_type, phase, pattern)
    }

    #[tokio::test]
    async fn test_breakpoint_holds_until_resume() {
        let mut h = harness();
        h.rules.replace(vec![rule("bp", RuleType::Breakpoint, Phase::Request, "*/secret*")]);

        let mut secret = flow("https://a.com/secret/x");
        let HookOutcome::Hold(pending) = h.interceptor.on_request(&mut secret).await else {
            panic!("secret request should be held");
        };
        assert!(h.registry.is_held(&secret.id));
        let event = h.next_event().unwrap();
        assert_eq!(event["intercepted"], true);
        assert_eq!(event["phase"], "request");

        let raw = format!(r#"{{"command":"resume","flowId":"{}"}}"#, secret.id);
        h.dispatcher.dispatch(&raw);
        assert_eq!(pending.wait().await, Verdict::Resume(None));
        assert!(!h.registry.is_held(&secret.id));

        let mut public = flow("https://a.com/public");
        assert!(matches!(h.interceptor.on_request(&mut public).await, HookOutcome::Continue));
        let event = h.next_event().unwrap();
        assert_eq!(event["intercepted"], false);
        assert_eq!(event["request"]["url"], "https://a.com/public");
    }

    #[tokio::test]
    async fn test_resume_edits_applied_by_engine() {
        let h = harness();
        h.rules.replace(vec![rule("bp", RuleType::Breakpoint, Phase::Request, "*")]);

        let mut f = flow("https://a.com/login");
        f.request.headers.append("Authorization", "secret");
        f.request.headers.append("Accept", "*/*");
        let HookOutcome::Hold(pending) = h.interceptor.on_request(&mut f).await else {
            panic!("expected hold");
        };
        let raw = format!(
            r#"{{"command":"resume","flowId":"{}","modified":{{"request":{{"headers":{{"X":"1"}}}}}}}}"#,
            f.id
        );
        h.dispatcher.dispatch(&raw);

        match pending.wait().await {
            Verdict::Resume(edits) => f.resume(edits.as_ref()),
            Verdict::Kill => panic!("expected resume"),
        }
        let headers: Vec<_> = f.request.headers.iter().collect();
        assert_eq!(headers, vec![("X", "1")]);
        assert!(!f.intercepted);
    }

    #[tokio::test]
    async fn test_block_kills_without_event() {
        let mut h = harness();
        h.rules.replace(vec![rule("b", RuleType::Block, Phase::Request, "*ads*")]);

        let mut f = flow("https://ads.example.com/pixel");
        assert!(matches!(h.interceptor.on_request(&mut f).await, HookOutcome::Kill));
        assert!(h.next_event().is_none());
    }

    #[tokio::test]
    async fn test_held_flow_skips_remote_and_block() {
        let h = harness();
        let mut remote = rule("rm", RuleType::MapRemote, Phase::Request, "*");
        remote.target_url = Some("http://elsewhere/".to_string());
        h.rules.replace(vec![
            rule("bp", RuleType::Breakpoint, Phase::Request, "*"),
            remote,
            rule("b", RuleType::Block, Phase::Request, "*"),
        ]);

        let mut f = flow("https://a.com/x");
        let outcome = h.interceptor.on_request(&mut f).await;
        assert!(matches!(outcome, HookOutcome::Hold(_)));
        assert_eq!(f.pretty_url(), "https://a.com/x");
    }

    #[tokio::test]
    async fn test_map_remote_then_block_sees_new_url() {
        let h = harness();
        let mut remote = rule("rm", RuleType::MapRemote, Phase::Request, "https://prod.example.com/*");
        remote.target_url = Some("http://staging.example.com:8080/api".to_string());
        h.rules.replace(vec![remote, rule("b", RuleType::Block, Phase::Request, "*staging*")]);

        let mut f = flow("https://prod.example.com/api");
        assert!(matches!(h.interceptor.on_request(&mut f).await, HookOutcome::Kill));
        assert_eq!(f.pretty_url(), "http://staging.example.com:8080/api");
    }

    #[tokio::test]
    async fn test_map_remote_rewrites_and_continues() {
        let mut h = harness();
        let mut remote = rule("rm", RuleType::MapRemote, Phase::Request, "*/v1/*");
        remote.target_url = Some("https://mock.local/v1/users".to_string());
        let mut empty = rule("noop", RuleType::MapRemote, Phase::Request, "*");
        empty.target_url = None;
        h.rules.replace(vec![remote, empty]);

        let mut f = flow("https://api.example.com/v1/users");
        assert!(matches!(h.interceptor.on_request(&mut f).await, HookOutcome::Continue));
        assert_eq!(f.request.host, "mock.local");
        let event = h.next_event().unwrap();
        assert_eq!(event["request"]["url"], "https://mock.local/v1/users");
    }

    #[tokio::test]
    async fn test_map_local_replaces_response() {
        let mut h = harness();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{\"mocked\":true}").unwrap();

        let mut local = rule("ml", RuleType::MapLocal, Phase::Response, "*/config.json");
        local.file_path = Some(file.path().to_string_lossy().into_owned());
        h.rules.replace(vec![local]);

        let mut f = flow("https://a.com/config.json");
        f.response = Some(FlowResponse::synthetic(500, Headers::new(), b"boom".to_vec(), "HTTP/1.1"));
        assert!(matches!(h.interceptor.on_response(&mut f).await, HookOutcome::Continue));

        let response = f.response.as_ref().unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.content, b"{\"mocked\":true}");
        assert_eq!(response.headers.get("content-type"), Some("application/octet-stream"));
        let event = h.next_event().unwrap();
        assert_eq!(event["phase"], "response");
        assert_eq!(event["response"]["body"], "{\"mocked\":true}");
    }

    #[tokio::test]
    async fn test_map_local_uses_rule_status_and_headers() {
        let h = harness();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"<svg/>").unwrap();

        let mut local = rule("ml", RuleType::MapLocal, Phase::Response, "*.svg");
        local.file_path = Some(file.path().to_string_lossy().into_owned());
        local.status_code = Some(203);
        local.headers = Some([("Content-Type".to_string(), "image/svg+xml".to_string())].into());
        h.rules.replace(vec![local]);

        let mut f = flow("https://a.com/logo.svg");
        h.interceptor.on_response(&mut f).await;
        let response = f.response.unwrap();
        assert_eq!(response.status_code, 203);
        assert_eq!(response.headers.get("Content-Type"), Some("image/svg+xml"));
    }

    #[tokio::test]
    async fn test_map_local_missing_file_keeps_original() {
        let mut h = harness();
        let mut local = rule("ml", RuleType::MapLocal, Phase::Response, "*");
        local.file_path = Some("/definitely/not/here.bin".to_string());
        h.rules.replace(vec![local]);

        let mut f = flow("https://a.com/x");
        let original = FlowResponse::synthetic(201, Headers::new(), b"upstream".to_vec(), "HTTP/1.1");
        f.response = Some(original.clone());
        assert!(matches!(h.interceptor.on_response(&mut f).await, HookOutcome::Continue));
        assert_eq!(f.response, Some(original));
        assert!(h.next_event().is_some());
    }

    #[tokio::test]
    async fn test_response_breakpoint_after_request_release() {
        let h = harness();
        h.rules.replace(vec![
            rule("req", RuleType::Breakpoint, Phase::Request, "*"),
            rule("resp", RuleType::Breakpoint, Phase::Response, "*/slow"),
        ]);

        let mut f = flow("https://a.com/fast");
        let HookOutcome::Hold(pending) = h.interceptor.on_request(&mut f).await else {
            panic!("expected request hold");
        };
        h.dispatcher.resume(&f.id, None);
        pending.wait().await;
        f.resume(None);

        f.response = Some(FlowResponse::synthetic(200, Headers::new(), Vec::new(), "HTTP/1.1"));
        assert!(matches!(h.interceptor.on_response(&mut f).await, HookOutcome::Continue));
        assert!(!h.registry.is_held(&f.id));
    }

    #[tokio::test]
    async fn test_response_breakpoint_kill() {
        let mut h = harness();
        h.rules.replace(vec![rule("resp", RuleType::Breakpoint, Phase::Response, "*")]);

        let mut f = flow("https://a.com/x");
        f.response = Some(FlowResponse::synthetic(200, Headers::new(), Vec::new(), "HTTP/1.1"));
        let HookOutcome::Hold(pending) = h.interceptor.on_response(&mut f).await else {
            panic!("expected response hold");
        };
        let event = h.next_event().unwrap();
        assert_eq!(event["phase"], "response");
        assert_eq!(event["intercepted"], true);

        h.dispatcher.kill(&f.id);
        assert_eq!(pending.wait().await, Verdict::Kill);
    }

    #[tokio::test]
    async fn test_error_hook_publishes() {
        let mut h = harness();
        let mut f = flow("https://a.com/x");
        f.error = Some("upstream timed out".to_string());
        h.interceptor.on_error(&f);
        let event = h.next_event().unwrap();
        assert_eq!(event["phase"], "error");
        assert_eq!(event["error"], "upstream timed out");
    }

    #[tokio::test]
    async fn test_request_edit_payload_type() {
        // resume edits are plain data until the engine applies them
        let edits = FlowModifications {
            request: Some(RequestModifications {
                url: Some("https://b.com/".to_string()),
                ..Default::default()
            }),
            response: None,
        };
        let mut f = flow("https://a.com/");
        f.resume(Some(&edits));
        assert_eq!(f.pretty_url(), "https://b.com/");
    }
}
