use crate::codec::{decode_command, Command, FlowModifications, Reply};
use crate::error::DecodeError;
use crate::registry::{InterceptionRegistry, Verdict};
use crate::rules::RuleStore;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Routes decoded client commands to the registry and the rule store.
///
/// Runs on the connection side. Verdicts for held flows are handed to the
/// owning engine task through the registry handle; nothing here touches a
/// flow directly and nothing waits for the engine.
#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    rules: Arc<RuleStore>,
    registry: InterceptionRegistry,
}

impl CommandDispatcher {
    pub fn new(rules: Arc<RuleStore>, registry: InterceptionRegistry) -> Self {
        Self { rules, registry }
    }

    /// Handle one inbound message. Returns the reply for the sending peer, if any.
    pub fn dispatch(&self, raw: &str) -> Option<Reply> {
        let command = match decode_command(raw) {
            Ok(command) => command,
            Err(DecodeError::Unknown(name)) => {
                warn!("Unknown command: {}", name);
                return None;
            }
            Err(e @ DecodeError::Malformed(_)) => {
                error!("Invalid command message: {}", e);
                return None;
            }
        };

        match command {
            Command::Resume { flow_id, modified } => {
                self.resume(&flow_id, modified);
                None
            }
            Command::Kill { flow_id } => {
                self.kill(&flow_id);
                None
            }
            Command::UpdateRules { rules } => {
                self.rules.replace(rules);
                None
            }
            Command::Ping {} => Some(Reply::Pong),
        }
    }

    pub fn resume(&self, flow_id: &str, modified: Option<FlowModifications>) -> bool {
        let Some(held) = self.registry.release(flow_id) else {
            warn!("Flow not found for resume: {}", flow_id);
            return false;
        };
        let held_ms = held.held_for().num_milliseconds();
        if held.settle(Verdict::Resume(modified)) {
            info!("Resumed flow: {} (held {}ms)", flow_id, held_ms);
            true
        } else {
            warn!("Flow {} was torn down before it could be resumed", flow_id);
            false
        }
    }

    pub fn kill(&self, flow_id: &str) -> bool {
        let Some(held) = self.registry.release(flow_id) else {
            warn!("Flow not found for kill: {}", flow_id);
            return false;
        };
        let held_ms = held.held_for().num_milliseconds();
        if held.settle(Verdict::Kill) {
            info!("Killed flow: {} (held {}ms)", flow_id, held_ms);
            true
        } else {
            warn!("Flow {} was torn down before it could be killed", flow_id);
            false
        }
    }
}
