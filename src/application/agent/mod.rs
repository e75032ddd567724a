//! Decision collaborator contract.
//!
//! The LLM adapter is external to the control plane: it receives the
//! assembled `DecisionContext` and returns a rationale plus a sequence of
//! typed tool calls. The dispatcher in `tools` validates each call against
//! policy before anything touches the exchange.

pub mod context;
pub mod tools;

use async_trait::async_trait;

use crate::domain::errors::AgentError;
use context::DecisionContext;
use tools::ToolCall;

/// What the collaborator returns for one decision-loop tick.
#[derive(Debug, Clone)]
pub struct Decision {
    pub rationale: String,
    pub tool_calls: Vec<ToolCall>,
}

#[async_trait]
pub trait DecisionProvider: Send + Sync {
    async fn decide(&self, context: &DecisionContext) -> Result<Decision, AgentError>;
}

/// Fallback provider that never trades. Used until a real LLM adapter is
/// injected, so the loops, persistence, and risk management still run.
pub struct HoldProvider;

#[async_trait]
impl DecisionProvider for HoldProvider {
    async fn decide(&self, _context: &DecisionContext) -> Result<Decision, AgentError> {
        Ok(Decision {
            rationale: "no decision provider configured; holding".to_string(),
            tool_calls: Vec::new(),
        })
    }
}
