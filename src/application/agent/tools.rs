//! Typed tool calls and the validating dispatcher.
//!
//! The decision provider emits calls from a closed set; the dispatcher
//! checks each against policy before executing. An `openPosition` must be
//! preceded, within the same tick, by an `analyzeOpeningOpportunities`
//! whose score for that (symbol, side) met the configured floor — anything
//! else is refused and logged as a policy violation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::application::risk_manager::{CloseReason, RiskManager};
use crate::domain::entities::position::PositionSide;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tool", content = "args", rename_all = "camelCase")]
pub enum ToolCall {
    AnalyzeOpeningOpportunities,
    #[serde(rename_all = "camelCase")]
    OpenPosition {
        symbol: String,
        side: PositionSide,
        notional_usdt: f64,
        leverage: f64,
    },
    #[serde(rename_all = "camelCase")]
    ClosePosition { symbol: String, side: PositionSide },
    #[serde(rename_all = "camelCase")]
    CheckPartialTakeProfitOpportunity { symbol: String, side: PositionSide },
    #[serde(rename_all = "camelCase")]
    ExecutePartialTakeProfit { symbol: String, side: PositionSide },
    #[serde(rename_all = "camelCase")]
    UpdateTrailingStop { symbol: String, side: PositionSide },
}

impl ToolCall {
    pub fn name(&self) -> &'static str {
        match self {
            ToolCall::AnalyzeOpeningOpportunities => "analyzeOpeningOpportunities",
            ToolCall::OpenPosition { .. } => "openPosition",
            ToolCall::ClosePosition { .. } => "closePosition",
            ToolCall::CheckPartialTakeProfitOpportunity { .. } => {
                "checkPartialTakeProfitOpportunity"
            }
            ToolCall::ExecutePartialTakeProfit { .. } => "executePartialTakeProfit",
            ToolCall::UpdateTrailingStop { .. } => "updateTrailingStop",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionOutcome {
    pub tool: String,
    pub success: bool,
    pub detail: String,
    /// Set when the call was refused before reaching the exchange.
    pub policy_violation: bool,
}

impl ActionOutcome {
    fn ok(tool: &str, detail: String) -> Self {
        ActionOutcome {
            tool: tool.to_string(),
            success: true,
            detail,
            policy_violation: false,
        }
    }

    fn failed(tool: &str, detail: String) -> Self {
        ActionOutcome {
            tool: tool.to_string(),
            success: false,
            detail,
            policy_violation: false,
        }
    }

    fn refused(tool: &str, detail: String) -> Self {
        ActionOutcome {
            tool: tool.to_string(),
            success: false,
            detail,
            policy_violation: true,
        }
    }
}

/// Whether an open call is backed by a qualifying analysis score.
pub fn open_qualifies(
    scores: &HashMap<(String, PositionSide), f64>,
    symbol: &str,
    side: PositionSide,
    floor: f64,
) -> bool {
    scores
        .get(&(symbol.to_string(), side))
        .map(|score| *score >= floor)
        .unwrap_or(false)
}

pub struct ToolDispatcher {
    risk: Arc<RiskManager>,
    pub min_open_score: f64,
    pub max_opportunities: usize,
}

impl ToolDispatcher {
    pub fn new(risk: Arc<RiskManager>, min_open_score: f64, max_opportunities: usize) -> Self {
        ToolDispatcher {
            risk,
            min_open_score,
            max_opportunities,
        }
    }

    /// Execute the emitted calls in order. Scores from analysis calls are
    /// only valid within the current dispatch.
    pub async fn dispatch(&self, calls: &[ToolCall]) -> Vec<ActionOutcome> {
        let mut outcomes = Vec::with_capacity(calls.len());
        let mut scores: HashMap<(String, PositionSide), f64> = HashMap::new();

        for call in calls {
            let outcome = match call {
                ToolCall::AnalyzeOpeningOpportunities => {
                    let opportunities = self.risk.rank_opportunities(self.max_opportunities).await;
                    for opportunity in &opportunities {
                        scores.insert(
                            (opportunity.symbol.clone(), opportunity.side),
                            opportunity.score,
                        );
                    }
                    let summary: Vec<String> = opportunities
                        .iter()
                        .map(|o| format!("{} {} {:.0}", o.symbol, o.side, o.score))
                        .collect();
                    ActionOutcome::ok(call.name(), summary.join(", "))
                }
                ToolCall::OpenPosition {
                    symbol,
                    side,
                    notional_usdt,
                    leverage,
                } => {
                    if !open_qualifies(&scores, symbol, *side, self.min_open_score) {
                        warn!(
                            "policy violation: openPosition {} {} without qualifying analysis (floor {})",
                            symbol, side, self.min_open_score
                        );
                        ActionOutcome::refused(
                            call.name(),
                            format!(
                                "refused: no analysis score >= {} for {} {}",
                                self.min_open_score, symbol, side
                            ),
                        )
                    } else {
                        match self
                            .risk
                            .open_position(symbol, *side, *notional_usdt, *leverage)
                            .await
                        {
                            Ok(order_id) => {
                                ActionOutcome::ok(call.name(), format!("order {}", order_id))
                            }
                            Err(e) => ActionOutcome::failed(call.name(), e.to_string()),
                        }
                    }
                }
                ToolCall::ClosePosition { symbol, side } => {
                    match self
                        .risk
                        .close_position(symbol, *side, CloseReason::AgentDecision)
                        .await
                    {
                        Ok(()) => ActionOutcome::ok(call.name(), "closed".to_string()),
                        Err(e) => ActionOutcome::failed(call.name(), e.to_string()),
                    }
                }
                ToolCall::CheckPartialTakeProfitOpportunity { symbol, side } => {
                    // read-only: report whether a tier is reachable
                    match self.risk.execute_partial_preview(symbol, *side).await {
                        Ok(Some(r)) => {
                            ActionOutcome::ok(call.name(), format!("tier at {:.1}R reachable", r))
                        }
                        Ok(None) => ActionOutcome::ok(call.name(), "no tier reachable".to_string()),
                        Err(e) => ActionOutcome::failed(call.name(), e.to_string()),
                    }
                }
                ToolCall::ExecutePartialTakeProfit { symbol, side } => {
                    match self.risk.execute_partial(symbol, *side).await {
                        Ok(true) => ActionOutcome::ok(call.name(), "partial executed".to_string()),
                        Ok(false) => {
                            ActionOutcome::ok(call.name(), "no tier reached".to_string())
                        }
                        Err(e) => ActionOutcome::failed(call.name(), e.to_string()),
                    }
                }
                ToolCall::UpdateTrailingStop { symbol, side } => {
                    match self.risk.update_trailing(symbol, *side).await {
                        Ok(true) => ActionOutcome::ok(call.name(), "stop advanced".to_string()),
                        Ok(false) => ActionOutcome::ok(call.name(), "unchanged".to_string()),
                        Err(e) => ActionOutcome::failed(call.name(), e.to_string()),
                    }
                }
            };
            info!(
                "tool {} -> {}{}",
                outcome.tool,
                if outcome.success { "ok" } else { "failed" },
                if outcome.policy_violation {
                    " (policy violation)"
                } else {
                    ""
                }
            );
            outcomes.push(outcome);
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_qualifies_requires_floor() {
        let mut scores = HashMap::new();
        scores.insert(("BTC".to_string(), PositionSide::Long), 94.0);
        scores.insert(("ETH".to_string(), PositionSide::Short), 40.0);

        assert!(open_qualifies(&scores, "BTC", PositionSide::Long, 60.0));
        assert!(!open_qualifies(&scores, "ETH", PositionSide::Short, 60.0));
        // side mismatch does not qualify
        assert!(!open_qualifies(&scores, "BTC", PositionSide::Short, 60.0));
        // unanalyzed symbol never qualifies
        assert!(!open_qualifies(&scores, "SOL", PositionSide::Long, 60.0));
    }

    #[test]
    fn test_tool_call_serialization_round_trip() {
        let call = ToolCall::OpenPosition {
            symbol: "BTC".to_string(),
            side: PositionSide::Long,
            notional_usdt: 300.0,
            leverage: 3.0,
        };
        let json = serde_json::to_string(&call).unwrap();
        assert!(json.contains("openPosition"));
        assert!(json.contains("notionalUsdt"));
        let parsed: ToolCall = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, call);
    }

    #[test]
    fn test_tool_call_parse_from_provider_payload() {
        let payload = r#"{"tool":"closePosition","args":{"symbol":"ETH","side":"short"}}"#;
        let parsed: ToolCall = serde_json::from_str(payload).unwrap();
        assert_eq!(
            parsed,
            ToolCall::ClosePosition {
                symbol: "ETH".to_string(),
                side: PositionSide::Short,
            }
        );
    }

    #[test]
    fn test_analyze_has_no_args() {
        let payload = r#"{"tool":"analyzeOpeningOpportunities"}"#;
        let parsed: ToolCall = serde_json::from_str(payload).unwrap();
        assert_eq!(parsed, ToolCall::AnalyzeOpeningOpportunities);
    }
}
