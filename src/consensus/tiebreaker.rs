//! Tiebreaker escalation for close votes.
//!
//! `NotNeeded -> Triggered -> Resolved | Failed`. A failed escalation is never
//! an error for the caller: the pre-escalation tally stands.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::gateway::Attribution;
use crate::json_extract::parse_json_object;
use crate::prompts::{render_tiebreaker_prompt, ValuationPromptInput, VoteDigestLine};
use crate::providers::{AnalysisRequest, ProviderRegistry, ValuationProvider};

use super::tally::VoteTally;
use super::types::{ModelVote, TiebreakerOutcome, TiebreakerState};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TiebreakerConfig {
    pub enabled: bool,
    /// Preferred provider id. Falls back to the first tiebreaker-eligible provider.
    pub provider: Option<String>,
    /// Discount applied to the tiebreaker's base weight (< 1).
    pub weight_factor: f64,
}

impl Default for TiebreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: None,
            weight_factor: 0.5,
        }
    }
}

/// Result of the extra call, before it is merged into the tally.
#[derive(Debug, Clone)]
pub struct TiebreakerResult {
    pub success: bool,
    pub vote: Option<ModelVote>,
    pub error: Option<String>,
    pub response_time_ms: u64,
    pub selected_provider: Option<String>,
}

impl TiebreakerResult {
    fn failed(error: impl Into<String>, response_time_ms: u64) -> Self {
        Self {
            success: false,
            vote: None,
            error: Some(error.into()),
            response_time_ms,
            selected_provider: None,
        }
    }
}

pub fn select_provider(
    registry: &ProviderRegistry,
    config: &TiebreakerConfig,
) -> Option<Arc<dyn ValuationProvider>> {
    if let Some(id) = config.provider.as_deref() {
        match registry.get(id) {
            // an ineligible provider already voted in the primary round
            Some(p) if p.config().capabilities.tiebreaker_eligible => return Some(p),
            Some(_) => warn!(provider = id, "configured tiebreaker provider is not tiebreaker-eligible; using first eligible"),
            None => warn!(provider = id, "configured tiebreaker provider unavailable; using first eligible"),
        }
    }
    registry
        .providers()
        .iter()
        .find(|p| p.config().capabilities.tiebreaker_eligible)
        .cloned()
}

/// Run one tiebreaker call over the complete primary vote set.
pub async fn run_tiebreaker(
    provider: &dyn ValuationProvider,
    config: &TiebreakerConfig,
    item: &ValuationPromptInput<'_>,
    primary: &[ModelVote],
    tally: &VoteTally,
    timeout: Duration,
    attribution: Attribution,
) -> TiebreakerResult {
    let digest: Vec<VoteDigestLine<'_>> = primary
        .iter()
        .map(|v| VoteDigestLine {
            provider_id: &v.provider_id,
            estimated_value: v.analysis.estimated_value,
            decision: v.analysis.decision.as_str(),
            confidence: v.analysis.confidence,
        })
        .collect();
    let prompt = render_tiebreaker_prompt(item, &digest, tally.buy_weight, tally.sell_weight);

    let started = Instant::now();
    let request = AnalysisRequest {
        images: &[],
        prompt: &prompt,
        item_hint: item.item_name_hint,
        attribution,
    };
    let outcome = match tokio::time::timeout(timeout, provider.analyze(&request)).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(err)) => return TiebreakerResult::failed(err.to_string(), elapsed_ms(started)),
        Err(_) => {
            return TiebreakerResult::failed(
                format!("timed out after {}s", timeout.as_secs()),
                elapsed_ms(started),
            )
        }
    };
    let response_time_ms = elapsed_ms(started);
    if outcome.fallback {
        return TiebreakerResult::failed("unparseable tiebreaker response", response_time_ms);
    }

    let mut analysis = outcome.analysis;
    let selected_provider = parse_json_object(&outcome.raw_response)
        .and_then(|v| v.get("selected_provider").and_then(|s| s.as_str()).map(str::to_string))
        .filter(|id| primary.iter().any(|v| &v.provider_id == id));
    if let Some(id) = &selected_provider {
        if let Some(chosen) = primary.iter().find(|v| &v.provider_id == id) {
            analysis.decision = chosen.analysis.decision;
            analysis.estimated_value = chosen.analysis.estimated_value;
        }
    }

    let factor = if config.weight_factor.is_finite() {
        config.weight_factor.clamp(0.0, 1.0)
    } else {
        0.5
    };

    TiebreakerResult {
        success: true,
        vote: Some(ModelVote {
            provider_id: provider.id().to_string(),
            provider_name: provider.config().display_name.clone(),
            analysis,
            base_weight: provider.base_weight() * factor,
            response_time_ms,
            is_tiebreaker: true,
            fallback: false,
            raw_response: outcome.raw_response,
        }),
        error: None,
        response_time_ms,
        selected_provider,
    }
}

/// Fold a tiebreaker result into an audit outcome.
pub fn outcome_from_result(
    provider_id: Option<String>,
    result: TiebreakerResult,
    pre: &VoteTally,
    post: Option<&VoteTally>,
) -> TiebreakerOutcome {
    let pre_decision = pre.decision;
    let final_decision = post.map_or(pre_decision, |t| t.decision);
    let flipped = pre_decision != final_decision;
    let state = if result.success {
        TiebreakerState::Resolved
    } else {
        TiebreakerState::Failed
    };
    match state {
        TiebreakerState::Resolved => info!(
            provider = provider_id.as_deref().unwrap_or(""),
            pre = %pre_decision,
            post = %final_decision,
            flipped,
            "tiebreaker resolved"
        ),
        _ => warn!(
            provider = provider_id.as_deref().unwrap_or(""),
            error = result.error.as_deref().unwrap_or(""),
            "tiebreaker failed; keeping primary tally"
        ),
    }
    TiebreakerOutcome {
        state,
        provider_id,
        vote: result.vote,
        error: result.error,
        response_time_ms: result.response_time_ms,
        selected_provider: result.selected_provider,
        pre_decision: Some(pre_decision),
        final_decision: Some(final_decision),
        flipped,
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
