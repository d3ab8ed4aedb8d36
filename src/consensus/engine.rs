//! End-to-end valuation: classify, fan out, tally, escalate, score.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::category::CategoryClassifier;
use crate::gateway::{Attribution, ImageData, ProviderError};
use crate::prompts::{render_valuation_prompt, PromptInstance, ValuationPromptInput};
use crate::providers::{AdapterConfig, AnalysisRequest, ProviderRegistry, ValuationProvider};
use crate::self_heal::{SelfHealEngine, WeightCache, WeightSnapshot};
use crate::trace::{TraceSink, ValuationTrace};

use super::tally::{tally, TallyConfig, VoteTally};
use super::tiebreaker::{outcome_from_result, run_tiebreaker, select_provider, TiebreakerConfig};
use super::types::{
    ImageInput, ModelVote, ProviderFailure, TiebreakerOutcome, TiebreakerState, ValuationRequest,
    ValuationResult, ValuationStatus,
};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tally: TallyConfig,
    pub tiebreaker: TiebreakerConfig,
    /// Bound on one provider call, retries included, for providers that do
    /// not report their own deadline.
    pub provider_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tally: TallyConfig::default(),
            tiebreaker: TiebreakerConfig::default(),
            provider_timeout: AdapterConfig::default().call_deadline(None),
        }
    }
}

pub struct ValuationEngine {
    registry: Arc<ProviderRegistry>,
    classifier: Arc<CategoryClassifier>,
    weights: Arc<WeightCache>,
    self_heal: Option<Arc<SelfHealEngine>>,
    trace: Option<Arc<dyn TraceSink>>,
    config: EngineConfig,
}

impl ValuationEngine {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        classifier: Arc<CategoryClassifier>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            classifier,
            weights: Arc::new(WeightCache::new(Duration::from_secs(3_600), 0.3, 1.5)),
            self_heal: None,
            trace: None,
            config,
        }
    }

    /// Read multipliers through the self-heal engine; its cache replaces ours.
    pub fn with_self_heal(mut self, engine: Arc<SelfHealEngine>) -> Self {
        self.weights = Arc::clone(engine.cache());
        self.self_heal = Some(engine);
        self
    }

    pub fn with_weight_cache(mut self, cache: Arc<WeightCache>) -> Self {
        self.weights = cache;
        self
    }

    pub fn with_trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace = Some(sink);
        self
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Multipliers in effect right now.
    pub fn weights(&self) -> Arc<WeightSnapshot> {
        match &self.self_heal {
            Some(engine) => engine.current_weights(),
            None => self.weights.snapshot(),
        }
    }

    /// Value one item. Provider failures are reported inside the result; this
    /// never fails as a whole.
    pub async fn analyze(&self, request: ValuationRequest) -> ValuationResult {
        let started = Instant::now();
        let valuation_id = Uuid::new_v4();

        let description = request.context.description.as_deref();
        let category = self.classifier.classify(&request.item_name_hint, description);
        let images: Arc<Vec<ImageData>> =
            Arc::new(request.images.iter().map(ImageInput::to_image_data).collect());

        let prompt_input = ValuationPromptInput {
            item_name_hint: &request.item_name_hint,
            description,
            category: &category,
            asking_price: request.context.asking_price,
            location_hint: request.context.location_hint.as_deref(),
            image_count: images.len(),
            text_only: false,
        };
        let prompt = Arc::new(render_valuation_prompt(&prompt_input));
        let snapshot = self.weights();

        debug!(
            %valuation_id,
            category = %category,
            images = images.len(),
            providers = self.registry.providers().len(),
            "valuation started"
        );

        let (mut votes, mut failures) = self
            .collect_votes(
                &images,
                &prompt,
                &request.item_name_hint,
                Attribution::new("ensemble::primary").with_valuation(valuation_id),
            )
            .await;
        failures.extend(self.registry.unavailable().iter().map(|u| ProviderFailure {
            provider_id: u.id.clone(),
            code: "provider_unavailable".to_string(),
            message: u.reason.clone(),
            latency_ms: 0,
        }));

        let primary = tally(&votes, &snapshot, &self.config.tally);
        let (final_tally, tiebreaker) = if primary.is_close_vote && self.config.tiebreaker.enabled {
            self.escalate(&prompt_input, &mut votes, primary, &snapshot, valuation_id)
                .await
        } else {
            (primary, TiebreakerOutcome::not_needed())
        };

        let (decision, status, confidence, estimated_value) = if final_tally.usable_votes == 0 {
            warn!(%valuation_id, failures = failures.len(), "no usable votes; valuation undetermined");
            (None, ValuationStatus::Undetermined, 0.0, 0.0)
        } else {
            let confidence = result_confidence(&votes, &final_tally, &self.config.tally);
            let status = if confidence < self.config.tally.low_confidence_threshold {
                ValuationStatus::LowConfidence
            } else {
                ValuationStatus::Confident
            };
            let value = final_tally
                .consensus_value
                .or_else(|| usable_mean(&votes))
                .unwrap_or(0.0);
            (Some(final_tally.decision), status, confidence, value)
        };

        let item_name = consensus_item_name(&votes, &final_tally)
            .unwrap_or_else(|| fallback_item_name(&request.item_name_hint));

        let result = ValuationResult {
            valuation_id,
            decision,
            estimated_value,
            confidence,
            status,
            item_name,
            category,
            asking_price: request.context.asking_price,
            tiebreaker_used: tiebreaker.state != TiebreakerState::NotNeeded,
            votes,
            failures,
            tally: final_tally,
            tiebreaker,
            processing_time_ms: started.elapsed().as_millis() as u64,
            created_at: Utc::now(),
        };

        if let Some(sink) = &self.trace {
            if let Err(err) = sink.record(ValuationTrace::from_result(&result, &prompt)) {
                warn!(%valuation_id, error = %err, "failed to record valuation trace");
            }
        }

        info!(
            %valuation_id,
            decision = result.decision.map(|d| d.as_str()).unwrap_or("UNDETERMINED"),
            estimated_value = result.estimated_value,
            confidence = result.confidence,
            status = ?result.status,
            votes = result.votes.len(),
            failures = result.failures.len(),
            tiebreaker = ?result.tiebreaker.state,
            elapsed_ms = result.processing_time_ms,
            "valuation complete"
        );
        result
    }

    /// Tiebreaker-eligible providers are held back for escalation unless
    /// nothing else is available.
    fn primary_providers(&self) -> Vec<Arc<dyn ValuationProvider>> {
        let all = self.registry.providers();
        let primary: Vec<_> = all
            .iter()
            .filter(|p| !p.config().capabilities.tiebreaker_eligible)
            .cloned()
            .collect();
        if primary.is_empty() {
            all.to_vec()
        } else {
            primary
        }
    }

    /// Call every primary provider concurrently. Votes and failures come back
    /// in registry order.
    async fn collect_votes(
        &self,
        images: &Arc<Vec<ImageData>>,
        prompt: &Arc<PromptInstance>,
        item_hint: &str,
        attribution: Attribution,
    ) -> (Vec<ModelVote>, Vec<ProviderFailure>) {
        let primary = self.primary_providers();
        let mut handles = Vec::with_capacity(primary.len());
        for provider in primary {
            let images = Arc::clone(images);
            let prompt = Arc::clone(prompt);
            let item_hint = item_hint.to_string();
            let id = provider.id().to_string();
            let timeout = provider.call_deadline().unwrap_or(self.config.provider_timeout);
            let handle = tokio::spawn(async move {
                let started = Instant::now();
                let request = AnalysisRequest {
                    images: images.as_slice(),
                    prompt: prompt.as_ref(),
                    item_hint: &item_hint,
                    attribution,
                };
                let result = match tokio::time::timeout(timeout, provider.analyze(&request)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Timeout(timeout, None)),
                };
                (provider, result, started.elapsed())
            });
            handles.push((id, handle));
        }

        let mut votes = Vec::with_capacity(handles.len());
        let mut failures = Vec::new();
        for (id, handle) in handles {
            match handle.await {
                Ok((provider, Ok(outcome), elapsed)) => {
                    debug!(
                        provider = %id,
                        decision = %outcome.analysis.decision,
                        value = outcome.analysis.estimated_value,
                        fallback = outcome.fallback,
                        "vote received"
                    );
                    votes.push(ModelVote {
                        provider_id: id,
                        provider_name: provider.config().display_name.clone(),
                        analysis: outcome.analysis,
                        base_weight: provider.base_weight(),
                        response_time_ms: elapsed.as_millis() as u64,
                        is_tiebreaker: false,
                        fallback: outcome.fallback,
                        raw_response: outcome.raw_response,
                    });
                }
                Ok((_, Err(err), elapsed)) => {
                    warn!(provider = %id, code = err.code(), error = %err, "provider call failed");
                    failures.push(ProviderFailure {
                        provider_id: id,
                        code: err.code().to_string(),
                        message: err.to_string(),
                        latency_ms: elapsed.as_millis() as u64,
                    });
                }
                Err(err) => {
                    warn!(provider = %id, error = %err, "provider task panicked");
                    failures.push(ProviderFailure {
                        provider_id: id,
                        code: "task_failed".to_string(),
                        message: err.to_string(),
                        latency_ms: 0,
                    });
                }
            }
        }
        (votes, failures)
    }

    async fn escalate(
        &self,
        item: &ValuationPromptInput<'_>,
        votes: &mut Vec<ModelVote>,
        pre: VoteTally,
        snapshot: &WeightSnapshot,
        valuation_id: Uuid,
    ) -> (VoteTally, TiebreakerOutcome) {
        info!(
            %valuation_id,
            buy = pre.buy_weight,
            sell = pre.sell_weight,
            difference = pre.weight_difference,
            "close vote; escalating to tiebreaker"
        );

        let Some(provider) = select_provider(&self.registry, &self.config.tiebreaker) else {
            warn!(%valuation_id, "no tiebreaker-eligible provider available");
            let outcome = TiebreakerOutcome {
                state: TiebreakerState::Failed,
                error: Some("no tiebreaker-eligible provider available".to_string()),
                pre_decision: Some(pre.decision),
                final_decision: Some(pre.decision),
                ..TiebreakerOutcome::default()
            };
            return (pre, outcome);
        };

        let result = run_tiebreaker(
            provider.as_ref(),
            &self.config.tiebreaker,
            item,
            votes,
            &pre,
            provider.call_deadline().unwrap_or(self.config.provider_timeout),
            Attribution::new("ensemble::tiebreaker").with_valuation(valuation_id),
        )
        .await;

        let post = result.vote.as_ref().map(|vote| {
            votes.push(vote.clone());
            tally(votes, snapshot, &self.config.tally)
        });
        let outcome = outcome_from_result(Some(provider.id().to_string()), result, &pre, post.as_ref());
        (post.unwrap_or(pre), outcome)
    }
}

/// winning share x mean winning confidence x sample-size factor.
fn result_confidence(votes: &[ModelVote], tally: &VoteTally, config: &TallyConfig) -> f64 {
    let total = tally.total_weight();
    if total <= 0.0 {
        return 0.0;
    }
    let share = tally.winning_weight() / total;

    let (weighted, weight_sum) = votes
        .iter()
        .zip(&tally.weights)
        .filter(|(v, _)| v.decision() == tally.decision)
        .fold((0.0, 0.0), |(acc, sum), (_, w)| {
            (acc + w.weight * w.confidence, sum + w.weight)
        });
    let mean_confidence = if weight_sum > 0.0 {
        weighted / weight_sum
    } else {
        0.0
    };

    let wanted = config.min_primary_votes.max(1) as f64;
    let sample_factor = (tally.usable_votes as f64 / wanted).min(1.0);
    (share * mean_confidence * sample_factor).clamp(0.0, 1.0)
}

fn usable_mean(votes: &[ModelVote]) -> Option<f64> {
    let prices: Vec<f64> = votes
        .iter()
        .filter(|v| v.is_usable())
        .map(|v| v.analysis.estimated_value)
        .collect();
    if prices.is_empty() {
        None
    } else {
        Some(prices.iter().sum::<f64>() / prices.len() as f64)
    }
}

/// Name given by the heaviest usable vote on the winning side.
fn consensus_item_name(votes: &[ModelVote], tally: &VoteTally) -> Option<String> {
    votes
        .iter()
        .zip(&tally.weights)
        .filter(|(v, _)| v.is_usable() && v.decision() == tally.decision)
        .filter(|(v, _)| !v.analysis.item_name.trim().is_empty())
        .max_by(|(_, a), (_, b)| a.weight.total_cmp(&b.weight))
        .map(|(v, _)| v.analysis.item_name.clone())
}

fn fallback_item_name(hint: &str) -> String {
    let hint = hint.trim();
    if hint.is_empty() {
        "Unknown item".to_string()
    } else {
        hint.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::test_support::vote;
    use crate::providers::{AnalysisOutcome, Decision, ParsedAnalysis, ProviderConfig};
    use async_trait::async_trait;

    enum Script {
        Answer(Decision, f64, f64),
        Fail,
        Hang,
    }

    struct FakeProvider {
        config: ProviderConfig,
        script: Script,
    }

    impl FakeProvider {
        fn new(id: &str, script: Script) -> Arc<dyn ValuationProvider> {
            let mut config = ProviderConfig::known("openai").unwrap();
            config.id = id.to_string();
            config.display_name = id.to_uppercase();
            config.base_weight = 1.0;
            config.capabilities.tiebreaker_eligible = id.starts_with("tb");
            Arc::new(Self { config, script })
        }
    }

    #[async_trait]
    impl ValuationProvider for FakeProvider {
        fn config(&self) -> &ProviderConfig {
            &self.config
        }

        async fn analyze(&self, req: &AnalysisRequest<'_>) -> Result<AnalysisOutcome, ProviderError> {
            match self.script {
                Script::Answer(decision, value, confidence) => Ok(AnalysisOutcome {
                    analysis: ParsedAnalysis {
                        item_name: format!("{} by {}", req.item_hint, self.config.id),
                        estimated_value: value,
                        decision,
                        valuation_factors: vec![],
                        summary_reasoning: String::new(),
                        confidence,
                    },
                    raw_response: "{}".to_string(),
                    fallback: false,
                    latency: Duration::from_millis(1),
                }),
                Script::Fail => Err(ProviderError::Provider {
                    provider: self.config.id.clone(),
                    message: "boom".to_string(),
                    retryable: false,
                    context: None,
                }),
                Script::Hang => {
                    tokio::time::sleep(Duration::from_secs(3_600)).await;
                    unreachable!()
                }
            }
        }
    }

    fn engine(providers: Vec<Arc<dyn ValuationProvider>>) -> ValuationEngine {
        let mut registry = ProviderRegistry::new();
        for p in providers {
            registry.insert(p);
        }
        ValuationEngine::new(
            Arc::new(registry),
            Arc::new(CategoryClassifier::new()),
            EngineConfig {
                provider_timeout: Duration::from_millis(200),
                ..EngineConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn clear_majority_wins_without_tiebreaker() {
        let e = engine(vec![
            FakeProvider::new("a", Script::Answer(Decision::Buy, 40.0, 0.9)),
            FakeProvider::new("b", Script::Answer(Decision::Buy, 44.0, 0.9)),
            FakeProvider::new("c", Script::Answer(Decision::Buy, 42.0, 0.9)),
            FakeProvider::new("d", Script::Answer(Decision::Sell, 10.0, 0.3)),
        ]);
        let result = e.analyze(ValuationRequest::new("Hot Wheels Redline")).await;
        assert_eq!(result.decision, Some(Decision::Buy));
        assert_eq!(result.status, ValuationStatus::Confident);
        assert!(!result.tiebreaker_used);
        assert!((result.estimated_value - 42.0).abs() < 1e-9);
        assert_eq!(result.category, "toys");
        assert_eq!(result.votes.len(), 4);
        assert_eq!(result.votes[0].provider_name, "A");
    }

    #[tokio::test]
    async fn failures_and_timeouts_are_reported_not_counted() {
        let e = engine(vec![
            FakeProvider::new("a", Script::Answer(Decision::Sell, 15.0, 0.8)),
            FakeProvider::new("b", Script::Fail),
            FakeProvider::new("c", Script::Hang),
        ]);
        let result = e.analyze(ValuationRequest::new("mug")).await;
        assert_eq!(result.votes.len(), 1);
        assert_eq!(result.failures.len(), 2);
        assert_eq!(result.failures[0].provider_id, "b");
        assert_eq!(result.failures[1].code, "timeout");
        // one usable vote of four wanted
        assert_eq!(result.status, ValuationStatus::LowConfidence);
    }

    #[tokio::test]
    async fn no_votes_is_undetermined() {
        let e = engine(vec![FakeProvider::new("a", Script::Fail)]);
        let result = e.analyze(ValuationRequest::new("")).await;
        assert!(result.is_undetermined());
        assert_eq!(result.decision, None);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.item_name, "Unknown item");
    }

    fn split() -> Vec<Arc<dyn ValuationProvider>> {
        vec![
            FakeProvider::new("a", Script::Answer(Decision::Buy, 40.0, 0.8)),
            FakeProvider::new("b", Script::Answer(Decision::Buy, 42.0, 0.8)),
            FakeProvider::new("c", Script::Answer(Decision::Sell, 10.0, 0.8)),
            FakeProvider::new("d", Script::Answer(Decision::Sell, 12.0, 0.8)),
        ]
    }

    #[tokio::test]
    async fn split_vote_is_broken_by_tiebreaker() {
        let mut providers = split();
        providers.push(FakeProvider::new("tb", Script::Answer(Decision::Buy, 41.0, 0.9)));
        let result = engine(providers).analyze(ValuationRequest::new("lamp")).await;

        assert!(result.tiebreaker_used);
        assert_eq!(result.tiebreaker.state, TiebreakerState::Resolved);
        assert_eq!(result.tiebreaker.provider_id.as_deref(), Some("tb"));
        assert_eq!(result.tiebreaker.pre_decision, Some(Decision::Sell));
        assert_eq!(result.decision, Some(Decision::Buy));
        assert!(result.tiebreaker.flipped);

        // held back from the primary round, appended once as a discounted vote
        assert_eq!(result.votes.len(), 5);
        let tb = result.votes.iter().find(|v| v.is_tiebreaker).unwrap();
        assert_eq!(tb.provider_id, "tb");
        assert!((tb.base_weight - 0.5).abs() < 1e-9);
        assert_eq!(result.tally.primary_votes, 4);
    }

    #[tokio::test]
    async fn failed_tiebreaker_keeps_primary_tally() {
        let mut providers = split();
        providers.push(FakeProvider::new("tb", Script::Fail));
        let result = engine(providers).analyze(ValuationRequest::new("lamp")).await;

        assert_eq!(result.tiebreaker.state, TiebreakerState::Failed);
        assert!(result.tiebreaker.error.is_some());
        assert_eq!(result.decision, Some(Decision::Sell));
        assert!(!result.tiebreaker.flipped);
        assert_eq!(result.votes.len(), 4);
        assert!(result.tally.is_close_vote);
    }

    #[tokio::test]
    async fn configured_tiebreaker_must_be_eligible() {
        let mut providers = split();
        providers.push(FakeProvider::new("tb", Script::Answer(Decision::Buy, 41.0, 0.9)));
        let mut registry = ProviderRegistry::new();
        for p in providers {
            registry.insert(p);
        }
        let mut config = EngineConfig {
            provider_timeout: Duration::from_millis(200),
            ..EngineConfig::default()
        };
        config.tiebreaker.provider = Some("c".to_string());
        let e = ValuationEngine::new(Arc::new(registry), Arc::new(CategoryClassifier::new()), config);

        let result = e.analyze(ValuationRequest::new("lamp")).await;
        assert_eq!(result.tiebreaker.provider_id.as_deref(), Some("tb"));
        assert_eq!(result.votes.iter().filter(|v| v.provider_id == "c").count(), 1);
        assert_eq!(result.decision, Some(Decision::Buy));
    }

    #[tokio::test]
    async fn close_vote_without_eligible_provider_fails_escalation() {
        let result = engine(split()).analyze(ValuationRequest::new("lamp")).await;
        assert!(result.tiebreaker_used);
        assert_eq!(result.tiebreaker.state, TiebreakerState::Failed);
        assert_eq!(result.decision, Some(Decision::Sell));
    }

    #[test]
    fn confidence_combines_share_certainty_and_sample_size() {
        let votes = vec![
            vote("a", Decision::Buy, 40.0, 0.8),
            vote("b", Decision::Buy, 40.0, 0.8),
            vote("c", Decision::Buy, 40.0, 0.8),
            vote("d", Decision::Buy, 40.0, 0.8),
        ];
        let t = tally(&votes, &WeightSnapshot::empty(), &TallyConfig::default());
        let c = result_confidence(&votes, &t, &TallyConfig::default());
        assert!((c - 0.8).abs() < 1e-9);

        let t = tally(&votes[..2], &WeightSnapshot::empty(), &TallyConfig::default());
        let c = result_confidence(&votes[..2], &t, &TallyConfig::default());
        assert!((c - 0.4).abs() < 1e-9);
    }
}
