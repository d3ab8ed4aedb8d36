use std::sync::Arc;
use std::time::Duration;

use ensemble_appraiser::gateway::NoopUsageSink;
use ensemble_appraiser::providers::{AdapterConfig, ApiFlavor, Capabilities};
use ensemble_appraiser::{
    CategoryClassifier, Decision, EngineConfig, ProviderConfig, ProviderRegistry,
    ResolvedProvider, TiebreakerState, ValuationEngine, ValuationRequest, ValuationStatus,
};
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn provider(server: &MockServer, id: &str, flavor: ApiFlavor, tiebreaker: bool) -> ProviderConfig {
    ProviderConfig {
        id: id.to_string(),
        display_name: id.to_uppercase(),
        model: format!("{id}-model"),
        flavor,
        base_url: format!("{}/{id}", server.uri()),
        capabilities: Capabilities {
            tiebreaker_eligible: tiebreaker,
            ..Capabilities::default()
        },
        base_weight: 1.0,
        credential_env: format!("{}_API_KEY", id.to_uppercase()),
        enabled: true,
        timeout_seconds: None,
    }
}

fn chat_answer(content: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{
            "message": { "content": content.to_string() },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 100, "completion_tokens": 40 }
    }))
}

fn anthropic_answer(content: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "content": [{ "type": "text", "text": content.to_string() }],
        "stop_reason": "end_turn",
        "usage": { "input_tokens": 100, "output_tokens": 40 }
    }))
}

fn vote(decision: &str, value: f64, confidence: f64) -> Value {
    json!({
        "itemName": "Hot Wheels 1968 Custom Camaro",
        "estimatedValue": value,
        "decision": decision,
        "valuation_factors": ["redline wheels", "original paint"],
        "summary_reasoning": "Early redline cars sell well.",
        "confidence": confidence
    })
}

async fn mount_chat(server: &MockServer, id: &str, response: ResponseTemplate) {
    Mock::given(method("POST"))
        .and(path(format!("/{id}/chat/completions")))
        .respond_with(response)
        .mount(server)
        .await;
}

fn engine(configs: Vec<ProviderConfig>, missing_key: &[&str]) -> ValuationEngine {
    let resolved: Vec<ResolvedProvider> = configs
        .into_iter()
        .map(|c| {
            let key = (!missing_key.contains(&c.id.as_str())).then(|| "sk-test".to_string());
            ResolvedProvider::new(c, key)
        })
        .collect();
    let adapter = AdapterConfig {
        timeout_seconds: 5,
        max_retries: 0,
        retry_base_delay_ms: 0,
        ..AdapterConfig::default()
    };
    let registry = ProviderRegistry::from_resolved(&resolved, Arc::new(NoopUsageSink), &adapter);
    ValuationEngine::new(
        Arc::new(registry),
        Arc::new(CategoryClassifier::new()),
        EngineConfig {
            provider_timeout: Duration::from_secs(5),
            ..EngineConfig::default()
        },
    )
}

fn request() -> ValuationRequest {
    ValuationRequest::new("hot wheels camaro redline").with_asking_price(15.0)
}

#[tokio::test]
async fn majority_buy_prices_from_agreeing_votes_only() {
    let server = MockServer::start().await;
    mount_chat(&server, "a", chat_answer(vote("BUY", 40.0, 0.9))).await;
    mount_chat(&server, "b", chat_answer(vote("BUY", 42.0, 0.9))).await;
    mount_chat(&server, "c", chat_answer(vote("BUY", 45.0, 0.9))).await;
    mount_chat(&server, "d", chat_answer(vote("SELL", 10.0, 0.2))).await;
    Mock::given(method("POST"))
        .and(path("/e/messages"))
        .respond_with(anthropic_answer(vote("BUY", 38.0, 0.9)))
        .mount(&server)
        .await;

    let configs = vec![
        provider(&server, "a", ApiFlavor::OpenAiCompatible, false),
        provider(&server, "b", ApiFlavor::OpenAiCompatible, false),
        provider(&server, "c", ApiFlavor::OpenAiCompatible, false),
        provider(&server, "d", ApiFlavor::OpenAiCompatible, false),
        provider(&server, "e", ApiFlavor::Anthropic, false),
    ];
    let result = engine(configs, &[]).analyze(request()).await;

    assert_eq!(result.decision, Some(Decision::Buy));
    assert_eq!(result.status, ValuationStatus::Confident);
    assert_eq!(result.category, "toys");
    assert_eq!(result.votes.len(), 5);
    assert!(result.failures.is_empty());
    assert!(!result.tiebreaker_used);
    // equal weights on the BUY side: plain mean of 40, 42, 45, 38
    assert!((result.estimated_value - 41.25).abs() < 1e-9);
    assert_eq!(result.item_name, "Hot Wheels 1968 Custom Camaro");
    // sub-floor confidence is raised to the floor default
    let d = result.votes.iter().find(|v| v.provider_id == "d").unwrap();
    assert_eq!(d.analysis.confidence, 0.5);
}

#[tokio::test]
async fn one_survivor_is_low_confidence_and_failures_are_listed() {
    let server = MockServer::start().await;
    mount_chat(&server, "a", chat_answer(vote("BUY", 40.0, 0.9))).await;
    mount_chat(&server, "b", ResponseTemplate::new(500)).await;
    mount_chat(&server, "c", ResponseTemplate::new(401)).await;

    let configs = vec![
        provider(&server, "a", ApiFlavor::OpenAiCompatible, false),
        provider(&server, "b", ApiFlavor::OpenAiCompatible, false),
        provider(&server, "c", ApiFlavor::OpenAiCompatible, false),
        provider(&server, "d", ApiFlavor::OpenAiCompatible, false),
    ];
    let result = engine(configs, &["d"]).analyze(request()).await;

    assert_eq!(result.decision, Some(Decision::Buy));
    assert_eq!(result.status, ValuationStatus::LowConfidence);
    assert!(result.confidence < 0.5);
    assert_eq!(result.votes.len(), 1);

    let codes: Vec<(&str, &str)> = result
        .failures
        .iter()
        .map(|f| (f.provider_id.as_str(), f.code.as_str()))
        .collect();
    assert_eq!(
        codes,
        vec![
            ("b", "provider_error"),
            ("c", "auth_failed"),
            ("d", "provider_unavailable")
        ]
    );
}

#[tokio::test]
async fn unparseable_answers_only_is_undetermined() {
    let server = MockServer::start().await;
    mount_chat(
        &server,
        "a",
        ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": "Looks like a nice toy car." }, "finish_reason": "stop" }]
        })),
    )
    .await;
    mount_chat(&server, "b", ResponseTemplate::new(500)).await;

    let configs = vec![
        provider(&server, "a", ApiFlavor::OpenAiCompatible, false),
        provider(&server, "b", ApiFlavor::OpenAiCompatible, false),
    ];
    let result = engine(configs, &[]).analyze(request()).await;

    assert!(result.is_undetermined());
    assert_eq!(result.decision, None);
    assert_eq!(result.confidence, 0.0);
    assert_eq!(result.votes.len(), 1);
    assert!(result.votes[0].fallback);
    assert_eq!(result.votes[0].raw_response, "Looks like a nice toy car.");
}

#[tokio::test]
async fn prose_answers_cannot_outvote_the_only_real_vote() {
    let server = MockServer::start().await;
    let prose = || {
        ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": "Hard to say, could go either way." }, "finish_reason": "stop" }]
        }))
    };
    mount_chat(&server, "a", chat_answer(vote("BUY", 40.0, 0.9))).await;
    mount_chat(&server, "b", prose()).await;
    mount_chat(&server, "c", prose()).await;

    let configs = vec![
        provider(&server, "a", ApiFlavor::OpenAiCompatible, false),
        provider(&server, "b", ApiFlavor::OpenAiCompatible, false),
        provider(&server, "c", ApiFlavor::OpenAiCompatible, false),
    ];
    let result = engine(configs, &[]).analyze(request()).await;

    assert_eq!(result.decision, Some(Decision::Buy));
    assert!((result.estimated_value - 40.0).abs() < 1e-9);
    assert_eq!(result.status, ValuationStatus::LowConfidence);
    assert_eq!(result.votes.len(), 3);
    assert_eq!(result.votes.iter().filter(|v| v.fallback).count(), 2);
    assert_eq!(result.tally.sell_weight, 0.0);
    // share 1.0 x confidence 0.9 x one usable vote of four
    assert!((result.confidence - 0.225).abs() < 1e-9);
}

#[tokio::test]
async fn two_two_split_escalates_to_tiebreaker_with_vote_digest() {
    let server = MockServer::start().await;
    mount_chat(&server, "a", chat_answer(vote("BUY", 40.0, 0.8))).await;
    mount_chat(&server, "b", chat_answer(vote("BUY", 44.0, 0.8))).await;
    mount_chat(&server, "c", chat_answer(vote("SELL", 12.0, 0.8))).await;
    mount_chat(&server, "d", chat_answer(vote("SELL", 14.0, 0.8))).await;
    mount_chat(
        &server,
        "tb",
        chat_answer(json!({
            "selected_provider": "a",
            "itemName": "Hot Wheels 1968 Custom Camaro",
            "estimatedValue": 30,
            "decision": "SELL",
            "confidence": 0.9
        })),
    )
    .await;

    let configs = vec![
        provider(&server, "a", ApiFlavor::OpenAiCompatible, false),
        provider(&server, "b", ApiFlavor::OpenAiCompatible, false),
        provider(&server, "c", ApiFlavor::OpenAiCompatible, false),
        provider(&server, "d", ApiFlavor::OpenAiCompatible, false),
        provider(&server, "tb", ApiFlavor::OpenAiCompatible, true),
    ];
    let result = engine(configs, &[]).analyze(request()).await;

    assert!(result.tiebreaker_used);
    assert_eq!(result.tiebreaker.state, TiebreakerState::Resolved);
    assert_eq!(result.tiebreaker.selected_provider.as_deref(), Some("a"));
    assert_eq!(result.tiebreaker.pre_decision, Some(Decision::Sell));
    // endorsing "a" adopts its BUY at $40
    assert_eq!(result.decision, Some(Decision::Buy));
    assert!(result.tiebreaker.flipped);
    let tb = result.votes.iter().find(|v| v.is_tiebreaker).unwrap();
    assert_eq!(tb.analysis.estimated_value, 40.0);
    assert!((tb.base_weight - 0.5).abs() < 1e-9);

    // the tiebreaker saw every primary vote and was not part of the primary round
    let received = server.received_requests().await.unwrap();
    let tb_calls: Vec<_> = received
        .iter()
        .filter(|r| r.url.path() == "/tb/chat/completions")
        .collect();
    assert_eq!(tb_calls.len(), 1);
    let body: Value = serde_json::from_slice(&tb_calls[0].body).unwrap();
    let user = body["messages"][1]["content"].as_str().unwrap();
    assert!(user.contains("<panel_votes>"));
    assert!(user.contains("- a: $40.00 BUY"));
    assert!(user.contains("- d: $14.00 SELL"));
}

#[tokio::test]
async fn tiebreaker_failure_leaves_primary_decision() {
    let server = MockServer::start().await;
    mount_chat(&server, "a", chat_answer(vote("BUY", 40.0, 0.8))).await;
    mount_chat(&server, "b", chat_answer(vote("BUY", 44.0, 0.8))).await;
    mount_chat(&server, "c", chat_answer(vote("SELL", 12.0, 0.8))).await;
    mount_chat(&server, "d", chat_answer(vote("SELL", 14.0, 0.8))).await;
    mount_chat(&server, "tb", ResponseTemplate::new(503)).await;

    let configs = vec![
        provider(&server, "a", ApiFlavor::OpenAiCompatible, false),
        provider(&server, "b", ApiFlavor::OpenAiCompatible, false),
        provider(&server, "c", ApiFlavor::OpenAiCompatible, false),
        provider(&server, "d", ApiFlavor::OpenAiCompatible, false),
        provider(&server, "tb", ApiFlavor::OpenAiCompatible, true),
    ];
    let result = engine(configs, &[]).analyze(request()).await;

    assert!(result.tiebreaker_used);
    assert_eq!(result.tiebreaker.state, TiebreakerState::Failed);
    assert!(result.tiebreaker.error.is_some());
    assert_eq!(result.decision, Some(Decision::Sell));
    assert_eq!(result.tiebreaker.final_decision, Some(Decision::Sell));
    assert!(!result.tiebreaker.flipped);
    assert_eq!(result.votes.len(), 4);
    assert!((result.estimated_value - 13.0).abs() < 1e-9);
}
