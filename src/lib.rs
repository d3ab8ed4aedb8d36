#![forbid(unsafe_code)]

//! # ensemble-appraiser
//!
//! Resale valuation by committee. Every configured inference provider looks at
//! the same item in parallel and answers BUY or SELL with a price; the answers
//! are combined into one weighted decision. Close calls go to a dedicated
//! tiebreaker pass, and each provider's weight is recalibrated from how close
//! its past predictions came to real sale prices.
//!
//! The entry point is [`ValuationEngine::analyze`].

pub mod benchmark;
pub mod category;
pub mod config;
pub mod consensus;
pub mod gateway;
pub mod json_extract;
pub mod logging;
pub mod prompts;
pub mod providers;
pub mod self_heal;
pub mod store;
pub mod trace;

pub use benchmark::{records_from_outcome, BenchmarkError, BenchmarkRecord, GroundTruth};
pub use category::{CategoryClassifier, CategoryOverride, Classification};
pub use config::{ConfigError, EnsembleConfig};
pub use consensus::{
    tally, EngineConfig, ImageInput, ModelVote, TallyConfig, TiebreakerConfig, TiebreakerState,
    ValuationEngine, ValuationRequest, ValuationResult, ValuationStatus, VoteTally,
};
pub use gateway::{Attribution, ChatGateway, ProviderError, ProviderGateway, UsageSink};
pub use providers::{
    Decision, ParsedAnalysis, ProviderConfig, ProviderRegistry, ResolvedProvider, ValuationProvider,
};
pub use self_heal::{SelfHealConfig, SelfHealEngine, WeightCache, WeightReport, WeightSnapshot};
pub use store::{BenchmarkStore, SqliteBenchmarkStore, StoreError};
pub use trace::{JsonlTraceSink, TraceError, TraceSink, TraceWorker, ValuationTrace};
