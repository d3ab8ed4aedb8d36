//! Ensemble valuation: fan out to every provider, tally the votes, escalate
//! close calls to a tiebreaker.

pub mod engine;
pub mod tally;
pub mod tiebreaker;
pub mod types;

pub use engine::{EngineConfig, ValuationEngine};
pub use tally::{tally, vote_weight, TallyConfig, VoteTally, VoteWeight};
pub use tiebreaker::{TiebreakerConfig, TiebreakerResult};
pub use types::{
    ImageInput, ModelVote, ProviderFailure, TiebreakerOutcome, TiebreakerState, ValuationContext,
    ValuationRequest, ValuationResult, ValuationStatus,
};
