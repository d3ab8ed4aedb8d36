//! Request, vote and result types for one valuation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::gateway::ImageData;
use crate::providers::{Decision, ParsedAnalysis};

use super::tally::VoteTally;

// =============================================================================
// Request
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ImageInput {
    Bytes(Vec<u8>),
    Base64(String),
}

impl ImageInput {
    pub fn to_image_data(&self) -> ImageData {
        match self {
            ImageInput::Bytes(bytes) => ImageData::from_bytes(bytes),
            ImageInput::Base64(encoded) => ImageData::from_base64(encoded),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ValuationContext {
    pub asking_price: Option<f64>,
    pub location_hint: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ValuationRequest {
    pub images: Vec<ImageInput>,
    pub item_name_hint: String,
    pub context: ValuationContext,
}

impl ValuationRequest {
    pub fn new(item_name_hint: impl Into<String>) -> Self {
        Self {
            item_name_hint: item_name_hint.into(),
            ..Default::default()
        }
    }

    pub fn with_image(mut self, image: ImageInput) -> Self {
        self.images.push(image);
        self
    }

    pub fn with_asking_price(mut self, price: f64) -> Self {
        self.context.asking_price = Some(price);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.context.description = Some(description.into());
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.context.location_hint = Some(location.into());
        self
    }
}

// =============================================================================
// Votes
// =============================================================================

/// One provider's opinion on one request. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVote {
    pub provider_id: String,
    pub provider_name: String,
    pub analysis: ParsedAnalysis,
    /// Static weight used for this vote; tiebreaker votes carry the discounted value.
    pub base_weight: f64,
    pub response_time_ms: u64,
    pub is_tiebreaker: bool,
    /// Built from an unparseable response.
    pub fallback: bool,
    pub raw_response: String,
}

impl ModelVote {
    pub fn decision(&self) -> Decision {
        self.analysis.decision
    }

    /// Carries a real price prediction.
    pub fn is_usable(&self) -> bool {
        !self.fallback
    }
}

/// A provider call that produced no vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderFailure {
    pub provider_id: String,
    pub code: String,
    pub message: String,
    pub latency_ms: u64,
}

// =============================================================================
// Tiebreaker
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TiebreakerState {
    #[default]
    NotNeeded,
    Triggered,
    Resolved,
    Failed,
}

/// What escalation did, kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TiebreakerOutcome {
    pub state: TiebreakerState,
    pub provider_id: Option<String>,
    pub vote: Option<ModelVote>,
    pub error: Option<String>,
    pub response_time_ms: u64,
    /// Provider whose primary vote the tiebreaker endorsed, if any.
    pub selected_provider: Option<String>,
    pub pre_decision: Option<Decision>,
    pub final_decision: Option<Decision>,
    pub flipped: bool,
}

impl TiebreakerOutcome {
    pub fn not_needed() -> Self {
        Self::default()
    }
}

// =============================================================================
// Result
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValuationStatus {
    Confident,
    LowConfidence,
    /// No provider returned a usable vote.
    Undetermined,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValuationResult {
    pub valuation_id: Uuid,
    /// None when undetermined.
    pub decision: Option<Decision>,
    pub estimated_value: f64,
    pub confidence: f64,
    pub status: ValuationStatus,
    pub item_name: String,
    pub category: String,
    pub asking_price: Option<f64>,
    pub votes: Vec<ModelVote>,
    pub failures: Vec<ProviderFailure>,
    pub tally: VoteTally,
    pub tiebreaker_used: bool,
    pub tiebreaker: TiebreakerOutcome,
    pub processing_time_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl ValuationResult {
    pub fn is_undetermined(&self) -> bool {
        self.status == ValuationStatus::Undetermined
    }

    pub fn primary_votes(&self) -> impl Iterator<Item = &ModelVote> {
        self.votes.iter().filter(|v| !v.is_tiebreaker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_and_bytes_inputs_agree_on_media_type() {
        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        let from_bytes = ImageInput::Bytes(png.to_vec()).to_image_data();
        let from_b64 = ImageInput::Base64(from_bytes.base64.clone()).to_image_data();
        assert_eq!(from_bytes, from_b64);
        assert_eq!(from_bytes.media_type, "image/png");
    }

    #[test]
    fn request_builder_fills_context() {
        let req = ValuationRequest::new("lamp")
            .with_asking_price(12.0)
            .with_description("brass")
            .with_location("Austin, TX");
        assert_eq!(req.context.asking_price, Some(12.0));
        assert_eq!(req.context.description.as_deref(), Some("brass"));
        assert_eq!(req.context.location_hint.as_deref(), Some("Austin, TX"));
    }
}
