//! Accuracy benchmarks recorded once an item's real sale price is known.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::consensus::ValuationResult;
use crate::providers::Decision;

/// One provider's prediction scored against ground truth. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkRecord {
    pub provider_id: String,
    pub category: String,
    /// Signed: (predicted - actual) / actual * 100.
    pub price_error_percent: f64,
    pub decision_correct: bool,
    pub recorded_at: DateTime<Utc>,
    #[serde(default)]
    pub valuation_id: Option<Uuid>,
    #[serde(default)]
    pub predicted_value: f64,
    #[serde(default)]
    pub actual_value: f64,
}

impl BenchmarkRecord {
    pub fn new(
        provider_id: impl Into<String>,
        category: impl Into<String>,
        price_error_percent: f64,
        decision_correct: bool,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            category: category.into(),
            price_error_percent,
            decision_correct,
            recorded_at,
            valuation_id: None,
            predicted_value: 0.0,
            actual_value: 0.0,
        }
    }

    /// Within `band_percent` of the actual price, either direction.
    pub fn is_accurate(&self, band_percent: f64) -> bool {
        self.price_error_percent.is_finite() && self.price_error_percent.abs() <= band_percent
    }
}

/// What actually happened to the item.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroundTruth {
    pub actual_value: f64,
    /// Known right answer. When absent it is derived from the asking price.
    #[serde(default)]
    pub correct_decision: Option<Decision>,
}

impl GroundTruth {
    pub fn sold_for(actual_value: f64) -> Self {
        Self {
            actual_value,
            correct_decision: None,
        }
    }

    pub fn with_decision(mut self, decision: Decision) -> Self {
        self.correct_decision = Some(decision);
        self
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum BenchmarkError {
    #[error("actual value must be positive, got {0}")]
    NonPositiveActual(f64),
    #[error("no correct decision given and the valuation has no asking price to derive one")]
    UnknownDecision,
}

/// Score every real vote of a finished valuation. Fallback votes carry no
/// prediction and are skipped.
pub fn records_from_outcome(
    result: &ValuationResult,
    truth: &GroundTruth,
    recorded_at: DateTime<Utc>,
) -> Result<Vec<BenchmarkRecord>, BenchmarkError> {
    if !(truth.actual_value.is_finite() && truth.actual_value > 0.0) {
        return Err(BenchmarkError::NonPositiveActual(truth.actual_value));
    }
    let correct = match (truth.correct_decision, result.asking_price) {
        (Some(decision), _) => decision,
        (None, Some(asking)) if truth.actual_value > asking => Decision::Buy,
        (None, Some(_)) => Decision::Sell,
        (None, None) => return Err(BenchmarkError::UnknownDecision),
    };

    Ok(result
        .votes
        .iter()
        .filter(|v| !v.fallback)
        .map(|v| {
            let predicted = v.analysis.estimated_value;
            BenchmarkRecord {
                provider_id: v.provider_id.clone(),
                category: result.category.clone(),
                price_error_percent: (predicted - truth.actual_value) / truth.actual_value * 100.0,
                decision_correct: v.analysis.decision == correct,
                recorded_at,
                valuation_id: Some(result.valuation_id),
                predicted_value: predicted,
                actual_value: truth.actual_value,
            }
        })
        .collect())
}
