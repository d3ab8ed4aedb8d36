//! Valuation audit trail.

use serde::{Deserialize, Serialize};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::mpsc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::consensus::{ProviderFailure, TiebreakerState, ValuationResult, ValuationStatus};
use crate::prompts::PromptInstance;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteTrace {
    pub provider_id: String,
    pub decision: String,
    pub estimated_value: f64,
    pub confidence: f64,
    pub multiplier: f64,
    pub weight: f64,
    pub fallback: bool,
    pub is_tiebreaker: bool,
    pub response_time_ms: u64,
    pub raw_response: String,
}

/// One line per valuation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValuationTrace {
    pub timestamp_ms: i64,
    pub valuation_id: String,
    pub prompt_template_slug: String,
    pub prompt_hash: String,
    pub category: String,
    pub item_name: String,
    pub decision: Option<String>,
    pub estimated_value: f64,
    pub confidence: f64,
    pub status: ValuationStatus,
    pub buy_weight: f64,
    pub sell_weight: f64,
    pub weight_difference: f64,
    pub is_close_vote: bool,
    pub tiebreaker_state: TiebreakerState,
    pub tiebreaker_provider: Option<String>,
    pub tiebreaker_flipped: bool,
    pub tiebreaker_error: Option<String>,
    pub votes: Vec<VoteTrace>,
    pub failures: Vec<ProviderFailure>,
    pub processing_time_ms: u64,
}

impl ValuationTrace {
    pub fn from_result(result: &ValuationResult, prompt: &PromptInstance) -> Self {
        let votes = result
            .votes
            .iter()
            .zip(&result.tally.weights)
            .map(|(v, w)| VoteTrace {
                provider_id: v.provider_id.clone(),
                decision: v.decision().as_str().to_string(),
                estimated_value: v.analysis.estimated_value,
                confidence: v.analysis.confidence,
                multiplier: w.multiplier,
                weight: w.weight,
                fallback: v.fallback,
                is_tiebreaker: v.is_tiebreaker,
                response_time_ms: v.response_time_ms,
                raw_response: v.raw_response.clone(),
            })
            .collect();

        Self {
            timestamp_ms: now_epoch_ms(),
            valuation_id: result.valuation_id.to_string(),
            prompt_template_slug: prompt.template_slug.clone(),
            prompt_hash: prompt.hash(),
            category: result.category.clone(),
            item_name: result.item_name.clone(),
            decision: result.decision.map(|d| d.as_str().to_string()),
            estimated_value: result.estimated_value,
            confidence: result.confidence,
            status: result.status,
            buy_weight: result.tally.buy_weight,
            sell_weight: result.tally.sell_weight,
            weight_difference: result.tally.weight_difference,
            is_close_vote: result.tally.is_close_vote,
            tiebreaker_state: result.tiebreaker.state,
            tiebreaker_provider: result.tiebreaker.provider_id.clone(),
            tiebreaker_flipped: result.tiebreaker.flipped,
            tiebreaker_error: result.tiebreaker.error.clone(),
            votes,
            failures: result.failures.clone(),
            processing_time_ms: result.processing_time_ms,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("trace channel closed")]
    Closed,
    #[error("trace worker failed: {0}")]
    Join(String),
}

pub trait TraceSink: Send + Sync {
    fn record(&self, event: ValuationTrace) -> Result<(), TraceError>;
}

#[derive(Clone)]
pub struct JsonlTraceSink {
    sender: mpsc::Sender<ValuationTrace>,
}

/// Owns the writer thread. Drop every sink clone, then `join` to flush.
pub struct TraceWorker {
    handle: Option<std::thread::JoinHandle<Result<(), TraceError>>>,
}

impl TraceWorker {
    pub fn join(mut self) -> Result<(), TraceError> {
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(TraceError::Join("trace worker panicked".to_string())),
            },
            None => Ok(()),
        }
    }
}

impl JsonlTraceSink {
    /// Appends to `path`, creating it if needed.
    pub fn new(path: impl AsRef<Path>) -> Result<(Self, TraceWorker), TraceError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let (sender, receiver) = mpsc::channel::<ValuationTrace>();
        let handle = std::thread::spawn(move || write_trace_loop(file, receiver));
        Ok((
            Self { sender },
            TraceWorker {
                handle: Some(handle),
            },
        ))
    }
}

impl TraceSink for JsonlTraceSink {
    fn record(&self, event: ValuationTrace) -> Result<(), TraceError> {
        self.sender.send(event).map_err(|_| TraceError::Closed)
    }
}

fn write_trace_loop(
    file: std::fs::File,
    receiver: mpsc::Receiver<ValuationTrace>,
) -> Result<(), TraceError> {
    let mut writer = BufWriter::new(file);
    for event in receiver {
        let line = serde_json::to_string(&event).map_err(|e| TraceError::Serde(e.to_string()))?;
        writeln!(writer, "{line}")?;
    }
    writer.flush()?;
    Ok(())
}

pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
