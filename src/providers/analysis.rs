//! Parsed provider answers and the lenient parser that produces them.
//!
//! Implements the contract between a provider's raw text and a vote: anything
//! recoverable is recovered, anything missing degrades to a safe default, and
//! only a response with no JSON object at all is a parse failure.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::json_extract::parse_json_object;

/// Upper bound on valuation factors kept per answer.
const MAX_FACTORS: usize = 12;

/// BUY/SELL recommendation. SELL is the conservative default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Buy,
    #[default]
    Sell,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Buy => "BUY",
            Decision::Sell => "SELL",
        }
    }

    /// Lenient parse of a model's decision string.
    pub fn parse_lenient(s: &str) -> Option<Self> {
        let l = s.trim().to_lowercase();
        if l.is_empty() {
            return None;
        }
        const SELL: &[&str] = &["sell", "pass", "skip", "no", "avoid", "don't buy", "do not buy"];
        const BUY: &[&str] = &["buy", "yes", "purchase", "strong buy"];
        if SELL.iter().any(|p| l.starts_with(p)) {
            Some(Decision::Sell)
        } else if BUY.iter().any(|p| l.starts_with(p)) {
            Some(Decision::Buy)
        } else {
            None
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One provider's normalized valuation opinion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedAnalysis {
    #[serde(rename = "itemName")]
    pub item_name: String,
    #[serde(rename = "estimatedValue")]
    pub estimated_value: f64,
    pub decision: Decision,
    pub valuation_factors: Vec<String>,
    pub summary_reasoning: String,
    pub confidence: f64,
}

/// Confidence normalization knobs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidencePolicy {
    /// Reported confidence below this is replaced by `floor_default`.
    pub floor: f64,
    /// Value substituted for sub-floor (or missing) confidence.
    pub floor_default: f64,
    /// Confidence given to fallback answers built from unparseable output.
    pub fallback: f64,
}

impl Default for ConfidencePolicy {
    fn default() -> Self {
        Self {
            floor: 0.5,
            floor_default: 0.5,
            fallback: 0.5,
        }
    }
}

impl ConfidencePolicy {
    /// Normalize a reported confidence into [0, 1] and apply the floor.
    ///
    /// Percent-style values (e.g. `85`) are rescaled.
    pub fn normalize(&self, reported: Option<f64>) -> f64 {
        let Some(c) = reported.filter(|c| c.is_finite()) else {
            return self.floor_default;
        };
        let c = if c > 1.0 && c <= 100.0 { c / 100.0 } else { c };
        let c = c.clamp(0.0, 1.0);
        if c < self.floor {
            self.floor_default
        } else {
            c
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AnalysisParseError {
    #[error("no JSON object in response")]
    NoJson,
}

impl ParsedAnalysis {
    /// Conservative stand-in used when a response cannot be parsed at all.
    pub fn fallback(item_hint: &str, policy: &ConfidencePolicy) -> Self {
        Self {
            item_name: item_hint.to_string(),
            estimated_value: 0.0,
            decision: Decision::Sell,
            valuation_factors: Vec::new(),
            summary_reasoning: "Provider response could not be parsed.".to_string(),
            confidence: policy.fallback,
        }
    }
}

/// Parse a raw provider response.
///
/// Missing or malformed fields fall back to defaults: item name from the hint,
/// value 0, decision SELL, no factors, floor-default confidence.
pub fn parse_analysis(
    raw: &str,
    item_hint: &str,
    policy: &ConfidencePolicy,
) -> Result<ParsedAnalysis, AnalysisParseError> {
    let value = parse_json_object(raw).ok_or(AnalysisParseError::NoJson)?;
    Ok(analysis_from_value(&value, item_hint, policy))
}

pub(crate) fn analysis_from_value(
    value: &Value,
    item_hint: &str,
    policy: &ConfidencePolicy,
) -> ParsedAnalysis {
    let item_name = field(value, &["itemName", "item_name", "name", "item"])
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(item_hint)
        .to_string();

    let estimated_value = field(
        value,
        &["estimatedValue", "estimated_value", "value", "price", "estimatedPrice"],
    )
    .and_then(lenient_amount)
    .unwrap_or(0.0);

    let decision = field(value, &["decision", "recommendation", "verdict"])
        .and_then(|v| match v {
            Value::String(s) => Decision::parse_lenient(s),
            Value::Bool(true) => Some(Decision::Buy),
            Value::Bool(false) => Some(Decision::Sell),
            _ => None,
        })
        .unwrap_or_default();

    let valuation_factors = field(value, &["valuation_factors", "valuationFactors", "factors"])
        .map(lenient_factors)
        .unwrap_or_default();

    let summary_reasoning = field(
        value,
        &["summary_reasoning", "summaryReasoning", "reasoning", "summary"],
    )
    .and_then(Value::as_str)
    .map(|s| s.trim().to_string())
    .unwrap_or_default();

    let confidence = policy.normalize(field(value, &["confidence"]).and_then(lenient_number));

    ParsedAnalysis {
        item_name,
        estimated_value,
        decision,
        valuation_factors,
        summary_reasoning,
        confidence,
    }
}

fn field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .find_map(|k| value.get(*k))
        .filter(|v| !v.is_null())
}

fn lenient_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').trim().parse().ok(),
        _ => None,
    }
}

/// Monetary amount: numbers, "$1,200.50", or ranges like "40-50" (midpoint).
fn lenient_amount(v: &Value) -> Option<f64> {
    let amount = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let cleaned: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || matches!(c, '.' | '-'))
                .collect();
            let parts: Vec<f64> = cleaned
                .split('-')
                .filter(|p| !p.is_empty())
                .filter_map(|p| p.parse::<f64>().ok())
                .collect();
            match parts.as_slice() {
                [] => None,
                [single] => Some(*single),
                [lo, hi, ..] => Some((lo + hi) / 2.0),
            }
        }
        _ => None,
    }?;
    amount.is_finite().then(|| amount.max(0.0))
}

fn lenient_factors(v: &Value) -> Vec<String> {
    let raw: Vec<String> = match v {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Object(_) => item
                    .get("factor")
                    .or_else(|| item.get("name"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .collect(),
        Value::String(s) => s.split(['\n', ';']).map(str::to_string).collect(),
        _ => Vec::new(),
    };
    raw.into_iter()
        .map(|s| s.trim().trim_start_matches(['-', '*', '•']).trim().to_string())
        .filter(|s| !s.is_empty())
        .take(MAX_FACTORS)
        .collect()
}
