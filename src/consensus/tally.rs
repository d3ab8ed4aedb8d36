//! Weighted BUY/SELL tally. Pure: no I/O, no shared state.

use serde::{Deserialize, Serialize};

use crate::providers::Decision;
use crate::self_heal::WeightSnapshot;

use super::types::ModelVote;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TallyConfig {
    pub close_vote_threshold: f64,
    /// Fewer primary votes than this never counts as a close vote.
    pub min_primary_votes: usize,
    /// Result confidence below this is flagged low-confidence.
    pub low_confidence_threshold: f64,
}

impl Default for TallyConfig {
    fn default() -> Self {
        Self {
            close_vote_threshold: 0.15,
            min_primary_votes: 4,
            low_confidence_threshold: 0.5,
        }
    }
}

/// How much one vote counted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteWeight {
    pub provider_id: String,
    pub base_weight: f64,
    pub multiplier: f64,
    pub confidence: f64,
    /// base_weight * multiplier * confidence; zero for fallback votes.
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteTally {
    pub buy_weight: f64,
    pub sell_weight: f64,
    pub decision: Decision,
    /// |buy - sell| / (buy + sell); 0 when nothing carried weight.
    pub weight_difference: f64,
    pub is_close_vote: bool,
    pub primary_votes: usize,
    /// Votes with a real prediction (fallbacks excluded).
    /// Only usable primary votes count toward `min_primary_votes`.
    pub usable_votes: usize,
    /// Weighted mean price of usable votes agreeing with `decision`.
    pub consensus_value: Option<f64>,
    /// Parallel to the input votes.
    pub weights: Vec<VoteWeight>,
}

impl VoteTally {
    pub fn total_weight(&self) -> f64 {
        self.buy_weight + self.sell_weight
    }

    pub fn winning_weight(&self) -> f64 {
        match self.decision {
            Decision::Buy => self.buy_weight,
            Decision::Sell => self.sell_weight,
        }
    }
}

/// Weight of a single vote under the given multipliers. A fallback vote is
/// neutral: listed, but it carries no weight toward either side.
pub fn vote_weight(vote: &ModelVote, weights: &WeightSnapshot) -> VoteWeight {
    let base_weight = sanitize(vote.base_weight);
    let multiplier = sanitize(weights.multiplier(&vote.provider_id));
    let confidence = sanitize(vote.analysis.confidence);
    let weight = if vote.fallback {
        0.0
    } else {
        base_weight * multiplier * confidence
    };
    VoteWeight {
        provider_id: vote.provider_id.clone(),
        base_weight,
        multiplier,
        confidence,
        weight,
    }
}

pub fn tally(votes: &[ModelVote], weights: &WeightSnapshot, config: &TallyConfig) -> VoteTally {
    let vote_weights: Vec<VoteWeight> = votes.iter().map(|v| vote_weight(v, weights)).collect();

    let mut buy_weight = 0.0;
    let mut sell_weight = 0.0;
    for (vote, w) in votes.iter().zip(&vote_weights) {
        match vote.decision() {
            Decision::Buy => buy_weight += w.weight,
            Decision::Sell => sell_weight += w.weight,
        }
    }

    let total = buy_weight + sell_weight;
    let (decision, weight_difference) = if total > 0.0 {
        let decision = if buy_weight > sell_weight {
            Decision::Buy
        } else {
            Decision::Sell
        };
        (decision, (buy_weight - sell_weight).abs() / total)
    } else {
        (Decision::Sell, 0.0)
    };

    let primary_votes = votes.iter().filter(|v| !v.is_tiebreaker).count();
    let usable_primary = votes.iter().filter(|v| !v.is_tiebreaker && v.is_usable()).count();
    let is_close_vote = weight_difference < config.close_vote_threshold
        && usable_primary >= config.min_primary_votes;

    VoteTally {
        buy_weight,
        sell_weight,
        decision,
        weight_difference,
        is_close_vote,
        primary_votes,
        usable_votes: votes.iter().filter(|v| v.is_usable()).count(),
        consensus_value: consensus_value(votes, &vote_weights, decision),
        weights: vote_weights,
    }
}

/// Losing-side votes still count toward the tally but not the price.
fn consensus_value(votes: &[ModelVote], weights: &[VoteWeight], decision: Decision) -> Option<f64> {
    let agreeing: Vec<(f64, f64)> = votes
        .iter()
        .zip(weights)
        .filter(|(v, _)| v.is_usable() && v.decision() == decision)
        .map(|(v, w)| (v.analysis.estimated_value, w.weight))
        .collect();
    if agreeing.is_empty() {
        return None;
    }
    let weight_sum: f64 = agreeing.iter().map(|(_, w)| w).sum();
    if weight_sum > 0.0 {
        Some(agreeing.iter().map(|(price, w)| price * w).sum::<f64>() / weight_sum)
    } else {
        Some(agreeing.iter().map(|(price, _)| price).sum::<f64>() / agreeing.len() as f64)
    }
}

fn sanitize(x: f64) -> f64 {
    if x.is_finite() {
        x.max(0.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::test_support::vote;

    fn cfg() -> TallyConfig {
        TallyConfig::default()
    }

    #[test]
    fn two_by_two_split_is_close() {
        let votes = vec![
            vote("a", Decision::Buy, 40.0, 0.8),
            vote("b", Decision::Buy, 42.0, 0.8),
            vote("c", Decision::Sell, 10.0, 0.8),
            vote("d", Decision::Sell, 12.0, 0.8),
        ];
        let t = tally(&votes, &WeightSnapshot::empty(), &cfg());
        assert_eq!(t.weight_difference, 0.0);
        assert!(t.is_close_vote);
        // tie goes to SELL
        assert_eq!(t.decision, Decision::Sell);
        assert!((t.consensus_value.unwrap() - 11.0).abs() < 1e-9);
    }

    #[test]
    fn two_votes_are_never_close() {
        let votes = vec![
            vote("a", Decision::Buy, 40.0, 0.8),
            vote("b", Decision::Sell, 10.0, 0.8),
        ];
        let t = tally(&votes, &WeightSnapshot::empty(), &cfg());
        assert_eq!(t.weight_difference, 0.0);
        assert!(!t.is_close_vote);
    }

    #[test]
    fn tiebreaker_votes_do_not_count_toward_minimum() {
        let mut tb = vote("tb", Decision::Buy, 40.0, 0.8);
        tb.is_tiebreaker = true;
        let votes = vec![
            vote("a", Decision::Buy, 40.0, 0.8),
            vote("b", Decision::Buy, 40.0, 0.8),
            vote("c", Decision::Sell, 40.0, 0.8),
            tb,
        ];
        let t = tally(&votes, &WeightSnapshot::empty(), &cfg());
        assert_eq!(t.primary_votes, 3);
        assert!(!t.is_close_vote);
    }

    #[test]
    fn multipliers_scale_weight() {
        let votes = vec![
            vote("a", Decision::Buy, 40.0, 1.0),
            vote("b", Decision::Sell, 10.0, 1.0),
        ];
        let snapshot = WeightSnapshot::from_multipliers([("b".to_string(), 1.5)]);
        let t = tally(&votes, &snapshot, &cfg());
        assert_eq!(t.decision, Decision::Sell);
        assert!((t.sell_weight - 1.5).abs() < 1e-9);
        assert!((t.weight_difference - 0.2).abs() < 1e-9);
    }

    #[test]
    fn zero_total_weight_defaults_to_sell() {
        let mut a = vote("a", Decision::Buy, 40.0, 0.8);
        a.base_weight = 0.0;
        let t = tally(&[a], &WeightSnapshot::empty(), &cfg());
        assert_eq!(t.decision, Decision::Sell);
        assert_eq!(t.weight_difference, 0.0);
        assert_eq!(t.consensus_value, None);
    }

    fn fallback(id: &str) -> ModelVote {
        let mut fb = vote(id, Decision::Sell, 0.0, 0.5);
        fb.fallback = true;
        fb
    }

    #[test]
    fn fallback_votes_are_listed_but_carry_no_weight() {
        let votes = vec![vote("a", Decision::Buy, 40.0, 0.9), fallback("b"), fallback("c")];
        let t = tally(&votes, &WeightSnapshot::empty(), &cfg());
        assert_eq!(t.decision, Decision::Buy);
        assert!((t.buy_weight - 0.9).abs() < 1e-9);
        assert_eq!(t.sell_weight, 0.0);
        assert_eq!(t.weights.len(), 3);
        assert_eq!(t.weights[1].weight, 0.0);
        assert_eq!(t.usable_votes, 1);
        assert!((t.consensus_value.unwrap() - 40.0).abs() < 1e-9);
    }

    #[test]
    fn fallbacks_do_not_fill_the_close_vote_minimum() {
        let votes = vec![
            vote("a", Decision::Buy, 40.0, 0.8),
            vote("b", Decision::Sell, 10.0, 0.8),
            fallback("c"),
            fallback("d"),
        ];
        let t = tally(&votes, &WeightSnapshot::empty(), &cfg());
        assert_eq!(t.primary_votes, 4);
        assert_eq!(t.weight_difference, 0.0);
        assert!(!t.is_close_vote);
    }

    #[test]
    fn side_weights_sum_to_per_vote_weights() {
        let mut tb = vote("tb", Decision::Buy, 41.0, 0.9);
        tb.is_tiebreaker = true;
        tb.base_weight = 0.5;
        let mut muted = vote("muted", Decision::Sell, 12.0, 0.9);
        muted.base_weight = 0.0;
        let mut nan = vote("nan", Decision::Buy, 30.0, f64::NAN);
        nan.base_weight = 2.0;

        let snapshots = [
            WeightSnapshot::empty(),
            WeightSnapshot::from_multipliers([
                ("a".to_string(), 1.5),
                ("b".to_string(), 0.3),
                ("tb".to_string(), 1.2),
            ]),
        ];
        let inputs: Vec<Vec<ModelVote>> = vec![
            vec![],
            vec![fallback("f")],
            vec![
                vote("a", Decision::Buy, 40.0, 0.8),
                vote("b", Decision::Sell, 10.0, 0.6),
                fallback("f"),
                muted,
                nan,
                tb.clone(),
            ],
            vec![vote("a", Decision::Sell, 5.0, 1.0), vote("b", Decision::Sell, 6.0, 0.2), tb],
        ];

        for snapshot in &snapshots {
            for votes in &inputs {
                let t = tally(votes, snapshot, &cfg());
                let per_vote: f64 = t.weights.iter().map(|w| w.weight).sum();
                assert_eq!(t.weights.len(), votes.len());
                assert!((t.total_weight() - per_vote).abs() < 1e-12);
                assert!(t.weights.iter().all(|w| w.weight.is_finite() && w.weight >= 0.0));
            }
        }
    }

    #[test]
    fn empty_input() {
        let t = tally(&[], &WeightSnapshot::empty(), &cfg());
        assert_eq!(t.decision, Decision::Sell);
        assert_eq!(t.total_weight(), 0.0);
        assert!(!t.is_close_vote);
        assert!(t.weights.is_empty());
    }
}
