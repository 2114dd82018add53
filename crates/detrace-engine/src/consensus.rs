//! Consensus and reliability analysis over N-run groups.
//!
//! Strategies: majority, weighted, threshold(τ), unanimous, best_of_n.
//! Weighted consensus compares the verification-score mass of passing runs
//! against failing runs and normalizes its confidence by the total score
//! mass. Variance is reported as coefficients of variation with Tukey
//! fences (1.5×IQR) marking outliers; outliers are reported always but
//! excluded from the CVs only when requested.

use serde::{Deserialize, Serialize};

use detrace_core::obs;

use crate::adapter::RunResult;
use crate::error::{EngineError, Result};

/// One run's contribution to a consistency evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSample {
    pub run_id: String,
    pub seed: u64,
    pub verified_pass: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_score: Option<f64>,
    pub duration_ms: u64,
    pub token_total: u64,
}

impl From<&RunResult> for RunSample {
    fn from(r: &RunResult) -> Self {
        Self {
            run_id: r.run_id.to_string(),
            seed: r.seed,
            verified_pass: r.verified_pass,
            verification_score: r.verification_score,
            duration_ms: r.duration_ms,
            token_total: r.token_total,
        }
    }
}

/// Consensus strategy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum ConsensusStrategy {
    Majority,
    Weighted,
    Threshold(f64),
    Unanimous,
    BestOfN,
}

impl ConsensusStrategy {
    /// Parse a CLI strategy name, with τ supplied separately for threshold.
    pub fn parse(name: &str, threshold: Option<f64>) -> Result<Self> {
        match name {
            "majority" => Ok(ConsensusStrategy::Majority),
            "weighted" => Ok(ConsensusStrategy::Weighted),
            "unanimous" => Ok(ConsensusStrategy::Unanimous),
            "best_of_n" => Ok(ConsensusStrategy::BestOfN),
            "threshold" => {
                let tau = threshold.ok_or_else(|| {
                    EngineError::Configuration("threshold strategy requires --threshold".into())
                })?;
                if !(0.0..=1.0).contains(&tau) {
                    return Err(EngineError::Configuration(format!(
                        "threshold {tau} outside [0,1]"
                    )));
                }
                Ok(ConsensusStrategy::Threshold(tau))
            }
            other => Err(EngineError::Configuration(format!(
                "unknown consensus strategy: {other:?}"
            ))),
        }
    }
}

/// Group-level decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusDecision {
    Pass,
    Fail,
    Inconclusive,
}

impl std::fmt::Display for ConsensusDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConsensusDecision::Pass => "pass",
            ConsensusDecision::Fail => "fail",
            ConsensusDecision::Inconclusive => "inconclusive",
        };
        f.write_str(s)
    }
}

/// Stability band derived from the reliability score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StabilityRating {
    Low,
    Medium,
    High,
}

/// The full consistency report for one task group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub task_id: String,
    pub n_runs: usize,
    pub runs: Vec<RunSample>,
    pub strategy: ConsensusStrategy,
    pub consensus_decision: ConsensusDecision,
    pub confidence: f64,
    pub duration_cv: f64,
    pub token_cv: f64,
    pub reliability_score: f64,
    pub stability_rating: StabilityRating,
    pub outlier_indices: Vec<usize>,
    pub outlier_seeds: Vec<u64>,
    pub exclude_outliers: bool,
}

fn clamp01(x: f64) -> f64 {
    x.clamp(0.0, 1.0)
}

/// Population coefficient of variation; 0 for empty input or zero mean.
fn coefficient_of_variation(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    if mean == 0.0 {
        return 0.0;
    }
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt() / mean
}

/// Quartile with linear interpolation on the sorted data.
fn quartile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    if lo == hi {
        return sorted[lo];
    }
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

/// Indices outside the Tukey fences (1.5×IQR).
fn tukey_outliers(values: &[f64]) -> Vec<usize> {
    if values.len() < 4 {
        return Vec::new();
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let q1 = quartile(&sorted, 0.25);
    let q3 = quartile(&sorted, 0.75);
    let iqr = q3 - q1;
    let lo = q1 - 1.5 * iqr;
    let hi = q3 + 1.5 * iqr;
    values
        .iter()
        .enumerate()
        .filter(|(_, v)| **v < lo || **v > hi)
        .map(|(i, _)| i)
        .collect()
}

fn score_of(sample: &RunSample) -> f64 {
    sample.verification_score.unwrap_or(1.0)
}

fn decide(
    strategy: ConsensusStrategy,
    samples: &[RunSample],
) -> (ConsensusDecision, f64) {
    let n = samples.len();
    let passes = samples.iter().filter(|s| s.verified_pass).count();
    let fails = n - passes;

    match strategy {
        ConsensusStrategy::Majority => {
            let decision = if passes * 2 > n {
                ConsensusDecision::Pass
            } else if fails * 2 > n {
                ConsensusDecision::Fail
            } else {
                ConsensusDecision::Inconclusive
            };
            let confidence = (passes as f64 - fails as f64).abs() / n as f64;
            (decision, confidence)
        }
        ConsensusStrategy::Weighted => {
            let pass_mass: f64 = samples
                .iter()
                .filter(|s| s.verified_pass)
                .map(score_of)
                .sum();
            let fail_mass: f64 = samples
                .iter()
                .filter(|s| !s.verified_pass)
                .map(score_of)
                .sum();
            let total = pass_mass + fail_mass;
            let decision = if pass_mass > fail_mass {
                ConsensusDecision::Pass
            } else if fail_mass > pass_mass {
                ConsensusDecision::Fail
            } else {
                ConsensusDecision::Inconclusive
            };
            let confidence = if total > 0.0 {
                clamp01((pass_mass - fail_mass).abs() / total)
            } else {
                0.0
            };
            (decision, confidence)
        }
        ConsensusStrategy::Threshold(tau) => {
            let rate = passes as f64 / n as f64;
            let decision = if rate >= tau {
                ConsensusDecision::Pass
            } else {
                ConsensusDecision::Fail
            };
            (decision, clamp01((rate - tau).abs()))
        }
        ConsensusStrategy::Unanimous => {
            let decision = if passes == n {
                ConsensusDecision::Pass
            } else {
                ConsensusDecision::Fail
            };
            let confidence = if passes == n || passes == 0 { 1.0 } else {
                (fails as f64) / n as f64
            };
            (decision, confidence)
        }
        ConsensusStrategy::BestOfN => {
            let best = samples.iter().max_by(|a, b| {
                score_of(a)
                    .partial_cmp(&score_of(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            match best {
                Some(best) => {
                    let decision = if best.verified_pass {
                        ConsensusDecision::Pass
                    } else {
                        ConsensusDecision::Fail
                    };
                    (decision, clamp01(score_of(best)))
                }
                None => (ConsensusDecision::Inconclusive, 0.0),
            }
        }
    }
}

/// Analyze N run samples into a [`ConsistencyReport`].
pub fn analyze(
    task_id: &str,
    samples: Vec<RunSample>,
    strategy: ConsensusStrategy,
    exclude_outliers: bool,
) -> Result<ConsistencyReport> {
    if samples.is_empty() {
        return Err(EngineError::Configuration(
            "consistency analysis needs at least one run".to_string(),
        ));
    }

    let (consensus_decision, confidence) = decide(strategy, &samples);

    let durations: Vec<f64> = samples.iter().map(|s| s.duration_ms as f64).collect();
    let tokens: Vec<f64> = samples.iter().map(|s| s.token_total as f64).collect();

    let mut outlier_indices: Vec<usize> = tukey_outliers(&durations);
    for idx in tukey_outliers(&tokens) {
        if !outlier_indices.contains(&idx) {
            outlier_indices.push(idx);
        }
    }
    outlier_indices.sort_unstable();
    let outlier_seeds: Vec<u64> = outlier_indices.iter().map(|i| samples[*i].seed).collect();

    let keep = |values: &[f64]| -> Vec<f64> {
        if !exclude_outliers {
            return values.to_vec();
        }
        values
            .iter()
            .enumerate()
            .filter(|(i, _)| !outlier_indices.contains(i))
            .map(|(_, v)| *v)
            .collect()
    };
    let duration_cv = coefficient_of_variation(&keep(&durations));
    let token_cv = coefficient_of_variation(&keep(&tokens));

    let success_rate =
        samples.iter().filter(|s| s.verified_pass).count() as f64 / samples.len() as f64;
    let reliability_score = 0.6 * success_rate
        + 0.2 * (1.0 - clamp01(duration_cv))
        + 0.2 * (1.0 - clamp01(token_cv));
    let stability_rating = if reliability_score >= 0.8 {
        StabilityRating::High
    } else if reliability_score >= 0.6 {
        StabilityRating::Medium
    } else {
        StabilityRating::Low
    };

    obs::emit_consensus_evaluated(
        task_id,
        &consensus_decision.to_string(),
        confidence,
        reliability_score,
    );

    Ok(ConsistencyReport {
        task_id: task_id.to_string(),
        n_runs: samples.len(),
        runs: samples,
        strategy,
        consensus_decision,
        confidence,
        duration_cv,
        token_cv,
        reliability_score,
        stability_rating,
        outlier_indices,
        outlier_seeds,
        exclude_outliers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(seed: u64, pass: bool, score: f64, duration_ms: u64, tokens: u64) -> RunSample {
        RunSample {
            run_id: format!("run-{seed}"),
            seed,
            verified_pass: pass,
            verification_score: Some(score),
            duration_ms,
            token_total: tokens,
        }
    }

    fn uniform(passes: &[bool]) -> Vec<RunSample> {
        passes
            .iter()
            .enumerate()
            .map(|(i, p)| sample(i as u64 + 1, *p, 1.0, 1000, 100))
            .collect()
    }

    #[test]
    fn test_majority_three_of_five_passes() {
        let samples = uniform(&[true, true, false, true, false]);
        let report =
            analyze("double-x", samples, ConsensusStrategy::Majority, false).unwrap();
        assert_eq!(report.consensus_decision, ConsensusDecision::Pass);
        assert!((report.confidence - 0.2).abs() < 1e-9);
        // success_rate 0.6, CVs 0 → 0.36 + 0.2 + 0.2
        assert!((report.reliability_score - 0.76).abs() < 1e-9);
        assert_eq!(report.stability_rating, StabilityRating::Medium);
    }

    #[test]
    fn test_majority_even_tie_is_inconclusive() {
        let samples = uniform(&[true, true, false, false]);
        let report =
            analyze("t", samples, ConsensusStrategy::Majority, false).unwrap();
        assert_eq!(report.consensus_decision, ConsensusDecision::Inconclusive);
        assert_eq!(report.confidence, 0.0);
    }

    #[test]
    fn test_weighted_pass_mass_wins() {
        let samples = vec![
            sample(1, true, 0.9, 1000, 100),
            sample(2, true, 0.8, 1000, 100),
            sample(3, false, 0.4, 1000, 100),
        ];
        let report = analyze("t", samples, ConsensusStrategy::Weighted, false).unwrap();
        assert_eq!(report.consensus_decision, ConsensusDecision::Pass);
        // |1.7 - 0.4| / 2.1
        assert!((report.confidence - (1.3 / 2.1)).abs() < 1e-9);
    }

    #[test]
    fn test_weighted_tie_is_inconclusive() {
        let samples = vec![
            sample(1, true, 0.5, 1000, 100),
            sample(2, false, 0.5, 1000, 100),
        ];
        let report = analyze("t", samples, ConsensusStrategy::Weighted, false).unwrap();
        assert_eq!(report.consensus_decision, ConsensusDecision::Inconclusive);
        assert_eq!(report.confidence, 0.0);
    }

    #[test]
    fn test_threshold_distance_confidence() {
        let samples = uniform(&[true, true, true, false]);
        let report = analyze(
            "t",
            samples,
            ConsensusStrategy::Threshold(0.5),
            false,
        )
        .unwrap();
        assert_eq!(report.consensus_decision, ConsensusDecision::Pass);
        assert!((report.confidence - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_unanimous() {
        let all = uniform(&[true, true, true]);
        assert_eq!(
            analyze("t", all, ConsensusStrategy::Unanimous, false)
                .unwrap()
                .consensus_decision,
            ConsensusDecision::Pass
        );
        let one_fail = uniform(&[true, true, false]);
        assert_eq!(
            analyze("t", one_fail, ConsensusStrategy::Unanimous, false)
                .unwrap()
                .consensus_decision,
            ConsensusDecision::Fail
        );
    }

    #[test]
    fn test_best_of_n_follows_top_score() {
        let samples = vec![
            sample(1, false, 0.9, 1000, 100),
            sample(2, true, 0.95, 1000, 100),
            sample(3, false, 0.1, 1000, 100),
        ];
        let report = analyze("t", samples, ConsensusStrategy::BestOfN, false).unwrap();
        assert_eq!(report.consensus_decision, ConsensusDecision::Pass);
    }

    #[test]
    fn test_outliers_marked_but_not_excluded_by_default() {
        let mut samples = uniform(&[true, true, true, true, true]);
        samples[4].duration_ms = 100_000;
        let report =
            analyze("t", samples.clone(), ConsensusStrategy::Majority, false).unwrap();
        assert_eq!(report.outlier_indices, vec![4]);
        assert_eq!(report.outlier_seeds, vec![5]);
        assert!(report.duration_cv > 0.5);

        let excluded = analyze("t", samples, ConsensusStrategy::Majority, true).unwrap();
        assert_eq!(excluded.outlier_indices, vec![4]);
        assert!(excluded.duration_cv < 0.01);
    }

    #[test]
    fn test_reliability_monotone_in_success_rate() {
        // Same variance, increasing success count.
        let mut previous = -1.0;
        for passes in 0..=5 {
            let flags: Vec<bool> = (0..5).map(|i| i < passes).collect();
            let report =
                analyze("t", uniform(&flags), ConsensusStrategy::Majority, false).unwrap();
            assert!(report.reliability_score >= previous);
            previous = report.reliability_score;
        }
    }

    #[test]
    fn test_rating_bands() {
        let high = analyze(
            "t",
            uniform(&[true, true, true, true, true]),
            ConsensusStrategy::Majority,
            false,
        )
        .unwrap();
        assert_eq!(high.stability_rating, StabilityRating::High);

        let low = analyze(
            "t",
            uniform(&[false, false, false, true, false]),
            ConsensusStrategy::Majority,
            false,
        )
        .unwrap();
        assert_eq!(low.stability_rating, StabilityRating::Low);
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!(
            ConsensusStrategy::parse("majority", None).unwrap(),
            ConsensusStrategy::Majority
        );
        assert_eq!(
            ConsensusStrategy::parse("threshold", Some(0.8)).unwrap(),
            ConsensusStrategy::Threshold(0.8)
        );
        assert!(ConsensusStrategy::parse("threshold", None).is_err());
        assert!(ConsensusStrategy::parse("threshold", Some(1.5)).is_err());
        assert!(ConsensusStrategy::parse("plurality", None).is_err());
    }

    #[test]
    fn test_empty_samples_rejected() {
        assert!(analyze("t", vec![], ConsensusStrategy::Majority, false).is_err());
    }
}
