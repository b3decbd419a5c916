//! Similarity between consecutive state vectors.
//!
//! A node has converged when a transition barely moves its state. Each
//! metric maps a pair of vectors onto [0, 1], where 1 means identical.
//! Pairs that cannot be compared (different dimensions, NaN or infinite
//! components) score 0 so they never commit.

use crate::threshold::{ConvergenceDecision, ConvergenceThresholds};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Metric {
    /// `1 / (1 + rms(prior - next))`.
    #[default]
    InverseRms,
    /// `max(0, cos(prior, next))`. Two zero vectors are identical.
    Cosine,
}

impl Metric {
    pub fn score(self, prior: &[f64], next: &[f64]) -> f64 {
        if prior.len() != next.len() || !all_finite(prior) || !all_finite(next) {
            return 0.0;
        }
        if prior.is_empty() {
            return 1.0;
        }
        match self {
            Metric::InverseRms => inverse_rms(prior, next),
            Metric::Cosine => cosine(prior, next),
        }
    }
}

fn all_finite(v: &[f64]) -> bool {
    v.iter().all(|x| x.is_finite())
}

fn inverse_rms(prior: &[f64], next: &[f64]) -> f64 {
    let sum_sq: f64 = prior
        .iter()
        .zip(next)
        .map(|(a, b)| (a - b) * (a - b))
        .sum();
    let rms = (sum_sq / prior.len() as f64).sqrt();
    if rms.is_finite() {
        1.0 / (1.0 + rms)
    } else {
        0.0
    }
}

fn cosine(prior: &[f64], next: &[f64]) -> f64 {
    let dot: f64 = prior.iter().zip(next).map(|(a, b)| a * b).sum();
    let na = prior.iter().map(|a| a * a).sum::<f64>().sqrt();
    let nb = next.iter().map(|b| b * b).sum::<f64>().sqrt();
    match (na == 0.0, nb == 0.0) {
        (true, true) => 1.0,
        (true, false) | (false, true) => 0.0,
        _ => {
            let cos = dot / (na * nb);
            if cos.is_finite() {
                cos.clamp(0.0, 1.0)
            } else {
                0.0
            }
        }
    }
}

/// Population variance of a vector's components. 0 for empty input.
pub fn dispersion(v: &[f64]) -> f64 {
    if v.is_empty() {
        return 0.0;
    }
    let n = v.len() as f64;
    let mean = v.iter().sum::<f64>() / n;
    v.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n
}

/// Result of scoring one transition.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Convergence {
    pub score: f64,
    pub decision: ConvergenceDecision,
}

/// Metric plus threshold bands.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConvergencePolicy {
    pub metric: Metric,
    pub thresholds: ConvergenceThresholds,
}

impl ConvergencePolicy {
    pub fn new(metric: Metric, thresholds: ConvergenceThresholds) -> Self {
        Self { metric, thresholds }
    }

    pub fn evaluate(&self, prior: &[f64], next: &[f64]) -> Convergence {
        let score = self.metric.score(prior, next);
        Convergence {
            score,
            decision: self.thresholds.decide(score),
        }
    }
}
