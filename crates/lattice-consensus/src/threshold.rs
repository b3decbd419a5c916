//! Threshold bands that turn a convergence score into a decision.
//!
//! ```text
//! 0.0 ............ review_floor ............ auto_commit ............ 1.0
//!        NONE                REQUIRE_HUMAN              AUTO_COMMIT
//! ```
//!
//! Both bounds are inclusive on their lower side: a score equal to
//! `auto_commit` commits automatically, a score equal to `review_floor`
//! requires a human.

use thiserror::Error;

/// Default auto-commit threshold.
pub const DEFAULT_AUTO_COMMIT: f64 = 0.9;

/// Default lower bound of the human-review band.
pub const DEFAULT_REVIEW_FLOOR: f64 = 0.75;

/// What the ledger should do with a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum ConvergenceDecision {
    /// Not converged; no ledger entry.
    None,
    /// Converged; append an entry that is authoritative immediately.
    AutoCommit,
    /// Borderline; append an entry that waits for a validator.
    RequireHuman,
}

impl ConvergenceDecision {
    /// Whether the decision produces a ledger entry.
    pub const fn commits(self) -> bool {
        !matches!(self, ConvergenceDecision::None)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ThresholdError {
    #[error("{name} must be a finite value in [0, 1], got {value}")]
    OutOfRange { name: &'static str, value: f64 },

    #[error("review floor {review_floor} is above auto-commit threshold {auto_commit}")]
    Inverted { review_floor: f64, auto_commit: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConvergenceThresholds {
    auto_commit: f64,
    review_floor: f64,
}

impl ConvergenceThresholds {
    pub fn new(auto_commit: f64, review_floor: f64) -> Result<Self, ThresholdError> {
        check_unit("auto_commit", auto_commit)?;
        check_unit("review_floor", review_floor)?;
        if review_floor > auto_commit {
            return Err(ThresholdError::Inverted {
                review_floor,
                auto_commit,
            });
        }
        Ok(Self {
            auto_commit,
            review_floor,
        })
    }

    pub const fn auto_commit(&self) -> f64 {
        self.auto_commit
    }

    pub const fn review_floor(&self) -> f64 {
        self.review_floor
    }

    /// Classify a score. NaN never commits.
    pub fn decide(&self, score: f64) -> ConvergenceDecision {
        if score >= self.auto_commit {
            ConvergenceDecision::AutoCommit
        } else if score >= self.review_floor {
            ConvergenceDecision::RequireHuman
        } else {
            ConvergenceDecision::None
        }
    }
}

impl Default for ConvergenceThresholds {
    fn default() -> Self {
        Self {
            auto_commit: DEFAULT_AUTO_COMMIT,
            review_floor: DEFAULT_REVIEW_FLOOR,
        }
    }
}

fn check_unit(name: &'static str, value: f64) -> Result<(), ThresholdError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ThresholdError::OutOfRange { name, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_bands() {
        let t = ConvergenceThresholds::default();
        assert_eq!(t.decide(0.4), ConvergenceDecision::None);
        assert_eq!(t.decide(0.75), ConvergenceDecision::RequireHuman);
        assert_eq!(t.decide(0.85), ConvergenceDecision::RequireHuman);
        assert_eq!(t.decide(0.9), ConvergenceDecision::AutoCommit);
        assert_eq!(t.decide(0.95), ConvergenceDecision::AutoCommit);
        assert_eq!(t.decide(f64::NAN), ConvergenceDecision::None);
    }

    #[test]
    fn rejects_bad_bounds() {
        assert!(matches!(
            ConvergenceThresholds::new(0.5, 0.8),
            Err(ThresholdError::Inverted { .. })
        ));
        assert!(matches!(
            ConvergenceThresholds::new(1.2, 0.8),
            Err(ThresholdError::OutOfRange { name: "auto_commit", .. })
        ));
        assert!(ConvergenceThresholds::new(0.9, f64::NAN).is_err());
    }

    #[test]
    fn collapsed_band_never_asks_for_review() {
        let t = ConvergenceThresholds::new(0.9, 0.9).unwrap();
        assert_eq!(t.decide(0.89), ConvergenceDecision::None);
        assert_eq!(t.decide(0.9), ConvergenceDecision::AutoCommit);
    }

    fn rank(d: ConvergenceDecision) -> u8 {
        match d {
            ConvergenceDecision::None => 0,
            ConvergenceDecision::RequireHuman => 1,
            ConvergenceDecision::AutoCommit => 2,
        }
    }

    proptest! {
        #[test]
        fn decision_is_monotonic_in_score(
            floor in 0.0f64..=1.0,
            span in 0.0f64..=1.0,
            a in 0.0f64..=1.0,
            b in 0.0f64..=1.0,
        ) {
            let auto = (floor + (1.0 - floor) * span).min(1.0);
            let t = ConvergenceThresholds::new(auto, floor).unwrap();
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(rank(t.decide(lo)) <= rank(t.decide(hi)));
        }
    }
}
