//! Convergence scoring for the Lattice coordination core.
//!
//! A node's state is a fixed-dimension vector. After each transition the
//! prior and next vectors are compared; the more alike they are, the more
//! the node has settled.
//!
//! # Bands
//!
//! - score ≥ auto-commit threshold → [`ConvergenceDecision::AutoCommit`]
//! - review floor ≤ score < auto-commit → [`ConvergenceDecision::RequireHuman`]
//! - below the floor → [`ConvergenceDecision::None`]
//!
//! The metric and both thresholds are deployment configuration.

mod convergence;
mod threshold;

pub use convergence::{dispersion, Convergence, ConvergencePolicy, Metric};
pub use threshold::{
    ConvergenceDecision, ConvergenceThresholds, ThresholdError, DEFAULT_AUTO_COMMIT,
    DEFAULT_REVIEW_FLOOR,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn illustrative_fixtures() {
        let policy = ConvergencePolicy::default();
        assert_eq!(policy.thresholds.decide(0.4), ConvergenceDecision::None);
        assert_eq!(policy.thresholds.decide(0.95), ConvergenceDecision::AutoCommit);
        assert!(!ConvergenceDecision::None.commits());
        assert!(ConvergenceDecision::RequireHuman.commits());
    }
}
