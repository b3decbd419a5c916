//! Deterministic state models.
//!
//! A model is a pure function `(state, input) -> (next_state, output)`.
//! Identical arguments must give bit-identical results: no randomness, no
//! clock, no iteration over unordered collections.

use crate::error::TransitionError;

/// Result of one model step.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub next_state: Vec<f64>,
    pub output: Vec<f64>,
}

pub trait StateModel: Send + Sync {
    fn state_dim(&self) -> usize;
    fn input_dim(&self) -> usize;
    fn step(&self, state: &[f64], input: &[f64]) -> Result<Step, TransitionError>;
}

/// Default clamp bound for [`LinearRecurrence`].
pub const DEFAULT_BOUND: f64 = 10.0;

/// Linear state-space recurrence with a clamped state:
///
/// ```text
/// h_t = clamp(A·h_{t-1} + B·u_t, -bound, bound)
/// y_t = C·h_t
/// ```
///
/// - `A`: diagonal just under 1 (slow decay), weak super-diagonal coupling
/// - `B`: diagonal gain 0.1 with weak cross terms
/// - `C`: strided mean pool of the state onto the output
#[derive(Debug, Clone)]
pub struct LinearRecurrence {
    state_dim: usize,
    input_dim: usize,
    output_dim: usize,
    bound: f64,
    a_diag: Vec<f64>,
    a_super: Vec<f64>,
    /// Row-major `state_dim × input_dim`.
    b: Vec<f64>,
}

impl LinearRecurrence {
    pub fn new(state_dim: usize, input_dim: usize, output_dim: usize) -> Self {
        Self::with_bound(state_dim, input_dim, output_dim, DEFAULT_BOUND)
    }

    pub fn with_bound(state_dim: usize, input_dim: usize, output_dim: usize, bound: f64) -> Self {
        let a_diag = (0..state_dim)
            .map(|i| (0.98 + i as f64 * 1e-4).min(0.999))
            .collect();
        let a_super = (0..state_dim.saturating_sub(1))
            .map(|i| 0.01 / (i as f64 + 1.0))
            .collect();
        let span = (state_dim + input_dim).max(1) as f64;
        let mut b = Vec::with_capacity(state_dim * input_dim);
        for i in 0..state_dim {
            for j in 0..input_dim {
                b.push(if i == j { 0.1 } else { 0.02 * (i + j) as f64 / span });
            }
        }
        Self {
            state_dim,
            input_dim,
            output_dim,
            bound: bound.abs(),
            a_diag,
            a_super,
            b,
        }
    }

    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    pub fn bound(&self) -> f64 {
        self.bound
    }

    fn readout(&self, h: &[f64]) -> Vec<f64> {
        let mut sums = vec![0.0; self.output_dim];
        let mut counts = vec![0usize; self.output_dim];
        if self.output_dim == 0 {
            return sums;
        }
        for (j, x) in h.iter().enumerate() {
            let k = j % self.output_dim;
            sums[k] += x;
            counts[k] += 1;
        }
        sums.iter()
            .zip(&counts)
            .map(|(s, &c)| if c == 0 { 0.0 } else { s / c as f64 })
            .collect()
    }
}

impl StateModel for LinearRecurrence {
    fn state_dim(&self) -> usize {
        self.state_dim
    }

    fn input_dim(&self) -> usize {
        self.input_dim
    }

    fn step(&self, state: &[f64], input: &[f64]) -> Result<Step, TransitionError> {
        check_dims("state", self.state_dim, state)?;
        check_dims("input", self.input_dim, input)?;

        let mut next = Vec::with_capacity(self.state_dim);
        for i in 0..self.state_dim {
            let mut acc = self.a_diag[i] * state[i];
            if i + 1 < self.state_dim {
                acc += self.a_super[i] * state[i + 1];
            }
            let row = &self.b[i * self.input_dim..(i + 1) * self.input_dim];
            acc += row.iter().zip(input).map(|(w, u)| w * u).sum::<f64>();
            next.push(acc.clamp(-self.bound, self.bound));
        }

        let output = self.readout(&next);
        Ok(Step {
            next_state: next,
            output,
        })
    }
}

/// Dimension and finiteness check shared by models.
pub fn check_dims(what: &'static str, expected: usize, v: &[f64]) -> Result<(), TransitionError> {
    if v.len() != expected {
        return Err(TransitionError::DimensionMismatch {
            what,
            expected,
            got: v.len(),
        });
    }
    if v.iter().any(|x| !x.is_finite()) {
        return Err(TransitionError::NonFinite(what));
    }
    Ok(())
}
