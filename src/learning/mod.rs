//! Eligibility-weighted TD learning.
//!
//! When a level closes an interval with error δ, every pair in its trace
//! buffer is moved toward `Q(s, o) + δ` with step `η · e(s, o)`:
//! ```text
//! ΔQ(s, o) = η · e(s, o) · δ
//! ```
//! Estimates outside the sanity bound are reported as divergence rather than
//! clamped: they indicate a learning-rate or discount misconfiguration.

use crate::core::{HrlError, HrlResult};
use crate::traces::TraceBuffer;
use crate::value::ValueEstimator;
use log::error;
use serde::{Deserialize, Serialize};

/// Summary of one learning pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateStats {
    /// Pairs touched
    pub pairs_updated: usize,
    /// Sum of |ΔQ| over the pass
    pub total_change: f64,
    /// Largest |Q| after the pass among updated pairs
    pub max_abs_value: f64,
}

/// Applies a level's TD error through its trace buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LearningRule {
    pub learning_rate: f64,
    pub divergence_bound: f64,
}

impl LearningRule {
    pub fn new(learning_rate: f64, divergence_bound: f64) -> Self {
        Self {
            learning_rate,
            divergence_bound,
        }
    }

    /// Update every eligible pair of `level` with `td_error`.
    ///
    /// # Errors
    /// - `Divergence` if an updated estimate is non-finite or exceeds the bound
    /// - any error raised by the estimator's `update`
    pub fn apply(
        &self,
        level: usize,
        estimator: &mut dyn ValueEstimator,
        traces: &TraceBuffer,
        td_error: f64,
    ) -> HrlResult<UpdateStats> {
        let mut stats = UpdateStats::default();

        for entry in traces.iter().filter(|e| e.weight > 0.0) {
            let current = estimator.value_of(&entry.state, entry.option);
            let updated = estimator.update(
                &entry.state,
                entry.option,
                current + td_error,
                entry.weight,
                self.learning_rate,
            )?;

            if !updated.is_finite() || updated.abs() > self.divergence_bound {
                error!(
                    "level {}: estimate for option {} diverged to {} (bound {})",
                    level, entry.option, updated, self.divergence_bound
                );
                return Err(HrlError::Divergence {
                    level,
                    value: updated,
                    bound: self.divergence_bound,
                });
            }

            stats.pairs_updated += 1;
            stats.total_change += (updated - current).abs();
            stats.max_abs_value = stats.max_abs_value.max(updated.abs());
        }

        Ok(stats)
    }
}
