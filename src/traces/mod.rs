//! Eligibility traces over (state, option) pairs.
//!
//! Option durations are not known in advance, so credit assignment cannot
//! count transitions. Instead every weight decays with elapsed *time*:
//! ```text
//! e(s, o) <- λ^dt · e(s, o)
//! ```
//! and a learning update for a TD error δ moves each pair in proportion to
//! `e(s, o)`. Each level owns one buffer; buffers are never shared.

use crate::core::{State, StateKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a re-visited pair refreshes its eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TraceMode {
    /// Weight is reset to 1
    Replacing,
    /// Weight grows by `increment`, capped at 1
    Accumulating { increment: f64 },
}

impl Default for TraceMode {
    fn default() -> Self {
        TraceMode::Replacing
    }
}

/// A single eligible pair.
#[derive(Debug, Clone)]
pub struct TraceEntry {
    pub state: State,
    pub option: usize,
    pub weight: f64,
}

/// Per-level buffer of decaying eligibility weights.
///
/// Entries are kept in key order so that learning updates are applied in the
/// same order on every run.
#[derive(Debug, Clone)]
pub struct TraceBuffer {
    entries: BTreeMap<(StateKey, usize), TraceEntry>,
    /// Decay constant λ per tick
    lambda: f64,
    /// Weights below this are pruned
    threshold: f64,
    mode: TraceMode,
}

impl TraceBuffer {
    pub fn new(lambda: f64, threshold: f64, mode: TraceMode) -> Self {
        Self {
            entries: BTreeMap::new(),
            lambda: lambda.clamp(0.0, 1.0),
            threshold: threshold.max(0.0),
            mode,
        }
    }

    /// Mark `(state, option)` as eligible.
    pub fn record(&mut self, state: &State, option: usize) {
        let mode = self.mode;
        let entry = self
            .entries
            .entry((state.key(), option))
            .or_insert_with(|| TraceEntry {
                state: state.clone(),
                option,
                weight: 0.0,
            });
        entry.weight = match mode {
            TraceMode::Replacing => 1.0,
            TraceMode::Accumulating { increment } => (entry.weight + increment.max(0.0)).min(1.0),
        };
    }

    /// Decay every weight by λ^dt and prune the ones that fall below threshold.
    pub fn decay(&mut self, dt: u64) {
        if dt == 0 || self.entries.is_empty() {
            return;
        }
        let factor = self.lambda.powi(dt.min(i32::MAX as u64) as i32);
        let threshold = self.threshold;
        self.entries.retain(|_, entry| {
            entry.weight *= factor;
            entry.weight >= threshold && entry.weight > 0.0
        });
    }

    /// Current eligibility of a pair (0 if absent).
    pub fn weight_for(&self, state: &State, option: usize) -> f64 {
        self.entries
            .get(&(state.key(), option))
            .map_or(0.0, |e| e.weight)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TraceEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of all weights (diagnostics).
    pub fn total_eligibility(&self) -> f64 {
        self.entries.values().map(|e| e.weight).sum()
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }
}
