//! Core types shared by every component of the engine.
//!
//! This module provides:
//! - The error taxonomy ([`HrlError`]) and result alias ([`HrlResult`])
//! - [`State`]: the feature vector a level sees, with an optional context block
//! - [`StateKey`]: a hashable, quantised view of a state for tabular lookups
//! - [`Clock`]: the explicit simulation tick counter
//!
//! ## State Representation
//!
//! A level's state is the environment observation, optionally followed by a
//! one-hot block naming the option that is active at the parent level:
//! ```text
//! s^L = [ o_1, ..., o_n | c_1, ..., c_k ]     c = onehot(parent option)
//! ```
//! This is how the top level's choice is routed down as context.

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Quantisation step used when hashing feature vectors.
const KEY_RESOLUTION: f64 = 1e-6;

/// Error type for engine operations.
///
/// Configuration errors are raised before anything is built. Numerical
/// divergence is reported at the update that produced it.
#[derive(Error, Debug)]
pub enum HrlError {
    /// A scalar parameter fell outside its admissible range
    #[error("Invalid parameter `{name}`: {value} (expected {expected})")]
    InvalidParameter {
        name: String,
        value: f64,
        expected: &'static str,
    },

    /// A level declares no options
    #[error("Level {level} (`{name}`) has no options")]
    EmptyLevel { level: usize, name: String },

    /// A composite option names a level that does not exist
    #[error("Option `{option}` at level {level} invokes undefined sub-level {sub_level}")]
    UndefinedSubLevel {
        level: usize,
        option: String,
        sub_level: usize,
    },

    /// Following sub-level references leads back to an ancestor
    #[error("Hierarchy contains a cycle through level {level}")]
    Cycle { level: usize },

    /// A level is invoked from two different parent levels
    #[error("Level {level} is invoked by both level {first} and level {second}")]
    MultipleParents {
        level: usize,
        first: usize,
        second: usize,
    },

    /// A non-top level is never invoked
    #[error("Level {level} is not reachable from the top level")]
    UnreachableLevel { level: usize },

    /// The option tree is deeper than the engine supports
    #[error("Hierarchy depth {depth} exceeds the maximum of {max}")]
    DepthExceeded { depth: usize, max: usize },

    /// A vector did not have the expected length
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// A level index outside the hierarchy
    #[error("Unknown level {level}")]
    UnknownLevel { level: usize },

    /// An option index outside the level's option set
    #[error("Unknown option {option} at level {level}")]
    UnknownOption { level: usize, option: usize },

    /// A value estimate left the sanity bound
    #[error("Value estimate diverged at level {level}: {value} exceeds bound {bound}")]
    Divergence { level: usize, value: f64, bound: f64 },

    /// A checkpoint does not match the backend or hierarchy it is loaded into
    #[error("Snapshot mismatch: expected {expected}, got {got}")]
    SnapshotMismatch { expected: String, got: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type HrlResult<T> = Result<T, HrlError>;

/// Check that `value` lies in the half-open unit interval (0, 1].
pub(crate) fn check_unit_interval(name: &str, value: f64) -> HrlResult<()> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(HrlError::InvalidParameter {
            name: name.to_string(),
            value,
            expected: "a value in (0, 1]",
        })
    }
}

/// Hashable identity of a state, obtained by quantising its features.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateKey(pub Vec<i64>);

/// A state as seen by one level of the hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    features: Array1<f64>,
}

impl State {
    /// Wrap a feature vector.
    pub fn new(features: Array1<f64>) -> Self {
        Self { features }
    }

    pub fn from_vec(features: Vec<f64>) -> Self {
        Self::new(Array1::from(features))
    }

    /// One-hot state: feature `index` is 1, the rest 0.
    ///
    /// # Errors
    /// - `DimensionMismatch` if `index >= dim`
    pub fn one_hot(index: usize, dim: usize) -> HrlResult<Self> {
        if index >= dim {
            return Err(HrlError::DimensionMismatch {
                expected: dim,
                got: index + 1,
            });
        }
        let mut features = Array1::zeros(dim);
        features[index] = 1.0;
        Ok(Self { features })
    }

    /// Append a one-hot context block of width `context_dim` with
    /// `context` set.
    pub fn with_context(&self, context: usize, context_dim: usize) -> Self {
        let mut features = Array1::zeros(self.features.len() + context_dim);
        features
            .slice_mut(ndarray::s![..self.features.len()])
            .assign(&self.features);
        if context < context_dim {
            features[self.features.len() + context] = 1.0;
        }
        Self { features }
    }

    pub fn features(&self) -> &Array1<f64> {
        &self.features
    }

    pub fn dim(&self) -> usize {
        self.features.len()
    }

    /// Squared L2 norm of the features.
    pub fn norm_sq(&self) -> f64 {
        self.features.dot(&self.features)
    }

    /// Quantised key used by tabular backends and trace bookkeeping.
    pub fn key(&self) -> StateKey {
        StateKey(
            self.features
                .iter()
                .map(|&x| (x / KEY_RESOLUTION).round() as i64)
                .collect(),
        )
    }
}

/// Explicit simulation clock.
///
/// The clock is owned by the caller and passed into the coordinator on every
/// call, so several independent agents can run side by side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clock {
    tick: u64,
}

impl Clock {
    pub fn new() -> Self {
        Self { tick: 0 }
    }

    /// Clock starting at an arbitrary tick.
    pub fn starting_at(tick: u64) -> Self {
        Self { tick }
    }

    /// Current tick.
    pub fn now(&self) -> u64 {
        self.tick
    }

    pub fn advance(&mut self) {
        self.tick += 1;
    }

    pub fn advance_by(&mut self, ticks: u64) {
        self.tick += ticks;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_hot() {
        let s = State::one_hot(2, 4).unwrap();
        assert_eq!(s.features().to_vec(), vec![0.0, 0.0, 1.0, 0.0]);
        assert!(State::one_hot(4, 4).is_err());
    }

    #[test]
    fn test_with_context_appends_block() {
        let s = State::from_vec(vec![0.5, 0.25]);
        let ctx = s.with_context(1, 3);
        assert_eq!(ctx.dim(), 5);
        assert_eq!(ctx.features().to_vec(), vec![0.5, 0.25, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_key_is_stable_under_tiny_noise() {
        let a = State::from_vec(vec![0.1, 0.2]);
        let b = State::from_vec(vec![0.1 + 1e-9, 0.2]);
        let c = State::from_vec(vec![0.1, 0.3]);
        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn test_clock_advances() {
        let mut clock = Clock::new();
        assert_eq!(clock.now(), 0);
        clock.advance();
        clock.advance_by(4);
        assert_eq!(clock.now(), 5);
        assert_eq!(Clock::starting_at(10).now(), 10);
    }

    #[test]
    fn test_unit_interval_check() {
        assert!(check_unit_interval("gamma", 1.0).is_ok());
        assert!(check_unit_interval("gamma", 0.5).is_ok());
        assert!(check_unit_interval("gamma", 0.0).is_err());
        assert!(check_unit_interval("gamma", 1.5).is_err());
        assert!(check_unit_interval("gamma", f64::NAN).is_err());
    }
}
