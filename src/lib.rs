//! # HRL (Hierarchical Reinforcement Learning)
//!
//! A hierarchical actor-critic temporal-difference learning engine.
//!
//! ## Overview
//!
//! Options are temporally extended actions arranged in a tree of levels. Each
//! level keeps its own value estimates, eligibility traces and discount
//! factor. The top level's choice is routed down as context; when a
//! sub-level's invocation ends, its discounted return flows back up as the
//! parent's reward. Learning uses semi-Markov TD errors, discounted by the
//! *measured* duration of each decision interval.
//!
//! ## Structure
//!
//! - [`core`] — Errors, states, the explicit simulation clock
//! - [`traces`] — Time-decaying eligibility traces
//! - [`value`] — Substitutable value backends (tabular, linear, population code)
//! - [`td`] — SMDP TD error computation
//! - [`selection`] — Softmax / noisy-max option competition
//! - [`learning`] — Eligibility-weighted update rule with divergence detection
//! - [`hierarchy`] — Option tree configuration and the tick-driven coordinator
//! - [`training`] — Environment boundary, episode loops, parallel replicates
//! - [`checkpoint`] — JSON save/load of learned estimates

pub mod checkpoint;
pub mod core;
pub mod hierarchy;
pub mod learning;
pub mod selection;
pub mod td;
pub mod traces;
pub mod training;
pub mod value;

pub use checkpoint::{load_checkpoint, save_checkpoint, CheckpointData, LevelSnapshot};
pub use crate::core::{Clock, HrlError, HrlResult, State, StateKey};
pub use hierarchy::{
    ClosedInterval, CloseReason, EpisodeEnd, EpisodeSummary, HierarchyCoordinator,
    HierarchySpec, LevelPhase, LevelSpec, OptionKind, OptionSpec, TickOutcome, Termination,
    TerminationFn,
};
pub use learning::{LearningRule, UpdateStats};
pub use selection::{
    ActionSelector, AnnealScope, CompetitionRule, ExplorationConfig, ExplorationSchedule,
    SelectionMode,
};
pub use td::{
    compute_error, compute_integrated_error, DiscountMode, TdError, TdErrorComputer,
};
pub use traces::{TraceBuffer, TraceMode};
pub use training::{
    run_episode, train, train_replicates_parallel, train_with_checkpoints, Environment,
    EpisodeMetrics, Replicate, Step, TrainingMetrics,
};
pub use value::{
    EstimatorSnapshot, EstimatorSpec, LinearEstimator, PopulationEstimator, TabularEstimator,
    ValueEstimator,
};

use serde::{Deserialize, Serialize};

/// What happens to a sub-level's partial return when the episode ends
/// before its invoking option terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptionPolicy {
    /// Pass whatever was accrued up to the parent's interval
    #[default]
    PassAccrued,
    /// Keep it inside the sub-level; the parent sees no reward from it
    Withhold,
}

/// Learning configuration shared by every level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Step size η, overridable per level. Default 0.1.
    pub learning_rate: f64,
    /// Trace decay λ per tick. Default 0.9.
    pub trace_decay: f64,
    /// Traces below this weight are pruned. Default 1e-3.
    pub trace_threshold: f64,
    pub trace_mode: TraceMode,
    /// Symmetric bound on the TD error. Default none.
    pub error_clip: Option<f64>,
    /// Added to the TD error when the corrected estimate is negative. Default 0.
    pub negative_value_bias: f64,
    /// Bootstrap discount over an interval. Default multiplicative `γ^k`.
    pub discount_mode: DiscountMode,
    /// Estimates beyond this magnitude are reported as divergence. Default 1e6.
    pub divergence_bound: f64,
    pub interruption: InterruptionPolicy,
    pub exploration: ExplorationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            trace_decay: 0.9,
            trace_threshold: 1e-3,
            trace_mode: TraceMode::Replacing,
            error_clip: None,
            negative_value_bias: 0.0,
            discount_mode: DiscountMode::Multiplicative,
            divergence_bound: 1e6,
            interruption: InterruptionPolicy::PassAccrued,
            exploration: ExplorationConfig::default(),
        }
    }
}

impl Config {
    /// # Errors
    /// `InvalidParameter` naming the first field out of range.
    pub fn validate(&self) -> HrlResult<()> {
        crate::core::check_unit_interval("learning_rate", self.learning_rate)?;
        if !(0.0..=1.0).contains(&self.trace_decay) {
            return Err(invalid("trace_decay", self.trace_decay, "a value in [0, 1]"));
        }
        if !(0.0..1.0).contains(&self.trace_threshold) {
            return Err(invalid(
                "trace_threshold",
                self.trace_threshold,
                "a value in [0, 1)",
            ));
        }
        if let TraceMode::Accumulating { increment } = self.trace_mode {
            if !(increment > 0.0 && increment <= 1.0) {
                return Err(invalid("trace_mode.increment", increment, "a value in (0, 1]"));
            }
        }
        if let Some(clip) = self.error_clip {
            if !(clip > 0.0 && clip.is_finite()) {
                return Err(invalid("error_clip", clip, "a finite positive bound"));
            }
        }
        if !self.negative_value_bias.is_finite() {
            return Err(invalid(
                "negative_value_bias",
                self.negative_value_bias,
                "a finite value",
            ));
        }
        if let DiscountMode::Integrated { rate } = self.discount_mode {
            if !(rate > 0.0 && rate.is_finite()) {
                return Err(invalid("discount_mode.rate", rate, "a finite positive rate"));
            }
        }
        if !(self.divergence_bound > 0.0) {
            return Err(invalid(
                "divergence_bound",
                self.divergence_bound,
                "a positive bound",
            ));
        }
        self.exploration.schedule.validate()
    }
}

fn invalid(name: &str, value: f64, expected: &'static str) -> HrlError {
    HrlError::InvalidParameter {
        name: name.to_string(),
        value,
        expected,
    }
}
