//! Option hierarchy: configuration, validation and the runtime coordinator.
//!
//! A hierarchy is a tree of levels. Level 0 is the top; every other level is
//! invoked by composite options of exactly one parent level:
//! ```text
//! level 0:  [ go-to-pickup* ]  [ go-to-dropoff* ]  [ wait ]
//!                  \                  /
//! level 1:        [ left ]  [ right ]              (* composite)
//! ```
//! The structure is fixed once [`HierarchySpec::validate`] accepts it; only the
//! active option and elapsed time of each level change during simulation.

mod coordinator;

pub use coordinator::{
    ClosedInterval, CloseReason, Decision, EpisodeEnd, EpisodeSummary, HierarchyCoordinator,
    LevelPhase, TickOutcome,
};

use crate::core::{check_unit_interval, HrlError, HrlResult, State};
use crate::value::EstimatorSpec;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Deepest option tree the engine accepts.
pub const MAX_DEPTH: usize = 8;

/// User-supplied termination predicate over (observation, elapsed ticks).
#[derive(Clone)]
pub struct TerminationFn(Arc<dyn Fn(&State, u64) -> bool + Send + Sync>);

impl TerminationFn {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&State, u64) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn call(&self, observation: &State, elapsed: u64) -> bool {
        (self.0)(observation, elapsed)
    }
}

impl fmt::Debug for TerminationFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TerminationFn(..)")
    }
}

/// When an active option stops.
///
/// Predicates see the raw environment observation (without context block)
/// and the ticks elapsed since the option was opened.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// After exactly `n` ticks
    Ticks(u64),
    /// After a duration drawn uniformly from `[min, max]` when the option opens
    Timer { min: u64, max: u64 },
    /// When observation feature `index` exceeds `threshold`
    FeatureAbove { index: usize, threshold: f64 },
    /// When any of the inner conditions holds
    Any(Vec<Termination>),
    /// Only at episode end
    Never,
    #[serde(skip)]
    Custom(TerminationFn),
}

impl Default for Termination {
    fn default() -> Self {
        Termination::Ticks(1)
    }
}

impl Termination {
    /// Draw the random deadline for this activation, if any.
    ///
    /// For [`Termination::Any`] the earliest inner deadline wins.
    pub fn draw_deadline<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<u64> {
        match self {
            Termination::Timer { min, max } => Some(rng.gen_range(*min..=*max)),
            Termination::Any(inner) => inner
                .iter()
                .filter_map(|t| t.draw_deadline(&mut *rng))
                .min(),
            _ => None,
        }
    }

    /// Whether the option should stop now.
    pub fn is_met(&self, observation: &State, elapsed: u64, deadline: Option<u64>) -> bool {
        match self {
            Termination::Ticks(n) => elapsed >= *n,
            Termination::Timer { .. } => deadline.map_or(false, |d| elapsed >= d),
            Termination::FeatureAbove { index, threshold } => observation
                .features()
                .get(*index)
                .map_or(false, |&x| x > *threshold),
            Termination::Any(inner) => inner
                .iter()
                .any(|t| t.is_met(observation, elapsed, deadline)),
            Termination::Never => false,
            Termination::Custom(f) => f.call(observation, elapsed),
        }
    }

    fn validate(&self, observation_dim: Option<usize>) -> HrlResult<()> {
        match self {
            Termination::Ticks(0) => Err(HrlError::InvalidParameter {
                name: "termination.ticks".to_string(),
                value: 0.0,
                expected: "at least one tick",
            }),
            Termination::Timer { min, max } if *min == 0 || min > max => {
                Err(HrlError::InvalidParameter {
                    name: "termination.timer.min".to_string(),
                    value: *min as f64,
                    expected: "1 <= min <= max",
                })
            }
            Termination::FeatureAbove { index, .. } => match observation_dim {
                Some(dim) if *index >= dim => Err(HrlError::DimensionMismatch {
                    expected: dim,
                    got: index + 1,
                }),
                _ => Ok(()),
            },
            Termination::Any(inner) => inner.iter().try_for_each(|t| t.validate(observation_dim)),
            _ => Ok(()),
        }
    }
}

/// What an option does once selected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptionKind {
    /// Emits an environment action
    Primitive { action: usize },
    /// Hands control to another level
    Composite { sub_level: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionSpec {
    pub name: String,
    pub kind: OptionKind,
    #[serde(default)]
    pub termination: Termination,
    /// Pseudo-reward given to the invoked level when this option terminates
    /// through its own condition. Never passed up.
    #[serde(default)]
    pub subgoal_reward: f64,
}

impl OptionSpec {
    /// Primitive option lasting one tick.
    pub fn primitive(name: impl Into<String>, action: usize) -> Self {
        Self {
            name: name.into(),
            kind: OptionKind::Primitive { action },
            termination: Termination::Ticks(1),
            subgoal_reward: 0.0,
        }
    }

    pub fn composite(name: impl Into<String>, sub_level: usize, termination: Termination) -> Self {
        Self {
            name: name.into(),
            kind: OptionKind::Composite { sub_level },
            termination,
            subgoal_reward: 0.0,
        }
    }

    pub fn with_termination(mut self, termination: Termination) -> Self {
        self.termination = termination;
        self
    }

    pub fn with_subgoal_reward(mut self, reward: f64) -> Self {
        self.subgoal_reward = reward;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelSpec {
    pub name: String,
    /// Discount factor γ per tick
    pub discount: f64,
    /// Overrides the global learning rate for this level
    #[serde(default)]
    pub learning_rate: Option<f64>,
    #[serde(default)]
    pub estimator: EstimatorSpec,
    pub options: Vec<OptionSpec>,
}

impl LevelSpec {
    pub fn new(name: impl Into<String>, discount: f64, options: Vec<OptionSpec>) -> Self {
        Self {
            name: name.into(),
            discount,
            learning_rate: None,
            estimator: EstimatorSpec::default(),
            options,
        }
    }

    pub fn with_estimator(mut self, estimator: EstimatorSpec) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = Some(learning_rate);
        self
    }
}

/// Whole option tree, level 0 first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HierarchySpec {
    pub levels: Vec<LevelSpec>,
}

impl HierarchySpec {
    pub fn new(levels: Vec<LevelSpec>) -> Self {
        Self { levels }
    }

    /// Reject malformed hierarchies before anything is built.
    ///
    /// # Errors
    /// - `InvalidParameter` for discount or learning rates outside (0, 1]
    /// - `EmptyLevel`, `UndefinedSubLevel`, `Cycle`, `MultipleParents`,
    ///   `UnreachableLevel` or `DepthExceeded` for structural faults
    pub fn validate(&self) -> HrlResult<()> {
        self.validate_levels(None)?;
        let parents = self.parent_table()?;
        self.check_tree(&parents)
    }

    /// [`validate`](Self::validate) plus observation-dependent checks.
    pub(crate) fn validate_for(&self, observation_dim: usize) -> HrlResult<()> {
        self.validate_levels(Some(observation_dim))?;
        let parents = self.parent_table()?;
        self.check_tree(&parents)
    }

    /// Parent level of each level (`None` for the top).
    ///
    /// Only meaningful on a validated spec.
    pub fn parents(&self) -> Vec<Option<usize>> {
        let mut parents = vec![None; self.levels.len()];
        for (level, spec) in self.levels.iter().enumerate() {
            for option in &spec.options {
                if let OptionKind::Composite { sub_level } = option.kind {
                    if let Some(slot) = parents.get_mut(sub_level) {
                        slot.get_or_insert(level);
                    }
                }
            }
        }
        parents
    }

    /// Number of levels on the longest root-to-leaf path.
    pub fn depth(&self) -> usize {
        let parents = self.parents();
        (0..self.levels.len())
            .map(|l| chain_length(&parents, l).unwrap_or(usize::MAX))
            .max()
            .unwrap_or(0)
    }

    fn validate_levels(&self, observation_dim: Option<usize>) -> HrlResult<()> {
        if self.levels.is_empty() {
            return Err(HrlError::EmptyLevel {
                level: 0,
                name: "<hierarchy has no levels>".to_string(),
            });
        }
        for (level, spec) in self.levels.iter().enumerate() {
            check_unit_interval(&format!("levels[{}].discount", level), spec.discount)?;
            if let Some(lr) = spec.learning_rate {
                check_unit_interval(&format!("levels[{}].learning_rate", level), lr)?;
            }
            spec.estimator.validate()?;
            if spec.options.is_empty() {
                return Err(HrlError::EmptyLevel {
                    level,
                    name: spec.name.clone(),
                });
            }
            for option in &spec.options {
                if !option.subgoal_reward.is_finite() {
                    return Err(HrlError::InvalidParameter {
                        name: format!("{}.subgoal_reward", option.name),
                        value: option.subgoal_reward,
                        expected: "a finite value",
                    });
                }
                option.termination.validate(observation_dim)?;
                if let OptionKind::Composite { sub_level } = option.kind {
                    if sub_level >= self.levels.len() {
                        return Err(HrlError::UndefinedSubLevel {
                            level,
                            option: option.name.clone(),
                            sub_level,
                        });
                    }
                    // The top level has no parent, so invoking it always closes a loop
                    if sub_level == 0 || sub_level == level {
                        return Err(HrlError::Cycle { level: sub_level });
                    }
                }
            }
        }
        Ok(())
    }

    fn parent_table(&self) -> HrlResult<Vec<Option<usize>>> {
        let mut parents: Vec<Option<usize>> = vec![None; self.levels.len()];
        for (level, spec) in self.levels.iter().enumerate() {
            for option in &spec.options {
                if let OptionKind::Composite { sub_level } = option.kind {
                    match parents[sub_level] {
                        Some(first) if first != level => {
                            return Err(HrlError::MultipleParents {
                                level: sub_level,
                                first,
                                second: level,
                            });
                        }
                        _ => parents[sub_level] = Some(level),
                    }
                }
            }
        }
        Ok(parents)
    }

    fn check_tree(&self, parents: &[Option<usize>]) -> HrlResult<()> {
        for level in 1..self.levels.len() {
            if parents[level].is_none() {
                return Err(HrlError::UnreachableLevel { level });
            }
        }
        for level in 0..self.levels.len() {
            let depth = chain_length(parents, level).ok_or(HrlError::Cycle { level })?;
            if depth > MAX_DEPTH {
                return Err(HrlError::DepthExceeded {
                    depth,
                    max: MAX_DEPTH,
                });
            }
        }
        Ok(())
    }
}

/// Levels from `level` up to the root, inclusive. `None` on a loop.
fn chain_length(parents: &[Option<usize>], level: usize) -> Option<usize> {
    let mut length = 1;
    let mut current = level;
    while let Some(parent) = parents.get(current).copied().flatten() {
        length += 1;
        if length > parents.len() {
            return None;
        }
        current = parent;
    }
    Some(length)
}
