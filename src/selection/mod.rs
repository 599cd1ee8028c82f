//! Competitive action selection.
//!
//! Options at a level compete on their current value estimates. Two
//! competition rules are provided, both strictly increasing in value:
//!
//! - **Softmax**: `P(o) ∝ exp(Q(s, o) / τ)` with temperature τ
//! - **NoisyMax**: basal-ganglia style winner-take-all, `argmax Q(s, o) + ξ_o`
//!   with `ξ_o ~ N(0, σ²)`
//!
//! The exploration parameter is τ for softmax and σ for noisy max. Under
//! [`SelectionMode::Exploit`] both collapse to a deterministic argmax where
//! ties go to the first option in definition order.

use crate::core::{HrlError, HrlResult, State};
use crate::value::ValueEstimator;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectionMode {
    /// Sample from the competition rule
    Explore,
    /// Deterministic argmax, first-defined option wins ties
    Exploit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompetitionRule {
    Softmax,
    NoisyMax,
}

/// Whether annealing counts episodes or ticks within the current episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnnealScope {
    AcrossEpisodes,
    WithinEpisode,
}

/// How the exploration parameter evolves.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ExplorationSchedule {
    Fixed(f64),
    /// `end + (start − end) · exp(−rate · n)`
    Annealed {
        start: f64,
        end: f64,
        rate: f64,
        scope: AnnealScope,
    },
}

impl ExplorationSchedule {
    /// Exploration parameter for the given episode index and tick within it.
    pub fn parameter(&self, episode: usize, tick_in_episode: u64) -> f64 {
        match *self {
            ExplorationSchedule::Fixed(t) => t,
            ExplorationSchedule::Annealed {
                start,
                end,
                rate,
                scope,
            } => {
                let n = match scope {
                    AnnealScope::AcrossEpisodes => episode as f64,
                    AnnealScope::WithinEpisode => tick_in_episode as f64,
                };
                end + (start - end) * (-rate * n).exp()
            }
        }
    }

    pub fn validate(&self) -> HrlResult<()> {
        let check = |name: &str, v: f64| {
            if v.is_finite() && v >= 0.0 {
                Ok(())
            } else {
                Err(HrlError::InvalidParameter {
                    name: name.to_string(),
                    value: v,
                    expected: "a finite, non-negative value",
                })
            }
        };
        match *self {
            ExplorationSchedule::Fixed(t) => check("exploration", t),
            ExplorationSchedule::Annealed {
                start, end, rate, ..
            } => {
                check("exploration.start", start)?;
                check("exploration.end", end)?;
                check("exploration.rate", rate)
            }
        }
    }
}

/// Exploration settings shared by every level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExplorationConfig {
    pub mode: SelectionMode,
    pub rule: CompetitionRule,
    pub schedule: ExplorationSchedule,
}

impl Default for ExplorationConfig {
    fn default() -> Self {
        Self {
            mode: SelectionMode::Explore,
            rule: CompetitionRule::Softmax,
            schedule: ExplorationSchedule::Fixed(0.1),
        }
    }
}

/// Index of the largest value; the first one wins ties.
pub fn argmax_first(values: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &v) in values.iter().enumerate() {
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}

/// Softmax over `values` at `temperature`.
///
/// Non-positive temperatures give a one-hot distribution on the first argmax.
pub fn softmax_probabilities(values: &[f64], temperature: f64) -> Vec<f64> {
    if values.is_empty() {
        return Vec::new();
    }
    if temperature <= 0.0 {
        let mut p = vec![0.0; values.len()];
        if let Some(i) = argmax_first(values) {
            p[i] = 1.0;
        }
        return p;
    }
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = values
        .iter()
        .map(|&v| ((v - max) / temperature).exp())
        .collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Chooses among a level's available options.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActionSelector {
    pub rule: CompetitionRule,
    pub mode: SelectionMode,
}

impl ActionSelector {
    pub fn new(rule: CompetitionRule, mode: SelectionMode) -> Self {
        Self { rule, mode }
    }

    /// Select an option for `state` among `available` (option indices).
    ///
    /// # Errors
    /// - `EmptyLevel` if `available` is empty
    /// - `UnknownOption` if an index exceeds the estimator's option count
    pub fn select<R: Rng + ?Sized>(
        &self,
        level: usize,
        estimator: &dyn ValueEstimator,
        state: &State,
        available: &[usize],
        exploration: f64,
        rng: &mut R,
    ) -> HrlResult<usize> {
        if available.is_empty() {
            return Err(HrlError::EmptyLevel {
                level,
                name: "no available options".to_string(),
            });
        }
        if let Some(&option) = available.iter().find(|&&o| o >= estimator.num_options()) {
            return Err(HrlError::UnknownOption { level, option });
        }
        let all = estimator.values(state);
        let values: Vec<f64> = available.iter().map(|&o| all[o]).collect();
        let pick = self.select_from_values(&values, exploration, rng)?;
        Ok(available[pick])
    }

    /// Select an index into `values`.
    pub fn select_from_values<R: Rng + ?Sized>(
        &self,
        values: &[f64],
        exploration: f64,
        rng: &mut R,
    ) -> HrlResult<usize> {
        let greedy = argmax_first(values).ok_or_else(|| HrlError::EmptyLevel {
            level: 0,
            name: "no values to select from".to_string(),
        })?;
        if self.mode == SelectionMode::Exploit || exploration <= 0.0 {
            return Ok(greedy);
        }

        match self.rule {
            CompetitionRule::Softmax => {
                let probs = softmax_probabilities(values, exploration);
                let u: f64 = rng.gen();
                let mut acc = 0.0;
                for (i, p) in probs.iter().enumerate() {
                    acc += p;
                    if u < acc {
                        return Ok(i);
                    }
                }
                // Rounding left `acc` just below 1
                Ok(probs.len() - 1)
            }
            CompetitionRule::NoisyMax => {
                let noise = Normal::new(0.0, exploration).map_err(|_| {
                    HrlError::InvalidParameter {
                        name: "exploration".to_string(),
                        value: exploration,
                        expected: "a finite noise standard deviation",
                    }
                })?;
                let noisy: Vec<f64> = values.iter().map(|&v| v + noise.sample(&mut *rng)).collect();
                Ok(argmax_first(&noisy).unwrap_or(greedy))
            }
        }
    }
}
