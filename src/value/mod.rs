//! Value estimators: the read/update boundary to the representation backend.
//!
//! The engine only ever asks two things of a level's value representation:
//! - **decode**: `value_of(s, o)`, the current scalar estimate of Q(s, o)
//! - **encode**: `update(s, o, target, e, η)`, push the estimate toward `target`
//!
//! Any backend satisfying this contract can be swapped in without altering the
//! learning algorithm. Three are provided:
//!
//! - [`TabularEstimator`]: one entry per quantised state
//! - [`LinearEstimator`]: linear read-out over the raw feature vector
//! - [`PopulationEstimator`]: linear read-out over a rectified population code
//!
//! ## Update Rule
//!
//! Every backend applies the same incremental blend
//! ```text
//! Q(s, o) <- Q(s, o) + η·e · (target − Q(s, o))      with η·e ∈ [0, 1]
//! ```
//! The function-approximation backends realise it with a normalised LMS step,
//! `Δw = η·e·(target − Q)·φ / (‖φ‖² + 1)`, which lands exactly on the blend
//! for the updated pair and can never overshoot its target. Estimates therefore
//! stay within the range of the targets they have seen, however often
//! competing options push on overlapping features.

use crate::core::{HrlError, HrlResult, State, StateKey};
use ndarray::{Array1, Array2, Axis};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::distributions::Uniform;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Read/update contract for a level's action-value representation.
pub trait ValueEstimator: Send + Sync + fmt::Debug {
    /// Current estimate of Q(state, option). Pure read.
    ///
    /// Panics if `option >= num_options()` or the state has the wrong width.
    fn value_of(&self, state: &State, option: usize) -> f64;

    /// Estimates for every option in `state`.
    fn values(&self, state: &State) -> Vec<f64> {
        (0..self.num_options())
            .map(|o| self.value_of(state, o))
            .collect()
    }

    /// Blend Q(state, option) toward `target` with step `learning_rate * eligibility`.
    ///
    /// Returns the new estimate.
    fn update(
        &mut self,
        state: &State,
        option: usize,
        target: f64,
        eligibility: f64,
        learning_rate: f64,
    ) -> HrlResult<f64>;

    fn num_options(&self) -> usize;

    /// Width of the state vectors this estimator accepts.
    fn input_dim(&self) -> usize;

    /// Name for logging and checkpoints
    fn name(&self) -> &'static str;

    /// Serializable copy of the learned parameters.
    fn snapshot(&self) -> EstimatorSnapshot;

    /// Load parameters previously produced by [`ValueEstimator::snapshot`].
    fn restore(&mut self, snapshot: &EstimatorSnapshot) -> HrlResult<()>;
}

/// Backend selection and hyperparameters for one level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EstimatorSpec {
    Tabular {
        initial_value: f64,
    },
    Linear {
        initial_value: f64,
    },
    Population {
        /// Number of neurons in the state population
        neurons: usize,
        /// Lower bound of the firing-threshold range
        intercept_low: f64,
        /// Upper bound of the firing-threshold range
        intercept_high: f64,
        /// Gains are drawn from U(1, max_gain)
        max_gain: f64,
        initial_value: f64,
    },
}

impl Default for EstimatorSpec {
    fn default() -> Self {
        EstimatorSpec::Tabular { initial_value: 0.0 }
    }
}

impl EstimatorSpec {
    /// Default population code: 200 neurons, thresholds in [-0.2, 0.2].
    pub fn population() -> Self {
        EstimatorSpec::Population {
            neurons: 200,
            intercept_low: -0.2,
            intercept_high: 0.2,
            max_gain: 2.0,
            initial_value: 0.0,
        }
    }

    /// Validate hyperparameters.
    pub fn validate(&self) -> HrlResult<()> {
        match *self {
            EstimatorSpec::Tabular { initial_value } | EstimatorSpec::Linear { initial_value } => {
                check_finite("initial_value", initial_value)
            }
            EstimatorSpec::Population {
                neurons,
                intercept_low,
                intercept_high,
                max_gain,
                initial_value,
            } => {
                check_finite("initial_value", initial_value)?;
                check_finite("intercept_low", intercept_low)?;
                check_finite("intercept_high", intercept_high)?;
                if neurons == 0 {
                    return Err(HrlError::InvalidParameter {
                        name: "neurons".to_string(),
                        value: 0.0,
                        expected: "at least one neuron",
                    });
                }
                if !(intercept_low < intercept_high) {
                    return Err(HrlError::InvalidParameter {
                        name: "intercept_high".to_string(),
                        value: intercept_high,
                        expected: "greater than intercept_low",
                    });
                }
                if !(max_gain >= 1.0) || !max_gain.is_finite() {
                    return Err(HrlError::InvalidParameter {
                        name: "max_gain".to_string(),
                        value: max_gain,
                        expected: "a finite value >= 1",
                    });
                }
                Ok(())
            }
        }
    }

    /// Build the backend for a level with `input_dim` features and `num_options` options.
    ///
    /// # Errors
    /// - `InvalidParameter` if the hyperparameters are inconsistent
    pub fn build<R: Rng + ?Sized>(
        &self,
        input_dim: usize,
        num_options: usize,
        rng: &mut R,
    ) -> HrlResult<Box<dyn ValueEstimator>> {
        self.validate()?;
        Ok(match *self {
            EstimatorSpec::Tabular { initial_value } => Box::new(TabularEstimator::new(
                input_dim,
                num_options,
                initial_value,
            )),
            EstimatorSpec::Linear { initial_value } => Box::new(LinearEstimator::new(
                input_dim,
                num_options,
                initial_value,
            )),
            EstimatorSpec::Population {
                neurons,
                intercept_low,
                intercept_high,
                max_gain,
                initial_value,
            } => Box::new(PopulationEstimator::new(
                input_dim,
                num_options,
                neurons,
                (intercept_low, intercept_high),
                max_gain,
                initial_value,
                rng,
            )),
        })
    }
}

/// Learned parameters of any backend, for checkpointing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EstimatorSnapshot {
    Tabular {
        input_dim: usize,
        num_options: usize,
        initial_value: f64,
        entries: Vec<(StateKey, Vec<f64>)>,
    },
    Linear {
        weights: Array2<f64>,
        bias: Array1<f64>,
    },
    Population {
        encoders: Array2<f64>,
        gains: Array1<f64>,
        intercepts: Array1<f64>,
        decoders: Array2<f64>,
        offsets: Array1<f64>,
    },
}

impl EstimatorSnapshot {
    pub fn kind(&self) -> &'static str {
        match self {
            EstimatorSnapshot::Tabular { .. } => "tabular",
            EstimatorSnapshot::Linear { .. } => "linear",
            EstimatorSnapshot::Population { .. } => "population",
        }
    }
}

fn check_finite(name: &str, value: f64) -> HrlResult<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(HrlError::InvalidParameter {
            name: name.to_string(),
            value,
            expected: "a finite value",
        })
    }
}

/// Step size `η·e`, forced into [0, 1].
fn step_size(eligibility: f64, learning_rate: f64) -> f64 {
    (eligibility * learning_rate).clamp(0.0, 1.0)
}

fn check_update_args(
    state: &State,
    option: usize,
    target: f64,
    input_dim: usize,
    num_options: usize,
) -> HrlResult<()> {
    if state.dim() != input_dim {
        return Err(HrlError::DimensionMismatch {
            expected: input_dim,
            got: state.dim(),
        });
    }
    if option >= num_options {
        return Err(HrlError::UnknownOption { level: 0, option });
    }
    check_finite("target", target)
}

fn mismatched_snapshot(expected: &'static str, got: &EstimatorSnapshot) -> HrlError {
    HrlError::SnapshotMismatch {
        expected: format!("`{}` parameters", expected),
        got: format!("`{}` parameters", got.kind()),
    }
}

// ============================================================================
// Tabular
// ============================================================================

/// One row of option values per quantised state.
#[derive(Debug, Clone)]
pub struct TabularEstimator {
    input_dim: usize,
    num_options: usize,
    initial_value: f64,
    table: HashMap<StateKey, Vec<f64>>,
}

impl TabularEstimator {
    pub fn new(input_dim: usize, num_options: usize, initial_value: f64) -> Self {
        Self {
            input_dim,
            num_options,
            initial_value,
            table: HashMap::new(),
        }
    }

    /// Number of states with at least one update.
    pub fn visited_states(&self) -> usize {
        self.table.len()
    }
}

impl ValueEstimator for TabularEstimator {
    fn value_of(&self, state: &State, option: usize) -> f64 {
        assert!(option < self.num_options, "option {} out of range", option);
        self.table
            .get(&state.key())
            .map_or(self.initial_value, |row| row[option])
    }

    fn update(
        &mut self,
        state: &State,
        option: usize,
        target: f64,
        eligibility: f64,
        learning_rate: f64,
    ) -> HrlResult<f64> {
        check_update_args(state, option, target, self.input_dim, self.num_options)?;
        let step = step_size(eligibility, learning_rate);
        let (n, init) = (self.num_options, self.initial_value);
        let row = self
            .table
            .entry(state.key())
            .or_insert_with(|| vec![init; n]);
        row[option] += step * (target - row[option]);
        Ok(row[option])
    }

    fn num_options(&self) -> usize {
        self.num_options
    }

    fn input_dim(&self) -> usize {
        self.input_dim
    }

    fn name(&self) -> &'static str {
        "tabular"
    }

    fn snapshot(&self) -> EstimatorSnapshot {
        let mut entries: Vec<(StateKey, Vec<f64>)> = self
            .table
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        EstimatorSnapshot::Tabular {
            input_dim: self.input_dim,
            num_options: self.num_options,
            initial_value: self.initial_value,
            entries,
        }
    }

    fn restore(&mut self, snapshot: &EstimatorSnapshot) -> HrlResult<()> {
        match snapshot {
            EstimatorSnapshot::Tabular {
                input_dim,
                num_options,
                initial_value,
                entries,
            } => {
                if *input_dim != self.input_dim {
                    return Err(HrlError::DimensionMismatch {
                        expected: self.input_dim,
                        got: *input_dim,
                    });
                }
                if *num_options != self.num_options {
                    return Err(HrlError::DimensionMismatch {
                        expected: self.num_options,
                        got: *num_options,
                    });
                }
                if let Some((_, row)) = entries.iter().find(|(_, row)| row.len() != self.num_options) {
                    return Err(HrlError::DimensionMismatch {
                        expected: self.num_options,
                        got: row.len(),
                    });
                }
                self.initial_value = *initial_value;
                self.table = entries.iter().cloned().collect();
                Ok(())
            }
            other => Err(mismatched_snapshot("tabular", other)),
        }
    }
}

// ============================================================================
// Linear basis
// ============================================================================

/// Q(s, o) = w_o · φ(s) + b_o over the raw feature vector.
#[derive(Debug, Clone)]
pub struct LinearEstimator {
    /// Shape (num_options, input_dim)
    weights: Array2<f64>,
    /// Shape (num_options)
    bias: Array1<f64>,
}

impl LinearEstimator {
    /// Zero weights; every option starts at `initial_value` through its bias.
    pub fn new(input_dim: usize, num_options: usize, initial_value: f64) -> Self {
        Self {
            weights: Array2::zeros((num_options, input_dim)),
            bias: Array1::from_elem(num_options, initial_value),
        }
    }

    pub fn weights(&self) -> &Array2<f64> {
        &self.weights
    }
}

impl ValueEstimator for LinearEstimator {
    fn value_of(&self, state: &State, option: usize) -> f64 {
        self.weights.row(option).dot(state.features()) + self.bias[option]
    }

    fn values(&self, state: &State) -> Vec<f64> {
        (self.weights.dot(state.features()) + &self.bias).to_vec()
    }

    fn update(
        &mut self,
        state: &State,
        option: usize,
        target: f64,
        eligibility: f64,
        learning_rate: f64,
    ) -> HrlResult<f64> {
        check_update_args(
            state,
            option,
            target,
            self.weights.ncols(),
            self.weights.nrows(),
        )?;
        let step = step_size(eligibility, learning_rate);
        let current = self.value_of(state, option);
        let scale = step * (target - current) / (state.norm_sq() + 1.0);

        self.weights
            .row_mut(option)
            .scaled_add(scale, state.features());
        self.bias[option] += scale;

        Ok(self.value_of(state, option))
    }

    fn num_options(&self) -> usize {
        self.weights.nrows()
    }

    fn input_dim(&self) -> usize {
        self.weights.ncols()
    }

    fn name(&self) -> &'static str {
        "linear"
    }

    fn snapshot(&self) -> EstimatorSnapshot {
        EstimatorSnapshot::Linear {
            weights: self.weights.clone(),
            bias: self.bias.clone(),
        }
    }

    fn restore(&mut self, snapshot: &EstimatorSnapshot) -> HrlResult<()> {
        match snapshot {
            EstimatorSnapshot::Linear { weights, bias } => {
                if weights.dim() != self.weights.dim() {
                    return Err(HrlError::DimensionMismatch {
                        expected: self.weights.len(),
                        got: weights.len(),
                    });
                }
                if bias.len() != self.bias.len() {
                    return Err(HrlError::DimensionMismatch {
                        expected: self.bias.len(),
                        got: bias.len(),
                    });
                }
                self.weights.assign(weights);
                self.bias.assign(bias);
                Ok(())
            }
            other => Err(mismatched_snapshot("linear", other)),
        }
    }
}

// ============================================================================
// Population code
// ============================================================================

/// Rate-coded population with a learned linear decoder per option.
///
/// # Encoding
///
/// Neuron `i` has a unit encoder `e_i`, gain `g_i` and intercept `c_i`:
/// ```text
/// a_i(s) = g_i · max(0, e_i · s − c_i)
/// ```
///
/// # Decoding
///
/// `Q(s, o) = d_o · a(s) + b_o`. Learning adjusts the decoders `d_o` and
/// offsets `b_o` only; the encoding is fixed at construction.
#[derive(Debug, Clone)]
pub struct PopulationEstimator {
    /// Shape (neurons, input_dim), rows are unit vectors
    encoders: Array2<f64>,
    gains: Array1<f64>,
    intercepts: Array1<f64>,
    /// Shape (num_options, neurons)
    decoders: Array2<f64>,
    offsets: Array1<f64>,
}

impl PopulationEstimator {
    pub fn new<R: Rng + ?Sized>(
        input_dim: usize,
        num_options: usize,
        neurons: usize,
        intercept_range: (f64, f64),
        max_gain: f64,
        initial_value: f64,
        rng: &mut R,
    ) -> Self {
        let mut encoders: Array2<f64> =
            Array2::random_using((neurons, input_dim), StandardNormal, rng);
        for mut row in encoders.axis_iter_mut(Axis(0)) {
            let norm = row.dot(&row).sqrt();
            if norm > 0.0 {
                row /= norm;
            }
        }

        let intercepts = Array1::random_using(
            neurons,
            Uniform::new(intercept_range.0, intercept_range.1),
            rng,
        );
        let gains = if max_gain > 1.0 {
            Array1::random_using(neurons, Uniform::new(1.0, max_gain), rng)
        } else {
            Array1::ones(neurons)
        };

        Self {
            encoders,
            gains,
            intercepts,
            decoders: Array2::zeros((num_options, neurons)),
            offsets: Array1::from_elem(num_options, initial_value),
        }
    }

    /// Firing rates of the population for `state`.
    pub fn activities(&self, state: &State) -> Array1<f64> {
        let drive = self.encoders.dot(state.features()) - &self.intercepts;
        drive.mapv(|x| x.max(0.0)) * &self.gains
    }

    pub fn neurons(&self) -> usize {
        self.encoders.nrows()
    }
}

impl ValueEstimator for PopulationEstimator {
    fn value_of(&self, state: &State, option: usize) -> f64 {
        self.decoders.row(option).dot(&self.activities(state)) + self.offsets[option]
    }

    fn values(&self, state: &State) -> Vec<f64> {
        (self.decoders.dot(&self.activities(state)) + &self.offsets).to_vec()
    }

    fn update(
        &mut self,
        state: &State,
        option: usize,
        target: f64,
        eligibility: f64,
        learning_rate: f64,
    ) -> HrlResult<f64> {
        check_update_args(
            state,
            option,
            target,
            self.encoders.ncols(),
            self.decoders.nrows(),
        )?;
        let step = step_size(eligibility, learning_rate);
        let activity = self.activities(state);
        let current = self.decoders.row(option).dot(&activity) + self.offsets[option];
        let scale = step * (target - current) / (activity.dot(&activity) + 1.0);

        self.decoders.row_mut(option).scaled_add(scale, &activity);
        self.offsets[option] += scale;

        Ok(self.value_of(state, option))
    }

    fn num_options(&self) -> usize {
        self.decoders.nrows()
    }

    fn input_dim(&self) -> usize {
        self.encoders.ncols()
    }

    fn name(&self) -> &'static str {
        "population"
    }

    fn snapshot(&self) -> EstimatorSnapshot {
        EstimatorSnapshot::Population {
            encoders: self.encoders.clone(),
            gains: self.gains.clone(),
            intercepts: self.intercepts.clone(),
            decoders: self.decoders.clone(),
            offsets: self.offsets.clone(),
        }
    }

    fn restore(&mut self, snapshot: &EstimatorSnapshot) -> HrlResult<()> {
        match snapshot {
            EstimatorSnapshot::Population {
                encoders,
                gains,
                intercepts,
                decoders,
                offsets,
            } => {
                let neurons = encoders.nrows();
                if encoders.ncols() != self.encoders.ncols() {
                    return Err(HrlError::DimensionMismatch {
                        expected: self.encoders.ncols(),
                        got: encoders.ncols(),
                    });
                }
                if decoders.dim() != (self.decoders.nrows(), neurons) {
                    return Err(HrlError::DimensionMismatch {
                        expected: self.decoders.nrows() * neurons,
                        got: decoders.len(),
                    });
                }
                if gains.len() != neurons || intercepts.len() != neurons {
                    return Err(HrlError::DimensionMismatch {
                        expected: neurons,
                        got: gains.len().min(intercepts.len()),
                    });
                }
                if offsets.len() != self.offsets.len() {
                    return Err(HrlError::DimensionMismatch {
                        expected: self.offsets.len(),
                        got: offsets.len(),
                    });
                }
                self.encoders = encoders.clone();
                self.gains = gains.clone();
                self.intercepts = intercepts.clone();
                self.decoders = decoders.clone();
                self.offsets = offsets.clone();
                Ok(())
            }
            other => Err(mismatched_snapshot("population", other)),
        }
    }
}
