//! Tick-driven runtime for a validated [`HierarchySpec`].
//!
//! # Per-level state machine
//!
//! ```text
//! Idle ──decide──▶ OptionActive ──terminated / invocation ended / episode end──▶ Closing ──▶ Idle
//! ```
//!
//! # One tick
//!
//! 1. Decay every level's traces by the elapsed ticks
//! 2. Credit the reward (earned by the previous action) to the deepest active
//!    level's interval and to that level's invocation return
//! 3. Find the top-most level on the active path whose option terminated
//! 4. Close it and every level beneath it, bottom-up; each sub-level's
//!    invocation return becomes the single-tick reward of its parent's interval
//!    and is added to the parent's own invocation return
//! 5. Open new decisions top-down until a primitive option is reached
//! 6. Emit the primitive action and advance the clock
//!
//! Closing a level records its (state, option) pair in its traces, computes
//! the SMDP TD error over the measured interval and applies the learning rule.

use super::{HierarchySpec, OptionKind};
use crate::checkpoint::CheckpointData;
use crate::core::{Clock, HrlError, HrlResult, State};
use crate::learning::{LearningRule, UpdateStats};
use crate::selection::{
    argmax_first, softmax_probabilities, ActionSelector, CompetitionRule, SelectionMode,
};
use crate::td::{TdError, TdErrorComputer};
use crate::traces::TraceBuffer;
use crate::value::ValueEstimator;
use crate::{Config, InterruptionPolicy};
use log::{debug, info, trace, warn};
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// Draws used to estimate noisy-max choice probabilities.
const NOISY_MAX_SAMPLES: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LevelPhase {
    Idle,
    OptionActive,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EpisodeEnd {
    /// The environment reached a terminal state: nothing to bootstrap from
    Terminal,
    /// Cut short by a tick limit: bootstrap from the greedy value
    Truncated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    /// The option's own termination condition fired
    Terminated,
    /// An ancestor's option terminated, ending this level's invocation
    InvocationEnded,
    /// Forced by the end of the episode
    EpisodeEnd,
}

/// A decision opened during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub level: usize,
    pub option: usize,
    /// Exploration parameter in effect
    pub exploration: f64,
}

/// A decision interval that closed, with the learning it triggered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedInterval {
    pub level: usize,
    pub option: usize,
    /// Discounted reward accrued over the interval
    pub reward: f64,
    pub elapsed_ticks: u64,
    pub reason: CloseReason,
    pub td_error: TdError,
    /// Invocation return handed to the parent level, if any
    pub passed_up: Option<f64>,
    pub update: UpdateStats,
}

#[derive(Debug, Clone)]
pub struct TickOutcome {
    pub tick: u64,
    /// Environment action to execute
    pub action: usize,
    pub decisions: Vec<Decision>,
    /// Intervals closed this tick, in closing order (bottom-up)
    pub closed: Vec<ClosedInterval>,
}

#[derive(Debug, Clone)]
pub struct EpisodeSummary {
    pub episode: usize,
    pub ticks: u64,
    /// Intervals force-closed at episode end, bottom-up
    pub closed: Vec<ClosedInterval>,
}

/// An open decision interval.
#[derive(Debug, Clone)]
struct ActiveOption {
    option: usize,
    /// Level state (with context block) when the option was chosen
    state: State,
    opened_at: u64,
    /// Reward discounted to `opened_at`
    reward: f64,
    deadline: Option<u64>,
}

/// A running invocation of a level by its parent's composite option.
#[derive(Debug, Clone, Copy)]
struct Invocation {
    started_at: u64,
    /// Parent option index, routed down as context
    context: Option<usize>,
    /// Return discounted by this level's γ to `started_at`
    accrued: f64,
}

#[derive(Debug)]
struct LevelRuntime {
    estimator: Box<dyn ValueEstimator>,
    traces: TraceBuffer,
    parent: Option<usize>,
    /// Width of the context block (parent option count)
    context_dim: usize,
    learning: LearningRule,
    phase: LevelPhase,
    active: Option<ActiveOption>,
    invocation: Option<Invocation>,
}

impl LevelRuntime {
    fn state_for(&self, observation: &Array1<f64>, context: Option<usize>) -> State {
        let base = State::new(observation.clone());
        match self.parent {
            // Without a parent option the context block stays all-zero
            Some(_) => base.with_context(context.unwrap_or(usize::MAX), self.context_dim),
            None => base,
        }
    }

    fn greedy_value(&self, state: &State) -> f64 {
        self.estimator
            .values(state)
            .into_iter()
            .fold(f64::NEG_INFINITY, f64::max)
    }
}

/// Runs every level of the hierarchy against a tick-driven environment.
#[derive(Debug)]
pub struct HierarchyCoordinator {
    spec: HierarchySpec,
    config: Config,
    observation_dim: usize,
    levels: Vec<LevelRuntime>,
    /// Levels with a running invocation, top first
    path: Vec<usize>,
    selector: ActionSelector,
    td: TdErrorComputer,
    rng: StdRng,
    episode: usize,
    episode_start: u64,
    last_tick: Option<u64>,
}

impl HierarchyCoordinator {
    /// Validate the configuration and build one estimator and trace buffer
    /// per level.
    ///
    /// # Errors
    /// Any configuration error; nothing is built if one is found.
    pub fn new(
        spec: HierarchySpec,
        config: Config,
        observation_dim: usize,
        seed: u64,
    ) -> HrlResult<Self> {
        config.validate()?;
        spec.validate_for(observation_dim)?;

        let mut rng = StdRng::seed_from_u64(seed);
        let parents = spec.parents();
        let mut levels = Vec::with_capacity(spec.levels.len());

        for (index, level) in spec.levels.iter().enumerate() {
            let parent = parents[index];
            let context_dim = parent.map_or(0, |p| spec.levels[p].options.len());
            let estimator =
                level
                    .estimator
                    .build(observation_dim + context_dim, level.options.len(), &mut rng)?;
            debug!(
                "level {} (`{}`): {} options, {} backend, input dim {}",
                index,
                level.name,
                level.options.len(),
                estimator.name(),
                estimator.input_dim()
            );
            levels.push(LevelRuntime {
                estimator,
                traces: TraceBuffer::new(
                    config.trace_decay,
                    config.trace_threshold,
                    config.trace_mode,
                ),
                parent,
                context_dim,
                learning: LearningRule::new(
                    level.learning_rate.unwrap_or(config.learning_rate),
                    config.divergence_bound,
                ),
                phase: LevelPhase::Idle,
                active: None,
                invocation: None,
            });
        }

        info!(
            "hierarchy ready: {} levels, depth {}, observation dim {}",
            levels.len(),
            spec.depth(),
            observation_dim
        );

        Ok(Self {
            selector: ActionSelector::new(config.exploration.rule, config.exploration.mode),
            td: TdErrorComputer::new(config.error_clip, config.negative_value_bias)
                .with_discount_mode(config.discount_mode),
            spec,
            config,
            observation_dim,
            levels,
            path: Vec::new(),
            rng,
            episode: 0,
            episode_start: 0,
            last_tick: None,
        })
    }

    // ========================================================================
    // Episode lifecycle
    // ========================================================================

    /// Clear traces and per-episode bookkeeping.
    pub fn begin_episode(&mut self, clock: &Clock) {
        for level in &mut self.levels {
            level.traces.reset();
            level.active = None;
            level.invocation = None;
            level.phase = LevelPhase::Idle;
        }
        self.path.clear();
        self.episode_start = clock.now();
        self.last_tick = Some(clock.now());
        trace!("episode {} begins at tick {}", self.episode, clock.now());
    }

    /// Advance one tick.
    ///
    /// `reward` is the reward the environment produced for the action emitted
    /// on the previous tick; it is ignored when no option is active.
    ///
    /// # Errors
    /// - `DimensionMismatch` if the observation has the wrong width
    /// - `Divergence` if a learning update leaves the sanity bound
    ///
    /// After a `Divergence` the episode is abandoned: every level is back to
    /// `Idle` with nothing open, and the next call should be
    /// [`begin_episode`](Self::begin_episode).
    pub fn tick(
        &mut self,
        clock: &mut Clock,
        observation: &Array1<f64>,
        reward: f64,
    ) -> HrlResult<TickOutcome> {
        self.check_observation(observation)?;
        let now = clock.now();
        self.decay_traces(now);
        self.credit_reward(now, reward);

        let mut closed = Vec::new();
        if let Some(topmost) = self.topmost_terminated(now, observation) {
            if let Err(err) = self.close_from(topmost, now, observation, &mut closed) {
                self.abandon_episode(now);
                return Err(err);
            }
        }

        let (action, decisions) = match self.open_decisions(now, observation) {
            Ok(opened) => opened,
            Err(err) => {
                self.abandon_episode(now);
                return Err(err);
            }
        };
        clock.advance();

        Ok(TickOutcome {
            tick: now,
            action,
            decisions,
            closed,
        })
    }

    /// Force-close every active level bottom-up and finish the episode.
    ///
    /// Each active level closes exactly once. Whether a sub-level's partial
    /// return reaches its parent follows [`Config::interruption`].
    ///
    /// # Errors
    /// - `DimensionMismatch` if the observation has the wrong width
    /// - `Divergence` if a learning update leaves the sanity bound
    pub fn end_episode(
        &mut self,
        clock: &mut Clock,
        observation: &Array1<f64>,
        reward: f64,
        end: EpisodeEnd,
    ) -> HrlResult<EpisodeSummary> {
        self.check_observation(observation)?;
        let now = clock.now();
        self.decay_traces(now);
        self.credit_reward(now, reward);

        let mut closed = Vec::with_capacity(self.path.len());
        for position in (0..self.path.len()).rev() {
            let level = self.path[position];
            let bootstrap = match end {
                EpisodeEnd::Terminal => 0.0,
                EpisodeEnd::Truncated => {
                    let runtime = &self.levels[level];
                    let context = runtime.invocation.and_then(|inv| inv.context);
                    runtime.greedy_value(&runtime.state_for(observation, context))
                }
            };
            let pass_up = self.config.interruption == InterruptionPolicy::PassAccrued;
            match self.close_level(level, now, bootstrap, 0.0, CloseReason::EpisodeEnd, pass_up) {
                Ok(interval) => closed.extend(interval),
                Err(err) => {
                    self.abandon_episode(now);
                    return Err(err);
                }
            }
            self.levels[level].invocation = None;
        }
        self.path.clear();

        let summary = EpisodeSummary {
            episode: self.episode,
            ticks: now.saturating_sub(self.episode_start),
            closed,
        };
        debug!(
            "episode {} ended ({:?}) after {} ticks, {} levels force-closed",
            summary.episode,
            end,
            summary.ticks,
            summary.closed.len()
        );
        self.episode += 1;
        self.last_tick = None;
        clock.advance();
        Ok(summary)
    }

    // ========================================================================
    // Per-tick steps
    // ========================================================================

    /// Drop every open interval and invocation after a failed step.
    fn abandon_episode(&mut self, now: u64) {
        for level in &mut self.levels {
            level.active = None;
            level.invocation = None;
            level.phase = LevelPhase::Idle;
        }
        self.path.clear();
        self.last_tick = None;
        warn!("episode {} abandoned at tick {}", self.episode, now);
    }

    fn check_observation(&self, observation: &Array1<f64>) -> HrlResult<()> {
        if observation.len() != self.observation_dim {
            return Err(HrlError::DimensionMismatch {
                expected: self.observation_dim,
                got: observation.len(),
            });
        }
        Ok(())
    }

    fn decay_traces(&mut self, now: u64) {
        let dt = self.last_tick.map_or(0, |last| now.saturating_sub(last));
        for level in &mut self.levels {
            level.traces.decay(dt);
        }
        self.last_tick = Some(now);
    }

    /// Credit `reward` (earned at `now − 1`) to the deepest active level.
    fn credit_reward(&mut self, now: u64, reward: f64) {
        let Some(&deepest) = self.path.last() else {
            if reward != 0.0 {
                trace!("reward {} at tick {} with no active level, ignored", reward, now);
            }
            return;
        };
        let earned_at = now.saturating_sub(1);
        let gamma = self.spec.levels[deepest].discount;
        let runtime = &mut self.levels[deepest];
        if let Some(active) = runtime.active.as_mut() {
            active.reward += discount_factor(gamma, earned_at, active.opened_at) * reward;
        }
        if let Some(invocation) = runtime.invocation.as_mut() {
            invocation.accrued += discount_factor(gamma, earned_at, invocation.started_at) * reward;
        }
    }

    /// Position on the active path of the top-most level whose option
    /// terminates at `now`.
    fn topmost_terminated(&self, now: u64, observation: &Array1<f64>) -> Option<usize> {
        let obs = State::new(observation.clone());
        self.path.iter().position(|&level| {
            let Some(active) = self.levels[level].active.as_ref() else {
                return false;
            };
            if active.opened_at >= now {
                return false;
            }
            self.spec.levels[level].options[active.option]
                .termination
                .is_met(&obs, now - active.opened_at, active.deadline)
        })
    }

    /// Close the level at path position `topmost` and everything below it.
    fn close_from(
        &mut self,
        topmost: usize,
        now: u64,
        observation: &Array1<f64>,
        closed: &mut Vec<ClosedInterval>,
    ) -> HrlResult<()> {
        for position in (topmost..self.path.len()).rev() {
            let level = self.path[position];
            let interval = if position == topmost {
                let runtime = &self.levels[level];
                let context = runtime.invocation.and_then(|inv| inv.context);
                let bootstrap = runtime.greedy_value(&runtime.state_for(observation, context));
                self.close_level(level, now, bootstrap, 0.0, CloseReason::Terminated, false)?
            } else {
                // The direct child of the terminated option earns its pseudo-reward
                let subgoal = if position == topmost + 1 {
                    self.active_option_spec(self.path[topmost])
                        .map_or(0.0, |o| o.subgoal_reward)
                } else {
                    0.0
                };
                let interval = self.close_level(
                    level,
                    now,
                    0.0,
                    subgoal,
                    CloseReason::InvocationEnded,
                    true,
                )?;
                self.levels[level].invocation = None;
                interval
            };
            closed.extend(interval);
        }
        self.path.truncate(topmost + 1);
        Ok(())
    }

    /// Close `level`'s open interval: record traces, compute the TD error,
    /// learn, and optionally hand the invocation return to the parent.
    fn close_level(
        &mut self,
        level: usize,
        now: u64,
        bootstrap: f64,
        extra_reward: f64,
        reason: CloseReason,
        pass_up: bool,
    ) -> HrlResult<Option<ClosedInterval>> {
        let discount = self.spec.levels[level].discount;
        let runtime = &mut self.levels[level];
        let Some(active) = runtime.active.take() else {
            return Ok(None);
        };
        runtime.phase = LevelPhase::Closing;

        let elapsed_ticks = now.saturating_sub(active.opened_at);
        let reward = active.reward + extra_reward;
        let value_before = runtime.estimator.value_of(&active.state, active.option);
        runtime.traces.record(&active.state, active.option);
        let td_error = self
            .td
            .compute(value_before, bootstrap, reward, discount, elapsed_ticks);
        let update =
            runtime
                .learning
                .apply(level, runtime.estimator.as_mut(), &runtime.traces, td_error.error)?;
        runtime.phase = LevelPhase::Idle;

        let passed_up = match (pass_up, runtime.parent, runtime.invocation) {
            (true, Some(parent), Some(invocation)) => {
                let parent_gamma = self.spec.levels[parent].discount;
                let parent_runtime = &mut self.levels[parent];
                // The return is referenced to the parent interval's start; it
                // also joins the parent's own invocation return from there
                if let Some(parent_active) = parent_runtime.active.as_mut() {
                    parent_active.reward += invocation.accrued;
                    if let Some(parent_invocation) = parent_runtime.invocation.as_mut() {
                        parent_invocation.accrued += discount_factor(
                            parent_gamma,
                            parent_active.opened_at,
                            parent_invocation.started_at,
                        ) * invocation.accrued;
                    }
                }
                Some(invocation.accrued)
            }
            _ => None,
        };

        trace!(
            "tick {}: level {} closed option {} ({:?}) after {} ticks, R={:.4}, δ={:.4}",
            now,
            level,
            active.option,
            reason,
            elapsed_ticks,
            reward,
            td_error.error
        );

        Ok(Some(ClosedInterval {
            level,
            option: active.option,
            reward,
            elapsed_ticks,
            reason,
            td_error,
            passed_up,
            update,
        }))
    }

    /// Decide top-down until a primitive option is active; return its action.
    fn open_decisions(
        &mut self,
        now: u64,
        observation: &Array1<f64>,
    ) -> HrlResult<(usize, Vec<Decision>)> {
        let mut decisions = Vec::new();
        if self.path.is_empty() {
            self.path.push(0);
            self.levels[0].invocation = Some(Invocation {
                started_at: now,
                context: None,
                accrued: 0.0,
            });
        }

        let exploration = self.exploration_parameter(now);
        for _ in 0..=self.levels.len() {
            let Some(&level) = self.path.last() else {
                break;
            };
            if self.levels[level].active.is_none() {
                let option = self.open_option(level, now, observation, exploration)?;
                decisions.push(Decision {
                    level,
                    option,
                    exploration,
                });
            }
            let option = self.levels[level].active.as_ref().map_or(0, |a| a.option);
            match self.spec.levels[level].options[option].kind {
                OptionKind::Primitive { action } => return Ok((action, decisions)),
                OptionKind::Composite { sub_level } => {
                    self.path.push(sub_level);
                    self.levels[sub_level].invocation = Some(Invocation {
                        started_at: now,
                        context: Some(option),
                        accrued: 0.0,
                    });
                }
            }
        }

        // Unreachable on a validated tree: every chain ends in a primitive option
        Err(HrlError::DepthExceeded {
            depth: self.path.len(),
            max: super::MAX_DEPTH,
        })
    }

    fn open_option(
        &mut self,
        level: usize,
        now: u64,
        observation: &Array1<f64>,
        exploration: f64,
    ) -> HrlResult<usize> {
        let runtime = &self.levels[level];
        let context = runtime.invocation.and_then(|inv| inv.context);
        let state = runtime.state_for(observation, context);
        let available: Vec<usize> = (0..runtime.estimator.num_options()).collect();
        let option = self.selector.select(
            level,
            runtime.estimator.as_ref(),
            &state,
            &available,
            exploration,
            &mut self.rng,
        )?;
        let deadline = self.spec.levels[level].options[option]
            .termination
            .draw_deadline(&mut self.rng);

        let runtime = &mut self.levels[level];
        runtime.active = Some(ActiveOption {
            option,
            state,
            opened_at: now,
            reward: 0.0,
            deadline,
        });
        runtime.phase = LevelPhase::OptionActive;
        Ok(option)
    }

    fn active_option_spec(&self, level: usize) -> Option<&super::OptionSpec> {
        let active = self.levels.get(level)?.active.as_ref()?;
        self.spec.levels[level].options.get(active.option)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Whether `level`'s current interval closes if [`tick`](Self::tick) is
    /// called at the clock's current tick with `observation`.
    ///
    /// The top level also has a decision due when nothing is active yet.
    pub fn decision_due(&self, level: usize, clock: &Clock, observation: &Array1<f64>) -> bool {
        if self.path.is_empty() {
            return level == 0;
        }
        let Some(position) = self.path.iter().position(|&l| l == level) else {
            return false;
        };
        self.topmost_terminated(clock.now(), observation)
            .map_or(false, |topmost| position >= topmost)
    }

    pub fn phase(&self, level: usize) -> Option<LevelPhase> {
        self.levels.get(level).map(|l| l.phase)
    }

    /// `(level, active option)` pairs from the top down.
    pub fn active_path(&self) -> Vec<(usize, usize)> {
        self.path
            .iter()
            .filter_map(|&level| {
                self.levels[level]
                    .active
                    .as_ref()
                    .map(|active| (level, active.option))
            })
            .collect()
    }

    /// Level state for an observation and parent option.
    ///
    /// `context` is ignored at the top level; `None` at a sub-level leaves
    /// the context block empty.
    pub fn level_state(
        &self,
        level: usize,
        observation: &Array1<f64>,
        context: Option<usize>,
    ) -> HrlResult<State> {
        self.check_observation(observation)?;
        let runtime = self.runtime(level)?;
        if let (Some(parent), Some(option)) = (runtime.parent, context) {
            if option >= runtime.context_dim {
                return Err(HrlError::UnknownOption {
                    level: parent,
                    option,
                });
            }
        }
        Ok(runtime.state_for(observation, context))
    }

    /// Current value estimates of every option at `level`.
    pub fn values(
        &self,
        level: usize,
        observation: &Array1<f64>,
        context: Option<usize>,
    ) -> HrlResult<Vec<f64>> {
        let state = self.level_state(level, observation, context)?;
        Ok(self.levels[level].estimator.values(&state))
    }

    /// Choose an option at `level` without opening an interval.
    pub fn select(
        &mut self,
        level: usize,
        observation: &Array1<f64>,
        context: Option<usize>,
        mode: SelectionMode,
    ) -> HrlResult<usize> {
        let state = self.level_state(level, observation, context)?;
        let selector = ActionSelector::new(self.selector.rule, mode);
        let exploration = self.config.exploration.schedule.parameter(self.episode, 0);
        let runtime = &self.levels[level];
        let available: Vec<usize> = (0..runtime.estimator.num_options()).collect();
        selector.select(
            level,
            runtime.estimator.as_ref(),
            &state,
            &available,
            exploration,
            &mut self.rng,
        )
    }

    /// Probability of each option being chosen under the current mode and
    /// exploration parameter.
    ///
    /// Noisy-max probabilities are Monte Carlo estimates from a fixed seed,
    /// so repeated calls agree and the coordinator's own stream is untouched.
    pub fn action_probabilities(
        &self,
        level: usize,
        observation: &Array1<f64>,
        context: Option<usize>,
    ) -> HrlResult<Vec<f64>> {
        let values = self.values(level, observation, context)?;
        let exploration = self.config.exploration.schedule.parameter(self.episode, 0);
        if self.selector.mode == SelectionMode::Exploit || exploration <= 0.0 {
            return Ok(softmax_probabilities(&values, 0.0));
        }
        match self.selector.rule {
            CompetitionRule::Softmax => Ok(softmax_probabilities(&values, exploration)),
            CompetitionRule::NoisyMax => {
                let mut rng = StdRng::seed_from_u64(level as u64);
                let mut counts = vec![0usize; values.len()];
                for _ in 0..NOISY_MAX_SAMPLES {
                    let pick = self
                        .selector
                        .select_from_values(&values, exploration, &mut rng)?;
                    counts[pick] += 1;
                }
                Ok(counts
                    .into_iter()
                    .map(|c| c as f64 / NOISY_MAX_SAMPLES as f64)
                    .collect())
            }
        }
    }

    /// Greedy option at `level` (first wins ties).
    pub fn greedy_option(
        &self,
        level: usize,
        observation: &Array1<f64>,
        context: Option<usize>,
    ) -> HrlResult<usize> {
        let values = self.values(level, observation, context)?;
        argmax_first(&values).ok_or_else(|| HrlError::EmptyLevel {
            level,
            name: self.spec.levels[level].name.clone(),
        })
    }

    /// Exploration parameter the selector would use at tick `now`.
    pub fn exploration_parameter(&self, now: u64) -> f64 {
        self.config
            .exploration
            .schedule
            .parameter(self.episode, now.saturating_sub(self.episode_start))
    }

    pub fn estimator(&self, level: usize) -> Option<&dyn ValueEstimator> {
        self.levels.get(level).map(|l| l.estimator.as_ref())
    }

    pub fn traces(&self, level: usize) -> Option<&TraceBuffer> {
        self.levels.get(level).map(|l| &l.traces)
    }

    pub fn set_mode(&mut self, mode: SelectionMode) {
        self.selector.mode = mode;
    }

    pub fn mode(&self) -> SelectionMode {
        self.selector.mode
    }

    pub fn spec(&self) -> &HierarchySpec {
        &self.spec
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn observation_dim(&self) -> usize {
        self.observation_dim
    }

    /// Episodes completed so far.
    pub fn episode(&self) -> usize {
        self.episode
    }

    /// Load learned parameters from a checkpoint.
    ///
    /// # Errors
    /// - `SnapshotMismatch` if level count or names differ
    /// - any backend error from [`ValueEstimator::restore`]
    pub fn restore(&mut self, data: &CheckpointData) -> HrlResult<()> {
        if data.levels.len() != self.levels.len() {
            return Err(HrlError::SnapshotMismatch {
                expected: format!("{} levels", self.levels.len()),
                got: format!("{} levels", data.levels.len()),
            });
        }
        for (index, (saved, spec)) in data.levels.iter().zip(&self.spec.levels).enumerate() {
            if saved.name != spec.name {
                return Err(HrlError::SnapshotMismatch {
                    expected: format!("level {} `{}`", index, spec.name),
                    got: format!("level {} `{}`", index, saved.name),
                });
            }
        }
        for (runtime, saved) in self.levels.iter_mut().zip(&data.levels) {
            runtime.estimator.restore(&saved.estimator)?;
        }
        self.episode = data.episode;
        info!("restored {} levels at episode {}", data.levels.len(), data.episode);
        Ok(())
    }

    fn runtime(&self, level: usize) -> HrlResult<&LevelRuntime> {
        self.levels.get(level).ok_or(HrlError::UnknownLevel { level })
    }
}

/// γ^(earned_at − since), with rewards earned before `since` counted at γ^0.
fn discount_factor(gamma: f64, earned_at: u64, since: u64) -> f64 {
    let exponent = earned_at.saturating_sub(since).min(i32::MAX as u64) as i32;
    gamma.powi(exponent)
}
