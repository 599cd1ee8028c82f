//! Episode loops, the environment boundary, and metrics.
//!
//! The environment is an external collaborator: each tick it receives the
//! primitive action chosen by the hierarchy and answers with the next
//! observation, the reward for that action, and whether the episode is over.
//!
//! Three entry points, in increasing scope:
//!
//! 1. **Single episode** (`run_episode`)
//! 2. **Sequential training** (`train`): repeated episodes on one agent,
//!    optionally saving a checkpoint every few episodes
//!    (`train_with_checkpoints`)
//! 3. **Parallel replicates** (`train_replicates_parallel`): independent,
//!    seeded agents trained on Rayon's pool
//!
//! ## Rayon Parallelization
//!
//! Within one agent the algorithm is strictly sequential (levels update
//! bottom-up inside a tick), so parallelism is across replicates only. Each
//! replicate owns its coordinator, environment and clock, and is seeded
//! explicitly, so results do not depend on scheduling.

use crate::checkpoint::save_checkpoint;
use crate::core::{Clock, HrlError, HrlResult};
use crate::hierarchy::{ClosedInterval, Decision, EpisodeEnd, HierarchyCoordinator, HierarchySpec};
use crate::Config;
use log::{debug, info};
use std::path::Path;
use ndarray::Array1;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Episodes between progress log lines in [`train`].
const LOG_EVERY: usize = 100;

/// Response of the environment to one action.
#[derive(Debug, Clone)]
pub struct Step {
    pub observation: Array1<f64>,
    /// Reward earned by the action just executed
    pub reward: f64,
    /// The episode reached a terminal state
    pub done: bool,
}

/// A task the hierarchy acts in.
pub trait Environment {
    fn observation_dim(&self) -> usize;

    /// Start a new episode and return the first observation.
    fn reset(&mut self) -> Array1<f64>;

    /// Execute a primitive action.
    fn step(&mut self, action: usize) -> Step;
}

/// Metrics for a single episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeMetrics {
    pub episode: usize,
    pub ticks: u64,
    /// Undiscounted sum of environment rewards
    pub total_reward: f64,
    /// Ended in a terminal state rather than by the tick limit
    pub terminal: bool,
    /// Decisions opened per level
    pub decisions: Vec<usize>,
    /// Intervals closed per level (including force-closes)
    pub intervals: Vec<usize>,
    /// Mean |δ| per level over the closed intervals
    pub mean_abs_td_error: Vec<f64>,
    /// Exploration parameter at the start of the episode
    pub temperature: f64,
}

/// Per-episode metrics for a training run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub episodes: Vec<EpisodeMetrics>,
}

impl TrainingMetrics {
    /// Mean total reward over every episode.
    pub fn mean_reward(&self) -> f64 {
        self.recent_mean_reward(self.episodes.len())
    }

    /// Mean total reward over the last `window` episodes.
    #[allow(clippy::cast_precision_loss)]
    pub fn recent_mean_reward(&self, window: usize) -> f64 {
        let n = window.min(self.episodes.len());
        if n == 0 {
            return 0.0;
        }
        let tail = &self.episodes[self.episodes.len() - n..];
        tail.iter().map(|e| e.total_reward).sum::<f64>() / n as f64
    }

    /// Mean episode length over the last `window` episodes.
    #[allow(clippy::cast_precision_loss)]
    pub fn recent_mean_ticks(&self, window: usize) -> f64 {
        let n = window.min(self.episodes.len());
        if n == 0 {
            return 0.0;
        }
        let tail = &self.episodes[self.episodes.len() - n..];
        tail.iter().map(|e| e.ticks as f64).sum::<f64>() / n as f64
    }

    pub fn total_ticks(&self) -> u64 {
        self.episodes.iter().map(|e| e.ticks).sum()
    }
}

/// Running per-level tallies while an episode is in progress.
struct LevelTally {
    decisions: Vec<usize>,
    intervals: Vec<usize>,
    abs_td_sum: Vec<f64>,
}

impl LevelTally {
    fn new(levels: usize) -> Self {
        Self {
            decisions: vec![0; levels],
            intervals: vec![0; levels],
            abs_td_sum: vec![0.0; levels],
        }
    }

    fn record(&mut self, decisions: &[Decision], closed: &[ClosedInterval]) {
        for d in decisions {
            self.decisions[d.level] += 1;
        }
        for c in closed {
            self.intervals[c.level] += 1;
            self.abs_td_sum[c.level] += c.td_error.error.abs();
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn mean_abs_td_error(&self) -> Vec<f64> {
        self.abs_td_sum
            .iter()
            .zip(&self.intervals)
            .map(|(&sum, &n)| if n == 0 { 0.0 } else { sum / n as f64 })
            .collect()
    }
}

// ============================================================================
// Sequential Training
// ============================================================================

/// Run one episode of at most `max_ticks` actions.
///
/// # Algorithm
/// 1. Reset the environment and the coordinator's episode state
/// 2. Each tick: hand the observation and the previous action's reward to the
///    coordinator, execute the action it returns
/// 3. Stop on a terminal step or after `max_ticks` actions
/// 4. Force-close every active level (`Terminal` or `Truncated`)
///
/// # Errors
/// Returns `Err` on an observation of the wrong width or numerical divergence.
pub fn run_episode<E: Environment + ?Sized>(
    coordinator: &mut HierarchyCoordinator,
    env: &mut E,
    clock: &mut Clock,
    max_ticks: u64,
) -> HrlResult<EpisodeMetrics> {
    let episode = coordinator.episode();
    let mut tally = LevelTally::new(coordinator.num_levels());

    coordinator.begin_episode(clock);
    let temperature = coordinator.exploration_parameter(clock.now());
    let mut observation = env.reset();
    let mut reward = 0.0;
    let mut total_reward = 0.0;
    let mut ticks = 0;
    let mut terminal = false;

    while ticks < max_ticks {
        let outcome = coordinator.tick(clock, &observation, reward)?;
        tally.record(&outcome.decisions, &outcome.closed);

        let step = env.step(outcome.action);
        ticks += 1;
        total_reward += step.reward;
        observation = step.observation;
        reward = step.reward;
        if step.done {
            terminal = true;
            break;
        }
    }

    let end = if terminal {
        EpisodeEnd::Terminal
    } else {
        EpisodeEnd::Truncated
    };
    let summary = coordinator.end_episode(clock, &observation, reward, end)?;
    tally.record(&[], &summary.closed);

    Ok(EpisodeMetrics {
        episode,
        ticks,
        total_reward,
        terminal,
        mean_abs_td_error: tally.mean_abs_td_error(),
        decisions: tally.decisions,
        intervals: tally.intervals,
        temperature,
    })
}

/// Train one agent for `episodes` episodes.
///
/// # Errors
/// Stops at the first episode that fails and returns its error.
pub fn train<E: Environment + ?Sized>(
    coordinator: &mut HierarchyCoordinator,
    env: &mut E,
    clock: &mut Clock,
    episodes: usize,
    max_ticks: u64,
) -> HrlResult<TrainingMetrics> {
    let mut metrics = TrainingMetrics {
        episodes: Vec::with_capacity(episodes),
    };

    for _ in 0..episodes {
        let m = run_episode(coordinator, env, clock, max_ticks)?;
        debug!(
            "episode {}: {} ticks, reward {:.3}, |δ| {:?}",
            m.episode, m.ticks, m.total_reward, m.mean_abs_td_error
        );
        metrics.episodes.push(m);

        if metrics.episodes.len() % LOG_EVERY == 0 {
            info!(
                "episode {}: mean reward (last {}) {:.3}, mean length {:.1}",
                coordinator.episode(),
                LOG_EVERY,
                metrics.recent_mean_reward(LOG_EVERY),
                metrics.recent_mean_ticks(LOG_EVERY)
            );
        }
    }

    Ok(metrics)
}

/// [`train`], saving a checkpoint to `path` after every `every` episodes and
/// once more at the end.
///
/// A run that fails part-way leaves the last periodic checkpoint on disk.
///
/// # Errors
/// - `InvalidParameter` if `every` is zero
/// - any training or checkpoint write error
pub fn train_with_checkpoints<E: Environment + ?Sized>(
    coordinator: &mut HierarchyCoordinator,
    env: &mut E,
    clock: &mut Clock,
    episodes: usize,
    max_ticks: u64,
    every: usize,
    path: &Path,
) -> HrlResult<TrainingMetrics> {
    if every == 0 {
        return Err(HrlError::InvalidParameter {
            name: "checkpoint_every".to_string(),
            value: 0.0,
            expected: "at least one episode",
        });
    }

    let mut metrics = TrainingMetrics {
        episodes: Vec::with_capacity(episodes),
    };
    let mut remaining = episodes;
    while remaining > 0 {
        let chunk = remaining.min(every);
        let part = train(coordinator, env, clock, chunk, max_ticks)?;
        metrics.episodes.extend(part.episodes);
        remaining -= chunk;
        save_checkpoint(path, coordinator)?;
    }
    if episodes == 0 {
        save_checkpoint(path, coordinator)?;
    }

    Ok(metrics)
}

// ============================================================================
// Parallel Replicates (Rayon)
// ============================================================================

/// One independently trained agent.
#[derive(Debug)]
pub struct Replicate {
    pub seed: u64,
    pub coordinator: HierarchyCoordinator,
    pub metrics: TrainingMetrics,
}

/// Train one agent per seed in parallel.
///
/// `make_env` builds each replicate's environment from its seed. Results are
/// returned in seed order.
///
/// # Errors
/// Returns the first configuration or training error encountered.
pub fn train_replicates_parallel<E, F>(
    spec: &HierarchySpec,
    config: &Config,
    make_env: F,
    seeds: &[u64],
    episodes: usize,
    max_ticks: u64,
) -> HrlResult<Vec<Replicate>>
where
    E: Environment,
    F: Fn(u64) -> E + Sync,
{
    info!(
        "training {} replicates x {} episodes on {} threads",
        seeds.len(),
        episodes,
        rayon::current_num_threads()
    );

    seeds
        .par_iter()
        .map(|&seed| {
            let mut env = make_env(seed);
            let mut coordinator = HierarchyCoordinator::new(
                spec.clone(),
                config.clone(),
                env.observation_dim(),
                seed,
            )?;
            let mut clock = Clock::new();
            let metrics = train(&mut coordinator, &mut env, &mut clock, episodes, max_ticks)?;
            Ok(Replicate {
                seed,
                coordinator,
                metrics,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::{LevelSpec, OptionSpec};
    use crate::selection::SelectionMode;

    /// Two arms; arm 1 pays 1, arm 0 pays 0. One step per episode.
    struct Bandit;

    impl Environment for Bandit {
        fn observation_dim(&self) -> usize {
            1
        }

        fn reset(&mut self) -> Array1<f64> {
            Array1::from(vec![1.0])
        }

        fn step(&mut self, action: usize) -> Step {
            Step {
                observation: Array1::from(vec![1.0]),
                reward: if action == 1 { 1.0 } else { 0.0 },
                done: true,
            }
        }
    }

    /// Never terminates.
    struct Endless;

    impl Environment for Endless {
        fn observation_dim(&self) -> usize {
            1
        }

        fn reset(&mut self) -> Array1<f64> {
            Array1::from(vec![0.0])
        }

        fn step(&mut self, _action: usize) -> Step {
            Step {
                observation: Array1::from(vec![0.0]),
                reward: 0.1,
                done: false,
            }
        }
    }

    fn bandit_spec() -> HierarchySpec {
        HierarchySpec::new(vec![LevelSpec::new(
            "arms",
            0.9,
            vec![OptionSpec::primitive("zero", 0), OptionSpec::primitive("one", 1)],
        )])
    }

    #[test]
    fn test_run_episode_terminal() {
        let mut coord = HierarchyCoordinator::new(bandit_spec(), Config::default(), 1, 0).unwrap();
        let mut clock = Clock::new();
        let m = run_episode(&mut coord, &mut Bandit, &mut clock, 10).unwrap();
        assert!(m.terminal);
        assert_eq!(m.ticks, 1);
        assert_eq!(m.decisions, vec![1]);
        assert_eq!(m.intervals, vec![1]);
        assert_eq!(coord.episode(), 1);
    }

    #[test]
    fn test_run_episode_truncated() {
        let mut coord = HierarchyCoordinator::new(bandit_spec(), Config::default(), 1, 0).unwrap();
        let mut clock = Clock::new();
        let m = run_episode(&mut coord, &mut Endless, &mut clock, 5).unwrap();
        assert!(!m.terminal);
        assert_eq!(m.ticks, 5);
        assert!((m.total_reward - 0.5).abs() < 1e-12);
        // One close per primitive tick plus the forced close at the end
        assert_eq!(m.intervals, vec![5]);
    }

    #[test]
    fn test_train_learns_bandit() {
        let config = Config {
            learning_rate: 0.3,
            ..Config::default()
        };
        let mut coord = HierarchyCoordinator::new(bandit_spec(), config, 1, 9).unwrap();
        let mut clock = Clock::new();
        let metrics = train(&mut coord, &mut Bandit, &mut clock, 200, 1).unwrap();
        assert_eq!(metrics.episodes.len(), 200);
        assert!(metrics.recent_mean_reward(50) > 0.5);

        coord.set_mode(SelectionMode::Exploit);
        let obs = Array1::from(vec![1.0]);
        assert_eq!(coord.select(0, &obs, None, SelectionMode::Exploit).unwrap(), 1);
    }

    #[test]
    fn test_parallel_replicates_are_reproducible() {
        let seeds = [3, 4, 3];
        let runs = train_replicates_parallel(
            &bandit_spec(),
            &Config::default(),
            |_| Bandit,
            &seeds,
            20,
            1,
        )
        .unwrap();
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].seed, 3);
        assert_eq!(runs[0].metrics, runs[2].metrics);
    }

    /// Pays nothing for the first `quiet` steps, then a huge reward.
    struct LateJackpot {
        steps: usize,
        quiet: usize,
    }

    impl Environment for LateJackpot {
        fn observation_dim(&self) -> usize {
            1
        }

        fn reset(&mut self) -> Array1<f64> {
            Array1::from(vec![0.0])
        }

        fn step(&mut self, _action: usize) -> Step {
            self.steps += 1;
            Step {
                observation: Array1::from(vec![0.0]),
                reward: if self.steps > self.quiet { 100.0 } else { 0.0 },
                done: false,
            }
        }
    }

    #[test]
    fn test_train_with_checkpoints_saves_at_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("periodic.json");
        let mut coord = HierarchyCoordinator::new(bandit_spec(), Config::default(), 1, 3).unwrap();
        let mut clock = Clock::new();
        let metrics =
            train_with_checkpoints(&mut coord, &mut Bandit, &mut clock, 7, 5, 3, &path).unwrap();
        assert_eq!(metrics.episodes.len(), 7);
        assert_eq!(metrics.episodes[6].episode, 6);
        let saved = crate::checkpoint::load_checkpoint(&path).unwrap();
        assert_eq!(saved.episode, 7);
    }

    #[test]
    fn test_failed_run_keeps_last_periodic_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("periodic.json");
        let spec = HierarchySpec::new(vec![LevelSpec::new(
            "flat",
            0.9,
            vec![OptionSpec::primitive("a", 0)],
        )
        .with_learning_rate(1.0)]);
        let config = Config {
            divergence_bound: 5.0,
            ..Config::default()
        };
        let mut coord = HierarchyCoordinator::new(spec, config, 1, 0).unwrap();
        let mut clock = Clock::new();
        // Two steps per episode; the ninth step (episode 4) diverges
        let mut env = LateJackpot { steps: 0, quiet: 8 };
        let result = train_with_checkpoints(&mut coord, &mut env, &mut clock, 10, 2, 2, &path);
        assert!(matches!(result, Err(HrlError::Divergence { .. })));
        let saved = crate::checkpoint::load_checkpoint(&path).unwrap();
        assert_eq!(saved.episode, 4);
    }

    #[test]
    fn test_checkpoint_interval_must_be_positive() {
        let dir = tempfile::tempdir().unwrap();
        let mut coord = HierarchyCoordinator::new(bandit_spec(), Config::default(), 1, 3).unwrap();
        let mut clock = Clock::new();
        let result = train_with_checkpoints(
            &mut coord,
            &mut Bandit,
            &mut clock,
            4,
            5,
            0,
            &dir.path().join("never.json"),
        );
        assert!(matches!(result, Err(HrlError::InvalidParameter { .. })));
    }

    #[test]
    fn test_training_metrics_summaries() {
        let mut metrics = TrainingMetrics::default();
        assert_eq!(metrics.mean_reward(), 0.0);
        for (i, r) in [0.0, 1.0, 1.0].iter().enumerate() {
            metrics.episodes.push(EpisodeMetrics {
                episode: i,
                ticks: 2,
                total_reward: *r,
                terminal: true,
                decisions: vec![1],
                intervals: vec![1],
                mean_abs_td_error: vec![0.0],
                temperature: 0.1,
            });
        }
        assert!((metrics.mean_reward() - 2.0 / 3.0).abs() < 1e-12);
        assert!((metrics.recent_mean_reward(2) - 1.0).abs() < 1e-12);
        assert_eq!(metrics.total_ticks(), 6);
    }
}
