//! Hierarchical delivery task training binary.
//!
//! An agent in a corridor must walk to the pickup cell at one end, then carry
//! the package to the drop-off cell at the other. The top level chooses
//! between "go to pickup" and "go to drop-off"; both invoke a navigation level
//! that chooses left or right. Writes JSONL metrics, one event per line.

use clap::{Parser, ValueEnum};
use hrl::training::Replicate;
use hrl::{
    load_checkpoint, save_checkpoint, train, train_replicates_parallel, train_with_checkpoints,
    AnnealScope, Clock, CompetitionRule, Config, DiscountMode, Environment, EstimatorSpec,
    ExplorationSchedule, HierarchyCoordinator, HierarchySpec, HrlResult, LevelSpec, OptionSpec,
    SelectionMode, Step, Termination, TrainingMetrics,
};
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Backend {
    Tabular,
    Linear,
    Population,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Rule {
    Softmax,
    NoisyMax,
}

#[derive(Parser, Debug)]
#[command(
    name = "hrl-train",
    about = "Train a two-level option hierarchy on the corridor delivery task"
)]
struct Args {
    /// Number of training episodes
    #[arg(long, default_value_t = 500)]
    episodes: usize,

    /// Tick limit per episode
    #[arg(long, default_value_t = 200)]
    max_ticks: u64,

    /// Base random seed (replicate i uses seed + i)
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Number of corridor cells
    #[arg(long, default_value_t = 8)]
    corridor_length: usize,

    /// Learning rate (eta)
    #[arg(long, default_value_t = 0.2)]
    learning_rate: f64,

    /// Trace decay per tick (lambda)
    #[arg(long, default_value_t = 0.8)]
    trace_decay: f64,

    /// Exploration temperature (softmax) or noise std (noisy max)
    #[arg(long, default_value_t = 0.3)]
    temperature: f64,

    /// Anneal exploration toward this value across episodes
    #[arg(long)]
    anneal_to: Option<f64>,

    /// Annealing rate per episode
    #[arg(long, default_value_t = 0.01)]
    anneal_rate: f64,

    /// Use the integrated discount at this rate per tick instead of gamma^k
    #[arg(long)]
    integrated_discount: Option<f64>,

    /// Competition rule
    #[arg(long, value_enum, default_value_t = Rule::Softmax)]
    rule: Rule,

    /// Value estimator backend for both levels
    #[arg(long, value_enum, default_value_t = Backend::Tabular)]
    estimator: Backend,

    /// Independent replicates trained in parallel
    #[arg(long, default_value_t = 1)]
    replicates: usize,

    /// Hierarchy JSON file (overrides the built-in delivery hierarchy)
    #[arg(long)]
    hierarchy: Option<PathBuf>,

    /// Config JSON file (overrides the learning flags above)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output metrics file (JSONL)
    #[arg(long, default_value = "data/output/hrl_metrics.jsonl")]
    metrics_file: PathBuf,

    /// Write a checkpoint of the (first) trained agent here
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Also save the checkpoint every N episodes during training
    /// (single replicate only)
    #[arg(long)]
    checkpoint_every: Option<usize>,

    /// Resume from checkpoint file (single replicate only)
    #[arg(long)]
    resume: Option<PathBuf>,
}

// ============================================================================
// Corridor delivery task
// ============================================================================

/// Corridor of `length` cells; pickup at cell 0, drop-off at the last cell.
///
/// Observation: one-hot position followed by a carrying flag.
/// Actions: 0 = left, 1 = right. Reward 1 on delivery, which ends the episode.
struct Corridor {
    length: usize,
    position: usize,
    carrying: bool,
    rng: StdRng,
}

impl Corridor {
    const LEFT: usize = 0;
    const RIGHT: usize = 1;

    fn new(length: usize, seed: u64) -> Self {
        Self {
            length,
            position: 0,
            carrying: false,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn observe(&self) -> Array1<f64> {
        let mut obs = Array1::zeros(self.length + 1);
        obs[self.position] = 1.0;
        obs[self.length] = if self.carrying { 1.0 } else { 0.0 };
        obs
    }
}

impl Environment for Corridor {
    fn observation_dim(&self) -> usize {
        self.length + 1
    }

    fn reset(&mut self) -> Array1<f64> {
        self.position = self.rng.gen_range(1..self.length);
        self.carrying = false;
        self.observe()
    }

    fn step(&mut self, action: usize) -> Step {
        match action {
            Self::LEFT => self.position = self.position.saturating_sub(1),
            Self::RIGHT => self.position = (self.position + 1).min(self.length - 1),
            _ => {}
        }
        if self.position == 0 {
            self.carrying = true;
        }
        let delivered = self.carrying && self.position == self.length - 1;
        Step {
            observation: self.observe(),
            reward: if delivered { 1.0 } else { 0.0 },
            done: delivered,
        }
    }
}

/// Top level picks a sub-goal; the navigation level walks toward it.
fn delivery_hierarchy(length: usize, estimator: EstimatorSpec) -> HierarchySpec {
    let patience = Termination::Ticks(3 * length as u64);
    let reach = |cell: usize| {
        Termination::Any(vec![
            Termination::FeatureAbove {
                index: cell,
                threshold: 0.5,
            },
            patience.clone(),
        ])
    };
    HierarchySpec::new(vec![
        LevelSpec::new(
            "delivery",
            0.95,
            vec![
                OptionSpec::composite("go-to-pickup", 1, reach(0)).with_subgoal_reward(1.0),
                OptionSpec::composite("go-to-dropoff", 1, reach(length - 1))
                    .with_subgoal_reward(1.0),
            ],
        )
        .with_estimator(estimator.clone()),
        LevelSpec::new(
            "navigation",
            0.9,
            vec![
                OptionSpec::primitive("left", Corridor::LEFT),
                OptionSpec::primitive("right", Corridor::RIGHT),
            ],
        )
        .with_estimator(estimator),
    ])
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> HrlResult<T> {
    Ok(serde_json::from_reader(BufReader::new(File::open(path)?))?)
}

fn build_config(args: &Args) -> HrlResult<Config> {
    if let Some(ref path) = args.config {
        return read_json(path);
    }
    let mut config = Config {
        learning_rate: args.learning_rate,
        trace_decay: args.trace_decay,
        ..Config::default()
    };
    if let Some(rate) = args.integrated_discount {
        config.discount_mode = DiscountMode::Integrated { rate };
    }
    config.exploration.rule = match args.rule {
        Rule::Softmax => CompetitionRule::Softmax,
        Rule::NoisyMax => CompetitionRule::NoisyMax,
    };
    config.exploration.schedule = match args.anneal_to {
        Some(end) => ExplorationSchedule::Annealed {
            start: args.temperature,
            end,
            rate: args.anneal_rate,
            scope: AnnealScope::AcrossEpisodes,
        },
        None => ExplorationSchedule::Fixed(args.temperature),
    };
    Ok(config)
}

fn build_hierarchy(args: &Args) -> HrlResult<HierarchySpec> {
    if let Some(ref path) = args.hierarchy {
        return read_json(path);
    }
    let estimator = match args.estimator {
        Backend::Tabular => EstimatorSpec::Tabular { initial_value: 0.0 },
        Backend::Linear => EstimatorSpec::Linear { initial_value: 0.0 },
        Backend::Population => EstimatorSpec::population(),
    };
    Ok(delivery_hierarchy(args.corridor_length, estimator))
}

/// Greedy rollout from a fixed start; returns ticks to delivery (or the limit).
fn evaluate_greedy(coordinator: &mut HierarchyCoordinator, args: &Args) -> HrlResult<u64> {
    let previous = coordinator.mode();
    coordinator.set_mode(SelectionMode::Exploit);
    let mut env = Corridor::new(args.corridor_length, args.seed ^ 0xE7A1);
    let mut clock = Clock::new();
    let result = hrl::run_episode(coordinator, &mut env, &mut clock, args.max_ticks);
    coordinator.set_mode(previous);
    Ok(result?.ticks)
}

fn write_episode_events(
    out: &mut impl Write,
    seed: u64,
    metrics: &TrainingMetrics,
) -> HrlResult<()> {
    for m in &metrics.episodes {
        let event = serde_json::json!({
            "type": "episode",
            "seed": seed,
            "episode": m.episode,
            "ticks": m.ticks,
            "total_reward": m.total_reward,
            "terminal": m.terminal,
            "decisions": m.decisions,
            "intervals": m.intervals,
            "mean_abs_td_error": m.mean_abs_td_error,
            "temperature": m.temperature,
        });
        writeln!(out, "{}", event)?;
    }
    Ok(())
}

fn run(args: &Args) -> HrlResult<()> {
    let spec = build_hierarchy(args)?;
    let config = build_config(args)?;
    spec.validate()?;
    config.validate()?;

    if let Some(parent) = args.metrics_file.parent() {
        fs::create_dir_all(parent)?;
    }
    // Append mode so a dashboard can tail it
    let mut metrics_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&args.metrics_file)?;

    eprintln!("HRL Delivery Training");
    eprintln!(
        "  Levels: {:?}",
        spec.levels.iter().map(|l| l.name.as_str()).collect::<Vec<_>>()
    );
    eprintln!(
        "  Corridor: {} cells, Episodes: {}, Max ticks: {}",
        args.corridor_length, args.episodes, args.max_ticks
    );
    eprintln!(
        "  Eta: {}, Lambda: {}, Exploration: {:?}",
        config.learning_rate, config.trace_decay, config.exploration.schedule
    );
    eprintln!("  Metrics: {}", args.metrics_file.display());

    let start = Instant::now();
    let mut replicates: Vec<Replicate> = if args.replicates <= 1 {
        let mut env = Corridor::new(args.corridor_length, args.seed);
        let mut coordinator =
            HierarchyCoordinator::new(spec, config, env.observation_dim(), args.seed)?;
        if let Some(ref path) = args.resume {
            eprintln!("Resuming from checkpoint: {}", path.display());
            coordinator.restore(&load_checkpoint(path)?)?;
            eprintln!("  Resumed at episode {}", coordinator.episode());
        }
        let mut clock = Clock::new();
        let metrics = match (args.checkpoint.as_ref(), args.checkpoint_every) {
            (Some(path), Some(every)) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                eprintln!("  Checkpointing every {} episodes", every);
                train_with_checkpoints(
                    &mut coordinator,
                    &mut env,
                    &mut clock,
                    args.episodes,
                    args.max_ticks,
                    every,
                    path,
                )?
            }
            _ => train(
                &mut coordinator,
                &mut env,
                &mut clock,
                args.episodes,
                args.max_ticks,
            )?,
        };
        vec![Replicate {
            seed: args.seed,
            coordinator,
            metrics,
        }]
    } else {
        if args.resume.is_some() {
            eprintln!("  Warning: --resume is ignored with more than one replicate");
        }
        if args.checkpoint_every.is_some() {
            eprintln!("  Warning: --checkpoint-every is ignored with more than one replicate");
        }
        let seeds: Vec<u64> = (0..args.replicates as u64).map(|i| args.seed + i).collect();
        let length = args.corridor_length;
        train_replicates_parallel(
            &spec,
            &config,
            |seed| Corridor::new(length, seed),
            &seeds,
            args.episodes,
            args.max_ticks,
        )?
    };
    let elapsed = start.elapsed().as_secs_f64();

    // Saved before the greedy rollout, which keeps learning
    if let (Some(path), Some(first)) = (args.checkpoint.as_ref(), replicates.first()) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        save_checkpoint(path, &first.coordinator)?;
        eprintln!("  Checkpoint saved: {}", path.display());
        let event = serde_json::json!({
            "type": "checkpoint",
            "seed": first.seed,
            "path": path.to_string_lossy(),
        });
        writeln!(metrics_file, "{}", event)?;
    }

    for replicate in &mut replicates {
        write_episode_events(&mut metrics_file, replicate.seed, &replicate.metrics)?;
        let greedy_ticks = evaluate_greedy(&mut replicate.coordinator, args)?;
        let window = (args.episodes / 10).max(1);
        eprintln!(
            "  seed {}: mean reward (last {}) {:.3}, mean length {:.1}, greedy delivery in {} ticks",
            replicate.seed,
            window,
            replicate.metrics.recent_mean_reward(window),
            replicate.metrics.recent_mean_ticks(window),
            greedy_ticks
        );
        let summary = serde_json::json!({
            "type": "summary",
            "seed": replicate.seed,
            "episodes": replicate.metrics.episodes.len(),
            "mean_reward": replicate.metrics.mean_reward(),
            "recent_mean_reward": replicate.metrics.recent_mean_reward(window),
            "recent_mean_ticks": replicate.metrics.recent_mean_ticks(window),
            "total_ticks": replicate.metrics.total_ticks(),
            "greedy_ticks": greedy_ticks,
            "elapsed_secs": elapsed,
        });
        writeln!(metrics_file, "{}", summary)?;
    }
    metrics_file.flush()?;

    eprintln!("\nTraining complete in {:.1}s", elapsed);
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    if args.corridor_length < 3 {
        eprintln!("--corridor-length must be at least 3");
        return ExitCode::FAILURE;
    }
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Training failed: {e}");
            ExitCode::FAILURE
        }
    }
}
