//! Integration tests for hierarchical TD learning.
//!
//! These tests verify end-to-end behavior through the public API:
//! - A two-level hierarchy learns which composite option leads to reward
//! - Rewards passed up a level equal the sub-level's discounted return
//! - Episode end force-closes every active level exactly once
//! - Configuration errors and numerical divergence are surfaced
//! - Checkpoints and parallel replicates are reproducible

use approx::assert_abs_diff_eq;
use hrl::{
    load_checkpoint, run_episode, save_checkpoint, train, train_replicates_parallel, Clock,
    CloseReason, Config, Environment, EpisodeEnd, EstimatorSpec, ExplorationSchedule,
    HierarchyCoordinator, HierarchySpec, HrlError, LevelSpec, OptionSpec, SelectionMode, Step,
    Termination,
};
use ndarray::Array1;

/// One-step task with three primitive actions; only action 2 pays.
struct ActionTwoPays;

impl Environment for ActionTwoPays {
    fn observation_dim(&self) -> usize {
        1
    }

    fn reset(&mut self) -> Array1<f64> {
        Array1::from(vec![1.0])
    }

    fn step(&mut self, action: usize) -> Step {
        Step {
            observation: Array1::from(vec![1.0]),
            reward: if action == 2 { 1.0 } else { 0.0 },
            done: true,
        }
    }
}

/// Endless task paying a constant reward per action.
struct Endless {
    reward: f64,
}

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
            reward: self.reward,
            done: false,
        }
    }
}

/// Top level: A (composite, invokes level 1) and B (primitive action 0).
/// Level 1: primitive actions 1 and 2.
fn two_level_spec(a_termination: Termination, sub_discount: f64) -> HierarchySpec {
    HierarchySpec::new(vec![
        LevelSpec::new(
            "top",
            0.9,
            vec![
                OptionSpec::composite("A", 1, a_termination),
                OptionSpec::primitive("B", 0),
            ],
        ),
        LevelSpec::new(
            "sub",
            sub_discount,
            vec![OptionSpec::primitive("one", 1), OptionSpec::primitive("two", 2)],
        ),
    ])
}

fn obs(x: f64) -> Array1<f64> {
    Array1::from(vec![x])
}

/// After training in explore mode, exploitation picks A at the top and
/// action 2 inside A.
#[test]
fn test_two_level_learns_rewarded_path() {
    let mut config = Config {
        learning_rate: 0.3,
        ..Config::default()
    };
    config.exploration.schedule = ExplorationSchedule::Fixed(0.2);

    let spec = two_level_spec(Termination::Never, 0.9);
    let mut coord = HierarchyCoordinator::new(spec, config, 1, 17).expect("create coordinator");
    let mut clock = Clock::new();
    let metrics = train(&mut coord, &mut ActionTwoPays, &mut clock, 300, 5).expect("train");
    assert_eq!(metrics.episodes.len(), 300);
    assert!(metrics.episodes.iter().all(|e| e.terminal && e.ticks == 1));

    let s = obs(1.0);
    let top = coord.values(0, &s, None).unwrap();
    let sub = coord.values(1, &s, Some(0)).unwrap();
    assert!(top[0] > top[1], "top values {:?}", top);
    assert!(sub[1] > sub[0], "sub values {:?}", sub);

    coord.set_mode(SelectionMode::Exploit);
    for _ in 0..10 {
        assert_eq!(coord.select(0, &s, None, SelectionMode::Exploit).unwrap(), 0);
        assert_eq!(coord.select(1, &s, Some(0), SelectionMode::Exploit).unwrap(), 1);
    }

    // A full exploit episode executes primitive action 2
    coord.begin_episode(&clock);
    let outcome = coord.tick(&mut clock, &s, 0.0).unwrap();
    assert_eq!(outcome.action, 2);
    assert_eq!(coord.active_path(), vec![(0, 0), (1, 1)]);
}

/// The reward handed to the parent equals the sub-level's own discounted
/// return over the invocation.
#[test]
fn test_pass_up_equals_sub_level_discounted_return() {
    let gamma_sub = 0.7;
    let rewards = [0.5, -0.25, 2.0];
    let spec = two_level_spec(Termination::Ticks(3), gamma_sub);
    let mut coord = HierarchyCoordinator::new(spec, Config::default(), 1, 3).unwrap();
    let mut clock = Clock::new();
    coord.begin_episode(&clock);

    // Force the top level into A so the sub-level runs
    coord.set_mode(SelectionMode::Exploit);
    let first = coord.tick(&mut clock, &obs(0.0), 0.0).unwrap();
    assert_eq!(first.decisions[0].option, 0);

    let mut closed = Vec::new();
    for &r in &rewards {
        let out = coord.tick(&mut clock, &obs(0.0), r).unwrap();
        closed.extend(out.closed);
    }

    let invocation_end = closed
        .iter()
        .find(|c| c.level == 1 && c.reason == CloseReason::InvocationEnded)
        .expect("sub-level invocation closed");
    let expected = rewards[0] + gamma_sub * rewards[1] + gamma_sub * gamma_sub * rewards[2];
    assert_abs_diff_eq!(invocation_end.passed_up.unwrap(), expected, epsilon = 1e-12);

    let parent = closed
        .iter()
        .find(|c| c.level == 0)
        .expect("top interval closed");
    assert_eq!(parent.reason, CloseReason::Terminated);
    assert_eq!(parent.elapsed_ticks, 3);
    assert_abs_diff_eq!(parent.reward, expected, epsilon = 1e-12);

    // Intermediate sub-level intervals never pass anything up
    assert!(closed
        .iter()
        .filter(|c| c.level == 1 && c.reason == CloseReason::Terminated)
        .all(|c| c.passed_up.is_none()));
}

/// Episode ends while every option is still running: each level is closed
/// once, bottom-up, with exactly one TD error.
#[test]
fn test_episode_end_mid_option_closes_each_level_once() {
    let spec = HierarchySpec::new(vec![
        LevelSpec::new(
            "top",
            0.95,
            vec![OptionSpec::composite("down", 1, Termination::Never)],
        ),
        LevelSpec::new(
            "mid",
            0.9,
            vec![OptionSpec::composite("down", 2, Termination::Never)],
        ),
        LevelSpec::new(
            "bottom",
            0.8,
            vec![
                OptionSpec::primitive("a", 0).with_termination(Termination::Never),
                OptionSpec::primitive("b", 1).with_termination(Termination::Never),
            ],
        ),
    ]);
    let mut coord = HierarchyCoordinator::new(spec.clone(), Config::default(), 1, 5).unwrap();
    let mut clock = Clock::new();
    coord.begin_episode(&clock);
    for _ in 0..10 {
        let out = coord.tick(&mut clock, &obs(0.0), 0.1).unwrap();
        assert!(out.closed.is_empty());
    }
    let summary = coord
        .end_episode(&mut clock, &obs(0.0), 0.1, EpisodeEnd::Truncated)
        .unwrap();

    let levels: Vec<usize> = summary.closed.iter().map(|c| c.level).collect();
    assert_eq!(levels, vec![2, 1, 0]);
    assert!(summary
        .closed
        .iter()
        .all(|c| c.reason == CloseReason::EpisodeEnd && c.elapsed_ticks == 10));
    // Nine rewards inside the loop plus the one delivered at the end
    let bottom_return: f64 = (0..10).map(|i| 0.1 * 0.8f64.powi(i)).sum();
    assert_abs_diff_eq!(summary.closed[0].passed_up.unwrap(), bottom_return, epsilon = 1e-12);
    assert_abs_diff_eq!(summary.closed[1].reward, bottom_return, epsilon = 1e-12);
    assert_abs_diff_eq!(summary.closed[1].passed_up.unwrap(), bottom_return, epsilon = 1e-12);
    assert_abs_diff_eq!(summary.closed[2].reward, bottom_return, epsilon = 1e-12);
    assert!(summary.closed[2].passed_up.is_none());

    // Same through the episode runner: one interval per level
    let mut coord = HierarchyCoordinator::new(spec, Config::default(), 1, 5).unwrap();
    let mut clock = Clock::new();
    let m = run_episode(&mut coord, &mut Endless { reward: 0.1 }, &mut clock, 10).unwrap();
    assert!(!m.terminal);
    assert_eq!(m.intervals, vec![1, 1, 1]);
    assert_eq!(m.decisions, vec![1, 1, 1]);
}

/// top → mid → bottom, where the mid option lasts two ticks so its second
/// interval opens two ticks into its invocation.
fn three_level_spec(top_termination: Termination) -> HierarchySpec {
    HierarchySpec::new(vec![
        LevelSpec::new(
            "top",
            0.95,
            vec![OptionSpec::composite("go", 1, top_termination)],
        ),
        LevelSpec::new(
            "mid",
            0.8,
            vec![OptionSpec::composite("down", 2, Termination::Ticks(2))],
        ),
        LevelSpec::new("bottom", 0.5, vec![OptionSpec::primitive("act", 0)]),
    ])
}

/// Rewards 1, 2 on the mid level's first interval and 3, 4 on its second:
/// - first bottom invocation returns 1 + 0.5·2 = 2
/// - second bottom invocation returns 3 + 0.5·4 = 5
/// - the mid invocation returns 2 + 0.8²·5 = 5.2, which the top receives
const MID_RETURN: f64 = 2.0 + 0.64 * 5.0;

/// Returns flow up through every level when the top option terminates.
#[test]
fn test_three_level_pass_up_on_termination() {
    let mut coord =
        HierarchyCoordinator::new(three_level_spec(Termination::Ticks(4)), Config::default(), 1, 0)
            .unwrap();
    let mut clock = Clock::new();
    coord.begin_episode(&clock);
    coord.tick(&mut clock, &obs(0.0), 0.0).unwrap();

    let mut closed = Vec::new();
    for r in [1.0, 2.0, 3.0, 4.0] {
        closed.extend(coord.tick(&mut clock, &obs(0.0), r).unwrap().closed);
    }

    let first_bottom = closed
        .iter()
        .find(|c| c.level == 2 && c.reason == CloseReason::InvocationEnded)
        .unwrap();
    assert_abs_diff_eq!(first_bottom.passed_up.unwrap(), 2.0, epsilon = 1e-12);

    let last = &closed[closed.len() - 3..];
    assert_eq!(last.iter().map(|c| c.level).collect::<Vec<_>>(), vec![2, 1, 0]);
    assert_abs_diff_eq!(last[0].passed_up.unwrap(), 5.0, epsilon = 1e-12);
    assert_eq!(last[1].reason, CloseReason::InvocationEnded);
    assert_abs_diff_eq!(last[1].reward, 5.0, epsilon = 1e-12);
    assert_abs_diff_eq!(last[1].passed_up.unwrap(), MID_RETURN, epsilon = 1e-12);
    assert_eq!(last[2].reason, CloseReason::Terminated);
    assert_abs_diff_eq!(last[2].reward, MID_RETURN, epsilon = 1e-12);
    assert!(last[2].td_error.raw > 0.0);
}

/// The same returns reach the top when the episode ends mid-option.
#[test]
fn test_three_level_pass_up_on_episode_end() {
    let mut coord =
        HierarchyCoordinator::new(three_level_spec(Termination::Never), Config::default(), 1, 0)
            .unwrap();
    let mut clock = Clock::new();
    coord.begin_episode(&clock);
    coord.tick(&mut clock, &obs(0.0), 0.0).unwrap();
    for r in [1.0, 2.0, 3.0] {
        coord.tick(&mut clock, &obs(0.0), r).unwrap();
    }
    let summary = coord
        .end_episode(&mut clock, &obs(0.0), 4.0, EpisodeEnd::Terminal)
        .unwrap();

    let closed = &summary.closed;
    assert_eq!(closed.iter().map(|c| c.level).collect::<Vec<_>>(), vec![2, 1, 0]);
    assert_abs_diff_eq!(closed[0].passed_up.unwrap(), 5.0, epsilon = 1e-12);
    assert_abs_diff_eq!(closed[1].passed_up.unwrap(), MID_RETURN, epsilon = 1e-12);
    assert_abs_diff_eq!(closed[2].reward, MID_RETURN, epsilon = 1e-12);
    assert_abs_diff_eq!(closed[2].td_error.raw, MID_RETURN, epsilon = 1e-12);
}

/// Timer terminations close after a drawn duration within range.
#[test]
fn test_timer_option_durations_in_range() {
    let spec = two_level_spec(Termination::Timer { min: 2, max: 5 }, 0.9);
    let mut coord = HierarchyCoordinator::new(spec, Config::default(), 1, 11).unwrap();
    coord.set_mode(SelectionMode::Exploit);
    let mut clock = Clock::new();
    coord.begin_episode(&clock);

    let mut top_closes = 0;
    for _ in 0..200 {
        let out = coord.tick(&mut clock, &obs(0.0), 0.0).unwrap();
        for c in out.closed.iter().filter(|c| c.level == 0) {
            if c.option == 0 {
                assert!((2..=5).contains(&c.elapsed_ticks), "{}", c.elapsed_ticks);
            }
            top_closes += 1;
        }
    }
    assert!(top_closes > 0);
}

#[test]
fn test_configuration_errors_are_fatal() {
    let mut spec = two_level_spec(Termination::Ticks(2), 0.9);
    spec.levels[1]
        .options
        .push(OptionSpec::composite("loop", 0, Termination::Never));
    assert!(matches!(
        HierarchyCoordinator::new(spec, Config::default(), 1, 0),
        Err(HrlError::Cycle { .. })
    ));

    let spec = two_level_spec(Termination::Ticks(2), 1.5);
    assert!(matches!(
        HierarchyCoordinator::new(spec, Config::default(), 1, 0),
        Err(HrlError::InvalidParameter { .. })
    ));

    let mut spec = two_level_spec(Termination::Ticks(2), 0.9);
    spec.levels[0].options[0] = OptionSpec::composite("A", 4, Termination::Never);
    assert!(matches!(
        HierarchyCoordinator::new(spec, Config::default(), 1, 0),
        Err(HrlError::UndefinedSubLevel { sub_level: 4, .. })
    ));

    let config = Config {
        learning_rate: 0.0,
        ..Config::default()
    };
    assert!(matches!(
        HierarchyCoordinator::new(two_level_spec(Termination::Never, 0.9), config, 1, 0),
        Err(HrlError::InvalidParameter { .. })
    ));
}

/// Estimates beyond the sanity bound are reported, not clamped.
#[test]
fn test_divergence_is_reported() {
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
    coord.begin_episode(&clock);
    coord.tick(&mut clock, &obs(0.0), 0.0).unwrap();
    let err = coord.tick(&mut clock, &obs(0.0), 10.0).unwrap_err();
    match err {
        HrlError::Divergence { level, value, .. } => {
            assert_eq!(level, 0);
            assert_abs_diff_eq!(value, 10.0, epsilon = 1e-9);
        }
        other => panic!("expected divergence, got {other}"),
    }
}

#[test]
fn test_checkpoint_roundtrip_population_backend() {
    let mut spec = two_level_spec(Termination::Ticks(2), 0.9);
    for level in &mut spec.levels {
        level.estimator = EstimatorSpec::Population {
            neurons: 40,
            intercept_low: -0.3,
            intercept_high: 0.3,
            max_gain: 2.0,
            initial_value: 0.0,
        };
    }
    let mut trained = HierarchyCoordinator::new(spec.clone(), Config::default(), 1, 21).unwrap();
    let mut clock = Clock::new();
    train(&mut trained, &mut Endless { reward: 0.2 }, &mut clock, 5, 20).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hrl.json");
    save_checkpoint(&path, &trained).unwrap();

    let mut restored = HierarchyCoordinator::new(spec, Config::default(), 1, 99).unwrap();
    restored.restore(&load_checkpoint(&path).unwrap()).unwrap();
    assert_eq!(restored.episode(), 5);
    for (level, context) in [(0, None), (1, Some(0))] {
        let a = trained.values(level, &obs(0.0), context).unwrap();
        let b = restored.values(level, &obs(0.0), context).unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert_abs_diff_eq!(*x, *y, epsilon = 1e-9);
        }
    }
}

#[test]
fn test_parallel_replicates_match_sequential() {
    let spec = two_level_spec(Termination::Ticks(3), 0.9);
    let config = Config::default();
    let runs = train_replicates_parallel(
        &spec,
        &config,
        |_| Endless { reward: 0.05 },
        &[7, 8],
        10,
        15,
    )
    .unwrap();

    let mut coord = HierarchyCoordinator::new(spec, config, 1, 8).unwrap();
    let mut clock = Clock::new();
    let sequential = train(&mut coord, &mut Endless { reward: 0.05 }, &mut clock, 10, 15).unwrap();
    assert_eq!(runs[1].seed, 8);
    assert_eq!(runs[1].metrics, sequential);
}
