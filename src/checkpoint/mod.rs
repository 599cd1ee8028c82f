//! Save and load learned value estimates.
//!
//! A checkpoint holds one [`EstimatorSnapshot`] per level plus the episode
//! counter (annealing schedules resume where they left off). Traces and the
//! active path are episode-local and are not saved.

use crate::core::{HrlError, HrlResult};
use crate::hierarchy::HierarchyCoordinator;
use crate::value::EstimatorSnapshot;
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// Checkpoint format version, bumped on incompatible layout changes.
pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelSnapshot {
    /// Level name, checked on restore
    pub name: String,
    pub estimator: EstimatorSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointData {
    pub version: u32,
    /// Episodes completed when the checkpoint was taken
    pub episode: usize,
    pub levels: Vec<LevelSnapshot>,
}

impl CheckpointData {
    /// Snapshot every level of `coordinator`.
    pub fn capture(coordinator: &HierarchyCoordinator) -> Self {
        let levels = coordinator
            .spec()
            .levels
            .iter()
            .enumerate()
            .filter_map(|(index, level)| {
                coordinator.estimator(index).map(|est| LevelSnapshot {
                    name: level.name.clone(),
                    estimator: est.snapshot(),
                })
            })
            .collect();
        Self {
            version: CHECKPOINT_VERSION,
            episode: coordinator.episode(),
            levels,
        }
    }
}

/// Write the coordinator's learned parameters as pretty-printed JSON.
///
/// # Errors
/// Returns `Err` if the file cannot be created or written.
pub fn save_checkpoint<P: AsRef<Path>>(
    path: P,
    coordinator: &HierarchyCoordinator,
) -> HrlResult<()> {
    let data = CheckpointData::capture(coordinator);
    let mut writer = BufWriter::new(File::create(path.as_ref())?);
    serde_json::to_writer_pretty(&mut writer, &data)?;
    writer.flush()?;
    info!(
        "checkpoint saved to {} (episode {})",
        path.as_ref().display(),
        data.episode
    );
    Ok(())
}

/// Read a checkpoint written by [`save_checkpoint`].
///
/// # Errors
/// Returns `Err` if the file is missing or is not a valid checkpoint.
pub fn load_checkpoint<P: AsRef<Path>>(path: P) -> HrlResult<CheckpointData> {
    let reader = BufReader::new(File::open(path.as_ref())?);
    let data: CheckpointData = serde_json::from_reader(reader)?;
    if data.version != CHECKPOINT_VERSION {
        return Err(HrlError::SnapshotMismatch {
            expected: format!("checkpoint version {}", CHECKPOINT_VERSION),
            got: format!("checkpoint version {}", data.version),
        });
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Clock;
    use crate::hierarchy::{HierarchySpec, LevelSpec, OptionSpec};
    use crate::value::EstimatorSpec;
    use crate::Config;
    use approx::assert_abs_diff_eq;
    use ndarray::Array1;

    fn coordinator(seed: u64) -> HierarchyCoordinator {
        let spec = HierarchySpec::new(vec![LevelSpec::new(
            "only",
            0.9,
            vec![OptionSpec::primitive("a", 0), OptionSpec::primitive("b", 1)],
        )
        .with_estimator(EstimatorSpec::Linear { initial_value: 0.0 })]);
        HierarchyCoordinator::new(spec, Config::default(), 2, seed).unwrap()
    }

    #[test]
    fn test_save_and_load_restores_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ckpt.json");

        let mut trained = coordinator(1);
        let mut clock = Clock::new();
        let obs = Array1::from(vec![0.5, 1.0]);
        trained.begin_episode(&clock);
        for _ in 0..10 {
            trained.tick(&mut clock, &obs, 1.0).unwrap();
        }
        save_checkpoint(&path, &trained).unwrap();

        let mut fresh = coordinator(2);
        fresh.restore(&load_checkpoint(&path).unwrap()).unwrap();
        let restored = fresh.values(0, &obs, None).unwrap();
        let original = trained.values(0, &obs, None).unwrap();
        assert_ne!(original, vec![0.0, 0.0]);
        for (a, b) in restored.iter().zip(&original) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_restore_rejects_renamed_level() {
        let coord = coordinator(1);
        let mut data = CheckpointData::capture(&coord);
        data.levels[0].name = "other".to_string();
        let mut target = coordinator(1);
        assert!(matches!(
            target.restore(&data),
            Err(HrlError::SnapshotMismatch { .. })
        ));
    }

    #[test]
    fn test_saved_file_is_complete_on_return() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ckpt.json");
        let coord = coordinator(3);
        save_checkpoint(&path, &coord).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let parsed: CheckpointData = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, CheckpointData::capture(&coord));
    }

    #[test]
    fn test_save_into_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("no-such-dir").join("ckpt.json");
        assert!(matches!(
            save_checkpoint(&path, &coordinator(0)),
            Err(HrlError::Io(_))
        ));
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_checkpoint(dir.path().join("nope.json")),
            Err(HrlError::Io(_))
        ));
    }
}
