//! Loader configuration.
//!
//! `LoaderConfig` mirrors the handful of training-script flags the loaders
//! depend on. Everything else has a default so a JSON file only needs to name
//! what it changes.

use crate::error::{DataError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Identifier that selects the CIFAR-10 branch.
pub const CIFAR10: &str = "cifar10";

/// Configuration for [`crate::loaders::get_loaders`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// `"cifar10"` or the name of a folder-per-class dataset.
    pub dataset: String,
    /// Use the augmented train pipeline (folder datasets only).
    pub augmentation: bool,
    /// Target square resolution.
    pub img_size: usize,
    pub train_batch_size: usize,
    pub eval_batch_size: usize,
    /// `-1` single process, `0` distributed leader, `>0` follower.
    pub local_rank: i64,
    /// Root under which CIFAR-10 and `DatasetV2/` live.
    pub data_root: PathBuf,
    /// Read-ahead worker threads per loader.
    pub num_workers: usize,
    pub pin_memory: bool,
    pub drop_last: bool,
    /// Fixes the shuffle order when set.
    pub seed: Option<u64>,
    /// Fetch CIFAR-10 when it is not on disk yet or fails verification.
    pub download: bool,
    /// Require full-size CIFAR-10 batch files (10 000 records each).
    pub verify_cifar: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            dataset: CIFAR10.to_string(),
            augmentation: false,
            img_size: 224,
            train_batch_size: 512,
            eval_batch_size: 64,
            local_rank: -1,
            data_root: PathBuf::from("./data"),
            num_workers: 4,
            pin_memory: true,
            drop_last: false,
            seed: None,
            download: true,
            verify_cifar: true,
        }
    }
}

impl LoaderConfig {
    /// Reads a JSON config; missing fields take their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        Ok(config)
    }

    /// Rejects values no loader could work with. Ranks below -1 are not
    /// produced by any launcher and are treated as a configuration error
    /// rather than as followers.
    pub fn validate(&self) -> Result<()> {
        if self.img_size == 0 {
            return Err(DataError::Config("img_size must be positive".into()));
        }
        if self.train_batch_size == 0 || self.eval_batch_size == 0 {
            return Err(DataError::Config("batch sizes must be positive".into()));
        }
        if self.local_rank < -1 {
            return Err(DataError::Config(format!(
                "local_rank must be -1 or a non-negative rank, got {}",
                self.local_rank
            )));
        }
        Ok(())
    }

    pub fn dataset_kind(&self) -> DatasetKind {
        DatasetKind::from_name(&self.dataset)
    }

    pub fn role(&self) -> RankRole {
        RankRole::from_local_rank(self.local_rank)
    }
}

/// Which loader branch a dataset name selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetKind {
    Cifar10,
    ImageFolder,
}

impl DatasetKind {
    pub fn from_name(name: &str) -> Self {
        if name == CIFAR10 {
            DatasetKind::Cifar10
        } else {
            DatasetKind::ImageFolder
        }
    }
}

/// Role of this process in one-time dataset setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankRole {
    /// `local_rank == -1`: no barrier, random sampling.
    Single,
    /// `local_rank == 0`: sets up data first, then releases followers.
    Leader,
    /// `local_rank > 0`: waits for the leader before touching the filesystem.
    Follower,
}

impl RankRole {
    pub fn from_local_rank(local_rank: i64) -> Self {
        match local_rank {
            -1 => RankRole::Single,
            0 => RankRole::Leader,
            _ => RankRole::Follower,
        }
    }

    /// Valid/test splits are only built where evaluation runs.
    pub fn builds_eval_splits(self) -> bool {
        matches!(self, RankRole::Single | RankRole::Leader)
    }

    pub fn is_distributed(self) -> bool {
        !matches!(self, RankRole::Single)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles() {
        assert_eq!(RankRole::from_local_rank(-1), RankRole::Single);
        assert_eq!(RankRole::from_local_rank(0), RankRole::Leader);
        assert_eq!(RankRole::from_local_rank(3), RankRole::Follower);

        assert!(RankRole::Single.builds_eval_splits());
        assert!(RankRole::Leader.builds_eval_splits());
        assert!(!RankRole::Follower.builds_eval_splits());
        assert!(!RankRole::Single.is_distributed());
    }

    #[test]
    fn test_dataset_kind() {
        assert_eq!(DatasetKind::from_name("cifar10"), DatasetKind::Cifar10);
        assert_eq!(DatasetKind::from_name("custom"), DatasetKind::ImageFolder);
        assert_eq!(DatasetKind::from_name("CIFAR10"), DatasetKind::ImageFolder);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: LoaderConfig =
            serde_json::from_str(r#"{"dataset": "custom", "img_size": 128}"#).unwrap();
        assert_eq!(config.dataset, "custom");
        assert_eq!(config.img_size, 128);
        assert_eq!(config.num_workers, 4);
        assert!(config.pin_memory);
        assert_eq!(config.local_rank, -1);
        assert!(config.download && config.verify_cifar);
    }

    #[test]
    fn test_validate() {
        assert!(LoaderConfig::default().validate().is_ok());

        let zero = LoaderConfig {
            img_size: 0,
            ..Default::default()
        };
        assert!(matches!(zero.validate(), Err(DataError::Config(_))));

        let bad_rank = LoaderConfig {
            local_rank: -2,
            ..Default::default()
        };
        assert!(bad_rank.validate().is_err());

        let follower = LoaderConfig {
            local_rank: 7,
            ..Default::default()
        };
        assert!(follower.validate().is_ok());
        assert_eq!(follower.role(), RankRole::Follower);
    }
}
