//! Train / valid / test loader factory.
//!
//! [`get_loaders`] is the only entry point a training script needs: it picks
//! the dataset branch from the config, builds the pipelines, lines up the
//! ranks around dataset setup and wraps everything in [`DataLoader`]s.

use crate::config::{DatasetKind, LoaderConfig, RankRole};
use crate::data::{
    AnySampler, Cifar10Dataset, CifarOptions, DataLoader, Dataset, DistributedSampler,
    ImageDataset, ImageFolderDataset, ImagePipeline, PipelineKind, RandomSampler,
    SequentialSampler,
};
use crate::distributed::ProcessGroup;
use crate::error::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Directory under `data_root` holding the folder-per-class splits.
pub const FOLDER_DATASET_DIR: &str = "DatasetV2";

pub struct Loaders {
    pub train: DataLoader<ImageDataset>,
    /// Only for folder datasets, and only on ranks that evaluate.
    pub valid: Option<DataLoader<ImageDataset>>,
    /// Only on ranks that evaluate.
    pub test: Option<DataLoader<ImageDataset>>,
}

/// Datasets of one run, before they are wrapped in loaders.
struct Splits {
    train: ImageDataset,
    valid: Option<ImageDataset>,
    test: Option<ImageDataset>,
}

/// Root of one folder split, e.g. `./data/DatasetV2/valid`.
pub fn folder_split_root(data_root: &Path, split: &str) -> PathBuf {
    data_root.join(FOLDER_DATASET_DIR).join(split)
}

/// Builds the loaders for this process.
///
/// A follower (`local_rank > 0`) waits on `group.barrier()` before touching
/// the filesystem; the leader (`local_rank == 0`) enters the barrier after
/// its datasets are ready, so downloads and directory scans happen once.
/// With `local_rank == -1` the group is not used for synchronisation.
pub fn get_loaders(config: &LoaderConfig, group: &dyn ProcessGroup) -> Result<Loaders> {
    config.validate()?;
    let role = config.role();
    let kind = config.dataset_kind();
    info!(
        dataset = %config.dataset,
        ?kind,
        ?role,
        img_size = config.img_size,
        augmentation = config.augmentation,
        "Building data loaders"
    );

    if role == RankRole::Follower {
        debug!(rank = group.rank(), "Waiting for the leader to prepare datasets");
        group.barrier()?;
    }

    let splits = build_splits(config, kind, role)?;

    if role == RankRole::Leader {
        debug!("Datasets ready, releasing followers");
        group.barrier()?;
    }

    let train_sampler = train_sampler(config, role, group, splits.train.len())?;
    let train = wrap(splits.train, train_sampler, config.train_batch_size, config);
    let valid = splits.valid.map(|dataset| eval_loader(dataset, config));
    let test = splits.test.map(|dataset| eval_loader(dataset, config));

    info!(
        classes = train.dataset().num_classes(),
        train_batches = train.num_batches(),
        valid_batches = ?valid.as_ref().map(|l| l.num_batches()),
        test_batches = ?test.as_ref().map(|l| l.num_batches()),
        "Data loaders ready"
    );

    Ok(Loaders { train, valid, test })
}

fn build_splits(config: &LoaderConfig, kind: DatasetKind, role: RankRole) -> Result<Splits> {
    let train_pipeline = ImagePipeline::new(
        PipelineKind::for_train(kind, config.augmentation),
        config.img_size,
    );
    let eval_pipeline = || ImagePipeline::new(PipelineKind::Eval, config.img_size);
    let with_eval = role.builds_eval_splits();

    match kind {
        DatasetKind::Cifar10 => {
            let root = &config.data_root;
            let options = CifarOptions {
                download: config.download,
                verify: config.verify_cifar,
            };
            let train = Cifar10Dataset::new(root, true, options, train_pipeline)?;
            let test: Option<ImageDataset> = if with_eval {
                Some(Cifar10Dataset::new(root, false, options, eval_pipeline())?.into())
            } else {
                None
            };
            Ok(Splits {
                train: train.into(),
                valid: None,
                test,
            })
        }
        DatasetKind::ImageFolder => {
            let root = |split: &str| folder_split_root(&config.data_root, split);
            let train = ImageFolderDataset::new(root("train"), train_pipeline)?;
            let (valid, test): (Option<ImageDataset>, Option<ImageDataset>) = if with_eval {
                (
                    Some(ImageFolderDataset::new(root("valid"), eval_pipeline())?.into()),
                    Some(ImageFolderDataset::new(root("test"), eval_pipeline())?.into()),
                )
            } else {
                (None, None)
            };
            Ok(Splits {
                train: train.into(),
                valid,
                test,
            })
        }
    }
}

fn train_sampler(
    config: &LoaderConfig,
    role: RankRole,
    group: &dyn ProcessGroup,
    len: usize,
) -> Result<AnySampler> {
    if !role.is_distributed() {
        let sampler = match config.seed {
            Some(seed) => RandomSampler::with_seed(len, seed),
            None => RandomSampler::new(len),
        };
        return Ok(sampler.into());
    }

    let mut sampler = DistributedSampler::new(len, group.world_size(), group.rank())?;
    if let Some(seed) = config.seed {
        sampler = sampler.with_seed(seed);
    }
    debug!(
        rank = sampler.rank(),
        world_size = sampler.num_replicas(),
        shard = sampler.samples_per_replica(),
        "Sharding train split"
    );
    Ok(sampler.into())
}

fn eval_loader(dataset: ImageDataset, config: &LoaderConfig) -> DataLoader<ImageDataset> {
    let sampler = SequentialSampler::new(dataset.len());
    wrap(dataset, sampler.into(), config.eval_batch_size, config)
}

fn wrap(
    dataset: ImageDataset,
    sampler: AnySampler,
    batch_size: usize,
    config: &LoaderConfig,
) -> DataLoader<ImageDataset> {
    DataLoader::new(Arc::new(dataset), sampler, batch_size)
        .num_workers(config.num_workers)
        .pin_memory(config.pin_memory)
        .drop_last(config.drop_last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SamplingStrategy;
    use crate::distributed::SingleProcess;
    use crate::error::DataError;
    use image::RgbImage;
    use std::fs;

    fn write_folder_split(data_root: &Path, split: &str, per_class: usize) {
        for class in ["a", "b"] {
            let dir = folder_split_root(data_root, split).join(class);
            fs::create_dir_all(&dir).unwrap();
            for i in 0..per_class {
                RgbImage::from_pixel(12, 9, image::Rgb([i as u8, 50, 100]))
                    .save(dir.join(format!("{i}.png")))
                    .unwrap();
            }
        }
    }

    fn folder_config(root: &Path) -> LoaderConfig {
        LoaderConfig {
            dataset: "custom".into(),
            img_size: 16,
            train_batch_size: 3,
            eval_batch_size: 2,
            data_root: root.to_path_buf(),
            num_workers: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_folder_split_roots_are_distinct() {
        let root = Path::new("./data");
        let roots: Vec<_> = ["train", "valid", "test"]
            .iter()
            .map(|s| folder_split_root(root, s))
            .collect();
        assert_eq!(roots[0], Path::new("./data/DatasetV2/train"));
        assert_ne!(roots[0], roots[1]);
        assert_ne!(roots[1], roots[2]);
    }

    #[test]
    fn test_single_process_folder_loaders() {
        let tmp = tempfile::tempdir().unwrap();
        for split in ["train", "valid", "test"] {
            write_folder_split(tmp.path(), split, 2);
        }
        let config = folder_config(tmp.path());

        let mut loaders = get_loaders(&config, &SingleProcess).unwrap();
        assert_eq!(loaders.train.sampling_strategy(), SamplingStrategy::Random);
        assert_eq!(loaders.train.dataset().num_classes(), 2);
        assert_eq!(loaders.train.batch_size(), 3);
        assert_eq!(loaders.train.len(), 4);
        assert_eq!(loaders.train.num_batches(), 2);

        let valid = loaders.valid.as_mut().unwrap();
        assert_eq!(valid.sampling_strategy(), SamplingStrategy::Sequential);
        assert_eq!(valid.batch_size(), 2);
        let batch = valid.iter().unwrap().next().unwrap().unwrap();
        assert_eq!(batch.images.shape(), &[2, 3, 16, 16]);
        assert_eq!(batch.labels, vec![0, 0]);
        assert!(loaders.test.is_some());
    }

    #[test]
    fn test_missing_folder_split_propagates() {
        let tmp = tempfile::tempdir().unwrap();
        write_folder_split(tmp.path(), "train", 1);
        write_folder_split(tmp.path(), "valid", 1);

        let result = get_loaders(&folder_config(tmp.path()), &SingleProcess);
        match result {
            Err(DataError::RootNotFound(path)) => assert!(path.ends_with("DatasetV2/test")),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("test split is missing"),
        }
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = LoaderConfig {
            train_batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            get_loaders(&config, &SingleProcess),
            Err(DataError::Config(_))
        ));
    }

    #[test]
    fn test_leader_shards_with_single_member_group() {
        let tmp = tempfile::tempdir().unwrap();
        for split in ["train", "valid", "test"] {
            write_folder_split(tmp.path(), split, 3);
        }
        let config = LoaderConfig {
            local_rank: 0,
            seed: Some(11),
            ..folder_config(tmp.path())
        };

        let loaders = get_loaders(&config, &SingleProcess).unwrap();
        assert_eq!(loaders.train.sampling_strategy(), SamplingStrategy::Distributed);
        assert_eq!(loaders.train.len(), 6);
        assert!(loaders.valid.is_some());
        assert!(loaders.test.is_some());
    }
}
