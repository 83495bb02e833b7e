//  src/main.rs
//! Строит загрузчики данных по конфигу и показывает первый батч.

use clap::Parser;
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;
use visionloader::config::LoaderConfig;
use visionloader::distributed::{FileGroup, ProcessGroup, SingleProcess};
use visionloader::get_loaders;

/// Аргументы командной строки
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "visionloader: train/valid/test loaders for image classification",
    long_about = None
)]
struct Args {
    /// JSON-файл с конфигурацией; флаги ниже переопределяют его поля
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// "cifar10" или имя датасета-папки
    #[arg(long)]
    dataset: Option<String>,

    /// Включить аугментации (только для датасета-папки)
    #[arg(long)]
    augmentation: bool,

    #[arg(long)]
    img_size: Option<usize>,

    #[arg(long)]
    train_batch_size: Option<usize>,

    #[arg(long)]
    eval_batch_size: Option<usize>,

    /// -1 без распределения, 0 ведущий процесс, >0 ведомые
    #[arg(long, allow_hyphen_values = true)]
    local_rank: Option<i64>,

    #[arg(long)]
    data_root: Option<PathBuf>,

    #[arg(long)]
    num_workers: Option<usize>,

    /// Не скачивать CIFAR-10, если его нет на диске
    #[arg(long)]
    no_download: bool,
}

impl Args {
    fn into_config(self) -> Result<LoaderConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => LoaderConfig::from_json_file(path)?,
            None => LoaderConfig::default(),
        };
        if let Some(dataset) = self.dataset {
            config.dataset = dataset;
        }
        if self.augmentation {
            config.augmentation = true;
        }
        if let Some(v) = self.img_size {
            config.img_size = v;
        }
        if let Some(v) = self.train_batch_size {
            config.train_batch_size = v;
        }
        if let Some(v) = self.eval_batch_size {
            config.eval_batch_size = v;
        }
        if let Some(v) = self.local_rank {
            config.local_rank = v;
        }
        if let Some(v) = self.data_root {
            config.data_root = v;
        }
        if let Some(v) = self.num_workers {
            config.num_workers = v;
        }
        if self.no_download {
            config.download = false;
        }
        Ok(config)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Args::parse().into_config()?;

    let group: Box<dyn ProcessGroup> = if config.local_rank == -1 {
        Box::new(SingleProcess)
    } else {
        Box::new(FileGroup::from_env()?)
    };

    let started = Instant::now();
    let mut loaders = get_loaders(&config, group.as_ref())?;
    info!(elapsed = ?started.elapsed(), "Loaders built");

    match loaders.train.iter()?.next() {
        Some(batch) => {
            let batch = batch?;
            info!(
                shape = ?batch.images.shape(),
                labels = ?batch.labels,
                "First train batch"
            );
        }
        None => info!("Train split is empty"),
    }

    if let Some(test) = &loaders.test {
        info!(batches = test.num_batches(), samples = test.len(), "Test loader");
    }
    if let Some(valid) = &loaders.valid {
        info!(batches = valid.num_batches(), samples = valid.len(), "Valid loader");
    }
    Ok(())
}
