//! # Data Loading Module
//!
//! PyTorch-style Dataset and DataLoader API for image classification.
//!
//! ## Key Components
//!
//! - [`Dataset`]: Trait for defining data sources
//! - [`DataLoader`]: Batched iterator with a read-ahead worker pool
//! - [`Sampler`]: Index sampling strategies (sequential, random, distributed)
//! - [`Transform`]: Image transformations (resize, crop, augmentation, normalize)
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use visionloader::data::{
//!     DataLoader, ImageFolderDataset, ImagePipeline, PipelineKind, RandomSampler,
//! };
//!
//! let pipeline = ImagePipeline::new(PipelineKind::TrainPlain, 224);
//! let dataset = Arc::new(ImageFolderDataset::new("data/DatasetV2/train", pipeline)?);
//!
//! let mut loader = DataLoader::new(dataset.clone(), RandomSampler::new(dataset.len()), 32)
//!     .num_workers(4);
//!
//! for batch in loader.iter()? {
//!     let batch = batch?;
//!     // batch.images: [B, 3, 224, 224]
//! }
//! ```
//!
//! ## Available Components
//!
//! ### Datasets
//! - [`Cifar10Dataset`]: CIFAR-10 binary batches, downloaded on demand
//! - [`ImageFolderDataset`]: One subdirectory per class
//! - [`ImageDataset`]: Either of the above
//!
//! ### Samplers
//! - [`SequentialSampler`]: Iterate in order
//! - [`RandomSampler`]: Shuffle indices randomly
//! - [`DistributedSampler`]: One shard per rank
//! - [`BatchSampler`]: Group indices into batches
//!
//! ### Transforms
//! - [`ImagePipeline`]: The fixed train/eval pipelines
//! - [`Compose`]: Chain multiple transforms
//! - [`Normalize`], [`Resize`], [`RandomResizedCrop`] and the random augmentations

pub mod cifar;
pub mod dataloader;
pub mod dataset;
pub mod folder;
pub mod pipeline;
pub mod sampler;
pub mod transforms;

pub use cifar::{Cifar10Dataset, CifarOptions};
pub use dataloader::{Batch, DataLoader, DataLoaderIter};
pub use dataset::{Dataset, ImageDataset};
pub use folder::ImageFolderDataset;
pub use pipeline::{ImagePipeline, PipelineKind};
pub use sampler::{
    AnySampler, BatchSampler, DistributedSampler, RandomSampler, Sampler, SamplingStrategy,
    SequentialSampler,
};
pub use transforms::{
    ColorJitter, Compose, GaussianBlur, Normalize, RandomAdjustSharpness, RandomAffine,
    RandomApply, RandomAutocontrast, RandomChoice, RandomHorizontalFlip, RandomResizedCrop,
    RandomRotation, Resize, Transform,
};
