//! # visionloader: data loaders for image classification training
//!
//! Builds the train / valid / test loaders of a classification run from a
//! small config: transform pipelines, CIFAR-10 or folder-per-class datasets,
//! random / distributed / sequential samplers, and a rank-aware barrier
//! around one-time dataset setup.
//!
//! ## Usage Example
//!
//! ```no_run
//! use visionloader::config::LoaderConfig;
//! use visionloader::distributed::SingleProcess;
//! use visionloader::loaders::get_loaders;
//!
//! let config = LoaderConfig {
//!     train_batch_size: 32,
//!     eval_batch_size: 64,
//!     ..Default::default()
//! };
//! let mut loaders = get_loaders(&config, &SingleProcess)?;
//!
//! for batch in loaders.train.iter()? {
//!     let batch = batch?;
//!     assert_eq!(&batch.images.shape()[1..], &[3, 224, 224]);
//! }
//! # Ok::<(), visionloader::error::DataError>(())
//! ```

pub mod config;
pub mod data;
pub mod distributed;
pub mod error;
pub mod loaders;

pub use config::LoaderConfig;
pub use error::{DataError, Result};
pub use loaders::{get_loaders, Loaders};
