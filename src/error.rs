//! Error type shared by datasets, transforms, loaders and process groups.
//!
//! Failures from collaborators (filesystem, image decoding, HTTP) are wrapped
//! as-is so the caller sees the original cause via `source()`.

use std::path::PathBuf;
use thiserror::Error;

/// Ошибки загрузки данных.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to decode image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("download of {url} failed: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("download of {url} failed with HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("dataset root does not exist: {0}")]
    RootNotFound(PathBuf),

    #[error("no class directories found under {0}")]
    NoClasses(PathBuf),

    #[error("class directory {root}/{class} contains no images")]
    EmptyClass { class: String, root: PathBuf },

    #[error("missing CIFAR-10 batch file {0} (download disabled)")]
    MissingBatch(PathBuf),

    #[error("malformed CIFAR-10 batch {path}: {len} bytes is not a multiple of the record size")]
    MalformedBatch { path: PathBuf, len: usize },

    #[error("truncated CIFAR-10 batch {path}: {records} records, expected {expected}")]
    TruncatedBatch {
        path: PathBuf,
        records: usize,
        expected: usize,
    },

    #[error("checksum mismatch for {path}: expected md5 {expected}, got {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("index {index} out of bounds for dataset of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("tensor shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("expected a [C, H, W] image tensor, got shape {0:?}")]
    NotAnImage(Vec<usize>),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("rank {rank} is out of range for world size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },

    #[error("rendezvous marker {0} is left over from an unfinished run")]
    StaleRendezvous(PathBuf),

    #[error("loader worker exited before delivering batch {0}")]
    WorkerDisconnected(usize),

    #[error("loader worker panicked while building batch {0}")]
    WorkerPanicked(usize),
}

pub type Result<T> = std::result::Result<T, DataError>;
