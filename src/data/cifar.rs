//! CIFAR-10 in its binary distribution format.
//!
//! Each batch file is a run of 3073-byte records: one label byte followed by a
//! 32x32 image stored channel-major (all red, then green, then blue).

use super::dataset::Dataset;
use super::pipeline::ImagePipeline;
use crate::error::{DataError, Result};
use flate2::read::GzDecoder;
use image::RgbImage;
use md5::{Digest, Md5};
use ndarray::ArrayD;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tar::Archive;
use tracing::{debug, info, warn};

pub const CIFAR10_URL: &str = "https://www.cs.toronto.edu/~kriz/cifar-10-binary.tar.gz";

/// Published MD5 of the binary archive.
pub const CIFAR10_MD5: &str = "c32a1d4ab5d03f1284b67883e8d87530";

/// Directory the archive unpacks into.
pub const BATCH_DIR: &str = "cifar-10-batches-bin";

/// Every file of the official distribution holds this many records.
pub const RECORDS_PER_BATCH: usize = 10_000;

const ARCHIVE_NAME: &str = "cifar-10-binary.tar.gz";

const SIDE: usize = 32;
const IMAGE_BYTES: usize = 3 * SIDE * SIDE;
const RECORD_SIZE: usize = IMAGE_BYTES + 1;

const TRAIN_BATCHES: &[&str] = &[
    "data_batch_1.bin",
    "data_batch_2.bin",
    "data_batch_3.bin",
    "data_batch_4.bin",
    "data_batch_5.bin",
];
const TEST_BATCHES: &[&str] = &["test_batch.bin"];

/// How [`Cifar10Dataset::new`] treats the files on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CifarOptions {
    /// Fetch the archive when the split is missing or fails verification.
    pub download: bool,
    /// Require [`RECORDS_PER_BATCH`] records in every batch file. Turning
    /// this off only keeps the record-size check.
    pub verify: bool,
}

impl Default for CifarOptions {
    fn default() -> Self {
        Self {
            download: true,
            verify: true,
        }
    }
}

pub struct Cifar10Dataset {
    root: PathBuf,
    train: bool,
    /// `len * IMAGE_BYTES` bytes, channel-major per image.
    images: Vec<u8>,
    labels: Vec<u8>,
    pipeline: ImagePipeline,
}

impl Cifar10Dataset {
    pub const NUM_CLASSES: usize = 10;

    /// Loads the train or test split from `root`. A split that is missing
    /// or fails verification is downloaded again when `options.download`
    /// is set, otherwise the problem is returned.
    pub fn new<P: AsRef<Path>>(
        root: P,
        train: bool,
        options: CifarOptions,
        pipeline: ImagePipeline,
    ) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let batch_dir = root.join(BATCH_DIR);

        if let Err(problem) = Self::check_split(&batch_dir, train, options.verify) {
            if !options.download {
                return Err(problem);
            }
            warn!(error = %problem, "CIFAR-10 split unusable, downloading");
            download_cifar10(&root)?;
            Self::check_split(&batch_dir, train, options.verify)?;
        }

        let (images, labels) = Self::read_batches(&batch_dir, train)?;
        let split = if train { "train" } else { "test" };
        info!(
            root = %root.display(),
            split,
            samples = labels.len(),
            "Loaded CIFAR-10"
        );

        Ok(Self {
            root,
            train,
            images,
            labels,
            pipeline,
        })
    }

    pub fn batch_files(train: bool) -> &'static [&'static str] {
        if train {
            TRAIN_BATCHES
        } else {
            TEST_BATCHES
        }
    }

    /// Checks presence and size of every batch file without reading it.
    fn check_split(batch_dir: &Path, train: bool, verify: bool) -> Result<()> {
        for file in Self::batch_files(train) {
            let path = batch_dir.join(file);
            let len = match fs::metadata(&path) {
                Ok(meta) if meta.is_file() => meta.len() as usize,
                Ok(_) => return Err(DataError::MissingBatch(path)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(DataError::MissingBatch(path))
                }
                Err(e) => return Err(e.into()),
            };
            if len % RECORD_SIZE != 0 {
                return Err(DataError::MalformedBatch { path, len });
            }
            let records = len / RECORD_SIZE;
            if verify && records != RECORDS_PER_BATCH {
                return Err(DataError::TruncatedBatch {
                    path,
                    records,
                    expected: RECORDS_PER_BATCH,
                });
            }
        }
        Ok(())
    }

    fn read_batches(batch_dir: &Path, train: bool) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut images = Vec::new();
        let mut labels = Vec::new();

        for file in Self::batch_files(train) {
            let path = batch_dir.join(file);
            let buffer = fs::read(&path)?;
            if buffer.len() % RECORD_SIZE != 0 {
                return Err(DataError::MalformedBatch {
                    path,
                    len: buffer.len(),
                });
            }
            for record in buffer.chunks_exact(RECORD_SIZE) {
                labels.push(record[0]);
                images.extend_from_slice(&record[1..]);
            }
            let records = buffer.len() / RECORD_SIZE;
            debug!(path = %path.display(), records, "Read CIFAR-10 batch");
        }

        Ok((images, labels))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_train(&self) -> bool {
        self.train
    }

    pub fn pipeline(&self) -> &ImagePipeline {
        &self.pipeline
    }

    /// Raw 32x32 image at `index`.
    pub fn image(&self, index: usize) -> Result<RgbImage> {
        self.check_index(index)?;
        let bytes = &self.images[index * IMAGE_BYTES..(index + 1) * IMAGE_BYTES];
        let plane = SIDE * SIDE;
        Ok(RgbImage::from_fn(SIDE as u32, SIDE as u32, |x, y| {
            let offset = y as usize * SIDE + x as usize;
            image::Rgb([bytes[offset], bytes[plane + offset], bytes[2 * plane + offset]])
        }))
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.labels.len() {
            return Err(DataError::IndexOutOfBounds {
                index,
                len: self.labels.len(),
            });
        }
        Ok(())
    }
}

impl Dataset for Cifar10Dataset {
    type Item = ArrayD<f32>;
    type Label = usize;

    fn len(&self) -> usize {
        self.labels.len()
    }

    fn get(&self, index: usize) -> Result<(Self::Item, Self::Label)> {
        let image = self.image(index)?;
        let tensor = self.pipeline.apply(&image)?;
        Ok((tensor, self.labels[index] as usize))
    }

    fn get_label(&self, index: usize) -> Result<Self::Label> {
        self.check_index(index)?;
        Ok(self.labels[index] as usize)
    }
}

/// Downloads the binary archive, checks its digest and installs it into
/// `root`.
pub fn download_cifar10(root: &Path) -> Result<()> {
    fs::create_dir_all(root)?;
    info!(url = CIFAR10_URL, root = %root.display(), "Downloading CIFAR-10");

    let staging = tempfile::Builder::new()
        .prefix(".cifar-10-download")
        .tempdir_in(root)?;
    let archive = staging.path().join(ARCHIVE_NAME);
    fetch(CIFAR10_URL, &archive)?;
    install_archive(&archive, CIFAR10_MD5, root)?;

    info!(root = %root.display(), "CIFAR-10 extracted");
    Ok(())
}

fn fetch(url: &str, dest: &Path) -> Result<()> {
    let download_err = |source: reqwest::Error| DataError::Download {
        url: url.to_string(),
        source,
    };
    let client = reqwest::blocking::Client::builder()
        .user_agent(concat!("visionloader/", env!("CARGO_PKG_VERSION")))
        .timeout(None::<std::time::Duration>)
        .build()
        .map_err(download_err)?;
    let mut response = client.get(url).send().map_err(download_err)?;

    if !response.status().is_success() {
        return Err(DataError::HttpStatus {
            url: url.to_string(),
            status: response.status().as_u16(),
        });
    }

    let mut file = File::create(dest)?;
    let bytes = io::copy(&mut response, &mut file)?;
    debug!(url, bytes, "Archive downloaded");
    Ok(())
}

/// Verifies `archive` against `expected_md5` and unpacks it into `root`.
///
/// Extraction happens in a staging directory inside `root`; the existing
/// batch directory is replaced only after the whole archive unpacked.
pub fn install_archive(archive: &Path, expected_md5: &str, root: &Path) -> Result<()> {
    let actual = md5_hex(archive)?;
    if actual != expected_md5 {
        return Err(DataError::ChecksumMismatch {
            path: archive.to_path_buf(),
            expected: expected_md5.to_string(),
            actual,
        });
    }

    let staging = tempfile::Builder::new()
        .prefix(".cifar-10-extract")
        .tempdir_in(root)?;
    Archive::new(GzDecoder::new(File::open(archive)?)).unpack(staging.path())?;

    let unpacked = staging.path().join(BATCH_DIR);
    if !unpacked.is_dir() {
        return Err(DataError::MissingBatch(unpacked));
    }
    let target = root.join(BATCH_DIR);
    if target.exists() {
        fs::remove_dir_all(&target)?;
    }
    fs::rename(&unpacked, &target)?;
    Ok(())
}

fn md5_hex(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; 1 << 16];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::pipeline::PipelineKind;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    const LOCAL: CifarOptions = CifarOptions {
        download: false,
        verify: false,
    };

    fn record(label: u8, red: u8, green: u8, blue: u8) -> Vec<u8> {
        let plane = SIDE * SIDE;
        let mut r = vec![label];
        r.extend(std::iter::repeat(red).take(plane));
        r.extend(std::iter::repeat(green).take(plane));
        r.extend(std::iter::repeat(blue).take(plane));
        r
    }

    fn write_test_split(root: &Path, records: &[Vec<u8>]) {
        let dir = root.join(BATCH_DIR);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("test_batch.bin"), records.concat()).unwrap();
    }

    fn eval(size: usize) -> ImagePipeline {
        ImagePipeline::new(PipelineKind::Eval, size)
    }

    /// tar.gz с `cifar-10-batches-bin/test_batch.bin` из `records` записей.
    fn write_archive(path: &Path, records: usize) {
        let batch = record(4, 9, 9, 9).repeat(records);
        let mut header = tar::Header::new_gnu();
        header.set_size(batch.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();

        let mut builder = tar::Builder::new(GzEncoder::new(
            File::create(path).unwrap(),
            Compression::fast(),
        ));
        builder
            .append_data(
                &mut header,
                format!("{BATCH_DIR}/test_batch.bin"),
                batch.as_slice(),
            )
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn test_reads_records() {
        let tmp = tempfile::tempdir().unwrap();
        write_test_split(tmp.path(), &[record(3, 255, 0, 0), record(9, 0, 0, 255)]);

        let dataset = Cifar10Dataset::new(tmp.path(), false, LOCAL, eval(32)).unwrap();

        assert_eq!(dataset.len(), 2);
        assert!(!dataset.is_train());
        assert_eq!(dataset.get_label(0).unwrap(), 3);
        assert_eq!(dataset.get_label(1).unwrap(), 9);

        let image = dataset.image(1).unwrap();
        assert_eq!(image.get_pixel(5, 7).0, [0, 0, 255]);

        let (tensor, label) = dataset.get(0).unwrap();
        assert_eq!(label, 3);
        assert_eq!(tensor.shape(), &[3, 32, 32]);
        assert!((tensor[[0, 0, 0]] - 1.0).abs() < 1e-6);
        assert!((tensor[[2, 0, 0]] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_index_out_of_bounds() {
        let tmp = tempfile::tempdir().unwrap();
        write_test_split(tmp.path(), &[record(0, 1, 2, 3)]);
        let dataset = Cifar10Dataset::new(tmp.path(), false, LOCAL, eval(8)).unwrap();

        assert!(matches!(
            dataset.get(1),
            Err(DataError::IndexOutOfBounds { index: 1, len: 1 })
        ));
    }

    #[test]
    fn test_malformed_batch() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join(BATCH_DIR);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("test_batch.bin"), vec![0u8; RECORD_SIZE + 10]).unwrap();

        let result = Cifar10Dataset::new(tmp.path(), false, LOCAL, eval(8));
        assert!(matches!(result, Err(DataError::MalformedBatch { .. })));
    }

    #[test]
    fn test_truncated_batch_fails_verification() {
        let tmp = tempfile::tempdir().unwrap();
        // Обрезано ровно по границе записи
        write_test_split(tmp.path(), &vec![record(1, 2, 3, 4); 3]);

        let strict = CifarOptions {
            download: false,
            verify: true,
        };
        match Cifar10Dataset::new(tmp.path(), false, strict, eval(8)) {
            Err(DataError::TruncatedBatch {
                records, expected, ..
            }) => {
                assert_eq!(records, 3);
                assert_eq!(expected, RECORDS_PER_BATCH);
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("a truncated split was accepted"),
        }

        // Без проверки те же файлы читаются
        assert_eq!(Cifar10Dataset::new(tmp.path(), false, LOCAL, eval(8)).unwrap().len(), 3);
    }

    #[test]
    fn test_missing_split_without_download() {
        let tmp = tempfile::tempdir().unwrap();
        let result = Cifar10Dataset::new(
            tmp.path(),
            true,
            LOCAL,
            ImagePipeline::new(PipelineKind::TrainPlain, 8),
        );
        match result {
            Err(DataError::MissingBatch(path)) => {
                assert!(path.ends_with("data_batch_1.bin"));
            }
            other => panic!("unexpected result: {:?}", other.err()),
        }
    }

    #[test]
    fn test_install_replaces_damaged_split() {
        let tmp = tempfile::tempdir().unwrap();
        write_test_split(tmp.path(), &[record(0, 0, 0, 0)]);
        let archive_dir = tempfile::tempdir().unwrap();
        let archive = archive_dir.path().join(ARCHIVE_NAME);
        write_archive(&archive, 5);

        let digest = md5_hex(&archive).unwrap();
        assert_eq!(digest.len(), 32);
        install_archive(&archive, &digest, tmp.path()).unwrap();

        let dataset = Cifar10Dataset::new(tmp.path(), false, LOCAL, eval(8)).unwrap();
        assert_eq!(dataset.len(), 5);
        assert_eq!(dataset.get_label(4).unwrap(), 4);

        // Временные каталоги распаковки не остаются в root
        let leftovers: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .filter(|name| name != BATCH_DIR)
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[test]
    fn test_checksum_mismatch_keeps_existing_files() {
        let tmp = tempfile::tempdir().unwrap();
        write_test_split(tmp.path(), &[record(7, 0, 0, 0)]);
        let archive = tmp.path().join(ARCHIVE_NAME);
        write_archive(&archive, 2);

        let result = install_archive(&archive, CIFAR10_MD5, tmp.path());
        assert!(matches!(result, Err(DataError::ChecksumMismatch { .. })));

        let dataset = Cifar10Dataset::new(tmp.path(), false, LOCAL, eval(8)).unwrap();
        assert_eq!(dataset.len(), 1);
        assert_eq!(dataset.get_label(0).unwrap(), 7);
    }
}
