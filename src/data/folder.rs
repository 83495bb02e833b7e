//! Folder-per-class image dataset.
//!
//! ```text
//! root/
//!   cat/  001.jpg 002.png ...
//!   dog/  a.jpg ...
//! ```
//!
//! Class indices follow the sorted subdirectory names. Images are decoded
//! lazily in [`Dataset::get`].

use super::dataset::Dataset;
use super::pipeline::ImagePipeline;
use crate::error::{DataError, Result};
use ndarray::ArrayD;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// File extensions treated as images (case-insensitive). Same set as
/// torchvision's `IMG_EXTENSIONS`.
pub const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "ppm", "bmp", "pgm", "tif", "tiff", "webp",
];

pub struct ImageFolderDataset {
    root: PathBuf,
    classes: Vec<String>,
    class_to_idx: HashMap<String, usize>,
    /// Sorted by path.
    samples: Vec<(PathBuf, usize)>,
    pipeline: ImagePipeline,
}

impl ImageFolderDataset {
    pub fn new<P: AsRef<Path>>(root: P, pipeline: ImagePipeline) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(DataError::RootNotFound(root));
        }

        let mut classes = Vec::new();
        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                classes.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        if classes.is_empty() {
            return Err(DataError::NoClasses(root));
        }
        classes.sort();

        let class_to_idx: HashMap<String, usize> = classes
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.clone(), idx))
            .collect();

        let mut samples = Vec::new();
        for (idx, class) in classes.iter().enumerate() {
            let before = samples.len();
            collect_images(&root.join(class), idx, &mut samples)?;
            if samples.len() == before {
                return Err(DataError::EmptyClass {
                    class: class.clone(),
                    root,
                });
            }
        }
        samples.sort_by(|a, b| a.0.cmp(&b.0));

        info!(
            root = %root.display(),
            classes = classes.len(),
            samples = samples.len(),
            "Indexed image folder"
        );

        Ok(Self {
            root,
            classes,
            class_to_idx,
            samples,
            pipeline,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    pub fn class_to_idx(&self) -> &HashMap<String, usize> {
        &self.class_to_idx
    }

    pub fn image_path(&self, index: usize) -> Option<&Path> {
        self.samples.get(index).map(|(path, _)| path.as_path())
    }

    pub fn pipeline(&self) -> &ImagePipeline {
        &self.pipeline
    }

    fn sample(&self, index: usize) -> Result<&(PathBuf, usize)> {
        self.samples.get(index).ok_or(DataError::IndexOutOfBounds {
            index,
            len: self.samples.len(),
        })
    }
}

/// Recursively gathers image files below `dir`, all labelled `class_idx`.
fn collect_images(dir: &Path, class_idx: usize, out: &mut Vec<(PathBuf, usize)>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_images(&path, class_idx, out)?;
        } else if has_image_extension(&path) {
            out.push((path, class_idx));
        }
    }
    Ok(())
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

impl Dataset for ImageFolderDataset {
    type Item = ArrayD<f32>;
    type Label = usize;

    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> Result<(Self::Item, Self::Label)> {
        let (path, label) = self.sample(index)?;
        let image = image::open(path)
            .map_err(|source| DataError::Image {
                path: path.clone(),
                source,
            })?
            .to_rgb8();
        let tensor = self.pipeline.apply(&image)?;
        Ok((tensor, *label))
    }

    fn get_label(&self, index: usize) -> Result<Self::Label> {
        self.sample(index).map(|(_, label)| *label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::pipeline::PipelineKind;
    use image::RgbImage;

    fn write_png(path: &Path, w: u32, h: u32) {
        RgbImage::from_pixel(w, h, image::Rgb([10, 200, 30]))
            .save(path)
            .unwrap();
    }

    fn eval(size: usize) -> ImagePipeline {
        ImagePipeline::new(PipelineKind::Eval, size)
    }

    #[test]
    fn test_classes_from_sorted_subdirectories() {
        let tmp = tempfile::tempdir().unwrap();
        for class in ["zebra", "ant", "moose"] {
            fs::create_dir(tmp.path().join(class)).unwrap();
            write_png(&tmp.path().join(class).join("0.png"), 6, 4);
        }
        fs::write(tmp.path().join("ant").join("notes.txt"), "not an image").unwrap();
        fs::write(tmp.path().join("README"), "top-level file").unwrap();

        let dataset = ImageFolderDataset::new(tmp.path(), eval(8)).unwrap();
        assert_eq!(dataset.classes(), &["ant", "moose", "zebra"]);
        assert_eq!(dataset.class_to_idx()["zebra"], 2);
        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.get_label(0).unwrap(), 0);
        assert_eq!(dataset.get_label(2).unwrap(), 2);

        let (tensor, label) = dataset.get(1).unwrap();
        assert_eq!(label, 1);
        assert_eq!(tensor.shape(), &[3, 8, 8]);
    }

    #[test]
    fn test_extension_filter() {
        assert!(has_image_extension(Path::new("a/b.JPG")));
        assert!(has_image_extension(Path::new("x.webp")));
        assert!(has_image_extension(Path::new("scan.pgm")));
        assert!(!has_image_extension(Path::new("anim.gif")));
        assert!(!has_image_extension(Path::new("x.txt")));
        assert!(!has_image_extension(Path::new("noext")));
    }

    #[test]
    fn test_empty_class_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        for class in ["cat", "dog"] {
            fs::create_dir(tmp.path().join(class)).unwrap();
        }
        write_png(&tmp.path().join("cat").join("0.png"), 4, 4);
        // Файлы с чужими расширениями не считаются изображениями
        fs::write(tmp.path().join("dog").join("1.gif"), b"GIF89a").unwrap();

        match ImageFolderDataset::new(tmp.path(), eval(8)) {
            Err(DataError::EmptyClass { class, .. }) => assert_eq!(class, "dog"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(d) => panic!("built a dataset with {} samples", d.len()),
        }

        let all_empty = tempfile::tempdir().unwrap();
        fs::create_dir(all_empty.path().join("a")).unwrap();
        assert!(matches!(
            ImageFolderDataset::new(all_empty.path(), eval(8)),
            Err(DataError::EmptyClass { .. })
        ));
    }

    #[test]
    fn test_missing_root() {
        let tmp = tempfile::tempdir().unwrap();
        let result = ImageFolderDataset::new(tmp.path().join("nope"), eval(8));
        assert!(matches!(result, Err(DataError::RootNotFound(_))));
    }

    #[test]
    fn test_root_without_classes() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("stray.png"), b"x").unwrap();
        let result = ImageFolderDataset::new(tmp.path(), eval(8));
        assert!(matches!(result, Err(DataError::NoClasses(_))));
    }

    #[test]
    fn test_corrupt_image_propagates() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("cls")).unwrap();
        fs::write(tmp.path().join("cls").join("broken.png"), b"definitely not png").unwrap();

        let dataset = ImageFolderDataset::new(tmp.path(), eval(8)).unwrap();
        assert_eq!(dataset.len(), 1);
        assert!(matches!(dataset.get(0), Err(DataError::Image { .. })));
        assert!(matches!(
            dataset.get(1),
            Err(DataError::IndexOutOfBounds { index: 1, len: 1 })
        ));
    }
}
