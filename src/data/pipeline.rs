//! Fixed image pipelines used by the loaders.
//!
//! A pipeline converts a decoded RGB image to a `[3, size, size]` tensor,
//! runs its stages, and finishes with `Normalize(0.5, 0.5)` so every split
//! sees inputs in `[-1, 1]`.

use super::transforms::{
    to_tensor, ColorJitter, Compose, GaussianBlur, Normalize, RandomAdjustSharpness,
    RandomAffine, RandomApply, RandomAutocontrast, RandomChoice, RandomHorizontalFlip,
    RandomResizedCrop, RandomRotation, Resize, Transform,
};
use crate::config::DatasetKind;
use crate::error::Result;
use image::RgbImage;
use ndarray::ArrayD;

/// Area range for the random crop, as a fraction of the source image.
pub const CROP_SCALE: (f32, f32) = (0.05, 1.0);

/// Stages that only the augmented pipeline carries.
pub const AUGMENTATION_STAGES: &[&str] = &[
    "RandomHorizontalFlip",
    "RandomAffine",
    "RandomRotation",
    "RandomAdjustSharpness",
    "GaussianBlur",
    "RandomAutocontrast",
    "ColorJitter",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    TrainPlain,
    TrainAugmented,
    Eval,
}

impl PipelineKind {
    /// Train pipeline for a dataset branch. CIFAR-10 never augments.
    pub fn for_train(dataset: DatasetKind, augmentation: bool) -> Self {
        match (dataset, augmentation) {
            (DatasetKind::ImageFolder, true) => PipelineKind::TrainAugmented,
            (DatasetKind::ImageFolder, false) | (DatasetKind::Cifar10, _) => {
                PipelineKind::TrainPlain
            }
        }
    }
}

pub struct ImagePipeline {
    kind: PipelineKind,
    img_size: usize,
    stages: Compose,
}

impl ImagePipeline {
    pub fn new(kind: PipelineKind, img_size: usize) -> Self {
        let stages = match kind {
            PipelineKind::TrainPlain => Compose::new().add(random_crop(img_size)),
            PipelineKind::TrainAugmented => augmented_stages(img_size),
            PipelineKind::Eval => Compose::new().add(Resize::square(img_size)),
        }
        .add(Normalize::from_scalars(0.5, 0.5));

        Self {
            kind,
            img_size,
            stages,
        }
    }

    pub fn kind(&self) -> PipelineKind {
        self.kind
    }

    pub fn img_size(&self) -> usize {
        self.img_size
    }

    /// Stage names in application order, with `ToTensor` first.
    pub fn stage_names(&self) -> Vec<&'static str> {
        let mut names = vec!["ToTensor"];
        names.extend(self.stages.stage_names());
        names
    }

    pub fn is_augmented(&self) -> bool {
        self.stage_names()
            .iter()
            .any(|name| AUGMENTATION_STAGES.contains(name))
    }

    pub fn apply(&self, image: &RgbImage) -> Result<ArrayD<f32>> {
        self.stages.apply(to_tensor(image))
    }
}

fn random_crop(img_size: usize) -> RandomResizedCrop {
    RandomResizedCrop::new(img_size, img_size, CROP_SCALE)
}

fn augmented_stages(img_size: usize) -> Compose {
    Compose::new()
        .add(random_crop(img_size))
        .add(RandomHorizontalFlip::new(0.2))
        .add(RandomApply::new(
            RandomChoice::new(vec![
                Box::new(RandomAffine::new(20.0, (0.1, 0.3), (0.05, 0.75))),
                Box::new(RandomRotation::new(50.0)),
            ]),
            0.2,
        ))
        .add(RandomApply::new(RandomAdjustSharpness::new(2.0, 0.5), 0.1))
        .add(RandomApply::new(GaussianBlur::new((3, 5), (0.1, 5.0)), 0.1))
        .add(RandomApply::new(
            RandomChoice::new(vec![
                Box::new(RandomAutocontrast::new(0.5)),
                Box::new(ColorJitter::new(0.5, 0.3)),
            ]),
            0.2,
        ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| image::Rgb([(x * 7) as u8, (y * 5) as u8, 128]))
    }

    #[test]
    fn test_train_kind_selection() {
        assert_eq!(
            PipelineKind::for_train(DatasetKind::ImageFolder, true),
            PipelineKind::TrainAugmented
        );
        assert_eq!(
            PipelineKind::for_train(DatasetKind::ImageFolder, false),
            PipelineKind::TrainPlain
        );
        assert_eq!(
            PipelineKind::for_train(DatasetKind::Cifar10, true),
            PipelineKind::TrainPlain
        );
    }

    #[test]
    fn test_stage_lists() {
        let plain = ImagePipeline::new(PipelineKind::TrainPlain, 32);
        assert_eq!(plain.stage_names(), vec!["ToTensor", "RandomResizedCrop", "Normalize"]);
        assert!(!plain.is_augmented());

        let eval = ImagePipeline::new(PipelineKind::Eval, 32);
        assert_eq!(eval.stage_names(), vec!["ToTensor", "Resize", "Normalize"]);
        assert!(!eval.is_augmented());

        let aug = ImagePipeline::new(PipelineKind::TrainAugmented, 32);
        let names = aug.stage_names();
        assert!(aug.is_augmented());
        for stage in AUGMENTATION_STAGES {
            assert!(names.contains(stage), "missing {stage}");
        }
        assert_eq!(names.last(), Some(&"Normalize"));
    }

    #[test]
    fn test_every_pipeline_outputs_square_tensor() {
        let image = gradient(37, 21);
        for kind in [PipelineKind::TrainPlain, PipelineKind::TrainAugmented, PipelineKind::Eval] {
            let pipeline = ImagePipeline::new(kind, 24);
            for _ in 0..10 {
                let tensor = pipeline.apply(&image).unwrap();
                assert_eq!(tensor.shape(), &[3, 24, 24], "{kind:?}");
            }
        }
    }

    #[test]
    fn test_eval_output_is_normalized() {
        let image = RgbImage::from_pixel(8, 8, image::Rgb([255, 0, 255]));
        let tensor = ImagePipeline::new(PipelineKind::Eval, 4).apply(&image).unwrap();
        assert!((tensor[[0, 0, 0]] - 1.0).abs() < 1e-6);
        assert!((tensor[[1, 3, 3]] + 1.0).abs() < 1e-6);
    }
}
