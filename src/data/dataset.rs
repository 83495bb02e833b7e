// --- Файл: src/data/dataset.rs ---

//! Определение трейта Dataset и набора датасетов для классификации изображений.

use super::cifar::Cifar10Dataset;
use super::folder::ImageFolderDataset;
use super::pipeline::ImagePipeline;
use crate::error::Result;
use ndarray::ArrayD;

/// Трейт для источников данных.
///
/// Каждый датасет должен уметь:
/// - Возвращать количество элементов
/// - Возвращать элемент по индексу
pub trait Dataset: Send + Sync {
    /// Тип элемента данных (features)
    type Item;
    /// Тип метки (label)
    type Label;

    /// Возвращает количество элементов в датасете.
    fn len(&self) -> usize;

    /// Проверяет, пуст ли датасет.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Возвращает элемент и метку по индексу.
    ///
    /// Ошибки чтения и декодирования возвращаются вызывающему без изменений.
    fn get(&self, index: usize) -> Result<(Self::Item, Self::Label)>;

    /// Возвращает только метку по индексу.
    fn get_label(&self, index: usize) -> Result<Self::Label> {
        self.get(index).map(|(_, label)| label)
    }
}

/// Датасет изображений: либо CIFAR-10, либо папка с подпапками-классами.
pub enum ImageDataset {
    Cifar10(Cifar10Dataset),
    Folder(ImageFolderDataset),
}

impl ImageDataset {
    /// Пайплайн, который применяется к каждому образцу.
    pub fn pipeline(&self) -> &ImagePipeline {
        match self {
            ImageDataset::Cifar10(d) => d.pipeline(),
            ImageDataset::Folder(d) => d.pipeline(),
        }
    }

    pub fn num_classes(&self) -> usize {
        match self {
            ImageDataset::Cifar10(_) => Cifar10Dataset::NUM_CLASSES,
            ImageDataset::Folder(d) => d.num_classes(),
        }
    }
}

impl From<Cifar10Dataset> for ImageDataset {
    fn from(dataset: Cifar10Dataset) -> Self {
        ImageDataset::Cifar10(dataset)
    }
}

impl From<ImageFolderDataset> for ImageDataset {
    fn from(dataset: ImageFolderDataset) -> Self {
        ImageDataset::Folder(dataset)
    }
}

impl Dataset for ImageDataset {
    type Item = ArrayD<f32>;
    type Label = usize;

    fn len(&self) -> usize {
        match self {
            ImageDataset::Cifar10(d) => d.len(),
            ImageDataset::Folder(d) => d.len(),
        }
    }

    fn get(&self, index: usize) -> Result<(Self::Item, Self::Label)> {
        match self {
            ImageDataset::Cifar10(d) => d.get(index),
            ImageDataset::Folder(d) => d.get(index),
        }
    }

    fn get_label(&self, index: usize) -> Result<Self::Label> {
        match self {
            ImageDataset::Cifar10(d) => d.get_label(index),
            ImageDataset::Folder(d) => d.get_label(index),
        }
    }
}
