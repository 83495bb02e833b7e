// --- Файл: src/data/sampler.rs ---

//! Стратегии сэмплирования данных для DataLoader.

use crate::error::{DataError, Result};
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Трейт для сэмплеров - генераторов индексов.
pub trait Sampler: Iterator<Item = usize> {
    /// Возвращает общее количество образцов за эпоху.
    fn len(&self) -> usize;

    /// Проверяет, пуст ли сэмплер.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Сбрасывает сэмплер в начальное состояние (начало новой эпохи).
    fn reset(&mut self);
}

impl<S: Sampler + ?Sized> Sampler for &mut S {
    fn len(&self) -> usize {
        (**self).len()
    }

    fn reset(&mut self) {
        (**self).reset()
    }
}

fn shuffle_indices(indices: &mut [usize], seed: Option<u64>) {
    match seed {
        Some(s) => indices.shuffle(&mut rand::rngs::StdRng::seed_from_u64(s)),
        None => indices.shuffle(&mut rand::rng()),
    }
}

/// Последовательный сэмплер - возвращает индексы по порядку.
pub struct SequentialSampler {
    len: usize,
    current: usize,
}

impl SequentialSampler {
    /// Создает последовательный сэмплер для датасета заданного размера.
    pub fn new(len: usize) -> Self {
        Self { len, current: 0 }
    }
}

impl Iterator for SequentialSampler {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current < self.len {
            let idx = self.current;
            self.current += 1;
            Some(idx)
        } else {
            None
        }
    }
}

impl Sampler for SequentialSampler {
    fn len(&self) -> usize {
        self.len
    }

    fn reset(&mut self) {
        self.current = 0;
    }
}

/// Случайный сэмплер - возвращает индексы в случайном порядке.
///
/// С фиксированным seed порядок воспроизводим, но меняется от эпохи к эпохе.
pub struct RandomSampler {
    indices: Vec<usize>,
    current: usize,
    seed: Option<u64>,
    epoch: u64,
}

impl RandomSampler {
    /// Создает случайный сэмплер для датасета заданного размера.
    pub fn new(len: usize) -> Self {
        let mut sampler = Self {
            indices: (0..len).collect(),
            current: 0,
            seed: None,
            epoch: 0,
        };
        sampler.shuffle();
        sampler
    }

    /// Создает случайный сэмплер с фиксированным seed для воспроизводимости.
    pub fn with_seed(len: usize, seed: u64) -> Self {
        let mut sampler = Self {
            indices: (0..len).collect(),
            current: 0,
            seed: Some(seed),
            epoch: 0,
        };
        sampler.shuffle();
        sampler
    }

    fn shuffle(&mut self) {
        self.indices.sort_unstable();
        shuffle_indices(
            &mut self.indices,
            self.seed.map(|s| s.wrapping_add(self.epoch)),
        );
    }
}

impl Iterator for RandomSampler {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current < self.indices.len() {
            let idx = self.indices[self.current];
            self.current += 1;
            Some(idx)
        } else {
            None
        }
    }
}

impl Sampler for RandomSampler {
    fn len(&self) -> usize {
        self.indices.len()
    }

    fn reset(&mut self) {
        self.current = 0;
        self.epoch += 1;
        self.shuffle();
    }
}

/// Распределенный сэмплер - каждый процесс получает свою часть индексов.
///
/// Индексы перемешиваются одинаково на всех рангах (seed + epoch), дополняются
/// повтором начальных индексов до кратного `num_replicas` размера, после чего
/// ранг `r` берет каждый `num_replicas`-й индекс, начиная с `r`.
pub struct DistributedSampler {
    dataset_len: usize,
    num_replicas: usize,
    rank: usize,
    shuffle: bool,
    seed: u64,
    epoch: u64,
    indices: Vec<usize>,
    current: usize,
}

impl DistributedSampler {
    pub fn new(dataset_len: usize, num_replicas: usize, rank: usize) -> Result<Self> {
        if num_replicas == 0 || rank >= num_replicas {
            return Err(DataError::InvalidRank {
                rank,
                world_size: num_replicas,
            });
        }

        let mut sampler = Self {
            dataset_len,
            num_replicas,
            rank,
            shuffle: true,
            seed: 0,
            epoch: 0,
            indices: Vec::new(),
            current: 0,
        };
        sampler.rebuild();
        Ok(sampler)
    }

    /// Включает/выключает перемешивание (по умолчанию включено).
    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self.rebuild();
        self
    }

    /// Общий для всех рангов seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self.rebuild();
        self
    }

    /// Устанавливает эпоху; порядок зависит от `seed + epoch`.
    pub fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
        self.rebuild();
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn num_replicas(&self) -> usize {
        self.num_replicas
    }

    /// Количество образцов на один ранг: `ceil(len / num_replicas)`.
    pub fn samples_per_replica(&self) -> usize {
        self.dataset_len.div_ceil(self.num_replicas)
    }

    fn rebuild(&mut self) {
        let mut all: Vec<usize> = (0..self.dataset_len).collect();
        if self.shuffle {
            shuffle_indices(&mut all, Some(self.seed.wrapping_add(self.epoch)));
        }

        let total = self.samples_per_replica() * self.num_replicas;
        let mut padding = 0;
        while all.len() < total && !all.is_empty() {
            all.push(all[padding]);
            padding += 1;
        }

        self.indices = all
            .into_iter()
            .skip(self.rank)
            .step_by(self.num_replicas)
            .collect();
        self.current = 0;
    }
}

impl Iterator for DistributedSampler {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        let idx = *self.indices.get(self.current)?;
        self.current += 1;
        Some(idx)
    }
}

impl Sampler for DistributedSampler {
    fn len(&self) -> usize {
        self.indices.len()
    }

    fn reset(&mut self) {
        self.current = 0;
    }
}

/// Какой стратегией сэмплер выбирает индексы.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingStrategy {
    Sequential,
    Random,
    Distributed,
}

/// Сэмплер, выбранный во время выполнения.
pub enum AnySampler {
    Sequential(SequentialSampler),
    Random(RandomSampler),
    Distributed(DistributedSampler),
}

impl AnySampler {
    pub fn strategy(&self) -> SamplingStrategy {
        match self {
            AnySampler::Sequential(_) => SamplingStrategy::Sequential,
            AnySampler::Random(_) => SamplingStrategy::Random,
            AnySampler::Distributed(_) => SamplingStrategy::Distributed,
        }
    }

    /// Переходит к эпохе `epoch`. Для распределенного сэмплера меняет порядок.
    pub fn set_epoch(&mut self, epoch: u64) {
        if let AnySampler::Distributed(s) = self {
            s.set_epoch(epoch);
        }
    }
}

impl From<SequentialSampler> for AnySampler {
    fn from(s: SequentialSampler) -> Self {
        AnySampler::Sequential(s)
    }
}

impl From<RandomSampler> for AnySampler {
    fn from(s: RandomSampler) -> Self {
        AnySampler::Random(s)
    }
}

impl From<DistributedSampler> for AnySampler {
    fn from(s: DistributedSampler) -> Self {
        AnySampler::Distributed(s)
    }
}

impl Iterator for AnySampler {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            AnySampler::Sequential(s) => s.next(),
            AnySampler::Random(s) => s.next(),
            AnySampler::Distributed(s) => s.next(),
        }
    }
}

impl Sampler for AnySampler {
    fn len(&self) -> usize {
        match self {
            AnySampler::Sequential(s) => s.len(),
            AnySampler::Random(s) => s.len(),
            AnySampler::Distributed(s) => s.len(),
        }
    }

    fn reset(&mut self) {
        match self {
            AnySampler::Sequential(s) => s.reset(),
            AnySampler::Random(s) => s.reset(),
            AnySampler::Distributed(s) => s.reset(),
        }
    }
}

/// Батч-сэмплер - группирует индексы в батчи.
pub struct BatchSampler<S: Sampler> {
    sampler: S,
    batch_size: usize,
    drop_last: bool,
}

impl<S: Sampler> BatchSampler<S> {
    /// Создает батч-сэмплер.
    ///
    /// # Аргументы
    ///
    /// * `sampler` - Внутренний сэмплер для генерации индексов
    /// * `batch_size` - Размер батча
    /// * `drop_last` - Отбросить последний неполный батч
    pub fn new(sampler: S, batch_size: usize, drop_last: bool) -> Self {
        Self {
            sampler,
            batch_size,
            drop_last,
        }
    }

    /// Возвращает количество батчей.
    pub fn num_batches(&self) -> usize {
        num_batches(self.sampler.len(), self.batch_size, self.drop_last)
    }

    /// Сбрасывает сэмплер.
    pub fn reset(&mut self) {
        self.sampler.reset();
    }
}

/// Количество батчей для `n` образцов.
pub fn num_batches(n: usize, batch_size: usize, drop_last: bool) -> usize {
    if batch_size == 0 {
        return 0;
    }
    if drop_last {
        n / batch_size
    } else {
        n.div_ceil(batch_size)
    }
}

impl<S: Sampler> Iterator for BatchSampler<S> {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut batch = Vec::with_capacity(self.batch_size);

        for _ in 0..self.batch_size {
            if let Some(idx) = self.sampler.next() {
                batch.push(idx);
            } else {
                break;
            }
        }

        if batch.is_empty() {
            return None;
        }

        if batch.len() < self.batch_size && self.drop_last {
            return None;
        }

        Some(batch)
    }
}
