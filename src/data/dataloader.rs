// --- Файл: src/data/dataloader.rs ---

//! DataLoader - итератор по батчам данных с параллельной подгрузкой.

use super::dataset::Dataset;
use super::sampler::{AnySampler, BatchSampler, Sampler, SamplingStrategy};
use crate::error::{DataError, Result};
use ndarray::{ArrayD, ArrayViewD, Axis};
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, trace};

/// Сколько батчей на одного воркера может быть в работе одновременно.
pub const PREFETCH_FACTOR: usize = 2;

/// Батч данных - изображения и метки классов.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Изображения формы `[B, C, H, W]`
    pub images: ArrayD<f32>,
    /// Метки классов
    pub labels: Vec<usize>,
    /// Индексы образцов в этом батче
    pub indices: Vec<usize>,
}

impl Batch {
    /// Создает новый батч.
    pub fn new(images: ArrayD<f32>, labels: Vec<usize>, indices: Vec<usize>) -> Self {
        Self {
            images,
            labels,
            indices,
        }
    }

    /// Возвращает размер батча.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Проверяет, пуст ли батч.
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Читает образцы по индексам и складывает их в один батч.
fn collate<D>(dataset: &D, indices: Vec<usize>) -> Result<Batch>
where
    D: Dataset<Item = ArrayD<f32>, Label = usize> + ?Sized,
{
    let mut images = Vec::with_capacity(indices.len());
    let mut labels = Vec::with_capacity(indices.len());
    for &idx in &indices {
        let (image, label) = dataset.get(idx)?;
        images.push(image);
        labels.push(label);
    }

    let views: Vec<ArrayViewD<'_, f32>> = images.iter().map(|a| a.view()).collect();
    let stacked = ndarray::stack(Axis(0), &views)?;
    Ok(Batch::new(stacked, labels, indices))
}

/// DataLoader - удобный интерфейс для итерации по датасету батчами.
///
/// # Пример
///
/// ```rust,ignore
/// let mut loader = DataLoader::new(dataset, RandomSampler::new(n), 32)
///     .num_workers(4)
///     .pin_memory(true);
///
/// for batch in loader.iter()? {
///     let batch = batch?;
///     println!("Batch size: {}", batch.len());
/// }
/// ```
pub struct DataLoader<D: Dataset> {
    dataset: Arc<D>,
    sampler: AnySampler,
    batch_size: usize,
    drop_last: bool,
    num_workers: usize,
    pin_memory: bool,
}

impl<D> DataLoader<D>
where
    D: Dataset<Item = ArrayD<f32>, Label = usize> + 'static,
{
    /// Создает новый DataLoader без воркеров (чтение в вызывающем потоке).
    ///
    /// # Аргументы
    ///
    /// * `dataset` - Датасет для загрузки
    /// * `sampler` - Порядок обхода индексов
    /// * `batch_size` - Размер батча
    pub fn new(dataset: Arc<D>, sampler: impl Into<AnySampler>, batch_size: usize) -> Self {
        Self {
            dataset,
            sampler: sampler.into(),
            batch_size,
            drop_last: false,
            num_workers: 0,
            pin_memory: false,
        }
    }

    /// Устанавливает, нужно ли отбрасывать последний неполный батч.
    pub fn drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    /// Количество потоков-воркеров; 0 - чтение в вызывающем потоке.
    pub fn num_workers(mut self, num: usize) -> Self {
        self.num_workers = num;
        self
    }

    /// Флаг для кода, переносящего батчи на устройство.
    pub fn pin_memory(mut self, pin: bool) -> Self {
        self.pin_memory = pin;
        self
    }

    pub fn dataset(&self) -> &Arc<D> {
        &self.dataset
    }

    /// Возвращает размер батча.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn workers(&self) -> usize {
        self.num_workers
    }

    pub fn is_pin_memory(&self) -> bool {
        self.pin_memory
    }

    pub fn sampling_strategy(&self) -> SamplingStrategy {
        self.sampler.strategy()
    }

    /// Переходит к эпохе `epoch` (меняет порядок распределенного сэмплера).
    pub fn set_epoch(&mut self, epoch: u64) {
        self.sampler.set_epoch(epoch);
    }

    /// Количество образцов за эпоху на этом процессе.
    pub fn len(&self) -> usize {
        self.sampler.len()
    }

    /// Проверяет, пуст ли DataLoader.
    pub fn is_empty(&self) -> bool {
        self.sampler.is_empty()
    }

    /// Возвращает количество батчей.
    pub fn num_batches(&self) -> usize {
        super::sampler::num_batches(self.sampler.len(), self.batch_size, self.drop_last)
    }

    /// Начинает новую эпоху и возвращает итератор по ее батчам.
    pub fn iter(&mut self) -> Result<DataLoaderIter<D>> {
        if self.batch_size == 0 {
            return Err(DataError::Config("batch_size must be positive".into()));
        }
        self.sampler.reset();
        let batches: VecDeque<Vec<usize>> =
            BatchSampler::new(&mut self.sampler, self.batch_size, self.drop_last).collect();
        let total = batches.len();

        let pool = if self.num_workers > 0 && total > 0 {
            Some(WorkerPool::spawn(
                Arc::clone(&self.dataset),
                self.num_workers,
            )?)
        } else {
            None
        };

        let mut iter = DataLoaderIter {
            dataset: Arc::clone(&self.dataset),
            queued: batches,
            dispatched: 0,
            next_seq: 0,
            total,
            pool,
        };
        iter.fill_prefetch(self.num_workers * PREFETCH_FACTOR);
        Ok(iter)
    }
}

type Job = (usize, Vec<usize>);

struct WorkerPool {
    jobs: Option<mpsc::Sender<Job>>,
    results: mpsc::Receiver<(usize, Result<Batch>)>,
    reorder: HashMap<usize, Result<Batch>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    fn spawn<D>(dataset: Arc<D>, num_workers: usize) -> Result<Self>
    where
        D: Dataset<Item = ArrayD<f32>, Label = usize> + 'static,
    {
        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let (result_tx, result_rx) = mpsc::channel();
        let job_rx = Arc::new(Mutex::new(job_rx));

        let mut handles = Vec::with_capacity(num_workers);
        for worker_id in 0..num_workers {
            let dataset = Arc::clone(&dataset);
            let jobs = Arc::clone(&job_rx);
            let results = result_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("visionloader-worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, dataset, jobs, results))?;
            handles.push(handle);
        }
        debug!(num_workers, "Spawned loader workers");

        Ok(Self {
            jobs: Some(job_tx),
            results: result_rx,
            reorder: HashMap::new(),
            handles,
        })
    }

    fn submit(&self, job: Job) -> bool {
        match &self.jobs {
            Some(tx) => tx.send(job).is_ok(),
            None => false,
        }
    }

    /// Ждет батч с номером `seq`, складывая пришедшие раньше в буфер.
    fn wait_for(&mut self, seq: usize) -> Result<Batch> {
        loop {
            if let Some(result) = self.reorder.remove(&seq) {
                return result;
            }
            match self.results.recv() {
                Ok((done, result)) => {
                    self.reorder.insert(done, result);
                }
                Err(_) => return Err(DataError::WorkerDisconnected(seq)),
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Закрытие канала заданий завершает воркеров
        self.jobs.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        debug!("Loader workers stopped");
    }
}

fn worker_loop<D>(
    worker_id: usize,
    dataset: Arc<D>,
    jobs: Arc<Mutex<mpsc::Receiver<Job>>>,
    results: mpsc::Sender<(usize, Result<Batch>)>,
) where
    D: Dataset<Item = ArrayD<f32>, Label = usize>,
{
    loop {
        let job = match jobs.lock() {
            Ok(rx) => rx.recv(),
            Err(_) => break,
        };
        let Ok((seq, indices)) = job else { break };

        trace!(worker_id, seq, "Loading batch");
        let batch = panic::catch_unwind(AssertUnwindSafe(|| collate(&*dataset, indices)))
            .unwrap_or_else(|_| {
                error!(worker_id, seq, "Worker panicked while loading a batch");
                Err(DataError::WorkerPanicked(seq))
            });
        if results.send((seq, batch)).is_err() {
            break;
        }
    }
}

/// Итератор по батчам одной эпохи. Батчи приходят в порядке сэмплера.
pub struct DataLoaderIter<D: Dataset> {
    dataset: Arc<D>,
    queued: VecDeque<Vec<usize>>,
    dispatched: usize,
    next_seq: usize,
    total: usize,
    pool: Option<WorkerPool>,
}

impl<D> DataLoaderIter<D>
where
    D: Dataset<Item = ArrayD<f32>, Label = usize>,
{
    fn fill_prefetch(&mut self, window: usize) {
        let Some(pool) = &self.pool else { return };
        while self.dispatched < self.next_seq + window {
            let Some(indices) = self.queued.pop_front() else { break };
            if !pool.submit((self.dispatched, indices)) {
                break;
            }
            self.dispatched += 1;
        }
    }

    /// Сколько батчей осталось в эпохе.
    pub fn remaining(&self) -> usize {
        self.total - self.next_seq
    }
}

impl<D> Iterator for DataLoaderIter<D>
where
    D: Dataset<Item = ArrayD<f32>, Label = usize>,
{
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_seq >= self.total {
            return None;
        }
        let seq = self.next_seq;

        let result = match self.pool.as_mut() {
            Some(pool) => {
                let result = pool.wait_for(seq);
                let window = pool.handles.len() * PREFETCH_FACTOR;
                self.next_seq += 1;
                self.fill_prefetch(window);
                result
            }
            None => {
                self.next_seq += 1;
                match self.queued.pop_front() {
                    Some(indices) => collate(&*self.dataset, indices),
                    None => Err(DataError::WorkerDisconnected(seq)),
                }
            }
        };
        Some(result)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining();
        (remaining, Some(remaining))
    }
}
