//! Batch iteration for training and validation.

use crate::table::ScoreDataset;
use crate::types::{DatasetResult, ScoreDatasetError, ScoreSample};
use burn::tensor::{backend::Backend, Tensor, TensorData};
use rand::{seq::SliceRandom, SeedableRng};
use rayon::prelude::*;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub batch_size: usize,
    /// Shuffle the index range at the start of every pass.
    pub shuffle: bool,
    /// Seed for reproducible shuffling and augmentation; mixed with the pass number.
    pub seed: Option<u64>,
    /// Worker threads used to load samples; 0 loads on the calling thread.
    pub num_workers: usize,
    /// Skip (and log) samples that fail to load instead of failing the batch.
    pub skip_unreadable: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            shuffle: true,
            seed: None,
            num_workers: 0,
            skip_unreadable: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScoreBatch<B: Backend> {
    /// Shape `[n, 3, H, W]`.
    pub images: Tensor<B, 4>,
    /// Shape `[n, 1]`.
    pub scores: Tensor<B, 2>,
    /// Host copy of the scores in batch order.
    pub score_values: Vec<f32>,
    /// Source row of every sample in batch order.
    pub indices: Vec<usize>,
}

impl<B: Backend> ScoreBatch<B> {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Builds a rayon pool for `num_workers` threads (None when loading inline).
pub fn worker_pool(num_workers: usize) -> DatasetResult<Option<Arc<rayon::ThreadPool>>> {
    if num_workers == 0 {
        return Ok(None);
    }
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_workers)
        .thread_name(|i| format!("score-loader-{i}"))
        .build()
        .map(|pool| Some(Arc::new(pool)))
        .map_err(|e| ScoreDatasetError::Other(format!("failed to build loader pool: {e}")))
}

/// One pass over a dataset in shuffled mini-batches.
pub struct BatchIter<'a> {
    dataset: &'a ScoreDataset,
    order: Vec<usize>,
    cursor: usize,
    cfg: BatchConfig,
    pass: u64,
    pool: Option<Arc<rayon::ThreadPool>>,
    processed_samples: usize,
    processed_batches: usize,
    skipped: usize,
    total_load_time: Duration,
}

impl<'a> BatchIter<'a> {
    pub fn new(
        dataset: &'a ScoreDataset,
        cfg: BatchConfig,
        pass: u64,
        pool: Option<Arc<rayon::ThreadPool>>,
    ) -> Self {
        let mut order: Vec<usize> = (0..dataset.len()).collect();
        if cfg.shuffle {
            let mut rng = match cfg.seed {
                Some(seed) => rand::rngs::StdRng::seed_from_u64(mix_seed(seed, pass, u64::MAX)),
                None => rand::rngs::StdRng::from_rng(&mut rand::rng()),
            };
            order.shuffle(&mut rng);
        }
        Self {
            dataset,
            order,
            cursor: 0,
            cfg,
            pass,
            pool,
            processed_samples: 0,
            processed_batches: 0,
            skipped: 0,
            total_load_time: Duration::ZERO,
        }
    }

    /// Index order of this pass.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    pub fn processed_samples(&self) -> usize {
        self.processed_samples
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn next_batch<B: Backend>(
        &mut self,
        device: &B::Device,
    ) -> DatasetResult<Option<ScoreBatch<B>>> {
        let batch_size = self.cfg.batch_size.max(1);
        loop {
            if self.cursor >= self.order.len() {
                if self.processed_batches > 0 {
                    log::debug!(
                        "pass {} done: batches={} samples={} skipped={} avg_load_ms={:.2}",
                        self.pass,
                        self.processed_batches,
                        self.processed_samples,
                        self.skipped,
                        self.total_load_time.as_secs_f64() * 1000.0 / self.processed_batches as f64
                    );
                }
                return Ok(None);
            }
            let end = (self.cursor + batch_size).min(self.order.len());
            let slice = &self.order[self.cursor..end];
            self.cursor = end;

            let t_load = Instant::now();
            let loaded = self.load(slice);
            self.total_load_time += t_load.elapsed();

            let mut samples = Vec::with_capacity(loaded.len());
            for res in loaded {
                match res {
                    Ok(sample) => samples.push(sample),
                    Err(e) if self.cfg.skip_unreadable && e.is_sample_error() => {
                        log::warn!("skipping sample: {e}");
                        self.skipped += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
            if samples.is_empty() {
                continue;
            }

            let batch = stack_samples::<B>(&samples, device)?;
            self.processed_samples += batch.len();
            self.processed_batches += 1;
            return Ok(Some(batch));
        }
    }

    fn load(&self, slice: &[usize]) -> Vec<DatasetResult<ScoreSample>> {
        let dataset = self.dataset;
        let seed = self.cfg.seed;
        let pass = self.pass;
        let load_one = |idx: usize| match seed {
            Some(seed) => {
                let mut rng = rand::rngs::StdRng::seed_from_u64(mix_seed(seed, pass, idx as u64));
                dataset.get_with_rng(idx, &mut rng)
            }
            None => dataset.get(idx),
        };
        match &self.pool {
            // Indexed parallel collect keeps batch order.
            Some(pool) => pool.install(|| slice.par_iter().map(|&idx| load_one(idx)).collect()),
            None => slice.iter().map(|&idx| load_one(idx)).collect(),
        }
    }
}

fn mix_seed(seed: u64, pass: u64, index: u64) -> u64 {
    seed ^ pass.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ index.rotate_left(17)
}

/// Stack samples of identical shape into a Burn batch.
pub fn stack_samples<B: Backend>(
    samples: &[ScoreSample],
    device: &B::Device,
) -> DatasetResult<ScoreBatch<B>> {
    let Some(first) = samples.first() else {
        return Err(ScoreDatasetError::Other("cannot stack an empty batch".to_string()));
    };
    let (width, height) = (first.width, first.height);
    let n = samples.len();
    let mut images_buf = Vec::with_capacity(n * first.image_chw.len());
    let mut score_values = Vec::with_capacity(n);
    let mut indices = Vec::with_capacity(n);
    for sample in samples {
        if (sample.width, sample.height) != (width, height) {
            return Err(ScoreDatasetError::Other(format!(
                "batch contains varying image sizes: row {} is {}x{}, expected {}x{}",
                sample.index, sample.width, sample.height, width, height
            )));
        }
        images_buf.extend_from_slice(&sample.image_chw);
        score_values.push(sample.score);
        indices.push(sample.index);
    }
    let images = Tensor::<B, 4>::from_data(
        TensorData::new(images_buf, [n, 3, height as usize, width as usize]),
        device,
    );
    let scores = Tensor::<B, 2>::from_data(TensorData::new(score_values.clone(), [n, 1]), device);
    Ok(ScoreBatch {
        images,
        scores,
        score_values,
        indices,
    })
}
