//! Epoch loop: train, decay the learning rate, validate, keep the best parameters.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use burn::lr_scheduler::step::StepLrScheduler;
use burn::lr_scheduler::LrScheduler;
use burn::module::{AutodiffModule, Module};
use burn::optim::{GradientsParams, Optimizer};
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use models::ScoreRegressor;
use score_dataset::{BatchConfig, BatchIter, ScoreDataset};

use crate::metrics::RunningLoss;

#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub epochs: usize,
    pub train_batches: BatchConfig,
    pub val_batches: BatchConfig,
    /// Stepped once per epoch; the returned rate drives that epoch's optimiser steps.
    pub scheduler: StepLrScheduler,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpochStats {
    pub epoch: usize,
    pub train_loss: f32,
    pub val_loss: f32,
    /// Learning rate used for this epoch's optimiser steps.
    pub lr: f64,
    pub train_steps: usize,
    /// Sample count of every optimiser step, in order.
    pub train_batch_sizes: Vec<usize>,
    pub val_batches: usize,
    /// The best checkpoint was overwritten after this epoch.
    pub improved: bool,
}

#[derive(Debug, Clone)]
pub struct TrainReport {
    pub epochs: Vec<EpochStats>,
    /// `None` when no epoch improved on the initial parameters.
    pub best_epoch: Option<usize>,
    pub best_val_loss: f32,
    pub checkpoint_updates: usize,
    pub elapsed: Duration,
}

/// Mean absolute error between `[n, 1]` predictions and `[n, 1]` targets.
pub fn mae_loss<B: Backend>(preds: Tensor<B, 2>, targets: Tensor<B, 2>) -> Tensor<B, 1> {
    (preds - targets).abs().mean()
}

fn scalar<B: Backend>(t: Tensor<B, 1>) -> anyhow::Result<f32> {
    t.into_data()
        .to_vec::<f32>()
        .map_err(|e| anyhow::anyhow!("failed to read loss value: {e:?}"))?
        .first()
        .copied()
        .context("empty loss tensor")
}

/// Mean loss of `model` over one pass of `dataset`. Returns `(mean, batches)`.
pub fn evaluate_loss<B: Backend, M: ScoreRegressor<B>>(
    model: &M,
    dataset: &ScoreDataset,
    batches: &BatchConfig,
    pass: u64,
    pool: Option<Arc<rayon::ThreadPool>>,
    device: &B::Device,
) -> anyhow::Result<(f32, usize)> {
    let mut iter = BatchIter::new(dataset, batches.clone(), pass, pool);
    let mut running = RunningLoss::new();
    while let Some(batch) = iter.next_batch::<B>(device)? {
        let n = batch.len();
        let loss = mae_loss(model.predict(batch.images), batch.scores);
        running.push(scalar(loss)?, n);
    }
    let mean = running
        .mean()
        .context("validation pass produced no samples")?;
    Ok((mean, running.batches()))
}

/// Run the full epoch loop and return the parameters with the lowest validation loss.
///
/// The initial parameters are written to a scratch directory before the first
/// epoch; each strictly lower validation loss overwrites that snapshot, and the
/// snapshot is loaded back once all epochs are done. The scratch directory is
/// removed when this function returns, on success or error.
pub fn train_model<B, M, O>(
    mut model: M,
    optim: &mut O,
    train: &ScoreDataset,
    val: &ScoreDataset,
    cfg: &LoopConfig,
    pool: Option<Arc<rayon::ThreadPool>>,
    device: &B::Device,
) -> anyhow::Result<(M, TrainReport)>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + ScoreRegressor<B>,
    M::InnerModule: ScoreRegressor<B::InnerBackend>,
    O: Optimizer<M, B>,
{
    let scratch = tempfile::Builder::new()
        .prefix("score-train-")
        .tempdir()
        .context("failed to create scratch checkpoint dir")?;
    let best_path = scratch.path().join("best");
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    save_snapshot::<B, M>(&model, &best_path, &recorder)?;

    let start = Instant::now();
    let mut best_val_loss = f32::INFINITY;
    let mut best_epoch = None;
    let mut checkpoint_updates = 0;
    let mut epochs = Vec::with_capacity(cfg.epochs);
    let mut scheduler = cfg.scheduler.clone();

    for epoch in 0..cfg.epochs {
        log::info!("epoch {}/{}", epoch, cfg.epochs.saturating_sub(1));
        let lr = scheduler.step();

        let mut iter =
            BatchIter::new(train, cfg.train_batches.clone(), epoch as u64, pool.clone());
        let mut running = RunningLoss::new();
        let mut train_batch_sizes = Vec::new();
        while let Some(batch) = iter.next_batch::<B>(device)? {
            let n = batch.len();
            let loss = mae_loss(model.predict(batch.images), batch.scores);
            let loss_value = scalar(loss.clone().detach())?;
            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optim.step(lr, model, grads);
            running.push(loss_value, n);
            train_batch_sizes.push(n);
        }
        let train_loss = running
            .mean()
            .context("training pass produced no samples")?;
        let train_steps = running.batches();
        log::info!("train loss: {train_loss:.4} (lr {lr:.6}, steps {train_steps})");

        // Validation passes use a separate seed space from training passes.
        let (val_loss, val_batches) = evaluate_loss::<B::InnerBackend, _>(
            &model.valid(),
            val,
            &cfg.val_batches,
            u64::MAX - epoch as u64,
            pool.clone(),
            device,
        )?;
        log::info!("val loss: {val_loss:.4}");

        let improved = val_loss < best_val_loss;
        if improved {
            best_val_loss = val_loss;
            best_epoch = Some(epoch);
            checkpoint_updates += 1;
            save_snapshot::<B, M>(&model, &best_path, &recorder)?;
            log::info!("best validation loss so far; checkpoint updated");
        }

        epochs.push(EpochStats {
            epoch,
            train_loss,
            val_loss,
            lr,
            train_steps,
            train_batch_sizes,
            val_batches,
            improved,
        });
    }

    let elapsed = start.elapsed();
    log::info!(
        "training complete in {}m {}s",
        elapsed.as_secs() / 60,
        elapsed.as_secs() % 60
    );
    log::info!("best val loss: {best_val_loss:.4}");

    let model = model
        .load_file(&best_path, &recorder, device)
        .map_err(|e| anyhow::anyhow!("failed to restore best checkpoint: {e:?}"))?;

    Ok((
        model,
        TrainReport {
            epochs,
            best_epoch,
            best_val_loss,
            checkpoint_updates,
            elapsed,
        },
    ))
}

fn save_snapshot<B: Backend, M: Module<B>>(
    model: &M,
    path: &Path,
    recorder: &BinFileRecorder<FullPrecisionSettings>,
) -> anyhow::Result<()> {
    model
        .clone()
        .save_file(path, recorder)
        .map_err(|e| anyhow::anyhow!("failed to write checkpoint {}: {e:?}", path.display()))
}
