use std::path::PathBuf;

use anyhow::Context;
use burn::backend::Autodiff;
use burn::module::AutodiffModule;
use burn::optim::AdamConfig;
use burn::tensor::backend::Backend;
use models::{build_regressor, load_regressor, save_module};
use score_dataset::{worker_pool, BatchIter, ScoreDataset, Split, TransformPipeline};

use crate::config::{validate_backend_choice, EvalArgs, TrainArgs, TrainConfig};
use crate::dump::dump_predictions;
use crate::train_loop::{train_model, LoopConfig, TrainReport};
use crate::TrainBackend;

type ADBackend = Autodiff<TrainBackend>;

#[derive(Debug)]
pub struct RunSummary {
    pub report: TrainReport,
    /// Saved model file (with the recorder's `.bin` extension).
    pub model_file: PathBuf,
    pub dumped: usize,
}

pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    let cfg = TrainConfig::from_args(&args)?;
    validate_backend_choice(cfg.backend)?;
    let summary = train_with_config(&cfg)?;
    log::info!(
        "saved {} (best val loss {:.4})",
        summary.model_file.display(),
        summary.report.best_val_loss
    );
    Ok(())
}

fn load_split(
    cfg: &TrainConfig,
    split: Split,
    pipeline: TransformPipeline,
) -> anyhow::Result<ScoreDataset> {
    let dataset = ScoreDataset::for_split(
        &cfg.data_root,
        &cfg.table_prefix,
        split,
        &cfg.image_dir(),
        cfg.columns,
        pipeline,
    )
    .with_context(|| format!("failed to load {split} table"))?;
    if dataset.is_empty() {
        anyhow::bail!(
            "{split} table {} has no rows",
            dataset.table().path().display()
        );
    }
    Ok(dataset)
}

/// Build datasets and model from `cfg`, train, save the best model and dump
/// validation predictions.
pub fn train_with_config(cfg: &TrainConfig) -> anyhow::Result<RunSummary> {
    cfg.validate()?;
    let device = <ADBackend as Backend>::Device::default();
    log::info!("device: {device:?} (backend {:?})", cfg.backend);
    if let Some(seed) = cfg.seed {
        ADBackend::seed(seed);
    }

    let train = load_split(cfg, Split::Train, cfg.pipeline.clone())?;
    let val = load_split(cfg, Split::Val, cfg.val_pipeline())?;
    log::info!("dataset sizes: train={} val={}", train.len(), val.len());
    log::info!("train transforms: {}", train.pipeline().describe());
    log::info!("val transforms: {}", val.pipeline().describe());

    let pool = worker_pool(cfg.workers)?;
    let train_batches = cfg.train_batches();
    let val_batches = cfg.val_batches();

    let mut preview_iter =
        BatchIter::new(&train, train_batches.clone(), u64::MAX / 2, pool.clone());
    if let Some(preview) = preview_iter.next_batch::<TrainBackend>(&device)? {
        log::info!(
            "first batch: images {:?} scores {:?}",
            preview.images.dims(),
            preview.scores.dims()
        );
    }

    let model =
        build_regressor::<ADBackend>(&cfg.resnet(), cfg.pretrained_weights(), &device)?;
    let mut optim = AdamConfig::new().init();

    let loop_cfg = LoopConfig {
        epochs: cfg.epochs,
        train_batches,
        val_batches: val_batches.clone(),
        scheduler: cfg.scheduler()?,
    };
    let (model, report) =
        train_model(model, &mut optim, &train, &val, &loop_cfg, pool.clone(), &device)?;

    std::fs::create_dir_all(&cfg.models_dir)
        .with_context(|| format!("failed to create {}", cfg.models_dir.display()))?;
    let model_path = cfg.model_path();
    let model = model.valid();
    save_module(model.clone(), &model_path)?;

    let dumped = dump_predictions(
        &model,
        &val,
        &val_batches,
        pool,
        &cfg.dump_path,
        cfg.dump_limit,
        &device,
    )?;

    Ok(RunSummary {
        report,
        model_file: model_path.with_extension("bin"),
        dumped,
    })
}

/// Load a saved model and append its validation predictions to the dump file.
pub fn run_eval(args: EvalArgs) -> anyhow::Result<usize> {
    let cfg = args.to_config()?;
    validate_backend_choice(cfg.backend)?;
    eval_with_config(&cfg)
}

pub fn eval_with_config(cfg: &TrainConfig) -> anyhow::Result<usize> {
    if cfg.batch_size == 0 {
        anyhow::bail!("batch_size must be at least 1");
    }
    let device = <TrainBackend as Backend>::Device::default();
    let val = load_split(cfg, Split::Val, cfg.val_pipeline())?;
    log::info!("val rows: {}", val.len());
    let model = load_regressor::<TrainBackend>(&cfg.resnet(), &cfg.model_path(), &device)?;
    let pool = worker_pool(cfg.workers)?;
    dump_predictions(
        &model,
        &val,
        &cfg.val_batches(),
        pool,
        &cfg.dump_path,
        cfg.dump_limit,
        &device,
    )
}
