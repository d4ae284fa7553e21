use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use burn::tensor::backend::Backend;
use models::ScoreRegressor;
use score_dataset::{BatchConfig, BatchIter, ScoreDataset};

/// Append `predicted: <p> and score: <s>` lines for up to `limit` samples of
/// `dataset`. The file is created if missing and never truncated. Returns the
/// number of lines written.
pub fn dump_predictions<B: Backend, M: ScoreRegressor<B>>(
    model: &M,
    dataset: &ScoreDataset,
    batches: &BatchConfig,
    pool: Option<Arc<rayon::ThreadPool>>,
    path: &Path,
    limit: usize,
    device: &B::Device,
) -> anyhow::Result<usize> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open dump file {}", path.display()))?;
    let mut out = BufWriter::new(file);

    let mut written = 0usize;
    let mut iter = BatchIter::new(dataset, batches.clone(), 0, pool);
    while written < limit {
        let Some(batch) = iter.next_batch::<B>(device)? else {
            break;
        };
        let preds = model
            .predict(batch.images)
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| anyhow::anyhow!("failed to read predictions: {e:?}"))?;
        for (pred, score) in preds.iter().zip(&batch.score_values) {
            if written == limit {
                break;
            }
            writeln!(out, "predicted: {pred} and score: {score}")?;
            written += 1;
        }
    }
    out.flush()
        .with_context(|| format!("failed to write dump file {}", path.display()))?;
    log::info!("wrote {written} predictions to {}", path.display());
    Ok(written)
}
