//! Integration tests for table → dataset → batch workflows.

use burn_ndarray::NdArray;
use image::{Rgb, RgbImage};
use score_dataset::{
    BatchConfig, BatchIter, LabelTable, ScoreDataset, ScoreDatasetError, Split, TableColumns,
    TransformPipelineBuilder,
};
use std::fs;
use std::path::{Path, PathBuf};

type B = NdArray<f32>;

/// Write `images/img_<i>.png` (varying sizes) and a train table with `rows` rows.
fn create_synthetic_split(root: &Path, rows: usize) -> anyhow::Result<PathBuf> {
    let images = root.join("images");
    fs::create_dir_all(&images)?;
    let mut csv = String::from(",image,score\n");
    for i in 0..rows {
        let name = format!("img_{i}.png");
        let mut img = RgbImage::new(10 + i as u32 * 3, 8 + i as u32);
        for pixel in img.pixels_mut() {
            *pixel = Rgb([(i * 40) as u8, 128, 200]);
        }
        img.save(images.join(&name))?;
        csv.push_str(&format!("{},{},{}\n", i + 100, name, i as f32 + 0.5));
    }
    let table = root.join(score_dataset::table_file_name("syn", Split::Train));
    fs::write(&table, csv)?;
    Ok(table)
}

fn small_pipeline() -> score_dataset::TransformPipeline {
    TransformPipelineBuilder::new()
        .resize((12, 12))
        .crop((8, 8))
        .build()
}

#[test]
fn every_row_yields_fixed_shape_and_its_score() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    create_synthetic_split(tmp.path(), 4)?;
    let dataset = ScoreDataset::for_split(
        tmp.path(),
        "syn",
        Split::Train,
        &tmp.path().join("images"),
        TableColumns::default(),
        small_pipeline(),
    )?;
    assert_eq!(dataset.len(), 4);
    for i in 0..dataset.len() {
        let sample = dataset.get(i)?;
        assert_eq!(sample.index, i);
        assert_eq!((sample.width, sample.height), (8, 8));
        assert_eq!(sample.image_chw.len(), 3 * 8 * 8);
        assert_eq!(sample.score, i as f32 + 0.5);
    }
    Ok(())
}

#[test]
fn missing_image_is_not_found() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let table = create_synthetic_split(tmp.path(), 2)?;
    fs::remove_file(tmp.path().join("images/img_1.png"))?;
    let dataset = ScoreDataset::new(
        LabelTable::from_path(&table, TableColumns::default())?,
        tmp.path().join("images"),
        small_pipeline(),
    );
    assert!(dataset.get(0).is_ok());
    assert!(matches!(
        dataset.get(1),
        Err(ScoreDatasetError::NotFound { row: 1, .. })
    ));
    Ok(())
}

#[test]
fn missing_table_is_io_error() {
    let tmp = tempfile::tempdir().unwrap();
    let res = LabelTable::from_path(&tmp.path().join("nope.csv"), TableColumns::default());
    assert!(matches!(res, Err(ScoreDatasetError::Io { .. })));
}

#[test]
fn batches_cover_every_row_once_with_short_tail() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    create_synthetic_split(tmp.path(), 5)?;
    let dataset = ScoreDataset::for_split(
        tmp.path(),
        "syn",
        Split::Train,
        &tmp.path().join("images"),
        TableColumns::default(),
        small_pipeline(),
    )?;
    let device = Default::default();
    let cfg = BatchConfig {
        batch_size: 2,
        seed: Some(3),
        ..Default::default()
    };
    let mut iter = BatchIter::new(&dataset, cfg, 0, None);
    let mut sizes = Vec::new();
    let mut seen = Vec::new();
    while let Some(batch) = iter.next_batch::<B>(&device)? {
        assert_eq!(&batch.images.dims()[1..], &[3, 8, 8]);
        assert_eq!(batch.scores.dims(), [batch.len(), 1]);
        for (idx, score) in batch.indices.iter().zip(batch.score_values.iter()) {
            assert_eq!(*score, *idx as f32 + 0.5);
        }
        sizes.push(batch.len());
        seen.extend(batch.indices.clone());
    }
    assert_eq!(sizes, vec![2, 2, 1]);
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    Ok(())
}

#[test]
fn seeded_shuffle_is_reproducible_per_pass() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    create_synthetic_split(tmp.path(), 6)?;
    let dataset = ScoreDataset::for_split(
        tmp.path(),
        "syn",
        Split::Train,
        &tmp.path().join("images"),
        TableColumns::default(),
        small_pipeline(),
    )?;
    let cfg = BatchConfig {
        batch_size: 4,
        seed: Some(11),
        ..Default::default()
    };
    let a = BatchIter::new(&dataset, cfg.clone(), 2, None);
    let b = BatchIter::new(&dataset, cfg, 2, None);
    assert_eq!(a.order(), b.order());
    Ok(())
}

#[test]
fn parallel_workers_keep_batch_contents() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    create_synthetic_split(tmp.path(), 5)?;
    let dataset = ScoreDataset::for_split(
        tmp.path(),
        "syn",
        Split::Train,
        &tmp.path().join("images"),
        TableColumns::default(),
        small_pipeline().deterministic(),
    )?;
    let device = Default::default();
    let cfg = BatchConfig {
        batch_size: 3,
        seed: Some(5),
        num_workers: 2,
        ..Default::default()
    };
    let pool = score_dataset::worker_pool(2)?;
    let mut parallel = BatchIter::new(&dataset, cfg.clone(), 0, pool);
    let mut inline = BatchIter::new(&dataset, BatchConfig { num_workers: 0, ..cfg }, 0, None);
    while let Some(p) = parallel.next_batch::<B>(&device)? {
        let s = inline
            .next_batch::<B>(&device)?
            .expect("same number of batches");
        assert_eq!(p.indices, s.indices);
        let pd = p.images.into_data().to_vec::<f32>().unwrap();
        let sd = s.images.into_data().to_vec::<f32>().unwrap();
        assert_eq!(pd, sd);
    }
    assert!(inline.next_batch::<B>(&device)?.is_none());
    Ok(())
}

#[test]
fn unreadable_rows_fail_fast_or_skip() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    create_synthetic_split(tmp.path(), 3)?;
    fs::remove_file(tmp.path().join("images/img_2.png"))?;
    let dataset = ScoreDataset::for_split(
        tmp.path(),
        "syn",
        Split::Train,
        &tmp.path().join("images"),
        TableColumns::default(),
        small_pipeline(),
    )?;
    let device = Default::default();

    let strict = BatchConfig {
        batch_size: 3,
        shuffle: false,
        ..Default::default()
    };
    let mut iter = BatchIter::new(&dataset, strict.clone(), 0, None);
    assert!(matches!(
        iter.next_batch::<B>(&device),
        Err(ScoreDatasetError::NotFound { row: 2, .. })
    ));

    let lenient = BatchConfig {
        skip_unreadable: true,
        ..strict
    };
    let mut iter = BatchIter::new(&dataset, lenient, 0, None);
    let batch = iter.next_batch::<B>(&device)?.expect("two readable rows");
    assert_eq!(batch.indices, vec![0, 1]);
    assert_eq!(iter.skipped(), 1);
    assert!(iter.next_batch::<B>(&device)?.is_none());
    Ok(())
}
