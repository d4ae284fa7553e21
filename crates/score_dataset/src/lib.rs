//! Score tables, image transforms, and Burn-compatible batching for quality regression.
//!
//! This crate provides utilities for:
//! - Loading `(filename, score)` CSV tables per split
//! - Decoding images through a fixed-shape augmentation pipeline
//! - Shuffled, optionally parallel batch iteration into Burn tensors

pub mod aug;
pub mod batch;
pub mod table;
pub mod types;

pub use aug::{TransformPipeline, TransformPipelineBuilder};
pub use batch::{stack_samples, worker_pool, BatchConfig, BatchIter, ScoreBatch};
pub use table::{table_file_name, LabelTable, ScoreDataset};
pub use types::*;
