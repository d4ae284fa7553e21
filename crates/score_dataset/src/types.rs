//! Core types, error definitions, and data structures for score_dataset.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

pub type DatasetResult<T> = Result<T, ScoreDatasetError>;

#[derive(Debug, Error)]
pub enum ScoreDatasetError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv error at {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("malformed row {row} in {path}: {msg}")]
    Malformed {
        path: PathBuf,
        row: usize,
        msg: String,
    },
    #[error("row {index} out of range for table of {len} rows")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("image file not found for row {row}: {image}")]
    NotFound { row: usize, image: PathBuf },
    #[error("image decode error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("{0}")]
    Other(String),
}

impl ScoreDatasetError {
    /// True for errors caused by a single bad row or image (as opposed to table-level failures).
    pub fn is_sample_error(&self) -> bool {
        matches!(
            self,
            ScoreDatasetError::Malformed { .. }
                | ScoreDatasetError::NotFound { .. }
                | ScoreDatasetError::Image { .. }
        )
    }
}

/// One row of a label table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelRecord {
    /// Row position in the source table (the table's own index column is ignored).
    pub index: usize,
    pub image: String,
    pub score: f32,
}

/// Raw column positions inside a table row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableColumns {
    pub filename: usize,
    pub score: usize,
}

impl Default for TableColumns {
    fn default() -> Self {
        // Column 0 is the exported index column.
        Self {
            filename: 1,
            score: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScoreSample {
    pub index: usize,
    /// Image in CHW layout, values in [0, 1].
    pub image_chw: Vec<f32>,
    pub width: u32,
    pub height: u32,
    pub score: f32,
}

/// The two dataset splits read by the trainer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Split {
    Train,
    Val,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
        }
    }
}

impl std::fmt::Display for Split {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
