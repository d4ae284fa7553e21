//! Label tables (CSV) and the dataset adapter that turns rows into samples.

use crate::aug::TransformPipeline;
use crate::types::{DatasetResult, LabelRecord, ScoreDatasetError, ScoreSample, Split, TableColumns};
use csv::StringRecord;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Table file name for a split, e.g. `koniq_image_score_table_train.csv`.
pub fn table_file_name(prefix: &str, split: Split) -> String {
    format!("{prefix}_image_score_table_{}.csv", split.as_str())
}

/// An immutable CSV table mapping image filenames to scores.
///
/// Rows are kept raw; columns are checked when a row is accessed, so a short row
/// only fails the step that reads it.
#[derive(Debug, Clone)]
pub struct LabelTable {
    path: PathBuf,
    columns: TableColumns,
    rows: Vec<StringRecord>,
}

impl LabelTable {
    pub fn from_path(path: &Path, columns: TableColumns) -> DatasetResult<Self> {
        let file = File::open(path).map_err(|e| ScoreDatasetError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(file);
        let mut rows = Vec::new();
        for row in reader.records() {
            let row = row.map_err(|e| ScoreDatasetError::Csv {
                path: path.to_path_buf(),
                source: e,
            })?;
            rows.push(row);
        }
        log::debug!("loaded {} rows from {}", rows.len(), path.display());
        Ok(Self {
            path: path.to_path_buf(),
            columns,
            rows,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn record(&self, index: usize) -> DatasetResult<LabelRecord> {
        let row = self
            .rows
            .get(index)
            .ok_or(ScoreDatasetError::IndexOutOfRange {
                index,
                len: self.rows.len(),
            })?;
        let TableColumns { filename, score } = self.columns;
        let image = row
            .get(filename)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| self.malformed(index, format!("missing filename column {filename}")))?;
        let raw_score = row
            .get(score)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| self.malformed(index, format!("missing score column {score}")))?;
        let score = raw_score.parse::<f32>().map_err(|e| {
            self.malformed(index, format!("score {raw_score:?} is not a number: {e}"))
        })?;
        Ok(LabelRecord {
            index,
            image: image.to_string(),
            score,
        })
    }

    fn malformed(&self, row: usize, msg: String) -> ScoreDatasetError {
        ScoreDatasetError::Malformed {
            path: self.path.clone(),
            row,
            msg,
        }
    }
}

/// Random access to `(image, score)` samples for one split.
#[derive(Debug, Clone)]
pub struct ScoreDataset {
    table: LabelTable,
    image_dir: PathBuf,
    pipeline: TransformPipeline,
}

impl ScoreDataset {
    pub fn new(
        table: LabelTable,
        image_dir: impl Into<PathBuf>,
        pipeline: TransformPipeline,
    ) -> Self {
        Self {
            table,
            image_dir: image_dir.into(),
            pipeline,
        }
    }

    /// Load `<data_root>/<prefix>_image_score_table_<split>.csv`.
    pub fn for_split(
        data_root: &Path,
        prefix: &str,
        split: Split,
        image_dir: &Path,
        columns: TableColumns,
        pipeline: TransformPipeline,
    ) -> DatasetResult<Self> {
        let table_path = data_root.join(table_file_name(prefix, split));
        let table = LabelTable::from_path(&table_path, columns)?;
        Ok(Self::new(table, image_dir, pipeline))
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn table(&self) -> &LabelTable {
        &self.table
    }

    pub fn pipeline(&self) -> &TransformPipeline {
        &self.pipeline
    }

    pub fn image_path(&self, record: &LabelRecord) -> PathBuf {
        self.image_dir.join(&record.image)
    }

    /// Load and transform row `index` with a fresh thread-local RNG.
    pub fn get(&self, index: usize) -> DatasetResult<ScoreSample> {
        let mut rng = rand::rng();
        self.get_with_rng(index, &mut rng)
    }

    pub fn get_with_rng(
        &self,
        index: usize,
        rng: &mut dyn rand::RngCore,
    ) -> DatasetResult<ScoreSample> {
        let record = self.table.record(index)?;
        let path = self.image_path(&record);
        if !path.exists() {
            return Err(ScoreDatasetError::NotFound {
                row: index,
                image: path,
            });
        }
        let img = image::open(&path).map_err(|e| ScoreDatasetError::Image {
            path: path.clone(),
            source: e,
        })?;
        let (image_chw, width, height) = self.pipeline.apply(img, rng);
        Ok(ScoreSample {
            index,
            image_chw,
            width,
            height,
            score: record.score,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_table(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join("t_image_score_table_train.csv");
        let mut f = File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn records_follow_row_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_table(dir.path(), ",image,score\n7,a.png,1.5\n3,b.png,2\n");
        let table = LabelTable::from_path(&path, TableColumns::default()).unwrap();
        assert_eq!(table.len(), 2);
        let first = table.record(0).unwrap();
        assert_eq!(first.index, 0);
        assert_eq!(first.image, "a.png");
        assert_eq!(first.score, 1.5);
        assert_eq!(table.record(1).unwrap().image, "b.png");
    }

    #[test]
    fn short_row_is_malformed_on_access() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_table(dir.path(), ",image,score\n0,a.png,1.0\n1,b.png\n");
        let table = LabelTable::from_path(&path, TableColumns::default()).unwrap();
        assert_eq!(table.len(), 2);
        assert!(table.record(0).is_ok());
        assert!(matches!(
            table.record(1),
            Err(ScoreDatasetError::Malformed { row: 1, .. })
        ));
    }

    #[test]
    fn non_numeric_score_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_table(dir.path(), ",image,score\n0,a.png,high\n");
        let table = LabelTable::from_path(&path, TableColumns::default()).unwrap();
        assert!(matches!(table.record(0), Err(ScoreDatasetError::Malformed { .. })));
    }

    #[test]
    fn custom_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_table(dir.path(), ",id,image,score\n0,x,a.png,4.25\n");
        let cols = TableColumns {
            filename: 2,
            score: 3,
        };
        let table = LabelTable::from_path(&path, cols).unwrap();
        let rec = table.record(0).unwrap();
        assert_eq!(rec.image, "a.png");
        assert_eq!(rec.score, 4.25);
    }

    #[test]
    fn out_of_range_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_table(dir.path(), ",image,score\n");
        let table = LabelTable::from_path(&path, TableColumns::default()).unwrap();
        assert!(table.is_empty());
        assert!(matches!(
            table.record(0),
            Err(ScoreDatasetError::IndexOutOfRange { index: 0, len: 0 })
        ));
    }

    #[test]
    fn table_names() {
        assert_eq!(
            table_file_name("koniq", Split::Val),
            "koniq_image_score_table_val.csv"
        );
    }
}
