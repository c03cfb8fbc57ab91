//! # Data Loading and Validation Module
//!
//! Reads delimited tables (comma separated, or tab separated for `.tsv` files)
//! with a header row and turns them into the `ndarray` matrices the solver
//! consumes. Target columns are chosen by name; every other column except the
//! optional `sample_id` is a feature. Failures are assumed to be user-input
//! errors, so every `DataError` names the offending column or row.

use csv::{ReaderBuilder, StringRecord, Trim, WriterBuilder};
use ndarray::{Array2, ArrayView2};
use std::path::Path;
use thiserror::Error;

pub const SAMPLE_ID_COLUMN: &str = "sample_id";
pub const MIN_TRAINING_ROWS: usize = 2;

/// Features and targets ready for fitting.
#[derive(Debug)]
pub struct TrainingData {
    /// Shape: [n_samples, n_features].
    pub x: Array2<f64>,
    /// Shape: [n_samples, n_targets].
    pub y: Array2<f64>,
    pub feature_names: Vec<String>,
    pub target_names: Vec<String>,
}

/// Features ready for prediction.
#[derive(Debug)]
pub struct PredictionData {
    pub x: Array2<f64>,
    /// Taken from the `sample_id` column when present, otherwise 1-based row numbers.
    pub sample_ids: Vec<String>,
}

/// A comprehensive error type for all data loading and validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the CSV reader: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error("Column '{column}' has the non-numeric value '{value}' on data row {row}.")]
    NonNumeric {
        column: String,
        row: usize,
        value: String,
    },
    #[error("Non-finite values (NaN or Infinity) were found in column '{0}'.")]
    NonFiniteValuesFound(String),
    #[error("Input file contains only {found} data rows, but at least {required} are required.")]
    InsufficientRows { found: usize, required: usize },
    #[error("No feature columns remain after removing the target and sample id columns.")]
    NoFeatureColumns,
}

struct Table {
    headers: Vec<String>,
    rows: Vec<StringRecord>,
}

fn delimiter_for(path: &Path) -> u8 {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("tsv") => b'\t',
        _ => b',',
    }
}

fn read_table(path: &Path) -> Result<Table, DataError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .delimiter(delimiter_for(path))
        .trim(Trim::All)
        .from_path(path)?;
    let headers = reader.headers()?.iter().map(str::to_string).collect();
    let rows = reader.records().collect::<Result<Vec<_>, _>>()?;
    Ok(Table { headers, rows })
}

impl Table {
    fn column_index(&self, name: &str) -> Result<usize, DataError> {
        self.headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| DataError::ColumnNotFound(name.to_string()))
    }

    /// Parses the given columns into an `n x columns.len()` matrix.
    fn numeric_matrix(&self, columns: &[usize]) -> Result<Array2<f64>, DataError> {
        let mut out = Array2::zeros((self.rows.len(), columns.len()));
        for (i, record) in self.rows.iter().enumerate() {
            for (j, &col) in columns.iter().enumerate() {
                let raw = record.get(col).unwrap_or("");
                let value: f64 = raw.parse().map_err(|_| DataError::NonNumeric {
                    column: self.headers[col].clone(),
                    row: i + 1,
                    value: raw.to_string(),
                })?;
                if !value.is_finite() {
                    return Err(DataError::NonFiniteValuesFound(self.headers[col].clone()));
                }
                out[[i, j]] = value;
            }
        }
        Ok(out)
    }
}

/// Loads training data; `target_columns` name the response columns.
pub fn load_training_data(
    path: &Path,
    target_columns: &[String],
) -> Result<TrainingData, DataError> {
    let table = read_table(path)?;
    if table.rows.len() < MIN_TRAINING_ROWS {
        return Err(DataError::InsufficientRows {
            found: table.rows.len(),
            required: MIN_TRAINING_ROWS,
        });
    }
    let target_idx = target_columns
        .iter()
        .map(|name| table.column_index(name))
        .collect::<Result<Vec<_>, _>>()?;
    let feature_idx: Vec<usize> = (0..table.headers.len())
        .filter(|i| !target_idx.contains(i) && table.headers[*i] != SAMPLE_ID_COLUMN)
        .collect();
    if feature_idx.is_empty() {
        return Err(DataError::NoFeatureColumns);
    }
    log::info!(
        "Loaded {} rows with {} features and {} targets from {}",
        table.rows.len(),
        feature_idx.len(),
        target_idx.len(),
        path.display()
    );
    Ok(TrainingData {
        x: table.numeric_matrix(&feature_idx)?,
        y: table.numeric_matrix(&target_idx)?,
        feature_names: feature_idx.iter().map(|&i| table.headers[i].clone()).collect(),
        target_names: target_columns.to_vec(),
    })
}

/// Loads prediction data with exactly the named feature columns, in that order.
/// With no names, every column except `sample_id` is a feature.
pub fn load_prediction_data(
    path: &Path,
    feature_names: &[String],
) -> Result<PredictionData, DataError> {
    let table = read_table(path)?;
    let feature_idx = if feature_names.is_empty() {
        (0..table.headers.len())
            .filter(|&i| table.headers[i] != SAMPLE_ID_COLUMN)
            .collect()
    } else {
        feature_names
            .iter()
            .map(|name| table.column_index(name))
            .collect::<Result<Vec<_>, _>>()?
    };
    if feature_idx.is_empty() {
        return Err(DataError::NoFeatureColumns);
    }
    let sample_ids = match table.column_index(SAMPLE_ID_COLUMN) {
        Ok(col) => table
            .rows
            .iter()
            .map(|r| r.get(col).unwrap_or("").to_string())
            .collect(),
        Err(_) => (1..=table.rows.len()).map(|i| i.to_string()).collect(),
    };
    Ok(PredictionData {
        x: table.numeric_matrix(&feature_idx)?,
        sample_ids,
    })
}

/// Writes one row per sample: the id followed by one column per target.
pub fn write_predictions(
    path: &Path,
    sample_ids: &[String],
    predictions: ArrayView2<f64>,
    target_names: &[String],
) -> Result<(), DataError> {
    let mut writer = WriterBuilder::new()
        .delimiter(delimiter_for(path))
        .from_path(path)?;
    let mut header = vec![SAMPLE_ID_COLUMN.to_string()];
    if target_names.len() == predictions.ncols() {
        header.extend(target_names.iter().map(|name| format!("{name}_pred")));
    } else {
        header.extend((0..predictions.ncols()).map(|t| format!("prediction_{t}")));
    }
    writer.write_record(&header)?;

    let mut buffer = ryu::Buffer::new();
    for (id, row) in sample_ids.iter().zip(predictions.rows()) {
        let mut record = vec![id.clone()];
        record.extend(row.iter().map(|&v| buffer.format(v).to_string()));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}
