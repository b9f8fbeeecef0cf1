//! Tab-separated inputs for scoring predictions outside a training run.
//!
//! A predictions table carries one row per patient with `event_time`,
//! `censorship`, `risk` and the per-bin survival curve in columns whose names
//! start with `surv_` (kept in header order). Any other column, such as a
//! `case_id`, is ignored. A reference table carries `event_time` and
//! `censorship` for the cohort that defines the censoring distribution.

use crate::metrics::{MetricError, SurvivalData};
use ndarray::{Array1, Array2};
use polars::prelude::*;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// Prefix of the survival-curve columns in a predictions table.
pub const SURVIVAL_COLUMN_PREFIX: &str = "surv_";

#[derive(Debug, Error)]
pub enum TableError {
    #[error("Error from the underlying Polars library: {0}")]
    Polars(#[from] PolarsError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("The required column '{0}' was not found in the input file.")]
    ColumnNotFound(String),
    #[error("Missing or null values were found in the column '{0}'.")]
    MissingValues(String),
    #[error("no 'surv_*' columns were found in the predictions table")]
    NoSurvivalColumns,
    #[error("invalid survival outcomes: {0}")]
    Outcomes(#[from] MetricError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PredictionTable {
    pub event_time: Array1<f64>,
    pub censorship: Array1<f64>,
    pub risk: Array1<f64>,
    pub survival: Array2<f64>,
}

fn read_tsv(path: &Path) -> Result<DataFrame, TableError> {
    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
        )
        .finish()?;
    Ok(df)
}

fn f64_column(df: &DataFrame, name: &str) -> Result<Array1<f64>, TableError> {
    let column = df
        .column(name)
        .map_err(|_| TableError::ColumnNotFound(name.to_string()))?;
    let casted = column.cast(&DataType::Float64)?;
    let values = casted.f64()?;
    if values.null_count() > 0 {
        return Err(TableError::MissingValues(name.to_string()));
    }
    Ok(values.into_no_null_iter().collect())
}

pub fn load_predictions(path: &Path) -> Result<PredictionTable, TableError> {
    let df = read_tsv(path)?;
    let names: Vec<String> = df
        .get_column_names()
        .into_iter()
        .map(|name| name.as_str().to_string())
        .collect();

    let survival_columns: Vec<&String> = names
        .iter()
        .filter(|n| n.starts_with(SURVIVAL_COLUMN_PREFIX))
        .collect();
    if survival_columns.is_empty() {
        return Err(TableError::NoSurvivalColumns);
    }

    let mut survival = Array2::zeros((df.height(), survival_columns.len()));
    for (j, name) in survival_columns.into_iter().enumerate() {
        survival.column_mut(j).assign(&f64_column(&df, name)?);
    }

    Ok(PredictionTable {
        event_time: f64_column(&df, "event_time")?,
        censorship: f64_column(&df, "censorship")?,
        risk: f64_column(&df, "risk")?,
        survival,
    })
}

/// Outcomes of the reference cohort for censoring-weighted metrics.
pub fn load_reference(path: &Path) -> Result<SurvivalData, TableError> {
    let df = read_tsv(path)?;
    let event_time = f64_column(&df, "event_time")?;
    let censorship = f64_column(&df, "censorship")?;
    Ok(SurvivalData::from_censorship(
        censorship.view(),
        event_time.view(),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{Builder, NamedTempFile};

    fn write_tsv(content: &str) -> NamedTempFile {
        let mut file = Builder::new().suffix(".tsv").tempfile().expect("tempfile");
        file.write_all(content.as_bytes()).expect("write tsv");
        file
    }

    #[test]
    fn predictions_keep_survival_columns_in_header_order() {
        let file = write_tsv(
            "case_id\tevent_time\tcensorship\trisk\tsurv_0\tsurv_1\n\
             TCGA-AA-0001\t5.0\t0\t-1.2\t0.8\t0.4\n\
             TCGA-AA-0002\t9.5\t1\t-1.6\t0.9\t0.7\n",
        );
        let table = load_predictions(file.path()).expect("load predictions");
        assert_eq!(table.risk.to_vec(), vec![-1.2, -1.6]);
        assert_eq!(table.event_time.to_vec(), vec![5.0, 9.5]);
        assert_eq!(table.censorship.to_vec(), vec![0.0, 1.0]);
        assert_eq!(table.survival.shape(), &[2, 2]);
        assert_eq!(table.survival[[1, 1]], 0.7);
    }

    #[test]
    fn predictions_require_a_survival_curve() {
        let file = write_tsv("event_time\tcensorship\trisk\n1.0\t0\t0.5\n");
        assert!(matches!(
            load_predictions(file.path()),
            Err(TableError::NoSurvivalColumns)
        ));
    }

    #[test]
    fn reference_table_builds_outcomes() {
        let file = write_tsv("event_time\tcensorship\n3.0\t0\n4.0\t1\n");
        let reference = load_reference(file.path()).expect("reference");
        assert_eq!(reference.event().to_vec(), vec![true, false]);
    }

    #[test]
    fn missing_columns_are_named() {
        let file = write_tsv("event_time\n3.0\n");
        match load_reference(file.path()) {
            Err(TableError::ColumnNotFound(name)) => assert_eq!(name, "censorship"),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
