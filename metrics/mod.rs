//! Censored-survival evaluation metrics.
//!
//! Estimators follow the conventions of scikit-survival so scores are
//! comparable with published numbers: Harrell's and Uno's (IPCW) concordance,
//! the time-dependent Brier score and its integral, and the cumulative/dynamic
//! AUC. Every entry point validates its inputs and reports failures as
//! [`MetricError`] instead of panicking.

pub mod auc;
pub mod brier;
pub mod concordance;
pub mod engine;
pub mod kaplan_meier;
pub mod survival;

pub use auc::{CumulativeAuc, cumulative_dynamic_auc};
pub use brier::{BrierScores, brier_score, integrated_brier_score};
pub use concordance::{Concordance, TIED_TOL, concordance_index_censored, concordance_index_ipcw};
pub use engine::{
    EVALUATION_EPSILON, FilteredArrays, MetricInputs, MetricSummary, SurvivalMetrics,
    calculate_metrics, drop_nan_risk, evaluation_times,
};
pub use kaplan_meier::{KaplanMeier, kaplan_meier};
pub use survival::{SurvivalData, SurvivalRecord};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MetricError {
    #[error("Need a minimum of two samples, got {0}")]
    TooFewSamples(usize),
    #[error("all samples are censored")]
    AllCensored,
    #[error("Data has no comparable pairs, cannot estimate concordance index.")]
    NoComparablePairs,
    #[error("{what} has {found} entries, expected {expected}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("Input {0} contains NaN or infinity.")]
    NonFinite(&'static str),
    #[error("observed time contains values smaller zero")]
    NegativeTime,
    #[error("no samples to evaluate")]
    Empty,
    #[error("all times must be within follow-up time of test data: [{min}; {max}[")]
    TimesOutOfRange { min: f64, max: f64 },
    #[error("expected estimate with {expected} columns, but got {found}")]
    EstimateColumns { expected: usize, found: usize },
    #[error("time must be smaller than largest observed time point: {0}")]
    BeyondLastTime(f64),
    #[error("censoring survival function is zero at one or more time points")]
    ZeroCensoringSurvival,
    #[error("At least two time points must be given")]
    TooFewTimePoints,
    #[error("need at least 3 bin boundaries to choose evaluation times, got {0}")]
    TooFewBins(usize),
    #[error("could not convert the test outcomes: {0}")]
    SurvivalTest(Box<MetricError>),
}

/// Rejects any NaN or infinite entry.
pub(crate) fn ensure_finite<'a>(
    what: &'static str,
    values: impl IntoIterator<Item = &'a f64>,
) -> Result<(), MetricError> {
    if values.into_iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(MetricError::NonFinite(what))
    }
}

/// Trapezoidal integral of `y` over `x`.
pub(crate) fn trapezoid(y: &[f64], x: &[f64]) -> f64 {
    y.windows(2)
        .zip(x.windows(2))
        .map(|(y, x)| 0.5 * (y[0] + y[1]) * (x[1] - x[0]))
        .sum()
}
