//! Guarded computation of the full validation metric suite.
//!
//! Every metric is computed independently. A failing metric is logged and
//! reported as an error value; it never prevents the others from running.

use super::auc::cumulative_dynamic_auc;
use super::brier::{brier_score, integrated_brier_score};
use super::concordance::{concordance_index_censored, concordance_index_ipcw};
use super::survival::{SurvivalData, event_indicator};
use super::{MetricError, ensure_finite};
use log::{debug, warn};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};

/// Offset that pulls the outermost evaluation times inside the follow-up window.
pub const EVALUATION_EPSILON: f64 = 1e-4;

/// Number of evaluation times produced by [`evaluation_times`].
pub const EVALUATION_TIME_COUNT: usize = 4;

/// `[min + eps, bins[1], bins[2], max - eps]` over the evaluated dataset's
/// event times. Downstream estimators sort and deduplicate.
pub fn evaluation_times(
    event_times: ArrayView1<'_, f64>,
    bins: &[f64],
) -> Result<Vec<f64>, MetricError> {
    if bins.len() < 3 {
        return Err(MetricError::TooFewBins(bins.len()));
    }
    if event_times.is_empty() {
        return Err(MetricError::Empty);
    }
    ensure_finite("event_time", event_times.iter())?;
    let min = event_times.fold(f64::INFINITY, |acc, &t| acc.min(t));
    let max = event_times.fold(f64::NEG_INFINITY, |acc, &t| acc.max(t));
    Ok(vec![
        min + EVALUATION_EPSILON,
        bins[1],
        bins[2],
        max - EVALUATION_EPSILON,
    ])
}

/// Arrays left after dropping samples with a NaN risk.
#[derive(Debug, Clone, PartialEq)]
pub struct FilteredArrays {
    pub risk: Array1<f64>,
    pub censorship: Array1<f64>,
    pub event_time: Array1<f64>,
    pub survival: Array2<f64>,
}

/// Removes every sample whose risk is NaN from all four arrays at once.
pub fn drop_nan_risk(
    risk: ArrayView1<'_, f64>,
    censorship: ArrayView1<'_, f64>,
    event_time: ArrayView1<'_, f64>,
    survival: ArrayView2<'_, f64>,
) -> Result<FilteredArrays, MetricError> {
    let n = risk.len();
    for (what, found) in [
        ("censorship", censorship.len()),
        ("event_time", event_time.len()),
        ("survival curve", survival.nrows()),
    ] {
        if found != n {
            return Err(MetricError::LengthMismatch {
                what,
                expected: n,
                found,
            });
        }
    }
    let keep: Vec<usize> = (0..n).filter(|&i| !risk[i].is_nan()).collect();
    Ok(FilteredArrays {
        risk: risk.select(Axis(0), &keep),
        censorship: censorship.select(Axis(0), &keep),
        event_time: event_time.select(Axis(0), &keep),
        survival: survival.select(Axis(0), &keep),
    })
}

/// Everything the metric suite reads for one evaluation pass.
#[derive(Debug, Clone, Copy)]
pub struct MetricInputs<'a> {
    /// Censoring reference: the training (plus validation) outcomes.
    pub survival_train: &'a SurvivalData,
    pub risk: ArrayView1<'a, f64>,
    pub censorship: ArrayView1<'a, f64>,
    pub event_time: ArrayView1<'a, f64>,
    /// Per-bin survival curves, one row per sample.
    pub survival: ArrayView2<'a, f64>,
    /// Event times of the whole evaluated dataset, before NaN filtering.
    pub dataset_event_times: ArrayView1<'a, f64>,
    /// Discretization boundaries of the dataset.
    pub bins: &'a [f64],
}

#[derive(Debug, Clone, PartialEq)]
pub struct SurvivalMetrics {
    pub c_index: Result<f64, MetricError>,
    pub c_index_ipcw: Result<f64, MetricError>,
    pub brier: Result<Array1<f64>, MetricError>,
    pub integrated_brier: Result<f64, MetricError>,
    pub auc: Result<f64, MetricError>,
}

/// Metric values with failures replaced by zeros.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSummary {
    pub c_index: f64,
    pub c_index_ipcw: f64,
    pub brier: Array1<f64>,
    pub integrated_brier: f64,
    pub auc: f64,
}

impl SurvivalMetrics {
    fn all_failed(err: MetricError) -> Self {
        Self {
            c_index: Err(err.clone()),
            c_index_ipcw: Err(err.clone()),
            brier: Err(err.clone()),
            integrated_brier: Err(err.clone()),
            auc: Err(err),
        }
    }

    pub fn summary(&self) -> MetricSummary {
        MetricSummary {
            c_index: self.c_index.clone().unwrap_or(0.0),
            c_index_ipcw: self.c_index_ipcw.clone().unwrap_or(0.0),
            brier: self
                .brier
                .clone()
                .unwrap_or_else(|_| Array1::zeros(EVALUATION_TIME_COUNT)),
            integrated_brier: self.integrated_brier.clone().unwrap_or(0.0),
            auc: self.auc.clone().unwrap_or(0.0),
        }
    }

    /// Metric name and reason for every failed metric.
    pub fn failures(&self) -> Vec<(&'static str, &MetricError)> {
        [
            ("c-index", self.c_index.as_ref().err()),
            ("c-index ipcw", self.c_index_ipcw.as_ref().err()),
            ("brier score", self.brier.as_ref().err()),
            ("integrated brier score", self.integrated_brier.as_ref().err()),
            ("cumulative dynamic auc", self.auc.as_ref().err()),
        ]
        .into_iter()
        .filter_map(|(name, err)| err.map(|err| (name, err)))
        .collect()
    }
}

/// Computes the five validation metrics, logging each failure as a warning.
pub fn calculate_metrics(inputs: MetricInputs<'_>) -> SurvivalMetrics {
    let metrics = compute(inputs);
    for (name, err) in metrics.failures() {
        warn!("An error occurred while computing {name}: {err}");
    }
    debug!("validation metrics: {:?}", metrics.summary());
    metrics
}

fn compute(inputs: MetricInputs<'_>) -> SurvivalMetrics {
    let filtered = match drop_nan_risk(
        inputs.risk,
        inputs.censorship,
        inputs.event_time,
        inputs.survival,
    ) {
        Ok(filtered) => filtered,
        Err(err) => return SurvivalMetrics::all_failed(err),
    };
    let dropped = inputs.risk.len() - filtered.risk.len();
    if dropped > 0 {
        debug!("dropped {dropped} samples with NaN risk before scoring");
    }

    let c_index = concordance_index_censored(
        event_indicator(filtered.censorship.view()).view(),
        filtered.event_time.view(),
        filtered.risk.view(),
    )
    .map(|c| c.c_index);

    let survival_test =
        match SurvivalData::from_censorship(filtered.censorship.view(), filtered.event_time.view())
        {
            Ok(test) => test,
            Err(err) => {
                let err = MetricError::SurvivalTest(Box::new(err));
                return SurvivalMetrics {
                    c_index,
                    ..SurvivalMetrics::all_failed(err)
                };
            }
        };
    let train = inputs.survival_train;

    let c_index_ipcw = concordance_index_ipcw(train, &survival_test, filtered.risk.view())
        .map(|c| c.c_index);

    let times = evaluation_times(inputs.dataset_event_times, inputs.bins);
    let brier = times.clone().and_then(|times| {
        brier_score(train, &survival_test, filtered.survival.view(), &times).map(|b| b.scores)
    });
    let integrated_brier = times.clone().and_then(|times| {
        integrated_brier_score(train, &survival_test, filtered.survival.view(), &times)
    });
    let auc = times.and_then(|times| {
        if filtered.survival.ncols() == 0 {
            return Err(MetricError::EstimateColumns {
                expected: times.len() - 1,
                found: 0,
            });
        }
        let estimate = filtered.survival.slice(s![.., 1..]).mapv(|s| 1.0 - s);
        cumulative_dynamic_auc(train, &survival_test, estimate.view(), &times[1..])
            .map(|auc| auc.mean_auc)
    });

    SurvivalMetrics {
        c_index,
        c_index_ipcw,
        brier,
        integrated_brier,
        auc,
    }
}
