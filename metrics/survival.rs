use super::{MetricError, ensure_finite};
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

/// One right-censored outcome.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SurvivalRecord {
    pub event: bool,
    pub time: f64,
}

/// Column-oriented collection of right-censored outcomes.
#[derive(Debug, Clone, PartialEq)]
pub struct SurvivalData {
    event: Array1<bool>,
    time: Array1<f64>,
}

/// Maps censorship flags (1 = censored) to event indicators.
pub fn event_indicator(censorship: ArrayView1<'_, f64>) -> Array1<bool> {
    censorship.mapv(|c| 1.0 - c != 0.0)
}

impl SurvivalData {
    pub fn from_arrays(event: Array1<bool>, time: Array1<f64>) -> Result<Self, MetricError> {
        if event.len() != time.len() {
            return Err(MetricError::LengthMismatch {
                what: "event indicator",
                expected: time.len(),
                found: event.len(),
            });
        }
        ensure_finite("time", time.iter())?;
        Ok(Self { event, time })
    }

    pub fn from_censorship(
        censorship: ArrayView1<'_, f64>,
        time: ArrayView1<'_, f64>,
    ) -> Result<Self, MetricError> {
        Self::from_arrays(event_indicator(censorship), time.to_owned())
    }

    pub fn from_records(records: &[SurvivalRecord]) -> Result<Self, MetricError> {
        Self::from_arrays(
            records.iter().map(|r| r.event).collect(),
            records.iter().map(|r| r.time).collect(),
        )
    }

    pub fn records(&self) -> impl Iterator<Item = SurvivalRecord> + '_ {
        self.event
            .iter()
            .zip(self.time.iter())
            .map(|(&event, &time)| SurvivalRecord { event, time })
    }

    pub fn event(&self) -> ArrayView1<'_, bool> {
        self.event.view()
    }

    pub fn time(&self) -> ArrayView1<'_, f64> {
        self.time.view()
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Structural checks shared by every estimator.
    pub fn checked(&self, allow_all_censored: bool) -> Result<&Self, MetricError> {
        if self.is_empty() {
            return Err(MetricError::Empty);
        }
        if !allow_all_censored && !self.event.iter().any(|&e| e) {
            return Err(MetricError::AllCensored);
        }
        if self.time.iter().any(|&t| t < 0.0) {
            return Err(MetricError::NegativeTime);
        }
        Ok(self)
    }
}
