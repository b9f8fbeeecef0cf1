use super::kaplan_meier::KaplanMeier;
use super::survival::SurvivalData;
use super::{MetricError, ensure_finite, trapezoid};
use ndarray::{Array1, ArrayView1, ArrayView2};

/// Brier score at each (deduplicated, sorted) evaluation time.
#[derive(Debug, Clone, PartialEq)]
pub struct BrierScores {
    pub times: Vec<f64>,
    pub scores: Array1<f64>,
}

/// Sorts and deduplicates evaluation times and checks they fall inside
/// `[min(test_time), max(test_time))`.
pub fn check_times(test_time: ArrayView1<'_, f64>, times: &[f64]) -> Result<Vec<f64>, MetricError> {
    ensure_finite("times", times)?;
    let mut unique = times.to_vec();
    unique.sort_by(f64::total_cmp);
    unique.dedup();
    let (Some(&first), Some(&last)) = (unique.first(), unique.last()) else {
        return Err(MetricError::Empty);
    };
    let test_min = test_time.fold(f64::INFINITY, |acc, &t| acc.min(t));
    let test_max = test_time.fold(f64::NEG_INFINITY, |acc, &t| acc.max(t));
    if last >= test_max || first < test_min {
        return Err(MetricError::TimesOutOfRange {
            min: test_min,
            max: test_max,
        });
    }
    Ok(unique)
}

/// Validates a `[samples, times]` estimate against the test data and returns
/// the checked evaluation times.
pub(crate) fn check_estimate(
    test: &SurvivalData,
    estimate: ArrayView2<'_, f64>,
    times: &[f64],
) -> Result<Vec<f64>, MetricError> {
    ensure_finite("estimate", estimate.iter())?;
    let times = check_times(test.time(), times)?;
    if estimate.nrows() != test.len() {
        return Err(MetricError::LengthMismatch {
            what: "estimate",
            expected: test.len(),
            found: estimate.nrows(),
        });
    }
    if estimate.ncols() != times.len() {
        return Err(MetricError::EstimateColumns {
            expected: times.len(),
            found: estimate.ncols(),
        });
    }
    Ok(times)
}

/// Time-dependent Brier score of predicted survival probabilities.
///
/// Each term is weighted by the inverse censoring survival: cases (event by
/// `t`) by `G(t_i)`, controls (still at risk after `t`) by `G(t)`. `estimate`
/// holds the predicted probability of surviving past each time.
pub fn brier_score(
    train: &SurvivalData,
    test: &SurvivalData,
    estimate: ArrayView2<'_, f64>,
    times: &[f64],
) -> Result<BrierScores, MetricError> {
    test.checked(false)?;
    let times = check_estimate(test, estimate, times)?;

    let censoring = KaplanMeier::fit_censoring(train)?;
    let zero_to_inf = |g: f64| if g == 0.0 { f64::INFINITY } else { g };
    let prob_cens_t: Vec<f64> = censoring.predict(&times)?.into_iter().map(zero_to_inf).collect();
    let test_time = test.time().to_vec();
    let prob_cens_y: Vec<f64> = censoring
        .predict(&test_time)?
        .into_iter()
        .map(zero_to_inf)
        .collect();

    let n = test.len() as f64;
    let scores = times
        .iter()
        .enumerate()
        .map(|(col, &t)| {
            let total: f64 = test
                .records()
                .enumerate()
                .map(|(row, record)| {
                    let est = estimate[[row, col]];
                    if record.time <= t && record.event {
                        est * est / prob_cens_y[row]
                    } else if record.time > t {
                        (1.0 - est) * (1.0 - est) / prob_cens_t[col]
                    } else {
                        0.0
                    }
                })
                .sum();
            total / n
        })
        .collect();
    Ok(BrierScores { times, scores })
}

/// Trapezoidal integral of the Brier score divided by the covered time span.
pub fn integrated_brier_score(
    train: &SurvivalData,
    test: &SurvivalData,
    estimate: ArrayView2<'_, f64>,
    times: &[f64],
) -> Result<f64, MetricError> {
    let BrierScores { times, scores } = brier_score(train, test, estimate, times)?;
    let (Some(&first), Some(&last)) = (times.first(), times.last()) else {
        return Err(MetricError::TooFewTimePoints);
    };
    if times.len() < 2 {
        return Err(MetricError::TooFewTimePoints);
    }
    Ok(trapezoid(&scores.to_vec(), &times) / (last - first))
}
