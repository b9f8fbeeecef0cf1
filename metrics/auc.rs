use super::brier::check_estimate;
use super::concordance::TIED_TOL;
use super::kaplan_meier::KaplanMeier;
use super::survival::SurvivalData;
use super::{MetricError, trapezoid};
use ndarray::{Array1, ArrayView2};

#[derive(Debug, Clone, PartialEq)]
pub struct CumulativeAuc {
    pub times: Vec<f64>,
    pub scores: Array1<f64>,
    /// AUC averaged over time, weighted by the drop of the test survival
    /// function between evaluation times.
    pub mean_auc: f64,
}

/// Cumulative/dynamic AUC.
///
/// At time `t`, cases are samples with an event at or before `t` and controls
/// are samples still at risk after `t`. Cases are weighted by inverse
/// censoring probability. A higher estimate must mean a higher risk.
pub fn cumulative_dynamic_auc(
    train: &SurvivalData,
    test: &SurvivalData,
    estimate: ArrayView2<'_, f64>,
    times: &[f64],
) -> Result<CumulativeAuc, MetricError> {
    test.checked(false)?;
    let times = check_estimate(test, estimate, times)?;
    let ipcw = KaplanMeier::fit_censoring(train)?.ipcw(test)?;
    let event = test.event();
    let time = test.time();
    let n = test.len();

    let mut scores = Array1::zeros(times.len());
    for (col, &t) in times.iter().enumerate() {
        let column = estimate.column(col);
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| column[b].total_cmp(&column[a]));

        let mut cum_tp = Vec::with_capacity(n);
        let mut cum_fp = Vec::with_capacity(n);
        let mut tied = Vec::with_capacity(n);
        let (mut tp, mut fp) = (0.0, 0.0);
        let mut previous = f64::INFINITY;
        for &i in &order {
            if time[i] <= t && event[i] {
                tp += ipcw[i];
            }
            if time[i] > t {
                fp += 1.0;
            }
            cum_tp.push(tp);
            cum_fp.push(fp);
            tied.push((column[i] - previous).abs() <= TIED_TOL);
            previous = column[i];
        }
        let n_controls = fp;
        let total_tp = tp;

        // Within a run of tied estimates only the last threshold is a real one.
        let mut true_pos = vec![0.0];
        let mut false_pos = vec![0.0];
        for k in 0..n {
            if k + 1 < n && tied[k + 1] {
                continue;
            }
            true_pos.push(cum_tp[k] / total_tp);
            false_pos.push(cum_fp[k] / n_controls);
        }
        scores[col] = trapezoid(&true_pos, &false_pos);
    }

    let mean_auc = if times.len() == 1 {
        scores[0]
    } else {
        let survival = KaplanMeier::fit(test)?.predict(&times)?;
        let mut previous = 1.0;
        let mut integral = 0.0;
        for (score, &s) in scores.iter().zip(&survival) {
            integral += score * (previous - s);
            previous = s;
        }
        integral / (1.0 - previous)
    };

    Ok(CumulativeAuc {
        times,
        scores,
        mean_auc,
    })
}
