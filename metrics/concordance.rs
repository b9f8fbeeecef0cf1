use super::kaplan_meier::KaplanMeier;
use super::survival::SurvivalData;
use super::{MetricError, ensure_finite};
use ndarray::{Array1, ArrayView1};

/// Two predictions closer than this are treated as tied.
pub const TIED_TOL: f64 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Concordance {
    pub c_index: f64,
    pub concordant: usize,
    pub discordant: usize,
    pub tied_risk: usize,
    pub tied_time: usize,
}

/// Harrell's concordance index.
///
/// A pair is comparable when the earlier time is an observed event, or when an
/// event and a censoring share the same time. Concordant pairs give the higher
/// estimate to the earlier event; tied estimates count one half.
pub fn concordance_index_censored(
    event: ArrayView1<'_, bool>,
    time: ArrayView1<'_, f64>,
    estimate: ArrayView1<'_, f64>,
) -> Result<Concordance, MetricError> {
    check_lengths(time.len(), event.len(), estimate.len())?;
    ensure_finite("event_time", time.iter())?;
    ensure_finite("estimate", estimate.iter())?;
    if time.len() < 2 {
        return Err(MetricError::TooFewSamples(time.len()));
    }
    if !event.iter().any(|&e| e) {
        return Err(MetricError::AllCensored);
    }
    let weights = Array1::ones(time.len());
    estimate_concordance(event, time, estimate, weights.view())
}

/// Uno's concordance index with inverse-probability-of-censoring weights.
///
/// The censoring distribution is fitted on `train`; every comparable pair is
/// weighted by `1 / G(t_i)^2` for its earlier event time `t_i`.
pub fn concordance_index_ipcw(
    train: &SurvivalData,
    test: &SurvivalData,
    estimate: ArrayView1<'_, f64>,
) -> Result<Concordance, MetricError> {
    test.checked(false)?;
    check_lengths(test.len(), test.len(), estimate.len())?;
    ensure_finite("estimate", estimate.iter())?;
    let censoring = KaplanMeier::fit_censoring(train)?;
    let weights = censoring.ipcw(test)?.mapv(|w| w * w);
    estimate_concordance(test.event(), test.time(), estimate, weights.view())
}

fn check_lengths(time: usize, event: usize, estimate: usize) -> Result<(), MetricError> {
    if event != time {
        return Err(MetricError::LengthMismatch {
            what: "event indicator",
            expected: time,
            found: event,
        });
    }
    if estimate != time {
        return Err(MetricError::LengthMismatch {
            what: "estimate",
            expected: time,
            found: estimate,
        });
    }
    Ok(())
}

struct Comparable {
    /// Sorted position of the event sample.
    anchor: usize,
    /// Sorted positions it is compared against.
    others: std::ops::Range<usize>,
    /// Censored samples sharing the anchor's time.
    tied_censored: Vec<usize>,
}

fn comparable_pairs(
    event: ArrayView1<'_, bool>,
    time: ArrayView1<'_, f64>,
    order: &[usize],
) -> (Vec<Comparable>, usize) {
    let n = order.len();
    let mut comparable = Vec::new();
    let mut tied_time = 0;
    let mut i = 0;
    while i + 1 < n {
        let time_i = time[order[i]];
        let mut end = i + 1;
        while end < n && time[order[end]] == time_i {
            end += 1;
        }
        let censored_here: Vec<usize> = (i..end).filter(|&k| !event[order[k]]).collect();
        for j in i..end {
            if event[order[j]] {
                tied_time += censored_here.len();
                comparable.push(Comparable {
                    anchor: j,
                    others: end..n,
                    tied_censored: censored_here.clone(),
                });
            }
        }
        i = end;
    }
    (comparable, tied_time)
}

fn estimate_concordance(
    event: ArrayView1<'_, bool>,
    time: ArrayView1<'_, f64>,
    estimate: ArrayView1<'_, f64>,
    weights: ArrayView1<'_, f64>,
) -> Result<Concordance, MetricError> {
    let mut order: Vec<usize> = (0..time.len()).collect();
    order.sort_by(|&a, &b| time[a].total_cmp(&time[b]));
    let (comparable, tied_time) = comparable_pairs(event, time, &order);
    if comparable.is_empty() {
        return Err(MetricError::NoComparablePairs);
    }

    let mut numerator = 0.0;
    let mut denominator = 0.0;
    let mut concordant = 0;
    let mut discordant = 0;
    let mut tied_risk = 0;
    for pair in &comparable {
        let est_i = estimate[order[pair.anchor]];
        let w_i = weights[order[pair.anchor]];
        let mut n_con = 0;
        let mut n_ties = 0;
        let mut total = 0;
        for k in pair.tied_censored.iter().copied().chain(pair.others.clone()) {
            let est = estimate[order[k]];
            total += 1;
            if (est - est_i).abs() <= TIED_TOL {
                n_ties += 1;
            } else if est < est_i {
                n_con += 1;
            }
        }
        numerator += w_i * n_con as f64 + 0.5 * w_i * n_ties as f64;
        denominator += w_i * total as f64;
        tied_risk += n_ties;
        concordant += n_con;
        discordant += total - n_con - n_ties;
    }

    Ok(Concordance {
        c_index: numerator / denominator,
        concordant,
        discordant,
        tied_risk,
        tied_time,
    })
}
