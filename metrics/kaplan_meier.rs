use super::MetricError;
use super::survival::SurvivalData;
use ndarray::{Array1, ArrayView1};

/// Per unique time: events, subjects at risk and censorings.
#[derive(Debug, Clone, PartialEq)]
pub struct EventCounts {
    pub times: Vec<f64>,
    pub n_events: Vec<f64>,
    pub n_at_risk: Vec<f64>,
    pub n_censored: Vec<f64>,
}

/// Tallies outcomes at each distinct time, visiting samples in stable time order.
pub fn compute_counts(event: ArrayView1<'_, bool>, time: ArrayView1<'_, f64>) -> EventCounts {
    let n_samples = time.len();
    let mut order: Vec<usize> = (0..n_samples).collect();
    order.sort_by(|&a, &b| time[a].total_cmp(&time[b]));

    let mut counts = EventCounts {
        times: Vec::new(),
        n_events: Vec::new(),
        n_at_risk: Vec::new(),
        n_censored: Vec::new(),
    };
    let mut seen = 0usize;
    let mut i = 0usize;
    while i < n_samples {
        let current = time[order[i]];
        let mut events = 0usize;
        let mut total = 0usize;
        while i < n_samples && time[order[i]] == current {
            if event[order[i]] {
                events += 1;
            }
            total += 1;
            i += 1;
        }
        counts.times.push(current);
        counts.n_events.push(events as f64);
        counts.n_at_risk.push((n_samples - seen) as f64);
        counts.n_censored.push((total - events) as f64);
        seen += total;
    }
    counts
}

/// Product-limit estimate at each unique time.
///
/// With `reverse` set the roles of events and censorings are swapped, which
/// estimates the censoring survival function G(t).
pub fn kaplan_meier(
    data: &SurvivalData,
    reverse: bool,
) -> Result<(Vec<f64>, Vec<f64>), MetricError> {
    data.checked(true)?;
    let EventCounts {
        times,
        mut n_events,
        mut n_at_risk,
        n_censored,
    } = compute_counts(data.event(), data.time());
    if reverse {
        for (risk, events) in n_at_risk.iter_mut().zip(&n_events) {
            *risk -= events;
        }
        n_events = n_censored;
    }

    let mut running = 1.0;
    let survival = n_events
        .iter()
        .zip(&n_at_risk)
        .map(|(&events, &at_risk)| {
            let ratio = if events != 0.0 { events / at_risk } else { 0.0 };
            running *= 1.0 - ratio;
            running
        })
        .collect();
    Ok((times, survival))
}

/// Right-continuous step function fitted by Kaplan-Meier.
#[derive(Debug, Clone, PartialEq)]
pub struct KaplanMeier {
    unique_time: Vec<f64>,
    prob: Vec<f64>,
}

impl KaplanMeier {
    /// Survival function of the event time. All-censored data is accepted.
    pub fn fit(data: &SurvivalData) -> Result<Self, MetricError> {
        let (times, survival) = kaplan_meier(data, false)?;
        Ok(Self::with_origin(times, survival))
    }

    /// Survival function of the censoring time, G(t).
    pub fn fit_censoring(data: &SurvivalData) -> Result<Self, MetricError> {
        data.checked(false)?;
        if data.event().iter().all(|&e| e) {
            let mut unique_time = data.time().to_vec();
            unique_time.sort_by(f64::total_cmp);
            unique_time.dedup();
            let prob = vec![1.0; unique_time.len()];
            return Ok(Self { unique_time, prob });
        }
        let (times, survival) = kaplan_meier(data, true)?;
        Ok(Self::with_origin(times, survival))
    }

    fn with_origin(times: Vec<f64>, survival: Vec<f64>) -> Self {
        let mut unique_time = Vec::with_capacity(times.len() + 1);
        unique_time.push(f64::NEG_INFINITY);
        unique_time.extend(times);
        let mut prob = Vec::with_capacity(survival.len() + 1);
        prob.push(1.0);
        prob.extend(survival);
        Self { unique_time, prob }
    }

    pub fn unique_time(&self) -> &[f64] {
        &self.unique_time
    }

    pub fn probabilities(&self) -> &[f64] {
        &self.prob
    }

    /// Evaluates the step function at each requested time.
    ///
    /// Beyond the last observed time the estimate is 0 if the curve reached 0,
    /// and undefined (an error) otherwise.
    pub fn predict(&self, times: &[f64]) -> Result<Vec<f64>, MetricError> {
        let (&last_time, &last_prob) = match (self.unique_time.last(), self.prob.last()) {
            (Some(t), Some(p)) => (t, p),
            _ => return Err(MetricError::Empty),
        };
        if last_prob > 0.0 && times.iter().any(|&t| t > last_time) {
            return Err(MetricError::BeyondLastTime(last_time));
        }
        Ok(times
            .iter()
            .map(|&t| {
                if t > last_time {
                    return 0.0;
                }
                let idx = self.unique_time.partition_point(|&u| u < t);
                let exact = (self.unique_time[idx] - t).abs() < f64::EPSILON;
                if exact {
                    self.prob[idx]
                } else {
                    // Before the first step: only reachable without the -inf origin,
                    // where the curve is identically one.
                    idx.checked_sub(1).map_or(last_prob, |i| self.prob[i])
                }
            })
            .collect())
    }

    /// Inverse probability of censoring weights: 1/G(t_i) for events, 0 otherwise.
    pub fn ipcw(&self, test: &SurvivalData) -> Result<Array1<f64>, MetricError> {
        test.checked(false)?;
        let event_times: Vec<f64> = test
            .records()
            .filter(|r| r.event)
            .map(|r| r.time)
            .collect();
        let ghat = self.predict(&event_times)?;
        if ghat.iter().any(|&g| g == 0.0) {
            return Err(MetricError::ZeroCensoringSurvival);
        }
        let mut weights = Array1::zeros(test.len());
        let mut ghat = ghat.into_iter();
        for (weight, record) in weights.iter_mut().zip(test.records()) {
            if record.event {
                if let Some(g) = ghat.next() {
                    *weight = 1.0 / g;
                }
            }
        }
        Ok(weights)
    }
}
