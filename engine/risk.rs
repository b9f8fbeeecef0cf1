use ndarray::{Array1, Array2, ArrayView2, Axis};

/// Risk summary derived from discrete-time hazard logits.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskEstimate {
    /// Scalar risk per sample: the negative sum of the survival curve.
    pub risk: Array1<f64>,
    /// Survival probability at the end of each time bin, shape `[samples, bins]`.
    pub survival: Array2<f64>,
}

/// Converts hazard logits into a per-bin survival curve and a scalar risk.
///
/// hazard = sigmoid(logit); survival is the running product of (1 - hazard)
/// from the first bin to the last; risk = -Σ survival. A larger risk means an
/// earlier expected event.
pub fn calculate_risk(logits: ArrayView2<'_, f64>) -> RiskEstimate {
    let mut survival = logits.mapv(|logit| 1.0 - sigmoid(logit));
    for mut row in survival.rows_mut() {
        let mut running = 1.0;
        for value in row.iter_mut() {
            running *= *value;
            *value = running;
        }
    }
    let risk = survival.sum_axis(Axis(1)).mapv(|total| -total);
    RiskEstimate { risk, survival }
}

#[inline]
pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let z = x.exp();
        z / (1.0 + z)
    }
}
