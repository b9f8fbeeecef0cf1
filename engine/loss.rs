//! Survival losses over discrete-time hazard logits.
//!
//! Each loss returns its value together with the analytic gradient with
//! respect to the logits, so the training step can hand the model an
//! upstream gradient without an autodiff runtime.

use crate::batch::Targets;
use crate::risk::sigmoid;
use ndarray::{Array2, ArrayView2};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Loss value and d(value)/d(logits).
#[derive(Debug, Clone)]
pub struct LossEvaluation {
    pub value: f64,
    pub grad_logits: Array2<f64>,
}

#[derive(Debug, Error)]
pub enum LossError {
    #[error("Unsupported survival loss selector '{0}'")]
    UnknownSelector(String),
    #[error("label {label} of sample {sample} is outside the {bins} available time bins")]
    LabelOutOfRange {
        sample: usize,
        label: usize,
        bins: usize,
    },
    #[error("logits have {logits} rows but the targets describe {targets} samples")]
    LengthMismatch { logits: usize, targets: usize },
    #[error("the Cox partial likelihood needs a single risk column, got {0} columns")]
    CoxShape(usize),
}

pub trait SurvivalLoss {
    fn evaluate(
        &self,
        logits: ArrayView2<'_, f64>,
        targets: &Targets,
    ) -> Result<LossEvaluation, LossError>;
}

fn check_rows(logits: &ArrayView2<'_, f64>, targets: &Targets) -> Result<(), LossError> {
    if logits.nrows() != targets.len()
        || targets.censorship.len() != targets.len()
        || targets.event_time.len() != targets.len()
    {
        return Err(LossError::LengthMismatch {
            logits: logits.nrows(),
            targets: targets.len(),
        });
    }
    Ok(())
}

/// Negative log-likelihood of the discrete-time hazard model, summed over the
/// batch.
///
/// For a sample with bin `y` and censorship `c`:
///
/// ```text
/// uncensored = -(1 - c) * (ln S(y-1) + ln h(y))
/// censored   = -c * ln S(y)
/// loss       = (1 - alpha) * (censored + uncensored) + alpha * uncensored
/// ```
///
/// with `S(-1) = 1` and every factor clamped below at `eps`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NllSurvLoss {
    pub alpha: f64,
    pub eps: f64,
}

impl NllSurvLoss {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, eps: 1e-7 }
    }
}

impl SurvivalLoss for NllSurvLoss {
    fn evaluate(
        &self,
        logits: ArrayView2<'_, f64>,
        targets: &Targets,
    ) -> Result<LossEvaluation, LossError> {
        check_rows(&logits, targets)?;
        let bins = logits.ncols();
        let mut grad_logits = Array2::zeros(logits.raw_dim());
        let mut value = 0.0;

        for (sample, row) in logits.rows().into_iter().enumerate() {
            let label = targets.labels[sample];
            if label >= bins {
                return Err(LossError::LabelOutOfRange {
                    sample,
                    label,
                    bins,
                });
            }
            let censored = targets.censorship[sample].trunc();
            let hazards: Vec<f64> = row.iter().map(|&logit| sigmoid(logit)).collect();
            let survival_before: f64 = hazards[..label].iter().map(|h| 1.0 - h).product();
            let survival_at = survival_before * (1.0 - hazards[label]);

            let s_prev = survival_before.max(self.eps);
            let h_this = hazards[label].max(self.eps);
            let s_this = survival_at.max(self.eps);

            let uncensored = -(1.0 - censored) * (s_prev.ln() + h_this.ln());
            let censored_term = -censored * s_this.ln();
            value += (1.0 - self.alpha) * (censored_term + uncensored) + self.alpha * uncensored;

            let coef_uncensored = 1.0 - censored;
            let coef_censored = (1.0 - self.alpha) * censored;
            let mut grad = grad_logits.row_mut(sample);
            // The clamp blocks the gradient wherever the clamped value was replaced.
            if survival_before >= self.eps {
                for k in 0..label {
                    grad[k] += coef_uncensored * hazards[k];
                }
            }
            if hazards[label] >= self.eps {
                grad[label] -= coef_uncensored * (1.0 - hazards[label]);
            }
            if survival_at >= self.eps {
                for k in 0..=label {
                    grad[k] += coef_censored * hazards[k];
                }
            }
        }

        Ok(LossEvaluation { value, grad_logits })
    }
}

/// Negative Cox partial log-likelihood averaged over the batch.
///
/// The logits are read as a single log-risk column. The risk set of sample
/// `i` is every sample whose event time is at least `t_i`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CoxSurvLoss;

impl SurvivalLoss for CoxSurvLoss {
    fn evaluate(
        &self,
        logits: ArrayView2<'_, f64>,
        targets: &Targets,
    ) -> Result<LossEvaluation, LossError> {
        check_rows(&logits, targets)?;
        if logits.ncols() != 1 {
            return Err(LossError::CoxShape(logits.ncols()));
        }
        let n = logits.nrows();
        let mut grad_logits = Array2::zeros((n, 1));
        if n == 0 {
            return Ok(LossEvaluation {
                value: 0.0,
                grad_logits,
            });
        }

        let theta = logits.column(0);
        let times = &targets.event_time;
        let shift = theta.fold(f64::NEG_INFINITY, |acc, &v| acc.max(v));
        let scaled: Vec<f64> = theta.iter().map(|&v| (v - shift).exp()).collect();

        let mut value = 0.0;
        for i in 0..n {
            let event = 1.0 - targets.censorship[i];
            if event == 0.0 {
                continue;
            }
            let denom: f64 = (0..n)
                .filter(|&j| times[j] >= times[i])
                .map(|j| scaled[j])
                .sum();
            value -= event * (theta[i] - (denom.ln() + shift));
            for j in (0..n).filter(|&j| times[j] >= times[i]) {
                grad_logits[[j, 0]] += event * scaled[j] / denom;
            }
            grad_logits[[i, 0]] -= event;
        }

        let scale = 1.0 / n as f64;
        grad_logits *= scale;
        Ok(LossEvaluation {
            value: value * scale,
            grad_logits,
        })
    }
}

/// Loss selector as written in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum LossKind {
    NllSurv,
    CoxSurv,
}

impl LossKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NllSurv => "nll_surv",
            Self::CoxSurv => "cox_surv",
        }
    }
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LossKind {
    type Err = LossError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        match tag {
            "nll_surv" => Ok(Self::NllSurv),
            "cox_surv" => Ok(Self::CoxSurv),
            other => Err(LossError::UnknownSelector(other.to_string())),
        }
    }
}

impl TryFrom<String> for LossKind {
    type Error = LossError;

    fn try_from(tag: String) -> Result<Self, Self::Error> {
        tag.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LossFunction {
    Nll(NllSurvLoss),
    Cox(CoxSurvLoss),
}

impl LossFunction {
    pub fn from_kind(kind: LossKind, alpha: f64) -> Self {
        match kind {
            LossKind::NllSurv => Self::Nll(NllSurvLoss::new(alpha)),
            LossKind::CoxSurv => Self::Cox(CoxSurvLoss),
        }
    }
}

impl SurvivalLoss for LossFunction {
    fn evaluate(
        &self,
        logits: ArrayView2<'_, f64>,
        targets: &Targets,
    ) -> Result<LossEvaluation, LossError> {
        match self {
            Self::Nll(loss) => loss.evaluate(logits, targets),
            Self::Cox(loss) => loss.evaluate(logits, targets),
        }
    }
}
