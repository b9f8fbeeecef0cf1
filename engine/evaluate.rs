use crate::batch::{ClinicalRecord, OmicsFormat, unpack};
use crate::data::SurvivalLoader;
use crate::forward::{MissingModality, SurvivalModel, forward_inference};
use crate::loss::SurvivalLoss;
use crate::metrics::{MetricInputs, SurvivalData, SurvivalMetrics, calculate_metrics};
use crate::risk::calculate_risk;
use crate::train::{RunningArrays, TrainingError};
use itertools::izip;
use log::debug;
use ndarray::{Array1, Array2, ArrayView2, Axis, concatenate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Length of the patient barcode prefix of a TCGA slide id.
pub const CASE_ID_LEN: usize = 12;

/// Patient id of a slide: its first twelve characters.
pub fn case_id(slide_id: &str) -> &str {
    match slide_id.char_indices().nth(CASE_ID_LEN) {
        Some((end, _)) => &slide_id[..end],
        None => slide_id,
    }
}

/// Outcome, prediction and clinical payload of one evaluated patient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientResult {
    pub time: f64,
    pub risk: f64,
    pub censorship: f64,
    /// Raw per-bin hazard logits.
    pub logits: Vec<f64>,
    pub clinical: ClinicalRecord,
}

/// Results keyed by case id. A later slide of the same patient replaces the earlier one.
pub type PatientResults = BTreeMap<String, PatientResult>;

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationReport {
    pub patient_results: PatientResults,
    pub metrics: SurvivalMetrics,
    /// Sum of batch losses divided by the number of samples.
    pub mean_loss: f64,
}

fn stack_rows(rows: &[Array2<f64>]) -> Result<Array2<f64>, TrainingError> {
    if rows.is_empty() {
        return Ok(Array2::zeros((0, 0)));
    }
    let views: Vec<ArrayView2<'_, f64>> = rows.iter().map(Array2::view).collect();
    Ok(concatenate(Axis(0), &views)?)
}

/// Evaluates `model` on every batch of `loader` without updating it.
///
/// `survival_train` is the censoring reference for the weighted metrics.
/// When `missing` is set, that modality is zeroed before each prediction.
pub fn summary<M, L, F>(
    model: &M,
    format: OmicsFormat,
    loader: &L,
    loss_fn: &F,
    survival_train: &SurvivalData,
    missing: Option<MissingModality>,
) -> Result<EvaluationReport, TrainingError>
where
    M: SurvivalModel + ?Sized,
    L: SurvivalLoader + ?Sized,
    F: SurvivalLoss + ?Sized,
{
    let metadata = loader.metadata();
    let mut total_loss = 0.0;
    let mut running = RunningArrays::default();
    let mut logits = Vec::new();
    let mut survival = Vec::new();

    for batch in loader.batches() {
        let unpacked = unpack(format, batch?)?;
        let pass = forward_inference(model, unpacked, missing)?;
        let loss = loss_fn.evaluate(pass.output.logits.view(), &pass.targets)?;
        total_loss += loss.value;

        let estimate = calculate_risk(pass.output.logits.view());
        running.extend(&estimate.risk, &pass.targets, pass.clinical)?;
        if running.len() > metadata.len() {
            return Err(TrainingError::MetadataExhausted(metadata.len()));
        }
        survival.push(estimate.survival);
        logits.push(pass.output.logits);
    }

    if loader.is_empty() || running.is_empty() {
        return Err(TrainingError::EmptyLoader);
    }
    let mean_loss = total_loss / loader.len() as f64;
    let logits = stack_rows(&logits)?;
    let survival = stack_rows(&survival)?;

    let mut patient_results = PatientResults::new();
    for (slide_id, &risk, &censorship, &time, clinical, row) in izip!(
        &metadata.slide_ids,
        &running.risk,
        &running.censorship,
        &running.event_time,
        &running.clinical,
        logits.rows()
    ) {
        patient_results.insert(
            case_id(slide_id).to_string(),
            PatientResult {
                time,
                risk,
                censorship,
                logits: row.to_vec(),
                clinical: clinical.clone(),
            },
        );
    }
    debug!(
        "evaluated {} slides from {} patients",
        running.len(),
        patient_results.len()
    );

    let risk = Array1::from(running.risk);
    let censorship = Array1::from(running.censorship);
    let event_time = Array1::from(running.event_time);
    let metrics = calculate_metrics(MetricInputs {
        survival_train,
        risk: risk.view(),
        censorship: censorship.view(),
        event_time: event_time.view(),
        survival: survival.view(),
        dataset_event_times: metadata.event_time.view(),
        bins: loader.bins().edges(),
    });

    Ok(EvaluationReport {
        patient_results,
        metrics,
        mean_loss,
    })
}
