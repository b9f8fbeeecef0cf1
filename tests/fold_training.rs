mod common;

use std::cell::Cell;
use std::fs;
use std::io;

use common::{LinearHazardModel, gene_loaders, groups_loaders, pathways_loaders};
use histosurv::batch::{GROUP_COUNT, OmicsFormat, unpack};
use histosurv::checkpoint::{ArtifactLayout, load_results, load_state_dict};
use histosurv::config::{PathwayCollection, TrainingConfig};
use histosurv::data::SurvivalLoader;
use histosurv::evaluate::CASE_ID_LEN;
use histosurv::fold::train_val;
use histosurv::forward::{MissingModality, SurvivalModel};
use histosurv::metrics::MetricSummary;
use histosurv::optim::OptimizerKind;
use histosurv::progress::{FoldStage, LogFileProgress, TrainingProgress};
use histosurv::train::TrainingError;

const BINS: usize = 4;

fn config(results_dir: &std::path::Path, max_epochs: usize) -> TrainingConfig {
    TrainingConfig {
        omics_format: OmicsFormat::Gene,
        max_epochs,
        optimizer: OptimizerKind::Adam,
        lr: 0.05,
        reg: 0.0,
        batch_size: 4,
        pathway_collection: PathwayCollection::Xena,
        results_dir: results_dir.to_path_buf(),
        ..TrainingConfig::default()
    }
}

#[derive(Default)]
struct RecordingProgress {
    batches: usize,
    train_losses: Vec<f64>,
    validations: Vec<MetricSummary>,
    fold_ends: Vec<FoldStage>,
}

impl TrainingProgress for RecordingProgress {
    fn on_batch(&mut self, batch: usize, loss: f64) -> io::Result<()> {
        assert!(loss.is_finite(), "non-finite loss in batch {batch}");
        self.batches += 1;
        Ok(())
    }

    fn on_epoch(&mut self, epoch: usize, train_loss: f64, c_index: f64) -> io::Result<()> {
        assert!((0.0..=1.0).contains(&c_index), "epoch {epoch}: c-index {c_index}");
        self.train_losses.push(train_loss);
        Ok(())
    }

    fn on_validation(&mut self, epoch: usize, metrics: &MetricSummary) -> io::Result<()> {
        assert_eq!(epoch, self.validations.len());
        self.validations.push(metrics.clone());
        Ok(())
    }

    fn on_fold_end(&mut self, stage: FoldStage, metrics: &MetricSummary) -> io::Result<()> {
        assert_eq!(metrics.brier.len(), 4);
        self.fold_ends.push(stage);
        Ok(())
    }
}

#[test]
fn fold_writes_every_artifact() {
    let dir = tempfile::tempdir().expect("temporary directory");
    let config = config(dir.path(), 3);
    let (train_loader, val_loader) = gene_loaders(&config, 24, 10);
    let requested_width = Cell::new(None);
    let log_path = dir.path().join("log.txt");
    let mut progress = LogFileProgress::open(&log_path).expect("open log");

    let outcome = train_val(
        &train_loader,
        &val_loader,
        0,
        &config,
        |omics_width| {
            requested_width.set(Some(omics_width));
            Ok(LinearHazardModel::new(BINS, 1, 3))
        },
        &mut progress,
    )
    .expect("fold trains");
    drop(progress);

    assert_eq!(requested_width.get(), Some(1577));
    let layout = ArtifactLayout::new(dir.path());
    for path in [
        layout.splits(0),
        layout.best_checkpoint(0),
        layout.final_checkpoint(0),
        layout.results(0),
    ] {
        assert!(path.exists(), "missing artifact {}", path.display());
    }

    let splits = fs::read_to_string(layout.splits(0)).expect("read splits");
    assert_eq!(splits.lines().count(), 1 + 24);
    assert!(splits.lines().nth(1).expect("first row").starts_with("0,TCGA-TR-0000"));

    let stored = load_results(&layout.results(0)).expect("load results");
    assert_eq!(stored.len(), val_loader.len());
    assert!(stored.keys().all(|id| id.chars().count() == CASE_ID_LEN));
    assert_eq!(stored, outcome.best_results);
    assert_eq!(outcome.final_results.len(), val_loader.len());
    assert!(stored.values().all(|r| r.logits.len() == BINS));

    let mut fresh = LinearHazardModel::new(BINS, 1, 99);
    let best = load_state_dict(&layout.best_checkpoint(0)).expect("best checkpoint");
    fresh
        .params_mut()
        .load_state_dict(&best)
        .expect("checkpoint matches the model");

    assert!(outcome.best_epoch < 3);
    assert!((0.0..=1.0).contains(&outcome.best_c_index));
    assert_eq!(outcome.brier.len(), 4);
    assert!(outcome.mean_loss.is_finite());

    let log = fs::read_to_string(&log_path).expect("read log");
    assert_eq!(log.lines().filter(|l| l.starts_with("batch: ")).count(), 3 * 6);
    assert_eq!(log.lines().filter(|l| l.starts_with("Epoch: ")).count(), 3);
    assert_eq!(log.lines().filter(|l| l.contains("Val c-index2")).count(), 3 + 2);
    assert!(log.lines().any(|l| l.starts_with("Final Val c-index: ")));
    assert!(log.lines().last().expect("last line").starts_with("Best Val c-index: "));
}

#[test]
fn training_lowers_the_epoch_loss() {
    let dir = tempfile::tempdir().expect("temporary directory");
    let config = config(dir.path(), 8);
    let (train_loader, val_loader) = gene_loaders(&config, 24, 10);
    let mut progress = RecordingProgress::default();

    train_val(
        &train_loader,
        &val_loader,
        1,
        &config,
        |_| Ok(LinearHazardModel::new(BINS, 1, 5)),
        &mut progress,
    )
    .expect("fold trains");

    assert_eq!(progress.batches, 8 * 6);
    assert_eq!(progress.validations.len(), 8);
    assert_eq!(progress.fold_ends, vec![FoldStage::Final, FoldStage::Best]);
    let first = progress.train_losses[0];
    let last = *progress.train_losses.last().expect("epochs ran");
    assert!(last < first, "loss went from {first} to {last}");
}

#[test]
fn unreachable_threshold_reports_a_missing_best_checkpoint() {
    let dir = tempfile::tempdir().expect("temporary directory");
    let config = TrainingConfig {
        min_c_index: 1.5,
        ..config(dir.path(), 2)
    };
    let (train_loader, val_loader) = gene_loaders(&config, 12, 6);
    let mut progress = RecordingProgress::default();

    let result = train_val(
        &train_loader,
        &val_loader,
        2,
        &config,
        |_| Ok(LinearHazardModel::new(BINS, 1, 1)),
        &mut progress,
    );

    assert!(matches!(result, Err(TrainingError::NoBestCheckpoint(2))));
    let layout = ArtifactLayout::new(dir.path());
    assert!(layout.final_checkpoint(2).exists());
    assert!(!layout.best_checkpoint(2).exists());
    assert_eq!(progress.fold_ends, vec![FoldStage::Final]);
}

#[test]
fn genomics_ablation_still_validates() {
    let dir = tempfile::tempdir().expect("temporary directory");
    let config = TrainingConfig {
        missing_modality: Some(MissingModality::Genomics),
        batch_size: 3,
        ..config(dir.path(), 2)
    };
    let (train_loader, val_loader) = gene_loaders(&config, 12, 6);
    let mut progress = RecordingProgress::default();

    let outcome = train_val(
        &train_loader,
        &val_loader,
        3,
        &config,
        |_| Ok(LinearHazardModel::new(BINS, 1, 2)),
        &mut progress,
    )
    .expect("fold trains");

    assert_eq!(progress.batches, 2 * 4);
    assert_eq!(progress.validations.len(), 2);
    assert_eq!(outcome.best_results.len(), 6);
}

#[test]
fn omics_layout_mismatch_aborts_the_fold() {
    let dir = tempfile::tempdir().expect("temporary directory");
    let config = TrainingConfig {
        batch_size: 2,
        ..config(dir.path(), 1)
    };
    let (train_loader, val_loader) = gene_loaders(&config, 6, 3);
    let mut progress = RecordingProgress::default();

    let result = train_val(
        &train_loader,
        &val_loader,
        4,
        &config,
        |_| Ok(LinearHazardModel::new(BINS, 3, 0)),
        &mut progress,
    );

    assert!(matches!(result, Err(TrainingError::Model(_))));
    assert!(ArtifactLayout::new(dir.path()).splits(4).exists());
    assert_eq!(progress.batches, 0);
}

#[test]
fn configured_batch_size_drives_the_training_loader() {
    let dir = tempfile::tempdir().expect("temporary directory");
    let config = TrainingConfig {
        batch_size: 5,
        ..config(dir.path(), 1)
    };
    let (train_loader, val_loader) = gene_loaders(&config, 12, 4);
    assert_eq!(train_loader.batch_size(), 5);
    assert_eq!(val_loader.batch_size(), 1);
    let mut progress = RecordingProgress::default();

    train_val(
        &train_loader,
        &val_loader,
        5,
        &config,
        |_| Ok(LinearHazardModel::new(BINS, 1, 6)),
        &mut progress,
    )
    .expect("fold trains");

    // 12 samples in batches of 5, 5 and 2.
    assert_eq!(progress.batches, 3);
}

#[test]
fn groups_fold_trains_and_validates_without_pathology() {
    let dir = tempfile::tempdir().expect("temporary directory");
    let config = TrainingConfig {
        omics_format: OmicsFormat::Groups,
        missing_modality: Some(MissingModality::Pathology),
        ..config(dir.path(), 2)
    };
    let (train_loader, val_loader) = groups_loaders(&config, 12, 6);
    let mut progress = RecordingProgress::default();

    let outcome = train_val(
        &train_loader,
        &val_loader,
        6,
        &config,
        |_| Ok(LinearHazardModel::new(BINS, GROUP_COUNT, 4)),
        &mut progress,
    )
    .expect("fold trains");

    assert_eq!(progress.batches, 2 * 3);
    assert_eq!(progress.validations.len(), 2);
    assert_eq!(progress.fold_ends, vec![FoldStage::Final, FoldStage::Best]);
    assert_eq!(outcome.best_results.len(), 6);
    assert!(outcome.best_results.values().all(|r| r.logits.len() == BINS));
    assert!(outcome.mean_loss.is_finite());
}

fn pathways_fold(masked: bool, missing_modality: Option<MissingModality>) {
    let dir = tempfile::tempdir().expect("temporary directory");
    let config = TrainingConfig {
        omics_format: OmicsFormat::Pathways,
        missing_modality,
        ..config(dir.path(), 2)
    };
    let (train_loader, val_loader) = pathways_loaders(&config, 12, 6, masked);
    for batch in train_loader.batches() {
        let unpacked = unpack(OmicsFormat::Pathways, batch.expect("collate")).expect("unpack");
        assert_eq!(unpacked.mask.is_some(), masked);
        assert_eq!(unpacked.omics.tensors().len(), common::PATHWAY_WIDTHS.len());
    }
    let mut progress = RecordingProgress::default();

    let outcome = train_val(
        &train_loader,
        &val_loader,
        7,
        &config,
        |_| Ok(LinearHazardModel::new(BINS, common::PATHWAY_WIDTHS.len(), 8)),
        &mut progress,
    )
    .expect("fold trains");

    assert_eq!(progress.batches, 2 * 3);
    assert_eq!(progress.fold_ends, vec![FoldStage::Final, FoldStage::Best]);
    assert_eq!(outcome.final_results.len(), 6);
    let layout = ArtifactLayout::new(dir.path());
    assert_eq!(load_results(&layout.results(7)).expect("results"), outcome.best_results);
}

#[test]
fn pathways_fold_with_attention_masks() {
    pathways_fold(true, Some(MissingModality::Genomics));
}

#[test]
fn pathways_fold_with_the_no_mask_sentinel() {
    pathways_fold(false, None);
}
