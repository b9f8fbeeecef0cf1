//! Dataset-side inputs of a fold: per-slide survival metadata, the time-bin
//! boundaries used to discretize outcomes, and the loaders that yield batches.

use crate::batch::{
    Batch, ClinicalRecord, GROUP_COUNT, GeneBatch, GroupsBatch, OmicsFormat, PathwaysBatch,
    Targets, Tensor,
};
use crate::config::TrainingConfig;
use crate::metrics::{MetricError, SurvivalData};
use ndarray::{Array1, ArrayD, Axis, IxDyn, ShapeError, concatenate};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DataError {
    #[error("could not collate {what} across the batch: {source}")]
    Collate {
        what: &'static str,
        source: ShapeError,
    },
    #[error("sample '{slide_id}' does not carry '{expected}' omics")]
    FormatMismatch {
        slide_id: String,
        expected: OmicsFormat,
    },
    #[error("pathway batch mixes samples with and without a mask")]
    MixedPathwayMasks,
    #[error("batch size must be at least 1")]
    ZeroBatchSize,
    #[error("need at least 3 bin boundaries, got {0}")]
    TooFewBins(usize),
    #[error("bin boundaries must be finite and strictly increasing: {0:?}")]
    UnsortedBins(Vec<f64>),
    #[error("cannot derive time bins without any uncensored sample")]
    NoUncensored,
    #[error("event time {0} lies outside the time bins")]
    TimeOutsideBins(f64),
    #[error("metadata columns are misaligned: {0}")]
    Misaligned(&'static str),
}

/// Per-slide outcome table of one split, in loader order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SurvivalMetadata {
    pub slide_ids: Vec<String>,
    pub labels: Array1<usize>,
    /// Continuous outcome (survival months).
    pub event_time: Array1<f64>,
    /// 1 = censored, 0 = event observed.
    pub censorship: Array1<f64>,
}

impl SurvivalMetadata {
    pub fn new(
        slide_ids: Vec<String>,
        labels: Array1<usize>,
        event_time: Array1<f64>,
        censorship: Array1<f64>,
    ) -> Result<Self, DataError> {
        let n = slide_ids.len();
        if labels.len() != n {
            return Err(DataError::Misaligned("labels"));
        }
        if event_time.len() != n {
            return Err(DataError::Misaligned("event_time"));
        }
        if censorship.len() != n {
            return Err(DataError::Misaligned("censorship"));
        }
        Ok(Self {
            slide_ids,
            labels,
            event_time,
            censorship,
        })
    }

    pub fn len(&self) -> usize {
        self.slide_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slide_ids.is_empty()
    }
}

/// Boundaries of the discrete time bins, ascending.
#[derive(Debug, Clone, PartialEq)]
pub struct BinBoundaries {
    edges: Vec<f64>,
}

impl BinBoundaries {
    pub fn new(edges: Vec<f64>) -> Result<Self, DataError> {
        if edges.len() < 3 {
            return Err(DataError::TooFewBins(edges.len()));
        }
        let increasing = edges.windows(2).all(|pair| pair[0] < pair[1]);
        if !increasing || edges.iter().any(|e| !e.is_finite()) {
            return Err(DataError::UnsortedBins(edges));
        }
        Ok(Self { edges })
    }

    /// Quantile bins over the uncensored event times, widened by `eps` to
    /// cover every time in the dataset.
    pub fn from_uncensored_quantiles(
        event_time: &[f64],
        censorship: &[f64],
        n_bins: usize,
        eps: f64,
    ) -> Result<Self, DataError> {
        if event_time.len() != censorship.len() {
            return Err(DataError::Misaligned("censorship"));
        }
        let mut uncensored: Vec<f64> = event_time
            .iter()
            .zip(censorship)
            .filter(|&(_, &c)| c < 1.0)
            .map(|(&t, _)| t)
            .collect();
        if uncensored.is_empty() {
            return Err(DataError::NoUncensored);
        }
        uncensored.sort_by(f64::total_cmp);

        let last = (uncensored.len() - 1) as f64;
        let mut edges: Vec<f64> = (0..=n_bins)
            .map(|q| {
                let position = q as f64 / n_bins as f64 * last;
                let lower = position.floor() as usize;
                let upper = (lower + 1).min(uncensored.len() - 1);
                let frac = position - lower as f64;
                uncensored[lower] + frac * (uncensored[upper] - uncensored[lower])
            })
            .collect();
        let min = event_time.iter().copied().fold(f64::INFINITY, f64::min);
        let max = event_time.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if let Some(first) = edges.first_mut() {
            *first = min - eps;
        }
        if let Some(end) = edges.last_mut() {
            *end = max + eps;
        }
        Self::new(edges)
    }

    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    pub fn n_bins(&self) -> usize {
        self.edges.len() - 1
    }

    /// Bin index of `time` with left-closed intervals; the last bin is
    /// closed on both ends.
    pub fn label_for(&self, time: f64) -> Result<usize, DataError> {
        let last = self.edges.len() - 1;
        if time < self.edges[0] || time > self.edges[last] || time.is_nan() {
            return Err(DataError::TimeOutsideBins(time));
        }
        let upper = self.edges.partition_point(|&edge| edge <= time);
        Ok(upper.saturating_sub(1).min(last - 1))
    }
}

/// Source of batches for one split.
pub trait SurvivalLoader {
    fn batches(&self) -> impl Iterator<Item = Result<Batch, DataError>> + '_;

    fn metadata(&self) -> &SurvivalMetadata;

    fn bins(&self) -> &BinBoundaries;

    /// Number of samples in the dataset (not the number of batches).
    fn len(&self) -> usize {
        self.metadata().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Omics payload of a single sample, without the batch axis.
#[derive(Debug, Clone)]
pub enum SampleOmics {
    Gene(Tensor),
    Groups {
        omics: [Tensor; GROUP_COUNT],
        mask: Tensor,
    },
    Pathways {
        omics: Vec<Tensor>,
        mask: Option<Tensor>,
    },
}

impl SampleOmics {
    fn format(&self) -> OmicsFormat {
        match self {
            Self::Gene(_) => OmicsFormat::Gene,
            Self::Groups { .. } => OmicsFormat::Groups,
            Self::Pathways { .. } => OmicsFormat::Pathways,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Sample {
    pub slide_id: String,
    /// Patch features of the slide, without the batch axis.
    pub wsi: Tensor,
    pub omics: SampleOmics,
    pub label: usize,
    pub event_time: f64,
    pub censorship: f64,
    pub clinical: ClinicalRecord,
}

/// Loader over samples held in memory, collated into fixed-size batches.
#[derive(Debug, Clone)]
pub struct InMemoryLoader {
    format: OmicsFormat,
    samples: Vec<Sample>,
    metadata: SurvivalMetadata,
    bins: BinBoundaries,
    batch_size: usize,
}

impl InMemoryLoader {
    pub fn new(
        format: OmicsFormat,
        samples: Vec<Sample>,
        bins: BinBoundaries,
        batch_size: usize,
    ) -> Result<Self, DataError> {
        if batch_size == 0 {
            return Err(DataError::ZeroBatchSize);
        }
        if let Some(sample) = samples.iter().find(|s| s.omics.format() != format) {
            return Err(DataError::FormatMismatch {
                slide_id: sample.slide_id.clone(),
                expected: format,
            });
        }
        let metadata = SurvivalMetadata::new(
            samples.iter().map(|s| s.slide_id.clone()).collect(),
            samples.iter().map(|s| s.label).collect(),
            samples.iter().map(|s| s.event_time).collect(),
            samples.iter().map(|s| s.censorship).collect(),
        )?;
        Ok(Self {
            format,
            samples,
            metadata,
            bins,
            batch_size,
        })
    }

    pub fn format(&self) -> OmicsFormat {
        self.format
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn collate(&self, chunk: &[Sample]) -> Result<Batch, DataError> {
        let wsi = stack("wsi", chunk.iter().map(|s| &s.wsi))?;
        let targets = Targets {
            labels: chunk.iter().map(|s| s.label).collect(),
            event_time: chunk.iter().map(|s| s.event_time).collect(),
            censorship: chunk.iter().map(|s| s.censorship).collect(),
        };
        let clinical = chunk.iter().map(|s| s.clinical.clone()).collect();

        let batch = match self.format {
            OmicsFormat::Gene => Batch::Gene(GeneBatch {
                wsi,
                omics: stack(
                    "gene omics",
                    chunk.iter().filter_map(|s| match &s.omics {
                        SampleOmics::Gene(omics) => Some(omics),
                        _ => None,
                    }),
                )?,
                targets,
                clinical,
            }),
            OmicsFormat::Groups => {
                let groups: Vec<(&[Tensor; GROUP_COUNT], &Tensor)> = chunk
                    .iter()
                    .filter_map(|s| match &s.omics {
                        SampleOmics::Groups { omics, mask } => Some((omics, mask)),
                        _ => None,
                    })
                    .collect();
                let mut stacked = Vec::with_capacity(GROUP_COUNT);
                for group in 0..GROUP_COUNT {
                    stacked.push(stack("omics group", groups.iter().map(|(o, _)| &o[group]))?);
                }
                let omics: [Tensor; GROUP_COUNT] = stacked
                    .try_into()
                    .map_err(|_| DataError::Misaligned("omics groups"))?;
                Batch::Groups(GroupsBatch {
                    wsi,
                    omics,
                    targets,
                    clinical,
                    mask: stack("group mask", groups.iter().map(|(_, m)| *m))?,
                })
            }
            OmicsFormat::Pathways => {
                let mut omics = Vec::with_capacity(chunk.len());
                let mut masks = Vec::with_capacity(chunk.len());
                for sample in chunk {
                    if let SampleOmics::Pathways { omics: o, mask } = &sample.omics {
                        omics.push(o.clone());
                        masks.push(mask.as_ref());
                    }
                }
                let mask = if masks.iter().all(Option::is_none) {
                    // First element 1 marks "no mask" for the unpacker.
                    ArrayD::ones(IxDyn(&[1, 1]))
                } else if masks.iter().all(Option::is_some) {
                    stack("pathway mask", masks.into_iter().flatten())?
                } else {
                    return Err(DataError::MixedPathwayMasks);
                };
                Batch::Pathways(PathwaysBatch {
                    wsi,
                    omics,
                    targets,
                    clinical,
                    mask,
                })
            }
        };
        Ok(batch)
    }
}

impl SurvivalLoader for InMemoryLoader {
    fn batches(&self) -> impl Iterator<Item = Result<Batch, DataError>> + '_ {
        self.samples
            .chunks(self.batch_size)
            .map(move |chunk| self.collate(chunk))
    }

    fn metadata(&self) -> &SurvivalMetadata {
        &self.metadata
    }

    fn bins(&self) -> &BinBoundaries {
        &self.bins
    }
}

/// Loaders of one fold. Training batches hold `config.batch_size` samples;
/// validation is collated one sample per batch.
pub fn fold_loaders(
    config: &TrainingConfig,
    train: Vec<Sample>,
    val: Vec<Sample>,
    bins: BinBoundaries,
) -> Result<(InMemoryLoader, InMemoryLoader), DataError> {
    let train_loader =
        InMemoryLoader::new(config.omics_format, train, bins.clone(), config.batch_size)?;
    let val_loader = InMemoryLoader::new(config.omics_format, val, bins, 1)?;
    Ok((train_loader, val_loader))
}

/// Stacks per-sample tensors along a new leading batch axis.
fn stack<'a>(
    what: &'static str,
    tensors: impl Iterator<Item = &'a Tensor>,
) -> Result<Tensor, DataError> {
    let views: Vec<_> = tensors.map(|t| t.view().insert_axis(Axis(0))).collect();
    concatenate(Axis(0), &views).map_err(|source| DataError::Collate { what, source })
}

/// Outcomes of the training and validation splits combined. Censoring
/// weights for validation metrics are estimated from this distribution.
pub fn survival_distribution(
    train: &SurvivalMetadata,
    val: &SurvivalMetadata,
) -> Result<SurvivalData, MetricError> {
    let censorship = concatenate(Axis(0), &[train.censorship.view(), val.censorship.view()])
        .map_err(|_| MetricError::LengthMismatch {
            what: "censorship",
            expected: train.len() + val.len(),
            found: train.censorship.len() + val.censorship.len(),
        })?;
    let event_time = concatenate(Axis(0), &[train.event_time.view(), val.event_time.view()])
        .map_err(|_| MetricError::LengthMismatch {
            what: "event_time",
            expected: train.len() + val.len(),
            found: train.event_time.len() + val.event_time.len(),
        })?;
    SurvivalData::from_censorship(censorship.view(), event_time.view())
}
