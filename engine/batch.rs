//! # Multi-modal batch layouts
//!
//! A loader hands the engine one of three batch layouts, depending on how the
//! molecular features were grouped upstream:
//!
//! - `gene`: a single omics tensor per batch, no attention mask.
//! - `groups`: six omics tensors with fixed biological roles, plus a mask.
//! - `pathways`: a jagged list of pathway tensors per sample. These are stacked
//!   per pathway across samples during unpacking. The mask is optional and its
//!   absence is signalled by a sentinel whose first element equals 1.
//!
//! [`unpack`] turns any of them into an [`UnpackedBatch`] with one uniform shape.

use ndarray::{Array1, ArrayD, Axis, ShapeError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Dense n-dimensional feature tensor. The leading axis is the sample axis.
pub type Tensor = ArrayD<f64>;

/// Number of omics tensors carried by a `groups` batch.
pub const GROUP_COUNT: usize = 6;

/// One opaque clinical attribute, passed through to the results untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClinicalValue {
    Flag(bool),
    Number(f64),
    Text(String),
}

/// Clinical payload of a single sample.
pub type ClinicalRecord = BTreeMap<String, ClinicalValue>;

/// How the molecular features of a batch are grouped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum OmicsFormat {
    Gene,
    Groups,
    Pathways,
}

impl OmicsFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gene => "gene",
            Self::Groups => "groups",
            Self::Pathways => "pathways",
        }
    }
}

impl fmt::Display for OmicsFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OmicsFormat {
    type Err = BatchError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        match tag {
            "gene" => Ok(Self::Gene),
            "groups" => Ok(Self::Groups),
            "pathways" => Ok(Self::Pathways),
            other => Err(BatchError::UnsupportedOmicsFormat(other.to_string())),
        }
    }
}

impl TryFrom<String> for OmicsFormat {
    type Error = BatchError;

    fn try_from(tag: String) -> Result<Self, Self::Error> {
        tag.parse()
    }
}

/// Supervision targets of a batch, index-aligned with the sample axis.
#[derive(Debug, Clone, PartialEq)]
pub struct Targets {
    /// Discretized outcome bin per sample.
    pub labels: Array1<usize>,
    /// Observed event or censoring time.
    pub event_time: Array1<f64>,
    /// 1 = censored, 0 = event observed.
    pub censorship: Array1<f64>,
}

impl Targets {
    #[inline]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    fn check_aligned(&self) -> Result<(), BatchError> {
        let n = self.labels.len();
        if self.event_time.len() != n || self.censorship.len() != n {
            return Err(BatchError::MisalignedTargets {
                labels: n,
                event_time: self.event_time.len(),
                censorship: self.censorship.len(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct GeneBatch {
    pub wsi: Tensor,
    pub omics: Tensor,
    pub targets: Targets,
    pub clinical: Vec<ClinicalRecord>,
}

#[derive(Debug, Clone)]
pub struct GroupsBatch {
    pub wsi: Tensor,
    pub omics: [Tensor; GROUP_COUNT],
    pub targets: Targets,
    pub clinical: Vec<ClinicalRecord>,
    pub mask: Tensor,
}

#[derive(Debug, Clone)]
pub struct PathwaysBatch {
    pub wsi: Tensor,
    /// Outer index: sample. Inner index: pathway.
    pub omics: Vec<Vec<Tensor>>,
    pub targets: Targets,
    pub clinical: Vec<ClinicalRecord>,
    /// A first element equal to 1 means "no mask".
    pub mask: Tensor,
}

/// A batch as produced by a loader.
#[derive(Debug, Clone)]
pub enum Batch {
    Gene(GeneBatch),
    Groups(GroupsBatch),
    Pathways(PathwaysBatch),
}

impl Batch {
    pub fn format(&self) -> OmicsFormat {
        match self {
            Self::Gene(_) => OmicsFormat::Gene,
            Self::Groups(_) => OmicsFormat::Groups,
            Self::Pathways(_) => OmicsFormat::Pathways,
        }
    }

    pub fn targets(&self) -> &Targets {
        match self {
            Self::Gene(batch) => &batch.targets,
            Self::Groups(batch) => &batch.targets,
            Self::Pathways(batch) => &batch.targets,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.targets().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.targets().is_empty()
    }
}

/// Omics features in the shape the model consumes them.
#[derive(Debug, Clone, PartialEq)]
pub enum OmicsInput {
    /// `gene` layout.
    Single(Tensor),
    /// `groups` and `pathways` layouts, in group/pathway order.
    Grouped(Vec<Tensor>),
}

impl OmicsInput {
    pub fn tensors(&self) -> Vec<&Tensor> {
        match self {
            Self::Single(tensor) => vec![tensor],
            Self::Grouped(tensors) => tensors.iter().collect(),
        }
    }

    /// Overwrite every omics tensor with zeros, keeping shapes.
    pub fn zero_fill(&mut self) {
        match self {
            Self::Single(tensor) => tensor.fill(0.0),
            Self::Grouped(tensors) => tensors.iter_mut().for_each(|t| t.fill(0.0)),
        }
    }
}

/// Uniform view over the three batch layouts.
#[derive(Debug, Clone)]
pub struct UnpackedBatch {
    pub wsi: Tensor,
    pub mask: Option<Tensor>,
    pub targets: Targets,
    pub omics: OmicsInput,
    pub clinical: Vec<ClinicalRecord>,
}

impl UnpackedBatch {
    #[inline]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Unsupported omics type: {0}")]
    UnsupportedOmicsFormat(String),
    #[error("configured omics format is '{configured}' but the loader produced a '{found}' batch")]
    FormatMismatch {
        configured: OmicsFormat,
        found: OmicsFormat,
    },
    #[error("batch contains no samples")]
    EmptyBatch,
    #[error(
        "targets are misaligned: {labels} labels, {event_time} event times, {censorship} censorship flags"
    )]
    MisalignedTargets {
        labels: usize,
        event_time: usize,
        censorship: usize,
    },
    #[error("batch has {targets} targets but {clinical} clinical records")]
    MisalignedClinical { targets: usize, clinical: usize },
    #[error("pathway batch has {targets} targets but omics for {samples} samples")]
    MisalignedPathways { targets: usize, samples: usize },
    #[error("sample {sample} carries {found} pathways, expected {expected}")]
    PathwayCountMismatch {
        sample: usize,
        expected: usize,
        found: usize,
    },
    #[error("pathway {pathway} cannot be stacked across samples: {source}")]
    PathwayShape { pathway: usize, source: ShapeError },
    #[error("pathway mask tensor is empty")]
    EmptyMask,
}

/// Normalizes a loader batch according to the configured omics format.
///
/// The batch variant must agree with `format`; a mismatch is a configuration
/// error and is never recovered from.
pub fn unpack(format: OmicsFormat, batch: Batch) -> Result<UnpackedBatch, BatchError> {
    if batch.format() != format {
        return Err(BatchError::FormatMismatch {
            configured: format,
            found: batch.format(),
        });
    }

    let unpacked = match batch {
        Batch::Gene(GeneBatch {
            wsi,
            omics,
            targets,
            clinical,
        }) => UnpackedBatch {
            wsi,
            mask: None,
            targets,
            omics: OmicsInput::Single(omics),
            clinical,
        },
        Batch::Groups(GroupsBatch {
            wsi,
            omics,
            targets,
            clinical,
            mask,
        }) => UnpackedBatch {
            wsi,
            mask: Some(mask),
            targets,
            omics: OmicsInput::Grouped(Vec::from(omics)),
            clinical,
        },
        Batch::Pathways(PathwaysBatch {
            wsi,
            omics,
            targets,
            clinical,
            mask,
        }) => {
            if omics.len() != targets.len() {
                return Err(BatchError::MisalignedPathways {
                    targets: targets.len(),
                    samples: omics.len(),
                });
            }
            UnpackedBatch {
                wsi,
                mask: pathway_mask(mask)?,
                targets,
                omics: OmicsInput::Grouped(stack_pathways(omics)?),
                clinical,
            }
        }
    };

    unpacked.targets.check_aligned()?;
    if unpacked.targets.is_empty() {
        return Err(BatchError::EmptyBatch);
    }
    if unpacked.clinical.len() != unpacked.targets.len() {
        return Err(BatchError::MisalignedClinical {
            targets: unpacked.targets.len(),
            clinical: unpacked.clinical.len(),
        });
    }
    Ok(unpacked)
}

/// Applies the "no mask" sentinel of the pathways layout.
fn pathway_mask(mask: Tensor) -> Result<Option<Tensor>, BatchError> {
    match mask.iter().next() {
        None => Err(BatchError::EmptyMask),
        Some(&first) if first == 1.0 => Ok(None),
        Some(_) => Ok(Some(mask)),
    }
}

/// Stacks jagged per-sample pathway lists into one tensor per pathway.
///
/// The first sample opens one stack per pathway; every later sample is
/// appended to the stack with the same pathway index, along a new leading
/// sample axis.
pub fn stack_pathways(samples: Vec<Vec<Tensor>>) -> Result<Vec<Tensor>, BatchError> {
    let mut stacks: Vec<Vec<Tensor>> = Vec::new();
    for (sample, pathways) in samples.into_iter().enumerate() {
        if sample == 0 {
            stacks = pathways.into_iter().map(|pathway| vec![pathway]).collect();
            continue;
        }
        if pathways.len() != stacks.len() {
            return Err(BatchError::PathwayCountMismatch {
                sample,
                expected: stacks.len(),
                found: pathways.len(),
            });
        }
        for (stack, pathway) in stacks.iter_mut().zip(pathways) {
            stack.push(pathway);
        }
    }

    stacks
        .into_iter()
        .enumerate()
        .map(|(pathway, members)| {
            let views: Vec<_> = members.iter().map(|tensor| tensor.view()).collect();
            ndarray::stack(Axis(0), &views)
                .map_err(|source| BatchError::PathwayShape { pathway, source })
        })
        .collect()
}
