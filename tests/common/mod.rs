//! Shared fixtures for the integration tests: a synthetic cohort builder and
//! a small linear hazard model implementing the engine's model contract.

use histosurv::batch::{ClinicalRecord, ClinicalValue, GROUP_COUNT, OmicsFormat, Tensor};
use histosurv::config::TrainingConfig;
use histosurv::data::{BinBoundaries, InMemoryLoader, Sample, SampleOmics, fold_loaders};
use histosurv::forward::{LossGradient, ModelError, ModelInput, ModelOutput, SurvivalModel};
use histosurv::optim::ParamStore;
use ndarray::{Array1, Array2, ArrayD, Axis, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const IB_PENALTY: f64 = 1e-3;

/// Logits are an affine function of per-sample feature means: the mean of
/// the slide tensor followed by the mean of every omics tensor.
pub struct LinearHazardModel {
    params: ParamStore,
    omics_tensors: usize,
    cached_features: Option<Array2<f64>>,
}

impl LinearHazardModel {
    pub fn new(bins: usize, omics_tensors: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let width = 1 + omics_tensors;
        let weight = ArrayD::from_shape_fn(IxDyn(&[bins, width]), |_| rng.gen_range(-0.05..0.05));
        let mut params = ParamStore::new();
        params.insert("hazard.weight", weight);
        params.insert("hazard.bias", ArrayD::zeros(IxDyn(&[bins])));
        Self {
            params,
            omics_tensors,
            cached_features: None,
        }
    }

    fn weight(&self) -> Result<Array2<f64>, ModelError> {
        let param = self
            .params
            .get("hazard.weight")
            .ok_or_else(|| ModelError::Forward("missing hazard.weight".into()))?;
        Ok(param.value.clone().into_dimensionality()?)
    }

    fn bias(&self) -> Result<Array1<f64>, ModelError> {
        let param = self
            .params
            .get("hazard.bias")
            .ok_or_else(|| ModelError::Forward("missing hazard.bias".into()))?;
        Ok(param.value.clone().into_dimensionality()?)
    }

    fn features(&self, input: &ModelInput<'_>) -> Result<Array2<f64>, ModelError> {
        let omics = input.omics.tensors();
        if omics.len() != self.omics_tensors {
            return Err(ModelError::Forward(format!(
                "expected {} omics tensors, got {}",
                self.omics_tensors,
                omics.len()
            )));
        }
        let n = input.wsi.shape()[0];
        let mut features = Array2::zeros((n, 1 + omics.len()));
        for i in 0..n {
            features[[i, 0]] = input.wsi.index_axis(Axis(0), i).mean().unwrap_or(0.0);
            for (j, tensor) in omics.iter().enumerate() {
                features[[i, j + 1]] = tensor.index_axis(Axis(0), i).mean().unwrap_or(0.0);
            }
        }
        Ok(features)
    }

    fn output(&self, features: &Array2<f64>) -> Result<ModelOutput, ModelError> {
        let weight = self.weight()?;
        let logits = features.dot(&weight.t()) + &self.bias()?;
        Ok(ModelOutput {
            logits,
            ib_loss: IB_PENALTY * weight.mapv(|w| w * w).sum(),
            proxy_loss: 0.0,
            mi_loss: 0.0,
            mi_loss_aux: 0.0,
        })
    }
}

impl SurvivalModel for LinearHazardModel {
    fn forward(&mut self, input: ModelInput<'_>) -> Result<ModelOutput, ModelError> {
        let features = self.features(&input)?;
        let output = self.output(&features)?;
        self.cached_features = Some(features);
        Ok(output)
    }

    fn predict(&self, input: ModelInput<'_>) -> Result<ModelOutput, ModelError> {
        let features = self.features(&input)?;
        self.output(&features)
    }

    fn backward(&mut self, gradient: &LossGradient) -> Result<(), ModelError> {
        let features = self
            .cached_features
            .take()
            .ok_or(ModelError::NoForwardState)?;
        let weight = self.weight()?;
        let grad_weight =
            gradient.logits.t().dot(&features) + weight * (2.0 * IB_PENALTY * gradient.ib_weight);
        let grad_bias = gradient.logits.sum_axis(Axis(0));

        for (name, grad) in [
            ("hazard.weight", grad_weight.into_dyn()),
            ("hazard.bias", grad_bias.into_dyn()),
        ] {
            let param = self
                .params
                .get_mut(name)
                .ok_or_else(|| ModelError::Backward(format!("missing {name}")))?;
            param.grad += &grad;
        }
        Ok(())
    }

    fn params(&self) -> &ParamStore {
        &self.params
    }

    fn params_mut(&mut self) -> &mut ParamStore {
        &mut self.params
    }
}

/// Widths of the six omics groups of a `groups` cohort.
pub const GROUP_WIDTHS: [usize; GROUP_COUNT] = [2, 3, 4, 5, 6, 7];

/// Widths of the pathway tensors of a `pathways` cohort.
pub const PATHWAY_WIDTHS: [usize; 3] = [5, 3, 4];

/// Builder for synthetic cohorts where the slide features carry a noisy
/// signal of the event time.
pub struct SyntheticCohortBuilder {
    n_samples: usize,
    format: OmicsFormat,
    pathway_mask: bool,
    censored_fraction: f64,
    max_time: f64,
    noise: f64,
    prefix: String,
    seed: u64,
}

impl SyntheticCohortBuilder {
    pub fn new(n_samples: usize) -> Self {
        Self {
            n_samples,
            format: OmicsFormat::Gene,
            pathway_mask: false,
            censored_fraction: 0.3,
            max_time: 120.0,
            noise: 0.05,
            prefix: "TCGA-AA".to_string(),
            seed: 42,
        }
    }

    pub fn with_format(mut self, format: OmicsFormat) -> Self {
        self.format = format;
        self
    }

    /// Pathway samples carry a real attention mask instead of none.
    pub fn with_pathway_mask(mut self, masked: bool) -> Self {
        self.pathway_mask = masked;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    pub fn with_censored_fraction(mut self, fraction: f64) -> Self {
        self.censored_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    fn omics(&self, rng: &mut StdRng) -> SampleOmics {
        let mut noise = |width: usize| -> Tensor {
            ArrayD::from_shape_fn(IxDyn(&[width]), |_| rng.gen_range(-1.0..1.0))
        };
        match self.format {
            OmicsFormat::Gene => SampleOmics::Gene(noise(6)),
            OmicsFormat::Groups => SampleOmics::Groups {
                omics: GROUP_WIDTHS.map(&mut noise),
                mask: ArrayD::zeros(IxDyn(&[GROUP_COUNT])),
            },
            OmicsFormat::Pathways => {
                let omics = PATHWAY_WIDTHS.iter().map(|&w| noise(w)).collect();
                // Leading zero so the collated mask is not read as "no mask".
                let mask = self.pathway_mask.then(|| {
                    ArrayD::from_shape_fn(IxDyn(&[PATHWAY_WIDTHS.len()]), |i| (i[0] % 2) as f64)
                });
                SampleOmics::Pathways { omics, mask }
            }
        }
    }

    /// Raw outcomes and features, before discretization.
    pub fn build(self) -> Vec<Sample> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        (0..self.n_samples)
            .map(|i| {
                let event_time = rng.gen_range(1.0..self.max_time);
                // Every third sample is observed so each cohort has events.
                let censored = i % 3 != 0 && rng.gen_range(0.0..1.0) < self.censored_fraction;
                let signal = 1.0 - event_time / self.max_time;
                let noise = self.noise;
                let wsi = ArrayD::from_shape_fn(IxDyn(&[4, 3]), |_| {
                    signal + rng.gen_range(-noise..noise)
                });
                let omics = self.omics(&mut rng);
                let mut clinical = ClinicalRecord::new();
                clinical.insert("age".into(), ClinicalValue::Number(40.0 + i as f64));
                clinical.insert("stage".into(), ClinicalValue::Text(format!("T{}", 1 + i % 4)));
                Sample {
                    slide_id: format!("{}-{:04}-01Z-00-DX1", self.prefix, i),
                    wsi,
                    omics,
                    label: 0,
                    event_time,
                    censorship: if censored { 1.0 } else { 0.0 },
                    clinical,
                }
            })
            .collect()
    }
}

/// Quantile bins over both splits, and each split labelled against them.
pub fn discretize(
    train: Vec<Sample>,
    val: Vec<Sample>,
    n_bins: usize,
) -> (Vec<Sample>, Vec<Sample>, BinBoundaries) {
    let all: Vec<&Sample> = train.iter().chain(val.iter()).collect();
    let times: Vec<f64> = all.iter().map(|s| s.event_time).collect();
    let censorship: Vec<f64> = all.iter().map(|s| s.censorship).collect();
    let bins = BinBoundaries::from_uncensored_quantiles(&times, &censorship, n_bins, 1e-6)
        .expect("bins");
    let label = |mut sample: Sample| {
        sample.label = bins.label_for(sample.event_time).expect("label");
        sample
    };
    let train = train.into_iter().map(label).collect();
    let val = val.into_iter().map(label).collect();
    (train, val, bins)
}

/// Training cohort TCGA-TR and a more heavily censored validation cohort
/// TCGA-VA, batched the way `config` asks.
fn cohort_loaders(
    config: &TrainingConfig,
    train_samples: usize,
    val_samples: usize,
    pathway_mask: bool,
) -> (InMemoryLoader, InMemoryLoader) {
    let train = SyntheticCohortBuilder::new(train_samples)
        .with_format(config.omics_format)
        .with_pathway_mask(pathway_mask)
        .with_prefix("TCGA-TR")
        .with_seed(7)
        .build();
    let val = SyntheticCohortBuilder::new(val_samples)
        .with_format(config.omics_format)
        .with_pathway_mask(pathway_mask)
        .with_prefix("TCGA-VA")
        .with_censored_fraction(0.5)
        .with_seed(11)
        .build();
    let (train, val, bins) = discretize(train, val, 4);
    fold_loaders(config, train, val, bins).expect("fold loaders")
}

pub fn gene_loaders(
    config: &TrainingConfig,
    train_samples: usize,
    val_samples: usize,
) -> (InMemoryLoader, InMemoryLoader) {
    assert_eq!(config.omics_format, OmicsFormat::Gene);
    cohort_loaders(config, train_samples, val_samples, false)
}

pub fn groups_loaders(
    config: &TrainingConfig,
    train_samples: usize,
    val_samples: usize,
) -> (InMemoryLoader, InMemoryLoader) {
    assert_eq!(config.omics_format, OmicsFormat::Groups);
    cohort_loaders(config, train_samples, val_samples, false)
}

pub fn pathways_loaders(
    config: &TrainingConfig,
    train_samples: usize,
    val_samples: usize,
    masked: bool,
) -> (InMemoryLoader, InMemoryLoader) {
    assert_eq!(config.omics_format, OmicsFormat::Pathways);
    cohort_loaders(config, train_samples, val_samples, masked)
}
