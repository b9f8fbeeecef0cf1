use crate::batch::OmicsFormat;
use crate::forward::MissingModality;
use crate::loss::LossKind;
use crate::optim::OptimizerKind;
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Unsupported pathway collection '{0}'")]
    UnknownPathwayCollection(String),
    #[error("'{field}' must be positive, got {value}")]
    NotPositive { field: &'static str, value: f64 },
    #[error("'{field}' must be non-negative, got {value}")]
    Negative { field: &'static str, value: f64 },
    #[error("alpha_surv must lie in [0, 1], got {0}")]
    AlphaOutOfRange(f64),
}

/// Gene-set collection the omics features were grouped by. Determines the
/// omics input width handed to the model factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum PathwayCollection {
    Xena,
    Hallmarks,
    Combine,
    Multi,
    Disabled,
}

impl PathwayCollection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Xena => "xena",
            Self::Hallmarks => "hallmarks",
            Self::Combine => "combine",
            Self::Multi => "multi",
            Self::Disabled => "none",
        }
    }

    /// Number of omics features for this collection. `multi` depends on the study.
    pub fn omics_input_dim(self, study: &str) -> usize {
        match self {
            Self::Xena => 1577,
            Self::Hallmarks => 4241,
            Self::Combine => 4999,
            Self::Multi if study == "tcga_brca" => 9947,
            Self::Multi => 14933,
            Self::Disabled => 0,
        }
    }
}

impl fmt::Display for PathwayCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PathwayCollection {
    type Err = ConfigError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        match tag {
            "xena" => Ok(Self::Xena),
            "hallmarks" => Ok(Self::Hallmarks),
            "combine" => Ok(Self::Combine),
            "multi" => Ok(Self::Multi),
            "none" => Ok(Self::Disabled),
            other => Err(ConfigError::UnknownPathwayCollection(other.to_string())),
        }
    }
}

impl TryFrom<String> for PathwayCollection {
    type Error = ConfigError;

    fn try_from(tag: String) -> Result<Self, Self::Error> {
        tag.parse()
    }
}

/// Hyperparameters and selectors of one cross-validation fold.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainingConfig {
    pub omics_format: OmicsFormat,
    pub max_epochs: usize,
    /// Weight of the proxy loss.
    pub gamma: f64,
    /// Weight of the two mutual-information regularizers.
    pub sigma: f64,
    /// Extra weight on the uncensored term of the NLL survival loss.
    pub alpha_surv: f64,
    pub loss: LossKind,
    pub optimizer: OptimizerKind,
    pub lr: f64,
    /// Weight decay; ignored by plain Adam.
    pub reg: f64,
    pub batch_size: usize,
    /// Modality zeroed during per-epoch validation.
    pub missing_modality: Option<MissingModality>,
    /// A validation c-index must reach this value before a best checkpoint is written.
    pub min_c_index: f64,
    pub pathway_collection: PathwayCollection,
    pub study: String,
    pub results_dir: PathBuf,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            omics_format: OmicsFormat::Pathways,
            max_epochs: 20,
            gamma: 1.0,
            sigma: 1.0,
            alpha_surv: 0.0,
            loss: LossKind::NllSurv,
            optimizer: OptimizerKind::RAdam,
            lr: 1e-4,
            reg: 1e-5,
            batch_size: 1,
            missing_modality: None,
            min_c_index: 0.0,
            pathway_collection: PathwayCollection::Combine,
            study: "tcga_brca".to_string(),
            results_dir: PathBuf::from("results"),
        }
    }
}

impl TrainingConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&toml_string)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.lr > 0.0) {
            return Err(ConfigError::NotPositive {
                field: "lr",
                value: self.lr,
            });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::NotPositive {
                field: "batch_size",
                value: 0.0,
            });
        }
        for (field, value) in [("reg", self.reg), ("gamma", self.gamma), ("sigma", self.sigma)] {
            if !(value >= 0.0) {
                return Err(ConfigError::Negative { field, value });
            }
        }
        if !(0.0..=1.0).contains(&self.alpha_surv) {
            return Err(ConfigError::AlphaOutOfRange(self.alpha_surv));
        }
        Ok(())
    }

    pub fn omics_input_dim(&self) -> usize {
        self.pathway_collection.omics_input_dim(&self.study)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_files_fall_back_to_defaults() {
        let config: TrainingConfig = toml::from_str(
            r#"
            omics_format = "groups"
            loss = "cox_surv"
            optimizer = "adamW"
            missing_modality = "G"
            pathway_collection = "multi"
            study = "tcga_blca"
            "#,
        )
        .expect("parse");
        assert_eq!(config.omics_format, OmicsFormat::Groups);
        assert_eq!(config.loss, LossKind::CoxSurv);
        assert_eq!(config.optimizer, OptimizerKind::AdamW);
        assert_eq!(config.missing_modality, Some(MissingModality::Genomics));
        assert_eq!(config.max_epochs, TrainingConfig::default().max_epochs);
        assert_eq!(config.omics_input_dim(), 14933);
    }

    #[test]
    fn unknown_selectors_are_rejected() {
        for body in [
            r#"omics_format = "coattn""#,
            r#"loss = "rank_surv""#,
            r#"optimizer = "lamb""#,
            r#"missing_modality = "X""#,
            r#"pathway_collection = "kegg""#,
            r#"learning_rate = 0.1"#,
        ] {
            assert!(
                toml::from_str::<TrainingConfig>(body).is_err(),
                "accepted: {body}"
            );
        }
    }

    #[test]
    fn omics_width_follows_the_collection() {
        assert_eq!(PathwayCollection::Xena.omics_input_dim("tcga_brca"), 1577);
        assert_eq!(PathwayCollection::Hallmarks.omics_input_dim("x"), 4241);
        assert_eq!(PathwayCollection::Combine.omics_input_dim("x"), 4999);
        assert_eq!(PathwayCollection::Multi.omics_input_dim("tcga_brca"), 9947);
        assert_eq!(PathwayCollection::Disabled.omics_input_dim("x"), 0);
    }

    #[test]
    fn validation_bounds() {
        let config = TrainingConfig {
            alpha_surv: 1.5,
            ..TrainingConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::AlphaOutOfRange(_))
        ));
        let config = TrainingConfig {
            lr: 0.0,
            ..TrainingConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NotPositive { field: "lr", .. })
        ));
    }

    #[test]
    fn load_reads_a_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fold.toml");
        fs::write(&path, "max_epochs = 3\nlr = 0.01\n").expect("write");
        let config = TrainingConfig::load(&path).expect("load");
        assert_eq!(config.max_epochs, 3);
        assert_eq!(config.lr, 0.01);
    }
}
