//! On-disk artifacts of a fold: parameter snapshots, per-patient results and
//! the split listing. Every file is written next to its destination first and
//! renamed into place, so a crash never leaves a truncated artifact behind.

use crate::evaluate::PatientResults;
use crate::optim::StateDict;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("IO error on '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to serialize artifact: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Failed to parse artifact '{path}': {source}")]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to write split listing: {0}")]
    Csv(#[from] csv::Error),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CheckpointError + '_ {
    move |source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// File names of every artifact a fold writes under the results directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn best_checkpoint(&self, fold: usize) -> PathBuf {
        self.root.join(format!("model_best_s{fold}.toml"))
    }

    pub fn final_checkpoint(&self, fold: usize) -> PathBuf {
        self.root.join(format!("s_{fold}_checkpoint.toml"))
    }

    pub fn results(&self, fold: usize) -> PathBuf {
        self.root.join(format!("split_{fold}_results.toml"))
    }

    pub fn splits(&self, fold: usize) -> PathBuf {
        self.root.join(format!("splits_{fold}.csv"))
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Writes `contents` through a sibling temporary file and an atomic rename.
fn write_atomic(
    path: &Path,
    write: impl FnOnce(&mut BufWriter<fs::File>) -> Result<(), CheckpointError>,
) -> Result<(), CheckpointError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error(parent))?;
    }
    let staging = staging_path(path);
    let mut file = BufWriter::new(fs::File::create(&staging).map_err(io_error(&staging))?);
    write(&mut file)?;
    file.flush().map_err(io_error(&staging))?;
    drop(file);
    fs::rename(&staging, path).map_err(io_error(path))
}

fn save_toml<T: Serialize>(path: &Path, value: &T) -> Result<(), CheckpointError> {
    let toml_string = toml::to_string_pretty(value)?;
    write_atomic(path, |file| {
        file.write_all(toml_string.as_bytes()).map_err(io_error(path))
    })
}

fn load_toml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, CheckpointError> {
    let toml_string = fs::read_to_string(path).map_err(io_error(path))?;
    toml::from_str(&toml_string).map_err(|source| CheckpointError::TomlParse {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Serialize, Deserialize)]
struct StoredParameters {
    parameters: StateDict,
}

pub fn save_state_dict(path: &Path, state: &StateDict) -> Result<(), CheckpointError> {
    save_toml(
        path,
        &StoredParameters {
            parameters: state.clone(),
        },
    )
}

pub fn load_state_dict(path: &Path) -> Result<StateDict, CheckpointError> {
    let stored: StoredParameters = load_toml(path)?;
    Ok(stored.parameters)
}

pub fn save_results(path: &Path, results: &PatientResults) -> Result<(), CheckpointError> {
    save_toml(path, results)
}

pub fn load_results(path: &Path) -> Result<PatientResults, CheckpointError> {
    load_toml(path)
}

/// Writes the slide ids of both splits side by side, one row per index.
/// The shorter column is padded with empty cells.
pub fn save_splits(path: &Path, train: &[String], val: &[String]) -> Result<(), CheckpointError> {
    write_atomic(path, |file| {
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(["", "train", "val"])?;
        for row in 0..train.len().max(val.len()) {
            writer.write_record([
                row.to_string().as_str(),
                train.get(row).map_or("", String::as_str),
                val.get(row).map_or("", String::as_str),
            ])?;
        }
        writer.flush().map_err(io_error(path))?;
        Ok(())
    })
}
