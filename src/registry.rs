//! Experiment registry: experiments, scoped runs, metrics and versioned models
//!
//! The registry is append-only. Every `log_model` call creates a new version of
//! the registered name; versions are assigned under the registry's own lock and
//! never computed by callers.

use crate::classifier::{ClassifierKind, FittedClassifier, Hyperparams, ProbabilisticClassifier};
use crate::error::Error;
use crate::preprocess::Preprocessor;
use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use ulid::Ulid;

/// Everything needed to score new customers with a trained variant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub variant_name: String,
    pub kind: ClassifierKind,
    pub hyperparameters: Hyperparams,
    pub metrics: BTreeMap<String, f64>,
    pub preprocessor: Preprocessor,
    pub classifier: FittedClassifier,
    pub trained_at: DateTime<Utc>,
    /// Filled in by the registry when the artifact is logged
    #[serde(default)]
    pub registry_version: Option<u32>,
    #[serde(default)]
    pub run_id: Option<Ulid>,
}

impl ModelArtifact {
    /// High-risk probability for raw (unimputed, unscaled) feature rows
    pub fn predict_proba(&self, columns: &[String], records: &Array2<f64>) -> crate::Result<Array1<f64>> {
        let prepared = self.preprocessor.transform(columns, records)?;
        Ok(self.classifier.predict_proba(&prepared))
    }

    pub fn read_from(path: &Path) -> crate::Result<Self> {
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Experiment {
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Finished,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredModel {
    pub name: String,
    pub version: u32,
}

/// Self-contained record of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Ulid,
    pub run_name: String,
    pub experiment: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub params: BTreeMap<String, String>,
    pub metrics: BTreeMap<String, f64>,
    pub models: Vec<RegisteredModel>,
}

impl RunRecord {
    fn new(experiment: &Experiment, run_name: &str) -> Self {
        Self {
            run_id: Ulid::new(),
            run_name: run_name.to_string(),
            experiment: experiment.name.clone(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            params: BTreeMap::new(),
            metrics: BTreeMap::new(),
            models: Vec::new(),
        }
    }
}

/// Storage backend for experiment tracking
///
/// Implementations must be safe to call from several threads; concurrent runs
/// never share parameter or metric sets.
pub trait ExperimentRegistry: Send + Sync {
    fn set_experiment(&self, name: &str) -> crate::Result<Experiment>;
    fn create_run(&self, experiment: &Experiment, run_name: &str) -> crate::Result<Ulid>;
    fn write_params(&self, run: Ulid, params: &BTreeMap<String, String>) -> crate::Result<()>;
    fn write_metrics(&self, run: Ulid, metrics: &BTreeMap<String, f64>) -> crate::Result<()>;
    /// Store `artifact` as the next version of `registered_name`
    fn register_model(&self, run: Ulid, registered_name: &str, artifact: &ModelArtifact) -> crate::Result<u32>;
    fn end_run(&self, run: Ulid, status: RunStatus) -> crate::Result<()>;
    fn run(&self, run: Ulid) -> crate::Result<RunRecord>;
    fn load_model(&self, name: &str, version: u32) -> crate::Result<ModelArtifact>;
    fn latest_version(&self, name: &str) -> crate::Result<Option<u32>>;
}

/// Open a run; it is ended as failed if dropped before [`ActiveRun::finish`]
pub fn start_run<'a>(
    registry: &'a dyn ExperimentRegistry,
    experiment: &Experiment,
    run_name: &str,
) -> crate::Result<ActiveRun<'a>> {
    let id = registry.create_run(experiment, run_name)?;
    log::debug!("started run {run_name} ({id}) in experiment {}", experiment.name);
    Ok(ActiveRun {
        registry,
        id,
        ended: false,
    })
}

pub struct ActiveRun<'a> {
    registry: &'a dyn ExperimentRegistry,
    id: Ulid,
    ended: bool,
}

impl ActiveRun<'_> {
    pub fn id(&self) -> Ulid {
        self.id
    }

    pub fn log_param(&self, key: &str, value: impl fmt::Display) -> crate::Result<()> {
        let params = BTreeMap::from([(key.to_string(), value.to_string())]);
        self.registry.write_params(self.id, &params)
    }

    pub fn log_params(&self, params: &Hyperparams) -> crate::Result<()> {
        let params = params
            .iter()
            .map(|(key, value)| (key.clone(), value.to_string()))
            .collect();
        self.registry.write_params(self.id, &params)
    }

    pub fn log_metrics(&self, metrics: &BTreeMap<String, f64>) -> crate::Result<()> {
        self.registry.write_metrics(self.id, metrics)
    }

    /// Register `artifact` under `registered_name`, returning the assigned version
    pub fn log_model(&self, artifact: &ModelArtifact, registered_name: &str) -> crate::Result<u32> {
        self.registry.register_model(self.id, registered_name, artifact)
    }

    pub fn finish(mut self) -> crate::Result<()> {
        self.ended = true;
        self.registry.end_run(self.id, RunStatus::Finished)
    }
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        if !self.ended {
            if let Err(err) = self.registry.end_run(self.id, RunStatus::Failed) {
                log::warn!("could not close run {}: {}", self.id, err);
            }
        }
    }
}

/// Copy a registered model version to a standalone JSON file
///
/// When `destination` is a directory the file is named `<name>-v<version>.json`.
pub fn export_model(
    registry: &dyn ExperimentRegistry,
    name: &str,
    version: u32,
    destination: &Path,
) -> crate::Result<PathBuf> {
    let artifact = registry.load_model(name, version)?;
    let path = if destination.is_dir() {
        destination.join(format!("{name}-v{version}.json"))
    } else {
        destination.to_path_buf()
    };
    fs::write(&path, serde_json::to_vec_pretty(&artifact)?)?;
    log::info!("exported {name} v{version} to {}", path.display());
    Ok(path)
}

fn registry_write(err: impl fmt::Display) -> Error {
    Error::RegistryWrite(err.to_string())
}

fn check_name(name: &str) -> crate::Result<()> {
    let invalid = name.trim().is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || name.chars().any(char::is_control);
    if invalid {
        return Err(Error::InvalidConfig(format!("invalid registry name {name:?}")));
    }
    Ok(())
}

fn stamp(artifact: &ModelArtifact, run: Ulid, version: u32) -> ModelArtifact {
    let mut stored = artifact.clone();
    stored.registry_version = Some(version);
    stored.run_id = Some(run);
    stored
}

#[derive(Default)]
struct MemoryState {
    experiments: BTreeSet<String>,
    runs: BTreeMap<Ulid, RunRecord>,
    models: BTreeMap<String, Vec<ModelArtifact>>,
}

/// Process-local registry, used by tests and dry runs
#[derive(Default)]
pub struct MemoryRegistry {
    state: Mutex<MemoryState>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn runs(&self) -> Vec<RunRecord> {
        self.state.lock().runs.values().cloned().collect()
    }
}

impl MemoryState {
    fn run_mut(&mut self, run: Ulid) -> crate::Result<&mut RunRecord> {
        self.runs
            .get_mut(&run)
            .ok_or_else(|| registry_write(format!("unknown run {run}")))
    }
}

impl ExperimentRegistry for MemoryRegistry {
    fn set_experiment(&self, name: &str) -> crate::Result<Experiment> {
        check_name(name)?;
        self.state.lock().experiments.insert(name.to_string());
        Ok(Experiment { name: name.to_string() })
    }

    fn create_run(&self, experiment: &Experiment, run_name: &str) -> crate::Result<Ulid> {
        let mut state = self.state.lock();
        if !state.experiments.contains(&experiment.name) {
            return Err(registry_write(format!("unknown experiment {}", experiment.name)));
        }
        let record = RunRecord::new(experiment, run_name);
        let id = record.run_id;
        state.runs.insert(id, record);
        Ok(id)
    }

    fn write_params(&self, run: Ulid, params: &BTreeMap<String, String>) -> crate::Result<()> {
        let mut state = self.state.lock();
        state.run_mut(run)?.params.extend(params.clone());
        Ok(())
    }

    fn write_metrics(&self, run: Ulid, metrics: &BTreeMap<String, f64>) -> crate::Result<()> {
        let mut state = self.state.lock();
        state.run_mut(run)?.metrics.extend(metrics.clone());
        Ok(())
    }

    fn register_model(&self, run: Ulid, registered_name: &str, artifact: &ModelArtifact) -> crate::Result<u32> {
        check_name(registered_name)?;
        let mut state = self.state.lock();
        state.run_mut(run)?;
        let versions = state.models.entry(registered_name.to_string()).or_default();
        let version = versions.len() as u32 + 1;
        versions.push(stamp(artifact, run, version));
        state.run_mut(run)?.models.push(RegisteredModel {
            name: registered_name.to_string(),
            version,
        });
        Ok(version)
    }

    fn end_run(&self, run: Ulid, status: RunStatus) -> crate::Result<()> {
        let mut state = self.state.lock();
        let record = state.run_mut(run)?;
        record.status = status;
        record.ended_at = Some(Utc::now());
        Ok(())
    }

    fn run(&self, run: Ulid) -> crate::Result<RunRecord> {
        self.state.lock().run_mut(run).map(|record| record.clone())
    }

    fn load_model(&self, name: &str, version: u32) -> crate::Result<ModelArtifact> {
        let state = self.state.lock();
        version
            .checked_sub(1)
            .and_then(|index| state.models.get(name)?.get(index as usize))
            .cloned()
            .ok_or_else(|| Error::ModelNotFound {
                name: name.to_string(),
                version,
            })
    }

    fn latest_version(&self, name: &str) -> crate::Result<Option<u32>> {
        let state = self.state.lock();
        Ok(state
            .models
            .get(name)
            .map(|versions| versions.len() as u32)
            .filter(|&count| count > 0))
    }
}

/// Registry persisted as a directory tree of JSON documents
///
/// ```text
/// <root>/experiments/<experiment>/runs/<run id>/run.json
/// <root>/models/<registered name>/<version>/model.json
/// ```
pub struct FileRegistry {
    root: PathBuf,
    /// run id -> run.json path, for runs opened by this instance
    runs: Mutex<BTreeMap<Ulid, PathBuf>>,
}

impl FileRegistry {
    pub fn open(root: impl Into<PathBuf>) -> crate::Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("experiments")).map_err(registry_write)?;
        fs::create_dir_all(root.join("models")).map_err(registry_write)?;
        Ok(Self {
            root,
            runs: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn model_dir(&self, name: &str) -> PathBuf {
        self.root.join("models").join(name)
    }

    fn versions(&self, name: &str) -> crate::Result<Vec<u32>> {
        let dir = self.model_dir(name);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry?;
            if let Some(version) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) {
                versions.push(version);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    /// Read-modify-write of a run document; callers hold the `runs` lock
    fn update_run(
        &self,
        runs: &BTreeMap<Ulid, PathBuf>,
        run: Ulid,
        update: impl FnOnce(&mut RunRecord),
    ) -> crate::Result<()> {
        let path = runs
            .get(&run)
            .ok_or_else(|| registry_write(format!("unknown run {run}")))?;
        let mut record: RunRecord = read_json(path).map_err(registry_write)?;
        update(&mut record);
        write_json(path, &record).map_err(registry_write)
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> crate::Result<T> {
    Ok(serde_json::from_slice(&fs::read(path)?)?)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> crate::Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

impl ExperimentRegistry for FileRegistry {
    fn set_experiment(&self, name: &str) -> crate::Result<Experiment> {
        check_name(name)?;
        fs::create_dir_all(self.root.join("experiments").join(name).join("runs")).map_err(registry_write)?;
        Ok(Experiment { name: name.to_string() })
    }

    fn create_run(&self, experiment: &Experiment, run_name: &str) -> crate::Result<Ulid> {
        let record = RunRecord::new(experiment, run_name);
        let dir = self
            .root
            .join("experiments")
            .join(&experiment.name)
            .join("runs")
            .join(record.run_id.to_string());
        fs::create_dir_all(&dir).map_err(registry_write)?;
        let path = dir.join("run.json");
        write_json(&path, &record).map_err(registry_write)?;
        self.runs.lock().insert(record.run_id, path);
        Ok(record.run_id)
    }

    fn write_params(&self, run: Ulid, params: &BTreeMap<String, String>) -> crate::Result<()> {
        let runs = self.runs.lock();
        self.update_run(&runs, run, |record| record.params.extend(params.clone()))
    }

    fn write_metrics(&self, run: Ulid, metrics: &BTreeMap<String, f64>) -> crate::Result<()> {
        let runs = self.runs.lock();
        self.update_run(&runs, run, |record| record.metrics.extend(metrics.clone()))
    }

    fn register_model(&self, run: Ulid, registered_name: &str, artifact: &ModelArtifact) -> crate::Result<u32> {
        check_name(registered_name)?;
        let runs = self.runs.lock();
        if !runs.contains_key(&run) {
            return Err(registry_write(format!("unknown run {run}")));
        }

        let model_dir = self.model_dir(registered_name);
        fs::create_dir_all(&model_dir).map_err(registry_write)?;
        let mut version = self.versions(registered_name).map_err(registry_write)?.last().copied().unwrap_or(0) + 1;
        // another process may claim the same number between listing and creating
        loop {
            match fs::create_dir(model_dir.join(version.to_string())) {
                Ok(()) => break,
                Err(err) if err.kind() == ErrorKind::AlreadyExists => version += 1,
                Err(err) => return Err(registry_write(err)),
            }
        }

        let path = model_dir.join(version.to_string()).join("model.json");
        write_json(&path, &stamp(artifact, run, version)).map_err(registry_write)?;
        self.update_run(&runs, run, |record| {
            record.models.push(RegisteredModel {
                name: registered_name.to_string(),
                version,
            })
        })?;
        Ok(version)
    }

    fn end_run(&self, run: Ulid, status: RunStatus) -> crate::Result<()> {
        let runs = self.runs.lock();
        self.update_run(&runs, run, |record| {
            record.status = status;
            record.ended_at = Some(Utc::now());
        })
    }

    fn run(&self, run: Ulid) -> crate::Result<RunRecord> {
        let runs = self.runs.lock();
        let path = runs
            .get(&run)
            .ok_or_else(|| Error::InvalidConfig(format!("unknown run {run}")))?;
        read_json(path)
    }

    fn load_model(&self, name: &str, version: u32) -> crate::Result<ModelArtifact> {
        check_name(name)?;
        let path = self.model_dir(name).join(version.to_string()).join("model.json");
        if !path.is_file() {
            return Err(Error::ModelNotFound {
                name: name.to_string(),
                version,
            });
        }
        read_json(&path)
    }

    fn latest_version(&self, name: &str) -> crate::Result<Option<u32>> {
        check_name(name)?;
        Ok(self.versions(name)?.last().copied())
    }
}
