//! Experiment tracking and model registry client.
//!
//! Two backends sit behind the same traits: a local file store (a path or a
//! `file://` URI) and an MLflow-compatible tracking server (`http(s)://` or
//! `databricks`). [`MlflowClient`] pairs a tracking store with a registry
//! store and adds URI resolution for `runs:/` and `models:/` artifacts.

pub mod file_store;
pub mod rest_store;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use file_store::FileStore;
pub use rest_store::RestStore;

pub type Tags = BTreeMap<String, String>;

/// Tag holding the run name.
pub const RUN_NAME_TAG: &str = "mlflow.runName";
/// Tag holding the run description.
pub const NOTE_TAG: &str = "mlflow.note.content";

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Running,
    Scheduled,
    Finished,
    Failed,
    Killed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Scheduled => "SCHEDULED",
            RunStatus::Finished => "FINISHED",
            RunStatus::Failed => "FAILED",
            RunStatus::Killed => "KILLED",
        }
    }
}

/// Registry lifecycle stage of a model version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub enum Stage {
    None,
    Staging,
    Production,
    Archived,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::None => "None",
            Stage::Staging => "Staging",
            Stage::Production => "Production",
            Stage::Archived => "Archived",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Stage::None),
            "staging" => Ok(Stage::Staging),
            "production" => Ok(Stage::Production),
            "archived" => Ok(Stage::Archived),
            _ => Err(Error::value(format!(
                "Invalid Model Version stage: {}. Value must be one of None, Staging, Production, Archived.",
                s
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub experiment_id: String,
    pub name: String,
    pub artifact_location: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: String,
    pub experiment_id: String,
    pub run_name: Option<String>,
    pub status: RunStatus,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub artifact_uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub key: String,
    pub value: f64,
    pub timestamp: i64,
    #[serde(default)]
    pub step: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredModel {
    pub name: String,
    pub creation_timestamp: i64,
    #[serde(default)]
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub name: String,
    pub version: u64,
    pub current_stage: Stage,
    pub source: String,
    pub run_id: Option<String>,
    pub creation_timestamp: i64,
    pub last_updated_timestamp: i64,
    #[serde(default)]
    pub tags: Tags,
}

/// Runs, metrics, params, tags and artifacts.
pub trait TrackingStore: Send + Sync {
    fn get_experiment_by_name(&self, name: &str) -> Result<Option<Experiment>>;

    fn create_experiment(&self, name: &str) -> Result<String>;

    fn create_run(&self, experiment_id: &str, run_name: Option<&str>, tags: &Tags) -> Result<RunInfo>;

    fn update_run(&self, run_id: &str, status: RunStatus, end_time: Option<i64>) -> Result<RunInfo>;

    fn get_run(&self, run_id: &str) -> Result<RunInfo>;

    fn log_metric(&self, run_id: &str, metric: &Metric) -> Result<()>;

    fn log_param(&self, run_id: &str, key: &str, value: &str) -> Result<()>;

    fn set_tag(&self, run_id: &str, key: &str, value: &str) -> Result<()>;

    fn get_metric_history(&self, run_id: &str, key: &str) -> Result<Vec<Metric>>;

    /// Copy the files of `local_dir` under `artifact_path` of the run.
    fn log_artifacts(&self, run_id: &str, local_dir: &Path, artifact_path: &str) -> Result<()>;

    /// Copy `artifact_path` of the run into `dst` and return the local path.
    fn download_artifacts(&self, run_id: &str, artifact_path: &str, dst: &Path) -> Result<PathBuf>;
}

/// Registered models and their versions.
pub trait RegistryStore: Send + Sync {
    fn get_registered_model(&self, name: &str) -> Result<Option<RegisteredModel>>;

    fn create_registered_model(&self, name: &str, tags: &Tags) -> Result<RegisteredModel>;

    fn create_model_version(&self, name: &str, source: &str, run_id: Option<&str>, tags: &Tags) -> Result<ModelVersion>;

    fn get_model_version(&self, name: &str, version: u64) -> Result<ModelVersion>;

    fn search_model_versions(&self, name: &str) -> Result<Vec<ModelVersion>>;

    fn transition_model_version_stage(
        &self,
        name: &str,
        version: u64,
        stage: Stage,
        archive_existing_versions: bool,
    ) -> Result<ModelVersion>;

    /// Highest version of each requested stage (all stages when `None`).
    fn get_latest_versions(&self, name: &str, stages: Option<&[Stage]>) -> Result<Vec<ModelVersion>> {
        let mut latest: BTreeMap<Stage, ModelVersion> = BTreeMap::new();
        for v in self.search_model_versions(name)? {
            if stages.map(|s| s.contains(&v.current_stage)).unwrap_or(true) {
                match latest.get(&v.current_stage) {
                    Some(prev) if prev.version >= v.version => {}
                    _ => {
                        latest.insert(v.current_stage, v);
                    }
                }
            }
        }
        Ok(latest.into_values().collect())
    }
}

/// Build the store for a tracking or registry URI.
pub fn open_store(uri: &str) -> Result<Arc<dyn Store>> {
    if uri.starts_with("http://") || uri.starts_with("https://") || uri == "databricks" {
        Ok(Arc::new(RestStore::new(uri)?))
    } else if uri.contains("://") && !uri.starts_with("file://") {
        Err(Error::config(format!(
            "Unsupported tracking URI scheme: {}. Use a local path, file://, http(s):// or databricks",
            uri
        )))
    } else {
        Ok(Arc::new(FileStore::new(uri)?))
    }
}

/// A backend that is both a tracking and a registry store.
pub trait Store: TrackingStore + RegistryStore {
    fn as_tracking(&self) -> &dyn TrackingStore;

    fn as_registry(&self) -> &dyn RegistryStore;
}

impl<T: TrackingStore + RegistryStore> Store for T {
    fn as_tracking(&self) -> &dyn TrackingStore {
        self
    }

    fn as_registry(&self) -> &dyn RegistryStore {
        self
    }
}

/// Parsed `runs:/` or `models:/` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelUri {
    Run { run_id: String, path: String },
    Version { name: String, version: u64 },
    Stage { name: String, stage: Stage },
    Latest { name: String },
}

impl FromStr for ModelUri {
    type Err = Error;

    fn from_str(uri: &str) -> Result<Self> {
        if let Some(rest) = uri.strip_prefix("runs:/") {
            let rest = rest.trim_start_matches('/');
            let (run_id, path) = rest.split_once('/').unwrap_or((rest, ""));
            if run_id.is_empty() {
                return Err(Error::value(format!("Invalid runs URI: {}", uri)));
            }
            return Ok(ModelUri::Run {
                run_id: run_id.to_string(),
                path: path.trim_matches('/').to_string(),
            });
        }
        if let Some(rest) = uri.strip_prefix("models:/") {
            let rest = rest.trim_start_matches('/');
            let (name, suffix) = rest
                .rsplit_once('/')
                .ok_or_else(|| Error::value(format!("Invalid models URI: {}", uri)))?;
            if name.is_empty() || suffix.is_empty() {
                return Err(Error::value(format!("Invalid models URI: {}", uri)));
            }
            if suffix == "latest" {
                return Ok(ModelUri::Latest { name: name.to_string() });
            }
            if let Ok(version) = suffix.parse::<u64>() {
                return Ok(ModelUri::Version {
                    name: name.to_string(),
                    version,
                });
            }
            return Ok(ModelUri::Stage {
                name: name.to_string(),
                stage: suffix.parse()?,
            });
        }
        Err(Error::value(format!(
            "Unsupported model URI: {}. Expected runs:/ or models:/",
            uri
        )))
    }
}

/// Tracking plus registry access.
#[derive(Clone)]
pub struct MlflowClient {
    tracking: Arc<dyn Store>,
    registry: Arc<dyn Store>,
    tracking_uri: String,
    registry_uri: String,
}

impl fmt::Debug for MlflowClient {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MlflowClient")
            .field("tracking_uri", &self.tracking_uri)
            .field("registry_uri", &self.registry_uri)
            .finish()
    }
}

impl MlflowClient {
    pub fn new(tracking_uri: &str, registry_uri: &str) -> Result<Self> {
        let tracking = open_store(tracking_uri)?;
        let registry = if registry_uri == tracking_uri {
            tracking.clone()
        } else {
            open_store(registry_uri)?
        };
        Ok(Self {
            tracking,
            registry,
            tracking_uri: tracking_uri.to_string(),
            registry_uri: registry_uri.to_string(),
        })
    }

    pub fn tracking_uri(&self) -> &str {
        &self.tracking_uri
    }

    pub fn registry_uri(&self) -> &str {
        &self.registry_uri
    }

    pub fn tracking(&self) -> &dyn TrackingStore {
        self.tracking.as_tracking()
    }

    pub fn registry(&self) -> &dyn RegistryStore {
        self.registry.as_registry()
    }

    pub fn get_or_create_experiment(&self, name: &str) -> Result<String> {
        match self.tracking.get_experiment_by_name(name)? {
            Some(e) => Ok(e.experiment_id),
            None => {
                log::info!("[Tracking] creating experiment '{}'", name);
                self.tracking.create_experiment(name)
            }
        }
    }

    pub fn log_metric(&self, run_id: &str, key: &str, value: f64) -> Result<()> {
        self.tracking.log_metric(
            run_id,
            &Metric {
                key: key.to_string(),
                value,
                timestamp: now_millis(),
                step: 0,
            },
        )
    }

    pub fn transition_model_version_stage(
        &self,
        name: &str,
        version: u64,
        stage: Stage,
        archive_existing_versions: bool,
    ) -> Result<ModelVersion> {
        self.registry
            .transition_model_version_stage(name, version, stage, archive_existing_versions)
    }

    /// Resolve a model URI to the run and artifact path that hold it.
    pub fn resolve(&self, uri: &str) -> Result<(String, String)> {
        let version = match uri.parse::<ModelUri>()? {
            ModelUri::Run { run_id, path } => return Ok((run_id, path)),
            ModelUri::Version { name, version } => self.registry.get_model_version(&name, version)?,
            ModelUri::Stage { name, stage } => self
                .registry
                .get_latest_versions(&name, Some(&[stage][..]))?
                .into_iter()
                .max_by_key(|v| v.version)
                .ok_or_else(|| {
                    Error::tracking(format!("No versions of model '{}' in stage {}", name, stage))
                })?,
            ModelUri::Latest { name } => self
                .registry
                .search_model_versions(&name)?
                .into_iter()
                .max_by_key(|v| v.version)
                .ok_or_else(|| Error::tracking(format!("Model '{}' has no versions", name)))?,
        };
        match version.source.parse::<ModelUri>() {
            Ok(ModelUri::Run { run_id, path }) => Ok((run_id, path)),
            _ => match version.run_id {
                Some(run_id) => Ok((run_id, version.source)),
                None => Err(Error::tracking(format!(
                    "Model version {} of '{}' has no run source: {}",
                    version.version, version.name, version.source
                ))),
            },
        }
    }

    /// Download the artifacts behind a model URI into `dst`.
    pub fn download_model(&self, uri: &str, dst: &Path) -> Result<PathBuf> {
        let (run_id, path) = self.resolve(uri)?;
        log::debug!("[Tracking] downloading {} from run {} ({})", path, run_id, uri);
        self.tracking.download_artifacts(&run_id, &path, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_model_uris() {
        assert_eq!(
            "runs:/abc/model".parse::<ModelUri>().unwrap(),
            ModelUri::Run {
                run_id: "abc".into(),
                path: "model".into()
            }
        );
        assert_eq!(
            "models:/qto/3".parse::<ModelUri>().unwrap(),
            ModelUri::Version {
                name: "qto".into(),
                version: 3
            }
        );
        assert_eq!(
            "models:/qto/production".parse::<ModelUri>().unwrap(),
            ModelUri::Stage {
                name: "qto".into(),
                stage: Stage::Production
            }
        );
        assert!("models:/qto/Shipping".parse::<ModelUri>().is_err());
        assert!("s3://bucket/model".parse::<ModelUri>().is_err());
    }

    #[test]
    fn stage_names_are_canonical() {
        assert_eq!("STAGING".parse::<Stage>().unwrap(), Stage::Staging);
        assert_eq!(Stage::Archived.to_string(), "Archived");
    }
}
