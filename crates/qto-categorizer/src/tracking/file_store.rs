//! Tracking and registry records kept as JSON files under a local root.
//!
//! ```text
//! {root}/{experiment_id}/meta.json
//! {root}/{experiment_id}/{run_id}/meta.json
//! {root}/{experiment_id}/{run_id}/{metrics,params,tags}/{key}
//! {root}/{experiment_id}/{run_id}/artifacts/...
//! {root}/models/{name}/meta.json
//! {root}/models/{name}/version-{n}/meta.json
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{
    now_millis, Experiment, Metric, ModelVersion, RegisteredModel, RegistryStore, RunInfo, RunStatus, Stage,
    Tags, TrackingStore, RUN_NAME_TAG,
};
use crate::error::{Error, Result};

const MODELS_DIR: &str = "models";
const META_FILE: &str = "meta.json";

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

/// Keys become file names, so path separators are rejected.
fn check_key(key: &str) -> Result<()> {
    if key.is_empty() || key.contains('/') || key.contains('\\') || key == "." || key == ".." {
        return Err(Error::tracking(format!("Invalid key for the file store: '{}'", key)));
    }
    Ok(())
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    if src.is_file() {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(src, dst)?;
        return Ok(());
    }
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        copy_tree(&entry.path(), &dst.join(entry.file_name()))?;
    }
    Ok(())
}

impl FileStore {
    pub fn new(uri: &str) -> Result<Self> {
        let path = uri.strip_prefix("file://").unwrap_or(uri);
        let root = PathBuf::from(path);
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn experiments(&self) -> Result<Vec<Experiment>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let meta = entry?.path().join(META_FILE);
            if meta.is_file() {
                out.push(read_json::<Experiment>(&meta)?);
            }
        }
        out.sort_by_key(|e| e.experiment_id.parse::<u64>().unwrap_or(u64::MAX));
        Ok(out)
    }

    fn run_dir(&self, run_id: &str) -> Result<PathBuf> {
        check_key(run_id)?;
        for experiment in self.experiments()? {
            let dir = self.root.join(&experiment.experiment_id).join(run_id);
            if dir.join(META_FILE).is_file() {
                return Ok(dir);
            }
        }
        Err(Error::tracking(format!("Run '{}' not found", run_id)))
    }

    fn model_dir(&self, name: &str) -> Result<PathBuf> {
        check_key(name)?;
        Ok(self.root.join(MODELS_DIR).join(name))
    }

    fn version_path(&self, name: &str, version: u64) -> Result<PathBuf> {
        Ok(self
            .model_dir(name)?
            .join(format!("version-{}", version))
            .join(META_FILE))
    }

    fn write_record(&self, run_id: &str, kind: &str, key: &str, line: &str, append: bool) -> Result<()> {
        check_key(key)?;
        let dir = self.run_dir(run_id)?.join(kind);
        fs::create_dir_all(&dir)?;
        let path = dir.join(key);
        if append {
            use std::io::Write;
            let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
            writeln!(file, "{}", line)?;
        } else {
            fs::write(path, line)?;
        }
        Ok(())
    }
}

impl TrackingStore for FileStore {
    fn get_experiment_by_name(&self, name: &str) -> Result<Option<Experiment>> {
        Ok(self.experiments()?.into_iter().find(|e| e.name == name))
    }

    fn create_experiment(&self, name: &str) -> Result<String> {
        let experiments = self.experiments()?;
        if experiments.iter().any(|e| e.name == name) {
            return Err(Error::tracking(format!("Experiment '{}' already exists", name)));
        }
        let next = experiments
            .iter()
            .filter_map(|e| e.experiment_id.parse::<u64>().ok())
            .max()
            .map(|m| m + 1)
            .unwrap_or(0);
        let id = next.to_string();
        let dir = self.root.join(&id);
        let experiment = Experiment {
            experiment_id: id.clone(),
            name: name.to_string(),
            artifact_location: dir.to_string_lossy().into_owned(),
        };
        write_json(&dir.join(META_FILE), &experiment)?;
        Ok(id)
    }

    fn create_run(&self, experiment_id: &str, run_name: Option<&str>, tags: &Tags) -> Result<RunInfo> {
        check_key(experiment_id)?;
        let exp_dir = self.root.join(experiment_id);
        if !exp_dir.join(META_FILE).is_file() {
            return Err(Error::tracking(format!("Experiment '{}' not found", experiment_id)));
        }
        let run_id = uuid::Uuid::new_v4().simple().to_string();
        let dir = exp_dir.join(&run_id);
        let info = RunInfo {
            run_id: run_id.clone(),
            experiment_id: experiment_id.to_string(),
            run_name: run_name.map(String::from),
            status: RunStatus::Running,
            start_time: now_millis(),
            end_time: None,
            artifact_uri: dir.join("artifacts").to_string_lossy().into_owned(),
        };
        write_json(&dir.join(META_FILE), &info)?;
        fs::create_dir_all(dir.join("artifacts"))?;
        for (key, value) in tags {
            self.set_tag(&run_id, key, value)?;
        }
        if let Some(name) = run_name {
            self.set_tag(&run_id, RUN_NAME_TAG, name)?;
        }
        Ok(info)
    }

    fn update_run(&self, run_id: &str, status: RunStatus, end_time: Option<i64>) -> Result<RunInfo> {
        let path = self.run_dir(run_id)?.join(META_FILE);
        let mut info: RunInfo = read_json(&path)?;
        info.status = status;
        info.end_time = end_time;
        write_json(&path, &info)?;
        Ok(info)
    }

    fn get_run(&self, run_id: &str) -> Result<RunInfo> {
        read_json(&self.run_dir(run_id)?.join(META_FILE))
    }

    fn log_metric(&self, run_id: &str, metric: &Metric) -> Result<()> {
        let line = format!("{} {} {}", metric.timestamp, metric.value, metric.step);
        self.write_record(run_id, "metrics", &metric.key, &line, true)
    }

    fn log_param(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        self.write_record(run_id, "params", key, value, false)
    }

    fn set_tag(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        self.write_record(run_id, "tags", key, value, false)
    }

    fn get_metric_history(&self, run_id: &str, key: &str) -> Result<Vec<Metric>> {
        check_key(key)?;
        let path = self.run_dir(run_id)?.join("metrics").join(key);
        if !path.is_file() {
            return Ok(Vec::new());
        }
        fs::read_to_string(path)?
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|line| {
                let parts: Vec<&str> = line.split_whitespace().collect();
                let bad = || Error::tracking(format!("Malformed metric line for '{}': {}", key, line));
                if parts.len() != 3 {
                    return Err(bad());
                }
                Ok(Metric {
                    key: key.to_string(),
                    timestamp: parts[0].parse().map_err(|_| bad())?,
                    value: parts[1].parse().map_err(|_| bad())?,
                    step: parts[2].parse().map_err(|_| bad())?,
                })
            })
            .collect()
    }

    fn log_artifacts(&self, run_id: &str, local_dir: &Path, artifact_path: &str) -> Result<()> {
        let dst = self
            .run_dir(run_id)?
            .join("artifacts")
            .join(artifact_path.trim_matches('/'));
        copy_tree(local_dir, &dst)
    }

    fn download_artifacts(&self, run_id: &str, artifact_path: &str, dst: &Path) -> Result<PathBuf> {
        let src = self
            .run_dir(run_id)?
            .join("artifacts")
            .join(artifact_path.trim_matches('/'));
        if !src.exists() {
            return Err(Error::tracking(format!(
                "Artifact '{}' not found in run '{}'",
                artifact_path, run_id
            )));
        }
        let target = match src.file_name() {
            Some(name) if !artifact_path.trim_matches('/').is_empty() => dst.join(name),
            _ => dst.to_path_buf(),
        };
        copy_tree(&src, &target)?;
        Ok(target)
    }
}

impl RegistryStore for FileStore {
    fn get_registered_model(&self, name: &str) -> Result<Option<RegisteredModel>> {
        let path = self.model_dir(name)?.join(META_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(read_json(&path)?))
    }

    fn create_registered_model(&self, name: &str, tags: &Tags) -> Result<RegisteredModel> {
        if self.get_registered_model(name)?.is_some() {
            return Err(Error::tracking(format!("Registered Model (name={}) already exists", name)));
        }
        let model = RegisteredModel {
            name: name.to_string(),
            creation_timestamp: now_millis(),
            tags: tags.clone(),
        };
        write_json(&self.model_dir(name)?.join(META_FILE), &model)?;
        Ok(model)
    }

    fn create_model_version(&self, name: &str, source: &str, run_id: Option<&str>, tags: &Tags) -> Result<ModelVersion> {
        if self.get_registered_model(name)?.is_none() {
            return Err(Error::tracking(format!("Registered Model with name={} not found", name)));
        }
        let version = self
            .search_model_versions(name)?
            .iter()
            .map(|v| v.version)
            .max()
            .unwrap_or(0)
            + 1;
        let now = now_millis();
        let record = ModelVersion {
            name: name.to_string(),
            version,
            current_stage: Stage::None,
            source: source.to_string(),
            run_id: run_id.map(String::from),
            creation_timestamp: now,
            last_updated_timestamp: now,
            tags: tags.clone(),
        };
        write_json(&self.version_path(name, version)?, &record)?;
        Ok(record)
    }

    fn get_model_version(&self, name: &str, version: u64) -> Result<ModelVersion> {
        let path = self.version_path(name, version)?;
        if !path.is_file() {
            return Err(Error::tracking(format!(
                "Model Version (name={}, version={}) not found",
                name, version
            )));
        }
        read_json(&path)
    }

    fn search_model_versions(&self, name: &str) -> Result<Vec<ModelVersion>> {
        let dir = self.model_dir(name)?;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(dir)? {
            let meta = entry?.path().join(META_FILE);
            if meta.is_file() {
                out.push(read_json::<ModelVersion>(&meta)?);
            }
        }
        out.sort_by_key(|v| v.version);
        Ok(out)
    }

    fn transition_model_version_stage(
        &self,
        name: &str,
        version: u64,
        stage: Stage,
        archive_existing_versions: bool,
    ) -> Result<ModelVersion> {
        let mut target = self.get_model_version(name, version)?;
        let now = now_millis();
        if archive_existing_versions && matches!(stage, Stage::Staging | Stage::Production) {
            for mut other in self.search_model_versions(name)? {
                if other.version != version && other.current_stage == stage {
                    other.current_stage = Stage::Archived;
                    other.last_updated_timestamp = now;
                    write_json(&self.version_path(name, other.version)?, &other)?;
                }
            }
        }
        target.current_stage = stage;
        target.last_updated_timestamp = now;
        write_json(&self.version_path(name, version)?, &target)?;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().to_str().unwrap()).unwrap();
        (dir, store)
    }

    #[test]
    fn runs_record_metrics_and_tags() {
        let (_dir, store) = store();
        let exp = store.create_experiment("exp").unwrap();
        assert_eq!(exp, "0");
        assert_eq!(store.get_experiment_by_name("exp").unwrap().unwrap().experiment_id, "0");

        let run = store.create_run(&exp, Some("Training"), &Tags::new()).unwrap();
        store
            .log_metric(
                &run.run_id,
                &Metric {
                    key: "accuracy_score".into(),
                    value: 0.75,
                    timestamp: 1,
                    step: 0,
                },
            )
            .unwrap();
        let history = store.get_metric_history(&run.run_id, "accuracy_score").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].value, 0.75);

        let done = store.update_run(&run.run_id, RunStatus::Finished, Some(2)).unwrap();
        assert_eq!(done.status, RunStatus::Finished);
        assert_eq!(store.get_run(&run.run_id).unwrap().end_time, Some(2));
    }

    #[test]
    fn versions_increment_and_transition_archives_others() {
        let (_dir, store) = store();
        store.create_registered_model("qto", &Tags::new()).unwrap();
        let v1 = store.create_model_version("qto", "runs:/a/model", Some("a"), &Tags::new()).unwrap();
        let v2 = store.create_model_version("qto", "runs:/b/model", Some("b"), &Tags::new()).unwrap();
        assert_eq!((v1.version, v2.version), (1, 2));

        store.transition_model_version_stage("qto", 1, Stage::Production, false).unwrap();
        store.transition_model_version_stage("qto", 2, Stage::Production, true).unwrap();
        assert_eq!(store.get_model_version("qto", 1).unwrap().current_stage, Stage::Archived);

        let latest = store.get_latest_versions("qto", Some(&[Stage::Production])).unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].version, 2);
    }

    #[test]
    fn rejects_keys_with_separators() {
        let (_dir, store) = store();
        assert!(store.get_registered_model("../escape").is_err());
    }
}
