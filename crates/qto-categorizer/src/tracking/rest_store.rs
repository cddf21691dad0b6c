//! Client for an MLflow-compatible tracking server (REST API 2.0).

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value as Json};

use super::{
    now_millis, Experiment, Metric, ModelVersion, RegisteredModel, RegistryStore, RunInfo, RunStatus, Stage,
    Tags, TrackingStore,
};
use crate::error::{Error, Result};
use crate::io::storage::{self, Location};

const API: &str = "api/2.0/mlflow";
const ARTIFACTS_API: &str = "api/2.0/mlflow-artifacts/artifacts";

#[derive(Debug, Clone)]
enum Auth {
    None,
    Bearer(String),
    Basic(String, String),
}

#[derive(Debug, Clone)]
pub struct RestStore {
    host: String,
    auth: Auth,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    error_code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct KeyValue {
    key: String,
    #[serde(default)]
    value: String,
}

fn tags_from(list: Option<&Json>) -> Tags {
    list.and_then(|l| serde_json::from_value::<Vec<KeyValue>>(l.clone()).ok())
        .unwrap_or_default()
        .into_iter()
        .map(|kv| (kv.key, kv.value))
        .collect()
}

fn tags_to(tags: &Tags) -> Json {
    Json::Array(tags.iter().map(|(k, v)| json!({ "key": k, "value": v })).collect())
}

fn str_field(obj: &Json, key: &str) -> Option<String> {
    match obj.get(key) {
        Some(Json::String(s)) => Some(s.clone()),
        Some(Json::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn int_field(obj: &Json, key: &str) -> Option<i64> {
    match obj.get(key) {
        Some(Json::Number(n)) => n.as_i64(),
        Some(Json::String(s)) => s.parse().ok(),
        _ => None,
    }
}

fn experiment_from(obj: &Json) -> Result<Experiment> {
    Ok(Experiment {
        experiment_id: str_field(obj, "experiment_id")
            .ok_or_else(|| Error::tracking("Experiment without experiment_id"))?,
        name: str_field(obj, "name").unwrap_or_default(),
        artifact_location: str_field(obj, "artifact_location").unwrap_or_default(),
    })
}

fn run_from(run: &Json) -> Result<RunInfo> {
    let info = run
        .get("info")
        .ok_or_else(|| Error::tracking("Run payload without info"))?;
    let status: RunStatus = serde_json::from_value(info.get("status").cloned().unwrap_or(json!("RUNNING")))?;
    Ok(RunInfo {
        run_id: str_field(info, "run_id")
            .or_else(|| str_field(info, "run_uuid"))
            .ok_or_else(|| Error::tracking("Run without run_id"))?,
        experiment_id: str_field(info, "experiment_id").unwrap_or_default(),
        run_name: str_field(info, "run_name"),
        status,
        start_time: int_field(info, "start_time").unwrap_or(0),
        end_time: int_field(info, "end_time"),
        artifact_uri: str_field(info, "artifact_uri").unwrap_or_default(),
    })
}

fn version_from(obj: &Json) -> Result<ModelVersion> {
    let version = int_field(obj, "version").ok_or_else(|| Error::tracking("Model version without number"))?;
    Ok(ModelVersion {
        name: str_field(obj, "name").unwrap_or_default(),
        version: version as u64,
        current_stage: str_field(obj, "current_stage")
            .unwrap_or_else(|| "None".to_string())
            .parse()?,
        source: str_field(obj, "source").unwrap_or_default(),
        run_id: str_field(obj, "run_id").filter(|s| !s.is_empty()),
        creation_timestamp: int_field(obj, "creation_timestamp").unwrap_or(0),
        last_updated_timestamp: int_field(obj, "last_updated_timestamp").unwrap_or(0),
        tags: tags_from(obj.get("tags")),
    })
}

impl RestStore {
    /// `uri` is an `http(s)://` server or `databricks`, which reads
    /// `DATABRICKS_HOST` and `DATABRICKS_TOKEN`.
    pub fn new(uri: &str) -> Result<Self> {
        let (host, auth) = if uri == "databricks" {
            let host = std::env::var("DATABRICKS_HOST")
                .map_err(|_| Error::config("DATABRICKS_HOST must be set to track on databricks"))?;
            let token = std::env::var("DATABRICKS_TOKEN")
                .map_err(|_| Error::config("DATABRICKS_TOKEN must be set to track on databricks"))?;
            (host, Auth::Bearer(token))
        } else if let Ok(token) = std::env::var("MLFLOW_TRACKING_TOKEN") {
            (uri.to_string(), Auth::Bearer(token))
        } else if let (Ok(user), Ok(password)) = (
            std::env::var("MLFLOW_TRACKING_USERNAME"),
            std::env::var("MLFLOW_TRACKING_PASSWORD"),
        ) {
            (uri.to_string(), Auth::Basic(user, password))
        } else {
            (uri.to_string(), Auth::None)
        };
        let client = Client::builder().timeout(Duration::from_secs(120)).build()?;
        Ok(Self {
            host: host.trim_end_matches('/').to_string(),
            auth,
            client,
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}/{}", self.host, API, endpoint)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            Auth::None => request,
            Auth::Bearer(token) => request.bearer_auth(token),
            Auth::Basic(user, password) => request.basic_auth(user, Some(password)),
        }
    }

    fn send(&self, request: RequestBuilder, endpoint: &str) -> Result<std::result::Result<Json, ApiError>> {
        let response = self.authorize(request).send()?;
        let status = response.status();
        let text = response.text()?;
        if status.is_success() {
            if text.trim().is_empty() {
                return Ok(Ok(json!({})));
            }
            return Ok(Ok(serde_json::from_str(&text)?));
        }
        log::debug!("[RestStore] {} failed with {}: {}", endpoint, status, text);
        let mut error: ApiError = serde_json::from_str(&text).unwrap_or(ApiError {
            error_code: String::new(),
            message: text,
        });
        if error.error_code.is_empty() {
            error.error_code = match status {
                StatusCode::NOT_FOUND => "RESOURCE_DOES_NOT_EXIST".to_string(),
                other => other.to_string(),
            };
        }
        Ok(Err(error))
    }

    fn call(&self, request: RequestBuilder, endpoint: &str) -> Result<Json> {
        self.send(request, endpoint)?.map_err(|e| {
            Error::tracking(format!("{} failed: {} {}", endpoint, e.error_code, e.message))
        })
    }

    fn get(&self, endpoint: &str, query: &[(&str, &str)]) -> Result<Json> {
        self.call(self.client.get(self.url(endpoint)).query(query), endpoint)
    }

    fn post(&self, endpoint: &str, body: Json) -> Result<Json> {
        self.call(self.client.post(self.url(endpoint)).json(&body), endpoint)
    }

    fn get_optional(&self, endpoint: &str, query: &[(&str, &str)]) -> Result<Option<Json>> {
        match self.send(self.client.get(self.url(endpoint)).query(query), endpoint)? {
            Ok(body) => Ok(Some(body)),
            Err(e) if e.error_code == "RESOURCE_DOES_NOT_EXIST" => Ok(None),
            Err(e) => Err(Error::tracking(format!(
                "{} failed: {} {}",
                endpoint, e.error_code, e.message
            ))),
        }
    }

    fn artifact_root(&self, run_id: &str) -> Result<String> {
        let info = self.get_run(run_id)?;
        if info.artifact_uri.is_empty() {
            return Err(Error::tracking(format!("Run '{}' has no artifact location", run_id)));
        }
        Ok(info.artifact_uri)
    }

    fn proxy_url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.host, ARTIFACTS_API, path.trim_start_matches('/'))
    }

    fn proxy_upload(&self, local: &Path, remote: &str) -> Result<()> {
        if local.is_dir() {
            for entry in std::fs::read_dir(local)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                self.proxy_upload(&entry.path(), &format!("{}/{}", remote, name))?;
            }
            return Ok(());
        }
        let body = std::fs::read(local)?;
        let endpoint = "mlflow-artifacts/upload";
        self.call(self.client.put(self.proxy_url(remote)).body(body), endpoint)?;
        Ok(())
    }

    fn proxy_download(&self, remote: &str, dst: &Path) -> Result<()> {
        let listing = self.call(
            self.client
                .get(format!("{}/{}", self.host, ARTIFACTS_API))
                .query(&[("path", remote)]),
            "mlflow-artifacts/list",
        )?;
        let files = listing.get("files").and_then(Json::as_array).cloned().unwrap_or_default();
        if files.is_empty() {
            let response = self.authorize(self.client.get(self.proxy_url(remote))).send()?;
            if !response.status().is_success() {
                return Err(Error::tracking(format!(
                    "Artifact '{}' download failed with {}",
                    remote,
                    response.status()
                )));
            }
            let bytes = response.bytes()?;
            storage::write_bytes(&Location::Local(dst.to_path_buf()), bytes)?;
            return Ok(());
        }
        for file in files {
            let name = str_field(&file, "path").unwrap_or_default();
            let leaf = name.rsplit('/').next().unwrap_or(&name).to_string();
            let child = format!("{}/{}", remote.trim_end_matches('/'), leaf);
            let is_dir = file.get("is_dir").and_then(Json::as_bool).unwrap_or(false);
            if is_dir {
                self.proxy_download(&child, &dst.join(&leaf))?;
            } else {
                let response = self.authorize(self.client.get(self.proxy_url(&child))).send()?;
                let bytes: Bytes = response.error_for_status()?.bytes()?;
                storage::write_bytes(&Location::Local(dst.join(&leaf)), bytes)?;
            }
        }
        Ok(())
    }
}

/// Path below the proxy root for a `mlflow-artifacts:` URI.
fn proxy_path(uri: &str) -> Option<String> {
    let rest = uri.strip_prefix("mlflow-artifacts:")?;
    let rest = rest.trim_start_matches('/');
    // mlflow-artifacts://host:port/path carries the authority first.
    if uri.starts_with("mlflow-artifacts://") {
        return Some(rest.split_once('/').map(|(_, p)| p.to_string()).unwrap_or_default());
    }
    Some(rest.to_string())
}

impl TrackingStore for RestStore {
    fn get_experiment_by_name(&self, name: &str) -> Result<Option<Experiment>> {
        match self.get_optional("experiments/get-by-name", &[("experiment_name", name)])? {
            Some(body) => {
                let exp = body
                    .get("experiment")
                    .ok_or_else(|| Error::tracking("Missing experiment in response"))?;
                Ok(Some(experiment_from(exp)?))
            }
            None => Ok(None),
        }
    }

    fn create_experiment(&self, name: &str) -> Result<String> {
        let body = self.post("experiments/create", json!({ "name": name }))?;
        str_field(&body, "experiment_id").ok_or_else(|| Error::tracking("Missing experiment_id in response"))
    }

    fn create_run(&self, experiment_id: &str, run_name: Option<&str>, tags: &Tags) -> Result<RunInfo> {
        let mut body = json!({
            "experiment_id": experiment_id,
            "start_time": now_millis(),
            "tags": tags_to(tags),
        });
        if let Some(name) = run_name {
            body["run_name"] = json!(name);
        }
        let response = self.post("runs/create", body)?;
        run_from(response.get("run").ok_or_else(|| Error::tracking("Missing run in response"))?)
    }

    fn update_run(&self, run_id: &str, status: RunStatus, end_time: Option<i64>) -> Result<RunInfo> {
        let mut body = json!({ "run_id": run_id, "status": status.as_str() });
        if let Some(end) = end_time {
            body["end_time"] = json!(end);
        }
        self.post("runs/update", body)?;
        self.get_run(run_id)
    }

    fn get_run(&self, run_id: &str) -> Result<RunInfo> {
        let body = self.get("runs/get", &[("run_id", run_id)])?;
        run_from(body.get("run").ok_or_else(|| Error::tracking("Missing run in response"))?)
    }

    fn log_metric(&self, run_id: &str, metric: &Metric) -> Result<()> {
        self.post(
            "runs/log-metric",
            json!({
                "run_id": run_id,
                "key": metric.key,
                "value": metric.value,
                "timestamp": metric.timestamp,
                "step": metric.step,
            }),
        )?;
        Ok(())
    }

    fn log_param(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        self.post(
            "runs/log-parameter",
            json!({ "run_id": run_id, "key": key, "value": value }),
        )?;
        Ok(())
    }

    fn set_tag(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        self.post("runs/set-tag", json!({ "run_id": run_id, "key": key, "value": value }))?;
        Ok(())
    }

    fn get_metric_history(&self, run_id: &str, key: &str) -> Result<Vec<Metric>> {
        let body = self.get("metrics/get-history", &[("run_id", run_id), ("metric_key", key)])?;
        let metrics = body.get("metrics").cloned().unwrap_or(json!([]));
        Ok(serde_json::from_value(metrics)?)
    }

    fn log_artifacts(&self, run_id: &str, local_dir: &Path, artifact_path: &str) -> Result<()> {
        let root = self.artifact_root(run_id)?;
        let sub = artifact_path.trim_matches('/');
        if let Some(path) = proxy_path(&root) {
            return self.proxy_upload(local_dir, &format!("{}/{}", path.trim_end_matches('/'), sub));
        }
        let base = Location::parse(&root)?.join(sub);
        let local_base = Location::Local(local_dir.to_path_buf());
        for file in storage::list_files(&local_base)? {
            let relative = file.relative_to(&local_base).unwrap_or_default();
            let target = if relative.is_empty() { base.clone() } else { base.join(&relative) };
            storage::write_bytes(&target, storage::read_bytes(&file)?)?;
        }
        Ok(())
    }

    fn download_artifacts(&self, run_id: &str, artifact_path: &str, dst: &Path) -> Result<PathBuf> {
        let root = self.artifact_root(run_id)?;
        let sub = artifact_path.trim_matches('/');
        let target = match sub.rsplit('/').next() {
            Some(leaf) if !leaf.is_empty() => dst.join(leaf),
            _ => dst.to_path_buf(),
        };
        if let Some(path) = proxy_path(&root) {
            self.proxy_download(&format!("{}/{}", path.trim_end_matches('/'), sub), &target)?;
            return Ok(target);
        }
        let base = Location::parse(&root)?.join(sub);
        let files = storage::list_files(&base)?;
        if files.is_empty() {
            return Err(Error::tracking(format!(
                "Artifact '{}' not found in run '{}'",
                artifact_path, run_id
            )));
        }
        for file in files {
            let relative = file.relative_to(&base).unwrap_or_default();
            let local = if relative.is_empty() { target.clone() } else { target.join(&relative) };
            storage::write_bytes(&Location::Local(local), storage::read_bytes(&file)?)?;
        }
        Ok(target)
    }
}

impl RegistryStore for RestStore {
    fn get_registered_model(&self, name: &str) -> Result<Option<RegisteredModel>> {
        match self.get_optional("registered-models/get", &[("name", name)])? {
            Some(body) => {
                let model = body
                    .get("registered_model")
                    .ok_or_else(|| Error::tracking("Missing registered_model in response"))?;
                Ok(Some(RegisteredModel {
                    name: str_field(model, "name").unwrap_or_default(),
                    creation_timestamp: int_field(model, "creation_timestamp").unwrap_or(0),
                    tags: tags_from(model.get("tags")),
                }))
            }
            None => Ok(None),
        }
    }

    fn create_registered_model(&self, name: &str, tags: &Tags) -> Result<RegisteredModel> {
        self.post(
            "registered-models/create",
            json!({ "name": name, "tags": tags_to(tags) }),
        )?;
        Ok(RegisteredModel {
            name: name.to_string(),
            creation_timestamp: now_millis(),
            tags: tags.clone(),
        })
    }

    fn create_model_version(&self, name: &str, source: &str, run_id: Option<&str>, tags: &Tags) -> Result<ModelVersion> {
        let mut body = json!({ "name": name, "source": source, "tags": tags_to(tags) });
        if let Some(id) = run_id {
            body["run_id"] = json!(id);
        }
        let response = self.post("model-versions/create", body)?;
        version_from(
            response
                .get("model_version")
                .ok_or_else(|| Error::tracking("Missing model_version in response"))?,
        )
    }

    fn get_model_version(&self, name: &str, version: u64) -> Result<ModelVersion> {
        let version = version.to_string();
        let body = self.get("model-versions/get", &[("name", name), ("version", &version)])?;
        version_from(
            body.get("model_version")
                .ok_or_else(|| Error::tracking("Missing model_version in response"))?,
        )
    }

    fn search_model_versions(&self, name: &str) -> Result<Vec<ModelVersion>> {
        let filter = format!("name='{}'", name.replace('\'', "\\'"));
        let body = self.get("model-versions/search", &[("filter", &filter)])?;
        let mut versions = body
            .get("model_versions")
            .and_then(Json::as_array)
            .map(|list| list.iter().map(version_from).collect::<Result<Vec<_>>>())
            .transpose()?
            .unwrap_or_default();
        versions.sort_by_key(|v| v.version);
        Ok(versions)
    }

    fn transition_model_version_stage(
        &self,
        name: &str,
        version: u64,
        stage: Stage,
        archive_existing_versions: bool,
    ) -> Result<ModelVersion> {
        let body = self.post(
            "model-versions/transition-stage",
            json!({
                "name": name,
                "version": version.to_string(),
                "stage": stage.as_str(),
                "archive_existing_versions": archive_existing_versions,
            }),
        )?;
        version_from(
            body.get("model_version")
                .ok_or_else(|| Error::tracking("Missing model_version in response"))?,
        )
    }

    fn get_latest_versions(&self, name: &str, stages: Option<&[Stage]>) -> Result<Vec<ModelVersion>> {
        let mut body = json!({ "name": name });
        if let Some(stages) = stages {
            body["stages"] = json!(stages.iter().map(Stage::as_str).collect::<Vec<_>>());
        }
        let response = self.post("registered-models/get-latest-versions", body)?;
        response
            .get("model_versions")
            .and_then(Json::as_array)
            .map(|list| list.iter().map(version_from).collect())
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_paths_drop_scheme_and_authority() {
        assert_eq!(proxy_path("mlflow-artifacts:/1/abc/artifacts").unwrap(), "1/abc/artifacts");
        assert_eq!(
            proxy_path("mlflow-artifacts://localhost:5000/1/abc/artifacts").unwrap(),
            "1/abc/artifacts"
        );
        assert!(proxy_path("s3://bucket/1/abc").is_none());
    }

    #[test]
    fn parses_model_versions_with_string_numbers() {
        let raw = json!({
            "name": "qto",
            "version": "4",
            "current_stage": "Staging",
            "source": "runs:/r/model",
            "run_id": "r",
            "tags": [{"key": "team", "value": "ml"}],
        });
        let v = version_from(&raw).unwrap();
        assert_eq!(v.version, 4);
        assert_eq!(v.current_stage, Stage::Staging);
        assert_eq!(v.tags["team"], "ml");
    }
}
