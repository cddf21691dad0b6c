//! Model persistence and registration on the tracking server.
//!
//! A saved model is a directory of run artifacts:
//!
//! - `MLmodel`: YAML descriptor with the flavor, signature and model uuid
//! - `model.json`: model configuration plus its fitted state
//! - `input_example.json`: a few input rows in `split` orientation

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::io::services::ActiveRun;
use crate::models::{Model, ModelKind};
use crate::signers::Signature;
use crate::tracking::{MlflowClient, ModelUri, ModelVersion, Tags};

pub const MLMODEL_FILE: &str = "MLmodel";
pub const MODEL_FILE: &str = "model.json";
pub const INPUT_EXAMPLE_FILE: &str = "input_example.json";
const FLAVOR: &str = "qto_categorizer";
const INPUT_EXAMPLE_ROWS: usize = 5;

/// `models:/{name}/{version_or_stage}`.
pub fn uri_for_model(model_name: &str, version_or_stage: &str) -> String {
    format!("models:/{}/{}", model_name, version_or_stage)
}

/// What [`SaverKind::save`] put on the tracking server.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInfo {
    pub artifact_path: String,
    pub model_uri: String,
    pub run_id: String,
    pub signature: Signature,
    pub model_uuid: String,
    pub utc_time_created: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct MlModel {
    artifact_path: String,
    flavors: BTreeMap<String, serde_yaml::Value>,
    model_uuid: String,
    run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    saved_input_example_info: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signature: Option<BTreeMap<String, String>>,
    utc_time_created: String,
}

/// Removes a staging directory when dropped.
struct Staging(PathBuf);

impl Staging {
    fn create(prefix: &str) -> Result<Self> {
        let dir = std::env::temp_dir().join(format!("{}-{}", prefix, uuid::Uuid::new_v4().simple()));
        fs::create_dir_all(&dir)?;
        Ok(Self(dir))
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.0) {
            log::debug!("[Registry] could not remove {}: {}", self.0.display(), e);
        }
    }
}

// ---------------------------------------------------------------------------
// Savers

fn default_model_path() -> String {
    "model".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CustomSaver {
    /// Artifact path of the model inside the run.
    #[serde(default = "default_model_path")]
    pub path: String,
}

impl Default for CustomSaver {
    fn default() -> Self {
        Self {
            path: default_model_path(),
        }
    }
}

impl CustomSaver {
    pub fn save(
        &self,
        run: &ActiveRun,
        model: &ModelKind,
        signature: &Signature,
        input_example: &Frame,
    ) -> Result<ModelInfo> {
        if !model.is_fitted() {
            return Err(Error::NotFitted(model.name().to_string()));
        }
        let staging = Staging::create("qto-model")?;
        let dir = staging.path();
        let model_uuid = uuid::Uuid::new_v4().simple().to_string();
        let utc_time_created = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string();

        let document = json!({
            "model": serde_json::to_value(model)?,
            "state": model.dump_state()?,
        });
        fs::write(dir.join(MODEL_FILE), serde_json::to_vec(&document)?)?;
        fs::write(
            dir.join(INPUT_EXAMPLE_FILE),
            serde_json::to_vec(&input_example.head(INPUT_EXAMPLE_ROWS).to_split_json())?,
        )?;

        let mut flavor = serde_yaml::Mapping::new();
        flavor.insert("model".into(), MODEL_FILE.into());
        flavor.insert("kind".into(), model.name().into());
        flavor.insert("version".into(), env!("CARGO_PKG_VERSION").into());
        let mut flavors = BTreeMap::new();
        flavors.insert(FLAVOR.to_string(), serde_yaml::Value::Mapping(flavor));
        let mut example_info = BTreeMap::new();
        example_info.insert("artifact_path".to_string(), INPUT_EXAMPLE_FILE.to_string());
        example_info.insert("type".to_string(), "dataframe".to_string());
        example_info.insert("pandas_orient".to_string(), "split".to_string());
        let descriptor = MlModel {
            artifact_path: self.path.clone(),
            flavors,
            model_uuid: model_uuid.clone(),
            run_id: run.run_id().to_string(),
            saved_input_example_info: Some(example_info),
            signature: Some(signature.to_dict()?),
            utc_time_created: utc_time_created.clone(),
        };
        fs::write(dir.join(MLMODEL_FILE), serde_yaml::to_string(&descriptor)?)?;

        run.client().tracking().log_artifacts(run.run_id(), dir, &self.path)?;
        let model_uri = format!("runs:/{}/{}", run.run_id(), self.path);
        log::info!("[CustomSaver] saved {} to {}", model.name(), model_uri);
        Ok(ModelInfo {
            artifact_path: self.path.clone(),
            model_uri,
            run_id: run.run_id().to_string(),
            signature: signature.clone(),
            model_uuid,
            utc_time_created,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "KIND")]
pub enum SaverKind {
    CustomSaver(CustomSaver),
}

impl Default for SaverKind {
    fn default() -> Self {
        SaverKind::CustomSaver(CustomSaver::default())
    }
}

impl SaverKind {
    pub fn save(
        &self,
        run: &ActiveRun,
        model: &ModelKind,
        signature: &Signature,
        input_example: &Frame,
    ) -> Result<ModelInfo> {
        match self {
            SaverKind::CustomSaver(s) => s.save(run, model, signature, input_example),
        }
    }
}

// ---------------------------------------------------------------------------
// Loaders

/// A fitted model restored from the registry.
#[derive(Debug, Clone)]
pub struct LoadedModel {
    pub model: ModelKind,
    pub signature: Option<Signature>,
    pub run_id: String,
    pub model_uuid: String,
}

impl LoadedModel {
    pub fn predict(&self, inputs: &Frame) -> Result<Vec<String>> {
        self.model.predict(inputs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CustomLoader {}

impl CustomLoader {
    pub fn load(&self, client: &MlflowClient, uri: &str) -> Result<LoadedModel> {
        let staging = Staging::create("qto-load")?;
        let dir = client.download_model(uri, staging.path())?;
        let descriptor: MlModel = serde_yaml::from_str(&fs::read_to_string(dir.join(MLMODEL_FILE))?)?;
        if !descriptor.flavors.contains_key(FLAVOR) {
            return Err(Error::value(format!(
                "Model at {} has no '{}' flavor (found {:?})",
                uri,
                FLAVOR,
                descriptor.flavors.keys().collect::<Vec<_>>()
            )));
        }
        let mut document: serde_json::Value = serde_json::from_slice(&fs::read(dir.join(MODEL_FILE))?)?;
        let config = document
            .get_mut("model")
            .map(serde_json::Value::take)
            .ok_or_else(|| Error::value(format!("{} of {} has no model configuration", MODEL_FILE, uri)))?;
        let state = document
            .get_mut("state")
            .map(serde_json::Value::take)
            .ok_or_else(|| Error::value(format!("{} of {} has no fitted state", MODEL_FILE, uri)))?;
        let mut model: ModelKind = serde_json::from_value(config)?;
        model.load_state(state)?;
        let signature = descriptor
            .signature
            .as_ref()
            .map(Signature::from_dict)
            .transpose()?;
        log::info!("[CustomLoader] loaded {} from {}", model.name(), uri);
        Ok(LoadedModel {
            model,
            signature,
            run_id: descriptor.run_id,
            model_uuid: descriptor.model_uuid,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "KIND")]
pub enum LoaderKind {
    CustomLoader(CustomLoader),
}

impl Default for LoaderKind {
    fn default() -> Self {
        LoaderKind::CustomLoader(CustomLoader::default())
    }
}

impl LoaderKind {
    pub fn load(&self, client: &MlflowClient, uri: &str) -> Result<LoadedModel> {
        match self {
            LoaderKind::CustomLoader(l) => l.load(client, uri),
        }
    }
}

// ---------------------------------------------------------------------------
// Registers

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct MlflowRegister {
    /// Tags set on each new model version.
    #[serde(default)]
    pub tags: Tags,
}

impl MlflowRegister {
    pub fn register(&self, client: &MlflowClient, name: &str, model_uri: &str) -> Result<ModelVersion> {
        let registry = client.registry();
        if registry.get_registered_model(name)?.is_none() {
            log::info!("[MlflowRegister] creating registered model '{}'", name);
            registry.create_registered_model(name, &Tags::new())?;
        }
        let run_id = match model_uri.parse::<ModelUri>()? {
            ModelUri::Run { run_id, .. } => Some(run_id),
            _ => None,
        };
        let version = registry.create_model_version(name, model_uri, run_id.as_deref(), &self.tags)?;
        log::info!(
            "[MlflowRegister] registered {} as version {} of '{}'",
            model_uri,
            version.version,
            name
        );
        Ok(version)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "KIND")]
pub enum RegisterKind {
    MlflowRegister(MlflowRegister),
}

impl Default for RegisterKind {
    fn default() -> Self {
        RegisterKind::MlflowRegister(MlflowRegister::default())
    }
}

impl RegisterKind {
    pub fn register(&self, client: &MlflowClient, name: &str, model_uri: &str) -> Result<ModelVersion> {
        match self {
            RegisterKind::MlflowRegister(r) => r.register(client, name, model_uri),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Column;
    use crate::io::services::{MlflowService, RunConfig, Service};
    use crate::models::BaselineModel;
    use crate::signers::InferSigner;
    use crate::tracking::Stage;

    fn inputs() -> Frame {
        Frame::new(vec![Column::strings(
            "MERCHANT_NAME",
            &[Some("Uber"), Some("Uber"), Some("Carrefour"), None],
        )])
        .unwrap()
    }

    fn targets() -> Vec<String> {
        ["TRANSPORT", "TRANSPORT", "FOOD", "FOOD"].iter().map(|s| s.to_string()).collect()
    }

    fn service(dir: &Path) -> MlflowService {
        let uri = dir.to_string_lossy().into_owned();
        let mut service = MlflowService {
            tracking_uri: uri.clone(),
            registry_uri: uri,
            ..MlflowService::default()
        };
        service.start().unwrap();
        service
    }

    #[test]
    fn uri_for_model_accepts_versions_and_stages() {
        assert_eq!(uri_for_model("m", "Production"), "models:/m/Production");
        assert_eq!(uri_for_model("m", "3"), "models:/m/3");
    }

    #[test]
    fn saved_model_is_registered_and_loaded_back() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let mut model = ModelKind::BaselineModel(BaselineModel::default());
        model.fit(&inputs(), &targets()).unwrap();
        let outputs = Frame::new(vec![Column::strings(
            "prediction",
            &model.predict(&inputs()).unwrap().iter().map(Some).collect::<Vec<_>>(),
        )])
        .unwrap();
        let signature = InferSigner::default().sign(&inputs(), &outputs).unwrap();

        let info = service
            .run_context(&RunConfig::named("Training"), |run| {
                SaverKind::default().save(run, &model, &signature, &inputs())
            })
            .unwrap();
        assert_eq!(info.model_uri, format!("runs:/{}/model", info.run_id));

        let client = service.client().unwrap();
        let version = RegisterKind::default()
            .register(&client, &service.registry_name, &info.model_uri)
            .unwrap();
        assert_eq!(version.version, 1);
        assert_eq!(version.run_id.as_deref(), Some(info.run_id.as_str()));
        assert_eq!(version.current_stage, Stage::None);

        let uri = uri_for_model(&service.registry_name, "1");
        let loaded = LoaderKind::default().load(&client, &uri).unwrap();
        assert_eq!(loaded.run_id, info.run_id);
        assert_eq!(loaded.model_uuid, info.model_uuid);
        assert_eq!(loaded.signature.as_ref(), Some(&signature));
        assert_eq!(loaded.predict(&inputs()).unwrap(), model.predict(&inputs()).unwrap());
    }

    #[test]
    fn unfitted_models_are_not_saved() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let model = ModelKind::BaselineModel(BaselineModel::default());
        let signature = Signature {
            inputs: Vec::new(),
            outputs: Vec::new(),
        };
        let out = service.run_context(&RunConfig::named("Training"), |run| {
            SaverKind::default().save(run, &model, &signature, &inputs())
        });
        assert!(matches!(out, Err(Error::NotFitted(_))));
    }

    #[test]
    fn loading_an_unknown_stage_fails() {
        let dir = tempfile::tempdir().unwrap();
        let client = service(dir.path()).client().unwrap();
        assert!(LoaderKind::default()
            .load(&client, &uri_for_model("missing", "Production"))
            .is_err());
    }
}
