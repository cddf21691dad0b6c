//! Trainable models and the `KIND`-tagged configuration that selects one.
//!
//! Every variant implements [`Model`]. Hyperparameters are the public serde
//! fields of each variant; the fitted state lives next to them but is never
//! part of the configuration.

pub mod baseline;
pub mod pipeline;

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::frame::Frame;

pub use baseline::BaselineModel;
pub use pipeline::PipelineModel;

/// Hyperparameters by name.
pub type Params = BTreeMap<String, serde_json::Value>;

pub trait Model {
    fn name(&self) -> &'static str;

    /// Fit on `inputs` and aligned `targets`, replacing any previous fit.
    fn fit(&mut self, inputs: &Frame, targets: &[String]) -> Result<()>;

    /// Predict one label per row. Fails with `NotFitted` before `fit`.
    fn predict(&self, inputs: &Frame) -> Result<Vec<String>>;

    fn get_params(&self) -> Result<Params>;

    /// Overwrite the named hyperparameters. Unknown names are rejected and
    /// the model returns to its unfitted state.
    fn set_params(&mut self, params: &Params) -> Result<()>;

    fn is_fitted(&self) -> bool;

    /// Fitted state as JSON, for persistence.
    fn dump_state(&self) -> Result<serde_json::Value>;

    fn load_state(&mut self, state: serde_json::Value) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "KIND")]
pub enum ModelKind {
    BaselineModel(BaselineModel),
    #[serde(alias = "SKLearnPipelineModel")]
    PipelineModel(PipelineModel),
}

impl Default for ModelKind {
    fn default() -> Self {
        ModelKind::PipelineModel(PipelineModel::default())
    }
}

impl ModelKind {
    pub fn as_model(&self) -> &dyn Model {
        match self {
            ModelKind::BaselineModel(m) => m,
            ModelKind::PipelineModel(m) => m,
        }
    }

    pub fn as_model_mut(&mut self) -> &mut dyn Model {
        match self {
            ModelKind::BaselineModel(m) => m,
            ModelKind::PipelineModel(m) => m,
        }
    }
}

impl Model for ModelKind {
    fn name(&self) -> &'static str {
        self.as_model().name()
    }

    fn fit(&mut self, inputs: &Frame, targets: &[String]) -> Result<()> {
        self.as_model_mut().fit(inputs, targets)
    }

    fn predict(&self, inputs: &Frame) -> Result<Vec<String>> {
        self.as_model().predict(inputs)
    }

    fn get_params(&self) -> Result<Params> {
        self.as_model().get_params()
    }

    fn set_params(&mut self, params: &Params) -> Result<()> {
        self.as_model_mut().set_params(params)
    }

    fn is_fitted(&self) -> bool {
        self.as_model().is_fitted()
    }

    fn dump_state(&self) -> Result<serde_json::Value> {
        self.as_model().dump_state()
    }

    fn load_state(&mut self, state: serde_json::Value) -> Result<()> {
        self.as_model_mut().load_state(state)
    }
}

pub(crate) fn params_of<T: Serialize>(model: &T) -> Result<Params> {
    match serde_json::to_value(model)? {
        serde_json::Value::Object(map) => Ok(map.into_iter().collect()),
        _ => Err(Error::value("Model parameters must serialize to a mapping")),
    }
}

/// Overlay `params` on the current hyperparameters and rebuild the model.
pub(crate) fn with_params<T: Serialize + DeserializeOwned>(model: &T, name: &str, params: &Params) -> Result<T> {
    let mut current = params_of(model)?;
    for (key, value) in params {
        match current.get_mut(key) {
            Some(slot) => *slot = value.clone(),
            None => {
                return Err(Error::config(format!(
                    "Invalid parameter '{}' for model {}. Valid parameters are: {:?}",
                    key,
                    name,
                    current.keys().collect::<Vec<_>>()
                )))
            }
        }
    }
    let object: serde_json::Map<String, serde_json::Value> = current.into_iter().collect();
    serde_json::from_value(serde_json::Value::Object(object))
        .map_err(|e| Error::config(format!("Invalid parameter value for model {}: {}", name, e)))
}

/// Optional string cells of a feature column.
pub(crate) fn text_column(inputs: &Frame, name: &str) -> Result<Vec<Option<String>>> {
    Ok(inputs.get(name)?.str_values())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_kinds_and_the_legacy_alias() {
        let baseline: ModelKind = serde_json::from_str(r#"{"KIND": "BaselineModel"}"#).unwrap();
        assert!(matches!(baseline, ModelKind::BaselineModel(_)));
        let legacy: ModelKind =
            serde_json::from_str(r#"{"KIND": "SKLearnPipelineModel", "max_depth": 3}"#).unwrap();
        match legacy {
            ModelKind::PipelineModel(m) => assert_eq!(m.max_depth, 3),
            other => panic!("unexpected model {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_hyperparameters() {
        let parsed: std::result::Result<ModelKind, _> =
            serde_json::from_str(r#"{"KIND": "PipelineModel", "n_trees": 3}"#);
        assert!(parsed.is_err());

        let mut model = ModelKind::default();
        let mut params = Params::new();
        params.insert("n_trees".into(), serde_json::json!(3));
        assert!(matches!(model.set_params(&params), Err(Error::Configuration(_))));
    }

    #[test]
    fn set_params_round_trips_through_get_params() {
        let mut model = ModelKind::default();
        let mut params = Params::new();
        params.insert("max_depth".into(), serde_json::json!(5));
        model.set_params(&params).unwrap();
        assert_eq!(model.get_params().unwrap()["max_depth"], serde_json::json!(5));
    }
}
