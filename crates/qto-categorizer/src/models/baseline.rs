use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::models::{params_of, text_column, with_params, Model, Params};
use crate::preprocessing::LabelEncoder;
use crate::schemas::MERCHANT_NAME;

pub const DEFAULT_FALLBACK_LABEL: &str = "UNKNOWN";

fn default_fallback_label() -> String {
    DEFAULT_FALLBACK_LABEL.to_string()
}

/// Predict the most frequent category of each merchant seen during fit.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct BaselineModel {
    /// Label returned for merchants absent from the training data.
    #[serde(default = "default_fallback_label")]
    pub fallback_label: String,

    #[serde(skip)]
    #[schemars(skip)]
    fitted: Option<BaselineState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct BaselineState {
    encoder: LabelEncoder,
    lookup: BTreeMap<String, usize>,
}

impl Default for BaselineModel {
    fn default() -> Self {
        Self {
            fallback_label: default_fallback_label(),
            fitted: None,
        }
    }
}

impl BaselineModel {
    /// Merchant to label lookup of the current fit.
    pub fn lookup(&self) -> Option<BTreeMap<String, String>> {
        let state = self.fitted.as_ref()?;
        Some(
            state
                .lookup
                .iter()
                .map(|(m, &code)| (m.clone(), state.encoder.classes[code].clone()))
                .collect(),
        )
    }
}

impl Model for BaselineModel {
    fn name(&self) -> &'static str {
        "BaselineModel"
    }

    fn fit(&mut self, inputs: &Frame, targets: &[String]) -> Result<()> {
        let merchants = text_column(inputs, MERCHANT_NAME)?;
        if merchants.len() != targets.len() {
            return Err(Error::value(format!(
                "Found {} input rows but {} targets",
                merchants.len(),
                targets.len()
            )));
        }
        let encoder = LabelEncoder::fit(targets);
        let codes = encoder.transform(targets)?;

        // (merchant, label) counts in key order; null merchants are skipped.
        let mut counts: BTreeMap<(String, usize), usize> = BTreeMap::new();
        for (merchant, code) in merchants.into_iter().zip(codes) {
            if let Some(merchant) = merchant {
                *counts.entry((merchant, code)).or_default() += 1;
            }
        }
        let mut ranked: Vec<((String, usize), usize)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));

        let mut lookup = BTreeMap::new();
        for ((merchant, code), _) in ranked {
            lookup.entry(merchant).or_insert(code);
        }
        log::debug!(
            "[BaselineModel] fitted {} merchants over {} classes",
            lookup.len(),
            encoder.classes.len()
        );
        self.fitted = Some(BaselineState { encoder, lookup });
        Ok(())
    }

    fn predict(&self, inputs: &Frame) -> Result<Vec<String>> {
        let state = self
            .fitted
            .as_ref()
            .ok_or_else(|| Error::NotFitted(self.name().to_string()))?;
        let merchants = text_column(inputs, MERCHANT_NAME)?;
        merchants
            .iter()
            .map(|m| match m.as_ref().and_then(|m| state.lookup.get(m)) {
                Some(&code) => Ok(state.encoder.inverse_transform(&[code])?.remove(0)),
                None => Ok(self.fallback_label.clone()),
            })
            .collect()
    }

    fn get_params(&self) -> Result<Params> {
        params_of(self)
    }

    fn set_params(&mut self, params: &Params) -> Result<()> {
        *self = with_params(self, self.name(), params)?;
        Ok(())
    }

    fn is_fitted(&self) -> bool {
        self.fitted.is_some()
    }

    fn dump_state(&self) -> Result<serde_json::Value> {
        let state = self
            .fitted
            .as_ref()
            .ok_or_else(|| Error::NotFitted(self.name().to_string()))?;
        Ok(serde_json::to_value(state)?)
    }

    fn load_state(&mut self, state: serde_json::Value) -> Result<()> {
        self.fitted = Some(serde_json::from_value(state)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Column;

    fn merchants(values: &[Option<&str>]) -> Frame {
        Frame::new(vec![Column::strings(MERCHANT_NAME, values)]).unwrap()
    }

    fn labels(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn predicts_majority_label_and_fallback() {
        let mut model = BaselineModel::default();
        model
            .fit(
                &merchants(&[Some("A"), Some("A"), Some("A"), Some("B")]),
                &labels(&["X", "X", "Y", "Z"]),
            )
            .unwrap();
        let out = model.predict(&merchants(&[Some("A"), Some("C"), None])).unwrap();
        assert_eq!(out, vec!["X", DEFAULT_FALLBACK_LABEL, DEFAULT_FALLBACK_LABEL]);
    }

    #[test]
    fn ties_go_to_the_first_label_in_sorted_order() {
        let mut model = BaselineModel::default();
        model
            .fit(&merchants(&[Some("A"), Some("A")]), &labels(&["Y", "X"]))
            .unwrap();
        assert_eq!(model.predict(&merchants(&[Some("A")])).unwrap(), vec!["X"]);
    }

    #[test]
    fn predict_before_fit_fails() {
        let model = BaselineModel::default();
        assert!(matches!(
            model.predict(&merchants(&[Some("A")])),
            Err(Error::NotFitted(_))
        ));
    }

    #[test]
    fn refit_replaces_previous_state() {
        let mut model = BaselineModel::default();
        model.fit(&merchants(&[Some("A")]), &labels(&["X"])).unwrap();
        model.fit(&merchants(&[Some("A")]), &labels(&["Y"])).unwrap();
        assert_eq!(model.predict(&merchants(&[Some("A")])).unwrap(), vec!["Y"]);
    }

    #[test]
    fn state_survives_dump_and_load() {
        let mut model = BaselineModel::default();
        model.fit(&merchants(&[Some("A")]), &labels(&["X"])).unwrap();
        let mut restored = BaselineModel::default();
        restored.load_state(model.dump_state().unwrap()).unwrap();
        assert_eq!(restored.lookup(), model.lookup());
    }
}
