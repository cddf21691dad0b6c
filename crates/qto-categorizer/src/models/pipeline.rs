//! Feature pipeline followed by a one-vs-rest gradient boosted ensemble.
//!
//! AMOUNT is standardized, TYPE_OF_PAYMENT is one-hot encoded, DESCRIPTION and
//! MERCHANT_NAME each go through TF-IDF then truncated SVD. The concatenated
//! features feed one GBDT booster per class; the class whose booster scores
//! highest wins.

use std::fmt;
use std::sync::Arc;

use gbdt::config::Config;
use gbdt::decision_tree::{Data, DataVec};
use gbdt::gradient_boost::GBDT;
use ndarray::{concatenate, Array2, Axis};
use rayon::prelude::*;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::models::{params_of, text_column, with_params, Model, Params};
use crate::preprocessing::{
    fit_scaler, transform_all, LabelEncoder, OneHotEncoder, Scaler, TextVectorizer, TruncatedSvd,
};
use crate::schemas::{AMOUNT, DESCRIPTION, MERCHANT_NAME, TYPE_OF_PAYMENT};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineModel {
    /// Vocabulary cap of the DESCRIPTION vectorizer.
    pub max_features_desc: usize,
    /// Components kept after reducing DESCRIPTION vectors.
    pub n_components_desc: usize,
    pub max_features_merch: usize,
    pub n_components_merch: usize,
    pub random_state: u64,
    /// Boosting rounds of each one-vs-rest booster.
    pub n_estimators: usize,
    /// Depth of each boosted tree; boosted trees stay shallow.
    pub max_depth: u32,
    pub learning_rate: f32,
    /// Worker threads for per-class training, `-1` or `0` uses every core.
    pub n_jobs: i32,

    #[serde(skip)]
    #[schemars(skip)]
    fitted: Option<PipelineState>,
}

impl Default for PipelineModel {
    fn default() -> Self {
        Self {
            max_features_desc: 1000,
            n_components_desc: 50,
            max_features_merch: 500,
            n_components_merch: 30,
            random_state: 42,
            n_estimators: 100,
            max_depth: 6,
            learning_rate: 0.1,
            n_jobs: -1,
            fitted: None,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct PipelineState {
    encoder: LabelEncoder,
    amount: Scaler,
    payment: OneHotEncoder,
    desc_tfidf: TextVectorizer,
    desc_svd: TruncatedSvd,
    merch_tfidf: TextVectorizer,
    merch_svd: TruncatedSvd,
    boosters: Arc<Vec<GBDT>>,
}

impl fmt::Debug for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PipelineState")
            .field("classes", &self.encoder.classes)
            .field("payment", &self.payment.categories)
            .field("desc_vocabulary", &self.desc_tfidf.width())
            .field("merch_vocabulary", &self.merch_tfidf.width())
            .field("boosters", &self.boosters.len())
            .finish()
    }
}

fn amount_matrix(inputs: &Frame) -> Result<Array2<f32>> {
    let column = inputs.get(AMOUNT)?;
    let values = column
        .values
        .iter()
        .enumerate()
        .map(|(i, v)| {
            v.as_f64()
                .map(|x| x as f32)
                .ok_or_else(|| Error::value(format!("AMOUNT is missing or not numeric at row {}", i)))
        })
        .collect::<Result<Vec<f32>>>()?;
    Ok(Array2::from_shape_vec((values.len(), 1), values)?)
}

impl PipelineState {
    fn features(&self, inputs: &Frame) -> Result<Array2<f32>> {
        let amount = transform_all(&amount_matrix(inputs)?, &self.amount)?;
        let payment = self.payment.transform(&text_column(inputs, TYPE_OF_PAYMENT)?);
        let desc = self
            .desc_svd
            .transform(&self.desc_tfidf.transform(&text_column(inputs, DESCRIPTION)?)?);
        let merch = self
            .merch_svd
            .transform(&self.merch_tfidf.transform(&text_column(inputs, MERCHANT_NAME)?)?);
        Ok(concatenate(
            Axis(1),
            &[amount.view(), payment.view(), desc.view(), merch.view()],
        )?)
    }
}

fn to_data(x: &Array2<f32>, labels: Option<&[f32]>) -> DataVec {
    x.rows()
        .into_iter()
        .enumerate()
        .map(|(i, row)| match labels {
            Some(y) => Data::new_training_data(row.to_vec(), 1.0, y[i], None),
            None => Data::new_test_data(row.to_vec(), None),
        })
        .collect()
}

impl PipelineModel {
    fn booster_config(&self, feature_size: usize) -> Config {
        let mut config = Config::new();
        config.set_feature_size(feature_size);
        config.set_shrinkage(self.learning_rate);
        config.set_max_depth(self.max_depth);
        config.set_iterations(self.n_estimators);
        config.set_debug(false);
        config.set_training_optimization_level(2);
        config.set_loss("LogLikelyhood");
        config
    }

    fn thread_pool(&self) -> Result<rayon::ThreadPool> {
        let threads = if self.n_jobs > 0 { self.n_jobs as usize } else { 0 };
        Ok(rayon::ThreadPoolBuilder::new().num_threads(threads).build()?)
    }
}

impl Model for PipelineModel {
    fn name(&self) -> &'static str {
        "PipelineModel"
    }

    fn fit(&mut self, inputs: &Frame, targets: &[String]) -> Result<()> {
        if inputs.nrows() != targets.len() {
            return Err(Error::value(format!(
                "Found {} input rows but {} targets",
                inputs.nrows(),
                targets.len()
            )));
        }
        let encoder = LabelEncoder::fit(targets);
        let codes = encoder.transform(targets)?;

        let amount = fit_scaler(&amount_matrix(inputs)?)?;
        let payment = OneHotEncoder::fit(&text_column(inputs, TYPE_OF_PAYMENT)?);
        let descriptions = text_column(inputs, DESCRIPTION)?;
        let desc_tfidf = TextVectorizer::fit(&descriptions, self.max_features_desc)?;
        let desc_svd = TruncatedSvd::fit(
            &desc_tfidf.transform(&descriptions)?,
            self.n_components_desc,
            self.random_state,
        )?;
        let merchants = text_column(inputs, MERCHANT_NAME)?;
        let merch_tfidf = TextVectorizer::fit(&merchants, self.max_features_merch)?;
        let merch_svd = TruncatedSvd::fit(
            &merch_tfidf.transform(&merchants)?,
            self.n_components_merch,
            self.random_state,
        )?;

        let mut state = PipelineState {
            encoder,
            amount,
            payment,
            desc_tfidf,
            desc_svd,
            merch_tfidf,
            merch_svd,
            boosters: Arc::new(Vec::new()),
        };
        let x = state.features(inputs)?;
        let n_classes = state.encoder.classes.len();
        log::debug!(
            "[PipelineModel] training {} boosters on {} rows x {} features",
            if n_classes > 1 { n_classes } else { 0 },
            x.nrows(),
            x.ncols()
        );

        if n_classes > 1 {
            let pool = self.thread_pool()?;
            let config = self.booster_config(x.ncols());
            let boosters: Vec<GBDT> = pool.install(|| {
                (0..n_classes)
                    .into_par_iter()
                    .map(|class| {
                        let labels: Vec<f32> = codes
                            .iter()
                            .map(|&c| if c == class { 1.0 } else { -1.0 })
                            .collect();
                        let mut data = to_data(&x, Some(&labels));
                        let mut booster = GBDT::new(&config);
                        booster.fit(&mut data);
                        booster
                    })
                    .collect()
            });
            state.boosters = Arc::new(boosters);
        }

        self.fitted = Some(state);
        Ok(())
    }

    fn predict(&self, inputs: &Frame) -> Result<Vec<String>> {
        let state = self
            .fitted
            .as_ref()
            .ok_or_else(|| Error::NotFitted(self.name().to_string()))?;
        let n = inputs.nrows();
        if state.boosters.is_empty() {
            return state.encoder.inverse_transform(&vec![0; n]);
        }

        let data = to_data(&state.features(inputs)?, None);
        let scores: Vec<Vec<f32>> = state.boosters.iter().map(|b| b.predict(&data)).collect();
        let codes: Vec<usize> = (0..n)
            .map(|row| {
                let mut best = 0;
                for class in 1..scores.len() {
                    if scores[class][row] > scores[best][row] {
                        best = class;
                    }
                }
                best
            })
            .collect();
        state.encoder.inverse_transform(&codes)
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
