use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::frame::{Column, Frame, Value};
use crate::io::datasets::{Reader, ReaderKind};
use crate::io::registries::{RegisterKind, SaverKind};
use crate::io::services::{AwsService, LoggerService, MlflowService, RunConfig};
use crate::jobs::{insert, Job, JobContext, Locals};
use crate::metrics::{MetricKind, ScoringMetric};
use crate::models::{Model, ModelKind};
use crate::schemas::{
    feat_inputs_schema, targets_schema, AMOUNT, CATEGORY, DESCRIPTION, MERCHANT_NAME, PREDICTION,
    TYPE_OF_PAYMENT,
};
use crate::signers::SignerKind;
use crate::splitters::{Splitter, SplitterKind};

/// Columns the model is trained on.
pub const FEATURES: [&str; 4] = [AMOUNT, TYPE_OF_PAYMENT, MERCHANT_NAME, DESCRIPTION];

pub const MISSING_MERCHANT: &str = "No merchant";
pub const MISSING_DESCRIPTION: &str = "No Description";
pub const MISSING_PAYMENT_TYPE: &str = "No type payment";

fn default_run_config() -> RunConfig {
    RunConfig::named("Training")
}

fn default_scorers() -> Vec<MetricKind> {
    vec![MetricKind::ScoringMetric(ScoringMetric::new("accuracy_score", true))]
}

/// Train, evaluate and register one model.
///
/// The model is scored on a holdout split, then refit on every row before it
/// is saved, so the registered model has seen the test rows too.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct TrainingJob {
    #[serde(default)]
    pub logger_service: LoggerService,
    #[serde(default)]
    pub aws_service: AwsService,
    #[serde(default)]
    pub mlflow_service: MlflowService,

    #[serde(default = "default_run_config")]
    pub run_config: RunConfig,
    pub inputs: ReaderKind,
    pub model: ModelKind,
    #[serde(default = "default_scorers")]
    pub scorers: Vec<MetricKind>,
    #[serde(default)]
    pub splitter: SplitterKind,
    #[serde(default)]
    pub saver: SaverKind,
    #[serde(default)]
    pub signer: SignerKind,
    #[serde(default)]
    pub registry: RegisterKind,
}

/// Replace missing text features with their named placeholders.
pub fn impute(inputs: &mut Frame) -> Result<()> {
    inputs.fill_null(MERCHANT_NAME, Value::Str(MISSING_MERCHANT.to_string()))?;
    inputs.fill_null(DESCRIPTION, Value::Str(MISSING_DESCRIPTION.to_string()))?;
    inputs.fill_null(TYPE_OF_PAYMENT, Value::Str(MISSING_PAYMENT_TYPE.to_string()))?;
    Ok(())
}

fn pick(labels: &[String], rows: &[usize]) -> Vec<String> {
    rows.iter().map(|&i| labels[i].clone()).collect()
}

impl Job for TrainingJob {
    fn name(&self) -> &'static str {
        "TrainingJob"
    }

    fn logger_service(&self) -> &LoggerService {
        &self.logger_service
    }

    fn aws_service(&self) -> &AwsService {
        &self.aws_service
    }

    fn mlflow_service(&self) -> &MlflowService {
        &self.mlflow_service
    }

    fn validate(&self) -> Result<()> {
        for scorer in &self.scorers {
            scorer.metric().validate()?;
        }
        self.signer.validate()
    }

    fn run(&self, context: &JobContext) -> Result<Locals> {
        let service = context.mlflow_service();
        let client = service.client()?;
        log::info!("[TrainingJob] with client {:?}", client);
        service.run_context(&self.run_config, |run| {
            log::info!("[TrainingJob] with run {}", run.run_id());

            log::info!("[TrainingJob] read inputs: {:?}", self.inputs);
            let raw = self.inputs.read()?;
            let mut selected: Vec<&str> = FEATURES.to_vec();
            selected.push(CATEGORY);
            let mut inputs = raw.select(&selected[..])?.drop_duplicates();
            let targets = targets_schema().check(&Frame::new(vec![inputs.pop(CATEGORY)?])?)?;
            let targets = targets.get(CATEGORY)?.labels()?;
            let mut inputs = feat_inputs_schema().check(&inputs)?;
            log::debug!("[TrainingJob] inputs shape: ({}, {})", inputs.nrows(), inputs.ncols());
            impute(&mut inputs)?;

            log::info!("[TrainingJob] with splitter {:?}", self.splitter);
            let (train_index, test_index) = self
                .splitter
                .split(&inputs, &targets, None)?
                .next()
                .ok_or_else(|| Error::value("The splitter produced no split"))?;
            let inputs_train = inputs.take(&train_index);
            let inputs_test = inputs.take(&test_index);
            let targets_train = pick(&targets, &train_index);
            let targets_test = pick(&targets, &test_index);
            log::debug!(
                "[TrainingJob] train rows: {}, test rows: {}",
                inputs_train.nrows(),
                inputs_test.nrows()
            );

            let mut model = self.model.clone();
            log::info!("[TrainingJob] fit model {}", model.name());
            model.fit(&inputs_train, &targets_train)?;
            let outputs_test = model.predict(&inputs_test)?;

            let mut scores = BTreeMap::new();
            for scorer in &self.scorers {
                let metric = scorer.metric();
                let score = metric.score(&targets_test, &outputs_test)?;
                client.log_metric(run.run_id(), &metric.name, score)?;
                log::debug!("[TrainingJob] {} = {:.4}", metric.name, score);
                scores.insert(metric.name.clone(), score);
            }

            log::info!("[TrainingJob] refit model on the whole dataset ({} rows)", inputs.nrows());
            model.fit(&inputs, &targets)?;

            let outputs = Frame::new(vec![Column::strings(
                PREDICTION,
                &outputs_test.iter().map(Some).collect::<Vec<_>>(),
            )])?;
            let signature = self.signer.sign(&inputs_test.drop_nulls(), &outputs)?;
            log::debug!("[TrainingJob] model signature: {:?}", signature.to_dict()?);

            let model_info = self.saver.save(run, &model, &signature, &inputs)?;
            log::debug!("[TrainingJob] model uri: {}", model_info.model_uri);
            let version = self
                .registry
                .register(&client, &service.registry_name, &model_info.model_uri)?;
            log::info!(
                "[TrainingJob] registered version {} of '{}'",
                version.version,
                version.name
            );

            let mut locals = Locals::new();
            insert(&mut locals, "run_id", &run.run_id())?;
            insert(&mut locals, "n_train", &inputs_train.nrows())?;
            insert(&mut locals, "n_test", &inputs_test.nrows())?;
            insert(&mut locals, "scores", &scores)?;
            insert(&mut locals, "outputs_test", &outputs_test)?;
            insert(&mut locals, "signature", &signature.to_dict()?)?;
            insert(&mut locals, "model_uri", &model_info.model_uri)?;
            insert(&mut locals, "model_version", &version)?;
            Ok(locals)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn impute_fills_each_text_feature() {
        let mut frame = Frame::new(vec![
            Column::floats(AMOUNT, &[1.0]),
            Column::strings(TYPE_OF_PAYMENT, &[None::<&str>]),
            Column::strings(MERCHANT_NAME, &[None::<&str>]),
            Column::strings(DESCRIPTION, &[None::<&str>]),
        ])
        .unwrap();
        impute(&mut frame).unwrap();
        assert!(!frame.has_nulls());
        assert_eq!(frame.get(MERCHANT_NAME).unwrap().values[0], Value::Str("No merchant".into()));
        assert_eq!(frame.get(TYPE_OF_PAYMENT).unwrap().values[0], Value::Str("No type payment".into()));
    }

    #[test]
    fn scorers_default_to_accuracy() {
        let job: TrainingJob = serde_yaml::from_str(
            "inputs: {KIND: CSVReader, path: inputs.csv}\nmodel: {KIND: BaselineModel}\n",
        )
        .unwrap();
        assert_eq!(job.scorers.len(), 1);
        assert_eq!(job.scorers[0].metric().name, "accuracy_score");
        assert_eq!(job.run_config.name, "Training");
        job.validate().unwrap();
    }
}
