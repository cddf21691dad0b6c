use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::io::datasets::{Reader, ReaderKind};
use crate::io::services::{AwsService, LoggerService, MlflowService, RunConfig};
use crate::jobs::{insert, Job, JobContext, Locals};
use crate::metrics::MetricKind;
use crate::models::{Model, ModelKind};
use crate::schemas::{inputs_schema, targets_schema, CATEGORY};
use crate::searchers::SearcherKind;
use crate::splitters::SplitterKind;

fn default_run_config() -> RunConfig {
    RunConfig::named("Tuning")
}

/// Find the best hyperparameters of a model.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct TuningJob {
    #[serde(default)]
    pub logger_service: LoggerService,
    #[serde(default)]
    pub aws_service: AwsService,
    #[serde(default)]
    pub mlflow_service: MlflowService,

    #[serde(default = "default_run_config")]
    pub run_config: RunConfig,
    pub inputs: ReaderKind,
    pub targets: ReaderKind,
    #[serde(default)]
    pub model: ModelKind,
    #[serde(default)]
    pub metric: MetricKind,
    #[serde(default)]
    pub splitter: SplitterKind,
    #[serde(default)]
    pub searcher: SearcherKind,
}

impl Job for TuningJob {
    fn name(&self) -> &'static str {
        "TuningJob"
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
        self.metric.metric().validate()?;
        let params = self.model.get_params()?;
        for key in self.searcher.param_grid().keys() {
            if !params.contains_key(key) {
                return Err(Error::config(format!(
                    "Invalid parameter '{}' for {} in the searcher grid. Valid parameters are: {:?}",
                    key,
                    self.model.name(),
                    params.keys().collect::<Vec<_>>()
                )));
            }
        }
        Ok(())
    }

    fn run(&self, context: &JobContext) -> Result<Locals> {
        context.mlflow_service().run_context(&self.run_config, |run| {
            log::info!("[TuningJob] with run {}", run.run_id());

            log::info!("[TuningJob] read inputs: {:?}", self.inputs);
            let inputs = inputs_schema().check(&self.inputs.read()?)?;
            log::debug!("[TuningJob] inputs shape: ({}, {})", inputs.nrows(), inputs.ncols());

            log::info!("[TuningJob] read targets: {:?}", self.targets);
            let targets = targets_schema().check(&self.targets.read()?)?;
            let targets = targets.get(CATEGORY)?.labels()?;
            log::debug!("[TuningJob] targets shape: ({},)", targets.len());

            log::info!("[TuningJob] run searcher {:?} on {}", self.searcher, self.model.name());
            let metric = self.metric.metric();
            let search = self
                .searcher
                .search(&self.model, metric, &inputs, &targets, &self.splitter)?;
            log::info!(
                "[TuningJob] best {} = {:.4} with {:?}",
                metric.name,
                search.best_score,
                search.best_params
            );

            run.log_metric(&format!("best_{}", metric.name), search.best_score)?;
            for (key, value) in &search.best_params {
                run.log_param(key, &value.to_string())?;
            }

            let mut locals = Locals::new();
            insert(&mut locals, "run_id", &run.run_id())?;
            locals.insert("results".to_string(), search.results.to_records(None));
            insert(&mut locals, "best_score", &search.best_score)?;
            insert(&mut locals, "best_params", &search.best_params)?;
            Ok(locals)
        })
    }
}
