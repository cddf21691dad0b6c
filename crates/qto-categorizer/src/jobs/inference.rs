use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::frame::{Column, Frame};
use crate::io::datasets::{Reader, ReaderKind, Writer, WriterKind};
use crate::io::registries::{uri_for_model, LoaderKind};
use crate::io::services::{AwsService, LoggerService, MlflowService};
use crate::jobs::{insert, Job, JobContext, Locals};
use crate::schemas::inputs_schema;

/// Column of the frame written by [`InferenceJob`].
pub const PREDICTED_CLASS: &str = "predicted_class";

fn default_version_or_stage() -> String {
    "Production".to_string()
}

/// Categorize transactions with a registered model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct InferenceJob {
    #[serde(default)]
    pub logger_service: LoggerService,
    #[serde(default)]
    pub aws_service: AwsService,
    #[serde(default)]
    pub mlflow_service: MlflowService,

    pub inputs: ReaderKind,
    pub outputs: WriterKind,
    /// Version number or stage name of the registered model.
    #[serde(default = "default_version_or_stage")]
    pub version_or_stage: String,
    #[serde(default)]
    pub loader: LoaderKind,
}

impl Job for InferenceJob {
    fn name(&self) -> &'static str {
        "InferenceJob"
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

    fn run(&self, context: &JobContext) -> Result<Locals> {
        let service = context.mlflow_service();
        let client = service.client()?;

        log::info!("[InferenceJob] read inputs: {:?}", self.inputs);
        let raw = self.inputs.read()?;
        let complete = raw.drop_nulls();
        if complete.nrows() < raw.nrows() {
            log::warn!(
                "[InferenceJob] dropped {} rows with missing values",
                raw.nrows() - complete.nrows()
            );
        }
        let inputs = inputs_schema().check(&complete)?;
        log::debug!("[InferenceJob] inputs shape: ({}, {})", inputs.nrows(), inputs.ncols());

        let model_uri = uri_for_model(&service.registry_name, &self.version_or_stage);
        log::info!("[InferenceJob] load model {}", model_uri);
        let model = self.loader.load(&client, &model_uri)?;

        let outputs = model.predict(&inputs)?;
        log::info!("[InferenceJob] predicted {} rows", outputs.len());
        let frame = Frame::new(vec![Column::strings(
            PREDICTED_CLASS,
            &outputs.iter().map(Some).collect::<Vec<_>>(),
        )])?;
        self.outputs.write(&frame)?;
        log::info!("[InferenceJob] wrote outputs: {:?}", self.outputs);

        let mut locals = Locals::new();
        insert(&mut locals, "model_uri", &model_uri)?;
        insert(&mut locals, "run_id", &model.run_id)?;
        insert(&mut locals, "n_inputs", &inputs.nrows())?;
        insert(&mut locals, "outputs", &outputs)?;
        Ok(locals)
    }
}
