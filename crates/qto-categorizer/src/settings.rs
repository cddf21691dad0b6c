//! Top-level settings document of the command line.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::io::configs::{self, Config, Resolvers};
use crate::jobs::{Job, JobKind, Locals};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct MainSettings {
    pub job: JobKind,
}

impl MainSettings {
    /// Resolve interpolations of a merged config and parse it.
    pub fn from_config(config: &Config, resolvers: &Resolvers) -> Result<Self> {
        let settings: Self = configs::to_settings(config, resolvers)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Name checks serde cannot express.
    pub fn validate(&self) -> Result<()> {
        self.job.validate()
    }

    pub fn run(&self) -> Result<Locals> {
        self.job.execute()
    }
}

/// JSON schema of [`MainSettings`].
pub fn schema() -> Result<serde_json::Value> {
    Ok(serde_json::to_value(schemars::schema_for!(MainSettings))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn schema_lists_every_job_kind() {
        let text = schema().unwrap().to_string();
        for kind in ["TuningJob", "TrainingJob", "TransitionJob", "InferenceJob"] {
            assert!(text.contains(kind), "{} missing from schema", kind);
        }
    }

    #[test]
    fn unknown_kinds_and_fields_are_rejected() {
        let resolvers = Resolvers::default();
        let config = configs::parse_string("job: {KIND: UnknownJob}").unwrap();
        assert!(MainSettings::from_config(&config, &resolvers).is_err());
        let config = configs::parse_string("job: {KIND: TransitionJob, stagee: Staging}").unwrap();
        assert!(MainSettings::from_config(&config, &resolvers).is_err());
    }

    #[test]
    fn unknown_metric_names_fail_validation() {
        let config = configs::parse_string(
            "job:\n  KIND: TrainingJob\n  inputs: {KIND: CSVReader, path: x.csv}\n  model: {KIND: BaselineModel}\n  scorers: [{KIND: ScoringMetric, name: nope}]\n",
        )
        .unwrap();
        let out = MainSettings::from_config(&config, &Resolvers::default());
        assert!(matches!(out, Err(Error::Configuration(_))));
    }

    #[test]
    fn grid_keys_must_be_model_parameters() {
        let config = configs::parse_string(
            "job:\n  KIND: TuningJob\n  inputs: {KIND: CSVReader, path: x.csv}\n  targets: {KIND: CSVReader, path: y.csv}\n  model: {KIND: BaselineModel}\n",
        )
        .unwrap();
        let out = MainSettings::from_config(&config, &Resolvers::default());
        assert!(matches!(out, Err(Error::Configuration(_))));
    }
}
