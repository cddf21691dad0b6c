use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::io::services::{AwsService, LoggerService, MlflowService};
use crate::jobs::{insert, Job, JobContext, Locals};
use crate::tracking::Stage;

fn default_stage() -> Stage {
    Stage::Production
}

fn default_true() -> bool {
    true
}

/// Move a registered model version to another stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct TransitionJob {
    #[serde(default)]
    pub logger_service: LoggerService,
    #[serde(default)]
    pub aws_service: AwsService,
    #[serde(default)]
    pub mlflow_service: MlflowService,

    #[serde(default = "default_stage")]
    pub stage: Stage,
    /// Version to move; the latest one when absent.
    #[serde(default)]
    pub version: Option<u64>,
    #[serde(default = "default_true")]
    pub archive_existing_versions: bool,
    /// Stages searched for the latest version (every stage when absent).
    #[serde(default)]
    pub latest_version_stages: Option<Vec<Stage>>,
}

impl Job for TransitionJob {
    fn name(&self) -> &'static str {
        "TransitionJob"
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
        log::info!("[TransitionJob] with client {:?}", client);
        let name = service.registry_name.as_str();

        let from_version = match self.version {
            Some(version) => client.registry().get_model_version(name, version)?,
            None => client
                .registry()
                .get_latest_versions(name, self.latest_version_stages.as_deref())?
                .into_iter()
                .max_by_key(|v| v.version)
                .ok_or_else(|| {
                    Error::tracking(format!(
                        "No version of model '{}' in stages {:?}",
                        name, self.latest_version_stages
                    ))
                })?,
        };
        log::info!(
            "[TransitionJob] from version {} of '{}' ({})",
            from_version.version,
            name,
            from_version.current_stage
        );

        let to_version = client.transition_model_version_stage(
            name,
            from_version.version,
            self.stage,
            self.archive_existing_versions,
        )?;
        log::debug!(
            "[TransitionJob] version {} is now in {}",
            to_version.version,
            to_version.current_stage
        );

        let mut locals = Locals::new();
        insert(&mut locals, "name", &name)?;
        insert(&mut locals, "from_version", &from_version)?;
        insert(&mut locals, "to_version", &to_version)?;
        Ok(locals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_promote_the_latest_version_to_production() {
        let job: TransitionJob = serde_yaml::from_str("{}").unwrap();
        assert_eq!(job.stage, Stage::Production);
        assert_eq!(job.version, None);
        assert!(job.archive_existing_versions);
        assert_eq!(job.latest_version_stages, None);
    }

    #[test]
    fn stages_are_parsed_by_name() {
        let job: TransitionJob =
            serde_yaml::from_str("stage: Staging\nversion: 2\nlatest_version_stages: [None, Staging]\n").unwrap();
        assert_eq!(job.stage, Stage::Staging);
        assert_eq!(job.version, Some(2));
        assert_eq!(job.latest_version_stages, Some(vec![Stage::None, Stage::Staging]));
    }
}
