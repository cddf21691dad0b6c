//! Job workflows and the service lifecycle around them.
//!
//! A job is an immutable configuration. [`Job::execute`] starts the logger,
//! AWS and tracking services, calls [`Job::run`] once, then stops the
//! services in reverse order whatever the outcome.

pub mod inference;
pub mod training;
pub mod transition;
pub mod tuning;

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::io::services::{AwsService, LoggerService, MlflowService, Service};

pub use inference::InferenceJob;
pub use training::TrainingJob;
pub use transition::TransitionJob;
pub use tuning::TuningJob;

/// Named results of a run.
pub type Locals = BTreeMap<String, serde_json::Value>;

/// Services started for one job execution.
///
/// Services that were started are stopped by [`JobContext::exit`], or on drop
/// if the context is abandoned (for example while unwinding).
#[derive(Debug)]
pub struct JobContext {
    logger_service: LoggerService,
    aws_service: AwsService,
    mlflow_service: MlflowService,
    started: usize,
}

impl JobContext {
    /// Start the services in order: logger, AWS, tracking.
    pub fn enter(
        logger_service: LoggerService,
        aws_service: AwsService,
        mlflow_service: MlflowService,
    ) -> Result<Self> {
        let mut context = Self {
            logger_service,
            aws_service,
            mlflow_service,
            started: 0,
        };
        context.logger_service.start()?;
        context.started = 1;
        context.aws_service.start()?;
        context.started = 2;
        context.mlflow_service.start()?;
        context.started = 3;
        Ok(context)
    }

    pub fn logger_service(&self) -> &LoggerService {
        &self.logger_service
    }

    pub fn aws_service(&self) -> &AwsService {
        &self.aws_service
    }

    pub fn mlflow_service(&self) -> &MlflowService {
        &self.mlflow_service
    }

    /// Stop the services in reverse order and return the first failure.
    pub fn exit(mut self) -> Result<()> {
        self.stop_started()
    }

    fn stop_started(&mut self) -> Result<()> {
        let mut first = None;
        while self.started > 0 {
            let stopped = match self.started {
                3 => self.mlflow_service.stop(),
                2 => self.aws_service.stop(),
                _ => self.logger_service.stop(),
            };
            self.started -= 1;
            if let Err(e) = stopped {
                match first {
                    None => first = Some(e),
                    Some(_) => log::error!("[Job] service teardown failed: {}", e),
                }
            }
        }
        first.map_or(Ok(()), Err)
    }
}

impl Drop for JobContext {
    fn drop(&mut self) {
        if let Err(e) = self.stop_started() {
            log::error!("[Job] service teardown failed: {}", e);
        }
    }
}

pub trait Job {
    fn name(&self) -> &'static str;

    fn logger_service(&self) -> &LoggerService;

    fn aws_service(&self) -> &AwsService;

    fn mlflow_service(&self) -> &MlflowService;

    /// Check names that serde cannot (metrics, schemas, ...).
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// The job body, with every service started.
    fn run(&self, context: &JobContext) -> Result<Locals>;

    /// Start the services, run once, and stop the services.
    ///
    /// A failed run returns its own error; a teardown failure is then only
    /// logged. After a successful run a teardown failure is returned.
    fn execute(&self) -> Result<Locals> {
        let context = JobContext::enter(
            self.logger_service().clone(),
            self.aws_service().clone(),
            self.mlflow_service().clone(),
        )?;
        log::info!("[{}] started", self.name());
        let outcome = self.run(&context);
        let teardown = context.exit();
        match (outcome, teardown) {
            (Ok(locals), Ok(())) => {
                log::info!("[{}] completed with {} locals", self.name(), locals.len());
                Ok(locals)
            }
            (Ok(_), Err(e)) => Err(e),
            (Err(e), teardown) => {
                if let Err(t) = teardown {
                    log::error!("[{}] service teardown failed: {}", self.name(), t);
                }
                log::error!("[{}] failed: {}", self.name(), e);
                Err(e)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "KIND")]
pub enum JobKind {
    TuningJob(TuningJob),
    TrainingJob(TrainingJob),
    TransitionJob(TransitionJob),
    InferenceJob(InferenceJob),
}

impl JobKind {
    pub fn as_job(&self) -> &dyn Job {
        match self {
            JobKind::TuningJob(j) => j,
            JobKind::TrainingJob(j) => j,
            JobKind::TransitionJob(j) => j,
            JobKind::InferenceJob(j) => j,
        }
    }
}

impl Job for JobKind {
    fn name(&self) -> &'static str {
        self.as_job().name()
    }

    fn logger_service(&self) -> &LoggerService {
        self.as_job().logger_service()
    }

    fn aws_service(&self) -> &AwsService {
        self.as_job().aws_service()
    }

    fn mlflow_service(&self) -> &MlflowService {
        self.as_job().mlflow_service()
    }

    fn validate(&self) -> Result<()> {
        self.as_job().validate()
    }

    fn run(&self, context: &JobContext) -> Result<Locals> {
        self.as_job().run(context)
    }
}

/// Serialize a value into [`Locals`].
pub(crate) fn insert<T: Serialize>(locals: &mut Locals, key: &str, value: &T) -> Result<()> {
    locals.insert(key.to_string(), serde_json::to_value(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    struct StubJob {
        logger_service: LoggerService,
        aws_service: AwsService,
        mlflow_service: MlflowService,
        fail: bool,
    }

    impl StubJob {
        fn new(dir: &std::path::Path, fail: bool) -> Self {
            let uri = dir.to_string_lossy().into_owned();
            Self {
                logger_service: LoggerService::default(),
                aws_service: AwsService::default(),
                mlflow_service: MlflowService {
                    tracking_uri: uri.clone(),
                    registry_uri: uri,
                    ..MlflowService::default()
                },
                fail,
            }
        }
    }

    impl Job for StubJob {
        fn name(&self) -> &'static str {
            "StubJob"
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
            assert!(context.mlflow_service().experiment_id().is_some());
            if self.fail {
                return Err(Error::value("stub failure"));
            }
            let mut locals = Locals::new();
            insert(&mut locals, "a", &1)?;
            insert(&mut locals, "b", &"test")?;
            Ok(locals)
        }
    }

    #[test]
    fn run_returns_its_locals() {
        let dir = tempfile::tempdir().unwrap();
        let locals = StubJob::new(dir.path(), false).execute().unwrap();
        assert_eq!(locals.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(locals["b"], serde_json::json!("test"));
    }

    #[test]
    fn failed_run_keeps_its_error() {
        let dir = tempfile::tempdir().unwrap();
        let out = StubJob::new(dir.path(), true).execute();
        assert!(matches!(out, Err(Error::Value(ref m)) if m == "stub failure"));
    }

    #[test]
    fn context_stops_services_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let job = StubJob::new(dir.path(), false);
        let context = JobContext::enter(
            job.logger_service.clone(),
            job.aws_service.clone(),
            job.mlflow_service.clone(),
        )
        .unwrap();
        assert_eq!(context.started, 3);
        drop(context);
    }
}
