//! Service teardown when a job fails.

use std::fs;
use std::path::Path;

use qto_categorizer::io::services::default_session;
use qto_categorizer::jobs::{InferenceJob, Job, JobKind};
use qto_categorizer::Error;

/// Status of every run recorded under a file store root.
fn run_statuses(root: &Path) -> Vec<String> {
    let mut statuses = Vec::new();
    for experiment in fs::read_dir(root).unwrap().flatten() {
        if !experiment.path().is_dir() {
            continue;
        }
        for run in fs::read_dir(experiment.path()).unwrap().flatten() {
            let meta = run.path().join("meta.json");
            if let Ok(text) = fs::read_to_string(meta) {
                let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                if let Some(status) = value.get("status").and_then(|s| s.as_str()) {
                    statuses.push(status.to_string());
                }
            }
        }
    }
    statuses
}

#[test]
fn failed_jobs_keep_their_error_and_release_services() {
    let tmp = tempfile::tempdir().unwrap();
    let mlruns = tmp.path().join("mlruns");
    let missing = tmp.path().join("missing.csv");

    let job: JobKind = serde_yaml::from_str(&format!(
        "KIND: TrainingJob\n\
         mlflow_service: {{tracking_uri: '{0}', registry_uri: '{0}'}}\n\
         inputs: {{KIND: CSVReader, path: '{1}'}}\n\
         model: {{KIND: BaselineModel}}\n",
        mlruns.display(),
        missing.display()
    ))
    .unwrap();

    assert!(default_session().is_none());
    let err = job.execute().unwrap_err();
    assert!(matches!(err, Error::Io(_)), "unexpected error: {}", err);
    assert!(default_session().is_none(), "the AWS session must be restored");
    assert_eq!(run_statuses(&mlruns), vec!["FAILED".to_string()]);

    // A job that fails before opening a run leaves no run behind.
    let job: InferenceJob = serde_yaml::from_str(&format!(
        "mlflow_service: {{tracking_uri: '{0}', registry_uri: '{0}'}}\n\
         inputs: {{KIND: CSVReader, path: '{1}'}}\n\
         outputs: {{KIND: CSVWriter, path: '{2}'}}\n",
        mlruns.display(),
        missing.display(),
        tmp.path().join("out.csv").display()
    ))
    .unwrap();
    assert!(job.execute().is_err());
    assert!(default_session().is_none());
    assert_eq!(run_statuses(&mlruns).len(), 1);
}
