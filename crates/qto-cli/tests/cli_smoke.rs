//! CLI binary smoke tests using assert_cmd.

use assert_cmd::Command;
use predicates::prelude::*;

fn cmd() -> Command {
    Command::cargo_bin("qto-categorizer").unwrap()
}

fn data_path(name: &str) -> String {
    format!("{}/../qto-categorizer/tests/data/{}", env!("CARGO_MANIFEST_DIR"), name)
}

#[test]
fn help_flag() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--extras"))
        .stdout(predicate::str::contains("--schema"));
}

#[test]
fn version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("qto-categorizer"));
}

#[test]
fn schema_flag_prints_the_settings_schema() {
    cmd()
        .arg("--schema")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"title\": \"MainSettings\""))
        .stdout(predicate::str::contains("TrainingJob"))
        .stdout(predicate::str::starts_with("{\n    \""));
}

#[test]
fn no_configs_fails() {
    cmd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("No configs provided."));
}

#[test]
fn invalid_settings_fail() {
    cmd()
        .args(["-e", "job: {KIND: NotAJob}"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid settings"));
}

#[test]
fn missing_config_file_fails() {
    cmd()
        .arg("does/not/exist.yaml")
        .assert()
        .failure()
        .stderr(predicate::str::contains("does/not/exist.yaml"));
}

#[test]
fn training_then_inference_from_files_and_extras() {
    let tmp = tempfile::tempdir().unwrap();
    let mlruns = tmp.path().join("mlruns");
    let services = tmp.path().join("services.yaml");
    std::fs::write(
        &services,
        format!(
            "job:\n  logger_service: {{level: WARN}}\n  mlflow_service: {{tracking_uri: '{0}', registry_uri: '{0}'}}\n",
            mlruns.display()
        ),
    )
    .unwrap();
    let training = tmp.path().join("training.yaml");
    std::fs::write(
        &training,
        format!(
            "job:\n  KIND: TrainingJob\n  inputs: {{KIND: CSVReader, path: '{}', parse_dates: [DATE_EMITTED]}}\n  model: {{KIND: BaselineModel}}\n",
            data_path("inputs.csv")
        ),
    )
    .unwrap();
    cmd().arg(&training).arg(&services).assert().success();
    cmd()
        .arg(&services)
        .args(["-e", "job: {KIND: TransitionJob, stage: Production}"])
        .assert()
        .success();

    let output = tmp.path().join("predictions.csv");
    let inference = format!(
        "job: {{KIND: InferenceJob, inputs: {{KIND: CSVReader, path: '{}', parse_dates: [DATE_EMITTED]}}, outputs: {{KIND: CSVWriter, path: '{}'}}}}",
        data_path("inputs.csv"),
        output.display()
    );
    cmd().arg(&services).args(["-e", &inference]).assert().success();
    let written = std::fs::read_to_string(output).unwrap();
    assert!(written.starts_with("predicted_class\n"));
}
