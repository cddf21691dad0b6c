//! The shipped example configurations parse into valid settings.

use qto_categorizer::io::configs::{self, Resolvers};
use qto_categorizer::jobs::JobKind;
use qto_categorizer::settings::MainSettings;

fn load(name: &str) -> MainSettings {
    let path = format!("{}/../../confs/{}", env!("CARGO_MANIFEST_DIR"), name);
    let config = configs::parse_file(&path).unwrap();
    MainSettings::from_config(&config, &Resolvers::default()).unwrap()
}

#[test]
fn example_configs_are_valid() {
    assert!(matches!(load("tuning.yaml").job, JobKind::TuningJob(_)));
    assert!(matches!(load("training.yaml").job, JobKind::TrainingJob(_)));
    assert!(matches!(load("transition.yaml").job, JobKind::TransitionJob(_)));
    assert!(matches!(load("inference.yaml").job, JobKind::InferenceJob(_)));
}

#[test]
fn extras_override_files() {
    let path = format!("{}/../../confs/transition.yaml", env!("CARGO_MANIFEST_DIR"));
    let config = configs::merge_configs([
        configs::parse_file(&path).unwrap(),
        configs::parse_string("job: {stage: Staging, version: 3}").unwrap(),
    ]);
    let settings = MainSettings::from_config(&config, &Resolvers::default()).unwrap();
    match settings.job {
        JobKind::TransitionJob(job) => {
            assert_eq!(job.version, Some(3));
            assert_eq!(job.stage.to_string(), "Staging");
            assert!(job.archive_existing_versions);
        }
        other => panic!("unexpected job {:?}", other),
    }
}
