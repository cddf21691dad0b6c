//! Process-wide services started around each job: logging, AWS session and
//! experiment tracking.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::RwLock;

use log::LevelFilter;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tracking::{MlflowClient, RunInfo, RunStatus, Tags, NOTE_TAG};

pub trait Service {
    fn start(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Logger

/// Log sink, level and format; `QTO_LOG` refines the filter at start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct LoggerService {
    /// `stderr`, `stdout` or a file path.
    pub sink: String,
    pub level: String,
    pub colorize: bool,
    /// One JSON object per record.
    pub serialize: bool,
}

impl Default for LoggerService {
    fn default() -> Self {
        Self {
            sink: "stderr".to_string(),
            level: "DEBUG".to_string(),
            colorize: true,
            serialize: false,
        }
    }
}

impl LoggerService {
    pub fn level_filter(&self) -> Result<LevelFilter> {
        self.level
            .parse::<LevelFilter>()
            .map_err(|_| Error::config(format!("Invalid log level: {}", self.level)))
    }

    fn builder(&self) -> Result<env_logger::Builder> {
        let mut builder = env_logger::Builder::new();
        builder
            .filter_level(self.level_filter()?)
            .parse_env(env_logger::Env::new().filter("QTO_LOG"))
            .write_style(if self.colorize {
                env_logger::WriteStyle::Auto
            } else {
                env_logger::WriteStyle::Never
            });
        match self.sink.as_str() {
            "stderr" => {
                builder.target(env_logger::Target::Stderr);
            }
            "stdout" => {
                builder.target(env_logger::Target::Stdout);
            }
            path => {
                let path = PathBuf::from(path);
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent)?;
                }
                let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
        }
        if self.serialize {
            builder.format(|buf, record| {
                let line = serde_json::json!({
                    "time": chrono::Local::now().to_rfc3339(),
                    "level": record.level().as_str(),
                    "target": record.target(),
                    "message": record.args().to_string(),
                });
                writeln!(buf, "{}", line)
            });
        } else {
            builder.format(|buf, record| {
                writeln!(
                    buf,
                    "[{}][{}][{}] {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                    buf.default_styled_level(record.level()),
                    record.target(),
                    record.args()
                )
            });
        }
        Ok(builder)
    }
}

impl Service for LoggerService {
    fn start(&mut self) -> Result<()> {
        let level = self.level_filter()?;
        if self.builder()?.try_init().is_err() {
            // A logger is already installed in this process; only the level moves.
            log::set_max_level(level);
        }
        log::debug!("[LoggerService] logging to {} at {}", self.sink, level);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        log::logger().flush();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// AWS

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

/// Region and credentials used by `s3://` storage access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwsSession {
    pub region_name: String,
    pub profile_name: Option<String>,
    pub credentials: Option<AwsCredentials>,
}

static DEFAULT_SESSION: RwLock<Option<AwsSession>> = RwLock::new(None);

/// Session installed by the running [`AwsService`], if any.
pub fn default_session() -> Option<AwsSession> {
    match DEFAULT_SESSION.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

fn set_default_session(session: Option<AwsSession>) -> Option<AwsSession> {
    let mut guard = match DEFAULT_SESSION.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    std::mem::replace(&mut *guard, session)
}

fn credentials_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("AWS_SHARED_CREDENTIALS_FILE") {
        return Some(PathBuf::from(path));
    }
    std::env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".aws").join("credentials"))
}

/// Sections of an AWS shared credentials file.
fn parse_credentials(text: &str) -> BTreeMap<String, BTreeMap<String, String>> {
    let mut sections: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    let mut current: Option<String> = None;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let name = name.trim().trim_start_matches("profile ").trim().to_string();
            sections.entry(name.clone()).or_default();
            current = Some(name);
        } else if let (Some(section), Some((key, value))) = (current.as_ref(), line.split_once('=')) {
            sections
                .entry(section.clone())
                .or_default()
                .insert(key.trim().to_lowercase(), value.trim().to_string());
        }
    }
    sections
}

fn profile_credentials(text: &str, profile: &str) -> Option<AwsCredentials> {
    let sections = parse_credentials(text);
    let section = sections.get(profile)?;
    Some(AwsCredentials {
        access_key_id: section.get("aws_access_key_id")?.clone(),
        secret_access_key: section.get("aws_secret_access_key")?.clone(),
        session_token: section.get("aws_session_token").cloned(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct AwsService {
    pub region_name: String,
    pub profile_name: Option<String>,
    #[serde(skip)]
    #[schemars(skip)]
    previous: Option<AwsSession>,
}

impl Default for AwsService {
    fn default() -> Self {
        Self {
            region_name: "eu-west-1".to_string(),
            profile_name: None,
            previous: None,
        }
    }
}

impl AwsService {
    /// A new session for this service's region and profile.
    pub fn session(&self) -> Result<AwsSession> {
        let credentials = match &self.profile_name {
            Some(profile) => {
                let path = credentials_file()
                    .ok_or_else(|| Error::config("Cannot locate the AWS shared credentials file"))?;
                let text = fs::read_to_string(&path)?;
                Some(profile_credentials(&text, profile).ok_or_else(|| {
                    Error::config(format!("The config profile ({}) could not be found", profile))
                })?)
            }
            // Without a profile the environment (or instance metadata) provides credentials.
            None => None,
        };
        Ok(AwsSession {
            region_name: self.region_name.clone(),
            profile_name: self.profile_name.clone(),
            credentials,
        })
    }
}

impl Service for AwsService {
    fn start(&mut self) -> Result<()> {
        let session = self.session()?;
        log::debug!(
            "[AwsService] default session in {} (profile: {:?})",
            session.region_name,
            session.profile_name
        );
        self.previous = set_default_session(Some(session));
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        set_default_session(self.previous.take());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tracking

/// Run settings for [`MlflowService::run_context`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Option<Tags>,
}

impl RunConfig {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            tags: None,
        }
    }
}

/// The run open inside [`MlflowService::run_context`].
#[derive(Debug, Clone)]
pub struct ActiveRun {
    pub info: RunInfo,
    client: MlflowClient,
}

impl ActiveRun {
    pub fn run_id(&self) -> &str {
        &self.info.run_id
    }

    pub fn client(&self) -> &MlflowClient {
        &self.client
    }

    pub fn log_metric(&self, key: &str, value: f64) -> Result<()> {
        self.client.log_metric(&self.info.run_id, key, value)
    }

    pub fn log_param(&self, key: &str, value: &str) -> Result<()> {
        self.client.tracking().log_param(&self.info.run_id, key, value)
    }

    pub fn set_tag(&self, key: &str, value: &str) -> Result<()> {
        self.client.tracking().set_tag(&self.info.run_id, key, value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct MlflowService {
    pub tracking_uri: String,
    pub registry_uri: String,
    pub experiment_name: String,
    pub registry_name: String,
    #[serde(skip)]
    #[schemars(skip)]
    pub(crate) state: Option<(MlflowClient, String)>,
}

impl PartialEq for MlflowService {
    fn eq(&self, other: &Self) -> bool {
        self.tracking_uri == other.tracking_uri
            && self.registry_uri == other.registry_uri
            && self.experiment_name == other.experiment_name
            && self.registry_name == other.registry_name
    }
}

impl Default for MlflowService {
    fn default() -> Self {
        Self {
            tracking_uri: "./mlruns".to_string(),
            registry_uri: "./mlruns".to_string(),
            experiment_name: "qto-categorizer-xp-tracking-ml".to_string(),
            registry_name: "qto-categorizer-ml".to_string(),
            state: None,
        }
    }
}

impl MlflowService {
    /// A fresh client for the configured URIs, usable without `start`.
    pub fn client(&self) -> Result<MlflowClient> {
        match &self.state {
            Some((client, _)) => Ok(client.clone()),
            None => MlflowClient::new(&self.tracking_uri, &self.registry_uri),
        }
    }

    pub fn experiment_id(&self) -> Option<&str> {
        self.state.as_ref().map(|(_, id)| id.as_str())
    }

    /// Run `f` inside a new run that ends `FINISHED` on success and `FAILED`
    /// otherwise. The error of `f` is returned as is.
    pub fn run_context<T, F>(&self, config: &RunConfig, f: F) -> Result<T>
    where
        F: FnOnce(&ActiveRun) -> Result<T>,
    {
        let (client, experiment_id) = self
            .state
            .as_ref()
            .ok_or_else(|| Error::tracking("MlflowService must be started before opening a run"))?;
        let mut tags = config.tags.clone().unwrap_or_default();
        if let Some(description) = &config.description {
            tags.insert(NOTE_TAG.to_string(), description.clone());
        }
        let info = client
            .tracking()
            .create_run(experiment_id, Some(&config.name), &tags)?;
        log::info!("[MlflowService] started run {} ({})", info.run_id, config.name);
        let run = ActiveRun {
            info,
            client: client.clone(),
        };

        let outcome = f(&run);
        let status = if outcome.is_ok() {
            RunStatus::Finished
        } else {
            RunStatus::Failed
        };
        let ended = client
            .tracking()
            .update_run(run.run_id(), status, Some(crate::tracking::now_millis()));
        match (outcome, ended) {
            (Ok(value), Ok(_)) => {
                log::info!("[MlflowService] run {} finished", run.run_id());
                Ok(value)
            }
            (Ok(_), Err(e)) => Err(e),
            (Err(e), ended) => {
                if let Err(close) = ended {
                    log::error!("[MlflowService] could not close run {}: {}", run.run_id(), close);
                }
                log::warn!("[MlflowService] run {} failed", run.run_id());
                Err(e)
            }
        }
    }
}

impl Service for MlflowService {
    fn start(&mut self) -> Result<()> {
        let client = MlflowClient::new(&self.tracking_uri, &self.registry_uri)?;
        let experiment_id = client.get_or_create_experiment(&self.experiment_name)?;
        log::debug!(
            "[MlflowService] tracking to {} (experiment {})",
            self.tracking_uri,
            experiment_id
        );
        self.state = Some((client, experiment_id));
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.state = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_profile_from_shared_credentials() {
        let text = "[default]\naws_access_key_id = A\naws_secret_access_key = B\n\n\
                    [profile dev]\naws_access_key_id=C\naws_secret_access_key=D\naws_session_token=E\n";
        let dev = profile_credentials(text, "dev").unwrap();
        assert_eq!(dev.access_key_id, "C");
        assert_eq!(dev.session_token.as_deref(), Some("E"));
        assert!(profile_credentials(text, "prod").is_none());
    }

    #[test]
    fn run_context_requires_a_started_service() {
        let service = MlflowService::default();
        let out = service.run_context(&RunConfig::named("Training"), |_| Ok(()));
        assert!(matches!(out, Err(Error::Tracking(_))));
    }

    #[test]
    fn failed_runs_are_closed_and_error_returned() {
        let dir = tempfile::tempdir().unwrap();
        let uri = dir.path().to_string_lossy().into_owned();
        let mut service = MlflowService {
            tracking_uri: uri.clone(),
            registry_uri: uri,
            ..MlflowService::default()
        };
        service.start().unwrap();
        let mut run_id = String::new();
        let out: Result<()> = service.run_context(&RunConfig::named("Training"), |run| {
            run_id = run.run_id().to_string();
            Err(Error::value("boom"))
        });
        assert!(matches!(out, Err(Error::Value(ref m)) if m == "boom"));
        let client = service.client().unwrap();
        assert_eq!(client.tracking().get_run(&run_id).unwrap().status, RunStatus::Failed);
        service.stop().unwrap();
    }

    #[test]
    fn described_runs_that_fail_are_marked_failed() {
        let dir = tempfile::tempdir().unwrap();
        let uri = dir.path().to_string_lossy().into_owned();
        let mut service = MlflowService {
            tracking_uri: uri.clone(),
            registry_uri: uri,
            ..MlflowService::default()
        };
        service.start().unwrap();
        let config = RunConfig {
            description: Some("Nightly training".to_string()),
            ..RunConfig::named("Training")
        };
        let mut run_id = String::new();
        let out: Result<()> = service.run_context(&config, |run| {
            run_id = run.run_id().to_string();
            Err(Error::value("bad inputs"))
        });
        assert!(matches!(out, Err(Error::Value(ref m)) if m == "bad inputs"));

        let client = service.client().unwrap();
        let info = client.tracking().get_run(&run_id).unwrap();
        assert_eq!(info.status, RunStatus::Failed);
        assert!(info.end_time.is_some());
        let note = dir
            .path()
            .join(&info.experiment_id)
            .join(&run_id)
            .join("tags")
            .join(NOTE_TAG);
        assert_eq!(std::fs::read_to_string(note).unwrap(), "Nightly training");
        service.stop().unwrap();
    }
}
