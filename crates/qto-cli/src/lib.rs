//! Command line front end: merge config sources, parse the settings and run
//! the selected job.

use std::ffi::OsString;
use std::io::Write;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command, ValueHint};
use serde::Serialize;

use qto_categorizer::io::configs::{self, Resolvers};
use qto_categorizer::jobs::Locals;
use qto_categorizer::settings::{self, MainSettings};

pub fn command() -> Command {
    Command::new("qto-categorizer")
        .version(clap::crate_version!())
        .about("Tune, train, promote and serve the transaction categorizer from config files")
        .arg(
            Arg::new("files")
                .help("Config files to parse (local paths, file:// or s3:// URIs)")
                .num_args(0..)
                .value_parser(clap::builder::NonEmptyStringValueParser::new())
                .value_hint(ValueHint::FilePath),
        )
        .arg(
            Arg::new("extras")
                .short('e')
                .long("extras")
                .help("Additional config strings, merged after the files")
                .num_args(0..)
                .action(ArgAction::Append)
                .value_parser(clap::builder::NonEmptyStringValueParser::new())
                .value_hint(ValueHint::Other),
        )
        .arg(
            Arg::new("schema")
                .short('s')
                .long("schema")
                .help("Print the settings schema and exit")
                .action(ArgAction::SetTrue),
        )
}

/// Pretty JSON with four-space indentation.
fn to_json_string<T: Serialize>(value: &T) -> Result<String> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    value.serialize(&mut serializer)?;
    Ok(String::from_utf8(out)?)
}

/// Merge the config sources in argument order and parse the settings.
pub fn load_settings(matches: &ArgMatches, resolvers: &Resolvers) -> Result<MainSettings> {
    let files: Vec<&String> = matches.get_many("files").map(|v| v.collect()).unwrap_or_default();
    let extras: Vec<&String> = matches.get_many("extras").map(|v| v.collect()).unwrap_or_default();
    if files.is_empty() && extras.is_empty() {
        return Err(qto_categorizer::Error::config("No configs provided.").into());
    }
    let mut sources = Vec::with_capacity(files.len() + extras.len());
    for file in files {
        sources.push(configs::parse_file(file).with_context(|| format!("Failed to parse config file {}", file))?);
    }
    for extra in extras {
        sources.push(configs::parse_string(extra).with_context(|| format!("Failed to parse config string {}", extra))?);
    }
    let config = configs::merge_configs(sources);
    log::debug!("[CLI] merged config: {:?}", config);
    let settings = MainSettings::from_config(&config, resolvers).context("Invalid settings")?;
    Ok(settings)
}

/// Parse `args` and run the job; `Ok(None)` when nothing was run.
pub fn run_with<I, T>(args: I, resolvers: &Resolvers) -> Result<Option<Locals>>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let matches = match command().try_get_matches_from(args) {
        Ok(matches) => matches,
        Err(e) if !e.use_stderr() => {
            // --help and --version
            e.print()?;
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    if matches.get_flag("schema") {
        let schema = settings::schema()?;
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", to_json_string(&schema)?)?;
        return Ok(None);
    }
    let settings = load_settings(&matches, resolvers)?;
    let locals = settings.run().context("Job failed")?;
    Ok(Some(locals))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn files_and_extras_are_collected_in_order() {
        let matches = command()
            .try_get_matches_from(["qto-categorizer", "a.yaml", "b.yaml", "-e", "x: 1", "y: 2"])
            .unwrap();
        let files: Vec<&String> = matches.get_many("files").unwrap().collect();
        let extras: Vec<&String> = matches.get_many("extras").unwrap().collect();
        assert_eq!(files, ["a.yaml", "b.yaml"]);
        assert_eq!(extras, ["x: 1", "y: 2"]);
    }

    #[test]
    fn missing_configs_are_an_error() {
        let matches = command().try_get_matches_from(["qto-categorizer"]).unwrap();
        let err = load_settings(&matches, &Resolvers::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<qto_categorizer::Error>(),
            Some(qto_categorizer::Error::Configuration(msg)) if msg == "No configs provided."
        ));
        assert_eq!(err.to_string(), "configuration error: No configs provided.");
    }

    #[test]
    fn json_uses_four_space_indent() {
        let text = to_json_string(&serde_json::json!({"a": 1})).unwrap();
        assert_eq!(text, "{\n    \"a\": 1\n}");
    }
}
