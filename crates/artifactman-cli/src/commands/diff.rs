use std::fs;
use std::path::PathBuf;

use artifactman::{
    ArtifactDiffEngine, CanonicalReference, ChangeLogFormat, ChangeLogRenderer, DiffOptions,
    ParameterMap,
};
use clap::{Arg, ArgAction, ArgMatches, Command};

use crate::commands::CommandResult;
use crate::context::CliSession;
use crate::error::{CliError, ExitStatus};
use crate::util;

pub fn command() -> Command {
    Command::new("diff")
        .about("Compare two versions of an artifact and its dependencies")
        .arg(
            Arg::new("source")
                .value_name("SOURCE")
                .required(true)
                .help("Canonical reference of the older artifact"),
        )
        .arg(
            Arg::new("target")
                .value_name("TARGET")
                .required(true)
                .help("Canonical reference of the newer artifact"),
        )
        .arg(
            Arg::new("computable")
                .long("computable")
                .action(ArgAction::SetTrue)
                .help("Compare value set definitions (compose)"),
        )
        .arg(
            Arg::new("executable")
                .long("executable")
                .action(ArgAction::SetTrue)
                .help("Compare value set expansions"),
        )
        .arg(
            Arg::new("format")
                .long("format")
                .value_name("FORMAT")
                .default_value("json")
                .value_parser(["json", "markdown", "md", "html"])
                .help("Rendering of the changelog"),
        )
        .arg(
            Arg::new("output")
                .long("output")
                .short('o')
                .value_name("FILE")
                .help("Write the rendered changelog to FILE instead of stdout"),
        )
}

pub fn run(session: &CliSession, matches: &ArgMatches) -> Result<CommandResult, CliError> {
    let source = reference(matches, "source")?;
    let target = reference(matches, "target")?;
    let format_name = matches
        .get_one::<String>("format")
        .map(String::as_str)
        .unwrap_or("json");
    let format: ChangeLogFormat = format_name.parse()?;

    let mut params = ParameterMap::new();
    util::push_flag(&mut params, matches, "computable", "compareComputable");
    util::push_flag(&mut params, matches, "executable", "compareExecutable");
    let options = DiffOptions::from_parameters(&params)?;

    let changelog = ArtifactDiffEngine::new(options)
        .with_cache(&session.cache)
        .diff_references(session.repository(), &source, &target)?;
    let document = ChangeLogRenderer::new().render(&changelog, format)?;

    let output = match matches.get_one::<String>("output") {
        Some(path) => {
            let path = PathBuf::from(path);
            fs::write(&path, &document).map_err(|err| {
                CliError::new(
                    format!("unable to write {}: {err}", path.display()),
                    ExitStatus::Io,
                )
            })?;
            Some(path.display().to_string())
        }
        None => None,
    };

    Ok(CommandResult::Diff {
        changelog,
        format: format_name.to_string(),
        document,
        output,
    })
}

fn reference(matches: &ArgMatches, field: &str) -> Result<CanonicalReference, CliError> {
    let raw = matches
        .get_one::<String>(field)
        .ok_or_else(|| CliError::usage(format!("{field} is required")))?;
    util::parse_reference(raw, field)
}
