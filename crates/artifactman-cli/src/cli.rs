use std::ffi::OsString;
use std::process::ExitCode;

use artifactman::SchemaVersion;
use clap::{Arg, ArgAction, ArgMatches, Command};

use crate::commands::{self, lifecycle};
use crate::context::CliSession;
use crate::error::{CliError, ExitStatus};
use crate::formatter::{OutputFormat, emit_result};
use crate::util::Verbosity;

const NAME: &str = "artifactman";

pub fn run() -> ExitCode {
    init_tracing();
    match run_cli(std::env::args()) {
        Ok(code) => code,
        Err(err) => {
            err.print();
            err.exit_code()
        }
    }
}

/// Parses arguments, resolves the workspace when the command needs one, and dispatches.
/// Returns a `sysexits`-compatible code.
pub fn run_cli<I, S>(args: I) -> Result<ExitCode, CliError>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString> + Clone,
{
    let command = build_cli();
    let matches = command.try_get_matches_from(args)?;

    let verbosity = Verbosity {
        json: matches.get_flag("json"),
        verbose: matches.get_flag("verbose"),
    };
    let output = if verbosity.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };
    let workspace_override = matches.get_one::<String>("workspace").cloned();
    let schema_override = matches
        .get_one::<String>("schema-version")
        .map(|raw| raw.parse::<SchemaVersion>())
        .transpose()?;

    let result = match matches.subcommand() {
        Some(("init", sub)) => commands::init::run(workspace_override, schema_override, sub)?,
        Some(("schema", _)) => commands::schema::run()?,
        Some(_) => {
            let session = CliSession::bootstrap(workspace_override, schema_override, verbosity)?;
            if session.verbosity.verbose {
                tracing::info!(
                    workspace = %session.workspace_paths.root().display(),
                    artifacts = session.repository().len(),
                    schema_version = %session.config.schema_version,
                    "resolved workspace context"
                );
            }
            dispatch(&session, &matches)?
        }
        None => return Err(CliError::new("missing command", ExitStatus::Usage)),
    };
    emit_result(result, output)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}

fn build_cli() -> Command {
    Command::new(NAME)
        .about("Lifecycle, packaging and diffing of versioned knowledge artifacts")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("workspace")
                .long("workspace")
                .value_name("PATH")
                .global(true)
                .help("Specify the workspace root. Defaults to the nearest ancestor with a .artifactman folder."),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .action(ArgAction::SetTrue)
                .global(true)
                .help("Emit a single JSON object instead of human-readable text."),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .action(ArgAction::SetTrue)
                .global(true)
                .help("Log the resolved workspace and configuration."),
        )
        .arg(
            Arg::new("schema-version")
                .long("schema-version")
                .value_name("VERSION")
                .global(true)
                .value_parser(["dstu3", "r4", "r5"])
                .help("Override the FHIR release of the workspace config."),
        )
        .subcommand_required(true)
        .subcommand(commands::init::command())
        .subcommand(commands::schema::command())
        .subcommand(commands::graph::command())
        .subcommands(lifecycle::commands())
        .subcommand(commands::package::command())
        .subcommand(commands::diff::command())
}

fn dispatch(
    session: &CliSession,
    matches: &ArgMatches,
) -> Result<commands::CommandResult, CliError> {
    match matches.subcommand() {
        Some(("graph", sub)) => commands::graph::run(session, sub),
        Some(("package", sub)) => commands::package::run(session, sub),
        Some(("diff", sub)) => commands::diff::run(session, sub),
        Some((name, sub)) if lifecycle::OPERATIONS.contains(&name) => {
            lifecycle::run(session, name, sub)
        }
        _ => Err(CliError::new("missing command", ExitStatus::Usage)),
    }
}
