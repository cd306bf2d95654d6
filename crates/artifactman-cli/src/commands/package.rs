use std::fs;
use std::path::PathBuf;

use artifactman::{PackageAssembler, PackageParams};
use clap::{Arg, ArgAction, ArgMatches, Command};

use crate::commands::CommandResult;
use crate::context::CliSession;
use crate::error::{CliError, ExitStatus};
use crate::util;

const FLAGS: [(&str, &str); 10] = [
    ("include", "include"),
    ("capability", "capability"),
    ("count", "count"),
    ("offset", "offset"),
    ("bundle-type", "bundleType"),
    ("artifact-version", "artifactVersion"),
    ("check-artifact-version", "checkArtifactVersion"),
    ("force-artifact-version", "forceArtifactVersion"),
    ("system-version", "system-version"),
    ("valueset-version", "valueset-version"),
];

pub fn command() -> Command {
    Command::new("package")
        .about("Assemble an artifact and its dependencies into a bundle")
        .arg(
            Arg::new("reference")
                .value_name("URL[|VERSION]")
                .required(true)
                .help("Canonical reference of the root artifact"),
        )
        .arg(repeated("include", "Restrict entries to a category, role or resource type"))
        .arg(repeated("capability", "Capability the root must declare"))
        .arg(single("count", "Maximum number of entries"))
        .arg(single("offset", "Number of entries to skip"))
        .arg(
            single("bundle-type", "Result bundle type")
                .value_parser(["searchset", "collection", "transaction"]),
        )
        .arg(repeated("artifact-version", "Version to use for unversioned references"))
        .arg(repeated("check-artifact-version", "Version a reference must resolve to"))
        .arg(repeated("force-artifact-version", "Version that replaces any referenced version"))
        .arg(repeated("system-version", "Code system version for expansions"))
        .arg(repeated("valueset-version", "Value set version for expansions"))
        .arg(
            Arg::new("parameters")
                .long("parameters")
                .value_name("FILE")
                .help("FHIR Parameters JSON supplying additional arguments"),
        )
        .arg(
            Arg::new("output")
                .long("output")
                .short('o')
                .value_name("FILE")
                .help("Write the bundle to FILE instead of stdout"),
        )
}

fn single(name: &'static str, help: &'static str) -> Arg {
    Arg::new(name).long(name).value_name("VALUE").help(help)
}

fn repeated(name: &'static str, help: &'static str) -> Arg {
    single(name, help).action(ArgAction::Append)
}

pub fn run(session: &CliSession, matches: &ArgMatches) -> Result<CommandResult, CliError> {
    let raw = matches
        .get_one::<String>("reference")
        .ok_or_else(|| CliError::usage("reference is required"))?;
    let root = util::parse_reference(raw, "reference")?;

    let mut params = util::collect_parameters(matches, &FLAGS)?;
    if params.endpoint().is_none() {
        if let Some(endpoint) = &session.config.terminology.endpoint {
            params.set_endpoint(endpoint.clone());
        }
    }
    let params = PackageParams::from_parameters(&params)?;

    let bundle = PackageAssembler::new(session.repository(), &session.cache)
        .with_terminology(session.terminology.as_ref())
        .package(&root, &params)?;

    let output = match matches.get_one::<String>("output") {
        Some(path) => {
            let path = PathBuf::from(path);
            let mut body = serde_json::to_string_pretty(&bundle)?;
            body.push('\n');
            fs::write(&path, body).map_err(|err| {
                CliError::new(
                    format!("unable to write {}: {err}", path.display()),
                    ExitStatus::Io,
                )
            })?;
            Some(path.display().to_string())
        }
        None => None,
    };

    Ok(CommandResult::Package { bundle, output })
}
