use artifactman::{HttpVerb, LifecycleOutcome, Operation};
use clap::{Arg, ArgAction, ArgMatches, Command};
use serde::Serialize;

use crate::commands::{ArtifactSummary, CommandResult};
use crate::context::CliSession;
use crate::error::CliError;
use crate::util;

pub const OPERATIONS: [&str; 6] = ["release", "draft", "approve", "retire", "withdraw", "delete"];

const RELEASE_FLAGS: [(&str, &str); 4] = [
    ("version", "version"),
    ("version-behavior", "versionBehavior"),
    ("release-label", "releaseLabel"),
    ("require-non-experimental", "requireNonExperimental"),
];

const DRAFT_FLAGS: [(&str, &str); 1] = [("version", "version")];

const APPROVE_FLAGS: [(&str, &str); 6] = [
    ("approval-date", "approvalDate"),
    ("type", "artifactAssessmentType"),
    ("summary", "artifactAssessmentSummary"),
    ("target", "artifactAssessmentTarget"),
    ("author", "artifactAssessmentAuthor"),
    ("related-artifact", "artifactAssessmentRelatedArtifact"),
];

/// One planned write of the lifecycle transaction.
#[derive(Clone, Debug, Serialize)]
pub struct ChangeSummary {
    pub method: HttpVerb,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canonical: Option<String>,
}

pub fn commands() -> Vec<Command> {
    vec![
        base("release", "Release a draft artifact and its owned components")
            .arg(value("version", "Version to release as"))
            .arg(
                value("version-behavior", "How the release version is chosen")
                    .value_parser(["default", "check", "force"]),
            )
            .arg(value("release-label", "Human readable label for the release"))
            .arg(
                value(
                    "require-non-experimental",
                    "Handling of experimental dependencies of a non-experimental root",
                )
                .value_parser(["none", "warn", "error"]),
            )
            .arg(
                Arg::new("latest-from-tx-server")
                    .long("latest-from-tx-server")
                    .action(ArgAction::SetTrue)
                    .help("Pin unversioned value sets to the terminology server's latest version"),
            ),
        base("draft", "Create a draft copy of an active or retired artifact")
            .arg(value("version", "Base version for the draft")),
        base("approve", "Record an approval of an artifact")
            .arg(value("approval-date", "Approval date (defaults to now)"))
            .arg(value("type", "Assessment information type (defaults to comment)"))
            .arg(value("summary", "Assessment summary text"))
            .arg(value("target", "Canonical the assessment is about"))
            .arg(value("author", "Reference to the approving author"))
            .arg(value("related-artifact", "Reference to a supporting artifact")),
        base("retire", "Retire an active artifact and its owned components"),
        base("withdraw", "Withdraw a draft artifact and its owned components"),
        base("delete", "Delete a retired artifact and its owned components"),
    ]
}

fn base(name: &'static str, about: &'static str) -> Command {
    Command::new(name)
        .about(about)
        .arg(
            Arg::new("reference")
                .value_name("URL[|VERSION]")
                .required(true)
                .help("Canonical reference of the root artifact"),
        )
        .arg(
            Arg::new("parameters")
                .long("parameters")
                .value_name("FILE")
                .help("FHIR Parameters JSON supplying additional arguments"),
        )
        .arg(
            Arg::new("dry-run")
                .long("dry-run")
                .action(ArgAction::SetTrue)
                .help("Plan the operation without writing to disk"),
        )
}

fn value(name: &'static str, help: &'static str) -> Arg {
    Arg::new(name).long(name).value_name("VALUE").help(help)
}

pub fn run(session: &CliSession, name: &str, matches: &ArgMatches) -> Result<CommandResult, CliError> {
    let raw = matches
        .get_one::<String>("reference")
        .ok_or_else(|| CliError::usage("reference is required"))?;
    let root = util::parse_reference(raw, "reference")?;
    let dry_run = matches.get_flag("dry-run");

    let flags: &[(&str, &str)] = match name {
        "release" => &RELEASE_FLAGS,
        "draft" => &DRAFT_FLAGS,
        "approve" => &APPROVE_FLAGS,
        _ => &[],
    };
    let mut params = util::collect_parameters(matches, flags)?;
    util::push_flag(&mut params, matches, "latest-from-tx-server", "latestFromTxServer");
    if params.endpoint().is_none() {
        if let Some(endpoint) = &session.config.terminology.endpoint {
            params.set_endpoint(endpoint.clone());
        }
    }

    let operation = Operation::from_parameters(name, &params)?;
    let outcome = session.lifecycle.apply(&root, operation)?;
    if dry_run {
        tracing::info!(root = %root, operation = name, "dry run, nothing committed");
    } else {
        session.lifecycle.commit(&outcome)?;
    }

    Ok(summarize(name, outcome, dry_run))
}

fn summarize(name: &str, outcome: LifecycleOutcome, dry_run: bool) -> CommandResult {
    let changes = outcome
        .mutations
        .entry
        .iter()
        .filter_map(|entry| {
            let request = entry.request.as_ref()?;
            Some(ChangeSummary {
                method: request.method,
                url: request.url.clone(),
                canonical: entry
                    .resource
                    .as_ref()
                    .and_then(|resource| resource.as_artifact())
                    .map(|artifact| artifact.canonical().to_string()),
            })
        })
        .collect();
    CommandResult::Lifecycle {
        operation: name.to_string(),
        root: ArtifactSummary::of(&outcome.root),
        changes,
        warnings: outcome.warnings,
        dry_run,
    }
}
