use artifactman::{DependencyGraphWalker, RelationType, WalkOptions};
use clap::{Arg, ArgAction, ArgMatches, Command};
use serde::Serialize;

use crate::commands::CommandResult;
use crate::context::CliSession;
use crate::error::CliError;
use crate::util;

#[derive(Clone, Debug, Serialize)]
pub struct NodeSummary {
    pub reference: String,
    pub depth: usize,
    pub resolved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct EdgeSummary {
    pub source: usize,
    pub target: usize,
    pub relation: RelationType,
    pub owned: bool,
}

pub fn command() -> Command {
    Command::new("graph")
        .about("Show the dependency graph of an artifact")
        .arg(
            Arg::new("reference")
                .value_name("URL[|VERSION]")
                .required(true)
                .help("Canonical reference of the root artifact"),
        )
        .arg(
            Arg::new("owned")
                .long("owned")
                .action(ArgAction::SetTrue)
                .help("Follow owned components only"),
        )
}

pub fn run(session: &CliSession, matches: &ArgMatches) -> Result<CommandResult, CliError> {
    let raw = matches
        .get_one::<String>("reference")
        .ok_or_else(|| CliError::usage("reference is required"))?;
    let root = util::parse_reference(raw, "reference")?;
    let options = if matches.get_flag("owned") {
        WalkOptions::owned_only()
    } else {
        WalkOptions::transitive()
    };
    let graph = DependencyGraphWalker::new(session.repository(), options).collect(&root)?;

    let nodes = graph
        .nodes()
        .iter()
        .map(|node| NodeSummary {
            reference: node.canonical().to_string(),
            depth: node.depth,
            resolved: node.is_resolved(),
            resource_type: node
                .artifact
                .as_ref()
                .map(|artifact| artifact.resource_type.clone()),
            status: node
                .artifact
                .as_ref()
                .map(|artifact| artifact.status.to_string()),
        })
        .collect();
    let edges = graph
        .edges()
        .iter()
        .map(|edge| EdgeSummary {
            source: edge.source,
            target: edge.target,
            relation: edge.relation,
            owned: edge.owned,
        })
        .collect();
    let unresolved = graph
        .unresolved()
        .filter(|node| !node.reference.is_contained())
        .map(|node| node.reference.to_string())
        .collect();

    Ok(CommandResult::Graph {
        root: root.to_string(),
        nodes,
        edges,
        unresolved,
    })
}
