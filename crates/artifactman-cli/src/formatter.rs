use std::collections::BTreeMap;
use std::process::ExitCode;

use artifactman::{Bundle, DiffOperationType, IssueSeverity};
use serde_json::json;

use crate::commands::CommandResult;
use crate::commands::graph::{EdgeSummary, NodeSummary};
use crate::error::CliError;

pub enum OutputFormat {
    Text,
    Json,
}

/// Prints a `CommandResult` as text or one JSON object and maps it to an exit code.
pub fn emit_result(result: CommandResult, format: OutputFormat) -> Result<ExitCode, CliError> {
    match format {
        OutputFormat::Text => print_text(&result),
        OutputFormat::Json => print_json(&result)?,
    };
    Ok(ExitCode::from(result.exit_status().code()))
}

fn print_text(result: &CommandResult) {
    match result {
        CommandResult::WorkspaceInitialized {
            root,
            dot_dir,
            artifacts_dir,
            created,
            dry_run,
        } => {
            if *dry_run {
                if *created {
                    println!("Dry run: would initialize workspace at {root} (.artifactman at {dot_dir})");
                } else {
                    println!("Dry run: workspace already initialized at {root} (.artifactman at {dot_dir})");
                }
            } else if *created {
                println!("Initialized workspace at {root} (.artifactman: {dot_dir})");
                println!("Artifacts directory: {artifacts_dir}");
            } else {
                println!("Workspace already initialized at {root} (.artifactman: {dot_dir})");
            }
        }
        CommandResult::ConfigSchema { schema } => {
            println!(
                "{}",
                serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string())
            );
        }
        CommandResult::Graph {
            root,
            nodes,
            edges,
            unresolved,
        } => {
            println!("Dependency graph for {root} ({} artifacts)", nodes.len());
            if let Some(first) = nodes.first() {
                println!("{}", node_label(first));
                let children = build_children_map(edges);
                let mut stack = Vec::new();
                render_children(0, nodes, &children, String::new(), &mut stack);
            }
            if !unresolved.is_empty() {
                println!("Unresolved references ({}):", unresolved.len());
                for reference in unresolved {
                    println!("  - {reference}");
                }
            }
        }
        CommandResult::Lifecycle {
            operation,
            root,
            changes,
            warnings,
            dry_run,
        } => {
            let verb = capitalize(operation);
            if *dry_run {
                println!("Dry run: {verb} of {} would write {} resources", root.label(), changes.len());
            } else {
                println!("{verb}: {} ({} resources written)", root.label(), changes.len());
            }
            for change in changes {
                let method = serde_json::to_value(change.method)
                    .ok()
                    .and_then(|value| value.as_str().map(str::to_string))
                    .unwrap_or_default();
                match &change.canonical {
                    Some(canonical) => println!("  {method} {} [{canonical}]", change.url),
                    None => println!("  {method} {}", change.url),
                }
            }
            for warning in warnings {
                println!("  [WARN] {warning}");
            }
        }
        CommandResult::Package { bundle, output } => {
            print_bundle(bundle);
            if let Some(path) = output {
                println!("Bundle written to {path}");
            }
        }
        CommandResult::Diff {
            changelog,
            format,
            document,
            output,
        } => match output {
            Some(path) => println!(
                "Wrote {format} changelog to {path} ({} insertions, {} deletions, {} replacements)",
                changelog.count(DiffOperationType::Insert),
                changelog.count(DiffOperationType::Delete),
                changelog.count(DiffOperationType::Replace)
            ),
            None => println!("{document}"),
        },
    }
}

fn print_json(result: &CommandResult) -> Result<(), CliError> {
    let payload = json!(result);
    println!("{payload}");
    Ok(())
}

fn print_bundle(bundle: &Bundle) {
    match bundle.total {
        Some(total) => println!(
            "Bundle ({}): {} of {total} entries",
            bundle.kind,
            bundle.entry.len()
        ),
        None => println!("Bundle ({}): {} entries", bundle.kind, bundle.entry.len()),
    }
    for artifact in bundle.artifacts() {
        println!(
            "  - {} {}",
            artifact.resource_type,
            artifact.canonical()
        );
    }
    for issue in &bundle.issue {
        let tag = match issue.severity {
            IssueSeverity::Error => "ERR",
            IssueSeverity::Warning => "WARN",
            IssueSeverity::Information => "INFO",
        };
        println!("  [{tag}] {}", issue.diagnostics);
    }
}

fn build_children_map(edges: &[EdgeSummary]) -> BTreeMap<usize, Vec<&EdgeSummary>> {
    let mut map: BTreeMap<usize, Vec<&EdgeSummary>> = BTreeMap::new();
    for edge in edges {
        map.entry(edge.source).or_default().push(edge);
    }
    map
}

fn render_children(
    parent: usize,
    nodes: &[NodeSummary],
    children_map: &BTreeMap<usize, Vec<&EdgeSummary>>,
    prefix: String,
    stack: &mut Vec<usize>,
) {
    let Some(children) = children_map.get(&parent) else {
        return;
    };
    stack.push(parent);
    for (index, edge) in children.iter().enumerate() {
        let Some(child) = nodes.get(edge.target) else {
            continue;
        };
        let last = index + 1 == children.len();
        let connector = if last { "└──" } else { "├──" };
        let relation = serde_json::to_value(edge.relation)
            .ok()
            .and_then(|value| value.as_str().map(str::to_string))
            .unwrap_or_default();
        let owned = if edge.owned { ", owned" } else { "" };
        if stack.contains(&edge.target) {
            println!("{prefix}{connector} {} [{relation}{owned}] (cycle detected)", node_label(child));
            continue;
        }
        println!("{prefix}{connector} {} [{relation}{owned}]", node_label(child));
        let next_prefix = format!("{prefix}{}", if last { "    " } else { "│   " });
        render_children(edge.target, nodes, children_map, next_prefix, stack);
    }
    stack.pop();
}

fn node_label(node: &NodeSummary) -> String {
    match (&node.resource_type, &node.status) {
        (Some(resource_type), Some(status)) => {
            format!("{resource_type} {} ({status})", node.reference)
        }
        _ => format!("{} (unresolved)", node.reference),
    }
}

fn capitalize(input: &str) -> String {
    let mut chars = input.chars();
    match chars.next() {
        Some(first) => format!("{}{}", first.to_ascii_uppercase(), chars.as_str()),
        None => String::new(),
    }
}
