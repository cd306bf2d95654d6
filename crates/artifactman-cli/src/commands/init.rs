use std::env;
use std::path::{Component, Path, PathBuf};

use artifactman::workspace::DOT_DIR;
use artifactman::{SchemaVersion, WorkspaceConfig, init_workspace};
use clap::{Arg, ArgAction, ArgMatches, Command};

use crate::commands::CommandResult;
use crate::error::{CliError, ExitStatus};

pub fn command() -> Command {
    Command::new("init")
        .about("Initialize an artifact workspace")
        .arg(
            Arg::new("path")
                .value_name("PATH")
                .help("Workspace root to initialize. Defaults to the current directory."),
        )
        .arg(
            Arg::new("artifacts-dir")
                .long("artifacts-dir")
                .value_name("DIR")
                .help("Directory holding artifact JSON files, relative to the root. Defaults to 'artifacts'."),
        )
        .arg(
            Arg::new("dry-run")
                .long("dry-run")
                .action(ArgAction::SetTrue)
                .help("Show the resolved workspace root without writing to disk."),
        )
}

pub fn run(
    workspace_override: Option<String>,
    schema_override: Option<SchemaVersion>,
    matches: &ArgMatches,
) -> Result<CommandResult, CliError> {
    let positional = matches.get_one::<String>("path").cloned();
    let target = workspace_override
        .or(positional)
        .unwrap_or_else(|| ".".to_string());
    let dry_run = matches.get_flag("dry-run");

    let mut config = WorkspaceConfig::default();
    if let Some(schema_version) = schema_override {
        config.schema_version = schema_version;
    }
    if let Some(dir) = matches.get_one::<String>("artifacts-dir") {
        config.artifacts_dir = PathBuf::from(dir);
    }

    let root = absolutize(&target)?;
    let plan = plan_workspace(&root)?;
    let artifacts_dir = config.artifacts_path(&plan.root).display().to_string();

    if dry_run {
        return Ok(CommandResult::WorkspaceInitialized {
            root: plan.root.display().to_string(),
            dot_dir: plan.dot_dir.display().to_string(),
            artifacts_dir,
            created: !plan.already_initialized,
            dry_run: true,
        });
    }

    let paths = init_workspace(&plan.root, &config)?;
    let effective = paths.load_config()?;
    Ok(CommandResult::WorkspaceInitialized {
        root: paths.root().display().to_string(),
        dot_dir: paths.dot_dir().display().to_string(),
        artifacts_dir: effective.artifacts_path(paths.root()).display().to_string(),
        created: !plan.already_initialized,
        dry_run: false,
    })
}

struct InitPlan {
    root: PathBuf,
    dot_dir: PathBuf,
    already_initialized: bool,
}

fn plan_workspace(root: &Path) -> Result<InitPlan, CliError> {
    if root.exists() && !root.is_dir() {
        return Err(CliError::usage(format!(
            "workspace root {} is not a directory",
            root.display()
        )));
    }

    let dot_dir = root.join(DOT_DIR);
    let already_initialized = dot_dir.is_dir();
    for ancestor in root.ancestors().skip(1) {
        let existing = ancestor.join(DOT_DIR);
        if existing.is_dir() {
            return Err(CliError::usage(format!(
                "cannot initialize workspace at {}; ancestor workspace already exists at {}",
                root.display(),
                existing.display()
            )));
        }
    }

    Ok(InitPlan {
        root: root.to_path_buf(),
        dot_dir,
        already_initialized,
    })
}

fn absolutize(raw: &str) -> Result<PathBuf, CliError> {
    let candidate = PathBuf::from(raw);
    let base = if candidate.is_absolute() {
        candidate
    } else {
        env::current_dir()
            .map_err(|err| CliError::new(err.to_string(), ExitStatus::Io))?
            .join(candidate)
    };

    Ok(lexical_normalize(&base))
}

fn lexical_normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();

    for component in path.components() {
        match component {
            Component::Prefix(prefix) => normalized.push(prefix.as_os_str()),
            Component::RootDir => normalized.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if normalized
                    .components()
                    .next_back()
                    .is_some_and(|c| matches!(c, Component::Normal(_)))
                {
                    normalized.pop();
                }
            }
            Component::Normal(part) => normalized.push(part),
        }
    }

    normalized
}
