use artifactman::config_schema;
use clap::Command;

use crate::commands::CommandResult;
use crate::error::CliError;

pub fn command() -> Command {
    Command::new("schema").about("Print the JSON schema of .artifactman/config.yaml")
}

pub fn run() -> Result<CommandResult, CliError> {
    Ok(CommandResult::ConfigSchema {
        schema: serde_json::to_value(config_schema())?,
    })
}
