use std::process::ExitCode;

fn main() -> ExitCode {
    artifactman_cli::run()
}
