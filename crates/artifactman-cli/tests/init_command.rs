use assert_cmd::Command;
use predicates::str::contains;
use tempfile::TempDir;

#[test]
fn init_creates_workspace() -> Result<(), Box<dyn std::error::Error>> {
    let temp = TempDir::new()?;
    let target = temp.path().join("workspace");

    let mut cmd = cli();
    cmd.args(["init", target.to_str().unwrap(), "--schema-version", "r5"]);

    cmd.assert()
        .success()
        .stdout(contains("Initialized workspace at"));

    assert!(target.join(".artifactman").is_dir());
    assert!(target.join("artifacts").is_dir());
    let config = std::fs::read_to_string(target.join(".artifactman/config.yaml"))?;
    assert!(config.contains("schemaVersion: r5"));
    Ok(())
}

#[test]
fn init_dry_run_does_not_write() -> Result<(), Box<dyn std::error::Error>> {
    let temp = TempDir::new()?;
    let target = temp.path().join("workspace-dry-run");

    let mut cmd = cli();
    cmd.args(["init", target.to_str().unwrap(), "--dry-run"]);

    cmd.assert()
        .success()
        .stdout(contains("Dry run: would initialize workspace"));

    assert!(!target.join(".artifactman").exists());
    Ok(())
}

#[test]
fn init_rejects_nested_workspace() -> Result<(), Box<dyn std::error::Error>> {
    let temp = TempDir::new()?;
    let parent = temp.path().join("parent");
    let child = parent.join("child");
    std::fs::create_dir_all(parent.join(".artifactman"))?;

    let mut cmd = cli();
    cmd.args(["init", child.to_str().unwrap()]);

    cmd.assert()
        .failure()
        .code(64)
        .stderr(contains("ancestor workspace"));
    Ok(())
}

#[test]
fn commands_outside_a_workspace_are_config_errors() -> Result<(), Box<dyn std::error::Error>> {
    let temp = TempDir::new()?;

    let mut cmd = cli();
    cmd.current_dir(temp.path())
        .args(["graph", "http://ex.org/Library/root"]);

    cmd.assert()
        .failure()
        .code(78)
        .stderr(contains("no .artifactman directory"));
    Ok(())
}

#[test]
fn schema_lists_config_keys() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = cli();
    cmd.arg("schema");

    cmd.assert()
        .success()
        .stdout(contains("schemaVersion"))
        .stdout(contains("artifactsDir"));
    Ok(())
}

fn cli() -> Command {
    Command::new(env!("CARGO_BIN_EXE_artifactman"))
}
