use std::fs;
use std::path::Path;

use artifactman::{CanonicalReference, ParameterMap};
use clap::ArgMatches;

use crate::error::{CliError, ExitStatus};

#[derive(Clone, Copy, Debug, Default)]
pub struct Verbosity {
    pub json: bool,
    pub verbose: bool,
}

/// Parses a `url` or `url|version` argument.
pub fn parse_reference(raw: &str, field: &str) -> Result<CanonicalReference, CliError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(CliError::usage(format!("{field} must not be empty")));
    }
    CanonicalReference::parse(trimmed)
        .map_err(|err| CliError::usage(format!("{field} '{trimmed}' is invalid: {err}")))
}

/// Starts from a FHIR `Parameters` file (JSON, or YAML by extension) when `--parameters` is
/// given, then layers the named flags on top as `(flag id, parameter name)` pairs.
pub fn collect_parameters(
    matches: &ArgMatches,
    flags: &[(&str, &str)],
) -> Result<ParameterMap, CliError> {
    let mut params = match matches.try_get_one::<String>("parameters").ok().flatten() {
        Some(path) => read_parameters(Path::new(path))?,
        None => ParameterMap::new(),
    };
    for (flag, name) in flags {
        let Ok(Some(values)) = matches.try_get_many::<String>(flag) else {
            continue;
        };
        for value in values {
            params.push(name, value.clone());
        }
    }
    Ok(params)
}

/// Boolean flags contribute `true` only when set.
pub fn push_flag(params: &mut ParameterMap, matches: &ArgMatches, flag: &str, name: &str) {
    if matches.try_get_one::<bool>(flag).ok().flatten().copied().unwrap_or(false) {
        params.push(name, "true");
    }
}

fn read_parameters(path: &Path) -> Result<ParameterMap, CliError> {
    let raw = fs::read_to_string(path).map_err(|err| {
        CliError::new(
            format!("unable to read parameters {}: {err}", path.display()),
            ExitStatus::Io,
        )
    })?;
    let yaml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));
    let value: serde_json::Value = if yaml {
        serde_yaml::from_str(&raw).map_err(|err| {
            CliError::usage(format!("parameters {} is not valid YAML: {err}", path.display()))
        })?
    } else {
        serde_json::from_str(&raw).map_err(|err| {
            CliError::usage(format!("parameters {} is not valid JSON: {err}", path.display()))
        })?
    };
    Ok(ParameterMap::from_parameters_resource(&value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_reference_is_usage_error() {
        let err = parse_reference("  ", "root").expect_err("empty");
        assert_eq!(err.status(), ExitStatus::Usage);
    }

    #[test]
    fn versioned_reference_is_split() {
        let reference = parse_reference("http://ex.org/Library/a|1.0.0", "root").unwrap();
        assert_eq!(reference.url(), "http://ex.org/Library/a");
        assert_eq!(reference.version(), Some("1.0.0"));
    }

    #[test]
    fn yaml_parameters_file_is_read() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("release.yaml");
        fs::write(
            &path,
            "resourceType: Parameters\nparameter:\n  - name: versionBehavior\n    valueCode: force\n  - name: version\n    valueString: \"2.0.0\"\n",
        )
        .unwrap();

        let params = read_parameters(&path).unwrap();
        assert_eq!(params.string("versionBehavior"), Some("force"));
        assert_eq!(params.string("version"), Some("2.0.0"));
    }

    #[test]
    fn malformed_parameters_file_is_usage_error() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("broken.json");
        fs::write(&path, "{ not json").unwrap();

        let err = read_parameters(&path).expect_err("malformed");
        assert_eq!(err.status(), ExitStatus::Usage);
    }
}
