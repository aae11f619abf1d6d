//! Workspace file loading.
//!
//! The workspace file is YAML. Environment variables prefixed with
//! `HALYARD_` override selected fields, and `HALYARD_VAR_<NAME>` sets the
//! declaration variable whose name matches `NAME` ignoring case, or `name`
//! if none is declared.

use crate::error::{ConfigError, HalyardError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::WorkspaceConfig;

/// Prefix of variables that set declaration variables.
const VAR_PREFIX: &str = "HALYARD_VAR_";

/// Default workspace file names, searched in order.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["halyard.yaml", "halyard.yml"];

/// Parser for workspace files.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Directory holding `.env`.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the directory `.env` is loaded from.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads a workspace file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<WorkspaceConfig> {
        let path = path.as_ref();
        info!("Loading workspace from: {}", path.display());

        if !path.exists() {
            return Err(HalyardError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            HalyardError::Config(ConfigError::parse(
                format!("Failed to read file: {e}"),
                Some(path.display().to_string()),
            ))
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses a workspace from YAML.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<WorkspaceConfig> {
        let config: WorkspaceConfig = serde_yaml::from_str(content).map_err(|e| {
            let file = source.map_or_else(|| String::from("workspace"), |p| p.display().to_string());
            let location = e
                .location()
                .map_or_else(|| file.clone(), |l| format!("{file}:{}:{}", l.line(), l.column()));
            HalyardError::Config(ConfigError::parse(e.to_string(), Some(location)))
        })?;

        debug!("Parsed workspace for project: {}", config.project.name);
        Ok(config)
    }

    /// Loads a workspace file and applies environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an
    /// override has an invalid value.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<WorkspaceConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_overrides(&mut config, std::env::vars())?;
        Ok(config)
    }

    /// Applies `HALYARD_*` overrides from `vars`.
    ///
    /// # Errors
    ///
    /// Returns an error if `HALYARD_PARALLELISM` is not a number.
    pub fn apply_overrides(
        config: &mut WorkspaceConfig,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Result<()> {
        for (key, value) in vars {
            match key.as_str() {
                "HALYARD_PROJECT_NAME" => config.project.name = value,
                "HALYARD_PROJECT_ENVIRONMENT" => config.project.environment = value,
                "HALYARD_STATE_BUCKET" => config.state.bucket = Some(value),
                "HALYARD_STATE_PREFIX" => config.state.prefix = Some(value),
                "HALYARD_PROVIDER_ENDPOINT" => config.provider.endpoint = Some(value),
                "HALYARD_PARALLELISM" => {
                    config.executor.parallelism = value.parse().map_err(|_| {
                        HalyardError::Config(ConfigError::validation(
                            format!("HALYARD_PARALLELISM must be a number, got '{value}'"),
                            "executor.parallelism",
                        ))
                    })?;
                }
                _ => {
                    if let Some(name) = key.strip_prefix(VAR_PREFIX).filter(|n| !n.is_empty()) {
                        let declared = config
                            .variables
                            .keys()
                            .find(|declared| declared.eq_ignore_ascii_case(name))
                            .cloned();
                        let name = declared.unwrap_or_else(|| name.to_lowercase());
                        config.variables.insert(name, value);
                    } else {
                        continue;
                    }
                }
            }
            debug!("Applied override from {key}");
        }
        Ok(())
    }

    /// Loads `.env` if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                HalyardError::Config(ConfigError::parse(
                    format!("Failed to load .env file: {e}"),
                    Some(env_path.display().to_string()),
                ))
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

/// Finds the workspace file in `start_dir` or one of its parents.
///
/// # Errors
///
/// Returns an error if no workspace file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                debug!("Found workspace file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(HalyardError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProviderKind, StateBackend};
    use tempfile::TempDir;

    #[test]
    fn test_parse_minimal_workspace() {
        let yaml = r"
project:
  name: devbox
";
        let config = ConfigParser::new().parse_yaml(yaml, None).expect("parse");
        assert_eq!(config.project.name, "devbox");
        assert_eq!(config.project.environment, "dev");
        assert_eq!(config.state.backend, StateBackend::Local);
        assert_eq!(config.sources, vec![String::from("infra")]);
        assert_eq!(config.executor.parallelism, 4);
    }

    #[test]
    fn test_parse_full_workspace() {
        let yaml = r#"
project:
  name: devbox
  environment: prod
state:
  backend: s3
  bucket: halyard-state
  prefix: teams/infra
  region: eu-west-1
provider:
  kind: memory
executor:
  parallelism: 8
  max_attempts: 3
sources: [infra, extra.yaml]
variables:
  my_ip: "198.51.100.7"
host_os: windows
"#;
        let config = ConfigParser::new().parse_yaml(yaml, None).expect("parse");
        assert_eq!(config.state.bucket.as_deref(), Some("halyard-state"));
        assert_eq!(config.provider.kind, ProviderKind::Memory);
        assert_eq!(config.executor.max_attempts, 3);
        assert_eq!(config.executor.initial_backoff_ms, 500);
        assert_eq!(config.variables["my_ip"], "198.51.100.7");
        assert_eq!(config.effective_host_os(), "windows");
        assert_eq!(config.qualified_name(), "devbox-prod");
    }

    #[test]
    fn test_parse_error_has_location() {
        let err = ConfigParser::new()
            .parse_yaml("project:\n  name: [unclosed\n", Some(Path::new("halyard.yaml")))
            .expect_err("invalid yaml");
        let message = err.to_string();
        assert!(message.contains("halyard.yaml:"), "{message}");
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ConfigParser::new()
            .parse_yaml("project:\n  name: devbox\n", None)
            .expect("parse");

        ConfigParser::apply_overrides(
            &mut config,
            vec![
                (String::from("HALYARD_PROJECT_ENVIRONMENT"), String::from("staging")),
                (String::from("HALYARD_PARALLELISM"), String::from("2")),
                (String::from("HALYARD_VAR_MY_IP"), String::from("192.0.2.10")),
                (String::from("HOME"), String::from("/root")),
            ],
        )
        .expect("overrides");

        assert_eq!(config.project.environment, "staging");
        assert_eq!(config.executor.parallelism, 2);
        assert_eq!(config.variables["my_ip"], "192.0.2.10");
    }

    #[test]
    fn test_variable_override_keeps_declared_case() {
        let mut config = ConfigParser::new()
            .parse_yaml("project:\n  name: devbox\nvariables:\n  myIP: 198.51.100.7\n", None)
            .expect("parse");

        ConfigParser::apply_overrides(
            &mut config,
            vec![(String::from("HALYARD_VAR_MYIP"), String::from("192.0.2.10"))],
        )
        .expect("overrides");

        assert_eq!(config.variables.len(), 1);
        assert_eq!(config.variables["myIP"], "192.0.2.10");
    }

    #[test]
    fn test_invalid_parallelism_override() {
        let mut config = ConfigParser::new()
            .parse_yaml("project:\n  name: devbox\n", None)
            .expect("parse");
        let result = ConfigParser::apply_overrides(
            &mut config,
            vec![(String::from("HALYARD_PARALLELISM"), String::from("many"))],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_find_config_walks_up() {
        let dir = TempDir::new().expect("temp dir");
        std::fs::write(dir.path().join("halyard.yaml"), "project:\n  name: devbox\n").expect("write");
        let nested = dir.path().join("infra/scripts");
        std::fs::create_dir_all(&nested).expect("mkdir");

        let found = find_config_file(&nested).expect("found");
        assert_eq!(found, dir.path().join("halyard.yaml"));
    }
}
