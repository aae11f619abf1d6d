//! Configuration specification types.
//!
//! Two kinds of YAML files are described here: the workspace file
//! (`halyard.yaml`), which says where state lives, which provider to talk to
//! and where the declarations are; and declaration documents, which hold the
//! resources, outputs and rendered artifacts themselves.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// The root structure of `halyard.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkspaceConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Provider configuration.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Apply executor tuning.
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Declaration files or directories, relative to the workspace file.
    #[serde(default = "default_sources")]
    pub sources: Vec<String>,
    /// Values substituted for `${var.NAME}` at load time.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    /// Selects template variants; defaults to the running OS.
    #[serde(default)]
    pub host_os: Option<String>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Which provider implementation to use.
    #[serde(default)]
    pub kind: ProviderKind,
    /// Base URL of the provider API (http provider only).
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Environment variable holding the API token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
}

/// Provider implementations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// JSON REST provider API.
    #[default]
    Http,
    /// Simulated in-process provider.
    Memory,
}

/// Apply executor tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Maximum number of provider operations in flight.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Provider calls per action, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound for any single retry delay, in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

/// A declaration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DeclarationDocument {
    /// Declared resources.
    #[serde(default)]
    pub resources: Vec<ResourceDecl>,
    /// Named values exposed after apply.
    #[serde(default)]
    pub outputs: Vec<OutputDecl>,
    /// Local files rendered from outputs.
    #[serde(default)]
    pub renders: Vec<RenderDecl>,
}

/// A single resource block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ResourceDecl {
    /// Resource kind (e.g. `network`, `instance`).
    pub kind: String,
    /// Logical name, unique per kind.
    pub name: String,
    /// Attribute values; strings may contain `${kind.name.attr}` references.
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    /// Extra dependencies written as `kind.name`.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Attributes loaded verbatim from files, relative to the document.
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    /// Lifecycle overrides.
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

/// Per-resource lifecycle overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LifecycleConfig {
    /// Attributes whose change forces replacement.
    #[serde(default)]
    pub replace_on_change: Vec<String>,
}

/// A named output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct OutputDecl {
    /// Output name, used as the template placeholder.
    pub name: String,
    /// Expression, e.g. `${instance.dev_node.public_ip}`.
    pub value: String,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
    /// Hide the value in CLI output.
    #[serde(default)]
    pub sensitive: bool,
}

/// A local file rendered from outputs after apply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RenderDecl {
    /// Artifact name.
    pub name: String,
    /// Default template path.
    pub template: String,
    /// Template overrides keyed by host OS (`linux`, `macos`, `windows`).
    #[serde(default)]
    pub variants: BTreeMap<String, String>,
    /// Target path; `~/` expands to the home directory.
    pub path: String,
}

// Default value functions

const fn default_parallelism() -> usize {
    4
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_initial_backoff_ms() -> u64 {
    500
}

const fn default_max_backoff_ms() -> u64 {
    30_000
}

const fn default_request_timeout() -> u64 {
    30
}

fn default_token_env() -> String {
    String::from("HALYARD_PROVIDER_TOKEN")
}

fn default_environment() -> String {
    String::from("dev")
}

fn default_sources() -> Vec<String> {
    vec![String::from("infra")]
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::default(),
            endpoint: None,
            token_env: default_token_env(),
            timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl WorkspaceConfig {
    /// Returns the fully qualified project name including environment.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }

    /// Returns the OS used to pick template variants.
    #[must_use]
    pub fn effective_host_os(&self) -> String {
        self.host_os
            .clone()
            .unwrap_or_else(|| std::env::consts::OS.to_string())
    }
}

impl RenderDecl {
    /// Returns the template to use for the given host OS.
    #[must_use]
    pub fn template_for(&self, host_os: &str) -> &str {
        self.variants
            .get(host_os)
            .map_or(self.template.as_str(), String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_defaults() {
        let config: WorkspaceConfig = serde_yaml::from_str("project:\n  name: devbox\n")
            .expect("minimal workspace should parse");

        assert_eq!(config.project.environment, "dev");
        assert_eq!(config.state.backend, StateBackend::Local);
        assert_eq!(config.provider.kind, ProviderKind::Http);
        assert_eq!(config.executor.parallelism, 4);
        assert_eq!(config.sources, vec![String::from("infra")]);
        assert_eq!(config.qualified_name(), "devbox-dev");
    }

    #[test]
    fn test_template_variant_selection() {
        let render = RenderDecl {
            name: String::from("ssh-config"),
            template: String::from("ssh-config.tpl"),
            variants: BTreeMap::from([(
                String::from("windows"),
                String::from("ssh-config-windows.tpl"),
            )]),
            path: String::from("~/.ssh/config.d/dev"),
        };

        assert_eq!(render.template_for("windows"), "ssh-config-windows.tpl");
        assert_eq!(render.template_for("linux"), "ssh-config.tpl");
    }

    #[test]
    fn test_unknown_resource_field_rejected() {
        let yaml = "resources:\n  - kind: network\n    name: main\n    atributes: {}\n";
        let result: Result<DeclarationDocument, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err());
    }
}
