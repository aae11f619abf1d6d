//! Validation of the workspace file and loaded declarations.
//!
//! Validation collects every problem it finds. Errors stop the command;
//! warnings are reported and ignored.

use crate::error::{ConfigError, HalyardError, Result};
use tracing::debug;

use super::spec::{ProviderKind, StateBackend, WorkspaceConfig};
use crate::graph::ResourceGraph;
use crate::provider::SchemaRegistry;

/// Validator for workspaces and resource graphs.
#[derive(Debug)]
pub struct ConfigValidator {
    /// Kinds the provider is known to support.
    schemas: SchemaRegistry,
}

/// Validation result containing all problems found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Fatal problems.
    pub errors: Vec<ValidationError>,
    /// Non-fatal issues.
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field or declaration that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new(SchemaRegistry::builtin())
    }
}

impl ConfigValidator {
    /// Creates a validator that knows the given kinds.
    #[must_use]
    pub const fn new(schemas: SchemaRegistry) -> Self {
        Self { schemas }
    }

    /// Validates the workspace file.
    ///
    /// # Errors
    ///
    /// Returns the first error if any were found.
    pub fn validate(&self, config: &WorkspaceConfig) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();

        Self::validate_project(config, &mut result);
        Self::validate_backends(config, &mut result);
        Self::validate_executor(config, &mut result);

        if config.sources.is_empty() {
            result.error("sources", "At least one declaration source is required");
        }

        result.into_result("Workspace")
    }

    /// Validates a loaded resource graph.
    ///
    /// # Errors
    ///
    /// Returns the first error if any were found.
    pub fn validate_graph(&self, graph: &ResourceGraph, host_os: &str) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();

        for resource in graph.resources() {
            let id = &resource.id;
            for (part, value) in [("kind", &id.kind), ("name", &id.name)] {
                if !is_valid_name(value) {
                    result.error(
                        &resource.location.to_string(),
                        &format!(
                            "Resource {part} '{value}' is invalid. Must start with a letter and use lowercase letters, digits, '_' or '-'."
                        ),
                    );
                }
            }

            let Some(schema) = self.schemas.get(&id.kind) else {
                result
                    .warnings
                    .push(format!("{id}: kind '{}' is not known to the provider", id.kind));
                continue;
            };

            for attribute in resource.attributes.keys() {
                if schema.is_computed(attribute) {
                    result.warnings.push(format!(
                        "{id}.{attribute}: computed by the provider, the declared value may be ignored"
                    ));
                }
            }

            for attribute in &resource.replace_on_change {
                if !resource.attributes.contains_key(attribute) {
                    result.warnings.push(format!(
                        "{id}: replace_on_change names undeclared attribute '{attribute}'"
                    ));
                }
            }
        }

        for output in graph.outputs() {
            if !is_placeholder_name(&output.name) {
                result.error(
                    &output.location.to_string(),
                    &format!("Output name '{}' cannot be used as a template placeholder", output.name),
                );
            }
        }

        for render in graph.renders() {
            let selected = render.template_for(host_os);
            for template in std::iter::once(&render.template).chain(render.variants.values()) {
                if template.exists() {
                    continue;
                }
                let message = format!("Template not found: {}", template.display());
                if template == selected {
                    result.error(&render.location.to_string(), &message);
                } else {
                    result.warnings.push(format!("{}: {message}", render.location));
                }
            }
        }

        result.into_result("Declarations")
    }

    fn validate_project(config: &WorkspaceConfig, result: &mut ValidationResult) {
        let project = &config.project;
        if project.name.is_empty() {
            result.error("project.name", "Project name cannot be empty");
        } else if !is_valid_name(&project.name) {
            result.error(
                "project.name",
                &format!(
                    "Project name '{}' is invalid. Must start with a letter and use lowercase letters, digits, '_' or '-'.",
                    project.name
                ),
            );
        }

        if project.environment.is_empty() {
            result.error("project.environment", "Environment cannot be empty");
        }
    }

    fn validate_backends(config: &WorkspaceConfig, result: &mut ValidationResult) {
        if config.state.backend == StateBackend::S3
            && config.state.bucket.as_deref().is_none_or(str::is_empty)
        {
            result.error("state.bucket", "S3 bucket name is required when using S3 backend");
        }

        match config.provider.kind {
            ProviderKind::Http => match config.provider.endpoint.as_deref() {
                None | Some("") => {
                    result.error("provider.endpoint", "Endpoint is required for the http provider");
                }
                Some(endpoint) if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") => {
                    result.error(
                        "provider.endpoint",
                        &format!("Endpoint '{endpoint}' must start with http:// or https://"),
                    );
                }
                Some(endpoint) => {
                    if endpoint.starts_with("http://") {
                        result
                            .warnings
                            .push(String::from("provider.endpoint: token will be sent over plain http"));
                    }
                }
            },
            ProviderKind::Memory => {
                if config.state.backend == StateBackend::S3 {
                    result.warnings.push(String::from(
                        "provider.kind: memory resources vanish on exit but state is shared in S3",
                    ));
                }
            }
        }
    }

    fn validate_executor(config: &WorkspaceConfig, result: &mut ValidationResult) {
        let executor = &config.executor;
        if executor.parallelism == 0 {
            result.error("executor.parallelism", "Parallelism must be at least 1");
        }
        if executor.max_attempts == 0 {
            result.error("executor.max_attempts", "At least one attempt is required");
        }
        if executor.initial_backoff_ms > executor.max_backoff_ms {
            result.error(
                "executor.initial_backoff_ms",
                "Initial backoff cannot exceed max_backoff_ms",
            );
        }
    }
}

impl ValidationResult {
    fn error(&mut self, field: &str, message: &str) {
        self.errors.push(ValidationError {
            field: field.to_string(),
            message: message.to_string(),
        });
    }

    fn into_result(self, what: &str) -> Result<Self> {
        if self.errors.is_empty() {
            debug!("{what} validation passed with {} warnings", self.warnings.len());
            return Ok(self);
        }

        let first = &self.errors[0];
        Err(HalyardError::Config(ConfigError::ValidationError {
            message: first.message.clone(),
            field: Some(first.field.clone()),
        }))
    }

    /// Returns true if nothing was found.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.warnings.is_empty()
    }
}

/// Names start with a lowercase letter, then lowercase letters, digits, `_`
/// or `-`.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

fn is_placeholder_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::graph::{DeclarationLoader, SourceDocument};
    use crate::config::DeclarationDocument;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn workspace(yaml: &str) -> WorkspaceConfig {
        ConfigParser::new().parse_yaml(yaml, None).expect("parse")
    }

    fn graph(yaml: &str) -> ResourceGraph {
        let document: DeclarationDocument = serde_yaml::from_str(yaml).expect("document");
        DeclarationLoader::new(BTreeMap::new())
            .build(vec![SourceDocument {
                path: PathBuf::from("/nonexistent/main.yaml"),
                label: String::from("main.yaml"),
                document,
            }])
            .expect("graph")
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("route_table"));
        assert!(is_valid_name("devbox-2"));
        assert!(!is_valid_name("Main"));
        assert!(!is_valid_name("2nd"));
        assert!(!is_valid_name(""));
    }

    #[test]
    fn test_memory_workspace_is_valid() {
        let result = ConfigValidator::default()
            .validate(&workspace("project:\n  name: devbox\nprovider:\n  kind: memory\n"))
            .expect("valid");
        assert!(result.is_clean());
    }

    #[test]
    fn test_http_provider_requires_endpoint() {
        let err = ConfigValidator::default()
            .validate(&workspace("project:\n  name: devbox\n"))
            .expect_err("no endpoint");
        assert!(matches!(
            err,
            HalyardError::Config(ConfigError::ValidationError { field: Some(ref f), .. }) if f == "provider.endpoint"
        ));
    }

    #[test]
    fn test_s3_requires_bucket() {
        let err = ConfigValidator::default()
            .validate(&workspace(
                "project:\n  name: devbox\nprovider:\n  kind: memory\nstate:\n  backend: s3\n",
            ))
            .expect_err("no bucket");
        assert!(err.to_string().contains("S3 bucket"));
    }

    #[test]
    fn test_executor_bounds() {
        let err = ConfigValidator::default()
            .validate(&workspace(
                "project:\n  name: devbox\nprovider:\n  kind: memory\nexecutor:\n  parallelism: 0\n",
            ))
            .expect_err("zero parallelism");
        assert!(err.to_string().contains("Parallelism"));
    }

    #[test]
    fn test_graph_warnings() {
        let g = graph(
            r"
resources:
  - kind: instance
    name: dev
    attributes:
      image: ubuntu-24.04
      public_ip: 203.0.113.9
    lifecycle:
      replace_on_change: [instance_type]
  - kind: load_balancer
    name: front
",
        );
        let result = ConfigValidator::default()
            .validate_graph(&g, "linux")
            .expect("only warnings");

        assert_eq!(result.warnings.len(), 3);
        assert!(result.warnings.iter().any(|w| w.contains("load_balancer")));
        assert!(result.warnings.iter().any(|w| w.contains("instance.dev.public_ip")));
    }

    #[test]
    fn test_missing_template_is_error() {
        let g = graph(
            r"
renders:
  - name: ssh-config
    template: templates/ssh-config.tpl
    path: ~/.ssh/config.d/devbox
",
        );
        let err = ConfigValidator::default()
            .validate_graph(&g, "linux")
            .expect_err("missing template");
        assert!(err.to_string().contains("Template not found"));
    }
}
