//! Error types for the Halyard provisioning engine.
//!
//! Errors are grouped by the stage that raises them: loading declarations,
//! planning, talking to the provider, applying a plan, rendering local
//! artifacts and persisting state. Structural errors (config and plan) are
//! always raised before any provider call is made.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the Halyard provisioning engine.
#[derive(Debug, Error)]
pub enum HalyardError {
    /// Configuration and declaration loading errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Provider API errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Plan execution errors.
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    /// Output resolution and template rendering errors.
    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration and declaration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A configuration or declaration file was not found.
    #[error("File not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// A document could not be parsed.
    #[error("Failed to parse {}: {message}", .location.as_deref().unwrap_or("document"))]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location (file, line and column when known).
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// Two declarations share the same identity.
    #[error("Duplicate {kind} '{name}' declared at {first} and {second}")]
    DuplicateName {
        /// Kind of the duplicated declaration.
        kind: String,
        /// The duplicated name.
        name: String,
        /// Location of the first declaration.
        first: String,
        /// Location of the second declaration.
        second: String,
    },

    /// A reference points at something that is not declared.
    #[error("Unresolved reference '{reference}' in {resource} at {location}")]
    UnresolvedReference {
        /// Declaration containing the reference.
        resource: String,
        /// The reference as written.
        reference: String,
        /// Location of the declaration.
        location: String,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The dependency graph contains a cycle.
    #[error("Dependency cycle detected: {cycle} (declared at {location})")]
    Cycle {
        /// Resources on the cycle, joined with arrows.
        cycle: String,
        /// Location of the first resource on the cycle.
        location: String,
    },

    /// Recorded state cannot be ordered for teardown.
    #[error("Failed to resolve dependencies: {message}")]
    DependencyResolutionFailed {
        /// Description of the dependency issue.
        message: String,
    },

    /// The plan computed under the lock differs from the reviewed one.
    #[error("Plan changed since it was reviewed: {message}")]
    PlanChanged {
        /// Reviewed and current summaries.
        message: String,
    },
}

/// Provider API errors.
///
/// Transient variants are retried by the executor; everything else halts
/// the plan on first occurrence.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Rate limited by the provider.
    #[error("Provider rate limited, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// The request timed out.
    #[error("Provider request timed out during {operation}")]
    Timeout {
        /// Operation that timed out.
        operation: String,
    },

    /// Network failure talking to the provider.
    #[error("Network error communicating with provider: {message}")]
    NetworkError {
        /// Description of the network error.
        message: String,
    },

    /// The provider reported a temporary server-side failure.
    #[error("Provider unavailable: {status} - {message}")]
    Unavailable {
        /// HTTP status code.
        status: u16,
        /// Error message from the provider.
        message: String,
    },

    /// Authentication failed.
    #[error("Provider authentication failed: {message}")]
    AuthenticationFailed {
        /// Description of the auth failure.
        message: String,
    },

    /// The provider rejected the request.
    #[error("Provider request failed: {status} - {message}")]
    ApiRequestFailed {
        /// HTTP status code.
        status: u16,
        /// Error message from the provider.
        message: String,
    },

    /// The resource does not exist at the provider.
    #[error("{kind} '{id}' not found at provider")]
    NotFound {
        /// Resource kind.
        kind: String,
        /// Provider-assigned identifier.
        id: String,
    },

    /// The provider does not know the resource kind.
    #[error("Unsupported resource kind: {kind}")]
    UnsupportedKind {
        /// The unknown kind.
        kind: String,
    },

    /// Invalid response from the provider.
    #[error("Invalid response from provider: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },
}

/// Plan execution errors.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// An action failed, either fatally or after exhausting its retries.
    #[error("Failed to {operation} {resource} after {attempts} attempt(s): {message}")]
    ActionFailed {
        /// Resource address (`kind.name`).
        resource: String,
        /// Attempted operation.
        operation: String,
        /// Number of provider calls made.
        attempts: u32,
        /// Underlying provider message.
        message: String,
    },

    /// Execution stopped before every action ran.
    #[error("Apply interrupted: {completed} action(s) completed, {pending} not started")]
    Cancelled {
        /// Actions that finished before the interrupt.
        completed: usize,
        /// Actions that were never dispatched.
        pending: usize,
    },

    /// A reference could not be resolved when the action was about to run.
    #[error("Cannot resolve '{reference}' for {resource}: {reason}")]
    UnresolvedValue {
        /// Resource whose attributes contain the reference.
        resource: String,
        /// The reference as written.
        reference: String,
        /// Why the value is not available.
        reason: String,
    },
}

/// Output resolution and template rendering errors.
#[derive(Debug, Error)]
pub enum RenderError {
    /// An output references a resource that never reached the created state.
    #[error("Output '{output}' is unresolved: {resource} {reason}")]
    UnresolvedOutput {
        /// Output name.
        output: String,
        /// Referenced resource address.
        resource: String,
        /// Why the value is unavailable.
        reason: String,
    },

    /// A template uses a placeholder that is not a declared output.
    #[error("Template '{template}' uses undefined placeholder '{placeholder}'")]
    UndefinedPlaceholder {
        /// Template name.
        template: String,
        /// The placeholder.
        placeholder: String,
    },

    /// A template could not be parsed.
    #[error("Template '{template}' is malformed: {message}")]
    TemplateSyntax {
        /// Template name.
        template: String,
        /// Description of the problem.
        message: String,
    },

    /// An artifact could not be written or removed.
    #[error("Failed to write {path}: {message}")]
    WriteFailed {
        /// Target path.
        path: PathBuf,
        /// Description of the failure.
        message: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Local filesystem backend error.
    #[error("Local state backend error: {message}")]
    LocalError {
        /// Description of the filesystem error.
        message: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Result type alias for Halyard operations.
pub type Result<T> = std::result::Result<T, HalyardError>;

impl HalyardError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if the error was raised before any provider call.
    #[must_use]
    pub const fn is_structural(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Plan(_))
    }
}

impl ConfigError {
    /// Creates a parse error with an optional location.
    #[must_use]
    pub fn parse(message: impl Into<String>, location: Option<String>) -> Self {
        Self::ParseError {
            message: message.into(),
            location,
        }
    }

    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl ProviderError {
    /// Returns true if retrying the same call may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::Timeout { .. }
                | Self::NetworkError { .. }
                | Self::Unavailable { .. }
        )
    }

    /// Returns the delay requested by the provider, if any.
    #[must_use]
    pub const fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Creates an API request error.
    #[must_use]
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::ApiRequestFailed {
            status,
            message: message.into(),
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError {
            message: message.into(),
        }
    }
}

impl StateError {
    /// Creates a local backend error with the given message.
    #[must_use]
    pub fn local(message: impl Into<String>) -> Self {
        Self::LocalError {
            message: message.into(),
        }
    }

    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ProviderError::RateLimited { retry_after_secs: 3 }.is_transient());
        assert!(ProviderError::network("reset").is_transient());
        assert!(ProviderError::Unavailable { status: 503, message: String::new() }.is_transient());
        assert!(!ProviderError::api_error(400, "bad cidr").is_transient());
        assert!(
            !ProviderError::NotFound { kind: String::from("subnet"), id: String::from("s-1") }
                .is_transient()
        );
    }

    #[test]
    fn test_retry_after_only_for_rate_limits() {
        assert_eq!(
            ProviderError::RateLimited { retry_after_secs: 7 }.retry_after_secs(),
            Some(7)
        );
        assert_eq!(ProviderError::network("x").retry_after_secs(), None);
    }

    #[test]
    fn test_structural_errors() {
        let cycle = HalyardError::Plan(PlanError::Cycle {
            cycle: String::from("subnet.a -> subnet.a"),
            location: String::from("main.yaml: resources[0]"),
        });
        assert!(cycle.is_structural());
        assert!(!HalyardError::internal("boom").is_structural());
    }
}
