//! Configuration for a Halyard workspace.
//!
//! This module covers:
//! - the workspace file `halyard.yaml` and its environment overrides
//! - the declaration document format read by the loader
//! - validation of both
//! - declaration hashes for change detection

mod hash;
mod parser;
mod spec;
mod validator;

pub use hash::ConfigHasher;
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use spec::{
    DeclarationDocument, ExecutorConfig, LifecycleConfig, OutputDecl, ProjectConfig,
    ProviderConfig, ProviderKind, RenderDecl, ResourceDecl, StateBackend, StateConfig,
    WorkspaceConfig,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
