// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![forbid(unsafe_code)]               // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![warn(dead_code)]                   // Unused code is flagged
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![warn(unused_imports)]              // Unused imports are flagged
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// Tests may unwrap and expect freely.
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Halyard
//!
//! Declarative, dependency-ordered infrastructure provisioning.
//!
//! ## Overview
//!
//! Resources are declared in YAML with `${kind.name.attribute}` references
//! between them. Halyard turns the declarations into a dependency graph,
//! diffs it against recorded state and produces an ordered plan of
//! create, update and destroy actions. Apply runs independent actions
//! concurrently, retries transient provider errors and records state after
//! every action, so an interrupted run picks up where it stopped. After a
//! successful apply, outputs are resolved and rendered into local files such
//! as an SSH client entry.
//!
//! ## Modules
//!
//! - [`config`]: Workspace file, declaration format and validation
//! - [`graph`]: Declaration loader and the resource graph
//! - [`provider`]: Provider capability trait, HTTP and in-memory providers
//! - [`planner`]: Diff, plan, retry policy and the apply executor
//! - [`render`]: Output resolution and template rendering
//! - [`state`]: State storage backends (local, S3) and locking
//! - [`reconciler`]: Command-level orchestration
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! resources:
//!   - kind: network
//!     name: main
//!     attributes:
//!       cidr_block: 10.0.0.0/16
//!   - kind: subnet
//!     name: public
//!     attributes:
//!       network_id: "${network.main.id}"
//!       cidr_block: 10.0.1.0/24
//!
//! outputs:
//!   - name: subnet_id
//!     value: "${subnet.public.id}"
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod render;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, WorkspaceConfig};
pub use error::{HalyardError, Result};
pub use graph::{DeclarationLoader, ResourceGraph, ResourceId};
pub use planner::{DeploymentPlan, DiffEngine, PlanExecutor};
pub use provider::{HttpProvider, InMemoryProvider, Provider};
pub use reconciler::{DriftReport, PlanReport, ReconciliationResult, Reconciler};
pub use render::Renderer;
pub use state::{DeploymentState, LocalStateStore, S3StateStore, StateStore};
