//! Planning and execution.
//!
//! The diff engine compares the resource graph against recorded state, the
//! plan orders the resulting actions, and the executor runs them against a
//! provider while keeping state current.

mod diff;
mod executor;
mod plan;
mod retry;

pub use diff::{AttributeChange, DiffEngine, DiffResult, DiffType, ResourceDiff};
pub use executor::{ActionResult, CancellationFlag, ExecutionResult, PlanExecutor};
pub use plan::{ActionType, DeploymentPlan, PlannedAction};
pub use retry::RetryPolicy;
