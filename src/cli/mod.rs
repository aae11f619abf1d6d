//! Command-line interface for Halyard.
//!
//! Argument definitions live in `commands`; `output` turns results into
//! text or JSON.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
