//! CLI command definitions.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Halyard - declarative, dependency-ordered infrastructure provisioning.
#[derive(Parser, Debug)]
#[command(name = "halyard")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the workspace file.
    #[arg(short, long, global = true, env = "HALYARD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Log format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub log_format: OutputFormat,

    /// Host OS used to pick template variants (defaults to this machine).
    #[arg(long, global = true)]
    pub host_os: Option<String>,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new workspace with a starter dev box.
    Init {
        /// Directory to initialize (defaults to current directory).
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Force overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },

    /// Validate the workspace and declarations.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Show what apply would do.
    Plan {
        /// Preview a teardown instead.
        #[arg(long)]
        destroy: bool,

        /// Show per-attribute changes.
        #[arg(short, long)]
        detailed: bool,
    },

    /// Create and update resources to match the declarations.
    Apply {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Destroy everything recorded in state.
    Destroy {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Show outputs from the last apply.
    Output {
        /// Print only this output's raw value.
        name: Option<String>,
    },

    /// Re-render local files from current outputs.
    Render,

    /// Compare state with what the provider reports.
    Drift {
        /// Record the findings in state so the next apply corrects them.
        #[arg(long)]
        refresh: bool,
    },

    /// Inspect and manage state.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show current state.
    Show,

    /// List recorded resources.
    List,

    /// Lock the state.
    Lock {
        /// Lock holder identifier.
        #[arg(long)]
        holder: Option<String>,
    },

    /// Unlock the state.
    Unlock {
        /// Lock ID to unlock.
        #[arg(long)]
        lock_id: Option<String>,

        /// Force unlock (dangerous).
        #[arg(long)]
        force: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}
