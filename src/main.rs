//! Halyard CLI entrypoint.

use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use halyard::cli::{Cli, Commands, OutputFormat, OutputFormatter, StateCommands};
use halyard::config::{ConfigParser, ConfigValidator, find_config_file};
use halyard::error::{HalyardError, Result};
use halyard::planner::CancellationFlag;
use halyard::reconciler::Reconciler;
use halyard::state::generate_holder_id;

use clap::Parser;
use colored::Colorize;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Files written by `halyard init`, relative to the target directory.
const INIT_FILES: &[(&str, &str)] = &[
    ("halyard.yaml", include_str!("../templates/halyard.yaml")),
    (".env.example", include_str!("../templates/.env.example")),
    ("infra/network.yaml", include_str!("../templates/infra/network.yaml")),
    (
        "infra/scripts/bootstrap.sh",
        include_str!("../templates/infra/scripts/bootstrap.sh"),
    ),
    (
        "infra/templates/ssh-config.tpl",
        include_str!("../templates/infra/templates/ssh-config.tpl"),
    ),
    (
        "infra/templates/ssh-config-windows.tpl",
        include_str!("../templates/infra/templates/ssh-config-windows.tpl"),
    ),
];

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e}", "Error:".red().bold());
            ExitCode::FAILURE
        }
    }
}

/// Initializes logging on stderr. `RUST_LOG` wins unless `--verbose` is set.
fn init_logging(verbose: bool, format: OutputFormat) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        OutputFormat::Json => builder.json().init(),
        OutputFormat::Text => builder.init(),
    }
}

async fn run(cli: Cli) -> Result<()> {
    let formatter = OutputFormatter::new(cli.output);

    if let Commands::Init { path, force } = &cli.command {
        return cmd_init(path, *force);
    }

    let cancel = CancellationFlag::new();
    let reconciler = open_workspace(&cli).await?.with_cancellation(cancel.clone());

    match cli.command {
        Commands::Init { .. } => Ok(()),
        Commands::Validate { warnings } => {
            let result = reconciler.validate().await?;
            println!("{}", formatter.format_validation(&result, warnings));
            Ok(())
        }
        Commands::Plan { destroy, detailed } => {
            if destroy {
                let plan = reconciler.plan_destroy().await?;
                println!("{}", formatter.format_destroy_plan(&plan));
            } else {
                let report = reconciler.plan().await?;
                println!("{}", formatter.format_plan(&report, detailed));
            }
            Ok(())
        }
        Commands::Apply { yes } => cmd_apply(&reconciler, yes, &formatter, cancel).await,
        Commands::Destroy { yes } => cmd_destroy(&reconciler, yes, &formatter, cancel).await,
        Commands::Output { name } => {
            let outputs = reconciler.outputs().await?;
            println!("{}", formatter.format_outputs(&outputs, name.as_deref())?);
            Ok(())
        }
        Commands::Render => {
            let rendered = reconciler.render().await?;
            println!("{}", formatter.format_artifacts(&rendered));
            Ok(())
        }
        Commands::Drift { refresh } => {
            let report = reconciler.drift(refresh).await?;
            println!("{}", formatter.format_drift(&report));
            Ok(())
        }
        Commands::State { command } => cmd_state(&reconciler, command, &formatter).await,
    }
}

/// Writes the starter workspace.
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    info!("Initializing new Halyard workspace in: {}", path.display());

    let config_path = path.join(INIT_FILES[0].0);
    if !force && config_path.exists() {
        eprintln!("Workspace file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    for (relative, content) in INIT_FILES {
        let target = path.join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, content)?;
        eprintln!("Created: {}", target.display());
    }

    update_gitignore(&path.join(".gitignore"))?;

    eprintln!("\nWorkspace initialized.");
    eprintln!("Next steps:");
    eprintln!("  1. Copy .env.example to .env and set HALYARD_PROVIDER_TOKEN");
    eprintln!("  2. Set my_ip and public_key in halyard.yaml");
    eprintln!("  3. Run 'halyard validate' to check the declarations");
    eprintln!("  4. Run 'halyard plan' to see what will be created");
    eprintln!("  5. Run 'halyard apply', then 'ssh devbox'");
    Ok(())
}

fn update_gitignore(gitignore_path: &Path) -> Result<()> {
    let entries = [".env", ".halyard/"];

    if !gitignore_path.exists() {
        std::fs::write(gitignore_path, entries.join("\n") + "\n")?;
        eprintln!("Created: {}", gitignore_path.display());
        return Ok(());
    }

    let existing = std::fs::read_to_string(gitignore_path)?;
    let missing: Vec<&str> = entries
        .iter()
        .copied()
        .filter(|entry| !existing.lines().any(|line| line.trim() == *entry))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }

    let mut file = std::fs::OpenOptions::new().append(true).open(gitignore_path)?;
    writeln!(file, "\n# Halyard")?;
    for entry in missing {
        writeln!(file, "{entry}")?;
    }
    eprintln!("Updated: {}", gitignore_path.display());
    Ok(())
}

async fn cmd_apply(
    reconciler: &Reconciler,
    auto_approve: bool,
    formatter: &OutputFormatter,
    cancel: CancellationFlag,
) -> Result<()> {
    let report = reconciler.plan().await?;
    if !report.plan.is_empty() {
        eprintln!("{}", OutputFormatter::new(OutputFormat::Text).format_plan(&report, false));
        if !auto_approve && !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
            eprintln!("Apply cancelled.");
            return Ok(());
        }
    }

    spawn_interrupt_handler(cancel);
    let result = reconciler.apply_reviewed(&report.plan).await?;
    println!("{}", formatter.format_result(&result));
    result.failure.map_or(Ok(()), Err)
}

async fn cmd_destroy(
    reconciler: &Reconciler,
    auto_approve: bool,
    formatter: &OutputFormatter,
    cancel: CancellationFlag,
) -> Result<()> {
    let plan = reconciler.plan_destroy().await?;
    if plan.is_empty() {
        eprintln!("No resources recorded in state.");
    } else {
        eprintln!("The following resources will be destroyed:");
        for action in &plan.actions {
            let id = action.provider_id.as_deref().unwrap_or("?");
            eprintln!("  - {} ({id})", action.resource);
        }
        if !auto_approve
            && !confirm("\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ", "destroy")?
        {
            eprintln!("Destroy cancelled.");
            return Ok(());
        }
    }

    spawn_interrupt_handler(cancel);
    let result = reconciler.destroy().await?;
    println!("{}", formatter.format_result(&result));
    result.failure.map_or(Ok(()), Err)
}

async fn cmd_state(reconciler: &Reconciler, command: StateCommands, formatter: &OutputFormatter) -> Result<()> {
    let store = reconciler.store();

    match command {
        StateCommands::Show => match store.load().await? {
            Some(state) => println!("{}", formatter.format_state(&state)),
            None => eprintln!("No state found at {}.", store.location()),
        },
        StateCommands::List => match store.load().await? {
            Some(state) => println!("{}", formatter.format_resources(&state)),
            None => eprintln!("No state found at {}.", store.location()),
        },
        StateCommands::Lock { holder } => {
            let holder = holder.unwrap_or_else(generate_holder_id);
            let lock = store.acquire_lock(&holder, "manual").await?;
            println!("{}", formatter.format_lock(&lock));
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                if let Some(lock) = store.get_lock_info().await? {
                    warn!("Force unlocking lock {} held by {}", lock.lock_id, lock.holder);
                }
                store.force_unlock().await?;
                println!("{}", formatter.message("State forcefully unlocked."));
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                println!("{}", formatter.message("State unlocked."));
            } else {
                return Err(HalyardError::internal("Provide --lock-id or use --force"));
            }
        }
    }
    Ok(())
}

/// Loads the workspace file, `.env` and overrides, and builds the
/// reconciler.
async fn open_workspace(cli: &Cli) -> Result<Reconciler> {
    let config_file = cli
        .config
        .clone()
        .map_or_else(|| find_config_file("."), Ok)?;
    let workspace_dir = config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    debug!("Workspace directory: {}", workspace_dir.display());

    let parser = ConfigParser::new().with_base_path(&workspace_dir);
    parser.load_dotenv()?;
    let mut config = parser.load_with_env(&config_file)?;
    if let Some(host_os) = &cli.host_os {
        config.host_os = Some(host_os.clone());
    }

    let validation = ConfigValidator::default().validate(&config)?;
    for warning in &validation.warnings {
        warn!("{warning}");
    }

    Reconciler::from_config(config, &workspace_dir).await
}

/// Installs the Ctrl-C handler for apply and destroy. Other commands keep
/// the default behavior.
fn spawn_interrupt_handler(cancel: CancellationFlag) {
    tokio::spawn(async move {
        if watch_interrupts(tokio::signal::ctrl_c, &cancel).await {
            eprintln!("Interrupted again, exiting without waiting for in-flight actions.");
            std::process::exit(130);
        }
    });
}

/// The first interrupt stops dispatching new actions; in-flight actions
/// finish and their results are saved. Returns true on a second interrupt.
async fn watch_interrupts<F, Fut>(mut interrupted: F, cancel: &CancellationFlag) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    if let Err(e) = interrupted().await {
        warn!("Cannot listen for interrupts: {e}");
        return false;
    }
    warn!("Interrupt received, waiting for in-flight actions to finish (Ctrl-C again to abort)");
    cancel.cancel();
    interrupted().await.is_ok()
}

fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(expected))
}
