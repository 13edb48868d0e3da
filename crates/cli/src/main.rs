//! autosync command-line tool.
//!
//! Thin entry point for schedulers and humans: runs one push or pull cycle,
//! shows status and machine identity, toggles development mode, and
//! generates / validates configuration files.

mod logging;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::debug;

use autosync_core::config::{expand_tilde, SyncConfig};
use autosync_core::lock::OperationKind;
use autosync_core::signals;
use autosync_core::{SyncEngine, SyncError, SyncReport};

const DEFAULT_CONFIG_PATH: &str = "~/.config/autosync/config.toml";

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// Keep a dotfiles source tree in sync with a remote git repository.
#[derive(Parser, Debug)]
#[command(name = "autosync", version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Print results as JSON.
    #[arg(long, global = true)]
    json: bool,

    /// Also print engine logs to stderr at the configured level.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Commit and publish local changes to this machine's branch.
    Push,

    /// Integrate and apply the authoritative branch.
    Pull,

    /// Show machine identity, dev mode and last successful cycles.
    Status,

    /// Print the machine id and branch name.
    Identity,

    /// Enable or disable development mode (pauses push).
    DevMode {
        #[arg(value_enum)]
        state: Toggle,
    },

    /// Generate a default configuration file.
    Init {
        /// Output path. Defaults to the --config path.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate a configuration file.
    Validate,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Toggle {
    On,
    Off,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config_path = expand_tilde(&cli.config);

    match cli.command {
        Commands::Init { output } => {
            let output = output.map(|p| expand_tilde(&p)).unwrap_or(config_path);
            cmd_init(&output).map(|()| ExitCode::SUCCESS)
        }
        Commands::Validate => cmd_validate(&config_path).map(|()| ExitCode::SUCCESS),
        command => {
            let config = load_config(&config_path, &cli.config)?;
            let _log_guard = logging::init(&config, cli.verbose);
            debug!(config = %config_path.display(), "configuration loaded");

            match command {
                Commands::Push => run_cycle(config, OperationKind::Push, cli.json).await,
                Commands::Pull => run_cycle(config, OperationKind::Pull, cli.json).await,
                Commands::Status => cmd_status(config, cli.json),
                Commands::Identity => cmd_identity(config, cli.json),
                Commands::DevMode { state } => cmd_dev_mode(&config, state),
                Commands::Init { .. } | Commands::Validate => unreachable!(),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

/// Load the config file. A missing file at the default location means
/// "use defaults"; a missing file the user named is an error.
fn load_config(path: &Path, as_given: &Path) -> Result<SyncConfig> {
    if !path.exists() && as_given == Path::new(DEFAULT_CONFIG_PATH) {
        let mut config = SyncConfig::default();
        config
            .resolve_paths()
            .context("failed to resolve default paths")?;
        config.validate().context("invalid default configuration")?;
        return Ok(config);
    }
    SyncConfig::load_and_resolve(path).context("failed to load configuration file")
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

async fn run_cycle(config: SyncConfig, kind: OperationKind, json: bool) -> Result<ExitCode> {
    let shutdown =
        signals::ShutdownFlag::listen().context("failed to install signal handlers")?;
    let engine = SyncEngine::from_config(config).with_shutdown(shutdown);
    let result = match kind {
        OperationKind::Push => engine.push().await,
        OperationKind::Pull => engine.pull().await,
    };

    match result {
        Ok(report) => {
            print_report(&report, json)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            print_error(kind, &e, json)?;
            Ok(ExitCode::from(e.exit_code().clamp(1, 255) as u8))
        }
    }
}

fn print_report(report: &SyncReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!("{}", report.summary());
    for warning in &report.warnings {
        println!("  warning: {warning}");
    }
    Ok(())
}

fn print_error(kind: OperationKind, err: &SyncError, json: bool) -> Result<()> {
    if json {
        let value = serde_json::json!({
            "operation": kind,
            "status": "failed",
            "critical": err.is_critical(),
            "error": err.to_string(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else if err.is_critical() {
        eprintln!("CRITICAL: {kind} needs manual intervention: {err}");
    } else {
        eprintln!("Error: {kind} failed: {err}");
    }
    Ok(())
}

fn cmd_status(config: SyncConfig, json: bool) -> Result<ExitCode> {
    let source = config.sync.source_dir.clone();
    let engine = SyncEngine::from_config(config);
    let status = engine.status();

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(ExitCode::SUCCESS);
    }

    let or_never = |v: &Option<String>| v.clone().unwrap_or_else(|| "never".into());
    println!("Source tree    : {}", source.display());
    println!(
        "Machine id     : {}",
        status.machine_id.as_deref().unwrap_or("unknown")
    );
    println!(
        "Machine branch : {}",
        status.machine_branch.as_deref().unwrap_or("unknown")
    );
    println!(
        "Dev mode       : {}",
        if status.dev_mode { "ON (push paused)" } else { "off" }
    );
    println!("Last push      : {}", or_never(&status.last_push));
    println!("Last pull      : {}", or_never(&status.last_pull));
    println!("Backups        : {}", engine.backups().list()?.len());
    Ok(ExitCode::SUCCESS)
}

fn cmd_identity(config: SyncConfig, json: bool) -> Result<ExitCode> {
    let engine = SyncEngine::from_config(config);
    let id = engine.machine_id().context("failed to resolve machine id")?;
    let branch = engine.machine_branch()?;

    if json {
        let value = serde_json::json!({ "machine_id": id.as_str(), "branch": branch });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("{id}");
        println!("{branch}");
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_dev_mode(config: &SyncConfig, state: Toggle) -> Result<ExitCode> {
    let marker = config.dev_mode_marker();
    match state {
        Toggle::On => {
            if let Some(parent) = marker.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            std::fs::write(&marker, "")
                .with_context(|| format!("failed to write {}", marker.display()))?;
            println!("Development mode enabled; push is paused.");
        }
        Toggle::Off => {
            match std::fs::remove_file(&marker) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("failed to remove {}", marker.display()))
                }
            }
            println!("Development mode disabled.");
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_init(output: &Path) -> Result<()> {
    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent).context("failed to create config directory")?;
    }
    std::fs::write(output, SyncConfig::default_template())
        .context("failed to write config file")?;

    println!("Default configuration written to {}", output.display());
    println!();
    println!("Next steps:");
    println!("  1. Set sync.source_dir to your source tree");
    println!(
        "  2. Validate with: autosync validate --config {}",
        output.display()
    );
    println!("  3. Schedule `autosync pull` on a timer and `autosync push` on file changes");
    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let mut config =
        SyncConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    config
        .resolve_paths()
        .context("failed to resolve configuration paths")?;
    println!("  [OK] Paths resolved");

    match config.validate() {
        Ok(()) => println!("  [OK] All values are valid"),
        Err(e) => {
            println!("  [FAIL] Validation error: {}", e);
            anyhow::bail!("configuration validation failed");
        }
    }

    let exists = |p: &Path| if p.exists() { "" } else { " (missing)" };
    println!();
    println!("Configuration summary:");
    println!(
        "  Source tree   : {}{}",
        config.sync.source_dir.display(),
        exists(&config.sync.source_dir)
    );
    println!("  State dir     : {}", config.state_dir().display());
    println!("  Backups       : {} (keep {})", config.backup_dir().display(), config.sync.backup_keep);
    println!(
        "  Remote        : {} (authoritative: {}, machine prefix: {})",
        config.remote.name, config.remote.authoritative_branch, config.remote.machine_branch_prefix
    );
    println!(
        "  Retry         : {} attempts, {}s initial delay, x{}",
        config.retry.max_attempts, config.retry.initial_delay_secs, config.retry.backoff_multiplier
    );
    println!(
        "  Verification  : {}",
        if config.verify.enabled { "enabled" } else { "disabled" }
    );
    println!("  Materializer  : {}", config.materializer.program);
    Ok(())
}
