mod config;
mod roster_cmds;
mod run_cmd;
mod workspaces_cmd;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use config::ResolvedConfig;

#[derive(Parser)]
#[command(name = "drover", about = "Orchestrator for pools of AI persona agents")]
struct Cli {
    /// Agent runtime binary (overrides DROVER_RUNTIME env var and config)
    #[arg(long, global = true)]
    runtime_bin: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a drover config file
    Init {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Roster management
    Roster {
        #[command(subcommand)]
        command: RosterCommands,
    },
    /// Run every task in a roster to completion
    Run {
        /// Path to the roster TOML file
        file: PathBuf,
        /// Repository to work against (defaults to roster setting or cwd)
        #[arg(long)]
        repo: Option<PathBuf>,
        /// Maximum number of concurrently active personas
        #[arg(long)]
        max_active: Option<usize>,
        /// Per-task wait bound in seconds
        #[arg(long)]
        task_timeout: Option<u64>,
    },
    /// Inspect or prune agent checkouts
    Workspaces {
        #[command(subcommand)]
        command: WorkspaceCommands,
    },
}

#[derive(Subcommand)]
enum RosterCommands {
    /// Parse and validate a roster file
    Validate {
        /// Path to the roster TOML file
        file: PathBuf,
    },
    /// Show the roles and tasks of a roster file
    Show {
        /// Path to the roster TOML file
        file: PathBuf,
    },
}

#[derive(Subcommand)]
enum WorkspaceCommands {
    /// List all checkouts of a repository
    List {
        /// Repository path (defaults to cwd)
        #[arg(long)]
        repo: Option<PathBuf>,
    },
    /// Remove checkouts whose directories vanished
    Prune {
        /// Repository path (defaults to cwd)
        #[arg(long)]
        repo: Option<PathBuf>,
    },
}

/// Execute the `drover init` command: write a starter config file.
fn cmd_init(force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        runtime: config::RuntimeSection {
            command: Some("agent".to_string()),
            response_timeout_secs: Some(30),
        },
        limits: config::LimitsSection {
            max_active_personas: Some(8),
            task_timeout_secs: Some(300),
        },
    };
    config::save_config_to(&path, &cfg)?;

    println!("Config written to {}", path.display());
    println!("  runtime.command = agent");
    println!("  limits.max_active_personas = 8");
    Ok(())
}

fn repo_or_cwd(repo: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match repo {
        Some(path) => Ok(path),
        None => std::env::current_dir().map_err(Into::into),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => {
            cmd_init(force)?;
        }
        Commands::Roster { command } => match command {
            RosterCommands::Validate { file } => roster_cmds::run_validate(&file)?,
            RosterCommands::Show { file } => roster_cmds::run_show(&file)?,
        },
        Commands::Run {
            file,
            repo,
            max_active,
            task_timeout,
        } => {
            let resolved =
                ResolvedConfig::resolve(cli.runtime_bin.as_deref(), max_active, task_timeout)?;
            run_cmd::run_roster(&file, &run_cmd::RunOptions { repo }, &resolved).await?;
        }
        Commands::Workspaces { command } => match command {
            WorkspaceCommands::List { repo } => {
                workspaces_cmd::run_list(&repo_or_cwd(repo)?)?;
            }
            WorkspaceCommands::Prune { repo } => {
                workspaces_cmd::run_prune(&repo_or_cwd(repo)?)?;
            }
        },
    }

    Ok(())
}
