// src/main.rs
//! dbbm - CLI Entry Point

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::io;

mod commands;

// =============================================================================
// CLI Definitions
// =============================================================================

#[derive(Parser)]
#[command(name = "dbbm")]
#[command(version)]
#[command(about = "Database branch deployment engine with content-addressed state caching", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy the active release to the target databases
    Deploy {
        /// Override the default active release
        #[arg(short, long)]
        release: Option<String>,

        /// Override the default environment
        #[arg(short, long)]
        env: Option<String>,

        /// Calculate and narrate without side effects
        #[arg(short = 'n', long)]
        dry_run: bool,

        /// Start from the recorded resume point
        #[arg(short = 's', long)]
        resume: bool,

        /// Disable the backup cache entirely
        #[arg(short = 'C', long)]
        no_cache: bool,

        /// Disable the buzzer
        #[arg(short = 'B', long)]
        no_beeps: bool,
    },

    /// Backup cache maintenance
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Remove orphans, drop forgotten entries, enforce the size bound
    Gc,
    /// Show entry count and live size
    Stats,
}

// =============================================================================
// Main Entry Point
// =============================================================================

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Deploy {
            release,
            env,
            dry_run,
            resume,
            no_cache,
            no_beeps,
        }) => commands::cmd_deploy(release, env, dry_run, resume, no_cache, no_beeps),

        Some(Commands::Cache { action }) => match action {
            CacheAction::Gc => commands::cmd_cache_gc(),
            CacheAction::Stats => commands::cmd_cache_stats(),
        },

        Some(Commands::Completions { shell }) => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "dbbm", &mut io::stdout());
            Ok(())
        }

        None => {
            println!("dbbm v{}", env!("CARGO_PKG_VERSION"));
            println!("Run 'dbbm --help' for usage information");
            Ok(())
        }
    }
}
