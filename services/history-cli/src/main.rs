//! Admin CLI for the history engine: list tables and delete rows, talking
//! to a running engine over the control bus when one is listening and
//! falling back to opening the table files directly otherwise.
//!
//! Mirrors the online/offline split of the upstream Python `history`
//! command group: prefer the service (it serialises the write lock against
//! concurrent flushes), fall back to direct file access only when nothing
//! is listening, under the same single-writer assumption.

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "tangram-history", about = "Manage historical trajectory storage.")]
struct Cli {
    #[arg(long, env = "TANGRAM_CONFIG", default_value = "/etc/tangram/tangram.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List all history tables found in the configured storage directory.
    Ls {
        /// Also print each table's field schema.
        #[arg(long)]
        show_schema: bool,
        #[arg(long)]
        force_offline: bool,
    },
    /// Delete rows from a history table matching a SQL predicate.
    Rm {
        table: String,
        predicate: String,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        force_offline: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match tangram_config::load_config_from_path(&cli.config) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("error: failed to load config: {error}");
            return ExitCode::from(1);
        }
    };
    let history_config = match config.history_config("tangram_history") {
        Ok(history_config) => history_config,
        Err(error) => {
            eprintln!("error: failed to load history plugin config: {error}");
            return ExitCode::from(1);
        }
    };

    let outcome = match cli.command {
        Commands::Ls { show_schema, force_offline } => {
            commands::ls(&config.core.redis_url, &history_config, show_schema, force_offline).await
        }
        Commands::Rm { table, predicate, dry_run, force_offline } => {
            commands::rm(&config.core.redis_url, &history_config, &table, &predicate, dry_run, force_offline).await
        }
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(commands::CliError::Unreachable(msg)) => {
            eprintln!("error: {msg}");
            ExitCode::from(2)
        }
        Err(commands::CliError::OperationFailed(msg)) => {
            eprintln!("error: {msg}");
            ExitCode::from(3)
        }
    }
}
