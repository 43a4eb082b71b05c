mod config;
mod handlers;
mod logging;
mod run_cmd;
mod serve_cmd;
mod status_cmd;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use config::{ConfigFile, DroverConfig, Overrides};

#[derive(Parser)]
#[command(name = "drover", about = "Priority task orchestration engine")]
struct Cli {
    /// Config file path (default: ~/.config/drover/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run the engine and the HTTP read surface until interrupted
    Run {
        /// TOML task file to seed the store with at startup
        #[arg(long)]
        tasks: Option<PathBuf>,
        /// Address for the HTTP read surface
        #[arg(long, default_value = "127.0.0.1:8000")]
        bind: SocketAddr,
        /// Snapshot directory (overrides DROVER_STORAGE_PATH and config)
        #[arg(long)]
        storage_dir: Option<String>,
        /// Seconds between admit ticks
        #[arg(long)]
        poll_interval: Option<u64>,
        /// Worker pool size
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Summarize the persisted task set without running the engine
    Status {
        /// Snapshot directory (overrides DROVER_STORAGE_PATH and config)
        #[arg(long)]
        storage_dir: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => {
            let path = cli.config.unwrap_or_else(config::config_path);
            if path.exists() && !force {
                anyhow::bail!(
                    "config file already exists at {} (use --force to overwrite)",
                    path.display()
                );
            }
            config::save_config(&path, &ConfigFile::default())?;
            println!("wrote {}", path.display());
            Ok(())
        }
        Commands::Run {
            tasks,
            bind,
            storage_dir,
            poll_interval,
            concurrency,
        } => {
            let overrides = Overrides {
                storage_dir,
                poll_interval,
                concurrency,
            };
            let config = DroverConfig::resolve(cli.config.as_deref(), &overrides)?;
            logging::setup(&config.log)?;
            run_cmd::run(config, tasks.as_deref(), bind).await
        }
        Commands::Status { storage_dir } => {
            let overrides = Overrides {
                storage_dir,
                ..Overrides::default()
            };
            let config = DroverConfig::resolve(cli.config.as_deref(), &overrides)?;
            status_cmd::run(&config.storage)
        }
    }
}
