//! Tenon HTTP server
//!
//! Serves a few built-in routes on the tenon executor:
//! `GET /health`, `POST /echo` and `GET /stats`.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

mod commands;
mod config;
mod routes;

#[derive(Parser)]
#[command(name = "tenon")]
#[command(about = "HTTP server on a cooperative multi-threaded executor", long_about = None)]
#[command(version)]
struct Cli {
    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server
    Serve {
        /// Settings file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Address to listen on, overriding the settings file
        #[arg(short, long)]
        addr: Option<SocketAddr>,
        /// Worker threads, overriding the settings file
        #[arg(short, long)]
        threads: Option<usize>,
        /// Stop after this many seconds instead of running until killed
        #[arg(long)]
        duration: Option<u64>,
    },

    /// Validate a settings file and print the effective settings
    CheckConfig {
        /// Settings file (TOML)
        file: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Commands::Serve {
            config,
            addr,
            threads,
            duration,
        } => commands::serve::execute(commands::serve::ServeOptions {
            config,
            addr,
            threads,
            duration,
        }),
        Commands::CheckConfig { file } => commands::check::execute(&file),
    }
}
