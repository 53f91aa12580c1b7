//! pgtemplate CLI - template-clone PostgreSQL databases by hand
//!
//! - `serve`: start a server, prepare the template, optionally pre-clone
//!   instances and print their connection strings until Ctrl-C
//! - `sweep`: drop clones a crashed test run left on a server

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod config;
mod tracing_setup;

#[derive(Parser, Debug)]
#[command(
    name = "pgtemplate",
    author,
    version,
    about = "Isolated PostgreSQL databases cloned from a prepared template",
    long_about = "Start a PostgreSQL server with a migrated and seeded template database, \
                  clone it on demand, and clean up clones left behind by interrupted runs."
)]
struct Cli {
    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a server with a prepared template and wait for Ctrl-C
    Serve(commands::serve::ServeArgs),
    /// List or drop leaked clones of a template on a running server
    Sweep(commands::sweep::SweepArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    tracing_setup::init(&tracing_setup::TracingConfig { debug: cli.debug }).ok();

    match cli.command {
        Commands::Serve(args) => commands::run_serve(args).await?,
        Commands::Sweep(args) => commands::run_sweep(args).await?,
    }

    Ok(())
}
