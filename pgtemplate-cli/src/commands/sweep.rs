//! Find and drop clones leaked by crashed or interrupted test runs.
//!
//! Works against a server that is already running; the template itself is
//! never touched.

use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};
use clap::Parser;
use pgtemplate_core::naming::validate_template_name;
use pgtemplate_core::{CloneGate, Context, Endpoint, InstanceManager};
use tracing::{info, warn};

/// Arguments for the sweep command
#[derive(Parser, Debug)]
pub struct SweepArgs {
    /// Template whose clones should be removed
    #[arg(long, short = 't')]
    pub template: String,

    /// Server host
    #[arg(long, env = "PGHOST", default_value = "localhost")]
    pub host: String,

    /// Server port
    #[arg(long, env = "PGPORT", default_value_t = 5432)]
    pub port: u16,

    /// Administrative user
    #[arg(long, env = "PGUSER", default_value = "postgres")]
    pub user: String,

    /// Administrative password
    #[arg(long, env = "PGPASSWORD", default_value = "postgres", hide_env_values = true)]
    pub password: String,

    /// List clones without dropping them
    #[arg(long = "dry-run")]
    pub dry_run: bool,

    /// Seconds to wait for the clone gate per operation
    #[arg(long, value_name = "SECS", default_value_t = 30)]
    pub timeout: u64,
}

/// Run the sweep command
pub async fn run_sweep(args: SweepArgs) -> Result<()> {
    validate_template_name(&args.template).map_err(|reason| anyhow!(reason))?;

    let timeout = Duration::from_secs(args.timeout);
    let endpoint = Endpoint::new(&args.host, args.port, &args.user, &args.password);
    let gate = CloneGate::connect(&endpoint, timeout)
        .await
        .with_context(|| format!("Failed to connect to {}:{}", args.host, args.port))?;
    let manager = InstanceManager::new(gate, endpoint, args.template.as_str());

    let result = sweep(&manager, timeout, args.dry_run).await;
    manager.gate().close().await;
    result
}

async fn sweep(manager: &InstanceManager, timeout: Duration, dry_run: bool) -> Result<()> {
    let clones = manager
        .list_clones(&Context::with_timeout(timeout))
        .await
        .context("Failed to list clones")?;

    if clones.is_empty() {
        info!(template = %manager.template(), "No clones found");
        return Ok(());
    }

    let mut failed = 0usize;
    for name in &clones {
        if dry_run {
            println!("{name}");
            continue;
        }
        match manager
            .drop_orphan(&Context::with_timeout(timeout), name)
            .await
        {
            Ok(()) => println!("dropped {name}"),
            Err(err) => {
                warn!(database = %name, error = %err, "Failed to drop clone");
                failed += 1;
            }
        }
    }

    if failed > 0 {
        return Err(anyhow!("{failed} of {} clones could not be dropped", clones.len()));
    }
    info!(count = clones.len(), dry_run, "Sweep complete");
    Ok(())
}
