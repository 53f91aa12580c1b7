//! Start a server with a prepared template and keep it up until Ctrl-C.
//!
//! Handy for poking at the template or at a handful of clones with psql.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Parser;
use pgtemplate_core::{Config, Context, DatabaseInstance, TemplateServer};
use tracing::{info, warn};

use crate::config;

/// Arguments for the serve command
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// TOML config file (flags below override its values)
    #[arg(long, short = 'c', value_name = "FILE", env = "PGTEMPLATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Name of the template database
    #[arg(long, short = 'd')]
    pub database: Option<String>,

    /// Container image, e.g. postgres:16
    #[arg(long)]
    pub image: Option<String>,

    /// Server user
    #[arg(long, env = "PGTEMPLATE_USER")]
    pub user: Option<String>,

    /// Server password
    #[arg(long, env = "PGTEMPLATE_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Directory of sqlx migrations applied to the template
    #[arg(long, value_name = "DIR")]
    pub migrations: Option<PathBuf>,

    /// Directory of *.sql seed files applied after migrations
    #[arg(long, value_name = "DIR")]
    pub seeds: Option<PathBuf>,

    /// Number of clones to create up front
    #[arg(long, short = 'n', default_value_t = 0)]
    pub instances: usize,

    /// Seconds allowed for the server to become ready
    #[arg(long, value_name = "SECS")]
    pub startup_timeout: Option<u64>,

    /// Forward container output to the log (visible with --debug)
    #[arg(long)]
    pub forward_logs: bool,
}

impl ServeArgs {
    /// Load the config file and apply flag overrides on top.
    pub fn to_config(&self) -> Result<Config> {
        let mut config = config::load(self.config.as_deref())?;

        if let Some(database) = &self.database {
            config.database = database.clone();
        }
        if let Some(image) = &self.image {
            config.image = image.clone();
        }
        if let Some(user) = &self.user {
            config.user = user.clone();
        }
        if let Some(password) = &self.password {
            config.password = password.clone();
        }
        if let Some(path) = &self.migrations {
            config.migrations_path = Some(path.clone());
        }
        if let Some(path) = &self.seeds {
            config.seed_path = Some(path.clone());
        }
        if let Some(secs) = self.startup_timeout {
            config.startup_timeout = Duration::from_secs(secs);
        }
        if self.forward_logs {
            config.forward_container_logs = true;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Run the serve command
pub async fn run_serve(args: ServeArgs) -> Result<()> {
    let config = args.to_config()?;
    let ctx = Context::background();

    let server = TemplateServer::start(config)
        .await
        .context("Failed to start template server")?;
    println!("template  {}", server.template_url());

    let mut instances = Vec::with_capacity(args.instances);
    let mut acquire_error = None;
    for _ in 0..args.instances {
        match server.acquire(&ctx).await {
            Ok(instance) => {
                println!("{}  {}", instance.name(), instance.connection_string());
                instances.push(instance);
            }
            Err(err) => {
                acquire_error = Some(err);
                break;
            }
        }
    }

    if acquire_error.is_none() {
        info!("Press Ctrl-C to release instances and stop the server");
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        info!("Shutting down");
    }

    release_all(&server, instances).await;
    server
        .shutdown()
        .await
        .context("Failed to shut down template server")?;

    match acquire_error {
        Some(err) => Err(err).context("Failed to acquire instance"),
        None => Ok(()),
    }
}

async fn release_all(server: &TemplateServer, instances: Vec<DatabaseInstance>) {
    let ctx = Context::background();
    for instance in instances {
        let name = instance.name().to_string();
        if let Err(err) = server.release(&ctx, instance).await {
            warn!(database = %name, error = %err, "Failed to release instance");
        }
    }
}
