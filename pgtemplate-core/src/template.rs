//! Template preparation
//!
//! Runs once per system: migrations, seed files and the seed strategy are
//! applied to the template database in that order, then the database is
//! flagged `is_template` so clones can be created from it.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::future::BoxFuture;
use sqlx::migrate::Migrator;
use sqlx::{Connection, Executor, PgConnection};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::Config;
use crate::context::Context;
use crate::endpoint::Endpoint;
use crate::error::{BoxError, SetupStage};
use crate::gate::CloneGate;
use crate::naming::quote_ident;
use crate::{Error, Result};

/// Populates the template after migrations and seed files.
///
/// The connection is to the template database. Any other connection the
/// strategy opens (for example a pool built from `connection_string`) must be
/// closed before it returns, or cloning the template will fail.
#[async_trait]
pub trait SeedStrategy: Send + Sync {
    async fn seed(
        &self,
        conn: &mut PgConnection,
        connection_string: &str,
    ) -> std::result::Result<(), BoxError>;
}

/// [`SeedStrategy`] backed by a closure.
pub struct SeedFn<F>(F);

/// Wrap a closure as a [`SeedStrategy`].
///
/// ```ignore
/// let seed = seed_fn(|conn, _url| {
///     Box::pin(async move {
///         conn.execute("INSERT INTO t VALUES (1)").await?;
///         Ok::<(), BoxError>(())
///     })
/// });
/// ```
pub fn seed_fn<F>(f: F) -> SeedFn<F>
where
    F: for<'c> Fn(&'c mut PgConnection, &'c str) -> BoxFuture<'c, std::result::Result<(), BoxError>>
        + Send
        + Sync,
{
    SeedFn(f)
}

#[async_trait]
impl<F> SeedStrategy for SeedFn<F>
where
    F: for<'c> Fn(&'c mut PgConnection, &'c str) -> BoxFuture<'c, std::result::Result<(), BoxError>>
        + Send
        + Sync,
{
    async fn seed(
        &self,
        conn: &mut PgConnection,
        connection_string: &str,
    ) -> std::result::Result<(), BoxError> {
        (self.0)(conn, connection_string).await
    }
}

/// A seed file that could not be read or executed
#[derive(Debug, Error)]
#[error("{}: {source}", .file.display())]
pub struct SeedFileError {
    file: PathBuf,
    #[source]
    source: BoxError,
}

/// Apply migrations, seed files and the seed strategy from `config` to the
/// template database, then mark it as a template.
///
/// Not retried; the caller tears the server down on failure.
pub async fn prepare(gate: &CloneGate, endpoint: &Endpoint, config: &Config) -> Result<()> {
    let template = config.database.as_str();
    let needs_connection =
        config.migrations_path.is_some() || config.seed_path.is_some() || config.seed.is_some();

    if needs_connection {
        let mut conn = PgConnection::connect_with(&endpoint.connect_options(template))
            .await
            .map_err(|e| Error::setup(SetupStage::ConnectingToTemplate, e))?;

        if let Some(path) = &config.migrations_path {
            apply_migrations(&mut conn, path)
                .await
                .map_err(|e| Error::setup(SetupStage::ApplyingMigrations, e))?;
        }

        if let Some(path) = &config.seed_path {
            execute_seed_files(&mut conn, path)
                .await
                .map_err(|e| Error::setup(SetupStage::ExecutingSeedFiles, e))?;
        }

        if let Some(seed) = &config.seed {
            info!("Running seed strategy");
            seed.seed(&mut conn, &endpoint.url(template))
                .await
                .map_err(|e| Error::setup(SetupStage::RunningSeedStrategy, e))?;
            info!("Seed strategy complete");
        }

        conn.close()
            .await
            .map_err(|e| Error::setup(SetupStage::ClosingTemplateConnection, e))?;
    }

    mark_template(gate, template).await?;
    info!(template, "Template database ready");
    Ok(())
}

async fn apply_migrations(conn: &mut PgConnection, path: &Path) -> std::result::Result<(), BoxError> {
    let path = resolve(path)?;
    info!("Applying migrations from {}", path.display());

    let migrator = Migrator::new(path).await?;
    // Nothing pending is a successful no-op.
    migrator.run(conn).await?;

    info!("Database migrations complete");
    Ok(())
}

async fn execute_seed_files(
    conn: &mut PgConnection,
    dir: &Path,
) -> std::result::Result<(), BoxError> {
    let dir = resolve(dir)?;
    info!("Executing seed files from {}", dir.display());

    for file in collect_seed_files(&dir).await? {
        debug!("Executing seed file {}", file.display());
        let sql = tokio::fs::read_to_string(&file)
            .await
            .map_err(|e| SeedFileError {
                file: file.clone(),
                source: e.into(),
            })?;
        // A plain &str runs on the simple protocol, so files may hold
        // several statements.
        (&mut *conn)
            .execute(sql.as_str())
            .await
            .map_err(|e| SeedFileError {
                file: file.clone(),
                source: e.into(),
            })?;
    }

    info!("Database seeding complete");
    Ok(())
}

/// Regular `*.sql` files directly inside `dir`, sorted by file name.
pub async fn collect_seed_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !path.extension().is_some_and(|ext| ext == "sql") {
            continue;
        }
        if tokio::fs::metadata(&path).await?.is_file() {
            files.push(path);
        }
    }

    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

fn resolve(path: &Path) -> io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Flag the template as a clone source. Re-marking is harmless.
async fn mark_template(gate: &CloneGate, template: &str) -> Result<()> {
    let template = template.to_string();
    gate.with_exclusive_access(&Context::background(), move |conn| {
        Box::pin(async move {
            // Stray sessions on the template would make every clone fail.
            let terminated: Vec<(bool,)> = sqlx::query_as(
                "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
                 WHERE datname = $1 AND pid <> pg_backend_pid()",
            )
            .bind(template.as_str())
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| Error::setup(SetupStage::MarkingTemplate, e))?;
            if !terminated.is_empty() {
                debug!(count = terminated.len(), "Terminated sessions on template");
            }

            let sql = format!(
                "ALTER DATABASE {} WITH is_template = true",
                quote_ident(&template)
            );
            (&mut *conn)
                .execute(sql.as_str())
                .await
                .map_err(|e| Error::setup(SetupStage::MarkingTemplate, e))?;
            Ok::<(), Error>(())
        })
    })
    .await
    .map_err(|e| match e {
        Error::Setup { .. } => e,
        other => Error::setup(SetupStage::MarkingTemplate, other),
    })
}
