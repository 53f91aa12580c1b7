//! Instance manager: clone the template per caller, drop it on release.

use std::fmt;
use std::io;
use std::time::Duration;

use sqlx::{Connection, Executor, PgConnection};
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::endpoint::Endpoint;
use crate::error::{InstanceState, ReleaseError};
use crate::gate::CloneGate;
use crate::naming::{clone_name, is_clone_of, quote_ident};
use crate::{Error, Result};

/// One cloned database and its dedicated connection, owned by a single test.
///
/// Hand it back to [`InstanceManager::release`]; the connection is consumed
/// there and cannot be used afterwards.
pub struct DatabaseInstance {
    name: String,
    connection_string: String,
    connection: PgConnection,
}

impl DatabaseInstance {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// URL of this instance's database, for code under test that opens its
    /// own connections.
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    pub fn conn(&mut self) -> &mut PgConnection {
        &mut self.connection
    }
}

impl fmt::Debug for DatabaseInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseInstance")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

pub struct InstanceManager {
    gate: CloneGate,
    endpoint: Endpoint,
    template: String,
}

impl InstanceManager {
    pub fn new(gate: CloneGate, endpoint: Endpoint, template: impl Into<String>) -> Self {
        Self {
            gate,
            endpoint,
            template: template.into(),
        }
    }

    pub fn gate(&self) -> &CloneGate {
        &self.gate
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Clone the template into a fresh database and connect to it.
    ///
    /// No retry. A [`Error::Connect`] or [`Error::ConnectCancelled`] means the
    /// clone exists but is unreachable; its name is in the error.
    pub async fn acquire(&self, ctx: &Context) -> Result<DatabaseInstance> {
        let name = clone_name(&self.template);

        let sql = format!(
            "CREATE DATABASE {} TEMPLATE {}",
            quote_ident(&name),
            quote_ident(&self.template)
        );
        let clone_target = name.clone();
        self.gate
            .with_exclusive_access(ctx, move |conn| {
                Box::pin(async move {
                    conn.execute(sql.as_str())
                        .await
                        .map(|_| ())
                        .map_err(|source| Error::Clone {
                            name: clone_target,
                            source,
                        })
                })
            })
            .await?;
        debug!(database = %name, state = ?InstanceState::Created, "Cloned template");

        let options = self.endpoint.connect_options(&name);
        let connection = tokio::select! {
            biased;
            _ = ctx.done() => {
                warn!(database = %name, "Context ended while connecting; database is orphaned");
                return Err(Error::ConnectCancelled { name });
            }
            conn = PgConnection::connect_with(&options) => match conn {
                Ok(conn) => conn,
                Err(source) => {
                    warn!(database = %name, error = %source, "Connect failed; database is orphaned");
                    return Err(Error::Connect { name, source });
                }
            },
        };

        debug!(database = %name, state = ?InstanceState::Active, "Instance acquired");
        Ok(DatabaseInstance {
            connection_string: self.endpoint.url(&name),
            name,
            connection,
        })
    }

    /// Close the instance's connection and drop its database.
    ///
    /// Both steps always run; any failure comes back as [`Error::Release`]
    /// with each step's outcome. If `ctx` ends before the close handshake
    /// finishes, the connection is dropped without it and the close is
    /// reported as failed.
    pub async fn release(&self, ctx: &Context, instance: DatabaseInstance) -> Result<()> {
        let DatabaseInstance {
            name, connection, ..
        } = instance;
        debug!(database = %name, state = ?InstanceState::Closing, "Releasing instance");

        let close = tokio::select! {
            biased;
            _ = ctx.done() => Some(close_abandoned()),
            closed = connection.close() => closed.err(),
        };
        if let Some(err) = &close {
            warn!(database = %name, error = %err, "Closing instance connection failed");
        }

        let drop = self.drop_database(ctx, &name).await.err();
        if let Some(err) = &drop {
            warn!(database = %name, error = %err, state = ?InstanceState::Leaked, "Dropping instance database failed");
        }

        if close.is_none() && drop.is_none() {
            debug!(database = %name, state = ?InstanceState::Dropped, "Instance released");
            return Ok(());
        }
        Err(ReleaseError::new(name, close, drop).into())
    }

    /// Force-drop a clone left behind by a failed acquire or release.
    ///
    /// Refuses the template itself and anything not named like one of its
    /// clones.
    pub async fn drop_orphan(&self, ctx: &Context, name: &str) -> Result<()> {
        if name == self.template {
            return Err(Error::ProtectedDatabase {
                name: name.to_string(),
                reason: "it is the template database",
            });
        }
        if !is_clone_of(name, &self.template) {
            return Err(Error::ProtectedDatabase {
                name: name.to_string(),
                reason: "it is not a clone of the template",
            });
        }

        self.drop_database(ctx, name).await?;
        info!(database = %name, "Dropped orphaned clone");
        Ok(())
    }

    /// Names of every clone of the template currently on the server, active
    /// or leaked.
    pub async fn list_clones(&self, ctx: &Context) -> Result<Vec<String>> {
        let template = self.template.clone();
        let names: Vec<String> = self
            .gate
            .with_exclusive_access(ctx, move |conn| {
                Box::pin(async move {
                    sqlx::query_scalar::<_, String>(
                        "SELECT datname FROM pg_database \
                         WHERE NOT datistemplate AND datname LIKE $1 \
                         ORDER BY datname",
                    )
                    .bind(format!("{}\\_%", template.replace('_', "\\_")))
                    .fetch_all(conn)
                    .await
                    .map_err(|source| Error::Query {
                        operation: "listing clones",
                        source,
                    })
                })
            })
            .await?;

        Ok(names
            .into_iter()
            .filter(|name| is_clone_of(name, &self.template))
            .collect())
    }

    /// `DROP DATABASE ... WITH (FORCE)` through the gate.
    async fn drop_database(&self, ctx: &Context, name: &str) -> Result<()> {
        let sql = format!(
            "DROP DATABASE IF EXISTS {} WITH (FORCE)",
            quote_ident(name)
        );
        let target = name.to_string();
        self.gate
            .with_exclusive_access(ctx, move |conn| {
                Box::pin(async move {
                    conn.execute(sql.as_str())
                        .await
                        .map(|_| ())
                        .map_err(|source| Error::Drop {
                            name: target,
                            source,
                        })
                })
            })
            .await
    }

    /// Whether `name` can currently be connected to, within `timeout`.
    pub async fn is_reachable(&self, name: &str, timeout: Duration) -> bool {
        let options = self.endpoint.connect_options(name);
        match tokio::time::timeout(timeout, PgConnection::connect_with(&options)).await {
            Ok(Ok(conn)) => {
                if let Err(err) = conn.close().await {
                    debug!(database = %name, error = %err, "Closing reachability check connection failed");
                }
                true
            }
            _ => false,
        }
    }
}

fn close_abandoned() -> sqlx::Error {
    sqlx::Error::Io(io::Error::new(
        io::ErrorKind::TimedOut,
        "context ended before the connection was closed",
    ))
}
