//! Exclusive clone gate.
//!
//! An sqlx `PgPool` capped at one connection to the administrative database.
//! `CREATE DATABASE ... TEMPLATE` fails when any other session touches the
//! template, so every create and drop goes through this single slot.

use std::ops::{Deref, DerefMut};
use std::time::Duration;

use futures::future::BoxFuture;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnection, PgPoolOptions};
use sqlx::{PgPool, Postgres};
use tracing::warn;

use crate::context::Context;
use crate::endpoint::{Endpoint, ADMIN_DATABASE};
use crate::{Error, Result};

const WAITING_FOR_GATE: &str = "waiting for the clone gate";

pub struct CloneGate {
    pool: PgPool,
    stall_warning: Duration,
}

/// Holds the gate's only connection; the slot is returned on drop.
pub struct ExclusiveLease {
    conn: PoolConnection<Postgres>,
}

impl CloneGate {
    /// Connect the gate to `endpoint`'s administrative database.
    ///
    /// A caller still waiting for the slot after `stall_warning` is logged at
    /// warn level and keeps waiting.
    pub async fn connect(endpoint: &Endpoint, stall_warning: Duration) -> Result<Self> {
        let pool = pool_options(stall_warning)
            .connect_with(endpoint.connect_options(ADMIN_DATABASE))
            .await
            .map_err(|source| Error::Gate { source })?;
        Ok(Self {
            pool,
            stall_warning,
        })
    }

    /// Like [`CloneGate::connect`] but the connection is opened on first use.
    pub fn connect_lazy(endpoint: &Endpoint, stall_warning: Duration) -> Self {
        let pool =
            pool_options(stall_warning).connect_lazy_with(endpoint.connect_options(ADMIN_DATABASE));
        Self {
            pool,
            stall_warning,
        }
    }

    /// Wait for the slot.
    ///
    /// Blocks until the slot is free or `ctx` ends, whichever comes first.
    /// An ended context returns [`Error::ContextEnded`] without waiting.
    pub async fn acquire(&self, ctx: &Context) -> Result<ExclusiveLease> {
        if ctx.is_done() {
            return Err(Error::ContextEnded {
                operation: WAITING_FOR_GATE,
            });
        }

        loop {
            let attempt = tokio::select! {
                biased;
                _ = ctx.done() => {
                    return Err(Error::ContextEnded {
                        operation: WAITING_FOR_GATE,
                    });
                }
                conn = self.pool.acquire() => conn,
            };

            match attempt {
                Ok(conn) => return Ok(ExclusiveLease { conn }),
                // The pool gives up after `stall_warning`; the caller does not.
                Err(sqlx::Error::PoolTimedOut) => {
                    warn!(waited = ?self.stall_warning, "Still waiting for the clone gate");
                }
                Err(source) => return Err(Error::Gate { source }),
            }
        }
    }

    /// Run `op` with exclusive use of the administrative connection.
    ///
    /// Once the slot is held `op` runs to completion; the slot is released
    /// whether `op` succeeds or fails.
    pub async fn with_exclusive_access<T, F>(&self, ctx: &Context, op: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T>>,
    {
        let mut lease = self.acquire(ctx).await?;
        op(&mut *lease).await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

fn pool_options(stall_warning: Duration) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(1)
        .min_connections(0)
        .acquire_timeout(stall_warning)
}

impl Deref for ExclusiveLease {
    type Target = PgConnection;

    fn deref(&self) -> &PgConnection {
        &self.conn
    }
}

impl DerefMut for ExclusiveLease {
    fn deref_mut(&mut self) -> &mut PgConnection {
        &mut self.conn
    }
}
