//! Shared helpers for the container-backed tests.
//!
//! Run with: cargo test -p pgtemplate-core -- --ignored (needs a docker daemon)

#![allow(dead_code)]

use std::time::Duration;

use pgtemplate_core::{Config, Context, TemplateServer};
use sqlx::{Connection, PgConnection};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

pub async fn start(config: Config) -> TemplateServer {
    init_tracing();
    TemplateServer::start(config)
        .await
        .expect("template server failed to start")
}

pub fn ctx() -> Context {
    Context::with_timeout(Duration::from_secs(30))
}

pub async fn count_rows(conn: &mut PgConnection, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(conn)
        .await
        .expect("count query failed")
}

/// Read from the template over a short-lived connection.
pub async fn template_rows(server: &TemplateServer, table: &str) -> i64 {
    let mut conn = PgConnection::connect(&server.template_url())
        .await
        .expect("template must stay reachable");
    let rows = count_rows(&mut conn, table).await;
    conn.close().await.expect("close template connection");
    rows
}
