//! Database server lifecycle.
//!
//! [`Provisioner`] brings a server up and hands back a [`ServerHandle`];
//! everything else in the crate only needs the handle's [`Endpoint`].
//! [`ContainerProvisioner`] runs a throwaway container through testcontainers,
//! [`ExternalServer`] borrows a server someone else runs.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use sqlx::{Connection, Executor, PgConnection};
use testcontainers::core::logs::consumer::LogConsumer;
use testcontainers::core::logs::LogFrame;
use testcontainers::core::{IntoContainerPort, Mount, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::endpoint::{Endpoint, ADMIN_DATABASE};
use crate::error::BoxError;
use crate::naming::quote_ident;
use crate::Result;

pub const POSTGRES_PORT: u16 = 5432;

/// Data directory inside the container, mounted as tmpfs.
const PGDATA: &str = "/var/lib/pg/data";

const READY_LOG_LINE: &str = "database system is ready to accept connections";
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A running server. Terminating it reclaims every database on it.
#[async_trait]
pub trait ServerHandle: Send + Sync {
    fn endpoint(&self) -> &Endpoint;

    /// Stop the server. Called at most once.
    async fn terminate(&mut self) -> std::result::Result<(), BoxError>;
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Start a server whose template database `request.database` exists and
    /// is empty.
    async fn start(
        &self,
        request: &ServerRequest,
    ) -> std::result::Result<Box<dyn ServerHandle>, BoxError>;
}

/// What to start.
#[derive(Debug, Clone)]
pub struct ServerRequest {
    pub image: String,
    pub tag: String,
    pub env: BTreeMap<String, String>,
    pub exposed_port: u16,
    pub cmd: Vec<String>,
    pub database: String,
    pub user: String,
    pub password: String,
    pub startup_timeout: Duration,
    pub forward_logs: bool,
}

impl ServerRequest {
    pub fn from_config(config: &Config) -> Result<Self> {
        let (image, tag) = config.image_parts()?;

        let env = BTreeMap::from([
            ("POSTGRES_USER".to_string(), config.user.clone()),
            ("POSTGRES_PASSWORD".to_string(), config.password.clone()),
            ("POSTGRES_DB".to_string(), config.database.clone()),
            ("PGDATA".to_string(), PGDATA.to_string()),
        ]);

        Ok(Self {
            image: image.to_string(),
            tag: tag.to_string(),
            env,
            exposed_port: POSTGRES_PORT,
            cmd: vec![
                "postgres".to_string(),
                "-c".to_string(),
                format!("max_connections={}", config.max_connections),
            ],
            database: config.database.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
            startup_timeout: config.startup_timeout,
            forward_logs: config.forward_container_logs,
        })
    }
}

/// Runs the server in a container removed on terminate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerProvisioner;

pub struct ContainerHandle {
    endpoint: Endpoint,
    container: Option<ContainerAsync<GenericImage>>,
}

#[async_trait]
impl Provisioner for ContainerProvisioner {
    async fn start(
        &self,
        request: &ServerRequest,
    ) -> std::result::Result<Box<dyn ServerHandle>, BoxError> {
        info!(image = %request.image, tag = %request.tag, "Starting database container");

        let mut container = GenericImage::new(request.image.clone(), request.tag.clone())
            .with_exposed_port(request.exposed_port.tcp())
            .with_wait_for(WaitFor::message_on_stderr(READY_LOG_LINE))
            .with_cmd(request.cmd.clone())
            .with_mount(Mount::tmpfs_mount(PGDATA))
            .with_startup_timeout(request.startup_timeout);
        for (key, value) in &request.env {
            container = container.with_env_var(key.clone(), value.clone());
        }
        if request.forward_logs {
            container = container.with_log_consumer(TracingLogConsumer);
        }

        let container = container.start().await?;
        let host = container.get_host().await?.to_string();
        let port = container
            .get_host_port_ipv4(request.exposed_port.tcp())
            .await?;
        info!(%host, port, "Database container started");

        Ok(Box::new(ContainerHandle {
            endpoint: Endpoint::new(host, port, &request.user, &request.password),
            container: Some(container),
        }))
    }
}

#[async_trait]
impl ServerHandle for ContainerHandle {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn terminate(&mut self) -> std::result::Result<(), BoxError> {
        if let Some(container) = self.container.take() {
            container.rm().await?;
            info!("Database container removed");
        }
        Ok(())
    }
}

/// Forwards container output to `tracing`.
struct TracingLogConsumer;

impl LogConsumer for TracingLogConsumer {
    fn accept<'a>(&'a self, record: &'a LogFrame) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let (stream, bytes) = match record {
                LogFrame::StdOut(bytes) => ("stdout", bytes),
                LogFrame::StdErr(bytes) => ("stderr", bytes),
            };
            let line = String::from_utf8_lossy(bytes);
            debug!(target: "pgtemplate::container", stream, "{}", line.trim_end());
        })
    }
}

/// A server already running at `endpoint`, reached with administrative
/// credentials. The template database is recreated on start and dropped on
/// terminate; the server itself is left alone.
///
/// A database that already carries the template's name is dropped on start
/// only if it is flagged `is_template` (a leftover from an earlier run).
/// Any other database of that name makes start fail.
#[derive(Debug, Clone)]
pub struct ExternalServer {
    endpoint: Endpoint,
}

impl ExternalServer {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }
}

pub struct ExternalHandle {
    endpoint: Endpoint,
    database: Option<String>,
}

#[async_trait]
impl Provisioner for ExternalServer {
    async fn start(
        &self,
        request: &ServerRequest,
    ) -> std::result::Result<Box<dyn ServerHandle>, BoxError> {
        let mut admin =
            PgConnection::connect_with(&self.endpoint.connect_options(ADMIN_DATABASE)).await?;

        match template_flag(&mut admin, &request.database).await? {
            Some(false) => {
                admin.close().await?;
                return Err(format!(
                    "database {} already exists on the server and is not a template; refusing to drop it",
                    request.database
                )
                .into());
            }
            Some(true) => {
                warn!(database = %request.database, "Dropping template left by an earlier run");
                drop_template(&mut admin, &request.database).await?;
            }
            None => {}
        }

        let sql = format!("CREATE DATABASE {}", quote_ident(&request.database));
        (&mut admin).execute(sql.as_str()).await?;
        admin.close().await?;
        info!(database = %request.database, "Created template database on external server");

        Ok(Box::new(ExternalHandle {
            endpoint: self.endpoint.clone(),
            database: Some(request.database.clone()),
        }))
    }
}

#[async_trait]
impl ServerHandle for ExternalHandle {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn terminate(&mut self) -> std::result::Result<(), BoxError> {
        if let Some(database) = self.database.take() {
            let mut admin =
                PgConnection::connect_with(&self.endpoint.connect_options(ADMIN_DATABASE)).await?;
            if template_flag(&mut admin, &database).await?.is_some() {
                drop_template(&mut admin, &database).await?;
            }
            admin.close().await?;
            info!(%database, "Dropped template database on external server");
        }
        Ok(())
    }
}

/// `Some(datistemplate)` if `database` exists, `None` otherwise.
async fn template_flag(
    admin: &mut PgConnection,
    database: &str,
) -> std::result::Result<Option<bool>, BoxError> {
    let flag = sqlx::query_scalar("SELECT datistemplate FROM pg_database WHERE datname = $1")
        .bind(database)
        .fetch_optional(&mut *admin)
        .await?;
    Ok(flag)
}

/// Drop `database`, clearing its template flag first (template databases
/// cannot be dropped).
async fn drop_template(
    admin: &mut PgConnection,
    database: &str,
) -> std::result::Result<(), BoxError> {
    let ident = quote_ident(database);
    let unmark = format!("ALTER DATABASE {ident} WITH is_template = false");
    (&mut *admin).execute(unmark.as_str()).await?;
    let drop = format!("DROP DATABASE {ident} WITH (FORCE)");
    (&mut *admin).execute(drop.as_str()).await?;
    debug!(%database, "Dropped template database");
    Ok(())
}

/// Retry connecting to `database` until a `SELECT 1` round-trip succeeds or
/// `timeout` elapses.
pub async fn wait_ready(
    endpoint: &Endpoint,
    database: &str,
    timeout: Duration,
) -> std::result::Result<(), BoxError> {
    let deadline = Instant::now() + timeout;
    let options = endpoint.connect_options(database);

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let attempt = tokio::time::timeout(remaining, async {
            let mut conn = PgConnection::connect_with(&options).await?;
            conn.ping().await?;
            conn.close().await
        })
        .await;

        let last_error: BoxError = match attempt {
            Ok(Ok(())) => {
                debug!(database, "Server is ready");
                return Ok(());
            }
            Ok(Err(e)) => e.into(),
            Err(_) => "connection attempt timed out".into(),
        };

        if Instant::now() + READY_POLL_INTERVAL >= deadline {
            return Err(format!(
                "server not ready after {}s: {last_error}",
                timeout.as_secs_f32()
            )
            .into());
        }
        sleep(READY_POLL_INTERVAL).await;
    }
}
