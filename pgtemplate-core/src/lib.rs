//! pgtemplate-core: isolated PostgreSQL databases for parallel tests
//!
//! One server, one template database prepared once (migrations, seed files,
//! seed strategy), and a fresh `CREATE DATABASE ... TEMPLATE` clone per test.
//! Every create and drop is serialized through a single-connection gate.
//!
//! ```ignore
//! let server = TemplateServer::start(Config::new("acme").with_seed_path("seeds")).await?;
//!
//! let ctx = Context::with_timeout(Duration::from_secs(30));
//! let mut db = server.acquire(&ctx).await?;
//! sqlx::query("SELECT 1").execute(db.conn()).await?;
//! server.release(&ctx, db).await?;
//!
//! server.shutdown().await?;
//! ```

pub mod config;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod gate;
pub mod instance;
pub mod naming;
pub mod server;
pub mod system;
pub mod template;

pub use config::Config;
pub use context::{CancelHandle, Context};
pub use endpoint::Endpoint;
pub use error::{BoxError, Error, FailureKind, InstanceState, ReleaseError, Result, SetupStage};
pub use gate::{CloneGate, ExclusiveLease};
pub use instance::{DatabaseInstance, InstanceManager};
pub use server::{ContainerProvisioner, ExternalServer, Provisioner, ServerHandle, ServerRequest};
pub use system::TemplateServer;
pub use template::{seed_fn, SeedStrategy};
