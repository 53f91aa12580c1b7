//! System handle: owns the server and the clone gate for the process lifetime.

use tracing::{info, warn};

use crate::config::Config;
use crate::context::Context;
use crate::endpoint::Endpoint;
use crate::error::SetupStage;
use crate::gate::CloneGate;
use crate::instance::{DatabaseInstance, InstanceManager};
use crate::server::{wait_ready, ContainerProvisioner, Provisioner, ServerHandle, ServerRequest};
use crate::template;
use crate::{Error, Result};

/// A running server with a prepared template database.
///
/// Share one `TemplateServer` between tests (for example through a
/// `tokio::sync::OnceCell`) and call [`acquire`](Self::acquire) /
/// [`release`](Self::release) per test. Connections belong to the runtime
/// that created them, so keep all users on one runtime.
pub struct TemplateServer {
    server: Box<dyn ServerHandle>,
    instances: InstanceManager,
}

impl TemplateServer {
    /// Start a container and prepare the template described by `config`.
    pub async fn start(config: Config) -> Result<Self> {
        Self::start_with(config, &ContainerProvisioner).await
    }

    /// Like [`start`](Self::start) with an explicit provisioner.
    ///
    /// Never returns a half-built system: if any stage after the server came
    /// up fails, the server is terminated before the error is returned.
    pub async fn start_with(config: Config, provisioner: &dyn Provisioner) -> Result<Self> {
        config.validate()?;
        let request = ServerRequest::from_config(&config)?;

        let mut server = provisioner
            .start(&request)
            .await
            .map_err(|e| Error::setup(SetupStage::StartingServer, e))?;

        let prepared = Self::prepare(&config, server.endpoint()).await;
        match prepared {
            Ok(instances) => {
                info!(template = %config.database, "Template server ready");
                Ok(Self { server, instances })
            }
            Err(err) => {
                if let Err(term) = server.terminate().await {
                    warn!(error = %term, "Failed to terminate server after setup error");
                }
                Err(err)
            }
        }
    }

    async fn prepare(config: &Config, endpoint: &Endpoint) -> Result<InstanceManager> {
        wait_ready(endpoint, &config.database, config.startup_timeout)
            .await
            .map_err(|e| Error::setup(SetupStage::WaitingForReadiness, e))?;

        let gate = CloneGate::connect(endpoint, config.gate_wait_warning)
            .await
            .map_err(|e| Error::setup(SetupStage::OpeningAdminConnection, e))?;

        if let Err(err) = template::prepare(&gate, endpoint, config).await {
            gate.close().await;
            return Err(err);
        }

        Ok(InstanceManager::new(
            gate,
            endpoint.clone(),
            config.database.clone(),
        ))
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.server.endpoint()
    }

    pub fn template_name(&self) -> &str {
        self.instances.template()
    }

    /// URL of the template database. Read-only: connecting to it while clones
    /// are being created makes those clones fail.
    pub fn template_url(&self) -> String {
        self.endpoint().url(self.template_name())
    }

    pub fn instances(&self) -> &InstanceManager {
        &self.instances
    }

    /// See [`InstanceManager::acquire`].
    pub async fn acquire(&self, ctx: &Context) -> Result<DatabaseInstance> {
        self.instances.acquire(ctx).await
    }

    /// See [`InstanceManager::release`].
    pub async fn release(&self, ctx: &Context, instance: DatabaseInstance) -> Result<()> {
        self.instances.release(ctx, instance).await
    }

    /// See [`InstanceManager::drop_orphan`].
    pub async fn drop_orphan(&self, ctx: &Context, name: &str) -> Result<()> {
        self.instances.drop_orphan(ctx, name).await
    }

    /// See [`InstanceManager::list_clones`].
    pub async fn list_clones(&self, ctx: &Context) -> Result<Vec<String>> {
        self.instances.list_clones(ctx).await
    }

    /// Close the gate and terminate the server. Outstanding instances become
    /// unusable.
    pub async fn shutdown(self) -> Result<()> {
        let Self {
            mut server,
            instances,
        } = self;

        instances.gate().close().await;
        server.terminate().await.map_err(Error::shutdown)?;
        info!("Template server shut down");
        Ok(())
    }
}
