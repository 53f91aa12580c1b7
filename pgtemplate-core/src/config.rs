//! System configuration.
//!
//! Everything except the seed strategy can be read from a file:
//!
//! ```toml
//! user = "postgres"
//! password = "postgres"
//! database = "acme"
//! migrations_path = "migrations"
//! seed_path = "seeds"
//! startup_timeout_secs = 30
//! ```

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::naming::validate_template_name;
use crate::template::SeedStrategy;
use crate::{Error, Result};

pub const DEFAULT_IMAGE: &str = "postgres:17.2";
pub const DEFAULT_MAX_CONNECTIONS: u32 = 1000;
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_GATE_WAIT_WARNING: Duration = Duration::from_secs(300);

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Role used for the template and every clone
    pub user: String,
    pub password: String,
    /// Name of the template database
    pub database: String,
    /// Server image, `name[:tag]`
    pub image: String,
    /// `max_connections` passed to the server
    pub max_connections: u32,
    /// Directory of versioned migrations applied to the template
    pub migrations_path: Option<PathBuf>,
    /// Directory of `.sql` files executed against the template in name order
    pub seed_path: Option<PathBuf>,
    /// Runs after migrations and seed files
    #[serde(skip)]
    pub seed: Option<Arc<dyn SeedStrategy>>,
    /// Bound on container start plus the readiness probe
    #[serde(rename = "startup_timeout_secs", deserialize_with = "duration_secs")]
    pub startup_timeout: Duration,
    /// How long a caller waits for the clone gate before a warning is
    /// logged; the wait itself only ends with the caller's context
    #[serde(rename = "gate_wait_warning_secs", deserialize_with = "duration_secs")]
    pub gate_wait_warning: Duration,
    /// Forward the server's stdout/stderr to `tracing` at debug level
    pub forward_container_logs: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user: "postgres".to_string(),
            password: "postgres".to_string(),
            database: "template_db".to_string(),
            image: DEFAULT_IMAGE.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            migrations_path: None,
            seed_path: None,
            seed: None,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            gate_wait_warning: DEFAULT_GATE_WAIT_WARNING,
            forward_container_logs: false,
        }
    }
}

impl Config {
    /// Default configuration for a template named `database`.
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            ..Self::default()
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    pub fn with_migrations(mut self, path: impl Into<PathBuf>) -> Self {
        self.migrations_path = Some(path.into());
        self
    }

    pub fn with_seed_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.seed_path = Some(path.into());
        self
    }

    pub fn with_seed(mut self, seed: impl SeedStrategy + 'static) -> Self {
        self.seed = Some(Arc::new(seed));
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_template_name(&self.database).map_err(Error::config)?;
        if self.user.is_empty() {
            return Err(Error::config("user must not be empty"));
        }
        if self.max_connections == 0 {
            return Err(Error::config("max_connections must be greater than zero"));
        }
        self.image_parts()?;
        Ok(())
    }

    /// Split `image` into repository and tag (`latest` when absent).
    pub fn image_parts(&self) -> Result<(&str, &str)> {
        let image = self.image.trim();
        if image.is_empty() {
            return Err(Error::config("image must not be empty"));
        }
        // A ':' before the last '/' belongs to a registry port, not a tag.
        let tag_sep = image
            .rfind(':')
            .filter(|&i| image[i..].find('/').is_none());
        match tag_sep {
            Some(i) if i == 0 || i == image.len() - 1 => {
                Err(Error::config(format!("image '{image}' is not of the form name[:tag]")))
            }
            Some(i) => Ok((&image[..i], &image[i + 1..])),
            None => Ok((image, "latest")),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("image", &self.image)
            .field("max_connections", &self.max_connections)
            .field("migrations_path", &self.migrations_path)
            .field("seed_path", &self.seed_path)
            .field("seed", &self.seed.as_ref().map(|_| "<strategy>"))
            .field("startup_timeout", &self.startup_timeout)
            .field("gate_wait_warning", &self.gate_wait_warning)
            .field("forward_container_logs", &self.forward_container_logs)
            .finish()
    }
}

fn duration_secs<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_secs)
}
