//! Structured error types for pgtemplate-core.
//!
//! Every failure carries the operation that produced it and the underlying
//! cause. [`Error::kind`] groups variants into the four caller-facing
//! categories (setup, acquire, connect, release) plus shutdown.

use std::fmt;

use thiserror::Error;

/// Boxed error used at collaborator boundaries (provisioners, seed strategies).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type alias for pgtemplate-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for pgtemplate-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration rejected before anything was started
    #[error("Configuration error: {reason}")]
    Config { reason: String },

    /// Server start or template preparation failed; the system was not built
    #[error("Setup failed while {stage}: {source}")]
    Setup {
        stage: SetupStage,
        #[source]
        source: BoxError,
    },

    /// The caller's context ended before the clone gate was acquired
    #[error("Context ended while {operation}")]
    ContextEnded { operation: &'static str },

    /// The clone gate's pool could not hand out its connection
    #[error("Exclusive access to the server failed: {source}")]
    Gate {
        #[source]
        source: sqlx::Error,
    },

    /// `CREATE DATABASE ... TEMPLATE ...` failed on the server
    #[error("Failed to create database {name} from template: {source}")]
    Clone {
        name: String,
        #[source]
        source: sqlx::Error,
    },

    /// The clone exists but connecting to it failed; the database is orphaned
    #[error("Database {name} was created but connecting to it failed: {source}")]
    Connect {
        name: String,
        #[source]
        source: sqlx::Error,
    },

    /// The clone exists but the context ended while connecting to it
    #[error("Database {name} was created but the context ended while connecting")]
    ConnectCancelled { name: String },

    /// `DROP DATABASE` failed on the server
    #[error("Failed to drop database {name}: {source}")]
    Drop {
        name: String,
        #[source]
        source: sqlx::Error,
    },

    /// A read-only administrative query failed
    #[error("Administrative query failed while {operation}: {source}")]
    Query {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },

    /// Closing and/or dropping an instance failed
    #[error(transparent)]
    Release(#[from] ReleaseError),

    /// A drop was refused because the target is not a disposable clone
    #[error("Refusing to drop database {name}: {reason}")]
    ProtectedDatabase { name: String, reason: &'static str },

    /// Closing the gate or terminating the server failed
    #[error("Shutdown failed: {source}")]
    Shutdown {
        #[source]
        source: BoxError,
    },
}

/// Caller-facing failure category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Fatal: the system could not be constructed
    Setup,
    /// Recoverable per call: no instance was created
    Acquire,
    /// A clone was created but is unreachable (orphaned database)
    Connect,
    /// Best-effort cleanup failed; the database may be leaked
    Release,
    /// Teardown failed
    Shutdown,
}

impl Error {
    /// Create a config error
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Create a setup error for the given stage
    pub fn setup(stage: SetupStage, source: impl Into<BoxError>) -> Self {
        Self::Setup {
            stage,
            source: source.into(),
        }
    }

    /// Create a shutdown error
    pub fn shutdown(source: impl Into<BoxError>) -> Self {
        Self::Shutdown {
            source: source.into(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Error::Config { .. } | Error::Setup { .. } => FailureKind::Setup,
            Error::ContextEnded { .. }
            | Error::Gate { .. }
            | Error::Clone { .. }
            | Error::Query { .. }
            | Error::ProtectedDatabase { .. } => FailureKind::Acquire,
            Error::Connect { .. } | Error::ConnectCancelled { .. } => FailureKind::Connect,
            Error::Drop { .. } | Error::Release(_) => FailureKind::Release,
            Error::Shutdown { .. } => FailureKind::Shutdown,
        }
    }

    /// Name of a database this failure left behind on the server, if any.
    ///
    /// Pass it to `drop_orphan` to clean up.
    pub fn orphaned_database(&self) -> Option<&str> {
        match self {
            Error::Connect { name, .. } | Error::ConnectCancelled { name } => Some(name),
            Error::Release(release) if release.state() == InstanceState::Leaked => {
                Some(release.name())
            }
            _ => None,
        }
    }
}

/// Stage of [`TemplateServer::start`](crate::TemplateServer::start) that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStage {
    StartingServer,
    WaitingForReadiness,
    OpeningAdminConnection,
    ConnectingToTemplate,
    ApplyingMigrations,
    ExecutingSeedFiles,
    RunningSeedStrategy,
    ClosingTemplateConnection,
    MarkingTemplate,
}

impl fmt::Display for SetupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            SetupStage::StartingServer => "starting the database server",
            SetupStage::WaitingForReadiness => "waiting for the server to accept connections",
            SetupStage::OpeningAdminConnection => "opening the administrative connection",
            SetupStage::ConnectingToTemplate => "connecting to the template database",
            SetupStage::ApplyingMigrations => "applying migrations",
            SetupStage::ExecutingSeedFiles => "executing seed files",
            SetupStage::RunningSeedStrategy => "running the seed strategy",
            SetupStage::ClosingTemplateConnection => "closing the template connection",
            SetupStage::MarkingTemplate => "marking the template database",
        };
        f.write_str(stage)
    }
}

/// Lifecycle of a cloned database.
///
/// `Dropped` and `Leaked` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Created,
    Active,
    Closing,
    Dropped,
    Leaked,
}

/// Outcome of a failed release. Close and drop are reported separately so a
/// caller can tell whether the database is still on the server.
#[derive(Debug)]
pub struct ReleaseError {
    name: String,
    close: Option<sqlx::Error>,
    drop: Option<Box<Error>>,
}

impl ReleaseError {
    pub(crate) fn new(name: String, close: Option<sqlx::Error>, drop: Option<Error>) -> Self {
        Self {
            name,
            close,
            drop: drop.map(Box::new),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Error from closing the instance connection, if closing failed
    pub fn close_error(&self) -> Option<&sqlx::Error> {
        self.close.as_ref()
    }

    /// Error from dropping the database, if dropping failed
    pub fn drop_error(&self) -> Option<&Error> {
        self.drop.as_deref()
    }

    /// Terminal state the instance ended in
    pub fn state(&self) -> InstanceState {
        if self.drop.is_some() {
            InstanceState::Leaked
        } else {
            InstanceState::Dropped
        }
    }
}

impl fmt::Display for ReleaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Failed to release database {}", self.name)?;
        if let Some(close) = &self.close {
            write!(f, "; closing the connection failed: {close}")?;
        }
        match &self.drop {
            Some(drop) => write!(f, "; dropping the database failed (leaked): {drop}"),
            None => write!(f, "; database dropped"),
        }
    }
}

impl std::error::Error for ReleaseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match (&self.drop, &self.close) {
            (Some(drop), _) => Some(drop.as_ref()),
            (None, Some(close)) => Some(close),
            (None, None) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::config("database name is empty");
        assert_eq!(
            err.to_string(),
            "Configuration error: database name is empty"
        );

        let err = Error::setup(
            SetupStage::ApplyingMigrations,
            std::io::Error::new(std::io::ErrorKind::NotFound, "no such directory"),
        );
        assert!(err.to_string().contains("applying migrations"));
        assert!(err.to_string().contains("no such directory"));
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(Error::config("x").kind(), FailureKind::Setup);
        assert_eq!(
            Error::ContextEnded {
                operation: "waiting for the clone gate"
            }
            .kind(),
            FailureKind::Acquire
        );
        assert_eq!(
            Error::Gate {
                source: sqlx::Error::PoolTimedOut
            }
            .kind(),
            FailureKind::Acquire
        );
        assert_eq!(
            Error::Clone {
                name: "acme_0".into(),
                source: sqlx::Error::PoolClosed
            }
            .kind(),
            FailureKind::Acquire
        );
        assert_eq!(
            Error::ConnectCancelled {
                name: "acme_0".into()
            }
            .kind(),
            FailureKind::Connect
        );
        assert_eq!(
            Error::from(ReleaseError::new("acme_0".into(), None, None)).kind(),
            FailureKind::Release
        );
        assert_eq!(
            Error::shutdown(std::io::Error::other("gone")).kind(),
            FailureKind::Shutdown
        );
    }

    #[test]
    fn test_release_state_close_only() {
        let err = ReleaseError::new("acme_1".into(), Some(sqlx::Error::PoolClosed), None);
        assert_eq!(err.state(), InstanceState::Dropped);
        assert!(err.close_error().is_some());
        assert!(err.drop_error().is_none());
        assert!(err.to_string().contains("database dropped"));
        assert!(Error::from(err).orphaned_database().is_none());
    }

    #[test]
    fn test_release_state_leaked() {
        let drop = Error::ContextEnded {
            operation: "waiting for the clone gate",
        };
        let err = ReleaseError::new("acme_2".into(), None, Some(drop));
        assert_eq!(err.state(), InstanceState::Leaked);
        assert!(err.to_string().contains("leaked"));

        let err = Error::from(err);
        assert_eq!(err.orphaned_database(), Some("acme_2"));
    }

    #[test]
    fn test_connect_failure_reports_orphan() {
        let err = Error::Connect {
            name: "acme_3".into(),
            source: sqlx::Error::PoolTimedOut,
        };
        assert_eq!(err.orphaned_database(), Some("acme_3"));
        assert!(err.to_string().contains("acme_3"));
    }
}
