//! Workspace error types

use thiserror::Error;

/// Errors surfaced by workspace creation, use and cleanup.
///
/// Everything past flavor validation names the container (and schema, where
/// one is involved) so a failure can be traced back to the instance it hit.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("unsupported flavor {0}")]
    UnsupportedFlavor(String),

    #[error("unable to initialize container runtime: {0:#}")]
    RuntimeInit(#[source] anyhow::Error),

    #[error("unable to find or create container {container}: {source:#}")]
    ContainerCreate {
        container: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("unable to obtain lock for {schema} on {container}: {source:#}")]
    LockAcquire {
        container: String,
        schema: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("unable to check for existence of temp schema {schema} on {container}: {source:#}")]
    SchemaCheck {
        container: String,
        schema: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("cannot drop existing temporary schema tables in {schema} on {container}: {source:#}")]
    DropTables {
        container: String,
        schema: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("cannot create temporary schema {schema} on {container}: {source:#}")]
    CreateSchema {
        container: String,
        schema: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("cannot drop temporary schema {schema} on {container}: {source:#}")]
    DropSchema {
        container: String,
        schema: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("unable to release lock for {schema} on {container}: {source:#}")]
    LockRelease {
        container: String,
        schema: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("cannot connect to temporary schema {schema} on {container}: {source:#}")]
    Connect {
        container: String,
        schema: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("cannot introspect temporary schema {schema} on {container}: {source:#}")]
    Introspect {
        container: String,
        schema: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("cleanup called multiple times on workspace {schema} (container {container})")]
    AlreadyCleanedUp { container: String, schema: String },
}

impl WorkspaceError {
    /// Whether this is the double-cleanup error
    pub fn is_already_cleaned_up(&self) -> bool {
        matches!(self, WorkspaceError::AlreadyCleanedUp { .. })
    }
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;
