//! Handle to one caller's temporary schema

use std::fmt;
use std::sync::Arc;

use sqlx::MySqlPool;
use tracing::{debug, warn};

use crate::error::{Result, WorkspaceError};
use crate::lock::SchemaLock;
use crate::models::{CleanupAction, SchemaDescription};

use super::container::ContainerEntry;

/// An exclusively owned temporary schema on a shared container.
///
/// The schema's advisory lock is held for as long as the workspace is live.
/// [`Workspace::cleanup`] drops the schema and releases the lock; the
/// container itself is left alone until process shutdown.
pub struct Workspace {
    schema_name: String,
    container: Arc<ContainerEntry>,
    lock: Option<Box<dyn SchemaLock>>,
    cleanup_action: CleanupAction,
}

impl Workspace {
    pub(crate) fn new(
        schema_name: String,
        container: Arc<ContainerEntry>,
        lock: Box<dyn SchemaLock>,
        cleanup_action: CleanupAction,
    ) -> Self {
        Self {
            schema_name,
            container,
            lock: Some(lock),
            cleanup_action,
        }
    }

    pub fn schema_name(&self) -> &str {
        &self.schema_name
    }

    pub fn container_name(&self) -> &str {
        self.container.name()
    }

    /// Container disposition requested when this workspace was created
    pub fn cleanup_action(&self) -> CleanupAction {
        self.cleanup_action
    }

    pub fn is_cleaned_up(&self) -> bool {
        self.lock.is_none()
    }

    /// Connection pool with the workspace schema as default database.
    ///
    /// `params` is `key=value` pairs joined by `&`, layered over the
    /// container's default parameters. `charset` and `collation` configure
    /// the driver; every other pair becomes a session variable set on each
    /// new connection. Values are used as written (no URL decoding); a key
    /// that is not a plain variable name, or a pair without `=`, is
    /// rejected with [`WorkspaceError::Connect`].
    pub async fn connection_pool(&self, params: &str) -> Result<MySqlPool> {
        self.container
            .instance()
            .connect(&self.schema_name, params)
            .await
            .map_err(|source| WorkspaceError::Connect {
                container: self.container_name().to_string(),
                schema: self.schema_name.clone(),
                source,
            })
    }

    /// Current structure of the workspace schema
    pub async fn introspect_schema(&self) -> Result<SchemaDescription> {
        self.container
            .instance()
            .schema(&self.schema_name)
            .await
            .map_err(|source| WorkspaceError::Introspect {
                container: self.container_name().to_string(),
                schema: self.schema_name.clone(),
                source,
            })
    }

    /// Drop the temporary schema and release its lock.
    ///
    /// Aborts if any table in the schema has rows, leaving both the schema and
    /// the lock in place. Calling this again after a successful cleanup
    /// returns [`WorkspaceError::AlreadyCleanedUp`].
    pub async fn cleanup(&mut self) -> Result<()> {
        if self.lock.is_none() {
            return Err(WorkspaceError::AlreadyCleanedUp {
                container: self.container_name().to_string(),
                schema: self.schema_name.clone(),
            });
        }

        self.container
            .instance()
            .drop_schema(&self.schema_name, true)
            .await
            .map_err(|source| WorkspaceError::DropSchema {
                container: self.container_name().to_string(),
                schema: self.schema_name.clone(),
                source,
            })?;

        if let Some(lock) = self.lock.take() {
            lock.release()
                .await
                .map_err(|source| WorkspaceError::LockRelease {
                    container: self.container_name().to_string(),
                    schema: self.schema_name.clone(),
                    source,
                })?;
        }

        debug!(
            container = %self.container_name(),
            schema = %self.schema_name,
            "Workspace cleaned up"
        );
        Ok(())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Some(lock) = &self.lock {
            warn!(
                container = %self.container.name(),
                schema = %self.schema_name,
                lock = %lock.name(),
                "Workspace dropped without cleanup"
            );
        }
    }
}

impl fmt::Debug for Workspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workspace")
            .field("schema_name", &self.schema_name)
            .field("container", &self.container.name())
            .field("cleaned_up", &self.is_cleaned_up())
            .field("cleanup_action", &self.cleanup_action)
            .finish()
    }
}
