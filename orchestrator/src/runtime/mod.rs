//! Container runtime and database instance interfaces
//!
//! The workspace layer only talks to containers through these traits:
//! - [`RuntimeConnector`] lazily produces a [`ContainerRuntime`]
//! - [`ContainerRuntime`] finds or creates a named container
//! - [`DbInstance`] runs schema operations against one container
//!
//! [`docker`] implements them with bollard and sqlx.

pub mod docker;
pub mod mysql;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::MySqlPool;

use crate::lock::SchemaLock;
use crate::models::SchemaDescription;

pub use docker::{DockerConnector, DockerRuntime, DockerizedInstance};
pub use mysql::MySqlInstance;

/// Parameters for finding or creating a database container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceOptions {
    /// Container name
    pub name: String,
    /// Image reference, e.g. `mysql:8.0`
    pub image: String,
    /// Root password for a newly created container
    pub root_password: String,
    /// Connection parameters applied to every connection
    pub default_conn_params: String,
}

/// A database server running in a container
#[async_trait]
pub trait DbInstance: Send + Sync {
    /// Container name
    fn name(&self) -> &str;

    /// Image the container runs
    fn image(&self) -> &str;

    async fn has_schema(&self, schema: &str) -> Result<bool>;

    /// Drop every table in `schema`. With `only_if_empty`, nothing is dropped
    /// if any table holds a row.
    async fn drop_tables_in_schema(&self, schema: &str, only_if_empty: bool) -> Result<()>;

    async fn create_schema(&self, schema: &str, charset: &str, collation: &str) -> Result<()>;

    /// Drop `schema`. With `only_if_empty`, fails without dropping anything if
    /// any table holds a row.
    async fn drop_schema(&self, schema: &str, only_if_empty: bool) -> Result<()>;

    /// Read back the current structure of `schema`
    async fn schema(&self, schema: &str) -> Result<SchemaDescription>;

    /// Connection pool scoped to `schema`, with `params` (`key=value&...`,
    /// values not URL-decoded) layered over the instance's default
    /// connection parameters
    async fn connect(&self, schema: &str, params: &str) -> Result<MySqlPool>;

    /// Acquire the named advisory lock, waiting at most `timeout`
    async fn lock(&self, name: &str, timeout: Duration) -> Result<Box<dyn SchemaLock>>;

    async fn stop(&self) -> Result<()>;

    async fn destroy(&self) -> Result<()>;
}

/// Finds or creates database containers
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn find_or_create(&self, opts: &InstanceOptions) -> Result<Arc<dyn DbInstance>>;
}

/// Produces the container runtime client on first use
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RuntimeConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn ContainerRuntime>>;
}
