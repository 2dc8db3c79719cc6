//! Skeema workspace library
//!
//! Provisions temporary, exclusively locked schemas on shared Dockerized
//! MySQL-family containers. Containers are created on first use, reused by
//! every later workspace that names them, and stopped or destroyed when the
//! process shuts down.

pub mod config;
pub mod error;
pub mod lock;
pub mod logging;
pub mod models;
pub mod runtime;
pub mod shutdown;
pub mod workspace;

pub use crate::config::{AppConfig, LogFormat, WorkspaceConfig};
pub use crate::error::{Result, WorkspaceError};
pub use crate::models::{CleanupAction, Flavor, SchemaDescription, TableDescription, Vendor, WorkspaceOptions};
pub use crate::shutdown::{ShutdownArgs, ShutdownHook, ShutdownRegistry};
pub use crate::workspace::{ContainerRegistry, Workspace, WorkspaceManager};
