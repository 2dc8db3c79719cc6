//! Temporary schema workspaces on shared database containers

mod container;
mod handle;
mod manager;
mod registry;

#[cfg(test)]
pub(crate) mod fakes;

pub use container::ContainerEntry;
pub use handle::Workspace;
pub use manager::{default_container_name, lock_name, WorkspaceManager, DEFAULT_CONTAINER_PREFIX};
pub use registry::ContainerRegistry;
