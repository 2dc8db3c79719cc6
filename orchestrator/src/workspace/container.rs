//! Tracked containers and their shutdown hooks

use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::models::CleanupAction;
use crate::runtime::DbInstance;
use crate::shutdown::{ShutdownArgs, ShutdownHook};

use super::registry::ContainerRegistry;

/// A database container shared by every workspace that names it
pub struct ContainerEntry {
    instance: Arc<dyn DbInstance>,
    cleanup_action: CleanupAction,
}

impl ContainerEntry {
    pub(crate) fn new(instance: Arc<dyn DbInstance>, cleanup_action: CleanupAction) -> Self {
        Self {
            instance,
            cleanup_action,
        }
    }

    pub fn name(&self) -> &str {
        self.instance.name()
    }

    pub fn image(&self) -> &str {
        self.instance.image()
    }

    pub fn instance(&self) -> &Arc<dyn DbInstance> {
        &self.instance
    }

    /// Disposition applied when the process shuts down
    pub fn cleanup_action(&self) -> CleanupAction {
        self.cleanup_action
    }

    /// Stop or destroy the container as configured. Failures are logged, not
    /// returned: shutdown carries on with the remaining containers.
    pub(crate) async fn apply_cleanup_action(&self) {
        let result = match self.cleanup_action {
            CleanupAction::None => return,
            CleanupAction::Stop => {
                info!(container = %self.name(), "Stopping container");
                self.instance.stop().await
            }
            CleanupAction::Destroy => {
                info!(container = %self.name(), "Destroying container");
                self.instance.destroy().await
            }
        };

        if let Err(e) = result {
            warn!(
                container = %self.name(),
                action = %self.cleanup_action,
                error = %e,
                "Container cleanup action failed"
            );
        }
    }
}

impl fmt::Debug for ContainerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerEntry")
            .field("name", &self.name())
            .field("image", &self.image())
            .field("cleanup_action", &self.cleanup_action)
            .finish()
    }
}

/// Registered once per container the first time a workspace uses it
pub(crate) struct ContainerShutdown {
    registry: Weak<ContainerRegistry>,
    entry: Arc<ContainerEntry>,
}

impl ContainerShutdown {
    pub(crate) fn new(registry: Weak<ContainerRegistry>, entry: Arc<ContainerEntry>) -> Self {
        Self { registry, entry }
    }
}

#[async_trait]
impl ShutdownHook for ContainerShutdown {
    async fn shutdown(&self, args: &ShutdownArgs) -> bool {
        if !args.matches(self.entry.name()) {
            return false;
        }

        match self.registry.upgrade() {
            Some(registry) => registry.shutdown_container(&self.entry).await,
            // Registry already gone; nothing left to deregister from
            None => self.entry.apply_cleanup_action().await,
        }
        true
    }
}
