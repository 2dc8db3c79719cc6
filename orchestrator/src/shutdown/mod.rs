//! Shutdown hook registry
//!
//! Components register a hook once; [`ShutdownRegistry::shutdown`] runs every
//! hook at program exit or on an explicit request. A hook that declines (for
//! example because a name filter excludes it) stays registered for a later
//! call; a hook that handles the request is deregistered.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

/// Arguments passed to every shutdown hook
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownArgs {
    /// Only shut down resources whose name starts with this prefix
    pub name_prefix: Option<String>,
}

impl ShutdownArgs {
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            name_prefix: Some(prefix.into()),
        }
    }

    /// Whether a resource called `name` is selected by these arguments
    pub fn matches(&self, name: &str) -> bool {
        self.name_prefix
            .as_deref()
            .map_or(true, |prefix| name.starts_with(prefix))
    }
}

/// A callback run at shutdown
#[async_trait]
pub trait ShutdownHook: Send + Sync {
    /// Returns whether the hook handled the request
    async fn shutdown(&self, args: &ShutdownArgs) -> bool;
}

/// Process-lifetime list of shutdown hooks
#[derive(Default)]
pub struct ShutdownRegistry {
    hooks: Mutex<Vec<Arc<dyn ShutdownHook>>>,
}

impl ShutdownRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, hook: Arc<dyn ShutdownHook>) {
        self.hooks.lock().await.push(hook);
    }

    /// Number of hooks still registered
    pub async fn len(&self) -> usize {
        self.hooks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.hooks.lock().await.is_empty()
    }

    /// Run every registered hook, returning how many handled the request.
    ///
    /// Hooks run without the registry lock held, so a hook may take other
    /// locks whose holders register new hooks.
    pub async fn shutdown(&self, args: &ShutdownArgs) -> usize {
        let hooks = std::mem::take(&mut *self.hooks.lock().await);

        let mut retained = Vec::new();
        let mut handled = 0;
        for hook in hooks {
            if hook.shutdown(args).await {
                handled += 1;
            } else {
                retained.push(hook);
            }
        }

        let mut current = self.hooks.lock().await;
        // Keep declined hooks ahead of any registered while we ran
        retained.append(&mut current);
        *current = retained;

        debug!(handled, remaining = current.len(), "Shutdown hooks run");
        handled
    }
}
