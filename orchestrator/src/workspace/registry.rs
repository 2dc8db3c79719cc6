//! Registry of containers in use by this process

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Result, WorkspaceError};
use crate::models::CleanupAction;
use crate::runtime::{ContainerRuntime, InstanceOptions, RuntimeConnector};
use crate::shutdown::ShutdownRegistry;

use super::container::{ContainerEntry, ContainerShutdown};

#[derive(Default)]
struct RegistryState {
    /// Created on first use
    runtime: Option<Arc<dyn ContainerRuntime>>,
    containers: HashMap<String, Arc<ContainerEntry>>,
}

/// Map from container name to the container serving it.
///
/// One mutex covers runtime initialization, lookups and container creation,
/// so two callers racing on a new name never create the container twice.
pub struct ContainerRegistry {
    connector: Arc<dyn RuntimeConnector>,
    shutdown: Arc<ShutdownRegistry>,
    state: Mutex<RegistryState>,
}

impl ContainerRegistry {
    pub fn new(connector: Arc<dyn RuntimeConnector>, shutdown: Arc<ShutdownRegistry>) -> Arc<Self> {
        Arc::new(Self {
            connector,
            shutdown,
            state: Mutex::new(RegistryState::default()),
        })
    }

    /// Return the tracked container called `opts.name`, finding or creating
    /// it through the runtime on first use. A newly tracked container gets
    /// exactly one shutdown hook applying `cleanup_action`.
    pub async fn resolve_or_create(
        self: &Arc<Self>,
        opts: &InstanceOptions,
        cleanup_action: CleanupAction,
    ) -> Result<Arc<ContainerEntry>> {
        let mut state = self.state.lock().await;

        let runtime = match &state.runtime {
            Some(runtime) => runtime.clone(),
            None => {
                let runtime = self
                    .connector
                    .connect()
                    .await
                    .map_err(WorkspaceError::RuntimeInit)?;
                state.runtime = Some(runtime.clone());
                runtime
            }
        };

        if let Some(entry) = state.containers.get(&opts.name) {
            return Ok(entry.clone());
        }

        info!(
            container = %opts.name,
            image = %opts.image,
            "Using container for workspace operations"
        );
        let instance = runtime
            .find_or_create(opts)
            .await
            .map_err(|source| WorkspaceError::ContainerCreate {
                container: opts.name.clone(),
                source,
            })?;

        let entry = Arc::new(ContainerEntry::new(instance, cleanup_action));
        state.containers.insert(opts.name.clone(), entry.clone());
        self.shutdown
            .register(Arc::new(ContainerShutdown::new(
                Arc::downgrade(self),
                entry.clone(),
            )))
            .await;

        Ok(entry)
    }

    /// Apply the entry's cleanup action and stop tracking it. No-op if the
    /// entry is no longer the one registered under its name.
    pub(crate) async fn shutdown_container(&self, entry: &Arc<ContainerEntry>) {
        let mut state = self.state.lock().await;

        match state.containers.get(entry.name()) {
            Some(current) if Arc::ptr_eq(current, entry) => {
                entry.apply_cleanup_action().await;
                state.containers.remove(entry.name());
            }
            _ => debug!(container = %entry.name(), "Container no longer tracked"),
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<ContainerEntry>> {
        self.state.lock().await.containers.get(name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.state.lock().await.containers.contains_key(name)
    }

    /// Names of all tracked containers, sorted
    pub async fn container_names(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut names: Vec<String> = state.containers.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.containers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.containers.is_empty()
    }

    /// Whether the runtime client has been created
    pub async fn is_initialized(&self) -> bool {
        self.state.lock().await.runtime.is_some()
    }
}
