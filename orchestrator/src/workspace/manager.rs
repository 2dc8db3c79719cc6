//! Workspace creation

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::error::{Result, WorkspaceError};
use crate::models::WorkspaceOptions;
use crate::runtime::{DbInstance, DockerConnector, InstanceOptions, RuntimeConnector};
use crate::shutdown::{ShutdownArgs, ShutdownRegistry};

use super::handle::Workspace;
use super::registry::ContainerRegistry;

/// Prefix for containers whose name is derived from their image
pub const DEFAULT_CONTAINER_PREFIX: &str = "skeema";

/// Hands out temporary schemas on shared, reusable containers.
///
/// Owns the container registry and the shutdown hooks registered for its
/// containers. Construct one per process and call
/// [`WorkspaceManager::shutdown`] before exit.
pub struct WorkspaceManager {
    registry: Arc<ContainerRegistry>,
    shutdown: Arc<ShutdownRegistry>,
    container_prefix: String,
}

impl WorkspaceManager {
    pub fn new(connector: Arc<dyn RuntimeConnector>) -> Self {
        Self::with_shutdown_registry(connector, Arc::new(ShutdownRegistry::new()))
    }

    /// Register container shutdown hooks with an existing registry
    pub fn with_shutdown_registry(
        connector: Arc<dyn RuntimeConnector>,
        shutdown: Arc<ShutdownRegistry>,
    ) -> Self {
        Self {
            registry: ContainerRegistry::new(connector, shutdown.clone()),
            shutdown,
            container_prefix: DEFAULT_CONTAINER_PREFIX.to_string(),
        }
    }

    /// Docker-backed manager configured from `config`
    pub fn from_config(config: &AppConfig) -> Self {
        let connector = DockerConnector::new(
            config.docker_socket.clone(),
            Duration::from_secs(config.workspace.ready_timeout_secs),
        );
        Self::new(Arc::new(connector)).with_container_prefix(config.container_prefix.clone())
    }

    pub fn with_container_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.container_prefix = prefix.into();
        self
    }

    pub fn registry(&self) -> &Arc<ContainerRegistry> {
        &self.registry
    }

    pub fn shutdown_registry(&self) -> &Arc<ShutdownRegistry> {
        &self.shutdown
    }

    /// Find or create the container for `opts`, lock the requested schema
    /// name and provision an empty schema under it.
    pub async fn create(&self, opts: WorkspaceOptions) -> Result<Workspace> {
        if !opts.flavor.supported() {
            return Err(WorkspaceError::UnsupportedFlavor(opts.flavor.to_string()));
        }

        let image = opts.flavor.image();
        let container_name = opts
            .container_name
            .clone()
            .unwrap_or_else(|| default_container_name(&self.container_prefix, &image));

        let entry = self
            .registry
            .resolve_or_create(
                &InstanceOptions {
                    name: container_name,
                    image,
                    root_password: opts.root_password.clone(),
                    default_conn_params: opts.default_conn_params.clone(),
                },
                opts.cleanup_action,
            )
            .await?;
        let instance = entry.instance();

        let lock = instance
            .lock(&lock_name(&opts.schema_name), opts.lock_wait_timeout)
            .await
            .map_err(|source| WorkspaceError::LockAcquire {
                container: entry.name().to_string(),
                schema: opts.schema_name.clone(),
                source,
            })?;

        // Until the workspace is returned, every failure must give the lock back
        if let Err(err) = provision(instance.as_ref(), &opts).await {
            if let Err(e) = lock.release().await {
                warn!(
                    container = %entry.name(),
                    schema = %opts.schema_name,
                    error = %e,
                    "Failed to release lock after provisioning error"
                );
            }
            return Err(err);
        }

        debug!(
            container = %entry.name(),
            schema = %opts.schema_name,
            "Workspace ready"
        );
        Ok(Workspace::new(
            opts.schema_name,
            entry.clone(),
            lock,
            opts.cleanup_action,
        ))
    }

    /// Run shutdown hooks for tracked containers, returning how many
    /// containers were handled
    pub async fn shutdown(&self, args: &ShutdownArgs) -> usize {
        self.shutdown.shutdown(args).await
    }
}

/// Reuse an existing schema if all its tables are empty, otherwise create it
async fn provision(instance: &dyn DbInstance, opts: &WorkspaceOptions) -> Result<()> {
    let schema = &opts.schema_name;

    let exists = instance
        .has_schema(schema)
        .await
        .map_err(|source| WorkspaceError::SchemaCheck {
            container: instance.name().to_string(),
            schema: schema.clone(),
            source,
        })?;

    if exists {
        instance
            .drop_tables_in_schema(schema, true)
            .await
            .map_err(|source| WorkspaceError::DropTables {
                container: instance.name().to_string(),
                schema: schema.clone(),
                source,
            })
    } else {
        instance
            .create_schema(schema, &opts.default_character_set, &opts.default_collation)
            .await
            .map_err(|source| WorkspaceError::CreateSchema {
                container: instance.name().to_string(),
                schema: schema.clone(),
                source,
            })
    }
}

/// Container name for an image, e.g. `skeema-mysql-8.0` for `mysql:8.0`.
/// Characters Docker does not accept in names become `-`.
pub fn default_container_name(prefix: &str, image: &str) -> String {
    let image: String = image
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("{}-{}", prefix, image)
}

/// Advisory lock name guarding a schema
pub fn lock_name(schema: &str) -> String {
    format!("skeema.{}", schema)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CleanupAction, Flavor, Vendor};
    use crate::workspace::fakes::FakeRuntime;
    use futures::future::join_all;
    use pretty_assertions::assert_eq;

    fn options(schema: &str) -> WorkspaceOptions {
        WorkspaceOptions::new(schema, Flavor::new(Vendor::MySQL, 8, 0))
            .with_lock_wait_timeout(Duration::from_millis(200))
    }

    #[test]
    fn test_default_container_name() {
        assert_eq!(default_container_name("skeema", "mysql:8.0"), "skeema-mysql-8.0");
        assert_eq!(
            default_container_name("skeema", "mariadb:10.11.6"),
            "skeema-mariadb-10.11.6"
        );
        assert_eq!(
            default_container_name("ci", "mysql/mysql-server:8.0"),
            "ci-mysql-mysql-server-8.0"
        );
    }

    #[test]
    fn test_lock_name() {
        assert_eq!(lock_name("ws_test1"), "skeema.ws_test1");
    }

    #[tokio::test]
    async fn test_create_provisions_fresh_schema() {
        let runtime = FakeRuntime::new();
        let manager = WorkspaceManager::new(runtime.connector());

        let ws = manager.create(options("ws_a")).await.unwrap();
        assert_eq!(ws.schema_name(), "ws_a");
        assert_eq!(ws.container_name(), "skeema-mysql-8.0");
        assert!(!ws.is_cleaned_up());

        let instance = runtime.instance("skeema-mysql-8.0").unwrap();
        assert!(instance.schema_exists("ws_a"));
        assert_eq!(instance.schema_charset("ws_a").as_deref(), Some("utf8mb4"));
        assert!(instance.lock_held("skeema.ws_a"));
        assert_eq!(manager.registry().len().await, 1);
        assert_eq!(manager.shutdown_registry().len().await, 1);
    }

    #[tokio::test]
    async fn test_unsupported_flavor_has_no_side_effects() {
        let runtime = FakeRuntime::new();
        let manager = WorkspaceManager::new(runtime.connector());

        let opts = WorkspaceOptions::new("ws_a", Flavor::new(Vendor::MySQL, 4, 1));
        let err = manager.create(opts).await.unwrap_err();

        assert!(matches!(err, WorkspaceError::UnsupportedFlavor(ref f) if f == "mysql:4.1"));
        assert_eq!(runtime.connects(), 0);
        assert!(!manager.registry().is_initialized().await);
    }

    #[tokio::test]
    async fn test_explicit_container_name() {
        let runtime = FakeRuntime::new();
        let manager = WorkspaceManager::new(runtime.connector());

        let mut ws = manager
            .create(options("ws_a").with_container_name("ci-db"))
            .await
            .unwrap();
        assert_eq!(ws.container_name(), "ci-db");
        assert!(manager.registry().contains("ci-db").await);
        ws.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_first_use_creates_one_container() {
        let runtime = FakeRuntime::with_create_delay(Duration::from_millis(50));
        let manager = WorkspaceManager::new(runtime.connector());

        let results = join_all((0..8).map(|i| manager.create(options(&format!("ws_{}", i))))).await;
        let mut workspaces: Vec<Workspace> = results.into_iter().map(Result::unwrap).collect();

        assert_eq!(runtime.creations(), 1);
        assert_eq!(runtime.connects(), 1);
        assert_eq!(manager.registry().len().await, 1);
        assert_eq!(manager.shutdown_registry().len().await, 1);

        for ws in &mut workspaces {
            ws.cleanup().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_same_schema_times_out_while_held() {
        let runtime = FakeRuntime::new();
        let manager = WorkspaceManager::new(runtime.connector());

        let mut first = manager.create(options("ws_shared")).await.unwrap();

        let err = manager.create(options("ws_shared")).await.unwrap_err();
        assert!(matches!(
            err,
            WorkspaceError::LockAcquire { ref container, ref schema, .. }
                if container == "skeema-mysql-8.0" && schema == "ws_shared"
        ));
        assert!(err.to_string().contains("timed out"));

        first.cleanup().await.unwrap();
        let mut second = manager.create(options("ws_shared")).await.unwrap();
        second.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_same_schema_waits_for_release() {
        let runtime = FakeRuntime::new();
        let manager = Arc::new(WorkspaceManager::new(runtime.connector()));

        let mut first = manager.create(options("ws_shared")).await.unwrap();

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .create(options("ws_shared").with_lock_wait_timeout(Duration::from_secs(5)))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        first.cleanup().await.unwrap();
        let mut second = waiter.await.unwrap().unwrap();
        assert!(runtime
            .instance("skeema-mysql-8.0")
            .unwrap()
            .lock_held("skeema.ws_shared"));
        second.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_distinct_schemas_provision_in_parallel() {
        let runtime = FakeRuntime::new();
        let manager = WorkspaceManager::new(runtime.connector());

        let mut a = manager.create(options("ws_a")).await.unwrap();
        let mut b = manager.create(options("ws_b")).await.unwrap();

        let instance = runtime.instance("skeema-mysql-8.0").unwrap();
        assert!(instance.lock_held("skeema.ws_a"));
        assert!(instance.lock_held("skeema.ws_b"));

        a.cleanup().await.unwrap();
        b.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_twice_fails_distinctly() {
        let runtime = FakeRuntime::new();
        let manager = WorkspaceManager::new(runtime.connector());

        let mut ws = manager.create(options("ws_a")).await.unwrap();
        ws.cleanup().await.unwrap();
        assert!(ws.is_cleaned_up());

        let err = ws.cleanup().await.unwrap_err();
        assert!(err.is_already_cleaned_up());

        let instance = runtime.instance("skeema-mysql-8.0").unwrap();
        assert_eq!(instance.lock_releases(), 1);
        assert!(!instance.lock_held("skeema.ws_a"));
        assert!(!instance.schema_exists("ws_a"));
    }

    #[tokio::test]
    async fn test_create_schema_failure_releases_lock() {
        let runtime = FakeRuntime::new();
        let instance = runtime.preload("skeema-mysql-8.0", "mysql:8.0");
        instance.fail_create_schema(true);
        let manager = WorkspaceManager::new(runtime.connector());

        let err = manager.create(options("ws_a")).await.unwrap_err();
        assert!(matches!(err, WorkspaceError::CreateSchema { ref schema, .. } if schema == "ws_a"));
        assert!(!instance.lock_held("skeema.ws_a"));
        assert_eq!(instance.lock_releases(), 1);

        instance.fail_create_schema(false);
        let started = tokio::time::Instant::now();
        let mut ws = manager
            .create(options("ws_a").with_lock_wait_timeout(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        ws.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_create_frees_lock() {
        let runtime = FakeRuntime::new();
        let instance = runtime.preload("skeema-mysql-8.0", "mysql:8.0");
        instance.delay_create_schema(Duration::from_secs(30));
        let manager = WorkspaceManager::new(runtime.connector());

        let mut create = Box::pin(manager.create(options("ws_a")));
        let attempt = tokio::time::timeout(Duration::from_millis(100), &mut create).await;
        assert!(attempt.is_err());
        assert!(instance.lock_held("skeema.ws_a"));

        drop(create);
        assert!(!instance.lock_held("skeema.ws_a"));
        // Freed by dropping the lock, not by an explicit release
        assert_eq!(instance.lock_releases(), 0);

        instance.delay_create_schema(Duration::ZERO);
        let started = tokio::time::Instant::now();
        let mut ws = manager
            .create(options("ws_a").with_lock_wait_timeout(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        ws.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_workspace_frees_lock() {
        let runtime = FakeRuntime::new();
        let manager = WorkspaceManager::new(runtime.connector());

        let ws = manager.create(options("ws_a")).await.unwrap();
        let instance = runtime.instance("skeema-mysql-8.0").unwrap();
        assert!(instance.lock_held("skeema.ws_a"));

        drop(ws);
        assert!(!instance.lock_held("skeema.ws_a"));
        // The schema is left behind; the next create reuses it
        assert!(instance.schema_exists("ws_a"));

        let started = tokio::time::Instant::now();
        let mut ws = manager
            .create(options("ws_a").with_lock_wait_timeout(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        ws.cleanup().await.unwrap();
        assert!(!instance.schema_exists("ws_a"));
    }

    #[tokio::test]
    async fn test_schema_check_failure_releases_lock() {
        let runtime = FakeRuntime::new();
        let instance = runtime.preload("skeema-mysql-8.0", "mysql:8.0");
        instance.fail_has_schema(true);
        let manager = WorkspaceManager::new(runtime.connector());

        let err = manager.create(options("ws_a")).await.unwrap_err();
        assert!(matches!(err, WorkspaceError::SchemaCheck { .. }));
        assert!(!instance.lock_held("skeema.ws_a"));
    }

    #[tokio::test]
    async fn test_existing_schema_with_empty_tables_is_reused() {
        let runtime = FakeRuntime::new();
        let instance = runtime.preload("skeema-mysql-8.0", "mysql:8.0");
        instance.add_table("ws_a", "leftover", 0);
        instance.add_table("ws_a", "other", 0);
        let manager = WorkspaceManager::new(runtime.connector());

        let mut ws = manager.create(options("ws_a")).await.unwrap();
        assert!(instance.schema_exists("ws_a"));
        assert_eq!(instance.tables("ws_a"), Vec::<String>::new());
        ws.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_existing_schema_with_rows_is_not_touched() {
        let runtime = FakeRuntime::new();
        let instance = runtime.preload("skeema-mysql-8.0", "mysql:8.0");
        instance.add_table("ws_a", "empty", 0);
        instance.add_table("ws_a", "precious", 3);
        let manager = WorkspaceManager::new(runtime.connector());

        let err = manager.create(options("ws_a")).await.unwrap_err();
        assert!(matches!(err, WorkspaceError::DropTables { .. }));
        assert!(err.to_string().contains("precious"));

        assert_eq!(instance.tables("ws_a"), vec!["empty", "precious"]);
        assert_eq!(instance.rows("ws_a", "precious"), Some(3));
        assert!(!instance.lock_held("skeema.ws_a"));
    }

    #[tokio::test]
    async fn test_cleanup_with_rows_keeps_schema_and_lock() {
        let runtime = FakeRuntime::new();
        let manager = WorkspaceManager::new(runtime.connector());

        let mut ws = manager.create(options("ws_a")).await.unwrap();
        let instance = runtime.instance("skeema-mysql-8.0").unwrap();
        instance.add_table("ws_a", "t1", 1);

        let err = ws.cleanup().await.unwrap_err();
        assert!(matches!(err, WorkspaceError::DropSchema { .. }));
        assert!(!ws.is_cleaned_up());
        assert!(instance.schema_exists("ws_a"));
        assert!(instance.lock_held("skeema.ws_a"));

        instance.set_rows("ws_a", "t1", 0);
        ws.cleanup().await.unwrap();
        assert!(!instance.schema_exists("ws_a"));
        assert!(!instance.lock_held("skeema.ws_a"));
    }

    #[tokio::test]
    async fn test_handle_passthrough_operations() {
        let runtime = FakeRuntime::new();
        let manager = WorkspaceManager::new(runtime.connector());

        let mut ws = manager.create(options("ws_a")).await.unwrap();
        let instance = runtime.instance("skeema-mysql-8.0").unwrap();
        instance.add_table("ws_a", "widgets", 0);

        let _pool = ws.connection_pool("innodb_strict_mode=1").await.unwrap();
        assert_eq!(
            instance.connect_calls(),
            vec![("ws_a".to_string(), "innodb_strict_mode=1".to_string())]
        );

        let schema = ws.introspect_schema().await.unwrap();
        assert_eq!(schema.name, "ws_a");
        assert!(schema.table("widgets").is_some());

        ws.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_respects_prefix() {
        let runtime = FakeRuntime::new();
        let manager = WorkspaceManager::new(runtime.connector());

        let mut ws = manager
            .create(options("ws_a").with_cleanup_action(CleanupAction::Stop))
            .await
            .unwrap();
        ws.cleanup().await.unwrap();
        let instance = runtime.instance("skeema-mysql-8.0").unwrap();

        assert_eq!(manager.shutdown(&ShutdownArgs::with_prefix("other-")).await, 0);
        assert_eq!(instance.stops(), 0);
        assert!(manager.registry().contains("skeema-mysql-8.0").await);

        assert_eq!(manager.shutdown(&ShutdownArgs::with_prefix("skeema-")).await, 1);
        assert_eq!(instance.stops(), 1);
        assert_eq!(instance.destroys(), 0);
        assert!(manager.registry().is_empty().await);

        assert_eq!(manager.shutdown(&ShutdownArgs::default()).await, 0);
        assert_eq!(instance.stops(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_with_active_workspace() {
        let runtime = FakeRuntime::new();
        let manager = WorkspaceManager::new(runtime.connector());

        let mut ws = manager
            .create(options("ws_a").with_cleanup_action(CleanupAction::None))
            .await
            .unwrap();

        assert_eq!(manager.shutdown(&ShutdownArgs::default()).await, 1);
        let instance = runtime.instance("skeema-mysql-8.0").unwrap();
        assert_eq!(instance.stops(), 0);
        assert_eq!(instance.destroys(), 0);
        assert!(manager.registry().is_empty().await);

        // The handle still works against the container it was given
        ws.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_end_to_end_destroy_on_shutdown() {
        let runtime = FakeRuntime::new();
        let manager = WorkspaceManager::new(runtime.connector());

        let opts = WorkspaceOptions::new("ws_test1", "mysql:8.0".parse().unwrap())
            .with_cleanup_action(CleanupAction::Destroy);
        let mut ws = manager.create(opts).await.unwrap();
        assert_eq!(ws.container_name(), "skeema-mysql-8.0");

        let instance = runtime.instance("skeema-mysql-8.0").unwrap();
        assert!(instance.schema_exists("ws_test1"));
        instance.add_table("ws_test1", "accounts", 0);

        ws.cleanup().await.unwrap();
        assert!(!instance.schema_exists("ws_test1"));
        assert!(!instance.lock_held("skeema.ws_test1"));
        assert_eq!(instance.destroys(), 0);
        assert!(manager.registry().contains("skeema-mysql-8.0").await);

        assert_eq!(manager.shutdown(&ShutdownArgs::default()).await, 1);
        assert_eq!(instance.destroys(), 1);
        assert!(!manager.registry().contains("skeema-mysql-8.0").await);
    }

    #[tokio::test]
    async fn test_container_reused_after_shutdown() {
        let runtime = FakeRuntime::new();
        let manager = WorkspaceManager::new(runtime.connector());

        let mut ws = manager.create(options("ws_a")).await.unwrap();
        ws.cleanup().await.unwrap();
        manager.shutdown(&ShutdownArgs::default()).await;

        let mut ws = manager.create(options("ws_a")).await.unwrap();
        ws.cleanup().await.unwrap();
        assert_eq!(runtime.creations(), 2);
        assert_eq!(manager.shutdown_registry().len().await, 1);
    }
}
