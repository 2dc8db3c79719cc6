//! Docker-backed database containers

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, HostConfig, PortBinding};
use bollard::Docker;
use futures::TryStreamExt;
use sqlx::MySqlPool;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{ContainerRuntime, DbInstance, InstanceOptions, MySqlInstance, RuntimeConnector};
use crate::lock::SchemaLock;
use crate::models::SchemaDescription;

const MYSQL_PORT: &str = "3306/tcp";

/// Seconds Docker waits for a graceful stop before killing the container
const STOP_TIMEOUT_SECS: i64 = 10;

/// Builds a [`DockerRuntime`] the first time a container is needed
#[derive(Debug, Clone)]
pub struct DockerConnector {
    /// Docker socket path; local defaults when unset
    pub socket: Option<String>,
    /// How long to wait for MySQL to accept connections in a new container
    pub ready_timeout: Duration,
}

impl DockerConnector {
    pub fn new(socket: Option<String>, ready_timeout: Duration) -> Self {
        Self {
            socket,
            ready_timeout,
        }
    }
}

#[async_trait]
impl RuntimeConnector for DockerConnector {
    async fn connect(&self) -> Result<Arc<dyn ContainerRuntime>> {
        let docker = match &self.socket {
            Some(path) => Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION),
            None => Docker::connect_with_local_defaults(),
        }
        .context("Failed to create Docker client")?;

        let version = docker
            .version()
            .await
            .context("Docker daemon is not reachable")?;
        info!(
            docker_version = %version.version.unwrap_or_default(),
            "Docker client initialized"
        );

        Ok(Arc::new(DockerRuntime::new(docker, self.ready_timeout)))
    }
}

/// Finds or creates MySQL containers through the Docker API
pub struct DockerRuntime {
    docker: Docker,
    ready_timeout: Duration,
}

impl DockerRuntime {
    pub fn new(docker: Docker, ready_timeout: Duration) -> Self {
        Self {
            docker,
            ready_timeout,
        }
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerInspectResponse>> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => Ok(Some(info)),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to inspect container {}", name)),
        }
    }

    /// Pull `image` unless it is already present locally
    async fn ensure_image(&self, image: &str) -> Result<()> {
        match self.docker.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(e).with_context(|| format!("Failed to inspect image {}", image)),
        }

        info!(image = %image, "Pulling image");
        self.docker
            .create_image(
                Some(CreateImageOptions {
                    from_image: image.to_string(),
                    ..Default::default()
                }),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await
            .with_context(|| format!("Failed to pull image {}", image))?;
        Ok(())
    }

    async fn create_container(&self, opts: &InstanceOptions) -> Result<()> {
        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(MYSQL_PORT.to_string(), HashMap::new());

        // Empty host port lets Docker choose a free one
        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            MYSQL_PORT.to_string(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some(String::new()),
            }]),
        );

        let config = Config {
            image: Some(opts.image.clone()),
            env: Some(container_env(&opts.root_password)),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        };

        debug!(container = %opts.name, image = %opts.image, "Creating container");
        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: opts.name.clone(),
                    ..Default::default()
                }),
                config,
            )
            .await
            .with_context(|| format!("Failed to create container {}", opts.name))?;
        Ok(())
    }

    async fn wait_until_ready(&self, name: &str, mysql: &MySqlInstance) -> Result<()> {
        let deadline = Instant::now() + self.ready_timeout;
        loop {
            match mysql.ping().await {
                Ok(()) => return Ok(()),
                Err(e) if Instant::now() < deadline => {
                    debug!(container = %name, error = %e, "Waiting for MySQL to accept connections");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!(
                            "MySQL in container {} not ready after {:?}",
                            name, self.ready_timeout
                        )
                    })
                }
            }
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn find_or_create(&self, opts: &InstanceOptions) -> Result<Arc<dyn DbInstance>> {
        let existing = self.inspect(&opts.name).await?;
        if let Some(info) = &existing {
            let image = info.config.as_ref().and_then(|c| c.image.as_deref());
            if image != Some(opts.image.as_str()) {
                anyhow::bail!(
                    "container {} is based on image {} instead of {}",
                    opts.name,
                    image.unwrap_or("unknown"),
                    opts.image
                );
            }
        } else {
            self.ensure_image(&opts.image).await?;
            self.create_container(opts).await?;
        }

        let running = existing
            .as_ref()
            .and_then(|info| info.state.as_ref())
            .and_then(|state| state.running)
            .unwrap_or(false);
        if !running {
            debug!(container = %opts.name, "Starting container");
            self.docker
                .start_container(&opts.name, None::<StartContainerOptions<String>>)
                .await
                .with_context(|| format!("Failed to start container {}", opts.name))?;
        }

        let info = self
            .inspect(&opts.name)
            .await?
            .with_context(|| format!("container {} disappeared after start", opts.name))?;
        let port = host_port(&info)
            .with_context(|| format!("container {} has no published MySQL port", opts.name))?;

        let mysql = MySqlInstance::new(
            "127.0.0.1",
            port,
            "root",
            &opts.root_password,
            &opts.default_conn_params,
        )?;
        self.wait_until_ready(&opts.name, &mysql).await?;

        Ok(Arc::new(DockerizedInstance {
            docker: self.docker.clone(),
            name: opts.name.clone(),
            image: opts.image.clone(),
            mysql,
        }))
    }
}

/// A MySQL server running in a Docker container
pub struct DockerizedInstance {
    docker: Docker,
    name: String,
    image: String,
    mysql: MySqlInstance,
}

#[async_trait]
impl DbInstance for DockerizedInstance {
    fn name(&self) -> &str {
        &self.name
    }

    fn image(&self) -> &str {
        &self.image
    }

    async fn has_schema(&self, schema: &str) -> Result<bool> {
        self.mysql.has_schema(schema).await
    }

    async fn drop_tables_in_schema(&self, schema: &str, only_if_empty: bool) -> Result<()> {
        self.mysql.drop_tables_in_schema(schema, only_if_empty).await
    }

    async fn create_schema(&self, schema: &str, charset: &str, collation: &str) -> Result<()> {
        self.mysql.create_schema(schema, charset, collation).await
    }

    async fn drop_schema(&self, schema: &str, only_if_empty: bool) -> Result<()> {
        self.mysql.drop_schema(schema, only_if_empty).await
    }

    async fn schema(&self, schema: &str) -> Result<SchemaDescription> {
        self.mysql.schema(schema).await
    }

    async fn connect(&self, schema: &str, params: &str) -> Result<MySqlPool> {
        self.mysql.connect(schema, params)
    }

    async fn lock(&self, name: &str, timeout: Duration) -> Result<Box<dyn SchemaLock>> {
        self.mysql.lock(name, timeout).await
    }

    async fn stop(&self) -> Result<()> {
        match self
            .docker
            .stop_container(&self.name, Some(StopContainerOptions { t: STOP_TIMEOUT_SECS }))
            .await
        {
            Ok(()) => Ok(()),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                warn!(container = %self.name, "Container not found while stopping");
                Ok(())
            }
            // Already stopped
            Err(DockerError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to stop container {}", self.name)),
        }
    }

    async fn destroy(&self) -> Result<()> {
        match self
            .docker
            .remove_container(
                &self.name,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                warn!(container = %self.name, "Container not found while destroying");
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("Failed to destroy container {}", self.name)),
        }
    }
}

fn container_env(root_password: &str) -> Vec<String> {
    if root_password.is_empty() {
        vec!["MYSQL_ALLOW_EMPTY_PASSWORD=1".to_string()]
    } else {
        vec![format!("MYSQL_ROOT_PASSWORD={}", root_password)]
    }
}

/// Host port published for the container's MySQL port
fn host_port(info: &ContainerInspectResponse) -> Option<u16> {
    info.network_settings
        .as_ref()?
        .ports
        .as_ref()?
        .get(MYSQL_PORT)?
        .as_ref()?
        .iter()
        .find_map(|binding| binding.host_port.as_deref()?.parse().ok())
}
