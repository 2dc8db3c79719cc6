//! Configuration for workspace coordination
//!
//! Supports configuration via:
//! - TOML/YAML config files
//! - Environment variables (with SKEEMA_WS__ prefix)
//! - Command line overrides applied by the caller

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use config::builder::DefaultState;
use config::ConfigBuilder;
use serde::{Deserialize, Serialize};

use crate::models::{CleanupAction, Flavor, WorkspaceOptions};
use crate::workspace::DEFAULT_CONTAINER_PREFIX;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,

    /// Docker socket path; local defaults when unset
    #[serde(default)]
    pub docker_socket: Option<String>,

    /// Prefix for container names derived from the image
    #[serde(default = "default_container_prefix")]
    pub container_prefix: String,

    /// Defaults for new workspaces
    #[serde(default)]
    pub workspace: WorkspaceConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Pretty on a terminal, JSON otherwise
    #[default]
    Auto,
    Pretty,
    Json,
}

/// Workspace defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Database flavor, e.g. `mysql:8.0`
    #[serde(default = "default_flavor")]
    pub flavor: String,

    #[serde(default)]
    pub root_password: String,

    /// Extra session parameters, `key=value` pairs joined by `&`
    #[serde(default)]
    pub default_conn_params: String,

    #[serde(default = "default_character_set")]
    pub default_character_set: String,

    /// Empty for the server default
    #[serde(default)]
    pub default_collation: String,

    #[serde(default = "default_lock_wait_timeout")]
    pub lock_wait_timeout_secs: u64,

    #[serde(default)]
    pub cleanup_action: CleanupAction,

    /// Explicit container name instead of the derived one
    #[serde(default)]
    pub container_name: Option<String>,

    /// How long to wait for a new container to accept connections
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_container_prefix() -> String {
    DEFAULT_CONTAINER_PREFIX.to_string()
}

fn default_flavor() -> String {
    "mysql:8.0".to_string()
}

fn default_character_set() -> String {
    "utf8mb4".to_string()
}

fn default_lock_wait_timeout() -> u64 {
    30
}

fn default_ready_timeout() -> u64 {
    60
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            flavor: default_flavor(),
            root_password: String::new(),
            default_conn_params: String::new(),
            default_character_set: default_character_set(),
            default_collation: String::new(),
            lock_wait_timeout_secs: default_lock_wait_timeout(),
            cleanup_action: CleanupAction::None,
            container_name: None,
            ready_timeout_secs: default_ready_timeout(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Auto,
            docker_socket: None,
            container_prefix: default_container_prefix(),
            workspace: WorkspaceConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default file locations and environment
    /// variables, with `config_file` layered over the defaults when given
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        // Try to load .env file if present
        let _ = dotenvy::dotenv();

        let mut builder = Self::defaults()?
            .add_source(config::File::with_name("config/skeema-workspace").required(false))
            .add_source(config::File::with_name("/etc/skeema-workspace/config").required(false));

        if let Some(path) = config_file {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        // Environment variables win (SKEEMA_WS__ prefix)
        Self::finish(builder.add_source(
            config::Environment::with_prefix("SKEEMA_WS")
                .separator("__")
                .try_parsing(true),
        ))
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>> {
        Ok(config::Config::builder().add_source(config::Config::try_from(&AppConfig::default())?))
    }

    fn finish(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let config = builder.build().context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;
        Ok(app_config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.container_prefix.is_empty() {
            anyhow::bail!("Container prefix cannot be empty");
        }

        if self.workspace.lock_wait_timeout_secs == 0 {
            anyhow::bail!("Lock wait timeout cannot be 0");
        }

        if self.workspace.ready_timeout_secs == 0 {
            anyhow::bail!("Container ready timeout cannot be 0");
        }

        let flavor = self.workspace.flavor()?;
        if !flavor.supported() {
            anyhow::bail!("Flavor {} is not supported", flavor);
        }

        Ok(())
    }
}

impl WorkspaceConfig {
    pub fn flavor(&self) -> Result<Flavor> {
        self.flavor
            .parse()
            .with_context(|| format!("Invalid flavor {:?}", self.flavor))
    }

    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_wait_timeout_secs)
    }

    /// Options for a workspace on `schema_name` using these defaults
    pub fn to_options(&self, schema_name: &str) -> Result<WorkspaceOptions> {
        let mut opts = WorkspaceOptions::new(schema_name, self.flavor()?)
            .with_root_password(self.root_password.clone())
            .with_conn_params(self.default_conn_params.clone())
            .with_charset(
                self.default_character_set.clone(),
                self.default_collation.clone(),
            )
            .with_lock_wait_timeout(self.lock_wait_timeout())
            .with_cleanup_action(self.cleanup_action);

        if let Some(name) = &self.container_name {
            opts = opts.with_container_name(name.clone());
        }
        Ok(opts)
    }
}
