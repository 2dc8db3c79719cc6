//! Data models for workspace provisioning

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Matches image references such as `mysql:8.0`, `percona:5.7.44` or
/// `mariadb:10.11`.
static FLAVOR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(mysql|percona|mariadb):(\d+)\.(\d+)(?:\.(\d+))?$").expect("valid flavor regex")
});

/// Error returned when a flavor or cleanup action string cannot be parsed
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ParseError(String);

/// Database server vendor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vendor {
    MySQL,
    Percona,
    MariaDB,
}

impl Vendor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Vendor::MySQL => "mysql",
            Vendor::Percona => "percona",
            Vendor::MariaDB => "mariadb",
        }
    }
}

/// A database vendor and version, which doubles as the container image
/// reference used to run it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Flavor {
    pub vendor: Vendor,
    pub major: u32,
    pub minor: u32,
    pub patch: Option<u32>,
}

impl Flavor {
    pub fn new(vendor: Vendor, major: u32, minor: u32) -> Self {
        Self {
            vendor,
            major,
            minor,
            patch: None,
        }
    }

    /// Whether workspaces can be provisioned on this flavor
    pub fn supported(&self) -> bool {
        match self.vendor {
            Vendor::MySQL => matches!((self.major, self.minor), (5, 5..=7) | (8, _) | (9, _)),
            Vendor::Percona => matches!((self.major, self.minor), (5, 5..=7) | (8, _)),
            Vendor::MariaDB => (self.major == 10 && self.minor >= 1) || self.major == 11,
        }
    }

    /// Container image reference for this flavor
    pub fn image(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Flavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}.{}", self.vendor.as_str(), self.major, self.minor)?;
        if let Some(patch) = self.patch {
            write!(f, ".{}", patch)?;
        }
        Ok(())
    }
}

impl FromStr for Flavor {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = FLAVOR_RE
            .captures(s.trim())
            .ok_or_else(|| ParseError(format!("unrecognized flavor \"{}\"", s)))?;

        let vendor = match &caps[1] {
            "mysql" => Vendor::MySQL,
            "percona" => Vendor::Percona,
            _ => Vendor::MariaDB,
        };
        let number = |i: usize| -> Result<u32, ParseError> {
            caps[i]
                .parse()
                .map_err(|_| ParseError(format!("version component out of range in \"{}\"", s)))
        };

        Ok(Self {
            vendor,
            major: number(2)?,
            minor: number(3)?,
            patch: caps.get(4).map(|_| number(4)).transpose()?,
        })
    }
}

impl TryFrom<String> for Flavor {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Flavor> for String {
    fn from(flavor: Flavor) -> Self {
        flavor.to_string()
    }
}

/// What happens to a container when the process shuts down. Individual
/// workspace cleanup never touches the container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupAction {
    /// Leave the container running
    #[default]
    None,
    /// Stop the container
    Stop,
    /// Stop and remove the container
    Destroy,
}

impl CleanupAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CleanupAction::None => "none",
            CleanupAction::Stop => "stop",
            CleanupAction::Destroy => "destroy",
        }
    }
}

impl fmt::Display for CleanupAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CleanupAction {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "" => Ok(CleanupAction::None),
            "stop" => Ok(CleanupAction::Stop),
            "destroy" => Ok(CleanupAction::Destroy),
            other => Err(ParseError(format!(
                "unknown cleanup action \"{}\" (expected none, stop or destroy)",
                other
            ))),
        }
    }
}

/// Request options for a single workspace
#[derive(Debug, Clone)]
pub struct WorkspaceOptions {
    /// Name of the temporary schema; must be unique among concurrent users
    pub schema_name: String,

    /// Container to use; derived from the flavor when absent
    pub container_name: Option<String>,

    /// Database vendor and version (also the image reference)
    pub flavor: Flavor,

    /// Root password for a newly created container
    pub root_password: String,

    /// Connection parameters applied to every connection to the container
    pub default_conn_params: String,

    /// Character set for a freshly created schema
    pub default_character_set: String,

    /// Collation for a freshly created schema (empty for server default)
    pub default_collation: String,

    /// How long to wait for the per-schema lock
    pub lock_wait_timeout: Duration,

    /// Disposition of the container at process shutdown
    pub cleanup_action: CleanupAction,
}

impl WorkspaceOptions {
    pub fn new(schema_name: impl Into<String>, flavor: Flavor) -> Self {
        Self {
            schema_name: schema_name.into(),
            container_name: None,
            flavor,
            root_password: String::new(),
            default_conn_params: String::new(),
            default_character_set: "utf8mb4".to_string(),
            default_collation: String::new(),
            lock_wait_timeout: Duration::from_secs(30),
            cleanup_action: CleanupAction::None,
        }
    }

    pub fn with_container_name(mut self, name: impl Into<String>) -> Self {
        self.container_name = Some(name.into());
        self
    }

    pub fn with_root_password(mut self, password: impl Into<String>) -> Self {
        self.root_password = password.into();
        self
    }

    pub fn with_conn_params(mut self, params: impl Into<String>) -> Self {
        self.default_conn_params = params.into();
        self
    }

    pub fn with_charset(mut self, charset: impl Into<String>, collation: impl Into<String>) -> Self {
        self.default_character_set = charset.into();
        self.default_collation = collation.into();
        self
    }

    pub fn with_lock_wait_timeout(mut self, timeout: Duration) -> Self {
        self.lock_wait_timeout = timeout;
        self
    }

    pub fn with_cleanup_action(mut self, action: CleanupAction) -> Self {
        self.cleanup_action = action;
        self
    }
}

/// Structure of one table as reported by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescription {
    pub name: String,
    pub create_statement: String,
}

/// Introspected structure of a workspace schema
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDescription {
    pub name: String,
    pub character_set: String,
    pub collation: String,
    /// Tables sorted by name
    pub tables: Vec<TableDescription>,
}

impl SchemaDescription {
    pub fn table(&self, name: &str) -> Option<&TableDescription> {
        self.tables.iter().find(|t| t.name == name)
    }
}
