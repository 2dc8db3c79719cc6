//! Advisory locks scoped to a database instance
//!
//! A lock serializes use of one schema name across every process sharing a
//! container. The MySQL implementation uses `GET_LOCK()`, which ties the lock
//! to the session that took it: the lock lives exactly as long as the
//! dedicated connection held by [`MySqlLock`].

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::Connection;
use tracing::debug;

/// MySQL silently refuses lock names longer than this
pub const MAX_LOCK_NAME_LEN: usize = 64;

/// A held advisory lock.
///
/// `release` consumes the lock, so a lock cannot be released twice. Dropping a
/// lock without releasing it must still free it eventually (for MySQL the
/// server does so when the session's connection closes).
#[async_trait]
pub trait SchemaLock: Send + Sync {
    /// Name the lock was acquired under
    fn name(&self) -> &str;

    /// Release the lock
    async fn release(self: Box<Self>) -> Result<()>;
}

/// Lock held through a MySQL `GET_LOCK()` session
pub struct MySqlLock {
    name: String,
    conn: MySqlConnection,
}

impl MySqlLock {
    /// Open a dedicated session and wait up to `timeout` for the named lock
    pub async fn acquire(
        options: &MySqlConnectOptions,
        name: &str,
        timeout: Duration,
    ) -> Result<Self> {
        if name.len() > MAX_LOCK_NAME_LEN {
            anyhow::bail!(
                "lock name {} exceeds {} characters",
                name,
                MAX_LOCK_NAME_LEN
            );
        }

        let mut conn = MySqlConnection::connect_with(options)
            .await
            .context("Failed to open lock session")?;

        // GET_LOCK only takes whole seconds
        let wait_secs = (timeout.as_millis() as u64).div_ceil(1000);

        let acquired: Option<i64> = sqlx::query_scalar("SELECT GET_LOCK(?, ?)")
            .bind(name)
            .bind(wait_secs)
            .fetch_one(&mut conn)
            .await
            .with_context(|| format!("GET_LOCK failed for {}", name))?;

        match acquired {
            Some(1) => {
                debug!(lock = %name, "Advisory lock acquired");
                Ok(Self {
                    name: name.to_string(),
                    conn,
                })
            }
            Some(_) => {
                let _ = conn.close().await;
                anyhow::bail!("timed out after {:?} waiting for lock {}", timeout, name)
            }
            None => {
                let _ = conn.close().await;
                anyhow::bail!("error obtaining lock {}", name)
            }
        }
    }
}

#[async_trait]
impl SchemaLock for MySqlLock {
    fn name(&self) -> &str {
        &self.name
    }

    async fn release(self: Box<Self>) -> Result<()> {
        let MySqlLock { name, mut conn } = *self;

        let released: Option<i64> = sqlx::query_scalar("SELECT RELEASE_LOCK(?)")
            .bind(&name)
            .fetch_one(&mut conn)
            .await
            .with_context(|| format!("RELEASE_LOCK failed for {}", name))?;

        conn.close().await.context("Failed to close lock session")?;

        if released != Some(1) {
            anyhow::bail!("lock {} was not held by this session", name);
        }

        debug!(lock = %name, "Advisory lock released");
        Ok(())
    }
}
