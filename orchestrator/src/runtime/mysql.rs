//! Schema operations against a MySQL-compatible server

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlPool, MySqlPoolOptions};
use sqlx::{Connection, Executor, Row};
use tracing::debug;

use crate::lock::{MySqlLock, SchemaLock};
use crate::models::{SchemaDescription, TableDescription};

/// Maximum connections in a pool handed out for a workspace schema
const WORKSPACE_POOL_SIZE: u32 = 8;

/// Connection parameters understood by the driver itself; every other
/// parameter becomes a session variable.
const DRIVER_PARAMS: &[&str] = &["charset", "collation"];

/// Connection to a MySQL server, used for schema management on behalf of
/// workspaces. Holds root credentials; no default database.
#[derive(Debug, Clone)]
pub struct MySqlInstance {
    options: MySqlConnectOptions,
    default_params: Vec<(String, String)>,
    pool: MySqlPool,
}

impl MySqlInstance {
    pub fn new(
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        default_params: &str,
    ) -> Result<Self> {
        let options = MySqlConnectOptions::new()
            .host(host)
            .port(port)
            .username(user)
            .password(password);
        let default_params = parse_params(default_params)?;
        let pool = build_pool(options.clone(), &default_params, 2);

        Ok(Self {
            options,
            default_params,
            pool,
        })
    }

    /// Open and close a single connection, failing if the server is not
    /// accepting connections yet
    pub async fn ping(&self) -> Result<()> {
        let mut conn = MySqlConnection::connect_with(&self.options).await?;
        conn.ping().await?;
        conn.close().await?;
        Ok(())
    }

    pub async fn has_schema(&self, schema: &str) -> Result<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM information_schema.schemata WHERE schema_name = ?")
                .bind(schema)
                .fetch_one(&self.pool)
                .await
                .context("Failed to query information_schema.schemata")?;
        Ok(count > 0)
    }

    pub async fn table_names(&self, schema: &str) -> Result<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT CAST(table_name AS CHAR) FROM information_schema.tables \
             WHERE table_schema = ? AND table_type = 'BASE TABLE' ORDER BY 1",
        )
        .bind(schema)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query information_schema.tables")?;
        Ok(names)
    }

    async fn table_has_rows(&self, schema: &str, table: &str) -> Result<bool> {
        let sql = format!(
            "SELECT 1 FROM {}.{} LIMIT 1",
            escape_identifier(schema),
            escape_identifier(table)
        );
        let row = sqlx::query(&sql)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to check rows in {}.{}", schema, table))?;
        Ok(row.is_some())
    }

    /// Fails if any of `tables` holds a row. This is a point-in-time check:
    /// a concurrent writer can still insert a row before a following drop.
    async fn ensure_tables_empty(&self, schema: &str, tables: &[String]) -> Result<()> {
        for table in tables {
            if self.table_has_rows(schema, table).await? {
                anyhow::bail!("table {}.{} has at least one row", schema, table);
            }
        }
        Ok(())
    }

    pub async fn drop_tables_in_schema(&self, schema: &str, only_if_empty: bool) -> Result<()> {
        let tables = self.table_names(schema).await?;
        if tables.is_empty() {
            return Ok(());
        }
        if only_if_empty {
            self.ensure_tables_empty(schema, &tables).await?;
        }

        let list = tables
            .iter()
            .map(|t| format!("{}.{}", escape_identifier(schema), escape_identifier(t)))
            .collect::<Vec<_>>()
            .join(", ");

        let mut conn = self.pool.acquire().await?;
        (&mut *conn).execute("SET foreign_key_checks = 0").await?;
        let dropped = (&mut *conn).execute(format!("DROP TABLE {}", list).as_str()).await;
        (&mut *conn).execute("SET foreign_key_checks = 1").await?;
        dropped.with_context(|| format!("Failed to drop tables in {}", schema))?;

        debug!(schema = %schema, tables = tables.len(), "Dropped tables");
        Ok(())
    }

    pub async fn create_schema(&self, schema: &str, charset: &str, collation: &str) -> Result<()> {
        let mut sql = format!("CREATE DATABASE {}", escape_identifier(schema));
        if !charset.is_empty() {
            ensure_plain_word(charset, "character set")?;
            sql.push_str(&format!(" CHARACTER SET {}", charset));
        }
        if !collation.is_empty() {
            ensure_plain_word(collation, "collation")?;
            sql.push_str(&format!(" COLLATE {}", collation));
        }

        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to create schema {}", schema))?;
        Ok(())
    }

    pub async fn drop_schema(&self, schema: &str, only_if_empty: bool) -> Result<()> {
        if only_if_empty {
            let tables = self.table_names(schema).await?;
            self.ensure_tables_empty(schema, &tables).await?;
        }

        let mut conn = self.pool.acquire().await?;
        (&mut *conn).execute("SET foreign_key_checks = 0").await?;
        let dropped = (&mut *conn)
            .execute(format!("DROP DATABASE IF EXISTS {}", escape_identifier(schema)).as_str())
            .await;
        (&mut *conn).execute("SET foreign_key_checks = 1").await?;
        dropped.with_context(|| format!("Failed to drop schema {}", schema))?;
        Ok(())
    }

    pub async fn schema(&self, schema: &str) -> Result<SchemaDescription> {
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT CAST(default_character_set_name AS CHAR), CAST(default_collation_name AS CHAR) \
             FROM information_schema.schemata WHERE schema_name = ?",
        )
        .bind(schema)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query information_schema.schemata")?;

        let (character_set, collation) =
            row.ok_or_else(|| anyhow::anyhow!("schema {} does not exist", schema))?;

        let mut tables = Vec::new();
        for name in self.table_names(schema).await? {
            let sql = format!(
                "SHOW CREATE TABLE {}.{}",
                escape_identifier(schema),
                escape_identifier(&name)
            );
            let row = sqlx::query(&sql)
                .fetch_one(&self.pool)
                .await
                .with_context(|| format!("Failed to show create table {}.{}", schema, name))?;
            let create_statement: String = row.try_get(1)?;
            tables.push(TableDescription {
                name,
                create_statement,
            });
        }

        Ok(SchemaDescription {
            name: schema.to_string(),
            character_set,
            collation,
            tables,
        })
    }

    /// Lazily connecting pool with `schema` as its default database
    pub fn connect(&self, schema: &str, params: &str) -> Result<MySqlPool> {
        let params = merge_params(&self.default_params, parse_params(params)?);
        Ok(build_pool(
            self.options.clone().database(schema),
            &params,
            WORKSPACE_POOL_SIZE,
        ))
    }

    pub async fn lock(&self, name: &str, timeout: Duration) -> Result<Box<dyn SchemaLock>> {
        let lock = MySqlLock::acquire(&self.options, name, timeout).await?;
        Ok(Box::new(lock))
    }
}

fn build_pool(
    mut options: MySqlConnectOptions,
    params: &[(String, String)],
    max_connections: u32,
) -> MySqlPool {
    for (key, value) in params {
        match key.as_str() {
            "charset" => options = options.charset(value),
            "collation" => options = options.collation(value),
            _ => {}
        }
    }

    let mut pool_options = MySqlPoolOptions::new().max_connections(max_connections);
    if let Some(stmt) = session_statement(params) {
        let stmt = Arc::new(stmt);
        pool_options = pool_options.after_connect(move |conn, _meta| {
            let stmt = stmt.clone();
            Box::pin(async move {
                conn.execute(stmt.as_str()).await?;
                Ok(())
            })
        });
    }
    pool_options.connect_lazy_with(options)
}

/// Parse `key=value&key=value` connection parameters.
///
/// Keys must be plain session variable names because they end up in a
/// `SET SESSION` statement. Values are taken as written: no URL decoding, so
/// a string value carries its own SQL quotes (`sql_mode='ANSI'`).
pub(crate) fn parse_params(params: &str) -> Result<Vec<(String, String)>> {
    let mut parsed = Vec::new();
    for pair in params.split('&').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("connection parameter \"{}\" is missing a value", pair))?;
        ensure_plain_word(key, "connection parameter name")?;
        parsed.push((key.to_string(), value.to_string()));
    }
    Ok(parsed)
}

/// Later parameters override earlier ones with the same key
pub(crate) fn merge_params(
    defaults: &[(String, String)],
    extra: Vec<(String, String)>,
) -> Vec<(String, String)> {
    let mut merged: Vec<(String, String)> = defaults
        .iter()
        .filter(|(k, _)| !extra.iter().any(|(ek, _)| ek == k))
        .cloned()
        .collect();
    merged.extend(extra);
    merged
}

/// `SET SESSION` statement for parameters the driver doesn't handle itself
pub(crate) fn session_statement(params: &[(String, String)]) -> Option<String> {
    let assignments: Vec<String> = params
        .iter()
        .filter(|(k, _)| !DRIVER_PARAMS.contains(&k.as_str()))
        .map(|(k, v)| format!("{} = {}", k, v))
        .collect();

    if assignments.is_empty() {
        None
    } else {
        Some(format!("SET SESSION {}", assignments.join(", ")))
    }
}

pub(crate) fn escape_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

fn ensure_plain_word(value: &str, what: &str) -> Result<()> {
    if value.is_empty() || !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        anyhow::bail!("invalid {} \"{}\"", what, value);
    }
    Ok(())
}
