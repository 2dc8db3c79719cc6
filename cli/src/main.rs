//! skeema-ws - Command-line interface for temporary schema workspaces
//!
//! Creates a workspace on a Dockerized database, applies a SQL file to it,
//! reports the resulting schema and tears everything down again.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;
use sqlx::Executor;
use tracing::{debug, warn};

use skeema_workspace::logging::init_logging;
use skeema_workspace::{
    AppConfig, CleanupAction, Flavor, LogFormat, SchemaDescription, ShutdownArgs, Workspace,
    WorkspaceManager,
};

/// Temporary schema workspaces on Dockerized MySQL
#[derive(Parser)]
#[command(name = "skeema-ws")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Provision temporary schemas on shared database containers", long_about = None)]
struct Cli {
    /// Config file layered over the default locations
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format (auto, pretty, json)
    #[arg(long, global = true, value_parser = parse_log_format)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a workspace, apply SQL to it and report the resulting schema
    Run(RunArgs),

    /// Print the effective configuration
    Config,
}

#[derive(Args)]
struct RunArgs {
    /// Temporary schema name
    #[arg(short, long, default_value = "_skeema_tmp")]
    schema: String,

    /// SQL file to apply to the workspace
    #[arg(long)]
    sql: Option<PathBuf>,

    /// Database flavor, e.g. mysql:8.0 (overrides config)
    #[arg(short, long)]
    flavor: Option<Flavor>,

    /// Container name (overrides the name derived from the flavor)
    #[arg(long)]
    container: Option<String>,

    /// What to do with the container on exit: none, stop, destroy
    #[arg(long)]
    cleanup_action: Option<CleanupAction>,

    /// Only shut down containers whose name starts with this prefix
    #[arg(long)]
    shutdown_prefix: Option<String>,

    /// Output format (text, json)
    #[arg(short, long, default_value = "text")]
    output: String,
}

#[derive(Serialize)]
struct RunReport<'a> {
    container: &'a str,
    schema: &'a SchemaDescription,
}

fn parse_log_format(s: &str) -> Result<LogFormat, String> {
    match s.to_lowercase().as_str() {
        "auto" => Ok(LogFormat::Auto),
        "pretty" => Ok(LogFormat::Pretty),
        "json" => Ok(LogFormat::Json),
        other => Err(format!("unknown log format {:?}", other)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    if let Some(format) = cli.log_format {
        config.log_format = format;
    }
    init_logging(&config.log_level, config.log_format)?;

    match cli.command {
        Commands::Run(args) => run(config, args).await,
        Commands::Config => {
            let mut shown = config;
            if !shown.workspace.root_password.is_empty() {
                shown.workspace.root_password = "********".to_string();
            }
            println!("{}", serde_json::to_string_pretty(&shown)?);
            Ok(())
        }
    }
}

async fn run(mut config: AppConfig, args: RunArgs) -> Result<()> {
    if let Some(flavor) = &args.flavor {
        config.workspace.flavor = flavor.to_string();
    }
    if let Some(container) = &args.container {
        config.workspace.container_name = Some(container.clone());
    }
    if let Some(action) = args.cleanup_action {
        config.workspace.cleanup_action = action;
    }
    config.validate()?;

    let manager = WorkspaceManager::from_config(&config);

    let outcome = tokio::select! {
        result = run_workspace(&manager, &config, &args) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, shutting down containers");
            Err(anyhow::anyhow!("interrupted"))
        }
    };

    let shutdown = ShutdownArgs {
        name_prefix: args.shutdown_prefix.clone(),
    };
    let handled = manager.shutdown(&shutdown).await;
    debug!(handled, "Container shutdown complete");

    outcome
}

async fn run_workspace(manager: &WorkspaceManager, config: &AppConfig, args: &RunArgs) -> Result<()> {
    let opts = config.workspace.to_options(&args.schema)?;
    let mut ws = manager.create(opts).await?;

    let described = match &args.sql {
        Some(path) => apply_sql_file(&ws, path).await,
        None => Ok(()),
    };
    let described = match described {
        Ok(()) => ws.introspect_schema().await.map_err(anyhow::Error::from),
        Err(e) => Err(e),
    };

    // Cleanup runs regardless; a failure here must not hide an earlier one
    let cleaned = ws.cleanup().await;
    let schema = match (described, cleaned) {
        (Ok(schema), Ok(())) => schema,
        (Ok(_), Err(e)) => return Err(e.into()),
        (Err(e), cleaned) => {
            if let Err(cleanup_err) = cleaned {
                warn!(error = %cleanup_err, "Workspace cleanup failed");
            }
            return Err(e);
        }
    };

    if args.output == "json" {
        let report = RunReport {
            container: ws.container_name(),
            schema: &schema,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_schema(ws.container_name(), &schema);
    }

    Ok(())
}

async fn apply_sql_file(ws: &Workspace, path: &Path) -> Result<()> {
    let sql = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read SQL file: {}", path.display()))?;

    let pool = ws.connection_pool("").await?;
    for statement in split_statements(&sql) {
        debug!(schema = %ws.schema_name(), statement = %statement, "Applying statement");
        if let Err(e) = pool.execute(statement.as_str()).await {
            pool.close().await;
            return Err(e).with_context(|| format!("Failed to execute: {}", statement));
        }
    }
    pool.close().await;
    Ok(())
}

/// Split a SQL script into statements on `;`.
///
/// Semicolons inside quoted strings, quoted identifiers and comments do not
/// end a statement. Line comments (`-- ` and `#`) are dropped; block
/// comments are kept so `/*! ... */` version hints still reach the server.
fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut chars = sql.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            current.push(c);
            if c == '\\' && q != '`' {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            } else if c == q {
                // A doubled quote is an escaped quote
                if chars.peek() == Some(&q) {
                    current.push(q);
                    chars.next();
                } else {
                    quote = None;
                }
            }
            continue;
        }

        match c {
            '\'' | '"' | '`' => {
                quote = Some(c);
                current.push(c);
            }
            '#' => skip_line(&mut chars),
            '-' if starts_line_comment(&chars) => skip_line(&mut chars),
            '/' if chars.peek() == Some(&'*') => {
                current.push(c);
                current.extend(chars.next());
                let mut prev = '\0';
                for inner in chars.by_ref() {
                    current.push(inner);
                    if prev == '*' && inner == '/' {
                        break;
                    }
                    prev = inner;
                }
            }
            ';' => push_statement(&mut statements, &mut current),
            _ => current.push(c),
        }
    }
    push_statement(&mut statements, &mut current);
    statements
}

/// `--` opens a comment only when followed by whitespace or end of input
fn starts_line_comment(rest: &std::iter::Peekable<std::str::Chars<'_>>) -> bool {
    let mut ahead = rest.clone();
    ahead.next() == Some('-') && ahead.next().map_or(true, char::is_whitespace)
}

fn skip_line(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) {
    for c in chars.by_ref() {
        if c == '\n' {
            break;
        }
    }
}

fn push_statement(statements: &mut Vec<String>, current: &mut String) {
    let statement = current.trim();
    if !statement.is_empty() {
        statements.push(statement.to_string());
    }
    current.clear();
}

fn print_schema(container: &str, schema: &SchemaDescription) {
    println!("{}", "=".repeat(60).bright_blue());
    println!("{} {}", "Container:".bright_cyan(), container);
    println!("{} {}", "Schema:".bright_cyan(), schema.name);
    println!("{} {}", "Character set:".bright_cyan(), schema.character_set);
    println!("{} {}", "Collation:".bright_cyan(), schema.collation);
    println!("{} {}", "Tables:".bright_cyan(), schema.tables.len());

    for table in &schema.tables {
        println!("\n{}", table.name.bright_green().bold());
        println!("{};", table.create_statement);
    }

    println!("{}", "=".repeat(60).bright_blue());
}
