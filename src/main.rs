//! PostgreSQL backup/restore orchestrator
//!
//! Drives pg_dump, pg_dumpall, pg_basebackup, psql and pg_restore from a
//! single config.json.

// pgvault/src/main.rs
mod backup;
mod catalog;
mod config;
mod engine;
mod errors;
mod restore;
#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use config::{AppConfig, OperationConfig, load_backup_config_from_json, load_restore_config_from_json};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CONFIG_PATH: &str = "config.json";

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_level(true)
                .with_target(false),
        )
        .init();

    tokio::select! {
        result = run_app() => match result {
            Ok(()) => {
                info!("✅ Operation completed successfully.");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("❌ {:#}", e);
                ExitCode::FAILURE
            }
        },
        _ = tokio::signal::ctrl_c() => {
            // Dropping the flow kills any running client tool.
            warn!("Interrupted; the current operation was abandoned and may need clean_first on the next run");
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let choice = match args.first() {
        Some(command) => command.trim().to_string(),
        None => prompt_choice()?,
    };
    let config_path = PathBuf::from(args.get(1).map(String::as_str).unwrap_or(DEFAULT_CONFIG_PATH));

    let mut app_config = AppConfig::load_from_json(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;
    let spaces_is_configured = app_config.spaces_config.is_some();

    match choice.as_str() {
        "1" | "backup" => {
            info!("🚀 Starting backup");
            let backup_config = load_backup_config_from_json(&app_config.raw_json_config, spaces_is_configured)
                .context("Failed to load backup configuration from JSON")?;
            app_config.operation = Some(OperationConfig::Backup(backup_config));
            backup::run_backup_flow(&app_config).await.context("Backup process failed")?;
        }
        "2" | "restore" => {
            info!("🔄 Starting restore");
            let restore_config = load_restore_config_from_json(&app_config.raw_json_config, spaces_is_configured)
                .context("Failed to load restore configuration from JSON")?;
            app_config.operation = Some(OperationConfig::Restore(restore_config));
            restore::run_restore_flow(&app_config).await.context("Restore process failed")?;
        }
        "3" | "plan" => {
            let backup_config = load_backup_config_from_json(&app_config.raw_json_config, spaces_is_configured)
                .context("Failed to load backup configuration from JSON")?;
            app_config.operation = Some(OperationConfig::Backup(backup_config));
            backup::run_plan_flow(&app_config).await.context("Planning failed")?;
        }
        "4" | "inspect" => {
            catalog::run_inspect_flow(&app_config).await.context("Inspection failed")?;
        }
        other => {
            anyhow::bail!(
                "Invalid choice '{}'. Use backup, restore, plan or inspect (or 1-4).",
                other
            );
        }
    }
    Ok(())
}

fn prompt_choice() -> Result<String> {
    use std::io::{Write, stdin, stdout};

    println!("Select an operation:");
    println!("1. Take Backup (or type 'backup')");
    println!("2. Restore Backup (or type 'restore')");
    println!("3. Show Backup Plan (or type 'plan')");
    println!("4. Inspect Server (or type 'inspect')");
    print!("Enter your choice: ");
    stdout().flush().context("Failed to flush stdout")?;

    let mut input = String::new();
    stdin().read_line(&mut input).context("Failed to read user input")?;
    Ok(input.trim().to_string())
}
