// pgvault/src/backup/mod.rs
pub mod archive;
pub mod artifact;
pub mod export;
pub mod planner;
pub(crate) mod s3_upload;

use anyhow::Context;
use chrono::{DateTime, Local};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::catalog::{CatalogInspector, PgCatalog};
use crate::config::{AppConfig, BackupConfig, ConnectionTarget, OperationConfig};
use crate::engine::{EngineTools, PgClientTools};
use crate::errors::{OrchestratorError, Result};
use crate::restore::target_db::is_protected_database;
use artifact::{BackupArtifact, BackupScope, DumpFormat};
use export::{export_invocation, run_export};
use planner::{ExportMode, plan_export};

/// `<root>/backup_<YYYY-MM-DD_HH_MM_SS>`
pub fn backup_set_dir(root: &Path, at: DateTime<Local>) -> PathBuf {
    root.join(format!("backup_{}", at.format("%Y-%m-%d_%H_%M_%S")))
}

/// Every user database on the server, for configs without a database list.
async fn discover_scopes(catalog: &dyn CatalogInspector) -> Result<Vec<BackupScope>> {
    Ok(catalog
        .list_databases()
        .await?
        .into_iter()
        .filter(|name| !is_protected_database(name))
        .map(BackupScope::SingleDatabase)
        .collect())
}

/// Pairs each scope with its format and puts the globals artifact first
/// when per-database dumps would otherwise miss roles and tablespaces.
pub fn expand_targets(scopes: Vec<BackupScope>, config: &BackupConfig) -> Result<Vec<(BackupScope, DumpFormat)>> {
    if scopes.is_empty() {
        return Err(OrchestratorError::Configuration(
            "Nothing to back up: no user databases found".to_string(),
        ));
    }

    let mut targets = Vec::new();
    let globals_covered = scopes
        .iter()
        .any(|s| matches!(s, BackupScope::AllDatabases | BackupScope::GlobalsOnly));
    let per_database = scopes.iter().any(|s| matches!(s, BackupScope::SingleDatabase(_)));
    if config.options.include_globals && per_database && !globals_covered {
        targets.push((BackupScope::GlobalsOnly, DumpFormat::Plain));
    }
    targets.extend(scopes.into_iter().map(|scope| (scope, config.options.format)));
    Ok(targets)
}

pub async fn resolve_targets(
    catalog: &dyn CatalogInspector,
    config: &BackupConfig,
) -> Result<Vec<(BackupScope, DumpFormat)>> {
    let scopes = match config.explicit_scopes() {
        Some(scopes) => scopes,
        None => discover_scopes(catalog).await?,
    };
    expand_targets(scopes, config)
}

/// Plans every export up front so an invalid combination fails before
/// anything is written.
pub fn plan_backup(targets: &[(BackupScope, DumpFormat)], config: &BackupConfig) -> Result<Vec<ExportMode>> {
    let options = config.options.plan_options();
    let modes = targets
        .iter()
        .map(|(scope, format)| plan_export(scope, *format, &options))
        .collect::<Result<Vec<_>>>()?;

    let mut file_names = HashSet::with_capacity(modes.len());
    for mode in &modes {
        let file_name = mode.artifact_file_name();
        if !file_names.insert(file_name.clone()) {
            return Err(OrchestratorError::Configuration(format!(
                "Two exports would both write {} ({} is listed more than once)",
                file_name,
                mode.scope()
            )));
        }
    }
    Ok(modes)
}

/// Runs a whole backup into a fresh set directory under `config.local_backup_path`.
pub async fn run_backup(
    tools: &dyn EngineTools,
    catalog: &dyn CatalogInspector,
    config: &BackupConfig,
) -> Result<(PathBuf, Vec<BackupArtifact>)> {
    catalog.ping().await?;
    let targets = resolve_targets(catalog, config).await?;
    let modes = plan_backup(&targets, config)?;

    let needs_globals = modes
        .iter()
        .any(|m| matches!(m, ExportMode::GlobalsDump { .. } | ExportMode::ClusterDump { .. }));
    if needs_globals {
        let globals = catalog.snapshot_globals().await?;
        info!(roles = globals.roles.len(), tablespaces = globals.tablespaces.len(), "Captured globals");
        for tablespace in globals.user_tablespaces() {
            warn!(
                tablespace = %tablespace.name,
                location = %tablespace.location,
                "Tablespace directory must exist on the restore target"
            );
        }
    }

    let set_dir = backup_set_dir(&config.local_backup_path, Local::now());
    fs::create_dir_all(&config.local_backup_path)?;
    fs::create_dir(&set_dir)?;
    info!(set = %set_dir.display(), exports = modes.len(), "Starting backup");

    let mut artifacts = Vec::with_capacity(modes.len());
    for mode in &modes {
        artifacts.push(run_export(tools, &config.source, mode, &set_dir).await?);
    }
    Ok((set_dir, artifacts))
}

fn backup_config(app_config: &AppConfig) -> anyhow::Result<&BackupConfig> {
    match &app_config.operation {
        Some(OperationConfig::Backup(cfg)) => Ok(cfg),
        _ => anyhow::bail!("Backup operation selected but no backup configuration found."),
    }
}

async fn connect_source(source: &ConnectionTarget) -> anyhow::Result<PgCatalog> {
    PgCatalog::connect(source)
        .await
        .with_context(|| format!("Failed to connect to {}", source.redacted()))
}

pub async fn run_backup_flow(app_config: &AppConfig) -> anyhow::Result<()> {
    let backup_config = backup_config(app_config)?;
    info!(source = %backup_config.source.redacted(), scope = ?backup_config.options.scope, "Starting backup");

    let spaces = app_config.spaces_config.as_ref().filter(|_| backup_config.upload_to_spaces);
    if let Some(spaces) = spaces {
        s3_upload::check_bucket_access(spaces).await?;
    }

    let catalog = connect_source(&backup_config.source).await?;
    let tools = PgClientTools::new(app_config.raw_json_config.pg_bin_dir.clone());
    let (set_dir, artifacts) = run_backup(&tools, &catalog, backup_config)
        .await
        .context("Backup failed")?;
    info!(set = %set_dir.display(), artifacts = artifacts.len(), "✅ Backup set complete");

    if backup_config.options.bundle {
        let bundle = archive::create_tar_gz_archive(&set_dir)?;
        if let Some(spaces) = spaces {
            let uri = s3_upload::upload_bundle(spaces, &bundle).await?;
            info!(uri = %uri, "Restore from this bundle with archive_file_path_for_restore");
        }
    }
    Ok(())
}

/// Prints what a backup would run, without writing anything.
pub async fn run_plan_flow(app_config: &AppConfig) -> anyhow::Result<()> {
    let backup_config = backup_config(app_config)?;
    let scopes = match backup_config.explicit_scopes() {
        Some(scopes) => scopes,
        None => discover_scopes(&connect_source(&backup_config.source).await?).await?,
    };
    let targets = expand_targets(scopes, backup_config)?;
    let modes = plan_backup(&targets, backup_config)?;

    let set_dir = backup_set_dir(&backup_config.local_backup_path, Local::now());
    println!("Backup set: {}", set_dir.display());
    for mode in &modes {
        let output = set_dir.join(mode.artifact_file_name());
        println!("  {} ({}) -> {}", mode.scope(), mode.format(), output.display());
        println!("    {}", export_invocation(mode, &backup_config.source, &output).display_command());
    }
    Ok(())
}
