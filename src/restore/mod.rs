// pgvault/src/restore/mod.rs
pub mod diagnostics;
pub mod executor;
pub mod request;
pub(crate) mod s3_download;
pub mod state;
pub mod target_db;

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::backup::archive::extract_tar_gz_archive;
use crate::backup::artifact::{BackupArtifact, BackupScope, load_backup_set};
use crate::catalog::{CatalogInspector, PgCatalog};
use crate::config::{AppConfig, ConnectionTarget, JsonRestoreOptions, OperationConfig, RestoreConfig};
use crate::engine::{EngineTools, PgClientTools};
use executor::{RestoreExecutor, RestoreReport};
use request::{ObjectSelection, RestoreMode, RestoreRequest};
use target_db::{DatabaseAdmin, PgAdmin};

/// Globals first, then the cluster dump, then database dumps by name.
/// Base backups are left out: they are not replayed through a client tool.
pub fn order_for_restore(artifacts: &[BackupArtifact]) -> Vec<&BackupArtifact> {
    let rank = |artifact: &BackupArtifact| -> Option<u8> {
        match artifact.scope() {
            BackupScope::GlobalsOnly => Some(0),
            BackupScope::AllDatabases => Some(1),
            BackupScope::SingleDatabase(_) => Some(2),
            BackupScope::FullCluster => None,
        }
    };

    let mut ordered: Vec<(u8, &BackupArtifact)> = artifacts
        .iter()
        .filter_map(|artifact| match rank(artifact) {
            Some(r) => Some((r, artifact)),
            None => {
                warn!(path = %artifact.path().display(), "Skipping base backup; restore it by replacing a data directory");
                None
            }
        })
        .collect();
    ordered.sort_by(|(ra, a), (rb, b)| ra.cmp(rb).then_with(|| a.source_identity().cmp(b.source_identity())));
    ordered.into_iter().map(|(_, artifact)| artifact).collect()
}

/// The request for one artifact of a set, or `None` when the database list
/// leaves it out.
fn request_for_artifact(
    artifact: &BackupArtifact,
    target: &ConnectionTarget,
    database_map: Option<&HashMap<String, String>>,
    options: &JsonRestoreOptions,
) -> Option<RestoreRequest> {
    match artifact.scope() {
        BackupScope::SingleDatabase(source) => {
            let destination = match database_map {
                Some(map) => map.get(source)?.clone(),
                None => source.clone(),
            };
            Some(options.request_for(&destination))
        }
        // Cluster-wide scripts run from the entry database and only clean
        // when they carry their own drop statements.
        _ => Some(
            RestoreRequest::new(target.database_or_maintenance(), RestoreMode::RestoreIntoExisting)
                .clean_first(options.clean_first && artifact.include_drop_statements())
                .error_policy(options.error_policy)
                .jobs(1)
                .selection(ObjectSelection::default()),
        ),
    }
}

/// Restores every artifact of a set in order and stops at the first
/// failure, since later databases may depend on roles it did not create.
pub async fn restore_backup_set(
    tools: &dyn EngineTools,
    catalog: &dyn CatalogInspector,
    admin: &dyn DatabaseAdmin,
    target: &ConnectionTarget,
    artifacts: &[BackupArtifact],
    database_map: Option<&HashMap<String, String>>,
    options: &JsonRestoreOptions,
) -> Vec<RestoreReport> {
    let executor = RestoreExecutor::new(tools, catalog, admin, target.clone());
    let mut reports = Vec::new();

    for artifact in order_for_restore(artifacts) {
        let Some(request) = request_for_artifact(artifact, target, database_map, options) else {
            info!(source = artifact.source_identity(), "Not in database_list, skipping");
            continue;
        };
        let report = executor.execute(artifact, &request).await;
        let failed = !report.is_committed();
        reports.push(report);
        if failed {
            warn!("Stopping after the first failed restore");
            break;
        }
    }
    reports
}

/// Server-level work (existence checks, drops, creates) runs from the
/// maintenance database, since PostgreSQL cannot drop the database a
/// session is connected to.
fn admin_target(target: &ConnectionTarget) -> ConnectionTarget {
    target.maintenance()
}

/// Turns the configured restore source into a local backup set directory.
async fn resolve_backup_set(app_config: &AppConfig, restore_config: &RestoreConfig, scratch: &Path) -> Result<PathBuf> {
    let source = restore_config.archive_source_path.trim();

    let local_path = if restore_config.download_from_spaces {
        let spaces = app_config
            .spaces_config
            .as_ref()
            .context("S3 source configured without s3_storage")?;
        s3_download::download_bundle(spaces, source, &scratch.join("download")).await?
    } else {
        PathBuf::from(source)
    };

    if local_path.is_dir() {
        return Ok(local_path);
    }
    let name = local_path.to_string_lossy();
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        return extract_tar_gz_archive(&local_path, &scratch.join("extracted"));
    }
    anyhow::bail!(
        "Restore source {} is neither a backup set directory nor a .tar.gz bundle",
        local_path.display()
    )
}

pub async fn run_restore_flow(app_config: &AppConfig) -> Result<()> {
    let restore_config = match &app_config.operation {
        Some(OperationConfig::Restore(cfg)) => cfg,
        _ => anyhow::bail!("Restore operation selected but no restore configuration found."),
    };
    info!(server = %restore_config.target.redacted(), source = %restore_config.archive_source_path, "Starting restore");

    let scratch = tempfile::tempdir().context("Failed to create scratch directory")?;
    let set_dir = resolve_backup_set(app_config, restore_config, scratch.path()).await?;
    let artifacts = load_backup_set(&set_dir)?;
    if artifacts.is_empty() {
        anyhow::bail!("Backup set {} holds no artifacts", set_dir.display());
    }
    info!(set = %set_dir.display(), artifacts = artifacts.len(), "Loaded backup set");
    for artifact in &artifacts {
        info!(
            source = artifact.source_identity(),
            format = %artifact.format(),
            from = artifact.server(),
            created_at = %artifact.created_at(),
            "Artifact"
        );
    }

    let catalog = PgCatalog::connect(&admin_target(&restore_config.target))
        .await
        .context("Failed to connect to the restore target")?;
    catalog.ping().await?;
    let admin = PgAdmin::new(catalog.pool().clone());
    let tools = PgClientTools::new(app_config.raw_json_config.pg_bin_dir.clone());

    let reports = restore_backup_set(
        &tools,
        &catalog,
        &admin,
        &restore_config.target,
        &artifacts,
        restore_config.databases_to_restore.as_ref(),
        &restore_config.options,
    )
    .await;

    for report in &reports {
        summarize(report);
    }
    let failure = reports.into_iter().find_map(|report| {
        let destination = report.destination;
        report.error.map(|error| (destination, error))
    });
    if let Some((destination, error)) = failure {
        return Err(error).with_context(|| format!("Restore into '{}' failed", destination));
    }
    Ok(())
}

fn summarize(report: &RestoreReport) {
    let history = report.operation.history();
    let elapsed_ms = match (history.first(), history.last()) {
        (Some(first), Some(last)) => (last.at - first.at).num_milliseconds(),
        _ => 0,
    };
    info!(
        source = %report.source_identity,
        destination = %report.destination,
        states = ?report.operation.states(),
        elapsed_ms,
        "Restore result"
    );

    let Some(error) = &report.error else {
        return;
    };
    for failed in error.failed_objects() {
        warn!(destination = %report.destination, object = %failed, "Not restored");
    }
    if error.is_caller_mistake() {
        warn!("Nothing was changed on the server; fix the configuration and run again");
    } else if !error.is_retryable() {
        warn!("Re-run with restore_options.clean_first once the cause is fixed");
    }
}
