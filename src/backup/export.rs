// pgvault/src/backup/export.rs
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use super::artifact::{ArtifactRecord, BackupArtifact};
use super::planner::{BaseBackupLayout, ExportMode};
use crate::config::ConnectionTarget;
use crate::engine::{EngineTools, Tool, ToolInvocation, classify_tool_failure};
use crate::errors::{OrchestratorError, Result};

/// Builds the client-tool command line for one export.
pub fn export_invocation(mode: &ExportMode, server: &ConnectionTarget, output: &Path) -> ToolInvocation {
    let output = output.to_string_lossy();
    let password = server.password();

    match mode {
        ExportMode::DatabaseDump {
            database,
            format,
            include_create_database,
            include_drop_statements,
        } => {
            let plain = !format.is_archive();
            ToolInvocation::new(Tool::PgDump)
                .arg(format!("--dbname={}", server.with_database(database).conninfo()))
                .arg(format!("--format={}", format.pg_dump_flag()))
                .arg(format!("--file={}", output))
                .arg("--no-password")
                .arg_if(plain && *include_create_database, "--create")
                .arg_if(plain && *include_drop_statements, "--clean")
                .arg_if(plain && *include_drop_statements, "--if-exists")
                .password(password.as_deref())
        }
        ExportMode::ClusterDump { include_drop_statements } | ExportMode::GlobalsDump { include_drop_statements } => {
            ToolInvocation::new(Tool::PgDumpAll)
                .arg(format!("--dbname={}", server.maintenance().conninfo()))
                .arg(format!("--file={}", output))
                .arg("--no-password")
                .arg_if(matches!(mode, ExportMode::GlobalsDump { .. }), "--globals-only")
                .arg_if(*include_drop_statements, "--clean")
                .arg_if(*include_drop_statements, "--if-exists")
                .password(password.as_deref())
        }
        ExportMode::BaseBackup { layout, wal_method } => {
            let layout_flag = match layout {
                BaseBackupLayout::Plain => "p",
                BaseBackupLayout::Tar => "t",
            };
            ToolInvocation::new(Tool::PgBaseBackup)
                .arg(format!("--dbname={}", server.maintenance().conninfo()))
                .arg(format!("--pgdata={}", output))
                .arg(format!("--format={}", layout_flag))
                .arg(format!("--wal-method={}", wal_method.flag()))
                .arg("--checkpoint=fast")
                .arg("--no-password")
                .password(password.as_deref())
        }
    }
}

fn remove_partial(path: &Path) {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else if path.exists() {
        fs::remove_file(path)
    } else {
        Ok(())
    };
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "Failed to remove partial export output");
    }
}

/// Runs one export and writes exactly one artifact into `set_dir`.
///
/// The tool writes to a hidden temporary name that is renamed into place
/// only after a zero exit, so a failed export never leaves an artifact
/// behind.
pub async fn run_export(
    tools: &dyn EngineTools,
    server: &ConnectionTarget,
    mode: &ExportMode,
    set_dir: &Path,
) -> Result<BackupArtifact> {
    let file_name = mode.artifact_file_name();
    let final_path = set_dir.join(&file_name);
    if final_path.exists() {
        return Err(OrchestratorError::Configuration(format!(
            "Artifact {} already exists; artifacts are never overwritten",
            final_path.display()
        )));
    }

    let partial_path = set_dir.join(format!(".{}.partial", file_name));
    remove_partial(&partial_path);

    let invocation = export_invocation(mode, server, &partial_path);
    info!(scope = %mode.scope(), format = %mode.format(), tool = %mode.tool(), "📦 Exporting");

    let output = match tools.run(&invocation).await {
        Ok(output) => output,
        Err(e) => {
            remove_partial(&partial_path);
            return Err(e);
        }
    };
    if !output.success {
        remove_partial(&partial_path);
        return Err(classify_tool_failure(mode.tool(), &output));
    }
    if !partial_path.exists() {
        return Err(OrchestratorError::FatalEngine {
            tool: mode.tool().to_string(),
            status: output.status_label(),
            stderr: format!("{} reported success but wrote no output", mode.tool()),
        });
    }

    fs::rename(&partial_path, &final_path)?;
    let artifact = BackupArtifact::seal(
        set_dir,
        ArtifactRecord {
            scope: mode.scope(),
            format: mode.format(),
            file_name,
            include_create_database: mode.include_create_database(),
            include_drop_statements: mode.include_drop_statements(),
            server: server.host(),
        },
    )?;
    info!(path = %artifact.path().display(), "✓ Artifact written");
    Ok(artifact)
}
