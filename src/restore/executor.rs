// pgvault/src/restore/executor.rs
use std::io::ErrorKind;
use tracing::{error, info, warn};

use super::diagnostics::{parse_pg_restore_stderr, parse_psql_stderr};
use super::request::{ErrorPolicy, RestoreMode, RestoreRequest};
use super::state::{RestoreOperation, RestoreState};
use super::target_db::{DatabaseAdmin, is_protected_database};
use crate::backup::artifact::{BackupArtifact, BackupScope, DumpFormat, RestorePath, sniff_format};
use crate::catalog::CatalogInspector;
use crate::config::ConnectionTarget;
use crate::engine::{EngineTools, Tool, ToolInvocation, classify_tool_failure};
use crate::errors::{OrchestratorError, Result};

/// What happens in the CLEANING state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cleanup {
    /// Nothing for us to do: the artifact's own drop statements clean up.
    Embedded,
    /// pg_restore drops each object before recreating it.
    ToolFlag,
    DropDatabase,
    DropAndRecreate,
}

#[derive(Debug)]
struct ApplyPlan {
    path: RestorePath,
    cleanup: Cleanup,
    create_before_apply: bool,
    invocation: ToolInvocation,
}

/// Outcome of one restore, successful or not.
#[derive(Debug)]
pub struct RestoreReport {
    pub source_identity: String,
    pub destination: String,
    pub operation: RestoreOperation,
    pub error: Option<OrchestratorError>,
}

impl RestoreReport {
    pub fn state(&self) -> RestoreState {
        self.operation.current()
    }

    pub fn is_committed(&self) -> bool {
        self.state() == RestoreState::Committed
    }
}

/// Dispatches an artifact to the plain-text or archive-aware restore path
/// and walks the restore state machine.
pub struct RestoreExecutor<'a> {
    tools: &'a dyn EngineTools,
    catalog: &'a dyn CatalogInspector,
    admin: &'a dyn DatabaseAdmin,
    server: ConnectionTarget,
}

impl<'a> RestoreExecutor<'a> {
    pub fn new(
        tools: &'a dyn EngineTools,
        catalog: &'a dyn CatalogInspector,
        admin: &'a dyn DatabaseAdmin,
        server: ConnectionTarget,
    ) -> Self {
        Self {
            tools,
            catalog,
            admin,
            server,
        }
    }

    /// Runs one restore to a terminal state. Never retries: a FAILED
    /// restore has to be re-invoked, normally with `clean_first`.
    pub async fn execute(&self, artifact: &BackupArtifact, request: &RestoreRequest) -> RestoreReport {
        let mut operation = RestoreOperation::new();
        info!(
            source = artifact.source_identity(),
            format = %artifact.format(),
            destination = %request.destination,
            mode = ?request.mode,
            clean_first = request.clean_first,
            "🔄 Restoring"
        );

        let error = match self.drive(&mut operation, artifact, request).await {
            Ok(()) => {
                info!(destination = %request.destination, "✓ Restore committed");
                None
            }
            Err(e) => {
                if !operation.current().is_terminal() {
                    if let Err(transition) = operation.advance(RestoreState::Failed) {
                        warn!(error = %transition, "Could not record failed state");
                    }
                }
                error!(destination = %request.destination, error = %e, "❌ Restore failed");
                Some(e)
            }
        };

        RestoreReport {
            source_identity: artifact.source_identity().to_string(),
            destination: request.destination.clone(),
            operation,
            error,
        }
    }

    async fn drive(
        &self,
        operation: &mut RestoreOperation,
        artifact: &BackupArtifact,
        request: &RestoreRequest,
    ) -> Result<()> {
        operation.advance(RestoreState::Validating)?;
        let plan = self.validate(artifact, request).await?;

        if request.clean_first {
            operation.advance(RestoreState::Cleaning)?;
            self.clean(&plan, request).await?;
        }

        operation.advance(RestoreState::Applying)?;
        self.apply(&plan, request).await?;
        operation.advance(RestoreState::Committed)
    }

    /// Every check that can reject a request runs here, before anything is
    /// dropped, created or replayed.
    async fn validate(&self, artifact: &BackupArtifact, request: &RestoreRequest) -> Result<ApplyPlan> {
        if *artifact.scope() == BackupScope::FullCluster {
            return Err(OrchestratorError::Configuration(
                "Base backups are restored by replacing a data directory, which is outside this tool".to_string(),
            ));
        }

        let detected = sniff_format(artifact.path()).map_err(|e| match e {
            OrchestratorError::Io(io) if io.kind() == ErrorKind::NotFound => OrchestratorError::Configuration(
                format!("Artifact {} does not exist", artifact.path().display()),
            ),
            other => other,
        })?;
        if detected != artifact.format() {
            return Err(OrchestratorError::FormatMismatch {
                recorded: artifact.format(),
                detected,
            });
        }

        let destination = request.destination.trim();
        if destination.is_empty() {
            return Err(OrchestratorError::Configuration("Restore destination is empty".to_string()));
        }

        let path = artifact.restore_path();
        match path {
            RestorePath::PlainText => {
                if request.jobs != 1 {
                    return Err(OrchestratorError::Configuration(format!(
                        "Parallel restore ({} jobs) needs a custom or directory archive, {} is plain text",
                        request.jobs,
                        artifact.path().display()
                    )));
                }
                if !request.selection.is_empty() {
                    return Err(OrchestratorError::Configuration(
                        "Selective restore needs an archive format, plain text is replayed whole".to_string(),
                    ));
                }
            }
            RestorePath::ArchiveAware => {
                if request.jobs == 0 {
                    return Err(OrchestratorError::Configuration("Restore jobs must be at least 1".to_string()));
                }
                if request.jobs > 1 && artifact.format() == DumpFormat::Tar {
                    return Err(OrchestratorError::Configuration(
                        "pg_restore runs tar archives with a single job, use custom or directory format for parallel restore"
                            .to_string(),
                    ));
                }
            }
        }

        let exists = self.catalog.database_exists(destination).await?;

        let (cleanup, create_before_apply, connect_to) = if artifact.scope().is_cluster_wide() {
            if request.mode != RestoreMode::RestoreIntoExisting {
                return Err(OrchestratorError::Configuration(format!(
                    "A {} artifact is replayed into an existing entry database, mode {:?} does not apply",
                    artifact.scope(),
                    request.mode
                )));
            }
            if request.clean_first && !artifact.include_drop_statements() {
                return Err(OrchestratorError::Configuration(format!(
                    "clean_first on a {} artifact needs one exported with drop statements",
                    artifact.scope()
                )));
            }
            if !exists {
                return Err(OrchestratorError::Configuration(format!(
                    "Entry database '{}' does not exist",
                    destination
                )));
            }
            (Cleanup::Embedded, false, self.server.with_database(destination))
        } else {
            match request.mode {
                RestoreMode::RestoreIntoExisting => {
                    if !exists {
                        return Err(OrchestratorError::Configuration(format!(
                            "Destination '{}' does not exist; use create_new or create_and_restore",
                            destination
                        )));
                    }
                    let cleanup = match path {
                        RestorePath::PlainText => Cleanup::DropAndRecreate,
                        RestorePath::ArchiveAware => Cleanup::ToolFlag,
                    };
                    (cleanup, false, self.server.with_database(destination))
                }
                RestoreMode::CreateNew => {
                    if exists && !request.clean_first {
                        return Err(OrchestratorError::Configuration(format!(
                            "Destination '{}' already exists; set clean_first or use restore_into_existing",
                            destination
                        )));
                    }
                    let cleanup = if exists { Cleanup::DropDatabase } else { Cleanup::Embedded };
                    (cleanup, true, self.server.with_database(destination))
                }
                RestoreMode::CreateAndRestore => {
                    if destination != artifact.source_identity() {
                        return Err(OrchestratorError::Configuration(format!(
                            "The artifact recreates '{}', it cannot create '{}'; use create_new to restore under another name",
                            artifact.source_identity(),
                            destination
                        )));
                    }
                    if path == RestorePath::PlainText && !artifact.include_create_database() {
                        return Err(OrchestratorError::Configuration(
                            "This plain-text artifact was exported without CREATE DATABASE".to_string(),
                        ));
                    }
                    if exists && !request.clean_first {
                        return Err(OrchestratorError::Configuration(format!(
                            "Destination '{}' already exists; set clean_first or use restore_into_existing",
                            destination
                        )));
                    }
                    let cleanup = match path {
                        RestorePath::ArchiveAware => Cleanup::ToolFlag,
                        RestorePath::PlainText if exists => Cleanup::DropDatabase,
                        RestorePath::PlainText => Cleanup::Embedded,
                    };
                    (cleanup, false, self.server.maintenance())
                }
            }
        };

        let drops_database = matches!(cleanup, Cleanup::DropDatabase | Cleanup::DropAndRecreate);
        if request.clean_first && drops_database && is_protected_database(destination) {
            return Err(OrchestratorError::Configuration(format!(
                "Refusing to clean '{}', it is a system database",
                destination
            )));
        }

        let invocation = match path {
            RestorePath::PlainText => self.replay_invocation(artifact, &connect_to, request),
            RestorePath::ArchiveAware => self.archive_invocation(artifact, &connect_to, request, cleanup),
        };

        Ok(ApplyPlan {
            path,
            cleanup,
            create_before_apply,
            invocation,
        })
    }

    fn replay_invocation(
        &self,
        artifact: &BackupArtifact,
        connect_to: &ConnectionTarget,
        request: &RestoreRequest,
    ) -> ToolInvocation {
        ToolInvocation::new(Tool::Psql)
            .arg("-X")
            .arg("-q")
            .arg("--no-password")
            .arg(format!("--dbname={}", connect_to.conninfo()))
            .arg(format!("--file={}", artifact.path().to_string_lossy()))
            .arg_if(request.error_policy == ErrorPolicy::StopOnFirstError, "--set=ON_ERROR_STOP=1")
            .password(connect_to.password().as_deref())
    }

    fn archive_invocation(
        &self,
        artifact: &BackupArtifact,
        connect_to: &ConnectionTarget,
        request: &RestoreRequest,
        cleanup: Cleanup,
    ) -> ToolInvocation {
        let clean = request.clean_first && cleanup == Cleanup::ToolFlag;
        let mut invocation = ToolInvocation::new(Tool::PgRestore)
            .arg(format!("--dbname={}", connect_to.conninfo()))
            .arg("--no-password")
            .arg_if(request.jobs > 1, format!("--jobs={}", request.jobs))
            .arg_if(request.mode == RestoreMode::CreateAndRestore, "--create")
            .arg_if(clean, "--clean")
            .arg_if(clean, "--if-exists")
            .arg_if(request.error_policy == ErrorPolicy::StopOnFirstError, "--exit-on-error");
        for arg in request.selection.restore_args() {
            invocation = invocation.arg(arg);
        }
        invocation
            .arg(artifact.path().to_string_lossy().into_owned())
            .password(connect_to.password().as_deref())
    }

    async fn clean(&self, plan: &ApplyPlan, request: &RestoreRequest) -> Result<()> {
        let destination = request.destination.trim();
        match plan.cleanup {
            Cleanup::Embedded => {
                info!(destination, "Cleaning is carried by the artifact itself");
            }
            Cleanup::ToolFlag => {
                info!(destination, "pg_restore will drop objects before recreating them");
            }
            Cleanup::DropDatabase => {
                self.admin.drop_database(destination).await?;
            }
            Cleanup::DropAndRecreate => {
                self.admin.drop_database(destination).await?;
                self.admin.create_database(destination, self.server.username().as_deref()).await?;
            }
        }
        Ok(())
    }

    async fn apply(&self, plan: &ApplyPlan, request: &RestoreRequest) -> Result<()> {
        if plan.create_before_apply {
            self.admin
                .create_database(request.destination.trim(), self.server.username().as_deref())
                .await?;
        }

        let output = self.tools.run(&plan.invocation).await?;
        let diagnostics = match plan.path {
            RestorePath::PlainText => parse_psql_stderr(&output.stderr),
            RestorePath::ArchiveAware => parse_pg_restore_stderr(&output.stderr),
        };

        if !diagnostics.failed.is_empty() {
            for failed in &diagnostics.failed {
                warn!(kind = %failed.kind, name = %failed.name, message = %failed.message, "Object not restored");
            }
            return Err(OrchestratorError::PartialFailure {
                failed: diagnostics.failed,
            });
        }
        if !output.success {
            return Err(classify_tool_failure(plan.invocation.tool, &output));
        }
        Ok(())
    }
}
