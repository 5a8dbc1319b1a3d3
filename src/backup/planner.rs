// pgvault/src/backup/planner.rs
//! Chooses the export tool and its mode for a requested scope and format.
//!
//! This is a pure function. Nothing here touches the server, so an invalid
//! combination is reported before any file is written.

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::{Deserialize, Serialize};

use super::artifact::{BackupScope, DumpFormat};
use crate::engine::Tool;
use crate::errors::{OrchestratorError, Result};

/// Everything but `[A-Za-z0-9_-]` is escaped, so a database name can never
/// reach outside the set directory or shadow a cluster-wide artifact.
const FILE_NAME_ESCAPES: &AsciiSet = &NON_ALPHANUMERIC.remove(b'_').remove(b'-');

/// How pg_basebackup obtains the WAL needed to make the copy consistent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalMethod {
    None,
    Fetch,
    #[default]
    Stream,
}

impl WalMethod {
    pub fn flag(self) -> &'static str {
        match self {
            WalMethod::None => "none",
            WalMethod::Fetch => "fetch",
            WalMethod::Stream => "stream",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseBackupLayout {
    /// A copy of the data directory.
    Plain,
    /// One tar file per tablespace.
    Tar,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanOptions {
    /// Embed `CREATE DATABASE` in a plain-text single-database dump.
    pub include_create_database: bool,
    /// Emit `DROP ... IF EXISTS` ahead of each object in plain-text dumps.
    pub include_drop_statements: bool,
    pub wal_method: WalMethod,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportMode {
    DatabaseDump {
        database: String,
        format: DumpFormat,
        include_create_database: bool,
        include_drop_statements: bool,
    },
    /// All databases plus globals, plain text only.
    ClusterDump { include_drop_statements: bool },
    GlobalsDump { include_drop_statements: bool },
    BaseBackup {
        layout: BaseBackupLayout,
        wal_method: WalMethod,
    },
}

pub fn plan_export(scope: &BackupScope, format: DumpFormat, options: &PlanOptions) -> Result<ExportMode> {
    match (scope, format) {
        (BackupScope::SingleDatabase(database), _) if database.trim().is_empty() => Err(
            OrchestratorError::Configuration("Database name for a single-database backup is empty".to_string()),
        ),
        (BackupScope::SingleDatabase(database), DumpFormat::Plain) => Ok(ExportMode::DatabaseDump {
            database: database.clone(),
            format,
            include_create_database: options.include_create_database,
            include_drop_statements: options.include_drop_statements,
        }),
        // Archives always carry the database entry, and cleaning is a
        // pg_restore option for them.
        (BackupScope::SingleDatabase(database), _) => Ok(ExportMode::DatabaseDump {
            database: database.clone(),
            format,
            include_create_database: true,
            include_drop_statements: false,
        }),
        (BackupScope::AllDatabases, DumpFormat::Plain) => Ok(ExportMode::ClusterDump {
            include_drop_statements: options.include_drop_statements,
        }),
        (BackupScope::AllDatabases, other) => Err(OrchestratorError::Configuration(format!(
            "A backup of all databases is only available as plain text, {} was requested",
            other
        ))),
        (BackupScope::GlobalsOnly, DumpFormat::Plain) => Ok(ExportMode::GlobalsDump {
            include_drop_statements: options.include_drop_statements,
        }),
        (BackupScope::GlobalsOnly, other) => Err(OrchestratorError::Configuration(format!(
            "A globals backup is only available as plain text, {} was requested",
            other
        ))),
        (BackupScope::FullCluster, DumpFormat::Directory) => Ok(ExportMode::BaseBackup {
            layout: BaseBackupLayout::Plain,
            wal_method: options.wal_method,
        }),
        (BackupScope::FullCluster, DumpFormat::Tar) => Ok(ExportMode::BaseBackup {
            layout: BaseBackupLayout::Tar,
            wal_method: options.wal_method,
        }),
        (BackupScope::FullCluster, other) => Err(OrchestratorError::Configuration(format!(
            "A full-cluster backup is a physical copy and cannot be written as {}, use directory or tar",
            other
        ))),
    }
}

impl ExportMode {
    pub fn tool(&self) -> Tool {
        match self {
            ExportMode::DatabaseDump { .. } => Tool::PgDump,
            ExportMode::ClusterDump { .. } | ExportMode::GlobalsDump { .. } => Tool::PgDumpAll,
            ExportMode::BaseBackup { .. } => Tool::PgBaseBackup,
        }
    }

    pub fn scope(&self) -> BackupScope {
        match self {
            ExportMode::DatabaseDump { database, .. } => BackupScope::SingleDatabase(database.clone()),
            ExportMode::ClusterDump { .. } => BackupScope::AllDatabases,
            ExportMode::GlobalsDump { .. } => BackupScope::GlobalsOnly,
            ExportMode::BaseBackup { .. } => BackupScope::FullCluster,
        }
    }

    pub fn format(&self) -> DumpFormat {
        match self {
            ExportMode::DatabaseDump { format, .. } => *format,
            ExportMode::ClusterDump { .. } | ExportMode::GlobalsDump { .. } => DumpFormat::Plain,
            ExportMode::BaseBackup { layout: BaseBackupLayout::Plain, .. } => DumpFormat::Directory,
            ExportMode::BaseBackup { layout: BaseBackupLayout::Tar, .. } => DumpFormat::Tar,
        }
    }

    pub fn include_create_database(&self) -> bool {
        match self {
            ExportMode::DatabaseDump { include_create_database, .. } => *include_create_database,
            ExportMode::ClusterDump { .. } => true,
            ExportMode::GlobalsDump { .. } | ExportMode::BaseBackup { .. } => false,
        }
    }

    pub fn include_drop_statements(&self) -> bool {
        match self {
            ExportMode::DatabaseDump { include_drop_statements, .. }
            | ExportMode::ClusterDump { include_drop_statements }
            | ExportMode::GlobalsDump { include_drop_statements } => *include_drop_statements,
            ExportMode::BaseBackup { .. } => false,
        }
    }

    /// File (or directory) name of the artifact inside its backup set.
    ///
    /// Database dumps live under a `db_` prefix so they never collide with
    /// `globals.sql`, `all.sql` or `cluster_base`.
    pub fn artifact_file_name(&self) -> String {
        match self {
            ExportMode::DatabaseDump { database, format, .. } => format!(
                "db_{}.{}",
                utf8_percent_encode(database, FILE_NAME_ESCAPES),
                format.file_extension()
            ),
            ExportMode::ClusterDump { .. } => "all.sql".to_string(),
            ExportMode::GlobalsDump { .. } => "globals.sql".to_string(),
            ExportMode::BaseBackup { layout: BaseBackupLayout::Plain, .. } => "cluster_base".to_string(),
            ExportMode::BaseBackup { layout: BaseBackupLayout::Tar, .. } => "cluster_base.tar.d".to_string(),
        }
    }
}
