// pgvault/src/backup/artifact.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use crate::errors::{OrchestratorError, Result};

pub(crate) const METADATA_SUFFIX: &str = ".meta.json";
const CUSTOM_MAGIC: &[u8] = b"PGDMP";
const TAR_MAGIC_OFFSET: usize = 257;
const TAR_MAGIC: &[u8] = b"ustar";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DumpFormat {
    Plain,
    Custom,
    Tar,
    Directory,
}

impl DumpFormat {
    /// Structured containers go through pg_restore. Only plain text is
    /// replayed with psql.
    pub fn is_archive(self) -> bool {
        !matches!(self, DumpFormat::Plain)
    }

    pub fn pg_dump_flag(self) -> &'static str {
        match self {
            DumpFormat::Plain => "p",
            DumpFormat::Custom => "c",
            DumpFormat::Tar => "t",
            DumpFormat::Directory => "d",
        }
    }

    pub fn file_extension(self) -> &'static str {
        match self {
            DumpFormat::Plain => "sql",
            DumpFormat::Custom => "dump",
            DumpFormat::Tar => "tar",
            DumpFormat::Directory => "dir",
        }
    }
}

impl fmt::Display for DumpFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DumpFormat::Plain => "plain-text",
            DumpFormat::Custom => "custom",
            DumpFormat::Tar => "tar",
            DumpFormat::Directory => "directory",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "database", rename_all = "snake_case")]
pub enum BackupScope {
    SingleDatabase(String),
    AllDatabases,
    GlobalsOnly,
    FullCluster,
}

impl BackupScope {
    pub fn source_identity(&self) -> &str {
        match self {
            BackupScope::SingleDatabase(name) => name,
            BackupScope::AllDatabases => "all",
            BackupScope::GlobalsOnly => "globals",
            BackupScope::FullCluster => "cluster",
        }
    }

    /// Scopes whose restore targets the cluster rather than one database.
    pub fn is_cluster_wide(&self) -> bool {
        !matches!(self, BackupScope::SingleDatabase(_))
    }
}

impl fmt::Display for BackupScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupScope::SingleDatabase(name) => write!(f, "database {}", name),
            BackupScope::AllDatabases => f.write_str("all databases"),
            BackupScope::GlobalsOnly => f.write_str("globals"),
            BackupScope::FullCluster => f.write_str("full cluster"),
        }
    }
}

/// Which restore path an artifact must take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestorePath {
    PlainText,
    ArchiveAware,
}

/// A written backup. Immutable once its metadata sidecar exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupArtifact {
    scope: BackupScope,
    format: DumpFormat,
    source_identity: String,
    created_at: DateTime<Utc>,
    file_name: String,
    include_create_database: bool,
    include_drop_statements: bool,
    server: String,
    #[serde(skip)]
    location: PathBuf,
}

pub(crate) struct ArtifactRecord {
    pub scope: BackupScope,
    pub format: DumpFormat,
    pub file_name: String,
    pub include_create_database: bool,
    pub include_drop_statements: bool,
    pub server: String,
}

impl BackupArtifact {
    /// Records an artifact that already sits at `set_dir/file_name` and
    /// writes its sidecar.
    pub(crate) fn seal(set_dir: &Path, record: ArtifactRecord) -> Result<Self> {
        let artifact = Self {
            source_identity: record.scope.source_identity().to_string(),
            scope: record.scope,
            format: record.format,
            created_at: Utc::now(),
            location: set_dir.join(&record.file_name),
            file_name: record.file_name,
            include_create_database: record.include_create_database,
            include_drop_statements: record.include_drop_statements,
            server: record.server,
        };
        let json = serde_json::to_string_pretty(&artifact)?;
        fs::write(artifact.metadata_path(), json)?;
        Ok(artifact)
    }

    /// Loads an artifact from its `<file>.meta.json` sidecar.
    pub fn load(metadata_path: &Path) -> Result<Self> {
        let content = fs::read_to_string(metadata_path)?;
        let mut artifact: BackupArtifact = serde_json::from_str(&content)?;
        let mut components = Path::new(&artifact.file_name).components();
        if !matches!((components.next(), components.next()), (Some(Component::Normal(_)), None)) {
            return Err(OrchestratorError::Configuration(format!(
                "{} names '{}', which is not a file inside the backup set",
                metadata_path.display(),
                artifact.file_name
            )));
        }
        let dir = metadata_path.parent().unwrap_or_else(|| Path::new("."));
        artifact.location = dir.join(&artifact.file_name);
        Ok(artifact)
    }

    pub fn scope(&self) -> &BackupScope {
        &self.scope
    }

    pub fn format(&self) -> DumpFormat {
        self.format
    }

    pub fn source_identity(&self) -> &str {
        &self.source_identity
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn path(&self) -> &Path {
        &self.location
    }

    pub fn include_create_database(&self) -> bool {
        self.include_create_database
    }

    pub fn include_drop_statements(&self) -> bool {
        self.include_drop_statements
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn metadata_path(&self) -> PathBuf {
        let mut name = self.file_name.clone();
        name.push_str(METADATA_SUFFIX);
        self.location.with_file_name(name)
    }

    pub fn restore_path(&self) -> RestorePath {
        if self.format.is_archive() {
            RestorePath::ArchiveAware
        } else {
            RestorePath::PlainText
        }
    }
}

/// Detects the container format of a file or directory on disk.
pub fn sniff_format(path: &Path) -> Result<DumpFormat> {
    if path.is_dir() {
        if path.join("toc.dat").is_file() {
            return Ok(DumpFormat::Directory);
        }
        return Err(OrchestratorError::Configuration(format!(
            "{} is a directory without toc.dat, not a directory-format archive",
            path.display()
        )));
    }

    let mut header = Vec::with_capacity(TAR_MAGIC_OFFSET + TAR_MAGIC.len());
    File::open(path)?
        .take((TAR_MAGIC_OFFSET + TAR_MAGIC.len()) as u64)
        .read_to_end(&mut header)?;

    if header.starts_with(CUSTOM_MAGIC) {
        Ok(DumpFormat::Custom)
    } else if header.len() >= TAR_MAGIC_OFFSET + TAR_MAGIC.len()
        && &header[TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + TAR_MAGIC.len()] == TAR_MAGIC
    {
        Ok(DumpFormat::Tar)
    } else {
        Ok(DumpFormat::Plain)
    }
}

/// Reads every artifact sidecar found directly under `set_dir`.
pub fn load_backup_set(set_dir: &Path) -> Result<Vec<BackupArtifact>> {
    if !set_dir.is_dir() {
        return Err(OrchestratorError::Configuration(format!(
            "Backup set {} is not a directory",
            set_dir.display()
        )));
    }

    let mut artifacts = Vec::new();
    for entry in fs::read_dir(set_dir)? {
        let path = entry?.path();
        let is_sidecar = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(METADATA_SUFFIX));
        if is_sidecar {
            artifacts.push(BackupArtifact::load(&path)?);
        }
    }
    artifacts.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    Ok(artifacts)
}
