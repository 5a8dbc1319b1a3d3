// pgvault/src/config/mod.rs
pub mod connection;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::backup::artifact::{BackupScope, DumpFormat};
use crate::backup::planner::{PlanOptions, WalMethod};
use crate::restore::request::{ErrorPolicy, ObjectSelection, RestoreMode, RestoreRequest};

pub use connection::ConnectionTarget;

#[derive(Debug, Clone, Deserialize)]
pub struct JsonS3StorageConfig {
    pub bucket_name: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
    pub folder_prefix: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    /// One artifact per entry of `database_list`, or per user database
    /// when the list is absent.
    #[default]
    SingleDatabase,
    AllDatabases,
    GlobalsOnly,
    FullCluster,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct JsonBackupOptions {
    pub scope: ScopeKind,
    pub format: DumpFormat,
    /// Adds a plain globals artifact next to per-database dumps.
    pub include_globals: bool,
    pub include_create_database: bool,
    pub include_drop_statements: bool,
    pub wal_method: WalMethod,
    /// Packs the finished set into `<set>.tar.gz`.
    pub bundle: bool,
}

impl Default for JsonBackupOptions {
    fn default() -> Self {
        Self {
            scope: ScopeKind::SingleDatabase,
            format: DumpFormat::Custom,
            include_globals: true,
            include_create_database: false,
            include_drop_statements: false,
            wal_method: WalMethod::default(),
            bundle: false,
        }
    }
}

impl JsonBackupOptions {
    pub fn plan_options(&self) -> PlanOptions {
        PlanOptions {
            include_create_database: self.include_create_database,
            include_drop_statements: self.include_drop_statements,
            wal_method: self.wal_method,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct JsonRestoreOptions {
    pub mode: RestoreMode,
    pub clean_first: bool,
    pub jobs: usize,
    pub error_policy: ErrorPolicy,
    pub selection: ObjectSelection,
}

impl Default for JsonRestoreOptions {
    fn default() -> Self {
        Self {
            mode: RestoreMode::default(),
            clean_first: false,
            jobs: 1,
            error_policy: ErrorPolicy::default(),
            selection: ObjectSelection::default(),
        }
    }
}

impl JsonRestoreOptions {
    pub fn request_for(&self, destination: &str) -> RestoreRequest {
        RestoreRequest::new(destination, self.mode)
            .clean_first(self.clean_first)
            .jobs(self.jobs)
            .error_policy(self.error_policy)
            .selection(self.selection.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawJsonConfig {
    pub source_database_url: Option<String>,
    pub target_database_url: Option<String>,
    pub local_backup_dir: Option<PathBuf>,
    pub archive_file_path_for_restore: Option<String>,
    pub database_list: Option<serde_json::Value>,
    pub backup_options: Option<JsonBackupOptions>,
    pub restore_options: Option<JsonRestoreOptions>,
    pub s3_storage: Option<JsonS3StorageConfig>,
    /// Directory holding the PostgreSQL client binaries. Falls back to PATH.
    pub pg_bin_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct SpacesConfig {
    pub endpoint_url: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
    pub folder_prefix: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub source: ConnectionTarget,
    pub databases_to_backup: Option<Vec<String>>,
    pub local_backup_path: PathBuf,
    pub options: JsonBackupOptions,
    pub upload_to_spaces: bool,
}

impl BackupConfig {
    /// Scopes this backup exports, before any `include_globals` artifact.
    /// `None` means "every user database" and is resolved against the
    /// catalog at run time.
    pub fn explicit_scopes(&self) -> Option<Vec<BackupScope>> {
        match self.options.scope {
            ScopeKind::SingleDatabase => self
                .databases_to_backup
                .as_ref()
                .map(|dbs| dbs.iter().cloned().map(BackupScope::SingleDatabase).collect()),
            ScopeKind::AllDatabases => Some(vec![BackupScope::AllDatabases]),
            ScopeKind::GlobalsOnly => Some(vec![BackupScope::GlobalsOnly]),
            ScopeKind::FullCluster => Some(vec![BackupScope::FullCluster]),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestoreConfig {
    pub target: ConnectionTarget,
    pub archive_source_path: String,
    pub databases_to_restore: Option<HashMap<String, String>>,
    pub download_from_spaces: bool,
    pub options: JsonRestoreOptions,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub operation: Option<OperationConfig>,
    pub spaces_config: Option<SpacesConfig>,
    pub raw_json_config: RawJsonConfig,
}

#[derive(Debug, Clone)]
pub enum OperationConfig {
    Backup(BackupConfig),
    Restore(RestoreConfig),
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        Self::from_json_str(&config_content)
            .with_context(|| format!("Failed to parse JSON from config file at {}", config_path.display()))
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let raw_json_config: RawJsonConfig = serde_json::from_str(content)?;

        let spaces_config = raw_json_config.s3_storage.as_ref().and_then(|s3_raw| {
            if let (Some(bucket), Some(region), Some(key_id), Some(secret), Some(endpoint)) = (
                s3_raw.bucket_name.as_ref().filter(|s| !s.is_empty()),
                s3_raw.region.as_ref().filter(|s| !s.is_empty()),
                s3_raw.access_key_id.as_ref().filter(|s| !s.is_empty()),
                s3_raw.secret_access_key.as_ref().filter(|s| !s.is_empty()),
                s3_raw.endpoint_url.as_ref().filter(|s| !s.is_empty()),
            ) {
                Some(SpacesConfig {
                    bucket_name: bucket.clone(),
                    region: region.clone(),
                    access_key_id: key_id.clone(),
                    secret_access_key: secret.clone(),
                    endpoint_url: endpoint.clone(),
                    folder_prefix: s3_raw.folder_prefix.clone().filter(|s| !s.is_empty()),
                })
            } else {
                let any_set = [
                    &s3_raw.bucket_name,
                    &s3_raw.region,
                    &s3_raw.access_key_id,
                    &s3_raw.secret_access_key,
                    &s3_raw.endpoint_url,
                ]
                .iter()
                .any(|field| field.is_some());
                if any_set {
                    warn!(
                        "s3_storage is incomplete (bucket_name, region, access_key_id, secret_access_key and endpoint_url are required); S3 offload is disabled"
                    );
                }
                None
            }
        });

        Ok(AppConfig {
            operation: None,
            spaces_config,
            raw_json_config,
        })
    }

    /// The server `inspect` looks at: the source when set, else the target.
    pub fn inspect_target(&self) -> Result<ConnectionTarget> {
        let raw = self
            .raw_json_config
            .source_database_url
            .as_ref()
            .or(self.raw_json_config.target_database_url.as_ref())
            .context("source_database_url or target_database_url must be set in config.json")?;
        Ok(ConnectionTarget::parse(raw)?)
    }
}

pub fn load_backup_config_from_json(raw_config: &RawJsonConfig, spaces_is_configured: bool) -> Result<BackupConfig> {
    let source_url = raw_config
        .source_database_url
        .as_ref()
        .context("source_database_url must be set in config.json for backup")?;
    let source = ConnectionTarget::parse(source_url).context("source_database_url is not a valid connection URL")?;

    let local_backup_path = raw_config
        .local_backup_dir
        .as_ref()
        .context("local_backup_dir must be set in config.json for backup")?
        .clone();
    if local_backup_path.as_os_str().is_empty() {
        anyhow::bail!("local_backup_dir cannot be empty in config.json.");
    }

    let options = raw_config.backup_options.clone().unwrap_or_default();
    let databases_to_backup = parse_database_list_for_backup(&raw_config.database_list)?;
    if options.scope != ScopeKind::SingleDatabase && databases_to_backup.is_some() {
        warn!(scope = ?options.scope, "database_list is ignored for cluster-wide backup scopes");
    }

    Ok(BackupConfig {
        source,
        databases_to_backup,
        local_backup_path,
        upload_to_spaces: spaces_is_configured && options.bundle,
        options,
    })
}

pub fn load_restore_config_from_json(raw_config: &RawJsonConfig, spaces_is_configured: bool) -> Result<RestoreConfig> {
    let target_url = raw_config
        .target_database_url
        .as_ref()
        .context("target_database_url must be set in config.json for restore")?;
    let target = ConnectionTarget::parse(target_url).context("target_database_url is not a valid connection URL")?;

    let archive_source_path = raw_config
        .archive_file_path_for_restore
        .as_ref()
        .context("archive_file_path_for_restore must be set in config.json for restore")?
        .clone();
    if archive_source_path.trim().is_empty() {
        anyhow::bail!("archive_file_path_for_restore cannot be empty in config.json.");
    }

    let download_from_spaces = archive_source_path.starts_with("s3://");
    if download_from_spaces && !spaces_is_configured {
        anyhow::bail!(
            "archive_file_path_for_restore is an S3 URI, but s3_storage is missing or lacks required fields."
        );
    }

    let options = raw_config.restore_options.clone().unwrap_or_default();
    if options.jobs == 0 {
        anyhow::bail!("restore_options.jobs must be at least 1");
    }

    Ok(RestoreConfig {
        target,
        archive_source_path,
        databases_to_restore: parse_database_list_for_restore(&raw_config.database_list)?,
        download_from_spaces,
        options,
    })
}

/// Source database names from `database_list`, in either of its forms.
fn parse_database_list_for_backup(database_list: &Option<serde_json::Value>) -> Result<Option<Vec<String>>> {
    match database_list {
        Some(value) if value.is_array() => {
            let databases: Vec<String> =
                serde_json::from_value(value.clone()).context("Failed to parse database_list as array")?;
            Ok(Some(databases))
        }
        Some(value) if value.is_object() => {
            let mapping: HashMap<String, String> =
                serde_json::from_value(value.clone()).context("Failed to parse database_list as mapping object")?;
            let mut databases: Vec<String> = mapping.into_keys().collect();
            databases.sort();
            Ok(Some(databases))
        }
        Some(_) => anyhow::bail!("database_list must be either an array of database names or a mapping object"),
        None => Ok(None),
    }
}

/// Source → destination names. An array maps each database to itself.
fn parse_database_list_for_restore(
    database_list: &Option<serde_json::Value>,
) -> Result<Option<HashMap<String, String>>> {
    match database_list {
        Some(value) if value.is_array() => {
            let databases: Vec<String> =
                serde_json::from_value(value.clone()).context("Failed to parse database_list as array")?;
            Ok(Some(databases.into_iter().map(|db| (db.clone(), db)).collect()))
        }
        Some(value) if value.is_object() => {
            let mapping: HashMap<String, String> =
                serde_json::from_value(value.clone()).context("Failed to parse database_list as mapping object")?;
            Ok(Some(mapping))
        }
        Some(_) => anyhow::bail!("database_list must be either an array of database names or a mapping object"),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn backup_list_accepts_array_and_mapping() -> anyhow::Result<()> {
        let array = parse_database_list_for_backup(&Some(json!(["shop", "billing"])))?;
        assert_eq!(array, Some(vec!["shop".to_string(), "billing".to_string()]));

        let mapping = parse_database_list_for_backup(&Some(json!({
            "shop": "shop_staging",
            "billing": "billing_staging"
        })))?;
        assert_eq!(mapping, Some(vec!["billing".to_string(), "shop".to_string()]));

        assert_eq!(parse_database_list_for_backup(&None)?, None);
        Ok(())
    }

    #[test]
    fn restore_list_maps_sources_to_destinations() -> anyhow::Result<()> {
        let array = parse_database_list_for_restore(&Some(json!(["shop"])))?.unwrap();
        assert_eq!(array.get("shop").map(String::as_str), Some("shop"));

        let mapping = parse_database_list_for_restore(&Some(json!({ "shop": "shop_staging" })))?.unwrap();
        assert_eq!(mapping.get("shop").map(String::as_str), Some("shop_staging"));
        Ok(())
    }

    #[test]
    fn database_list_rejects_other_shapes() {
        let value = Some(json!("shop"));
        assert!(parse_database_list_for_backup(&value).is_err());
        assert!(parse_database_list_for_restore(&value).is_err());
    }

    #[test]
    fn options_default_when_omitted() -> anyhow::Result<()> {
        let config = AppConfig::from_json_str(
            r#"{
                "source_database_url": "postgres://admin:pw@db:5432/postgres",
                "target_database_url": "postgres://admin:pw@db:5432/postgres",
                "local_backup_dir": "./backups",
                "archive_file_path_for_restore": "./backups/backup_2026-01-01_00_00_00"
            }"#,
        )?;
        assert!(config.spaces_config.is_none());

        let backup = load_backup_config_from_json(&config.raw_json_config, false)?;
        assert_eq!(backup.options, JsonBackupOptions::default());
        assert_eq!(backup.explicit_scopes(), None);

        let restore = load_restore_config_from_json(&config.raw_json_config, false)?;
        assert_eq!(restore.options.jobs, 1);
        assert_eq!(restore.options.error_policy, ErrorPolicy::StopOnFirstError);
        Ok(())
    }

    #[test]
    fn full_options_parse() -> anyhow::Result<()> {
        let config = AppConfig::from_json_str(
            r#"{
                "source_database_url": "postgres://admin:pw@db:5432/postgres",
                "target_database_url": "postgres://admin:pw@replica:5432/postgres",
                "local_backup_dir": "./backups",
                "archive_file_path_for_restore": "s3://vault/backup_2026-01-01_00_00_00.tar.gz",
                "database_list": { "shop": "shop_restored" },
                "backup_options": { "scope": "all_databases", "format": "plain", "include_drop_statements": true, "bundle": true },
                "restore_options": {
                    "mode": "create_new", "clean_first": true, "jobs": 4,
                    "error_policy": "continue_on_error",
                    "selection": { "tables": ["orders"] }
                },
                "s3_storage": {
                    "bucket_name": "vault", "region": "fra1", "access_key_id": "AK",
                    "secret_access_key": "SK", "endpoint_url": "https://fra1.example.com"
                }
            }"#,
        )?;
        assert!(config.spaces_config.is_some());

        let backup = load_backup_config_from_json(&config.raw_json_config, true)?;
        assert_eq!(backup.explicit_scopes(), Some(vec![BackupScope::AllDatabases]));
        assert!(backup.upload_to_spaces);
        assert!(backup.options.plan_options().include_drop_statements);

        let restore = load_restore_config_from_json(&config.raw_json_config, true)?;
        assert!(restore.download_from_spaces);
        let request = restore.options.request_for("shop_restored");
        assert_eq!(request.mode, RestoreMode::CreateNew);
        assert_eq!(request.jobs, 4);
        assert!(request.clean_first);
        assert_eq!(request.selection.tables, vec!["orders".to_string()]);
        Ok(())
    }

    #[test]
    fn s3_source_requires_storage_config() -> anyhow::Result<()> {
        let config = AppConfig::from_json_str(
            r#"{
                "target_database_url": "postgres://admin@db/postgres",
                "archive_file_path_for_restore": "s3://vault/set.tar.gz"
            }"#,
        )?;
        assert!(load_restore_config_from_json(&config.raw_json_config, false).is_err());
        Ok(())
    }

    #[test]
    fn explicit_list_becomes_single_database_scopes() -> anyhow::Result<()> {
        let config = AppConfig::from_json_str(
            r#"{
                "source_database_url": "postgres://admin@db/postgres",
                "local_backup_dir": "./backups",
                "database_list": ["shop", "billing"]
            }"#,
        )?;
        let backup = load_backup_config_from_json(&config.raw_json_config, false)?;
        assert_eq!(
            backup.explicit_scopes(),
            Some(vec![
                BackupScope::SingleDatabase("shop".into()),
                BackupScope::SingleDatabase("billing".into())
            ])
        );
        Ok(())
    }
}
