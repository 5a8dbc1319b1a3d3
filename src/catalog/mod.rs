//! Read-only view of the server: databases, globals and index metadata.

pub mod pg_catalog;

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::warn;

use crate::config::AppConfig;
use crate::errors::{OrchestratorError, Result};

pub use pg_catalog::PgCatalog;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Role {
    pub name: String,
    pub superuser: bool,
    pub can_login: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tablespace {
    pub name: String,
    pub owner: String,
    /// Empty for the built-in `pg_default` and `pg_global`.
    pub location: String,
}

/// Cluster-wide objects that no single database dump carries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GlobalsSnapshot {
    pub roles: Vec<Role>,
    pub tablespaces: Vec<Tablespace>,
}

impl GlobalsSnapshot {
    /// Tablespaces created by users, which need a directory on the target.
    pub fn user_tablespaces(&self) -> impl Iterator<Item = &Tablespace> {
        self.tablespaces.iter().filter(|t| !t.location.is_empty())
    }
}

#[async_trait]
pub trait CatalogInspector: Send + Sync {
    async fn ping(&self) -> Result<()>;

    /// Non-template databases that accept connections.
    async fn list_databases(&self) -> Result<Vec<String>>;

    async fn database_exists(&self, name: &str) -> Result<bool>;

    /// Needs superuser. A permission failure is an authorization error,
    /// never an empty snapshot.
    async fn snapshot_globals(&self) -> Result<GlobalsSnapshot>;

    /// Index access method → supported operator classes, sorted.
    async fn index_operator_classes(&self) -> Result<BTreeMap<String, Vec<String>>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlStateClass {
    Authorization,
    Connectivity,
    Other,
}

/// Buckets a SQLSTATE code by what the caller can do about it.
pub fn classify_sqlstate(code: &str) -> SqlStateClass {
    match code {
        "42501" => SqlStateClass::Authorization,
        c if c.starts_with("28") => SqlStateClass::Authorization,
        c if c.starts_with("08") || c.starts_with("57P") => SqlStateClass::Connectivity,
        _ => SqlStateClass::Other,
    }
}

pub(crate) fn classify_sqlx_error(err: sqlx::Error, doing: &str) -> OrchestratorError {
    match &err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
            match classify_sqlstate(&code) {
                SqlStateClass::Authorization => OrchestratorError::Authorization(format!("{}: {}", doing, err)),
                SqlStateClass::Connectivity => OrchestratorError::Connectivity(format!("{}: {}", doing, err)),
                SqlStateClass::Other => OrchestratorError::FatalEngine {
                    tool: "catalog".to_string(),
                    status: format!("SQLSTATE {}", code),
                    stderr: format!("{}: {}", doing, err),
                },
            }
        }
        sqlx::Error::Configuration(_) => OrchestratorError::Configuration(format!("{}: {}", doing, err)),
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => OrchestratorError::Connectivity(format!("{}: {}", doing, err)),
        _ => OrchestratorError::FatalEngine {
            tool: "catalog".to_string(),
            status: "query failed".to_string(),
            stderr: format!("{}: {}", doing, err),
        },
    }
}

/// What `inspect` prints. Globals are left out, with a warning, when the
/// connecting role is not a superuser.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogReport {
    pub server: String,
    pub databases: Vec<String>,
    pub globals: Option<GlobalsSnapshot>,
    pub index_operator_classes: BTreeMap<String, Vec<String>>,
}

pub async fn inspect(catalog: &dyn CatalogInspector, server: &str) -> Result<CatalogReport> {
    catalog.ping().await?;
    let databases = catalog.list_databases().await?;
    let globals = match catalog.snapshot_globals().await {
        Ok(snapshot) => Some(snapshot),
        Err(OrchestratorError::Authorization(reason)) => {
            warn!(%reason, "Globals need superuser, leaving them out");
            None
        }
        Err(e) => return Err(e),
    };
    Ok(CatalogReport {
        server: server.to_string(),
        databases,
        globals,
        index_operator_classes: catalog.index_operator_classes().await?,
    })
}

pub async fn run_inspect_flow(app_config: &AppConfig) -> anyhow::Result<()> {
    let server = app_config.inspect_target()?;
    let catalog = PgCatalog::connect(&server)
        .await
        .with_context(|| format!("Failed to connect to {}", server.redacted()))?;
    let report = inspect(&catalog, &server.redacted()).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
