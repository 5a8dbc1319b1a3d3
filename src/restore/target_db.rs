// pgvault/src/restore/target_db.rs
use async_trait::async_trait;
use sqlx::PgPool;
use tracing::info;

use crate::catalog::classify_sqlx_error;
use crate::config::connection::MAINTENANCE_DATABASE;
use crate::errors::{OrchestratorError, Result};

/// Destructive database-level operations used while cleaning and creating
/// restore destinations.
#[async_trait]
pub trait DatabaseAdmin: Send + Sync {
    async fn create_database(&self, name: &str, owner: Option<&str>) -> Result<()>;

    async fn drop_database(&self, name: &str) -> Result<()>;
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

const SYSTEM_DATABASES: [&str; 3] = [MAINTENANCE_DATABASE, "template0", "template1"];

/// Databases the orchestrator will never drop. Names are case-sensitive
/// on the server, so `templates` or `Template1` are ordinary databases.
pub fn is_protected_database(name: &str) -> bool {
    SYSTEM_DATABASES.contains(&name)
}

#[derive(Debug, Clone)]
pub struct PgAdmin {
    pool: PgPool,
}

impl PgAdmin {
    /// `pool` must not be connected to a database this admin will drop.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DatabaseAdmin for PgAdmin {
    async fn create_database(&self, name: &str, owner: Option<&str>) -> Result<()> {
        info!(database = name, "Creating database");
        let mut create_sql = format!("CREATE DATABASE {}", quote_ident(name));
        if let Some(owner) = owner.filter(|o| !o.is_empty()) {
            create_sql.push_str(&format!(" OWNER {}", quote_ident(owner)));
        }

        sqlx::query(&create_sql)
            .execute(&self.pool)
            .await
            .map_err(|e| classify_sqlx_error(e, &format!("creating database '{}'", name)))?;
        info!(database = name, "✓ Database created");
        Ok(())
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        if is_protected_database(name) {
            return Err(OrchestratorError::Configuration(format!(
                "Refusing to drop '{}', it is a system database",
                name
            )));
        }
        info!(database = name, "Dropping database");

        sqlx::query("SELECT pg_terminate_backend(pid) FROM pg_stat_activity WHERE datname = $1 AND pid <> pg_backend_pid()")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| classify_sqlx_error(e, &format!("terminating sessions on '{}'", name)))?;

        sqlx::query(&format!("DROP DATABASE IF EXISTS {} WITH (FORCE)", quote_ident(name)))
            .execute(&self.pool)
            .await
            .map_err(|e| classify_sqlx_error(e, &format!("dropping database '{}'", name)))?;
        info!(database = name, "✓ Database dropped");
        Ok(())
    }
}
