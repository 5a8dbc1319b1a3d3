// pgvault/src/catalog/pg_catalog.rs
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

use super::{CatalogInspector, GlobalsSnapshot, Role, Tablespace, classify_sqlx_error};
use crate::config::ConnectionTarget;
use crate::errors::Result;

/// Catalog queries through the URL's database, `postgres` when none is named.
#[derive(Debug, Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub async fn connect(server: &ConnectionTarget) -> Result<Self> {
        let entry = server.with_database(server.database_or_maintenance());
        info!(server = %entry.redacted(), "Connecting to catalog");
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(15))
            .connect(entry.connection_url())
            .await
            .map_err(|e| classify_sqlx_error(e, &format!("connecting to {}", entry.redacted())))?;
        Ok(Self { pool })
    }

    /// The pool is shared with [`crate::restore::target_db::PgAdmin`].
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl CatalogInspector for PgCatalog {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| classify_sqlx_error(e, "checking connectivity"))?;
        Ok(())
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT datname FROM pg_database WHERE datistemplate = false AND datallowconn = true ORDER BY datname",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error(e, "listing databases"))?;

        let names = rows
            .iter()
            .map(|row| row.try_get::<String, _>("datname"))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| classify_sqlx_error(e, "reading datname"))?;
        debug!(count = names.len(), "Found databases");
        Ok(names)
    }

    async fn database_exists(&self, name: &str) -> Result<bool> {
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(name)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| classify_sqlx_error(e, &format!("checking whether database '{}' exists", name)))
    }

    async fn snapshot_globals(&self) -> Result<GlobalsSnapshot> {
        // pg_authid rather than pg_roles: only a superuser may read it, the
        // same privilege pg_dumpall --globals-only needs.
        let roles = sqlx::query_as::<_, (String, bool, bool)>(
            "SELECT rolname, rolsuper, rolcanlogin FROM pg_catalog.pg_authid ORDER BY rolname",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error(e, "reading roles from pg_authid"))?
        .into_iter()
        .map(|(name, superuser, can_login)| Role { name, superuser, can_login })
        .collect();

        let tablespaces = sqlx::query_as::<_, (String, String, String)>(
            "SELECT spcname, pg_catalog.pg_get_userbyid(spcowner), pg_catalog.pg_tablespace_location(oid) \
             FROM pg_catalog.pg_tablespace ORDER BY spcname",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error(e, "reading tablespaces"))?
        .into_iter()
        .map(|(name, owner, location)| Tablespace { name, owner, location })
        .collect();

        Ok(GlobalsSnapshot { roles, tablespaces })
    }

    async fn index_operator_classes(&self) -> Result<BTreeMap<String, Vec<String>>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT am.amname, opc.opcname \
             FROM pg_catalog.pg_opclass opc \
             JOIN pg_catalog.pg_am am ON am.oid = opc.opcmethod \
             WHERE am.amtype = 'i' \
             ORDER BY am.amname, opc.opcname",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error(e, "reading operator classes"))?;

        let mut by_method: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (method, opclass) in rows {
            by_method.entry(method).or_default().push(opclass);
        }
        Ok(by_method)
    }
}
