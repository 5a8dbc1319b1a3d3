// pgvault/src/testing.rs
//! In-memory stand-in for a PostgreSQL server and its client tools.
//!
//! `FakePg` implements [`EngineTools`], [`CatalogInspector`] and
//! [`DatabaseAdmin`] over one shared cluster state, so a test can export
//! from one fake and restore into another without a running server. The
//! files it writes are real: plain dumps are SQL, archives carry the
//! magic bytes the format sniffer looks for.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::backup::artifact::{ArtifactRecord, BackupArtifact, BackupScope, DumpFormat};
use crate::catalog::{CatalogInspector, GlobalsSnapshot, Role, Tablespace};
use crate::config::ConnectionTarget;
use crate::config::connection::MAINTENANCE_DATABASE;
use crate::engine::{EngineTools, Tool, ToolInvocation, ToolOutput};
use crate::errors::{OrchestratorError, Result};
use crate::restore::target_db::DatabaseAdmin;

const ARCHIVE_MAGIC: &str = "PGDMP";
const TAR_HEADER_LEN: usize = 512;

type Objects = BTreeSet<(String, String)>;

#[derive(Debug)]
struct Cluster {
    reachable: bool,
    superuser: bool,
    databases: BTreeMap<String, Objects>,
    roles: BTreeSet<String>,
    tablespaces: BTreeMap<String, (String, String)>,
    directories: BTreeSet<String>,
    export_failure: Option<String>,
    applied: Vec<String>,
    invocations: Vec<ToolInvocation>,
}

impl Default for Cluster {
    fn default() -> Self {
        let mut databases = BTreeMap::new();
        databases.insert(MAINTENANCE_DATABASE.to_string(), Objects::new());
        Self {
            reachable: true,
            superuser: true,
            databases,
            roles: BTreeSet::new(),
            tablespaces: BTreeMap::new(),
            directories: BTreeSet::new(),
            export_failure: None,
            applied: Vec::new(),
            invocations: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakePg {
    cluster: Arc<Mutex<Cluster>>,
}

fn finished(success: bool, code: i32, stderr: String) -> ToolOutput {
    ToolOutput {
        success,
        exit_code: Some(code),
        stdout: String::new(),
        stderr,
    }
}

fn database_of(invocation: &ToolInvocation) -> String {
    invocation
        .value_of("--dbname")
        .and_then(|raw| ConnectionTarget::parse(raw).ok())
        .map(|target| target.database_or_maintenance().to_string())
        .unwrap_or_else(|| MAINTENANCE_DATABASE.to_string())
}

fn missing_database(tool: Tool, database: &str) -> ToolOutput {
    finished(
        false,
        1,
        format!(
            "{}: error: connection to server at \"localhost\" (127.0.0.1), port 5432 failed: FATAL:  database \"{}\" does not exist\n",
            tool, database
        ),
    )
}

fn object_sql(kind: &str, name: &str) -> String {
    match kind {
        "INDEX" => format!("CREATE INDEX {} ON public.placeholder (id);", name),
        "VIEW" => format!("CREATE VIEW {} AS SELECT 1;", name),
        "SEQUENCE" => format!("CREATE SEQUENCE {};", name),
        _ => format!("CREATE TABLE {} (id integer);", name),
    }
}

/// Archive bodies are one `KIND name` entry per line behind the format's
/// header. A `DATABASE` entry names the source database.
fn archive_body(database: &str, objects: &Objects) -> String {
    let mut body = format!("DATABASE {}\n", database);
    for (kind, name) in objects {
        body.push_str(&format!("{} {}\n", kind, name));
    }
    body
}

fn read_archive(path: &Path) -> std::io::Result<(Option<String>, Vec<(String, String)>)> {
    let text = if path.is_dir() {
        fs::read_to_string(path.join("toc.dat"))?
    } else {
        let bytes = fs::read(path)?;
        if bytes.starts_with(ARCHIVE_MAGIC.as_bytes()) {
            String::from_utf8_lossy(&bytes).into_owned()
        } else {
            String::from_utf8_lossy(bytes.get(TAR_HEADER_LEN..).unwrap_or_default()).into_owned()
        }
    };

    let mut database = None;
    let mut entries = Vec::new();
    for line in text.lines().filter(|l| !l.starts_with(ARCHIVE_MAGIC)) {
        let Some((kind, name)) = line.trim().split_once(' ') else {
            continue;
        };
        if kind == "DATABASE" {
            database = Some(name.to_string());
        } else {
            entries.push((kind.to_string(), name.to_string()));
        }
    }
    Ok((database, entries))
}

fn write_archive(path: &Path, format: &str, body: &str) -> std::io::Result<()> {
    match format {
        "d" => {
            fs::create_dir_all(path)?;
            fs::write(path.join("toc.dat"), format!("{}\n{}", ARCHIVE_MAGIC, body))
        }
        "t" => {
            let mut bytes = vec![0u8; TAR_HEADER_LEN];
            bytes[257..262].copy_from_slice(b"ustar");
            bytes.extend_from_slice(body.as_bytes());
            fs::write(path, bytes)
        }
        _ => fs::write(path, format!("{}\n{}", ARCHIVE_MAGIC, body)),
    }
}

fn quoted(statement: &str) -> Option<String> {
    let start = statement.find('\'')? + 1;
    let end = statement[start..].find('\'')? + start;
    Some(statement[start..end].to_string())
}

fn ident(word: &str) -> String {
    word.trim_end_matches(';')
        .trim_start_matches("public.")
        .to_string()
}

/// Replays one statement against the cluster the way the server would.
/// Returns the server's error message on failure.
fn apply_statement(cluster: &mut Cluster, current: &mut String, statement: &str) -> std::result::Result<(), String> {
    let words: Vec<&str> = statement.split_whitespace().collect();
    match words.as_slice() {
        ["\\connect", name, ..] => {
            if !cluster.databases.contains_key(*name) {
                return Err(format!("database \"{}\" does not exist", name));
            }
            *current = name.to_string();
        }
        ["CREATE", "ROLE", name, ..] => {
            let name = ident(name);
            if !cluster.roles.insert(name.clone()) {
                return Err(format!("role \"{}\" already exists", name));
            }
        }
        ["DROP", "ROLE", "IF", "EXISTS", name, ..] => {
            cluster.roles.remove(&ident(name));
        }
        ["CREATE", "TABLESPACE", name, ..] => {
            let name = ident(name);
            let location = quoted(statement).unwrap_or_default();
            if cluster.tablespaces.contains_key(&name) {
                return Err(format!("tablespace \"{}\" already exists", name));
            }
            if !cluster.directories.contains(&location) {
                return Err(format!("directory \"{}\" does not exist", location));
            }
            let owner = words
                .iter()
                .position(|w| *w == "OWNER")
                .and_then(|i| words.get(i + 1))
                .map(|owner| ident(owner))
                .unwrap_or_default();
            cluster.tablespaces.insert(name, (owner, location));
        }
        ["DROP", "TABLESPACE", "IF", "EXISTS", name, ..] => {
            cluster.tablespaces.remove(&ident(name));
        }
        ["CREATE", "DATABASE", name, ..] => {
            let name = ident(name);
            if cluster.databases.contains_key(&name) {
                return Err(format!("database \"{}\" already exists", name));
            }
            cluster.databases.insert(name, Objects::new());
        }
        ["DROP", "DATABASE", "IF", "EXISTS", name, ..] => {
            cluster.databases.remove(&ident(name));
        }
        ["CREATE", kind @ ("TABLE" | "INDEX" | "VIEW" | "SEQUENCE"), name, ..] => {
            let name = ident(name);
            let objects = cluster
                .databases
                .get_mut(current.as_str())
                .ok_or_else(|| format!("database \"{}\" does not exist", current))?;
            if !objects.insert((kind.to_string(), name.clone())) {
                return Err(format!("relation \"{}\" already exists", name));
            }
        }
        _ => {}
    }
    Ok(())
}

impl FakePg {
    pub fn new() -> Self {
        Self::default()
    }

    fn cluster(&self) -> MutexGuard<'_, Cluster> {
        self.cluster.lock().expect("fake cluster lock poisoned")
    }

    pub fn add_database(&self, name: &str, objects: &[(&str, &str)]) {
        let objects = objects
            .iter()
            .map(|(kind, name)| (kind.to_string(), name.to_string()))
            .collect();
        self.cluster().databases.insert(name.to_string(), objects);
    }

    pub fn add_role(&self, name: &str) {
        self.cluster().roles.insert(name.to_string());
    }

    pub fn add_tablespace(&self, name: &str, owner: &str, location: &str) {
        self.cluster()
            .tablespaces
            .insert(name.to_string(), (owner.to_string(), location.to_string()));
    }

    /// Makes `path` available as a tablespace location.
    pub fn add_directory(&self, path: &str) {
        self.cluster().directories.insert(path.to_string());
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.cluster().reachable = reachable;
    }

    pub fn set_superuser(&self, superuser: bool) {
        self.cluster().superuser = superuser;
    }

    /// Every later export writes partial output, then exits 1 with `stderr`.
    pub fn fail_exports_with(&self, stderr: &str) {
        self.cluster().export_failure = Some(stderr.to_string());
    }

    pub fn has_database(&self, name: &str) -> bool {
        self.cluster().databases.contains_key(name)
    }

    pub fn objects(&self, database: &str) -> Vec<(String, String)> {
        self.cluster()
            .databases
            .get(database)
            .map(|objects| objects.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn roles(&self) -> Vec<String> {
        self.cluster().roles.iter().cloned().collect()
    }

    /// Statements psql executed successfully, in order.
    pub fn applied_statements(&self) -> Vec<String> {
        self.cluster().applied.clone()
    }

    pub fn invocations(&self) -> Vec<ToolInvocation> {
        self.cluster().invocations.clone()
    }

    pub fn last_invocation(&self) -> Option<ToolInvocation> {
        self.cluster().invocations.last().cloned()
    }

    fn globals_script(cluster: &Cluster, clean: bool) -> String {
        let mut script = String::from("--\n-- PostgreSQL database cluster dump\n--\n\n");
        if clean {
            for role in &cluster.roles {
                script.push_str(&format!("DROP ROLE IF EXISTS {};\n", role));
            }
        }
        for role in &cluster.roles {
            script.push_str(&format!("CREATE ROLE {};\n", role));
        }
        for (name, (owner, location)) in &cluster.tablespaces {
            script.push_str(&format!("CREATE TABLESPACE {} OWNER {} LOCATION '{}';\n", name, owner, location));
        }
        script
    }

    fn pg_dump(cluster: &mut Cluster, invocation: &ToolInvocation, output: &Path) -> std::io::Result<ToolOutput> {
        let database = database_of(invocation);
        let Some(objects) = cluster.databases.get(&database) else {
            return Ok(missing_database(Tool::PgDump, &database));
        };

        match invocation.value_of("--format").unwrap_or("p") {
            "p" => {
                let mut script = String::from("--\n-- PostgreSQL database dump\n--\n\n");
                if invocation.has_arg("--clean") && invocation.has_arg("--create") {
                    script.push_str(&format!("DROP DATABASE IF EXISTS {};\n", database));
                }
                if invocation.has_arg("--create") {
                    script.push_str(&format!("CREATE DATABASE {};\n\\connect {}\n", database, database));
                }
                for (kind, name) in objects {
                    script.push_str(&object_sql(kind, name));
                    script.push('\n');
                }
                fs::write(output, script)?;
            }
            format => write_archive(output, format, &archive_body(&database, objects))?,
        }
        Ok(finished(true, 0, String::new()))
    }

    fn pg_dumpall(cluster: &mut Cluster, invocation: &ToolInvocation, output: &Path) -> std::io::Result<ToolOutput> {
        if !cluster.superuser {
            return Ok(finished(
                false,
                1,
                "pg_dumpall: error: query failed: ERROR:  permission denied for table pg_authid\n".to_string(),
            ));
        }
        let clean = invocation.has_arg("--clean");
        let mut script = Self::globals_script(cluster, clean);
        if !invocation.has_arg("--globals-only") {
            for (database, objects) in &cluster.databases {
                if database == MAINTENANCE_DATABASE {
                    continue;
                }
                if clean {
                    script.push_str(&format!("DROP DATABASE IF EXISTS {};\n", database));
                }
                script.push_str(&format!("CREATE DATABASE {};\n\\connect {}\n", database, database));
                for (kind, name) in objects {
                    script.push_str(&object_sql(kind, name));
                    script.push('\n');
                }
            }
        }
        fs::write(output, script)?;
        Ok(finished(true, 0, String::new()))
    }

    fn pg_basebackup(output: &Path) -> std::io::Result<ToolOutput> {
        fs::create_dir_all(output)?;
        fs::write(output.join("PG_VERSION"), "16\n")?;
        fs::write(output.join("backup_label"), "START WAL LOCATION: 0/2000028\n")?;
        Ok(finished(true, 0, String::new()))
    }

    fn psql(cluster: &mut Cluster, invocation: &ToolInvocation) -> std::io::Result<ToolOutput> {
        let mut current = database_of(invocation);
        if !cluster.databases.contains_key(&current) {
            return Ok(missing_database(Tool::Psql, &current));
        }
        let file = invocation.value_of("--file").unwrap_or_default().to_string();
        let script = fs::read_to_string(&file)?;
        let stop_on_error = invocation.has_arg("--set=ON_ERROR_STOP=1");

        let mut stderr = String::new();
        for (index, line) in script.lines().enumerate() {
            let statement = line.trim();
            if statement.is_empty() || statement.starts_with("--") {
                continue;
            }
            match apply_statement(cluster, &mut current, statement) {
                Ok(()) => cluster.applied.push(statement.to_string()),
                Err(message) => {
                    stderr.push_str(&format!("psql:{}:{}: ERROR:  {}\n", file, index + 1, message));
                    if stop_on_error {
                        return Ok(finished(false, 3, stderr));
                    }
                }
            }
        }
        Ok(finished(true, 0, stderr))
    }

    fn pg_restore(cluster: &mut Cluster, invocation: &ToolInvocation) -> std::io::Result<ToolOutput> {
        let archive = PathBuf::from(invocation.args.last().cloned().unwrap_or_default());
        let (source_database, entries) = read_archive(&archive)?;
        let exit_on_error = invocation.has_arg("--exit-on-error");
        let clean = invocation.has_arg("--clean");

        let target = if invocation.has_arg("--create") {
            let name = source_database.unwrap_or_default();
            if clean {
                cluster.databases.remove(&name);
            }
            if cluster.databases.contains_key(&name) {
                let stderr = format!(
                    "pg_restore: while PROCESSING TOC:\n\
                     pg_restore: from TOC entry 4000; 1262 16384 DATABASE {} postgres\n\
                     pg_restore: error: could not execute query: ERROR:  database \"{}\" already exists\n",
                    name, name
                );
                return Ok(finished(false, 1, stderr));
            }
            cluster.databases.insert(name.clone(), Objects::new());
            name
        } else {
            let name = database_of(invocation);
            if !cluster.databases.contains_key(&name) {
                return Ok(missing_database(Tool::PgRestore, &name));
            }
            name
        };

        let tables: Vec<&str> = invocation.args.iter().filter_map(|a| a.strip_prefix("--table=")).collect();
        let indexes: Vec<&str> = invocation.args.iter().filter_map(|a| a.strip_prefix("--index=")).collect();
        let selected = |kind: &str, name: &str| {
            if tables.is_empty() && indexes.is_empty() {
                return true;
            }
            (kind == "TABLE" && tables.contains(&name)) || (kind == "INDEX" && indexes.contains(&name))
        };

        let objects = cluster.databases.entry(target).or_default();
        let mut stderr = String::new();
        let mut errors = 0;
        for (position, (kind, name)) in entries.iter().enumerate() {
            if !selected(kind, name) {
                continue;
            }
            if clean {
                objects.remove(&(kind.clone(), name.clone()));
            }
            if objects.insert((kind.clone(), name.clone())) {
                continue;
            }
            errors += 1;
            if errors == 1 {
                stderr.push_str("pg_restore: while PROCESSING TOC:\n");
            }
            stderr.push_str(&format!(
                "pg_restore: from TOC entry {}; 1259 {} {} {} postgres\n\
                 pg_restore: error: could not execute query: ERROR:  relation \"{}\" already exists\n",
                200 + position,
                16386 + position,
                kind,
                name,
                name
            ));
            if exit_on_error {
                return Ok(finished(false, 1, stderr));
            }
        }
        if errors > 0 {
            stderr.push_str(&format!("pg_restore: warning: errors ignored on restore: {}\n", errors));
            return Ok(finished(false, 1, stderr));
        }
        Ok(finished(true, 0, stderr))
    }
}

#[async_trait]
impl EngineTools for FakePg {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput> {
        let mut cluster = self.cluster();
        cluster.invocations.push(invocation.clone());
        if !cluster.reachable {
            return Ok(finished(
                false,
                2,
                format!(
                    "{}: error: connection to server at \"localhost\" (127.0.0.1), port 5432 failed: Connection refused\n",
                    invocation.tool
                ),
            ));
        }

        let output_path = invocation
            .value_of("--file")
            .or_else(|| invocation.value_of("--pgdata"))
            .map(PathBuf::from);

        let is_export = matches!(invocation.tool, Tool::PgDump | Tool::PgDumpAll | Tool::PgBaseBackup);
        if is_export {
            let output_path = output_path.unwrap_or_default();
            if let Some(stderr) = cluster.export_failure.clone() {
                fs::write(&output_path, "--\n-- PostgreSQL database dump\n--\n\nCREATE TA")?;
                return Ok(finished(false, 1, stderr));
            }
            return Ok(match invocation.tool {
                Tool::PgDump => Self::pg_dump(&mut cluster, invocation, &output_path)?,
                Tool::PgDumpAll => Self::pg_dumpall(&mut cluster, invocation, &output_path)?,
                _ => Self::pg_basebackup(&output_path)?,
            });
        }

        Ok(match invocation.tool {
            Tool::Psql => Self::psql(&mut cluster, invocation)?,
            _ => Self::pg_restore(&mut cluster, invocation)?,
        })
    }
}

#[async_trait]
impl CatalogInspector for FakePg {
    async fn ping(&self) -> Result<()> {
        if self.cluster().reachable {
            Ok(())
        } else {
            Err(OrchestratorError::Connectivity("connection refused".to_string()))
        }
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        self.ping().await?;
        Ok(self.cluster().databases.keys().cloned().collect())
    }

    async fn database_exists(&self, name: &str) -> Result<bool> {
        self.ping().await?;
        Ok(self.cluster().databases.contains_key(name))
    }

    async fn snapshot_globals(&self) -> Result<GlobalsSnapshot> {
        self.ping().await?;
        let cluster = self.cluster();
        if !cluster.superuser {
            return Err(OrchestratorError::Authorization(
                "reading roles: permission denied for table pg_authid".to_string(),
            ));
        }
        Ok(GlobalsSnapshot {
            roles: cluster
                .roles
                .iter()
                .map(|name| Role {
                    name: name.clone(),
                    superuser: false,
                    can_login: true,
                })
                .collect(),
            tablespaces: cluster
                .tablespaces
                .iter()
                .map(|(name, (owner, location))| Tablespace {
                    name: name.clone(),
                    owner: owner.clone(),
                    location: location.clone(),
                })
                .collect(),
        })
    }

    async fn index_operator_classes(&self) -> Result<BTreeMap<String, Vec<String>>> {
        self.ping().await?;
        let mut classes = BTreeMap::new();
        classes.insert("btree".to_string(), vec!["int4_ops".to_string(), "text_ops".to_string()]);
        classes.insert("gin".to_string(), vec!["jsonb_ops".to_string()]);
        Ok(classes)
    }
}

#[async_trait]
impl DatabaseAdmin for FakePg {
    async fn create_database(&self, name: &str, _owner: Option<&str>) -> Result<()> {
        self.ping().await?;
        let mut cluster = self.cluster();
        if cluster.databases.contains_key(name) {
            return Err(OrchestratorError::FatalEngine {
                tool: "CREATE DATABASE".to_string(),
                status: "SQLSTATE 42P04".to_string(),
                stderr: format!("database \"{}\" already exists", name),
            });
        }
        cluster.databases.insert(name.to_string(), Objects::new());
        Ok(())
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        self.ping().await?;
        self.cluster().databases.remove(name);
        Ok(())
    }
}

/// Writes a sidecar for a file the test placed in `dir` by hand.
pub fn seal_artifact(dir: &Path, scope: BackupScope, format: DumpFormat, file_name: &str) -> BackupArtifact {
    BackupArtifact::seal(
        dir,
        ArtifactRecord {
            scope,
            format,
            file_name: file_name.to_string(),
            include_create_database: false,
            include_drop_statements: false,
            server: "localhost:5432".to_string(),
        },
    )
    .expect("sidecar written")
}
