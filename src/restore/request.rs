// pgvault/src/restore/request.rs
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreMode {
    /// The orchestrator creates the destination, then restores into it.
    CreateNew,
    /// The destination must already exist. Restore only adds objects.
    #[default]
    RestoreIntoExisting,
    /// The artifact's own creation metadata creates the destination
    /// (`pg_restore --create`, or an embedded `CREATE DATABASE`).
    CreateAndRestore,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    #[default]
    StopOnFirstError,
    ContinueOnError,
}

/// Subset of an archive to restore. Empty means everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectSelection {
    pub schemas: Vec<String>,
    pub tables: Vec<String>,
    pub indexes: Vec<String>,
    pub functions: Vec<String>,
    pub triggers: Vec<String>,
    pub data_only: bool,
    pub schema_only: bool,
}

impl ObjectSelection {
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
            && self.tables.is_empty()
            && self.indexes.is_empty()
            && self.functions.is_empty()
            && self.triggers.is_empty()
            && !self.data_only
            && !self.schema_only
    }

    pub fn restore_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.data_only {
            args.push("--data-only".to_string());
        }
        if self.schema_only {
            args.push("--schema-only".to_string());
        }
        let filters = [
            ("--schema", &self.schemas),
            ("--table", &self.tables),
            ("--index", &self.indexes),
            ("--function", &self.functions),
            ("--trigger", &self.triggers),
        ];
        for (flag, names) in filters {
            args.extend(names.iter().map(|name| format!("{}={}", flag, name)));
        }
        args
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreRequest {
    pub destination: String,
    pub mode: RestoreMode,
    pub clean_first: bool,
    pub jobs: usize,
    pub error_policy: ErrorPolicy,
    pub selection: ObjectSelection,
}

impl RestoreRequest {
    pub fn new(destination: impl Into<String>, mode: RestoreMode) -> Self {
        Self {
            destination: destination.into(),
            mode,
            clean_first: false,
            jobs: 1,
            error_policy: ErrorPolicy::default(),
            selection: ObjectSelection::default(),
        }
    }

    pub fn clean_first(mut self, clean: bool) -> Self {
        self.clean_first = clean;
        self
    }

    pub fn jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    pub fn selection(mut self, selection: ObjectSelection) -> Self {
        self.selection = selection;
        self
    }
}
