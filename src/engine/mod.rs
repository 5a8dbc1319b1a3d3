//! The PostgreSQL client tools, seen as a black box.
//!
//! Components build a [`ToolInvocation`] and hand it to an [`EngineTools`]
//! implementation. Exit status is binary from our side: anything but zero is
//! a failure, with stderr attached.

pub mod pg_tools;

use async_trait::async_trait;
use std::fmt;

use crate::errors::{OrchestratorError, Result};

pub use pg_tools::PgClientTools;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    PgDump,
    PgDumpAll,
    PgBaseBackup,
    Psql,
    PgRestore,
}

impl Tool {
    pub fn binary(self) -> &'static str {
        match self {
            Tool::PgDump => "pg_dump",
            Tool::PgDumpAll => "pg_dumpall",
            Tool::PgBaseBackup => "pg_basebackup",
            Tool::Psql => "psql",
            Tool::PgRestore => "pg_restore",
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub tool: Tool,
    pub args: Vec<String>,
    /// Exported as `PGPASSWORD`, never placed on the command line.
    pub password: Option<String>,
}

impl ToolInvocation {
    pub fn new(tool: Tool) -> Self {
        Self {
            tool,
            args: Vec::new(),
            password: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn arg_if(self, condition: bool, arg: impl Into<String>) -> Self {
        if condition { self.arg(arg) } else { self }
    }

    pub fn password(mut self, password: Option<&str>) -> Self {
        self.password = password.map(str::to_string);
        self
    }

    pub fn has_arg(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a == arg)
    }

    /// Value of a `--name=value` argument.
    pub fn value_of(&self, name: &str) -> Option<&str> {
        let prefix = format!("{}=", name);
        self.args.iter().find_map(|a| a.strip_prefix(prefix.as_str()))
    }

    /// Command line as it would be typed, for logs.
    pub fn display_command(&self) -> String {
        let mut line = self.tool.binary().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn status_label(&self) -> String {
        match self.exit_code {
            Some(code) => format!("exit code {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

#[async_trait]
pub trait EngineTools: Send + Sync {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput>;
}

/// Maps a failed tool run with no object-level diagnostics onto the error
/// taxonomy, by looking for the libpq messages that identify the cause.
pub fn classify_tool_failure(tool: Tool, output: &ToolOutput) -> OrchestratorError {
    let stderr = output.stderr.trim().to_string();
    let lowered = stderr.to_lowercase();

    let connectivity = [
        "could not connect",
        "connection to server",
        "could not translate host name",
        "server closed the connection",
        "no route to host",
    ];
    let authorization = [
        "permission denied",
        "must be superuser",
        "password authentication failed",
        "no pg_hba.conf entry",
        "must have replication privilege",
    ];

    if authorization.iter().any(|needle| lowered.contains(needle)) {
        OrchestratorError::Authorization(format!("{}: {}", tool, stderr))
    } else if connectivity.iter().any(|needle| lowered.contains(needle)) {
        OrchestratorError::Connectivity(format!("{}: {}", tool, stderr))
    } else {
        OrchestratorError::FatalEngine {
            tool: tool.to_string(),
            status: output.status_label(),
            stderr,
        }
    }
}
