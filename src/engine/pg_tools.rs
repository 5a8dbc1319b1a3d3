// pgvault/src/engine/pg_tools.rs
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};
use which::which;

use super::{EngineTools, Tool, ToolInvocation, ToolOutput};
use crate::errors::{OrchestratorError, Result};

/// Runs the real PostgreSQL client binaries.
#[derive(Debug, Clone, Default)]
pub struct PgClientTools {
    bin_dir: Option<PathBuf>,
}

impl PgClientTools {
    /// Binaries are looked up in `bin_dir` when given, otherwise in PATH.
    pub fn new(bin_dir: Option<PathBuf>) -> Self {
        Self { bin_dir }
    }

    fn locate(&self, tool: Tool) -> Result<PathBuf> {
        if let Some(dir) = &self.bin_dir {
            let candidate = dir.join(tool.binary());
            if candidate.is_file() {
                return Ok(candidate);
            }
            return Err(OrchestratorError::Configuration(format!(
                "{} not found in {}",
                tool,
                dir.display()
            )));
        }
        which(tool.binary()).map_err(|_| {
            OrchestratorError::Configuration(format!(
                "{} executable not found in PATH. Please ensure PostgreSQL client tools are installed and in your PATH.",
                tool
            ))
        })
    }
}

#[async_trait]
impl EngineTools for PgClientTools {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput> {
        let path = self.locate(invocation.tool)?;
        debug!(binary = %path.display(), "Resolved client tool");
        info!(command = %invocation.display_command(), "Running {}", invocation.tool);

        let mut command = Command::new(&path);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Cancelling the flow drops this future and terminates the child.
            .kill_on_drop(true);
        if let Some(password) = &invocation.password {
            command.env("PGPASSWORD", password);
        }

        let output = command.output().await?;
        let result = ToolOutput {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!(
            tool = %invocation.tool,
            status = %result.status_label(),
            stderr_bytes = result.stderr.len(),
            "Client tool finished"
        );
        Ok(result)
    }
}
