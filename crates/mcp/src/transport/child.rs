use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use super::McpTransport;
use crate::error::McpError;

/// Child-process transport speaking newline-delimited JSON over the
/// server's stdin/stdout. Server stderr is forwarded to the log.
pub struct ChildProcessTransport {
    child: Child,
    reader: Lines<BufReader<ChildStdout>>,
    writer: ChildStdin,
}

impl ChildProcessTransport {
    /// Spawn the server process with stdin/stdout piped.
    pub fn spawn(
        program: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
        cwd: Option<&Path>,
    ) -> Result<Self, McpError> {
        tracing::info!(program = %program, "Spawning MCP server process");

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| McpError::Connection(format!("failed to spawn '{program}': {e}")))?;

        let writer = child.stdin.take().ok_or_else(|| {
            McpError::Connection("Failed to capture server stdin".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            McpError::Connection("Failed to capture server stdout".to_string())
        })?;

        if let Some(stderr) = child.stderr.take() {
            let program = program.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(program = %program, "{line}");
                }
            });
        }

        Ok(Self {
            child,
            reader: BufReader::new(stdout).lines(),
            writer,
        })
    }
}

#[async_trait]
impl McpTransport for ChildProcessTransport {
    async fn receive(&mut self) -> Result<Option<String>, McpError> {
        loop {
            match self.reader.next_line().await? {
                None => return Ok(None),
                Some(line) => {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        return Ok(Some(trimmed.to_string()));
                    }
                }
            }
        }
    }

    async fn send(&mut self, message: &str) -> Result<(), McpError> {
        self.writer.write_all(message.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), McpError> {
        tracing::info!("Shutting down MCP server process");
        let _ = self.child.kill().await;
        Ok(())
    }
}
