//! Running payloads is delegated to the host.

use std::process::Stdio;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::ExecutionError;

/// Environment variable carrying the JSON bindings for [`ProcessExecutor`].
pub const BINDINGS_ENV: &str = "BUNDLE_BINDINGS";

/// Host capability that runs payload code in its own sandbox.
#[async_trait]
pub trait CodeExecutor: Send + Sync {
    async fn execute(
        &self,
        code: &str,
        bindings: &Map<String, Value>,
    ) -> Result<Value, ExecutionError>;
}

/// Runs payloads by piping them to an external interpreter such as `node`.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    program: String,
    args: Vec<String>,
}

impl ProcessExecutor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

#[async_trait]
impl CodeExecutor for ProcessExecutor {
    async fn execute(
        &self,
        code: &str,
        bindings: &Map<String, Value>,
    ) -> Result<Value, ExecutionError> {
        let bindings = serde_json::to_string(bindings)
            .map_err(|err| ExecutionError::Unavailable(format!("bindings: {err}")))?;
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env(BINDINGS_ENV, bindings)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| ExecutionError::Unavailable(format!("{}: {err}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(code.as_bytes())
                .await
                .map_err(|err| ExecutionError::Failed(format!("writing payload: {err}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|err| ExecutionError::Failed(err.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ExecutionError::Failed(if stderr.is_empty() {
                format!("interpreter exited with {}", output.status)
            } else {
                stderr
            }));
        }
        Ok(Value::String(
            String::from_utf8_lossy(&output.stdout).into_owned(),
        ))
    }
}
