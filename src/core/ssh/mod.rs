//! Remote shell sessions.
//!
//! - `client` - process-backed `ssh`/`sshpass` implementation
//!
//! [`Connector`] and [`RemoteSession`] are the seam the engine depends on.
//! [`Session`] wraps any remote session and records one [`LogRecord`] per
//! invocation.

mod client;
#[cfg(test)]
pub(crate) mod fake;

pub use client::{is_local_host, SshConnector, SshSession};

use crate::error::{Error, ErrorCode, Result};
use crate::join::mask_tokens;
use crate::logs::{append_best_effort, LogRecord, LogSink, LogStatus};
use crate::node::Node;
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Combined stdout/stderr, one `\n`-terminated line per output line.
    pub output: String,
    pub success: bool,
    pub exit_code: i32,
}

pub trait RemoteSession: Send {
    fn node(&self) -> &Node;

    /// Run to completion and return the combined output.
    fn run_buffered(&mut self, command: &str) -> Result<CommandOutput>;

    /// Run, calling `on_line` once per output line in arrival order. The
    /// accumulated output is still returned at the end.
    fn run_streaming(
        &mut self,
        command: &str,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<CommandOutput>;

    /// Copy a controller-local file to `remote_path` on the node.
    fn upload(&mut self, local_path: &Path, remote_path: &str) -> Result<CommandOutput>;
}

pub trait Connector: Send + Sync {
    fn connect(&self, node: &Node) -> Result<Box<dyn RemoteSession>>;
}

/// A connected session that reports every invocation to the log sink.
pub struct Session {
    inner: Box<dyn RemoteSession>,
    sink: Arc<dyn LogSink>,
    run_id: Option<String>,
}

impl Session {
    pub fn new(inner: Box<dyn RemoteSession>, sink: Arc<dyn LogSink>, run_id: Option<String>) -> Self {
        Self {
            inner,
            sink,
            run_id,
        }
    }

    pub fn node(&self) -> &Node {
        self.inner.node()
    }

    pub fn run_buffered(&mut self, operation: &str, command: &str) -> Result<CommandOutput> {
        let started_at = Utc::now();
        let result = self.inner.run_buffered(command);
        self.record(operation, command, started_at, &result);
        result.map_err(masked)
    }

    pub fn run_streaming(
        &mut self,
        operation: &str,
        command: &str,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<CommandOutput> {
        let started_at = Utc::now();
        let result = self.inner.run_streaming(command, on_line);
        self.record(operation, command, started_at, &result);
        result.map_err(masked)
    }

    pub fn upload(&mut self, local_path: &Path, remote_path: &str) -> Result<CommandOutput> {
        let started_at = Utc::now();
        let result = self.inner.upload(local_path, remote_path);
        let description = format!("upload {} -> {}", local_path.display(), remote_path);
        self.record("upload", &description, started_at, &result);
        result
    }

    fn record(
        &self,
        operation: &str,
        command: &str,
        started_at: chrono::DateTime<Utc>,
        result: &Result<CommandOutput>,
    ) {
        let (status, output) = match result {
            Ok(out) if out.success => (LogStatus::Success, out.output.clone()),
            Ok(out) => (LogStatus::Failed, out.output.clone()),
            Err(err) if err.code == ErrorCode::RemoteCommandTimeout => {
                (LogStatus::Timeout, err.message.clone())
            }
            Err(err) => (LogStatus::Failed, err.message.clone()),
        };

        let node = self.inner.node();
        let record = LogRecord {
            run_id: self.run_id.clone(),
            node_id: node.id.clone(),
            node_name: node.label().to_string(),
            operation: operation.to_string(),
            command: mask_tokens(command).into_owned(),
            output: mask_tokens(&output).into_owned(),
            status,
            started_at,
            finished_at: Utc::now(),
        };
        append_best_effort(self.sink.as_ref(), &record);
    }
}

/// Errors carry the failing command in their details; keep tokens out of it.
fn masked(mut err: Error) -> Error {
    if let Some(command) = err.details.get_mut("command") {
        if let Some(text) = command.as_str().map(|t| mask_tokens(t).into_owned()) {
            *command = serde_json::Value::String(text);
        }
    }
    err
}
