use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::error::CondaStoreError;

/// Receives the per-line output of build scoped operations. The build task
/// wires this to the build's LOGS artifact; solves use [`NullSink`].
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn append(&self, line: &str);
}

/// Discards everything.
pub struct NullSink;

#[async_trait]
impl LogSink for NullSink {
    async fn append(&self, _line: &str) {}
}

/// Collects lines in memory; test helper.
#[derive(Default)]
pub struct MemorySink {
    lines: parking_lot::Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

#[async_trait]
impl LogSink for MemorySink {
    async fn append(&self, line: &str) {
        self.lines.lock().push(line.to_string());
    }
}

/// The execution context handed to plugin hooks and build actions: a log
/// sink plus the stage prefix identifying the producing step in the shared
/// build log.
#[derive(Clone)]
pub struct PluginContext {
    sink: Arc<dyn LogSink>,
    prefix: String,
}

impl PluginContext {
    pub fn new(sink: Arc<dyn LogSink>, prefix: impl Into<String>) -> Self {
        Self {
            sink,
            prefix: prefix.into(),
        }
    }

    /// The same sink under a different stage prefix.
    pub fn with_prefix(&self, prefix: impl Into<String>) -> Self {
        Self {
            sink: self.sink.clone(),
            prefix: prefix.into(),
        }
    }

    /// Appends one line to the build log. Empty lines are skipped, the stage
    /// prefix is applied per line.
    pub async fn log(&self, line: &str) {
        if line.is_empty() {
            return;
        }
        self.sink.append(&format!("{}{}", self.prefix, line)).await;
    }

    /// Runs a command streaming stdout and stderr line-by-line into the log
    /// sink. Returns [`CondaStoreError::ExternalCommandFailed`] on a
    /// non-zero exit; the output is only in the log.
    pub async fn run_command(&self, command: &mut Command) -> Result<(), CondaStoreError> {
        self.run_streaming(command, false).await.map(|_| ())
    }

    /// Like [`PluginContext::run_command`] but captures stdout for the
    /// caller while stderr still streams into the log.
    pub async fn run_command_output(&self, command: &mut Command) -> Result<String, CondaStoreError> {
        self.run_streaming(command, true).await
    }

    async fn run_streaming(
        &self,
        command: &mut Command,
        capture_stdout: bool,
    ) -> Result<String, CondaStoreError> {
        let described = describe_command(command);
        self.log(&format!("Running command: {described}")).await;

        let mut child = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stderr = child.stderr.take();
        let stderr_task = stderr.map(|stderr| {
            let context = self.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    context.log(&line).await;
                }
            })
        });

        let mut captured = String::new();
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                if capture_stdout {
                    captured.push_str(&line);
                    captured.push('\n');
                } else {
                    self.log(&line).await;
                }
            }
        }

        let status = child.wait().await?;
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        if !status.success() {
            return Err(CondaStoreError::ExternalCommandFailed {
                command: described,
                status: status.to_string(),
            });
        }
        Ok(captured)
    }
}

fn describe_command(command: &Command) -> String {
    let std_command = command.as_std();
    let mut parts = vec![std_command.get_program().to_string_lossy().to_string()];
    parts.extend(
        std_command
            .get_args()
            .map(|arg| arg.to_string_lossy().to_string()),
    );
    parts.join(" ")
}
