/// Result of a completed tool execution.
use std::path::PathBuf;
use std::time::Duration;

/// Outcome of a successful `execute()` call. Not retained by the core.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub tool_id: String,
    /// Resolved executable that was spawned.
    pub program: PathBuf,
    pub args: Vec<String>,
    pub exit_code: i32,
    /// Empty when output capture was disabled.
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ExecutionResult {
    /// Stdout split into non-empty trimmed lines.
    pub fn stdout_lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines().map(str::trim).filter(|l| !l.is_empty())
    }
}
