/// Error taxonomy for mounting, discovery and execution.
///
/// Identification and permission failures are raised before any OS resource
/// is touched. Per-backend failures are collected into [`BackendAttempt`]s and
/// only surface through the aggregated [`MountError::MountFailed`].
/// Execution errors always carry whatever stdout/stderr was captured.
use crate::model::{ExecutionResult, ImageType, MountBackend};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Output captured from a child process before it exited or was killed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }
}

/// One failed backend candidate during mount fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendAttempt {
    pub backend: MountBackend,
    pub reason: AttemptFailure,
}

impl fmt::Display for BackendAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.backend, self.reason)
    }
}

/// Why a single backend candidate did not produce a mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptFailure {
    /// The external tool the backend drives could not be discovered.
    ToolNotFound { tool_id: String, suggestion: String },
    /// The backend needs elevation the process does not have.
    PermissionDenied,
    /// A prerequisite other than a tool is missing (no free NBD device, ...).
    Unavailable(String),
    /// The backend ran and failed. `output` is whatever the failing tool
    /// printed, including partial output of a timed-out run.
    Failed {
        reason: String,
        output: Option<CapturedOutput>,
    },
}

impl AttemptFailure {
    /// A failure with no tool output attached.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
            output: None,
        }
    }

    /// The tool exited successfully but its output could not be used.
    pub fn unusable_output(reason: impl Into<String>, result: ExecutionResult) -> Self {
        let output = CapturedOutput {
            stdout: result.stdout,
            stderr: result.stderr,
        };
        Self::Failed {
            reason: reason.into(),
            output: (!output.is_empty()).then_some(output),
        }
    }

    /// Output captured from the tool that failed, if any.
    pub fn output(&self) -> Option<&CapturedOutput> {
        match self {
            Self::Failed { output, .. } => output.as_ref(),
            _ => None,
        }
    }

    /// True when the backend never ran because something it needs is absent.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::ToolNotFound { .. } | Self::Unavailable(_))
    }
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ToolNotFound { .. } => f.write_str("tool not found"),
            Self::PermissionDenied => f.write_str("permission denied"),
            Self::Unavailable(msg) => write!(f, "unavailable ({msg})"),
            Self::Failed { reason, output } => {
                f.write_str(reason)?;
                // stdout (and stderr of a timed-out run) is not part of the
                // exec error's message.
                if let Some(output) = output {
                    for stream in [&output.stdout, &output.stderr] {
                        let text = stream.trim();
                        if !text.is_empty() && !reason.contains(text) {
                            write!(f, " [{text}]")?;
                        }
                    }
                }
                Ok(())
            }
        }
    }
}

impl From<ExecError> for AttemptFailure {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::ToolNotFound {
                tool_id,
                suggestion,
            } => Self::ToolNotFound {
                tool_id,
                suggestion,
            },
            other => Self::Failed {
                output: other.captured().filter(|o| !o.is_empty()),
                reason: other.to_string(),
            },
        }
    }
}

/// Errors from [`crate::platform::PlatformAdapter`] and
/// [`crate::registry::MountRegistry`].
#[derive(Debug, Error)]
pub enum MountError {
    #[error("no {platform} mount backend supports {image_type} images ({path})")]
    UnsupportedFormat {
        path: PathBuf,
        image_type: ImageType,
        platform: &'static str,
    },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("mount backend unavailable: {missing}. {guidance}")]
    BackendUnavailable { missing: String, guidance: String },

    #[error("all mount backends failed for {}: {}", path.display(), join_attempts(attempts))]
    MountFailed {
        path: PathBuf,
        attempts: Vec<BackendAttempt>,
    },

    #[error("failed to unmount {}: {reason}", mount_point.display())]
    UnmountFailed { mount_point: PathBuf, reason: String },

    #[error("mount point pool exhausted ({capacity} slots in use)")]
    PoolExhausted { capacity: usize },

    #[error("{} is already mounted at {}", path.display(), mount_point.display())]
    AlreadyMounted { path: PathBuf, mount_point: PathBuf },

    #[error("{} is not a free mount point in this adapter's pool", .0.display())]
    InvalidMountPoint(PathBuf),

    #[error("image not found: {}", .0.display())]
    ImageNotFound(PathBuf),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl MountError {
    /// The per-backend failures, when this is an aggregated mount failure.
    pub fn attempts(&self) -> &[BackendAttempt] {
        match self {
            Self::MountFailed { attempts, .. } => attempts,
            _ => &[],
        }
    }
}

fn join_attempts(attempts: &[BackendAttempt]) -> String {
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors from [`crate::exec::CommandExecutor`] and
/// [`crate::tools::ToolDiscovery`].
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("tool '{tool_id}' not found. {suggestion}")]
    ToolNotFound { tool_id: String, suggestion: String },

    #[error("'{tool_id}' timed out after {timeout:?}")]
    ExecutionTimeout {
        tool_id: String,
        timeout: Duration,
        partial: CapturedOutput,
    },

    #[error("'{tool_id}' was cancelled")]
    Cancelled {
        tool_id: String,
        partial: CapturedOutput,
    },

    #[error("'{tool_id}' failed with exit code {}: {}", display_code(*exit_code), stderr.trim())]
    ToolExecutionFailed {
        tool_id: String,
        /// `None` when the process was terminated by a signal.
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("failed to run '{tool_id}': {source}")]
    Spawn {
        tool_id: String,
        #[source]
        source: std::io::Error,
    },
}

impl ExecError {
    /// Output captured before the failure, if any was collected.
    pub fn captured(&self) -> Option<CapturedOutput> {
        match self {
            Self::ExecutionTimeout { partial, .. } | Self::Cancelled { partial, .. } => {
                Some(partial.clone())
            }
            Self::ToolExecutionFailed { stdout, stderr, .. } => Some(CapturedOutput {
                stdout: stdout.clone(),
                stderr: stderr.clone(),
            }),
            _ => None,
        }
    }
}

fn display_code(code: Option<i32>) -> String {
    code.map_or_else(|| "none (signal)".to_owned(), |c| c.to_string())
}

/// Errors while loading a [`crate::tools::ToolCatalog`].
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read tool catalog {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid tool catalog: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("duplicate tool id '{0}' in catalog")]
    DuplicateId(String),

    #[error("tool '{0}' declares no executable names")]
    NoExecutables(String),
}

/// Errors while loading [`crate::config::ElrondConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}
