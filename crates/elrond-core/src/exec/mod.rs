/// Command execution: runs discovered tools as argument vectors.
///
/// Guarantees:
/// - No shell is involved; each argument reaches the child verbatim.
/// - The tool is resolved through [`ToolDiscovery`] *before* anything is
///   spawned, so a missing tool never leaves a half-started process.
/// - Timeouts and [`CancelToken`]s kill the entire process tree and hand
///   back whatever output had been captured up to that point.
/// - Calls share no lock; independent executions run fully in parallel.
///
/// Output is drained by one reader thread per stream so a chatty tool can
/// never block on a full pipe while the caller polls for exit.
pub mod cancel;
pub mod process_tree;

pub use cancel::CancelToken;

use crate::error::{CapturedOutput, ExecError};
use crate::model::ExecutionResult;
use crate::tools::ToolDiscovery;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::ffi::OsStr;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How often a running child is polled for exit, cancellation and timeout.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// How long reader threads may keep draining after the child has exited.
///
/// Daemonising tools (FUSE mounters) can leave a grandchild holding the
/// pipes; output is collected up to this bound and the rest abandoned.
const READER_GRACE: Duration = Duration::from_secs(1);

/// Per-call execution settings.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// `None` waits indefinitely (still cancellable).
    pub timeout: Option<Duration>,
    /// Capture stdout/stderr. When false the child inherits the caller's
    /// streams and the result's output fields are empty.
    pub capture: bool,
    pub cancel: Option<CancelToken>,
    /// Extra environment variables for the child.
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            capture: true,
            cancel: None,
            env: Vec::new(),
            working_dir: None,
        }
    }
}

impl ExecOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn maybe_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn no_capture(mut self) -> Self {
        self.capture = false;
        self
    }

    pub fn cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Executes catalog tools. Owns the [`ToolDiscovery`] instance that gives
/// the resolution cache its lifetime.
pub struct CommandExecutor {
    discovery: Arc<ToolDiscovery>,
}

impl CommandExecutor {
    pub fn new(discovery: Arc<ToolDiscovery>) -> Self {
        Self { discovery }
    }

    pub fn discovery(&self) -> &ToolDiscovery {
        &self.discovery
    }

    /// Run `tool_id` with `args`, capturing output.
    pub fn execute<S: AsRef<OsStr>>(
        &self,
        tool_id: &str,
        args: &[S],
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult, ExecError> {
        self.execute_with(tool_id, args, &ExecOptions::default().maybe_timeout(timeout))
    }

    /// Run `tool_id` with explicit options.
    pub fn execute_with<S: AsRef<OsStr>>(
        &self,
        tool_id: &str,
        args: &[S],
        opts: &ExecOptions,
    ) -> Result<ExecutionResult, ExecError> {
        let program = self.discovery.discover(tool_id)?;
        self.execute_program(tool_id, &program, args, opts)
    }

    /// Run an already-resolved executable under `tool_id`'s name.
    ///
    /// Used when a backend locates a tool outside the catalog's search
    /// paths (e.g. inside an installed PowerShell module).
    pub fn execute_program<S: AsRef<OsStr>>(
        &self,
        tool_id: &str,
        program: &Path,
        args: &[S],
        opts: &ExecOptions,
    ) -> Result<ExecutionResult, ExecError> {
        let arg_strings: Vec<String> = args
            .iter()
            .map(|a| a.as_ref().to_string_lossy().into_owned())
            .collect();

        let mut cmd = Command::new(program);
        cmd.args(args).stdin(Stdio::null());
        for (key, value) in &opts.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &opts.working_dir {
            cmd.current_dir(dir);
        }
        if opts.capture {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
        process_tree::isolate(&mut cmd);

        info!("Executing {tool_id}: {} {}", program.display(), arg_strings.join(" "));
        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
            tool_id: tool_id.to_owned(),
            source,
        })?;
        let capture = OutputCapture::start(&mut child);
        let deadline = opts.timeout.map(|t| start + t);

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(source) => {
                    process_tree::kill_tree(&mut child);
                    return Err(ExecError::Spawn {
                        tool_id: tool_id.to_owned(),
                        source,
                    });
                }
            }

            if opts.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                process_tree::kill_tree(&mut child);
                let partial = capture.finish();
                warn!("{tool_id} cancelled after {:?}", start.elapsed());
                return Err(ExecError::Cancelled {
                    tool_id: tool_id.to_owned(),
                    partial,
                });
            }

            if let (Some(deadline), Some(timeout)) = (deadline, opts.timeout) {
                if Instant::now() >= deadline {
                    process_tree::kill_tree(&mut child);
                    let partial = capture.finish();
                    warn!("{tool_id} timed out after {timeout:?}; process tree killed");
                    return Err(ExecError::ExecutionTimeout {
                        tool_id: tool_id.to_owned(),
                        timeout,
                        partial,
                    });
                }
            }

            thread::sleep(POLL_INTERVAL);
        };

        let output = capture.finish();
        let duration = start.elapsed();

        if !status.success() {
            warn!("{tool_id} exited with {status} after {duration:?}");
            return Err(ExecError::ToolExecutionFailed {
                tool_id: tool_id.to_owned(),
                exit_code: status.code(),
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }

        debug!("{tool_id} completed in {duration:?}");
        Ok(ExecutionResult {
            tool_id: tool_id.to_owned(),
            program: program.to_path_buf(),
            args: arg_strings,
            exit_code: status.code().unwrap_or(0),
            stdout: output.stdout,
            stderr: output.stderr,
            duration,
        })
    }
}

// ─── Output capture ─────────────────────────────────────────────────────────

/// Background readers draining a child's stdout and stderr into shared
/// buffers, so partial output survives a kill.
struct OutputCapture {
    stdout: Arc<Mutex<Vec<u8>>>,
    stderr: Arc<Mutex<Vec<u8>>>,
    done_rx: Receiver<()>,
    readers: usize,
}

impl OutputCapture {
    fn start(child: &mut std::process::Child) -> Self {
        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        let stdout = Arc::new(Mutex::new(Vec::new()));
        let stderr = Arc::new(Mutex::new(Vec::new()));

        let mut readers = 0;
        if let Some(pipe) = child.stdout.take() {
            spawn_reader("elrond-exec-stdout", pipe, stdout.clone(), done_tx.clone());
            readers += 1;
        }
        if let Some(pipe) = child.stderr.take() {
            spawn_reader("elrond-exec-stderr", pipe, stderr.clone(), done_tx);
            readers += 1;
        }

        Self {
            stdout,
            stderr,
            done_rx,
            readers,
        }
    }

    /// Wait (bounded) for the readers to hit EOF and snapshot the buffers.
    fn finish(self) -> CapturedOutput {
        let deadline = Instant::now() + READER_GRACE;
        for _ in 0..self.readers {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if self.done_rx.recv_timeout(remaining).is_err() {
                debug!("output readers still open after {READER_GRACE:?}; using partial output");
                break;
            }
        }
        CapturedOutput {
            stdout: String::from_utf8_lossy(&self.stdout.lock()).into_owned(),
            stderr: String::from_utf8_lossy(&self.stderr.lock()).into_owned(),
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    name: &str,
    mut pipe: R,
    sink: Arc<Mutex<Vec<u8>>>,
    done: Sender<()>,
) {
    thread::Builder::new()
        .name(name.to_owned())
        .spawn(move || {
            let mut chunk = [0u8; 8192];
            loop {
                match pipe.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => sink.lock().extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            let _ = done.send(());
        })
        .expect("failed to spawn output reader thread");
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::tools::ToolCatalog;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// Executor whose catalog maps `tool` to a script in a temp dir.
    fn executor_with_script(tmp: &TempDir, tool: &str, body: &str) -> CommandExecutor {
        let script = tmp.path().join(tool);
        std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        let json = format!(
            r#"{{"tools": [{{"id": "{tool}", "category": "test", "platforms": ["linux", "macos"],
                "executable_names": ["{tool}"],
                "search_paths": {{"linux": ["{dir}"], "macos": ["{dir}"]}}}}]}}"#,
            dir = tmp.path().display()
        );
        let catalog = Arc::new(ToolCatalog::from_json(&json).unwrap());
        CommandExecutor::new(Arc::new(ToolDiscovery::new(catalog).with_system_path(Vec::new())))
    }

    #[test]
    fn test_arguments_are_not_shell_interpreted() {
        let tmp = TempDir::new().unwrap();
        let exec = executor_with_script(&tmp, "echoargs", r#"for a in "$@"; do echo "[$a]"; done"#);
        let result = exec
            .execute("echoargs", &["a b", "$(id)", "; rm -rf /"], None)
            .unwrap();
        let lines: Vec<_> = result.stdout_lines().collect();
        assert_eq!(lines, vec!["[a b]", "[$(id)]", "[; rm -rf /]"]);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.args.len(), 3);
    }

    #[test]
    fn test_non_zero_exit_surfaces_output() {
        let tmp = TempDir::new().unwrap();
        let exec = executor_with_script(&tmp, "failing", "echo partial; echo broken >&2; exit 3");
        match exec.execute::<&str>("failing", &[], None) {
            Err(ExecError::ToolExecutionFailed {
                exit_code,
                stdout,
                stderr,
                ..
            }) => {
                assert_eq!(exit_code, Some(3));
                assert_eq!(stdout.trim(), "partial");
                assert_eq!(stderr.trim(), "broken");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_env_reaches_child() {
        let tmp = TempDir::new().unwrap();
        let exec = executor_with_script(&tmp, "printenv-image", r#"echo "$ELROND_IMAGE_PATH""#);
        let opts = ExecOptions::default().env("ELROND_IMAGE_PATH", "/evidence/it's here.E01");
        let result = exec
            .execute_with::<&str>("printenv-image", &[], &opts)
            .unwrap();
        assert_eq!(result.stdout.trim(), "/evidence/it's here.E01");
    }

    #[test]
    fn test_cancellation_kills_child() {
        let tmp = TempDir::new().unwrap();
        let exec = executor_with_script(&tmp, "sleeper", "echo started; exec sleep 30");
        let token = CancelToken::new();
        let canceller = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            canceller.cancel();
        });
        let start = Instant::now();
        let err = exec
            .execute_with::<&str>("sleeper", &[], &ExecOptions::default().cancel(token))
            .unwrap_err();
        handle.join().unwrap();
        assert!(start.elapsed() < Duration::from_secs(10));
        match err {
            ExecError::Cancelled { partial, .. } => assert_eq!(partial.stdout.trim(), "started"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_tool_fails_before_spawn() {
        let tmp = TempDir::new().unwrap();
        let exec = executor_with_script(&tmp, "present", "exit 0");
        let err = exec.execute::<&str>("absent", &[], None).unwrap_err();
        assert!(matches!(err, ExecError::ToolNotFound { .. }));
    }
}
