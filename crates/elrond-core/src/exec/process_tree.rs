/// Process-tree termination.
///
/// On Unix every child is spawned as the leader of its own process group,
/// so killing the group reaches grandchildren (shell wrappers, Python
/// launchers) as well. On Windows `taskkill /T` walks the parent-child tree.
use std::process::{Child, Command};

/// Configure `cmd` so its whole tree can later be killed at once.
#[cfg(unix)]
pub fn isolate(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(windows)]
pub fn isolate(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;
    // CREATE_NEW_PROCESS_GROUP | CREATE_NO_WINDOW
    cmd.creation_flags(0x0000_0200 | 0x0800_0000);
}

/// Kill `child` and all of its descendants, then reap `child`.
#[cfg(unix)]
pub fn kill_tree(child: &mut Child) {
    use rustix::process::{kill_process_group, Pid, Signal};

    let group = i32::try_from(child.id()).ok().and_then(Pid::from_raw);
    match group {
        Some(pgid) => {
            if let Err(e) = kill_process_group(pgid, Signal::KILL) {
                tracing::debug!("kill_process_group({}) failed: {e}", child.id());
                let _ = child.kill();
            }
        }
        None => {
            let _ = child.kill();
        }
    }
    let _ = child.wait();
}

#[cfg(windows)]
pub fn kill_tree(child: &mut Child) {
    let pid = child.id().to_string();
    let status = Command::new("taskkill")
        .args(["/PID", pid.as_str(), "/T", "/F"])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status();
    if !matches!(status, Ok(s) if s.success()) {
        tracing::debug!("taskkill for pid {pid} failed; killing the direct child only");
        let _ = child.kill();
    }
    let _ = child.wait();
}
