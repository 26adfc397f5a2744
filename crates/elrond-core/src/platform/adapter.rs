/// Shared mount driver for every platform variant.
///
/// A variant only describes *what* its backends do (the [`Backends`] trait);
/// [`Adapter`] owns the bookkeeping common to all of them:
///
/// 1. canonicalise and identify the image (fail fast, no OS resources yet);
/// 2. reject the request if every candidate needs elevation we lack;
/// 3. claim a mount point from the bounded pool under the adapter mutex;
/// 4. try each candidate backend in order, logging every fallback;
/// 5. on total failure, return the slot and report every attempt.
///
/// Backends release anything they partially acquired before returning an
/// error, so the driver never has to know what a backend attached.
use super::paths::normalize_path;
use super::pool::MountPointPool;
use super::{permissions, Platform, PlatformAdapter, UnmountMode};
use crate::error::{AttemptFailure, BackendAttempt, ExecError, MountError};
use crate::exec::{CommandExecutor, ExecOptions};
use crate::model::{ExecutionResult, ImageDescriptor, ImageType, MountBackend, MountRecord};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What a backend attached, and everything needed to detach it again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub backend: MountBackend,
    pub image_path: PathBuf,
    pub mount_point: PathBuf,
    /// Device reported to callers (`/dev/loop3`, `/dev/disk4`, AIM device number).
    pub device: Option<String>,
    /// Device claimed from the adapter's device pool, returned on unmount.
    pub claimed_device: Option<PathBuf>,
}

/// Per-platform backend behaviour plugged into [`Adapter`].
pub trait Backends: Send + Sync + 'static {
    const PLATFORM: Platform;

    /// Ordered backend candidates for `image_type`. Empty means unsupported.
    fn candidates(&self, image_type: ImageType) -> &'static [MountBackend];

    fn requires_privilege(&self, backend: MountBackend) -> bool;

    /// Attach and mount. Must release any partial acquisition before
    /// returning `Err`.
    fn attach(&self, ctx: &AttachContext<'_>, backend: MountBackend)
        -> Result<Attachment, AttemptFailure>;

    /// Unmount and detach. With `force`, detach even if the filesystem is busy.
    fn detach(&self, ctx: &ToolContext<'_>, attachment: &Attachment, force: bool)
        -> Result<(), String>;

    /// Replace the aggregated failure with platform guidance, if any applies.
    fn unavailable_guidance(
        &self,
        _image: &ImageDescriptor,
        _attempts: &[BackendAttempt],
    ) -> Option<MountError> {
        None
    }

    fn permission_message(&self, elevated: bool) -> String;
}

/// Runs catalog tools on behalf of a backend with the adapter's timeout.
pub struct ToolContext<'a> {
    executor: &'a CommandExecutor,
    timeout: Option<Duration>,
}

impl ToolContext<'_> {
    pub fn run<S: AsRef<OsStr>>(
        &self,
        tool_id: &str,
        args: &[S],
    ) -> Result<ExecutionResult, ExecError> {
        self.run_with(tool_id, args, ExecOptions::default())
    }

    pub fn run_with<S: AsRef<OsStr>>(
        &self,
        tool_id: &str,
        args: &[S],
        opts: ExecOptions,
    ) -> Result<ExecutionResult, ExecError> {
        self.executor
            .execute_with(tool_id, args, &opts.maybe_timeout(self.timeout))
    }

    pub fn run_program<S: AsRef<OsStr>>(
        &self,
        tool_id: &str,
        program: &Path,
        args: &[S],
        opts: ExecOptions,
    ) -> Result<ExecutionResult, ExecError> {
        self.executor
            .execute_program(tool_id, program, args, &opts.maybe_timeout(self.timeout))
    }

    pub fn executor(&self) -> &CommandExecutor {
        self.executor
    }

    /// Run an unmount-style command, treating "not mounted" as success.
    pub fn run_idempotent<S: AsRef<OsStr>>(&self, tool_id: &str, args: &[S]) -> Result<(), String> {
        match self.run(tool_id, args) {
            Ok(_) => Ok(()),
            Err(err) if already_gone(&err) => {
                debug!("{tool_id}: target already detached");
                Ok(())
            }
            Err(err) => Err(err.to_string()),
        }
    }
}

/// True when a failed unmount/detach reports the target as already gone.
pub fn already_gone(err: &ExecError) -> bool {
    let ExecError::ToolExecutionFailed { stdout, stderr, .. } = err else {
        return false;
    };
    let text = format!("{stdout}\n{stderr}").to_ascii_lowercase();
    [
        "not mounted",
        "not currently mounted",
        "not found in /etc/mtab",
        "no such file or directory",
        "no mount point specified",
        "not a mount point",
    ]
    .iter()
    .any(|needle| text.contains(needle))
}

/// Everything a backend needs for one attach attempt.
pub struct AttachContext<'a> {
    pub tools: ToolContext<'a>,
    pub image: &'a ImageDescriptor,
    pub mount_point: &'a Path,
    pub read_only: bool,
    state: &'a Mutex<AdapterState>,
}

impl AttachContext<'_> {
    /// Claim a free device (NBD) from the adapter's device pool.
    pub fn claim_device(&self) -> Option<PathBuf> {
        let mut state = self.state.lock();
        let AdapterState {
            devices,
            devices_in_use,
            ..
        } = &mut *state;
        let device = devices
            .iter()
            .find(|d| !devices_in_use.contains(*d) && d.exists())?
            .clone();
        devices_in_use.push(device.clone());
        Some(device)
    }

    pub fn release_device(&self, device: &Path) {
        self.state.lock().devices_in_use.retain(|d| d != device);
    }

    pub fn has_devices(&self) -> bool {
        self.state.lock().devices.iter().any(|d| d.exists())
    }
}

/// Mutable adapter state. Guarded by the adapter's single mutex.
#[derive(Debug)]
pub struct AdapterState {
    pool: MountPointPool,
    devices: Vec<PathBuf>,
    devices_in_use: Vec<PathBuf>,
    active: HashMap<PathBuf, Attachment>,
}

/// A [`PlatformAdapter`] built from a [`Backends`] implementation.
pub struct Adapter<B: Backends> {
    backends: B,
    executor: Arc<CommandExecutor>,
    state: Mutex<AdapterState>,
    elevated: bool,
    timeout: Option<Duration>,
}

impl<B: Backends> Adapter<B> {
    pub fn new(
        backends: B,
        executor: Arc<CommandExecutor>,
        pool: MountPointPool,
        devices: Vec<PathBuf>,
        assume_elevated: bool,
        timeout: Option<Duration>,
    ) -> Self {
        let elevated = assume_elevated || permissions::is_elevated();
        Self {
            backends,
            executor,
            state: Mutex::new(AdapterState {
                pool,
                devices,
                devices_in_use: Vec::new(),
                active: HashMap::new(),
            }),
            elevated,
            timeout,
        }
    }

    pub fn backends(&self) -> &B {
        &self.backends
    }

    pub fn is_elevated(&self) -> bool {
        self.elevated
    }

    fn tools(&self) -> ToolContext<'_> {
        ToolContext {
            executor: &self.executor,
            timeout: self.timeout,
        }
    }

    fn resolve_image(&self, path: &Path) -> Result<ImageDescriptor, MountError> {
        let canonical = std::fs::canonicalize(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => MountError::ImageNotFound(path.to_path_buf()),
            _ => MountError::Io {
                path: path.to_path_buf(),
                source: e,
            },
        })?;
        let mut descriptor =
            ImageDescriptor::probe(&canonical).map_err(|source| MountError::Io {
                path: canonical.clone(),
                source,
            })?;
        descriptor.path = normalize_path(B::PLATFORM, &canonical);
        Ok(descriptor)
    }

    fn claim_mount_point(&self, preferred: Option<&Path>) -> Result<PathBuf, MountError> {
        let mut state = self.state.lock();
        match preferred {
            Some(wanted) => {
                let wanted = normalize_path(B::PLATFORM, wanted);
                state
                    .pool
                    .reserve(&wanted)
                    .ok_or(MountError::InvalidMountPoint(wanted))
            }
            None => state.pool.reserve_next().ok_or(MountError::PoolExhausted {
                capacity: state.pool.capacity(),
            }),
        }
    }

    fn release_mount_point(&self, mount_point: &Path) {
        self.state.lock().pool.release(mount_point);
    }

    fn prepare_mount_point(mount_point: &Path) -> std::io::Result<()> {
        if B::PLATFORM == Platform::Windows {
            return Ok(());
        }
        std::fs::create_dir_all(mount_point)
    }
}

impl<B: Backends> PlatformAdapter for Adapter<B> {
    fn platform(&self) -> Platform {
        B::PLATFORM
    }

    fn mount(
        &self,
        path: &Path,
        preferred_mount_point: Option<&Path>,
        read_only: bool,
    ) -> Result<MountRecord, MountError> {
        let image = self.resolve_image(path)?;
        let candidates = self.backends.candidates(image.detected_type);
        if candidates.is_empty() {
            return Err(MountError::UnsupportedFormat {
                path: image.path,
                image_type: image.detected_type,
                platform: B::PLATFORM.name(),
            });
        }
        if !self.elevated && candidates.iter().all(|b| self.backends.requires_privilege(*b)) {
            return Err(MountError::PermissionDenied(
                self.backends.permission_message(false),
            ));
        }
        if !read_only {
            warn!("Mounting {} read-write; evidence may be modified", image.path.display());
        }

        let mount_point = self.claim_mount_point(preferred_mount_point)?;
        if let Err(source) = Self::prepare_mount_point(&mount_point) {
            self.release_mount_point(&mount_point);
            return Err(MountError::Io {
                path: mount_point,
                source,
            });
        }

        info!(
            "Mounting {} ({}, {} bytes) at {}",
            image.path.display(),
            image.detected_type,
            image.size_bytes,
            mount_point.display()
        );

        let ctx = AttachContext {
            tools: self.tools(),
            image: &image,
            mount_point: &mount_point,
            read_only,
            state: &self.state,
        };

        let mut attempts = Vec::with_capacity(candidates.len());
        for &backend in candidates {
            if !self.elevated && self.backends.requires_privilege(backend) {
                warn!("Skipping {backend}: requires elevated privileges");
                attempts.push(BackendAttempt {
                    backend,
                    reason: AttemptFailure::PermissionDenied,
                });
                continue;
            }
            match self.backends.attach(&ctx, backend) {
                Ok(attachment) => {
                    let record = MountRecord {
                        image_path: image.path.clone(),
                        mount_point: mount_point.clone(),
                        backend,
                        device_handle: attachment.device.clone(),
                        read_only,
                        created_at: Utc::now(),
                    };
                    self.state
                        .lock()
                        .active
                        .insert(mount_point.clone(), attachment);
                    info!(
                        "Mounted {} at {} via {backend}",
                        image.path.display(),
                        mount_point.display()
                    );
                    return Ok(record);
                }
                Err(reason) => {
                    warn!(
                        "Backend {backend} failed for {}: {reason}; trying next candidate",
                        image.path.display()
                    );
                    attempts.push(BackendAttempt { backend, reason });
                }
            }
        }

        self.release_mount_point(&mount_point);
        if let Some(err) = self.backends.unavailable_guidance(&image, &attempts) {
            return Err(err);
        }
        Err(MountError::MountFailed {
            path: image.path,
            attempts,
        })
    }

    fn unmount(&self, record: &MountRecord, mode: UnmountMode) -> Result<(), MountError> {
        // Take the attachment out under the lock so a concurrent unmount of
        // the same record becomes a no-op instead of a second detach.
        let attachment = {
            let mut state = self.state.lock();
            match state.active.get(&record.mount_point) {
                Some(a) if a.image_path == record.image_path => {
                    state.active.remove(&record.mount_point)
                }
                _ => None,
            }
        };
        let Some(attachment) = attachment else {
            debug!(
                "{} is not mounted at {}; nothing to do",
                record.image_path.display(),
                record.mount_point.display()
            );
            return Ok(());
        };

        let tools = self.tools();
        let result = match mode {
            UnmountMode::Clean => self.backends.detach(&tools, &attachment, false),
            UnmountMode::Force => self.backends.detach(&tools, &attachment, true),
            UnmountMode::CleanThenForce => {
                self.backends
                    .detach(&tools, &attachment, false)
                    .or_else(|reason| {
                        warn!(
                            "Clean unmount of {} failed ({reason}); forcing detach",
                            attachment.mount_point.display()
                        );
                        self.backends.detach(&tools, &attachment, true)
                    })
            }
        };

        let mut state = self.state.lock();
        match result {
            Ok(()) => {
                state.pool.release(&attachment.mount_point);
                if let Some(device) = &attachment.claimed_device {
                    state.devices_in_use.retain(|d| d != device);
                }
                info!(
                    "Unmounted {} from {}",
                    attachment.image_path.display(),
                    attachment.mount_point.display()
                );
                Ok(())
            }
            Err(reason) => {
                let mount_point = attachment.mount_point.clone();
                state.active.insert(mount_point.clone(), attachment);
                Err(MountError::UnmountFailed {
                    mount_point,
                    reason,
                })
            }
        }
    }

    fn available_mount_points(&self) -> Vec<PathBuf> {
        self.state.lock().pool.free()
    }

    fn pool_capacity(&self) -> usize {
        self.state.lock().pool.capacity()
    }

    fn check_permissions(&self) -> (bool, String) {
        (self.elevated, self.backends.permission_message(self.elevated))
    }

    fn normalize_path(&self, path: &Path) -> PathBuf {
        normalize_path(B::PLATFORM, path)
    }

    fn is_active(&self, mount_point: &Path) -> bool {
        self.state.lock().active.contains_key(mount_point)
    }

    fn active_mounts(&self) -> Vec<PathBuf> {
        let mut points: Vec<PathBuf> = self.state.lock().active.keys().cloned().collect();
        points.sort();
        points
    }
}

/// Run `step`; if it fails, run `undo` (logging its failure) and return the
/// original error. Keeps partial attachments from leaking between backends.
pub fn or_release<T, E: std::fmt::Display>(
    step: Result<T, E>,
    what: &str,
    undo: impl FnOnce() -> Result<(), String>,
) -> Result<T, E> {
    if let Err(err) = &step {
        debug!("{what} failed ({err}); releasing partial attachment");
        if let Err(undo_err) = undo() {
            warn!("Releasing partial attachment after {what} failure also failed: {undo_err}");
        }
    }
    step
}
