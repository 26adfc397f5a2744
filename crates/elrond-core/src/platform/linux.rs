/// Linux backends: `ewfmount` (FUSE), `qemu-nbd` and loop devices.
///
/// Loop and NBD attachment need root; `ewfmount` runs unprivileged when the
/// user may use FUSE. An EWF mount exposes the raw stream as `ewf1` under the
/// mount point; callers that need the filesystem inside mount that file again
/// and rely on the registry's reverse-order teardown.
use super::adapter::{or_release, Adapter, AttachContext, Attachment, Backends, ToolContext};
use super::pool::MountPointPool;
use super::Platform;
use crate::config::{ElrondConfig, DEFAULT_PARTITION_WAIT_MS};
use crate::error::AttemptFailure;
use crate::exec::CommandExecutor;
use crate::model::{ImageType, MountBackend};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

pub type LinuxAdapter = Adapter<LinuxBackends>;

impl Adapter<LinuxBackends> {
    pub fn from_config(config: &ElrondConfig, executor: Arc<CommandExecutor>) -> Self {
        Adapter::new(
            LinuxBackends {
                partition_wait: config.partition_wait(),
            },
            executor,
            MountPointPool::unix(&config.mount_root, config.pool_size),
            config.nbd_devices.clone(),
            config.assume_elevated,
            config.default_timeout(),
        )
    }
}

#[derive(Debug)]
pub struct LinuxBackends {
    /// Upper bound on waiting for a partition node after attaching.
    partition_wait: Duration,
}

impl Default for LinuxBackends {
    fn default() -> Self {
        Self {
            partition_wait: Duration::from_millis(DEFAULT_PARTITION_WAIT_MS),
        }
    }
}

const PARTITION_POLL: Duration = Duration::from_millis(100);

const EWF: &[MountBackend] = &[MountBackend::EwfFuse];
const NBD: &[MountBackend] = &[MountBackend::QemuNbd];
const LOOP: &[MountBackend] = &[MountBackend::Loop];

impl Backends for LinuxBackends {
    const PLATFORM: Platform = Platform::Linux;

    fn candidates(&self, image_type: ImageType) -> &'static [MountBackend] {
        match image_type {
            ImageType::Ewf => EWF,
            ImageType::Vmdk | ImageType::Vhd | ImageType::Vhdx | ImageType::Dmg => NBD,
            ImageType::Raw | ImageType::Iso | ImageType::Unknown => LOOP,
            ImageType::Apfs => &[],
        }
    }

    fn requires_privilege(&self, backend: MountBackend) -> bool {
        matches!(backend, MountBackend::QemuNbd | MountBackend::Loop)
    }

    fn attach(
        &self,
        ctx: &AttachContext<'_>,
        backend: MountBackend,
    ) -> Result<Attachment, AttemptFailure> {
        match backend {
            MountBackend::EwfFuse => attach_ewf(ctx),
            MountBackend::QemuNbd => attach_nbd(ctx, self.partition_wait),
            MountBackend::Loop => attach_loop(ctx, self.partition_wait),
            other => Err(AttemptFailure::Unavailable(format!(
                "{other} is not a Linux backend"
            ))),
        }
    }

    fn detach(
        &self,
        tools: &ToolContext<'_>,
        attachment: &Attachment,
        force: bool,
    ) -> Result<(), String> {
        let mount_point = attachment.mount_point.as_os_str();
        match attachment.backend {
            MountBackend::EwfFuse => {
                let flag = if force { "-uz" } else { "-u" };
                tools
                    .run_idempotent("fusermount", &[OsStr::new(flag), mount_point])
                    .or_else(|reason| {
                        debug!("fusermount failed ({reason}); falling back to umount");
                        tools.run_idempotent("umount", &umount_args(mount_point, force))
                    })
            }
            MountBackend::QemuNbd => {
                tools.run_idempotent("umount", &umount_args(mount_point, force))?;
                let device = attached_device(attachment)?;
                tools.run_idempotent("qemu-nbd", &[OsStr::new("--disconnect"), device])
            }
            MountBackend::Loop => {
                tools.run_idempotent("umount", &umount_args(mount_point, force))?;
                let device = attached_device(attachment)?;
                tools.run_idempotent("losetup", &[OsStr::new("-d"), device])
            }
            other => Err(format!("{other} is not a Linux backend")),
        }
    }

    fn permission_message(&self, elevated: bool) -> String {
        if elevated {
            "running as root: all Linux mount backends are available".to_owned()
        } else {
            "not running as root: loop and qemu-nbd mounts need root (re-run with sudo); \
             EWF images can still be mounted through ewfmount/FUSE"
                .to_owned()
        }
    }
}

// ── Backends ─────────────────────────────────────────────────────────────────

pub(super) fn attach_ewf(ctx: &AttachContext<'_>) -> Result<Attachment, AttemptFailure> {
    ctx.tools.run(
        "ewfmount",
        &[ctx.image.path.as_os_str(), ctx.mount_point.as_os_str()],
    )?;
    Ok(Attachment {
        backend: MountBackend::EwfFuse,
        image_path: ctx.image.path.clone(),
        mount_point: ctx.mount_point.to_path_buf(),
        device: Some(ctx.mount_point.join("ewf1").display().to_string()),
        claimed_device: None,
    })
}

fn attach_nbd(ctx: &AttachContext<'_>, wait: Duration) -> Result<Attachment, AttemptFailure> {
    let device = ctx.claim_device().ok_or_else(|| {
        AttemptFailure::Unavailable(if ctx.has_devices() {
            "every NBD device is in use".to_owned()
        } else {
            "no NBD devices; load the module with `modprobe nbd max_part=16`".to_owned()
        })
    })?;

    let mut connect: Vec<OsString> = Vec::with_capacity(3);
    if ctx.read_only {
        connect.push("--read-only".into());
    }
    let mut connect_arg = OsString::from("--connect=");
    connect_arg.push(&device);
    connect.push(connect_arg);
    connect.push(ctx.image.path.clone().into_os_string());

    if let Err(err) = ctx.tools.run("qemu-nbd", &connect) {
        ctx.release_device(&device);
        return Err(err.into());
    }

    let source = first_partition(&device, wait);
    or_release(mount_filesystem(ctx, &source), "mount", || {
        let disconnected = ctx
            .tools
            .run("qemu-nbd", &[OsStr::new("--disconnect"), device.as_os_str()])
            .map(drop)
            .map_err(|e| e.to_string());
        ctx.release_device(&device);
        disconnected
    })?;

    Ok(Attachment {
        backend: MountBackend::QemuNbd,
        image_path: ctx.image.path.clone(),
        mount_point: ctx.mount_point.to_path_buf(),
        device: Some(device.display().to_string()),
        claimed_device: Some(device),
    })
}

fn attach_loop(ctx: &AttachContext<'_>, wait: Duration) -> Result<Attachment, AttemptFailure> {
    let mut args: Vec<&OsStr> = vec![
        OsStr::new("--find"),
        OsStr::new("--show"),
        OsStr::new("--partscan"),
    ];
    if ctx.read_only {
        args.push(OsStr::new("--read-only"));
    }
    args.push(ctx.image.path.as_os_str());

    let result = ctx.tools.run("losetup", &args)?;
    let Some(device) = parse_loop_device(&result.stdout) else {
        // The image may be bound to a loop device nobody knows the name of.
        let failure = AttemptFailure::unusable_output("losetup reported no device", result);
        return or_release(Err(failure), "losetup output parsing", || {
            detach_image_loops(&ctx.tools, &ctx.image.path)
        });
    };

    let source = first_partition(&device, wait);
    or_release(mount_filesystem(ctx, &source), "mount", || {
        ctx.tools
            .run("losetup", &[OsStr::new("-d"), device.as_os_str()])
            .map(drop)
            .map_err(|e| e.to_string())
    })?;

    Ok(Attachment {
        backend: MountBackend::Loop,
        image_path: ctx.image.path.clone(),
        mount_point: ctx.mount_point.to_path_buf(),
        device: Some(device.display().to_string()),
        claimed_device: None,
    })
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn mount_filesystem(ctx: &AttachContext<'_>, source: &Path) -> Result<(), AttemptFailure> {
    let mode = if ctx.read_only { "ro" } else { "rw" };
    ctx.tools.run(
        "mount",
        &[
            OsStr::new("-o"),
            OsStr::new(mode),
            source.as_os_str(),
            ctx.mount_point.as_os_str(),
        ],
    )?;
    Ok(())
}

/// Detach every loop device `losetup -j` reports for `image`.
fn detach_image_loops(tools: &ToolContext<'_>, image: &Path) -> Result<(), String> {
    let listing = tools
        .run("losetup", &[OsStr::new("-j"), image.as_os_str()])
        .map_err(|e| e.to_string())?;
    let devices = loop_devices_in_listing(&listing.stdout);
    if devices.is_empty() {
        return Err(format!("no loop device bound to {}", image.display()));
    }
    for device in &devices {
        tools
            .run("losetup", &[OsStr::new("-d"), device.as_os_str()])
            .map_err(|e| e.to_string())?;
    }
    Ok(())
}

/// `/dev/nbd0` -> `/dev/nbd0p1` once the partition node appears, else the
/// whole device (a bare filesystem image). udev creates partition nodes
/// asynchronously after a partition scan.
fn first_partition(device: &Path, wait: Duration) -> PathBuf {
    let mut name = device.as_os_str().to_owned();
    name.push("p1");
    let partition = PathBuf::from(name);
    let deadline = Instant::now() + wait;
    loop {
        if partition.exists() {
            return partition;
        }
        if Instant::now() >= deadline {
            break;
        }
        std::thread::sleep(PARTITION_POLL);
    }
    debug!("{} has no partition node; using the whole device", device.display());
    device.to_path_buf()
}

/// First line of `losetup --show` output naming a device.
fn parse_loop_device(stdout: &str) -> Option<PathBuf> {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("/dev/"))
        .map(PathBuf::from)
}

/// Device column of `losetup -j` output: `/dev/loop0: [2049]:131 (/x.dd)`.
fn loop_devices_in_listing(stdout: &str) -> Vec<PathBuf> {
    stdout
        .lines()
        .filter_map(|line| line.trim().split_once(": "))
        .map(|(device, _)| device)
        .filter(|device| device.starts_with("/dev/"))
        .map(PathBuf::from)
        .collect()
}

fn umount_args(mount_point: &OsStr, force: bool) -> Vec<&OsStr> {
    if force {
        vec![OsStr::new("-l"), mount_point]
    } else {
        vec![mount_point]
    }
}

fn attached_device(attachment: &Attachment) -> Result<&OsStr, String> {
    attachment
        .device
        .as_deref()
        .map(OsStr::new)
        .ok_or_else(|| format!("no device recorded for {}", attachment.mount_point.display()))
}
