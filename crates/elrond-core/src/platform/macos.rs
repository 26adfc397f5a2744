/// macOS backends built on `hdiutil`, plus `ewfmount` through macFUSE.
///
/// Native images (DMG, ISO) attach and mount in one `hdiutil` call. APFS
/// containers are attached without mounting so the volume can be mounted
/// read-only and hidden from Finder; raw images are forced through the raw
/// disk-image class.
use super::adapter::{or_release, Adapter, AttachContext, Attachment, Backends, ToolContext};
use super::linux::attach_ewf;
use super::pool::MountPointPool;
use super::Platform;
use crate::config::ElrondConfig;
use crate::error::AttemptFailure;
use crate::exec::CommandExecutor;
use crate::model::{ImageType, MountBackend};
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;

pub type MacOsAdapter = Adapter<MacOsBackends>;

impl Adapter<MacOsBackends> {
    pub fn from_config(config: &ElrondConfig, executor: Arc<CommandExecutor>) -> Self {
        Adapter::new(
            MacOsBackends,
            executor,
            MountPointPool::unix(&config.mount_root, config.pool_size),
            Vec::new(),
            config.assume_elevated,
            config.default_timeout(),
        )
    }
}

#[derive(Debug, Default)]
pub struct MacOsBackends;

/// GPT type GUID prefix of an APFS volume ("APFS" in ASCII hex).
const APFS_VOLUME_GUID: &str = "41504653";

const NATIVE: &[MountBackend] = &[MountBackend::Hdiutil];
const APFS: &[MountBackend] = &[MountBackend::HdiutilApfs];
const EWF: &[MountBackend] = &[MountBackend::EwfFuse];
const RAW: &[MountBackend] = &[MountBackend::HdiutilRaw];

impl Backends for MacOsBackends {
    const PLATFORM: Platform = Platform::MacOs;

    fn candidates(&self, image_type: ImageType) -> &'static [MountBackend] {
        match image_type {
            ImageType::Dmg | ImageType::Iso => NATIVE,
            ImageType::Apfs => APFS,
            ImageType::Ewf => EWF,
            ImageType::Raw | ImageType::Unknown => RAW,
            ImageType::Vmdk | ImageType::Vhd | ImageType::Vhdx => &[],
        }
    }

    fn requires_privilege(&self, backend: MountBackend) -> bool {
        // `mount -t apfs` onto an arbitrary directory needs root.
        backend == MountBackend::HdiutilApfs
    }

    fn attach(
        &self,
        ctx: &AttachContext<'_>,
        backend: MountBackend,
    ) -> Result<Attachment, AttemptFailure> {
        match backend {
            MountBackend::Hdiutil => attach_hdiutil(ctx, backend, &[]),
            MountBackend::HdiutilRaw => attach_hdiutil(
                ctx,
                backend,
                &["-imagekey", "diskimage-class=CRawDiskImage"],
            ),
            MountBackend::HdiutilApfs => attach_apfs(ctx),
            MountBackend::EwfFuse => attach_ewf(ctx),
            other => Err(AttemptFailure::Unavailable(format!(
                "{other} is not a macOS backend"
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
        let umount = |force: bool| {
            let args: Vec<&OsStr> = if force {
                vec![OsStr::new("-f"), mount_point]
            } else {
                vec![mount_point]
            };
            tools.run_idempotent("umount", &args)
        };
        match attachment.backend {
            MountBackend::EwfFuse => umount(force),
            MountBackend::Hdiutil | MountBackend::HdiutilRaw => {
                hdiutil_detach(tools, attachment, force)
            }
            MountBackend::HdiutilApfs => {
                umount(force)?;
                hdiutil_detach(tools, attachment, force)
            }
            other => Err(format!("{other} is not a macOS backend")),
        }
    }

    fn permission_message(&self, elevated: bool) -> String {
        if elevated {
            "running as root: all macOS mount backends are available".to_owned()
        } else {
            "not running as root: APFS container mounts need root (re-run with sudo); \
             DMG, ISO, raw and EWF images mount unprivileged"
                .to_owned()
        }
    }
}

// ── Backends ─────────────────────────────────────────────────────────────────

fn attach_hdiutil(
    ctx: &AttachContext<'_>,
    backend: MountBackend,
    extra: &[&str],
) -> Result<Attachment, AttemptFailure> {
    let mut args: Vec<&OsStr> = vec![OsStr::new("attach")];
    if ctx.read_only {
        args.push(OsStr::new("-readonly"));
    }
    args.extend(
        ["-noverify", "-noautoopen", "-owners", "off"]
            .iter()
            .chain(extra)
            .map(|arg| OsStr::new(*arg)),
    );
    args.extend([
        OsStr::new("-mountpoint"),
        ctx.mount_point.as_os_str(),
        ctx.image.path.as_os_str(),
    ]);

    let result = ctx.tools.run("hdiutil", &args)?;
    let Some(device) = parse_whole_disk(&result.stdout) else {
        // Mounted at the mount point even though no node was reported.
        let failure = AttemptFailure::unusable_output("hdiutil reported no device", result);
        return or_release(Err(failure), "hdiutil output parsing", || {
            ctx.tools
                .run(
                    "hdiutil",
                    &[
                        OsStr::new("detach"),
                        OsStr::new("-force"),
                        ctx.mount_point.as_os_str(),
                    ],
                )
                .map(drop)
                .map_err(|e| e.to_string())
        });
    };
    Ok(Attachment {
        backend,
        image_path: ctx.image.path.clone(),
        mount_point: ctx.mount_point.to_path_buf(),
        device: Some(device),
        claimed_device: None,
    })
}

fn attach_apfs(ctx: &AttachContext<'_>) -> Result<Attachment, AttemptFailure> {
    let mut args: Vec<&OsStr> = vec![OsStr::new("attach"), OsStr::new("-nomount")];
    if ctx.read_only {
        args.push(OsStr::new("-readonly"));
    }
    args.extend([
        OsStr::new("-noverify"),
        OsStr::new("-noautoopen"),
        ctx.image.path.as_os_str(),
    ]);

    let result = ctx.tools.run("hdiutil", &args)?;
    let whole = parse_whole_disk(&result.stdout);
    let volume = parse_apfs_volume(&result.stdout);
    let (whole, volume) = match (whole, volume) {
        (Some(whole), Some(volume)) => (whole, volume),
        (Some(whole), None) => {
            let failure =
                AttemptFailure::unusable_output("no APFS volume found in attached image", result);
            return or_release(Err(failure), "APFS volume lookup", || {
                ctx.tools
                    .run("hdiutil", &["detach", "-force", whole.as_str()])
                    .map(drop)
                    .map_err(|e| e.to_string())
            });
        }
        (None, _) => {
            let failure = AttemptFailure::unusable_output("hdiutil reported no device", result);
            return or_release(Err(failure), "hdiutil output parsing", || {
                detach_image_devices(&ctx.tools, &ctx.image.path)
            });
        }
    };

    let options = if ctx.read_only {
        "rdonly,nobrowse"
    } else {
        "nobrowse"
    };
    let mounted = ctx
        .tools
        .run(
            "mount",
            &[
                OsStr::new("-t"),
                OsStr::new("apfs"),
                OsStr::new("-o"),
                OsStr::new(options),
                OsStr::new(&volume),
                ctx.mount_point.as_os_str(),
            ],
        )
        .map(drop)
        .map_err(AttemptFailure::from);
    or_release(mounted, "mount -t apfs", || {
        ctx.tools
            .run("hdiutil", &["detach", "-force", whole.as_str()])
            .map(drop)
            .map_err(|e| e.to_string())
    })?;

    Ok(Attachment {
        backend: MountBackend::HdiutilApfs,
        image_path: ctx.image.path.clone(),
        mount_point: ctx.mount_point.to_path_buf(),
        device: Some(whole),
        claimed_device: None,
    })
}

fn hdiutil_detach(
    tools: &ToolContext<'_>,
    attachment: &Attachment,
    force: bool,
) -> Result<(), String> {
    let device = attachment
        .device
        .as_deref()
        .ok_or_else(|| format!("no device recorded for {}", attachment.mount_point.display()))?;
    let args: Vec<&str> = if force {
        vec!["detach", "-force", device]
    } else {
        vec!["detach", device]
    };
    tools.run_idempotent("hdiutil", &args)
}

/// Force-detach every disk `hdiutil info` lists for `image`.
fn detach_image_devices(tools: &ToolContext<'_>, image: &Path) -> Result<(), String> {
    let info = tools.run("hdiutil", &["info"]).map_err(|e| e.to_string())?;
    let disks = whole_disks_for_image(&info.stdout, image);
    if disks.is_empty() {
        return Err(format!("hdiutil lists no disk for {}", image.display()));
    }
    for disk in &disks {
        tools
            .run("hdiutil", &["detach", "-force", disk.as_str()])
            .map_err(|e| e.to_string())?;
    }
    Ok(())
}

// ── Output parsing ───────────────────────────────────────────────────────────

/// `hdiutil attach` prints one tab-separated line per attached node:
/// `/dev/disk4s1 <TAB> Apple_APFS <TAB> /Volumes/X`. The whole disk is the
/// `/dev/diskN` prefix of the first node.
fn parse_whole_disk(stdout: &str) -> Option<String> {
    let node = device_nodes(stdout).next()?.0;
    let digits = node
        .strip_prefix("/dev/disk")?
        .chars()
        .take_while(char::is_ascii_digit)
        .count();
    if digits == 0 {
        return None;
    }
    Some(node[.."/dev/disk".len() + digits].to_owned())
}

/// The APFS volume node: the line whose content hint is the APFS volume
/// GUID, falling back to the `Apple_APFS` container partition.
fn parse_apfs_volume(stdout: &str) -> Option<String> {
    let nodes: Vec<(&str, &str)> = device_nodes(stdout).collect();
    nodes
        .iter()
        .find(|(_, rest)| rest.contains(APFS_VOLUME_GUID))
        .or_else(|| nodes.iter().find(|(_, rest)| rest.contains("Apple_APFS")))
        .map(|(node, _)| (*node).to_owned())
}

/// Whole disks in `hdiutil info` output belonging to `image`. Each image
/// section opens with a `====` rule and names its file on an `image-path`
/// line ahead of the device nodes.
fn whole_disks_for_image(info: &str, image: &Path) -> Vec<String> {
    let image = image.to_string_lossy();
    let mut disks: Vec<String> = Vec::new();
    let mut matching = false;
    for line in info.lines() {
        if line.starts_with("====") {
            matching = false;
        } else if let Some(value) = line
            .split_once(':')
            .filter(|(key, _)| key.trim() == "image-path")
            .map(|(_, value)| value.trim())
        {
            matching = value == image;
        } else if matching {
            if let Some(disk) = parse_whole_disk(line) {
                if !disks.contains(&disk) {
                    disks.push(disk);
                }
            }
        }
    }
    disks
}

/// `(device node, remainder of line)` for every `/dev/disk...` line.
fn device_nodes(stdout: &str) -> impl Iterator<Item = (&str, &str)> {
    stdout.lines().filter_map(|line| {
        let line = line.trim();
        if !line.starts_with("/dev/disk") {
            return None;
        }
        let end = line.find(char::is_whitespace).unwrap_or(line.len());
        Some((&line[..end], &line[end..]))
    })
}
