/// Mount records and the backend methods that produce them.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// OS-level mechanism used to realise a mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountBackend {
    /// `ewfmount` (libewf FUSE), Linux and macOS.
    EwfFuse,
    /// `qemu-nbd` attach plus a filesystem mount of the NBD device.
    QemuNbd,
    /// Loop device plus a filesystem mount.
    Loop,
    /// `hdiutil attach` of a native disk image.
    Hdiutil,
    /// `hdiutil attach -nomount` followed by `mount -t apfs`.
    HdiutilApfs,
    /// `hdiutil attach` with the raw disk image class.
    HdiutilRaw,
    /// Arsenal Image Mounter (`aim_cli`).
    Arsenal,
    /// PowerShell `Mount-DiskImage`.
    MountDiskImage,
}

impl MountBackend {
    pub fn name(self) -> &'static str {
        match self {
            Self::EwfFuse => "ewf_fuse",
            Self::QemuNbd => "qemu_nbd",
            Self::Loop => "loop",
            Self::Hdiutil => "hdiutil",
            Self::HdiutilApfs => "hdiutil_apfs",
            Self::HdiutilRaw => "hdiutil_raw",
            Self::Arsenal => "arsenal",
            Self::MountDiskImage => "mount_disk_image",
        }
    }
}

impl fmt::Display for MountBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

/// An active mount, exclusively owned by the mount registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRecord {
    /// Image that was mounted. Unique among active records.
    pub image_path: PathBuf,
    /// Directory or drive root where the filesystem is visible.
    pub mount_point: PathBuf,
    pub backend: MountBackend,
    /// Attached device, e.g. `/dev/loop3`, `/dev/disk4` or an AIM device number.
    pub device_handle: Option<String>,
    pub read_only: bool,
    pub created_at: DateTime<Utc>,
}
