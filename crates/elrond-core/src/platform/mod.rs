/// Platform-specific mounting: the `PlatformAdapter` contract and its
/// Linux, macOS and Windows variants.
///
/// The variant is chosen once at startup by [`create_adapter`]. Each variant
/// owns a bounded mount-point pool and an ordered list of backends per image
/// type; the shared fallback driver lives in [`adapter`].
pub mod adapter;
pub mod linux;
pub mod macos;
pub mod paths;
pub mod permissions;
pub mod pool;
pub mod windows;

pub use adapter::{Adapter, Attachment};
pub use linux::{LinuxAdapter, LinuxBackends};
pub use macos::{MacOsAdapter, MacOsBackends};
pub use permissions::is_elevated;
pub use pool::MountPointPool;
pub use windows::{WindowsAdapter, WindowsBackends};

use crate::config::ElrondConfig;
use crate::error::{ConfigError, MountError};
use crate::exec::CommandExecutor;
use crate::model::MountRecord;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Host operating system family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    #[serde(rename = "macos")]
    MacOs,
    Windows,
}

impl Platform {
    /// The platform this binary was compiled for. Unix flavours other than
    /// macOS are treated as Linux.
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Self::Windows
        } else if cfg!(target_os = "macos") {
            Self::MacOs
        } else {
            Self::Linux
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::MacOs => "macos",
            Self::Windows => "windows",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

/// How hard [`PlatformAdapter::unmount`] should try.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnmountMode {
    /// Regular unmount; fails if the filesystem is busy.
    Clean,
    /// Lazy/forced detach even with open handles.
    Force,
    /// Clean first, forced detach if the clean attempt fails.
    #[default]
    CleanThenForce,
}

/// The per-OS mount contract.
///
/// Implementations are `Send + Sync`; pool and device allocation are
/// serialised internally by a single mutex, while the external mount
/// commands themselves run outside it.
pub trait PlatformAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    /// Identify and mount `path`, trying each backend for its type in order.
    ///
    /// `preferred_mount_point` must be a free member of the pool.
    fn mount(
        &self,
        path: &Path,
        preferred_mount_point: Option<&Path>,
        read_only: bool,
    ) -> Result<MountRecord, MountError>;

    /// Unmount `record`. Unmounting a record this adapter no longer tracks
    /// succeeds as a no-op.
    fn unmount(&self, record: &MountRecord, mode: UnmountMode) -> Result<(), MountError>;

    /// Free slots in the mount-point pool.
    fn available_mount_points(&self) -> Vec<PathBuf>;

    /// Total slots in the mount-point pool.
    fn pool_capacity(&self) -> usize;

    /// `(true, _)` when the process can use every backend; the message
    /// explains what is missing otherwise.
    fn check_permissions(&self) -> (bool, String);

    /// Canonical platform syntax for `path`.
    fn normalize_path(&self, path: &Path) -> PathBuf;

    /// Whether `mount_point` currently holds a mount made by this adapter.
    fn is_active(&self, mount_point: &Path) -> bool;

    /// Mount points currently held by this adapter.
    fn active_mounts(&self) -> Vec<PathBuf>;
}

/// Build the adapter variant for `platform`.
pub fn create_adapter(
    platform: Platform,
    config: &ElrondConfig,
    executor: Arc<CommandExecutor>,
) -> Result<Arc<dyn PlatformAdapter>, ConfigError> {
    let adapter: Arc<dyn PlatformAdapter> = match platform {
        Platform::Linux => Arc::new(LinuxAdapter::from_config(config, executor)),
        Platform::MacOs => Arc::new(MacOsAdapter::from_config(config, executor)),
        Platform::Windows => Arc::new(WindowsAdapter::from_config(config, executor)?),
    };
    tracing::info!(
        "Using {platform} mount adapter ({} mount points)",
        adapter.pool_capacity()
    );
    Ok(adapter)
}
