/// Runtime configuration for adapters, discovery and execution.
///
/// Loaded from an optional JSON file and then overridden by `ELROND_*`
/// environment variables. Every field has a per-platform default so an
/// empty `{}` file (or no file at all) is a valid configuration.
use crate::error::ConfigError;
use crate::platform::Platform;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of Unix mount-point slots.
pub const DEFAULT_POOL_SIZE: usize = 10;

/// Default Windows drive-letter range for mounted images.
pub const DEFAULT_DRIVE_LETTERS: &str = "M-Z";

/// Default number of `/dev/nbdN` devices the Linux adapter may claim.
pub const DEFAULT_NBD_DEVICES: usize = 8;

/// Default wait for udev to create partition nodes.
pub const DEFAULT_PARTITION_WAIT_MS: u64 = 2000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ElrondConfig {
    /// Directory under which Unix mount points `elrond_mountNN` are created.
    pub mount_root: PathBuf,
    /// Number of Unix mount-point slots.
    pub pool_size: usize,
    /// Inclusive Windows drive-letter range, e.g. `"M-Z"`.
    pub drive_letters: String,
    /// NBD devices available to the Linux `qemu-nbd` backend.
    pub nbd_devices: Vec<PathBuf>,
    /// Replacement tool catalog; the built-in catalog is used when unset.
    pub catalog_path: Option<PathBuf>,
    /// Timeout applied to mount-related tool invocations.
    pub default_timeout_secs: Option<u64>,
    /// How long the Linux adapter waits for a `<device>p1` partition node
    /// to appear after attaching a loop or NBD device.
    pub partition_wait_ms: u64,
    /// Treat the process as elevated without checking (containers with
    /// granted capabilities but a non-zero uid).
    pub assume_elevated: bool,
}

impl Default for ElrondConfig {
    fn default() -> Self {
        Self::for_platform(Platform::current())
    }
}

impl ElrondConfig {
    /// Defaults appropriate for `platform`.
    pub fn for_platform(platform: Platform) -> Self {
        let mount_root = match platform {
            Platform::Linux => PathBuf::from("/mnt"),
            // `/mnt` is on the sealed system volume on modern macOS.
            Platform::MacOs => PathBuf::from("/tmp/elrond"),
            Platform::Windows => PathBuf::new(),
        };
        Self {
            mount_root,
            pool_size: DEFAULT_POOL_SIZE,
            drive_letters: DEFAULT_DRIVE_LETTERS.to_owned(),
            nbd_devices: (0..DEFAULT_NBD_DEVICES)
                .map(|i| PathBuf::from(format!("/dev/nbd{i}")))
                .collect(),
            catalog_path: None,
            default_timeout_secs: Some(300),
            partition_wait_ms: DEFAULT_PARTITION_WAIT_MS,
            assume_elevated: false,
        }
    }

    /// Parse a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `ELROND_*` overrides from the process environment.
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment in
    /// production, a map in tests).
    pub fn apply_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(root) = lookup("ELROND_MOUNT_ROOT") {
            self.mount_root = PathBuf::from(root);
        }
        if let Some(size) = lookup("ELROND_POOL_SIZE") {
            self.pool_size = size.parse().map_err(|_| ConfigError::InvalidValue {
                key: "ELROND_POOL_SIZE",
                value: size.clone(),
            })?;
        }
        if let Some(catalog) = lookup("ELROND_TOOL_CATALOG") {
            self.catalog_path = Some(PathBuf::from(catalog));
        }
        if let Some(flag) = lookup("ELROND_ASSUME_ELEVATED") {
            self.assume_elevated = matches!(flag.as_str(), "1" | "true" | "yes");
        }
        self.validate()?;
        Ok(self)
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_secs.map(Duration::from_secs)
    }

    pub fn partition_wait(&self) -> Duration {
        Duration::from_millis(self.partition_wait_ms)
    }

    /// Parse [`Self::drive_letters`] into an inclusive uppercase range.
    pub fn drive_letter_range(&self) -> Result<(char, char), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            key: "drive_letters",
            value: self.drive_letters.clone(),
        };
        let (first, last) = self.drive_letters.split_once('-').ok_or_else(invalid)?;
        let parse = |s: &str| {
            let mut chars = s.trim().chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) if c.is_ascii_alphabetic() => Some(c.to_ascii_uppercase()),
                _ => None,
            }
        };
        match (parse(first), parse(last)) {
            (Some(a), Some(b)) if a <= b => Ok((a, b)),
            _ => Err(invalid()),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 || self.pool_size > 100 {
            return Err(ConfigError::InvalidValue {
                key: "pool_size",
                value: self.pool_size.to_string(),
            });
        }
        self.drive_letter_range()?;
        Ok(())
    }
}
