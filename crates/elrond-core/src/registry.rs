/// Process-wide authority over active mounts.
///
/// Every successful mount is recorded here and nowhere else. The registry
/// rejects a second mount of an image that is already mounted (or still
/// being mounted by another thread) and unmounts everything in reverse
/// creation order when it is torn down or dropped, so nested mounts (an
/// EWF container and the filesystem inside it) come apart in the right
/// order.
use crate::error::MountError;
use crate::model::MountRecord;
use crate::platform::{PlatformAdapter, UnmountMode};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Per-request mount settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOptions {
    /// A specific pool slot; the next free slot is used when `None`.
    pub preferred_mount_point: Option<PathBuf>,
    /// Defaults to `true`. Evidence is never mounted writable by accident.
    pub read_only: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            preferred_mount_point: None,
            read_only: true,
        }
    }
}

impl MountOptions {
    pub fn at(mut self, mount_point: impl Into<PathBuf>) -> Self {
        self.preferred_mount_point = Some(mount_point.into());
        self
    }

    pub fn read_write(mut self) -> Self {
        self.read_only = false;
        self
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    /// Active mounts in creation order.
    records: Vec<MountRecord>,
    /// Image paths with a mount currently in flight.
    pending: HashSet<PathBuf>,
}

pub struct MountRegistry {
    adapter: Arc<dyn PlatformAdapter>,
    state: Mutex<RegistryState>,
}

impl MountRegistry {
    pub fn new(adapter: Arc<dyn PlatformAdapter>) -> Self {
        Self {
            adapter,
            state: Mutex::new(RegistryState::default()),
        }
    }

    pub fn adapter(&self) -> &Arc<dyn PlatformAdapter> {
        &self.adapter
    }

    /// Mount `path` through the adapter and record the result.
    pub fn mount(&self, path: &Path, opts: &MountOptions) -> Result<MountRecord, MountError> {
        let key = self.key_for(path)?;
        {
            let mut state = self.state.lock();
            if let Some(existing) = state.records.iter().find(|r| r.image_path == key) {
                return Err(MountError::AlreadyMounted {
                    path: key,
                    mount_point: existing.mount_point.clone(),
                });
            }
            if !state.pending.insert(key.clone()) {
                return Err(MountError::AlreadyMounted {
                    path: key,
                    mount_point: PathBuf::from("(mount in progress)"),
                });
            }
        }

        let result = self.adapter.mount(
            &key,
            opts.preferred_mount_point.as_deref(),
            opts.read_only,
        );

        let mut state = self.state.lock();
        state.pending.remove(&key);
        let record = result?;
        state.records.push(record.clone());
        Ok(record)
    }

    /// Unmount with the default clean-then-force strategy.
    pub fn unmount(&self, record: &MountRecord) -> Result<(), MountError> {
        self.unmount_with(record, UnmountMode::CleanThenForce)
    }

    /// Unmount `record`. Unmounting a record that is no longer active is a
    /// successful no-op; a failed unmount leaves the record registered.
    pub fn unmount_with(&self, record: &MountRecord, mode: UnmountMode) -> Result<(), MountError> {
        self.adapter.unmount(record, mode)?;
        self.state.lock().records.retain(|r| {
            !(r.image_path == record.image_path && r.mount_point == record.mount_point)
        });
        Ok(())
    }

    /// Snapshot of active mounts in creation order.
    pub fn records(&self) -> Vec<MountRecord> {
        self.state.lock().records.clone()
    }

    /// Active mount of the image at `path`, if any.
    pub fn find(&self, path: &Path) -> Option<MountRecord> {
        let key = self
            .key_for(path)
            .unwrap_or_else(|_| self.adapter.normalize_path(path));
        self.state
            .lock()
            .records
            .iter()
            .find(|r| r.image_path == key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unmount everything, newest first. Mounts that fail to unmount stay
    /// registered and their errors are returned.
    pub fn teardown(&self) -> Vec<MountError> {
        let records = self.records();
        if records.is_empty() {
            return Vec::new();
        }
        info!("Tearing down {} active mount(s)", records.len());
        let mut errors = Vec::new();
        for record in records.iter().rev() {
            if let Err(err) = self.unmount(record) {
                warn!("Teardown of {} failed: {err}", record.mount_point.display());
                errors.push(err);
            }
        }
        errors
    }

    /// The registry's key for an image: canonical, platform-normalised path.
    fn key_for(&self, path: &Path) -> Result<PathBuf, MountError> {
        let canonical = std::fs::canonicalize(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => MountError::ImageNotFound(path.to_path_buf()),
            _ => MountError::Io {
                path: path.to_path_buf(),
                source: e,
            },
        })?;
        Ok(self.adapter.normalize_path(&canonical))
    }
}

impl Drop for MountRegistry {
    fn drop(&mut self) {
        let errors = self.teardown();
        if !errors.is_empty() {
            warn!("{} mount(s) could not be released on shutdown", errors.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MountBackend;
    use crate::platform::Platform;
    use chrono::Utc;
    use std::sync::Barrier;
    use std::time::Duration;
    use tempfile::TempDir;

    /// In-memory adapter that logs unmount order.
    #[derive(Default)]
    struct FakeAdapter {
        next: parking_lot::Mutex<usize>,
        active: parking_lot::Mutex<Vec<PathBuf>>,
        unmounted: Arc<parking_lot::Mutex<Vec<PathBuf>>>,
        mount_delay: Duration,
        fail_unmount: bool,
    }

    impl PlatformAdapter for FakeAdapter {
        fn platform(&self) -> Platform {
            Platform::Linux
        }

        fn mount(
            &self,
            path: &Path,
            preferred_mount_point: Option<&Path>,
            read_only: bool,
        ) -> Result<MountRecord, MountError> {
            std::thread::sleep(self.mount_delay);
            let mount_point = match preferred_mount_point {
                Some(p) => p.to_path_buf(),
                None => {
                    let mut next = self.next.lock();
                    *next += 1;
                    PathBuf::from(format!("/mnt/elrond_mount{:02}", *next - 1))
                }
            };
            self.active.lock().push(mount_point.clone());
            Ok(MountRecord {
                image_path: path.to_path_buf(),
                mount_point,
                backend: MountBackend::EwfFuse,
                device_handle: None,
                read_only,
                created_at: Utc::now(),
            })
        }

        fn unmount(&self, record: &MountRecord, _mode: UnmountMode) -> Result<(), MountError> {
            if self.fail_unmount {
                return Err(MountError::UnmountFailed {
                    mount_point: record.mount_point.clone(),
                    reason: "target is busy".into(),
                });
            }
            let mut active = self.active.lock();
            if let Some(pos) = active.iter().position(|p| p == &record.mount_point) {
                active.remove(pos);
                self.unmounted.lock().push(record.mount_point.clone());
            }
            Ok(())
        }

        fn available_mount_points(&self) -> Vec<PathBuf> {
            Vec::new()
        }

        fn pool_capacity(&self) -> usize {
            10
        }

        fn check_permissions(&self) -> (bool, String) {
            (true, String::new())
        }

        fn normalize_path(&self, path: &Path) -> PathBuf {
            path.to_path_buf()
        }

        fn is_active(&self, mount_point: &Path) -> bool {
            self.active.lock().iter().any(|p| p == mount_point)
        }

        fn active_mounts(&self) -> Vec<PathBuf> {
            self.active.lock().clone()
        }
    }

    fn image(tmp: &TempDir, name: &str) -> PathBuf {
        let path = tmp.path().join(name);
        std::fs::write(&path, b"EVF\x09\x0d\x0a\xff\x00").unwrap();
        std::fs::canonicalize(path).unwrap()
    }

    #[test]
    fn test_mount_defaults_to_read_only() {
        let tmp = TempDir::new().unwrap();
        let registry = MountRegistry::new(Arc::new(FakeAdapter::default()));
        let record = registry
            .mount(&image(&tmp, "a.E01"), &MountOptions::default())
            .unwrap();
        assert!(record.read_only);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_second_mount_of_same_image_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let registry = MountRegistry::new(Arc::new(FakeAdapter::default()));
        let path = image(&tmp, "a.E01");
        let first = registry.mount(&path, &MountOptions::default()).unwrap();

        match registry.mount(&path, &MountOptions::default()) {
            Err(MountError::AlreadyMounted { mount_point, .. }) => {
                assert_eq!(mount_point, first.mount_point)
            }
            other => panic!("expected AlreadyMounted, got {other:?}"),
        }
        assert_eq!(registry.find(&path), Some(first));
    }

    #[test]
    fn test_concurrent_mount_of_same_image_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let adapter = FakeAdapter {
            mount_delay: Duration::from_millis(300),
            ..FakeAdapter::default()
        };
        let registry = Arc::new(MountRegistry::new(Arc::new(adapter)));
        let path = image(&tmp, "a.E01");
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let registry = registry.clone();
                let path = path.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    registry.mount(&path, &MountOptions::default())
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(MountError::AlreadyMounted { .. }))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unmount_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let registry = MountRegistry::new(Arc::new(FakeAdapter::default()));
        let record = registry
            .mount(&image(&tmp, "a.E01"), &MountOptions::default())
            .unwrap();
        registry.unmount(&record).unwrap();
        registry.unmount(&record).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_teardown_is_lifo_and_runs_on_drop() {
        let tmp = TempDir::new().unwrap();
        let unmounted = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let adapter = FakeAdapter {
            unmounted: unmounted.clone(),
            ..FakeAdapter::default()
        };
        let registry = MountRegistry::new(Arc::new(adapter));
        let outer = registry
            .mount(&image(&tmp, "outer.E01"), &MountOptions::default())
            .unwrap();
        let inner = registry
            .mount(&image(&tmp, "inner.raw"), &MountOptions::default())
            .unwrap();

        drop(registry);
        assert_eq!(*unmounted.lock(), vec![inner.mount_point, outer.mount_point]);
    }

    #[test]
    fn test_failed_unmount_keeps_record() {
        let tmp = TempDir::new().unwrap();
        let adapter = FakeAdapter {
            fail_unmount: true,
            ..FakeAdapter::default()
        };
        let registry = MountRegistry::new(Arc::new(adapter));
        let record = registry
            .mount(&image(&tmp, "a.E01"), &MountOptions::default())
            .unwrap();
        assert!(registry.unmount(&record).is_err());
        assert_eq!(registry.records(), vec![record]);
        assert_eq!(registry.teardown().len(), 1);
    }

    #[test]
    fn test_missing_image_is_reported_before_adapter_runs() {
        let registry = MountRegistry::new(Arc::new(FakeAdapter::default()));
        let err = registry
            .mount(Path::new("/definitely/not/here.E01"), &MountOptions::default())
            .unwrap_err();
        assert!(matches!(err, MountError::ImageNotFound(_)));
    }
}
