//! End-to-end mount tests against the real Linux adapter.
//!
//! Every external mount tool is replaced by a shell script in a temporary
//! `bin/` directory that appends its arguments to a log and exits with a
//! scripted status. The adapter, pool, registry, discovery and executor are
//! the production code paths; only the binaries they launch are fake, so
//! no root and no kernel modules are needed.
#![cfg(unix)]

use elrond_core::error::AttemptFailure;
use elrond_core::platform::is_elevated;
use elrond_core::{
    create_adapter, CommandExecutor, ElrondConfig, MountBackend, MountError, MountOptions,
    MountRegistry, Platform, PlatformAdapter, ToolCatalog, ToolDiscovery, UnmountMode,
};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier};
use tempfile::TempDir;

const EWF_HEADER: &[u8] = b"EVF\x09\x0d\x0a\xff\x00";
const VMDK_HEADER: &[u8] = b"KDMV";

/// Every tool id the Linux adapter may launch.
const MOUNT_TOOLS: &[&str] = &["ewfmount", "fusermount", "qemu-nbd", "losetup", "mount", "umount"];

// ── Helpers ──────────────────────────────────────────────────────────────────

struct Fixture {
    tmp: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("bin")).unwrap();
        fs::create_dir_all(tmp.path().join("mnt")).unwrap();
        fs::create_dir_all(tmp.path().join("evidence")).unwrap();
        Self { tmp }
    }

    fn bin(&self) -> PathBuf {
        self.tmp.path().join("bin")
    }

    fn mount_root(&self) -> PathBuf {
        self.tmp.path().join("mnt")
    }

    fn log(&self) -> PathBuf {
        self.tmp.path().join("calls.log")
    }

    /// Install a fake tool that logs `<name> <args...>` and then runs `body`.
    fn tool(&self, name: &str, body: &str) {
        let script = self.bin().join(name);
        fs::write(
            &script,
            format!(
                "#!/bin/sh\necho \"{name} $*\" >> '{log}'\n{body}\n",
                log = self.log().display()
            ),
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    }

    /// Install every mount tool as a no-op that succeeds.
    fn all_tools_succeed(&self) {
        for name in MOUNT_TOOLS {
            self.tool(name, "exit 0");
        }
    }

    fn image(&self, name: impl AsRef<Path>, header: &[u8]) -> PathBuf {
        let path = self.tmp.path().join("evidence").join(name);
        let mut bytes = header.to_vec();
        bytes.resize(4096, 0);
        fs::write(&path, bytes).unwrap();
        path
    }

    fn calls(&self) -> Vec<String> {
        String::from_utf8_lossy(&fs::read(self.log()).unwrap_or_default())
            .lines()
            .map(str::to_owned)
            .collect()
    }

    fn config(&self, pool_size: usize) -> ElrondConfig {
        ElrondConfig {
            mount_root: self.mount_root(),
            pool_size,
            nbd_devices: vec![self.tmp.path().join("nbd0")],
            default_timeout_secs: Some(30),
            partition_wait_ms: 0,
            ..ElrondConfig::for_platform(Platform::Linux)
        }
    }

    fn adapter(&self, config: &ElrondConfig) -> Arc<dyn PlatformAdapter> {
        let entries: Vec<String> = MOUNT_TOOLS
            .iter()
            .map(|id| {
                format!(
                    r#"{{"id": "{id}", "category": "mount", "platforms": ["linux"],
                        "executable_names": ["{id}"],
                        "search_paths": {{"linux": ["{bin}"]}},
                        "install_hint": {{"linux": "install {id}"}}}}"#,
                    bin = self.bin().display()
                )
            })
            .collect();
        let catalog = ToolCatalog::from_json(&format!(r#"{{"tools": [{}]}}"#, entries.join(",")))
            .unwrap();
        let discovery = ToolDiscovery::new(Arc::new(catalog))
            .with_platform(Platform::Linux)
            .with_system_path(Vec::new());
        let executor = Arc::new(CommandExecutor::new(Arc::new(discovery)));
        create_adapter(Platform::Linux, config, executor).unwrap()
    }
}

fn slot(root: &Path, i: usize) -> PathBuf {
    root.join(format!("elrond_mount{i:02}"))
}

// ── Lifecycle ────────────────────────────────────────────────────────────────

#[test]
fn test_ewf_mount_then_unmount_restores_pool() {
    let fx = Fixture::new();
    fx.all_tools_succeed();
    let adapter = fx.adapter(&fx.config(3));
    let image = fx.image("case.E01", EWF_HEADER);

    assert_eq!(adapter.available_mount_points().len(), 3);
    let record = adapter.mount(&image, None, true).unwrap();

    assert_eq!(record.backend, MountBackend::EwfFuse);
    assert!(record.read_only);
    assert!(record.mount_point.ends_with("elrond_mount00"));
    assert!(record.mount_point.is_dir(), "mount point directory is created on claim");
    assert_eq!(record.mount_point, slot(&fx.mount_root(), 0));
    assert_eq!(adapter.available_mount_points().len(), 2);
    assert!(adapter.is_active(&record.mount_point));

    adapter.unmount(&record, UnmountMode::CleanThenForce).unwrap();
    assert_eq!(adapter.available_mount_points().len(), 3);
    assert!(!adapter.is_active(&record.mount_point));

    let calls = fx.calls();
    assert!(calls[0].starts_with("ewfmount "));
    assert!(calls[0].ends_with("elrond_mount00"));
    assert!(calls.iter().any(|c| c.starts_with("fusermount -u ")));
}

#[test]
fn test_unmount_is_idempotent() {
    let fx = Fixture::new();
    fx.all_tools_succeed();
    let adapter = fx.adapter(&fx.config(2));
    let record = adapter
        .mount(&fx.image("case.E01", EWF_HEADER), None, true)
        .unwrap();

    adapter.unmount(&record, UnmountMode::Clean).unwrap();
    adapter.unmount(&record, UnmountMode::Clean).unwrap();

    let detaches = fx
        .calls()
        .iter()
        .filter(|c| c.starts_with("fusermount"))
        .count();
    assert_eq!(detaches, 1, "second unmount must not touch the OS");
    assert_eq!(adapter.available_mount_points().len(), 2);
}

#[test]
fn test_clean_then_force_falls_back_to_lazy_detach() {
    let fx = Fixture::new();
    fx.all_tools_succeed();
    fx.tool(
        "fusermount",
        r#"case "$1" in -u) echo "fusermount: failed to unmount: Device or resource busy" >&2; exit 1;; esac; exit 0"#,
    );
    fx.tool("umount", r#"[ "$1" = "-l" ] && exit 0; echo "umount: target is busy." >&2; exit 32"#);
    let adapter = fx.adapter(&fx.config(2));
    let record = adapter
        .mount(&fx.image("case.E01", EWF_HEADER), None, true)
        .unwrap();

    assert!(matches!(
        adapter.unmount(&record, UnmountMode::Clean),
        Err(MountError::UnmountFailed { .. })
    ));
    assert!(adapter.is_active(&record.mount_point), "failed unmount keeps the mount");

    adapter.unmount(&record, UnmountMode::CleanThenForce).unwrap();
    assert!(fx.calls().iter().any(|c| c.starts_with("fusermount -uz ")));
    assert_eq!(adapter.available_mount_points().len(), 2);
}

#[test]
fn test_preferred_mount_point_must_be_pool_member() {
    let fx = Fixture::new();
    fx.all_tools_succeed();
    let config = fx.config(3);
    let adapter = fx.adapter(&config);
    let image = fx.image("case.E01", EWF_HEADER);

    let wanted = slot(&config.mount_root, 2);
    let record = adapter.mount(&image, Some(&wanted), true).unwrap();
    assert_eq!(record.mount_point, wanted);

    let other = fx.image("other.E01", EWF_HEADER);
    let outside = fx.tmp.path().join("elsewhere");
    assert!(matches!(
        adapter.mount(&other, Some(&outside), true),
        Err(MountError::InvalidMountPoint(_))
    ));
    assert!(matches!(
        adapter.mount(&other, Some(&wanted), true),
        Err(MountError::InvalidMountPoint(_))
    ));
}

// ── Pool ─────────────────────────────────────────────────────────────────────

#[test]
fn test_pool_exhaustion_under_concurrency() {
    let fx = Fixture::new();
    fx.all_tools_succeed();
    // Hold each slot long enough for all threads to race for the pool.
    fx.tool("ewfmount", "sleep 1");
    let adapter = fx.adapter(&fx.config(2));
    let images: Vec<_> = (0..3)
        .map(|i| fx.image(&format!("disk{i}.E01"), EWF_HEADER))
        .collect();

    let barrier = Arc::new(Barrier::new(images.len()));
    let handles: Vec<_> = images
        .into_iter()
        .map(|image| {
            let adapter = adapter.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                adapter.mount(&image, None, true)
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let exhausted = results
        .iter()
        .filter(|r| matches!(r, Err(MountError::PoolExhausted { capacity: 2 })))
        .count();
    assert_eq!(exhausted, 1);

    let mut points: Vec<_> = results
        .iter()
        .filter_map(|r| r.as_ref().ok())
        .map(|r| r.mount_point.clone())
        .collect();
    points.sort();
    points.dedup();
    assert_eq!(points.len(), 2, "successful mounts hold distinct mount points");
    assert!(adapter.available_mount_points().is_empty());
}

// ── Fallback and failure reporting ───────────────────────────────────────────

#[test]
fn test_missing_ewfmount_reports_tool_not_found() {
    let fx = Fixture::new();
    fx.all_tools_succeed();
    fs::remove_file(fx.bin().join("ewfmount")).unwrap();
    let adapter = fx.adapter(&fx.config(2));

    let err = adapter
        .mount(&fx.image("case.E01", EWF_HEADER), None, true)
        .unwrap_err();
    match &err {
        MountError::MountFailed { attempts, .. } => {
            assert_eq!(attempts.len(), 1);
            assert_eq!(attempts[0].to_string(), "ewf_fuse: tool not found");
            match &attempts[0].reason {
                AttemptFailure::ToolNotFound { suggestion, .. } => {
                    assert_eq!(suggestion, "install ewfmount")
                }
                other => panic!("unexpected reason: {other:?}"),
            }
        }
        other => panic!("expected MountFailed, got {other:?}"),
    }
    assert_eq!(adapter.available_mount_points().len(), 2, "slot returned on failure");
}

#[test]
fn test_nbd_failure_disconnects_before_reporting() {
    let fx = Fixture::new();
    fx.all_tools_succeed();
    fx.tool("mount", r#"echo "mount: wrong fs type, bad option, bad superblock" >&2; exit 32"#);
    fs::write(fx.tmp.path().join("nbd0"), b"").unwrap();
    let config = ElrondConfig {
        assume_elevated: true,
        ..fx.config(2)
    };
    let adapter = fx.adapter(&config);
    let image = fx.image("disk.vmdk", VMDK_HEADER);

    let err = adapter.mount(&image, None, true).unwrap_err();
    let attempts = err.attempts();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].backend, MountBackend::QemuNbd);
    assert!(attempts[0].to_string().contains("wrong fs type"));

    let calls = fx.calls();
    let connect = calls
        .iter()
        .position(|c| c.starts_with("qemu-nbd --read-only --connect="))
        .expect("qemu-nbd connect was called");
    let disconnect = calls
        .iter()
        .position(|c| c.starts_with("qemu-nbd --disconnect "))
        .expect("partial NBD attachment was released");
    assert!(connect < disconnect);
    assert_eq!(adapter.available_mount_points().len(), 2);

    // The NBD device was returned too: a second attempt can claim it again.
    let err = adapter.mount(&image, None, true).unwrap_err();
    assert!(!matches!(
        err.attempts()[0].reason,
        AttemptFailure::Unavailable(_)
    ));
}

#[test]
fn test_loop_mount_records_device_and_detaches_it() {
    let fx = Fixture::new();
    fx.all_tools_succeed();
    fx.tool("losetup", r#"[ "$1" = "--find" ] && echo /dev/loop9; exit 0"#);
    let config = ElrondConfig {
        assume_elevated: true,
        ..fx.config(2)
    };
    let adapter = fx.adapter(&config);

    let record = adapter
        .mount(&fx.image("disk.dd", &[]), None, true)
        .unwrap();
    assert_eq!(record.backend, MountBackend::Loop);
    assert_eq!(record.device_handle.as_deref(), Some("/dev/loop9"));

    adapter.unmount(&record, UnmountMode::Clean).unwrap();
    let calls = fx.calls();
    assert!(calls.iter().any(|c| c.starts_with("losetup --find --show --partscan --read-only ")));
    assert!(calls.iter().any(|c| c.starts_with("mount -o ro /dev/loop9 ")));
    assert!(calls.iter().any(|c| c == "losetup -d /dev/loop9"));
}

#[test]
fn test_loop_without_reported_device_detaches_bound_devices() {
    let fx = Fixture::new();
    fx.all_tools_succeed();
    // `--find --show` prints nothing; `-j` still lists the binding it made.
    fx.tool(
        "losetup",
        r#"case "$1" in -j) echo "/dev/loop5: [2049]:12 ($2)";; esac; exit 0"#,
    );
    let config = ElrondConfig {
        assume_elevated: true,
        ..fx.config(2)
    };
    let adapter = fx.adapter(&config);

    let err = adapter
        .mount(&fx.image("disk.dd", &[]), None, true)
        .unwrap_err();
    let attempts = err.attempts();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].backend, MountBackend::Loop);
    assert!(attempts[0].to_string().contains("losetup reported no device"));

    let calls = fx.calls();
    assert!(calls.iter().any(|c| c.starts_with("losetup -j ")));
    assert!(calls.iter().any(|c| c == "losetup -d /dev/loop5"));
    assert!(!calls.iter().any(|c| c.starts_with("mount ")));
    assert_eq!(adapter.available_mount_points().len(), 2);
}

#[test]
fn test_privileged_backends_fail_fast_when_not_elevated() {
    if is_elevated() {
        return;
    }
    let fx = Fixture::new();
    fx.all_tools_succeed();
    let adapter = fx.adapter(&fx.config(2));

    let err = adapter
        .mount(&fx.image("disk.dd", &[]), None, true)
        .unwrap_err();
    assert!(matches!(err, MountError::PermissionDenied(_)));
    assert!(fx.calls().is_empty(), "no tool runs before the privilege check");
    assert_eq!(adapter.available_mount_points().len(), 2);
    assert!(!adapter.check_permissions().0);
}

#[test]
fn test_apfs_is_unsupported_on_linux() {
    let fx = Fixture::new();
    fx.all_tools_succeed();
    let adapter = fx.adapter(&fx.config(2));
    let mut header = vec![0u8; 32];
    header.extend_from_slice(b"NXSB");

    let err = adapter
        .mount(&fx.image("container.img", &header), None, true)
        .unwrap_err();
    assert!(matches!(err, MountError::UnsupportedFormat { .. }));
    assert!(fx.calls().is_empty());
}

#[test]
fn test_non_utf8_image_name_is_passed_through_unchanged() {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    let fx = Fixture::new();
    fx.all_tools_succeed();
    let adapter = fx.adapter(&fx.config(2));
    let name = OsStr::from_bytes(b"case\xff.E01");
    let image = fx.image(name, EWF_HEADER);

    let registry = MountRegistry::new(adapter.clone());
    let record = registry.mount(&image, &MountOptions::default()).unwrap();
    assert_eq!(record.backend, MountBackend::EwfFuse);
    assert_eq!(record.image_path.file_name(), Some(name));
    assert!(record.image_path.is_file(), "recorded path names the real file");
    assert!(fx.calls()[0].contains("case\u{FFFD}.E01"));

    assert!(matches!(
        registry.mount(&image, &MountOptions::default()),
        Err(MountError::AlreadyMounted { .. })
    ));
}

#[test]
fn test_missing_image_is_not_found() {
    let fx = Fixture::new();
    let adapter = fx.adapter(&fx.config(2));
    let err = adapter
        .mount(&fx.tmp.path().join("nope.E01"), None, true)
        .unwrap_err();
    assert!(matches!(err, MountError::ImageNotFound(_)));
}

// ── Registry ─────────────────────────────────────────────────────────────────

#[test]
fn test_registry_rejects_duplicates_and_tears_down_on_drop() {
    let fx = Fixture::new();
    fx.all_tools_succeed();
    let adapter = fx.adapter(&fx.config(3));
    let registry = MountRegistry::new(adapter.clone());
    let outer = fx.image("outer.E01", EWF_HEADER);
    let inner = fx.image("inner.E01", EWF_HEADER);

    let first = registry.mount(&outer, &MountOptions::default()).unwrap();
    let second = registry.mount(&inner, &MountOptions::default()).unwrap();
    assert!(matches!(
        registry.mount(&outer, &MountOptions::default()),
        Err(MountError::AlreadyMounted { .. })
    ));
    assert_eq!(registry.len(), 2);
    assert_eq!(adapter.available_mount_points().len(), 1);

    drop(registry);
    assert_eq!(adapter.available_mount_points().len(), 3);
    let unmounts: Vec<_> = fx
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("fusermount -u "))
        .collect();
    assert_eq!(unmounts.len(), 2);
    assert!(unmounts[0].ends_with(&*second.mount_point.to_string_lossy()));
    assert!(unmounts[1].ends_with(&*first.mount_point.to_string_lossy()));
}
