/// Bounded mount-point pool.
///
/// Unix pools are pre-named directories (`<root>/elrond_mount00` ...);
/// Windows pools are a drive-letter range. The pool itself is not
/// synchronised: the owning adapter keeps it behind its single mutex.
use std::path::{Path, PathBuf};

/// Probe reporting whether a slot is taken by something outside the pool
/// (a stale mount from a previous run, a drive letter in use).
pub type OccupiedProbe = fn(&Path) -> bool;

#[derive(Debug)]
pub struct MountPointPool {
    slots: Vec<PathBuf>,
    in_use: Vec<bool>,
    occupied: OccupiedProbe,
}

impl MountPointPool {
    pub fn new(slots: Vec<PathBuf>, occupied: OccupiedProbe) -> Self {
        let in_use = vec![false; slots.len()];
        Self {
            slots,
            in_use,
            occupied,
        }
    }

    /// `<root>/elrond_mount00` .. `<root>/elrond_mount{size-1}`.
    pub fn unix(root: &Path, size: usize) -> Self {
        let slots = (0..size)
            .map(|i| root.join(format!("elrond_mount{i:02}")))
            .collect();
        Self::new(slots, is_foreign_mount)
    }

    /// Drive roots `first:\` ..= `last:\`.
    pub fn drive_letters(first: char, last: char) -> Self {
        let slots = (first..=last).map(|c| PathBuf::from(format!("{c}:\\"))).collect();
        Self::new(slots, |root| root.exists())
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claim the first free slot.
    pub fn reserve_next(&mut self) -> Option<PathBuf> {
        let occupied = self.occupied;
        let idx = (0..self.slots.len()).find(|&i| !self.in_use[i] && !occupied(&self.slots[i]))?;
        self.in_use[idx] = true;
        Some(self.slots[idx].clone())
    }

    /// Claim a specific slot. Fails if it is not a pool member or is taken.
    pub fn reserve(&mut self, mount_point: &Path) -> Option<PathBuf> {
        let idx = self.index_of(mount_point)?;
        if self.in_use[idx] || (self.occupied)(&self.slots[idx]) {
            return None;
        }
        self.in_use[idx] = true;
        Some(self.slots[idx].clone())
    }

    /// Return a slot. Returns `false` if it was not reserved.
    pub fn release(&mut self, mount_point: &Path) -> bool {
        match self.index_of(mount_point) {
            Some(idx) if self.in_use[idx] => {
                self.in_use[idx] = false;
                true
            }
            _ => false,
        }
    }

    /// Slots that are neither reserved nor externally occupied.
    pub fn free(&self) -> Vec<PathBuf> {
        self.slots
            .iter()
            .zip(&self.in_use)
            .filter(|(slot, used)| !**used && !(self.occupied)(slot))
            .map(|(slot, _)| slot.clone())
            .collect()
    }

    pub fn contains(&self, mount_point: &Path) -> bool {
        self.index_of(mount_point).is_some()
    }

    fn index_of(&self, mount_point: &Path) -> Option<usize> {
        self.slots.iter().position(|s| s == mount_point)
    }
}

/// A directory on a different device than its parent is a mount point.
/// Unreadable directories (dead FUSE endpoints) count as occupied.
#[cfg(unix)]
fn is_foreign_mount(path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return false,
        Err(_) => return true,
    };
    match path.parent().map(std::fs::metadata) {
        Some(Ok(parent)) => parent.dev() != meta.dev(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn is_foreign_mount(_path: &Path) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn never(_: &Path) -> bool {
        false
    }

    fn pool(n: usize) -> MountPointPool {
        let slots = (0..n).map(|i| PathBuf::from(format!("/mnt/elrond_mount{i:02}"))).collect();
        MountPointPool::new(slots, never)
    }

    #[test]
    fn test_unix_slot_names() {
        let pool = MountPointPool::unix(Path::new("/mnt"), 3);
        assert_eq!(pool.capacity(), 3);
        assert!(pool.contains(Path::new("/mnt/elrond_mount00")));
        assert!(pool.contains(Path::new("/mnt/elrond_mount02")));
    }

    #[test]
    fn test_drive_letter_slots() {
        let pool = MountPointPool::new(
            ('M'..='O').map(|c| PathBuf::from(format!("{c}:\\"))).collect(),
            never,
        );
        assert_eq!(pool.capacity(), 3);
        assert!(pool.contains(Path::new("N:\\")));
    }

    #[test]
    fn test_reserve_until_exhausted_then_release() {
        let mut pool = pool(2);
        let a = pool.reserve_next().unwrap();
        let b = pool.reserve_next().unwrap();
        assert_ne!(a, b);
        assert!(pool.reserve_next().is_none());
        assert!(pool.free().is_empty());

        assert!(pool.release(&a));
        assert!(!pool.release(&a), "double release must be rejected");
        assert_eq!(pool.free(), vec![a.clone()]);
        assert_eq!(pool.reserve_next(), Some(a));
    }

    #[test]
    fn test_reserve_specific_slot() {
        let mut pool = pool(3);
        let wanted = PathBuf::from("/mnt/elrond_mount01");
        assert_eq!(pool.reserve(&wanted), Some(wanted.clone()));
        assert!(pool.reserve(&wanted).is_none());
        assert!(pool.reserve(Path::new("/mnt/elsewhere")).is_none());
        assert_eq!(pool.reserve_next(), Some(PathBuf::from("/mnt/elrond_mount00")));
    }

    #[test]
    fn test_occupied_slots_are_skipped() {
        fn first_taken(p: &Path) -> bool {
            p.ends_with("elrond_mount00")
        }
        let slots = (0..2).map(|i| PathBuf::from(format!("/mnt/elrond_mount{i:02}"))).collect();
        let mut pool = MountPointPool::new(slots, first_taken);
        assert_eq!(pool.free().len(), 1);
        assert_eq!(pool.reserve_next(), Some(PathBuf::from("/mnt/elrond_mount01")));
    }

    #[cfg(unix)]
    #[test]
    fn test_plain_directory_is_not_a_foreign_mount() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("elrond_mount00");
        assert!(!is_foreign_mount(&dir));
        std::fs::create_dir(&dir).unwrap();
        assert!(!is_foreign_mount(&dir));
    }
}
