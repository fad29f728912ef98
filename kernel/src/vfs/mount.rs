//! Mount table
//!
//! Maps short paths such as `/mnt` onto drive indices. Nothing about the
//! volume is cached here beyond its detected kind: every lookup mounts the
//! drive afresh, so a swapped disk is picked up on the next call.

use super::{find_entry, mount, DirEntry, FsError, FsKind, FsResult, MAX_DIR_ENTRIES};
use crate::drivers::{BlockDevice, DiskError, DriveIndex};

/// Table capacity
pub const MAX_MOUNTS: usize = 8;

/// Longest mount path, in bytes
pub const MAX_MOUNT_PATH: usize = 31;

/// One path-to-drive binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountPoint {
    path: [u8; MAX_MOUNT_PATH],
    path_len: u8,
    drive: DriveIndex,
    kind: FsKind,
}

impl MountPoint {
    fn new(path: &str, drive: DriveIndex, kind: FsKind) -> Self {
        let mut buf = [0u8; MAX_MOUNT_PATH];
        buf[..path.len()].copy_from_slice(path.as_bytes());
        Self { path: buf, path_len: path.len() as u8, drive, kind }
    }

    pub fn path(&self) -> &str {
        core::str::from_utf8(&self.path[..self.path_len as usize]).unwrap_or("")
    }

    pub fn drive(&self) -> DriveIndex {
        self.drive
    }

    /// Filesystem found when the mount was made
    pub fn kind(&self) -> FsKind {
        self.kind
    }
}

/// What [`MountTable::mount`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountOutcome {
    Mounted,
    /// The path was already bound and now points at the new drive
    Remounted,
}

/// Up to [`MAX_MOUNTS`] mount points, in mount order
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    mounts: [Option<MountPoint>; MAX_MOUNTS],
}

impl MountTable {
    pub const fn new() -> Self {
        Self { mounts: [None; MAX_MOUNTS] }
    }

    pub fn iter(&self) -> impl Iterator<Item = &MountPoint> {
        self.mounts.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bind `path` to `device` (`/dev/diskN` or `/dev/sataN`).
    ///
    /// The drive must be present and hold a FAT volume. Binding a path that
    /// is already mounted replaces its drive.
    pub fn mount<D: BlockDevice + ?Sized>(
        &mut self,
        dev: &mut D,
        device: &str,
        path: &str,
    ) -> FsResult<MountOutcome> {
        let drive = match DriveIndex::parse_device(device) {
            Some((drive, "")) => drive,
            _ => return Err(FsError::InvalidPath),
        };
        if !path.starts_with('/') || path.len() < 2 || path.len() > MAX_MOUNT_PATH {
            return Err(FsError::InvalidPath);
        }
        if !dev.drive_exists(drive) {
            return Err(FsError::Disk(DiskError::DriveAbsent));
        }

        let kind = mount(dev, drive)?.kind();

        if let Some(existing) = self.mounts.iter_mut().flatten().find(|m| m.path() == path) {
            existing.drive = drive;
            existing.kind = kind;
            crate::log!("[MOUNT] Remounted {} -> {} ({})", drive, path, kind.name());
            return Ok(MountOutcome::Remounted);
        }

        let slot = self
            .mounts
            .iter_mut()
            .find(|m| m.is_none())
            .ok_or(FsError::MountTableFull)?;
        *slot = Some(MountPoint::new(path, drive, kind));

        crate::log!("[MOUNT] Mounted {} -> {} ({})", drive, path, kind.name());
        Ok(MountOutcome::Mounted)
    }

    /// Mount point whose path equals `path`, ignoring ASCII case
    pub fn find(&self, path: &str) -> Option<&MountPoint> {
        self.iter().find(|m| m.path().eq_ignore_ascii_case(path))
    }

    /// Split a file path into its drive and the file name on that drive.
    ///
    /// Accepts `/dev/diskN/FILE`, `/dev/sataN/FILE`, and `<mount>/FILE`
    /// where `<mount>` matches exactly.
    pub fn resolve<'p>(&self, path: &'p str) -> FsResult<(DriveIndex, &'p str)> {
        if path.starts_with("/dev/") {
            let (drive, rest) = DriveIndex::parse_device(path).ok_or(FsError::InvalidPath)?;
            let file = rest.strip_prefix('/').ok_or(FsError::InvalidPath)?;
            return Ok((drive, file));
        }

        self.iter()
            .find_map(|m| {
                path.strip_prefix(m.path())
                    .and_then(|rest| rest.strip_prefix('/'))
                    .map(|file| (m.drive, file))
            })
            .ok_or(FsError::NotFound)
    }

    /// List the root directory of a device (`/dev/sata0`) or mount point
    pub fn list_path<D: BlockDevice + ?Sized>(
        &self,
        dev: &mut D,
        path: &str,
        out: &mut [DirEntry],
    ) -> FsResult<usize> {
        let drive = if path.starts_with("/dev/") {
            match DriveIndex::parse_device(path) {
                Some((drive, "")) => drive,
                _ => return Err(FsError::InvalidPath),
            }
        } else {
            self.find(path).ok_or(FsError::NotFound)?.drive
        };

        if !dev.drive_exists(drive) {
            return Err(FsError::Disk(DiskError::DriveAbsent));
        }
        mount(dev, drive)?.list_root(dev, out)
    }

    /// Read a root-directory file named by `path` into `buf`. The file name
    /// is matched without regard to case. Returns the bytes read.
    pub fn read_path<D: BlockDevice + ?Sized>(
        &self,
        dev: &mut D,
        path: &str,
        buf: &mut [u8],
    ) -> FsResult<usize> {
        let (drive, file) = self.resolve(path)?;
        if file.is_empty() {
            return Err(FsError::InvalidPath);
        }
        if !dev.drive_exists(drive) {
            return Err(FsError::Disk(DiskError::DriveAbsent));
        }

        let volume = mount(dev, drive)?;
        let mut entries = [DirEntry::EMPTY; MAX_DIR_ENTRIES];
        let n = volume.list_root(dev, &mut entries)?;

        let entry = find_entry(&entries[..n], file).ok_or(FsError::NotFound)?;
        if entry.is_directory() {
            return Err(FsError::IsDirectory);
        }
        volume.read_file(dev, entry, buf)
    }
}
