//! Read-only FAT filesystems
//!
//! Two readers share one directory-entry model:
//! - [`fat16`]: fixed root-directory region, 16-bit allocation entries
//! - [`fat32`]: root directory is a cluster chain, 28-bit entries
//!
//! A mounted [`Volume`] is plain geometry. It borrows the block device only
//! for the duration of each call, so any number of volumes can coexist.

pub mod bpb;
pub mod fat16;
pub mod fat32;
pub mod mount;

pub use fat16::Fat16;
pub use fat32::Fat32;
pub use mount::{MountPoint, MountTable};

use core::fmt;

use crate::drivers::partition;
use crate::drivers::{BlockDevice, DiskError, DriveIndex, SECTOR_SIZE};

/// On-disk directory entry size
pub const DIR_ENTRY_SIZE: usize = 32;

/// Entries per 512-byte sector
pub const ENTRIES_PER_SECTOR: usize = SECTOR_SIZE / DIR_ENTRY_SIZE;

/// Largest listing the shell and explorer ever ask for
pub const MAX_DIR_ENTRIES: usize = 32;

/// First byte of the name field
const ENTRY_END: u8 = 0x00;
const ENTRY_DELETED: u8 = 0xE5;

/// Directory entry attributes
pub mod attr {
    pub const READ_ONLY: u8 = 0x01;
    pub const HIDDEN: u8 = 0x02;
    pub const SYSTEM: u8 = 0x04;
    pub const VOLUME_ID: u8 = 0x08;
    pub const DIRECTORY: u8 = 0x10;
    pub const ARCHIVE: u8 = 0x20;
    /// Exact value marking a long-name continuation slot
    pub const LONG_NAME: u8 = 0x0F;
}

/// Filesystem-level failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// A sector read failed underneath
    Disk(DiskError),
    /// The 16-bit sectors-per-FAT field is set; retry as FAT16
    NotFat32,
    /// Zero bytes-per-sector or sectors-per-cluster
    InvalidBootSector,
    NotFound,
    IsDirectory,
    InvalidPath,
    MountTableFull,
}

pub type FsResult<T> = Result<T, FsError>;

impl FsError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disk(e) => e.as_str(),
            Self::NotFat32 => "not FAT32",
            Self::InvalidBootSector => "invalid boot sector",
            Self::NotFound => "not found",
            Self::IsDirectory => "is a directory",
            Self::InvalidPath => "invalid path",
            Self::MountTableFull => "mount table full",
        }
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<DiskError> for FsError {
    fn from(e: DiskError) -> Self {
        FsError::Disk(e)
    }
}

/// Which reader a volume was mounted with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsKind {
    Fat16,
    Fat32,
}

impl FsKind {
    /// 16 or 32
    pub fn bits(self) -> u8 {
        match self {
            FsKind::Fat16 => 16,
            FsKind::Fat32 => 32,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FsKind::Fat16 => "FAT16",
            FsKind::Fat32 => "FAT32",
        }
    }
}

/// A 32-byte short-name directory record, copied out of the sector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirEntry {
    /// Space-padded 8.3 name
    pub name: [u8; 11],
    pub attr: u8,
    /// High cluster half (FAT32 only)
    pub cluster_hi: u16,
    pub cluster_lo: u16,
    /// Size in bytes
    pub size: u32,
}

impl DirEntry {
    pub const EMPTY: Self = Self { name: [b' '; 11], attr: 0, cluster_hi: 0, cluster_lo: 0, size: 0 };

    /// Decode one record; `raw` must hold at least 32 bytes
    pub fn parse(raw: &[u8]) -> Self {
        let mut name = [0u8; 11];
        name.copy_from_slice(&raw[..11]);
        Self {
            name,
            attr: raw[11],
            cluster_hi: bpb::le16(raw, 20),
            cluster_lo: bpb::le16(raw, 26),
            size: bpb::le32(raw, 28),
        }
    }

    pub fn is_directory(&self) -> bool {
        self.attr & attr::DIRECTORY != 0
    }

    pub fn is_long_name(&self) -> bool {
        self.attr == attr::LONG_NAME
    }

    /// Starting cluster as FAT16 stores it
    pub fn first_cluster16(&self) -> u32 {
        self.cluster_lo as u32
    }

    /// Starting cluster as FAT32 stores it
    pub fn first_cluster32(&self) -> u32 {
        ((self.cluster_hi as u32) << 16) | self.cluster_lo as u32
    }

    /// `NAME.EXT`, spaces dropped, no dot without an extension
    pub fn display_name(&self) -> ShortName {
        let mut out = ShortName { buf: [0; 12], len: 0 };
        for &c in self.name[..8].iter().filter(|&&c| c != b' ') {
            out.push(c);
        }
        if self.name[8..].iter().any(|&c| c != b' ') {
            out.push(b'.');
            for &c in self.name[8..].iter().filter(|&&c| c != b' ') {
                out.push(c);
            }
        }
        out
    }
}

/// Rendered 8.3 name, stored inline
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ShortName {
    buf: [u8; 12],
    len: u8,
}

impl ShortName {
    fn push(&mut self, c: u8) {
        // Non-ASCII OEM bytes would make the name invalid UTF-8
        let c = if c.is_ascii() && c != 0 { c } else { b'?' };
        self.buf[self.len as usize] = c;
        self.len += 1;
    }

    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.buf[..self.len as usize]).unwrap_or("?")
    }
}

impl fmt::Display for ShortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for ShortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

/// First entry whose display name matches `name`, ignoring ASCII case
pub fn find_entry<'e>(entries: &'e [DirEntry], name: &str) -> Option<&'e DirEntry> {
    entries.iter().find(|e| e.display_name().as_str().eq_ignore_ascii_case(name))
}

/// Read the boot sector into `sector`, stepping over an MBR when sector 0
/// is one. Returns the LBA the volume starts at.
pub(crate) fn load_boot_sector<D: BlockDevice + ?Sized>(
    dev: &mut D,
    drive: DriveIndex,
    sector: &mut [u8; SECTOR_SIZE],
) -> FsResult<u32> {
    dev.read_sector(drive, 0, sector)?;

    match partition::volume_start(sector) {
        Some(start) => {
            dev.read_sector(drive, start, sector)?;
            Ok(start)
        }
        None => Ok(0),
    }
}

/// Copy the live entries of one directory sector into `out[*count..]`.
///
/// Returns `true` when the listing is complete: either the end marker was
/// hit or `out` is full.
pub(crate) fn collect_entries(
    sector: &[u8; SECTOR_SIZE],
    out: &mut [DirEntry],
    count: &mut usize,
) -> bool {
    if *count >= out.len() {
        return true;
    }
    for raw in sector.chunks_exact(DIR_ENTRY_SIZE) {
        if raw[0] == ENTRY_END {
            return true;
        }
        if raw[0] == ENTRY_DELETED {
            continue;
        }
        let entry = DirEntry::parse(raw);
        if entry.is_long_name() {
            continue;
        }

        out[*count] = entry;
        *count += 1;
        if *count >= out.len() {
            return true;
        }
    }
    false
}

/// Where cluster data lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ClusterGeometry {
    pub data_start: u32,
    pub sectors_per_cluster: u8,
}

impl ClusterGeometry {
    /// First sector of data cluster `cluster` (2 or above)
    pub fn cluster_lba(&self, cluster: u32) -> u32 {
        self.data_start
            .wrapping_add(cluster.wrapping_sub(2).wrapping_mul(self.sectors_per_cluster as u32))
    }
}

/// Follow a cluster chain from `start`, copying up to `buf.len()` bytes.
///
/// `is_data` says whether a link is a real cluster; `next` reads the
/// allocation table. Returns the number of bytes copied. A chain that ends
/// early is not an error: the copy stops and the shortfall is logged.
#[allow(clippy::too_many_arguments)]
pub(crate) fn read_chain<D, N>(
    dev: &mut D,
    drive: DriveIndex,
    geometry: ClusterGeometry,
    start: u32,
    buf: &mut [u8],
    tag: &str,
    is_data: fn(u32) -> bool,
    mut next: N,
) -> FsResult<usize>
where
    D: BlockDevice + ?Sized,
    N: FnMut(&mut D, u32) -> FsResult<u32>,
{
    let want = buf.len();
    if want == 0 {
        return Ok(0);
    }

    let mut sector = [0u8; SECTOR_SIZE];
    let mut copied = 0usize;
    let mut cluster = start;

    while is_data(cluster) {
        let lba = geometry.cluster_lba(cluster);
        for s in 0..geometry.sectors_per_cluster as u32 {
            dev.read_sector(drive, lba.wrapping_add(s), &mut sector)?;

            let n = (want - copied).min(SECTOR_SIZE);
            buf[copied..copied + n].copy_from_slice(&sector[..n]);
            copied += n;
            if copied == want {
                return Ok(copied);
            }
        }

        crate::storage_trace!("[{}] cluster {} done, {} bytes", tag, cluster, copied);

        cluster = next(dev, cluster)?;
    }

    crate::log_warn!("[{}] chain ended at {:#x} after {} of {} bytes", tag, cluster, copied, want);
    Ok(copied)
}

/// A volume mounted with whichever reader recognised it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Volume {
    Fat16(Fat16),
    Fat32(Fat32),
}

impl Volume {
    pub fn kind(&self) -> FsKind {
        match self {
            Volume::Fat16(_) => FsKind::Fat16,
            Volume::Fat32(_) => FsKind::Fat32,
        }
    }

    pub fn drive(&self) -> DriveIndex {
        match self {
            Volume::Fat16(fs) => fs.drive(),
            Volume::Fat32(fs) => fs.drive(),
        }
    }

    pub fn list_root<D: BlockDevice + ?Sized>(&self, dev: &mut D, out: &mut [DirEntry]) -> FsResult<usize> {
        match self {
            Volume::Fat16(fs) => fs.list_root(dev, out),
            Volume::Fat32(fs) => fs.list_root(dev, out),
        }
    }

    pub fn read_file<D: BlockDevice + ?Sized>(
        &self,
        dev: &mut D,
        entry: &DirEntry,
        buf: &mut [u8],
    ) -> FsResult<usize> {
        match self {
            Volume::Fat16(fs) => fs.read_file(dev, entry, buf),
            Volume::Fat32(fs) => fs.read_file(dev, entry, buf),
        }
    }
}

/// Probe `drive` as FAT32, falling back to FAT16 when the boot sector
/// says otherwise. Disk errors are not retried.
pub fn mount<D: BlockDevice + ?Sized>(dev: &mut D, drive: DriveIndex) -> FsResult<Volume> {
    match Fat32::init(dev, drive) {
        Ok(fs) => Ok(Volume::Fat32(fs)),
        Err(FsError::NotFat32) | Err(FsError::InvalidBootSector) => {
            Fat16::init(dev, drive).map(Volume::Fat16)
        }
        Err(e) => Err(e),
    }
}
