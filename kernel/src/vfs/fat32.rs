//! FAT32 reader
//!
//! Structure:
//! - Boot sector (sector 0) with BPB
//! - Reserved sectors
//! - FAT tables (1 or 2 copies)
//! - Data region (clusters), root directory included

use super::bpb::BiosParameterBlock;
use super::{collect_entries, load_boot_sector, read_chain, ClusterGeometry, DirEntry, FsError, FsResult};
use crate::drivers::{BlockDevice, DriveIndex, SECTOR_SIZE};

/// Allocation entries use the low 28 bits
pub const FAT32_MASK: u32 = 0x0FFF_FFFF;

/// Reserved "bad cluster" marker
pub const FAT32_BAD_CLUSTER: u32 = 0x0FFF_FFF7;

/// First end-of-chain value
pub const FAT32_EOC_MIN: u32 = 0x0FFF_FFF8;

/// Valid link to a data cluster. The bad-cluster marker and everything
/// above it end the chain.
fn is_data_cluster(cluster: u32) -> bool {
    (2..FAT32_BAD_CLUSTER).contains(&cluster)
}

/// A parsed FAT32 volume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fat32 {
    drive: DriveIndex,
    volume_start: u32,
    bpb: BiosParameterBlock,
    fat_start: u32,
    geometry: ClusterGeometry,
}

impl Fat32 {
    /// Read the boot sector (behind an MBR if there is one). A nonzero
    /// 16-bit sectors-per-FAT field means this is not FAT32.
    pub fn init<D: BlockDevice + ?Sized>(dev: &mut D, drive: DriveIndex) -> FsResult<Self> {
        let mut sector = [0u8; SECTOR_SIZE];
        let volume_start = load_boot_sector(dev, drive, &mut sector)?;

        let bpb = BiosParameterBlock::parse(&sector);
        if bpb.fat_size_16 != 0 {
            crate::log_debug!("[FAT32] {}: 16-bit FAT size set, not FAT32", drive);
            return Err(FsError::NotFat32);
        }
        if !bpb.is_usable() {
            crate::log_warn!("[FAT32] {}: unusable boot sector", drive);
            return Err(FsError::InvalidBootSector);
        }

        let fat_start = volume_start.wrapping_add(bpb.reserved_sectors as u32);
        let data_start = fat_start.wrapping_add((bpb.num_fats as u32).wrapping_mul(bpb.fat_size_32));

        crate::log!("[FAT32] {}: volume at LBA {}, FAT {}, data {}, root cluster {}",
            drive, volume_start, fat_start, data_start, bpb.root_cluster);

        Ok(Self {
            drive,
            volume_start,
            bpb,
            fat_start,
            geometry: ClusterGeometry { data_start, sectors_per_cluster: bpb.sectors_per_cluster },
        })
    }

    pub fn drive(&self) -> DriveIndex {
        self.drive
    }

    pub fn volume_start(&self) -> u32 {
        self.volume_start
    }

    pub fn bpb(&self) -> &BiosParameterBlock {
        &self.bpb
    }

    pub fn fat_start(&self) -> u32 {
        self.fat_start
    }

    pub fn data_start(&self) -> u32 {
        self.geometry.data_start
    }

    pub fn root_cluster(&self) -> u32 {
        self.bpb.root_cluster
    }

    /// First sector of data cluster `cluster`
    pub fn cluster_lba(&self, cluster: u32) -> u32 {
        self.geometry.cluster_lba(cluster)
    }

    /// Allocation entry for `cluster`, top 4 bits masked off
    pub fn fat_entry<D: BlockDevice + ?Sized>(&self, dev: &mut D, cluster: u32) -> FsResult<u32> {
        let offset = cluster.wrapping_mul(4);
        let lba = self.fat_start.wrapping_add(offset / SECTOR_SIZE as u32);
        let at = (offset % SECTOR_SIZE as u32) as usize;

        let mut sector = [0u8; SECTOR_SIZE];
        dev.read_sector(self.drive, lba, &mut sector)?;
        let raw = u32::from_le_bytes([sector[at], sector[at + 1], sector[at + 2], sector[at + 3]]);

        let next = raw & FAT32_MASK;
        if next == FAT32_BAD_CLUSTER {
            crate::log_warn!("[FAT32] {}: cluster {} links to a bad cluster", self.drive, cluster);
        }
        Ok(next)
    }

    /// Walk the root directory chain, listing up to `out.len()` entries
    /// with the same skip and stop rules as a fixed root region.
    pub fn list_root<D: BlockDevice + ?Sized>(&self, dev: &mut D, out: &mut [DirEntry]) -> FsResult<usize> {
        let mut count = 0;
        if out.is_empty() {
            return Ok(0);
        }

        let mut sector = [0u8; SECTOR_SIZE];
        let mut cluster = self.bpb.root_cluster;

        while is_data_cluster(cluster) {
            let lba = self.cluster_lba(cluster);
            for s in 0..self.bpb.sectors_per_cluster as u32 {
                dev.read_sector(self.drive, lba.wrapping_add(s), &mut sector)?;
                if collect_entries(&sector, out, &mut count) {
                    return Ok(count);
                }
            }
            cluster = self.fat_entry(dev, cluster)?;
        }
        Ok(count)
    }

    /// Copy the file's bytes into `buf`, stopping at its size, the end of
    /// `buf`, or the end of its chain. Returns the bytes copied.
    pub fn read_file<D: BlockDevice + ?Sized>(
        &self,
        dev: &mut D,
        entry: &DirEntry,
        buf: &mut [u8],
    ) -> FsResult<usize> {
        let want = (entry.size as usize).min(buf.len());
        read_chain(
            dev,
            self.drive,
            self.geometry,
            entry.first_cluster32(),
            &mut buf[..want],
            "FAT32",
            is_data_cluster,
            |dev, cluster| self.fat_entry(dev, cluster),
        )
    }
}
