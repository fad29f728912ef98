//! FAT16 reader
//!
//! Layout: boot sector, reserved sectors, FAT copies, then a fixed-size root
//! directory region, then the data clusters.

use super::bpb::BiosParameterBlock;
use super::{collect_entries, load_boot_sector, read_chain, ClusterGeometry, DirEntry, FsError, FsResult};
use crate::drivers::{BlockDevice, DriveIndex, SECTOR_SIZE};

/// First reserved value at the top of the cluster range
pub const FAT16_EOC_MIN: u32 = 0xFFF8;

fn is_data_cluster(cluster: u32) -> bool {
    (2..FAT16_EOC_MIN).contains(&cluster)
}

/// A parsed FAT16 volume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fat16 {
    drive: DriveIndex,
    volume_start: u32,
    bpb: BiosParameterBlock,
    root_dir_start: u32,
    root_dir_sectors: u32,
    geometry: ClusterGeometry,
}

impl Fat16 {
    /// Read the boot sector (behind an MBR if there is one) and derive the
    /// region layout
    pub fn init<D: BlockDevice + ?Sized>(dev: &mut D, drive: DriveIndex) -> FsResult<Self> {
        let mut sector = [0u8; SECTOR_SIZE];
        let volume_start = load_boot_sector(dev, drive, &mut sector)?;

        let bpb = BiosParameterBlock::parse(&sector);
        if !bpb.is_usable() {
            crate::log_warn!("[FAT16] {}: unusable boot sector", drive);
            return Err(FsError::InvalidBootSector);
        }

        let root_dir_start = volume_start
            .wrapping_add(bpb.reserved_sectors as u32)
            .wrapping_add((bpb.num_fats as u32).wrapping_mul(bpb.fat_size_16 as u32));
        // Truncating division: a partial trailing sector is not counted
        let root_dir_sectors = (bpb.root_entry_count as u32 * 32) / bpb.bytes_per_sector as u32;
        let data_start = root_dir_start.wrapping_add(root_dir_sectors);

        crate::log!("[FAT16] {}: volume at LBA {}, root {}+{}, data {}",
            drive, volume_start, root_dir_start, root_dir_sectors, data_start);

        Ok(Self {
            drive,
            volume_start,
            bpb,
            root_dir_start,
            root_dir_sectors,
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

    pub fn root_dir_start(&self) -> u32 {
        self.root_dir_start
    }

    pub fn root_dir_sectors(&self) -> u32 {
        self.root_dir_sectors
    }

    pub fn data_start(&self) -> u32 {
        self.geometry.data_start
    }

    /// First sector of data cluster `cluster`
    pub fn cluster_lba(&self, cluster: u32) -> u32 {
        self.geometry.cluster_lba(cluster)
    }

    /// List the root directory region in on-disk order, up to `out.len()`
    /// entries. Deleted and long-name slots are skipped; a zero name byte
    /// ends the listing.
    pub fn list_root<D: BlockDevice + ?Sized>(&self, dev: &mut D, out: &mut [DirEntry]) -> FsResult<usize> {
        let mut count = 0;
        if out.is_empty() {
            return Ok(0);
        }

        let mut sector = [0u8; SECTOR_SIZE];
        for s in 0..self.root_dir_sectors {
            dev.read_sector(self.drive, self.root_dir_start.wrapping_add(s), &mut sector)?;
            if collect_entries(&sector, out, &mut count) {
                break;
            }
        }
        Ok(count)
    }

    /// Raw 16-bit allocation entry for `cluster`
    pub fn fat_entry<D: BlockDevice + ?Sized>(&self, dev: &mut D, cluster: u32) -> FsResult<u16> {
        let offset = cluster.wrapping_mul(2);
        let lba = self.volume_start
            .wrapping_add(self.bpb.reserved_sectors as u32)
            .wrapping_add(offset / SECTOR_SIZE as u32);
        let at = (offset % SECTOR_SIZE as u32) as usize;

        let mut sector = [0u8; SECTOR_SIZE];
        dev.read_sector(self.drive, lba, &mut sector)?;
        Ok(u16::from_le_bytes([sector[at], sector[at + 1]]))
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
            entry.first_cluster16(),
            &mut buf[..want],
            "FAT16",
            is_data_cluster,
            |dev, cluster| Ok(self.fat_entry(dev, cluster)? as u32),
        )
    }
}
