//! BIOS Parameter Block
//!
//! Common fields of the FAT16 and FAT32 boot sector, read little-endian
//! straight out of the sector bytes.

use crate::drivers::SECTOR_SIZE;

/// Boot-sector byte offsets
mod off {
    pub const BYTES_PER_SECTOR: usize = 11;
    pub const SECTORS_PER_CLUSTER: usize = 13;
    pub const RESERVED_SECTORS: usize = 14;
    pub const NUM_FATS: usize = 16;
    pub const ROOT_ENTRY_COUNT: usize = 17;
    pub const FAT_SIZE_16: usize = 22;
    // FAT32 extended BPB
    pub const FAT_SIZE_32: usize = 36;
    pub const ROOT_CLUSTER: usize = 44;
}

/// Geometry fields both readers need
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BiosParameterBlock {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub num_fats: u8,
    /// 0 on FAT32
    pub root_entry_count: u16,
    /// 0 on FAT32
    pub fat_size_16: u16,
    /// Only meaningful on FAT32
    pub fat_size_32: u32,
    /// Only meaningful on FAT32
    pub root_cluster: u32,
}

impl BiosParameterBlock {
    pub fn parse(sector: &[u8; SECTOR_SIZE]) -> Self {
        Self {
            bytes_per_sector: le16(sector, off::BYTES_PER_SECTOR),
            sectors_per_cluster: sector[off::SECTORS_PER_CLUSTER],
            reserved_sectors: le16(sector, off::RESERVED_SECTORS),
            num_fats: sector[off::NUM_FATS],
            root_entry_count: le16(sector, off::ROOT_ENTRY_COUNT),
            fat_size_16: le16(sector, off::FAT_SIZE_16),
            fat_size_32: le32(sector, off::FAT_SIZE_32),
            root_cluster: le32(sector, off::ROOT_CLUSTER),
        }
    }

    /// Fields that would make cluster arithmetic meaningless
    pub fn is_usable(&self) -> bool {
        self.bytes_per_sector != 0 && self.sectors_per_cluster != 0
    }
}

#[inline]
pub fn le16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

#[inline]
pub fn le32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}
