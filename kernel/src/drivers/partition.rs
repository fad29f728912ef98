//! MBR partition entry parsing
//!
//! Sector 0 is either a FAT boot sector (starts with a jump opcode) or a
//! Master Boot Record. Only the first primary entry is ever consulted.

use super::SECTOR_SIZE;

/// Byte offset of the partition table inside sector 0
pub const PARTITION_TABLE_OFFSET: usize = 446;

/// Size of one partition table entry
pub const PARTITION_ENTRY_SIZE: usize = 16;

/// Boot sector jump opcodes (`JMP short` / `JMP near`)
pub const JMP_SHORT: u8 = 0xEB;
pub const JMP_NEAR: u8 = 0xE9;

/// Partition type (common types)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionType {
    /// Empty/unused
    Empty,
    /// FAT12
    Fat12,
    /// FAT16 (< 32MB)
    Fat16Small,
    /// FAT16 (>= 32MB)
    Fat16,
    /// Extended partition
    Extended,
    /// FAT32
    Fat32,
    /// FAT32 with LBA
    Fat32Lba,
    /// GPT Protective MBR
    GptProtective,
    /// Unknown type
    Unknown(u8),
}

impl PartitionType {
    /// Parse from MBR type byte
    pub fn from_mbr(type_byte: u8) -> Self {
        match type_byte {
            0x00 => Self::Empty,
            0x01 => Self::Fat12,
            0x04 => Self::Fat16Small,
            0x05 | 0x0F => Self::Extended,
            0x06 | 0x0E => Self::Fat16,
            0x0B => Self::Fat32,
            0x0C => Self::Fat32Lba,
            0xEE => Self::GptProtective,
            other => Self::Unknown(other),
        }
    }

    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Empty => "Empty",
            Self::Fat12 => "FAT12",
            Self::Fat16Small => "FAT16 (<32M)",
            Self::Fat16 => "FAT16",
            Self::Extended => "Extended",
            Self::Fat32 => "FAT32",
            Self::Fat32Lba => "FAT32 LBA",
            Self::GptProtective => "GPT Protective",
            Self::Unknown(_) => "Unknown",
        }
    }
}

/// One 16-byte MBR partition entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbrEntry {
    /// Boot indicator (0x80 = bootable)
    pub bootable: bool,
    pub partition_type: PartitionType,
    /// Starting LBA
    pub start_lba: u32,
    /// Size in sectors
    pub size_sectors: u32,
}

impl MbrEntry {
    /// Decode entry `index` (0-3) of the table in `sector`
    pub fn parse(sector: &[u8; SECTOR_SIZE], index: usize) -> Option<Self> {
        if index >= 4 {
            return None;
        }
        let e = &sector[PARTITION_TABLE_OFFSET + index * PARTITION_ENTRY_SIZE..][..PARTITION_ENTRY_SIZE];

        Some(Self {
            bootable: e[0] == 0x80,
            partition_type: PartitionType::from_mbr(e[4]),
            start_lba: u32::from_le_bytes([e[8], e[9], e[10], e[11]]),
            size_sectors: u32::from_le_bytes([e[12], e[13], e[14], e[15]]),
        })
    }
}

/// Whether sector 0 starts like a FAT boot sector
pub fn is_boot_sector(sector: &[u8; SECTOR_SIZE]) -> bool {
    sector[0] == JMP_SHORT || sector[0] == JMP_NEAR
}

/// Where the real boot sector lives, if sector 0 is an MBR.
///
/// `None` means sector 0 is itself the boot sector, or the first entry has a
/// zero start LBA (in which case the volume is still read from LBA 0).
pub fn volume_start(sector0: &[u8; SECTOR_SIZE]) -> Option<u32> {
    if is_boot_sector(sector0) {
        return None;
    }

    let entry = MbrEntry::parse(sector0, 0)?;
    if entry.start_lba == 0 {
        return None;
    }

    crate::log_debug!("[DISK] MBR entry 1: {} at LBA {} ({} sectors)",
        entry.partition_type.name(), entry.start_lba, entry.size_sectors);

    Some(entry.start_lba)
}
