//! Block device drivers
//!
//! Two controller families sit behind one flat drive index:
//! - 0-1: legacy ATA master/slave on the primary IDE channel ([`ata`])
//! - 2-33: AHCI SATA ports 0-31 ([`ahci`])
//!
//! [`block::Storage`] routes between them. Every call is synchronous and
//! polled; nothing here takes interrupts.

pub mod ahci;
pub mod ata;
pub mod block;
pub mod partition;
pub mod poll;

pub use block::{BlockDevice, DriveIndex, DriveTable, DriveTarget, Storage};

/// Sector size in bytes, for both controller families
pub const SECTOR_SIZE: usize = 512;

/// Driver-level failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskError {
    /// No AHCI controller was found on the PCI bus
    ControllerAbsent,
    /// Presence probe was negative, or the index maps to nothing
    DriveAbsent,
    /// A bounded poll never saw the expected hardware condition
    Timeout,
    /// The device set the task-file error bit in PxIS
    TaskFileError,
    /// Destination smaller than the requested transfer
    BufferTooSmall,
    /// Sector count of zero, or more than one PRDT entry can describe
    InvalidSectorCount,
}

impl DiskError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ControllerAbsent => "controller absent",
            Self::DriveAbsent => "drive absent",
            Self::Timeout => "timeout",
            Self::TaskFileError => "task file error",
            Self::BufferTooSmall => "buffer too small",
            Self::InvalidSectorCount => "invalid sector count",
        }
    }
}

impl core::fmt::Display for DiskError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
