//! Drive index dispatch
//!
//! One flat index space over both controller families. Every request is a
//! single synchronous sector read; nothing is cached or queued.

use core::fmt;

use super::ahci::{AhciController, HbaRegisters, PortHandle, MAX_PORTS};
use super::ata::{AtaPio, DrivePosition, PortIo};
use super::{DiskError, SECTOR_SIZE};

/// Indices owned by the legacy channel
pub const ATA_DRIVES: u8 = 2;

/// Size of the index space: 2 ATA + 32 SATA
pub const MAX_DRIVES: usize = ATA_DRIVES as usize + MAX_PORTS;

const ATA_PREFIX: &str = "/dev/disk";
const SATA_PREFIX: &str = "/dev/sata";

/// A drive number in 0-33
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DriveIndex(u8);

/// Which driver owns a [`DriveIndex`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveTarget {
    Ata(DrivePosition),
    Sata(PortHandle),
}

impl DriveIndex {
    pub const fn new(raw: u8) -> Option<Self> {
        if (raw as usize) < MAX_DRIVES {
            Some(Self(raw))
        } else {
            None
        }
    }

    pub const fn ata(position: DrivePosition) -> Self {
        match position {
            DrivePosition::Master => Self(0),
            DrivePosition::Slave => Self(1),
        }
    }

    /// Index of AHCI port `port`
    pub const fn sata(port: u8) -> Option<Self> {
        if (port as usize) < MAX_PORTS {
            Some(Self(port + ATA_DRIVES))
        } else {
            None
        }
    }

    pub const fn raw(self) -> u8 {
        self.0
    }

    pub fn target(self) -> DriveTarget {
        match self.0 {
            0 => DriveTarget::Ata(DrivePosition::Master),
            1 => DriveTarget::Ata(DrivePosition::Slave),
            n => match PortHandle::new(n - ATA_DRIVES) {
                Some(port) => DriveTarget::Sata(port),
                // DriveIndex::new caps the range
                None => DriveTarget::Ata(DrivePosition::Master),
            },
        }
    }

    /// Every index, in order
    pub fn all() -> impl Iterator<Item = DriveIndex> {
        (0..MAX_DRIVES as u8).map(DriveIndex)
    }

    /// Parse `/dev/diskN` (N = 0-1) or `/dev/sataN` (N = 0-31, one or two
    /// digits). Returns the index and whatever follows the device name,
    /// which is either empty or starts with `/`.
    pub fn parse_device(path: &str) -> Option<(DriveIndex, &str)> {
        if let Some(rest) = path.strip_prefix(ATA_PREFIX) {
            let (n, rest) = split_number(rest, 1)?;
            return match n {
                0 => Some((Self::ata(DrivePosition::Master), rest)),
                1 => Some((Self::ata(DrivePosition::Slave), rest)),
                _ => None,
            };
        }

        let rest = path.strip_prefix(SATA_PREFIX)?;
        let (n, rest) = split_number(rest, 2)?;
        let port = u8::try_from(n).ok()?;
        Some((Self::sata(port)?, rest))
    }
}

/// Leading decimal of at most `max_digits`, followed by nothing or `/`
fn split_number(s: &str, max_digits: usize) -> Option<(u32, &str)> {
    let digits = s.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 || digits > max_digits {
        return None;
    }
    let (num, rest) = s.split_at(digits);
    if !rest.is_empty() && !rest.starts_with('/') {
        return None;
    }
    Some((num.parse().ok()?, rest))
}

impl fmt::Display for DriveIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target() {
            DriveTarget::Ata(pos) => write!(f, "{}{}", ATA_PREFIX, Self::ata(pos).0),
            DriveTarget::Sata(port) => write!(f, "{}{}", SATA_PREFIX, port.number()),
        }
    }
}

/// Uniform sector access over whatever sits behind a drive index
pub trait BlockDevice {
    /// Presence probe. Indices with no driver behind them are absent.
    fn drive_exists(&mut self, drive: DriveIndex) -> bool;

    /// Read one 512-byte sector
    fn read_sector(
        &mut self,
        drive: DriveIndex,
        lba: u32,
        buffer: &mut [u8; SECTOR_SIZE],
    ) -> Result<(), DiskError>;
}

/// Presence of every drive index at the time of a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriveTable {
    present: [bool; MAX_DRIVES],
}

impl DriveTable {
    pub const fn empty() -> Self {
        Self { present: [false; MAX_DRIVES] }
    }

    pub fn is_present(&self, drive: DriveIndex) -> bool {
        self.present[drive.0 as usize]
    }

    pub fn count(&self) -> usize {
        self.present.iter().filter(|&&p| p).count()
    }

    /// Present drives, lowest index first
    pub fn iter(&self) -> impl Iterator<Item = DriveIndex> + '_ {
        DriveIndex::all().filter(move |d| self.is_present(*d))
    }
}

impl Default for DriveTable {
    fn default() -> Self {
        Self::empty()
    }
}

/// Both controllers behind the index space
pub struct Storage<'a, B, H> {
    ata: AtaPio<B>,
    ahci: AhciController<'a, H>,
}

impl<'a, B: PortIo, H: HbaRegisters> Storage<'a, B, H> {
    pub fn new(ata: AtaPio<B>, ahci: AhciController<'a, H>) -> Self {
        Self { ata, ahci }
    }

    pub fn ata(&self) -> &AtaPio<B> {
        &self.ata
    }

    pub fn ahci(&self) -> &AhciController<'a, H> {
        &self.ahci
    }

    pub fn ahci_mut(&mut self) -> &mut AhciController<'a, H> {
        &mut self.ahci
    }

    /// Probe every index once
    pub fn scan(&mut self) -> DriveTable {
        let mut table = DriveTable::empty();
        for drive in DriveIndex::all() {
            if self.drive_exists(drive) {
                crate::log!("[DISK] {} present", drive);
                table.present[drive.0 as usize] = true;
            }
        }
        table
    }
}

impl<'a, B: PortIo, H: HbaRegisters> BlockDevice for Storage<'a, B, H> {
    fn drive_exists(&mut self, drive: DriveIndex) -> bool {
        match drive.target() {
            DriveTarget::Ata(pos) => cfg!(feature = "legacy-ata") && self.ata.drive_exists(pos),
            DriveTarget::Sata(port) => cfg!(feature = "ahci") && self.ahci.drive_exists(port),
        }
    }

    fn read_sector(
        &mut self,
        drive: DriveIndex,
        lba: u32,
        buffer: &mut [u8; SECTOR_SIZE],
    ) -> Result<(), DiskError> {
        match drive.target() {
            DriveTarget::Ata(pos) => {
                if !cfg!(feature = "legacy-ata") {
                    return Err(DiskError::DriveAbsent);
                }
                self.ata.read_sector(pos, lba, buffer)
            }
            DriveTarget::Sata(port) => {
                if !cfg!(feature = "ahci") {
                    return Err(DiskError::DriveAbsent);
                }
                let mut dma = self.ahci.dma_buffer(buffer);
                self.ahci.read(port, lba, 1, &mut dma)
            }
        }
    }
}
