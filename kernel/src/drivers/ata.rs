//! ATA/IDE Driver
//!
//! Legacy primary-channel drives (master and slave) in PIO mode. One sector
//! per command, 28-bit LBA, all waits polled with a fixed iteration budget.

use super::poll::spin_until;
use super::{DiskError, SECTOR_SIZE};
use crate::config::PollBudget;

/// Primary channel I/O ports
pub mod reg {
    pub const DATA: u16 = 0x1F0;
    pub const SECTOR_COUNT: u16 = 0x1F2;
    pub const LBA_LOW: u16 = 0x1F3;
    pub const LBA_MID: u16 = 0x1F4;
    pub const LBA_HIGH: u16 = 0x1F5;
    pub const DRIVE_HEAD: u16 = 0x1F6;
    /// Status on read, command on write
    pub const STATUS: u16 = 0x1F7;
    pub const COMMAND: u16 = 0x1F7;
}

/// ATA Commands
pub mod cmd {
    pub const READ_SECTORS: u8 = 0x20;
}

/// Status register bits
pub mod status {
    pub const DRQ: u8 = 1 << 3;
    pub const BSY: u8 = 1 << 7;
}

/// What an empty channel reads back
const FLOATING_BUS: u8 = 0xFF;

/// Byte/word port I/O as the driver needs it
pub trait PortIo {
    fn inb(&mut self, port: u16) -> u8;
    fn outb(&mut self, port: u16, value: u8);
    fn inw(&mut self, port: u16) -> u16;
}

/// Real `in`/`out` instructions
#[cfg(target_arch = "x86_64")]
pub struct PioPorts;

#[cfg(target_arch = "x86_64")]
impl PortIo for PioPorts {
    fn inb(&mut self, port: u16) -> u8 {
        unsafe { x86_64::instructions::port::Port::<u8>::new(port).read() }
    }

    fn outb(&mut self, port: u16, value: u8) {
        unsafe { x86_64::instructions::port::Port::<u8>::new(port).write(value) }
    }

    fn inw(&mut self, port: u16) -> u16 {
        unsafe { x86_64::instructions::port::Port::<u16>::new(port).read() }
    }
}

/// Drive position on the channel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrivePosition {
    Master,
    Slave,
}

impl DrivePosition {
    /// Drive/head register value: LBA mode, bits 7 and 5 set, DRV in bit 4
    fn select(self) -> u8 {
        match self {
            DrivePosition::Master => 0xE0,
            DrivePosition::Slave => 0xF0,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DrivePosition::Master => "master",
            DrivePosition::Slave => "slave",
        }
    }
}

/// Primary IDE channel
pub struct AtaPio<B> {
    bus: B,
    budget: PollBudget,
}

impl<B: PortIo> AtaPio<B> {
    pub fn new(bus: B, budget: PollBudget) -> Self {
        Self { bus, budget }
    }

    /// The underlying port I/O
    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Select `drive`, let the bus settle, and look at the status register.
    /// A floating bus (0xFF) or an all-zero status means nothing is there.
    pub fn drive_exists(&mut self, drive: DrivePosition) -> bool {
        self.bus.outb(reg::DRIVE_HEAD, drive.select());
        for _ in 0..self.budget.ata_select_settle {
            let _ = self.bus.inb(reg::STATUS);
        }

        let status = self.bus.inb(reg::STATUS);
        status != FLOATING_BUS && status != 0
    }

    /// Read one sector with READ SECTORS.
    ///
    /// On timeout the buffer is left untouched.
    pub fn read_sector(
        &mut self,
        drive: DrivePosition,
        lba: u32,
        buffer: &mut [u8; SECTOR_SIZE],
    ) -> Result<(), DiskError> {
        if !self.wait_not_busy() {
            crate::log_warn!("[ATA] {} busy, LBA {} not read", drive.name(), lba);
            return Err(DiskError::Timeout);
        }

        self.bus.outb(reg::DRIVE_HEAD, drive.select() | ((lba >> 24) & 0x0F) as u8);
        self.bus.outb(reg::SECTOR_COUNT, 1);
        self.bus.outb(reg::LBA_LOW, lba as u8);
        self.bus.outb(reg::LBA_MID, (lba >> 8) as u8);
        self.bus.outb(reg::LBA_HIGH, (lba >> 16) as u8);
        self.bus.outb(reg::COMMAND, cmd::READ_SECTORS);

        if !self.wait_data_ready() {
            crate::log_warn!("[ATA] {} no data for LBA {}", drive.name(), lba);
            return Err(DiskError::Timeout);
        }

        for pair in buffer.chunks_exact_mut(2) {
            let word = self.bus.inw(reg::DATA);
            pair.copy_from_slice(&word.to_le_bytes());
        }

        crate::storage_trace!("[ATA] {} read LBA {}", drive.name(), lba);

        Ok(())
    }

    fn wait_not_busy(&mut self) -> bool {
        let bus = &mut self.bus;
        spin_until(self.budget.ata_busy, || bus.inb(reg::STATUS) & status::BSY == 0)
    }

    /// BSY clear first, then BSY clear with DRQ set
    fn wait_data_ready(&mut self) -> bool {
        if !self.wait_not_busy() {
            return false;
        }
        let bus = &mut self.bus;
        spin_until(self.budget.ata_drq, || {
            bus.inb(reg::STATUS) & (status::BSY | status::DRQ) == status::DRQ
        })
    }
}
