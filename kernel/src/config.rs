//! Storage stack configuration
//!
//! Every hardware wait in the drivers is a bounded spin, not a timer. The
//! iteration counts live here so a board (or a test double) can pick them.

/// Iteration budgets for the bounded polls in the AHCI and ATA drivers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollBudget {
    /// Port bring-up: wait for CR and FR to drop after clearing ST/FRE.
    /// Exhausting it is not an error, bring-up proceeds.
    pub ahci_engine_stop: u32,
    /// Port bring-up: wait for CR to drop before setting FRE/ST again.
    /// Exhausting it is not an error either.
    pub ahci_engine_start: u32,
    /// Wait for BSY and DRQ to clear in PxTFD before issuing a command
    pub ahci_port_idle: u32,
    /// Wait for PxCI bit 0 to clear after issuing
    pub ahci_command: u32,
    /// Wait for BSY to clear on the legacy status register
    pub ata_busy: u32,
    /// Wait for BSY clear and DRQ set once READ SECTORS is issued
    pub ata_drq: u32,
    /// Status reads used as a settle delay after drive select
    pub ata_select_settle: u32,
}

impl PollBudget {
    /// Budgets that work on QEMU, VirtualBox and the ICH9/ICH10 boards tested
    pub const DEFAULT: Self = Self {
        ahci_engine_stop: 1_000_000,
        ahci_engine_start: 1_000_000,
        ahci_port_idle: 1_000_000,
        ahci_command: 1_000_000,
        ata_busy: 100_000,
        ata_drq: 100_000,
        ata_select_settle: 1_000,
    };

    /// Same budget for every wait
    pub const fn uniform(iterations: u32) -> Self {
        Self {
            ahci_engine_stop: iterations,
            ahci_engine_start: iterations,
            ahci_port_idle: iterations,
            ahci_command: iterations,
            ata_busy: iterations,
            ata_drq: iterations,
            ata_select_settle: iterations,
        }
    }
}

impl Default for PollBudget {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// How a kernel virtual address turns into the physical address a bus
/// master sees
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhysMap {
    /// Single address space, virtual == physical
    Identity,
    /// Higher-half direct map at the given offset
    Offset(u64),
}

impl PhysMap {
    /// Convert virtual address to physical (for DMA)
    pub fn virt_to_phys(&self, virt: usize) -> u64 {
        match *self {
            PhysMap::Identity => virt as u64,
            PhysMap::Offset(hhdm) => (virt as u64).wrapping_sub(hhdm),
        }
    }

    /// Convert physical address to a kernel virtual address (for MMIO)
    pub fn phys_to_virt(&self, phys: u64) -> usize {
        match *self {
            PhysMap::Identity => phys as usize,
            PhysMap::Offset(hhdm) => phys.wrapping_add(hhdm) as usize,
        }
    }
}

impl Default for PhysMap {
    fn default() -> Self {
        PhysMap::Identity
    }
}

/// Configuration handed to [`crate::bring_up`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageConfig {
    pub poll: PollBudget,
    pub phys: PhysMap,
}
