//! AHCI (Advanced Host Controller Interface) Driver
//!
//! SATA sector reads through the HBA command-list protocol. One command is
//! ever in flight per port (slot 0), completion is polled, never interrupted.
//!
//! Each port gets one 4 KiB [`PortControlBlock`] out of a [`ControlArena`]
//! reserved for the life of the kernel. Data lands in a caller-owned
//! [`DmaBuffer`], which carries the physical address the HBA writes to.

use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use core::sync::atomic::{fence, Ordering};

use spin::{Mutex, MutexGuard};

use super::poll::spin_until;
use super::{DiskError, SECTOR_SIZE};
use crate::config::{PhysMap, PollBudget, StorageConfig};
use crate::pci::{self, PciConfigAccess};

// ============================================================================
// HBA Register Layout
// ============================================================================

/// Generic host control registers (offsets into ABAR)
pub mod hba {
    /// Global Host Control
    pub const GHC: usize = 0x04;
    /// Ports Implemented
    pub const PI: usize = 0x0C;
    /// GHC.AE, AHCI enable
    pub const GHC_AE: u32 = 1 << 31;
    /// First port register set
    pub const PORT_BASE: usize = 0x100;
    /// Size of one port register set
    pub const PORT_STRIDE: usize = 0x80;
}

/// Port register offsets, relative to the port's register set
pub mod px {
    /// Command List Base Address (low/high)
    pub const CLB: usize = 0x00;
    pub const CLBU: usize = 0x04;
    /// FIS Base Address (low/high)
    pub const FB: usize = 0x08;
    pub const FBU: usize = 0x0C;
    /// Interrupt Status
    pub const IS: usize = 0x10;
    /// Command and Status
    pub const CMD: usize = 0x18;
    /// Task File Data
    pub const TFD: usize = 0x20;
    /// Signature
    pub const SIG: usize = 0x24;
    /// SATA Status
    pub const SSTS: usize = 0x28;
    /// SATA Error
    pub const SERR: usize = 0x30;
    /// Command Issue
    pub const CI: usize = 0x38;
}

/// Port command bits
pub mod px_cmd {
    pub const ST: u32 = 1 << 0;   // Start
    pub const FRE: u32 = 1 << 4;  // FIS Receive Enable
    pub const FR: u32 = 1 << 14;  // FIS Receive Running
    pub const CR: u32 = 1 << 15;  // Command List Running
}

/// PxIS.TFES, task file error status
pub const PX_IS_TFES: u32 = 1 << 30;

/// ATA status bits as mirrored in PxTFD
const ATA_DEV_BUSY: u32 = 0x80;
const ATA_DEV_DRQ: u32 = 0x08;

/// Signature of a plain SATA disk
pub const SATA_SIG_ATA: u32 = 0x0000_0101;

/// PxSSTS.DET: device present, PHY communication established
const SSTS_DET_PRESENT: u32 = 3;
/// PxSSTS.IPM: interface active
const SSTS_IPM_ACTIVE: u32 = 1;

/// Ports an HBA can implement
pub const MAX_PORTS: usize = 32;

/// READ DMA EXT
const ATA_CMD_READ_DMA_EXT: u8 = 0x25;

/// One PRDT entry describes at most 4 MiB
pub const MAX_SECTORS_PER_COMMAND: u16 = 8192;

/// Byte offset of a port register
#[inline]
pub const fn port_reg(port: u8, reg: usize) -> usize {
    hba::PORT_BASE + port as usize * hba::PORT_STRIDE + reg
}

/// 32-bit access to the HBA register block
pub trait HbaRegisters {
    fn read32(&mut self, offset: usize) -> u32;
    fn write32(&mut self, offset: usize, value: u32);
}

/// Register block reached through a kernel virtual mapping of ABAR
pub struct MmioHba {
    base: usize,
}

impl MmioHba {
    /// # Safety
    /// `base` must be a mapping of the controller's ABAR that stays valid,
    /// uncached and exclusively owned by this value.
    pub unsafe fn new(base: usize) -> Self {
        Self { base }
    }
}

impl HbaRegisters for MmioHba {
    fn read32(&mut self, offset: usize) -> u32 {
        unsafe { ptr::read_volatile((self.base + offset) as *const u32) }
    }

    fn write32(&mut self, offset: usize, value: u32) {
        unsafe { ptr::write_volatile((self.base + offset) as *mut u32, value) }
    }
}

// ============================================================================
// FIS (Frame Information Structure)
// ============================================================================

/// FIS type: Register Host to Device
pub const FIS_TYPE_REG_H2D: u8 = 0x27;

/// FIS Register Host to Device
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FisRegH2D {
    pub fis_type: u8,   // FIS_TYPE_REG_H2D
    pub pmport_c: u8,   // PM Port | C bit (command/control)
    pub command: u8,    // ATA command
    pub featurel: u8,   // Feature low byte

    pub lba0: u8,       // LBA 7:0
    pub lba1: u8,       // LBA 15:8
    pub lba2: u8,       // LBA 23:16
    pub device: u8,     // Device register

    pub lba3: u8,       // LBA 31:24
    pub lba4: u8,       // LBA 39:32
    pub lba5: u8,       // LBA 47:40
    pub featureh: u8,   // Feature high byte

    pub countl: u8,     // Sector count low
    pub counth: u8,     // Sector count high
    pub icc: u8,        // Isochronous command completion
    pub control: u8,    // Control register

    pub _reserved: [u8; 4],
}

const _: () = assert!(core::mem::size_of::<FisRegH2D>() == 20);

impl FisRegH2D {
    /// READ DMA EXT of `count` sectors at `lba`, device in LBA mode
    pub const fn read_dma_ext(lba: u32, count: u16) -> Self {
        Self {
            fis_type: FIS_TYPE_REG_H2D,
            pmport_c: 0x80,
            command: ATA_CMD_READ_DMA_EXT,
            featurel: 0,
            lba0: lba as u8,
            lba1: (lba >> 8) as u8,
            lba2: (lba >> 16) as u8,
            device: 1 << 6,
            lba3: (lba >> 24) as u8,
            lba4: 0,
            lba5: 0,
            featureh: 0,
            countl: count as u8,
            counth: (count >> 8) as u8,
            icc: 0,
            control: 0,
            _reserved: [0; 4],
        }
    }

    /// Wire image, as copied into the command table
    pub const fn to_bytes(&self) -> [u8; 20] {
        [
            self.fis_type, self.pmport_c, self.command, self.featurel,
            self.lba0, self.lba1, self.lba2, self.device,
            self.lba3, self.lba4, self.lba5, self.featureh,
            self.countl, self.counth, self.icc, self.control,
            0, 0, 0, 0,
        ]
    }
}

// ============================================================================
// Command Structures
// ============================================================================

/// Command Header (32 bytes each, 32 headers = 1KB)
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct CommandHeader {
    /// Command FIS length in DWORDs (2-16), ATAPI, Write, Prefetchable
    pub flags: u16,
    /// Physical Region Descriptor Table Length (entries)
    pub prdtl: u16,
    /// Physical Region Descriptor Byte Count (transferred)
    pub prdbc: u32,
    /// Command Table Base Address (128-byte aligned)
    pub ctba: u64,
    pub _reserved: [u32; 4],
}

impl CommandHeader {
    pub const ZERO: Self = Self { flags: 0, prdtl: 0, prdbc: 0, ctba: 0, _reserved: [0; 4] };
}

/// Physical Region Descriptor Table Entry
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct PrdtEntry {
    /// Data Base Address (2-byte aligned)
    pub dba: u64,
    pub _reserved: u32,
    /// Byte count - 1 in bits 21:0, bit 31 = interrupt on completion
    pub dbc_i: u32,
}

impl PrdtEntry {
    pub const ZERO: Self = Self { dba: 0, _reserved: 0, dbc_i: 0 };
}

/// PRDT entries per command table
pub const PRDT_ENTRIES: usize = 8;

/// Command Table (must be 128-byte aligned)
#[repr(C, align(128))]
#[derive(Clone, Copy)]
pub struct CommandTable {
    /// Command FIS (64 bytes)
    pub cfis: [u8; 64],
    /// ATAPI Command (16 bytes)
    pub acmd: [u8; 16],
    pub _reserved: [u8; 48],
    pub prdt: [PrdtEntry; PRDT_ENTRIES],
}

impl CommandTable {
    pub const ZERO: Self = Self {
        cfis: [0; 64],
        acmd: [0; 16],
        _reserved: [0; 48],
        prdt: [PrdtEntry::ZERO; PRDT_ENTRIES],
    };
}

/// Command tables per control block
pub const COMMAND_TABLE_SLOTS: usize = 8;

/// Everything the HBA reads or writes for one port, in one page:
/// command list at +0, received FIS at +1024, command tables from +2048.
#[repr(C, align(4096))]
#[derive(Clone, Copy)]
pub struct PortControlBlock {
    pub command_list: [CommandHeader; 32],
    pub received_fis: [u8; 256],
    _reserved: [u8; 768],
    pub command_tables: [CommandTable; COMMAND_TABLE_SLOTS],
}

pub const RECEIVED_FIS_OFFSET: usize = core::mem::offset_of!(PortControlBlock, received_fis);
pub const COMMAND_TABLES_OFFSET: usize = core::mem::offset_of!(PortControlBlock, command_tables);

const _: () = assert!(core::mem::size_of::<CommandHeader>() == 32);
const _: () = assert!(core::mem::size_of::<CommandTable>() == 256);
const _: () = assert!(core::mem::size_of::<PortControlBlock>() == 4096);
const _: () = assert!(RECEIVED_FIS_OFFSET == 1024);
const _: () = assert!(COMMAND_TABLES_OFFSET == 2048);

impl PortControlBlock {
    pub const ZERO: Self = Self {
        command_list: [CommandHeader::ZERO; 32],
        received_fis: [0; 256],
        _reserved: [0; 768],
        command_tables: [CommandTable::ZERO; COMMAND_TABLE_SLOTS],
    };
}

/// One control block per possible port
pub struct ControlArena {
    blocks: [PortControlBlock; MAX_PORTS],
}

static ARENA: Mutex<ControlArena> = Mutex::new(ControlArena::new());

impl ControlArena {
    pub const fn new() -> Self {
        Self { blocks: [PortControlBlock::ZERO; MAX_PORTS] }
    }

    /// Hand out the kernel's static arena. Only the first call succeeds.
    pub fn claim() -> Option<&'static mut ControlArena> {
        ARENA.try_lock().map(MutexGuard::leak)
    }

    fn block_mut(&mut self, port: PortHandle) -> &mut PortControlBlock {
        &mut self.blocks[port.0 as usize]
    }
}

impl Default for ControlArena {
    fn default() -> Self {
        Self::new()
    }
}

/// A port number known to be in range (0-31)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortHandle(u8);

impl PortHandle {
    pub const fn new(port: u8) -> Option<Self> {
        if (port as usize) < MAX_PORTS {
            Some(Self(port))
        } else {
            None
        }
    }

    pub const fn number(self) -> u8 {
        self.0
    }

    const fn bit(self) -> u32 {
        1 << self.0
    }

    const fn reg(self, reg: usize) -> usize {
        port_reg(self.0, reg)
    }
}

/// Destination memory for a DMA read.
///
/// Holds the exclusive borrow of the bytes for `'a`, so they cannot move or
/// be touched while the HBA may write them, together with the physical
/// address the HBA is given.
pub struct DmaBuffer<'a> {
    ptr: NonNull<u8>,
    len: usize,
    phys: u64,
    _borrow: PhantomData<&'a mut [u8]>,
}

impl<'a> DmaBuffer<'a> {
    /// Pin `bytes`; `map` must cover the memory they live in
    pub fn new(bytes: &'a mut [u8], map: PhysMap) -> Self {
        let len = bytes.len();
        let ptr = NonNull::from(bytes).cast::<u8>();
        Self { ptr, len, phys: map.virt_to_phys(ptr.as_ptr() as usize), _borrow: PhantomData }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bus address of the first byte
    pub fn phys_addr(&self) -> u64 {
        self.phys
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

// ============================================================================
// Controller
// ============================================================================

/// An enabled HBA and the ports that passed the presence check
struct Hba<'a, H> {
    regs: H,
    arena: &'a mut ControlArena,
    /// Bit n set: port n holds an ATA disk and has been brought up
    sata_ports: u32,
}

/// AHCI controller state. Disabled when no HBA was found, in which case
/// every operation reports [`DiskError::ControllerAbsent`].
pub struct AhciController<'a, H> {
    hba: Option<Hba<'a, H>>,
    budget: PollBudget,
    phys: PhysMap,
}

impl<'a, H: HbaRegisters> AhciController<'a, H> {
    /// A controller that owns no hardware
    pub fn disabled(config: &StorageConfig) -> Self {
        Self { hba: None, budget: config.poll, phys: config.phys }
    }

    /// Find the first SATA-class PCI function, enable it, map its ABAR
    /// (BAR5) with `map_abar`, and bring up every populated port.
    pub fn init<P, F>(
        pci: &mut P,
        arena: &'a mut ControlArena,
        config: &StorageConfig,
        map_abar: F,
    ) -> Self
    where
        P: PciConfigAccess + ?Sized,
        F: FnOnce(u64) -> Option<H>,
    {
        let Some(addr) = pci::find_class(pci, pci::class::MASS_STORAGE, pci::storage::SATA) else {
            crate::log!("[AHCI] No controller found");
            return Self::disabled(config);
        };

        let abar = (pci.read32(addr, pci::reg::BAR5) & 0xFFFF_FFF0) as u64;
        if abar == 0 {
            crate::log_warn!("[AHCI] {} has no ABAR", addr);
            return Self::disabled(config);
        }

        pci::enable_mmio_bus_master(pci, addr);

        let Some(regs) = map_abar(abar) else {
            crate::log_error!("[AHCI] Failed to map ABAR {:#x}", abar);
            return Self::disabled(config);
        };

        crate::log!("[AHCI] Controller at {} ABAR={:#x}", addr, abar);
        Self::with_registers(regs, arena, config)
    }

    /// Take over an already-mapped register block
    pub fn with_registers(mut regs: H, arena: &'a mut ControlArena, config: &StorageConfig) -> Self {
        let ghc = regs.read32(hba::GHC);
        regs.write32(hba::GHC, ghc | hba::GHC_AE);

        let sata_ports = probe_ports(&mut regs);

        let mut controller = Self {
            hba: Some(Hba { regs, arena, sata_ports: 0 }),
            budget: config.poll,
            phys: config.phys,
        };

        for port in 0..MAX_PORTS as u8 {
            if sata_ports & (1 << port) != 0 {
                if let Some(handle) = PortHandle::new(port) {
                    controller.bring_up_port(handle);
                }
            }
        }

        if let Some(hba) = controller.hba.as_mut() {
            hba.sata_ports = sata_ports;
        }

        crate::log!("[AHCI] {} SATA drive(s) ready", sata_ports.count_ones());
        controller
    }

    /// Whether an HBA is attached
    pub fn is_enabled(&self) -> bool {
        self.hba.is_some()
    }

    /// Bitmap of ports accepted as SATA disks
    pub fn sata_ports(&self) -> u32 {
        self.hba.as_ref().map(|h| h.sata_ports).unwrap_or(0)
    }

    pub fn drive_exists(&self, port: PortHandle) -> bool {
        self.sata_ports() & port.bit() != 0
    }

    pub fn phys(&self) -> PhysMap {
        self.phys
    }

    /// Pin `bytes` for a transfer using this controller's address map
    pub fn dma_buffer<'b>(&self, bytes: &'b mut [u8]) -> DmaBuffer<'b> {
        DmaBuffer::new(bytes, self.phys)
    }

    pub fn hba(&self) -> Option<&H> {
        self.hba.as_ref().map(|h| &h.regs)
    }

    pub fn hba_mut(&mut self) -> Option<&mut H> {
        self.hba.as_mut().map(|h| &mut h.regs)
    }

    /// Stop the port's engines, lay out its control block, restart.
    ///
    /// Neither engine wait is fatal: controllers that never drop CR/FR
    /// still accept the new addresses.
    fn bring_up_port(&mut self, port: PortHandle) {
        let budget = self.budget;
        let map = self.phys;
        let Some(hba) = self.hba.as_mut() else {
            return;
        };
        let regs = &mut hba.regs;

        let cmd = regs.read32(port.reg(px::CMD));
        regs.write32(port.reg(px::CMD), cmd & !(px_cmd::ST | px_cmd::FRE));

        let stopped = spin_until(budget.ahci_engine_stop, || {
            regs.read32(port.reg(px::CMD)) & (px_cmd::CR | px_cmd::FR) == 0
        });
        if !stopped {
            crate::log_warn!("[AHCI] Port {} engine still running, continuing", port.0);
        }

        let block = hba.arena.block_mut(port);
        *block = PortControlBlock::ZERO;

        let base = map.virt_to_phys(&*block as *const PortControlBlock as usize);
        for (slot, header) in block.command_list.iter_mut().take(COMMAND_TABLE_SLOTS).enumerate() {
            header.ctba = base + (COMMAND_TABLES_OFFSET + slot * core::mem::size_of::<CommandTable>()) as u64;
        }
        let fis = base + RECEIVED_FIS_OFFSET as u64;
        fence(Ordering::SeqCst);

        regs.write32(port.reg(px::CLB), base as u32);
        regs.write32(port.reg(px::CLBU), (base >> 32) as u32);
        regs.write32(port.reg(px::FB), fis as u32);
        regs.write32(port.reg(px::FBU), (fis >> 32) as u32);

        let idle = spin_until(budget.ahci_engine_start, || {
            regs.read32(port.reg(px::CMD)) & px_cmd::CR == 0
        });
        if !idle {
            crate::log_warn!("[AHCI] Port {} CR stuck, starting anyway", port.0);
        }

        let cmd = regs.read32(port.reg(px::CMD));
        regs.write32(port.reg(px::CMD), cmd | px_cmd::FRE);
        regs.write32(port.reg(px::CMD), cmd | px_cmd::FRE | px_cmd::ST);

        crate::log_debug!("[AHCI] Port {} control block at {:#x}", port.0, base);
    }

    /// Read `count` sectors starting at `lba` into `buffer` with one
    /// READ DMA EXT in slot 0.
    pub fn read(
        &mut self,
        port: PortHandle,
        lba: u32,
        count: u16,
        buffer: &mut DmaBuffer<'_>,
    ) -> Result<(), DiskError> {
        let budget = self.budget;
        let map = self.phys;
        let hba = self.hba.as_mut().ok_or(DiskError::ControllerAbsent)?;

        if hba.sata_ports & port.bit() == 0 {
            return Err(DiskError::DriveAbsent);
        }
        if count == 0 || count > MAX_SECTORS_PER_COMMAND {
            return Err(DiskError::InvalidSectorCount);
        }
        let bytes = count as usize * SECTOR_SIZE;
        if buffer.len() < bytes {
            return Err(DiskError::BufferTooSmall);
        }

        let regs = &mut hba.regs;
        regs.write32(port.reg(px::IS), u32::MAX);
        regs.write32(port.reg(px::SERR), u32::MAX);

        let block = hba.arena.block_mut(port);
        let table_phys = map.virt_to_phys(&block.command_tables[0] as *const CommandTable as usize);

        let mut table = CommandTable::ZERO;
        table.cfis[..20].copy_from_slice(&FisRegH2D::read_dma_ext(lba, count).to_bytes());
        table.prdt[0] = PrdtEntry {
            dba: buffer.phys_addr(),
            _reserved: 0,
            dbc_i: (bytes as u32 - 1) | (1 << 31),
        };

        // CFL = 5 DWORDs, W = 0 (device to host), one PRDT entry
        let header = CommandHeader { flags: 5, prdtl: 1, prdbc: 0, ctba: table_phys, _reserved: [0; 4] };

        unsafe {
            ptr::write_volatile(&mut block.command_tables[0], table);
            ptr::write_volatile(&mut block.command_list[0], header);
        }
        fence(Ordering::SeqCst);

        let idle = spin_until(budget.ahci_port_idle, || {
            regs.read32(port.reg(px::TFD)) & (ATA_DEV_BUSY | ATA_DEV_DRQ) == 0
        });
        if !idle {
            crate::log_warn!("[AHCI] Port {} busy, LBA {} not issued", port.0, lba);
            return Err(DiskError::Timeout);
        }

        crate::storage_trace!("[AHCI] Port {} READ DMA EXT lba={} count={}", port.0, lba, count);

        regs.write32(port.reg(px::CI), 1);

        let mut outcome = Err(DiskError::Timeout);
        spin_until(budget.ahci_command, || {
            if regs.read32(port.reg(px::CI)) & 1 == 0 {
                outcome = Ok(());
                return true;
            }
            if regs.read32(port.reg(px::IS)) & PX_IS_TFES != 0 {
                outcome = Err(DiskError::TaskFileError);
                return true;
            }
            false
        });
        fence(Ordering::SeqCst);

        if let Err(e) = outcome {
            crate::log_warn!("[AHCI] Port {} read LBA {} failed: {}", port.0, lba, e);
        }
        outcome
    }
}

/// Bitmap of implemented ports holding a live ATA disk
fn probe_ports<H: HbaRegisters>(regs: &mut H) -> u32 {
    let implemented = regs.read32(hba::PI);
    let mut found = 0u32;

    for port in 0..MAX_PORTS as u8 {
        if implemented & (1 << port) == 0 {
            continue;
        }

        let ssts = regs.read32(port_reg(port, px::SSTS));
        let det = ssts & 0x0F;
        let ipm = (ssts >> 8) & 0x0F;
        if det != SSTS_DET_PRESENT || ipm != SSTS_IPM_ACTIVE {
            continue;
        }

        let sig = regs.read32(port_reg(port, px::SIG));
        if sig != SATA_SIG_ATA {
            crate::log_debug!("[AHCI] Port {}: signature {:#010x}, skipped", port, sig);
            continue;
        }

        crate::log!("[AHCI] Port {}: SATA drive detected", port);
        found |= 1 << port;
    }

    found
}
