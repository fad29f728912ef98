//! PCI configuration space access
//!
//! Just enough of the bus to locate a storage controller by class code and
//! switch on its decoding. Only function 0 of each slot is examined.

/// PCI configuration ports
const PCI_CONFIG_ADDRESS: u16 = 0xCF8;
const PCI_CONFIG_DATA: u16 = 0xCFC;

/// Configuration space register offsets
pub mod reg {
    pub const VENDOR_DEVICE: u8 = 0x00;
    pub const COMMAND: u8 = 0x04;
    pub const CLASS: u8 = 0x08;
    pub const BAR5: u8 = 0x24;
}

/// Command register bits
pub mod command {
    pub const IO_SPACE: u32 = 1 << 0;
    pub const MEMORY_SPACE: u32 = 1 << 1;
    pub const BUS_MASTER: u32 = 1 << 2;
}

/// PCI device classes
pub mod class {
    pub const MASS_STORAGE: u8 = 0x01;
}

/// Storage subclasses
pub mod storage {
    pub const IDE: u8 = 0x01;
    pub const ATA: u8 = 0x05;
    pub const SATA: u8 = 0x06;
    pub const NVM: u8 = 0x08;
}

/// Location of a function on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciAddress {
    pub bus: u8,
    pub slot: u8,
    pub function: u8,
}

impl PciAddress {
    pub const fn new(bus: u8, slot: u8, function: u8) -> Self {
        Self { bus, slot, function }
    }
}

impl core::fmt::Display for PciAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.slot, self.function)
    }
}

/// Raw 32-bit configuration space access
pub trait PciConfigAccess {
    fn read32(&mut self, addr: PciAddress, offset: u8) -> u32;
    fn write32(&mut self, addr: PciAddress, offset: u8, value: u32);
}

/// Value written to CONFIG_ADDRESS to select a register
pub fn config_address(addr: PciAddress, offset: u8) -> u32 {
    (1 << 31) |                               // Enable bit
    ((addr.bus as u32) << 16) |               // Bus number
    (((addr.slot as u32) & 0x1F) << 11) |     // Device number
    (((addr.function as u32) & 0x07) << 8) |  // Function number
    ((offset as u32) & 0xFC)                  // Register offset (aligned)
}

/// Mechanism #1 access through ports 0xCF8/0xCFC
#[cfg(target_arch = "x86_64")]
pub struct LegacyConfigSpace;

#[cfg(target_arch = "x86_64")]
impl PciConfigAccess for LegacyConfigSpace {
    fn read32(&mut self, addr: PciAddress, offset: u8) -> u32 {
        use x86_64::instructions::port::Port;

        let mut addr_port: Port<u32> = Port::new(PCI_CONFIG_ADDRESS);
        let mut data_port: Port<u32> = Port::new(PCI_CONFIG_DATA);

        unsafe {
            addr_port.write(config_address(addr, offset));
            data_port.read()
        }
    }

    fn write32(&mut self, addr: PciAddress, offset: u8, value: u32) {
        use x86_64::instructions::port::Port;

        let mut addr_port: Port<u32> = Port::new(PCI_CONFIG_ADDRESS);
        let mut data_port: Port<u32> = Port::new(PCI_CONFIG_DATA);

        unsafe {
            addr_port.write(config_address(addr, offset));
            data_port.write(value);
        }
    }
}

/// Scan every bus/slot (function 0) for the first device of the given
/// class and subclass
pub fn find_class<P: PciConfigAccess + ?Sized>(
    access: &mut P,
    class_code: u8,
    subclass: u8,
) -> Option<PciAddress> {
    for bus in 0..=255u8 {
        for slot in 0..32u8 {
            let addr = PciAddress::new(bus, slot, 0);
            if access.read32(addr, reg::VENDOR_DEVICE) == 0xFFFF_FFFF {
                continue;
            }

            let class_reg = access.read32(addr, reg::CLASS);
            let class = ((class_reg >> 24) & 0xFF) as u8;
            let sub = ((class_reg >> 16) & 0xFF) as u8;

            if class == class_code && sub == subclass {
                crate::log_debug!("[PCI] {} class {:02x}:{:02x}", addr, class, sub);
                return Some(addr);
            }
        }
    }
    None
}

/// Turn on memory-space decoding and bus mastering
pub fn enable_mmio_bus_master<P: PciConfigAccess + ?Sized>(access: &mut P, addr: PciAddress) {
    let cmd = access.read32(addr, reg::COMMAND);
    access.write32(addr, reg::COMMAND, cmd | command::MEMORY_SPACE | command::BUS_MASTER);
}
