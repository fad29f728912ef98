//! Slate kernel storage stack
//!
//! Polled block drivers for the legacy IDE channel and AHCI host adapters,
//! a flat drive index over both, and read-only FAT16/FAT32 volumes with a
//! small mount table on top.
//!
//! ```text
//!   vfs::MountTable ── vfs::Volume (Fat16 | Fat32)
//!            │
//!   drivers::BlockDevice ── drivers::Storage
//!            │                   ├── ata::AtaPio      (disk0, disk1)
//!            │                   └── ahci::AhciController (sata0..sata31)
//! ```

#![cfg_attr(not(test), no_std)]

#[macro_use]
pub mod serial;
#[macro_use]
pub mod logger;

pub mod config;
pub mod drivers;
pub mod pci;
pub mod vfs;

#[cfg(test)]
mod testing;

pub use config::{PhysMap, PollBudget, StorageConfig};
pub use drivers::{BlockDevice, DiskError, DriveIndex, DriveTable, Storage, SECTOR_SIZE};
pub use vfs::{FsError, FsKind, MountTable};

#[cfg(target_arch = "x86_64")]
use drivers::ahci::{AhciController, ControlArena, MmioHba};
#[cfg(target_arch = "x86_64")]
use drivers::ata::{AtaPio, PioPorts};

/// Bring up both controller families on real hardware.
///
/// Returns `None` only if the AHCI control arena was already claimed by an
/// earlier call. A missing AHCI controller is not an error: the SATA half
/// of the index space just reports every drive absent.
#[cfg(target_arch = "x86_64")]
pub fn bring_up(config: &StorageConfig) -> Option<Storage<'static, PioPorts, MmioHba>> {
    let arena = ControlArena::claim()?;
    let phys = config.phys;

    let ahci = if cfg!(feature = "ahci") {
        AhciController::init(&mut pci::LegacyConfigSpace, arena, config, |abar| {
            let base = phys.phys_to_virt(abar);
            // SAFETY: BAR5 of the controller just found, mapped by the caller's
            // direct map and owned by this driver from here on
            Some(unsafe { MmioHba::new(base) })
        })
    } else {
        AhciController::disabled(config)
    };

    let ata = AtaPio::new(PioPorts, config.poll);
    let mut storage = Storage::new(ata, ahci);

    let drives = storage.scan();
    log!("[DISK] {} drive(s) online", drives.count());

    Some(storage)
}
