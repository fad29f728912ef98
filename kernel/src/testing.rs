//! Hardware doubles and disk image builders for unit tests

use std::collections::{HashMap, VecDeque};

use crate::drivers::ahci::{
    self, hba, port_reg, px, px_cmd, CommandHeader, CommandTable, HbaRegisters, PX_IS_TFES,
};
use crate::drivers::ata::{self, PortIo};
use crate::drivers::{BlockDevice, DiskError, DriveIndex, SECTOR_SIZE};
use crate::pci::{self, PciAddress, PciConfigAccess};

fn sector_of(image: &[u8], lba: u64) -> [u8; SECTOR_SIZE] {
    let mut out = [0u8; SECTOR_SIZE];
    let start = lba as usize * SECTOR_SIZE;
    if start < image.len() {
        let end = (start + SECTOR_SIZE).min(image.len());
        out[..end - start].copy_from_slice(&image[start..end]);
    }
    out
}

// ============================================================================
// In-memory block device
// ============================================================================

/// Drive images keyed by index. Reads past the end of an image return zeroes.
#[derive(Default)]
pub struct MemDisk {
    drives: HashMap<DriveIndex, Vec<u8>>,
    reads: Vec<(DriveIndex, u32)>,
    failures: Vec<(DriveIndex, u32)>,
}

impl MemDisk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, drive: DriveIndex, image: Vec<u8>) {
        self.drives.insert(drive, image);
    }

    /// Make every read of `lba` on `drive` time out
    pub fn fail_on(&mut self, drive: DriveIndex, lba: u32) {
        self.failures.push((drive, lba));
    }

    pub fn read_count(&self) -> usize {
        self.reads.len()
    }

    /// LBAs read from `drive`, in order
    pub fn reads_of(&self, drive: DriveIndex) -> Vec<u32> {
        self.reads.iter().filter(|(d, _)| *d == drive).map(|&(_, lba)| lba).collect()
    }
}

impl BlockDevice for MemDisk {
    fn drive_exists(&mut self, drive: DriveIndex) -> bool {
        self.drives.contains_key(&drive)
    }

    fn read_sector(
        &mut self,
        drive: DriveIndex,
        lba: u32,
        buffer: &mut [u8; SECTOR_SIZE],
    ) -> Result<(), DiskError> {
        let image = self.drives.get(&drive).ok_or(DiskError::DriveAbsent)?;
        self.reads.push((drive, lba));
        if self.failures.contains(&(drive, lba)) {
            return Err(DiskError::Timeout);
        }
        *buffer = sector_of(image, lba as u64);
        Ok(())
    }
}

// ============================================================================
// Legacy IDE channel
// ============================================================================

/// Primary IDE register file with up to two drives behind it
pub struct MockAtaBus {
    drives: [Option<Vec<u8>>; 2],
    selected: usize,
    lba: [u8; 3],
    pending: VecDeque<u16>,
    /// Last value written to the drive/head register
    pub last_head: u8,
    /// Empty slots read 0xFF instead of 0x00
    pub floating: bool,
    /// BSY never clears
    pub busy_forever: bool,
    /// Data is never offered after a command
    pub drq_never: bool,
    pub status_reads: u32,
    /// (drive, lba) of every READ SECTORS
    pub issued: Vec<(usize, u32)>,
}

impl MockAtaBus {
    pub fn new(master: Option<Vec<u8>>, slave: Option<Vec<u8>>) -> Self {
        Self {
            drives: [master, slave],
            selected: 0,
            lba: [0; 3],
            pending: VecDeque::new(),
            last_head: 0,
            floating: false,
            busy_forever: false,
            drq_never: false,
            status_reads: 0,
            issued: Vec::new(),
        }
    }

    fn status(&self) -> u8 {
        if self.busy_forever {
            return 0x80;
        }
        if self.drives[self.selected].is_none() {
            return if self.floating { 0xFF } else { 0x00 };
        }
        if !self.pending.is_empty() && !self.drq_never {
            0x58 // DRDY | DSC | DRQ
        } else {
            0x50 // DRDY | DSC
        }
    }
}

impl PortIo for MockAtaBus {
    fn inb(&mut self, port: u16) -> u8 {
        match port {
            ata::reg::STATUS => {
                self.status_reads += 1;
                self.status()
            }
            _ => 0,
        }
    }

    fn outb(&mut self, port: u16, value: u8) {
        match port {
            ata::reg::DRIVE_HEAD => {
                self.last_head = value;
                self.selected = ((value >> 4) & 1) as usize;
            }
            ata::reg::LBA_LOW => self.lba[0] = value,
            ata::reg::LBA_MID => self.lba[1] = value,
            ata::reg::LBA_HIGH => self.lba[2] = value,
            ata::reg::COMMAND if value == ata::cmd::READ_SECTORS => {
                let lba = u32::from_le_bytes([self.lba[0], self.lba[1], self.lba[2], self.last_head & 0x0F]);
                self.issued.push((self.selected, lba));
                if let Some(image) = &self.drives[self.selected] {
                    let sector = sector_of(image, lba as u64);
                    self.pending = sector
                        .chunks_exact(2)
                        .map(|w| u16::from_le_bytes([w[0], w[1]]))
                        .collect();
                }
            }
            _ => {}
        }
    }

    fn inw(&mut self, port: u16) -> u16 {
        match port {
            ata::reg::DATA => self.pending.pop_front().unwrap_or(0),
            _ => 0,
        }
    }
}

// ============================================================================
// AHCI register block
// ============================================================================

const HBA_SIZE: usize = port_reg(ahci::MAX_PORTS as u8, 0);

/// A command the mock HBA picked up from a command list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCommand {
    pub port: u8,
    pub flags: u16,
    pub prdtl: u16,
    pub fis: [u8; 20],
    pub lba: u64,
    pub count: u16,
    pub dba: u64,
    pub dbc_i: u32,
}

/// Simulated HBA. Writing PxCI walks the command list the driver built
/// (physical addresses are host pointers, so tests use identity mapping)
/// and executes READ DMA EXT against the port's disk image.
pub struct MockHba {
    regs: Vec<u32>,
    disks: HashMap<u8, Vec<u8>>,
    countdown: u32,
    /// CR and FR never drop
    pub stuck_running: bool,
    /// PxTFD.BSY never drops
    pub stuck_busy: bool,
    /// PxCI never clears
    pub never_complete: bool,
    /// Commands fail with PxIS.TFES
    pub fail_with_tfe: bool,
    /// PxCI reads before a command completes
    pub complete_after: u32,
    pub ci_reads: u32,
    pub issued: Vec<IssuedCommand>,
}

impl MockHba {
    pub fn new() -> Self {
        Self {
            regs: vec![0; HBA_SIZE / 4],
            disks: HashMap::new(),
            countdown: 0,
            stuck_running: false,
            stuck_busy: false,
            never_complete: false,
            fail_with_tfe: false,
            complete_after: 0,
            ci_reads: 0,
            issued: Vec::new(),
        }
    }

    /// Every listed port implemented, linked up and holding an ATA disk
    pub fn with_sata_ports(ports: &[u8]) -> Self {
        let mut hba = Self::new();
        for &port in ports {
            hba.set_port(port, 0x113, ahci::SATA_SIG_ATA);
        }
        hba
    }

    /// Mark `port` implemented with the given PxSSTS and PxSIG
    pub fn set_port(&mut self, port: u8, ssts: u32, sig: u32) {
        self.regs[hba::PI / 4] |= 1 << port;
        self.regs[port_reg(port, px::SSTS) / 4] = ssts;
        self.regs[port_reg(port, px::SIG) / 4] = sig;
    }

    pub fn attach_disk(&mut self, port: u8, image: Vec<u8>) {
        self.disks.insert(port, image);
    }

    /// Register value without read side effects
    pub fn reg(&self, offset: usize) -> u32 {
        self.regs[offset / 4]
    }

    pub fn port_reg(&self, port: u8, reg: usize) -> u32 {
        self.reg(port_reg(port, reg))
    }

    fn port_of(offset: usize) -> Option<(u8, usize)> {
        if offset < hba::PORT_BASE {
            return None;
        }
        let rel = offset - hba::PORT_BASE;
        Some(((rel / hba::PORT_STRIDE) as u8, rel % hba::PORT_STRIDE))
    }

    fn execute(&mut self, port: u8) {
        let clb = self.port_reg(port, px::CLB) as u64 | (self.port_reg(port, px::CLBU) as u64) << 32;
        // SAFETY: the driver pointed CLB at a live control block (identity mapped)
        let header = unsafe { core::ptr::read_volatile(clb as *const CommandHeader) };
        let table = unsafe { core::ptr::read_volatile(header.ctba as *const CommandTable) };

        let mut fis = [0u8; 20];
        fis.copy_from_slice(&table.cfis[..20]);
        let lba = [fis[4], fis[5], fis[6], fis[8], fis[9], fis[10]]
            .iter()
            .enumerate()
            .fold(0u64, |acc, (i, &b)| acc | (b as u64) << (8 * i));
        let count = u16::from_le_bytes([fis[12], fis[13]]);
        let prd = table.prdt[0];

        self.issued.push(IssuedCommand {
            port,
            flags: header.flags,
            prdtl: header.prdtl,
            fis,
            lba,
            count,
            dba: prd.dba,
            dbc_i: prd.dbc_i,
        });

        if self.fail_with_tfe || self.never_complete {
            return;
        }

        let bytes = ((prd.dbc_i & 0x003F_FFFF) + 1) as usize;
        let image = self.disks.get(&port).map(Vec::as_slice).unwrap_or(&[]);
        for i in 0..bytes / SECTOR_SIZE {
            let sector = sector_of(image, lba + i as u64);
            // SAFETY: dba is the driver's DmaBuffer, at least `bytes` long
            unsafe {
                core::ptr::copy_nonoverlapping(
                    sector.as_ptr(),
                    (prd.dba as *mut u8).add(i * SECTOR_SIZE),
                    SECTOR_SIZE,
                );
            }
        }
    }
}

impl Default for MockHba {
    fn default() -> Self {
        Self::new()
    }
}

impl HbaRegisters for MockHba {
    fn read32(&mut self, offset: usize) -> u32 {
        let value = self.regs[offset / 4];
        match Self::port_of(offset) {
            Some((_, px::CMD)) => {
                if self.stuck_running {
                    value | px_cmd::CR | px_cmd::FR
                } else {
                    value & !(px_cmd::CR | px_cmd::FR)
                }
            }
            Some((_, px::TFD)) if self.stuck_busy => 0x80,
            Some((_, px::CI)) => {
                self.ci_reads += 1;
                if value & 1 != 0 && self.countdown > 0 {
                    self.countdown -= 1;
                    if self.countdown == 0 {
                        self.regs[offset / 4] &= !1;
                    }
                }
                value
            }
            _ => value,
        }
    }

    fn write32(&mut self, offset: usize, value: u32) {
        match Self::port_of(offset) {
            // Write 1 to clear
            Some((_, px::IS)) | Some((_, px::SERR)) => self.regs[offset / 4] &= !value,
            Some((port, px::CI)) => {
                self.regs[offset / 4] |= value;
                if value & 1 != 0 {
                    self.execute(port);
                    if self.fail_with_tfe {
                        self.regs[port_reg(port, px::IS) / 4] |= PX_IS_TFES;
                    } else if !self.never_complete {
                        if self.complete_after == 0 {
                            self.regs[offset / 4] &= !1;
                        } else {
                            self.countdown = self.complete_after;
                        }
                    }
                }
            }
            _ => self.regs[offset / 4] = value,
        }
    }
}

// ============================================================================
// PCI configuration space
// ============================================================================

/// Sparse configuration space. Absent functions read all ones.
#[derive(Default)]
pub struct MockPci {
    devices: HashMap<(u8, u8, u8), HashMap<u8, u32>>,
}

impl MockPci {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&mut self, addr: PciAddress, class_reg: u32, bar5: u32) {
        let mut space = HashMap::new();
        space.insert(pci::reg::VENDOR_DEVICE, 0x2922_8086);
        space.insert(pci::reg::COMMAND, 0);
        space.insert(pci::reg::CLASS, class_reg);
        space.insert(pci::reg::BAR5, bar5);
        self.devices.insert((addr.bus, addr.slot, addr.function), space);
    }
}

impl PciConfigAccess for MockPci {
    fn read32(&mut self, addr: PciAddress, offset: u8) -> u32 {
        match self.devices.get(&(addr.bus, addr.slot, addr.function)) {
            Some(space) => space.get(&offset).copied().unwrap_or(0),
            None => 0xFFFF_FFFF,
        }
    }

    fn write32(&mut self, addr: PciAddress, offset: u8, value: u32) {
        if let Some(space) = self.devices.get_mut(&(addr.bus, addr.slot, addr.function)) {
            space.insert(offset, value);
        }
    }
}

// ============================================================================
// FAT image builder
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq)]
enum Flavor {
    Fat16,
    Fat32,
}

/// Data clusters in every built image
const TOTAL_CLUSTERS: u32 = 128;

/// Builds small FAT16/FAT32 images.
///
/// FAT16: 1 reserved sector, 2 FATs of 4 sectors, 64 root entries (4
/// sectors), data from sector 13. FAT32: 32 reserved sectors, 2 FATs of 4
/// sectors, data from sector 40, root directory chain starting at cluster 2.
#[derive(Clone)]
pub struct FatBuilder {
    flavor: Flavor,
    sectors_per_cluster: u8,
    fat: Vec<u32>,
    root: Vec<[u8; 32]>,
    data: HashMap<u32, Vec<u8>>,
    next_free: u32,
    stride: u32,
}

impl FatBuilder {
    pub fn fat16(sectors_per_cluster: u8) -> Self {
        let mut fat = vec![0u32; TOTAL_CLUSTERS as usize + 2];
        fat[0] = 0xFFF8;
        fat[1] = 0xFFFF;
        Self {
            flavor: Flavor::Fat16,
            sectors_per_cluster,
            fat,
            root: Vec::new(),
            data: HashMap::new(),
            next_free: 2,
            stride: 1,
        }
    }

    pub fn fat32(sectors_per_cluster: u8) -> Self {
        let mut fat = vec![0u32; TOTAL_CLUSTERS as usize + 2];
        fat[0] = 0x0FFF_FFF8;
        fat[1] = 0x0FFF_FFFF;
        // Root directory
        fat[2] = 0x0FFF_FFFF;
        Self {
            flavor: Flavor::Fat32,
            sectors_per_cluster,
            fat,
            root: Vec::new(),
            data: HashMap::new(),
            next_free: 3,
            stride: 1,
        }
    }

    /// Leave `stride - 1` free clusters between allocations
    pub fn set_stride(&mut self, stride: u32) {
        self.stride = stride;
    }

    fn end_of_chain(&self) -> u32 {
        match self.flavor {
            Flavor::Fat16 => 0xFFFF,
            Flavor::Fat32 => 0x0FFF_FFFF,
        }
    }

    fn cluster_bytes(&self) -> usize {
        self.sectors_per_cluster as usize * SECTOR_SIZE
    }

    fn allocate(&mut self) -> u32 {
        let cluster = self.next_free;
        self.next_free += self.stride;
        assert!(cluster < TOTAL_CLUSTERS + 2, "image full");
        cluster
    }

    /// Chain enough clusters for `contents`; 0 when empty
    fn store(&mut self, contents: &[u8], min_clusters: usize) -> u32 {
        let n = contents.len().div_ceil(self.cluster_bytes()).max(min_clusters);
        let clusters: Vec<u32> = (0..n).map(|_| self.allocate()).collect();
        for (i, &c) in clusters.iter().enumerate() {
            let start = (i * self.cluster_bytes()).min(contents.len());
            let end = ((i + 1) * self.cluster_bytes()).min(contents.len());
            self.data.insert(c, contents[start..end].to_vec());
            self.fat[c as usize] = clusters.get(i + 1).copied().unwrap_or(self.end_of_chain());
        }
        clusters.first().copied().unwrap_or(0)
    }

    fn entry(name: &[u8; 11], attr: u8, cluster: u32, size: u32) -> [u8; 32] {
        let mut e = [0u8; 32];
        e[..11].copy_from_slice(name);
        e[11] = attr;
        e[20..22].copy_from_slice(&((cluster >> 16) as u16).to_le_bytes());
        e[26..28].copy_from_slice(&(cluster as u16).to_le_bytes());
        e[28..32].copy_from_slice(&size.to_le_bytes());
        e
    }

    /// Add a root file; returns its first cluster
    pub fn add_file(&mut self, name: &[u8; 11], contents: &[u8]) -> u32 {
        let cluster = self.store(contents, 0);
        self.root.push(Self::entry(name, 0x20, cluster, contents.len() as u32));
        cluster
    }

    /// Add an empty subdirectory; returns its cluster
    pub fn add_dir(&mut self, name: &[u8; 11]) -> u32 {
        let cluster = self.store(&[], 1);
        self.root.push(Self::entry(name, 0x10, cluster, 0));
        cluster
    }

    pub fn add_deleted(&mut self, name: &[u8; 11]) {
        let mut e = Self::entry(name, 0x20, 0, 0);
        e[0] = 0xE5;
        self.root.push(e);
    }

    pub fn add_long_name(&mut self) {
        let mut e = [0u8; 32];
        e[0] = 0x41;
        e[1..11].copy_from_slice(b"l\0o\0n\0g\0.\0");
        e[11] = 0x0F;
        self.root.push(e);
    }

    /// An all-zero slot; nothing after it is listed
    pub fn add_end_marker(&mut self) {
        self.root.push([0u8; 32]);
    }

    /// Overwrite one allocation entry
    pub fn set_fat(&mut self, cluster: u32, value: u32) {
        self.fat[cluster as usize] = value;
    }

    fn layout(&self) -> (u32, u32, u32) {
        // (reserved, sectors per FAT, data start)
        match self.flavor {
            Flavor::Fat16 => (1, 4, 1 + 2 * 4 + 4),
            Flavor::Fat32 => (32, 4, 32 + 2 * 4),
        }
    }

    /// The bare volume, boot sector at LBA 0
    pub fn build(&self) -> Vec<u8> {
        let mut b = self.clone();
        let (reserved, spf, data_start) = b.layout();
        let spc = b.sectors_per_cluster as u32;

        // FAT32 root directory: grow the chain from cluster 2 as needed
        let mut root_clusters = Vec::new();
        if b.flavor == Flavor::Fat32 {
            let per_cluster = b.cluster_bytes() / 32;
            let needed = b.root.len().div_ceil(per_cluster).max(1);
            root_clusters.push(2u32);
            for _ in 1..needed {
                root_clusters.push(b.allocate());
            }
            for pair in root_clusters.windows(2) {
                b.fat[pair[0] as usize] = pair[1];
            }
            if let Some(&last) = root_clusters.last() {
                b.fat[last as usize] = b.end_of_chain();
            }
        }

        let total_sectors = data_start + TOTAL_CLUSTERS * spc;
        let mut image = vec![0u8; total_sectors as usize * SECTOR_SIZE];

        // Boot sector
        let bs = &mut image[..SECTOR_SIZE];
        bs[0..3].copy_from_slice(&[0xEB, 0x3C, 0x90]);
        bs[3..11].copy_from_slice(b"SLATE1.0");
        bs[11..13].copy_from_slice(&512u16.to_le_bytes());
        bs[13] = b.sectors_per_cluster;
        bs[14..16].copy_from_slice(&(reserved as u16).to_le_bytes());
        bs[16] = 2;
        bs[21] = 0xF8;
        bs[32..36].copy_from_slice(&total_sectors.to_le_bytes());
        match b.flavor {
            Flavor::Fat16 => {
                bs[17..19].copy_from_slice(&64u16.to_le_bytes());
                bs[22..24].copy_from_slice(&(spf as u16).to_le_bytes());
                bs[54..62].copy_from_slice(b"FAT16   ");
            }
            Flavor::Fat32 => {
                bs[36..40].copy_from_slice(&spf.to_le_bytes());
                bs[44..48].copy_from_slice(&2u32.to_le_bytes());
                bs[82..90].copy_from_slice(b"FAT32   ");
            }
        }
        bs[510] = 0x55;
        bs[511] = 0xAA;

        // Both FAT copies
        for copy in 0..2 {
            let base = (reserved + copy * spf) as usize * SECTOR_SIZE;
            for (c, &v) in b.fat.iter().enumerate() {
                match b.flavor {
                    Flavor::Fat16 => {
                        let at = base + c * 2;
                        image[at..at + 2].copy_from_slice(&(v as u16).to_le_bytes());
                    }
                    Flavor::Fat32 => {
                        let at = base + c * 4;
                        image[at..at + 4].copy_from_slice(&v.to_le_bytes());
                    }
                }
            }
        }

        let cluster_offset = |c: u32| (data_start + (c - 2) * spc) as usize * SECTOR_SIZE;

        // Root directory
        match b.flavor {
            Flavor::Fat16 => {
                assert!(b.root.len() <= 64, "FAT16 root region holds 64 entries");
                let base = (reserved + 2 * spf) as usize * SECTOR_SIZE;
                for (i, e) in b.root.iter().enumerate() {
                    image[base + i * 32..base + i * 32 + 32].copy_from_slice(e);
                }
            }
            Flavor::Fat32 => {
                let per_cluster = b.cluster_bytes() / 32;
                for (i, e) in b.root.iter().enumerate() {
                    let at = cluster_offset(root_clusters[i / per_cluster]) + (i % per_cluster) * 32;
                    image[at..at + 32].copy_from_slice(e);
                }
            }
        }

        // File data
        for (&c, bytes) in &b.data {
            let at = cluster_offset(c);
            image[at..at + bytes.len()].copy_from_slice(bytes);
        }

        image
    }

    /// The volume behind an MBR whose first entry starts at `start_lba`
    pub fn build_partitioned(&self, start_lba: u32) -> Vec<u8> {
        let volume = self.build();
        let mut image = vec![0u8; start_lba as usize * SECTOR_SIZE];

        let entry = &mut image[446..462];
        entry[0] = 0x80;
        entry[4] = match self.flavor {
            Flavor::Fat16 => 0x06,
            Flavor::Fat32 => 0x0C,
        };
        entry[8..12].copy_from_slice(&start_lba.to_le_bytes());
        entry[12..16].copy_from_slice(&((volume.len() / SECTOR_SIZE) as u32).to_le_bytes());
        image[510] = 0x55;
        image[511] = 0xAA;

        image.extend_from_slice(&volume);
        image
    }
}
