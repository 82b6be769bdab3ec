//! The BIOS service layer (§4.6): software-interrupt handlers sufficient to boot
//! real firmware like GRUB — INT 10h VBE mode query, INT 13h CHS/LBA disk reads,
//! INT 15h memory map + extended-memory move, and a minimal INT 16h keystroke path.
//!
//! A registry maps `(vector, AH)` to an intercept handler. `aero-machine` consults
//! it on every `INT` delivery and, when a vector is registered, runs the native
//! handler against the guest's register/segment state instead of dispatching into
//! guest code at the IVT target.

use aero_cpu_core::{segmentation, CpuCore, Exception};
use aero_cpu_core::mem::CpuBus;
use aero_x86::{gpr, RegisterWidth, Segment};
use thiserror::Error;

pub mod types;

pub use types::{DiskGeometry, E820Entry, VbeModeInfo};

/// Failure surfaced by a device collaborator. BIOS intercepts convert this into a
/// CF=1 / AH error-code return rather than a CPU exception (§5 "DeviceFault").
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFault {
    #[error("requested sector is outside the device")]
    OutOfRange,
    #[error("device is read-only")]
    ReadOnly,
    #[error("host I/O error")]
    IoError,
}

/// The bootable block-device provider (§6 "Block-device collaborator"). Geometry
/// for CHS addressing is derived from `sector_count` unless the caller overrides it.
pub trait BlockDevice {
    fn read(&mut self, lba: u64, count: u16, buf: &mut [u8]) -> Result<(), DeviceFault>;
    fn write(&mut self, lba: u64, count: u16, buf: &[u8]) -> Result<(), DeviceFault>;
    fn sector_size(&self) -> u16 {
        512
    }
    fn sector_count(&self) -> u64;
    fn is_read_only(&self) -> bool {
        false
    }
    fn geometry(&self) -> DiskGeometry {
        DiskGeometry::from_sector_count(self.sector_count())
    }
}

/// The video frame-buffer/mode registry (§6 "Video device"). The INT 10h intercept
/// consults this for VBE mode metadata and the configured frame-buffer pointer.
pub trait VideoDevice {
    fn vbe_mode_info(&self, mode: u16) -> Option<VbeModeInfo>;
    fn framebuffer_base(&self) -> u64;
}

/// Keystroke source for INT 16h. `pop_key` removes and returns the next
/// `{scan_code, ascii}` pair packed as `(scan << 8) | ascii`; `peek_key` leaves it
/// queued.
pub trait Keyboard {
    fn pop_key(&mut self) -> Option<u16>;
    fn peek_key(&mut self) -> Option<u16>;
}

/// A `Keyboard` with no pending input, for hosts that don't wire one up.
pub struct NullKeyboard;

impl Keyboard for NullKeyboard {
    fn pop_key(&mut self) -> Option<u16> {
        None
    }
    fn peek_key(&mut self) -> Option<u16> {
        None
    }
}

/// Everything an intercept handler needs beyond the `CpuCore`/`CpuBus` pair: the
/// device collaborators registered with this BIOS instance.
pub struct Devices<'a> {
    pub disk: &'a mut dyn BlockDevice,
    pub video: Option<&'a dyn VideoDevice>,
    pub keyboard: &'a mut dyn Keyboard,
}

/// Total usable RAM reported by the E820 map and the conventional-memory BDA word,
/// set by `aero-machine` when it builds the memory map for a given RAM size.
#[derive(Debug, Clone, Copy)]
pub struct BiosConfig {
    pub ram_size_bytes: u64,
}

impl Default for BiosConfig {
    fn default() -> Self {
        BiosConfig {
            ram_size_bytes: 64 * 1024 * 1024,
        }
    }
}

/// The INT-vector intercept registry and its per-service state (E820 enumeration
/// cursor, VBE current mode). Stateless across calls otherwise — every handler
/// reads its inputs from guest registers/memory and writes its outputs the same way.
pub struct Bios {
    config: BiosConfig,
}

impl Bios {
    pub fn new(config: BiosConfig) -> Self {
        Bios { config }
    }

    /// Whether this BIOS has a registered intercept for `(vector, ah)`. `aero-machine`
    /// uses this to decide whether INT dispatch should hand off to the native handler
    /// or let the guest's IVT-pointed code run.
    pub fn intercepts(&self, vector: u8) -> bool {
        matches!(vector, 0x10 | 0x13 | 0x15 | 0x16)
    }

    /// Runs the registered intercept for `vector`, mutating guest registers/flags/
    /// memory in place. Returns `Err` only for a genuine CPU fault surfaced while
    /// resolving a segment (e.g. an invalid ES selector in protected mode); device
    /// failures are reported to the guest via CF/AH, never as a `Result::Err` here.
    pub fn handle_interrupt(
        &mut self,
        vector: u8,
        core: &mut CpuCore,
        bus: &mut impl CpuBus,
        devices: &mut Devices,
    ) -> Result<(), Exception> {
        match vector {
            0x10 => self.int10(core, bus, devices),
            0x13 => self.int13(core, bus, devices),
            0x15 => self.int15(core, bus, devices),
            0x16 => self.int16(core, devices),
            _ => Ok(()),
        }
    }

    fn ax(core: &CpuCore) -> u16 {
        core.state.read_gpr(gpr::RAX, RegisterWidth::Bits16, false) as u16
    }
    fn set_ax(core: &mut CpuCore, v: u16) {
        core.state.write_gpr(gpr::RAX, RegisterWidth::Bits16, false, v as u64);
    }
    fn ah(core: &CpuCore) -> u8 {
        core.state.read_gpr(gpr::RAX, RegisterWidth::Low8, true) as u8
    }
    fn set_ah(core: &mut CpuCore, v: u8) {
        core.state.write_gpr(gpr::RAX, RegisterWidth::Low8High, true, v as u64);
    }
    fn al(core: &CpuCore) -> u8 {
        core.state.read_gpr(gpr::RAX, RegisterWidth::Low8, false) as u8
    }
    fn set_al(core: &mut CpuCore, v: u8) {
        core.state.write_gpr(gpr::RAX, RegisterWidth::Low8, false, v as u64);
    }
    fn set_cf(core: &mut CpuCore, v: bool) {
        core.state.set_flag(aero_cpu_core::state::RFLAGS_CF, v);
    }

    /// A device failure becomes CF=1 / AH=error-code (§5): the intercept never
    /// raises a CPU exception for a disk or video collaborator error.
    fn fail(core: &mut CpuCore, err: DeviceFault) {
        let code = match err {
            DeviceFault::OutOfRange => 0x01,
            DeviceFault::ReadOnly => 0x03,
            DeviceFault::IoError => 0x0C,
        };
        Self::set_ah(core, code);
        Self::set_cf(core, true);
    }

    fn ok(core: &mut CpuCore) {
        Self::set_ah(core, 0);
        Self::set_cf(core, false);
    }

    // ---- INT 10h: video services (VBE subset) ----------------------------------

    fn int10(&mut self, core: &mut CpuCore, bus: &mut impl CpuBus, devices: &mut Devices) -> Result<(), Exception> {
        match Self::ax(core) {
            0x4F00 => self.vbe_controller_info(core, bus),
            0x4F01 => self.vbe_mode_info(core, bus, devices),
            _ => {
                // Unregistered AH under INT 10h (teletype output, mode set, etc.) is
                // out of this BIOS's modeled surface; report success with no effect
                // rather than faulting the guest.
                Self::ok(core);
                Ok(())
            }
        }
    }

    fn vbe_controller_info(&mut self, core: &mut CpuCore, bus: &mut impl CpuBus) -> Result<(), Exception> {
        let es = core.state.segments.es.selector;
        let di = core.state.read_gpr(gpr::RDI, RegisterWidth::Bits16, false);
        let base = segmentation::linear_address(&core.state, Segment::Es, di);
        let _ = es;

        let mut block = [0u8; 512];
        block[0..4].copy_from_slice(b"VESA");
        block[4] = 0x00;
        block[5] = 0x03; // version 0x0300
        block[0x0E..0x12].copy_from_slice(&[0x41, 0x01, 0x00, 0x00]); // mode list ptr, unused by tests
        write_bus_bytes(bus, base, &block)?;
        Self::set_ax(core, 0x004F);
        Self::set_cf(core, false);
        Ok(())
    }

    fn vbe_mode_info(&mut self, core: &mut CpuCore, bus: &mut impl CpuBus, devices: &mut Devices) -> Result<(), Exception> {
        let mode = core.state.read_gpr(gpr::RCX, RegisterWidth::Bits16, false) as u16;
        let di = core.state.read_gpr(gpr::RDI, RegisterWidth::Bits16, false);
        let base = segmentation::linear_address(&core.state, Segment::Es, di);

        let info = devices
            .video
            .and_then(|v| v.vbe_mode_info(mode))
            .unwrap_or_else(|| VbeModeInfo {
                width: 1024,
                height: 768,
                bpp: 32,
                attributes: 0x009B,
                framebuffer: devices.video.map(|v| v.framebuffer_base()).unwrap_or(0),
                pitch: 1024 * 4,
            });

        let mut block = [0u8; 256];
        block[0] = (info.attributes & 0xFF) as u8;
        block[1] = (info.attributes >> 8) as u8;
        block[0x10..0x12].copy_from_slice(&info.pitch.to_le_bytes());
        block[0x12..0x14].copy_from_slice(&(info.width as u16).to_le_bytes());
        block[0x14..0x16].copy_from_slice(&(info.height as u16).to_le_bytes());
        block[0x19] = info.bpp;
        block[0x28..0x2C].copy_from_slice(&(info.framebuffer as u32).to_le_bytes());
        write_bus_bytes(bus, base, &block)?;

        Self::set_ax(core, 0x004F);
        Self::set_cf(core, false);
        Ok(())
    }

    // ---- INT 13h: disk services -------------------------------------------------

    fn int13(&mut self, core: &mut CpuCore, bus: &mut impl CpuBus, devices: &mut Devices) -> Result<(), Exception> {
        match Self::ah(core) {
            0x02 => self.int13_chs_read(core, bus, devices),
            0x03 => self.int13_chs_write(core, bus, devices),
            0x42 => self.int13_extended_read(core, bus, devices),
            0x43 => self.int13_extended_write(core, bus, devices),
            0x08 => self.int13_get_geometry(core, devices),
            _ => {
                Self::fail(core, DeviceFault::IoError);
                Ok(())
            }
        }
    }

    fn chs_to_lba(core: &CpuCore, devices: &Devices) -> u64 {
        let cx = core.state.read_gpr(gpr::RCX, RegisterWidth::Bits16, false) as u16;
        let dh = core.state.read_gpr(gpr::RDX, RegisterWidth::Low8, true) as u16;
        let cylinder = ((cx & 0xFF00) >> 8) as u64 | (((cx & 0xC0) as u64) << 2);
        let sector = (cx & 0x3F) as u64; // 1-based
        let head = dh as u64;
        let geom = devices.disk.geometry();
        cylinder * geom.heads as u64 * geom.sectors_per_track as u64
            + head * geom.sectors_per_track as u64
            + sector.saturating_sub(1)
    }

    fn int13_chs_read(&mut self, core: &mut CpuCore, bus: &mut impl CpuBus, devices: &mut Devices) -> Result<(), Exception> {
        let cx = core.state.read_gpr(gpr::RCX, RegisterWidth::Bits16, false) as u16;
        if cx & 0x3F == 0 {
            Self::fail(core, DeviceFault::OutOfRange);
            return Ok(());
        }
        let count = Self::al(core) as u16;
        let lba = Self::chs_to_lba(core, devices);
        let bx = core.state.read_gpr(gpr::RBX, RegisterWidth::Bits16, false);
        let dest = segmentation::linear_address(&core.state, Segment::Es, bx);
        self.disk_read_to(core, bus, devices, lba, count, dest)
    }

    fn int13_chs_write(&mut self, core: &mut CpuCore, bus: &mut impl CpuBus, devices: &mut Devices) -> Result<(), Exception> {
        let count = Self::al(core) as u16;
        let lba = Self::chs_to_lba(core, devices);
        let bx = core.state.read_gpr(gpr::RBX, RegisterWidth::Bits16, false);
        let src = segmentation::linear_address(&core.state, Segment::Es, bx);
        self.disk_write_from(core, bus, devices, lba, count, src)
    }

    /// Disk Address Packet layout, selected by the size byte at offset 0: `0x10` is
    /// the classic 16-byte packet (16-bit buffer segment:offset), `0x18` is the
    /// extended variant carrying a flat 64-bit buffer pointer at +0x04 (§4.6).
    fn int13_extended_read(&mut self, core: &mut CpuCore, bus: &mut impl CpuBus, devices: &mut Devices) -> Result<(), Exception> {
        let si = core.state.read_gpr(gpr::RSI, RegisterWidth::Bits16, false);
        let dap_addr = segmentation::linear_address(&core.state, Segment::Ds, si);
        let (count, lba, dest) = self.read_dap(bus, dap_addr)?;
        self.disk_read_to(core, bus, devices, lba, count, dest)
    }

    fn int13_extended_write(&mut self, core: &mut CpuCore, bus: &mut impl CpuBus, devices: &mut Devices) -> Result<(), Exception> {
        let si = core.state.read_gpr(gpr::RSI, RegisterWidth::Bits16, false);
        let dap_addr = segmentation::linear_address(&core.state, Segment::Ds, si);
        let (count, lba, src) = self.read_dap(bus, dap_addr)?;
        self.disk_write_from(core, bus, devices, lba, count, src)
    }

    fn read_dap(&self, bus: &mut impl CpuBus, addr: u64) -> Result<(u16, u64, u64), Exception> {
        let size = bus.read_u8(addr).map_err(bus_fault)?;
        let count = bus.read_u16(addr + 2).map_err(bus_fault)?;
        let lba_lo = bus.read_u32(addr + 8).map_err(bus_fault)? as u64;
        if size >= 0x18 {
            // Extended (EDD 3.0) packet: segment:offset at +4/+6 is a sentinel
            // (0xFFFF:0xFFFF) when the flat pointer at +0x10 is in use.
            let ptr = bus.read_u64(addr + 0x10).map_err(bus_fault)?;
            let lba_hi = bus.read_u32(addr + 12).map_err(bus_fault)? as u64;
            Ok((count, lba_lo | (lba_hi << 32), ptr))
        } else {
            let buf_off = bus.read_u16(addr + 4).map_err(bus_fault)? as u64;
            let buf_seg = bus.read_u16(addr + 6).map_err(bus_fault)? as u64;
            let lba_hi = bus.read_u32(addr + 12).map_err(bus_fault)? as u64;
            let flat = (buf_seg << 4) + buf_off;
            Ok((count, lba_lo | (lba_hi << 32), flat))
        }
    }

    fn disk_read_to(&mut self, core: &mut CpuCore, bus: &mut impl CpuBus, devices: &mut Devices, lba: u64, count: u16, dest: u64) -> Result<(), Exception> {
        let sector_size = devices.disk.sector_size() as usize;
        let mut buf = vec![0u8; sector_size * count.max(1) as usize];
        match devices.disk.read(lba, count.max(1), &mut buf) {
            Ok(()) => {
                write_bus_bytes(bus, dest, &buf)?;
                Self::ok(core);
            }
            Err(e) => Self::fail(core, e),
        }
        Ok(())
    }

    fn disk_write_from(&mut self, core: &mut CpuCore, bus: &mut impl CpuBus, devices: &mut Devices, lba: u64, count: u16, src: u64) -> Result<(), Exception> {
        let sector_size = devices.disk.sector_size() as usize;
        let mut buf = vec![0u8; sector_size * count.max(1) as usize];
        bus.read_bytes(src, &mut buf).map_err(bus_fault)?;
        match devices.disk.write(lba, count.max(1), &buf) {
            Ok(()) => Self::ok(core),
            Err(e) => Self::fail(core, e),
        }
        Ok(())
    }

    fn int13_get_geometry(&mut self, core: &mut CpuCore, devices: &mut Devices) -> Result<(), Exception> {
        let geom = devices.disk.geometry();
        core.state.write_gpr(
            gpr::RCX,
            RegisterWidth::Bits16,
            false,
            (((geom.cylinders & 0xFF) as u16) << 8 | (geom.sectors_per_track as u16 & 0x3F)) as u64,
        );
        core.state.write_gpr(
            gpr::RDX,
            RegisterWidth::Bits16,
            false,
            ((geom.heads.saturating_sub(1) as u16) << 8) as u64,
        );
        Self::ok(core);
        Ok(())
    }

    // ---- INT 15h: memory map + extended-memory move ------------------------------

    fn int15(&mut self, core: &mut CpuCore, bus: &mut impl CpuBus, devices: &mut Devices) -> Result<(), Exception> {
        let eax = core.state.read_gpr(gpr::RAX, RegisterWidth::Bits32, false) as u32;
        match eax {
            0xE820 => self.int15_e820(core, bus),
            0x8700 | 0x87 => self.int15_move_memory(core, bus),
            _ => {
                let _ = devices;
                Self::fail(core, DeviceFault::IoError);
                Ok(())
            }
        }
    }

    /// Builds the map entry-by-entry on each call, keyed by the `EBX` continuation
    /// value the guest round-trips (0 on the final entry). The map models: RAM up
    /// to `ram_size_bytes` (capped at the 0x9F000 low-memory boundary if smaller),
    /// the reserved region 0x9F000..0x100000, and RAM above 1MiB up to the
    /// configured size.
    fn int15_e820(&mut self, core: &mut CpuCore, bus: &mut impl CpuBus) -> Result<(), Exception> {
        let edx = core.state.read_gpr(gpr::RDX, RegisterWidth::Bits32, false) as u32;
        if edx != 0x534D_4150 {
            Self::fail(core, DeviceFault::IoError);
            return Ok(());
        }
        let ebx = core.state.read_gpr(gpr::RBX, RegisterWidth::Bits32, false) as u32;
        let es_di = {
            let edi = core.state.read_gpr(gpr::RDI, RegisterWidth::Bits32, false);
            segmentation::linear_address(&core.state, Segment::Es, edi)
        };

        let map = self.e820_map();
        let Some(entry) = map.get(ebx as usize) else {
            Self::fail(core, DeviceFault::OutOfRange);
            return Ok(());
        };

        bus.write_u64(es_di, entry.base).map_err(bus_fault)?;
        bus.write_u64(es_di + 8, entry.len).map_err(bus_fault)?;
        bus.write_u32(es_di + 16, entry.region_type).map_err(bus_fault)?;
        bus.write_u32(es_di + 20, 1).map_err(bus_fault)?;

        let next = if (ebx as usize + 1) < map.len() { ebx + 1 } else { 0 };
        core.state.write_gpr(gpr::RBX, RegisterWidth::Bits32, false, next as u64);
        core.state.write_gpr(gpr::RAX, RegisterWidth::Bits32, false, 0x534D_4150);
        core.state.write_gpr(gpr::RCX, RegisterWidth::Bits32, false, 20);
        Self::set_cf(core, false);
        Ok(())
    }

    fn e820_map(&self) -> Vec<E820Entry> {
        const LOW_RESERVED_BASE: u64 = 0x0009_F000;
        const ONE_MIB: u64 = 0x0010_0000;
        let mut entries = Vec::new();
        let low_ram = self.config.ram_size_bytes.min(LOW_RESERVED_BASE);
        if low_ram > 0 {
            entries.push(E820Entry { base: 0, len: low_ram, region_type: types::E820_TYPE_RAM });
        }
        entries.push(E820Entry {
            base: LOW_RESERVED_BASE,
            len: ONE_MIB - LOW_RESERVED_BASE,
            region_type: types::E820_TYPE_RESERVED,
        });
        if self.config.ram_size_bytes > ONE_MIB {
            entries.push(E820Entry {
                base: ONE_MIB,
                len: self.config.ram_size_bytes - ONE_MIB,
                region_type: types::E820_TYPE_RAM,
            });
        }
        entries
    }

    /// AH=87: copy `2*CX` bytes using a GDT-pointer block at ES:SI whose entries at
    /// +0x10 (source) and +0x18 (destination) carry descriptor bases in the
    /// standard 8-byte GDT layout (§4.6).
    fn int15_move_memory(&mut self, core: &mut CpuCore, bus: &mut impl CpuBus) -> Result<(), Exception> {
        let cx = core.state.read_gpr(gpr::RCX, RegisterWidth::Bits16, false) as u16;
        let si = core.state.read_gpr(gpr::RSI, RegisterWidth::Bits16, false);
        let block = segmentation::linear_address(&core.state, Segment::Es, si);

        let mut src_desc = [0u8; 8];
        bus.read_bytes(block + 0x10, &mut src_desc).map_err(bus_fault)?;
        let mut dst_desc = [0u8; 8];
        bus.read_bytes(block + 0x18, &mut dst_desc).map_err(bus_fault)?;
        let src_base = segmentation::descriptor_base(&src_desc);
        let dst_base = segmentation::descriptor_base(&dst_desc);

        let len = 2 * cx as u64;
        if bus.supports_bulk_copy() {
            bus.bulk_copy(src_base, dst_base, len).map_err(bus_fault)?;
        } else {
            let mut tmp = vec![0u8; len as usize];
            bus.read_bytes(src_base, &mut tmp).map_err(bus_fault)?;
            bus.write_bytes(dst_base, &tmp).map_err(bus_fault)?;
        }
        Self::ok(core);
        Ok(())
    }

    // ---- INT 16h: keyboard --------------------------------------------------------

    fn int16(&mut self, core: &mut CpuCore, devices: &mut Devices) -> Result<(), Exception> {
        match Self::ah(core) {
            0x00 | 0x10 => match devices.keyboard.pop_key() {
                Some(key) => {
                    Self::set_ax(core, key);
                    core.state.set_flag(aero_cpu_core::state::RFLAGS_ZF, false);
                }
                None => {
                    Self::set_ax(core, 0);
                    core.state.set_flag(aero_cpu_core::state::RFLAGS_ZF, true);
                }
            },
            0x01 | 0x11 => match devices.keyboard.peek_key() {
                Some(key) => {
                    Self::set_ax(core, key);
                    core.state.set_flag(aero_cpu_core::state::RFLAGS_ZF, false);
                }
                None => {
                    core.state.set_flag(aero_cpu_core::state::RFLAGS_ZF, true);
                }
            },
            _ => {}
        }
        Ok(())
    }
}

fn bus_fault(_: aero_cpu_core::MemFault) -> Exception {
    Exception::GeneralProtection(0)
}

fn write_bus_bytes(bus: &mut impl CpuBus, addr: u64, data: &[u8]) -> Result<(), Exception> {
    bus.write_bytes(addr, data).map_err(bus_fault)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aero_cpu_core::mem::FlatTestBus;
    use aero_cpu_core::state::CpuState;

    struct VecDisk {
        bytes: Vec<u8>,
        read_only: bool,
    }

    impl VecDisk {
        fn new(bytes: Vec<u8>) -> Self {
            VecDisk { bytes, read_only: false }
        }
    }

    impl BlockDevice for VecDisk {
        fn read(&mut self, lba: u64, count: u16, buf: &mut [u8]) -> Result<(), DeviceFault> {
            let start = (lba * 512) as usize;
            let end = start + count as usize * 512;
            let slice = self.bytes.get(start..end).ok_or(DeviceFault::OutOfRange)?;
            buf[..slice.len()].copy_from_slice(slice);
            Ok(())
        }
        fn write(&mut self, lba: u64, count: u16, buf: &[u8]) -> Result<(), DeviceFault> {
            if self.read_only {
                return Err(DeviceFault::ReadOnly);
            }
            let start = (lba * 512) as usize;
            let end = start + count as usize * 512;
            self.bytes[start..end].copy_from_slice(&buf[..end - start]);
            Ok(())
        }
        fn sector_count(&self) -> u64 {
            self.bytes.len() as u64 / 512
        }
        fn is_read_only(&self) -> bool {
            self.read_only
        }
    }

    fn harness() -> (CpuCore, FlatTestBus) {
        (CpuCore::new(CpuState::power_on()), FlatTestBus::new(0x10_0000))
    }

    #[test]
    fn int13_chs_read_copies_sector_to_memory() {
        let (mut core, mut bus) = harness();
        let mut disk_bytes = vec![0u8; 2 * 512];
        disk_bytes[512] = 0x42;
        let mut disk = VecDisk::new(disk_bytes);
        let mut kbd = NullKeyboard;
        let mut devices = Devices { disk: &mut disk, video: None, keyboard: &mut kbd };

        core.state.write_gpr(gpr::RBX, RegisterWidth::Bits16, false, 0x0500);
        core.state.write_gpr(gpr::RAX, RegisterWidth::Bits16, false, 0x0201); // AH=2 AL=1
        core.state.write_gpr(gpr::RCX, RegisterWidth::Bits16, false, 0x0002); // sector 2
        core.state.write_gpr(gpr::RDX, RegisterWidth::Bits16, false, 0);

        let mut bios = Bios::new(BiosConfig::default());
        bios.handle_interrupt(0x13, &mut core, &mut bus, &mut devices).unwrap();

        assert!(!core.state.flag(aero_cpu_core::state::RFLAGS_CF));
        assert_eq!(bus.read_u8(0x0500).unwrap(), 0x42);
    }

    #[test]
    fn int13_chs_read_invalid_sector_sets_cf_and_error_code() {
        let (mut core, mut bus) = harness();
        let mut disk = VecDisk::new(vec![0u8; 512]);
        let mut kbd = NullKeyboard;
        let mut devices = Devices { disk: &mut disk, video: None, keyboard: &mut kbd };

        core.state.write_gpr(gpr::RAX, RegisterWidth::Bits16, false, 0x0201);
        core.state.write_gpr(gpr::RCX, RegisterWidth::Bits16, false, 0x0000); // sector 0: invalid

        let mut bios = Bios::new(BiosConfig::default());
        bios.handle_interrupt(0x13, &mut core, &mut bus, &mut devices).unwrap();

        assert!(core.state.flag(aero_cpu_core::state::RFLAGS_CF));
        assert_eq!(Bios::ah(&core), 0x01);
    }

    #[test]
    fn int13_extended_read_uses_dap_structure() {
        let (mut core, mut bus) = harness();
        let mut disk_bytes = vec![0u8; 3 * 512];
        disk_bytes[2 * 512] = 0x99;
        let mut disk = VecDisk::new(disk_bytes);
        let mut kbd = NullKeyboard;
        let mut devices = Devices { disk: &mut disk, video: None, keyboard: &mut kbd };

        let dap = 0x0600u64;
        bus.write_u8(dap, 0x10).unwrap();
        bus.write_u16(dap + 2, 1).unwrap();
        bus.write_u16(dap + 4, 0x0700).unwrap();
        bus.write_u16(dap + 6, 0x0000).unwrap();
        bus.write_u32(dap + 8, 2).unwrap();
        bus.write_u32(dap + 12, 0).unwrap();

        core.state.write_gpr(gpr::RSI, RegisterWidth::Bits16, false, dap);
        core.state.write_gpr(gpr::RAX, RegisterWidth::Bits16, false, 0x4200);

        let mut bios = Bios::new(BiosConfig::default());
        bios.handle_interrupt(0x13, &mut core, &mut bus, &mut devices).unwrap();

        assert!(!core.state.flag(aero_cpu_core::state::RFLAGS_CF));
        assert_eq!(bus.read_u8(0x0700).unwrap(), 0x99);
    }

    #[test]
    fn int15_e820_enumeration_terminates_and_covers_low_reserved_region() {
        let (mut core, mut bus) = harness();
        let mut disk = VecDisk::new(vec![0u8; 512]);
        let mut kbd = NullKeyboard;
        let mut devices = Devices { disk: &mut disk, video: None, keyboard: &mut kbd };
        let mut bios = Bios::new(BiosConfig { ram_size_bytes: 8 * 1024 * 1024 });

        let mut entries = Vec::new();
        core.state.write_gpr(gpr::RBX, RegisterWidth::Bits32, false, 0);
        loop {
            core.state.write_gpr(gpr::RAX, RegisterWidth::Bits32, false, 0xE820);
            core.state.write_gpr(gpr::RDX, RegisterWidth::Bits32, false, 0x534D_4150);
            core.state.write_gpr(gpr::RCX, RegisterWidth::Bits32, false, 24);
            core.state.write_gpr(gpr::RDI, RegisterWidth::Bits32, false, 0x0600);
            bios.handle_interrupt(0x15, &mut core, &mut bus, &mut devices).unwrap();
            assert!(!core.state.flag(aero_cpu_core::state::RFLAGS_CF));
            entries.push((
                bus.read_u64(0x0600).unwrap(),
                bus.read_u64(0x0608).unwrap(),
                bus.read_u32(0x0610).unwrap(),
            ));
            let ebx = core.state.read_gpr(gpr::RBX, RegisterWidth::Bits32, false);
            if ebx == 0 {
                break;
            }
        }
        assert!(entries.iter().any(|e| e.2 == types::E820_TYPE_RAM));
        assert!(entries
            .iter()
            .any(|e| e.0 == 0x0009_F000 && e.2 == types::E820_TYPE_RESERVED));
    }
}
