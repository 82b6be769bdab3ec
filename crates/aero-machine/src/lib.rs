//! Wires a [`CpuCore`], a [`Bios`], and guest RAM together into the single-threaded
//! fetch-decode-execute loop described by §4.7/§5: one `step()` per turn, BIOS
//! intercepts consulted before a software interrupt is delivered to the guest's own
//! IVT/IDT target, and a bounded `run_slice` the CLI and tests drive directly.
//!
//! This crate owns the boot-sector loader (§6 "Boot input") and the device
//! collaborators the BIOS layer needs (`BlockDevice`, `VideoDevice`, `Keyboard`);
//! it does not implement any device beyond the register/byte contracts §6 specifies
//! as out of scope (no VGA framebuffer renderer, no real UART line-status state
//! machine).

use aero_bios::{Bios, BiosConfig, BlockDevice, DeviceFault, Devices, DiskGeometry, NullKeyboard};
use aero_cpu_core::mem::{CpuBus, MemFault};
use aero_cpu_core::segmentation::{self, LoadReason};
use aero_cpu_core::state::{CpuState, CR0_PE, CR4_PAE, EFER_LMA, EFER_LME};
use aero_cpu_core::{step, CpuCore, Exception, StepExit};
use aero_mmu::{FlatRam, MemoryBus};
use aero_x86::Segment;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Linear address real firmware places the first boot-sector load at (§6).
pub const BOOT_SECTOR_LOAD_ADDR: u64 = 0x7C00;
const BOOT_SECTOR_LEN: usize = 512;
/// Legacy COM1 transmit-holding register. The CLI's `--serial-out` flag drains
/// whatever guest code writes here; there is no line-status/FIFO state machine
/// behind it; writes are accepted unconditionally (§1 "MMIO devices beyond their
/// register contracts" is out of scope).
const COM1_PORT: u16 = 0x3F8;

/// `--mode` from §6 "CLI surface": the mode the CPU is placed in before the boot
/// sector's first instruction runs, for fixtures that want to start past real mode
/// rather than exercise the mode transition themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BootMode {
    #[default]
    Real16,
    Protected32,
    Long64,
}

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("boot image is {0} bytes, shorter than the {BOOT_SECTOR_LEN}-byte boot sector")]
    ImageTooShortForBootSector(usize),
    #[error("boot image ({image_len} bytes) does not fit in {ram_len}-byte RAM at {BOOT_SECTOR_LOAD_ADDR:#x}")]
    ImageExceedsRam { image_len: usize, ram_len: usize },
    #[error("no disk image attached")]
    NoDiskImage,
    #[error("requested RAM size {0} is smaller than the minimum usable size")]
    RamTooSmall(u64),
    #[error("fault while installing the {0:?} boot-mode test-fixture GDT: {1}")]
    BootSetupFault(BootMode, Exception),
}

pub struct MachineConfig {
    pub ram_size_bytes: u64,
    pub a20_enabled: bool,
    pub boot_mode: BootMode,
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            ram_size_bytes: 64 * 1024 * 1024,
            a20_enabled: false,
            boot_mode: BootMode::Real16,
        }
    }
}

/// Outcome of a bounded `run_slice` call, distinguishing "ran out of budget" (not a
/// failure — the CLI and fixtures use it to bound otherwise-infinite boot loops)
/// from a halt or an unhandled fault.
#[derive(Debug)]
pub enum RunExit {
    /// The instruction budget was exhausted with the core still runnable.
    InstructionLimit { executed: u64 },
    /// HLT executed with no pending event able to wake the core.
    Halted { executed: u64 },
    /// An exception reached the execution loop with nowhere left to vector (a
    /// double-fault in spec terms, §7): emulation stops and the fault is reported.
    Faulted { exception: Exception, executed: u64 },
}

/// A flat `Vec<u8>`-backed disk: the default stub for `BlockDevice` (§6), good
/// enough to back a file read wholesale into memory by the CLI.
pub struct VecBlockDevice {
    bytes: Vec<u8>,
    sector_size: u16,
    read_only: bool,
}

impl VecBlockDevice {
    pub fn new(bytes: Vec<u8>) -> Self {
        VecBlockDevice { bytes, sector_size: 512, read_only: true }
    }

    pub fn boot_sector(&self) -> Result<&[u8; BOOT_SECTOR_LEN], MachineError> {
        self.bytes
            .get(..BOOT_SECTOR_LEN)
            .and_then(|s| s.try_into().ok())
            .ok_or(MachineError::ImageTooShortForBootSector(self.bytes.len()))
    }
}

impl BlockDevice for VecBlockDevice {
    fn read(&mut self, lba: u64, count: u16, buf: &mut [u8]) -> Result<(), DeviceFault> {
        let start = (lba as usize).saturating_mul(self.sector_size as usize);
        let end = start + count as usize * self.sector_size as usize;
        let slice = self.bytes.get(start..end).ok_or(DeviceFault::OutOfRange)?;
        buf[..slice.len()].copy_from_slice(slice);
        Ok(())
    }

    fn write(&mut self, lba: u64, count: u16, buf: &[u8]) -> Result<(), DeviceFault> {
        if self.read_only {
            return Err(DeviceFault::ReadOnly);
        }
        let start = (lba as usize).saturating_mul(self.sector_size as usize);
        let end = start + count as usize * self.sector_size as usize;
        let dest = self.bytes.get_mut(start..end).ok_or(DeviceFault::OutOfRange)?;
        dest.copy_from_slice(&buf[..dest.len()]);
        Ok(())
    }

    fn sector_size(&self) -> u16 {
        self.sector_size
    }

    fn sector_count(&self) -> u64 {
        self.bytes.len() as u64 / self.sector_size as u64
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn geometry(&self) -> DiskGeometry {
        DiskGeometry::from_sector_count(self.sector_count())
    }
}

/// The guest-physical memory bus: flat RAM plus the one port BIOS/test fixtures use
/// as a debug/serial sink. Bulk-copy/bulk-set are implemented directly against the
/// backing `Vec<u8>` (§ supplemental "CpuBus trait surface" in SPEC_FULL.md).
struct MachineBus {
    ram: FlatRam,
    serial_out: Vec<u8>,
}

impl MachineBus {
    fn new(ram_size_bytes: usize) -> Self {
        MachineBus { ram: FlatRam::new(ram_size_bytes), serial_out: Vec::new() }
    }
}

macro_rules! bus_rw {
    ($read:ident, $write:ident, $ty:ty) => {
        fn $read(&mut self, linear: u64) -> Result<$ty, MemFault> {
            Ok(MemoryBus::$read(&mut self.ram, linear))
        }
        fn $write(&mut self, linear: u64, value: $ty) -> Result<(), MemFault> {
            MemoryBus::$write(&mut self.ram, linear, value);
            Ok(())
        }
    };
}

impl CpuBus for MachineBus {
    bus_rw!(read_u8, write_u8, u8);
    bus_rw!(read_u16, write_u16, u16);
    bus_rw!(read_u32, write_u32, u32);
    bus_rw!(read_u64, write_u64, u64);

    fn read_bytes(&mut self, linear: u64, buf: &mut [u8]) -> Result<(), MemFault> {
        self.ram.read_bytes(linear, buf).map_err(Into::into)
    }

    fn write_bytes(&mut self, linear: u64, data: &[u8]) -> Result<(), MemFault> {
        self.ram.write_bytes(linear, data).map_err(Into::into)
    }

    fn io_write_u8(&mut self, port: u16, value: u8) {
        if port == COM1_PORT {
            self.serial_out.push(value);
        }
    }

    fn supports_bulk_copy(&self) -> bool {
        true
    }
    fn bulk_copy(&mut self, src: u64, dst: u64, len: u64) -> Result<(), MemFault> {
        let mut tmp = vec![0u8; len as usize];
        self.ram.read_bytes(src, &mut tmp)?;
        self.ram.write_bytes(dst, &tmp)?;
        Ok(())
    }

    fn supports_bulk_set(&self) -> bool {
        true
    }
    fn bulk_set(&mut self, dst: u64, value: u8, len: u64) -> Result<(), MemFault> {
        let tmp = vec![value; len as usize];
        self.ram.write_bytes(dst, &tmp)?;
        Ok(())
    }
}

/// A minimal flat GDT used to stand up `Protected32`/`Long64` boot modes for test
/// fixtures (§6 "optional flags for test fixtures"): null, a flat 4GiB code/data
/// pair, and (for long mode) a 64-bit code descriptor with L=1.
fn install_flat_gdt(bus: &mut MachineBus, gdt_base: u64, long_mode: bool) -> [u16; 3] {
    let null = [0u8; 8];
    // Base=0, limit=0xFFFFF (granular => 4GiB), access=present|S|exec|rw, flags D/B=1.
    let code32 = descriptor(0, 0xFFFFF, 0x9A, 0xC);
    let data32 = descriptor(0, 0xFFFFF, 0x92, 0xC);
    let code64 = descriptor(0, 0xFFFFF, 0x9A, 0xA); // L=1, D=0 (flags nibble 0b1010)
    bus.write_bytes(gdt_base, &null).unwrap();
    bus.write_bytes(gdt_base + 8, &(if long_mode { code64 } else { code32 })).unwrap();
    bus.write_bytes(gdt_base + 16, &data32).unwrap();
    [0x00, 0x08, 0x10]
}

fn descriptor(base: u32, limit20: u32, access: u8, flags_nibble: u8) -> [u8; 8] {
    let mut raw = [0u8; 8];
    raw[0] = (limit20 & 0xFF) as u8;
    raw[1] = ((limit20 >> 8) & 0xFF) as u8;
    raw[2] = (base & 0xFF) as u8;
    raw[3] = ((base >> 8) & 0xFF) as u8;
    raw[4] = ((base >> 16) & 0xFF) as u8;
    raw[5] = access;
    raw[6] = (flags_nibble << 4) | (((limit20 >> 16) & 0xF) as u8);
    raw[7] = ((base >> 24) & 0xFF) as u8;
    raw
}

/// Wires a CPU core, the BIOS intercept layer, and one attached disk into the
/// single-threaded fetch loop (§5, §4.7).
pub struct Machine {
    core: CpuCore,
    bus: MachineBus,
    bios: Bios,
    disk: Option<VecBlockDevice>,
    keyboard: NullKeyboard,
    config: MachineConfig,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Result<Self, MachineError> {
        if config.ram_size_bytes < BOOT_SECTOR_LOAD_ADDR + BOOT_SECTOR_LEN as u64 {
            return Err(MachineError::RamTooSmall(config.ram_size_bytes));
        }
        let bus = MachineBus::new(config.ram_size_bytes as usize);
        let bios = Bios::new(BiosConfig { ram_size_bytes: config.ram_size_bytes });
        Ok(Machine {
            core: CpuCore::new(CpuState::power_on()),
            bus,
            bios,
            disk: None,
            keyboard: NullKeyboard,
            config,
        })
    }

    pub fn set_disk_image(&mut self, bytes: Vec<u8>) -> Result<(), MachineError> {
        let disk = VecBlockDevice::new(bytes);
        disk.boot_sector()?;
        self.disk = Some(disk);
        Ok(())
    }

    /// Loads the boot sector at `0x7C00` and places the core in `config.boot_mode`
    /// (§6 "Boot input": CS=0, IP=0x7C00, real mode, A20 disabled, at power-on; the
    /// CLI's `--mode`/`--a20` flags adjust the starting point for fixtures that want
    /// to skip the mode transition itself).
    pub fn reset(&mut self) -> Result<(), MachineError> {
        let disk = self.disk.as_ref().ok_or(MachineError::NoDiskImage)?;
        let boot_sector = *disk.boot_sector()?;
        if (BOOT_SECTOR_LOAD_ADDR as usize + BOOT_SECTOR_LEN) > self.config.ram_size_bytes as usize {
            return Err(MachineError::ImageExceedsRam {
                image_len: BOOT_SECTOR_LEN,
                ram_len: self.config.ram_size_bytes as usize,
            });
        }

        self.core = CpuCore::new(CpuState::power_on());
        self.core.state.a20_enabled = self.config.a20_enabled;
        self.bus
            .write_bytes(BOOT_SECTOR_LOAD_ADDR, &boot_sector)
            .expect("boot sector fits within configured RAM");

        let mode = self.config.boot_mode;
        let fault = |e: Exception| MachineError::BootSetupFault(mode, e);
        match mode {
            BootMode::Real16 => {
                segmentation::load_segment_for(&mut self.core.state, &mut self.bus, Segment::Cs, 0, LoadReason::CodeSegment)
                    .expect("real-mode CS load cannot fault");
                self.core.state.set_rip(BOOT_SECTOR_LOAD_ADDR);
            }
            BootMode::Protected32 => {
                const GDT_BASE: u64 = 0x0000_0800;
                let sel = install_flat_gdt(&mut self.bus, GDT_BASE, false);
                self.core.state.gdtr.base = GDT_BASE;
                self.core.state.gdtr.limit = 23;
                self.core.state.cr0 |= CR0_PE;
                segmentation::load_segment_for(&mut self.core.state, &mut self.bus, Segment::Cs, sel[1], LoadReason::CodeSegment)
                    .map_err(fault)?;
                for seg in [Segment::Ds, Segment::Es, Segment::Ss, Segment::Fs, Segment::Gs] {
                    segmentation::load_segment_for(&mut self.core.state, &mut self.bus, seg, sel[2], LoadReason::DataSegment)
                        .map_err(fault)?;
                }
                self.core.state.set_rip(BOOT_SECTOR_LOAD_ADDR);
            }
            BootMode::Long64 => {
                const GDT_BASE: u64 = 0x0000_0800;
                let sel = install_flat_gdt(&mut self.bus, GDT_BASE, true);
                self.core.state.gdtr.base = GDT_BASE;
                self.core.state.gdtr.limit = 23;
                self.core.state.cr4 |= CR4_PAE;
                self.core.state.efer |= EFER_LME;
                self.core.state.cr0 |= CR0_PE;
                self.core.state.cr0 |= aero_cpu_core::state::CR0_PG;
                self.core.state.efer |= EFER_LMA;
                segmentation::load_segment_for(&mut self.core.state, &mut self.bus, Segment::Cs, sel[1], LoadReason::CodeSegment)
                    .map_err(fault)?;
                for seg in [Segment::Ds, Segment::Es, Segment::Ss, Segment::Fs, Segment::Gs] {
                    segmentation::load_segment_for(&mut self.core.state, &mut self.bus, seg, sel[2], LoadReason::DataSegment)
                        .map_err(fault)?;
                }
                self.core.state.set_rip(BOOT_SECTOR_LOAD_ADDR);
            }
        }

        debug!(mode = ?self.config.boot_mode, rip = %format_args!("{:#x}", self.core.state.rip()), "machine reset, boot sector loaded");
        Ok(())
    }

    /// Runs up to `max_insts` instructions, servicing BIOS intercepts and delivering
    /// pending faults/interrupts between each (§4.7, §5). Returns as soon as the core
    /// halts with nothing able to wake it, faults with no further handler to vector
    /// to, or the instruction budget is exhausted.
    pub fn run_slice(&mut self, max_insts: u64) -> Result<RunExit, MachineError> {
        let disk = self.disk.as_mut().ok_or(MachineError::NoDiskImage)?;
        let mut executed = 0u64;
        while executed < max_insts {
            if self.core.interrupts.halted {
                return Ok(RunExit::Halted { executed });
            }

            match step(&mut self.core, &mut self.bus) {
                Ok(StepExit::Continue) | Ok(StepExit::ContinueInhibitInterrupts) => {}
                Ok(StepExit::Halted) => {
                    self.core.interrupts.halted = true;
                }
                Ok(StepExit::Fault(exc)) => {
                    trace!(?exc, "instruction fault, queuing for delivery");
                    self.core.raise_exception_fault(exc);
                }
                Err(exc) => {
                    self.core.raise_exception_fault(exc);
                }
            }
            executed += 1;

            if let Some(vector) = self.core.take_software_interrupt() {
                if self.bios.intercepts(vector) {
                    trace!(vector, "BIOS intercept dispatched");
                    let mut devices = Devices { disk, video: None, keyboard: &mut self.keyboard };
                    if let Err(exc) = self.bios.handle_interrupt(vector, &mut self.core, &mut self.bus, &mut devices) {
                        self.core.raise_exception_fault(exc);
                    }
                } else {
                    self.core.raise_software_interrupt(vector);
                }
            }

            match self.core.deliver_pending_event(&mut self.bus) {
                Ok(_) => {}
                Err(exc) => {
                    warn!(?exc, executed, "fault raised while delivering a pending event; halting emulation");
                    return Ok(RunExit::Faulted { exception: exc, executed });
                }
            }
        }
        Ok(RunExit::InstructionLimit { executed })
    }

    /// Drains whatever the guest has written to the COM1 transmit register so far.
    pub fn take_serial_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.bus.serial_out)
    }

    pub fn read_physical_bytes(&mut self, addr: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        let _ = self.bus.read_bytes(addr, &mut buf);
        buf
    }

    pub fn cpu(&self) -> &CpuCore {
        &self.core
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boot_sector_with(code: &[u8]) -> Vec<u8> {
        let mut image = vec![0u8; BOOT_SECTOR_LEN];
        image[..code.len()].copy_from_slice(code);
        image[510] = 0x55;
        image[511] = 0xAA;
        image
    }

    #[test]
    fn reset_loads_boot_sector_at_0x7c00() {
        let mut m = Machine::new(MachineConfig::default()).unwrap();
        m.set_disk_image(boot_sector_with(&[0x90, 0x90, 0xF4])).unwrap(); // NOP NOP HLT
        m.reset().unwrap();
        assert_eq!(m.read_physical_bytes(BOOT_SECTOR_LOAD_ADDR, 3), vec![0x90, 0x90, 0xF4]);
        assert_eq!(m.cpu().state.rip(), BOOT_SECTOR_LOAD_ADDR);
    }

    #[test]
    fn hlt_stops_the_run_loop() {
        let mut m = Machine::new(MachineConfig::default()).unwrap();
        m.set_disk_image(boot_sector_with(&[0xF4])).unwrap(); // HLT
        m.reset().unwrap();
        match m.run_slice(10).unwrap() {
            RunExit::Halted { executed } => assert_eq!(executed, 1),
            other => panic!("expected Halted, got {other:?}"),
        }
    }

    #[test]
    fn serial_port_write_is_captured() {
        let mut m = Machine::new(MachineConfig::default()).unwrap();
        // mov al, 0x41; out 0x3f8, al; hlt
        m.set_disk_image(boot_sector_with(&[0xB0, 0x41, 0xE6, 0xF8, 0xF4])).unwrap();
        m.reset().unwrap();
        m.run_slice(10).unwrap();
        assert_eq!(m.take_serial_output(), vec![0x41]);
    }

    #[test]
    fn instruction_budget_bounds_an_infinite_loop() {
        let mut m = Machine::new(MachineConfig::default()).unwrap();
        m.set_disk_image(boot_sector_with(&[0xEB, 0xFE])).unwrap(); // jmp $
        m.reset().unwrap();
        match m.run_slice(100).unwrap() {
            RunExit::InstructionLimit { executed } => assert_eq!(executed, 100),
            other => panic!("expected InstructionLimit, got {other:?}"),
        }
    }

    #[test]
    fn int13_chs_read_is_intercepted_by_bios() {
        let mut m = Machine::new(MachineConfig::default()).unwrap();
        let mut image = vec![0u8; 4 * BOOT_SECTOR_LEN];
        // Boot sector: read 1 sector (LBA 1) to ES:0x0600, then HLT.
        let code: &[u8] = &[
            0xB8, 0x01, 0x02, // mov ax, 0x0201 (AH=2 read, AL=1 sector)
            0xB9, 0x02, 0x00, // mov cx, 0x0002 (cylinder 0, sector 2)
            0xBA, 0x00, 0x00, // mov dx, 0
            0xBB, 0x00, 0x06, // mov bx, 0x0600
            0xCD, 0x13, // int 0x13
            0xF4, // hlt
        ];
        image[..code.len()].copy_from_slice(code);
        image[510] = 0x55;
        image[511] = 0xAA;
        image[BOOT_SECTOR_LEN + 1] = 0x77; // byte 1 of LBA 1 (sector 2 CHS)
        m.set_disk_image(image).unwrap();
        m.reset().unwrap();
        m.run_slice(1000).unwrap();
        assert_eq!(m.read_physical_bytes(0x0600 + 1, 1), vec![0x77]);
    }
}
