//! The CPU-facing memory surface: linear-address reads/writes, already past A20
//! masking and segmentation. This sits above `aero_mmu::MemoryBus` — the
//! segmentation unit in [`crate::segmentation`] computes the linear address, and
//! implementors of this trait turn it into a physical one (identity, for the
//! non-paging core this spec covers).

use aero_mmu::BusError;
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MemFault {
    #[error("linear address {0:#x} is outside mapped memory")]
    OutOfRange(u64),
}

impl From<BusError> for MemFault {
    fn from(e: BusError) -> Self {
        match e {
            BusError::OutOfRange(addr) => MemFault::OutOfRange(addr),
        }
    }
}

/// Everything the execution engine and BIOS service layer need from memory: linear
/// reads/writes at every GPR width, raw byte ranges for string-instruction fast
/// paths, and a fetch path used by the decoder's byte window.
pub trait CpuBus {
    fn read_u8(&mut self, linear: u64) -> Result<u8, MemFault>;
    fn read_u16(&mut self, linear: u64) -> Result<u16, MemFault>;
    fn read_u32(&mut self, linear: u64) -> Result<u32, MemFault>;
    fn read_u64(&mut self, linear: u64) -> Result<u64, MemFault>;

    fn write_u8(&mut self, linear: u64, value: u8) -> Result<(), MemFault>;
    fn write_u16(&mut self, linear: u64, value: u16) -> Result<(), MemFault>;
    fn write_u32(&mut self, linear: u64, value: u32) -> Result<(), MemFault>;
    fn write_u64(&mut self, linear: u64, value: u64) -> Result<(), MemFault>;

    /// Fetches a window of raw instruction bytes for the decoder. May return fewer
    /// than `buf.len()` bytes at the tail of mapped memory; callers that need exactly
    /// `buf.len()` bytes use `read_bytes` instead.
    fn fetch(&mut self, linear: u64, buf: &mut [u8]) -> Result<(), MemFault> {
        self.read_bytes(linear, buf)
    }

    fn read_bytes(&mut self, linear: u64, buf: &mut [u8]) -> Result<(), MemFault>;
    fn write_bytes(&mut self, linear: u64, data: &[u8]) -> Result<(), MemFault>;

    /// Port I/O, used by IN/OUT and by the BIOS's debug-console and legacy device
    /// paths. The default implementation models an unconnected bus: reads return
    /// all-ones, writes are discarded. Hosts that wire real devices (serial UART,
    /// PIC, PIT, CMOS) override these.
    fn io_read_u8(&mut self, _port: u16) -> u8 {
        0xFF
    }
    fn io_read_u16(&mut self, _port: u16) -> u16 {
        0xFFFF
    }
    fn io_read_u32(&mut self, _port: u16) -> u32 {
        0xFFFF_FFFF
    }
    fn io_write_u8(&mut self, _port: u16, _value: u8) {}
    fn io_write_u16(&mut self, _port: u16, _value: u16) {}
    fn io_write_u32(&mut self, _port: u16, _value: u32) {}

    /// Fast path for REP MOVS: copy `len` bytes from `src` to `dst` without
    /// round-tripping through the caller one byte at a time. Implementors that
    /// can't offer a bulk path (e.g. overlapping MMIO regions) report `false`
    /// from `supports_bulk_copy` and the execution engine falls back to a byte loop.
    fn supports_bulk_copy(&self) -> bool {
        false
    }
    fn bulk_copy(&mut self, _src: u64, _dst: u64, _len: u64) -> Result<(), MemFault> {
        Err(MemFault::OutOfRange(0))
    }

    /// Fast path for REP STOS: fill `len` bytes at `dst` with `value`.
    fn supports_bulk_set(&self) -> bool {
        false
    }
    fn bulk_set(&mut self, _dst: u64, _value: u8, _len: u64) -> Result<(), MemFault> {
        Err(MemFault::OutOfRange(0))
    }
}

/// A flat-RAM-backed `CpuBus` with no A20 masking of its own (the segmentation unit
/// applies A20 before computing the linear address it passes down) — the default
/// harness for unit tests and the CLI.
pub struct FlatTestBus {
    pub ram: aero_mmu::FlatRam,
}

impl FlatTestBus {
    pub fn new(size: usize) -> Self {
        FlatTestBus {
            ram: aero_mmu::FlatRam::new(size),
        }
    }
}

impl CpuBus for FlatTestBus {
    fn read_u8(&mut self, linear: u64) -> Result<u8, MemFault> {
        let mut buf = [0u8; 1];
        self.ram.read_bytes(linear, &mut buf)?;
        Ok(buf[0])
    }

    fn read_u16(&mut self, linear: u64) -> Result<u16, MemFault> {
        let mut buf = [0u8; 2];
        self.ram.read_bytes(linear, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32(&mut self, linear: u64) -> Result<u32, MemFault> {
        let mut buf = [0u8; 4];
        self.ram.read_bytes(linear, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64(&mut self, linear: u64) -> Result<u64, MemFault> {
        let mut buf = [0u8; 8];
        self.ram.read_bytes(linear, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u8(&mut self, linear: u64, value: u8) -> Result<(), MemFault> {
        self.ram.write_bytes(linear, &[value]).map_err(Into::into)
    }

    fn write_u16(&mut self, linear: u64, value: u16) -> Result<(), MemFault> {
        self.ram
            .write_bytes(linear, &value.to_le_bytes())
            .map_err(Into::into)
    }

    fn write_u32(&mut self, linear: u64, value: u32) -> Result<(), MemFault> {
        self.ram
            .write_bytes(linear, &value.to_le_bytes())
            .map_err(Into::into)
    }

    fn write_u64(&mut self, linear: u64, value: u64) -> Result<(), MemFault> {
        self.ram
            .write_bytes(linear, &value.to_le_bytes())
            .map_err(Into::into)
    }

    fn read_bytes(&mut self, linear: u64, buf: &mut [u8]) -> Result<(), MemFault> {
        self.ram.read_bytes(linear, buf).map_err(Into::into)
    }

    fn write_bytes(&mut self, linear: u64, data: &[u8]) -> Result<(), MemFault> {
        self.ram.write_bytes(linear, data).map_err(Into::into)
    }

    fn supports_bulk_copy(&self) -> bool {
        true
    }

    fn bulk_copy(&mut self, src: u64, dst: u64, len: u64) -> Result<(), MemFault> {
        let len = len as usize;
        let mut tmp = vec![0u8; len];
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_width() {
        let mut bus = FlatTestBus::new(0x1000);
        bus.write_u64(0x10, 0x0011_2233_4455_6677).unwrap();
        assert_eq!(bus.read_u64(0x10).unwrap(), 0x0011_2233_4455_6677);
        assert_eq!(bus.read_u32(0x10).unwrap(), 0x4455_6677);
        assert_eq!(bus.read_u16(0x10).unwrap(), 0x6677);
        assert_eq!(bus.read_u8(0x10).unwrap(), 0x77);
    }

    #[test]
    fn out_of_range_is_a_fault_not_a_panic() {
        let mut bus = FlatTestBus::new(0x10);
        assert!(matches!(bus.read_u64(0x100), Err(MemFault::OutOfRange(0x100))));
    }
}
