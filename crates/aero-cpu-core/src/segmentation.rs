//! Selector:offset → linear address translation (§4.3): real mode, unreal mode,
//! protected mode (GDT descriptor lookup), and long mode (flat, except FS/GS).

use crate::exceptions::Exception;
use crate::mem::CpuBus;
use crate::state::{CpuMode, CpuState, SEG_ACCESS_PRESENT};
use aero_x86::Segment;

/// Why a selector is being loaded — only `CodeSegment` has side effects beyond
/// refreshing the cache (it updates CPL from the selector's RPL).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadReason {
    DataSegment,
    StackSegment,
    CodeSegment,
}

/// Loads `selector` into `seg`. In real mode this only updates the visible selector —
/// the descriptor cache is left exactly as it was, which is what makes unreal mode
/// observable after a PE→real transition (§4.3). In protected/long mode the
/// descriptor at `selector`'s index is fetched from the GDT or, when the selector's
/// TI bit is set, from the LDT named by `state.ldtr_base` (§4.3: "Look up descriptor
/// at `(GDTR.base | LDTR.base) + index*8`"), and the cache fully refreshed.
pub fn load_segment(
    state: &mut CpuState,
    bus: &mut impl CpuBus,
    seg: Segment,
    selector: u16,
) -> Result<(), Exception> {
    load_segment_for(state, bus, seg, selector, LoadReason::DataSegment)
}

pub fn load_segment_for(
    state: &mut CpuState,
    bus: &mut impl CpuBus,
    seg: Segment,
    selector: u16,
    reason: LoadReason,
) -> Result<(), Exception> {
    match state.mode() {
        CpuMode::Real => {
            state.segments.get_mut(seg).selector = selector;
        }
        _ => {
            if selector & !0x3 == 0 {
                // Null selector: legal for everything but CS/SS, cache left inert.
                let cache = state.segments.get_mut(seg);
                cache.selector = selector;
                cache.present = false;
                cache.explicitly_cached = true;
            } else {
                let index = (selector >> 3) as u64;
                let table_base = if selector & 0x4 != 0 {
                    state.ldtr_base
                } else {
                    state.gdtr.base
                };
                let desc_addr = table_base.wrapping_add(index * 8);
                let mut raw = [0u8; 8];
                bus.read_bytes(desc_addr, &mut raw)
                    .map_err(|_| Exception::GeneralProtection(selector))?;
                let descriptor = Descriptor::decode(&raw);
                if !descriptor.present {
                    return Err(Exception::GeneralProtection(selector));
                }
                let cache = state.segments.get_mut(seg);
                cache.selector = selector;
                cache.base = descriptor.base;
                cache.limit = descriptor.limit;
                cache.access = descriptor.access;
                cache.present = descriptor.present;
                cache.long_mode = descriptor.long_mode;
                cache.default_big = descriptor.default_big;
                cache.explicitly_cached = true;
            }
        }
    }

    if reason == LoadReason::CodeSegment {
        state.cpl = (selector & 0x3) as u8;
    }
    Ok(())
}

/// Directly writes a segment's descriptor cache without consulting the GDT — the
/// mechanism tests and boot shims use to establish unreal mode (§4.3, §4.6 INT 13h/
/// INT 15h handlers that need a >1MiB ES base while still in real mode).
pub fn cache_segment_descriptor(state: &mut CpuState, seg: Segment, base: u64, limit: u32, present: bool) {
    let cache = state.segments.get_mut(seg);
    cache.base = base;
    cache.limit = limit;
    cache.present = present;
    cache.access = if present { SEG_ACCESS_PRESENT } else { 0 };
    cache.explicitly_cached = true;
}

/// Computes the linear address for `offset` relative to `seg`, applying the A20 mask.
pub fn linear_address(state: &CpuState, seg: Segment, offset: u64) -> u64 {
    let cache = state.segments.get(seg);
    let raw = match state.mode() {
        CpuMode::Real => {
            if cache.explicitly_cached {
                cache.base.wrapping_add(offset)
            } else {
                ((cache.selector as u64) << 4).wrapping_add(offset)
            }
        }
        CpuMode::Long64 => {
            if matches!(seg, Segment::Fs | Segment::Gs) {
                cache.base.wrapping_add(offset)
            } else {
                offset
            }
        }
        CpuMode::Protected16 | CpuMode::Protected32 | CpuMode::Compatibility32 => {
            cache.base.wrapping_add(offset)
        }
    };
    aero_mmu::mask_a20(raw, state.a20_enabled)
}

/// Raises #GP if `offset..offset+size` exceeds the segment's limit. A no-op in real,
/// unreal, and 64-bit modes, where limits are either absent or not enforced by this
/// core (§1 Non-goals).
pub fn check_limit(state: &CpuState, seg: Segment, offset: u32, size: u32) -> Result<(), Exception> {
    match state.mode() {
        CpuMode::Protected16 | CpuMode::Protected32 | CpuMode::Compatibility32 => {
            let cache = state.segments.get(seg);
            let end = offset.checked_add(size).ok_or(Exception::GeneralProtection(cache.selector))?;
            if end > cache.limit {
                return Err(Exception::GeneralProtection(cache.selector));
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Decodes just the base address out of a raw 8-byte GDT/LDT descriptor, for
/// callers (the AH=87 extended-memory-move BIOS intercept) that need to resolve a
/// descriptor's linear base without a full segment load.
pub fn descriptor_base(raw: &[u8; 8]) -> u64 {
    Descriptor::decode(raw).base
}

struct Descriptor {
    base: u64,
    limit: u32,
    access: u8,
    present: bool,
    long_mode: bool,
    default_big: bool,
}

impl Descriptor {
    /// Decodes an 8-byte GDT/LDT code/data descriptor (§6 "Bit-exact formats").
    fn decode(raw: &[u8; 8]) -> Descriptor {
        let limit_low = u16::from_le_bytes([raw[0], raw[1]]) as u32;
        let base_low = u16::from_le_bytes([raw[2], raw[3]]) as u64;
        let base_mid = raw[4] as u64;
        let access = raw[5];
        let flags_limit_high = raw[6];
        let base_high = raw[7] as u64;

        let base = base_low | (base_mid << 16) | (base_high << 24);
        let limit_high = (flags_limit_high & 0x0F) as u32;
        let mut limit = limit_low | (limit_high << 16);
        let granularity = flags_limit_high & 0x80 != 0;
        if granularity {
            limit = (limit << 12) | 0xFFF;
        }
        let long_mode = flags_limit_high & 0x20 != 0;
        let default_big = flags_limit_high & 0x40 != 0;
        let present = access & SEG_ACCESS_PRESENT != 0;

        Descriptor {
            base,
            limit,
            access,
            present,
            long_mode,
            default_big,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::FlatTestBus;
    use crate::state::CR0_PE;

    fn gdt_descriptor(base: u32, limit20: u32, access: u8, flags: u8) -> [u8; 8] {
        let mut raw = [0u8; 8];
        raw[0] = (limit20 & 0xFF) as u8;
        raw[1] = ((limit20 >> 8) & 0xFF) as u8;
        raw[2] = (base & 0xFF) as u8;
        raw[3] = ((base >> 8) & 0xFF) as u8;
        raw[4] = ((base >> 16) & 0xFF) as u8;
        raw[5] = access;
        raw[6] = (flags << 4) | (((limit20 >> 16) & 0xF) as u8);
        raw[7] = ((base >> 24) & 0xFF) as u8;
        raw
    }

    #[test]
    fn real_mode_uses_selector_shift_until_explicit_cache_write() {
        let mut state = CpuState::power_on();
        let mut bus = FlatTestBus::new(0x10_0000);
        load_segment(&mut state, &mut bus, Segment::Es, 0x1000).unwrap();
        assert_eq!(linear_address(&state, Segment::Es, 0x10), 0x10010);

        cache_segment_descriptor(&mut state, Segment::Es, 0x20_0000, 0xFFFF, true);
        assert_eq!(linear_address(&state, Segment::Es, 0x10), 0x20_0010);

        // A later real-mode selector load does not clear the cache preference.
        load_segment(&mut state, &mut bus, Segment::Es, 0x2000).unwrap();
        assert_eq!(linear_address(&state, Segment::Es, 0x10), 0x20_0010);
    }

    #[test]
    fn protected_mode_loads_base_from_gdt() {
        let mut state = CpuState::power_on();
        state.cr0 |= CR0_PE;
        state.segments.cs.default_big = true;
        state.gdtr.base = 0x1000;
        state.gdtr.limit = 0xFFFF;

        let mut bus = FlatTestBus::new(0x10_0000);
        // descriptor index 2 (selector 0x10): base=0x0010_0000, limit=0xFFFF, granularity=1, access=present+data.
        let desc = gdt_descriptor(0x0010_0000, 0xFFFF, 0x92, 0x8);
        bus.write_bytes(0x1000 + 2 * 8, &desc).unwrap();

        load_segment(&mut state, &mut bus, Segment::Ds, 0x10).unwrap();
        let cache = state.segments.ds;
        assert_eq!(cache.base, 0x0010_0000);
        assert_eq!(cache.limit, 0xFFFF_FFF);
        assert!(cache.explicitly_cached);
        assert_eq!(linear_address(&state, Segment::Ds, 0x20), 0x0010_0020);
    }

    #[test]
    fn ti_bit_set_loads_descriptor_from_ldt_not_gdt() {
        let mut state = CpuState::power_on();
        state.cr0 |= CR0_PE;
        state.segments.cs.default_big = true;
        state.gdtr.base = 0x1000;
        state.gdtr.limit = 0xFFFF;
        state.ldtr_base = 0x5000;
        state.ldtr_limit = 0xFFFF;

        let mut bus = FlatTestBus::new(0x10_0000);
        // A GDT descriptor at the same index, to prove it's NOT the one consulted.
        let gdt_desc = gdt_descriptor(0xBAD_0000, 0xFFFF, 0x92, 0x8);
        bus.write_bytes(0x1000 + 2 * 8, &gdt_desc).unwrap();
        // The LDT descriptor at index 2 (selector 0x10 | TI=1 = 0x14).
        let ldt_desc = gdt_descriptor(0x0030_0000, 0xFFFF, 0x92, 0x8);
        bus.write_bytes(0x5000 + 2 * 8, &ldt_desc).unwrap();

        load_segment(&mut state, &mut bus, Segment::Ds, 0x14).unwrap();
        let cache = state.segments.ds;
        assert_eq!(cache.base, 0x0030_0000);
        assert_eq!(linear_address(&state, Segment::Ds, 0x8), 0x0030_0008);
    }

    #[test]
    fn not_present_descriptor_faults() {
        let mut state = CpuState::power_on();
        state.cr0 |= CR0_PE;
        state.segments.cs.default_big = true;
        state.gdtr.base = 0x1000;
        let mut bus = FlatTestBus::new(0x10_0000);
        let desc = gdt_descriptor(0, 0xFFFF, 0x00, 0x8); // present bit clear
        bus.write_bytes(0x1000 + 8, &desc).unwrap();
        let err = load_segment(&mut state, &mut bus, Segment::Ds, 0x08).unwrap_err();
        assert_eq!(err, Exception::GeneralProtection(0x08));
    }
}
