//! Software/hardware interrupt dispatch and fault delivery (§4.5).
//!
//! `CpuCore` wraps [`CpuState`] with the pending-event queue the execution loop
//! drains between instructions (§4.7): a handler raises an INT, a fault, or an
//! external IRQ by calling one of the `raise_*`/`inject_*` methods, and the loop
//! calls [`CpuCore::deliver_pending_event`] before fetching the next instruction.

use crate::exceptions::Exception;
use crate::mem::CpuBus;
use crate::segmentation::{self, LoadReason};
use crate::state::{
    gpr, CpuMode, CpuState, RFLAGS_IF, RFLAGS_TF, RFLAGS_USER_WRITABLE,
};
use aero_x86::{RegisterWidth, Segment};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    Software,
    External,
    Fault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingEvent {
    vector: u8,
    error_code: Option<u16>,
    kind: EventKind,
}

/// The outcome of servicing the pending-event queue for one execution-loop turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuExit {
    Continue,
    Halted,
}

/// Tracks whether interrupts are currently enabled on behalf of the execution loop's
/// HLT handling; a bare `CpuState` has no notion of "halted", so the loop consults
/// this controller to decide whether a halted core can be woken by a pending event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterruptController {
    pub halted: bool,
}

impl InterruptController {
    pub fn new() -> Self {
        InterruptController::default()
    }

    pub fn wake_if_pending(&mut self, has_pending: bool) {
        if has_pending {
            self.halted = false;
        }
    }
}

/// The CPU plus its pending-interrupt/fault queue and halted-ness.
pub struct CpuCore {
    pub state: CpuState,
    pub interrupts: InterruptController,
    pending: Option<PendingEvent>,
}

impl CpuCore {
    pub fn new(state: CpuState) -> Self {
        CpuCore {
            state,
            interrupts: InterruptController::new(),
            pending: None,
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Takes the pending event's vector iff it is a software-raised interrupt (INT
    /// imm8/INT3/INT1/INTO), leaving external IRQs and CPU faults queued. The
    /// execution loop uses this to hand a vector to a registered BIOS intercept
    /// (§4.6) instead of building a frame and transferring to the IVT/IDT target —
    /// the intercept stands in for "guest code at the vector", so nothing is
    /// delivered when this returns `Some`.
    pub fn take_software_interrupt(&mut self) -> Option<u8> {
        match self.pending {
            Some(PendingEvent { kind: EventKind::Software, vector, .. }) => {
                self.pending = None;
                Some(vector)
            }
            _ => None,
        }
    }

    /// INT imm8 / INT3 / INT1 (§4.4): a software-raised interrupt, delivered on the
    /// next `deliver_pending_event` call (the execution loop calls this immediately
    /// after the handler returns, before fetching the next instruction).
    pub fn raise_software_interrupt(&mut self, vector: u8) {
        self.pending = Some(PendingEvent {
            vector,
            error_code: None,
            kind: EventKind::Software,
        });
    }

    /// An externally-raised IRQ; only delivered if IF is set and nothing higher
    /// priority is already pending. Wakes a halted core.
    pub fn inject_external_interrupt(&mut self, vector: u8) {
        self.interrupts.wake_if_pending(true);
        if self.pending.is_none() {
            self.pending = Some(PendingEvent {
                vector,
                error_code: None,
                kind: EventKind::External,
            });
        }
    }

    /// A CPU-detected fault (#UD/#GP/#DE/...); always takes priority over a queued
    /// software or external event.
    pub fn raise_exception_fault(&mut self, exc: Exception) {
        self.pending = Some(PendingEvent {
            vector: exc.vector(),
            error_code: exc.error_code(),
            kind: EventKind::Fault,
        });
    }

    /// Delivers the queued event, if any, building the mode-appropriate frame and
    /// transferring control to the vector's handler. No-op if nothing is pending.
    pub fn deliver_pending_event(&mut self, bus: &mut impl CpuBus) -> Result<CpuExit, Exception> {
        let Some(event) = self.pending.take() else {
            return Ok(CpuExit::Continue);
        };
        if event.kind == EventKind::External && !self.state.flag(RFLAGS_IF) {
            // Not deliverable yet; re-queue for the next loop turn.
            self.pending = Some(event);
            return Ok(CpuExit::Continue);
        }

        self.interrupts.halted = false;
        match self.state.mode() {
            CpuMode::Real => deliver_real_mode(&mut self.state, bus, event.vector)?,
            CpuMode::Protected16 | CpuMode::Protected32 | CpuMode::Compatibility32 => {
                deliver_protected_mode(&mut self.state, bus, event.vector, event.error_code)?
            }
            CpuMode::Long64 => deliver_long_mode(&mut self.state, bus, event.vector, event.error_code)?,
        }
        Ok(CpuExit::Continue)
    }

    /// IRET/IRETD/IRETQ (§4.5): pops the frame the matching INT delivery pushed and
    /// restores CS:IP/RIP, SS:SP/RSP, and RFLAGS.
    pub fn iret(&mut self, bus: &mut impl CpuBus) -> Result<(), Exception> {
        match self.state.mode() {
            CpuMode::Real => iret_real_mode(&mut self.state, bus),
            CpuMode::Protected16 | CpuMode::Protected32 | CpuMode::Compatibility32 => {
                iret_protected_mode(&mut self.state, bus)
            }
            CpuMode::Long64 => iret_long_mode(&mut self.state, bus),
        }
    }
}

/// Filters a popped RFLAGS value against what `cpl` is actually allowed to write
/// (§4.5: IRET/IRETQ restore "filtered for bits writable at current CPL"). At CPL0
/// every bit the frame carried is restored; below CPL0 bits outside
/// `RFLAGS_USER_WRITABLE` (IF, IOPL, and the other CPL0-only bits) are left at
/// their pre-IRET value instead of taking the popped one.
fn filter_popped_rflags(current: u64, popped: u64, cpl: u8) -> u64 {
    if cpl == 0 {
        popped
    } else {
        (current & !RFLAGS_USER_WRITABLE) | (popped & RFLAGS_USER_WRITABLE)
    }
}

fn stack_width_bits(state: &CpuState) -> u32 {
    match state.mode() {
        CpuMode::Real | CpuMode::Protected16 => 16,
        CpuMode::Protected32 | CpuMode::Compatibility32 => 32,
        CpuMode::Long64 => 64,
    }
}

fn push(state: &mut CpuState, bus: &mut impl CpuBus, width_bits: u32, value: u64) -> Result<(), Exception> {
    let (width, size) = match width_bits {
        16 => (RegisterWidth::Bits16, 2u64),
        32 => (RegisterWidth::Bits32, 4u64),
        64 => (RegisterWidth::Bits64, 8u64),
        _ => unreachable!(),
    };
    let sp = state.read_gpr(gpr::RSP, width, false).wrapping_sub(size);
    state.write_gpr(gpr::RSP, width, false, sp);
    let addr = segmentation::linear_address(state, Segment::Ss, sp);
    let fault = |_| Exception::GeneralProtection(0);
    match width_bits {
        16 => bus.write_u16(addr, value as u16).map_err(fault)?,
        32 => bus.write_u32(addr, value as u32).map_err(fault)?,
        64 => bus.write_u64(addr, value).map_err(fault)?,
        _ => unreachable!(),
    }
    Ok(())
}

fn pop(state: &mut CpuState, bus: &mut impl CpuBus, width_bits: u32) -> Result<u64, Exception> {
    let (width, size) = match width_bits {
        16 => (RegisterWidth::Bits16, 2u64),
        32 => (RegisterWidth::Bits32, 4u64),
        64 => (RegisterWidth::Bits64, 8u64),
        _ => unreachable!(),
    };
    let sp = state.read_gpr(gpr::RSP, width, false);
    let addr = segmentation::linear_address(state, Segment::Ss, sp);
    let fault = |_| Exception::GeneralProtection(0);
    let value = match width_bits {
        16 => bus.read_u16(addr).map_err(fault)? as u64,
        32 => bus.read_u32(addr).map_err(fault)? as u64,
        64 => bus.read_u64(addr).map_err(fault)?,
        _ => unreachable!(),
    };
    state.write_gpr(gpr::RSP, width, false, sp.wrapping_add(size));
    Ok(value)
}

fn deliver_real_mode(state: &mut CpuState, bus: &mut impl CpuBus, vector: u8) -> Result<(), Exception> {
    push(state, bus, 16, state.rflags())?;
    push(state, bus, 16, state.segments.cs.selector as u64)?;
    push(state, bus, 16, state.rip())?;

    state.set_flag(RFLAGS_IF, false);
    state.set_flag(RFLAGS_TF, false);

    let entry_addr = (vector as u64) * 4;
    let mut raw = [0u8; 4];
    bus.read_bytes(entry_addr, &mut raw)
        .map_err(|_| Exception::GeneralProtection(0))?;
    let offset = u16::from_le_bytes([raw[0], raw[1]]);
    let segment = u16::from_le_bytes([raw[2], raw[3]]);

    segmentation::load_segment_for(state, bus, Segment::Cs, segment, LoadReason::CodeSegment)?;
    state.set_rip(offset as u64);
    Ok(())
}

fn iret_real_mode(state: &mut CpuState, bus: &mut impl CpuBus) -> Result<(), Exception> {
    let ip = pop(state, bus, 16)?;
    let cs = pop(state, bus, 16)?;
    let flags = pop(state, bus, 16)?;
    segmentation::load_segment_for(state, bus, Segment::Cs, cs as u16, LoadReason::CodeSegment)?;
    state.set_rip(ip);
    state.set_rflags((state.rflags() & !0xFFFF) | flags);
    Ok(())
}

/// 8-byte protected-mode IDT gate: `{offsetLow16, selector16, zero8, typeAttr8, offsetHigh16}`.
struct Idt32Gate {
    offset: u32,
    selector: u16,
    present: bool,
    is_trap: bool,
}

fn read_idt32_gate(state: &CpuState, bus: &mut impl CpuBus, vector: u8) -> Result<Idt32Gate, Exception> {
    let addr = state.idtr.base.wrapping_add(vector as u64 * 8);
    let mut raw = [0u8; 8];
    bus.read_bytes(addr, &mut raw)
        .map_err(|_| Exception::GeneralProtection(0))?;
    let offset_low = u16::from_le_bytes([raw[0], raw[1]]) as u32;
    let selector = u16::from_le_bytes([raw[2], raw[3]]);
    let type_attr = raw[5];
    let offset_high = u16::from_le_bytes([raw[6], raw[7]]) as u32;
    Ok(Idt32Gate {
        offset: offset_low | (offset_high << 16),
        selector,
        present: type_attr & 0x80 != 0,
        is_trap: type_attr & 0x1 != 0,
    })
}

fn deliver_protected_mode(
    state: &mut CpuState,
    bus: &mut impl CpuBus,
    vector: u8,
    error_code: Option<u16>,
) -> Result<(), Exception> {
    let gate = read_idt32_gate(state, bus, vector)?;
    if !gate.present {
        return Err(Exception::GeneralProtection(vector as u16 * 8));
    }

    let width = stack_width_bits(state);
    let target_cpl = (gate.selector & 0x3) as u8;
    let stack_switch = target_cpl < state.cpl;

    if stack_switch {
        // Simplified privilege-level stack switch: the new SS:SP comes from the
        // software-configured ring-0 stack fields rather than a parsed TSS
        // descriptor (this core does not model the TSS busy/available state
        // machine — see DESIGN.md).
        let old_ss = state.segments.ss.selector;
        let old_sp = state.read_gpr(gpr::RSP, RegisterWidth::Bits32, false);
        segmentation::load_segment_for(state, bus, Segment::Ss, state.tss_ss0, LoadReason::StackSegment)?;
        state.write_gpr(gpr::RSP, RegisterWidth::Bits32, false, state.tss_esp0 as u64);
        push(state, bus, width, old_ss as u64)?;
        push(state, bus, width, old_sp)?;
    }

    push(state, bus, width, state.rflags())?;
    push(state, bus, width, state.segments.cs.selector as u64)?;
    push(state, bus, width, state.rip())?;
    if let Some(code) = error_code {
        push(state, bus, width, code as u64)?;
    }

    if !gate.is_trap {
        state.set_flag(RFLAGS_IF, false);
    }
    segmentation::load_segment_for(state, bus, Segment::Cs, gate.selector, LoadReason::CodeSegment)?;
    state.set_rip(gate.offset as u64);
    Ok(())
}

fn iret_protected_mode(state: &mut CpuState, bus: &mut impl CpuBus) -> Result<(), Exception> {
    let width = stack_width_bits(state);
    let requesting_cpl = state.cpl;

    let ip = pop(state, bus, width)?;
    let cs = pop(state, bus, width)?;
    let flags = pop(state, bus, width)?;

    segmentation::load_segment_for(state, bus, Segment::Cs, cs as u16, LoadReason::CodeSegment)?;
    state.set_rip(ip);
    let mask = if width == 16 { 0xFFFF } else { 0xFFFF_FFFF };
    let current = state.rflags();
    let restored = filter_popped_rflags(current, flags & mask, requesting_cpl);
    state.set_rflags((current & !mask) | restored);

    let new_cpl = state.cpl;
    if new_cpl > requesting_cpl {
        let old_sp = pop(state, bus, width)?;
        let old_ss = pop(state, bus, width)?;
        segmentation::load_segment_for(state, bus, Segment::Ss, old_ss as u16, LoadReason::StackSegment)?;
        state.write_gpr(gpr::RSP, RegisterWidth::Bits32, false, old_sp);
    }
    Ok(())
}

fn deliver_long_mode(
    state: &mut CpuState,
    bus: &mut impl CpuBus,
    vector: u8,
    error_code: Option<u16>,
) -> Result<(), Exception> {
    let addr = state.idtr.base.wrapping_add(vector as u64 * 16);
    let mut raw = [0u8; 16];
    bus.read_bytes(addr, &mut raw)
        .map_err(|_| Exception::GeneralProtection(0))?;
    let offset_low = u16::from_le_bytes([raw[0], raw[1]]) as u64;
    let selector = u16::from_le_bytes([raw[2], raw[3]]);
    let type_attr = raw[5];
    let offset_mid = u16::from_le_bytes([raw[6], raw[7]]) as u64;
    let offset_high = u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]) as u64;
    let offset = offset_low | (offset_mid << 16) | (offset_high << 32);
    let present = type_attr & 0x80 != 0;
    let is_trap = type_attr & 0x1 != 0;
    if !present {
        return Err(Exception::GeneralProtection(vector as u16 * 16));
    }

    let old_ss = state.segments.ss.selector;
    let old_rsp = state.read_gpr(gpr::RSP, RegisterWidth::Bits64, false);

    // 5-qword frame {RIP, CS, RFLAGS, RSP, SS}, 16-byte aligned (§4.5).
    push(state, bus, 64, old_ss as u64)?;
    push(state, bus, 64, old_rsp)?;
    push(state, bus, 64, state.rflags())?;
    push(state, bus, 64, state.segments.cs.selector as u64)?;
    push(state, bus, 64, state.rip())?;
    if let Some(code) = error_code {
        push(state, bus, 64, code as u64)?;
    }

    if !is_trap {
        state.set_flag(RFLAGS_IF, false);
    }
    segmentation::load_segment_for(state, bus, Segment::Cs, selector, LoadReason::CodeSegment)?;
    state.set_rip(offset);
    Ok(())
}

fn iret_long_mode(state: &mut CpuState, bus: &mut impl CpuBus) -> Result<(), Exception> {
    let requesting_cpl = state.cpl;

    let ip = pop(state, bus, 64)?;
    let cs = pop(state, bus, 64)?;
    let flags = pop(state, bus, 64)?;
    let rsp = pop(state, bus, 64)?;
    let ss = pop(state, bus, 64)?;

    segmentation::load_segment_for(state, bus, Segment::Cs, cs as u16, LoadReason::CodeSegment)?;
    state.set_rip(ip);
    state.set_rflags(filter_popped_rflags(state.rflags(), flags, requesting_cpl));
    segmentation::load_segment_for(state, bus, Segment::Ss, ss as u16, LoadReason::StackSegment)?;
    state.write_gpr(gpr::RSP, RegisterWidth::Bits64, false, rsp);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::FlatTestBus;

    fn real_mode_core() -> (CpuCore, FlatTestBus) {
        let core = CpuCore::new(CpuState::power_on());
        let bus = FlatTestBus::new(0x10_0000);
        (core, bus)
    }

    #[test]
    fn int_then_iret_round_trips_real_mode_state() {
        let (mut core, mut bus) = real_mode_core();
        core.state.segments.cs.selector = 0;
        core.state.set_rip(0x100);
        core.state.write_gpr(gpr::RSP, RegisterWidth::Bits16, false, 0xFFFE);
        core.state.set_rflags(RFLAGS_IF);

        // Point IVT[0x21] at a fixed handler address for the test.
        bus.write_u16(0x21 * 4, 0x5000).unwrap();
        bus.write_u16(0x21 * 4 + 2, 0x0000).unwrap();

        core.raise_software_interrupt(0x21);
        core.deliver_pending_event(&mut bus).unwrap();
        assert_eq!(core.state.rip(), 0x5000);
        assert!(!core.state.flag(RFLAGS_IF));

        core.iret(&mut bus).unwrap();
        assert_eq!(core.state.rip(), 0x100);
        assert!(core.state.flag(RFLAGS_IF));
        assert_eq!(
            core.state.read_gpr(gpr::RSP, RegisterWidth::Bits16, false),
            0xFFFE
        );
    }

    #[test]
    fn long_mode_int_pushes_five_qword_frame_and_iretq_restores_rsp() {
        let (mut core, mut bus) = real_mode_core();
        core.state.cr4 |= crate::state::CR4_PAE;
        core.state.efer |= crate::state::EFER_LME | crate::state::EFER_LMA;
        core.state.cr0 |= crate::state::CR0_PE | crate::state::CR0_PG;
        core.state.segments.cs.long_mode = true;
        core.state.segments.cs.selector = 0x08;
        core.state.segments.ss.selector = 0x10;
        core.state.set_rip(0x1000);
        core.state.write_gpr(gpr::RSP, RegisterWidth::Bits64, false, 0x9000);
        core.state.set_rflags(RFLAGS_IF);
        core.state.idtr.base = 0x2000;

        // IDT[0x80]: offset=0x3000, selector=0x08, present interrupt gate.
        let mut gate = [0u8; 16];
        gate[0] = 0x00;
        gate[1] = 0x30;
        gate[2] = 0x08;
        gate[3] = 0x00;
        gate[5] = 0x8E;
        bus.write_bytes(0x2000 + 0x80 * 16, &gate).unwrap();

        core.raise_software_interrupt(0x80);
        core.deliver_pending_event(&mut bus).unwrap();
        assert_eq!(core.state.rip(), 0x3000);
        let rsp_after = core.state.read_gpr(gpr::RSP, RegisterWidth::Bits64, false);
        assert_eq!(rsp_after, 0x9000 - 40);

        core.iret(&mut bus).unwrap();
        assert_eq!(core.state.rip(), 0x1000);
        assert_eq!(core.state.read_gpr(gpr::RSP, RegisterWidth::Bits64, false), 0x9000);
        assert!(core.state.flag(RFLAGS_IF));
    }

    #[test]
    fn iretq_at_cpl3_masks_if_and_iopl_but_keeps_user_writable_bits() {
        fn gdt_descriptor(base: u32, limit20: u32, access: u8, flags_nibble: u8) -> [u8; 8] {
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

        let (mut core, mut bus) = real_mode_core();
        core.state.cr4 |= crate::state::CR4_PAE;
        core.state.efer |= crate::state::EFER_LME | crate::state::EFER_LMA;
        core.state.cr0 |= crate::state::CR0_PE | crate::state::CR0_PG;
        core.state.gdtr.base = 0x4000;

        // CS (selector 0x1B, RPL=3, index=3): present, long-mode code descriptor.
        let cs_desc = gdt_descriptor(0, 0xFFFFF, 0x9A, 0x2);
        bus.write_bytes(0x4000 + 3 * 8, &cs_desc).unwrap();
        // SS (selector 0x23, RPL=3, index=4): present data descriptor.
        let ss_desc = gdt_descriptor(0, 0xFFFFF, 0x92, 0x0);
        bus.write_bytes(0x4000 + 4 * 8, &ss_desc).unwrap();

        core.state.segments.cs.long_mode = true;
        core.state.segments.cs.selector = 0x1B;
        core.state.segments.ss.selector = 0x23;
        core.state.cpl = 3;
        core.state.set_rflags(RFLAGS_IF);

        // Hand-build the 5-qword IRETQ frame a CPL3 INT would have pushed, with a
        // popped RFLAGS that tries to clear IF and raise IOPL to 3 while also
        // setting OF (a genuinely user-writable bit).
        let frame_rsp = 0x8000u64;
        core.state
            .write_gpr(gpr::RSP, RegisterWidth::Bits64, false, frame_rsp);
        let popped_flags = crate::state::RFLAGS_OF | crate::state::RFLAGS_IOPL_MASK;
        bus.write_u64(frame_rsp, 0x4000).unwrap(); // RIP
        bus.write_u64(frame_rsp + 8, 0x1B).unwrap(); // CS
        bus.write_u64(frame_rsp + 16, popped_flags).unwrap(); // RFLAGS
        bus.write_u64(frame_rsp + 24, 0x9000).unwrap(); // RSP
        bus.write_u64(frame_rsp + 32, 0x23).unwrap(); // SS

        core.iret(&mut bus).unwrap();

        assert!(core.state.flag(RFLAGS_IF), "CPL3 IRETQ must not let the guest clear IF");
        assert_eq!(
            core.state.rflags() & crate::state::RFLAGS_IOPL_MASK,
            0,
            "CPL3 IRETQ must not let the guest raise IOPL"
        );
        assert!(core.state.flag(crate::state::RFLAGS_OF), "user-writable bits still come from the popped frame");
        assert_eq!(core.state.rip(), 0x4000);
        assert_eq!(core.state.read_gpr(gpr::RSP, RegisterWidth::Bits64, false), 0x9000);
    }

    #[test]
    fn external_interrupt_is_deferred_while_if_clear() {
        let (mut core, mut bus) = real_mode_core();
        core.state.set_rflags(0); // IF clear
        core.inject_external_interrupt(0x30);
        core.deliver_pending_event(&mut bus).unwrap();
        assert!(core.has_pending());
    }
}
