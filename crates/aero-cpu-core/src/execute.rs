//! Dispatch and side-effecting execution of a decoded instruction (§4.4, §4.7).
//!
//! This module is the Tier-0 interpreter: it owns no state of its own, only the
//! per-opcode handlers that read a [`DecodedInstruction`] and mutate a [`CpuCore`]
//! plus its [`CpuBus`]. The execution loop (`aero-machine`) calls [`step`] once per
//! instruction and reacts to the returned [`StepExit`].

use aero_cpu_decoder::{
    decode_one,
    modrm::{MemOperand, RmOperand},
    opcode::{AluOp, Condition, Group3Op, Opcode, ShiftOp, StringOp, StringWidth},
    DecodeError, DecodedInstruction, MAX_INSTRUCTION_LEN,
};
use aero_x86::{gpr, Register, RegisterWidth, Segment};

use crate::exceptions::Exception;
use crate::flags;
use crate::interrupts::CpuCore;
use crate::mem::CpuBus;
use crate::segmentation::{self, LoadReason};
use crate::state::{
    CpuState, CR0_PE, CR0_PG, CR4_PAE, EFER_LMA, EFER_LME, RFLAGS_AF, RFLAGS_CF, RFLAGS_DF,
    RFLAGS_IF, RFLAGS_OF, RFLAGS_PF, RFLAGS_SF, RFLAGS_ZF,
};

/// MSRs this core actually models (§4.3 mode transitions, §8 boundary scenario 5).
pub const MSR_EFER: u32 = 0xC000_0080;

/// The outcome of executing one instruction, consumed by the execution loop (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepExit {
    Continue,
    /// One-instruction interrupt shadow after STI/MOV SS: the loop must not deliver
    /// a pending external interrupt until the *next* instruction has also retired.
    ContinueInhibitInterrupts,
    Halted,
    Fault(Exception),
}

fn width_bits(w: u32) -> RegisterWidth {
    match w {
        8 => RegisterWidth::Low8,
        16 => RegisterWidth::Bits16,
        32 => RegisterWidth::Bits32,
        64 => RegisterWidth::Bits64,
        _ => unreachable!("invalid operand width {w}"),
    }
}

fn mask_for(width: u32) -> u64 {
    if width == 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

/// The decoder's `operand_size` field only reflects prefixes/REX.W/mode — it says
/// nothing about the classic w-bit (opcode byte bit 0) that picks an 8-bit form out
/// of a byte/full-width opcode pair (88/89, C6/C7, F6/F7, ...). Every primary opcode
/// that comes in such a pair follows the rule uniformly.
fn byte_vs_full(opcode_byte: u8, full: u32) -> u32 {
    if opcode_byte & 1 == 0 {
        8
    } else {
        full
    }
}

/// Whether an 8-bit register-direct encoding resolves to the legacy AH/CH/DH/BH
/// view: only reachable when no REX prefix is present and the raw (pre-REX-
/// extension) field selects slot 4..7 (§3).
fn is_high8(rex_present: bool, slot: gpr::Slot, op_width: u32) -> bool {
    op_width == 8 && !rex_present && (4..=7).contains(&slot)
}

fn default_mem_segment(mem: &MemOperand) -> Segment {
    if mem.rip_relative {
        return Segment::Ds;
    }
    match mem.base {
        Some(b) if b == gpr::RSP || b == gpr::RBP => Segment::Ss,
        _ => Segment::Ds,
    }
}

fn address_mask(address_size: u32) -> u64 {
    match address_size {
        16 => 0xFFFF,
        32 => 0xFFFF_FFFF,
        _ => u64::MAX,
    }
}

/// Computes the *offset* (pre-segment-base) a memory operand addresses, including
/// RIP-relative resolution against the address of the instruction following this
/// one (§4.1).
fn mem_effective_offset(state: &CpuState, inst: &DecodedInstruction, mem: &MemOperand, next_rip: u64) -> u64 {
    if mem.rip_relative {
        return (next_rip as i64).wrapping_add(mem.disp) as u64;
    }
    let mut addr: i64 = mem.disp;
    if let Some(base) = mem.base {
        addr = addr.wrapping_add(state.read_gpr(base, RegisterWidth::Bits64, false) as i64);
    }
    if let Some((index, scale)) = mem.index {
        let idx = state.read_gpr(index, RegisterWidth::Bits64, false) as i64;
        addr = addr.wrapping_add(idx * scale as i64);
    }
    (addr as u64) & address_mask(inst.address_size)
}

/// Resolves a memory operand to a linear address, enforcing the segment's limit
/// (§4.3, §7 `SegmentFault`) over the `size_bytes`-byte span the access touches
/// before computing the linear address.
fn mem_linear_address(
    state: &CpuState,
    inst: &DecodedInstruction,
    mem: &MemOperand,
    next_rip: u64,
    size_bytes: u32,
) -> Result<u64, Exception> {
    let seg = inst
        .prefixes
        .segment_override
        .unwrap_or_else(|| default_mem_segment(mem));
    let offset = mem_effective_offset(state, inst, mem, next_rip);
    segmentation::check_limit(state, seg, offset as u32, size_bytes)?;
    Ok(segmentation::linear_address(state, seg, offset))
}

fn bus_fault(_: crate::mem::MemFault) -> Exception {
    Exception::GeneralProtection(0)
}

fn read_bus(bus: &mut impl CpuBus, addr: u64, width: u32) -> Result<u64, Exception> {
    Ok(match width {
        8 => bus.read_u8(addr).map_err(bus_fault)? as u64,
        16 => bus.read_u16(addr).map_err(bus_fault)? as u64,
        32 => bus.read_u32(addr).map_err(bus_fault)? as u64,
        64 => bus.read_u64(addr).map_err(bus_fault)?,
        _ => unreachable!(),
    })
}

fn write_bus(bus: &mut impl CpuBus, addr: u64, width: u32, value: u64) -> Result<(), Exception> {
    match width {
        8 => bus.write_u8(addr, value as u8).map_err(bus_fault)?,
        16 => bus.write_u16(addr, value as u16).map_err(bus_fault)?,
        32 => bus.write_u32(addr, value as u32).map_err(bus_fault)?,
        64 => bus.write_u64(addr, value).map_err(bus_fault)?,
        _ => unreachable!(),
    }
    Ok(())
}

/// Reads the rm operand of a ModR/M byte at `width`, either from a register
/// (applying the AH/CH/DH/BH aliasing rule) or from memory.
fn read_rm(
    state: &CpuState,
    bus: &mut impl CpuBus,
    inst: &DecodedInstruction,
    operand: RmOperand,
    width: u32,
    next_rip: u64,
) -> Result<u64, Exception> {
    match operand {
        RmOperand::Register(slot) => {
            let high8 = is_high8(inst.prefixes.rex.is_some(), slot, width);
            Ok(state.read_gpr(slot, width_bits(width), high8))
        }
        RmOperand::Memory(mem) => {
            let addr = mem_linear_address(state, inst, &mem, next_rip, width / 8)?;
            read_bus(bus, addr, width)
        }
    }
}

fn write_rm(
    state: &mut CpuState,
    bus: &mut impl CpuBus,
    inst: &DecodedInstruction,
    operand: RmOperand,
    width: u32,
    next_rip: u64,
    value: u64,
) -> Result<(), Exception> {
    match operand {
        RmOperand::Register(slot) => {
            let high8 = is_high8(inst.prefixes.rex.is_some(), slot, width);
            state.write_gpr(slot, width_bits(width), high8, value);
            Ok(())
        }
        RmOperand::Memory(mem) => {
            let addr = mem_linear_address(state, inst, &mem, next_rip, width / 8)?;
            write_bus(bus, addr, width, value)
        }
    }
}

fn reg_register(inst: &DecodedInstruction, reg_field: u8, width: u32) -> Register {
    let high8 = is_high8(inst.prefixes.rex.is_some(), reg_field, width);
    Register::from_slot(reg_field, width_bits(width), high8)
}

fn stack_width(state: &CpuState) -> RegisterWidth {
    if state.mode().is_64bit() {
        RegisterWidth::Bits64
    } else if state.mode().default_address_size() == 16 {
        RegisterWidth::Bits16
    } else {
        RegisterWidth::Bits32
    }
}

/// PUSH/POP/CALL/RET/JMP-far default to 64-bit width in 64-bit mode regardless of
/// the legacy operand-size default; a 0x66 prefix forces 16-bit instead (§4.4,
/// §9 Open Questions item 3).
fn push_pop_width(state: &CpuState, inst: &DecodedInstruction) -> u32 {
    if state.mode().is_64bit() {
        if inst.prefixes.operand_size_override {
            16
        } else {
            64
        }
    } else {
        inst.operand_size
    }
}

fn push(state: &mut CpuState, bus: &mut impl CpuBus, width: u32, value: u64) -> Result<(), Exception> {
    let size = (width / 8) as u64;
    let sp_width = stack_width(state);
    let sp = state.read_gpr(gpr::RSP, sp_width, false).wrapping_sub(size);
    state.write_gpr(gpr::RSP, sp_width, false, sp);
    let addr = segmentation::linear_address(state, Segment::Ss, sp);
    write_bus(bus, addr, width, value)
}

fn pop(state: &mut CpuState, bus: &mut impl CpuBus, width: u32) -> Result<u64, Exception> {
    let sp_width = stack_width(state);
    let sp = state.read_gpr(gpr::RSP, sp_width, false);
    let addr = segmentation::linear_address(state, Segment::Ss, sp);
    let value = read_bus(bus, addr, width)?;
    let size = (width / 8) as u64;
    state.write_gpr(gpr::RSP, sp_width, false, sp.wrapping_add(size));
    Ok(value)
}

fn condition_true(state: &CpuState, cond: Condition) -> bool {
    let cf = state.flag(RFLAGS_CF);
    let zf = state.flag(RFLAGS_ZF);
    let sf = state.flag(RFLAGS_SF);
    let of = state.flag(RFLAGS_OF);
    let pf = state.flag(RFLAGS_PF);
    match cond {
        Condition::O => of,
        Condition::No => !of,
        Condition::B => cf,
        Condition::Ae => !cf,
        Condition::E => zf,
        Condition::Ne => !zf,
        Condition::Be => cf || zf,
        Condition::A => !cf && !zf,
        Condition::S => sf,
        Condition::Ns => !sf,
        Condition::P => pf,
        Condition::Np => !pf,
        Condition::L => sf != of,
        Condition::Ge => sf == of,
        Condition::Le => zf || (sf != of),
        Condition::G => !zf && sf == of,
    }
}

fn sign_extend_to(value: u64, from_width: u32, to_width: u32) -> u64 {
    let shift = 64 - from_width;
    let signed = ((value << shift) as i64) >> shift;
    (signed as u64) & mask_for(to_width)
}

/// Element width in bits for a string instruction: the decoder's `StringWidth`
/// only distinguishes byte vs. "wide"; the actual wide width follows the
/// instruction's effective operand size (16/32/64), not a fixed 32 (§4.4).
fn string_element_width(width: StringWidth, operand_size: u32) -> u32 {
    match width {
        StringWidth::Byte => 8,
        _ => operand_size,
    }
}

fn string_step(df: bool, width_bytes: u64) -> i64 {
    if df {
        -(width_bytes as i64)
    } else {
        width_bytes as i64
    }
}

/// Upper bound on how far the fetch window grows while `decode_one` is still
/// consuming a redundant-prefix run (§4.1: the decoder tolerates more consecutive
/// prefix bytes than any single instruction's maximum length). One page is far more
/// than any realistic prefix run; it exists only to bound the retry loop against a
/// pathological or corrupt instruction stream, not to cap architecturally valid
/// prefix repetition.
const MAX_PREFIX_RUN_FETCH: usize = 4096;

/// Fetches enough bytes at `fetch_addr` to decode one instruction, growing the
/// window past `MAX_INSTRUCTION_LEN` when the decoder runs out of bytes mid-prefix-
/// scan rather than rejecting the instruction (§4.1). Falls back to a short read at
/// the tail of mapped memory when even the initial window isn't fully mapped.
fn fetch_and_decode(
    core: &CpuCore,
    bus: &mut impl CpuBus,
    rip: u64,
    fetch_addr: u64,
) -> Result<DecodedInstruction, Exception> {
    let mode = core.state.mode().decode_mode();
    let mut cap = MAX_INSTRUCTION_LEN;
    loop {
        let mut window = vec![0u8; cap];
        if bus.fetch(fetch_addr, &mut window).is_err() {
            // Fall back to however many bytes are actually mapped at the tail of memory.
            let mut n = cap;
            loop {
                if n == 0 {
                    return Err(Exception::GeneralProtection(0));
                }
                if bus.fetch(fetch_addr, &mut window[..n]).is_ok() {
                    window.truncate(n);
                    break;
                }
                n -= 1;
            }
        }

        match decode_one(mode, rip, &window) {
            Ok(inst) => return Ok(inst),
            Err(DecodeError::UnexpectedEof) if cap < MAX_PREFIX_RUN_FETCH => {
                cap = (cap * 2).min(MAX_PREFIX_RUN_FETCH);
            }
            Err(_) => return Err(Exception::InvalidOpcode),
        }
    }
}

/// Fetches, decodes, and executes exactly one instruction at the current CS:RIP,
/// advancing RIP past it (or to the branch target, for control-flow instructions).
pub fn step(core: &mut CpuCore, bus: &mut impl CpuBus) -> Result<StepExit, Exception> {
    let rip = core.state.rip();
    let fetch_addr = segmentation::linear_address(&core.state, Segment::Cs, rip);

    let inst = match fetch_and_decode(core, bus, rip, fetch_addr) {
        Ok(inst) => inst,
        Err(exc) => return Ok(StepExit::Fault(exc)),
    };
    let next_rip = rip.wrapping_add(inst.length as u64);
    core.state.set_rip(next_rip);

    match execute_one(core, bus, &inst, next_rip) {
        Ok(exit) => Ok(exit),
        Err(exc) => Ok(StepExit::Fault(exc)),
    }
}

fn execute_one(
    core: &mut CpuCore,
    bus: &mut impl CpuBus,
    inst: &DecodedInstruction,
    next_rip: u64,
) -> Result<StepExit, Exception> {
    let w = inst.operand_size;

    match inst.opcode {
        Opcode::Nop => {}

        Opcode::MovRmR { to_rm } => {
            let w = byte_vs_full(inst.opcode_byte, w);
            let m = inst.modrm.unwrap();
            let reg = reg_register(inst, m.reg, w);
            if to_rm {
                let v = core.state.read_reg(reg);
                write_rm(&mut core.state, bus, inst, m.operand, w, next_rip, v)?;
            } else {
                let v = read_rm(&core.state, bus, inst, m.operand, w, next_rip)?;
                core.state.write_reg(reg, v);
            }
        }

        Opcode::MovRmImm => {
            let w = byte_vs_full(inst.opcode_byte, w);
            let m = inst.modrm.unwrap();
            let imm = inst.immediate.unwrap() as u64 & mask_for(w);
            write_rm(&mut core.state, bus, inst, m.operand, w, next_rip, imm)?;
        }

        Opcode::MovRegImm { reg } => {
            let imm = inst.immediate.unwrap() as u64;
            let rex_b = inst.prefixes.rex.map(|r| r.b).unwrap_or(false);
            let slot = (reg & 0x7) | if rex_b { 0x8 } else { 0 };
            let width = if reg < 8 { 8 } else { w };
            let high8 = is_high8(inst.prefixes.rex.is_some(), reg & 0x7, width);
            core.state.write_gpr(slot, width_bits(width), high8, imm);
        }

        Opcode::MovRmSeg { to_rm } => {
            let m = inst.modrm.unwrap();
            let seg = Segment::from_modrm_reg(m.reg & 0x7).ok_or(Exception::InvalidOpcode)?;
            if to_rm {
                let v = core.state.segments.get(seg).selector as u64;
                write_rm(&mut core.state, bus, inst, m.operand, 16, next_rip, v)?;
            } else {
                let v = read_rm(&core.state, bus, inst, m.operand, 16, next_rip)? as u16;
                let reason = if seg == Segment::Ss {
                    LoadReason::StackSegment
                } else {
                    LoadReason::DataSegment
                };
                segmentation::load_segment_for(&mut core.state, bus, seg, v, reason)?;
            }
        }

        Opcode::Movzx { src_byte } => {
            let m = inst.modrm.unwrap();
            let src_width = if src_byte { 8 } else { 16 };
            let v = read_rm(&core.state, bus, inst, m.operand, src_width, next_rip)?;
            let reg = reg_register(inst, m.reg, w);
            core.state.write_reg(reg, v);
        }

        Opcode::Movsx { src_byte } => {
            let m = inst.modrm.unwrap();
            let src_width = if src_byte { 8 } else { 16 };
            let v = read_rm(&core.state, bus, inst, m.operand, src_width, next_rip)?;
            let v = sign_extend_to(v, src_width, w);
            let reg = reg_register(inst, m.reg, w);
            core.state.write_reg(reg, v);
        }

        Opcode::Lea => {
            let m = inst.modrm.unwrap();
            let mem = match m.operand {
                RmOperand::Memory(mem) => mem,
                RmOperand::Register(_) => return Err(Exception::InvalidOpcode),
            };
            let offset = mem_effective_offset(&core.state, inst, &mem, next_rip);
            let reg = reg_register(inst, m.reg, w);
            core.state.write_reg(reg, offset);
        }

        Opcode::XchgRmR => {
            let w = byte_vs_full(inst.opcode_byte, w);
            let m = inst.modrm.unwrap();
            let reg = reg_register(inst, m.reg, w);
            let a = read_rm(&core.state, bus, inst, m.operand, w, next_rip)?;
            let b = core.state.read_reg(reg);
            write_rm(&mut core.state, bus, inst, m.operand, w, next_rip, b)?;
            core.state.write_reg(reg, a);
        }

        Opcode::XchgAccum { reg } => {
            let rex_b = inst.prefixes.rex.map(|r| r.b).unwrap_or(false);
            let slot = reg | if rex_b { 0x8 } else { 0 };
            if slot != gpr::RAX {
                let a = core.state.read_gpr(gpr::RAX, width_bits(w), false);
                let b = core.state.read_gpr(slot, width_bits(w), false);
                core.state.write_gpr(gpr::RAX, width_bits(w), false, b);
                core.state.write_gpr(slot, width_bits(w), false, a);
            }
        }

        Opcode::Alu { op, rm_is_dst, has_imm } => {
            execute_alu(core, bus, inst, next_rip, op, rm_is_dst, has_imm, w)?;
        }

        Opcode::Group1 { op } => {
            if inst.is_0f && inst.opcode_byte == 0xAF {
                // IMUL r, rm: the decoder reuses the Group1 tag for this 2-operand
                // signed-multiply form, which carries no immediate (§4.4).
                let m = inst.modrm.unwrap();
                let reg = reg_register(inst, m.reg, w);
                let a = sign_extend_to(core.state.read_reg(reg), w, 64) as i64;
                let b = sign_extend_to(read_rm(&core.state, bus, inst, m.operand, w, next_rip)?, w, 64) as i64;
                let product = (a as i128) * (b as i128);
                let low = (product as u128 & mask_for(w) as u128) as u64;
                let sign_ext_low = sign_extend_to(low, w, 64) as i64 as i128;
                let carry = product != sign_ext_low;
                core.state.write_reg(reg, low);
                core.state.set_flag(RFLAGS_CF, carry);
                core.state.set_flag(RFLAGS_OF, carry);
            } else {
                let w = byte_vs_full(inst.opcode_byte, w);
                let m = inst.modrm.unwrap();
                let imm = if inst.opcode_byte == 0x81 {
                    inst.immediate.unwrap() as u64 & mask_for(w)
                } else {
                    sign_extend_to(inst.immediate.unwrap() as u64, 8, w)
                };
                let dst = read_rm(&core.state, bus, inst, m.operand, w, next_rip)?;
                let result = alu_compute(&mut core.state, op, w, dst, imm);
                if op != AluOp::Cmp {
                    write_rm(&mut core.state, bus, inst, m.operand, w, next_rip, result)?;
                }
            }
        }

        Opcode::ImulRmImm { imm8 } => {
            let m = inst.modrm.unwrap();
            let reg = reg_register(inst, m.reg, w);
            let raw_imm = inst.immediate.unwrap() as u64;
            let imm = if imm8 {
                sign_extend_to(raw_imm, 8, 64) as i64
            } else {
                sign_extend_to(raw_imm, w, 64) as i64
            };
            let src = sign_extend_to(read_rm(&core.state, bus, inst, m.operand, w, next_rip)?, w, 64) as i64;
            let product = (src as i128) * (imm as i128);
            let low = (product as u128 & mask_for(w) as u128) as u64;
            let sign_ext_low = sign_extend_to(low, w, 64) as i64 as i128;
            let carry = product != sign_ext_low;
            core.state.write_reg(reg, low);
            core.state.set_flag(RFLAGS_CF, carry);
            core.state.set_flag(RFLAGS_OF, carry);
        }

        Opcode::Inc => {
            let w = if (0x40..=0x4F).contains(&inst.opcode_byte) { w } else { byte_vs_full(inst.opcode_byte, w) };
            let m = inst.modrm.unwrap();
            let v = read_rm(&core.state, bus, inst, m.operand, w, next_rip)?;
            flags::inc(&mut core.state, w, v);
            let result = v.wrapping_add(1) & mask_for(w);
            write_rm(&mut core.state, bus, inst, m.operand, w, next_rip, result)?;
        }
        Opcode::Dec => {
            let w = if (0x40..=0x4F).contains(&inst.opcode_byte) { w } else { byte_vs_full(inst.opcode_byte, w) };
            let m = inst.modrm.unwrap();
            let v = read_rm(&core.state, bus, inst, m.operand, w, next_rip)?;
            flags::dec(&mut core.state, w, v);
            let result = v.wrapping_sub(1) & mask_for(w);
            write_rm(&mut core.state, bus, inst, m.operand, w, next_rip, result)?;
        }

        Opcode::Group2 { op, by_cl, by_one } => {
            let w = byte_vs_full(inst.opcode_byte, w);
            execute_shift(core, bus, inst, next_rip, op, by_cl, by_one, w)?;
        }

        Opcode::Group3 { op } => {
            if !inst.is_0f && matches!(inst.opcode_byte, 0x84 | 0x85) {
                // TEST rm, r: the decoder reuses the F6/F7 Group3 tag for this
                // register-operand form; ModRM.reg names the source register here,
                // not an opcode-extension digit, and there is no immediate.
                let w = byte_vs_full(inst.opcode_byte, w);
                let m = inst.modrm.unwrap();
                let reg = reg_register(inst, m.reg, w);
                let a = read_rm(&core.state, bus, inst, m.operand, w, next_rip)?;
                let b = core.state.read_reg(reg);
                flags::logical(&mut core.state, w, a & b & mask_for(w));
            } else {
                let w = byte_vs_full(inst.opcode_byte, w);
                return execute_group3(core, bus, inst, next_rip, op, w);
            }
        }

        Opcode::StringOp { op, width } => {
            execute_string(core, bus, inst, op, width)?;
        }

        Opcode::Push => {
            let pw = push_pop_width(&core.state, inst);
            let v = if let Some(m) = inst.modrm {
                read_rm(&core.state, bus, inst, m.operand, pw, next_rip)?
            } else {
                // 0x50..0x57 opcode-embedded register, or 0x9C PUSHF.
                if inst.opcode_byte == 0x9C {
                    core.state.rflags()
                } else {
                    let rex_b = inst.prefixes.rex.map(|r| r.b).unwrap_or(false);
                    let slot = (inst.opcode_byte & 0x7) | if rex_b { 0x8 } else { 0 };
                    core.state.read_gpr(slot, width_bits(pw), false)
                }
            };
            push(&mut core.state, bus, pw, v)?;
        }
        Opcode::PushImm => {
            let pw = push_pop_width(&core.state, inst);
            let imm = sign_extend_to(inst.immediate.unwrap() as u64, if inst.opcode_byte == 0x6A { 8 } else { w.min(32) }, pw);
            push(&mut core.state, bus, pw, imm)?;
        }
        Opcode::Pop => {
            let pw = push_pop_width(&core.state, inst);
            if inst.opcode_byte == 0xC9 {
                // LEAVE: MOV SP,BP ; POP BP.
                let bp = core.state.read_gpr(gpr::RBP, width_bits(pw), false);
                core.state.write_gpr(gpr::RSP, width_bits(pw), false, bp);
                let v = pop(&mut core.state, bus, pw)?;
                core.state.write_gpr(gpr::RBP, width_bits(pw), false, v);
            } else if inst.opcode_byte == 0x9D {
                let v = pop(&mut core.state, bus, pw)?;
                let mask = mask_for(pw.min(32));
                core.state.set_rflags((core.state.rflags() & !mask) | (v & mask));
            } else if let Some(m) = inst.modrm {
                let v = pop(&mut core.state, bus, pw)?;
                write_rm(&mut core.state, bus, inst, m.operand, pw, next_rip, v)?;
            } else {
                let rex_b = inst.prefixes.rex.map(|r| r.b).unwrap_or(false);
                let slot = (inst.opcode_byte & 0x7) | if rex_b { 0x8 } else { 0 };
                let v = pop(&mut core.state, bus, pw)?;
                core.state.write_gpr(slot, width_bits(pw), false, v);
            }
        }
        Opcode::PushSeg(seg) => {
            let pw = push_pop_width(&core.state, inst);
            let v = core.state.segments.get(seg).selector as u64;
            push(&mut core.state, bus, pw, v)?;
        }
        Opcode::PopSeg(seg) => {
            let pw = push_pop_width(&core.state, inst);
            let v = pop(&mut core.state, bus, pw)? as u16;
            let reason = if seg == Segment::Ss {
                LoadReason::StackSegment
            } else {
                LoadReason::DataSegment
            };
            segmentation::load_segment_for(&mut core.state, bus, seg, v, reason)?;
        }

        Opcode::CallRel => {
            let pw = push_pop_width(&core.state, inst);
            let rel = inst.immediate.unwrap();
            let target = (next_rip as i64).wrapping_add(rel) as u64;
            push(&mut core.state, bus, pw, next_rip)?;
            core.state.set_rip(target);
        }
        Opcode::CallNearIndirect => {
            let m = inst.modrm.unwrap();
            let pw = push_pop_width(&core.state, inst);
            let target = read_rm(&core.state, bus, inst, m.operand, pw, next_rip)?;
            push(&mut core.state, bus, pw, next_rip)?;
            core.state.set_rip(target);
        }
        Opcode::CallFarIndirect => {
            far_indirect(core, bus, inst, next_rip, true)?;
        }
        Opcode::RetNear => {
            let pw = push_pop_width(&core.state, inst);
            let target = pop(&mut core.state, bus, pw)?;
            core.state.set_rip(target);
        }
        Opcode::RetNearImm16 => {
            let pw = push_pop_width(&core.state, inst);
            let target = pop(&mut core.state, bus, pw)?;
            let imm = inst.immediate.unwrap() as u64;
            let sp_width = stack_width(&core.state);
            let sp = core.state.read_gpr(gpr::RSP, sp_width, false).wrapping_add(imm);
            core.state.write_gpr(gpr::RSP, sp_width, false, sp);
            core.state.set_rip(target);
        }
        Opcode::RetFar | Opcode::RetFarImm16 => {
            let pw = push_pop_width(&core.state, inst);
            let ip = pop(&mut core.state, bus, pw)?;
            let cs = pop(&mut core.state, bus, pw)? as u16;
            if matches!(inst.opcode, Opcode::RetFarImm16) {
                let imm = inst.immediate.unwrap() as u64;
                let sp_width = stack_width(&core.state);
                let sp = core.state.read_gpr(gpr::RSP, sp_width, false).wrapping_add(imm);
                core.state.write_gpr(gpr::RSP, sp_width, false, sp);
            }
            segmentation::load_segment_for(&mut core.state, bus, Segment::Cs, cs, LoadReason::CodeSegment)?;
            core.state.set_rip(ip);
        }
        Opcode::JmpRel8 | Opcode::JmpRel32 => {
            let rel = inst.immediate.unwrap();
            core.state.set_rip((next_rip as i64).wrapping_add(rel) as u64);
        }
        Opcode::JmpNearIndirect => {
            let m = inst.modrm.unwrap();
            let pw = push_pop_width(&core.state, inst);
            let target = read_rm(&core.state, bus, inst, m.operand, pw, next_rip)?;
            core.state.set_rip(target);
        }
        Opcode::JmpFarIndirect => {
            far_indirect(core, bus, inst, next_rip, false)?;
        }
        Opcode::JmpFarDirect => {
            let offset = inst.immediate.unwrap() as u64;
            let selector = inst.far_selector.unwrap();
            segmentation::load_segment_for(&mut core.state, bus, Segment::Cs, selector, LoadReason::CodeSegment)?;
            core.state.set_rip(offset);
        }
        Opcode::Jcc { cond, rel32: _ } => {
            if condition_true(&core.state, cond) {
                let rel = inst.immediate.unwrap();
                core.state.set_rip((next_rip as i64).wrapping_add(rel) as u64);
            }
        }
        Opcode::Group5 { digit } => {
            execute_group5(core, bus, inst, next_rip, digit, w)?;
        }

        Opcode::Int3 => core.raise_software_interrupt(3),
        Opcode::Int1 => core.raise_software_interrupt(1),
        Opcode::IntImm8 => {
            let vector = inst.immediate.unwrap() as u8;
            core.raise_software_interrupt(vector);
        }
        Opcode::Into => {
            if core.state.flag(RFLAGS_OF) {
                core.raise_software_interrupt(4);
            }
        }
        Opcode::Iret => core.iret(bus)?,

        Opcode::Hlt => return Ok(StepExit::Halted),
        Opcode::CliSti { enable } => {
            core.state.set_flag(RFLAGS_IF, enable);
            if enable {
                return Ok(StepExit::ContinueInhibitInterrupts);
            }
        }
        Opcode::CldStd { set } => core.state.set_flag(RFLAGS_DF, set),

        Opcode::MovCr { to_cr } => {
            let m = inst.modrm.unwrap();
            let cr_num = m.reg & 0x7;
            let gpr_slot = match m.operand {
                RmOperand::Register(slot) => slot,
                RmOperand::Memory(_) => return Err(Exception::InvalidOpcode),
            };
            if to_cr {
                let v = core.state.read_gpr(gpr_slot, RegisterWidth::Bits64, false);
                match cr_num {
                    0 => {
                        core.state.cr0 = v;
                        if core.state.ia32e_active() {
                            core.state.efer |= EFER_LMA;
                        }
                    }
                    2 => core.state.cr2 = v,
                    3 => core.state.cr3 = v,
                    4 => core.state.cr4 = v,
                    _ => return Err(Exception::InvalidOpcode),
                }
            } else {
                let v = match cr_num {
                    0 => core.state.cr0,
                    2 => core.state.cr2,
                    3 => core.state.cr3,
                    4 => core.state.cr4,
                    _ => return Err(Exception::InvalidOpcode),
                };
                core.state.write_gpr(gpr_slot, RegisterWidth::Bits64, false, v);
            }
        }

        Opcode::WrMsr => {
            let msr = core.state.read_gpr(gpr::RCX, RegisterWidth::Bits32, false) as u32;
            let lo = core.state.read_gpr(gpr::RAX, RegisterWidth::Bits32, false);
            let hi = core.state.read_gpr(gpr::RDX, RegisterWidth::Bits32, false);
            let value = lo | (hi << 32);
            if msr == MSR_EFER {
                core.state.efer = (core.state.efer & EFER_LMA) | (value & !EFER_LMA);
            }
        }
        Opcode::RdMsr => {
            let msr = core.state.read_gpr(gpr::RCX, RegisterWidth::Bits32, false) as u32;
            let value = if msr == MSR_EFER { core.state.efer } else { 0 };
            core.state.write_gpr(gpr::RAX, RegisterWidth::Bits32, false, value & 0xFFFF_FFFF);
            core.state.write_gpr(gpr::RDX, RegisterWidth::Bits32, false, value >> 32);
        }

        Opcode::In { imm, byte } => {
            let port = if imm {
                inst.immediate.unwrap() as u16
            } else {
                core.state.read_gpr(gpr::RDX, RegisterWidth::Bits16, false) as u16
            };
            if byte {
                let v = bus.io_read_u8(port);
                core.state.write_gpr(gpr::RAX, RegisterWidth::Low8, false, v as u64);
            } else if w == 16 {
                let v = bus.io_read_u16(port);
                core.state.write_gpr(gpr::RAX, RegisterWidth::Bits16, false, v as u64);
            } else {
                let v = bus.io_read_u32(port);
                core.state.write_gpr(gpr::RAX, RegisterWidth::Bits32, false, v as u64);
            }
        }
        Opcode::Out { imm, byte } => {
            let port = if imm {
                inst.immediate.unwrap() as u16
            } else {
                core.state.read_gpr(gpr::RDX, RegisterWidth::Bits16, false) as u16
            };
            if byte {
                let v = core.state.read_gpr(gpr::RAX, RegisterWidth::Low8, false) as u8;
                bus.io_write_u8(port, v);
            } else if w == 16 {
                let v = core.state.read_gpr(gpr::RAX, RegisterWidth::Bits16, false) as u16;
                bus.io_write_u16(port, v);
            } else {
                let v = core.state.read_gpr(gpr::RAX, RegisterWidth::Bits32, false) as u32;
                bus.io_write_u32(port, v);
            }
        }

        Opcode::Invalid => return Err(Exception::InvalidOpcode),
    }

    Ok(StepExit::Continue)
}

fn far_indirect(
    core: &mut CpuCore,
    bus: &mut impl CpuBus,
    inst: &DecodedInstruction,
    next_rip: u64,
    is_call: bool,
) -> Result<(), Exception> {
    let m = inst.modrm.unwrap();
    let mem = match m.operand {
        RmOperand::Memory(mem) => mem,
        RmOperand::Register(_) => return Err(Exception::InvalidOpcode),
    };
    let off_width = inst.operand_size;
    let addr = mem_linear_address(&core.state, inst, &mem, next_rip, off_width / 8 + 2)?;
    let offset = read_bus(bus, addr, off_width)?;
    let selector = read_bus(bus, addr + (off_width / 8) as u64, 16)? as u16;

    if is_call {
        let pw = push_pop_width(&core.state, inst);
        push(&mut core.state, bus, pw, core.state.segments.cs.selector as u64)?;
        push(&mut core.state, bus, pw, next_rip)?;
    }
    segmentation::load_segment_for(&mut core.state, bus, Segment::Cs, selector, LoadReason::CodeSegment)?;
    core.state.set_rip(offset);
    Ok(())
}

fn execute_group5(
    core: &mut CpuCore,
    bus: &mut impl CpuBus,
    inst: &DecodedInstruction,
    next_rip: u64,
    digit: u8,
    w: u32,
) -> Result<(), Exception> {
    let m = inst.modrm.unwrap();
    match digit {
        0 => {
            let v = read_rm(&core.state, bus, inst, m.operand, w, next_rip)?;
            flags::inc(&mut core.state, w, v);
            write_rm(&mut core.state, bus, inst, m.operand, w, next_rip, v.wrapping_add(1) & mask_for(w))?;
        }
        1 => {
            let v = read_rm(&core.state, bus, inst, m.operand, w, next_rip)?;
            flags::dec(&mut core.state, w, v);
            write_rm(&mut core.state, bus, inst, m.operand, w, next_rip, v.wrapping_sub(1) & mask_for(w))?;
        }
        2 => {
            let pw = push_pop_width(&core.state, inst);
            let target = read_rm(&core.state, bus, inst, m.operand, pw, next_rip)?;
            push(&mut core.state, bus, pw, next_rip)?;
            core.state.set_rip(target);
        }
        3 => far_indirect(core, bus, inst, next_rip, true)?,
        4 => {
            let pw = push_pop_width(&core.state, inst);
            let target = read_rm(&core.state, bus, inst, m.operand, pw, next_rip)?;
            core.state.set_rip(target);
        }
        5 => far_indirect(core, bus, inst, next_rip, false)?,
        6 => {
            let pw = push_pop_width(&core.state, inst);
            let v = read_rm(&core.state, bus, inst, m.operand, pw, next_rip)?;
            push(&mut core.state, bus, pw, v)?;
        }
        _ => return Err(Exception::InvalidOpcode),
    }
    Ok(())
}

fn alu_compute(state: &mut CpuState, op: AluOp, w: u32, dst: u64, src: u64) -> u64 {
    let mask = mask_for(w);
    match op {
        AluOp::Add => {
            flags::add(state, w, dst, src, 0);
            (dst.wrapping_add(src)) & mask
        }
        AluOp::Adc => {
            let cin = state.flag(RFLAGS_CF) as u64;
            flags::add(state, w, dst, src, cin);
            (dst.wrapping_add(src).wrapping_add(cin)) & mask
        }
        AluOp::Sub | AluOp::Cmp => {
            flags::sub(state, w, dst, src, 0);
            (dst.wrapping_sub(src)) & mask
        }
        AluOp::Sbb => {
            let bin = state.flag(RFLAGS_CF) as u64;
            flags::sub(state, w, dst, src, bin);
            (dst.wrapping_sub(src).wrapping_sub(bin)) & mask
        }
        AluOp::And => {
            let r = dst & src & mask;
            flags::logical(state, w, r);
            r
        }
        AluOp::Or => {
            let r = (dst | src) & mask;
            flags::logical(state, w, r);
            r
        }
        AluOp::Xor => {
            let r = (dst ^ src) & mask;
            flags::logical(state, w, r);
            r
        }
    }
}

fn execute_alu(
    core: &mut CpuCore,
    bus: &mut impl CpuBus,
    inst: &DecodedInstruction,
    next_rip: u64,
    op: AluOp,
    rm_is_dst: bool,
    has_imm: bool,
    w: u32,
) -> Result<(), Exception> {
    if has_imm {
        // AL,imm8 (0x04/0x0C/...) vs eAX,imm (0x05/0x0D/...): rm_is_dst is always
        // true for these accumulator forms.
        let w = byte_vs_full(inst.opcode_byte, w);
        let dst = core.state.read_gpr(gpr::RAX, width_bits(w), false);
        let imm = sign_extend_to(inst.immediate.unwrap() as u64, if w == 8 { 8 } else { 32.min(w) }, w);
        let result = alu_compute(&mut core.state, op, w, dst, imm);
        if op != AluOp::Cmp {
            core.state.write_gpr(gpr::RAX, width_bits(w), false, result);
        }
        return Ok(());
    }

    let w = byte_vs_full(inst.opcode_byte, w);
    let m = inst.modrm.unwrap();
    let reg = reg_register(inst, m.reg, w);
    if rm_is_dst {
        let dst = read_rm(&core.state, bus, inst, m.operand, w, next_rip)?;
        let src = core.state.read_reg(reg);
        let result = alu_compute(&mut core.state, op, w, dst, src);
        if op != AluOp::Cmp {
            write_rm(&mut core.state, bus, inst, m.operand, w, next_rip, result)?;
        }
    } else {
        let dst = core.state.read_reg(reg);
        let src = read_rm(&core.state, bus, inst, m.operand, w, next_rip)?;
        let result = alu_compute(&mut core.state, op, w, dst, src);
        if op != AluOp::Cmp {
            core.state.write_reg(reg, result);
        }
    }
    Ok(())
}

fn execute_shift(
    core: &mut CpuCore,
    bus: &mut impl CpuBus,
    inst: &DecodedInstruction,
    next_rip: u64,
    op: ShiftOp,
    by_cl: bool,
    by_one: bool,
    w: u32,
) -> Result<(), Exception> {
    let m = inst.modrm.unwrap();
    let count_mask = if w == 64 { 0x3F } else { 0x1F };
    let count = if by_one {
        1u32
    } else if by_cl {
        (core.state.read_gpr(gpr::RCX, RegisterWidth::Low8, false) as u32) & count_mask
    } else {
        (inst.immediate.unwrap() as u32) & count_mask
    };

    let v = read_rm(&core.state, bus, inst, m.operand, w, next_rip)?;
    if count == 0 {
        return Ok(());
    }
    let mask = mask_for(w);
    let bits = w as u64;
    let (result, last_out, overflow) = match op {
        ShiftOp::Shl | ShiftOp::Sal => {
            let shifted = v.wrapping_shl(count) & mask;
            let last = if count as u64 <= bits {
                (v >> (bits - count as u64)) & 1 != 0
            } else {
                false
            };
            let of = (shifted >> (bits - 1)) & 1 != (v >> (bits.saturating_sub(2))) & 1;
            (shifted, last, of)
        }
        ShiftOp::Shr => {
            let last = if count >= 1 { (v >> (count - 1)) & 1 != 0 } else { false };
            let shifted = (v & mask) >> count;
            let of = (v >> (bits - 1)) & 1 != 0;
            (shifted, last, of)
        }
        ShiftOp::Sar => {
            let signed = sign_extend_to(v, w, 64) as i64;
            let last = if count >= 1 { (v >> (count - 1)) & 1 != 0 } else { false };
            let shifted = ((signed >> count) as u64) & mask;
            (shifted, last, false)
        }
        ShiftOp::Rol => {
            let c = (count as u64) % bits;
            let rotated = if c == 0 { v & mask } else { ((v << c) | (v >> (bits - c))) & mask };
            let last = rotated & 1 != 0;
            let of = (rotated >> (bits - 1)) & 1 != (v >> (bits - 1)) & 1;
            (rotated, last, of)
        }
        ShiftOp::Ror => {
            let c = (count as u64) % bits;
            let rotated = if c == 0 { v & mask } else { ((v >> c) | (v << (bits - c))) & mask };
            let last = (rotated >> (bits - 1)) & 1 != 0;
            let of = (rotated >> (bits - 1)) & 1 != (rotated >> (bits - 2).max(0)) & 1;
            (rotated, last, of)
        }
        ShiftOp::Rcl => {
            let cin = core.state.flag(RFLAGS_CF) as u64;
            let extended = (v & mask) | (cin << bits);
            let total_bits = bits + 1;
            let c = (count as u64) % total_bits;
            let rotated_ext = if c == 0 { extended } else { ((extended << c) | (extended >> (total_bits - c))) & ((1u64 << total_bits) - 1) };
            let result = rotated_ext & mask;
            let last = (rotated_ext >> bits) & 1 != 0;
            (result, last, false)
        }
        ShiftOp::Rcr => {
            let cin = core.state.flag(RFLAGS_CF) as u64;
            let extended = (v & mask) | (cin << bits);
            let total_bits = bits + 1;
            let c = (count as u64) % total_bits;
            let rotated_ext = if c == 0 { extended } else { ((extended >> c) | (extended << (total_bits - c))) & ((1u64 << total_bits) - 1) };
            let result = rotated_ext & mask;
            let last = (rotated_ext >> bits) & 1 != 0;
            (result, last, false)
        }
    };

    flags::set_result_flags(&mut core.state, w, result);
    core.state.set_flag(RFLAGS_CF, last_out);
    if count == 1 {
        core.state.set_flag(RFLAGS_OF, overflow);
    }
    write_rm(&mut core.state, bus, inst, m.operand, w, next_rip, result)?;
    Ok(())
}

fn execute_group3(
    core: &mut CpuCore,
    bus: &mut impl CpuBus,
    inst: &DecodedInstruction,
    next_rip: u64,
    op: Group3Op,
    w: u32,
) -> Result<StepExit, Exception> {
    let m = inst.modrm.unwrap();
    match op {
        Group3Op::Test | Group3Op::Test2 => {
            let v = read_rm(&core.state, bus, inst, m.operand, w, next_rip)?;
            let imm = inst.immediate.unwrap() as u64 & mask_for(w);
            flags::logical(&mut core.state, w, v & imm);
        }
        Group3Op::Not => {
            let v = read_rm(&core.state, bus, inst, m.operand, w, next_rip)?;
            write_rm(&mut core.state, bus, inst, m.operand, w, next_rip, !v & mask_for(w))?;
        }
        Group3Op::Neg => {
            let v = read_rm(&core.state, bus, inst, m.operand, w, next_rip)?;
            flags::neg(&mut core.state, w, v);
            write_rm(&mut core.state, bus, inst, m.operand, w, next_rip, 0u64.wrapping_sub(v) & mask_for(w))?;
        }
        Group3Op::Mul => {
            let src = read_rm(&core.state, bus, inst, m.operand, w, next_rip)?;
            let a = core.state.read_gpr(gpr::RAX, width_bits(w), false);
            let product = (a as u128) * (src as u128);
            let mask = mask_for(w) as u128;
            let low = (product & mask) as u64;
            let high = (product >> w) as u64;
            core.state.write_gpr(gpr::RAX, width_bits(w), false, low);
            if w == 8 {
                core.state.write_gpr(gpr::RAX, RegisterWidth::Low8High, true, high);
            } else {
                core.state.write_gpr(gpr::RDX, width_bits(w), false, high);
            }
            let carry = high != 0;
            core.state.set_flag(RFLAGS_CF, carry);
            core.state.set_flag(RFLAGS_OF, carry);
        }
        Group3Op::Imul => {
            let src = read_rm(&core.state, bus, inst, m.operand, w, next_rip)?;
            let a = sign_extend_to(core.state.read_gpr(gpr::RAX, width_bits(w), false), w, 64) as i64;
            let s = sign_extend_to(src, w, 64) as i64;
            let product = (a as i128) * (s as i128);
            let mask = mask_for(w) as u128;
            let low = (product as u128 & mask) as u64;
            let high = ((product as u128) >> w) as u64;
            core.state.write_gpr(gpr::RAX, width_bits(w), false, low);
            if w == 8 {
                core.state.write_gpr(gpr::RAX, RegisterWidth::Low8High, true, high);
            } else {
                core.state.write_gpr(gpr::RDX, width_bits(w), false, high);
            }
            let sign_ext_of_low = sign_extend_to(low, w, 64) as i64 as i128;
            let carry = product != sign_ext_of_low;
            core.state.set_flag(RFLAGS_CF, carry);
            core.state.set_flag(RFLAGS_OF, carry);
        }
        Group3Op::Div => {
            let src = read_rm(&core.state, bus, inst, m.operand, w, next_rip)?;
            if src == 0 {
                return Err(Exception::DivideError);
            }
            let (dividend, mask): (u128, u128) = if w == 8 {
                (core.state.read_gpr(gpr::RAX, RegisterWidth::Bits16, false) as u128, mask_for(w) as u128)
            } else {
                let low = core.state.read_gpr(gpr::RAX, width_bits(w), false) as u128;
                let high = if w == 64 { core.state.read_gpr(gpr::RDX, RegisterWidth::Bits64, false) as u128 } else { core.state.read_gpr(gpr::RDX, width_bits(w), false) as u128 };
                (low | (high << w), mask_for(w) as u128)
            };
            let divisor = src as u128;
            let quotient = dividend / divisor;
            let remainder = dividend % divisor;
            if quotient > mask {
                return Err(Exception::DivideError);
            }
            core.state.write_gpr(gpr::RAX, width_bits(w), false, quotient as u64);
            if w == 8 {
                core.state.write_gpr(gpr::RAX, RegisterWidth::Low8High, true, remainder as u64);
            } else {
                core.state.write_gpr(gpr::RDX, width_bits(w), false, remainder as u64);
            }
        }
        Group3Op::Idiv => {
            let src = read_rm(&core.state, bus, inst, m.operand, w, next_rip)?;
            if src == 0 {
                return Err(Exception::DivideError);
            }
            let (dividend, divisor): (i128, i128) = if w == 8 {
                (
                    sign_extend_to(core.state.read_gpr(gpr::RAX, RegisterWidth::Bits16, false), 16, 64) as i64 as i128,
                    sign_extend_to(src, w, 64) as i64 as i128,
                )
            } else {
                let low = core.state.read_gpr(gpr::RAX, width_bits(w), false) as u128;
                let high = core.state.read_gpr(gpr::RDX, width_bits(w), false) as u128;
                let full = (low | (high << w)) as i128;
                let signed = if w < 64 {
                    let shift = 128 - 2 * w as u32;
                    (full << shift) >> shift
                } else {
                    full
                };
                (signed, sign_extend_to(src, w, 64) as i64 as i128)
            };
            let quotient = dividend / divisor;
            let remainder = dividend % divisor;
            let (qmin, qmax): (i128, i128) = match w {
                8 => (i8::MIN as i128, i8::MAX as i128),
                16 => (i16::MIN as i128, i16::MAX as i128),
                32 => (i32::MIN as i128, i32::MAX as i128),
                64 => (i64::MIN as i128, i64::MAX as i128),
                _ => unreachable!(),
            };
            if quotient < qmin || quotient > qmax {
                return Err(Exception::DivideError);
            }
            let q = (quotient as i64 as u64) & mask_for(w);
            let r = (remainder as i64 as u64) & mask_for(w);
            core.state.write_gpr(gpr::RAX, width_bits(w), false, q);
            if w == 8 {
                core.state.write_gpr(gpr::RAX, RegisterWidth::Low8High, true, r);
            } else {
                core.state.write_gpr(gpr::RDX, width_bits(w), false, r);
            }
        }
    }
    Ok(StepExit::Continue)
}

fn execute_string(
    core: &mut CpuCore,
    bus: &mut impl CpuBus,
    inst: &DecodedInstruction,
    op: StringOp,
    width: StringWidth,
) -> Result<(), Exception> {
    let elem_w = string_element_width(width, inst.operand_size);
    let df = core.state.flag(RFLAGS_DF);
    let step = string_step(df, (elem_w / 8) as u64);
    let addr_w = width_bits(if core.state.mode().is_64bit() { 64 } else { inst.address_size });

    let rep = inst.prefixes.rep;
    let repne = inst.prefixes.repne;
    let has_rep = rep || repne;

    loop {
        let mut rcx = core.state.read_gpr(gpr::RCX, addr_w, false);
        if has_rep && rcx == 0 {
            break;
        }

        match op {
            StringOp::Movs => {
                let src_off = core.state.read_gpr(gpr::RSI, addr_w, false);
                let dst_off = core.state.read_gpr(gpr::RDI, addr_w, false);
                let src_seg = inst.prefixes.segment_override.unwrap_or(Segment::Ds);
                let src_addr = segmentation::linear_address(&core.state, src_seg, src_off);
                let dst_addr = segmentation::linear_address(&core.state, Segment::Es, dst_off);
                let v = read_bus(bus, src_addr, elem_w)?;
                write_bus(bus, dst_addr, elem_w, v)?;
                core.state.write_gpr(gpr::RSI, addr_w, false, (src_off as i64).wrapping_add(step) as u64);
                core.state.write_gpr(gpr::RDI, addr_w, false, (dst_off as i64).wrapping_add(step) as u64);
            }
            StringOp::Stos => {
                let dst_off = core.state.read_gpr(gpr::RDI, addr_w, false);
                let dst_addr = segmentation::linear_address(&core.state, Segment::Es, dst_off);
                let a = core.state.read_gpr(gpr::RAX, width_bits(elem_w), false);
                write_bus(bus, dst_addr, elem_w, a)?;
                core.state.write_gpr(gpr::RDI, addr_w, false, (dst_off as i64).wrapping_add(step) as u64);
            }
            StringOp::Lods => {
                let src_off = core.state.read_gpr(gpr::RSI, addr_w, false);
                let src_seg = inst.prefixes.segment_override.unwrap_or(Segment::Ds);
                let src_addr = segmentation::linear_address(&core.state, src_seg, src_off);
                let v = read_bus(bus, src_addr, elem_w)?;
                core.state.write_gpr(gpr::RAX, width_bits(elem_w), false, v);
                core.state.write_gpr(gpr::RSI, addr_w, false, (src_off as i64).wrapping_add(step) as u64);
            }
            StringOp::Scas => {
                let dst_off = core.state.read_gpr(gpr::RDI, addr_w, false);
                let dst_addr = segmentation::linear_address(&core.state, Segment::Es, dst_off);
                let mem_v = read_bus(bus, dst_addr, elem_w)?;
                let a = core.state.read_gpr(gpr::RAX, width_bits(elem_w), false);
                flags::sub(&mut core.state, elem_w, a, mem_v, 0);
                core.state.write_gpr(gpr::RDI, addr_w, false, (dst_off as i64).wrapping_add(step) as u64);
            }
            StringOp::Cmps => {
                let src_off = core.state.read_gpr(gpr::RSI, addr_w, false);
                let dst_off = core.state.read_gpr(gpr::RDI, addr_w, false);
                let src_seg = inst.prefixes.segment_override.unwrap_or(Segment::Ds);
                let src_addr = segmentation::linear_address(&core.state, src_seg, src_off);
                let dst_addr = segmentation::linear_address(&core.state, Segment::Es, dst_off);
                let a = read_bus(bus, src_addr, elem_w)?;
                let b = read_bus(bus, dst_addr, elem_w)?;
                flags::sub(&mut core.state, elem_w, a, b, 0);
                core.state.write_gpr(gpr::RSI, addr_w, false, (src_off as i64).wrapping_add(step) as u64);
                core.state.write_gpr(gpr::RDI, addr_w, false, (dst_off as i64).wrapping_add(step) as u64);
            }
        }

        if !has_rep {
            break;
        }
        rcx = rcx.wrapping_sub(1);
        core.state.write_gpr(gpr::RCX, addr_w, false, rcx);
        if rcx == 0 {
            break;
        }
        if repne && matches!(op, StringOp::Scas | StringOp::Cmps) {
            let zf = core.state.flag(RFLAGS_ZF);
            if zf {
                break;
            }
        } else if rep && matches!(op, StringOp::Scas | StringOp::Cmps) {
            let zf = core.state.flag(RFLAGS_ZF);
            if !zf {
                break;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::FlatTestBus;
    use crate::state::{CpuMode, CpuState};

    fn exec_bytes(state: CpuState, code: &[u8]) -> (CpuCore, FlatTestBus) {
        let mut core = CpuCore::new(state);
        let mut bus = FlatTestBus::new(0x10_0000);
        bus.write_bytes(core.state.rip(), code).unwrap();
        step(&mut core, &mut bus).unwrap();
        (core, bus)
    }

    fn protected32_state() -> CpuState {
        let mut s = CpuState::power_on();
        s.cr0 |= CR0_PE;
        s.segments.cs.default_big = true;
        // Protected mode always resolves linear addresses through the cached
        // descriptor base; power-on leaves CS's real-mode BIOS-reset base
        // (0xFFFF0000) in place, which would push every fetch outside the test
        // bus. A freshly-entered protected mode flat code segment starts at 0.
        s.segments.cs.base = 0;
        s
    }

    #[test]
    fn cmp_eax_ecx_boundary_scenario_1() {
        let mut s = protected32_state();
        s.write_gpr(gpr::RAX, RegisterWidth::Bits32, false, 0x8000_0001);
        s.write_gpr(gpr::RCX, RegisterWidth::Bits32, false, 0x8000_0000);
        // CMP EAX,ECX = 0x39 0xC8 (rm,r form, rm=EAX is dst)
        let (core, _bus) = exec_bytes(s, &[0x39, 0xC8]);
        assert!(!core.state.flag(RFLAGS_ZF));
        assert!(!core.state.flag(RFLAGS_CF));
    }

    fn long_mode_state() -> CpuState {
        let mut s = CpuState::power_on();
        s.cr4 |= CR4_PAE;
        s.efer |= EFER_LME | EFER_LMA;
        s.cr0 |= CR0_PE | CR0_PG;
        s.segments.cs.long_mode = true;
        s
    }

    #[test]
    fn adc_rax_rbx_boundary_scenario_2() {
        let mut s = long_mode_state();
        s.write_gpr(gpr::RAX, RegisterWidth::Bits64, false, 0xFFFF_FFFF_FFFF_FFFF);
        s.write_gpr(gpr::RBX, RegisterWidth::Bits64, false, 0);
        s.set_flag(RFLAGS_CF, true);
        // REX.W ADC RAX,RBX = 48 11 D8
        let (core, _bus) = exec_bytes(s, &[0x48, 0x11, 0xD8]);
        assert_eq!(core.state.read_gpr(gpr::RAX, RegisterWidth::Bits64, false), 0);
        assert!(core.state.flag(RFLAGS_CF));
        assert!(core.state.flag(RFLAGS_ZF));
        assert!(core.state.flag(RFLAGS_AF));
        assert!(core.state.flag(RFLAGS_PF));
    }

    #[test]
    fn scasq_boundary_scenario_3() {
        let mut s = long_mode_state();
        s.write_gpr(gpr::RAX, RegisterWidth::Bits64, false, 0xFFFF_FFFF_FFFF_FFFF);
        s.write_gpr(gpr::RDI, RegisterWidth::Bits64, false, 0x2000);
        s.set_flag(RFLAGS_DF, false);
        let mut core = CpuCore::new(s);
        let mut bus = FlatTestBus::new(0x10_0000);
        bus.write_u64(0x2000, 0).unwrap();
        // REX.W SCASQ = 48 AF
        bus.write_bytes(core.state.rip(), &[0x48, 0xAF]).unwrap();
        step(&mut core, &mut bus).unwrap();
        assert!(!core.state.flag(RFLAGS_CF));
        assert!(!core.state.flag(RFLAGS_ZF));
        assert!(core.state.flag(RFLAGS_SF));
        assert_eq!(core.state.read_gpr(gpr::RDI, RegisterWidth::Bits64, false), 0x2008);
    }

    #[test]
    fn div_quotient_overflow_raises_de_boundary_scenario_4() {
        let mut s = long_mode_state();
        s.write_gpr(gpr::RDX, RegisterWidth::Bits64, false, 1);
        s.write_gpr(gpr::RAX, RegisterWidth::Bits64, false, 0);
        s.write_gpr(gpr::RCX, RegisterWidth::Bits64, false, 1);
        let mut core = CpuCore::new(s);
        let mut bus = FlatTestBus::new(0x10_0000);
        // REX.W DIV RCX = 48 F7 F1
        bus.write_bytes(core.state.rip(), &[0x48, 0xF7, 0xF1]).unwrap();
        let exit = step(&mut core, &mut bus).unwrap();
        assert_eq!(exit, StepExit::Fault(Exception::DivideError));
    }

    #[test]
    fn six_lock_prefixes_then_and_boundary_scenario_8() {
        let mut s = protected32_state();
        s.write_gpr(gpr::RAX, RegisterWidth::Bits32, false, 0xF0F0_F0F0);
        s.write_gpr(gpr::RBX, RegisterWidth::Bits32, false, 0x0F0F_0F0F);
        let mut code = vec![0xF0u8; 6];
        code.push(0x21);
        code.push(0xD8);
        let (core, _bus) = exec_bytes(s, &code);
        assert_eq!(core.state.read_gpr(gpr::RAX, RegisterWidth::Bits32, false), 0);
        assert!(core.state.flag(RFLAGS_ZF));
        assert_eq!(core.state.rip(), 8);
    }

    #[test]
    fn xchg_round_trips_and_leaves_flags_unchanged() {
        let mut s = protected32_state();
        s.write_gpr(gpr::RAX, RegisterWidth::Bits32, false, 0x11);
        s.write_gpr(gpr::RBX, RegisterWidth::Bits32, false, 0x22);
        s.set_flag(RFLAGS_CF, true);
        // XCHG EAX,EBX = 0x93
        let (core, _bus) = exec_bytes(s, &[0x93]);
        assert_eq!(core.state.read_gpr(gpr::RAX, RegisterWidth::Bits32, false), 0x22);
        assert_eq!(core.state.read_gpr(gpr::RBX, RegisterWidth::Bits32, false), 0x11);
        assert!(core.state.flag(RFLAGS_CF));
    }

    #[test]
    fn nop_is_xchg_self() {
        let s = protected32_state();
        let (core, _bus) = exec_bytes(s, &[0x90]);
        assert_eq!(core.state.rip(), 1);
    }

    #[test]
    fn imul_reg_rm_imm32_sets_carry_on_truncation() {
        let mut s = protected32_state();
        s.write_gpr(gpr::RBX, RegisterWidth::Bits32, false, 0x1000);
        // IMUL EAX, EBX, 0x10000 = 0x69 0xC3 00 00 01 00
        let (core, _bus) = exec_bytes(s, &[0x69, 0xC3, 0x00, 0x00, 0x01, 0x00]);
        assert_eq!(core.state.read_gpr(gpr::RAX, RegisterWidth::Bits32, false), 0x1000_0000);
        assert!(!core.state.flag(RFLAGS_CF));
        assert!(!core.state.flag(RFLAGS_OF));
    }

    #[test]
    fn imul_reg_rm_imm8_sign_extends_and_flags_overflow() {
        let mut s = protected32_state();
        s.write_gpr(gpr::RCX, RegisterWidth::Bits32, false, 0x7FFF_FFFF);
        // IMUL EAX, ECX, -1 = 0x6B 0xC1 0xFF
        let (core, _bus) = exec_bytes(s, &[0x6B, 0xC1, 0xFF]);
        assert_eq!(core.state.read_gpr(gpr::RAX, RegisterWidth::Bits32, false), 0x8000_0001);
        assert!(core.state.flag(RFLAGS_CF));
        assert!(core.state.flag(RFLAGS_OF));
    }

    #[test]
    fn ia32e_activation_then_far_jmp_enters_64bit_submode_boundary_scenarios_5_and_6() {
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

        let mut s = protected32_state();
        s.set_rip(0);
        s.gdtr.base = 0x1000;
        s.gdtr.limit = 0xFFFF;

        let mut core = CpuCore::new(s);
        let mut bus = FlatTestBus::new(0x10_0000);

        // GDT[2] (selector 0x10): flat 4GiB code descriptor with L=1, D=0 — a
        // 64-bit sub-mode code segment (flags nibble: G=1,D/B=0,L=1,AVL=0 = 0xA).
        let desc = gdt_descriptor(0, 0xFFFFF, 0x9A, 0xA);
        bus.write_bytes(0x1000 + 2 * 8, &desc).unwrap();

        // Far pointer operand for JMP FAR [0x2000]: offset32=0x1234, selector=0x10.
        bus.write_bytes(0x2000, &0x1234u32.to_le_bytes()).unwrap();
        bus.write_bytes(0x2004, &0x0010u16.to_le_bytes()).unwrap();

        // MOV EAX,0x20 ; MOV CR4,EAX ; MOV ECX,0xC0000080 ; MOV EAX,0x100 ;
        // MOV EDX,0 ; WRMSR ; MOV EAX,0x80000001 ; MOV CR0,EAX ; JMP FAR [0x2000]
        let code: &[u8] = &[
            0xB8, 0x20, 0x00, 0x00, 0x00, // MOV EAX, 0x20
            0x0F, 0x22, 0xE0, // MOV CR4, EAX
            0xB9, 0x80, 0x00, 0x00, 0xC0, // MOV ECX, 0xC0000080 (MSR_EFER)
            0xB8, 0x00, 0x01, 0x00, 0x00, // MOV EAX, 0x100 (EFER.LME)
            0xBA, 0x00, 0x00, 0x00, 0x00, // MOV EDX, 0
            0x0F, 0x30, // WRMSR
            0xB8, 0x01, 0x00, 0x00, 0x80, // MOV EAX, 0x80000001 (CR0.PG|CR0.PE)
            0x0F, 0x22, 0xC0, // MOV CR0, EAX
            0xFF, 0x2D, 0x00, 0x20, 0x00, 0x00, // JMP FAR [0x00002000]
        ];
        bus.write_bytes(0, code).unwrap();

        for _ in 0..9 {
            let exit = step(&mut core, &mut bus).unwrap();
            assert_eq!(exit, StepExit::Continue);
        }

        assert!(core.state.ia32e_active());
        assert_eq!(core.state.efer & EFER_LMA, EFER_LMA);
        assert_eq!(core.state.mode(), CpuMode::Long64);
        assert_eq!(core.state.rip(), 0x1234);
        assert_eq!(core.state.segments.cs.selector, 0x10);
    }

    #[test]
    fn direct_far_jmp_loads_selector_and_offset() {
        // Real mode: loading CS from a far JMP only updates the visible selector
        // (no GDT lookup), so this form is free of descriptor setup.
        let s = CpuState::power_on();
        // 0x66 JMP FAR 0008:00001234 = 66 EA 34 12 00 00 08 00
        let (core, _bus) = exec_bytes(s, &[0x66, 0xEA, 0x34, 0x12, 0x00, 0x00, 0x08, 0x00]);
        assert_eq!(core.state.rip(), 0x1234);
        assert_eq!(core.state.segments.cs.selector, 0x0008);
    }

    struct PortBus {
        ram: FlatTestBus,
        last_out: Option<(u16, u32)>,
        next_in: u32,
    }

    impl CpuBus for PortBus {
        fn read_u8(&mut self, linear: u64) -> Result<u8, crate::mem::MemFault> { self.ram.read_u8(linear) }
        fn read_u16(&mut self, linear: u64) -> Result<u16, crate::mem::MemFault> { self.ram.read_u16(linear) }
        fn read_u32(&mut self, linear: u64) -> Result<u32, crate::mem::MemFault> { self.ram.read_u32(linear) }
        fn read_u64(&mut self, linear: u64) -> Result<u64, crate::mem::MemFault> { self.ram.read_u64(linear) }
        fn write_u8(&mut self, linear: u64, v: u8) -> Result<(), crate::mem::MemFault> { self.ram.write_u8(linear, v) }
        fn write_u16(&mut self, linear: u64, v: u16) -> Result<(), crate::mem::MemFault> { self.ram.write_u16(linear, v) }
        fn write_u32(&mut self, linear: u64, v: u32) -> Result<(), crate::mem::MemFault> { self.ram.write_u32(linear, v) }
        fn write_u64(&mut self, linear: u64, v: u64) -> Result<(), crate::mem::MemFault> { self.ram.write_u64(linear, v) }
        fn read_bytes(&mut self, linear: u64, buf: &mut [u8]) -> Result<(), crate::mem::MemFault> { self.ram.read_bytes(linear, buf) }
        fn write_bytes(&mut self, linear: u64, data: &[u8]) -> Result<(), crate::mem::MemFault> { self.ram.write_bytes(linear, data) }
        fn io_read_u8(&mut self, _port: u16) -> u8 { self.next_in as u8 }
        fn io_write_u8(&mut self, port: u16, value: u8) {
            self.last_out = Some((port, value as u32));
        }
    }

    #[test]
    fn out_dx_al_writes_port_and_in_al_dx_reads_it_back() {
        let mut s = protected32_state();
        s.write_gpr(gpr::RDX, RegisterWidth::Bits16, false, 0x3F8);
        s.write_gpr(gpr::RAX, RegisterWidth::Low8, false, b'A' as u64);
        let mut core = CpuCore::new(s);
        let mut bus = PortBus {
            ram: FlatTestBus::new(0x1000),
            last_out: None,
            next_in: 0x42,
        };
        bus.ram.write_bytes(core.state.rip(), &[0xEE]).unwrap(); // OUT DX, AL
        step(&mut core, &mut bus).unwrap();
        assert_eq!(bus.last_out, Some((0x3F8, b'A' as u32)));

        bus.ram.write_bytes(core.state.rip(), &[0xEC]).unwrap(); // IN AL, DX
        step(&mut core, &mut bus).unwrap();
        assert_eq!(core.state.read_gpr(gpr::RAX, RegisterWidth::Low8, false), 0x42);
    }
}
