//! Prefix-tolerant x86/x86-64 instruction decoder (§4.1).
//!
//! The decoder is a pure function from a byte window plus mode context to a
//! [`DecodedInstruction`]; it owns no CPU state and performs no memory access of its
//! own — `aero-cpu-core` supplies the bytes (already fetched through the segmentation
//! unit) and interprets the result.

#![forbid(unsafe_code)]

pub mod modrm;
pub mod opcode;

use thiserror::Error;

pub use aero_x86::Segment;
pub use modrm::{MemOperand, ModRm, RmOperand};
pub use opcode::Opcode;

/// The architectural width the decoder is currently operating at. This is a pure
/// width tag — it says nothing about privilege or paging, only how many address/
/// operand-size bytes the legacy mode defaults to before prefixes are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    Bits16,
    Bits32,
    Bits64,
}

impl DecodeMode {
    fn default_operand_size(self) -> u32 {
        match self {
            DecodeMode::Bits16 => 16,
            DecodeMode::Bits32 => 32,
            DecodeMode::Bits64 => 32,
        }
    }

    fn default_address_size(self) -> u32 {
        match self {
            DecodeMode::Bits16 => 16,
            DecodeMode::Bits32 => 32,
            DecodeMode::Bits64 => 64,
        }
    }

    fn is_64bit(self) -> bool {
        matches!(self, DecodeMode::Bits64)
    }
}

/// The longest an x86 instruction is architecturally permitted to be, including every
/// prefix, opcode, ModR/M, SIB, displacement, and immediate byte.
pub const MAX_INSTRUCTION_LEN: usize = 15;

/// REX prefix fields, latched for exactly one instruction (§3 "REX prefix latch").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rex {
    pub w: bool,
    pub r: bool,
    pub x: bool,
    pub b: bool,
}

impl Rex {
    fn from_byte(byte: u8) -> Rex {
        Rex {
            w: byte & 0x8 != 0,
            r: byte & 0x4 != 0,
            x: byte & 0x2 != 0,
            b: byte & 0x1 != 0,
        }
    }
}

/// All legacy prefixes plus the REX latch observed ahead of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Prefixes {
    pub segment_override: Option<Segment>,
    pub operand_size_override: bool,
    pub address_size_override: bool,
    pub lock: bool,
    pub rep: bool,
    pub repne: bool,
    pub rex: Option<Rex>,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("instruction stream ended before decode could complete")]
    UnexpectedEof,
    #[error("opcode byte {0:#04x} is invalid in the active mode")]
    InvalidOpcode(u8),
    #[error("instruction exceeds the architectural {MAX_INSTRUCTION_LEN}-byte maximum")]
    TooLong,
    #[error("ModR/M or SIB byte missing or truncated")]
    TruncatedModRm,
}

impl From<modrm::ModRmError> for DecodeError {
    fn from(e: modrm::ModRmError) -> Self {
        match e {
            modrm::ModRmError::Truncated => DecodeError::TruncatedModRm,
        }
    }
}

/// A fully decoded instruction: prefixes, the classified opcode, optional ModR/M, and
/// the raw immediate bytes (already width-resolved by the caller via `immediate`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedInstruction {
    pub prefixes: Prefixes,
    pub opcode: Opcode,
    pub opcode_byte: u8,
    pub is_0f: bool,
    pub modrm: Option<ModRm>,
    pub immediate: Option<i64>,
    /// The 16-bit segment selector trailing a direct far JMP's offset (`JmpFarDirect`
    /// only); `immediate` holds the offset in that case, sized by `operand_size`.
    pub far_selector: Option<u16>,
    pub operand_size: u32,
    pub address_size: u32,
    /// Total length in bytes, prefixes through the last immediate byte.
    pub length: usize,
}

/// Scans leading prefix bytes starting at `bytes[0]`, without requiring a valid
/// opcode to follow. Returns the accumulated prefix state and the number of prefix
/// bytes consumed (REX, if any, is included in the count). Tolerates arbitrarily many
/// redundant prefix bytes, per §4.1 ("six LOCK prefixes then a 2-byte AND").
pub fn scan_prefixes(mode: DecodeMode, bytes: &[u8]) -> Result<(Prefixes, usize), DecodeError> {
    let mut prefixes = Prefixes::default();
    let mut i = 0usize;

    loop {
        let Some(&byte) = bytes.get(i) else {
            return Err(DecodeError::UnexpectedEof);
        };
        match byte {
            0x26 => {
                prefixes.segment_override = Some(Segment::Es);
                prefixes.rex = None;
            }
            0x2E => {
                prefixes.segment_override = Some(Segment::Cs);
                prefixes.rex = None;
            }
            0x36 => {
                prefixes.segment_override = Some(Segment::Ss);
                prefixes.rex = None;
            }
            0x3E => {
                prefixes.segment_override = Some(Segment::Ds);
                prefixes.rex = None;
            }
            0x64 => {
                prefixes.segment_override = Some(Segment::Fs);
                prefixes.rex = None;
            }
            0x65 => {
                prefixes.segment_override = Some(Segment::Gs);
                prefixes.rex = None;
            }
            0x66 => {
                prefixes.operand_size_override = true;
                prefixes.rex = None;
            }
            0x67 => {
                prefixes.address_size_override = true;
                prefixes.rex = None;
            }
            0xF0 => {
                prefixes.lock = true;
                prefixes.rex = None;
            }
            0xF2 => {
                prefixes.repne = true;
                prefixes.rep = false;
                prefixes.rex = None;
            }
            0xF3 => {
                prefixes.rep = true;
                prefixes.repne = false;
                prefixes.rex = None;
            }
            0x40..=0x4F if mode.is_64bit() => {
                // The last REX byte before the opcode wins; any legacy prefix after it
                // (handled above by resetting `rex = None`) invalidates an earlier one.
                prefixes.rex = Some(Rex::from_byte(byte));
            }
            _ => break,
        }
        i += 1;
    }

    Ok((prefixes, i))
}

/// Scans prefixes and returns only the accumulated state, discarding the byte count.
pub fn decode_prefixes(mode: DecodeMode, bytes: &[u8]) -> Result<Prefixes, DecodeError> {
    scan_prefixes(mode, bytes).map(|(p, _)| p)
}

/// Decodes exactly one instruction starting at `bytes[0]`. `rip` is the address of
/// the FIRST byte of this instruction, used to resolve RIP-relative ModR/M operands
/// (relative to the address of the *next* instruction, per §4.1).
pub fn decode_one(
    mode: DecodeMode,
    rip: u64,
    bytes: &[u8],
) -> Result<DecodedInstruction, DecodeError> {
    let (prefixes, prefix_len) = scan_prefixes(mode, bytes)?;

    let opcode_byte = *bytes.get(prefix_len).ok_or(DecodeError::UnexpectedEof)?;
    let mut cursor = prefix_len + 1;

    let operand_size = effective_operand_size(mode, &prefixes);
    let address_size = effective_address_size(mode, &prefixes);

    let is_0f = opcode_byte == 0x0F;
    let (real_opcode_byte, needs_modrm_first) = if is_0f {
        let b = *bytes.get(cursor).ok_or(DecodeError::UnexpectedEof)?;
        cursor += 1;
        (b, true)
    } else {
        (opcode_byte, true)
    };
    let _ = needs_modrm_first;

    if !mode.is_64bit() {
        // nothing extra; legacy modes have no REX-derived invalid encodings.
    } else if !is_0f && opcode::is_long_mode_invalid_primary(real_opcode_byte) {
        return Err(DecodeError::InvalidOpcode(real_opcode_byte));
    }

    let has_modrm = if is_0f {
        opcode_has_modrm_0f(real_opcode_byte)
    } else {
        opcode_has_modrm_primary(real_opcode_byte)
    };

    let rex = prefixes.rex.unwrap_or_default();
    let mut modrm = None;
    if has_modrm {
        let (m, n) = modrm::parse_modrm(
            &bytes[cursor..],
            address_size,
            rex.r,
            rex.x,
            rex.b,
            mode.is_64bit(),
        )?;
        cursor += n;
        modrm = Some(m);
    }

    let reg_digit = modrm.map(|m| m.reg & 0x7);
    let opcode = if is_0f {
        opcode::classify_0f(real_opcode_byte, reg_digit, mode.is_64bit())
    } else {
        opcode::classify_segment_push_pop(real_opcode_byte)
            .unwrap_or_else(|| opcode::classify_primary(real_opcode_byte, reg_digit, mode.is_64bit()))
    };

    if matches!(opcode, Opcode::Invalid) {
        return Err(DecodeError::InvalidOpcode(real_opcode_byte));
    }

    let imm_len = immediate_len(opcode, operand_size, is_0f, real_opcode_byte);
    let immediate = if imm_len > 0 {
        let slice = bytes
            .get(cursor..cursor + imm_len)
            .ok_or(DecodeError::UnexpectedEof)?;
        cursor += imm_len;
        Some(sign_extend(slice))
    } else {
        None
    };

    // Direct far JMP carries a trailing 16-bit selector after its offset immediate;
    // the offset above already consumed `imm_len` bytes, so the selector is read
    // separately rather than folded into a single sign-extended `immediate`.
    let far_selector = if matches!(opcode, Opcode::JmpFarDirect) {
        let slice = bytes
            .get(cursor..cursor + 2)
            .ok_or(DecodeError::UnexpectedEof)?;
        cursor += 2;
        Some(u16::from_le_bytes([slice[0], slice[1]]))
    } else {
        None
    };

    // `MAX_INSTRUCTION_LEN` is the architectural bound for opcode+ModRM+SIB+
    // displacement+immediate; it is deliberately NOT enforced here against the total
    // length, since a redundant-prefix run (§4.1) can push `length` arbitrarily far
    // past it and the decoder must still decode past the prefixes rather than reject
    // the instruction.
    let length = cursor;
    let _ = rip; // RIP-relative resolution is finished by aero-cpu-core, which knows `length`.

    Ok(DecodedInstruction {
        prefixes,
        opcode,
        opcode_byte: real_opcode_byte,
        is_0f,
        modrm,
        immediate,
        far_selector,
        operand_size,
        address_size,
        length,
    })
}

fn effective_operand_size(mode: DecodeMode, prefixes: &Prefixes) -> u32 {
    if mode.is_64bit() {
        if let Some(rex) = prefixes.rex {
            if rex.w {
                return 64;
            }
        }
        if prefixes.operand_size_override {
            16
        } else {
            32
        }
    } else {
        let default = mode.default_operand_size();
        if prefixes.operand_size_override {
            if default == 16 {
                32
            } else {
                16
            }
        } else {
            default
        }
    }
}

fn effective_address_size(mode: DecodeMode, prefixes: &Prefixes) -> u32 {
    let default = mode.default_address_size();
    if !prefixes.address_size_override {
        return default;
    }
    match default {
        64 => 32,
        32 => 16,
        16 => 32,
        _ => default,
    }
}

fn opcode_has_modrm_primary(byte: u8) -> bool {
    matches!(
        byte,
        0x00..=0x03
            | 0x08..=0x0B
            | 0x10..=0x13
            | 0x18..=0x1B
            | 0x20..=0x23
            | 0x28..=0x2B
            | 0x30..=0x33
            | 0x38..=0x3B
            | 0x62..=0x63
            | 0x69
            | 0x6B
            | 0x80..=0x8F
            | 0xC0..=0xC1
            | 0xC4..=0xC7
            | 0xD0..=0xD3
            | 0xF6..=0xF7
            | 0xFE..=0xFF
    )
}

fn opcode_has_modrm_0f(byte: u8) -> bool {
    matches!(byte, 0x00..=0x07 | 0x1F | 0x20 | 0x22 | 0xAF | 0xB6..=0xB7 | 0xBE..=0xBF)
}

/// Immediate byte length for opcodes carrying one, per §4.1/§4.4. String ops,
/// register-to-register ALU forms, and most 0F-escaped forms never carry an
/// immediate.
fn immediate_len(opcode: Opcode, operand_size: u32, is_0f: bool, opcode_byte: u8) -> usize {
    if is_0f {
        return 0;
    }
    match opcode {
        Opcode::MovRegImm { reg } => {
            // 0xB0-0xB7 are always 8-bit; 0xB8-0xBF follow operand size (imm64 iff REX.W).
            if reg < 8 {
                1
            } else if operand_size == 64 {
                8
            } else if operand_size == 16 {
                2
            } else {
                4
            }
        }
        Opcode::MovRmImm => {
            if operand_size == 16 {
                2
            } else {
                4
            }
        }
        Opcode::Alu { has_imm: true, .. } => {
            if opcode_byte & 0x7 == 0x4 {
                1
            } else if operand_size == 16 {
                2
            } else {
                4
            }
        }
        Opcode::ImulRmImm { imm8: true } => 1,
        Opcode::ImulRmImm { imm8: false } => {
            if operand_size == 16 {
                2
            } else {
                4
            }
        }
        Opcode::In { imm: true, .. } | Opcode::Out { imm: true, .. } => 1,
        Opcode::Group1 { .. } => match opcode_byte {
            0x80 | 0x83 => 1,
            0x81 => {
                if operand_size == 16 {
                    2
                } else {
                    4
                }
            }
            _ => 0,
        },
        Opcode::Group2 {
            by_cl: false,
            by_one: false,
            ..
        } => 1,
        Opcode::Group3 { op: opcode::Group3Op::Test | opcode::Group3Op::Test2 } => {
            if opcode_byte == 0xF6 {
                1
            } else if operand_size == 16 {
                2
            } else {
                4
            }
        }
        Opcode::PushImm => {
            if opcode_byte == 0x6A {
                1
            } else if operand_size == 16 {
                2
            } else {
                4
            }
        }
        Opcode::CallRel | Opcode::JmpRel32 => 4,
        Opcode::JmpRel8 | Opcode::Jcc { rel32: false, .. } => 1,
        Opcode::Jcc { rel32: true, .. } => 4,
        Opcode::IntImm8 => 1,
        Opcode::RetNearImm16 | Opcode::RetFarImm16 => 2,
        // Far-JMP's trailing 2-byte selector is captured separately as `far_selector`
        // (see `decode_one`); this length covers only the offset.
        Opcode::JmpFarDirect => {
            if operand_size == 16 {
                2
            } else {
                4
            }
        }
        _ => 0,
    }
}

fn sign_extend(bytes: &[u8]) -> i64 {
    match bytes.len() {
        1 => bytes[0] as i8 as i64,
        2 => i16::from_le_bytes([bytes[0], bytes[1]]) as i64,
        4 => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64,
        8 => i64::from_le_bytes(bytes.try_into().unwrap()),
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rex_before_legacy_prefix_is_invalidated() {
        // REX (0x41) followed by a segment override (0x64): the override resets the
        // latch, so the final prefix state carries no REX.
        let bytes = [0x41u8, 0x64, 0x90];
        let (p, n) = scan_prefixes(DecodeMode::Bits64, &bytes).unwrap();
        assert_eq!(n, 2);
        assert!(p.rex.is_none());
        assert_eq!(p.segment_override, Some(Segment::Fs));
    }

    #[test]
    fn last_rex_before_opcode_wins() {
        let bytes = [0x41u8, 0x48, 0x90]; // REX.B then REX.W
        let (p, n) = scan_prefixes(DecodeMode::Bits64, &bytes).unwrap();
        assert_eq!(n, 2);
        let rex = p.rex.unwrap();
        assert!(rex.w);
        assert!(!rex.b);
    }

    #[test]
    fn six_lock_prefixes_then_and_decodes_at_offset_six() {
        // AND EAX, EBX = 0x21 0xD8 (rm,r form; rm=EAX dst since direction bit clear... )
        let mut bytes = vec![0xF0u8; 6];
        bytes.push(0x21);
        bytes.push(0xD8);
        let inst = decode_one(DecodeMode::Bits32, 0, &bytes).unwrap();
        assert_eq!(inst.length, 8);
        assert!(inst.prefixes.lock);
        assert!(matches!(inst.opcode, Opcode::Alu { op: opcode::AluOp::And, .. }));
    }

    #[test]
    fn into_is_unrepresentable_in_64bit_mode() {
        let bytes = [0xCEu8];
        let err = decode_one(DecodeMode::Bits64, 0, &bytes).unwrap_err();
        assert_eq!(err, DecodeError::InvalidOpcode(0xCE));
    }

    #[test]
    fn rip_relative_modrm_length_includes_displacement() {
        // LEA RAX, [RIP+0x10] => REX.W(48) 8D 05 10 00 00 00
        let bytes = [0x48u8, 0x8D, 0x05, 0x10, 0x00, 0x00, 0x00];
        let inst = decode_one(DecodeMode::Bits64, 0x1000, &bytes).unwrap();
        assert_eq!(inst.length, 7);
        assert_eq!(inst.operand_size, 64);
        match inst.opcode {
            Opcode::Lea => {}
            other => panic!("unexpected {:?}", other),
        }
        let m = inst.modrm.unwrap();
        match m.operand {
            RmOperand::Memory(mem) => assert!(mem.rip_relative),
            _ => panic!("expected memory operand"),
        }
    }

    #[test]
    fn rex_w_forces_64bit_operand_size_even_with_0x66() {
        let bytes = [0x66u8, 0x48, 0x01, 0xD8]; // 66 REX.W ADD RAX,RBX
        let inst = decode_one(DecodeMode::Bits64, 0, &bytes).unwrap();
        assert_eq!(inst.operand_size, 64);
    }

    #[test]
    fn truncated_instruction_reports_eof() {
        let bytes = [0x0Fu8]; // 0F escape with nothing following
        let err = decode_one(DecodeMode::Bits32, 0, &bytes).unwrap_err();
        assert_eq!(err, DecodeError::UnexpectedEof);
    }

    proptest::proptest! {
        /// `decode_one` must never panic on arbitrary bytes (§4.1: the decoder only
        /// ever reports `DecodeError`, it does not trust guest-controlled input to be
        /// well-formed). A successful decode's reported length must also never exceed
        /// `MAX_INSTRUCTION_LEN` plus the peeked redundant-prefix run.
        #[test]
        fn decode_one_never_panics_on_arbitrary_bytes(bytes in proptest::collection::vec(proptest::prelude::any::<u8>(), 1..32)) {
            for mode in [DecodeMode::Bits16, DecodeMode::Bits32, DecodeMode::Bits64] {
                let _ = decode_one(mode, 0, &bytes);
            }
        }

        #[test]
        fn arbitrary_lock_prefix_run_then_and_decodes_past_the_prefixes(n in 0usize..20) {
            let mut bytes = vec![0xF0u8; n];
            bytes.push(0x21);
            bytes.push(0xD8);
            let inst = decode_one(DecodeMode::Bits32, 0, &bytes).unwrap();
            assert_eq!(inst.length, n + 2);
        }
    }
}
