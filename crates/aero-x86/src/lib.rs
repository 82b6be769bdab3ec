//! Architectural vocabulary shared between the decoder and the CPU core: register
//! names (with their encoded width baked into the variant), and segment identifiers.
//!
//! This crate has no behavior of its own — it is the common nouns the rest of the
//! workspace verbs over.

#![forbid(unsafe_code)]

/// One of the 16 general-purpose register "slots" (RAX..R15), independent of the
/// width at which it is currently being addressed. Used for ModR/M-indexed decode
/// where the width is a decode-time property, not a property of the slot itself.
pub mod gpr {
    pub type Slot = u8;

    pub const RAX: Slot = 0;
    pub const RCX: Slot = 1;
    pub const RDX: Slot = 2;
    pub const RBX: Slot = 3;
    pub const RSP: Slot = 4;
    pub const RBP: Slot = 5;
    pub const RSI: Slot = 6;
    pub const RDI: Slot = 7;
    pub const R8: Slot = 8;
    pub const R9: Slot = 9;
    pub const R10: Slot = 10;
    pub const R11: Slot = 11;
    pub const R12: Slot = 12;
    pub const R13: Slot = 13;
    pub const R14: Slot = 14;
    pub const R15: Slot = 15;

    pub const COUNT: usize = 16;

    /// Legacy (non-REX) mnemonic for a slot, for diagnostics.
    pub fn name64(slot: Slot) -> &'static str {
        const NAMES: [&str; 16] = [
            "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11",
            "r12", "r13", "r14", "r15",
        ];
        NAMES[slot as usize & 0xF]
    }
}

/// Width at which a GPR slot is being read or written. `Low8High` is the
/// AH/CH/DH/BH legacy high-byte view, only reachable without a REX prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterWidth {
    Low8,
    Low8High,
    Bits16,
    Bits32,
    Bits64,
}

impl RegisterWidth {
    pub fn bits(self) -> u32 {
        match self {
            RegisterWidth::Low8 | RegisterWidth::Low8High => 8,
            RegisterWidth::Bits16 => 16,
            RegisterWidth::Bits32 => 32,
            RegisterWidth::Bits64 => 64,
        }
    }

    pub fn mask(self) -> u64 {
        match self.bits() {
            8 => 0xFF,
            16 => 0xFFFF,
            32 => 0xFFFF_FFFF,
            64 => u64::MAX,
            _ => unreachable!(),
        }
    }
}

/// A named architectural register. The variant encodes both the GPR slot (where
/// applicable) and the width it is addressed at — `AX` and `EAX` name the same slot
/// at different widths, matching how the decoder/ModR.M/opcode-embedded-register
/// encodings name them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[rustfmt::skip]
pub enum Register {
    // 8-bit low.
    AL, CL, DL, BL, SPL, BPL, SIL, DIL,
    R8B, R9B, R10B, R11B, R12B, R13B, R14B, R15B,
    // 8-bit high (legacy-only; REX presence re-maps these to SPL/BPL/SIL/DIL).
    AH, CH, DH, BH,
    // 16-bit.
    AX, CX, DX, BX, SP, BP, SI, DI,
    R8W, R9W, R10W, R11W, R12W, R13W, R14W, R15W,
    // 32-bit.
    EAX, ECX, EDX, EBX, ESP, EBP, ESI, EDI,
    R8D, R9D, R10D, R11D, R12D, R13D, R14D, R15D,
    // 64-bit.
    RAX, RCX, RDX, RBX, RSP, RBP, RSI, RDI,
    R8, R9, R10, R11, R12, R13, R14, R15,
    // Segments.
    ES, CS, SS, DS, FS, GS,
}

impl Register {
    /// The underlying GPR slot, or `None` for segment registers.
    #[rustfmt::skip]
    pub fn slot(self) -> Option<gpr::Slot> {
        use Register::*;
        Some(match self {
            AL | AX | EAX | RAX => gpr::RAX,
            CL | CX | ECX | RCX => gpr::RCX,
            DL | DX | EDX | RDX => gpr::RDX,
            BL | BX | EBX | RBX => gpr::RBX,
            SPL | SP | ESP | RSP => gpr::RSP,
            BPL | BP | EBP | RBP => gpr::RBP,
            SIL | SI | ESI | RSI => gpr::RSI,
            DIL | DI | EDI | RDI => gpr::RDI,
            AH => gpr::RAX,
            CH => gpr::RCX,
            DH => gpr::RDX,
            BH => gpr::RBX,
            R8B | R8W | R8D | R8 => gpr::R8,
            R9B | R9W | R9D | R9 => gpr::R9,
            R10B | R10W | R10D | R10 => gpr::R10,
            R11B | R11W | R11D | R11 => gpr::R11,
            R12B | R12W | R12D | R12 => gpr::R12,
            R13B | R13W | R13D | R13 => gpr::R13,
            R14B | R14W | R14D | R14 => gpr::R14,
            R15B | R15W | R15D | R15 => gpr::R15,
            ES | CS | SS | DS | FS | GS => return None,
        })
    }

    #[rustfmt::skip]
    pub fn width(self) -> RegisterWidth {
        use Register::*;
        match self {
            AL | CL | DL | BL | SPL | BPL | SIL | DIL
            | R8B | R9B | R10B | R11B | R12B | R13B | R14B | R15B => RegisterWidth::Low8,
            AH | CH | DH | BH => RegisterWidth::Low8High,
            AX | CX | DX | BX | SP | BP | SI | DI
            | R8W | R9W | R10W | R11W | R12W | R13W | R14W | R15W => RegisterWidth::Bits16,
            EAX | ECX | EDX | EBX | ESP | EBP | ESI | EDI
            | R8D | R9D | R10D | R11D | R12D | R13D | R14D | R15D => RegisterWidth::Bits32,
            RAX | RCX | RDX | RBX | RSP | RBP | RSI | RDI
            | R8 | R9 | R10 | R11 | R12 | R13 | R14 | R15 => RegisterWidth::Bits64,
            ES | CS | SS | DS | FS | GS => RegisterWidth::Bits16,
        }
    }

    pub fn is_segment(self) -> bool {
        matches!(
            self,
            Register::ES | Register::CS | Register::SS | Register::DS | Register::FS | Register::GS
        )
    }

    /// Builds the `Register` for a given GPR slot at the requested width. `high8`
    /// selects the AH/CH/DH/BH view for slot 0..3 at 8-bit width (only valid when no
    /// REX prefix is present for this instruction — the decoder enforces that).
    #[rustfmt::skip]
    pub fn from_slot(slot: gpr::Slot, width: RegisterWidth, high8: bool) -> Register {
        use Register::*;
        if high8 && width == RegisterWidth::Low8 {
            return match slot & 0x3 {
                0 => AH, 1 => CH, 2 => DH, 3 => BH,
                _ => unreachable!(),
            };
        }
        match (slot, width) {
            (s, RegisterWidth::Low8) => [AL, CL, DL, BL, SPL, BPL, SIL, DIL,
                R8B, R9B, R10B, R11B, R12B, R13B, R14B, R15B][s as usize],
            (s, RegisterWidth::Bits16) => [AX, CX, DX, BX, SP, BP, SI, DI,
                R8W, R9W, R10W, R11W, R12W, R13W, R14W, R15W][s as usize],
            (s, RegisterWidth::Bits32) => [EAX, ECX, EDX, EBX, ESP, EBP, ESI, EDI,
                R8D, R9D, R10D, R11D, R12D, R13D, R14D, R15D][s as usize],
            (s, RegisterWidth::Bits64) => [RAX, RCX, RDX, RBX, RSP, RBP, RSI, RDI,
                R8, R9, R10, R11, R12, R13, R14, R15][s as usize],
            (_, RegisterWidth::Low8High) => unreachable!("Low8High only reachable via high8 flag"),
        }
    }
}

/// Segment selector identity, independent of `Register` (used where only segments are
/// valid, e.g. segment-override prefixes and MOV seg,rm encodings).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Segment {
    Es,
    Cs,
    Ss,
    Ds,
    Fs,
    Gs,
}

impl Segment {
    pub const ALL: [Segment; 6] = [
        Segment::Es,
        Segment::Cs,
        Segment::Ss,
        Segment::Ds,
        Segment::Fs,
        Segment::Gs,
    ];

    pub fn index(self) -> usize {
        match self {
            Segment::Es => 0,
            Segment::Cs => 1,
            Segment::Ss => 2,
            Segment::Ds => 3,
            Segment::Fs => 4,
            Segment::Gs => 5,
        }
    }

    /// The legacy ModR/M `reg` encoding (0..5) used by MOV seg,rm / MOV rm,seg;
    /// encodings 6 and 7 are invalid and must raise #UD.
    pub fn from_modrm_reg(reg: u8) -> Option<Segment> {
        match reg & 0x7 {
            0 => Some(Segment::Es),
            1 => Some(Segment::Cs),
            2 => Some(Segment::Ss),
            3 => Some(Segment::Ds),
            4 => Some(Segment::Fs),
            5 => Some(Segment::Gs),
            _ => None,
        }
    }

    pub fn as_register(self) -> Register {
        match self {
            Segment::Es => Register::ES,
            Segment::Cs => Register::CS,
            Segment::Ss => Register::SS,
            Segment::Ds => Register::DS,
            Segment::Fs => Register::FS,
            Segment::Gs => Register::GS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_round_trips_through_widths() {
        for slot in 0..gpr::COUNT as gpr::Slot {
            for width in [
                RegisterWidth::Low8,
                RegisterWidth::Bits16,
                RegisterWidth::Bits32,
                RegisterWidth::Bits64,
            ] {
                let reg = Register::from_slot(slot, width, false);
                assert_eq!(reg.slot(), Some(slot));
                assert_eq!(reg.width(), width);
            }
        }
    }

    #[test]
    fn high8_views_alias_low_nibble_slots() {
        assert_eq!(Register::AH.slot(), Some(gpr::RAX));
        assert_eq!(Register::CH.slot(), Some(gpr::RCX));
        assert_eq!(Register::DH.slot(), Some(gpr::RDX));
        assert_eq!(Register::BH.slot(), Some(gpr::RBX));
        assert_eq!(Register::AH.width(), RegisterWidth::Low8High);
    }

    #[test]
    fn segment_modrm_six_and_seven_are_invalid() {
        assert!(Segment::from_modrm_reg(6).is_none());
        assert!(Segment::from_modrm_reg(7).is_none());
        assert_eq!(Segment::from_modrm_reg(0), Some(Segment::Es));
    }
}
