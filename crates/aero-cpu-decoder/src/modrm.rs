//! ModR/M + SIB parsing (§4.1).

use aero_x86::gpr;

/// A decoded ModR/M byte, with REX-extended register numbers already folded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModRm {
    pub raw: u8,
    pub md: u8,
    /// Register operand / opcode-extension digit, REX.R-extended (0..15).
    pub reg: u8,
    /// rm field before SIB/REX.B extension is applied (0..7); use `operand` for the
    /// resolved effective address or register.
    pub rm_raw: u8,
    pub operand: RmOperand,
}

/// The rm operand of a ModR/M byte: a register or a fully-resolved memory reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmOperand {
    Register(gpr::Slot),
    Memory(MemOperand),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemOperand {
    pub base: Option<gpr::Slot>,
    pub index: Option<(gpr::Slot, u8)>,
    pub disp: i64,
    /// `mod=00, rm=101` in 64-bit mode: disp32 relative to the address of the
    /// instruction following this one.
    pub rip_relative: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModRmError {
    Truncated,
}

/// Parses a ModR/M byte (and any SIB + displacement that follow it) out of `bytes`
/// starting at `bytes[0]`. `address_size` is 16, 32, or 64. Returns the operand plus
/// the total number of bytes consumed (ModR/M + SIB + displacement).
pub fn parse_modrm(
    bytes: &[u8],
    address_size: u32,
    rex_r: bool,
    rex_x: bool,
    rex_b: bool,
    is_64bit_mode: bool,
) -> Result<(ModRm, usize), ModRmError> {
    let raw = *bytes.first().ok_or(ModRmError::Truncated)?;
    let md = raw >> 6;
    let reg_raw = (raw >> 3) & 0x7;
    let rm_raw = raw & 0x7;
    let reg = reg_raw | if rex_r { 0x8 } else { 0 };
    let mut consumed = 1;

    if md == 0b11 {
        let slot = rm_raw | if rex_b { 0x8 } else { 0 };
        return Ok((
            ModRm {
                raw,
                md,
                reg,
                rm_raw,
                operand: RmOperand::Register(slot),
            },
            consumed,
        ));
    }

    if address_size == 16 {
        // 16-bit addressing has its own base/index table and never uses SIB/RIP-rel.
        let (base, index): (Option<gpr::Slot>, Option<gpr::Slot>) = match rm_raw {
            0 => (Some(gpr::RBX), Some(gpr::RSI)),
            1 => (Some(gpr::RBX), Some(gpr::RDI)),
            2 => (Some(gpr::RBP), Some(gpr::RSI)),
            3 => (Some(gpr::RBP), Some(gpr::RDI)),
            4 => (None, Some(gpr::RSI)),
            5 => (None, Some(gpr::RDI)),
            6 => (Some(gpr::RBP), None),
            7 => (Some(gpr::RBX), None),
            _ => unreachable!(),
        };
        let (base, disp_len) = if md == 0b00 && rm_raw == 6 {
            (None, 2) // direct disp16, no base
        } else {
            (base, if md == 0b01 { 1 } else if md == 0b10 { 2 } else { 0 })
        };
        let disp = read_disp(bytes, consumed, disp_len)?;
        consumed += disp_len;
        return Ok((
            ModRm {
                raw,
                md,
                reg,
                rm_raw,
                operand: RmOperand::Memory(MemOperand {
                    base,
                    index: index.map(|i| (i, 1)),
                    disp,
                    rip_relative: false,
                }),
            },
            consumed,
        ));
    }

    // 32/64-bit addressing.
    let mut base;
    let mut index = None;
    let mut rip_relative = false;

    if rm_raw == 0b100 {
        // SIB byte follows.
        let sib = *bytes.get(consumed).ok_or(ModRmError::Truncated)?;
        consumed += 1;
        let scale = 1u8 << (sib >> 6);
        let idx_raw = ((sib >> 3) & 0x7) | if rex_x { 0x8 } else { 0 };
        let base_raw = (sib & 0x7) | if rex_b { 0x8 } else { 0 };

        if idx_raw != 0b0100 {
            index = Some((idx_raw, scale));
        }
        if (sib & 0x7) == 0b101 && md == 0b00 {
            base = None; // disp32, no base
        } else {
            base = Some(base_raw);
        }
    } else if rm_raw == 0b101 && md == 0b00 {
        base = None;
        if is_64bit_mode && address_size != 16 {
            rip_relative = true;
        }
    } else {
        base = Some(rm_raw | if rex_b { 0x8 } else { 0 });
    }

    let disp_len = if rip_relative || (base.is_none() && md == 0b00) {
        4
    } else {
        match md {
            0b00 => 0,
            0b01 => 1,
            0b10 => 4,
            _ => 0,
        }
    };
    let disp = read_disp(bytes, consumed, disp_len)?;
    consumed += disp_len;

    // Silence "unused assignment" when base was already set above in every arm.
    let _ = &mut base;

    Ok((
        ModRm {
            raw,
            md,
            reg,
            rm_raw,
            operand: RmOperand::Memory(MemOperand {
                base,
                index,
                disp,
                rip_relative,
            }),
        },
        consumed,
    ))
}

fn read_disp(bytes: &[u8], offset: usize, len: usize) -> Result<i64, ModRmError> {
    let slice = bytes.get(offset..offset + len).ok_or(ModRmError::Truncated)?;
    Ok(match len {
        0 => 0,
        1 => slice[0] as i8 as i64,
        2 => i16::from_le_bytes([slice[0], slice[1]]) as i64,
        4 => i32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]) as i64,
        _ => unreachable!(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_direct_mode_applies_rex_b() {
        let bytes = [0xC0u8]; // mod=11 reg=000 rm=000
        let (m, n) = parse_modrm(&bytes, 64, false, false, true, true).unwrap();
        assert_eq!(n, 1);
        assert_eq!(m.operand, RmOperand::Register(gpr::R8));
    }

    #[test]
    fn rip_relative_in_64bit_mode() {
        // mod=00 rm=101 disp32=0x1234
        let bytes = [0x05u8, 0x34, 0x12, 0x00, 0x00];
        let (m, n) = parse_modrm(&bytes, 64, false, false, false, true).unwrap();
        assert_eq!(n, 5);
        match m.operand {
            RmOperand::Memory(mem) => {
                assert!(mem.rip_relative);
                assert_eq!(mem.disp, 0x1234);
                assert!(mem.base.is_none());
            }
            _ => panic!("expected memory operand"),
        }
    }

    #[test]
    fn sib_with_disp32_no_base() {
        // mod=00 rm=100 (SIB) ; SIB: scale=00 index=000(RAX) base=101 -> disp32, no base
        let bytes = [0x04u8, 0x05, 0x78, 0x56, 0x34, 0x12];
        let (m, n) = parse_modrm(&bytes, 32, false, false, false, false).unwrap();
        assert_eq!(n, 6);
        match m.operand {
            RmOperand::Memory(mem) => {
                assert!(mem.base.is_none());
                assert_eq!(mem.index, Some((gpr::RAX, 1)));
                assert_eq!(mem.disp, 0x1234_5678);
            }
            _ => panic!("expected memory operand"),
        }
    }

    #[test]
    fn addr16_bx_si_with_disp8() {
        // mod=01 rm=000 ([BX+SI]+disp8) disp8=-1
        let bytes = [0x40u8, 0xFF];
        let (m, n) = parse_modrm(&bytes, 16, false, false, false, false).unwrap();
        assert_eq!(n, 2);
        match m.operand {
            RmOperand::Memory(mem) => {
                assert_eq!(mem.base, Some(gpr::RBX));
                assert_eq!(mem.index, Some((gpr::RSI, 1)));
                assert_eq!(mem.disp, -1);
            }
            _ => panic!("expected memory operand"),
        }
    }
}
