//! Flag computation rules for arithmetic/logic instructions (§4.2).
//!
//! Every helper here takes the operand width in bits and the *raw* (unmasked) u64
//! values involved; callers are responsible for masking before storing the result,
//! but flag derivation always works from the full-precision inputs so carry/overflow
//! out of the top bit of the operand width can be observed before truncation.

use crate::state::{CpuState, RFLAGS_AF, RFLAGS_CF, RFLAGS_OF, RFLAGS_PF, RFLAGS_SF, RFLAGS_ZF};

fn mask(width: u32) -> u64 {
    if width == 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

fn sign_bit(width: u32) -> u64 {
    1u64 << (width - 1)
}

fn parity_even(byte: u8) -> bool {
    byte.count_ones() % 2 == 0
}

/// ZF/SF/PF from a result alone, used by logical ops and as the tail of every
/// arithmetic flag update.
pub fn set_result_flags(state: &mut CpuState, width: u32, result: u64) {
    let m = mask(width);
    state.set_flag(RFLAGS_ZF, result & m == 0);
    state.set_flag(RFLAGS_SF, result & sign_bit(width) != 0);
    state.set_flag(RFLAGS_PF, parity_even((result & 0xFF) as u8));
}

/// AND/OR/XOR/TEST (§4.2): OF=CF=0, AF undefined (implemented as 0), ZF/SF/PF from
/// the result.
pub fn logical(state: &mut CpuState, width: u32, result: u64) {
    set_result_flags(state, width, result);
    state.set_flag(RFLAGS_CF, false);
    state.set_flag(RFLAGS_OF, false);
    state.set_flag(RFLAGS_AF, false);
}

/// ADD/ADC flags (§4.2). `carry_in` is 0 or 1; for plain ADD pass 0.
pub fn add(state: &mut CpuState, width: u32, dst: u64, src: u64, carry_in: u64) {
    let m = mask(width);
    let wide = (dst & m) + (src & m) + carry_in;
    let result = wide & m;
    set_result_flags(state, width, result);
    state.set_flag(RFLAGS_CF, wide > m);
    let of = sign_bit(width) & ((dst ^ result) & !(dst ^ src)) != 0;
    state.set_flag(RFLAGS_OF, of);
    let af = ((dst & 0xF) + (src & 0xF) + carry_in) & 0x10 != 0;
    state.set_flag(RFLAGS_AF, af);
}

/// SUB/SBB/CMP flags (§4.2). `borrow_in` is 0 or 1; for plain SUB/CMP pass 0.
/// CF is set on unsigned borrow (`src + borrow_in > dst`, matching "src > dst
/// unsigned" for plain SUB).
pub fn sub(state: &mut CpuState, width: u32, dst: u64, src: u64, borrow_in: u64) {
    let m = mask(width);
    let d = dst & m;
    let s = (src & m) + borrow_in;
    let result = d.wrapping_sub(s) & m;
    set_result_flags(state, width, result);
    state.set_flag(RFLAGS_CF, s > d);
    let of = sign_bit(width) & ((dst ^ src) & (dst ^ result)) != 0;
    state.set_flag(RFLAGS_OF, of);
    let af = ((d & 0xF) as i64 - (s & 0xF) as i64) < 0;
    state.set_flag(RFLAGS_AF, af);
}

/// INC/DEC (§4.2): update OF/SF/ZF/AF/PF like ADD/SUB by 1, but preserve CF.
pub fn inc(state: &mut CpuState, width: u32, dst: u64) {
    let cf = state.flag(RFLAGS_CF);
    add(state, width, dst, 1, 0);
    state.set_flag(RFLAGS_CF, cf);
}

pub fn dec(state: &mut CpuState, width: u32, dst: u64) {
    let cf = state.flag(RFLAGS_CF);
    sub(state, width, dst, 1, 0);
    state.set_flag(RFLAGS_CF, cf);
}

/// NEG (§9 Open Questions): behaves as `0 - operand`, so it reuses `sub`'s flags;
/// OF is set exactly when the operand equals the signed minimum for its width,
/// which `sub`'s overflow formula already produces correctly for a zero dst.
pub fn neg(state: &mut CpuState, width: u32, operand: u64) {
    sub(state, width, 0, operand, 0);
    state.set_flag(RFLAGS_CF, operand & mask(width) != 0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::CpuState;

    #[test]
    fn cmp_eax_0x80000001_vs_ecx_0x80000000_clears_cf_and_zf() {
        let mut s = CpuState::power_on();
        sub(&mut s, 32, 0x8000_0001, 0x8000_0000, 0);
        assert!(!s.flag(RFLAGS_ZF));
        assert!(!s.flag(RFLAGS_CF));
    }

    #[test]
    fn adc_rax_max_plus_zero_plus_carry_wraps_to_zero() {
        let mut s = CpuState::power_on();
        add(&mut s, 64, 0xFFFF_FFFF_FFFF_FFFF, 0, 1);
        assert_eq!(s.flag(RFLAGS_CF), true);
        assert_eq!(s.flag(RFLAGS_ZF), true);
        assert_eq!(s.flag(RFLAGS_AF), true);
        assert_eq!(s.flag(RFLAGS_PF), true);
    }

    #[test]
    fn neg_signed_minimum_sets_overflow() {
        let mut s = CpuState::power_on();
        neg(&mut s, 64, 0x8000_0000_0000_0000);
        assert!(s.flag(RFLAGS_OF));
    }

    #[test]
    fn logical_ops_clear_carry_and_overflow() {
        let mut s = CpuState::power_on();
        s.set_flag(RFLAGS_CF, true);
        s.set_flag(RFLAGS_OF, true);
        logical(&mut s, 32, 0);
        assert!(!s.flag(RFLAGS_CF));
        assert!(!s.flag(RFLAGS_OF));
        assert!(s.flag(RFLAGS_ZF));
    }
}
