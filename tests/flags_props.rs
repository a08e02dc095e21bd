//! The lazily computed flags agree with a plain carry-chain evaluation.

#[macro_use] extern crate proptest;
extern crate x86core;

use proptest::prelude::*;
use x86core::cpu::instr::OpSize;
use x86core::cpu::FlagState;

#[derive(Debug, PartialEq, Eq)]
struct Expected {
    result: u64,
    cf: bool,
    pf: bool,
    af: bool,
    zf: bool,
    sf: bool,
    of: bool,
}

impl Expected {
    fn new(size: OpSize, a: u64, b: u64, result: u64, cf: bool, of_bits: u64) -> Self {
        let result = result & size.mask();
        Expected {
            result,
            cf,
            pf: (result as u8).count_ones() % 2 == 0,
            af: (a ^ b ^ result) & 0x10 != 0,
            zf: result == 0,
            sf: size.msb(result),
            of: size.msb(of_bits),
        }
    }

    fn add(size: OpSize, a: u64, b: u64, carry: bool) -> Self {
        let sum = u128::from(a) + u128::from(b) + u128::from(carry);
        let result = sum as u64 & size.mask();
        let cf = sum > u128::from(size.mask());
        Self::new(size, a, b, result, cf, (a ^ result) & (b ^ result))
    }

    fn sub(size: OpSize, a: u64, b: u64, borrow: bool) -> Self {
        let result = a.wrapping_sub(b).wrapping_sub(u64::from(borrow)) & size.mask();
        let cf = u128::from(a) < u128::from(b) + u128::from(borrow);
        Self::new(size, a, b, result, cf, (a ^ b) & (a ^ result))
    }

    fn observe(flags: &FlagState, result: u64) -> Self {
        Expected {
            result,
            cf: flags.cf(),
            pf: flags.pf(),
            af: flags.af(),
            zf: flags.zf(),
            sf: flags.sf(),
            of: flags.of(),
        }
    }
}

fn op_size() -> impl Strategy<Value = OpSize> {
    prop_oneof![
        Just(OpSize::Bits8),
        Just(OpSize::Bits16),
        Just(OpSize::Bits32),
        Just(OpSize::Bits64),
    ]
}

proptest! {
    #[test]
    fn add_matches_carry_chain(size in op_size(), a in any::<u64>(), b in any::<u64>()) {
        let (a, b) = (a & size.mask(), b & size.mask());
        let mut flags = FlagState::new();
        let result = flags.apply_add(size, a, b);
        prop_assert_eq!(Expected::observe(&flags, result), Expected::add(size, a, b, false));
    }

    #[test]
    fn sub_matches_carry_chain(size in op_size(), a in any::<u64>(), b in any::<u64>()) {
        let (a, b) = (a & size.mask(), b & size.mask());
        let mut flags = FlagState::new();
        let result = flags.apply_sub(size, a, b);
        prop_assert_eq!(Expected::observe(&flags, result), Expected::sub(size, a, b, false));
    }

    #[test]
    fn adc_matches_carry_chain(size in op_size(), a in any::<u64>(), b in any::<u64>(), carry in any::<bool>()) {
        let (a, b) = (a & size.mask(), b & size.mask());
        let mut flags = FlagState::new();
        let result = flags.apply_adc(size, a, b, carry);
        prop_assert_eq!(Expected::observe(&flags, result), Expected::add(size, a, b, carry));
    }

    #[test]
    fn sbb_matches_carry_chain(size in op_size(), a in any::<u64>(), b in any::<u64>(), borrow in any::<bool>()) {
        let (a, b) = (a & size.mask(), b & size.mask());
        let mut flags = FlagState::new();
        let result = flags.apply_sbb(size, a, b, borrow);
        prop_assert_eq!(Expected::observe(&flags, result), Expected::sub(size, a, b, borrow));
    }

    #[test]
    fn queries_are_stable(size in op_size(), a in any::<u64>(), b in any::<u64>()) {
        let mut flags = FlagState::new();
        let result = flags.apply_sub(size, a & size.mask(), b & size.mask());
        let first = Expected::observe(&flags, result);
        let bits = flags.bits();
        prop_assert_eq!(Expected::observe(&flags, result), first);
        prop_assert_eq!(flags.bits(), bits);
    }
}
