//! x86 status flag (`EFLAGS`) structures and the lazy flag engine.
//!
//! Almost every integer instruction updates the six arithmetic flags (`CF`,
//! `PF`, `AF`, `ZF`, `SF`, `OF`), but few instructions ever look at them.
//! Instead of computing all six after every operation, `FlagState` records
//! the masked result and a *carry vector* (the carry out of every bit
//! position) and derives each flag only when it is queried:
//!
//! * `CF` is the carry out of the most significant bit.
//! * `OF` is the carry into the MSB XOR the carry out of it.
//! * `AF` is the carry out of bit 3.
//! * `SF`, `ZF` and `PF` only depend on the result.
//!
//! Instructions that set flags in ways an adder wouldn't (shifts, rotates,
//! BCD adjustments, `popf`) override individual flags, which stays in effect
//! until the next full update.
//!
//! The system flags (`TF`, `IF`, `IOPL`, ...) are stored eagerly.

use cpu::instr::{ConditionCode, OpSize};

bitflags! {
    /// A bitmask carrying any combination of x86 `EFLAGS` bits.
    ///
    /// The flag constants correspond to the bit positions in `EFLAGS`.
    pub struct FlagSet: u32 {
        /// Carry flag.
        const CF = 1 << 0;
        /// Reserved, always reads as 1.
        const FIXED = 1 << 1;
        /// Parity flag.
        ///
        /// Set if the low byte of the result has an even number of 1-bits.
        const PF = 1 << 2;
        /// Adjust flag (or Auxiliary Carry Flag).
        ///
        /// Set to whether a carry from the lower 4 bits of an operation has
        /// been generated.
        const AF = 1 << 4;
        /// Zero flag.
        ///
        /// Set to whether the result of an operation consists entirely of
        /// 0-bits.
        const ZF = 1 << 6;
        /// Sign flag.
        const SF = 1 << 7;
        /// Trap flag (single-step).
        const TF = 1 << 8;
        /// Interrupt enable flag.
        const IF = 1 << 9;
        /// Direction flag for string instructions.
        const DF = 1 << 10;
        /// Overflow.
        const OF = 1 << 11;
        /// I/O privilege level (2 bits).
        const IOPL = 3 << 12;
        /// Nested task.
        const NT = 1 << 14;
        /// Resume flag.
        const RF = 1 << 16;
        /// Virtual-8086 mode.
        const VM = 1 << 17;
        /// Alignment check (user-mode only, together with `CR0.AM`).
        const AC = 1 << 18;
        /// Virtual interrupt flag.
        const VIF = 1 << 19;
        /// Virtual interrupt pending.
        const VIP = 1 << 20;
        /// `cpuid` availability.
        const ID = 1 << 21;

        /// The six arithmetic flags tracked lazily.
        const OSZAPC = Self::OF.bits | Self::SF.bits | Self::ZF.bits
            | Self::AF.bits | Self::PF.bits | Self::CF.bits;
        /// Every bit that can ever be changed by a write.
        const VALID = 0x003f_7fd5;
    }
}

/// Computes the carry vector of `op1 + op2 (+ carry in) = result`.
fn add_carries(op1: u64, op2: u64, result: u64) -> u64 {
    (op1 & op2) | ((op1 | op2) & !result)
}

/// Computes the borrow vector of `op1 - op2 (- borrow in) = result`.
fn sub_borrows(op1: u64, op2: u64, result: u64) -> u64 {
    (!op1 & op2) | ((!op1 ^ op2) & result)
}

/// The condition flags of one CPU, evaluated lazily.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagState {
    /// Result of the last flag-updating operation, masked to `size`.
    result: u64,
    /// Carry (or borrow) out of each bit position.
    carries: u64,
    size: OpSize,
    /// Arithmetic flags that were set directly since the last full update.
    forced: FlagSet,
    /// Values of the flags in `forced`.
    forced_values: FlagSet,
    /// Everything but `OSZAPC`.
    system: FlagSet,
}

macro_rules! arith_flag {
    ($flag:ident: $get:ident/$set:ident/$assert:ident/$clear:ident, $derive:ident) => {
        pub fn $get(&self) -> bool {
            if self.forced.contains(FlagSet::$flag) {
                self.forced_values.contains(FlagSet::$flag)
            } else {
                self.$derive()
            }
        }

        pub fn $set(&mut self, value: bool) {
            self.forced.insert(FlagSet::$flag);
            self.forced_values.set(FlagSet::$flag, value);
        }

        pub fn $assert(&mut self) {
            self.$set(true);
        }

        pub fn $clear(&mut self) {
            self.$set(false);
        }
    };
}

macro_rules! system_flag {
    ($flag:ident: $get:ident/$set:ident) => {
        pub fn $get(&self) -> bool {
            self.system.contains(FlagSet::$flag)
        }

        pub fn $set(&mut self, value: bool) {
            self.system.set(FlagSet::$flag, value);
        }
    };
}

impl FlagState {
    /// Creates a flag state with all flags cleared (`EFLAGS = 0x2`).
    pub fn new() -> Self {
        let mut flags = Self {
            result: 0,
            carries: 0,
            size: OpSize::Bits32,
            forced: FlagSet::empty(),
            forced_values: FlagSet::empty(),
            system: FlagSet::empty(),
        };
        flags.load_arithmetic(FlagSet::empty());
        flags
    }

    /// Records an addition and returns its (masked) result.
    pub fn apply_add(&mut self, size: OpSize, op1: u64, op2: u64) -> u64 {
        self.apply_adc(size, op1, op2, false)
    }

    /// Records an addition with carry-in and returns its result.
    pub fn apply_adc(&mut self, size: OpSize, op1: u64, op2: u64, carry: bool) -> u64 {
        let (op1, op2) = (op1 & size.mask(), op2 & size.mask());
        let result = op1.wrapping_add(op2).wrapping_add(carry as u64) & size.mask();
        self.update(size, result, add_carries(op1, op2, result));
        result
    }

    /// Records a subtraction `op1 - op2` and returns its result.
    pub fn apply_sub(&mut self, size: OpSize, op1: u64, op2: u64) -> u64 {
        self.apply_sbb(size, op1, op2, false)
    }

    /// Records a subtraction with borrow-in and returns its result.
    pub fn apply_sbb(&mut self, size: OpSize, op1: u64, op2: u64, borrow: bool) -> u64 {
        let (op1, op2) = (op1 & size.mask(), op2 & size.mask());
        let result = op1.wrapping_sub(op2).wrapping_sub(borrow as u64) & size.mask();
        self.update(size, result, sub_borrows(op1, op2, result));
        result
    }

    /// Records the result of a logic operation. Clears `CF`, `OF` and `AF`.
    pub fn apply_logic(&mut self, size: OpSize, result: u64) {
        self.update(size, result & size.mask(), 0);
    }

    /// Records `op + 1`. `CF` keeps its value.
    pub fn apply_inc(&mut self, size: OpSize, op: u64) -> u64 {
        let cf = self.cf();
        let result = self.apply_add(size, op, 1);
        self.set_cf(cf);
        result
    }

    /// Records `op - 1`. `CF` keeps its value.
    pub fn apply_dec(&mut self, size: OpSize, op: u64) -> u64 {
        let cf = self.cf();
        let result = self.apply_sub(size, op, 1);
        self.set_cf(cf);
        result
    }

    fn update(&mut self, size: OpSize, result: u64, carries: u64) {
        self.size = size;
        self.result = result;
        self.carries = carries;
        self.forced = FlagSet::empty();
    }

    fn carry_bit(&self, bit: u32) -> bool {
        (self.carries >> bit) & 1 != 0
    }

    fn derive_cf(&self) -> bool {
        self.carry_bit(self.size.bits() - 1)
    }

    fn derive_of(&self) -> bool {
        let msb = self.size.bits() - 1;
        self.carry_bit(msb) != self.carry_bit(msb - 1)
    }

    fn derive_af(&self) -> bool {
        self.carry_bit(3)
    }

    fn derive_zf(&self) -> bool {
        self.result == 0
    }

    fn derive_sf(&self) -> bool {
        self.size.msb(self.result)
    }

    fn derive_pf(&self) -> bool {
        (self.result as u8).count_ones() % 2 == 0
    }

    arith_flag!(CF: cf/set_cf/assert_cf/clear_cf, derive_cf);
    arith_flag!(PF: pf/set_pf/assert_pf/clear_pf, derive_pf);
    arith_flag!(AF: af/set_af/assert_af/clear_af, derive_af);
    arith_flag!(ZF: zf/set_zf/assert_zf/clear_zf, derive_zf);
    arith_flag!(SF: sf/set_sf/assert_sf/clear_sf, derive_sf);
    arith_flag!(OF: of/set_of/assert_of/clear_of, derive_of);

    system_flag!(TF: tf/set_tf);
    system_flag!(IF: interrupts_enabled/set_interrupts_enabled);
    system_flag!(DF: df/set_df);
    system_flag!(NT: nt/set_nt);
    system_flag!(RF: rf/set_rf);
    system_flag!(VM: vm/set_vm);
    system_flag!(AC: ac/set_ac);
    system_flag!(VIF: vif/set_vif);
    system_flag!(VIP: vip/set_vip);
    system_flag!(ID: id/set_id);

    /// Sets `OF` and `CF` at once, as shifts and rotates do.
    pub fn set_of_cf(&mut self, of: bool, cf: bool) {
        self.set_of(of);
        self.set_cf(cf);
    }

    /// Returns the I/O privilege level.
    pub fn iopl(&self) -> u8 {
        ((self.system.bits() & FlagSet::IOPL.bits()) >> 12) as u8
    }

    pub fn set_iopl(&mut self, iopl: u8) {
        self.system.remove(FlagSet::IOPL);
        self.system.insert(FlagSet::from_bits_truncate(u32::from(iopl & 3) << 12));
    }

    /// Replaces all arithmetic flags with the values in `flags`.
    ///
    /// Used by `sahf`, `popf` and `iret`.
    pub fn load_arithmetic(&mut self, flags: FlagSet) {
        self.forced = FlagSet::OSZAPC;
        self.forced_values = flags & FlagSet::OSZAPC;
    }

    /// Returns the current arithmetic flags.
    pub fn arithmetic(&self) -> FlagSet {
        let mut flags = FlagSet::empty();
        flags.set(FlagSet::CF, self.cf());
        flags.set(FlagSet::PF, self.pf());
        flags.set(FlagSet::AF, self.af());
        flags.set(FlagSet::ZF, self.zf());
        flags.set(FlagSet::SF, self.sf());
        flags.set(FlagSet::OF, self.of());
        flags
    }

    /// Returns the full `EFLAGS` value. Bit 1 always reads as 1.
    pub fn read(&self) -> FlagSet {
        self.arithmetic() | self.system | FlagSet::FIXED
    }

    /// Returns `EFLAGS` as a plain integer.
    pub fn bits(&self) -> u32 {
        self.read().bits()
    }

    /// Replaces the bits selected by `change_mask` with those in `value`.
    ///
    /// Bits outside of `FlagSet::VALID` never change. This does not apply any
    /// side effects of changing system flags (mode switches); that is the
    /// job of `CpuContext::write_eflags`.
    pub fn replace(&mut self, value: u32, change_mask: u32) {
        let mask = change_mask & FlagSet::VALID.bits();
        let new = (self.bits() & !mask) | (value & mask);
        let new = FlagSet::from_bits_truncate(new);
        self.load_arithmetic(new);
        self.system = new - FlagSet::OSZAPC - FlagSet::FIXED;
    }

    /// Evaluates condition code `cc`.
    pub fn eval_condition(&self, cc: ConditionCode) -> bool {
        use self::ConditionCode::*;

        match cc {
            Overflow => self.of(),
            NotOverflow => !self.of(),
            Carry => self.cf(),
            NotCarry => !self.cf(),
            Equal => self.zf(),
            NotEqual => !self.zf(),
            BelowOrEqual => self.cf() || self.zf(),
            Above => !self.cf() && !self.zf(),
            Sign => self.sf(),
            NotSign => !self.sf(),
            Parity => self.pf(),
            NotParity => !self.pf(),
            Less => self.sf() != self.of(),
            GreaterOrEqual => self.sf() == self.of(),
            LessOrEqual => self.zf() || self.sf() != self.of(),
            Greater => !self.zf() && self.sf() == self.of(),
        }
    }
}

impl Default for FlagState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_16bit_wraparound() {
        let mut flags = FlagState::new();
        let result = flags.apply_add(OpSize::Bits16, 0xffff, 0x0001);
        assert_eq!(result, 0);
        assert!(flags.cf());
        assert!(!flags.of());
        assert!(flags.zf());
        assert!(!flags.sf());
        assert!(flags.af());
        assert!(flags.pf());
    }

    #[test]
    fn sub_8bit_borrow() {
        let mut flags = FlagState::new();
        let result = flags.apply_sub(OpSize::Bits8, 0x00, 0x01);
        assert_eq!(result, 0xff);
        assert!(flags.cf());
        assert!(!flags.of());
        assert!(flags.sf());
        assert!(!flags.zf());
        assert!(flags.af());
    }

    #[test]
    fn signed_overflow() {
        let mut flags = FlagState::new();
        flags.apply_add(OpSize::Bits32, 0x7fff_ffff, 1);
        assert!(flags.of());
        assert!(!flags.cf());
        assert!(flags.sf());

        flags.apply_sub(OpSize::Bits64, 1 << 63, 1);
        assert!(flags.of());
        assert!(!flags.cf());
        assert!(!flags.sf());
    }

    #[test]
    fn logic_clears_carries() {
        let mut flags = FlagState::new();
        flags.apply_add(OpSize::Bits8, 0xff, 0xff);
        assert!(flags.cf());
        flags.apply_logic(OpSize::Bits8, 0x80);
        assert!(!flags.cf());
        assert!(!flags.of());
        assert!(!flags.af());
        assert!(flags.sf());
        assert!(!flags.pf());
    }

    #[test]
    fn inc_dec_preserve_cf() {
        let mut flags = FlagState::new();
        flags.assert_cf();
        assert_eq!(flags.apply_inc(OpSize::Bits8, 0x7f), 0x80);
        assert!(flags.cf());
        assert!(flags.of());
        flags.clear_cf();
        assert_eq!(flags.apply_dec(OpSize::Bits16, 0), 0xffff);
        assert!(!flags.cf());
        assert!(flags.sf());
    }

    #[test]
    fn overrides_last_until_next_update() {
        let mut flags = FlagState::new();
        flags.apply_sub(OpSize::Bits32, 5, 5);
        assert!(flags.zf());
        flags.clear_zf();
        assert!(!flags.zf());
        assert!(!flags.zf());
        flags.apply_sub(OpSize::Bits32, 5, 5);
        assert!(flags.zf());
    }

    #[test]
    fn eflags_image() {
        let mut flags = FlagState::new();
        assert_eq!(flags.bits(), 0x2);
        flags.replace(0xffff_ffff, FlagSet::CF.bits() | FlagSet::IOPL.bits() | (1 << 31));
        assert_eq!(flags.bits(), 0x3003);
        assert_eq!(flags.iopl(), 3);
        flags.set_iopl(1);
        flags.set_interrupts_enabled(true);
        assert_eq!(flags.read(), FlagSet::FIXED | FlagSet::CF | FlagSet::IF
            | FlagSet::from_bits_truncate(1 << 12));
    }

    #[test]
    fn conditions() {
        let mut flags = FlagState::new();
        flags.apply_sub(OpSize::Bits8, 1, 2);
        assert!(flags.eval_condition(ConditionCode::Less));
        assert!(flags.eval_condition(ConditionCode::Carry));
        assert!(!flags.eval_condition(ConditionCode::Above));
        flags.apply_sub(OpSize::Bits8, 0x80, 1);
        assert!(flags.eval_condition(ConditionCode::Overflow));
        assert!(flags.eval_condition(ConditionCode::Less));
        assert!(flags.eval_condition(ConditionCode::Above));
    }
}
