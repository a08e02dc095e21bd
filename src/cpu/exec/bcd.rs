//! Decimal and ASCII adjust instructions.
//!
//! `AF` and `CF` come from the adjustment itself. The remaining arithmetic
//! flags are derived from the adjusted `AL` like a logic instruction would,
//! which is what P6 family processors do. Intel documents them as undefined.

use cpu::context::CpuContext;
use cpu::exception::Fault;
use cpu::instr::OpSize;

impl CpuContext {
    fn set_adjusted_al(&mut self, al: u8, cf: bool, af: bool) {
        self.regs.set_al(al);
        self.flags.apply_logic(OpSize::Bits8, u64::from(al));
        self.flags.set_cf(cf);
        self.flags.set_af(af);
    }

    /// ASCII adjust after addition.
    pub fn aaa(&mut self) {
        let adjust = self.regs.al() & 0x0f > 9 || self.flags.af();
        if adjust {
            let ax = self.regs.ax().wrapping_add(0x106);
            self.regs.set_ax(ax);
        }
        let al = self.regs.al() & 0x0f;
        self.set_adjusted_al(al, adjust, adjust);
    }

    /// ASCII adjust after subtraction.
    pub fn aas(&mut self) {
        let adjust = self.regs.al() & 0x0f > 9 || self.flags.af();
        if adjust {
            let ax = self.regs.ax().wrapping_sub(0x106);
            self.regs.set_ax(ax);
        }
        let al = self.regs.al() & 0x0f;
        self.set_adjusted_al(al, adjust, adjust);
    }

    /// ASCII adjust after multiply: splits `AL` into digits of `base`.
    pub fn aam(&mut self, base: u8) -> Result<(), Fault> {
        if base == 0 {
            error!("#DE: aam with base 0");
            return Err(Fault::DivideError);
        }
        let al = self.regs.al();
        self.regs.set_ah(al / base);
        self.regs.set_al(al % base);
        self.flags.apply_logic(OpSize::Bits8, u64::from(al % base));
        Ok(())
    }

    /// ASCII adjust before division: `AL = AH * base + AL`, `AH = 0`.
    pub fn aad(&mut self, base: u8) {
        let value = u16::from(self.regs.ah()) * u16::from(base) + u16::from(self.regs.al());
        let al = value as u8;
        self.regs.set_ax(u16::from(al));
        self.flags.apply_logic(OpSize::Bits8, u64::from(al));
    }

    /// Decimal adjust after addition.
    pub fn daa(&mut self) {
        let orig = self.regs.al();
        let mut al = orig;
        let (mut cf, mut af) = (false, false);
        if al & 0x0f > 9 || self.flags.af() {
            cf = al > 0xf9 || self.flags.cf();
            al = al.wrapping_add(6);
            af = true;
        }
        if orig > 0x99 || self.flags.cf() {
            al = al.wrapping_add(0x60);
            cf = true;
        }
        self.set_adjusted_al(al, cf, af);
    }

    /// Decimal adjust after subtraction.
    pub fn das(&mut self) {
        let orig = self.regs.al();
        let mut al = orig;
        let (mut cf, mut af) = (false, false);
        if al & 0x0f > 9 || self.flags.af() {
            cf = al < 6 || self.flags.cf();
            al = al.wrapping_sub(6);
            af = true;
        }
        if orig > 0x99 || self.flags.cf() {
            al = al.wrapping_sub(0x60);
            cf = true;
        }
        self.set_adjusted_al(al, cf, af);
    }
}
