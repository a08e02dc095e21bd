//! Flag control instructions.
//!
//! `cli`, `sti`, `pushf` and `popf` are sensitive to `IOPL`. In virtual-8086
//! mode with `CR4.VME`, and in protected mode at CPL 3 with `CR4.PVI`, the
//! interrupt flag they would touch is virtualized through `VIF`.

use cpu::config::CpuLevel;
use cpu::context::CpuContext;
use cpu::control::Cr4;
use cpu::exception::Fault;
use cpu::flags::FlagSet;
use cpu::instr::OpSize;
use cpu::mode::ExecutionMode;
use cpu::protect::gp0;
use memory::Memory;

impl CpuContext {
    pub fn clc(&mut self) {
        self.flags.clear_cf();
    }

    pub fn stc(&mut self) {
        self.flags.assert_cf();
    }

    pub fn cmc(&mut self) {
        let cf = self.flags.cf();
        self.flags.set_cf(!cf);
    }

    pub fn cld(&mut self) {
        self.flags.set_df(false);
    }

    pub fn std(&mut self) {
        self.flags.set_df(true);
    }

    /// `lahf`: `AH = SF:ZF:0:AF:0:PF:1:CF`.
    pub fn lahf(&mut self) {
        let low = self.eflags() as u8;
        self.regs.set_ah(low);
    }

    /// `sahf`: loads `SF`, `ZF`, `AF`, `PF` and `CF` from `AH`. `OF` keeps
    /// its value.
    pub fn sahf(&mut self) {
        let mask = FlagSet::SF | FlagSet::ZF | FlagSet::AF | FlagSet::PF | FlagSet::CF;
        let mut flags = FlagSet::from_bits_truncate(u32::from(self.regs.ah())) & mask;
        flags.set(FlagSet::OF, self.flags.of());
        self.flags.load_arithmetic(flags);
    }

    /// Clears `IF`, or `VIF` when interrupts are virtualized.
    pub fn cli(&mut self) -> Result<(), Fault> {
        let iopl = self.flags.iopl();
        let cr4 = self.control.cr4();
        let mode = self.mode();
        if mode.is_protected() {
            let cpl = self.cpl();
            if cr4.contains(Cr4::PVI) && cpl == 3 {
                if iopl < 3 {
                    self.flags.set_vif(false);
                    return Ok(());
                }
            } else if iopl < cpl {
                return Err(gp0("cli with IOPL < CPL"));
            }
        } else if mode == ExecutionMode::Virtual8086 && iopl != 3 {
            if cr4.contains(Cr4::VME) {
                self.flags.set_vif(false);
                return Ok(());
            }
            return Err(gp0("cli in v8086 mode with IOPL < 3"));
        }

        self.flags.set_interrupts_enabled(false);
        Ok(())
    }

    /// Sets `IF`, or `VIF` when interrupts are virtualized and no virtual
    /// interrupt is pending.
    pub fn sti(&mut self) -> Result<(), Fault> {
        let iopl = self.flags.iopl();
        let cr4 = self.control.cr4();
        let mode = self.mode();
        if mode.is_protected() {
            let cpl = self.cpl();
            if cr4.contains(Cr4::PVI) && cpl == 3 && iopl < 3 {
                if self.flags.vip() {
                    return Err(gp0("sti with a virtual interrupt pending"));
                }
                self.flags.set_vif(true);
                return Ok(());
            }
            if cpl > iopl {
                return Err(gp0("sti with CPL > IOPL"));
            }
        } else if mode == ExecutionMode::Virtual8086 && iopl != 3 {
            if cr4.contains(Cr4::VME) && !self.flags.vip() {
                self.flags.set_vif(true);
                return Ok(());
            }
            return Err(gp0("sti in v8086 mode with IOPL < 3"));
        }

        self.flags.set_interrupts_enabled(true);
        Ok(())
    }

    /// Pushes `FLAGS`, `EFLAGS` or `RFLAGS`. `VM` and `RF` read as zero.
    pub fn pushf<M: Memory>(&mut self, mem: &mut M, size: OpSize) -> Result<(), Fault> {
        let v8086_iopl = self.mode() == ExecutionMode::Virtual8086 && self.flags.iopl() < 3;
        let mut flags = self.eflags();

        if size == OpSize::Bits16 {
            flags &= 0xffff;
            if v8086_iopl {
                if !self.control.cr4().contains(Cr4::VME) {
                    return Err(gp0("pushf in v8086 mode with IOPL < 3"));
                }
                flags |= FlagSet::IOPL.bits();
                flags &= !FlagSet::IF.bits();
                if self.flags.vif() {
                    flags |= FlagSet::IF.bits();
                }
            }
        } else {
            if v8086_iopl {
                return Err(gp0("32-bit pushf in v8086 mode with IOPL < 3"));
            }
            flags &= 0x00fc_ffff;
        }

        self.push(mem, size, u64::from(flags))
    }

    /// Pops into the flags register. Which system flags may change depends on
    /// the mode, the CPL and IOPL.
    pub fn popf<M: Memory>(&mut self, mem: &M, size: OpSize) -> Result<(), Fault> {
        let sp = self.stack_pointer();
        let value = self.read_stack(mem, sp, size)? as u32;
        let new_sp = self.stack_offset(sp, size.bytes() as i64);

        let mode = self.mode();
        let iopl = self.flags.iopl();
        let cpl = self.cpl();
        let mut mask = FlagSet::OSZAPC | FlagSet::TF | FlagSet::DF | FlagSet::NT;
        let mut value = value;

        if size == OpSize::Bits16 {
            value &= 0xffff;
        } else {
            mask |= FlagSet::RF;
            if self.config.level() >= CpuLevel::I486 {
                mask |= FlagSet::ID | FlagSet::AC;
            }
            value &= !FlagSet::RF.bits();
        }

        match mode {
            ExecutionMode::Real => mask |= FlagSet::IOPL | FlagSet::IF,
            ExecutionMode::Virtual8086 => {
                if iopl < 3 {
                    if size != OpSize::Bits16 || !self.control.cr4().contains(Cr4::VME) {
                        return Err(gp0("popf in v8086 mode with IOPL < 3"));
                    }
                    let flags = FlagSet::from_bits_truncate(value);
                    if (flags.contains(FlagSet::IF) && self.flags.vip()) || flags.contains(FlagSet::TF) {
                        return Err(gp0("virtual popf would enable interrupts with VIP set, or set TF"));
                    }
                    mask |= FlagSet::VIF;
                    if flags.contains(FlagSet::IF) {
                        value |= FlagSet::VIF.bits();
                    }
                } else {
                    mask |= FlagSet::IF;
                }
            }
            ExecutionMode::Protected | ExecutionMode::Compatibility | ExecutionMode::Long64 => {
                if cpl == 0 {
                    mask |= FlagSet::IOPL;
                }
                if cpl <= iopl {
                    mask |= FlagSet::IF;
                }
            }
        }

        trace!("popf {:#x} with change mask {:?}", value, mask);
        self.set_stack_pointer(new_sp);
        self.write_eflags(value, mask.bits());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use cpu::config::{CpuConfig, CpuLevel};
    use cpu::context::CpuContext;
    use cpu::control::Cr4;
    use cpu::exception::Fault;
    use cpu::flags::FlagSet;
    use cpu::instr::OpSize;
    use cpu::mode::ExecutionMode;
    use memory::{ArrayMemory, Memory};

    fn real() -> (CpuContext, ArrayMemory) {
        let mut ctx = CpuContext::new(CpuConfig::default());
        ctx.regs_mut().set_sp(0x1000);
        (ctx, ArrayMemory::zeroed(0x110000))
    }

    /// Virtual-8086 mode with the given IOPL and `CR4` bits.
    fn v8086(iopl: u8, cr4: Cr4) -> (CpuContext, ArrayMemory) {
        let (mut ctx, mem) = real();
        ctx.write_cr0(0x6000_0011).unwrap();
        ctx.write_cr4(u64::from(cr4.bits())).unwrap();
        ctx.write_eflags(FlagSet::VM.bits() | u32::from(iopl) << 12, (FlagSet::VM | FlagSet::IOPL).bits());
        ctx.init_v8086_mode();
        assert_eq!(ctx.mode(), ExecutionMode::Virtual8086);
        (ctx, mem)
    }

    #[test]
    fn carry_and_direction() {
        let (mut ctx, _) = real();
        ctx.stc();
        assert!(ctx.flags().cf());
        ctx.cmc();
        assert!(!ctx.flags().cf());
        ctx.std();
        assert!(ctx.flags().df());
        ctx.cld();
        assert!(!ctx.flags().df());
    }

    #[test]
    fn ah_transfers() {
        let (mut ctx, _) = real();
        ctx.flags_mut().assert_of();
        ctx.regs_mut().set_ah(0xd5);
        ctx.sahf();
        assert!(ctx.flags().sf() && ctx.flags().zf() && ctx.flags().af());
        assert!(ctx.flags().pf() && ctx.flags().cf());
        assert!(ctx.flags().of());

        ctx.regs_mut().set_ah(0);
        ctx.lahf();
        assert_eq!(ctx.regs().ah(), 0xd7);
    }

    #[test]
    fn real_mode_popf_changes_system_flags() {
        let (mut ctx, mut mem) = real();
        mem.store_u16(0x1000, 0x3202).unwrap();
        ctx.popf(&mem, OpSize::Bits16).unwrap();
        assert_eq!(ctx.flags().iopl(), 3);
        assert!(ctx.flags().interrupts_enabled());
        assert_eq!(ctx.regs().sp(), 0x1002);

        ctx.pushf(&mut mem, OpSize::Bits32).unwrap();
        assert_eq!(mem.load_u32(0xffe).unwrap(), 0x3202);
    }

    #[test]
    fn popf_at_user_level_keeps_iopl_and_if() {
        let (mut ctx, mut mem) = v8086(3, Cr4::empty());
        mem.store_u32(0x1000, 0x0024_0200).unwrap();
        ctx.popf(&mem, OpSize::Bits32).unwrap();
        // IOPL 3 allows IF in v8086 mode, but never IOPL itself
        assert!(ctx.flags().interrupts_enabled());
        assert_eq!(ctx.flags().iopl(), 3);
        assert!(ctx.flags().id() && ctx.flags().ac());
        assert!(ctx.flags().vm());
    }

    #[test]
    fn i386_popf_cannot_set_ac() {
        let mut ctx = CpuContext::new(CpuConfig::default().with_level(CpuLevel::I386));
        let mut mem = ArrayMemory::zeroed(0x2000);
        ctx.regs_mut().set_sp(0x1000);
        mem.store_u32(0x1000, 0x0004_0000).unwrap();
        ctx.popf(&mem, OpSize::Bits32).unwrap();
        assert!(!ctx.flags().ac());
    }

    #[test]
    fn v8086_without_vme_faults() {
        let (mut ctx, mut mem) = v8086(0, Cr4::empty());
        assert_eq!(ctx.cli(), Err(Fault::GeneralProtection(0)));
        assert_eq!(ctx.sti(), Err(Fault::GeneralProtection(0)));
        assert_eq!(ctx.pushf(&mut mem, OpSize::Bits16), Err(Fault::GeneralProtection(0)));
        assert_eq!(ctx.popf(&mem, OpSize::Bits16), Err(Fault::GeneralProtection(0)));
        assert_eq!(ctx.regs().sp(), 0x1000);
    }

    #[test]
    fn vme_virtualizes_interrupt_flag() {
        let (mut ctx, mut mem) = v8086(0, Cr4::VME);
        ctx.sti().unwrap();
        assert!(ctx.flags().vif());
        assert!(!ctx.flags().interrupts_enabled());

        ctx.pushf(&mut mem, OpSize::Bits16).unwrap();
        let pushed = mem.load_u16(0xffe).unwrap();
        assert_eq!(pushed & 0x3200, 0x3200);

        ctx.cli().unwrap();
        assert!(!ctx.flags().vif());
        ctx.popf(&mem, OpSize::Bits16).unwrap();
        assert!(ctx.flags().vif());
        assert!(!ctx.flags().interrupts_enabled());

        // 32-bit forms are not virtualized
        assert_eq!(ctx.pushf(&mut mem, OpSize::Bits32), Err(Fault::GeneralProtection(0)));
    }

    #[test]
    fn vme_pending_interrupt() {
        let (mut ctx, mut mem) = v8086(0, Cr4::VME);
        ctx.flags_mut().set_vip(true);
        assert_eq!(ctx.sti(), Err(Fault::GeneralProtection(0)));

        mem.store_u16(0xffe, 0x0200).unwrap();
        ctx.regs_mut().set_sp(0xffe);
        assert_eq!(ctx.popf(&mem, OpSize::Bits16), Err(Fault::GeneralProtection(0)));
        assert_eq!(ctx.regs().sp(), 0xffe);
    }
}
