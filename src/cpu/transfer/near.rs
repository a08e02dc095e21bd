//! Near jumps, calls, returns and loops.

use cpu::context::CpuContext;
use cpu::exception::Fault;
use cpu::instr::{ConditionCode, Gpr, LoopKind, OpSize};
use cpu::transfer::StagedStack;
use memory::Memory;

impl CpuContext {
    fn relative_target(&self, rel: i64, size: OpSize) -> u64 {
        self.regs.rip().wrapping_add(rel as u64) & size.mask()
    }

    /// Jumps to the absolute offset `target`, truncated to `size`.
    pub fn jump_near(&mut self, target: u64, size: OpSize) -> Result<(), Fault> {
        self.branch_near(target & size.mask())
    }

    /// Jumps relative to the next instruction.
    pub fn jump_rel(&mut self, rel: i64, size: OpSize) -> Result<(), Fault> {
        let target = self.relative_target(rel, size);
        self.branch_near(target)
    }

    /// Conditional relative jump. An untaken branch never faults.
    pub fn jump_if(&mut self, cc: ConditionCode, rel: i64, size: OpSize) -> Result<(), Fault> {
        if self.flags.eval_condition(cc) {
            self.jump_rel(rel, size)
        } else {
            Ok(())
        }
    }

    /// Pushes the address of the next instruction and jumps to `target`.
    ///
    /// The target is checked before anything is written to the stack.
    pub fn call_near<M: Memory>(&mut self, mem: &mut M, target: u64, size: OpSize) -> Result<(), Fault> {
        let target = target & size.mask();
        self.check_near_target(target)?;

        let mut stack = StagedStack::current(self);
        let ret = self.regs.rip();
        stack.push(self, mem, size, ret)?;

        stack.commit(self);
        self.regs.set_rip(target);
        Ok(())
    }

    /// Calls a procedure relative to the next instruction.
    pub fn call_rel<M: Memory>(&mut self, mem: &mut M, rel: i64, size: OpSize) -> Result<(), Fault> {
        let target = self.relative_target(rel, size);
        self.call_near(mem, target, size)
    }

    /// Pops the return address, then releases `pop` bytes of arguments.
    pub fn ret_near<M: Memory>(&mut self, mem: &M, pop: u16, size: OpSize) -> Result<(), Fault> {
        let sp = self.stack_pointer();
        let rip = self.read_stack(mem, sp, size)?;
        self.check_near_target(rip)?;

        let sp = self.stack_offset(sp, (size.bytes() + u64::from(pop)) as i64);
        self.set_stack_pointer(sp);
        self.regs.set_rip(rip);
        Ok(())
    }

    /// `loop`, `loope` and `loopne`.
    ///
    /// The target is validated whether or not the branch is taken, before the
    /// count register changes. On a fault, neither the count nor `RIP` is
    /// modified.
    pub fn loop_(&mut self, kind: LoopKind, rel: i64, size: OpSize, count_size: OpSize) -> Result<(), Fault> {
        let target = self.relative_target(rel, size);
        self.check_near_target(target)?;

        let count = self.regs.read_sized(Gpr::Rcx, count_size).wrapping_sub(1) & count_size.mask();
        let taken = count != 0 && match kind {
            LoopKind::Loop => true,
            LoopKind::Loope => self.flags.zf(),
            LoopKind::Loopne => !self.flags.zf(),
        };

        self.regs.write_sized(Gpr::Rcx, count_size, count);
        if taken {
            self.regs.set_rip(target);
        }
        Ok(())
    }

    /// `jcxz`, `jecxz` and `jrcxz`: branch if the count register is zero.
    pub fn jcxz(&mut self, rel: i64, size: OpSize, count_size: OpSize) -> Result<(), Fault> {
        if self.regs.read_sized(Gpr::Rcx, count_size) == 0 {
            self.jump_rel(rel, size)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use cpu::config::CpuConfig;
    use cpu::context::CpuContext;
    use cpu::exception::Fault;
    use cpu::instr::{LoopKind, OpSize};
    use cpu::segment::{Segment, SegmentRegister};
    use memory::{ArrayMemory, Memory};

    fn real_mode() -> (CpuContext, ArrayMemory) {
        let mut ctx = CpuContext::new(CpuConfig::default());
        ctx.set_segment(Segment::Cs, SegmentRegister::real_mode(0));
        ctx.set_segment(Segment::Ss, SegmentRegister::real_mode(0x1000));
        ctx.regs_mut().set_rsp(0x100);
        ctx.regs_mut().set_rip(0x200);
        (ctx, ArrayMemory::zeroed(0x20000))
    }

    #[test]
    fn near_branch_limit_boundary() {
        let (mut ctx, _) = real_mode();
        assert_eq!(ctx.jump_near(0xffff, OpSize::Bits16), Ok(()));
        assert_eq!(ctx.regs().rip(), 0xffff);
        assert_eq!(ctx.jump_near(0x1_0000, OpSize::Bits32), Err(Fault::GeneralProtection(0)));
        assert_eq!(ctx.regs().rip(), 0xffff);
        // 16-bit targets wrap instead
        assert_eq!(ctx.jump_near(0x1_0000, OpSize::Bits16), Ok(()));
        assert_eq!(ctx.regs().rip(), 0);
    }

    #[test]
    fn call_and_return() {
        let (mut ctx, mut mem) = real_mode();
        ctx.call_rel(&mut mem, 0x100, OpSize::Bits16).unwrap();
        assert_eq!(ctx.regs().rip(), 0x300);
        assert_eq!(ctx.regs().sp(), 0xfe);
        assert_eq!(mem.load_u16(0x100fe).unwrap(), 0x200);

        ctx.ret_near(&mem, 4, OpSize::Bits16).unwrap();
        assert_eq!(ctx.regs().rip(), 0x200);
        assert_eq!(ctx.regs().sp(), 0x104);
    }

    #[test]
    fn failed_call_writes_nothing() {
        let (mut ctx, mut mem) = real_mode();
        let mut cs = *ctx.segment(Segment::Cs);
        cs.cache.limit_scaled = 0x1000;
        ctx.set_segment(Segment::Cs, cs);
        assert_eq!(ctx.call_near(&mut mem, 0x1001, OpSize::Bits32), Err(Fault::GeneralProtection(0)));
        assert_eq!(ctx.regs().sp(), 0x100);
        assert_eq!(mem.load_u32(0x100fc).unwrap(), 0);
    }

    #[test]
    fn loop_variants() {
        let (mut ctx, _) = real_mode();
        ctx.regs_mut().set_cx(2);
        ctx.loop_(LoopKind::Loop, -0x10, OpSize::Bits16, OpSize::Bits16).unwrap();
        assert_eq!(ctx.regs().cx(), 1);
        assert_eq!(ctx.regs().rip(), 0x1f0);
        ctx.loop_(LoopKind::Loop, -0x10, OpSize::Bits16, OpSize::Bits16).unwrap();
        assert_eq!(ctx.regs().cx(), 0);
        assert_eq!(ctx.regs().rip(), 0x1f0);

        ctx.regs_mut().set_cx(5);
        ctx.flags_mut().clear_zf();
        ctx.loop_(LoopKind::Loope, 0x10, OpSize::Bits16, OpSize::Bits16).unwrap();
        assert_eq!(ctx.regs().cx(), 4);
        assert_eq!(ctx.regs().rip(), 0x1f0);
        ctx.loop_(LoopKind::Loopne, 0x10, OpSize::Bits16, OpSize::Bits16).unwrap();
        assert_eq!(ctx.regs().rip(), 0x200);

        // only CX is counted with a 16-bit address size
        ctx.regs_mut().set_ecx(0x1_0000);
        ctx.loop_(LoopKind::Loop, 0, OpSize::Bits16, OpSize::Bits16).unwrap();
        assert_eq!(ctx.regs().ecx(), 0x1_ffff);
    }

    #[test]
    fn jcxz_only_checks_taken_branch() {
        let (mut ctx, _) = real_mode();
        ctx.regs_mut().set_ecx(1);
        assert_eq!(ctx.jcxz(0x7fff_0000, OpSize::Bits32, OpSize::Bits32), Ok(()));
        ctx.regs_mut().set_ecx(0);
        assert_eq!(ctx.jcxz(0x7fff_0000, OpSize::Bits32, OpSize::Bits32), Err(Fault::GeneralProtection(0)));
        assert_eq!(ctx.jcxz(0x10, OpSize::Bits32, OpSize::Bits32), Ok(()));
        assert_eq!(ctx.regs().rip(), 0x210);
    }
}
