//! Control transfers: jumps, calls, returns, `iret` and loops.
//!
//! Every transfer runs in two phases. First all operands are read and all
//! checks performed, with stack writes going below a staged stack pointer.
//! Only then are `RIP`, `RSP` and the segment registers committed, so a
//! fault never leaves a half-completed transfer behind.

mod far;
mod gate;
mod iret;
mod near;

use cpu::context::{is_canonical, CpuContext};
use cpu::exception::Fault;
use cpu::instr::{Gpr, OpSize};
use cpu::protect::gp0;
use cpu::segment::{Descriptor, Segment, SegmentRegister, Selector};
use memory::Memory;

/// A stack that is being pushed to without moving the real stack pointer.
///
/// This may be the current stack or one that is not loaded into `SS` yet.
#[derive(Debug)]
pub(crate) struct StagedStack {
    reg: SegmentRegister,
    long64: bool,
    sp: u64,
    width: OpSize,
    error_code: u16,
}

impl StagedStack {
    fn with_reg(ctx: &CpuContext, reg: SegmentRegister, long64: bool, sp: u64, width: OpSize) -> Self {
        // Violations on a stack of another privilege level report its selector.
        let error_code = if reg.selector.rpl != ctx.cpl() {
            reg.selector.error_code()
        } else {
            0
        };
        Self { reg, long64, sp: sp & width.mask(), width, error_code }
    }

    /// The current stack at the current stack width.
    pub(crate) fn current(ctx: &CpuContext) -> Self {
        let reg = *ctx.segment(Segment::Ss);
        Self::with_reg(ctx, reg, ctx.mode().is_long64(), ctx.stack_pointer(), ctx.stack_size())
    }

    /// The current stack as seen by legacy code, with the width selected by
    /// `SS.B` even when running 64-bit code.
    pub(crate) fn legacy(ctx: &CpuContext) -> Self {
        let reg = *ctx.segment(Segment::Ss);
        let width = if reg.cache.d_b { OpSize::Bits32 } else { OpSize::Bits16 };
        let sp = ctx.regs.read_sized(Gpr::Rsp, width);
        Self::with_reg(ctx, reg, false, sp, width)
    }

    /// The flat 64-bit stack starting at `rsp`.
    pub(crate) fn flat(ctx: &CpuContext, rsp: u64) -> Self {
        let reg = *ctx.segment(Segment::Ss);
        let mut stack = Self::with_reg(ctx, reg, true, rsp, OpSize::Bits64);
        stack.error_code = 0;
        stack
    }

    /// A stack segment that has not been loaded yet.
    pub(crate) fn inner(ctx: &CpuContext, reg: SegmentRegister, sp: u64) -> Self {
        let width = if reg.cache.d_b { OpSize::Bits32 } else { OpSize::Bits16 };
        Self::with_reg(ctx, reg, false, sp, width)
    }

    pub(crate) fn push<M: Memory>(&mut self, ctx: &CpuContext, mem: &mut M, size: OpSize, value: u64) -> Result<(), Fault> {
        let sp = self.sp.wrapping_sub(size.bytes()) & self.width.mask();
        ctx.write_new_stack(mem, &self.reg, self.long64, sp, size, value & size.mask(), self.error_code)?;
        self.sp = sp;
        Ok(())
    }

    /// Writes the staged pointer into `RSP`, touching only the bits of the
    /// stack width.
    pub(crate) fn commit(&self, ctx: &mut CpuContext) {
        ctx.regs.write_sized(Gpr::Rsp, self.width, self.sp);
    }
}

impl CpuContext {
    /// Checks that `rip` lies within the current code segment (or is
    /// canonical, in 64-bit mode).
    pub(crate) fn check_near_target(&self, rip: u64) -> Result<(), Fault> {
        if self.mode().is_long64() {
            if !is_canonical(rip) {
                return Err(gp0(&format!("near branch to non-canonical {:#x}", rip)));
            }
        } else if rip > u64::from(self.segment(Segment::Cs).cache.limit_scaled) {
            return Err(gp0(&format!("near branch to {:#x} beyond CS limit", rip)));
        }
        Ok(())
    }

    /// Jumps to `rip` in the current code segment.
    pub(crate) fn branch_near(&mut self, rip: u64) -> Result<(), Fault> {
        self.check_near_target(rip)?;
        self.regs.set_rip(rip);
        Ok(())
    }

    /// Checks the entry point of a far transfer into the code segment
    /// `desc` and returns the new instruction pointer.
    pub(crate) fn far_target(&self, desc: &Descriptor, rip: u64) -> Result<u64, Fault> {
        if self.mode().is_long() && desc.long {
            if !is_canonical(rip) {
                return Err(gp0(&format!("far branch to non-canonical {:#x}", rip)));
            }
            Ok(rip)
        } else {
            let rip = rip & 0xffff_ffff;
            if rip > u64::from(desc.limit_scaled) {
                return Err(gp0(&format!("far branch to {:#x} beyond CS limit", rip)));
            }
            Ok(rip)
        }
    }

    /// Loads `CS` with the checked code segment `desc` at privilege level
    /// `cpl` and continues at `rip`.
    pub(crate) fn branch_far<M: Memory>(
        &mut self,
        mem: &mut M,
        selector: Selector,
        mut desc: Descriptor,
        rip: u64,
        cpl: u8,
    ) -> Result<(), Fault> {
        let rip = self.prepare_far(mem, &selector, &mut desc, rip)?;
        self.commit_far(selector, desc, rip, cpl);
        Ok(())
    }

    /// Does the fallible half of a far branch: checks the entry point and
    /// sets the accessed bit of the target code segment. No register is
    /// changed.
    pub(crate) fn prepare_far<M: Memory>(
        &self,
        mem: &mut M,
        selector: &Selector,
        desc: &mut Descriptor,
        rip: u64,
    ) -> Result<u64, Fault> {
        let rip = self.far_target(desc, rip)?;
        self.touch_segment(mem, selector, desc)?;
        Ok(rip)
    }

    /// Installs a prepared code segment and continues at `rip`.
    pub(crate) fn commit_far(&mut self, selector: Selector, desc: Descriptor, rip: u64, cpl: u8) {
        self.install_code_segment(selector, desc, cpl);
        self.regs.set_rip(rip);
        debug!("far branch to {}:{:#x}, CPL {}, {}", selector, rip, cpl, self.mode());
    }

    /// Far transfer in real and virtual-8086 mode.
    ///
    /// The limit of the current `CS` applies, since both modes never change
    /// it.
    pub(crate) fn branch_real(&mut self, selector: u16, rip: u64) -> Result<(), Fault> {
        self.check_real_target(rip)?;
        self.load_real_mode_segment(Segment::Cs, selector);
        self.regs.set_rip(rip);
        Ok(())
    }

    fn check_real_target(&self, rip: u64) -> Result<(), Fault> {
        if rip > u64::from(self.segment(Segment::Cs).cache.limit_scaled) {
            return Err(gp0(&format!("far branch to {:#x} beyond CS limit", rip)));
        }
        Ok(())
    }

    /// Signals that a hardware task switch to `selector` is required.
    fn task_switch(&self, selector: &Selector) -> Fault {
        debug!("task switch to {} requested", selector);
        Fault::TaskSwitch(selector.value)
    }

    /// Reads the stack slot `offset` bytes above the stack pointer `sp`.
    fn stack_slot<M: Memory>(&self, mem: &M, sp: u64, offset: u64, size: OpSize) -> Result<u64, Fault> {
        self.read_stack(mem, self.stack_offset(sp, offset as i64), size)
    }
}
