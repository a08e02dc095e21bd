//! Data movement: `mov` and its extending forms, accumulator conversions,
//! conditional moves and sets, the stack and segment register moves.

use cpu::context::CpuContext;
use cpu::exception::Fault;
use cpu::instr::{ConditionCode, Gpr, Operand, OpSize, Register};
use cpu::segment::Segment;
use memory::Memory;

impl CpuContext {
    pub fn mov<M: Memory>(&mut self, mem: &mut M, dest: &Operand, src: &Operand) -> Result<(), Fault> {
        let value = self.read_source(mem, src, dest.size())?;
        self.write_operand(mem, dest, value)
    }

    /// `movzx`: `src` is zero-extended to the size of `dest`.
    pub fn movzx<M: Memory>(&mut self, mem: &M, dest: Register, src: &Operand) -> Result<(), Fault> {
        let value = self.read_operand(mem, src)? & src.size().mask();
        self.regs.set(dest, value);
        Ok(())
    }

    /// `movsx` and `movsxd`.
    pub fn movsx<M: Memory>(&mut self, mem: &M, dest: Register, src: &Operand) -> Result<(), Fault> {
        let size = src.size();
        let value = size.sign_extend(self.read_operand(mem, src)? & size.mask());
        self.regs.set(dest, value);
        Ok(())
    }

    /// `cbw`, `cwde` and `cdqe`: sign-extends the lower half of the
    /// accumulator of width `size`.
    pub fn convert(&mut self, size: OpSize) {
        let half = match size {
            OpSize::Bits16 => OpSize::Bits8,
            OpSize::Bits32 => OpSize::Bits16,
            _ => OpSize::Bits32,
        };
        let value = half.sign_extend(self.regs.read_sized(Gpr::Rax, half));
        self.regs.write_sized(Gpr::Rax, size, value);
    }

    /// `cwd`, `cdq` and `cqo`: fills `D` with the sign of `A`.
    pub fn convert_double(&mut self, size: OpSize) {
        let sign = size.msb(self.regs.read_sized(Gpr::Rax, size));
        self.regs.write_sized(Gpr::Rdx, size, if sign { !0 } else { 0 });
    }

    /// `cmovcc`. The source is read (and can fault) even if the condition is
    /// false, in which case a 32-bit destination is still zero-extended.
    pub fn cmov<M: Memory>(&mut self, mem: &M, cc: ConditionCode, dest: Register, src: &Operand) -> Result<(), Fault> {
        let value = self.read_operand(mem, src)?;
        if self.flags.eval_condition(cc) {
            self.regs.set(dest, value);
        } else {
            let old = self.regs.get(dest);
            self.regs.set(dest, old);
        }
        Ok(())
    }

    pub fn set_if<M: Memory>(&mut self, mem: &mut M, cc: ConditionCode, operand: &Operand) -> Result<(), Fault> {
        let value = self.flags.eval_condition(cc) as u64;
        self.write_operand(mem, operand, value)
    }

    /// Pushes a register, immediate or memory operand, at the operand's size.
    pub fn push_operand<M: Memory>(&mut self, mem: &mut M, operand: &Operand) -> Result<(), Fault> {
        let size = operand.size();
        let value = self.read_source(mem, operand, size)?;
        self.push(mem, size, value)
    }

    /// Pops into a register or memory operand.
    ///
    /// A memory destination is written before the stack pointer moves, so a
    /// faulting store leaves the stack as it was. A register destination is
    /// written last, so `pop sp` loads the popped value.
    pub fn pop_operand<M: Memory>(&mut self, mem: &mut M, operand: &Operand) -> Result<(), Fault> {
        let size = operand.size();
        let sp = self.stack_pointer();
        let value = self.read_stack(mem, sp, size)?;
        let new_sp = self.stack_offset(sp, size.bytes() as i64);
        match operand {
            Operand::Reg(reg) => {
                self.set_stack_pointer(new_sp);
                self.regs.set(*reg, value);
            }
            _ => {
                self.write_operand(mem, operand, value)?;
                self.set_stack_pointer(new_sp);
            }
        }
        Ok(())
    }

    pub fn push_seg<M: Memory>(&mut self, mem: &mut M, seg: Segment, size: OpSize) -> Result<(), Fault> {
        let selector = self.segment(seg).selector.value;
        self.push(mem, size, u64::from(selector))
    }

    /// Pops a selector into `seg`. The stack pointer only moves once the
    /// segment register was loaded successfully.
    pub fn pop_seg<M: Memory>(&mut self, mem: &mut M, seg: Segment, size: OpSize) -> Result<(), Fault> {
        let stack_size = self.stack_size();
        let sp = self.stack_pointer();
        let value = self.read_stack(mem, sp, size)?;
        let new_sp = self.stack_offset(sp, size.bytes() as i64);
        self.load_segment_register(mem, seg, value as u16)?;
        // loading SS may change the stack width, the pop used the old one
        self.regs.write_sized(Gpr::Rsp, stack_size, new_sp);
        Ok(())
    }

    pub fn mov_to_seg<M: Memory>(&mut self, mem: &mut M, seg: Segment, src: &Operand) -> Result<(), Fault> {
        let value = self.read_operand(mem, src)? as u16;
        self.load_segment_register(mem, seg, value)
    }

    /// Stores a selector. Register destinations are zero-extended to the
    /// operand size, memory destinations are always 16 bits wide.
    pub fn mov_from_seg<M: Memory>(&mut self, mem: &mut M, dest: &Operand, seg: Segment) -> Result<(), Fault> {
        let selector = u64::from(self.segment(seg).selector.value);
        self.write_operand(mem, dest, selector)
    }

    /// `leave`: releases the frame set up by `enter`.
    pub fn leave<M: Memory>(&mut self, mem: &M, size: OpSize) -> Result<(), Fault> {
        let frame = self.regs.read_sized(Gpr::Rbp, self.stack_size());
        let value = self.read_stack(mem, frame, size)?;
        let new_sp = self.stack_offset(frame, size.bytes() as i64);
        self.set_stack_pointer(new_sp);
        self.regs.write_sized(Gpr::Rbp, size, value);
        Ok(())
    }
}
