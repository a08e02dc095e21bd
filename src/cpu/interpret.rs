//! x86 interpreter.

use cpu::context::CpuContext;
use cpu::exception::Fault;
use cpu::instr::*;
use cpu::ExecutionEngine;
use memory::Memory;

/// Executes decoded instructions against a `CpuContext` and a memory.
///
/// Fetching and decoding is up to the caller, which must advance `RIP` past
/// each instruction before handing it to `execute`.
#[derive(Debug)]
pub struct Interpreter<M: Memory> {
    cpu: CpuContext,
    mem: M,
}

impl<M: Memory> Interpreter<M> {
    /// Creates a new interpreter.
    ///
    /// # Parameters
    ///
    /// * `cpu`: The initial CPU state, usually `CpuContext::new` (the reset
    ///   state) with some registers adjusted.
    /// * `mem`: The memory to operate on.
    pub fn new(cpu: CpuContext, mem: M) -> Self {
        Self { cpu, mem }
    }

    pub fn cpu(&self) -> &CpuContext {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut CpuContext {
        &mut self.cpu
    }

    pub fn mem(&self) -> &M {
        &self.mem
    }

    pub fn mem_mut(&mut self) -> &mut M {
        &mut self.mem
    }

    /// Consumes the interpreter and returns its parts.
    pub fn into_parts(self) -> (CpuContext, M) {
        (self.cpu, self.mem)
    }
}

impl<M: Memory> ExecutionEngine for Interpreter<M> {
    type Memory = M;

    fn context(&mut self) -> &mut CpuContext {
        &mut self.cpu
    }

    fn memory(&mut self) -> &mut M {
        &mut self.mem
    }

    /// Execute a decoded instruction and perform its side effects.
    fn execute(&mut self, instr: &Instr) -> Result<(), Fault> {
        use cpu::instr::Instr::*;

        trace!("{:#06x}: {:?}", self.cpu.regs().rip(), instr);

        let cpu = &mut self.cpu;
        let mem = &mut self.mem;
        match instr {
            Alu { op, dest, src } => cpu.alu(mem, *op, dest, src)?,
            Test { lhs, rhs } => cpu.test(mem, lhs, rhs)?,
            Not { operand } => cpu.not(mem, operand)?,
            Neg { operand } => cpu.neg(mem, operand)?,
            Inc { operand } => cpu.inc(mem, operand)?,
            Dec { operand } => cpu.dec(mem, operand)?,
            Mul { operand } => cpu.mul(mem, operand)?,
            Imul { operand } => cpu.imul(mem, operand)?,
            ImulTrunc { dest, src1, src2 } => cpu.imul_trunc(mem, *dest, src1, src2)?,
            Div { operand } => cpu.div(mem, operand)?,
            Idiv { operand } => cpu.idiv(mem, operand)?,

            Shift { op, dest, count } => cpu.shift(mem, *op, dest, count)?,
            DoubleShift { left, dest, src, count } => cpu.double_shift(mem, *left, dest, *src, count)?,
            BitTest { op, dest, bit } => cpu.bit_test(mem, *op, dest, bit)?,
            BitScan { reverse, dest, src } => cpu.bit_scan(mem, *reverse, *dest, src)?,
            Bswap { reg } => cpu.bswap(*reg),

            Mov { dest, src } => cpu.mov(mem, dest, src)?,
            MovZx { dest, src } => cpu.movzx(mem, *dest, src)?,
            MovSx { dest, src } => cpu.movsx(mem, *dest, src)?,
            Convert { size } => cpu.convert(*size),
            ConvertDouble { size } => cpu.convert_double(*size),
            Cmov { cc, dest, src } => cpu.cmov(mem, *cc, *dest, src)?,
            SetIf { cc, operand } => cpu.set_if(mem, *cc, operand)?,
            Xchg { dest, src } => cpu.xchg(mem, dest, *src)?,
            Xadd { dest, src } => cpu.xadd(mem, dest, *src)?,
            Cmpxchg { dest, src } => cpu.cmpxchg(mem, dest, *src)?,
            Push { operand } => cpu.push_operand(mem, operand)?,
            Pop { operand } => cpu.pop_operand(mem, operand)?,
            PushSeg { seg, size } => cpu.push_seg(mem, *seg, *size)?,
            PopSeg { seg, size } => cpu.pop_seg(mem, *seg, *size)?,
            MovToSeg { seg, src } => cpu.mov_to_seg(mem, *seg, src)?,
            MovFromSeg { dest, seg } => cpu.mov_from_seg(mem, dest, *seg)?,
            Leave { size } => cpu.leave(mem, *size)?,

            Aaa => cpu.aaa(),
            Aas => cpu.aas(),
            Aam { base } => cpu.aam(*base)?,
            Aad { base } => cpu.aad(*base),
            Daa => cpu.daa(),
            Das => cpu.das(),

            Clc => cpu.clc(),
            Stc => cpu.stc(),
            Cmc => cpu.cmc(),
            Cld => cpu.cld(),
            Std => cpu.std(),
            Cli => cpu.cli()?,
            Sti => cpu.sti()?,
            Lahf => cpu.lahf(),
            Sahf => cpu.sahf(),
            Pushf { size } => cpu.pushf(mem, *size)?,
            Popf { size } => cpu.popf(mem, *size)?,

            MovToCr { cr, src } => cpu.mov_to_cr(*cr, *src)?,
            MovFromCr { dest, cr } => cpu.mov_from_cr(*dest, *cr)?,
            Rdmsr => cpu.rdmsr()?,
            Wrmsr => cpu.wrmsr()?,

            Jump { target } => {
                let rip = cpu.read_operand(mem, target)?;
                cpu.jump_near(rip, target.size())?;
            }
            JumpRel { rel, size } => cpu.jump_rel(*rel, *size)?,
            JumpIf { cc, rel, size } => cpu.jump_if(*cc, *rel, *size)?,
            JumpFar { selector, offset, size } => cpu.jump_far(mem, *selector, *offset, *size)?,
            JumpFarIndirect { ptr, size } => {
                let (selector, offset) = cpu.read_far_pointer(mem, ptr, *size)?;
                cpu.jump_far(mem, selector, offset, *size)?;
            }
            Call { target, size } => {
                let rip = cpu.read_operand(mem, target)?;
                cpu.call_near(mem, rip, *size)?;
            }
            CallRel { rel, size } => cpu.call_rel(mem, *rel, *size)?,
            CallFar { selector, offset, size } => cpu.call_far(mem, *selector, *offset, *size)?,
            CallFarIndirect { ptr, size } => {
                let (selector, offset) = cpu.read_far_pointer(mem, ptr, *size)?;
                cpu.call_far(mem, selector, offset, *size)?;
            }
            Ret { pop, size } => cpu.ret_near(mem, *pop, *size)?,
            RetFar { pop, size } => cpu.ret_far(mem, *pop, *size)?,
            Iret { size } => cpu.iret(mem, *size)?,
            Loop { kind, rel, size, count_size } => cpu.loop_(*kind, *rel, *size, *count_size)?,
            Jcxz { rel, size, count_size } => cpu.jcxz(*rel, *size, *count_size)?,
        }

        Ok(())
    }
}
