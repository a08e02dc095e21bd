//! `xchg`, `xadd` and `cmpxchg`.
//!
//! When both operands name the same storage, the write to `dest` happens
//! last and determines the final value.

use cpu::context::CpuContext;
use cpu::exception::Fault;
use cpu::instr::{Gpr, Operand, Register};
use memory::Memory;

impl CpuContext {
    pub fn xchg<M: Memory>(&mut self, mem: &mut M, dest: &Operand, src: Register) -> Result<(), Fault> {
        let old = self.read_operand_rmw(mem, dest)?;
        let value = self.regs.get(src);
        self.regs.set(src, old);
        self.write_operand(mem, dest, value)
    }

    /// `xadd`: `src` receives the old value of `dest`, `dest` the sum.
    pub fn xadd<M: Memory>(&mut self, mem: &mut M, dest: &Operand, src: Register) -> Result<(), Fault> {
        let size = dest.size();
        let old = self.read_operand_rmw(mem, dest)?;
        let addend = self.regs.get(src);
        let sum = self.flags.apply_add(size, old, addend);
        self.regs.set(src, old);
        self.write_operand(mem, dest, sum)
    }

    /// `cmpxchg`: compares the accumulator with `dest` and either stores
    /// `src` to `dest` or loads `dest` into the accumulator.
    ///
    /// A memory destination is written back even when the comparison fails.
    pub fn cmpxchg<M: Memory>(&mut self, mem: &mut M, dest: &Operand, src: Register) -> Result<(), Fault> {
        let size = dest.size();
        let old = self.read_operand_rmw(mem, dest)?;
        let acc = self.regs.read_sized(Gpr::Rax, size);
        self.flags.apply_sub(size, acc, old);

        if acc == old {
            let value = self.regs.get(src);
            self.write_operand(mem, dest, value)
        } else {
            if let Operand::Mem(_) = dest {
                self.write_operand(mem, dest, old)?;
            }
            self.regs.write_sized(Gpr::Rax, size, old);
            Ok(())
        }
    }
}
