//! Opcode execution units for the integer instruction families.
//!
//! Each unit reads its resolved operands, computes a result, writes the
//! destination and hands carry or logic information to the flag engine.
//! Memory destinations are read with `read_operand_rmw`, which checks write
//! access before anything is loaded, so the final store of an instruction
//! cannot fault after flags or registers were already changed.

mod alu;
mod bcd;
mod bit;
mod data;
mod exchange;
mod flagctl;
mod mult;
mod shift;
mod system;

pub use self::shift::{double_shift_value, shift_value};

use cpu::context::CpuContext;
use cpu::exception::Fault;
use cpu::instr::{Gpr, Operand, OpSize};
use memory::Memory;

fn store_to_immediate(operand: &Operand) -> Fault {
    error!("instruction names immediate {:?} as its destination", operand);
    Fault::InvalidOpcode
}

impl CpuContext {
    /// Evaluates an operand by returning the immediate, reading a register or
    /// reading from memory.
    ///
    /// Immediates are zero-extended from their encoded width.
    pub fn read_operand<M: Memory>(&self, mem: &M, operand: &Operand) -> Result<u64, Fault> {
        Ok(match operand {
            Operand::Reg(reg) => self.regs.get(*reg),
            Operand::Imm(imm) => imm.zero_extended(),
            Operand::Mem(loc) => self.read(mem, loc.segment, loc.offset, loc.size)?,
        })
    }

    /// Evaluates a source operand for an operation of width `size`.
    ///
    /// Immediates are sign-extended to `size`, as `add r/m32, imm8` requires.
    pub(crate) fn read_source<M: Memory>(&self, mem: &M, operand: &Operand, size: OpSize) -> Result<u64, Fault> {
        match operand {
            Operand::Imm(imm) => Ok(imm.value_for(size)),
            _ => Ok(self.read_operand(mem, operand)? & size.mask()),
        }
    }

    /// Reads the destination of a read-modify-write instruction.
    pub fn read_operand_rmw<M: Memory>(&self, mem: &M, operand: &Operand) -> Result<u64, Fault> {
        match operand {
            Operand::Reg(reg) => Ok(self.regs.get(*reg)),
            Operand::Imm(_) => Err(store_to_immediate(operand)),
            Operand::Mem(loc) => self.read_rmw(mem, loc.segment, loc.offset, loc.size),
        }
    }

    /// Stores `value` (truncated to the operand size) to a register or
    /// memory operand.
    pub fn write_operand<M: Memory>(&mut self, mem: &mut M, operand: &Operand, value: u64) -> Result<(), Fault> {
        match operand {
            Operand::Reg(reg) => {
                self.regs.set(*reg, value);
                Ok(())
            }
            Operand::Imm(_) => Err(store_to_immediate(operand)),
            Operand::Mem(loc) => self.write_rmw(mem, loc.segment, loc.offset, loc.size, value & loc.size.mask()),
        }
    }

    /// Reads the double-width accumulator used by `div` and `idiv`: `AX`,
    /// `DX:AX`, `EDX:EAX` or `RDX:RAX`, as (high, low) halves.
    fn read_double(&self, size: OpSize) -> (u64, u64) {
        match size {
            OpSize::Bits8 => (u64::from(self.regs.ah()), u64::from(self.regs.al())),
            _ => (self.regs.read_sized(Gpr::Rdx, size), self.regs.read_sized(Gpr::Rax, size)),
        }
    }

    /// Writes a double-width result to the accumulator pair.
    fn write_double(&mut self, size: OpSize, high: u64, low: u64) {
        match size {
            OpSize::Bits8 => self.regs.set_ax((high as u16) << 8 | low as u16 & 0xff),
            _ => {
                self.regs.write_sized(Gpr::Rax, size, low);
                self.regs.write_sized(Gpr::Rdx, size, high);
            }
        }
    }
}
