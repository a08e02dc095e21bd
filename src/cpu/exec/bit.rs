//! Bit test, bit scan and byte swap instructions.

use cpu::context::CpuContext;
use cpu::exception::Fault;
use cpu::instr::{BitTestOp, MemoryLocation, Operand, OpSize, Register};
use memory::Memory;

impl CpuContext {
    /// `bt`, `bts`, `btr` and `btc`: copies the selected bit into `CF` and
    /// optionally modifies it. No other flag changes.
    pub fn bit_test<M: Memory>(&mut self, mem: &mut M, op: BitTestOp, dest: &Operand, bit: &Operand) -> Result<(), Fault> {
        let size = dest.size();
        let offset = self.read_operand(mem, bit)?;

        let index = offset & u64::from(size.bits() - 1);

        // a register offset addresses memory as a bit string
        let dest = match (dest, bit) {
            (Operand::Mem(loc), Operand::Reg(_)) => {
                let signed = size.sign_extend(offset & size.mask()) as i64;
                let displacement = (signed >> size.bits().trailing_zeros()) * size.bytes() as i64;
                let mut target = loc.offset.wrapping_add(displacement as u64);
                if !self.mode().is_long64() {
                    target &= 0xffff_ffff;
                }
                Operand::Mem(MemoryLocation::new(loc.segment, target, size))
            }
            _ => *dest,
        };

        let value = if op == BitTestOp::Bt {
            self.read_operand(mem, &dest)?
        } else {
            self.read_operand_rmw(mem, &dest)?
        };
        let mask = 1u64 << index;
        let new = match op {
            BitTestOp::Bt => None,
            BitTestOp::Bts => Some(value | mask),
            BitTestOp::Btr => Some(value & !mask),
            BitTestOp::Btc => Some(value ^ mask),
        };
        if let Some(new) = new {
            self.write_operand(mem, &dest, new)?;
        }
        self.flags.set_cf(value & mask != 0);
        Ok(())
    }

    /// `bsf` and `bsr`. A zero source sets `ZF` and leaves `dest` unchanged.
    pub fn bit_scan<M: Memory>(&mut self, mem: &M, reverse: bool, dest: Register, src: &Operand) -> Result<(), Fault> {
        let size = dest.size();
        let value = self.read_source(mem, src, size)?;
        if value == 0 {
            self.flags.assert_zf();
            return Ok(());
        }

        let index = if reverse {
            63 - value.leading_zeros()
        } else {
            value.trailing_zeros()
        };
        self.flags.apply_logic(size, u64::from(index));
        self.flags.clear_zf();
        self.regs.set(dest, u64::from(index));
        Ok(())
    }

    /// Reverses the byte order of a register. The result of the 16-bit form
    /// is undefined; it is zero here.
    pub fn bswap(&mut self, reg: Register) {
        let value = self.regs.get(reg);
        let swapped = match reg.size() {
            OpSize::Bits32 => u64::from((value as u32).swap_bytes()),
            OpSize::Bits64 => value.swap_bytes(),
            _ => 0,
        };
        self.regs.set(reg, swapped);
    }
}
