//! Shifts, rotates and double-precision shifts.
//!
//! The count is masked to 5 bits (6 for 64-bit operands) before anything
//! else happens. A masked count of zero leaves both the operand and all flags
//! untouched.

use cpu::context::CpuContext;
use cpu::exception::Fault;
use cpu::flags::FlagState;
use cpu::instr::{Operand, OpSize, Register, ShiftOp};
use memory::Memory;

fn count_mask(size: OpSize) -> u32 {
    if size == OpSize::Bits64 { 0x3f } else { 0x1f }
}

/// Bit `w-2` of `value`, which together with the MSB gives the overflow flag
/// of right shifts and rotates.
fn second_msb(size: OpSize, value: u64) -> bool {
    (value >> (size.bits() - 2)) & 1 != 0
}

/// Shifts or rotates `value` by `count` and updates `flags`.
///
/// Returns the new value, masked to `size`.
pub fn shift_value(flags: &mut FlagState, op: ShiftOp, size: OpSize, value: u64, count: u8) -> u64 {
    let bits = size.bits();
    let value = value & size.mask();
    let count = u32::from(count) & count_mask(size);
    if count == 0 {
        return value;
    }

    match op {
        ShiftOp::Shl | ShiftOp::Sal => {
            // only 8 and 16-bit operands can be shifted by their full width or more
            let (result, cf) = if count <= bits {
                ((value << count) & size.mask(), (value >> (bits - count)) & 1 != 0)
            } else {
                (0, false)
            };
            flags.apply_logic(size, result);
            flags.set_of_cf(cf != size.msb(result), cf);
            result
        }
        ShiftOp::Shr => {
            let result = value >> count;
            let cf = (value >> (count - 1)) & 1 != 0;
            flags.apply_logic(size, result);
            flags.set_of_cf(size.msb(result) != second_msb(size, result), cf);
            result
        }
        ShiftOp::Sar => {
            let signed = size.sign_extend(value) as i64;
            let result = (signed >> count) as u64 & size.mask();
            let cf = (signed >> (count - 1)) & 1 != 0;
            flags.apply_logic(size, result);
            flags.set_cf(cf);
            result
        }
        ShiftOp::Rol => {
            let n = count % bits;
            let result = if n == 0 {
                value
            } else {
                (value << n | value >> (bits - n)) & size.mask()
            };
            let cf = result & 1 != 0;
            flags.set_of_cf(cf != size.msb(result), cf);
            result
        }
        ShiftOp::Ror => {
            let n = count % bits;
            let result = if n == 0 {
                value
            } else {
                (value >> n | value << (bits - n)) & size.mask()
            };
            let cf = size.msb(result);
            flags.set_of_cf(cf != second_msb(size, result), cf);
            result
        }
        ShiftOp::Rcl | ShiftOp::Rcr => {
            // rotate the (w+1)-bit value CF:operand
            let width = bits + 1;
            let n = match size {
                OpSize::Bits8 | OpSize::Bits16 => count % width,
                _ => count,
            };
            if n == 0 {
                return value;
            }
            let wide_mask = (1u128 << width) - 1;
            let wide = u128::from(flags.cf()) << bits | u128::from(value);
            let rotated = if op == ShiftOp::Rcl {
                (wide << n | wide >> (width - n)) & wide_mask
            } else {
                (wide >> n | wide << (width - n)) & wide_mask
            };
            let result = rotated as u64 & size.mask();
            let cf = (rotated >> bits) & 1 != 0;
            let of = if op == ShiftOp::Rcl {
                cf != size.msb(result)
            } else {
                size.msb(result) != second_msb(size, result)
            };
            flags.set_of_cf(of, cf);
            result
        }
    }
}

/// `shld` (`left`) or `shrd` of `dest`, shifting in bits from `src`.
///
/// 16-bit shifts by more than 16 shift in `dest` again after `src`, like P6
/// family processors do.
pub fn double_shift_value(flags: &mut FlagState, left: bool, size: OpSize, dest: u64, src: u64, count: u8) -> u64 {
    let count = u32::from(count) & count_mask(size);
    let (dest, src) = (dest & size.mask(), src & size.mask());
    if count == 0 {
        return dest;
    }

    let (result, cf) = if size == OpSize::Bits16 {
        if left {
            let temp = dest << 16 | src;
            let mut wide = temp << count;
            if count > 16 {
                wide |= dest << (count - 16);
            }
            ((wide >> 16) & 0xffff, (temp >> (32 - count)) & 1 != 0)
        } else {
            let temp = src << 16 | dest;
            let mut wide = temp >> count;
            if count > 16 {
                wide |= dest << (32 - count);
            }
            (wide & 0xffff, (dest >> (count - 1)) & 1 != 0)
        }
    } else {
        let bits = size.bits();
        if left {
            let result = (dest << count | src >> (bits - count)) & size.mask();
            (result, (dest >> (bits - count)) & 1 != 0)
        } else {
            let result = (dest >> count | src << (bits - count)) & size.mask();
            (result, (dest >> (count - 1)) & 1 != 0)
        }
    };

    flags.apply_logic(size, result);
    let of = if left {
        cf != size.msb(result)
    } else {
        size.msb(result) != second_msb(size, result)
    };
    flags.set_of_cf(of, cf);
    result
}

impl CpuContext {
    /// Shift-group instruction. `count` is `CL` or an 8-bit immediate.
    pub fn shift<M: Memory>(&mut self, mem: &mut M, op: ShiftOp, dest: &Operand, count: &Operand) -> Result<(), Fault> {
        let count = self.read_operand(mem, count)? as u8;
        let value = self.read_operand_rmw(mem, dest)?;
        let result = shift_value(&mut self.flags, op, dest.size(), value, count);
        self.write_operand(mem, dest, result)
    }

    /// `shld` and `shrd`.
    pub fn double_shift<M: Memory>(
        &mut self,
        mem: &mut M,
        left: bool,
        dest: &Operand,
        src: Register,
        count: &Operand,
    ) -> Result<(), Fault> {
        let count = self.read_operand(mem, count)? as u8;
        let value = self.read_operand_rmw(mem, dest)?;
        let fill = self.regs.get(src);
        let result = double_shift_value(&mut self.flags, left, dest.size(), value, fill, count);
        self.write_operand(mem, dest, result)
    }
}
