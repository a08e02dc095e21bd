//! Immediate operand values.
//!
//! An immediate is an 8-, 16-, 32- or 64-bit value encoded in the instruction
//! stream. The decoder keeps the encoded width; the execution units extend it
//! to the operand size of the instruction they execute.

use cpu::instr::OpSize;

use std::fmt;

/// An 8, 16, 32 or 64-bit immediate value.
///
/// Note that while `Immediate` only stores signed values, whether the sign is
/// meaningful depends on the operation performed on the values.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum Immediate {
    Imm8(i8),
    Imm16(i16),
    Imm32(i32),
    Imm64(i64),
}

impl Immediate {
    /// Sign-extend or truncate the immediate to a different size.
    pub fn sign_ext_to(&self, size: OpSize) -> Immediate {
        let extended = self.sign_extended();
        match size {
            OpSize::Bits8 => Immediate::Imm8(extended as i8),
            OpSize::Bits16 => Immediate::Imm16(extended as i16),
            OpSize::Bits32 => Immediate::Imm32(extended as i32),
            OpSize::Bits64 => Immediate::Imm64(extended),
        }
    }

    /// Returns the sign-extended immediate value as an `i64`.
    pub fn sign_extended(&self) -> i64 {
        match *self {
            Immediate::Imm8(imm) => imm.into(),
            Immediate::Imm16(imm) => imm.into(),
            Immediate::Imm32(imm) => imm.into(),
            Immediate::Imm64(imm) => imm,
        }
    }

    /// Returns the zero-extended immediate value as a `u64`.
    pub fn zero_extended(&self) -> u64 {
        match *self {
            Immediate::Imm8(imm) => (imm as u8).into(),
            Immediate::Imm16(imm) => (imm as u16).into(),
            Immediate::Imm32(imm) => (imm as u32).into(),
            Immediate::Imm64(imm) => imm as u64,
        }
    }

    /// Returns the value sign-extended to `size` and masked to it.
    ///
    /// This is what the ALU instructions use: `add eax, -1` with an 8-bit
    /// immediate adds `0xffffffff`.
    pub fn value_for(&self, size: OpSize) -> u64 {
        (self.sign_extended() as u64) & size.mask()
    }

    /// Returns the size of the immediate value.
    pub fn size(&self) -> OpSize {
        match self {
            Immediate::Imm8(_) => OpSize::Bits8,
            Immediate::Imm16(_) => OpSize::Bits16,
            Immediate::Imm32(_) => OpSize::Bits32,
            Immediate::Imm64(_) => OpSize::Bits64,
        }
    }
}

impl From<u8> for Immediate {
    fn from(imm: u8) -> Self {
        Immediate::Imm8(imm as i8)
    }
}

impl From<u16> for Immediate {
    fn from(imm: u16) -> Self {
        Immediate::Imm16(imm as i16)
    }
}

impl From<u32> for Immediate {
    fn from(imm: u32) -> Self {
        Immediate::Imm32(imm as i32)
    }
}

impl From<u64> for Immediate {
    fn from(imm: u64) -> Self {
        Immediate::Imm64(imm as i64)
    }
}

impl From<i8> for Immediate {
    fn from(imm: i8) -> Self {
        Immediate::Imm8(imm)
    }
}

impl From<i16> for Immediate {
    fn from(imm: i16) -> Self {
        Immediate::Imm16(imm)
    }
}

impl From<i32> for Immediate {
    fn from(imm: i32) -> Self {
        Immediate::Imm32(imm)
    }
}

impl From<i64> for Immediate {
    fn from(imm: i64) -> Self {
        Immediate::Imm64(imm)
    }
}

/// Prints the encoded bits in hexadecimal.
impl fmt::LowerHex for Immediate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::LowerHex::fmt(&self.zero_extended(), f)
    }
}

/// Prints the signed decimal value of the immediate.
impl fmt::Display for Immediate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.sign_extended().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension() {
        let imm = Immediate::from(-2i8);
        assert_eq!(imm.zero_extended(), 0xfe);
        assert_eq!(imm.sign_extended(), -2);
        assert_eq!(imm.value_for(OpSize::Bits16), 0xfffe);
        assert_eq!(imm.sign_ext_to(OpSize::Bits32), Immediate::Imm32(-2));
        assert_eq!(format!("{:x}", Immediate::from(0x8000u16)), "8000");
        assert_eq!(Immediate::from(0xffu8).to_string(), "-1");
    }
}
