//! Decoded x86 instruction representation.
//!
//! The execution core never looks at machine code. An external decoder hands
//! it `Instr` values with every operand already resolved: registers are named,
//! immediates are sign- or zero-extended as the encoding demands, and memory
//! operands carry their segment and final effective offset.

use cpu::imm::Immediate;
use cpu::segment::Segment;

use std::fmt;

/// A decoded x86 instruction.
///
/// Near branches carry their displacement (`rel`) together with the operand
/// size that governs masking of the new instruction pointer. The decoder is
/// expected to have already advanced `RIP` past the instruction, so targets
/// are computed relative to the *next* instruction.
///
/// Unless otherwise noted, an `Operand` called `dest` may not be an immediate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instr {
    /// Perform a binary arithmetic or logic function on `dest` and `src` and
    /// store the result in `dest`.
    ///
    /// Reads and modifies flags according to `op`.
    Alu {
        op: AluOp,
        dest: Operand,
        src: Operand,
    },

    /// Calculate the bitwise AND of `lhs` and `rhs` and set the flags
    /// accordingly, but do not modify `lhs` or `rhs`.
    Test {
        lhs: Operand,
        rhs: Operand,
    },

    /// Invert every bit in `operand`.
    ///
    /// Does not read or modify any flags.
    Not {
        operand: Operand,
    },

    /// Replace `operand` with its two's complement (`0 - operand`).
    ///
    /// Modifies all arithmetic flags like a subtraction would.
    Neg {
        operand: Operand,
    },

    /// Increment by one. CF is preserved.
    Inc {
        operand: Operand,
    },

    /// Decrement by one. CF is preserved.
    Dec {
        operand: Operand,
    },

    /// Unsigned multiplication of the `A` register with `operand`.
    ///
    /// Depending on the size of `operand`, multiplies it with `AL`, `AX`,
    /// `EAX` or `RAX`. The double-width result is stored in `AX`, `DX:AX`,
    /// `EDX:EAX` or `RDX:RAX`.
    ///
    /// Sets CF and OF when the upper half of the result is non-zero.
    Mul {
        operand: Operand,
    },

    /// `imul` with a single operand.
    ///
    /// Sets CF and OF when the result does not fit the lower half when
    /// sign-extended.
    Imul {
        operand: Operand,
    },

    /// Truncating `imul` with 2 or 3 operands.
    ///
    /// `dest = src1 * src2`.
    ImulTrunc {
        dest: Register,
        src1: Operand,
        src2: Operand,
    },

    /// Unsigned division of the `A`/`D` register pair by `operand`.
    ///
    /// Raises #DE when `operand` is zero or the quotient overflows. Flags are
    /// left unchanged.
    Div {
        operand: Operand,
    },

    /// Signed division of the `A`/`D` register pair by `operand`.
    Idiv {
        operand: Operand,
    },

    /// Shift-group operation.
    Shift {
        op: ShiftOp,
        /// Shifted value and destination.
        dest: Operand,
        /// 8-bit shift amount: `CL` or an immediate.
        count: Operand,
    },

    /// Double-precision shift (`shld`/`shrd`).
    ///
    /// Shifts `dest`, filling the vacated bits from `src`.
    DoubleShift {
        /// `true` for `shld`, `false` for `shrd`.
        left: bool,
        dest: Operand,
        src: Register,
        count: Operand,
    },

    /// Copy a single bit of `dest` into CF and optionally modify it.
    ///
    /// If `bit` is a register and `dest` is memory, the bit offset is a
    /// signed offset from the operand's address. Otherwise it is taken modulo
    /// the operand width.
    BitTest {
        op: BitTestOp,
        dest: Operand,
        bit: Operand,
    },

    /// Determine the bit index of the least or most significant bit set in the
    /// operand.
    ///
    /// If `src` is zero, ZF is set and `dest` is left unmodified.
    BitScan {
        /// If `true`, search for the most significant set bit. If `false`, find
        /// the least significant bit.
        reverse: bool,
        dest: Register,
        src: Operand,
    },

    /// Reverse the byte order of a 32 or 64-bit register.
    Bswap {
        reg: Register,
    },

    /// Store `src` in `dest`.
    ///
    /// Does not read or modify any flags.
    Mov {
        dest: Operand,
        src: Operand,
    },

    /// Move with zero-extend. `src` may be smaller than `dest`.
    MovZx {
        dest: Register,
        src: Operand,
    },

    /// Move with sign-extend (including `movsxd`). `src` may be smaller than
    /// `dest`.
    MovSx {
        dest: Register,
        src: Operand,
    },

    /// Sign-extend the lower half of the accumulator into all of it
    /// (`cbw`, `cwde`, `cdqe`).
    ///
    /// `size` is the width of the destination: `Bits16` for `cbw`.
    Convert {
        size: OpSize,
    },

    /// Replicate the sign bit of the accumulator into the `D` register
    /// (`cwd`, `cdq`, `cqo`).
    ConvertDouble {
        size: OpSize,
    },

    /// Move `src` into `dest` if `cc` holds.
    ///
    /// A 32-bit destination is zero-extended to 64 bits even when the
    /// condition is false.
    Cmov {
        cc: ConditionCode,
        dest: Register,
        src: Operand,
    },

    /// Set byte to 0 or 1, depending on status flag.
    ///
    /// This is **not** a conditional store - it will always overwrite the
    /// operand.
    SetIf {
        /// Flag to test for.
        cc: ConditionCode,
        operand: Operand,
    },

    /// Exchange the contents of `dest` and `src`.
    ///
    /// `dest` is written last, so if both name the same storage, the value
    /// originally in `src` wins.
    Xchg {
        dest: Operand,
        src: Register,
    },

    /// Exchange and add: `src = dest; dest = dest + src`.
    Xadd {
        dest: Operand,
        src: Register,
    },

    /// Compare the accumulator with `dest`. If equal, store `src` into
    /// `dest`. Otherwise, load `dest` into the accumulator.
    ///
    /// A memory `dest` is always written, even when the comparison fails.
    Cmpxchg {
        dest: Operand,
        src: Register,
    },

    /// Push a value onto the stack.
    ///
    /// If `operand` is the stack pointer itself, the value *before* it is
    /// decremented is pushed onto the stack.
    ///
    /// Does not read or modify any flags.
    Push {
        operand: Operand,
    },

    /// Pop a value from the stack into a register or memory location.
    ///
    /// The size of the operand determines how much is popped.
    Pop {
        operand: Operand,
    },

    /// Push a segment register's selector using `size` as operand size.
    PushSeg {
        seg: Segment,
        size: OpSize,
    },

    /// Pop a selector from the stack and load it into `seg`.
    PopSeg {
        seg: Segment,
        size: OpSize,
    },

    /// Load a selector into a segment register (`mov sreg, r/m16`).
    ///
    /// Loading `CS` this way is invalid.
    MovToSeg {
        seg: Segment,
        src: Operand,
    },

    /// Store a segment register's selector (`mov r/m16, sreg`).
    MovFromSeg {
        dest: Operand,
        seg: Segment,
    },

    /// Remove the procedure's stack frame.
    ///
    /// Equivalent to:
    ///
    /// ```notrust
    /// mov esp, ebp
    /// pop ebp
    /// ```
    ///
    /// With a 16-bit operand size, the `pop ebp` instead becomes `pop bp`.
    Leave {
        size: OpSize,
    },

    /// ASCII adjust after addition.
    Aaa,
    /// ASCII adjust after subtraction.
    Aas,
    /// ASCII adjust after multiply. `base` is the immediate (10 for plain
    /// `aam`).
    Aam {
        base: u8,
    },
    /// ASCII adjust before division.
    Aad {
        base: u8,
    },
    /// Decimal adjust after addition.
    Daa,
    /// Decimal adjust after subtraction.
    Das,

    /// Clear carry flag.
    Clc,
    /// Set carry flag.
    Stc,
    /// Complement carry flag.
    Cmc,
    /// Clear direction flag.
    Cld,
    /// Set direction flag.
    Std,
    /// Clear interrupt flag (or the virtual interrupt flag, when
    /// virtualized).
    Cli,
    /// Set interrupt flag.
    Sti,
    /// Load `SF:ZF:0:AF:0:PF:1:CF` into `AH`.
    Lahf,
    /// Store `AH` into the low byte of the flags register.
    Sahf,
    Pushf {
        size: OpSize,
    },
    Popf {
        size: OpSize,
    },

    /// Move a general-purpose register into control register `cr`.
    MovToCr {
        cr: u8,
        src: Register,
    },

    /// Move control register `cr` into a general-purpose register.
    MovFromCr {
        dest: Register,
        cr: u8,
    },

    /// Read the model-specific register selected by `ECX` into `EDX:EAX`.
    Rdmsr,

    /// Write `EDX:EAX` into the model-specific register selected by `ECX`.
    Wrmsr,

    /// Unconditional near jump to an absolute address stored in a register
    /// or in memory.
    Jump {
        target: Operand,
    },

    /// Unconditional near jump relative to the next instruction.
    JumpRel {
        rel: i64,
        /// Operand size. The new instruction pointer is truncated to it.
        size: OpSize,
    },

    /// Branch if the condition `cc` holds.
    JumpIf {
        cc: ConditionCode,
        rel: i64,
        size: OpSize,
    },

    /// Direct far jump (`jmp ptr16:16/32`).
    JumpFar {
        selector: u16,
        offset: u64,
        size: OpSize,
    },

    /// Indirect far jump through a `m16:16/32/64` pointer.
    ///
    /// The offset is stored first, followed by the selector.
    JumpFarIndirect {
        ptr: MemoryLocation,
        size: OpSize,
    },

    /// Call a procedure at an absolute address stored in a register or in
    /// memory.
    ///
    /// Pushes the address of the next instruction using the operand size.
    Call {
        target: Operand,
        size: OpSize,
    },

    /// Call a procedure relative to the next instruction.
    CallRel {
        rel: i64,
        size: OpSize,
    },

    /// Direct far call (`call ptr16:16/32`).
    CallFar {
        selector: u16,
        offset: u64,
        size: OpSize,
    },

    /// Indirect far call through a `m16:16/32/64` pointer.
    CallFarIndirect {
        ptr: MemoryLocation,
        size: OpSize,
    },

    /// Near return to caller.
    ///
    /// Pops the return address, then releases `pop` more bytes of arguments
    /// from the stack.
    Ret {
        pop: u16,
        size: OpSize,
    },

    /// Far return to caller, possibly to an outer privilege level.
    RetFar {
        pop: u16,
        size: OpSize,
    },

    /// Return from interrupt.
    Iret {
        size: OpSize,
    },

    /// Decrement the count register and branch if it is non-zero (and the
    /// condition given by `kind` holds).
    Loop {
        kind: LoopKind,
        rel: i64,
        /// Operand size, truncates the branch target.
        size: OpSize,
        /// Address size, selects `CX`, `ECX` or `RCX`.
        count_size: OpSize,
    },

    /// Branch if the count register is zero (`jcxz`, `jecxz`, `jrcxz`).
    Jcxz {
        rel: i64,
        size: OpSize,
        count_size: OpSize,
    },
}

/// A decoded operand, usually from a Mod-Reg-R/M byte and the following bytes.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum Operand {
    /// The operand is the value inside a register, or the register itself.
    Reg(Register),

    /// Immediate value.
    Imm(Immediate),

    /// The operand is stored in memory.
    Mem(MemoryLocation),
}

impl Operand {
    /// Returns the size of the operand.
    pub fn size(&self) -> OpSize {
        match self {
            Operand::Reg(reg) => reg.size(),
            Operand::Imm(imm) => imm.size(),
            Operand::Mem(loc) => loc.size,
        }
    }
}

impl From<Register> for Operand {
    fn from(r: Register) -> Self {
        Operand::Reg(r)
    }
}

impl From<Immediate> for Operand {
    fn from(imm: Immediate) -> Self {
        Operand::Imm(imm)
    }
}

impl From<MemoryLocation> for Operand {
    fn from(loc: MemoryLocation) -> Self {
        Operand::Mem(loc)
    }
}

/// A resolved memory operand: a segment, an effective offset into it and an
/// access size.
///
/// The decoder has already combined base, index, scale and displacement and
/// truncated the result to the address size.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct MemoryLocation {
    pub size: OpSize,
    pub segment: Segment,
    pub offset: u64,
}

impl MemoryLocation {
    pub fn new(segment: Segment, offset: u64, size: OpSize) -> Self {
        Self { size, segment, offset }
    }
}

/// Operand, address or stack size.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpSize {
    Bits8,
    Bits16,
    Bits32,
    Bits64,
}

impl OpSize {
    pub fn bits(self) -> u32 {
        match self {
            OpSize::Bits8 => 8,
            OpSize::Bits16 => 16,
            OpSize::Bits32 => 32,
            OpSize::Bits64 => 64,
        }
    }

    pub fn bytes(self) -> u64 {
        u64::from(self.bits() / 8)
    }

    /// Mask selecting the bits of a value of this size.
    pub fn mask(self) -> u64 {
        match self {
            OpSize::Bits64 => !0,
            _ => (1 << self.bits()) - 1,
        }
    }

    /// Mask selecting the sign bit.
    pub fn sign_bit(self) -> u64 {
        1 << (self.bits() - 1)
    }

    /// Returns whether the most significant bit of `value` at this size is
    /// set.
    pub fn msb(self, value: u64) -> bool {
        value & self.sign_bit() != 0
    }

    /// Sign-extends the low bits of `value` to 64 bits.
    pub fn sign_extend(self, value: u64) -> u64 {
        match self {
            OpSize::Bits8 => value as i8 as i64 as u64,
            OpSize::Bits16 => value as i16 as i64 as u64,
            OpSize::Bits32 => value as i32 as i64 as u64,
            OpSize::Bits64 => value,
        }
    }

    /// The size twice as wide as this one, used for multiply and divide.
    ///
    /// Returns `None` for 64-bit operands, whose double width result does
    /// not fit in a `u64`.
    pub fn double(self) -> Option<OpSize> {
        match self {
            OpSize::Bits8 => Some(OpSize::Bits16),
            OpSize::Bits16 => Some(OpSize::Bits32),
            OpSize::Bits32 => Some(OpSize::Bits64),
            OpSize::Bits64 => None,
        }
    }
}

impl fmt::Display for OpSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-bit", self.bits())
    }
}

/// A general-purpose register slot.
///
/// The discriminant is the register number used by the instruction encoding
/// (with `REX` extension for `R8` to `R15`).
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

/// A sized view of a general-purpose register.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Register {
    /// Bits 7:0 (`AL`, `CL`, ..., `SPL`, `R8B`, ...).
    Low8(Gpr),
    /// Bits 15:8 of `RAX`, `RCX`, `RDX` or `RBX` (`AH`, `CH`, `DH`, `BH`).
    High8(Gpr),
    /// Bits 15:0.
    Word(Gpr),
    /// Bits 31:0. Writes zero the upper half.
    Dword(Gpr),
    /// All 64 bits.
    Qword(Gpr),
}

const NAMES_64: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi",
    "r8", "r9", "r10", "r11", "r12", "r13", "r14", "r15",
];
const NAMES_32: [&str; 16] = [
    "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi",
    "r8d", "r9d", "r10d", "r11d", "r12d", "r13d", "r14d", "r15d",
];
const NAMES_16: [&str; 16] = [
    "ax", "cx", "dx", "bx", "sp", "bp", "si", "di",
    "r8w", "r9w", "r10w", "r11w", "r12w", "r13w", "r14w", "r15w",
];
const NAMES_8: [&str; 16] = [
    "al", "cl", "dl", "bl", "spl", "bpl", "sil", "dil",
    "r8b", "r9b", "r10b", "r11b", "r12b", "r13b", "r14b", "r15b",
];
const NAMES_8H: [&str; 4] = ["ah", "ch", "dh", "bh"];

impl Register {
    /// Returns the view of `gpr` with the given size.
    pub fn sized(gpr: Gpr, size: OpSize) -> Self {
        match size {
            OpSize::Bits8 => Register::Low8(gpr),
            OpSize::Bits16 => Register::Word(gpr),
            OpSize::Bits32 => Register::Dword(gpr),
            OpSize::Bits64 => Register::Qword(gpr),
        }
    }

    /// The register slot this view refers to.
    pub fn gpr(&self) -> Gpr {
        match *self {
            Register::Low8(gpr)
            | Register::High8(gpr)
            | Register::Word(gpr)
            | Register::Dword(gpr)
            | Register::Qword(gpr) => gpr,
        }
    }

    /// Returns the size of the register in bits.
    pub fn size(&self) -> OpSize {
        match self {
            Register::Low8(_) | Register::High8(_) => OpSize::Bits8,
            Register::Word(_) => OpSize::Bits16,
            Register::Dword(_) => OpSize::Bits32,
            Register::Qword(_) => OpSize::Bits64,
        }
    }

    /// Returns the lowercase name of the register.
    ///
    /// High-byte views of registers other than `RAX` to `RBX` don't exist and
    /// are named `"?"`.
    pub fn name(&self) -> &'static str {
        let index = self.gpr() as usize;
        match self {
            Register::Low8(_) => NAMES_8[index],
            Register::High8(_) => NAMES_8H.get(index).cloned().unwrap_or("?"),
            Register::Word(_) => NAMES_16[index],
            Register::Dword(_) => NAMES_32[index],
            Register::Qword(_) => NAMES_64[index],
        }
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Opcode extension selecting the operation of the 8 basic ALU instructions.
///
/// Stored in the `Reg` field of the Mod-Reg-R/M byte of the immediate group,
/// and in bits 5:3 of the opcode byte of the register forms.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
pub enum AluOp {
    Add = 0,
    Or = 1,
    /// Add with carry.
    Adc = 2,
    /// Subtract with borrow.
    Sbb = 3,
    And = 4,
    Sub = 5,
    Xor = 6,
    /// Set `EFLAGS` like `sub` would, but do not change `dest`.
    Cmp = 7,
}

/// Shift instruction group opcode.
///
/// Stored in the `Reg` field of the Mod-Reg-R/M byte.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
pub enum ShiftOp {
    Rol = 0,
    Ror = 1,
    /// Rotate through carry.
    Rcl = 2,
    Rcr = 3,
    Shl = 4,
    Shr = 5,
    /// Same as `Shl`.
    Sal = 6,
    Sar = 7,
}

/// Bit test group operation.
///
/// The discriminant is the `Reg` field of `0F BA /r`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
pub enum BitTestOp {
    /// Only copy the bit into CF.
    Bt = 4,
    /// Set the bit afterwards.
    Bts = 5,
    /// Reset the bit afterwards.
    Btr = 6,
    /// Complement the bit afterwards.
    Btc = 7,
}

/// Loop instruction flavour, discriminant is the low opcode bits (`E0`-`E2`).
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
pub enum LoopKind {
    /// Also require ZF=0.
    Loopne = 0,
    /// Also require ZF=1.
    Loope = 1,
    Loop = 2,
}

/// A condition for conditional branches or `cmov`.
///
/// Note that these have a lot of alternate names.
///
/// The discriminant is set according to the x86 instruction encoding. Condition
/// codes are encoded in 4 bits.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum ConditionCode {
    /// OF=1
    Overflow = 0x0,
    /// OF=0
    NotOverflow = 0x1,
    /// CF=1
    ///
    /// Aka "below".
    Carry = 0x2,
    /// CF=0
    ///
    /// Aka "above or equal".
    NotCarry = 0x3,
    /// ZF=1
    Equal = 0x4,
    /// ZF=0
    ///
    /// Aka "not zero".
    NotEqual = 0x5,
    /// CF=1 or ZF=1
    BelowOrEqual = 0x6,
    /// CF=0 and ZF=0
    Above = 0x7,
    /// SF=1
    Sign = 0x8,
    /// SF=0
    NotSign = 0x9,
    /// PF=1
    ///
    /// Aka "parity even".
    Parity = 0xA,
    /// PF=0
    ///
    /// Aka "parity odd".
    NotParity = 0xB,
    /// SF!=OF
    Less = 0xC,
    /// SF=OF
    GreaterOrEqual = 0xD,
    /// ZF=1 or SF!=OF
    LessOrEqual = 0xE,
    /// ZF=0 and SF=OF
    Greater = 0xF,
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn opsize_helpers() {
        assert_eq!(OpSize::Bits16.mask(), 0xffff);
        assert_eq!(OpSize::Bits64.mask(), !0);
        assert_eq!(OpSize::Bits8.sign_extend(0x80), 0xffff_ffff_ffff_ff80);
        assert_eq!(OpSize::Bits32.sign_extend(0x7fff_ffff), 0x7fff_ffff);
        assert!(OpSize::Bits16.msb(0x8000));
        assert_eq!(OpSize::Bits64.double(), None);
    }

    #[test]
    fn register_names() {
        assert_eq!(Register::High8(Gpr::Rbx).to_string(), "bh");
        assert_eq!(Register::Dword(Gpr::R9).to_string(), "r9d");
        assert_eq!(Register::sized(Gpr::Rsp, OpSize::Bits16).name(), "sp");
        assert_eq!(Register::High8(Gpr::Rsi).name(), "?");
    }

    #[test]
    fn encodings() {
        assert_eq!(ConditionCode::from_u8(0xF), Some(ConditionCode::Greater));
        assert_eq!(AluOp::from_u8(7), Some(AluOp::Cmp));
        assert_eq!(BitTestOp::from_u8(3), None);
        assert_eq!(Gpr::from_u8(12), Some(Gpr::R12));
    }
}
