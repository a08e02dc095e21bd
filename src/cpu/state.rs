//! General-purpose register file.

use cpu::instr::{Gpr, OpSize, Register};

/// The 16 general-purpose registers and the instruction pointer.
///
/// Every register can be accessed as a 64, 32, 16 or 8-bit view. Writing the
/// 32-bit view zeroes the upper half; 16 and 8-bit writes merge into the
/// existing value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct State {
    gpr: [u64; 16],
    rip: u64,
}

impl State {
    /// Create a new register file with all registers cleared.
    ///
    /// # Parameters
    ///
    /// * `rip`: Initial value for `rip` (address of the first instruction,
    ///   relative to `CS`).
    /// * `rsp`: Initial value for the stack pointer.
    pub fn new(rip: u64, rsp: u64) -> Self {
        let mut gpr = [0; 16];
        gpr[Gpr::Rsp as usize] = rsp;
        Self { gpr, rip }
    }

    pub fn gpr(&self, reg: Gpr) -> u64 {
        self.gpr[reg as usize]
    }

    pub fn set_gpr(&mut self, reg: Gpr, value: u64) {
        self.gpr[reg as usize] = value;
    }

    /// Reads the low `size` bits of `reg`.
    pub fn read_sized(&self, reg: Gpr, size: OpSize) -> u64 {
        self.gpr(reg) & size.mask()
    }

    /// Writes `value` to the `size`-bit view of `reg`.
    pub fn write_sized(&mut self, reg: Gpr, size: OpSize, value: u64) {
        let old = self.gpr(reg);
        let new = match size {
            OpSize::Bits32 | OpSize::Bits64 => value & size.mask(),
            OpSize::Bits8 | OpSize::Bits16 => old & !size.mask() | value & size.mask(),
        };
        self.set_gpr(reg, new);
    }

    /// Reads the (zero-extended) value of a register view.
    pub fn get(&self, reg: Register) -> u64 {
        match reg {
            Register::High8(gpr) => (self.gpr(gpr) >> 8) & 0xff,
            _ => self.read_sized(reg.gpr(), reg.size()),
        }
    }

    /// Writes to a register view. `value` is truncated to the view's size.
    pub fn set(&mut self, reg: Register, value: u64) {
        match reg {
            Register::High8(gpr) => {
                let old = self.gpr(gpr);
                self.set_gpr(gpr, old & !0xff00 | (value & 0xff) << 8);
            }
            _ => self.write_sized(reg.gpr(), reg.size(), value),
        }
    }
}

macro_rules! accessors {
    (
        $base:expr => [ $getter64:ident/$setter64:ident, $getter32:ident/$setter32:ident, $getter16:ident/$setter16:ident ]
    ) => {
        pub fn $getter64(&self) -> u64 { self.gpr($base) }
        pub fn $setter64(&mut self, value: u64) { self.set_gpr($base, value); }
        pub fn $getter32(&self) -> u32 { self.gpr($base) as u32 }
        pub fn $setter32(&mut self, value: u32) { self.write_sized($base, OpSize::Bits32, value.into()); }
        pub fn $getter16(&self) -> u16 { self.gpr($base) as u16 }
        pub fn $setter16(&mut self, value: u16) { self.write_sized($base, OpSize::Bits16, value.into()); }
    };
    (
        $base:expr => [ $getter64:ident/$setter64:ident, $getter32:ident/$setter32:ident, $getter16:ident/$setter16:ident, $getter8h:ident/$setter8h:ident, $getter8l:ident/$setter8l:ident ]
    ) => {
        accessors!($base => [$getter64/$setter64, $getter32/$setter32, $getter16/$setter16]);
        pub fn $getter8h(&self) -> u8 { (self.gpr($base) >> 8) as u8 }
        pub fn $setter8h(&mut self, value: u8) { self.set(Register::High8($base), value.into()); }
        pub fn $getter8l(&self) -> u8 { self.gpr($base) as u8 }
        pub fn $setter8l(&mut self, value: u8) { self.write_sized($base, OpSize::Bits8, value.into()); }
    };
}

impl State {
    accessors!(Gpr::Rax => [rax/set_rax, eax/set_eax, ax/set_ax, ah/set_ah, al/set_al]);
    accessors!(Gpr::Rbx => [rbx/set_rbx, ebx/set_ebx, bx/set_bx, bh/set_bh, bl/set_bl]);
    accessors!(Gpr::Rcx => [rcx/set_rcx, ecx/set_ecx, cx/set_cx, ch/set_ch, cl/set_cl]);
    accessors!(Gpr::Rdx => [rdx/set_rdx, edx/set_edx, dx/set_dx, dh/set_dh, dl/set_dl]);
    accessors!(Gpr::Rsi => [rsi/set_rsi, esi/set_esi, si/set_si]);
    accessors!(Gpr::Rdi => [rdi/set_rdi, edi/set_edi, di/set_di]);
    accessors!(Gpr::Rbp => [rbp/set_rbp, ebp/set_ebp, bp/set_bp]);
    accessors!(Gpr::Rsp => [rsp/set_rsp, esp/set_esp, sp/set_sp]);

    pub fn rip(&self) -> u64 { self.rip }
    pub fn set_rip(&mut self, value: u64) { self.rip = value; }
    pub fn eip(&self) -> u32 { self.rip as u32 }
    pub fn ip(&self) -> u16 { self.rip as u16 }
}
