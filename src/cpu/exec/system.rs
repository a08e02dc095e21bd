//! Control register and model-specific register moves.

use cpu::context::CpuContext;
use cpu::control::MSR_EFER;
use cpu::exception::Fault;
use cpu::instr::{Gpr, OpSize, Register};
use cpu::mode::ExecutionMode;
use cpu::protect::gp0;

impl CpuContext {
    fn check_system_access(&self, what: &str) -> Result<(), Fault> {
        if self.mode() == ExecutionMode::Virtual8086 {
            error!("{} in v8086 mode", what);
            return Err(Fault::GeneralProtection(0));
        }
        if self.cpl() != 0 {
            error!("{} at CPL {}", what, self.cpl());
            return Err(Fault::GeneralProtection(0));
        }
        Ok(())
    }

    /// `mov crN, reg`.
    pub fn mov_to_cr(&mut self, cr: u8, src: Register) -> Result<(), Fault> {
        self.check_system_access("mov to control register")?;
        let value = self.regs.get(src);
        trace!("cr{} <- {:#x}", cr, value);
        self.write_cr(cr, value)
    }

    /// `mov reg, crN`.
    pub fn mov_from_cr(&mut self, dest: Register, cr: u8) -> Result<(), Fault> {
        self.check_system_access("mov from control register")?;
        let value = self.read_cr(cr)?;
        self.regs.set(dest, value);
        Ok(())
    }

    /// `rdmsr`: reads the MSR selected by `ECX` into `EDX:EAX`.
    pub fn rdmsr(&mut self) -> Result<(), Fault> {
        self.check_system_access("rdmsr")?;
        let value = match self.regs.ecx() {
            MSR_EFER => u64::from(self.control.efer().bits()),
            index => return Err(gp0(&format!("rdmsr of unknown MSR {:#x}", index))),
        };
        self.regs.write_sized(Gpr::Rax, OpSize::Bits32, value & 0xffff_ffff);
        self.regs.write_sized(Gpr::Rdx, OpSize::Bits32, value >> 32);
        Ok(())
    }

    /// `wrmsr`: writes `EDX:EAX` to the MSR selected by `ECX`.
    pub fn wrmsr(&mut self) -> Result<(), Fault> {
        self.check_system_access("wrmsr")?;
        let value = u64::from(self.regs.edx()) << 32 | u64::from(self.regs.eax());
        match self.regs.ecx() {
            MSR_EFER => self.write_efer(value),
            index => Err(gp0(&format!("wrmsr to unknown MSR {:#x}", index))),
        }
    }
}
