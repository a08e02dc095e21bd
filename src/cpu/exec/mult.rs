//! Multiplication and division.

use cpu::context::CpuContext;
use cpu::exception::Fault;
use cpu::instr::{Gpr, Operand, OpSize, Register};
use memory::Memory;

fn divide_error(what: &str) -> Fault {
    error!("#DE: {}", what);
    Fault::DivideError
}

impl CpuContext {
    /// Unsigned `mul`: `A * operand` into the double-width accumulator.
    ///
    /// `SF`, `ZF` and `PF` reflect the low half; `CF` and `OF` are set when
    /// the high half is non-zero.
    pub fn mul<M: Memory>(&mut self, mem: &M, operand: &Operand) -> Result<(), Fault> {
        let size = operand.size();
        let src = self.read_operand(mem, operand)?;
        let acc = self.regs.read_sized(Gpr::Rax, size);
        let product = u128::from(acc) * u128::from(src);
        let low = product as u64 & size.mask();
        let high = (product >> size.bits()) as u64 & size.mask();

        self.write_double(size, high, low);
        self.flags.apply_logic(size, low);
        self.flags.set_of_cf(high != 0, high != 0);
        Ok(())
    }

    /// One-operand signed `imul`.
    pub fn imul<M: Memory>(&mut self, mem: &M, operand: &Operand) -> Result<(), Fault> {
        let size = operand.size();
        let src = size.sign_extend(self.read_operand(mem, operand)?) as i64;
        let acc = size.sign_extend(self.regs.read_sized(Gpr::Rax, size)) as i64;
        let product = i128::from(acc) * i128::from(src);
        let low = product as u64 & size.mask();
        let high = (product >> size.bits()) as u64 & size.mask();
        let overflow = i128::from(size.sign_extend(low) as i64) != product;

        self.write_double(size, high, low);
        self.flags.apply_logic(size, low);
        self.flags.set_of_cf(overflow, overflow);
        Ok(())
    }

    /// Two and three-operand `imul`, truncated to the size of `dest`.
    pub fn imul_trunc<M: Memory>(&mut self, mem: &M, dest: Register, src1: &Operand, src2: &Operand) -> Result<(), Fault> {
        let size = dest.size();
        let lhs = size.sign_extend(self.read_source(mem, src1, size)?) as i64;
        let rhs = size.sign_extend(self.read_source(mem, src2, size)?) as i64;
        let product = i128::from(lhs) * i128::from(rhs);
        let low = product as u64 & size.mask();
        let overflow = i128::from(size.sign_extend(low) as i64) != product;

        self.regs.set(dest, low);
        self.flags.apply_logic(size, low);
        self.flags.set_of_cf(overflow, overflow);
        Ok(())
    }

    /// Unsigned `div`. Raises `#DE` on a zero divisor or when the quotient
    /// does not fit. Flags are not modified.
    pub fn div<M: Memory>(&mut self, mem: &M, operand: &Operand) -> Result<(), Fault> {
        let size = operand.size();
        let divisor = u128::from(self.read_operand(mem, operand)?);
        if divisor == 0 {
            return Err(divide_error("division by zero"));
        }

        let (high, low) = self.read_double(size);
        let dividend = u128::from(high) << size.bits() | u128::from(low);
        let quotient = dividend / divisor;
        let remainder = dividend % divisor;
        if quotient > u128::from(size.mask()) {
            return Err(divide_error("quotient overflow"));
        }

        trace!("div: {:#x} / {:#x} = {:#x} rem {:#x}", dividend, divisor, quotient, remainder);
        self.write_double(size, remainder as u64, quotient as u64);
        Ok(())
    }

    /// Signed `idiv`. The quotient is truncated towards zero and the
    /// remainder has the sign of the dividend.
    pub fn idiv<M: Memory>(&mut self, mem: &M, operand: &Operand) -> Result<(), Fault> {
        let size = operand.size();
        let divisor = i128::from(size.sign_extend(self.read_operand(mem, operand)?) as i64);
        if divisor == 0 {
            return Err(divide_error("division by zero"));
        }

        let (high, low) = self.read_double(size);
        let raw = u128::from(high) << size.bits() | u128::from(low);
        // sign-extend the double-width dividend to 128 bits
        let shift = 128 - 2 * size.bits();
        let dividend = ((raw << shift) as i128) >> shift;

        let quotient = match dividend.checked_div(divisor) {
            Some(quotient) => quotient,
            None => return Err(divide_error("quotient overflow")),
        };
        let remainder = dividend % divisor;
        let min = -(1i128 << (size.bits() - 1));
        let max = (1i128 << (size.bits() - 1)) - 1;
        if quotient < min || quotient > max {
            return Err(divide_error("quotient overflow"));
        }

        trace!("idiv: {} / {} = {} rem {}", dividend, divisor, quotient, remainder);
        self.write_double(size, remainder as u64 & size.mask(), quotient as u64 & size.mask());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use cpu::config::CpuConfig;
    use cpu::context::CpuContext;
    use cpu::exception::Fault;
    use cpu::imm::Immediate;
    use cpu::instr::{Gpr, Operand, Register};
    use memory::ArrayMemory;

    fn reg(r: Register) -> Operand {
        Operand::Reg(r)
    }

    #[test]
    fn mul_widths() {
        let mut ctx = CpuContext::new(CpuConfig::default());
        let mem = ArrayMemory::zeroed(0);
        ctx.regs_mut().set_al(0x80);
        ctx.regs_mut().set_bl(0x02);
        ctx.mul(&mem, &reg(Register::Low8(Gpr::Rbx))).unwrap();
        assert_eq!(ctx.regs().ax(), 0x100);
        assert!(ctx.flags().cf() && ctx.flags().of());

        ctx.regs_mut().set_rax(0xffff_ffff_ffff_ffff);
        ctx.regs_mut().set_rbx(2);
        ctx.mul(&mem, &reg(Register::Qword(Gpr::Rbx))).unwrap();
        assert_eq!(ctx.regs().rax(), 0xffff_ffff_ffff_fffe);
        assert_eq!(ctx.regs().rdx(), 1);

        ctx.regs_mut().set_eax(3);
        ctx.regs_mut().set_rdx(!0);
        ctx.mul(&mem, &reg(Register::Dword(Gpr::Rbx))).unwrap();
        assert_eq!(ctx.regs().rax(), 6);
        // EDX is written even though the high half is zero
        assert_eq!(ctx.regs().rdx(), 0);
        assert!(!ctx.flags().cf());
    }

    #[test]
    fn imul_overflow() {
        let mut ctx = CpuContext::new(CpuConfig::default());
        let mem = ArrayMemory::zeroed(0);
        ctx.regs_mut().set_al(0xff);
        ctx.regs_mut().set_cl(0x80);
        ctx.imul(&mem, &reg(Register::Low8(Gpr::Rcx))).unwrap();
        assert_eq!(ctx.regs().ax(), 0x0080);
        assert!(ctx.flags().of());

        ctx.regs_mut().set_ecx(0x4000_0000);
        ctx.imul_trunc(&mem, Register::Dword(Gpr::Rdx), &reg(Register::Dword(Gpr::Rcx)), &Immediate::from(2i8).into()).unwrap();
        assert_eq!(ctx.regs().edx(), 0x8000_0000);
        assert!(ctx.flags().cf() && ctx.flags().of());

        ctx.imul_trunc(&mem, Register::Word(Gpr::Rdx), &reg(Register::Word(Gpr::Rcx)), &Immediate::from(-3i8).into()).unwrap();
        assert_eq!(ctx.regs().dx(), 0);
        assert!(!ctx.flags().cf());
    }

    #[test]
    fn division() {
        let mut ctx = CpuContext::new(CpuConfig::default());
        let mem = ArrayMemory::zeroed(0);
        ctx.regs_mut().set_dx(0x0001);
        ctx.regs_mut().set_ax(0x0003);
        ctx.regs_mut().set_bx(0x0002);
        ctx.div(&mem, &reg(Register::Word(Gpr::Rbx))).unwrap();
        assert_eq!((ctx.regs().ax(), ctx.regs().dx()), (0x8001, 1));

        ctx.regs_mut().set_ax(0xfff9);
        ctx.regs_mut().set_bl(2);
        ctx.idiv(&mem, &reg(Register::Low8(Gpr::Rbx))).unwrap();
        assert_eq!(ctx.regs().al() as i8, -3);
        assert_eq!(ctx.regs().ah() as i8, -1);
    }

    #[test]
    fn divide_errors_leave_registers() {
        let mut ctx = CpuContext::new(CpuConfig::default());
        let mem = ArrayMemory::zeroed(0);
        ctx.regs_mut().set_ax(0x1234);
        assert_eq!(ctx.div(&mem, &reg(Register::Low8(Gpr::Rbx))), Err(Fault::DivideError));
        ctx.regs_mut().set_bl(1);
        assert_eq!(ctx.div(&mem, &reg(Register::Low8(Gpr::Rbx))), Err(Fault::DivideError));
        assert_eq!(ctx.regs().ax(), 0x1234);

        ctx.regs_mut().set_rdx(0x8000_0000_0000_0000);
        ctx.regs_mut().set_rax(0);
        ctx.regs_mut().set_rbx(!0);
        assert_eq!(ctx.idiv(&mem, &reg(Register::Qword(Gpr::Rbx))), Err(Fault::DivideError));
        assert_eq!(ctx.regs().rdx(), 0x8000_0000_0000_0000);
    }
}
