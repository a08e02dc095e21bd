//! Integer arithmetic and logic: the eight ALU operations, `test`, `not`,
//! `neg`, `inc` and `dec`.

use cpu::context::CpuContext;
use cpu::exception::Fault;
use cpu::instr::{AluOp, Operand};
use memory::Memory;

impl CpuContext {
    /// Performs `op` on `dest` and `src` and stores the result in `dest`
    /// (except for `cmp`).
    pub fn alu<M: Memory>(&mut self, mem: &mut M, op: AluOp, dest: &Operand, src: &Operand) -> Result<(), Fault> {
        let size = dest.size();
        let rhs = self.read_source(mem, src, size)?;
        let lhs = if op == AluOp::Cmp {
            self.read_operand(mem, dest)?
        } else {
            self.read_operand_rmw(mem, dest)?
        };

        let result = match op {
            AluOp::Add => self.flags.apply_add(size, lhs, rhs),
            AluOp::Adc => {
                let carry = self.flags.cf();
                self.flags.apply_adc(size, lhs, rhs, carry)
            }
            AluOp::Sub => self.flags.apply_sub(size, lhs, rhs),
            AluOp::Sbb => {
                let borrow = self.flags.cf();
                self.flags.apply_sbb(size, lhs, rhs, borrow)
            }
            AluOp::Cmp => {
                self.flags.apply_sub(size, lhs, rhs);
                return Ok(());
            }
            AluOp::And | AluOp::Or | AluOp::Xor => {
                let result = match op {
                    AluOp::And => lhs & rhs,
                    AluOp::Or => lhs | rhs,
                    _ => lhs ^ rhs,
                };
                self.flags.apply_logic(size, result);
                result
            }
        };
        self.write_operand(mem, dest, result)
    }

    /// `test`: sets flags like `and`, discarding the result.
    pub fn test<M: Memory>(&mut self, mem: &M, lhs: &Operand, rhs: &Operand) -> Result<(), Fault> {
        let size = lhs.size();
        let value = self.read_operand(mem, lhs)? & self.read_source(mem, rhs, size)?;
        self.flags.apply_logic(size, value);
        Ok(())
    }

    pub fn not<M: Memory>(&mut self, mem: &mut M, operand: &Operand) -> Result<(), Fault> {
        let value = self.read_operand_rmw(mem, operand)?;
        self.write_operand(mem, operand, !value)
    }

    /// Two's complement negation. `CF` is set unless the operand was zero.
    pub fn neg<M: Memory>(&mut self, mem: &mut M, operand: &Operand) -> Result<(), Fault> {
        let value = self.read_operand_rmw(mem, operand)?;
        let result = self.flags.apply_sub(operand.size(), 0, value);
        self.write_operand(mem, operand, result)
    }

    pub fn inc<M: Memory>(&mut self, mem: &mut M, operand: &Operand) -> Result<(), Fault> {
        let value = self.read_operand_rmw(mem, operand)?;
        let result = self.flags.apply_inc(operand.size(), value);
        self.write_operand(mem, operand, result)
    }

    pub fn dec<M: Memory>(&mut self, mem: &mut M, operand: &Operand) -> Result<(), Fault> {
        let value = self.read_operand_rmw(mem, operand)?;
        let result = self.flags.apply_dec(operand.size(), value);
        self.write_operand(mem, operand, result)
    }
}

#[cfg(test)]
mod tests {
    use cpu::config::CpuConfig;
    use cpu::context::CpuContext;
    use cpu::exception::Fault;
    use cpu::imm::Immediate;
    use cpu::instr::{AluOp, Gpr, MemoryLocation, Operand, OpSize, Register};
    use cpu::segment::Segment;
    use memory::{ArrayMemory, Memory};

    fn setup() -> (CpuContext, ArrayMemory) {
        (CpuContext::new(CpuConfig::default()), ArrayMemory::zeroed(0x10000))
    }

    #[test]
    fn sign_extended_immediates() {
        let (mut ctx, mut mem) = setup();
        ctx.regs_mut().set_eax(5);
        let eax = Operand::Reg(Register::Dword(Gpr::Rax));
        ctx.alu(&mut mem, AluOp::Add, &eax, &Immediate::from(-1i8).into()).unwrap();
        assert_eq!(ctx.regs().rax(), 4);
        assert!(ctx.flags().cf());

        ctx.alu(&mut mem, AluOp::And, &eax, &Immediate::from(0x80u8).into()).unwrap();
        assert_eq!(ctx.regs().rax(), 0);
        assert!(ctx.flags().zf());
        assert!(!ctx.flags().cf());
    }

    #[test]
    fn carry_chains() {
        let (mut ctx, mut mem) = setup();
        // 0x1_ffff + 0x1 as two 16-bit halves
        ctx.regs_mut().set_ax(0xffff);
        ctx.regs_mut().set_dx(0x0001);
        let ax = Operand::Reg(Register::Word(Gpr::Rax));
        let dx = Operand::Reg(Register::Word(Gpr::Rdx));
        ctx.alu(&mut mem, AluOp::Add, &ax, &Immediate::from(1u16).into()).unwrap();
        ctx.alu(&mut mem, AluOp::Adc, &dx, &Immediate::from(0u16).into()).unwrap();
        assert_eq!((ctx.regs().dx(), ctx.regs().ax()), (2, 0));
        assert!(!ctx.flags().cf());

        ctx.alu(&mut mem, AluOp::Sub, &ax, &Immediate::from(1u16).into()).unwrap();
        ctx.alu(&mut mem, AluOp::Sbb, &dx, &Immediate::from(0u16).into()).unwrap();
        assert_eq!((ctx.regs().dx(), ctx.regs().ax()), (1, 0xffff));
    }

    #[test]
    fn cmp_leaves_destination() {
        let (mut ctx, mut mem) = setup();
        let loc = MemoryLocation::new(Segment::Ds, 0x10, OpSize::Bits8);
        mem.store(0x10, 3).unwrap();
        ctx.alu(&mut mem, AluOp::Cmp, &loc.into(), &Immediate::from(4u8).into()).unwrap();
        assert_eq!(mem.load(0x10).unwrap(), 3);
        assert!(ctx.flags().cf());
        assert!(ctx.flags().sf());
    }

    #[test]
    fn read_only_destination_changes_nothing() {
        let (mut ctx, mut mem) = setup();
        mem.protect(0x20..0x24);
        ctx.flags_mut().assert_zf();
        let loc = MemoryLocation::new(Segment::Ds, 0x20, OpSize::Bits32);
        let err = ctx.alu(&mut mem, AluOp::Add, &loc.into(), &Immediate::from(1u32).into()).unwrap_err();
        assert!(match err { Fault::Memory(_) => true, _ => false });
        assert!(ctx.flags().zf());
    }

    #[test]
    fn neg_and_inc() {
        let (mut ctx, mut mem) = setup();
        let bl = Operand::Reg(Register::Low8(Gpr::Rbx));
        ctx.neg(&mut mem, &bl).unwrap();
        assert!(!ctx.flags().cf());
        assert!(ctx.flags().zf());

        ctx.regs_mut().set_bl(0x80);
        ctx.neg(&mut mem, &bl).unwrap();
        assert_eq!(ctx.regs().bl(), 0x80);
        assert!(ctx.flags().cf());
        assert!(ctx.flags().of());

        ctx.inc(&mut mem, &bl).unwrap();
        assert_eq!(ctx.regs().bl(), 0x81);
        assert!(ctx.flags().cf());
        ctx.not(&mut mem, &bl).unwrap();
        assert_eq!(ctx.regs().bl(), 0x7e);
    }

    #[test]
    fn test_sets_logic_flags() {
        let (mut ctx, mem) = setup();
        ctx.regs_mut().set_ecx(0xf0);
        let ecx = Operand::Reg(Register::Dword(Gpr::Rcx));
        ctx.test(&mem, &ecx, &Immediate::from(0x0fu8).into()).unwrap();
        assert!(ctx.flags().zf());
        assert_eq!(ctx.regs().ecx(), 0xf0);
    }
}
