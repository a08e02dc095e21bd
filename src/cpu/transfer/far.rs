//! Far jumps, calls and returns.

use cpu::context::CpuContext;
use cpu::exception::{ExceptionVector, Fault};
use cpu::instr::{MemoryLocation, OpSize};
use cpu::protect::{gp, gp0, np};
use cpu::segment::{Descriptor, Segment, Selector, SystemType};
use cpu::transfer::StagedStack;
use memory::Memory;

impl CpuContext {
    /// Reads a `m16:16`, `m16:32` or `m16:64` far pointer: the offset
    /// followed by the selector.
    pub fn read_far_pointer<M: Memory>(&self, mem: &M, ptr: &MemoryLocation, size: OpSize) -> Result<(u16, u64), Fault> {
        let offset = self.read(mem, ptr.segment, ptr.offset, size)?;
        let selector = self.read(mem, ptr.segment, ptr.offset.wrapping_add(size.bytes()), OpSize::Bits16)?;
        Ok((selector as u16, offset))
    }

    /// Far jump to `selector:offset`.
    pub fn jump_far<M: Memory>(&mut self, mem: &mut M, selector: u16, offset: u64, size: OpSize) -> Result<(), Fault> {
        let offset = offset & size.mask();
        if !self.mode().is_protected() {
            return self.branch_real(selector, offset);
        }
        self.jump_protected(mem, selector, offset)
    }

    fn jump_protected<M: Memory>(&mut self, mem: &mut M, raw: u16, offset: u64) -> Result<(), Fault> {
        let selector = Selector::new(raw);
        if selector.is_null() {
            return Err(gp0("far jump to null selector"));
        }
        let desc = self.load_descriptor(mem, &selector, ExceptionVector::GeneralProtection)?;
        let cpl = self.cpl();

        if desc.segment {
            self.validate_code_descriptor(&desc, &selector, selector.rpl, cpl)?;
            return self.branch_far(mem, selector, desc, offset, cpl);
        }

        if desc.dpl < cpl || desc.dpl < selector.rpl {
            return Err(gp(&selector, "far jump: gate DPL below CPL or RPL"));
        }

        if self.mode().is_long() {
            if desc.system_type() != Some(SystemType::CallGate386) {
                return Err(gp(&selector, "far jump: only 64-bit call gates are allowed in long mode"));
            }
            if !desc.present {
                return Err(np(&selector, "far jump: call gate not present"));
            }
            return self.jump_call_gate64(mem, &selector);
        }

        match desc.system_type() {
            Some(SystemType::AvailableTss286) | Some(SystemType::AvailableTss386) => {
                if !desc.valid || selector.ti {
                    return Err(gp(&selector, "far jump: bad TSS selector"));
                }
                if !desc.present {
                    return Err(np(&selector, "far jump: TSS not present"));
                }
                Err(self.task_switch(&selector))
            }
            Some(SystemType::TaskGate) => self.task_gate(mem, &selector, &desc),
            Some(SystemType::CallGate286) | Some(SystemType::CallGate386) => {
                self.jump_call_gate(mem, &selector, &desc)
            }
            _ => Err(gp(&selector, "far jump: not a code segment, gate or TSS")),
        }
    }

    /// Follows a task gate to its TSS. The switch itself is not performed.
    fn task_gate<M: Memory>(&self, mem: &M, gate_selector: &Selector, gate: &Descriptor) -> Result<(), Fault> {
        if !gate.present {
            return Err(np(gate_selector, "task gate not present"));
        }

        let tss_selector = Selector::new(gate.gate.selector);
        if tss_selector.ti {
            return Err(gp(&tss_selector, "task gate: TSS selector refers to the LDT"));
        }
        let tss = self.load_descriptor(mem, &tss_selector, ExceptionVector::GeneralProtection)?;
        match tss.system_type() {
            Some(SystemType::AvailableTss286) | Some(SystemType::AvailableTss386) if tss.valid => {}
            _ => return Err(gp(&tss_selector, "task gate: not an available TSS")),
        }
        if !tss.present {
            return Err(np(&tss_selector, "task gate: TSS not present"));
        }
        Err(self.task_switch(&tss_selector))
    }

    /// Far call to `selector:offset`, pushing the return address at the
    /// operand size.
    ///
    /// In real and virtual-8086 mode `CS` and `IP` each take one operand-size
    /// slot, while `SP` wraps at the stack width selected by `SS.B`.
    pub fn call_far<M: Memory>(&mut self, mem: &mut M, selector: u16, offset: u64, size: OpSize) -> Result<(), Fault> {
        let offset = offset & size.mask();
        if !self.mode().is_protected() {
            self.check_real_target(offset)?;
            let mut stack = StagedStack::current(self);
            let (cs, ip) = (self.segment(Segment::Cs).selector.value, self.regs.rip());
            stack.push(self, mem, size, u64::from(cs))?;
            stack.push(self, mem, size, ip)?;
            stack.commit(self);
            return self.branch_real(selector, offset);
        }
        self.call_protected(mem, selector, offset, size)
    }

    fn call_protected<M: Memory>(&mut self, mem: &mut M, raw: u16, offset: u64, size: OpSize) -> Result<(), Fault> {
        let selector = Selector::new(raw);
        if selector.is_null() {
            return Err(gp0("far call to null selector"));
        }
        let desc = self.load_descriptor(mem, &selector, ExceptionVector::GeneralProtection)?;
        if !desc.valid {
            return Err(gp(&selector, "far call: invalid descriptor"));
        }
        let cpl = self.cpl();

        if desc.segment {
            self.validate_code_descriptor(&desc, &selector, selector.rpl, cpl)?;
            let mut desc = desc;
            let rip = self.prepare_far(mem, &selector, &mut desc, offset)?;

            let mut stack = if self.mode().is_long() && desc.long {
                let rsp = self.regs.rsp();
                StagedStack::flat(self, rsp)
            } else {
                StagedStack::legacy(self)
            };
            let (cs, ret) = (self.segment(Segment::Cs).selector.value, self.regs.rip());
            stack.push(self, mem, size, u64::from(cs))?;
            stack.push(self, mem, size, ret)?;

            self.commit_far(selector, desc, rip, cpl);
            stack.commit(self);
            return Ok(());
        }

        if desc.dpl < cpl || desc.dpl < selector.rpl {
            return Err(gp(&selector, "far call: gate DPL below CPL or RPL"));
        }

        if self.mode().is_long() {
            if desc.system_type() != Some(SystemType::CallGate386) {
                return Err(gp(&selector, "far call: only 64-bit call gates are allowed in long mode"));
            }
            if !desc.present {
                return Err(np(&selector, "far call: call gate not present"));
            }
            return self.call_gate64(mem, &selector);
        }

        match desc.system_type() {
            Some(SystemType::AvailableTss286) | Some(SystemType::AvailableTss386) => {
                if selector.ti {
                    return Err(gp(&selector, "far call: bad TSS selector"));
                }
                if !desc.present {
                    return Err(np(&selector, "far call: TSS not present"));
                }
                Err(self.task_switch(&selector))
            }
            Some(SystemType::TaskGate) => self.task_gate(mem, &selector, &desc),
            Some(SystemType::CallGate286) | Some(SystemType::CallGate386) => {
                if !desc.present {
                    return Err(np(&selector, "far call: call gate not present"));
                }
                self.call_gate(mem, &desc)
            }
            _ => Err(gp(&selector, "far call: not a code segment, gate or TSS")),
        }
    }

    /// Far return. Pops `IP` and `CS` at the operand size, then releases
    /// `pop` bytes of parameters.
    ///
    /// A return to an outer privilege level also pops `SS:SP` from beyond
    /// the parameters.
    pub fn ret_far<M: Memory>(&mut self, mem: &mut M, pop: u16, size: OpSize) -> Result<(), Fault> {
        let sp = self.stack_pointer();
        let rip = self.stack_slot(mem, sp, 0, size)?;
        let raw_cs = self.stack_slot(mem, sp, size.bytes(), size)? as u16;

        if !self.mode().is_protected() {
            self.branch_real(raw_cs, rip)?;
            let sp = self.stack_offset(sp, (2 * size.bytes() + u64::from(pop)) as i64);
            self.set_stack_pointer(sp);
            return Ok(());
        }
        self.return_protected(mem, sp, rip, raw_cs, pop, size)
    }

    fn return_protected<M: Memory>(
        &mut self,
        mem: &mut M,
        sp: u64,
        rip: u64,
        raw_cs: u16,
        pop: u16,
        size: OpSize,
    ) -> Result<(), Fault> {
        let cs_selector = Selector::new(raw_cs);
        if cs_selector.is_null() {
            return Err(gp0("far return to null selector"));
        }
        let cs_desc = self.load_descriptor(mem, &cs_selector, ExceptionVector::GeneralProtection)?;
        let cpl = self.cpl();
        if cs_selector.rpl < cpl {
            return Err(gp(&cs_selector, "far return: RPL below CPL"));
        }
        self.validate_code_descriptor(&cs_desc, &cs_selector, 0, cs_selector.rpl)?;

        let params_end = 2 * size.bytes() + u64::from(pop);
        if cs_selector.rpl == cpl {
            self.branch_far(mem, cs_selector, cs_desc, rip, cpl)?;
            let sp = self.stack_offset(sp, params_end as i64);
            self.set_stack_pointer(sp);
            return Ok(());
        }

        let new_sp = self.stack_slot(mem, sp, params_end, size)?;
        let raw_ss = self.stack_slot(mem, sp, params_end + size.bytes(), size)? as u16;
        let mut ss = self.check_return_ss(mem, raw_ss, &cs_selector, &cs_desc, ExceptionVector::StackSegment)?;
        let rip = self.far_target(&cs_desc, rip)?;
        let mut cs_desc = cs_desc;
        self.touch_return_segments(mem, &cs_selector, &mut cs_desc, &mut ss)?;

        let rpl = cs_selector.rpl;
        self.commit_far(cs_selector, cs_desc, rip, rpl);
        self.commit_return_ss(ss, raw_ss, rpl);
        self.set_stack_pointer(new_sp.wrapping_add(u64::from(pop)));
        self.validate_data_segments();
        Ok(())
    }

    /// Validates the stack segment of a return to an outer privilege level.
    ///
    /// Returns `None` for a null selector, which is only allowed when
    /// returning to 64-bit code outside of ring 3. A stack segment that is
    /// not present raises `not_present`.
    pub(crate) fn check_return_ss<M: Memory>(
        &self,
        mem: &M,
        raw: u16,
        cs_selector: &Selector,
        cs_desc: &Descriptor,
        not_present: ExceptionVector,
    ) -> Result<Option<(Selector, Descriptor)>, Fault> {
        let selector = Selector::new(raw);
        if selector.is_null() {
            if self.mode().is_long() && cs_desc.long && cs_selector.rpl != 3 {
                return Ok(None);
            }
            return Err(gp0("null SS on return to outer privilege level"));
        }

        if selector.rpl != cs_selector.rpl {
            return Err(gp(&selector, "return SS RPL != CS RPL"));
        }
        let desc = self.load_descriptor(mem, &selector, ExceptionVector::GeneralProtection)?;
        if !desc.valid || !desc.is_writable_data() {
            return Err(gp(&selector, "return SS is not a writable data segment"));
        }
        if desc.dpl != cs_selector.rpl {
            return Err(gp(&selector, "return SS DPL != CS RPL"));
        }
        if !desc.present {
            error!("return SS {} not present", selector);
            return Err(Fault::with_code(not_present, selector.error_code()));
        }
        Ok(Some((selector, desc)))
    }

    /// Sets the accessed bits of the code and stack segments of a return to
    /// an outer privilege level. Either both are set or neither is.
    pub(crate) fn touch_return_segments<M: Memory>(
        &self,
        mem: &mut M,
        cs_selector: &Selector,
        cs_desc: &mut Descriptor,
        ss: &mut Option<(Selector, Descriptor)>,
    ) -> Result<(), Fault> {
        match *ss {
            Some((ref ss_selector, ref mut ss_desc)) => {
                self.touch_segments(mem, &mut [(cs_selector, cs_desc), (ss_selector, ss_desc)])
            }
            None => self.touch_segment(mem, cs_selector, cs_desc),
        }
    }

    /// Installs the stack segment returned by `check_return_ss`, or a null
    /// `SS` holding `raw`.
    pub(crate) fn commit_return_ss(&mut self, ss: Option<(Selector, Descriptor)>, raw: u16, rpl: u8) {
        match ss {
            Some((selector, desc)) => self.install_stack_segment(selector, desc, rpl),
            None => self.load_null_selector(Segment::Ss, raw),
        }
    }
}
