//! Far jumps and calls through call gates.
//!
//! A call through a gate to a more privileged non-conforming code segment
//! switches to the inner stack named by the TSS. Jumps through a gate never
//! change the privilege level.

use cpu::context::CpuContext;
use cpu::exception::{ExceptionVector, Fault};
use cpu::instr::OpSize;
use cpu::protect::{gp, gp0, np};
use cpu::segment::{Descriptor, Segment, SegmentRegister, Selector, SystemType};
use cpu::transfer::StagedStack;
use memory::Memory;

fn ts(selector: &Selector, reason: &str) -> Fault {
    error!("#TS({:#x}): {}", selector.error_code(), reason);
    Fault::InvalidTss(selector.error_code())
}

impl CpuContext {
    /// Fetches the code segment a call gate points to.
    fn gate_target<M: Memory>(&self, mem: &M, raw: u16) -> Result<(Selector, Descriptor), Fault> {
        let selector = Selector::new(raw);
        if selector.is_null() {
            return Err(gp0("call gate points to null selector"));
        }
        let desc = self.load_descriptor(mem, &selector, ExceptionVector::GeneralProtection)?;
        Ok((selector, desc))
    }

    /// Reads a 16-byte long mode call gate and returns its target selector
    /// and 64-bit offset.
    fn load_gate64<M: Memory>(&self, mem: &M, gate_selector: &Selector) -> Result<(u16, u64), Fault> {
        let (dword1, dword2, dword3) = self.fetch_descriptor_64(mem, gate_selector, ExceptionVector::GeneralProtection)?;
        let gate = Descriptor::parse(dword1, dword2);
        Ok((gate.gate.selector, gate.gate.offset | u64::from(dword3) << 32))
    }

    /// Checks the target of a 64-bit call gate, which must be a present
    /// 64-bit code segment.
    fn check_gate64_target(&self, selector: &Selector, desc: &Descriptor) -> Result<(), Fault> {
        if !desc.valid || !desc.segment || desc.is_data() || desc.dpl > self.cpl() {
            return Err(gp(selector, "64-bit call gate target is not code or DPL > CPL"));
        }
        if !desc.long || desc.d_b {
            return Err(gp(selector, "64-bit call gate target is not a 64-bit code segment"));
        }
        if !desc.present {
            return Err(np(selector, "64-bit call gate target not present"));
        }
        Ok(())
    }

    pub(crate) fn jump_call_gate<M: Memory>(&mut self, mem: &mut M, gate_selector: &Selector, gate: &Descriptor) -> Result<(), Fault> {
        if !gate.present {
            return Err(np(gate_selector, "far jump: call gate not present"));
        }

        let (selector, desc) = self.gate_target(mem, gate.gate.selector)?;
        let cpl = self.cpl();
        self.validate_code_descriptor(&desc, &selector, 0, cpl)?;
        self.branch_far(mem, selector, desc, gate.gate.offset, cpl)
    }

    pub(crate) fn jump_call_gate64<M: Memory>(&mut self, mem: &mut M, gate_selector: &Selector) -> Result<(), Fault> {
        let (raw, rip) = self.load_gate64(mem, gate_selector)?;
        let (selector, desc) = self.gate_target(mem, raw)?;
        if !desc.valid || !desc.is_code() {
            return Err(gp(&selector, "far jump: 64-bit call gate target is not code"));
        }
        if !desc.long || desc.d_b {
            return Err(gp(&selector, "far jump: 64-bit call gate target is not a 64-bit code segment"));
        }

        let cpl = self.cpl();
        self.validate_code_descriptor(&desc, &selector, 0, cpl)?;
        self.branch_far(mem, selector, desc, rip, cpl)
    }

    /// Far call through a present 286 or 386 call gate.
    pub(crate) fn call_gate<M: Memory>(&mut self, mem: &mut M, gate: &Descriptor) -> Result<(), Fault> {
        let (selector, mut desc) = self.gate_target(mem, gate.gate.selector)?;
        let cpl = self.cpl();
        if !desc.valid || !desc.segment || desc.is_data() || desc.dpl > cpl {
            return Err(gp(&selector, "call gate target is not code or DPL > CPL"));
        }
        if !desc.present {
            return Err(np(&selector, "call gate target not present"));
        }

        let size = if gate.system_type() == Some(SystemType::CallGate386) {
            OpSize::Bits32
        } else {
            OpSize::Bits16
        };
        let rip = gate.gate.offset;

        if !desc.is_conforming_code() && desc.dpl < cpl {
            return self.call_gate_inner(mem, gate, selector, desc, size);
        }

        let rip = self.prepare_far(mem, &selector, &mut desc, rip)?;
        let mut stack = StagedStack::current(self);
        let (cs, ret) = (self.segment(Segment::Cs).selector.value, self.regs.rip());
        stack.push(self, mem, size, u64::from(cs))?;
        stack.push(self, mem, size, ret)?;

        self.commit_far(selector, desc, rip, cpl);
        stack.commit(self);
        Ok(())
    }

    /// Call gate to a more privileged level: switches to the stack for the
    /// target DPL from the TSS and copies the gate's parameters over.
    fn call_gate_inner<M: Memory>(
        &mut self,
        mem: &mut M,
        gate: &Descriptor,
        cs_selector: Selector,
        mut cs_desc: Descriptor,
        size: OpSize,
    ) -> Result<(), Fault> {
        let new_cpl = cs_desc.dpl;
        let (raw_ss, inner_sp) = self.stack_from_tss(mem, new_cpl)?;

        let mut ss_selector = Selector::new(raw_ss);
        if ss_selector.is_null() {
            return Err(ts(&ss_selector, "inner stack selector is null"));
        }
        let mut ss_desc = self.load_descriptor(mem, &ss_selector, ExceptionVector::InvalidTss)?;
        if ss_selector.rpl != new_cpl {
            return Err(ts(&ss_selector, "inner SS RPL != target DPL"));
        }
        if ss_desc.dpl != new_cpl {
            return Err(ts(&ss_selector, "inner SS DPL != target DPL"));
        }
        if !ss_desc.valid || !ss_desc.is_writable_data() {
            return Err(ts(&ss_selector, "inner SS is not a writable data segment"));
        }
        if !ss_desc.present {
            error!("#SS({:#x}): inner stack not present", ss_selector.error_code());
            return Err(Fault::StackSegment(ss_selector.error_code()));
        }

        let rip = gate.gate.offset;
        if rip > u64::from(cs_desc.limit_scaled) {
            return Err(gp0(&format!("call gate entry {:#x} beyond CS limit", rip)));
        }
        self.touch_segments(mem, &mut [(&ss_selector, &mut ss_desc), (&cs_selector, &mut cs_desc)])?;

        let outer_ss = *self.segment(Segment::Ss);
        let outer_cs = *self.segment(Segment::Cs);
        let outer_sp = self.stack_pointer();
        let ret = if outer_cs.cache.d_b {
            self.regs.rip() & 0xffff_ffff
        } else {
            self.regs.rip() & 0xffff
        };

        ss_selector.value = (ss_selector.value & 0xfffc) | u16::from(new_cpl);
        let mut stack = StagedStack::inner(self, SegmentRegister::new(ss_selector, ss_desc), inner_sp);
        stack.push(self, mem, size, u64::from(outer_ss.selector.value))?;
        stack.push(self, mem, size, outer_sp)?;
        let params = gate.gate.param_count & 0x1f;
        for n in (0..u64::from(params)).rev() {
            let param = self.stack_slot(mem, outer_sp, n * size.bytes(), size)?;
            stack.push(self, mem, size, param)?;
        }
        stack.push(self, mem, size, u64::from(outer_cs.selector.value))?;
        stack.push(self, mem, size, ret)?;

        self.install_stack_segment(ss_selector, ss_desc, new_cpl);
        self.install_code_segment(cs_selector, cs_desc, new_cpl);
        self.regs.set_rip(rip);
        stack.commit(self);
        debug!("call gate to {}:{:#x}, CPL {} -> {}, {} parameters", cs_selector, rip, outer_cs.selector.rpl, new_cpl, params);
        Ok(())
    }

    /// Far call through a 64-bit call gate. Entering a more privileged level
    /// switches to the `RSP` the TSS holds for it and loads a null `SS`.
    pub(crate) fn call_gate64<M: Memory>(&mut self, mem: &mut M, gate_selector: &Selector) -> Result<(), Fault> {
        let (raw, rip) = self.load_gate64(mem, gate_selector)?;
        let (selector, mut desc) = self.gate_target(mem, raw)?;
        self.check_gate64_target(&selector, &desc)?;
        let rip = self.far_target(&desc, rip)?;

        let cpl = self.cpl();
        let old_cs = u64::from(self.segment(Segment::Cs).selector.value);
        let old_rip = self.regs.rip();

        if !desc.is_conforming_code() && desc.dpl < cpl {
            let new_cpl = desc.dpl;
            let inner_rsp = self.rsp_from_tss(mem, new_cpl)?;
            let old_ss = u64::from(self.segment(Segment::Ss).selector.value);
            let old_rsp = self.regs.rsp();
            self.touch_segment(mem, &selector, &mut desc)?;

            let mut stack = StagedStack::flat(self, inner_rsp);
            stack.push(self, mem, OpSize::Bits64, old_ss)?;
            stack.push(self, mem, OpSize::Bits64, old_rsp)?;
            stack.push(self, mem, OpSize::Bits64, old_cs)?;
            stack.push(self, mem, OpSize::Bits64, old_rip)?;

            self.commit_far(selector, desc, rip, new_cpl);
            self.load_null_selector(Segment::Ss, u16::from(new_cpl));
            stack.commit(self);
            return Ok(());
        }

        self.touch_segment(mem, &selector, &mut desc)?;
        let rsp = self.regs.rsp();
        let mut stack = StagedStack::flat(self, rsp);
        stack.push(self, mem, OpSize::Bits64, old_cs)?;
        stack.push(self, mem, OpSize::Bits64, old_rip)?;
        self.commit_far(selector, desc, rip, cpl);
        stack.commit(self);
        Ok(())
    }
}
