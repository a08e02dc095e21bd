//! Interrupt return and virtual-8086 mode entry.

use cpu::config::CpuLevel;
use cpu::context::{CpuContext, Invalidations};
use cpu::control::Cr4;
use cpu::exception::{ExceptionVector, Fault};
use cpu::flags::FlagSet;
use cpu::instr::OpSize;
use cpu::mode::ExecutionMode;
use cpu::protect::{gp, gp0, np};
use cpu::segment::{Descriptor, Segment, Selector, SystemType};
use memory::Memory;

/// The values `iret` pops before deciding where it returns to.
#[derive(Debug, Copy, Clone)]
struct Frame {
    sp: u64,
    rip: u64,
    cs: u16,
    flags: u32,
}

impl CpuContext {
    /// Returns from an interrupt or exception handler.
    ///
    /// Pops `IP`, `CS` and `FLAGS` at the operand size, plus `SP` and `SS`
    /// when returning to an outer privilege level. Nothing is modified
    /// unless the whole return succeeds.
    pub fn iret<M: Memory>(&mut self, mem: &mut M, size: OpSize) -> Result<(), Fault> {
        match self.mode() {
            ExecutionMode::Real => self.iret_real(mem, size),
            ExecutionMode::Virtual8086 => self.iret_v86(mem, size),
            ExecutionMode::Protected => self.iret_protected(mem, size),
            ExecutionMode::Compatibility | ExecutionMode::Long64 => self.iret_long(mem, size),
        }
    }

    fn pop_frame<M: Memory>(&self, mem: &M, size: OpSize) -> Result<Frame, Fault> {
        let sp = self.stack_pointer();
        let bytes = size.bytes();
        Ok(Frame {
            sp,
            rip: self.stack_slot(mem, sp, 0, size)?,
            cs: self.stack_slot(mem, sp, bytes, size)? as u16,
            flags: self.stack_slot(mem, sp, 2 * bytes, size)? as u32,
        })
    }

    fn release_frame(&mut self, frame: &Frame, size: OpSize) {
        let sp = self.stack_offset(frame.sp, 3 * size.bytes() as i64);
        self.set_stack_pointer(sp);
    }

    /// The `EFLAGS` bits a protected-mode `iret` at privilege level `cpl` may
    /// change.
    fn iret_change_mask(&self, cpl: u8) -> u32 {
        let mut mask = FlagSet::OSZAPC | FlagSet::TF | FlagSet::DF | FlagSet::NT | FlagSet::RF;
        if self.config.level() >= CpuLevel::I486 {
            mask |= FlagSet::ID | FlagSet::AC;
        }
        if cpl <= self.flags.iopl() {
            mask |= FlagSet::IF;
        }
        if cpl == 0 {
            mask |= FlagSet::VIP | FlagSet::VIF | FlagSet::IOPL;
        }
        mask.bits()
    }

    fn iret_real<M: Memory>(&mut self, mem: &M, size: OpSize) -> Result<(), Fault> {
        let frame = self.pop_frame(mem, size)?;
        self.branch_real(frame.cs, frame.rip)?;
        self.release_frame(&frame, size);
        if size == OpSize::Bits16 {
            self.write_flags16(frame.flags as u16, true, true);
        } else {
            let keep = FlagSet::VIF | FlagSet::VIP | FlagSet::VM;
            self.write_eflags(frame.flags, FlagSet::VALID.bits() & !keep.bits());
        }
        Ok(())
    }

    /// `iret` in virtual-8086 mode.
    ///
    /// Requires IOPL 3, except for a 16-bit `iret` with `CR4.VME` set, which
    /// loads `IF` into `VIF` instead.
    fn iret_v86<M: Memory>(&mut self, mem: &M, size: OpSize) -> Result<(), Fault> {
        let iopl = self.flags.iopl();
        let vme = self.control.cr4().contains(Cr4::VME);

        if size != OpSize::Bits16 {
            if iopl < 3 {
                return Err(gp0("32-bit iret in v8086 mode with IOPL < 3"));
            }
            let frame = self.pop_frame(mem, size)?;
            self.branch_real(frame.cs, frame.rip)?;
            self.release_frame(&frame, size);
            let mut mask = FlagSet::OSZAPC | FlagSet::TF | FlagSet::IF | FlagSet::DF | FlagSet::NT | FlagSet::RF;
            if self.config.level() >= CpuLevel::I486 {
                mask |= FlagSet::ID | FlagSet::AC;
            }
            self.write_eflags(frame.flags, mask.bits());
            return Ok(());
        }

        if iopl < 3 && !vme {
            return Err(gp0("iret in v8086 mode with IOPL < 3"));
        }
        let frame = self.pop_frame(mem, size)?;
        let flags = FlagSet::from_bits_truncate(frame.flags & 0xffff);

        if vme && iopl < 3 {
            if (flags.contains(FlagSet::IF) && self.flags.vip()) || flags.contains(FlagSet::TF) {
                return Err(gp0("virtual iret would enable interrupts with VIP set, or set TF"));
            }
            self.branch_real(frame.cs, frame.rip)?;
            self.release_frame(&frame, size);
            let mut value = flags;
            if flags.contains(FlagSet::IF) {
                value |= FlagSet::VIF;
            }
            let mask = FlagSet::OSZAPC | FlagSet::TF | FlagSet::DF | FlagSet::NT | FlagSet::VIF;
            self.write_eflags(value.bits(), mask.bits());
            return Ok(());
        }

        self.branch_real(frame.cs, frame.rip)?;
        self.release_frame(&frame, size);
        self.write_flags16(flags.bits() as u16, false, true);
        Ok(())
    }

    fn iret_protected<M: Memory>(&mut self, mem: &mut M, size: OpSize) -> Result<(), Fault> {
        if self.flags.nt() {
            return self.nested_task_return(mem);
        }

        let frame = self.pop_frame(mem, size)?;
        let cpl = self.cpl();
        if size == OpSize::Bits32 && frame.flags & FlagSet::VM.bits() != 0 && cpl == 0 {
            return self.stack_return_to_v86(mem, &frame);
        }

        let (cs_selector, cs_desc) = self.check_return_cs(mem, frame.cs)?;
        if cs_selector.rpl == cpl {
            self.branch_far(mem, cs_selector, cs_desc, frame.rip, cpl)?;
            if size == OpSize::Bits16 {
                let iopl = self.flags.iopl();
                self.write_flags16(frame.flags as u16, cpl == 0, cpl <= iopl);
            } else {
                let mask = self.iret_change_mask(cpl);
                self.write_eflags(frame.flags, mask);
            }
            self.release_frame(&frame, size);
            return Ok(());
        }

        let bytes = size.bytes();
        let new_sp = self.stack_slot(mem, frame.sp, 3 * bytes, size)?;
        let raw_ss = self.stack_slot(mem, frame.sp, 4 * bytes, size)? as u16;
        let ss = self.check_return_ss(mem, raw_ss, &cs_selector, &cs_desc, ExceptionVector::NotPresent)?;
        let (ss_selector, mut ss_desc) = match ss {
            Some(ss) => ss,
            None => return Err(gp0("iret to null SS")),
        };
        let mut mask = self.iret_change_mask(cpl);
        if size == OpSize::Bits16 {
            mask &= 0xffff;
        }
        let rip = self.far_target(&cs_desc, frame.rip)?;
        let mut cs_desc = cs_desc;
        self.touch_segments(mem, &mut [(&cs_selector, &mut cs_desc), (&ss_selector, &mut ss_desc)])?;

        let rpl = cs_selector.rpl;
        self.commit_far(cs_selector, cs_desc, rip, rpl);
        self.write_eflags(frame.flags, mask);
        self.install_stack_segment(ss_selector, ss_desc, rpl);
        self.set_stack_pointer(new_sp);
        self.validate_data_segments();
        Ok(())
    }

    /// `iret` in long mode. `VM` is ignored, `NT` is rejected, and a 64-bit
    /// `iret` always pops `SS:RSP`.
    fn iret_long<M: Memory>(&mut self, mem: &mut M, size: OpSize) -> Result<(), Fault> {
        if self.flags.nt() {
            return Err(gp0("iret with NT set in long mode"));
        }

        let mut frame = self.pop_frame(mem, size)?;
        frame.flags &= !FlagSet::VM.bits();
        let (cs_selector, cs_desc) = self.check_return_cs(mem, frame.cs)?;

        let cpl = self.cpl();
        let mut mask = self.iret_change_mask(cpl);
        if size == OpSize::Bits16 {
            mask &= 0xffff;
        }

        if cs_selector.rpl == cpl && size != OpSize::Bits64 {
            self.branch_far(mem, cs_selector, cs_desc, frame.rip, cpl)?;
            self.write_eflags(frame.flags, mask);
            self.release_frame(&frame, size);
            return Ok(());
        }

        let bytes = size.bytes();
        let new_sp = self.stack_slot(mem, frame.sp, 3 * bytes, size)?;
        let raw_ss = self.stack_slot(mem, frame.sp, 4 * bytes, size)? as u16;
        let mut ss = self.check_return_ss(mem, raw_ss, &cs_selector, &cs_desc, ExceptionVector::NotPresent)?;
        let rip = self.far_target(&cs_desc, frame.rip)?;
        let mut cs_desc = cs_desc;
        self.touch_return_segments(mem, &cs_selector, &mut cs_desc, &mut ss)?;

        let rpl = cs_selector.rpl;
        self.commit_far(cs_selector, cs_desc, rip, rpl);
        self.write_eflags(frame.flags, mask);
        self.commit_return_ss(ss, raw_ss, rpl);
        self.set_stack_pointer(new_sp);
        if cpl != self.cpl() {
            self.validate_data_segments();
        }
        Ok(())
    }

    /// Checks the code segment an `iret` returns to.
    fn check_return_cs<M: Memory>(&self, mem: &M, raw: u16) -> Result<(Selector, Descriptor), Fault> {
        let selector = Selector::new(raw);
        if selector.is_null() {
            return Err(gp0("iret to null CS"));
        }
        let desc = self.load_descriptor(mem, &selector, ExceptionVector::GeneralProtection)?;
        if selector.rpl < self.cpl() {
            return Err(gp(&selector, "iret: return CS RPL below CPL"));
        }
        self.validate_code_descriptor(&desc, &selector, 0, selector.rpl)?;
        Ok((selector, desc))
    }

    /// `iret` with `NT` set returns to the task linked in the current TSS.
    fn nested_task_return<M: Memory>(&self, mem: &M) -> Result<(), Fault> {
        if !self.tr.cache.valid {
            error!("#TS(0): nested iret with invalid TR");
            return Err(Fault::InvalidTss(0));
        }
        let link = Selector::new(mem.load_u16(self.tr.cache.base)?);
        let ts = |reason: &str| {
            error!("#TS({:#x}): {}", link.error_code(), reason);
            Fault::InvalidTss(link.error_code())
        };
        if link.ti {
            return Err(ts("nested iret: link selector refers to the LDT"));
        }
        let tss = self.load_descriptor(mem, &link, ExceptionVector::InvalidTss)?;
        match tss.system_type() {
            Some(SystemType::BusyTss286) | Some(SystemType::BusyTss386) if tss.valid => {}
            _ => return Err(ts("nested iret: link does not point to a busy TSS")),
        }
        if !tss.present {
            return Err(np(&link, "nested iret: TSS not present"));
        }
        Err(self.task_switch(&link))
    }

    /// A 32-bit `iret` at CPL 0 that pops `VM = 1` enters virtual-8086 mode.
    ///
    /// The frame continues with `ESP`, `SS`, `ES`, `DS`, `FS` and `GS`, all
    /// popped as dwords.
    fn stack_return_to_v86<M: Memory>(&mut self, mem: &M, frame: &Frame) -> Result<(), Fault> {
        let mut slots = [0u64; 6];
        for (i, slot) in slots.iter_mut().enumerate() {
            *slot = self.stack_slot(mem, frame.sp, 12 + 4 * i as u64, OpSize::Bits32)?;
        }
        let [esp, ss, es, ds, fs, gs] = slots;

        self.write_eflags(frame.flags, FlagSet::VALID.bits());
        for &(seg, value) in [
            (Segment::Cs, frame.cs),
            (Segment::Ss, ss as u16),
            (Segment::Es, es as u16),
            (Segment::Ds, ds as u16),
            (Segment::Fs, fs as u16),
            (Segment::Gs, gs as u16),
        ].iter() {
            self.sregs[seg as usize].selector.value = value;
        }
        self.regs.set_rip(frame.rip & 0xffff);
        self.regs.set_esp(esp as u32);
        self.init_v8086_mode();
        Ok(())
    }

    /// Reloads all six segment caches for virtual-8086 mode from their
    /// selectors: present, DPL 3, read/write data, 64 KiB at
    /// `selector << 4`. The RPL of every selector becomes 3.
    pub fn init_v8086_mode(&mut self) {
        for reg in self.sregs.iter_mut() {
            reg.cache = Descriptor::real_mode(reg.selector.value, 3);
            reg.selector = Selector::new(reg.selector.value);
            reg.selector.rpl = 3;
        }
        self.update_mode();
        self.update_alignment_check();
        self.invalidate(Invalidations::STACK_CACHE);
        debug!("entered v8086 mode at {:04x}:{:04x}", self.segment(Segment::Cs).selector.value, self.regs.ip());
    }
}
