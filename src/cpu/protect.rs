//! Protected-mode segment loading and privilege checks.
//!
//! Loading a segment register in protected mode is a small state machine: the
//! selector is parsed, its descriptor fetched from the GDT or LDT, decoded and
//! checked against the current privilege level. Only if every check passes
//! is the selector/cache pair installed. A fault leaves the register as it
//! was.

use cpu::context::{is_canonical, CpuContext, Invalidations};
use cpu::exception::{ExceptionVector, Fault};
use cpu::mode::ExecutionMode;
use cpu::segment::{seg_type, Descriptor, Segment, SegmentRegister, Selector, SystemType};
use memory::Memory;

pub(crate) fn gp(selector: &Selector, reason: &str) -> Fault {
    error!("#GP({:#x}): {}", selector.error_code(), reason);
    Fault::GeneralProtection(selector.error_code())
}

pub(crate) fn np(selector: &Selector, reason: &str) -> Fault {
    error!("#NP({:#x}): {}", selector.error_code(), reason);
    Fault::NotPresent(selector.error_code())
}

/// `#GP(0)`, for faults that do not blame a selector.
pub(crate) fn gp0(reason: &str) -> Fault {
    error!("#GP(0): {}", reason);
    Fault::GeneralProtection(0)
}

impl CpuContext {
    /// Returns the linear address of the descriptor `selector` refers to,
    /// checking that the `len` bytes of the descriptor are inside the table.
    fn descriptor_address(&self, selector: &Selector, len: u64, vector: ExceptionVector) -> Result<u64, Fault> {
        let offset = u64::from(selector.index) * 8;
        let last = offset + len - 1;
        let fault = |reason: &str| {
            error!("descriptor fetch for {} failed: {}", selector, reason);
            Fault::with_code(vector, selector.error_code())
        };

        if selector.ti {
            let ldt = &self.ldtr.cache;
            if !ldt.valid {
                return Err(fault("LDTR not valid"));
            }
            if last > u64::from(ldt.limit_scaled) {
                return Err(fault("index beyond LDT limit"));
            }
            Ok(ldt.base.wrapping_add(offset))
        } else {
            if last > u64::from(self.gdtr.limit) {
                return Err(fault("index beyond GDT limit"));
            }
            Ok(self.gdtr.base.wrapping_add(offset))
        }
    }

    /// Reads the raw 8-byte descriptor `selector` refers to.
    ///
    /// Raises `vector` with the selector as error code if the selector points
    /// outside of its descriptor table.
    pub fn fetch_descriptor<M: Memory>(
        &self,
        mem: &M,
        selector: &Selector,
        vector: ExceptionVector,
    ) -> Result<(u32, u32), Fault> {
        let addr = self.descriptor_address(selector, 8, vector)?;
        Ok((mem.load_u32(addr)?, mem.load_u32(addr.wrapping_add(4))?))
    }

    /// Reads a 16-byte long mode system descriptor.
    ///
    /// Returns the first three dwords; the type field of the fourth must be
    /// zero.
    pub fn fetch_descriptor_64<M: Memory>(
        &self,
        mem: &M,
        selector: &Selector,
        vector: ExceptionVector,
    ) -> Result<(u32, u32, u32), Fault> {
        let addr = self.descriptor_address(selector, 16, vector)?;
        let dword1 = mem.load_u32(addr)?;
        let dword2 = mem.load_u32(addr.wrapping_add(4))?;
        let dword3 = mem.load_u32(addr.wrapping_add(8))?;
        let dword4 = mem.load_u32(addr.wrapping_add(12))?;
        if (dword4 >> 8) & 0x1f != 0 {
            error!("64-bit descriptor {} has non-zero upper type", selector);
            return Err(Fault::with_code(vector, selector.error_code()));
        }
        Ok((dword1, dword2, dword3))
    }

    /// Fetches and decodes the descriptor `selector` refers to.
    pub(crate) fn load_descriptor<M: Memory>(
        &self,
        mem: &M,
        selector: &Selector,
        vector: ExceptionVector,
    ) -> Result<Descriptor, Fault> {
        let (dword1, dword2) = self.fetch_descriptor(mem, selector, vector)?;
        Ok(Descriptor::parse(dword1, dword2))
    }

    /// Address of the access byte of the descriptor `selector` refers to.
    fn access_byte_address(&self, selector: &Selector) -> u64 {
        let table = if selector.ti { self.ldtr.cache.base } else { self.gdtr.base };
        table.wrapping_add(u64::from(selector.index) * 8 + 5)
    }

    /// Sets the accessed bit of a code or data descriptor, both in `desc` and
    /// in the descriptor table.
    pub fn touch_segment<M: Memory>(&self, mem: &mut M, selector: &Selector, desc: &mut Descriptor) -> Result<(), Fault> {
        self.touch_segments(mem, &mut [(selector, desc)])
    }

    /// Sets the accessed bits of several descriptors.
    ///
    /// Every access byte is checked for writability before the first one is
    /// stored, so either all bits are set or the tables are left untouched.
    pub(crate) fn touch_segments<M: Memory>(
        &self,
        mem: &mut M,
        segs: &mut [(&Selector, &mut Descriptor)],
    ) -> Result<(), Fault> {
        for seg in segs.iter() {
            if !seg.1.is_accessed() {
                mem.check_writable(self.access_byte_address(seg.0), 1)?;
            }
        }
        for seg in segs.iter_mut() {
            if !seg.1.is_accessed() {
                seg.1.kind |= seg_type::ACCESSED;
                mem.store(self.access_byte_address(seg.0), seg.1.ar_byte())?;
            }
        }
        Ok(())
    }

    /// Checks that `desc` is a code segment that may be entered with the
    /// given requested and current privilege levels.
    pub fn validate_code_descriptor(
        &self,
        desc: &Descriptor,
        selector: &Selector,
        rpl: u8,
        cpl: u8,
    ) -> Result<(), Fault> {
        if !desc.valid || !desc.segment || !desc.is_code() {
            return Err(gp(selector, "not a code segment"));
        }

        if self.mode().is_long() && desc.long && desc.d_b {
            return Err(gp(selector, "code segment with both L and D set"));
        }

        if desc.is_conforming_code() {
            if desc.dpl > cpl {
                return Err(gp(selector, "conforming code segment DPL > CPL"));
            }
        } else {
            if desc.dpl != cpl {
                return Err(gp(selector, "non-conforming code segment DPL != CPL"));
            }
            if rpl > cpl {
                return Err(gp(selector, "non-conforming code segment RPL > CPL"));
            }
        }

        if !desc.present {
            return Err(np(selector, "code segment not present"));
        }

        Ok(())
    }

    /// Installs a new code segment with privilege level `cpl`.
    ///
    /// The RPL of the selector is forced to `cpl`.
    pub fn load_code_segment<M: Memory>(
        &mut self,
        mem: &mut M,
        selector: Selector,
        mut desc: Descriptor,
        cpl: u8,
    ) -> Result<(), Fault> {
        self.touch_segment(mem, &selector, &mut desc)?;
        self.install_code_segment(selector, desc, cpl);
        Ok(())
    }

    /// Puts a checked and touched code segment into `CS`.
    pub(crate) fn install_code_segment(&mut self, selector: Selector, desc: Descriptor, cpl: u8) {
        let mut selector = selector;
        selector.value = (selector.value & 0xfffc) | u16::from(cpl);
        selector.rpl = cpl;

        let old_cpl = self.cpl();
        let old_limit = self.segment(Segment::Cs).cache.limit_scaled;
        self.sregs[Segment::Cs as usize] = SegmentRegister::new(selector, desc);
        if desc.limit_scaled < old_limit {
            self.invalidate(Invalidations::DECODE_CACHE);
        }
        self.invalidate(Invalidations::PREFETCH);
        self.update_mode();
        if old_cpl != cpl {
            self.update_alignment_check();
        }
    }

    /// Installs a new stack segment. The RPL of the selector is forced to
    /// `cpl`.
    pub fn load_stack_segment<M: Memory>(
        &mut self,
        mem: &mut M,
        selector: Selector,
        mut desc: Descriptor,
        cpl: u8,
    ) -> Result<(), Fault> {
        if !selector.is_null() {
            self.touch_segment(mem, &selector, &mut desc)?;
        }
        self.install_stack_segment(selector, desc, cpl);
        Ok(())
    }

    /// Puts a checked and touched stack segment into `SS`.
    pub(crate) fn install_stack_segment(&mut self, selector: Selector, desc: Descriptor, cpl: u8) {
        let mut selector = selector;
        selector.value = (selector.value & 0xfffc) | u16::from(cpl);
        selector.rpl = cpl;
        self.sregs[Segment::Ss as usize] = SegmentRegister::new(selector, desc);
        self.invalidate(Invalidations::STACK_CACHE);
    }

    /// Loads a null selector with RPL taken from `value` into `seg`.
    ///
    /// Any access through the register will fault (outside of 64-bit mode).
    pub fn load_null_selector(&mut self, seg: Segment, value: u16) {
        let selector = Selector {
            value,
            index: 0,
            ti: false,
            rpl: (value & 3) as u8,
        };
        self.sregs[seg as usize] = SegmentRegister::new(selector, Descriptor::null());
        if seg == Segment::Ss {
            self.invalidate(Invalidations::STACK_CACHE);
        }
    }

    /// Loads `value` into a segment register, as `mov sreg` and `pop sreg` do.
    ///
    /// `CS` can only be loaded by far control transfers, except in real and
    /// virtual-8086 mode, where this is also used by them.
    pub fn load_segment_register<M: Memory>(&mut self, mem: &mut M, seg: Segment, value: u16) -> Result<(), Fault> {
        if !self.mode().is_protected() {
            self.load_real_mode_segment(seg, value);
            return Ok(());
        }

        match seg {
            Segment::Cs => {
                error!("attempt to load CS via a segment register load in {}", self.mode());
                Err(Fault::InvalidOpcode)
            }
            Segment::Ss => self.load_ss_protected(mem, value),
            _ => self.load_data_segment_protected(mem, seg, value),
        }
    }

    fn load_ss_protected<M: Memory>(&mut self, mem: &mut M, value: u16) -> Result<(), Fault> {
        let cpl = self.cpl();
        let selector = Selector::new(value);
        if selector.is_null() {
            if self.mode().is_long64() && cpl != 3 && selector.rpl == cpl {
                self.load_null_selector(Segment::Ss, value);
                return Ok(());
            }
            return Err(gp0("null selector loaded into SS"));
        }

        if selector.rpl != cpl {
            return Err(gp(&selector, "SS selector RPL != CPL"));
        }
        let mut desc = self.load_descriptor(mem, &selector, ExceptionVector::GeneralProtection)?;
        if !desc.valid || !desc.is_writable_data() {
            return Err(gp(&selector, "SS is not a writable data segment"));
        }
        if desc.dpl != cpl {
            return Err(gp(&selector, "SS DPL != CPL"));
        }
        if !desc.present {
            error!("#SS({:#x}): stack segment not present", selector.error_code());
            return Err(Fault::StackSegment(selector.error_code()));
        }

        self.touch_segment(mem, &selector, &mut desc)?;
        self.sregs[Segment::Ss as usize] = SegmentRegister::new(selector, desc);
        self.invalidate(Invalidations::STACK_CACHE);
        Ok(())
    }

    fn load_data_segment_protected<M: Memory>(&mut self, mem: &mut M, seg: Segment, value: u16) -> Result<(), Fault> {
        let selector = Selector::new(value);
        if selector.is_null() {
            self.load_null_selector(seg, value);
            return Ok(());
        }

        let mut desc = self.load_descriptor(mem, &selector, ExceptionVector::GeneralProtection)?;
        if !desc.valid {
            return Err(gp(&selector, "invalid descriptor"));
        }
        if !desc.segment || (desc.is_code() && !desc.is_readable_code()) {
            return Err(gp(&selector, "not a data or readable code segment"));
        }
        if !desc.is_conforming_code() {
            let cpl = self.cpl();
            if selector.rpl > desc.dpl || cpl > desc.dpl {
                return Err(gp(&selector, "RPL or CPL above DPL"));
            }
        }
        if !desc.present {
            error!("#NP({:#x}): {} segment not present", selector.error_code(), seg);
            return Err(Fault::NotPresent(selector.error_code()));
        }

        self.touch_segment(mem, &selector, &mut desc)?;
        self.sregs[seg as usize] = SegmentRegister::new(selector, desc);
        Ok(())
    }

    /// Loads a segment register in real or virtual-8086 mode.
    ///
    /// Real mode only replaces the base and keeps limit and attributes, which
    /// allows "unreal mode" setups to persist.
    pub(crate) fn load_real_mode_segment(&mut self, seg: Segment, value: u16) {
        let v8086 = self.mode() == ExecutionMode::Virtual8086;
        let reg = &mut self.sregs[seg as usize];
        reg.selector = Selector::new(value);
        reg.selector.rpl = if v8086 { 3 } else { 0 };
        reg.cache.valid = true;
        reg.cache.present = true;
        reg.cache.segment = true;
        reg.cache.kind = seg_type::DATA_RW_ACCESSED;
        reg.cache.base = u64::from(value) << 4;
        if v8086 {
            reg.cache.dpl = 3;
            reg.cache.limit_scaled = 0xffff;
            reg.cache.granularity = false;
            reg.cache.d_b = false;
            reg.cache.long = false;
            reg.cache.avl = false;
        }

        match seg {
            Segment::Cs => {
                self.invalidate(Invalidations::PREFETCH);
                self.update_mode();
                self.update_alignment_check();
            }
            Segment::Ss => self.invalidate(Invalidations::STACK_CACHE),
            _ => {}
        }
    }

    /// Nulls data segment registers the new, less privileged CPL may not use.
    ///
    /// Called after returning to an outer privilege level.
    pub fn validate_data_segments(&mut self) {
        let cpl = self.cpl();
        for &seg in Segment::DATA.iter() {
            let reg = &mut self.sregs[seg as usize];
            let cache = &reg.cache;
            if cache.dpl < cpl
                && (!cache.valid || !cache.segment || cache.is_data() || !cache.is_conforming_code())
            {
                debug!("nulling {} ({}) after privilege change to {}", seg, reg.selector, cpl);
                reg.selector.value = 0;
                reg.cache.valid = false;
            }
        }
    }

    /// Reads the inner stack pointer for privilege level `pl` from the
    /// current 16 or 32-bit TSS.
    pub(crate) fn stack_from_tss<M: Memory>(&self, mem: &M, pl: u8) -> Result<(u16, u64), Fault> {
        let tss = &self.tr;
        let fault = |reason: &str| {
            error!("#TS({:#x}): {}", tss.selector.error_code(), reason);
            Fault::InvalidTss(tss.selector.error_code())
        };
        if !tss.cache.valid {
            return Err(fault("TR not valid"));
        }

        let limit = u64::from(tss.cache.limit_scaled);
        let pl = u64::from(pl);
        match tss.cache.system_type() {
            Some(SystemType::AvailableTss386) | Some(SystemType::BusyTss386) => {
                let offset = 8 * pl + 4;
                if offset + 7 > limit {
                    return Err(fault("inner stack beyond TSS limit"));
                }
                let addr = tss.cache.base.wrapping_add(offset);
                let esp = mem.load_u32(addr)?;
                let ss = mem.load_u16(addr.wrapping_add(4))?;
                Ok((ss, u64::from(esp)))
            }
            Some(SystemType::AvailableTss286) | Some(SystemType::BusyTss286) => {
                let offset = 4 * pl + 2;
                if offset + 3 > limit {
                    return Err(fault("inner stack beyond TSS limit"));
                }
                let addr = tss.cache.base.wrapping_add(offset);
                let sp = mem.load_u16(addr)?;
                let ss = mem.load_u16(addr.wrapping_add(2))?;
                Ok((ss, u64::from(sp)))
            }
            _ => Err(fault("TR does not hold a TSS")),
        }
    }

    /// Reads the inner `RSP` for privilege level `pl` from the 64-bit TSS.
    pub(crate) fn rsp_from_tss<M: Memory>(&self, mem: &M, pl: u8) -> Result<u64, Fault> {
        let tss = &self.tr;
        let offset = 8 * u64::from(pl) + 4;
        if !tss.cache.valid || offset + 7 > u64::from(tss.cache.limit_scaled) {
            error!("#TS({:#x}): RSP{} beyond TSS limit", tss.selector.error_code(), pl);
            return Err(Fault::InvalidTss(tss.selector.error_code()));
        }

        let rsp = mem.load_u64(tss.cache.base.wrapping_add(offset))?;
        if !is_canonical(rsp) {
            error!("#SS(0): non-canonical RSP{} in TSS", pl);
            return Err(Fault::StackSegment(0));
        }
        Ok(rsp)
    }
}
