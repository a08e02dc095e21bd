//! The architectural state of one CPU.

use cpu::config::CpuConfig;
use cpu::control::{ControlRegisters, Cr0};
use cpu::exception::Fault;
use cpu::flags::{FlagSet, FlagState};
use cpu::instr::{Gpr, OpSize};
use cpu::mode::ExecutionMode;
use cpu::segment::{Descriptor, DescriptorTable, Segment, SegmentRegister, SystemType};
use cpu::state::State;
use memory::Memory;

bitflags! {
    /// Caches outside of the core that a state change has made stale.
    ///
    /// The fetch loop and the memory subsystem drain these with
    /// `CpuContext::take_invalidations` after every instruction.
    pub struct Invalidations: u8 {
        /// Prefetched instruction bytes.
        const PREFETCH = 1 << 0;
        /// Decoded instruction traces (the code segment limit shrank).
        const DECODE_CACHE = 1 << 1;
        /// Cached stack page translations.
        const STACK_CACHE = 1 << 2;
        /// All TLB entries.
        const TLB = 1 << 3;
        /// All non-global TLB entries.
        const TLB_NON_GLOBAL = 1 << 4;
    }
}

/// Kind of data access checked against a segment.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Access {
    Read,
    Write,
}

/// Returns whether `addr` is canonical for 48-bit linear addresses.
pub fn is_canonical(addr: u64) -> bool {
    let upper = (addr as i64) >> 47;
    upper == 0 || upper == -1
}

/// The complete architectural state of a CPU: register file, flags, segment
/// registers, system registers and control registers.
///
/// Nothing in here is shared; every virtual CPU owns one `CpuContext`.
#[derive(Debug, Clone)]
pub struct CpuContext {
    pub(crate) regs: State,
    pub(crate) flags: FlagState,
    pub(crate) sregs: [SegmentRegister; 6],
    pub(crate) gdtr: DescriptorTable,
    pub(crate) idtr: DescriptorTable,
    pub(crate) ldtr: SegmentRegister,
    pub(crate) tr: SegmentRegister,
    pub(crate) control: ControlRegisters,
    pub(crate) config: CpuConfig,
    mode: ExecutionMode,
    alignment_check: bool,
    invalidations: Invalidations,
}

impl CpuContext {
    /// Creates a CPU in its power-on state.
    ///
    /// Execution starts in real mode at `F000:FFF0`, with the `CS` base at
    /// `0xFFFF0000` so that the first fetch hits the top of the address
    /// space.
    pub fn new(config: CpuConfig) -> Self {
        let mut cs = SegmentRegister::real_mode(0xf000);
        cs.cache.base = 0xffff_0000;

        let mut ldtr = SegmentRegister::default();
        ldtr.cache = Descriptor {
            valid: true,
            present: true,
            kind: SystemType::Ldt as u8,
            limit_scaled: 0xffff,
            ..Descriptor::default()
        };
        let mut tr = SegmentRegister::default();
        tr.cache = Descriptor {
            valid: true,
            present: true,
            kind: SystemType::BusyTss386 as u8,
            limit_scaled: 0xffff,
            ..Descriptor::default()
        };

        let data = SegmentRegister::real_mode(0);
        Self {
            regs: State::new(0xfff0, 0),
            flags: FlagState::new(),
            sregs: [data, cs, data, data, data, data],
            gdtr: DescriptorTable { base: 0, limit: 0xffff },
            idtr: DescriptorTable { base: 0, limit: 0xffff },
            ldtr,
            tr,
            control: ControlRegisters::new(0x6000_0010),
            config,
            mode: ExecutionMode::Real,
            alignment_check: false,
            invalidations: Invalidations::empty(),
        }
    }

    pub fn config(&self) -> &CpuConfig {
        &self.config
    }

    pub fn regs(&self) -> &State {
        &self.regs
    }

    pub fn regs_mut(&mut self) -> &mut State {
        &mut self.regs
    }

    pub fn flags(&self) -> &FlagState {
        &self.flags
    }

    /// Mutable access to the flags.
    ///
    /// Changing `VM` or `AC` through this does not update the execution mode;
    /// use `write_eflags` for that.
    pub fn flags_mut(&mut self) -> &mut FlagState {
        &mut self.flags
    }

    pub fn control(&self) -> &ControlRegisters {
        &self.control
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// The current privilege level.
    ///
    /// This is the RPL of `CS`, which is 0 in real mode and 3 in
    /// virtual-8086 mode.
    pub fn cpl(&self) -> u8 {
        self.sregs[Segment::Cs as usize].selector.rpl
    }

    pub fn segment(&self, seg: Segment) -> &SegmentRegister {
        &self.sregs[seg as usize]
    }

    /// Installs a segment register without any checks.
    ///
    /// This is meant for restoring saved state. Instructions load segments
    /// through the checked paths.
    pub fn set_segment(&mut self, seg: Segment, reg: SegmentRegister) {
        self.sregs[seg as usize] = reg;
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

    pub fn gdtr(&self) -> DescriptorTable {
        self.gdtr
    }

    pub fn set_gdtr(&mut self, table: DescriptorTable) {
        self.gdtr = table;
    }

    pub fn idtr(&self) -> DescriptorTable {
        self.idtr
    }

    pub fn set_idtr(&mut self, table: DescriptorTable) {
        self.idtr = table;
    }

    pub fn ldtr(&self) -> &SegmentRegister {
        &self.ldtr
    }

    pub fn set_ldtr(&mut self, reg: SegmentRegister) {
        self.ldtr = reg;
    }

    pub fn tr(&self) -> &SegmentRegister {
        &self.tr
    }

    pub fn set_tr(&mut self, reg: SegmentRegister) {
        self.tr = reg;
    }

    /// Records that an external cache must be flushed.
    pub fn invalidate(&mut self, what: Invalidations) {
        self.invalidations |= what;
    }

    /// Returns and clears the pending invalidations.
    pub fn take_invalidations(&mut self) -> Invalidations {
        let pending = self.invalidations;
        self.invalidations = Invalidations::empty();
        pending
    }

    /// Whether user-mode alignment checking is in effect.
    pub fn alignment_check_enabled(&self) -> bool {
        self.alignment_check
    }

    /// Re-derives the execution mode from `CR0`, `EFLAGS`, `EFER` and `CS`.
    pub fn update_mode(&mut self) {
        let mode = ExecutionMode::derive(
            self.control.protection_enabled(),
            self.flags.vm(),
            self.control.long_mode_active(),
            self.segment(Segment::Cs).cache.long,
        );
        if mode != self.mode {
            debug!("{} -> {}", self.mode, mode);
            self.mode = mode;
            self.invalidate(Invalidations::PREFETCH);
        }
    }

    pub(crate) fn update_alignment_check(&mut self) {
        self.alignment_check = self.control.cr0().contains(Cr0::AM)
            && self.flags.ac()
            && self.cpl() == 3;
    }

    /// Returns the full `EFLAGS` register.
    pub fn eflags(&self) -> u32 {
        self.flags.bits()
    }

    /// Replaces the `EFLAGS` bits selected by `change_mask` with `value`.
    ///
    /// Unsupported bits never change, and `VM` cannot be set while long mode
    /// is active. Changes to `VM` and `AC` take effect immediately.
    pub fn write_eflags(&mut self, value: u32, change_mask: u32) {
        let mut mask = change_mask;
        if self.control.long_mode_active() {
            mask &= !FlagSet::VM.bits();
        }
        let old_vm = self.flags.vm();
        self.flags.replace(value, mask);
        if self.flags.vm() != old_vm {
            self.invalidate(Invalidations::STACK_CACHE);
        }
        self.update_mode();
        self.update_alignment_check();
    }

    /// Writes the low 16 bits of `EFLAGS`, as 16-bit `popf` and `iret` do.
    ///
    /// `NT` and the arithmetic, trap and direction flags are always written;
    /// `IOPL` and `IF` only if requested.
    pub fn write_flags16(&mut self, value: u16, change_iopl: bool, change_if: bool) {
        let mut mask = 0x0dd5 | FlagSet::NT.bits();
        if change_iopl {
            mask |= FlagSet::IOPL.bits();
        }
        if change_if {
            mask |= FlagSet::IF.bits();
        }
        self.write_eflags(value.into(), mask);
    }

    /// Checks an access of `len` bytes at `offset` through the segment
    /// register `reg` (which is loaded into, or about to be loaded into,
    /// `seg`) and returns the linear address.
    pub(crate) fn check_access(
        &self,
        seg: Segment,
        reg: &SegmentRegister,
        offset: u64,
        len: u64,
        access: Access,
        long64: bool,
    ) -> Result<u64, Fault> {
        let fault = || {
            error!("{} access of {} bytes at {}:{:#x} violates segment checks", match access {
                Access::Read => "read",
                Access::Write => "write",
            }, len, seg, offset);
            if seg == Segment::Ss {
                Fault::StackSegment(0)
            } else {
                Fault::GeneralProtection(0)
            }
        };

        if long64 {
            let base = match seg {
                Segment::Fs | Segment::Gs => reg.cache.base,
                _ => 0,
            };
            let addr = base.wrapping_add(offset);
            if !is_canonical(addr) || !is_canonical(addr.wrapping_add(len - 1)) {
                return Err(fault());
            }
            return Ok(addr);
        }

        let cache = &reg.cache;
        if !cache.valid || !cache.segment {
            return Err(fault());
        }
        match access {
            Access::Write if !cache.is_writable_data() => return Err(fault()),
            Access::Read if cache.is_code() && !cache.is_readable_code() => return Err(fault()),
            _ => {}
        }

        let limit = u64::from(cache.limit_scaled);
        let last = offset + (len - 1);
        if cache.is_expand_down_data() {
            let upper = if cache.d_b { 0xffff_ffff } else { 0xffff };
            if offset <= limit || last > upper {
                return Err(fault());
            }
        } else if last > limit {
            return Err(fault());
        }

        Ok(cache.base.wrapping_add(offset) & 0xffff_ffff)
    }

    fn check_current(&self, seg: Segment, offset: u64, len: u64, access: Access) -> Result<u64, Fault> {
        self.check_access(seg, self.segment(seg), offset, len, access, self.mode.is_long64())
    }

    /// Computes the linear address of `seg:offset`, without any checks.
    pub fn linear_address(&self, seg: Segment, offset: u64) -> u64 {
        let base = self.segment(seg).cache.base;
        match seg {
            Segment::Fs | Segment::Gs if self.mode.is_long64() => base.wrapping_add(offset),
            _ if self.mode.is_long64() => offset,
            _ => base.wrapping_add(offset) & 0xffff_ffff,
        }
    }

    /// Reads a value through segment `seg`.
    pub fn read<M: Memory>(&self, mem: &M, seg: Segment, offset: u64, size: OpSize) -> Result<u64, Fault> {
        let addr = self.check_current(seg, offset, size.bytes(), Access::Read)?;
        Ok(mem.load_sized(addr, size)?)
    }

    /// Writes a value through segment `seg`.
    pub fn write<M: Memory>(&self, mem: &mut M, seg: Segment, offset: u64, size: OpSize, value: u64) -> Result<(), Fault> {
        let addr = self.check_current(seg, offset, size.bytes(), Access::Write)?;
        Ok(mem.store_sized(addr, size, value)?)
    }

    /// Reads the operand of a read-modify-write instruction.
    ///
    /// Checks write access up front, so that the following `write_rmw` to
    /// the same location cannot fault.
    pub fn read_rmw<M: Memory>(&self, mem: &M, seg: Segment, offset: u64, size: OpSize) -> Result<u64, Fault> {
        let addr = self.check_current(seg, offset, size.bytes(), Access::Write)?;
        mem.check_writable(addr, size.bytes())?;
        Ok(mem.load_sized(addr, size)?)
    }

    /// Writes back the result of a read-modify-write instruction.
    pub fn write_rmw<M: Memory>(&self, mem: &mut M, seg: Segment, offset: u64, size: OpSize, value: u64) -> Result<(), Fault> {
        self.write(mem, seg, offset, size, value)
    }

    /// Width of the stack pointer: 64 bits in 64-bit mode, otherwise
    /// selected by `SS.B`.
    pub fn stack_size(&self) -> OpSize {
        if self.mode.is_long64() {
            OpSize::Bits64
        } else if self.segment(Segment::Ss).cache.d_b {
            OpSize::Bits32
        } else {
            OpSize::Bits16
        }
    }

    /// The current stack pointer, truncated to the stack width.
    pub fn stack_pointer(&self) -> u64 {
        self.regs.read_sized(Gpr::Rsp, self.stack_size())
    }

    /// Writes the stack pointer, only touching the bits of the stack width.
    pub fn set_stack_pointer(&mut self, value: u64) {
        let size = self.stack_size();
        self.regs.write_sized(Gpr::Rsp, size, value);
    }

    /// Adds `delta` to a stack offset, wrapping at the stack width.
    pub(crate) fn stack_offset(&self, sp: u64, delta: i64) -> u64 {
        sp.wrapping_add(delta as u64) & self.stack_size().mask()
    }

    pub(crate) fn read_stack<M: Memory>(&self, mem: &M, sp: u64, size: OpSize) -> Result<u64, Fault> {
        self.read(mem, Segment::Ss, sp & self.stack_size().mask(), size)
    }

    pub(crate) fn write_stack<M: Memory>(&self, mem: &mut M, sp: u64, size: OpSize, value: u64) -> Result<(), Fault> {
        self.write(mem, Segment::Ss, sp & self.stack_size().mask(), size, value)
    }

    /// Writes to a stack that is not loaded into `SS` yet, as done when a call
    /// gate switches to an inner stack.
    ///
    /// Violations raise `#SS(error_code)`.
    pub(crate) fn write_new_stack<M: Memory>(
        &self,
        mem: &mut M,
        stack: &SegmentRegister,
        long64: bool,
        sp: u64,
        size: OpSize,
        value: u64,
        error_code: u16,
    ) -> Result<(), Fault> {
        let addr = self
            .check_access(Segment::Ss, stack, sp, size.bytes(), Access::Write, long64)
            .map_err(|fault| match fault {
                Fault::StackSegment(_) => Fault::StackSegment(error_code),
                other => other,
            })?;
        Ok(mem.store_sized(addr, size, value)?)
    }

    /// Pushes `value` using `size` as operand size.
    pub fn push<M: Memory>(&mut self, mem: &mut M, size: OpSize, value: u64) -> Result<(), Fault> {
        let sp = self.stack_offset(self.stack_pointer(), -(size.bytes() as i64));
        self.write_stack(mem, sp, size, value)?;
        self.set_stack_pointer(sp);
        Ok(())
    }

    /// Pops a value of `size` off the stack.
    pub fn pop<M: Memory>(&mut self, mem: &M, size: OpSize) -> Result<u64, Fault> {
        let sp = self.stack_pointer();
        let value = self.read_stack(mem, sp, size)?;
        let new_sp = self.stack_offset(sp, size.bytes() as i64);
        self.set_stack_pointer(new_sp);
        Ok(value)
    }
}
