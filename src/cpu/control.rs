//! Control registers (`CR0`, `CR2`, `CR3`, `CR4`) and `EFER`.
//!
//! Writes go through `CpuContext`, since their validity depends on the rest
//! of the CPU state (the current code segment, long mode activation) and a
//! successful write may change the execution mode or require the TLB to be
//! flushed.

use cpu::context::{CpuContext, Invalidations};
use cpu::exception::Fault;
use cpu::segment::Segment;

bitflags! {
    /// `CR0` bits.
    pub struct Cr0: u32 {
        /// Protection enable.
        const PE = 1 << 0;
        /// Monitor coprocessor.
        const MP = 1 << 1;
        /// FPU emulation.
        const EM = 1 << 2;
        /// Task switched.
        const TS = 1 << 3;
        /// Extension type (hard-wired to 1 on 486+).
        const ET = 1 << 4;
        /// Numeric error reporting.
        const NE = 1 << 5;
        /// Supervisor write protect.
        const WP = 1 << 16;
        /// Alignment mask.
        const AM = 1 << 18;
        /// Not write-through.
        const NW = 1 << 29;
        /// Cache disable.
        const CD = 1 << 30;
        /// Paging.
        const PG = 1 << 31;
    }
}

bitflags! {
    /// `CR4` bits.
    pub struct Cr4: u32 {
        const VME = 1 << 0;
        /// Protected-mode virtual interrupts.
        const PVI = 1 << 1;
        /// Time stamp disable.
        const TSD = 1 << 2;
        const DE = 1 << 3;
        const PSE = 1 << 4;
        const PAE = 1 << 5;
        const MCE = 1 << 6;
        const PGE = 1 << 7;
        const PCE = 1 << 8;
        const OSFXSR = 1 << 9;
        const OSXMMEXCPT = 1 << 10;
        const UMIP = 1 << 11;
        const VMXE = 1 << 13;
        const SMXE = 1 << 14;
        const FSGSBASE = 1 << 16;
        const PCIDE = 1 << 17;
        const OSXSAVE = 1 << 18;
        const SMEP = 1 << 20;
        const SMAP = 1 << 21;
        const PKE = 1 << 22;
        const CET = 1 << 23;
    }
}

bitflags! {
    /// Extended feature enable register (MSR `0xC0000080`).
    pub struct Efer: u32 {
        /// `syscall` enable.
        const SCE = 1 << 0;
        /// Long mode enable.
        const LME = 1 << 8;
        /// Long mode active (read-only).
        const LMA = 1 << 10;
        /// No-execute enable.
        const NXE = 1 << 11;
    }
}

/// MSR index of `EFER`.
pub const MSR_EFER: u32 = 0xc000_0080;

/// CR4 bits whose change invalidates all cached translations.
fn cr4_flush_bits() -> Cr4 {
    Cr4::PGE | Cr4::PAE | Cr4::PSE | Cr4::PCIDE | Cr4::SMEP
}

/// The control register file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRegisters {
    /// Raw value: reserved bits may read as 1 depending on the CPU level.
    cr0: u32,
    pub(crate) cr2: u64,
    cr3: u64,
    cr4: Cr4,
    efer: Efer,
}

impl ControlRegisters {
    /// The power-on state: caching disabled, everything else off.
    pub fn new(cr0: u32) -> Self {
        Self {
            cr0,
            cr2: 0,
            cr3: 0,
            cr4: Cr4::empty(),
            efer: Efer::empty(),
        }
    }

    pub fn cr0(&self) -> Cr0 {
        Cr0::from_bits_truncate(self.cr0)
    }

    pub fn cr0_bits(&self) -> u32 {
        self.cr0
    }

    /// The faulting linear address of the last page fault.
    pub fn cr2(&self) -> u64 {
        self.cr2
    }

    pub fn cr3(&self) -> u64 {
        self.cr3
    }

    pub fn cr4(&self) -> Cr4 {
        self.cr4
    }

    pub fn efer(&self) -> Efer {
        self.efer
    }

    pub fn protection_enabled(&self) -> bool {
        self.cr0().contains(Cr0::PE)
    }

    pub fn paging_enabled(&self) -> bool {
        self.cr0().contains(Cr0::PG)
    }

    pub fn long_mode_active(&self) -> bool {
        self.efer.contains(Efer::LMA)
    }
}

fn reject(reason: &str) -> Fault {
    error!("control register write rejected: {}", reason);
    Fault::GeneralProtection(0)
}

impl CpuContext {
    /// Reads control register `n` (0, 2, 3 or 4).
    pub fn read_cr(&self, n: u8) -> Result<u64, Fault> {
        Ok(match n {
            0 => u64::from(self.control.cr0),
            2 => self.control.cr2,
            3 => self.control.cr3,
            4 => u64::from(self.control.cr4.bits()),
            _ => return Err(Fault::InvalidOpcode),
        })
    }

    /// Writes control register `n` (0, 2, 3 or 4).
    pub fn write_cr(&mut self, n: u8, value: u64) -> Result<(), Fault> {
        match n {
            0 => self.write_cr0(value),
            2 => {
                self.control.cr2 = value;
                Ok(())
            }
            3 => self.write_cr3(value),
            4 => self.write_cr4(value),
            _ => Err(Fault::InvalidOpcode),
        }
    }

    /// Writes `CR0`, enforcing paging/long mode consistency.
    pub fn write_cr0(&mut self, value: u64) -> Result<(), Fault> {
        if value >> 32 != 0 {
            return Err(reject("CR0 bits 63:32 set"));
        }

        let raw = value as u32;
        let new = Cr0::from_bits_truncate(raw);
        let old = self.control.cr0();
        if new.contains(Cr0::PG) && !new.contains(Cr0::PE) {
            return Err(reject("CR0.PG without CR0.PE"));
        }
        if new.contains(Cr0::NW) && !new.contains(Cr0::CD) {
            return Err(reject("CR0.NW without CR0.CD"));
        }

        let mut efer = self.control.efer;
        let paging_on = !old.contains(Cr0::PG) && new.contains(Cr0::PG);
        let paging_off = old.contains(Cr0::PG) && !new.contains(Cr0::PG);
        if paging_on && efer.contains(Efer::LME) {
            if !self.control.cr4.contains(Cr4::PAE) {
                return Err(reject("entering long mode without CR4.PAE"));
            }
            if self.segment(Segment::Cs).cache.long {
                return Err(reject("entering long mode with CS.L set"));
            }
            efer.insert(Efer::LMA);
        }
        if paging_off && efer.contains(Efer::LMA) {
            if self.mode().is_long64() {
                return Err(reject("disabling paging in 64-bit mode"));
            }
            if self.control.cr4.contains(Cr4::PCIDE) {
                return Err(reject("disabling paging with CR4.PCIDE set"));
            }
            efer.remove(Efer::LMA);
        }

        let fixed = self.config.fixup_cr0(raw);
        if (self.control.cr0 ^ fixed) & (Cr0::PG | Cr0::WP | Cr0::PE).bits() != 0 {
            self.invalidate(Invalidations::TLB);
        }
        if efer != self.control.efer {
            debug!("EFER.LMA <- {}", efer.contains(Efer::LMA));
        }
        self.control.cr0 = fixed;
        self.control.efer = efer;
        self.update_mode();
        self.update_alignment_check();
        Ok(())
    }

    /// Writes `CR3` and requests a TLB flush.
    pub fn write_cr3(&mut self, value: u64) -> Result<(), Fault> {
        let value = if self.control.long_mode_active() { value } else { value & 0xffff_ffff };
        self.control.cr3 = value;
        if self.control.cr4.contains(Cr4::PGE) {
            self.invalidate(Invalidations::TLB_NON_GLOBAL);
        } else {
            self.invalidate(Invalidations::TLB);
        }
        Ok(())
    }

    /// Writes `CR4`, checking it against the configured feature set.
    pub fn write_cr4(&mut self, value: u64) -> Result<(), Fault> {
        let allowed = self.config.cr4_allow_mask();
        if value & !u64::from(allowed.bits()) != 0 {
            return Err(reject("CR4 write sets unsupported bits"));
        }

        let new = Cr4::from_bits_truncate(value as u32);
        let old = self.control.cr4;
        let lma = self.control.long_mode_active();
        if lma && !new.contains(Cr4::PAE) {
            return Err(reject("clearing CR4.PAE in long mode"));
        }
        if new.contains(Cr4::PCIDE) {
            if !lma {
                return Err(reject("CR4.PCIDE outside of long mode"));
            }
            if !old.contains(Cr4::PCIDE) && self.control.cr3 & 0xfff != 0 {
                return Err(reject("enabling CR4.PCIDE with non-zero CR3[11:0]"));
            }
        }

        if (old ^ new).intersects(cr4_flush_bits()) {
            self.invalidate(Invalidations::TLB);
        }
        self.control.cr4 = new;
        Ok(())
    }

    /// Writes `EFER`. `LMA` is not writable and keeps its value.
    pub fn write_efer(&mut self, value: u64) -> Result<(), Fault> {
        let supported = self.config.efer_supported_mask();
        if value & !u64::from(supported.bits()) != 0 {
            return Err(reject("EFER write sets reserved bits"));
        }

        let new = Efer::from_bits_truncate(value as u32);
        let old = self.control.efer;
        if (old ^ new).contains(Efer::LME) && self.control.paging_enabled() {
            return Err(reject("changing EFER.LME with paging enabled"));
        }

        self.control.efer = (new - Efer::LMA) | (old & Efer::LMA);
        self.update_mode();
        Ok(())
    }
}
