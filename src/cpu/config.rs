//! CPU model configuration.
//!
//! The feature set decides which control register bits can be written and
//! how reserved bits behave. It is fixed when a `CpuContext` is created.

use cpu::control::{Cr4, Efer};

/// The processor generation being emulated.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, FromPrimitive, ToPrimitive)]
pub enum CpuLevel {
    I386 = 3,
    I486 = 4,
    Pentium = 5,
    /// P6 and everything after it.
    P6 = 6,
}

bitflags! {
    /// Optional CPU features that influence the execution core.
    pub struct Features: u32 {
        /// Virtual-8086 mode extensions and protected-mode virtual interrupts.
        const VME = 1 << 0;
        /// Debugging extensions (`CR4.DE`).
        const DE = 1 << 1;
        /// 4 MB pages.
        const PSE = 1 << 2;
        /// Physical address extension.
        const PAE = 1 << 3;
        /// Global pages.
        const PGE = 1 << 4;
        /// `rdtsc` restriction (`CR4.TSD`).
        const TSC = 1 << 5;
        /// `rdpmc` in user mode (`CR4.PCE`).
        const PCE = 1 << 6;
        /// `fxsave` and SSE exceptions.
        const SSE = 1 << 7;
        /// VMX (only the `CR4.VMXE` bit).
        const VMX = 1 << 8;
        /// SMX (only the `CR4.SMXE` bit).
        const SMX = 1 << 9;
        /// Process-context identifiers.
        const PCID = 1 << 10;
        const FSGSBASE = 1 << 11;
        const XSAVE = 1 << 12;
        /// Supervisor-mode execution prevention.
        const SMEP = 1 << 13;
        /// Supervisor-mode access prevention.
        const SMAP = 1 << 14;
        /// Protection keys.
        const PKU = 1 << 15;
        /// User-mode instruction prevention.
        const UMIP = 1 << 16;
        /// Control-flow enforcement.
        const CET = 1 << 17;
        /// Long mode (x86-64).
        const LONG_MODE = 1 << 18;
        /// No-execute page protection (`EFER.NXE`).
        const NX = 1 << 19;
        /// `syscall`/`sysret` (`EFER.SCE`).
        const SYSCALL = 1 << 20;
    }
}

/// Configuration of the emulated CPU model.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CpuConfig {
    level: CpuLevel,
    features: Features,
}

impl CpuConfig {
    pub fn new(level: CpuLevel, features: Features) -> Self {
        Self { level, features }
    }

    pub fn level(&self) -> CpuLevel {
        self.level
    }

    pub fn features(&self) -> Features {
        self.features
    }

    pub fn has(&self, feature: Features) -> bool {
        self.features.contains(feature)
    }

    /// Changes the CPU level.
    pub fn with_level(mut self, level: CpuLevel) -> Self {
        self.level = level;
        self
    }

    /// Enables additional features.
    pub fn with_features(mut self, features: Features) -> Self {
        self.features |= features;
        self
    }

    /// Disables features.
    pub fn without_features(mut self, features: Features) -> Self {
        self.features -= features;
        self
    }

    /// Applies the reserved-bit policy of this CPU level to a value written
    /// to `CR0`.
    ///
    /// The 386 ignores writes to everything but the low 4 bits and reads
    /// the rest as ones; later CPUs hard-wire `ET` to one.
    pub fn fixup_cr0(&self, value: u32) -> u32 {
        match self.level {
            CpuLevel::I386 => value | 0x7fff_fff0,
            CpuLevel::Pentium => value | 0x10,
            CpuLevel::I486 | CpuLevel::P6 => (value | 0x10) & 0xe005_003f,
        }
    }

    /// The `CR4` bits that may be set.
    pub fn cr4_allow_mask(&self) -> Cr4 {
        let mut mask = Cr4::MCE;
        let pairs = [
            (Features::VME, Cr4::VME | Cr4::PVI),
            (Features::TSC, Cr4::TSD),
            (Features::DE, Cr4::DE),
            (Features::PSE, Cr4::PSE),
            (Features::PAE, Cr4::PAE),
            (Features::PGE, Cr4::PGE),
            (Features::PCE, Cr4::PCE),
            (Features::SSE, Cr4::OSFXSR | Cr4::OSXMMEXCPT),
            (Features::VMX, Cr4::VMXE),
            (Features::SMX, Cr4::SMXE),
            (Features::PCID, Cr4::PCIDE),
            (Features::FSGSBASE, Cr4::FSGSBASE),
            (Features::XSAVE, Cr4::OSXSAVE),
            (Features::SMEP, Cr4::SMEP),
            (Features::SMAP, Cr4::SMAP),
            (Features::PKU, Cr4::PKE),
            (Features::UMIP, Cr4::UMIP),
            (Features::CET, Cr4::CET),
        ];
        for &(feature, bits) in pairs.iter() {
            if self.has(feature) {
                mask |= bits;
            }
        }
        mask
    }

    /// The `EFER` bits that may be written.
    pub fn efer_supported_mask(&self) -> Efer {
        let mut mask = Efer::empty();
        if self.has(Features::SYSCALL) {
            mask |= Efer::SCE;
        }
        if self.has(Features::LONG_MODE) {
            mask |= Efer::LME | Efer::LMA;
        }
        if self.has(Features::NX) {
            mask |= Efer::NXE;
        }
        mask
    }
}

/// A P6-class CPU with long mode and the common protection features.
impl Default for CpuConfig {
    fn default() -> Self {
        Self::new(
            CpuLevel::P6,
            Features::VME | Features::DE | Features::PSE | Features::PAE | Features::PGE
                | Features::TSC | Features::PCE | Features::SSE | Features::PCID
                | Features::FSGSBASE | Features::XSAVE | Features::SMEP | Features::SMAP
                | Features::UMIP | Features::LONG_MODE | Features::NX | Features::SYSCALL,
        )
    }
}
