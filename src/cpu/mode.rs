//! Processor operating modes.

use std::fmt;

/// The operating mode of the CPU.
///
/// Derived from `CR0.PE`, `EFLAGS.VM`, `EFER.LMA` and `CS.L`; it is never set
/// directly. Together with the current privilege level it selects the rules
/// every control transfer follows.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Real-address mode (`CR0.PE = 0`).
    Real,
    /// Virtual-8086 mode (`EFLAGS.VM = 1` in protected mode).
    Virtual8086,
    /// Legacy 16/32-bit protected mode.
    Protected,
    /// Long mode running a 16 or 32-bit code segment.
    Compatibility,
    /// Long mode running a 64-bit code segment.
    Long64,
}

impl ExecutionMode {
    /// Derives the mode from the bits that control it.
    pub fn derive(pe: bool, vm: bool, lma: bool, cs_long: bool) -> Self {
        match (pe, vm, lma, cs_long) {
            (false, _, _, _) => ExecutionMode::Real,
            (true, _, true, true) => ExecutionMode::Long64,
            (true, _, true, false) => ExecutionMode::Compatibility,
            (true, true, false, _) => ExecutionMode::Virtual8086,
            (true, false, false, _) => ExecutionMode::Protected,
        }
    }

    /// Whether long mode is active (64-bit or compatibility mode).
    pub fn is_long(&self) -> bool {
        match self {
            ExecutionMode::Compatibility | ExecutionMode::Long64 => true,
            _ => false,
        }
    }

    pub fn is_long64(&self) -> bool {
        *self == ExecutionMode::Long64
    }

    /// Whether segment selectors refer to descriptor tables.
    pub fn is_protected(&self) -> bool {
        match self {
            ExecutionMode::Protected | ExecutionMode::Compatibility | ExecutionMode::Long64 => true,
            ExecutionMode::Real | ExecutionMode::Virtual8086 => false,
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            ExecutionMode::Real => "real mode",
            ExecutionMode::Virtual8086 => "virtual-8086 mode",
            ExecutionMode::Protected => "protected mode",
            ExecutionMode::Compatibility => "compatibility mode",
            ExecutionMode::Long64 => "64-bit mode",
        })
    }
}
