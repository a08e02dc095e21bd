//! Architectural faults raised by the execution core.

use memory::MemoryError;

use std::error::Error;
use std::fmt;

/// An exception raised while executing an instruction.
///
/// Faults abort the current instruction. Any operation returning a `Fault`
/// has left the architectural register state as it was before the
/// instruction started, so the caller can deliver the exception through the
/// IDT and later restart the instruction.
///
/// Error codes carrying a selector are already stripped of its RPL bits.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Division by zero, or quotient overflow (`#DE`).
    DivideError,
    /// Invalid or disallowed instruction (`#UD`).
    InvalidOpcode,
    /// Invalid task state segment or inner stack (`#TS`).
    InvalidTss(u16),
    /// Segment not present (`#NP`).
    NotPresent(u16),
    /// Stack segment fault (`#SS`).
    StackSegment(u16),
    /// General protection fault (`#GP`).
    GeneralProtection(u16),
    /// The memory subsystem failed to translate or access an address (`#PF`).
    Memory(MemoryError),
    /// A hardware task switch through the given TSS or task gate selector was
    /// requested.
    ///
    /// Task switching is not implemented by the core; the embedder may
    /// perform it or treat it as fatal.
    TaskSwitch(u16),
}

/// Exception vector numbers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum ExceptionVector {
    DivideError = 0,
    Debug = 1,
    Breakpoint = 3,
    Overflow = 4,
    BoundRange = 5,
    InvalidOpcode = 6,
    DeviceNotAvailable = 7,
    DoubleFault = 8,
    InvalidTss = 10,
    NotPresent = 11,
    StackSegment = 12,
    GeneralProtection = 13,
    PageFault = 14,
    AlignmentCheck = 17,
}

impl Fault {
    /// Builds a selector-carrying fault for `vector`.
    ///
    /// Vectors without an error code map to their fault, ignoring `code`.
    pub fn with_code(vector: ExceptionVector, code: u16) -> Self {
        match vector {
            ExceptionVector::InvalidTss => Fault::InvalidTss(code),
            ExceptionVector::NotPresent => Fault::NotPresent(code),
            ExceptionVector::StackSegment => Fault::StackSegment(code),
            ExceptionVector::DivideError => Fault::DivideError,
            ExceptionVector::InvalidOpcode => Fault::InvalidOpcode,
            _ => Fault::GeneralProtection(code),
        }
    }

    /// The vector this fault is delivered through.
    ///
    /// A requested task switch has no vector of its own and returns `None`.
    pub fn vector(&self) -> Option<ExceptionVector> {
        Some(match self {
            Fault::DivideError => ExceptionVector::DivideError,
            Fault::InvalidOpcode => ExceptionVector::InvalidOpcode,
            Fault::InvalidTss(_) => ExceptionVector::InvalidTss,
            Fault::NotPresent(_) => ExceptionVector::NotPresent,
            Fault::StackSegment(_) => ExceptionVector::StackSegment,
            Fault::GeneralProtection(_) => ExceptionVector::GeneralProtection,
            Fault::Memory(_) => ExceptionVector::PageFault,
            Fault::TaskSwitch(_) => return None,
        })
    }

    /// The error code pushed when delivering this fault, if any.
    pub fn error_code(&self) -> Option<u16> {
        match *self {
            Fault::InvalidTss(code)
            | Fault::NotPresent(code)
            | Fault::StackSegment(code)
            | Fault::GeneralProtection(code) => Some(code),
            Fault::DivideError | Fault::InvalidOpcode | Fault::Memory(_) | Fault::TaskSwitch(_) => None,
        }
    }
}

impl From<MemoryError> for Fault {
    fn from(e: MemoryError) -> Self {
        Fault::Memory(e)
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Fault::DivideError => write!(f, "#DE: divide error"),
            Fault::InvalidOpcode => write!(f, "#UD: invalid opcode"),
            Fault::InvalidTss(code) => write!(f, "#TS({:#x}): invalid TSS", code),
            Fault::NotPresent(code) => write!(f, "#NP({:#x}): segment not present", code),
            Fault::StackSegment(code) => write!(f, "#SS({:#x}): stack segment fault", code),
            Fault::GeneralProtection(code) => write!(f, "#GP({:#x}): general protection fault", code),
            Fault::Memory(e) => write!(f, "#PF: {}", e),
            Fault::TaskSwitch(sel) => write!(f, "task switch to {:#06x} requested", sel),
        }
    }
}

impl Error for Fault {}
