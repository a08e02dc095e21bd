//! Interface to the emulated machine's memory.
//!
//! The CPU core does not own any memory. Paging, the TLB and physical memory
//! (including MMIO) are handled by whoever implements `Memory`, which only
//! ever sees *linear* addresses: segmentation (base, limit and access rights)
//! is applied by `CpuContext` before a request gets here.
//!
//! Multi-byte accesses are little-endian and, by default, decomposed into
//! byte accesses. Implementations backed by host memory should override the
//! sized methods.

use cpu::instr::OpSize;

use std::fmt;
use std::error::Error;
use std::ops::Range;

/// Linear-address memory as seen by the CPU core.
pub trait Memory {
    /// Loads a single byte from linear address `addr`.
    fn load(&self, addr: u64) -> Result<u8, MemoryError>;

    /// Stores a single byte to linear address `addr`.
    fn store(&mut self, addr: u64, value: u8) -> Result<(), MemoryError>;

    /// Checks that `len` bytes starting at `addr` could be written without
    /// writing anything.
    ///
    /// Read-modify-write instructions call this before loading their operand
    /// so that a fault is raised before any architectural state changes, as
    /// if the read and the write were a single bus transaction.
    fn check_writable(&self, addr: u64, len: u64) -> Result<(), MemoryError> {
        let _ = (addr, len);
        Ok(())
    }

    /// Loads an 8, 16, 32 or 64-bit little-endian value.
    fn load_sized(&self, addr: u64, size: OpSize) -> Result<u64, MemoryError> {
        let mut value = 0;
        for i in (0..size.bytes()).rev() {
            value = value << 8 | u64::from(self.load(addr.wrapping_add(i))?);
        }
        Ok(value)
    }

    /// Stores the low `size` bits of `value`, little-endian.
    ///
    /// Either all bytes are written or none are.
    fn store_sized(&mut self, addr: u64, size: OpSize, value: u64) -> Result<(), MemoryError> {
        self.check_writable(addr, size.bytes())?;
        for i in 0..size.bytes() {
            self.store(addr.wrapping_add(i), (value >> (i * 8)) as u8)?;
        }
        Ok(())
    }

    fn load_u16(&self, addr: u64) -> Result<u16, MemoryError> {
        self.load_sized(addr, OpSize::Bits16).map(|v| v as u16)
    }

    fn load_u32(&self, addr: u64) -> Result<u32, MemoryError> {
        self.load_sized(addr, OpSize::Bits32).map(|v| v as u32)
    }

    fn load_u64(&self, addr: u64) -> Result<u64, MemoryError> {
        self.load_sized(addr, OpSize::Bits64)
    }

    fn store_u16(&mut self, addr: u64, value: u16) -> Result<(), MemoryError> {
        self.store_sized(addr, OpSize::Bits16, value.into())
    }

    fn store_u32(&mut self, addr: u64, value: u32) -> Result<(), MemoryError> {
        self.store_sized(addr, OpSize::Bits32, value.into())
    }

    fn store_u64(&mut self, addr: u64, value: u64) -> Result<(), MemoryError> {
        self.store_sized(addr, OpSize::Bits64, value)
    }
}

/// A flat memory implementation that stores everything in a `Vec`, starting
/// at linear address 0.
///
/// Ranges can be marked read-only to exercise write faults. This is mostly
/// useful for tests and benchmarks.
#[derive(Debug, Clone)]
pub struct ArrayMemory {
    mem: Vec<u8>,
    read_only: Vec<Range<u64>>,
}

impl ArrayMemory {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            mem: data,
            read_only: Vec::new(),
        }
    }

    /// Creates a zero-filled memory of `size` bytes.
    pub fn zeroed(size: usize) -> Self {
        Self::new(vec![0; size])
    }

    /// Marks `range` as read-only. Stores into it will fail with
    /// `MemoryError::NotWriteable`.
    pub fn protect(&mut self, range: Range<u64>) {
        self.read_only.push(range);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.mem
    }

    pub fn as_vec_mut(&mut self) -> &mut Vec<u8> {
        &mut self.mem
    }

    fn is_read_only(&self, addr: u64) -> bool {
        self.read_only.iter().any(|range| range.start <= addr && addr < range.end)
    }
}

impl Memory for ArrayMemory {
    fn load(&self, addr: u64) -> Result<u8, MemoryError> {
        self.mem.get(addr as usize).cloned().ok_or(MemoryError::Fault { addr })
    }

    fn store(&mut self, addr: u64, value: u8) -> Result<(), MemoryError> {
        self.check_writable(addr, 1)?;
        match self.mem.get_mut(addr as usize) {
            Some(byte) => {
                *byte = value;
                Ok(())
            }
            None => Err(MemoryError::Fault { addr }),
        }
    }

    fn check_writable(&self, addr: u64, len: u64) -> Result<(), MemoryError> {
        for i in 0..len {
            let addr = addr.wrapping_add(i);
            if addr >= self.mem.len() as u64 {
                return Err(MemoryError::Fault { addr });
            }
            if self.is_read_only(addr) {
                return Err(MemoryError::NotWriteable { addr });
            }
        }
        Ok(())
    }
}

/// An error that can occur when reading or writing memory.
///
/// Both correspond to a page fault.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// Accessed address is not mapped at all.
    Fault { addr: u64 },
    /// Accessed address is mapped as read-only and was attempted to be written
    /// to.
    NotWriteable { addr: u64 },
}

impl MemoryError {
    /// The linear address that caused the error.
    pub fn addr(&self) -> u64 {
        match *self {
            MemoryError::Fault { addr } | MemoryError::NotWriteable { addr } => addr,
        }
    }
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MemoryError::Fault { addr } => write!(f, "unmapped memory at {:#x}", addr),
            MemoryError::NotWriteable { addr } => write!(f, "write to read-only memory at {:#x}", addr),
        }
    }
}

impl Error for MemoryError {}
