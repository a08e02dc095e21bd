//! The x86 execution core.

mod exec;
mod protect;
mod state;
mod transfer;
pub mod config;
pub mod context;
pub mod control;
pub mod exception;
pub mod flags;
pub mod imm;
pub mod instr;
pub mod interpret;
pub mod mode;
pub mod segment;

pub use self::config::{CpuConfig, CpuLevel, Features};
pub use self::context::{CpuContext, Invalidations};
pub use self::exception::{ExceptionVector, Fault};
pub use self::exec::{double_shift_value, shift_value};
pub use self::flags::{FlagSet, FlagState};
pub use self::mode::ExecutionMode;
pub use self::state::State;

use self::instr::Instr;
use memory::Memory;

/// Trait for CPU implementations / executors.
pub trait ExecutionEngine {
    type Memory: Memory;

    /// Get a reference to the CPU's state.
    fn context(&mut self) -> &mut CpuContext;

    /// Get a reference to the memory.
    fn memory(&mut self) -> &mut Self::Memory;

    /// Executes one decoded instruction.
    ///
    /// On error, the instruction had no architectural effect and the fault
    /// should be delivered to the guest.
    fn execute(&mut self, instr: &Instr) -> Result<(), Fault>;

    /// Executes a sequence of instructions, stopping at the first fault.
    ///
    /// This is equivalent to calling `execute` in a loop.
    fn run<'a, I>(&mut self, instrs: I) -> Result<(), Fault>
    where
        I: IntoIterator<Item = &'a Instr>,
    {
        for instr in instrs {
            self.execute(instr)?;
        }
        Ok(())
    }
}
