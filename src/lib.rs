//! Instruction execution core of an x86 system emulator.
//!
//! This crate implements the part of an x86 CPU that sits between the
//! instruction decoder and the memory subsystem: the lazily evaluated
//! condition flags, the segment descriptor and privilege model, the control
//! transfer state machine (near/far calls, jumps and returns, `IRET`, and
//! entering/leaving virtual-8086 mode), and the integer opcode execution
//! units.
//!
//! Instruction fetch and decode, paging and device emulation are not part of
//! this crate. The core consumes already decoded [`Instr`]uctions and talks to
//! memory through the [`Memory`] trait.
//!
//! [`Instr`]: cpu/instr/enum.Instr.html
//! [`Memory`]: memory/trait.Memory.html

#![doc(html_root_url = "https://docs.rs/x86core/0.1.0")]
#![warn(missing_debug_implementations)]
//#![warn(missing_docs)]

#[macro_use] extern crate bitflags;
#[macro_use] extern crate bitpat;
#[macro_use] extern crate log;
#[macro_use] extern crate num_derive;
extern crate num_traits;

pub mod cpu;
pub mod memory;
