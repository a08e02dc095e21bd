//! Far transfers in long mode: 64-bit call gates, `iretq` and returns to
//! compatibility mode.

extern crate env_logger;
extern crate x86core;

mod common;

use common::*;
use x86core::cpu::exception::Fault;
use x86core::cpu::instr::OpSize;
use x86core::cpu::segment::Segment;
use x86core::cpu::ExecutionMode;
use x86core::memory::Memory;

#[test]
fn call_gate64_to_ring0_and_iretq_back() {
    let (mut ctx, mut mem) = long_mode(3);
    assert_eq!(ctx.mode(), ExecutionMode::Long64);
    assert_eq!(ctx.cpl(), 3);

    ctx.call_far(&mut mem, GATE64, 0, OpSize::Bits64).unwrap();
    assert_eq!(ctx.mode(), ExecutionMode::Long64);
    assert_eq!(ctx.cpl(), 0);
    assert_eq!(ctx.segment(Segment::Cs).selector.value, KERNEL_CODE64);
    assert_eq!(ctx.regs().rip(), GATE_ENTRY64);
    assert_eq!(ctx.regs().rsp(), RSP0 - 32);
    // SS becomes a null selector with RPL 0
    assert_eq!(ctx.segment(Segment::Ss).selector.value, 0);
    assert!(!ctx.segment(Segment::Ss).cache.valid);

    assert_eq!(mem.load_u64(RSP0 - 8).unwrap(), u64::from(USER_DATA));
    assert_eq!(mem.load_u64(RSP0 - 16).unwrap(), 0x8000);
    assert_eq!(mem.load_u64(RSP0 - 24).unwrap(), u64::from(USER_CODE64));
    assert_eq!(mem.load_u64(RSP0 - 32).unwrap(), 0x1_0000);

    // the handler builds an interrupt frame on the null-SS stack
    ctx.regs_mut().set_rsp(RSP0);
    for &value in &[u64::from(USER_DATA), 0x7ff0, 0x0202, u64::from(USER_CODE64), 0x1_0007] {
        ctx.push(&mut mem, OpSize::Bits64, value).unwrap();
    }
    ctx.iret(&mut mem, OpSize::Bits64).unwrap();

    assert_eq!(ctx.mode(), ExecutionMode::Long64);
    assert_eq!(ctx.cpl(), 3);
    assert_eq!(ctx.segment(Segment::Cs).selector.value, USER_CODE64);
    assert_eq!(ctx.segment(Segment::Ss).selector.value, USER_DATA);
    assert_eq!(ctx.regs().rip(), 0x1_0007);
    assert_eq!(ctx.regs().rsp(), 0x7ff0);
    assert!(ctx.flags().interrupts_enabled());
    assert_eq!(ctx.segment(Segment::Ds).selector.value, USER_DATA);
}

#[test]
fn iretq_at_same_level_pops_stack() {
    let (mut ctx, mut mem) = long_mode(0);
    for &value in &[0, 0x6000, 0x0002, u64::from(KERNEL_CODE64), 0x4000] {
        ctx.push(&mut mem, OpSize::Bits64, value).unwrap();
    }
    ctx.iret(&mut mem, OpSize::Bits64).unwrap();
    assert_eq!(ctx.cpl(), 0);
    assert_eq!(ctx.regs().rip(), 0x4000);
    assert_eq!(ctx.regs().rsp(), 0x6000);
    assert_eq!(ctx.segment(Segment::Ss).selector.value, 0);
}

#[test]
fn far_return_to_compatibility_mode() {
    let (mut ctx, mut mem) = long_mode(0);
    for &value in &[u32::from(USER_DATA), 0x6000, u32::from(USER_CODE), 0x1234] {
        ctx.push(&mut mem, OpSize::Bits32, u64::from(value)).unwrap();
    }
    ctx.ret_far(&mut mem, 0, OpSize::Bits32).unwrap();

    assert_eq!(ctx.mode(), ExecutionMode::Compatibility);
    assert_eq!(ctx.cpl(), 3);
    assert_eq!(ctx.segment(Segment::Cs).selector.value, USER_CODE);
    assert_eq!(ctx.segment(Segment::Ss).selector.value, USER_DATA);
    assert_eq!(ctx.regs().eip(), 0x1234);
    assert_eq!(ctx.regs().esp(), 0x6000);
    assert_eq!(ctx.stack_size(), OpSize::Bits32);
    // kernel data does not survive the return to ring 3
    assert_eq!(ctx.segment(Segment::Ds).selector.value, 0);
}

#[test]
fn null_stack_on_return_to_64_bit_code() {
    let (mut ctx, mut mem) = long_mode(0);
    for &value in &[0x0001, 0x7000, u64::from(RING1_CODE64), 0x4000] {
        ctx.push(&mut mem, OpSize::Bits64, value).unwrap();
    }
    ctx.ret_far(&mut mem, 0, OpSize::Bits64).unwrap();
    assert_eq!(ctx.mode(), ExecutionMode::Long64);
    assert_eq!(ctx.cpl(), 1);
    assert_eq!(ctx.segment(Segment::Ss).selector.value, 0x0001);
    assert!(!ctx.segment(Segment::Ss).cache.valid);
    assert_eq!(ctx.regs().rsp(), 0x7000);

    // ring 3 always needs a real stack segment
    let (mut ctx, mut mem) = long_mode(0);
    for &value in &[0x0003, 0x7000, u64::from(USER_CODE64), 0x4000] {
        ctx.push(&mut mem, OpSize::Bits64, value).unwrap();
    }
    let before = snapshot(&ctx);
    assert_eq!(ctx.ret_far(&mut mem, 0, OpSize::Bits64), Err(Fault::GeneralProtection(0)));
    assert_eq!(snapshot(&ctx), before);
}

#[test]
fn non_canonical_targets() {
    let (mut ctx, mut mem) = long_mode(3);
    let before = snapshot(&ctx);
    assert_eq!(ctx.call_far(&mut mem, BAD_GATE64, 0, OpSize::Bits64), Err(Fault::GeneralProtection(0)));
    assert_eq!(snapshot(&ctx), before);
    assert_eq!(mem.load_u64(RSP0 - 8).unwrap(), 0);

    let (mut ctx, mut mem) = long_mode(0);
    let before = snapshot(&ctx);
    assert_eq!(ctx.jump_far(&mut mem, BAD_GATE64, 0, OpSize::Bits64), Err(Fault::GeneralProtection(0)));
    assert_eq!(snapshot(&ctx), before);

    ctx.push(&mut mem, OpSize::Bits64, u64::from(KERNEL_CODE64)).unwrap();
    ctx.push(&mut mem, OpSize::Bits64, 0x0000_8000_0000_0000).unwrap();
    let before = snapshot(&ctx);
    assert_eq!(ctx.ret_far(&mut mem, 0, OpSize::Bits64), Err(Fault::GeneralProtection(0)));
    assert_eq!(snapshot(&ctx), before);
}
