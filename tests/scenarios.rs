//! End-to-end behaviour of the flag engine and the transfer dispatcher.

extern crate env_logger;
extern crate x86core;

mod common;

use common::*;
use x86core::cpu::exception::Fault;
use x86core::cpu::instr::{LoopKind, OpSize};
use x86core::cpu::segment::{Descriptor, Segment, SegmentRegister, Selector};
use x86core::cpu::FlagState;
use x86core::memory::Memory;

#[test]
fn add_wraps_to_zero() {
    let mut flags = FlagState::new();
    assert_eq!(flags.apply_add(OpSize::Bits16, 0xffff, 0x0001), 0);
    assert!(flags.cf());
    assert!(!flags.of());
    assert!(flags.zf());
    assert!(!flags.sf());
}

#[test]
fn sub_borrows() {
    let mut flags = FlagState::new();
    assert_eq!(flags.apply_sub(OpSize::Bits8, 0x00, 0x01), 0xff);
    assert!(flags.cf());
    assert!(!flags.of());
    assert!(flags.sf());
    assert!(!flags.zf());
}

#[test]
fn real_mode_far_call() {
    let (mut ctx, mut mem) = real_mode();
    ctx.regs_mut().set_rip(0x1234);
    ctx.call_far(&mut mem, 0x1000, 0x0050, OpSize::Bits16).unwrap();

    let cs = ctx.segment(Segment::Cs);
    assert_eq!(cs.selector.value, 0x1000);
    assert_eq!(cs.cache.base, 0x10000);
    assert_eq!(ctx.regs().ip(), 0x0050);
    assert_eq!(ctx.regs().sp(), 0x0ffc);
    assert_eq!(mem.load_u16(0x0ffe).unwrap(), 0xf000);
    assert_eq!(mem.load_u16(0x0ffc).unwrap(), 0x1234);

    ctx.ret_far(&mut mem, 0, OpSize::Bits16).unwrap();
    assert_eq!(ctx.segment(Segment::Cs).selector.value, 0xf000);
    assert_eq!(ctx.segment(Segment::Cs).cache.base, 0xf0000);
    assert_eq!(ctx.regs().ip(), 0x1234);
    assert_eq!(ctx.regs().sp(), 0x1000);
}

#[test]
fn real_mode_far_call_32() {
    let (mut ctx, mut mem) = real_mode();
    ctx.regs_mut().set_rip(0x1234);
    ctx.call_far(&mut mem, 0x2000, 0x10, OpSize::Bits32).unwrap();
    assert_eq!(ctx.regs().sp(), 0x0ff8);
    assert_eq!(mem.load_u32(0x0ffc).unwrap(), 0xf000);
    assert_eq!(mem.load_u32(0x0ff8).unwrap(), 0x1234);
    assert_eq!(ctx.segment(Segment::Cs).cache.base, 0x20000);
}

#[test]
fn real_mode_far_call_wraps_sp() {
    let (mut ctx, mut mem) = real_mode();
    ctx.regs_mut().set_sp(0x0002);
    ctx.regs_mut().set_rip(0x1234);
    ctx.call_far(&mut mem, 0x1000, 0x0050, OpSize::Bits16).unwrap();
    assert_eq!(ctx.regs().sp(), 0xfffe);
    assert_eq!(mem.load_u16(0x0000).unwrap(), 0xf000);
    assert_eq!(mem.load_u16(0xfffe).unwrap(), 0x1234);
}

#[test]
fn far_jump_to_more_privileged_code() {
    let (mut ctx, mut mem) = protected(3);
    let before = snapshot(&ctx);

    let result = ctx.jump_far(&mut mem, KERNEL_CODE | 3, 0x1000, OpSize::Bits32);
    assert_eq!(result, Err(Fault::GeneralProtection(KERNEL_CODE)));
    assert_eq!(snapshot(&ctx), before);

    let result = ctx.call_far(&mut mem, KERNEL_CODE | 3, 0x1000, OpSize::Bits32);
    assert_eq!(result, Err(Fault::GeneralProtection(KERNEL_CODE)));
    assert_eq!(snapshot(&ctx), before);
}

#[test]
fn loop_target_beyond_limit() {
    let (mut ctx, _) = real_mode();
    ctx.regs_mut().set_cx(1);
    let ip = ctx.regs().ip();

    let result = ctx.loop_(LoopKind::Loop, 0x20, OpSize::Bits32, OpSize::Bits16);
    assert_eq!(result, Err(Fault::GeneralProtection(0)));
    assert_eq!(ctx.regs().cx(), 1);
    assert_eq!(ctx.regs().ip(), ip);
}

#[test]
fn near_branch_limits() {
    let (mut ctx, _) = real_mode();
    ctx.jump_near(0xffff, OpSize::Bits16).unwrap();
    assert_eq!(ctx.regs().ip(), 0xffff);
    assert_eq!(ctx.jump_near(0x1_0000, OpSize::Bits32), Err(Fault::GeneralProtection(0)));
    assert_eq!(ctx.regs().ip(), 0xffff);

    // byte granular 32-bit segment with a limit of 0xfffff
    let (mut ctx, _) = protected(0);
    let code = Descriptor::parse(0x0000_ffff, 0x004f_9b00);
    ctx.set_segment(Segment::Cs, SegmentRegister::new(Selector::new(KERNEL_CODE), code));
    ctx.jump_near(0xf_ffff, OpSize::Bits32).unwrap();
    assert_eq!(ctx.regs().eip(), 0xf_ffff);
    assert_eq!(ctx.jump_near(0x10_0000, OpSize::Bits32), Err(Fault::GeneralProtection(0)));
    assert_eq!(ctx.regs().eip(), 0xf_ffff);
}

#[test]
fn code_segment_load_round_trip() {
    let (mut ctx, mut mem) = protected(0);
    write_desc(&mut mem, 3, flat(0xfa));
    let raw = read_desc(&mem, 3);
    let desc = Descriptor::parse(raw.0, raw.1);
    assert!(!desc.is_accessed());

    ctx.load_code_segment(&mut mem, Selector::new(0x18), desc, 3).unwrap();
    let cs = *ctx.segment(Segment::Cs);
    assert_eq!(cs.selector.value, USER_CODE);
    assert_eq!(cs.selector.rpl, 3);
    assert_eq!(ctx.cpl(), 3);
    assert!(cs.cache.is_accessed());
    assert_eq!(cs.cache.base, desc.base);
    assert_eq!(cs.cache.limit_scaled, desc.limit_scaled);
    // the accessed bit also lands in the GDT
    assert_eq!(read_desc(&mem, 3).1 & 0x100, 0x100);
}

#[test]
fn flag_queries_are_idempotent() {
    let mut flags = FlagState::new();
    flags.apply_sub(OpSize::Bits32, 5, 7);
    let first = (flags.cf(), flags.pf(), flags.af(), flags.zf(), flags.sf(), flags.of());
    let second = (flags.cf(), flags.pf(), flags.af(), flags.zf(), flags.sf(), flags.of());
    assert_eq!(first, second);
}
