//! Machine setups shared by the integration tests.

#![allow(dead_code)]

use env_logger;
use x86core::cpu::control::{Cr4, Efer};
use x86core::cpu::instr::OpSize;
use x86core::cpu::segment::{Descriptor, DescriptorTable, Segment, SegmentRegister, Selector};
use x86core::cpu::{CpuConfig, CpuContext, State};
use x86core::memory::{ArrayMemory, Memory};

pub const GDT: u64 = 0x1000;
pub const TSS: u64 = 0x3000;
pub const MEM_SIZE: usize = 0x20000;

/// Ring 0 stack pointer stored in the TSS.
pub const ESP0: u32 = 0x9000;

pub const KERNEL_CODE: u16 = 0x08;
pub const KERNEL_DATA: u16 = 0x10;
pub const USER_CODE: u16 = 0x1b;
pub const USER_DATA: u16 = 0x23;
pub const TSS_SEL: u16 = 0x28;
pub const CALL_GATE: u16 = 0x33;
pub const CODE16: u16 = 0x38;
pub const CONFORMING: u16 = 0x40;

/// Entry point of the call gate.
pub const GATE_ENTRY: u32 = 0x2000;

pub const KERNEL_CODE64: u16 = 0x48;
pub const USER_CODE64: u16 = 0x53;
pub const RING1_CODE64: u16 = 0x59;
pub const GATE64: u16 = 0x63;
pub const BAD_GATE64: u16 = 0x73;

/// Entry point of the 64-bit call gate, in the upper half of the address
/// space.
pub const GATE_ENTRY64: u64 = 0xffff_8000_0000_2000;

/// Ring 0 `RSP` stored in the TSS in long mode.
pub const RSP0: u64 = 0x9000;

pub fn init_logger() {
    let _ = env_logger::try_init();
}

/// A flat 4 GiB code or data segment with the access byte `access`.
pub fn flat(access: u8) -> (u32, u32) {
    (0x0000_ffff, 0x00cf_0000 | u32::from(access) << 8)
}

/// A 32-bit call gate to `selector:offset`, copying `params` dwords.
pub fn call_gate(selector: u16, offset: u32, dpl: u8, params: u8) -> (u32, u32) {
    let access = 0x8c | (dpl & 3) << 5;
    (
        u32::from(selector) << 16 | offset & 0xffff,
        offset & 0xffff_0000 | u32::from(access) << 8 | u32::from(params & 0x1f),
    )
}

/// A 64-bit code segment with the access byte `access`.
pub fn code64(access: u8) -> (u32, u32) {
    (0x0000_ffff, 0x00af_0000 | u32::from(access) << 8)
}

/// Writes a 16-byte long mode call gate into GDT slots `index` and
/// `index + 1`.
pub fn write_gate64(mem: &mut ArrayMemory, index: u64, selector: u16, offset: u64, dpl: u8) {
    write_desc(mem, index, call_gate(selector, offset as u32, dpl, 0));
    write_desc(mem, index + 1, ((offset >> 32) as u32, 0));
}

/// An available 32-bit TSS.
pub fn tss(base: u32, limit: u16) -> (u32, u32) {
    (
        base << 16 | u32::from(limit),
        base & 0xff00_0000 | 0x8900 | (base >> 16) & 0xff,
    )
}

pub fn write_desc(mem: &mut ArrayMemory, index: u64, raw: (u32, u32)) {
    mem.store_u32(GDT + index * 8, raw.0).unwrap();
    mem.store_u32(GDT + index * 8 + 4, raw.1).unwrap();
}

pub fn read_desc(mem: &ArrayMemory, index: u64) -> (u32, u32) {
    (mem.load_u32(GDT + index * 8).unwrap(), mem.load_u32(GDT + index * 8 + 4).unwrap())
}

/// A real-mode CPU with `SS:SP = 0000:1000` and 1 MiB of memory.
pub fn real_mode() -> (CpuContext, ArrayMemory) {
    init_logger();
    let mut ctx = CpuContext::new(CpuConfig::default());
    ctx.regs_mut().set_sp(0x1000);
    (ctx, ArrayMemory::zeroed(0x11_0000))
}

/// Protected mode at privilege level `cpl` (0 or 3) with this GDT:
///
/// ```notrust
/// 0x08  flat code, DPL 0
/// 0x10  flat data, DPL 0
/// 0x18  flat code, DPL 3
/// 0x20  flat data, DPL 3
/// 0x28  32-bit TSS, ring 0 stack at 0x10:ESP0
/// 0x30  call gate, DPL 3, to 0x08:GATE_ENTRY with one parameter
/// 0x38  16-bit code, DPL 0, 64 KiB
/// 0x40  conforming flat code, DPL 0
/// ```
pub fn protected(cpl: u8) -> (CpuContext, ArrayMemory) {
    init_logger();
    let mut mem = ArrayMemory::zeroed(MEM_SIZE);
    write_desc(&mut mem, 1, flat(0x9b));
    write_desc(&mut mem, 2, flat(0x93));
    write_desc(&mut mem, 3, flat(0xfb));
    write_desc(&mut mem, 4, flat(0xf3));
    write_desc(&mut mem, 5, tss(TSS as u32, 0x67));
    write_desc(&mut mem, 6, call_gate(KERNEL_CODE, GATE_ENTRY, 3, 1));
    write_desc(&mut mem, 7, (0x0000_ffff, 0x0000_9b00));
    write_desc(&mut mem, 8, flat(0x9f));
    mem.store_u32(TSS + 4, ESP0).unwrap();
    mem.store_u16(TSS + 8, KERNEL_DATA).unwrap();

    let mut ctx = CpuContext::new(CpuConfig::default());
    ctx.set_gdtr(DescriptorTable { base: GDT, limit: 9 * 8 - 1 });
    ctx.write_cr0(0x6000_0011).unwrap();
    let tr = Descriptor::parse(tss(TSS as u32, 0x67).0, tss(TSS as u32, 0x67).1);
    ctx.set_tr(SegmentRegister::new(Selector::new(TSS_SEL), tr));

    let (cs, ds, code, data) = if cpl == 0 {
        (KERNEL_CODE, KERNEL_DATA, flat(0x9b), flat(0x93))
    } else {
        (USER_CODE, USER_DATA, flat(0xfb), flat(0xf3))
    };
    let code = SegmentRegister::new(Selector::new(cs), Descriptor::parse(code.0, code.1));
    let data = SegmentRegister::new(Selector::new(ds), Descriptor::parse(data.0, data.1));
    ctx.set_segment(Segment::Cs, code);
    for &seg in &[Segment::Ss, Segment::Ds, Segment::Es] {
        ctx.set_segment(seg, data);
    }
    ctx.regs_mut().set_esp(0x8000);
    ctx.regs_mut().set_rip(0x1_0000);
    (ctx, mem)
}

/// `protected(0)` switched into long mode, running 64-bit code at privilege
/// level `cpl` (0 or 3) with `RSP = 0x8000`. The GDT grows by:
///
/// ```notrust
/// 0x48  64-bit code, DPL 0
/// 0x50  64-bit code, DPL 3
/// 0x58  64-bit code, DPL 1
/// 0x60  64-bit call gate, DPL 3, to 0x48:GATE_ENTRY64
/// 0x70  64-bit call gate, DPL 3, to a non-canonical address
/// ```
pub fn long_mode(cpl: u8) -> (CpuContext, ArrayMemory) {
    let (mut ctx, mut mem) = protected(0);
    write_desc(&mut mem, 9, code64(0x9b));
    write_desc(&mut mem, 10, code64(0xfb));
    write_desc(&mut mem, 11, code64(0xbb));
    write_gate64(&mut mem, 12, KERNEL_CODE64, GATE_ENTRY64, 3);
    write_gate64(&mut mem, 14, KERNEL_CODE64, 0x0000_8000_0000_0000, 3);
    mem.store_u64(TSS + 4, RSP0).unwrap();
    ctx.set_gdtr(DescriptorTable { base: GDT, limit: 16 * 8 - 1 });

    ctx.write_cr4(u64::from(Cr4::PAE.bits())).unwrap();
    ctx.write_efer(u64::from(Efer::LME.bits())).unwrap();
    ctx.write_cr3(0x1_0000).unwrap();
    ctx.write_cr0(0xe000_0011).unwrap();
    ctx.jump_far(&mut mem, KERNEL_CODE64, 0x1_0000, OpSize::Bits32).unwrap();

    if cpl == 3 {
        let code = code64(0xfb);
        let code = SegmentRegister::new(Selector::new(USER_CODE64), Descriptor::parse(code.0, code.1));
        let data = flat(0xf3);
        let data = SegmentRegister::new(Selector::new(USER_DATA), Descriptor::parse(data.0, data.1));
        ctx.set_segment(Segment::Cs, code);
        for &seg in &[Segment::Ss, Segment::Ds, Segment::Es] {
            ctx.set_segment(seg, data);
        }
    }
    ctx.regs_mut().set_rsp(0x8000);
    (ctx, mem)
}

/// The visible register state, for checking that a faulting instruction
/// changed nothing.
pub fn snapshot(ctx: &CpuContext) -> (State, u32, Vec<SegmentRegister>) {
    let sregs = Segment::ALL.iter().map(|&seg| *ctx.segment(seg)).collect();
    (ctx.regs().clone(), ctx.eflags(), sregs)
}
