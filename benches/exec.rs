//! Benchmarks the flag engine and the interpreter.

#[macro_use] extern crate criterion;
extern crate x86core;

use criterion::{Benchmark, Criterion, Throughput};
use x86core::cpu::imm::Immediate;
use x86core::cpu::instr::*;
use x86core::cpu::interpret::Interpreter;
use x86core::cpu::segment::Segment;
use x86core::cpu::{CpuConfig, CpuContext, ExecutionEngine, FlagState};
use x86core::memory::ArrayMemory;

const OPS: u32 = 1024;

fn flags(c: &mut Criterion) {
    c.bench("flags", Benchmark::new("add then query", |b| {
        b.iter(|| {
            let mut flags = FlagState::new();
            let mut acc = 0u64;
            for i in 0..u64::from(OPS) {
                acc = flags.apply_add(OpSize::Bits32, acc, i.wrapping_mul(0x9e37_79b9));
                if flags.eval_condition(ConditionCode::Carry) {
                    acc ^= 1;
                }
            }
            criterion::black_box(acc)
        })
    }).throughput(Throughput::Elements(OPS)));
}

/// Loop body mixing ALU, shift, stack and memory instructions, roughly the
/// shape of compiler output.
fn program() -> Vec<Instr> {
    let eax = Operand::Reg(Register::Dword(Gpr::Rax));
    let ebx = Operand::Reg(Register::Dword(Gpr::Rbx));
    let ecx = Operand::Reg(Register::Dword(Gpr::Rcx));
    let slot = Operand::Mem(MemoryLocation::new(Segment::Ds, 0x800, OpSize::Bits32));
    let imm = |value: u32| Operand::Imm(Immediate::from(value));
    vec![
        Instr::Mov { dest: ecx, src: slot },
        Instr::Alu { op: AluOp::Add, dest: eax, src: ecx },
        Instr::Alu { op: AluOp::Xor, dest: ebx, src: eax },
        Instr::Shift { op: ShiftOp::Rol, dest: ebx, count: Operand::Imm(Immediate::from(3u8)) },
        Instr::Push { operand: ebx },
        Instr::Alu { op: AluOp::Sub, dest: slot, src: imm(7) },
        Instr::Pop { operand: ecx },
        Instr::Alu { op: AluOp::Cmp, dest: ecx, src: imm(0x8000) },
        Instr::Cmov { cc: ConditionCode::Carry, dest: Register::Dword(Gpr::Rdx), src: ecx },
        Instr::Inc { operand: eax },
    ]
}

fn interpret(c: &mut Criterion) {
    let program = program();
    let count = program.len() as u32;
    c.bench("interpret", Benchmark::new("instruction mix", move |b| {
        let mut cpu = CpuContext::new(CpuConfig::default());
        cpu.regs_mut().set_sp(0x1000);
        let mut interp = Interpreter::new(cpu, ArrayMemory::zeroed(0x2000));
        b.iter(|| {
            interp.run(program.iter()).unwrap();
            criterion::black_box(interp.cpu().regs().eax())
        })
    }).throughput(Throughput::Elements(count)));
}

criterion_group!(exec, flags, interpret);
criterion_main!(exec);
