//! Back-end behavior: strength reduction sequences and the assembly
//! emitters, on small hand-built machine functions.

use pretty_assertions::assert_eq;
use sysyc::dialects::arm::{self, ArmOp};
use sysyc::dialects::rv::{self, RvOp};
use sysyc::dialects::sys::SysOp;
use sysyc::{Attr, BlockId, Builder, Module, OpId, PReg, Pass, Ty};

fn new_func(module: &mut Module, name: &str) -> (OpId, BlockId) {
    let top = module.top_block();
    let mut b = Builder::new(module);
    b.set_to_block_end(top);
    let f = b.create(
        SysOp::Func,
        &[],
        vec![Attr::Name(name.to_string()), Attr::ArgCount(0)],
    );
    let bb = module.create_first_block(f);
    (f, bb)
}

#[test]
fn arm_division_by_seven_uses_the_multiplier() {
    let mut module = Module::new();
    let (f, bb) = new_func(&mut module, "f");

    let mut b = Builder::new(&mut module);
    b.set_to_block_start(bb);
    let x = b.create_ty(Ty::I32, ArmOp::ReadReg, &[], vec![Attr::Reg(PReg::gpr(0))]);
    let seven = b.create(ArmOp::MovI, &[], vec![Attr::Int(7)]);
    let div = b.create(ArmOp::SdivW, &[x, seven], vec![]);
    let keep = b.create(ArmOp::WriteReg, &[div], vec![Attr::Reg(PReg::gpr(0))]);
    let _ = keep;

    arm::StrengthReduct::default().run(&mut module).unwrap();
    sysyc::cleanup(&mut module);

    // No division remains; seven takes the wide-multiplier variant: one
    // immediate load, one widening multiply, arithmetic shifts and the
    // subtract of the sign bit.
    assert!(module.find_all(f, ArmOp::SdivW).is_empty());
    assert_eq!(module.find_all(f, ArmOp::MovI).len(), 2);
    assert_eq!(module.find_all(f, ArmOp::Smull).len(), 1);
    assert_eq!(module.find_all(f, ArmOp::AsrXI).len(), 1);
    assert_eq!(module.find_all(f, ArmOp::SubW).len(), 1);
}

#[test]
fn arm_division_by_a_power_of_two_takes_the_bias_path() {
    let mut module = Module::new();
    let (f, bb) = new_func(&mut module, "f");

    let mut b = Builder::new(&mut module);
    b.set_to_block_start(bb);
    let x = b.create_ty(Ty::I32, ArmOp::ReadReg, &[], vec![Attr::Reg(PReg::gpr(0))]);
    let eight = b.create(ArmOp::MovI, &[], vec![Attr::Int(8)]);
    let div = b.create(ArmOp::SdivW, &[x, eight], vec![]);
    b.create(ArmOp::WriteReg, &[div], vec![Attr::Reg(PReg::gpr(0))]);

    arm::StrengthReduct::default().run(&mut module).unwrap();
    sysyc::cleanup(&mut module);

    // The shift-bias sequence, never the Granlund-Montgomery multiplier.
    assert!(module.find_all(f, ArmOp::SdivW).is_empty());
    assert!(module.find_all(f, ArmOp::Smull).is_empty());
    assert_eq!(module.find_all(f, ArmOp::CselLtZ).len(), 1);
    assert_eq!(module.find_all(f, ArmOp::AsrWI).len(), 1);
}

#[test]
fn arm_multiply_by_power_of_two_becomes_a_shift() {
    let mut module = Module::new();
    let (f, bb) = new_func(&mut module, "f");

    let mut b = Builder::new(&mut module);
    b.set_to_block_start(bb);
    let x = b.create_ty(Ty::I32, ArmOp::ReadReg, &[], vec![Attr::Reg(PReg::gpr(0))]);
    let c = b.create(ArmOp::MovI, &[], vec![Attr::Int(16)]);
    let mul = b.create(ArmOp::MulW, &[x, c], vec![]);
    b.create(ArmOp::WriteReg, &[mul], vec![Attr::Reg(PReg::gpr(0))]);

    arm::StrengthReduct::default().run(&mut module).unwrap();
    sysyc::cleanup(&mut module);

    assert!(module.find_all(f, ArmOp::MulW).is_empty());
    let shifts = module.find_all(f, ArmOp::LslWI);
    assert_eq!(shifts.len(), 1);
    assert_eq!(module.op(shifts[0]).int_val(), 4);
}

#[test]
fn arm_dump_emits_labels_and_registers() {
    let mut module = Module::new();
    let (_, bb) = new_func(&mut module, "main");

    let mut b = Builder::new(&mut module);
    b.set_to_block_start(bb);
    let mv = b.create(ArmOp::MovI, &[], vec![Attr::Int(42), Attr::Rd(PReg::gpr(0))]);
    let _ = mv;
    b.create(ArmOp::Ret, &[], vec![]);

    let text = arm::dump::dump(&module);
    assert!(text.contains(".global main"));
    assert!(text.contains("main:"));
    assert!(text.contains(".Lbb0:"));
    assert!(text.contains("mov w0, 42"));
    assert!(text.contains("ret"));
}

#[test]
fn arm_dump_places_zero_globals_in_bss() {
    let mut module = Module::new();
    let top = module.top_block();
    let mut b = Builder::new(&mut module);
    b.set_to_block_end(top);
    b.create(
        SysOp::Global,
        &[],
        vec![
            Attr::Size(16),
            Attr::Name("zeroes".to_string()),
            Attr::IntArray(vec![0, 0, 0, 0]),
            Attr::Dims(vec![4]),
        ],
    );
    b.create(
        SysOp::Global,
        &[],
        vec![
            Attr::Size(8),
            Attr::Name("data".to_string()),
            Attr::IntArray(vec![1, 2]),
            Attr::Dims(vec![2]),
        ],
    );

    let text = arm::dump::dump(&module);
    assert!(text.contains(".section .bss"));
    assert!(text.contains("zeroes:"));
    assert!(text.contains(".skip 16"));
    assert!(text.contains(".section .data"));
    assert!(text.contains("data:"));
    assert!(text.contains(".word 1, 2"));
}

#[test]
fn rv_division_by_seven_uses_the_multiplier() {
    let mut module = Module::new();
    let (f, bb) = new_func(&mut module, "f");

    let mut b = Builder::new(&mut module);
    b.set_to_block_start(bb);
    let x = b.create_ty(Ty::I32, RvOp::ReadReg, &[], vec![Attr::Reg(PReg::gpr(10))]);
    let seven = b.create(RvOp::Li, &[], vec![Attr::Int(7)]);
    let div = b.create(RvOp::Divw, &[x, seven], vec![]);
    b.create(RvOp::WriteReg, &[div], vec![Attr::Reg(PReg::gpr(10))]);

    rv::StrengthReduct::default().run(&mut module).unwrap();
    sysyc::cleanup(&mut module);

    assert!(module.find_all(f, RvOp::Divw).is_empty());
    assert_eq!(module.find_all(f, RvOp::Mul).len(), 1);
}

#[test]
fn rv_dump_picks_widths_from_size() {
    let mut module = Module::new();
    let (_, bb) = new_func(&mut module, "main");

    let mut b = Builder::new(&mut module);
    b.set_to_block_start(bb);
    b.create(
        RvOp::Load,
        &[],
        vec![
            Attr::Rd(PReg::gpr(10)),
            Attr::Rs(PReg::gpr(2)),
            Attr::Int(8),
            Attr::Size(4),
        ],
    );
    b.create(
        RvOp::Load,
        &[],
        vec![
            Attr::Rd(PReg::gpr(11)),
            Attr::Rs(PReg::gpr(2)),
            Attr::Int(16),
            Attr::Size(8),
        ],
    );
    b.create(RvOp::Ret, &[], vec![]);

    let text = rv::dump::dump(&module);
    assert!(text.contains("lw a0, 8(sp)"));
    assert!(text.contains("ld a1, 16(sp)"));
    assert!(text.contains("ret"));
}
