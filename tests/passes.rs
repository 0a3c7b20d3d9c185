//! Mid-level pass behavior on small hand-built functions.

use pretty_assertions::assert_eq;
use sysyc::dialects::sys::passes::{Dce, Gvn, Mem2Reg, RegularFold};
use sysyc::dialects::sys::SysOp;
use sysyc::{Attr, BlockId, Builder, Module, OpId, Pass, Ty};

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

fn count_kind(module: &Module, root: OpId, kind: SysOp) -> usize {
    module.find_all(root, kind).len()
}

#[test]
fn regular_fold_reaches_a_fixed_point() {
    let mut module = Module::new();
    let (f, bb) = new_func(&mut module, "f");

    // ((1 + 2) + 0) - 3 folds all the way to zero.
    let mut b = Builder::new(&mut module);
    b.set_to_block_start(bb);
    let one = b.create(SysOp::Int, &[], vec![Attr::Int(1)]);
    let two = b.create(SysOp::Int, &[], vec![Attr::Int(2)]);
    let add = b.create(SysOp::AddI, &[one, two], vec![]);
    let zero = b.create(SysOp::Int, &[], vec![Attr::Int(0)]);
    let add2 = b.create(SysOp::AddI, &[add, zero], vec![]);
    let three = b.create(SysOp::Int, &[], vec![Attr::Int(3)]);
    let sub = b.create(SysOp::SubI, &[add2, three], vec![]);
    b.create(SysOp::Return, &[sub], vec![]);

    RegularFold::default().run(&mut module).unwrap();
    sysyc::cleanup(&mut module);
    Dce::default().run(&mut module).unwrap();
    sysyc::cleanup(&mut module);

    let ret = module.find_all(f, SysOp::Return)[0];
    let result = module.op(ret).operand(0);
    assert_eq!(module.op(result).kind(), SysOp::Int);
    assert_eq!(module.op(result).int_val(), 0);

    // Applying the folder again changes nothing.
    let before = count_kind(&module, f, SysOp::Int);
    RegularFold::default().run(&mut module).unwrap();
    sysyc::cleanup(&mut module);
    assert_eq!(count_kind(&module, f, SysOp::Int), before);
}

#[test]
fn mem2reg_promotes_single_block_scalars() {
    let mut module = Module::new();
    let (f, bb) = new_func(&mut module, "f");

    let mut b = Builder::new(&mut module);
    b.set_to_block_start(bb);
    let alloca = b.create(SysOp::Alloca, &[], vec![Attr::Size(4)]);
    let val = b.create(SysOp::Int, &[], vec![Attr::Int(11)]);
    b.create(SysOp::Store, &[val, alloca], vec![Attr::Size(4)]);
    let load = b.create_ty(Ty::I32, SysOp::Load, &[alloca], vec![Attr::Size(4)]);
    b.create(SysOp::Return, &[load], vec![]);

    Mem2Reg::default().run(&mut module).unwrap();
    sysyc::cleanup(&mut module);

    // The promoted alloca has no live load or store left.
    assert_eq!(count_kind(&module, f, SysOp::Alloca), 0);
    assert_eq!(count_kind(&module, f, SysOp::Load), 0);
    assert_eq!(count_kind(&module, f, SysOp::Store), 0);
    let ret = module.find_all(f, SysOp::Return)[0];
    assert_eq!(module.op(ret).operand(0), val);
}

#[test]
fn mem2reg_skips_escaping_allocas() {
    let mut module = Module::new();
    let (f, bb) = new_func(&mut module, "f");

    // The address is passed to a call: not promotable.
    let mut b = Builder::new(&mut module);
    b.set_to_block_start(bb);
    let alloca = b.create(SysOp::Alloca, &[], vec![Attr::Size(4)]);
    b.create_ty(
        Ty::I32,
        SysOp::Call,
        &[alloca],
        vec![Attr::Name("getarray".to_string()), Attr::ArgCount(1)],
    );
    let load = b.create_ty(Ty::I32, SysOp::Load, &[alloca], vec![Attr::Size(4)]);
    b.create(SysOp::Return, &[load], vec![]);

    Mem2Reg::default().run(&mut module).unwrap();
    sysyc::cleanup(&mut module);

    assert_eq!(count_kind(&module, f, SysOp::Alloca), 1);
    assert_eq!(count_kind(&module, f, SysOp::Load), 1);
}

#[test]
fn gvn_merges_lexically_identical_ops() {
    let mut module = Module::new();
    let (f, bb) = new_func(&mut module, "f");

    let mut b = Builder::new(&mut module);
    b.set_to_block_start(bb);
    let x = b.create(SysOp::Int, &[], vec![Attr::Int(3)]);
    let y = b.create(SysOp::Int, &[], vec![Attr::Int(4)]);
    let add1 = b.create(SysOp::AddI, &[x, y], vec![]);
    // Commuted: value numbering canonicalizes the operand order.
    let add2 = b.create(SysOp::AddI, &[y, x], vec![]);
    let sum = b.create(SysOp::AddI, &[add1, add2], vec![]);
    b.create(SysOp::Return, &[sum], vec![]);

    Gvn::default().run(&mut module).unwrap();
    sysyc::cleanup(&mut module);

    assert_eq!(count_kind(&module, f, SysOp::AddI), 2);
    let sum_ops = module.op(sum).operands();
    assert_eq!(sum_ops[0], sum_ops[1]);
}

#[test]
fn gvn_then_dce_is_idempotent() {
    let mut module = Module::new();
    let (f, bb) = new_func(&mut module, "f");

    let mut b = Builder::new(&mut module);
    b.set_to_block_start(bb);
    let x = b.create(SysOp::Int, &[], vec![Attr::Int(3)]);
    let dup = b.create(SysOp::Int, &[], vec![Attr::Int(3)]);
    let add = b.create(SysOp::AddI, &[x, dup], vec![]);
    b.create(SysOp::Return, &[add], vec![]);

    Gvn::default().run(&mut module).unwrap();
    sysyc::cleanup(&mut module);
    Dce::default().run(&mut module).unwrap();
    sysyc::cleanup(&mut module);

    let ints = count_kind(&module, f, SysOp::Int);
    let adds = count_kind(&module, f, SysOp::AddI);

    Gvn::default().run(&mut module).unwrap();
    sysyc::cleanup(&mut module);
    Dce::default().run(&mut module).unwrap();
    sysyc::cleanup(&mut module);

    assert_eq!(count_kind(&module, f, SysOp::Int), ints);
    assert_eq!(count_kind(&module, f, SysOp::AddI), adds);
}

#[test]
fn dce_keeps_impure_calls() {
    let mut module = Module::new();
    let (f, bb) = new_func(&mut module, "f");

    let mut b = Builder::new(&mut module);
    b.set_to_block_start(bb);
    let unused = b.create(SysOp::Int, &[], vec![Attr::Int(9)]);
    b.create_ty(
        Ty::I32,
        SysOp::Call,
        &[],
        vec![Attr::Name("putint".to_string()), Attr::ArgCount(0), Attr::Impure],
    );
    b.create(SysOp::Return, &[], vec![]);

    Dce::default().run(&mut module).unwrap();
    sysyc::cleanup(&mut module);

    assert!(module.is_dead(unused));
    assert_eq!(count_kind(&module, f, SysOp::Call), 1);
}
