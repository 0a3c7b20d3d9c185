//! Substrate behavior: use-def bookkeeping, replacement, erasure and the
//! deferred release sweep.

use pretty_assertions::{assert_eq, assert_ne};
use sysyc::dialects::sys::SysOp;
use sysyc::{Attr, Builder, Module, OpId};

fn new_func(module: &mut Module, name: &str) -> (OpId, sysyc::BlockId) {
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
fn operands_register_uses() {
    let mut module = Module::new();
    let (_, bb) = new_func(&mut module, "f");

    let mut b = Builder::new(&mut module);
    b.set_to_block_start(bb);
    let one = b.create(SysOp::Int, &[], vec![Attr::Int(1)]);
    let two = b.create(SysOp::Int, &[], vec![Attr::Int(2)]);
    let add = b.create(SysOp::AddI, &[one, two], vec![]);

    assert!(module.op(one).uses().contains(&add));
    assert!(module.op(two).uses().contains(&add));
    assert_eq!(module.op(add).operands(), &[one, two]);
    module.verify_uses().unwrap();
}

#[test]
fn replace_all_uses_rewires_and_empties() {
    let mut module = Module::new();
    let (_, bb) = new_func(&mut module, "f");

    let mut b = Builder::new(&mut module);
    b.set_to_block_start(bb);
    let one = b.create(SysOp::Int, &[], vec![Attr::Int(1)]);
    let two = b.create(SysOp::Int, &[], vec![Attr::Int(2)]);
    let add = b.create(SysOp::AddI, &[one, one], vec![]);

    module.replace_all_uses_with(one, two);
    assert!(module.op(one).uses().is_empty());
    assert_eq!(module.op(add).operands(), &[two, two]);
    assert!(module.op(two).uses().contains(&add));
    module.verify_uses().unwrap();
}

#[test]
#[should_panic(expected = "removing op in use")]
fn erasing_a_used_op_is_a_bug() {
    let mut module = Module::new();
    let (_, bb) = new_func(&mut module, "f");

    let mut b = Builder::new(&mut module);
    b.set_to_block_start(bb);
    let one = b.create(SysOp::Int, &[], vec![Attr::Int(1)]);
    let _add = b.create(SysOp::AddI, &[one, one], vec![]);

    module.erase_op(one);
}

#[test]
fn erase_defers_slot_reuse_to_release() {
    let mut module = Module::new();
    let (_, bb) = new_func(&mut module, "f");

    let mut b = Builder::new(&mut module);
    b.set_to_block_start(bb);
    let one = b.create(SysOp::Int, &[], vec![Attr::Int(1)]);
    module.erase_op(one);
    assert!(module.is_dead(one));

    // Before release, new ops never land in the dead slot.
    let mut b = Builder::new(&mut module);
    b.set_to_block_start(bb);
    let fresh = b.create(SysOp::Int, &[], vec![Attr::Int(5)]);
    assert_ne!(fresh, one);

    // After release the slot may be recycled.
    module.release();
    let mut b = Builder::new(&mut module);
    b.set_to_block_start(bb);
    let recycled = b.create(SysOp::Int, &[], vec![Attr::Int(7)]);
    assert_eq!(recycled, one);
    assert_eq!(module.op(recycled).int_val(), 7);
}

#[test]
fn builder_replace_erases_the_original() {
    let mut module = Module::new();
    let (_, bb) = new_func(&mut module, "f");

    let mut b = Builder::new(&mut module);
    b.set_to_block_start(bb);
    let one = b.create(SysOp::Int, &[], vec![Attr::Int(1)]);
    let minus = b.create(SysOp::Minus, &[one], vec![]);
    let user = b.create(SysOp::AddI, &[minus, minus], vec![]);

    let neg = b.replace(minus, SysOp::Int, &[], vec![Attr::Int(-1)]);
    assert!(module.is_dead(minus));
    assert_eq!(module.op(user).operands(), &[neg, neg]);
    assert_eq!(module.op(neg).int_val(), -1);
}

#[test]
fn copy_shares_attributes_and_operands() {
    let mut module = Module::new();
    let (_, bb) = new_func(&mut module, "f");

    let mut b = Builder::new(&mut module);
    b.set_to_block_start(bb);
    let one = b.create(SysOp::Int, &[], vec![Attr::Int(41)]);
    let copy = b.copy(one);

    assert_eq!(module.op(copy).int_val(), 41);
    assert_eq!(module.op(copy).kind(), module.op(one).kind());
    assert_ne!(copy, one);
}

#[test]
fn split_and_inline_preserve_order() {
    let mut module = Module::new();
    let (f, bb) = new_func(&mut module, "f");

    let mut b = Builder::new(&mut module);
    b.set_to_block_start(bb);
    let a = b.create(SysOp::Int, &[], vec![Attr::Int(1)]);
    let c = b.create(SysOp::Int, &[], vec![Attr::Int(2)]);
    let d = b.create(SysOp::Int, &[], vec![Attr::Int(3)]);

    let region = module.func_region(f);
    let dest = module.append_block(region);
    module.split_ops_after(dest, c);

    assert_eq!(module.block(bb).ops(), &[a]);
    assert_eq!(module.block(dest).ops(), &[c, d]);

    module.inline_to_end(dest, bb);
    assert_eq!(module.block(bb).ops(), &[a, c, d]);
}
