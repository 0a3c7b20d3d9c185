//! The S-expression rule language: binding modes, constant evaluation,
//! guards, and rewriting through the builder.

use pretty_assertions::assert_eq;
use sysyc::dialects::sys::SysOp;
use sysyc::matcher::{Binding, Rule};
use sysyc::{Attr, Builder, Module, OpId};

fn func_block(module: &mut Module) -> sysyc::BlockId {
    let top = module.top_block();
    let mut b = Builder::new(module);
    b.set_to_block_end(top);
    let f = b.create(
        SysOp::Func,
        &[],
        vec![Attr::Name("f".to_string()), Attr::ArgCount(0)],
    );
    module.create_first_block(f)
}

fn int(module: &mut Module, bb: sysyc::BlockId, v: i32) -> OpId {
    let mut b = Builder::new(module);
    b.set_to_block_end(bb);
    b.create(SysOp::Int, &[], vec![Attr::Int(v)])
}

#[test]
fn add_zero_rewrites_to_operand() {
    let mut module = Module::new();
    let bb = func_block(&mut module);
    let x = int(&mut module, bb, 7);
    let zero = int(&mut module, bb, 0);
    let mut b = Builder::new(&mut module);
    b.set_to_block_end(bb);
    let add = b.create(SysOp::AddI, &[x, zero], vec![]);
    let user = b.create(SysOp::Minus, &[add], vec![]);

    let rule = Rule::new("(change (add x 0) x)");
    assert!(rule.rewrite(&mut module, add));
    assert_eq!(module.op(user).operand(0), x);
    assert!(module.is_dead(add));
}

#[test]
fn constant_fold_evaluates_bound_ints() {
    let mut module = Module::new();
    let bb = func_block(&mut module);
    let a = int(&mut module, bb, 5);
    let c = int(&mut module, bb, 9);
    let mut b = Builder::new(&mut module);
    b.set_to_block_end(bb);
    let add = b.create(SysOp::AddI, &[a, c], vec![]);
    let user = b.create(SysOp::Minus, &[add], vec![]);

    let rule = Rule::new("(change (add 'a 'b) (!add 'a 'b))");
    assert!(rule.rewrite(&mut module, add));
    let folded = module.op(user).operand(0);
    assert_eq!(module.op(folded).kind(), SysOp::Int);
    assert_eq!(module.op(folded).int_val(), 14);
}

#[test]
fn repeated_names_must_match_the_same_op() {
    let mut module = Module::new();
    let bb = func_block(&mut module);
    let x = int(&mut module, bb, 3);
    let y = int(&mut module, bb, 4);
    let mut b = Builder::new(&mut module);
    b.set_to_block_end(bb);
    let same = b.create(SysOp::SubI, &[x, x], vec![]);
    let diff = b.create(SysOp::SubI, &[x, y], vec![]);

    let rule = Rule::new("(sub x x)");
    assert!(rule.match_only(&module, same, &Binding::default()).is_some());
    assert!(rule.match_only(&module, diff, &Binding::default()).is_none());
}

#[test]
fn only_if_guard_blocks_the_rewrite() {
    let mut module = Module::new();
    let bb = func_block(&mut module);
    let x = int(&mut module, bb, 10);
    let three = int(&mut module, bb, 3);
    let mut b = Builder::new(&mut module);
    b.set_to_block_end(bb);
    // 10 is not divisible by 3, so the guard fails.
    let div = b.create(SysOp::DivI, &[x, three], vec![]);
    let mul = b.create(SysOp::MulI, &[div, three], vec![]);
    let _user = b.create(SysOp::Minus, &[mul], vec![]);

    let rule =
        Rule::new("(change (div (mul x 'a) 'b) (!only-if (!eq (!mod 'a 'b) 0) (mul x (!div 'a 'b))))");
    assert!(!rule.rewrite(&mut module, div));
    assert!(!module.is_dead(div));
}

#[test]
fn external_bindings_pin_the_match() {
    let mut module = Module::new();
    let bb = func_block(&mut module);
    let addr = int(&mut module, bb, 0);
    let other = int(&mut module, bb, 1);
    let mut b = Builder::new(&mut module);
    b.set_to_block_end(bb);
    let load = b.create(SysOp::Load, &[addr], vec![Attr::Size(4)]);
    let step = int(&mut module, bb, 1);
    let mut b = Builder::new(&mut module);
    b.set_to_block_end(bb);
    let add = b.create(SysOp::AddI, &[load, step], vec![]);
    let store = b.create(SysOp::Store, &[add, addr], vec![Attr::Size(4)]);

    let rule = Rule::new("(store (add (load x) y) x)");
    let pinned = Binding::from_iter([("x".to_string(), addr)]);
    let binding = rule.match_only(&module, store, &pinned).unwrap();
    assert_eq!(Rule::extract(&binding, "y"), step);

    let wrong = Binding::from_iter([("x".to_string(), other)]);
    assert!(rule.match_only(&module, store, &wrong).is_none());
}

#[test]
fn gt_builds_swapped_lt() {
    let mut module = Module::new();
    let bb = func_block(&mut module);
    let a = int(&mut module, bb, 1);
    let c = int(&mut module, bb, 2);
    let mut b = Builder::new(&mut module);
    b.set_to_block_end(bb);
    let not = b.create(SysOp::Not, &[a], vec![]);
    let _ = c;
    let user = b.create(SysOp::Minus, &[not], vec![]);

    // (not (lt x y)) -> (ge x y), which builds as (le y x).
    let lt = {
        let mut b = Builder::new(&mut module);
        b.set_before_op(not);
        let lt = b.create(SysOp::Lt, &[a, c], vec![]);
        module.set_operand(not, 0, lt);
        lt
    };
    let rule = Rule::new("(change (not (lt x y)) (ge x y))");
    assert!(rule.rewrite(&mut module, not));
    let built = module.op(user).operand(0);
    assert_eq!(module.op(built).kind(), SysOp::Le);
    assert_eq!(module.op(built).operands(), &[c, a]);
    let _ = lt;
}
