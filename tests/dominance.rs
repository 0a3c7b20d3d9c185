//! Dominator, post-dominator and liveness analyses over hand-built CFGs.

use pretty_assertions::assert_eq;
use sysyc::dialects::sys::SysOp;
use sysyc::{Attr, BlockId, Builder, Module, OpId};

/// entry -> {then, els} -> join, with a return in join.
fn diamond(module: &mut Module) -> (OpId, [BlockId; 4]) {
    let top = module.top_block();
    let mut b = Builder::new(module);
    b.set_to_block_end(top);
    let f = b.create(
        SysOp::Func,
        &[],
        vec![Attr::Name("f".to_string()), Attr::ArgCount(0)],
    );
    let entry = module.create_first_block(f);
    let region = module.func_region(f);
    let then = module.append_block(region);
    let els = module.append_block(region);
    let join = module.append_block(region);

    let mut b = Builder::new(module);
    b.set_to_block_start(entry);
    let cond = b.create(SysOp::Int, &[], vec![Attr::Int(1)]);
    b.create(
        SysOp::Branch,
        &[cond],
        vec![Attr::Target(then), Attr::Else(els)],
    );
    let mut b = Builder::new(module);
    b.set_to_block_start(then);
    b.create(SysOp::Goto, &[], vec![Attr::Target(join)]);
    let mut b = Builder::new(module);
    b.set_to_block_start(els);
    b.create(SysOp::Goto, &[], vec![Attr::Target(join)]);
    let mut b = Builder::new(module);
    b.set_to_block_start(join);
    b.create(SysOp::Return, &[], vec![]);

    (f, [entry, then, els, join])
}

#[test]
fn diamond_dominators() {
    let mut module = Module::new();
    let (f, [entry, then, els, join]) = diamond(&mut module);
    let region = module.func_region(f);
    module.update_doms(region);

    assert_eq!(module.block(entry).idom(), None);
    assert_eq!(module.block(then).idom(), Some(entry));
    assert_eq!(module.block(els).idom(), Some(entry));
    // The join is dominated by neither arm.
    assert_eq!(module.block(join).idom(), Some(entry));

    assert!(module.dominates(entry, join));
    assert!(!module.dominates(then, join));
    assert!(module.dominated_by(join, entry));
}

#[test]
fn diamond_dominance_frontier() {
    let mut module = Module::new();
    let (f, [_, then, els, join]) = diamond(&mut module);
    let region = module.func_region(f);
    module.update_dom_front(region);

    // Each arm's frontier is the join; the join's own frontier is empty.
    assert!(module.block(then).dom_front().contains(&join));
    assert!(module.block(els).dom_front().contains(&join));
    assert!(module.block(join).dom_front().is_empty());
}

#[test]
fn diamond_post_dominators() {
    let mut module = Module::new();
    let (f, [entry, then, els, join]) = diamond(&mut module);
    let region = module.func_region(f);
    module.update_pdoms(region);

    assert_eq!(module.block(then).ipdom(), Some(join));
    assert_eq!(module.block(els).ipdom(), Some(join));
    assert_eq!(module.block(entry).ipdom(), Some(join));
    assert_eq!(module.block(join).ipdom(), None);
}

#[test]
fn loop_header_dominates_latch() {
    let mut module = Module::new();
    let top = module.top_block();
    let mut b = Builder::new(&mut module);
    b.set_to_block_end(top);
    let f = b.create(
        SysOp::Func,
        &[],
        vec![Attr::Name("f".to_string()), Attr::ArgCount(0)],
    );
    let entry = module.create_first_block(f);
    let region = module.func_region(f);
    let header = module.append_block(region);
    let latch = module.append_block(region);
    let exit = module.append_block(region);

    let mut b = Builder::new(&mut module);
    b.set_to_block_start(entry);
    b.create(SysOp::Goto, &[], vec![Attr::Target(header)]);
    let mut b = Builder::new(&mut module);
    b.set_to_block_start(header);
    let cond = b.create(SysOp::Int, &[], vec![Attr::Int(1)]);
    b.create(
        SysOp::Branch,
        &[cond],
        vec![Attr::Target(latch), Attr::Else(exit)],
    );
    let mut b = Builder::new(&mut module);
    b.set_to_block_start(latch);
    b.create(SysOp::Goto, &[], vec![Attr::Target(header)]);
    let mut b = Builder::new(&mut module);
    b.set_to_block_start(exit);
    b.create(SysOp::Return, &[], vec![]);

    module.update_doms(region);
    assert_eq!(module.block(latch).idom(), Some(header));
    assert_eq!(module.block(exit).idom(), Some(header));
    assert!(module.block(header).preds.contains(&latch));
    assert!(module.block(header).preds.contains(&entry));
}

#[test]
fn phi_uses_live_on_their_edges() {
    let mut module = Module::new();
    let (f, [entry, then, els, join]) = diamond(&mut module);
    let region = module.func_region(f);

    // One constant per arm, joined by a phi.
    let mut b = Builder::new(&mut module);
    b.set_to_block_start(then);
    let a = b.create(SysOp::Int, &[], vec![Attr::Int(1)]);
    let mut b = Builder::new(&mut module);
    b.set_to_block_start(els);
    let c = b.create(SysOp::Int, &[], vec![Attr::Int(2)]);
    let mut b = Builder::new(&mut module);
    b.set_to_block_start(join);
    let phi = b.create(
        SysOp::Phi,
        &[a, c],
        vec![Attr::From(then), Attr::From(els)],
    );

    module.update_liveness(region);

    // Each constant is live out of its own arm only; the phi is a live-in
    // of the join, and nothing from the arms is.
    assert!(module.block(then).live_out().contains(&a));
    assert!(!module.block(then).live_out().contains(&c));
    assert!(module.block(els).live_out().contains(&c));
    assert!(!module.block(els).live_out().contains(&a));
    assert!(module.block(join).live_in().contains(&phi));
    assert!(!module.block(join).live_in().contains(&a));
    assert!(!module.block(entry).live_out().contains(&a));
}

#[test]
fn loop_forest_orders_a_triple_nest_innermost_first() {
    use sysyc::dialects::sys::analysis::LoopForest;

    // for i { for j { for k { } } }, flattened: each header branches into
    // the next level or its own latch, and each latch jumps back up.
    let mut module = Module::new();
    let top = module.top_block();
    let mut b = Builder::new(&mut module);
    b.set_to_block_end(top);
    let f = b.create(
        SysOp::Func,
        &[],
        vec![Attr::Name("f".to_string()), Attr::ArgCount(0)],
    );
    let entry = module.create_first_block(f);
    let region = module.func_region(f);
    let h1 = module.append_block(region);
    let h2 = module.append_block(region);
    let h3 = module.append_block(region);
    let b3 = module.append_block(region);
    let l2 = module.append_block(region);
    let l1 = module.append_block(region);
    let exit = module.append_block(region);

    let mut b = Builder::new(&mut module);
    b.set_to_block_start(entry);
    b.create(SysOp::Goto, &[], vec![Attr::Target(h1)]);
    let mut b = Builder::new(&mut module);
    b.set_to_block_start(h1);
    let c1 = b.create(SysOp::Int, &[], vec![Attr::Int(1)]);
    b.create(SysOp::Branch, &[c1], vec![Attr::Target(h2), Attr::Else(exit)]);
    let mut b = Builder::new(&mut module);
    b.set_to_block_start(h2);
    let c2 = b.create(SysOp::Int, &[], vec![Attr::Int(1)]);
    b.create(SysOp::Branch, &[c2], vec![Attr::Target(h3), Attr::Else(l1)]);
    let mut b = Builder::new(&mut module);
    b.set_to_block_start(h3);
    let c3 = b.create(SysOp::Int, &[], vec![Attr::Int(1)]);
    b.create(SysOp::Branch, &[c3], vec![Attr::Target(b3), Attr::Else(l2)]);
    let mut b = Builder::new(&mut module);
    b.set_to_block_start(b3);
    b.create(SysOp::Goto, &[], vec![Attr::Target(h3)]);
    let mut b = Builder::new(&mut module);
    b.set_to_block_start(l2);
    b.create(SysOp::Goto, &[], vec![Attr::Target(h2)]);
    let mut b = Builder::new(&mut module);
    b.set_to_block_start(l1);
    b.create(SysOp::Goto, &[], vec![Attr::Target(h1)]);
    let mut b = Builder::new(&mut module);
    b.set_to_block_start(exit);
    b.create(SysOp::Return, &[], vec![]);

    let forest = LoopForest::analyze(&mut module, region);
    assert_eq!(forest.loops.len(), 3);

    let idx1 = forest.loop_map[&h1];
    let idx2 = forest.loop_map[&h2];
    let idx3 = forest.loop_map[&h3];
    assert_eq!(forest.loops[idx3].parent, Some(idx2));
    assert_eq!(forest.loops[idx2].parent, Some(idx1));
    assert_eq!(forest.loops[idx1].parent, None);

    // The full nest comes out innermost first, including the depth-2 loop.
    let mut order = Vec::new();
    for root in forest.top_level().collect::<Vec<_>>() {
        forest.postorder(root, &mut order);
    }
    let headers: Vec<_> = order.iter().map(|&i| forest.loops[i].header).collect();
    assert_eq!(headers, vec![h3, h2, h1]);
}
