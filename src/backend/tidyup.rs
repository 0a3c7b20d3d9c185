//! CFG cleanup after register allocation, shared by both targets:
//! forward-closure of trivial jump blocks, conversion of two-target
//! branches into single-target form (inverting the condition when the
//! fallthrough matches the taken side), and removal of jumps to the
//! textually next block.

use rustc_hash::FxHashMap;

use crate::backend::TargetSpec;
use crate::core::{Attr, AttrKind, BlockId, Builder, Module, OpId, RegionId};

/// Inversion table entry: a conditional branch and its negation.
pub fn tidyup(
    module: &mut Module,
    region: RegionId,
    t: &dyn TargetSpec,
    invert: &dyn Fn(crate::core::OpKind) -> Option<crate::core::OpKind>,
) {
    module.update_preds(region);

    // Blocks holding a single unconditional jump forward to their target;
    // compute the closure and reroute everything through it.
    let mut jump_to: FxHashMap<BlockId, BlockId> = FxHashMap::default();
    for bb in module.region(region).blocks().to_vec() {
        if module.block(bb).op_count() == 1 {
            let term = module.block(bb).last_op();
            if module.op(term).kind() == t.jump() {
                jump_to.insert(bb, module.op(term).target());
            }
        }
    }
    loop {
        let mut changed = false;
        for (k, v) in jump_to.clone() {
            if let Some(&next) = jump_to.get(&v) {
                if next != v && jump_to[&k] != next {
                    jump_to.insert(k, next);
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }

    for bb in module.region(region).blocks().to_vec() {
        let term = module.block(bb).last_op();
        if let Some(Attr::Target(tg)) = module.op(term).find_attr(AttrKind::Target) {
            if let Some(&new) = jump_to.get(tg) {
                module.put_attr(term, Attr::Target(new));
            }
        }
        if let Some(Attr::Else(tg)) = module.op(term).find_attr(AttrKind::Else) {
            if let Some(&new) = jump_to.get(tg) {
                module.put_attr(term, Attr::Else(new));
            }
        }
    }

    module.update_preds(region);
    for (&bb, _) in jump_to.iter() {
        if module.block(bb).preds.is_empty() {
            module.erase_block(bb);
        }
    }

    // Branches still carry both targets; reduce to one, preferring to fall
    // through and inverting the condition when that flips the sides.
    for bb in module.region(region).blocks().to_vec() {
        let term = module.block(bb).last_op();
        let Some(inverted) = invert(module.op(term).kind()) else { continue };
        if module.op(term).find_attr(AttrKind::Else).is_none() {
            continue;
        }
        let target = module.op(term).target();
        let ifnot = module.op(term).else_target();
        let next = module.next_block(bb);

        match next {
            Some(next) if next == target => {
                // Fallthrough is the taken side: invert and jump the other
                // way.
                let attrs: Vec<Attr> = module
                    .op(term)
                    .attrs()
                    .iter()
                    .filter(|a| {
                        !matches!(a.kind(), AttrKind::Target | AttrKind::Else)
                    })
                    .map(|a| (**a).clone())
                    .collect();
                let mut all = vec![Attr::Target(ifnot)];
                all.extend(attrs);
                let mut b = Builder::new(module);
                b.replace(term, inverted, &[], all);
            }
            Some(next) if next == ifnot => {
                // Fallthrough already matches the else side.
                module.remove_attr(term, AttrKind::Else);
            }
            _ => {
                // Neither side falls through; keep the branch and add an
                // explicit jump for the else side.
                let mut b = Builder::new(module);
                b.set_after_op(term);
                b.create(t.jump(), &[], vec![Attr::Target(ifnot)]);
                module.remove_attr(term, AttrKind::Else);
            }
        }
    }

    // Jumps to the textually next block do nothing.
    for bb in module.region(region).blocks().to_vec() {
        let term = module.block(bb).last_op();
        if module.op(term).kind() != t.jump() {
            continue;
        }
        if module.next_block(bb) == Some(module.op(term).target()) {
            module.erase_op(term);
        }
    }
}

/// Registers actually written in a function; drives callee-saved spilling
/// in the prologue.
pub fn used_registers(module: &Module, func: OpId) -> Vec<crate::core::PReg> {
    let region = module.func_region(func);
    let mut used = Vec::new();
    for &bb in module.region(region).blocks() {
        for &op in module.block(bb).ops() {
            if let Some(attr) = module.op(op).find_attr(AttrKind::Rd) {
                let r = attr.as_reg();
                if !used.contains(&r) {
                    used.push(r);
                }
            }
        }
    }
    used.sort();
    used
}
