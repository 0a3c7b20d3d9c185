//! Loop canonicalization: every loop gets a dedicated preheader, and
//! (optionally) the function is put in loop-closed SSA so later loop
//! transforms never see in-loop values used directly from outside.

use std::collections::BTreeSet;

use color_eyre::Report;
use rustc_hash::FxHashMap;

use crate::core::{Attr, AttrKind, BlockId, Builder, Module, OpId, Pass};
use crate::dialects::sys::analysis::{LoopAnalysis, LoopForest};
use crate::dialects::sys::SysOp;

pub struct CanonicalizeLoop {
    lcssa: bool,
}

impl CanonicalizeLoop {
    pub fn new(lcssa: bool) -> CanonicalizeLoop {
        CanonicalizeLoop { lcssa }
    }
}

/// The value of `op` that is valid in `bb`, creating join phis on demand.
/// Blocks dominated by a block outside the loop inherit that block's value.
fn value_for(
    module: &mut Module,
    bb: BlockId,
    info: &crate::dialects::sys::analysis::LoopInfo,
    phi_map: &mut FxHashMap<BlockId, OpId>,
) -> OpId {
    if let Some(&v) = phi_map.get(&bb) {
        return v;
    }

    let idom = module.block(bb).idom().expect("value_for walked past the entry");
    if !info.contains(idom) {
        let op = value_for(module, idom, info, phi_map);
        phi_map.insert(bb, op);
        return op;
    }

    // Not dominated by any single exit: this block needs its own phi.
    let mut b = Builder::new(module);
    b.set_to_block_start(bb);
    let phi = b.create(SysOp::Phi, &[], vec![]);
    phi_map.insert(bb, phi);
    for pred in module.block(bb).preds.clone() {
        let value = value_for(module, pred, info, phi_map);
        module.push_operand(phi, value);
        module.add_attr(phi, Attr::From(pred));
    }
    phi
}

fn lcssa_one(module: &mut Module, forest: &LoopForest, idx: usize) {
    for &sub in &forest.loops[idx].subloops {
        lcssa_one(module, forest, sub);
    }

    let info = &forest.loops[idx];
    for bb in info.blocks.clone() {
        for op in module.block(bb).ops().to_vec() {
            if module.is_dead(op) {
                continue;
            }
            let outside = module.op(op).uses().iter().any(|&user| {
                module.op(user).parent().is_some_and(|p| !info.contains(p))
            });
            if !outside || info.exits.is_empty() {
                continue;
            }

            let mut phi_map: FxHashMap<BlockId, OpId> = FxHashMap::default();
            let mut produced: BTreeSet<OpId> = BTreeSet::new();

            // A phi at every exit this def reaches.
            for exit in info.exits.clone() {
                if phi_map.contains_key(&exit) || !module.dominated_by(exit, bb) {
                    continue;
                }
                let mut b = Builder::new(module);
                b.set_to_block_start(exit);
                let phi = b.create(SysOp::Phi, &[], vec![]);
                for pred in module.block(exit).preds.clone() {
                    if info.contains(pred) {
                        module.push_operand(phi, op);
                        module.add_attr(phi, Attr::From(pred));
                    }
                }
                phi_map.insert(exit, phi);
                produced.insert(phi);
            }

            for user in module.op(op).uses().iter().copied().collect::<Vec<_>>() {
                // A phi use lives on its incoming edge, not in its block.
                let mut parent = module.op(user).parent().unwrap();
                if module.op(user).kind() == SysOp::Phi {
                    for i in 0..module.op(user).operand_count() {
                        if module.op(user).operand(i) == op {
                            parent = module.op(user).from_at(i);
                            break;
                        }
                    }
                }

                if info.contains(parent) || produced.contains(&user) {
                    continue;
                }

                let replacement = value_for(module, parent, info, &mut phi_map);
                module.replace_operand(user, op, replacement);
            }
        }
    }
}

impl Pass for CanonicalizeLoop {
    fn name(&self) -> &'static str {
        "canonicalize-loop"
    }

    fn run(&mut self, module: &mut Module) -> Result<(), Report> {
        let analysis = LoopAnalysis::run(module);
        let funcs = module.funcs();

        // A fresh preheader for every loop, unconditionally; out-of-loop
        // predecessors and header phis are rewired through it.
        for &func in &funcs {
            let Some(forest) = analysis.forests.get(&func) else { continue };

            for info in &forest.loops {
                let header = info.header;
                let preheader = module.insert_block_before(header);

                for pred in module.block(header).preds.clone() {
                    if info.contains(pred) {
                        continue;
                    }
                    let term = module.block(pred).last_op();
                    if module.op(term).find_attr(AttrKind::Target).is_some()
                        && module.op(term).target() == header
                    {
                        module.put_attr(term, Attr::Target(preheader));
                    }
                    if module.op(term).find_attr(AttrKind::Else).is_some()
                        && module.op(term).else_target() == header
                    {
                        module.put_attr(term, Attr::Else(preheader));
                    }
                }

                for phi in module.phis(header) {
                    let mut forwarded = Vec::new();
                    let mut preserved = Vec::new();
                    for i in 0..module.op(phi).operand_count() {
                        let from = module.op(phi).from_at(i);
                        let def = module.op(phi).operand(i);
                        if !info.latches.contains(&from) {
                            forwarded.push((def, from));
                        } else {
                            preserved.push((def, from));
                        }
                    }
                    if forwarded.is_empty() {
                        continue;
                    }

                    let mut b = Builder::new(module);
                    b.set_to_block_end(preheader);
                    let new_phi = b.create(SysOp::Phi, &[], vec![]);
                    for (def, from) in forwarded {
                        module.push_operand(new_phi, def);
                        module.add_attr(new_phi, Attr::From(from));
                    }

                    module.remove_all_operands(phi);
                    module.remove_all_attrs(phi);
                    for (def, from) in preserved {
                        module.push_operand(phi, def);
                        module.add_attr(phi, Attr::From(from));
                    }
                    module.push_operand(phi, new_phi);
                    module.add_attr(phi, Attr::From(preheader));
                }

                let mut b = Builder::new(module);
                b.set_to_block_end(preheader);
                b.create(SysOp::Goto, &[], vec![Attr::Target(header)]);
            }
        }

        if !self.lcssa {
            return Ok(());
        }

        // Preheader insertion changed the CFG; reanalyze before LCSSA.
        let analysis = LoopAnalysis::run(module);
        for &func in &funcs {
            let region = module.func_region(func);
            module.update_doms(region);
            let Some(forest) = analysis.forests.get(&func) else { continue };
            for root in forest.top_level() {
                lcssa_one(module, forest, root);
            }
        }
        Ok(())
    }
}
