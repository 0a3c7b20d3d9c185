//! Loop-invariant code motion.
//!
//! Variance is a fixed point over operand variance and memory interference,
//! marked while walking the dominator tree inside the loop; everything left
//! unmarked hoists to the preheader. Loads hoist only when no in-loop store
//! may alias them (addresses traced through single-operand phis,
//! conservatively otherwise); a store hoists when address and value are
//! invariant and no load or branch was seen before it. A second phase lifts
//! whole rotated subloops out of an outer loop when every op inside is
//! invariant with respect to the outer one.

use color_eyre::Report;
use rustc_hash::FxHashMap;

use crate::core::{Attr, AttrKind, BlockId, Builder, Module, OpId, OpKind, Pass};
use crate::dialects::sys::analysis::{may_alias, LoopAnalysis, LoopForest, LoopInfo};
use crate::dialects::sys::SysOp;

#[derive(Default)]
pub struct Licm {
    hoisted: usize,
    domtree: FxHashMap<BlockId, Vec<BlockId>>,
    /// Addresses stored inside the current loop.
    stores: Vec<OpId>,
    impure: bool,
}

fn pinned(module: &Module, op: OpId) -> bool {
    // Slightly different from GCM: loads are not pinned here.
    match module.op(op).kind() {
        OpKind::Sys(SysOp::Call) => module.op(op).has_attr(AttrKind::Impure),
        OpKind::Sys(k) => matches!(
            k,
            SysOp::Return | SysOp::Branch | SysOp::Goto | SysOp::Alloca | SysOp::GetArg
                | SysOp::Clone | SysOp::Join | SysOp::Wake
        ),
        _ => true,
    }
}

fn no_alias(module: &Module, load: OpId, stores: &[OpId]) -> bool {
    let mut addr = module.op(load).operand(0);
    // No stores at all: fine even when the load itself resists analysis.
    if stores.is_empty() {
        return true;
    }
    while module.op(addr).kind() == SysOp::Phi {
        if module.op(addr).operand_count() >= 2 {
            return false;
        }
        addr = module.op(addr).operand(0);
    }
    for &store in stores {
        if may_alias(module, addr, store) {
            return false;
        }
    }
    true
}

/// Whether anything feeding `op` between `info` and `outer` is variant with
/// respect to `outer`.
fn variant(module: &Module, op: OpId, info: &LoopInfo, outer: &LoopInfo, depth: usize) -> bool {
    // Somehow hit a cycle.
    if depth >= 100 {
        return true;
    }
    let kind = module.op(op).kind();
    if matches!(
        kind,
        OpKind::Sys(SysOp::Branch) | OpKind::Sys(SysOp::Goto) | OpKind::Sys(SysOp::Return)
            | OpKind::Sys(SysOp::Alloca)
    ) {
        return false;
    }
    if module.op(op).has_attr(AttrKind::Variant) {
        return true;
    }

    if kind == OpKind::Sys(SysOp::Phi) {
        let parent = module.op(op).parent().unwrap();
        // A header phi only depends on the preheader value here; don't trap
        // in the cycle through the latch.
        if parent == info.header {
            let ph = info.preheader.expect("canonicalized loop without preheader");
            return variant(module, module.phi_from(op, ph), info, outer, depth + 1);
        }
    }

    for &operand in module.op(op).operands() {
        let parent = module.op(operand).parent().unwrap();
        if module.dominates(parent, outer.header) && parent != outer.header {
            continue;
        }
        if module.dominates(parent, info.header) && parent != info.header {
            // Defined between `outer` and `info`: not hoistable as a unit.
            return true;
        }
        if variant(module, operand, info, outer, depth + 1) {
            return true;
        }
    }
    false
}

impl Licm {
    fn mark_op(&mut self, module: &mut Module, op: OpId, hoistable: bool) {
        if module.op(op).has_attr(AttrKind::Variant) {
            return;
        }
        let kind = module.op(op).kind();
        let is_load = kind == OpKind::Sys(SysOp::Load);
        let is_store = kind == OpKind::Sys(SysOp::Store);
        let is_phi = kind == OpKind::Sys(SysOp::Phi);

        let mut mark = pinned(module, op) || is_phi;
        if !mark && is_load {
            mark = !no_alias(module, op, &self.stores) || self.impure;
        }
        if !mark && is_store {
            mark = !hoistable
                || self.impure
                || module.op(module.op(op).operand(0)).has_attr(AttrKind::Variant)
                || module.op(module.op(op).operand(1)).has_attr(AttrKind::Variant);
        }
        if !mark {
            for &operand in module.op(op).operands() {
                if module.op(operand).has_attr(AttrKind::Variant) {
                    mark = true;
                    break;
                }
            }
        }
        if mark {
            module.add_attr(op, Attr::Variant);
        }
    }

    fn hoist_variant(&mut self, module: &mut Module, info: &LoopInfo, bb: BlockId, mut hoistable: bool) {
        let mut invariant = Vec::new();

        for op in module.block(bb).ops().to_vec() {
            let kind = module.op(op).kind();
            if kind == SysOp::Load || kind == SysOp::Branch {
                hoistable = false;
            }
            self.mark_op(module, op, hoistable);
            if !module.op(op).has_attr(AttrKind::Variant) {
                invariant.push(op);
            }
        }

        self.hoisted += invariant.len();
        let ph = info.preheader.expect("canonicalized loop without preheader");
        let term = module.block(ph).last_op();
        for op in invariant {
            module.move_op_before(op, term);
        }

        for child in self.domtree.get(&bb).cloned().unwrap_or_default() {
            if info.contains(child) {
                self.hoist_variant(module, info, child, hoistable);
            }
        }
    }

    fn mark_variant(&mut self, module: &mut Module, info: &LoopInfo, bb: BlockId, mut hoistable: bool) {
        for op in module.block(bb).ops().to_vec() {
            let kind = module.op(op).kind();
            if kind == SysOp::Load || kind == SysOp::Branch {
                hoistable = false;
            }
            // Phis are variant here only when an operand is; header phis
            // are pre-marked by the caller.
            if module.op(op).has_attr(AttrKind::Variant) {
                continue;
            }
            self.mark_op(module, op, hoistable);
        }
        for child in self.domtree.get(&bb).cloned().unwrap_or_default() {
            if info.contains(child) {
                self.mark_variant(module, info, child, hoistable);
            }
        }
    }

    /// Records all in-loop store addresses. Returns false when the loop
    /// shape rules hoisting out.
    fn update_stores(&mut self, module: &Module, info: &LoopInfo) -> bool {
        if info.preheader.is_none() {
            return false;
        }
        for &latch in &info.latches {
            if module.op(module.block(latch).last_op()).kind() != SysOp::Branch {
                return false;
            }
        }
        self.stores.clear();
        self.impure = false;
        for &bb in &info.blocks {
            for &op in module.block(bb).ops() {
                let kind = module.op(op).kind();
                if kind == SysOp::Store {
                    self.stores.push(module.op(op).operand(1));
                }
                if kind == SysOp::Call && module.op(op).has_attr(AttrKind::Impure) {
                    self.impure = true;
                }
            }
        }
        true
    }

    fn run_loop(&mut self, module: &mut Module, forest: &LoopForest, idx: usize) {
        // Inner loops first, or their variants leak outwards.
        for &sub in &forest.loops[idx].subloops {
            self.run_loop(module, forest, sub);
        }
        let info = forest.loops[idx].clone();
        if !self.update_stores(module, &info) {
            return;
        }
        let header = info.header;
        self.hoist_variant(module, &info, header, true);
    }

    /// Lifts a fully-invariant rotated subloop out of `outer`.
    fn hoist_subloop(&mut self, module: &mut Module, forest: &LoopForest, outer_idx: usize) -> bool {
        let outer = forest.loops[outer_idx].clone();
        if !self.update_stores(module, &outer) {
            return false;
        }

        // Fold single-operand phis of out-of-loop values; this won't break
        // LCSSA and simplifies the variance walk.
        for &bb in &outer.blocks {
            for op in module.block(bb).ops().to_vec() {
                if module.is_dead(op)
                    || module.op(op).kind() != SysOp::Phi
                    || module.op(op).operand_count() != 1
                {
                    continue;
                }
                let def = module.op(op).operand(0);
                let def_bb = module.op(def).parent().unwrap();
                if let Some(ph) = outer.preheader {
                    if module.dominates(def_bb, ph) {
                        module.replace_op_with(op, def);
                    }
                }
            }
        }

        for phi in module.phis(outer.header) {
            module.add_attr(phi, Attr::Variant);
        }
        self.mark_variant(module, &outer, outer.header, true);

        for &sub_idx in &forest.loops[outer_idx].subloops {
            let sub = &forest.loops[sub_idx];
            if sub.exits.len() > 1 || sub.latches.len() > 1 {
                continue;
            }
            let latch = sub.latch();
            if module.op(module.block(latch).last_op()).kind() != SysOp::Branch {
                continue;
            }

            let mut good = true;
            'blocks: for &bb in &sub.blocks {
                for &op in module.block(bb).ops() {
                    if variant(module, op, sub, &outer, 0) {
                        good = false;
                        break 'blocks;
                    }
                }
            }
            if !good {
                continue;
            }

            let outer_ph = outer.preheader.unwrap();
            let sub_ph = sub.preheader.unwrap();
            let exit = sub.exit();

            // Outer preheader enters the hoisted loop; the subloop's old
            // preheader forwards to the exit path.
            let prterm = module.block(outer_ph).last_op();
            let mut b = Builder::new(module);
            b.replace(prterm, SysOp::Goto, &[], vec![Attr::Target(sub.header)]);

            let prterm = module.block(sub_ph).last_op();
            let mut b = Builder::new(module);
            b.replace(prterm, SysOp::Goto, &[], vec![Attr::Target(exit)]);

            for &bb in &sub.blocks {
                module.move_block_before(bb, outer.header);
            }

            // A fresh block becomes the outer loop's entry point from the
            // hoisted loop.
            let newexit = module.insert_block_before(outer.header);
            let latchterm = module.block(latch).last_op();
            if module.op(latchterm).target() == exit {
                module.put_attr(latchterm, Attr::Target(newexit));
            }
            if module.op(latchterm).find_attr(AttrKind::Else).is_some()
                && module.op(latchterm).else_target() == exit
            {
                module.put_attr(latchterm, Attr::Else(newexit));
            }

            let exit_phis = module.phis(exit);
            for &phi in &exit_phis {
                module.move_op_to_start(phi, newexit);
            }

            let mut b = Builder::new(module);
            b.set_to_block_end(newexit);
            b.create(SysOp::Goto, &[], vec![Attr::Target(outer.header)]);

            // Rewire the hoisted loop's entry edges to the outer preheader,
            // and the outer header's to the new exit.
            let mut rewire = module.phis(sub.header);
            rewire.extend(exit_phis);
            for phi in rewire {
                module.remove_attr(phi, AttrKind::Variant);
                for i in 0..module.op(phi).operand_count() {
                    if module.op(phi).from_at(i) == sub_ph {
                        module.set_attr(phi, i, Attr::From(outer_ph));
                        break;
                    }
                }
            }
            for phi in module.phis(outer.header) {
                module.remove_attr(phi, AttrKind::Variant);
                for i in 0..module.op(phi).operand_count() {
                    if module.op(phi).from_at(i) == outer_ph {
                        module.set_attr(phi, i, Attr::From(newexit));
                        break;
                    }
                }
            }
            return true;
        }
        false
    }

    fn clear_variants(module: &mut Module, func: OpId) {
        let region = module.func_region(func);
        for bb in module.region(region).blocks().to_vec() {
            for op in module.block(bb).ops().to_vec() {
                module.remove_attr(op, AttrKind::Variant);
            }
        }
    }
}

impl Pass for Licm {
    fn name(&self) -> &'static str {
        "licm"
    }

    fn stats(&self) -> Vec<(&'static str, usize)> {
        vec![("hoisted", self.hoisted)]
    }

    fn run(&mut self, module: &mut Module) -> Result<(), Report> {
        let analysis = LoopAnalysis::run(module);
        let funcs = module.funcs();

        for &func in &funcs {
            let region = module.func_region(func);
            self.domtree = module.dom_tree(region);

            if let Some(forest) = analysis.forests.get(&func) {
                for root in forest.top_level() {
                    self.run_loop(module, forest, root);
                }
            }
            // Phis tolerate nothing but FROM attrs; strip the markers.
            Self::clear_variants(module, func);
        }

        for &func in &funcs {
            let region = module.func_region(func);
            self.domtree = module.dom_tree(region);

            let mut forest = LoopForest::analyze(module, region);
            loop {
                let mut changed = false;
                for root in forest.top_level().collect::<Vec<_>>() {
                    if self.hoist_subloop(module, &forest, root) {
                        forest = LoopForest::analyze(module, region);
                        self.domtree = module.dom_tree(region);
                        changed = true;
                        break;
                    }
                }
                Self::clear_variants(module, func);
                if !changed {
                    break;
                }
            }
        }
        Ok(())
    }
}
