//! Full unrolling of constant-trip-count loops.
//!
//! Fires only on rotated, innermost, single-exit loops whose bounds and
//! step are literals, with `body_size * iterations <= 1000` and fewer than
//! five header phis (more phis means immense register pressure, not
//! speedup). The loop body is cloned `trip - 1` times, chained latch to
//! header copy, with header phis resolved to the previous copy's values.

use color_eyre::Report;
use rustc_hash::FxHashMap;

use crate::core::{Attr, AttrKind, BlockId, Builder, Module, OpId, Pass};
use crate::dialects::sys::analysis::{LoopForest, LoopInfo};
use crate::dialects::sys::SysOp;

#[derive(Default)]
pub struct ConstLoopUnroll {
    unrolled: usize,
}

impl ConstLoopUnroll {
    /// Clones the loop body `unroll - 1` times after `at`, rewiring each
    /// copy's entry to the previous latch. `phi_map` holds each header
    /// phi's latch value, `exit_latch` the exit phis' latch operands.
    fn copy_loop(
        module: &mut Module,
        info: &LoopInfo,
        mut at: BlockId,
        unroll: usize,
        phi_map: &FxHashMap<OpId, OpId>,
        exit_latch: &FxHashMap<OpId, OpId>,
    ) -> BlockId {
        let latch = info.latch();
        let header = info.header;
        let exit = info.exit();
        let mut last_latch = latch;
        let mut latch_rewire = None;
        let mut prev_latch: FxHashMap<OpId, OpId> = FxHashMap::default();
        let mut clone_map: FxHashMap<OpId, OpId> = FxHashMap::default();

        // One copy is the original body itself.
        for _ in 1..unroll {
            clone_map.clear();
            let mut rev_phi: FxHashMap<OpId, OpId> = FxHashMap::default();
            let mut rewire_map: FxHashMap<BlockId, BlockId> = FxHashMap::default();
            let mut created = Vec::new();

            for block in info.blocks.iter().copied().collect::<Vec<_>>() {
                at = module.insert_block_after(at);
                let mut b = Builder::new(module);
                b.set_to_block_start(at);
                for op in b.module.block(block).ops().to_vec() {
                    let copied = b.copy(op);
                    clone_map.insert(op, copied);
                    created.push(copied);
                    if b.module.op(op).kind() == SysOp::Phi {
                        rev_phi.insert(copied, op);
                    }
                }
                rewire_map.insert(block, at);
            }

            // Rewire operands into the copy.
            for &op in &created {
                let operands = module.op(op).operands().to_vec();
                module.remove_all_operands(op);
                for def in operands {
                    let mapped = clone_map.get(&def).copied().unwrap_or(def);
                    module.push_operand(op, mapped);
                }
            }

            // Rewire copied jumps among the copied blocks.
            for &v in rewire_map.values() {
                let term = module.block(v).last_op();
                if let Some(Attr::Target(t)) = module.op(term).find_attr(AttrKind::Target) {
                    if let Some(&new) = rewire_map.get(t) {
                        module.put_attr(term, Attr::Target(new));
                    }
                }
                if let Some(Attr::Else(t)) = module.op(term).find_attr(AttrKind::Else) {
                    if let Some(&new) = rewire_map.get(t) {
                        module.put_attr(term, Attr::Else(new));
                    }
                }
            }

            // Chain the previous copy's latch into this copy's header.
            let rewired = rewire_map[&header];
            if last_latch != latch {
                let term = module.block(last_latch).last_op();
                let mut b = Builder::new(module);
                b.replace(term, SysOp::Goto, &[], vec![Attr::Target(rewired)]);
            } else {
                latch_rewire = Some(rewired);
            }

            // This copy's latch leaves for the real header (fixed below) or
            // the exit.
            let cur_latch = rewire_map[&latch];
            let term = module.block(cur_latch).last_op();
            if module.op(term).target() == rewired {
                module.put_attr(term, Attr::Target(header));
            }
            if module.op(term).else_target() == rewired {
                module.put_attr(term, Attr::Else(header));
            }
            last_latch = cur_latch;

            // Header-phi copies resolve to the value the previous iteration
            // produced.
            let copied_phis = module.phis(rewired);
            for copied_phi in copied_phis.clone() {
                let orig_phi = rev_phi[&copied_phi];
                let latch_value = phi_map[&orig_phi];
                let value = prev_latch.get(&latch_value).copied().unwrap_or(latch_value);
                clone_map.insert(orig_phi, value);
                module.replace_op_with(copied_phi, value);
            }

            // Remaining copied phis rename their incoming blocks.
            for (&copied, _) in rev_phi.iter() {
                if copied_phis.contains(&copied) || module.is_dead(copied) {
                    continue;
                }
                for i in 0..module.op(copied).operand_count() {
                    let from = module.op(copied).from_at(i);
                    if let Some(&new) = rewire_map.get(&from) {
                        module.set_attr(copied, i, Attr::From(new));
                    }
                }
            }

            prev_latch = clone_map.clone();
        }

        // The original latch now continues into the first copy, and the
        // last copy's latch can only leave.
        let term = module.block(latch).last_op();
        let mut b = Builder::new(module);
        b.replace(term, SysOp::Goto, &[], vec![Attr::Target(latch_rewire.unwrap())]);

        let fin = module.block(last_latch).last_op();
        let mut b = Builder::new(module);
        b.replace(fin, SysOp::Goto, &[], vec![Attr::Target(exit)]);

        // Exit phis receive from the last latch only.
        for (&phi, &v) in exit_latch {
            let def = clone_map.get(&v).copied().unwrap_or(v);
            let index = module.replace_operand(phi, v, def);
            module.set_attr(phi, index, Attr::From(last_latch));
        }

        // Header phis lose their latch operand; the side entrance runs once.
        for phi in module.phis(header) {
            for i in 0..module.op(phi).operand_count() {
                if module.op(phi).from_at(i) == latch {
                    module.remove_operand(phi, i);
                    module.remove_attr_at(phi, i);
                    break;
                }
            }
        }

        last_latch
    }

    fn run_loop(&mut self, module: &mut Module, info: &LoopInfo) -> bool {
        if info.induction.is_none() || info.exits.len() != 1 {
            return false;
        }
        let header = info.header;
        let Some(preheader) = info.preheader else { return false };
        let latch = info.latch();
        // Unrotated loops don't unroll.
        if module.op(module.block(latch).last_op()).kind() != SysOp::Branch {
            return false;
        }
        let exit = info.exit();
        // An internal break would interfere.
        if module.block(exit).preds.len() > 2 {
            return false;
        }

        let mut loopsize = 0;
        for &bb in &info.blocks {
            loopsize += module.block(bb).op_count();
        }
        if loopsize > 300 {
            return false;
        }

        let phis = module.phis(header);
        if phis.len() >= 5 {
            return false;
        }

        // Each header phi must come from exactly {preheader, latch}.
        let mut phi_map: FxHashMap<OpId, OpId> = FxHashMap::default();
        for &phi in &phis {
            if module.op(phi).operand_count() != 2 {
                return false;
            }
            let bb1 = module.op(phi).from_at(0);
            let bb2 = module.op(phi).from_at(1);
            let ok = (bb1 == latch && bb2 == preheader) || (bb2 == latch && bb1 == preheader);
            if !ok {
                return false;
            }
            let latch_idx = if bb1 == latch { 0 } else { 1 };
            phi_map.insert(phi, module.op(phi).operand(latch_idx));
        }

        let mut lower = info.start.unwrap();
        let Some(mut upper) = info.stop else { return false };
        while module.op(lower).kind() == SysOp::Phi && module.op(lower).operand_count() == 1 {
            lower = module.op(lower).operand(0);
        }
        while module.op(upper).kind() == SysOp::Phi && module.op(upper).operand_count() == 1 {
            upper = module.op(upper).operand(0);
        }
        let step = info.step.unwrap();
        if module.op(step).kind() != SysOp::Int {
            return false;
        }

        if module.op(lower).kind() != SysOp::Int || module.op(upper).kind() != SysOp::Int {
            return false;
        }
        let low = module.op(lower).int_val();
        let high = module.op(upper).int_val();
        let times = (high - low) / module.op(step).int_val();
        // A single iteration has no copy to chain; the folder handles it.
        if times <= 1 || times as usize > 1000 / loopsize.max(1) {
            return false;
        }

        let mut exit_latch: FxHashMap<OpId, OpId> = FxHashMap::default();
        for phi in module.phis(exit) {
            exit_latch.insert(phi, module.phi_from(phi, latch));
        }

        Self::copy_loop(module, info, latch, times as usize, &phi_map, &exit_latch);
        self.unrolled += 1;
        true
    }
}

impl Pass for ConstLoopUnroll {
    fn name(&self) -> &'static str {
        "const-loop-unroll"
    }

    fn stats(&self) -> Vec<(&'static str, usize)> {
        vec![("unrolled", self.unrolled)]
    }

    fn run(&mut self, module: &mut Module) -> Result<(), Report> {
        for func in module.funcs() {
            let region = module.func_region(func);
            let mut forest = LoopForest::analyze(module, region);

            loop {
                let mut changed = false;
                if module.region(region).blocks().len() > 1000 {
                    break;
                }

                let mut order = Vec::new();
                for root in forest.top_level().collect::<Vec<_>>() {
                    forest.postorder(root, &mut order);
                }

                for idx in order {
                    // Only innermost loops; nested copies wouldn't be wired
                    // correctly.
                    if !forest.loops[idx].subloops.is_empty() {
                        continue;
                    }
                    let info = forest.loops[idx].clone();
                    if self.run_loop(module, &info) {
                        forest = LoopForest::analyze(module, region);
                        changed = true;
                        break;
                    }
                }
                if !changed {
                    break;
                }
            }
        }
        Ok(())
    }
}
