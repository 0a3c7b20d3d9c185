//! Global code motion (Click, PLDI '95).
//!
//! Pinned ops stay put: phis, terminators, memory ops, impure calls,
//! allocas and the thread primitives. Everything else schedules early by
//! its inputs' dominator depth, then late to the LCA of its uses, settling
//! on the shallowest loop depth inside the early-late range. Phi uses count
//! at their incoming edges.

use color_eyre::Report;
use rustc_hash::FxHashMap;

use crate::core::{AnalysisManager, AttrKind, BlockId, Module, OpId, OpKind, Pass};
use crate::dialects::sys::analysis::LoopAnalysis;
use crate::dialects::sys::SysOp;

#[derive(Default)]
pub struct Gcm {
    visited: std::collections::BTreeSet<OpId>,
    depth: FxHashMap<BlockId, usize>,
    loop_depth: FxHashMap<BlockId, usize>,
    tree: FxHashMap<BlockId, Vec<BlockId>>,
}

fn pinned(module: &Module, op: OpId) -> bool {
    match module.op(op).kind() {
        OpKind::Sys(SysOp::Call) => module.op(op).has_attr(AttrKind::Impure),
        OpKind::Sys(k) => matches!(
            k,
            SysOp::Load
                | SysOp::Store
                | SysOp::Return
                | SysOp::Branch
                | SysOp::Goto
                | SysOp::Phi
                | SysOp::Alloca
                | SysOp::GetArg
                | SysOp::Clone
                | SysOp::Join
                | SysOp::Wake
        ),
        _ => true,
    }
}

impl Gcm {
    fn lca(&self, module: &Module, a: Option<BlockId>, b: Option<BlockId>) -> Option<BlockId> {
        let (Some(mut a), Some(mut b)) = (a, b) else {
            return a.or(b);
        };
        // Naive ancestor walk; LCA reduces to range-minimum queries, but for
        // a CFG this size nobody cares.
        while self.depth[&a] > self.depth[&b] {
            a = module.block(a).idom().unwrap();
        }
        while self.depth[&b] > self.depth[&a] {
            b = module.block(b).idom().unwrap();
        }
        while a != b {
            a = module.block(a).idom().unwrap();
            b = module.block(b).idom().unwrap();
        }
        Some(a)
    }

    /// Schedule `op` to the first block dominated by all of its inputs.
    fn schedule_early(&mut self, module: &mut Module, entry: BlockId, op: OpId) {
        if self.visited.contains(&op) || pinned(module, op) {
            return;
        }
        self.visited.insert(op);

        let term = module.block(entry).last_op();
        module.move_op_before(op, term);

        for operand in module.op(op).operands().to_vec() {
            self.schedule_early(module, entry, operand);

            let def_bb = module.op(operand).parent().unwrap();
            let bb = module.op(op).parent().unwrap();
            if self.depth[&def_bb] > self.depth[&bb] {
                let term = module.block(def_bb).last_op();
                module.move_op_before(op, term);
            }
        }
    }

    /// Schedule `op` to the latest block dominating its uses, preferring
    /// the smallest loop depth along the dominator path.
    fn schedule_late(&mut self, module: &mut Module, op: OpId) {
        if self.visited.contains(&op) || pinned(module, op) {
            return;
        }
        self.visited.insert(op);

        let mut lca: Option<BlockId> = None;
        for user in module.op(op).uses().clone() {
            self.schedule_late(module, user);

            let mut use_bb = module.op(user).parent();
            if module.op(user).kind() == SysOp::Phi {
                // A phi consumes its operand on the incoming edge.
                use_bb = None;
                for i in 0..module.op(user).operand_count() {
                    if module.op(user).operand(i) == op {
                        use_bb = self.lca(module, Some(module.op(user).from_at(i)), use_bb);
                    }
                }
            }
            lca = self.lca(module, use_bb, lca);
        }

        // The legal range runs from the early position down to the LCA of
        // uses ("down" in dominator depth).
        let parent = module.op(op).parent().unwrap();
        if let Some(mut lca) = lca {
            assert!(
                self.lca(module, Some(lca), Some(parent)) != Some(lca) || lca == parent,
                "late range does not include the early block"
            );
            let mut result = lca;
            while lca != parent {
                lca = module.block(lca).idom().unwrap();
                if self.loop_depth[&lca] < self.loop_depth[&result] {
                    result = lca;
                }
            }
            let term = module.block(result).last_op();
            module.move_op_before(op, term);
        }

        // Stay above any same-block use.
        let parent = module.op(op).parent().unwrap();
        for x in module.block(parent).ops().to_vec() {
            if x != op && module.op(x).kind() != SysOp::Phi && module.op(op).uses().contains(&x) {
                module.move_op_before(op, x);
                break;
            }
        }
    }

    fn update_depth(&mut self, bb: BlockId, dep: usize) {
        self.depth.insert(bb, dep);
        for child in self.tree.get(&bb).cloned().unwrap_or_default() {
            self.update_depth(child, dep + 1);
        }
    }

    fn run_func(&mut self, module: &mut Module, func: OpId, loops: &LoopAnalysis) {
        self.visited.clear();
        self.depth.clear();
        self.loop_depth.clear();

        let region = module.func_region(func);
        self.tree = module.dom_tree(region);
        let entry = module.region(region).first_block();
        self.update_depth(entry, 0);

        for &bb in module.region(region).blocks() {
            self.loop_depth.insert(bb, 0);
        }
        if let Some(forest) = loops.forests.get(&func) {
            // Blocks outside any loop stay at depth 0.
            for root in forest.top_level() {
                self.mark_loop_depth(forest, root, 1);
            }
        }

        let mut rpo = Vec::new();
        postorder(entry, &self.tree, &mut rpo);
        rpo.reverse();

        let mut to_sched = Vec::new();
        for &bb in &rpo {
            for &op in module.block(bb).ops() {
                if !pinned(module, op) {
                    to_sched.push(op);
                }
            }
        }

        for &op in &to_sched {
            self.schedule_early(module, entry, op);
        }
        to_sched.reverse();
        self.visited.clear();
        for &op in &to_sched {
            self.schedule_late(module, op);
        }
    }

    fn mark_loop_depth(&mut self, forest: &crate::dialects::sys::analysis::LoopForest, idx: usize, dep: usize) {
        for &bb in &forest.loops[idx].blocks {
            self.loop_depth.insert(bb, dep);
        }
        for &sub in forest.loops[idx].subloops.clone().iter() {
            self.mark_loop_depth(forest, sub, dep + 1);
        }
    }
}

fn postorder(current: BlockId, tree: &FxHashMap<BlockId, Vec<BlockId>>, order: &mut Vec<BlockId>) {
    for &child in tree.get(&current).map(|v| v.as_slice()).unwrap_or(&[]) {
        postorder(child, tree, order);
    }
    order.push(current);
}

impl Pass for Gcm {
    fn name(&self) -> &'static str {
        "gcm"
    }

    fn run(&mut self, module: &mut Module) -> Result<(), Report> {
        let computed = LoopAnalysis::run(module);
        let mut manager = AnalysisManager::new();
        let top = module.top();
        let loops = manager.get::<LoopAnalysis, _>(top, move || computed).clone();

        for func in module.funcs() {
            self.run_func(module, func, &loops);
        }
        Ok(())
    }
}
