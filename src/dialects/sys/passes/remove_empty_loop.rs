//! Deletes flattened loops with no observable work: no stores, no impure
//! calls, and no value used outside the loop. Predecessors are reconnected
//! straight to the exit.

use color_eyre::Report;

use crate::core::{Attr, AttrKind, Module, OpKind, Pass};
use crate::dialects::sys::analysis::LoopForest;
use crate::dialects::sys::SysOp;

#[derive(Default)]
pub struct RemoveEmptyLoop {
    removed: usize,
}

impl RemoveEmptyLoop {
    fn run_loop(
        &mut self,
        module: &mut Module,
        info: &crate::dialects::sys::analysis::LoopInfo,
    ) -> bool {
        if info.exits.len() != 1 {
            return false;
        }

        for &bb in &info.blocks {
            for &op in module.block(bb).ops() {
                let kind = module.op(op).kind();
                let side_effect = kind == OpKind::Sys(SysOp::Store)
                    || (kind == OpKind::Sys(SysOp::Call)
                        && module.op(op).has_attr(AttrKind::Impure));
                if side_effect {
                    return false;
                }
                for &user in module.op(op).uses() {
                    if module.op(user).parent().is_some_and(|p| !info.contains(p)) {
                        return false;
                    }
                }
            }
        }

        let header = info.header;
        let exit = info.exit();
        for pred in module.block(header).preds.clone() {
            if info.contains(pred) {
                continue;
            }
            let term = module.block(pred).last_op();
            if module.op(term).find_attr(AttrKind::Target).is_some()
                && module.op(term).target() == header
            {
                module.put_attr(term, Attr::Target(exit));
            }
            if module.op(term).find_attr(AttrKind::Else).is_some()
                && module.op(term).else_target() == header
            {
                module.put_attr(term, Attr::Else(exit));
            }
        }

        for &bb in &info.blocks.clone() {
            for op in module.block(bb).ops().to_vec() {
                module.remove_all_operands(op);
            }
        }
        for &bb in &info.blocks.clone() {
            module.force_erase_block(bb);
        }

        self.removed += 1;
        true
    }
}

impl Pass for RemoveEmptyLoop {
    fn name(&self) -> &'static str {
        "remove-empty-loop"
    }

    fn stats(&self) -> Vec<(&'static str, usize)> {
        vec![("removed-loops", self.removed)]
    }

    fn run(&mut self, module: &mut Module) -> Result<(), Report> {
        for func in module.funcs() {
            let region = module.func_region(func);
            let mut forest = LoopForest::analyze(module, region);

            loop {
                let mut changed = false;
                for idx in 0..forest.loops.len() {
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
