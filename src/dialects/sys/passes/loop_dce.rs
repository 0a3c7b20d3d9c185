//! Drops structured `For` loops that compute nothing: pure bodies collapse
//! to a final store of the bound into the induction slot, and parallel
//! loops with an unused induction variable are flattened into their body
//! once (each iteration repeats identical work).

use color_eyre::Report;

use crate::core::{Attr, AttrKind, Builder, Module, OpId, Pass, RegionId};
use crate::dialects::sys::SysOp;

#[derive(Default)]
pub struct LoopDce {
    erased: usize,
}

fn pure(module: &Module, region: RegionId) -> bool {
    let Some(&entry) = module.region(region).blocks().first() else {
        return true;
    };
    for &op in module.block(entry).ops() {
        if module.op(op).has_attr(AttrKind::Impure) {
            return false;
        }
        if matches!(module.op(op).kind(), crate::core::OpKind::Sys(SysOp::Store)) {
            return false;
        }
        for &sub in module.op(op).regions() {
            if !pure(module, sub) {
                return false;
            }
        }
    }
    true
}

impl Pass for LoopDce {
    fn name(&self) -> &'static str {
        "loop-dce"
    }

    fn stats(&self) -> Vec<(&'static str, usize)> {
        vec![("erased-loops", self.erased)]
    }

    fn run(&mut self, module: &mut Module) -> Result<(), Report> {
        loop {
            let mut changed = false;
            let top = module.top();
            let loops: Vec<OpId> = module.find_all(top, SysOp::For);
            for looop in loops {
                if module.is_dead(looop) {
                    continue;
                }
                let region = module.op(looop).region(0);
                if pure(module, region) {
                    let step = module.op(looop).operand(2);
                    if module.op(step).kind() != SysOp::Int || module.op(step).int_val() != 1 {
                        continue;
                    }
                    // The induction value may only be consumed by the body
                    // that is about to go away with the loop.
                    let escapes = module
                        .op(looop)
                        .uses()
                        .iter()
                        .any(|&u| !module.inside(u, looop));
                    if escapes {
                        continue;
                    }
                    let stop = module.op(looop).operand(1);
                    let iv_addr = module.op(looop).operand(3);
                    let mut b = Builder::new(module);
                    b.set_after_op(looop);
                    b.create(SysOp::Store, &[stop, iv_addr], vec![Attr::Size(4)]);
                    module.erase_op(looop);
                    changed = true;
                    self.erased += 1;
                    continue;
                }

                if module.op(looop).has_attr(AttrKind::Parallel)
                    && module.op(looop).uses().is_empty()
                {
                    if !module.region(region).blocks().is_empty() {
                        let entry = module.region(region).first_block();
                        module.inline_before(entry, looop);
                    }
                    module.erase_op(looop);
                    changed = true;
                    self.erased += 1;
                    break;
                }
            }
            if !changed {
                break;
            }
        }
        Ok(())
    }
}
