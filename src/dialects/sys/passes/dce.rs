//! Erases pure ops whose results are unused, to a fixed point. Control
//! flow, memory writes and impure calls stay; a pure call with no uses
//! goes like any other value.

use color_eyre::Report;

use crate::core::{AttrKind, Module, OpId, OpKind, Pass};
use crate::dialects::sys::SysOp;

#[derive(Default)]
pub struct Dce {
    erased: usize,
}

fn removable(module: &Module, op: OpId) -> bool {
    match module.op(op).kind() {
        OpKind::Sys(SysOp::Call) => !module.op(op).has_attr(AttrKind::Impure),
        OpKind::Sys(k) => k.is_pure() || k == SysOp::Alloca,
        _ => false,
    }
}

impl Dce {
    pub fn apply(module: &mut Module) -> usize {
        let mut erased = 0;
        loop {
            let mut changed = false;
            let mut all = Vec::new();
            collect(module, module.top(), &mut all);
            for op in all {
                if module.is_dead(op) {
                    continue;
                }
                if removable(module, op) && module.op(op).uses().is_empty() {
                    module.erase_op(op);
                    erased += 1;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        erased
    }
}

fn collect(module: &Module, root: OpId, out: &mut Vec<OpId>) {
    for &region in module.op(root).regions() {
        for &bb in module.region(region).blocks() {
            for &op in module.block(bb).ops() {
                collect(module, op, out);
                out.push(op);
            }
        }
    }
}

impl Pass for Dce {
    fn name(&self) -> &'static str {
        "dce"
    }

    fn stats(&self) -> Vec<(&'static str, usize)> {
        vec![("erased-ops", self.erased)]
    }

    fn run(&mut self, module: &mut Module) -> Result<(), Report> {
        self.erased += Dce::apply(module);
        Ok(())
    }
}
