//! Dead-code elimination over a machine dialect. The target decides which
//! ops have observable effects; everything else dies when unused, to a
//! fixed point.

use color_eyre::Report;

use crate::backend::TargetSpec;
use crate::core::{Attr, AttrKind, Module, Pass};

pub struct MachineDce {
    target: &'static dyn TargetSpec,
    eliminated: usize,
}

impl MachineDce {
    pub fn new(target: &'static dyn TargetSpec) -> MachineDce {
        MachineDce { target, eliminated: 0 }
    }
}

impl Pass for MachineDce {
    fn name(&self) -> &'static str {
        "machine-dce"
    }

    fn stats(&self) -> Vec<(&'static str, usize)> {
        vec![("eliminated-ops", self.eliminated)]
    }

    fn run(&mut self, module: &mut Module) -> Result<(), Report> {
        let funcs = module.funcs();

        // Mark once; nothing here creates new effects.
        for &func in &funcs {
            let region = module.func_region(func);
            for bb in module.region(region).blocks().to_vec() {
                for op in module.block(bb).ops().to_vec() {
                    if self.target.is_impure(module, op)
                        && !module.op(op).has_attr(AttrKind::Impure)
                    {
                        module.add_attr(op, Attr::Impure);
                    }
                }
            }
        }

        loop {
            let mut removable = Vec::new();
            for &func in &funcs {
                let region = module.func_region(func);
                for bb in module.region(region).blocks().to_vec() {
                    for op in module.block(bb).ops().to_vec() {
                        if !module.op(op).has_attr(AttrKind::Impure)
                            && module.op(op).uses().is_empty()
                        {
                            removable.push(op);
                        }
                    }
                }
            }
            if removable.is_empty() {
                break;
            }
            self.eliminated += removable.len();
            for op in removable {
                if !module.is_dead(op) {
                    module.erase_op(op);
                }
            }
        }
        Ok(())
    }
}
