//! Hoists every alloca into a dedicated entry block at the top of each
//! function, so later passes can treat "the alloca block" as an invariant.

use color_eyre::Report;

use crate::core::{Module, Pass};
use crate::dialects::sys::SysOp;

#[derive(Default)]
pub struct MoveAlloca;

impl MoveAlloca {
    pub fn apply(module: &mut Module) {
        for func in module.funcs() {
            let allocas = module.find_all(func, SysOp::Alloca);
            let region = module.func_region(func);
            let first = module.region(region).first_block();
            let begin = module.insert_block_before(first);
            for alloca in allocas {
                module.move_op_to_end(alloca, begin);
            }
        }
    }
}

impl Pass for MoveAlloca {
    fn name(&self) -> &'static str {
        "move-alloca"
    }

    fn run(&mut self, module: &mut Module) -> Result<(), Report> {
        MoveAlloca::apply(module);
        Ok(())
    }
}
