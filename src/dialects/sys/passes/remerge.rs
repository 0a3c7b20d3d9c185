//! Collapses each region back to a single block. Before FlattenCFG there
//! are no jumps, so any block besides the entry can be folded into it; the
//! pass then recurses into nested regions and re-hoists allocas.

use color_eyre::Report;

use crate::core::{Module, Pass, RegionId};
use crate::dialects::sys::passes::move_alloca::MoveAlloca;

#[derive(Default)]
pub struct Remerge;

impl Remerge {
    fn run_region(module: &mut Module, region: RegionId) {
        let entry = module.region(region).first_block();
        let blocks = module.region(region).blocks().to_vec();
        for &bb in &blocks {
            if bb != entry {
                module.inline_to_end(bb, entry);
            }
        }
        for bb in blocks.into_iter().rev() {
            if bb != entry {
                module.erase_block(bb);
            }
        }

        for op in module.block(entry).ops().to_vec() {
            for sub in module.op(op).regions().to_vec() {
                Remerge::run_region(module, sub);
            }
        }
    }
}

impl Pass for Remerge {
    fn name(&self) -> &'static str {
        "remerge"
    }

    fn run(&mut self, module: &mut Module) -> Result<(), Report> {
        for func in module.funcs() {
            let region = module.func_region(func);
            Remerge::run_region(module, region);
        }
        MoveAlloca::apply(module);
        Ok(())
    }
}
