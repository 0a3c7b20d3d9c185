//! Destructs structured `For` ops back into `While` form right before CFG
//! flattening: the induction variable returns to memory, every exit path
//! stores the incremented value, and the condition region reloads it.

use color_eyre::Report;

use crate::core::{Attr, Builder, Module, Pass, Ty};
use crate::dialects::sys::SysOp;

#[derive(Default)]
pub struct LowerFor;

impl Pass for LowerFor {
    fn name(&self) -> &'static str {
        "lower-for"
    }

    fn run(&mut self, module: &mut Module) -> Result<(), Report> {
        let top = module.top();
        for looop in module.find_all(top, SysOp::For) {
            let iv_addr = module.op(looop).operand(3);
            let start = module.op(looop).operand(0);
            let stop = module.op(looop).operand(1);
            let incr = module.op(looop).operand(2);
            let region = module.op(looop).region(0);

            // The body now reads the induction variable from memory.
            let mut b = Builder::new(module);
            b.set_to_region_start(region);
            let iv = b.create_ty(Ty::I32, SysOp::Load, &[iv_addr], vec![Attr::Size(4)]);
            module.replace_all_uses_with(looop, iv);

            // Store the increment before every break/continue and at the
            // region end.
            let mut exits = module.find_all(looop, SysOp::Break);
            exits.extend(module.find_all(looop, SysOp::Continue));
            for op in exits {
                let mut b = Builder::new(module);
                b.set_before_op(op);
                let add = b.create(SysOp::AddI, &[iv, incr], vec![]);
                b.create(SysOp::Store, &[add, iv_addr], vec![Attr::Size(4)]);
            }
            let last = module.region(region).last_block();
            let mut b = Builder::new(module);
            b.set_to_block_end(last);
            let add = b.create(SysOp::AddI, &[iv, incr], vec![]);
            b.create(SysOp::Store, &[add, iv_addr], vec![Attr::Size(4)]);

            // Wrap everything into a while.
            let mut b = Builder::new(module);
            b.set_before_op(looop);
            let wloop = b.create(SysOp::While, &[], vec![]);
            let before = module.append_region(wloop);
            let after = module.append_region(wloop);

            for bb in module.region(region).blocks().to_vec() {
                module.move_block_to_end(bb, after);
            }

            let cond_bb = module.append_block(before);
            let mut b = Builder::new(module);
            b.set_to_block_start(cond_bb);
            let load = b.create_ty(Ty::I32, SysOp::Load, &[iv_addr], vec![Attr::Size(4)]);
            let lt = b.create(SysOp::Lt, &[load, stop], vec![]);
            b.create(SysOp::Proceed, &[lt], vec![]);

            let mut b = Builder::new(module);
            b.set_before_op(wloop);
            b.create(SysOp::Store, &[start, iv_addr], vec![Attr::Size(4)]);

            module.erase_op(looop);
        }
        Ok(())
    }
}
