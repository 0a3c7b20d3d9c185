//! Tail-call elimination on structured IR.
//!
//! Direct `return f(args)` tails become a `While` that stores the new
//! arguments and continues. `return x + f(args)` is handled as an
//! accumulator: one alloca collects the additions, every plain return adds
//! the accumulator in, and the recursive site stores-and-continues. The
//! general commutative-monoid machinery is not needed for this source
//! language.

use color_eyre::Report;

use crate::core::{Attr, AttrKind, Builder, Module, OpId, Pass, RegionId, Ty};
use crate::dialects::sys::SysOp;

#[derive(Default)]
pub struct Tco {
    uncalled: usize,
}

impl Tco {
    /// Wraps the whole body of `func` in a `While (true)`, pulling allocas
    /// and getargs out into a fresh entry block. Returns the body region of
    /// the new loop.
    fn wrap_in_loop(
        module: &mut Module,
        func: OpId,
        allocas_by_arg: &mut Vec<Option<OpId>>,
    ) -> RegionId {
        let region = module.func_region(func);

        let tail = module.append_block(region);
        let mut b = Builder::new(module);
        b.set_to_block_start(tail);
        let looop = b.create(SysOp::While, &[], vec![]);
        let before = module.append_region(looop);
        let after = module.append_region(looop);
        // Stays empty; Remerge folds it away later.
        let _after_entry = module.append_block(after);

        for bb in module.region(region).blocks().to_vec() {
            if bb != tail {
                module.move_block_to_end(bb, after);
            }
        }

        let argcnt = module.op(func).arg_count();
        allocas_by_arg.resize(argcnt, None);

        let new_entry = module.append_block(region);
        module.move_block_before(new_entry, tail);

        for getarg in module.find_all(func, SysOp::GetArg) {
            // Before mem2reg a getarg's only use is its store into an alloca.
            let store = *module.op(getarg).uses().iter().next().expect("unused getarg");
            let addr = module.op(store).operand(1);
            allocas_by_arg[module.op(getarg).int_val() as usize] = Some(addr);

            module.move_op_to_end(getarg, new_entry);
            module.move_op_to_end(store, new_entry);
        }
        for alloca in module.find_all(func, SysOp::Alloca) {
            module.move_op_to_start(alloca, new_entry);
        }

        // The before region is just "true".
        let cond_bb = module.append_block(before);
        let mut b = Builder::new(module);
        b.set_to_block_start(cond_bb);
        let t = b.create(SysOp::Int, &[], vec![Attr::Int(1)]);
        b.create(SysOp::Proceed, &[t], vec![]);

        // Drop blocks the splice emptied.
        for bb in module.region(region).blocks().to_vec() {
            if module.block(bb).op_count() == 0 {
                module.erase_block(bb);
            }
        }
        after
    }

    fn run_direct(&mut self, module: &mut Module, func: OpId) -> bool {
        let name = module.op(func).name().to_string();

        let rets = module.find_all(func, SysOp::Return);
        let mut has_call_ret = false;
        for &ret in &rets {
            if module.op(ret).operand_count() == 0 {
                return false;
            }
            let def = module.op(ret).operand(0);
            if module.op(def).kind() == SysOp::Call {
                if module.op(def).name() != name || Some(def) != module.prev_op(ret) {
                    return false;
                }
                has_call_ret = true;
            }
        }
        if !has_call_ret {
            return false;
        }

        self.uncalled += 1;
        let mut allocas = Vec::new();
        Self::wrap_in_loop(module, func, &mut allocas);

        for ret in rets {
            let def = module.op(ret).operand(0);
            if module.op(def).kind() != SysOp::Call {
                continue;
            }
            // Store the arguments into their allocas and continue.
            for i in 0..module.op(def).operand_count() {
                if let Some(Some(addr)) = allocas.get(i) {
                    let arg = module.op(def).operand(i);
                    let addr = *addr;
                    let mut b = Builder::new(module);
                    b.set_before_op(def);
                    b.create(SysOp::Store, &[arg, addr], vec![Attr::Size(4)]);
                }
            }
            let mut b = Builder::new(module);
            b.replace(ret, SysOp::Continue, &[], vec![]);
            module.erase_op(def);
        }
        true
    }

    fn run_accumulator(&mut self, module: &mut Module, func: OpId) -> bool {
        let name = module.op(func).name().to_string();

        let rets = module.find_all(func, SysOp::Return);
        let mut continuation = None;
        let mut replace = None;
        let mut accret = None;
        for &ret in &rets {
            if module.op(ret).operand_count() == 0 {
                return false;
            }
            let def = module.op(ret).operand(0);
            if module.op(def).kind() != SysOp::AddI {
                continue;
            }
            let x = module.op(def).operand(0);
            let y = module.op(def).operand(1);
            if module.op(x).kind() == SysOp::Call {
                if continuation.is_some()
                    || module.op(x).name() != name
                    || Some(def) != module.prev_op(ret)
                    || module.op(def).uses().len() > 1
                {
                    return false;
                }
                continuation = Some(y);
                replace = Some(x);
                accret = Some(ret);
            }
        }
        let (Some(continuation), Some(replace), Some(accret)) = (continuation, replace, accret)
        else {
            return false;
        };

        self.uncalled += 1;

        // The accumulator alloca starts at zero, outside the loop.
        let region = module.func_region(func);
        let first = module.region(region).first_block();
        let mut b = Builder::new(module);
        b.set_to_block_start(first);
        let accum = b.create(SysOp::Alloca, &[], vec![Attr::Size(4)]);
        let zero = b.create(SysOp::Int, &[], vec![Attr::Int(0)]);
        b.create(SysOp::Store, &[zero, accum], vec![Attr::Size(4)]);

        let mut allocas = Vec::new();
        Self::wrap_in_loop(module, func, &mut allocas);

        // Plain returns add the accumulator in.
        for &ret in &rets {
            if ret == accret {
                continue;
            }
            let def = module.op(ret).operand(0);
            let mut b = Builder::new(module);
            b.set_before_op(ret);
            let acc = b.create_ty(Ty::I32, SysOp::Load, &[accum], vec![Attr::Size(4)]);
            let sum = b.create(SysOp::AddI, &[acc, def], vec![]);
            module.set_operand(ret, 0, sum);
        }

        // The recursive site: store new args, bump the accumulator, go on.
        for i in 0..module.op(replace).operand_count() {
            if let Some(Some(addr)) = allocas.get(i) {
                let arg = module.op(replace).operand(i);
                let addr = *addr;
                let mut b = Builder::new(module);
                b.set_before_op(accret);
                b.create(SysOp::Store, &[arg, addr], vec![Attr::Size(4)]);
            }
        }
        let def = module.op(accret).operand(0);
        let mut b = Builder::new(module);
        b.set_before_op(accret);
        let acc = b.create_ty(Ty::I32, SysOp::Load, &[accum], vec![Attr::Size(4)]);
        let sum = b.create(SysOp::AddI, &[acc, continuation], vec![]);
        b.create(SysOp::Store, &[sum, accum], vec![Attr::Size(4)]);

        let mut b = Builder::new(module);
        b.replace(accret, SysOp::Continue, &[], vec![]);
        module.erase_op(def);
        module.erase_op(replace);
        true
    }
}

impl Pass for Tco {
    fn name(&self) -> &'static str {
        "tco"
    }

    fn stats(&self) -> Vec<(&'static str, usize)> {
        vec![("removed-calls", self.uncalled)]
    }

    fn run(&mut self, module: &mut Module) -> Result<(), Report> {
        for func in module.funcs() {
            // The pureness pass has already built the call graph.
            let Some(Attr::Callers(callers)) = module.op(func).find_attr(AttrKind::Callers)
            else {
                continue;
            };
            let name = module.op(func).name();
            if !callers.iter().any(|c| c == name) {
                continue;
            }

            // Keeping many live arguments across the loop spills heavily.
            if module.op(func).arg_count() >= 16 {
                continue;
            }

            if !self.run_direct(module, func) {
                self.run_accumulator(module, func);
            }
        }
        Ok(())
    }
}
