//! Forwards stored scalar values to loads within a basic block, a cheap
//! precursor of memory SSA. Only 4-byte allocas with a known base qualify;
//! anything with regions or an impure call invalidates the tracked values.

use color_eyre::Report;
use rustc_hash::FxHashMap;

use crate::core::{AttrKind, Module, OpId, Pass, RegionId};
use crate::dialects::sys::analysis::{base_of, Base};
use crate::dialects::sys::SysOp;

#[derive(Default)]
pub struct TidyMemory {
    tidied: usize,
}

impl TidyMemory {
    fn run_region(&mut self, module: &mut Module, region: RegionId) {
        // Maps stored addresses to the stored value.
        let mut values: FxHashMap<OpId, OpId> = FxHashMap::default();

        for bb in module.region(region).blocks().to_vec() {
            for op in module.block(bb).ops().to_vec() {
                if module.is_dead(op) {
                    continue;
                }
                if !module.op(op).regions().is_empty() {
                    values.clear();
                    for sub in module.op(op).regions().to_vec() {
                        self.run_region(module, sub);
                    }
                    continue;
                }

                let kind = module.op(op).kind();
                if kind == SysOp::Call && module.op(op).has_attr(AttrKind::Impure) {
                    values.clear();
                    continue;
                }

                if kind == SysOp::Store {
                    let val = module.op(op).operand(0);
                    let addr = module.op(op).operand(1);
                    let vkind = module.op(val).kind();
                    if vkind == SysOp::Load || vkind == SysOp::Call || vkind == SysOp::GetArg {
                        values.remove(&addr);
                        continue;
                    }

                    // Arrays are out: without a base there is no way to tell
                    // what else aliases the slot.
                    let Some(base) = base_of(module, addr) else {
                        values.clear();
                        continue;
                    };
                    if module.op(base).kind() != SysOp::Alloca || module.op(base).size() != 4 {
                        continue;
                    }
                    values.insert(addr, val);
                    continue;
                }

                if kind == SysOp::Load {
                    let addr = module.op(op).operand(0);
                    if let Some(&val) = values.get(&addr) {
                        module.replace_op_with(op, val);
                        self.tidied += 1;
                    }
                }
            }
        }
    }
}

impl Pass for TidyMemory {
    fn name(&self) -> &'static str {
        "tidy-memory"
    }

    fn stats(&self) -> Vec<(&'static str, usize)> {
        vec![("tidied-ops", self.tidied)]
    }

    fn run(&mut self, module: &mut Module) -> Result<(), Report> {
        Base::run(module);
        for func in module.funcs() {
            let region = module.func_region(func);
            self.run_region(module, region);
        }
        Ok(())
    }
}
