//! Inlines small (or at-most-once) non-recursive functions while control
//! flow is still structured. Multiple returns are only handled in the one
//! common shape the frontend produces, two returns in the two arms of a
//! final `If`, which are commoned through an alloca plus an epilogue load.

use color_eyre::Report;
use rustc_hash::FxHashMap;

use crate::core::{Attr, AttrKind, Builder, Module, OpId, Pass, Ty};
use crate::dialects::sys::passes::move_alloca::MoveAlloca;
use crate::dialects::sys::SysOp;

#[derive(Default)]
pub struct EarlyInline;

fn is_recursive(module: &Module, func: OpId) -> bool {
    let name = module.op(func).name().to_string();
    module
        .find_all(func, SysOp::Call)
        .iter()
        .any(|&call| module.op(call).name() == name)
}

pub fn opcount(module: &Module, region: crate::core::RegionId) -> usize {
    let mut total = 0;
    for &bb in module.region(region).blocks() {
        total += module.block(bb).op_count();
        for &op in module.block(bb).ops() {
            for &sub in module.op(op).regions() {
                total += opcount(module, sub);
            }
        }
    }
    total
}

/// Deep-copies `op` (with regions) at the current cursor, recording every
/// clone in `map`.
fn deep_copy(b: &mut Builder, op: OpId, map: &mut FxHashMap<OpId, OpId>) {
    let copied = b.copy(op);
    map.insert(op, copied);

    for region in b.module.op(op).regions().to_vec() {
        b.scoped(|b| {
            let entry = b.module.region(region).first_block();
            let cregion = b.module.append_region(copied);
            let centry = b.module.append_block(cregion);
            b.set_to_block_start(centry);
            for inner in b.module.block(entry).ops().to_vec() {
                deep_copy(b, inner, map);
            }
        });
    }
}

impl Pass for EarlyInline {
    fn name(&self) -> &'static str {
        "early-inline"
    }

    fn run(&mut self, module: &mut Module) -> Result<(), Report> {
        for func in module.funcs() {
            let region = module.func_region(func);

            if opcount(module, region) >= 200 && !module.op(func).has_attr(AttrKind::Once) {
                continue;
            }
            if is_recursive(module, func) {
                continue;
            }

            // Structured control flow can't express arbitrary returns.
            let rets = module.find_all(func, SysOp::Return);
            if rets.len() > 1 {
                // The inlinable exception: both returns fill the two arms of
                // a trailing If. Sink them through an alloca.
                let p1 = module.parent_op(rets[0]);
                let p2 = module.parent_op(rets[1]);
                let sinkable = rets.len() == 2
                    && module.at_back(rets[0])
                    && module.at_back(rets[1])
                    && p1 == p2
                    && module.at_back(p1)
                    && module.parent_op(p1) == func;
                if !sinkable {
                    continue;
                }

                let ret_ty = module.op(rets[0]).result_ty();
                let mut b = Builder::new(module);
                b.set_before_op(p1);
                let alloca = b.create(SysOp::Alloca, &[], vec![Attr::Size(4)]);
                let value_ty = b.module.op(rets[0]).operand(0);
                let fp = b.module.op(value_ty).result_ty() == Ty::F32;
                if fp {
                    b.module.add_attr(alloca, Attr::Fp);
                }
                for &ret in &rets[..2] {
                    let value = b.module.op(ret).operand(0);
                    b.replace(ret, SysOp::Store, &[value, alloca], vec![Attr::Size(4)]);
                }
                b.set_after_op(p1);
                let load = b.create_ty(ret_ty, SysOp::Load, &[alloca], vec![Attr::Size(4)]);
                b.create(SysOp::Return, &[load], vec![]);
            } else if rets.len() == 1 {
                let last = module.region(region).last_block();
                if module.op(rets[0]).parent() != Some(last) {
                    continue;
                }
            }

            // Rewrite every call site.
            let name = module.op(func).name().to_string();
            let top = module.top();
            for call in module.find_all(top, SysOp::Call) {
                if module.is_dead(call) || module.op(call).name() != name {
                    continue;
                }

                let mut clone_map: FxHashMap<OpId, OpId> = FxHashMap::default();
                let mut b = Builder::new(module);
                b.set_before_op(call);
                for bb in b.module.region(region).blocks().to_vec() {
                    for op in b.module.block(bb).ops().to_vec() {
                        deep_copy(&mut b, op, &mut clone_map);
                    }
                }

                // Rewire cloned operands, and pick out getargs/return.
                let mut getargs = Vec::new();
                let mut ret = None;
                let clones: Vec<(OpId, OpId)> =
                    clone_map.iter().map(|(&k, &v)| (k, v)).collect();
                for &(_, v) in &clones {
                    match module.op(v).kind() {
                        k if k == SysOp::GetArg => getargs.push(v),
                        k if k == SysOp::Return => ret = Some(v),
                        _ => {}
                    }
                    for i in 0..module.op(v).operand_count() {
                        let def = module.op(v).operand(i);
                        let mapped = clone_map[&def];
                        module.set_operand(v, i, mapped);
                    }
                }

                // Feed actual arguments through. A single-store alloca lets
                // us forward straight into the loads.
                for get in getargs {
                    let store = *module.op(get).uses().iter().next().expect("unused getarg");
                    let addr = module.op(store).operand(1);
                    let vi = module.op(get).int_val() as usize;
                    let arg = module.op(call).operand(vi);

                    let users: Vec<OpId> = module.op(addr).uses().iter().copied().collect();
                    let store_count = users
                        .iter()
                        .filter(|&&u| module.op(u).kind() == SysOp::Store)
                        .count();
                    if store_count >= 2 {
                        module.replace_op_with(get, arg);
                        continue;
                    }

                    for user in users {
                        if module.op(user).kind() == SysOp::Load {
                            module.replace_op_with(user, arg);
                        }
                    }
                    module.erase_op(store);
                    module.erase_op(addr);
                    module.erase_op(get);
                }

                if let Some(ret) = ret {
                    if module.op(ret).operand_count() > 0 {
                        let value = module.op(ret).operand(0);
                        module.replace_all_uses_with(call, value);
                    }
                    module.erase_op(ret);
                }
                module.erase_op(call);
            }
        }

        MoveAlloca::apply(module);
        Ok(())
    }
}
