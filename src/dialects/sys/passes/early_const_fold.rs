//! Constant folding before the CFG is flattened: runs the regular folder,
//! collapses single-store constant allocas, folds loads of provably
//! constant globals (including constant-offset element reads) and removes
//! `If` ops whose condition became a literal.

use std::collections::BTreeSet;

use color_eyre::Report;

use crate::core::{is_extern, Attr, AttrKind, Builder, Module, OpId, Pass};
use crate::dialects::sys::passes::regular_fold::RegularFold;
use crate::dialects::sys::SysOp;

pub struct EarlyConstFold {
    folded: usize,
    /// Before the pureness analysis all calls must be assumed impure.
    before_pureness: bool,
}

impl EarlyConstFold {
    pub fn new(before_pureness: bool) -> EarlyConstFold {
        EarlyConstFold { folded: 0, before_pureness }
    }

    /// Whether the value at this address (or any address derived from it)
    /// is ever overwritten or escapes.
    fn has_stores_to(module: &Module, op: OpId) -> bool {
        for &user in module.op(op).uses() {
            match module.op(user).kind() {
                k if k == SysOp::Store => return true,
                k if k == SysOp::AddI || k == SysOp::AddL => {
                    if Self::has_stores_to(module, user) {
                        return true;
                    }
                }
                k if k == SysOp::Load => {}
                // Anything else means it isn't used purely as an address.
                _ => return false,
            }
        }
        false
    }

    fn fold_ifs(&mut self, module: &mut Module) -> usize {
        let mut folded = RegularFold::apply(module);

        loop {
            let mut changed = false;
            let top = module.top();
            for op in module.find_all(top, SysOp::If) {
                if module.is_dead(op) {
                    continue;
                }
                let cond = module.op(op).operand(0);
                if module.op(cond).kind() != SysOp::Int {
                    continue;
                }

                folded += 1;
                changed = true;
                let keep = if module.op(cond).int_val() != 0 { 0 } else { 1 };
                // The else clause can be absent.
                if module.op(op).regions().len() > keep {
                    let region = module.op(op).region(keep);
                    for bb in module.region(region).blocks().to_vec() {
                        for inner in module.block(bb).ops().to_vec() {
                            module.move_op_before(inner, op);
                        }
                    }
                }
                // A rewriter won't do: erasing this If can recursively
                // delete other Ifs from the same worklist.
                module.erase_op(op);
                break;
            }
            if !changed {
                break;
            }
        }
        folded
    }
}

impl Pass for EarlyConstFold {
    fn name(&self) -> &'static str {
        "early-const-fold"
    }

    fn stats(&self) -> Vec<(&'static str, usize)> {
        vec![("folded-ops", self.folded)]
    }

    fn run(&mut self, module: &mut Module) -> Result<(), Report> {
        let top = module.top();
        let g_map = module.global_map();
        let fn_map = module.function_map();

        // Globals that are written somewhere, or passed into an impure call.
        let mut non_const: BTreeSet<OpId> = BTreeSet::new();
        for get in module.find_all(top, SysOp::GetGlobal) {
            let name = module.op(get).name().to_string();
            let Some(&global) = g_map.get(&name) else { continue };
            if Self::has_stores_to(module, get) {
                non_const.insert(global);
                continue;
            }
            for &user in module.op(get).uses() {
                if module.op(user).kind() != SysOp::Call {
                    continue;
                }
                let callee = module.op(user).name();
                let dirty = self.before_pureness
                    || is_extern(callee)
                    || fn_map
                        .get(callee)
                        .is_some_and(|&f| module.op(f).has_attr(AttrKind::Impure));
                if dirty {
                    non_const.insert(global);
                    break;
                }
            }
        }

        loop {
            let mut folded = 0;

            // Constant-initialized single-store allocas become the constant.
            for alloca in module.find_all(top, SysOp::Alloca) {
                if module.is_dead(alloca) {
                    continue;
                }
                let users: Vec<OpId> = module.op(alloca).uses().iter().copied().collect();
                let mut store = None;
                let mut good = true;
                for &user in &users {
                    match module.op(user).kind() {
                        k if k == SysOp::Load => {}
                        k if k == SysOp::Store
                            && module.op(user).operand(1) == alloca
                            && store.is_none() =>
                        {
                            store = Some(user)
                        }
                        // An array, or the address escapes.
                        _ => {
                            good = false;
                            break;
                        }
                    }
                }
                let Some(store) = store else { continue };
                if !good {
                    continue;
                }

                let def = module.op(store).operand(0);
                // GetArgs stay: many pre-passes pattern-match against them.
                let dkind = module.op(def).kind();
                if dkind == SysOp::Load || dkind == SysOp::Call || dkind == SysOp::GetArg {
                    continue;
                }

                for user in users {
                    if module.op(user).kind() == SysOp::Load {
                        module.replace_op_with(user, def);
                    }
                }
                module.erase_op(store);
                module.erase_op(alloca);
                folded += 1;
            }

            // New constants may unlock branch folds, and vice versa.
            folded += self.fold_ifs(module);

            // Loads of constant globals, direct or at constant offsets.
            for get in module.find_all(top, SysOp::GetGlobal) {
                if module.is_dead(get) {
                    continue;
                }
                let name = module.op(get).name().to_string();
                let Some(&global) = g_map.get(&name) else { continue };
                if non_const.contains(&global) {
                    continue;
                }

                let const_at = |m: &mut Module, at: OpId, offset: usize| -> OpId {
                    let mut b = Builder::new(m);
                    b.set_before_op(at);
                    match b.module.op(global).find_attr(AttrKind::IntArray) {
                        Some(Attr::IntArray(vs)) => {
                            let v = vs[offset];
                            b.create(SysOp::Int, &[], vec![Attr::Int(v)])
                        }
                        _ => {
                            let Attr::FloatArray(vs) =
                                b.module.op(global).attr(AttrKind::FloatArray)
                            else {
                                unreachable!()
                            };
                            let v = vs[offset];
                            b.create(SysOp::Float, &[], vec![Attr::Float(v)])
                        }
                    }
                };

                for user in module.op(get).uses().iter().copied().collect::<Vec<_>>() {
                    let ukind = module.op(user).kind();
                    assert!(ukind != SysOp::Store, "store into a constant global");

                    if ukind == SysOp::Load {
                        folded += 1;
                        let value = const_at(module, user, 0);
                        module.replace_op_with(user, value);
                        continue;
                    }

                    if ukind == SysOp::AddL {
                        let y = module.op(user).operand(1);
                        if module.op(y).kind() != SysOp::Int {
                            continue;
                        }
                        for target in
                            module.op(user).uses().iter().copied().collect::<Vec<_>>()
                        {
                            assert!(module.op(target).kind() != SysOp::Store);

                            let size = module.op(global).size();
                            let byte_off = module.op(y).int_val();
                            if byte_off as usize >= size {
                                tracing::warn!(
                                    global = %name,
                                    subscript = byte_off / 4,
                                    "out of bounds access"
                                );
                                continue;
                            }
                            if module.op(target).kind() == SysOp::Load {
                                folded += 1;
                                let value = const_at(module, user, byte_off as usize / 4);
                                module.replace_op_with(target, value);
                            }
                        }
                    }
                }
            }

            // Unused getglobals affect the pureness analysis; don't leave
            // them to DCE.
            for get in module.find_all(top, SysOp::GetGlobal) {
                if !module.is_dead(get) && module.op(get).uses().is_empty() {
                    module.erase_op(get);
                }
            }

            self.folded += folded;
            if folded == 0 {
                break;
            }
        }
        Ok(())
    }
}
