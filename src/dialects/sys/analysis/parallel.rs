//! Decides which `For` loops are safe to split across threads.
//!
//! A loop qualifies when it calls nothing impure (no-store callees are
//! tolerated), never returns early, and every base that is written is
//! accessed with one subscript shape per iteration, so iterations touch
//! disjoint elements. Loads from never-written bases are always fine.

use std::collections::BTreeSet;

use rustc_hash::FxHashMap;

use crate::core::{is_extern, Attr, AttrKind, Module, OpId};
use crate::dialects::sys::analysis::memory::{
    base_of, remove_attr_rec, subscript_of, ArrayAccess, Base, NoStore,
};
use crate::dialects::sys::SysOp;

pub struct Parallelizable;

impl Parallelizable {
    pub fn run(module: &mut Module) {
        ArrayAccess::run(module);
        Base::run(module);

        for func in module.funcs() {
            let region = module.func_region(func);
            remove_attr_rec(module, region, AttrKind::Parallel);

            for bb in module.region(region).blocks().to_vec() {
                for op in module.block(bb).ops().to_vec() {
                    if module.op(op).kind() == SysOp::For {
                        Self::run_loop(module, op, 0);
                    }
                }
            }
        }
    }

    fn run_loop(module: &mut Module, looop: OpId, depth: usize) {
        NoStore::run(module);
        let fn_map = module.function_map();

        // Deeper loops first.
        let entry = module.region(module.op(looop).region(0)).first_block();
        for op in module.block(entry).ops().to_vec() {
            if module.op(op).kind() == SysOp::For {
                Self::run_loop(module, op, depth + 1);
            }
        }

        // Impure calls disqualify unless the callee provably never stores.
        for call in module.find_all(looop, SysOp::Call) {
            if !module.op(call).has_attr(AttrKind::Impure) {
                continue;
            }
            let name = module.op(call).name().to_string();
            if is_extern(&name) {
                return;
            }
            match fn_map.get(&name) {
                Some(&f) if module.op(f).has_attr(AttrKind::NoStore) => {}
                _ => return,
            }
        }

        // No early returns.
        if !module.find_all(looop, SysOp::Return).is_empty() {
            return;
        }

        // Group accesses by base: (address, is_store) pairs.
        let mut access: FxHashMap<OpId, Vec<(OpId, bool)>> = FxHashMap::default();
        for store in module.find_all(looop, SysOp::Store) {
            let addr = module.op(store).operand(1);
            let Some(base) = base_of(module, addr) else { return };
            access.entry(base).or_default().push((addr, true));
        }
        for load in module.find_all(looop, SysOp::Load) {
            let addr = module.op(load).operand(0);
            let Some(base) = base_of(module, addr) else { return };
            access.entry(base).or_default().push((addr, false));
        }

        // Scalar stores directly in the loop body (not nested deeper).
        let mut direct_stores: BTreeSet<OpId> = BTreeSet::new();
        for op in module.block(entry).ops().to_vec() {
            if module.op(op).kind() == SysOp::Store {
                let addr = module.op(op).operand(1);
                if let Some(base) = base_of(module, addr) {
                    direct_stores.insert(base);
                }
            }
        }

        let mut bases: Vec<OpId> = access.keys().copied().collect();
        bases.sort();
        for base in bases {
            let group = &access[&base];
            let (addr0, _) = group[0];

            let Some(sub0) = subscript_of(module, addr0, depth + 1) else {
                // A scalar. Accepted if it lives only in deeper nests, or is
                // never stored.
                if !direct_stores.contains(&addr0) {
                    continue;
                }
                if group.iter().any(|&(_, is_store)| is_store) {
                    return;
                }
                continue;
            };

            // Read-only arrays are always fine.
            if !group.iter().any(|&(_, is_store)| is_store) {
                continue;
            }

            // Every access must carry the same coefficient for this loop's
            // depth and the same normalized constant term.
            let n = sub0[depth];
            let v = if n != 0 { sub0.last().unwrap() / (n / 4).max(1) } else { -1 };
            for &(addr, _) in group {
                let Some(sub) = subscript_of(module, addr, depth + 1) else { return };
                let n2 = sub[depth];
                let v2 = if n2 != 0 { sub.last().unwrap() / (n2 / 4).max(1) } else { -1 };
                if n2 != n || v2 != v {
                    return;
                }
            }
        }

        // Iterations may not read a location before this iteration's write:
        // the first access to every written base must be the store.
        let mut order: Vec<(OpId, OpId, bool)> = Vec::new();
        collect_accesses(module, looop, &mut order);
        let mut stored_first: BTreeSet<OpId> = BTreeSet::new();
        for (base, _, is_store) in &order {
            if *is_store {
                stored_first.insert(*base);
            } else if access.get(base).map_or(false, |g| g.iter().any(|&(_, s)| s))
                && !stored_first.contains(base)
                && subscript_of(module, *base, depth + 1).is_none()
            {
                return;
            }
        }

        module.add_attr(looop, Attr::Parallel);
    }
}

fn collect_accesses(module: &Module, root: OpId, out: &mut Vec<(OpId, OpId, bool)>) {
    for &region in module.op(root).regions() {
        for &bb in module.region(region).blocks() {
            for &op in module.block(bb).ops() {
                match module.op(op).kind() {
                    k if k == SysOp::Store => {
                        let addr = module.op(op).operand(1);
                        if let Some(base) = base_of(module, addr) {
                            out.push((base, op, true));
                        }
                    }
                    k if k == SysOp::Load => {
                        let addr = module.op(op).operand(0);
                        if let Some(base) = base_of(module, addr) {
                            out.push((base, op, false));
                        }
                    }
                    _ => {}
                }
                collect_accesses(module, op, out);
            }
        }
    }
}
