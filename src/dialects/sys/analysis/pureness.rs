//! Call-graph summaries: who calls whom (Callers), which functions may
//! write observable state (Impure), and which run at most once (Once).
//!
//! Impurity seeds are extern runtime calls, pointer-taking functions (the
//! frontend marks those) and stores through global or unknown bases; it then
//! propagates backwards over the call graph to a fixed point. Calls inherit
//! the attribute from their callee so later passes can test the call op
//! directly.

use std::collections::BTreeSet;

use crate::core::{is_extern, Attr, AttrKind, Module, OpId};
use crate::dialects::sys::analysis::memory::{base_of, Base};
use crate::dialects::sys::SysOp;

pub struct Pureness;

impl Pureness {
    pub fn run(module: &mut Module) {
        Base::run(module);

        let funcs = module.funcs();
        let fn_map = module.function_map();

        // Build the caller lists.
        let mut callers: std::collections::BTreeMap<String, Vec<String>> =
            std::collections::BTreeMap::new();
        for &func in &funcs {
            let name = module.op(func).name().to_string();
            for call in module.find_all(func, SysOp::Call) {
                let callee = module.op(call).name().to_string();
                let list = callers.entry(callee).or_default();
                if !list.contains(&name) {
                    list.push(name.clone());
                }
            }
        }
        for &func in &funcs {
            let name = module.op(func).name().to_string();
            let list = callers.get(&name).cloned().unwrap_or_default();
            module.remove_attr(func, AttrKind::Callers);
            module.add_attr(func, Attr::Callers(list));
        }

        // Seed impurity: stores through globals or untracked bases, and
        // calls into the runtime.
        let mut impure: BTreeSet<OpId> = funcs
            .iter()
            .copied()
            .filter(|&f| module.op(f).has_attr(AttrKind::Impure))
            .collect();
        for &func in &funcs {
            if impure.contains(&func) {
                continue;
            }
            let mut bad = false;
            for store in module.find_all(func, SysOp::Store) {
                let addr = module.op(store).operand(1);
                match base_of(module, addr) {
                    Some(base) => {
                        if module.op(base).kind() == SysOp::GetGlobal {
                            bad = true;
                        }
                    }
                    None => bad = true,
                }
                if bad {
                    break;
                }
            }
            if !bad {
                for call in module.find_all(func, SysOp::Call) {
                    if is_extern(module.op(call).name()) {
                        bad = true;
                        break;
                    }
                }
            }
            if bad {
                impure.insert(func);
            }
        }

        // Propagate through calls to a fixed point.
        loop {
            let mut changed = false;
            for &func in &funcs {
                if impure.contains(&func) {
                    continue;
                }
                for call in module.find_all(func, SysOp::Call) {
                    let callee = module.op(call).name();
                    let dirty = match fn_map.get(callee) {
                        Some(f) => impure.contains(f),
                        None => true,
                    };
                    if dirty {
                        impure.insert(func);
                        changed = true;
                        break;
                    }
                }
            }
            if !changed {
                break;
            }
        }

        for &func in &funcs {
            if impure.contains(&func) && !module.op(func).has_attr(AttrKind::Impure) {
                module.add_attr(func, Attr::Impure);
            }
        }

        // Tag call sites from their callee's summary.
        let top = module.top();
        for call in module.find_all(top, SysOp::Call) {
            module.remove_attr(call, AttrKind::Impure);
            let name = module.op(call).name().to_string();
            let dirty = match fn_map.get(&name) {
                Some(f) => impure.contains(f),
                None => true,
            };
            if dirty {
                module.add_attr(call, Attr::Impure);
            }
        }

        Self::mark_once(module);
    }

    /// A function runs at most once when its only call site sits straight in
    /// `main`'s body (or in another at-most-once function), outside every
    /// loop. EarlyInline uses the marker to ignore its size limit.
    fn mark_once(module: &mut Module) {
        let funcs = module.funcs();
        let fn_map = module.function_map();
        for &func in &funcs {
            module.remove_attr(func, AttrKind::Once);
        }

        let mut changed = true;
        while changed {
            changed = false;
            for &func in &funcs {
                let name = module.op(func).name().to_string();
                if name == "main" || module.op(func).has_attr(AttrKind::Once) {
                    continue;
                }

                let top = module.top();
                let calls: Vec<OpId> = module
                    .find_all(top, SysOp::Call)
                    .into_iter()
                    .filter(|&c| module.op(c).name() == name)
                    .collect();
                if calls.len() != 1 {
                    continue;
                }
                let call = calls[0];

                // Walk the ancestor chain: no loop may enclose the call, and
                // the enclosing function must itself run at most once.
                let mut host = None;
                let mut runner = call;
                let mut in_loop = false;
                loop {
                    let parent = module.parent_op(runner);
                    match module.op(parent).kind() {
                        crate::core::OpKind::Sys(SysOp::While)
                        | crate::core::OpKind::Sys(SysOp::For) => in_loop = true,
                        crate::core::OpKind::Sys(SysOp::Func) => {
                            host = Some(parent);
                            break;
                        }
                        crate::core::OpKind::Sys(SysOp::Module) => break,
                        _ => {}
                    }
                    runner = parent;
                }
                if in_loop {
                    continue;
                }
                let Some(host) = host else { continue };
                let host_once = module.op(host).name() == "main"
                    || module.op(host).has_attr(AttrKind::Once);
                if host_once && fn_map.contains_key(&name) {
                    module.add_attr(func, Attr::Once);
                    changed = true;
                }
            }
        }
    }
}
