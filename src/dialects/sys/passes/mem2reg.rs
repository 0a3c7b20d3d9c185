//! SSA construction: promotes scalar allocas whose only uses are plain
//! loads and stores into values, placing phis with the standard dominance
//! frontier worklist and renaming along the dominator tree. A path that
//! never defines the value supplies zero.

use std::collections::BTreeSet;

use color_eyre::Report;
use rustc_hash::FxHashMap;

use crate::core::{Attr, AttrKind, BlockId, Builder, Module, OpId, Pass};
use crate::dialects::sys::SysOp;

#[derive(Default)]
pub struct Mem2Reg {
    promoted: usize,
    missed: usize,
}

struct State {
    converted: BTreeSet<OpId>,
    visited: BTreeSet<BlockId>,
    /// Which alloca each placed (still empty) phi stands for.
    phi_from: FxHashMap<OpId, OpId>,
    domtree: FxHashMap<BlockId, Vec<BlockId>>,
}

impl Mem2Reg {
    fn run_func(&mut self, module: &mut Module, func: OpId) {
        let region = module.func_region(func);
        module.update_dom_front(region);
        let domtree = module.dom_tree(region);

        let mut st = State {
            converted: BTreeSet::new(),
            visited: BTreeSet::new(),
            phi_from: FxHashMap::default(),
            domtree,
        };

        // Phis go where a store's dominance stops covering: at least two
        // values can reach those blocks.
        for alloca in module.find_all(func, SysOp::Alloca) {
            let mut good = true;
            for &user in module.op(alloca).uses() {
                let ukind = module.op(user).kind();
                if ukind != SysOp::Load && ukind != SysOp::Store {
                    // Address arithmetic: this is an array.
                    good = false;
                    break;
                }
                // Stored as a value: the address escapes.
                if ukind == SysOp::Store && module.op(user).operand(0) == alloca {
                    good = false;
                    break;
                }
            }
            if !good {
                self.missed += 1;
                continue;
            }
            self.promoted += 1;
            st.converted.insert(alloca);

            let mut store_blocks: BTreeSet<BlockId> = BTreeSet::new();
            for &user in module.op(alloca).uses() {
                if module.op(user).kind() == SysOp::Store {
                    store_blocks.insert(module.op(user).parent().unwrap());
                }
            }

            let mut worklist: Vec<BlockId> = store_blocks.into_iter().collect();
            let mut visited: BTreeSet<BlockId> = BTreeSet::new();
            while let Some(bb) = worklist.pop() {
                for dom in module.block(bb).dom_front().clone() {
                    if !visited.insert(dom) {
                        continue;
                    }
                    // The phi is empty for now; renaming fills it in.
                    let mut b = Builder::new(module);
                    b.set_to_block_start(dom);
                    let phi = b.create(SysOp::Phi, &[], vec![]);
                    st.phi_from.insert(phi, alloca);
                    worklist.push(dom);
                }
            }
        }

        let entry = module.region(region).first_block();
        self.fill_phi(module, &mut st, entry, FxHashMap::default());

        for &alloca in &st.converted {
            module.erase_op(alloca);
        }
    }

    fn fill_phi(
        &mut self,
        module: &mut Module,
        st: &mut State,
        bb: BlockId,
        mut symbols: FxHashMap<OpId, OpId>,
    ) {
        if !st.visited.insert(bb) {
            return;
        }

        let mut removed = Vec::new();
        for op in module.block(bb).ops().to_vec() {
            let kind = module.op(op).kind();

            // Loads become ordinary reads of the renamed value.
            if kind == SysOp::Load {
                let alloca = module.op(op).operand(0);
                if !st.converted.contains(&alloca) {
                    continue;
                }
                let value = match symbols.get(&alloca) {
                    Some(&v) => v,
                    None => {
                        // Never written on this path; zero-fill.
                        let fp = module.op(alloca).has_attr(AttrKind::Fp);
                        let mut b = Builder::new(module);
                        b.set_before_op(op);
                        let zero = if fp {
                            b.create(SysOp::Float, &[], vec![Attr::Float(0.0)])
                        } else {
                            b.create(SysOp::Int, &[], vec![Attr::Int(0)])
                        };
                        symbols.insert(alloca, zero);
                        zero
                    }
                };
                module.replace_all_uses_with(op, value);
                removed.push(op);
                continue;
            }

            // Stores mutate the symbol table.
            if kind == SysOp::Store {
                let value = module.op(op).operand(0);
                let alloca = module.op(op).operand(1);
                if !st.converted.contains(&alloca) {
                    continue;
                }
                symbols.insert(alloca, value);
                removed.push(op);
                continue;
            }

            if kind == SysOp::Phi {
                if let Some(&alloca) = st.phi_from.get(&op) {
                    symbols.insert(alloca, op);
                }
            }
        }

        // Feed this block's outgoing value into successor phis.
        for succ in module.block(bb).succs.clone() {
            for phi in module.phis(succ) {
                let Some(&alloca) = st.phi_from.get(&phi) else { continue };
                let value = match symbols.get(&alloca) {
                    Some(&v) => v,
                    None => {
                        // No value on this path; a zero at the edge's tail.
                        let term = module.block(bb).last_op();
                        let mut b = Builder::new(module);
                        b.set_before_op(term);
                        b.create(SysOp::Int, &[], vec![Attr::Int(0)])
                    }
                };
                module.push_operand(phi, value);
                module.add_attr(phi, Attr::From(bb));
            }
        }

        for op in removed {
            module.erase_op(op);
        }

        for child in st.domtree.get(&bb).cloned().unwrap_or_default() {
            self.fill_phi(module, st, child, symbols.clone());
        }
    }
}

impl Pass for Mem2Reg {
    fn name(&self) -> &'static str {
        "mem2reg"
    }

    fn stats(&self) -> Vec<(&'static str, usize)> {
        vec![("lowered-alloca", self.promoted), ("missed-alloca", self.missed)]
    }

    fn run(&mut self, module: &mut Module) -> Result<(), Report> {
        for func in module.funcs() {
            self.run_func(module, func);
        }
        Ok(())
    }
}
