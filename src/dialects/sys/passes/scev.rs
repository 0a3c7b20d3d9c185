//! Scalar-evolution rewriting.
//!
//! Induction phis receive an Increase attribute giving their per-iteration
//! polynomial (degree one from `phi + 'c`, degree two when a phi advances
//! by another induction value). Address computations (`addl`) whose offsets
//! follow a constant-stride recurrence are replaced by a preheader-seeded
//! phi bumped by the stride each iteration; a repeated `(x + y) mod 'c`
//! recurrence is turned into a 64-bit accumulation whose modulus is taken
//! once at the loop exit.

use std::collections::BTreeSet;

use color_eyre::Report;
use rustc_hash::FxHashMap;

use crate::core::{Attr, AttrKind, BlockId, Builder, Increase, Module, OpId, Pass};
use crate::dialects::sys::analysis::{LoopAnalysis, LoopForest, LoopInfo};
use crate::dialects::sys::SysOp;
use crate::matcher::{Binding, Rule};

lazy_static! {
    static ref CONST_INCR: Rule = Rule::new("(add x 'a)");
    static ref MOD_INCR: Rule = Rule::new("(mod (add x y) 'a)");
}

#[derive(Default)]
pub struct Scev {
    expanded: usize,
    /// Starting value (at loop entry) of each op we can restate.
    start: FxHashMap<OpId, OpId>,
    nochange: BTreeSet<OpId>,
    domtree: FxHashMap<BlockId, Vec<BlockId>>,
}

fn increase_of(module: &Module, op: OpId) -> Option<Increase> {
    match module.op(op).find_attr(AttrKind::Increase) {
        Some(Attr::Increase(incr)) => Some(incr.clone()),
        _ => None,
    }
}

impl Scev {
    /// Propagates Increase attrs through the block's arithmetic and rewrites
    /// qualifying `addl`s into phi + stride.
    fn rewrite(&mut self, module: &mut Module, bb: BlockId, info: &LoopInfo) {
        let preheader = info.preheader.unwrap();
        let header = info.header;
        let latch = info.latch();

        for op in module.block(bb).ops().to_vec() {
            if module.is_dead(op) || module.op(op).has_attr(AttrKind::Increase) {
                continue;
            }
            let kind = module.op(op).kind();

            if kind == SysOp::AddI || kind == SysOp::AddL || kind == SysOp::SubI {
                let mut x = module.op(op).operand(0);
                let mut y = module.op(op).operand(1);
                if increase_of(module, x).is_none() {
                    if increase_of(module, y).is_some() && kind != SysOp::SubI {
                        std::mem::swap(&mut x, &mut y);
                    } else if increase_of(module, x).is_none() {
                        continue;
                    }
                }
                let incr_x = increase_of(module, x).unwrap();

                // x +- <invariant>: same evolution, shifted start.
                let y_bb = module.op(y).parent().unwrap();
                if module.dominates(y_bb, preheader) {
                    self.start.insert(y, y);
                    module.add_attr(op, Attr::Increase(incr_x));
                    continue;
                }

                // x + y where y itself evolves: polynomials add.
                if kind != SysOp::SubI {
                    if let Some(incr_y) = increase_of(module, y) {
                        let (mut amt, amt2) = if incr_x.amt.len() >= incr_y.amt.len() {
                            (incr_x.amt.clone(), incr_y.amt.clone())
                        } else {
                            (incr_y.amt.clone(), incr_x.amt.clone())
                        };
                        for (i, v) in amt2.iter().enumerate() {
                            amt[i] += v;
                        }
                        module.add_attr(op, Attr::Increase(Increase { amt, modulus: None }));
                        continue;
                    }
                }
                continue;
            }

            if kind == SysOp::MulI {
                let mut x = module.op(op).operand(0);
                let mut y = module.op(op).operand(1);
                if increase_of(module, x).is_none() {
                    if increase_of(module, y).is_none() {
                        continue;
                    }
                    std::mem::swap(&mut x, &mut y);
                }
                // x * 'a scales the polynomial.
                if module.op(y).kind() == SysOp::Int {
                    let v = module.op(y).int_val() as i64;
                    let mut incr = increase_of(module, x).unwrap();
                    for c in incr.amt.iter_mut() {
                        *c *= v;
                    }
                    module.add_attr(op, Attr::Increase(incr));
                    self.start.insert(y, y);
                }
                continue;
            }
        }

        // Rewrite addl candidates whose operands all have known starts.
        let mut candidates = Vec::new();
        for op in module.block(bb).ops().to_vec() {
            if module.is_dead(op)
                || module.op(op).kind() == SysOp::Phi
                || !module.op(op).has_attr(AttrKind::Increase)
                || self.nochange.contains(&op)
            {
                continue;
            }
            candidates.push(op);
        }

        // Const-unroll can flood a surrounding loop with evolving addls; a
        // phi for each would defeat the point.
        let addl_count =
            candidates.iter().filter(|&&c| module.op(c).kind() == SysOp::AddL).count();
        if addl_count >= 4 {
            for op in candidates.drain(..) {
                self.nochange.insert(op);
            }
        }

        let mut produced = Vec::new();
        for op in candidates {
            let mut good = true;
            for &operand in module.op(op).operands() {
                if !self.start.contains_key(&operand) {
                    // Probably the (i + 1) of `i = i + 1`; not restatable.
                    self.nochange.insert(op);
                    good = false;
                    break;
                }
            }
            if !good {
                continue;
            }

            // The entry value: same computation over the operands' starts.
            let term = module.block(preheader).last_op();
            let mut b = Builder::new(module);
            b.set_before_op(term);
            let clone = b.copy(op);
            module.remove_all_operands(clone);
            for operand in module.op(op).operands().to_vec() {
                let s = self.start[&operand];
                module.push_operand(clone, s);
            }
            module.remove_attr(clone, AttrKind::Increase);
            self.start.insert(op, clone);
            produced.push(op);
        }

        // Memory addresses are the payoff: phi + stride replaces the chain.
        for op in produced.iter().copied().collect::<Vec<_>>() {
            if module.op(op).kind() != SysOp::AddL {
                continue;
            }
            let incr = increase_of(module, op).unwrap();
            if incr.amt.len() > 1 {
                continue;
            }

            let seed = self.start[&op];
            let mut b = Builder::new(module);
            b.set_to_block_start(header);
            let phi = b.create(SysOp::Phi, &[seed], vec![Attr::From(preheader)]);
            b.set_before_op(op);
            let vi = b.create(SysOp::Int, &[], vec![Attr::Int(incr.amt[0] as i32)]);
            let add = b.create(SysOp::AddL, &[phi, vi], vec![]);

            module.replace_op_with(op, phi);
            module.push_operand(phi, add);
            module.add_attr(phi, Attr::From(latch));
            self.expanded += 1;
        }

        for child in self.domtree.get(&bb).cloned().unwrap_or_default() {
            if info.contains(child) {
                self.rewrite(module, child, info);
            }
        }
    }

    fn run_loop(&mut self, module: &mut Module, forest: &LoopForest, idx: usize) {
        for &sub in &forest.loops[idx].subloops {
            self.run_loop(module, forest, sub);
        }
        let info = forest.loops[idx].clone();

        if info.latches.len() != 1 {
            return;
        }
        let header = info.header;
        let latch = info.latch();
        if module.op(module.block(latch).last_op()).kind() != SysOp::Branch {
            return;
        }
        if module.op(module.block(header).last_op()).kind() == SysOp::Branch && header != latch {
            return;
        }
        let Some(preheader) = info.preheader else { return };
        if info.exits.len() != 1 {
            return;
        }

        self.start.clear();
        let mut mods: Vec<OpId> = Vec::new();

        // Induction phis: `phi + 'c` gives degree one.
        for phi in module.phis(header) {
            let latchval = module.phi_from(phi, latch);
            let external = Binding::from_iter([("x".to_string(), phi)]);
            if let Some(binding) = CONST_INCR.match_only(module, latchval, &external) {
                let v = Rule::extract(&binding, "'a");
                let step = module.op(v).int_val() as i64;
                module.add_attr(phi, Attr::Increase(Increase::constant(step)));

                let start = module.phi_from(phi, preheader);
                self.start.insert(phi, start);
                // A latch value used elsewhere starts at phi + step.
                if module.op(latchval).uses().len() > 1 {
                    let mut b = Builder::new(module);
                    b.set_after_op(start);
                    let vi = b.create(SysOp::Int, &[], vec![Attr::Int(step as i32)]);
                    let add = b.create(SysOp::AddI, &[start, vi], vec![]);
                    self.start.insert(latchval, add);
                }
            }

            // Repeated `(phi + y) mod 'c`, with the increment as only use.
            if MOD_INCR.match_only(module, latchval, &external).is_some() {
                let in_loop_uses = module
                    .op(phi)
                    .uses()
                    .iter()
                    .filter(|&&u| {
                        module.op(u).parent().is_some_and(|p| info.contains(p))
                    })
                    .count();
                if in_loop_uses == 1 {
                    mods.push(phi);
                }
            }
        }

        // A phi advancing by an induction value has a degree-two evolution.
        for phi in module.phis(header) {
            let latchval = module.phi_from(phi, latch);
            let lkind = module.op(latchval).kind();
            if lkind != SysOp::AddI && lkind != SysOp::AddL {
                continue;
            }
            let mut x = module.op(latchval).operand(0);
            let mut y = module.op(latchval).operand(1);
            if y == phi {
                std::mem::swap(&mut x, &mut y);
            }
            if x != phi {
                continue;
            }
            if increase_of(module, x).is_none() {
                if let Some(incr) = increase_of(module, y) {
                    assert!(incr.amt.len() == 1, "secondary induction must be linear");
                    module.add_attr(
                        phi,
                        Attr::Increase(Increase { amt: vec![0, incr.amt[0]], modulus: None }),
                    );
                }
            }
        }

        // Phi operands keep their phi; rewriting them gains nothing.
        self.nochange.clear();
        for &bb in &info.blocks {
            for phi in module.phis(bb) {
                for &operand in module.op(phi).operands() {
                    self.nochange.insert(operand);
                }
            }
        }

        self.rewrite(module, header, &info);

        // Factor the modulus to the exit: accumulate in 64 bits inside the
        // loop (i32*i32 fits i64), reduce once outside.
        let exit = info.exit();
        let insert = module.nonphi(exit);
        let mut exit_latch: FxHashMap<OpId, OpId> = FxHashMap::default();
        for phi in module.phis(exit) {
            exit_latch.insert(module.phi_from(phi, latch), phi);
        }

        for phi in mods {
            let modval = module.phi_from(phi, latch);
            let latchphi = exit_latch
                .get(&modval)
                .or_else(|| exit_latch.get(&phi))
                .copied();
            let Some(latchphi) = latchphi else {
                tracing::warn!("modulus recurrence without an exit phi");
                continue;
            };

            let addi = module.op(modval).operand(0);
            let v = module.op(modval).operand(1);
            let modulus = module.op(v).int_val();

            let operands = module.op(addi).operands().to_vec();
            let mut b = Builder::new(module);
            let addl = b.replace(addi, SysOp::AddL, &operands, vec![]);
            module.replace_all_uses_with(modval, addl);

            let mut b = Builder::new(module);
            b.set_before_op(insert);
            let modl = b.create(SysOp::ModL, &[], vec![]);
            module.replace_all_uses_with(latchphi, modl);
            // Operands go in afterwards or the replacement would rewrite
            // them too.
            module.push_operand(modl, latchphi);
            let mut b = Builder::new(module);
            b.set_before_op(modl);
            let vi = b.create(SysOp::Int, &[], vec![Attr::Int(modulus)]);
            module.push_operand(modl, vi);

            module.erase_op(modval);
        }

        // Increase attrs are per-loop; drop them for the next analysis.
        for &bb in &info.blocks {
            for op in module.block(bb).ops().to_vec() {
                if !module.is_dead(op) {
                    module.remove_attr(op, AttrKind::Increase);
                }
            }
        }
    }
}

impl Pass for Scev {
    fn name(&self) -> &'static str {
        "scev"
    }

    fn stats(&self) -> Vec<(&'static str, usize)> {
        vec![("expanded", self.expanded)]
    }

    fn run(&mut self, module: &mut Module) -> Result<(), Report> {
        let analysis = LoopAnalysis::run(module);
        for func in module.funcs() {
            let region = module.func_region(func);
            self.domtree = module.dom_tree(region);
            let Some(forest) = analysis.forests.get(&func) else { continue };
            for root in forest.top_level() {
                self.run_loop(module, forest, root);
            }
        }
        Ok(())
    }
}
