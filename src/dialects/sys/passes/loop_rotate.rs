//! Rotation of counted loops: `for (i = start; i < x; i += c)` becomes a
//! guarded do-while. The preheader branches on the initial condition, the
//! header falls through, and the latch re-tests the incremented induction
//! value. Multi-latch loops first get a merged latch block.

use color_eyre::Report;
use rustc_hash::FxHashMap;

use crate::core::{Attr, AttrKind, Builder, Module, OpId, Pass};
use crate::dialects::sys::analysis::{LoopAnalysis, LoopInfo};
use crate::dialects::sys::SysOp;
use crate::matcher::{Binding, Rule};

lazy_static! {
    static ref BR_LT: Rule = Rule::new("(br (lt i x))");
    static ref BR_LE: Rule = Rule::new("(br (le i x))");
}

#[derive(Default)]
pub struct LoopRotate {
    rotated: usize,
}

impl LoopRotate {
    fn run_loop(&mut self, module: &mut Module, info: &LoopInfo) {
        let Some(induction) = info.induction else { return };
        if info.exits.len() != 1 {
            return;
        }
        let exit = info.exit();
        let header = info.header;

        // Only canonical `i < x` / `i <= x` headers rotate, with `x`
        // defined outside or hoistable.
        let term = module.block(header).last_op();
        let external = Binding::from_iter([("i".to_string(), induction)]);
        let mut le = false;
        let binding = match BR_LT.match_only(module, term, &external) {
            Some(b) => b,
            None => match BR_LE.match_only(module, term, &external) {
                Some(b) => {
                    le = true;
                    b
                }
                None => return,
            },
        };
        if module.op(term).else_target() != exit {
            return;
        }

        let latch = info.latch();
        let latchterm = module.block(latch).last_op();
        if module.op(latchterm).kind() != SysOp::Goto {
            return;
        }

        let Some(preheader) = info.preheader else { return };
        let preterm = module.block(preheader).last_op();
        if module.op(preterm).kind() != SysOp::Goto {
            return;
        }

        let upper = Rule::extract(&binding, "x");
        let upper_from = module.op(upper).parent().unwrap();
        if !module.dominates(upper_from, header) || upper_from == header {
            if module.op(upper).kind() != SysOp::Int {
                return;
            }
            module.move_op_before(upper, preterm);
        }

        self.rotated += 1;

        // Per header phi: the value arriving from the latch, and the one
        // from the preheader. Outside references switch to the latch value.
        let mut value_map: FxHashMap<OpId, OpId> = FxHashMap::default();
        let mut init_map: FxHashMap<OpId, OpId> = FxHashMap::default();
        for phi in module.phis(header) {
            if module.op(phi).operand_count() != 2 {
                continue;
            }
            let (d0, d1) = (module.op(phi).operand(0), module.op(phi).operand(1));
            if module.op(phi).from_at(0) == latch {
                value_map.insert(phi, d0);
                init_map.insert(phi, d1);
            }
            if module.op(phi).from_at(1) == latch {
                value_map.insert(phi, d1);
                init_map.insert(phi, d0);
            }
        }

        // Guard in the preheader on the initial value.
        let start = info.start.unwrap();
        let mut b = Builder::new(module);
        b.set_before_op(preterm);
        let cmp = if le {
            b.create(SysOp::Le, &[start, upper], vec![])
        } else {
            b.create(SysOp::Lt, &[start, upper], vec![])
        };
        b.replace(
            preterm,
            SysOp::Branch,
            &[cmp],
            vec![Attr::Target(header), Attr::Else(exit)],
        );

        // Header branch becomes a fall-through.
        let target = module.op(term).target();
        let mut b = Builder::new(module);
        b.replace(term, SysOp::Goto, &[], vec![Attr::Target(target)]);

        // The latch re-tests using the post-increment value.
        let iv_next = value_map[&induction];
        let mut b = Builder::new(module);
        b.set_before_op(latchterm);
        let cmp = if le {
            b.create(SysOp::Le, &[iv_next, upper], vec![])
        } else {
            b.create(SysOp::Lt, &[iv_next, upper], vec![])
        };
        b.replace(
            latchterm,
            SysOp::Branch,
            &[cmp],
            vec![Attr::Target(header), Attr::Else(exit)],
        );

        // Exit phis: the in-loop edge now comes from the latch (with the
        // latch value), and a fresh edge from the preheader brings the
        // initial value for the zero-trip case.
        for phi in module.phis(exit) {
            for i in 0..module.op(phi).operand_count() {
                let from = module.op(phi).from_at(i);
                if from != header {
                    continue;
                }
                let def = module.op(phi).operand(i);
                module.set_attr(phi, i, Attr::From(latch));
                if let Some(&v) = value_map.get(&def) {
                    module.set_operand(phi, i, v);
                }
                let init = init_map.get(&def).copied().unwrap_or(def);
                module.push_operand(phi, init);
                module.add_attr(phi, Attr::From(preheader));
                break;
            }
        }
    }
}

impl Pass for LoopRotate {
    fn name(&self) -> &'static str {
        "loop-rotate"
    }

    fn stats(&self) -> Vec<(&'static str, usize)> {
        vec![("rotated-loops", self.rotated)]
    }

    fn run(&mut self, module: &mut Module) -> Result<(), Report> {
        let analysis = LoopAnalysis::run(module);
        let funcs = module.funcs();

        // Merge multiple latches into one before rotating.
        for &func in &funcs {
            let Some(forest) = analysis.forests.get(&func) else { continue };
            for info in &forest.loops {
                if info.latches.len() == 1 {
                    continue;
                }
                let header = info.header;
                let latch = module.insert_block_before(*info.latches.iter().last().unwrap());

                for &old in &info.latches {
                    let term = module.block(old).last_op();
                    if module.op(term).find_attr(AttrKind::Target).is_some()
                        && module.op(term).target() == header
                    {
                        module.put_attr(term, Attr::Target(latch));
                    }
                    if module.op(term).find_attr(AttrKind::Else).is_some()
                        && module.op(term).else_target() == header
                    {
                        module.put_attr(term, Attr::Else(latch));
                    }
                }

                for phi in module.phis(header) {
                    let mut forwarded = Vec::new();
                    let mut preserved = Vec::new();
                    for i in 0..module.op(phi).operand_count() {
                        let from = module.op(phi).from_at(i);
                        let def = module.op(phi).operand(i);
                        if info.latches.contains(&from) {
                            forwarded.push((def, from));
                        } else {
                            preserved.push((def, from));
                        }
                    }
                    if forwarded.is_empty() {
                        continue;
                    }

                    let mut b = Builder::new(module);
                    b.set_to_block_end(latch);
                    let new_phi = b.create(SysOp::Phi, &[], vec![]);
                    for (def, from) in forwarded {
                        module.push_operand(new_phi, def);
                        module.add_attr(new_phi, Attr::From(from));
                    }

                    module.remove_all_operands(phi);
                    module.remove_all_attrs(phi);
                    if preserved.is_empty() {
                        module.replace_op_with(phi, new_phi);
                    } else {
                        for (def, from) in preserved {
                            module.push_operand(phi, def);
                            module.add_attr(phi, Attr::From(from));
                        }
                        module.push_operand(phi, new_phi);
                        module.add_attr(phi, Attr::From(latch));
                    }
                }

                let mut b = Builder::new(module);
                b.set_to_block_end(latch);
                b.create(SysOp::Goto, &[], vec![Attr::Target(header)]);
            }
        }

        // Re-analyze and rotate, innermost loops first.
        let analysis = LoopAnalysis::run(module);
        for &func in &funcs {
            let Some(forest) = analysis.forests.get(&func) else { continue };
            for root in forest.top_level() {
                let mut order = Vec::new();
                forest.postorder(root, &mut order);
                for idx in order {
                    self.run_loop(module, &forest.loops[idx]);
                }
            }
        }
        Ok(())
    }
}
