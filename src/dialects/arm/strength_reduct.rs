//! Strength reduction of constant multiplies, divides and mods after
//! lowering. Multiplies by popcount-1/2 or `2^n ± 1` constants become
//! shift/add/sub; `/2` and `/2^n` take the sign-bias sequences; anything
//! else goes through the Granlund–Montgomery multiplier. Division by a
//! power of two never reaches the multiplier path. A final sweep hoists the
//! `mov` immediates the rewrites minted out of loops.

use color_eyre::Report;

use crate::backend::choose_multiplier;
use crate::core::{run_rewriter, Attr, Builder, Module, Pass};
use crate::dialects::arm::intrinsics::ArmOp;
use crate::dialects::sys::analysis::{LoopAnalysis, LoopForest};

#[derive(Default)]
pub struct StrengthReduct {
    converted: usize,
}

fn hoist_movi(module: &mut Module, forest: &LoopForest, idx: usize) {
    for &sub in &forest.loops[idx].subloops {
        hoist_movi(module, forest, sub);
    }
    let Some(preheader) = forest.loops[idx].preheader else { return };
    let term = module.block(preheader).last_op();
    for bb in forest.loops[idx].blocks.clone() {
        for op in module.block(bb).ops().to_vec() {
            if module.op(op).kind() == ArmOp::MovI {
                module.move_op_before(op, term);
            }
        }
    }
}

impl StrengthReduct {
    fn run_once(&mut self, module: &mut Module) -> usize {
        use ArmOp::*;
        let mut converted = 0;

        run_rewriter(module, MulW, |m, op| {
            let x = m.op(op).operand(0);
            let y = m.op(op).operand(1);

            if m.op(x).kind() == MovI && m.op(y).kind() == MovI {
                converted += 1;
                let v = m.op(x).int_val().wrapping_mul(m.op(y).int_val());
                let mut b = Builder::new(m);
                b.replace(op, MovI, &[], vec![Attr::Int(v)]);
                return true;
            }
            // Constant on the right.
            if m.op(x).kind() == MovI && m.op(y).kind() != MovI {
                let mut b = Builder::new(m);
                b.replace(op, MulW, &[y, x], vec![]);
                return true;
            }
            if m.op(y).kind() != MovI {
                return false;
            }

            let i = m.op(y).int_val();
            if i < 0 {
                return false;
            }
            if i == 1 {
                converted += 1;
                m.replace_op_with(op, x);
                return true;
            }

            let bits = i.count_ones();
            if bits == 1 {
                converted += 1;
                let mut b = Builder::new(m);
                b.replace(op, LslWI, &[x], vec![Attr::Int(i.trailing_zeros() as i32)]);
                return true;
            }
            if bits == 2 {
                converted += 1;
                let first = i.trailing_zeros() as i32;
                let mut b = Builder::new(m);
                b.set_before_op(op);
                let lower = if first == 0 {
                    x
                } else {
                    b.create(LslWI, &[x], vec![Attr::Int(first)])
                };
                let rest = (i - (1 << first)).trailing_zeros() as i32;
                let upper = b.create(LslWI, &[x], vec![Attr::Int(rest)]);
                b.replace(op, AddW, &[lower, upper], vec![]);
                return true;
            }
            // 2^n - constant: one shift and a subtract.
            for place in 0..31 {
                if (i + (1 << place)).count_ones() == 1 {
                    converted += 1;
                    let mut b = Builder::new(m);
                    b.set_before_op(op);
                    let lower = if place == 0 {
                        x
                    } else {
                        b.create(LslWI, &[x], vec![Attr::Int(place)])
                    };
                    let upper = b.create(
                        LslWI,
                        &[x],
                        vec![Attr::Int((i + (1 << place)).trailing_zeros() as i32)],
                    );
                    b.replace(op, SubW, &[upper, lower], vec![]);
                    return true;
                }
            }
            false
        });

        // Mod was lowered to sdiv + msub; catch it before sdiv rewrites.
        run_rewriter(module, MsubW, |m, op| {
            let z = m.op(op).operand(0);
            let y = m.op(op).operand(1);
            let x = m.op(op).operand(2);
            let is_mod = m.op(z).kind() == SdivW
                && m.op(z).operand(0) == x
                && m.op(z).operand(1) == y;
            if !is_mod {
                return false;
            }

            if m.op(x).kind() == MovI && m.op(y).kind() == MovI {
                converted += 1;
                let v = m.op(x).int_val() % m.op(y).int_val();
                let mut b = Builder::new(m);
                b.replace(op, MovI, &[], vec![Attr::Int(v)]);
                return true;
            }
            if m.op(y).kind() != MovI {
                return false;
            }
            let i = m.op(y).int_val();
            if i == 2 {
                converted += 1;
                let mut b = Builder::new(m);
                b.set_before_op(op);
                let and = b.create(AndI, &[x], vec![Attr::Int(1)]);
                b.replace(op, CnegLtZ, &[x, and], vec![]);
                return true;
            }
            false
        });

        run_rewriter(module, SdivW, |m, op| {
            let x = m.op(op).operand(0);
            let y = m.op(op).operand(1);

            if m.op(x).kind() == MovI && m.op(y).kind() == MovI {
                converted += 1;
                let v = m.op(x).int_val() / m.op(y).int_val();
                let mut b = Builder::new(m);
                b.replace(op, MovI, &[], vec![Attr::Int(v)]);
                return true;
            }
            if m.op(y).kind() != MovI {
                return false;
            }
            let i = m.op(y).int_val();
            if i < 0 {
                return false;
            }
            if i == 1 {
                converted += 1;
                m.replace_op_with(op, x);
                return true;
            }
            if i == 2 {
                converted += 1;
                let mut b = Builder::new(m);
                b.set_before_op(op);
                let add = b.create(AddWR, &[x, x], vec![Attr::Int(31)]);
                b.replace(op, AsrWI, &[add], vec![Attr::Int(1)]);
                return true;
            }
            if i.count_ones() == 1 {
                // The shift-bias sequence; no multiplier for powers of two.
                converted += 1;
                let mut b = Builder::new(m);
                b.set_before_op(op);
                let vi = b.create(MovI, &[], vec![Attr::Int(i - 1)]);
                let add = b.create(AddW, &[x, vi], vec![]);
                let csel = b.create(CselLtZ, &[x, add, x], vec![]);
                b.replace(op, AsrWI, &[csel], vec![Attr::Int(i.trailing_zeros() as i32)]);
                return true;
            }

            converted += 1;
            let mult = choose_multiplier(i);
            let mut b = Builder::new(m);
            b.set_before_op(op);
            if mult.m_high < (1u64 << 31) {
                let mval = b.create(MovI, &[], vec![Attr::Int(mult.m_high as i32)]);
                let mulsh = b.create(Smull, &[x, mval], vec![]);
                let sra = b.create(AsrXI, &[mulsh], vec![Attr::Int(32 + mult.sh_post)]);
                b.replace(op, AddWR, &[sra, sra], vec![Attr::Int(31)]);
            } else {
                let reduced = (mult.m_high as i64 - (1i64 << 32)) as i32;
                let mval = b.create(MovI, &[], vec![Attr::Int(reduced)]);
                let mul = b.create(Smull, &[mval, x], vec![]);
                let mulsh = b.create(AsrXI, &[mul], vec![Attr::Int(32)]);
                let add = b.create(AddW, &[mulsh, x], vec![]);
                let sra = if mult.sh_post > 0 {
                    b.create(AsrWI, &[add], vec![Attr::Int(mult.sh_post)])
                } else {
                    add
                };
                let xsign = b.create(AsrWI, &[x], vec![Attr::Int(31)]);
                b.replace(op, SubW, &[sra, xsign], vec![]);
            }
            true
        });

        // SCEV emits `x / (1 << n)`; use asr with the sign fixup.
        run_rewriter(module, SdivX, |m, op| {
            let x = m.op(op).operand(0);
            let y = m.op(op).operand(1);
            let shifted = m.op(y).kind() == LslX
                && m.op(m.op(y).operand(0)).kind() == MovI
                && m.op(m.op(y).operand(0)).int_val() == 1;
            if !shifted {
                return false;
            }
            converted += 1;
            let n = m.op(y).operand(1);
            let mut b = Builder::new(m);
            b.set_before_op(op);
            let srai = b.create(AsrXI, &[x], vec![Attr::Int(63)]);
            let vi = b.create(MovI, &[], vec![Attr::Int(64)]);
            let sub = b.create(SubW, &[vi, n], vec![]);
            let srl = b.create(LsrX, &[srai, sub], vec![]);
            let add = b.create(AddX, &[x, srl], vec![]);
            b.replace(op, AsrX, &[add, n], vec![]);
            true
        });

        converted
    }
}

impl Pass for StrengthReduct {
    fn name(&self) -> &'static str {
        "arm-strength-reduct"
    }

    fn stats(&self) -> Vec<(&'static str, usize)> {
        vec![("converted-ops", self.converted)]
    }

    fn run(&mut self, module: &mut Module) -> Result<(), Report> {
        loop {
            let converted = self.run_once(module);
            self.converted += converted;
            if converted == 0 {
                break;
            }
        }

        // The rewrites minted fresh immediates; pull them out of loops.
        let analysis = LoopAnalysis::run(module);
        for (_, forest) in analysis.forests.iter() {
            for root in forest.top_level() {
                hoist_movi(module, forest, root);
            }
        }
        Ok(())
    }
}
