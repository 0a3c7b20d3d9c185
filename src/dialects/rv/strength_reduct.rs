//! Strength reduction for RV64: constant multiplies to shift/add/sub,
//! division and modulus by constants through the sign-bias shifts or the
//! Granlund–Montgomery multiplier (powers of two never take the multiplier
//! path). Fresh `li` immediates hoist out of loops afterwards.

use color_eyre::Report;

use crate::backend::choose_multiplier;
use crate::core::{run_rewriter, Attr, Builder, Module, Pass};
use crate::dialects::rv::intrinsics::RvOp;
use crate::dialects::sys::analysis::{LoopAnalysis, LoopForest};

#[derive(Default)]
pub struct StrengthReduct {
    converted: usize,
}

fn hoist_li(module: &mut Module, forest: &LoopForest, idx: usize) {
    for &sub in &forest.loops[idx].subloops {
        hoist_li(module, forest, sub);
    }
    let Some(preheader) = forest.loops[idx].preheader else { return };
    let term = module.block(preheader).last_op();
    for bb in forest.loops[idx].blocks.clone() {
        for op in module.block(bb).ops().to_vec() {
            if module.op(op).kind() == RvOp::Li {
                module.move_op_before(op, term);
            }
        }
    }
}

impl StrengthReduct {
    fn run_once(&mut self, module: &mut Module) -> usize {
        use RvOp::*;
        let mut converted = 0;

        run_rewriter(module, Mulw, |m, op| {
            let x = m.op(op).operand(0);
            let y = m.op(op).operand(1);

            if m.op(x).kind() == Li && m.op(y).kind() == Li {
                converted += 1;
                let v = m.op(x).int_val().wrapping_mul(m.op(y).int_val());
                let mut b = Builder::new(m);
                b.replace(op, Li, &[], vec![Attr::Int(v)]);
                return true;
            }
            if m.op(x).kind() == Li && m.op(y).kind() != Li {
                let mut b = Builder::new(m);
                b.replace(op, Mulw, &[y, x], vec![]);
                return true;
            }
            if m.op(y).kind() != Li {
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
                b.replace(op, Slliw, &[x], vec![Attr::Int(i.trailing_zeros() as i32)]);
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
                    b.create(Slliw, &[x], vec![Attr::Int(first)])
                };
                let rest = (i - (1 << first)).trailing_zeros() as i32;
                let upper = b.create(Slliw, &[x], vec![Attr::Int(rest)]);
                b.replace(op, Addw, &[lower, upper], vec![]);
                return true;
            }
            for place in 0..31 {
                if (i + (1 << place)).count_ones() == 1 {
                    converted += 1;
                    let mut b = Builder::new(m);
                    b.set_before_op(op);
                    let lower = if place == 0 {
                        x
                    } else {
                        b.create(Slliw, &[x], vec![Attr::Int(place)])
                    };
                    let upper = b.create(
                        Slliw,
                        &[x],
                        vec![Attr::Int((i + (1 << place)).trailing_zeros() as i32)],
                    );
                    b.replace(op, Subw, &[upper, lower], vec![]);
                    return true;
                }
            }
            false
        });

        run_rewriter(module, Remw, |m, op| {
            let x = m.op(op).operand(0);
            let y = m.op(op).operand(1);
            if m.op(x).kind() == Li && m.op(y).kind() == Li {
                converted += 1;
                let v = m.op(x).int_val() % m.op(y).int_val();
                let mut b = Builder::new(m);
                b.replace(op, Li, &[], vec![Attr::Int(v)]);
                return true;
            }
            if m.op(y).kind() != Li {
                return false;
            }
            let i = m.op(y).int_val();
            if i < 0 {
                return false;
            }
            // x % 2^n via the bias: add the sign-extended low bits, mask,
            // subtract back out.
            if i.count_ones() == 1 && i > 1 {
                converted += 1;
                let n = i.trailing_zeros() as i32;
                let mut b = Builder::new(m);
                b.set_before_op(op);
                let sign = b.create(Sraiw, &[x], vec![Attr::Int(31)]);
                let bias = b.create(Srliw, &[sign], vec![Attr::Int(32 - n)]);
                let biased = b.create(Addw, &[x, bias], vec![]);
                let li = b.create(Li, &[], vec![Attr::Int(!(i - 1))]);
                let masked = b.create(And, &[biased, li], vec![]);
                b.replace(op, Subw, &[x, masked], vec![]);
                return true;
            }
            false
        });

        run_rewriter(module, Divw, |m, op| {
            let x = m.op(op).operand(0);
            let y = m.op(op).operand(1);

            if m.op(x).kind() == Li && m.op(y).kind() == Li {
                converted += 1;
                let v = m.op(x).int_val() / m.op(y).int_val();
                let mut b = Builder::new(m);
                b.replace(op, Li, &[], vec![Attr::Int(v)]);
                return true;
            }
            if m.op(y).kind() != Li {
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
            if i.count_ones() == 1 {
                // The sign-bias sequence; never the multiplier for 2^n.
                converted += 1;
                let n = i.trailing_zeros() as i32;
                let mut b = Builder::new(m);
                b.set_before_op(op);
                let sign = b.create(Sraiw, &[x], vec![Attr::Int(31)]);
                let bias = b.create(Srliw, &[sign], vec![Attr::Int(32 - n)]);
                let biased = b.create(Addw, &[x, bias], vec![]);
                b.replace(op, Sraiw, &[biased], vec![Attr::Int(n)]);
                return true;
            }

            converted += 1;
            let mult = choose_multiplier(i);
            let mut b = Builder::new(m);
            b.set_before_op(op);
            if mult.m_high < (1u64 << 31) {
                // One immediate load, one high-multiply, one arithmetic
                // shift and the sign-bit subtract.
                let mval = b.create(Li, &[], vec![Attr::Int(mult.m_high as i32)]);
                let prod = b.create(Mul, &[x, mval], vec![]);
                let sra = b.create(Srai, &[prod], vec![Attr::Int(32 + mult.sh_post)]);
                let sign = b.create(Srliw, &[x], vec![Attr::Int(31)]);
                b.replace(op, Addw, &[sra, sign], vec![]);
            } else {
                let reduced = (mult.m_high as i64 - (1i64 << 32)) as i32;
                let mval = b.create(Li, &[], vec![Attr::Int(reduced)]);
                let prod = b.create(Mul, &[x, mval], vec![]);
                let hi = b.create(Srai, &[prod], vec![Attr::Int(32)]);
                let add = b.create(Addw, &[hi, x], vec![]);
                let sra = if mult.sh_post > 0 {
                    b.create(Sraiw, &[add], vec![Attr::Int(mult.sh_post)])
                } else {
                    add
                };
                let xsign = b.create(Sraiw, &[x], vec![Attr::Int(31)]);
                b.replace(op, Subw, &[sra, xsign], vec![]);
            }
            true
        });

        // SCEV's 64-bit `x / (1 << n)`.
        run_rewriter(module, Div, |m, op| {
            let x = m.op(op).operand(0);
            let y = m.op(op).operand(1);
            let shifted = m.op(y).kind() == Sll
                && m.op(m.op(y).operand(0)).kind() == Li
                && m.op(m.op(y).operand(0)).int_val() == 1;
            if !shifted {
                return false;
            }
            converted += 1;
            let n = m.op(y).operand(1);
            let mut b = Builder::new(m);
            b.set_before_op(op);
            let srai = b.create(Srai, &[x], vec![Attr::Int(63)]);
            let vi = b.create(Li, &[], vec![Attr::Int(64)]);
            let sub = b.create(Subw, &[vi, n], vec![]);
            let srl = b.create(Srl, &[srai, sub], vec![]);
            let add = b.create(Add, &[x, srl], vec![]);
            b.replace(op, Sra, &[add, n], vec![]);
            true
        });

        converted
    }
}

impl Pass for StrengthReduct {
    fn name(&self) -> &'static str {
        "rv-strength-reduct"
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

        let analysis = LoopAnalysis::run(module);
        for (_, forest) in analysis.forests.iter() {
            for root in forest.top_level() {
                hoist_li(module, forest, root);
            }
        }
        Ok(())
    }
}
