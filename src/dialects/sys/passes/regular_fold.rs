//! The workhorse folder: ~150 rewrite rules over the `sys` dialect, plus a
//! handful of branch folds that the rule language can't express. Works on
//! both structured control flow and the flattened CFG.
//!
//! Float rules are deliberately partitioned: only constant float arithmetic
//! folds, and nothing fuses `a*b + c` here, so precision matches the
//! unoptimized program.

use color_eyre::Report;

use crate::core::{run_rewriter, Attr, BlockId, Builder, Module, OpId, Pass, RegionId, Ty};
use crate::dialects::sys::SysOp;
use crate::matcher::Rule;

lazy_static! {
    static ref RULES: Vec<Rule> = [
        // Addition
        "(change (add x 0) x)",
        "(change (add 'a 'b) (!add 'a 'b))",
        "(change (add 'a x) (add x 'a))",
        "(change (add x (minus y)) (sub x y))",
        "(change (add (minus x) y) (sub y x))",
        "(change (add x (sub y x)) y)",
        "(change (add (add x 'a) 'b) (add x (!add 'a 'b)))",
        "(change (add (sub x 'a) 'b) (add x (!sub 'b 'a)))",
        "(change (add (mul x 'a) (mul x 'b)) (mul x (!add 'a 'b)))",
        "(change (add (mul x 'a) x) (mul (!add 'a 1) x))",
        "(change (add x (mul x 'a)) (mul (!add 'a 1) x))",
        "(change (add (mul x 'a) (mul y 'a)) (mul (add x y) 'a))",
        "(change (add (div 'a x) (div 'b x)) (div (!add 'a 'b) x))",
        "(change (add (div x 'a) (div y 'a)) (div (add x y) 'a))",
        "(change (add x x) (mul x 2))",
        // Addition (64-bit)
        "(change (addl x 0) x)",
        "(change (addl 'a 'b) (!add 'a 'b))",
        "(change (addl 'a x) (addl x 'a))",
        "(change (addl (addl x 'a) 'b) (addl x (!add 'a 'b)))",
        // FP Addition
        "(change (fadd *a *b) (?add *a *b))",
        "(change (fadd x *0) x)",
        "(change (fadd *a x) (fadd x *a))",
        "(change (fadd x (fminus y)) (fsub x y))",
        "(change (fadd (fminus x) y) (fsub y x))",
        // Subtraction
        "(change (sub x 0) x)",
        "(change (sub x x) 0)",
        "(change (sub 0 x) (minus x))",
        "(change (sub 'a 'b) (!sub 'a 'b))",
        "(change (sub (add x y) x) y)",
        "(change (sub (add x y) y) x)",
        "(change (sub x (add x y)) (minus y))",
        "(change (sub y (add x y)) (minus x))",
        "(change (sub x (sub x y)) y)",
        "(change (sub (add x y) (sub x z)) (add y z))",
        "(change (sub (add x y) (add x z)) (sub y z))",
        "(change (sub (add x 'a) 'b) (add x (!sub 'a 'b)))",
        "(change (sub (sub x 'a) 'b) (sub x (!add 'a 'b)))",
        "(change (sub x (minus y)) (add x y))",
        "(change (sub (mul x 'a) (mul x 'b)) (mul x (!sub 'a 'b)))",
        "(change (sub (mul x 'a) (mul y 'a)) (mul (sub x y) 'a))",
        "(change (sub (div 'a x) (div 'b x)) (div (!sub 'a 'b) x))",
        "(change (sub (div x 'a) (div y 'a)) (div (sub x y) 'a))",
        // Subtraction (64-bit)
        "(change (subl x 0) x)",
        "(change (subl (addl x 'a) x) 'a)",
        // FP subtraction
        "(change (fsub *a *b) (?sub *a *b))",
        "(change (fsub x *0) x)",
        "(change (fsub x (fminus y)) (fadd x y))",
        // Multiplication
        "(change (mul x 0) 0)",
        "(change (mul x 1) x)",
        "(change (mul x -1) (minus x))",
        "(change (mul 'a 'b) (!mul 'a 'b))",
        "(change (mul 'a x) (mul x 'a))",
        "(change (mul (mul x 'a) 'b) (mul x (!mul 'a 'b)))",
        "(change (mul (add x 'a) 'b) (add (mul x 'b) (!mul 'a 'b)))",
        "(change (mul (sub x 'a) 'b) (sub (mul x 'b) (!mul 'a 'b)))",
        // Long multiplication
        "(change (mull x 1) x)",
        // FP multiplication
        "(change (fmul *a *b) (?mul *a *b))",
        "(change (fmul x *0) *0)",
        "(change (fmul x *1) x)",
        "(change (fmul x *2) (fadd x x))",
        "(change (fmul x *-1) (fminus x))",
        "(change (fmul *a x) (fmul x *a))",
        // Division
        "(change (div 0 x) 0)",
        "(change (div x 1) x)",
        "(change (div x -1) (minus x))",
        "(change (div x x) 1)",
        "(change (div 'a 'b) (!div 'a 'b))",
        "(change (div (mul x 'a) 'b) (!only-if (!eq (!mod 'a 'b) 0) (mul x (!div 'a 'b))))",
        "(change (div (div x 'a) 'b) (!only-if (!ne (!mul 'a 'b) -1) (div x (!mul 'a 'b))))",
        // Long division
        "(change (divl x 1) x)",
        // FP Division
        "(change (fdiv *a *b) (?div *a *b))",
        "(change (fdiv *0 x) *0)",
        "(change (fdiv x *1) x)",
        "(change (fdiv x *-1) (fminus x))",
        "(change (fdiv x x) *1)",
        // Modulus
        "(change (mod x 1) 0)",
        "(change (mod x x) 0)",
        "(change (mod 0 x) 0)",
        "(change (mod 'a 'b) (!mod 'a 'b))",
        // Shift
        "(change (lshift 'a 'b) (!lsh 'a 'b))",
        "(change (rshift 'a 'b) (!rsh 'a 'b))",
        // Minus
        "(change (minus 'a) (!sub 0 'a))",
        "(change (minus (add x 'a)) (sub (!sub 0 'a) x))",
        "(change (minus (sub x y)) (sub y x))",
        "(change (minus (minus x)) x)",
        // FP Minus
        "(change (fminus *a) (?sub *0 *a))",
        "(change (fminus (fadd x *a)) (fsub (?sub *0 *a) x))",
        "(change (fminus (fsub x y)) (fsub y x))",
        "(change (fminus (fminus x)) x)",
        // Equality
        "(change (eq x x) 1)",
        "(change (eq 'a 'b) (!eq 'a 'b))",
        "(change (eq 'a x) (eq x 'a))",
        "(change (eq (add x 'a) 'b) (eq x (!sub 'b 'a)))",
        "(change (eq (sub x 'a) 'b) (eq x (!add 'b 'a)))",
        "(change (eq (mul x 'a) 'b) (!only-if (!eq 0 (!mod 'b 'a)) (eq x (!div 'b 'a))))",
        "(change (eq (mul x 'a) 'b) (!only-if (!ne 0 (!mod 'b 'a)) 0))",
        "(change (eq (div x 'a) 'b) (!only-if (!gt 'a 0) (and (lt x (!mul (!add 'b 1) 'a)) (ge x (!mul 'b 'a)))))",
        "(change (eq (mod x 'a) 'b) (!only-if (!le 'a 'b) 0))",
        "(change (eq (mod x 2) 1) (and (ge x 0) (mod x 2)))",
        "(change (eq x 0) (not x))",
        "(change (eq (not x) 0) (snz x))",
        // FP Equality
        "(change (feq x x) 1)",
        "(change (feq *a *b) (!feq *a *b))",
        "(change (feq *a x) (feq x *a))",
        // Less than or equal
        "(change (le x x) 1)",
        "(change (le 'a 'b) (!le 'a 'b))",
        "(change (le x 'a) (lt x (!add 'a 1)))",
        "(change (le 'a x) (lt (!sub 'a 1) x))",
        // FP Less than or equal
        "(change (fle x x) 1)",
        "(change (fle *a *b) (!fle *a *b))",
        // Less than
        "(change (lt x x) 0)",
        "(change (lt 'a 'b) (!lt 'a 'b))",
        "(change (lt (mul x 'a) 'b) (!only-if (!and (!and (!gt 'a 0) (!gt 'b 0)) (!eq (!mod 'b 'a) 0)) (lt x (!div 'b 'a))))",
        "(change (lt (mul x 'a) 'b) (!only-if (!and (!and (!gt 'a 0) (!gt 'b 0)) (!ne (!mod 'b 'a) 0)) (lt x (!add (!div 'b 'a) 1))))",
        "(change (lt (div x 'a) 'b) (!only-if (!and (!gt 'a 0) (!gt 'b 0)) (lt x (!mul 'b 'a))))",
        "(change (lt 'b (add x 'a)) (lt (!sub 'b 'a) x))",
        "(change (lt 'b (sub x 'a)) (lt (!add 'b 'a) x))",
        "(change (lt 'b (sub 'a x)) (gt (!sub 'a 'b) x))",
        "(change (lt (sub 'a x) 'b) (gt x (!sub 'a 'b)))",
        "(change (lt 'b (mul x 'a)) (!only-if (!and (!gt 'a 0) (!gt 'b 0)) (lt (!div 'b 'a) x)))",
        "(change (lt 'b (div x 'a)) (!only-if (!and (!gt 'a 0) (!gt 'b 0)) (le (!mul 'a (!add 'b 1)) x)))",
        "(change (lt x (add x 'a)) (!lt 0 'a))",
        "(change (lt x (sub 'a x)) (lt (mul x 2) 'a))",
        // FP Less than
        "(change (flt x x) 0)",
        "(change (flt *a *b) (!flt *a *b))",
        // Not
        "(change (not 'a) (!not 'a))",
        "(change (not (snz x)) (not x))",
        "(change (not (eq x y)) (ne x y))",
        "(change (not (lt x y)) (ge x y))",
        "(change (not (le x y)) (gt x y))",
        "(change (not (ne x y)) (eq x y))",
        "(change (not (not x)) (snz x))",
        "(change (not (or x y)) (and (not x) (not y)))",
        "(change (not (and x y)) (or (not x) (not y)))",
        // FP Not
        "(change (not *a) (!feq *a *0))",
        "(change (not (feq x y)) (fne x y))",
        // Not equal
        "(change (ne 'a 'b) (!ne 'a 'b))",
        "(change (ne 'a x) (ne x 'a))",
        "(change (ne (add x 'a) 'b) (ne x (!sub 'b 'a)))",
        "(change (ne (sub x 'a) 'b) (ne x (!add 'b 'a)))",
        "(change (ne (mod x 2) 1) (or (lt x 0) (not (mod x 2))))",
        "(change (ne x 0) (snz x))",
        "(change (ne (not x) 0) (not x))",
        // FP Not equal
        "(change (fne *a *b) (!fne *a *b))",
        // Set not zero
        "(change (snz 0) 0)",
        "(change (snz 'a) (!only-if (!ne 'a 0) 1))",
        "(change (snz (mod x 2)) (mod x 2))",
        "(change (snz (eq x y)) (eq x y))",
        "(change (snz (le x y)) (le x y))",
        "(change (snz (lt x y)) (lt x y))",
        "(change (snz (ne x y)) (ne x y))",
        "(change (snz (not x)) (not x))",
        // FP Set not zero
        "(change (snz *a) (!fne *a *0))",
        // And
        "(change (and x 0) 0)",
        "(change (and 'a 'b) (!and 'a 'b))",
        // Select
        "(change (select 1 x y) x)",
        "(change (select 0 x y) y)",
        "(change (select c 1 0) (snz c))",
        "(change (select c 0 1) (not c))",
        "(change (select c x x) x)",
        "(change (select c (eq x y) 0) (and (eq x y) c))",
        "(change (select c (ne x y) 0) (and (ne x y) c))",
        "(change (select c (lt x y) 0) (and (lt x y) c))",
        "(change (select c (le x y) 0) (and (le x y) c))",
        "(change (select c (eq x y) 1) (or (eq x y) (not c)))",
        "(change (select c (ne x y) 1) (or (ne x y) (not c)))",
        "(change (select c (lt x y) 1) (or (lt x y) (not c)))",
        "(change (select c (le x y) 1) (or (le x y) (not c)))",
        "(change (select c 1 (eq x y)) (or (eq x y) c))",
        "(change (select c 1 (ne x y)) (or (ne x y) c))",
        "(change (select c 1 (lt x y)) (or (lt x y) c))",
        "(change (select c 1 (le x y)) (or (le x y) c))",
        // float -> int
        "(change (f2i *a) (!cvt *a))",
        // int -> float
        "(change (i2f 'a) (?cvt 'a))",
    ]
    .iter()
    .map(|text| Rule::new(text))
    .collect();
}

#[derive(Default)]
pub struct RegularFold {
    folded: usize,
}

/// Drops the phi operand flowing in from `from`, keeping the FROM attrs
/// aligned with the remaining operands.
pub fn remove_phi_operand(module: &mut Module, phi: OpId, from: BlockId) {
    let operands = module.op(phi).operands().to_vec();
    let froms: Vec<BlockId> = (0..operands.len()).map(|i| module.op(phi).from_at(i)).collect();

    module.remove_all_operands(phi);
    module.remove_all_attrs(phi);

    for (op, pred) in operands.into_iter().zip(froms) {
        if pred == from {
            continue;
        }
        module.push_operand(phi, op);
        module.add_attr(phi, Attr::From(pred));
    }
}

/// Drops the incoming edge from `from` on every phi of `bb`.
pub fn tidy_phi(module: &mut Module, bb: BlockId, from: BlockId) {
    for phi in module.phis(bb) {
        remove_phi_operand(module, phi, from);
    }
}

impl RegularFold {
    fn run_region(&mut self, module: &mut Module, region: RegionId) -> usize {
        let mut folded = 0;
        for bb in module.region(region).blocks().to_vec() {
            for op in module.block(bb).ops().to_vec() {
                if module.is_dead(op) {
                    continue;
                }
                let mut success = false;
                for rule in RULES.iter() {
                    if rule.rewrite(module, op) {
                        folded += 1;
                        success = true;
                        break;
                    }
                }
                if !success {
                    for sub in module.op(op).regions().to_vec() {
                        folded += self.run_region(module, sub);
                    }
                }
            }
        }
        folded
    }

    pub fn apply(module: &mut Module) -> usize {
        let mut pass = RegularFold::default();
        let _ = pass.run(module);
        pass.folded
    }
}

impl Pass for RegularFold {
    fn name(&self) -> &'static str {
        "regular-fold"
    }

    fn stats(&self) -> Vec<(&'static str, usize)> {
        vec![("folded-ops", self.folded)]
    }

    fn run(&mut self, module: &mut Module) -> Result<(), Report> {
        let funcs = module.funcs();
        loop {
            let mut folded = 0;
            for &func in &funcs {
                let region = module.func_region(func);
                folded += self.run_region(module, region);
            }

            // Folds the rule language can't express.
            run_rewriter(module, SysOp::Branch, |m, op| {
                let cond = m.op(op).operand(0);
                let ckind = m.op(cond).kind();

                // (br (snz x)) becomes (br x); float tests can't be folded.
                if ckind == SysOp::SetNotZero
                    && m.op(m.op(cond).operand(0)).result_ty() != Ty::F32
                {
                    folded += 1;
                    let def = m.op(cond).operand(0);
                    let attrs: Vec<Attr> =
                        m.op(op).attrs().iter().map(|a| (**a).clone()).collect();
                    let mut b = Builder::new(m);
                    b.replace(op, SysOp::Branch, &[def], attrs);
                    return true;
                }

                // (br (not x) >bb >bb2) becomes (br x >bb2 >bb).
                if ckind == SysOp::Not && m.op(m.op(cond).operand(0)).result_ty() != Ty::F32 {
                    folded += 1;
                    let def = m.op(cond).operand(0);
                    let target = m.op(op).target();
                    let ifnot = m.op(op).else_target();
                    let mut b = Builder::new(m);
                    b.replace(
                        op,
                        SysOp::Branch,
                        &[def],
                        vec![Attr::Target(ifnot), Attr::Else(target)],
                    );
                    return true;
                }

                if ckind != SysOp::Int {
                    return false;
                }

                folded += 1;
                let target = m.op(op).target();
                let ifnot = m.op(op).else_target();
                let from = m.op(op).parent().unwrap();
                if m.op(cond).int_val() == 0 {
                    tidy_phi(m, target, from);
                    let mut b = Builder::new(m);
                    b.replace(op, SysOp::Goto, &[], vec![Attr::Target(ifnot)]);
                } else {
                    tidy_phi(m, ifnot, from);
                    let mut b = Builder::new(m);
                    b.replace(op, SysOp::Goto, &[], vec![Attr::Target(target)]);
                }
                false
            });

            // x / 2.0 is exactly x * 0.5.
            run_rewriter(module, SysOp::DivF, |m, op| {
                let y = m.op(op).operand(1);
                if m.op(y).kind() == SysOp::Float && m.op(y).float_val() == 2.0 {
                    folded += 1;
                    let x = m.op(op).operand(0);
                    let mut b = Builder::new(m);
                    b.set_before_op(op);
                    let half = b.create(SysOp::Float, &[], vec![Attr::Float(0.5)]);
                    b.replace(op, SysOp::MulF, &[x, half], vec![]);
                }
                false
            });

            self.folded += folded;
            if folded == 0 {
                break;
            }
        }
        Ok(())
    }
}
