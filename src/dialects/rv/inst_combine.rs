//! Target rewrite rules for RV64, run to fixed point: fold 12-bit
//! immediates into addi/addiw and shift-immediate forms, fold constant
//! offsets into load/store immediates, and normalize `addi x 0` to `mv`.

use color_eyre::Report;

use crate::core::{run_rewriter, Attr, Module, OpKind, Pass};
use crate::dialects::rv::intrinsics::RvOp;
use crate::matcher::{MachineRule, MachineSig, MachineTable, Shape};

macro_rules! sig {
    ($name:literal, $kind:ident, $shape:ident) => {
        MachineSig { name: $name, kind: OpKind::Rv(RvOp::$kind), shape: Shape::$shape }
    };
}

pub static MATCH_OPS: &[MachineSig] = &[
    sig!("add", Add, Binary),
    sig!("addw", Addw, Binary),
    sig!("sub", Sub, Binary),
    sig!("subw", Subw, Binary),
    sig!("mulw", Mulw, Binary),
    sig!("mul", Mul, Binary),
    sig!("and", And, Binary),
    sig!("or", Or, Binary),
    sig!("xor", Xor, Binary),
    sig!("sllw", Sllw, Binary),
    sig!("sll", Sll, Binary),
    sig!("sraw", Sraw, Binary),
    sig!("sra", Sra, Binary),
    sig!("srlw", Srlw, Binary),
    sig!("slt", Slt, Binary),
    sig!("addiw", Addiw, UnaryImm),
    sig!("addi", Addi, UnaryImm),
    sig!("slliw", Slliw, UnaryImm),
    sig!("slli", Slli, UnaryImm),
    sig!("sraiw", Sraiw, UnaryImm),
    sig!("srai", Srai, UnaryImm),
    sig!("andi", Andi, UnaryImm),
    sig!("ori", Ori, UnaryImm),
    sig!("xori", Xori, UnaryImm),
    sig!("li", Li, Imm),
    sig!("seqz", Seqz, Unary),
    sig!("snez", Snez, Unary),
    sig!("mv", Mv, Unary),
    sig!("beq", Beq, BranchBinary),
    sig!("bne", Bne, BranchBinary),
    sig!("blt", Blt, BranchBinary),
    sig!("bge", Bge, BranchBinary),
    sig!("j", J, Jump),
];

pub static BUILD_OPS: &[MachineSig] = &[
    sig!("add", Add, Binary),
    sig!("addw", Addw, Binary),
    sig!("sub", Sub, Binary),
    sig!("subw", Subw, Binary),
    sig!("mulw", Mulw, Binary),
    sig!("mul", Mul, Binary),
    sig!("and", And, Binary),
    sig!("or", Or, Binary),
    sig!("xor", Xor, Binary),
    sig!("addiw", Addiw, UnaryImm),
    sig!("addi", Addi, UnaryImm),
    sig!("slliw", Slliw, UnaryImm),
    sig!("slli", Slli, UnaryImm),
    sig!("sraiw", Sraiw, UnaryImm),
    sig!("srai", Srai, UnaryImm),
    sig!("andi", Andi, UnaryImm),
    sig!("ori", Ori, UnaryImm),
    sig!("xori", Xori, UnaryImm),
    sig!("slti", Slti, UnaryImm),
    sig!("li", Li, Imm),
    sig!("seqz", Seqz, Unary),
    sig!("snez", Snez, Unary),
    sig!("mv", Mv, Unary),
    sig!("beq", Beq, BranchBinary),
    sig!("bne", Bne, BranchBinary),
    sig!("blt", Blt, BranchBinary),
    sig!("bge", Bge, BranchBinary),
    sig!("j", J, Jump),
];

pub static TABLE: MachineTable = MachineTable {
    match_ops: MATCH_OPS,
    build_ops: BUILD_OPS,
    const_op: OpKind::Rv(RvOp::Li),
};

lazy_static! {
    static ref RULES: Vec<MachineRule> = [
        "(change (addw x (li #a)) (!only-if (!inbit 12 #a) (addiw x #a)))",
        "(change (addw (li #a) x) (!only-if (!inbit 12 #a) (addiw x #a)))",
        "(change (add x (li #a)) (!only-if (!inbit 12 #a) (addi x #a)))",
        "(change (add (li #a) x) (!only-if (!inbit 12 #a) (addi x #a)))",
        "(change (subw x (li #a)) (!only-if (!inbit 12 (!minus #a)) (addiw x (!minus #a))))",
        "(change (sub x (li #a)) (!only-if (!inbit 12 (!minus #a)) (addi x (!minus #a))))",
        "(change (sllw x (li #a)) (slliw x #a))",
        "(change (sll x (li #a)) (slli x #a))",
        "(change (sraw x (li #a)) (sraiw x #a))",
        "(change (sra x (li #a)) (srai x #a))",
        "(change (and x (li #a)) (!only-if (!inbit 12 #a) (andi x #a)))",
        "(change (or x (li #a)) (!only-if (!inbit 12 #a) (ori x #a)))",
        "(change (xor x (li #a)) (!only-if (!inbit 12 #a) (xori x #a)))",
        "(change (slt x (li #a)) (!only-if (!inbit 12 #a) (slti x #a)))",
        // Folded immediates collapse transitively.
        "(change (addi (addi x #a) #b) (!only-if (!inbit 12 (!add #a #b)) (addi x (!add #a #b))))",
        "(change (addiw (addiw x #a) #b) (!only-if (!inbit 12 (!add #a #b)) (addiw x (!add #a #b))))",
        "(change (addi x 0) (mv x))",
        "(change (addiw x 0) (mv x))",
    ]
    .iter()
    .map(|text| MachineRule::new(&TABLE, text))
    .collect();
}

#[derive(Default)]
pub struct InstCombine {
    combined: usize,
}

impl Pass for InstCombine {
    fn name(&self) -> &'static str {
        "rv-inst-combine"
    }

    fn stats(&self) -> Vec<(&'static str, usize)> {
        vec![("combined-ops", self.combined)]
    }

    fn run(&mut self, module: &mut Module) -> Result<(), Report> {
        use RvOp::*;
        let funcs = module.funcs();
        loop {
            let mut folded = 0;
            for &func in &funcs {
                let region = module.func_region(func);
                for bb in module.region(region).blocks().to_vec() {
                    for op in module.block(bb).ops().to_vec() {
                        if module.is_dead(op) {
                            continue;
                        }
                        for rule in RULES.iter() {
                            if rule.rewrite(module, op) {
                                folded += 1;
                                break;
                            }
                        }
                    }
                }
            }

            // Constant offsets fold into the load/store immediate.
            run_rewriter(module, Load, |m, op| {
                let addr = m.op(op).operand(0);
                if m.op(addr).kind() != Addi {
                    return false;
                }
                let extra = m.op(addr).int_val();
                let base = m.op(addr).operand(0);
                let total = m.op(op).int_val() + extra;
                if !(-2048..=2047).contains(&total) {
                    return false;
                }
                folded += 1;
                m.set_operand(op, 0, base);
                let size = m.op(op).size();
                m.remove_attr(op, crate::core::AttrKind::Int);
                m.remove_attr(op, crate::core::AttrKind::Size);
                m.add_attr(op, Attr::Size(size));
                m.add_attr(op, Attr::Int(total));
                true
            });
            run_rewriter(module, Store, |m, op| {
                let addr = m.op(op).operand(1);
                if m.op(addr).kind() != Addi {
                    return false;
                }
                let extra = m.op(addr).int_val();
                let base = m.op(addr).operand(0);
                let total = m.op(op).int_val() + extra;
                if !(-2048..=2047).contains(&total) {
                    return false;
                }
                folded += 1;
                m.set_operand(op, 1, base);
                let size = m.op(op).size();
                m.remove_attr(op, crate::core::AttrKind::Int);
                m.remove_attr(op, crate::core::AttrKind::Size);
                m.add_attr(op, Attr::Size(size));
                m.add_attr(op, Attr::Int(total));
                true
            });

            self.combined += folded;
            if folded == 0 {
                break;
            }
        }

        Ok(())
    }
}
