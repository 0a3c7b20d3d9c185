//! Target rewrite rules for AArch64, run to fixed point: fold immediates
//! into add/ldr/str, fuse shifts into the shifted-operand add forms, fuse
//! mul+add into madd, and turn cbz/cbnz-of-cset into direct conditional
//! branches. Float fusion (fmadd) stays off at this level; it changes
//! precision.

use color_eyre::Report;

use crate::core::{Module, OpKind, Pass};
use crate::dialects::arm::intrinsics::ArmOp;
use crate::matcher::{MachineRule, MachineSig, MachineTable, Shape};

macro_rules! sig {
    ($name:literal, $kind:ident, $shape:ident) => {
        MachineSig { name: $name, kind: OpKind::Arm(ArmOp::$kind), shape: Shape::$shape }
    };
}

pub static MATCH_OPS: &[MachineSig] = &[
    sig!("strwr", StrWR, TernaryImm),
    sig!("strfr", StrFR, TernaryImm),
    sig!("strxr", StrXR, TernaryImm),
    sig!("addw", AddW, Binary),
    sig!("addx", AddX, Binary),
    sig!("fadd", Fadd, Binary),
    sig!("subw", SubW, Binary),
    sig!("subx", SubX, Binary),
    sig!("fsub", Fsub, Binary),
    sig!("mulw", MulW, Binary),
    sig!("mulx", MulX, Binary),
    sig!("fmul", Fmul, Binary),
    sig!("sdivw", SdivW, Binary),
    sig!("sdivx", SdivX, Binary),
    sig!("and", And, Binary),
    sig!("or", Or, Binary),
    sig!("eor", Eor, Binary),
    sig!("csetne", CsetNe, Binary),
    sig!("csetlt", CsetLt, Binary),
    sig!("csetle", CsetLe, Binary),
    sig!("cseteq", CsetEq, Binary),
    sig!("strw", StrW, BinaryImm),
    sig!("strf", StrF, BinaryImm),
    sig!("strx", StrX, BinaryImm),
    sig!("ldrwr", LdrWR, BinaryImm),
    sig!("ldrfr", LdrFR, BinaryImm),
    sig!("ldrxr", LdrXR, BinaryImm),
    sig!("addwi", AddWI, UnaryImm),
    sig!("addxi", AddXI, UnaryImm),
    sig!("subwi", SubWI, UnaryImm),
    sig!("ldrw", LdrW, UnaryImm),
    sig!("ldrf", LdrF, UnaryImm),
    sig!("ldrx", LdrX, UnaryImm),
    sig!("lslwi", LslWI, UnaryImm),
    sig!("lslxi", LslXI, UnaryImm),
    sig!("lsrwi", LsrWI, UnaryImm),
    sig!("lsrxi", LsrXI, UnaryImm),
    sig!("asrwi", AsrWI, UnaryImm),
    sig!("asrxi", AsrXI, UnaryImm),
    sig!("andi", AndI, UnaryImm),
    sig!("ori", OrI, UnaryImm),
    sig!("eori", EorI, UnaryImm),
    sig!("mov", MovI, Imm),
    sig!("neg", Neg, Unary),
    sig!("cbz", Cbz, Branch),
    sig!("cbnz", Cbnz, Branch),
    sig!("beq", Beq, BranchBinary),
    sig!("bne", Bne, BranchBinary),
    sig!("blt", Blt, BranchBinary),
    sig!("bgt", Bgt, BranchBinary),
    sig!("ble", Ble, BranchBinary),
    sig!("bge", Bge, BranchBinary),
    sig!("j", B, Jump),
];

pub static BUILD_OPS: &[MachineSig] = &[
    sig!("maddw", MaddW, Ternary),
    sig!("maddx", MaddX, Ternary),
    sig!("fmadd", Fmadd, Ternary),
    sig!("fmsub", Fmsub, Ternary),
    sig!("strwr", StrWR, TernaryImm),
    sig!("strxr", StrXR, TernaryImm),
    sig!("strfr", StrFR, TernaryImm),
    sig!("addw", AddW, Binary),
    sig!("addx", AddX, Binary),
    sig!("subw", SubW, Binary),
    sig!("mulw", MulW, Binary),
    sig!("mulx", MulX, Binary),
    sig!("sdivw", SdivW, Binary),
    sig!("sdivx", SdivX, Binary),
    sig!("and", And, Binary),
    sig!("or", Or, Binary),
    sig!("eor", Eor, Binary),
    sig!("csetne", CsetNe, Binary),
    sig!("csetlt", CsetLt, Binary),
    sig!("csetle", CsetLe, Binary),
    sig!("cseteq", CsetEq, Binary),
    sig!("strw", StrW, BinaryImm),
    sig!("strf", StrF, BinaryImm),
    sig!("strx", StrX, BinaryImm),
    sig!("addwl", AddWL, BinaryImm),
    sig!("addxl", AddXL, BinaryImm),
    sig!("addwar", AddWAR, BinaryImm),
    sig!("ldrwr", LdrWR, BinaryImm),
    sig!("ldrxr", LdrXR, BinaryImm),
    sig!("ldrfr", LdrFR, BinaryImm),
    sig!("addwi", AddWI, UnaryImm),
    sig!("addxi", AddXI, UnaryImm),
    sig!("subwi", SubWI, UnaryImm),
    sig!("ldrw", LdrW, UnaryImm),
    sig!("ldrf", LdrF, UnaryImm),
    sig!("ldrx", LdrX, UnaryImm),
    sig!("lslwi", LslWI, UnaryImm),
    sig!("lslxi", LslXI, UnaryImm),
    sig!("asrwi", AsrWI, UnaryImm),
    sig!("asrxi", AsrXI, UnaryImm),
    sig!("andi", AndI, UnaryImm),
    sig!("ori", OrI, UnaryImm),
    sig!("eori", EorI, UnaryImm),
    sig!("mov", MovI, Imm),
    sig!("neg", Neg, Unary),
    sig!("cbz", Cbz, Branch),
    sig!("cbnz", Cbnz, Branch),
    sig!("beq", Beq, BranchBinary),
    sig!("bne", Bne, BranchBinary),
    sig!("blt", Blt, BranchBinary),
    sig!("bgt", Bgt, BranchBinary),
    sig!("ble", Ble, BranchBinary),
    sig!("bge", Bge, BranchBinary),
    sig!("b", B, Jump),
];

pub static TABLE: MachineTable = MachineTable {
    match_ops: MATCH_OPS,
    build_ops: BUILD_OPS,
    const_op: OpKind::Arm(ArmOp::MovI),
};

lazy_static! {
    static ref RULES: Vec<MachineRule> = [
        // ADD
        "(change (addw x (mov #a)) (!only-if (!inbit 12 #a) (addwi x #a)))",
        "(change (addx x (mov #a)) (!only-if (!inbit 12 #a) (addxi x #a)))",
        "(change (addw x (lslwi y #a)) (addwl x y #a))",
        "(change (addw (lslwi y #a) x) (addwl x y #a))",
        "(change (addx x (lslwi y #a)) (addxl x y #a))",
        "(change (addx (lslwi y #a) x) (addxl x y #a))",
        "(change (addw x (lslxi y #a)) (addwl x y #a))",
        "(change (addw (lslxi y #a) x) (addwl x y #a))",
        "(change (addx x (lslxi y #a)) (addxl x y #a))",
        "(change (addx (lslxi y #a) x) (addxl x y #a))",
        "(change (addw x (asrwi y #a)) (addwar x y #a))",
        "(change (addw (asrwi y #a) x) (addwar x y #a))",
        "(change (addw (mulw x y) z) (maddw x y z))",
        "(change (addw z (mulw x y)) (maddw x y z))",
        // FADD/FSUB fusion would change precision; leave it alone.
        // SUB
        "(change (subw x (mov #a)) (!only-if (!inbit 12 (!minus #a)) (addwi x (!minus #a))))",
        "(change (subx x (mov #a)) (!only-if (!inbit 12 (!minus #a)) (addxi x (!minus #a))))",
        // CBZ
        "(change (cbz (csetlt x y) >ifso >ifnot) (blt x y >ifnot >ifso))",
        "(change (cbz (csetle x y) >ifso >ifnot) (ble x y >ifnot >ifso))",
        "(change (cbz (csetne x y) >ifso >ifnot) (beq x y >ifso >ifnot))",
        "(change (cbz (cseteq x y) >ifso >ifnot) (bne x y >ifso >ifnot))",
        // CBNZ
        "(change (cbnz (csetlt x y) >ifso >ifnot) (blt x y >ifso >ifnot))",
        "(change (cbnz (csetle x y) >ifso >ifnot) (ble x y >ifso >ifnot))",
        "(change (cbnz (csetne x y) >ifso >ifnot) (bne x y >ifso >ifnot))",
        "(change (cbnz (cseteq x y) >ifso >ifnot) (beq x y >ifso >ifnot))",
        // LDR
        "(change (ldrw (addxi x #a) #b) (!only-if (!inbit 12 (!add #a #b)) (ldrw x (!add #a #b))))",
        "(change (ldrx (addxi x #a) #b) (!only-if (!inbit 12 (!add #a #b)) (ldrx x (!add #a #b))))",
        "(change (ldrf (addxi x #a) #b) (!only-if (!inbit 12 (!add #a #b)) (ldrf x (!add #a #b))))",
        "(change (ldrw (addx x y) #a) (!only-if (!eq #a 0) (ldrwr x y #a)))",
        "(change (ldrx (addx x y) #a) (!only-if (!eq #a 0) (ldrxr x y #a)))",
        "(change (ldrf (addx x y) #a) (!only-if (!eq #a 0) (ldrfr x y #a)))",
        "(change (ldrwr x (lslxi y #a) #b) (!only-if (!eq (!add #a #b) 2) (ldrwr x y 2)))",
        "(change (ldrxr x (lslxi y #a) #b) (!only-if (!eq (!add #a #b) 3) (ldrxr x y 3)))",
        "(change (ldrfr x (lslxi y #a) #b) (!only-if (!eq (!add #a #b) 2) (ldrfr x y 2)))",
        // STR
        "(change (strw y (addxi x #a) #b) (!only-if (!inbit 12 (!add #a #b)) (strw y x (!add #a #b))))",
        "(change (strx y (addxi x #a) #b) (!only-if (!inbit 12 (!add #a #b)) (strx y x (!add #a #b))))",
        "(change (strf y (addxi x #a) #b) (!only-if (!inbit 12 (!add #a #b)) (strf y x (!add #a #b))))",
        "(change (strw z (addx x y) #a) (!only-if (!eq #a 0) (strwr z x y #a)))",
        "(change (strx z (addx x y) #a) (!only-if (!eq #a 0) (strxr z x y #a)))",
        "(change (strf z (addx x y) #a) (!only-if (!eq #a 0) (strfr z x y #a)))",
        "(change (strwr z x (lslxi y #a) #b) (!only-if (!eq (!add #a #b) 2) (strwr z x y 2)))",
        "(change (strxr z x (lslxi y #a) #b) (!only-if (!eq (!add #a #b) 3) (strxr z x y 3)))",
        "(change (strfr z x (lslxi y #a) #b) (!only-if (!eq (!add #a #b) 2) (strfr z x y 2)))",
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
        "arm-inst-combine"
    }

    fn stats(&self) -> Vec<(&'static str, usize)> {
        vec![("combined-ops", self.combined)]
    }

    fn run(&mut self, module: &mut Module) -> Result<(), Report> {
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
            self.combined += folded;
            if folded == 0 {
                break;
            }
        }
        Ok(())
    }
}
