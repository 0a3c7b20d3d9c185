//! RV64GC machine opcodes.
//!
//! Unlike the AArch64 dialect, loads and stores stay width-generic here and
//! the emitter picks `lw`/`ld`/`flw`/`sw`/`sd`/`fsw` from the Size attr and
//! result type.

use crate::{OpKind, Ty};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum RvOp {
    /// Load immediate.
    Li,
    /// Load a symbol address.
    La,
    Add,
    Addw,
    Addiw,
    /// Pointers can't be `addiw`'d; 64-bit immediate add.
    Addi,
    Sub,
    Subw,
    Mulw,
    Mul,
    /// Signed; there is no unsigned division in the source language.
    Divw,
    Div,
    Remw,
    Rem,
    /// Higher bits of a multiply, signed.
    Mulh,
    /// Higher bits of a multiply, unsigned.
    Mulhu,

    // Shifts; the `i` forms take the amount from the Int attr.
    Slliw,
    Slli,
    Srliw,
    Srli,
    Sraiw,
    Srai,
    Sllw,
    Sll,
    Srlw,
    Srl,
    Sraw,
    Sra,

    // Logical.
    And,
    Or,
    Xor,
    Andi,
    Ori,
    Xori,

    // Compare-and-branch; Ble/Bgt are pseudos with swapped sources.
    Bne,
    Beq,
    Blt,
    Bge,
    Ble,
    Bgt,

    // Set pseudos.
    Seqz,
    Snez,
    Slt,
    Slti,

    J,
    Mv,
    Ret,
    Call,

    // Memory; width chosen at dump time from Size/result type.
    Load,
    Store,
    /// These are only used in stack save/restore.
    Fld,
    Fsd,

    /// Allocate stack space: `addi sp, sp, -imm`.
    SubSp,
    /// Read from a real register.
    ReadReg,
    /// Write to a real register; the SSA value is pre-colored in RegAlloc.
    WriteReg,
    /// Holds a place to denote a register isn't available across a clobber.
    PlaceHolder,

    // Float.
    /// i32 -> f32.
    Fcvtsw,
    /// f32 -> i32, round to zero.
    FcvtwsRtz,
    /// Copies a bit pattern from an x-register to an f-register.
    Fmvwx,
    Fmvdx,
    Fmvxd,
    /// These compare ops are emitted with a `.s` suffix.
    Feq,
    Flt,
    Fle,
    Fadd,
    Fsub,
    Fmul,
    Fdiv,
    Fmadd,
    Fmv,

    // Thread primitives.
    Clone,
    Join,
    Wake,
}

impl RvOp {
    pub fn name(self) -> &'static str {
        use RvOp::*;
        match self {
            Li => "li",
            La => "la",
            Add => "add",
            Addw => "addw",
            Addiw => "addiw",
            Addi => "addi",
            Sub => "sub",
            Subw => "subw",
            Mulw => "mulw",
            Mul => "mul",
            Divw => "divw",
            Div => "div",
            Remw => "remw",
            Rem => "rem",
            Mulh => "mulh",
            Mulhu => "mulhu",
            Slliw => "slliw",
            Slli => "slli",
            Srliw => "srliw",
            Srli => "srli",
            Sraiw => "sraiw",
            Srai => "srai",
            Sllw => "sllw",
            Sll => "sll",
            Srlw => "srlw",
            Srl => "srl",
            Sraw => "sraw",
            Sra => "sra",
            And => "and",
            Or => "or",
            Xor => "xor",
            Andi => "andi",
            Ori => "ori",
            Xori => "xori",
            Bne => "bne",
            Beq => "beq",
            Blt => "blt",
            Bge => "bge",
            Ble => "ble",
            Bgt => "bgt",
            Seqz => "seqz",
            Snez => "snez",
            Slt => "slt",
            Slti => "slti",
            J => "j",
            Mv => "mv",
            Ret => "ret",
            Call => "call",
            Load => "load",
            Store => "store",
            Fld => "fld",
            Fsd => "fsd",
            SubSp => "subsp",
            ReadReg => "readreg",
            WriteReg => "writereg",
            PlaceHolder => "placeholder",
            Fcvtsw => "fcvtsw",
            FcvtwsRtz => "fcvtwsrtz",
            Fmvwx => "fmvwx",
            Fmvdx => "fmvdx",
            Fmvxd => "fmvxd",
            Feq => "feq",
            Flt => "flt",
            Fle => "fle",
            Fadd => "fadd",
            Fsub => "fsub",
            Fmul => "fmul",
            Fdiv => "fdiv",
            Fmadd => "fmadd",
            Fmv => "fmv",
            Clone => "clone",
            Join => "join",
            Wake => "wake",
        }
    }

    pub fn default_ty(self) -> Ty {
        use RvOp::*;
        match self {
            La | Add | Addi | Sub | Mul | Div | Rem | Slli | Srli | Srai | Sll | Srl | Sra
            | Fmvxd => Ty::I64,
            Fcvtsw | Fmvwx | Fmvdx | Fadd | Fsub | Fmul | Fdiv | Fmadd | Fmv => Ty::F32,
            _ => Ty::I32,
        }
    }

    pub fn has_rd(self) -> bool {
        use RvOp::*;
        !matches!(
            self,
            Store | Fsd | Ret | J | Beq | Blt | Bge | Bne | Ble | Bgt | WriteReg | Call | SubSp
                | PlaceHolder | Clone | Join | Wake
        )
    }

    pub fn is_terminator(self) -> bool {
        use RvOp::*;
        matches!(self, J | Beq | Bne | Blt | Bge | Ble | Bgt | Ret)
    }
}

impl From<RvOp> for OpKind {
    fn from(op: RvOp) -> OpKind {
        OpKind::Rv(op)
    }
}

impl PartialEq<RvOp> for OpKind {
    fn eq(&self, other: &RvOp) -> bool {
        matches!(self, OpKind::Rv(k) if k == other)
    }
}
