//! The AArch64 [`TargetSpec`] wiring for the shared back-end machinery.

use crate::backend::TargetSpec;
use crate::core::{Attr, AttrKind, Module, OpId, OpKind, PReg};
use crate::dialects::arm::intrinsics::ArmOp;
use crate::dialects::arm::regs;

pub struct ArmTarget;

pub static TARGET: ArmTarget = ArmTarget;

impl TargetSpec for ArmTarget {
    fn name(&self) -> &'static str {
        "arm"
    }

    fn arg_regs(&self) -> &'static [PReg] {
        &regs::ARG_REGS
    }

    fn farg_regs(&self) -> &'static [PReg] {
        &regs::FARG_REGS
    }

    fn caller_saved(&self) -> &'static [PReg] {
        &regs::CALLER_SAVED
    }

    fn callee_saved(&self, reg: PReg) -> bool {
        regs::callee_saved(reg)
    }

    fn order(&self, _leaf: bool, fp: bool) -> &'static [PReg] {
        // The leaf and non-leaf orders coincide on this target; both lead
        // with the temporaries.
        if fp {
            &regs::ORDER_F
        } else {
            &regs::ORDER
        }
    }

    fn spill_reg(&self, which: usize, fp: bool) -> PReg {
        match (which, fp) {
            (0, false) => regs::SPILL,
            (1, false) => regs::SPILL2,
            (2, false) => regs::SPILL3,
            (0, true) => regs::FSPILL,
            (1, true) => regs::FSPILL2,
            _ => regs::FSPILL3,
        }
    }

    fn sp(&self) -> PReg {
        regs::SP
    }

    fn is_reserved(&self, reg: PReg) -> bool {
        reg == regs::SP || reg == regs::XZR
    }

    fn read_reg(&self) -> OpKind {
        ArmOp::ReadReg.into()
    }

    fn write_reg(&self) -> OpKind {
        ArmOp::WriteReg.into()
    }

    fn placeholder(&self) -> OpKind {
        ArmOp::PlaceHolder.into()
    }

    fn call(&self) -> OpKind {
        ArmOp::Bl.into()
    }

    fn jump(&self) -> OpKind {
        ArmOp::B.into()
    }

    fn sub_sp(&self) -> OpKind {
        ArmOp::SubSp.into()
    }

    fn mv(&self, fp: bool) -> OpKind {
        if fp {
            ArmOp::Fmov.into()
        } else {
            ArmOp::MovR.into()
        }
    }

    fn load_imm(&self) -> OpKind {
        ArmOp::MovI.into()
    }

    fn load_addr(&self) -> OpKind {
        ArmOp::Adr.into()
    }

    fn spill_store(&self, fp: bool) -> (OpKind, Vec<Attr>) {
        if fp {
            (ArmOp::StrF.into(), vec![])
        } else {
            (ArmOp::StrX.into(), vec![])
        }
    }

    fn spill_load(&self, fp: bool) -> (OpKind, Vec<Attr>) {
        if fp {
            (ArmOp::LdrF.into(), vec![])
        } else {
            (ArmOp::LdrX.into(), vec![])
        }
    }

    fn mv_to_slot_reg(&self) -> OpKind {
        ArmOp::FmovX.into()
    }

    fn mv_from_slot_reg(&self) -> OpKind {
        ArmOp::FmovD.into()
    }

    fn has_rd(&self, module: &Module, op: OpId) -> bool {
        match module.op(op).kind() {
            OpKind::Arm(k) => k.has_rd(),
            _ => false,
        }
    }

    fn is_impure(&self, module: &Module, op: OpId) -> bool {
        use ArmOp::*;
        if module.op(op).has_attr(AttrKind::Impure) {
            return true;
        }
        match module.op(op).kind() {
            OpKind::Sys(k) => matches!(
                k,
                crate::dialects::sys::SysOp::Alloca
                    | crate::dialects::sys::SysOp::GetArg
                    | crate::dialects::sys::SysOp::Phi
                    | crate::dialects::sys::SysOp::Clone
                    | crate::dialects::sys::SysOp::Join
                    | crate::dialects::sys::SysOp::Wake
            ),
            OpKind::Arm(k) => matches!(
                k,
                StrF | StrW | StrX | StrD | StpX | StpD | StrFP | StrWP | StrXP | StrFR
                    | StrWR | StrXR | St1 | Bl | Bgt | Blt | Ble | Beq | Bne | Bge | Ret | Cbz
                    | Cbnz | B | WriteReg | SubSp | PlaceHolder | Clone | Join | Wake
            ),
            OpKind::Rv(_) => true,
        }
    }
}
