//! The RV64 [`TargetSpec`] wiring for the shared back-end machinery.

use crate::backend::TargetSpec;
use crate::core::{Attr, AttrKind, Module, OpId, OpKind, PReg};
use crate::dialects::rv::intrinsics::RvOp;
use crate::dialects::rv::regs;

pub struct RvTarget;

pub static TARGET: RvTarget = RvTarget;

impl TargetSpec for RvTarget {
    fn name(&self) -> &'static str {
        "rv"
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
        reg == regs::SP || reg == regs::ZERO
    }

    fn read_reg(&self) -> OpKind {
        RvOp::ReadReg.into()
    }

    fn write_reg(&self) -> OpKind {
        RvOp::WriteReg.into()
    }

    fn placeholder(&self) -> OpKind {
        RvOp::PlaceHolder.into()
    }

    fn call(&self) -> OpKind {
        RvOp::Call.into()
    }

    fn jump(&self) -> OpKind {
        RvOp::J.into()
    }

    fn sub_sp(&self) -> OpKind {
        RvOp::SubSp.into()
    }

    fn mv(&self, fp: bool) -> OpKind {
        if fp {
            RvOp::Fmv.into()
        } else {
            RvOp::Mv.into()
        }
    }

    fn load_imm(&self) -> OpKind {
        RvOp::Li.into()
    }

    fn load_addr(&self) -> OpKind {
        RvOp::La.into()
    }

    fn spill_store(&self, fp: bool) -> (OpKind, Vec<Attr>) {
        if fp {
            (RvOp::Fsd.into(), vec![])
        } else {
            (RvOp::Store.into(), vec![Attr::Size(8)])
        }
    }

    fn spill_load(&self, fp: bool) -> (OpKind, Vec<Attr>) {
        if fp {
            (RvOp::Fld.into(), vec![])
        } else {
            (RvOp::Load.into(), vec![Attr::Size(8)])
        }
    }

    fn mv_to_slot_reg(&self) -> OpKind {
        RvOp::Fmvdx.into()
    }

    fn mv_from_slot_reg(&self) -> OpKind {
        RvOp::Fmvxd.into()
    }

    fn has_rd(&self, module: &Module, op: OpId) -> bool {
        match module.op(op).kind() {
            OpKind::Rv(k) => k.has_rd(),
            _ => false,
        }
    }

    fn is_impure(&self, module: &Module, op: OpId) -> bool {
        use RvOp::*;
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
            OpKind::Rv(k) => matches!(
                k,
                Store | Fsd | Call | Ret | J | Beq | Bne | Blt | Bge | Ble | Bgt | WriteReg
                    | SubSp | PlaceHolder | Clone | Join | Wake
            ),
            OpKind::Arm(_) => true,
        }
    }
}
