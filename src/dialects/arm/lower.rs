//! Instruction selection for AArch64: straight opcode substitution where a
//! machine op matches one-to-one, plus the AAPCS64 calling convention
//! (first eight integer/float args in x0-x7 / v0-v7, the rest spilled with
//! 16-byte alignment), width-split loads/stores, and alloca rewriting to
//! `sp + offset` with a per-function frame size attribute.

use color_eyre::Report;

use crate::core::{run_rewriter, Attr, Builder, Module, OpId, Pass, Ty};
use crate::dialects::arm::intrinsics::ArmOp;
use crate::dialects::arm::regs;
use crate::dialects::sys::SysOp;

#[derive(Default)]
pub struct Lower;

fn round16(x: i64) -> i64 {
    if x % 16 == 0 {
        x
    } else {
        x / 16 * 16 + 16
    }
}

fn replace_all(module: &mut Module, from: SysOp, to: ArmOp) {
    run_rewriter(module, from, |m, op| {
        let operands = m.op(op).operands().to_vec();
        let attrs: Vec<Attr> = m.op(op).attrs().iter().map(|a| (**a).clone()).collect();
        let ty = m.op(op).result_ty();
        let mut b = Builder::new(m);
        b.replace_ty(op, ty, to, &operands, attrs);
        true
    });
}

fn rewrite_alloca(module: &mut Module, func: OpId) {
    let region = module.func_region(func);
    let block = module.region(region).first_block();

    // All allocas sit in the first block; lay them out 16-byte aligned.
    let mut total: i64 = 0;
    let mut allocas = Vec::new();
    for &op in module.block(block).ops() {
        if module.op(op).kind() != SysOp::Alloca {
            continue;
        }
        total = round16(total);
        allocas.push((op, total));
        total += module.op(op).size() as i64;
    }

    for (op, offset) in allocas {
        let mut b = Builder::new(module);
        b.set_before_op(op);
        let sp = b.create_ty(Ty::I64, ArmOp::ReadReg, &[], vec![Attr::Reg(regs::SP)]);
        let off = b.create(ArmOp::MovI, &[], vec![Attr::Int(offset as i32)]);
        let add = b.create(ArmOp::AddX, &[sp, off], vec![]);
        module.replace_op_with(op, add);
    }

    module.add_attr(func, Attr::StackOffset(total));
}

impl Pass for Lower {
    fn name(&self) -> &'static str {
        "arm-lower"
    }

    fn run(&mut self, module: &mut Module) -> Result<(), Report> {
        use ArmOp::*;

        for (from, to) in [
            (SysOp::GetGlobal, Adr),
            (SysOp::AddI, AddW),
            (SysOp::AddL, AddX),
            (SysOp::SubI, SubW),
            (SysOp::SubL, SubX),
            (SysOp::MulI, MulW),
            (SysOp::MulL, MulX),
            (SysOp::DivI, SdivW),
            (SysOp::DivL, SdivX),
            (SysOp::LShiftL, LslX),
            (SysOp::LShift, LslW),
            (SysOp::RShiftL, AsrX),
            (SysOp::RShift, AsrW),
            (SysOp::Mulsh, Mulsh),
            (SysOp::AndI, And),
            (SysOp::OrI, Or),
            (SysOp::XorI, Eor),
            (SysOp::Goto, B),
            (SysOp::Branch, Cbnz),
            (SysOp::Int, MovI),
            (SysOp::F2I, Fcvtzs),
            (SysOp::I2F, Scvtf),
            (SysOp::AddF, Fadd),
            (SysOp::SubF, Fsub),
            (SysOp::MulF, Fmul),
            (SysOp::DivF, Fdiv),
            (SysOp::Minus, Neg),
            (SysOp::MinusF, Fneg),
            (SysOp::Eq, CsetEq),
            (SysOp::Ne, CsetNe),
            (SysOp::Lt, CsetLt),
            (SysOp::Le, CsetLe),
            (SysOp::EqF, CsetEqF),
            (SysOp::NeF, CsetNeF),
            (SysOp::LtF, CsetLtF),
            (SysOp::LeF, CsetLeF),
            (SysOp::Select, CselNeZ),
            (SysOp::Broadcast, Dup),
            (SysOp::AddV, AddV),
            (SysOp::MulV, MulV),
            (SysOp::Clone, Clone),
            (SysOp::Join, Join),
            (SysOp::Wake, Wake),
        ] {
            replace_all(module, from, to);
        }

        // Float constants come in through an integer move of the bits.
        run_rewriter(module, SysOp::Float, |m, op| {
            let bits = m.op(op).float_val().to_bits() as i32;
            let mut b = Builder::new(m);
            b.set_before_op(op);
            let li = b.create(MovI, &[], vec![Attr::Int(bits)]);
            b.replace(op, FmovW, &[li], vec![]);
            true
        });

        run_rewriter(module, SysOp::Not, |m, op| {
            let def = m.op(op).operand(0);
            let is_f32 = m.op(def).result_ty() == Ty::F32;
            let mut b = Builder::new(m);
            if is_f32 {
                b.replace(op, CsetEqFcmpZ, &[def], vec![]);
            } else {
                b.replace(op, CsetEqTst, &[def, def], vec![]);
            }
            false
        });

        run_rewriter(module, SysOp::SetNotZero, |m, op| {
            let def = m.op(op).operand(0);
            let is_f32 = m.op(def).result_ty() == Ty::F32;
            let mut b = Builder::new(m);
            if is_f32 {
                b.replace(op, CsetNeFcmpZ, &[def], vec![]);
            } else {
                b.replace(op, CsetNeTst, &[def, def], vec![]);
            }
            false
        });

        // x % y is sdiv + msub.
        run_rewriter(module, SysOp::ModI, |m, op| {
            let x = m.op(op).operand(0);
            let y = m.op(op).operand(1);
            let mut b = Builder::new(m);
            b.set_before_op(op);
            let sdiv = b.create(SdivW, &[x, y], vec![]);
            b.replace(op, MsubW, &[sdiv, y, x], vec![]);
            false
        });
        run_rewriter(module, SysOp::ModL, |m, op| {
            let x = m.op(op).operand(0);
            let y = m.op(op).operand(1);
            let mut b = Builder::new(m);
            b.set_before_op(op);
            let sdiv = b.create(SdivX, &[x, y], vec![]);
            b.replace(op, MsubX, &[sdiv, y, x], vec![]);
            false
        });

        // x % 2.0 style float mods lower through div/mul/sub.
        run_rewriter(module, SysOp::ModF, |m, op| {
            let x = m.op(op).operand(0);
            let y = m.op(op).operand(1);
            let mut b = Builder::new(m);
            b.set_before_op(op);
            let quot = b.create(Fdiv, &[x, y], vec![]);
            let mul = b.create(Fmul, &[quot, y], vec![]);
            b.replace(op, Fsub, &[x, mul], vec![]);
            true
        });

        // Width-specific memory ops.
        run_rewriter(module, SysOp::Store, |m, op| {
            let value = m.op(op).operand(0);
            let operands = m.op(op).operands().to_vec();
            let ty = m.op(value).result_ty();
            let size = m.op(op).size();
            let mut b = Builder::new(m);
            if ty == Ty::F32 {
                b.replace(op, StrF, &operands, vec![Attr::Int(0)]);
            } else if ty == Ty::I128 && size == 16 {
                b.replace(op, St1, &operands, vec![]);
            } else if size == 8 {
                b.replace(op, StrX, &operands, vec![Attr::Int(0)]);
            } else {
                b.replace(op, StrW, &operands, vec![Attr::Int(0)]);
            }
            false
        });
        run_rewriter(module, SysOp::Load, |m, op| {
            let ty = m.op(op).result_ty();
            let size = m.op(op).size();
            let operands = m.op(op).operands().to_vec();
            let mut b = Builder::new(m);
            if ty == Ty::F32 {
                b.replace_ty(op, Ty::F32, LdrF, &operands, vec![Attr::Int(0)]);
            } else if ty == Ty::I128 && size == 16 {
                b.replace_ty(op, Ty::I128, Ld1, &operands, vec![]);
            } else if size == 8 {
                b.replace_ty(op, Ty::I64, LdrX, &operands, vec![Attr::Int(0)]);
            } else {
                b.replace_ty(op, Ty::I32, LdrW, &operands, vec![Attr::Int(0)]);
            }
            false
        });

        // Calls: the first eight args of each class ride registers, the
        // rest go to a 16-byte-aligned stack bump bracketed around the bl.
        run_rewriter(module, SysOp::Call, |m, op| {
            let args = m.op(op).operands().to_vec();
            let name = m.op(op).name().to_string();
            let result_fp = m.op(op).result_ty() == Ty::F32;

            let mut b = Builder::new(m);
            b.set_before_op(op);

            let mut regs_new = Vec::new();
            let mut spilled = Vec::new();
            let (mut cnt, mut fcnt) = (0usize, 0usize);
            for &arg in &args {
                let fp = b.module.op(arg).result_ty() == Ty::F32;
                if fp && fcnt < 8 {
                    let w = b.create(
                        WriteReg,
                        &[arg],
                        vec![Attr::Reg(regs::FARG_REGS[fcnt])],
                    );
                    regs_new.push(w);
                    fcnt += 1;
                } else if !fp && cnt < 8 {
                    let w =
                        b.create(WriteReg, &[arg], vec![Attr::Reg(regs::ARG_REGS[cnt])]);
                    regs_new.push(w);
                    cnt += 1;
                } else {
                    spilled.push(arg);
                }
            }

            let mut stack = (spilled.len() * 8) as i64;
            if stack % 16 != 0 {
                stack = stack / 16 * 16 + 16;
            }
            if stack > 0 {
                b.create(SubSp, &[], vec![Attr::Int(stack as i32)]);
            }
            for (i, &arg) in spilled.iter().enumerate() {
                let sp = b.create_ty(Ty::I64, ReadReg, &[], vec![Attr::Reg(regs::SP)]);
                let fp = b.module.op(arg).result_ty() == Ty::F32;
                let kind = if fp { StrF } else { StrX };
                b.create(
                    kind,
                    &[arg, sp],
                    vec![Attr::Size(8), Attr::Int((i * 8) as i32)],
                );
            }

            b.create(
                Bl,
                &regs_new,
                vec![Attr::Name(name), Attr::ArgCount(args.len())],
            );

            if stack > 0 {
                b.create(SubSp, &[], vec![Attr::Int(-(stack as i32))]);
            }

            // The result reads back from x0 / v0.
            if result_fp {
                b.replace_ty(op, Ty::F32, ReadReg, &[], vec![Attr::Reg(regs::v(0))]);
            } else {
                b.replace_ty(op, Ty::I64, ReadReg, &[], vec![Attr::Reg(regs::x(0))]);
            }
            true
        });

        run_rewriter(module, SysOp::Return, |m, op| {
            if m.op(op).operand_count() > 0 {
                let value = m.op(op).operand(0);
                let fp = m.op(value).result_ty() == Ty::F32;
                let mut b = Builder::new(m);
                b.set_before_op(op);
                let reg = if fp { regs::v(0) } else { regs::x(0) };
                let virt = b.create(WriteReg, &[value], vec![Attr::Reg(reg)]);
                b.replace(op, Ret, &[virt], vec![]);
                return true;
            }
            let mut b = Builder::new(m);
            b.replace(op, Ret, &[], vec![]);
            true
        });

        // mov x, 0 reads the zero register instead.
        run_rewriter(module, MovI, |m, op| {
            if m.op(op).int_val() == 0 {
                let mut b = Builder::new(m);
                b.replace_ty(op, Ty::I64, ReadReg, &[], vec![Attr::Reg(regs::XZR)]);
            }
            false
        });

        for func in module.funcs() {
            rewrite_alloca(module, func);
        }
        Ok(())
    }
}
