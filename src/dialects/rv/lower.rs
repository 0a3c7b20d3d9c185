//! Instruction selection for RV64GC: opcode substitution, select lowered
//! through a diamond of branches (RISC-V has no csel), compare-and-branch
//! fusion (with operand swaps for the missing ble/bgt encodings), the
//! lp64d calling convention via WriteReg/ReadReg brackets, and alloca
//! rewriting to `sp + offset`.

use color_eyre::Report;

use crate::core::{run_rewriter, Attr, Builder, Module, OpId, Pass, Ty};
use crate::dialects::rv::intrinsics::RvOp;
use crate::dialects::rv::regs;
use crate::dialects::sys::SysOp;

#[derive(Default)]
pub struct Lower;

fn replace_all(module: &mut Module, from: SysOp, to: RvOp) {
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

    let mut offset: i64 = 0;
    let mut total: i64 = 0;
    let mut allocas = Vec::new();
    for &op in module.block(block).ops() {
        if module.op(op).kind() != SysOp::Alloca {
            continue;
        }
        total += module.op(op).size() as i64;
        allocas.push(op);
    }

    for op in allocas {
        let size = module.op(op).size() as i64;
        let mut b = Builder::new(module);
        b.set_before_op(op);
        let sp = b.create_ty(Ty::I64, RvOp::ReadReg, &[], vec![Attr::Reg(regs::SP)]);
        let off = b.create(RvOp::Li, &[], vec![Attr::Int(offset as i32)]);
        let add = b.create(RvOp::Add, &[sp, off], vec![]);
        module.replace_op_with(op, add);
        offset += size;
    }

    module.add_attr(func, Attr::StackOffset(total));
}

impl Pass for Lower {
    fn name(&self) -> &'static str {
        "rv-lower"
    }

    fn run(&mut self, module: &mut Module) -> Result<(), Report> {
        use RvOp::*;

        // Phi result types first: any float operand makes the phi float.
        crate::core::cleanup(module);

        // RISC-V has no conditional select; branch around a diamond and
        // phi the two sides together.
        run_rewriter(module, SysOp::Select, |m, op| {
            let x = m.op(op).operand(0);
            let y = m.op(op).operand(1);
            let z = m.op(op).operand(2);
            let parent = m.op(op).parent().unwrap();
            let region = m.block(parent).parent();

            let tgt = m.append_block(region);
            let bb1 = m.append_block(region);
            let bb2 = m.append_block(region);

            m.split_ops_after(tgt, op);
            m.move_op_to_end(op, parent);
            m.move_block_after(tgt, parent);
            m.move_block_before(bb1, tgt);
            m.move_block_before(bb2, tgt);

            // The select itself moves into the join block as a phi.
            let mut b = Builder::new(m);
            b.set_to_block_end(bb1);
            b.create(SysOp::Goto, &[], vec![Attr::Target(tgt)]);
            let mut b = Builder::new(m);
            b.set_to_block_end(bb2);
            b.create(SysOp::Goto, &[], vec![Attr::Target(tgt)]);

            m.move_op_to_start(op, tgt);
            let ty = m.op(op).result_ty();
            let mut b = Builder::new(m);
            b.set_before_op(op);
            let phi = b.create_ty(
                ty,
                SysOp::Phi,
                &[y, z],
                vec![Attr::From(bb1), Attr::From(bb2)],
            );
            m.replace_op_with(op, phi);

            let mut b = Builder::new(m);
            b.set_to_block_end(parent);
            b.create(
                SysOp::Branch,
                &[x],
                vec![Attr::Target(bb1), Attr::Else(bb2)],
            );

            // Successor phis now see the join block as their predecessor.
            let succs = m.block(parent).succs.clone();
            for succ in succs {
                for phi in m.phis(succ) {
                    for i in 0..m.op(phi).operand_count() {
                        if m.op(phi).from_at(i) == parent {
                            m.set_attr(phi, i, Attr::From(tgt));
                        }
                    }
                }
            }
            m.update_preds(region);
            false
        });

        for (from, to) in [
            (SysOp::Int, Li),
            (SysOp::AddI, Addw),
            (SysOp::AddL, Add),
            (SysOp::SubI, Subw),
            (SysOp::SubL, Sub),
            (SysOp::MulI, Mulw),
            (SysOp::MulL, Mul),
            (SysOp::Mulsh, Mulh),
            (SysOp::Muluh, Mulhu),
            (SysOp::DivI, Divw),
            (SysOp::DivL, Div),
            (SysOp::ModL, Rem),
            (SysOp::LShift, Sllw),
            (SysOp::LShiftL, Sll),
            (SysOp::RShift, Sraw),
            (SysOp::RShiftL, Sra),
            (SysOp::Goto, J),
            (SysOp::GetGlobal, La),
            (SysOp::AndI, And),
            (SysOp::OrI, Or),
            (SysOp::XorI, Xor),
            (SysOp::AddF, Fadd),
            (SysOp::SubF, Fsub),
            (SysOp::MulF, Fmul),
            (SysOp::DivF, Fdiv),
            (SysOp::LtF, Flt),
            (SysOp::EqF, Feq),
            (SysOp::LeF, Fle),
            (SysOp::F2I, FcvtwsRtz),
            (SysOp::I2F, Fcvtsw),
            (SysOp::Clone, Clone),
            (SysOp::Join, Join),
            (SysOp::Wake, Wake),
        ] {
            replace_all(module, from, to);
        }

        run_rewriter(module, SysOp::Float, |m, op| {
            let bits = m.op(op).float_val().to_bits() as i32;
            let mut b = Builder::new(m);
            b.set_before_op(op);
            let li = b.create(Li, &[], vec![Attr::Int(bits)]);
            b.replace(op, Fmvwx, &[li], vec![]);
            true
        });

        run_rewriter(module, SysOp::Minus, |m, op| {
            let value = m.op(op).operand(0);
            let mut b = Builder::new(m);
            b.set_before_op(op);
            let zero = b.create(Li, &[], vec![Attr::Int(0)]);
            b.replace(op, Sub, &[zero, value], vec![]);
            true
        });
        run_rewriter(module, SysOp::MinusF, |m, op| {
            let value = m.op(op).operand(0);
            let mut b = Builder::new(m);
            b.set_before_op(op);
            let zero = b.create(Li, &[], vec![Attr::Int(0)]);
            let zerof = b.create(Fmvwx, &[zero], vec![]);
            b.replace(op, Fsub, &[zerof, value], vec![]);
            true
        });

        run_rewriter(module, SysOp::ModI, |m, op| {
            let denom = m.op(op).operand(0);
            let nom = m.op(op).operand(1);
            let mut b = Builder::new(m);
            b.set_before_op(op);
            let quot = b.create(Divw, &[denom, nom], vec![]);
            let mul = b.create(Mulw, &[quot, nom], vec![]);
            b.replace(op, Sub, &[denom, mul], vec![]);
            true
        });
        run_rewriter(module, SysOp::ModF, |m, op| {
            let denom = m.op(op).operand(0);
            let nom = m.op(op).operand(1);
            let mut b = Builder::new(m);
            b.set_before_op(op);
            let quot = b.create(Fdiv, &[denom, nom], vec![]);
            let mul = b.create(Fmul, &[quot, nom], vec![]);
            b.replace(op, Fsub, &[denom, mul], vec![]);
            true
        });

        run_rewriter(module, SysOp::SetNotZero, |m, op| {
            let def = m.op(op).operand(0);
            if m.op(def).result_ty() == Ty::F32 {
                let mut b = Builder::new(m);
                b.set_before_op(op);
                let zero = b.create(Li, &[], vec![Attr::Int(0)]);
                let zerof = b.create(Fmvwx, &[zero], vec![]);
                let iszero = b.create(Feq, &[def, zerof], vec![]);
                b.replace(op, Seqz, &[iszero], vec![]);
                return true;
            }
            let mut b = Builder::new(m);
            b.replace(op, Snez, &[def], vec![]);
            true
        });
        run_rewriter(module, SysOp::Not, |m, op| {
            let def = m.op(op).operand(0);
            if m.op(def).result_ty() == Ty::F32 {
                let mut b = Builder::new(m);
                b.set_before_op(op);
                let zero = b.create(Li, &[], vec![Attr::Int(0)]);
                let zerof = b.create(Fmvwx, &[zero], vec![]);
                b.replace(op, Feq, &[def, zerof], vec![]);
                return true;
            }
            let mut b = Builder::new(m);
            b.replace(op, Seqz, &[def], vec![]);
            true
        });

        // Compare-and-branch fusion; `<=` swaps into bge.
        run_rewriter(module, SysOp::Branch, |m, op| {
            let cond = m.op(op).operand(0);
            let attrs: Vec<Attr> = m.op(op).attrs().iter().map(|a| (**a).clone()).collect();
            let ckind = m.op(cond).kind();
            let mut b = Builder::new(m);
            if ckind == SysOp::Eq {
                let o = m.op(cond).operands().to_vec();
                let mut b = Builder::new(m);
                b.replace(op, Beq, &o, attrs);
                return true;
            }
            if ckind == SysOp::Ne {
                let o = m.op(cond).operands().to_vec();
                let mut b = Builder::new(m);
                b.replace(op, Bne, &o, attrs);
                return true;
            }
            if ckind == SysOp::Le {
                let v1 = m.op(cond).operand(0);
                let v2 = m.op(cond).operand(1);
                let mut b = Builder::new(m);
                b.replace(op, Bge, &[v2, v1], attrs);
                return true;
            }
            if ckind == SysOp::Lt {
                let o = m.op(cond).operands().to_vec();
                let mut b = Builder::new(m);
                b.replace(op, Blt, &o, attrs);
                return true;
            }
            b.set_before_op(op);
            let zero = b.create_ty(Ty::I32, ReadReg, &[], vec![Attr::Reg(regs::ZERO)]);
            b.replace(op, Bne, &[cond, zero], attrs);
            true
        });

        // Set pseudos, delayed until branches took their compares.
        replace_all(module, SysOp::Lt, Slt);
        run_rewriter(module, SysOp::Eq, |m, op| {
            let operands = m.op(op).operands().to_vec();
            let mut b = Builder::new(m);
            b.set_before_op(op);
            let xor_op = b.create(Xor, &operands, vec![]);
            b.replace(op, Seqz, &[xor_op], vec![]);
            true
        });
        run_rewriter(module, SysOp::Ne, |m, op| {
            let operands = m.op(op).operands().to_vec();
            let mut b = Builder::new(m);
            b.set_before_op(op);
            let xor_op = b.create(Xor, &operands, vec![]);
            b.replace(op, Snez, &[xor_op], vec![]);
            true
        });
        run_rewriter(module, SysOp::NeF, |m, op| {
            let operands = m.op(op).operands().to_vec();
            let mut b = Builder::new(m);
            b.set_before_op(op);
            let feq = b.create(Feq, &operands, vec![]);
            b.replace(op, Seqz, &[feq], vec![]);
            true
        });
        run_rewriter(module, SysOp::Le, |m, op| {
            // l <= r is !(r < l).
            let l = m.op(op).operand(0);
            let r = m.op(op).operand(1);
            let mut b = Builder::new(m);
            b.set_before_op(op);
            let slt = b.create(Slt, &[r, l], vec![]);
            b.replace(op, Seqz, &[slt], vec![]);
            true
        });

        // Loads and stores stay width-generic; width resolves at dump time.
        run_rewriter(module, SysOp::Load, |m, op| {
            let operands = m.op(op).operands().to_vec();
            let mut attrs: Vec<Attr> =
                m.op(op).attrs().iter().map(|a| (**a).clone()).collect();
            attrs.push(Attr::Int(0));
            let ty = m.op(op).result_ty();
            let mut b = Builder::new(m);
            b.replace_ty(op, ty, Load, &operands, attrs);
            true
        });
        run_rewriter(module, SysOp::Store, |m, op| {
            let operands = m.op(op).operands().to_vec();
            let mut attrs: Vec<Attr> =
                m.op(op).attrs().iter().map(|a| (**a).clone()).collect();
            attrs.push(Attr::Int(0));
            let mut b = Builder::new(m);
            b.replace(op, Store, &operands, attrs);
            true
        });

        run_rewriter(module, SysOp::Return, |m, op| {
            if m.op(op).operand_count() > 0 {
                let value = m.op(op).operand(0);
                let fp = m.op(value).result_ty() == Ty::F32;
                let reg = if fp { regs::f(10) } else { regs::x(10) };
                let mut b = Builder::new(m);
                b.set_before_op(op);
                let virt = b.create(WriteReg, &[value], vec![Attr::Reg(reg)]);
                b.replace(op, Ret, &[virt], vec![]);
                return true;
            }
            let mut b = Builder::new(m);
            b.replace(op, Ret, &[], vec![]);
            true
        });

        // Calls: first eight per class in a0-a7 / fa0-fa7, the rest on a
        // 16-byte aligned stack bump.
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
                    regs_new.push(b.create(
                        WriteReg,
                        &[arg],
                        vec![Attr::Reg(regs::FARG_REGS[fcnt])],
                    ));
                    fcnt += 1;
                } else if !fp && cnt < 8 {
                    regs_new.push(b.create(
                        WriteReg,
                        &[arg],
                        vec![Attr::Reg(regs::ARG_REGS[cnt])],
                    ));
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
                if fp {
                    b.create(Fsd, &[arg, sp], vec![Attr::Int((i * 8) as i32)]);
                } else {
                    b.create(
                        Store,
                        &[arg, sp],
                        vec![Attr::Size(8), Attr::Int((i * 8) as i32)],
                    );
                }
            }

            b.create(Call, &regs_new, vec![Attr::Name(name), Attr::ArgCount(args.len())]);
            if stack > 0 {
                b.create(SubSp, &[], vec![Attr::Int(-(stack as i32))]);
            }

            if result_fp {
                b.replace_ty(op, Ty::F32, ReadReg, &[], vec![Attr::Reg(regs::f(10))]);
            } else {
                b.replace_ty(op, Ty::I64, ReadReg, &[], vec![Attr::Reg(regs::x(10))]);
            }
            true
        });

        // li 0 reads the zero register instead.
        run_rewriter(module, Li, |m, op| {
            if m.op(op).int_val() == 0 {
                let mut b = Builder::new(m);
                b.replace_ty(op, Ty::I64, ReadReg, &[], vec![Attr::Reg(regs::ZERO)]);
            }
            false
        });

        for func in module.funcs() {
            rewrite_alloca(module, func);
        }
        Ok(())
    }
}
