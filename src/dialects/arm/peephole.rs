//! Post-allocation cleanup for AArch64.
//!
//! Straight-line rewrites (store-to-load forwarding, adjacent zero-store
//! fusion on sp, `mul`+`add` to `mla` for vectors, self-move removal), the
//! shared CFG tidyup (jump threading, branch-to-fallthrough inversion),
//! and finally the prologue/epilogue: callee-saved registers paired into
//! stp/ldp, the remaining stack-passed GetArgs turned into frame loads,
//! and SubSp lowered to real sp arithmetic.

use color_eyre::Report;

use crate::backend::{tidyup, used_registers};
use crate::core::{run_rewriter, Attr, AttrKind, Builder, Module, OpId, OpKind, PReg, Pass};
use crate::dialects::arm::intrinsics::ArmOp;
use crate::dialects::arm::regs;
use crate::dialects::arm::target::TARGET;
use crate::dialects::sys::SysOp;

#[derive(Default)]
pub struct RegPeephole {
    converted: usize,
}

fn invert(kind: OpKind) -> Option<OpKind> {
    use ArmOp::*;
    Some(OpKind::Arm(match kind {
        OpKind::Arm(Blt) => Bge,
        OpKind::Arm(Bge) => Blt,
        OpKind::Arm(Ble) => Bgt,
        OpKind::Arm(Bgt) => Ble,
        OpKind::Arm(Beq) => Bne,
        OpKind::Arm(Bne) => Beq,
        OpKind::Arm(Cbz) => Cbnz,
        OpKind::Arm(Cbnz) => Cbz,
        _ => return None,
    }))
}

fn create_mv(b: &mut Builder, fp: bool, rd: PReg, rs: PReg) {
    let kind = if fp { ArmOp::Fmov } else { ArmOp::MovR };
    b.create(kind, &[], vec![Attr::Impure, Attr::Rd(rd), Attr::Rs(rs)]);
}

impl RegPeephole {
    fn late_peephole(&mut self, module: &mut Module) -> usize {
        use ArmOp::*;
        let mut converted = 0;

        // Store-to-load forwarding through the same slot.
        run_rewriter(module, StrW, |m, op| {
            if m.at_back(op) {
                return false;
            }
            let next = m.next_op(op).unwrap();
            let forwards = m.op(next).kind() == LdrW
                && m.op(next).rs() == m.op(op).rs2()
                && m.op(next).int_val() == m.op(op).int_val();
            if forwards {
                converted += 1;
                let rd = m.op(next).rd();
                let rs = m.op(op).rs();
                let mut b = Builder::new(m);
                b.set_before_op(next);
                create_mv(&mut b, rd.fp, rd, rs);
                m.erase_op(next);
                return true;
            }
            false
        });

        // Adjacent wzr stores at sp-relative 8-aligned offsets fuse into
        // one xzr store. Only sp is known 16-aligned.
        loop {
            let mut changed = false;
            let top = module.top();
            for op in module.find_all(top, StrW) {
                if module.is_dead(op) || module.at_back(op) {
                    continue;
                }
                let next = module.next_op(op).unwrap();
                let fusable = module.op(next).kind() == StrW
                    && module.op(op).rs() == regs::XZR
                    && module.op(op).rs2() == regs::SP
                    && module.op(next).rs() == regs::XZR
                    && module.op(next).rs2() == regs::SP
                    && module.op(op).int_val() % 8 == 0
                    && module.op(next).int_val() == module.op(op).int_val() + 4;
                if fusable {
                    converted += 1;
                    changed = true;
                    let offset = module.op(op).int_val();
                    let mut b = Builder::new(module);
                    b.replace(
                        op,
                        StrX,
                        &[],
                        vec![
                            Attr::Impure,
                            Attr::Rs(regs::XZR),
                            Attr::Rs2(regs::SP),
                            Attr::Int(offset),
                        ],
                    );
                    module.erase_op(next);
                    break;
                }
            }
            if !changed {
                break;
            }
        }

        // Vector multiply feeding an add becomes mla.
        run_rewriter(module, MulV, |m, op| {
            let users: Vec<OpId> = m.op(op).uses().iter().copied().collect();
            if users.len() != 1 || m.op(users[0]).kind() != AddV {
                return false;
            }
            let add = users[0];
            let acc = if m.op(add).operand(0) == op {
                m.op(add).operand(1)
            } else {
                m.op(add).operand(0)
            };
            converted += 1;
            let a = m.op(op).operand(0);
            let b_val = m.op(op).operand(1);
            let mut b = Builder::new(m);
            b.set_before_op(add);
            let mla = b.create(MlaV, &[acc, a, b_val], vec![]);
            m.replace_op_with(add, mla);
            m.erase_op(op);
            true
        });

        // mv x, x does nothing.
        run_rewriter(module, MovR, |m, op| {
            if m.op(op).rd() == m.op(op).rs() {
                converted += 1;
                m.erase_op(op);
                return true;
            }
            false
        });
        run_rewriter(module, Fmov, |m, op| {
            if m.op(op).find_attr(AttrKind::Rd).is_some()
                && m.op(op).find_attr(AttrKind::Rs).is_some()
                && m.op(op).rd() == m.op(op).rs()
            {
                converted += 1;
                m.erase_op(op);
                return true;
            }
            false
        });

        converted
    }

    /// Saves callee-saved registers in stp/ldp pairs (str/ldr past the
    /// paired-offset range), then rewrites stack-passed GetArgs and SubSp.
    fn pro_epilogue(&mut self, module: &mut Module, func: OpId, is_leaf: bool) {
        use ArmOp::*;
        let region = module.func_region(func);

        let mut preserve: Vec<PReg> = used_registers(module, func)
            .into_iter()
            .filter(|&r| regs::callee_saved(r))
            .collect();
        if !is_leaf {
            preserve.push(regs::RA);
        }

        let mut offset = module.op(func).stack_offset() + 8 * preserve.len() as i64;
        if offset % 16 != 0 {
            offset = offset / 16 * 16 + 16;
        }
        module.put_attr(func, Attr::StackOffset(offset));

        let entry = module.region(region).first_block();
        let mut b = Builder::new(module);
        b.set_to_block_start(entry);
        if offset != 0 {
            b.create(SubSp, &[], vec![Attr::Int(offset as i32)]);
        }
        Self::save(&mut b, &preserve, offset, true);

        if offset != 0 {
            // One shared epilogue block; rets retarget to it.
            let epilogue = module.append_block(region);
            for ret in module.find_all(func, Ret) {
                let mut b = Builder::new(module);
                b.replace(ret, B, &[], vec![Attr::Target(epilogue)]);
            }
            let mut b = Builder::new(module);
            b.set_to_block_start(epilogue);
            Self::save(&mut b, &preserve, offset, false);
            b.create(SubSp, &[], vec![Attr::Int(-(offset as i32))]);
            b.create(Ret, &[], vec![]);
        }

        // Remaining GetArgs came in on the caller's stack, just above our
        // frame, in index order.
        let mut remaining = module.find_all(func, SysOp::GetArg);
        remaining.sort_by_key(|&op| module.op(op).int_val());
        for (i, op) in remaining.into_iter().enumerate() {
            assert!(module.op(op).int_val() >= 8, "register argument survived regalloc");
            let my_offset = offset + (i as i64) * 8;
            let rd = module.op(op).rd();
            let kind = if rd.fp { LdrF } else { LdrX };
            let mut b = Builder::new(module);
            b.replace(
                op,
                kind,
                &[],
                vec![Attr::Rd(rd), Attr::Rs(regs::SP), Attr::Int(my_offset as i32)],
            );
        }

        run_rewriter(module, SubSp, |m, op| {
            let v = m.op(op).int_val();
            let mut b = Builder::new(m);
            b.replace(
                op,
                AddXI,
                &[],
                vec![Attr::Impure, Attr::Rd(regs::SP), Attr::Rs(regs::SP), Attr::Int(-v)],
            );
            true
        });
    }

    /// Pairs of callee-saved registers spill through stp/ldp; a trailing
    /// odd register and far offsets use plain str/ldr.
    fn save(b: &mut Builder, regs_list: &[PReg], mut offset: i64, store: bool) {
        use ArmOp::*;
        if offset >= 512 {
            for &reg in regs_list {
                offset -= 8;
                let kind = match (store, reg.fp) {
                    (true, true) => StrD,
                    (true, false) => StrX,
                    (false, true) => LdrD,
                    (false, false) => LdrX,
                };
                let attrs = if store {
                    vec![Attr::Impure, Attr::Rs(reg), Attr::Rs2(regs::SP), Attr::Int(offset as i32)]
                } else {
                    vec![Attr::Impure, Attr::Rd(reg), Attr::Rs(regs::SP), Attr::Int(offset as i32)]
                };
                b.create(kind, &[], attrs);
            }
            return;
        }

        let mut i = 0;
        while i + 1 < regs_list.len() {
            let (r1, r2) = (regs_list[i], regs_list[i + 1]);
            offset -= 16;
            if r1.fp == r2.fp {
                let kind = match (store, r1.fp) {
                    (true, true) => StpD,
                    (true, false) => StpX,
                    (false, true) => LdpD,
                    (false, false) => LdpX,
                };
                b.create(
                    kind,
                    &[],
                    vec![
                        Attr::Impure,
                        Attr::Rs(r1),
                        Attr::Rs2(r2),
                        Attr::Rs3(regs::SP),
                        Attr::Int(offset as i32),
                    ],
                );
            } else {
                for (reg, extra) in [(r1, 8i64), (r2, 0)] {
                    let kind = match (store, reg.fp) {
                        (true, true) => StrD,
                        (true, false) => StrX,
                        (false, true) => LdrD,
                        (false, false) => LdrX,
                    };
                    let attrs = if store {
                        vec![
                            Attr::Impure,
                            Attr::Rs(reg),
                            Attr::Rs2(regs::SP),
                            Attr::Int((offset + extra) as i32),
                        ]
                    } else {
                        vec![
                            Attr::Impure,
                            Attr::Rd(reg),
                            Attr::Rs(regs::SP),
                            Attr::Int((offset + extra) as i32),
                        ]
                    };
                    b.create(kind, &[], attrs);
                }
            }
            i += 2;
        }
        if regs_list.len() % 2 == 1 {
            let reg = *regs_list.last().unwrap();
            offset -= 8;
            let kind = match (store, reg.fp) {
                (true, true) => StrD,
                (true, false) => StrX,
                (false, true) => LdrD,
                (false, false) => LdrX,
            };
            let attrs = if store {
                vec![Attr::Impure, Attr::Rs(reg), Attr::Rs2(regs::SP), Attr::Int(offset as i32)]
            } else {
                vec![Attr::Impure, Attr::Rd(reg), Attr::Rs(regs::SP), Attr::Int(offset as i32)]
            };
            b.create(kind, &[], attrs);
        }
    }
}

impl Pass for RegPeephole {
    fn name(&self) -> &'static str {
        "arm-reg-peephole"
    }

    fn stats(&self) -> Vec<(&'static str, usize)> {
        vec![("converted-ops", self.converted)]
    }

    fn run(&mut self, module: &mut Module) -> Result<(), Report> {
        loop {
            let converted = self.late_peephole(module);
            self.converted += converted;
            if converted == 0 {
                break;
            }
        }

        for func in module.funcs() {
            let region = module.func_region(func);
            tidyup(module, region, &TARGET, &invert);
            let is_leaf = module.find_all(func, ArmOp::Bl).is_empty();
            self.pro_epilogue(module, func, is_leaf);
        }
        Ok(())
    }
}
