//! Post-allocation cleanup for RV64: store-to-load forwarding, self-move
//! removal, the shared CFG tidyup, then the prologue/epilogue (sd/ld of
//! callee-saved registers), stack-passed GetArgs and SubSp lowering.

use color_eyre::Report;

use crate::backend::{tidyup, used_registers};
use crate::core::{run_rewriter, Attr, AttrKind, Builder, Module, OpId, OpKind, PReg, Pass};
use crate::dialects::rv::intrinsics::RvOp;
use crate::dialects::rv::regs;
use crate::dialects::rv::target::TARGET;
use crate::dialects::sys::SysOp;

#[derive(Default)]
pub struct RegPeephole {
    converted: usize,
}

fn invert(kind: OpKind) -> Option<OpKind> {
    use RvOp::*;
    Some(OpKind::Rv(match kind {
        OpKind::Rv(Blt) => Bge,
        OpKind::Rv(Bge) => Blt,
        OpKind::Rv(Ble) => Bgt,
        OpKind::Rv(Bgt) => Ble,
        OpKind::Rv(Beq) => Bne,
        OpKind::Rv(Bne) => Beq,
        _ => return None,
    }))
}

impl RegPeephole {
    fn late_peephole(&mut self, module: &mut Module) -> usize {
        use RvOp::*;
        let mut converted = 0;

        // A load straight after a store to the same slot is a move.
        run_rewriter(module, Store, |m, op| {
            if m.at_back(op) {
                return false;
            }
            let next = m.next_op(op).unwrap();
            let forwards = m.op(next).kind() == Load
                && m.op(next).rs() == m.op(op).rs2()
                && m.op(next).int_val() == m.op(op).int_val()
                && m.op(next).size() == m.op(op).size();
            if forwards {
                converted += 1;
                let rd = m.op(next).rd();
                let rs = m.op(op).rs();
                let fp = rd.fp;
                let mut b = Builder::new(m);
                b.set_before_op(next);
                let kind = if fp { Fmv } else { Mv };
                b.create(kind, &[], vec![Attr::Impure, Attr::Rd(rd), Attr::Rs(rs)]);
                m.erase_op(next);
                return true;
            }
            false
        });

        for kind in [Mv, Fmv] {
            run_rewriter(module, kind, |m, op| {
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
        }

        converted
    }

    fn pro_epilogue(&mut self, module: &mut Module, func: OpId, is_leaf: bool) {
        use RvOp::*;
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
        let mut at = offset;
        for &reg in &preserve {
            at -= 8;
            let (kind, extra) = if reg.fp {
                (Fsd, vec![])
            } else {
                (Store, vec![Attr::Size(8)])
            };
            let mut attrs = vec![
                Attr::Impure,
                Attr::Rs(reg),
                Attr::Rs2(regs::SP),
                Attr::Int(at as i32),
            ];
            attrs.extend(extra);
            b.create(kind, &[], attrs);
        }

        if offset != 0 {
            let epilogue = module.append_block(region);
            for ret in module.find_all(func, Ret) {
                let mut b = Builder::new(module);
                b.replace(ret, J, &[], vec![Attr::Target(epilogue)]);
            }
            let mut b = Builder::new(module);
            b.set_to_block_start(epilogue);
            let mut at = offset;
            for &reg in &preserve {
                at -= 8;
                let (kind, extra) = if reg.fp {
                    (Fld, vec![])
                } else {
                    (Load, vec![Attr::Size(8)])
                };
                let mut attrs = vec![
                    Attr::Impure,
                    Attr::Rd(reg),
                    Attr::Rs(regs::SP),
                    Attr::Int(at as i32),
                ];
                attrs.extend(extra);
                b.create(kind, &[], attrs);
            }
            b.create(SubSp, &[], vec![Attr::Int(-(offset as i32))]);
            b.create(Ret, &[], vec![]);
        }

        // Stack-passed arguments sit just above our frame, in index order.
        let mut remaining = module.find_all(func, SysOp::GetArg);
        remaining.sort_by_key(|&op| module.op(op).int_val());
        for (i, op) in remaining.into_iter().enumerate() {
            assert!(module.op(op).int_val() >= 8, "register argument survived regalloc");
            let my_offset = offset + (i as i64) * 8;
            let rd = module.op(op).rd();
            let (kind, extra) = if rd.fp {
                (Fld, vec![])
            } else {
                (Load, vec![Attr::Size(8)])
            };
            let mut attrs =
                vec![Attr::Rd(rd), Attr::Rs(regs::SP), Attr::Int(my_offset as i32)];
            attrs.extend(extra);
            let mut b = Builder::new(module);
            b.replace(op, kind, &[], attrs);
        }

        run_rewriter(module, SubSp, |m, op| {
            let v = m.op(op).int_val();
            let mut b = Builder::new(m);
            b.replace(
                op,
                Addi,
                &[],
                vec![Attr::Impure, Attr::Rd(regs::SP), Attr::Rs(regs::SP), Attr::Int(-v)],
            );
            true
        });
    }
}

impl Pass for RegPeephole {
    fn name(&self) -> &'static str {
        "rv-reg-peephole"
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
            let is_leaf = module.find_all(func, RvOp::Call).is_empty();
            self.pro_epilogue(module, func, is_leaf);
        }
        Ok(())
    }
}
