//! Final fixups the rest of the pipeline is allowed to ignore: ARM has no
//! `add x, xzr, imm` (it aliases into sp arithmetic), and `mov` immediates
//! past 16 bits split into mov/movk or movn/movk pairs.

use color_eyre::Report;

use crate::core::{run_rewriter, Attr, Builder, Module, Pass};
use crate::dialects::arm::intrinsics::ArmOp;
use crate::dialects::arm::regs;

#[derive(Default)]
pub struct LateLegalize;

impl Pass for LateLegalize {
    fn name(&self) -> &'static str {
        "arm-late-legalize"
    }

    fn run(&mut self, module: &mut Module) -> Result<(), Report> {
        use ArmOp::*;

        for kind in [AddXI, AddWI] {
            run_rewriter(module, kind, |m, op| {
                if m.op(op).rs() == regs::XZR {
                    let rd = m.op(op).rd();
                    let v = m.op(op).int_val();
                    let mut b = Builder::new(m);
                    b.replace(op, MovI, &[], vec![Attr::Rd(rd), Attr::Int(v)]);
                }
                false
            });
        }

        run_rewriter(module, MovI, |m, op| {
            let v = m.op(op).int_val();
            let rd = m.op(op).rd();
            if v >= 65536 {
                let mut b = Builder::new(m);
                b.set_before_op(op);
                b.create(MovI, &[], vec![Attr::Rd(rd), Attr::Int(v & 0xffff)]);
                b.replace(
                    op,
                    Movk,
                    &[],
                    vec![Attr::Rd(rd), Attr::Int(((v as u32) >> 16) as i32), Attr::Lsl(16)],
                );
            } else if v < -65536 {
                let u = v as u32;
                let mut b = Builder::new(m);
                b.set_before_op(op);
                b.create(
                    Movn,
                    &[],
                    vec![Attr::Rd(rd), Attr::Int((!(u as u16)) as i32)],
                );
                b.replace(
                    op,
                    Movk,
                    &[],
                    vec![Attr::Rd(rd), Attr::Int((u >> 16) as i32), Attr::Lsl(16)],
                );
            }
            false
        });
        Ok(())
    }
}
