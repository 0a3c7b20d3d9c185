//! A weak in-block list scheduler, run right before instruction selection.
//! Orders by latency-weighted height so loads start before the arithmetic
//! that consumes them. It cannot live in the back end because the
//! writereg-call-readreg bracket must stay contiguous there.

use std::collections::BTreeSet;

use color_eyre::Report;
use rustc_hash::FxHashMap;

use crate::core::{AttrKind, BlockId, Module, OpId, OpKind, Pass};
use crate::dialects::sys::SysOp;

#[derive(Default)]
pub struct InstSchedule;

fn latency(module: &Module, op: OpId) -> usize {
    match module.op(op).kind() {
        OpKind::Sys(SysOp::Load) => 4,
        OpKind::Sys(SysOp::MulI | SysOp::MulL | SysOp::Mulsh | SysOp::Muluh) => 3,
        OpKind::Sys(SysOp::DivI | SysOp::DivL | SysOp::ModI | SysOp::ModL) => 12,
        OpKind::Sys(SysOp::AddF | SysOp::SubF | SysOp::MulF) => 4,
        OpKind::Sys(SysOp::DivF) => 12,
        _ => 1,
    }
}

/// Scheduling barriers: anything whose order is observable.
fn fixed(module: &Module, op: OpId) -> bool {
    let data = module.op(op);
    data.kind().is_terminator()
        || matches!(
            data.kind(),
            OpKind::Sys(
                SysOp::Phi
                    | SysOp::Store
                    | SysOp::Call
                    | SysOp::Alloca
                    | SysOp::GetArg
                    | SysOp::Clone
                    | SysOp::Join
                    | SysOp::Wake
            )
        )
        || data.has_attr(AttrKind::Impure)
}

/// Emits one barrier-free run in a dependence-respecting order, greater
/// height first.
fn schedule_run(
    module: &Module,
    run: &mut Vec<OpId>,
    result: &mut Vec<OpId>,
    height: &FxHashMap<OpId, usize>,
) {
    let pending: Vec<OpId> = std::mem::take(run);
    let in_run: BTreeSet<OpId> = pending.iter().copied().collect();
    let mut emitted: BTreeSet<OpId> = BTreeSet::new();
    let mut ready: Vec<OpId> = Vec::new();
    let mut waiting: Vec<OpId> = pending.clone();

    while emitted.len() < pending.len() {
        waiting.retain(|&op| {
            let ok = module
                .op(op)
                .operands()
                .iter()
                .all(|d| !in_run.contains(d) || emitted.contains(d));
            if ok {
                ready.push(op);
            }
            !ok
        });
        // In-block dependences are acyclic, so something is always ready.
        assert!(!ready.is_empty(), "cyclic in-block dependence");
        ready.sort_by_key(|&op| std::cmp::Reverse(height[&op]));
        let op = ready.remove(0);
        emitted.insert(op);
        result.push(op);
    }
}

impl InstSchedule {
    fn run_block(module: &mut Module, bb: BlockId) {
        let ops = module.block(bb).ops().to_vec();

        // Height: own latency plus the tallest in-block user above.
        let mut height: FxHashMap<OpId, usize> = FxHashMap::default();
        for &op in ops.iter().rev() {
            let mut h = latency(module, op);
            for &user in module.op(op).uses() {
                if let Some(&uh) = height.get(&user) {
                    h = h.max(latency(module, op) + uh);
                }
            }
            height.insert(op, h);
        }

        let mut result: Vec<OpId> = Vec::with_capacity(ops.len());
        let mut run: Vec<OpId> = Vec::new();
        for &op in &ops {
            if fixed(module, op) {
                schedule_run(module, &mut run, &mut result, &height);
                result.push(op);
            } else {
                run.push(op);
            }
        }
        schedule_run(module, &mut run, &mut result, &height);

        assert!(result.len() == ops.len());
        module.block_mut(bb).ops = result;
    }
}

impl Pass for InstSchedule {
    fn name(&self) -> &'static str {
        "inst-schedule"
    }

    fn run(&mut self, module: &mut Module) -> Result<(), Report> {
        for func in module.funcs() {
            let region = module.func_region(func);
            for bb in module.region(region).blocks().to_vec() {
                Self::run_block(module, bb);
            }
        }
        Ok(())
    }
}
