//! Lowers structured `If`/`While` ops into a flat CFG of basic blocks with
//! explicit Branch/Goto/Return terminators, then tidies: every block gets a
//! terminator, trivially-forwarding blocks are folded into their targets,
//! and the entry is split off when something jumps back to it.

use std::collections::BTreeSet;

use color_eyre::Report;
use rustc_hash::FxHashMap;

use crate::core::{Attr, AttrKind, BlockId, Builder, Module, OpId, Pass};
use crate::dialects::sys::analysis::memory::remove_attr_rec;
use crate::dialects::sys::SysOp;

#[derive(Default)]
pub struct FlattenCfg;

fn handle_if(module: &mut Module, x: OpId) {
    let bb = module.op(x).parent().unwrap();

    // Split everything after the If off into a fresh block; new blocks go
    // between the two halves, so existing jumps stay right.
    let before_if = bb;
    let bb = module.insert_block_after(bb);
    module.split_ops_after(bb, x);
    // The If itself moves back; it is erased at the end.
    module.move_op_to_end(x, before_if);

    let then_region = module.op(x).region(0);
    let (then_first, then_final) = module.region_move_to(then_region, before_if);
    let mut fin = then_final;

    let has_else = module.op(x).regions().len() > 1;
    let mut else_first = None;
    if has_else {
        let else_region = module.op(x).region(1);
        let (ef, e_final) = module.region_move_to(else_region, then_final);
        else_first = Some(ef);
        fin = e_final;

        let cond = module.op(x).operand(0);
        let mut b = Builder::new(module);
        b.set_to_block_end(before_if);
        b.create(
            SysOp::Branch,
            &[cond],
            vec![Attr::Target(then_first), Attr::Else(ef)],
        );
    }

    // The then-chain joins an end block after the last inserted block.
    let end = module.insert_block_after(fin);
    let mut b = Builder::new(module);
    b.set_to_block_end(fin);
    b.create(SysOp::Goto, &[], vec![Attr::Target(end)]);

    if has_else {
        let _ = else_first;
        let mut b = Builder::new(module);
        b.set_to_block_end(then_final);
        b.create(SysOp::Goto, &[], vec![Attr::Target(end)]);
    } else {
        let cond = module.op(x).operand(0);
        let mut b = Builder::new(module);
        b.set_to_block_end(before_if);
        b.create(
            SysOp::Branch,
            &[cond],
            vec![Attr::Target(then_first), Attr::Else(end)],
        );
    }

    module.erase_op(x);
}

fn handle_while(module: &mut Module, x: OpId) {
    let bb = module.op(x).parent().unwrap();

    let before_while = bb;
    let bb = module.insert_block_after(bb);
    module.split_ops_after(bb, x);
    module.move_op_to_end(x, before_while);

    let before_region = module.op(x).region(0);
    let (before_first, before_final) = module.region_move_to(before_region, before_while);

    let after_region = module.op(x).region(1);
    let (after_first, after_final) = module.region_move_to(after_region, before_final);

    let end = module.insert_block_after(after_final);

    // The trailing Proceed of the condition chain becomes the branch.
    let proceed = module.block(before_final).last_op();
    assert!(module.op(proceed).kind() == SysOp::Proceed);
    let condition = module.op(proceed).operand(0);
    let mut b = Builder::new(module);
    b.set_before_op(proceed);
    b.create(
        SysOp::Branch,
        &[condition],
        vec![Attr::Target(after_first), Attr::Else(end)],
    );
    module.erase_op(proceed);

    let mut b = Builder::new(module);
    b.set_to_block_end(after_final);
    b.create(SysOp::Goto, &[], vec![Attr::Target(before_first)]);

    let unused_bb = module.insert_block_after(end);

    // Rewrite break/continue/early-return. Nested whiles were flattened on
    // their own visit, so any disrupters here belong to this loop.
    let region = module.block(before_first).parent();
    let blocks = module.region(region).blocks().to_vec();
    let start = blocks.iter().position(|&b| b == before_first).unwrap();
    let stop = blocks.iter().position(|&b| b == end).unwrap();
    for &bb in &blocks[start..stop] {
        let disrupters: Vec<OpId> = module
            .block(bb)
            .ops()
            .iter()
            .copied()
            .filter(|&op| {
                matches!(
                    module.op(op).kind(),
                    crate::core::OpKind::Sys(SysOp::Break)
                        | crate::core::OpKind::Sys(SysOp::Continue)
                        | crate::core::OpKind::Sys(SysOp::Return)
                )
            })
            .collect();

        let mut skipped: BTreeSet<OpId> = BTreeSet::new();
        for op in disrupters {
            if skipped.contains(&op) || module.is_dead(op) {
                continue;
            }
            let bb = module.op(op).parent().unwrap();
            // Everything after a disrupter is dead; move it aside and drop.
            module.split_ops_after(unused_bb, op);
            module.move_op_to_end(op, bb);
            for unused in module.block(unused_bb).ops().to_vec() {
                module.remove_all_operands(unused);
            }
            for unused in module.block(unused_bb).ops().to_vec() {
                let ukind = module.op(unused).kind();
                if matches!(
                    ukind,
                    crate::core::OpKind::Sys(SysOp::Break)
                        | crate::core::OpKind::Sys(SysOp::Continue)
                        | crate::core::OpKind::Sys(SysOp::Return)
                ) {
                    skipped.insert(unused);
                }
                module.erase_op(unused);
            }

            let kind = module.op(op).kind();
            if kind == SysOp::Break {
                let mut b = Builder::new(module);
                b.replace(op, SysOp::Goto, &[], vec![Attr::Target(end)]);
            } else if kind == SysOp::Continue {
                let mut b = Builder::new(module);
                b.replace(op, SysOp::Goto, &[], vec![Attr::Target(before_first)]);
            }
        }
    }

    module.erase_block(unused_bb);
    module.erase_op(x);
}

fn tidy(module: &mut Module, func: OpId) {
    let body = module.func_region(func);

    // Supply a final return when the last block doesn't end in one.
    let last = module.region(body).last_block();
    if module.block(last).op_count() == 0
        || module.op(module.block(last).last_op()).kind() != SysOp::Return
    {
        let mut b = Builder::new(module);
        b.set_to_block_end(last);
        b.create(SysOp::Return, &[], vec![]);
    }

    // Remove ops trailing an embedded terminator.
    for bb in module.region(body).blocks().to_vec() {
        let mut term = None;
        for &op in module.block(bb).ops() {
            if module.op(op).kind().is_terminator() {
                term = Some(op);
                break;
            }
        }
        let Some(term) = term else { continue };
        if term == module.block(bb).last_op() {
            continue;
        }
        let (_, pos) = module.op_pos(term);
        let tail: Vec<OpId> = module.block(bb).ops()[pos + 1..].to_vec();
        for op in &tail {
            module.remove_all_operands(*op);
        }
        for op in tail {
            module.erase_op(op);
        }
    }

    // Every block gets a terminator: fall through to the next block.
    let blocks = module.region(body).blocks().to_vec();
    for (i, &bb) in blocks.iter().enumerate() {
        let needs = module.block(bb).op_count() == 0
            || !module.op(module.block(bb).last_op()).kind().is_terminator();
        if needs {
            let next = blocks[i + 1];
            let mut b = Builder::new(module);
            b.set_to_block_end(bb);
            b.create(SysOp::Goto, &[], vec![Attr::Target(next)]);
        }
    }

    module.update_preds(body);

    // Forward-closure of trivially-forwarding blocks.
    let mut inliner: FxHashMap<BlockId, BlockId> = FxHashMap::default();
    for &bb in &blocks {
        if module.block(bb).op_count() != 1 {
            continue;
        }
        let last = module.block(bb).last_op();
        if module.op(last).kind() == SysOp::Goto {
            inliner.insert(bb, module.op(last).target());
        }
    }
    let resolve = |inliner: &FxHashMap<BlockId, BlockId>, mut from: BlockId| -> BlockId {
        while let Some(&next) = inliner.get(&from) {
            if next == from {
                break;
            }
            from = next;
        }
        from
    };

    for &bb in &blocks {
        let last = module.block(bb).last_op();
        if let Some(Attr::Target(t)) = module.op(last).find_attr(AttrKind::Target) {
            let new = resolve(&inliner, *t);
            module.put_attr(last, Attr::Target(new));
        }
        if let Some(Attr::Else(t)) = module.op(last).find_attr(AttrKind::Else) {
            let new = resolve(&inliner, *t);
            module.put_attr(last, Attr::Else(new));
        }
    }

    module.update_preds(body);
    for (&bb, _) in inliner.iter() {
        module.erase_block(bb);
    }
    module.update_preds(body);

    // If the entry has predecessors, split out a fresh one holding the real
    // entry ops (allocas and getargs).
    let first = module.region(body).first_block();
    if !module.block(first).preds.is_empty() {
        let entry = module.insert_block_before(first);
        for op in module.block(first).ops().to_vec() {
            let kind = module.op(op).kind();
            if kind == SysOp::Alloca || kind == SysOp::GetArg {
                module.move_op_to_end(op, entry);
            }
        }
        let mut b = Builder::new(module);
        b.set_to_block_end(entry);
        b.create(SysOp::Goto, &[], vec![Attr::Target(first)]);
    }

    module.update_preds(body);

    // Pre-opt stage attributes don't survive flattening.
    remove_attr_rec(module, body, AttrKind::Subscript);
    remove_attr_rec(module, body, AttrKind::Base);
}

impl Pass for FlattenCfg {
    fn name(&self) -> &'static str {
        "flatten-cfg"
    }

    fn run(&mut self, module: &mut Module) -> Result<(), Report> {
        let top = module.top();
        for x in module.find_all(top, SysOp::If) {
            if !module.is_dead(x) {
                handle_if(module, x);
            }
        }
        for x in module.find_all(top, SysOp::While) {
            if !module.is_dead(x) {
                handle_while(module, x);
            }
        }
        for func in module.funcs() {
            tidy(module, func);
        }
        Ok(())
    }
}
