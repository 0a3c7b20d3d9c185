//! Register allocation over the machine dialects.
//!
//! Interference-graph coloring driven by per-block linear-scan events.
//! Preconditions: the function is in SSA with explicit phis, and every call
//! and incoming argument is bracketed by WriteReg/ReadReg ops.
//!
//! The protocol, in order: pre-colored placeholders pin caller-saved
//! registers across clobber points and argument registers at entry;
//! per-block live intervals feed a start/end event sweep that builds two
//! interference graphs (FP and GPR colors don't clash, spill slots do);
//! WriteReg/ReadReg pins, phi-operand preference and low-priority
//! rematerializable constants steer the coloring order; color exhaustion
//! picks the lowest unconflicting multiple of 8 as a slot, with the one-
//! and two-slot cases mapped to the dedicated spill registers and leftover
//! slots remapped onto unused callee-saved FP registers; finally
//! WriteReg/ReadReg lower to moves, phis are destructed with critical-edge
//! splitting and SCC cycle-breaking through the second spill register, and
//! spilled defs/uses materialize as slot stores/reloads (or rematerialized
//! constants).

use std::collections::{BTreeMap, BTreeSet};

use color_eyre::Report;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::backend::TargetSpec;
use crate::core::{
    Attr, AttrKind, BlockId, Builder, Module, OpId, PReg, Pass, Spill, Ty,
};
use crate::dialects::sys::SysOp;

pub struct RegAlloc {
    target: &'static dyn TargetSpec,
    spilled: usize,
}

/// A move destination/source: either a colored register or a spill slot.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
enum Loc {
    Reg(PReg),
    Slot(i64),
}

#[derive(Clone, Copy)]
struct Event {
    timestamp: usize,
    start: bool,
    op: OpId,
}

impl RegAlloc {
    pub fn new(target: &'static dyn TargetSpec) -> RegAlloc {
        RegAlloc { target, spilled: 0 }
    }

    fn fp_of(&self, module: &Module, op: OpId) -> bool {
        self.target.fp_ty(module.op(op).result_ty())
    }

    fn run_func(&mut self, module: &mut Module, func: OpId, is_leaf: bool) {
        let t = self.target;
        let region = module.func_region(func);

        let mut assignment: FxHashMap<OpId, PReg> = FxHashMap::default();

        // 1. Placeholders before every clobbering op: one per caller-saved
        // register. Interleaved WriteReg runs additionally pin the already
        // written argument registers so later writes can't clobber them.
        let mut clobbering = module.find_all(func, t.call());
        clobbering.extend(module.find_all(func, SysOp::Clone));
        clobbering.extend(module.find_all(func, SysOp::Join));

        for op in clobbering {
            let mut writes = Vec::new();
            let mut runner = module.prev_op(op);
            while let Some(w) = runner {
                if module.op(w).kind() != t.write_reg() {
                    break;
                }
                writes.push(w);
                runner = module.prev_op(w);
            }

            // `writes` is in backward order; each write gets placeholders
            // for everything written after it.
            for i in 0..writes.len().saturating_sub(1) {
                let mut b = Builder::new(module);
                b.set_before_op(writes[i]);
                for j in i + 1..writes.len() {
                    let reg = b.module.op(writes[j]).reg();
                    let ty = if reg.fp { Ty::F32 } else { Ty::I32 };
                    let ph = b.create_ty(ty, t.placeholder(), &[], vec![]);
                    assignment.insert(ph, reg);
                }
            }

            let mut b = Builder::new(module);
            b.set_before_op(op);
            for &reg in t.caller_saved() {
                let ty = if reg.fp { Ty::F32 } else { Ty::I32 };
                let ph = b.create_ty(ty, t.placeholder(), &[], vec![]);
                assignment.insert(ph, reg);
            }
        }

        // 2. Argument pinning: placeholders for the incoming registers, and
        // each GetArg moved to the entry and replaced by a ReadReg.
        let argcnt = module.op(func).arg_count();
        let mut arg_holders = Vec::new();
        let mut farg_holders = Vec::new();
        for i in 0..argcnt.min(8) {
            let mut b = Builder::new(module);
            b.set_to_region_start(region);
            let ph = b.create_ty(Ty::I32, t.placeholder(), &[], vec![]);
            assignment.insert(ph, t.arg_regs()[i]);
            arg_holders.push(ph);
            let mut b = Builder::new(module);
            b.set_to_region_start(region);
            let fph = b.create_ty(Ty::F32, t.placeholder(), &[], vec![]);
            assignment.insert(fph, t.farg_regs()[i]);
            farg_holders.push(fph);
        }

        // DCE may have removed some getargs; index by argument number.
        let mut get_args: Vec<Option<OpId>> = vec![None; argcnt];
        for x in module.find_all(func, SysOp::GetArg) {
            get_args[module.op(x).int_val() as usize] = Some(x);
        }

        let entry = module.region(region).first_block();
        let (mut cnt, mut fcnt) = (0usize, 0usize);
        for slot in get_args.into_iter() {
            let Some(op) = slot else { continue };
            let fp = self.fp_of(module, op);
            if fp && fcnt < 8 {
                module.move_op_to_start(op, entry);
                let holder = farg_holders[fcnt];
                let mut b = Builder::new(module);
                b.set_before_op(op);
                b.create_ty(Ty::I32, t.placeholder(), &[holder], vec![]);
                let reg = t.farg_regs()[fcnt];
                let mut b = Builder::new(module);
                b.replace_ty(op, Ty::F32, t.read_reg(), &[], vec![Attr::Reg(reg)]);
                fcnt += 1;
            } else if !fp && cnt < 8 {
                module.move_op_to_start(op, entry);
                let holder = arg_holders[cnt];
                let mut b = Builder::new(module);
                b.set_before_op(op);
                b.create_ty(Ty::I32, t.placeholder(), &[holder], vec![]);
                let reg = t.arg_regs()[cnt];
                let mut b = Builder::new(module);
                b.replace_ty(op, Ty::I64, t.read_reg(), &[], vec![Attr::Reg(reg)]);
                cnt += 1;
            }
            // Beyond eight: spilled to the caller's frame; the peephole
            // stage turns the remaining GetArg into a stack load.
        }

        // ReadRegs of FP registers produce FP values.
        for op in module.find_all(func, t.read_reg()) {
            if module.op(op).reg().fp {
                module.op_mut(op).result_ty = Ty::F32;
            }
        }

        // 3. Liveness, then per-block intervals and the event sweep.
        module.update_liveness(region);

        let mut interf: FxHashMap<OpId, BTreeSet<OpId>> = FxHashMap::default();
        let mut spill_interf: FxHashMap<OpId, BTreeSet<OpId>> = FxHashMap::default();
        let mut priority: FxHashMap<OpId, i32> = FxHashMap::default();
        let mut prefer: FxHashMap<OpId, OpId> = FxHashMap::default();
        let mut phi_operand: FxHashMap<OpId, Vec<OpId>> = FxHashMap::default();

        let mut current_priority = 2;
        for bb in module.region(region).blocks().to_vec() {
            let ops = module.block(bb).ops().to_vec();
            let mut last_used: BTreeMap<OpId, usize> = BTreeMap::new();
            let mut defined: BTreeMap<OpId, usize> = BTreeMap::new();

            for (i, &op) in ops.iter().enumerate().rev() {
                for &v in module.op(op).operands() {
                    last_used.entry(v).or_insert(i);
                }
                defined.insert(op, i);
                // An unused def still lives in its own instruction.
                last_used.entry(op).or_insert(i + 1);

                // 5. Pre-coloring and priorities.
                let kind = module.op(op).kind();
                if kind == t.write_reg() {
                    assignment.insert(op, module.op(op).reg());
                    priority.insert(op, 1);
                }
                if kind == t.read_reg() {
                    priority.insert(op, 1);
                }
                // Small constants rematerialize; spill them before anything
                // else.
                if kind == t.load_imm() {
                    let v = module.op(op).int_val();
                    if (-32768..=32767).contains(&v) {
                        priority.insert(op, -2);
                    }
                }
                if kind == SysOp::Phi {
                    priority.insert(op, current_priority + 1);
                    for &x in module.op(op).operands() {
                        priority.insert(x, current_priority);
                        prefer.insert(x, op);
                        phi_operand.entry(op).or_default().push(x);
                    }
                    current_priority += 2;
                }
            }

            for &op in module.block(bb).live_out() {
                last_used.insert(op, ops.len());
            }

            let mut events = Vec::new();
            for (&op, &end) in &last_used {
                let def = defined.get(&op).copied().unwrap_or(0);
                if def == end {
                    continue;
                }
                events.push(Event { timestamp: def, start: true, op });
                events.push(Event { timestamp: end, start: false, op });
            }
            // Ends retire before starts at the same timestamp.
            events.sort_by_key(|e| (e.timestamp, e.start));

            let mut active: BTreeSet<OpId> = BTreeSet::new();
            for event in events {
                let op = event.op;
                if module.op(op).kind() == t.jump() {
                    continue;
                }
                if event.start {
                    for &other in &active {
                        // 4. FP and GPR colors never clash, but their spill
                        // slots do.
                        if self.fp_of(module, other) != self.fp_of(module, op) {
                            spill_interf.entry(op).or_default().insert(other);
                            spill_interf.entry(other).or_default().insert(op);
                            continue;
                        }
                        interf.entry(op).or_default().insert(other);
                        interf.entry(other).or_default().insert(op);
                    }
                    active.insert(op);
                } else {
                    active.remove(&op);
                }
            }
        }

        // 6. Color in descending (priority, degree) order.
        let mut ops: Vec<OpId> = interf.keys().copied().collect();
        ops.extend(priority.keys().copied());
        ops.sort();
        ops.dedup();
        ops.sort_by(|&a, &b| {
            let pa = priority.get(&a).copied().unwrap_or(0);
            let pb = priority.get(&b).copied().unwrap_or(0);
            let da = interf.get(&a).map_or(0, |s| s.len());
            let db = interf.get(&b).map_or(0, |s| s.len());
            (pb, db).cmp(&(pa, da))
        });

        let mut spill_offset: FxHashMap<OpId, i64> = FxHashMap::default();
        let current_offset = module.op(func).stack_offset();
        let mut highest = 0i64;
        let empty = BTreeSet::new();

        for &op in &ops {
            if assignment.contains_key(&op) {
                continue;
            }

            let mut bad: FxHashSet<PReg> = FxHashSet::default();
            let mut unpreferred: FxHashSet<PReg> = FxHashSet::default();
            for &v in interf.get(&op).unwrap_or(&empty) {
                if let Some(&r) = assignment.get(&v) {
                    if !t.is_reserved(r) {
                        bad.insert(r);
                    }
                }
            }

            if module.op(op).kind() == SysOp::Phi {
                // Dislike colors clashing with the phi's operands.
                for x in phi_operand.get(&op).cloned().unwrap_or_default() {
                    for &v in interf.get(&x).unwrap_or(&empty) {
                        if let Some(&r) = assignment.get(&v) {
                            if !t.is_reserved(r) {
                                unpreferred.insert(r);
                            }
                        }
                    }
                }
            }

            // Coalesce with the phi this value feeds.
            if let Some(&referent) = prefer.get(&op) {
                if let Some(&r) = assignment.get(&referent) {
                    if !bad.contains(&r) {
                        assignment.insert(op, r);
                        continue;
                    }
                }
            }

            // Prefer a register a consuming WriteReg wants, or the one this
            // ReadReg reads.
            let mut preferred = None;
            for &user in module.op(op).uses() {
                if module.op(user).kind() == t.write_reg() {
                    let r = module.op(user).reg();
                    if !bad.contains(&r) {
                        preferred = Some(r);
                        break;
                    }
                }
            }
            if module.op(op).kind() == t.read_reg() {
                let r = module.op(op).reg();
                if !bad.contains(&r) {
                    preferred = Some(r);
                }
            }
            if let Some(r) = preferred {
                assignment.insert(op, r);
                continue;
            }

            let fp = self.fp_of(module, op);
            let order = t.order(is_leaf, fp);
            for &r in order {
                if !bad.contains(&r) && !unpreferred.contains(&r) {
                    assignment.insert(op, r);
                    break;
                }
            }
            // The dislike set was too greedy; retry without it.
            if !assignment.contains_key(&op) && !unpreferred.is_empty() {
                for &r in order {
                    if !bad.contains(&r) {
                        assignment.insert(op, r);
                        break;
                    }
                }
            }
            if assignment.contains_key(&op) {
                continue;
            }

            // 7. Spill: the lowest slot free of every conflicting spill.
            self.spilled += 1;
            let mut conflict: FxHashSet<i64> = FxHashSet::default();
            for set in [interf.get(&op), spill_interf.get(&op)].into_iter().flatten() {
                for v in set {
                    if let Some(&o) = spill_offset.get(v) {
                        conflict.insert(o);
                    }
                }
            }
            let mut desired = current_offset;
            while conflict.contains(&desired) {
                desired += 8;
            }
            spill_offset.insert(op, desired);
            highest = highest.max(desired);
        }

        // One spilled slot: the dedicated spill register covers it.
        if !spill_offset.is_empty() && highest == current_offset {
            for (&op, _) in spill_offset.iter() {
                let fp = self.fp_of(module, op);
                assignment.insert(op, t.spill_reg(0, fp));
            }
            spill_offset.clear();
        }
        // Two slots: the first and third spill registers.
        if !spill_offset.is_empty() && highest == current_offset + 8 {
            for (&op, &offset) in spill_offset.clone().iter() {
                let fp = self.fp_of(module, op);
                let which = if offset == current_offset { 0 } else { 2 };
                assignment.insert(op, t.spill_reg(which, fp));
            }
            spill_offset.clear();
        }

        // Remap high slots onto unused callee-saved FP registers.
        if !spill_offset.is_empty() {
            let mut used: FxHashSet<PReg> = FxHashSet::default();
            for (&op, &r) in assignment.iter() {
                if module.op(op).kind() != t.placeholder() {
                    used.insert(r);
                }
            }
            let mut fpmv: FxHashMap<i64, PReg> = FxHashMap::default();
            let mut top = highest;
            for &reg in t.order(true, true) {
                if top <= current_offset {
                    break;
                }
                if used.contains(&reg) || (!is_leaf && !t.callee_saved(reg)) {
                    continue;
                }
                fpmv.insert(top, reg);
                top -= 8;
            }
            for offset in spill_offset.values_mut() {
                if let Some(&reg) = fpmv.get(offset) {
                    // Negative offsets name the register, biased to keep
                    // zero unambiguous.
                    *offset = -(reg.num as i64) - 1;
                }
            }
        }

        if !spill_offset.is_empty() {
            module.put_attr(func, Attr::StackOffset(highest + 8));
        }

        let get_reg = |assignment: &FxHashMap<OpId, PReg>, module: &Module, op: OpId| -> PReg {
            match assignment.get(&op) {
                Some(&r) => r,
                None => t.order(is_leaf, self.target.fp_ty(module.op(op).result_ty()))[0],
            }
        };
        let spill_of = |spill_offset: &FxHashMap<OpId, i64>, module: &Module, op: OpId| -> Spill {
            Spill {
                offset: spill_offset[&op],
                fp: self.target.fp_ty(module.op(op).result_ty()),
                from: op,
            }
        };

        // 8. Attach Rs/Rs2/Rs3 (or SpilledRs*) for every operand, by
        // position.
        for bb in module.region(region).blocks().to_vec() {
            for op in module.block(bb).ops().to_vec() {
                let kind = module.op(op).kind();
                if kind == t.write_reg() || kind == t.read_reg() || kind == SysOp::Phi {
                    continue;
                }
                for i in 0..module.op(op).operand_count() {
                    let v = module.op(op).operand(i);
                    if spill_offset.contains_key(&v) {
                        let s = spill_of(&spill_offset, module, v);
                        module.add_attr(op, match i {
                            0 => Attr::SpilledRs(s),
                            1 => Attr::SpilledRs2(s),
                            _ => Attr::SpilledRs3(s),
                        });
                    } else {
                        let r = get_reg(&assignment, module, v);
                        module.add_attr(op, match i {
                            0 => Attr::Rs(r),
                            1 => Attr::Rs2(r),
                            _ => Attr::Rs3(r),
                        });
                    }
                }
                // Operands are registers now; drop the SSA edges so later
                // erasures see no uses.
                module.remove_all_operands(op);
            }
        }

        // 9. WriteReg/ReadReg lower into moves.
        for op in module.find_all(func, t.write_reg()) {
            let reg = module.op(op).reg();
            let src = module.op(op).operand(0);
            let mut b = Builder::new(module);
            b.set_before_op(op);
            let mv = b.create(t.mv(reg.fp), &[], vec![Attr::Impure, Attr::Rd(reg)]);
            if spill_offset.contains_key(&src) {
                let s = spill_of(&spill_offset, module, src);
                module.add_attr(mv, Attr::SpilledRs(s));
            } else {
                let r = get_reg(&assignment, module, src);
                module.add_attr(mv, Attr::Rs(r));
            }
            module.remove_all_operands(op);
            module.erase_op(op);
        }

        for op in module.find_all(func, t.read_reg()) {
            if module.is_dead(op) {
                continue;
            }
            let reg = module.op(op).reg();
            let dst_spilled = spill_offset.contains_key(&op);
            let dst = get_reg(&assignment, module, op);
            let mut b = Builder::new(module);
            b.set_before_op(op);
            let mv = b.create(t.mv(reg.fp), &[], vec![Attr::Impure, Attr::Rs(reg)]);
            if dst_spilled {
                let s = spill_of(&spill_offset, module, op);
                module.add_attr(mv, Attr::SpilledRd(s));
                spill_offset.insert(mv, spill_offset[&op]);
            } else {
                module.add_attr(mv, Attr::Rd(dst));
                assignment.insert(mv, dst);
            }
            // Phis may still use it; rewire rather than erase in place.
            module.replace_op_with(op, mv);
        }

        // 10. Phi destruction. Split critical edges first: even without
        // phis, the branch's own registers could otherwise be clobbered by
        // the inserted moves.
        for bb in module.region(region).blocks().to_vec() {
            if module.block(bb).succs.len() <= 1 {
                continue;
            }
            let term = module.block(bb).last_op();
            let old_target = module.op(term).target();
            let old_else = module.op(term).else_target();

            let edge1 = module.insert_block_after(bb);
            let edge2 = module.insert_block_after(edge1);
            module.put_attr(term, Attr::Target(edge1));
            let mut b = Builder::new(module);
            b.set_to_block_end(edge1);
            b.create(t.jump(), &[], vec![Attr::Target(old_target)]);
            module.put_attr(term, Attr::Else(edge2));
            let mut b = Builder::new(module);
            b.set_to_block_end(edge2);
            b.create(t.jump(), &[], vec![Attr::Target(old_else)]);

            for succ in [old_target, old_else] {
                for phi in module.phis(succ) {
                    for i in 0..module.op(phi).operand_count() {
                        if module.op(phi).from_at(i) != bb {
                            continue;
                        }
                        let edge = if succ == old_target { edge1 } else { edge2 };
                        module.set_attr(phi, i, Attr::From(edge));
                    }
                }
            }
        }
        module.update_preds(region);

        // Parallel moves at predecessor ends; cycles broken through the
        // second spill register.
        let mut all_phis = Vec::new();
        let mut move_map: FxHashMap<BlockId, Vec<(Loc, Loc)>> = FxHashMap::default();
        let mut rev_map: FxHashMap<BlockId, BTreeMap<(Loc, Loc), OpId>> = FxHashMap::default();

        let loc_of = |spill_offset: &FxHashMap<OpId, i64>,
                      assignment: &FxHashMap<OpId, PReg>,
                      module: &Module,
                      op: OpId|
         -> Loc {
            match spill_offset.get(&op) {
                Some(&o) => Loc::Slot(o),
                None => Loc::Reg(get_reg(assignment, module, op)),
            }
        };

        for bb in module.region(region).blocks().to_vec() {
            let phis = module.phis(bb);
            let mut moves = Vec::new();
            for &phi in &phis {
                let fp = self.fp_of(module, phi);
                for i in 0..module.op(phi).operand_count() {
                    let from = module.op(phi).from_at(i);
                    let def = module.op(phi).operand(i);
                    let term = module.block(from).last_op();
                    let mut b = Builder::new(module);
                    b.set_before_op(term);
                    let mv = b.create(t.mv(fp), &[], vec![Attr::Impure]);
                    if spill_offset.contains_key(&phi) {
                        let s = spill_of(&spill_offset, module, phi);
                        module.add_attr(mv, Attr::SpilledRd(s));
                    } else {
                        module.add_attr(mv, Attr::Rd(get_reg(&assignment, module, phi)));
                    }
                    if spill_offset.contains_key(&def) {
                        let s = spill_of(&spill_offset, module, def);
                        module.add_attr(mv, Attr::SpilledRs(s));
                    } else {
                        module.add_attr(mv, Attr::Rs(get_reg(&assignment, module, def)));
                    }
                    moves.push(mv);
                }
            }
            all_phis.extend(phis);

            for mv in moves {
                let dst = match module.op(mv).find_attr(AttrKind::Rd) {
                    Some(a) => Loc::Reg(a.as_reg()),
                    None => Loc::Slot(module.op(mv).attr(AttrKind::SpilledRd).as_spill().offset),
                };
                let src = match module.op(mv).find_attr(AttrKind::Rs) {
                    Some(a) => Loc::Reg(a.as_reg()),
                    None => Loc::Slot(module.op(mv).attr(AttrKind::SpilledRs).as_spill().offset),
                };
                if dst == src {
                    module.erase_op(mv);
                    continue;
                }
                let parent = module.op(mv).parent().unwrap();
                move_map.entry(parent).or_default().push((dst, src));
                rev_map.entry(parent).or_default().insert((dst, src), mv);
            }
        }

        let blocks_with_moves: Vec<BlockId> = {
            let mut v: Vec<BlockId> = move_map.keys().copied().collect();
            v.sort();
            v
        };
        for bb in blocks_with_moves {
            let mvs = move_map[&bb].clone();
            let mut move_graph: BTreeMap<Loc, Loc> = BTreeMap::new();
            for &(dst, src) in &mvs {
                move_graph.insert(dst, src);
            }

            // Topologically sort; back edges expose the copy cycles.
            let mut visited: BTreeSet<Loc> = BTreeSet::new();
            let mut visiting: BTreeSet<Loc> = BTreeSet::new();
            let mut sorted: Vec<(Loc, Loc)> = Vec::new();
            let mut headers: Vec<Loc> = Vec::new();

            fn dfs(
                node: Loc,
                graph: &BTreeMap<Loc, Loc>,
                visited: &mut BTreeSet<Loc>,
                visiting: &mut BTreeSet<Loc>,
                sorted: &mut Vec<(Loc, Loc)>,
                headers: &mut Vec<Loc>,
            ) {
                visiting.insert(node);
                let src = graph[&node];
                if visiting.contains(&src) {
                    headers.push(node);
                } else if !visited.contains(&src) && graph.contains_key(&src) {
                    dfs(src, graph, visited, visiting, sorted, headers);
                }
                visiting.remove(&node);
                visited.insert(node);
                sorted.push((node, src));
            }

            for &(dst, _) in &mvs {
                if !visited.contains(&dst) {
                    dfs(dst, &move_graph, &mut visited, &mut visiting, &mut sorted, &mut headers);
                }
            }
            sorted.reverse();

            let mut members: BTreeMap<Loc, Vec<Loc>> = BTreeMap::new();
            let mut in_cycle: BTreeSet<Loc> = BTreeSet::new();
            for &header in &headers {
                let mut runner = header;
                loop {
                    members.entry(header).or_default().push(runner);
                    runner = move_graph[&runner];
                    if runner == header {
                        break;
                    }
                }
                for &m in &members[&header] {
                    in_cycle.insert(m);
                }
            }

            let term = module.block(bb).last_op();
            let mut emitted: BTreeSet<Loc> = BTreeSet::new();
            for &(dst, src) in &sorted {
                if dst == src || emitted.contains(&dst) || in_cycle.contains(&dst) {
                    continue;
                }
                let mv = rev_map[&bb][&(dst, src)];
                module.move_op_before(mv, term);
                emitted.insert(dst);
            }

            if members.is_empty() {
                continue;
            }
            tracing::debug!(block = module.block_number(bb), "phi move cycle detected");
            for &header in &headers {
                // Save the header, run the chain, restore from the temp.
                let header_src = move_graph[&header];
                let mv = rev_map[&bb][&(header, header_src)];
                let fp = matches!(header, Loc::Reg(r) if r.fp);
                let tmp = t.spill_reg(1, fp);
                module.put_attr(mv, Attr::Rd(tmp));
                module.remove_attr(mv, AttrKind::SpilledRd);
                module.move_op_before(mv, term);

                let mut curr = header_src;
                while curr != header {
                    let next = move_graph[&curr];
                    let mv = rev_map[&bb][&(curr, next)];
                    module.move_op_before(mv, term);
                    curr = next;
                }

                let mut b = Builder::new(module);
                b.set_before_op(term);
                let restore = b.create(t.mv(fp), &[], vec![Attr::Impure, Attr::Rs(tmp)]);
                match header {
                    Loc::Reg(r) => module.add_attr(restore, Attr::Rd(r)),
                    Loc::Slot(o) => {
                        module.add_attr(
                            restore,
                            Attr::SpilledRd(Spill { offset: o, fp, from: restore }),
                        );
                    }
                }
            }
        }

        // Cross-block references between phis force two passes.
        for &phi in &all_phis {
            module.remove_all_operands(phi);
        }
        for phi in all_phis {
            module.erase_op(phi);
        }

        // Every register-requiring op now carries exactly one of
        // Rd/SpilledRd.
        for bb in module.region(region).blocks().to_vec() {
            for op in module.block(bb).ops().to_vec() {
                if t.has_rd(module, op)
                    && !module.op(op).has_attr(AttrKind::Rd)
                    && !module.op(op).has_attr(AttrKind::SpilledRd)
                {
                    if spill_offset.contains_key(&op) {
                        let s = spill_of(&spill_offset, module, op);
                        module.add_attr(op, Attr::SpilledRd(s));
                    } else {
                        let r = get_reg(&assignment, module, op);
                        module.add_attr(op, Attr::Rd(r));
                    }
                }
            }
        }

        self.materialize_spills(module, region);
    }

    /// Step 10b: turn SpilledRd/SpilledRs* into slot stores and reloads
    /// around the consumer, rematerializing cheap defs instead of loading.
    fn materialize_spills(&mut self, module: &mut Module, region: crate::core::RegionId) {
        let t = self.target;
        let mut remove = Vec::new();

        for bb in module.region(region).blocks().to_vec() {
            // A SubSp bracket inside the block shifts every sp-relative
            // offset below it.
            let mut delta = 0i64;
            for op in module.block(bb).ops().to_vec() {
                if module.op(op).kind() == t.sub_sp() {
                    delta += module.op(op).int_val() as i64;
                    continue;
                }

                if let Some(Attr::SpilledRd(s)) =
                    module.op(op).find_attr(AttrKind::SpilledRd).cloned()
                {
                    // Rematerializable defs don't need the slot at all. The
                    // def may already be erased; deferred release keeps its
                    // storage readable.
                    let from_kind = module.op_raw(s.from).kind();
                    if (from_kind == t.load_imm() || from_kind == t.load_addr()) && s.from == op {
                        remove.push(op);
                        continue;
                    }

                    let reg = t.spill_reg(0, s.fp);
                    let mut b = Builder::new(module);
                    b.set_after_op(op);
                    if s.offset < 0 {
                        // The slot is an FP register in disguise.
                        let stand_in = PReg::fpr((-s.offset - 1) as u8);
                        b.create(
                            t.mv_to_slot_reg(),
                            &[],
                            vec![Attr::Impure, Attr::Rd(stand_in), Attr::Rs(reg)],
                        );
                    } else {
                        let offset = delta + s.offset;
                        assert!(offset < 16384, "spill slot out of range");
                        let (kind, extra) = t.spill_store(s.fp);
                        let mut attrs =
                            vec![Attr::Impure, Attr::Rs(reg), Attr::Rs2(t.sp()), Attr::Int(offset as i32)];
                        attrs.extend(extra);
                        b.create(kind, &[], attrs);
                    }
                    module.add_attr(op, Attr::Rd(reg));
                    module.remove_attr(op, AttrKind::SpilledRd);
                }

                for (which, kind_attr) in [
                    (0usize, AttrKind::SpilledRs),
                    (1, AttrKind::SpilledRs2),
                    (2, AttrKind::SpilledRs3),
                ] {
                    let Some(attr) = module.op(op).find_attr(kind_attr).cloned() else {
                        continue;
                    };
                    let s = attr.as_spill();
                    let reg = t.spill_reg(which, s.fp);
                    let from_kind = module.op_raw(s.from).kind();

                    let mut b = Builder::new(module);
                    b.set_before_op(op);
                    if from_kind == t.load_imm() {
                        let v = b.module.op_raw(s.from).int_val();
                        b.create(t.load_imm(), &[], vec![Attr::Impure, Attr::Rd(reg), Attr::Int(v)]);
                    } else if from_kind == t.load_addr() {
                        let name = b.module.op_raw(s.from).name().to_string();
                        b.create(
                            t.load_addr(),
                            &[],
                            vec![Attr::Impure, Attr::Rd(reg), Attr::Name(name)],
                        );
                    } else if s.offset < 0 {
                        let stand_in = PReg::fpr((-s.offset - 1) as u8);
                        b.create(
                            t.mv_from_slot_reg(),
                            &[],
                            vec![Attr::Impure, Attr::Rd(reg), Attr::Rs(stand_in)],
                        );
                    } else {
                        let offset = delta + s.offset;
                        assert!(offset < 16384, "spill slot out of range");
                        let (kind, extra) = t.spill_load(s.fp);
                        let mut attrs =
                            vec![Attr::Impure, Attr::Rd(reg), Attr::Rs(t.sp()), Attr::Int(offset as i32)];
                        attrs.extend(extra);
                        b.create(kind, &[], attrs);
                    }
                    let replacement = match kind_attr {
                        AttrKind::SpilledRs => Attr::Rs(reg),
                        AttrKind::SpilledRs2 => Attr::Rs2(reg),
                        _ => Attr::Rs3(reg),
                    };
                    module.add_attr(op, replacement);
                    module.remove_attr(op, kind_attr);
                }
            }
        }

        for op in remove {
            if !module.is_dead(op) {
                module.remove_all_operands(op);
                module.erase_op(op);
            }
        }
    }
}

impl Pass for RegAlloc {
    fn name(&self) -> &'static str {
        "regalloc"
    }

    fn stats(&self) -> Vec<(&'static str, usize)> {
        vec![("spilled", self.spilled)]
    }

    fn run(&mut self, module: &mut Module) -> Result<(), Report> {
        for func in module.funcs() {
            let is_leaf = module.find_all(func, self.target.call()).is_empty();
            self.run_func(module, func, is_leaf);
        }
        Ok(())
    }
}
