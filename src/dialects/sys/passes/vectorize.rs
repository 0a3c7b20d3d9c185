//! A narrow four-wide vectorizer for i32 loops.
//!
//! Preconditions: single latch, rotated, no branches inside, no calls,
//! every header phi is an address advancing by exactly 4 bytes with a
//! distinct base, and no base is both read and written in one iteration.
//! Stride-4 alignment is a guaranteed property of the input language (stack
//! arrays and globals are 16-byte aligned), so the main loop widens loads
//! and stores to 16 bytes with the stride quadrupled, and the untouched
//! body is cloned behind it as the scalar epilogue for the residual
//! iterations.

use std::collections::{BTreeSet, VecDeque};

use color_eyre::Report;
use rustc_hash::FxHashMap;

use crate::core::{Attr, AttrKind, Builder, Module, OpId, Pass, Ty};
use crate::dialects::sys::analysis::{LoopAnalysis, LoopInfo};
use crate::dialects::sys::SysOp;
use crate::matcher::{Binding, Rule};

lazy_static! {
    static ref BR_ROTATED_L: Rule = Rule::new("(br (lt (addl x z) y))");
    static ref ADDLI: Rule = Rule::new("(addl x y)");
}

#[derive(Default)]
pub struct Vectorize {
    base: FxHashMap<OpId, Option<OpId>>,
}

impl Vectorize {
    /// Base pointer through addl chains and phis; the plain Base analysis
    /// doesn't look through phis at all.
    fn find_base(&mut self, module: &Module, op: OpId) -> Option<OpId> {
        if let Some(&b) = self.base.get(&op) {
            return b;
        }
        let kind = module.op(op).kind();
        if kind == SysOp::AddL {
            let b = self.find_base(module, module.op(op).operand(0));
            self.base.insert(op, b);
            return b;
        }
        if kind == SysOp::Alloca || kind == SysOp::GetGlobal {
            self.base.insert(op, Some(op));
            return Some(op);
        }
        if kind == SysOp::Phi {
            // Break the cycle with a provisional self-entry.
            self.base.insert(op, Some(op));
            let mut result = self.find_base(module, module.op(op).operand(0));
            for i in 1..module.op(op).operand_count() {
                let b = self.find_base(module, module.op(op).operand(i));
                if b != result && b != Some(op) {
                    result = None;
                    break;
                }
            }
            self.base.insert(op, result);
            return result;
        }
        self.base.insert(op, None);
        None
    }

    fn run_loop(&mut self, module: &mut Module, info: &mut LoopInfo) {
        if info.latches.len() > 1 || info.preheader.is_none() {
            return;
        }
        let header = info.header;
        let latch = info.latch();
        let preheader = info.preheader.unwrap();

        let latchterm = module.block(latch).last_op();
        if module.op(latchterm).kind() != SysOp::Branch {
            return;
        }

        let phis = module.phis(header);

        // LoopAnalysis only finds addi inductions; pick up addl ones here.
        if info.induction.is_none() {
            for &phi in &phis {
                let def1 = module.phi_from(phi, preheader);
                let def2 = module.phi_from(phi, latch);
                let external = Binding::from_iter([("x".to_string(), phi)]);
                let Some(binding) = ADDLI.match_only(module, def2, &external) else {
                    continue;
                };
                let step = Rule::extract(&binding, "y");
                let step_bb = module.op(step).parent();
                if module.op(step).kind() != SysOp::Int
                    && !step_bb.is_some_and(|bb| module.dominates(bb, preheader))
                {
                    continue;
                }
                if module.op(step).kind() == SysOp::Load {
                    continue;
                }
                info.induction = Some(phi);
                info.start = Some(def1);
                info.step = Some(step);
                let ext = Binding::from_iter([("x".to_string(), phi)]);
                if let Some(binding) = BR_ROTATED_L.match_only(module, latchterm, &ext) {
                    info.stop = Some(Rule::extract(&binding, "y"));
                }
                break;
            }
        }
        // A stop bound is needed to carve off the epilogue.
        let Some(stop) = info.stop else { return };
        let Some(induction) = info.induction else { return };

        // No branching but the latch; no calls anywhere.
        for &bb in &info.blocks {
            let term = module.block(bb).last_op();
            if module.op(term).kind() == SysOp::Branch && bb != latch {
                return;
            }
            for &op in module.block(bb).ops() {
                if module.op(op).kind() == SysOp::Call {
                    return;
                }
            }
        }

        // Every phi advances some distinct base by 4 bytes.
        self.base.clear();
        let mut bases: BTreeSet<OpId> = BTreeSet::new();
        for &phi in &phis {
            let latchval = module.phi_from(phi, latch);
            if module.op(latchval).kind() != SysOp::AddL {
                return;
            }
            let Some(base) = self.find_base(module, latchval) else { return };
            let step = module.op(latchval).operand(1);
            if module.op(step).kind() != SysOp::Int || module.op(step).int_val() != 4 {
                return;
            }
            if !bases.insert(base) {
                return;
            }
        }

        // No base both read and written, and every access goes through a
        // header phi.
        let mut loads = Vec::new();
        let mut stores = Vec::new();
        let mut addrs = Vec::new();
        let mut stored: BTreeSet<Option<OpId>> = BTreeSet::new();
        let mut loaded: BTreeSet<Option<OpId>> = BTreeSet::new();
        for &bb in &info.blocks {
            for &op in module.block(bb).ops() {
                match module.op(op).kind() {
                    k if k == SysOp::Store => {
                        let addr = module.op(op).operand(1);
                        stored.insert(self.find_base(module, addr));
                        addrs.push(addr);
                        stores.push(op);
                    }
                    k if k == SysOp::Load => {
                        let addr = module.op(op).operand(0);
                        loaded.insert(self.find_base(module, addr));
                        addrs.push(addr);
                        loads.push(op);
                    }
                    _ => {}
                }
            }
        }
        if stored.contains(&None) || loaded.contains(&None) {
            return;
        }
        if stored.intersection(&loaded).next().is_some() {
            return;
        }
        let phiset: BTreeSet<OpId> = phis.iter().copied().collect();
        for &addr in &addrs {
            if !phiset.contains(&addr) {
                return;
            }
        }

        // Widen. opmap tracks the vector counterpart of every scalar op;
        // a failure mid-way undoes everything created so far.
        let mut success = true;
        let mut erased: Vec<OpId> = Vec::new();
        let mut created: Vec<OpId> = Vec::new();
        let mut opmap: FxHashMap<OpId, OpId> = FxHashMap::default();
        let mut visited: BTreeSet<OpId> = BTreeSet::new();
        let mut queue: VecDeque<OpId> = stores.iter().copied().collect();

        for &load in &loads {
            if module.op(load).result_ty() != Ty::I32 {
                success = false;
                break;
            }
            visited.insert(load);
            let mut b = Builder::new(module);
            b.set_before_op(load);
            let operands = b.module.op(load).operands().to_vec();
            let ld = b.create_ty(Ty::I128, SysOp::Load, &operands, vec![Attr::Size(16)]);
            opmap.insert(load, ld);
            created.push(ld);
            erased.push(load);
            for &user in module.op(load).uses() {
                if user != ld {
                    queue.push_back(user);
                }
            }
        }

        while success {
            let Some(x) = queue.pop_back() else { break };

            // Operands first; stores sank to the front keep waiting.
            if module.op(x).parent().is_some_and(|p| info.contains(p)) {
                let waitlist: Vec<OpId> = if module.op(x).kind() == SysOp::Store {
                    vec![module.op(x).operand(0)]
                } else {
                    module.op(x).operands().to_vec()
                };
                let mut ready = true;
                for def in waitlist {
                    if !visited.contains(&def)
                        && module.op(def).parent().is_some_and(|p| info.contains(p))
                        && module.op(def).kind() != SysOp::Phi
                        && !opmap.contains_key(&def)
                    {
                        queue.push_back(def);
                        ready = false;
                    }
                }
                if !ready {
                    queue.push_front(x);
                    continue;
                }
            }
            if !visited.insert(x) {
                continue;
            }

            match module.op(x).kind() {
                k if k == SysOp::Int => {
                    let mut b = Builder::new(module);
                    b.set_before_op(x);
                    let bc = b.create(SysOp::Broadcast, &[x], vec![]);
                    opmap.insert(x, bc);
                    created.push(bc);
                }
                k if k == SysOp::Load => {
                    // In-loop loads were all processed above; this one is
                    // loop-invariant, keep it scalar.
                    assert!(!module.op(x).parent().is_some_and(|p| info.contains(p)));
                    opmap.insert(x, x);
                }
                k if k == SysOp::Store => {
                    let value = module.op(x).operand(0);
                    let addr = module.op(x).operand(1);
                    let widened = if module.op(value).kind() == SysOp::Int
                        || !module.op(value).parent().is_some_and(|p| info.contains(p))
                    {
                        // memset-like: broadcast the invariant value.
                        let mut b = Builder::new(module);
                        b.set_before_op(x);
                        let bc = b.create(SysOp::Broadcast, &[value], vec![]);
                        created.push(bc);
                        Some(bc)
                    } else {
                        opmap.get(&value).copied().filter(|&v| {
                            module.op(v).result_ty() == Ty::I128
                        })
                    };
                    let Some(wide) = widened else {
                        success = false;
                        break;
                    };
                    let mut b = Builder::new(module);
                    b.set_before_op(x);
                    let st = b.create(SysOp::Store, &[wide, addr], vec![Attr::Size(16)]);
                    opmap.insert(x, st);
                    created.push(st);
                    erased.push(x);
                }
                k if k == SysOp::AddI || k == SysOp::MulI => {
                    let vop = if k == SysOp::AddI { SysOp::AddV } else { SysOp::MulV };
                    let mut a = module.op(x).operand(0);
                    let mut bo = module.op(x).operand(1);
                    let wide = |m: &Module, o: &FxHashMap<OpId, OpId>, v: OpId| {
                        o.get(&v).is_some_and(|&w| m.op(w).result_ty() == Ty::I128)
                    };
                    if wide(module, &opmap, a) && wide(module, &opmap, bo) {
                        let (wa, wb) = (opmap[&a], opmap[&bo]);
                        let mut b = Builder::new(module);
                        b.set_before_op(x);
                        let v = b.create(vop, &[wa, wb], vec![]);
                        opmap.insert(x, v);
                        created.push(v);
                        erased.push(x);
                        continue;
                    }
                    if opmap.contains_key(&bo) && !opmap.contains_key(&a) {
                        std::mem::swap(&mut a, &mut bo);
                    }
                    if opmap.contains_key(&a) && !opmap.contains_key(&bo) {
                        // The scalar side must be loop-invariant.
                        if module.op(bo).parent().is_some_and(|p| info.contains(p)) {
                            success = false;
                            break;
                        }
                        let wa = opmap[&a];
                        if module.op(wa).result_ty() == Ty::I128 {
                            let mut b = Builder::new(module);
                            b.set_before_op(x);
                            let bc = b.create(SysOp::Broadcast, &[bo], vec![]);
                            created.push(bc);
                            let v = b.create(vop, &[wa, bc], vec![]);
                            opmap.insert(x, v);
                            created.push(v);
                            erased.push(x);
                            continue;
                        }
                    }
                    success = false;
                    break;
                }
                _ => {
                    success = false;
                    break;
                }
            }
        }

        if !success {
            for &op in &created {
                module.remove_all_operands(op);
            }
            for op in created {
                if !module.is_dead(op) {
                    module.erase_op(op);
                }
            }
            return;
        }

        // Clone the scalar body behind the vector loop as the epilogue.
        let unwanted: BTreeSet<OpId> = created.iter().copied().collect();
        let exit = info.exit();
        let mut clone_map: FxHashMap<OpId, OpId> = FxHashMap::default();
        let mut rewire_map: FxHashMap<crate::core::BlockId, crate::core::BlockId> =
            FxHashMap::default();

        let newpreheader = module.insert_block_before(exit);
        for &bb in &info.blocks {
            rewire_map.insert(bb, module.insert_block_before(exit));
        }

        let mut b = Builder::new(module);
        b.set_to_block_end(newpreheader);
        b.create(SysOp::Goto, &[], vec![Attr::Target(rewire_map[&header])]);

        for (&k, &v) in rewire_map.clone().iter() {
            let mut b = Builder::new(module);
            b.set_to_block_end(v);
            for op in b.module.block(k).ops().to_vec() {
                if !unwanted.contains(&op) {
                    let cloned = b.copy(op);
                    clone_map.insert(op, cloned);
                }
            }
        }
        for (&old, &cloned) in clone_map.clone().iter() {
            for i in 0..module.op(old).operand_count() {
                let def = module.op(old).operand(i);
                if let Some(&mapped) = clone_map.get(&def) {
                    module.set_operand(cloned, i, mapped);
                }
            }
        }
        for &v in rewire_map.values() {
            let term = module.block(v).last_op();
            if let Some(Attr::Target(t)) = module.op(term).find_attr(AttrKind::Target) {
                if let Some(&new) = rewire_map.get(t) {
                    module.put_attr(term, Attr::Target(new));
                }
            }
            if let Some(Attr::Else(t)) = module.op(term).find_attr(AttrKind::Else) {
                if let Some(&new) = rewire_map.get(t) {
                    module.put_attr(term, Attr::Else(new));
                }
            }
        }

        // The vector loop's exit edge enters the epilogue's preheader.
        let term = module.block(latch).last_op();
        if module.op(term).target() == exit {
            module.put_attr(term, Attr::Target(newpreheader));
        }
        if module.op(term).else_target() == exit {
            module.put_attr(term, Attr::Else(newpreheader));
        }
        let tail = rewire_map[&latch];

        // The vector loop stops 4*step early; the epilogue covers the rest.
        let cond = module.op(module.block(latch).last_op()).operand(0);
        let preterm = module.block(preheader).last_op();
        let mut b = Builder::new(module);
        b.set_before_op(preterm);
        let mut stop_v = stop;
        if b.module.op(stop_v).kind() == SysOp::Int
            && b.module.op(stop_v).parent().is_some_and(|p| info.contains(p))
        {
            let v = b.module.op(stop_v).int_val();
            stop_v = b.create(SysOp::Int, &[], vec![Attr::Int(v)]);
        }
        let mut step_v = info.step.unwrap();
        if b.module.op(step_v).kind() == SysOp::Int
            && b.module.op(step_v).parent().is_some_and(|p| info.contains(p))
        {
            let v = b.module.op(step_v).int_val();
            step_v = b.create(SysOp::Int, &[], vec![Attr::Int(v)]);
        }
        let four = b.create(SysOp::Int, &[], vec![Attr::Int(4)]);
        let mul = b.create(SysOp::MulI, &[four, step_v], vec![]);
        let lim = b.create(SysOp::SubL, &[stop_v, mul], vec![]);
        let iv_latch = module.phi_from(induction, latch);
        let mut b = Builder::new(module);
        b.replace(cond, SysOp::Lt, &[iv_latch, lim], vec![]);

        // Epilogue header phis: the backedge comes from the cloned latch,
        // the entry value from the main loop's phis.
        let header_phis = module.phis(rewire_map[&header]);
        for &phi in &header_phis {
            for i in 0..module.op(phi).operand_count() {
                if module.op(phi).from_at(i) == latch {
                    module.set_attr(phi, i, Attr::From(tail));
                    break;
                }
            }
        }
        for phi in module.phis(exit) {
            for i in 0..module.op(phi).operand_count() {
                if module.op(phi).from_at(i) == latch {
                    module.set_attr(phi, i, Attr::From(tail));
                    let def = module.op(phi).operand(i);
                    if let Some(&mapped) = clone_map.get(&def) {
                        module.set_operand(phi, i, mapped);
                    }
                    break;
                }
            }
        }
        let mut phi_entry: FxHashMap<OpId, OpId> = FxHashMap::default();
        for &phi in &phis {
            phi_entry.insert(module.phi_from(phi, preheader), module.phi_from(phi, latch));
        }
        for &phi in &header_phis {
            for i in 0..module.op(phi).operand_count() {
                if module.op(phi).from_at(i) == preheader {
                    module.set_attr(phi, i, Attr::From(newpreheader));
                    let def = module.op(phi).operand(i);
                    if let Some(&v) = phi_entry.get(&def) {
                        module.set_operand(phi, i, v);
                    }
                    break;
                }
            }
        }

        // Commit: swap the scalar ops for their vector forms, then
        // quadruple the address strides.
        for op in erased {
            let wide = opmap[&op];
            module.replace_op_with(op, wide);
        }
        for &phi in &phis {
            let latchval = module.phi_from(phi, latch);
            if module.op(latchval).kind() == SysOp::AddL {
                let step = module.op(latchval).operand(1);
                if module.op(step).kind() == SysOp::Int {
                    let v = module.op(step).int_val();
                    let mut b = Builder::new(module);
                    b.set_before_op(latchval);
                    let more = b.create(SysOp::Int, &[], vec![Attr::Int(v * 4)]);
                    module.set_operand(latchval, 1, more);
                }
            }
        }
        let latchval = module.phi_from(induction, latch);
        if module.op(latchval).kind() == SysOp::AddI {
            let step = module.op(latchval).operand(1);
            if module.op(step).kind() == SysOp::Int {
                let v = module.op(step).int_val();
                let mut b = Builder::new(module);
                b.set_before_op(latchval);
                let more = b.create(SysOp::Int, &[], vec![Attr::Int(v * 4)]);
                module.set_operand(latchval, 1, more);
            }
        }

        tracing::debug!(header = module.block_number(header), "vectorized loop");
    }
}

impl Pass for Vectorize {
    fn name(&self) -> &'static str {
        "vectorize"
    }

    fn run(&mut self, module: &mut Module) -> Result<(), Report> {
        let analysis = LoopAnalysis::run(module);
        for func in module.funcs() {
            let Some(forest) = analysis.forests.get(&func) else { continue };
            for idx in 0..forest.loops.len() {
                // Innermost loops only.
                if !forest.loops[idx].subloops.is_empty() {
                    continue;
                }
                let mut info = forest.loops[idx].clone();
                self.run_loop(module, &mut info);
            }
        }
        Ok(())
    }
}
