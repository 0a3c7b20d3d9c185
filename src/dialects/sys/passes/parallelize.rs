//! Splits parallelizable top-level `For` loops across two threads.
//!
//! The main thread keeps the first half of the iteration range; a
//! synthesized worker function (`__worker_<n>_<func>`) runs the second half
//! in a spawned thread. Values the worker captures are routed through
//! freshly-created globals (`__worker_global_<n>`), and per-worker lock and
//! stack globals (`_lock<name>`, `_stack<name>`) back the clone/join/wake
//! primitives the dump stage expands into assembly.

use color_eyre::Report;
use rustc_hash::FxHashMap;

use crate::core::{Attr, AttrKind, Builder, Cursor, Module, OpId, Pass, Ty};
use crate::dialects::sys::analysis::Parallelizable;
use crate::dialects::sys::passes::early_inline::opcount;
use crate::dialects::sys::SysOp;

const WORKER_STACK_SIZE: usize = 8192;

#[derive(Default)]
pub struct Parallelize {
    spawned: usize,
}

/// Scalar allocas that are only read inside the loop, with the value they
/// hold on entry. A read-only scalar without a deterministic init defeats
/// the split.
fn read_only_allocas(module: &Module, looop: OpId) -> Option<FxHashMap<OpId, OpId>> {
    let mut stored = std::collections::BTreeSet::new();
    for store in module.find_all(looop, SysOp::Store) {
        stored.insert(module.op(store).operand(1));
    }

    let mut map = FxHashMap::default();
    for load in module.find_all(looop, SysOp::Load) {
        let addr = module.op(load).operand(0);
        if module.op(addr).kind() != SysOp::Alloca
            || module.op(addr).size() != 4
            || stored.contains(&addr)
        {
            continue;
        }

        let mut init = None;
        let mut runner = module.prev_op(looop);
        while let Some(op) = runner {
            let kind = module.op(op).kind();
            if kind == SysOp::Store && module.op(op).operand(1) == addr {
                init = Some(module.op(op).operand(0));
                break;
            }
            if kind == SysOp::While || kind == SysOp::For || kind == SysOp::If {
                break;
            }
            runner = module.prev_op(op);
        }
        // Copying a whole use-def chain for the init is not worth it.
        init?;
        map.insert(addr, init.unwrap());
    }
    Some(map)
}

fn deep_copy(b: &mut Builder, op: OpId, map: &mut FxHashMap<OpId, OpId>) {
    let copied = b.copy(op);
    map.insert(op, copied);
    for region in b.module.op(op).regions().to_vec() {
        b.scoped(|b| {
            let entry = b.module.region(region).first_block();
            let cregion = b.module.append_region(copied);
            let centry = b.module.append_block(cregion);
            b.set_to_block_start(centry);
            for inner in b.module.block(entry).ops().to_vec() {
                deep_copy(b, inner, map);
            }
        });
    }
}

impl Pass for Parallelize {
    fn name(&self) -> &'static str {
        "parallelize"
    }

    fn stats(&self) -> Vec<(&'static str, usize)> {
        vec![("spawned-workers", self.spawned)]
    }

    fn run(&mut self, module: &mut Module) -> Result<(), Report> {
        Parallelizable::run(module);

        // Top-level loops only.
        let mut loops = Vec::new();
        for func in module.funcs() {
            let region = module.func_region(func);
            for &bb in module.region(region).blocks() {
                for &op in module.block(bb).ops() {
                    if module.op(op).kind() == SysOp::For {
                        loops.push((func, op));
                    }
                }
            }
        }

        for (func, looop) in loops {
            if !module.op(looop).has_attr(AttrKind::Parallel) {
                continue;
            }
            let Some(alloca_map) = read_only_allocas(module, looop) else { continue };

            // Small call-free loops aren't worth a thread.
            let region = module.op(looop).region(0);
            if opcount(module, region) <= 100
                && module.find_all(looop, SysOp::Call).is_empty()
                && module.find_all(looop, SysOp::For).len() <= 1
            {
                continue;
            }

            let step = module.op(looop).operand(2);
            if module.op(step).kind() != SysOp::Int || module.op(step).int_val() != 1 {
                continue;
            }

            let start = module.op(looop).operand(0);
            let stop = module.op(looop).operand(1);

            // Halve without overflow: ((stop - start) >> 1) + start.
            let mut b = Builder::new(module);
            b.set_before_op(looop);
            let diff = b.create(SysOp::SubI, &[stop, start], vec![]);
            let one = b.create(SysOp::Int, &[], vec![Attr::Int(1)]);
            let div = b.create(SysOp::RShift, &[diff, one], vec![]);
            let newstop = b.create(SysOp::AddI, &[div, start], vec![]);
            module.set_operand(looop, 1, newstop);

            let host_name = module.op(func).name().to_string();
            let worker_name = format!("__worker_{}_{}", self.spawned, host_name);

            // The worker function, with its own induction slot and a copy
            // of the loop over [newstop, stop).
            let top_block = module.top_block();
            let mut b = Builder::new(module);
            b.restore(Cursor { bb: top_block, at: 0 });
            let worker = b.create(
                SysOp::Func,
                &[],
                vec![Attr::Name(worker_name.clone()), Attr::ArgCount(0), Attr::Impure],
            );
            let wbody = module.create_first_block(worker);

            let mut b = Builder::new(module);
            b.set_to_block_start(wbody);
            let iv_addr = b.create(SysOp::Alloca, &[], vec![Attr::Size(4)]);
            let wstep = b.create(SysOp::Int, &[], vec![Attr::Int(1)]);

            let mut clone_map: FxHashMap<OpId, OpId> = FxHashMap::default();
            let copied_loop =
                b.create(SysOp::For, &[newstop, stop, wstep, iv_addr], vec![]);
            clone_map.insert(looop, copied_loop);
            let cregion = module.append_region(copied_loop);
            let centry = module.append_block(cregion);
            let src_entry = module.region(region).first_block();
            let mut b = Builder::new(module);
            b.set_to_block_start(centry);
            for op in b.module.block(src_entry).ops().to_vec() {
                deep_copy(&mut b, op, &mut clone_map);
            }

            // Rewire cloned operands; anything defined outside the loop is
            // a capture. Read-only scalar allocas never capture by address;
            // the worker rebuilds them from their captured entry value.
            let mut captures: Vec<OpId> = Vec::new();
            let cloned: Vec<(OpId, OpId)> = clone_map.iter().map(|(&k, &v)| (k, v)).collect();
            for &(_, v) in &cloned {
                for i in 0..module.op(v).operand_count() {
                    let def = module.op(v).operand(i);
                    match clone_map.get(&def) {
                        Some(&mapped) => module.set_operand(v, i, mapped),
                        None => {
                            if !captures.contains(&def)
                                && def != newstop
                                && def != stop
                                && !alloca_map.contains_key(&def)
                            {
                                captures.push(def);
                            }
                        }
                    }
                }
            }
            // Bounds are captured too.
            captures.push(newstop);
            captures.push(stop);
            // Read-only scalars come in by value.
            for (_, &init) in alloca_map.iter() {
                if !captures.contains(&init) {
                    captures.push(init);
                }
            }

            // One fresh global per capture: the host stores before the
            // clone, the worker loads at entry.
            let mut capture_global: FxHashMap<OpId, OpId> = FxHashMap::default();
            for (i, &cap) in captures.iter().enumerate() {
                let fp = module.op(cap).result_ty() == Ty::F32;
                let size = if module.op(cap).result_ty() == Ty::I64 { 8 } else { 4 };
                let gname = format!("__worker_global_{}_{}", self.spawned, i);
                let mut attrs = vec![
                    Attr::Size(size),
                    Attr::Name(gname),
                    Attr::Dims(vec![1]),
                ];
                if fp {
                    attrs.push(Attr::FloatArray(vec![0.0]));
                    attrs.push(Attr::Fp);
                } else {
                    attrs.push(Attr::IntArray(vec![0; size / 4]));
                }
                let top_block = module.top_block();
                let mut b = Builder::new(module);
                b.restore(Cursor { bb: top_block, at: 0 });
                let global = b.create(SysOp::Global, &[], attrs);
                capture_global.insert(cap, global);
            }

            // Worker prologue: reload captures, then substitute them for
            // the cloned uses.
            let mut replacement: FxHashMap<OpId, OpId> = FxHashMap::default();
            for &cap in &captures {
                let global = capture_global[&cap];
                let gname = module.op(global).name().to_string();
                let ty = module.op(cap).result_ty();
                let size = if ty == Ty::I64 { 8 } else { 4 };
                let mut b = Builder::new(module);
                b.set_before_op(copied_loop);
                let addr = b.create(SysOp::GetGlobal, &[], vec![Attr::Name(gname)]);
                let load = b.create_ty(ty, SysOp::Load, &[addr], vec![Attr::Size(size)]);
                replacement.insert(cap, load);
            }
            // Worker-local copies of the read-only scalars.
            let addrs: Vec<(OpId, OpId)> = alloca_map.iter().map(|(&a, &i)| (a, i)).collect();
            for (addr, init) in addrs {
                let init_value = replacement.get(&init).copied().unwrap_or(init);
                let mut b = Builder::new(module);
                b.set_before_op(copied_loop);
                let walloca = b.create(SysOp::Alloca, &[], vec![Attr::Size(4)]);
                b.create(SysOp::Store, &[init_value, walloca], vec![Attr::Size(4)]);
                replacement.insert(addr, walloca);
            }
            for &(_, v) in &cloned {
                for i in 0..module.op(v).operand_count() {
                    let def = module.op(v).operand(i);
                    if let Some(&load) = replacement.get(&def) {
                        module.set_operand(v, i, load);
                    }
                }
            }
            // The loop bounds of the copy itself.
            for i in [0usize, 1] {
                let def = module.op(copied_loop).operand(i);
                if let Some(&load) = replacement.get(&def) {
                    module.set_operand(copied_loop, i, load);
                }
            }

            // Worker epilogue: signal completion and return.
            let wregion = module.func_region(worker);
            let wtail = module.region(wregion).last_block();
            let mut b = Builder::new(module);
            b.set_to_block_end(wtail);
            b.create(SysOp::Wake, &[], vec![Attr::Name(worker_name.clone())]);
            b.create(SysOp::Return, &[], vec![]);

            // Lock and stack globals for the runtime snippets.
            for (gname, size) in [
                (format!("_lock{worker_name}"), 8usize),
                (format!("_stack{worker_name}"), WORKER_STACK_SIZE),
            ] {
                let top_block = module.top_block();
                let mut b = Builder::new(module);
                b.restore(Cursor { bb: top_block, at: 0 });
                b.create(
                    SysOp::Global,
                    &[],
                    vec![
                        Attr::Size(size),
                        Attr::Name(gname),
                        Attr::IntArray(vec![0; size / 4]),
                        Attr::Dims(vec![size as i32 / 4]),
                    ],
                );
            }

            // Host side: publish captures, spawn, run its half, join.
            for &cap in &captures {
                let global = capture_global[&cap];
                let gname = module.op(global).name().to_string();
                let ty = module.op(cap).result_ty();
                let size = if ty == Ty::I64 { 8 } else { 4 };
                let mut b = Builder::new(module);
                b.set_before_op(looop);
                let addr = b.create(SysOp::GetGlobal, &[], vec![Attr::Name(gname)]);
                b.create(SysOp::Store, &[cap, addr], vec![Attr::Size(size)]);
            }
            let mut b = Builder::new(module);
            b.set_before_op(looop);
            b.create(SysOp::Clone, &[], vec![Attr::Name(worker_name.clone())]);
            let mut b = Builder::new(module);
            b.set_after_op(looop);
            b.create(SysOp::Join, &[], vec![Attr::Name(worker_name)]);

            self.spawned += 1;
        }
        Ok(())
    }
}
