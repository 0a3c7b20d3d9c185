//! Demotes scalar globals to locals.
//!
//! A 4-byte global accessed by exactly one at-most-once function becomes an
//! alloca initialized in a fresh block after the entry (the entry must keep
//! holding only allocas). Globals nobody accesses are deleted outright.

use color_eyre::Report;
use rustc_hash::FxHashMap;

use crate::core::{Attr, AttrKind, Builder, Module, OpId, Pass};
use crate::dialects::sys::SysOp;

pub struct Localize {
    before_flatten: bool,
}

impl Localize {
    pub fn new(before_flatten: bool) -> Localize {
        Localize { before_flatten }
    }
}

impl Pass for Localize {
    fn name(&self) -> &'static str {
        "localize"
    }

    fn run(&mut self, module: &mut Module) -> Result<(), Report> {
        let g_map = module.global_map();
        let top = module.top();

        let mut accessed: FxHashMap<OpId, Vec<OpId>> = FxHashMap::default();
        for get in module.find_all(top, SysOp::GetGlobal) {
            let name = module.op(get).name().to_string();
            let Some(&global) = g_map.get(&name) else { continue };
            let mut func = get;
            while module.op(func).kind() != SysOp::Func {
                func = module.parent_op(func);
            }
            let list = accessed.entry(global).or_default();
            if !list.contains(&func) {
                list.push(func);
            }
        }

        for (name, global) in g_map {
            // Arrays are not localized; if anything we'd rather globalize.
            if module.op(global).size() != 4 {
                continue;
            }

            let Some(users) = accessed.get(&global) else {
                // Never accessed at all.
                module.erase_op(global);
                continue;
            };
            if users.len() > 1 {
                continue;
            }
            let user = users[0];
            if !module.op(user).has_attr(AttrKind::Once) {
                continue;
            }

            let region = module.func_region(user);
            let entry = module.region(region).first_block();

            let mut b = Builder::new(module);
            if self.before_flatten {
                b.set_to_block_end(entry);
            } else {
                let last = b.module.block(entry).last_op();
                b.set_before_op(last);
            }
            let addr = b.create(SysOp::Alloca, &[], vec![Attr::Size(4)]);

            // The init store goes in a fresh block so the entry stays pure
            // alloca, which alloca-appending passes rely on.
            let bb = module.insert_block_after(entry);
            let mut b = Builder::new(module);
            b.set_to_block_start(bb);
            let init = match b.module.op(global).find_attr(AttrKind::IntArray) {
                Some(Attr::IntArray(vs)) => {
                    let v = vs[0];
                    b.create(SysOp::Int, &[], vec![Attr::Int(v)])
                }
                _ => {
                    let Attr::FloatArray(vs) = b.module.op(global).attr(AttrKind::FloatArray) else {
                        unreachable!()
                    };
                    let v = vs[0];
                    b.create(SysOp::Float, &[], vec![Attr::Float(v)])
                }
            };
            let mut b = Builder::new(module);
            b.set_to_block_end(bb);
            b.create(SysOp::Store, &[init, addr], vec![Attr::Size(4)]);

            if !self.before_flatten {
                // Keep terminators legal: the entry jumps to the new block.
                let last = module.block(entry).last_op();
                module.move_op_to_end(last, bb);
                let mut b = Builder::new(module);
                b.set_to_block_end(entry);
                b.create(SysOp::Goto, &[], vec![Attr::Target(bb)]);
            }

            for get in module.find_all(user, SysOp::GetGlobal) {
                if module.op(get).name() == name {
                    module.replace_op_with(get, addr);
                }
            }
        }
        Ok(())
    }
}
