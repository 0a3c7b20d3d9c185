//! Iterative live-variable analysis over one region.
//!
//! Phi uses are attributed to the incoming edge, not the phi's block:
//!
//! ```text
//! live_out(B) = U_{S in succ(B)} (live_in(S) - phi_defs(S)) U phi_uses_from(B, S)
//! live_in(B)  = phi_defs(B) U upward_exposed(B) U (live_out(B) - defined_in(B))
//! ```
//!
//! This is the SSA-book formulation; the register allocator depends on phi
//! operands becoming live at the end of their source block only.

use std::collections::BTreeSet;

use rustc_hash::FxHashMap;

use crate::core::ir::{BlockId, Module, OpId, RegionId};
use crate::dialects::sys::SysOp;

impl Module {
    pub fn update_liveness(&mut self, region: RegionId) {
        self.update_preds(region);

        let blocks = self.region(region).blocks.clone();
        for &bb in &blocks {
            self.block_mut(bb).live_in.clear();
            self.block_mut(bb).live_out.clear();
        }

        let mut phis: FxHashMap<BlockId, BTreeSet<OpId>> = FxHashMap::default();
        let mut upward: FxHashMap<BlockId, BTreeSet<OpId>> = FxHashMap::default();
        let mut defined: FxHashMap<BlockId, BTreeSet<OpId>> = FxHashMap::default();

        for &bb in &blocks {
            let phi_set = phis.entry(bb).or_default();
            let mut defs = BTreeSet::new();
            let mut exposed = BTreeSet::new();
            for &op in self.block(bb).ops() {
                if self.op(op).kind() == SysOp::Phi {
                    phi_set.insert(op);
                    continue;
                }
                defs.insert(op);
                // Used but not yet defined in this block means the value
                // flows in from above.
                for &v in self.op(op).operands() {
                    if !defs.contains(&v) {
                        exposed.insert(v);
                    }
                }
            }
            upward.insert(bb, exposed);
            defined.insert(bb, defs);
        }

        loop {
            let mut changed = false;
            for &bb in &blocks {
                let mut live_out = BTreeSet::new();
                for succ in self.block(bb).succs.clone() {
                    for &v in self.block(succ).live_in() {
                        if !phis[&succ].contains(&v) {
                            live_out.insert(v);
                        }
                    }
                    for &phi in &phis[&succ] {
                        let data = self.op(phi);
                        for i in 0..data.operand_count() {
                            if data.from_at(i) == bb {
                                live_out.insert(data.operand(i));
                            }
                        }
                    }
                }

                let mut live_in: BTreeSet<OpId> =
                    live_out.difference(&defined[&bb]).copied().collect();
                live_in.extend(upward[&bb].iter().copied());
                live_in.extend(phis[&bb].iter().copied());

                if live_in != self.block(bb).live_in {
                    changed = true;
                }
                self.block_mut(bb).live_out = live_out;
                self.block_mut(bb).live_in = live_in;
            }
            if !changed {
                break;
            }
        }
    }
}
