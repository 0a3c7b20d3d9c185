//! Structural IR checks. These verify contract invariants; a failure means
//! a pass has a bug, so callers usually `expect` the result.

use std::collections::BTreeMap;

use anyhow::{bail, Result};

use crate::core::attributes::AttrKind;
use crate::core::ir::{BlockId, Module, OpId};
use crate::dialects::sys::SysOp;

impl Module {
    /// Checks use-def symmetry over every op nested under the top:
    /// the producer of each operand lists the consumer in its use-set, and
    /// every use-set entry actually refers back.
    pub fn verify_uses(&self) -> Result<()> {
        let mut all = Vec::new();
        self.collect_ops(self.top(), &mut all);

        for &op in &all {
            for &v in self.op(op).operands() {
                if !self.op(v).uses().contains(&op) {
                    bail!(
                        "use-def mismatch: {} consumes {} but is not in its use-set",
                        self.display_op(op),
                        self.display_op(v)
                    );
                }
            }
            for &user in self.op(op).uses() {
                if !self.op(user).operands().contains(&op) {
                    bail!(
                        "use-def mismatch: {} lists user {} which has no such operand",
                        self.display_op(op),
                        self.display_op(user)
                    );
                }
            }
        }
        Ok(())
    }

    /// Post-flatten checks per function: every block ends with a terminator,
    /// and every phi's FROM multiset equals the block's predecessor set.
    pub fn verify_flat(&mut self) -> Result<()> {
        for func in self.funcs() {
            let region = self.func_region(func);
            self.update_preds(region);

            for &bb in self.region(region).blocks() {
                if self.block(bb).op_count() == 0 {
                    bail!("empty block bb{}", self.block_number(bb));
                }
                let last = self.block(bb).last_op();
                if !self.op(last).kind().is_terminator() {
                    bail!(
                        "bb{} does not end with a terminator: {}",
                        self.block_number(bb),
                        self.display_op(last)
                    );
                }

                for phi in self.phis(bb) {
                    let data = self.op(phi);
                    let mut froms: BTreeMap<BlockId, usize> = BTreeMap::new();
                    for i in 0..data.operand_count() {
                        *froms.entry(data.from_at(i)).or_default() += 1;
                    }
                    let preds = &self.block(bb).preds;
                    if froms.len() != preds.len()
                        || froms.values().any(|&n| n != 1)
                        || !froms.keys().all(|b| preds.contains(b))
                    {
                        bail!(
                            "phi incoming mismatch at bb{}: {}",
                            self.block_number(bb),
                            self.display_op(phi)
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// After register allocation, each register-requiring op carries exactly
    /// one of Rd / SpilledRd.
    pub fn verify_regs(&self, func: OpId, has_rd: impl Fn(&Module, OpId) -> bool) -> Result<()> {
        let region = self.func_region(func);
        for &bb in self.region(region).blocks() {
            for &op in self.block(bb).ops() {
                if !has_rd(self, op) {
                    continue;
                }
                let rd = self.op(op).has_attr(AttrKind::Rd);
                let spilled = self.op(op).has_attr(AttrKind::SpilledRd);
                if rd == spilled {
                    bail!(
                        "op carries {} of Rd/SpilledRd: {}",
                        if rd { "both" } else { "neither" },
                        self.display_op(op)
                    );
                }
            }
        }
        Ok(())
    }

    fn collect_ops(&self, root: OpId, out: &mut Vec<OpId>) {
        out.push(root);
        for &region in self.op(root).regions() {
            for &bb in self.region(region).blocks() {
                for &op in self.block(bb).ops() {
                    self.collect_ops(op, out);
                }
            }
        }
    }
}

/// Phi ops keep FROM attrs aligned with operands; anything else in front is
/// a malformed phi.
pub fn assert_phi_shape(module: &Module, phi: OpId) {
    let data = module.op(phi);
    assert!(data.kind() == SysOp::Phi);
    for i in 0..data.operand_count() {
        data.from_at(i);
    }
}
