//! Natural-loop discovery over a flattened CFG.
//!
//! LLVM terminology throughout: the _header_ is the single loop entry, the
//! _preheader_ its unique out-of-loop predecessor, a _latch_ carries a back
//! edge, an _exiting_ block jumps out of the loop and an _exit_ block is the
//! out-of-loop target of an exiting block.

use std::collections::BTreeSet;

use rustc_hash::FxHashMap;

use crate::core::{AnalysisResult, BlockId, Module, OpId, RegionId};
use crate::dialects::sys::SysOp;
use crate::matcher::Rule;

lazy_static! {
    static ref ADDI: Rule = Rule::new("(add x y)");
    static ref BR: Rule = Rule::new("(br (lt x y))");
    static ref BR_ROTATED: Rule = Rule::new("(br (lt (add x z) y))");
}

#[derive(Clone, Debug, Default)]
pub struct LoopInfo {
    pub blocks: BTreeSet<BlockId>,
    pub latches: BTreeSet<BlockId>,
    pub exitings: BTreeSet<BlockId>,
    pub exits: BTreeSet<BlockId>,
    pub header: BlockId,
    pub preheader: Option<BlockId>,
    /// Index of the enclosing loop in the forest, if any.
    pub parent: Option<usize>,
    pub subloops: Vec<usize>,
    /// First induction phi found, with its bounds. There might be several;
    /// only the first is kept.
    pub induction: Option<OpId>,
    pub start: Option<OpId>,
    pub stop: Option<OpId>,
    pub step: Option<OpId>,
}

impl LoopInfo {
    pub fn contains(&self, bb: BlockId) -> bool {
        self.blocks.contains(&bb)
    }

    pub fn latch(&self) -> BlockId {
        assert!(self.latches.len() == 1, "loop has {} latches", self.latches.len());
        *self.latches.iter().next().unwrap()
    }

    pub fn exit(&self) -> BlockId {
        assert!(self.exits.len() == 1, "loop has {} exits", self.exits.len());
        *self.exits.iter().next().unwrap()
    }
}

#[derive(Clone, Debug, Default)]
pub struct LoopForest {
    pub loops: Vec<LoopInfo>,
    pub loop_map: FxHashMap<BlockId, usize>,
}

impl LoopForest {
    pub fn top_level(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.loops.len()).filter(|&i| self.loops[i].parent.is_none())
    }

    /// Innermost-first ordering of one loop nest, down the whole subtree.
    pub fn postorder(&self, root: usize, out: &mut Vec<usize>) {
        for &sub in &self.loops[root].subloops {
            self.postorder(sub, out);
        }
        out.push(root);
    }

    pub fn analyze(module: &mut Module, region: RegionId) -> LoopForest {
        module.update_doms(region);

        let mut forest = LoopForest::default();
        let blocks = module.region(region).blocks().to_vec();

        // Collect the blocks and latches of each natural loop.
        for &bb in &blocks {
            for succ in module.block(bb).succs.clone() {
                if !module.dominated_by(bb, succ) {
                    continue;
                }
                // `succ` dominates `bb`: a back edge into `succ`.
                let idx = match forest.loop_map.get(&succ) {
                    Some(&idx) => {
                        forest.loops[idx].blocks.insert(bb);
                        idx
                    }
                    None => {
                        let mut info = LoopInfo { header: succ, ..Default::default() };
                        info.blocks.insert(succ);
                        info.blocks.insert(bb);
                        forest.loops.push(info);
                        let idx = forest.loops.len() - 1;
                        forest.loop_map.insert(succ, idx);
                        idx
                    }
                };
                forest.loops[idx].latches.insert(bb);

                let header = forest.loops[idx].header;
                let mut worklist = vec![bb];
                while let Some(back) = worklist.pop() {
                    if back == header {
                        continue;
                    }
                    for pred in module.block(back).preds.clone() {
                        if forest.loops[idx].blocks.insert(pred) {
                            worklist.push(pred);
                        }
                    }
                }
            }
        }

        // Preheaders, exits, exitings and nesting.
        for idx in 0..forest.loops.len() {
            let header = forest.loops[idx].header;

            let mut preheader = None;
            let mut several = false;
            for pred in module.block(header).preds.clone() {
                if forest.loops[idx].latches.contains(&pred) {
                    continue;
                }
                if preheader.is_some() {
                    several = true;
                    break;
                }
                preheader = Some(pred);
            }
            if !several {
                if let Some(ph) = preheader {
                    if module.block(ph).succs.len() == 1 {
                        forest.loops[idx].preheader = Some(ph);
                    }
                }
            }

            for bb in forest.loops[idx].blocks.clone() {
                let mut exiting = false;
                for succ in module.block(bb).succs.clone() {
                    if !forest.loops[idx].contains(succ) {
                        exiting = true;
                        forest.loops[idx].exits.insert(succ);
                        break;
                    }
                }
                if exiting {
                    forest.loops[idx].exitings.insert(bb);
                }
            }

            // The direct parent is the candidate contained in every other
            // containing loop.
            let candidates: Vec<usize> = (0..forest.loops.len())
                .filter(|&j| j != idx && forest.loops[j].contains(header))
                .collect();
            for &x in &candidates {
                let hx = forest.loops[x].header;
                let direct = candidates
                    .iter()
                    .all(|&y| y == x || module.dominated_by(hx, forest.loops[y].header));
                if direct {
                    forest.loops[idx].parent = Some(x);
                    forest.loops[x].subloops.push(idx);
                    break;
                }
            }
        }

        // Identify one induction phi per loop where the shape allows.
        for idx in 0..forest.loops.len() {
            forest.find_induction(module, idx);
        }

        forest
    }

    fn find_induction(&mut self, module: &Module, idx: usize) {
        let info = &self.loops[idx];
        if info.latches.len() != 1 {
            return;
        }
        let Some(preheader) = info.preheader else {
            return;
        };
        let header = info.header;
        let latch = info.latch();

        for phi in module.phis(header) {
            let data = module.op(phi);
            if data.operand_count() != 2 {
                continue;
            }
            let (mut bb1, mut bb2) = (data.from_at(0), data.from_at(1));
            let (mut def1, mut def2) = (data.operand(0), data.operand(1));
            if bb1 == latch && bb2 == preheader {
                std::mem::swap(&mut bb1, &mut bb2);
                std::mem::swap(&mut def1, &mut def2);
            }
            if !(bb1 == preheader && bb2 == latch) {
                continue;
            }

            // Candidate: the latch value must be `phi + step`.
            let external = crate::matcher::Binding::from_iter([("x".to_string(), phi)]);
            let Some(binding) = ADDI.match_only(module, def2, &external) else {
                continue;
            };
            let step = Rule::extract(&binding, "y");

            // Constant steps or ones defined above the preheader qualify; a
            // load may change under the loop and doesn't.
            let step_bb = module.op(step).parent();
            let step_is_const = module.op(step).kind() == SysOp::Int;
            if !step_is_const
                && !step_bb.is_some_and(|bb| module.dominates(bb, preheader))
            {
                continue;
            }
            if module.op(step).kind() == SysOp::Load {
                continue;
            }

            let info = &mut self.loops[idx];
            info.induction = Some(phi);
            info.start = Some(def1);
            info.step = Some(step);

            // The stop bound sits in the latch's branch (rotated) or the
            // header's (not yet rotated).
            let term = module.block(latch).last_op();
            let ext = crate::matcher::Binding::from_iter([("x".to_string(), phi)]);
            if module.op(term).kind() == SysOp::Branch {
                if let Some(binding) = BR_ROTATED.match_only(module, term, &ext) {
                    self.loops[idx].stop = Some(Rule::extract(&binding, "y"));
                }
                break;
            }
            let term = module.block(header).last_op();
            if let Some(binding) = BR.match_only(module, term, &ext) {
                self.loops[idx].stop = Some(Rule::extract(&binding, "y"));
            }
            break;
        }
    }
}

/// Per-function loop forests, cacheable in an analysis manager.
#[derive(Clone, Debug, Default)]
pub struct LoopAnalysis {
    pub forests: FxHashMap<OpId, LoopForest>,
}

impl AnalysisResult for LoopAnalysis {
    fn name(&self) -> &'static str {
        "loop-analysis"
    }
}

impl LoopAnalysis {
    pub fn run(module: &mut Module) -> LoopAnalysis {
        let mut result = LoopAnalysis::default();
        for func in module.funcs() {
            let region = module.func_region(func);
            result.forests.insert(func, LoopForest::analyze(module, region));
        }
        result
    }
}
