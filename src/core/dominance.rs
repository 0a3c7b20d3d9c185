//! CFG analyses over one region: predecessors, dominators, dominance
//! frontiers and post-dominators.
//!
//! Dominators use the Lengauer–Tarjan algorithm with a path-compressing
//! forest; loop unrolling recomputes dominators frequently enough that the
//! near-linear bound matters. Post-dominators are the same computation on
//! the reverse graph and require a unique `return` exit.
//!
//! All results land on the blocks themselves (`idom`, `dom_front`, `ipdom`)
//! and stay stale until the corresponding `update_*` runs again.

use rustc_hash::FxHashMap;

use crate::core::attributes::AttrKind;
use crate::core::ir::{BlockId, Module, RegionId};
use crate::dialects::sys::SysOp;

struct LtState {
    dfn: FxHashMap<BlockId, usize>,
    vertex: Vec<BlockId>,
    parent: FxHashMap<BlockId, BlockId>,
    sdom: FxHashMap<BlockId, BlockId>,
    uf: FxHashMap<BlockId, BlockId>,
    best: FxHashMap<BlockId, BlockId>,
    num: usize,
}

impl LtState {
    fn new() -> LtState {
        LtState {
            dfn: FxHashMap::default(),
            vertex: Vec::new(),
            parent: FxHashMap::default(),
            sdom: FxHashMap::default(),
            uf: FxHashMap::default(),
            best: FxHashMap::default(),
            num: 1,
        }
    }

    fn find(&mut self, v: BlockId) -> BlockId {
        if self.uf[&v] != v {
            let u = self.find(self.uf[&v]);
            let parent_best = self.best[&self.uf[&v]];
            if self.dfn[&self.sdom[&parent_best]] < self.dfn[&self.sdom[&self.best[&v]]] {
                self.best.insert(v, parent_best);
            }
            self.uf.insert(v, u);
        }
        self.uf[&v]
    }

    fn link(&mut self, v: BlockId, w: BlockId) {
        self.uf.insert(w, v);
    }
}

impl Module {
    /// Recomputes `preds`/`succs` of every block in the region from the
    /// Target/Else attributes of block terminators.
    pub fn update_preds(&mut self, region: RegionId) {
        let blocks = self.region(region).blocks.clone();
        for &bb in &blocks {
            self.block_mut(bb).preds.clear();
            self.block_mut(bb).succs.clear();
        }

        for &bb in &blocks {
            assert!(self.block(bb).op_count() > 0, "empty block in CFG");
            let last = self.block(bb).last_op();
            if let Some(crate::core::attributes::Attr::Target(t)) =
                self.op(last).find_attr(AttrKind::Target)
            {
                let t = *t;
                self.block_mut(t).preds.insert(bb);
            }
            if let Some(crate::core::attributes::Attr::Else(t)) =
                self.op(last).find_attr(AttrKind::Else)
            {
                let t = *t;
                self.block_mut(t).preds.insert(bb);
            }
        }

        for &bb in &blocks {
            for pred in self.block(bb).preds.clone() {
                self.block_mut(pred).succs.insert(bb);
            }
        }
    }

    /// Lengauer–Tarjan over the CFG rooted at the region's entry block.
    /// Unreachable blocks keep `idom == None`.
    pub fn update_doms(&mut self, region: RegionId) {
        self.update_preds(region);

        let blocks = self.region(region).blocks.clone();
        for &bb in &blocks {
            self.block_mut(bb).idom = None;
        }

        let entry = self.region(region).first_block();
        let mut st = LtState::new();
        self.dfs(entry, &mut st, false);

        for &bb in &blocks {
            st.sdom.insert(bb, bb);
            st.uf.insert(bb, bb);
            st.best.insert(bb, bb);
        }

        // Buckets: for each `u`, the blocks it semi-dominates.
        let mut bucket: FxHashMap<BlockId, Vec<BlockId>> = FxHashMap::default();

        for i in (1..st.vertex.len()).rev() {
            let bb = st.vertex[i];
            for v in self.block(bb).preds.clone() {
                // Unreachable predecessor. Skip it.
                if !st.dfn.contains_key(&v) {
                    continue;
                }
                let u = if st.dfn[&v] < st.dfn[&bb] {
                    v
                } else {
                    st.find(v);
                    st.best[&v]
                };
                if st.dfn[&st.sdom[&u]] < st.dfn[&st.sdom[&bb]] {
                    let s = st.sdom[&u];
                    st.sdom.insert(bb, s);
                }
            }

            bucket.entry(st.sdom[&bb]).or_default().push(bb);
            let parent = st.parent[&bb];
            st.link(parent, bb);

            for v in bucket.remove(&parent).unwrap_or_default() {
                st.find(v);
                let idom = if st.sdom[&st.best[&v]] == st.sdom[&v] { parent } else { st.best[&v] };
                self.block_mut(v).idom = Some(idom);
            }
        }

        // Second pass fixes idoms that were set to a relative of the real one.
        for i in 1..st.vertex.len() {
            let bb = st.vertex[i];
            let idom = self.block(bb).idom.expect("reachable block without idom");
            if idom != st.sdom[&bb] {
                self.block_mut(bb).idom = self.block(idom).idom;
            }
        }
    }

    /// Dominance frontier: a join block is in the frontier of every block on
    /// the pred-to-idom chains leading into it.
    pub fn update_dom_front(&mut self, region: RegionId) {
        self.update_doms(region);
        let blocks = self.region(region).blocks.clone();
        for &bb in &blocks {
            self.block_mut(bb).dom_front.clear();
        }

        for &bb in &blocks {
            if self.block(bb).preds.len() < 2 {
                continue;
            }
            let idom = self.block(bb).idom;
            for pred in self.block(bb).preds.clone() {
                let mut runner = Some(pred);
                while runner != idom {
                    let r = runner.expect("frontier walk ran past the entry");
                    self.block_mut(r).dom_front.insert(bb);
                    runner = self.block(r).idom;
                }
            }
        }
    }

    /// Post-dominators: the dual computation on the reverse graph. The
    /// region must have exactly one `return` exit.
    pub fn update_pdoms(&mut self, region: RegionId) {
        self.update_preds(region);

        let blocks = self.region(region).blocks.clone();
        let exits: Vec<BlockId> = blocks
            .iter()
            .copied()
            .filter(|&bb| self.op(self.block(bb).last_op()).kind() == SysOp::Return)
            .collect();
        assert!(exits.len() == 1, "no single exit for pdom");
        let exit = exits[0];

        for &bb in &blocks {
            self.block_mut(bb).ipdom = None;
        }

        let mut st = LtState::new();
        self.dfs(exit, &mut st, true);

        for &bb in &blocks {
            st.sdom.insert(bb, bb);
            st.uf.insert(bb, bb);
            st.best.insert(bb, bb);
        }

        let mut bucket: FxHashMap<BlockId, Vec<BlockId>> = FxHashMap::default();

        for i in (1..st.vertex.len()).rev() {
            let bb = st.vertex[i];
            for v in self.block(bb).succs.clone() {
                if !st.dfn.contains_key(&v) {
                    continue;
                }
                let u = if st.dfn[&v] < st.dfn[&bb] {
                    v
                } else {
                    st.find(v);
                    st.best[&v]
                };
                if st.dfn[&st.sdom[&u]] < st.dfn[&st.sdom[&bb]] {
                    let s = st.sdom[&u];
                    st.sdom.insert(bb, s);
                }
            }

            bucket.entry(st.sdom[&bb]).or_default().push(bb);
            let parent = st.parent[&bb];
            st.link(parent, bb);

            for v in bucket.remove(&parent).unwrap_or_default() {
                st.find(v);
                let ipdom = if st.sdom[&st.best[&v]] == st.sdom[&v] { parent } else { st.best[&v] };
                self.block_mut(v).ipdom = Some(ipdom);
            }
        }

        for i in 1..st.vertex.len() {
            let bb = st.vertex[i];
            let ipdom = self.block(bb).ipdom.expect("reachable block without ipdom");
            if ipdom != st.sdom[&bb] {
                self.block_mut(bb).ipdom = self.block(ipdom).ipdom;
            }
        }
    }

    fn dfs(&self, current: BlockId, st: &mut LtState, reverse: bool) {
        st.dfn.insert(current, st.num);
        st.num += 1;
        st.vertex.push(current);
        let next: Vec<BlockId> = if reverse {
            self.block(current).preds.iter().copied().collect()
        } else {
            self.block(current).succs.iter().copied().collect()
        };
        for v in next {
            if !st.dfn.contains_key(&v) {
                st.parent.insert(v, current);
                self.dfs(v, st, reverse);
            }
        }
    }

    /// Walks the idom chain; every block is dominated by itself.
    pub fn dominated_by(&self, bb: BlockId, dominator: BlockId) -> bool {
        let mut runner = Some(bb);
        while let Some(r) = runner {
            if r == dominator {
                return true;
            }
            runner = self.block(r).idom;
        }
        false
    }

    pub fn dominates(&self, bb: BlockId, dominated: BlockId) -> bool {
        self.dominated_by(dominated, bb)
    }

    /// Children lists of the dominator tree. Recomputes dominators first.
    pub fn dom_tree(&mut self, region: RegionId) -> FxHashMap<BlockId, Vec<BlockId>> {
        self.update_doms(region);
        let mut tree: FxHashMap<BlockId, Vec<BlockId>> = FxHashMap::default();
        for &bb in self.region(region).blocks() {
            if let Some(idom) = self.block(bb).idom() {
                tree.entry(idom).or_default().push(bb);
            }
        }
        tree
    }
}
