//! The IR substrate.
//!
//! A four-level nesting: the [`Module`] op owns a region whose single block
//! holds function and global definitions; functions own regions of basic
//! blocks; blocks own ops; ops may own further sub-regions (structured
//! control flow before CFG flattening).
//!
//! Everything lives in dense arenas inside the [`Module`] and is addressed
//! by integer ids. A value has no standalone object: it is identified by the
//! op that produces it (every op has at most one result), so operand lists
//! and use-sets store [`OpId`]s directly. Erasing pushes the id onto a
//! deferred-deletion list; [`Module::release`] runs at pass boundaries and
//! only then may slots be reused, so rewriters holding stale ids during a
//! pass still observe valid (though detached) storage.

use std::collections::BTreeSet;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::core::attributes::{Attr, AttrKind};
use crate::dialects::arm::ArmOp;
use crate::dialects::rv::RvOp;
use crate::dialects::sys::SysOp;

#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct OpId(pub(crate) u32);

#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct BlockId(pub(crate) u32);

#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct RegionId(pub(crate) u32);

/// A value is the single result of its defining op; the id doubles as the
/// value handle.
pub type Value = OpId;

/// Result types. The type is carried by the unique defining op, not by a
/// value object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Ty {
    Unit,
    I32,
    I64,
    F32,
    I128,
    F128,
}

/// Operation kind: the dialect plus the opcode within it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum OpKind {
    Sys(SysOp),
    Arm(ArmOp),
    Rv(RvOp),
}

impl OpKind {
    pub fn dialect(self) -> &'static str {
        match self {
            OpKind::Sys(_) => "sys",
            OpKind::Arm(_) => "arm",
            OpKind::Rv(_) => "rv",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            OpKind::Sys(op) => op.name(),
            OpKind::Arm(op) => op.name(),
            OpKind::Rv(op) => op.name(),
        }
    }

    pub fn is_terminator(self) -> bool {
        match self {
            OpKind::Sys(op) => op.is_terminator(),
            OpKind::Arm(op) => op.is_terminator(),
            OpKind::Rv(op) => op.is_terminator(),
        }
    }
}

#[derive(Debug)]
pub struct OpData {
    pub(crate) kind: OpKind,
    pub(crate) result_ty: Ty,
    pub(crate) operands: SmallVec<[OpId; 2]>,
    pub(crate) attrs: SmallVec<[Rc<Attr>; 2]>,
    pub(crate) regions: SmallVec<[RegionId; 1]>,
    pub(crate) uses: BTreeSet<OpId>,
    pub(crate) parent: Option<BlockId>,
    pub(crate) dead: bool,
}

impl OpData {
    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn result_ty(&self) -> Ty {
        self.result_ty
    }

    pub fn parent(&self) -> Option<BlockId> {
        self.parent
    }

    pub fn operands(&self) -> &[OpId] {
        &self.operands
    }

    pub fn operand(&self, i: usize) -> OpId {
        self.operands[i]
    }

    pub fn operand_count(&self) -> usize {
        self.operands.len()
    }

    pub fn uses(&self) -> &BTreeSet<OpId> {
        &self.uses
    }

    pub fn regions(&self) -> &[RegionId] {
        &self.regions
    }

    pub fn region(&self, i: usize) -> RegionId {
        self.regions[i]
    }

    pub fn attrs(&self) -> &[Rc<Attr>] {
        &self.attrs
    }

    pub fn attr_at(&self, i: usize) -> &Attr {
        &self.attrs[i]
    }

    pub fn find_attr(&self, kind: AttrKind) -> Option<&Attr> {
        self.attrs.iter().map(|a| a.as_ref()).find(|a| a.kind() == kind)
    }

    pub fn has_attr(&self, kind: AttrKind) -> bool {
        self.find_attr(kind).is_some()
    }

    /// Like [`OpData::find_attr`] but a missing attribute is a compiler bug.
    pub fn attr(&self, kind: AttrKind) -> &Attr {
        match self.find_attr(kind) {
            Some(attr) => attr,
            None => {
                panic!("op {}.{} has no {kind:?} attribute", self.kind.dialect(), self.kind.name())
            }
        }
    }

    pub fn int_val(&self) -> i32 {
        match self.attr(AttrKind::Int) {
            Attr::Int(v) => *v,
            _ => unreachable!(),
        }
    }

    pub fn float_val(&self) -> f32 {
        match self.attr(AttrKind::Float) {
            Attr::Float(v) => *v,
            _ => unreachable!(),
        }
    }

    pub fn size(&self) -> usize {
        match self.attr(AttrKind::Size) {
            Attr::Size(v) => *v,
            _ => unreachable!(),
        }
    }

    pub fn name(&self) -> &str {
        match self.attr(AttrKind::Name) {
            Attr::Name(v) => v,
            _ => unreachable!(),
        }
    }

    pub fn target(&self) -> BlockId {
        match self.attr(AttrKind::Target) {
            Attr::Target(v) => *v,
            _ => unreachable!(),
        }
    }

    pub fn else_target(&self) -> BlockId {
        match self.attr(AttrKind::Else) {
            Attr::Else(v) => *v,
            _ => unreachable!(),
        }
    }

    /// FROM attribute of the phi operand at index `i`. Phi ops keep their
    /// FROM attrs aligned with the operand list.
    pub fn from_at(&self, i: usize) -> BlockId {
        match self.attr_at(i) {
            Attr::From(v) => *v,
            other => panic!("phi attr {i} is {other:?}, not a FROM"),
        }
    }

    pub fn arg_count(&self) -> usize {
        match self.attr(AttrKind::ArgCount) {
            Attr::ArgCount(v) => *v,
            _ => unreachable!(),
        }
    }

    pub fn stack_offset(&self) -> i64 {
        match self.attr(AttrKind::StackOffset) {
            Attr::StackOffset(v) => *v,
            _ => unreachable!(),
        }
    }

    pub fn reg(&self) -> crate::core::attributes::PReg {
        self.attr(AttrKind::Reg).as_reg()
    }

    pub fn rd(&self) -> crate::core::attributes::PReg {
        self.attr(AttrKind::Rd).as_reg()
    }

    pub fn rs(&self) -> crate::core::attributes::PReg {
        self.attr(AttrKind::Rs).as_reg()
    }

    pub fn rs2(&self) -> crate::core::attributes::PReg {
        self.attr(AttrKind::Rs2).as_reg()
    }

    pub fn rs3(&self) -> crate::core::attributes::PReg {
        self.attr(AttrKind::Rs3).as_reg()
    }
}

#[derive(Debug)]
pub struct BlockData {
    pub(crate) ops: Vec<OpId>,
    pub(crate) parent: RegionId,
    pub preds: BTreeSet<BlockId>,
    pub succs: BTreeSet<BlockId>,
    pub(crate) idom: Option<BlockId>,
    pub(crate) ipdom: Option<BlockId>,
    pub(crate) dom_front: BTreeSet<BlockId>,
    pub(crate) live_in: BTreeSet<OpId>,
    pub(crate) live_out: BTreeSet<OpId>,
    pub(crate) dead: bool,
}

impl BlockData {
    pub fn ops(&self) -> &[OpId] {
        &self.ops
    }

    pub fn op_count(&self) -> usize {
        self.ops.len()
    }

    pub fn parent(&self) -> RegionId {
        self.parent
    }

    pub fn first_op(&self) -> OpId {
        *self.ops.first().expect("empty block")
    }

    pub fn last_op(&self) -> OpId {
        *self.ops.last().expect("empty block")
    }

    pub fn idom(&self) -> Option<BlockId> {
        self.idom
    }

    pub fn ipdom(&self) -> Option<BlockId> {
        self.ipdom
    }

    pub fn dom_front(&self) -> &BTreeSet<BlockId> {
        &self.dom_front
    }

    pub fn live_in(&self) -> &BTreeSet<OpId> {
        &self.live_in
    }

    pub fn live_out(&self) -> &BTreeSet<OpId> {
        &self.live_out
    }
}

#[derive(Debug)]
pub struct RegionData {
    pub(crate) blocks: Vec<BlockId>,
    pub(crate) parent: OpId,
    pub(crate) dead: bool,
}

impl RegionData {
    pub fn blocks(&self) -> &[BlockId] {
        &self.blocks
    }

    pub fn parent(&self) -> OpId {
        self.parent
    }

    pub fn first_block(&self) -> BlockId {
        *self.blocks.first().expect("empty region")
    }

    pub fn last_block(&self) -> BlockId {
        *self.blocks.last().expect("empty region")
    }
}

/// The module: root op of the nesting and the arena that owns every op,
/// block and region.
#[derive(Debug)]
pub struct Module {
    pub(crate) ops: Vec<OpData>,
    pub(crate) blocks: Vec<BlockData>,
    pub(crate) regions: Vec<RegionData>,
    to_delete: Vec<OpId>,
    free_ops: Vec<OpId>,
    pub(crate) top: OpId,
    pub(crate) printer: std::cell::RefCell<crate::core::display::PrinterState>,
}

impl Default for Module {
    fn default() -> Module {
        Module::new()
    }
}

impl Module {
    pub fn new() -> Module {
        let mut module = Module {
            ops: Vec::new(),
            blocks: Vec::new(),
            regions: Vec::new(),
            to_delete: Vec::new(),
            free_ops: Vec::new(),
            top: OpId(0),
            printer: Default::default(),
        };
        let top = module.new_op(SysOp::Module.into(), Ty::I32, &[], vec![]);
        module.top = top;
        module.create_first_block(top);
        module
    }

    pub fn top(&self) -> OpId {
        self.top
    }

    pub fn op(&self, id: OpId) -> &OpData {
        let data = &self.ops[id.0 as usize];
        debug_assert!(!data.dead, "use of erased op {id:?}");
        data
    }

    pub fn op_mut(&mut self, id: OpId) -> &mut OpData {
        let data = &mut self.ops[id.0 as usize];
        debug_assert!(!data.dead, "use of erased op {id:?}");
        data
    }

    pub fn block(&self, id: BlockId) -> &BlockData {
        let data = &self.blocks[id.0 as usize];
        debug_assert!(!data.dead, "use of erased block {id:?}");
        data
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BlockData {
        let data = &mut self.blocks[id.0 as usize];
        debug_assert!(!data.dead, "use of erased block {id:?}");
        data
    }

    pub fn region(&self, id: RegionId) -> &RegionData {
        let data = &self.regions[id.0 as usize];
        debug_assert!(!data.dead, "use of erased region {id:?}");
        data
    }

    pub fn region_mut(&mut self, id: RegionId) -> &mut RegionData {
        let data = &mut self.regions[id.0 as usize];
        debug_assert!(!data.dead, "use of erased region {id:?}");
        data
    }

    pub fn is_dead(&self, id: OpId) -> bool {
        self.ops[id.0 as usize].dead
    }

    /// Access that tolerates erased-but-unreleased ops. Rewriters holding
    /// ids across erasures (spill bookkeeping, most of all) still need the
    /// kind and attributes; storage stays valid until [`Module::release`].
    pub fn op_raw(&self, id: OpId) -> &OpData {
        &self.ops[id.0 as usize]
    }

    /// Allocates an op, registering it as a use on each operand's producer.
    /// The op is not attached to any block yet; insertion is the builder's
    /// job.
    pub fn new_op(&mut self, kind: OpKind, result_ty: Ty, operands: &[OpId], attrs: Vec<Attr>) -> OpId {
        let id = match self.free_ops.pop() {
            Some(id) => id,
            None => {
                self.ops.push(OpData {
                    kind,
                    result_ty,
                    operands: SmallVec::new(),
                    attrs: SmallVec::new(),
                    regions: SmallVec::new(),
                    uses: BTreeSet::new(),
                    parent: None,
                    dead: true,
                });
                OpId(self.ops.len() as u32 - 1)
            }
        };

        let data = &mut self.ops[id.0 as usize];
        data.kind = kind;
        data.result_ty = result_ty;
        data.operands = SmallVec::from_slice(operands);
        data.attrs = attrs.into_iter().map(Rc::new).collect();
        data.regions = SmallVec::new();
        data.uses = BTreeSet::new();
        data.parent = None;
        data.dead = false;

        for &v in operands {
            self.op_mut(v).uses.insert(id);
        }
        id
    }

    // ---- operand bookkeeping -------------------------------------------

    pub fn push_operand(&mut self, op: OpId, v: OpId) {
        self.op_mut(v).uses.insert(op);
        self.op_mut(op).operands.push(v);
    }

    /// Removes `op` from `def`'s use-set unless another operand still refers
    /// to it.
    fn remove_operand_use(&mut self, op: OpId, def: OpId) {
        let still_used = self.op(op).operands.iter().any(|&x| x == def);
        if !still_used {
            self.op_mut(def).uses.remove(&op);
        }
    }

    pub fn set_operand(&mut self, op: OpId, i: usize, v: OpId) {
        let def = self.op(op).operands[i];
        self.op_mut(op).operands[i] = v;
        self.remove_operand_use(op, def);
        self.op_mut(v).uses.insert(op);
    }

    pub fn remove_operand(&mut self, op: OpId, i: usize) {
        let def = self.op(op).operands[i];
        self.op_mut(op).operands.remove(i);
        self.remove_operand_use(op, def);
    }

    pub fn remove_operand_op(&mut self, op: OpId, v: OpId) {
        let pos = self
            .op(op)
            .operands
            .iter()
            .position(|&x| x == v)
            .expect("operand not found");
        self.remove_operand(op, pos);
    }

    /// Replaces the first operand produced by `before` and returns its index.
    pub fn replace_operand(&mut self, op: OpId, before: OpId, v: OpId) -> usize {
        let pos = self
            .op(op)
            .operands
            .iter()
            .position(|&x| x == before)
            .expect("operand not found");
        self.set_operand(op, pos, v);
        pos
    }

    pub fn remove_all_operands(&mut self, op: OpId) {
        let operands = std::mem::take(&mut self.op_mut(op).operands);
        for def in operands {
            self.ops[def.0 as usize].uses.remove(&op);
        }
    }

    pub fn replace_all_uses_with(&mut self, op: OpId, with: OpId) {
        let uses = std::mem::take(&mut self.op_mut(op).uses);
        for user in uses {
            let operands = &mut self.ops[user.0 as usize].operands;
            for slot in operands.iter_mut() {
                if *slot == op {
                    *slot = with;
                }
            }
            self.op_mut(with).uses.insert(user);
        }
    }

    // ---- attributes ----------------------------------------------------

    pub fn add_attr(&mut self, op: OpId, attr: Attr) {
        self.op_mut(op).attrs.push(Rc::new(attr));
    }

    pub fn set_attr(&mut self, op: OpId, i: usize, attr: Attr) {
        self.op_mut(op).attrs[i] = Rc::new(attr);
    }

    /// Removes the first attribute of `kind`, if any.
    pub fn remove_attr(&mut self, op: OpId, kind: AttrKind) {
        let attrs = &mut self.op_mut(op).attrs;
        if let Some(pos) = attrs.iter().position(|a| a.kind() == kind) {
            attrs.remove(pos);
        }
    }

    pub fn remove_attr_at(&mut self, op: OpId, i: usize) {
        self.op_mut(op).attrs.remove(i);
    }

    pub fn remove_all_attrs(&mut self, op: OpId) {
        self.op_mut(op).attrs.clear();
    }

    /// Clone-on-write access to an attribute payload in place.
    pub fn attr_mut(&mut self, op: OpId, kind: AttrKind) -> &mut Attr {
        let attrs = &mut self.op_mut(op).attrs;
        let pos = attrs
            .iter()
            .position(|a| a.kind() == kind)
            .unwrap_or_else(|| panic!("no {kind:?} attribute"));
        Rc::make_mut(&mut attrs[pos])
    }

    /// Replaces the first attribute of the same kind, or appends.
    pub fn put_attr(&mut self, op: OpId, attr: Attr) {
        let attrs = &mut self.op_mut(op).attrs;
        match attrs.iter().position(|a| a.kind() == attr.kind()) {
            Some(pos) => attrs[pos] = Rc::new(attr),
            None => attrs.push(Rc::new(attr)),
        }
    }

    // ---- regions and blocks --------------------------------------------

    pub fn append_region(&mut self, op: OpId) -> RegionId {
        self.regions.push(RegionData { blocks: Vec::new(), parent: op, dead: false });
        let id = RegionId(self.regions.len() as u32 - 1);
        self.op_mut(op).regions.push(id);
        id
    }

    /// Appends a region with one empty block; returns the block.
    pub fn create_first_block(&mut self, op: OpId) -> BlockId {
        let region = self.append_region(op);
        self.append_block(region)
    }

    pub fn append_block(&mut self, region: RegionId) -> BlockId {
        self.blocks.push(BlockData {
            ops: Vec::new(),
            parent: region,
            preds: BTreeSet::new(),
            succs: BTreeSet::new(),
            idom: None,
            ipdom: None,
            dom_front: BTreeSet::new(),
            live_in: BTreeSet::new(),
            live_out: BTreeSet::new(),
            dead: false,
        });
        let id = BlockId(self.blocks.len() as u32 - 1);
        self.region_mut(region).blocks.push(id);
        id
    }

    /// Creates an empty block right before `at` in its region.
    pub fn insert_block_before(&mut self, at: BlockId) -> BlockId {
        let region = self.block(at).parent;
        let new = self.append_block(region);
        let blocks = &mut self.region_mut(region).blocks;
        blocks.pop();
        let pos = blocks.iter().position(|&b| b == at).expect("block not in region");
        blocks.insert(pos, new);
        new
    }

    pub fn insert_block_after(&mut self, at: BlockId) -> BlockId {
        let region = self.block(at).parent;
        let new = self.append_block(region);
        let blocks = &mut self.region_mut(region).blocks;
        blocks.pop();
        let pos = blocks.iter().position(|&b| b == at).expect("block not in region");
        blocks.insert(pos + 1, new);
        new
    }

    pub fn next_block(&self, bb: BlockId) -> Option<BlockId> {
        let blocks = &self.region(self.block(bb).parent).blocks;
        let pos = blocks.iter().position(|&b| b == bb).expect("block not in region");
        blocks.get(pos + 1).copied()
    }

    // ---- placement and movement ----------------------------------------

    pub(crate) fn op_pos(&self, op: OpId) -> (BlockId, usize) {
        let bb = self.op(op).parent.expect("op not attached to a block");
        let pos = self
            .block(bb)
            .ops
            .iter()
            .position(|&x| x == op)
            .expect("op not found in its parent block");
        (bb, pos)
    }

    pub fn insert_op_at(&mut self, bb: BlockId, at: usize, op: OpId) {
        debug_assert!(self.op(op).parent.is_none(), "op already placed");
        self.block_mut(bb).ops.insert(at, op);
        self.op_mut(op).parent = Some(bb);
    }

    fn detach_op(&mut self, op: OpId) {
        if let Some(bb) = self.op(op).parent {
            let pos = self
                .block(bb)
                .ops
                .iter()
                .position(|&x| x == op)
                .expect("op not in its parent block");
            self.block_mut(bb).ops.remove(pos);
            self.op_mut(op).parent = None;
        }
    }

    pub fn move_op_before(&mut self, op: OpId, before: OpId) {
        if op == before {
            return;
        }
        self.detach_op(op);
        let (bb, pos) = self.op_pos(before);
        self.insert_op_at(bb, pos, op);
    }

    pub fn move_op_after(&mut self, op: OpId, after: OpId) {
        if op == after {
            return;
        }
        self.detach_op(op);
        let (bb, pos) = self.op_pos(after);
        self.insert_op_at(bb, pos + 1, op);
    }

    pub fn move_op_to_end(&mut self, op: OpId, bb: BlockId) {
        self.detach_op(op);
        let at = self.block(bb).ops.len();
        self.insert_op_at(bb, at, op);
    }

    pub fn move_op_to_start(&mut self, op: OpId, bb: BlockId) {
        self.detach_op(op);
        self.insert_op_at(bb, 0, op);
    }

    pub fn prev_op(&self, op: OpId) -> Option<OpId> {
        let (bb, pos) = self.op_pos(op);
        if pos == 0 {
            None
        } else {
            Some(self.block(bb).ops[pos - 1])
        }
    }

    pub fn next_op(&self, op: OpId) -> Option<OpId> {
        let (bb, pos) = self.op_pos(op);
        self.block(bb).ops.get(pos + 1).copied()
    }

    pub fn at_front(&self, op: OpId) -> bool {
        let (_, pos) = self.op_pos(op);
        pos == 0
    }

    pub fn at_back(&self, op: OpId) -> bool {
        let (bb, pos) = self.op_pos(op);
        pos + 1 == self.block(bb).ops.len()
    }

    /// Moves every op of `src` to the end of `dest`, without touching
    /// terminators.
    pub fn inline_to_end(&mut self, src: BlockId, dest: BlockId) {
        for op in std::mem::take(&mut self.block_mut(src).ops) {
            self.op_mut(op).parent = None;
            self.move_op_to_end(op, dest);
        }
    }

    /// Moves every op of `src` right before `before`.
    pub fn inline_before(&mut self, src: BlockId, before: OpId) {
        for op in std::mem::take(&mut self.block_mut(src).ops) {
            self.op_mut(op).parent = None;
            self.move_op_before(op, before);
        }
    }

    /// Moves every op from `op` (inclusive) to the block end into `dest`.
    pub fn split_ops_after(&mut self, dest: BlockId, op: OpId) {
        let (bb, pos) = self.op_pos(op);
        let tail: Vec<OpId> = self.block(bb).ops[pos..].to_vec();
        for x in tail {
            self.move_op_to_end(x, dest);
        }
    }

    /// Moves every op before `op` (exclusive) into `dest`.
    pub fn split_ops_before(&mut self, dest: BlockId, op: OpId) {
        let (bb, pos) = self.op_pos(op);
        let head: Vec<OpId> = self.block(bb).ops[..pos].to_vec();
        for x in head {
            self.move_op_to_end(x, dest);
        }
    }

    fn detach_block(&mut self, bb: BlockId) {
        let region = self.block(bb).parent;
        let blocks = &mut self.region_mut(region).blocks;
        let pos = blocks.iter().position(|&b| b == bb).expect("block not in region");
        blocks.remove(pos);
    }

    pub fn move_block_before(&mut self, bb: BlockId, before: BlockId) {
        self.detach_block(bb);
        let region = self.block(before).parent;
        let blocks = &mut self.region_mut(region).blocks;
        let pos = blocks.iter().position(|&b| b == before).expect("block not in region");
        blocks.insert(pos, bb);
        self.block_mut(bb).parent = region;
    }

    pub fn move_block_after(&mut self, bb: BlockId, after: BlockId) {
        self.detach_block(bb);
        let region = self.block(after).parent;
        let blocks = &mut self.region_mut(region).blocks;
        let pos = blocks.iter().position(|&b| b == after).expect("block not in region");
        blocks.insert(pos + 1, bb);
        self.block_mut(bb).parent = region;
    }

    pub fn move_block_to_end(&mut self, bb: BlockId, region: RegionId) {
        self.detach_block(bb);
        self.region_mut(region).blocks.push(bb);
        self.block_mut(bb).parent = region;
    }

    /// Splices all blocks of `region` after `at`. Returns the first and last
    /// moved block; the region is empty afterwards.
    pub fn region_move_to(&mut self, region: RegionId, at: BlockId) -> (BlockId, BlockId) {
        let blocks = self.region(region).blocks.clone();
        let result = (*blocks.first().expect("empty region"), *blocks.last().unwrap());
        let mut prev = at;
        for bb in blocks {
            self.move_block_after(bb, prev);
            prev = bb;
        }
        result
    }

    // ---- erasure -------------------------------------------------------

    /// Detaches and queues the op for deletion. Erasing an op that still has
    /// uses is a compiler bug.
    pub fn erase_op(&mut self, op: OpId) {
        self.detach_op(op);
        self.remove_all_operands(op);

        for region in self.op(op).regions.to_vec() {
            self.erase_region_inner(region, op);
        }

        if !self.op(op).uses.is_empty() {
            let uses = self
                .op(op)
                .uses
                .iter()
                .map(|&u| format!("  {}", self.display_op(u)))
                .collect::<Vec<_>>()
                .join("\n");
            panic!("removing op in use:\n  {}\nuses:\n{uses}", self.display_op(op));
        }

        self.op_mut(op).dead = true;
        self.to_delete.push(op);
    }

    /// Replaces `op` by rewiring all uses to `with`, then erasing it.
    pub fn replace_op_with(&mut self, op: OpId, with: OpId) {
        self.replace_all_uses_with(op, with);
        self.erase_op(op);
    }

    pub fn remove_region(&mut self, op: OpId, region: RegionId) {
        let regions = &mut self.op_mut(op).regions;
        if let Some(pos) = regions.iter().position(|&r| r == region) {
            regions.remove(pos);
        }
    }

    /// Erases a whole region with its blocks and ops, dropping internal
    /// operand edges first so teardown order doesn't trip the in-use check.
    pub fn erase_region(&mut self, region: RegionId) {
        let parent = self.region(region).parent;
        self.erase_region_inner(region, parent);
    }

    fn erase_region_inner(&mut self, region: RegionId, parent: OpId) {
        let blocks = self.region(region).blocks.clone();
        for &bb in &blocks {
            for op in self.block(bb).ops.clone() {
                self.remove_all_operands(op);
                for sub in self.op(op).regions.to_vec() {
                    self.erase_region_inner(sub, op);
                }
            }
        }
        for bb in blocks {
            self.force_erase_block(bb);
        }
        self.remove_region(parent, region);
        self.regions[region.0 as usize].dead = true;
    }

    /// Erasing a block that still has predecessors is a compiler bug.
    pub fn erase_block(&mut self, bb: BlockId) {
        if !self.block(bb).preds.is_empty() {
            panic!(
                "erasing block bb{} with live preds {:?}",
                self.block_number(bb),
                self.block(bb).preds.iter().map(|&p| self.block_number(p)).collect::<Vec<_>>()
            );
        }
        self.force_erase_block(bb);
    }

    /// Does not check predecessors. Used when many blocks die at once.
    pub fn force_erase_block(&mut self, bb: BlockId) {
        let ops = self.block(bb).ops.clone();
        for op in &ops {
            self.remove_all_operands(*op);
        }
        for op in ops {
            if !self.is_dead(op) {
                self.erase_op(op);
            }
        }
        self.detach_block(bb);
        self.blocks[bb.0 as usize].dead = true;
    }

    /// Frees storage of everything erased since the previous call. Runs at
    /// pass boundaries only, so rewriters never observe a recycled id
    /// mid-pass.
    pub fn release(&mut self) {
        for op in std::mem::take(&mut self.to_delete) {
            let data = &mut self.ops[op.0 as usize];
            data.attrs.clear();
            data.operands.clear();
            data.uses.clear();
            data.regions.clear();
            self.free_ops.push(op);
        }
    }

    // ---- navigation ----------------------------------------------------

    /// The op owning the block this op sits in.
    pub fn parent_op(&self, op: OpId) -> OpId {
        let bb = self.op(op).parent.expect("detached op has no parent op");
        self.region(self.block(bb).parent).parent
    }

    /// Whether `op` is (transitively) nested inside `ancestor`.
    pub fn inside(&self, op: OpId, ancestor: OpId) -> bool {
        let mut runner = op;
        loop {
            if runner == ancestor {
                return true;
            }
            if self.op(runner).kind == SysOp::Module {
                return false;
            }
            runner = self.parent_op(runner);
        }
    }

    /// The leading run of phis of a block.
    pub fn phis(&self, bb: BlockId) -> Vec<OpId> {
        let mut phis = Vec::new();
        for &op in &self.block(bb).ops {
            if self.op(op).kind != SysOp::Phi {
                break;
            }
            phis.push(op);
        }
        phis
    }

    /// The phi operand flowing in from `bb`.
    pub fn phi_from(&self, phi: OpId, bb: BlockId) -> OpId {
        let data = self.op(phi);
        for i in 0..data.operand_count() {
            if data.from_at(i) == bb {
                return data.operand(i);
            }
        }
        panic!("phi {} has no operand from bb{}", self.display_op(phi), self.block_number(bb));
    }

    /// The block the phi operand `value` flows in from.
    pub fn phi_source_block(&self, phi: OpId, value: OpId) -> BlockId {
        let data = self.op(phi);
        for i in 0..data.operand_count() {
            if data.operand(i) == value {
                return data.from_at(i);
            }
        }
        panic!("{} is not an operand of phi {}", self.display_op(value), self.display_op(phi));
    }

    // ---- module-level collections --------------------------------------

    pub fn top_block(&self) -> BlockId {
        self.region(self.op(self.top).region(0)).first_block()
    }

    pub fn func_region(&self, func: OpId) -> RegionId {
        self.op(func).region(0)
    }

    pub fn funcs(&self) -> Vec<OpId> {
        self.block(self.top_block())
            .ops
            .iter()
            .copied()
            .filter(|&op| self.op(op).kind == SysOp::Func)
            .collect()
    }

    pub fn globals(&self) -> Vec<OpId> {
        self.block(self.top_block())
            .ops
            .iter()
            .copied()
            .filter(|&op| self.op(op).kind == SysOp::Global)
            .collect()
    }

    pub fn function_map(&self) -> std::collections::BTreeMap<String, OpId> {
        self.funcs().into_iter().map(|f| (self.op(f).name().to_string(), f)).collect()
    }

    pub fn global_map(&self) -> std::collections::BTreeMap<String, OpId> {
        self.globals().into_iter().map(|g| (self.op(g).name().to_string(), g)).collect()
    }

    /// All ops of `kind` nested anywhere inside `root`, including `root`.
    pub fn find_all(&self, root: OpId, kind: impl Into<OpKind>) -> Vec<OpId> {
        let kind = kind.into();
        let mut result = Vec::new();
        self.find_all_into(root, kind, &mut result);
        result
    }

    fn find_all_into(&self, root: OpId, kind: OpKind, out: &mut Vec<OpId>) {
        if self.op(root).kind == kind {
            out.push(root);
        }
        for &region in self.op(root).regions.iter() {
            for &bb in &self.region(region).blocks {
                for &op in &self.block(bb).ops {
                    self.find_all_into(op, kind, out);
                }
            }
        }
    }

    /// First op of the region that isn't an alloca; falls over to the next
    /// block when the entry holds only allocas.
    pub fn nonalloca(&self, region: RegionId) -> OpId {
        let entry = self.region(region).first_block();
        for &op in &self.block(entry).ops {
            if self.op(op).kind != SysOp::Alloca {
                return op;
            }
        }
        let next = self.next_block(entry).expect("region is all allocas");
        self.block(next).first_op()
    }

    /// First op of the block that isn't a phi. Blocks always carry a
    /// terminator, so this exists.
    pub fn nonphi(&self, bb: BlockId) -> OpId {
        for &op in &self.block(bb).ops {
            if self.op(op).kind != SysOp::Phi {
                return op;
            }
        }
        unreachable!("block without a terminator")
    }
}
