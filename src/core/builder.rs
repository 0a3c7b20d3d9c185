//! Structured construction of IR.
//!
//! The builder keeps a (block, index) cursor into the module and inserts
//! newly created ops there, advancing past them. `scoped` brackets nested
//! construction: the cursor is restored when the closure returns, which is
//! how region bodies are filled without losing the outer insertion point.

use crate::core::attributes::Attr;
use crate::core::ir::{BlockId, Module, OpId, OpKind, RegionId, Ty};

#[derive(Clone, Copy, Debug)]
pub struct Cursor {
    pub bb: BlockId,
    pub at: usize,
}

#[derive(Debug)]
pub struct Builder<'m> {
    pub module: &'m mut Module,
    cursor: Option<Cursor>,
}

impl<'m> Builder<'m> {
    pub fn new(module: &'m mut Module) -> Builder<'m> {
        Builder { module, cursor: None }
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor.expect("builder cursor not set")
    }

    pub fn restore(&mut self, cursor: Cursor) {
        self.cursor = Some(cursor);
    }

    /// Runs `f` and restores the insertion point afterwards.
    pub fn scoped<R>(&mut self, f: impl FnOnce(&mut Builder) -> R) -> R {
        let saved = self.cursor;
        let result = f(self);
        self.cursor = saved;
        result
    }

    pub fn set_to_block_start(&mut self, bb: BlockId) {
        self.cursor = Some(Cursor { bb, at: 0 });
    }

    pub fn set_to_block_end(&mut self, bb: BlockId) {
        let at = self.module.block(bb).op_count();
        self.cursor = Some(Cursor { bb, at });
    }

    pub fn set_to_region_start(&mut self, region: RegionId) {
        let bb = self.module.region(region).first_block();
        self.set_to_block_start(bb);
    }

    pub fn set_to_region_end(&mut self, region: RegionId) {
        let bb = self.module.region(region).first_block();
        self.set_to_block_end(bb);
    }

    pub fn set_before_op(&mut self, op: OpId) {
        let (bb, at) = self.module.op_pos(op);
        self.cursor = Some(Cursor { bb, at });
    }

    pub fn set_after_op(&mut self, op: OpId) {
        let (bb, at) = self.module.op_pos(op);
        self.cursor = Some(Cursor { bb, at: at + 1 });
    }

    fn insert(&mut self, op: OpId) {
        let Cursor { bb, at } = self.cursor();
        self.module.insert_op_at(bb, at, op);
        self.cursor = Some(Cursor { bb, at: at + 1 });
    }

    /// Creates an op with the opcode's default result type at the cursor.
    pub fn create(&mut self, kind: impl Into<OpKind>, operands: &[OpId], attrs: Vec<Attr>) -> OpId {
        let kind = kind.into();
        self.create_ty(default_ty(kind), kind, operands, attrs)
    }

    /// Creates an op with an explicit result type at the cursor.
    pub fn create_ty(
        &mut self,
        ty: Ty,
        kind: impl Into<OpKind>,
        operands: &[OpId],
        attrs: Vec<Attr>,
    ) -> OpId {
        let op = self.module.new_op(kind.into(), ty, operands, attrs);
        self.insert(op);
        op
    }

    /// Creates the replacement at `old`'s position, rewires every use of
    /// `old` to it and erases `old`.
    pub fn replace(
        &mut self,
        old: OpId,
        kind: impl Into<OpKind>,
        operands: &[OpId],
        attrs: Vec<Attr>,
    ) -> OpId {
        let kind = kind.into();
        self.replace_ty(old, default_ty(kind), kind, operands, attrs)
    }

    pub fn replace_ty(
        &mut self,
        old: OpId,
        ty: Ty,
        kind: impl Into<OpKind>,
        operands: &[OpId],
        attrs: Vec<Attr>,
    ) -> OpId {
        self.set_before_op(old);
        let new = self.create_ty(ty, kind, operands, attrs);
        self.module.replace_op_with(old, new);
        new
    }

    /// Inserts a copy of `op` at the cursor: same kind and type, shallow
    /// operand copy, attributes shared copy-on-write.
    pub fn copy(&mut self, op: OpId) -> OpId {
        let data = self.module.op(op);
        let kind = data.kind();
        let ty = data.result_ty();
        let operands: Vec<OpId> = data.operands().to_vec();
        let attrs = data.attrs().to_vec();
        let new = self.module.new_op(kind, ty, &operands, vec![]);
        self.module.op_mut(new).attrs = attrs.into();
        self.insert(new);
        new
    }
}

fn default_ty(kind: OpKind) -> Ty {
    match kind {
        OpKind::Sys(op) => op.default_ty(),
        OpKind::Arm(op) => op.default_ty(),
        OpKind::Rv(op) => op.default_ty(),
    }
}
