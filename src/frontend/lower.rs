//! Lowering from the AST into the `sys` dialect.
//!
//! Control flow stays structured: `if` becomes an `If` op with one or two
//! single-block regions, `while` becomes a `While` whose first region
//! computes the condition and terminates with `Proceed`, imitating the
//! design of `scf.while`. Short-circuit `&&`/`||` route through an alloca
//! written in both arms. Local arrays get one alloca for the payload plus an
//! i64 alloca holding its address, so array references and pointer
//! arguments read bases uniformly through a load.

use rustc_hash::FxHashMap;

use crate::core::{Attr, Cursor, Module, OpId, Ty};
use crate::frontend::ast::{Ast, BinaryKind, ConstArray, Type, UnaryKind};
use crate::dialects::sys::SysOp;

pub struct CodeGen {
    pub module: Module,
    cursor: Cursor,
    scopes: Vec<FxHashMap<String, OpId>>,
    globals: FxHashMap<String, OpId>,
}

impl CodeGen {
    /// Lowers a whole translation unit (a block of declarations).
    pub fn lower(ast: &Ast) -> Module {
        let mut module = Module::new();
        let top = module.top_block();
        let mut cg = CodeGen {
            module,
            cursor: Cursor { bb: top, at: 0 },
            scopes: vec![FxHashMap::default()],
            globals: FxHashMap::default(),
        };
        cg.emit(ast);
        cg.module
    }

    fn create(&mut self, kind: SysOp, operands: &[OpId], attrs: Vec<Attr>) -> OpId {
        self.create_ty(kind.default_ty(), kind, operands, attrs)
    }

    fn create_ty(&mut self, ty: Ty, kind: SysOp, operands: &[OpId], attrs: Vec<Attr>) -> OpId {
        let op = self.module.new_op(kind.into(), ty, operands, attrs);
        self.module.insert_op_at(self.cursor.bb, self.cursor.at, op);
        self.cursor.at += 1;
        op
    }

    fn lookup(&self, name: &str) -> Option<OpId> {
        for scope in self.scopes.iter().rev() {
            if let Some(&v) = scope.get(name) {
                return Some(v);
            }
        }
        None
    }

    fn define(&mut self, name: &str, addr: OpId) {
        self.scopes.last_mut().unwrap().insert(name.to_string(), addr);
    }

    fn scoped(&mut self, f: impl FnOnce(&mut CodeGen)) {
        self.scopes.push(FxHashMap::default());
        f(self);
        self.scopes.pop();
    }

    /// Runs `f` with the cursor at the start of `bb`, restoring it after.
    fn in_block(&mut self, bb: crate::core::BlockId, f: impl FnOnce(&mut CodeGen)) {
        let saved = self.cursor;
        self.cursor = Cursor { bb, at: 0 };
        f(self);
        self.cursor = saved;
    }

    fn emit_expr(&mut self, node: &Ast) -> OpId {
        match node {
            Ast::Int(v) => self.create(SysOp::Int, &[], vec![Attr::Int(*v)]),
            Ast::Float(v) => self.create(SysOp::Float, &[], vec![Attr::Float(*v)]),
            Ast::Binary { kind, ty, l, r } => self.emit_binary(*kind, ty, l, r),
            Ast::Unary { kind, ty, node } => self.emit_unary(*kind, ty, node),
            Ast::VarRef { name, ty } => self.emit_var_ref(name, ty),
            Ast::Call { func, ty, args } => {
                let mut operands = Vec::with_capacity(args.len());
                for arg in args {
                    operands.push(self.emit_expr(arg));
                }
                // The timing intrinsics are thin aliases in the runtime.
                let name = match func.as_str() {
                    "starttime" => "_sysy_starttime",
                    "stoptime" => "_sysy_stoptime",
                    other => other,
                };
                let result = if ty.is_float() { Ty::F32 } else { Ty::I32 };
                self.create_ty(result, SysOp::Call, &operands, vec![
                    Attr::Name(name.to_string()),
                    Attr::ArgCount(operands.len()),
                ])
            }
            Ast::ArrayAccess { array, arr_ty, indices, .. } => {
                let addr = self.emit_subscript(array, arr_ty, indices);
                let Type::Array { base, dims } = arr_ty else {
                    panic!("array access into non-array {arr_ty:?}");
                };
                // A partial index chain is an address, not a value, e.g. a
                // sub-array passed as a call argument.
                if dims.len() > indices.len() {
                    return addr;
                }
                let result = if base.is_float() { Ty::F32 } else { Ty::I32 };
                self.create_ty(result, SysOp::Load, &[addr], vec![Attr::Size(base.size())])
            }
            other => panic!("cannot lower expression {other:?}"),
        }
    }

    fn emit_binary(&mut self, kind: BinaryKind, _ty: &Type, l: &Ast, r: &Ast) -> OpId {
        // Short-circuit forms write an alloca in both arms and reload it.
        if kind == BinaryKind::And {
            let alloca = self.create(SysOp::Alloca, &[], vec![Attr::Size(4)]);
            let cond = self.emit_expr(l);
            let branch = self.create(SysOp::If, &[cond], vec![]);
            let ifso = self.module.create_first_block(branch);
            self.in_block(ifso, |cg| {
                let r = cg.emit_expr(r);
                let snz = cg.create(SysOp::SetNotZero, &[r], vec![]);
                cg.create(SysOp::Store, &[snz, alloca], vec![Attr::Size(4)]);
            });
            let ifnot_region = self.module.append_region(branch);
            let ifnot = self.module.append_block(ifnot_region);
            self.in_block(ifnot, |cg| {
                let zero = cg.create(SysOp::Int, &[], vec![Attr::Int(0)]);
                cg.create(SysOp::Store, &[zero, alloca], vec![Attr::Size(4)]);
            });
            return self.create_ty(Ty::I32, SysOp::Load, &[alloca], vec![Attr::Size(4)]);
        }

        if kind == BinaryKind::Or {
            let alloca = self.create(SysOp::Alloca, &[], vec![Attr::Size(4)]);
            let cond = self.emit_expr(l);
            let branch = self.create(SysOp::If, &[cond], vec![]);
            let ifso = self.module.create_first_block(branch);
            self.in_block(ifso, |cg| {
                let one = cg.create(SysOp::Int, &[], vec![Attr::Int(1)]);
                cg.create(SysOp::Store, &[one, alloca], vec![Attr::Size(4)]);
            });
            let ifnot_region = self.module.append_region(branch);
            let ifnot = self.module.append_block(ifnot_region);
            self.in_block(ifnot, |cg| {
                let r = cg.emit_expr(r);
                let snz = cg.create(SysOp::SetNotZero, &[r], vec![]);
                cg.create(SysOp::Store, &[snz, alloca], vec![Attr::Size(4)]);
            });
            return self.create_ty(Ty::I32, SysOp::Load, &[alloca], vec![Attr::Size(4)]);
        }

        let lv = self.emit_expr(l);
        let rv = self.emit_expr(r);
        let float = l.ty().is_float() || r.ty().is_float();
        let op = if !float {
            match kind {
                BinaryKind::Add => SysOp::AddI,
                BinaryKind::Sub => SysOp::SubI,
                BinaryKind::Mul => SysOp::MulI,
                BinaryKind::Div => SysOp::DivI,
                BinaryKind::Mod => SysOp::ModI,
                BinaryKind::Eq => SysOp::Eq,
                BinaryKind::Ne => SysOp::Ne,
                BinaryKind::Lt => SysOp::Lt,
                BinaryKind::Le => SysOp::Le,
                _ => panic!("unsupported int binary {kind:?}"),
            }
        } else {
            match kind {
                BinaryKind::Add => SysOp::AddF,
                BinaryKind::Sub => SysOp::SubF,
                BinaryKind::Mul => SysOp::MulF,
                BinaryKind::Div => SysOp::DivF,
                BinaryKind::Mod => SysOp::ModF,
                BinaryKind::Eq => SysOp::EqF,
                BinaryKind::Ne => SysOp::NeF,
                BinaryKind::Lt => SysOp::LtF,
                BinaryKind::Le => SysOp::LeF,
                _ => panic!("unsupported float binary {kind:?}"),
            }
        };
        self.create(op, &[lv, rv], vec![])
    }

    fn emit_unary(&mut self, kind: UnaryKind, ty: &Type, node: &Ast) -> OpId {
        let value = self.emit_expr(node);
        match kind {
            UnaryKind::Float2Int => self.create(SysOp::F2I, &[value], vec![]),
            UnaryKind::Int2Float => self.create(SysOp::I2F, &[value], vec![]),
            UnaryKind::Not => self.create(SysOp::Not, &[value], vec![]),
            UnaryKind::Minus => {
                if ty.is_float() {
                    self.create(SysOp::MinusF, &[value], vec![])
                } else {
                    self.create(SysOp::Minus, &[value], vec![])
                }
            }
        }
    }

    fn emit_var_ref(&mut self, name: &str, ty: &Type) -> OpId {
        let result = if ty.is_float() { Ty::F32 } else { Ty::I32 };

        if let Some(from) = self.lookup(name) {
            return self.create_ty(result, SysOp::Load, &[from], vec![Attr::Size(ty.size())]);
        }
        if self.globals.contains_key(name) {
            let addr = self.create(SysOp::GetGlobal, &[], vec![Attr::Name(name.to_string())]);
            // No extra indirection for global arrays.
            if ty.is_array_like() {
                return addr;
            }
            return self.create_ty(result, SysOp::Load, &[addr], vec![Attr::Size(ty.size())]);
        }
        panic!("cannot find symbol {name}");
    }

    /// Base address plus the index chain scaled by per-dimension strides.
    fn emit_subscript(&mut self, array: &str, arr_ty: &Type, indices: &[Ast]) -> OpId {
        let Type::Array { base, dims } = arr_ty else {
            panic!("subscript into non-array {arr_ty:?}");
        };
        let mut sizes = Vec::with_capacity(indices.len());
        let mut size = (base.size() as i32) * arr_ty.elems();
        for i in 0..indices.len() {
            size /= dims[i];
            sizes.push(size);
        }

        let mut addr = if let Some(ptr) = self.lookup(array) {
            self.create_ty(Ty::I64, SysOp::Load, &[ptr], vec![Attr::Size(8)])
        } else if self.globals.contains_key(array) {
            self.create(SysOp::GetGlobal, &[], vec![Attr::Name(array.to_string())])
        } else {
            panic!("unknown array: {array}");
        };

        for (i, index) in indices.iter().enumerate() {
            let iv = self.emit_expr(index);
            let stride = self.create(SysOp::Int, &[], vec![Attr::Int(sizes[i])]);
            let scaled = self.create(SysOp::MulI, &[iv, stride], vec![]);
            addr = self.create(SysOp::AddL, &[addr, scaled], vec![]);
        }
        addr
    }

    fn emit(&mut self, node: &Ast) {
        match node {
            Ast::Empty => {}
            Ast::Block(nodes) => {
                self.scopes.push(FxHashMap::default());
                for x in nodes {
                    self.emit(x);
                }
                self.scopes.pop();
            }
            Ast::TransparentBlock(nodes) => {
                for x in nodes {
                    self.emit(x);
                }
            }
            Ast::FnDecl { name, ty, args, body } => self.emit_fn(name, ty, args, body),
            Ast::VarDecl { name, ty, init, global } => {
                if *global {
                    self.emit_global(name, ty, init.as_deref());
                } else {
                    self.emit_local(name, ty, init.as_deref());
                }
            }
            Ast::Return(value) => {
                match value {
                    None => self.create(SysOp::Return, &[], vec![]),
                    Some(v) => {
                        let value = self.emit_expr(v);
                        self.create(SysOp::Return, &[value], vec![])
                    }
                };
            }
            Ast::If { cond, ifso, ifnot } => {
                let cond = self.emit_expr(cond);
                let op = self.create(SysOp::If, &[cond], vec![]);
                let then_block = self.module.create_first_block(op);
                self.in_block(then_block, |cg| cg.emit(ifso));
                if let Some(ifnot) = ifnot {
                    let else_region = self.module.append_region(op);
                    let else_block = self.module.append_block(else_region);
                    self.in_block(else_block, |cg| cg.emit(ifnot));
                }
            }
            Ast::While { cond, body } => {
                let op = self.create(SysOp::While, &[], vec![]);
                let cond_block = self.module.create_first_block(op);
                self.in_block(cond_block, |cg| {
                    let cond = cg.emit_expr(cond);
                    cg.create(SysOp::Proceed, &[cond], vec![]);
                });
                let body_region = self.module.append_region(op);
                let body_block = self.module.append_block(body_region);
                self.in_block(body_block, |cg| cg.emit(body));
            }
            Ast::Break => {
                self.create(SysOp::Break, &[], vec![]);
            }
            Ast::Continue => {
                self.create(SysOp::Continue, &[], vec![]);
            }
            Ast::Assign { name, ty, value } => {
                let addr = if let Some(addr) = self.lookup(name) {
                    addr
                } else if self.globals.contains_key(name) {
                    self.create(SysOp::GetGlobal, &[], vec![Attr::Name(name.to_string())])
                } else {
                    panic!("assign to unknown name: {name}");
                };
                let value = self.emit_expr(value);
                self.create(SysOp::Store, &[value, addr], vec![Attr::Size(ty.size())]);
            }
            Ast::ArrayAssign { array, arr_ty, indices, value } => {
                let value = self.emit_expr(value);
                let addr = self.emit_subscript(array, arr_ty, indices);
                let Type::Array { base, .. } = arr_ty else { unreachable!() };
                self.create(SysOp::Store, &[value, addr], vec![Attr::Size(base.size())]);
            }
            Ast::Call { .. } => {
                self.emit_expr(node);
            }
            other => panic!("cannot lower statement {other:?}"),
        }
    }

    fn emit_fn(&mut self, name: &str, ty: &Type, args: &[String], body: &[Ast]) {
        let Type::Function { params, .. } = ty else {
            panic!("function declared with non-function type {ty:?}");
        };
        let func = self.create(SysOp::Func, &[], vec![
            Attr::Name(name.to_string()),
            Attr::ArgCount(params.len()),
        ]);
        let bb = self.module.create_first_block(func);

        let saved = self.cursor;
        self.cursor = Cursor { bb, at: 0 };
        self.scopes.push(FxHashMap::default());

        // Arguments land in allocas so the body sees ordinary memory; any
        // pointer argument makes the function observable from outside.
        for (i, arg_name) in args.iter().enumerate() {
            let arg_ty = &params[i];
            let size = arg_ty.size();
            let result = if arg_ty.is_float() { Ty::F32 } else { Ty::I32 };
            let arg = self.create_ty(result, SysOp::GetArg, &[], vec![Attr::Int(i as i32)]);
            if arg_ty.is_array_like() && !self.module.op(func).has_attr(crate::core::AttrKind::Impure)
            {
                self.module.add_attr(func, Attr::Impure);
            }
            let addr = self.create(SysOp::Alloca, &[], vec![Attr::Size(size)]);
            self.create(SysOp::Store, &[arg, addr], vec![Attr::Size(size)]);
            if arg_ty.is_float() {
                self.module.add_attr(addr, Attr::Fp);
            }
            self.define(arg_name, addr);
        }

        for x in body {
            self.emit(x);
        }

        self.scopes.pop();
        self.cursor = saved;
    }

    fn emit_global(&mut self, name: &str, ty: &Type, init: Option<&Ast>) {
        // Scalar globals are one-element arrays; zero-filled payloads are
        // detected at dump time and go to .bss.
        let (payload, dims) = match (ty, init) {
            (_, Some(Ast::Int(v))) => (ConstArray::Int(vec![*v]), vec![1]),
            (_, Some(Ast::Float(v))) => (ConstArray::Float(vec![*v]), vec![1]),
            (Type::Array { base, dims }, init) => {
                let elems = ty.elems() as usize;
                let payload = match init {
                    Some(Ast::ConstArray(arr)) => arr.clone(),
                    None if base.is_float() => ConstArray::Float(vec![0.0; elems]),
                    None => ConstArray::Int(vec![0; elems]),
                    other => panic!("bad global initializer {other:?}"),
                };
                (payload, dims.clone())
            }
            (_, None) if ty.is_float() => (ConstArray::Float(vec![0.0]), vec![1]),
            (_, None) => (ConstArray::Int(vec![0]), vec![1]),
            (ty, init) => panic!("bad global declaration {ty:?} = {init:?}"),
        };

        let mut attrs = vec![Attr::Size(ty.size()), Attr::Name(name.to_string())];
        let float = matches!(payload, ConstArray::Float(_));
        match payload {
            ConstArray::Int(vs) => attrs.push(Attr::IntArray(vs)),
            ConstArray::Float(vs) => attrs.push(Attr::FloatArray(vs)),
        }
        attrs.push(Attr::Dims(dims));

        let addr = self.create(SysOp::Global, &[], attrs);
        if float {
            self.module.add_attr(addr, Attr::Fp);
        }
        self.globals.insert(name.to_string(), addr);
    }

    fn emit_local(&mut self, name: &str, ty: &Type, init: Option<&Ast>) {
        let addr = self.create(SysOp::Alloca, &[], vec![Attr::Size(ty.size())]);
        if ty.is_float() {
            self.module.add_attr(addr, Attr::Fp);
        }
        self.define(name, addr);

        if let Type::Array { base, dims } = ty {
            let base_size = base.size();
            let elems = ty.elems() as usize;

            if let Some(Ast::LocalArray(values)) = init {
                // Trailing zeroes past this point are bulk-filled by a loop
                // instead of one store per element.
                let zero_from = values.iter().rposition(|v| v.is_some()).map_or(0, |p| p + 1);
                let max = if elems - zero_from >= 16384 { zero_from } else { elems };

                for i in 0..max {
                    let value = match values.get(i).and_then(|v| v.as_ref()) {
                        Some(v) => self.emit_expr(v),
                        None if base.is_float() => {
                            self.create(SysOp::Float, &[], vec![Attr::Float(0.0)])
                        }
                        None => self.create(SysOp::Int, &[], vec![Attr::Int(0)]),
                    };
                    let offset =
                        self.create(SysOp::Int, &[], vec![Attr::Int((base_size * i) as i32)]);
                    let place = self.create(SysOp::AddL, &[addr, offset], vec![]);
                    self.create(SysOp::Store, &[value, place], vec![Attr::Size(base_size)]);
                }

                if max != elems {
                    let start = self.create(SysOp::Int, &[], vec![Attr::Int(zero_from as i32)]);
                    let end = self.create(SysOp::Int, &[], vec![Attr::Int(elems as i32)]);
                    let iv = self.create(SysOp::Alloca, &[], vec![Attr::Size(4)]);
                    let zero = if base.is_float() {
                        self.create(SysOp::Float, &[], vec![Attr::Float(0.0)])
                    } else {
                        self.create(SysOp::Int, &[], vec![Attr::Int(0)])
                    };
                    let stride = self.create(SysOp::Int, &[], vec![Attr::Int(base_size as i32)]);
                    let incr = self.create(SysOp::Int, &[], vec![Attr::Int(1)]);

                    let looop = self.create(SysOp::For, &[start, end, incr, iv], vec![]);
                    let body_region = self.module.append_region(looop);
                    let body = self.module.append_block(body_region);
                    self.in_block(body, |cg| {
                        let offset = cg.create(SysOp::MulI, &[looop, stride], vec![]);
                        let place = cg.create(SysOp::AddL, &[addr, offset], vec![]);
                        cg.create(SysOp::Store, &[zero, place], vec![Attr::Size(base_size)]);
                    });
                }
            }

            // The extra indirection: references read the base through this
            // pointer, uniformly with pointer-typed arguments.
            let array_ptr = self.create(SysOp::Alloca, &[], vec![Attr::Size(8)]);
            self.create(SysOp::Store, &[addr, array_ptr], vec![Attr::Size(8)]);
            self.define(name, array_ptr);
            self.module.add_attr(addr, Attr::Dims(dims.clone()));
            if base.is_float() {
                self.module.add_attr(addr, Attr::Fp);
            }
            return;
        }

        if let Some(init) = init {
            let value = self.emit_expr(init);
            self.create(SysOp::Store, &[value, addr], vec![Attr::Size(ty.size())]);
        }
    }
}
