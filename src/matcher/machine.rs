//! Rewrite rules over the machine dialects.
//!
//! The grammar is the one of [`crate::matcher::Rule`], but opcodes are
//! interpreted through a per-target [`MachineTable`] and two more binding
//! sigils exist: `#x` binds the immediate attribute of the matched op and
//! `>x` binds a branch-target block. Machine rules drive InstCombine and the
//! register peepholes.

use rustc_hash::FxHashMap;

use crate::core::{Attr, Builder, Module, OpId, OpKind};
use crate::matcher::sexpr::{is_literal, parse, Expr};

/// Operand/attribute shape of one mnemonic in the table.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Shape {
    Unary,
    Binary,
    Ternary,
    /// Trailing `#imm` pattern position for the Int attr.
    UnaryImm,
    BinaryImm,
    TernaryImm,
    /// Only the `#imm`, no operands (`mov`, `li`).
    Imm,
    /// One operand plus `>target >else` blocks.
    Branch,
    /// Two operands plus `>target >else` blocks.
    BranchBinary,
    /// `>target` only.
    Jump,
}

impl Shape {
    fn operands(self) -> usize {
        match self {
            Shape::Imm | Shape::Jump => 0,
            Shape::Unary | Shape::UnaryImm | Shape::Branch => 1,
            Shape::Binary | Shape::BinaryImm | Shape::BranchBinary => 2,
            Shape::Ternary | Shape::TernaryImm => 3,
        }
    }
}

pub struct MachineSig {
    pub name: &'static str,
    pub kind: OpKind,
    pub shape: Shape,
}

/// Per-target mnemonic tables. `const_op` is the dialect's load-immediate
/// op, used when a rewrite expression evaluates a fresh integer.
pub struct MachineTable {
    pub match_ops: &'static [MachineSig],
    pub build_ops: &'static [MachineSig],
    pub const_op: OpKind,
}

impl MachineTable {
    fn find<'a>(ops: &'a [MachineSig], name: &str) -> Option<&'a MachineSig> {
        ops.iter().find(|sig| sig.name == name)
    }
}

#[derive(Default)]
struct MatchState {
    binding: FxHashMap<String, OpId>,
    blocks: FxHashMap<String, crate::core::BlockId>,
    imms: FxHashMap<String, i32>,
    failed: bool,
}

pub struct MachineRule {
    pattern: Expr,
    table: &'static MachineTable,
}

impl MachineRule {
    pub fn new(table: &'static MachineTable, text: &str) -> MachineRule {
        MachineRule { pattern: parse(text), table }
    }

    pub fn rewrite(&self, module: &mut Module, op: OpId) -> bool {
        let Expr::List(items) = &self.pattern else {
            panic!("rewrite rule is not a (change ...) form");
        };
        assert!(items[0].as_atom() == "change", "rewrite rule is not a (change ...) form");

        let mut st = MatchState::default();
        if !self.match_expr(module, &items[1], op, &mut st) {
            return false;
        }

        let mut builder = Builder::new(module);
        builder.set_before_op(op);
        let new = self.build_expr(&mut builder, &items[2], &mut st);
        if st.failed {
            return false;
        }

        module.replace_op_with(op, new);
        true
    }

    fn match_expr(&self, m: &Module, expr: &Expr, op: OpId, st: &mut MatchState) -> bool {
        let items = match expr {
            Expr::Atom(var) => {
                // Any op; repeated names force the same op.
                if let Some(&bound) = st.binding.get(var.as_str()) {
                    return bound == op;
                }
                st.binding.insert(var.clone(), op);
                return true;
            }
            Expr::List(items) => items,
        };

        assert!(!items.is_empty(), "empty list in pattern");
        let Expr::Atom(head) = &items[0] else {
            return false;
        };
        let Some(sig) = MachineTable::find(self.table.match_ops, head) else {
            return false;
        };
        if m.op(op).kind() != sig.kind {
            return false;
        }

        let n = sig.shape.operands();
        for i in 0..n {
            if !self.match_expr(m, &items[i + 1], m.op(op).operand(i), st) {
                return false;
            }
        }

        match sig.shape {
            Shape::Imm | Shape::UnaryImm | Shape::BinaryImm | Shape::TernaryImm => {
                let var = items[n + 1].as_atom();
                assert!(var.starts_with('#'), "immediate binder must start with #");
                let imm = m.op(op).int_val();
                if let Some(&bound) = st.imms.get(var) {
                    return bound == imm;
                }
                st.imms.insert(var.to_string(), imm);
                true
            }
            Shape::Branch | Shape::BranchBinary => {
                self.bind_block(st, items[n + 1].as_atom(), m.op(op).target())
                    && self.bind_block(st, items[n + 2].as_atom(), m.op(op).else_target())
            }
            Shape::Jump => self.bind_block(st, items[1].as_atom(), m.op(op).target()),
            _ => true,
        }
    }

    fn bind_block(&self, st: &mut MatchState, var: &str, bb: crate::core::BlockId) -> bool {
        assert!(var.starts_with('>'), "block binder must start with >");
        if let Some(&bound) = st.blocks.get(var) {
            return bound == bb;
        }
        st.blocks.insert(var.to_string(), bb);
        true
    }

    fn eval(&self, m: &Module, expr: &Expr, st: &mut MatchState) -> i32 {
        match expr {
            Expr::Atom(var) => {
                if is_literal(var) {
                    return var.parse().expect("bad int literal");
                }
                if let Some(imm) = st.imms.get(var.as_str()) {
                    return *imm;
                }
                if var.starts_with('\'') {
                    return m.op(st.binding[var.as_str()]).int_val();
                }
                panic!("cannot evaluate atom {var}");
            }
            Expr::List(items) => {
                let head = items[0].as_atom();
                macro_rules! bin {
                    ($o:tt) => {{
                        let a = self.eval(m, &items[1], st);
                        let b = self.eval(m, &items[2], st);
                        (a $o b)
                    }};
                }
                match head {
                    "!add" => bin!(+),
                    "!sub" => bin!(-),
                    "!mul" => bin!(*),
                    "!div" => bin!(/),
                    "!mod" => bin!(%),
                    "!gt" => bin!(>) as i32,
                    "!lt" => bin!(<) as i32,
                    "!ge" => bin!(>=) as i32,
                    "!le" => bin!(<=) as i32,
                    "!eq" => bin!(==) as i32,
                    "!ne" => bin!(!=) as i32,
                    "!bitand" => bin!(&),
                    "!bitor" => bin!(|),
                    "!xor" => bin!(^),
                    "!and" => {
                        ((self.eval(m, &items[1], st) != 0) && (self.eval(m, &items[2], st) != 0))
                            as i32
                    }
                    "!or" => {
                        ((self.eval(m, &items[1], st) != 0) || (self.eval(m, &items[2], st) != 0))
                            as i32
                    }
                    "!minus" => -self.eval(m, &items[1], st),
                    "!not" => (self.eval(m, &items[1], st) == 0) as i32,
                    "!inbit" => {
                        let bitlen = self.eval(m, &items[1], st);
                        let value = self.eval(m, &items[2], st);
                        (value < (1 << bitlen) && value >= -(1 << bitlen)) as i32
                    }
                    "!only-if" => {
                        if self.eval(m, &items[1], st) == 0 {
                            st.failed = true;
                        }
                        0
                    }
                    _ => panic!("unknown opname: {head}"),
                }
            }
        }
    }

    fn build_expr(&self, b: &mut Builder, expr: &Expr, st: &mut MatchState) -> OpId {
        match expr {
            Expr::Atom(var) => {
                if is_literal(var) || var.starts_with('\'') {
                    let value = self.eval(b.module, expr, st);
                    return b.create(self.table.const_op, &[], vec![Attr::Int(value)]);
                }
                match st.binding.get(var.as_str()) {
                    Some(&op) => op,
                    None => panic!("unbound variable: {var}"),
                }
            }
            Expr::List(items) => {
                let head = items[0].as_atom().to_string();

                if head.starts_with('!') {
                    let result = self.eval(b.module, expr, st);
                    if head == "!only-if" && !st.failed {
                        return self.build_expr(b, &items[2], st);
                    }
                    return b.create(self.table.const_op, &[], vec![Attr::Int(result)]);
                }

                let Some(sig) = MachineTable::find(self.table.build_ops, &head) else {
                    panic!("unknown opname: {head}");
                };

                let n = sig.shape.operands();
                let mut operands = Vec::with_capacity(n);
                for i in 0..n {
                    operands.push(self.build_expr(b, &items[i + 1], st));
                }

                let attrs = match sig.shape {
                    Shape::Imm | Shape::UnaryImm | Shape::BinaryImm | Shape::TernaryImm => {
                        vec![Attr::Int(self.eval(b.module, &items[n + 1], st))]
                    }
                    Shape::Branch | Shape::BranchBinary => {
                        let target = st.blocks[items[n + 1].as_atom()];
                        let ifnot = st.blocks[items[n + 2].as_atom()];
                        vec![Attr::Target(target), Attr::Else(ifnot)]
                    }
                    Shape::Jump => {
                        vec![Attr::Target(st.blocks[items[1].as_atom()])]
                    }
                    _ => vec![],
                };

                b.create(sig.kind, &operands, attrs)
            }
        }
    }
}
