//! Rewrite rules over the `sys` dialect.
//!
//! A rule is one S-expression. Head atoms of lists name opcodes; leading
//! sigils on atoms select the match mode:
//!
//! - a bare atom binds any op, with repeated names forced to the same op;
//! - `'a` binds an integer-constant op, `*a` a float-constant op;
//! - a numeric literal matches a constant of that exact value;
//! - `!op` evaluates integer arithmetic over already-bound constants,
//!   `?op` float arithmetic, and `(!only-if c r)` guards a rewrite;
//! - `(change <match> <rewrite>)` with [`Rule::rewrite`] replaces the
//!   matched op by the built rewrite.
//!
//! Rules are parsed once and hold no per-match state, so rule tables can sit
//! behind `lazy_static`.

use rustc_hash::FxHashMap;

use crate::core::{Attr, Builder, Module, OpId};
use crate::dialects::sys::SysOp;
use crate::matcher::sexpr::{is_literal, parse, Expr};

pub type Binding = FxHashMap<String, OpId>;

#[derive(Debug)]
pub struct Rule {
    pattern: Expr,
}

#[derive(Default)]
struct MatchState {
    binding: Binding,
    failed: bool,
}

/// sys opcodes addressable from match patterns, with operand counts.
fn match_op(name: &str) -> Option<(SysOp, usize)> {
    use SysOp::*;
    Some(match name {
        "select" => (Select, 3),
        "eq" => (Eq, 2),
        "ne" => (Ne, 2),
        "le" => (Le, 2),
        "lt" => (Lt, 2),
        "feq" => (EqF, 2),
        "fne" => (NeF, 2),
        "fle" => (LeF, 2),
        "flt" => (LtF, 2),
        "add" => (AddI, 2),
        "sub" => (SubI, 2),
        "mul" => (MulI, 2),
        "div" => (DivI, 2),
        "mod" => (ModI, 2),
        "and" => (AndI, 2),
        "or" => (OrI, 2),
        "xor" => (XorI, 2),
        "addl" => (AddL, 2),
        "subl" => (SubL, 2),
        "mull" => (MulL, 2),
        "divl" => (DivL, 2),
        "fadd" => (AddF, 2),
        "fsub" => (SubF, 2),
        "fmul" => (MulF, 2),
        "fdiv" => (DivF, 2),
        "store" => (Store, 2),
        "lshift" => (LShift, 2),
        "rshift" => (RShift, 2),
        "not" => (Not, 1),
        "snz" => (SetNotZero, 1),
        "minus" => (Minus, 1),
        "fminus" => (MinusF, 1),
        "br" => (Branch, 1),
        "f2i" => (F2I, 1),
        "i2f" => (I2F, 1),
        "load" => (Load, 1),
        _ => return None,
    })
}

/// sys opcodes buildable from rewrite expressions. `gt`/`ge` are aliases
/// that build the swapped `lt`/`le`.
fn build_op(name: &str) -> Option<(SysOp, usize, bool)> {
    use SysOp::*;
    Some(match name {
        "select" => (Select, 3, false),
        "add" => (AddI, 2, false),
        "sub" => (SubI, 2, false),
        "mul" => (MulI, 2, false),
        "div" => (DivI, 2, false),
        "mod" => (ModI, 2, false),
        "and" => (AndI, 2, false),
        "or" => (OrI, 2, false),
        "addl" => (AddL, 2, false),
        "mull" => (MulL, 2, false),
        "fadd" => (AddF, 2, false),
        "fsub" => (SubF, 2, false),
        "fmul" => (MulF, 2, false),
        "fdiv" => (DivF, 2, false),
        "eq" => (Eq, 2, false),
        "ne" => (Ne, 2, false),
        "le" => (Le, 2, false),
        "lt" => (Lt, 2, false),
        "gt" => (Lt, 2, true),
        "ge" => (Le, 2, true),
        "minus" => (Minus, 1, false),
        "fminus" => (MinusF, 1, false),
        "not" => (Not, 1, false),
        "snz" => (SetNotZero, 1, false),
        _ => return None,
    })
}

impl Rule {
    pub fn new(text: &str) -> Rule {
        Rule { pattern: parse(text) }
    }

    /// Tries the match at `op`; on success builds the rewrite at `op`'s
    /// position, replaces all uses and erases the original.
    pub fn rewrite(&self, module: &mut Module, op: OpId) -> bool {
        let Expr::List(items) = &self.pattern else {
            panic!("rewrite rule is not a (change ...) form");
        };
        assert!(items[0].as_atom() == "change", "rewrite rule is not a (change ...) form");
        let matcher = &items[1];
        let rewriter = &items[2];

        let mut st = MatchState::default();
        if !self.match_expr(module, matcher, op, &mut st) {
            return false;
        }

        let mut builder = Builder::new(module);
        builder.set_before_op(op);
        let new = self.build_expr(&mut builder, rewriter, &mut st);
        if st.failed {
            return false;
        }

        module.replace_op_with(op, new);
        true
    }

    /// Matching without rewriting, optionally with pre-bound names. Returns
    /// the binding for [`Rule::extract`]-style interrogation.
    pub fn match_only(&self, module: &Module, op: OpId, external: &Binding) -> Option<Binding> {
        let mut st = MatchState { binding: external.clone(), failed: false };
        if self.match_expr(module, &self.pattern, op, &mut st) {
            Some(st.binding)
        } else {
            None
        }
    }

    fn match_expr(&self, m: &Module, expr: &Expr, op: OpId, st: &mut MatchState) -> bool {
        match expr {
            Expr::Atom(var) => self.match_atom(m, var, op, st),
            Expr::List(items) => {
                assert!(!items.is_empty(), "empty list in pattern");
                let Expr::Atom(head) = &items[0] else {
                    return false;
                };
                let Some((kind, arity)) = match_op(head) else {
                    return false;
                };
                if m.op(op).kind() != kind || m.op(op).operand_count() < arity {
                    return false;
                }
                for i in 0..arity {
                    let operand = m.op(op).operand(i);
                    if !self.match_expr(m, &items[i + 1], operand, st) {
                        return false;
                    }
                }
                true
            }
        }
    }

    fn match_atom(&self, m: &Module, var: &str, op: OpId, st: &mut MatchState) -> bool {
        let bytes = var.as_bytes();

        // Float constant, possibly a literal.
        if bytes[0] == b'*' {
            if m.op(op).kind() != SysOp::Float {
                return false;
            }
            if bytes.len() > 1 && (bytes[1].is_ascii_digit() || bytes[1] == b'-') {
                let lit: f32 = var[1..].parse().expect("bad float literal");
                if lit != m.op(op).float_val() {
                    return false;
                }
            }
            if let Some(&bound) = st.binding.get(var) {
                return m.op(bound).float_val() == m.op(op).float_val();
            }
            st.binding.insert(var.to_string(), op);
            return true;
        }

        // A normal binding.
        if bytes[0] != b'\'' && !is_literal(var) {
            if let Some(&bound) = st.binding.get(var) {
                return bound == op;
            }
            st.binding.insert(var.to_string(), op);
            return true;
        }

        // Integer constant required from here on.
        if m.op(op).kind() != SysOp::Int {
            return false;
        }

        if is_literal(var) {
            let lit: i32 = var.parse().expect("bad int literal");
            if lit != m.op(op).int_val() {
                return false;
            }
        }

        if let Some(&bound) = st.binding.get(var) {
            return m.op(bound).int_val() == m.op(op).int_val();
        }
        st.binding.insert(var.to_string(), op);
        true
    }

    fn eval(&self, m: &Module, expr: &Expr, st: &mut MatchState) -> i32 {
        match expr {
            Expr::Atom(var) => {
                if is_literal(var) {
                    return var.parse().expect("bad int literal");
                }
                if var.starts_with('\'') {
                    return m.op(st.binding[var]).int_val();
                }
                panic!("cannot evaluate atom {var}");
            }
            Expr::List(items) => {
                let head = items[0].as_atom();
                let bin = |s: &mut MatchState, me: &Self, i: usize| -> i32 { me.eval(m, &items[i], s) };
                match head {
                    "!add" => bin(st, self, 1).wrapping_add(bin(st, self, 2)),
                    "!sub" => bin(st, self, 1).wrapping_sub(bin(st, self, 2)),
                    "!mul" => bin(st, self, 1).wrapping_mul(bin(st, self, 2)),
                    "!div" => bin(st, self, 1) / bin(st, self, 2),
                    "!mod" => bin(st, self, 1) % bin(st, self, 2),
                    "!gt" => (bin(st, self, 1) > bin(st, self, 2)) as i32,
                    "!lt" => (bin(st, self, 1) < bin(st, self, 2)) as i32,
                    "!ge" => (bin(st, self, 1) >= bin(st, self, 2)) as i32,
                    "!le" => (bin(st, self, 1) <= bin(st, self, 2)) as i32,
                    "!eq" => (bin(st, self, 1) == bin(st, self, 2)) as i32,
                    "!ne" => (bin(st, self, 1) != bin(st, self, 2)) as i32,
                    "!and" => bin(st, self, 1) & bin(st, self, 2),
                    "!or" => bin(st, self, 1) | bin(st, self, 2),
                    "!lsh" => bin(st, self, 1) << bin(st, self, 2),
                    "!rsh" => bin(st, self, 1) >> bin(st, self, 2),
                    "!not" => (bin(st, self, 1) == 0) as i32,
                    "!feq" => (self.eval_f(m, &items[1], st) == self.eval_f(m, &items[2], st)) as i32,
                    "!fne" => (self.eval_f(m, &items[1], st) != self.eval_f(m, &items[2], st)) as i32,
                    "!fle" => (self.eval_f(m, &items[1], st) <= self.eval_f(m, &items[2], st)) as i32,
                    "!fge" => (self.eval_f(m, &items[1], st) >= self.eval_f(m, &items[2], st)) as i32,
                    "!flt" => (self.eval_f(m, &items[1], st) < self.eval_f(m, &items[2], st)) as i32,
                    "!fgt" => (self.eval_f(m, &items[1], st) > self.eval_f(m, &items[2], st)) as i32,
                    "!cvt" => self.eval_f(m, &items[1], st) as i32,
                    "!inbit" => {
                        let bitlen = bin(st, self, 1);
                        let value = bin(st, self, 2);
                        (value < (1 << bitlen) && value >= -(1 << bitlen)) as i32
                    }
                    "!only-if" => {
                        if bin(st, self, 1) == 0 {
                            st.failed = true;
                        }
                        0
                    }
                    _ => panic!("unknown opname: {head}"),
                }
            }
        }
    }

    fn eval_f(&self, m: &Module, expr: &Expr, st: &mut MatchState) -> f32 {
        match expr {
            Expr::Atom(var) => {
                let bytes = var.as_bytes();
                if bytes.len() > 1 && (bytes[1].is_ascii_digit() || bytes[1] == b'-') {
                    return var[1..].parse().expect("bad float literal");
                }
                if bytes[0] == b'*' {
                    return m.op(st.binding[var]).float_val();
                }
                panic!("cannot float-evaluate atom {var}");
            }
            Expr::List(items) => {
                let head = items[0].as_atom();
                match head {
                    "?add" => self.eval_f(m, &items[1], st) + self.eval_f(m, &items[2], st),
                    "?sub" => self.eval_f(m, &items[1], st) - self.eval_f(m, &items[2], st),
                    "?mul" => self.eval_f(m, &items[1], st) * self.eval_f(m, &items[2], st),
                    "?div" => self.eval_f(m, &items[1], st) / self.eval_f(m, &items[2], st),
                    "?cvt" => self.eval(m, &items[1], st) as f32,
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
                    return b.create(SysOp::Int, &[], vec![Attr::Int(value)]);
                }
                match st.binding.get(var) {
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
                    return b.create(SysOp::Int, &[], vec![Attr::Int(result)]);
                }

                if head.starts_with('?') {
                    let result = self.eval_f(b.module, expr, st);
                    return b.create(SysOp::Float, &[], vec![Attr::Float(result)]);
                }

                let Some((kind, arity, swap)) = build_op(&head) else {
                    panic!("unknown opname: {head}");
                };
                let mut operands = Vec::with_capacity(arity);
                for i in 0..arity {
                    operands.push(self.build_expr(b, &items[i + 1], st));
                }
                if swap {
                    operands.swap(0, 1);
                }
                b.create(kind, &operands, vec![])
            }
        }
    }

    /// Looks a bound name up after a successful [`Rule::match_only`].
    pub fn extract(binding: &Binding, name: &str) -> OpId {
        match binding.get(name) {
            Some(&op) => op,
            None => panic!("querying unknown name: {name}"),
        }
    }
}
