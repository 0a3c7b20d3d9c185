//! A bitvector term language with an S-expression rule matcher, kept for
//! superoptimization experiments: candidate identities are written as
//! `(change <match> <rewrite>)` rules and checked against term shapes the
//! same way the IR matchers work, but over standalone expressions instead
//! of ops.

use rustc_hash::FxHashMap;

use crate::matcher::{parse, Expr};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BvKind {
    Var,
    Const,
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Not,
    Neg,
    Shl,
    LShr,
    AShr,
    Eq,
    Ult,
    Slt,
    Ite,
}

/// Index into a [`BvContext`] arena.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct BvRef(u32);

#[derive(Clone, Debug)]
pub struct BvExpr {
    pub kind: BvKind,
    pub value: i64,
    pub name: Option<String>,
    pub cond: Option<BvRef>,
    pub l: Option<BvRef>,
    pub r: Option<BvRef>,
}

/// Hash-consing arena: structurally equal terms share one node, so rule
/// bindings compare by reference.
#[derive(Default)]
pub struct BvContext {
    nodes: Vec<BvExpr>,
    interned: FxHashMap<String, BvRef>,
}

impl BvContext {
    pub fn new() -> BvContext {
        BvContext::default()
    }

    pub fn get(&self, r: BvRef) -> &BvExpr {
        &self.nodes[r.0 as usize]
    }

    fn intern(&mut self, key: String, node: BvExpr) -> BvRef {
        if let Some(&r) = self.interned.get(&key) {
            return r;
        }
        self.nodes.push(node);
        let r = BvRef(self.nodes.len() as u32 - 1);
        self.interned.insert(key, r);
        r
    }

    pub fn var(&mut self, name: &str) -> BvRef {
        self.intern(
            format!("v:{name}"),
            BvExpr {
                kind: BvKind::Var,
                value: 0,
                name: Some(name.to_string()),
                cond: None,
                l: None,
                r: None,
            },
        )
    }

    pub fn constant(&mut self, value: i64) -> BvRef {
        self.intern(
            format!("c:{value}"),
            BvExpr { kind: BvKind::Const, value, name: None, cond: None, l: None, r: None },
        )
    }

    pub fn unary(&mut self, kind: BvKind, l: BvRef) -> BvRef {
        self.intern(
            format!("u:{kind:?}:{}", l.0),
            BvExpr { kind, value: 0, name: None, cond: None, l: Some(l), r: None },
        )
    }

    pub fn binary(&mut self, kind: BvKind, l: BvRef, r: BvRef) -> BvRef {
        self.intern(
            format!("b:{kind:?}:{}:{}", l.0, r.0),
            BvExpr { kind, value: 0, name: None, cond: None, l: Some(l), r: Some(r) },
        )
    }

    pub fn ite(&mut self, cond: BvRef, l: BvRef, r: BvRef) -> BvRef {
        self.intern(
            format!("t:{}:{}:{}", cond.0, l.0, r.0),
            BvExpr {
                kind: BvKind::Ite,
                value: 0,
                name: None,
                cond: Some(cond),
                l: Some(l),
                r: Some(r),
            },
        )
    }
}

fn kind_of(name: &str) -> Option<(BvKind, usize)> {
    use BvKind::*;
    Some(match name {
        "bvadd" => (Add, 2),
        "bvsub" => (Sub, 2),
        "bvmul" => (Mul, 2),
        "bvand" => (And, 2),
        "bvor" => (Or, 2),
        "bvxor" => (Xor, 2),
        "bvshl" => (Shl, 2),
        "bvlshr" => (LShr, 2),
        "bvashr" => (AShr, 2),
        "bvnot" => (Not, 1),
        "bvneg" => (Neg, 1),
        "eq" => (Eq, 2),
        "bvult" => (Ult, 2),
        "bvslt" => (Slt, 2),
        "ite" => (Ite, 3),
        _ => return None,
    })
}

pub struct BvRule {
    pattern: Expr,
}

#[derive(Default)]
struct MatchState {
    binding: FxHashMap<String, BvRef>,
}

impl BvRule {
    pub fn new(text: &str) -> BvRule {
        BvRule { pattern: parse(text) }
    }

    /// Matches the rule at `term` and builds the rewrite on success.
    pub fn rewrite(&self, ctx: &mut BvContext, term: BvRef) -> Option<BvRef> {
        let Expr::List(items) = &self.pattern else {
            panic!("rewrite rule is not a (change ...) form");
        };
        assert!(items[0].as_atom() == "change", "rewrite rule is not a (change ...) form");

        let mut st = MatchState::default();
        if !self.match_expr(ctx, &items[1], term, &mut st) {
            return None;
        }
        Some(self.build_expr(ctx, &items[2], &st))
    }

    pub fn matches(&self, ctx: &BvContext, term: BvRef) -> bool {
        let mut st = MatchState::default();
        self.match_expr(ctx, &self.pattern, term, &mut st)
    }

    fn match_expr(&self, ctx: &BvContext, expr: &Expr, term: BvRef, st: &mut MatchState) -> bool {
        match expr {
            Expr::Atom(var) => {
                let bytes = var.as_bytes();
                if bytes[0].is_ascii_digit() || bytes[0] == b'-' {
                    let lit: i64 = var.parse().expect("bad literal");
                    return ctx.get(term).kind == BvKind::Const && ctx.get(term).value == lit;
                }
                if bytes[0] == b'\'' {
                    if ctx.get(term).kind != BvKind::Const {
                        return false;
                    }
                    if let Some(&bound) = st.binding.get(var) {
                        return ctx.get(bound).value == ctx.get(term).value;
                    }
                    st.binding.insert(var.clone(), term);
                    return true;
                }
                if let Some(&bound) = st.binding.get(var) {
                    return bound == term;
                }
                st.binding.insert(var.clone(), term);
                true
            }
            Expr::List(items) => {
                let Expr::Atom(head) = &items[0] else {
                    return false;
                };
                let Some((kind, arity)) = kind_of(head) else {
                    return false;
                };
                let node = ctx.get(term).clone();
                if node.kind != kind {
                    return false;
                }
                let children: Vec<BvRef> = match kind {
                    BvKind::Ite => {
                        vec![node.cond.unwrap(), node.l.unwrap(), node.r.unwrap()]
                    }
                    _ if arity == 2 => vec![node.l.unwrap(), node.r.unwrap()],
                    _ => vec![node.l.unwrap()],
                };
                for (i, &child) in children.iter().enumerate() {
                    if !self.match_expr(ctx, &items[i + 1], child, st) {
                        return false;
                    }
                }
                true
            }
        }
    }

    fn eval(&self, ctx: &BvContext, expr: &Expr, st: &MatchState) -> i64 {
        match expr {
            Expr::Atom(var) => {
                if var.as_bytes()[0].is_ascii_digit() || var.starts_with('-') {
                    return var.parse().expect("bad literal");
                }
                if var.starts_with('\'') {
                    return ctx.get(st.binding[var]).value;
                }
                panic!("cannot evaluate atom {var}");
            }
            Expr::List(items) => {
                let head = items[0].as_atom();
                let a = self.eval(ctx, &items[1], st);
                let b = items.get(2).map(|e| self.eval(ctx, e, st)).unwrap_or(0);
                match head {
                    "!add" => a.wrapping_add(b),
                    "!sub" => a.wrapping_sub(b),
                    "!mul" => a.wrapping_mul(b),
                    "!and" => a & b,
                    "!or" => a | b,
                    "!xor" => a ^ b,
                    "!not" => !a,
                    "!neg" => a.wrapping_neg(),
                    "!shl" => a.wrapping_shl(b as u32),
                    "!lshr" => ((a as u64) >> (b as u32)) as i64,
                    "!ashr" => a >> (b as u32),
                    _ => panic!("unknown opname: {head}"),
                }
            }
        }
    }

    fn build_expr(&self, ctx: &mut BvContext, expr: &Expr, st: &MatchState) -> BvRef {
        match expr {
            Expr::Atom(var) => {
                if var.as_bytes()[0].is_ascii_digit()
                    || var.starts_with('-')
                    || var.starts_with('\'')
                {
                    let value = self.eval(ctx, expr, st);
                    return ctx.constant(value);
                }
                match st.binding.get(var) {
                    Some(&term) => term,
                    None => panic!("unbound variable: {var}"),
                }
            }
            Expr::List(items) => {
                let head = items[0].as_atom().to_string();
                if head.starts_with('!') {
                    let value = self.eval(ctx, expr, st);
                    return ctx.constant(value);
                }
                let Some((kind, arity)) = kind_of(&head) else {
                    panic!("unknown opname: {head}");
                };
                match (kind, arity) {
                    (BvKind::Ite, _) => {
                        let c = self.build_expr(ctx, &items[1], st);
                        let l = self.build_expr(ctx, &items[2], st);
                        let r = self.build_expr(ctx, &items[3], st);
                        ctx.ite(c, l, r)
                    }
                    (_, 2) => {
                        let l = self.build_expr(ctx, &items[1], st);
                        let r = self.build_expr(ctx, &items[2], st);
                        ctx.binary(kind, l, r)
                    }
                    _ => {
                        let l = self.build_expr(ctx, &items[1], st);
                        ctx.unary(kind, l)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_double_negation() {
        let mut ctx = BvContext::new();
        let x = ctx.var("x");
        let n = ctx.unary(BvKind::Neg, x);
        let nn = ctx.unary(BvKind::Neg, n);

        let rule = BvRule::new("(change (bvneg (bvneg x)) x)");
        assert_eq!(rule.rewrite(&mut ctx, nn), Some(x));
    }

    #[test]
    fn folds_constants_in_rewrites() {
        let mut ctx = BvContext::new();
        let x = ctx.var("x");
        let c = ctx.constant(3);
        let add = ctx.binary(BvKind::Add, x, c);
        let add2 = {
            let c2 = ctx.constant(4);
            ctx.binary(BvKind::Add, add, c2)
        };

        let rule = BvRule::new("(change (bvadd (bvadd x 'a) 'b) (bvadd x (!add 'a 'b)))");
        let out = rule.rewrite(&mut ctx, add2).unwrap();
        let node = ctx.get(out).clone();
        assert_eq!(node.kind, BvKind::Add);
        assert_eq!(ctx.get(node.r.unwrap()).value, 7);
    }
}
