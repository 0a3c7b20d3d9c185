//! Dominator-tree value numbering (Briggs 1997, figure 4).
//!
//! Tables are scoped per dominator-tree node, so a replacement value always
//! dominates the op it replaces. Commutative ops canonicalize by sorting
//! operand numbers. Anything impure or touching memory opens a fresh number
//! instead of joining an existing class.

use std::collections::BTreeMap;

use color_eyre::Report;
use rustc_hash::FxHashMap;

use crate::core::{run_rewriter, AttrKind, BlockId, Module, OpId, OpKind, Pass};
use crate::dialects::arm::ArmOp;
use crate::dialects::rv::RvOp;
use crate::dialects::sys::SysOp;

#[derive(Default)]
pub struct Gvn {
    eliminated: usize,
}

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ExprKey {
    kind: OpKind,
    operands: Vec<u32>,
    vi: Option<i32>,
    /// Bit pattern; NaN payloads compare like any other constant.
    vf: Option<u32>,
    name: Option<String>,
}

fn allowed(module: &Module, op: OpId) -> bool {
    match module.op(op).kind() {
        OpKind::Sys(SysOp::Call) => !module.op(op).has_attr(AttrKind::Impure),
        OpKind::Sys(k) => {
            k.is_pure()
                && !matches!(k, SysOp::GetArg)
        }
        OpKind::Rv(RvOp::Add) | OpKind::Rv(RvOp::Li) => true,
        OpKind::Arm(ArmOp::MovI) => true,
        _ => false,
    }
}

struct Tables {
    /// Value number of every op seen on the path from the root.
    symbols: FxHashMap<OpId, u32>,
    expr_num: BTreeMap<ExprKey, u32>,
    num_op: FxHashMap<u32, OpId>,
}

impl Gvn {
    fn dvnt(
        &mut self,
        module: &mut Module,
        bb: BlockId,
        domtree: &FxHashMap<BlockId, Vec<BlockId>>,
        tables: &Tables,
        next: &mut u32,
    ) {
        let mut scope = Tables {
            symbols: tables.symbols.clone(),
            expr_num: tables.expr_num.clone(),
            num_op: tables.num_op.clone(),
        };

        for phi in module.phis(bb) {
            assert!(module.op(phi).operand_count() > 0, "empty phi");

            let common = module.op(phi).operand(0);
            if let Some(&common_num) = scope.symbols.get(&common) {
                // A phi whose operands all map to one number is meaningless.
                let meaningless = module.op(phi).operands().iter().all(|v| {
                    scope.symbols.get(v).is_some_and(|&n| n == common_num)
                });
                if meaningless {
                    self.eliminated += 1;
                    module.replace_op_with(phi, common);
                    continue;
                }
            }
            scope.symbols.insert(phi, *next);
            *next += 1;
        }

        for op in module.block(bb).ops().to_vec() {
            if module.is_dead(op) || module.op(op).kind() == SysOp::Phi {
                continue;
            }

            if !allowed(module, op) {
                scope.symbols.insert(op, *next);
                *next += 1;
                continue;
            }

            let mut key = ExprKey {
                kind: module.op(op).kind(),
                operands: Vec::new(),
                vi: None,
                vf: None,
                name: None,
            };
            for &operand in module.op(op).operands() {
                let Some(&n) = scope.symbols.get(&operand) else {
                    panic!(
                        "cannot find def:\n  {}\ndemanding op:\n  {}",
                        module.display_op(operand),
                        module.display_op(op)
                    );
                };
                key.operands.push(n);
            }

            if let OpKind::Sys(k) = key.kind {
                if k.is_commutative() {
                    key.operands.sort_unstable();
                }
            }
            if let Some(crate::core::Attr::Int(v)) = module.op(op).find_attr(AttrKind::Int) {
                key.vi = Some(*v);
            }
            if let Some(crate::core::Attr::Float(v)) = module.op(op).find_attr(AttrKind::Float) {
                key.vf = Some(v.to_bits());
            }
            if let Some(crate::core::Attr::Name(v)) = module.op(op).find_attr(AttrKind::Name) {
                key.name = Some(v.clone());
            }

            match scope.expr_num.get(&key) {
                Some(&num) => {
                    let leader = scope.num_op[&num];
                    self.eliminated += 1;
                    module.replace_op_with(op, leader);
                }
                None => {
                    scope.symbols.insert(op, *next);
                    scope.expr_num.insert(key, *next);
                    scope.num_op.insert(*next, op);
                    *next += 1;
                }
            }
        }

        for child in domtree.get(&bb).cloned().unwrap_or_default() {
            self.dvnt(module, child, domtree, &scope, next);
        }
    }
}

impl Pass for Gvn {
    fn name(&self) -> &'static str {
        "gvn"
    }

    fn stats(&self) -> Vec<(&'static str, usize)> {
        vec![("eliminated-ops", self.eliminated)]
    }

    fn run(&mut self, module: &mut Module) -> Result<(), Report> {
        for func in module.funcs() {
            let region = module.func_region(func);
            let domtree = module.dom_tree(region);
            let entry = module.region(region).first_block();
            let tables = Tables {
                symbols: FxHashMap::default(),
                expr_num: BTreeMap::new(),
                num_op: FxHashMap::default(),
            };
            let mut next = 0;
            self.dvnt(module, entry, &domtree, &tables, &mut next);
        }

        // Discard trivial phis left over.
        let mut eliminated = 0;
        run_rewriter(module, SysOp::Phi, |m, phi| {
            if m.op(phi).operand_count() == 1 {
                let def = m.op(phi).operand(0);
                m.replace_op_with(phi, def);
                eliminated += 1;
                return true;
            }
            false
        });
        self.eliminated += eliminated;
        Ok(())
    }
}
