//! Memory-shape analyses that run before CFG flattening: base pointers of
//! address chains, affine subscripts of array accesses, and the no-store
//! summary of functions. All results are attributes on the ops themselves.

use rustc_hash::FxHashMap;

use crate::core::{Attr, AttrKind, Builder, Module, OpId, RegionId};
use crate::dialects::sys::SysOp;

/// Marks every alloca/getglobal-rooted address chain with a Base attribute.
/// Re-running drops stale results first; getglobals are deduplicated and
/// hoisted to the function entry so equal names share one base op.
pub struct Base;

impl Base {
    pub fn run(module: &mut Module) {
        for func in module.funcs() {
            let region = module.func_region(func);
            remove_attr_rec(module, region, AttrKind::Base);

            // Find the place to hoist get-globals: past the alloca prefix.
            let mut bb = module.region(region).first_block();
            if module.block(bb).op_count() > 0
                && module.op(module.block(bb).first_op()).kind() == SysOp::Alloca
            {
                if let Some(next) = module.next_block(bb) {
                    bb = next;
                }
            }

            let gets = module.find_all(func, SysOp::GetGlobal);
            let mut hoisted: FxHashMap<String, OpId> = FxHashMap::default();
            for get in gets {
                let name = module.op(get).name().to_string();
                let target = match hoisted.get(&name) {
                    Some(&op) => op,
                    None => {
                        let mut b = Builder::new(module);
                        b.set_to_block_start(bb);
                        let newget =
                            b.create(SysOp::GetGlobal, &[], vec![Attr::Name(name.clone())]);
                        hoisted.insert(name, newget);
                        newget
                    }
                };
                if get != target {
                    module.replace_op_with(get, target);
                }
            }

            Base::run_region(module, region);
        }
    }

    fn run_region(module: &mut Module, region: RegionId) {
        for bb in module.region(region).blocks().to_vec() {
            for op in module.block(bb).ops().to_vec() {
                for sub in module.op(op).regions().to_vec() {
                    Base::run_region(module, sub);
                }

                let kind = module.op(op).kind();
                // An alloca or getglobal is its own base.
                if kind == SysOp::Alloca || kind == SysOp::GetGlobal {
                    module.add_attr(op, Attr::Base(op));
                    continue;
                }
                // For addl, the base is that of the address operand.
                if kind == SysOp::AddL {
                    let mut x = module.op(op).operand(0);
                    let y = module.op(op).operand(1);
                    if !module.op(x).has_attr(AttrKind::Base) {
                        if !module.op(y).has_attr(AttrKind::Base) {
                            continue;
                        }
                        x = y;
                    }
                    let Attr::Base(base) = *module.op(x).attr(AttrKind::Base) else {
                        unreachable!()
                    };
                    module.add_attr(op, Attr::Base(base));
                }
            }
        }
    }
}

pub fn base_of(module: &Module, op: OpId) -> Option<OpId> {
    match module.op(op).find_attr(AttrKind::Base) {
        Some(Attr::Base(base)) => Some(*base),
        _ => None,
    }
}

/// Affine subscript vectors for address arithmetic under `For` nests.
/// `subscript[d]` is the coefficient of the depth-`d` induction variable and
/// the last element is the constant term. `While` bodies are skipped; their
/// induction structure isn't visible at this stage.
pub struct ArrayAccess;

impl ArrayAccess {
    pub fn run(module: &mut Module) {
        for func in module.funcs() {
            let region = module.func_region(func);
            remove_attr_rec(module, region, AttrKind::Subscript);

            for bb in module.region(region).blocks().to_vec() {
                for op in module.block(bb).ops().to_vec() {
                    if module.op(op).kind() != SysOp::For {
                        continue;
                    }
                    module.add_attr(op, Attr::Subscript(vec![1, 0]));
                    ArrayAccess::run_loop(module, op, 1);
                }
            }
        }
    }

    fn run_loop(module: &mut Module, looop: OpId, depth: usize) {
        Self::run_body(module, module.op(looop).region(0), depth);
    }

    fn run_body(module: &mut Module, region: RegionId, depth: usize) {
        let bb = module.region(region).first_block();

        for op in module.block(bb).ops().to_vec() {
            let kind = module.op(op).kind();

            if kind == SysOp::Int {
                let mut val = vec![0i64; depth + 1];
                val[depth] = module.op(op).int_val() as i64;
                module.add_attr(op, Attr::Subscript(val));
                continue;
            }

            if kind == SysOp::For {
                let mut val = vec![0i64; depth + 2];
                val[depth] = 1;
                module.add_attr(op, Attr::Subscript(val));
                ArrayAccess::run_loop(module, op, depth + 1);
                continue;
            }

            if kind == SysOp::If {
                Self::run_body(module, module.op(op).region(0), depth);
                continue;
            }

            if kind == SysOp::AddI || kind == SysOp::AddL {
                let x = module.op(op).operand(0);
                let y = module.op(op).operand(1);
                let sx = subscript_of(module, x, depth);
                let sy = subscript_of(module, y, depth);
                match (sx, sy, kind == SysOp::AddL) {
                    (Some(mut vx), Some(vy), _) => {
                        for (a, b) in vx.iter_mut().zip(vy.iter()) {
                            *a += b;
                        }
                        module.add_attr(op, Attr::Subscript(vx));
                    }
                    // An address plus a non-affine part only keeps the
                    // affine side when tagging the addl itself.
                    (Some(vx), None, true) => module.add_attr(op, Attr::Subscript(vx)),
                    (None, Some(vy), true) => module.add_attr(op, Attr::Subscript(vy)),
                    _ => {}
                }
                continue;
            }

            if kind == SysOp::MulI {
                let x = module.op(op).operand(0);
                let y = module.op(op).operand(1);
                if module.op(y).kind() != SysOp::Int {
                    continue;
                }
                if let Some(mut val) = subscript_of(module, x, depth) {
                    let factor = module.op(y).int_val() as i64;
                    for coeff in val.iter_mut() {
                        *coeff *= factor;
                    }
                    module.add_attr(op, Attr::Subscript(val));
                }
            }
        }
    }
}

/// Subscript of `op` padded with zero coefficients up to `depth`.
pub fn subscript_of(module: &Module, op: OpId, depth: usize) -> Option<Vec<i64>> {
    match module.op(op).find_attr(AttrKind::Subscript) {
        Some(Attr::Subscript(val)) => {
            let mut val = val.clone();
            let constant = val.pop().unwrap();
            val.resize(depth, 0);
            val.push(constant);
            Some(val)
        }
        _ => None,
    }
}

/// Marks functions that never store through a global base. Argument-pointer
/// stores keep the function unmarked too, since the base is unknown.
pub struct NoStore;

impl NoStore {
    pub fn run(module: &mut Module) {
        Base::run(module);
        for func in module.funcs() {
            NoStore::run_func(module, func);
        }
    }

    fn run_func(module: &mut Module, func: OpId) {
        for store in module.find_all(func, SysOp::Store) {
            let addr = module.op(store).operand(1);
            let Some(base) = base_of(module, addr) else {
                return;
            };
            if module.op(base).kind() == SysOp::GetGlobal {
                return;
            }
        }
        if !module.op(func).has_attr(AttrKind::NoStore) {
            module.add_attr(func, Attr::NoStore);
        }
    }
}

pub(crate) fn remove_attr_rec(module: &mut Module, region: RegionId, kind: AttrKind) {
    for bb in module.region(region).blocks().to_vec() {
        for op in module.block(bb).ops().to_vec() {
            module.remove_attr(op, kind);
            for sub in module.op(op).regions().to_vec() {
                remove_attr_rec(module, sub, kind);
            }
        }
    }
}

/// May-alias over Alias attributes; ops without a summary conservatively
/// alias everything.
pub fn may_alias(module: &Module, a: OpId, b: OpId) -> bool {
    match (module.op(a).find_attr(AttrKind::Alias), module.op(b).find_attr(AttrKind::Alias)) {
        (Some(Attr::Alias(ia)), Some(Attr::Alias(ib))) => ia.may_alias(ib),
        _ => true,
    }
}
