//! Recognizes `store init; while (load < bound) { ... store (load + step) }`
//! and rebuilds it as a structured `For` with (start, stop, step, ivAddr)
//! operands, so the loop passes see induction structure directly.

use color_eyre::Report;

use crate::core::{Attr, AttrKind, Builder, Module, OpId, Pass};
use crate::dialects::sys::analysis::{base_of, Base};
use crate::dialects::sys::SysOp;
use crate::matcher::{Binding, Rule};

lazy_static! {
    static ref FOR_COND: Rule = Rule::new("(lt (load x) y)");
    static ref FOR_COND_LE: Rule = Rule::new("(le (load x) y)");
    static ref CONST_INCR: Rule = Rule::new("(store (add (load x) y) x)");
}

#[derive(Default)]
pub struct RaiseToFor {
    raised: usize,
}

fn matches_incr(module: &Module, op: OpId, iv_addr: OpId) -> Option<OpId> {
    let external = Binding::from_iter([("x".to_string(), iv_addr)]);
    CONST_INCR
        .match_only(module, op, &external)
        .map(|binding| Rule::extract(&binding, "y"))
}

impl Pass for RaiseToFor {
    fn name(&self) -> &'static str {
        "raise-to-for"
    }

    fn stats(&self) -> Vec<(&'static str, usize)> {
        vec![("raised-for-loops", self.raised)]
    }

    fn run(&mut self, module: &mut Module) -> Result<(), Report> {
        Base::run(module);

        let top = module.top();
        'next_loop: for looop in module.find_all(top, SysOp::While) {
            if module.is_dead(looop) {
                continue;
            }
            // Nothing before the loop means the induction variable cannot
            // have been initialized; don't crash, just skip.
            if module.at_front(looop) {
                continue;
            }

            let before = module.op(looop).region(0);
            let after = module.op(looop).region(1);

            let proceed = module.block(module.region(before).last_block()).last_op();
            let cond = module.op(proceed).operand(0);

            // `stop` is the final bound (offset by one for `<=`); `stopvar`
            // the original value.
            let mut iv_addr = None;
            let mut stop = None;
            let mut stopvar = None;
            if let Some(binding) = FOR_COND.match_only(module, cond, &Binding::default()) {
                iv_addr = Some(Rule::extract(&binding, "x"));
                stop = Some(Rule::extract(&binding, "y"));
                stopvar = stop;
            } else if let Some(binding) = FOR_COND_LE.match_only(module, cond, &Binding::default())
            {
                iv_addr = Some(Rule::extract(&binding, "x"));
                let sv = Rule::extract(&binding, "y");
                stopvar = Some(sv);
                let mut b = Builder::new(module);
                b.set_after_op(sv);
                let one = b.create(SysOp::Int, &[], vec![Attr::Int(1)]);
                stop = Some(b.create(SysOp::AddI, &[sv, one], vec![]));
            }
            let (Some(iv_addr), Some(stop), Some(stopvar)) = (iv_addr, stop, stopvar) else {
                continue;
            };

            // The bound must be loop-invariant.
            if module.op(stopvar).kind() == SysOp::Call
                && module.op(stopvar).has_attr(AttrKind::Impure)
            {
                continue;
            }
            if module.op(stopvar).kind() == SysOp::Load {
                let addr = module.op(stopvar).operand(0);
                for &user in module.op(addr).uses() {
                    if module.op(user).kind() == SysOp::Store && module.inside(user, looop) {
                        continue 'next_loop;
                    }
                }
            }

            // All in-loop stores to the address must be the same constant
            // increment, each immediately before the block end or a
            // break/continue.
            let mut incr = None;
            for user in module.op(iv_addr).uses().iter().copied().collect::<Vec<_>>() {
                if !module.inside(user, looop) || module.op(user).kind() == SysOp::Load {
                    continue;
                }
                let Some(vi) = matches_incr(module, user, iv_addr) else {
                    continue 'next_loop;
                };
                match incr {
                    None => incr = Some(vi),
                    Some(prev) => {
                        let same = prev == vi
                            || (module.op(prev).kind() == SysOp::Int
                                && module.op(vi).kind() == SysOp::Int
                                && module.op(prev).int_val() == module.op(vi).int_val());
                        if !same {
                            continue 'next_loop;
                        }
                    }
                }
                if module.at_back(user) {
                    continue;
                }
                let next = module.next_op(user).unwrap();
                let nkind = module.op(next).kind();
                if !(nkind == SysOp::Continue || nkind == SysOp::Break) {
                    continue 'next_loop;
                }
            }
            let Some(incr) = incr else { continue };

            // A non-constant increment must still be loop-invariant.
            if module.op(incr).kind() != SysOp::Int && module.inside(incr, looop) {
                if module.op(incr).kind() != SysOp::Load {
                    continue;
                }
                let addr = module.op(incr).operand(0);
                let Some(base) = base_of(module, addr) else { continue };
                if module.op(base).size() != 4 {
                    continue;
                }
                for store in module.find_all(looop, SysOp::Store) {
                    let saddr = module.op(store).operand(1);
                    match base_of(module, saddr) {
                        Some(b) if b != base => {}
                        _ => continue 'next_loop,
                    }
                }
            }

            // The increment must reach every break/continue and the tail.
            let mut terms = module.find_all(looop, SysOp::Break);
            terms.extend(module.find_all(looop, SysOp::Continue));
            for x in terms {
                if module.at_front(x) {
                    continue 'next_loop;
                }
                let prev = module.prev_op(x).unwrap();
                if matches_incr(module, prev, iv_addr).is_none() {
                    continue 'next_loop;
                }
            }
            let back = module.block(module.region(after).last_block()).last_op();
            if matches_incr(module, back, iv_addr).is_none() {
                continue;
            }

            // Find the initial value by scanning backwards from the loop.
            let mut runner = module.prev_op(looop).unwrap();
            let mut init = None;
            let mut removable = true;
            loop {
                if !module.op(runner).regions().is_empty() {
                    // A region storing to ivAddr hides the init. Give up.
                    for store in module.find_all(runner, SysOp::Store) {
                        if module.op(store).operand(1) == iv_addr {
                            continue 'next_loop;
                        }
                    }
                    // A preceding For over the same slot leaves exactly its
                    // stop value there.
                    if module.op(runner).kind() == SysOp::For
                        && module.op(runner).operand(3) == iv_addr
                    {
                        init = Some(module.op(runner).operand(1));
                        removable = false;
                        break;
                    }
                } else if module.op(runner).kind() == SysOp::Store
                    && module.op(runner).operand(1) == iv_addr
                {
                    init = Some(module.op(runner).operand(0));
                    break;
                } else if module.op(iv_addr).uses().contains(&runner) {
                    // The address is used between the store and the loop.
                    removable = false;
                }

                if module.at_front(runner) {
                    break;
                }
                runner = module.prev_op(runner).unwrap();
            }
            let Some(init) = init else { continue };

            // Hoist a constant increment defined inside the loop.
            if module.op(incr).kind() == SysOp::Int && module.inside(incr, looop) {
                module.move_op_before(incr, looop);
            }
            if removable {
                module.erase_op(runner);
            }

            let mut b = Builder::new(module);
            b.set_before_op(looop);
            // The ivAddr operand is unused by transforms but needed when
            // lowering back.
            let floop = b.create(SysOp::For, &[init, stop, incr, iv_addr], vec![]);
            let body = module.append_region(floop);

            for bb in module.region(after).blocks().to_vec() {
                module.move_block_to_end(bb, body);
            }

            // Splice the condition region in front and drop the Proceed.
            assert!(module.region(before).blocks().len() == 1);
            let bb = module.region(before).first_block();
            let last = module.block(bb).last_op();
            module.erase_op(last);
            module.inline_before(bb, floop);

            let mut remove = Vec::new();
            for &user in module.op(iv_addr).uses() {
                if !module.inside(user, floop) {
                    continue;
                }
                match module.op(user).kind() {
                    k if k == SysOp::Store => remove.push((user, false)),
                    k if k == SysOp::Load => remove.push((user, true)),
                    _ => {}
                }
            }
            for (op, is_load) in remove {
                if is_load {
                    module.replace_all_uses_with(op, floop);
                }
                module.erase_op(op);
            }

            module.erase_op(looop);
            self.raised += 1;
        }
        Ok(())
    }
}
