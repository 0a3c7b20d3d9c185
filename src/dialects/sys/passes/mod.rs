//! The machine-independent pass suite over the `sys` dialect.

pub mod canonicalize_loop;
pub mod dce;
pub mod early_const_fold;
pub mod early_inline;
pub mod flatten_cfg;
pub mod gcm;
pub mod gvn;
pub mod inst_schedule;
pub mod licm;
pub mod localize;
pub mod loop_dce;
pub mod loop_rotate;
pub mod lower_for;
pub mod mem2reg;
pub mod move_alloca;
pub mod parallelize;
pub mod raise_to_for;
pub mod regular_fold;
pub mod remerge;
pub mod remove_empty_loop;
pub mod scev;
pub mod tco;
pub mod tidy_memory;
pub mod unroll;
pub mod vectorize;

pub use canonicalize_loop::CanonicalizeLoop;
pub use dce::Dce;
pub use early_const_fold::EarlyConstFold;
pub use early_inline::EarlyInline;
pub use flatten_cfg::FlattenCfg;
pub use gcm::Gcm;
pub use gvn::Gvn;
pub use inst_schedule::InstSchedule;
pub use licm::Licm;
pub use localize::Localize;
pub use loop_dce::LoopDce;
pub use loop_rotate::LoopRotate;
pub use lower_for::LowerFor;
pub use mem2reg::Mem2Reg;
pub use move_alloca::MoveAlloca;
pub use parallelize::Parallelize;
pub use raise_to_for::RaiseToFor;
pub use regular_fold::{remove_phi_operand, tidy_phi, RegularFold};
pub use remerge::Remerge;
pub use remove_empty_loop::RemoveEmptyLoop;
pub use scev::Scev;
pub use tco::Tco;
pub use tidy_memory::TidyMemory;
pub use unroll::ConstLoopUnroll;
pub use vectorize::Vectorize;

use crate::core::{Module, Pass, PassManager};
use color_eyre::Report;

/// Pureness runs as a pass so pipelines can re-derive the call graph after
/// structural rewrites.
#[derive(Default)]
pub struct Pureness;

impl Pass for Pureness {
    fn name(&self) -> &'static str {
        "pureness"
    }

    fn run(&mut self, module: &mut Module) -> Result<(), Report> {
        crate::dialects::sys::analysis::Pureness::run(module);
        Ok(())
    }
}

/// The structured-IR pipeline, from the frontend output to right before
/// CFG flattening.
pub fn pre_flatten_pipeline(parallel: bool) -> PassManager {
    let mut pm = PassManager::new();
    pm.push(Box::new(EarlyConstFold::new(true)));
    pm.push(Box::new(Pureness));
    pm.push(Box::new(EarlyConstFold::new(false)));
    pm.push(Box::new(MoveAlloca));
    pm.push(Box::new(Localize::new(true)));
    pm.push(Box::new(EarlyInline));
    pm.push(Box::new(Pureness));
    pm.push(Box::new(Tco::default()));
    pm.push(Box::new(Remerge));
    pm.push(Box::new(TidyMemory::default()));
    pm.push(Box::new(RaiseToFor::default()));
    if parallel {
        pm.push(Box::new(Parallelize::default()));
    }
    pm.push(Box::new(LoopDce::default()));
    pm.push(Box::new(Dce::default()));
    pm.push(Box::new(LowerFor));
    pm
}

/// The SSA/loop pipeline over the flattened CFG.
pub fn flat_pipeline() -> PassManager {
    let mut pm = PassManager::new();
    pm.push(Box::new(FlattenCfg));
    pm.push(Box::new(Mem2Reg::default()));
    pm.push(Box::new(RegularFold::default()));
    pm.push(Box::new(Gvn::default()));
    pm.push(Box::new(Gcm::default()));
    pm.push(Box::new(CanonicalizeLoop::new(true)));
    pm.push(Box::new(LoopRotate::default()));
    pm.push(Box::new(Licm::default()));
    pm.push(Box::new(ConstLoopUnroll::default()));
    pm.push(Box::new(RegularFold::default()));
    pm.push(Box::new(Gvn::default()));
    pm.push(Box::new(Scev::default()));
    pm.push(Box::new(RemoveEmptyLoop::default()));
    pm.push(Box::new(Vectorize::default()));
    pm.push(Box::new(InstSchedule));
    pm.push(Box::new(Dce::default()));
    pm
}
