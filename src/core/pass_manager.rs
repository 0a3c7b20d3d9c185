//! The pass framework: transform passes run serially over the one module,
//! with deferred-erase release and phi retyping between passes; analysis
//! results are cached per (analysis type, op) in an [`AnalysisManager`] and
//! fetched back by downcast.

use std::any::TypeId;

use color_eyre::{eyre::bail, Report};
use downcast_rs::{impl_downcast, Downcast};
use rustc_hash::FxHashMap;

use crate::core::ir::{Module, OpId, OpKind, Ty};
use crate::dialects::sys::SysOp;

/// A transform over the whole module. Passes are stateless between runs
/// apart from their statistics counters.
pub trait Pass {
    fn name(&self) -> &'static str;

    fn run(&mut self, module: &mut Module) -> Result<(), Report>;

    /// Counters reported after the pass, e.g. `[("folded", 12)]`.
    fn stats(&self) -> Vec<(&'static str, usize)> {
        Vec::new()
    }
}

#[derive(Default)]
pub struct PassManager {
    passes: Vec<Box<dyn Pass>>,
}

impl PassManager {
    pub fn new() -> PassManager {
        PassManager::default()
    }

    pub fn push(&mut self, pass: Box<dyn Pass>) {
        self.passes.push(pass);
    }

    pub fn run(&mut self, module: &mut Module) -> Result<(), Report> {
        for pass in self.passes.iter_mut() {
            tracing::debug!(pass = pass.name(), "running");
            pass.run(module)?;
            cleanup(module);
            for (stat, count) in pass.stats() {
                tracing::info!(pass = pass.name(), stat, count);
            }
        }
        Ok(())
    }
}

/// Releases deferred erasures and puts phi result types right: a phi with
/// any f32 operand produces f32.
pub fn cleanup(module: &mut Module) {
    module.release();

    run_rewriter(module, SysOp::Phi, |m, phi| {
        if m.op(phi).result_ty() == Ty::F32 {
            return false;
        }
        for i in 0..m.op(phi).operand_count() {
            let operand = m.op(phi).operand(i);
            if m.op(operand).result_ty() == Ty::F32 {
                m.op_mut(phi).result_ty = Ty::F32;
                return true;
            }
        }
        false
    });
}

/// Applies `rewriter` to every op of `kind` under the module top until a
/// whole sweep changes nothing. A rewriter that never converges is a bug.
pub fn run_rewriter<F>(module: &mut Module, kind: impl Into<OpKind>, rewriter: F)
where
    F: FnMut(&mut Module, OpId) -> bool,
{
    let top = module.top();
    run_rewriter_at(module, top, kind, rewriter)
}

/// Same, scoped to the ops nested under `root`.
pub fn run_rewriter_at<F>(module: &mut Module, root: OpId, kind: impl Into<OpKind>, mut rewriter: F)
where
    F: FnMut(&mut Module, OpId) -> bool,
{
    let kind = kind.into();
    let mut total = 0;
    loop {
        total += 1;
        assert!(total <= 10000, "rewriter for {} hit an infinite loop", kind.name());

        let targets = module.find_all(root, kind);
        let mut success = false;
        for t in targets {
            if !module.is_dead(t) {
                success |= rewriter(module, t);
            }
        }
        if !success {
            break;
        }
    }
}

/// A cacheable analysis result. Implementations are plain data computed by
/// an associated constructor; the manager only stores and hands them back.
pub trait AnalysisResult: Downcast {
    fn name(&self) -> &'static str;
}
impl_downcast!(AnalysisResult);

/// Caches analysis results per (analysis type, target op). Passes create one
/// per run; there is no cross-pass staleness to manage.
#[derive(Default)]
pub struct AnalysisManager {
    cached: FxHashMap<(TypeId, OpId), Box<dyn AnalysisResult>>,
}

impl AnalysisManager {
    pub fn new() -> AnalysisManager {
        AnalysisManager::default()
    }

    /// Returns the cached result for `target`, computing it with `build` on
    /// a miss.
    pub fn get<T, F>(&mut self, target: OpId, build: F) -> &T
    where
        T: AnalysisResult,
        F: FnOnce() -> T,
    {
        self.cached
            .entry((TypeId::of::<T>(), target))
            .or_insert_with(|| Box::new(build()))
            .downcast_ref::<T>()
            .expect("analysis cache entry has the wrong type")
    }

    pub fn invalidate(&mut self) {
        self.cached.clear();
    }
}

/// Runtime library functions provided by the execution environment.
pub fn is_extern(name: &str) -> bool {
    matches!(
        name,
        "getint"
            | "getch"
            | "getfloat"
            | "getarray"
            | "getfarray"
            | "putint"
            | "putch"
            | "putfloat"
            | "putarray"
            | "putfarray"
            | "_sysy_starttime"
            | "_sysy_stoptime"
            | "starttime"
            | "stoptime"
    )
}

/// Convenience for pass code: fail with a report naming the offending op.
pub fn unsupported(module: &Module, op: OpId) -> Result<(), Report> {
    bail!("unsupported op: {}", module.display_op(op))
}
