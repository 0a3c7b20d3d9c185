//! Core functionality: IR substrate and arena, attribute storage, the
//! builder, CFG analyses (dominance, liveness), the pass manager and the
//! printer.

mod attributes;
mod builder;
mod diagnostics;
mod display;
mod dominance;
mod ir;
mod liveness;
mod pass_manager;
mod verifier;

// Public API.
pub use self::{
    attributes::{AliasInfo, Attr, AttrKind, Increase, PReg, Spill},
    builder::{Builder, Cursor},
    diagnostics::{diagnostics_color_disable, diagnostics_setup},
    display::OpDisplay,
    ir::{BlockData, BlockId, Module, OpData, OpId, OpKind, RegionData, RegionId, Ty, Value},
    pass_manager::{
        cleanup, is_extern, run_rewriter, run_rewriter_at, unsupported, AnalysisManager,
        AnalysisResult, Pass, PassManager,
    },
    verifier::assert_phi_shape,
};
