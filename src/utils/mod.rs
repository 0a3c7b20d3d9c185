//! Small self-contained utilities: a presburger basic-set emptiness
//! tester for affine constraint systems, and the bitvector rule matcher
//! kept for superoptimization experiments.

pub mod bv;
pub mod presburger;

pub use bv::{BvContext, BvExpr, BvKind, BvRef, BvRule};
pub use presburger::{AffineExpr, BasicSet};
