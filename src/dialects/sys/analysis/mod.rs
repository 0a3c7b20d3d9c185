//! Analyses over the `sys` dialect: loop forests, memory shape (bases,
//! subscripts, no-store), call-graph pureness and parallelizability.

pub mod loops;
pub mod memory;
pub mod parallel;
pub mod pureness;

pub use loops::{LoopAnalysis, LoopForest, LoopInfo};
pub use memory::{base_of, may_alias, subscript_of, ArrayAccess, Base, NoStore};
pub use parallel::Parallelizable;
pub use pureness::Pureness;
