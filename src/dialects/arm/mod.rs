//! The AArch64 dialect: machine opcodes, the register file, and the
//! back-end pass pipeline for the target.

pub mod dump;
pub mod inst_combine;
mod intrinsics;
pub mod late_legalize;
pub mod lower;
pub mod peephole;
pub mod regs;
pub mod strength_reduct;
pub mod target;

pub use dump::Dump;
pub use inst_combine::InstCombine;
pub use intrinsics::ArmOp;
pub use late_legalize::LateLegalize;
pub use lower::Lower;
pub use peephole::RegPeephole;
pub use strength_reduct::StrengthReduct;
pub use target::{ArmTarget, TARGET};

use crate::backend::{MachineDce, RegAlloc};
use crate::core::PassManager;

/// The shared per-target pipeline: Lower, StrengthReduct, InstCombine,
/// DCE, RegAlloc, RegPeephole, LateLegalize, Dump.
pub fn pipeline() -> PassManager {
    let mut pm = PassManager::new();
    pm.push(Box::new(Lower));
    pm.push(Box::new(StrengthReduct::default()));
    pm.push(Box::new(InstCombine::default()));
    pm.push(Box::new(MachineDce::new(&TARGET)));
    pm.push(Box::new(RegAlloc::new(&TARGET)));
    pm.push(Box::new(RegPeephole::default()));
    pm.push(Box::new(LateLegalize));
    pm
}
