//! Attribute storage for ops.
//!
//! Every attribute is one variant of the [`Attr`] enum, carried by ops as an
//! ordered list of `Rc<Attr>`. Sharing is by reference count: `Builder::copy`
//! and op construction clone the `Rc`, and in-place mutation goes through
//! `Rc::make_mut`, so a shared attribute is split off before it is edited.

use std::collections::BTreeMap;
use std::fmt;

use crate::core::ir::{BlockId, OpId};

/// A physical register in target-independent shape: the target dialects
/// decide what `num` means (on AArch64 gpr 31 is `sp` and 32 is `xzr`).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct PReg {
    pub fp: bool,
    pub num: u8,
}

impl PReg {
    pub const fn gpr(num: u8) -> PReg {
        PReg { fp: false, num }
    }

    pub const fn fpr(num: u8) -> PReg {
        PReg { fp: true, num }
    }
}

impl fmt::Display for PReg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}{}", if self.fp { "f" } else { "r" }, self.num)
    }
}

/// Alias summary for an address-producing op.
///
/// `location[base]` is the set of possible byte offsets from `base`, where
/// `base` is an `Alloca` or a `Global` (the `Global` rather than the
/// `GetGlobal`, so summaries of different uses deduplicate). A negative
/// offset means "unknown offset from this base"; the source language has no
/// negative subscripts, so the encoding is unambiguous.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct AliasInfo {
    pub location: BTreeMap<OpId, Vec<i32>>,
    pub unknown: bool,
}

impl AliasInfo {
    pub fn top() -> AliasInfo {
        AliasInfo { location: BTreeMap::new(), unknown: true }
    }

    pub fn single(base: OpId, offset: i32) -> AliasInfo {
        AliasInfo { location: BTreeMap::from([(base, vec![offset])]), unknown: false }
    }

    /// Returns true if the summary changed.
    pub fn add(&mut self, base: OpId, offset: i32) -> bool {
        if self.unknown {
            return false;
        }

        if offset < 0 {
            match self.location.get_mut(&base) {
                None => {
                    self.location.insert(base, vec![-1]);
                    true
                }
                Some(vec) => {
                    if vec.len() == 1 && vec[0] == -1 {
                        return false;
                    }
                    *vec = vec![-1];
                    true
                }
            }
        } else {
            let vec = self.location.entry(base).or_default();
            if vec.len() == 1 && vec[0] == -1 {
                return false;
            }
            if vec.contains(&offset) {
                return false;
            }
            vec.push(offset);
            true
        }
    }

    /// Returns true if the summary changed.
    pub fn add_all(&mut self, other: &AliasInfo) -> bool {
        if self.unknown {
            return false;
        }
        let mut changed = false;
        for (base, offsets) in &other.location {
            for &o in offsets {
                changed |= self.add(*base, o);
            }
        }
        changed
    }

    pub fn must_alias(&self, other: &AliasInfo) -> bool {
        if self.unknown || other.unknown {
            return false;
        }
        if self.location != other.location || self.location.len() != 1 {
            return false;
        }
        let (_, offsets) = self.location.iter().next().unwrap();
        offsets.len() == 1 && offsets[0] != -1
    }

    pub fn never_alias(&self, other: &AliasInfo) -> bool {
        if self.unknown || other.unknown {
            return false;
        }

        for (base, offsets) in &self.location {
            let Some(offsets2) = other.location.get(base) else {
                continue;
            };
            if offsets.iter().any(|&o| o < 0) || offsets2.iter().any(|&o| o < 0) {
                return false;
            }
            for o1 in offsets {
                if offsets2.contains(o1) {
                    return false;
                }
            }
        }
        true
    }

    pub fn may_alias(&self, other: &AliasInfo) -> bool {
        !self.never_alias(other)
    }
}

/// Per-iteration evolution of an induction value: the value increases by
/// `amt[0] + amt[1]*i + amt[2]*i^2` every iteration, optionally reduced by
/// a constant modulus afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct Increase {
    pub amt: Vec<i64>,
    pub modulus: Option<i64>,
}

impl Increase {
    pub fn constant(step: i64) -> Increase {
        Increase { amt: vec![step], modulus: None }
    }

    pub fn is_constant(&self) -> bool {
        self.amt.len() == 1
    }

    pub fn value(&self) -> i64 {
        self.amt[0]
    }
}

/// A spilled def or use: its slot offset (negative offsets name a
/// callee-saved FP register standing in for the slot), the register class,
/// and the defining op so cheap constants rematerialize instead of
/// reloading.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Spill {
    pub offset: i64,
    pub fp: bool,
    pub from: OpId,
}

/// The attribute kinds, used for lookups on the ordered attribute list.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AttrKind {
    Int,
    Float,
    Size,
    Name,
    Target,
    Else,
    From,
    IntArray,
    FloatArray,
    Impure,
    NoStore,
    Once,
    ArgCount,
    Callers,
    Alias,
    Range,
    Fp,
    Variant,
    Positive,
    Increase,
    Dims,
    Parallel,
    Subscript,
    Base,
    StackOffset,
    Lsl,
    Reg,
    Rd,
    Rs,
    Rs2,
    Rs3,
    SpilledRd,
    SpilledRs,
    SpilledRs2,
    SpilledRs3,
    Remat,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Attr {
    /// Compile-time integer constant.
    Int(i32),
    /// Compile-time float constant.
    Float(f32),
    /// Byte count of a memory op, alloca or global.
    Size(usize),
    /// Symbol name of a function, global or call.
    Name(String),
    /// Jump target for `Goto`, and for `Branch` when the condition holds.
    Target(BlockId),
    /// `Branch` target when the condition is false.
    Else(BlockId),
    /// Incoming predecessor of the phi operand at the same index.
    From(BlockId),
    /// Global initializer payload, element count = declared size.
    IntArray(Vec<i32>),
    FloatArray(Vec<f32>),
    /// The op (function or call) may write observable state.
    Impure,
    /// The function never stores to caller-visible memory.
    NoStore,
    /// Function runs at most once; inlined regardless of size.
    Once,
    ArgCount(usize),
    /// Names of the functions calling the annotated function.
    Callers(Vec<String>),
    Alias(AliasInfo),
    /// Closed interval for an integer value.
    Range(i32, i32),
    /// Marks a floating-point alloca (the result type is always i64).
    Fp,
    /// Marks a value as loop-variant during LICM.
    Variant,
    Positive,
    Increase(Increase),
    Dims(Vec<i32>),
    /// The surrounding `For` is safe to split across threads.
    Parallel,
    /// Affine subscript vector: coefficient per loop depth, then the
    /// constant term.
    Subscript(Vec<i64>),
    /// Base pointer (alloca or global) of an address computation.
    Base(OpId),
    StackOffset(i64),
    /// Shift amount carried by ARM wide-immediate moves.
    Lsl(i32),
    /// Pre-colored register of a `WriteReg`/`ReadReg`/placeholder.
    Reg(PReg),
    Rd(PReg),
    Rs(PReg),
    Rs2(PReg),
    Rs3(PReg),
    /// Stack slot of a spilled def/use.
    SpilledRd(Spill),
    SpilledRs(Spill),
    SpilledRs2(Spill),
    SpilledRs3(Spill),
    /// Cheap to recompute; reload by rematerializing, not from the slot.
    Remat,
}

impl Attr {
    pub fn kind(&self) -> AttrKind {
        match self {
            Attr::Int(..) => AttrKind::Int,
            Attr::Float(..) => AttrKind::Float,
            Attr::Size(..) => AttrKind::Size,
            Attr::Name(..) => AttrKind::Name,
            Attr::Target(..) => AttrKind::Target,
            Attr::Else(..) => AttrKind::Else,
            Attr::From(..) => AttrKind::From,
            Attr::IntArray(..) => AttrKind::IntArray,
            Attr::FloatArray(..) => AttrKind::FloatArray,
            Attr::Impure => AttrKind::Impure,
            Attr::NoStore => AttrKind::NoStore,
            Attr::Once => AttrKind::Once,
            Attr::ArgCount(..) => AttrKind::ArgCount,
            Attr::Callers(..) => AttrKind::Callers,
            Attr::Alias(..) => AttrKind::Alias,
            Attr::Range(..) => AttrKind::Range,
            Attr::Fp => AttrKind::Fp,
            Attr::Variant => AttrKind::Variant,
            Attr::Positive => AttrKind::Positive,
            Attr::Increase(..) => AttrKind::Increase,
            Attr::Dims(..) => AttrKind::Dims,
            Attr::Parallel => AttrKind::Parallel,
            Attr::Subscript(..) => AttrKind::Subscript,
            Attr::Base(..) => AttrKind::Base,
            Attr::StackOffset(..) => AttrKind::StackOffset,
            Attr::Lsl(..) => AttrKind::Lsl,
            Attr::Reg(..) => AttrKind::Reg,
            Attr::Rd(..) => AttrKind::Rd,
            Attr::Rs(..) => AttrKind::Rs,
            Attr::Rs2(..) => AttrKind::Rs2,
            Attr::Rs3(..) => AttrKind::Rs3,
            Attr::SpilledRd(..) => AttrKind::SpilledRd,
            Attr::SpilledRs(..) => AttrKind::SpilledRs,
            Attr::SpilledRs2(..) => AttrKind::SpilledRs2,
            Attr::SpilledRs3(..) => AttrKind::SpilledRs3,
            Attr::Remat => AttrKind::Remat,
        }
    }

    pub fn as_reg(&self) -> PReg {
        match self {
            Attr::Reg(r) | Attr::Rd(r) | Attr::Rs(r) | Attr::Rs2(r) | Attr::Rs3(r) => *r,
            other => panic!("attribute {other:?} carries no register"),
        }
    }

    pub fn as_spill(&self) -> Spill {
        match self {
            Attr::SpilledRd(s) | Attr::SpilledRs(s) | Attr::SpilledRs2(s)
            | Attr::SpilledRs3(s) => *s,
            other => panic!("attribute {other:?} carries no spill slot"),
        }
    }
}
