//! The AArch64 register file.
//!
//! Gpr numbering follows the architecture: 0-30 are x0..x30, 31 is sp and
//! 32 stands for xzr (x31 reads as either depending on context, so the two
//! meanings get separate numbers). FP registers are v0..v31. Dedicated
//! spill registers keep the allocator simple: x28/x15/x29 and v31/v15/v30.

use crate::core::PReg;

pub const fn x(n: u8) -> PReg {
    PReg::gpr(n)
}

pub const fn v(n: u8) -> PReg {
    PReg::fpr(n)
}

pub const SP: PReg = PReg::gpr(31);
pub const XZR: PReg = PReg::gpr(32);
pub const RA: PReg = PReg::gpr(30);

pub const SPILL: PReg = x(28);
pub const SPILL2: PReg = x(15);
pub const SPILL3: PReg = x(29);
pub const FSPILL: PReg = v(31);
pub const FSPILL2: PReg = v(15);
pub const FSPILL3: PReg = v(30);

pub static ARG_REGS: [PReg; 8] = [x(0), x(1), x(2), x(3), x(4), x(5), x(6), x(7)];
pub static FARG_REGS: [PReg; 8] = [v(0), v(1), v(2), v(3), v(4), v(5), v(6), v(7)];

// x8 is the indirect result register (unused here); x16-x18 are reserved.
pub static CALLER_SAVED: [PReg; 26] = [
    x(0), x(1), x(2), x(3), x(4), x(5), x(6), x(7),
    x(8), x(9), x(10), x(11), x(12), x(13), x(14),
    v(0), v(1), v(2), v(3), v(4), v(5), v(6), v(7),
    v(8), v(9), v(10),
];

pub static ORDER: [PReg; 26] = [
    x(0), x(1), x(2), x(3), x(4), x(5), x(6), x(7),
    x(8), x(9), x(10), x(11), x(12), x(13), x(14),
    x(16), x(17),
    x(19), x(20), x(21), x(22), x(23), x(24), x(25), x(26), x(27),
];

pub static ORDER_F: [PReg; 27] = [
    v(0), v(1), v(2), v(3), v(4), v(5), v(6), v(7),
    v(8), v(9), v(10), v(11), v(12), v(13), v(14),
    v(16), v(17), v(18), v(19), v(20), v(21), v(22), v(23), v(24), v(25), v(26), v(27),
];

pub fn callee_saved(reg: PReg) -> bool {
    if reg.fp {
        (16..=31).contains(&reg.num)
    } else {
        (19..=29).contains(&reg.num)
    }
}

/// The x-register spelling (`x12`, `sp`, `xzr`).
pub fn xreg(reg: PReg) -> String {
    match reg {
        SP => "sp".into(),
        XZR => "xzr".into(),
        r if r.fp => panic!("fp register {r} used as x"),
        r => format!("x{}", r.num),
    }
}

/// The w-register spelling; wzr for the zero register.
pub fn wreg(reg: PReg) -> String {
    match reg {
        XZR => "wzr".into(),
        r if r.fp => panic!("fp register {r} used as w"),
        r => format!("w{}", r.num),
    }
}

pub fn freg(reg: PReg) -> String {
    assert!(reg.fp, "gpr {reg} used as s");
    format!("s{}", reg.num)
}

pub fn dreg(reg: PReg) -> String {
    assert!(reg.fp, "gpr {reg} used as d");
    format!("d{}", reg.num)
}

/// The 4-lane vector spelling.
pub fn vreg(reg: PReg) -> String {
    assert!(reg.fp, "gpr {reg} used as v");
    format!("v{}.4s", reg.num)
}
