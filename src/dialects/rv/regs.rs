//! The RV64 register file, numbered architecturally: x0 is zero, x1 ra,
//! x2 sp, x5-x7/x28-x31 the temporaries, x8-x9/x18-x27 saved, x10-x17 the
//! arguments; the f-registers mirror the layout. s10/s11 (and fs10/fs11)
//! are reserved as dedicated spill registers, t6/ft11 breaks move cycles.

use crate::core::PReg;

pub const fn x(n: u8) -> PReg {
    PReg::gpr(n)
}

pub const fn f(n: u8) -> PReg {
    PReg::fpr(n)
}

pub const ZERO: PReg = x(0);
pub const RA: PReg = x(1);
pub const SP: PReg = x(2);

pub const SPILL: PReg = x(26); // s10
pub const SPILL2: PReg = x(31); // t6
pub const SPILL3: PReg = x(27); // s11
pub const FSPILL: PReg = f(26); // fs10
pub const FSPILL2: PReg = f(31); // ft11
pub const FSPILL3: PReg = f(27); // fs11

pub static ARG_REGS: [PReg; 8] = [x(10), x(11), x(12), x(13), x(14), x(15), x(16), x(17)];
pub static FARG_REGS: [PReg; 8] = [f(10), f(11), f(12), f(13), f(14), f(15), f(16), f(17)];

pub static CALLER_SAVED: [PReg; 28] = [
    RA,
    x(5), x(6), x(7), x(28), x(29), x(30),
    x(10), x(11), x(12), x(13), x(14), x(15), x(16), x(17),
    f(0), f(1), f(2), f(3), f(4), f(5),
    f(10), f(11), f(12), f(13), f(14), f(15), f(16),
];

pub static ORDER: [PReg; 24] = [
    x(10), x(11), x(12), x(13), x(14), x(15), x(16), x(17),
    x(5), x(6), x(7), x(28), x(29), x(30),
    x(8), x(9), x(18), x(19), x(20), x(21), x(22), x(23), x(24), x(25),
];

pub static ORDER_F: [PReg; 26] = [
    f(10), f(11), f(12), f(13), f(14), f(15), f(16), f(17),
    f(0), f(1), f(2), f(3), f(4), f(5), f(6), f(7),
    f(8), f(9), f(18), f(19), f(20), f(21), f(22), f(23), f(24), f(25),
];

pub fn callee_saved(reg: PReg) -> bool {
    matches!(reg.num, 8 | 9 | 18..=27)
}

pub fn show(reg: PReg) -> String {
    if reg.fp {
        return match reg.num {
            0..=7 => format!("ft{}", reg.num),
            8 | 9 => format!("fs{}", reg.num - 8),
            10..=17 => format!("fa{}", reg.num - 10),
            18..=27 => format!("fs{}", reg.num - 16),
            _ => format!("ft{}", reg.num - 24),
        };
    }
    match reg.num {
        0 => "zero".into(),
        1 => "ra".into(),
        2 => "sp".into(),
        3 => "gp".into(),
        4 => "tp".into(),
        5..=7 => format!("t{}", reg.num - 5),
        8 => "s0".into(),
        9 => "s1".into(),
        10..=17 => format!("a{}", reg.num - 10),
        18..=27 => format!("s{}", reg.num - 16),
        _ => format!("t{}", reg.num - 25),
    }
}
