//! The AArch64 assembly emitter. A pure function of the fully-lowered
//! module: per-op stringification with w/x/s/d/v register-width spellings,
//! one label per function, `.Lbb<n>` block labels numbered lazily, `.data`
//! for initialized globals and `.bss` for zero-filled ones, and the
//! clone/join/wake snippets expanded inline for parallel loops.

use std::fmt::Write;

use color_eyre::Report;
use rustc_hash::FxHashMap;

use crate::core::{AttrKind, BlockId, Module, OpId, OpKind, Pass};
use crate::dialects::arm::intrinsics::ArmOp;
use crate::dialects::arm::regs::{dreg, freg, vreg, wreg, xreg};

#[derive(Default)]
pub struct Dump {
    pub out: String,
}

struct Emitter<'m> {
    module: &'m Module,
    labels: FxHashMap<BlockId, usize>,
    next: usize,
}

impl<'m> Emitter<'m> {
    fn bb(&mut self, bb: BlockId) -> usize {
        if let Some(&n) = self.labels.get(&bb) {
            return n;
        }
        let n = self.next;
        self.next += 1;
        self.labels.insert(bb, n);
        n
    }

    fn target(&mut self, op: OpId) -> usize {
        let t = self.module.op(op).target();
        self.bb(t)
    }

    fn op(&mut self, op: OpId, out: &mut String) {
        use ArmOp::*;
        let m = self.module;
        let d = m.op(op);
        let v = |o: OpId| m.op(o).int_val();

        macro_rules! ternary {
            ($name:literal, $r:ident) => {
                let _ = writeln!(
                    out,
                    concat!($name, " {}, {}, {}, {}"),
                    $r(d.rd()),
                    $r(d.rs()),
                    $r(d.rs2()),
                    $r(d.rs3())
                );
            };
        }
        macro_rules! binary {
            ($name:literal, $r:ident) => {
                let _ = writeln!(
                    out,
                    concat!($name, " {}, {}, {}"),
                    $r(d.rd()),
                    $r(d.rs()),
                    $r(d.rs2())
                );
            };
        }
        macro_rules! unary_i {
            ($name:literal, $r:ident) => {
                let _ = writeln!(
                    out,
                    concat!($name, " {}, {}, {}"),
                    $r(d.rd()),
                    $r(d.rs()),
                    v(op)
                );
            };
        }
        macro_rules! unary {
            ($name:literal, $r:ident) => {
                let _ = writeln!(out, concat!($name, " {}, {}"), $r(d.rd()), $r(d.rs()));
            };
        }
        macro_rules! cmp_cset {
            ($cmp:literal, $cond:literal, $r:ident) => {
                let _ = writeln!(out, concat!($cmp, " {}, {}"), $r(d.rs()), $r(d.rs2()));
                let _ = writeln!(out, concat!("  cset {}, ", $cond), wreg(d.rd()));
            };
        }
        macro_rules! jmp_binary {
            ($name:literal) => {
                let _ = writeln!(out, "cmp {}, {}", wreg(d.rs()), wreg(d.rs2()));
                let n = self.target(op);
                let _ = writeln!(out, concat!("  ", $name, " .Lbb{}"), n);
            };
        }
        macro_rules! mem {
            ($name:literal, $data:ident) => {
                let _ = writeln!(
                    out,
                    concat!($name, " {}, [{}, #{}]"),
                    $data(d.rd()),
                    xreg(d.rs()),
                    v(op)
                );
            };
        }
        macro_rules! mem_store {
            ($name:literal, $data:ident) => {
                let _ = writeln!(
                    out,
                    concat!($name, " {}, [{}, #{}]"),
                    $data(d.rs()),
                    xreg(d.rs2()),
                    v(op)
                );
            };
        }

        let OpKind::Arm(kind) = d.kind() else {
            panic!("unimplemented op: {}", m.display_op(op));
        };
        match kind {
            MsubW => {
                ternary!("msub", wreg);
            }
            MaddW => {
                ternary!("madd", wreg);
            }
            MsubX => {
                ternary!("msub", xreg);
            }
            MaddX => {
                ternary!("madd", xreg);
            }
            Fmadd => {
                ternary!("fmadd", freg);
            }
            Fmsub => {
                ternary!("fmsub", freg);
            }
            AddW => {
                binary!("add", wreg);
            }
            SubW => {
                binary!("sub", wreg);
            }
            MulW => {
                binary!("mul", wreg);
            }
            SdivW => {
                binary!("sdiv", wreg);
            }
            UdivW => {
                binary!("udiv", wreg);
            }
            AsrW => {
                binary!("asr", wreg);
            }
            LslW => {
                binary!("lslv", wreg);
            }
            LsrW => {
                binary!("lsr", wreg);
            }
            Fadd => {
                binary!("fadd", freg);
            }
            Fsub => {
                binary!("fsub", freg);
            }
            Fmul => {
                binary!("fmul", freg);
            }
            Fdiv => {
                binary!("fdiv", freg);
            }
            AddX => {
                binary!("add", xreg);
            }
            SubX => {
                binary!("sub", xreg);
            }
            MulX => {
                binary!("mul", xreg);
            }
            SdivX => {
                binary!("sdiv", xreg);
            }
            AsrX => {
                binary!("asr", xreg);
            }
            LslX => {
                binary!("lslv", xreg);
            }
            LsrX => {
                binary!("lsr", xreg);
            }
            And => {
                binary!("and", xreg);
            }
            Or => {
                binary!("orr", xreg);
            }
            Eor => {
                binary!("eor", xreg);
            }
            Mulsh => {
                // High half of a 64-bit product of 32-bit values.
                let _ = writeln!(
                    out,
                    "smull {}, {}, {}",
                    xreg(d.rd()),
                    wreg(d.rs()),
                    wreg(d.rs2())
                );
                let _ = writeln!(out, "  asr {}, {}, 32", xreg(d.rd()), xreg(d.rd()));
            }
            AddV => {
                binary!("add", vreg);
            }
            MulV => {
                binary!("mul", vreg);
            }
            MlaV => {
                ternary!("mla", vreg);
            }
            AddWI => {
                unary_i!("add", wreg);
            }
            LslWI => {
                unary_i!("lsl", wreg);
            }
            LsrWI => {
                unary_i!("lsr", wreg);
            }
            AsrWI => {
                unary_i!("asr", wreg);
            }
            AddXI => {
                unary_i!("add", xreg);
            }
            LslXI => {
                unary_i!("lsl", xreg);
            }
            LsrXI => {
                unary_i!("lsr", xreg);
            }
            AsrXI => {
                unary_i!("asr", xreg);
            }
            AndI => {
                unary_i!("and", xreg);
            }
            OrI => {
                unary_i!("orr", xreg);
            }
            EorI => {
                unary_i!("eor", xreg);
            }
            SubWI => {
                unary_i!("sub", wreg);
            }
            MovR => {
                unary!("mov", xreg);
            }
            Neg => {
                unary!("neg", wreg);
            }
            Fneg => {
                unary!("fneg", freg);
            }
            Fmov => {
                unary!("fmov", freg);
            }
            B => {
                let n = self.target(op);
                let _ = writeln!(out, "b .Lbb{n}");
            }
            Bne => {
                jmp_binary!("bne");
            }
            Beq => {
                jmp_binary!("beq");
            }
            Blt => {
                jmp_binary!("blt");
            }
            Ble => {
                jmp_binary!("ble");
            }
            Bgt => {
                jmp_binary!("bgt");
            }
            Bge => {
                jmp_binary!("bge");
            }
            Cbz => {
                let n = self.target(op);
                let _ = writeln!(out, "cbz {}, .Lbb{}", wreg(d.rs()), n);
            }
            Cbnz => {
                let n = self.target(op);
                let _ = writeln!(out, "cbnz {}, .Lbb{}", wreg(d.rs()), n);
            }
            Adr => {
                let name = d.name();
                let _ = writeln!(out, "adrp {}, {}", xreg(d.rd()), name);
                let _ = writeln!(out, "  add {}, {}, :lo12:{}", xreg(d.rd()), xreg(d.rd()), name);
            }
            FmovW => {
                let _ = writeln!(out, "fmov {}, {}", freg(d.rd()), wreg(d.rs()));
            }
            FmovD => {
                let _ = writeln!(out, "fmov {}, {}", xreg(d.rd()), dreg(d.rs()));
            }
            FmovX => {
                let _ = writeln!(out, "fmov {}, {}", dreg(d.rd()), xreg(d.rs()));
            }
            Bl => {
                let _ = writeln!(out, "bl {}", d.name());
            }
            StrX => {
                mem_store!("str", xreg);
            }
            StrW => {
                mem_store!("str", wreg);
            }
            StrF => {
                mem_store!("str", freg);
            }
            StrD => {
                mem_store!("str", dreg);
            }
            StpX => {
                let _ = writeln!(
                    out,
                    "stp {}, {}, [{}, #{}]",
                    xreg(d.rs()),
                    xreg(d.rs2()),
                    xreg(d.rs3()),
                    v(op)
                );
            }
            StpD => {
                let _ = writeln!(
                    out,
                    "stp {}, {}, [{}, #{}]",
                    dreg(d.rs()),
                    dreg(d.rs2()),
                    xreg(d.rs3()),
                    v(op)
                );
            }
            LdrX => {
                mem!("ldr", xreg);
            }
            LdrW => {
                mem!("ldr", wreg);
            }
            LdrF => {
                mem!("ldr", freg);
            }
            LdrD => {
                mem!("ldr", dreg);
            }
            LdpX => {
                let _ = writeln!(
                    out,
                    "ldp {}, {}, [{}, #{}]",
                    xreg(d.rs()),
                    xreg(d.rs2()),
                    xreg(d.rs3()),
                    v(op)
                );
            }
            LdpD => {
                let _ = writeln!(
                    out,
                    "ldp {}, {}, [{}, #{}]",
                    dreg(d.rs()),
                    dreg(d.rs2()),
                    xreg(d.rs3()),
                    v(op)
                );
            }
            LdrXP => {
                let _ = writeln!(out, "ldr {}, [{}], #{}", xreg(d.rd()), xreg(d.rs()), v(op));
            }
            LdrWP => {
                let _ = writeln!(out, "ldr {}, [{}], #{}", wreg(d.rd()), xreg(d.rs()), v(op));
            }
            LdrFP => {
                let _ = writeln!(out, "ldr {}, [{}], #{}", freg(d.rd()), xreg(d.rs()), v(op));
            }
            StrXP => {
                let _ = writeln!(out, "str {}, [{}], #{}", xreg(d.rs()), xreg(d.rs2()), v(op));
            }
            StrWP => {
                let _ = writeln!(out, "str {}, [{}], #{}", wreg(d.rs()), xreg(d.rs2()), v(op));
            }
            StrFP => {
                let _ = writeln!(out, "str {}, [{}], #{}", freg(d.rs()), xreg(d.rs2()), v(op));
            }
            CsetLt => {
                cmp_cset!("cmp", "lt", wreg);
            }
            CsetLe => {
                cmp_cset!("cmp", "le", wreg);
            }
            CsetNe => {
                cmp_cset!("cmp", "ne", wreg);
            }
            CsetEq => {
                cmp_cset!("cmp", "eq", wreg);
            }
            CsetLtF => {
                cmp_cset!("fcmp", "lt", freg);
            }
            CsetLeF => {
                cmp_cset!("fcmp", "le", freg);
            }
            CsetNeF => {
                cmp_cset!("fcmp", "ne", freg);
            }
            CsetEqF => {
                cmp_cset!("fcmp", "eq", freg);
            }
            CsetEqFcmpZ => {
                let _ = writeln!(out, "fcmp {}, #0.0", freg(d.rs()));
                let _ = writeln!(out, "  cset {}, eq", wreg(d.rd()));
            }
            CsetNeFcmpZ => {
                let _ = writeln!(out, "fcmp {}, #0.0", freg(d.rs()));
                let _ = writeln!(out, "  cset {}, ne", wreg(d.rd()));
            }
            CsetNeTst => {
                let _ = writeln!(out, "tst {}, {}", wreg(d.rs()), wreg(d.rs2()));
                let _ = writeln!(out, "  cset {}, ne", wreg(d.rd()));
            }
            CsetEqTst => {
                let _ = writeln!(out, "tst {}, {}", wreg(d.rs()), wreg(d.rs2()));
                let _ = writeln!(out, "  cset {}, eq", wreg(d.rd()));
            }
            CselNeZ => {
                let _ = writeln!(out, "cmp {}, #0", wreg(d.rs()));
                let _ = writeln!(
                    out,
                    "  csel {}, {}, {}, ne",
                    wreg(d.rd()),
                    wreg(d.rs2()),
                    wreg(d.rs3())
                );
            }
            CselLtZ => {
                let _ = writeln!(out, "cmp {}, #0", wreg(d.rs()));
                let _ = writeln!(
                    out,
                    "  csel {}, {}, {}, lt",
                    wreg(d.rd()),
                    wreg(d.rs2()),
                    wreg(d.rs3())
                );
            }
            CnegLtZ => {
                let _ = writeln!(out, "cmp {}, #0", wreg(d.rs()));
                let _ = writeln!(out, "  cneg {}, {}, lt", wreg(d.rd()), wreg(d.rs2()));
            }
            Ret => {
                let _ = writeln!(out, "ret");
            }
            Scvtf => {
                let _ = writeln!(out, "scvtf {}, {}", freg(d.rd()), wreg(d.rs()));
            }
            Fcvtzs => {
                let _ = writeln!(out, "fcvtzs {}, {}", wreg(d.rd()), freg(d.rs()));
            }
            MovI => {
                let _ = writeln!(out, "mov {}, {}", wreg(d.rd()), v(op));
            }
            Movn => {
                let _ = writeln!(out, "movn {}, {}", wreg(d.rd()), v(op));
            }
            Movk => {
                let lsl = match d.attr(AttrKind::Lsl) {
                    crate::core::Attr::Lsl(l) => *l,
                    _ => unreachable!(),
                };
                let _ = writeln!(out, "movk {}, {}, lsl {}", wreg(d.rd()), v(op), lsl);
            }
            AddWL => {
                let _ = writeln!(
                    out,
                    "add {}, {}, {}, lsl {}",
                    wreg(d.rd()),
                    wreg(d.rs()),
                    wreg(d.rs2()),
                    v(op)
                );
            }
            AddXL => {
                let _ = writeln!(
                    out,
                    "add {}, {}, {}, lsl {}",
                    xreg(d.rd()),
                    xreg(d.rs()),
                    xreg(d.rs2()),
                    v(op)
                );
            }
            AddWR => {
                let _ = writeln!(
                    out,
                    "add {}, {}, {}, lsr {}",
                    wreg(d.rd()),
                    wreg(d.rs()),
                    wreg(d.rs2()),
                    v(op)
                );
            }
            AddWAR => {
                let _ = writeln!(
                    out,
                    "add {}, {}, {}, asr {}",
                    wreg(d.rd()),
                    wreg(d.rs()),
                    wreg(d.rs2()),
                    v(op)
                );
            }
            LdrWR | LdrXR | LdrFR => {
                let data = match kind {
                    LdrWR => wreg(d.rd()),
                    LdrXR => xreg(d.rd()),
                    _ => freg(d.rd()),
                };
                let _ = write!(out, "ldr {}, [{}, {}", data, xreg(d.rs()), xreg(d.rs2()));
                if v(op) != 0 {
                    let _ = write!(out, ", lsl {}", v(op));
                }
                let _ = writeln!(out, "]");
            }
            StrWR | StrXR | StrFR => {
                let data = match kind {
                    StrWR => wreg(d.rs()),
                    StrXR => xreg(d.rs()),
                    _ => freg(d.rs()),
                };
                let _ = write!(out, "str {}, [{}, {}", data, xreg(d.rs2()), xreg(d.rs3()));
                if v(op) != 0 {
                    let _ = write!(out, ", lsl {}", v(op));
                }
                let _ = writeln!(out, "]");
            }
            Smull => {
                let _ = writeln!(
                    out,
                    "smull {}, {}, {}",
                    xreg(d.rd()),
                    wreg(d.rs()),
                    wreg(d.rs2())
                );
            }
            Dup => {
                let _ = writeln!(out, "dup {}, {}", vreg(d.rd()), wreg(d.rs()));
            }
            St1 => {
                let _ = writeln!(out, "st1 {{{}}}, [{}]", vreg(d.rs()), xreg(d.rs2()));
            }
            Ld1 => {
                let _ = writeln!(out, "ld1 {{{}}}, [{}]", vreg(d.rd()), xreg(d.rs()));
            }
            Join => {
                let name = d.name();
                let _ = writeln!(out, "adrp x0, _lock{name}");
                let _ = writeln!(out, "  add x0, x0, :lo12:_lock{name}");
                let _ = writeln!(out, "  bl spinlock_wait");
            }
            Clone => {
                let name = d.name();
                let _ = writeln!(out, "adrp x0, {name}");
                let _ = writeln!(out, "  add x0, x0, :lo12:{name}");
                let _ = writeln!(out, "  adrp x1, _stack{name}");
                let _ = writeln!(out, "  add x1, x1, :lo12:_stack{name}");
                let _ = writeln!(out, "  add x1, x1, #8192");
                let _ = writeln!(out, "  mov x2, #1");
                let _ = writeln!(out, "  adrp x3, _lock{name}");
                let _ = writeln!(out, "  add x3, x3, :lo12:_lock{name}");
                let _ = writeln!(out, "  str x2, [x3]");
                let _ = writeln!(out, "  bl instantiate_worker");
            }
            Wake => {
                // Data barrier before the release store that drops the lock.
                let name = d.name();
                let _ = writeln!(out, "adrp x0, _lock{name}");
                let _ = writeln!(out, "  add x0, x0, :lo12:_lock{name}");
                let _ = writeln!(out, "  dmb ish");
                let _ = writeln!(out, "  mov w1, #0");
                let _ = writeln!(out, "  stlr w1, [x0]");
            }
            other => panic!("unimplemented op: arm.{}", other.name()),
        }
    }
}

/// Emits the whole module as one assembly file.
pub fn dump(module: &Module) -> String {
    let mut e = Emitter { module, labels: FxHashMap::default(), next: 0 };
    let mut out = String::new();
    let _ = writeln!(out, ".global main\n");

    for func in module.funcs() {
        let _ = writeln!(out, "{}:", module.op(func).name());
        let region = module.func_region(func);
        for &bb in module.region(region).blocks() {
            let n = e.bb(bb);
            let _ = writeln!(out, ".Lbb{n}:");
            for &op in module.block(bb).ops() {
                let _ = write!(out, "  ");
                e.op(op, &mut out);
            }
        }
        let _ = writeln!(out, "\n");
    }

    dump_globals(module, &mut out);
    out
}

fn dump_globals(module: &Module, out: &mut String) {
    let globals = module.globals();
    if globals.is_empty() {
        return;
    }

    let _ = writeln!(out, "\n\n.section .data\n.balign 16");
    let mut bss = Vec::new();
    for global in globals {
        let d = module.op(global);
        let size = d.size();
        assert!(size >= 1);

        if let Some(crate::core::Attr::IntArray(vs)) = d.find_attr(AttrKind::IntArray) {
            if vs.iter().all(|&x| x == 0) {
                bss.push(global);
                continue;
            }
            let _ = writeln!(out, "{}:", d.name());
            let words: Vec<String> =
                vs.iter().take(size / 4).map(|x| x.to_string()).collect();
            let _ = writeln!(out, "  .word {}", words.join(", "));
        }
        if let Some(crate::core::Attr::FloatArray(vs)) = d.find_attr(AttrKind::FloatArray) {
            if vs.iter().all(|&x| x == 0.0) {
                bss.push(global);
                continue;
            }
            let _ = writeln!(out, "{}:", d.name());
            let words: Vec<String> =
                vs.iter().take(size / 4).map(|x| x.to_string()).collect();
            let _ = writeln!(out, "  .float {}", words.join(", "));
        }
    }

    if !bss.is_empty() {
        let _ = writeln!(out, "\n\n.section .bss");
        for global in bss {
            let _ = writeln!(out, ".balign 16");
            let _ = writeln!(out, "{}:", module.op(global).name());
            let _ = writeln!(out, "  .skip {}", module.op(global).size());
        }
    }
}

impl Pass for Dump {
    fn name(&self) -> &'static str {
        "arm-dump"
    }

    fn run(&mut self, module: &mut Module) -> Result<(), Report> {
        self.out = dump(module);
        Ok(())
    }
}
