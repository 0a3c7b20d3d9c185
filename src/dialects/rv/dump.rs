//! The RV64 assembly emitter. Loads and stores pick `lw`/`ld`/`flw` (and
//! the store forms) from the Size attr and register class at this point;
//! float mnemonics take their `.s` suffix here. Ble/Bgt emit as swapped
//! blt/bge.

use std::fmt::Write;

use color_eyre::Report;
use rustc_hash::FxHashMap;

use crate::core::{AttrKind, BlockId, Module, OpId, OpKind, Pass};
use crate::dialects::rv::intrinsics::RvOp;
use crate::dialects::rv::regs::show;

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

    fn op(&mut self, op: OpId, out: &mut String) {
        use RvOp::*;
        let m = self.module;
        let d = m.op(op);
        let v = |o: OpId| m.op(o).int_val();

        macro_rules! binary {
            ($name:literal) => {
                let _ = writeln!(
                    out,
                    concat!($name, " {}, {}, {}"),
                    show(d.rd()),
                    show(d.rs()),
                    show(d.rs2())
                );
            };
        }
        macro_rules! unary_i {
            ($name:literal) => {
                let _ = writeln!(
                    out,
                    concat!($name, " {}, {}, {}"),
                    show(d.rd()),
                    show(d.rs()),
                    v(op)
                );
            };
        }
        macro_rules! unary {
            ($name:literal) => {
                let _ = writeln!(out, concat!($name, " {}, {}"), show(d.rd()), show(d.rs()));
            };
        }
        macro_rules! jmp_binary {
            ($name:literal, $swap:expr) => {
                let t = d.target();
                let n = self.bb(t);
                let (a, b) = if $swap {
                    (show(d.rs2()), show(d.rs()))
                } else {
                    (show(d.rs()), show(d.rs2()))
                };
                let _ = writeln!(out, concat!($name, " {}, {}, .Lbb{}"), a, b, n);
            };
        }

        let OpKind::Rv(kind) = d.kind() else {
            panic!("unimplemented op: {}", m.display_op(op));
        };
        match kind {
            Li => {
                let _ = writeln!(out, "li {}, {}", show(d.rd()), v(op));
            }
            La => {
                let _ = writeln!(out, "la {}, {}", show(d.rd()), d.name());
            }
            Add => {
                binary!("add");
            }
            Addw => {
                binary!("addw");
            }
            Sub => {
                binary!("sub");
            }
            Subw => {
                binary!("subw");
            }
            Mul => {
                binary!("mul");
            }
            Mulw => {
                binary!("mulw");
            }
            Mulh => {
                binary!("mulh");
            }
            Mulhu => {
                binary!("mulhu");
            }
            Div => {
                binary!("div");
            }
            Divw => {
                binary!("divw");
            }
            Rem => {
                binary!("rem");
            }
            Remw => {
                binary!("remw");
            }
            Sll => {
                binary!("sll");
            }
            Sllw => {
                binary!("sllw");
            }
            Srl => {
                binary!("srl");
            }
            Srlw => {
                binary!("srlw");
            }
            Sra => {
                binary!("sra");
            }
            Sraw => {
                binary!("sraw");
            }
            And => {
                binary!("and");
            }
            Or => {
                binary!("or");
            }
            Xor => {
                binary!("xor");
            }
            Slt => {
                binary!("slt");
            }
            Addi => {
                unary_i!("addi");
            }
            Addiw => {
                unary_i!("addiw");
            }
            Slli => {
                unary_i!("slli");
            }
            Slliw => {
                unary_i!("slliw");
            }
            Srli => {
                unary_i!("srli");
            }
            Srliw => {
                unary_i!("srliw");
            }
            Srai => {
                unary_i!("srai");
            }
            Sraiw => {
                unary_i!("sraiw");
            }
            Andi => {
                unary_i!("andi");
            }
            Ori => {
                unary_i!("ori");
            }
            Xori => {
                unary_i!("xori");
            }
            Slti => {
                unary_i!("slti");
            }
            Seqz => {
                unary!("seqz");
            }
            Snez => {
                unary!("snez");
            }
            Mv => {
                unary!("mv");
            }
            Fmv => {
                unary!("fmv.s");
            }
            Fmvwx => {
                unary!("fmv.w.x");
            }
            Fmvdx => {
                unary!("fmv.d.x");
            }
            Fmvxd => {
                unary!("fmv.x.d");
            }
            Fcvtsw => {
                unary!("fcvt.s.w");
            }
            FcvtwsRtz => {
                let _ = writeln!(out, "fcvt.w.s {}, {}, rtz", show(d.rd()), show(d.rs()));
            }
            Feq => {
                binary!("feq.s");
            }
            Flt => {
                binary!("flt.s");
            }
            Fle => {
                binary!("fle.s");
            }
            Fadd => {
                binary!("fadd.s");
            }
            Fsub => {
                binary!("fsub.s");
            }
            Fmul => {
                binary!("fmul.s");
            }
            Fdiv => {
                binary!("fdiv.s");
            }
            Fmadd => {
                let _ = writeln!(
                    out,
                    "fmadd.s {}, {}, {}, {}",
                    show(d.rd()),
                    show(d.rs()),
                    show(d.rs2()),
                    show(d.rs3())
                );
            }
            J => {
                let t = d.target();
                let n = self.bb(t);
                let _ = writeln!(out, "j .Lbb{n}");
            }
            Beq => {
                jmp_binary!("beq", false);
            }
            Bne => {
                jmp_binary!("bne", false);
            }
            Blt => {
                jmp_binary!("blt", false);
            }
            Bge => {
                jmp_binary!("bge", false);
            }
            // The missing encodings take swapped operands.
            Ble => {
                jmp_binary!("bge", true);
            }
            Bgt => {
                jmp_binary!("blt", true);
            }
            Ret => {
                let _ = writeln!(out, "ret");
            }
            Call => {
                let _ = writeln!(out, "call {}", d.name());
            }
            Load => {
                let mnemonic = if d.rd().fp {
                    "flw"
                } else if d.size() == 8 {
                    "ld"
                } else {
                    "lw"
                };
                let _ = writeln!(
                    out,
                    "{} {}, {}({})",
                    mnemonic,
                    show(d.rd()),
                    v(op),
                    show(d.rs())
                );
            }
            Store => {
                let mnemonic = if d.rs().fp {
                    "fsw"
                } else if d.size() == 8 {
                    "sd"
                } else {
                    "sw"
                };
                let _ = writeln!(
                    out,
                    "{} {}, {}({})",
                    mnemonic,
                    show(d.rs()),
                    v(op),
                    show(d.rs2())
                );
            }
            Fld => {
                let _ = writeln!(out, "fld {}, {}({})", show(d.rd()), v(op), show(d.rs()));
            }
            Fsd => {
                let _ = writeln!(out, "fsd {}, {}({})", show(d.rs()), v(op), show(d.rs2()));
            }
            Join => {
                let name = d.name();
                let _ = writeln!(out, "la a0, _lock{name}");
                let _ = writeln!(out, "  call spinlock_wait");
            }
            Clone => {
                let name = d.name();
                let _ = writeln!(out, "la a0, {name}");
                let _ = writeln!(out, "  la a1, _stack{name}");
                let _ = writeln!(out, "  li a2, 8192");
                let _ = writeln!(out, "  add a1, a1, a2");
                let _ = writeln!(out, "  li a2, 1");
                let _ = writeln!(out, "  la a3, _lock{name}");
                let _ = writeln!(out, "  sd a2, 0(a3)");
                let _ = writeln!(out, "  call instantiate_worker");
            }
            Wake => {
                // Fence before the release store that drops the lock.
                let name = d.name();
                let _ = writeln!(out, "la a0, _lock{name}");
                let _ = writeln!(out, "  fence rw, w");
                let _ = writeln!(out, "  sw zero, 0(a0)");
            }
            other => panic!("unimplemented op: rv.{}", other.name()),
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
        "rv-dump"
    }

    fn run(&mut self, module: &mut Module) -> Result<(), Report> {
        self.out = dump(module);
        Ok(())
    }
}
