//! Human-readable IR printing.
//!
//! Values print as `%N` and blocks as `bbN`; numbers are handed out lazily
//! by a per-module printer state so repeated dumps of the same module stay
//! stable. Nested regions indent, block headers show preds / dominance
//! frontier / idom when they are populated.

use std::fmt::{self, Write};

use indenter::indented;
use rustc_hash::FxHashMap;
use yansi::Paint;

use crate::core::attributes::Attr;
use crate::core::ir::{BlockId, Module, OpId};
use crate::core::ir::Ty;

#[derive(Debug, Default)]
pub struct PrinterState {
    value_names: FxHashMap<OpId, usize>,
    next_value: usize,
    block_names: FxHashMap<BlockId, usize>,
    next_block: usize,
}

impl Module {
    pub fn value_number(&self, op: OpId) -> usize {
        let mut state = self.printer.borrow_mut();
        if let Some(&n) = state.value_names.get(&op) {
            return n;
        }
        let n = state.next_value;
        state.next_value += 1;
        state.value_names.insert(op, n);
        n
    }

    pub fn block_number(&self, bb: BlockId) -> usize {
        let mut state = self.printer.borrow_mut();
        if let Some(&n) = state.block_names.get(&bb) {
            return n;
        }
        let n = state.next_block;
        state.next_block += 1;
        state.block_names.insert(bb, n);
        n
    }

    pub fn display_op(&self, op: OpId) -> OpDisplay<'_> {
        OpDisplay { module: self, op }
    }

    pub fn display(&self) -> OpDisplay<'_> {
        self.display_op(self.top)
    }

    fn attr_string(&self, attr: &Attr) -> String {
        match attr {
            Attr::Int(v) => format!("<{v}>"),
            Attr::Float(v) => format!("<{v}f>"),
            Attr::Size(v) => format!("<size = {v}>"),
            Attr::Name(v) => format!("<name = {v}>"),
            Attr::Target(bb) => format!("<bb{}>", self.block_number(*bb)),
            Attr::Else(bb) => format!("<else = bb{}>", self.block_number(*bb)),
            Attr::From(bb) => format!("<from = bb{}>", self.block_number(*bb)),
            Attr::IntArray(vs) => {
                if vs.iter().all(|&v| v == 0) {
                    format!("<array = 0 x {}>", vs.len())
                } else {
                    let body: Vec<String> = vs.iter().map(|v| v.to_string()).collect();
                    format!("<array = {}>", body.join(", "))
                }
            }
            Attr::FloatArray(vs) => {
                if vs.iter().all(|&v| v == 0.0) {
                    format!("<array = 0.0f x {}>", vs.len())
                } else {
                    let body: Vec<String> = vs.iter().map(|v| format!("{v}f")).collect();
                    format!("<array = {}>", body.join(", "))
                }
            }
            Attr::Impure => "<impure>".into(),
            Attr::NoStore => "<nostore>".into(),
            Attr::Once => "<once>".into(),
            Attr::ArgCount(v) => format!("<count = {v}>"),
            Attr::Callers(callers) => {
                if callers.is_empty() {
                    "<no caller>".into()
                } else {
                    format!("<caller = {}>", callers.join(", "))
                }
            }
            Attr::Alias(info) => {
                if info.unknown {
                    return "<alias = unknown>".into();
                }
                if info.location.is_empty() {
                    return "<alias = none>".into();
                }
                let mut parts = Vec::new();
                for (base, offsets) in &info.location {
                    let offs: Vec<String> = offsets.iter().map(|o| o.to_string()).collect();
                    parts.push(format!("%{}: {}", self.value_number(*base), offs.join(", ")));
                }
                format!("<alias = {}>", parts.join("; "))
            }
            Attr::Range(low, high) => {
                if *low == i32::MIN && *high == i32::MAX {
                    "<range = all>".into()
                } else if low == high {
                    format!("<range = {low}>")
                } else {
                    format!("<range = [{low}, {high}]>")
                }
            }
            Attr::Fp => "<fp>".into(),
            Attr::Variant => "<variant>".into(),
            Attr::Positive => "<+>".into(),
            Attr::Increase(incr) => {
                let amt: Vec<String> = incr.amt.iter().map(|v| v.to_string()).collect();
                match incr.modulus {
                    Some(m) => format!("<increase = {}, mod = {m}>", amt.join(", ")),
                    None => format!("<increase = {}>", amt.join(", ")),
                }
            }
            Attr::Dims(dims) => {
                let body: Vec<String> = dims.iter().map(|v| v.to_string()).collect();
                format!("<dims = {}>", body.join(", "))
            }
            Attr::Parallel => "<parallel>".into(),
            Attr::Subscript(vs) => {
                let body: Vec<String> = vs.iter().map(|v| v.to_string()).collect();
                format!("<subscript = {}>", body.join(", "))
            }
            Attr::Base(op) => format!("<base = %{}>", self.value_number(*op)),
            Attr::StackOffset(v) => format!("<offset = {v}>"),
            Attr::Lsl(v) => format!("<lsl = {v}>"),
            Attr::Reg(r) => format!("<reg = {r}>"),
            Attr::Rd(r) => format!("<rd = {r}>"),
            Attr::Rs(r) => format!("<rs = {r}>"),
            Attr::Rs2(r) => format!("<rs2 = {r}>"),
            Attr::Rs3(r) => format!("<rs3 = {r}>"),
            Attr::SpilledRd(s) => format!("<spilled rd = {}>", s.offset),
            Attr::SpilledRs(s) => format!("<spilled rs = {}>", s.offset),
            Attr::SpilledRs2(s) => format!("<spilled rs2 = {}>", s.offset),
            Attr::SpilledRs3(s) => format!("<spilled rs3 = {}>", s.offset),
            Attr::Remat => "<remat>".into(),
        }
    }

    fn op_string(&self, op: OpId) -> String {
        let data = self.op(op);
        let mut out = String::new();
        let _ = write!(out, "{} = ", Paint::white(format!("%{}", self.value_number(op))));
        let _ = write!(
            out,
            "{}.{}",
            Paint::green(data.kind().dialect()).underline(),
            Paint::green(data.kind().name()).bold()
        );
        if data.result_ty() == Ty::F32 {
            let _ = write!(out, ".f");
        }
        for &v in data.operands() {
            let _ = write!(out, " {}", Paint::white(format!("%{}", self.value_number(v))));
        }
        for attr in data.attrs() {
            let _ = write!(out, " {}", Paint::magenta(self.attr_string(attr)).italic());
        }
        if !data.regions().is_empty() {
            let _ = write!(out, " {{");
            for &region in data.regions() {
                for &bb in self.region(region).blocks() {
                    let block = self.block(bb);
                    if self.region(region).blocks().len() != 1 {
                        let _ = write!(
                            out,
                            "\n{}:",
                            Paint::white(format!("bb{}", self.block_number(bb))).bold()
                        );
                        if !block.preds.is_empty() {
                            let preds: Vec<String> = block
                                .preds
                                .iter()
                                .map(|&p| self.block_number(p).to_string())
                                .collect();
                            let _ = write!(out, "     // preds = [ {} ]", preds.join(" "));
                        }
                        if let Some(idom) = block.idom() {
                            let _ = write!(out, "; idom = {}", self.block_number(idom));
                        }
                    }
                    for &inner in block.ops() {
                        let nested = self.op_string(inner);
                        let _ = write!(indented(&mut out).with_str("  "), "\n{nested}");
                    }
                }
            }
            let _ = write!(out, "\n}}");
        }
        out
    }
}

#[derive(Debug)]
pub struct OpDisplay<'a> {
    module: &'a Module,
    op: OpId,
}

impl fmt::Display for OpDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.module.op_string(self.op))
    }
}
