//! Frontend lowering and the structured pre-flatten passes on real ASTs.

use pretty_assertions::assert_eq;
use sysyc::dialects::sys::passes::{FlattenCfg, Pureness, Tco};
use sysyc::dialects::sys::SysOp;
use sysyc::frontend::{Ast, BinaryKind, CodeGen, Type};
use sysyc::Pass;

fn int_fn_ty(params: Vec<Type>) -> Type {
    Type::Function { ret: Box::new(Type::Int), params }
}

/// int f(int n, int a) { if (n == 0) return a; return f(n - 1, a * n); }
/// int main() { return f(5, 1); }
fn factorial_ast() -> Ast {
    let cond = Ast::Binary {
        kind: BinaryKind::Eq,
        ty: Type::Int,
        l: Box::new(Ast::VarRef { name: "n".into(), ty: Type::Int }),
        r: Box::new(Ast::Int(0)),
    };
    let recurse = Ast::Call {
        func: "f".into(),
        ty: Type::Int,
        args: vec![
            Ast::Binary {
                kind: BinaryKind::Sub,
                ty: Type::Int,
                l: Box::new(Ast::VarRef { name: "n".into(), ty: Type::Int }),
                r: Box::new(Ast::Int(1)),
            },
            Ast::Binary {
                kind: BinaryKind::Mul,
                ty: Type::Int,
                l: Box::new(Ast::VarRef { name: "a".into(), ty: Type::Int }),
                r: Box::new(Ast::VarRef { name: "n".into(), ty: Type::Int }),
            },
        ],
    };

    let f = Ast::FnDecl {
        name: "f".into(),
        ty: int_fn_ty(vec![Type::Int, Type::Int]),
        args: vec!["n".into(), "a".into()],
        body: vec![
            Ast::If {
                cond: Box::new(cond),
                ifso: Box::new(Ast::Return(Some(Box::new(Ast::VarRef {
                    name: "a".into(),
                    ty: Type::Int,
                })))),
                ifnot: None,
            },
            Ast::Return(Some(Box::new(recurse))),
        ],
    };

    let main = Ast::FnDecl {
        name: "main".into(),
        ty: int_fn_ty(vec![]),
        args: vec![],
        body: vec![Ast::Return(Some(Box::new(Ast::Call {
            func: "f".into(),
            ty: Type::Int,
            args: vec![Ast::Int(5), Ast::Int(1)],
        })))],
    };

    Ast::Block(vec![f, main])
}

#[test]
fn lowering_produces_structured_control_flow() {
    let module = CodeGen::lower(&factorial_ast());

    let funcs = module.funcs();
    assert_eq!(funcs.len(), 2);

    let f = module.function_map()["f"];
    assert_eq!(module.op(f).arg_count(), 2);
    // Arguments come in through getargs stored into allocas.
    assert_eq!(module.find_all(f, SysOp::GetArg).len(), 2);
    assert_eq!(module.find_all(f, SysOp::If).len(), 1);
    assert_eq!(module.find_all(f, SysOp::Return).len(), 2);
    module.verify_uses().unwrap();
}

#[test]
fn tco_rewrites_the_tail_call_into_a_loop() {
    let mut module = CodeGen::lower(&factorial_ast());

    Pureness.run(&mut module).unwrap();
    sysyc::cleanup(&mut module);
    Tco::default().run(&mut module).unwrap();
    sysyc::cleanup(&mut module);

    // No recursive call remains inside f; the body is a while loop now.
    let f = module.function_map()["f"];
    let self_calls = module
        .find_all(f, SysOp::Call)
        .into_iter()
        .filter(|&c| module.op(c).name() == "f")
        .count();
    assert_eq!(self_calls, 0);
    assert_eq!(module.find_all(f, SysOp::While).len(), 1);
    assert!(!module.find_all(f, SysOp::Continue).is_empty());

    // main still calls f normally.
    let main = module.function_map()["main"];
    assert_eq!(module.find_all(main, SysOp::Call).len(), 1);
}

#[test]
fn flatten_gives_every_block_a_terminator() {
    let mut module = CodeGen::lower(&factorial_ast());

    FlattenCfg.run(&mut module).unwrap();
    sysyc::cleanup(&mut module);

    // Structured ops are gone and the flat-CFG invariants hold.
    let top = module.top();
    assert!(module.find_all(top, SysOp::If).is_empty());
    assert!(module.find_all(top, SysOp::While).is_empty());
    module.verify_flat().unwrap();
    module.verify_uses().unwrap();
}

#[test]
fn globals_carry_their_payloads() {
    let ast = Ast::Block(vec![
        Ast::VarDecl {
            name: "g".into(),
            ty: Type::Int,
            init: Some(Box::new(Ast::Int(3))),
            global: true,
        },
        Ast::FnDecl {
            name: "main".into(),
            ty: int_fn_ty(vec![]),
            args: vec![],
            body: vec![Ast::Return(Some(Box::new(Ast::VarRef {
                name: "g".into(),
                ty: Type::Int,
            })))],
        },
    ]);
    let module = CodeGen::lower(&ast);

    let g = module.global_map()["g"];
    assert_eq!(module.op(g).size(), 4);
    match module.op(g).attr(sysyc::AttrKind::IntArray) {
        sysyc::Attr::IntArray(vs) => assert_eq!(vs, &vec![3]),
        _ => unreachable!(),
    }

    // The reference reads through a getglobal + load.
    let main = module.function_map()["main"];
    assert_eq!(module.find_all(main, SysOp::GetGlobal).len(), 1);
    assert_eq!(module.find_all(main, SysOp::Load).len(), 1);
}
