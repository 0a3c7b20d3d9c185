//! Smoke tests over the assembled pass pipelines.

use pretty_assertions::assert_eq;
use sysyc::dialects::sys::passes::pre_flatten_pipeline;
use sysyc::dialects::sys::SysOp;
use sysyc::frontend::{Ast, BinaryKind, CodeGen, Type};

/// int main() { int s = 0; int i = 0; while (i < 10) { s = s + i; i = i + 1; } return s; }
fn sum_ast() -> Ast {
    let var = |name: &str| Ast::VarRef { name: name.into(), ty: Type::Int };
    let body = Ast::Block(vec![
        Ast::Assign {
            name: "s".into(),
            ty: Type::Int,
            value: Box::new(Ast::Binary {
                kind: BinaryKind::Add,
                ty: Type::Int,
                l: Box::new(var("s")),
                r: Box::new(var("i")),
            }),
        },
        Ast::Assign {
            name: "i".into(),
            ty: Type::Int,
            value: Box::new(Ast::Binary {
                kind: BinaryKind::Add,
                ty: Type::Int,
                l: Box::new(var("i")),
                r: Box::new(Ast::Int(1)),
            }),
        },
    ]);

    Ast::Block(vec![Ast::FnDecl {
        name: "main".into(),
        ty: Type::Function { ret: Box::new(Type::Int), params: vec![] },
        args: vec![],
        body: vec![
            Ast::VarDecl {
                name: "s".into(),
                ty: Type::Int,
                init: Some(Box::new(Ast::Int(0))),
                global: false,
            },
            Ast::VarDecl {
                name: "i".into(),
                ty: Type::Int,
                init: Some(Box::new(Ast::Int(0))),
                global: false,
            },
            Ast::While {
                cond: Box::new(Ast::Binary {
                    kind: BinaryKind::Lt,
                    ty: Type::Int,
                    l: Box::new(var("i")),
                    r: Box::new(Ast::Int(10)),
                }),
                body: Box::new(body),
            },
            Ast::Return(Some(Box::new(var("s")))),
        ],
    }])
}

#[test]
fn structured_pipeline_keeps_the_ir_consistent() {
    let mut module = CodeGen::lower(&sum_ast());
    let mut pm = pre_flatten_pipeline(false);
    pm.run(&mut module).unwrap();

    module.verify_uses().unwrap();
    // The final lowering destructs fors back into whiles for FlattenCFG,
    // so the loop survives the whole structured stage as a while again.
    let main = module.function_map()["main"];
    assert_eq!(module.find_all(main, SysOp::For).len(), 0);
    assert_eq!(module.find_all(main, SysOp::While).len(), 1);
}

#[test]
fn counted_loop_is_raised_to_for() {
    let mut module = CodeGen::lower(&sum_ast());

    use sysyc::dialects::sys::passes::{Pureness, RaiseToFor};
    use sysyc::Pass;
    Pureness.run(&mut module).unwrap();
    sysyc::cleanup(&mut module);
    RaiseToFor::default().run(&mut module).unwrap();
    sysyc::cleanup(&mut module);

    let main = module.function_map()["main"];
    assert_eq!(module.find_all(main, SysOp::While).len(), 0);
    let fors = module.find_all(main, SysOp::For);
    assert_eq!(fors.len(), 1);

    // (start, stop, step, ivAddr): a counted loop from 0 to 10 by 1.
    let looop = fors[0];
    let start = module.op(looop).operand(0);
    let stop = module.op(looop).operand(1);
    let step = module.op(looop).operand(2);
    assert_eq!(module.op(start).int_val(), 0);
    assert_eq!(module.op(stop).int_val(), 10);
    assert_eq!(module.op(step).int_val(), 1);
    assert_eq!(module.op(module.op(looop).operand(3)).kind(), SysOp::Alloca);
}
