//! Frontend glue: the type-annotated AST surface handed over by the
//! external parser, and its lowering into the `sys` dialect.

pub mod ast;
mod lower;

pub use ast::{Ast, BinaryKind, ConstArray, Type, UnaryKind};
pub use lower::CodeGen;

/// The interface by which an AST targets and lowers to an IR of type `T`.
pub trait Lowering<T> {
    type Error;

    fn lower(&self) -> Result<T, Self::Error>;
}

impl Lowering<crate::core::Module> for Ast {
    type Error = std::convert::Infallible;

    fn lower(&self) -> Result<crate::core::Module, Self::Error> {
        Ok(CodeGen::lower(self))
    }
}
