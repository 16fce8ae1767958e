//! Resolved AST definitions consumed by the rtg compiler.
//!
//! The frontend (scanner, parser, package resolver, build-tag filter) lives
//! outside this workspace; it hands the compiler a [`Program`] whose packages
//! are already in topological import order. The compiler takes the tree on
//! faith: no type checking happens here, and malformed input surfaces as an
//! internal error downstream.

#![warn(rust_2018_idioms)]

pub mod ast;
pub mod target;

pub use ast::{
    BinOp, CompositeElem, ConstGroup, ConstSpec, Expr, FuncDecl, GlobalDecl, Package, Param,
    Program, Stmt, SwitchCase, TypeDef, TypeExpr, UnOp,
};
pub use target::{Arch, Os, Target, TargetError};
