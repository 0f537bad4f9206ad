//! Fragment source: lexing, parsing and compiling snippets into code objects
//! that the code generator splices into its own stream.

pub mod ast;
pub mod compile;
pub mod lexer;
pub mod parser;
pub mod parser_error;
pub mod token;

use crate::bytecode::ir::CodeObject;
use ast::{Expr, Stmt};
use parser_error::FragmentError;

/// How a fragment is compiled and which framing surrounds its code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentMode {
    /// A suite of statements; the code ends with `return None`.
    Statements,
    /// One expression; the code ends by returning its value.
    Expression,
}

impl std::fmt::Display for FragmentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FragmentMode::Statements => write!(f, "statement"),
            FragmentMode::Expression => write!(f, "expression"),
        }
    }
}

/// Fragment input: source text or an already parsed tree.
#[derive(Debug, Clone, Copy)]
pub enum Fragment<'a> {
    Source(&'a str),
    Statements(&'a [Stmt]),
    Expression(&'a Expr),
}

impl<'a> From<&'a str> for Fragment<'a> {
    fn from(source: &'a str) -> Self {
        Fragment::Source(source)
    }
}

impl<'a> From<&'a String> for Fragment<'a> {
    fn from(source: &'a String) -> Self {
        Fragment::Source(source)
    }
}

impl<'a> From<&'a [Stmt]> for Fragment<'a> {
    fn from(body: &'a [Stmt]) -> Self {
        Fragment::Statements(body)
    }
}

impl<'a> From<&'a Expr> for Fragment<'a> {
    fn from(expr: &'a Expr) -> Self {
        Fragment::Expression(expr)
    }
}

/// Compiles fragments standalone, as if each were a whole module.
///
/// Statement code must start with a line marker and end with
/// `LOAD_CONST None; RETURN_VALUE`. Expression code must end with
/// `RETURN_VALUE`. Names are accessed with the dynamic name ops.
pub trait FragmentCompiler {
    fn compile(
        &self,
        fragment: Fragment<'_>,
        filename: &str,
        mode: FragmentMode,
    ) -> Result<CodeObject, FragmentError>;
}
