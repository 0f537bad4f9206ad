//! Kiln: a symbolic bytecode assembler.
//!
//! Build an instruction stream with [`bytecode::CodeGenerator`], splice in
//! compiled source fragments, rewrite dynamic names to fast locals and
//! serialize the result into a stack-checked [`bytecode::CodeObject`].

pub mod bytecode;
pub mod frontend;
pub mod lang;
pub mod runtime;
