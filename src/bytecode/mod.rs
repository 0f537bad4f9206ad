pub mod assemble;
pub mod assemble_error;
pub mod codegen;
pub mod disasm;
pub mod instrument;
pub mod ir;
pub mod label;
pub mod op;
pub mod rewrite;
pub mod stack_check;

pub use assemble::CodeMeta;
pub use assemble_error::AssembleError;
pub use codegen::CodeGenerator;
pub use ir::{CodeFlags, CodeObject, Instruction};
pub use label::Label;
pub use op::{Op, Opcode};
