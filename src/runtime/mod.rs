//! Reference interpreter for assembled code objects.

pub mod hooks;
pub mod runtime_error;
pub mod value;
pub mod vm;

pub use hooks::{CodeInverter, CodeTracer};
pub use runtime_error::{Raised, RuntimeError};
pub use value::Value;
pub use vm::{Vm, VmConfig};
