use crate::bytecode::ir::CodeObject;
use serde::{Deserialize, Serialize};

/// Literal constant carried by a `LoadConst` instruction.
///
/// Constants are the only values that can be baked into a code object; all
/// other values only exist while the interpreter runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Const {
    None,

    Bool(bool),

    /// 64-bit signed integer.
    Integer(i64),

    /// 64-bit floating-point number.
    Float(f64),

    /// UTF-8 string value.
    String(String),

    /// Tuple of constants. The empty tuple is how `build_tuple(0)` is spelled.
    Tuple(Vec<Const>),

    /// Nested code object, consumed by `MakeFunction`.
    Code(Box<CodeObject>),
}

impl Const {
    /// Identity used when interning the constant pool.
    ///
    /// Same as `==`, except that floats compare by bit pattern and values of
    /// different variants never match (`1` and `True` get separate slots).
    pub fn same_as(&self, other: &Const) -> bool {
        match (self, other) {
            (Const::None, Const::None) => true,
            (Const::Bool(a), Const::Bool(b)) => a == b,
            (Const::Integer(a), Const::Integer(b)) => a == b,
            (Const::Float(a), Const::Float(b)) => a.to_bits() == b.to_bits(),
            (Const::String(a), Const::String(b)) => a == b,
            (Const::Tuple(a), Const::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_as(y))
            }
            (Const::Code(a), Const::Code(b)) => a == b,
            _ => false,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Const::None => "none",
            Const::Bool(_) => "bool",
            Const::Integer(_) => "int",
            Const::Float(_) => "float",
            Const::String(_) => "str",
            Const::Tuple(_) => "tuple",
            Const::Code(_) => "code",
        }
    }
}

impl std::fmt::Display for Const {
    /// Format a constant the way it would be written in fragment source.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Const::None => write!(f, "None"),
            Const::Bool(true) => write!(f, "True"),
            Const::Bool(false) => write!(f, "False"),
            Const::Integer(n) => write!(f, "{}", n),
            Const::Float(n) => write!(f, "{:?}", n),
            Const::String(s) => write!(f, "{:?}", s),
            Const::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            Const::Code(code) => write!(f, "<code {}>", code.name),
        }
    }
}
