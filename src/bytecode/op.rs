use crate::bytecode::label::Label;
use crate::lang::value::Const;
use serde::{Deserialize, Serialize};

// =============================================================================
// OP - Symbolic instructions
// =============================================================================

/// One entry of the instruction stream a `CodeGenerator` builds.
///
/// Operands are symbolic: names are strings, jump targets are labels. The
/// serializer interns names and constants and turns labels into offsets.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    // ==========================================================================
    // Pseudo instructions (no slot in the serialized code)
    // ==========================================================================
    /// Following instructions belong to this source line.
    SetLineno(u32),

    /// Jump target marker.
    Label(Label),

    // stack ops
    PopTop,
    RotTwo,
    RotThree,
    DupTop,
    /// ( a b -- a b a b )
    DupTopTwo,

    // constants
    LoadConst(Const),

    // ==========================================================================
    // Name access, three scope kinds plus closures
    // ==========================================================================
    LoadFast(String),
    StoreFast(String),
    DeleteFast(String),

    LoadName(String),
    StoreName(String),
    DeleteName(String),

    LoadGlobal(String),
    StoreGlobal(String),
    DeleteGlobal(String),

    /// Load a free variable captured from the enclosing scope.
    LoadDeref(String),

    // attributes
    LoadAttr(String),
    StoreAttr(String),

    // collections
    BuildTuple(u32),
    BuildList(u32),
    BuildMap(u32),
    StoreMap,
    BinarySubscr,
    StoreSubscr,
    /// Push the items of a sequence of exactly n items, last item deepest.
    UnpackSequence(u32),

    // arithmetic & logic
    BinaryOp(BinOp),
    CompareOp(CmpOp),
    UnaryNot,
    UnaryNegative,

    // functions
    MakeFunction(u32),
    CallFunction {
        args: u8,
        kwds: u8,
    },
    CallFunctionVar {
        args: u8,
        kwds: u8,
    },

    // ==========================================================================
    // Control flow
    // ==========================================================================
    JumpForward(Label),
    JumpAbsolute(Label),
    /// Pop TOS, jump if it is falsy.
    PopJumpIfFalse(Label),
    /// Pop TOS, jump if it is truthy.
    PopJumpIfTrue(Label),

    /// Push an exception block; the handler at the label runs with
    /// `( tb val exc )` pushed.
    SetupExcept(Label),
    /// Push a loop block; the label is where the loop ends.
    SetupLoop(Label),
    PopBlock,
    GetIter,
    /// Push the iterator's next value, or pop the iterator and jump once it
    /// is exhausted.
    ForIter(Label),

    RaiseVarargs(u32),
    EndFinally,
    ReturnValue,
}

impl Op {
    /// The label this instruction jumps to, if any.
    ///
    /// Markers are not jumps: `Op::Label(_)` returns `None`.
    pub fn jump_target(&self) -> Option<Label> {
        match self {
            Op::JumpForward(l)
            | Op::JumpAbsolute(l)
            | Op::PopJumpIfFalse(l)
            | Op::PopJumpIfTrue(l)
            | Op::SetupExcept(l)
            | Op::SetupLoop(l)
            | Op::ForIter(l) => Some(*l),
            _ => None,
        }
    }

    /// True for the dynamically-scoped name ops the scope rewriter replaces.
    pub fn is_dynamic_name(&self) -> bool {
        matches!(self, Op::LoadName(_) | Op::StoreName(_) | Op::DeleteName(_))
    }

    /// The serialized opcode, or `None` for pseudo instructions.
    pub fn opcode(&self) -> Option<Opcode> {
        use Opcode as C;
        Some(match self {
            Op::SetLineno(_) | Op::Label(_) => return None,
            Op::PopTop => C::PopTop,
            Op::RotTwo => C::RotTwo,
            Op::RotThree => C::RotThree,
            Op::DupTop => C::DupTop,
            Op::DupTopTwo => C::DupTopTwo,
            Op::LoadConst(_) => C::LoadConst,
            Op::LoadFast(_) => C::LoadFast,
            Op::StoreFast(_) => C::StoreFast,
            Op::DeleteFast(_) => C::DeleteFast,
            Op::LoadName(_) => C::LoadName,
            Op::StoreName(_) => C::StoreName,
            Op::DeleteName(_) => C::DeleteName,
            Op::LoadGlobal(_) => C::LoadGlobal,
            Op::StoreGlobal(_) => C::StoreGlobal,
            Op::DeleteGlobal(_) => C::DeleteGlobal,
            Op::LoadDeref(_) => C::LoadDeref,
            Op::LoadAttr(_) => C::LoadAttr,
            Op::StoreAttr(_) => C::StoreAttr,
            Op::BuildTuple(_) => C::BuildTuple,
            Op::BuildList(_) => C::BuildList,
            Op::BuildMap(_) => C::BuildMap,
            Op::StoreMap => C::StoreMap,
            Op::BinarySubscr => C::BinarySubscr,
            Op::StoreSubscr => C::StoreSubscr,
            Op::UnpackSequence(_) => C::UnpackSequence,
            Op::BinaryOp(_) => C::BinaryOp,
            Op::CompareOp(_) => C::CompareOp,
            Op::UnaryNot => C::UnaryNot,
            Op::UnaryNegative => C::UnaryNegative,
            Op::MakeFunction(_) => C::MakeFunction,
            Op::CallFunction { .. } => C::CallFunction,
            Op::CallFunctionVar { .. } => C::CallFunctionVar,
            Op::JumpForward(_) => C::JumpForward,
            Op::JumpAbsolute(_) => C::JumpAbsolute,
            Op::PopJumpIfFalse(_) => C::PopJumpIfFalse,
            Op::PopJumpIfTrue(_) => C::PopJumpIfTrue,
            Op::SetupExcept(_) => C::SetupExcept,
            Op::SetupLoop(_) => C::SetupLoop,
            Op::PopBlock => C::PopBlock,
            Op::GetIter => C::GetIter,
            Op::ForIter(_) => C::ForIter,
            Op::RaiseVarargs(_) => C::RaiseVarargs,
            Op::EndFinally => C::EndFinally,
            Op::ReturnValue => C::ReturnValue,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
}

impl BinOp {
    const ALL: [BinOp; 5] = [
        BinOp::Add,
        BinOp::Subtract,
        BinOp::Multiply,
        BinOp::Divide,
        BinOp::Modulo,
    ];

    pub fn arg(self) -> u32 {
        self as u32
    }

    pub fn from_arg(arg: u32) -> Option<Self> {
        Self::ALL.get(arg as usize).copied()
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Subtract => "-",
            BinOp::Multiply => "*",
            BinOp::Divide => "/",
            BinOp::Modulo => "%",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Eq,
    Ne,
    Gt,
    Ge,
}

impl CmpOp {
    const ALL: [CmpOp; 6] = [
        CmpOp::Lt,
        CmpOp::Le,
        CmpOp::Eq,
        CmpOp::Ne,
        CmpOp::Gt,
        CmpOp::Ge,
    ];

    pub fn arg(self) -> u32 {
        self as u32
    }

    pub fn from_arg(arg: u32) -> Option<Self> {
        Self::ALL.get(arg as usize).copied()
    }

    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

// =============================================================================
// OPCODE - Serialized instruction kinds
// =============================================================================

/// Opcode of a serialized `Instruction`. Every real `Op` maps onto exactly
/// one of these; pseudo instructions have none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    PopTop,
    RotTwo,
    RotThree,
    DupTop,
    DupTopTwo,
    LoadConst,
    LoadFast,
    StoreFast,
    DeleteFast,
    LoadName,
    StoreName,
    DeleteName,
    LoadGlobal,
    StoreGlobal,
    DeleteGlobal,
    LoadDeref,
    LoadAttr,
    StoreAttr,
    BuildTuple,
    BuildList,
    BuildMap,
    StoreMap,
    BinarySubscr,
    StoreSubscr,
    UnpackSequence,
    BinaryOp,
    CompareOp,
    UnaryNot,
    UnaryNegative,
    MakeFunction,
    CallFunction,
    CallFunctionVar,
    JumpForward,
    JumpAbsolute,
    PopJumpIfFalse,
    PopJumpIfTrue,
    SetupExcept,
    SetupLoop,
    PopBlock,
    GetIter,
    ForIter,
    RaiseVarargs,
    EndFinally,
    ReturnValue,
}

impl Opcode {
    pub fn name(self) -> &'static str {
        use Opcode::*;
        match self {
            PopTop => "POP_TOP",
            RotTwo => "ROT_TWO",
            RotThree => "ROT_THREE",
            DupTop => "DUP_TOP",
            DupTopTwo => "DUP_TOP_TWO",
            LoadConst => "LOAD_CONST",
            LoadFast => "LOAD_FAST",
            StoreFast => "STORE_FAST",
            DeleteFast => "DELETE_FAST",
            LoadName => "LOAD_NAME",
            StoreName => "STORE_NAME",
            DeleteName => "DELETE_NAME",
            LoadGlobal => "LOAD_GLOBAL",
            StoreGlobal => "STORE_GLOBAL",
            DeleteGlobal => "DELETE_GLOBAL",
            LoadDeref => "LOAD_DEREF",
            LoadAttr => "LOAD_ATTR",
            StoreAttr => "STORE_ATTR",
            BuildTuple => "BUILD_TUPLE",
            BuildList => "BUILD_LIST",
            BuildMap => "BUILD_MAP",
            StoreMap => "STORE_MAP",
            BinarySubscr => "BINARY_SUBSCR",
            StoreSubscr => "STORE_SUBSCR",
            UnpackSequence => "UNPACK_SEQUENCE",
            BinaryOp => "BINARY_OP",
            CompareOp => "COMPARE_OP",
            UnaryNot => "UNARY_NOT",
            UnaryNegative => "UNARY_NEGATIVE",
            MakeFunction => "MAKE_FUNCTION",
            CallFunction => "CALL_FUNCTION",
            CallFunctionVar => "CALL_FUNCTION_VAR",
            JumpForward => "JUMP_FORWARD",
            JumpAbsolute => "JUMP_ABSOLUTE",
            PopJumpIfFalse => "POP_JUMP_IF_FALSE",
            PopJumpIfTrue => "POP_JUMP_IF_TRUE",
            SetupExcept => "SETUP_EXCEPT",
            SetupLoop => "SETUP_LOOP",
            PopBlock => "POP_BLOCK",
            GetIter => "GET_ITER",
            ForIter => "FOR_ITER",
            RaiseVarargs => "RAISE_VARARGS",
            EndFinally => "END_FINALLY",
            ReturnValue => "RETURN_VALUE",
        }
    }

    /// Jumps whose argument is a delta from the next instruction.
    pub fn is_relative_jump(self) -> bool {
        matches!(
            self,
            Opcode::JumpForward | Opcode::SetupExcept | Opcode::SetupLoop | Opcode::ForIter
        )
    }

    /// Jumps whose argument is the target index itself.
    pub fn is_absolute_jump(self) -> bool {
        matches!(
            self,
            Opcode::JumpAbsolute | Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue
        )
    }

    pub fn is_jump(self) -> bool {
        self.is_relative_jump() || self.is_absolute_jump()
    }
}

/// Pack a call's argument counts the way the serialized argument stores them:
/// keyword count in the high byte, positional count in the low byte.
pub fn argspec(args: u8, kwds: u8) -> u32 {
    ((kwds as u32) << 8) | args as u32
}

/// Inverse of `argspec`.
pub fn split_argspec(arg: u32) -> (u8, u8) {
    ((arg & 0xFF) as u8, ((arg >> 8) & 0xFF) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::label::LabelAllocator;

    #[test]
    fn test_jump_target() {
        let mut labels = LabelAllocator::new();
        let l = labels.fresh();

        assert_eq!(Op::ForIter(l).jump_target(), Some(l));
        assert_eq!(Op::SetupExcept(l).jump_target(), Some(l));
        assert_eq!(Op::Label(l).jump_target(), None);
        assert_eq!(Op::PopTop.jump_target(), None);
    }

    #[test]
    fn test_pseudo_ops_have_no_opcode() {
        let mut labels = LabelAllocator::new();
        assert_eq!(Op::SetLineno(3).opcode(), None);
        assert_eq!(Op::Label(labels.fresh()).opcode(), None);
        assert_eq!(Op::ReturnValue.opcode(), Some(Opcode::ReturnValue));
    }

    #[test]
    fn test_argspec_packing() {
        assert_eq!(argspec(2, 1), 0x0102);
        assert_eq!(split_argspec(0x0102), (2, 1));
    }

    #[test]
    fn test_operator_args() {
        assert_eq!(BinOp::from_arg(BinOp::Modulo.arg()), Some(BinOp::Modulo));
        assert_eq!(CmpOp::from_arg(CmpOp::Ge.arg()), Some(CmpOp::Ge));
        assert_eq!(CmpOp::from_arg(99), None);
    }

    #[test]
    fn test_jump_classes() {
        assert!(Opcode::ForIter.is_relative_jump());
        assert!(Opcode::PopJumpIfTrue.is_absolute_jump());
        assert!(!Opcode::PopBlock.is_jump());
    }
}
