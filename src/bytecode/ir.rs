use crate::bytecode::label::{Label, LabelAllocator};
use crate::bytecode::op::{BinOp, CmpOp, Op, Opcode, split_argspec};
use crate::lang::value::Const;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A serialized instruction: opcode plus one integer argument.
///
/// The meaning of `arg` depends on the opcode: a pool index for constant and
/// name access, a count for builds and calls, an offset for jumps, and zero
/// when the opcode takes no argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub opcode: Opcode,
    pub arg: u32,
}

impl Instruction {
    pub fn new(opcode: Opcode, arg: u32) -> Self {
        Self { opcode, arg }
    }

    /// Absolute jump target of this instruction when it sits at `index`.
    pub fn target(self, index: usize) -> Option<usize> {
        if self.opcode.is_relative_jump() {
            Some(index + 1 + self.arg as usize)
        } else if self.opcode.is_absolute_jump() {
            Some(self.arg as usize)
        } else {
            None
        }
    }
}

/// Code object flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CodeFlags(u32);

impl CodeFlags {
    /// Locals live in fast slots.
    pub const OPTIMIZED: CodeFlags = CodeFlags(0x01);
    /// Each call gets a fresh name namespace.
    pub const NEWLOCALS: CodeFlags = CodeFlags(0x02);
    /// The last-but-optional parameter collects extra positional arguments.
    pub const VARARGS: CodeFlags = CodeFlags(0x04);
    /// The last parameter collects extra keyword arguments.
    pub const VARKEYWORDS: CodeFlags = CodeFlags(0x08);
    /// No free variables.
    pub const NOFREE: CodeFlags = CodeFlags(0x40);

    pub fn empty() -> Self {
        CodeFlags(0)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: CodeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: CodeFlags) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for CodeFlags {
    type Output = CodeFlags;

    fn bitor(self, rhs: CodeFlags) -> CodeFlags {
        CodeFlags(self.0 | rhs.0)
    }
}

impl std::fmt::Display for CodeFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = [
            (CodeFlags::OPTIMIZED, "OPTIMIZED"),
            (CodeFlags::NEWLOCALS, "NEWLOCALS"),
            (CodeFlags::VARARGS, "VARARGS"),
            (CodeFlags::VARKEYWORDS, "VARKEYWORDS"),
            (CodeFlags::NOFREE, "NOFREE"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            write!(f, "0")
        } else {
            write!(f, "{}", set.join(" | "))
        }
    }
}

/// A finished, loadable executable unit.
///
/// Produced once by `CodeGenerator::to_code` and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeObject {
    /// Positional parameters, not counting `*args` / `**kwargs`.
    pub argcount: u32,
    /// Number of fast local slots (`varnames.len()`).
    pub nlocals: u32,
    /// Deepest value stack any path through `code` reaches.
    pub stacksize: u32,
    pub flags: CodeFlags,
    pub code: Vec<Instruction>,
    pub consts: Vec<Const>,
    /// Names used by dynamic, global and attribute access.
    pub names: Vec<String>,
    /// Fast local names, parameters first.
    pub varnames: Vec<String>,
    pub freevars: Vec<String>,
    pub filename: String,
    pub name: String,
    pub firstlineno: u32,
    /// `(instruction index, line)` pairs in increasing index order.
    pub lnotab: Vec<(u32, u32)>,
    pub docstring: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodeError {
    pub index: usize,
    pub message: String,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "decode error at {}: {}", self.index, self.message)
    }
}

impl std::error::Error for DecodeError {}

impl CodeObject {
    /// Deterministic binary encoding.
    pub fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }

    /// Source line of the instruction at `index`.
    pub fn line_for(&self, index: usize) -> u32 {
        let mut line = self.firstlineno;
        for &(at, l) in &self.lnotab {
            if at as usize > index {
                break;
            }
            line = l;
        }
        line
    }

    /// Absolute target of the jump at `index`, if that instruction is a jump.
    pub fn jump_target(&self, index: usize) -> Option<usize> {
        self.code.get(index)?.target(index)
    }

    /// Rebuild a symbolic instruction stream from this code object.
    ///
    /// Each distinct jump target gets a fresh label from `labels`, placed as a
    /// marker before the target; line-table entries become `SetLineno`
    /// markers. The stream always opens with a line marker.
    pub fn to_ops(&self, labels: &mut LabelAllocator) -> Result<Vec<Op>, DecodeError> {
        let mut targets: BTreeMap<usize, Label> = BTreeMap::new();
        for index in 0..self.code.len() {
            if let Some(target) = self.jump_target(index) {
                if target > self.code.len() {
                    return Err(DecodeError {
                        index,
                        message: format!("jump target {} is out of range", target),
                    });
                }
                targets.entry(target).or_insert_with(|| labels.fresh());
            }
        }

        let lines: BTreeMap<usize, u32> = self
            .lnotab
            .iter()
            .map(|&(at, line)| (at as usize, line))
            .collect();

        let mut ops = Vec::with_capacity(self.code.len() + lines.len() + targets.len() + 1);
        for (index, ins) in self.code.iter().enumerate() {
            if let Some(label) = targets.get(&index) {
                ops.push(Op::Label(*label));
            }
            match lines.get(&index) {
                Some(line) => ops.push(Op::SetLineno(*line)),
                None if index == 0 => ops.push(Op::SetLineno(self.firstlineno)),
                None => {}
            }
            ops.push(self.decode(index, *ins, &targets)?);
        }
        if self.code.is_empty() {
            ops.push(Op::SetLineno(self.firstlineno));
        }
        if let Some(label) = targets.get(&self.code.len()) {
            ops.push(Op::Label(*label));
        }

        Ok(ops)
    }

    fn decode(
        &self,
        index: usize,
        ins: Instruction,
        targets: &BTreeMap<usize, Label>,
    ) -> Result<Op, DecodeError> {
        let arg = ins.arg;
        let err = |message: String| DecodeError { index, message };

        let name = |pool: &[String], what: &str| -> Result<String, DecodeError> {
            pool.get(arg as usize)
                .cloned()
                .ok_or_else(|| err(format!("{} index {} out of range", what, arg)))
        };
        let label = || -> Result<Label, DecodeError> {
            self.jump_target(index)
                .and_then(|t| targets.get(&t).copied())
                .ok_or_else(|| err("unresolved jump target".to_string()))
        };

        use Opcode as C;
        Ok(match ins.opcode {
            C::PopTop => Op::PopTop,
            C::RotTwo => Op::RotTwo,
            C::RotThree => Op::RotThree,
            C::DupTop => Op::DupTop,
            C::DupTopTwo => Op::DupTopTwo,
            C::LoadConst => Op::LoadConst(
                self.consts
                    .get(arg as usize)
                    .cloned()
                    .ok_or_else(|| err(format!("const index {} out of range", arg)))?,
            ),
            C::LoadFast => Op::LoadFast(name(&self.varnames, "varname")?),
            C::StoreFast => Op::StoreFast(name(&self.varnames, "varname")?),
            C::DeleteFast => Op::DeleteFast(name(&self.varnames, "varname")?),
            C::LoadName => Op::LoadName(name(&self.names, "name")?),
            C::StoreName => Op::StoreName(name(&self.names, "name")?),
            C::DeleteName => Op::DeleteName(name(&self.names, "name")?),
            C::LoadGlobal => Op::LoadGlobal(name(&self.names, "name")?),
            C::StoreGlobal => Op::StoreGlobal(name(&self.names, "name")?),
            C::DeleteGlobal => Op::DeleteGlobal(name(&self.names, "name")?),
            C::LoadDeref => Op::LoadDeref(name(&self.freevars, "freevar")?),
            C::LoadAttr => Op::LoadAttr(name(&self.names, "name")?),
            C::StoreAttr => Op::StoreAttr(name(&self.names, "name")?),
            C::BuildTuple => Op::BuildTuple(arg),
            C::BuildList => Op::BuildList(arg),
            C::BuildMap => Op::BuildMap(arg),
            C::StoreMap => Op::StoreMap,
            C::BinarySubscr => Op::BinarySubscr,
            C::StoreSubscr => Op::StoreSubscr,
            C::UnpackSequence => Op::UnpackSequence(arg),
            C::BinaryOp => Op::BinaryOp(
                BinOp::from_arg(arg).ok_or_else(|| err(format!("unknown operator {}", arg)))?,
            ),
            C::CompareOp => Op::CompareOp(
                CmpOp::from_arg(arg).ok_or_else(|| err(format!("unknown comparison {}", arg)))?,
            ),
            C::UnaryNot => Op::UnaryNot,
            C::UnaryNegative => Op::UnaryNegative,
            C::MakeFunction => Op::MakeFunction(arg),
            C::CallFunction => {
                let (args, kwds) = split_argspec(arg);
                Op::CallFunction { args, kwds }
            }
            C::CallFunctionVar => {
                let (args, kwds) = split_argspec(arg);
                Op::CallFunctionVar { args, kwds }
            }
            C::JumpForward => Op::JumpForward(label()?),
            C::JumpAbsolute => Op::JumpAbsolute(label()?),
            C::PopJumpIfFalse => Op::PopJumpIfFalse(label()?),
            C::PopJumpIfTrue => Op::PopJumpIfTrue(label()?),
            C::SetupExcept => Op::SetupExcept(label()?),
            C::SetupLoop => Op::SetupLoop(label()?),
            C::PopBlock => Op::PopBlock,
            C::GetIter => Op::GetIter,
            C::ForIter => Op::ForIter(label()?),
            C::RaiseVarargs => Op::RaiseVarargs(arg),
            C::EndFinally => Op::EndFinally,
            C::ReturnValue => Op::ReturnValue,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(code: Vec<Instruction>) -> CodeObject {
        CodeObject {
            argcount: 0,
            nlocals: 0,
            stacksize: 1,
            flags: CodeFlags::NOFREE,
            code,
            consts: vec![Const::None, Const::Integer(7)],
            names: vec!["x".to_string()],
            varnames: vec![],
            freevars: vec![],
            filename: "<test>".to_string(),
            name: "t".to_string(),
            firstlineno: 1,
            lnotab: vec![(0, 1), (2, 2)],
            docstring: None,
        }
    }

    #[test]
    fn test_flags() {
        let flags = CodeFlags::OPTIMIZED | CodeFlags::VARARGS;
        assert!(flags.contains(CodeFlags::VARARGS));
        assert!(!flags.contains(CodeFlags::NEWLOCALS));
        assert_eq!(flags.bits(), 0x05);
        assert_eq!(flags.to_string(), "OPTIMIZED | VARARGS");
        assert_eq!(CodeFlags::empty().to_string(), "0");
    }

    #[test]
    fn test_line_for() {
        let code = unit(vec![
            Instruction::new(Opcode::LoadConst, 1),
            Instruction::new(Opcode::StoreName, 0),
            Instruction::new(Opcode::LoadConst, 0),
            Instruction::new(Opcode::ReturnValue, 0),
        ]);
        assert_eq!(code.line_for(0), 1);
        assert_eq!(code.line_for(1), 1);
        assert_eq!(code.line_for(3), 2);
    }

    #[test]
    fn test_to_ops_places_lines_and_labels() {
        let code = unit(vec![
            Instruction::new(Opcode::LoadName, 0),
            Instruction::new(Opcode::PopJumpIfFalse, 3),
            Instruction::new(Opcode::LoadConst, 1),
            Instruction::new(Opcode::ReturnValue, 0),
        ]);
        let mut labels = LabelAllocator::new();
        let ops = code.to_ops(&mut labels).unwrap();

        let l = match ops[2] {
            Op::PopJumpIfFalse(l) => l,
            ref other => panic!("unexpected {:?}", other),
        };
        assert_eq!(
            ops,
            vec![
                Op::SetLineno(1),
                Op::LoadName("x".to_string()),
                Op::PopJumpIfFalse(l),
                Op::SetLineno(2),
                Op::LoadConst(Const::Integer(7)),
                Op::Label(l),
                Op::ReturnValue,
            ]
        );
    }

    #[test]
    fn test_to_ops_rejects_bad_pool_index() {
        let code = unit(vec![Instruction::new(Opcode::LoadFast, 0)]);
        let err = code.to_ops(&mut LabelAllocator::new()).unwrap_err();
        assert_eq!(err.index, 0);
        assert!(err.message.contains("varname"));
    }

    #[test]
    fn test_bytes_round_trip() {
        let code = unit(vec![
            Instruction::new(Opcode::LoadConst, 0),
            Instruction::new(Opcode::ReturnValue, 0),
        ]);
        let bytes = code.to_bytes().unwrap();
        assert_eq!(CodeObject::from_bytes(&bytes).unwrap(), code);
    }
}
