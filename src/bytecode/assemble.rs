use crate::bytecode::assemble_error::{AssembleError, LabelProblem};
use crate::bytecode::ir::{CodeFlags, CodeObject, Instruction};
use crate::bytecode::label::Label;
use crate::bytecode::op::{Op, argspec};
use crate::bytecode::stack_check::check_code;
use crate::lang::value::Const;
use std::collections::{HashMap, HashSet};
use tracing::{debug, trace};

/// Metadata that goes into a code object next to its instructions.
#[derive(Debug, Clone, Default)]
pub struct CodeMeta {
    /// Names closed over from the enclosing scope.
    pub freevars: Vec<String>,
    /// Parameter names in call order. When `varargs` / `varkwargs` are set
    /// the last one or two names are the collecting parameters.
    pub args: Vec<String>,
    pub varargs: bool,
    pub varkwargs: bool,
    /// Give every call a fresh name namespace.
    pub newlocals: bool,
    pub name: String,
    pub firstlineno: u32,
    pub docstring: Option<String>,
    /// Reject the code if its stack grows deeper than this.
    pub max_stacksize: Option<u32>,
}

impl CodeMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn freevars<I, S>(mut self, freevars: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.freevars = freevars.into_iter().map(Into::into).collect();
        self
    }

    pub fn varargs(mut self, on: bool) -> Self {
        self.varargs = on;
        self
    }

    pub fn varkwargs(mut self, on: bool) -> Self {
        self.varkwargs = on;
        self
    }

    pub fn newlocals(mut self, on: bool) -> Self {
        self.newlocals = on;
        self
    }

    pub fn first_line(mut self, line: u32) -> Self {
        self.firstlineno = line;
        self
    }

    pub fn docstring(mut self, doc: impl Into<String>) -> Self {
        self.docstring = Some(doc.into());
        self
    }

    pub fn max_stacksize(mut self, max: u32) -> Self {
        self.max_stacksize = Some(max);
        self
    }
}

/// Interned operand pools, filled in first-use order.
#[derive(Default)]
struct Pools {
    consts: Vec<Const>,
    names: Vec<String>,
    varnames: Vec<String>,
    freevars: Vec<String>,
}

impl Pools {
    fn konst(&mut self, value: &Const) -> u32 {
        match self.consts.iter().position(|c| c.same_as(value)) {
            Some(i) => i as u32,
            None => {
                self.consts.push(value.clone());
                (self.consts.len() - 1) as u32
            }
        }
    }

    fn intern(pool: &mut Vec<String>, name: &str) -> u32 {
        match pool.iter().position(|n| n == name) {
            Some(i) => i as u32,
            None => {
                pool.push(name.to_string());
                (pool.len() - 1) as u32
            }
        }
    }

    fn name(&mut self, name: &str) -> u32 {
        Self::intern(&mut self.names, name)
    }

    fn varname(&mut self, name: &str) -> u32 {
        Self::intern(&mut self.varnames, name)
    }

    fn freevar(&mut self, name: &str) -> u32 {
        Self::intern(&mut self.freevars, name)
    }
}

/// Every jump target must be placed exactly once, and every placed label
/// must be jumped to.
fn check_labels(ops: &[Op]) -> Result<(), AssembleError> {
    let mut marked: HashSet<Label> = HashSet::new();
    let mut referenced: HashSet<Label> = HashSet::new();

    for op in ops {
        if let Op::Label(label) = op {
            if !marked.insert(*label) {
                return Err(AssembleError::unresolved(*label, LabelProblem::MarkedTwice));
            }
        } else if let Some(label) = op.jump_target() {
            referenced.insert(label);
        }
    }

    for op in ops {
        match op {
            Op::Label(label) if !referenced.contains(label) => {
                return Err(AssembleError::unresolved(*label, LabelProblem::NeverReferenced));
            }
            _ => {
                if let Some(label) = op.jump_target() {
                    if !marked.contains(&label) {
                        return Err(AssembleError::unresolved(label, LabelProblem::NeverMarked));
                    }
                }
            }
        }
    }

    Ok(())
}

/// Parameter names occupy the first `varnames` slots and must be distinct.
fn check_params(args: &[String]) -> Result<(), AssembleError> {
    let mut seen: HashSet<&str> = HashSet::new();
    for name in args {
        if !seen.insert(name.as_str()) {
            return Err(AssembleError::DuplicateParameter { name: name.clone() });
        }
    }
    Ok(())
}

/// Serialize a finished instruction stream into a code object.
///
/// Labels are resolved to instruction indices, operands are interned into
/// the pools, and the stack depth of every reachable path is verified.
pub fn assemble(filename: &str, ops: &[Op], meta: CodeMeta) -> Result<CodeObject, AssembleError> {
    check_labels(ops)?;
    check_params(&meta.args)?;

    // Layout: pseudo ops take no slot.
    let mut positions: HashMap<Label, usize> = HashMap::new();
    let mut lnotab: Vec<(u32, u32)> = Vec::new();
    let mut index = 0usize;
    for op in ops {
        match op {
            Op::Label(label) => {
                positions.insert(*label, index);
            }
            Op::SetLineno(line) => match lnotab.last_mut() {
                Some(last) if last.0 as usize == index => last.1 = *line,
                Some(last) if last.1 == *line => {}
                _ => lnotab.push((index as u32, *line)),
            },
            _ => index += 1,
        }
    }

    let mut pools = Pools {
        varnames: meta.args.clone(),
        freevars: meta.freevars.clone(),
        ..Pools::default()
    };

    let mut code = Vec::with_capacity(index);
    for op in ops {
        let Some(opcode) = op.opcode() else {
            continue;
        };
        let at = code.len();

        let arg = match op {
            Op::LoadConst(value) => pools.konst(value),
            Op::LoadFast(n) | Op::StoreFast(n) | Op::DeleteFast(n) => pools.varname(n),
            Op::LoadName(n)
            | Op::StoreName(n)
            | Op::DeleteName(n)
            | Op::LoadGlobal(n)
            | Op::StoreGlobal(n)
            | Op::DeleteGlobal(n)
            | Op::LoadAttr(n)
            | Op::StoreAttr(n) => pools.name(n),
            Op::LoadDeref(n) => pools.freevar(n),
            Op::BuildTuple(n) | Op::BuildList(n) | Op::BuildMap(n) | Op::UnpackSequence(n) => *n,
            Op::MakeFunction(n) | Op::RaiseVarargs(n) => *n,
            Op::BinaryOp(bin) => bin.arg(),
            Op::CompareOp(cmp) => cmp.arg(),
            Op::CallFunction { args, kwds } | Op::CallFunctionVar { args, kwds } => {
                argspec(*args, *kwds)
            }
            _ => match op.jump_target() {
                Some(label) => {
                    // Presence was established by `check_labels`.
                    let target = positions
                        .get(&label)
                        .copied()
                        .ok_or(AssembleError::unresolved(label, LabelProblem::NeverMarked))?;
                    trace!(%label, at, target, "resolved jump");
                    if opcode.is_relative_jump() {
                        if target < at + 1 {
                            return Err(AssembleError::InvalidJump { label, at });
                        }
                        (target - at - 1) as u32
                    } else {
                        target as u32
                    }
                }
                None => 0,
            },
        };

        code.push(Instruction::new(opcode, arg));
    }

    let stacksize = check_code(&code)?;
    if let Some(max) = meta.max_stacksize {
        if stacksize > max {
            return Err(AssembleError::stack(
                format!(
                    "stack depth {} exceeds the declared maximum of {}",
                    stacksize, max
                ),
                0,
            ));
        }
    }

    // Code still resolving names dynamically needs a name namespace.
    let mut flags = CodeFlags::empty();
    if !ops.iter().any(Op::is_dynamic_name) {
        flags.insert(CodeFlags::OPTIMIZED);
    }
    if meta.newlocals {
        flags.insert(CodeFlags::NEWLOCALS);
    }
    if meta.varargs {
        flags.insert(CodeFlags::VARARGS);
    }
    if meta.varkwargs {
        flags.insert(CodeFlags::VARKEYWORDS);
    }
    if pools.freevars.is_empty() {
        flags.insert(CodeFlags::NOFREE);
    }

    let collecting = meta.varargs as usize + meta.varkwargs as usize;
    let argcount = meta.args.len().saturating_sub(collecting) as u32;

    debug!(
        name = %meta.name,
        instructions = code.len(),
        stacksize,
        consts = pools.consts.len(),
        "assembled code object"
    );

    Ok(CodeObject {
        argcount,
        nlocals: pools.varnames.len() as u32,
        stacksize,
        flags,
        code,
        consts: pools.consts,
        names: pools.names,
        varnames: pools.varnames,
        freevars: pools.freevars,
        filename: filename.to_string(),
        name: meta.name,
        firstlineno: meta.firstlineno,
        lnotab,
        docstring: meta.docstring,
    })
}
