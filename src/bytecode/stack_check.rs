use crate::bytecode::ir::Instruction;
use crate::bytecode::op::{Op, Opcode, split_argspec};

#[derive(Debug, Clone, PartialEq)]
pub struct StackCheckError {
    /// Index of the offending instruction.
    pub ip: usize,
    pub message: String,
}

impl std::fmt::Display for StackCheckError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stack-check error at ip={}: {}", self.ip, self.message)
    }
}

impl std::error::Error for StackCheckError {}

impl StackCheckError {
    fn new(ip: usize, message: impl Into<String>) -> Self {
        Self {
            ip,
            message: message.into(),
        }
    }
}

/// Returns (pops, pushes) for an instruction on its fall-through path.
///
/// Jump-side effects that differ (`ForIter` exhausting, the handler entry of
/// `SetupExcept`) are handled by the walker in `check_code_with_initial`.
/// Counts are widened to `i64` so that no operand can wrap to a push.
pub fn effect(opcode: Opcode, arg: u32) -> (i64, i64) {
    use Opcode::*;
    match opcode {
        PopTop => (1, 0),
        RotTwo => (2, 2),
        RotThree => (3, 3),
        DupTop => (1, 2),
        DupTopTwo => (2, 4),

        LoadConst | LoadFast | LoadName | LoadGlobal | LoadDeref => (0, 1),
        StoreFast | StoreName | StoreGlobal => (1, 0),
        DeleteFast | DeleteName | DeleteGlobal => (0, 0),

        LoadAttr => (1, 1),   // ( obj -- value )
        StoreAttr => (2, 0),  // ( value obj -- )

        BuildTuple | BuildList => (i64::from(arg), 1),
        BuildMap => (0, 1),       // arg is only a size hint
        StoreMap => (3, 1),       // ( map value key -- map )
        BinarySubscr => (2, 1),   // ( obj key -- value )
        StoreSubscr => (3, 0),    // ( value obj key -- )
        UnpackSequence => (1, i64::from(arg)),

        BinaryOp | CompareOp => (2, 1),
        UnaryNot | UnaryNegative => (1, 1),

        MakeFunction => (i64::from(arg) + 1, 1), // ( defaults... code -- func )
        CallFunction => {
            let (args, kwds) = split_argspec(arg);
            (1 + i64::from(args) + 2 * i64::from(kwds), 1)
        }
        CallFunctionVar => {
            let (args, kwds) = split_argspec(arg);
            (2 + i64::from(args) + 2 * i64::from(kwds), 1)
        }

        JumpForward | JumpAbsolute => (0, 0),
        PopJumpIfFalse | PopJumpIfTrue => (1, 0),
        SetupExcept | SetupLoop | PopBlock => (0, 0),
        GetIter => (1, 1),
        ForIter => (1, 2), // ( iter -- iter value )

        RaiseVarargs => (i64::from(arg), 0),
        EndFinally => (3, 0), // ( tb val exc -- )
        ReturnValue => (1, 0),
    }
}

/// Net stack effect of a symbolic instruction. Pseudo instructions have none.
pub fn op_effect(op: &Op) -> (i64, i64) {
    let Some(opcode) = op.opcode() else {
        return (0, 0);
    };
    let arg = match op {
        Op::BuildTuple(n) | Op::BuildList(n) | Op::BuildMap(n) | Op::UnpackSequence(n) => *n,
        Op::MakeFunction(n) | Op::RaiseVarargs(n) => *n,
        Op::CallFunction { args, kwds } | Op::CallFunctionVar { args, kwds } => {
            crate::bytecode::op::argspec(*args, *kwds)
        }
        _ => 0,
    };
    effect(opcode, arg)
}

/// True when execution never continues with the next instruction.
fn ends_flow(opcode: Opcode) -> bool {
    matches!(
        opcode,
        Opcode::JumpForward | Opcode::JumpAbsolute | Opcode::RaiseVarargs | Opcode::ReturnValue
    )
}

/// Abstract machine state at an instruction boundary: the value-stack depth
/// and the depths at which the enclosing blocks were entered.
#[derive(Debug, Clone, PartialEq)]
struct State {
    depth: i64,
    blocks: Vec<i64>,
}

/// Walk every reachable path of `code` and return the deepest stack reached.
///
/// Each instruction must be reached with the same depth and block nesting on
/// every path. `PopBlock` must find the stack at the depth its block was
/// entered with, and a return outside any block must leave exactly one value.
pub fn check_code_with_initial(
    code: &[Instruction],
    initial_height: i64,
) -> Result<u32, StackCheckError> {
    let mut seen: Vec<Option<State>> = vec![None; code.len()];
    let mut max_depth = initial_height;
    let mut worklist = vec![(
        0usize,
        State {
            depth: initial_height,
            blocks: Vec::new(),
        },
    )];

    while let Some((ip, mut state)) = worklist.pop() {
        let Some(ins) = code.get(ip) else {
            return Err(StackCheckError::new(
                ip,
                "control falls off the end of the code",
            ));
        };

        match &seen[ip] {
            Some(prev) if *prev == state => continue,
            Some(prev) => {
                return Err(StackCheckError::new(
                    ip,
                    format!(
                        "inconsistent stack at join: depth {} with {} block(s) vs depth {} with {} block(s)",
                        prev.depth,
                        prev.blocks.len(),
                        state.depth,
                        state.blocks.len()
                    ),
                ));
            }
            None => seen[ip] = Some(state.clone()),
        }

        let entry = state.clone();

        match ins.opcode {
            Opcode::PopBlock => match state.blocks.pop() {
                Some(base) if base == state.depth => {}
                Some(base) => {
                    return Err(StackCheckError::new(
                        ip,
                        format!(
                            "block exited at depth {} but was entered at depth {}",
                            state.depth, base
                        ),
                    ));
                }
                None => {
                    return Err(StackCheckError::new(ip, "POP_BLOCK outside of any block"));
                }
            },
            Opcode::ReturnValue if state.blocks.is_empty() && state.depth != 1 => {
                return Err(StackCheckError::new(
                    ip,
                    format!("return with stack depth {}, expected 1", state.depth),
                ));
            }
            _ => {}
        }

        let (pops, pushes) = effect(ins.opcode, ins.arg);
        state.depth -= pops;
        if state.depth < 0 {
            return Err(StackCheckError::new(
                ip,
                format!(
                    "stack underflow at {}, needed {} items",
                    ins.opcode.name(),
                    pops
                ),
            ));
        }
        state.depth += pushes;
        max_depth = max_depth.max(state.depth);

        if let Some(target) = ins.target(ip) {
            let jumped = match ins.opcode {
                Opcode::SetupExcept => State {
                    depth: entry.depth + 3,
                    blocks: entry.blocks.clone(),
                },
                Opcode::SetupLoop => entry.clone(),
                Opcode::ForIter => State {
                    depth: entry.depth - 1,
                    blocks: entry.blocks.clone(),
                },
                _ => state.clone(),
            };
            max_depth = max_depth.max(jumped.depth);
            worklist.push((target, jumped));
        }

        if matches!(ins.opcode, Opcode::SetupExcept | Opcode::SetupLoop) {
            state.blocks.push(entry.depth);
        }

        if !ends_flow(ins.opcode) {
            worklist.push((ip + 1, state));
        }
    }

    u32::try_from(max_depth.max(0)).map_err(|_| {
        StackCheckError::new(0, format!("stack depth {} is out of range", max_depth))
    })
}

/// Check stack effects starting from an empty stack.
pub fn check_code(code: &[Instruction]) -> Result<u32, StackCheckError> {
    check_code_with_initial(code, 0)
}
