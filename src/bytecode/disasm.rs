use crate::bytecode::ir::CodeObject;
use crate::bytecode::op::{BinOp, CmpOp, Op, Opcode, split_argspec};
use crate::lang::value::Const;
use std::collections::{BTreeSet, HashMap};
use std::fmt::Write;

/// Print disassembly of a code object and every code object nested in its
/// constants.
pub fn print_code(code: &CodeObject) {
    print!("{}", disassemble(code));
}

/// Return disassembly as a String
pub fn disassemble(code: &CodeObject) -> String {
    let mut output = String::new();
    write_code_object(&mut output, code, 0);
    output
}

fn write_code_object(out: &mut String, code: &CodeObject, indent: usize) {
    let prefix = "  ".repeat(indent);

    let _ = writeln!(out, "{}════════════════════════════════════════", prefix);
    let _ = writeln!(out, "{} {} ({}:{})", prefix, code.name, code.filename, code.firstlineno);
    let _ = writeln!(
        out,
        "{} {} instructions, stack {}, flags {}",
        prefix,
        code.code.len(),
        code.stacksize,
        code.flags
    );
    if !code.varnames.is_empty() {
        let _ = writeln!(
            out,
            "{} args {:?}, locals {:?}",
            prefix,
            &code.varnames[..code.argcount as usize],
            &code.varnames[code.argcount as usize..]
        );
    }
    if !code.freevars.is_empty() {
        let _ = writeln!(out, "{} free {:?}", prefix, code.freevars);
    }
    let _ = writeln!(out, "{}════════════════════════════════════════", prefix);

    let jump_targets = collect_jump_targets(code);
    let mut line = None;

    for (ip, ins) in code.code.iter().enumerate() {
        let this_line = code.line_for(ip);
        let line_col = if line != Some(this_line) {
            line = Some(this_line);
            format!("{:>4}", this_line)
        } else {
            "    ".to_string()
        };

        let marker = if jump_targets.contains(&ip) { "►" } else { " " };
        let _ = write!(out, "{}{} {:04} {} {:<18}", prefix, line_col, ip, marker, ins.opcode.name());

        let operand = describe_arg(code, ip);
        if operand.is_empty() {
            let _ = writeln!(out);
        } else {
            let _ = writeln!(out, " {}", operand);
        }
    }
    let _ = writeln!(out);

    for konst in &code.consts {
        if let Const::Code(inner) = konst {
            write_code_object(out, inner, indent + 1);
        }
    }
}

fn collect_jump_targets(code: &CodeObject) -> BTreeSet<usize> {
    (0..code.code.len())
        .filter_map(|ip| code.jump_target(ip))
        .collect()
}

/// Argument column: the raw argument and what it refers to.
fn describe_arg(code: &CodeObject, ip: usize) -> String {
    let ins = code.code[ip];
    let arg = ins.arg;
    let pooled = |pool: &[String]| match pool.get(arg as usize) {
        Some(name) => format!("{:<4} ({})", arg, name),
        None => format!("{:<4} (<bad index>)", arg),
    };

    use Opcode::*;
    match ins.opcode {
        LoadConst => match code.consts.get(arg as usize) {
            Some(c) => format!("{:<4} ({})", arg, c),
            None => format!("{:<4} (<bad index>)", arg),
        },
        LoadFast | StoreFast | DeleteFast => pooled(&code.varnames),
        LoadName | StoreName | DeleteName | LoadGlobal | StoreGlobal | DeleteGlobal
        | LoadAttr | StoreAttr => pooled(&code.names),
        LoadDeref => pooled(&code.freevars),
        BinaryOp => match BinOp::from_arg(arg) {
            Some(op) => format!("{:<4} ({})", arg, op.symbol()),
            None => format!("{:<4} (?)", arg),
        },
        CompareOp => match CmpOp::from_arg(arg) {
            Some(op) => format!("{:<4} ({})", arg, op.symbol()),
            None => format!("{:<4} (?)", arg),
        },
        CallFunction | CallFunctionVar => {
            let (args, kwds) = split_argspec(arg);
            format!("{:<4} ({} positional, {} keyword)", arg, args, kwds)
        }
        BuildTuple | BuildList | BuildMap | UnpackSequence | MakeFunction | RaiseVarargs => {
            arg.to_string()
        }
        _ => match code.jump_target(ip) {
            Some(target) if ins.opcode.is_relative_jump() => {
                format!("{:<4} (to {:04})", arg, target)
            }
            Some(target) => {
                let direction = if target <= ip { "↑" } else { "↓" };
                format!("{:<4} {} (to {:04})", arg, direction, target)
            }
            None => String::new(),
        },
    }
}

/// Symbolic stream listing, one op per line, labels flush left.
pub fn format_ops(ops: &[Op]) -> String {
    let mut out = String::new();
    for op in ops {
        match op {
            Op::Label(label) => {
                let _ = writeln!(out, "{}:", label);
            }
            Op::SetLineno(line) => {
                let _ = writeln!(out, "    ; line {}", line);
            }
            other => {
                let _ = writeln!(out, "    {:?}", other);
            }
        }
    }
    out
}

// =============================================================================
// Statistics
// =============================================================================

/// Opcode frequencies over a code object and its nested code constants.
pub fn count_opcodes(code: &CodeObject) -> HashMap<&'static str, usize> {
    let mut counts = HashMap::new();
    count_into(code, &mut counts);
    counts
}

fn count_into(code: &CodeObject, counts: &mut HashMap<&'static str, usize>) {
    for ins in &code.code {
        *counts.entry(ins.opcode.name()).or_insert(0) += 1;
    }
    for konst in &code.consts {
        if let Const::Code(inner) = konst {
            count_into(inner, counts);
        }
    }
}
