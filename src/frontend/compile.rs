use crate::bytecode::assemble::CodeMeta;
use crate::bytecode::codegen::CodeGenerator;
use crate::bytecode::ir::CodeObject;
use crate::frontend::ast::{Expr, Stmt, StmtKind, Target};
use crate::frontend::parser::{parse_expression, parse_statements};
use crate::frontend::parser_error::FragmentError;
use crate::frontend::{Fragment, FragmentCompiler, FragmentMode};
use crate::lang::value::Const;
use tracing::trace;

/// Compiles fragment source with the built-in parser.
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceCompiler;

impl FragmentCompiler for SourceCompiler {
    fn compile(
        &self,
        fragment: Fragment<'_>,
        filename: &str,
        mode: FragmentMode,
    ) -> Result<CodeObject, FragmentError> {
        match (fragment, mode) {
            (Fragment::Source(source), FragmentMode::Statements) => {
                let body = parse_statements(source)?;
                compile_statements(&body, filename)
            }
            (Fragment::Source(source), FragmentMode::Expression) => {
                let expr = parse_expression(source)?;
                compile_expression(&expr, filename)
            }
            (Fragment::Statements(body), FragmentMode::Statements) => {
                compile_statements(body, filename)
            }
            (Fragment::Expression(expr), FragmentMode::Expression) => {
                compile_expression(expr, filename)
            }
            (Fragment::Statements(_), FragmentMode::Expression) => Err(FragmentError::new(
                "a statement suite cannot be compiled as an expression",
                1,
                1,
            )),
            (Fragment::Expression(_), FragmentMode::Statements) => Err(FragmentError::new(
                "an expression tree cannot be compiled as a statement suite",
                1,
                1,
            )),
        }
    }
}

/// Module-style code for a suite: a line marker per statement, then
/// `return None`.
pub fn compile_statements(body: &[Stmt], filename: &str) -> Result<CodeObject, FragmentError> {
    let mut cg = CodeGenerator::new(filename);
    for stmt in body {
        cg.set_lineno(stmt.line);
        emit_stmt(&mut cg, stmt);
    }
    cg.load_const(Const::None);
    cg.return_value();

    let first = body.first().map_or(1, |s| s.line);
    trace!(statements = body.len(), first, "compiled statement fragment");
    finish(cg, first)
}

/// Code that evaluates `expr` and returns it.
pub fn compile_expression(expr: &Expr, filename: &str) -> Result<CodeObject, FragmentError> {
    let mut cg = CodeGenerator::new(filename);
    cg.set_lineno(1);
    emit_expr(&mut cg, expr);
    cg.return_value();
    finish(cg, 1)
}

fn finish(cg: CodeGenerator, first: u32) -> Result<CodeObject, FragmentError> {
    cg.to_code(CodeMeta::new("<module>").first_line(first))
        .map_err(|e| FragmentError::new(e.to_string(), first as usize, 1))
}

fn emit_stmt(cg: &mut CodeGenerator, stmt: &Stmt) {
    match &stmt.kind {
        StmtKind::Expr(expr) => {
            emit_expr(cg, expr);
            cg.pop_top();
        }
        StmtKind::Assign(target, value) => {
            emit_expr(cg, value);
            match target {
                Target::Name(name) => cg.store_name(name),
                Target::Attribute(obj, attr) => {
                    emit_expr(cg, obj);
                    cg.store_attr(attr);
                }
                Target::Subscript(obj, key) => {
                    emit_expr(cg, obj);
                    emit_expr(cg, key);
                    cg.store_subscr();
                }
            }
        }
        StmtKind::Delete(name) => cg.delete_name(name),
        StmtKind::Raise(expr) => {
            emit_expr(cg, expr);
            cg.raise_varargs(1);
        }
        StmtKind::Pass => {}
    }
}

fn emit_expr(cg: &mut CodeGenerator, expr: &Expr) {
    match expr {
        Expr::Literal(value) => cg.load_const(value.clone()),
        Expr::Name(name) => cg.load_name(name),
        Expr::Attribute(obj, attr) => {
            emit_expr(cg, obj);
            cg.load_attr(attr);
        }
        Expr::Subscript(obj, key) => {
            emit_expr(cg, obj);
            emit_expr(cg, key);
            cg.binary_subscr();
        }
        Expr::Call { func, args, kwargs } => {
            emit_expr(cg, func);
            for arg in args {
                emit_expr(cg, arg);
            }
            for (name, value) in kwargs {
                cg.load_const(Const::String(name.clone()));
                emit_expr(cg, value);
            }
            cg.call_function(args.len() as u32, kwargs.len() as u32);
        }
        Expr::Tuple(items) => {
            // All-constant tuples are folded like the empty one.
            if let Some(folded) = fold_tuple(items) {
                cg.load_const(folded);
                return;
            }
            for item in items {
                emit_expr(cg, item);
            }
            cg.build_tuple(items.len() as u32);
        }
        Expr::List(items) => {
            for item in items {
                emit_expr(cg, item);
            }
            cg.build_list(items.len() as u32);
        }
        Expr::Dict(pairs) => {
            cg.build_map(pairs.len() as u32);
            for (key, value) in pairs {
                emit_expr(cg, value);
                emit_expr(cg, key);
                cg.store_map();
            }
        }
        Expr::Negate(operand) => {
            emit_expr(cg, operand);
            cg.unary_negative();
        }
        Expr::Not(operand) => {
            emit_expr(cg, operand);
            cg.unary_not();
        }
        Expr::Binary(op, left, right) => {
            emit_expr(cg, left);
            emit_expr(cg, right);
            cg.binary_op(*op);
        }
        Expr::Compare(op, left, right) => {
            emit_expr(cg, left);
            emit_expr(cg, right);
            cg.compare_op(*op);
        }
        Expr::IfElse {
            cond,
            then,
            otherwise,
        } => {
            let else_label = cg.new_label();
            let end_label = cg.new_label();
            emit_expr(cg, cond);
            cg.pop_jump_if_false(else_label);
            emit_expr(cg, then);
            cg.jump_forward(end_label);
            cg.mark_label(else_label);
            emit_expr(cg, otherwise);
            cg.mark_label(end_label);
        }
    }
}

fn fold_tuple(items: &[Expr]) -> Option<Const> {
    items
        .iter()
        .map(|item| match item {
            Expr::Literal(value) => Some(value.clone()),
            Expr::Tuple(inner) => fold_tuple(inner),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()
        .map(Const::Tuple)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::label::LabelAllocator;
    use crate::bytecode::op::{BinOp, Op, Opcode};

    fn ops_of(code: &CodeObject) -> Vec<Op> {
        code.to_ops(&mut LabelAllocator::new()).unwrap()
    }

    fn compile(source: &str, mode: FragmentMode) -> CodeObject {
        SourceCompiler
            .compile(Fragment::Source(source), "<test>", mode)
            .unwrap()
    }

    #[test]
    fn test_statement_framing() {
        let code = compile("a = 1\nb = a + 2", FragmentMode::Statements);
        let ops = ops_of(&code);

        assert_eq!(ops[0], Op::SetLineno(1));
        assert_eq!(
            &ops[1..],
            &[
                Op::LoadConst(Const::Integer(1)),
                Op::StoreName("a".into()),
                Op::SetLineno(2),
                Op::LoadName("a".into()),
                Op::LoadConst(Const::Integer(2)),
                Op::BinaryOp(BinOp::Add),
                Op::StoreName("b".into()),
                Op::LoadConst(Const::None),
                Op::ReturnValue,
            ]
        );
        assert_eq!(code.name, "<module>");
        assert_eq!(code.filename, "<test>");
    }

    #[test]
    fn test_empty_suite_keeps_framing() {
        let code = compile("", FragmentMode::Statements);
        assert_eq!(
            ops_of(&code),
            vec![Op::SetLineno(1), Op::LoadConst(Const::None), Op::ReturnValue]
        );
    }

    #[test]
    fn test_expression_returns_value() {
        let code = compile("f(x, y=2)", FragmentMode::Expression);
        let opcodes: Vec<Opcode> = code.code.iter().map(|i| i.opcode).collect();
        assert_eq!(
            opcodes,
            vec![
                Opcode::LoadName,
                Opcode::LoadName,
                Opcode::LoadConst,
                Opcode::LoadConst,
                Opcode::CallFunction,
                Opcode::ReturnValue,
            ]
        );
        assert_eq!(code.code[4].arg, 0x0101);
        assert_eq!(code.stacksize, 4);
    }

    #[test]
    fn test_conditional_expression_branches() {
        let code = compile("1 if c else 2", FragmentMode::Expression);
        assert_eq!(code.code[1].opcode, Opcode::PopJumpIfFalse);
        assert_eq!(code.jump_target(1), Some(4));
        assert_eq!(code.jump_target(3), Some(5));
        assert_eq!(code.stacksize, 1);
    }

    #[test]
    fn test_targets() {
        let code = compile("obj.x = 1\nd[k] = 2\ndel tmp", FragmentMode::Statements);
        let opcodes: Vec<Opcode> = code.code.iter().map(|i| i.opcode).collect();
        assert!(opcodes.contains(&Opcode::StoreAttr));
        assert!(opcodes.contains(&Opcode::StoreSubscr));
        assert!(opcodes.contains(&Opcode::DeleteName));
    }

    #[test]
    fn test_dict_display_order() {
        let code = compile("{'k': v}", FragmentMode::Expression);
        let opcodes: Vec<Opcode> = code.code.iter().map(|i| i.opcode).collect();
        assert_eq!(
            opcodes,
            vec![
                Opcode::BuildMap,
                Opcode::LoadName,
                Opcode::LoadConst,
                Opcode::StoreMap,
                Opcode::ReturnValue,
            ]
        );
    }

    #[test]
    fn test_constant_tuple_is_folded() {
        let code = compile("(1, ('a', None))", FragmentMode::Expression);
        assert_eq!(code.code.len(), 2);
        assert_eq!(
            code.consts[0],
            Const::Tuple(vec![
                Const::Integer(1),
                Const::Tuple(vec![Const::String("a".into()), Const::None]),
            ])
        );
    }

    #[test]
    fn test_raise_statement() {
        let code = compile("raise ValueError('x')", FragmentMode::Statements);
        assert!(code.code.iter().any(|i| i.opcode == Opcode::RaiseVarargs && i.arg == 1));
    }

    #[test]
    fn test_mode_mismatch_for_trees() {
        let body = parse_statements("pass").unwrap();
        let err = SourceCompiler
            .compile(Fragment::Statements(&body), "<test>", FragmentMode::Expression)
            .unwrap_err();
        assert!(err.message.contains("cannot be compiled as an expression"));
    }

    #[test]
    fn test_parsed_tree_compiles_like_source() {
        let expr = parse_expression("a * 3").unwrap();
        let from_tree = SourceCompiler
            .compile(Fragment::Expression(&expr), "<test>", FragmentMode::Expression)
            .unwrap();
        assert_eq!(from_tree, compile("a * 3", FragmentMode::Expression));
    }
}
