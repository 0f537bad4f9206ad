//! Tracing and inversion passes over a symbolic instruction stream.
//!
//! Tracing inserts, before every attribute load, call, subscript, iterator
//! fetch and return, a call to the matching method of a tracer object read
//! from the `_[tracer]` local. The traced instruction still runs on the same
//! operands afterwards.
//!
//! Inversion replaces the final load of an expression with a call to an
//! inverter read from `_[inverter]`, handing it the operands of that load and
//! the value in `_[value]` so it can perform the corresponding store.

use crate::bytecode::assemble::{CodeMeta, assemble};
use crate::bytecode::assemble_error::AssembleError;
use crate::bytecode::ir::{CodeFlags, CodeObject};
use crate::bytecode::label::LabelAllocator;
use crate::bytecode::op::{Op, argspec};
use crate::lang::value::Const;
use tracing::debug;

/// Local holding the tracer of traced code.
pub const TRACER_SLOT: &str = "_[tracer]";

/// Local holding the inverter of inverted code.
pub const INVERTER_SLOT: &str = "_[inverter]";

/// Local holding the value inverted code stores.
pub const VALUE_SLOT: &str = "_[value]";

fn call(n: u8) -> Op {
    Op::CallFunction { args: n, kwds: 0 }
}

fn method(load_receiver: &Op, name: &str) -> [Op; 2] {
    [load_receiver.clone(), Op::LoadAttr(name.to_string())]
}

/// Return a copy of `ops` that reports to a tracer as it runs.
///
/// Top-level code reads the tracer with `LOAD_FAST`, so the caller must
/// declare [`TRACER_SLOT`] as a parameter. With `nested` set the tracer is
/// read with `LOAD_NAME` instead; nested code objects loaded as constants
/// that share their caller's namespace are traced that way, while ones with
/// a fresh namespace are left alone.
pub fn inject_tracing(ops: &[Op], nested: bool) -> Result<Vec<Op>, AssembleError> {
    let tracer = if nested {
        Op::LoadName(TRACER_SLOT.to_string())
    } else {
        Op::LoadFast(TRACER_SLOT.to_string())
    };

    let mut out = Vec::with_capacity(ops.len() * 2);
    let mut hooks = 0usize;
    for op in ops {
        match op {
            // obj
            Op::LoadAttr(attr) => {
                out.push(Op::DupTop);
                out.extend(method(&tracer, "load_attr"));
                out.push(Op::RotTwo);
                out.push(Op::LoadConst(Const::String(attr.clone())));
                out.push(call(2));
                out.push(Op::PopTop);
            }
            // func arg0 .. argN
            Op::CallFunction { args, kwds } => {
                let n = u32::from(*args) + 2 * u32::from(*kwds);
                out.push(Op::BuildTuple(n));
                out.push(Op::DupTopTwo);
                out.extend(method(&tracer, "call_function"));
                out.push(Op::RotThree);
                out.push(Op::LoadConst(Const::Integer(i64::from(argspec(*args, *kwds)))));
                out.push(call(3));
                out.push(Op::PopTop);
                // Unpacking twice restores the original argument order.
                out.push(Op::UnpackSequence(n));
                out.push(Op::BuildTuple(n));
                out.push(Op::UnpackSequence(n));
            }
            // obj index
            Op::BinarySubscr => {
                out.push(Op::DupTopTwo);
                out.extend(method(&tracer, "binary_subscr"));
                out.push(Op::RotThree);
                out.push(call(2));
                out.push(Op::PopTop);
            }
            Op::GetIter | Op::ReturnValue => {
                let name = if matches!(op, Op::GetIter) { "get_iter" } else { "return_value" };
                out.push(Op::DupTop);
                out.extend(method(&tracer, name));
                out.push(Op::RotTwo);
                out.push(call(1));
                out.push(Op::PopTop);
            }
            Op::LoadConst(Const::Code(code)) if !code.flags.contains(CodeFlags::NEWLOCALS) => {
                let traced = trace_nested(code)?;
                out.push(Op::LoadConst(Const::Code(Box::new(traced))));
                continue;
            }
            _ => {
                out.push(op.clone());
                continue;
            }
        }
        hooks += 1;
        out.push(op.clone());
    }

    debug!(hooks, nested, "injected tracing");
    Ok(out)
}

/// Decode, trace and reassemble a code object run in its caller's namespace.
fn trace_nested(code: &CodeObject) -> Result<CodeObject, AssembleError> {
    let ops = code.to_ops(&mut LabelAllocator::new())?;
    let traced = inject_tracing(&ops, true)?;
    assemble(&code.filename, &traced, meta_of(code))
}

/// The metadata that reassembles `code` with the same signature.
fn meta_of(code: &CodeObject) -> CodeMeta {
    let varargs = code.flags.contains(CodeFlags::VARARGS);
    let varkwargs = code.flags.contains(CodeFlags::VARKEYWORDS);
    let n_params = code.argcount as usize + usize::from(varargs) + usize::from(varkwargs);

    let mut meta = CodeMeta::new(code.name.clone())
        .args(code.varnames.iter().take(n_params).cloned())
        .freevars(code.freevars.iter().cloned())
        .varargs(varargs)
        .varkwargs(varkwargs)
        .newlocals(code.flags.contains(CodeFlags::NEWLOCALS))
        .first_line(code.firstlineno);
    meta.docstring = code.docstring.clone();
    meta
}

/// Return a copy of `ops` that stores into the expression it computes.
///
/// The stream must end with a load followed by `RETURN_VALUE`. The load is
/// replaced by a call to the matching inverter method, which receives the
/// load's operands and the value of [`VALUE_SLOT`]. A bare `LOAD_NAME` is
/// only invertible when it is the whole expression. Every other final load
/// is rejected with [`AssembleError::NotInvertible`].
pub fn inject_inversion(ops: &[Op]) -> Result<Vec<Op>, AssembleError> {
    let real: Vec<usize> = ops
        .iter()
        .enumerate()
        .filter(|(_, op)| !matches!(op, Op::SetLineno(_)))
        .map(|(idx, _)| idx)
        .collect();

    let (tail_at, tail) = match real.as_slice() {
        [.., tail, ret] if matches!(ops[*ret], Op::ReturnValue) => (*tail, &ops[*tail]),
        _ => {
            return Err(AssembleError::NotInvertible {
                found: "a stream without a final return".to_string(),
            });
        }
    };

    let inverter = Op::LoadFast(INVERTER_SLOT.to_string());
    let value = Op::LoadFast(VALUE_SLOT.to_string());

    let mut out: Vec<Op> = ops[..tail_at].to_vec();
    match tail {
        Op::LoadName(name) if real.len() == 2 => {
            out.extend(method(&inverter, "load_name"));
            out.push(Op::LoadConst(Const::String(name.clone())));
            out.push(value);
            out.push(call(2));
        }
        // obj
        Op::LoadAttr(attr) => {
            out.extend(method(&inverter, "load_attr"));
            out.push(Op::RotTwo);
            out.push(Op::LoadConst(Const::String(attr.clone())));
            out.push(value);
            out.push(call(3));
        }
        // func arg0 .. argN
        Op::CallFunction { args, kwds } => {
            out.push(Op::BuildTuple(u32::from(*args) + 2 * u32::from(*kwds)));
            out.extend(method(&inverter, "call_function"));
            out.push(Op::RotThree);
            out.push(Op::LoadConst(Const::Integer(i64::from(argspec(*args, *kwds)))));
            out.push(value);
            out.push(call(4));
        }
        // obj index
        Op::BinarySubscr => {
            out.extend(method(&inverter, "binary_subscr"));
            out.push(Op::RotThree);
            out.push(value);
            out.push(call(3));
        }
        other => {
            return Err(AssembleError::NotInvertible {
                found: format!("{:?}", other),
            });
        }
    }
    out.push(Op::ReturnValue);

    debug!(tail = ?tail, "injected inversion");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::CodeGenerator;
    use crate::runtime::hooks::{CodeInverter, CodeTracer};
    use crate::runtime::value::{Exception, Value, new_scope};
    use crate::runtime::vm::Vm;
    use std::cell::RefCell;
    use std::collections::HashSet;
    use std::rc::Rc;

    #[derive(Default)]
    struct Recorder {
        events: RefCell<Vec<String>>,
    }

    impl Recorder {
        fn log(&self, event: String) -> Result<(), Exception> {
            self.events.borrow_mut().push(event);
            Ok(())
        }

        fn events(&self) -> Vec<String> {
            self.events.borrow().clone()
        }
    }

    impl CodeTracer for Recorder {
        fn load_attr(&self, _obj: &Value, attr: &str) -> Result<(), Exception> {
            self.log(format!("load_attr {}", attr))
        }

        fn call_function(&self, func: &Value, args: &[Value], argspec: u32) -> Result<(), Exception> {
            self.log(format!("call_function {} {:?} {}", func, args, argspec))
        }

        fn binary_subscr(&self, _obj: &Value, index: &Value) -> Result<(), Exception> {
            self.log(format!("binary_subscr {}", index))
        }

        fn get_iter(&self, obj: &Value) -> Result<(), Exception> {
            self.log(format!("get_iter {}", obj))
        }

        fn return_value(&self, value: &Value) -> Result<(), Exception> {
            self.log(format!("return_value {}", value))
        }
    }

    impl CodeInverter for Recorder {
        fn load_name(&self, name: &str, value: &Value) -> Result<(), Exception> {
            self.log(format!("{} = {}", name, value))
        }

        fn load_attr(&self, _obj: &Value, attr: &str, value: &Value) -> Result<(), Exception> {
            self.log(format!("obj.{} = {}", attr, value))
        }

        fn call_function(
            &self,
            func: &Value,
            args: &[Value],
            argspec: u32,
            value: &Value,
        ) -> Result<(), Exception> {
            self.log(format!("{}{:?} [{}] = {}", func, args, argspec, value))
        }

        fn binary_subscr(&self, _obj: &Value, index: &Value, value: &Value) -> Result<(), Exception> {
            self.log(format!("obj[{}] = {}", index, value))
        }
    }

    /// Compile `source` as a function body reading `obj` as a fast local.
    fn expression(source: &str) -> Vec<Op> {
        let mut cg = CodeGenerator::new("<test>");
        cg.insert_expr(source, true).unwrap();
        cg.return_value();
        let available: HashSet<&str> = ["obj"].into_iter().collect();
        cg.rewrite_to_fast_locals(&available);
        cg.ops().to_vec()
    }

    fn sample_obj() -> Value {
        let scope = new_scope();
        scope.borrow_mut().insert(
            "items".to_string(),
            Value::list(vec![Value::Integer(10), Value::Integer(20), Value::Integer(30)]),
        );
        Value::Namespace(scope)
    }

    fn hooked_code(ops: &[Op], slots: &[&str]) -> CodeObject {
        let mut args: Vec<&str> = slots.to_vec();
        args.push("obj");
        assemble("<test>", ops, CodeMeta::new("f").args(args).newlocals(true)).unwrap()
    }

    #[test]
    fn test_traced_code_reports_and_keeps_result() {
        let ops = expression("len(obj.items) + obj.items[1]");
        let plain = assemble("<test>", &ops, CodeMeta::new("f").args(["obj"]).newlocals(true)).unwrap();

        let traced = inject_tracing(&ops, false).unwrap();
        let code = hooked_code(&traced, &[TRACER_SLOT]);
        assert!(code.stacksize > plain.stacksize);

        let recorder = Rc::new(Recorder::default());
        let mut vm = Vm::new();
        let f = vm.function(plain);
        assert_eq!(vm.call(&f, vec![sample_obj()], vec![]).unwrap(), Value::Integer(23));

        let f = vm.function(code);
        let result = vm
            .call(&f, vec![Value::Tracer(recorder.clone()), sample_obj()], vec![])
            .unwrap();

        assert_eq!(result, Value::Integer(23));
        assert_eq!(
            recorder.events(),
            vec![
                "load_attr items",
                "call_function <built-in function len> [[10, 20, 30]] 1",
                "load_attr items",
                "binary_subscr 1",
                "return_value 23",
            ]
        );
    }

    #[test]
    fn test_traced_call_keeps_argument_order() {
        let ops = expression("range(obj.lo, 5)");
        let traced = inject_tracing(&ops, false).unwrap();
        let code = hooked_code(&traced, &[TRACER_SLOT]);

        let scope = new_scope();
        scope.borrow_mut().insert("lo".to_string(), Value::Integer(2));
        let recorder = Rc::new(Recorder::default());
        let mut vm = Vm::new();
        let f = vm.function(code);
        let result = vm
            .call(&f, vec![Value::Tracer(recorder.clone()), Value::Namespace(scope)], vec![])
            .unwrap();

        assert_eq!(
            result,
            Value::list(vec![Value::Integer(2), Value::Integer(3), Value::Integer(4)])
        );
        assert_eq!(
            recorder.events()[1],
            "call_function <built-in function range> [2, 5] 2"
        );
    }

    #[test]
    fn test_tracing_skips_other_ops() {
        let ops = vec![
            Op::SetLineno(1),
            Op::LoadFast("obj".to_string()),
            Op::UnaryNot,
            Op::ReturnValue,
        ];
        let traced = inject_tracing(&ops, false).unwrap();

        assert_eq!(&traced[..3], &ops[..3]);
        assert_eq!(traced.last(), Some(&Op::ReturnValue));
        assert!(traced.contains(&Op::LoadFast(TRACER_SLOT.to_string())));
        assert!(traced.contains(&Op::LoadAttr("return_value".to_string())));
    }

    #[test]
    fn test_nested_code_reads_tracer_by_name() {
        let mut inner = CodeGenerator::new("<test>");
        inner.load_name("x");
        inner.load_attr("y");
        inner.return_value();
        let shared = inner.to_code(CodeMeta::new("body")).unwrap();

        let mut own = CodeGenerator::new("<test>");
        own.load_fast("x");
        own.return_value();
        let fresh = own.to_code(CodeMeta::new("g").args(["x"]).newlocals(true)).unwrap();

        let ops = vec![
            Op::LoadConst(Const::Code(Box::new(shared))),
            Op::LoadConst(Const::Code(Box::new(fresh.clone()))),
            Op::BuildTuple(2),
            Op::ReturnValue,
        ];
        let traced = inject_tracing(&ops, false).unwrap();

        let Op::LoadConst(Const::Code(body)) = &traced[0] else {
            panic!("expected the nested code first");
        };
        assert_eq!(body.name, "body");
        assert!(body.names.contains(&TRACER_SLOT.to_string()));
        assert!(body.varnames.is_empty());
        let body_ops = body.to_ops(&mut LabelAllocator::new()).unwrap();
        assert!(body_ops.contains(&Op::LoadName(TRACER_SLOT.to_string())));
        assert!(body_ops.contains(&Op::LoadAttr("load_attr".to_string())));

        assert_eq!(traced[1], Op::LoadConst(Const::Code(Box::new(fresh))));
    }

    fn invert(source: &str) -> Result<(Value, Rc<Recorder>), String> {
        let ops = expression(source);
        let inverted = inject_inversion(&ops).map_err(|e| e.to_string())?;
        let code = hooked_code(&inverted, &[INVERTER_SLOT, VALUE_SLOT]);

        let recorder = Rc::new(Recorder::default());
        let mut vm = Vm::new();
        vm.set_global("target", Value::Builtin(crate::runtime::value::Builtin::Len));
        let f = vm.function(code);
        let result = vm
            .call(
                &f,
                vec![Value::Inverter(recorder.clone()), Value::Integer(7), sample_obj()],
                vec![],
            )
            .map_err(|e| e.to_string())?;
        Ok((result, recorder))
    }

    #[test]
    fn test_inverted_attribute_subscript_and_call() {
        let (result, recorder) = invert("obj.size").unwrap();
        assert_eq!(result, Value::None);
        assert_eq!(recorder.events(), vec!["obj.size = 7"]);

        let (_, recorder) = invert("obj.items[2]").unwrap();
        assert_eq!(recorder.events(), vec!["obj[2] = 7"]);

        let (_, recorder) = invert("target(obj.items, 1)").unwrap();
        assert_eq!(
            recorder.events(),
            vec!["<built-in function len>[[10, 20, 30], 1] [2] = 7"]
        );
    }

    #[test]
    fn test_inverted_bare_name() {
        let ops = vec![Op::SetLineno(1), Op::LoadName("x".to_string()), Op::ReturnValue];
        let inverted = inject_inversion(&ops).unwrap();
        let code = assemble(
            "<test>",
            &inverted,
            CodeMeta::new("f").args([INVERTER_SLOT, VALUE_SLOT]).newlocals(true),
        )
        .unwrap();

        let recorder = Rc::new(Recorder::default());
        let mut vm = Vm::new();
        let f = vm.function(code);
        vm.call(&f, vec![Value::Inverter(recorder.clone()), Value::str("v")], vec![])
            .unwrap();

        assert_eq!(recorder.events(), vec!["x = 'v'"]);
    }

    #[test]
    fn test_unsupported_tails_are_rejected() {
        let err = inject_inversion(&expression("obj.a + obj.b")).unwrap_err();
        assert!(matches!(err, AssembleError::NotInvertible { .. }));
        assert!(err.to_string().contains("can't invert"));

        // A name inside a larger expression is not a store target.
        let ops = vec![
            Op::LoadName("f".to_string()),
            Op::PopTop,
            Op::LoadName("x".to_string()),
            Op::ReturnValue,
        ];
        assert!(matches!(
            inject_inversion(&ops),
            Err(AssembleError::NotInvertible { .. })
        ));

        let ops = vec![Op::LoadFast("obj".to_string()), Op::PopTop];
        assert!(matches!(
            inject_inversion(&ops),
            Err(AssembleError::NotInvertible { .. })
        ));
    }

    #[test]
    fn test_default_inverter_refuses() {
        struct Refuse;
        impl CodeInverter for Refuse {}

        let inverted = inject_inversion(&expression("obj.size")).unwrap();
        let code = hooked_code(&inverted, &[INVERTER_SLOT, VALUE_SLOT]);
        let mut vm = Vm::new();
        let f = vm.function(code);
        let err = vm
            .call(&f, vec![Value::Inverter(Rc::new(Refuse)), Value::None, sample_obj()], vec![])
            .unwrap_err();

        assert!(err.to_string().contains("can't assign to expression"));
    }
}
