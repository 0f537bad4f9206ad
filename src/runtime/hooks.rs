//! Native receivers for traced and inverted code.
//!
//! Code rewritten by `bytecode::instrument` loads a tracer or inverter from a
//! reserved fast local and calls methods on it. A Rust implementation of
//! [`CodeTracer`] or [`CodeInverter`] is handed to the interpreter as
//! [`Value::Tracer`] / [`Value::Inverter`]; attribute lookup on it yields a
//! bound [`HookMethod`] that dispatches back to the trait.

use crate::runtime::runtime_error::{exception, type_error};
use crate::runtime::value::{Exception, Value};
use std::rc::Rc;

/// Observes evaluation of traced code. Every method defaults to doing
/// nothing; an error aborts the traced code with that exception.
pub trait CodeTracer {
    /// Before `LOAD_ATTR`.
    fn load_attr(&self, _obj: &Value, _attr: &str) -> Result<(), Exception> {
        Ok(())
    }

    /// Before `CALL_FUNCTION`. `args` holds the positional arguments
    /// followed by alternating keyword names and values, as `argspec`
    /// describes.
    fn call_function(&self, _func: &Value, _args: &[Value], _argspec: u32) -> Result<(), Exception> {
        Ok(())
    }

    /// Before `BINARY_SUBSCR`.
    fn binary_subscr(&self, _obj: &Value, _index: &Value) -> Result<(), Exception> {
        Ok(())
    }

    /// Before `GET_ITER`.
    fn get_iter(&self, _obj: &Value) -> Result<(), Exception> {
        Ok(())
    }

    /// Before `RETURN_VALUE`.
    fn return_value(&self, _value: &Value) -> Result<(), Exception> {
        Ok(())
    }
}

/// Performs the store that undoes the final load of an inverted expression.
/// Every method defaults to [`CodeInverter::fail`].
pub trait CodeInverter {
    fn fail(&self) -> Exception {
        exception("RuntimeError", "can't assign to expression")
    }

    /// The expression was a bare name.
    fn load_name(&self, _name: &str, _value: &Value) -> Result<(), Exception> {
        Err(self.fail())
    }

    /// The expression ended in an attribute load.
    fn load_attr(&self, _obj: &Value, _attr: &str, _value: &Value) -> Result<(), Exception> {
        Err(self.fail())
    }

    /// The expression ended in a call.
    fn call_function(
        &self,
        _func: &Value,
        _args: &[Value],
        _argspec: u32,
        _value: &Value,
    ) -> Result<(), Exception> {
        Err(self.fail())
    }

    /// The expression ended in a subscript.
    fn binary_subscr(&self, _obj: &Value, _index: &Value, _value: &Value) -> Result<(), Exception> {
        Err(self.fail())
    }
}

pub const TRACER_METHODS: &[&str] = &[
    "load_attr",
    "call_function",
    "binary_subscr",
    "get_iter",
    "return_value",
];

pub const INVERTER_METHODS: &[&str] = &["load_name", "load_attr", "call_function", "binary_subscr"];

#[derive(Clone)]
pub enum HookTarget {
    Tracer(Rc<dyn CodeTracer>),
    Inverter(Rc<dyn CodeInverter>),
}

/// A tracer or inverter method bound to its receiver.
#[derive(Clone)]
pub struct HookMethod {
    pub target: HookTarget,
    pub name: &'static str,
}

impl HookMethod {
    /// Bind `name` on a tracer or inverter value.
    pub fn lookup(obj: &Value, name: &str) -> Option<Value> {
        let (target, methods) = match obj {
            Value::Tracer(t) => (HookTarget::Tracer(t.clone()), TRACER_METHODS),
            Value::Inverter(i) => (HookTarget::Inverter(i.clone()), INVERTER_METHODS),
            _ => return None,
        };
        let name = methods.iter().copied().find(|m| *m == name)?;
        Some(Value::HookMethod(Rc::new(HookMethod { target, name })))
    }

    pub fn owner(&self) -> &'static str {
        match self.target {
            HookTarget::Tracer(_) => "tracer",
            HookTarget::Inverter(_) => "inverter",
        }
    }

    /// Invoke the method with positional arguments. Always returns `None`.
    pub fn call(&self, args: &[Value]) -> Result<Value, Exception> {
        let arity = |n: usize| -> Result<(), Exception> {
            if args.len() == n {
                Ok(())
            } else {
                Err(type_error(format!(
                    "{}.{}() takes exactly {} arguments ({} given)",
                    self.owner(),
                    self.name,
                    n,
                    args.len()
                )))
            }
        };

        match &self.target {
            HookTarget::Tracer(tracer) => match self.name {
                "load_attr" => {
                    arity(2)?;
                    tracer.load_attr(&args[0], str_arg(&args[1])?)?;
                }
                "call_function" => {
                    arity(3)?;
                    tracer.call_function(&args[0], &tuple_arg(&args[1])?, argspec_arg(&args[2])?)?;
                }
                "binary_subscr" => {
                    arity(2)?;
                    tracer.binary_subscr(&args[0], &args[1])?;
                }
                "get_iter" => {
                    arity(1)?;
                    tracer.get_iter(&args[0])?;
                }
                _ => {
                    arity(1)?;
                    tracer.return_value(&args[0])?;
                }
            },
            HookTarget::Inverter(inverter) => match self.name {
                "load_name" => {
                    arity(2)?;
                    inverter.load_name(str_arg(&args[0])?, &args[1])?;
                }
                "load_attr" => {
                    arity(3)?;
                    inverter.load_attr(&args[0], str_arg(&args[1])?, &args[2])?;
                }
                "call_function" => {
                    arity(4)?;
                    inverter.call_function(
                        &args[0],
                        &tuple_arg(&args[1])?,
                        argspec_arg(&args[2])?,
                        &args[3],
                    )?;
                }
                _ => {
                    arity(3)?;
                    inverter.binary_subscr(&args[0], &args[1], &args[2])?;
                }
            },
        }
        Ok(Value::None)
    }
}

fn str_arg(value: &Value) -> Result<&str, Exception> {
    match value {
        Value::Str(s) => Ok(&**s),
        other => Err(type_error(format!("expected a name, got {}", other.type_name()))),
    }
}

fn tuple_arg(value: &Value) -> Result<Vec<Value>, Exception> {
    match value {
        Value::Tuple(items) => Ok(items.as_ref().clone()),
        other => Err(type_error(format!(
            "expected an argument tuple, got {}",
            other.type_name()
        ))),
    }
}

fn argspec_arg(value: &Value) -> Result<u32, Exception> {
    value
        .as_int()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| type_error("argspec must be a non-negative int"))
}
