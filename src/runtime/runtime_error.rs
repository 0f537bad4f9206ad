use crate::runtime::value::{Exception, TraceEntry, Value};
use std::rc::Rc;

/// An exception that escaped every frame.
#[derive(Clone)]
pub struct Raised {
    pub exception: Rc<Exception>,
    /// Outermost frame first.
    pub traceback: Vec<TraceEntry>,
}

impl Raised {
    pub fn kind(&self) -> &str {
        &self.exception.kind
    }

    pub fn args(&self) -> &[Value] {
        &self.exception.args
    }

    /// Function names along the traceback, outermost first.
    pub fn frames(&self) -> Vec<&str> {
        self.traceback.iter().map(|e| e.name.as_str()).collect()
    }
}

impl std::fmt::Debug for Raised {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Raised({}, {:?})", self.exception, self.frames())
    }
}

#[derive(Debug)]
pub enum RuntimeError {
    /// An uncaught exception.
    Raised(Raised),
    /// A limit was hit or the code is not executable. Not catchable.
    Fatal {
        message: String,
        call_stack: Vec<String>,
    },
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeError::Raised(raised) => {
                writeln!(f, "Traceback (most recent call last):")?;
                for entry in &raised.traceback {
                    writeln!(f, "  {}", entry)?;
                }
                write!(f, "{}", raised.exception)
            }
            RuntimeError::Fatal {
                message,
                call_stack,
            } => {
                write!(f, "runtime error: {}", message)?;

                if !call_stack.is_empty() {
                    write!(f, "\n  call stack:")?;

                    for (i, frame) in call_stack.iter().rev().enumerate() {
                        write!(f, "\n    {}: {}", i, frame)?;
                    }
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for RuntimeError {}

impl RuntimeError {
    pub fn fatal(msg: impl Into<String>) -> Self {
        RuntimeError::Fatal {
            message: msg.into(),
            call_stack: Vec::new(),
        }
    }

    pub fn with_context(mut self, context: &str) -> Self {
        if let RuntimeError::Fatal { call_stack, .. } = &mut self {
            call_stack.push(context.to_string());
        }
        self
    }

    pub fn as_raised(&self) -> Option<&Raised> {
        match self {
            RuntimeError::Raised(raised) => Some(raised),
            RuntimeError::Fatal { .. } => None,
        }
    }
}

// Constructors for the exceptions the interpreter itself raises.

pub fn type_error(message: impl Into<String>) -> Exception {
    exception("TypeError", message)
}

pub fn name_error(name: &str) -> Exception {
    exception("NameError", format!("name '{}' is not defined", name))
}

pub fn unbound_local(name: &str) -> Exception {
    exception(
        "UnboundLocalError",
        format!("local variable '{}' referenced before assignment", name),
    )
}

pub fn attribute_error(type_name: &str, attr: &str) -> Exception {
    exception(
        "AttributeError",
        format!("'{}' object has no attribute '{}'", type_name, attr),
    )
}

pub fn division_by_zero() -> Exception {
    exception("ZeroDivisionError", "integer division or modulo by zero")
}

pub fn exception(kind: &str, message: impl Into<String>) -> Exception {
    Exception::new(kind, vec![Value::str(&message.into())])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_display_with_call_stack() {
        let err = RuntimeError::fatal("step limit exceeded")
            .with_context("inner")
            .with_context("outer");
        let msg = err.to_string();
        assert!(msg.starts_with("runtime error: step limit exceeded"));
        assert!(msg.contains("0: outer"));
        assert!(msg.contains("1: inner"));
    }

    #[test]
    fn test_raised_display() {
        let err = RuntimeError::Raised(Raised {
            exception: Rc::new(name_error("x")),
            traceback: vec![TraceEntry {
                filename: "a.kv".into(),
                name: "<module>".into(),
                line: 3,
            }],
        });
        assert_eq!(
            err.to_string(),
            "Traceback (most recent call last):\n  File \"a.kv\", line 3, in <module>\nNameError: name 'x' is not defined"
        );
    }
}
