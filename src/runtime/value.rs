use crate::bytecode::ir::CodeObject;
use crate::lang::value::Const;
use crate::runtime::hooks::{CodeInverter, CodeTracer, HookMethod};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// A mutable name -> value mapping: globals, name locals, namespace objects.
pub type Scope = Rc<RefCell<HashMap<String, Value>>>;

pub fn new_scope() -> Scope {
    Rc::new(RefCell::new(HashMap::new()))
}

#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Str(Rc<str>),
    Tuple(Rc<Vec<Value>>),
    List(Rc<RefCell<Vec<Value>>>),
    /// Insertion ordered; keys are compared with `==`.
    Dict(Rc<RefCell<Vec<(Value, Value)>>>),
    /// Attribute bag, also subscriptable by string key.
    Namespace(Scope),
    Code(Rc<CodeObject>),
    Function(Rc<Function>),
    Builtin(Builtin),
    ExceptionType(Rc<str>),
    Exception(Rc<Exception>),
    Traceback(Rc<Vec<TraceEntry>>),
    Iterator(Rc<RefCell<SeqIter>>),
    /// Receiver for calls made by traced code.
    Tracer(Rc<dyn CodeTracer>),
    /// Receiver for the store performed by inverted code.
    Inverter(Rc<dyn CodeInverter>),
    HookMethod(Rc<HookMethod>),
}

pub struct Function {
    pub code: Rc<CodeObject>,
    pub defaults: Vec<Value>,
    pub globals: Scope,
    /// Values for the code's free variables, by position.
    pub closure: Vec<Value>,
}

impl Function {
    pub fn new(code: Rc<CodeObject>, globals: Scope) -> Self {
        Self {
            code,
            defaults: Vec::new(),
            globals,
            closure: Vec::new(),
        }
    }

    pub fn with_defaults(mut self, defaults: Vec<Value>) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_closure(mut self, closure: Vec<Value>) -> Self {
        self.closure = closure;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Globals,
    Len,
    Range,
    Namespace,
}

impl Builtin {
    pub fn name(self) -> &'static str {
        match self {
            Builtin::Globals => "globals",
            Builtin::Len => "len",
            Builtin::Range => "range",
            Builtin::Namespace => "namespace",
        }
    }
}

pub const EXCEPTION_TYPES: &[&str] = &[
    "Exception",
    "TypeError",
    "ValueError",
    "NameError",
    "UnboundLocalError",
    "AttributeError",
    "KeyError",
    "IndexError",
    "ZeroDivisionError",
    "OverflowError",
    "RuntimeError",
];

/// The builtin namespace consulted after globals.
pub fn builtins() -> HashMap<String, Value> {
    let mut map = HashMap::new();
    for b in [Builtin::Globals, Builtin::Len, Builtin::Range, Builtin::Namespace] {
        map.insert(b.name().to_string(), Value::Builtin(b));
    }
    for kind in EXCEPTION_TYPES {
        map.insert(kind.to_string(), Value::ExceptionType(Rc::from(*kind)));
    }
    map
}

#[derive(Debug)]
pub struct Exception {
    pub kind: Rc<str>,
    pub args: Vec<Value>,
}

impl Exception {
    pub fn new(kind: &str, args: Vec<Value>) -> Self {
        Self {
            kind: Rc::from(kind),
            args,
        }
    }

    /// `kind` catches this exception: same kind, or the root `Exception`.
    pub fn is_instance_of(&self, kind: &str) -> bool {
        &*self.kind == kind || kind == "Exception"
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.args.as_slice() {
            [] => write!(f, "{}", self.kind),
            [Value::Str(s)] => write!(f, "{}: {}", self.kind, s),
            [one] => write!(f, "{}: {}", self.kind, one),
            many => write!(f, "{}: {}", self.kind, Value::Tuple(Rc::new(many.to_vec()))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TraceEntry {
    pub filename: String,
    pub name: String,
    pub line: u32,
}

impl fmt::Display for TraceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "File \"{}\", line {}, in {}", self.filename, self.line, self.name)
    }
}

/// Iterator over a snapshot of a sequence.
pub struct SeqIter {
    items: Vec<Value>,
    pos: usize,
}

impl SeqIter {
    pub fn new(items: Vec<Value>) -> Self {
        Self { items, pos: 0 }
    }

    pub fn next_item(&mut self) -> Option<Value> {
        let item = self.items.get(self.pos).cloned()?;
        self.pos += 1;
        Some(item)
    }
}

impl From<&Const> for Value {
    fn from(c: &Const) -> Self {
        match c {
            Const::None => Value::None,
            Const::Bool(b) => Value::Bool(*b),
            Const::Integer(n) => Value::Integer(*n),
            Const::Float(f) => Value::Float(*f),
            Const::String(s) => Value::Str(Rc::from(s.as_str())),
            Const::Tuple(items) => Value::Tuple(Rc::new(items.iter().map(Value::from).collect())),
            Const::Code(code) => Value::Code(Rc::new((**code).clone())),
        }
    }
}

impl Value {
    pub fn str(s: &str) -> Self {
        Value::Str(Rc::from(s))
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn tuple(items: Vec<Value>) -> Self {
        Value::Tuple(Rc::new(items))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Integer(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Tuple(_) => "tuple",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Namespace(_) => "namespace",
            Value::Code(_) => "code",
            Value::Function(_) => "function",
            Value::Builtin(_) => "builtin_function",
            Value::ExceptionType(_) => "type",
            Value::Exception(_) => "exception",
            Value::Traceback(_) => "traceback",
            Value::Iterator(_) => "iterator",
            Value::Tracer(_) => "tracer",
            Value::Inverter(_) => "inverter",
            Value::HookMethod(_) => "method",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Integer(n) => *n != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Tuple(items) => !items.is_empty(),
            Value::List(items) => !items.borrow().is_empty(),
            Value::Dict(pairs) => !pairs.borrow().is_empty(),
            _ => true,
        }
    }

    /// Integer view of ints and bools.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            other => other.as_int().map(|n| n as f64),
        }
    }

    /// Items of a finite sequence, for iteration and `*args`.
    pub fn sequence_items(&self) -> Option<Vec<Value>> {
        match self {
            Value::Tuple(items) => Some(items.as_ref().clone()),
            Value::List(items) => Some(items.borrow().clone()),
            Value::Dict(pairs) => Some(pairs.borrow().iter().map(|(k, _)| k.clone()).collect()),
            Value::Str(s) => Some(s.chars().map(|c| Value::str(&c.to_string())).collect()),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        use Value::*;
        match (self, other) {
            (None, None) => true,
            (Float(_), _) | (_, Float(_)) => match (self.as_float(), other.as_float()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
            (Integer(_) | Bool(_), Integer(_) | Bool(_)) => self.as_int() == other.as_int(),
            (Str(a), Str(b)) => a == b,
            (Tuple(a), Tuple(b)) => a == b,
            (List(a), List(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Dict(a), Dict(b)) => {
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len()
                    && a.iter().all(|(k, v)| b.iter().any(|(k2, v2)| k == k2 && v == v2))
            }
            (Namespace(a), Namespace(b)) => Rc::ptr_eq(a, b),
            (Code(a), Code(b)) => Rc::ptr_eq(a, b) || a == b,
            (Function(a), Function(b)) => Rc::ptr_eq(a, b),
            (Builtin(a), Builtin(b)) => a == b,
            (ExceptionType(a), ExceptionType(b)) => a == b,
            (Exception(a), Exception(b)) => Rc::ptr_eq(a, b),
            (Traceback(a), Traceback(b)) => Rc::ptr_eq(a, b),
            (Iterator(a), Iterator(b)) => Rc::ptr_eq(a, b),
            (Tracer(a), Tracer(b)) => Rc::ptr_eq(a, b),
            (Inverter(a), Inverter(b)) => Rc::ptr_eq(a, b),
            (Value::HookMethod(a), Value::HookMethod(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(true) => write!(f, "True"),
            Value::Bool(false) => write!(f, "False"),
            Value::Integer(n) => write!(f, "{}", n),
            Value::Float(x) => write!(f, "{:?}", x),
            Value::Str(s) => write!(f, "'{}'", s.escape_default()),
            Value::Tuple(items) => {
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
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Dict(pairs) => {
                write!(f, "{{")?;
                for (i, (k, v)) in pairs.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Value::Namespace(scope) => {
                let scope = scope.borrow();
                let mut keys: Vec<&String> = scope.keys().collect();
                keys.sort();
                write!(f, "namespace(")?;
                for (i, key) in keys.into_iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}={}", key, scope[key])?;
                }
                write!(f, ")")
            }
            Value::Code(code) => write!(f, "<code {}>", code.name),
            Value::Function(func) => write!(f, "<function {}>", func.code.name),
            Value::Builtin(b) => write!(f, "<built-in function {}>", b.name()),
            Value::ExceptionType(kind) => write!(f, "<type '{}'>", kind),
            Value::Exception(exc) => write!(f, "{}", exc),
            Value::Traceback(entries) => write!(f, "<traceback of {} frames>", entries.len()),
            Value::Iterator(_) => write!(f, "<iterator>"),
            Value::Tracer(_) => write!(f, "<tracer>"),
            Value::Inverter(_) => write!(f, "<inverter>"),
            Value::HookMethod(m) => write!(f, "<method {}.{}>", m.owner(), m.name),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_equality_crosses_types() {
        assert_eq!(Value::Integer(1), Value::Float(1.0));
        assert_eq!(Value::Bool(true), Value::Integer(1));
        assert_ne!(Value::Integer(1), Value::str("1"));
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::None.is_truthy());
        assert!(!Value::tuple(vec![]).is_truthy());
        assert!(!Value::str("").is_truthy());
        assert!(Value::list(vec![Value::None]).is_truthy());
        assert!(Value::Integer(-1).is_truthy());
    }

    #[test]
    fn test_from_const() {
        let c = Const::Tuple(vec![Const::Integer(1), Const::String("a".into())]);
        assert_eq!(Value::from(&c), Value::tuple(vec![Value::Integer(1), Value::str("a")]));
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::tuple(vec![Value::Integer(1)]).to_string(), "(1,)");
        assert_eq!(Value::list(vec![Value::str("x"), Value::None]).to_string(), "['x', None]");
        let exc = Exception::new("ValueError", vec![Value::str("bad")]);
        assert_eq!(exc.to_string(), "ValueError: bad");
    }

    #[test]
    fn test_exception_matching() {
        let exc = Exception::new("KeyError", vec![]);
        assert!(exc.is_instance_of("KeyError"));
        assert!(exc.is_instance_of("Exception"));
        assert!(!exc.is_instance_of("ValueError"));
    }
}
