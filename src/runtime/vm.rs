use crate::bytecode::ir::{CodeFlags, CodeObject, Instruction};
use crate::bytecode::op::{BinOp, CmpOp, Opcode, split_argspec};
use crate::runtime::hooks::HookMethod;
use crate::runtime::runtime_error::{
    Raised, RuntimeError, attribute_error, division_by_zero, exception, name_error, type_error,
    unbound_local,
};
use crate::runtime::value::{
    Builtin, Exception, Function, Scope, SeqIter, TraceEntry, Value, builtins, new_scope,
};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, trace};

#[derive(Debug, Clone)]
pub struct VmConfig {
    pub max_call_depth: usize,
    pub max_steps: Option<usize>,
    pub max_stack_size: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_call_depth: 1000,
            max_steps: None,
            max_stack_size: 10_000,
        }
    }
}

/// Reference interpreter for code objects.
pub struct Vm {
    globals: Scope,
    builtins: HashMap<String, Value>,
    // Safety limits
    config: VmConfig,
    call_depth: usize,
    call_stack: Vec<String>,
    steps: usize,
}

/// Why a frame stopped early.
enum Unwind {
    Raise {
        exception: Rc<Exception>,
        /// Outermost frame first.
        traceback: Vec<TraceEntry>,
        /// Set for re-raises, which must not record the raising frame again.
        reraise: bool,
    },
    Fatal(RuntimeError),
}

impl From<Exception> for Unwind {
    fn from(exc: Exception) -> Self {
        Unwind::Raise {
            exception: Rc::new(exc),
            traceback: Vec::new(),
            reraise: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Loop,
    Except,
}

#[derive(Debug, Clone, Copy)]
struct Block {
    kind: BlockKind,
    handler: usize,
    /// Value stack height when the block was set up.
    level: usize,
}

struct Frame {
    code: Rc<CodeObject>,
    fast: Vec<Option<Value>>,
    /// Target of the dynamic name ops.
    names: Scope,
    globals: Scope,
    closure: Vec<Value>,
    stack: Vec<Value>,
    blocks: Vec<Block>,
    /// Exception being handled, for a bare re-raise.
    handled: Option<(Rc<Exception>, Vec<TraceEntry>)>,
    ip: usize,
}

enum Step {
    Continue,
    Return(Value),
    /// Push a new frame for a call to a code object.
    Call(Frame),
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        Self {
            globals: new_scope(),
            builtins: builtins(),
            config,
            call_depth: 0,
            call_stack: Vec::new(),
            steps: 0,
        }
    }

    pub fn globals(&self) -> &Scope {
        &self.globals
    }

    pub fn set_global(&mut self, name: &str, value: Value) {
        self.globals.borrow_mut().insert(name.to_string(), value);
    }

    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.globals.borrow().get(name).cloned()
    }

    /// A function over `code` that sees this interpreter's globals.
    pub fn function(&self, code: CodeObject) -> Value {
        Value::Function(Rc::new(Function::new(Rc::new(code), self.globals.clone())))
    }

    pub fn reset_execution_state(&mut self) {
        self.steps = 0;
        self.call_depth = 0;
        self.call_stack.clear();
    }

    /// Execute `code` without arguments and return what it returns.
    pub fn run(&mut self, code: &CodeObject) -> Result<Value, RuntimeError> {
        debug!(name = %code.name, filename = %code.filename, "run");
        let func = self.function(code.clone());
        self.call(&func, Vec::new(), Vec::new())
    }

    pub fn call(
        &mut self,
        func: &Value,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, RuntimeError> {
        self.reset_execution_state();
        let globals = self.globals.clone();
        self.call_value(func.clone(), args, kwargs, &globals)
            .map_err(|unwind| match unwind {
                Unwind::Raise {
                    exception,
                    traceback,
                    ..
                } => RuntimeError::Raised(Raised {
                    exception,
                    traceback,
                }),
                Unwind::Fatal(err) => err,
            })
    }

    fn fatal(&self, message: impl Into<String>) -> Unwind {
        let err = self
            .call_stack
            .iter()
            .fold(RuntimeError::fatal(message), |err, name| err.with_context(name));
        Unwind::Fatal(err)
    }

    // =========================================================================
    // Calls
    // =========================================================================

    fn call_value(
        &mut self,
        func: Value,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        globals: &Scope,
    ) -> Result<Value, Unwind> {
        match func {
            Value::Function(func) => {
                let frame = self.bind(&func, args, kwargs)?;
                self.run_frame(frame)
            }
            Value::Builtin(builtin) => Ok(self.call_builtin(builtin, args, kwargs, globals)?),
            Value::HookMethod(method) => {
                if !kwargs.is_empty() {
                    return Err(type_error(format!(
                        "{}.{}() takes no keyword arguments",
                        method.owner(),
                        method.name
                    ))
                    .into());
                }
                Ok(method.call(&args)?)
            }
            Value::ExceptionType(kind) => {
                if !kwargs.is_empty() {
                    return Err(type_error(format!("{}() takes no keyword arguments", kind)).into());
                }
                Ok(Value::Exception(Rc::new(Exception::new(&kind, args))))
            }
            other => Err(type_error(format!("'{}' object is not callable", other.type_name())).into()),
        }
    }

    fn bind(
        &self,
        func: &Function,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Frame, Unwind> {
        let code = &func.code;
        let argcount = code.argcount as usize;
        let varargs = code.flags.contains(CodeFlags::VARARGS);
        let varkwargs = code.flags.contains(CodeFlags::VARKEYWORDS);
        let slots = argcount + varargs as usize + varkwargs as usize;
        if code.varnames.len() < slots {
            return Err(self.fatal(format!(
                "code '{}' declares {} parameters but has {} local names",
                code.name,
                slots,
                code.varnames.len()
            )));
        }

        let mut fast: Vec<Option<Value>> = vec![None; code.varnames.len()];
        let given = args.len();
        if given > argcount && !varargs {
            return Err(type_error(format!(
                "{}() takes at most {} arguments ({} given)",
                code.name, argcount, given
            ))
            .into());
        }

        let mut args = args.into_iter();
        for slot in fast.iter_mut().take(argcount) {
            match args.next() {
                Some(arg) => *slot = Some(arg),
                None => break,
            }
        }
        if varargs {
            fast[argcount] = Some(Value::tuple(args.collect()));
        }

        let mut extra = Vec::new();
        for (key, value) in kwargs {
            match code.varnames[..argcount].iter().position(|p| *p == key) {
                Some(i) if fast[i].is_some() => {
                    return Err(type_error(format!(
                        "{}() got multiple values for keyword argument '{}'",
                        code.name, key
                    ))
                    .into());
                }
                Some(i) => fast[i] = Some(value),
                None if varkwargs => extra.push((Value::str(&key), value)),
                None => {
                    return Err(type_error(format!(
                        "{}() got an unexpected keyword argument '{}'",
                        code.name, key
                    ))
                    .into());
                }
            }
        }
        if varkwargs {
            fast[argcount + varargs as usize] = Some(Value::Dict(Rc::new(RefCell::new(extra))));
        }

        let first_default = argcount.saturating_sub(func.defaults.len());
        for i in 0..argcount {
            if fast[i].is_some() {
                continue;
            }
            match func.defaults.get(i.wrapping_sub(first_default)) {
                Some(default) if i >= first_default => fast[i] = Some(default.clone()),
                _ => {
                    return Err(type_error(format!(
                        "{}() missing argument '{}'",
                        code.name, code.varnames[i]
                    ))
                    .into());
                }
            }
        }

        let names = if code.flags.contains(CodeFlags::NEWLOCALS) {
            new_scope()
        } else {
            func.globals.clone()
        };

        Ok(Frame {
            code: code.clone(),
            fast,
            names,
            globals: func.globals.clone(),
            closure: func.closure.clone(),
            stack: Vec::with_capacity(code.stacksize as usize),
            blocks: Vec::new(),
            handled: None,
            ip: 0,
        })
    }

    fn call_builtin(
        &self,
        builtin: Builtin,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        globals: &Scope,
    ) -> Result<Value, Exception> {
        if builtin != Builtin::Namespace && !kwargs.is_empty() {
            return Err(type_error(format!("{}() takes no keyword arguments", builtin.name())));
        }
        match builtin {
            Builtin::Globals => {
                if !args.is_empty() {
                    return Err(type_error("globals() takes no arguments"));
                }
                Ok(Value::Namespace(globals.clone()))
            }
            Builtin::Len => {
                let [arg] = args.as_slice() else {
                    return Err(type_error(format!(
                        "len() takes exactly one argument ({} given)",
                        args.len()
                    )));
                };
                let n = match arg {
                    Value::Str(s) => s.chars().count(),
                    Value::Tuple(items) => items.len(),
                    Value::List(items) => items.borrow().len(),
                    Value::Dict(pairs) => pairs.borrow().len(),
                    Value::Namespace(scope) => scope.borrow().len(),
                    other => {
                        return Err(type_error(format!(
                            "object of type '{}' has no len()",
                            other.type_name()
                        )));
                    }
                };
                Ok(Value::Integer(n as i64))
            }
            Builtin::Range => {
                let ints: Option<Vec<i64>> = args.iter().map(Value::as_int).collect();
                let (start, stop, step) = match ints.as_deref() {
                    Some([stop]) => (0, *stop, 1),
                    Some([start, stop]) => (*start, *stop, 1),
                    Some([start, stop, step]) => (*start, *stop, *step),
                    Some(_) => {
                        return Err(type_error(format!(
                            "range expected 1 to 3 arguments, got {}",
                            args.len()
                        )));
                    }
                    None => return Err(type_error("range() integer argument expected")),
                };
                if step == 0 {
                    return Err(exception("ValueError", "range() step argument must not be zero"));
                }
                let mut items = Vec::new();
                let mut i = start;
                while (step > 0 && i < stop) || (step < 0 && i > stop) {
                    items.push(Value::Integer(i));
                    i = match i.checked_add(step) {
                        Some(next) => next,
                        None => break,
                    };
                }
                Ok(Value::list(items))
            }
            Builtin::Namespace => {
                if !args.is_empty() {
                    return Err(type_error("namespace() takes keyword arguments only"));
                }
                let scope = new_scope();
                scope.borrow_mut().extend(kwargs);
                Ok(Value::Namespace(scope))
            }
        }
    }

    // =========================================================================
    // Frames
    // =========================================================================

    /// Run `frame` to completion.
    ///
    /// Calls between code objects push onto an explicit frame stack instead
    /// of recursing, so `max_call_depth` bounds memory rather than the
    /// native stack.
    fn run_frame(&mut self, frame: Frame) -> Result<Value, Unwind> {
        let mut frames: Vec<Frame> = Vec::new();
        if let Err(unwind) = self.enter(&mut frames, frame) {
            self.leave_all(&mut frames);
            return Err(unwind);
        }
        let result = self.exec_frames(&mut frames);
        self.leave_all(&mut frames);
        result
    }

    fn enter(&mut self, frames: &mut Vec<Frame>, frame: Frame) -> Result<(), Unwind> {
        if self.call_depth >= self.config.max_call_depth {
            return Err(self.fatal(format!(
                "call depth limit exceeded ({}) - possible infinite recursion in '{}'",
                self.config.max_call_depth, frame.code.name
            )));
        }
        self.call_depth += 1;
        self.call_stack.push(frame.code.name.clone());
        trace!(name = %frame.code.name, depth = self.call_depth, "enter frame");
        frames.push(frame);
        Ok(())
    }

    fn leave(&mut self, frames: &mut Vec<Frame>) {
        if frames.pop().is_some() {
            self.call_depth -= 1;
            self.call_stack.pop();
        }
    }

    fn leave_all(&mut self, frames: &mut Vec<Frame>) {
        while !frames.is_empty() {
            self.leave(frames);
        }
    }

    fn exec_frames(&mut self, frames: &mut Vec<Frame>) -> Result<Value, Unwind> {
        loop {
            let Some(frame) = frames.last_mut() else {
                return Err(self.fatal("no frame to execute"));
            };
            let at = frame.ip;
            let unwind = match self.step(frame) {
                Ok(Step::Continue) => continue,
                Ok(Step::Call(callee)) => match self.enter(frames, callee) {
                    Ok(()) => continue,
                    Err(unwind) => unwind,
                },
                Ok(Step::Return(value)) => {
                    self.leave(frames);
                    match frames.last_mut() {
                        Some(caller) => {
                            caller.stack.push(value);
                            continue;
                        }
                        None => return Ok(value),
                    }
                }
                Err(unwind) => unwind,
            };

            let (exception, mut traceback, mut reraise) = match unwind {
                Unwind::Fatal(err) => return Err(Unwind::Fatal(err)),
                Unwind::Raise {
                    exception,
                    traceback,
                    reraise,
                } => (exception, traceback, reraise),
            };

            // Walk outwards until a frame handles the exception.
            let mut at = at;
            loop {
                let Some(frame) = frames.last_mut() else {
                    return Err(Unwind::Raise {
                        exception,
                        traceback,
                        reraise: false,
                    });
                };
                if !reraise {
                    traceback.insert(
                        0,
                        TraceEntry {
                            filename: frame.code.filename.clone(),
                            name: frame.code.name.clone(),
                            line: frame.code.line_for(at),
                        },
                    );
                }
                if Self::enter_handler(frame, &exception, &traceback) {
                    break;
                }
                self.leave(frames);
                reraise = false;
                // The caller stopped just past its call instruction.
                at = frames.last().map_or(0, |caller| caller.ip.saturating_sub(1));
            }
        }
    }

    /// Unwind the block stack to the innermost exception handler and jump to
    /// it with `( -- tb val exc )` pushed. False when there is none.
    fn enter_handler(frame: &mut Frame, exception: &Rc<Exception>, traceback: &[TraceEntry]) -> bool {
        while let Some(block) = frame.blocks.pop() {
            frame.stack.truncate(block.level);
            if block.kind == BlockKind::Except {
                frame.handled = Some((exception.clone(), traceback.to_vec()));
                frame.stack.push(Value::Traceback(Rc::new(traceback.to_vec())));
                frame.stack.push(Value::Exception(exception.clone()));
                frame.stack.push(Value::ExceptionType(exception.kind.clone()));
                frame.ip = block.handler;
                return true;
            }
        }
        false
    }

    fn check_limits(&mut self, frame: &Frame) -> Result<(), Unwind> {
        self.steps += 1;

        if let Some(max) = self.config.max_steps {
            if self.steps > max {
                return Err(self.fatal(format!("execution step limit exceeded ({})", max)));
            }
        }

        if frame.stack.len() > self.config.max_stack_size {
            return Err(self.fatal(format!(
                "stack size limit exceeded ({})",
                self.config.max_stack_size
            )));
        }

        Ok(())
    }

    fn pop(&self, frame: &mut Frame) -> Result<Value, Unwind> {
        match frame.stack.pop() {
            Some(value) => Ok(value),
            None => Err(self.fatal(format!("stack underflow at ip={}", frame.ip - 1))),
        }
    }

    fn pop_n(&self, frame: &mut Frame, n: usize) -> Result<Vec<Value>, Unwind> {
        if frame.stack.len() < n {
            return Err(self.fatal(format!("stack underflow at ip={}", frame.ip - 1)));
        }
        let at = frame.stack.len() - n;
        Ok(frame.stack.split_off(at))
    }

    fn jump(&self, frame: &mut Frame, ins: Instruction, at: usize) -> Result<(), Unwind> {
        match ins.target(at) {
            Some(target) if target <= frame.code.code.len() => {
                frame.ip = target;
                Ok(())
            }
            _ => Err(self.fatal(format!("bad jump target at ip={}", at))),
        }
    }

    fn pool<'c>(&self, pool: &'c [String], arg: u32) -> Result<&'c str, Unwind> {
        pool.get(arg as usize)
            .map(String::as_str)
            .ok_or_else(|| self.fatal(format!("name index {} out of range", arg)))
    }

    fn step(&mut self, frame: &mut Frame) -> Result<Step, Unwind> {
        let code = frame.code.clone();
        let at = frame.ip;
        let Some(&ins) = code.code.get(at) else {
            return Err(self.fatal(format!("execution fell off the end of '{}'", code.name)));
        };
        frame.ip += 1;
        self.check_limits(frame)?;

        let arg = ins.arg;
        match ins.opcode {
            Opcode::PopTop => {
                self.pop(frame)?;
            }
            Opcode::RotTwo => {
                let b = self.pop(frame)?;
                let a = self.pop(frame)?;
                frame.stack.push(b);
                frame.stack.push(a);
            }
            Opcode::RotThree => {
                let c = self.pop(frame)?;
                let b = self.pop(frame)?;
                let a = self.pop(frame)?;
                frame.stack.push(c);
                frame.stack.push(a);
                frame.stack.push(b);
            }
            Opcode::DupTop => {
                let a = self.pop(frame)?;
                frame.stack.push(a.clone());
                frame.stack.push(a);
            }
            Opcode::DupTopTwo => {
                let top = self.pop_n(frame, 2)?;
                frame.stack.extend(top.iter().cloned());
                frame.stack.extend(top);
            }

            Opcode::LoadConst => {
                let value = code
                    .consts
                    .get(arg as usize)
                    .ok_or_else(|| self.fatal(format!("const index {} out of range", arg)))?;
                frame.stack.push(Value::from(value));
            }

            // Fast locals
            Opcode::LoadFast => {
                let name = self.pool(&code.varnames, arg)?;
                match &frame.fast[arg as usize] {
                    Some(value) => frame.stack.push(value.clone()),
                    None => return Err(unbound_local(name).into()),
                }
            }
            Opcode::StoreFast => {
                self.pool(&code.varnames, arg)?;
                let value = self.pop(frame)?;
                frame.fast[arg as usize] = Some(value);
            }
            Opcode::DeleteFast => {
                let name = self.pool(&code.varnames, arg)?;
                if frame.fast[arg as usize].take().is_none() {
                    return Err(unbound_local(name).into());
                }
            }

            // Dynamic names
            Opcode::LoadName => {
                let name = self.pool(&code.names, arg)?;
                let found = frame.names.borrow().get(name).cloned();
                let value = match found {
                    Some(value) => value,
                    None => self.lookup_global(&frame.globals, name)?,
                };
                frame.stack.push(value);
            }
            Opcode::StoreName => {
                let name = self.pool(&code.names, arg)?;
                let value = self.pop(frame)?;
                frame.names.borrow_mut().insert(name.to_string(), value);
            }
            Opcode::DeleteName => {
                let name = self.pool(&code.names, arg)?;
                if frame.names.borrow_mut().remove(name).is_none() {
                    return Err(name_error(name).into());
                }
            }

            // Globals
            Opcode::LoadGlobal => {
                let name = self.pool(&code.names, arg)?;
                let value = self.lookup_global(&frame.globals, name)?;
                frame.stack.push(value);
            }
            Opcode::StoreGlobal => {
                let name = self.pool(&code.names, arg)?;
                let value = self.pop(frame)?;
                frame.globals.borrow_mut().insert(name.to_string(), value);
            }
            Opcode::DeleteGlobal => {
                let name = self.pool(&code.names, arg)?;
                if frame.globals.borrow_mut().remove(name).is_none() {
                    return Err(name_error(name).into());
                }
            }

            Opcode::LoadDeref => {
                let name = self.pool(&code.freevars, arg)?;
                match frame.closure.get(arg as usize) {
                    Some(value) => frame.stack.push(value.clone()),
                    None => {
                        return Err(exception(
                            "NameError",
                            format!(
                                "free variable '{}' referenced before assignment in enclosing scope",
                                name
                            ),
                        )
                        .into());
                    }
                }
            }

            // Attributes
            Opcode::LoadAttr => {
                let name = self.pool(&code.names, arg)?;
                let obj = self.pop(frame)?;
                frame.stack.push(get_attr(&obj, name)?);
            }
            Opcode::StoreAttr => {
                let name = self.pool(&code.names, arg)?;
                let obj = self.pop(frame)?;
                let value = self.pop(frame)?;
                match obj {
                    Value::Namespace(scope) => {
                        scope.borrow_mut().insert(name.to_string(), value);
                    }
                    other => return Err(attribute_error(other.type_name(), name).into()),
                }
            }

            // Collections
            Opcode::BuildTuple => {
                let items = self.pop_n(frame, arg as usize)?;
                frame.stack.push(Value::tuple(items));
            }
            Opcode::BuildList => {
                let items = self.pop_n(frame, arg as usize)?;
                frame.stack.push(Value::list(items));
            }
            Opcode::BuildMap => {
                let pairs = Vec::with_capacity(arg as usize);
                frame.stack.push(Value::Dict(Rc::new(RefCell::new(pairs))));
            }
            Opcode::StoreMap => {
                let key = self.pop(frame)?;
                let value = self.pop(frame)?;
                match frame.stack.last() {
                    Some(Value::Dict(pairs)) => dict_insert(pairs, key, value),
                    _ => return Err(self.fatal(format!("STORE_MAP without a dict at ip={}", at))),
                }
            }
            Opcode::BinarySubscr => {
                let key = self.pop(frame)?;
                let obj = self.pop(frame)?;
                frame.stack.push(subscript(&obj, &key)?);
            }
            Opcode::UnpackSequence => {
                let seq = self.pop(frame)?;
                let items = seq.sequence_items().ok_or_else(|| {
                    type_error(format!("'{}' object is not iterable", seq.type_name()))
                })?;
                if items.len() != arg as usize {
                    return Err(exception(
                        "ValueError",
                        format!("expected {} values to unpack, got {}", arg, items.len()),
                    )
                    .into());
                }
                frame.stack.extend(items.into_iter().rev());
            }
            Opcode::StoreSubscr => {
                let key = self.pop(frame)?;
                let obj = self.pop(frame)?;
                let value = self.pop(frame)?;
                store_subscript(&obj, key, value)?;
            }

            // Operators
            Opcode::BinaryOp => {
                let op = BinOp::from_arg(arg)
                    .ok_or_else(|| self.fatal(format!("unknown binary operator {}", arg)))?;
                let b = self.pop(frame)?;
                let a = self.pop(frame)?;
                frame.stack.push(binary(op, &a, &b)?);
            }
            Opcode::CompareOp => {
                let op = CmpOp::from_arg(arg)
                    .ok_or_else(|| self.fatal(format!("unknown comparison {}", arg)))?;
                let b = self.pop(frame)?;
                let a = self.pop(frame)?;
                frame.stack.push(Value::Bool(compare(op, &a, &b)?));
            }
            Opcode::UnaryNot => {
                let a = self.pop(frame)?;
                frame.stack.push(Value::Bool(!a.is_truthy()));
            }
            Opcode::UnaryNegative => {
                let a = self.pop(frame)?;
                let result = match a {
                    Value::Float(f) => Value::Float(-f),
                    ref other => match other.as_int() {
                        Some(n) => Value::Integer(
                            n.checked_neg()
                                .ok_or_else(|| exception("OverflowError", "integer negation overflow"))?,
                        ),
                        None => {
                            return Err(type_error(format!(
                                "bad operand type for unary -: '{}'",
                                other.type_name()
                            ))
                            .into());
                        }
                    },
                };
                frame.stack.push(result);
            }

            // Functions
            Opcode::MakeFunction => {
                let code_value = self.pop(frame)?;
                let defaults = self.pop_n(frame, arg as usize)?;
                let Value::Code(inner) = code_value else {
                    return Err(self.fatal(format!(
                        "MAKE_FUNCTION expects code, got {}",
                        code_value.type_name()
                    )));
                };
                let func = Function::new(inner, frame.globals.clone()).with_defaults(defaults);
                frame.stack.push(Value::Function(Rc::new(func)));
            }
            Opcode::CallFunction | Opcode::CallFunctionVar => {
                let mut extra = Vec::new();
                if ins.opcode == Opcode::CallFunctionVar {
                    let seq = self.pop(frame)?;
                    extra = seq.sequence_items().ok_or_else(|| {
                        type_error(format!(
                            "argument after * must be a sequence, not {}",
                            seq.type_name()
                        ))
                    })?;
                }
                let (n_args, n_kwds) = split_argspec(arg);
                let flat = self.pop_n(frame, 2 * n_kwds as usize)?;
                let mut kwargs = Vec::with_capacity(n_kwds as usize);
                for pair in flat.chunks(2) {
                    let Value::Str(key) = &pair[0] else {
                        return Err(type_error("keywords must be strings").into());
                    };
                    kwargs.push((key.to_string(), pair[1].clone()));
                }
                let mut args = self.pop_n(frame, n_args as usize)?;
                args.extend(extra);
                let func = self.pop(frame)?;
                if let Value::Function(func) = &func {
                    return Ok(Step::Call(self.bind(func, args, kwargs)?));
                }
                let globals = frame.globals.clone();
                let result = self.call_value(func, args, kwargs, &globals)?;
                frame.stack.push(result);
            }

            // Jumps
            Opcode::JumpForward | Opcode::JumpAbsolute => self.jump(frame, ins, at)?,
            Opcode::PopJumpIfFalse => {
                if !self.pop(frame)?.is_truthy() {
                    self.jump(frame, ins, at)?;
                }
            }
            Opcode::PopJumpIfTrue => {
                if self.pop(frame)?.is_truthy() {
                    self.jump(frame, ins, at)?;
                }
            }

            // Blocks
            Opcode::SetupExcept | Opcode::SetupLoop => {
                let handler = ins
                    .target(at)
                    .ok_or_else(|| self.fatal(format!("bad block target at ip={}", at)))?;
                let kind = if ins.opcode == Opcode::SetupLoop {
                    BlockKind::Loop
                } else {
                    BlockKind::Except
                };
                frame.blocks.push(Block {
                    kind,
                    handler,
                    level: frame.stack.len(),
                });
            }
            Opcode::PopBlock => {
                let block = frame
                    .blocks
                    .pop()
                    .ok_or_else(|| self.fatal(format!("POP_BLOCK without a block at ip={}", at)))?;
                frame.stack.truncate(block.level);
            }
            Opcode::GetIter => {
                let seq = self.pop(frame)?;
                let iter = match seq {
                    Value::Iterator(_) => seq,
                    other => {
                        let items = other.sequence_items().ok_or_else(|| {
                            type_error(format!("'{}' object is not iterable", other.type_name()))
                        })?;
                        Value::Iterator(Rc::new(RefCell::new(SeqIter::new(items))))
                    }
                };
                frame.stack.push(iter);
            }
            Opcode::ForIter => {
                let next = match frame.stack.last() {
                    Some(Value::Iterator(iter)) => iter.borrow_mut().next_item(),
                    _ => return Err(self.fatal(format!("FOR_ITER without an iterator at ip={}", at))),
                };
                match next {
                    Some(item) => frame.stack.push(item),
                    None => {
                        frame.stack.pop();
                        self.jump(frame, ins, at)?;
                    }
                }
            }

            // Exceptions
            Opcode::RaiseVarargs => return Err(self.raise(frame, arg)?),
            Opcode::EndFinally => {
                let exc = self.pop(frame)?;
                let value = self.pop(frame)?;
                let tb = self.pop(frame)?;
                if let Value::ExceptionType(_) = exc {
                    let exception = normalize(exc, value)?;
                    let traceback = match tb {
                        Value::Traceback(entries) => entries.as_ref().clone(),
                        _ => Vec::new(),
                    };
                    return Err(Unwind::Raise {
                        exception,
                        traceback,
                        reraise: true,
                    });
                }
            }

            Opcode::ReturnValue => return Ok(Step::Return(self.pop(frame)?)),
        }

        Ok(Step::Continue)
    }

    fn lookup_global(&self, globals: &Scope, name: &str) -> Result<Value, Unwind> {
        if let Some(value) = globals.borrow().get(name) {
            return Ok(value.clone());
        }
        match self.builtins.get(name) {
            Some(value) => Ok(value.clone()),
            None => Err(name_error(name).into()),
        }
    }

    /// Build the unwind for `RAISE_VARARGS argc`.
    ///
    /// 0 re-raises the exception being handled. 1 raises an exception or
    /// type. 2 is `( type value -- )`. 3 also takes a traceback and keeps it.
    fn raise(&self, frame: &mut Frame, argc: u32) -> Result<Unwind, Unwind> {
        match argc {
            0 => match frame.handled.clone() {
                Some((exception, traceback)) => Ok(Unwind::Raise {
                    exception,
                    traceback,
                    reraise: true,
                }),
                None => Ok(type_error("exceptions must derive from Exception, not NoneType").into()),
            },
            1 => {
                let ty = self.pop(frame)?;
                Ok(raise_fresh(normalize(ty, Value::None)?))
            }
            2 => {
                let value = self.pop(frame)?;
                let ty = self.pop(frame)?;
                Ok(raise_fresh(normalize(ty, value)?))
            }
            3 => {
                let tb = self.pop(frame)?;
                let value = self.pop(frame)?;
                let ty = self.pop(frame)?;
                let exception = normalize(ty, value)?;
                match tb {
                    Value::Traceback(entries) => Ok(Unwind::Raise {
                        exception,
                        traceback: entries.as_ref().clone(),
                        reraise: true,
                    }),
                    Value::None => Ok(raise_fresh(exception)),
                    _ => Ok(type_error("raise: arg 3 must be a traceback or None").into()),
                }
            }
            n => Err(self.fatal(format!("bad RAISE_VARARGS oparg {}", n))),
        }
    }
}

fn raise_fresh(exception: Rc<Exception>) -> Unwind {
    Unwind::Raise {
        exception,
        traceback: Vec::new(),
        reraise: false,
    }
}

/// Turn a raised `(type, value)` pair into one exception instance.
fn normalize(ty: Value, value: Value) -> Result<Rc<Exception>, Exception> {
    match (ty, value) {
        (Value::Exception(exc), Value::None) => Ok(exc),
        (Value::Exception(_), _) => Err(type_error(
            "instance exception may not have a separate value",
        )),
        (Value::ExceptionType(kind), Value::Exception(exc)) if exc.is_instance_of(&kind) => Ok(exc),
        (Value::ExceptionType(kind), Value::None) => Ok(Rc::new(Exception::new(&kind, Vec::new()))),
        (Value::ExceptionType(kind), Value::Tuple(items)) => {
            Ok(Rc::new(Exception::new(&kind, items.as_ref().clone())))
        }
        (Value::ExceptionType(kind), value) => Ok(Rc::new(Exception::new(&kind, vec![value]))),
        (other, _) => Err(type_error(format!(
            "exceptions must derive from Exception, not {}",
            other.type_name()
        ))),
    }
}

// =============================================================================
// Object protocol
// =============================================================================

fn get_attr(obj: &Value, name: &str) -> Result<Value, Exception> {
    let found = match (obj, name) {
        (Value::Namespace(scope), _) => scope.borrow().get(name).cloned(),
        (Value::Exception(exc), "args") => Some(Value::tuple(exc.args.clone())),
        (Value::Function(func), "__name__") => Some(Value::str(&func.code.name)),
        (Value::Code(code), "co_name") => Some(Value::str(&code.name)),
        (Value::Tracer(_) | Value::Inverter(_), _) => HookMethod::lookup(obj, name),
        _ => None,
    };
    found.ok_or_else(|| attribute_error(obj.type_name(), name))
}

fn index(len: usize, key: &Value, what: &str) -> Result<usize, Exception> {
    let Some(i) = key.as_int() else {
        return Err(type_error(format!(
            "{} indices must be integers, not {}",
            what,
            key.type_name()
        )));
    };
    let i = if i < 0 { i + len as i64 } else { i };
    if i < 0 || i as usize >= len {
        return Err(exception("IndexError", format!("{} index out of range", what)));
    }
    Ok(i as usize)
}

fn subscript(obj: &Value, key: &Value) -> Result<Value, Exception> {
    match obj {
        Value::Tuple(items) => Ok(items[index(items.len(), key, "tuple")?].clone()),
        Value::List(items) => {
            let items = items.borrow();
            Ok(items[index(items.len(), key, "list")?].clone())
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let c = chars[index(chars.len(), key, "string")?];
            Ok(Value::str(&c.to_string()))
        }
        Value::Dict(pairs) => pairs
            .borrow()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| Exception::new("KeyError", vec![key.clone()])),
        Value::Namespace(scope) => {
            let Value::Str(name) = key else {
                return Err(Exception::new("KeyError", vec![key.clone()]));
            };
            scope
                .borrow()
                .get(&**name)
                .cloned()
                .ok_or_else(|| Exception::new("KeyError", vec![key.clone()]))
        }
        other => Err(type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

fn dict_insert(pairs: &RefCell<Vec<(Value, Value)>>, key: Value, value: Value) {
    let mut pairs = pairs.borrow_mut();
    match pairs.iter_mut().find(|(k, _)| *k == key) {
        Some(pair) => pair.1 = value,
        None => pairs.push((key, value)),
    }
}

fn store_subscript(obj: &Value, key: Value, value: Value) -> Result<(), Exception> {
    match obj {
        Value::List(items) => {
            let mut items = items.borrow_mut();
            let i = index(items.len(), &key, "list")?;
            items[i] = value;
            Ok(())
        }
        Value::Dict(pairs) => {
            dict_insert(pairs, key, value);
            Ok(())
        }
        Value::Namespace(scope) => match key {
            Value::Str(name) => {
                scope.borrow_mut().insert(name.to_string(), value);
                Ok(())
            }
            other => Err(type_error(format!(
                "namespace keys must be strings, not {}",
                other.type_name()
            ))),
        },
        other => Err(type_error(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        ))),
    }
}

fn is_int(v: &Value) -> bool {
    matches!(v, Value::Integer(_) | Value::Bool(_))
}

fn overflow() -> Exception {
    exception("OverflowError", "integer overflow")
}

/// Arithmetic with integer division and modulo rounding toward negative
/// infinity.
fn binary(op: BinOp, a: &Value, b: &Value) -> Result<Value, Exception> {
    if let (true, true, Some(x), Some(y)) = (is_int(a), is_int(b), a.as_int(), b.as_int()) {
        let result = match op {
            BinOp::Add => x.checked_add(y),
            BinOp::Subtract => x.checked_sub(y),
            BinOp::Multiply => x.checked_mul(y),
            BinOp::Divide => {
                if y == 0 {
                    return Err(division_by_zero());
                }
                x.checked_div(y).map(|q| if x % y != 0 && ((x < 0) != (y < 0)) { q - 1 } else { q })
            }
            BinOp::Modulo => {
                if y == 0 {
                    return Err(division_by_zero());
                }
                x.checked_rem(y).map(|r| if r != 0 && ((r < 0) != (y < 0)) { r + y } else { r })
            }
        };
        return result.map(Value::Integer).ok_or_else(overflow);
    }

    if let (Some(x), Some(y)) = (a.as_float(), b.as_float()) {
        let result = match op {
            BinOp::Add => x + y,
            BinOp::Subtract => x - y,
            BinOp::Multiply => x * y,
            BinOp::Divide => {
                if y == 0.0 {
                    return Err(exception("ZeroDivisionError", "float division by zero"));
                }
                x / y
            }
            BinOp::Modulo => {
                if y == 0.0 {
                    return Err(exception("ZeroDivisionError", "float modulo"));
                }
                let r = x % y;
                if r != 0.0 && ((r < 0.0) != (y < 0.0)) { r + y } else { r }
            }
        };
        return Ok(Value::Float(result));
    }

    match (op, a, b) {
        (BinOp::Add, Value::Str(x), Value::Str(y)) => Ok(Value::str(&format!("{}{}", x, y))),
        (BinOp::Add, Value::Tuple(x), Value::Tuple(y)) => {
            Ok(Value::tuple(x.iter().chain(y.iter()).cloned().collect()))
        }
        (BinOp::Add, Value::List(x), Value::List(y)) => {
            let joined: Vec<Value> = x.borrow().iter().chain(y.borrow().iter()).cloned().collect();
            Ok(Value::list(joined))
        }
        _ => Err(type_error(format!(
            "unsupported operand type(s) for {}: '{}' and '{}'",
            op.symbol(),
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn compare(op: CmpOp, a: &Value, b: &Value) -> Result<bool, Exception> {
    use std::cmp::Ordering;

    match op {
        CmpOp::Eq => return Ok(a == b),
        CmpOp::Ne => return Ok(a != b),
        _ => {}
    }

    let ordering = match (a, b) {
        (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
        _ if is_int(a) && is_int(b) => a.as_int().cmp(&b.as_int()).into(),
        _ => match (a.as_float(), b.as_float()) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => {
                return Err(type_error(format!(
                    "unorderable types: {}() {} {}()",
                    a.type_name(),
                    op.symbol(),
                    b.type_name()
                )));
            }
        },
    };

    // NaN compares false with everything.
    let Some(ordering) = ordering else {
        return Ok(false);
    };
    Ok(match op {
        CmpOp::Lt => ordering == Ordering::Less,
        CmpOp::Le => ordering != Ordering::Greater,
        CmpOp::Gt => ordering == Ordering::Greater,
        CmpOp::Ge => ordering != Ordering::Less,
        CmpOp::Eq => ordering == Ordering::Equal,
        CmpOp::Ne => ordering != Ordering::Equal,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::assemble::CodeMeta;
    use crate::bytecode::codegen::CodeGenerator;
    use crate::lang::value::Const;
    use std::collections::HashSet;

    fn module(source: &str) -> CodeObject {
        let mut cg = CodeGenerator::new("<test>");
        cg.insert_block(source, false).unwrap();
        cg.to_code(CodeMeta::new("<module>").first_line(1)).unwrap()
    }

    fn eval(source: &str) -> Value {
        let mut cg = CodeGenerator::new("<test>");
        cg.insert_expr(source, false).unwrap();
        let code = cg.to_code(CodeMeta::new("<expr>")).unwrap();
        Vm::new().run(&code).unwrap()
    }

    fn raised(result: Result<Value, RuntimeError>) -> Raised {
        match result {
            Err(RuntimeError::Raised(raised)) => raised,
            other => panic!("expected an exception, got {:?}", other),
        }
    }

    /// Function named `helper` that raises `ValueError('boom')`.
    fn raising_helper() -> CodeObject {
        let mut cg = CodeGenerator::new("helpers.kv");
        cg.insert_block("raise ValueError('boom')", true).unwrap();
        cg.rewrite_to_fast_locals(&HashSet::<&str>::new());
        cg.load_const(Const::None);
        cg.return_value();
        cg.to_code(CodeMeta::new("helper").newlocals(true)).unwrap()
    }

    fn call_helper(cg: &mut CodeGenerator) -> Result<(), crate::bytecode::AssembleError> {
        cg.set_lineno(2);
        cg.load_global("helper");
        cg.call_function(0, 0);
        cg.pop_top();
        Ok(())
    }

    #[test]
    fn test_arithmetic_and_precedence() {
        assert_eq!(eval("1 + 2 * 3"), Value::Integer(7));
        assert_eq!(eval("-7 / 2"), Value::Integer(-4));
        assert_eq!(eval("-7 % 3"), Value::Integer(2));
        assert_eq!(eval("7.0 / 2"), Value::Float(3.5));
        assert_eq!(eval("'a' + 'b'"), Value::str("ab"));
    }

    #[test]
    fn test_comparisons_and_conditional() {
        assert_eq!(eval("1 < 2"), Value::Bool(true));
        assert_eq!(eval("'b' <= 'a'"), Value::Bool(false));
        assert_eq!(eval("'yes' if 3 == 3.0 else 'no'"), Value::str("yes"));
        assert_eq!(eval("'yes' if not 1 else 'no'"), Value::str("no"));
    }

    #[test]
    fn test_displays_and_subscripts() {
        assert_eq!(eval("[10, 20, 30][-1]"), Value::Integer(30));
        assert_eq!(eval("{'a': 1, 'b': 2}['b']"), Value::Integer(2));
        assert_eq!(eval("(1, 2) + (3,)"), Value::tuple(vec![1, 2, 3].into_iter().map(Value::Integer).collect()));
        assert_eq!(eval("len(range(5))"), Value::Integer(5));
    }

    #[test]
    fn test_module_statements_share_globals() {
        let code = module("ns = namespace(a=1)\nns.b = ns.a + 1\nd = {}\nd['k'] = ns.b\nx = 5\ndel x");
        let mut vm = Vm::new();
        assert_eq!(vm.run(&code).unwrap(), Value::None);

        let Some(Value::Dict(d)) = vm.get_global("d") else {
            panic!("d is not a dict");
        };
        assert_eq!(d.borrow()[0], (Value::str("k"), Value::Integer(2)));
        assert!(vm.get_global("x").is_none());
    }

    #[test]
    fn test_name_error_has_traceback() {
        let r = raised(Vm::new().run(&module("a = 1\nb = missing")));
        assert_eq!(r.kind(), "NameError");
        assert_eq!(r.traceback.len(), 1);
        assert_eq!(r.traceback[0].line, 2);
    }

    #[test]
    fn test_unsquashed_traceback_includes_helper() {
        let mut vm = Vm::new();
        vm.set_global("helper", vm.function(raising_helper()));

        let mut cg = CodeGenerator::new("main.kv");
        call_helper(&mut cg).unwrap();
        cg.load_const(Const::None);
        cg.return_value();
        let code = cg.to_code(CodeMeta::new("main").first_line(1)).unwrap();

        let r = raised(vm.run(&code));
        assert_eq!(r.kind(), "ValueError");
        assert_eq!(r.frames(), vec!["main", "helper"]);
    }

    #[test]
    fn test_squash_raise_drops_helper_frame() {
        let mut vm = Vm::new();
        vm.set_global("helper", vm.function(raising_helper()));

        let mut cg = CodeGenerator::new("main.kv");
        cg.set_lineno(1);
        cg.try_squash_raise(call_helper).unwrap();
        cg.load_const(Const::None);
        cg.return_value();
        let code = cg.to_code(CodeMeta::new("main").first_line(1)).unwrap();

        let r = raised(vm.run(&code));
        assert_eq!(r.kind(), "ValueError");
        assert_eq!(r.args(), &[Value::str("boom")]);
        assert_eq!(r.frames(), vec!["main"]);
    }

    #[test]
    fn test_squash_raise_is_transparent_without_error() {
        let mut cg = CodeGenerator::new("<test>");
        cg.try_squash_raise(|cg| {
            cg.load_const(Const::Integer(1));
            cg.store_fast("x");
            Ok(())
        })
        .unwrap();
        cg.load_fast("x");
        cg.return_value();
        let code = cg.to_code(CodeMeta::new("t")).unwrap();

        assert_eq!(Vm::new().run(&code).unwrap(), Value::Integer(1));
    }

    /// Loop over the global `items`, collecting each one into a tuple.
    fn collect_loop() -> CodeObject {
        let mut cg = CodeGenerator::new("<test>");
        cg.build_tuple(0);
        cg.store_fast("acc");
        cg.for_loop("items", false, |cg| {
            cg.build_tuple(1);
            cg.load_fast("acc");
            cg.rot_two();
            cg.binary_op(BinOp::Add);
            cg.store_fast("acc");
            Ok(())
        })
        .unwrap();
        cg.load_fast("acc");
        cg.return_value();
        cg.to_code(CodeMeta::new("collect")).unwrap()
    }

    #[test]
    fn test_loop_runs_body_in_order() {
        let mut vm = Vm::new();
        let items: Vec<Value> = [3, 1, 2].into_iter().map(Value::Integer).collect();
        vm.set_global("items", Value::list(items.clone()));

        assert_eq!(vm.run(&collect_loop()).unwrap(), Value::tuple(items));
    }

    #[test]
    fn test_loop_over_empty_sequence_falls_through() {
        let mut vm = Vm::new();
        vm.set_global("items", Value::tuple(vec![]));

        assert_eq!(vm.run(&collect_loop()).unwrap(), Value::tuple(vec![]));
    }

    #[test]
    fn test_function_arguments() {
        // f(a, b=10, *rest, **kw)
        let mut cg = CodeGenerator::new("<test>");
        cg.load_fast("a");
        cg.load_fast("b");
        cg.load_fast("rest");
        cg.load_fast("kw");
        cg.build_tuple(4);
        cg.return_value();
        let code = cg
            .to_code(
                CodeMeta::new("f")
                    .args(["a", "b", "rest", "kw"])
                    .varargs(true)
                    .varkwargs(true)
                    .newlocals(true),
            )
            .unwrap();
        assert_eq!(code.argcount, 2);

        let mut vm = Vm::new();
        let f = Value::Function(Rc::new(
            Function::new(Rc::new(code), vm.globals().clone()).with_defaults(vec![Value::Integer(10)]),
        ));

        let Value::Tuple(out) = vm.call(&f, vec![Value::Integer(1)], vec![]).unwrap() else {
            panic!("expected a tuple");
        };
        assert_eq!(out[0], Value::Integer(1));
        assert_eq!(out[1], Value::Integer(10));
        assert_eq!(out[2], Value::tuple(vec![]));

        let Value::Tuple(out) = vm
            .call(
                &f,
                vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)],
                vec![("z".into(), Value::None)],
            )
            .unwrap()
        else {
            panic!("expected a tuple");
        };
        assert_eq!(out[2], Value::tuple(vec![Value::Integer(3)]));
        let Value::Dict(kw) = &out[3] else {
            panic!("expected a dict");
        };
        assert_eq!(kw.borrow()[0].0, Value::str("z"));

        let r = raised(vm.call(&f, vec![], vec![]));
        assert_eq!(r.kind(), "TypeError");
    }

    #[test]
    fn test_make_function_and_call_var() {
        let mut inner = CodeGenerator::new("<test>");
        inner.load_fast("x");
        inner.load_fast("y");
        inner.binary_op(BinOp::Subtract);
        inner.return_value();
        let inner = inner
            .to_code(CodeMeta::new("sub").args(["x", "y"]).newlocals(true))
            .unwrap();

        let mut cg = CodeGenerator::new("<test>");
        cg.load_const(Const::Integer(1));
        cg.load_const(Const::Code(Box::new(inner)));
        cg.make_function(1);
        cg.load_const(Const::Tuple(vec![Const::Integer(10)]));
        cg.call_function_var(0, 0);
        cg.return_value();
        let code = cg.to_code(CodeMeta::new("t")).unwrap();

        assert_eq!(Vm::new().run(&code).unwrap(), Value::Integer(9));
    }

    #[test]
    fn test_rewritten_fragment_runs_as_function() {
        let mut cg = CodeGenerator::new("<test>");
        cg.insert_block("y = x * 2", true).unwrap();
        cg.insert_expr("y + x", true).unwrap();
        cg.return_value();
        let available: HashSet<&str> = ["x"].into_iter().collect();
        let args = cg.rewrite_to_fast_locals(&available);
        assert_eq!(args, vec!["x"]);

        let code = cg.to_code(CodeMeta::new("f").args(args).newlocals(true)).unwrap();

        let mut vm = Vm::new();
        let f = vm.function(code);
        assert_eq!(vm.call(&f, vec![Value::Integer(5)], vec![]).unwrap(), Value::Integer(15));
    }

    #[test]
    fn test_parameter_read_twice_is_one_slot() {
        let mut cg = CodeGenerator::new("<test>");
        cg.insert_expr("x + x", true).unwrap();
        cg.return_value();
        let available: HashSet<&str> = ["x"].into_iter().collect();
        let required = cg.rewrite_to_fast_locals(&available);
        assert_eq!(required, vec!["x"]);

        let code = cg.to_code(CodeMeta::new("f").args(required).newlocals(true)).unwrap();
        assert_eq!(code.argcount, 1);
        assert_eq!(code.varnames, vec!["x"]);

        let mut vm = Vm::new();
        let f = vm.function(code);
        assert_eq!(vm.call(&f, vec![Value::Integer(5)], vec![]).unwrap(), Value::Integer(10));
    }

    #[test]
    fn test_reraise_keeps_traceback() {
        // try: helper() except: raise
        let mut cg = CodeGenerator::new("main.kv");
        let handler = cg.new_label();
        let end = cg.new_label();
        cg.push(crate::bytecode::Op::SetupExcept(handler));
        call_helper(&mut cg).unwrap();
        cg.push(crate::bytecode::Op::PopBlock);
        cg.jump_forward(end);
        cg.mark_label(handler);
        cg.pop_top();
        cg.pop_top();
        cg.pop_top();
        cg.raise_varargs(0);
        cg.mark_label(end);
        cg.load_const(Const::None);
        cg.return_value();
        let code = cg.to_code(CodeMeta::new("main")).unwrap();

        let mut vm = Vm::new();
        vm.set_global("helper", vm.function(raising_helper()));
        let r = raised(vm.run(&code));
        assert_eq!(r.frames(), vec!["main", "helper"]);
    }

    #[test]
    fn test_step_limit_is_fatal() {
        let mut cg = CodeGenerator::new("<test>");
        cg.for_loop("items", false, |cg| {
            cg.pop_top();
            Ok(())
        })
        .unwrap();
        cg.load_const(Const::None);
        cg.return_value();
        let code = cg.to_code(CodeMeta::new("long")).unwrap();

        let mut vm = Vm::with_config(VmConfig {
            max_steps: Some(50),
            ..VmConfig::default()
        });
        vm.set_global("items", Value::list((0..100).map(Value::Integer).collect()));
        let err = vm.run(&code).unwrap_err();
        assert!(err.as_raised().is_none());
        assert!(err.to_string().contains("step limit"));
    }

    /// `f()` that calls itself through the global `f`.
    fn runaway_recursion(vm: &mut Vm) -> Value {
        let mut cg = CodeGenerator::new("<test>");
        cg.load_global("f");
        cg.call_function(0, 0);
        cg.return_value();
        let code = cg.to_code(CodeMeta::new("f").newlocals(true)).unwrap();
        vm.set_global("f", vm.function(code));
        vm.get_global("f").unwrap()
    }

    #[test]
    fn test_call_depth_limit() {
        let mut vm = Vm::with_config(VmConfig {
            max_call_depth: 20,
            ..VmConfig::default()
        });
        let f = runaway_recursion(&mut vm);
        let err = vm.call(&f, vec![], vec![]).unwrap_err();
        assert!(err.to_string().contains("call depth limit exceeded (20)"));
    }

    #[test]
    fn test_default_call_depth_limit_is_reported() {
        let mut vm = Vm::new();
        let f = runaway_recursion(&mut vm);
        let err = vm.call(&f, vec![], vec![]).unwrap_err();

        assert!(err.as_raised().is_none());
        assert!(err.to_string().contains("call depth limit exceeded (1000)"));

        // The interpreter is usable afterwards.
        assert_eq!(eval("len((1, 2))"), Value::Integer(2));
        assert_eq!(vm.run(&module("x = 1")).unwrap(), Value::None);
    }

    #[test]
    fn test_exception_crosses_frames_to_handler() {
        // try: helper() except: pass, with helper two calls deep.
        let mut vm = Vm::new();
        vm.set_global("helper", vm.function(raising_helper()));

        let mut mid = CodeGenerator::new("mid.kv");
        call_helper(&mut mid).unwrap();
        mid.load_const(Const::None);
        mid.return_value();
        let mid = mid.to_code(CodeMeta::new("mid").newlocals(true)).unwrap();
        vm.set_global("mid", vm.function(mid));

        let mut cg = CodeGenerator::new("main.kv");
        let handler = cg.new_label();
        let end = cg.new_label();
        cg.push(crate::bytecode::Op::SetupExcept(handler));
        cg.load_global("mid");
        cg.call_function(0, 0);
        cg.pop_top();
        cg.push(crate::bytecode::Op::PopBlock);
        cg.jump_forward(end);
        cg.mark_label(handler);
        cg.pop_top();
        cg.pop_top();
        cg.pop_top();
        cg.mark_label(end);
        cg.load_const(Const::String("caught".into()));
        cg.return_value();
        let code = cg.to_code(CodeMeta::new("main")).unwrap();

        assert_eq!(vm.run(&code).unwrap(), Value::str("caught"));
    }

    #[test]
    fn test_zero_division() {
        let r = raised(Vm::new().run(&module("x = 1 / 0")));
        assert_eq!(r.kind(), "ZeroDivisionError");
    }
}
