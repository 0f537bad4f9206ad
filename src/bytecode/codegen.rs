use crate::bytecode::assemble::{CodeMeta, assemble};
use crate::bytecode::assemble_error::AssembleError;
use crate::bytecode::instrument;
use crate::bytecode::ir::CodeObject;
use crate::bytecode::label::{Label, LabelAllocator};
use crate::bytecode::op::{BinOp, CmpOp, Op};
use crate::bytecode::rewrite;
use crate::frontend::compile::SourceCompiler;
use crate::frontend::{Fragment, FragmentCompiler, FragmentMode};
use crate::lang::value::Const;
use std::borrow::Borrow;
use std::collections::HashSet;
use std::hash::Hash;
use std::rc::Rc;
use tracing::debug;

/// Fast local caching the globals mapping.
pub const GLOBALS_SLOT: &str = "_[f_globals]";

/// Fast local caching the compiler helpers mapping.
pub const HELPERS_SLOT: &str = "_[helpers]";

/// Global holding the mapping of compiler helpers.
pub const HELPERS_GLOBAL: &str = "__compiler_helpers";

/// Builds the instruction stream of one code object.
///
/// Stack effects in the docs below use `( before -- after )` with the top of
/// the stack on the right.
pub struct CodeGenerator {
    /// Source identifier attached to the code object and to compiled
    /// fragments.
    pub filename: String,

    code_ops: Vec<Op>,
    labels: LabelAllocator,
    compiler: Rc<dyn FragmentCompiler>,
}

impl CodeGenerator {
    /// A generator that compiles fragments with the built-in `SourceCompiler`.
    pub fn new(filename: impl Into<String>) -> Self {
        Self::with_compiler(filename, Rc::new(SourceCompiler))
    }

    pub fn with_compiler(filename: impl Into<String>, compiler: Rc<dyn FragmentCompiler>) -> Self {
        Self {
            filename: filename.into(),
            code_ops: Vec::new(),
            labels: LabelAllocator::new(),
            compiler,
        }
    }

    /// The stream built so far.
    pub fn ops(&self) -> &[Op] {
        &self.code_ops
    }

    pub fn len(&self) -> usize {
        self.code_ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code_ops.is_empty()
    }

    /// Append an instruction as is.
    pub fn push(&mut self, op: Op) {
        self.code_ops.push(op);
    }

    pub fn extend(&mut self, ops: impl IntoIterator<Item = Op>) {
        self.code_ops.extend(ops);
    }

    // =========================================================================
    // Labels & jumps
    // =========================================================================

    pub fn new_label(&mut self) -> Label {
        self.labels.fresh()
    }

    /// Place `label` at the current position.
    pub fn mark_label(&mut self, label: Label) {
        self.code_ops.push(Op::Label(label));
    }

    /// Jump to a label later in the stream. ( -- )
    pub fn jump_forward(&mut self, label: Label) {
        self.code_ops.push(Op::JumpForward(label));
    }

    /// Jump to a label anywhere in the stream. ( -- )
    pub fn jump_absolute(&mut self, label: Label) {
        self.code_ops.push(Op::JumpAbsolute(label));
    }

    /// ( cond -- )
    pub fn pop_jump_if_false(&mut self, label: Label) {
        self.code_ops.push(Op::PopJumpIfFalse(label));
    }

    /// ( cond -- )
    pub fn pop_jump_if_true(&mut self, label: Label) {
        self.code_ops.push(Op::PopJumpIfTrue(label));
    }

    // =========================================================================
    // Primitive emitters
    // =========================================================================

    pub fn set_lineno(&mut self, lineno: u32) {
        self.code_ops.push(Op::SetLineno(lineno));
    }

    /// Load a global variable. ( -- value )
    pub fn load_global(&mut self, name: &str) {
        self.code_ops.push(Op::LoadGlobal(name.to_string()));
    }

    /// Load a fast local variable. ( -- value )
    pub fn load_fast(&mut self, name: &str) {
        self.code_ops.push(Op::LoadFast(name.to_string()));
    }

    /// Load a dynamically scoped name. ( -- value )
    pub fn load_name(&mut self, name: &str) {
        self.code_ops.push(Op::LoadName(name.to_string()));
    }

    /// ( -- value )
    pub fn load_const(&mut self, value: Const) {
        self.code_ops.push(Op::LoadConst(value));
    }

    /// Load a free variable. ( -- value )
    pub fn load_deref(&mut self, name: &str) {
        self.code_ops.push(Op::LoadDeref(name.to_string()));
    }

    /// ( obj -- value )
    pub fn load_attr(&mut self, name: &str) {
        self.code_ops.push(Op::LoadAttr(name.to_string()));
    }

    /// ( value -- )
    pub fn store_global(&mut self, name: &str) {
        self.code_ops.push(Op::StoreGlobal(name.to_string()));
    }

    /// ( value -- )
    pub fn store_fast(&mut self, name: &str) {
        self.code_ops.push(Op::StoreFast(name.to_string()));
    }

    /// ( value -- )
    pub fn store_name(&mut self, name: &str) {
        self.code_ops.push(Op::StoreName(name.to_string()));
    }

    /// Store the second item as an attribute of the top one. ( value obj -- )
    pub fn store_attr(&mut self, name: &str) {
        self.code_ops.push(Op::StoreAttr(name.to_string()));
    }

    /// ( -- )
    pub fn delete_global(&mut self, name: &str) {
        self.code_ops.push(Op::DeleteGlobal(name.to_string()));
    }

    /// ( -- )
    pub fn delete_fast(&mut self, name: &str) {
        self.code_ops.push(Op::DeleteFast(name.to_string()));
    }

    /// ( -- )
    pub fn delete_name(&mut self, name: &str) {
        self.code_ops.push(Op::DeleteName(name.to_string()));
    }

    /// ( value -- )
    pub fn return_value(&mut self) {
        self.code_ops.push(Op::ReturnValue);
    }

    /// ( value -- value value )
    pub fn dup_top(&mut self) {
        self.code_ops.push(Op::DupTop);
    }

    /// ( a b -- a b a b )
    pub fn dup_top_two(&mut self) {
        self.code_ops.push(Op::DupTopTwo);
    }

    /// ( value -- )
    pub fn pop_top(&mut self) {
        self.code_ops.push(Op::PopTop);
    }

    /// ( a b -- b a )
    pub fn rot_two(&mut self) {
        self.code_ops.push(Op::RotTwo);
    }

    /// ( a b c -- c a b )
    pub fn rot_three(&mut self) {
        self.code_ops.push(Op::RotThree);
    }

    /// ( a b c -- c b a )
    pub fn reverse_three(&mut self) {
        self.rot_three();
        self.rot_two();
    }

    /// Build an empty map; `n` is a size hint. ( -- map )
    pub fn build_map(&mut self, n: u32) {
        self.code_ops.push(Op::BuildMap(n));
    }

    /// ( map value key -- map )
    pub fn store_map(&mut self) {
        self.code_ops.push(Op::StoreMap);
    }

    /// ( item_1 .. item_n -- list )
    pub fn build_list(&mut self, n: u32) {
        self.code_ops.push(Op::BuildList(n));
    }

    /// ( item_1 .. item_n -- tuple )
    ///
    /// The empty tuple is loaded as a constant instead.
    pub fn build_tuple(&mut self, n: u32) {
        if n == 0 {
            self.code_ops.push(Op::LoadConst(Const::Tuple(Vec::new())));
        } else {
            self.code_ops.push(Op::BuildTuple(n));
        }
    }

    /// Unpack a sequence of exactly `n` items, first item on top.
    /// ( seq -- item_n .. item_1 )
    pub fn unpack_sequence(&mut self, n: u32) {
        self.code_ops.push(Op::UnpackSequence(n));
    }

    /// ( obj key -- value )
    pub fn binary_subscr(&mut self) {
        self.code_ops.push(Op::BinarySubscr);
    }

    /// ( value obj key -- )
    pub fn store_subscr(&mut self) {
        self.code_ops.push(Op::StoreSubscr);
    }

    /// ( a b -- result )
    pub fn binary_op(&mut self, op: BinOp) {
        self.code_ops.push(Op::BinaryOp(op));
    }

    /// ( a b -- bool )
    pub fn compare_op(&mut self, op: CmpOp) {
        self.code_ops.push(Op::CompareOp(op));
    }

    /// ( value -- bool )
    pub fn unary_not(&mut self) {
        self.code_ops.push(Op::UnaryNot);
    }

    /// ( value -- result )
    pub fn unary_negative(&mut self) {
        self.code_ops.push(Op::UnaryNegative);
    }

    /// ( default_1 .. default_n code -- func )
    pub fn make_function(&mut self, n_defaults: u32) {
        self.code_ops.push(Op::MakeFunction(n_defaults));
    }

    /// ( func arg_1 .. arg_n name_1 kwarg_1 .. name_k kwarg_k -- retval )
    ///
    /// Counts are truncated to 8 bits, as the serialized argument stores them.
    pub fn call_function(&mut self, n_args: u32, n_kwds: u32) {
        self.code_ops.push(Op::CallFunction {
            args: (n_args & 0xFF) as u8,
            kwds: (n_kwds & 0xFF) as u8,
        });
    }

    /// Like `call_function`, with a sequence of extra positional arguments on
    /// top. ( func args.. kwargs.. varargs -- retval )
    pub fn call_function_var(&mut self, n_args: u32, n_kwds: u32) {
        self.code_ops.push(Op::CallFunctionVar {
            args: (n_args & 0xFF) as u8,
            kwds: (n_kwds & 0xFF) as u8,
        });
    }

    /// Raise with `n` operands: 0 re-raises, 1 raises an exception or type,
    /// 2 is `( type value -- )`, 3 adds a traceback.
    pub fn raise_varargs(&mut self, n: u32) {
        self.code_ops.push(Op::RaiseVarargs(n));
    }

    // =========================================================================
    // Composite helpers
    // =========================================================================

    /// ( -- globals )
    pub fn load_globals(&mut self) {
        self.load_global("globals");
        self.call_function(0, 0);
    }

    /// Cache the globals mapping in a fast local. ( -- )
    pub fn store_globals_to_fast(&mut self) {
        self.load_globals();
        self.store_fast(GLOBALS_SLOT);
    }

    /// ( -- globals )
    pub fn load_globals_from_fast(&mut self) {
        self.load_fast(GLOBALS_SLOT);
    }

    /// Load a named compiler helper. ( -- helper )
    pub fn load_helper(&mut self, name: &str) {
        self.load_global(HELPERS_GLOBAL);
        self.load_const(Const::String(name.to_string()));
        self.binary_subscr();
    }

    /// Cache the compiler helpers mapping in a fast local. ( -- )
    pub fn store_helpers_to_fast(&mut self) {
        self.load_global(HELPERS_GLOBAL);
        self.store_fast(HELPERS_SLOT);
    }

    /// Load a named helper from the cached mapping. ( -- helper )
    pub fn load_helper_from_fast(&mut self, name: &str) {
        self.load_fast(HELPERS_SLOT);
        self.load_const(Const::String(name.to_string()));
        self.binary_subscr();
    }

    // =========================================================================
    // Structured regions
    // =========================================================================

    /// Wrap the code emitted by `body` so that any exception it raises is
    /// re-raised from this frame, dropping the frames of whatever the body
    /// called.
    ///
    /// The closing bracket is emitted even if `body` fails; its error is
    /// returned afterwards.
    pub fn try_squash_raise<F>(&mut self, body: F) -> Result<(), AssembleError>
    where
        F: FnOnce(&mut CodeGenerator) -> Result<(), AssembleError>,
    {
        let exc_label = self.new_label();
        let end_label = self.new_label();
        self.code_ops.push(Op::SetupExcept(exc_label));

        let result = body(self);

        self.code_ops.extend([
            Op::PopBlock,
            Op::JumpForward(end_label),
            Op::Label(exc_label), // tb val exc
            Op::RotThree,         // exc tb val
            Op::RotTwo,           // exc val tb
            Op::PopTop,           // exc val
            Op::RaiseVarargs(2),
            Op::JumpForward(end_label),
            Op::EndFinally,
            Op::Label(end_label),
        ]);

        result
    }

    /// Loop over the sequence held in `iter_var`, a fast local when
    /// `fast_var` is set and a global otherwise.
    ///
    /// `body` starts with the current item on the stack and must consume it.
    /// The closing bracket is emitted even if `body` fails.
    pub fn for_loop<F>(&mut self, iter_var: &str, fast_var: bool, body: F) -> Result<(), AssembleError>
    where
        F: FnOnce(&mut CodeGenerator) -> Result<(), AssembleError>,
    {
        let start_label = self.new_label();
        let jump_label = self.new_label();
        let end_label = self.new_label();
        let load = if fast_var {
            Op::LoadFast(iter_var.to_string())
        } else {
            Op::LoadGlobal(iter_var.to_string())
        };
        self.code_ops.extend([
            Op::SetupLoop(end_label),
            load,
            Op::GetIter,
            Op::Label(start_label),
            Op::ForIter(jump_label),
        ]);

        let result = body(self);

        self.code_ops.extend([
            Op::JumpAbsolute(start_label),
            Op::Label(jump_label),
            Op::PopBlock,
            Op::Label(end_label),
        ]);

        result
    }

    // =========================================================================
    // Fragments
    // =========================================================================

    /// Splice the code of a statement fragment.
    ///
    /// With `trim`, the fragment's leading line marker and its trailing
    /// `return None` are dropped so execution continues after it.
    pub fn insert_block<'a>(
        &mut self,
        fragment: impl Into<Fragment<'a>>,
        trim: bool,
    ) -> Result<(), AssembleError> {
        self.insert_fragment(fragment.into(), FragmentMode::Statements, trim)
    }

    /// Splice the code of an expression fragment.
    ///
    /// With `trim`, the trailing return is dropped and the value stays on the
    /// stack. ( -- value )
    pub fn insert_expr<'a>(
        &mut self,
        fragment: impl Into<Fragment<'a>>,
        trim: bool,
    ) -> Result<(), AssembleError> {
        self.insert_fragment(fragment.into(), FragmentMode::Expression, trim)
    }

    fn insert_fragment(
        &mut self,
        fragment: Fragment<'_>,
        mode: FragmentMode,
        trim: bool,
    ) -> Result<(), AssembleError> {
        let code = self
            .compiler
            .compile(fragment, &self.filename, mode)
            .map_err(|e| AssembleError::fragment_syntax(&self.filename, mode, e))?;

        let ops = code
            .to_ops(&mut self.labels)
            .map_err(|e| AssembleError::malformed_fragment(mode, e.to_string()))?;

        let ops = if trim { trim_framing(ops, mode)? } else { ops };

        debug!(
            filename = %self.filename,
            %mode,
            trim,
            spliced = ops.len(),
            "inserted fragment"
        );

        self.code_ops.extend(ops);
        Ok(())
    }

    // =========================================================================
    // Finishing
    // =========================================================================

    /// Turn every dynamically scoped name op into a fast or global one.
    ///
    /// Returns the names, in order of use, that must become call parameters.
    /// See `rewrite::rewrite_to_fast_locals`.
    pub fn rewrite_to_fast_locals<S>(&mut self, local_names: &HashSet<S>) -> Vec<String>
    where
        S: Borrow<str> + Hash + Eq,
    {
        rewrite::rewrite_to_fast_locals(&mut self.code_ops, local_names)
    }

    /// Route attribute loads, calls, subscripts, iteration and returns
    /// through a tracer. See `instrument::inject_tracing`.
    pub fn inject_tracing(&mut self, nested: bool) -> Result<(), AssembleError> {
        self.code_ops = instrument::inject_tracing(&self.code_ops, nested)?;
        Ok(())
    }

    /// Replace the final load with a store through an inverter. On error
    /// the stream is left as it was.
    pub fn inject_inversion(&mut self) -> Result<(), AssembleError> {
        self.code_ops = instrument::inject_inversion(&self.code_ops)?;
        Ok(())
    }

    /// Serialize the stream into a code object. Consumes the generator.
    pub fn to_code(self, meta: CodeMeta) -> Result<CodeObject, AssembleError> {
        assemble(&self.filename, &self.code_ops, meta)
    }
}

/// Strip the framing a standalone compile adds around a fragment.
fn trim_framing(mut ops: Vec<Op>, mode: FragmentMode) -> Result<Vec<Op>, AssembleError> {
    match mode {
        FragmentMode::Statements => {
            if !matches!(ops.first(), Some(Op::SetLineno(_))) {
                return Err(AssembleError::malformed_fragment(
                    mode,
                    "expected a leading line marker",
                ));
            }
            let n = ops.len();
            if n < 3 || !matches!(&ops[n - 2..], [Op::LoadConst(Const::None), Op::ReturnValue]) {
                return Err(AssembleError::malformed_fragment(
                    mode,
                    "expected a trailing `return None`",
                ));
            }
            ops.truncate(n - 2);
            ops.remove(0);
        }
        FragmentMode::Expression => {
            if ops.last() != Some(&Op::ReturnValue) {
                return Err(AssembleError::malformed_fragment(
                    mode,
                    "expected a trailing return",
                ));
            }
            ops.pop();
        }
    }
    Ok(ops)
}
