use crate::bytecode::ir::DecodeError;
use crate::bytecode::label::Label;
use crate::bytecode::stack_check::StackCheckError;
use crate::frontend::FragmentMode;
use crate::frontend::parser_error::FragmentError;

/// What is wrong with a label found during serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelProblem {
    /// A jump refers to the label but no marker places it.
    NeverMarked,
    /// The label is placed but nothing jumps to it.
    NeverReferenced,
    /// The label is placed more than once.
    MarkedTwice,
}

impl std::fmt::Display for LabelProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LabelProblem::NeverMarked => write!(f, "is referenced but never marked"),
            LabelProblem::NeverReferenced => write!(f, "is marked but never referenced"),
            LabelProblem::MarkedTwice => write!(f, "is marked more than once"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum AssembleError {
    /// A spliced fragment did not compile in its declared mode.
    FragmentSyntax {
        filename: String,
        mode: FragmentMode,
        error: FragmentError,
    },
    /// A compiled fragment lacks the framing instructions trimming removes.
    MalformedFragment { mode: FragmentMode, reason: String },
    UnresolvedLabel { label: Label, problem: LabelProblem },
    /// A forward-only jump points backwards.
    InvalidJump { label: Label, at: usize },
    /// The same name is declared twice in the parameter list.
    DuplicateParameter { name: String },
    /// The expression does not end in a load that has a matching store.
    NotInvertible { found: String },
    /// A nested code object could not be decoded for rewriting.
    Decode(DecodeError),
    StackImbalance(StackCheckError),
}

impl AssembleError {
    pub fn fragment_syntax(filename: &str, mode: FragmentMode, error: FragmentError) -> Self {
        AssembleError::FragmentSyntax {
            filename: filename.to_string(),
            mode,
            error,
        }
    }

    pub fn malformed_fragment(mode: FragmentMode, reason: impl Into<String>) -> Self {
        AssembleError::MalformedFragment {
            mode,
            reason: reason.into(),
        }
    }

    pub fn unresolved(label: Label, problem: LabelProblem) -> Self {
        AssembleError::UnresolvedLabel { label, problem }
    }

    pub fn stack(message: impl Into<String>, ip: usize) -> Self {
        AssembleError::StackImbalance(StackCheckError {
            ip,
            message: message.into(),
        })
    }
}

impl From<StackCheckError> for AssembleError {
    fn from(err: StackCheckError) -> Self {
        AssembleError::StackImbalance(err)
    }
}

impl From<DecodeError> for AssembleError {
    fn from(err: DecodeError) -> Self {
        AssembleError::Decode(err)
    }
}

impl std::fmt::Display for AssembleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssembleError::FragmentSyntax {
                filename,
                mode,
                error,
            } => {
                write!(f, "assemble error: {} fragment in '{}': {}", mode, filename, error)
            }
            AssembleError::MalformedFragment { mode, reason } => {
                write!(f, "assemble error: malformed {} fragment: {}", mode, reason)?;
                write!(f, "\n  hint: pass trim = false to splice the fragment verbatim")
            }
            AssembleError::UnresolvedLabel { label, problem } => {
                write!(f, "assemble error: label {} {}", label, problem)
            }
            AssembleError::InvalidJump { label, at } => {
                write!(
                    f,
                    "assemble error: forward jump at {} targets label {} behind it",
                    at, label
                )?;
                write!(f, "\n  hint: use jump_absolute for backward jumps")
            }
            AssembleError::DuplicateParameter { name } => {
                write!(f, "assemble error: duplicate parameter '{}'", name)
            }
            AssembleError::NotInvertible { found } => {
                write!(f, "assemble error: can't invert code ending in {}", found)
            }
            AssembleError::Decode(err) => write!(f, "assemble error: {}", err),
            AssembleError::StackImbalance(err) => write!(f, "assemble error: {}", err),
        }
    }
}

impl std::error::Error for AssembleError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::label::LabelAllocator;

    #[test]
    fn test_unresolved_label_display() {
        let label = LabelAllocator::new().fresh();
        let err = AssembleError::unresolved(label, LabelProblem::NeverMarked);

        let msg = err.to_string();
        assert!(msg.contains("L0"));
        assert!(msg.contains("never marked"));
    }

    #[test]
    fn test_fragment_syntax_display() {
        let err = AssembleError::fragment_syntax(
            "view.kv",
            FragmentMode::Expression,
            FragmentError::new("unexpected token", 1, 4),
        );

        let msg = err.to_string();
        assert!(msg.contains("expression"));
        assert!(msg.contains("view.kv"));
        assert!(msg.contains("1:4"));
    }

    #[test]
    fn test_invalid_jump_has_hint() {
        let label = LabelAllocator::new().fresh();
        let msg = AssembleError::InvalidJump { label, at: 3 }.to_string();
        assert!(msg.contains("hint"));
        assert!(msg.contains("jump_absolute"));
    }

    #[test]
    fn test_stack_imbalance_from_check_error() {
        let err: AssembleError = StackCheckError {
            ip: 2,
            message: "stack underflow".to_string(),
        }
        .into();

        assert!(matches!(err, AssembleError::StackImbalance(_)));
        assert!(err.to_string().contains("ip=2"));
    }

    #[test]
    fn test_error_implements_std_error() {
        let err = AssembleError::stack("bad", 0);
        let _: &dyn std::error::Error = &err;
    }
}
