/// Why a fragment could not be compiled, with its source location.
///
/// `line` and `col` are 1-based. Errors found past the last token point at
/// the last token consumed so locations are never `0:0`.
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentError {
    pub message: String,
    pub line: usize,
    pub col: usize,
}

impl FragmentError {
    pub fn new(message: impl Into<String>, line: usize, col: usize) -> Self {
        Self {
            message: message.into(),
            line,
            col,
        }
    }
}

impl std::fmt::Display for FragmentError {
    /// Formats as `line:col: message` for CLI-friendly diagnostics.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.col, self.message)
    }
}

impl std::error::Error for FragmentError {}
