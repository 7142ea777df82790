//! Source positions attached to tokens, AST nodes and diagnostics.

use core::fmt;
use std::sync::Arc;

/// A position in a source file. Lines and columns are one-based; zero means
/// the position is unknown (synthetic nodes, stripped debug info).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Location {
    /// Name of the file the entity came from.
    pub file: Arc<str>,
    /// One-based line.
    pub line: u32,
    /// One-based column.
    pub column: u32,
}

impl Location {
    /// Position inside a named file.
    pub fn new(file: &Arc<str>, line: u32, column: u32) -> Self {
        Self {
            file: Arc::clone(file),
            line,
            column,
        }
    }

    /// A position that points nowhere, for synthesized nodes.
    pub fn unknown() -> Self {
        Self {
            file: Arc::from(""),
            line: 0,
            column: 0,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.file.is_empty() {
            write!(f, "line {}:{}", self.line, self.column)
        } else {
            write!(f, "{}:{}:{}", self.file, self.line, self.column)
        }
    }
}
