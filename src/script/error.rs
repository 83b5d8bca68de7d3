use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Syntax,
    Name,
    Type,
    Value,
    ZeroDivision,
    Index,
    Key,
    Attribute,
    Assertion,
    Import,
    Runtime,
    Overflow,
    Recursion,
    StopIteration,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Syntax => "SyntaxError",
            ErrorKind::Name => "NameError",
            ErrorKind::Type => "TypeError",
            ErrorKind::Value => "ValueError",
            ErrorKind::ZeroDivision => "ZeroDivisionError",
            ErrorKind::Index => "IndexError",
            ErrorKind::Key => "KeyError",
            ErrorKind::Attribute => "AttributeError",
            ErrorKind::Assertion => "AssertionError",
            ErrorKind::Import => "ImportError",
            ErrorKind::Runtime => "RuntimeError",
            ErrorKind::Overflow => "OverflowError",
            ErrorKind::Recursion => "RecursionError",
            ErrorKind::StopIteration => "StopIteration",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let kind = match name {
            "RuntimeError" => ErrorKind::Runtime,
            "ValueError" => ErrorKind::Value,
            "TypeError" => ErrorKind::Type,
            "KeyError" => ErrorKind::Key,
            _ => return None,
        };
        Some(kind)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    pub line: u32,
    pub scope: String,
}

/// A failure raised while parsing or running a cell.
///
/// Frames are pushed innermost first as the error unwinds out of function
/// calls; [`ScriptError::traceback`] renders them outermost first.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ScriptError {
    pub kind: ErrorKind,
    pub message: String,
    pub trace: Vec<TraceEntry>,
    pending_line: Option<u32>,
}

impl ScriptError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            trace: Vec::new(),
            pending_line: None,
        }
    }

    pub fn syntax(line: u32, message: impl Into<String>) -> Self {
        let mut err = Self::new(ErrorKind::Syntax, message);
        err.pending_line = Some(line);
        err
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Type, message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Value, message)
    }

    /// Records the innermost statement line for the current scope.
    pub(crate) fn at_line(mut self, line: u32) -> Self {
        if self.pending_line.is_none() {
            self.pending_line = Some(line);
        }
        self
    }

    /// Closes the current scope, turning the pending line into a frame.
    pub(crate) fn leave_scope(mut self, scope: &str, fallback_line: u32) -> Self {
        let line = self.pending_line.take().unwrap_or(fallback_line);
        self.trace.push(TraceEntry {
            line,
            scope: scope.to_string(),
        });
        self
    }

    pub fn traceback(&self) -> String {
        let mut out = String::from("Traceback (most recent call last):\n");
        for entry in self.trace.iter().rev() {
            out.push_str(&format!("  line {}, in {}\n", entry.line, entry.scope));
        }
        out.push_str(&format!("{}: {}\n", self.kind, self.message));
        out
    }
}

pub type ScriptResult<T> = Result<T, ScriptError>;
