//! The cell language: a small, indentation-structured scripting language.

pub mod ast;
pub mod builtins;
mod error;
mod interp;
mod lexer;
mod parser;
mod value;

pub use ast::{FunctionDef, Stmt};
pub use error::{ErrorKind, ScriptError, ScriptResult, TraceEntry};
pub use interp::{BufferHost, CELL_SCOPE, DEFAULT_MAX_DEPTH, Host, Interpreter, MAX_SEQUENCE_LEN};
pub use lexer::tokenize;
pub use parser::{is_keyword, parse};
pub use value::{
    BoundMethod, ExceptionValue, Function, ModuleKind, Namespace, RichDisplay, Value, format_float,
    quote_str,
};
