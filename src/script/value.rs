use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use super::ast::FunctionDef;
use super::error::{ErrorKind, ScriptError, ScriptResult};

pub type Namespace = BTreeMap<String, Value>;

#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Rc<RefCell<Vec<Value>>>),
    Tuple(Rc<Vec<Value>>),
    Dict(Rc<RefCell<BTreeMap<String, Value>>>),
    Function(Rc<Function>),
    Builtin(&'static str),
    Method(Rc<BoundMethod>),
    Module(ModuleKind),
    Iterator(Rc<RefCell<VecDeque<Value>>>),
    Rich(Rc<RichDisplay>),
    Exception(Rc<ExceptionValue>),
}

#[derive(Debug)]
pub struct Function {
    pub def: FunctionDef,
    /// One slot per parameter; `Some` where the parameter has a default.
    pub defaults: Vec<Option<Value>>,
    pub captured: Namespace,
}

#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Value,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Math,
    Time,
    Json,
}

impl ModuleKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "math" => Some(ModuleKind::Math),
            "time" => Some(ModuleKind::Time),
            "json" => Some(ModuleKind::Json),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ModuleKind::Math => "math",
            ModuleKind::Time => "time",
            ModuleKind::Json => "json",
        }
    }
}

/// A renderable payload created by `html()` or `markdown()`.
#[derive(Debug, Clone, PartialEq)]
pub struct RichDisplay {
    pub mime: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionValue {
    pub kind: ErrorKind,
    pub message: String,
}

impl Value {
    pub fn str(text: impl Into<String>) -> Self {
        Value::Str(text.into())
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn tuple(items: Vec<Value>) -> Self {
        Value::Tuple(Rc::new(items))
    }

    pub fn dict(entries: BTreeMap<String, Value>) -> Self {
        Value::Dict(Rc::new(RefCell::new(entries)))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Function(_) => "function",
            Value::Builtin(_) => "builtin_function",
            Value::Method(_) => "method",
            Value::Module(_) => "module",
            Value::Iterator(_) => "iterator",
            Value::Rich(_) => "display",
            Value::Exception(_) => "exception",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(value) => *value,
            Value::Int(value) => *value != 0,
            Value::Float(value) => *value != 0.0,
            Value::Str(text) => !text.is_empty(),
            Value::List(items) => !items.borrow().is_empty(),
            Value::Tuple(items) => !items.is_empty(),
            Value::Dict(entries) => !entries.borrow().is_empty(),
            _ => true,
        }
    }

    /// Address of the shared allocation behind reference values.
    pub fn identity(&self) -> Option<usize> {
        match self {
            Value::List(items) => Some(Rc::as_ptr(items) as *const () as usize),
            Value::Tuple(items) => Some(Rc::as_ptr(items) as *const () as usize),
            Value::Dict(entries) => Some(Rc::as_ptr(entries) as *const () as usize),
            Value::Function(function) => Some(Rc::as_ptr(function) as *const () as usize),
            Value::Method(method) => Some(Rc::as_ptr(method) as *const () as usize),
            Value::Iterator(state) => Some(Rc::as_ptr(state) as *const () as usize),
            Value::Rich(rich) => Some(Rc::as_ptr(rich) as *const () as usize),
            Value::Exception(exc) => Some(Rc::as_ptr(exc) as *const () as usize),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            Value::Bool(value) => Some(i64::from(*value)),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(value) => Some(*value),
            Value::Int(value) => Some(*value as f64),
            Value::Bool(value) => Some(if *value { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn repr(&self) -> String {
        let mut out = String::new();
        self.write_repr(&mut out, &mut Vec::new());
        out
    }

    /// Text produced by `str()` and `print()`.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Str(text) => text.clone(),
            Value::Exception(exc) => exc.message.clone(),
            _ => self.repr(),
        }
    }

    fn write_repr(&self, out: &mut String, seen: &mut Vec<usize>) {
        match self {
            Value::None => out.push_str("None"),
            Value::Bool(true) => out.push_str("True"),
            Value::Bool(false) => out.push_str("False"),
            Value::Int(value) => out.push_str(&value.to_string()),
            Value::Float(value) => out.push_str(&format_float(*value)),
            Value::Str(text) => out.push_str(&quote_str(text)),
            Value::List(items) => {
                let id = Rc::as_ptr(items) as *const () as usize;
                if seen.contains(&id) {
                    out.push_str("[...]");
                    return;
                }
                seen.push(id);
                out.push('[');
                for (index, item) in items.borrow().iter().enumerate() {
                    if index > 0 {
                        out.push_str(", ");
                    }
                    item.write_repr(out, seen);
                }
                out.push(']');
                seen.pop();
            }
            Value::Tuple(items) => {
                out.push('(');
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        out.push_str(", ");
                    }
                    item.write_repr(out, seen);
                }
                if items.len() == 1 {
                    out.push(',');
                }
                out.push(')');
            }
            Value::Dict(entries) => {
                let id = Rc::as_ptr(entries) as *const () as usize;
                if seen.contains(&id) {
                    out.push_str("{...}");
                    return;
                }
                seen.push(id);
                out.push('{');
                for (index, (key, value)) in entries.borrow().iter().enumerate() {
                    if index > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(&quote_str(key));
                    out.push_str(": ");
                    value.write_repr(out, seen);
                }
                out.push('}');
                seen.pop();
            }
            Value::Function(function) => {
                out.push_str(&format!("<function {}>", function.def.name));
            }
            Value::Builtin(name) => out.push_str(&format!("<built-in function {name}>")),
            Value::Method(method) => out.push_str(&format!(
                "<method {}.{}>",
                method.receiver.type_name(),
                method.name
            )),
            Value::Module(kind) => out.push_str(&format!("<module '{}'>", kind.name())),
            Value::Iterator(_) => out.push_str("<iterator>"),
            Value::Rich(rich) => out.push_str(&format!("<display {}>", rich.mime)),
            Value::Exception(exc) => {
                out.push_str(&format!("{}({})", exc.kind, quote_str(&exc.message)));
            }
        }
    }

    pub fn py_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                Rc::ptr_eq(a, b) || seq_eq(&a.borrow(), &b.borrow())
            }
            (Value::Tuple(a), Value::Tuple(b)) => seq_eq(a, b),
            (Value::Dict(a), Value::Dict(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let a = a.borrow();
                let b = b.borrow();
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|((ka, va), (kb, vb))| ka == kb && va.py_eq(vb))
            }
            (Value::Float(_), _) | (_, Value::Float(_)) => {
                match (self.as_float(), other.as_float()) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                }
            }
            (Value::Int(_) | Value::Bool(_), Value::Int(_) | Value::Bool(_)) => {
                self.as_int() == other.as_int()
            }
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            (Value::Module(a), Value::Module(b)) => a == b,
            (Value::Rich(a), Value::Rich(b)) => a == b,
            (Value::Exception(a), Value::Exception(b)) => a == b,
            _ => false,
        }
    }

    pub fn compare(&self, other: &Value) -> ScriptResult<Ordering> {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
            (Value::List(a), Value::List(b)) => seq_cmp(&a.borrow(), &b.borrow()),
            (Value::Tuple(a), Value::Tuple(b)) => seq_cmp(a, b),
            (Value::Int(a), Value::Int(b)) => Ok(a.cmp(b)),
            _ => match (self.as_float(), other.as_float()) {
                (Some(a), Some(b)) => Ok(a.partial_cmp(&b).unwrap_or(Ordering::Equal)),
                _ => Err(ScriptError::type_error(format!(
                    "'<' not supported between instances of '{}' and '{}'",
                    self.type_name(),
                    other.type_name()
                ))),
            },
        }
    }
}

fn seq_eq(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.py_eq(y))
}

fn seq_cmp(a: &[Value], b: &[Value]) -> ScriptResult<Ordering> {
    for (x, y) in a.iter().zip(b) {
        if x.py_eq(y) {
            continue;
        }
        return x.compare(y);
    }
    Ok(a.len().cmp(&b.len()))
}

pub fn format_float(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if value.fract() == 0.0 && value.abs() < 1e16 {
        return format!("{value:.1}");
    }
    let text = format!("{value}");
    if text.len() > 18 {
        return format!("{value:e}");
    }
    text
}

pub fn quote_str(text: &str) -> String {
    let quote = if text.contains('\'') && !text.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(text.len() + 2);
    out.push(quote);
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repr_matches_python_conventions() {
        let value = Value::list(vec![
            Value::Int(1),
            Value::Float(2.0),
            Value::str("it's"),
            Value::tuple(vec![Value::None]),
        ]);
        assert_eq!(value.repr(), "[1, 2.0, \"it's\", (None,)]");
    }

    #[test]
    fn self_referencing_list_repr_terminates() {
        let value = Value::list(vec![Value::Int(1)]);
        if let Value::List(items) = &value {
            items.borrow_mut().push(value.clone());
        }
        assert_eq!(value.repr(), "[1, [...]]");
    }

    #[test]
    fn numeric_equality_crosses_int_and_float() {
        assert!(Value::Int(2).py_eq(&Value::Float(2.0)));
        assert!(Value::Bool(true).py_eq(&Value::Int(1)));
        assert!(!Value::str("1").py_eq(&Value::Int(1)));
    }

    #[test]
    fn comparing_unrelated_types_is_a_type_error() {
        let err = Value::str("a").compare(&Value::Int(1)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Type);
    }
}
