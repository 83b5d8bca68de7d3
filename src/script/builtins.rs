use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::error::{ErrorKind, ScriptError, ScriptResult};
use super::interp::{Interpreter, MAX_SEQUENCE_LEN, binary_op};
use super::value::{ExceptionValue, ModuleKind, RichDisplay, Value};
use crate::protocol::OutputEvent;

const BUILTINS: &[&str] = &[
    "print",
    "eprint",
    "display",
    "html",
    "markdown",
    "len",
    "range",
    "str",
    "repr",
    "int",
    "float",
    "bool",
    "list",
    "dict",
    "tuple",
    "sum",
    "min",
    "max",
    "abs",
    "round",
    "sorted",
    "iter",
    "next",
    "type",
    "callable",
    "sleep",
    "RuntimeError",
    "ValueError",
    "TypeError",
    "KeyError",
];

const MODULE_FUNCTIONS: &[&str] = &[
    "math.sqrt",
    "math.floor",
    "math.ceil",
    "time.sleep",
    "time.time",
    "json.dumps",
    "json.loads",
];

const MAX_RANGE_LEN: i128 = MAX_SEQUENCE_LEN as i128;

const LIST_METHODS: &[&str] = &["append", "extend", "pop", "insert", "index", "count"];
const DICT_METHODS: &[&str] = &["get", "keys", "values", "items", "pop", "update"];
const STR_METHODS: &[&str] = &[
    "upper",
    "lower",
    "strip",
    "split",
    "join",
    "replace",
    "startswith",
    "endswith",
    "format",
];

type Kwargs = Vec<(String, Value)>;

pub fn lookup(name: &str) -> Option<Value> {
    BUILTINS
        .iter()
        .chain(MODULE_FUNCTIONS)
        .find(|candidate| **candidate == name)
        .map(|found| Value::Builtin(found))
}

/// True when `name` is bound to the builtin of the same name.
pub fn is_builtin_binding(name: &str, value: &Value) -> bool {
    matches!(value, Value::Builtin(builtin) if *builtin == name)
}

pub fn has_method(receiver: &Value, name: &str) -> bool {
    let table = match receiver {
        Value::List(_) => LIST_METHODS,
        Value::Dict(_) => DICT_METHODS,
        Value::Str(_) => STR_METHODS,
        _ => return false,
    };
    table.contains(&name)
}

pub fn module_attr(kind: ModuleKind, name: &str) -> ScriptResult<Value> {
    match (kind, name) {
        (ModuleKind::Math, "pi") => return Ok(Value::Float(std::f64::consts::PI)),
        (ModuleKind::Math, "e") => return Ok(Value::Float(std::f64::consts::E)),
        (ModuleKind::Math, "inf") => return Ok(Value::Float(f64::INFINITY)),
        (ModuleKind::Math, "nan") => return Ok(Value::Float(f64::NAN)),
        _ => {}
    }
    let qualified = format!("{}.{name}", kind.name());
    lookup(&qualified).ok_or_else(|| {
        ScriptError::new(
            ErrorKind::Attribute,
            format!("module '{}' has no attribute '{name}'", kind.name()),
        )
    })
}

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> ScriptResult<()> {
    if args.len() >= min && args.len() <= max {
        return Ok(());
    }
    let expected = if min == max {
        format!("exactly {min}")
    } else if max == usize::MAX {
        format!("at least {min}")
    } else {
        format!("from {min} to {max}")
    };
    Err(ScriptError::type_error(format!(
        "{name}() takes {expected} arguments ({} given)",
        args.len()
    )))
}

fn no_kwargs(name: &str, kwargs: &Kwargs) -> ScriptResult<()> {
    match kwargs.first() {
        None => Ok(()),
        Some((key, _)) => Err(ScriptError::type_error(format!(
            "{name}() got an unexpected keyword argument '{key}'"
        ))),
    }
}

fn take_kwarg(name: &str, kwargs: &mut Kwargs, allowed: &[&str]) -> ScriptResult<BTreeMap<String, Value>> {
    let mut out = BTreeMap::new();
    for (key, value) in kwargs.drain(..) {
        if !allowed.contains(&key.as_str()) {
            return Err(ScriptError::type_error(format!(
                "{name}() got an unexpected keyword argument '{key}'"
            )));
        }
        out.insert(key, value);
    }
    Ok(out)
}

fn expect_str<'v>(name: &str, value: &'v Value) -> ScriptResult<&'v str> {
    match value {
        Value::Str(text) => Ok(text),
        other => Err(ScriptError::type_error(format!(
            "{name}() argument must be str, not {}",
            other.type_name()
        ))),
    }
}

fn expect_number(name: &str, value: &Value) -> ScriptResult<f64> {
    value.as_float().ok_or_else(|| {
        ScriptError::type_error(format!(
            "{name}() argument must be a number, not {}",
            value.type_name()
        ))
    })
}

pub fn call(
    interp: &mut Interpreter<'_>,
    name: &str,
    mut args: Vec<Value>,
    mut kwargs: Kwargs,
) -> ScriptResult<Value> {
    match name {
        "print" | "eprint" => {
            let options = take_kwarg(name, &mut kwargs, &["sep", "end"])?;
            let sep = text_option(options.get("sep"), " ")?;
            let end = text_option(options.get("end"), "\n")?;
            let mut text = args
                .iter()
                .map(Value::to_display_string)
                .collect::<Vec<_>>()
                .join(&sep);
            text.push_str(&end);
            let event = if name == "print" {
                OutputEvent::stdout(text)
            } else {
                OutputEvent::stderr(text)
            };
            interp.emit(event);
            Ok(Value::None)
        }
        "display" => {
            no_kwargs(name, &kwargs)?;
            for value in &args {
                interp.emit(OutputEvent::display(mime_bundle(value)));
            }
            Ok(Value::None)
        }
        "html" | "markdown" => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 1)?;
            let mime = if name == "html" {
                "text/html"
            } else {
                "text/markdown"
            };
            Ok(Value::Rich(Rc::new(RichDisplay {
                mime: mime.to_string(),
                data: expect_str(name, &args[0])?.to_string(),
            })))
        }
        "len" => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 1)?;
            let len = match &args[0] {
                Value::Str(text) => text.chars().count(),
                Value::List(items) => items.borrow().len(),
                Value::Tuple(items) => items.len(),
                Value::Dict(entries) => entries.borrow().len(),
                other => {
                    return Err(ScriptError::type_error(format!(
                        "object of type '{}' has no len()",
                        other.type_name()
                    )));
                }
            };
            Ok(Value::Int(len as i64))
        }
        "range" => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 3)?;
            let ints = args
                .iter()
                .map(|arg| {
                    arg.as_int().ok_or_else(|| {
                        ScriptError::type_error(format!(
                            "'{}' object cannot be interpreted as an integer",
                            arg.type_name()
                        ))
                    })
                })
                .collect::<ScriptResult<Vec<i64>>>()?;
            let (start, stop, step) = match ints.as_slice() {
                [stop] => (0, *stop, 1),
                [start, stop] => (*start, *stop, 1),
                [start, stop, step] => (*start, *stop, *step),
                _ => unreachable!("arity checked"),
            };
            if step == 0 {
                return Err(ScriptError::value_error("range() arg 3 must not be zero"));
            }
            let (start, stop, step) = (i128::from(start), i128::from(stop), i128::from(step));
            let span = if step > 0 {
                (stop - start + step - 1) / step
            } else {
                (start - stop - step - 1) / -step
            };
            if span > MAX_RANGE_LEN {
                return Err(ScriptError::value_error(format!(
                    "range() of {span} items exceeds the limit of {MAX_RANGE_LEN}"
                )));
            }
            // Every element lies between start and stop, so it fits in i64.
            let items = (0..span.max(0))
                .map(|i| Value::Int((start + i * step) as i64))
                .collect();
            Ok(Value::list(items))
        }
        "str" => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 0, 1)?;
            Ok(Value::Str(
                args.first().map(Value::to_display_string).unwrap_or_default(),
            ))
        }
        "repr" => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 1)?;
            Ok(Value::Str(args[0].repr()))
        }
        "int" => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 0, 1)?;
            let Some(value) = args.first() else {
                return Ok(Value::Int(0));
            };
            to_int(value).map(Value::Int)
        }
        "float" => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 0, 1)?;
            let Some(value) = args.first() else {
                return Ok(Value::Float(0.0));
            };
            to_float(value).map(Value::Float)
        }
        "bool" => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 0, 1)?;
            Ok(Value::Bool(args.first().is_some_and(Value::truthy)))
        }
        "list" | "tuple" => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 0, 1)?;
            let items = match args.first() {
                Some(value) => interp.iterate_all(value)?,
                None => Vec::new(),
            };
            Ok(if name == "list" {
                Value::list(items)
            } else {
                Value::tuple(items)
            })
        }
        "dict" => {
            arity(name, &args, 0, 1)?;
            let mut entries = match args.first() {
                Some(Value::Dict(source)) => source.borrow().clone(),
                Some(other) => pairs_to_entries(interp, other)?,
                None => BTreeMap::new(),
            };
            entries.extend(kwargs);
            Ok(Value::dict(entries))
        }
        "sum" => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 2)?;
            let mut total = args.get(1).cloned().unwrap_or(Value::Int(0));
            for item in interp.iterate_all(&args[0])? {
                total = binary_op(super::ast::BinOp::Add, &total, &item)?;
            }
            Ok(total)
        }
        "min" | "max" => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, usize::MAX)?;
            let items = if args.len() == 1 {
                interp.iterate_all(&args[0])?
            } else {
                args
            };
            let mut iter = items.into_iter();
            let Some(mut best) = iter.next() else {
                return Err(ScriptError::value_error(format!(
                    "{name}() arg is an empty sequence"
                )));
            };
            let wanted = if name == "min" {
                Ordering::Less
            } else {
                Ordering::Greater
            };
            for item in iter {
                if item.compare(&best)? == wanted {
                    best = item;
                }
            }
            Ok(best)
        }
        "abs" => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 1)?;
            match &args[0] {
                Value::Float(number) => Ok(Value::Float(number.abs())),
                value => match value.as_int() {
                    Some(number) => number.checked_abs().map(Value::Int).ok_or_else(|| {
                        ScriptError::new(ErrorKind::Overflow, "integer overflow")
                    }),
                    None => Err(ScriptError::type_error(format!(
                        "bad operand type for abs(): '{}'",
                        value.type_name()
                    ))),
                },
            }
        }
        "round" => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 2)?;
            let number = expect_number(name, &args[0])?;
            match args.get(1) {
                None | Some(Value::None) => {
                    if let Value::Int(value) = args[0] {
                        return Ok(Value::Int(value));
                    }
                    let rounded = round_half_even(number);
                    if !rounded.is_finite() {
                        return Err(ScriptError::value_error("cannot round a non-finite float"));
                    }
                    Ok(Value::Int(rounded as i64))
                }
                Some(digits) => {
                    let digits = digits.as_int().ok_or_else(|| {
                        ScriptError::type_error("round() ndigits must be an integer")
                    })?;
                    let scale = 10f64.powi(digits.clamp(-300, 300) as i32);
                    Ok(Value::Float(round_half_even(number * scale) / scale))
                }
            }
        }
        "sorted" => {
            let options = take_kwarg(name, &mut kwargs, &["reverse"])?;
            arity(name, &args, 1, 1)?;
            let mut items = interp.iterate_all(&args[0])?;
            sort_values(&mut items)?;
            if options.get("reverse").is_some_and(Value::truthy) {
                items.reverse();
            }
            Ok(Value::list(items))
        }
        "iter" => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 1)?;
            if let Value::Iterator(_) = &args[0] {
                return Ok(args.remove(0));
            }
            let items: VecDeque<Value> = interp.iterate_all(&args[0])?.into();
            Ok(Value::Iterator(Rc::new(RefCell::new(items))))
        }
        "next" => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 2)?;
            let Value::Iterator(state) = &args[0] else {
                return Err(ScriptError::type_error(format!(
                    "'{}' object is not an iterator",
                    args[0].type_name()
                )));
            };
            let next = state.borrow_mut().pop_front();
            match (next, args.get(1)) {
                (Some(value), _) => Ok(value),
                (None, Some(default)) => Ok(default.clone()),
                (None, None) => Err(ScriptError::new(ErrorKind::StopIteration, "")),
            }
        }
        "type" => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 1)?;
            Ok(Value::str(args[0].type_name()))
        }
        "callable" => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 1)?;
            Ok(Value::Bool(matches!(
                args[0],
                Value::Function(_) | Value::Builtin(_) | Value::Method(_)
            )))
        }
        "sleep" | "time.sleep" => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 1)?;
            let seconds = expect_number(name, &args[0])?;
            if !(seconds >= 0.0) || !seconds.is_finite() {
                return Err(ScriptError::value_error("sleep length must be non-negative"));
            }
            interp.sleep(Duration::from_secs_f64(seconds));
            Ok(Value::None)
        }
        "time.time" => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 0, 0)?;
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|duration| duration.as_secs_f64())
                .unwrap_or(0.0);
            Ok(Value::Float(now))
        }
        "math.sqrt" => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 1)?;
            let number = expect_number(name, &args[0])?;
            if number < 0.0 {
                return Err(ScriptError::value_error("math domain error"));
            }
            Ok(Value::Float(number.sqrt()))
        }
        "math.floor" | "math.ceil" => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 1)?;
            if let Value::Int(value) = args[0] {
                return Ok(Value::Int(value));
            }
            let number = expect_number(name, &args[0])?;
            let rounded = if name == "math.floor" {
                number.floor()
            } else {
                number.ceil()
            };
            if !rounded.is_finite() {
                return Err(ScriptError::new(
                    ErrorKind::Overflow,
                    "cannot convert float infinity to integer",
                ));
            }
            Ok(Value::Int(rounded as i64))
        }
        "json.dumps" => {
            let options = take_kwarg(name, &mut kwargs, &["indent"])?;
            arity(name, &args, 1, 1)?;
            let json = value_to_json(&args[0])?;
            let text = match options.get("indent") {
                Some(indent) if indent.truthy() => serde_json::to_string_pretty(&json),
                _ => serde_json::to_string(&json),
            }
            .map_err(|err| ScriptError::value_error(err.to_string()))?;
            Ok(Value::Str(text))
        }
        "json.loads" => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 1)?;
            let text = expect_str(name, &args[0])?;
            let json: serde_json::Value = serde_json::from_str(text)
                .map_err(|err| ScriptError::value_error(format!("invalid JSON: {err}")))?;
            Ok(json_to_value(json))
        }
        _ => {
            if let Some(kind) = ErrorKind::from_name(name) {
                no_kwargs(name, &kwargs)?;
                let message = args
                    .iter()
                    .map(Value::to_display_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                return Ok(Value::Exception(Rc::new(ExceptionValue { kind, message })));
            }
            Err(ScriptError::new(
                ErrorKind::Name,
                format!("name '{name}' is not defined"),
            ))
        }
    }
}

pub fn call_method(
    interp: &mut Interpreter<'_>,
    receiver: &Value,
    name: &str,
    args: Vec<Value>,
    kwargs: Kwargs,
) -> ScriptResult<Value> {
    if !has_method(receiver, name) {
        return Err(ScriptError::new(
            ErrorKind::Attribute,
            format!("'{}' object has no attribute '{name}'", receiver.type_name()),
        ));
    }
    let qualified = format!("{}.{name}", receiver.type_name());
    match receiver {
        Value::List(items) => {
            no_kwargs(&qualified, &kwargs)?;
            list_method(interp, items, name, &qualified, args)
        }
        Value::Dict(entries) => dict_method(entries, name, &qualified, args, kwargs),
        Value::Str(text) => {
            no_kwargs(&qualified, &kwargs)?;
            str_method(interp, text, name, &qualified, args)
        }
        _ => unreachable!("has_method only accepts list, dict and str"),
    }
}

fn list_method(
    interp: &mut Interpreter<'_>,
    items: &Rc<RefCell<Vec<Value>>>,
    name: &str,
    qualified: &str,
    mut args: Vec<Value>,
) -> ScriptResult<Value> {
    match name {
        "append" => {
            arity(qualified, &args, 1, 1)?;
            items.borrow_mut().push(args.remove(0));
            Ok(Value::None)
        }
        "extend" => {
            arity(qualified, &args, 1, 1)?;
            let extra = interp.iterate_all(&args[0])?;
            items.borrow_mut().extend(extra);
            Ok(Value::None)
        }
        "pop" => {
            arity(qualified, &args, 0, 1)?;
            let mut items = items.borrow_mut();
            if items.is_empty() {
                return Err(ScriptError::new(ErrorKind::Index, "pop from empty list"));
            }
            let len = items.len() as i64;
            let raw = match args.first() {
                Some(index) => index
                    .as_int()
                    .ok_or_else(|| ScriptError::type_error("list indices must be integers"))?,
                None => -1,
            };
            let at = if raw < 0 { raw + len } else { raw };
            if at < 0 || at >= len {
                return Err(ScriptError::new(ErrorKind::Index, "pop index out of range"));
            }
            Ok(items.remove(at as usize))
        }
        "insert" => {
            arity(qualified, &args, 2, 2)?;
            let raw = args[0]
                .as_int()
                .ok_or_else(|| ScriptError::type_error("list indices must be integers"))?;
            let value = args.remove(1);
            let mut items = items.borrow_mut();
            let len = items.len() as i64;
            let at = if raw < 0 { (raw + len).max(0) } else { raw.min(len) };
            items.insert(at as usize, value);
            Ok(Value::None)
        }
        "index" => {
            arity(qualified, &args, 1, 1)?;
            items
                .borrow()
                .iter()
                .position(|item| item.py_eq(&args[0]))
                .map(|at| Value::Int(at as i64))
                .ok_or_else(|| {
                    ScriptError::value_error(format!("{} is not in list", args[0].repr()))
                })
        }
        "count" => {
            arity(qualified, &args, 1, 1)?;
            let count = items
                .borrow()
                .iter()
                .filter(|item| item.py_eq(&args[0]))
                .count();
            Ok(Value::Int(count as i64))
        }
        _ => unreachable!("checked by has_method"),
    }
}

fn dict_method(
    entries: &Rc<RefCell<BTreeMap<String, Value>>>,
    name: &str,
    qualified: &str,
    args: Vec<Value>,
    kwargs: Kwargs,
) -> ScriptResult<Value> {
    if name != "update" {
        no_kwargs(qualified, &kwargs)?;
    }
    match name {
        "get" => {
            arity(qualified, &args, 1, 2)?;
            let found = match &args[0] {
                Value::Str(key) => entries.borrow().get(key).cloned(),
                _ => None,
            };
            Ok(found.unwrap_or_else(|| args.get(1).cloned().unwrap_or(Value::None)))
        }
        "keys" => {
            arity(qualified, &args, 0, 0)?;
            Ok(Value::list(
                entries.borrow().keys().map(|key| Value::str(key)).collect(),
            ))
        }
        "values" => {
            arity(qualified, &args, 0, 0)?;
            Ok(Value::list(entries.borrow().values().cloned().collect()))
        }
        "items" => {
            arity(qualified, &args, 0, 0)?;
            Ok(Value::list(
                entries
                    .borrow()
                    .iter()
                    .map(|(key, value)| Value::tuple(vec![Value::str(key), value.clone()]))
                    .collect(),
            ))
        }
        "pop" => {
            arity(qualified, &args, 1, 2)?;
            let removed = match &args[0] {
                Value::Str(key) => entries.borrow_mut().remove(key),
                _ => None,
            };
            match (removed, args.get(1)) {
                (Some(value), _) => Ok(value),
                (None, Some(default)) => Ok(default.clone()),
                (None, None) => Err(ScriptError::new(ErrorKind::Key, args[0].repr())),
            }
        }
        "update" => {
            arity(qualified, &args, 0, 1)?;
            let mut incoming = match args.first() {
                Some(Value::Dict(other)) => other.borrow().clone(),
                Some(other) => {
                    return Err(ScriptError::type_error(format!(
                        "dict.update() argument must be a dict, not {}",
                        other.type_name()
                    )));
                }
                None => BTreeMap::new(),
            };
            incoming.extend(kwargs);
            entries.borrow_mut().extend(incoming);
            Ok(Value::None)
        }
        _ => unreachable!("checked by has_method"),
    }
}

fn str_method(
    interp: &mut Interpreter<'_>,
    text: &str,
    name: &str,
    qualified: &str,
    args: Vec<Value>,
) -> ScriptResult<Value> {
    match name {
        "upper" => {
            arity(qualified, &args, 0, 0)?;
            Ok(Value::str(text.to_uppercase()))
        }
        "lower" => {
            arity(qualified, &args, 0, 0)?;
            Ok(Value::str(text.to_lowercase()))
        }
        "strip" => {
            arity(qualified, &args, 0, 0)?;
            Ok(Value::str(text.trim()))
        }
        "split" => {
            arity(qualified, &args, 0, 1)?;
            let parts: Vec<Value> = match args.first() {
                None | Some(Value::None) => text.split_whitespace().map(Value::str).collect(),
                Some(sep) => {
                    let sep = expect_str(qualified, sep)?;
                    if sep.is_empty() {
                        return Err(ScriptError::value_error("empty separator"));
                    }
                    text.split(sep).map(Value::str).collect()
                }
            };
            Ok(Value::list(parts))
        }
        "join" => {
            arity(qualified, &args, 1, 1)?;
            let parts = interp
                .iterate_all(&args[0])?
                .iter()
                .map(|part| match part {
                    Value::Str(part) => Ok(part.clone()),
                    other => Err(ScriptError::type_error(format!(
                        "sequence item: expected str instance, {} found",
                        other.type_name()
                    ))),
                })
                .collect::<ScriptResult<Vec<String>>>()?;
            Ok(Value::str(parts.join(text)))
        }
        "replace" => {
            arity(qualified, &args, 2, 2)?;
            let from = expect_str(qualified, &args[0])?;
            let to = expect_str(qualified, &args[1])?;
            Ok(Value::str(text.replace(from, to)))
        }
        "startswith" | "endswith" => {
            arity(qualified, &args, 1, 1)?;
            let affix = expect_str(qualified, &args[0])?;
            Ok(Value::Bool(if name == "startswith" {
                text.starts_with(affix)
            } else {
                text.ends_with(affix)
            }))
        }
        "format" => format_str(text, &args).map(Value::Str),
        _ => unreachable!("checked by has_method"),
    }
}

/// `"{} and {1}".format(a, b)`: positional fields only.
fn format_str(template: &str, args: &[Value]) -> ScriptResult<String> {
    let mut out = String::with_capacity(template.len());
    let mut next_auto = 0;
    let mut chars = template.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut field = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => field.push(c),
                        None => {
                            return Err(ScriptError::value_error(
                                "expected '}' before end of string",
                            ));
                        }
                    }
                }
                let index = if field.is_empty() {
                    next_auto += 1;
                    next_auto - 1
                } else {
                    field.parse::<usize>().map_err(|_| {
                        ScriptError::value_error(format!("unsupported format field '{field}'"))
                    })?
                };
                let value = args.get(index).ok_or_else(|| {
                    ScriptError::new(
                        ErrorKind::Index,
                        format!("Replacement index {index} out of range"),
                    )
                })?;
                out.push_str(&value.to_display_string());
            }
            c => out.push(c),
        }
    }
    Ok(out)
}

fn text_option(value: Option<&Value>, default: &str) -> ScriptResult<String> {
    match value {
        None | Some(Value::None) => Ok(default.to_string()),
        Some(Value::Str(text)) => Ok(text.clone()),
        Some(other) => Err(ScriptError::type_error(format!(
            "sep and end must be None or a string, not {}",
            other.type_name()
        ))),
    }
}

fn mime_bundle(value: &Value) -> BTreeMap<String, String> {
    let mut bundle = BTreeMap::new();
    if let Value::Rich(rich) = value {
        bundle.insert(rich.mime.clone(), rich.data.clone());
        bundle.insert("text/plain".to_string(), rich.data.clone());
    } else {
        bundle.insert("text/plain".to_string(), value.to_display_string());
    }
    bundle
}

fn to_int(value: &Value) -> ScriptResult<i64> {
    match value {
        Value::Float(number) => {
            if !number.is_finite() {
                return Err(ScriptError::value_error(format!(
                    "cannot convert float {} to integer",
                    super::value::format_float(*number)
                )));
            }
            Ok(number.trunc() as i64)
        }
        Value::Str(text) => text.trim().replace('_', "").parse::<i64>().map_err(|_| {
            ScriptError::value_error(format!(
                "invalid literal for int() with base 10: {}",
                value.repr()
            ))
        }),
        other => other.as_int().ok_or_else(|| {
            ScriptError::type_error(format!(
                "int() argument must be a string or a number, not '{}'",
                other.type_name()
            ))
        }),
    }
}

fn to_float(value: &Value) -> ScriptResult<f64> {
    match value {
        Value::Str(text) => text.trim().parse::<f64>().map_err(|_| {
            ScriptError::value_error(format!(
                "could not convert string to float: {}",
                value.repr()
            ))
        }),
        other => other.as_float().ok_or_else(|| {
            ScriptError::type_error(format!(
                "float() argument must be a string or a number, not '{}'",
                other.type_name()
            ))
        }),
    }
}

fn round_half_even(number: f64) -> f64 {
    let rounded = number.round();
    if (number - number.trunc()).abs() == 0.5 {
        2.0 * (number / 2.0).round()
    } else {
        rounded
    }
}

fn sort_values(items: &mut [Value]) -> ScriptResult<()> {
    let mut failure = None;
    items.sort_by(|a, b| match a.compare(b) {
        Ok(ordering) => ordering,
        Err(err) => {
            failure.get_or_insert(err);
            Ordering::Equal
        }
    });
    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn pairs_to_entries(
    interp: &Interpreter<'_>,
    source: &Value,
) -> ScriptResult<BTreeMap<String, Value>> {
    let mut entries = BTreeMap::new();
    for pair in interp.iterate_all(source)? {
        let items = interp.iterate_all(&pair)?;
        let [key, value] = <[Value; 2]>::try_from(items).map_err(|_| {
            ScriptError::value_error("dictionary update sequence element has wrong length")
        })?;
        let Value::Str(key) = key else {
            return Err(ScriptError::type_error(format!(
                "dict keys must be str, not {}",
                key.type_name()
            )));
        };
        entries.insert(key, value);
    }
    Ok(entries)
}

fn value_to_json(value: &Value) -> ScriptResult<serde_json::Value> {
    use serde_json::Value as Json;
    Ok(match value {
        Value::None => Json::Null,
        Value::Bool(flag) => Json::Bool(*flag),
        Value::Int(number) => Json::from(*number),
        Value::Float(number) => serde_json::Number::from_f64(*number)
            .map(Json::Number)
            .ok_or_else(|| ScriptError::value_error("Out of range float values are not JSON compliant"))?,
        Value::Str(text) => Json::String(text.clone()),
        Value::List(items) => Json::Array(
            items
                .borrow()
                .iter()
                .map(value_to_json)
                .collect::<ScriptResult<_>>()?,
        ),
        Value::Tuple(items) => Json::Array(items.iter().map(value_to_json).collect::<ScriptResult<_>>()?),
        Value::Dict(entries) => Json::Object(
            entries
                .borrow()
                .iter()
                .map(|(key, item)| Ok((key.clone(), value_to_json(item)?)))
                .collect::<ScriptResult<_>>()?,
        ),
        other => {
            return Err(ScriptError::type_error(format!(
                "Object of type {} is not JSON serializable",
                other.type_name()
            )));
        }
    })
}

fn json_to_value(json: serde_json::Value) -> Value {
    use serde_json::Value as Json;
    match json {
        Json::Null => Value::None,
        Json::Bool(flag) => Value::Bool(flag),
        Json::Number(number) => match number.as_i64() {
            Some(int) => Value::Int(int),
            None => Value::Float(number.as_f64().unwrap_or(f64::NAN)),
        },
        Json::String(text) => Value::Str(text),
        Json::Array(items) => Value::list(items.into_iter().map(json_to_value).collect()),
        Json::Object(entries) => Value::dict(
            entries
                .into_iter()
                .map(|(key, item)| (key, json_to_value(item)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::super::interp::BufferHost;
    use super::super::value::Namespace;
    use super::*;

    fn eval(source: &str) -> (Namespace, BufferHost) {
        let mut globals = Namespace::new();
        let mut host = BufferHost::default();
        Interpreter::new(&mut globals, &mut host)
            .run_source(source)
            .expect("run");
        (globals, host)
    }

    fn repr_of(globals: &Namespace, name: &str) -> String {
        globals.get(name).map(Value::repr).unwrap_or_default()
    }

    #[test]
    fn print_honours_sep_and_end() {
        let (_, host) = eval("print('a', 1, None, sep='-', end='!')\neprint('oops')");
        assert_eq!(host.stdout(), "a-1-None!");
        assert_eq!(host.stderr(), "oops\n");
    }

    #[test]
    fn display_emits_mime_bundles() {
        let (_, host) = eval("display(html('<b>x</b>'), 42)");
        assert_eq!(host.events.len(), 2);
        let OutputEvent::Display { data, .. } = &host.events[0] else {
            panic!("expected display event");
        };
        assert_eq!(data.get("text/html").map(String::as_str), Some("<b>x</b>"));
        let OutputEvent::Display { data, .. } = &host.events[1] else {
            panic!("expected display event");
        };
        assert_eq!(data.get("text/plain").map(String::as_str), Some("42"));
    }

    #[test]
    fn collection_builtins() {
        let source = "\
a = sorted([3, 1, 2], reverse=True)
b = sum(range(5))
c = max([4, 9, 2])
d = len({'x': 1, 'y': 2})
e = ','.join(['p', 'q'])
f = 'a b  c'.split()
g = dict([('k', 1)], z=2)
h = round(2.5)
i = round(3.14159, 2)
";
        let (globals, _) = eval(source);
        assert_eq!(repr_of(&globals, "a"), "[3, 2, 1]");
        assert_eq!(repr_of(&globals, "b"), "10");
        assert_eq!(repr_of(&globals, "c"), "9");
        assert_eq!(repr_of(&globals, "d"), "2");
        assert_eq!(repr_of(&globals, "e"), "'p,q'");
        assert_eq!(repr_of(&globals, "f"), "['a', 'b', 'c']");
        assert_eq!(repr_of(&globals, "g"), "{'k': 1, 'z': 2}");
        assert_eq!(repr_of(&globals, "h"), "2");
        assert_eq!(repr_of(&globals, "i"), "3.14");
    }

    #[test]
    fn modules_and_json() {
        let source = "\
import math
import json as j
r = math.sqrt(16)
s = j.dumps({'a': [1, 2.5, None]})
t = j.loads('{\"k\": [true, 3]}')
";
        let (globals, _) = eval(source);
        assert_eq!(repr_of(&globals, "r"), "4.0");
        assert_eq!(repr_of(&globals, "s"), "'{\"a\":[1,2.5,null]}'");
        assert_eq!(repr_of(&globals, "t"), "{'k': [True, 3]}");
    }

    #[test]
    fn format_fills_positional_fields() {
        let (globals, _) = eval("s = '{} + {} = {2}'.format(1, 2, 3)");
        assert_eq!(repr_of(&globals, "s"), "'1 + 2 = 3'");
    }

    #[test]
    fn next_raises_stop_iteration_when_exhausted() {
        let mut globals = Namespace::new();
        let mut host = BufferHost::default();
        let err = Interpreter::new(&mut globals, &mut host)
            .run_source("it = iter([1])\nnext(it)\nnext(it)\n")
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::StopIteration);
    }

    #[test]
    fn builtin_lookup_covers_module_functions() {
        assert!(matches!(lookup("math.sqrt"), Some(Value::Builtin("math.sqrt"))));
        assert!(lookup("open").is_none());
        assert!(is_builtin_binding("print", &Value::Builtin("print")));
        assert!(!is_builtin_binding("p", &Value::Builtin("print")));
    }

    #[test]
    fn range_bounds_do_not_overflow() {
        let mut globals = Namespace::new();
        let mut host = BufferHost::default();
        for source in [
            "range(-9223372036854775807, 9223372036854775807, 2)",
            "range(9223372036854775807, -9223372036854775807, -1)",
            "range(0, 9223372036854775807)",
        ] {
            let err = Interpreter::new(&mut globals, &mut host)
                .run_source(source)
                .expect_err(source);
            assert_eq!(err.kind, ErrorKind::Value, "{source}");
        }

        let (globals, _) = eval(
            "a = range(9223372036854775805, 9223372036854775807)\nb = range(5, 0, -2)\nc = range(3, 3)\nd = range(10, 0, -9223372036854775807 - 1)\n",
        );
        assert_eq!(
            repr_of(&globals, "a"),
            "[9223372036854775805, 9223372036854775806]"
        );
        assert_eq!(repr_of(&globals, "b"), "[5, 3, 1]");
        assert_eq!(repr_of(&globals, "c"), "[]");
        assert_eq!(repr_of(&globals, "d"), "[10]");
    }
}
