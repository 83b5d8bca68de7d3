use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use super::ast::{BinOp, CmpOp, Expr, FunctionDef, LogicalOp, Stmt, StmtKind, Target, UnaryOp};
use super::builtins;
use super::error::{ErrorKind, ScriptError, ScriptResult};
use super::parser::parse;
use super::value::{Function, ModuleKind, Namespace, Value};
use crate::protocol::OutputEvent;

pub const CELL_SCOPE: &str = "<cell>";
pub const DEFAULT_MAX_DEPTH: usize = 100;
/// Upper bound on items produced by `range` and sequence repetition.
pub const MAX_SEQUENCE_LEN: usize = 10_000_000;

/// Where a running cell sends its output.
pub trait Host {
    fn emit(&mut self, event: OutputEvent);

    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Collects events in memory; used by tests and foreground helpers.
#[derive(Debug, Default)]
pub struct BufferHost {
    pub events: Vec<OutputEvent>,
}

impl Host for BufferHost {
    fn emit(&mut self, event: OutputEvent) {
        self.events.push(event);
    }

    fn sleep(&mut self, _duration: Duration) {}
}

impl BufferHost {
    pub fn stdout(&self) -> String {
        self.text_of(|event| match event {
            OutputEvent::Stdout { text } => Some(text),
            _ => None,
        })
    }

    pub fn stderr(&self) -> String {
        self.text_of(|event| match event {
            OutputEvent::Stderr { text } => Some(text),
            _ => None,
        })
    }

    fn text_of(&self, pick: impl Fn(&OutputEvent) -> Option<&String>) -> String {
        self.events.iter().filter_map(pick).map(String::as_str).collect()
    }
}

enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

struct Frame {
    function: Rc<Function>,
    locals: Namespace,
    global_names: Vec<String>,
}

enum IterSource {
    Items(std::vec::IntoIter<Value>),
    Shared(Rc<RefCell<VecDeque<Value>>>),
}

impl Iterator for IterSource {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        match self {
            IterSource::Items(items) => items.next(),
            IterSource::Shared(state) => state.borrow_mut().pop_front(),
        }
    }
}

/// Tree-walking evaluator over a caller-owned global namespace.
///
/// Bindings land in `globals` as each statement completes, so a failure
/// part-way through a cell leaves everything bound before it in place.
pub struct Interpreter<'a> {
    globals: &'a mut Namespace,
    host: &'a mut dyn Host,
    frames: Vec<Frame>,
    max_depth: usize,
}

impl<'a> Interpreter<'a> {
    pub fn new(globals: &'a mut Namespace, host: &'a mut dyn Host) -> Self {
        Self {
            globals,
            host,
            frames: Vec::new(),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn run_source(&mut self, source: &str) -> ScriptResult<()> {
        let program = parse(source).map_err(|err| err.leave_scope(CELL_SCOPE, 1))?;
        self.run(&program)
    }

    /// Runs a cell and echoes the value of a trailing expression, like a REPL.
    pub fn run_interactive(&mut self, source: &str) -> ScriptResult<()> {
        let program = parse(source).map_err(|err| err.leave_scope(CELL_SCOPE, 1))?;
        let Some((last, head)) = program.split_last() else {
            return Ok(());
        };
        let StmtKind::Expr(expr) = &last.kind else {
            return self.run(&program);
        };
        self.run(head)?;
        let value = self
            .eval(expr)
            .map_err(|err| err.at_line(last.line).leave_scope(CELL_SCOPE, 1))?;
        if !matches!(value, Value::None) {
            self.emit(OutputEvent::stdout(format!("{}\n", value.repr())));
        }
        Ok(())
    }

    pub fn run(&mut self, program: &[Stmt]) -> ScriptResult<()> {
        match self.exec_block(program) {
            Ok(Flow::Normal) => Ok(()),
            Ok(Flow::Return(_)) => Err(ScriptError::new(
                ErrorKind::Syntax,
                "'return' outside function",
            )
            .leave_scope(CELL_SCOPE, 1)),
            Ok(Flow::Break | Flow::Continue) => Err(ScriptError::new(
                ErrorKind::Syntax,
                "'break' or 'continue' outside loop",
            )
            .leave_scope(CELL_SCOPE, 1)),
            Err(err) => Err(err.leave_scope(CELL_SCOPE, 1)),
        }
    }

    pub(crate) fn emit(&mut self, event: OutputEvent) {
        self.host.emit(event);
    }

    pub(crate) fn sleep(&mut self, duration: Duration) {
        self.host.sleep(duration);
    }

    fn exec_block(&mut self, body: &[Stmt]) -> ScriptResult<Flow> {
        for stmt in body {
            let flow = self.exec_stmt(stmt).map_err(|err| err.at_line(stmt.line))?;
            if !matches!(flow, Flow::Normal) {
                return Ok(flow);
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> ScriptResult<Flow> {
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.eval(expr)?;
            }
            StmtKind::Assign { target, value } => {
                let value = self.eval(value)?;
                self.assign(target, value)?;
            }
            StmtKind::AugAssign { target, op, value } => self.aug_assign(target, *op, value)?,
            StmtKind::If { branches, orelse } => {
                for (cond, body) in branches {
                    if self.eval(cond)?.truthy() {
                        return self.exec_block(body);
                    }
                }
                return self.exec_block(orelse);
            }
            StmtKind::While { cond, body } => {
                while self.eval(cond)?.truthy() {
                    match self.exec_block(body)? {
                        Flow::Break => break,
                        Flow::Normal | Flow::Continue => {}
                        flow @ Flow::Return(_) => return Ok(flow),
                    }
                }
            }
            StmtKind::For { target, iter, body } => {
                let iterable = self.eval(iter)?;
                for item in self.iter_source(&iterable)? {
                    self.assign(target, item)?;
                    match self.exec_block(body)? {
                        Flow::Break => break,
                        Flow::Normal | Flow::Continue => {}
                        flow @ Flow::Return(_) => return Ok(flow),
                    }
                }
            }
            StmtKind::Def(def) => {
                let function = self.make_function(def)?;
                self.bind(def.name.clone(), function);
            }
            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr)?,
                    None => Value::None,
                };
                return Ok(Flow::Return(value));
            }
            StmtKind::Pass => {}
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
            StmtKind::Import { module, alias } => {
                let Some(kind) = ModuleKind::from_name(module) else {
                    return Err(ScriptError::new(
                        ErrorKind::Import,
                        format!("No module named '{module}'"),
                    ));
                };
                let name = alias.clone().unwrap_or_else(|| module.clone());
                self.bind(name, Value::Module(kind));
            }
            StmtKind::Raise(value) => {
                let Some(expr) = value else {
                    return Err(ScriptError::new(
                        ErrorKind::Runtime,
                        "No active exception to reraise",
                    ));
                };
                return Err(match self.eval(expr)? {
                    Value::Str(message) => ScriptError::new(ErrorKind::Runtime, message),
                    Value::Exception(exc) => ScriptError::new(exc.kind, exc.message.clone()),
                    other => ScriptError::type_error(format!(
                        "exceptions must be str or exception values, not {}",
                        other.type_name()
                    )),
                });
            }
            StmtKind::Assert { test, message } => {
                if !self.eval(test)?.truthy() {
                    let message = match message {
                        Some(expr) => self.eval(expr)?.to_display_string(),
                        None => String::new(),
                    };
                    return Err(ScriptError::new(ErrorKind::Assertion, message));
                }
            }
            StmtKind::Del(names) => {
                for name in names {
                    self.unbind(name)?;
                }
            }
            StmtKind::Global(names) => {
                if let Some(frame) = self.frames.last_mut() {
                    frame.global_names.extend(names.iter().cloned());
                }
            }
        }
        Ok(Flow::Normal)
    }

    fn lookup(&self, name: &str) -> ScriptResult<Value> {
        if let Some(frame) = self.frames.last()
            && !frame.global_names.iter().any(|declared| declared == name)
        {
            if let Some(value) = frame.locals.get(name) {
                return Ok(value.clone());
            }
            if let Some(value) = frame.function.captured.get(name) {
                return Ok(value.clone());
            }
        }
        if let Some(value) = self.globals.get(name) {
            return Ok(value.clone());
        }
        builtins::lookup(name).ok_or_else(|| {
            ScriptError::new(ErrorKind::Name, format!("name '{name}' is not defined"))
        })
    }

    fn bind(&mut self, name: String, value: Value) {
        match self.frames.last_mut() {
            Some(frame) if !frame.global_names.contains(&name) => {
                frame.locals.insert(name, value);
            }
            _ => {
                self.globals.insert(name, value);
            }
        }
    }

    fn unbind(&mut self, name: &str) -> ScriptResult<()> {
        let removed = match self.frames.last_mut() {
            Some(frame) if !frame.global_names.iter().any(|declared| declared == name) => {
                frame.locals.remove(name)
            }
            _ => self.globals.remove(name),
        };
        match removed {
            Some(_) => Ok(()),
            None => Err(ScriptError::new(
                ErrorKind::Name,
                format!("name '{name}' is not defined"),
            )),
        }
    }

    fn assign(&mut self, target: &Target, value: Value) -> ScriptResult<()> {
        match target {
            Target::Name(name) => {
                self.bind(name.clone(), value);
                Ok(())
            }
            Target::Index { value: container, index } => {
                let container = self.eval(container)?;
                let index = self.eval(index)?;
                set_item(&container, index, value)
            }
            Target::Tuple(targets) => {
                let items = self.iterate_all(&value)?;
                if items.len() < targets.len() {
                    return Err(ScriptError::value_error(format!(
                        "not enough values to unpack (expected {}, got {})",
                        targets.len(),
                        items.len()
                    )));
                }
                if items.len() > targets.len() {
                    return Err(ScriptError::value_error(format!(
                        "too many values to unpack (expected {})",
                        targets.len()
                    )));
                }
                for (target, item) in targets.iter().zip(items) {
                    self.assign(target, item)?;
                }
                Ok(())
            }
        }
    }

    fn aug_assign(&mut self, target: &Target, op: BinOp, value: &Expr) -> ScriptResult<()> {
        match target {
            Target::Name(name) => {
                let current = self.lookup(name)?;
                let rhs = self.eval(value)?;
                if let (BinOp::Add, Value::List(items)) = (op, &current) {
                    let extra = self.iterate_all(&rhs)?;
                    items.borrow_mut().extend(extra);
                    return Ok(());
                }
                let updated = binary_op(op, &current, &rhs)?;
                self.bind(name.clone(), updated);
                Ok(())
            }
            Target::Index { value: container, index } => {
                let container = self.eval(container)?;
                let index = self.eval(index)?;
                let current = get_item(&container, &index)?;
                let rhs = self.eval(value)?;
                let updated = binary_op(op, &current, &rhs)?;
                set_item(&container, index, updated)
            }
            Target::Tuple(_) => Err(ScriptError::new(
                ErrorKind::Syntax,
                "illegal expression for augmented assignment",
            )),
        }
    }

    fn make_function(&mut self, def: &FunctionDef) -> ScriptResult<Value> {
        let mut defaults = Vec::with_capacity(def.params.len());
        for param in &def.params {
            let slot = match &param.default {
                Some(expr) => Some(self.eval(expr)?),
                None => None,
            };
            defaults.push(slot);
        }
        let captured = match self.frames.last() {
            Some(frame) => {
                let mut captured = frame.function.captured.clone();
                captured.extend(
                    frame
                        .locals
                        .iter()
                        .map(|(name, value)| (name.clone(), value.clone())),
                );
                captured
            }
            None => Namespace::new(),
        };
        Ok(Value::Function(Rc::new(Function {
            def: def.clone(),
            defaults,
            captured,
        })))
    }

    pub(crate) fn eval(&mut self, expr: &Expr) -> ScriptResult<Value> {
        match expr {
            Expr::None => Ok(Value::None),
            Expr::Bool(flag) => Ok(Value::Bool(*flag)),
            Expr::Int(number) => Ok(Value::Int(*number)),
            Expr::Float(number) => Ok(Value::Float(*number)),
            Expr::Str(text) => Ok(Value::Str(text.clone())),
            Expr::Name(name) => self.lookup(name),
            Expr::List(items) => {
                let items = self.eval_all(items)?;
                Ok(Value::list(items))
            }
            Expr::Tuple(items) => {
                let items = self.eval_all(items)?;
                Ok(Value::tuple(items))
            }
            Expr::Dict(entries) => {
                let mut map = BTreeMap::new();
                for (key, value) in entries {
                    let key = match self.eval(key)? {
                        Value::Str(key) => key,
                        other => {
                            return Err(ScriptError::type_error(format!(
                                "dict keys must be str, not {}",
                                other.type_name()
                            )));
                        }
                    };
                    let value = self.eval(value)?;
                    map.insert(key, value);
                }
                Ok(Value::dict(map))
            }
            Expr::Unary { op, operand } => {
                let operand = self.eval(operand)?;
                unary_op(*op, &operand)
            }
            Expr::Binary { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                binary_op(*op, &left, &right)
            }
            Expr::Compare { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                compare_op(*op, &left, &right).map(Value::Bool)
            }
            Expr::Logical { op, left, right } => {
                let left = self.eval(left)?;
                match (op, left.truthy()) {
                    (LogicalOp::And, false) | (LogicalOp::Or, true) => Ok(left),
                    _ => self.eval(right),
                }
            }
            Expr::Call { func, args, kwargs } => {
                let callee = match func.as_ref() {
                    Expr::Attribute { value, name } => {
                        let receiver = self.eval(value)?;
                        if !matches!(receiver, Value::Module(_)) {
                            let args = self.eval_all(args)?;
                            let kwargs = self.eval_kwargs(kwargs)?;
                            return builtins::call_method(self, &receiver, name, args, kwargs);
                        }
                        get_attribute(&receiver, name)?
                    }
                    other => self.eval(other)?,
                };
                let args = self.eval_all(args)?;
                let kwargs = self.eval_kwargs(kwargs)?;
                self.call_value(&callee, args, kwargs)
            }
            Expr::Attribute { value, name } => {
                let receiver = self.eval(value)?;
                get_attribute(&receiver, name)
            }
            Expr::Index { value, index } => {
                let container = self.eval(value)?;
                let index = self.eval(index)?;
                get_item(&container, &index)
            }
            Expr::Lambda(def) => self.make_function(def),
        }
    }

    fn eval_all(&mut self, exprs: &[Expr]) -> ScriptResult<Vec<Value>> {
        exprs.iter().map(|expr| self.eval(expr)).collect()
    }

    fn eval_kwargs(&mut self, kwargs: &[(String, Expr)]) -> ScriptResult<Vec<(String, Value)>> {
        kwargs
            .iter()
            .map(|(name, expr)| Ok((name.clone(), self.eval(expr)?)))
            .collect()
    }

    pub(crate) fn call_value(
        &mut self,
        callee: &Value,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> ScriptResult<Value> {
        match callee {
            Value::Function(function) => self.call_function(function.clone(), args, kwargs),
            Value::Builtin(name) => builtins::call(self, name, args, kwargs),
            Value::Method(method) => {
                builtins::call_method(self, &method.receiver, &method.name, args, kwargs)
            }
            other => Err(ScriptError::type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    fn call_function(
        &mut self,
        function: Rc<Function>,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> ScriptResult<Value> {
        if self.frames.len() >= self.max_depth {
            return Err(ScriptError::new(
                ErrorKind::Recursion,
                "maximum recursion depth exceeded",
            ));
        }
        let locals = bind_arguments(&function, args, kwargs)?;
        self.frames.push(Frame {
            function: function.clone(),
            locals,
            global_names: Vec::new(),
        });
        let result = self.exec_block(&function.def.body);
        self.frames.pop();
        let def = &function.def;
        match result {
            Ok(Flow::Return(value)) => Ok(value),
            Ok(Flow::Normal) => Ok(Value::None),
            Ok(Flow::Break | Flow::Continue) => Err(ScriptError::new(
                ErrorKind::Syntax,
                "'break' or 'continue' outside loop",
            )
            .leave_scope(&def.name, def.line)),
            Err(err) => Err(err.leave_scope(&def.name, def.line)),
        }
    }

    fn iter_source(&self, value: &Value) -> ScriptResult<IterSource> {
        match value {
            Value::Iterator(state) => Ok(IterSource::Shared(state.clone())),
            other => Ok(IterSource::Items(self.iterate_all(other)?.into_iter())),
        }
    }

    /// Materializes an iterable. Iterators are drained.
    pub(crate) fn iterate_all(&self, value: &Value) -> ScriptResult<Vec<Value>> {
        match value {
            Value::List(items) => Ok(items.borrow().clone()),
            Value::Tuple(items) => Ok(items.to_vec()),
            Value::Str(text) => Ok(text.chars().map(|ch| Value::Str(ch.to_string())).collect()),
            Value::Dict(entries) => Ok(entries
                .borrow()
                .keys()
                .map(|key| Value::Str(key.clone()))
                .collect()),
            Value::Iterator(state) => Ok(state.borrow_mut().drain(..).collect()),
            other => Err(ScriptError::type_error(format!(
                "'{}' object is not iterable",
                other.type_name()
            ))),
        }
    }
}

fn bind_arguments(
    function: &Function,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> ScriptResult<Namespace> {
    let def = &function.def;
    let params = &def.params;
    if args.len() > params.len() {
        return Err(ScriptError::type_error(format!(
            "{}() takes {} positional arguments but {} were given",
            def.name,
            params.len(),
            args.len()
        )));
    }
    let mut locals = Namespace::new();
    for (param, arg) in params.iter().zip(args) {
        locals.insert(param.name.clone(), arg);
    }
    for (name, value) in kwargs {
        if !params.iter().any(|param| param.name == name) {
            return Err(ScriptError::type_error(format!(
                "{}() got an unexpected keyword argument '{name}'",
                def.name
            )));
        }
        if locals.contains_key(&name) {
            return Err(ScriptError::type_error(format!(
                "{}() got multiple values for argument '{name}'",
                def.name
            )));
        }
        locals.insert(name, value);
    }
    for (param, default) in params.iter().zip(&function.defaults) {
        if locals.contains_key(&param.name) {
            continue;
        }
        match default {
            Some(value) => {
                locals.insert(param.name.clone(), value.clone());
            }
            None => {
                return Err(ScriptError::type_error(format!(
                    "{}() missing required argument: '{}'",
                    def.name, param.name
                )));
            }
        }
    }
    Ok(locals)
}

fn get_attribute(receiver: &Value, name: &str) -> ScriptResult<Value> {
    if let Value::Module(kind) = receiver {
        return builtins::module_attr(*kind, name);
    }
    if builtins::has_method(receiver, name) {
        return Ok(Value::Method(Rc::new(super::value::BoundMethod {
            receiver: receiver.clone(),
            name: name.to_string(),
        })));
    }
    Err(ScriptError::new(
        ErrorKind::Attribute,
        format!("'{}' object has no attribute '{name}'", receiver.type_name()),
    ))
}

fn normalize_index(index: &Value, len: usize, what: &str) -> ScriptResult<usize> {
    let Some(raw) = index.as_int() else {
        return Err(ScriptError::type_error(format!(
            "{what} indices must be integers, not {}",
            index.type_name()
        )));
    };
    let len = len as i64;
    let resolved = if raw < 0 { raw + len } else { raw };
    if resolved < 0 || resolved >= len {
        return Err(ScriptError::new(
            ErrorKind::Index,
            format!("{what} index out of range"),
        ));
    }
    Ok(resolved as usize)
}

pub(crate) fn get_item(container: &Value, index: &Value) -> ScriptResult<Value> {
    match container {
        Value::List(items) => {
            let items = items.borrow();
            let at = normalize_index(index, items.len(), "list")?;
            Ok(items[at].clone())
        }
        Value::Tuple(items) => {
            let at = normalize_index(index, items.len(), "tuple")?;
            Ok(items[at].clone())
        }
        Value::Str(text) => {
            let chars: Vec<char> = text.chars().collect();
            let at = normalize_index(index, chars.len(), "string")?;
            Ok(Value::Str(chars[at].to_string()))
        }
        Value::Dict(entries) => {
            let found = match index {
                Value::Str(key) => entries.borrow().get(key).cloned(),
                _ => None,
            };
            found.ok_or_else(|| ScriptError::new(ErrorKind::Key, index.repr()))
        }
        other => Err(ScriptError::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

fn set_item(container: &Value, index: Value, value: Value) -> ScriptResult<()> {
    match container {
        Value::List(items) => {
            let mut items = items.borrow_mut();
            let at = normalize_index(&index, items.len(), "list assignment")?;
            items[at] = value;
            Ok(())
        }
        Value::Dict(entries) => match index {
            Value::Str(key) => {
                entries.borrow_mut().insert(key, value);
                Ok(())
            }
            other => Err(ScriptError::type_error(format!(
                "dict keys must be str, not {}",
                other.type_name()
            ))),
        },
        other => Err(ScriptError::type_error(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        ))),
    }
}

fn unary_op(op: UnaryOp, operand: &Value) -> ScriptResult<Value> {
    match op {
        UnaryOp::Not => Ok(Value::Bool(!operand.truthy())),
        UnaryOp::Neg => match operand {
            Value::Float(number) => Ok(Value::Float(-number)),
            Value::Int(_) | Value::Bool(_) => {
                let number = operand.as_int().unwrap_or_default();
                number
                    .checked_neg()
                    .map(Value::Int)
                    .ok_or_else(overflow)
            }
            other => Err(ScriptError::type_error(format!(
                "bad operand type for unary -: '{}'",
                other.type_name()
            ))),
        },
    }
}

#[derive(Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

fn as_num(value: &Value) -> Option<Num> {
    match value {
        Value::Int(number) => Some(Num::Int(*number)),
        Value::Bool(flag) => Some(Num::Int(i64::from(*flag))),
        Value::Float(number) => Some(Num::Float(*number)),
        _ => None,
    }
}

fn overflow() -> ScriptError {
    ScriptError::new(ErrorKind::Overflow, "integer overflow")
}

/// Length of `len` repeated `count` times, bounded by [`MAX_SEQUENCE_LEN`].
fn repeated_len(len: usize, count: usize) -> ScriptResult<usize> {
    match len.checked_mul(count) {
        Some(total) if total <= MAX_SEQUENCE_LEN => Ok(total),
        _ => Err(ScriptError::new(
            ErrorKind::Overflow,
            format!("repeated sequence would exceed {MAX_SEQUENCE_LEN} items"),
        )),
    }
}

fn zero_division(what: &str) -> ScriptError {
    ScriptError::new(ErrorKind::ZeroDivision, what.to_string())
}

pub(crate) fn binary_op(op: BinOp, left: &Value, right: &Value) -> ScriptResult<Value> {
    if let (Some(a), Some(b)) = (as_num(left), as_num(right)) {
        return numeric_op(op, a, b);
    }
    match (op, left, right) {
        (BinOp::Add, Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{a}{b}"))),
        (BinOp::Add, Value::List(a), Value::List(b)) => {
            let mut items = a.borrow().clone();
            items.extend(b.borrow().iter().cloned());
            Ok(Value::list(items))
        }
        (BinOp::Add, Value::Tuple(a), Value::Tuple(b)) => {
            let mut items = a.to_vec();
            items.extend(b.iter().cloned());
            Ok(Value::tuple(items))
        }
        (BinOp::Mul, Value::Str(text), count) | (BinOp::Mul, count, Value::Str(text))
            if count.as_int().is_some() =>
        {
            let count = count.as_int().unwrap_or_default().max(0) as usize;
            repeated_len(text.len(), count)?;
            Ok(Value::Str(text.repeat(count)))
        }
        (BinOp::Mul, Value::List(items), count) | (BinOp::Mul, count, Value::List(items))
            if count.as_int().is_some() =>
        {
            let count = count.as_int().unwrap_or_default().max(0) as usize;
            let items = items.borrow();
            let mut out = Vec::with_capacity(repeated_len(items.len(), count)?);
            for _ in 0..count {
                out.extend(items.iter().cloned());
            }
            Ok(Value::list(out))
        }
        _ => Err(ScriptError::type_error(format!(
            "unsupported operand type(s) for {}: '{}' and '{}'",
            op.symbol(),
            left.type_name(),
            right.type_name()
        ))),
    }
}

fn numeric_op(op: BinOp, a: Num, b: Num) -> ScriptResult<Value> {
    if let (Num::Int(a), Num::Int(b)) = (a, b) {
        return int_op(op, a, b);
    }
    let a = match a {
        Num::Int(number) => number as f64,
        Num::Float(number) => number,
    };
    let b = match b {
        Num::Int(number) => number as f64,
        Num::Float(number) => number,
    };
    let result = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return Err(zero_division("float division by zero"));
            }
            a / b
        }
        BinOp::FloorDiv => {
            if b == 0.0 {
                return Err(zero_division("float floor division by zero"));
            }
            (a / b).floor()
        }
        BinOp::Mod => {
            if b == 0.0 {
                return Err(zero_division("float modulo"));
            }
            a - b * (a / b).floor()
        }
        BinOp::Pow => a.powf(b),
    };
    Ok(Value::Float(result))
}

fn int_op(op: BinOp, a: i64, b: i64) -> ScriptResult<Value> {
    let result = match op {
        BinOp::Add => a.checked_add(b),
        BinOp::Sub => a.checked_sub(b),
        BinOp::Mul => a.checked_mul(b),
        BinOp::Div => {
            if b == 0 {
                return Err(zero_division("division by zero"));
            }
            return Ok(Value::Float(a as f64 / b as f64));
        }
        BinOp::FloorDiv => {
            if b == 0 {
                return Err(zero_division("integer division or modulo by zero"));
            }
            a.checked_div(b).map(|quotient| {
                if a % b != 0 && ((a < 0) != (b < 0)) {
                    quotient - 1
                } else {
                    quotient
                }
            })
        }
        BinOp::Mod => {
            if b == 0 {
                return Err(zero_division("integer division or modulo by zero"));
            }
            a.checked_rem(b).map(|rem| {
                if rem != 0 && ((rem < 0) != (b < 0)) {
                    rem + b
                } else {
                    rem
                }
            })
        }
        BinOp::Pow => {
            if b < 0 {
                return Ok(Value::Float((a as f64).powf(b as f64)));
            }
            u32::try_from(b).ok().and_then(|exp| a.checked_pow(exp))
        }
    };
    result.map(Value::Int).ok_or_else(overflow)
}

fn compare_op(op: CmpOp, left: &Value, right: &Value) -> ScriptResult<bool> {
    use std::cmp::Ordering;
    match op {
        CmpOp::Eq => Ok(left.py_eq(right)),
        CmpOp::NotEq => Ok(!left.py_eq(right)),
        CmpOp::Lt => Ok(left.compare(right)? == Ordering::Less),
        CmpOp::LtE => Ok(left.compare(right)? != Ordering::Greater),
        CmpOp::Gt => Ok(left.compare(right)? == Ordering::Greater),
        CmpOp::GtE => Ok(left.compare(right)? != Ordering::Less),
        CmpOp::In => contains(right, left),
        CmpOp::NotIn => contains(right, left).map(|found| !found),
    }
}

fn contains(container: &Value, item: &Value) -> ScriptResult<bool> {
    match container {
        Value::Str(text) => match item {
            Value::Str(needle) => Ok(text.contains(needle.as_str())),
            other => Err(ScriptError::type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::List(items) => Ok(items.borrow().iter().any(|candidate| candidate.py_eq(item))),
        Value::Tuple(items) => Ok(items.iter().any(|candidate| candidate.py_eq(item))),
        Value::Dict(entries) => Ok(match item {
            Value::Str(key) => entries.borrow().contains_key(key),
            _ => false,
        }),
        other => Err(ScriptError::type_error(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}
