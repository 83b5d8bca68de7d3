use super::ast::{
    BinOp, CmpOp, Expr, FunctionDef, LogicalOp, Param, Stmt, StmtKind, Target, UnaryOp,
};
use super::error::{ScriptError, ScriptResult};
use super::lexer::{Tok, Token, tokenize};

const KEYWORDS: &[&str] = &[
    "if", "elif", "else", "while", "for", "in", "def", "return", "pass", "break", "continue",
    "import", "as", "raise", "assert", "lambda", "and", "or", "not", "True", "False", "None",
    "del", "global",
];

pub fn parse(source: &str) -> ScriptResult<Vec<Stmt>> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let mut program = Vec::new();
    parser.skip_newlines();
    while !parser.at(&Tok::Eof) {
        program.extend(parser.statement()?);
        parser.skip_newlines();
    }
    Ok(program)
}

pub fn is_keyword(name: &str) -> bool {
    KEYWORDS.contains(&name)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Tok {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].tok
    }

    fn peek_at(&self, offset: usize) -> &Tok {
        &self.tokens[(self.pos + offset).min(self.tokens.len() - 1)].tok
    }

    fn line(&self) -> u32 {
        self.tokens[self.pos.min(self.tokens.len() - 1)].line
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn at(&self, tok: &Tok) -> bool {
        self.peek() == tok
    }

    fn at_op(&self, op: &str) -> bool {
        matches!(self.peek(), Tok::Op(found) if *found == op)
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Tok::Name(name) if name == keyword)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.at_op(op) {
            self.advance();
            return true;
        }
        false
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.at_keyword(keyword) {
            self.advance();
            return true;
        }
        false
    }

    fn expect_op(&mut self, op: &str) -> ScriptResult<()> {
        if self.eat_op(op) {
            return Ok(());
        }
        Err(self.unexpected(&format!("expected '{op}'")))
    }

    fn expect_keyword(&mut self, keyword: &str) -> ScriptResult<()> {
        if self.eat_keyword(keyword) {
            return Ok(());
        }
        Err(self.unexpected(&format!("expected '{keyword}'")))
    }

    fn identifier(&mut self) -> ScriptResult<String> {
        match self.peek().clone() {
            Tok::Name(name) if !is_keyword(&name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected("expected a name")),
        }
    }

    fn unexpected(&self, context: &str) -> ScriptError {
        let found = match self.peek() {
            Tok::Name(name) => format!("'{name}'"),
            Tok::Int(value) => value.to_string(),
            Tok::Float(value) => value.to_string(),
            Tok::Str(_) => "string literal".to_string(),
            Tok::Op(op) => format!("'{op}'"),
            Tok::Newline => "end of line".to_string(),
            Tok::Indent => "indent".to_string(),
            Tok::Dedent => "dedent".to_string(),
            Tok::Eof => "end of input".to_string(),
        };
        ScriptError::syntax(self.line(), format!("invalid syntax: {context}, found {found}"))
    }

    fn skip_newlines(&mut self) {
        while self.at(&Tok::Newline) {
            self.advance();
        }
    }

    fn statement(&mut self) -> ScriptResult<Vec<Stmt>> {
        let line = self.line();
        let keyword = match self.peek() {
            Tok::Name(name) => name.clone(),
            _ => String::new(),
        };
        let compound = match keyword.as_str() {
            "if" => Some(self.if_statement()?),
            "while" => Some(self.while_statement()?),
            "for" => Some(self.for_statement()?),
            "def" => Some(self.def_statement()?),
            _ => None,
        };
        if let Some(kind) = compound {
            return Ok(vec![Stmt { line, kind }]);
        }
        self.simple_line()
    }

    /// Parses `stmt (; stmt)* NEWLINE`.
    fn simple_line(&mut self) -> ScriptResult<Vec<Stmt>> {
        let mut stmts = Vec::new();
        loop {
            let line = self.line();
            let kind = self.simple_statement()?;
            stmts.push(Stmt { line, kind });
            if !self.eat_op(";") {
                break;
            }
            if self.at(&Tok::Newline) || self.at(&Tok::Eof) {
                break;
            }
        }
        if !self.at(&Tok::Eof) && !self.at(&Tok::Dedent) {
            if !self.at(&Tok::Newline) {
                return Err(self.unexpected("expected end of statement"));
            }
            self.advance();
        }
        Ok(stmts)
    }

    fn simple_statement(&mut self) -> ScriptResult<StmtKind> {
        if let Tok::Name(name) = self.peek().clone() {
            match name.as_str() {
                "pass" => {
                    self.advance();
                    return Ok(StmtKind::Pass);
                }
                "break" => {
                    self.advance();
                    return Ok(StmtKind::Break);
                }
                "continue" => {
                    self.advance();
                    return Ok(StmtKind::Continue);
                }
                "return" => {
                    self.advance();
                    if self.at_statement_end() {
                        return Ok(StmtKind::Return(None));
                    }
                    return Ok(StmtKind::Return(Some(self.expression_list()?)));
                }
                "raise" => {
                    self.advance();
                    if self.at_statement_end() {
                        return Ok(StmtKind::Raise(None));
                    }
                    return Ok(StmtKind::Raise(Some(self.expression()?)));
                }
                "assert" => {
                    self.advance();
                    let test = self.expression()?;
                    let message = if self.eat_op(",") {
                        Some(self.expression()?)
                    } else {
                        None
                    };
                    return Ok(StmtKind::Assert { test, message });
                }
                "import" => {
                    self.advance();
                    let mut module = self.identifier()?;
                    while self.eat_op(".") {
                        module.push('.');
                        module.push_str(&self.identifier()?);
                    }
                    let alias = if self.eat_keyword("as") {
                        Some(self.identifier()?)
                    } else {
                        None
                    };
                    return Ok(StmtKind::Import { module, alias });
                }
                "del" => {
                    self.advance();
                    return Ok(StmtKind::Del(self.name_list()?));
                }
                "global" => {
                    self.advance();
                    return Ok(StmtKind::Global(self.name_list()?));
                }
                _ => {}
            }
        }

        let expr = self.expression_list()?;
        if self.eat_op("=") {
            let target = to_target(expr, self.line())?;
            let value = self.expression_list()?;
            return Ok(StmtKind::Assign { target, value });
        }
        let aug = match self.peek() {
            Tok::Op("+=") => Some(BinOp::Add),
            Tok::Op("-=") => Some(BinOp::Sub),
            Tok::Op("*=") => Some(BinOp::Mul),
            Tok::Op("/=") => Some(BinOp::Div),
            Tok::Op("//=") => Some(BinOp::FloorDiv),
            Tok::Op("%=") => Some(BinOp::Mod),
            Tok::Op("**=") => Some(BinOp::Pow),
            _ => None,
        };
        if let Some(op) = aug {
            self.advance();
            let target = to_target(expr, self.line())?;
            if matches!(target, Target::Tuple(_)) {
                return Err(ScriptError::syntax(
                    self.line(),
                    "illegal expression for augmented assignment",
                ));
            }
            let value = self.expression_list()?;
            return Ok(StmtKind::AugAssign { target, op, value });
        }
        Ok(StmtKind::Expr(expr))
    }

    fn at_statement_end(&self) -> bool {
        matches!(self.peek(), Tok::Newline | Tok::Eof | Tok::Dedent | Tok::Op(";"))
    }

    fn name_list(&mut self) -> ScriptResult<Vec<String>> {
        let mut names = vec![self.identifier()?];
        while self.eat_op(",") {
            names.push(self.identifier()?);
        }
        Ok(names)
    }

    fn block(&mut self) -> ScriptResult<Vec<Stmt>> {
        self.expect_op(":")?;
        if !self.at(&Tok::Newline) {
            return self.simple_line();
        }
        self.advance();
        self.skip_newlines();
        if !self.at(&Tok::Indent) {
            return Err(self.unexpected("expected an indented block"));
        }
        self.advance();
        let mut body = Vec::new();
        loop {
            self.skip_newlines();
            if self.at(&Tok::Dedent) {
                self.advance();
                break;
            }
            if self.at(&Tok::Eof) {
                break;
            }
            body.extend(self.statement()?);
        }
        Ok(body)
    }

    fn if_statement(&mut self) -> ScriptResult<StmtKind> {
        self.expect_keyword("if")?;
        let mut branches = Vec::new();
        let cond = self.expression()?;
        branches.push((cond, self.block()?));
        let mut orelse = Vec::new();
        loop {
            self.skip_newlines();
            if self.eat_keyword("elif") {
                let cond = self.expression()?;
                branches.push((cond, self.block()?));
                continue;
            }
            if self.eat_keyword("else") {
                orelse = self.block()?;
            }
            break;
        }
        Ok(StmtKind::If { branches, orelse })
    }

    fn while_statement(&mut self) -> ScriptResult<StmtKind> {
        self.expect_keyword("while")?;
        let cond = self.expression()?;
        let body = self.block()?;
        Ok(StmtKind::While { cond, body })
    }

    fn for_statement(&mut self) -> ScriptResult<StmtKind> {
        self.expect_keyword("for")?;
        let line = self.line();
        let mut targets = vec![self.postfix()?];
        while self.eat_op(",") {
            targets.push(self.postfix()?);
        }
        let target = if targets.len() == 1 {
            to_target(targets.remove(0), line)?
        } else {
            to_target(Expr::Tuple(targets), line)?
        };
        self.expect_keyword("in")?;
        let iter = self.expression_list()?;
        let body = self.block()?;
        Ok(StmtKind::For { target, iter, body })
    }

    fn def_statement(&mut self) -> ScriptResult<StmtKind> {
        let line = self.line();
        self.expect_keyword("def")?;
        let name = self.identifier()?;
        self.expect_op("(")?;
        let params = self.params(")")?;
        self.expect_op(")")?;
        let body = self.block()?;
        Ok(StmtKind::Def(FunctionDef {
            name,
            params,
            body,
            line,
        }))
    }

    fn params(&mut self, close: &str) -> ScriptResult<Vec<Param>> {
        let mut params: Vec<Param> = Vec::new();
        while !self.at_op(close) {
            let name = self.identifier()?;
            if params.iter().any(|param| param.name == name) {
                return Err(ScriptError::syntax(
                    self.line(),
                    format!("duplicate argument '{name}' in function definition"),
                ));
            }
            let default = if self.eat_op("=") {
                Some(self.expression()?)
            } else {
                None
            };
            if default.is_none() && params.iter().any(|param| param.default.is_some()) {
                return Err(ScriptError::syntax(
                    self.line(),
                    "non-default argument follows default argument",
                ));
            }
            params.push(Param { name, default });
            if !self.eat_op(",") {
                break;
            }
        }
        Ok(params)
    }

    /// An expression, or a bare tuple when commas follow.
    fn expression_list(&mut self) -> ScriptResult<Expr> {
        let first = self.expression()?;
        if !self.at_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_statement_end() || self.at_op("=") || self.at_op(")") {
                break;
            }
            items.push(self.expression()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn expression(&mut self) -> ScriptResult<Expr> {
        if self.at_keyword("lambda") {
            return self.lambda();
        }
        self.or_expr()
    }

    fn lambda(&mut self) -> ScriptResult<Expr> {
        let line = self.line();
        self.expect_keyword("lambda")?;
        let params = self.params(":")?;
        self.expect_op(":")?;
        let body = self.expression()?;
        Ok(Expr::Lambda(Box::new(FunctionDef {
            name: "<lambda>".to_string(),
            params,
            body: vec![Stmt {
                line,
                kind: StmtKind::Return(Some(body)),
            }],
            line,
        })))
    }

    fn or_expr(&mut self) -> ScriptResult<Expr> {
        let mut left = self.and_expr()?;
        while self.eat_keyword("or") {
            let right = self.and_expr()?;
            left = Expr::Logical {
                op: LogicalOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> ScriptResult<Expr> {
        let mut left = self.not_expr()?;
        while self.eat_keyword("and") {
            let right = self.not_expr()?;
            left = Expr::Logical {
                op: LogicalOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> ScriptResult<Expr> {
        if self.eat_keyword("not") {
            let operand = self.not_expr()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.comparison()
    }

    fn comparison(&mut self) -> ScriptResult<Expr> {
        let left = self.arith()?;
        let op = match self.peek() {
            Tok::Op("==") => CmpOp::Eq,
            Tok::Op("!=") => CmpOp::NotEq,
            Tok::Op("<") => CmpOp::Lt,
            Tok::Op("<=") => CmpOp::LtE,
            Tok::Op(">") => CmpOp::Gt,
            Tok::Op(">=") => CmpOp::GtE,
            Tok::Name(name) if name == "in" => CmpOp::In,
            Tok::Name(name)
                if name == "not" && matches!(self.peek_at(1), Tok::Name(next) if next == "in") =>
            {
                CmpOp::NotIn
            }
            _ => return Ok(left),
        };
        if op == CmpOp::NotIn {
            self.advance();
        }
        self.advance();
        let right = self.arith()?;
        if matches!(
            self.peek(),
            Tok::Op("==" | "!=" | "<" | "<=" | ">" | ">=")
        ) {
            return Err(self.unexpected("chained comparisons are not supported"));
        }
        Ok(Expr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn arith(&mut self) -> ScriptResult<Expr> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Tok::Op("+") => BinOp::Add,
                Tok::Op("-") => BinOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.term()?;
            left = binary(op, left, right);
        }
    }

    fn term(&mut self) -> ScriptResult<Expr> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Tok::Op("*") => BinOp::Mul,
                Tok::Op("/") => BinOp::Div,
                Tok::Op("//") => BinOp::FloorDiv,
                Tok::Op("%") => BinOp::Mod,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.unary()?;
            left = binary(op, left, right);
        }
    }

    fn unary(&mut self) -> ScriptResult<Expr> {
        if self.eat_op("-") {
            let operand = self.unary()?;
            return Ok(match operand {
                Expr::Int(value) => Expr::Int(value.wrapping_neg()),
                Expr::Float(value) => Expr::Float(-value),
                other => Expr::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(other),
                },
            });
        }
        if self.eat_op("+") {
            return self.unary();
        }
        self.power()
    }

    fn power(&mut self) -> ScriptResult<Expr> {
        let base = self.postfix()?;
        if self.eat_op("**") {
            let exponent = self.unary()?;
            return Ok(binary(BinOp::Pow, base, exponent));
        }
        Ok(base)
    }

    fn postfix(&mut self) -> ScriptResult<Expr> {
        let mut expr = self.atom()?;
        loop {
            if self.eat_op("(") {
                let (args, kwargs) = self.call_args()?;
                expr = Expr::Call {
                    func: Box::new(expr),
                    args,
                    kwargs,
                };
            } else if self.eat_op("[") {
                let index = self.expression_list()?;
                self.expect_op("]")?;
                expr = Expr::Index {
                    value: Box::new(expr),
                    index: Box::new(index),
                };
            } else if self.eat_op(".") {
                let name = match self.advance() {
                    Tok::Name(name) => name,
                    _ => return Err(self.unexpected("expected an attribute name")),
                };
                expr = Expr::Attribute {
                    value: Box::new(expr),
                    name,
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn call_args(&mut self) -> ScriptResult<(Vec<Expr>, Vec<(String, Expr)>)> {
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();
        while !self.at_op(")") {
            let keyword = match (self.peek(), self.peek_at(1)) {
                (Tok::Name(name), Tok::Op("=")) if !is_keyword(name) => Some(name.clone()),
                _ => None,
            };
            if let Some(name) = keyword {
                self.advance();
                self.advance();
                if kwargs.iter().any(|(existing, _)| *existing == name) {
                    return Err(ScriptError::syntax(
                        self.line(),
                        format!("keyword argument repeated: {name}"),
                    ));
                }
                kwargs.push((name, self.expression()?));
            } else {
                if !kwargs.is_empty() {
                    return Err(ScriptError::syntax(
                        self.line(),
                        "positional argument follows keyword argument",
                    ));
                }
                args.push(self.expression()?);
            }
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        Ok((args, kwargs))
    }

    fn atom(&mut self) -> ScriptResult<Expr> {
        let tok = self.peek().clone();
        match tok {
            Tok::Int(value) => {
                self.advance();
                Ok(Expr::Int(value))
            }
            Tok::Float(value) => {
                self.advance();
                Ok(Expr::Float(value))
            }
            Tok::Str(mut text) => {
                self.advance();
                while let Tok::Str(next) = self.peek().clone() {
                    text.push_str(&next);
                    self.advance();
                }
                Ok(Expr::Str(text))
            }
            Tok::Name(name) => match name.as_str() {
                "True" => {
                    self.advance();
                    Ok(Expr::Bool(true))
                }
                "False" => {
                    self.advance();
                    Ok(Expr::Bool(false))
                }
                "None" => {
                    self.advance();
                    Ok(Expr::None)
                }
                _ if is_keyword(&name) => Err(self.unexpected("expected an expression")),
                _ => {
                    self.advance();
                    Ok(Expr::Name(name))
                }
            },
            Tok::Op("(") => {
                self.advance();
                if self.eat_op(")") {
                    return Ok(Expr::Tuple(Vec::new()));
                }
                let first = self.expression()?;
                if self.eat_op(")") {
                    return Ok(first);
                }
                let mut items = vec![first];
                while self.eat_op(",") {
                    if self.at_op(")") {
                        break;
                    }
                    items.push(self.expression()?);
                }
                self.expect_op(")")?;
                Ok(Expr::Tuple(items))
            }
            Tok::Op("[") => {
                self.advance();
                let mut items = Vec::new();
                while !self.at_op("]") {
                    items.push(self.expression()?);
                    if !self.eat_op(",") {
                        break;
                    }
                }
                self.expect_op("]")?;
                Ok(Expr::List(items))
            }
            Tok::Op("{") => {
                self.advance();
                let mut entries = Vec::new();
                while !self.at_op("}") {
                    let key = self.expression()?;
                    self.expect_op(":")?;
                    let value = self.expression()?;
                    entries.push((key, value));
                    if !self.eat_op(",") {
                        break;
                    }
                }
                self.expect_op("}")?;
                Ok(Expr::Dict(entries))
            }
            _ => Err(self.unexpected("expected an expression")),
        }
    }
}

fn binary(op: BinOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

fn to_target(expr: Expr, line: u32) -> ScriptResult<Target> {
    match expr {
        Expr::Name(name) => Ok(Target::Name(name)),
        Expr::Index { value, index } => Ok(Target::Index {
            value: *value,
            index: *index,
        }),
        Expr::Tuple(items) | Expr::List(items) if !items.is_empty() => items
            .into_iter()
            .map(|item| to_target(item, line))
            .collect::<ScriptResult<Vec<_>>>()
            .map(Target::Tuple),
        _ => Err(ScriptError::syntax(line, "cannot assign to expression")),
    }
}
