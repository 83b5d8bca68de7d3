use super::error::{ScriptError, ScriptResult};

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub line: u32,
}

const OPERATORS: &[&str] = &[
    "**=", "//=", "**", "//", "==", "!=", "<=", ">=", "+=", "-=", "*=", "/=", "%=", "+", "-", "*",
    "/", "%", "<", ">", "=", "(", ")", "[", "]", "{", "}", ",", ":", ".", ";",
];

const TAB_WIDTH: usize = 4;

enum LineStart {
    Blank,
    Eof,
    Code(usize),
}

pub fn tokenize(source: &str) -> ScriptResult<Vec<Token>> {
    Lexer::new(source).run()
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: u32,
    depth: usize,
    indents: Vec<usize>,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().peekable(),
            line: 1,
            depth: 0,
            indents: vec![0],
            tokens: Vec::new(),
        }
    }

    fn run(mut self) -> ScriptResult<Vec<Token>> {
        let mut at_line_start = true;
        loop {
            if at_line_start {
                if self.depth == 0 {
                    match self.measure_indent() {
                        LineStart::Blank => continue,
                        LineStart::Eof => break,
                        LineStart::Code(width) => self.apply_indent(width)?,
                    }
                }
                at_line_start = false;
            }
            let Some(&ch) = self.chars.peek() else {
                break;
            };
            match ch {
                '\n' => {
                    self.chars.next();
                    if self.depth == 0 && self.line_has_tokens() {
                        self.push(Tok::Newline);
                    }
                    self.line += 1;
                    at_line_start = true;
                }
                ' ' | '\t' | '\r' => {
                    self.chars.next();
                }
                '\\' => {
                    self.chars.next();
                    match self.chars.next() {
                        Some('\n') => self.line += 1,
                        Some('\r') if self.chars.peek() == Some(&'\n') => {
                            self.chars.next();
                            self.line += 1;
                        }
                        _ => return Err(ScriptError::syntax(self.line, "unexpected character after line continuation")),
                    }
                }
                '#' => self.skip_comment(),
                '"' | '\'' => {
                    self.chars.next();
                    let text = self.read_string(ch)?;
                    self.push(Tok::Str(text));
                }
                c if c.is_ascii_digit() => {
                    let tok = self.read_number()?;
                    self.push(tok);
                }
                c if c.is_alphabetic() || c == '_' => {
                    let mut name = String::new();
                    while let Some(&c) = self.chars.peek() {
                        if c.is_alphanumeric() || c == '_' {
                            name.push(c);
                            self.chars.next();
                        } else {
                            break;
                        }
                    }
                    self.push(Tok::Name(name));
                }
                _ => {
                    let op = self.read_operator()?;
                    match op {
                        "(" | "[" | "{" => self.depth += 1,
                        ")" | "]" | "}" => {
                            if self.depth == 0 {
                                return Err(ScriptError::syntax(self.line, format!("unmatched '{op}'")));
                            }
                            self.depth -= 1;
                        }
                        _ => {}
                    }
                    self.push(Tok::Op(op));
                }
            }
        }

        if self.depth > 0 {
            return Err(ScriptError::syntax(self.line, "unexpected EOF: unclosed bracket"));
        }
        if self.line_has_tokens() {
            self.push(Tok::Newline);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(Tok::Dedent);
        }
        self.push(Tok::Eof);
        Ok(self.tokens)
    }

    /// Consumes leading whitespace, and the whole line if it holds no code.
    fn measure_indent(&mut self) -> LineStart {
        let mut width = 0;
        while let Some(&c) = self.chars.peek() {
            match c {
                ' ' => width += 1,
                '\t' => width += TAB_WIDTH,
                '\r' => {}
                _ => break,
            }
            self.chars.next();
        }
        match self.chars.peek() {
            None => LineStart::Eof,
            Some('\n') => {
                self.chars.next();
                self.line += 1;
                LineStart::Blank
            }
            Some('#') => {
                self.skip_comment();
                if self.chars.next().is_some() {
                    self.line += 1;
                }
                LineStart::Blank
            }
            Some(_) => LineStart::Code(width),
        }
    }

    fn apply_indent(&mut self, width: usize) -> ScriptResult<()> {
        let current = self.indents.last().copied().unwrap_or(0);
        if width > current {
            self.indents.push(width);
            self.push(Tok::Indent);
            return Ok(());
        }
        while width < self.indents.last().copied().unwrap_or(0) {
            self.indents.pop();
            self.push(Tok::Dedent);
        }
        if width != self.indents.last().copied().unwrap_or(0) {
            return Err(ScriptError::syntax(
                self.line,
                "unindent does not match any outer indentation level",
            ));
        }
        Ok(())
    }

    fn line_has_tokens(&self) -> bool {
        !matches!(
            self.tokens.last().map(|token| &token.tok),
            None | Some(Tok::Newline) | Some(Tok::Indent) | Some(Tok::Dedent)
        )
    }

    fn skip_comment(&mut self) {
        while let Some(&c) = self.chars.peek() {
            if c == '\n' {
                break;
            }
            self.chars.next();
        }
    }

    fn read_string(&mut self, quote: char) -> ScriptResult<String> {
        let mut out = String::new();
        loop {
            let Some(c) = self.chars.next() else {
                return Err(ScriptError::syntax(self.line, "unterminated string literal"));
            };
            match c {
                '\n' => {
                    return Err(ScriptError::syntax(self.line, "unterminated string literal"));
                }
                '\\' => {
                    let Some(escaped) = self.chars.next() else {
                        return Err(ScriptError::syntax(self.line, "unterminated string literal"));
                    };
                    match escaped {
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        'r' => out.push('\r'),
                        '0' => out.push('\0'),
                        '\\' => out.push('\\'),
                        '\'' => out.push('\''),
                        '"' => out.push('"'),
                        other => {
                            out.push('\\');
                            out.push(other);
                        }
                    }
                }
                c if c == quote => return Ok(out),
                c => out.push(c),
            }
        }
    }

    fn read_number(&mut self) -> ScriptResult<Tok> {
        let mut text = String::new();
        let mut is_float = false;
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_digit() || c == '_' {
                text.push(c);
            } else if c == '.' && !is_float {
                is_float = true;
                text.push(c);
            } else if (c == 'e' || c == 'E') && !text.contains(['e', 'E']) {
                is_float = true;
                text.push(c);
                self.chars.next();
                if let Some(&sign) = self.chars.peek()
                    && (sign == '+' || sign == '-')
                {
                    text.push(sign);
                    self.chars.next();
                }
                continue;
            } else {
                break;
            }
            self.chars.next();
        }
        let cleaned: String = text.chars().filter(|c| *c != '_').collect();
        if is_float {
            cleaned
                .parse::<f64>()
                .map(Tok::Float)
                .map_err(|_| ScriptError::syntax(self.line, format!("invalid number literal '{text}'")))
        } else {
            cleaned
                .parse::<i64>()
                .map(Tok::Int)
                .map_err(|_| ScriptError::syntax(self.line, format!("integer literal too large '{text}'")))
        }
    }

    fn read_operator(&mut self) -> ScriptResult<&'static str> {
        let rest: String = self.chars.clone().take(3).collect();
        for op in OPERATORS {
            if rest.starts_with(op) {
                for _ in 0..op.len() {
                    self.chars.next();
                }
                return Ok(op);
            }
        }
        let ch = rest.chars().next().unwrap_or(' ');
        Err(ScriptError::syntax(self.line, format!("invalid character '{ch}'")))
    }

    fn push(&mut self, tok: Tok) {
        self.tokens.push(Token {
            tok,
            line: self.line,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Tok> {
        tokenize(source)
            .expect("tokenize")
            .into_iter()
            .map(|token| token.tok)
            .collect()
    }

    #[test]
    fn emits_indent_and_dedent_around_blocks() {
        let toks = kinds("if x:\n    y = 1\nz = 2\n");
        assert_eq!(
            toks,
            vec![
                Tok::Name("if".into()),
                Tok::Name("x".into()),
                Tok::Op(":"),
                Tok::Newline,
                Tok::Indent,
                Tok::Name("y".into()),
                Tok::Op("="),
                Tok::Int(1),
                Tok::Newline,
                Tok::Dedent,
                Tok::Name("z".into()),
                Tok::Op("="),
                Tok::Int(2),
                Tok::Newline,
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn newlines_inside_brackets_are_ignored() {
        let toks = kinds("data = [1,\n  2]\n");
        assert!(!toks[..toks.len() - 2].contains(&Tok::Newline));
    }

    #[test]
    fn blank_and_comment_lines_do_not_change_indentation() {
        let toks = kinds("def f():\n\n    # note\n    return 1\n");
        assert_eq!(toks.iter().filter(|tok| **tok == Tok::Indent).count(), 1);
    }

    #[test]
    fn reads_floats_and_escapes() {
        let toks = kinds("x = 1.5e3 + 'a\\n'");
        assert!(toks.contains(&Tok::Float(1500.0)));
        assert!(toks.contains(&Tok::Str("a\n".into())));
    }

    #[test]
    fn inconsistent_dedent_is_a_syntax_error() {
        let err = tokenize("if x:\n    y = 1\n  z = 2\n").unwrap_err();
        assert_eq!(err.kind, super::super::error::ErrorKind::Syntax);
    }
}
