//! Recursive-descent parser for formula expressions.
//!
//! Grammar (lowest to highest precedence):
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/') unary)*
//! unary   := ('-' | '+') unary | power
//! power   := primary (('^' | '**') unary)?
//! primary := NUMBER | IDENT | IDENT '(' expr (',' expr)* ')' | '(' expr ')'
//! ```
//!
//! Exponentiation is right-associative and binds tighter than a leading minus,
//! so `-2^2` is `-(2^2)` and `2^-1` is `0.5`.

use crate::error::FormulaSyntaxError;

const MAX_EXPRESSION_LEN: usize = 4096;
const MAX_NESTING_DEPTH: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Abs,
    Sqrt,
    Ln,
    Log10,
    Exp,
    Min,
    Max,
    Pow,
    Clamp,
    Floor,
    Ceil,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arity {
    Exactly(usize),
    AtLeast(usize),
}

impl Function {
    pub fn from_name(name: &str) -> Option<Self> {
        let func = match name {
            "abs" => Function::Abs,
            "sqrt" => Function::Sqrt,
            "ln" => Function::Ln,
            "log10" => Function::Log10,
            "exp" => Function::Exp,
            "min" => Function::Min,
            "max" => Function::Max,
            "pow" => Function::Pow,
            "clamp" => Function::Clamp,
            "floor" => Function::Floor,
            "ceil" => Function::Ceil,
            _ => return None,
        };
        Some(func)
    }

    pub fn name(self) -> &'static str {
        match self {
            Function::Abs => "abs",
            Function::Sqrt => "sqrt",
            Function::Ln => "ln",
            Function::Log10 => "log10",
            Function::Exp => "exp",
            Function::Min => "min",
            Function::Max => "max",
            Function::Pow => "pow",
            Function::Clamp => "clamp",
            Function::Floor => "floor",
            Function::Ceil => "ceil",
        }
    }

    fn arity(self) -> Arity {
        match self {
            Function::Abs
            | Function::Sqrt
            | Function::Ln
            | Function::Log10
            | Function::Exp
            | Function::Floor
            | Function::Ceil => Arity::Exactly(1),
            Function::Pow => Arity::Exactly(2),
            Function::Clamp => Arity::Exactly(3),
            Function::Min | Function::Max => Arity::AtLeast(1),
        }
    }
}

/// Expression tree. `V` is the variable representation: tag names straight
/// out of the parser, positional argument indices once compiled.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr<V = String> {
    Number(f64),
    Variable(V),
    Unary {
        op: UnaryOp,
        operand: Box<Expr<V>>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr<V>>,
        rhs: Box<Expr<V>>,
    },
    Call {
        func: Function,
        args: Vec<Expr<V>>,
    },
}

impl<V> Expr<V> {
    /// Variable references in textual (left-to-right) order, duplicates included.
    pub fn variables(&self) -> Vec<&V> {
        let mut out = Vec::new();
        self.collect_variables(&mut out);
        out
    }

    fn collect_variables<'a>(&'a self, out: &mut Vec<&'a V>) {
        match self {
            Expr::Number(_) => {}
            Expr::Variable(var) => out.push(var),
            Expr::Unary { operand, .. } => operand.collect_variables(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_variables(out);
                rhs.collect_variables(out);
            }
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.collect_variables(out);
                }
            }
        }
    }

    /// Rebuild the tree with every variable passed through `resolve`.
    pub fn try_map_variables<W, E>(
        &self,
        resolve: &mut impl FnMut(&V) -> Result<W, E>,
    ) -> Result<Expr<W>, E> {
        let mapped = match self {
            Expr::Number(value) => Expr::Number(*value),
            Expr::Variable(var) => Expr::Variable(resolve(var)?),
            Expr::Unary { op, operand } => Expr::Unary {
                op: *op,
                operand: Box::new(operand.try_map_variables(resolve)?),
            },
            Expr::Binary { op, lhs, rhs } => Expr::Binary {
                op: *op,
                lhs: Box::new(lhs.try_map_variables(resolve)?),
                rhs: Box::new(rhs.try_map_variables(resolve)?),
            },
            Expr::Call { func, args } => Expr::Call {
                func: *func,
                args: args
                    .iter()
                    .map(|arg| arg.try_map_variables(resolve))
                    .collect::<Result<Vec<_>, E>>()?,
            },
        };
        Ok(mapped)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
    Comma,
}

impl TokenKind {
    fn describe(&self) -> String {
        match self {
            TokenKind::Number(value) => format!("number {value}"),
            TokenKind::Ident(name) => format!("identifier \"{name}\""),
            TokenKind::Plus => "'+'".to_string(),
            TokenKind::Minus => "'-'".to_string(),
            TokenKind::Star => "'*'".to_string(),
            TokenKind::Slash => "'/'".to_string(),
            TokenKind::Caret => "'^'".to_string(),
            TokenKind::LParen => "'('".to_string(),
            TokenKind::RParen => "')'".to_string(),
            TokenKind::Comma => "','".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    kind: TokenKind,
    position: usize,
}

fn is_word_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_'
}

fn word_end(bytes: &[u8], start: usize) -> usize {
    let mut end = start;
    while end < bytes.len() && is_word_byte(bytes[end]) {
        end += 1;
    }
    end
}

fn digits_end(bytes: &[u8], start: usize) -> usize {
    let mut end = start;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    end
}

/// Lex a token that starts with a digit or '.'.
///
/// Plant tags such as `1D13001` or `2E00001` start with digits, so any
/// digit-led word containing a letter is an identifier. An exponent therefore
/// needs a fraction (`1.0e3`) or an explicit sign (`1e+3`) to read as a number.
fn lex_numeric(input: &str, start: usize) -> Result<(TokenKind, usize), FormulaSyntaxError> {
    let bytes = input.as_bytes();
    let word = word_end(bytes, start);
    let word_text = &input[start..word];
    let has_non_digit = word_text.bytes().any(|byte| !byte.is_ascii_digit());
    if has_non_digit && !is_signed_exponent(bytes, start, word) {
        return Ok((TokenKind::Ident(word_text.to_string()), word));
    }

    let mut end = digits_end(bytes, start);
    if end < bytes.len() && bytes[end] == b'.' {
        end = digits_end(bytes, end + 1);
    }
    if end < bytes.len() && matches!(bytes[end], b'e' | b'E') {
        let mut exponent = end + 1;
        if exponent < bytes.len() && matches!(bytes[exponent], b'+' | b'-') {
            exponent += 1;
        }
        if exponent < bytes.len() && bytes[exponent].is_ascii_digit() {
            end = digits_end(bytes, exponent);
        }
    }

    let text = &input[start..end];
    if end < bytes.len() && is_word_byte(bytes[end]) {
        return Err(FormulaSyntaxError::new(
            start,
            format!("invalid numeric literal \"{}\"", &input[start..word_end(bytes, end)]),
        ));
    }

    let value: f64 = text.parse().map_err(|_| {
        FormulaSyntaxError::new(start, format!("invalid numeric literal \"{text}\""))
    })?;
    if !value.is_finite() {
        return Err(FormulaSyntaxError::new(
            start,
            format!("numeric literal \"{text}\" is out of range"),
        ));
    }
    Ok((TokenKind::Number(value), end))
}

/// `digits` `e|E` followed by a sign and a digit, e.g. `1e+3`.
fn is_signed_exponent(bytes: &[u8], start: usize, word: usize) -> bool {
    word > start + 1
        && bytes[start..word - 1].iter().all(u8::is_ascii_digit)
        && matches!(bytes[word - 1], b'e' | b'E')
        && word + 1 < bytes.len()
        && matches!(bytes[word], b'+' | b'-')
        && bytes[word + 1].is_ascii_digit()
}

fn tokenize(input: &str) -> Result<Vec<Token>, FormulaSyntaxError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let byte = bytes[pos];
        let single = match byte {
            b' ' | b'\t' | b'\r' | b'\n' => {
                pos += 1;
                continue;
            }
            b'+' => Some(TokenKind::Plus),
            b'-' => Some(TokenKind::Minus),
            b'*' if bytes.get(pos + 1) == Some(&b'*') => {
                tokens.push(Token {
                    kind: TokenKind::Caret,
                    position: pos,
                });
                pos += 2;
                continue;
            }
            b'*' => Some(TokenKind::Star),
            b'/' => Some(TokenKind::Slash),
            b'^' => Some(TokenKind::Caret),
            b'(' => Some(TokenKind::LParen),
            b')' => Some(TokenKind::RParen),
            b',' => Some(TokenKind::Comma),
            _ => None,
        };
        if let Some(kind) = single {
            tokens.push(Token {
                kind,
                position: pos,
            });
            pos += 1;
            continue;
        }

        if byte.is_ascii_digit() || byte == b'.' {
            let (kind, end) = lex_numeric(input, pos)?;
            tokens.push(Token {
                kind,
                position: pos,
            });
            pos = end;
            continue;
        }

        if byte.is_ascii_alphabetic() || byte == b'_' {
            let end = word_end(bytes, pos);
            tokens.push(Token {
                kind: TokenKind::Ident(input[pos..end].to_string()),
                position: pos,
            });
            pos = end;
            continue;
        }

        let ch = input[pos..].chars().next().unwrap_or('?');
        return Err(FormulaSyntaxError::new(
            pos,
            format!("unexpected character '{ch}'"),
        ));
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    end_position: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&'a Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek().is_some_and(|token| &token.kind == kind) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn current_position(&self) -> usize {
        self.peek()
            .map(|token| token.position)
            .unwrap_or(self.end_position)
    }

    fn error_here(&self, message: impl Into<String>) -> FormulaSyntaxError {
        FormulaSyntaxError::new(self.current_position(), message)
    }

    fn enter(&mut self) -> Result<(), FormulaSyntaxError> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(self.error_here("expression is nested too deeply"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    fn parse_expr(&mut self) -> Result<Expr, FormulaSyntaxError> {
        self.enter()?;
        let mut lhs = self.parse_term()?;
        loop {
            let op = match self.peek().map(|token| &token.kind) {
                Some(TokenKind::Plus) => BinaryOp::Add,
                Some(TokenKind::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_term()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        self.leave();
        Ok(lhs)
    }

    fn parse_term(&mut self) -> Result<Expr, FormulaSyntaxError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek().map(|token| &token.kind) {
                Some(TokenKind::Star) => BinaryOp::Mul,
                Some(TokenKind::Slash) => BinaryOp::Div,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, FormulaSyntaxError> {
        self.enter()?;
        let expr = if self.eat(&TokenKind::Minus) {
            Expr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(self.parse_unary()?),
            }
        } else if self.eat(&TokenKind::Plus) {
            self.parse_unary()?
        } else {
            self.parse_power()?
        };
        self.leave();
        Ok(expr)
    }

    fn parse_power(&mut self) -> Result<Expr, FormulaSyntaxError> {
        let base = self.parse_primary()?;
        if self.eat(&TokenKind::Caret) {
            let exponent = self.parse_unary()?;
            return Ok(Expr::Binary {
                op: BinaryOp::Pow,
                lhs: Box::new(base),
                rhs: Box::new(exponent),
            });
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr, FormulaSyntaxError> {
        let Some(token) = self.advance() else {
            return Err(FormulaSyntaxError::new(
                self.end_position,
                "unexpected end of expression",
            ));
        };
        match &token.kind {
            TokenKind::Number(value) => Ok(Expr::Number(*value)),
            TokenKind::Ident(name) => {
                if self.eat(&TokenKind::LParen) {
                    return self.parse_call(name, token.position);
                }
                Ok(Expr::Variable(name.clone()))
            }
            TokenKind::LParen => {
                let inner = self.parse_expr()?;
                if !self.eat(&TokenKind::RParen) {
                    return Err(self.error_here(format!(
                        "expected ')' to close '(' at position {}",
                        token.position
                    )));
                }
                Ok(inner)
            }
            other => Err(FormulaSyntaxError::new(
                token.position,
                format!("unexpected {}", other.describe()),
            )),
        }
    }

    fn parse_call(&mut self, name: &str, position: usize) -> Result<Expr, FormulaSyntaxError> {
        let func = Function::from_name(name).ok_or_else(|| {
            FormulaSyntaxError::new(position, format!("unknown function \"{name}\""))
        })?;

        let mut args = Vec::new();
        if !self.eat(&TokenKind::RParen) {
            loop {
                args.push(self.parse_expr()?);
                if self.eat(&TokenKind::Comma) {
                    continue;
                }
                if self.eat(&TokenKind::RParen) {
                    break;
                }
                return Err(self.error_here(format!("expected ',' or ')' in call to {name}()")));
            }
        }

        match func.arity() {
            Arity::Exactly(n) if args.len() != n => Err(FormulaSyntaxError::new(
                position,
                format!("{name}() takes exactly {n} argument(s), got {}", args.len()),
            )),
            Arity::AtLeast(n) if args.len() < n => Err(FormulaSyntaxError::new(
                position,
                format!("{name}() takes at least {n} argument(s), got {}", args.len()),
            )),
            _ => Ok(Expr::Call { func, args }),
        }
    }
}

/// Parse a formula into an expression tree, rejecting anything that is not a
/// complete arithmetic expression.
pub fn parse_expression(input: &str) -> Result<Expr, FormulaSyntaxError> {
    if input.len() > MAX_EXPRESSION_LEN {
        return Err(FormulaSyntaxError::new(
            MAX_EXPRESSION_LEN,
            "expression is too long",
        ));
    }
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(FormulaSyntaxError::new(0, "expression is empty"));
    }

    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        end_position: input.len(),
        depth: 0,
    };
    let expr = parser.parse_expr()?;
    if let Some(token) = parser.peek() {
        return Err(FormulaSyntaxError::new(
            token.position,
            format!("unexpected {}", token.kind.describe()),
        ));
    }
    Ok(expr)
}
