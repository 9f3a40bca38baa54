//! Tokenizer and recursive-descent parser
//!
//! Precedence, loosest first: `or`, `and`, `not`, comparison, primary.

use super::{CompareOp, Expr, ParseError};
use serde_json::{Number, Value};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(Value),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    In,
    Is,
    Op(CompareOp),
    Minus,
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
}

pub(super) fn parse(source: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: source.len(),
    };
    let expr = parser.parse_or()?;
    if let Some((token, at)) = parser.tokens.get(parser.pos) {
        return Err(error(format!("unexpected {token:?}"), *at));
    }
    Ok(expr)
}

fn error(message: impl Into<String>, position: usize) -> ParseError {
    ParseError {
        message: message.into(),
        position,
    }
}

fn tokenize(source: &str) -> Result<Vec<(Token, usize)>, ParseError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let start = i;
        match c {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '(' => tokens.push((Token::LParen, start)),
            ')' => tokens.push((Token::RParen, start)),
            '[' => tokens.push((Token::LBracket, start)),
            ']' => tokens.push((Token::RBracket, start)),
            ',' => tokens.push((Token::Comma, start)),
            '.' => tokens.push((Token::Dot, start)),
            '-' => tokens.push((Token::Minus, start)),
            '=' if chars.get(i + 1) == Some(&'=') => {
                i += 1;
                tokens.push((Token::Op(CompareOp::Eq), start));
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                i += 1;
                tokens.push((Token::Op(CompareOp::Ne), start));
            }
            '!' => tokens.push((Token::Not, start)),
            '<' | '>' => {
                let or_equal = chars.get(i + 1) == Some(&'=');
                let op = match (c, or_equal) {
                    ('<', false) => CompareOp::Lt,
                    ('<', true) => CompareOp::Le,
                    ('>', false) => CompareOp::Gt,
                    _ => CompareOp::Ge,
                };
                if or_equal {
                    i += 1;
                }
                tokens.push((Token::Op(op), start));
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                i += 1;
                tokens.push((Token::And, start));
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                i += 1;
                tokens.push((Token::Or, start));
            }
            '\'' | '"' => {
                let (text, next) = lex_string(&chars, i)?;
                tokens.push((Token::Str(text), start));
                i = next;
                continue;
            }
            c if c.is_ascii_digit() => {
                let (number, next) = lex_number(&chars, i)?;
                tokens.push((Token::Number(number), start));
                i = next;
                continue;
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut end = i;
                while end < chars.len() && (chars[end].is_alphanumeric() || chars[end] == '_') {
                    end += 1;
                }
                let word: String = chars[i..end].iter().collect();
                let token = match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "in" => Token::In,
                    "is" => Token::Is,
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(word),
                };
                tokens.push((token, start));
                i = end;
                continue;
            }
            other => return Err(error(format!("unexpected character '{other}'"), start)),
        }
        i += 1;
    }

    Ok(tokens)
}

fn lex_string(chars: &[char], start: usize) -> Result<(String, usize), ParseError> {
    let quote = chars[start];
    let mut text = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' => {
                let escaped = chars
                    .get(i + 1)
                    .ok_or_else(|| error("unterminated escape", i))?;
                text.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    other => *other,
                });
                i += 2;
            }
            c if c == quote => return Ok((text, i + 1)),
            c => {
                text.push(c);
                i += 1;
            }
        }
    }
    Err(error("unterminated string", start))
}

fn lex_number(chars: &[char], start: usize) -> Result<(Value, usize), ParseError> {
    let mut i = start;
    while i < chars.len() && chars[i].is_ascii_digit() {
        i += 1;
    }
    let mut fractional = false;
    // A dot only belongs to the number when a digit follows; `items.0.name`
    // lexes the `0` as a path segment.
    if chars.get(i) == Some(&'.') && chars.get(i + 1).is_some_and(char::is_ascii_digit) {
        fractional = true;
        i += 1;
        while i < chars.len() && chars[i].is_ascii_digit() {
            i += 1;
        }
    }
    let text: String = chars[start..i].iter().collect();
    let value = if fractional {
        let parsed: f64 = text
            .parse()
            .map_err(|_| error(format!("invalid number '{text}'"), start))?;
        Number::from_f64(parsed)
            .map(Value::Number)
            .ok_or_else(|| error(format!("invalid number '{text}'"), start))?
    } else {
        let parsed: i64 = text
            .parse()
            .map_err(|_| error(format!("number out of range '{text}'"), start))?;
        Value::from(parsed)
    };
    Ok((value, i))
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset).map(|(t, _)| t)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |(_, at)| *at)
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<(), ParseError> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(error(format!("expected {expected:?}"), self.position()))
        }
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_not()?;
        while self.eat(&Token::And) {
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ParseError> {
        if self.eat(&Token::Not) {
            let inner = self.parse_not()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let left = self.parse_primary()?;
        let op = match self.peek() {
            Some(Token::Op(op)) => {
                let op = *op;
                self.pos += 1;
                op
            }
            Some(Token::In) => {
                self.pos += 1;
                CompareOp::In
            }
            Some(Token::Not) if self.peek_at(1) == Some(&Token::In) => {
                self.pos += 2;
                CompareOp::NotIn
            }
            Some(Token::Is) => {
                self.pos += 1;
                if self.eat(&Token::Not) {
                    CompareOp::Ne
                } else {
                    CompareOp::Eq
                }
            }
            _ => return Ok(left),
        };
        let right = self.parse_primary()?;
        Ok(Expr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let at = self.position();
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Literal(n)),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Minus) => match self.next() {
                Some(Token::Number(n)) => Ok(Expr::Literal(negate(&n))),
                _ => Err(error("expected number after '-'", at)),
            },
            Some(Token::Ident(first)) => {
                let mut segments = vec![first];
                while self.eat(&Token::Dot) {
                    let seg_at = self.position();
                    match self.next() {
                        Some(Token::Ident(name)) => segments.push(name),
                        Some(Token::Number(Value::Number(n))) if n.is_u64() => {
                            segments.push(n.to_string());
                        }
                        _ => return Err(error("expected field name after '.'", seg_at)),
                    }
                }
                Ok(Expr::Path(segments))
            }
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        items.push(self.parse_or()?);
                        if self.eat(&Token::Comma) {
                            continue;
                        }
                        self.expect(&Token::RBracket)?;
                        break;
                    }
                }
                Ok(Expr::List(items))
            }
            Some(other) => Err(error(format!("unexpected {other:?}"), at)),
            None => Err(error("unexpected end of expression", at)),
        }
    }
}

fn negate(n: &Value) -> Value {
    if let Some(i) = n.as_i64() {
        Value::from(-i)
    } else {
        n.as_f64()
            .and_then(|f| Number::from_f64(-f))
            .map_or(Value::Null, Value::Number)
    }
}
