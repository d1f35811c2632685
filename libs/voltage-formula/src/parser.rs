//! Formula parser
//!
//! A recursive descent parser with the usual operator precedence:
//!
//! | Level | Operators |
//! |-------|-----------|
//! | 1 (lowest) | `\|\|`, `or` |
//! | 2 | `&&`, `and` |
//! | 3 | `==`, `!=` |
//! | 4 | `<`, `<=`, `>`, `>=` |
//! | 5 | `+`, `-` |
//! | 6 | `*`, `/`, `%` |
//! | 7 | unary `-`, `+`, `!`, `not` |
//! | 8 | `^` (right associative) |
//!
//! Identifiers may contain dots so entity ids such as `sensor.power` are
//! single names. Names that read as float literals (`inf`, `nan`,
//! `infinity` in any case) are rejected.

use crate::ast::{BinaryOp, Expr, Span, SyntaxTree, UnaryOp, PLACEHOLDER_PREFIX};
use crate::error::{FormulaError, Result};

/// Deepest accepted nesting of parentheses, call arguments and unary chains
pub const MAX_NESTING_DEPTH: usize = 64;

/// Most operator and call nodes accepted in one formula
pub const MAX_EXPRESSION_NODES: usize = 1024;

/// Parse formula text into a syntax tree
///
/// # Example
/// ```rust
/// use voltage_formula::parse_formula;
///
/// let tree = parse_formula("sensor.power * 0.95").unwrap();
/// let tree = parse_formula("clamp(P, 0, 500) + integrate(P)").unwrap();
/// let tree = parse_formula("state > 10 and not sensor.door").unwrap();
/// ```
pub fn parse_formula(text: &str) -> Result<SyntaxTree> {
    let mut parser = FormulaParser::new(text)?;
    let root = parser.parse_expression()?;

    if parser.current.token != Token::Eof {
        return Err(parser.error(format!(
            "Unexpected input after expression: '{}'",
            &text[parser.current.start..]
        )));
    }

    Ok(SyntaxTree {
        text: text.to_string(),
        root,
    })
}

/// Token types
#[derive(Debug, Clone, PartialEq)]
enum Token {
    // Literals
    Number(f64),
    Text(String),
    Identifier(String),

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    Bang,
    AndAnd,
    OrOr,
    EqualEqual,
    NotEqual,
    LessThan,
    LessEqual,
    GreaterThan,
    GreaterEqual,

    // Delimiters
    LeftParen,
    RightParen,
    Comma,

    Eof,
}

#[derive(Debug, Clone)]
struct Spanned {
    token: Token,
    start: usize,
    end: usize,
}

struct FormulaParser<'a> {
    input: &'a str,
    pos: usize,
    current: Spanned,
    depth: usize,
    nodes: usize,
}

impl<'a> FormulaParser<'a> {
    fn new(input: &'a str) -> Result<Self> {
        let mut parser = Self {
            input,
            pos: 0,
            current: Spanned {
                token: Token::Eof,
                start: 0,
                end: 0,
            },
            depth: 0,
            nodes: 0,
        };
        parser.advance()?;
        Ok(parser)
    }

    fn error(&self, message: impl Into<String>) -> FormulaError {
        FormulaError::parse(self.input, self.current.start, message)
    }

    // === Token scanning ===

    fn advance(&mut self) -> Result<Spanned> {
        let next = self.scan_token()?;
        Ok(std::mem::replace(&mut self.current, next))
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek_char()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if !c.is_whitespace() {
                break;
            }
            self.pos += c.len_utf8();
        }
    }

    fn scan_token(&mut self) -> Result<Spanned> {
        self.skip_whitespace();
        let start = self.pos;

        let Some(c) = self.bump() else {
            return Ok(Spanned {
                token: Token::Eof,
                start,
                end: start,
            });
        };

        let token = match c {
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => Token::Star,
            '/' => Token::Slash,
            '%' => Token::Percent,
            '^' => Token::Caret,
            '(' => Token::LeftParen,
            ')' => Token::RightParen,
            ',' => Token::Comma,
            '!' => {
                if self.peek_char() == Some('=') {
                    self.bump();
                    Token::NotEqual
                } else {
                    Token::Bang
                }
            },
            '=' => {
                if self.peek_char() == Some('=') {
                    self.bump();
                    Token::EqualEqual
                } else {
                    return Err(FormulaError::parse(
                        self.input,
                        start,
                        "Assignment is not supported, use '==' for comparison",
                    ));
                }
            },
            '<' => {
                if self.peek_char() == Some('=') {
                    self.bump();
                    Token::LessEqual
                } else {
                    Token::LessThan
                }
            },
            '>' => {
                if self.peek_char() == Some('=') {
                    self.bump();
                    Token::GreaterEqual
                } else {
                    Token::GreaterThan
                }
            },
            '&' => {
                if self.peek_char() == Some('&') {
                    self.bump();
                    Token::AndAnd
                } else {
                    return Err(FormulaError::parse(self.input, start, "Expected '&&'"));
                }
            },
            '|' => {
                if self.peek_char() == Some('|') {
                    self.bump();
                    Token::OrOr
                } else {
                    return Err(FormulaError::parse(self.input, start, "Expected '||'"));
                }
            },
            '"' | '\'' => self.scan_string(c, start)?,
            c if c.is_ascii_digit() => self.scan_number(start)?,
            '.' if self.peek_char().is_some_and(|n| n.is_ascii_digit()) => {
                self.scan_number(start)?
            },
            c if c.is_ascii_alphabetic() || c == '_' => {
                while let Some(n) = self.peek_char() {
                    if n.is_ascii_alphanumeric() || n == '_' || n == '.' {
                        self.pos += 1;
                    } else {
                        break;
                    }
                }
                Token::Identifier(self.input[start..self.pos].to_string())
            },
            other => {
                return Err(FormulaError::parse(
                    self.input,
                    start,
                    format!("Unexpected character '{}'", other),
                ))
            },
        };

        Ok(Spanned {
            token,
            start,
            end: self.pos,
        })
    }

    fn scan_number(&mut self, start: usize) -> Result<Token> {
        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() || c == '.' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let literal = &self.input[start..self.pos];
        literal
            .parse::<f64>()
            .map(Token::Number)
            .map_err(|_| FormulaError::parse(self.input, start, format!("Invalid number '{}'", literal)))
    }

    fn scan_string(&mut self, quote: char, start: usize) -> Result<Token> {
        let mut value = String::new();
        loop {
            match self.bump() {
                None => {
                    return Err(FormulaError::parse(
                        self.input,
                        start,
                        "Unterminated string literal",
                    ))
                },
                Some('\\') => match self.bump() {
                    Some(escaped) => value.push(escaped),
                    None => {
                        return Err(FormulaError::parse(
                            self.input,
                            start,
                            "Unterminated string literal",
                        ))
                    },
                },
                Some(c) if c == quote => break,
                Some(c) => value.push(c),
            }
        }
        Ok(Token::Text(value))
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<Spanned> {
        if self.current.token == expected {
            self.advance()
        } else {
            Err(self.error(format!("Expected {}", what)))
        }
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(&self.current.token, Token::Identifier(id) if id == keyword)
    }

    // === Limits ===

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(self.error(format!(
                "Formula nested deeper than {} levels",
                MAX_NESTING_DEPTH
            )));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn count_node(&mut self) -> Result<()> {
        self.nodes += 1;
        if self.nodes > MAX_EXPRESSION_NODES {
            return Err(self.error(format!(
                "Formula has more than {} operators and calls",
                MAX_EXPRESSION_NODES
            )));
        }
        Ok(())
    }

    fn binary(&mut self, op: BinaryOp, left: Expr, right: Expr) -> Result<Expr> {
        self.count_node()?;
        Ok(Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    // === Grammar ===

    fn parse_expression(&mut self) -> Result<Expr> {
        self.enter()?;
        let expr = self.parse_or();
        self.leave();
        expr
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.current.token == Token::OrOr || self.is_keyword("or") {
            self.advance()?;
            let right = self.parse_and()?;
            left = self.binary(BinaryOp::Or, left, right)?;
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_equality()?;
        while self.current.token == Token::AndAnd || self.is_keyword("and") {
            self.advance()?;
            let right = self.parse_equality()?;
            left = self.binary(BinaryOp::And, left, right)?;
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = match self.current.token {
                Token::EqualEqual => BinaryOp::Equal,
                Token::NotEqual => BinaryOp::NotEqual,
                _ => break,
            };
            self.advance()?;
            let right = self.parse_comparison()?;
            left = self.binary(op, left, right)?;
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.current.token {
                Token::LessThan => BinaryOp::LessThan,
                Token::LessEqual => BinaryOp::LessEqual,
                Token::GreaterThan => BinaryOp::GreaterThan,
                Token::GreaterEqual => BinaryOp::GreaterEqual,
                _ => break,
            };
            self.advance()?;
            let right = self.parse_additive()?;
            left = self.binary(op, left, right)?;
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.current.token {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Subtract,
                _ => break,
            };
            self.advance()?;
            let right = self.parse_multiplicative()?;
            left = self.binary(op, left, right)?;
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.current.token {
                Token::Star => BinaryOp::Multiply,
                Token::Slash => BinaryOp::Divide,
                Token::Percent => BinaryOp::Modulo,
                _ => break,
            };
            self.advance()?;
            let right = self.parse_unary()?;
            left = self.binary(op, left, right)?;
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        let op = match self.current.token {
            Token::Minus => Some(UnaryOp::Negate),
            Token::Plus => Some(UnaryOp::Plus),
            Token::Bang => Some(UnaryOp::Not),
            _ if self.is_keyword("not") => Some(UnaryOp::Not),
            _ => None,
        };

        match op {
            Some(op) => {
                self.advance()?;
                self.count_node()?;
                self.enter()?;
                let operand = self.parse_unary();
                self.leave();
                let operand = operand?;
                Ok(Expr::Unary {
                    op,
                    operand: Box::new(operand),
                })
            },
            None => self.parse_power(),
        }
    }

    fn parse_power(&mut self) -> Result<Expr> {
        let base = self.parse_primary()?;
        if self.current.token == Token::Caret {
            self.advance()?;
            // Right associative; the exponent may carry its own sign
            self.enter()?;
            let exponent = self.parse_unary();
            self.leave();
            return self.binary(BinaryOp::Power, base, exponent?);
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let spanned = self.current.clone();
        match spanned.token {
            Token::Number(n) => {
                self.advance()?;
                Ok(Expr::Number(n))
            },
            Token::Text(s) => {
                self.advance()?;
                Ok(Expr::Text(s))
            },
            Token::LeftParen => {
                self.advance()?;
                let inner = self.parse_expression()?;
                self.expect(Token::RightParen, "')'")?;
                Ok(inner)
            },
            Token::Identifier(id) => {
                match id.as_str() {
                    "true" => {
                        self.advance()?;
                        return Ok(Expr::Bool(true));
                    },
                    "false" => {
                        self.advance()?;
                        return Ok(Expr::Bool(false));
                    },
                    "and" | "or" | "not" => {
                        return Err(self.error(format!("Unexpected keyword '{}'", id)));
                    },
                    _ => {},
                }
                if id.starts_with(PLACEHOLDER_PREFIX) {
                    return Err(self.error(format!(
                        "Identifier '{}' uses the reserved prefix '{}'",
                        id, PLACEHOLDER_PREFIX
                    )));
                }
                if id.ends_with('.') {
                    return Err(self.error(format!("Identifier '{}' ends with '.'", id)));
                }
                if id.parse::<f64>().is_ok() {
                    return Err(self.error(format!("Identifier '{}' reads as a number", id)));
                }

                self.advance()?;
                if self.current.token == Token::LeftParen {
                    self.parse_call(id, spanned.start)
                } else {
                    Ok(Expr::Name {
                        name: id,
                        span: Span::new(spanned.start, spanned.end),
                    })
                }
            },
            Token::Eof => Err(self.error("Unexpected end of formula")),
            other => Err(self.error(format!("Unexpected token {:?}", other))),
        }
    }

    fn parse_call(&mut self, function: String, start: usize) -> Result<Expr> {
        self.expect(Token::LeftParen, "'('")?;
        self.count_node()?;
        let mut args = Vec::new();

        if self.current.token != Token::RightParen {
            loop {
                args.push(self.parse_expression()?);
                if self.current.token == Token::Comma {
                    self.advance()?;
                } else {
                    break;
                }
            }
        }

        let close = self.expect(Token::RightParen, "')' to close the argument list")?;
        Ok(Expr::Call {
            function,
            args,
            span: Span::new(start, close.end),
        })
    }
}
