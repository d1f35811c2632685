//! Formula syntax tree
//!
//! Trees are built once per distinct formula text by the analysis service and
//! shared read-only afterwards. Rendering a tree produces the canonical text
//! handed to the compiled-expression cache.

use std::fmt::Write;

/// Prefix reserved for placeholder identifiers in canonical text
pub const PLACEHOLDER_PREFIX: &str = "__ref";

/// Byte range inside the formula text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn slice<'a>(&self, text: &'a str) -> &'a str {
        &text[self.start..self.end]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
    Plus,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    // Arithmetic
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Power,

    // Comparison
    Equal,
    NotEqual,
    LessThan,
    LessEqual,
    GreaterThan,
    GreaterEqual,

    // Logic
    And,
    Or,
}

impl BinaryOp {
    /// Operator spelling understood by the compiled evaluator
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
            BinaryOp::Power => "^",
            BinaryOp::Equal => "==",
            BinaryOp::NotEqual => "!=",
            BinaryOp::LessThan => "<",
            BinaryOp::LessEqual => "<=",
            BinaryOp::GreaterThan => ">",
            BinaryOp::GreaterEqual => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }
}

/// Formula expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    // === Literals ===
    Number(f64),
    Text(String),
    Bool(bool),

    // === References ===
    Name { name: String, span: Span },

    // === Operators ===
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    // === Function call ===
    Call {
        function: String,
        args: Vec<Expr>,
        span: Span,
    },
}

impl Expr {
    /// Visit this node and every descendant, parents first
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a Expr)) {
        visit(self);
        match self {
            Expr::Unary { operand, .. } => operand.walk(visit),
            Expr::Binary { left, right, .. } => {
                left.walk(visit);
                right.walk(visit);
            },
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.walk(visit);
                }
            },
            Expr::Number(_) | Expr::Text(_) | Expr::Bool(_) | Expr::Name { .. } => {},
        }
    }

    /// Render to canonical evaluator syntax
    ///
    /// `substitute` is offered every call node first; returning `Some` replaces
    /// the whole call (arguments included) with the returned fragment.
    pub fn render(&self, substitute: &mut dyn FnMut(&Expr) -> Option<String>) -> String {
        let mut out = String::new();
        self.render_into(&mut out, substitute);
        out
    }

    fn render_into(&self, out: &mut String, substitute: &mut dyn FnMut(&Expr) -> Option<String>) {
        match self {
            Expr::Number(n) => out.push_str(&format_number(*n)),
            Expr::Text(s) => {
                out.push('"');
                for c in s.chars() {
                    if c == '"' || c == '\\' {
                        out.push('\\');
                    }
                    out.push(c);
                }
                out.push('"');
            },
            Expr::Bool(b) => {
                let _ = write!(out, "{}", b);
            },
            Expr::Name { name, .. } => out.push_str(name),
            Expr::Unary { op, operand } => match op {
                UnaryOp::Plus => operand.render_into(out, substitute),
                UnaryOp::Negate => {
                    out.push_str("(-");
                    operand.render_into(out, substitute);
                    out.push(')');
                },
                UnaryOp::Not => {
                    out.push_str("(!");
                    operand.render_into(out, substitute);
                    out.push(')');
                },
            },
            Expr::Binary { op, left, right } => {
                out.push('(');
                left.render_into(out, substitute);
                let _ = write!(out, " {} ", op.symbol());
                right.render_into(out, substitute);
                out.push(')');
            },
            Expr::Call { function, args, .. } => {
                if let Some(fragment) = substitute(self) {
                    out.push_str(&fragment);
                    return;
                }
                out.push_str(function);
                out.push('(');
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    arg.render_into(out, substitute);
                }
                out.push(')');
            },
        }
    }
}

/// Format a number so the evaluator reads it back as a float
///
/// `Display` for f64 never uses exponent notation, which keeps negative
/// exponents from being tokenized as a subtraction.
pub fn format_number(n: f64) -> String {
    let s = format!("{}", n);
    if n.is_finite() && !s.contains('.') {
        format!("{}.0", s)
    } else {
        s
    }
}

/// Parsed formula, owned by the analysis cache
#[derive(Debug, Clone, PartialEq)]
pub struct SyntaxTree {
    pub text: String,
    pub root: Expr,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(n: &str) -> Expr {
        Expr::Name {
            name: n.to_string(),
            span: Span::new(0, n.len()),
        }
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(10.0), "10.0");
        assert_eq!(format_number(0.5), "0.5");
        assert_eq!(format_number(1e-7), "0.0000001");
        assert_eq!(format_number(-3.0), "-3.0");
    }

    #[test]
    fn test_render_parenthesizes_binary() {
        let expr = Expr::Binary {
            op: BinaryOp::Multiply,
            left: Box::new(Expr::Binary {
                op: BinaryOp::Add,
                left: Box::new(name("a")),
                right: Box::new(Expr::Number(1.0)),
            }),
            right: Box::new(name("b")),
        };
        assert_eq!(expr.render(&mut |_| None), "((a + 1.0) * b)");
    }

    #[test]
    fn test_render_substitutes_calls() {
        let expr = Expr::Binary {
            op: BinaryOp::Add,
            left: Box::new(Expr::Call {
                function: "integrate".into(),
                args: vec![name("P")],
                span: Span::new(0, 12),
            }),
            right: Box::new(Expr::Call {
                function: "abs".into(),
                args: vec![Expr::Text("say \"hi\"".into())],
                span: Span::new(15, 30),
            }),
        };
        let rendered = expr.render(&mut |call| match call {
            Expr::Call { function, .. } if function == "integrate" => Some("__ref0".into()),
            _ => None,
        });
        assert_eq!(rendered, "(__ref0 + abs(\"say \\\"hi\\\"\"))");
    }
}
