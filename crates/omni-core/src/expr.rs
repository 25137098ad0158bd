//! # Custom Strategy Expressions
//!
//! A sandboxed, narrowly-scoped expression evaluator backing the CUSTOM sync
//! strategy. Arithmetic and field lookups only: no calls out, no state, no
//! arbitrary code. A broken expression fails its own rule and nothing else.
//!
//! ## Grammar
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/' | '%') unary)*
//! unary   := '-' unary | primary
//! primary := number | ident | func '(' expr (',' expr)* ')' | '(' expr ')'
//! func    := 'min' | 'max' | 'floor' | 'abs'
//! ```
//!
//! Identifiers resolve against the variables supplied at evaluation time
//! (`quantity`, `reserved`, `available`, `min_threshold`). Unknown
//! identifiers and division by zero are evaluation errors, not panics.
//!
//! ## Example
//! ```
//! use omni_core::expr::Expr;
//! use std::collections::HashMap;
//!
//! let expr = Expr::parse("max(0, quantity - reserved - 5)").unwrap();
//! let vars = HashMap::from([("quantity".to_string(), 20.0), ("reserved".to_string(), 3.0)]);
//! assert_eq!(expr.eval(&vars).unwrap(), 12.0);
//! ```

use std::collections::HashMap;

use thiserror::Error;

// =============================================================================
// Errors
// =============================================================================

/// Expression parse or evaluation failure.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    /// Unexpected character during tokenizing.
    #[error("Unexpected character '{0}' in expression")]
    UnexpectedChar(char),

    /// Token stream ended mid-expression.
    #[error("Unexpected end of expression")]
    UnexpectedEnd,

    /// Parser found a token it cannot use here.
    #[error("Unexpected token '{0}'")]
    UnexpectedToken(String),

    /// Trailing input after a complete expression.
    #[error("Trailing input after expression: '{0}'")]
    TrailingInput(String),

    /// Function name is not in the whitelist.
    #[error("Unknown function '{0}'")]
    UnknownFunction(String),

    /// Function called with the wrong number of arguments.
    #[error("Function '{name}' expects {expected} arguments, got {got}")]
    WrongArity {
        name: String,
        expected: usize,
        got: usize,
    },

    /// Identifier not present in the variable set.
    #[error("Unknown variable '{0}'")]
    UnknownVariable(String),

    /// Division or modulo by zero.
    #[error("Division by zero")]
    DivisionByZero,

    /// Result overflowed to a non-finite value.
    #[error("Expression produced a non-finite result")]
    NonFinite,
}

// =============================================================================
// Tokens
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    LParen,
    RParen,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '0'..='9' | '.' => {
                let mut literal = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        literal.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = literal
                    .parse::<f64>()
                    .map_err(|_| ExprError::UnexpectedToken(literal.clone()))?;
                tokens.push(Token::Number(value));
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let mut ident = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        ident.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '%' => {
                chars.next();
                tokens.push(Token::Percent);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            other => return Err(ExprError::UnexpectedChar(other)),
        }
    }

    Ok(tokens)
}

// =============================================================================
// AST
// =============================================================================

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

/// A parsed, reusable expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Numeric literal.
    Number(f64),
    /// Variable lookup.
    Var(String),
    /// Unary negation.
    Neg(Box<Expr>),
    /// Binary arithmetic.
    Bin(BinOp, Box<Expr>, Box<Expr>),
    /// Whitelisted function call.
    Call(Func, Vec<Expr>),
}

/// Whitelisted functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Min,
    Max,
    Floor,
    Abs,
}

impl Func {
    fn from_name(name: &str) -> Option<(Func, usize)> {
        match name {
            "min" => Some((Func::Min, 2)),
            "max" => Some((Func::Max, 2)),
            "floor" => Some((Func::Floor, 1)),
            "abs" => Some((Func::Abs, 1)),
            _ => None,
        }
    }
}

// =============================================================================
// Parser
// =============================================================================

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExprError> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(ExprError::UnexpectedToken(format!("{:?}", token))),
            None => Err(ExprError::UnexpectedEnd),
        }
    }

    fn expr(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.term()?;
        while let Some(op) = match self.peek() {
            Some(Token::Plus) => Some(BinOp::Add),
            Some(Token::Minus) => Some(BinOp::Sub),
            _ => None,
        } {
            self.next();
            let right = self.term()?;
            left = Expr::Bin(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.unary()?;
        while let Some(op) = match self.peek() {
            Some(Token::Star) => Some(BinOp::Mul),
            Some(Token::Slash) => Some(BinOp::Div),
            Some(Token::Percent) => Some(BinOp::Rem),
            _ => None,
        } {
            self.next();
            let right = self.unary()?;
            left = Expr::Bin(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        if matches!(self.peek(), Some(Token::Minus)) {
            self.next();
            let inner = self.unary()?;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        match self.next() {
            Some(Token::Number(value)) => Ok(Expr::Number(value)),
            Some(Token::Ident(name)) => {
                if matches!(self.peek(), Some(Token::LParen)) {
                    self.next();
                    let mut args = vec![self.expr()?];
                    while matches!(self.peek(), Some(Token::Comma)) {
                        self.next();
                        args.push(self.expr()?);
                    }
                    self.expect(Token::RParen)?;

                    let (func, arity) = Func::from_name(&name)
                        .ok_or_else(|| ExprError::UnknownFunction(name.clone()))?;
                    if args.len() != arity {
                        return Err(ExprError::WrongArity {
                            name,
                            expected: arity,
                            got: args.len(),
                        });
                    }
                    Ok(Expr::Call(func, args))
                } else {
                    Ok(Expr::Var(name))
                }
            }
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(token) => Err(ExprError::UnexpectedToken(format!("{:?}", token))),
            None => Err(ExprError::UnexpectedEnd),
        }
    }
}

// =============================================================================
// Public API
// =============================================================================

impl Expr {
    /// Parses an expression from source text.
    pub fn parse(input: &str) -> Result<Expr, ExprError> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expr()?;
        if let Some(extra) = parser.peek() {
            return Err(ExprError::TrailingInput(format!("{:?}", extra)));
        }
        Ok(expr)
    }

    /// Evaluates the expression against a variable set.
    pub fn eval(&self, vars: &HashMap<String, f64>) -> Result<f64, ExprError> {
        let value = self.eval_inner(vars)?;
        if value.is_finite() {
            Ok(value)
        } else {
            Err(ExprError::NonFinite)
        }
    }

    fn eval_inner(&self, vars: &HashMap<String, f64>) -> Result<f64, ExprError> {
        match self {
            Expr::Number(value) => Ok(*value),
            Expr::Var(name) => vars
                .get(name)
                .copied()
                .ok_or_else(|| ExprError::UnknownVariable(name.clone())),
            Expr::Neg(inner) => Ok(-inner.eval_inner(vars)?),
            Expr::Bin(op, left, right) => {
                let l = left.eval_inner(vars)?;
                let r = right.eval_inner(vars)?;
                match op {
                    BinOp::Add => Ok(l + r),
                    BinOp::Sub => Ok(l - r),
                    BinOp::Mul => Ok(l * r),
                    BinOp::Div => {
                        if r == 0.0 {
                            Err(ExprError::DivisionByZero)
                        } else {
                            Ok(l / r)
                        }
                    }
                    BinOp::Rem => {
                        if r == 0.0 {
                            Err(ExprError::DivisionByZero)
                        } else {
                            Ok(l % r)
                        }
                    }
                }
            }
            Expr::Call(func, args) => {
                let values: Vec<f64> = args
                    .iter()
                    .map(|a| a.eval_inner(vars))
                    .collect::<Result<_, _>>()?;
                match func {
                    Func::Min => Ok(values[0].min(values[1])),
                    Func::Max => Ok(values[0].max(values[1])),
                    Func::Floor => Ok(values[0].floor()),
                    Func::Abs => Ok(values[0].abs()),
                }
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_arithmetic_precedence() {
        let expr = Expr::parse("2 + 3 * 4").unwrap();
        assert_eq!(expr.eval(&HashMap::new()).unwrap(), 14.0);

        let expr = Expr::parse("(2 + 3) * 4").unwrap();
        assert_eq!(expr.eval(&HashMap::new()).unwrap(), 20.0);
    }

    #[test]
    fn test_unary_minus() {
        let expr = Expr::parse("-5 + 10").unwrap();
        assert_eq!(expr.eval(&HashMap::new()).unwrap(), 5.0);
    }

    #[test]
    fn test_variable_lookup() {
        let expr = Expr::parse("quantity - reserved").unwrap();
        let v = vars(&[("quantity", 20.0), ("reserved", 8.0)]);
        assert_eq!(expr.eval(&v).unwrap(), 12.0);
    }

    #[test]
    fn test_unknown_variable() {
        let expr = Expr::parse("missing + 1").unwrap();
        assert_eq!(
            expr.eval(&HashMap::new()),
            Err(ExprError::UnknownVariable("missing".to_string()))
        );
    }

    #[test]
    fn test_functions() {
        let v = vars(&[("quantity", 7.0)]);
        assert_eq!(Expr::parse("min(quantity, 5)").unwrap().eval(&v).unwrap(), 5.0);
        assert_eq!(Expr::parse("max(quantity, 5)").unwrap().eval(&v).unwrap(), 7.0);
        assert_eq!(Expr::parse("floor(quantity / 2)").unwrap().eval(&v).unwrap(), 3.0);
        assert_eq!(Expr::parse("abs(0 - quantity)").unwrap().eval(&v).unwrap(), 7.0);
    }

    #[test]
    fn test_unknown_function() {
        assert_eq!(
            Expr::parse("exec(1)"),
            Err(ExprError::UnknownFunction("exec".to_string()))
        );
    }

    #[test]
    fn test_wrong_arity() {
        assert!(matches!(
            Expr::parse("min(1)"),
            Err(ExprError::WrongArity { .. })
        ));
    }

    #[test]
    fn test_division_by_zero() {
        let expr = Expr::parse("1 / 0").unwrap();
        assert_eq!(expr.eval(&HashMap::new()), Err(ExprError::DivisionByZero));

        let expr = Expr::parse("5 % 0").unwrap();
        assert_eq!(expr.eval(&HashMap::new()), Err(ExprError::DivisionByZero));
    }

    #[test]
    fn test_parse_failures() {
        assert!(Expr::parse("").is_err());
        assert!(Expr::parse("1 +").is_err());
        assert!(Expr::parse("(1 + 2").is_err());
        assert!(Expr::parse("1 2").is_err());
        assert!(Expr::parse("a $ b").is_err());
    }
}
