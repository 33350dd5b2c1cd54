//! Boolean run conditions over processor results.
//!
//! A processor may be configured with a condition such as
//! `EventSelector && !Vetoed`. Before the processor is called for an event,
//! the condition is evaluated against the result values that upstream
//! processors stored on that event.
//!
//! Grammar:
//!
//! ```text
//! expr    := and ( "||" and )*
//! and     := unary ( "&&" unary )*
//! unary   := "!" unary | primary
//! primary := NAME | "true" | "false" | "(" expr ")"
//! ```

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Error produced when a condition expression cannot be parsed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message} at offset {offset}")]
pub struct ConditionParseError {
    pub message: String,
    pub offset: usize,
}

/// A parsed condition expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Const(bool),
    Value(String),
    Not(Box<Condition>),
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
}

impl Condition {
    /// Evaluates the expression, resolving processor names with `lookup`.
    pub fn evaluate<F>(&self, lookup: &F) -> bool
    where
        F: Fn(&str) -> bool,
    {
        match self {
            Condition::Const(value) => *value,
            Condition::Value(name) => lookup(name),
            Condition::Not(inner) => !inner.evaluate(lookup),
            Condition::And(lhs, rhs) => lhs.evaluate(lookup) && rhs.evaluate(lookup),
            Condition::Or(lhs, rhs) => lhs.evaluate(lookup) || rhs.evaluate(lookup),
        }
    }

    /// Names of all processors referenced by the expression.
    pub fn references(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_references(&mut names);
        names
    }

    fn collect_references<'a>(&'a self, names: &mut Vec<&'a str>) {
        match self {
            Condition::Const(_) => {}
            Condition::Value(name) => {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
            Condition::Not(inner) => inner.collect_references(names),
            Condition::And(lhs, rhs) | Condition::Or(lhs, rhs) => {
                lhs.collect_references(names);
                rhs.collect_references(names);
            }
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Const(value) => write!(f, "{}", value),
            Condition::Value(name) => write!(f, "{}", name),
            Condition::Not(inner) => write!(f, "!{}", inner),
            Condition::And(lhs, rhs) => write!(f, "({} && {})", lhs, rhs),
            Condition::Or(lhs, rhs) => write!(f, "({} || {})", lhs, rhs),
        }
    }
}

impl FromStr for Condition {
    type Err = ConditionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tokens = tokenize(s)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        match parser.peek() {
            None => Ok(expr),
            Some((offset, token)) => Err(ConditionParseError {
                message: format!("unexpected token '{}'", token),
                offset: *offset,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Name(String),
    Not,
    And,
    Or,
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Name(name) => write!(f, "{}", name),
            Token::Not => write!(f, "!"),
            Token::And => write!(f, "&&"),
            Token::Or => write!(f, "||"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
        }
    }
}

fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, ConditionParseError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(offset, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        let token = match c {
            '!' => {
                chars.next();
                Token::Not
            }
            '(' => {
                chars.next();
                Token::LParen
            }
            ')' => {
                chars.next();
                Token::RParen
            }
            '&' | '|' => {
                chars.next();
                match chars.next() {
                    Some((_, next)) if next == c => {
                        if c == '&' {
                            Token::And
                        } else {
                            Token::Or
                        }
                    }
                    _ => {
                        return Err(ConditionParseError {
                            message: format!("expected '{}{}'", c, c),
                            offset,
                        })
                    }
                }
            }
            c if is_name_start(c) => {
                let mut name = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if !is_name_char(c) {
                        break;
                    }
                    name.push(c);
                    chars.next();
                }
                Token::Name(name)
            }
            other => {
                return Err(ConditionParseError {
                    message: format!("unexpected character '{}'", other),
                    offset,
                })
            }
        };
        tokens.push((offset, token));
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&(usize, Token)> {
        self.tokens.get(self.pos)
    }

    fn end_offset(&self) -> usize {
        self.tokens.last().map(|(offset, _)| offset + 1).unwrap_or(0)
    }

    fn eat(&mut self, expected: &Token) -> bool {
        match self.peek() {
            Some((_, token)) if token == expected => {
                self.pos += 1;
                true
            }
            _ => false,
        }
    }

    fn parse_or(&mut self) -> Result<Condition, ConditionParseError> {
        let mut lhs = self.parse_and()?;
        while self.eat(&Token::Or) {
            let rhs = self.parse_and()?;
            lhs = Condition::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Condition, ConditionParseError> {
        let mut lhs = self.parse_unary()?;
        while self.eat(&Token::And) {
            let rhs = self.parse_unary()?;
            lhs = Condition::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Condition, ConditionParseError> {
        if self.eat(&Token::Not) {
            let inner = self.parse_unary()?;
            return Ok(Condition::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Condition, ConditionParseError> {
        let Some((offset, token)) = self.tokens.get(self.pos).cloned() else {
            return Err(ConditionParseError {
                message: "unexpected end of expression".to_string(),
                offset: self.end_offset(),
            });
        };
        self.pos += 1;

        match token {
            Token::Name(name) => Ok(match name.as_str() {
                "true" => Condition::Const(true),
                "false" => Condition::Const(false),
                _ => Condition::Value(name),
            }),
            Token::LParen => {
                let inner = self.parse_or()?;
                if !self.eat(&Token::RParen) {
                    return Err(ConditionParseError {
                        message: "missing ')'".to_string(),
                        offset: self.peek().map(|(o, _)| *o).unwrap_or(self.end_offset()),
                    });
                }
                Ok(inner)
            }
            other => Err(ConditionParseError {
                message: format!("unexpected token '{}'", other),
                offset,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn eval(expr: &str, values: &[(&str, bool)]) -> bool {
        let values: HashMap<&str, bool> = values.iter().copied().collect();
        let condition: Condition = expr.parse().expect("valid condition");
        condition.evaluate(&|name| values.get(name).copied().unwrap_or(true))
    }

    #[test]
    fn test_single_name() {
        assert!(eval("EventSelector", &[("EventSelector", true)]));
        assert!(!eval("EventSelector", &[("EventSelector", false)]));
    }

    #[test]
    fn test_precedence_and_binds_tighter() {
        // A || (B && C)
        assert!(eval("A || B && C", &[("A", true), ("B", false), ("C", false)]));
        assert!(!eval("A || B && C", &[("A", false), ("B", true), ("C", false)]));
        // (A || B) && C
        assert!(!eval("(A || B) && C", &[("A", true), ("B", false), ("C", false)]));
    }

    #[test]
    fn test_negation_and_constants() {
        assert!(eval("!Veto", &[("Veto", false)]));
        assert!(!eval("!!Veto", &[("Veto", false)]));
        assert!(eval("true && !false", &[]));
    }

    #[test]
    fn test_unset_values_use_lookup_default() {
        assert!(eval("Unknown", &[]));
    }

    #[test]
    fn test_references_are_unique() {
        let condition: Condition = "A && (B || !A)".parse().unwrap();
        assert_eq!(condition.references(), vec!["A", "B"]);
    }

    #[test]
    fn test_parse_errors() {
        assert!("".parse::<Condition>().is_err());
        assert!("A &".parse::<Condition>().is_err());
        assert!("(A || B".parse::<Condition>().is_err());
        assert!("A B".parse::<Condition>().is_err());
        let err = "A && 3".parse::<Condition>().unwrap_err();
        assert_eq!(err.offset, 5);
    }

    #[test]
    fn test_display_round_trip_shape() {
        let condition: Condition = "A && !B".parse().unwrap();
        assert_eq!(condition.to_string(), "(A && !B)");
    }
}
