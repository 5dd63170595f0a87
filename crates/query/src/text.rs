//! The textual query mini-language. Line-oriented: `unit NAME TYPE…` lines
//! declare unit variables, every other non-empty line is a condition, and
//! all conditions are joined by implicit AND.

use crate::ast::{BinOp, Expr, Query};
use crate::{Error, Result};
use corpus::Value;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref TOKEN: Regex =
        Regex::new(r#"^\s*(\(|\)|\.|"(?:\\.|[^"\\])*"|[^\s()".]+)"#).unwrap();
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Dot,
    Str(String),
    Word(String),
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
            Token::Dot => "'.'".to_string(),
            Token::Str(s) => format!("\"{}\"", s),
            Token::Word(w) => format!("'{}'", w),
        }
    }
}

fn unescape(quoted: &str) -> String {
    let inner = &quoted[1..quoted.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn lex(line: &str, lineno: usize) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut rest = line;
    while let Some(found) = TOKEN.captures(rest) {
        let whole = found.get(0).unwrap();
        let piece = found.get(1).unwrap().as_str();
        tokens.push(match piece {
            "(" => Token::LParen,
            ")" => Token::RParen,
            "." => Token::Dot,
            _ if piece.starts_with('"') => Token::Str(unescape(piece)),
            _ => Token::Word(piece.to_string()),
        });
        rest = &rest[whole.end()..];
    }
    let rest = rest.trim_start();
    if !rest.is_empty() {
        if rest.starts_with('"') {
            return Err(Error::parse(lineno, "Unterminated string literal"));
        }
        return Err(Error::parse(
            lineno,
            format!("Unable to tokenize '{}'", rest),
        ));
    }
    Ok(tokens)
}

enum Op {
    Dot,
    Has,
    Bin(BinOp),
}

fn lookup_op(token: &Token) -> Option<(Op, u8)> {
    let word = match token {
        Token::Dot => return Some((Op::Dot, 7)),
        Token::Word(w) => w.as_str(),
        _ => return None,
    };
    Some(match word {
        "has" => (Op::Has, 7),
        "*" => (Op::Bin(BinOp::Mul), 6),
        "/" => (Op::Bin(BinOp::Div), 6),
        "%" => (Op::Bin(BinOp::Rem), 6),
        "+" => (Op::Bin(BinOp::Add), 5),
        "-" => (Op::Bin(BinOp::Sub), 5),
        "contains" => (Op::Bin(BinOp::Contains), 4),
        "startswith" => (Op::Bin(BinOp::StartsWith), 4),
        "endswith" => (Op::Bin(BinOp::EndsWith), 4),
        "parent" => (Op::Bin(BinOp::Parent), 4),
        "child" => (Op::Bin(BinOp::Child), 4),
        "<" => (Op::Bin(BinOp::Lt), 3),
        ">" => (Op::Bin(BinOp::Gt), 3),
        "<=" => (Op::Bin(BinOp::Le), 3),
        ">=" => (Op::Bin(BinOp::Ge), 3),
        "=" => (Op::Bin(BinOp::Eq), 3),
        "!=" => (Op::Bin(BinOp::Ne), 3),
        "AND" => (Op::Bin(BinOp::And), 1),
        "OR" => (Op::Bin(BinOp::Or), 0),
        _ => return None,
    })
}

const NOT_PRECEDENCE: u8 = 2;

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    line: usize,
    query: &'a Query,
}

impl<'a> Parser<'a> {
    fn err(&self, message: impl Into<String>) -> Error {
        Error::parse(self.line, message)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_expr(&mut self, min_precedence: u8) -> Result<Expr> {
        let mut left = self.parse_prefix()?;
        loop {
            let token = match self.peek() {
                Some(t) => t,
                None => break,
            };
            if *token == Token::RParen {
                break;
            }
            let (op, precedence) = match lookup_op(token) {
                Some(found) => found,
                None => {
                    return Err(self.err(format!(
                        "Expected operator, found {}",
                        token.describe()
                    )))
                }
            };
            if precedence < min_precedence {
                break;
            }
            self.advance();
            left = match op {
                Op::Dot => {
                    let feature = self.expect_word("a feature name after '.'")?;
                    match left {
                        Expr::Unit(unit) => Expr::Feature { unit, feature },
                        _ => return Err(self.err("Feature access needs a unit on the left")),
                    }
                }
                Op::Has => {
                    let feature = self.expect_word("a feature name after 'has'")?;
                    match left {
                        Expr::Unit(unit) => Expr::Exists { unit, feature },
                        _ => return Err(self.err("'has' needs a unit on the left")),
                    }
                }
                Op::Bin(op) => {
                    let right = self.parse_expr(precedence + 1)?;
                    Expr::Binary {
                        op,
                        left: Box::new(left),
                        right: Box::new(right),
                    }
                }
            };
        }
        Ok(left)
    }

    fn parse_prefix(&mut self) -> Result<Expr> {
        let token = match self.advance() {
            Some(t) => t.clone(),
            None => return Err(self.err("Expected an expression")),
        };
        match token {
            Token::Word(w) if w == "NOT" => {
                let operand = self.parse_expr(NOT_PRECEDENCE + 1)?;
                if matches!(operand, Expr::Literal(_)) {
                    return Err(self.err("Cannot negate value"));
                }
                Ok(Expr::Not(Box::new(operand)))
            }
            Token::LParen => {
                let inner = self.parse_expr(0)?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(self.err("Expected ')'")),
                }
            }
            Token::Str(s) => Ok(Expr::Literal(Value::Str(s))),
            Token::Word(w) => {
                if w == "true" {
                    Ok(Expr::Literal(Value::Bool(true)))
                } else if w == "false" {
                    Ok(Expr::Literal(Value::Bool(false)))
                } else if let Ok(n) = w.parse::<i64>() {
                    Ok(Expr::Literal(Value::Int(n)))
                } else {
                    match self.query.unit_index(&w) {
                        Some(index) => Ok(Expr::Unit(index)),
                        None => Err(self.err(format!("No unit named '{}'", w))),
                    }
                }
            }
            other => Err(self.err(format!("Unexpected {}", other.describe()))),
        }
    }

    fn expect_word(&mut self, expected: &str) -> Result<String> {
        match self.advance() {
            Some(Token::Word(w)) => Ok(w.clone()),
            other => {
                let found = other.map(Token::describe).unwrap_or_else(|| "end of line".to_string());
                Err(self.err(format!("Expected {}, found {}", expected, found)))
            }
        }
    }
}

fn parse_unit_decl(query: &mut Query, tokens: &[Token], lineno: usize) -> Result<()> {
    let name = match tokens.first() {
        Some(Token::Word(w)) => w.clone(),
        _ => return Err(Error::parse(lineno, "Missing unit name")),
    };
    let mut types = Vec::new();
    for token in &tokens[1..] {
        match token {
            Token::Word(w) => types.push(w.clone()),
            other => {
                return Err(Error::parse(
                    lineno,
                    format!("Invalid unit type {}", other.describe()),
                ))
            }
        }
    }
    if types.is_empty() {
        return Err(Error::parse(lineno, "Missing unit type"));
    }
    query.add_unit(name, types, None);
    Ok(())
}

/// Parse a query text into a [`Query`]. Barewords resolve against the most
/// recently declared unit of that name, so declarations must precede use.
pub fn parse_query(text: &str) -> Result<Query> {
    let mut query = Query::new();
    for (idx, line) in text.lines().enumerate() {
        let lineno = idx + 1;
        let tokens = lex(line, lineno)?;
        if tokens.is_empty() {
            continue;
        }
        if tokens[0] == Token::Word("unit".to_string()) {
            parse_unit_decl(&mut query, &tokens[1..], lineno)?;
            continue;
        }
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            line: lineno,
            query: &query,
        };
        let condition = parser.parse_expr(0)?;
        if parser.pos < tokens.len() {
            return Err(Error::parse(
                lineno,
                format!(
                    "Expected operator, found {}",
                    tokens[parser.pos].describe()
                ),
            ));
        }
        query.add_condition(condition);
    }
    if query.units.is_empty() {
        return Err(Error::InvalidSpec("query declares no units".to_string()));
    }
    Ok(query)
}

#[cfg(test)]
mod test {
    use super::*;

    fn message(err: Error) -> String {
        err.to_string()
    }

    #[test]
    fn declarations_and_conditions_build_a_query() {
        let query = parse_query(
            "unit S sentence\n\
             unit W word\n\
             W parent S\n\
             W.ud:upos = \"DET\"\n",
        )
        .unwrap();
        assert_eq!(query.units.len(), 2);
        assert_eq!(query.units[1].name, "W");
        // Two implicit activity clauses plus the two written conditions.
        assert_eq!(query.conditions.len(), 4);
        assert_eq!(query.conditions[2], Expr::parent(1, 0));
        assert_eq!(
            query.conditions[3],
            Expr::feature(1, "ud:upos").eq(Expr::literal("DET"))
        );
    }

    #[test]
    fn precedence_follows_the_operator_table() {
        let query = parse_query(
            "unit A word\n\
             unit B word\n\
             A.meta:index + 1 = B.meta:index AND A.x:y = \"z\" OR B has x:y\n",
        )
        .unwrap();
        // OR binds loosest: (adjacency AND feature) OR has.
        let last = query.conditions.last().unwrap();
        match last {
            Expr::Binary {
                op: BinOp::Or,
                left,
                ..
            } => match left.as_ref() {
                Expr::Binary { op: BinOp::And, left, .. } => {
                    assert_eq!(
                        left.as_ref(),
                        &Expr::feature(0, "meta:index")
                            .plus(Expr::literal(1))
                            .eq(Expr::feature(1, "meta:index"))
                    );
                }
                other => panic!("expected AND under OR, got {:?}", other),
            },
            other => panic!("expected OR at the top, got {:?}", other),
        }
    }

    #[test]
    fn negating_a_literal_is_rejected() {
        let err = parse_query("unit N word\nN.ud:lemma = NOT \"hi\"\n").unwrap_err();
        assert!(message(err).contains("Cannot negate value"));
    }

    #[test]
    fn unit_declarations_need_a_type() {
        let err = parse_query("unit N\n").unwrap_err();
        let text = message(err);
        assert!(text.contains("Missing unit type"), "got: {}", text);
        assert!(text.starts_with("line 1:"), "got: {}", text);
    }

    #[test]
    fn stray_values_want_an_operator() {
        let err = parse_query("unit N word\nN.ud:lemma \"IS\" \"hi\"\n").unwrap_err();
        let text = message(err);
        assert!(text.contains("Expected operator"), "got: {}", text);
        assert!(text.starts_with("line 2:"), "got: {}", text);
    }

    #[test]
    fn unknown_names_and_bad_strings_fail() {
        assert!(message(parse_query("unit N word\nM.a:b = 1\n").unwrap_err())
            .contains("No unit named 'M'"));
        assert!(message(parse_query("unit N word\nN.a:b = \"oops\n").unwrap_err())
            .contains("Unterminated string"));
    }

    #[test]
    fn escapes_and_parentheses_round_trip() {
        let query = parse_query(
            "unit N word\n\
             (N.a:b = \"say \\\"hi\\\"\") AND NOT N has c:d\n",
        )
        .unwrap();
        let clauses = &query.conditions[1..];
        assert_eq!(
            clauses[0],
            Expr::feature(0, "a:b").eq(Expr::literal("say \"hi\""))
        );
        assert_eq!(clauses[1], Expr::exists(0, "c:d").not_());
    }

    #[test]
    fn not_binds_looser_than_comparisons() {
        let query = parse_query("unit N word\nNOT N.a:b = 1\n").unwrap();
        assert_eq!(
            query.conditions.last().unwrap(),
            &Expr::feature(0, "a:b").eq(Expr::literal(1)).not_()
        );
    }
}
