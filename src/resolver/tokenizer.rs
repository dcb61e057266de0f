//! Question tokenizer

use crate::intent::{Literal, Operator};
use chrono::NaiveDate;
use regex::Regex;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Lower-cased word.
    Word(String),
    Number(Literal),
    Date(NaiveDate),
    Quoted(String),
    Symbol(Operator),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Text as written in the question.
    pub text: String,
    /// Starts with an upper-case letter.
    pub capitalized: bool,
}

impl Token {
    pub fn word(&self) -> Option<&str> {
        match &self.kind {
            TokenKind::Word(w) => Some(w),
            _ => None,
        }
    }
}

fn pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r#"(?x)
            "(?P<dq>[^"]*)"
            | '(?P<sq>[^']*)'
            | (?P<date>\d{4}-\d{2}-\d{2})
            | (?P<num>\$?\d[\d,]*(?:\.\d+)?(?:[kKmM]\b)?)
            | (?P<op>>=|<=|!=|<>|<|>|=)
            | (?P<word>[A-Za-z_][A-Za-z0-9_'\-]*)
            "#,
        )
        .unwrap_or_else(|e| unreachable!("token pattern is valid: {}", e))
    })
}

/// Split a question into tokens. Characters that belong to no token
/// (punctuation, stray symbols) are skipped.
pub fn tokenize(question: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    for caps in pattern().captures_iter(question) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        let text = whole.as_str().to_string();
        let kind = if let Some(m) = caps.name("dq").or_else(|| caps.name("sq")) {
            TokenKind::Quoted(m.as_str().to_string())
        } else if let Some(m) = caps.name("date") {
            match NaiveDate::parse_from_str(m.as_str(), "%Y-%m-%d") {
                Ok(date) => TokenKind::Date(date),
                Err(_) => TokenKind::Quoted(m.as_str().to_string()),
            }
        } else if let Some(m) = caps.name("num") {
            match parse_number(m.as_str()) {
                Some(n) => TokenKind::Number(Literal::number(n)),
                None => continue,
            }
        } else if let Some(m) = caps.name("op") {
            TokenKind::Symbol(match m.as_str() {
                ">=" => Operator::Gte,
                "<=" => Operator::Lte,
                "!=" | "<>" => Operator::NotEq,
                "<" => Operator::Lt,
                ">" => Operator::Gt,
                _ => Operator::Eq,
            })
        } else if let Some(m) = caps.name("word") {
            TokenKind::Word(m.as_str().trim_end_matches(['\'', '-']).to_lowercase())
        } else {
            continue;
        };
        let capitalized = text.chars().next().map_or(false, |c| c.is_uppercase());
        tokens.push(Token {
            kind,
            text,
            capitalized,
        });
    }
    tokens
}

/// `100,000`, `$100k`, `1.5m`.
fn parse_number(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim_start_matches('$')
        .chars()
        .filter(|c| *c != ',')
        .collect();
    let (digits, multiplier) = match cleaned.chars().last() {
        Some('k') | Some('K') => (&cleaned[..cleaned.len() - 1], 1_000.0),
        Some('m') | Some('M') => (&cleaned[..cleaned.len() - 1], 1_000_000.0),
        _ => (cleaned.as_str(), 1.0),
    };
    digits.parse::<f64>().ok().map(|v| v * multiplier)
}
