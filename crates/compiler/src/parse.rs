//! SQL reading pinned to the PostgreSQL dialect, shared by the validator
//! and the canonicalizer.

use sqlparser::ast::Statement;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlParseError {
    Tokenize(String),
    Parse(String),
}

impl std::fmt::Display for SqlParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlParseError::Tokenize(message) => write!(f, "malformed SQL: {}", message),
            SqlParseError::Parse(message) => write!(f, "unparseable SQL: {}", message),
        }
    }
}

impl std::error::Error for SqlParseError {}

/// Tokens with escapes left as written, so rendering them back gives
/// equivalent SQL.
pub(crate) fn tokenize(sql: &str) -> Result<Vec<Token>, SqlParseError> {
    Tokenizer::new(&PostgreSqlDialect {}, sql)
        .with_unescape(false)
        .tokenize()
        .map_err(|err| SqlParseError::Tokenize(err.to_string()))
}

pub(crate) fn parse(sql: &str) -> Result<Vec<Statement>, SqlParseError> {
    Parser::parse_sql(&PostgreSqlDialect {}, sql)
        .map_err(|err| SqlParseError::Parse(err.to_string()))
}
