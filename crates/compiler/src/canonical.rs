use sqlparser::ast::{BinaryOperator, Expr, GroupByExpr, SetExpr, Statement};
use sqlparser::tokenizer::{Token, Whitespace};
use vba_contracts::canonical::{normalize_text, sha256_hex};

use crate::parse::{SqlParseError, parse, tokenize};

/// Canonical text for hashing. Unquoted words are folded to lowercase and
/// the statement is re-rendered from its syntax tree, which drops comments,
/// collapses whitespace and uppercases keywords. The top-level `WHERE`
/// conjuncts and `GROUP BY` items are sorted.
pub fn canonicalize_sql(sql: &str) -> Result<String, SqlParseError> {
    let folded = tokenize(&normalize_text(sql))?
        .into_iter()
        .map(fold_token)
        .map(|token| token.to_string())
        .collect::<String>();

    let mut statements = parse(&folded)?;
    let mut statement = match statements.pop() {
        Some(statement) if statements.is_empty() => statement,
        _ => {
            return Err(SqlParseError::Parse(
                "expected exactly one statement".to_string(),
            ));
        }
    };

    if let Statement::Query(query) = &mut statement
        && let SetExpr::Select(select) = query.body.as_mut()
    {
        select.selection = select.selection.take().and_then(sort_conjuncts);
        if let GroupByExpr::Expressions(exprs, _) = &mut select.group_by {
            exprs.sort_by_cached_key(|expr| expr.to_string());
        }
    }

    Ok(statement.to_string())
}

pub fn sql_hash(canonical_sql: &str) -> String {
    sha256_hex(canonical_sql.as_bytes())
}

fn fold_token(token: Token) -> Token {
    match token {
        Token::Whitespace(_) => Token::Whitespace(Whitespace::Space),
        Token::Word(mut word) if word.quote_style.is_none() => {
            word.value = word.value.to_ascii_lowercase();
            Token::Word(word)
        }
        other => other,
    }
}

/// An `OR` at the top stays a single conjunct. Parenthesized groups come
/// back from the parser as `Expr::Nested`, so rebuilding with `AND` keeps
/// precedence.
fn sort_conjuncts(selection: Expr) -> Option<Expr> {
    let mut conjuncts = Vec::new();
    split_and(selection, &mut conjuncts);
    conjuncts.sort_by_cached_key(|expr| expr.to_string());
    conjuncts.into_iter().reduce(|left, right| Expr::BinaryOp {
        left: Box::new(left),
        op: BinaryOperator::And,
        right: Box::new(right),
    })
}

fn split_and(expr: Expr, out: &mut Vec<Expr>) {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            split_and(*left, out);
            split_and(*right, out);
        }
        other => out.push(other),
    }
}
