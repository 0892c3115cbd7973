use std::collections::BTreeSet;
use std::ops::ControlFlow;

use sqlparser::ast::{
    Expr, Ident, ObjectName, Query, SetExpr, Statement, TableFactor, Visit, Visitor,
};
use sqlparser::tokenizer::{Token, Whitespace};
use vba_contracts::DATA_PRODUCT_PREFIX;

use crate::parse::{SqlParseError, parse, tokenize};

/// Scalar functions the generator emits, plus a few pure helpers. Anything
/// else may reach server state (`table_to_xml`, `pg_read_file`, `set_config`).
const ALLOWED_FUNCTIONS: &[&str] = &[
    "abs",
    "avg",
    "coalesce",
    "count",
    "date_trunc",
    "greatest",
    "least",
    "lower",
    "max",
    "min",
    "nullif",
    "round",
    "sum",
    "upper",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    Empty,
    Parse(SqlParseError),
    Comment,
    MultipleStatements,
    NotSelect(String),
    ForbiddenClause(String),
    ForbiddenFunction(String),
    ForbiddenSymbol(String),
    ForbiddenRelation(String),
    TableNotAllowed(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Empty => write!(f, "empty SQL text"),
            ValidationError::Parse(err) => write!(f, "{}", err),
            ValidationError::Comment => write!(f, "SQL comments are not allowed"),
            ValidationError::MultipleStatements => write!(f, "multiple statements are not allowed"),
            ValidationError::NotSelect(word) => {
                write!(f, "only SELECT queries are allowed (found `{}`)", word)
            }
            ValidationError::ForbiddenClause(clause) => {
                write!(f, "forbidden SQL clause: {}", clause)
            }
            ValidationError::ForbiddenFunction(name) => {
                write!(f, "function `{}` is not allowed", name)
            }
            ValidationError::ForbiddenSymbol(symbol) => {
                write!(f, "forbidden symbol: {}", symbol)
            }
            ValidationError::ForbiddenRelation(relation) => {
                write!(f, "only plain tables and subqueries may appear in FROM: {}", relation)
            }
            ValidationError::TableNotAllowed(table) => write!(
                f,
                "table `{}` is not an allowed data product; only {}* tables are queryable",
                table, DATA_PRODUCT_PREFIX
            ),
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<SqlParseError> for ValidationError {
    fn from(value: SqlParseError) -> Self {
        ValidationError::Parse(value)
    }
}

/// Static safety check over final SQL text. Independent of the generator:
/// it is the last gate before anything reaches the engine.
#[derive(Debug, Clone)]
pub struct SqlValidator {
    allowed_tables: BTreeSet<String>,
}

impl SqlValidator {
    pub fn new<I, S>(allowed_tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_tables: allowed_tables
                .into_iter()
                .map(|t| t.into().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn allowed_tables(&self) -> &BTreeSet<String> {
        &self.allowed_tables
    }

    pub fn validate(&self, sql: &str) -> Result<(), ValidationError> {
        if sql.trim().is_empty() {
            return Err(ValidationError::Empty);
        }

        for token in tokenize(sql)? {
            match token {
                Token::Whitespace(
                    Whitespace::SingleLineComment { .. } | Whitespace::MultiLineComment(_),
                ) => return Err(ValidationError::Comment),
                Token::DollarQuotedString(_) => {
                    return Err(ValidationError::ForbiddenSymbol("$".to_string()));
                }
                Token::Placeholder(placeholder) => {
                    return Err(ValidationError::ForbiddenSymbol(placeholder));
                }
                _ => {}
            }
        }

        let statements = parse(sql)?;
        let statement = match statements.as_slice() {
            [] => return Err(ValidationError::Empty),
            [statement] => statement,
            _ => return Err(ValidationError::MultipleStatements),
        };
        if !matches!(statement, Statement::Query(_)) {
            return Err(ValidationError::NotSelect(leading_keyword(
                &statement.to_string(),
            )));
        }

        let mut guard = RelationGuard {
            allowed_tables: &self.allowed_tables,
            cte_scopes: Vec::new(),
        };
        match statement.visit(&mut guard) {
            ControlFlow::Break(err) => Err(err),
            ControlFlow::Continue(()) => Ok(()),
        }
    }
}

/// Walks every query in the statement, nested ones included. CTE names are
/// only visible inside the query that declares them.
struct RelationGuard<'a> {
    allowed_tables: &'a BTreeSet<String>,
    cte_scopes: Vec<BTreeSet<String>>,
}

impl RelationGuard<'_> {
    fn is_cte(&self, name: &str) -> bool {
        self.cte_scopes.iter().any(|scope| scope.contains(name))
    }
}

impl Visitor for RelationGuard<'_> {
    type Break = ValidationError;

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if !query.locks.is_empty() {
            return ControlFlow::Break(ValidationError::ForbiddenClause("FOR UPDATE".to_string()));
        }
        if let Err(err) = check_body(&query.body) {
            return ControlFlow::Break(err);
        }
        let names = query
            .with
            .as_ref()
            .map(|with| {
                with.cte_tables
                    .iter()
                    .map(|cte| ident_name(&cte.alias.name))
                    .collect()
            })
            .unwrap_or_default();
        self.cte_scopes.push(names);
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &Query) -> ControlFlow<Self::Break> {
        self.cte_scopes.pop();
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(&mut self, factor: &TableFactor) -> ControlFlow<Self::Break> {
        match factor {
            // `FROM read_csv('...')` and other table functions.
            TableFactor::Table { name, args: Some(_), .. } => {
                ControlFlow::Break(ValidationError::ForbiddenFunction(relation_name(name)))
            }
            TableFactor::Table { .. }
            | TableFactor::Derived { .. }
            | TableFactor::NestedJoin { .. } => ControlFlow::Continue(()),
            other => ControlFlow::Break(ValidationError::ForbiddenRelation(other.to_string())),
        }
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        let name = relation_name(relation);
        let unqualified = relation.0.len() == 1;
        if unqualified && self.is_cte(&name) {
            return ControlFlow::Continue(());
        }
        if !unqualified
            || !name.starts_with(DATA_PRODUCT_PREFIX)
            || !self.allowed_tables.contains(&name)
        {
            return ControlFlow::Break(ValidationError::TableNotAllowed(name));
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        if let Expr::Function(function) = expr {
            let name = function.name.to_string().to_ascii_lowercase();
            if function.name.0.len() != 1 || !ALLOWED_FUNCTIONS.contains(&name.as_str()) {
                return ControlFlow::Break(ValidationError::ForbiddenFunction(name));
            }
        }
        ControlFlow::Continue(())
    }
}

/// Only `SELECT` bodies, possibly combined with set operations. `TABLE x`
/// and data-modifying bodies are refused wherever they appear.
fn check_body(body: &SetExpr) -> Result<(), ValidationError> {
    match body {
        SetExpr::Select(select) => {
            if select.into.is_some() {
                return Err(ValidationError::ForbiddenClause("INTO".to_string()));
            }
            Ok(())
        }
        SetExpr::Query(_) => Ok(()),
        SetExpr::SetOperation { left, right, .. } => {
            check_body(left)?;
            check_body(right)
        }
        SetExpr::Table(_) => Err(ValidationError::ForbiddenClause("TABLE".to_string())),
        other => Err(ValidationError::ForbiddenClause(leading_keyword(
            &other.to_string(),
        ))),
    }
}

fn leading_keyword(rendered: &str) -> String {
    rendered
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase()
}

fn ident_name(ident: &Ident) -> String {
    if ident.quote_style.is_some() {
        ident.value.clone()
    } else {
        ident.value.to_ascii_lowercase()
    }
}

/// Single names are folded the way PostgreSQL folds them; qualified names
/// are kept whole so the error shows what was asked for.
fn relation_name(name: &ObjectName) -> String {
    let rendered = name.to_string();
    if name.0.len() != 1 {
        return rendered.to_ascii_lowercase();
    }
    match rendered
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
    {
        Some(inner) => inner.replace("\"\"", "\""),
        None => rendered.to_ascii_lowercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> SqlValidator {
        SqlValidator::new(["dp_complaints", "dp_call_reports"])
    }

    fn not_allowed(table: &str) -> Result<(), ValidationError> {
        Err(ValidationError::TableNotAllowed(table.to_string()))
    }

    #[test]
    fn accepts_plain_aggregate_queries() {
        let v = validator();
        v.validate("SELECT COUNT(*) AS n FROM dp_complaints WHERE region = 'CA'")
            .expect("valid");
        v.validate("select c.product from DP_COMPLAINTS c join dp_call_reports r on c.region = r.bank_region;")
            .expect("valid");
        v.validate("SELECT COUNT(*) FROM (SELECT 1 FROM dp_complaints GROUP BY product) AS g")
            .expect("valid");
        v.validate("SELECT EXTRACT(YEAR FROM date_received) FROM dp_complaints")
            .expect("valid");
        v.validate(
            "SELECT CAST(SUM(balance) AS DOUBLE PRECISION) / NULLIF(CAST(SUM(limit_amount) AS DOUBLE PRECISION), 0) AS utilization FROM dp_call_reports",
        )
        .expect("valid");
    }

    #[test]
    fn ctes_over_data_products_are_allowed() {
        let v = validator();
        v.validate("WITH recent AS (SELECT * FROM dp_complaints) SELECT COUNT(*) FROM recent")
            .expect("valid");
        v.validate(
            "SELECT product FROM dp_complaints UNION SELECT bank_region FROM dp_call_reports",
        )
        .expect("set operations over data products are fine");
    }

    #[test]
    fn rejects_structural_attacks() {
        let v = validator();
        assert_eq!(v.validate("   "), Err(ValidationError::Empty));
        assert_eq!(
            v.validate("SELECT 1 FROM dp_complaints; SELECT 2"),
            Err(ValidationError::MultipleStatements)
        );
        assert_eq!(v.validate("SELECT 1 -- sneaky"), Err(ValidationError::Comment));
        assert_eq!(v.validate("SELECT /* x */ 1"), Err(ValidationError::Comment));
        assert_eq!(
            v.validate("EXPLAIN SELECT 1"),
            Err(ValidationError::NotSelect("EXPLAIN".to_string()))
        );
        assert!(matches!(
            v.validate("SELECT 'x"),
            Err(ValidationError::Parse(SqlParseError::Tokenize(_)))
        ));
        assert!(matches!(
            v.validate("SELECT 1 FROM dp_complaints WHERE"),
            Err(ValidationError::Parse(_))
        ));
        assert_eq!(
            v.validate("SELECT $$x$$"),
            Err(ValidationError::ForbiddenSymbol("$".to_string()))
        );
    }

    #[test]
    fn rejects_writes_and_side_effecting_clauses() {
        let v = validator();
        assert!(
            v.validate("WITH x AS (DELETE FROM dp_complaints RETURNING *) SELECT * FROM x")
                .is_err()
        );
        assert_eq!(
            v.validate("SELECT * INTO backup FROM dp_complaints"),
            Err(ValidationError::ForbiddenClause("INTO".to_string()))
        );
        assert_eq!(
            v.validate("SELECT * FROM dp_complaints FOR UPDATE"),
            Err(ValidationError::ForbiddenClause("FOR UPDATE".to_string()))
        );
        assert!(matches!(
            v.validate("DELETE FROM dp_complaints"),
            Err(ValidationError::NotSelect(_))
        ));
    }

    #[test]
    fn only_allow_listed_functions_may_be_called() {
        let v = validator();
        assert_eq!(
            v.validate("SELECT * FROM read_csv('/etc/passwd')"),
            Err(ValidationError::ForbiddenFunction("read_csv".to_string()))
        );
        assert_eq!(
            v.validate("SELECT set_config('statement_timeout', '0', false)"),
            Err(ValidationError::ForbiddenFunction("set_config".to_string()))
        );
        assert_eq!(
            v.validate("SELECT COUNT(*) FROM dp_complaints, generate_series(1, 10)"),
            Err(ValidationError::ForbiddenFunction("generate_series".to_string()))
        );
        assert_eq!(
            v.validate("SELECT pg_catalog.count(*) FROM dp_complaints"),
            Err(ValidationError::ForbiddenFunction("pg_catalog.count".to_string()))
        );
    }

    #[test]
    fn functions_that_read_relations_by_name_are_rejected() {
        let v = validator();
        for (function, sql) in [
            ("table_to_xml", "SELECT table_to_xml('accounts', true, false, '') FROM dp_complaints"),
            ("query_to_xml", "SELECT query_to_xml('SELECT * FROM accounts', true, false, '')"),
            ("cursor_to_xml", "SELECT cursor_to_xml('c', 10, true, false, '')"),
            ("schema_to_xml", "SELECT schema_to_xml('public', true, false, '')"),
            ("database_to_xml", "SELECT database_to_xml(true, false, '')"),
            ("pg_read_file", "SELECT pg_read_file('/etc/passwd') FROM dp_complaints"),
        ] {
            assert_eq!(
                v.validate(sql),
                Err(ValidationError::ForbiddenFunction(function.to_string())),
                "{sql}"
            );
        }
    }

    #[test]
    fn keywords_inside_literals_are_ignored() {
        validator()
            .validate("SELECT COUNT(*) FROM dp_complaints WHERE issue = 'DROP TABLE; --'")
            .expect("literal text is data");
    }

    #[test]
    fn rejects_tables_outside_allow_list() {
        let v = validator();
        assert_eq!(v.validate("SELECT * FROM customers"), not_allowed("customers"));
        assert_eq!(
            v.validate("SELECT * FROM dp_complaints, accounts"),
            not_allowed("accounts")
        );
        assert_eq!(
            v.validate("SELECT * FROM dp_complaints c JOIN dp_secret s ON c.x = s.x"),
            not_allowed("dp_secret")
        );
        assert_eq!(
            v.validate("SELECT * FROM public.dp_complaints"),
            not_allowed("public.dp_complaints")
        );
        assert_eq!(v.validate("SELECT * FROM \"Accounts\""), not_allowed("Accounts"));
        assert_eq!(
            v.validate("SELECT * FROM (SELECT * FROM pg_catalog.pg_user) AS u"),
            not_allowed("pg_catalog.pg_user")
        );
    }

    #[test]
    fn table_statements_are_rejected_anywhere() {
        let v = validator();
        assert_eq!(
            v.validate("SELECT 1 FROM dp_complaints WHERE EXISTS (TABLE accounts)"),
            Err(ValidationError::ForbiddenClause("TABLE".to_string()))
        );
        assert!(v.validate("TABLE dp_complaints").is_err());
        assert_eq!(
            v.validate("SELECT product FROM dp_complaints UNION TABLE accounts"),
            Err(ValidationError::ForbiddenClause("TABLE".to_string()))
        );
    }

    #[test]
    fn nested_queries_cannot_reach_foreign_tables() {
        let v = validator();
        assert_eq!(
            v.validate("SELECT 1 FROM dp_complaints WHERE EXISTS (SELECT 1 FROM accounts)"),
            not_allowed("accounts")
        );
        assert_eq!(
            v.validate(
                "SELECT COUNT(*) FROM dp_complaints WHERE product IN (SELECT name FROM accounts)"
            ),
            not_allowed("accounts")
        );
        assert_eq!(
            v.validate("SELECT (SELECT MAX(balance) FROM accounts) FROM dp_complaints"),
            not_allowed("accounts")
        );
        assert_eq!(
            v.validate("SELECT product FROM dp_complaints UNION SELECT name FROM accounts"),
            not_allowed("accounts")
        );
        assert_eq!(
            v.validate(
                "SELECT product FROM dp_complaints EXCEPT SELECT product FROM (SELECT * FROM accounts) AS a"
            ),
            not_allowed("accounts")
        );
    }

    #[test]
    fn cte_bodies_and_scopes_are_checked() {
        let v = validator();
        assert_eq!(
            v.validate("WITH leak AS (SELECT * FROM accounts) SELECT COUNT(*) FROM leak"),
            not_allowed("accounts")
        );
        assert_eq!(
            v.validate(
                "WITH a AS (SELECT * FROM dp_complaints), b AS (SELECT * FROM customers) SELECT * FROM a"
            ),
            not_allowed("customers")
        );
        // A CTE named like a real table only shadows it inside its own query.
        assert_eq!(
            v.validate(
                "SELECT * FROM (WITH accounts AS (SELECT * FROM dp_complaints) SELECT * FROM accounts) AS s JOIN accounts a ON s.region = a.region"
            ),
            not_allowed("accounts")
        );
        v.validate(
            "WITH accounts AS (SELECT * FROM dp_complaints) SELECT COUNT(*) FROM accounts",
        )
        .expect("the CTE shadows the table name in its own query");
    }

    #[test]
    fn allow_listed_table_without_prefix_is_still_rejected() {
        let v = SqlValidator::new(["accounts"]);
        assert_eq!(v.validate("SELECT * FROM accounts"), not_allowed("accounts"));
    }
}
