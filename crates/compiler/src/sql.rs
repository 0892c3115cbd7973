use vba_catalog::Catalog;
use vba_contracts::{
    Aggregation, CompiledQuery, ConstraintSet, DimensionType, FilterOp, FilterValue,
    PlanDimension, PlanMetric, QueryPlan, REDACTED_TOKEN, Sensitivity, TimeGrain,
    is_safe_identifier,
};

use crate::canonical::{canonicalize_sql, sql_hash};
use crate::parse::SqlParseError;
use crate::validator::{SqlValidator, ValidationError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// A region filter applies but the product has no region column.
    RegionFilterUnsupported(String),
    MissingTimeColumn(String),
    UnsafeIdentifier(String),
    Validation(ValidationError),
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileError::RegionFilterUnsupported(product) => write!(
                f,
                "region filter required but `{}` has no region column",
                product
            ),
            CompileError::MissingTimeColumn(product) => {
                write!(f, "time bucketing required but `{}` has no time column", product)
            }
            CompileError::UnsafeIdentifier(ident) => write!(f, "unsafe identifier `{}`", ident),
            CompileError::Validation(err) => write!(f, "generated SQL failed validation: {}", err),
        }
    }
}

impl std::error::Error for CompileError {}

impl From<ValidationError> for CompileError {
    fn from(value: ValidationError) -> Self {
        CompileError::Validation(value)
    }
}

impl From<SqlParseError> for CompileError {
    fn from(value: SqlParseError) -> Self {
        CompileError::Validation(ValidationError::Parse(value))
    }
}

/// Compiles plans into constrained PostgreSQL. Output is deterministic:
/// the same plan and constraints always give byte-identical SQL.
#[derive(Debug, Clone)]
pub struct SqlCompiler {
    validator: SqlValidator,
}

impl SqlCompiler {
    pub fn new(validator: SqlValidator) -> Self {
        Self { validator }
    }

    pub fn for_catalog(catalog: &Catalog) -> Self {
        Self::new(SqlValidator::new(catalog.table_allowlist()))
    }

    pub fn validator(&self) -> &SqlValidator {
        &self.validator
    }

    pub fn compile(
        &self,
        plan: &QueryPlan,
        constraints: &ConstraintSet,
    ) -> Result<CompiledQuery, CompileError> {
        check_identifiers(plan)?;

        let table = plan.data_product.table.as_str();
        let min_group_size = constraints.effective_min_group_size();
        let required_grain = constraints.required_grain();

        let mut select_items = Vec::<String>::new();
        let mut group_exprs = Vec::<String>::new();
        let mut order_items = Vec::<String>::new();

        if let Some(grain) = plan
            .grain
            .map(|g| required_grain.map_or(g, |required| g.max(required)))
        {
            let time_column = plan
                .time_column
                .as_deref()
                .ok_or_else(|| CompileError::MissingTimeColumn(table.to_string()))?;
            let bucket = date_trunc(grain, time_column);
            select_items.push(format!("CAST(CAST({} AS DATE) AS TEXT) AS period", bucket));
            group_exprs.push(bucket);
            order_items.push("period".to_string());
        }

        for dimension in &plan.dimensions {
            if hides_dimension(dimension, constraints) {
                select_items.push(format!("'{}' AS {}", REDACTED_TOKEN, dimension.id));
                continue;
            }
            let expr = match (dimension.dimension_type, required_grain) {
                (DimensionType::Date, Some(grain)) => date_trunc(grain, &dimension.column),
                _ => dimension.column.clone(),
            };
            if dimension.dimension_type == DimensionType::Date && required_grain.is_some() {
                select_items.push(format!(
                    "CAST(CAST({} AS DATE) AS TEXT) AS {}",
                    expr, dimension.id
                ));
            } else {
                select_items.push(format!("CAST({} AS TEXT) AS {}", expr, dimension.id));
            }
            group_exprs.push(expr);
            order_items.push(dimension.id.clone());
        }

        for metric in &plan.metrics {
            select_items.push(format!("{} AS {}", metric_expr(metric), metric.id));
        }

        let predicates = where_predicates(plan, constraints)?;

        let mut filtered = String::new();
        filtered.push_str(" FROM ");
        filtered.push_str(table);
        if !predicates.is_empty() {
            filtered.push_str(" WHERE ");
            filtered.push_str(&predicates.join(" AND "));
        }
        if !group_exprs.is_empty() {
            filtered.push_str(" GROUP BY ");
            filtered.push_str(&group_exprs.join(", "));
        }

        let mut sql = String::new();
        sql.push_str("SELECT ");
        sql.push_str(&select_items.join(", "));
        sql.push_str(&filtered);
        sql.push_str(&format!(" HAVING COUNT(*) >= {}", min_group_size));
        if !order_items.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&order_items.join(", "));
        }
        if let Some(max_rows) = constraints.max_rows {
            sql.push_str(&format!(" LIMIT {}", max_rows));
        }

        let mut suppression_sql = String::new();
        suppression_sql.push_str("SELECT COUNT(*) AS suppressed_count FROM (SELECT 1");
        suppression_sql.push_str(&filtered);
        suppression_sql.push_str(&format!(
            " HAVING COUNT(*) < {}) AS suppressed_groups",
            min_group_size
        ));

        self.validator.validate(&sql)?;
        self.validator.validate(&suppression_sql)?;

        let canonical_sql = canonicalize_sql(&sql)?;
        let sql_hash = sql_hash(&canonical_sql);

        Ok(CompiledQuery {
            sql,
            canonical_sql,
            sql_hash,
            suppression_sql,
        })
    }
}

fn check_identifiers(plan: &QueryPlan) -> Result<(), CompileError> {
    let columns = plan
        .metrics
        .iter()
        .flat_map(|m| {
            [Some(m.id.as_str()), m.column.as_deref(), m.denominator.as_deref()]
                .into_iter()
                .flatten()
        })
        .chain(
            plan.dimensions
                .iter()
                .chain(plan.filters.iter().map(|f| &f.dimension))
                .flat_map(|d| [d.id.as_str(), d.column.as_str()]),
        )
        .chain(plan.time_column.as_deref())
        .chain(plan.region_column.as_deref());

    for ident in columns {
        if !is_safe_identifier(ident) {
            return Err(CompileError::UnsafeIdentifier(ident.to_string()));
        }
    }
    Ok(())
}

fn hides_dimension(dimension: &PlanDimension, constraints: &ConstraintSet) -> bool {
    let narrative = dimension.dimension_type == DimensionType::Narrative;
    (narrative && constraints.redacts_narratives())
        || (constraints.masks() && dimension.sensitivity == Sensitivity::High)
}

fn date_trunc(grain: TimeGrain, column: &str) -> String {
    format!("DATE_TRUNC('{}', {})", grain.as_str(), column)
}

fn as_double(expr: &str) -> String {
    format!("CAST({} AS DOUBLE PRECISION)", expr)
}

fn metric_expr(metric: &PlanMetric) -> String {
    let column = metric.column.as_deref();
    match (metric.aggregation, column) {
        (Aggregation::Count, None) => "COUNT(*)".to_string(),
        (Aggregation::Count, Some(column)) => format!("COUNT({})", column),
        (Aggregation::Sum, Some(column)) => as_double(&format!("SUM({})", column)),
        (Aggregation::Avg, Some(column)) => as_double(&format!("AVG({})", column)),
        (Aggregation::Ratio, Some(column)) => {
            let denominator = metric.denominator.as_deref().unwrap_or(column);
            format!(
                "{} / NULLIF({}, 0)",
                as_double(&format!("SUM({})", column)),
                as_double(&format!("SUM({})", denominator))
            )
        }
        // Catalog load rejects these; count rows rather than emit bad SQL.
        (Aggregation::Sum | Aggregation::Avg | Aggregation::Ratio, None) => {
            "COUNT(*)".to_string()
        }
    }
}

fn where_predicates(
    plan: &QueryPlan,
    constraints: &ConstraintSet,
) -> Result<Vec<String>, CompileError> {
    let mut predicates = Vec::new();

    if let Some(region) = constraints.region_filter.as_deref() {
        let column = plan.region_column.as_deref().ok_or_else(|| {
            CompileError::RegionFilterUnsupported(plan.data_product.id.clone())
        })?;
        predicates.push(format!("{} = {}", column, quote_literal(region)));
    }

    if let Some(range) = plan.time_range {
        let column = plan.time_column.as_deref().ok_or_else(|| {
            CompileError::MissingTimeColumn(plan.data_product.id.clone())
        })?;
        predicates.push(format!(
            "{} >= DATE '{}'",
            column,
            range.start.format("%Y-%m-%d")
        ));
        predicates.push(format!(
            "{} < DATE '{}'",
            column,
            range.end.format("%Y-%m-%d")
        ));
    }

    for filter in &plan.filters {
        let kind = filter.dimension.dimension_type;
        let rendered = match &filter.value {
            FilterValue::List(values) => format!(
                "({})",
                values
                    .iter()
                    .map(|v| scalar_literal(kind, v))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            FilterValue::Integer(n) => n.to_string(),
            FilterValue::Text(text) => scalar_literal(kind, text),
        };
        // Plans only carry list values with `in`; anything else compares as a set.
        let op = match (&filter.op, &filter.value) {
            (FilterOp::Ne, FilterValue::List(_)) => "NOT IN",
            (_, FilterValue::List(_)) => "IN",
            (op, _) => op.sql_operator(),
        };
        predicates.push(format!("{} {} {}", filter.dimension.column, op, rendered));
    }

    Ok(predicates)
}

fn scalar_literal(kind: DimensionType, value: &str) -> String {
    match kind {
        DimensionType::Integer => match value.trim().parse::<i64>() {
            Ok(n) => n.to_string(),
            Err(_) => quote_literal(value),
        },
        DimensionType::Date => format!("DATE {}", quote_literal(value)),
        DimensionType::Category | DimensionType::Narrative => quote_literal(value),
    }
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
