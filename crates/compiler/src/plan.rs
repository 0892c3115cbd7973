use std::collections::BTreeSet;

use chrono::NaiveDate;
use vba_catalog::{Catalog, DataProductDefinition, DimensionDefinition, MetricDefinition};
use vba_contracts::{
    CandidateIntent, DataProductRef, DimensionType, FilterOp, FilterPredicate, FilterValue,
    PlanDimension, PlanFilter, PlanMetric, QueryPlan, TimeGrain,
};

const ALL_GRAINS: [TimeGrain; 4] = [
    TimeGrain::Day,
    TimeGrain::Month,
    TimeGrain::Quarter,
    TimeGrain::Year,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    UnknownMetric(String),
    UnknownDimension(String),
    AmbiguousGrain(String),
    MixedDataProducts { first: String, second: String },
    DimensionNotAllowed { metric: String, dimension: String },
    InvalidFilter { field: String, reason: String },
    NoTimeColumn(String),
}

impl PlanError {
    pub fn code(&self) -> &'static str {
        match self {
            PlanError::UnknownMetric(_) => "ERR_UNKNOWN_METRIC",
            PlanError::UnknownDimension(_) => "ERR_UNKNOWN_DIMENSION",
            PlanError::AmbiguousGrain(_) => "ERR_AMBIGUOUS_GRAIN",
            PlanError::MixedDataProducts { .. } => "ERR_MIXED_DATA_PRODUCTS",
            PlanError::DimensionNotAllowed { .. } => "ERR_DIMENSION_NOT_ALLOWED",
            PlanError::InvalidFilter { .. } => "ERR_INVALID_FILTER",
            PlanError::NoTimeColumn(_) => "ERR_NO_TIME_COLUMN",
        }
    }
}

impl std::fmt::Display for PlanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanError::UnknownMetric(name) => write!(f, "unknown metric `{}`", name),
            PlanError::UnknownDimension(name) => write!(f, "unknown dimension `{}`", name),
            PlanError::AmbiguousGrain(reason) => write!(f, "ambiguous grain: {}", reason),
            PlanError::MixedDataProducts { first, second } => write!(
                f,
                "metrics span more than one data product (`{}` and `{}`)",
                first, second
            ),
            PlanError::DimensionNotAllowed { metric, dimension } => write!(
                f,
                "metric `{}` cannot be sliced by `{}`",
                metric, dimension
            ),
            PlanError::InvalidFilter { field, reason } => {
                write!(f, "invalid filter on `{}`: {}", field, reason)
            }
            PlanError::NoTimeColumn(product) => {
                write!(f, "data product `{}` has no time column", product)
            }
        }
    }
}

impl std::error::Error for PlanError {}

/// Resolves a candidate intent against the catalog.
///
/// When the grain is under-specified the most aggregated valid grain wins,
/// and a requested grain a metric cannot serve is coarsened, never refined.
pub fn build_plan(intent: &CandidateIntent, catalog: &Catalog) -> Result<QueryPlan, PlanError> {
    let metrics = resolve_metrics(intent, catalog)?;
    let product = single_product(&metrics, catalog)?;

    let mut dimensions = Vec::<&DimensionDefinition>::new();
    for raw in &intent.dimensions {
        let dimension = resolve_dimension(product, raw)?;
        for metric in &metrics {
            if !metric.allows_dimension(&dimension.id) {
                return Err(PlanError::DimensionNotAllowed {
                    metric: metric.id.clone(),
                    dimension: dimension.id.clone(),
                });
            }
        }
        if !dimensions.iter().any(|d| d.id == dimension.id) {
            dimensions.push(dimension);
        }
    }

    let filters = intent
        .filters
        .iter()
        .map(|predicate| resolve_filter(product, predicate))
        .collect::<Result<Vec<_>, _>>()?;

    if let Some(range) = intent.time_range {
        if product.time_column.is_none() {
            return Err(PlanError::NoTimeColumn(product.id.to_string()));
        }
        if range.start >= range.end {
            return Err(PlanError::InvalidFilter {
                field: "time_range".to_string(),
                reason: "start must be before end".to_string(),
            });
        }
    }

    let grain = choose_grain(intent.grain, &metrics, product)?;

    Ok(QueryPlan {
        data_product: DataProductRef {
            id: product.id.to_string(),
            version: product.version.clone(),
            sensitivity: product.sensitivity,
            table: product.id.clone(),
        },
        metrics: metrics
            .iter()
            .map(|m| PlanMetric {
                id: m.id.clone(),
                version: m.version.clone(),
                sensitivity: m.sensitivity,
                aggregation: m.aggregation,
                column: m.column.clone(),
                denominator: m.denominator.clone(),
            })
            .collect(),
        dimensions: dimensions.into_iter().map(plan_dimension).collect(),
        filters,
        time_range: intent.time_range,
        grain,
        time_column: product.time_column.clone(),
        region_column: product.region_column.clone(),
    })
}

fn resolve_metrics<'a>(
    intent: &CandidateIntent,
    catalog: &'a Catalog,
) -> Result<Vec<&'a MetricDefinition>, PlanError> {
    if intent.metrics.is_empty() {
        let question = intent.question.as_deref().unwrap_or("").trim();
        return catalog
            .suggested_metric(question)
            .map(|metric| vec![metric])
            .ok_or_else(|| PlanError::UnknownMetric(question.to_string()));
    }

    let mut out = Vec::<&MetricDefinition>::with_capacity(intent.metrics.len());
    for raw in &intent.metrics {
        let metric = catalog
            .resolve_metric(raw)
            .ok_or_else(|| PlanError::UnknownMetric(raw.trim().to_string()))?;
        if !out.iter().any(|m| m.id == metric.id) {
            out.push(metric);
        }
    }
    Ok(out)
}

fn single_product<'a>(
    metrics: &[&MetricDefinition],
    catalog: &'a Catalog,
) -> Result<&'a DataProductDefinition, PlanError> {
    let first = metrics
        .first()
        .ok_or_else(|| PlanError::UnknownMetric(String::new()))?;
    if let Some(other) = metrics.iter().find(|m| m.data_product != first.data_product) {
        return Err(PlanError::MixedDataProducts {
            first: first.data_product.clone(),
            second: other.data_product.clone(),
        });
    }
    // Catalog load guarantees every metric's product exists.
    catalog
        .data_product(&first.data_product)
        .ok_or_else(|| PlanError::UnknownMetric(first.id.clone()))
}

fn resolve_dimension<'a>(
    product: &'a DataProductDefinition,
    raw: &str,
) -> Result<&'a DimensionDefinition, PlanError> {
    let name = raw.trim();
    product
        .dimension(name)
        .or_else(|| {
            product
                .dimensions
                .iter()
                .find(|d| d.id.eq_ignore_ascii_case(name))
        })
        .ok_or_else(|| PlanError::UnknownDimension(name.to_string()))
}

fn plan_dimension(dimension: &DimensionDefinition) -> PlanDimension {
    PlanDimension {
        id: dimension.id.clone(),
        column: dimension.column.clone(),
        dimension_type: dimension.dimension_type,
        sensitivity: dimension.sensitivity,
    }
}

fn resolve_filter(
    product: &DataProductDefinition,
    predicate: &FilterPredicate,
) -> Result<PlanFilter, PlanError> {
    let dimension = resolve_dimension(product, &predicate.field)?;
    let invalid = |reason: &str| PlanError::InvalidFilter {
        field: dimension.id.clone(),
        reason: reason.to_string(),
    };

    let ordered = matches!(
        predicate.op,
        FilterOp::Gt | FilterOp::Gte | FilterOp::Lt | FilterOp::Lte
    );
    if ordered
        && !matches!(
            dimension.dimension_type,
            DimensionType::Date | DimensionType::Integer
        )
    {
        return Err(invalid("ordering operators need a date or integer field"));
    }

    match (&predicate.op, &predicate.value) {
        (FilterOp::In, FilterValue::List(values)) => {
            if values.is_empty() {
                return Err(invalid("`in` needs at least one value"));
            }
            for value in values {
                check_scalar(dimension.dimension_type, value).map_err(invalid)?;
            }
        }
        (FilterOp::In, _) => return Err(invalid("`in` needs a list value")),
        (_, FilterValue::List(_)) => return Err(invalid("list values need the `in` operator")),
        (_, FilterValue::Integer(_)) => {
            if dimension.dimension_type != DimensionType::Integer {
                return Err(invalid("integer values need an integer field"));
            }
        }
        (_, FilterValue::Text(value)) => {
            if dimension.dimension_type == DimensionType::Integer {
                return Err(invalid("integer fields need an integer value"));
            }
            check_scalar(dimension.dimension_type, value).map_err(invalid)?;
        }
    }

    Ok(PlanFilter {
        dimension: plan_dimension(dimension),
        op: predicate.op,
        value: predicate.value.clone(),
    })
}

fn check_scalar(kind: DimensionType, value: &str) -> Result<(), &'static str> {
    match kind {
        DimensionType::Date => NaiveDate::parse_from_str(value, "%Y-%m-%d")
            .map(|_| ())
            .map_err(|_| "dates must be YYYY-MM-DD"),
        DimensionType::Integer => value
            .parse::<i64>()
            .map(|_| ())
            .map_err(|_| "integer fields need integer values"),
        DimensionType::Category | DimensionType::Narrative => Ok(()),
    }
}

fn choose_grain(
    requested: Option<TimeGrain>,
    metrics: &[&MetricDefinition],
    product: &DataProductDefinition,
) -> Result<Option<TimeGrain>, PlanError> {
    let requires_grain = metrics.iter().any(|m| m.requires_grain);
    if requested.is_none() && !requires_grain {
        return Ok(None);
    }
    if product.time_column.is_none() {
        return Err(PlanError::NoTimeColumn(product.id.to_string()));
    }

    let mut valid = ALL_GRAINS.into_iter().collect::<BTreeSet<_>>();
    for metric in metrics.iter().filter(|m| !m.grains.is_empty()) {
        valid.retain(|g| metric.grains.contains(g));
    }

    match requested {
        Some(grain) if valid.contains(&grain) => Ok(Some(grain)),
        Some(grain) => valid
            .range(grain..)
            .next()
            .copied()
            .map(Some)
            .ok_or_else(|| {
                PlanError::AmbiguousGrain(format!(
                    "no valid grain at or above `{}` for the requested metrics",
                    grain.as_str()
                ))
            }),
        None => valid.last().copied().map(Some).ok_or_else(|| {
            PlanError::AmbiguousGrain(
                "the requested metrics share no reporting grain".to_string(),
            )
        }),
    }
}
