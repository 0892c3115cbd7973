use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use vba_contracts::{
    Aggregation, DataProductTable, DimensionType, Sensitivity, TimeGrain, is_safe_identifier,
};

mod search;

pub use search::{CatalogEntry, SearchHit, tokenize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub data_product: String,
    pub sensitivity: Sensitivity,
    pub version: String,
    pub aggregation: Aggregation,
    #[serde(default)]
    pub column: Option<String>,
    #[serde(default)]
    pub denominator: Option<String>,
    /// Grains the metric may be reported at. Empty places no restriction.
    #[serde(default)]
    pub grains: Vec<TimeGrain>,
    #[serde(default)]
    pub requires_grain: bool,
    /// Dimensions the metric may be sliced by. Empty allows every product dimension.
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default)]
    pub synonyms: Vec<String>,
}

impl MetricDefinition {
    pub fn allows_dimension(&self, dimension_id: &str) -> bool {
        self.dimensions.is_empty() || self.dimensions.iter().any(|d| d == dimension_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DimensionDefinition {
    pub id: String,
    pub column: String,
    #[serde(rename = "type")]
    pub dimension_type: DimensionType,
    pub sensitivity: Sensitivity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeasureDefinition {
    pub column: String,
    pub sensitivity: Sensitivity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Freshness {
    pub max_age_hours: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataProductDefinition {
    pub id: DataProductTable,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub version: String,
    pub sensitivity: Sensitivity,
    #[serde(default)]
    pub time_column: Option<String>,
    #[serde(default)]
    pub region_column: Option<String>,
    pub freshness: Freshness,
    pub dimensions: Vec<DimensionDefinition>,
    #[serde(default)]
    pub measures: Vec<MeasureDefinition>,
}

impl DataProductDefinition {
    pub fn dimension(&self, id: &str) -> Option<&DimensionDefinition> {
        self.dimensions.iter().find(|d| d.id == id)
    }

    pub fn measure(&self, column: &str) -> Option<&MeasureDefinition> {
        self.measures.iter().find(|m| m.column == column)
    }

    fn declares_column(&self, column: &str) -> bool {
        self.dimensions.iter().any(|d| d.column == column)
            || self.measures.iter().any(|m| m.column == column)
    }
}

#[derive(Debug)]
pub enum CatalogError {
    Io {
        path: String,
        source: std::io::Error,
    },
    Parse(serde_json::Error),
    Duplicate {
        kind: &'static str,
        id: String,
    },
    UnknownReference {
        owner: String,
        kind: &'static str,
        id: String,
    },
    Invalid {
        id: String,
        reason: String,
    },
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatalogError::Io { path, source } => {
                write!(f, "failed to read catalog at {}: {}", path, source)
            }
            CatalogError::Parse(err) => write!(f, "malformed catalog definition: {}", err),
            CatalogError::Duplicate { kind, id } => write!(f, "duplicate {} id `{}`", kind, id),
            CatalogError::UnknownReference { owner, kind, id } => {
                write!(f, "`{}` references unknown {} `{}`", owner, kind, id)
            }
            CatalogError::Invalid { id, reason } => write!(f, "invalid entry `{}`: {}", id, reason),
        }
    }
}

impl std::error::Error for CatalogError {}

impl From<serde_json::Error> for CatalogError {
    fn from(value: serde_json::Error) -> Self {
        CatalogError::Parse(value)
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogFile {
    metrics: Vec<MetricDefinition>,
    data_products: Vec<DataProductDefinition>,
}

/// Immutable, validated set of metric and data-product definitions.
///
/// Definitions live in insertion-ordered arenas; ids index into them. Once
/// constructed nothing is mutated, so a `Catalog` is shared behind `Arc`
/// without locking.
#[derive(Debug, Clone)]
pub struct Catalog {
    metrics: Vec<MetricDefinition>,
    data_products: Vec<DataProductDefinition>,
    metric_index: HashMap<String, usize>,
    product_index: HashMap<String, usize>,
}

impl Catalog {
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = serde_json::from_str(raw)?;
        Self::from_definitions(file.metrics, file.data_products)
    }

    pub fn from_definitions(
        metrics: Vec<MetricDefinition>,
        data_products: Vec<DataProductDefinition>,
    ) -> Result<Self, CatalogError> {
        let mut product_index = HashMap::with_capacity(data_products.len());
        for (idx, product) in data_products.iter().enumerate() {
            let id = product.id.as_str().to_string();
            if product_index.insert(id.clone(), idx).is_some() {
                return Err(CatalogError::Duplicate {
                    kind: "data product",
                    id,
                });
            }
            validate_product(product)?;
        }

        let mut metric_index = HashMap::with_capacity(metrics.len());
        for (idx, metric) in metrics.iter().enumerate() {
            if metric_index.insert(metric.id.clone(), idx).is_some() {
                return Err(CatalogError::Duplicate {
                    kind: "metric",
                    id: metric.id.clone(),
                });
            }

            let product = product_index
                .get(&metric.data_product)
                .and_then(|idx| data_products.get(*idx))
                .ok_or_else(|| CatalogError::UnknownReference {
                    owner: metric.id.clone(),
                    kind: "data product",
                    id: metric.data_product.clone(),
                })?;
            validate_metric(metric, product)?;
        }

        Ok(Self {
            metrics,
            data_products,
            metric_index,
            product_index,
        })
    }

    pub fn metrics(&self) -> &[MetricDefinition] {
        &self.metrics
    }

    pub fn data_products(&self) -> &[DataProductDefinition] {
        &self.data_products
    }

    pub fn metric(&self, id: &str) -> Option<&MetricDefinition> {
        self.metric_index.get(id).and_then(|idx| self.metrics.get(*idx))
    }

    pub fn data_product(&self, id: &str) -> Option<&DataProductDefinition> {
        self.product_index
            .get(id)
            .and_then(|idx| self.data_products.get(*idx))
    }

    /// Resolves a metric by exact id, then by case-insensitive id or name.
    pub fn resolve_metric(&self, name: &str) -> Option<&MetricDefinition> {
        let name = name.trim();
        if let Some(metric) = self.metric(name) {
            return Some(metric);
        }
        self.metrics
            .iter()
            .find(|m| m.id.eq_ignore_ascii_case(name) || m.name.eq_ignore_ascii_case(name))
    }

    /// Every governed table the catalog knows about.
    pub fn table_allowlist(&self) -> BTreeSet<String> {
        self.data_products
            .iter()
            .map(|p| p.id.as_str().to_string())
            .collect()
    }
}

fn validate_product(product: &DataProductDefinition) -> Result<(), CatalogError> {
    let id = product.id.as_str();
    let invalid = |reason: String| CatalogError::Invalid {
        id: id.to_string(),
        reason,
    };

    if product.version.trim().is_empty() {
        return Err(invalid("version must be non-empty".to_string()));
    }

    let mut dimension_ids = HashSet::new();
    for dimension in &product.dimensions {
        if !dimension_ids.insert(dimension.id.as_str()) {
            return Err(CatalogError::Duplicate {
                kind: "dimension",
                id: format!("{}.{}", id, dimension.id),
            });
        }
        if !is_safe_identifier(&dimension.id) || !is_safe_identifier(&dimension.column) {
            return Err(invalid(format!(
                "dimension `{}` must use lowercase identifiers",
                dimension.id
            )));
        }
    }

    for measure in &product.measures {
        if !is_safe_identifier(&measure.column) {
            return Err(invalid(format!(
                "measure column `{}` must be a lowercase identifier",
                measure.column
            )));
        }
    }

    for (label, column) in [
        ("time_column", product.time_column.as_deref()),
        ("region_column", product.region_column.as_deref()),
    ] {
        if let Some(column) = column
            && !product.declares_column(column)
        {
            return Err(invalid(format!(
                "{} `{}` is not a declared dimension or measure",
                label, column
            )));
        }
    }

    Ok(())
}

fn validate_metric(
    metric: &MetricDefinition,
    product: &DataProductDefinition,
) -> Result<(), CatalogError> {
    let invalid = |reason: &str| CatalogError::Invalid {
        id: metric.id.clone(),
        reason: reason.to_string(),
    };

    if !is_safe_identifier(&metric.id) {
        return Err(invalid("metric id must be a lowercase identifier"));
    }
    if metric.version.trim().is_empty() {
        return Err(invalid("version must be non-empty"));
    }

    for column in [metric.column.as_deref(), metric.denominator.as_deref()]
        .into_iter()
        .flatten()
    {
        if product.measure(column).is_none() {
            return Err(CatalogError::UnknownReference {
                owner: metric.id.clone(),
                kind: "measure column",
                id: column.to_string(),
            });
        }
    }

    match metric.aggregation {
        Aggregation::Count => {}
        Aggregation::Sum | Aggregation::Avg if metric.column.is_none() => {
            return Err(invalid("sum/avg metrics need a measure column"));
        }
        Aggregation::Ratio if metric.column.is_none() || metric.denominator.is_none() => {
            return Err(invalid("ratio metrics need a column and a denominator"));
        }
        _ => {}
    }

    if metric.requires_grain && metric.grains.is_empty() {
        return Err(invalid("requires_grain is set but no grains are declared"));
    }
    if !metric.grains.is_empty() && product.time_column.is_none() {
        return Err(invalid("grains declared on a product without a time_column"));
    }

    for dimension in &metric.dimensions {
        if product.dimension(dimension).is_none() {
            return Err(CatalogError::UnknownReference {
                owner: metric.id.clone(),
                kind: "dimension",
                id: dimension.clone(),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BANKING: &str = include_str!("../../../catalog/banking.json");

    fn banking() -> Catalog {
        Catalog::from_json_str(BANKING).expect("bundled catalog should load")
    }

    #[test]
    fn bundled_catalog_loads_and_indexes_by_id() {
        let catalog = banking();
        let metric = catalog.metric("npa_ratio").expect("npa_ratio exists");
        assert_eq!(metric.aggregation, Aggregation::Ratio);
        assert_eq!(metric.sensitivity, Sensitivity::Med);

        let product = catalog
            .data_product("dp_complaints")
            .expect("dp_complaints exists");
        assert_eq!(
            product
                .dimension("consumer_narrative")
                .map(|d| d.dimension_type),
            Some(DimensionType::Narrative)
        );
        assert_eq!(
            catalog.table_allowlist().into_iter().collect::<Vec<_>>(),
            vec!["dp_call_reports".to_string(), "dp_complaints".to_string()]
        );
    }

    #[test]
    fn resolve_metric_falls_back_to_display_name() {
        let catalog = banking();
        assert_eq!(
            catalog.resolve_metric("Dispute Rate").map(|m| m.id.as_str()),
            Some("dispute_rate")
        );
        assert!(catalog.resolve_metric("churn").is_none());
    }

    #[test]
    fn duplicate_metric_id_is_fatal() {
        let mut value: serde_json::Value = serde_json::from_str(BANKING).expect("valid json");
        let first = value["metrics"][0].clone();
        value["metrics"]
            .as_array_mut()
            .expect("metrics array")
            .push(first);

        let err = Catalog::from_json_str(&value.to_string()).unwrap_err();
        assert!(matches!(err, CatalogError::Duplicate { kind: "metric", .. }));
    }

    #[test]
    fn metric_referencing_unknown_product_is_fatal() {
        let mut value: serde_json::Value = serde_json::from_str(BANKING).expect("valid json");
        value["metrics"][0]["data_product"] = serde_json::json!("dp_missing");

        let err = Catalog::from_json_str(&value.to_string()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "`complaint_count` references unknown data product `dp_missing`"
        );
    }

    #[test]
    fn product_without_approved_prefix_is_rejected_at_parse() {
        let mut value: serde_json::Value = serde_json::from_str(BANKING).expect("valid json");
        value["data_products"][0]["id"] = serde_json::json!("complaints_raw");

        let err = Catalog::from_json_str(&value.to_string()).unwrap_err();
        assert!(matches!(err, CatalogError::Parse(_)));
    }

    #[test]
    fn ratio_metric_requires_denominator() {
        let mut value: serde_json::Value = serde_json::from_str(BANKING).expect("valid json");
        let metrics = value["metrics"].as_array_mut().expect("metrics array");
        let npa = metrics
            .iter_mut()
            .find(|m| m["id"] == "npa_ratio")
            .expect("npa_ratio present");
        npa.as_object_mut()
            .expect("metric object")
            .remove("denominator");

        let err = Catalog::from_json_str(&value.to_string()).unwrap_err();
        assert!(err.to_string().contains("denominator"));
    }

    #[test]
    fn undeclared_region_column_is_rejected() {
        let mut value: serde_json::Value = serde_json::from_str(BANKING).expect("valid json");
        value["data_products"][1]["region_column"] = serde_json::json!("hq_state");

        let err = Catalog::from_json_str(&value.to_string()).unwrap_err();
        assert!(err.to_string().contains("region_column `hq_state`"));
    }
}
