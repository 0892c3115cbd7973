use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub mod canonical;

/// Region value that means "no regional scoping".
pub const REGION_ALL: &str = "all";

/// Literal substituted for narrative and masked columns in compiled SQL.
pub const REDACTED_TOKEN: &str = "[REDACTED]";

/// Prefix every governed data-product table carries.
pub const DATA_PRODUCT_PREFIX: &str = "dp_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Sensitivity {
    Low,
    Med,
    High,
}

impl Sensitivity {
    pub fn as_str(self) -> &'static str {
        match self {
            Sensitivity::Low => "LOW",
            Sensitivity::Med => "MED",
            Sensitivity::High => "HIGH",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    BranchManager,
    RiskOfficer,
    ComplianceOfficer,
    Auditor,
    DataAnalyst,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::BranchManager,
        Role::RiskOfficer,
        Role::ComplianceOfficer,
        Role::Auditor,
        Role::DataAnalyst,
    ];

    pub fn parse(raw: &str) -> Option<Role> {
        match raw.trim() {
            "branch_manager" => Some(Role::BranchManager),
            "risk_officer" => Some(Role::RiskOfficer),
            "compliance_officer" => Some(Role::ComplianceOfficer),
            "auditor" => Some(Role::Auditor),
            "data_analyst" => Some(Role::DataAnalyst),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::BranchManager => "branch_manager",
            Role::RiskOfficer => "risk_officer",
            Role::ComplianceOfficer => "compliance_officer",
            Role::Auditor => "auditor",
            Role::DataAnalyst => "data_analyst",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    Reporting,
    Regulatory,
    Investigation,
    Analysis,
}

impl Purpose {
    pub fn parse(raw: &str) -> Option<Purpose> {
        match raw.trim() {
            "reporting" => Some(Purpose::Reporting),
            "regulatory" => Some(Purpose::Regulatory),
            "investigation" => Some(Purpose::Investigation),
            "analysis" => Some(Purpose::Analysis),
            _ => None,
        }
    }
}

/// Already-authenticated caller attributes. Kept as raw strings so the
/// evidence pack records exactly what was supplied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserAttributes {
    pub role: String,
    pub region: String,
    #[serde(default)]
    pub purpose: Option<String>,
}

impl UserAttributes {
    pub fn role(&self) -> Option<Role> {
        Role::parse(&self.role)
    }

    pub fn purpose(&self) -> Option<Purpose> {
        self.purpose.as_deref().and_then(Purpose::parse)
    }

    pub fn is_all_regions(&self) -> bool {
        self.region.trim().eq_ignore_ascii_case(REGION_ALL)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeGrain {
    Day,
    Month,
    Quarter,
    Year,
}

impl TimeGrain {
    pub fn as_str(self) -> &'static str {
        match self {
            TimeGrain::Day => "day",
            TimeGrain::Month => "month",
            TimeGrain::Quarter => "quarter",
            TimeGrain::Year => "year",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Count,
    Sum,
    Avg,
    Ratio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionType {
    Category,
    /// Free text. Never grouped on once redaction applies.
    Narrative,
    Date,
    Integer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
}

impl FilterOp {
    pub fn sql_operator(self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Ne => "<>",
            FilterOp::Gt => ">",
            FilterOp::Gte => ">=",
            FilterOp::Lt => "<",
            FilterOp::Lte => "<=",
            FilterOp::In => "IN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Integer(i64),
    Text(String),
    List(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterPredicate {
    pub field: String,
    pub op: FilterOp,
    pub value: FilterValue,
}

/// Half-open date interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Structured request handed over by the upstream intent interpreter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CandidateIntent {
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub metrics: Vec<String>,
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default)]
    pub filters: Vec<FilterPredicate>,
    #[serde(default)]
    pub time_range: Option<TimeRange>,
    #[serde(default)]
    pub grain: Option<TimeGrain>,
}

/// A table name that is guaranteed to be a governed data product.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DataProductTable(String);

impl DataProductTable {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        if !raw.starts_with(DATA_PRODUCT_PREFIX) || raw.len() == DATA_PRODUCT_PREFIX.len() {
            return Err(format!(
                "table `{}` is not a data product (expected `{}` prefix)",
                raw, DATA_PRODUCT_PREFIX
            ));
        }
        if !is_safe_identifier(raw) {
            return Err(format!("table `{}` is not a safe identifier", raw));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DataProductTable {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        DataProductTable::parse(&value)
    }
}

impl From<DataProductTable> for String {
    fn from(value: DataProductTable) -> Self {
        value.0
    }
}

impl std::fmt::Display for DataProductTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase SQL identifier: `[a-z_][a-z0-9_]*`, at most 63 bytes.
pub fn is_safe_identifier(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    if bytes.is_empty() || bytes.len() > 63 {
        return false;
    }
    if !matches!(bytes[0], b'a'..=b'z' | b'_') {
        return false;
    }
    bytes
        .iter()
        .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'_'))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataProductRef {
    pub id: String,
    pub version: String,
    pub sensitivity: Sensitivity,
    pub table: DataProductTable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanMetric {
    pub id: String,
    pub version: String,
    pub sensitivity: Sensitivity,
    pub aggregation: Aggregation,
    pub column: Option<String>,
    pub denominator: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanDimension {
    pub id: String,
    pub column: String,
    pub dimension_type: DimensionType,
    pub sensitivity: Sensitivity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanFilter {
    pub dimension: PlanDimension,
    pub op: FilterOp,
    pub value: FilterValue,
}

/// Fully resolved query plan. Everything the compiler needs is carried here,
/// so compilation never consults the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub data_product: DataProductRef,
    pub metrics: Vec<PlanMetric>,
    pub dimensions: Vec<PlanDimension>,
    pub filters: Vec<PlanFilter>,
    pub time_range: Option<TimeRange>,
    pub grain: Option<TimeGrain>,
    pub time_column: Option<String>,
    pub region_column: Option<String>,
}

impl QueryPlan {
    pub fn metric_ids(&self) -> Vec<&str> {
        self.metrics.iter().map(|m| m.id.as_str()).collect()
    }

    pub fn dimension_ids(&self) -> Vec<&str> {
        self.dimensions.iter().map(|d| d.id.as_str()).collect()
    }

    /// Highest tier referenced by any metric, dimension or filtered field.
    pub fn sensitivity(&self) -> Sensitivity {
        self.metrics
            .iter()
            .map(|m| m.sensitivity)
            .chain(self.dimensions.iter().map(|d| d.sensitivity))
            .chain(self.filters.iter().map(|f| f.dimension.sensitivity))
            .max()
            .unwrap_or(Sensitivity::Low)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionResult {
    Allow,
    Deny,
    AllowWithConstraints,
}

impl DecisionResult {
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionResult::Allow => "ALLOW",
            DecisionResult::Deny => "DENY",
            DecisionResult::AllowWithConstraints => "ALLOW_WITH_CONSTRAINTS",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_group_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub must_mask: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub must_redact_narratives: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub must_log_access: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rows: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forbid_export: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub must_aggregate_to_month: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub must_aggregate_to_quarter: Option<bool>,
}

impl ConstraintSet {
    pub const DEFAULT_MIN_GROUP_SIZE: u32 = 10;

    pub fn is_empty(&self) -> bool {
        self == &ConstraintSet::default()
    }

    pub fn effective_min_group_size(&self) -> u32 {
        self.min_group_size
            .unwrap_or(Self::DEFAULT_MIN_GROUP_SIZE)
            .max(1)
    }

    pub fn masks(&self) -> bool {
        self.must_mask.unwrap_or(false)
    }

    pub fn redacts_narratives(&self) -> bool {
        self.must_redact_narratives.unwrap_or(false) || self.masks()
    }

    pub fn logs_access(&self) -> bool {
        self.must_log_access.unwrap_or(false)
    }

    pub fn forbids_export(&self) -> bool {
        self.forbid_export.unwrap_or(false)
    }

    /// Coarsest grain the purpose constraints demand, if any.
    pub fn required_grain(&self) -> Option<TimeGrain> {
        if self.must_aggregate_to_quarter.unwrap_or(false) {
            Some(TimeGrain::Quarter)
        } else if self.must_aggregate_to_month.unwrap_or(false) {
            Some(TimeGrain::Month)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub result: DecisionResult,
    pub reason: String,
    pub constraints: ConstraintSet,
}

impl PolicyDecision {
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            result: DecisionResult::Deny,
            reason: reason.into(),
            constraints: ConstraintSet::default(),
        }
    }

    pub fn is_denied(&self) -> bool {
        self.result == DecisionResult::Deny
    }
}

/// Caller-supplied forced constraints, applied after role and purpose layers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyOverrides {
    pub min_group_size: Option<u32>,
    pub forbid_export: bool,
    pub mask: bool,
    pub redact: bool,
    pub max_rows: Option<u32>,
    pub force_region_match: bool,
    pub region: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledQuery {
    pub sql: String,
    pub canonical_sql: String,
    pub sql_hash: String,
    pub suppression_sql: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub row_count: u64,
    pub suppressed_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityStatus {
    pub fresh: bool,
    pub tests_passed: bool,
    pub last_checked: Option<String>,
    #[serde(default)]
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeStatus {
    Completed,
    PolicyOnly,
    PlanFailed,
    Denied,
    QualityGateFailed,
    ValidationFailed,
    ExecutionFailed,
}

impl OutcomeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeStatus::Completed => "COMPLETED",
            OutcomeStatus::PolicyOnly => "POLICY_ONLY",
            OutcomeStatus::PlanFailed => "PLAN_FAILED",
            OutcomeStatus::Denied => "DENIED",
            OutcomeStatus::QualityGateFailed => "QUALITY_GATE_FAILED",
            OutcomeStatus::ValidationFailed => "VALIDATION_FAILED",
            OutcomeStatus::ExecutionFailed => "EXECUTION_FAILED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceOutcome {
    pub status: OutcomeStatus,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VersionedRef {
    pub id: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlEvidence {
    pub final_sql: String,
    pub canonical_sql: String,
    pub sql_hash: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultEvidence {
    pub row_count: u64,
    pub suppressed_count: u64,
}

/// Immutable audit record, one per request. Optional fields serialize as
/// `null` rather than being omitted so every pack has the same key set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvidencePack {
    pub request_id: String,
    pub timestamp: String,
    pub request_text: Option<String>,
    pub user_attributes: UserAttributes,
    pub outcome: EvidenceOutcome,
    pub policy_decision: Option<PolicyDecision>,
    pub export_allowed: bool,
    pub metrics: Vec<VersionedRef>,
    pub data_products: Vec<VersionedRef>,
    pub data_quality: BTreeMap<String, QualityStatus>,
    pub sql: SqlEvidence,
    pub results: ResultEvidence,
    pub lineage_event_id: Option<String>,
    pub export_artifact_path: Option<String>,
}

impl EvidencePack {
    pub fn canonical_value(&self) -> serde_json::Value {
        let value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        canonical::canonicalize_json_value(&value)
    }

    pub fn canonical_bytes(&self) -> Vec<u8> {
        canonical::canonical_json_bytes(&self.canonical_value())
    }

    pub fn pack_hash(&self) -> String {
        canonical::sha256_hex(&self.canonical_bytes())
    }
}
