use std::collections::BTreeMap;

use vba_contracts::{
    CompiledQuery, EvidenceOutcome, EvidencePack, ExecutionResult, PolicyDecision, QualityStatus,
    QueryPlan, ResultEvidence, SqlEvidence, UserAttributes, VersionedRef,
};

/// Everything known about a request at the point it terminated. Stages
/// that never ran leave their field `None`.
#[derive(Debug, Clone)]
pub struct EvidenceInputs<'a> {
    pub request_id: &'a str,
    pub timestamp: String,
    pub request_text: Option<&'a str>,
    pub user: &'a UserAttributes,
    pub outcome: EvidenceOutcome,
    pub decision: Option<&'a PolicyDecision>,
    pub export_allowed: bool,
    pub plan: Option<&'a QueryPlan>,
    pub compiled: Option<&'a CompiledQuery>,
    pub execution: Option<&'a ExecutionResult>,
    pub quality: &'a BTreeMap<String, QualityStatus>,
    pub lineage_event_id: Option<String>,
    pub export_artifact_path: Option<String>,
}

/// Builds the evidence pack. A denied request never carries SQL, results,
/// lineage or export details, whatever the caller passes in.
pub fn assemble(inputs: EvidenceInputs<'_>) -> EvidencePack {
    let denied = inputs.decision.is_some_and(PolicyDecision::is_denied);

    let (metrics, data_products) = match inputs.plan {
        Some(plan) => (
            plan.metrics
                .iter()
                .map(|m| VersionedRef {
                    id: m.id.clone(),
                    version: m.version.clone(),
                })
                .collect(),
            vec![VersionedRef {
                id: plan.data_product.id.clone(),
                version: plan.data_product.version.clone(),
            }],
        ),
        None => (Vec::new(), Vec::new()),
    };

    let sql = match inputs.compiled {
        Some(compiled) if !denied => SqlEvidence {
            final_sql: compiled.sql.clone(),
            canonical_sql: compiled.canonical_sql.clone(),
            sql_hash: compiled.sql_hash.clone(),
        },
        _ => SqlEvidence::default(),
    };

    let results = match inputs.execution {
        Some(execution) if !denied => ResultEvidence {
            row_count: execution.row_count,
            suppressed_count: execution.suppressed_count,
        },
        _ => ResultEvidence::default(),
    };

    let export_allowed = inputs.export_allowed && inputs.decision.is_some() && !denied;

    EvidencePack {
        request_id: inputs.request_id.to_string(),
        timestamp: inputs.timestamp,
        request_text: inputs.request_text.map(str::to_string),
        user_attributes: inputs.user.clone(),
        outcome: inputs.outcome,
        policy_decision: inputs.decision.cloned(),
        export_allowed,
        metrics,
        data_products,
        data_quality: inputs.quality.clone(),
        sql,
        results,
        lineage_event_id: inputs.lineage_event_id.filter(|_| !denied),
        export_artifact_path: inputs
            .export_artifact_path
            .filter(|_| !denied && export_allowed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vba_contracts::{
        Aggregation, ConstraintSet, DataProductRef, DataProductTable, DecisionResult,
        OutcomeStatus, PlanMetric, Sensitivity,
    };

    fn user() -> UserAttributes {
        UserAttributes {
            role: "risk_officer".to_string(),
            region: "all".to_string(),
            purpose: Some("analysis".to_string()),
        }
    }

    fn plan() -> QueryPlan {
        QueryPlan {
            data_product: DataProductRef {
                id: "dp_call_reports".to_string(),
                version: "2.0.1".to_string(),
                sensitivity: Sensitivity::Med,
                table: DataProductTable::parse("dp_call_reports").expect("table"),
            },
            metrics: vec![PlanMetric {
                id: "deposits_sum".to_string(),
                version: "2.0.0".to_string(),
                sensitivity: Sensitivity::Low,
                aggregation: Aggregation::Sum,
                column: Some("total_deposits".to_string()),
                denominator: None,
            }],
            dimensions: Vec::new(),
            filters: Vec::new(),
            time_range: None,
            grain: None,
            time_column: Some("report_date".to_string()),
            region_column: Some("bank_region".to_string()),
        }
    }

    fn compiled() -> CompiledQuery {
        CompiledQuery {
            sql: "SELECT 1".to_string(),
            canonical_sql: "SELECT 1".to_string(),
            sql_hash: "a".repeat(64),
            suppression_sql: "SELECT 0".to_string(),
        }
    }

    fn execution() -> ExecutionResult {
        ExecutionResult {
            columns: vec!["deposits_sum".to_string()],
            rows: vec![vec![serde_json::json!(1.5)]],
            row_count: 1,
            suppressed_count: 2,
        }
    }

    fn inputs<'a>(
        user: &'a UserAttributes,
        decision: &'a PolicyDecision,
        plan: &'a QueryPlan,
        compiled: &'a CompiledQuery,
        execution: &'a ExecutionResult,
        quality: &'a BTreeMap<String, QualityStatus>,
        status: OutcomeStatus,
    ) -> EvidenceInputs<'a> {
        EvidenceInputs {
            request_id: "req-1",
            timestamp: "2024-05-01T00:00:00Z".to_string(),
            request_text: Some("total deposits"),
            user,
            outcome: EvidenceOutcome {
                status,
                reason: decision.reason.clone(),
            },
            decision: Some(decision),
            export_allowed: true,
            plan: Some(plan),
            compiled: Some(compiled),
            execution: Some(execution),
            quality,
            lineage_event_id: Some("evt-1".to_string()),
            export_artifact_path: Some("artifacts/exports/req-1.csv".to_string()),
        }
    }

    #[test]
    fn allowed_pack_carries_sql_counts_and_versions() {
        let user = user();
        let decision = PolicyDecision {
            result: DecisionResult::Allow,
            reason: "query allowed for role".to_string(),
            constraints: ConstraintSet::default(),
        };
        let (plan, compiled, execution) = (plan(), compiled(), execution());
        let quality = BTreeMap::new();

        let pack = assemble(inputs(
            &user,
            &decision,
            &plan,
            &compiled,
            &execution,
            &quality,
            OutcomeStatus::Completed,
        ));

        assert_eq!(pack.sql.final_sql, "SELECT 1");
        assert_eq!(
            pack.results,
            ResultEvidence {
                row_count: 1,
                suppressed_count: 2
            }
        );
        assert_eq!(pack.metrics[0].version, "2.0.0");
        assert_eq!(pack.data_products[0].id, "dp_call_reports");
        assert!(pack.export_allowed);
        assert_eq!(pack.lineage_event_id.as_deref(), Some("evt-1"));
    }

    #[test]
    fn denied_pack_drops_sql_and_results_even_when_supplied() {
        let user = user();
        let decision = PolicyDecision::deny("high sensitivity denied for this role");
        let (plan, compiled, execution) = (plan(), compiled(), execution());
        let quality = BTreeMap::new();

        let pack = assemble(inputs(
            &user,
            &decision,
            &plan,
            &compiled,
            &execution,
            &quality,
            OutcomeStatus::Denied,
        ));

        assert_eq!(pack.sql, SqlEvidence::default());
        assert_eq!(pack.results, ResultEvidence::default());
        assert!(!pack.export_allowed);
        assert_eq!(pack.lineage_event_id, None);
        assert_eq!(pack.export_artifact_path, None);
        assert_eq!(pack.outcome.reason, "high sensitivity denied for this role");
    }

    #[test]
    fn every_field_is_serialized() {
        let user = user();
        let quality = BTreeMap::new();
        let pack = assemble(EvidenceInputs {
            request_id: "req-2",
            timestamp: "2024-05-01T00:00:00Z".to_string(),
            request_text: None,
            user: &user,
            outcome: EvidenceOutcome {
                status: OutcomeStatus::PlanFailed,
                reason: "unknown metric `x`".to_string(),
            },
            decision: None,
            export_allowed: true,
            plan: None,
            compiled: None,
            execution: None,
            quality: &quality,
            lineage_event_id: None,
            export_artifact_path: None,
        });

        let value = pack.canonical_value();
        let keys = value
            .as_object()
            .expect("object")
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        assert_eq!(
            keys,
            vec![
                "data_products",
                "data_quality",
                "export_allowed",
                "export_artifact_path",
                "lineage_event_id",
                "metrics",
                "outcome",
                "policy_decision",
                "request_id",
                "request_text",
                "results",
                "sql",
                "timestamp",
                "user_attributes",
            ]
        );
        assert!(!pack.export_allowed);
    }

    #[test]
    fn identical_inputs_give_identical_bytes() {
        let user = user();
        let decision = PolicyDecision {
            result: DecisionResult::Allow,
            reason: "query allowed for role".to_string(),
            constraints: ConstraintSet::default(),
        };
        let (plan, compiled, execution) = (plan(), compiled(), execution());
        let mut quality = BTreeMap::new();
        quality.insert(
            "dp_call_reports".to_string(),
            QualityStatus {
                fresh: true,
                tests_passed: true,
                last_checked: Some("2024-04-30T00:00:00Z".to_string()),
                issues: Vec::new(),
            },
        );

        let a = assemble(inputs(
            &user,
            &decision,
            &plan,
            &compiled,
            &execution,
            &quality,
            OutcomeStatus::Completed,
        ));
        let b = assemble(inputs(
            &user,
            &decision,
            &plan,
            &compiled,
            &execution,
            &quality,
            OutcomeStatus::Completed,
        ));
        assert_eq!(a.canonical_bytes(), b.canonical_bytes());
        assert_eq!(a.pack_hash(), b.pack_hash());
    }
}
