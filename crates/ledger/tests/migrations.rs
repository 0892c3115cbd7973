use std::collections::BTreeMap;

use sqlx::Row;
use vba_contracts::{
    DecisionResult, EvidenceOutcome, EvidencePack, OutcomeStatus, PolicyDecision, ResultEvidence,
    SqlEvidence, UserAttributes,
};
use vba_ledger::{LedgerError, LedgerWriter};

fn test_db_url() -> Option<String> {
    std::env::var("VBA_TEST_DB_URL")
        .ok()
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn schema_db_url(base: &str, schema: &str) -> String {
    let separator = if base.contains('?') { "&" } else { "?" };
    format!("{base}{separator}options=-csearch_path%3D{schema}")
}

fn sample_pack(request_id: &str) -> EvidencePack {
    EvidencePack {
        request_id: request_id.to_string(),
        timestamp: "2024-05-01T00:00:00Z".to_string(),
        request_text: Some("complaints by product".to_string()),
        user_attributes: UserAttributes {
            role: "branch_manager".to_string(),
            region: "CA".to_string(),
            purpose: Some("reporting".to_string()),
        },
        outcome: EvidenceOutcome {
            status: OutcomeStatus::Completed,
            reason: "query allowed for role".to_string(),
        },
        policy_decision: Some(PolicyDecision {
            result: DecisionResult::Allow,
            reason: "query allowed for role".to_string(),
            constraints: Default::default(),
        }),
        export_allowed: false,
        metrics: Vec::new(),
        data_products: Vec::new(),
        data_quality: BTreeMap::new(),
        sql: SqlEvidence {
            final_sql: "SELECT 1".to_string(),
            canonical_sql: "SELECT 1".to_string(),
            sql_hash: "c".repeat(64),
        },
        results: ResultEvidence {
            row_count: 3,
            suppressed_count: 1,
        },
        lineage_event_id: None,
        export_artifact_path: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn migrations_enforce_append_only_tables() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping DB migration test; set VBA_TEST_DB_URL to enable");
        return;
    };

    let schema = format!("vba_test_{}", ulid::Ulid::new()).to_lowercase();

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(1)
        .connect(&db_url)
        .await
        .expect("DB connect should succeed");

    let create_schema = format!("CREATE SCHEMA {}", schema);
    sqlx::query(&create_schema)
        .execute(&pool)
        .await
        .expect("create schema should succeed");

    let set_search_path = format!("SET search_path TO {}", schema);
    sqlx::query(&set_search_path)
        .execute(&pool)
        .await
        .expect("set search_path should succeed");

    vba_ledger::migrate(&pool)
        .await
        .expect("migrations should apply");
    vba_ledger::migrate(&pool)
        .await
        .expect("migrations should be idempotent");

    sqlx::query(
        "INSERT INTO vba_evidence_packs (request_id, outcome, decision_result, sql_hash, pack_hash, pack_canonical, pack_json) VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind("r1")
    .bind("DENIED")
    .bind("DENY")
    .bind("")
    .bind("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa")
    .bind("{}")
    .bind(serde_json::json!({}))
    .execute(&pool)
    .await
    .expect("insert evidence pack should succeed");

    let update_err = sqlx::query("UPDATE vba_evidence_packs SET outcome = 'COMPLETED' WHERE request_id = $1")
        .bind("r1")
        .execute(&pool)
        .await
        .expect_err("update must be rejected for append-only tables");
    assert!(
        format!("{update_err:?}").contains("append-only table"),
        "expected append-only error for update, got: {update_err:?}"
    );

    let delete_err = sqlx::query("DELETE FROM vba_evidence_packs WHERE request_id = $1")
        .bind("r1")
        .execute(&pool)
        .await
        .expect_err("delete must be rejected for append-only tables");
    assert!(
        format!("{delete_err:?}").contains("append-only table"),
        "expected append-only error for delete, got: {delete_err:?}"
    );

    let truncate_err = sqlx::query("TRUNCATE vba_evidence_packs")
        .execute(&pool)
        .await
        .expect_err("truncate must be rejected for append-only tables");
    assert!(format!("{truncate_err:?}").contains("append-only table"));

    let drop_schema = format!("DROP SCHEMA {} CASCADE", schema);
    let _ = sqlx::query(&drop_schema).execute(&pool).await;

    pool.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn evidence_pack_hash_verifies_and_never_overwrites() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping ledger integrity test; set VBA_TEST_DB_URL to enable");
        return;
    };

    let schema = format!("vba_test_{}", ulid::Ulid::new()).to_lowercase();
    let schema_url = schema_db_url(&db_url, &schema);

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(1)
        .connect(&db_url)
        .await
        .expect("DB connect should succeed");

    let create_schema = format!("CREATE SCHEMA {}", schema);
    sqlx::query(&create_schema)
        .execute(&pool)
        .await
        .expect("create schema should succeed");

    let writer = LedgerWriter::connect_and_migrate(
        &schema_url,
        std::time::Duration::from_millis(500),
    )
    .await
    .expect("ledger writer init should succeed");

    let pack = sample_pack("req-42");
    let pack_hash = writer
        .insert_evidence_pack(&pack)
        .await
        .expect("insert should succeed");
    assert_eq!(pack_hash, pack.pack_hash());
    assert!(writer.contains("req-42").await.expect("contains"));

    let mut replay = sample_pack("req-42");
    replay.outcome.reason = "rewritten".to_string();
    let err = writer
        .insert_evidence_pack(&replay)
        .await
        .expect_err("duplicate request id must be rejected");
    assert!(matches!(err, LedgerError::AlreadyExists(ref id) if id == "req-42"));

    let verify_pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(1)
        .connect(&schema_url)
        .await
        .expect("DB connect should succeed");

    let row = sqlx::query(
        "SELECT pack_json, pack_hash, outcome FROM vba_evidence_packs WHERE request_id = $1",
    )
    .bind("req-42")
    .fetch_one(&verify_pool)
    .await
    .expect("fetch pack should succeed");

    let stored_json: serde_json::Value = row.try_get("pack_json").expect("pack_json should exist");
    let stored_hash: String = row.try_get("pack_hash").expect("pack_hash should exist");
    let outcome: String = row.try_get("outcome").expect("outcome should exist");

    assert_eq!(outcome, "COMPLETED");
    assert_eq!(
        stored_hash,
        vba_contracts::canonical::hash_canonical_json(&stored_json)
    );

    let loaded = writer
        .load_evidence_pack("req-42")
        .await
        .expect("load should succeed")
        .expect("pack should exist");
    assert_eq!(loaded.pack, pack);
    assert_eq!(loaded.pack_hash, pack_hash);
    assert!(
        writer
            .load_evidence_pack("missing")
            .await
            .expect("load should succeed")
            .is_none()
    );

    verify_pool.close().await;
    writer.close().await;

    let drop_schema = format!("DROP SCHEMA {} CASCADE", schema);
    let _ = sqlx::query(&drop_schema).execute(&pool).await;

    pool.close().await;
}
