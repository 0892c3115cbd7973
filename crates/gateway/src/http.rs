use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use ulid::Ulid;
use vba_catalog::Catalog;
use vba_contracts::{
    CandidateIntent, OutcomeStatus, PolicyDecision, PolicyOverrides, UserAttributes,
};
use vba_ledger::{EvidenceFileStore, EvidenceStore, LedgerError, LedgerWriter, PersistedPack};

use crate::config::{EvidenceStoreMode, GatewayConfig, QualitySource, StartupError};
use crate::engine::{ExecutionEngine, ExecutionError, PgExecutionEngine};
use crate::lineage::LineageSink;
use crate::pipeline::{Pipeline, PipelineError, PipelineFailure, PipelineRun, QueryRequest};
use crate::quality::QualityProvider;

const REQUEST_ID_HEADER: &str = "x-vba-request-id";
const SEARCH_DEFAULT_LIMIT: usize = 10;
const SEARCH_MAX_LIMIT: usize = 50;

pub struct AppState<E> {
    pipeline: Arc<Pipeline<E>>,
}

impl<E> Clone for AppState<E> {
    fn clone(&self) -> Self {
        Self {
            pipeline: self.pipeline.clone(),
        }
    }
}

type ApiError = (StatusCode, Json<ErrorResponse>);

pub async fn router(config: GatewayConfig) -> Result<Router, StartupError> {
    let catalog = Catalog::load(&config.catalog_path).map_err(|err| StartupError {
        code: "ERR_CATALOG_INVALID",
        message: format!(
            "failed to load catalog {}: {}",
            config.catalog_path.display(),
            err
        ),
    })?;

    let engine = PgExecutionEngine::connect(
        &config.db_url,
        config.execution_max_concurrency,
        config.execution_timeout(),
    )
    .await
    .map_err(|err| StartupError {
        code: "ERR_DB_UNAVAILABLE",
        message: format!("failed to initialize warehouse pool: {}", err),
    })?;

    let quality = match config.quality_source {
        QualitySource::PromoteStatus => QualityProvider::PromoteStatus {
            pool: engine.pool().clone(),
            timeout: Duration::from_secs(2),
        },
        QualitySource::Static => {
            let path = config
                .quality_status_path
                .as_deref()
                .ok_or_else(|| StartupError {
                    code: "ERR_MISSING_CONFIG",
                    message: "static quality source requires VBA_QUALITY_STATUS_PATH".to_string(),
                })?;
            QualityProvider::from_file(path).map_err(|err| StartupError {
                code: "ERR_QUALITY_STATUS_INVALID",
                message: err.to_string(),
            })?
        }
    };

    let lineage = LineageSink::from_config(&config.lineage).map_err(|err| StartupError {
        code: "ERR_INVALID_CONFIG",
        message: format!("failed to initialize lineage sink: {}", err),
    })?;

    let evidence = match config.evidence_store {
        EvidenceStoreMode::File => {
            let store = EvidenceFileStore::new(&config.evidence_dir);
            store.ensure_dir().map_err(|err| StartupError {
                code: "ERR_EVIDENCE_UNAVAILABLE",
                message: format!("failed to prepare evidence dir: {}", err),
            })?;
            EvidenceStore::Files(store)
        }
        EvidenceStoreMode::Postgres => EvidenceStore::Postgres(
            LedgerWriter::connect_and_migrate(&config.db_url, config.ledger_write_timeout())
                .await
                .map_err(|err| StartupError {
                    code: "ERR_LEDGER_UNAVAILABLE",
                    message: format!("failed to initialize ledger: {}", err),
                })?,
        ),
    };

    tracing::info!(
        metrics = catalog.metrics().len(),
        data_products = catalog.data_products().len(),
        evidence_store = evidence.backend(),
        "catalog loaded"
    );

    let pipeline = Pipeline::new(
        Arc::new(catalog),
        engine,
        quality,
        lineage,
        evidence,
        config.export_dir.clone(),
        config.execution_timeout(),
    );

    Ok(router_with_pipeline(Arc::new(pipeline)))
}

pub fn router_with_pipeline<E: ExecutionEngine>(pipeline: Arc<Pipeline<E>>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz::<E>))
        .route("/metrics", get(metrics))
        .route("/v1/queries", post(run_query::<E>))
        .route("/v1/catalog/search", get(search_catalog::<E>))
        .route("/v1/evidence/{request_id}", get(get_evidence::<E>))
        .with_state(AppState { pipeline })
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct ReadyzResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, bool>,
}

async fn readyz<E: ExecutionEngine>(State(state): State<AppState<E>>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();
    checks.insert("warehouse", state.pipeline.engine().ping().await.is_ok());
    checks.insert(
        "evidence_store",
        state.pipeline.evidence().ready().await.is_ok(),
    );

    let all_ready = checks.values().all(|ok| *ok);
    let status = if all_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyzResponse {
            status: if all_ready { "ready" } else { "not_ready" },
            checks,
        }),
    )
}

async fn metrics() -> impl IntoResponse {
    match crate::metrics::render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct QueryBody {
    #[serde(default)]
    request_id: Option<String>,
    user: UserAttributes,
    intent: CandidateIntent,
    #[serde(default)]
    overrides: PolicyOverrides,
    #[serde(default)]
    export: bool,
    #[serde(default)]
    policy_only: bool,
}

#[derive(Debug, Serialize)]
struct QueryResponse {
    request_id: String,
    outcome: OutcomeStatus,
    reason: String,
    decision: Option<PolicyDecision>,
    sql: String,
    sql_hash: String,
    columns: Vec<String>,
    rows: Vec<Vec<serde_json::Value>>,
    row_count: u64,
    suppressed_count: u64,
    export_allowed: bool,
    export_artifact_path: Option<String>,
    lineage_event_id: Option<String>,
    evidence_hash: String,
}

async fn run_query<E: ExecutionEngine>(
    State(state): State<AppState<E>>,
    headers: HeaderMap,
    body: Result<Json<QueryBody>, JsonRejection>,
) -> Response {
    let started = Instant::now();

    let result = match body {
        Ok(Json(body)) => {
            let request_id = body
                .request_id
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .and_then(sanitize_request_id)
                .unwrap_or_else(|| extract_request_id(&headers));

            let request = QueryRequest {
                request_id: request_id.clone(),
                user: body.user,
                intent: body.intent,
                overrides: body.overrides,
                export: body.export,
                policy_only: body.policy_only,
            };

            // Detached so a client disconnect cannot cancel evidence persistence.
            let pipeline = state.pipeline.clone();
            let outcome = match tokio::spawn(async move { pipeline.run(request).await }).await {
                Ok(Ok(run)) => run_response(run),
                Ok(Err(err)) => Err(pipeline_error_response(&err, &request_id)),
                Err(err) => {
                    tracing::error!(request_id = %request_id, error = %err, "pipeline task failed");
                    Err(json_error(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "ERR_INTERNAL",
                        "query pipeline failed".to_string(),
                        false,
                    ))
                }
            };
            outcome.map(|body| (request_id_header(&request_id), body))
        }
        Err(rejection) => Err(json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_JSON",
            rejection.body_text(),
            false,
        )),
    };

    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err((status, _)) => *status,
    };
    crate::metrics::observe_http_request("/v1/queries", "POST", status.as_u16(), started.elapsed());

    result.into_response()
}

fn run_response(run: PipelineRun) -> Result<Json<QueryResponse>, ApiError> {
    if let Some(failure) = &run.failure {
        let (status, code, message, retryable) = failure_status(failure);
        let mut err = json_error(status, code, message, retryable);
        err.1.0.detail = Some(serde_json::json!({
            "request_id": run.pack.request_id,
            "outcome": run.pack.outcome.status,
            "reason": run.pack.outcome.reason,
            "evidence_hash": run.pack_hash,
        }));
        return Err(err);
    }

    let execution = run.execution.unwrap_or_default();
    let pack = run.pack;
    Ok(Json(QueryResponse {
        request_id: pack.request_id,
        outcome: pack.outcome.status,
        reason: pack.outcome.reason,
        decision: pack.policy_decision,
        sql: pack.sql.final_sql,
        sql_hash: pack.sql.sql_hash,
        columns: execution.columns,
        rows: execution.rows,
        row_count: pack.results.row_count,
        suppressed_count: pack.results.suppressed_count,
        export_allowed: pack.export_allowed,
        export_artifact_path: pack.export_artifact_path,
        lineage_event_id: pack.lineage_event_id,
        evidence_hash: run.pack_hash,
    }))
}

fn failure_status(failure: &PipelineFailure) -> (StatusCode, &'static str, String, bool) {
    match failure {
        PipelineFailure::Plan(err) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            err.code(),
            err.to_string(),
            false,
        ),
        PipelineFailure::Denied(reason) => (
            StatusCode::FORBIDDEN,
            "ERR_POLICY_DENIED",
            reason.clone(),
            false,
        ),
        PipelineFailure::QualityGate(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "ERR_QUALITY_GATE",
            crate::pipeline::REASON_QUALITY_GATE.to_string(),
            true,
        ),
        PipelineFailure::Validation(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "ERR_SQL_VALIDATION",
            "generated SQL failed validation".to_string(),
            false,
        ),
        PipelineFailure::Execution(ExecutionError::Timeout) => (
            StatusCode::GATEWAY_TIMEOUT,
            "ERR_EXECUTION_TIMEOUT",
            ExecutionError::Timeout.to_string(),
            true,
        ),
        PipelineFailure::Execution(err) => (
            StatusCode::BAD_GATEWAY,
            "ERR_EXECUTION_FAILED",
            err.to_string(),
            err.retryable(),
        ),
    }
}

fn pipeline_error_response(err: &PipelineError, request_id: &str) -> ApiError {
    let mut response = match err {
        PipelineError::InvalidRequestId(_) => json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_REQUEST_ID",
            err.to_string(),
            false,
        ),
        PipelineError::DuplicateRequest(_) => json_error(
            StatusCode::CONFLICT,
            "ERR_DUPLICATE_REQUEST",
            err.to_string(),
            false,
        ),
        PipelineError::Evidence(_) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "ERR_EVIDENCE_UNAVAILABLE",
            "evidence could not be recorded; results withheld".to_string(),
            true,
        ),
    };
    response.1.0.detail = Some(serde_json::json!({ "request_id": request_id }));
    response
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    #[serde(default)]
    q: String,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct SearchHitBody {
    kind: &'static str,
    id: String,
    name: String,
    score: f64,
}

#[derive(Debug, Serialize)]
struct SearchResponse {
    query: String,
    hits: Vec<SearchHitBody>,
}

async fn search_catalog<E: ExecutionEngine>(
    State(state): State<AppState<E>>,
    Query(params): Query<SearchParams>,
) -> Json<SearchResponse> {
    let started = Instant::now();
    let limit = params
        .limit
        .unwrap_or(SEARCH_DEFAULT_LIMIT)
        .min(SEARCH_MAX_LIMIT);

    let hits = state
        .pipeline
        .catalog()
        .search(&params.q, limit)
        .into_iter()
        .map(|hit| SearchHitBody {
            kind: hit.entry.kind(),
            id: hit.entry.id().to_string(),
            name: hit.entry.name().to_string(),
            score: hit.score,
        })
        .collect();

    crate::metrics::observe_http_request("/v1/catalog/search", "GET", 200, started.elapsed());
    Json(SearchResponse {
        query: params.q,
        hits,
    })
}

async fn get_evidence<E: ExecutionEngine>(
    State(state): State<AppState<E>>,
    Path(request_id): Path<String>,
) -> Result<Json<PersistedPack>, ApiError> {
    let started = Instant::now();

    let result = if !vba_ledger::is_safe_id(&request_id) {
        Err(json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_REQUEST_ID",
            "request id contains unsupported characters".to_string(),
            false,
        ))
    } else {
        match state.pipeline.evidence().load(&request_id).await {
            Ok(Some(stored)) => Ok(Json(stored)),
            Ok(None) => Err(json_error(
                StatusCode::NOT_FOUND,
                "ERR_NOT_FOUND",
                format!("no evidence recorded for {}", request_id),
                false,
            )),
            Err(LedgerError::Corrupt(detail)) => {
                tracing::error!(request_id = %request_id, detail = %detail, "stored evidence failed verification");
                Err(json_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "ERR_EVIDENCE_CORRUPT",
                    "stored evidence failed hash verification".to_string(),
                    false,
                ))
            }
            Err(err) => Err(json_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "ERR_EVIDENCE_UNAVAILABLE",
                err.to_string(),
                true,
            )),
        }
    };

    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err((status, _)) => *status,
    };
    crate::metrics::observe_http_request("/v1/evidence", "GET", status.as_u16(), started.elapsed());
    result
}

fn request_id_header(request_id: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
    headers
}

fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .and_then(sanitize_request_id)
        .unwrap_or_else(|| Ulid::new().to_string())
}

fn sanitize_request_id(raw: &str) -> Option<String> {
    const MAX_LEN: usize = 64;
    let mut out = String::with_capacity(raw.len().min(MAX_LEN));

    for ch in raw.chars() {
        if out.len() >= MAX_LEN {
            break;
        }
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            out.push(ch);
        }
    }

    (!out.is_empty()).then_some(out)
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: String,
    message: String,
    retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

fn json_error(
    status: StatusCode,
    code: impl Into<String>,
    message: impl Into<String>,
    retryable: bool,
) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            code: code.into(),
            message: message.into(),
            retryable,
            detail: None,
        }),
    )
}
