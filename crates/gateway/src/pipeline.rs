use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::Instrument;
use vba_catalog::Catalog;
use vba_compiler::{CompileError, PlanError, SqlCompiler, build_plan};
use vba_contracts::{
    CandidateIntent, CompiledQuery, EvidenceOutcome, EvidencePack, ExecutionResult,
    OutcomeStatus, PolicyDecision, PolicyOverrides, QualityStatus, QueryPlan, UserAttributes,
};
use vba_ledger::{EvidenceInputs, EvidenceStore, LedgerError};

use crate::engine::{ExecutionEngine, ExecutionError};
use crate::lineage::{LineageRecord, LineageSink};
use crate::metrics;
use crate::quality::QualityProvider;

pub const REASON_QUALITY_GATE: &str = "data not currently queryable";

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub request_id: String,
    pub user: UserAttributes,
    pub intent: CandidateIntent,
    pub overrides: PolicyOverrides,
    pub export: bool,
    pub policy_only: bool,
}

/// Why a request stopped before completing. Each variant still produces an
/// evidence pack.
#[derive(Debug)]
pub enum PipelineFailure {
    Plan(PlanError),
    Denied(String),
    QualityGate(String),
    Validation(CompileError),
    Execution(ExecutionError),
}

impl PipelineFailure {
    pub fn outcome(&self) -> OutcomeStatus {
        match self {
            PipelineFailure::Plan(_) => OutcomeStatus::PlanFailed,
            PipelineFailure::Denied(_) => OutcomeStatus::Denied,
            PipelineFailure::QualityGate(_) => OutcomeStatus::QualityGateFailed,
            PipelineFailure::Validation(_) => OutcomeStatus::ValidationFailed,
            PipelineFailure::Execution(_) => OutcomeStatus::ExecutionFailed,
        }
    }
}

impl std::fmt::Display for PipelineFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineFailure::Plan(err) => write!(f, "{}", err),
            PipelineFailure::Denied(reason) => f.write_str(reason),
            PipelineFailure::QualityGate(reason) => f.write_str(reason),
            PipelineFailure::Validation(err) => write!(f, "{}", err),
            PipelineFailure::Execution(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for PipelineFailure {}

/// Errors that leave no evidence pack behind.
#[derive(Debug)]
pub enum PipelineError {
    InvalidRequestId(String),
    DuplicateRequest(String),
    Evidence(LedgerError),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::InvalidRequestId(id) => write!(f, "invalid request id {:?}", id),
            PipelineError::DuplicateRequest(id) => {
                write!(f, "request {} has already been processed", id)
            }
            PipelineError::Evidence(err) => write!(f, "evidence could not be recorded: {}", err),
        }
    }
}

impl std::error::Error for PipelineError {}

#[derive(Debug)]
pub struct PipelineRun {
    pub pack: EvidencePack,
    pub pack_hash: String,
    pub failure: Option<PipelineFailure>,
    /// Rows are only handed back once the pack is persisted and the run completed.
    pub execution: Option<ExecutionResult>,
}

impl PipelineRun {
    pub fn outcome(&self) -> OutcomeStatus {
        self.pack.outcome.status
    }
}

#[derive(Default)]
struct RunState {
    plan: Option<QueryPlan>,
    decision: Option<PolicyDecision>,
    export_allowed: bool,
    quality: BTreeMap<String, QualityStatus>,
    compiled: Option<CompiledQuery>,
    execution: Option<ExecutionResult>,
    lineage_event_id: Option<String>,
    export_artifact_path: Option<String>,
}

/// Request ids this process is currently running. Held from before the
/// duplicate check until the pack is persisted.
#[derive(Default)]
struct InFlight {
    ids: Arc<Mutex<HashSet<String>>>,
}

impl InFlight {
    fn reserve(&self, request_id: &str) -> Option<Reservation> {
        let mut ids = match self.ids.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !ids.insert(request_id.to_string()) {
            return None;
        }
        Some(Reservation {
            ids: self.ids.clone(),
            request_id: request_id.to_string(),
        })
    }
}

struct Reservation {
    ids: Arc<Mutex<HashSet<String>>>,
    request_id: String,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let mut ids = match self.ids.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        ids.remove(&self.request_id);
    }
}

pub struct Pipeline<E> {
    catalog: Arc<Catalog>,
    compiler: SqlCompiler,
    engine: E,
    quality: QualityProvider,
    lineage: LineageSink,
    evidence: EvidenceStore,
    export_dir: PathBuf,
    execution_timeout: Duration,
    in_flight: InFlight,
}

impl<E: ExecutionEngine> Pipeline<E> {
    pub fn new(
        catalog: Arc<Catalog>,
        engine: E,
        quality: QualityProvider,
        lineage: LineageSink,
        evidence: EvidenceStore,
        export_dir: PathBuf,
        execution_timeout: Duration,
    ) -> Self {
        let compiler = SqlCompiler::for_catalog(&catalog);
        Self {
            catalog,
            compiler,
            engine,
            quality,
            lineage,
            evidence,
            export_dir,
            execution_timeout,
            in_flight: InFlight::default(),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn evidence(&self) -> &EvidenceStore {
        &self.evidence
    }

    pub async fn run(&self, request: QueryRequest) -> Result<PipelineRun, PipelineError> {
        self.run_at(request, Utc::now()).await
    }

    /// Runs every stage for one request and persists exactly one evidence
    /// pack, whatever the outcome.
    pub async fn run_at(
        &self,
        request: QueryRequest,
        now: DateTime<Utc>,
    ) -> Result<PipelineRun, PipelineError> {
        if !vba_ledger::is_safe_id(&request.request_id) {
            return Err(PipelineError::InvalidRequestId(request.request_id));
        }
        let Some(_reservation) = self.in_flight.reserve(&request.request_id) else {
            return Err(PipelineError::DuplicateRequest(request.request_id));
        };
        if self
            .evidence
            .exists(&request.request_id)
            .await
            .map_err(PipelineError::Evidence)?
        {
            return Err(PipelineError::DuplicateRequest(request.request_id));
        }

        let span = tracing::info_span!(
            "query.run",
            request_id = %request.request_id,
            role = %request.user.role,
            outcome = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        );
        let started = Instant::now();
        let timestamp = now.to_rfc3339_opts(SecondsFormat::Secs, true);

        let mut state = RunState::default();
        let stages = self
            .drive(&request, &timestamp, now, &mut state)
            .instrument(span.clone())
            .await;

        let (outcome, failure) = match stages {
            Ok(status) => (
                EvidenceOutcome {
                    status,
                    reason: state
                        .decision
                        .as_ref()
                        .map(|d| d.reason.clone())
                        .unwrap_or_default(),
                },
                None,
            ),
            Err(failure) => (
                EvidenceOutcome {
                    status: failure.outcome(),
                    reason: failure.to_string(),
                },
                Some(failure),
            ),
        };

        let pack = vba_ledger::assemble(EvidenceInputs {
            request_id: &request.request_id,
            timestamp,
            request_text: request.intent.question.as_deref(),
            user: &request.user,
            outcome,
            decision: state.decision.as_ref(),
            export_allowed: state.export_allowed,
            plan: state.plan.as_ref(),
            compiled: state.compiled.as_ref(),
            execution: state.execution.as_ref(),
            quality: &state.quality,
            lineage_event_id: state.lineage_event_id.take(),
            export_artifact_path: state.export_artifact_path.take(),
        });

        let pack_hash = self
            .evidence
            .persist(&pack)
            .instrument(tracing::info_span!(
                parent: &span,
                "evidence.persist",
                backend = self.evidence.backend()
            ))
            .await
            .map_err(|err| match err {
                LedgerError::AlreadyExists(id) => PipelineError::DuplicateRequest(id),
                other => {
                    tracing::error!(
                        parent: &span,
                        error = %other,
                        "evidence pack not persisted; withholding results"
                    );
                    PipelineError::Evidence(other)
                }
            })?;

        let status = pack.outcome.status;
        span.record("outcome", status.as_str());
        span.record("latency_ms", started.elapsed().as_millis() as u64);
        metrics::observe_outcome(status.as_str());
        tracing::info!(parent: &span, pack_hash = %pack_hash, "query finished");

        let execution = match status {
            OutcomeStatus::Completed => state.execution,
            _ => None,
        };

        Ok(PipelineRun {
            pack,
            pack_hash,
            failure,
            execution,
        })
    }

    async fn drive(
        &self,
        request: &QueryRequest,
        timestamp: &str,
        now: DateTime<Utc>,
        state: &mut RunState,
    ) -> Result<OutcomeStatus, PipelineFailure> {
        let plan = tracing::info_span!("catalog.plan")
            .in_scope(|| build_plan(&request.intent, &self.catalog))
            .map_err(PipelineFailure::Plan)?;
        state.plan = Some(plan.clone());
        let tier = plan.sensitivity();

        let decision = tracing::info_span!("policy.decide", tier = tier.as_str())
            .in_scope(|| vba_policy::decide(&request.user, &plan, &request.overrides));
        metrics::observe_policy_decision(decision.result.as_str());
        state.export_allowed = vba_policy::export_allowed(&request.user, &decision, tier);
        state.decision = Some(decision.clone());

        if decision.is_denied() {
            tracing::info!(reason = %decision.reason, "policy denied query");
            return Err(PipelineFailure::Denied(decision.reason));
        }
        if request.policy_only {
            return Ok(OutcomeStatus::PolicyOnly);
        }

        if decision.constraints.logs_access() {
            tracing::info!(
                target: "vba::access",
                request_id = %request.request_id,
                role = %request.user.role,
                region = %request.user.region,
                purpose = request.user.purpose.as_deref().unwrap_or(""),
                data_product = %plan.data_product.id,
                metrics = ?plan.metric_ids(),
                tier = tier.as_str(),
                "sensitive data access"
            );
        }

        self.check_quality(&plan, now, &mut state.quality)
            .instrument(tracing::info_span!(
                "quality.check",
                data_product = %plan.data_product.id
            ))
            .await?;

        let compiled = tracing::info_span!("sql.compile")
            .in_scope(|| self.compiler.compile(&plan, &decision.constraints))
            .map_err(|err| {
                tracing::error!(error = %err, "compiled SQL rejected");
                PipelineFailure::Validation(err)
            })?;
        state.compiled = Some(compiled.clone());

        let started = Instant::now();
        let executed = tokio::time::timeout(self.execution_timeout, self.engine.execute(&compiled))
            .instrument(tracing::info_span!(
                "engine.execute",
                sql_hash = %compiled.sql_hash
            ))
            .await;
        metrics::observe_execution(started.elapsed());
        let execution = executed
            .map_err(|_| ExecutionError::Timeout)
            .and_then(|result| result)
            .map_err(|err| {
                tracing::warn!(
                    error = %err,
                    retryable = err.retryable(),
                    "query execution failed"
                );
                PipelineFailure::Execution(err)
            })?;
        metrics::add_suppressed_groups(execution.suppressed_count);

        let metric_ids = plan.metric_ids();
        state.lineage_event_id = self
            .lineage
            .emit(&LineageRecord {
                request_id: &request.request_id,
                data_products: vec![plan.data_product.id.as_str()],
                metrics: metric_ids,
                sql_hash: &compiled.sql_hash,
                role: &request.user.role,
                timestamp,
            })
            .instrument(tracing::info_span!("lineage.emit"))
            .await;

        if request.export && state.export_allowed {
            state.export_artifact_path = self.export(&request.request_id, &execution).await;
        }

        state.execution = Some(execution);
        Ok(OutcomeStatus::Completed)
    }

    async fn check_quality(
        &self,
        plan: &QueryPlan,
        now: DateTime<Utc>,
        statuses: &mut BTreeMap<String, QualityStatus>,
    ) -> Result<(), PipelineFailure> {
        let product_id = plan.data_product.id.as_str();
        let Some(product) = self.catalog.data_product(product_id) else {
            return Err(PipelineFailure::QualityGate(format!(
                "{}: {} is not in the catalog",
                REASON_QUALITY_GATE, product_id
            )));
        };

        let status = match self
            .quality
            .status(product_id, product.freshness.max_age_hours, now)
            .await
        {
            Ok(status) => status,
            Err(err) => {
                tracing::warn!(error = %err, "quality status unavailable; failing closed");
                QualityStatus {
                    fresh: false,
                    tests_passed: false,
                    last_checked: None,
                    issues: vec![err.to_string()],
                }
            }
        };

        let passed = status.tests_passed;
        let issues = status.issues.join("; ");
        statuses.insert(product_id.to_string(), status);

        if passed {
            Ok(())
        } else {
            Err(PipelineFailure::QualityGate(format!(
                "{}: {}",
                REASON_QUALITY_GATE, issues
            )))
        }
    }

    async fn export(&self, request_id: &str, execution: &ExecutionResult) -> Option<String> {
        let dir = self.export_dir.clone();
        let id = request_id.to_string();
        let result = execution.clone();

        match tokio::task::spawn_blocking(move || crate::export::write_csv(&dir, &id, &result))
            .await
        {
            Ok(Ok(path)) => Some(path.display().to_string()),
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "export artifact not written");
                None
            }
            Err(err) => {
                tracing::warn!(error = %err, "export task failed");
                None
            }
        }
    }
}
