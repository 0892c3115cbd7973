use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Column, Executor, PgPool, Row, TypeInfo};
use tokio::sync::Semaphore;
use vba_contracts::{CompiledQuery, ExecutionResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// The warehouse rejected the statement itself.
    Syntax(String),
    Resource(String),
    Timeout,
    Unavailable(String),
}

impl ExecutionError {
    pub fn retryable(&self) -> bool {
        matches!(self, ExecutionError::Timeout | ExecutionError::Unavailable(_))
    }
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionError::Syntax(detail) => write!(f, "query rejected by warehouse: {}", detail),
            ExecutionError::Resource(detail) => {
                write!(f, "warehouse resource limit reached: {}", detail)
            }
            ExecutionError::Timeout => write!(f, "query execution timed out"),
            ExecutionError::Unavailable(detail) => write!(f, "warehouse unavailable: {}", detail),
        }
    }
}

impl std::error::Error for ExecutionError {}

impl From<sqlx::Error> for ExecutionError {
    fn from(value: sqlx::Error) -> Self {
        match &value {
            sqlx::Error::Database(db) => {
                let code = db.code().map(|c| c.to_string()).unwrap_or_default();
                let message = db.message().to_string();
                match code.as_str() {
                    // query_canceled is what statement_timeout raises.
                    "57014" => ExecutionError::Timeout,
                    c if c.starts_with("42") || c.starts_with("22") || c == "25006" => {
                        ExecutionError::Syntax(message)
                    }
                    c if c.starts_with("53") || c.starts_with("54") => {
                        ExecutionError::Resource(message)
                    }
                    _ => ExecutionError::Unavailable(message),
                }
            }
            sqlx::Error::PoolTimedOut => ExecutionError::Resource("connection pool exhausted".to_string()),
            _ => ExecutionError::Unavailable(value.to_string()),
        }
    }
}

/// Runs approved SQL against the warehouse.
pub trait ExecutionEngine: Send + Sync + 'static {
    fn execute(
        &self,
        compiled: &CompiledQuery,
    ) -> impl Future<Output = Result<ExecutionResult, ExecutionError>> + Send;

    fn ping(&self) -> impl Future<Output = Result<(), ExecutionError>> + Send;
}

/// Postgres engine. Each call takes a permit, opens one READ ONLY
/// transaction and rolls it back once both statements have run.
#[derive(Clone)]
pub struct PgExecutionEngine {
    pool: PgPool,
    permits: Arc<Semaphore>,
    statement_timeout: Duration,
}

impl PgExecutionEngine {
    pub fn new(pool: PgPool, max_concurrency: usize, statement_timeout: Duration) -> Self {
        Self {
            pool,
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            statement_timeout,
        }
    }

    pub async fn connect(
        db_url: &str,
        max_concurrency: usize,
        statement_timeout: Duration,
    ) -> Result<Self, ExecutionError> {
        let pool = tokio::time::timeout(
            Duration::from_secs(2),
            PgPoolOptions::new()
                .max_connections(max_concurrency.max(1) as u32 + 1)
                .connect(db_url),
        )
        .await
        .map_err(|_| ExecutionError::Timeout)??;

        Ok(Self::new(pool, max_concurrency, statement_timeout))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn run(&self, compiled: &CompiledQuery) -> Result<ExecutionResult, ExecutionError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await?;
        sqlx::query("SELECT set_config('statement_timeout', $1, true)")
            .bind(format!("{}ms", self.statement_timeout.as_millis()))
            .execute(&mut *tx)
            .await?;

        let rows = sqlx::query(&compiled.sql).fetch_all(&mut *tx).await?;
        let columns = match rows.first() {
            Some(row) => column_names(row),
            None => (&mut *tx)
                .describe(&compiled.sql)
                .await?
                .columns()
                .iter()
                .map(|c| c.name().to_string())
                .collect(),
        };

        let suppressed: i64 = sqlx::query_scalar(&compiled.suppression_sql)
            .fetch_one(&mut *tx)
            .await?;

        tx.rollback().await?;

        let rows = rows.iter().map(decode_row).collect::<Vec<_>>();
        Ok(ExecutionResult {
            columns,
            row_count: rows.len() as u64,
            rows,
            suppressed_count: suppressed.max(0) as u64,
        })
    }
}

impl ExecutionEngine for PgExecutionEngine {
    async fn execute(&self, compiled: &CompiledQuery) -> Result<ExecutionResult, ExecutionError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ExecutionError::Unavailable("execution permits closed".to_string()))?;
        self.run(compiled).await
    }

    async fn ping(&self) -> Result<(), ExecutionError> {
        tokio::time::timeout(
            Duration::from_millis(500),
            sqlx::query("SELECT 1").execute(&self.pool),
        )
        .await
        .map_err(|_| ExecutionError::Timeout)??;
        Ok(())
    }
}

fn column_names(row: &PgRow) -> Vec<String> {
    row.columns().iter().map(|c| c.name().to_string()).collect()
}

fn decode_row(row: &PgRow) -> Vec<serde_json::Value> {
    row.columns()
        .iter()
        .map(|column| decode_cell(row, column.ordinal(), column.type_info().name()))
        .collect()
}

fn decode_cell(row: &PgRow, idx: usize, type_name: &str) -> serde_json::Value {
    use serde_json::Value;

    match type_name {
        "INT8" => row
            .try_get::<Option<i64>, _>(idx)
            .ok()
            .flatten()
            .map_or(Value::Null, Value::from),
        "INT4" => row
            .try_get::<Option<i32>, _>(idx)
            .ok()
            .flatten()
            .map_or(Value::Null, Value::from),
        "INT2" => row
            .try_get::<Option<i16>, _>(idx)
            .ok()
            .flatten()
            .map_or(Value::Null, Value::from),
        "FLOAT8" => row
            .try_get::<Option<f64>, _>(idx)
            .ok()
            .flatten()
            .and_then(serde_json::Number::from_f64)
            .map_or(Value::Null, Value::Number),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(idx)
            .ok()
            .flatten()
            .and_then(|v| serde_json::Number::from_f64(f64::from(v)))
            .map_or(Value::Null, Value::Number),
        "BOOL" => row
            .try_get::<Option<bool>, _>(idx)
            .ok()
            .flatten()
            .map_or(Value::Null, Value::Bool),
        _ => row
            .try_get::<Option<String>, _>(idx)
            .ok()
            .flatten()
            .map_or(Value::Null, Value::String),
    }
}
