use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use vba_contracts::QualityStatus;

#[derive(Debug)]
pub enum QualityError {
    Timeout,
    Sqlx(sqlx::Error),
    Io(std::io::Error),
    Parse(serde_json::Error),
}

impl std::fmt::Display for QualityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QualityError::Timeout => write!(f, "quality status lookup timed out"),
            QualityError::Sqlx(err) => write!(f, "quality status query failed: {}", err),
            QualityError::Io(err) => write!(f, "failed to read quality status file: {}", err),
            QualityError::Parse(err) => write!(f, "invalid quality status file: {}", err),
        }
    }
}

impl std::error::Error for QualityError {}

impl From<sqlx::Error> for QualityError {
    fn from(value: sqlx::Error) -> Self {
        QualityError::Sqlx(value)
    }
}

/// Source of per-product freshness and test status.
#[derive(Clone)]
pub enum QualityProvider {
    /// The warehouse `promote_status` table written by the promotion job.
    PromoteStatus { pool: PgPool, timeout: Duration },
    Static(BTreeMap<String, QualityStatus>),
}

impl QualityProvider {
    pub fn from_file(path: &Path) -> Result<Self, QualityError> {
        let raw = std::fs::read_to_string(path).map_err(QualityError::Io)?;
        let statuses = serde_json::from_str::<BTreeMap<String, QualityStatus>>(&raw)
            .map_err(QualityError::Parse)?;
        Ok(QualityProvider::Static(statuses))
    }

    /// Unknown products come back failing rather than as an error.
    pub async fn status(
        &self,
        product_id: &str,
        max_age_hours: u32,
        now: DateTime<Utc>,
    ) -> Result<QualityStatus, QualityError> {
        match self {
            QualityProvider::Static(statuses) => Ok(statuses
                .get(product_id)
                .cloned()
                .unwrap_or_else(|| missing_status(product_id))),
            QualityProvider::PromoteStatus { pool, timeout } => {
                let row = tokio::time::timeout(
                    *timeout,
                    sqlx::query(
                        "SELECT promoted, last_promoted, dbt_passed, ge_passed FROM promote_status WHERE data_product = $1",
                    )
                    .bind(product_id)
                    .fetch_optional(pool),
                )
                .await
                .map_err(|_| QualityError::Timeout)??;

                let Some(row) = row else {
                    return Ok(missing_status(product_id));
                };

                let record = PromoteRecord {
                    promoted: row.try_get::<Option<bool>, _>("promoted")?.unwrap_or(false),
                    last_promoted: row.try_get("last_promoted")?,
                    dbt_passed: row.try_get::<Option<bool>, _>("dbt_passed")?.unwrap_or(false),
                    ge_passed: row.try_get::<Option<bool>, _>("ge_passed")?.unwrap_or(false),
                };
                Ok(record.into_status(product_id, max_age_hours, now))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PromoteRecord {
    promoted: bool,
    last_promoted: Option<String>,
    dbt_passed: bool,
    ge_passed: bool,
}

impl PromoteRecord {
    fn into_status(self, product_id: &str, max_age_hours: u32, now: DateTime<Utc>) -> QualityStatus {
        let mut issues = Vec::new();

        let tests_passed = self.promoted && self.dbt_passed && self.ge_passed;
        if !tests_passed {
            issues.push(format!(
                "data product {} is not promoted or quality gates failed",
                product_id
            ));
        }

        let promoted_at = self
            .last_promoted
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw.trim()).ok())
            .map(|at| at.with_timezone(&Utc));
        let fresh = match promoted_at {
            Some(at) => now.signed_duration_since(at) <= chrono::Duration::hours(i64::from(max_age_hours)),
            None => false,
        };
        if !fresh {
            issues.push(format!(
                "data product {} is older than {}h",
                product_id, max_age_hours
            ));
        }

        QualityStatus {
            fresh,
            tests_passed,
            last_checked: self.last_promoted,
            issues,
        }
    }
}

fn missing_status(product_id: &str) -> QualityStatus {
    QualityStatus {
        fresh: false,
        tests_passed: false,
        last_checked: None,
        issues: vec![format!("no quality status recorded for {}", product_id)],
    }
}
