use std::time::Duration;

use sqlx::Row;
use sqlx::postgres::PgPoolOptions;
use vba_contracts::EvidencePack;

mod assemble;
mod file_store;
mod store;

pub use assemble::{EvidenceInputs, assemble};
pub use file_store::{EvidenceFileStore, PersistedPack, is_safe_id};
pub use store::EvidenceStore;

#[derive(Debug)]
pub enum LedgerError {
    Timeout,
    Sqlx(sqlx::Error),
    Io(std::io::Error),
    Serialize(serde_json::Error),
    AlreadyExists(String),
    InvalidId(String),
    Corrupt(String),
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::Timeout => write!(f, "ledger operation timed out"),
            LedgerError::Sqlx(err) => write!(f, "ledger sql error: {}", err),
            LedgerError::Io(err) => write!(f, "evidence store io error: {}", err),
            LedgerError::Serialize(err) => write!(f, "evidence serialization error: {}", err),
            LedgerError::AlreadyExists(id) => {
                write!(f, "evidence for request {} already recorded", id)
            }
            LedgerError::InvalidId(id) => write!(f, "invalid request id {:?}", id),
            LedgerError::Corrupt(detail) => write!(f, "evidence integrity failure: {}", detail),
        }
    }
}

impl std::error::Error for LedgerError {}

impl From<sqlx::Error> for LedgerError {
    fn from(value: sqlx::Error) -> Self {
        match &value {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                LedgerError::AlreadyExists(db.message().to_string())
            }
            _ => LedgerError::Sqlx(value),
        }
    }
}

impl From<std::io::Error> for LedgerError {
    fn from(value: std::io::Error) -> Self {
        LedgerError::Io(value)
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(value: serde_json::Error) -> Self {
        LedgerError::Serialize(value)
    }
}

/// Postgres evidence ledger backed by the append-only `vba_evidence_packs`
/// table.
#[derive(Clone)]
pub struct LedgerWriter {
    pool: sqlx::PgPool,
    write_timeout: Duration,
}

impl LedgerWriter {
    pub async fn connect(db_url: &str, write_timeout: Duration) -> Result<Self, LedgerError> {
        let pool = tokio::time::timeout(
            Duration::from_secs(2),
            PgPoolOptions::new().max_connections(8).connect(db_url),
        )
        .await
        .map_err(|_| LedgerError::Timeout)??;

        Ok(Self {
            pool,
            write_timeout,
        })
    }

    pub async fn connect_and_migrate(
        db_url: &str,
        write_timeout: Duration,
    ) -> Result<Self, LedgerError> {
        let writer = Self::connect(db_url, write_timeout).await?;
        writer.migrate().await?;
        Ok(writer)
    }

    pub async fn migrate(&self) -> Result<(), LedgerError> {
        tokio::time::timeout(Duration::from_secs(10), migrate(&self.pool))
            .await
            .map_err(|_| LedgerError::Timeout)??;
        Ok(())
    }

    pub async fn ping(&self) -> Result<(), LedgerError> {
        tokio::time::timeout(
            self.write_timeout,
            sqlx::query("SELECT 1").execute(&self.pool),
        )
        .await
        .map_err(|_| LedgerError::Timeout)??;
        Ok(())
    }

    /// Inserts the pack and returns its hash. A second insert for the same
    /// request id is `AlreadyExists`.
    pub async fn insert_evidence_pack(&self, pack: &EvidencePack) -> Result<String, LedgerError> {
        let pack_json = pack.canonical_value();
        let pack_canonical = vba_contracts::canonical::canonical_json_string(&pack_json);
        let pack_hash = vba_contracts::canonical::sha256_hex(pack_canonical.as_bytes());

        let result = tokio::time::timeout(
            self.write_timeout,
            sqlx::query(
                "INSERT INTO vba_evidence_packs (request_id, outcome, decision_result, sql_hash, pack_hash, pack_canonical, pack_json) VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(&pack.request_id)
            .bind(pack.outcome.status.as_str())
            .bind(pack.policy_decision.as_ref().map(|d| d.result.as_str()))
            .bind(&pack.sql.sql_hash)
            .bind(&pack_hash)
            .bind(&pack_canonical)
            .bind(&pack_json)
            .execute(&self.pool),
        )
        .await
        .map_err(|_| LedgerError::Timeout)?;

        match result {
            Ok(_) => Ok(pack_hash),
            Err(err) => match LedgerError::from(err) {
                LedgerError::AlreadyExists(_) => {
                    Err(LedgerError::AlreadyExists(pack.request_id.clone()))
                }
                other => Err(other),
            },
        }
    }

    pub async fn contains(&self, request_id: &str) -> Result<bool, LedgerError> {
        let row = tokio::time::timeout(
            self.write_timeout,
            sqlx::query("SELECT 1 AS present FROM vba_evidence_packs WHERE request_id = $1")
                .bind(request_id)
                .fetch_optional(&self.pool),
        )
        .await
        .map_err(|_| LedgerError::Timeout)??;
        Ok(row.is_some())
    }

    /// Loads a pack and re-verifies its stored hash.
    pub async fn load_evidence_pack(
        &self,
        request_id: &str,
    ) -> Result<Option<PersistedPack>, LedgerError> {
        let row = tokio::time::timeout(
            self.write_timeout,
            sqlx::query(
                "SELECT pack_hash, pack_canonical FROM vba_evidence_packs WHERE request_id = $1",
            )
            .bind(request_id)
            .fetch_optional(&self.pool),
        )
        .await
        .map_err(|_| LedgerError::Timeout)??;

        let Some(row) = row else {
            return Ok(None);
        };
        let pack_hash: String = row.try_get("pack_hash")?;
        let pack_canonical: String = row.try_get("pack_canonical")?;

        if vba_contracts::canonical::sha256_hex(pack_canonical.as_bytes()) != pack_hash {
            return Err(LedgerError::Corrupt(format!(
                "stored canonical bytes for {} do not match pack_hash",
                request_id
            )));
        }
        let pack = serde_json::from_str::<EvidencePack>(&pack_canonical)?;
        PersistedPack { pack_hash, pack }.verify().map(Some)
    }

    pub fn pool(&self) -> &sqlx::PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
