use vba_contracts::EvidencePack;

use crate::{EvidenceFileStore, LedgerError, LedgerWriter, PersistedPack};

/// Evidence persistence backend selected at startup.
#[derive(Clone)]
pub enum EvidenceStore {
    Files(EvidenceFileStore),
    Postgres(LedgerWriter),
}

impl EvidenceStore {
    pub fn backend(&self) -> &'static str {
        match self {
            EvidenceStore::Files(_) => "file",
            EvidenceStore::Postgres(_) => "postgres",
        }
    }

    /// Persists the pack exactly once and returns its hash.
    pub async fn persist(&self, pack: &EvidencePack) -> Result<String, LedgerError> {
        match self {
            EvidenceStore::Files(store) => {
                let store = store.clone();
                let pack = pack.clone();
                tokio::task::spawn_blocking(move || store.persist(&pack))
                    .await
                    .map_err(|err| LedgerError::Io(std::io::Error::other(err)))?
            }
            EvidenceStore::Postgres(writer) => writer.insert_evidence_pack(pack).await,
        }
    }

    pub async fn load(&self, request_id: &str) -> Result<Option<PersistedPack>, LedgerError> {
        match self {
            EvidenceStore::Files(store) => {
                let store = store.clone();
                let request_id = request_id.to_string();
                tokio::task::spawn_blocking(move || store.load(&request_id))
                    .await
                    .map_err(|err| LedgerError::Io(std::io::Error::other(err)))?
            }
            EvidenceStore::Postgres(writer) => writer.load_evidence_pack(request_id).await,
        }
    }

    pub async fn exists(&self, request_id: &str) -> Result<bool, LedgerError> {
        match self {
            EvidenceStore::Files(store) => store.exists(request_id),
            EvidenceStore::Postgres(writer) => writer.contains(request_id).await,
        }
    }

    pub async fn ready(&self) -> Result<(), LedgerError> {
        match self {
            EvidenceStore::Files(store) => store.ensure_dir(),
            EvidenceStore::Postgres(writer) => writer.ping().await,
        }
    }
}
