use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use ulid::Ulid;
use vba_contracts::EvidencePack;

use crate::LedgerError;

/// On-disk and API envelope: the pack plus the hash it was written with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedPack {
    pub pack_hash: String,
    pub pack: EvidencePack,
}

impl PersistedPack {
    pub fn seal(pack: EvidencePack) -> Self {
        Self {
            pack_hash: pack.pack_hash(),
            pack,
        }
    }

    /// Recomputes the hash over the canonical pack bytes.
    pub fn verify(self) -> Result<Self, LedgerError> {
        let recomputed = self.pack.pack_hash();
        if recomputed != self.pack_hash {
            return Err(LedgerError::Corrupt(format!(
                "evidence pack {} hash mismatch (stored {}, computed {})",
                self.pack.request_id, self.pack_hash, recomputed
            )));
        }
        Ok(self)
    }
}

/// One `<request_id>.json` per request. Existing files are never replaced.
#[derive(Debug, Clone)]
pub struct EvidenceFileStore {
    dir: PathBuf,
}

impl EvidenceFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ensure_dir(&self) -> Result<(), LedgerError> {
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    pub fn path_for(&self, request_id: &str) -> Result<PathBuf, LedgerError> {
        if !is_safe_id(request_id) {
            return Err(LedgerError::InvalidId(request_id.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", request_id)))
    }

    pub fn exists(&self, request_id: &str) -> Result<bool, LedgerError> {
        Ok(self.path_for(request_id)?.exists())
    }

    /// Writes a temp file then hard-links it into place, so a concurrent or
    /// repeated write for the same id fails instead of overwriting.
    pub fn persist(&self, pack: &EvidencePack) -> Result<String, LedgerError> {
        let path = self.path_for(&pack.request_id)?;
        self.ensure_dir()?;

        let sealed = PersistedPack::seal(pack.clone());
        let value = serde_json::to_value(&sealed)?;
        let bytes = vba_contracts::canonical::canonical_json_bytes(&value);

        let temp_path = self
            .dir
            .join(format!(".{}.json.tmp-{}", pack.request_id, Ulid::new()));
        fs::write(&temp_path, bytes)?;

        let linked = fs::hard_link(&temp_path, &path);
        let _ = fs::remove_file(&temp_path);
        match linked {
            Ok(()) => Ok(sealed.pack_hash),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                Err(LedgerError::AlreadyExists(pack.request_id.clone()))
            }
            Err(err) => Err(LedgerError::Io(err)),
        }
    }

    pub fn load(&self, request_id: &str) -> Result<Option<PersistedPack>, LedgerError> {
        let path = self.path_for(request_id)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(LedgerError::Io(err)),
        };
        let stored = serde_json::from_slice::<PersistedPack>(&bytes).map_err(|err| {
            LedgerError::Corrupt(format!("failed to parse {}: {}", path.display(), err))
        })?;
        if stored.pack.request_id != request_id {
            return Err(LedgerError::Corrupt(format!(
                "{} holds evidence for {}",
                path.display(),
                stored.pack.request_id
            )));
        }
        stored.verify().map(Some)
    }
}

pub fn is_safe_id(raw: &str) -> bool {
    !raw.is_empty()
        && raw.len() <= 128
        && !raw.starts_with('.')
        && raw
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use vba_contracts::{
        EvidenceOutcome, OutcomeStatus, PolicyDecision, ResultEvidence, SqlEvidence,
        UserAttributes,
    };

    fn temp_store() -> EvidenceFileStore {
        EvidenceFileStore::new(
            std::env::temp_dir().join(format!("vba-evidence-test-{}", Ulid::new())),
        )
    }

    fn pack(request_id: &str) -> EvidencePack {
        EvidencePack {
            request_id: request_id.to_string(),
            timestamp: "2024-05-01T00:00:00Z".to_string(),
            request_text: Some("complaints in CA".to_string()),
            user_attributes: UserAttributes {
                role: "data_analyst".to_string(),
                region: "CA".to_string(),
                purpose: None,
            },
            outcome: EvidenceOutcome {
                status: OutcomeStatus::Denied,
                reason: "high sensitivity denied for this role".to_string(),
            },
            policy_decision: Some(PolicyDecision::deny("high sensitivity denied for this role")),
            export_allowed: false,
            metrics: Vec::new(),
            data_products: Vec::new(),
            data_quality: BTreeMap::new(),
            sql: SqlEvidence::default(),
            results: ResultEvidence::default(),
            lineage_event_id: None,
            export_artifact_path: None,
        }
    }

    #[test]
    fn persist_then_load_verifies_hash() {
        let store = temp_store();
        let hash = store.persist(&pack("req-1")).expect("persist");
        let loaded = store.load("req-1").expect("load").expect("present");
        assert_eq!(loaded.pack_hash, hash);
        assert_eq!(loaded.pack, pack("req-1"));
        assert!(store.exists("req-1").expect("exists"));
        assert_eq!(store.load("req-2").expect("load"), None);

        let _ = fs::remove_dir_all(store.dir());
    }

    #[test]
    fn second_write_for_same_id_is_rejected() {
        let store = temp_store();
        store.persist(&pack("req-1")).expect("persist");

        let mut changed = pack("req-1");
        changed.outcome.reason = "rewritten".to_string();
        let err = store.persist(&changed).unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyExists(id) if id == "req-1"));

        let loaded = store.load("req-1").expect("load").expect("present");
        assert_eq!(loaded.pack.outcome.reason, "high sensitivity denied for this role");

        let _ = fs::remove_dir_all(store.dir());
    }

    #[test]
    fn tampered_file_fails_verification() {
        let store = temp_store();
        store.persist(&pack("req-1")).expect("persist");

        let path = store.path_for("req-1").expect("path");
        let raw = fs::read_to_string(&path).expect("read");
        fs::write(&path, raw.replace("high sensitivity", "low sensitivity")).expect("write");

        let err = store.load("req-1").unwrap_err();
        assert!(matches!(err, LedgerError::Corrupt(_)));

        let _ = fs::remove_dir_all(store.dir());
    }

    #[test]
    fn unsafe_ids_are_rejected() {
        let store = temp_store();
        for id in ["", "../etc/passwd", ".hidden", "a/b", "a b"] {
            assert!(
                matches!(store.path_for(id), Err(LedgerError::InvalidId(_))),
                "{id:?}"
            );
        }
    }
}
