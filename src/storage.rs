//! Persistent record store for data points, signups and delivered responses.
//!
//! [`FileStore`] keeps everything in one JSON document that is rewritten
//! atomically (temp file + rename) after every mutation, serialised across
//! processes by an `fs2` lock on a sidecar `.lock` file.  [`MemoryStore`]
//! holds the same state without touching disk.

use crate::response::PlainSurveyResponse;
use crate::signup::{SignupRecord, SignupState};
use serde::{Deserialize, Serialize};
use fs2::FileExt;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Errors raised by a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem failure.
    #[error("storage I/O error: {0}")]
    Io(String),
    /// The stored document could not be encoded or decoded.
    #[error("storage codec error: {0}")]
    Codec(String),
    /// A signup record for the survey already exists.
    #[error("signup for survey {0} already exists")]
    DuplicateSignup(String),
}

/// One locally collected value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPoint {
    /// Data key the value belongs to.
    pub key: String,
    /// Raw textual value.
    pub value: String,
}

/// A contribution this client delivered, kept for local inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurveyResponseRecord {
    /// Plaintext contribution as computed locally.
    pub response: PlainSurveyResponse,
    /// Millisecond timestamp of delivery.
    pub created_at_ms: u64,
}

/// Storage collaborator consumed by the orchestrator.
pub trait Storage: Send {
    /// Stored values for `key`, in insertion order.
    fn list_data_points(&self, key: &str) -> Result<Vec<String>, StorageError>;

    /// Appends a value under `key`.
    fn add_data_point(&mut self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Every signup record, ordered by survey id.
    fn list_signup_records(&self) -> Result<Vec<SignupRecord>, StorageError>;

    /// Inserts a new record; fails if the survey already has one.
    fn add_signup_record(&mut self, record: SignupRecord) -> Result<(), StorageError>;

    /// Upserts a record keyed by its survey id.
    fn save_signup_record(&mut self, record: &SignupRecord) -> Result<(), StorageError>;

    /// Archives a delivered contribution.
    fn add_survey_response(&mut self, response: &PlainSurveyResponse) -> Result<(), StorageError>;

    /// Every archived contribution, oldest first.
    fn list_survey_responses(&self) -> Result<Vec<SurveyResponseRecord>, StorageError>;

    /// Records currently in `state`.
    fn list_signup_records_in_state(
        &self,
        state: SignupState,
    ) -> Result<Vec<SignupRecord>, StorageError> {
        Ok(self
            .list_signup_records()?
            .into_iter()
            .filter(|r| r.state == state)
            .collect())
    }

    /// Records in `Processing` for which this client is the delegate.
    fn list_active_delegate_records(&self) -> Result<Vec<SignupRecord>, StorageError> {
        Ok(self
            .list_signup_records()?
            .into_iter()
            .filter(SignupRecord::is_active_delegate)
            .collect())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    data_points: Vec<DataPoint>,
    #[serde(default)]
    signups: BTreeMap<String, SignupRecord>,
    #[serde(default)]
    responses: Vec<SurveyResponseRecord>,
}

/// Volatile store used by tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    doc: StoreDocument,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Distinct data keys with at least one value.
    pub fn data_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.doc.data_points.iter().map(|p| p.key.clone()).collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

impl Storage for MemoryStore {
    fn list_data_points(&self, key: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .doc
            .data_points
            .iter()
            .filter(|p| p.key == key)
            .map(|p| p.value.clone())
            .collect())
    }

    fn add_data_point(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        self.doc.data_points.push(DataPoint {
            key: key.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    fn list_signup_records(&self) -> Result<Vec<SignupRecord>, StorageError> {
        Ok(self.doc.signups.values().cloned().collect())
    }

    fn add_signup_record(&mut self, record: SignupRecord) -> Result<(), StorageError> {
        let id = record.survey_id().to_string();
        if self.doc.signups.contains_key(&id) {
            return Err(StorageError::DuplicateSignup(id));
        }
        self.doc.signups.insert(id, record);
        Ok(())
    }

    fn save_signup_record(&mut self, record: &SignupRecord) -> Result<(), StorageError> {
        self.doc
            .signups
            .insert(record.survey_id().to_string(), record.clone());
        Ok(())
    }

    fn add_survey_response(&mut self, response: &PlainSurveyResponse) -> Result<(), StorageError> {
        self.doc.responses.push(SurveyResponseRecord {
            response: response.clone(),
            created_at_ms: now_millis(),
        });
        Ok(())
    }

    fn list_survey_responses(&self) -> Result<Vec<SurveyResponseRecord>, StorageError> {
        Ok(self.doc.responses.clone())
    }
}

/// JSON-file backed store shared between processes.
///
/// Holds no state of its own: reads load the file under a shared lock and
/// mutations reload, apply and rewrite it under an exclusive lock, so a
/// `cohortd data add` next to a running daemon is seen by, and survives,
/// the daemon's next write.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Opens the store at `path`; a missing file yields an empty store.
    ///
    /// An existing file is decoded once here so corruption surfaces early.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let store = Self { path: path.into() };
        store.read(|_| Ok(()))?;
        Ok(store)
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Distinct data keys with at least one value.
    pub fn data_keys(&self) -> Result<Vec<String>, StorageError> {
        self.read(|inner| Ok(inner.data_keys()))
    }

    fn lock_file(&self, create: bool) -> Result<Option<File>, StorageError> {
        let lock_path = self.path.with_extension("json.lock");
        if create {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent).map_err(io_error)?;
            }
        } else if !lock_path.exists() && !self.path.exists() {
            return Ok(None);
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(io_error)?;
        Ok(Some(file))
    }

    fn load(&self) -> Result<MemoryStore, StorageError> {
        let doc = match fs::read(&self.path) {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| StorageError::Codec(e.to_string()))?
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => StoreDocument::default(),
            Err(err) => return Err(io_error(err)),
        };
        Ok(MemoryStore { doc })
    }

    fn read<R>(
        &self,
        f: impl FnOnce(&MemoryStore) -> Result<R, StorageError>,
    ) -> Result<R, StorageError> {
        let Some(lock) = self.lock_file(false)? else {
            return f(&MemoryStore::default());
        };
        lock.lock_shared().map_err(io_error)?;
        let outcome = self.load().and_then(|inner| f(&inner));
        let _ = lock.unlock();
        outcome
    }

    fn update(
        &self,
        f: impl FnOnce(&mut MemoryStore) -> Result<(), StorageError>,
    ) -> Result<(), StorageError> {
        let lock = self
            .lock_file(true)?
            .ok_or_else(|| StorageError::Io("store lock unavailable".into()))?;
        lock.lock_exclusive().map_err(io_error)?;
        let outcome = self.load().and_then(|mut inner| {
            f(&mut inner)?;
            self.persist(&inner.doc)
        });
        let _ = lock.unlock();
        outcome
    }

    fn persist(&self, doc: &StoreDocument) -> Result<(), StorageError> {
        let data =
            serde_json::to_vec_pretty(doc).map_err(|e| StorageError::Codec(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, data).map_err(io_error)?;
        fs::rename(&tmp, &self.path).map_err(io_error)
    }
}

fn io_error(err: io::Error) -> StorageError {
    StorageError::Io(err.to_string())
}

impl Storage for FileStore {
    fn list_data_points(&self, key: &str) -> Result<Vec<String>, StorageError> {
        self.read(|inner| inner.list_data_points(key))
    }

    fn add_data_point(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        self.update(|inner| inner.add_data_point(key, value))
    }

    fn list_signup_records(&self) -> Result<Vec<SignupRecord>, StorageError> {
        self.read(|inner| inner.list_signup_records())
    }

    fn add_signup_record(&mut self, record: SignupRecord) -> Result<(), StorageError> {
        self.update(|inner| inner.add_signup_record(record))
    }

    fn save_signup_record(&mut self, record: &SignupRecord) -> Result<(), StorageError> {
        self.update(|inner| inner.save_signup_record(record))
    }

    fn add_survey_response(&mut self, response: &PlainSurveyResponse) -> Result<(), StorageError> {
        self.update(|inner| inner.add_survey_response(response))
    }

    fn list_survey_responses(&self) -> Result<Vec<SurveyResponseRecord>, StorageError> {
        self.read(|inner| inner.list_survey_responses())
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::survey::Survey;
    use std::sync::Arc;

    fn temp_store_path() -> PathBuf {
        let mut path = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        path.push(format!("cohort_store_{nanos}"));
        path.push("store.json");
        path
    }

    fn record(id: &str, client: &str) -> SignupRecord {
        SignupRecord::new(Arc::new(Survey::new(id, "name")), client)
    }

    #[test]
    fn data_points_are_filtered_by_key_in_order() {
        let mut store = MemoryStore::new();
        store.add_data_point("a", "1").unwrap();
        store.add_data_point("b", "x").unwrap();
        store.add_data_point("a", "2").unwrap();
        assert_eq!(store.list_data_points("a").unwrap(), vec!["1", "2"]);
        assert!(store.list_data_points("c").unwrap().is_empty());
        assert_eq!(store.data_keys(), vec!["a", "b"]);
    }

    #[test]
    fn signup_records_are_keyed_by_survey() {
        let mut store = MemoryStore::new();
        store.add_signup_record(record("s1", "c1")).unwrap();
        assert!(matches!(
            store.add_signup_record(record("s1", "c2")),
            Err(StorageError::DuplicateSignup(_))
        ));

        let mut rec = record("s1", "c1");
        rec.state = SignupState::Processing;
        rec.delegate_public_key = Some("c1".into());
        store.save_signup_record(&rec).unwrap();
        store.add_signup_record(record("s2", "c3")).unwrap();

        assert_eq!(store.list_signup_records().unwrap().len(), 2);
        assert_eq!(
            store
                .list_signup_records_in_state(SignupState::Initial)
                .unwrap()
                .len(),
            1
        );
        let active = store.list_active_delegate_records().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].survey_id(), "s1");
    }

    #[test]
    fn file_store_persists_across_reopen() {
        let path = temp_store_path();
        {
            let mut store = FileStore::open(&path).unwrap();
            store.add_data_point("age", "31").unwrap();
            store.add_signup_record(record("s1", "c1")).unwrap();
            store
                .add_survey_response(&PlainSurveyResponse::new("s1"))
                .unwrap();
        }
        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.list_data_points("age").unwrap(), vec!["31"]);
        assert_eq!(store.list_signup_records().unwrap()[0].client_public_key, "c1");
        assert_eq!(store.list_survey_responses().unwrap().len(), 1);
        assert!(!path.with_extension("json.tmp").exists());
        fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn missing_file_opens_empty() {
        let path = temp_store_path();
        let store = FileStore::open(&path).unwrap();
        assert!(store.list_signup_records().unwrap().is_empty());
        assert!(store.data_keys().unwrap().is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn handles_on_one_file_see_each_others_writes() {
        let path = temp_store_path();
        let mut daemon = FileStore::open(&path).unwrap();
        let mut cli = FileStore::open(&path).unwrap();

        daemon.add_data_point("age", "1").unwrap();
        cli.add_data_point("age", "2").unwrap();
        assert_eq!(daemon.list_data_points("age").unwrap(), vec!["1", "2"]);

        daemon.add_data_point("other", "x").unwrap();
        cli.add_signup_record(record("s1", "c1")).unwrap();
        assert!(matches!(
            daemon.add_signup_record(record("s1", "c2")),
            Err(StorageError::DuplicateSignup(_))
        ));

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(reopened.list_data_points("age").unwrap(), vec!["1", "2"]);
        assert_eq!(reopened.list_data_points("other").unwrap(), vec!["x"]);
        assert_eq!(reopened.list_signup_records().unwrap()[0].client_public_key, "c1");
        assert_eq!(reopened.data_keys().unwrap(), vec!["age", "other"]);
        fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn corrupt_file_is_rejected_without_being_overwritten() {
        let path = temp_store_path();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"not json").unwrap();
        assert!(matches!(FileStore::open(&path), Err(StorageError::Codec(_))));
        assert_eq!(fs::read(&path).unwrap(), b"not json");
        fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }
}
