// ============================================================================
// Durable Store Interface
// Crash-persistence of escrow contracts, keyed by transaction id
// ============================================================================

use crate::domain::TransactionId;
use crate::escrow::ContractRecord;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("storage I/O failed: {0}")]
    Io(String),

    #[error("record {key} is corrupt: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

/// Key-value persistence for contract records.
///
/// `put` overwrites, `delete` of a missing key succeeds. Each key belongs to
/// exactly one escrow contract.
pub trait DurableStore: Send + Sync {
    fn put(&self, key: &TransactionId, record: &ContractRecord) -> Result<(), StoreError>;

    fn get(&self, key: &TransactionId) -> Result<Option<ContractRecord>, StoreError>;

    fn delete(&self, key: &TransactionId) -> Result<(), StoreError>;

    /// Every record currently stored, used for recovery on startup
    fn load_all(&self) -> Result<Vec<ContractRecord>, StoreError>;
}

// ============================================================================
// In-Memory Store
// ============================================================================

/// Volatile store; survives a registry being dropped and rebuilt, which is
/// enough to exercise crash recovery in tests.
#[derive(Default)]
pub struct InMemoryStore {
    records: Mutex<BTreeMap<TransactionId, ContractRecord>>,
    failing: Mutex<bool>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail until switched back.
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if *self.failing.lock() {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

impl DurableStore for InMemoryStore {
    fn put(&self, key: &TransactionId, record: &ContractRecord) -> Result<(), StoreError> {
        self.check_available()?;
        self.records.lock().insert(*key, record.clone());
        Ok(())
    }

    fn get(&self, key: &TransactionId) -> Result<Option<ContractRecord>, StoreError> {
        self.check_available()?;
        Ok(self.records.lock().get(key).cloned())
    }

    fn delete(&self, key: &TransactionId) -> Result<(), StoreError> {
        self.check_available()?;
        self.records.lock().remove(key);
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<ContractRecord>, StoreError> {
        self.check_available()?;
        Ok(self.records.lock().values().cloned().collect())
    }
}

// ============================================================================
// JSON File Store
// ============================================================================

#[cfg(feature = "serde")]
pub use file_store::JsonFileStore;

#[cfg(feature = "serde")]
mod file_store {
    use super::{DurableStore, StoreError};
    use crate::domain::TransactionId;
    use crate::escrow::ContractRecord;
    use std::fs;
    use std::io::{ErrorKind, Write};
    use std::path::{Path, PathBuf};

    const EXTENSION: &str = "json";

    /// One JSON document per contract in a directory.
    ///
    /// Writes go to a temporary file that is synced and renamed over the
    /// final name, so a crash leaves either the old or the new record.
    pub struct JsonFileStore {
        dir: PathBuf,
    }

    impl JsonFileStore {
        pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
            let dir = dir.as_ref().to_path_buf();
            fs::create_dir_all(&dir)?;
            Ok(Self { dir })
        }

        pub fn dir(&self) -> &Path {
            &self.dir
        }

        fn path_for(&self, key: &TransactionId) -> PathBuf {
            self.dir.join(format!("{}.{}", key, EXTENSION))
        }

        fn read_record(path: &Path) -> Result<ContractRecord, StoreError> {
            let bytes = fs::read(path)?;
            serde_json::from_slice(&bytes).map_err(|err| StoreError::Corrupt {
                key: path.display().to_string(),
                reason: err.to_string(),
            })
        }
    }

    impl DurableStore for JsonFileStore {
        fn put(&self, key: &TransactionId, record: &ContractRecord) -> Result<(), StoreError> {
            let bytes = serde_json::to_vec_pretty(record).map_err(|err| StoreError::Corrupt {
                key: key.to_string(),
                reason: err.to_string(),
            })?;

            let final_path = self.path_for(key);
            let tmp_path = final_path.with_extension("tmp");
            {
                let mut file = fs::File::create(&tmp_path)?;
                file.write_all(&bytes)?;
                file.sync_all()?;
            }
            fs::rename(&tmp_path, &final_path)?;
            Ok(())
        }

        fn get(&self, key: &TransactionId) -> Result<Option<ContractRecord>, StoreError> {
            let path = self.path_for(key);
            match Self::read_record(&path) {
                Ok(record) => Ok(Some(record)),
                Err(StoreError::Io(_)) if !path.exists() => Ok(None),
                Err(err) => Err(err),
            }
        }

        fn delete(&self, key: &TransactionId) -> Result<(), StoreError> {
            match fs::remove_file(self.path_for(key)) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
                Err(err) => Err(err.into()),
            }
        }

        fn load_all(&self) -> Result<Vec<ContractRecord>, StoreError> {
            let mut paths = Vec::new();
            for entry in fs::read_dir(&self.dir)? {
                let path = entry?.path();
                if path.extension().and_then(|ext| ext.to_str()) == Some(EXTENSION) {
                    paths.push(path);
                }
            }
            paths.sort();

            paths.iter().map(|path| Self::read_record(path)).collect()
        }
    }
}
