//! Atomic write-to-temp-then-rename JSON persistence for the pool's account
//! list (SPEC_FULL.md §4.G, §9 design note: "JSON-on-disk atomicity").
//! Readers never lock since a rename is atomic; writers serialise through
//! an internal mutex so two saves never interleave.

use crate::account::Account;
use crate::error::PersistenceError;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PersistedPool {
    pub accounts: Vec<Account>,
    pub cursor: usize,
}

pub struct PoolStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl PoolStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), write_lock: Mutex::new(()) }
    }

    pub fn load(&self) -> Result<PersistedPool, PersistenceError> {
        load_from(&self.path)
    }

    /// Loads the persisted pool, or returns an empty one if the file has
    /// never been written.
    pub fn load_or_default(&self) -> Result<PersistedPool, PersistenceError> {
        if !self.path.exists() {
            return Ok(PersistedPool { accounts: Vec::new(), cursor: 0 });
        }
        self.load()
    }

    pub fn save(&self, pool: &PersistedPool) -> Result<(), PersistenceError> {
        let _guard = self.write_lock.lock().expect("pool store writer lock poisoned");
        save_atomically(&self.path, pool)
    }
}

fn load_from(path: &Path) -> Result<PersistedPool, PersistenceError> {
    let bytes = fs::read(path).map_err(|source| PersistenceError::Read { path: path.display().to_string(), source })?;
    serde_json::from_slice(&bytes).map_err(|source| PersistenceError::Decode { path: path.display().to_string(), source })
}

fn save_atomically(path: &Path, pool: &PersistedPool) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|source| PersistenceError::Write { path: path.display().to_string(), source })?;
    }

    let tmp_path = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
    let bytes = serde_json::to_vec_pretty(pool).expect("pool state is always serialisable");
    fs::write(&tmp_path, bytes).map_err(|source| PersistenceError::Write { path: tmp_path.display().to_string(), source })?;
    fs::rename(&tmp_path, path).map_err(|source| PersistenceError::Write { path: path.display().to_string(), source })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::CredentialSource;
    use time::OffsetDateTime;

    #[test]
    fn save_then_load_round_trips() {
        let dir = std::env::temp_dir().join(format!("ccrelay-pool-test-{}", uuid::Uuid::new_v4()));
        let store = PoolStore::new(dir.join("pool.json"));
        let account = Account::new("a@example.com", CredentialSource::Manual { api_key: "k".into() }, OffsetDateTime::now_utc(), 100, 10.0);
        let pool = PersistedPool { accounts: vec![account], cursor: 0 };
        store.save(&pool).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.accounts.len(), 1);
        assert_eq!(loaded.accounts[0].email, "a@example.com");
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn load_or_default_is_empty_when_file_absent() {
        let store = PoolStore::new("/tmp/ccrelay-pool-test-nonexistent-file.json");
        let pool = store.load_or_default().unwrap();
        assert!(pool.accounts.is_empty());
    }
}
