//! Train-once CAV cache over a pluggable persistence backend.
//!
//! A stored CAV is trusted as-is: there is no staleness check against the
//! activations or the model that produced it. Only its key is checked.

use super::{Cav, CavKey};
use crate::error::{Result, TcavError};
use crate::persistence::{atomic_write_json, file_component, load_json, walk_json_files};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Where trained CAVs live between runs.
pub trait CavPersistence {
    fn save(&self, key: &CavKey, cav: &Cav) -> Result<()>;

    /// `Ok(None)` when nothing is stored under `key`.
    fn load(&self, key: &CavKey) -> Result<Option<Cav>>;

    /// Keys of every stored CAV, sorted.
    fn list(&self) -> Result<Vec<CavKey>>;
}

/// One pretty-printed JSON file per CAV, at
/// `<dir>/<concept>/<layer>/<baseline>.json` with each name percent-encoded.
#[derive(Debug, Clone)]
pub struct JsonCavPersistence {
    dir: PathBuf,
}

impl JsonCavPersistence {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &CavKey) -> PathBuf {
        self.dir
            .join(file_component(&key.concept))
            .join(file_component(&key.layer))
            .join(format!("{}.json", file_component(&key.baseline)))
    }

    /// Every stored CAV, in path order.
    pub fn load_all(&self) -> Result<Vec<Cav>> {
        let mut cavs = Vec::new();
        for path in walk_json_files(&self.dir) {
            if let Some(cav) = load_json::<Cav>(&path)? {
                cavs.push(cav);
            }
        }
        Ok(cavs)
    }
}

impl CavPersistence for JsonCavPersistence {
    fn save(&self, key: &CavKey, cav: &Cav) -> Result<()> {
        let path = self.path_for(key);
        atomic_write_json(&path, cav)?;
        tracing::debug!(key = %key, path = %path.display(), "Saved CAV");
        Ok(())
    }

    fn load(&self, key: &CavKey) -> Result<Option<Cav>> {
        let path = self.path_for(key);
        let Some(cav) = load_json::<Cav>(&path)? else {
            return Ok(None);
        };
        if cav.key() != *key {
            tracing::warn!(
                key = %key,
                stored = %cav.key(),
                path = %path.display(),
                "Ignoring CAV file holding another key"
            );
            return Ok(None);
        }
        Ok(Some(cav))
    }

    fn list(&self) -> Result<Vec<CavKey>> {
        let mut keys: Vec<CavKey> = self.load_all()?.iter().map(Cav::key).collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

/// Process-local persistence, for tests and throwaway runs.
#[derive(Debug, Default)]
pub struct MemoryCavPersistence {
    cavs: Mutex<HashMap<CavKey, Cav>>,
}

impl MemoryCavPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a stored CAV, bypassing the store.
    pub fn insert(&self, cav: Cav) {
        let mut cavs = self.cavs.lock().unwrap_or_else(PoisonError::into_inner);
        cavs.insert(cav.key(), cav);
    }
}

impl CavPersistence for MemoryCavPersistence {
    fn save(&self, key: &CavKey, cav: &Cav) -> Result<()> {
        let mut cavs = self.cavs.lock().unwrap_or_else(PoisonError::into_inner);
        cavs.insert(key.clone(), cav.clone());
        Ok(())
    }

    fn load(&self, key: &CavKey) -> Result<Option<Cav>> {
        let cavs = self.cavs.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(cavs.get(key).cloned())
    }

    fn list(&self) -> Result<Vec<CavKey>> {
        let cavs = self.cavs.lock().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<CavKey> = cavs.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

/// Cache policy: load if present, otherwise train, save and return.
///
/// Requests for the same key are serialized so a key is trained at most once
/// per store; different keys never wait on each other.
pub struct CavStore<P> {
    persistence: P,
    locks: Mutex<HashMap<CavKey, Arc<Mutex<()>>>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl<P: CavPersistence> CavStore<P> {
    pub fn new(persistence: P) -> Self {
        Self {
            persistence,
            locks: Mutex::new(HashMap::new()),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    pub fn persistence(&self) -> &P {
        &self.persistence
    }

    pub fn get_or_train<F>(&self, key: &CavKey, train: F) -> Result<Cav>
    where
        F: FnOnce() -> Result<Cav>,
    {
        let lock = self.key_lock(key);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        match self.persistence.load(key)? {
            Some(cav) if cav.key() == *key => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    key = %key,
                    trained_at = %cav.trained_at,
                    "Reusing cached CAV without revalidation"
                );
                return Ok(cav);
            }
            Some(cav) => {
                tracing::warn!(
                    key = %key,
                    stored = %cav.key(),
                    "Stored CAV has another key, retraining"
                );
            }
            None => {}
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(key = %key, "No cached CAV, training");
        let cav = train()?;
        if cav.key() != *key {
            return Err(TcavError::invalid_input(format!(
                "trainer produced {} for requested key {key}",
                cav.key()
            )));
        }
        self.persistence.save(key, &cav)?;
        Ok(cav)
    }

    /// Number of requests answered from persistence.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    /// Number of requests that trained a new CAV.
    pub fn misses(&self) -> usize {
        self.misses.load(Ordering::Relaxed)
    }

    fn key_lock(&self, key: &CavKey) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key.clone()).or_default())
    }
}
