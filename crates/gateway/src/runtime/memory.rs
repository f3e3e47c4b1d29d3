//! Persistent key-value memory for the agent's memory tools.
//!
//! A single JSON document under the data directory, written through
//! atomically on every mutation. Mutations return the prior value so the
//! action log can record an exact inverse.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde_json::Value;

use ud_domain::error::Result;

pub struct MemoryStore {
    inner: Mutex<BTreeMap<String, Value>>,
    path: PathBuf,
}

impl MemoryStore {
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join("memory.json");
        let map = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(map) => map,
                Err(e) => {
                    tracing::warn!(error = %e, "corrupt memory store, starting empty");
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        Ok(Self {
            inner: Mutex::new(map),
            path,
        })
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.lock().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().keys().cloned().collect()
    }

    /// Set a key, returning the prior value (`None` = was absent).
    pub fn set(&self, key: &str, value: Value) -> Result<Option<Value>> {
        let prior = {
            let mut inner = self.inner.lock();
            inner.insert(key.to_owned(), value)
        };
        self.persist()?;
        Ok(prior)
    }

    /// Delete a key, returning the prior value.
    pub fn delete(&self, key: &str) -> Result<Option<Value>> {
        let prior = self.inner.lock().remove(key);
        if prior.is_some() {
            self.persist()?;
        }
        Ok(prior)
    }

    /// Restore a key to a recorded state (`None` = absent). The undo
    /// service's inverse for memory mutations.
    pub fn restore(&self, key: &str, value: Option<&Value>) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            match value {
                Some(v) => {
                    inner.insert(key.to_owned(), v.clone());
                }
                None => {
                    inner.remove(key);
                }
            }
        }
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let json = {
            let inner = self.inner.lock();
            serde_json::to_string_pretty(&*inner)?
        };
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
