//! Token usage accounting.
//!
//! One record per completed run, appended to `usage.json` and capped to
//! the newest entries so the file never grows without bound.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ud_domain::error::Result;
use ud_domain::stream::Usage;

const MAX_RECORDS: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub ts: DateTime<Utc>,
    pub run_id: Uuid,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

pub struct UsageLog {
    inner: Mutex<VecDeque<UsageRecord>>,
    path: PathBuf,
}

impl UsageLog {
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join("usage.json");
        let records = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => VecDeque::new(),
        };
        Ok(Self {
            inner: Mutex::new(records),
            path,
        })
    }

    pub fn record(&self, run_id: Uuid, usage: &Usage) {
        {
            let mut inner = self.inner.lock();
            inner.push_back(UsageRecord {
                ts: Utc::now(),
                run_id,
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            });
            while inner.len() > MAX_RECORDS {
                inner.pop_front();
            }
        }
        if let Err(e) = self.persist() {
            tracing::warn!(error = %e, "usage persist failed");
        }
    }

    pub fn list(&self) -> Vec<UsageRecord> {
        self.inner.lock().iter().cloned().collect()
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
