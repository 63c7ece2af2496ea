//! File-backed status store
//!
//! Persists status snapshots to a JSON file shared between broker instances:
//! a single object keyed by instance id. On every write the backend re-reads
//! the file, purges entries from other instances that have not been updated
//! within `instance_expire`, merges its own entry and writes the result back
//! atomically (temp file + rename).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{Status, StatusBackend};
use crate::error::{BrokerError, Result};

pub struct FileStatusBackend {
    path: PathBuf,
    instance: String,
    /// Expiry for statuses informed by other instances.
    instance_expire: Duration,
}

impl FileStatusBackend {
    pub fn new(
        path: impl Into<PathBuf>,
        instance: impl Into<String>,
        instance_expire: Duration,
    ) -> Self {
        Self {
            path: path.into(),
            instance: instance.into(),
            instance_expire,
        }
    }

    async fn read_all(&self) -> BTreeMap<String, Status> {
        match tokio::fs::read(&self.path).await {
            Ok(data) => match serde_json::from_slice(&data) {
                Ok(all) => all,
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e,
                        "status file contents could not be parsed, status will be overwritten");
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        }
    }
}

#[async_trait]
impl StatusBackend for FileStatusBackend {
    fn name(&self) -> &str {
        "file"
    }

    async fn update_status(&self, status: &Status) -> Result<()> {
        let mut all = self.read_all().await;

        // Purge stale entries from other instances. Our own entry is replaced
        // below regardless of age.
        let expire = chrono::Duration::from_std(self.instance_expire)
            .map_err(|e| BrokerError::Status(e.to_string()))?;
        let now = chrono::Utc::now();
        all.retain(|instance, entry| {
            if instance == &self.instance {
                return true;
            }
            let keep = now - entry.last_updated <= expire;
            if !keep {
                info!(instance = %instance, "deleting expired instance status");
            }
            keep
        });

        all.insert(self.instance.clone(), status.clone());

        let data =
            serde_json::to_vec_pretty(&all).map_err(|e| BrokerError::Status(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
