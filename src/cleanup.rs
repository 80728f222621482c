//! Retention sweep: per-player and per-day records older than the configured
//! retention window are deleted outright. The store has no expiry mechanism,
//! so without this the key space grows by a full record set per player per
//! day forever.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::records::RETAINED_PREFIXES;
use crate::store::RecordStore;

/// Deletions per sweep. Keeps one sweep's API load bounded; the backlog
/// drains over consecutive runs.
const SWEEP_BATCH: usize = 200;

pub struct RetentionSweeper {
    records: Arc<RecordStore>,
    config: AppConfig,
}

impl RetentionSweeper {
    pub fn new(records: Arc<RecordStore>, config: AppConfig) -> Self {
        Self { records, config }
    }

    pub async fn run_pass(&self, now: DateTime<Utc>) -> anyhow::Result<()> {
        let cutoff = now - chrono::Duration::days(self.config.jobs.retention_days);
        let candidates = self.records.scan_created_before(cutoff, SWEEP_BATCH).await?;

        let mut deleted = 0usize;
        for var in candidates {
            // Singletons (watermark, rotation, stamps) are long-lived by
            // design and never swept.
            if !RETAINED_PREFIXES.iter().any(|p| var.key.starts_with(p)) {
                continue;
            }
            match self.records.delete(&var.id).await {
                Ok(()) => deleted += 1,
                Err(e) => warn!(key = %var.key, error = %e, "Retention delete failed"),
            }
        }
        if deleted > 0 {
            info!(deleted, cutoff = %cutoff, "Retention sweep removed expired records");
        }
        Ok(())
    }
}
