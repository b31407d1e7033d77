use crate::store::{LockStore, PurgeCounts, VerificationStore};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{debug, error, info};

pub const CLEANUP_LOCK: &str = "cleanup";

#[derive(Clone, Copy, Debug)]
pub struct CleanupConfig {
    interval: Duration,
    retention: chrono::Duration,
}

impl CleanupConfig {
    #[must_use]
    pub fn new(interval: Duration, retention: chrono::Duration) -> Self {
        Self {
            interval,
            retention,
        }
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        if self.interval.is_zero() {
            Duration::from_secs(60)
        } else {
            self.interval
        }
    }

    #[must_use]
    pub fn retention(&self) -> chrono::Duration {
        self.retention
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600), chrono::Duration::days(7))
    }
}

/// Purge once if this replica wins the cleanup lock. Returns `None` when
/// another replica holds it.
///
/// # Errors
/// Returns an error if the lock or purge query fails.
pub async fn run_cleanup(
    locks: &dyn LockStore,
    store: &dyn VerificationStore,
    config: &CleanupConfig,
    now: DateTime<Utc>,
) -> Result<Option<PurgeCounts>> {
    let hold = chrono::Duration::from_std(config.interval()).context("cleanup interval")?;
    if !locks.try_lock(CLEANUP_LOCK, hold, now).await? {
        debug!("cleanup lock held elsewhere, skipping");
        return Ok(None);
    }

    let counts = store.purge_expired(now - config.retention()).await?;
    info!(
        codes = counts.codes,
        tokens = counts.tokens,
        buckets = counts.buckets,
        "purged expired records"
    );
    Ok(Some(counts))
}

pub fn spawn_cleanup_worker(
    locks: Arc<dyn LockStore>,
    store: Arc<dyn VerificationStore>,
    config: CleanupConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if let Err(err) = run_cleanup(locks.as_ref(), store.as_ref(), &config, Utc::now()).await {
                error!("cleanup run failed: {err:#}");
            }

            sleep(config.interval()).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{codes::tests::sample_code, store::MemoryStore};

    #[tokio::test]
    async fn only_one_replica_purges_per_interval() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let config = CleanupConfig::new(Duration::from_secs(3600), chrono::Duration::days(7));
        let now = Utc::now();

        let mut old = sample_code(now - chrono::Duration::days(10));
        old.code_hash = "old".to_string();
        old.long_code_hash = Some("old-long".to_string());
        store.insert_code(&old).await?;
        store.insert_code(&sample_code(now)).await?;

        let first = run_cleanup(store.as_ref(), store.as_ref(), &config, now).await?;
        assert_eq!(first.map(|c| c.codes), Some(1));
        assert_eq!(store.code_count().await, 1);

        let second = run_cleanup(store.as_ref(), store.as_ref(), &config, now).await?;
        assert!(second.is_none());

        let next_hour = now + chrono::Duration::hours(1);
        let third = run_cleanup(store.as_ref(), store.as_ref(), &config, next_hour).await?;
        assert_eq!(third.map(|c| c.codes), Some(0));
        Ok(())
    }

    #[test]
    fn zero_interval_is_clamped() {
        let config = CleanupConfig::new(Duration::ZERO, chrono::Duration::days(1));
        assert_eq!(config.interval(), Duration::from_secs(60));
    }
}
