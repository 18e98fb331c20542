//! Periodic background jobs.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::ServerError;
use crate::rate_limit::RateLimiter;
use crate::store::Store;

/// Evict rate-limit buckets idle for longer than this.
const BUCKET_MAX_IDLE: Duration = Duration::from_secs(600);
const BUCKET_SWEEP_EVERY: Duration = Duration::from_secs(300);

/// Delete users deactivated more than `retention_days` ago.
///
/// A window too large to subtract from the current time purges nothing.
pub async fn purge_inactive_users(store: &Store, retention_days: i64) -> Result<usize, ServerError> {
    let Some(cutoff) = chrono::Duration::try_days(retention_days)
        .and_then(|window| Utc::now().checked_sub_signed(window))
    else {
        warn!(retention_days, "retention window out of range, purge skipped");
        return Ok(0);
    };
    store
        .call(move |db| db.purge_inactive_users(cutoff))
        .await
}

pub fn spawn_inactive_user_purge(store: Store, every: Duration, retention_days: i64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            match purge_inactive_users(&store, retention_days).await {
                Ok(removed) => debug!(removed, "inactive user purge finished"),
                Err(e) => warn!(error = %e, "inactive user purge failed"),
            }
        }
    });
}

pub fn spawn_rate_limit_cleanup(limiter: RateLimiter) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(BUCKET_SWEEP_EVERY);
        loop {
            interval.tick().await;
            let removed = limiter.purge_stale(BUCKET_MAX_IDLE);
            if removed > 0 {
                debug!(removed, "rate limiter buckets purged");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use agora_store::Database;

    use super::*;

    #[tokio::test]
    async fn test_purge_respects_retention() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(Database::open_at(&dir.path().join("agora.db")).unwrap());

        let alice = store
            .call(|db| {
                let alice = db.create_user("alice", "opaque-hash")?;
                db.create_user("bob", "opaque-hash")?;
                db.deactivate_user(alice.id)?;
                Ok(alice)
            })
            .await
            .unwrap();

        // Deactivated just now: inside a 30 day window.
        assert_eq!(purge_inactive_users(&store, 30).await.unwrap(), 0);

        // A negative window puts the cut-off in the future.
        assert_eq!(purge_inactive_users(&store, -1).await.unwrap(), 1);

        let gone = store.call(move |db| db.get_user(alice.id)).await;
        assert!(matches!(gone, Err(ServerError::NotFound(_))));
        assert!(store.call(|db| db.get_user_by_username("bob")).await.is_ok());
    }

    #[tokio::test]
    async fn test_purge_with_huge_window_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(Database::open_at(&dir.path().join("agora.db")).unwrap());
        store
            .call(|db| {
                let alice = db.create_user("alice", "opaque-hash")?;
                db.deactivate_user(alice.id)
            })
            .await
            .unwrap();

        assert_eq!(purge_inactive_users(&store, 100_000_000).await.unwrap(), 0);
        assert_eq!(purge_inactive_users(&store, i64::MAX).await.unwrap(), 0);
        assert!(store.call(|db| db.get_user_by_username("alice")).await.is_ok());
    }
}
