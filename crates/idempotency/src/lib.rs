use model::time;
use state::{LockAttempt, RecordStore, StateError};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Resolves (caller, idempotency key) pairs to request ids.
///
/// A fresh request id is minted per acquisition attempt; whether it
/// becomes real is decided by the store's conditional create. When the
/// create loses, the caller gets the id the existing lock points at,
/// which is what makes a retried submission return the original
/// request instead of provisioning twice.
pub struct LockManager {
    store: Arc<dyn RecordStore>,
}

/// Result of a lock acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOutcome {
    pub request_id: String,
    /// True when this acquisition created the lock; the caller is then
    /// responsible for writing the request record and enqueuing a job.
    pub is_new: bool,
}

/// The lock key is derived from the caller identity and the
/// caller-supplied key; the caller is never stored on the lock itself.
pub fn lock_key(created_by: &str, idempotency_key: &str) -> String {
    format!("lock#{created_by}#{idempotency_key}")
}

impl LockManager {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        LockManager { store }
    }

    /// Acquire the lock for (caller, key), valid for `ttl` from now.
    ///
    /// Store failures propagate as retriable errors; the caller must
    /// not create a request record without a confirmed lock outcome.
    pub async fn acquire(
        &self,
        created_by: &str,
        idempotency_key: &str,
        ttl: Duration,
    ) -> Result<LockOutcome, StateError> {
        let candidate_id: String = Uuid::new_v4().to_string();
        let ttl_epoch: u64 = time::now_epoch() + ttl.as_secs();

        let attempt: LockAttempt = self
            .store
            .acquire_lock(
                &lock_key(created_by, idempotency_key),
                &candidate_id,
                ttl_epoch,
            )
            .await?;

        Ok(match attempt {
            LockAttempt::Acquired => LockOutcome {
                request_id: candidate_id,
                is_new: true,
            },
            LockAttempt::Held { target_request_id } => LockOutcome {
                request_id: target_request_id,
                is_new: false,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use state_in_memory::InMemoryRecordStore;

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn lock_key_is_deterministic() {
        assert_eq!("lock#alice#k1", lock_key("alice", "k1"));
    }

    #[tokio::test]
    async fn repeated_acquisition_returns_the_original_request_id() {
        let manager = LockManager::new(Arc::new(InMemoryRecordStore::default()));

        let first: LockOutcome = manager.acquire("alice", "k1", TTL).await.unwrap();
        let second: LockOutcome = manager.acquire("alice", "k1", TTL).await.unwrap();

        assert!(first.is_new);
        assert!(!second.is_new);
        assert_eq!(first.request_id, second.request_id);
    }

    #[tokio::test]
    async fn distinct_keys_and_callers_get_distinct_requests() {
        let manager = LockManager::new(Arc::new(InMemoryRecordStore::default()));

        let base: LockOutcome = manager.acquire("alice", "k1", TTL).await.unwrap();
        let other_key: LockOutcome = manager.acquire("alice", "k2", TTL).await.unwrap();
        let other_caller: LockOutcome = manager.acquire("bob", "k1", TTL).await.unwrap();

        assert!(other_key.is_new);
        assert!(other_caller.is_new);
        assert_ne!(base.request_id, other_key.request_id);
        assert_ne!(base.request_id, other_caller.request_id);
    }

    #[tokio::test]
    async fn expired_lock_maps_the_key_to_a_new_request() {
        let manager = LockManager::new(Arc::new(InMemoryRecordStore::default()));

        let first: LockOutcome = manager
            .acquire("alice", "k1", Duration::ZERO)
            .await
            .unwrap();
        let second: LockOutcome = manager.acquire("alice", "k1", TTL).await.unwrap();

        assert!(second.is_new);
        assert_ne!(first.request_id, second.request_id);
    }
}
