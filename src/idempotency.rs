use dashmap::DashMap;
use std::time::Duration;

use crate::error::Error;
use crate::gateway_util::now_ms;

/// Default lifetime of an idempotency claim
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Bound on how long admission waits for the store before failing open
const STORE_TIMEOUT: Duration = Duration::from_millis(100);

/// Duplicate-request gate. `try_acquire` is an atomic set-if-absent with a
/// TTL; store errors and timeouts are not fatal — admission proceeds.
#[derive(Debug)]
pub enum IdempotencyStore {
    Disabled,
    Memory { keys: DashMap<String, i64> },
}

impl IdempotencyStore {
    pub fn new_disabled() -> Self {
        IdempotencyStore::Disabled
    }

    pub fn new_memory() -> Self {
        IdempotencyStore::Memory {
            keys: DashMap::new(),
        }
    }

    /// Claim `key` for `ttl`. Returns true when this is the first live use.
    pub async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, Error> {
        match self {
            IdempotencyStore::Disabled => Ok(true),
            IdempotencyStore::Memory { keys } => {
                let now = now_ms();
                let expires_at = now + ttl.as_millis() as i64;
                match keys.entry(key.to_string()) {
                    dashmap::Entry::Occupied(mut occupied) => {
                        if *occupied.get() <= now {
                            // Expired claim; take it over
                            occupied.insert(expires_at);
                            Ok(true)
                        } else {
                            Ok(false)
                        }
                    }
                    dashmap::Entry::Vacant(vacant) => {
                        vacant.insert(expires_at);
                        Ok(true)
                    }
                }
            }
        }
    }

    pub async fn release(&self, key: &str) -> Result<(), Error> {
        match self {
            IdempotencyStore::Disabled => Ok(()),
            IdempotencyStore::Memory { keys } => {
                keys.remove(key);
                Ok(())
            }
        }
    }

    /// Drop expired claims. Called opportunistically from the admission path.
    pub fn sweep(&self) {
        if let IdempotencyStore::Memory { keys } = self {
            let now = now_ms();
            keys.retain(|_, expires_at| *expires_at > now);
        }
    }
}

/// Admission-path wrapper: a slow or failing store never blocks a request.
/// On timeout or error the request is admitted and the incident is logged.
pub async fn guarded_try_acquire(store: &IdempotencyStore, key: &str) -> bool {
    match tokio::time::timeout(STORE_TIMEOUT, store.try_acquire(key, DEFAULT_TTL)).await {
        Ok(Ok(first_use)) => first_use,
        Ok(Err(e)) => {
            Error::IdempotencyStore {
                message: format!("try_acquire failed for `{key}`: {e}"),
            }
            .log();
            true
        }
        Err(_) => {
            Error::IdempotencyStore {
                message: format!("try_acquire timed out for `{key}`"),
            }
            .log();
            true
        }
    }
}

/// Release wrapper with the same bounded-timeout discipline.
pub async fn guarded_release(store: &IdempotencyStore, key: &str) {
    match tokio::time::timeout(STORE_TIMEOUT, store.release(key)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            Error::IdempotencyStore {
                message: format!("release failed for `{key}`: {e}"),
            }
            .log();
        }
        Err(_) => {
            Error::IdempotencyStore {
                message: format!("release timed out for `{key}`"),
            }
            .log();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_use_wins() {
        let store = IdempotencyStore::new_memory();
        assert!(store.try_acquire("k", DEFAULT_TTL).await.unwrap());
        assert!(!store.try_acquire("k", DEFAULT_TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_reopens_key() {
        let store = IdempotencyStore::new_memory();
        assert!(store.try_acquire("k", DEFAULT_TTL).await.unwrap());
        store.release("k").await.unwrap();
        assert!(store.try_acquire("k", DEFAULT_TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_claim_is_taken_over() {
        let store = IdempotencyStore::new_memory();
        assert!(store
            .try_acquire("k", Duration::from_millis(0))
            .await
            .unwrap());
        // TTL of zero expires immediately
        assert!(store.try_acquire("k", DEFAULT_TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_disabled_always_admits() {
        let store = IdempotencyStore::new_disabled();
        assert!(store.try_acquire("k", DEFAULT_TTL).await.unwrap());
        assert!(store.try_acquire("k", DEFAULT_TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_drops_expired() {
        let store = IdempotencyStore::new_memory();
        store
            .try_acquire("dead", Duration::from_millis(0))
            .await
            .unwrap();
        store.try_acquire("live", DEFAULT_TTL).await.unwrap();
        store.sweep();
        if let IdempotencyStore::Memory { keys } = &store {
            assert!(!keys.contains_key("dead"));
            assert!(keys.contains_key("live"));
        }
    }

    #[tokio::test]
    async fn test_guarded_acquire_admits_on_duplicate_false() {
        let store = IdempotencyStore::new_memory();
        assert!(guarded_try_acquire(&store, "k").await);
        assert!(!guarded_try_acquire(&store, "k").await);
        guarded_release(&store, "k").await;
        assert!(guarded_try_acquire(&store, "k").await);
    }
}
