//! Inflight-solve deduplication: at most one solve per cache key at a time.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Sleep applied after a waiter observes the winner's completion, so the
/// winner's cache write has time to propagate before the waiter re-reads.
const STABILIZATION_DELAY: Duration = Duration::from_millis(100);

/// Either this caller is the one who should perform the solve (`Owner`), or
/// someone else is already solving this key and we should wait (`Waiter`).
pub enum Slot {
    Owner(OwnerGuard),
    Waiter(watch::Receiver<bool>),
}

/// Held by the caller that won the race to solve a given key. Dropping it
/// (via [`OwnerGuard::finish`], always call this) wakes every waiter and
/// removes the key so a future distinct solve starts fresh.
///
/// A waiter calls `subscribe()` and then `.changed()`/`.borrow()` on the
/// resulting receiver, which a `watch` channel answers correctly regardless
/// of whether the value was sent before or after the subscribe — unlike
/// `Notify::notify_waiters`, a receiver can never miss a value that was
/// already published by the time it starts watching.
pub struct OwnerGuard {
    map: Arc<DashMap<String, watch::Sender<bool>>>,
    key: String,
    done: Arc<watch::Sender<bool>>,
}

impl OwnerGuard {
    /// Marks the solve as finished. Cleanup (removing the map entry and
    /// waking waiters) happens exactly once, in `Drop`, so this is just a
    /// named place to consume `self` at the natural end of a solve.
    pub fn finish(self) {}
}

impl Drop for OwnerGuard {
    fn drop(&mut self) {
        self.map.remove(&self.key);
        let _ = self.done.send(true);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("cancelled while waiting for inflight solve")]
    Cancelled,
}

/// The inflight map itself. One instance shared across all solver calls.
#[derive(Clone)]
pub struct InflightMap {
    inner: Arc<DashMap<String, watch::Sender<bool>>>,
}

impl Default for InflightMap {
    fn default() -> Self {
        Self { inner: Arc::new(DashMap::new()) }
    }
}

impl InflightMap {
    /// Claims `key`. Returns `Slot::Owner` to the first caller for this key;
    /// every subsequent caller for the same key (while it's still inflight)
    /// gets `Slot::Waiter` subscribed to the same completion channel.
    pub fn claim(&self, key: &str) -> Slot {
        use dashmap::mapref::entry::Entry;

        match self.inner.entry(key.to_string()) {
            Entry::Occupied(entry) => Slot::Waiter(entry.get().subscribe()),
            Entry::Vacant(entry) => {
                let (tx, _rx) = watch::channel(false);
                entry.insert(tx.clone());
                Slot::Owner(OwnerGuard { map: self.inner.clone(), key: key.to_string(), done: Arc::new(tx) })
            }
        }
    }

    /// Waits for the owner of `key` to finish, or for `cancel` to fire,
    /// whichever comes first, then sleeps a short stabilization interval.
    pub async fn wait(mut rx: watch::Receiver<bool>, cancel: &CancellationToken) -> Result<(), WaitError> {
        if !*rx.borrow() {
            tokio::select! {
                result = rx.changed() => {
                    // A closed channel (owner guard dropped without a
                    // successful send, e.g. in a panic unwind before the
                    // `Drop` body runs) is treated the same as completion.
                    let _ = result;
                }
                _ = cancel.cancelled() => return Err(WaitError::Cancelled),
            }
        }
        tokio::time::sleep(STABILIZATION_DELAY).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn only_one_owner_per_key() {
        let map = InflightMap::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let owner_slot = map.claim("host");
        assert!(matches!(owner_slot, Slot::Owner(_)));

        let waiter_slot = map.claim("host");
        let rx = match waiter_slot {
            Slot::Waiter(rx) => rx,
            Slot::Owner(_) => panic!("expected waiter"),
        };

        calls.fetch_add(1, Ordering::SeqCst);
        if let Slot::Owner(guard) = owner_slot {
            guard.finish();
        }

        let cancel = CancellationToken::new();
        InflightMap::wait(rx, &cancel).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn waiter_observes_cancellation() {
        let map = InflightMap::default();
        let _owner = map.claim("host"); // never finishes

        let waiter_slot = map.claim("host");
        let rx = match waiter_slot {
            Slot::Waiter(rx) => rx,
            Slot::Owner(_) => panic!("expected waiter"),
        };

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = InflightMap::wait(rx, &cancel).await;
        assert!(matches!(result, Err(WaitError::Cancelled)));
    }

    #[tokio::test]
    async fn waiter_does_not_miss_a_completion_published_before_it_polls() {
        let map = InflightMap::default();
        let owner_slot = map.claim("host");

        let waiter_slot = map.claim("host");
        let rx = match waiter_slot {
            Slot::Waiter(rx) => rx,
            Slot::Owner(_) => panic!("expected waiter"),
        };

        // Finish the owner right after the waiter subscribes but before it
        // ever polls `changed()`, the exact race a lost wakeup would hit.
        if let Slot::Owner(guard) = owner_slot {
            guard.finish();
        }

        let cancel = CancellationToken::new();
        InflightMap::wait(rx, &cancel).await.unwrap();
    }

    #[test]
    fn key_is_freed_after_owner_finishes() {
        let map = InflightMap::default();
        let slot = map.claim("host");
        if let Slot::Owner(guard) = slot {
            guard.finish();
        }
        assert!(matches!(map.claim("host"), Slot::Owner(_)));
    }
}
