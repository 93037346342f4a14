//! TTL variable cache with read coalescing.
//!
//! Concurrent reads of the same variable share one remote round trip: the
//! first caller becomes the leader and performs the fetch, later callers
//! wait on the leader's published outcome. An invalidation pops the cached
//! value and cancels the in-flight read; cancelled reads are retried so the
//! value finally returned comes from a request issued after the
//! invalidation.
//!
//! Lock order is always `values` before `pending`.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::RwLock;
use tokio::sync::watch;

use crate::error::{AggError, Result};
use crate::table::DataTable;

/// How many times a read cancelled by invalidation is retried.
pub const CANCELLED_READ_RETRIES: usize = 1;

#[derive(Debug, Clone)]
struct CachedValue {
    value: DataTable,
    stored_at: Instant,
}

#[derive(Debug, Clone)]
enum ReadState {
    InFlight,
    Done(DataTable),
    Failed { message: String, disconnection: bool },
    Cancelled,
}

struct PendingRead {
    id: u64,
    cancelled: AtomicBool,
    state: watch::Sender<ReadState>,
}

impl PendingRead {
    fn new(id: u64) -> Self {
        let (state, _) = watch::channel(ReadState::InFlight);
        Self {
            id,
            cancelled: AtomicBool::new(false),
            state,
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.state.send_replace(ReadState::Cancelled);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

pub struct VariableCache {
    values: RwLock<LruCache<String, CachedValue>>,
    pending: DashMap<String, Arc<PendingRead>>,
    next_read_id: AtomicU64,
}

impl VariableCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            values: RwLock::new(LruCache::new(capacity)),
            pending: DashMap::new(),
            next_read_id: AtomicU64::new(1),
        }
    }

    /// Cached value younger than `ttl`. Expired entries are dropped.
    pub fn get_fresh(&self, name: &str, ttl: Duration) -> Option<DataTable> {
        let stored_at = {
            let values = self.values.read();
            let cached = values.peek(name)?;
            if cached.stored_at.elapsed() < ttl {
                return Some(cached.value.clone());
            }
            cached.stored_at
        };

        let mut values = self.values.write();
        if values.peek(name).map_or(false, |c| c.stored_at == stored_at) {
            values.pop(name);
        }
        None
    }

    pub fn insert(&self, name: &str, value: DataTable) {
        self.values.write().put(
            name.to_string(),
            CachedValue {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    /// Drop the cached value and cancel any read in flight for `name`.
    pub fn invalidate(&self, name: &str) {
        let mut values = self.values.write();
        values.pop(name);
        if let Some((_, pending)) = self.pending.remove(name) {
            tracing::trace!("Cancelling in-flight read of '{}'", name);
            pending.cancel();
        }
    }

    /// Drop every value and cancel every in-flight read.
    pub fn clear(&self) {
        let mut values = self.values.write();
        values.clear();
        let names: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, pending)) = self.pending.remove(&name) {
                pending.cancel();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads currently in flight.
    pub fn pending_reads(&self) -> usize {
        self.pending.len()
    }

    /// Return the cached value of `name`, or fetch it with at most one
    /// concurrent `fetch` per name.
    ///
    /// `ttl` of `None` disables caching but still coalesces.
    pub async fn read_through<F, Fut>(
        &self,
        name: &str,
        ttl: Option<Duration>,
        fetch: F,
    ) -> Result<DataTable>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<DataTable>>,
    {
        let mut cancellations = 0;
        loop {
            if let Some(ttl) = ttl {
                if let Some(value) = self.get_fresh(name, ttl) {
                    return Ok(value);
                }
            }

            let (pending, leader) = match self.pending.entry(name.to_string()) {
                Entry::Occupied(entry) => (entry.get().clone(), false),
                Entry::Vacant(entry) => {
                    let id = self.next_read_id.fetch_add(1, Ordering::Relaxed);
                    let pending = Arc::new(PendingRead::new(id));
                    entry.insert(pending.clone());
                    (pending, true)
                }
            };

            let outcome = if leader {
                self.lead(name, ttl, &pending, fetch()).await
            } else {
                follow(name, &pending).await
            };

            match outcome {
                Some(result) => return result,
                None => {
                    cancellations += 1;
                    if cancellations > CANCELLED_READ_RETRIES {
                        return Err(AggError::ReadCancelled {
                            variable: name.to_string(),
                        });
                    }
                    tracing::debug!("Read of '{}' was invalidated, retrying", name);
                }
            }
        }
    }

    /// `None` when the read was cancelled.
    async fn lead<Fut>(
        &self,
        name: &str,
        ttl: Option<Duration>,
        pending: &Arc<PendingRead>,
        fetch: Fut,
    ) -> Option<Result<DataTable>>
    where
        Fut: Future<Output = Result<DataTable>>,
    {
        let mut guard = LeaderGuard {
            cache: self,
            name,
            pending,
            armed: true,
        };

        let result = fetch.await;

        let state = {
            let mut values = self.values.write();
            let state = if pending.is_cancelled() {
                ReadState::Cancelled
            } else {
                match &result {
                    Ok(value) => {
                        if ttl.is_some() {
                            values.put(
                                name.to_string(),
                                CachedValue {
                                    value: value.clone(),
                                    stored_at: Instant::now(),
                                },
                            );
                        }
                        ReadState::Done(value.clone())
                    }
                    Err(e) => ReadState::Failed {
                        message: e.to_string(),
                        disconnection: e.is_disconnection(),
                    },
                }
            };
            self.pending.remove_if(name, |_, p| p.id == pending.id);
            state
        };
        guard.armed = false;

        let cancelled = matches!(state, ReadState::Cancelled);
        pending.state.send_replace(state);
        if cancelled {
            None
        } else {
            Some(result)
        }
    }
}

async fn follow(name: &str, pending: &PendingRead) -> Option<Result<DataTable>> {
    let mut rx = pending.state.subscribe();
    let state = match rx
        .wait_for(|s| !matches!(s, ReadState::InFlight))
        .await
    {
        Ok(state) => (*state).clone(),
        Err(_) => ReadState::Cancelled,
    };

    match state {
        ReadState::Done(value) => Some(Ok(value)),
        ReadState::Failed {
            message,
            disconnection: true,
        } => Some(Err(AggError::Disconnected(message))),
        ReadState::Failed { message, .. } => Some(Err(AggError::PendingRead {
            variable: name.to_string(),
            message,
        })),
        ReadState::Cancelled | ReadState::InFlight => None,
    }
}

/// Cancels the read when the leader is dropped before publishing.
struct LeaderGuard<'a> {
    cache: &'a VariableCache,
    name: &'a str,
    pending: &'a Arc<PendingRead>,
    armed: bool,
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let id = self.pending.id;
        self.cache.pending.remove_if(self.name, |_, p| p.id == id);
        self.pending.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Record;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    fn table(value: &str) -> DataTable {
        DataTable::single(Record::new().with("value", value))
    }

    #[test]
    fn test_fresh_and_expired() {
        let cache = VariableCache::new(4);
        cache.insert("a", table("1"));
        assert_eq!(cache.get_fresh("a", Duration::from_secs(60)), Some(table("1")));
        assert_eq!(cache.get_fresh("a", Duration::ZERO), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_evicts_least_recent() {
        let cache = VariableCache::new(2);
        cache.insert("a", table("1"));
        cache.insert("b", table("2"));
        cache.insert("c", table("3"));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get_fresh("a", Duration::from_secs(60)), None);
    }

    #[tokio::test]
    async fn test_read_through_caches_with_ttl() {
        let cache = VariableCache::new(4);
        let calls = AtomicUsize::new(0);
        let fetch = || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(table("v")) }
        };

        let ttl = Some(Duration::from_secs(60));
        assert_eq!(cache.read_through("a", ttl, fetch).await.unwrap(), table("v"));
        assert_eq!(cache.read_through("a", ttl, fetch).await.unwrap(), table("v"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.pending_reads(), 0);
    }

    #[tokio::test]
    async fn test_read_through_without_ttl_does_not_cache() {
        let cache = VariableCache::new(4);
        let calls = AtomicUsize::new(0);
        let fetch = || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(table("v")) }
        };

        cache.read_through("a", None, fetch).await.unwrap();
        cache.read_through("a", None, fetch).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_reads_coalesce() {
        let cache = Arc::new(VariableCache::new(4));
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        let mut readers = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            let gate = gate.clone();
            readers.push(tokio::spawn(async move {
                cache
                    .read_through("a", Some(Duration::from_secs(60)), || {
                        let calls = calls.clone();
                        let gate = gate.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            gate.notified().await;
                            Ok(table("shared"))
                        }
                    })
                    .await
            }));
        }

        while cache.pending_reads() == 0 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.notify_one();

        for reader in readers {
            assert_eq!(reader.await.unwrap().unwrap(), table("shared"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidation_retries_in_flight_read() {
        let cache = Arc::new(VariableCache::new(4));
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        let reader = {
            let cache = cache.clone();
            let calls = calls.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                cache
                    .read_through("a", Some(Duration::from_secs(60)), || {
                        let n = calls.fetch_add(1, Ordering::SeqCst);
                        let gate = gate.clone();
                        async move {
                            if n == 0 {
                                gate.notified().await;
                                Ok(table("stale"))
                            } else {
                                Ok(table("fresh"))
                            }
                        }
                    })
                    .await
            })
        };

        while cache.pending_reads() == 0 {
            tokio::task::yield_now().await;
        }
        cache.invalidate("a");
        gate.notify_one();

        assert_eq!(reader.await.unwrap().unwrap(), table("fresh"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.get_fresh("a", Duration::from_secs(60)), Some(table("fresh")));
    }

    #[tokio::test]
    async fn test_repeated_invalidation_gives_up() {
        let cache = Arc::new(VariableCache::new(4));
        let invalidator = cache.clone();
        let result = cache
            .read_through("a", None, || {
                let invalidator = invalidator.clone();
                async move {
                    invalidator.invalidate("a");
                    Ok(table("never"))
                }
            })
            .await;
        assert!(matches!(result, Err(AggError::ReadCancelled { .. })));
        assert_eq!(cache.pending_reads(), 0);
    }

    #[tokio::test]
    async fn test_follower_sees_leader_failure() {
        let cache = Arc::new(VariableCache::new(4));
        let gate = Arc::new(Notify::new());

        let leader = {
            let cache = cache.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                cache
                    .read_through("a", None, || {
                        let gate = gate.clone();
                        async move {
                            gate.notified().await;
                            Err(AggError::Context("denied".into()))
                        }
                    })
                    .await
            })
        };

        while cache.pending_reads() == 0 {
            tokio::task::yield_now().await;
        }
        let follower = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .read_through("a", None, || async { Ok(table("unused")) })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.notify_one();

        assert!(matches!(leader.await.unwrap(), Err(AggError::Context(_))));
        assert!(matches!(
            follower.await.unwrap(),
            Err(AggError::PendingRead { .. })
        ));
    }

    #[tokio::test]
    async fn test_dropped_leader_releases_pending() {
        let cache = VariableCache::new(4);
        let read = cache.read_through("a", None, || std::future::pending::<Result<DataTable>>());
        let timed_out = tokio::time::timeout(Duration::from_millis(10), read).await;
        assert!(timed_out.is_err());
        assert_eq!(cache.pending_reads(), 0);
    }
}
