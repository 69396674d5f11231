// Keyed session pool bookkeeping
//
// The table is guarded by a single mutex that is never held while a session
// is being opened or closed; network I/O always happens outside the lock.
// A session runs one command at a time: once `max_per_key` sessions exist for
// a key, further callers wait for one to be handed back.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::output::errors::Result;

/// A live session that can be parked in a [`SessionPool`]
pub trait PooledSession: Send + Sync + 'static {
    /// Cheap local liveness check, no network round trip
    fn is_alive(&self) -> bool;

    /// Best-effort teardown; may block on network I/O
    fn close(&self) {}
}

struct PoolEntry<S> {
    id: u64,
    session: Arc<S>,
    in_use: bool,
    last_used: Instant,
}

/// Sessions for one fingerprint plus connects still in progress
struct KeySlot<S> {
    entries: Vec<PoolEntry<S>>,
    connecting: usize,
}

impl<S> Default for KeySlot<S> {
    fn default() -> Self {
        KeySlot {
            entries: Vec::new(),
            connecting: 0,
        }
    }
}

enum Checkout<S> {
    Ready(PoolHandle<S>),
    Connect,
    Wait,
}

/// A checked-out session; hand it back with `release` or `discard`
pub struct PoolHandle<S> {
    key: String,
    id: u64,
    session: Arc<S>,
}

impl<S> PoolHandle<S> {
    pub fn session(&self) -> &S {
        &self.session
    }
}

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub keys: usize,
    pub sessions: usize,
    pub in_use: usize,
}

/// Sessions keyed by connection fingerprint, each lent to one caller at a time
pub struct SessionPool<S> {
    slots: Mutex<HashMap<String, KeySlot<S>>>,
    released: Notify,
    next_id: AtomicU64,
    max_per_key: usize,
    idle_timeout: Duration,
}

/// Gives a connect reservation back if the connect never completes
struct Reservation<'a, S: PooledSession> {
    pool: &'a SessionPool<S>,
    key: &'a str,
    armed: bool,
}

impl<S: PooledSession> Drop for Reservation<'_, S> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.unreserve(self.key);
        }
    }
}

impl<S: PooledSession> SessionPool<S> {
    pub fn new(max_per_key: usize, idle_timeout: Duration) -> Self {
        SessionPool {
            slots: Mutex::new(HashMap::new()),
            released: Notify::new(),
            next_id: AtomicU64::new(1),
            max_per_key: max_per_key.max(1),
            idle_timeout,
        }
    }

    /// Reuse an idle session for `key`, open a new one with `connect` while
    /// under the per-key cap, or wait for a busy one to be released. A
    /// failing `connect` only affects this caller.
    pub async fn acquire_with<F, Fut>(&self, key: &str, connect: F) -> Result<PoolHandle<S>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<S>>,
    {
        loop {
            match self.checkout(key) {
                Checkout::Ready(handle) => return Ok(handle),
                Checkout::Connect => break,
                Checkout::Wait => self.released.notified().await,
            }
        }

        let mut reservation = Reservation {
            pool: self,
            key,
            armed: true,
        };
        let session = Arc::new(connect().await?);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut slots = self.slots.lock();
            let slot = slots.entry(key.to_string()).or_default();
            slot.connecting = slot.connecting.saturating_sub(1);
            slot.entries.push(PoolEntry {
                id,
                session: session.clone(),
                in_use: true,
                last_used: Instant::now(),
            });
        }
        reservation.armed = false;

        debug!(key = %short_key(key), session = id, "opened pooled session");

        Ok(PoolHandle {
            key: key.to_string(),
            id,
            session,
        })
    }

    fn checkout(&self, key: &str) -> Checkout<S> {
        let mut dead = Vec::new();

        let outcome = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(key.to_string()).or_default();

            // Drop idle sessions that died while parked
            let (alive, stale): (Vec<_>, Vec<_>) = std::mem::take(&mut slot.entries)
                .into_iter()
                .partition(|e| e.in_use || e.session.is_alive());
            slot.entries = alive;
            dead.extend(stale.into_iter().map(|e| e.session));

            if let Some(entry) = slot.entries.iter_mut().find(|e| !e.in_use) {
                entry.in_use = true;
                entry.last_used = Instant::now();
                Checkout::Ready(PoolHandle {
                    key: key.to_string(),
                    id: entry.id,
                    session: entry.session.clone(),
                })
            } else if slot.entries.len() + slot.connecting < self.max_per_key {
                slot.connecting += 1;
                Checkout::Connect
            } else {
                Checkout::Wait
            }
        };

        for session in dead {
            session.close();
        }

        outcome
    }

    fn unreserve(&self, key: &str) {
        {
            let mut slots = self.slots.lock();
            if let Some(slot) = slots.get_mut(key) {
                slot.connecting = slot.connecting.saturating_sub(1);
                if slot.entries.is_empty() && slot.connecting == 0 {
                    slots.remove(key);
                }
            }
        }
        self.released.notify_one();
    }

    /// Return a session for reuse; it stays open
    pub fn release(&self, handle: PoolHandle<S>) {
        {
            let mut slots = self.slots.lock();
            if let Some(entry) = slots
                .get_mut(&handle.key)
                .and_then(|slot| slot.entries.iter_mut().find(|e| e.id == handle.id))
            {
                entry.in_use = false;
                entry.last_used = Instant::now();
            }
        }
        self.released.notify_one();
    }

    /// Remove and close a broken session so nobody picks it up again
    pub fn discard(&self, handle: PoolHandle<S>) {
        let removed = {
            let mut slots = self.slots.lock();
            slots.get_mut(&handle.key).and_then(|slot| {
                slot.entries
                    .iter()
                    .position(|e| e.id == handle.id)
                    .map(|idx| slot.entries.remove(idx))
            })
        };
        self.released.notify_one();

        if let Some(entry) = removed {
            debug!(key = %short_key(&handle.key), session = entry.id, "discarded pooled session");
            entry.session.close();
        }
    }

    /// Close sessions idle for at least the inactivity window
    pub fn reap_idle(&self) -> usize {
        let expired: Vec<Arc<S>> = {
            let mut slots = self.slots.lock();
            let mut expired = Vec::new();
            for slot in slots.values_mut() {
                let (keep, idle): (Vec<_>, Vec<_>) = std::mem::take(&mut slot.entries)
                    .into_iter()
                    .partition(|e| e.in_use || e.last_used.elapsed() < self.idle_timeout);
                slot.entries = keep;
                expired.extend(idle.into_iter().map(|e| e.session));
            }
            slots.retain(|_, slot| !slot.entries.is_empty() || slot.connecting > 0);
            expired
        };

        for session in &expired {
            session.close();
        }
        if !expired.is_empty() {
            debug!(closed = expired.len(), "reaped idle sessions");
        }
        expired.len()
    }

    /// Forget every session; idle ones are closed, busy ones close when
    /// their last handle is dropped
    pub fn close_all(&self) {
        let drained: Vec<PoolEntry<S>> = self
            .slots
            .lock()
            .drain()
            .flat_map(|(_, slot)| slot.entries)
            .collect();

        for entry in drained.into_iter().filter(|e| !e.in_use) {
            entry.session.close();
        }
    }

    pub fn stats(&self) -> PoolStats {
        let slots = self.slots.lock();
        PoolStats {
            keys: slots.values().filter(|slot| !slot.entries.is_empty()).count(),
            sessions: slots.values().map(|slot| slot.entries.len()).sum(),
            in_use: slots
                .values()
                .flat_map(|slot| &slot.entries)
                .filter(|e| e.in_use)
                .count(),
        }
    }
}

/// Periodically reap idle sessions until the pool is dropped
pub fn spawn_reaper<S: PooledSession>(pool: &Arc<SessionPool<S>>, every: Duration) -> JoinHandle<()> {
    let weak: Weak<SessionPool<S>> = Arc::downgrade(pool);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(pool) = weak.upgrade() else { break };
            // Closing sessions may block on the network
            let _ = tokio::task::spawn_blocking(move || pool.reap_idle()).await;
        }
    })
}

fn short_key(key: &str) -> &str {
    &key[..key.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::errors::BatchError;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    #[derive(Default)]
    struct FakeSession {
        dead: AtomicBool,
        closed: AtomicBool,
    }

    impl PooledSession for FakeSession {
        fn is_alive(&self) -> bool {
            !self.dead.load(Ordering::SeqCst)
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn pool(max: usize, idle: Duration) -> SessionPool<FakeSession> {
        SessionPool::new(max, idle)
    }

    async fn open(pool: &SessionPool<FakeSession>, key: &str, opened: &AtomicUsize) -> PoolHandle<FakeSession> {
        pool.acquire_with(key, || async {
            opened.fetch_add(1, Ordering::SeqCst);
            Ok(FakeSession::default())
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_released_session_is_reused() {
        let pool = pool(2, Duration::from_secs(60));
        let opened = AtomicUsize::new(0);

        let first = open(&pool, "a", &opened).await;
        let first_id = first.id;
        pool.release(first);

        let second = open(&pool, "a", &opened).await;
        assert_eq!(second.id, first_id);
        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_busy_sessions_are_never_shared() {
        let pool = Arc::new(pool(2, Duration::from_secs(60)));
        let opened = AtomicUsize::new(0);

        let a = open(&pool, "k", &opened).await;
        let b = open(&pool, "k", &opened).await;
        assert_ne!(a.id, b.id);
        let a_id = a.id;

        // At the cap: a third caller waits instead of joining a busy session
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.acquire_with("k", || async { Err(BatchError::connection("k", "unexpected connect")) })
                    .await
            })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!waiter.is_finished());
        assert_eq!(pool.stats().in_use, 2);

        pool.release(a);
        let c = waiter.await.unwrap().unwrap();
        assert_eq!(c.id, a_id);
        assert_eq!(opened.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().in_use, 2);
    }

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let pool = pool(1, Duration::from_secs(60));
        let opened = AtomicUsize::new(0);

        let _a = open(&pool, "a", &opened).await;
        let err = pool
            .acquire_with("b", || async { Err(BatchError::connection("b", "auth failed")) })
            .await;
        assert!(err.is_err());

        // Failure on "b" leaves "a" untouched
        let stats = pool.stats();
        assert_eq!(stats.keys, 1);
        assert_eq!(stats.in_use, 1);

        // and frees the connect slot for the next caller
        let _b = open(&pool, "b", &opened).await;
        assert_eq!(pool.stats().keys, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_connect_frees_its_slot() {
        let pool = pool(1, Duration::from_secs(60));
        let opened = AtomicUsize::new(0);

        let stuck = pool.acquire_with("k", futures::future::pending::<Result<FakeSession>>);
        assert!(tokio::time::timeout(Duration::from_secs(1), stuck).await.is_err());

        let _a = open(&pool, "k", &opened).await;
        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dead_idle_session_is_replaced() {
        let pool = pool(1, Duration::from_secs(60));
        let opened = AtomicUsize::new(0);

        let a = open(&pool, "k", &opened).await;
        a.session().dead.store(true, Ordering::SeqCst);
        let stale = a.session.clone();
        pool.release(a);

        let _b = open(&pool, "k", &opened).await;
        assert_eq!(opened.load(Ordering::SeqCst), 2);
        assert!(stale.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_discard_removes_session() {
        let pool = pool(1, Duration::from_secs(60));
        let opened = AtomicUsize::new(0);

        let a = open(&pool, "k", &opened).await;
        let session = a.session.clone();
        pool.discard(a);

        assert!(session.closed.load(Ordering::SeqCst));
        assert_eq!(pool.stats(), PoolStats::default());
    }

    #[tokio::test]
    async fn test_reap_only_idle_sessions() {
        let pool = pool(2, Duration::ZERO);
        let opened = AtomicUsize::new(0);

        let busy = open(&pool, "k", &opened).await;
        let idle = open(&pool, "k", &opened).await;
        let idle_session = idle.session.clone();
        pool.release(idle);

        assert_eq!(pool.reap_idle(), 1);
        assert!(idle_session.closed.load(Ordering::SeqCst));
        assert!(!busy.session().closed.load(Ordering::SeqCst));
        assert_eq!(pool.stats().sessions, 1);
    }
}
