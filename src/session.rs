//! Session pool: one live streaming session per path.
//!
//! Handlers run concurrently, so all registration and removal goes through
//! this pool. The pool itself only guards its map; opening and closing
//! remote streams blocks on network I/O and happens under a per-path slot
//! lock instead, so a slow store call on one path never stalls pool
//! operations on other paths.

use crate::error::FsResult;
use crate::store::{GetStream, PutStream};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Read,
    Write,
}

/// Exclusively owned handle to the remote stream of one session.
pub enum SessionStream {
    Get(Box<dyn GetStream>),
    Put(Box<dyn PutStream>),
}

/// Live in-memory state for one path's streaming transfer.
pub struct Session {
    pub path: String,
    pub kind: SessionKind,
    /// Bytes expected to exist on a read session, from the stub record at
    /// creation time. Zero on write sessions.
    pub declared_length: u64,
    /// Running count of bytes consumed (read) or produced (write).
    pub transferred: u64,
    pub stream: SessionStream,
}

type Slot = Arc<tokio::sync::Mutex<Option<Session>>>;

/// Borrowed session, locked for the duration of one handler call.
pub struct SessionGuard {
    guard: OwnedMutexGuard<Option<Session>>,
}

impl Deref for SessionGuard {
    type Target = Session;
    fn deref(&self) -> &Session {
        self.guard.as_ref().expect("guarded slot holds a session")
    }
}

impl DerefMut for SessionGuard {
    fn deref_mut(&mut self) -> &mut Session {
        self.guard.as_mut().expect("guarded slot holds a session")
    }
}

/// Path-keyed collection of sessions. Invariant: at most one live session
/// per path, no matter how creates and removes interleave.
#[derive(Default)]
pub struct SessionPool {
    slots: Mutex<HashMap<String, Slot>>,
}

impl SessionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the read session for `path`, creating it via `factory` if
    /// absent. `factory` runs outside the map lock; its errors propagate
    /// without registering anything.
    pub async fn get_or_create_read<F, Fut>(&self, path: &str, factory: F) -> FsResult<SessionGuard>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FsResult<Session>>,
    {
        self.get_or_create(path, factory).await
    }

    /// Write-session variant: a fresh session may only be opened for a
    /// write that starts at beginning-of-file. The offset check happens
    /// atomically with the absence check, so two racing first writes
    /// cannot both open a stream.
    pub async fn get_or_create_write<F, Fut>(
        &self,
        path: &str,
        offset: u64,
        factory: F,
    ) -> FsResult<SessionGuard>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FsResult<Session>>,
    {
        self.get_or_create(path, || async move {
            if offset != 0 {
                return Err(crate::error::FsError::UnsupportedWritePattern(offset));
            }
            factory().await
        })
        .await
    }

    async fn get_or_create<F, Fut>(&self, path: &str, factory: F) -> FsResult<SessionGuard>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FsResult<Session>>,
    {
        let (slot, mut guard) = self.acquire_slot(path).await;
        if guard.is_none() {
            match factory().await {
                Ok(session) => *guard = Some(session),
                Err(e) => {
                    drop(guard);
                    self.unmap_if_current(path, &slot);
                    return Err(e);
                }
            }
        }
        Ok(SessionGuard { guard })
    }

    /// Unregisters and returns the session for `path`, if any. The caller
    /// finalizes the stream outside the pool, so a slow remote close never
    /// blocks other paths.
    pub async fn remove(&self, path: &str) -> Option<Session> {
        let slot = self.slots.lock().unwrap().remove(path)?;
        let mut guard = slot.lock_owned().await;
        guard.take()
    }

    /// Whether `path` currently has a session registered (or one being
    /// created right now).
    pub fn contains(&self, path: &str) -> bool {
        let slots = self.slots.lock().unwrap();
        match slots.get(path) {
            None => false,
            Some(slot) => match slot.try_lock() {
                Ok(guard) => guard.is_some(),
                // locked: a handler is mid-create or mid-transfer
                Err(_) => true,
            },
        }
    }

    /// Number of registered paths, for trace logging only.
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().unwrap().is_empty()
    }

    /// Locks the slot currently mapped for `path`, inserting one if absent.
    /// Re-checks the mapping after the await: a concurrent `remove` may
    /// have detached the slot we queued on, in which case a stale guard
    /// could register a session invisible to the pool.
    async fn acquire_slot(&self, path: &str) -> (Slot, OwnedMutexGuard<Option<Session>>) {
        loop {
            let slot = {
                let mut slots = self.slots.lock().unwrap();
                slots
                    .entry(path.to_string())
                    .or_insert_with(Default::default)
                    .clone()
            };
            let guard = slot.clone().lock_owned().await;
            let still_mapped = {
                let slots = self.slots.lock().unwrap();
                slots.get(path).is_some_and(|s| Arc::ptr_eq(s, &slot))
            };
            if still_mapped {
                return (slot, guard);
            }
        }
    }

    /// Drops the map entry for `path` if it still points at `slot` and the
    /// slot ended up empty (factory failure cleanup).
    fn unmap_if_current(&self, path: &str, slot: &Slot) {
        let mut slots = self.slots.lock().unwrap();
        let current = slots.get(path).is_some_and(|s| Arc::ptr_eq(s, slot));
        if current {
            let empty = slot.try_lock().map(|g| g.is_none()).unwrap_or(false);
            if empty {
                slots.remove(path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FsError;
    use crate::store::mem::MemStore;
    use crate::store::{ObjectStore, Policy};
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn write_session(path: &str) -> Session {
        let store = MemStore::new();
        let stream = store
            .create_put_stream(&Policy("test".into()))
            .await
            .unwrap();
        Session {
            path: path.to_string(),
            kind: SessionKind::Write,
            declared_length: 0,
            transferred: 0,
            stream: SessionStream::Put(stream),
        }
    }

    #[tokio::test]
    async fn second_caller_sees_existing_session() {
        let pool = SessionPool::new();
        let created = AtomicUsize::new(0);

        for _ in 0..2 {
            let guard = pool
                .get_or_create_read("/a", || async {
                    created.fetch_add(1, Ordering::SeqCst);
                    Ok(write_session("/a").await)
                })
                .await
                .unwrap();
            assert_eq!(guard.kind, SessionKind::Write);
        }
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert!(pool.contains("/a"));
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn factory_error_registers_nothing() {
        let pool = SessionPool::new();
        let err = pool
            .get_or_create_read("/a", || async { Err(FsError::NoObjectYet) })
            .await;
        assert!(matches!(err, Err(FsError::NoObjectYet)));
        assert!(!pool.contains("/a"));
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn write_session_must_start_at_offset_zero() {
        let pool = SessionPool::new();
        let err = pool
            .get_or_create_write("/a", 4096, || async { Ok(write_session("/a").await) })
            .await;
        assert!(matches!(err, Err(FsError::UnsupportedWritePattern(4096))));
        assert!(!pool.contains("/a"));

        // once a session exists, later offsets reuse it untouched
        pool.get_or_create_write("/a", 0, || async { Ok(write_session("/a").await) })
            .await
            .unwrap();
        let guard = pool
            .get_or_create_write("/a", 8192, || async { Ok(write_session("/a").await) })
            .await
            .unwrap();
        assert_eq!(guard.kind, SessionKind::Write);
    }

    #[tokio::test]
    async fn remove_transfers_ownership_once() {
        let pool = SessionPool::new();
        pool.get_or_create_read("/a", || async { Ok(write_session("/a").await) })
            .await
            .unwrap();
        let taken = pool.remove("/a").await;
        assert!(taken.is_some());
        assert!(pool.remove("/a").await.is_none());
        assert!(!pool.contains("/a"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creates_yield_one_session_per_path() {
        let pool = Arc::new(SessionPool::new());
        let created = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for i in 0..64 {
            let pool = pool.clone();
            let created = created.clone();
            let path = format!("/file-{}", i % 4);
            tasks.push(tokio::spawn(async move {
                let guard = pool
                    .get_or_create_read(&path, || async {
                        created.fetch_add(1, Ordering::SeqCst);
                        // widen the race window
                        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                        Ok(write_session(&path).await)
                    })
                    .await
                    .unwrap();
                assert_eq!(guard.path, path);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(created.load(Ordering::SeqCst), 4, "one factory run per path");
        assert_eq!(pool.len(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn interleaved_create_and_remove_never_duplicates() {
        let pool = Arc::new(SessionPool::new());
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                let _ = pool
                    .get_or_create_read("/a", || async { Ok(write_session("/a").await) })
                    .await
                    .unwrap();
                pool.remove("/a").await;
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        // whatever interleaving happened, at most one session can remain
        assert!(pool.len() <= 1);
    }
}
