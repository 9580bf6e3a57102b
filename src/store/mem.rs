//! In-memory object store for local development and tests.

use super::{GetStream, ObjectId, ObjectStore, Policy, PutStream, StoreError, StoreResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Shared {
    objects: Mutex<HashMap<ObjectId, Vec<u8>>>,
    next_id: AtomicU64,
    // test hook: force the next span writes to fail
    fail_puts: AtomicBool,
}

/// Object store backed by a process-local map. Cloning shares the objects.
#[derive(Clone, Default)]
pub struct MemStore {
    shared: Arc<Shared>,
    policies: Option<Arc<Vec<String>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts `get_policy` to the given names; the default accepts any.
    pub fn with_policies<I, S>(policies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            shared: Arc::default(),
            policies: Some(Arc::new(policies.into_iter().map(Into::into).collect())),
        }
    }

    /// Makes every subsequent `put` span fail until reset. Test hook.
    pub fn set_fail_puts(&self, fail: bool) {
        self.shared.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Bytes currently stored under `oid`, if any.
    pub fn object(&self, oid: &str) -> Option<Vec<u8>> {
        self.shared.objects.lock().unwrap().get(oid).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.shared.objects.lock().unwrap().len()
    }
}

#[async_trait]
impl ObjectStore for MemStore {
    async fn get_policy(&self, name: &str) -> StoreResult<Policy> {
        match &self.policies {
            Some(allowed) if !allowed.iter().any(|p| p == name) => {
                Err(StoreError::UnknownPolicy(name.to_string()))
            }
            _ => Ok(Policy(name.to_string())),
        }
    }

    async fn create_put_stream(&self, _policy: &Policy) -> StoreResult<Box<dyn PutStream>> {
        Ok(Box::new(MemPutStream {
            shared: self.shared.clone(),
            buf: Vec::new(),
        }))
    }

    async fn create_get_stream(&self, oid: &ObjectId) -> StoreResult<Box<dyn GetStream>> {
        let data = self
            .shared
            .objects
            .lock()
            .unwrap()
            .get(oid)
            .cloned()
            .ok_or_else(|| StoreError::ObjectNotFound(oid.clone()))?;
        Ok(Box::new(MemGetStream { data }))
    }

    async fn delete(&self, oid: &ObjectId) -> StoreResult<()> {
        self.shared
            .objects
            .lock()
            .unwrap()
            .remove(oid)
            .map(|_| ())
            .ok_or_else(|| StoreError::ObjectNotFound(oid.clone()))
    }
}

struct MemPutStream {
    shared: Arc<Shared>,
    buf: Vec<u8>,
}

#[async_trait]
impl PutStream for MemPutStream {
    async fn put(&mut self, offset: u64, data: &[u8]) -> StoreResult<()> {
        if self.shared.fail_puts.load(Ordering::SeqCst) {
            return Err(StoreError::Io("injected put failure".into()));
        }
        let offset = offset as usize;
        let end = offset + data.len();
        if self.buf.len() < end {
            self.buf.resize(end, 0);
        }
        self.buf[offset..end].copy_from_slice(data);
        Ok(())
    }

    async fn close(self: Box<Self>) -> StoreResult<ObjectId> {
        let n = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let oid = format!("mem-{n:016x}");
        self.shared.objects.lock().unwrap().insert(oid.clone(), self.buf);
        Ok(oid)
    }
}

struct MemGetStream {
    data: Vec<u8>,
}

#[async_trait]
impl GetStream for MemGetStream {
    async fn get(&mut self, offset: u64, len: usize) -> StoreResult<Vec<u8>> {
        let offset = offset as usize;
        if offset >= self.data.len() {
            return Ok(Vec::new());
        }
        let end = (offset + len).min(self.data.len());
        Ok(self.data[offset..end].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_close_get_round_trip() {
        let store = MemStore::new();
        let policy = store.get_policy("test").await.unwrap();
        let mut ps = store.create_put_stream(&policy).await.unwrap();
        ps.put(0, b"hello ").await.unwrap();
        ps.put(6, b"world").await.unwrap();
        let oid = ps.close().await.unwrap();

        let mut gs = store.create_get_stream(&oid).await.unwrap();
        assert_eq!(gs.get(0, 11).await.unwrap(), b"hello world");
        assert_eq!(gs.get(6, 100).await.unwrap(), b"world");
        assert!(gs.get(11, 4).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_policy_and_missing_object() {
        let store = MemStore::with_policies(["gold"]);
        assert!(matches!(
            store.get_policy("silver").await,
            Err(StoreError::UnknownPolicy(_))
        ));
        assert!(store.get_policy("gold").await.is_ok());
        assert!(matches!(
            store.create_get_stream(&"nope".to_string()).await,
            Err(StoreError::ObjectNotFound(_))
        ));
        assert!(matches!(
            store.delete(&"nope".to_string()).await,
            Err(StoreError::ObjectNotFound(_))
        ));
    }
}
