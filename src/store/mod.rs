//! Streaming store client interface.
//!
//! The remote object store is consumed through this seam only: named
//! policies, streaming put/get sessions, and delete. Objects are immutable
//! and append-once; a put stream yields the final object id on close.
//!
//! Backends:
//! - `mem`: in-memory map, used by tests and the session-pool properties.
//! - `localdir`: objects as files under a local directory, enough to run
//!   the filesystem without a remote cluster.

pub mod localdir;
pub mod mem;

use async_trait::async_trait;
use thiserror::Error;

/// Opaque identifier assigned by the store when a put stream closes.
pub type ObjectId = String;

/// Named storage-class/durability directive, resolved by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy(pub String);

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    ObjectNotFound(ObjectId),
    #[error("unknown policy: {0}")]
    UnknownPolicy(String),
    #[error("store i/o: {0}")]
    Io(String),
}

/// One in-progress streaming upload. Spans are written in file order
/// starting at offset 0; `close` seals the object and returns its id.
#[async_trait]
pub trait PutStream: Send {
    async fn put(&mut self, offset: u64, data: &[u8]) -> StoreResult<()>;
    async fn close(self: Box<Self>) -> StoreResult<ObjectId>;
}

/// One in-progress streaming download of an immutable object.
#[async_trait]
pub trait GetStream: Send {
    async fn get(&mut self, offset: u64, len: usize) -> StoreResult<Vec<u8>>;
}

/// Client handle to the object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_policy(&self, name: &str) -> StoreResult<Policy>;
    async fn create_put_stream(&self, policy: &Policy) -> StoreResult<Box<dyn PutStream>>;
    async fn create_get_stream(&self, oid: &ObjectId) -> StoreResult<Box<dyn GetStream>>;
    async fn delete(&self, oid: &ObjectId) -> StoreResult<()>;
}
