//! Local-directory object store: each object is one file under a root
//! directory, named by a generated id. Lets the filesystem run end to end
//! without a remote cluster.

use super::{GetStream, ObjectId, ObjectStore, Policy, PutStream, StoreError, StoreResult};
use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use uuid::Uuid;

pub struct LocalDirStore {
    root: PathBuf,
}

impl LocalDirStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, oid: &str) -> PathBuf {
        self.root.join(oid)
    }
}

#[async_trait]
impl ObjectStore for LocalDirStore {
    async fn get_policy(&self, name: &str) -> StoreResult<Policy> {
        if name.is_empty() {
            return Err(StoreError::UnknownPolicy(name.to_string()));
        }
        Ok(Policy(name.to_string()))
    }

    async fn create_put_stream(&self, _policy: &Policy) -> StoreResult<Box<dyn PutStream>> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(Box::new(LocalPutStream {
            root: self.root.clone(),
            buf: Vec::new(),
        }))
    }

    async fn create_get_stream(&self, oid: &ObjectId) -> StoreResult<Box<dyn GetStream>> {
        let file = match fs::File::open(self.path_for(oid)).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::ObjectNotFound(oid.clone()));
            }
            Err(e) => return Err(StoreError::Io(e.to_string())),
        };
        Ok(Box::new(LocalGetStream { file }))
    }

    async fn delete(&self, oid: &ObjectId) -> StoreResult<()> {
        match fs::remove_file(self.path_for(oid)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::ObjectNotFound(oid.clone()))
            }
            Err(e) => Err(StoreError::Io(e.to_string())),
        }
    }
}

/// Buffers spans in memory and writes the object file once on close, so a
/// crashed upload never leaves a half-object addressable by id.
struct LocalPutStream {
    root: PathBuf,
    buf: Vec<u8>,
}

#[async_trait]
impl PutStream for LocalPutStream {
    async fn put(&mut self, offset: u64, data: &[u8]) -> StoreResult<()> {
        let offset = offset as usize;
        let end = offset + data.len();
        if self.buf.len() < end {
            self.buf.resize(end, 0);
        }
        self.buf[offset..end].copy_from_slice(data);
        Ok(())
    }

    async fn close(self: Box<Self>) -> StoreResult<ObjectId> {
        let oid = Uuid::new_v4().simple().to_string();
        let path = self.root.join(&oid);
        let mut file = fs::File::create(&path)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        file.write_all(&self.buf)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(oid)
    }
}

struct LocalGetStream {
    file: fs::File,
}

#[async_trait]
impl GetStream for LocalGetStream {
    async fn get(&mut self, offset: u64, len: usize) -> StoreResult<Vec<u8>> {
        self.file
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        let mut out = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = self
                .file
                .read(&mut out[filled..])
                .await
                .map_err(|e| StoreError::Io(e.to_string()))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        out.truncate(filled);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn object_lifecycle_on_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalDirStore::new(tmp.path());
        let policy = store.get_policy("test").await.unwrap();

        let mut ps = store.create_put_stream(&policy).await.unwrap();
        ps.put(0, b"0123456789").await.unwrap();
        ps.put(10, b"abcde").await.unwrap();
        let oid = ps.close().await.unwrap();

        let mut gs = store.create_get_stream(&oid).await.unwrap();
        assert_eq!(gs.get(0, 15).await.unwrap(), b"0123456789abcde");
        assert_eq!(gs.get(10, 100).await.unwrap(), b"abcde");

        store.delete(&oid).await.unwrap();
        assert!(matches!(
            store.create_get_stream(&oid).await,
            Err(StoreError::ObjectNotFound(_))
        ));
    }

    #[tokio::test]
    async fn empty_policy_name_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalDirStore::new(tmp.path());
        assert!(matches!(
            store.get_policy("").await,
            Err(StoreError::UnknownPolicy(_))
        ));
    }
}
