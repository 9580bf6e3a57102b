//! Filesystem core: path-based operation handlers.
//!
//! Regular files under the stub root hold a record history instead of
//! data; read/write/release on them are redirected to streaming sessions
//! against the object store through the session pool. Everything else —
//! directories, symlinks, permissions, timestamps — passes straight
//! through to the local filesystem.

use crate::config::Config;
use crate::error::{FsError, FsResult};
use crate::paths::PathTranslator;
use crate::session::{Session, SessionKind, SessionPool, SessionStream};
use crate::store::{ObjectStore, StoreError};
use crate::stub::{self, StubRecord};
use log::{debug, warn};
use std::ffi::CString;
use std::io::SeekFrom;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Dir,
    Symlink,
    Fifo,
    Socket,
    CharDevice,
    BlockDevice,
}

impl FileKind {
    fn from_file_type(ft: std::fs::FileType) -> Self {
        use std::os::unix::fs::FileTypeExt;
        if ft.is_dir() {
            FileKind::Dir
        } else if ft.is_symlink() {
            FileKind::Symlink
        } else if ft.is_fifo() {
            FileKind::Fifo
        } else if ft.is_socket() {
            FileKind::Socket
        } else if ft.is_char_device() {
            FileKind::CharDevice
        } else if ft.is_block_device() {
            FileKind::BlockDevice
        } else {
            FileKind::File
        }
    }
}

/// Attributes reported to the kernel. Seconds/nanoseconds pairs keep the
/// conversion to FUSE timestamps lossless.
#[derive(Debug, Clone)]
pub struct FileStat {
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub kind: FileKind,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
    pub atime: (i64, u32),
    pub mtime: (i64, u32),
    pub ctime: (i64, u32),
}

impl FileStat {
    fn from_metadata(md: &std::fs::Metadata) -> Self {
        Self {
            ino: md.ino(),
            size: md.size(),
            blocks: md.blocks(),
            kind: FileKind::from_file_type(md.file_type()),
            perm: (md.mode() & 0o7777) as u16,
            nlink: md.nlink() as u32,
            uid: md.uid(),
            gid: md.gid(),
            rdev: md.rdev() as u32,
            blksize: md.blksize() as u32,
            atime: (md.atime(), md.atime_nsec() as u32),
            mtime: (md.mtime(), md.mtime_nsec() as u32),
            ctime: (md.ctime(), md.ctime_nsec() as u32),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub ino: u64,
    pub kind: FileKind,
}

/// Filesystem statistics, passed through from the stub tree.
#[derive(Debug, Clone, Copy)]
pub struct FsStats {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub frsize: u32,
    pub namelen: u32,
}

/// Context owning the session pool, the path translator and the store
/// handle. Every operation handler borrows it; there is no ambient global
/// state.
pub struct FilesystemCore<S: ObjectStore> {
    config: Config,
    paths: PathTranslator,
    pool: SessionPool,
    store: Arc<S>,
}

impl<S: ObjectStore> FilesystemCore<S> {
    pub fn new(config: Config, store: S) -> Self {
        let paths = PathTranslator::new(&config);
        Self {
            config,
            paths,
            pool: SessionPool::new(),
            store: Arc::new(store),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ===== store-aware handlers =====

    /// Local `lstat`, with the size of regular files overridden by the
    /// declared length of their last stub record. The on-disk byte count
    /// of the stub file itself is an implementation artifact.
    pub async fn getattr(&self, vpath: &str) -> FsResult<FileStat> {
        let real = self.paths.real(vpath)?;
        let md = tokio::fs::symlink_metadata(&real).await?;
        let mut stat = FileStat::from_metadata(&md);
        if md.is_file() {
            match stub::read_last_record(&real).await {
                Ok(Some(record)) => stat.size = record.length,
                Ok(None) => {}
                Err(e) => debug!("getattr {real}: stub record unreadable: {e}"),
            }
        }
        Ok(stat)
    }

    /// Existence/permission passthrough; content access happens lazily on
    /// the first read or write. `O_TRUNC` is stripped: truncating the stub
    /// file would destroy the record history.
    pub async fn open(&self, vpath: &str, flags: u32) -> FsResult<()> {
        let real = self.paths.real(vpath)?;
        let oflag = nix::fcntl::OFlag::from_bits_truncate(flags as i32)
            & !nix::fcntl::OFlag::O_TRUNC;
        let fd = nix::fcntl::open(real.as_str(), oflag, nix::sys::stat::Mode::empty())
            .map_err(|e| FsError::Local(e.into()))?;
        let _ = nix::unistd::close(fd);
        Ok(())
    }

    /// Streams a byte range out of the object named by the stub record,
    /// creating the read session on first use.
    pub async fn read(&self, vpath: &str, offset: u64, size: usize) -> FsResult<Vec<u8>> {
        let real = self.paths.real(vpath)?;
        let md = tokio::fs::symlink_metadata(&real).await?;
        if !md.is_file() {
            return self.read_local(&real, offset, size).await;
        }

        let mut session = self
            .pool
            .get_or_create_read(&real, || {
                let real = real.clone();
                let store = self.store.clone();
                async move {
                    let record = match stub::read_last_record(&real).await {
                        Ok(Some(r)) => r,
                        // a writer may not have produced the record yet;
                        // tell the caller to retry instead of ENOENT
                        Ok(None) => return Err(FsError::NoObjectYet),
                        Err(FsError::MalformedRecord) => return Err(FsError::NoObjectYet),
                        Err(e) => return Err(e),
                    };
                    let stream = store.create_get_stream(&record.object_id).await?;
                    debug!(
                        "read {real}: opened get stream oid={} len={}",
                        record.object_id, record.length
                    );
                    Ok(Session {
                        path: real,
                        kind: SessionKind::Read,
                        declared_length: record.length,
                        transferred: 0,
                        stream: SessionStream::Get(stream),
                    })
                }
            })
            .await?;

        // clamp to [0, declared_length): standard tools probe one block
        // past EOF and must see zero bytes, not an error
        if offset >= session.declared_length {
            return Ok(Vec::new());
        }
        let size = size.min((session.declared_length - offset) as usize);

        let declared = session.declared_length;
        let stream = match &mut session.stream {
            SessionStream::Get(gs) => gs,
            SessionStream::Put(_) => {
                return Err(StoreError::Io("path has an active write session".into()).into());
            }
        };
        // on failure the session stays registered so the span can be retried
        let data = stream.get(offset, size).await?;
        session.transferred += data.len() as u64;
        debug!(
            "read {real}: offset={offset} size={size} got={} declared={declared}",
            data.len()
        );
        Ok(data)
    }

    /// Streams a span into the path's put stream, opening it on the first
    /// write. The first write must start at offset 0.
    pub async fn write(&self, vpath: &str, offset: u64, data: &[u8]) -> FsResult<usize> {
        let real = self.paths.real(vpath)?;
        let md = tokio::fs::symlink_metadata(&real).await?;
        if !md.is_file() {
            return self.write_local(&real, offset, data).await;
        }

        let mut session = self
            .pool
            .get_or_create_write(&real, offset, || {
                let real = real.clone();
                let store = self.store.clone();
                let policy_name = self.config.policy.clone();
                async move {
                    let policy = store.get_policy(&policy_name).await?;
                    let stream = store.create_put_stream(&policy).await?;
                    debug!("write {real}: opened put stream policy={policy_name}");
                    Ok(Session {
                        path: real,
                        kind: SessionKind::Write,
                        declared_length: 0,
                        transferred: 0,
                        stream: SessionStream::Put(stream),
                    })
                }
            })
            .await?;

        let stream = match &mut session.stream {
            SessionStream::Put(ps) => ps,
            SessionStream::Get(_) => {
                return Err(StoreError::Io("path has an active read session".into()).into());
            }
        };
        // failed spans keep the session registered for a retry of the span
        stream.put(offset, data).await?;
        session.transferred += data.len() as u64;
        debug!(
            "write {real}: offset={offset} size={} transferred={}",
            data.len(),
            session.transferred
        );
        Ok(data.len())
    }

    /// Finalizes the path's session, if any. Write sessions that carried
    /// bytes are closed against the store and their object id appended to
    /// the stub record history (and mirrored to the backup tree).
    pub async fn release(&self, vpath: &str) -> FsResult<()> {
        let real = self.paths.real(vpath)?;
        let Some(session) = self.pool.remove(&real).await else {
            // nothing to finalize
            return Ok(());
        };
        debug!(
            "release {real}: kind={:?} transferred={} open_sessions={}",
            session.kind,
            session.transferred,
            self.pool.len()
        );

        let stream = match (session.kind, session.stream) {
            // read sessions never touch the stub record
            (SessionKind::Read, _) => return Ok(()),
            // nothing was written; do not record an empty object
            (SessionKind::Write, _) if session.transferred == 0 => return Ok(()),
            (SessionKind::Write, SessionStream::Put(ps)) => ps,
            (SessionKind::Write, SessionStream::Get(_)) => return Ok(()),
        };

        // stream close happens after removal, outside any pool lock
        let object_id = stream.close().await?;
        let record = StubRecord {
            magic: self.config.magic.clone(),
            object_id,
            length: session.transferred,
            timestamp: unix_now(),
            store_address: self.config.store_address.clone(),
            policy: self.config.policy.clone(),
        };
        stub::append_record(&real, &record).await?;

        if let Some(bak) = self.paths.backup(vpath)? {
            // the canonical record is the primary one; the mirror is
            // best-effort
            if let Err(e) = stub::append_record(&bak, &record).await {
                warn!("release {real}: backup record {bak} failed: {e}");
            }
        }
        Ok(())
    }

    /// Removes the local stub file. When it is the last hard link to a
    /// recorded object, the remote object is deleted first; a store
    /// failure there is logged and does not block the local unlink.
    pub async fn unlink(&self, vpath: &str) -> FsResult<()> {
        let real = self.paths.real(vpath)?;
        let md = tokio::fs::symlink_metadata(&real).await?;
        if md.is_file() && md.nlink() == 1 {
            match stub::read_last_record(&real).await {
                Ok(Some(record)) => {
                    if let Err(e) = self.store.delete(&record.object_id).await {
                        warn!("unlink {real}: delete oid={} failed: {e}", record.object_id);
                    }
                }
                Ok(None) => {}
                Err(e) => debug!("unlink {real}: stub record unreadable: {e}"),
            }
        }
        tokio::fs::remove_file(&real).await?;
        Ok(())
    }

    // ===== local passthrough =====

    pub async fn readlink(&self, vpath: &str) -> FsResult<String> {
        let real = self.paths.real(vpath)?;
        let target = tokio::fs::read_link(&real).await?;
        Ok(target.to_string_lossy().into_owned())
    }

    pub async fn readdir(&self, vpath: &str) -> FsResult<Vec<DirEntry>> {
        let real = self.paths.real(vpath)?;
        let mut rd = tokio::fs::read_dir(&real).await?;
        let mut out = Vec::new();
        while let Some(entry) = rd.next_entry().await? {
            let ft = entry.file_type().await?;
            out.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                ino: entry.ino(),
                kind: FileKind::from_file_type(ft),
            });
        }
        Ok(out)
    }

    pub async fn mknod(&self, vpath: &str, mode: u32, rdev: u32) -> FsResult<()> {
        let real = self.paths.real(vpath)?;
        let fmt = mode & libc::S_IFMT;
        if fmt == libc::S_IFREG || fmt == 0 {
            // portable path for regular files, as create+close
            let file = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(mode & 0o7777)
                .open(&real)?;
            drop(file);
        } else if fmt == libc::S_IFIFO {
            nix::unistd::mkfifo(
                real.as_str(),
                nix::sys::stat::Mode::from_bits_truncate(mode & 0o7777),
            )
            .map_err(|e| FsError::Local(e.into()))?;
        } else {
            nix::sys::stat::mknod(
                real.as_str(),
                nix::sys::stat::SFlag::from_bits_truncate(fmt),
                nix::sys::stat::Mode::from_bits_truncate(mode & 0o7777),
                rdev as libc::dev_t,
            )
            .map_err(|e| FsError::Local(e.into()))?;
        }
        Ok(())
    }

    /// Creates the directory locally and mirrors it into the backup tree
    /// so mirrored records always have a parent to land in.
    pub async fn mkdir(&self, vpath: &str, mode: u32) -> FsResult<()> {
        let real = self.paths.real(vpath)?;
        let mut builder = tokio::fs::DirBuilder::new();
        builder.mode(mode);
        builder.create(&real).await?;

        if let Some(bak) = self.paths.backup(vpath)? {
            let mut builder = tokio::fs::DirBuilder::new();
            builder.mode(mode).recursive(true);
            if let Err(e) = builder.create(&bak).await {
                warn!("mkdir {real}: backup mkdir {bak} failed: {e}");
            }
        }
        Ok(())
    }

    pub async fn rmdir(&self, vpath: &str) -> FsResult<()> {
        let real = self.paths.real(vpath)?;
        tokio::fs::remove_dir(&real).await?;
        Ok(())
    }

    /// `target` is stored verbatim; only the link location is translated.
    pub async fn symlink(&self, target: &str, vpath: &str) -> FsResult<()> {
        let real = self.paths.real(vpath)?;
        tokio::fs::symlink(target, &real).await?;
        Ok(())
    }

    pub async fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        let from_real = self.paths.real(from)?;
        let to_real = self.paths.real(to)?;
        tokio::fs::rename(&from_real, &to_real).await?;
        Ok(())
    }

    pub async fn link(&self, from: &str, to: &str) -> FsResult<()> {
        let from_real = self.paths.real(from)?;
        let to_real = self.paths.real(to)?;
        tokio::fs::hard_link(&from_real, &to_real).await?;
        Ok(())
    }

    pub async fn chmod(&self, vpath: &str, mode: u32) -> FsResult<()> {
        let real = self.paths.real(vpath)?;
        tokio::fs::set_permissions(&real, std::fs::Permissions::from_mode(mode)).await?;
        Ok(())
    }

    pub async fn chown(&self, vpath: &str, uid: Option<u32>, gid: Option<u32>) -> FsResult<()> {
        let real = self.paths.real(vpath)?;
        let c_path = cstring(&real)?;
        let uid = uid.map(|u| u as libc::uid_t).unwrap_or(libc::uid_t::MAX);
        let gid = gid.map(|g| g as libc::gid_t).unwrap_or(libc::gid_t::MAX);
        // lchown so symlinks themselves are owned, not their targets
        let rc = unsafe { libc::lchown(c_path.as_ptr(), uid, gid) };
        if rc == -1 {
            return Err(FsError::Local(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Size changes on stub-backed files are accepted and ignored: the
    /// logical length is declared by the record written at release time.
    pub async fn truncate(&self, vpath: &str, size: u64) -> FsResult<()> {
        let real = self.paths.real(vpath)?;
        let md = tokio::fs::symlink_metadata(&real).await?;
        if md.is_file() {
            return Ok(());
        }
        let file = tokio::fs::OpenOptions::new().write(true).open(&real).await?;
        file.set_len(size).await?;
        Ok(())
    }

    pub async fn utimens(
        &self,
        vpath: &str,
        atime: Option<(i64, u32)>,
        mtime: Option<(i64, u32)>,
    ) -> FsResult<()> {
        let real = self.paths.real(vpath)?;
        let c_path = cstring(&real)?;
        let times = [timespec_or_omit(atime), timespec_or_omit(mtime)];
        // utimensat instead of utimes: symlinks must not be followed
        let rc = unsafe {
            libc::utimensat(
                libc::AT_FDCWD,
                c_path.as_ptr(),
                times.as_ptr(),
                libc::AT_SYMLINK_NOFOLLOW,
            )
        };
        if rc == -1 {
            return Err(FsError::Local(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    pub async fn statfs(&self, vpath: &str) -> FsResult<FsStats> {
        let real = self.paths.real(vpath)?;
        let st = nix::sys::statvfs::statvfs(real.as_str())
            .map_err(|e| FsError::Local(e.into()))?;
        Ok(FsStats {
            blocks: st.blocks(),
            bfree: st.blocks_free(),
            bavail: st.blocks_available(),
            files: st.files(),
            ffree: st.files_free(),
            bsize: st.block_size() as u32,
            frsize: st.fragment_size() as u32,
            namelen: st.name_max() as u32,
        })
    }

    pub async fn access(&self, vpath: &str, mask: u32) -> FsResult<()> {
        let real = self.paths.real(vpath)?;
        nix::unistd::access(
            real.as_str(),
            nix::unistd::AccessFlags::from_bits_truncate(mask as i32),
        )
        .map_err(|e| FsError::Local(e.into()))?;
        Ok(())
    }

    // ===== non-regular-file delegation =====

    async fn read_local(&self, real: &str, offset: u64, size: usize) -> FsResult<Vec<u8>> {
        let mut file = tokio::fs::File::open(real).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; size];
        let mut filled = 0;
        while filled < size {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    async fn write_local(&self, real: &str, offset: u64, data: &[u8]) -> FsResult<usize> {
        let mut file = tokio::fs::OpenOptions::new().write(true).open(real).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(data.len())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn cstring(path: &str) -> FsResult<CString> {
    CString::new(Path::new(path).as_os_str().as_bytes())
        .map_err(|_| FsError::InvalidPath(path.to_string()))
}

fn timespec_or_omit(t: Option<(i64, u32)>) -> libc::timespec {
    match t {
        Some((sec, nsec)) => libc::timespec {
            tv_sec: sec,
            tv_nsec: nsec as libc::c_long,
        },
        None => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_MAGIC, DEFAULT_POLICY};
    use crate::store::mem::MemStore;

    fn setup_with_backup(
        backup: bool,
    ) -> (
        tempfile::TempDir,
        Option<tempfile::TempDir>,
        FilesystemCore<MemStore>,
        MemStore,
    ) {
        let stub_dir = tempfile::tempdir().unwrap();
        let bak_dir = backup.then(|| tempfile::tempdir().unwrap());
        let config = Config::new(
            DEFAULT_MAGIC,
            stub_dir.path().to_str().unwrap(),
            bak_dir
                .as_ref()
                .map(|d| d.path().to_str().unwrap().to_string()),
            "mem://local",
            DEFAULT_POLICY,
        )
        .unwrap();
        let store = MemStore::new();
        let core = FilesystemCore::new(config, store.clone());
        (stub_dir, bak_dir, core, store)
    }

    fn setup() -> (tempfile::TempDir, FilesystemCore<MemStore>, MemStore) {
        let (dir, _, core, store) = setup_with_backup(false);
        (dir, core, store)
    }

    #[tokio::test]
    async fn write_release_read_round_trip() {
        let (_dir, core, store) = setup();
        core.mknod("/a.txt", libc::S_IFREG | 0o644, 0).await.unwrap();

        core.write("/a.txt", 0, b"0123456789").await.unwrap();
        core.write("/a.txt", 10, b"abcde").await.unwrap();
        core.release("/a.txt").await.unwrap();
        assert_eq!(store.object_count(), 1);

        let stat = core.getattr("/a.txt").await.unwrap();
        assert_eq!(stat.size, 15);

        // a read of 20 bytes at offset 0 returns exactly the 15 stored
        let data = core.read("/a.txt", 0, 20).await.unwrap();
        assert_eq!(data, b"0123456789abcde");
        let tail = core.read("/a.txt", 10, 5).await.unwrap();
        assert_eq!(tail, b"abcde");
        core.release("/a.txt").await.unwrap();
    }

    #[tokio::test]
    async fn read_past_declared_length_is_empty_success() {
        let (_dir, core, _store) = setup();
        core.mknod("/a", libc::S_IFREG | 0o644, 0).await.unwrap();
        core.write("/a", 0, b"xyz").await.unwrap();
        core.release("/a").await.unwrap();

        assert!(core.read("/a", 3, 4096).await.unwrap().is_empty());
        assert!(core.read("/a", 1000, 1).await.unwrap().is_empty());
        assert_eq!(core.read("/a", 2, 4096).await.unwrap(), b"z");
        core.release("/a").await.unwrap();
    }

    #[tokio::test]
    async fn release_without_session_is_noop() {
        let (_dir, core, _store) = setup();
        core.mknod("/a", libc::S_IFREG | 0o644, 0).await.unwrap();
        core.release("/a").await.unwrap();
    }

    #[tokio::test]
    async fn zero_transfer_write_session_leaves_no_record() {
        let (_dir, core, store) = setup();
        core.mknod("/a", libc::S_IFREG | 0o644, 0).await.unwrap();
        core.write("/a", 0, b"").await.unwrap();
        core.release("/a").await.unwrap();

        assert_eq!(store.object_count(), 0);
        let real = core.paths.real("/a").unwrap();
        assert_eq!(stub::read_last_record(&real).await.unwrap(), None);
    }

    #[tokio::test]
    async fn first_write_must_start_at_zero() {
        let (_dir, core, _store) = setup();
        core.mknod("/a", libc::S_IFREG | 0o644, 0).await.unwrap();
        let err = core.write("/a", 512, b"late").await;
        assert!(matches!(err, Err(FsError::UnsupportedWritePattern(512))));
        // the failed attempt must not have registered a session
        core.write("/a", 0, b"ok").await.unwrap();
        core.release("/a").await.unwrap();
    }

    #[tokio::test]
    async fn failed_span_keeps_session_for_retry() {
        let (_dir, core, store) = setup();
        core.mknod("/a", libc::S_IFREG | 0o644, 0).await.unwrap();
        core.write("/a", 0, b"first").await.unwrap();

        store.set_fail_puts(true);
        assert!(core.write("/a", 5, b"flaky").await.is_err());
        store.set_fail_puts(false);

        // same span retried against the same session
        core.write("/a", 5, b"flaky").await.unwrap();
        core.release("/a").await.unwrap();

        let real = core.paths.real("/a").unwrap();
        let record = stub::read_last_record(&real).await.unwrap().unwrap();
        assert_eq!(record.length, 10);
        assert_eq!(store.object(&record.object_id).unwrap(), b"firstflaky");
    }

    #[tokio::test]
    async fn getattr_reports_declared_length_not_stub_size() {
        let (_dir, core, _store) = setup();
        core.mknod("/a", libc::S_IFREG | 0o644, 0).await.unwrap();
        let real = core.paths.real("/a").unwrap();
        let record = StubRecord {
            magic: DEFAULT_MAGIC.into(),
            object_id: "oid-x".into(),
            length: 1000,
            timestamp: 1_700_000_000,
            store_address: "mem://local".into(),
            policy: DEFAULT_POLICY.into(),
        };
        stub::append_record(&real, &record).await.unwrap();

        let on_disk = tokio::fs::metadata(&real).await.unwrap().len();
        assert!(on_disk < 100);
        let stat = core.getattr("/a").await.unwrap();
        assert_eq!(stat.size, 1000);
    }

    #[tokio::test]
    async fn read_before_any_record_is_transient() {
        let (_dir, core, _store) = setup();
        core.mknod("/a", libc::S_IFREG | 0o644, 0).await.unwrap();
        assert!(matches!(
            core.read("/a", 0, 16).await,
            Err(FsError::NoObjectYet)
        ));

        // a half-written record degrades the same way
        let real = core.paths.real("/a").unwrap();
        tokio::fs::write(&real, "DDNWOS oid-1 12").await.unwrap();
        assert!(matches!(
            core.read("/a", 0, 16).await,
            Err(FsError::NoObjectYet)
        ));
    }

    #[tokio::test]
    async fn unlink_deletes_last_linked_object() {
        let (_dir, core, store) = setup();
        core.mknod("/a", libc::S_IFREG | 0o644, 0).await.unwrap();
        core.write("/a", 0, b"payload").await.unwrap();
        core.release("/a").await.unwrap();
        assert_eq!(store.object_count(), 1);

        core.unlink("/a").await.unwrap();
        assert_eq!(store.object_count(), 0);
        assert!(core.getattr("/a").await.is_err());
    }

    #[tokio::test]
    async fn unlink_keeps_object_while_hard_links_remain() {
        let (_dir, core, store) = setup();
        core.mknod("/a", libc::S_IFREG | 0o644, 0).await.unwrap();
        core.write("/a", 0, b"payload").await.unwrap();
        core.release("/a").await.unwrap();

        core.link("/a", "/b").await.unwrap();
        core.unlink("/a").await.unwrap();
        assert_eq!(store.object_count(), 1, "nlink was 2 at unlink time");
        core.unlink("/b").await.unwrap();
        assert_eq!(store.object_count(), 0);
    }

    #[tokio::test]
    async fn backup_root_mirrors_dirs_and_records() {
        let (_dir, bak_dir, core, _store) = setup_with_backup(true);
        let bak = bak_dir.unwrap();

        core.mkdir("/sub", 0o755).await.unwrap();
        assert!(bak.path().join("sub").is_dir());

        core.mknod("/sub/a", libc::S_IFREG | 0o644, 0).await.unwrap();
        core.write("/sub/a", 0, b"mirrored").await.unwrap();
        core.release("/sub/a").await.unwrap();

        let primary = core.paths.real("/sub/a").unwrap();
        let mirror = bak.path().join("sub/a");
        let a = stub::read_last_record(&primary).await.unwrap().unwrap();
        let b = stub::read_last_record(&mirror).await.unwrap().unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn rewrite_appends_new_version() {
        let (_dir, core, _store) = setup();
        core.mknod("/a", libc::S_IFREG | 0o644, 0).await.unwrap();
        core.write("/a", 0, b"version-one").await.unwrap();
        core.release("/a").await.unwrap();
        core.write("/a", 0, b"two").await.unwrap();
        core.release("/a").await.unwrap();

        let real = core.paths.real("/a").unwrap();
        let text = tokio::fs::read_to_string(&real).await.unwrap();
        assert_eq!(text.lines().count(), 2, "history is append-only");
        assert_eq!(core.getattr("/a").await.unwrap().size, 3);
        assert_eq!(core.read("/a", 0, 64).await.unwrap(), b"two");
        core.release("/a").await.unwrap();
    }

    #[tokio::test]
    async fn passthrough_dir_and_symlink_ops() {
        let (_dir, core, _store) = setup();
        core.mkdir("/d", 0o755).await.unwrap();
        assert_eq!(core.getattr("/d").await.unwrap().kind, FileKind::Dir);

        core.symlink("/d", "/lnk").await.unwrap();
        assert_eq!(core.readlink("/lnk").await.unwrap(), "/d");
        assert_eq!(core.getattr("/lnk").await.unwrap().kind, FileKind::Symlink);

        core.mknod("/d/f", libc::S_IFREG | 0o600, 0).await.unwrap();
        let names: Vec<String> = core
            .readdir("/d")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["f".to_string()]);

        core.rename("/d/f", "/d/g").await.unwrap();
        core.unlink("/d/g").await.unwrap();
        core.unlink("/lnk").await.unwrap();
        core.rmdir("/d").await.unwrap();
        assert!(core.getattr("/d").await.is_err());
    }

    #[tokio::test]
    async fn truncate_on_stub_file_is_accepted_and_ignored() {
        let (_dir, core, _store) = setup();
        core.mknod("/a", libc::S_IFREG | 0o644, 0).await.unwrap();
        core.write("/a", 0, b"keep me").await.unwrap();
        core.release("/a").await.unwrap();

        core.truncate("/a", 0).await.unwrap();
        assert_eq!(core.getattr("/a").await.unwrap().size, 7);
        assert_eq!(core.read("/a", 0, 64).await.unwrap(), b"keep me");
        core.release("/a").await.unwrap();
    }
}
