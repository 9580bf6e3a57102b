//! FUSE adapter.
//!
//! Bridges kernel requests onto [`FilesystemCore`]. The core is path-based
//! while the kernel speaks inodes, so this module keeps an inode table that
//! maps FUSE inode numbers onto virtual paths. Entries are allocated lazily
//! as the kernel looks names up, dropped on unlink/rmdir, and remapped on
//! rename.

pub mod mount;

use crate::store::ObjectStore;
use crate::vfs::{FileKind, FileStat, FilesystemCore};
use bytes::Bytes;
use rfuse3::Errno;
use rfuse3::Result as FuseResult;
use rfuse3::raw::Filesystem;
use rfuse3::raw::Request;
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, ReplyAttr, ReplyCreated, ReplyData, ReplyDirectory,
    ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs, ReplyWrite,
};
use rfuse3::{FileType as FuseFileType, SetAttr, Timestamp};
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use futures_util::stream::{self, Stream};

const TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = 1;

/// Inode-number to virtual-path mapping. The kernel holds inode numbers
/// across calls, so a path keeps its number for as long as it is mapped.
struct InodeTable {
    inner: Mutex<InodeTableInner>,
}

struct InodeTableInner {
    by_ino: HashMap<u64, String>,
    by_path: HashMap<String, u64>,
    next: u64,
}

impl InodeTable {
    fn new() -> Self {
        let mut by_ino = HashMap::new();
        let mut by_path = HashMap::new();
        by_ino.insert(ROOT_INO, "/".to_string());
        by_path.insert("/".to_string(), ROOT_INO);
        Self {
            inner: Mutex::new(InodeTableInner {
                by_ino,
                by_path,
                next: ROOT_INO + 1,
            }),
        }
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.inner.lock().unwrap().by_ino.get(&ino).cloned()
    }

    fn ino_of(&self, path: &str) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        if let Some(ino) = inner.by_path.get(path) {
            return *ino;
        }
        let ino = inner.next;
        inner.next += 1;
        inner.by_ino.insert(ino, path.to_string());
        inner.by_path.insert(path.to_string(), ino);
        ino
    }

    fn forget_path(&self, path: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(ino) = inner.by_path.remove(path) {
            inner.by_ino.remove(&ino);
        }
    }

    /// Remaps `old` and everything below it onto `new`, keeping inode
    /// numbers stable across the rename.
    fn rename(&self, old: &str, new: &str) {
        let mut inner = self.inner.lock().unwrap();
        let prefix = format!("{old}/");
        let moved: Vec<(String, String)> = inner
            .by_path
            .keys()
            .filter(|p| p.as_str() == old || p.starts_with(&prefix))
            .map(|p| (p.clone(), format!("{new}{}", &p[old.len()..])))
            .collect();
        for (old_path, new_path) in moved {
            let ino = inner.by_path.remove(&old_path).unwrap();
            inner.by_path.insert(new_path.clone(), ino);
            inner.by_ino.insert(ino, new_path);
        }
    }
}

/// The mounted filesystem: operation handlers plus the inode table.
pub struct StubFs<S: ObjectStore> {
    core: FilesystemCore<S>,
    inodes: InodeTable,
}

impl<S: ObjectStore> StubFs<S> {
    pub fn new(core: FilesystemCore<S>) -> Self {
        Self {
            core,
            inodes: InodeTable::new(),
        }
    }

    fn vpath(&self, ino: u64) -> FuseResult<String> {
        self.inodes.path_of(ino).ok_or_else(|| Errno::from(libc::ENOENT))
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> FuseResult<String> {
        let dir = self.vpath(parent)?;
        let name = name.to_str().ok_or_else(|| Errno::from(libc::EINVAL))?;
        if name.is_empty() || name.contains('/') {
            return Err(libc::EINVAL.into());
        }
        Ok(if dir == "/" {
            format!("/{name}")
        } else {
            format!("{dir}/{name}")
        })
    }

    /// Attributes of `vpath`, numbered by the FUSE inode table rather than
    /// the underlying filesystem.
    async fn fuse_attr(&self, vpath: &str) -> FuseResult<rfuse3::raw::reply::FileAttr> {
        let stat = self.core.getattr(vpath).await.map_err(errno)?;
        Ok(stat_to_fuse_attr(self.inodes.ino_of(vpath), &stat))
    }

    fn entry(&self, attr: rfuse3::raw::reply::FileAttr) -> ReplyEntry {
        ReplyEntry {
            ttl: TTL,
            attr,
            generation: 0,
        }
    }
}

impl<S> Filesystem for StubFs<S>
where
    S: ObjectStore + 'static,
{
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        // spans larger than this get split by the kernel
        let max_write = NonZeroU32::new(1024 * 1024).unwrap();
        Ok(ReplyInit { max_write })
    }

    async fn destroy(&self, _req: Request) {}

    async fn lookup(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        let vpath = self.child_path(parent, name)?;
        let attr = self.fuse_attr(&vpath).await?;
        Ok(self.entry(attr))
    }

    async fn getattr(
        &self,
        _req: Request,
        ino: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        let vpath = self.vpath(ino)?;
        let attr = self.fuse_attr(&vpath).await?;
        Ok(ReplyAttr { ttl: TTL, attr })
    }

    async fn setattr(
        &self,
        _req: Request,
        ino: u64,
        _fh: Option<u64>,
        set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        let vpath = self.vpath(ino)?;
        if let Some(mode) = set_attr.mode {
            self.core.chmod(&vpath, mode).await.map_err(errno)?;
        }
        if set_attr.uid.is_some() || set_attr.gid.is_some() {
            self.core
                .chown(&vpath, set_attr.uid, set_attr.gid)
                .await
                .map_err(errno)?;
        }
        if let Some(size) = set_attr.size {
            self.core.truncate(&vpath, size).await.map_err(errno)?;
        }
        if set_attr.atime.is_some() || set_attr.mtime.is_some() {
            let atime = set_attr.atime.map(|t| (t.sec, t.nsec));
            let mtime = set_attr.mtime.map(|t| (t.sec, t.nsec));
            self.core.utimens(&vpath, atime, mtime).await.map_err(errno)?;
        }
        let attr = self.fuse_attr(&vpath).await?;
        Ok(ReplyAttr { ttl: TTL, attr })
    }

    async fn mknod(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        rdev: u32,
    ) -> FuseResult<ReplyEntry> {
        let vpath = self.child_path(parent, name)?;
        self.core.mknod(&vpath, mode, rdev).await.map_err(errno)?;
        let attr = self.fuse_attr(&vpath).await?;
        Ok(self.entry(attr))
    }

    async fn create(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        flags: u32,
    ) -> FuseResult<ReplyCreated> {
        let vpath = self.child_path(parent, name)?;
        self.core
            .mknod(&vpath, libc::S_IFREG | (mode & 0o7777), 0)
            .await
            .map_err(errno)?;
        self.core.open(&vpath, flags).await.map_err(errno)?;
        let attr = self.fuse_attr(&vpath).await?;
        Ok(ReplyCreated {
            ttl: TTL,
            attr,
            generation: 0,
            fh: 0,
            flags: 0,
        })
    }

    async fn mkdir(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
    ) -> FuseResult<ReplyEntry> {
        let vpath = self.child_path(parent, name)?;
        self.core.mkdir(&vpath, mode).await.map_err(errno)?;
        let attr = self.fuse_attr(&vpath).await?;
        Ok(self.entry(attr))
    }

    async fn unlink(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let vpath = self.child_path(parent, name)?;
        self.core.unlink(&vpath).await.map_err(errno)?;
        self.inodes.forget_path(&vpath);
        Ok(())
    }

    async fn rmdir(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let vpath = self.child_path(parent, name)?;
        self.core.rmdir(&vpath).await.map_err(errno)?;
        self.inodes.forget_path(&vpath);
        Ok(())
    }

    async fn symlink(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        link: &OsStr,
    ) -> FuseResult<ReplyEntry> {
        let vpath = self.child_path(parent, name)?;
        let target = link.to_str().ok_or_else(|| Errno::from(libc::EINVAL))?;
        self.core.symlink(target, &vpath).await.map_err(errno)?;
        let attr = self.fuse_attr(&vpath).await?;
        Ok(self.entry(attr))
    }

    async fn readlink(&self, _req: Request, ino: u64) -> FuseResult<ReplyData> {
        let vpath = self.vpath(ino)?;
        let target = self.core.readlink(&vpath).await.map_err(errno)?;
        Ok(ReplyData {
            data: Bytes::from(target.into_bytes()),
        })
    }

    async fn rename(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
    ) -> FuseResult<()> {
        let from = self.child_path(parent, name)?;
        let to = self.child_path(new_parent, new_name)?;
        self.core.rename(&from, &to).await.map_err(errno)?;
        self.inodes.forget_path(&to);
        self.inodes.rename(&from, &to);
        Ok(())
    }

    async fn link(
        &self,
        _req: Request,
        ino: u64,
        new_parent: u64,
        new_name: &OsStr,
    ) -> FuseResult<ReplyEntry> {
        let from = self.vpath(ino)?;
        let to = self.child_path(new_parent, new_name)?;
        self.core.link(&from, &to).await.map_err(errno)?;
        let attr = self.fuse_attr(&to).await?;
        Ok(self.entry(attr))
    }

    async fn open(&self, _req: Request, ino: u64, flags: u32) -> FuseResult<ReplyOpen> {
        let vpath = self.vpath(ino)?;
        self.core.open(&vpath, flags).await.map_err(errno)?;
        // stateless IO: the path carries the session, not a handle
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn opendir(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        let vpath = self.vpath(ino)?;
        let stat = self.core.getattr(&vpath).await.map_err(errno)?;
        if stat.kind != FileKind::Dir {
            return Err(libc::ENOTDIR.into());
        }
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn read(
        &self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        let vpath = self.vpath(ino)?;
        let data = self
            .core
            .read(&vpath, offset, size as usize)
            .await
            .map_err(errno)?;
        Ok(ReplyData {
            data: Bytes::from(data),
        })
    }

    async fn write(
        &self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        let vpath = self.vpath(ino)?;
        let n = self.core.write(&vpath, offset, data).await.map_err(errno)?;
        Ok(ReplyWrite { written: n as u32 })
    }

    async fn release(
        &self,
        _req: Request,
        ino: u64,
        _fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        let vpath = self.vpath(ino)?;
        self.core.release(&vpath).await.map_err(errno)
    }

    async fn flush(&self, _req: Request, _ino: u64, _fh: u64, _lock_owner: u64) -> FuseResult<()> {
        Ok(())
    }

    async fn fsync(&self, _req: Request, _ino: u64, _fh: u64, _datasync: bool) -> FuseResult<()> {
        Ok(())
    }

    async fn releasedir(&self, _req: Request, _ino: u64, _fh: u64, _flags: u32) -> FuseResult<()> {
        Ok(())
    }

    async fn fsyncdir(&self, _req: Request, _ino: u64, _fh: u64, _datasync: bool) -> FuseResult<()> {
        Ok(())
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let vpath = self.vpath(ino)?;
        let entries = self.core.readdir(&vpath).await.map_err(errno)?;

        // "." and ".." first; offset is the offset of the previous entry
        let mut all: Vec<DirectoryEntry> = Vec::with_capacity(entries.len() + 2);
        all.push(DirectoryEntry {
            inode: ino,
            kind: FuseFileType::Directory,
            name: OsString::from("."),
            offset: 1,
        });
        all.push(DirectoryEntry {
            inode: parent_ino(&self.inodes, &vpath),
            kind: FuseFileType::Directory,
            name: OsString::from(".."),
            offset: 2,
        });
        for (i, e) in entries.iter().enumerate() {
            let child = join_path(&vpath, &e.name);
            all.push(DirectoryEntry {
                inode: self.inodes.ino_of(&child),
                kind: kind_to_fuse(e.kind),
                name: OsString::from(e.name.clone()),
                offset: (i as i64) + 3,
            });
        }

        let start = if offset <= 0 { 0 } else { offset as usize };
        let slice = if start >= all.len() {
            Vec::new()
        } else {
            all[start..].to_vec()
        };
        let boxed: Self::DirEntryStream<'a> = Box::pin(stream::iter(slice.into_iter().map(Ok)));
        Ok(ReplyDirectory { entries: boxed })
    }

    async fn readdirplus<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FuseResult<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        let vpath = self.vpath(ino)?;
        let entries = self.core.readdir(&vpath).await.map_err(errno)?;

        let mut all: Vec<DirectoryEntryPlus> = Vec::with_capacity(entries.len() + 2);
        let self_attr = self.fuse_attr(&vpath).await?;
        let parent = parent_path(&vpath);
        let parent_attr = match self.fuse_attr(&parent).await {
            Ok(attr) => attr,
            Err(_) => self_attr.clone(),
        };
        all.push(DirectoryEntryPlus {
            inode: ino,
            generation: 0,
            kind: FuseFileType::Directory,
            name: OsString::from("."),
            offset: 1,
            attr: self_attr,
            entry_ttl: TTL,
            attr_ttl: TTL,
        });
        all.push(DirectoryEntryPlus {
            inode: self.inodes.ino_of(&parent),
            generation: 0,
            kind: FuseFileType::Directory,
            name: OsString::from(".."),
            offset: 2,
            attr: parent_attr,
            entry_ttl: TTL,
            attr_ttl: TTL,
        });
        for (i, e) in entries.iter().enumerate() {
            let child = join_path(&vpath, &e.name);
            // a child removed mid-listing is skipped, not fatal
            let Ok(attr) = self.fuse_attr(&child).await else {
                continue;
            };
            all.push(DirectoryEntryPlus {
                inode: attr.ino,
                generation: 0,
                kind: kind_to_fuse(e.kind),
                name: OsString::from(e.name.clone()),
                offset: (i as i64) + 3,
                attr,
                entry_ttl: TTL,
                attr_ttl: TTL,
            });
        }

        let start = if offset == 0 { 0 } else { offset as usize };
        let slice = if start >= all.len() {
            Vec::new()
        } else {
            all[start..].to_vec()
        };
        let boxed: Self::DirEntryPlusStream<'a> = Box::pin(stream::iter(slice.into_iter().map(Ok)));
        Ok(ReplyDirectoryPlus { entries: boxed })
    }

    async fn statfs(&self, _req: Request, ino: u64) -> FuseResult<ReplyStatFs> {
        let vpath = self.vpath(ino)?;
        let st = self.core.statfs(&vpath).await.map_err(errno)?;
        Ok(ReplyStatFs {
            blocks: st.blocks,
            bfree: st.bfree,
            bavail: st.bavail,
            files: st.files,
            ffree: st.ffree,
            bsize: st.bsize,
            namelen: st.namelen,
            frsize: st.frsize,
        })
    }

    async fn access(&self, _req: Request, ino: u64, mask: u32) -> FuseResult<()> {
        let vpath = self.vpath(ino)?;
        self.core.access(&vpath, mask).await.map_err(errno)
    }

    async fn forget(&self, _req: Request, _ino: u64, _nlookup: u64) {}

    async fn batch_forget(&self, _req: Request, _inodes: &[(u64, u64)]) {}

    async fn interrupt(&self, _req: Request, _unique: u64) -> FuseResult<()> {
        Ok(())
    }
}

// =============== helpers ===============

fn errno(e: crate::error::FsError) -> Errno {
    Errno::from(e.errno())
}

fn kind_to_fuse(k: FileKind) -> FuseFileType {
    match k {
        FileKind::File => FuseFileType::RegularFile,
        FileKind::Dir => FuseFileType::Directory,
        FileKind::Symlink => FuseFileType::Symlink,
        FileKind::Fifo => FuseFileType::NamedPipe,
        FileKind::Socket => FuseFileType::Socket,
        FileKind::CharDevice => FuseFileType::CharDevice,
        FileKind::BlockDevice => FuseFileType::BlockDevice,
    }
}

fn stat_to_fuse_attr(ino: u64, v: &FileStat) -> rfuse3::raw::reply::FileAttr {
    rfuse3::raw::reply::FileAttr {
        ino,
        size: v.size,
        blocks: v.size.div_ceil(512),
        atime: Timestamp::new(v.atime.0, v.atime.1),
        mtime: Timestamp::new(v.mtime.0, v.mtime.1),
        ctime: Timestamp::new(v.ctime.0, v.ctime.1),
        #[cfg(target_os = "macos")]
        crtime: Timestamp::new(v.ctime.0, v.ctime.1),
        kind: kind_to_fuse(v.kind),
        perm: v.perm,
        nlink: v.nlink,
        uid: v.uid,
        gid: v.gid,
        rdev: v.rdev,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: v.blksize,
    }
}

fn join_path(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

fn parent_path(vpath: &str) -> String {
    match vpath.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(i) => vpath[..i].to_string(),
    }
}

fn parent_ino(inodes: &InodeTable, vpath: &str) -> u64 {
    inodes.ino_of(&parent_path(vpath))
}
