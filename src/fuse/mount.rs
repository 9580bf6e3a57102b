//! Mount helpers for starting/stopping FUSE.
//!
//! Notes:
//! - Only supported on Unix-like systems. On Linux we support unprivileged
//!   mount via fusermount3.
//! - These helpers are thin wrappers over rfuse3 raw Session APIs.

use std::path::Path;

use rfuse3::MountOptions;

use crate::fuse::StubFs;
use crate::store::ObjectStore;

fn default_mount_options() -> MountOptions {
    let mut mo = MountOptions::default();
    mo.fs_name("stubfs");
    // Keep defaults conservative: no allow_other, require empty mountpoint.
    mo
}

/// Mount a [`StubFs`] instance at the given empty directory using
/// unprivileged mode (requires fusermount3 in PATH).
#[cfg(target_os = "linux")]
pub async fn mount_stubfs_unprivileged<S>(
    fs: StubFs<S>,
    mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle>
where
    S: ObjectStore + 'static,
{
    let opts = default_mount_options();
    let session = rfuse3::raw::Session::new(opts);
    session.mount_with_unprivileged(fs, mount_point).await
}

/// Privileged mount, for hosts where the process owns CAP_SYS_ADMIN.
#[cfg(target_os = "linux")]
pub async fn mount_stubfs<S>(
    fs: StubFs<S>,
    mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle>
where
    S: ObjectStore + 'static,
{
    let opts = default_mount_options();
    let session = rfuse3::raw::Session::new(opts);
    session.mount(fs, mount_point).await
}

/// Fallback stub for non-Linux targets.
#[cfg(not(target_os = "linux"))]
pub async fn mount_stubfs_unprivileged<S>(
    _fs: StubFs<S>,
    _mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle>
where
    S: ObjectStore + 'static,
{
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "FUSE mount is only supported on Linux in this build",
    ))
}

#[cfg(not(target_os = "linux"))]
pub async fn mount_stubfs<S>(
    fs: StubFs<S>,
    mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle>
where
    S: ObjectStore + 'static,
{
    mount_stubfs_unprivileged(fs, mount_point).await
}
