//! Static configuration read once at startup.

use crate::error::{FsError, FsResult};

pub const STUBFS_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Fixed tag that marks a local file as a stub record history.
pub const DEFAULT_MAGIC: &str = "DDNWOS";
/// Storage policy handed to the store when a put stream is opened.
pub const DEFAULT_POLICY: &str = "test";

/// Configuration for one mounted tree.
#[derive(Debug, Clone)]
pub struct Config {
    /// Magic tag written as the first field of every stub record.
    pub magic: String,
    /// Local directory holding the stub files (the real backing tree).
    pub stub_root: String,
    /// Optional mirror tree that receives a copy of every record and
    /// directory; failures there are logged, never fatal.
    pub backup_root: Option<String>,
    /// Store address recorded in stub records for audit/repair.
    pub store_address: String,
    /// Named policy used for all new objects.
    pub policy: String,
}

impl Config {
    pub fn new(
        magic: impl Into<String>,
        stub_root: impl Into<String>,
        backup_root: Option<String>,
        store_address: impl Into<String>,
        policy: impl Into<String>,
    ) -> FsResult<Self> {
        let stub_root = stub_root.into();
        if !stub_root.starts_with('/') {
            return Err(FsError::InvalidPath(stub_root));
        }
        if let Some(bak) = &backup_root {
            if !bak.starts_with('/') {
                return Err(FsError::InvalidPath(bak.clone()));
            }
        }
        Ok(Self {
            magic: magic.into(),
            stub_root,
            backup_root,
            store_address: store_address.into(),
            policy: policy.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_relative_roots() {
        assert!(Config::new(DEFAULT_MAGIC, "relative/root", None, "addr", DEFAULT_POLICY).is_err());
        assert!(
            Config::new(
                DEFAULT_MAGIC,
                "/stub",
                Some("also-relative".into()),
                "addr",
                DEFAULT_POLICY
            )
            .is_err()
        );
        assert!(Config::new(DEFAULT_MAGIC, "/stub", None, "addr", DEFAULT_POLICY).is_ok());
    }
}
