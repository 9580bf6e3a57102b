//! Virtual-path to stub-path translation. Pure, no I/O.

use crate::config::Config;
use crate::error::{FsError, FsResult};

/// Maps the virtual paths seen by filesystem callers onto the real stub
/// tree, and optionally onto a mirrored backup tree.
#[derive(Debug, Clone)]
pub struct PathTranslator {
    stub_root: String,
    backup_root: Option<String>,
}

impl PathTranslator {
    pub fn new(config: &Config) -> Self {
        Self {
            stub_root: trim_root(&config.stub_root),
            backup_root: config.backup_root.as_deref().map(trim_root),
        }
    }

    /// Real on-disk path of the stub file backing `vpath`.
    pub fn real(&self, vpath: &str) -> FsResult<String> {
        if !vpath.starts_with('/') {
            return Err(FsError::InvalidPath(vpath.to_string()));
        }
        let mut out = String::with_capacity(self.stub_root.len() + vpath.len());
        out.push_str(&self.stub_root);
        out.push_str(vpath);
        Ok(out)
    }

    /// Mirrored backup path of `vpath`, when a backup root is configured.
    /// The stub-root prefix is what gets swapped; the virtual remainder is
    /// carried over unchanged.
    pub fn backup(&self, vpath: &str) -> FsResult<Option<String>> {
        if !vpath.starts_with('/') {
            return Err(FsError::InvalidPath(vpath.to_string()));
        }
        Ok(self.backup_root.as_ref().map(|root| {
            let mut out = String::with_capacity(root.len() + vpath.len());
            out.push_str(root);
            out.push_str(vpath);
            out
        }))
    }
}

fn trim_root(root: &str) -> String {
    let trimmed = root.trim_end_matches('/');
    if trimmed.is_empty() {
        // mounting the stub tree at filesystem root
        String::new()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_MAGIC, DEFAULT_POLICY};

    fn translator(backup: Option<&str>) -> PathTranslator {
        let config = Config::new(
            DEFAULT_MAGIC,
            "/srv/stubs/",
            backup.map(String::from),
            "10.0.0.1",
            DEFAULT_POLICY,
        )
        .unwrap();
        PathTranslator::new(&config)
    }

    #[test]
    fn maps_virtual_to_stub_root() {
        let t = translator(None);
        assert_eq!(t.real("/a/b.txt").unwrap(), "/srv/stubs/a/b.txt");
        assert_eq!(t.real("/").unwrap(), "/srv/stubs/");
        assert!(t.backup("/a/b.txt").unwrap().is_none());
    }

    #[test]
    fn rejects_relative_paths() {
        let t = translator(None);
        assert!(matches!(t.real("a/b.txt"), Err(FsError::InvalidPath(_))));
        assert!(matches!(t.backup(""), Err(FsError::InvalidPath(_))));
    }

    #[test]
    fn mirrors_into_backup_root() {
        let t = translator(Some("/mnt/bak"));
        assert_eq!(
            t.backup("/a/b.txt").unwrap().unwrap(),
            "/mnt/bak/a/b.txt"
        );
    }
}
