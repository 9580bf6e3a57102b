//! Stub record codec.
//!
//! A stub file is the only thing stored locally for a regular file: an
//! append-only text history of object versions, one record per line. The
//! last line is authoritative; older lines are kept for audit. The codec
//! never truncates or reorders existing lines.

use crate::error::{FsError, FsResult};
use std::path::Path;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

/// One line of a stub file:
/// `magic object_id length timestamp store_address policy`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubRecord {
    pub magic: String,
    pub object_id: String,
    /// Declared byte length of the referenced object.
    pub length: u64,
    /// Write completion time, seconds since the epoch.
    pub timestamp: u64,
    pub store_address: String,
    pub policy: String,
}

impl StubRecord {
    const FIELDS: usize = 6;

    fn to_line(&self) -> String {
        format!(
            "{} {} {} {} {} {}\n",
            self.magic, self.object_id, self.length, self.timestamp, self.store_address, self.policy
        )
    }

    fn parse(line: &str) -> FsResult<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != Self::FIELDS {
            return Err(FsError::MalformedRecord);
        }
        let length = fields[2].parse().map_err(|_| FsError::MalformedRecord)?;
        let timestamp = fields[3].parse().map_err(|_| FsError::MalformedRecord)?;
        Ok(Self {
            magic: fields[0].to_string(),
            object_id: fields[1].to_string(),
            length,
            timestamp,
            store_address: fields[4].to_string(),
            policy: fields[5].to_string(),
        })
    }
}

/// Reads the last record of the stub file at `path`.
///
/// A stub file with no lines has no valid object and yields `None`. An
/// unparseable last line fails with `MalformedRecord`; data-path callers
/// treat that the same as `None` to tolerate a record cut short by a crash.
pub async fn read_last_record(path: impl AsRef<Path>) -> FsResult<Option<StubRecord>> {
    let raw = tokio::fs::read(path).await?;
    let text = String::from_utf8_lossy(&raw);
    let last = text.lines().rev().find(|l| !l.trim().is_empty());
    match last {
        None => Ok(None),
        Some(line) => StubRecord::parse(line).map(Some),
    }
}

/// Appends one record to the stub file at `path`, creating it if needed.
pub async fn append_record(path: impl AsRef<Path>, record: &StubRecord) -> FsResult<()> {
    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .await?;
    file.write_all(record.to_line().as_bytes()).await?;
    file.flush().await?;
    Ok(())
}
