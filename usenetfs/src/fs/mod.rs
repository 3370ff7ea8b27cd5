//! Read-only virtual filesystems over remote and archived content.
//!
//! Both the NZB-backed [`UsenetFs`] and the archive-entry-backed
//! [`ArchiveFs`] hand out seekable readers through the same
//! [`FileSystem`] trait, which is what lets the archive engines run one
//! level deep inside another archive.

mod archive;
mod extent;
mod usenet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncSeek};

pub use archive::ArchiveFs;
pub use extent::{Extent, ExtentReader};
pub use usenet::{stream_segments, UsenetFile, UsenetFs};

/// Readers handed out by a [`FileSystem`].
pub trait SeekableFile: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Unpin> SeekableFile for T {}

#[derive(Debug, Error)]
pub enum FsError {
    #[error("{op} {path}: file does not exist")]
    NotExist { op: &'static str, path: String },
}

impl FsError {
    pub(crate) fn not_exist(op: &'static str, path: impl Into<String>) -> Self {
        FsError::NotExist {
            op,
            path: path.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub name: String,
    pub size: u64,
    pub mode: u32,
    pub modified: Option<DateTime<Utc>>,
}

impl Metadata {
    pub(crate) fn file(name: impl Into<String>, size: u64, modified: Option<DateTime<Utc>>) -> Self {
        Self {
            name: name.into(),
            size,
            mode: 0o644,
            modified,
        }
    }
}

#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn open(&self, path: &str) -> anyhow::Result<Box<dyn SeekableFile>>;

    async fn stat(&self, path: &str) -> anyhow::Result<Metadata>;
}

/// Lexically resolves `.` and `..` and drops empty components. Returns "."
/// when nothing is left.
pub fn clean_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            part => parts.push(part),
        }
    }
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path(""), ".");
        assert_eq!(clean_path("."), ".");
        assert_eq!(clean_path("./file.txt"), "file.txt");
        assert_eq!(clean_path("dir/../file.txt"), "file.txt");
        assert_eq!(clean_path("./dir/../file.txt"), "file.txt");
        assert_eq!(clean_path("/a//b/./c"), "a/b/c");
        assert_eq!(clean_path("../../x"), "x");
    }

    #[test]
    fn test_not_exist_message() {
        let err = FsError::not_exist("open", "missing.bin");
        assert_eq!(err.to_string(), "open missing.bin: file does not exist");
    }
}
