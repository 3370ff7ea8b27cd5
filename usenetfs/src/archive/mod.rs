//! Archive engines that expose stored (uncompressed) entries of RAR and 7z
//! volume sets as seekable extent lists.

mod cursor;
mod plain;
pub mod rar;
pub mod sevenz;
mod volume;

#[cfg(test)]
pub(crate) mod fixtures;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::fs::{Extent, ExtentReader, FileSystem};

pub use plain::PlainArchive;
pub use rar::RarArchive;
pub use sevenz::SevenZipArchive;
pub use volume::{
    archive_base_name, group_volumes, rar_volume_number, sevenz_volume_number, Volume, VolumeGroup,
};

pub const MAGIC_RAR4: &[u8] = b"Rar!\x1a\x07\x00";
pub const MAGIC_RAR5: &[u8] = b"Rar!\x1a\x07\x01\x00";
pub const MAGIC_7Z: &[u8] = b"7z\xbc\xaf\x27\x1c";

const VIDEO_EXTENSIONS: &[&str] = &[
    "mkv", "mp4", "avi", "mov", "wmv", "flv", "webm", "m4v", "mpg", "mpeg", "ts", "m2ts",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FileType {
    #[serde(rename = "plain")]
    Plain,
    #[serde(rename = "rar")]
    Rar,
    #[serde(rename = "7z")]
    SevenZip,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Plain => "plain",
            FileType::Rar => "rar",
            FileType::SevenZip => "7z",
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn extension(name: &str) -> String {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase()
}

/// Sniffs the leading bytes of a file, falling back to its name.
pub fn detect_file_type(head: &[u8], name: &str) -> FileType {
    if head.starts_with(MAGIC_RAR4) || head.starts_with(MAGIC_RAR5) {
        return FileType::Rar;
    }
    if head.starts_with(MAGIC_7Z) {
        return FileType::SevenZip;
    }
    archive_base_name(name).map_or(FileType::Plain, |(_, file_type)| file_type)
}

pub fn is_video_file(name: &str) -> bool {
    VIDEO_EXTENSIONS.contains(&extension(name).as_str())
}

pub fn is_archive_file(name: &str) -> bool {
    archive_base_name(name).is_some()
}

pub fn content_type(name: &str) -> &'static str {
    match extension(name).as_str() {
        "mkv" => "video/x-matroska",
        "mp4" => "video/mp4",
        "avi" => "video/x-msvideo",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "wmv" => "video/x-ms-wmv",
        "flv" => "video/x-flv",
        "ts" | "m2ts" => "video/mp2t",
        "mpg" | "mpeg" => "video/mpeg",
        "m4v" => "video/x-m4v",
        _ => "application/octet-stream",
    }
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("not a {0} archive")]
    BadSignature(FileType),
    #[error("malformed archive: {0}")]
    Malformed(String),
    #[error("archive headers are encrypted")]
    HeadersEncrypted,
    #[error("unsupported archive feature: {0}")]
    Unsupported(String),
    #[error("archive entry {0} is compressed or encrypted and cannot be streamed")]
    NotStreamable(String),
    #[error("archive has no volumes")]
    NoVolumes,
    #[error("archive is not open")]
    NotOpen,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ArchiveError {
    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        ArchiveError::Malformed(message.into())
    }
}

/// One entry of an opened archive.
#[derive(Clone)]
pub struct ArchiveFile {
    pub name: String,
    /// Unpacked size.
    pub size: u64,
    pub packed_size: u64,
    pub streamable: bool,
    extents: Vec<Extent>,
    fs: Arc<dyn FileSystem>,
}

impl fmt::Debug for ArchiveFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveFile")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("packed_size", &self.packed_size)
            .field("streamable", &self.streamable)
            .field("extents", &self.extents)
            .finish()
    }
}

impl ArchiveFile {
    pub(crate) fn new(
        name: String,
        size: u64,
        packed_size: u64,
        streamable: bool,
        extents: Vec<Extent>,
        fs: Arc<dyn FileSystem>,
    ) -> Self {
        Self {
            name,
            size,
            packed_size,
            streamable,
            extents,
            fs,
        }
    }

    /// Name without any directory part.
    pub fn base_name(&self) -> &str {
        self.name
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(&self.name)
    }

    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    /// Reader over the stored bytes of the entry.
    pub fn open(&self) -> Result<ExtentReader, ArchiveError> {
        if !self.streamable {
            return Err(ArchiveError::NotStreamable(self.name.clone()));
        }
        Ok(ExtentReader::new(self.fs.clone(), self.extents.clone()))
    }
}

#[async_trait]
pub trait Archive: Send + Sync {
    /// Reads the archive headers. `password` is only used to decide whether
    /// encrypted content was expected; encrypted data is never decoded.
    async fn open(&mut self, password: Option<&str>) -> anyhow::Result<()>;

    async fn close(&mut self);

    /// Entries found by [`Archive::open`].
    fn files(&self) -> &[ArchiveFile];

    /// Whether every entry can be read without decompression.
    fn is_streamable(&self) -> bool;
}

/// The archive formats the engines understand.
pub enum ArchiveHandle {
    Plain(PlainArchive),
    Rar(RarArchive),
    SevenZip(SevenZipArchive),
}

impl ArchiveHandle {
    /// Builds the engine for `file_type` over `volumes`, which must be in
    /// volume order.
    pub fn new(file_type: FileType, fs: Arc<dyn FileSystem>, volumes: Vec<String>) -> Self {
        match file_type {
            FileType::Plain => ArchiveHandle::Plain(PlainArchive::new(fs, volumes)),
            FileType::Rar => ArchiveHandle::Rar(RarArchive::new(fs, volumes)),
            FileType::SevenZip => ArchiveHandle::SevenZip(SevenZipArchive::new(fs, volumes)),
        }
    }

    pub fn for_group(fs: Arc<dyn FileSystem>, group: &VolumeGroup) -> Self {
        Self::new(group.file_type, fs, group.volume_names())
    }

    pub fn file_type(&self) -> FileType {
        match self {
            ArchiveHandle::Plain(_) => FileType::Plain,
            ArchiveHandle::Rar(_) => FileType::Rar,
            ArchiveHandle::SevenZip(_) => FileType::SevenZip,
        }
    }

    fn inner(&self) -> &dyn Archive {
        match self {
            ArchiveHandle::Plain(a) => a,
            ArchiveHandle::Rar(a) => a,
            ArchiveHandle::SevenZip(a) => a,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Archive {
        match self {
            ArchiveHandle::Plain(a) => a,
            ArchiveHandle::Rar(a) => a,
            ArchiveHandle::SevenZip(a) => a,
        }
    }
}

#[async_trait]
impl Archive for ArchiveHandle {
    async fn open(&mut self, password: Option<&str>) -> anyhow::Result<()> {
        self.inner_mut().open(password).await
    }

    async fn close(&mut self) {
        self.inner_mut().close().await
    }

    fn files(&self) -> &[ArchiveFile] {
        self.inner().files()
    }

    fn is_streamable(&self) -> bool {
        self.inner().is_streamable()
    }
}

/// Splits the logical byte run `[offset, offset + length)` of a set of
/// concatenated volumes into per-volume extents.
pub(crate) fn split_extents(volumes: &[(String, u64)], offset: u64, length: u64) -> Vec<Extent> {
    let mut extents = Vec::new();
    let mut volume_start = 0;
    let mut pos = offset;
    let end = offset + length;
    for (name, size) in volumes {
        let volume_end = volume_start + size;
        if pos < volume_end && pos < end {
            let take = volume_end.min(end) - pos;
            extents.push(Extent::new(name.clone(), pos - volume_start, take));
            pos += take;
        }
        volume_start = volume_end;
    }
    extents
}
