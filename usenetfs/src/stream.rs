//! Picks the playable file of an NZB and opens it as one seekable stream.

use std::fmt;
use std::io::{self, SeekFrom};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::Context as _;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncSeek, ReadBuf};
use tracing::{debug, trace, warn};

use crate::archive::{
    archive_base_name, content_type, detect_file_type, group_volumes, is_video_file, Archive,
    ArchiveFile, ArchiveHandle, FileType, Volume, VolumeGroup,
};
use crate::fs::{stream_segments, ArchiveFs, FileSystem, SeekableFile, UsenetFs};
use crate::manager::SegmentFetcher;
use crate::nzb::Nzb;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("no playable content found")]
    NoPlayableContent,
    #[error("file index {index} out of range [0, {count})")]
    FileIndexOutOfRange { index: usize, count: usize },
    #[error("file has no segments")]
    NoSegments,
    #[error("NZB has no files")]
    NoFiles,
    #[error("no file matching '{0}' found")]
    FileNotFound(String),
    #[error("non-streamable {0}")]
    NonStreamable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// Archive password. Encrypted content is reported, never decoded.
    pub password: Option<String>,
    pub segment_buffer_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            password: None,
            segment_buffer_size: 5,
        }
    }
}

impl StreamConfig {
    fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }
}

/// A seekable reader over one playable file.
pub struct Stream {
    reader: Box<dyn SeekableFile>,
    pub name: String,
    pub size: u64,
    pub content_type: &'static str,
}

impl Stream {
    fn new(reader: Box<dyn SeekableFile>, name: impl Into<String>, size: u64) -> Self {
        let name = name.into();
        Self {
            content_type: content_type(&name),
            reader,
            name,
            size,
        }
    }

    pub fn into_reader(self) -> Box<dyn SeekableFile> {
        self.reader
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl AsyncSeek for Stream {
    fn start_seek(mut self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        Pin::new(&mut self.reader).start_seek(position)
    }

    fn poll_complete(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Pin::new(&mut self.reader).poll_complete(cx)
    }
}

/// Streams the file at `idx`, looking inside it when it is an archive.
pub async fn stream_file(
    nzb: &Nzb,
    fetcher: Arc<dyn SegmentFetcher>,
    idx: usize,
    config: &StreamConfig,
) -> anyhow::Result<Stream> {
    let count = nzb.file_count();
    let file = nzb
        .files
        .get(idx)
        .ok_or(StreamError::FileIndexOutOfRange { index: idx, count })?;
    let first = file.segments.first().ok_or(StreamError::NoSegments)?;
    trace!(idx, name = file.name(), segments = file.segment_count(), "found file");

    let head = fetcher
        .fetch_segment(&first.message_id, &file.groups)
        .await
        .context("failed to fetch file header")?;
    let file_type = detect_file_type(&head.body, file.name());
    trace!(name = file.name(), %file_type, "file type detected");

    match file_type {
        FileType::Plain => {
            let (reader, size) = stream_segments(
                fetcher,
                file.segments.clone(),
                file.groups.clone(),
                config.segment_buffer_size,
            )
            .await?;
            debug!(name = file.name(), size, "streaming plain file");
            Ok(Stream::new(Box::new(reader), file.name(), size))
        }
        archive_type => {
            let group = volume_group_of(nzb, idx, archive_type);
            let fs: Arc<dyn FileSystem> =
                Arc::new(UsenetFs::new(nzb, fetcher, config.segment_buffer_size));
            let mut archive = ArchiveHandle::for_group(fs, &group);
            archive.open(config.password()).await?;
            let stream = stream_archive_file(&archive, archive_type, config.password()).await;
            archive.close().await;
            stream
        }
    }
}

/// Streams the file with the largest declared size.
pub async fn stream_largest_file(
    nzb: &Nzb,
    fetcher: Arc<dyn SegmentFetcher>,
    config: &StreamConfig,
) -> anyhow::Result<Stream> {
    let idx = nzb.largest_file_idx().ok_or(StreamError::NoFiles)?;
    trace!(idx, "found largest file");
    stream_file(nzb, fetcher, idx, config).await
}

/// Streams the file whose name matches `name`, ignoring case.
pub async fn stream_file_by_name(
    nzb: &Nzb,
    fetcher: Arc<dyn SegmentFetcher>,
    name: &str,
    config: &StreamConfig,
) -> anyhow::Result<Stream> {
    let wanted = name.to_lowercase();
    let idx = nzb
        .files
        .iter()
        .position(|f| f.name().to_lowercase() == wanted)
        .ok_or_else(|| StreamError::FileNotFound(name.to_string()))?;
    stream_file(nzb, fetcher, idx, config).await
}

/// Tries every video and archive set of the NZB, largest first, and
/// returns the first one that streams.
pub async fn select_stream(
    nzb: &Nzb,
    fetcher: Arc<dyn SegmentFetcher>,
    config: &StreamConfig,
) -> anyhow::Result<Stream> {
    if nzb.files.is_empty() {
        return Err(StreamError::NoFiles.into());
    }

    let mut candidates: Vec<(usize, u64)> = nzb
        .files
        .iter()
        .enumerate()
        .filter(|(_, f)| is_video_file(f.name()))
        .map(|(idx, f)| (idx, f.total_size()))
        .collect();
    let groups = group_volumes(nzb.files.iter().map(|f| (f.name(), f.total_size())));
    for group in &groups {
        let first = group
            .first_volume()
            .and_then(|name| nzb.files.iter().position(|f| f.name() == name));
        if let Some(idx) = first {
            candidates.push((idx, group.total_size));
        }
    }
    candidates.sort_by(|a, b| b.1.cmp(&a.1));
    if candidates.is_empty() {
        candidates.extend(nzb.largest_file_idx().map(|idx| (idx, 0)));
    }

    for (idx, _) in candidates {
        match stream_file(nzb, fetcher.clone(), idx, config).await {
            Ok(stream) => return Ok(stream),
            Err(err) => warn!(idx, name = nzb.files[idx].name(), error = %err, "candidate is not playable"),
        }
    }
    Err(StreamError::NoPlayableContent.into())
}

/// The volume set `idx` belongs to, or a one-volume set for files whose
/// name does not follow a volume pattern.
fn volume_group_of(nzb: &Nzb, idx: usize, file_type: FileType) -> VolumeGroup {
    let file = &nzb.files[idx];
    let name = file.name();
    if archive_base_name(name).is_some() {
        let groups = group_volumes(nzb.files.iter().map(|f| (f.name(), f.total_size())));
        if let Some(group) = groups
            .into_iter()
            .find(|g| g.volumes.iter().any(|v| v.name == name))
        {
            return group;
        }
    }
    VolumeGroup {
        base_name: name.to_string(),
        file_type,
        volumes: vec![Volume {
            name: name.to_string(),
            size: file.total_size(),
            number: 0,
        }],
        total_size: file.total_size(),
    }
}

async fn stream_archive_file(
    archive: &ArchiveHandle,
    file_type: FileType,
    password: Option<&str>,
) -> anyhow::Result<Stream> {
    if !archive.is_streamable() {
        return Err(StreamError::NonStreamable(format!("{file_type} archive")).into());
    }
    let files = archive.files();

    let groups = group_volumes(files.iter().map(|f| (f.base_name(), f.size)));
    if !groups.is_empty() {
        trace!(%file_type, groups = groups.len(), "found nested archives, trying them first");
        match stream_nested_archive(files, &groups, password).await {
            Ok(stream) => return Ok(stream),
            Err(err) => debug!(error = %err, "nested archive failed, falling back to direct video"),
        }
    }

    let videos: Vec<&ArchiveFile> = files.iter().filter(|f| is_video_file(&f.name)).collect();
    if videos.is_empty() {
        anyhow::bail!("no video files or nested archives found in {file_type} archive");
    }
    stream_video(&videos, file_type)
}

async fn stream_nested_archive(
    files: &[ArchiveFile],
    groups: &[VolumeGroup],
    password: Option<&str>,
) -> anyhow::Result<Stream> {
    let mut last_err = None;
    for group in groups {
        trace!(
            base_name = %group.base_name,
            file_type = %group.file_type,
            parts = group.volumes.len(),
            total_size = group.total_size,
            "trying nested archive"
        );
        match stream_nested_group(files, group, password).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                debug!(base_name = %group.base_name, error = %err, "nested archive group failed");
                last_err = Some(err);
            }
        }
    }
    match last_err {
        Some(err) => Err(err.context("failed to stream nested archive")),
        None => anyhow::bail!("no streamable content found in nested archives"),
    }
}

async fn stream_nested_group(
    files: &[ArchiveFile],
    group: &VolumeGroup,
    password: Option<&str>,
) -> anyhow::Result<Stream> {
    let mut parts = Vec::with_capacity(group.volumes.len());
    for volume in &group.volumes {
        let Some(part) = files.iter().find(|f| f.base_name() == volume.name) else {
            anyhow::bail!("inner archive part {} is missing", volume.name);
        };
        if !part.streamable {
            return Err(StreamError::NonStreamable(format!("inner archive part {}", part.name)).into());
        }
        parts.push(part.clone());
    }

    let fs: Arc<dyn FileSystem> = Arc::new(ArchiveFs::new(parts));
    let mut inner = ArchiveHandle::for_group(fs, group);
    inner
        .open(password)
        .await
        .context("failed to open inner archive")?;
    if !inner.is_streamable() {
        return Err(StreamError::NonStreamable(format!("inner {} archive", group.file_type)).into());
    }

    let videos: Vec<&ArchiveFile> = inner.files().iter().filter(|f| is_video_file(&f.name)).collect();
    if videos.is_empty() {
        anyhow::bail!("no video files found in inner {} archive", group.file_type);
    }
    stream_video(&videos, group.file_type)
}

/// Opens the largest video; the earliest wins ties.
fn stream_video(videos: &[&ArchiveFile], file_type: FileType) -> anyhow::Result<Stream> {
    let Some(file) = videos
        .iter()
        .copied()
        .reduce(|best, f| if f.size > best.size { f } else { best })
    else {
        anyhow::bail!("no video files found in {file_type} archive");
    };
    trace!(%file_type, name = %file.name, "archive target selected");

    if !file.streamable {
        return Err(StreamError::NonStreamable(format!("file in {file_type} archive")).into());
    }
    let reader = file.open().context("failed to open")?;
    Ok(Stream::new(Box::new(reader), file.name.clone(), file.size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::fixtures::{self, HeaderCoding, Method};
    use crate::nzb::File;
    use crate::testutil::{test_bytes, MemoryFetcher};
    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    fn nzb_of(fetcher: &MemoryFetcher, files: &[(String, Vec<u8>)]) -> Nzb {
        let files: Vec<(&str, &[u8])> = files
            .iter()
            .map(|(name, data)| (name.as_str(), data.as_slice()))
            .collect();
        fetcher.nzb(&files, 256)
    }

    fn config() -> StreamConfig {
        StreamConfig {
            password: None,
            segment_buffer_size: 2,
        }
    }

    async fn read_all(stream: &mut Stream) -> Vec<u8> {
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_plain_largest_file() {
        let fetcher = Arc::new(MemoryFetcher::new());
        let movie = test_bytes(2000);
        let nzb = nzb_of(
            &fetcher,
            &[("movie.nfo".to_string(), test_bytes(100)), ("movie.mkv".to_string(), movie.clone())],
        );

        let mut stream = stream_largest_file(&nzb, fetcher, &config()).await.unwrap();
        assert_eq!(stream.name, "movie.mkv");
        assert_eq!(stream.size, 2000);
        assert_eq!(stream.content_type, "video/x-matroska");

        stream.seek(SeekFrom::Start(1900)).await.unwrap();
        assert_eq!(read_all(&mut stream).await, &movie[1900..]);
    }

    #[tokio::test]
    async fn test_lookup_errors() {
        let fetcher = Arc::new(MemoryFetcher::new());
        let mut nzb = nzb_of(&fetcher, &[("movie.mkv".to_string(), test_bytes(10))]);
        nzb.files.push(File::new("empty", vec!["alt.binaries.test".to_string()], Vec::new()));

        let err = stream_file(&nzb, fetcher.clone(), 5, &config()).await.unwrap_err();
        assert_eq!(err.to_string(), "file index 5 out of range [0, 2)");
        let err = stream_file(&nzb, fetcher.clone(), 1, &config()).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<StreamError>(), Some(StreamError::NoSegments)));
        let err = stream_file_by_name(&nzb, fetcher.clone(), "other.mkv", &config()).await.unwrap_err();
        assert_eq!(err.to_string(), "no file matching 'other.mkv' found");

        let stream = stream_file_by_name(&nzb, fetcher.clone(), "MOVIE.MKV", &config()).await.unwrap();
        assert_eq!(stream.name, "movie.mkv");

        let empty = Nzb::new(Vec::new());
        let err = stream_largest_file(&empty, fetcher, &config()).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<StreamError>(), Some(StreamError::NoFiles)));
    }

    #[tokio::test]
    async fn test_stored_rar_volume_set() {
        let fetcher = Arc::new(MemoryFetcher::new());
        let movie = test_bytes(3000);
        let mut files = fixtures::rar4_split("movie", "Movie.2024.mkv", &movie, 3, Method::Store);
        files.push(("movie.nfo".to_string(), test_bytes(50)));
        let nzb = nzb_of(&fetcher, &files);

        // any volume of the set leads to the same entry
        let mut stream = stream_file(&nzb, fetcher.clone(), 1, &config()).await.unwrap();
        assert_eq!(stream.name, "Movie.2024.mkv");
        assert_eq!(stream.size, 3000);
        stream.seek(SeekFrom::Start(1234)).await.unwrap();
        let mut buf = vec![0u8; 1000];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, &movie[1234..2234]);

        let mut stream = stream_largest_file(&nzb, fetcher, &config()).await.unwrap();
        assert_eq!(read_all(&mut stream).await, movie);
    }

    #[tokio::test]
    async fn test_obfuscated_rar_is_sniffed() {
        let fetcher = Arc::new(MemoryFetcher::new());
        let movie = test_bytes(800);
        let volume = fixtures::rar4_archive(&[("movie.mp4", &movie[..])]);
        let nzb = nzb_of(&fetcher, &[("a8f3c0d9e1".to_string(), volume)]);

        let mut stream = stream_file(&nzb, fetcher, 0, &config()).await.unwrap();
        assert_eq!(stream.name, "movie.mp4");
        assert_eq!(stream.content_type, "video/mp4");
        assert_eq!(read_all(&mut stream).await, movie);
    }

    #[tokio::test]
    async fn test_compressed_rar_is_rejected() {
        let fetcher = Arc::new(MemoryFetcher::new());
        let files = fixtures::rar4_split("movie", "movie.mkv", &test_bytes(1500), 2, Method::Compressed);
        let nzb = nzb_of(&fetcher, &files);

        let err = stream_file(&nzb, fetcher.clone(), 0, &config()).await.unwrap_err();
        assert_eq!(err.to_string(), "non-streamable rar archive");

        let err = select_stream(&nzb, fetcher, &config()).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<StreamError>(), Some(StreamError::NoPlayableContent)));
    }

    #[tokio::test]
    async fn test_select_skips_unplayable_candidates() {
        let fetcher = Arc::new(MemoryFetcher::new());
        let sample = test_bytes(400);
        let mut files = fixtures::rar5_split("movie", "movie.mkv", &test_bytes(3000), 2, Method::Encrypted);
        files.push(("sample.mkv".to_string(), sample.clone()));
        let nzb = nzb_of(&fetcher, &files);

        let mut stream = select_stream(&nzb, fetcher, &config()).await.unwrap();
        assert_eq!(stream.name, "sample.mkv");
        assert_eq!(read_all(&mut stream).await, sample);
    }

    #[tokio::test]
    async fn test_nested_rar() {
        let fetcher = Arc::new(MemoryFetcher::new());
        let movie = test_bytes(2500);
        let inner = fixtures::rar4_split("inner", "movie.mkv", &movie, 2, Method::Store);
        let outer_entries: Vec<(&str, &[u8])> = inner
            .iter()
            .map(|(name, data)| (name.as_str(), data.as_slice()))
            .collect();
        let outer = fixtures::rar4_archive(&outer_entries);
        let nzb = nzb_of(&fetcher, &[("outer.rar".to_string(), outer)]);

        let mut stream = stream_file(&nzb, fetcher, 0, &config()).await.unwrap();
        assert_eq!(stream.name, "movie.mkv");
        assert_eq!(stream.size, 2500);
        stream.seek(SeekFrom::Start(2000)).await.unwrap();
        assert_eq!(read_all(&mut stream).await, &movie[2000..]);
    }

    #[tokio::test]
    async fn test_archive_without_video() {
        let fetcher = Arc::new(MemoryFetcher::new());
        let archive = fixtures::sevenz_stored(&[("readme.txt", &test_bytes(90)[..])], HeaderCoding::Plain);
        let nzb = nzb_of(&fetcher, &[("docs.7z".to_string(), archive)]);

        let err = stream_file(&nzb, fetcher, 0, &config()).await.unwrap_err();
        assert_eq!(err.to_string(), "no video files or nested archives found in 7z archive");
    }

    #[tokio::test]
    async fn test_split_7z() {
        let fetcher = Arc::new(MemoryFetcher::new());
        let movie = test_bytes(3000);
        let archive = fixtures::sevenz_stored(
            &[("sample.mkv", &test_bytes(200)[..]), ("movie.mkv", &movie[..])],
            HeaderCoding::Lzma2,
        );
        let nzb = nzb_of(&fetcher, &fixtures::sevenz_volumes("movie", &archive, 2));

        let mut stream = stream_largest_file(&nzb, fetcher, &config()).await.unwrap();
        assert_eq!(stream.name, "movie.mkv");
        assert_eq!(read_all(&mut stream).await, movie);
    }
}
