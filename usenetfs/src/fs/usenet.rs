use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::io::{self, SeekFrom};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncSeek, ReadBuf};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{clean_path, FileSystem, FsError, Metadata, SeekableFile};
use crate::manager::SegmentFetcher;
use crate::nzb::{Nzb, Segment};
use crate::segment::{ByteRange, SegmentData};

type LocateFuture = Pin<Box<dyn Future<Output = io::Result<(usize, Arc<SegmentData>)>> + Send>>;

/// Byte-offset index over the segments of one posted file. Segment ranges
/// are learned as segments get decoded.
struct SegmentIndex {
    fetcher: Arc<dyn SegmentFetcher>,
    groups: Vec<String>,
    segments: Vec<Segment>,
    ranges: Mutex<Vec<Option<ByteRange>>>,
    recent: Mutex<VecDeque<(usize, Arc<SegmentData>)>>,
    recent_capacity: usize,
    size: u64,
    part_size: u64,
}

impl SegmentIndex {
    /// Fetches the first segment to learn the decoded size and part size.
    async fn build(
        fetcher: Arc<dyn SegmentFetcher>,
        segments: Vec<Segment>,
        groups: Vec<String>,
        buffer_size: usize,
    ) -> anyhow::Result<Arc<Self>> {
        let first = segments
            .first()
            .ok_or_else(|| anyhow::anyhow!("no segments provided"))?;
        let head = fetcher.fetch_segment(&first.message_id, &groups).await?;

        let declared: u64 = segments.iter().map(|s| s.bytes).sum();
        let size = if head.file_size > 0 {
            head.file_size
        } else {
            declared
        };
        let part_size = [head.part_size, head.range.count(), first.bytes]
            .into_iter()
            .find(|&n| n > 0)
            .unwrap_or(1);

        let mut ranges = vec![None; segments.len()];
        ranges[0] = Some(head.range);
        let index = Arc::new(Self {
            fetcher,
            groups,
            segments,
            ranges: Mutex::new(ranges),
            recent: Mutex::new(VecDeque::from([(0, head)])),
            recent_capacity: buffer_size.max(1) + 2,
            size,
            part_size,
        });
        Ok(index)
    }

    fn cached(&self, idx: usize) -> Option<Arc<SegmentData>> {
        self.recent
            .lock()
            .iter()
            .find(|(i, _)| *i == idx)
            .map(|(_, seg)| seg.clone())
    }

    fn cached_containing(&self, pos: u64) -> Option<(usize, Arc<SegmentData>)> {
        self.recent
            .lock()
            .iter()
            .find(|(_, seg)| seg.range.contains(pos))
            .cloned()
    }

    fn known_index(&self, pos: u64) -> Option<usize> {
        self.ranges
            .lock()
            .iter()
            .position(|r| r.is_some_and(|r| r.contains(pos)))
    }

    async fn fetch(&self, idx: usize) -> io::Result<Arc<SegmentData>> {
        if let Some(seg) = self.cached(idx) {
            return Ok(seg);
        }
        let segment = &self.segments[idx];
        trace!(idx, message_id = %segment.message_id, "fetching segment");
        let seg = self
            .fetcher
            .fetch_segment(&segment.message_id, &self.groups)
            .await?;

        self.ranges.lock()[idx] = Some(seg.range);
        let mut recent = self.recent.lock();
        if !recent.iter().any(|(i, _)| *i == idx) {
            if recent.len() >= self.recent_capacity {
                recent.pop_front();
            }
            recent.push_back((idx, seg.clone()));
        }
        Ok(seg)
    }

    /// Finds the segment holding `pos`: a known range first, then an
    /// estimate from the part size, then single steps towards `pos`.
    async fn locate(&self, pos: u64) -> io::Result<(usize, Arc<SegmentData>)> {
        if let Some(hit) = self.cached_containing(pos) {
            return Ok(hit);
        }
        let last = self.segments.len() - 1;
        let mut idx = self
            .known_index(pos)
            .unwrap_or_else(|| ((pos / self.part_size) as usize).min(last));
        let mut stepped_back = None;
        loop {
            let seg = self.fetch(idx).await?;
            if seg.range.contains(pos) {
                return Ok((idx, seg));
            }
            let back = pos < seg.range.start;
            // turning around means `pos` falls in a gap between segments
            if stepped_back == Some(!back) || (back && idx == 0) || (!back && idx == last) {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("offset {pos} is not covered by any segment"),
                ));
            }
            stepped_back = Some(back);
            idx = if back { idx - 1 } else { idx + 1 };
        }
    }
}

struct FileEntry {
    name: String,
    segments: Vec<Segment>,
    groups: Vec<String>,
    modified: Option<DateTime<Utc>>,
    index: OnceCell<Arc<SegmentIndex>>,
}

/// [`FileSystem`] over the files of one NZB.
pub struct UsenetFs {
    fetcher: Arc<dyn SegmentFetcher>,
    files: HashMap<String, Arc<FileEntry>>,
    segment_buffer_size: usize,
}

impl UsenetFs {
    pub fn new(nzb: &Nzb, fetcher: Arc<dyn SegmentFetcher>, segment_buffer_size: usize) -> Self {
        let mut files = HashMap::with_capacity(nzb.files.len());
        for file in &nzb.files {
            if file.segments.is_empty() {
                continue;
            }
            files.entry(file.name().to_string()).or_insert_with(|| {
                Arc::new(FileEntry {
                    name: file.name().to_string(),
                    segments: file.segments.clone(),
                    groups: file.groups.clone(),
                    modified: file.date_time(),
                    index: OnceCell::new(),
                })
            });
        }
        Self {
            fetcher,
            files,
            segment_buffer_size: segment_buffer_size.max(1),
        }
    }

    pub fn segment_buffer_size(&self) -> usize {
        self.segment_buffer_size
    }

    fn entry(&self, op: &'static str, path: &str) -> Result<&Arc<FileEntry>, FsError> {
        let name = clean_path(path);
        if name == "." {
            return Err(FsError::not_exist(op, name));
        }
        self.files
            .get(&name)
            .ok_or_else(|| FsError::not_exist(op, path))
    }

    async fn index(&self, entry: &FileEntry) -> anyhow::Result<Arc<SegmentIndex>> {
        let index = entry
            .index
            .get_or_try_init(|| {
                SegmentIndex::build(
                    self.fetcher.clone(),
                    entry.segments.clone(),
                    entry.groups.clone(),
                    self.segment_buffer_size,
                )
            })
            .await?;
        Ok(index.clone())
    }

    pub async fn open_file(&self, path: &str) -> anyhow::Result<UsenetFile> {
        let entry = self.entry("open", path)?;
        let index = self.index(entry).await?;
        debug!(name = %entry.name, size = index.size, segments = index.segments.len(), "opened usenet file");
        Ok(UsenetFile::new(
            entry.name.clone(),
            entry.modified,
            index,
            self.segment_buffer_size,
        ))
    }
}

#[async_trait]
impl FileSystem for UsenetFs {
    async fn open(&self, path: &str) -> anyhow::Result<Box<dyn SeekableFile>> {
        Ok(Box::new(self.open_file(path).await?))
    }

    async fn stat(&self, path: &str) -> anyhow::Result<Metadata> {
        let entry = self.entry("stat", path)?;
        let index = self.index(entry).await?;
        Ok(Metadata::file(&entry.name, index.size, entry.modified))
    }
}

/// Streams an arbitrary segment list as one file. Returns the reader and
/// the decoded size announced by the first segment.
pub async fn stream_segments(
    fetcher: Arc<dyn SegmentFetcher>,
    mut segments: Vec<Segment>,
    groups: Vec<String>,
    segment_buffer_size: usize,
) -> anyhow::Result<(UsenetFile, u64)> {
    if segments.is_empty() {
        anyhow::bail!("no segments provided");
    }
    segments.sort_by_key(|s| s.number);
    let buffer = segment_buffer_size.max(1);
    let index = SegmentIndex::build(fetcher, segments, groups, buffer).await?;
    let size = index.size;
    Ok((UsenetFile::new(String::new(), None, index, buffer), size))
}

/// Seekable reader over the segments of one posted file.
pub struct UsenetFile {
    name: String,
    modified: Option<DateTime<Utc>>,
    index: Arc<SegmentIndex>,
    position: u64,
    current: Option<(usize, Arc<SegmentData>)>,
    pending: Option<LocateFuture>,
    prefetch: VecDeque<(usize, JoinHandle<()>)>,
    buffer_size: usize,
}

impl UsenetFile {
    fn new(
        name: String,
        modified: Option<DateTime<Utc>>,
        index: Arc<SegmentIndex>,
        buffer_size: usize,
    ) -> Self {
        Self {
            name,
            modified,
            index,
            position: 0,
            current: None,
            pending: None,
            prefetch: VecDeque::new(),
            buffer_size,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.index.size
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn metadata(&self) -> Metadata {
        Metadata::file(&self.name, self.index.size, self.modified)
    }

    /// Reads at `offset` without moving the cursor or reading ahead.
    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let pos = offset + filled as u64;
            if pos >= self.index.size {
                break;
            }
            let (_, seg) = self.index.locate(pos).await?;
            let chunk = seg.slice_from(pos);
            if chunk.is_empty() {
                return Err(short_segment(pos));
            }
            let n = chunk.len().min(buf.len() - filled);
            buf[filled..filled + n].copy_from_slice(&chunk[..n]);
            filled += n;
        }
        Ok(filled)
    }

    /// Starts background fetches for the segments after `idx`.
    fn schedule_prefetch(&mut self, idx: usize) {
        self.prefetch.retain(|(_, handle)| !handle.is_finished());
        let end = (idx + self.buffer_size).min(self.index.segments.len());
        for next in idx + 1..end {
            if self.prefetch.iter().any(|(i, _)| *i == next) || self.index.cached(next).is_some() {
                continue;
            }
            let index = self.index.clone();
            let handle = tokio::spawn(async move {
                if let Err(e) = index.fetch(next).await {
                    debug!(idx = next, "segment prefetch failed: {}", e);
                }
            });
            self.prefetch.push_back((next, handle));
        }
    }

    fn abort_prefetch(&mut self) {
        for (_, handle) in self.prefetch.drain(..) {
            handle.abort();
        }
    }
}

fn short_segment(pos: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("segment ends before offset {pos}"),
    )
}

impl Drop for UsenetFile {
    fn drop(&mut self) {
        self.abort_prefetch();
    }
}

impl AsyncRead for UsenetFile {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let position = self.position;
            if position >= self.index.size || buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }

            if let Some((_, seg)) = &self.current {
                if seg.range.contains(position) {
                    let chunk = seg.slice_from(position);
                    if chunk.is_empty() {
                        return Poll::Ready(Err(short_segment(position)));
                    }
                    let n = chunk.len().min(buf.remaining());
                    buf.put_slice(&chunk[..n]);
                    self.position += n as u64;
                    return Poll::Ready(Ok(()));
                }
            }

            if self.pending.is_none() {
                let index = self.index.clone();
                self.pending = Some(Box::pin(async move { index.locate(position).await }));
            }
            let result = match self.pending.as_mut() {
                Some(fut) => ready!(fut.as_mut().poll(cx)),
                None => continue,
            };
            self.pending = None;
            let (idx, seg) = result?;
            self.current = Some((idx, seg));
            self.schedule_prefetch(idx);
        }
    }
}

impl AsyncSeek for UsenetFile {
    fn start_seek(mut self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        let target = match position {
            SeekFrom::Start(pos) => Some(pos as i128),
            SeekFrom::Current(delta) => Some(self.position as i128 + delta as i128),
            SeekFrom::End(delta) => Some(self.index.size as i128 + delta as i128),
        };
        let target = match target {
            Some(pos) if pos >= 0 => pos as u64,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "seek: negative position",
                ))
            }
        };

        let in_current = self
            .current
            .as_ref()
            .is_some_and(|(_, seg)| seg.range.contains(target));
        if !in_current {
            self.abort_prefetch();
        }
        self.pending = None;
        self.position = target;
        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Poll::Ready(Ok(self.position))
    }
}
