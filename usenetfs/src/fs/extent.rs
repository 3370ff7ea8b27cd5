use std::future::Future;
use std::io::{self, SeekFrom};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncSeek, ReadBuf};

use super::{FileSystem, SeekableFile};

type OpenFuture = Pin<Box<dyn Future<Output = anyhow::Result<Box<dyn SeekableFile>>> + Send>>;

/// A run of bytes inside one volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extent {
    pub volume: String,
    pub offset: u64,
    pub length: u64,
}

impl Extent {
    pub fn new(volume: impl Into<String>, offset: u64, length: u64) -> Self {
        Self {
            volume: volume.into(),
            offset,
            length,
        }
    }
}

struct OpenVolume {
    name: String,
    file: Box<dyn SeekableFile>,
    /// Position of `file`, unknown while a seek is in flight.
    position: Option<u64>,
    seeking: bool,
}

/// Seekable reader over an ordered list of extents, possibly spread over
/// several volumes. Volumes are opened lazily, one at a time.
pub struct ExtentReader {
    fs: Arc<dyn FileSystem>,
    extents: Vec<Extent>,
    /// Logical start of each extent.
    starts: Vec<u64>,
    size: u64,
    position: u64,
    volume: Option<OpenVolume>,
    opening: Option<(String, OpenFuture)>,
    scratch: Vec<u8>,
}

impl ExtentReader {
    pub fn new(fs: Arc<dyn FileSystem>, extents: Vec<Extent>) -> Self {
        let mut starts = Vec::with_capacity(extents.len());
        let mut size = 0;
        for extent in &extents {
            starts.push(size);
            size += extent.length;
        }
        Self {
            fs,
            extents,
            starts,
            size,
            position: 0,
            volume: None,
            opening: None,
            scratch: Vec::new(),
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn extent_at(&self, pos: u64) -> Option<usize> {
        let idx = self.starts.partition_point(|&start| start <= pos);
        let idx = idx.checked_sub(1)?;
        (pos < self.starts[idx] + self.extents[idx].length).then_some(idx)
    }
}

impl AsyncRead for ExtentReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            if this.position >= this.size || buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }
            let Some(idx) = this.extent_at(this.position) else {
                return Poll::Ready(Ok(()));
            };
            let extent = &this.extents[idx];
            let within = this.position - this.starts[idx];
            let target = extent.offset + within;
            let left = extent.length - within;

            if let Some((_, fut)) = this.opening.as_mut() {
                let opened = ready!(fut.as_mut().poll(cx));
                let name = this.opening.take().map(|(name, _)| name).unwrap_or_default();
                let file = opened.map_err(io::Error::other)?;
                this.volume = Some(OpenVolume {
                    name,
                    file,
                    position: Some(0),
                    seeking: false,
                });
                continue;
            }

            let open = this
                .volume
                .as_ref()
                .is_some_and(|volume| volume.name == extent.volume);
            if !open {
                let fs = this.fs.clone();
                let name = extent.volume.clone();
                let open_name = name.clone();
                this.volume = None;
                this.opening = Some((name, Box::pin(async move { fs.open(&open_name).await })));
                continue;
            }
            let Some(volume) = this.volume.as_mut() else {
                continue;
            };

            if volume.position != Some(target) {
                if !volume.seeking {
                    Pin::new(&mut volume.file).start_seek(SeekFrom::Start(target))?;
                    volume.seeking = true;
                    volume.position = None;
                }
                let reached = ready!(Pin::new(&mut volume.file).poll_complete(cx));
                volume.seeking = false;
                let reached = reached?;
                if reached != target {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("volume {} ends before offset {target}", volume.name),
                    )));
                }
                volume.position = Some(reached);
            }

            let want = buf.remaining().min(left as usize);
            this.scratch.resize(want, 0);
            let mut read_buf = ReadBuf::new(&mut this.scratch);
            ready!(Pin::new(&mut volume.file).poll_read(cx, &mut read_buf))?;
            let n = read_buf.filled().len();
            if n == 0 {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("volume {} ended early", volume.name),
                )));
            }
            buf.put_slice(read_buf.filled());
            volume.position = Some(target + n as u64);
            this.position += n as u64;
            return Poll::Ready(Ok(()));
        }
    }
}

impl AsyncSeek for ExtentReader {
    fn start_seek(mut self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        let target = match position {
            SeekFrom::Start(pos) => pos as i128,
            SeekFrom::Current(delta) => self.position as i128 + delta as i128,
            SeekFrom::End(delta) => self.size as i128 + delta as i128,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek: negative position",
            ));
        }
        self.position = target as u64;
        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Poll::Ready(Ok(self.position))
    }
}
