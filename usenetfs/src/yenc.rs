//! yEnc part decoder.
//!
//! Decodes `=ybegin` / `=ypart` / `=yend` framed bodies as they arrive from
//! an NNTP body reader, without buffering the whole article first.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, ReadBuf};
use tracing::trace;

use crate::segment::{ByteRange, SegmentData};

const LINE_LENGTH: usize = 128;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct YencHeader {
    pub name: String,
    /// Size of the whole file.
    pub size: u64,
    pub part: u32,
    pub total: u32,
    pub line: u32,
    /// 1-based, inclusive.
    pub begin: u64,
    /// 1-based, inclusive.
    pub end: u64,
}

impl YencHeader {
    pub fn part_size(&self) -> u64 {
        if self.end >= self.begin && self.end > 0 {
            self.end - self.begin + 1
        } else {
            self.size
        }
    }

    pub fn byte_range(&self) -> ByteRange {
        ByteRange::new(self.begin.saturating_sub(1), self.end.max(self.begin.saturating_sub(1)))
    }

    fn parse_begin(line: &str) -> Self {
        let (fields, name) = match line.find(" name=") {
            Some(idx) => (&line[..idx], line[idx + " name=".len()..].trim_end()),
            None => (line, ""),
        };
        let mut header = YencHeader {
            name: name.to_string(),
            ..Default::default()
        };
        for (key, value) in pairs(fields) {
            match key {
                "part" => header.part = value.parse().unwrap_or(0),
                "total" => header.total = value.parse().unwrap_or(0),
                "line" => header.line = value.parse().unwrap_or(0),
                "size" => header.size = value.parse().unwrap_or(0),
                _ => {}
            }
        }
        // single-part posts have no =ypart line
        header.begin = 1;
        header.end = header.size;
        header
    }
}

fn pairs(line: &str) -> impl Iterator<Item = (&str, &str)> {
    line.split_whitespace().filter_map(|kv| kv.split_once('='))
}

/// Streams the decoded bytes of one yEnc part.
pub struct YencDecoder<R> {
    inner: R,
    header: Option<YencHeader>,
    expecting_part: bool,
    line: Vec<u8>,
    decoded: Vec<u8>,
    pos: usize,
    crc: crc32fast::Hasher,
    done: bool,
    eof: bool,
}

impl<R: AsyncBufRead + Unpin> YencDecoder<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            header: None,
            expecting_part: false,
            line: Vec::with_capacity(LINE_LENGTH + 8),
            decoded: Vec::with_capacity(LINE_LENGTH),
            pos: 0,
            crc: crc32fast::Hasher::new(),
            done: false,
            eof: false,
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Reads up to the first data line and returns the parsed header.
    pub async fn header(&mut self) -> io::Result<YencHeader> {
        std::future::poll_fn(|cx| self.poll_header(cx)).await?;
        self.header
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing =ybegin line"))
    }

    /// Decodes the whole part.
    pub async fn read_all(&mut self) -> io::Result<(Vec<u8>, YencHeader)> {
        let header = self.header().await?;
        let mut body = Vec::with_capacity(header.part_size() as usize);
        self.read_to_end(&mut body).await?;
        trace!(name = %header.name, part = header.part, decoded = body.len(), "yenc part decoded");
        Ok((body, header))
    }

    /// Decodes the whole part into a cacheable segment.
    pub async fn read_segment(&mut self) -> io::Result<SegmentData> {
        let (body, header) = self.read_all().await?;
        Ok(SegmentData {
            range: header.byte_range(),
            file_size: header.size,
            part_size: header.part_size(),
            body: body.into(),
        })
    }

    fn header_ready(&self) -> bool {
        self.header.is_some()
            && (!self.expecting_part || !self.decoded.is_empty() || self.done || self.eof)
    }

    fn poll_header(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.header_ready() {
            if self.eof {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "missing =ybegin line",
                )));
            }
            ready!(self.poll_line(cx))?;
        }
        Poll::Ready(Ok(()))
    }

    /// Reads and handles one line of input.
    fn poll_line(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        loop {
            let (used, complete) = {
                let available = ready!(Pin::new(&mut self.inner).poll_fill_buf(cx))?;
                if available.is_empty() {
                    self.eof = true;
                    (0, true)
                } else {
                    match available.iter().position(|&b| b == b'\n') {
                        Some(i) => {
                            self.line.extend_from_slice(&available[..=i]);
                            (i + 1, true)
                        }
                        None => {
                            self.line.extend_from_slice(available);
                            (available.len(), false)
                        }
                    }
                }
            };
            Pin::new(&mut self.inner).consume(used);
            if complete {
                break;
            }
        }

        let mut line = std::mem::take(&mut self.line);
        let result = self.handle_line(trim_line(&line));
        line.clear();
        self.line = line;
        Poll::Ready(result)
    }

    fn handle_line(&mut self, line: &[u8]) -> io::Result<()> {
        if line.is_empty() && self.eof {
            return Ok(());
        }
        if self.done {
            return Ok(());
        }

        if self.header.is_none() {
            if line.starts_with(b"=ybegin ") {
                let header = YencHeader::parse_begin(&String::from_utf8_lossy(line));
                self.expecting_part = header.part > 0;
                self.header = Some(header);
            }
            return Ok(());
        }

        if self.expecting_part {
            self.expecting_part = false;
            if line.starts_with(b"=ypart ") {
                let text = String::from_utf8_lossy(line);
                if let Some(header) = self.header.as_mut() {
                    for (key, value) in pairs(&text) {
                        match key {
                            "begin" => header.begin = value.parse().unwrap_or(header.begin),
                            "end" => header.end = value.parse().unwrap_or(header.end),
                            _ => {}
                        }
                    }
                }
                return Ok(());
            }
        }

        if line.starts_with(b"=yend") {
            self.done = true;
            return self.verify_trailer(&String::from_utf8_lossy(line));
        }

        let start = self.decoded.len();
        decode_line(line, &mut self.decoded);
        self.crc.update(&self.decoded[start..]);
        Ok(())
    }

    fn verify_trailer(&mut self, line: &str) -> io::Result<()> {
        let single_part = self.header.as_ref().is_some_and(|h| h.part == 0);
        let mut expected = None;
        for (key, value) in pairs(line) {
            match key {
                "pcrc32" => expected = u32::from_str_radix(value, 16).ok(),
                "crc32" if single_part && expected.is_none() => {
                    expected = u32::from_str_radix(value, 16).ok()
                }
                _ => {}
            }
        }
        let actual = std::mem::take(&mut self.crc).finalize();
        match expected {
            Some(expected) if expected != actual => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("yenc crc mismatch: expected {expected:08x}, got {actual:08x}"),
            )),
            _ => Ok(()),
        }
    }
}

impl<R: AsyncBufRead + Unpin> AsyncRead for YencDecoder<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_header(cx))?;
        loop {
            if this.pos < this.decoded.len() {
                let n = (this.decoded.len() - this.pos).min(buf.remaining());
                buf.put_slice(&this.decoded[this.pos..this.pos + n]);
                this.pos += n;
                return Poll::Ready(Ok(()));
            }
            if this.done || this.eof {
                return Poll::Ready(Ok(()));
            }
            this.decoded.clear();
            this.pos = 0;
            ready!(this.poll_line(cx))?;
        }
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn decode_line(line: &[u8], out: &mut Vec<u8>) {
    let mut escaped = false;
    for &b in line {
        if escaped {
            out.push(b.wrapping_sub(64).wrapping_sub(42));
            escaped = false;
        } else if b == b'=' {
            escaped = true;
        } else {
            out.push(b.wrapping_sub(42));
        }
    }
}

/// Encodes `data` as one yEnc part of a `file_size` byte file. `begin` is
/// the 0-based offset of `data` within the file.
pub fn encode_part(
    data: &[u8],
    name: &str,
    file_size: u64,
    part: u32,
    total: u32,
    begin: u64,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 32 + 256);
    out.extend_from_slice(
        format!(
            "=ybegin part={part} total={total} line={LINE_LENGTH} size={file_size} name={name}\r\n"
        )
        .as_bytes(),
    );
    out.extend_from_slice(
        format!(
            "=ypart begin={} end={}\r\n",
            begin + 1,
            begin + data.len() as u64
        )
        .as_bytes(),
    );

    let mut col = 0;
    for &b in data {
        let v = b.wrapping_add(42);
        if matches!(v, 0x00 | 0x0A | 0x0D | b'=') {
            out.push(b'=');
            out.push(v.wrapping_add(64));
            col += 2;
        } else {
            out.push(v);
            col += 1;
        }
        if col >= LINE_LENGTH {
            out.extend_from_slice(b"\r\n");
            col = 0;
        }
    }
    if col > 0 {
        out.extend_from_slice(b"\r\n");
    }

    out.extend_from_slice(
        format!(
            "=yend size={} part={part} pcrc32={:08x}\r\n",
            data.len(),
            crc32fast::hash(data)
        )
        .as_bytes(),
    );
    out
}
