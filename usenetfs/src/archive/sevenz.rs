//! 7z header parsing.
//!
//! The volumes of a split archive (`.7z.001`, `.7z.002`, ...) are plain byte
//! splits of one archive, so they are read as a single concatenated stream.
//! Headers may be LZMA or LZMA2 encoded; entry data is only exposed for
//! folders with a single Copy coder.

use std::sync::Arc;

use async_trait::async_trait;
use lzma_rs::decompress::{Options, UnpackedSize};
use tracing::{debug, trace, warn};

use super::cursor::{read_range, ByteReader};
use super::{split_extents, Archive, ArchiveError, ArchiveFile, FileType, MAGIC_7Z};
use crate::fs::{ExtentReader, FileSystem};

const SIGNATURE_HEADER_SIZE: u64 = 32;
const MAX_HEADER_SIZE: u64 = 64 * 1024 * 1024;
const MAX_ENCODED_DEPTH: usize = 4;

const ID_END: u64 = 0x00;
const ID_HEADER: u64 = 0x01;
const ID_ARCHIVE_PROPERTIES: u64 = 0x02;
const ID_ADDITIONAL_STREAMS: u64 = 0x03;
const ID_MAIN_STREAMS: u64 = 0x04;
const ID_FILES_INFO: u64 = 0x05;
const ID_PACK_INFO: u64 = 0x06;
const ID_UNPACK_INFO: u64 = 0x07;
const ID_SUBSTREAMS: u64 = 0x08;
const ID_SIZE: u64 = 0x09;
const ID_CRC: u64 = 0x0a;
const ID_FOLDER: u64 = 0x0b;
const ID_CODERS_UNPACK_SIZE: u64 = 0x0c;
const ID_NUM_UNPACK_STREAM: u64 = 0x0d;
const ID_EMPTY_STREAM: u64 = 0x0e;
const ID_EMPTY_FILE: u64 = 0x0f;
const ID_NAME: u64 = 0x11;
const ID_ENCODED_HEADER: u64 = 0x17;

const CODER_COPY: &[u8] = &[0x00];
const CODER_LZMA: &[u8] = &[0x03, 0x01, 0x01];
const CODER_LZMA2: &[u8] = &[0x21];
const CODER_AES: &[u8] = &[0x06, 0xf1, 0x07, 0x01];

#[derive(Debug)]
struct Coder {
    id: Vec<u8>,
    num_in: usize,
    num_out: usize,
    props: Vec<u8>,
}

#[derive(Debug, Default)]
struct Folder {
    coders: Vec<Coder>,
    bind_pairs: Vec<(usize, usize)>,
    packed_streams: Vec<usize>,
    unpack_sizes: Vec<u64>,
    crc: Option<u32>,
}

impl Folder {
    /// Size of the one output stream no bind pair consumes.
    fn unpack_size(&self) -> u64 {
        (0..self.unpack_sizes.len())
            .rev()
            .find(|&out| !self.bind_pairs.iter().any(|&(_, bound)| bound == out))
            .map_or(0, |out| self.unpack_sizes[out])
    }

    fn is_copy(&self) -> bool {
        matches!(self.coders.as_slice(), [coder] if coder.id == CODER_COPY)
    }

    fn is_encrypted(&self) -> bool {
        self.coders.iter().any(|c| c.id == CODER_AES)
    }
}

#[derive(Debug, Default)]
struct StreamsInfo {
    pack_pos: u64,
    pack_sizes: Vec<u64>,
    folders: Vec<Folder>,
    /// Unpacked sizes of the substreams of each folder.
    substreams: Option<Vec<Vec<u64>>>,
}

impl StreamsInfo {
    fn substream_sizes(&self) -> Vec<Vec<u64>> {
        match &self.substreams {
            Some(sizes) => sizes.clone(),
            None => self.folders.iter().map(|f| vec![f.unpack_size()]).collect(),
        }
    }
}

#[derive(Debug)]
struct FileInfo {
    name: String,
    has_stream: bool,
    is_dir: bool,
}

#[derive(Debug, Default)]
struct Header {
    streams: StreamsInfo,
    files: Vec<FileInfo>,
}

pub struct SevenZipArchive {
    fs: Arc<dyn FileSystem>,
    volumes: Vec<String>,
    files: Vec<ArchiveFile>,
    streamable: bool,
}

impl SevenZipArchive {
    pub fn new(fs: Arc<dyn FileSystem>, volumes: Vec<String>) -> Self {
        Self {
            fs,
            volumes,
            files: Vec::new(),
            streamable: false,
        }
    }
}

#[async_trait]
impl Archive for SevenZipArchive {
    async fn open(&mut self, password: Option<&str>) -> anyhow::Result<()> {
        if self.volumes.is_empty() {
            return Err(ArchiveError::NoVolumes.into());
        }
        let mut volumes = Vec::with_capacity(self.volumes.len());
        for name in &self.volumes {
            let size = self.fs.stat(name).await?.size;
            volumes.push((name.clone(), size));
        }
        let total: u64 = volumes.iter().map(|(_, size)| size).sum();
        let mut reader = ExtentReader::new(self.fs.clone(), split_extents(&volumes, 0, total));

        let start = read_range(&mut reader, 0, SIGNATURE_HEADER_SIZE as usize).await?;
        if !start.starts_with(MAGIC_7Z) {
            return Err(ArchiveError::BadSignature(FileType::SevenZip).into());
        }
        if start.len() < SIGNATURE_HEADER_SIZE as usize {
            return Err(ArchiveError::malformed("signature header truncated").into());
        }
        let mut r = ByteReader::new(&start[MAGIC_7Z.len()..]);
        let major = r.u8()?;
        let _minor = r.u8()?;
        let start_crc = r.u32()?;
        if crc32fast::hash(&start[12..]) != start_crc {
            return Err(ArchiveError::malformed("signature header checksum mismatch").into());
        }
        if major != 0 {
            return Err(ArchiveError::Unsupported(format!("7z format version {major}")).into());
        }
        let next_offset = r.u64()?;
        let next_size = r.u64()?;
        let next_crc = r.u32()?;

        if next_size == 0 {
            debug!("7z archive has no header, treating as empty");
            self.files.clear();
            self.streamable = true;
            return Ok(());
        }
        let header_pos = SIGNATURE_HEADER_SIZE
            .checked_add(next_offset)
            .filter(|pos| pos.saturating_add(next_size) <= total)
            .ok_or_else(|| ArchiveError::malformed("next header lies beyond the end of the archive"))?;
        if next_size > MAX_HEADER_SIZE {
            return Err(ArchiveError::malformed(format!("header of {next_size} bytes")).into());
        }
        let mut raw = read_range(&mut reader, header_pos, next_size as usize).await?;
        if crc32fast::hash(&raw) != next_crc {
            return Err(ArchiveError::malformed("header checksum mismatch").into());
        }

        let mut depth = 0;
        let header = loop {
            let mut r = ByteReader::new(&raw);
            match r.number()? {
                ID_HEADER => break read_header(&mut r)?,
                ID_ENCODED_HEADER if depth < MAX_ENCODED_DEPTH => {
                    let info = read_streams_info(&mut r)?;
                    trace!(folders = info.folders.len(), "decoding 7z encoded header");
                    raw = decode_header(&mut reader, &info).await?;
                    depth += 1;
                }
                id => {
                    return Err(ArchiveError::malformed(format!("unexpected header block {id:#x}")).into())
                }
            }
        };

        self.files = build_files(&header, &volumes, header_pos, &self.fs)?;
        self.streamable = self.files.iter().all(|f| f.streamable);
        if !self.streamable && password.is_some() && header.streams.folders.iter().any(Folder::is_encrypted) {
            debug!("7z content is encrypted, password cannot be used for streaming");
        }
        debug!(volumes = volumes.len(), files = self.files.len(), streamable = self.streamable, "opened 7z archive");
        Ok(())
    }

    async fn close(&mut self) {
        self.files.clear();
    }

    fn files(&self) -> &[ArchiveFile] {
        &self.files
    }

    fn is_streamable(&self) -> bool {
        self.streamable
    }
}

/// Packed data must end before `data_end`, where the next header starts.
fn build_files(
    header: &Header,
    volumes: &[(String, u64)],
    data_end: u64,
    fs: &Arc<dyn FileSystem>,
) -> Result<Vec<ArchiveFile>, ArchiveError> {
    let streams = &header.streams;

    // (folder, offset within the folder's unpacked data, size)
    let mut substreams = Vec::new();
    for (folder_idx, sizes) in streams.substream_sizes().into_iter().enumerate() {
        let mut offset = 0;
        for size in sizes {
            substreams.push((folder_idx, offset, size));
            offset += size;
        }
    }

    let mut pack_offsets = Vec::with_capacity(streams.pack_sizes.len());
    let mut pack_offset = 0;
    for size in &streams.pack_sizes {
        pack_offsets.push(pack_offset);
        pack_offset += size;
    }
    let mut folder_pack = Vec::with_capacity(streams.folders.len());
    let mut first_pack = 0;
    for folder in &streams.folders {
        folder_pack.push(first_pack);
        first_pack += folder.packed_streams.len();
    }

    let mut files = Vec::new();
    let mut next_stream = substreams.iter();
    for info in &header.files {
        if !info.has_stream {
            if !info.is_dir {
                files.push(ArchiveFile::new(info.name.clone(), 0, 0, true, Vec::new(), fs.clone()));
            }
            continue;
        }
        let &(folder_idx, offset, size) = next_stream
            .next()
            .ok_or_else(|| ArchiveError::malformed("more files than streams"))?;
        let folder = &streams.folders[folder_idx];
        let pack_idx = folder_pack[folder_idx];
        let pack_start = *pack_offsets
            .get(pack_idx)
            .ok_or_else(|| ArchiveError::malformed(format!("folder {folder_idx} has no packed stream")))?;

        let (streamable, packed_size, extents) = if folder.is_copy() {
            let start = SIGNATURE_HEADER_SIZE
                .saturating_add(streams.pack_pos)
                .saturating_add(pack_start)
                .saturating_add(offset);
            if start.saturating_add(size) <= data_end {
                (true, size, split_extents(volumes, start, size))
            } else {
                warn!(name = %info.name, size, "7z entry data runs past the supplied volumes");
                (false, size, Vec::new())
            }
        } else {
            let packed = folder
                .packed_streams
                .iter()
                .filter_map(|i| streams.pack_sizes.get(pack_idx + i))
                .sum();
            (false, packed, Vec::new())
        };
        files.push(ArchiveFile::new(info.name.clone(), size, packed_size, streamable, extents, fs.clone()));
    }
    Ok(files)
}

async fn decode_header(reader: &mut ExtentReader, info: &StreamsInfo) -> Result<Vec<u8>, ArchiveError> {
    let folder = info
        .folders
        .first()
        .ok_or_else(|| ArchiveError::malformed("encoded header has no folder"))?;
    let packed_size = *info
        .pack_sizes
        .first()
        .ok_or_else(|| ArchiveError::malformed("encoded header has no packed stream"))?;
    let packed = read_range(reader, SIGNATURE_HEADER_SIZE + info.pack_pos, packed_size as usize).await?;
    if packed.len() as u64 != packed_size {
        return Err(ArchiveError::malformed("encoded header truncated"));
    }

    let size = folder.unpack_size();
    let out = decode_folder(folder, &packed, size)?;
    if out.len() as u64 != size {
        return Err(ArchiveError::malformed(format!(
            "encoded header decoded to {} bytes, expected {size}",
            out.len()
        )));
    }
    if folder.crc.is_some_and(|crc| crc != crc32fast::hash(&out)) {
        return Err(ArchiveError::malformed("encoded header checksum mismatch"));
    }
    Ok(out)
}

fn decode_folder(folder: &Folder, packed: &[u8], size: u64) -> Result<Vec<u8>, ArchiveError> {
    if folder.is_encrypted() {
        return Err(ArchiveError::HeadersEncrypted);
    }
    let [coder] = folder.coders.as_slice() else {
        return Err(ArchiveError::Unsupported(format!(
            "header coder chain of {} coders",
            folder.coders.len()
        )));
    };
    let lzma_error = |e: lzma_rs::error::Error| ArchiveError::malformed(format!("header decompression: {e}"));

    let mut out = Vec::with_capacity(size.min(MAX_HEADER_SIZE) as usize);
    match coder.id.as_slice() {
        CODER_COPY => out.extend_from_slice(packed),
        CODER_LZMA => {
            let mut input = coder.props.clone();
            input.extend_from_slice(packed);
            let options = Options {
                unpacked_size: UnpackedSize::UseProvided(Some(size)),
                ..Default::default()
            };
            lzma_rs::lzma_decompress_with_options(&mut input.as_slice(), &mut out, &options)
                .map_err(lzma_error)?;
        }
        CODER_LZMA2 => lzma_rs::lzma2_decompress(&mut &packed[..], &mut out).map_err(lzma_error)?,
        id => return Err(ArchiveError::Unsupported(format!("header coder {id:02x?}"))),
    }
    Ok(out)
}

fn expect_id(r: &mut ByteReader<'_>, want: u64) -> Result<(), ArchiveError> {
    let id = r.number()?;
    if id != want {
        return Err(ArchiveError::malformed(format!("expected property {want:#x}, found {id:#x}")));
    }
    Ok(())
}

fn read_header(r: &mut ByteReader<'_>) -> Result<Header, ArchiveError> {
    let mut header = Header::default();
    loop {
        match r.number()? {
            ID_END => return Ok(header),
            ID_ARCHIVE_PROPERTIES => loop {
                if r.number()? == ID_END {
                    break;
                }
                let size = r.usize_number()?;
                r.skip(size)?;
            },
            ID_ADDITIONAL_STREAMS => {
                return Err(ArchiveError::Unsupported("additional header streams".to_string()))
            }
            ID_MAIN_STREAMS => header.streams = read_streams_info(r)?,
            ID_FILES_INFO => header.files = read_files_info(r)?,
            id => return Err(ArchiveError::malformed(format!("unexpected header property {id:#x}"))),
        }
    }
}

fn read_streams_info(r: &mut ByteReader<'_>) -> Result<StreamsInfo, ArchiveError> {
    let mut info = StreamsInfo::default();
    loop {
        match r.number()? {
            ID_END => return Ok(info),
            ID_PACK_INFO => {
                info.pack_pos = r.number()?;
                let count = r.usize_number()?;
                info.pack_sizes = vec![0; count];
                loop {
                    match r.number()? {
                        ID_END => break,
                        ID_SIZE => {
                            for size in info.pack_sizes.iter_mut() {
                                *size = r.number()?;
                            }
                        }
                        ID_CRC => {
                            read_digests(r, count)?;
                        }
                        id => return Err(ArchiveError::malformed(format!("unexpected pack property {id:#x}"))),
                    }
                }
            }
            ID_UNPACK_INFO => info.folders = read_unpack_info(r)?,
            ID_SUBSTREAMS => info.substreams = Some(read_substreams(r, &info.folders)?),
            id => return Err(ArchiveError::malformed(format!("unexpected streams property {id:#x}"))),
        }
    }
}

fn read_digests(r: &mut ByteReader<'_>, count: usize) -> Result<Vec<Option<u32>>, ArchiveError> {
    let defined = if r.u8()? != 0 {
        vec![true; count]
    } else {
        r.bits(count)?
    };
    defined
        .into_iter()
        .map(|defined| if defined { r.u32().map(Some) } else { Ok(None) })
        .collect()
}

fn read_folder(r: &mut ByteReader<'_>) -> Result<Folder, ArchiveError> {
    let mut folder = Folder::default();
    let num_coders = r.usize_number()?;
    for _ in 0..num_coders {
        let flags = r.u8()?;
        if flags & 0x80 != 0 {
            return Err(ArchiveError::Unsupported("alternative coder methods".to_string()));
        }
        let id = r.bytes(usize::from(flags & 0x0f))?.to_vec();
        let (num_in, num_out) = if flags & 0x10 != 0 {
            (r.usize_number()?, r.usize_number()?)
        } else {
            (1, 1)
        };
        let props = if flags & 0x20 != 0 {
            let len = r.usize_number()?;
            r.bytes(len)?.to_vec()
        } else {
            Vec::new()
        };
        folder.coders.push(Coder {
            id,
            num_in,
            num_out,
            props,
        });
    }

    let total_in: usize = folder.coders.iter().map(|c| c.num_in).sum();
    let total_out: usize = folder.coders.iter().map(|c| c.num_out).sum();
    for _ in 0..total_out.saturating_sub(1) {
        folder.bind_pairs.push((r.usize_number()?, r.usize_number()?));
    }
    let num_packed = total_in
        .checked_sub(folder.bind_pairs.len())
        .filter(|&n| n > 0)
        .ok_or_else(|| ArchiveError::malformed("folder has no packed streams"))?;
    if num_packed == 1 {
        let input = (0..total_in)
            .find(|&i| !folder.bind_pairs.iter().any(|&(bound, _)| bound == i))
            .ok_or_else(|| ArchiveError::malformed("folder inputs are all bound"))?;
        folder.packed_streams.push(input);
    } else {
        for _ in 0..num_packed {
            folder.packed_streams.push(r.usize_number()?);
        }
    }
    Ok(folder)
}

fn read_unpack_info(r: &mut ByteReader<'_>) -> Result<Vec<Folder>, ArchiveError> {
    expect_id(r, ID_FOLDER)?;
    let count = r.usize_number()?;
    if r.u8()? != 0 {
        return Err(ArchiveError::Unsupported("external folder definitions".to_string()));
    }
    let mut folders = (0..count).map(|_| read_folder(r)).collect::<Result<Vec<_>, _>>()?;

    expect_id(r, ID_CODERS_UNPACK_SIZE)?;
    for folder in folders.iter_mut() {
        let outputs: usize = folder.coders.iter().map(|c| c.num_out).sum();
        folder.unpack_sizes = (0..outputs).map(|_| r.number()).collect::<Result<_, _>>()?;
    }

    loop {
        match r.number()? {
            ID_END => return Ok(folders),
            ID_CRC => {
                for (folder, crc) in folders.iter_mut().zip(read_digests(r, count)?) {
                    folder.crc = crc;
                }
            }
            id => return Err(ArchiveError::malformed(format!("unexpected unpack property {id:#x}"))),
        }
    }
}

fn read_substreams(r: &mut ByteReader<'_>, folders: &[Folder]) -> Result<Vec<Vec<u64>>, ArchiveError> {
    let mut counts = vec![1usize; folders.len()];
    let mut id = r.number()?;
    if id == ID_NUM_UNPACK_STREAM {
        for count in counts.iter_mut() {
            *count = r.usize_number()?;
        }
        id = r.number()?;
    }

    let has_sizes = id == ID_SIZE;
    let mut sizes = Vec::with_capacity(folders.len());
    for (folder, &count) in folders.iter().zip(&counts) {
        if count == 0 {
            sizes.push(Vec::new());
            continue;
        }
        if count > 1 && !has_sizes {
            return Err(ArchiveError::malformed("substream sizes missing"));
        }
        let mut folder_sizes = Vec::with_capacity(count);
        let mut sum = 0u64;
        if has_sizes {
            for _ in 1..count {
                let size = r.number()?;
                sum = sum.saturating_add(size);
                folder_sizes.push(size);
            }
        }
        let last = folder
            .unpack_size()
            .checked_sub(sum)
            .ok_or_else(|| ArchiveError::malformed("substreams exceed folder size"))?;
        folder_sizes.push(last);
        sizes.push(folder_sizes);
    }
    if has_sizes {
        id = r.number()?;
    }

    loop {
        match id {
            ID_END => return Ok(sizes),
            ID_CRC => {
                let unknown = folders
                    .iter()
                    .zip(&counts)
                    .filter(|(folder, count)| !(**count == 1 && folder.crc.is_some()))
                    .map(|(_, count)| *count)
                    .sum();
                read_digests(r, unknown)?;
            }
            id => return Err(ArchiveError::malformed(format!("unexpected substream property {id:#x}"))),
        }
        id = r.number()?;
    }
}

fn read_files_info(r: &mut ByteReader<'_>) -> Result<Vec<FileInfo>, ArchiveError> {
    let count = r.usize_number()?;
    let mut empty_stream = vec![false; count];
    let mut empty_file = Vec::new();
    let mut names = Vec::new();

    loop {
        let property = r.number()?;
        if property == ID_END {
            break;
        }
        let size = r.usize_number()?;
        let mut p = ByteReader::new(r.bytes(size)?);
        match property {
            ID_EMPTY_STREAM => empty_stream = p.bits(count)?,
            ID_EMPTY_FILE => {
                let empties = empty_stream.iter().filter(|&&e| e).count();
                empty_file = p.bits(empties)?;
            }
            ID_NAME => {
                if p.u8()? != 0 {
                    return Err(ArchiveError::Unsupported("external file names".to_string()));
                }
                let raw = p.bytes(p.remaining())?;
                names = decode_names(raw);
            }
            // times, attributes, padding
            _ => {}
        }
    }

    let mut empty_idx = 0;
    let files = (0..count)
        .map(|i| {
            let has_stream = !empty_stream[i];
            let is_dir = if has_stream {
                false
            } else {
                let is_file = empty_file.get(empty_idx).copied().unwrap_or(false);
                empty_idx += 1;
                !is_file
            };
            FileInfo {
                name: names.get(i).cloned().unwrap_or_default(),
                has_stream,
                is_dir,
            }
        })
        .collect();
    Ok(files)
}

fn decode_names(raw: &[u8]) -> Vec<String> {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    let mut names: Vec<String> = units
        .split(|&u| u == 0)
        .map(|name| String::from_utf16_lossy(name).replace('\\', "/"))
        .collect();
    // trailing terminator
    names.pop();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::fixtures::{self, HeaderCoding};
    use crate::fs::UsenetFs;
    use crate::testutil::{test_bytes, MemoryFetcher};
    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    fn filesystem(volumes: &[(String, Vec<u8>)]) -> Arc<dyn FileSystem> {
        let fetcher = Arc::new(MemoryFetcher::new());
        let files: Vec<(&str, &[u8])> = volumes
            .iter()
            .map(|(name, data)| (name.as_str(), data.as_slice()))
            .collect();
        let nzb = fetcher.nzb(&files, 256);
        Arc::new(UsenetFs::new(&nzb, fetcher, 3))
    }

    async fn open(volumes: &[(String, Vec<u8>)]) -> anyhow::Result<SevenZipArchive> {
        let names = volumes.iter().map(|(name, _)| name.clone()).collect();
        let mut archive = SevenZipArchive::new(filesystem(volumes), names);
        archive.open(None).await?;
        Ok(archive)
    }

    #[tokio::test]
    async fn test_stored_multiple_files() {
        let sample = test_bytes(200);
        let movie: Vec<u8> = test_bytes(1500).into_iter().rev().collect();
        let archive = fixtures::sevenz_stored(
            &[
                ("sample.txt", &sample[..]),
                ("extras/", &[][..]),
                ("movie.mkv", &movie[..]),
                ("empty.nfo", &[][..]),
            ],
            HeaderCoding::Plain,
        );
        let archive = open(&[("movie.7z".to_string(), archive)]).await.unwrap();

        assert!(archive.is_streamable());
        let names: Vec<&str> = archive.files().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["sample.txt", "movie.mkv", "empty.nfo"]);
        assert_eq!(archive.files()[1].size, 1500);
        assert_eq!(archive.files()[2].size, 0);

        let mut out = Vec::new();
        archive.files()[1].open().unwrap().read_to_end(&mut out).await.unwrap();
        assert_eq!(out, movie);
    }

    #[tokio::test]
    async fn test_split_volumes() {
        let movie = test_bytes(4000);
        let archive = fixtures::sevenz_stored(&[("movie.mkv", &movie[..])], HeaderCoding::Plain);
        let volumes = fixtures::sevenz_volumes("movie", &archive, 3);
        assert_eq!(volumes[1].0, "movie.7z.002");
        let archive = open(&volumes).await.unwrap();

        let file = &archive.files()[0];
        assert!(file.extents().len() > 1);
        let mut reader = file.open().unwrap();
        reader.seek(std::io::SeekFrom::Start(2500)).await.unwrap();
        let mut buf = vec![0u8; 1000];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, &movie[2500..3500]);
    }

    #[tokio::test]
    async fn test_lzma2_encoded_header() {
        let movie = test_bytes(900);
        let archive = fixtures::sevenz_stored(&[("movie.mkv", &movie[..])], HeaderCoding::Lzma2);
        let archive = open(&[("movie.7z".to_string(), archive)]).await.unwrap();
        assert_eq!(archive.files().len(), 1);
        let mut out = Vec::new();
        archive.files()[0].open().unwrap().read_to_end(&mut out).await.unwrap();
        assert_eq!(out, movie);
    }

    #[tokio::test]
    async fn test_encrypted_header() {
        let archive = fixtures::sevenz_stored(&[("movie.mkv", &test_bytes(100)[..])], HeaderCoding::Aes);
        let err = open(&[("movie.7z".to_string(), archive)]).await.err().unwrap();
        assert!(matches!(
            err.downcast_ref::<ArchiveError>(),
            Some(ArchiveError::HeadersEncrypted)
        ));
    }

    #[tokio::test]
    async fn test_compressed_folder_is_not_streamable() {
        let movie = test_bytes(600);
        let archive = fixtures::sevenz_archive(
            &[("movie.mkv", &movie[..])],
            CODER_LZMA,
            &[0x5d, 0, 0, 0x10, 0],
            HeaderCoding::Plain,
        );
        let archive = open(&[("movie.7z".to_string(), archive)]).await.unwrap();
        assert!(!archive.is_streamable());
        let file = &archive.files()[0];
        assert_eq!(file.size, 600);
        assert!(matches!(file.open(), Err(ArchiveError::NotStreamable(_))));
    }

    #[tokio::test]
    async fn test_missing_or_truncated_volume_is_malformed() {
        let movie = test_bytes(4000);
        let archive = fixtures::sevenz_stored(&[("movie.mkv", &movie[..])], HeaderCoding::Plain);

        let mut volumes = fixtures::sevenz_volumes("movie", &archive, 3);
        volumes.remove(1);
        let err = open(&volumes).await.err().unwrap();
        assert!(
            matches!(err.downcast_ref::<ArchiveError>(), Some(ArchiveError::Malformed(_))),
            "{err}"
        );

        let mut volumes = fixtures::sevenz_volumes("movie", &archive, 3);
        let last = volumes.last_mut().unwrap();
        last.1.truncate(last.1.len() - 10);
        let err = open(&volumes).await.err().unwrap();
        assert!(
            matches!(err.downcast_ref::<ArchiveError>(), Some(ArchiveError::Malformed(_))),
            "{err}"
        );
    }

    #[tokio::test]
    async fn test_pack_size_past_supplied_data() {
        let movie = test_bytes(500);
        let archive = fixtures::sevenz_short_pack("movie.mkv", &movie, 5000);
        let volumes = fixtures::sevenz_volumes("movie", &archive, 2);
        let archive = open(&volumes).await.unwrap();

        assert!(!archive.is_streamable());
        let file = &archive.files()[0];
        assert_eq!(file.size, 5000);
        assert!(!file.streamable);
        assert!(matches!(file.open(), Err(ArchiveError::NotStreamable(_))));
    }

    #[tokio::test]
    async fn test_bad_signature() {
        let err = open(&[("movie.7z".to_string(), test_bytes(64))]).await.err().unwrap();
        assert!(matches!(
            err.downcast_ref::<ArchiveError>(),
            Some(ArchiveError::BadSignature(FileType::SevenZip))
        ));
    }

    #[test]
    fn test_decode_names() {
        let mut raw = Vec::new();
        for name in ["a.mkv", "dir\\b.txt"] {
            raw.extend(name.encode_utf16().flat_map(u16::to_le_bytes));
            raw.extend_from_slice(&[0, 0]);
        }
        assert_eq!(decode_names(&raw), vec!["a.mkv", "dir/b.txt"]);
    }
}
