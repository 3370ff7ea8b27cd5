//! RAR 1.5-4.x and RAR 5.0 header walking.
//!
//! Only headers are parsed. Entry data is never decompressed: an entry is
//! streamable when it is stored (method 0), unencrypted and not solid, in
//! which case its data chunks in every volume become the entry's extents.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use super::cursor::{read_range, ByteReader};
use super::{Archive, ArchiveError, ArchiveFile, FileType, MAGIC_RAR4, MAGIC_RAR5};
use crate::fs::{Extent, FileSystem, SeekableFile};

const RAR4_MAIN: u8 = 0x73;
const RAR4_FILE: u8 = 0x74;
const RAR4_END: u8 = 0x7b;

const RAR4_MAIN_SOLID: u16 = 0x0008;
const RAR4_MAIN_PASSWORD: u16 = 0x0080;

const RAR4_SPLIT_BEFORE: u16 = 0x0001;
const RAR4_SPLIT_AFTER: u16 = 0x0002;
const RAR4_ENCRYPTED: u16 = 0x0004;
const RAR4_SOLID: u16 = 0x0010;
const RAR4_DIRECTORY: u16 = 0x00e0;
const RAR4_LARGE: u16 = 0x0100;
const RAR4_UNICODE: u16 = 0x0200;
const RAR4_LONG_BLOCK: u16 = 0x8000;
const RAR4_METHOD_STORE: u8 = 0x30;

const RAR5_MAIN: u64 = 1;
const RAR5_FILE: u64 = 2;
const RAR5_ENCRYPTION: u64 = 4;
const RAR5_END: u64 = 5;

const RAR5_HAS_EXTRA: u64 = 0x0001;
const RAR5_HAS_DATA: u64 = 0x0002;
const RAR5_SPLIT_BEFORE: u64 = 0x0008;
const RAR5_SPLIT_AFTER: u64 = 0x0010;
const RAR5_MAIN_SOLID: u64 = 0x0004;
const RAR5_FILE_DIRECTORY: u64 = 0x0001;
const RAR5_FILE_MTIME: u64 = 0x0002;
const RAR5_FILE_CRC: u64 = 0x0004;
const RAR5_EXTRA_ENCRYPTION: u64 = 0x01;

const MAX_HEADER_SIZE: u64 = 2 * 1024 * 1024;

/// File header as read from one volume.
#[derive(Debug)]
struct FileHeader {
    name: String,
    unpacked_size: u64,
    stored: bool,
    encrypted: bool,
    solid: bool,
    directory: bool,
    split_before: bool,
    split_after: bool,
    data: Extent,
}

#[derive(Debug)]
struct Entry {
    name: String,
    size: u64,
    packed_size: u64,
    stored: bool,
    encrypted: bool,
    solid: bool,
    directory: bool,
    extents: Vec<Extent>,
    continues: bool,
    /// A piece of the entry is missing or cut short.
    broken: bool,
}

impl Entry {
    /// Stored data must cover the unpacked size exactly, otherwise offsets
    /// past a gap would map to the wrong bytes.
    fn complete(&self) -> bool {
        !self.broken && (!self.stored || self.packed_size == self.size)
    }

    fn streamable(&self) -> bool {
        self.stored && !self.encrypted && !self.solid && self.complete()
    }
}

/// Accumulates file headers across volumes, joining split entries.
#[derive(Default)]
struct Entries {
    entries: Vec<Entry>,
    solid: bool,
}

impl Entries {
    fn add(&mut self, mut header: FileHeader, volume_size: u64) {
        trace!(name = %header.name, volume = %header.data.volume, offset = header.data.offset, length = header.data.length, "rar file header");
        let available = volume_size.saturating_sub(header.data.offset);
        let truncated = header.data.length > available;
        if truncated {
            debug!(name = %header.name, volume = %header.data.volume, "rar data runs past the end of the volume");
            header.data.length = available;
        }

        if let Some(last) = self.entries.last_mut() {
            if last.continues {
                if header.split_before && last.name == header.name {
                    last.packed_size += header.data.length;
                    last.extents.push(header.data);
                    last.continues = header.split_after;
                    last.encrypted |= header.encrypted;
                    last.stored &= header.stored;
                    last.broken |= truncated;
                    return;
                }
                // the volume holding the rest of `last` is not in the set
                last.continues = false;
                last.broken = true;
            }
        }
        self.entries.push(Entry {
            name: header.name,
            size: header.unpacked_size,
            packed_size: header.data.length,
            stored: header.stored,
            encrypted: header.encrypted,
            solid: header.solid,
            directory: header.directory,
            extents: vec![header.data],
            continues: header.split_after,
            // a continuation without its first piece
            broken: header.split_before || truncated,
        });
    }

    /// Marks entries still waiting for a continuation after the last volume.
    fn finish(&mut self) {
        for entry in &mut self.entries {
            if entry.continues {
                entry.continues = false;
                entry.broken = true;
            }
        }
    }
}

pub struct RarArchive {
    fs: Arc<dyn FileSystem>,
    volumes: Vec<String>,
    files: Vec<ArchiveFile>,
    streamable: bool,
}

impl RarArchive {
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
impl Archive for RarArchive {
    async fn open(&mut self, password: Option<&str>) -> anyhow::Result<()> {
        if self.volumes.is_empty() {
            return Err(ArchiveError::NoVolumes.into());
        }
        let mut entries = Entries::default();
        for (idx, volume) in self.volumes.iter().enumerate() {
            let size = self.fs.stat(volume).await?.size;
            let mut file = self.fs.open(volume).await?;
            let signature = read_range(&mut file, 0, MAGIC_RAR5.len()).await?;
            if signature.starts_with(MAGIC_RAR5) {
                parse_rar5_volume(&mut file, volume, size, &mut entries).await?;
            } else if signature.starts_with(MAGIC_RAR4) {
                parse_rar4_volume(&mut file, volume, size, &mut entries).await?;
            } else if idx == 0 {
                return Err(ArchiveError::BadSignature(FileType::Rar).into());
            } else {
                return Err(ArchiveError::malformed(format!("{volume}: missing RAR signature")).into());
            }
        }

        entries.finish();
        for entry in entries.entries.iter().filter(|e| !e.complete()) {
            warn!(
                name = %entry.name,
                size = entry.size,
                packed_size = entry.packed_size,
                "rar entry is incomplete, a volume is missing or truncated"
            );
        }

        let encrypted = entries.entries.iter().any(|e| e.encrypted);
        if encrypted && password.is_some() {
            debug!("rar entries are encrypted, password cannot be used for streaming");
        }
        let solid = entries.solid;
        self.streamable = !solid && entries.entries.iter().all(Entry::streamable);
        self.files = entries
            .entries
            .into_iter()
            .filter(|e| !e.directory)
            .map(|e| {
                let streamable = !solid && e.streamable();
                ArchiveFile::new(e.name, e.size, e.packed_size, streamable, e.extents, self.fs.clone())
            })
            .collect();
        debug!(volumes = self.volumes.len(), files = self.files.len(), streamable = self.streamable, "opened rar archive");
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

async fn parse_rar4_volume(
    file: &mut Box<dyn SeekableFile>,
    volume: &str,
    volume_size: u64,
    entries: &mut Entries,
) -> Result<(), ArchiveError> {
    let mut pos = MAGIC_RAR4.len() as u64;
    while pos + 7 <= volume_size {
        let base = read_range(file, pos, 7).await?;
        let mut r = ByteReader::new(&base);
        let crc = r.u16()?;
        let head_type = r.u8()?;
        let flags = r.u16()?;
        let head_size = u64::from(r.u16()?);
        if head_size < 7 {
            return Err(ArchiveError::malformed(format!("{volume}: header size {head_size} at {pos}")));
        }

        let header = read_range(file, pos, head_size as usize).await?;
        if header.len() as u64 != head_size {
            return Err(ArchiveError::malformed(format!("{volume}: truncated header at {pos}")));
        }
        if (crc32fast::hash(&header[2..]) & 0xffff) as u16 != crc {
            return Err(ArchiveError::malformed(format!("{volume}: header checksum mismatch at {pos}")));
        }

        let mut r = ByteReader::new(&header[7..]);
        let mut data_size = 0;
        match head_type {
            RAR4_MAIN => {
                if flags & RAR4_MAIN_PASSWORD != 0 {
                    return Err(ArchiveError::HeadersEncrypted);
                }
                entries.solid |= flags & RAR4_MAIN_SOLID != 0;
            }
            RAR4_FILE => {
                let header = parse_rar4_file(&mut r, flags, volume, pos + head_size)?;
                let split_after = header.split_after;
                data_size = header.data.length;
                entries.add(header, volume_size);
                if split_after {
                    // only the end-of-archive block follows
                    break;
                }
            }
            RAR4_END => break,
            _ => {
                if flags & RAR4_LONG_BLOCK != 0 {
                    data_size = u64::from(r.u32()?);
                }
            }
        }
        pos += head_size + data_size;
    }
    Ok(())
}

fn parse_rar4_file(
    r: &mut ByteReader<'_>,
    flags: u16,
    volume: &str,
    data_offset: u64,
) -> Result<FileHeader, ArchiveError> {
    let pack_low = r.u32()?;
    let unpacked_low = r.u32()?;
    let _host_os = r.u8()?;
    let _file_crc = r.u32()?;
    let _mtime = r.u32()?;
    let _version = r.u8()?;
    let method = r.u8()?;
    let name_size = r.u16()? as usize;
    let _attributes = r.u32()?;
    let (pack_high, unpacked_high) = if flags & RAR4_LARGE != 0 {
        (r.u32()?, r.u32()?)
    } else {
        (0, 0)
    };
    let mut name = r.bytes(name_size)?;
    if flags & RAR4_UNICODE != 0 {
        if let Some(nul) = name.iter().position(|&b| b == 0) {
            name = &name[..nul];
        }
    }

    let packed = u64::from(pack_high) << 32 | u64::from(pack_low);
    let unpacked = u64::from(unpacked_high) << 32 | u64::from(unpacked_low);
    Ok(FileHeader {
        name: String::from_utf8_lossy(name).replace('\\', "/"),
        unpacked_size: unpacked,
        stored: method == RAR4_METHOD_STORE,
        encrypted: flags & RAR4_ENCRYPTED != 0,
        solid: flags & RAR4_SOLID != 0,
        directory: flags & RAR4_DIRECTORY == RAR4_DIRECTORY,
        split_before: flags & RAR4_SPLIT_BEFORE != 0,
        split_after: flags & RAR4_SPLIT_AFTER != 0,
        data: Extent::new(volume, data_offset, packed),
    })
}

async fn parse_rar5_volume(
    file: &mut Box<dyn SeekableFile>,
    volume: &str,
    volume_size: u64,
    entries: &mut Entries,
) -> Result<(), ArchiveError> {
    let mut pos = MAGIC_RAR5.len() as u64;
    while pos + 5 <= volume_size {
        let head = read_range(file, pos, 7).await?;
        let mut r = ByteReader::new(&head);
        let crc = r.u32()?;
        let header_size = r.vint()?;
        let size_len = r.position() - 4;
        if header_size == 0 || header_size > MAX_HEADER_SIZE {
            return Err(ArchiveError::malformed(format!("{volume}: header size {header_size} at {pos}")));
        }

        let total = 4 + size_len as u64 + header_size;
        let block = read_range(file, pos, total as usize).await?;
        if block.len() as u64 != total {
            return Err(ArchiveError::malformed(format!("{volume}: truncated header at {pos}")));
        }
        if crc32fast::hash(&block[4..]) != crc {
            return Err(ArchiveError::malformed(format!("{volume}: header checksum mismatch at {pos}")));
        }

        let body = &block[4 + size_len..];
        let mut r = ByteReader::new(body);
        let header_type = r.vint()?;
        let flags = r.vint()?;
        let extra_size = if flags & RAR5_HAS_EXTRA != 0 { r.vint()? } else { 0 };
        let data_size = if flags & RAR5_HAS_DATA != 0 { r.vint()? } else { 0 };
        if extra_size > body.len() as u64 {
            return Err(ArchiveError::malformed(format!("{volume}: extra area overflows header at {pos}")));
        }
        let extra = &body[body.len() - extra_size as usize..];

        match header_type {
            RAR5_MAIN => {
                let archive_flags = r.vint()?;
                entries.solid |= archive_flags & RAR5_MAIN_SOLID != 0;
            }
            RAR5_FILE => {
                let data = Extent::new(volume, pos + total, data_size);
                let header = parse_rar5_file(&mut r, flags, extra, data)?;
                let split_after = header.split_after;
                entries.add(header, volume_size);
                if split_after {
                    break;
                }
            }
            RAR5_ENCRYPTION => return Err(ArchiveError::HeadersEncrypted),
            RAR5_END => break,
            _ => {}
        }
        pos += total + data_size;
    }
    Ok(())
}

fn parse_rar5_file(
    r: &mut ByteReader<'_>,
    flags: u64,
    extra: &[u8],
    data: Extent,
) -> Result<FileHeader, ArchiveError> {
    let file_flags = r.vint()?;
    let unpacked_size = r.vint()?;
    let _attributes = r.vint()?;
    if file_flags & RAR5_FILE_MTIME != 0 {
        r.u32()?;
    }
    if file_flags & RAR5_FILE_CRC != 0 {
        r.u32()?;
    }
    let compression = r.vint()?;
    let _host_os = r.vint()?;
    let name_len = r.vint()? as usize;
    let name = String::from_utf8_lossy(r.bytes(name_len)?).into_owned();

    let mut encrypted = false;
    let mut records = ByteReader::new(extra);
    while records.remaining() > 0 {
        let size = records.vint()? as usize;
        let start = records.position();
        let record_type = records.vint()?;
        if record_type == RAR5_EXTRA_ENCRYPTION {
            encrypted = true;
        }
        let consumed = records.position() - start;
        records.skip(size.saturating_sub(consumed))?;
    }

    Ok(FileHeader {
        name,
        unpacked_size,
        stored: (compression >> 7) & 0x7 == 0,
        encrypted,
        solid: compression & 0x40 != 0,
        directory: file_flags & RAR5_FILE_DIRECTORY != 0,
        split_before: flags & RAR5_SPLIT_BEFORE != 0,
        split_after: flags & RAR5_SPLIT_AFTER != 0,
        data,
    })
}
