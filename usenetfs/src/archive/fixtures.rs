//! Writers for small RAR and 7z archives used by the archive, inspector and
//! stream tests. Entry data is always written as-is; "compressed" and
//! "encrypted" entries only carry the header markers.

use super::{MAGIC_7Z, MAGIC_RAR4, MAGIC_RAR5};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Method {
    Store,
    Compressed,
    Encrypted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeaderCoding {
    Plain,
    Lzma2,
    Aes,
}

fn chunks(data: &[u8], count: usize) -> Vec<&[u8]> {
    let size = data.len().div_ceil(count.max(1)).max(1);
    let mut out: Vec<&[u8]> = data.chunks(size).collect();
    out.resize(count.max(1), &data[..0]);
    out
}

fn rar_volume_name(base: &str, idx: usize, count: usize) -> String {
    if count == 1 {
        format!("{base}.rar")
    } else {
        format!("{base}.part{:02}.rar", idx + 1)
    }
}

// RAR 4

fn rar4_block(head_type: u8, flags: u16, body: &[u8]) -> Vec<u8> {
    let mut block = vec![0, 0, head_type];
    block.extend_from_slice(&flags.to_le_bytes());
    block.extend_from_slice(&(7 + body.len() as u16).to_le_bytes());
    block.extend_from_slice(body);
    let crc = (crc32fast::hash(&block[2..]) & 0xffff) as u16;
    block[..2].copy_from_slice(&crc.to_le_bytes());
    block
}

fn rar4_file_block(name: &str, packed: u64, unpacked: u64, method: u8, flags: u16) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&(packed as u32).to_le_bytes());
    body.extend_from_slice(&(unpacked as u32).to_le_bytes());
    body.push(2); // host os
    body.extend_from_slice(&0u32.to_le_bytes()); // crc
    body.extend_from_slice(&0x5a21_0000u32.to_le_bytes()); // dos time
    body.push(29);
    body.push(method);
    body.extend_from_slice(&(name.len() as u16).to_le_bytes());
    body.extend_from_slice(&0x20u32.to_le_bytes());
    body.extend_from_slice(name.as_bytes());
    rar4_block(0x74, flags | 0x8000, &body)
}

fn rar4_volume_start() -> Vec<u8> {
    let mut out = MAGIC_RAR4.to_vec();
    out.extend(rar4_block(0x73, 0, &[0; 6]));
    out
}

/// One entry spread over `volumes` RAR 4 volumes named `{base}.partNN.rar`.
pub(crate) fn rar4_split(
    base: &str,
    entry: &str,
    data: &[u8],
    volumes: usize,
    method: Method,
) -> Vec<(String, Vec<u8>)> {
    let parts = chunks(data, volumes);
    let count = parts.len();
    parts
        .into_iter()
        .enumerate()
        .map(|(idx, part)| {
            let mut flags = 0u16;
            if idx > 0 {
                flags |= 0x01;
            }
            if idx + 1 < count {
                flags |= 0x02;
            }
            if method == Method::Encrypted {
                flags |= 0x04;
            }
            let method = if method == Method::Compressed { 0x33 } else { 0x30 };
            let mut volume = rar4_volume_start();
            volume.extend(rar4_file_block(entry, part.len() as u64, data.len() as u64, method, flags));
            volume.extend_from_slice(part);
            volume.extend(rar4_block(0x7b, 0x4000, &[]));
            (rar_volume_name(base, idx, count), volume)
        })
        .collect()
}

/// Single RAR 4 volume with several stored entries.
pub(crate) fn rar4_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut volume = rar4_volume_start();
    for (name, data) in entries {
        volume.extend(rar4_file_block(name, data.len() as u64, data.len() as u64, 0x30, 0));
        volume.extend_from_slice(data);
    }
    volume.extend(rar4_block(0x7b, 0x4000, &[]));
    volume
}

pub(crate) fn rar4_encrypted_headers() -> Vec<u8> {
    let mut out = MAGIC_RAR4.to_vec();
    out.extend(rar4_block(0x73, 0x0080, &[0; 6]));
    out.extend_from_slice(&[0x5c; 64]);
    out
}

// RAR 5

fn vint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn rar5_block(header_type: u64, flags: u64, fields: &[u8], extra: &[u8], data_size: Option<u64>) -> Vec<u8> {
    let mut body = Vec::new();
    vint(&mut body, header_type);
    let mut flags = flags;
    if !extra.is_empty() {
        flags |= 0x01;
    }
    if data_size.is_some() {
        flags |= 0x02;
    }
    vint(&mut body, flags);
    if !extra.is_empty() {
        vint(&mut body, extra.len() as u64);
    }
    if let Some(size) = data_size {
        vint(&mut body, size);
    }
    body.extend_from_slice(fields);
    body.extend_from_slice(extra);

    let mut sized = Vec::new();
    vint(&mut sized, body.len() as u64);
    sized.extend(body);
    let mut block = crc32fast::hash(&sized).to_le_bytes().to_vec();
    block.extend(sized);
    block
}

/// One entry spread over `volumes` RAR 5 volumes.
pub(crate) fn rar5_split(
    base: &str,
    entry: &str,
    data: &[u8],
    volumes: usize,
    method: Method,
) -> Vec<(String, Vec<u8>)> {
    let parts = chunks(data, volumes);
    let count = parts.len();
    parts
        .into_iter()
        .enumerate()
        .map(|(idx, part)| {
            let mut volume = MAGIC_RAR5.to_vec();
            let mut main = Vec::new();
            vint(&mut main, if count > 1 { 0x01 } else { 0 });
            volume.extend(rar5_block(1, 0, &main, &[], None));

            let mut fields = Vec::new();
            vint(&mut fields, 0); // file flags
            vint(&mut fields, data.len() as u64);
            vint(&mut fields, 0x20);
            let compression = if method == Method::Compressed { 3 << 7 } else { 0 };
            vint(&mut fields, compression);
            vint(&mut fields, 0); // host os
            vint(&mut fields, entry.len() as u64);
            fields.extend_from_slice(entry.as_bytes());

            let mut extra = Vec::new();
            if method == Method::Encrypted {
                let mut record = Vec::new();
                vint(&mut record, 0x01);
                record.extend_from_slice(&[0; 36]);
                vint(&mut extra, record.len() as u64);
                extra.extend(record);
            }

            let mut flags = 0;
            if idx > 0 {
                flags |= 0x08;
            }
            if idx + 1 < count {
                flags |= 0x10;
            }
            volume.extend(rar5_block(2, flags, &fields, &extra, Some(part.len() as u64)));
            volume.extend_from_slice(part);

            let mut end = Vec::new();
            vint(&mut end, if idx + 1 < count { 0x01 } else { 0 });
            volume.extend(rar5_block(5, 0, &end, &[], None));
            (rar_volume_name(base, idx, count), volume)
        })
        .collect()
}

// 7z

fn number(out: &mut Vec<u8>, value: u64) {
    if value < 0x80 {
        out.push(value as u8);
        return;
    }
    let mut extra = 1;
    while extra < 8 && value >= 1u64 << (7 * (extra + 1)) {
        extra += 1;
    }
    let prefix = (0xff00u16 >> extra) as u8;
    let high = if extra < 8 { (value >> (8 * extra)) as u8 } else { 0 };
    out.push(prefix | high);
    out.extend_from_slice(&value.to_le_bytes()[..extra]);
}

fn folder(out: &mut Vec<u8>, coder: &[u8], props: &[u8]) {
    number(out, 1);
    let mut flags = coder.len() as u8;
    if !props.is_empty() {
        flags |= 0x20;
    }
    out.push(flags);
    out.extend_from_slice(coder);
    if !props.is_empty() {
        number(out, props.len() as u64);
        out.extend_from_slice(props);
    }
}

fn bit_vector(bits: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; bits.len().div_ceil(8)];
    for (i, &bit) in bits.iter().enumerate() {
        if bit {
            out[i / 8] |= 0x80 >> (i % 8);
        }
    }
    out
}

fn sevenz_header(files: &[(&str, &[u8])], coder: &[u8], props: &[u8]) -> Vec<u8> {
    let streams: Vec<&[u8]> = files
        .iter()
        .filter(|(name, data)| !data.is_empty() && !name.ends_with('/'))
        .map(|(_, data)| *data)
        .collect();
    let total: usize = streams.iter().map(|s| s.len()).sum();

    let mut h = vec![0x01];
    if !streams.is_empty() {
        h.push(0x04);
        h.push(0x06);
        number(&mut h, 0);
        number(&mut h, 1);
        h.push(0x09);
        number(&mut h, total as u64);
        h.push(0x00);

        h.push(0x07);
        h.push(0x0b);
        number(&mut h, 1);
        h.push(0x00);
        folder(&mut h, coder, props);
        h.push(0x0c);
        number(&mut h, total as u64);
        h.push(0x00);

        h.push(0x08);
        h.push(0x0d);
        number(&mut h, streams.len() as u64);
        if streams.len() > 1 {
            h.push(0x09);
            for stream in &streams[..streams.len() - 1] {
                number(&mut h, stream.len() as u64);
            }
        }
        h.push(0x0a);
        h.push(1);
        for stream in &streams {
            h.extend_from_slice(&crc32fast::hash(stream).to_le_bytes());
        }
        h.push(0x00);
        h.push(0x00);
    }

    h.push(0x05);
    number(&mut h, files.len() as u64);
    let empty: Vec<bool> = files
        .iter()
        .map(|(name, data)| data.is_empty() || name.ends_with('/'))
        .collect();
    if empty.iter().any(|&e| e) {
        let bits = bit_vector(&empty);
        h.push(0x0e);
        number(&mut h, bits.len() as u64);
        h.extend(bits);
        let empty_files: Vec<bool> = files
            .iter()
            .filter(|(name, data)| data.is_empty() || name.ends_with('/'))
            .map(|(name, _)| !name.ends_with('/'))
            .collect();
        let bits = bit_vector(&empty_files);
        h.push(0x0f);
        number(&mut h, bits.len() as u64);
        h.extend(bits);
    }
    let mut names = vec![0u8];
    for (name, _) in files {
        names.extend(name.trim_end_matches('/').encode_utf16().flat_map(u16::to_le_bytes));
        names.extend_from_slice(&[0, 0]);
    }
    h.push(0x11);
    number(&mut h, names.len() as u64);
    h.extend(names);
    h.push(0x00);
    h.push(0x00);
    h
}

fn encoded_header(pack_pos: u64, packed_size: u64, coder: &[u8], props: &[u8], header: &[u8]) -> Vec<u8> {
    let mut h = vec![0x17, 0x06];
    number(&mut h, pack_pos);
    number(&mut h, 1);
    h.push(0x09);
    number(&mut h, packed_size);
    h.push(0x00);
    h.push(0x07);
    h.push(0x0b);
    number(&mut h, 1);
    h.push(0x00);
    folder(&mut h, coder, props);
    h.push(0x0c);
    number(&mut h, header.len() as u64);
    h.push(0x0a);
    h.push(1);
    h.extend_from_slice(&crc32fast::hash(header).to_le_bytes());
    h.push(0x00);
    h.push(0x00);
    h
}

/// 7z archive with every stream in one folder using `coder`. Names ending in
/// `/` become directories.
pub(crate) fn sevenz_archive(
    files: &[(&str, &[u8])],
    coder: &[u8],
    props: &[u8],
    coding: HeaderCoding,
) -> Vec<u8> {
    let packed: Vec<u8> = files
        .iter()
        .filter(|(name, _)| !name.ends_with('/'))
        .flat_map(|(_, data)| data.iter().copied())
        .collect();
    let header = sevenz_header(files, coder, props);
    let (header_data, next_header) = match coding {
        HeaderCoding::Plain => (Vec::new(), header),
        HeaderCoding::Lzma2 => {
            let mut compressed = Vec::new();
            lzma_rs::lzma2_compress(&mut header.as_slice(), &mut compressed).unwrap();
            let next = encoded_header(packed.len() as u64, compressed.len() as u64, &[0x21], &[0x18], &header);
            (compressed, next)
        }
        HeaderCoding::Aes => {
            let garbage = vec![0xa5; 48];
            let next = encoded_header(
                packed.len() as u64,
                garbage.len() as u64,
                &[0x06, 0xf1, 0x07, 0x01],
                &[0xd3, 0x00],
                &header,
            );
            (garbage, next)
        }
    };

    sevenz_assemble(packed, header_data, next_header)
}

/// Stored archive whose header declares `declared` bytes for `name` while
/// only `data` is packed.
pub(crate) fn sevenz_short_pack(name: &str, data: &[u8], declared: usize) -> Vec<u8> {
    let claimed = vec![0u8; declared];
    let header = sevenz_header(&[(name, &claimed[..])], &[0x00], &[]);
    sevenz_assemble(data.to_vec(), Vec::new(), header)
}

fn sevenz_assemble(packed: Vec<u8>, header_data: Vec<u8>, next_header: Vec<u8>) -> Vec<u8> {
    let mut tail = Vec::new();
    tail.extend_from_slice(&((packed.len() + header_data.len()) as u64).to_le_bytes());
    tail.extend_from_slice(&(next_header.len() as u64).to_le_bytes());
    tail.extend_from_slice(&crc32fast::hash(&next_header).to_le_bytes());

    let mut out = MAGIC_7Z.to_vec();
    out.extend_from_slice(&[0, 4]);
    out.extend_from_slice(&crc32fast::hash(&tail).to_le_bytes());
    out.extend(tail);
    out.extend(packed);
    out.extend(header_data);
    out.extend(next_header);
    out
}

pub(crate) fn sevenz_stored(files: &[(&str, &[u8])], coding: HeaderCoding) -> Vec<u8> {
    sevenz_archive(files, &[0x00], &[], coding)
}

/// Byte splits named `{base}.7z.001`, `{base}.7z.002`, ...
pub(crate) fn sevenz_volumes(base: &str, archive: &[u8], count: usize) -> Vec<(String, Vec<u8>)> {
    chunks(archive, count)
        .into_iter()
        .enumerate()
        .map(|(idx, part)| (format!("{base}.7z.{:03}", idx + 1), part.to_vec()))
        .collect()
}
