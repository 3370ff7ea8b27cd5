//! Reports what an NZB contains and which parts of it can be streamed.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::archive::{
    group_volumes, is_archive_file, is_video_file, Archive, ArchiveFile, ArchiveHandle, VolumeGroup,
};
use crate::fs::{ArchiveFs, FileSystem, UsenetFs};
use crate::manager::SegmentFetcher;
use crate::nzb::Nzb;
use crate::stream::StreamConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Video,
    Archive,
    Other,
}

impl ContentKind {
    pub fn classify(name: &str) -> Self {
        if is_video_file(name) {
            ContentKind::Video
        } else if is_archive_file(name) {
            ContentKind::Archive
        } else {
            ContentKind::Other
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NzbContentFile {
    #[serde(rename = "t")]
    pub kind: ContentKind,
    #[serde(rename = "n")]
    pub name: String,
    #[serde(rename = "s")]
    pub size: u64,
    #[serde(rename = "strm")]
    pub streamable: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<NzbContentFile>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<NzbContentFile>,
}

impl NzbContentFile {
    fn new(kind: ContentKind, name: impl Into<String>, size: u64, streamable: bool) -> Self {
        Self {
            kind,
            name: name.into(),
            size,
            streamable,
            files: Vec::new(),
            parts: Vec::new(),
        }
    }

    fn from_archive_file(file: &ArchiveFile) -> Self {
        Self::new(ContentKind::classify(&file.name), &file.name, file.size, file.streamable)
    }

    /// Archive entry for a volume set, not yet marked streamable.
    fn for_group(group: &VolumeGroup) -> Self {
        let name = group.first_volume().unwrap_or(&group.base_name);
        let mut entry = Self::new(ContentKind::Archive, name, group.total_size, false);
        entry.parts = group
            .volumes
            .iter()
            .map(|v| Self::new(ContentKind::classify(&v.name), &v.name, v.size, true))
            .collect();
        entry
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NzbContent {
    pub files: Vec<NzbContentFile>,
    pub streamable: bool,
}

fn all_streamable(files: &[NzbContentFile]) -> bool {
    files
        .iter()
        .all(|f| f.streamable && all_streamable(&f.files))
}

/// Lists the files of `nzb`, opening every archive volume set to see what
/// is inside. Archives that fail to open are reported as non-streamable.
pub async fn inspect_nzb_content(
    nzb: &Nzb,
    fetcher: Arc<dyn SegmentFetcher>,
    config: &StreamConfig,
) -> NzbContent {
    let mut content = NzbContent {
        files: Vec::new(),
        streamable: true,
    };

    let mut archive_files = Vec::new();
    for file in &nzb.files {
        let name = file.name();
        match ContentKind::classify(name) {
            ContentKind::Archive => archive_files.push((name, file.total_size())),
            kind => content
                .files
                .push(NzbContentFile::new(kind, name, file.total_size(), true)),
        }
    }

    let groups = group_volumes(archive_files);
    if !groups.is_empty() {
        let fs: Arc<dyn FileSystem> =
            Arc::new(UsenetFs::new(nzb, fetcher, config.segment_buffer_size));
        for group in &groups {
            let entry = inspect_group(fs.clone(), group, config.password.as_deref()).await;
            content.files.push(entry);
        }
    }

    content.streamable = all_streamable(&content.files);
    debug!(files = content.files.len(), streamable = content.streamable, "inspected nzb");
    content
}

async fn inspect_group(
    fs: Arc<dyn FileSystem>,
    group: &VolumeGroup,
    password: Option<&str>,
) -> NzbContentFile {
    let mut entry = NzbContentFile::for_group(group);
    let mut archive = ArchiveHandle::for_group(fs, group);
    if let Err(err) = archive.open(password).await {
        warn!(name = %entry.name, error = %err, "failed to open archive");
        return entry;
    }
    entry.streamable = archive.is_streamable();
    if entry.streamable {
        entry.files = inspect_archive_files(archive.files(), password).await;
    }
    archive.close().await;
    entry
}

/// Lists archive entries, opening volume sets stored inside them one level
/// deep. Archives found at that level are not opened.
async fn inspect_archive_files(files: &[ArchiveFile], password: Option<&str>) -> Vec<NzbContentFile> {
    let groups = group_volumes(files.iter().map(|f| (f.base_name(), f.size)));
    if groups.is_empty() {
        return files.iter().map(NzbContentFile::from_archive_file).collect();
    }

    let part_names: HashSet<&str> = groups
        .iter()
        .flat_map(|g| g.volumes.iter().map(|v| v.name.as_str()))
        .collect();
    let mut result: Vec<NzbContentFile> = files
        .iter()
        .filter(|f| !part_names.contains(f.base_name()))
        .map(NzbContentFile::from_archive_file)
        .collect();

    for group in &groups {
        let mut entry = NzbContentFile::for_group(group);
        let parts: Vec<ArchiveFile> = group
            .volumes
            .iter()
            .filter_map(|v| files.iter().find(|f| f.base_name() == v.name).cloned())
            .collect();
        if parts.len() != group.volumes.len() || parts.iter().any(|p| !p.streamable) {
            result.push(entry);
            continue;
        }

        let fs: Arc<dyn FileSystem> = Arc::new(ArchiveFs::new(parts));
        let mut inner = ArchiveHandle::for_group(fs, group);
        if let Err(err) = inner.open(password).await {
            warn!(name = %entry.name, error = %err, "failed to open nested archive");
            result.push(entry);
            continue;
        }
        entry.streamable = inner.is_streamable();
        if entry.streamable {
            entry.files = inner
                .files()
                .iter()
                .map(|f| {
                    let mut file = NzbContentFile::from_archive_file(f);
                    // a third level is never opened
                    if file.kind == ContentKind::Archive {
                        file.streamable = false;
                    }
                    file
                })
                .collect();
        }
        inner.close().await;
        result.push(entry);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::fixtures::{self, HeaderCoding, Method};
    use crate::testutil::{test_bytes, MemoryFetcher};

    async fn inspect(files: &[(String, Vec<u8>)]) -> NzbContent {
        let fetcher = Arc::new(MemoryFetcher::new());
        let files: Vec<(&str, &[u8])> = files
            .iter()
            .map(|(name, data)| (name.as_str(), data.as_slice()))
            .collect();
        let nzb = fetcher.nzb(&files, 256);
        inspect_nzb_content(&nzb, fetcher, &StreamConfig::default()).await
    }

    #[tokio::test]
    async fn test_plain_video() {
        let content = inspect(&[("movie.mkv".to_string(), test_bytes(1000))]).await;
        assert!(content.streamable);
        assert_eq!(content.files.len(), 1);
        let file = &content.files[0];
        assert_eq!(file.kind, ContentKind::Video);
        assert_eq!(file.name, "movie.mkv");
        assert!(file.streamable);
        assert!(file.parts.is_empty() && file.files.is_empty());
    }

    #[tokio::test]
    async fn test_stored_rar_volume_set() {
        let volumes = fixtures::rar4_split("movie", "movie.mkv", &test_bytes(3000), 3, Method::Store);
        let content = inspect(&volumes).await;

        assert!(content.streamable);
        assert_eq!(content.files.len(), 1);
        let entry = &content.files[0];
        assert_eq!(entry.kind, ContentKind::Archive);
        assert_eq!(entry.name, "movie.part01.rar");
        assert!(entry.streamable);
        assert_eq!(entry.parts.len(), 3);
        assert_eq!(entry.size, entry.parts.iter().map(|p| p.size).sum::<u64>());
        assert_eq!(entry.files.len(), 1);
        assert_eq!(entry.files[0].kind, ContentKind::Video);
        assert_eq!(entry.files[0].name, "movie.mkv");
        assert_eq!(entry.files[0].size, 3000);
        assert!(entry.files[0].streamable);
    }

    #[tokio::test]
    async fn test_unstreamable_archives() {
        let mut files = fixtures::rar4_split("movie", "movie.mkv", &test_bytes(900), 2, Method::Compressed);
        files.extend(fixtures::rar5_split("locked", "locked.mkv", &test_bytes(300), 1, Method::Encrypted));
        files.push(("broken.7z".to_string(), test_bytes(120)));
        files.push(("movie.nfo".to_string(), test_bytes(20)));
        let content = inspect(&files).await;

        assert!(!content.streamable);
        assert_eq!(content.files[0].kind, ContentKind::Other);
        let archives: Vec<&NzbContentFile> = content.files[1..].iter().collect();
        assert_eq!(archives.len(), 3);
        for entry in archives {
            assert_eq!(entry.kind, ContentKind::Archive);
            assert!(!entry.streamable, "{}", entry.name);
            assert!(entry.files.is_empty());
        }
    }

    #[tokio::test]
    async fn test_nested_archive() {
        let inner = fixtures::rar4_split("inner", "movie.mkv", &test_bytes(2000), 2, Method::Store);
        let mut entries: Vec<(&str, &[u8])> = inner
            .iter()
            .map(|(name, data)| (name.as_str(), data.as_slice()))
            .collect();
        let sample = test_bytes(50);
        entries.push(("sample.txt", &sample[..]));
        let outer = fixtures::sevenz_stored(&entries, HeaderCoding::Plain);
        let content = inspect(&[("outer.7z".to_string(), outer)]).await;

        assert!(content.streamable);
        let outer = &content.files[0];
        assert_eq!(outer.name, "outer.7z");
        assert_eq!(outer.files.len(), 2);
        assert_eq!(outer.files[0].name, "sample.txt");
        assert_eq!(outer.files[0].kind, ContentKind::Other);

        let nested = &outer.files[1];
        assert_eq!(nested.kind, ContentKind::Archive);
        assert_eq!(nested.name, "inner.part01.rar");
        assert_eq!(nested.parts.len(), 2);
        assert!(nested.streamable);
        assert_eq!(nested.files.len(), 1);
        assert_eq!(nested.files[0].name, "movie.mkv");
        assert_eq!(nested.files[0].size, 2000);
    }

    #[test]
    fn test_json_keys() {
        let mut entry = NzbContentFile::new(ContentKind::Archive, "a.rar", 10, true);
        entry.parts.push(NzbContentFile::new(ContentKind::Archive, "a.rar", 10, true));
        let content = NzbContent {
            files: vec![entry, NzbContentFile::new(ContentKind::Video, "b.mkv", 5, true)],
            streamable: true,
        };
        let json = serde_json::to_value(&content).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "files": [
                    {"t": "archive", "n": "a.rar", "s": 10, "strm": true,
                     "parts": [{"t": "archive", "n": "a.rar", "s": 10, "strm": true}]},
                    {"t": "video", "n": "b.mkv", "s": 5, "strm": true}
                ],
                "streamable": true
            })
        );
    }
}
